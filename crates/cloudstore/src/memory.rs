//! In-memory [`ObjectStore`] backend.
//!
//! Used by tests and for local staging. Supports per-part failure
//! injection so resume, retry, and abort paths can be exercised
//! deterministically.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use sha2::{Digest, Sha256};

use crate::store::{ObjectStore, PartInfo, StoreError, StoreFuture};

/// Kind of injected failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailKind {
    /// Retryable: surfaces as [`StoreError::Timeout`].
    Transient,
    /// Not retryable: surfaces as a 403 [`StoreError::Status`].
    Fatal,
}

#[derive(Debug)]
struct Fault {
    kind: FailKind,
    remaining: u32,
}

#[derive(Debug)]
struct Upload {
    name: String,
    #[allow(dead_code)]
    mime: String,
    parts: BTreeMap<u32, (String, Vec<u8>)>,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    uploads: HashMap<String, Upload>,
    objects: HashMap<String, Vec<u8>>,
    part_faults: HashMap<u32, Fault>,
    upload_log: Vec<u32>,
}

/// In-memory multipart store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

fn tag_for(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `times` uploads of part `index` fail.
    pub fn fail_part(&self, index: u32, times: u32, kind: FailKind) {
        self.inner
            .lock()
            .unwrap()
            .part_faults
            .insert(index, Fault { kind, remaining: times });
    }

    /// Returns the finalized object, if any.
    pub fn object(&self, name: &str) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().objects.get(name).cloned()
    }

    /// Whether an unfinalized multipart upload exists for `name`.
    pub fn has_upload(&self, name: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .uploads
            .values()
            .any(|u| u.name == name)
    }

    /// Drains the log of attempted part uploads (successful or not),
    /// in call order.
    pub fn take_upload_log(&self) -> Vec<u32> {
        std::mem::take(&mut self.inner.lock().unwrap().upload_log)
    }
}

impl ObjectStore for MemoryStore {
    fn initiate<'a>(&'a self, name: &'a str, mime: &'a str) -> StoreFuture<'a, String> {
        Box::pin(async move {
            let mut inner = self.inner.lock().unwrap();
            inner.next_id += 1;
            let upload_id = format!("mem-upload-{}", inner.next_id);
            inner.uploads.insert(
                upload_id.clone(),
                Upload {
                    name: name.to_string(),
                    mime: mime.to_string(),
                    parts: BTreeMap::new(),
                },
            );
            Ok(upload_id)
        })
    }

    fn find_upload<'a>(&'a self, name: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            let inner = self.inner.lock().unwrap();
            Ok(inner
                .uploads
                .iter()
                .find(|(_, u)| u.name == name)
                .map(|(id, _)| id.clone()))
        })
    }

    fn list_parts<'a>(
        &'a self,
        _name: &'a str,
        upload_id: &'a str,
    ) -> StoreFuture<'a, Vec<PartInfo>> {
        Box::pin(async move {
            let inner = self.inner.lock().unwrap();
            let upload = inner
                .uploads
                .get(upload_id)
                .ok_or_else(|| StoreError::UnknownUpload(upload_id.to_string()))?;
            Ok(upload
                .parts
                .iter()
                .map(|(&index, (tag, _))| PartInfo {
                    index,
                    tag: tag.clone(),
                })
                .collect())
        })
    }

    fn upload_part<'a>(
        &'a self,
        _name: &'a str,
        upload_id: &'a str,
        index: u32,
        bytes: Vec<u8>,
    ) -> StoreFuture<'a, String> {
        Box::pin(async move {
            let mut inner = self.inner.lock().unwrap();
            inner.upload_log.push(index);

            if let Some(fault) = inner.part_faults.get_mut(&index)
                && fault.remaining > 0
            {
                fault.remaining -= 1;
                return Err(match fault.kind {
                    FailKind::Transient => StoreError::Timeout,
                    FailKind::Fatal => StoreError::Status {
                        status: 403,
                        code: "AccessDenied".into(),
                    },
                });
            }

            let upload = inner
                .uploads
                .get_mut(upload_id)
                .ok_or_else(|| StoreError::UnknownUpload(upload_id.to_string()))?;
            let tag = tag_for(&bytes);
            upload.parts.insert(index, (tag.clone(), bytes));
            Ok(tag)
        })
    }

    fn finalize<'a>(
        &'a self,
        name: &'a str,
        upload_id: &'a str,
        parts: &'a [PartInfo],
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut inner = self.inner.lock().unwrap();
            let upload = inner
                .uploads
                .remove(upload_id)
                .ok_or_else(|| StoreError::UnknownUpload(upload_id.to_string()))?;

            if !parts.windows(2).all(|w| w[0].index < w[1].index) {
                return Err(StoreError::FinalizeRejected(
                    "parts not sorted by index".into(),
                ));
            }
            if parts.len() != upload.parts.len() {
                return Err(StoreError::FinalizeRejected(format!(
                    "expected {} parts, got {}",
                    upload.parts.len(),
                    parts.len()
                )));
            }

            let mut body = Vec::new();
            for part in parts {
                let (tag, bytes) = upload.parts.get(&part.index).ok_or_else(|| {
                    StoreError::FinalizeRejected(format!("missing part {}", part.index))
                })?;
                if tag != &part.tag {
                    return Err(StoreError::FinalizeRejected(format!(
                        "tag mismatch for part {}",
                        part.index
                    )));
                }
                body.extend_from_slice(bytes);
            }

            inner.objects.insert(name.to_string(), body);
            Ok(())
        })
    }
}
