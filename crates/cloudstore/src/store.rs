//! Abstract multipart-upload API of the cloud object store.

use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by [`ObjectStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// One uploaded part as reported by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartInfo {
    /// 0-based chunk index.
    pub index: u32,
    /// Opaque tag the store expects back at finalization.
    pub tag: String,
}

/// Errors produced by the object store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("request timed out")]
    Timeout,

    #[error("throttled by the store")]
    Throttled,

    /// Provider-level failure; status and provider code survive for
    /// diagnostics.
    #[error("store error {status}: {code}")]
    Status { status: u16, code: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("upload not found: {0}")]
    UnknownUpload(String),

    #[error("finalize rejected: {0}")]
    FinalizeRejected(String),
}

impl StoreError {
    /// Whether retrying the same part may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Timeout | StoreError::Throttled => true,
            StoreError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Multipart-upload interface of the cloud object store.
///
/// Implemented over the provider SDK by the host application; the
/// in-crate [`MemoryStore`](crate::MemoryStore) backend implements it for
/// tests and local staging.
pub trait ObjectStore: Send + Sync {
    /// Starts a new multipart upload and returns its id.
    fn initiate<'a>(&'a self, name: &'a str, mime: &'a str) -> StoreFuture<'a, String>;

    /// Looks up an in-progress multipart upload for `name`, if any.
    ///
    /// Used to re-adopt a remote session whose token was never persisted
    /// locally (crash between initiate and token save).
    fn find_upload<'a>(&'a self, name: &'a str) -> StoreFuture<'a, Option<String>>;

    /// Lists parts uploaded so far, in no particular order.
    fn list_parts<'a>(&'a self, name: &'a str, upload_id: &'a str)
    -> StoreFuture<'a, Vec<PartInfo>>;

    /// Uploads one part and returns its tag.
    fn upload_part<'a>(
        &'a self,
        name: &'a str,
        upload_id: &'a str,
        index: u32,
        bytes: Vec<u8>,
    ) -> StoreFuture<'a, String>;

    /// Commits the upload. `parts` must be sorted by index and complete.
    fn finalize<'a>(
        &'a self,
        name: &'a str,
        upload_id: &'a str,
        parts: &'a [PartInfo],
    ) -> StoreFuture<'a, ()>;
}
