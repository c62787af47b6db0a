//! Resumable parallel upload engine.
//!
//! Drives one payload file into the object store across process restarts
//! and transient failures. Parts already confirmed by the store are never
//! re-uploaded; the multipart token is persisted before the first part
//! goes out and discarded only after finalization is confirmed.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::BackoffConfig;
use crate::mime::mime_for_path;
use crate::plan::{ChunkPlan, MIN_CHUNK_SIZE};
use crate::store::{ObjectStore, PartInfo, StoreError};
use crate::token::{TokenStore, UploadToken};

/// Hard cap on concurrent upload workers, respecting store connection
/// limits.
pub const MAX_WORKERS: usize = 16;

/// Tuning knobs for one upload session.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Concurrent workers (clamped to 1..=[`MAX_WORKERS`]).
    pub workers: usize,
    /// Minimum chunk size. [`MIN_CHUNK_SIZE`] in production; tests force
    /// it small to exercise multi-chunk paths.
    pub min_chunk_size: u64,
    pub backoff: BackoffConfig,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            min_chunk_size: MIN_CHUNK_SIZE,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Errors surfaced by the upload engine.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("retries exhausted for chunk {index}: {source}")]
    RetriesExhausted { index: u32, source: StoreError },

    /// A non-final chunk read fewer bytes than planned. The source file
    /// changed underneath the session.
    #[error("short read on chunk {index}: expected {expected} bytes, got {got}")]
    ShortRead { index: u32, expected: u64, got: u64 },

    #[error("upload cancelled")]
    Cancelled,
}

/// Monotonic progress reporter: completed-chunk fraction plus half
/// credit per in-flight chunk, never decreasing.
struct Gauge {
    tx: watch::Sender<f64>,
    last: Mutex<f64>,
    total: f64,
}

impl Gauge {
    fn new(tx: watch::Sender<f64>, total_chunks: u32) -> Self {
        Self {
            tx,
            last: Mutex::new(0.0),
            total: total_chunks.max(1) as f64,
        }
    }

    fn report(&self, completed: usize, inflight: u32) {
        let value = ((completed as f64 + inflight as f64 * 0.5) / self.total).min(1.0);
        let mut last = self.last.lock().unwrap();
        if value > *last {
            *last = value;
            let _ = self.tx.send(value);
        }
    }

    fn complete(&self) {
        let mut last = self.last.lock().unwrap();
        if *last < 1.0 {
            *last = 1.0;
            let _ = self.tx.send(1.0);
        }
    }
}

/// State shared by the worker pool. Only `claim next index` is mutated
/// under the lock; all I/O happens outside it.
struct Shared {
    next: Mutex<u32>,
    recorded: Mutex<Vec<PartInfo>>,
    /// Parts past the contiguous prefix the store already has; confirmed
    /// individually instead of re-uploaded.
    present: HashMap<u32, String>,
    inflight: AtomicU32,
}

struct WorkerCtx {
    store: Arc<dyn ObjectStore>,
    shared: Arc<Shared>,
    path: PathBuf,
    object_name: String,
    upload_id: String,
    plan: ChunkPlan,
    backoff: BackoffConfig,
    cancel: CancellationToken,
    gauge: Arc<Gauge>,
}

/// Resumable multipart uploader.
pub struct Uploader {
    store: Arc<dyn ObjectStore>,
    tokens: Arc<dyn TokenStore>,
    config: UploadConfig,
}

impl Uploader {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        tokens: Arc<dyn TokenStore>,
        config: UploadConfig,
    ) -> Self {
        Self {
            store,
            tokens,
            config,
        }
    }

    /// Uploads `path` as `object_name`, resuming any previous session.
    ///
    /// Progress in `[0, 1]` is published on `progress`; values never
    /// decrease. Cancellation lets in-flight parts finish naturally and
    /// refuses the next claim.
    pub async fn run(
        &self,
        path: &Path,
        object_name: &str,
        cancel: CancellationToken,
        progress: watch::Sender<f64>,
    ) -> Result<(), UploadError> {
        let file_size = tokio::fs::metadata(path).await?.len();
        let plan = ChunkPlan::for_file(file_size, self.config.min_chunk_size);
        let gauge = Arc::new(Gauge::new(progress, plan.count()));

        let token = self.resolve_token(path, object_name).await?;

        // Resume bookkeeping: sort listed parts, record the contiguous
        // prefix as done, keep the rest for per-chunk confirmation.
        let mut listed = self.store.list_parts(object_name, &token.upload_id).await?;
        listed.sort_by_key(|p| p.index);

        let mut recorded: Vec<PartInfo> = Vec::new();
        let mut present: HashMap<u32, String> = HashMap::new();
        for part in listed {
            if part.index == recorded.len() as u32 && present.is_empty() {
                recorded.push(part);
            } else {
                present.insert(part.index, part.tag);
            }
        }
        let first_pending = recorded.len() as u32;
        info!(
            object = %object_name,
            chunks = plan.count(),
            resumed_prefix = first_pending,
            past_gap = present.len(),
            "upload session started"
        );
        gauge.report(recorded.len(), 0);

        let shared = Arc::new(Shared {
            next: Mutex::new(first_pending),
            recorded: Mutex::new(recorded),
            present,
            inflight: AtomicU32::new(0),
        });

        let remaining = plan.count().saturating_sub(first_pending).max(1) as usize;
        let workers = self.config.workers.clamp(1, MAX_WORKERS).min(remaining);

        // Workers stop on this child token so a failure never cancels
        // the token the caller handed us.
        let pool_cancel = cancel.child_token();
        let mut pool = JoinSet::new();
        for _ in 0..workers {
            let ctx = WorkerCtx {
                store: Arc::clone(&self.store),
                shared: Arc::clone(&shared),
                path: path.to_path_buf(),
                object_name: object_name.to_string(),
                upload_id: token.upload_id.clone(),
                plan,
                backoff: self.config.backoff.clone(),
                cancel: pool_cancel.clone(),
                gauge: Arc::clone(&gauge),
            };
            pool.spawn(upload_worker(ctx));
        }

        let mut failure: Option<UploadError> = None;
        while let Some(joined) = pool.join_next().await {
            let result = joined.map_err(|e| {
                UploadError::Io(std::io::Error::other(format!("worker panicked: {e}")))
            });
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) | Err(e) => {
                    if failure.is_none() {
                        // First failure wins; stop the other workers at
                        // their next claim.
                        pool_cancel.cancel();
                        failure = Some(e);
                    }
                }
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let mut parts = shared.recorded.lock().unwrap().clone();
        parts.sort_by_key(|p| p.index);
        self.store
            .finalize(object_name, &token.upload_id, &parts)
            .await?;
        // Finalization confirmed: only now is the token discarded.
        self.tokens.clear();
        gauge.complete();
        info!(object = %object_name, parts = parts.len(), "upload finalized");
        Ok(())
    }

    /// Loads the persisted token, re-adopts a remote session whose token
    /// never made it to disk, or initiates a fresh upload. In every path
    /// the token is persisted before any part is uploaded.
    async fn resolve_token(
        &self,
        path: &Path,
        object_name: &str,
    ) -> Result<UploadToken, UploadError> {
        if let Some(token) = self.tokens.load().filter(|t| t.name == object_name) {
            debug!(object = %object_name, upload = %token.upload_id, "resuming persisted session");
            return Ok(token);
        }

        if let Some(upload_id) = self.store.find_upload(object_name).await? {
            let token = UploadToken {
                name: object_name.to_string(),
                upload_id,
            };
            self.tokens.save(&token);
            info!(object = %object_name, upload = %token.upload_id, "re-adopted remote session");
            return Ok(token);
        }

        let mime = mime_for_path(path);
        let upload_id = self.store.initiate(object_name, mime).await?;
        let token = UploadToken {
            name: object_name.to_string(),
            upload_id,
        };
        self.tokens.save(&token);
        debug!(object = %object_name, upload = %token.upload_id, mime, "initiated new session");
        Ok(token)
    }
}

async fn upload_worker(ctx: WorkerCtx) -> Result<(), UploadError> {
    let mut file: Option<tokio::fs::File> = None;

    loop {
        // Claim the next chunk. Cancellation refuses the claim; the part
        // currently in flight elsewhere finishes naturally.
        let index = {
            let mut next = ctx.shared.next.lock().unwrap();
            if ctx.cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }
            if *next >= ctx.plan.count() {
                return Ok(());
            }
            let index = *next;
            *next += 1;
            index
        };

        // A part past the resume gap that the store already has: confirm
        // it instead of re-uploading.
        if let Some(tag) = ctx.shared.present.get(&index) {
            debug!(chunk = index, "part already present, skipping");
            record(&ctx, index, tag.clone());
            continue;
        }

        ctx.shared.inflight.fetch_add(1, Ordering::SeqCst);
        let outcome = upload_one(&ctx, &mut file, index).await;
        ctx.shared.inflight.fetch_sub(1, Ordering::SeqCst);

        let tag = outcome?;
        record(&ctx, index, tag);
    }
}

fn record(ctx: &WorkerCtx, index: u32, tag: String) {
    let completed = {
        let mut recorded = ctx.shared.recorded.lock().unwrap();
        recorded.push(PartInfo { index, tag });
        recorded.len()
    };
    ctx.gauge
        .report(completed, ctx.shared.inflight.load(Ordering::SeqCst));
}

async fn upload_one(
    ctx: &WorkerCtx,
    file: &mut Option<tokio::fs::File>,
    index: u32,
) -> Result<String, UploadError> {
    let (offset, len) = ctx.plan.range(index);

    if file.is_none() {
        *file = Some(tokio::fs::File::open(&ctx.path).await?);
    }
    let handle = file.as_mut().unwrap();
    handle.seek(SeekFrom::Start(offset)).await?;

    let mut buf = vec![0u8; len as usize];
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = handle.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    if filled < len as usize {
        // Only the final chunk may come up short.
        if ctx.plan.is_last(index) {
            buf.truncate(filled);
        } else {
            return Err(UploadError::ShortRead {
                index,
                expected: len,
                got: filled as u64,
            });
        }
    }

    let mut attempt: u32 = 0;
    loop {
        match ctx
            .store
            .upload_part(&ctx.object_name, &ctx.upload_id, index, buf.clone())
            .await
        {
            Ok(tag) => {
                debug!(chunk = index, bytes = buf.len(), "part uploaded");
                return Ok(tag);
            }
            Err(e) if e.is_transient() => {
                attempt += 1;
                if attempt > ctx.backoff.max_retries {
                    return Err(UploadError::RetriesExhausted { index, source: e });
                }
                let delay = ctx.backoff.delay_for_attempt(attempt);
                warn!(
                    chunk = index,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient store error, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                warn!(chunk = index, error = %e, "non-transient store error, aborting session");
                return Err(UploadError::Store(e));
            }
        }
    }
}
