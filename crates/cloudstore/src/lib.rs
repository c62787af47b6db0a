//! Resumable, parallel, chunked upload to a cloud object store.
//!
//! Used when no direct or relayed link to the peer exists and the payload
//! must be staged through a bucket. The protocol survives process
//! restarts: the multipart token is persisted before the first part is
//! uploaded, already-uploaded parts are never re-sent, and the token is
//! discarded only after the store confirms finalization.

mod backoff;
mod memory;
mod mime;
mod plan;
mod store;
mod token;
mod uploader;

pub use backoff::BackoffConfig;
pub use memory::{FailKind, MemoryStore};
pub use mime::mime_for_path;
pub use plan::{ChunkPlan, MIN_CHUNK_SIZE, TARGET_PART_COUNT};
pub use store::{ObjectStore, PartInfo, StoreError, StoreFuture};
pub use token::{MemoryTokenStore, TokenStore, UploadToken};
pub use uploader::{UploadConfig, UploadError, Uploader, MAX_WORKERS};
