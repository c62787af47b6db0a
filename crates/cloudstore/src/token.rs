//! Resumable-upload token persistence seam.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Identifies one in-progress multipart upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadToken {
    /// Object name in the bucket.
    pub name: String,
    /// Store-issued multipart upload id.
    pub upload_id: String,
}

/// Durable storage for the upload token.
///
/// The token must be persisted before any part is uploaded, so a crash
/// after initiate never loses the ability to resume. The transaction
/// snapshot implements this on disk; [`MemoryTokenStore`] backs tests.
pub trait TokenStore: Send + Sync {
    fn load(&self) -> Option<UploadToken>;
    fn save(&self, token: &UploadToken);
    fn clear(&self);
}

/// In-memory token store.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    token: Mutex<Option<UploadToken>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seeds a token, as if persisted by a previous run.
    pub fn with_token(token: UploadToken) -> Self {
        Self {
            token: Mutex::new(Some(token)),
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> Option<UploadToken> {
        self.token.lock().unwrap().clone()
    }

    fn save(&self, token: &UploadToken) {
        *self.token.lock().unwrap() = Some(token.clone());
    }

    fn clear(&self) {
        *self.token.lock().unwrap() = None;
    }
}
