//! Attachment storage collaborator.
//!
//! The engine never stores file contents itself. An attachment is uploaded
//! through a [`BlobStore`] before the ticket write, and only the returned
//! URL lands on the ticket as `attachmentRef`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::RwLock;
use std::time::Duration;

use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::StorageError;
use crate::sync::{read, write};

/// Largest accepted attachment, in bytes.
pub const MAX_ATTACHMENT_BYTES: usize = 2 * 1024 * 1024;

/// A file to attach to a ticket.
#[derive(Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Client-side file name.
    pub name: String,
    pub bytes: Vec<u8>,
}

impl Attachment {
    #[must_use]
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }

    /// Payload size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

impl std::fmt::Debug for Attachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attachment")
            .field("name", &self.name)
            .field("size", &self.bytes.len())
            .finish()
    }
}

/// Blob storage backend.
///
/// Implementations must be thread-safe (`Send + Sync`) for use across async tasks.
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `name` and return a URL that retrieves them.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::UploadFailed` if the backend rejects the upload.
    fn upload(
        &self,
        name: &str,
        bytes: Vec<u8>,
    ) -> impl Future<Output = Result<String, StorageError>> + Send;
}

/// Upload an attachment, enforcing the size limit and a deadline.
///
/// Oversized payloads are rejected without contacting the store.
///
/// # Errors
///
/// Returns `StorageError::PayloadTooLarge`, `StorageError::Timeout`, or the
/// store's own `StorageError::UploadFailed`.
#[instrument(skip(store, attachment), fields(name = %attachment.name, size = attachment.size()))]
pub async fn upload_attachment<B: BlobStore>(
    store: &B,
    attachment: Attachment,
    timeout: Duration,
) -> Result<String, StorageError> {
    let size = attachment.size();
    if size > MAX_ATTACHMENT_BYTES {
        debug!("Attachment over limit");
        return Err(StorageError::PayloadTooLarge {
            size,
            max: MAX_ATTACHMENT_BYTES,
        });
    }

    match tokio::time::timeout(timeout, store.upload(&attachment.name, attachment.bytes)).await {
        Ok(Ok(url)) => {
            debug!(%url, "Attachment uploaded");
            Ok(url)
        }
        Ok(Err(err)) => {
            warn!(error = %err, "Attachment upload failed");
            Err(err)
        }
        Err(_) => {
            warn!(?timeout, "Attachment upload timed out");
            Err(StorageError::Timeout(timeout))
        }
    }
}

/// In-process blob store keyed by `attachments/{uuid}-{name}`.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    /// URL scheme of returned references.
    pub const SCHEME: &'static str = "memory://";

    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the bytes behind a URL returned by `upload`.
    #[must_use]
    pub fn get(&self, url: &str) -> Option<Vec<u8>> {
        let path = url.strip_prefix(Self::SCHEME)?;
        read(&self.blobs).get(path).cloned()
    }

    /// Number of stored blobs.
    #[must_use]
    pub fn len(&self) -> usize {
        read(&self.blobs).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobStore for MemoryBlobStore {
    async fn upload(&self, name: &str, bytes: Vec<u8>) -> Result<String, StorageError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StorageError::UploadFailed("attachment name is empty".to_string()));
        }

        // Keep client names from escaping the attachments prefix
        let safe_name = name.replace(['/', '\\'], "_");
        let path = format!("attachments/{}-{safe_name}", Uuid::new_v4());

        write(&self.blobs).insert(path.clone(), bytes);
        Ok(format!("{}{path}", Self::SCHEME))
    }
}
