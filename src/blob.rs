use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use base64::Engine as _;

const BLOB_PREFIX: &str = "blob:storyforge/";

/// Binary media received directly from the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub mime: String,
    pub bytes: Vec<u8>,
}

impl Blob {
    pub fn to_data_url(&self) -> String {
        let payload = base64::engine::general_purpose::STANDARD.encode(&self.bytes);
        format!("data:{};base64,{payload}", self.mime)
    }
}

/// Process-local registry of binary media behind revocable `blob:` references.
///
/// References do not survive the process; anything persisted or exported is
/// converted to a `data:` URL first.
#[derive(Debug, Clone, Default)]
pub struct BlobStore {
    blobs: Arc<Mutex<HashMap<String, Arc<Blob>>>>,
}

impl BlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_blob_ref(url: &str) -> bool {
        url.starts_with("blob:")
    }

    pub fn register(&self, mime: &str, bytes: Vec<u8>) -> String {
        let reference = format!("{BLOB_PREFIX}{}", uuid::Uuid::new_v4());
        let blob = Blob {
            mime: mime.to_owned(),
            bytes,
        };
        tracing::debug!(%reference, mime, bytes = blob.bytes.len(), "registered blob");
        self.lock().insert(reference.clone(), Arc::new(blob));
        reference
    }

    pub fn get(&self, reference: &str) -> Option<Arc<Blob>> {
        self.lock().get(reference).cloned()
    }

    pub fn revoke(&self, reference: &str) -> bool {
        self.lock().remove(reference).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_data_url(&self, reference: &str) -> Option<String> {
        self.get(reference).map(|blob| blob.to_data_url())
    }

    /// A URL that stays valid outside this process.
    ///
    /// Blob references become `data:` URLs; unknown ones resolve to `None`.
    /// Anything else is returned unchanged.
    pub fn portable_url(&self, url: &str) -> Option<String> {
        if Self::is_blob_ref(url) {
            self.to_data_url(url)
        } else {
            Some(url.to_owned())
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Blob>>> {
        self.blobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Splits a base64 `data:` URL into its media type and decoded bytes.
pub fn decode_data_url(url: &str) -> Option<Blob> {
    let rest = url.strip_prefix("data:")?;
    let (meta, payload) = rest.split_once(',')?;
    let mime = meta.strip_suffix(";base64")?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .ok()?;
    let mime = if mime.is_empty() {
        "application/octet-stream"
    } else {
        mime
    };
    Some(Blob {
        mime: mime.to_owned(),
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_resolve_and_revoke() {
        let store = BlobStore::new();
        let reference = store.register("image/png", vec![0x89, 0x50, 0x4e, 0x47]);
        assert!(BlobStore::is_blob_ref(&reference));
        assert_eq!(store.len(), 1);
        assert_eq!(store.to_data_url(&reference).as_deref(), Some("data:image/png;base64,iVBORw=="));
        assert!(store.revoke(&reference));
        assert!(!store.revoke(&reference));
        assert!(store.get(&reference).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn portable_url_handles_every_kind() {
        let store = BlobStore::new();
        let reference = store.register("audio/mpeg", b"ID3".to_vec());
        assert_eq!(store.portable_url(&reference).as_deref(), Some("data:audio/mpeg;base64,SUQz"));
        assert_eq!(
            store.portable_url("https://cdn.test/a.png").as_deref(),
            Some("https://cdn.test/a.png")
        );
        assert_eq!(store.portable_url("blob:storyforge/missing"), None);
    }

    #[test]
    fn decodes_data_urls() {
        let blob = decode_data_url("data:audio/mpeg;base64,SUQz").unwrap();
        assert_eq!(blob.mime, "audio/mpeg");
        assert_eq!(blob.bytes, b"ID3");
        assert!(decode_data_url("data:text/plain,hello").is_none());
        assert!(decode_data_url("https://x").is_none());
    }
}
