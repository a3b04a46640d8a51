//! Object storage backends for the backup destination and snapshot archive.

mod fs;
mod r2;
mod snapshot;

pub use fs::FsBlobStore;
pub use r2::{R2BlobStore, R2Config};
pub use snapshot::{SnapshotArchive, SnapshotInfo};

use async_trait::async_trait;

use crate::{Error, Result};

/// Key/value blob operations shared across object backends.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Short backend name for logs.
    fn backend(&self) -> &'static str;

    /// Check that the store is reachable with current credentials.
    async fn ping(&self) -> Result<()>;

    /// Read an object. Missing objects are `Ok(None)`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn put(&self, key: &str, bytes: &[u8], content_type: Option<&str>) -> Result<()>;

    /// All object keys under `prefix`, in lexicographic order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Delete an object. Deleting a missing object succeeds.
    async fn delete(&self, key: &str) -> Result<()>;
}

pub(crate) fn normalize_object_key(object_key: &str) -> Result<String> {
    let object_key = object_key.trim().trim_matches('/').to_string();
    if object_key.is_empty() {
        return Err(Error::InvalidInput(
            "Storage object_key cannot be empty".to_string(),
        ));
    }
    if object_key.split('/').any(|segment| segment == ".." || segment == ".") {
        return Err(Error::InvalidInput(format!(
            "Storage object_key '{object_key}' contains relative segments"
        )));
    }
    Ok(object_key)
}

pub(crate) fn normalize_content_type(content_type: Option<&str>) -> Option<String> {
    content_type
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_object_key_rejects_empty() {
        let err = normalize_object_key("   ").unwrap_err();
        match err {
            Error::InvalidInput(message) => assert!(message.contains("object_key")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn normalize_object_key_trims_slashes_and_rejects_traversal() {
        assert_eq!(normalize_object_key("/a/b.json/").unwrap(), "a/b.json");
        assert!(normalize_object_key("a/../b").is_err());
    }

    #[test]
    fn normalize_content_type_ignores_empty_values() {
        assert_eq!(normalize_content_type(None), None);
        assert_eq!(normalize_content_type(Some("   ")), None);
        assert_eq!(
            normalize_content_type(Some(" application/json ")),
            Some("application/json".to_string())
        );
    }
}
