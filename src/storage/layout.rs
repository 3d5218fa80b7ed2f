//! Bucket layout recorded next to the journals.
//!
//! Journals are recovered by position, so a data directory is only valid for
//! the bucket count and router it was created with.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::StorageError;

pub const LAYOUT_FILE: &str = "layout.toml";
const ROUTER: &str = "crc32";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketLayout {
    pub bucket_count: usize,
    pub router: String,
}

impl BucketLayout {
    pub fn new(bucket_count: usize) -> Self {
        Self {
            bucket_count,
            router: ROUTER.to_string(),
        }
    }

    /// Layout stored in `dir`, if any.
    pub fn load(dir: &Path) -> Result<Option<Self>, StorageError> {
        let path = dir.join(LAYOUT_FILE);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        toml::from_str(&text)
            .map(Some)
            .map_err(|e| StorageError::Corruption(format!("{}: {e}", path.display())))
    }

    pub fn store(&self, dir: &Path) -> Result<(), StorageError> {
        let text =
            toml::to_string(self).map_err(|e| StorageError::Corruption(e.to_string()))?;
        let path = dir.join(LAYOUT_FILE);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Record this layout in a fresh directory, or check it against the stored one.
    pub fn ensure(&self, dir: &Path) -> Result<(), StorageError> {
        match Self::load(dir)? {
            None => {
                self.store(dir)?;
                info!(dir = %dir.display(), buckets = self.bucket_count, "bucket layout recorded");
                Ok(())
            }
            Some(stored) => self.check(&stored),
        }
    }

    pub fn check(&self, stored: &Self) -> Result<(), StorageError> {
        if stored == self {
            return Ok(());
        }
        Err(StorageError::LayoutMismatch(format!(
            "data directory has {} buckets routed by {}, configured {} routed by {}",
            stored.bucket_count, stored.router, self.bucket_count, self.router
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("client_queue_layout_{name}_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn first_open_records_then_later_opens_must_match() {
        let dir = temp_dir("ensure");
        assert_eq!(BucketLayout::load(&dir).unwrap(), None);

        BucketLayout::new(16).ensure(&dir).unwrap();
        assert_eq!(BucketLayout::load(&dir).unwrap(), Some(BucketLayout::new(16)));
        BucketLayout::new(16).ensure(&dir).unwrap();

        let err = BucketLayout::new(32).ensure(&dir).unwrap_err();
        assert!(matches!(err, StorageError::LayoutMismatch(msg) if msg.contains("16") && msg.contains("32")));

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn garbage_layout_is_corruption() {
        let dir = temp_dir("garbage");
        fs::write(dir.join(LAYOUT_FILE), "bucket_count = \"many\"").unwrap();
        assert!(matches!(BucketLayout::load(&dir), Err(StorageError::Corruption(_))));
        let _ = fs::remove_dir_all(dir);
    }
}
