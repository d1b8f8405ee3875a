use crate::errors::{AnalystError, Result};
use std::path::PathBuf;

/// Resolves caller-supplied file ids to paths under the input root, as the
/// execution host sees them.
///
/// The orchestrator trusts the resolution and does not check existence.
pub trait FileStore: Send + Sync {
    fn resolve(&self, file_id: &str) -> Result<String>;
}

/// Uploads directory laid out as `<root>/<id><extension>`
#[derive(Debug, Clone)]
pub struct UploadsFileStore {
    root: PathBuf,
    extension: String,
}

impl UploadsFileStore {
    pub fn new(root: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            extension: extension.into(),
        }
    }
}

impl FileStore for UploadsFileStore {
    fn resolve(&self, file_id: &str) -> Result<String> {
        let id = file_id.trim();
        if id.is_empty() {
            return Err(AnalystError::MissingFile);
        }
        let well_formed = id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if !well_formed || id.starts_with('.') || id.contains("..") {
            return Err(AnalystError::InvalidFileId(id.to_string()));
        }
        let name = if id.ends_with(&self.extension) {
            id.to_string()
        } else {
            format!("{}{}", id, self.extension)
        };
        Ok(self.root.join(name).to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> UploadsFileStore {
        UploadsFileStore::new("/app/uploads", ".csv")
    }

    #[test]
    fn test_resolves_id_under_root() {
        assert_eq!(
            store().resolve("3f2a9c1e-77b0-4f6e-9a51-5b1d2c3e4f50").unwrap(),
            "/app/uploads/3f2a9c1e-77b0-4f6e-9a51-5b1d2c3e4f50.csv"
        );
        assert_eq!(store().resolve("sales.csv").unwrap(), "/app/uploads/sales.csv");
    }

    #[test]
    fn test_rejects_traversal_and_separators() {
        for bad in ["../etc/passwd", "a/b", "..", ".hidden", "a b", "x\\y"] {
            assert!(
                matches!(store().resolve(bad), Err(AnalystError::InvalidFileId(_))),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_blank_id_is_missing_file() {
        assert!(matches!(store().resolve("  "), Err(AnalystError::MissingFile)));
    }
}
