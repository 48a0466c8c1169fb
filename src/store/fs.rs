//! Local template stores: a directory on disk, or fixed in-memory entries.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::traits::TemplateStore;
use crate::error::StoreError;

/// Reads templates from a directory.
#[derive(Debug, Clone)]
pub struct FsTemplateStore {
    root: PathBuf,
}

impl FsTemplateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve `name` under the root, refusing paths that escape it.
    fn resolve(&self, name: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(name);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if name.is_empty() || escapes {
            return Err(StoreError::NotFound {
                name: name.to_string(),
            });
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl TemplateStore for FsTemplateStore {
    async fn fetch(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.resolve(name)?;
        debug!(path = %path.display(), "Reading template from disk");
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound {
                name: name.to_string(),
            }),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    fn describe(&self) -> String {
        format!("directory {}", self.root.display())
    }
}

/// Serves templates from memory.
#[derive(Debug, Clone, Default)]
pub struct StaticTemplateStore {
    templates: HashMap<String, Vec<u8>>,
}

impl StaticTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_template(mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.templates.insert(name.into(), bytes.into());
        self
    }
}

#[async_trait]
impl TemplateStore for StaticTemplateStore {
    async fn fetch(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        self.templates
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                name: name.to_string(),
            })
    }

    fn describe(&self) -> String {
        format!("static ({} templates)", self.templates.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_template_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("essay.yaml"), "template: hi").unwrap();

        let store = FsTemplateStore::new(dir.path());
        assert_eq!(store.fetch("essay.yaml").await.unwrap(), b"template: hi");
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsTemplateStore::new(dir.path());
        assert!(matches!(
            store.fetch("absent.yaml").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn refuses_paths_outside_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsTemplateStore::new(dir.path().join("templates"));
        for name in ["../secret.yaml", "/etc/passwd", ""] {
            assert!(matches!(
                store.fetch(name).await,
                Err(StoreError::NotFound { .. })
            ));
        }
    }

    #[tokio::test]
    async fn static_store_serves_registered_templates() {
        let store = StaticTemplateStore::new().with_template("t.yaml", "template: x");
        assert_eq!(store.fetch("t.yaml").await.unwrap(), b"template: x");
        assert!(store.fetch("other").await.is_err());
    }
}
