//! `TemplateStore` trait: single async interface for fetching template bytes.

use async_trait::async_trait;

use crate::error::StoreError;

/// Source of prompt template resources.
///
/// Called once at startup; implementations need not cache.
#[async_trait]
pub trait TemplateStore: Send + Sync {
    /// Fetch the raw bytes of the template named `name`.
    async fn fetch(&self, name: &str) -> Result<Vec<u8>, StoreError>;

    /// Short description used in logs.
    fn describe(&self) -> String;
}
