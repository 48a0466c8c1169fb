//! Template storage: where prompt template resources are fetched from.

pub mod blob;
pub mod fs;
pub mod traits;

pub use blob::HttpBlobStore;
pub use fs::{FsTemplateStore, StaticTemplateStore};
pub use traits::TemplateStore;
