pub mod extract;
pub mod handler;
pub mod processor;

pub use extract::{Extractor, contains_source};
pub use handler::PackageHandler;
pub use processor::{BatchError, BatchEvent, BatchProcessor, BatchResult, RunStatus};
