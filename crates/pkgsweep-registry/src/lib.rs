pub mod client;
pub mod downloader;
pub mod listing;

pub use client::{HexRegistry, HexRegistryConfig};
pub use downloader::HttpArchiveTransport;
