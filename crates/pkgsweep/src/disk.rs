use std::path::Path;

/// Reports free space on the volume holding a path.
pub trait SpaceProbe: Send + Sync {
    fn available_bytes(&self, path: &Path) -> std::io::Result<u64>;
}

impl<T: SpaceProbe + ?Sized> SpaceProbe for std::sync::Arc<T> {
    fn available_bytes(&self, path: &Path) -> std::io::Result<u64> {
        (**self).available_bytes(path)
    }
}
