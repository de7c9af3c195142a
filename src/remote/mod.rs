pub mod cache;
pub mod files;

pub use cache::{CacheManager, ReadyContext, RemoteCacheEntry};
pub use files::{LocalObjectStorage, ObjectStorage, RemoteFileStore};
