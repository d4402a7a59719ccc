pub mod bus;
pub mod dir_cache;

pub use bus::{CacheBus, InvalidateEvent, InvalidateTarget};
pub use dir_cache::{DirectoryCache, DirectoryCacheConfig, DirectoryCacheStats};
