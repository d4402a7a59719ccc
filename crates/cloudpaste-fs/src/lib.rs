pub mod facade;
pub mod range;
pub mod resolver;
pub mod streaming;

pub use facade::{BatchCopyResult, CopyItemSpec, DirectoryPage, FsService, LinkInfo};
pub use range::RangeDecision;
pub use resolver::{MountResolver, ResolvedPath};
pub use streaming::{Channel, RangeReader, StreamRequest, open_range_reader};
