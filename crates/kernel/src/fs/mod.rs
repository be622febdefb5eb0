/// Filesystem boundary
///
/// The core does not know on-disk formats; it sees files as
/// `{driver_id, vnode_id}` identities whose pages live in a per-file cache.
/// The VMM's file driver maps cache units directly and marks them dirty on
/// write faults; a filesystem driver supplies the backend that fills and
/// writes back pages.

pub mod file_cache;

pub use file_cache::{FileBackend, FileCache, FileCacheUnit, FileId};
