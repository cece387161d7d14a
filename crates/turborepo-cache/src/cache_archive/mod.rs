mod create;
mod restore;

pub use create::CacheWriter;
pub use restore::CacheReader;

/// Archive entry holding the file listing, always written first so callers
/// can enumerate an artifact without extracting it.
pub const INDEX_ENTRY: &str = ".turbo-cache-index.json";
