mod fs;
mod memory;

pub use fs::FsSourceStore;
pub use memory::MemorySourceStore;
