pub mod discovery;
pub mod host;
pub mod registry;
pub mod resolver;
pub mod store;
pub mod watcher;

pub use discovery::{collect_script_files, DiscoveryConfig};
pub use host::ScriptHost;
pub use registry::{InstanceRegistry, LiveInstance, RegistryOptions, ReloadReport};
pub use resolver::{SourceLayout, TieredModuleResolver};
pub use store::{FsSourceStore, MemorySourceStore};
pub use watcher::{FileChange, FileUpdate, ScriptWatcher};
