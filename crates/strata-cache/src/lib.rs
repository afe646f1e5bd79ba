pub mod cache;
pub mod module;
pub mod rollback;

pub use cache::*;
pub use module::*;
pub use rollback::*;
