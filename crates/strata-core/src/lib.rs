pub mod config;
pub mod error;
pub mod source;
pub mod types;

pub use config::*;
pub use error::*;
pub use source::*;
pub use types::*;
