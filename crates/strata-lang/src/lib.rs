//! The strata script language: a small, fixed-grammar language whose units
//! execute into a shared, typed namespace so that later tiers can rebind
//! what earlier tiers defined.

pub mod ast;
pub mod builtins;
pub mod engine;
mod interp;
pub mod lexer;
pub mod namespace;
pub mod parser;
pub mod value;

pub use engine::{Kwargs, ScriptEngine, SourceExecutor};
pub use namespace::{Binding, Namespace, Provenance, Symbol};
pub use parser::parse_program;
pub use value::{ClassDef, Instance, Value};
