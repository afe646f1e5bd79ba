use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ModuleName, Tier};

#[derive(Error, Debug)]
pub enum StrataError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid module name: {0:?}")]
    InvalidModuleName(String),

    #[error("No source found for module {0}")]
    SourceNotFound(ModuleName),

    #[error("Failed to execute {module} at tier {tier} ({origin}): {source}")]
    Execution {
        module: ModuleName,
        tier: Tier,
        origin: String,
        #[source]
        source: ScriptError,
    },

    #[error("Module {module} (in {origins}) has no class named {class}")]
    ClassNotFound {
        module: ModuleName,
        class: String,
        origins: String,
    },

    #[error("Module {0} has not been instantiated")]
    NotInstantiated(ModuleName),

    #[error("Class {class} in module {module} has no method named {method}")]
    MethodNotFound {
        module: ModuleName,
        class: String,
        method: String,
    },

    #[error("Module {0} is no longer present in any tier")]
    ModuleVanished(ModuleName),

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error("Watch error: {0}")]
    Watch(String),
}

impl StrataError {
    /// Script-level trace when the failure came from hosted code.
    pub fn script_trace(&self) -> Option<String> {
        match self {
            StrataError::Execution { source, .. } | StrataError::Script(source) => {
                Some(source.format_trace())
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, StrataError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScriptErrorKind {
    Syntax,
    Name,
    Type,
    Arity,
    Attribute,
    Index,
    ZeroDivision,
    Recursion,
    Raised,
}

impl fmt::Display for ScriptErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ScriptErrorKind::Syntax => "SyntaxError",
            ScriptErrorKind::Name => "NameError",
            ScriptErrorKind::Type => "TypeError",
            ScriptErrorKind::Arity => "ArityError",
            ScriptErrorKind::Attribute => "AttributeError",
            ScriptErrorKind::Index => "IndexError",
            ScriptErrorKind::ZeroDivision => "ZeroDivisionError",
            ScriptErrorKind::Recursion => "RecursionError",
            ScriptErrorKind::Raised => "Error",
        };
        f.write_str(label)
    }
}

/// One `origin:line` step of a script-level trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceFrame {
    pub origin: String,
    pub line: usize,
    pub function: Option<String>,
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.function {
            Some(function) => write!(f, "{}:{} in {}", self.origin, self.line, function),
            None => write!(f, "{}:{} in <module>", self.origin, self.line),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind}: {message}")]
pub struct ScriptError {
    pub kind: ScriptErrorKind,
    pub message: String,
    /// Innermost frame first.
    pub trace: Vec<TraceFrame>,
}

impl ScriptError {
    pub fn new(kind: ScriptErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            trace: Vec::new(),
        }
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Self::new(ScriptErrorKind::Syntax, message)
    }

    pub fn name(message: impl Into<String>) -> Self {
        Self::new(ScriptErrorKind::Name, message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ScriptErrorKind::Type, message)
    }

    pub fn arity(message: impl Into<String>) -> Self {
        Self::new(ScriptErrorKind::Arity, message)
    }

    pub fn attribute(message: impl Into<String>) -> Self {
        Self::new(ScriptErrorKind::Attribute, message)
    }

    pub fn index(message: impl Into<String>) -> Self {
        Self::new(ScriptErrorKind::Index, message)
    }

    pub fn with_frame(mut self, frame: TraceFrame) -> Self {
        self.trace.push(frame);
        self
    }

    /// Renders the trace outermost call first, ending with the error itself.
    pub fn format_trace(&self) -> String {
        let mut out = String::from("Traceback (most recent call last):\n");
        for frame in self.trace.iter().rev() {
            out.push_str("  ");
            out.push_str(&frame.to_string());
            out.push('\n');
        }
        out.push_str(&self.to_string());
        out
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Tier list cannot be empty")]
    EmptyTierList,

    #[error("Duplicate tier name: {0}")]
    DuplicateTier(String),

    #[error("Invalid tier name: {0:?}")]
    InvalidTierName(String),
}

/// A failed import, kept until the host drains it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportErrorRecord {
    pub module: String,
    pub trace: String,
    pub recorded_at: DateTime<Utc>,
}

impl ImportErrorRecord {
    pub fn new(module: impl Into<String>, trace: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            trace: trace.into(),
            recorded_at: Utc::now(),
        }
    }

    /// Builds a record whose trace starts with the module name, followed by
    /// the error and any script-level frames.
    pub fn from_error(module: impl Into<String>, err: &StrataError) -> Self {
        let module = module.into();
        let trace = match err.script_trace() {
            Some(script) => format!("{}\n{}\n{}", module, err, script),
            None => format!("{}\n{}", module, err),
        };
        Self::new(module, trace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_renders_outermost_first() {
        let err = ScriptError::new(ScriptErrorKind::ZeroDivision, "division by zero")
            .with_frame(TraceFrame {
                origin: "base/Wind.strata".into(),
                line: 4,
                function: Some("ratio".into()),
            })
            .with_frame(TraceFrame {
                origin: "base/Wind.strata".into(),
                line: 9,
                function: None,
            });

        let rendered = err.format_trace();
        let outer = rendered.find("base/Wind.strata:9 in <module>").unwrap();
        let inner = rendered.find("base/Wind.strata:4 in ratio").unwrap();
        assert!(outer < inner);
        assert!(rendered.ends_with("ZeroDivisionError: division by zero"));
    }

    #[test]
    fn test_import_record_starts_with_module_name() {
        let err = StrataError::SourceNotFound(ModuleName::parse("Wind").unwrap());
        let record = ImportErrorRecord::from_error("Wind", &err);
        assert!(record.trace.starts_with("Wind\n"));
        assert!(record.trace.contains("No source found"));
    }

    #[test]
    fn test_script_error_is_transparent() {
        let err: StrataError = ScriptError::new(ScriptErrorKind::Raised, "boom").into();
        assert_eq!(err.to_string(), "Error: boom");
    }
}
