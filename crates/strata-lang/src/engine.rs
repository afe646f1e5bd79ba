use std::sync::Arc;

use strata_core::{ScriptError, SourceUnit};
use tracing::debug;

use crate::interp::{Interpreter, ModuleExecutor};
use crate::namespace::{Namespace, Provenance};
use crate::parser::parse_program;
use crate::value::{ClassDef, Instance, Value};

/// Keyword arguments as they arrive from the host.
pub type Kwargs = serde_json::Map<String, serde_json::Value>;

/// Executes source units into a namespace and drives the objects they define.
pub trait SourceExecutor: Send + Sync {
    /// Runs `unit` against `namespace`, rebinding any names it defines.
    fn execute(&self, unit: &SourceUnit, namespace: &mut Namespace) -> Result<(), ScriptError>;

    /// Builds an instance of `class`, calling its `init` method with `kwargs`.
    fn construct(
        &self,
        class: &Arc<ClassDef>,
        kwargs: &Kwargs,
        globals: &Namespace,
    ) -> Result<Arc<Instance>, ScriptError>;

    /// Calls `method` on `instance` and returns the result as JSON.
    fn invoke(
        &self,
        instance: &Arc<Instance>,
        method: &str,
        kwargs: &Kwargs,
        globals: &Namespace,
    ) -> Result<serde_json::Value, ScriptError>;
}

#[derive(Debug, Clone)]
pub struct ScriptEngine {
    max_call_depth: usize,
}

impl Default for ScriptEngine {
    fn default() -> Self {
        Self { max_call_depth: 128 }
    }
}

impl ScriptEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth.max(1);
        self
    }

    /// Parses `text` without executing it.
    pub fn check(&self, text: &str, origin: &str) -> Result<(), ScriptError> {
        parse_program(text, origin).map(|_| ())
    }

    /// Calls a module-level function by name.
    pub fn call_function(
        &self,
        globals: &Namespace,
        name: &str,
        kwargs: &Kwargs,
    ) -> Result<serde_json::Value, ScriptError> {
        let def = globals
            .function(name)
            .ok_or_else(|| ScriptError::name(format!("no function named '{}'", name)))?
            .clone();
        let mut interp = Interpreter::new(globals, self.max_call_depth);
        interp
            .call_function(&def, None, Vec::new(), to_script_kwargs(kwargs))
            .map(|value| value.to_json())
    }
}

impl SourceExecutor for ScriptEngine {
    fn execute(&self, unit: &SourceUnit, namespace: &mut Namespace) -> Result<(), ScriptError> {
        debug!(tier = %unit.tier, origin = %unit.origin, "executing source unit");
        let program = parse_program(&unit.text, &unit.origin)?;
        let provenance = Provenance::new(unit.tier.clone(), unit.origin.clone());
        ModuleExecutor::new(namespace, provenance, self.max_call_depth).run(&program)
    }

    fn construct(
        &self,
        class: &Arc<ClassDef>,
        kwargs: &Kwargs,
        globals: &Namespace,
    ) -> Result<Arc<Instance>, ScriptError> {
        Interpreter::new(globals, self.max_call_depth).construct(
            class,
            Vec::new(),
            to_script_kwargs(kwargs),
        )
    }

    fn invoke(
        &self,
        instance: &Arc<Instance>,
        method: &str,
        kwargs: &Kwargs,
        globals: &Namespace,
    ) -> Result<serde_json::Value, ScriptError> {
        let def = instance
            .class
            .method(method)
            .ok_or_else(|| {
                ScriptError::attribute(format!(
                    "'{}' instance has no method '{}'",
                    instance.class_name(),
                    method
                ))
            })?
            .clone();
        let mut interp = Interpreter::new(globals, self.max_call_depth);
        interp
            .call_function(
                &def,
                Some(instance.clone()),
                Vec::new(),
                to_script_kwargs(kwargs),
            )
            .map(|value| value.to_json())
    }
}

fn to_script_kwargs(kwargs: &Kwargs) -> Vec<(String, Value)> {
    kwargs
        .iter()
        .map(|(k, v)| (k.clone(), Value::from_json(v)))
        .collect()
}
