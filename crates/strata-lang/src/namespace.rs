use std::{collections::BTreeMap, sync::Arc};

use strata_core::Tier;

use crate::ast::FunctionDef;
use crate::value::{ClassDef, Value};

/// Which tier, and which unit within it, bound a symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    pub tier: Tier,
    pub origin: Arc<str>,
}

impl Provenance {
    pub fn new(tier: Tier, origin: impl Into<Arc<str>>) -> Self {
        Self {
            tier,
            origin: origin.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Symbol {
    Function(Arc<FunctionDef>),
    Class(Arc<ClassDef>),
    Constant(Value),
}

impl Symbol {
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Function(def) => Symbol::Function(def),
            Value::Class(class) => Symbol::Class(class),
            other => Symbol::Constant(other),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Symbol::Function(def) => Value::Function(def.clone()),
            Symbol::Class(class) => Value::Class(class.clone()),
            Symbol::Constant(value) => value.clone(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Symbol::Function(_) => "function",
            Symbol::Class(_) => "class",
            Symbol::Constant(_) => "constant",
        }
    }
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Symbol::Function(a), Symbol::Function(b)) => Arc::ptr_eq(a, b),
            (Symbol::Class(a), Symbol::Class(b)) => Arc::ptr_eq(a, b),
            (Symbol::Constant(a), Symbol::Constant(b)) => a == b,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub symbol: Symbol,
    pub provenance: Provenance,
}

/// Typed symbol table shared by every tier of one module.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Namespace {
    bindings: BTreeMap<String, Binding>,
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `name`, replacing any earlier binding from a lower tier.
    pub fn bind(&mut self, name: impl Into<String>, symbol: Symbol, provenance: Provenance) {
        self.bindings
            .insert(name.into(), Binding { symbol, provenance });
    }

    pub fn get(&self, name: &str) -> Option<&Binding> {
        self.bindings.get(name)
    }

    pub fn value(&self, name: &str) -> Option<Value> {
        self.bindings.get(name).map(|b| b.symbol.to_value())
    }

    pub fn class(&self, name: &str) -> Option<&Arc<ClassDef>> {
        match self.bindings.get(name).map(|b| &b.symbol) {
            Some(Symbol::Class(class)) => Some(class),
            _ => None,
        }
    }

    pub fn function(&self, name: &str) -> Option<&Arc<FunctionDef>> {
        match self.bindings.get(name).map(|b| &b.symbol) {
            Some(Symbol::Function(def)) => Some(def),
            _ => None,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Binding)> {
        self.bindings.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
