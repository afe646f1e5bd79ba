use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
    sync::Arc,
};

use parking_lot::Mutex;

use crate::ast::FunctionDef;
use crate::builtins::Builtin;

/// Containers nested deeper than this are rendered as placeholders by
/// `Value::to_json`.
pub const MAX_JSON_DEPTH: usize = 64;

/// A class after definition: its own methods overlaid on a copy of its
/// parent's.
#[derive(Debug)]
pub struct ClassDef {
    pub name: String,
    pub parent: Option<String>,
    pub doc: Option<String>,
    pub methods: BTreeMap<String, Arc<FunctionDef>>,
    pub origin: Arc<str>,
}

impl ClassDef {
    pub fn method(&self, name: &str) -> Option<&Arc<FunctionDef>> {
        self.methods.get(name)
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }
}

#[derive(Debug)]
pub struct Instance {
    pub class: Arc<ClassDef>,
    fields: Mutex<BTreeMap<String, Value>>,
}

impl Instance {
    pub fn new(class: Arc<ClassDef>) -> Self {
        Self {
            class,
            fields: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn class_name(&self) -> &str {
        &self.class.name
    }

    pub fn field(&self, name: &str) -> Option<Value> {
        self.fields.lock().get(name).cloned()
    }

    pub fn set_field(&self, name: impl Into<String>, value: Value) {
        self.fields.lock().insert(name.into(), value);
    }

    pub fn fields(&self) -> BTreeMap<String, Value> {
        self.fields.lock().clone()
    }
}

#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Str(Arc<str>),
    List(Arc<Vec<Value>>),
    Map(Arc<BTreeMap<String, Value>>),
    Function(Arc<FunctionDef>),
    Class(Arc<ClassDef>),
    Instance(Arc<Instance>),
    BoundMethod {
        receiver: Arc<Instance>,
        method: Arc<FunctionDef>,
    },
    Builtin(Builtin),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Function(_) => "function",
            Value::Class(_) => "class",
            Value::Instance(_) => "instance",
            Value::BoundMethod { .. } => "method",
            Value::Builtin(_) => "builtin",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Map(entries) => !entries.is_empty(),
            _ => true,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_ref()),
            _ => None,
        }
    }

    /// Converts to JSON at the host boundary. Numbers always come back as
    /// floats; NaN and infinities become `null`. Callables are rendered as
    /// descriptive strings, as is an instance already being converted
    /// further up (`self.me = self`). Containers nested past
    /// `MAX_JSON_DEPTH` are cut off the same way.
    pub fn to_json(&self) -> serde_json::Value {
        self.to_json_within(&mut Vec::new())
    }

    fn to_json_within(&self, path: &mut Vec<*const Instance>) -> serde_json::Value {
        use serde_json::Value as Json;
        let deep = path.len() >= MAX_JSON_DEPTH;
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Str(s) => Json::String(s.to_string()),
            Value::List(_) if deep => Json::String("[...]".to_string()),
            Value::Map(_) if deep => Json::String("{...}".to_string()),
            Value::List(items) => {
                path.push(std::ptr::null());
                let json = items.iter().map(|v| v.to_json_within(path)).collect();
                path.pop();
                Json::Array(json)
            }
            Value::Map(entries) => {
                path.push(std::ptr::null());
                let json = entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json_within(path)))
                    .collect();
                path.pop();
                Json::Object(json)
            }
            Value::Instance(instance) => {
                let ptr = Arc::as_ptr(instance);
                if deep || path.contains(&ptr) {
                    return Json::String(self.to_string());
                }
                path.push(ptr);
                let json = instance
                    .fields()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json_within(path)))
                    .collect();
                path.pop();
                Json::Object(json)
            }
            other => Json::String(other.to_string()),
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Value {
        use serde_json::Value as Json;
        match value {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => n.as_f64().map(Value::Number).unwrap_or(Value::Null),
            Json::String(s) => Value::Str(Arc::from(s.as_str())),
            Json::Array(items) => Value::List(Arc::new(items.iter().map(Value::from_json).collect())),
            Json::Object(entries) => Value::Map(Arc::new(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            )),
        }
    }

    fn write_repr(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{:?}", s),
            other => write!(f, "{}", other),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            (Value::Class(a), Value::Class(b)) => Arc::ptr_eq(a, b),
            (Value::Instance(a), Value::Instance(b)) => Arc::ptr_eq(a, b),
            (
                Value::BoundMethod {
                    receiver: ra,
                    method: ma,
                },
                Value::BoundMethod {
                    receiver: rb,
                    method: mb,
                },
            ) => Arc::ptr_eq(ra, rb) && Arc::ptr_eq(ma, mb),
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            _ => false,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::Str(s) => f.write_str(s),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    item.write_repr(f)?;
                }
                f.write_str("]")
            }
            Value::Map(entries) => {
                f.write_str("{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{:?}: ", key)?;
                    value.write_repr(f)?;
                }
                f.write_str("}")
            }
            Value::Function(def) => write!(f, "<fn {}>", def.name),
            Value::Class(class) => write!(f, "<class {}>", class.name),
            Value::Instance(instance) => write!(f, "<{} instance>", instance.class_name()),
            Value::BoundMethod { receiver, method } => {
                write!(f, "<method {}.{}>", receiver.class_name(), method.name)
            }
            Value::Builtin(builtin) => write!(f, "<builtin {}>", builtin.name()),
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(Arc::from(value))
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(Arc::from(value))
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(Arc::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_conversion() {
        let value = Value::from_json(&json!({"u": 3, "tags": ["a", true, null]}));
        let Value::Map(entries) = &value else {
            panic!("expected map");
        };
        assert_eq!(entries["u"], Value::Number(3.0));
        assert_eq!(value.to_json(), json!({"u": 3.0, "tags": ["a", true, null]}));
    }

    #[test]
    fn test_non_finite_numbers_become_null() {
        assert_eq!(Value::Number(f64::NAN).to_json(), serde_json::Value::Null);
        assert_eq!(Value::Number(f64::INFINITY).to_json(), serde_json::Value::Null);
    }

    fn class(name: &str) -> Arc<ClassDef> {
        Arc::new(ClassDef {
            name: name.to_string(),
            parent: None,
            doc: None,
            methods: BTreeMap::new(),
            origin: Arc::from("test.strata"),
        })
    }

    #[test]
    fn test_self_referencing_instance_to_json() {
        let instance = Arc::new(Instance::new(class("Loop")));
        instance.set_field("n", Value::from(1.0));
        instance.set_field("me", Value::Instance(instance.clone()));
        assert_eq!(
            Value::Instance(instance.clone()).to_json(),
            json!({"me": "<Loop instance>", "n": 1.0})
        );
        // break the cycle so the test does not leak
        instance.set_field("me", Value::Null);
    }

    #[test]
    fn test_shared_instance_renders_twice() {
        let leaf = Value::Instance(Arc::new(Instance::new(class("Leaf"))));
        if let Value::Instance(inner) = &leaf {
            inner.set_field("v", Value::from(2.0));
        }
        let pair = Value::from(vec![leaf.clone(), leaf]);
        assert_eq!(pair.to_json(), json!([{"v": 2.0}, {"v": 2.0}]));
    }

    #[test]
    fn test_deep_nesting_is_cut_off() {
        let mut value = Value::from(1.0);
        for _ in 0..1_000 {
            value = Value::from(vec![value]);
        }
        let mut json = value.to_json();
        let mut depth = 0;
        while let serde_json::Value::Array(mut items) = json {
            json = items.remove(0);
            depth += 1;
        }
        assert_eq!(depth, MAX_JSON_DEPTH);
        assert_eq!(json, json!("[...]"));
    }

    #[test]
    fn test_display() {
        let list = Value::from(vec![Value::from(1.0), Value::from("x"), Value::Null]);
        assert_eq!(list.to_string(), "[1, \"x\", null]");
        assert_eq!(Value::from(2.5).to_string(), "2.5");
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.truthy());
        assert!(!Value::from(0.0).truthy());
        assert!(!Value::from("").truthy());
        assert!(Value::from("x").truthy());
        assert!(!Value::from(Vec::new()).truthy());
    }
}
