use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use strata_core::{ScriptError, ScriptErrorKind, TraceFrame};

use crate::ast::*;
use crate::builtins::Builtin;
use crate::namespace::{Namespace, Provenance, Symbol};
use crate::value::{ClassDef, Instance, Value};

enum Flow {
    Normal,
    Return(Value),
}

#[derive(Default)]
struct Frame {
    locals: HashMap<String, Value>,
}

impl Frame {
    fn with_receiver(receiver: Option<Arc<Instance>>) -> Self {
        let mut frame = Frame::default();
        if let Some(receiver) = receiver {
            frame
                .locals
                .insert("self".to_string(), Value::Instance(receiver));
        }
        frame
    }
}

/// Evaluates code against a read-only view of a module namespace. Globals
/// are looked up at call time, so functions see whatever the final merged
/// namespace binds.
pub(crate) struct Interpreter<'g> {
    globals: &'g Namespace,
    depth: usize,
    max_depth: usize,
    line: usize,
}

impl<'g> Interpreter<'g> {
    pub(crate) fn new(globals: &'g Namespace, max_depth: usize) -> Self {
        Self {
            globals,
            depth: 0,
            max_depth,
            line: 0,
        }
    }

    pub(crate) fn eval_global(&mut self, expr: &Expr) -> Result<Value, ScriptError> {
        self.eval(expr, &mut Frame::default())
    }

    pub(crate) fn assign_global_attr(
        &mut self,
        object: &Expr,
        name: &str,
        value: Value,
    ) -> Result<(), ScriptError> {
        let target = self.eval(object, &mut Frame::default())?;
        set_attr(&target, name, value)
    }

    pub(crate) fn call(
        &mut self,
        callee: Value,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, ScriptError> {
        match callee {
            Value::Function(def) => self.call_function(&def, None, args, kwargs),
            Value::BoundMethod { receiver, method } => {
                self.call_function(&method, Some(receiver), args, kwargs)
            }
            Value::Class(class) => self
                .construct(&class, args, kwargs)
                .map(Value::Instance),
            Value::Builtin(builtin) => {
                if !kwargs.is_empty() {
                    return Err(ScriptError::arity(format!(
                        "{}() does not take keyword arguments",
                        builtin.name()
                    )));
                }
                builtin.call(&args)
            }
            other => Err(ScriptError::type_error(format!(
                "{} value is not callable",
                other.type_name()
            ))),
        }
    }

    pub(crate) fn construct(
        &mut self,
        class: &Arc<ClassDef>,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Arc<Instance>, ScriptError> {
        let instance = Arc::new(Instance::new(class.clone()));
        match class.method("init") {
            Some(init) => {
                let init = init.clone();
                self.call_function(&init, Some(instance.clone()), args, kwargs)?;
            }
            None if !args.is_empty() || !kwargs.is_empty() => {
                return Err(ScriptError::arity(format!(
                    "{}() takes no arguments",
                    class.name
                )));
            }
            None => {}
        }
        Ok(instance)
    }

    pub(crate) fn call_function(
        &mut self,
        def: &Arc<FunctionDef>,
        receiver: Option<Arc<Instance>>,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, ScriptError> {
        let qualified = match &receiver {
            Some(r) => format!("{}.{}", r.class_name(), def.name),
            None => def.name.clone(),
        };
        if self.depth >= self.max_depth {
            return Err(ScriptError::new(
                ScriptErrorKind::Recursion,
                format!("maximum call depth {} exceeded", self.max_depth),
            ));
        }

        let mut frame = Frame::with_receiver(receiver);
        self.bind_arguments(def, &qualified, &mut frame, args, kwargs)?;

        let saved_line = self.line;
        self.line = def.line;
        self.depth += 1;
        let result = self.exec_block(&def.body, &mut frame);
        self.depth -= 1;
        let failed_line = self.line;
        self.line = saved_line;

        match result {
            Ok(Flow::Return(value)) => Ok(value),
            Ok(Flow::Normal) => Ok(Value::Null),
            Err(err) => Err(err.with_frame(TraceFrame {
                origin: def.origin.to_string(),
                line: failed_line,
                function: Some(qualified),
            })),
        }
    }

    fn bind_arguments(
        &mut self,
        def: &FunctionDef,
        qualified: &str,
        frame: &mut Frame,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<(), ScriptError> {
        if args.len() > def.params.len() {
            return Err(ScriptError::arity(format!(
                "{}() takes {} positional arguments but {} were given",
                qualified,
                def.params.len(),
                args.len()
            )));
        }
        let mut bound: HashMap<&str, Value> = HashMap::new();
        for (param, arg) in def.params.iter().zip(args) {
            bound.insert(param.name.as_str(), arg);
        }
        for (key, value) in kwargs {
            let Some(param) = def.params.iter().find(|p| p.name == key) else {
                return Err(ScriptError::arity(format!(
                    "{}() got an unexpected keyword argument '{}'",
                    qualified, key
                )));
            };
            if bound.insert(param.name.as_str(), value).is_some() {
                return Err(ScriptError::arity(format!(
                    "{}() got multiple values for argument '{}'",
                    qualified, key
                )));
            }
        }
        for param in &def.params {
            let value = match bound.remove(param.name.as_str()) {
                Some(value) => value,
                None => match &param.default {
                    Some(default) => self.eval(default, &mut Frame::default())?,
                    None => {
                        return Err(ScriptError::arity(format!(
                            "{}() missing required argument '{}'",
                            qualified, param.name
                        )))
                    }
                },
            };
            frame.locals.insert(param.name.clone(), value);
        }
        Ok(())
    }

    fn exec_block(&mut self, stmts: &[Stmt], frame: &mut Frame) -> Result<Flow, ScriptError> {
        for stmt in stmts {
            if let Flow::Return(value) = self.exec(stmt, frame)? {
                return Ok(Flow::Return(value));
            }
        }
        Ok(Flow::Normal)
    }

    fn exec(&mut self, stmt: &Stmt, frame: &mut Frame) -> Result<Flow, ScriptError> {
        self.line = stmt.line;
        match &stmt.kind {
            StmtKind::Let { name, value } => {
                let value = self.eval(value, frame)?;
                frame.locals.insert(name.clone(), value);
            }
            StmtKind::Assign { target, value } => {
                let value = self.eval(value, frame)?;
                match target {
                    AssignTarget::Name(name) => {
                        frame.locals.insert(name.clone(), value);
                    }
                    AssignTarget::Attr { object, name } => {
                        let object = self.eval(object, frame)?;
                        set_attr(&object, name, value)?;
                    }
                }
            }
            StmtKind::Fn(def) => {
                frame
                    .locals
                    .insert(def.name.clone(), Value::Function(def.clone()));
            }
            StmtKind::Class(_) => {
                return Err(ScriptError::syntax(
                    "classes can only be defined at module level",
                ))
            }
            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr, frame)?,
                    None => Value::Null,
                };
                return Ok(Flow::Return(value));
            }
            StmtKind::Raise(expr) => {
                let value = self.eval(expr, frame)?;
                return Err(raised(&value));
            }
            StmtKind::If {
                cond,
                then,
                otherwise,
            } => {
                let branch = if self.eval(cond, frame)?.truthy() {
                    then
                } else {
                    otherwise
                };
                return self.exec_block(branch, frame);
            }
            StmtKind::For { var, iter, body } => {
                let items = iterable(&self.eval(iter, frame)?)?;
                for item in items {
                    frame.locals.insert(var.clone(), item);
                    if let Flow::Return(value) = self.exec_block(body, frame)? {
                        return Ok(Flow::Return(value));
                    }
                }
            }
            StmtKind::Expr(expr) => {
                self.eval(expr, frame)?;
            }
        }
        Ok(Flow::Normal)
    }

    fn eval(&mut self, expr: &Expr, frame: &mut Frame) -> Result<Value, ScriptError> {
        match expr {
            Expr::Literal(literal) => Ok(match literal {
                Literal::Null => Value::Null,
                Literal::Bool(b) => Value::Bool(*b),
                Literal::Number(n) => Value::Number(*n),
                Literal::Str(s) => Value::Str(s.clone()),
            }),
            Expr::Ident(name) => self.lookup(name, frame),
            Expr::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item, frame)?);
                }
                Ok(Value::from(values))
            }
            Expr::Unary(op, operand) => {
                let value = self.eval(operand, frame)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!value.truthy())),
                    UnaryOp::Neg => match value {
                        Value::Number(n) => Ok(Value::Number(-n)),
                        other => Err(ScriptError::type_error(format!(
                            "bad operand type for unary -: {}",
                            other.type_name()
                        ))),
                    },
                }
            }
            Expr::Binary(BinaryOp::And, left, right) => {
                if !self.eval(left, frame)?.truthy() {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(self.eval(right, frame)?.truthy()))
            }
            Expr::Binary(BinaryOp::Or, left, right) => {
                if self.eval(left, frame)?.truthy() {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(self.eval(right, frame)?.truthy()))
            }
            Expr::Binary(op, left, right) => {
                let left = self.eval(left, frame)?;
                let right = self.eval(right, frame)?;
                binary(*op, left, right)
            }
            Expr::Call {
                callee,
                args,
                kwargs,
            } => {
                let callee = self.eval(callee, frame)?;
                let mut arg_values = Vec::with_capacity(args.len());
                for arg in args {
                    arg_values.push(self.eval(arg, frame)?);
                }
                let mut kwarg_values = Vec::with_capacity(kwargs.len());
                for (key, arg) in kwargs {
                    kwarg_values.push((key.clone(), self.eval(arg, frame)?));
                }
                self.call(callee, arg_values, kwarg_values)
            }
            Expr::Attr { object, name } => {
                let object = self.eval(object, frame)?;
                get_attr(&object, name)
            }
            Expr::Index { object, index } => {
                let object = self.eval(object, frame)?;
                let index = self.eval(index, frame)?;
                get_index(&object, &index)
            }
        }
    }

    fn lookup(&self, name: &str, frame: &Frame) -> Result<Value, ScriptError> {
        if let Some(value) = frame.locals.get(name) {
            return Ok(value.clone());
        }
        if let Some(value) = self.globals.value(name) {
            return Ok(value);
        }
        if let Some(builtin) = Builtin::from_name(name) {
            return Ok(Value::Builtin(builtin));
        }
        Err(ScriptError::name(format!("name '{}' is not defined", name)))
    }
}

/// Runs a unit's top-level statements, binding into the shared namespace.
pub(crate) struct ModuleExecutor<'n> {
    namespace: &'n mut Namespace,
    provenance: Provenance,
    max_depth: usize,
    line: usize,
}

impl<'n> ModuleExecutor<'n> {
    pub(crate) fn new(namespace: &'n mut Namespace, provenance: Provenance, max_depth: usize) -> Self {
        Self {
            namespace,
            provenance,
            max_depth,
            line: 0,
        }
    }

    pub(crate) fn run(&mut self, program: &Program) -> Result<(), ScriptError> {
        self.exec_all(&program.body).map_err(|err| {
            err.with_frame(TraceFrame {
                origin: program.origin.to_string(),
                line: self.line,
                function: None,
            })
        })
    }

    fn exec_all(&mut self, stmts: &[Stmt]) -> Result<(), ScriptError> {
        for stmt in stmts {
            self.exec(stmt)?;
        }
        Ok(())
    }

    fn eval(&self, expr: &Expr) -> Result<Value, ScriptError> {
        Interpreter::new(&*self.namespace, self.max_depth).eval_global(expr)
    }

    fn bind(&mut self, name: &str, symbol: Symbol) {
        self.namespace
            .bind(name, symbol, self.provenance.clone());
    }

    fn exec(&mut self, stmt: &Stmt) -> Result<(), ScriptError> {
        self.line = stmt.line;
        match &stmt.kind {
            StmtKind::Let { name, value }
            | StmtKind::Assign {
                target: AssignTarget::Name(name),
                value,
            } => {
                let value = self.eval(value)?;
                self.bind(name, Symbol::from_value(value));
            }
            StmtKind::Assign {
                target: AssignTarget::Attr { object, name },
                value,
            } => {
                let value = self.eval(value)?;
                Interpreter::new(&*self.namespace, self.max_depth)
                    .assign_global_attr(object, name, value)?;
            }
            StmtKind::Fn(def) => self.bind(&def.name, Symbol::Function(def.clone())),
            StmtKind::Class(decl) => {
                let class = self.define_class(decl)?;
                self.bind(&decl.name, Symbol::Class(Arc::new(class)));
            }
            StmtKind::Return(_) => {
                return Err(ScriptError::syntax("'return' outside function"));
            }
            StmtKind::Raise(expr) => {
                let value = self.eval(expr)?;
                return Err(raised(&value));
            }
            StmtKind::If {
                cond,
                then,
                otherwise,
            } => {
                if self.eval(cond)?.truthy() {
                    self.exec_all(then)?;
                } else {
                    self.exec_all(otherwise)?;
                }
            }
            StmtKind::For { var, iter, body } => {
                for item in iterable(&self.eval(iter)?)? {
                    self.bind(var, Symbol::from_value(item));
                    self.exec_all(body)?;
                }
            }
            StmtKind::Expr(expr) => {
                self.eval(expr)?;
            }
        }
        Ok(())
    }

    fn define_class(&self, decl: &ClassDecl) -> Result<ClassDef, ScriptError> {
        let mut methods: BTreeMap<String, Arc<FunctionDef>> = BTreeMap::new();
        if let Some(parent) = &decl.parent {
            match self.namespace.get(parent).map(|b| &b.symbol) {
                Some(Symbol::Class(base)) => {
                    methods.extend(base.methods.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                Some(other) => {
                    return Err(ScriptError::type_error(format!(
                        "cannot inherit from {} '{}'",
                        other.kind(),
                        parent
                    )))
                }
                None => {
                    return Err(ScriptError::name(format!(
                        "parent class '{}' of '{}' is not defined",
                        parent, decl.name
                    )))
                }
            }
        }
        for method in &decl.methods {
            methods.insert(method.name.clone(), method.clone());
        }
        Ok(ClassDef {
            name: decl.name.clone(),
            parent: decl.parent.clone(),
            doc: decl.doc.clone(),
            methods,
            origin: self.provenance.origin.clone(),
        })
    }
}

fn raised(value: &Value) -> ScriptError {
    ScriptError::new(ScriptErrorKind::Raised, value.to_string())
}

fn iterable(value: &Value) -> Result<Vec<Value>, ScriptError> {
    match value {
        Value::List(items) => Ok((**items).clone()),
        Value::Map(entries) => Ok(entries.keys().map(|k| Value::from(k.as_str())).collect()),
        Value::Str(s) => Ok(s.chars().map(|c| Value::from(c.to_string())).collect()),
        other => Err(ScriptError::type_error(format!(
            "{} value is not iterable",
            other.type_name()
        ))),
    }
}

fn get_attr(object: &Value, name: &str) -> Result<Value, ScriptError> {
    match object {
        Value::Instance(instance) => {
            if let Some(value) = instance.field(name) {
                return Ok(value);
            }
            match instance.class.method(name) {
                Some(method) => Ok(Value::BoundMethod {
                    receiver: instance.clone(),
                    method: method.clone(),
                }),
                None => Err(ScriptError::attribute(format!(
                    "'{}' instance has no attribute '{}'",
                    instance.class_name(),
                    name
                ))),
            }
        }
        Value::Map(entries) => entries.get(name).cloned().ok_or_else(|| {
            ScriptError::attribute(format!("map has no key '{}'", name))
        }),
        other => Err(ScriptError::attribute(format!(
            "{} value has no attribute '{}'",
            other.type_name(),
            name
        ))),
    }
}

fn set_attr(object: &Value, name: &str, value: Value) -> Result<(), ScriptError> {
    match object {
        Value::Instance(instance) => {
            instance.set_field(name, value);
            Ok(())
        }
        other => Err(ScriptError::attribute(format!(
            "cannot set attribute '{}' on {} value",
            name,
            other.type_name()
        ))),
    }
}

fn get_index(object: &Value, index: &Value) -> Result<Value, ScriptError> {
    match (object, index) {
        (Value::List(items), Value::Number(n)) => {
            let idx = list_index(*n, items.len())?;
            Ok(items[idx].clone())
        }
        (Value::Str(s), Value::Number(n)) => {
            let chars: Vec<char> = s.chars().collect();
            let idx = list_index(*n, chars.len())?;
            Ok(Value::from(chars[idx].to_string()))
        }
        (Value::Map(entries), Value::Str(key)) => entries
            .get(&**key)
            .cloned()
            .ok_or_else(|| ScriptError::index(format!("key {:?} not found", &**key))),
        (object, index) => Err(ScriptError::type_error(format!(
            "{} value cannot be indexed by {}",
            object.type_name(),
            index.type_name()
        ))),
    }
}

fn list_index(n: f64, len: usize) -> Result<usize, ScriptError> {
    if n.fract() != 0.0 {
        return Err(ScriptError::type_error(format!(
            "index must be an integer, got {}",
            n
        )));
    }
    let idx = if n < 0.0 { len as f64 + n } else { n };
    if idx < 0.0 || idx >= len as f64 {
        return Err(ScriptError::index(format!(
            "index {} out of range for length {}",
            n, len
        )));
    }
    Ok(idx as usize)
}

fn binary(op: BinaryOp, left: Value, right: Value) -> Result<Value, ScriptError> {
    use BinaryOp::*;
    match op {
        Eq => return Ok(Value::Bool(left == right)),
        NotEq => return Ok(Value::Bool(left != right)),
        _ => {}
    }
    match (op, &left, &right) {
        (Add, Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
        (Add, Value::Str(a), Value::Str(b)) => Ok(Value::from(format!("{}{}", a, b))),
        (Add, Value::List(a), Value::List(b)) => {
            let mut items = (**a).clone();
            items.extend(b.iter().cloned());
            Ok(Value::from(items))
        }
        (Sub, Value::Number(a), Value::Number(b)) => Ok(Value::Number(a - b)),
        (Mul, Value::Number(a), Value::Number(b)) => Ok(Value::Number(a * b)),
        (Div | Rem, Value::Number(_), Value::Number(b)) if *b == 0.0 => Err(ScriptError::new(
            ScriptErrorKind::ZeroDivision,
            "division by zero",
        )),
        (Div, Value::Number(a), Value::Number(b)) => Ok(Value::Number(a / b)),
        (Rem, Value::Number(a), Value::Number(b)) => Ok(Value::Number(a.rem_euclid(*b))),
        (Lt | Le | Gt | Ge, Value::Number(a), Value::Number(b)) => {
            Ok(Value::Bool(compare(op, a.partial_cmp(b))))
        }
        (Lt | Le | Gt | Ge, Value::Str(a), Value::Str(b)) => {
            Ok(Value::Bool(compare(op, a.partial_cmp(b))))
        }
        _ => Err(ScriptError::type_error(format!(
            "unsupported operand types for {}: {} and {}",
            symbol(op),
            left.type_name(),
            right.type_name()
        ))),
    }
}

fn compare(op: BinaryOp, ordering: Option<std::cmp::Ordering>) -> bool {
    use std::cmp::Ordering::*;
    match (op, ordering) {
        (_, None) => false,
        (BinaryOp::Lt, Some(o)) => o == Less,
        (BinaryOp::Le, Some(o)) => o != Greater,
        (BinaryOp::Gt, Some(o)) => o == Greater,
        (BinaryOp::Ge, Some(o)) => o != Less,
        _ => false,
    }
}

fn symbol(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::Rem => "%",
        BinaryOp::Eq => "==",
        BinaryOp::NotEq => "!=",
        BinaryOp::Lt => "<",
        BinaryOp::Le => "<=",
        BinaryOp::Gt => ">",
        BinaryOp::Ge => ">=",
        BinaryOp::And => "&&",
        BinaryOp::Or => "||",
    }
}
