use strata_core::ScriptError;

use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Sqrt,
    Abs,
    Min,
    Max,
    Pow,
    Exp,
    Ln,
    Floor,
    Round,
    Len,
    Str,
}

impl Builtin {
    pub fn from_name(name: &str) -> Option<Self> {
        let builtin = match name {
            "sqrt" => Builtin::Sqrt,
            "abs" => Builtin::Abs,
            "min" => Builtin::Min,
            "max" => Builtin::Max,
            "pow" => Builtin::Pow,
            "exp" => Builtin::Exp,
            "ln" => Builtin::Ln,
            "floor" => Builtin::Floor,
            "round" => Builtin::Round,
            "len" => Builtin::Len,
            "str" => Builtin::Str,
            _ => return None,
        };
        Some(builtin)
    }

    pub fn name(self) -> &'static str {
        match self {
            Builtin::Sqrt => "sqrt",
            Builtin::Abs => "abs",
            Builtin::Min => "min",
            Builtin::Max => "max",
            Builtin::Pow => "pow",
            Builtin::Exp => "exp",
            Builtin::Ln => "ln",
            Builtin::Floor => "floor",
            Builtin::Round => "round",
            Builtin::Len => "len",
            Builtin::Str => "str",
        }
    }

    pub fn call(self, args: &[Value]) -> Result<Value, ScriptError> {
        match self {
            Builtin::Sqrt => self.unary_math(args, f64::sqrt),
            Builtin::Abs => self.unary_math(args, f64::abs),
            Builtin::Exp => self.unary_math(args, f64::exp),
            Builtin::Ln => self.unary_math(args, f64::ln),
            Builtin::Floor => self.unary_math(args, f64::floor),
            Builtin::Pow => {
                self.expect_args(args, 2, 2)?;
                let base = self.number(&args[0])?;
                let exponent = self.number(&args[1])?;
                Ok(Value::Number(base.powf(exponent)))
            }
            Builtin::Round => {
                self.expect_args(args, 1, 2)?;
                let x = self.number(&args[0])?;
                let digits = match args.get(1) {
                    Some(d) => self.number(d)?,
                    None => 0.0,
                };
                let scale = 10f64.powi(digits as i32);
                Ok(Value::Number((x * scale).round() / scale))
            }
            Builtin::Min | Builtin::Max => self.extremum(args),
            Builtin::Len => {
                self.expect_args(args, 1, 1)?;
                let len = match &args[0] {
                    Value::Str(s) => s.chars().count(),
                    Value::List(items) => items.len(),
                    Value::Map(entries) => entries.len(),
                    other => {
                        return Err(ScriptError::type_error(format!(
                            "object of type {} has no len()",
                            other.type_name()
                        )))
                    }
                };
                Ok(Value::Number(len as f64))
            }
            Builtin::Str => {
                self.expect_args(args, 1, 1)?;
                Ok(Value::from(args[0].to_string()))
            }
        }
    }

    fn unary_math(self, args: &[Value], op: fn(f64) -> f64) -> Result<Value, ScriptError> {
        self.expect_args(args, 1, 1)?;
        Ok(Value::Number(op(self.number(&args[0])?)))
    }

    fn extremum(self, args: &[Value]) -> Result<Value, ScriptError> {
        let items: Vec<Value> = match args {
            [Value::List(items)] => (**items).clone(),
            _ => args.to_vec(),
        };
        if items.is_empty() {
            return Err(ScriptError::arity(format!(
                "{}() expects at least one value",
                self.name()
            )));
        }
        let mut best = self.number(&items[0])?;
        for item in &items[1..] {
            let n = self.number(item)?;
            let better = match self {
                Builtin::Min => n < best,
                _ => n > best,
            };
            if better {
                best = n;
            }
        }
        Ok(Value::Number(best))
    }

    fn expect_args(self, args: &[Value], min: usize, max: usize) -> Result<(), ScriptError> {
        if args.len() < min || args.len() > max {
            let expected = if min == max {
                min.to_string()
            } else {
                format!("{min} to {max}")
            };
            return Err(ScriptError::arity(format!(
                "{}() takes {} arguments but {} were given",
                self.name(),
                expected,
                args.len()
            )));
        }
        Ok(())
    }

    fn number(self, value: &Value) -> Result<f64, ScriptError> {
        value.as_number().ok_or_else(|| {
            ScriptError::type_error(format!(
                "{}() expects a number, got {}",
                self.name(),
                value.type_name()
            ))
        })
    }
}
