use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// Compile-time literal value.
///
/// Values appear as literal operands (`putobject`, `duparray`, dispatch map
/// keys) and in the output literal pool. Floats compare by bit pattern so a
/// value can key a hash map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Nil,
    True,
    False,

    /// 64-bit signed integer.
    Integer(i64),

    /// 64-bit floating-point number.
    Float(f64),

    /// Interned name: `:foo`.
    Symbol(String),

    /// String literal. Only frozen strings become `Value`s.
    String(String),

    /// Integer range literal: `1..5`, `1...5`.
    Range {
        low: i64,
        high: i64,
        exclusive: bool,
    },

    /// Array made only of static literals: `[1, :a, "s"]`.
    Array(Vec<Value>),
}

impl Value {
    /// `false` and `nil` are the only falsy values.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::False)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::True => "true",
            Value::False => "false",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Symbol(_) => "symbol",
            Value::String(_) => "string",
            Value::Range { .. } => "range",
            Value::Array(_) => "array",
        }
    }

    /// Key used by `opt_case_dispatch`.
    ///
    /// Integral floats are folded to integers so `when 1.0` and `when 1`
    /// share a slot. Ranges and arrays are not dispatchable.
    pub fn case_dispatch_key(&self) -> Option<Value> {
        match self {
            Value::Float(f) if f.fract() == 0.0 && f.is_finite() => {
                if *f >= i64::MIN as f64 && *f <= i64::MAX as f64 {
                    Some(Value::Integer(*f as i64))
                } else {
                    Some(self.clone())
                }
            }
            Value::Nil
            | Value::True
            | Value::False
            | Value::Integer(_)
            | Value::Float(_)
            | Value::Symbol(_)
            | Value::String(_) => Some(self.clone()),
            Value::Range { .. } | Value::Array(_) => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::True, Value::True) => true,
            (Value::False, Value::False) => true,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (
                Value::Range {
                    low: a,
                    high: b,
                    exclusive: c,
                },
                Value::Range {
                    low: x,
                    high: y,
                    exclusive: z,
                },
            ) => a == x && b == y && c == z,
            (Value::Array(a), Value::Array(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Nil | Value::True | Value::False => {}
            Value::Integer(n) => n.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::Symbol(s) | Value::String(s) => s.hash(state),
            Value::Range {
                low,
                high,
                exclusive,
            } => {
                low.hash(state);
                high.hash(state);
                exclusive.hash(state);
            }
            Value::Array(items) => items.hash(state),
        }
    }
}

impl std::fmt::Display for Value {
    /// Format a value using source syntax.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::True => write!(f, "true"),
            Value::False => write!(f, "false"),
            Value::Integer(n) => write!(f, "{}", n),
            Value::Float(n) => write!(f, "{:?}", n),
            Value::Symbol(s) => write!(f, ":{}", s),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Range {
                low,
                high,
                exclusive,
            } => write!(f, "{}{}{}", low, if *exclusive { "..." } else { ".." }, high),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}
