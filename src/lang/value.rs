use std::rc::Rc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::bytecode::op::Instructions;
use crate::runtime::builtins::Builtin;

/// Runtime value in the Cinder language.
///
/// Values are the only data that can live on the operand stack, in the
/// global slots, or in the constant pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// 64-bit signed integer.
    Integer(i64),

    /// UTF-8 string value.
    String(Rc<str>),

    /// Boolean value.
    Boolean(bool),

    /// The null value.
    Null,

    /// Array literal value: `[1, 2, 3]`.
    Array(Rc<Vec<Value>>),

    /// Hash literal value: `{1: 2}`. Iteration follows insertion order.
    Hash(Rc<IndexMap<HashKey, Value>>),

    /// An error produced by a builtin. Errors are ordinary values; they do
    /// not abort the run.
    Error(Rc<str>),

    /// A function body compiled to bytecode, as stored in the constant pool.
    CompiledFunction(Rc<CompiledFunction>),

    /// A compiled function together with its captured free variables.
    Closure(Rc<Closure>),

    /// Handle to a host-provided builtin function.
    Builtin(Builtin),
}

/// Immutable result of compiling one function literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledFunction {
    pub instructions: Instructions,
    /// Number of local slots, parameters included.
    pub num_locals: usize,
    pub num_parameters: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Closure {
    pub function: Rc<CompiledFunction>,
    /// Snapshot of the captured values, in the order the body resolved them.
    pub free: Vec<Value>,
}

/// Type-tagged key of a hash entry. Only integers, strings and booleans are
/// hashable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashKey {
    Integer(i64),
    String(Rc<str>),
    Boolean(bool),
}

impl HashKey {
    /// Rebuild the value this key was computed from.
    pub fn to_value(&self) -> Value {
        match self {
            HashKey::Integer(n) => Value::Integer(*n),
            HashKey::String(s) => Value::String(s.clone()),
            HashKey::Boolean(b) => Value::Boolean(*b),
        }
    }
}

impl Value {
    pub fn string(s: impl AsRef<str>) -> Self {
        Value::String(Rc::from(s.as_ref()))
    }

    pub fn error(message: impl AsRef<str>) -> Self {
        Value::Error(Rc::from(message.as_ref()))
    }

    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Rc::new(items))
    }

    /// Name of the value's type, as used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Integer(_) => "INTEGER",
            Value::String(_) => "STRING",
            Value::Boolean(_) => "BOOLEAN",
            Value::Null => "NULL",
            Value::Array(_) => "ARRAY",
            Value::Hash(_) => "HASH",
            Value::Error(_) => "ERROR",
            Value::CompiledFunction(_) => "COMPILED_FUNCTION",
            Value::Closure(_) => "CLOSURE",
            Value::Builtin(_) => "BUILTIN",
        }
    }

    /// `false` and null are falsy; every other value, `0` included, is truthy.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Boolean(false) | Value::Null)
    }

    /// The hash key for this value, or `None` if the type is not hashable.
    pub fn hash_key(&self) -> Option<HashKey> {
        match self {
            Value::Integer(n) => Some(HashKey::Integer(*n)),
            Value::String(s) => Some(HashKey::String(s.clone())),
            Value::Boolean(b) => Some(HashKey::Boolean(*b)),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    /// Format a value the way `print` shows it.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Integer(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{}", s),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Null => write!(f, "null"),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", Nested(item))?;
                }
                write!(f, "]")
            }
            Value::Hash(pairs) => {
                write!(f, "{{")?;
                for (i, (key, value)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", Nested(&key.to_value()), Nested(value))?;
                }
                write!(f, "}}")
            }
            Value::Error(message) => write!(f, "ERROR: {}", message),
            Value::CompiledFunction(function) => {
                write!(f, "<compiled function/{}>", function.num_parameters)
            }
            Value::Closure(closure) => write!(f, "<closure/{}>", closure.function.num_parameters),
            Value::Builtin(builtin) => write!(f, "<builtin {}>", builtin.name()),
        }
    }
}

/// Strings nested in arrays and hashes are shown quoted.
struct Nested<'a>(&'a Value);

impl std::fmt::Display for Nested<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Value::String(s) => write!(f, "{:?}", s),
            other => write!(f, "{}", other),
        }
    }
}
