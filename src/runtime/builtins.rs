use std::io::Write;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::lang::value::Value;

/// Host functions addressable by `LOAD_BUILTIN <index>`.
///
/// The discriminant is the builtin's index; the order is fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Builtin {
    Len,
    First,
    Last,
    Rest,
    Push,
    Print,
}

impl Builtin {
    pub const ALL: [Builtin; 6] = [
        Builtin::Len,
        Builtin::First,
        Builtin::Last,
        Builtin::Rest,
        Builtin::Push,
        Builtin::Print,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Builtin> {
        Self::ALL.get(index).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Builtin::Len => "len",
            Builtin::First => "first",
            Builtin::Last => "last",
            Builtin::Rest => "rest",
            Builtin::Push => "push",
            Builtin::Print => "print",
        }
    }

    fn arity(self) -> usize {
        match self {
            Builtin::Push => 2,
            _ => 1,
        }
    }

    /// Invoke the builtin. Misuse yields an error value, never a fault.
    ///
    /// `print` writes to `out`.
    pub fn call(self, args: &[Value], out: &mut dyn Write) -> Value {
        if args.len() != self.arity() {
            return Value::error(format!(
                "wrong number of arguments to `{}`. got={}, want={}",
                self.name(),
                args.len(),
                self.arity()
            ));
        }

        match self {
            Builtin::Len => match &args[0] {
                Value::String(s) => Value::Integer(s.chars().count() as i64),
                Value::Array(items) => Value::Integer(items.len() as i64),
                other => unsupported(self, other),
            },

            Builtin::First => match &args[0] {
                Value::Array(items) => items.first().cloned().unwrap_or(Value::Null),
                other => unsupported(self, other),
            },

            Builtin::Last => match &args[0] {
                Value::Array(items) => items.last().cloned().unwrap_or(Value::Null),
                other => unsupported(self, other),
            },

            Builtin::Rest => match &args[0] {
                Value::Array(items) if items.is_empty() => Value::Null,
                Value::Array(items) => Value::array(items[1..].to_vec()),
                other => unsupported(self, other),
            },

            Builtin::Push => match &args[0] {
                Value::Array(items) => {
                    let mut pushed = Vec::with_capacity(items.len() + 1);
                    pushed.extend(items.iter().cloned());
                    pushed.push(args[1].clone());
                    Value::Array(Rc::new(pushed))
                }
                other => unsupported(self, other),
            },

            Builtin::Print => match writeln!(out, "{}", args[0]) {
                Ok(()) => Value::Null,
                Err(e) => Value::error(format!("print failed: {}", e)),
            },
        }
    }
}

fn unsupported(builtin: Builtin, arg: &Value) -> Value {
    Value::error(format!(
        "argument to `{}` not supported, got {}",
        builtin.name(),
        arg.type_name()
    ))
}
