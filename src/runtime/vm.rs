use std::io::{self, Write};
use std::rc::Rc;

use indexmap::IndexMap;

use crate::bytecode::ir::Bytecode;
use crate::bytecode::op::{Opcode, decode};
use crate::bytecode::verify::{VerifyError, verify_program};
use crate::lang::value::{Closure, CompiledFunction, Value};
use crate::runtime::builtins::Builtin;
use crate::runtime::frame::Frame;
use crate::runtime::runtime_error::RuntimeError;

/// Number of addressable global slots (the range of a u16 operand).
pub const GLOBALS_SIZE: usize = 65536;

#[derive(Debug, Clone)]
pub struct VmConfig {
    pub max_stack_size: usize,
    pub max_frames: usize,
    /// Print every executed instruction to stderr.
    pub trace: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_stack_size: 2048,
            max_frames: 1024,
            trace: false,
        }
    }
}

/// Stack machine executing one compiled [`Bytecode`] unit.
///
/// `sp` always points at the next free slot; `stack[sp - 1]` is the top.
/// Slots at and above `sp` keep their old contents, so the value most
/// recently popped is still readable at `stack[sp]`.
pub struct Vm {
    constants: Vec<Value>,
    stack: Vec<Value>,
    sp: usize,
    /// Always `GLOBALS_SIZE` slots, indexed directly by a u16 operand.
    globals: Vec<Value>,
    frames: Vec<Frame>,
    config: VmConfig,
    out: Box<dyn Write>,
}

/// A fresh global slot array.
pub fn new_globals() -> Vec<Value> {
    vec![Value::Null; GLOBALS_SIZE]
}

impl Vm {
    #[cfg(test)]
    pub fn new(bytecode: Bytecode) -> Self {
        Self::with_config(bytecode, VmConfig::default())
    }

    pub fn with_config(bytecode: Bytecode, config: VmConfig) -> Self {
        Self::new_with_globals(bytecode, config, new_globals())
    }

    /// Resume with the globals of a previous run.
    pub fn new_with_globals(bytecode: Bytecode, config: VmConfig, mut globals: Vec<Value>) -> Self {
        globals.resize(GLOBALS_SIZE, Value::Null);

        let main = Rc::new(Closure {
            function: Rc::new(CompiledFunction {
                instructions: bytecode.instructions,
                num_locals: 0,
                num_parameters: 0,
            }),
            free: Vec::new(),
        });

        Self {
            constants: bytecode.constants,
            stack: vec![Value::Null; config.max_stack_size],
            sp: 0,
            globals,
            frames: vec![Frame::new(main, 0)],
            config,
            out: Box::new(io::stdout()),
        }
    }

    /// Redirect `print` output.
    pub fn with_output(mut self, out: Box<dyn Write>) -> Self {
        self.out = out;
        self
    }

    /// Hand back the globals and the output sink.
    pub fn into_parts(self) -> (Vec<Value>, Box<dyn Write>) {
        (self.globals, self.out)
    }

    pub fn stack_top(&self) -> Option<&Value> {
        if self.sp == 0 {
            None
        } else {
            self.stack.get(self.sp - 1)
        }
    }

    #[cfg(test)]
    pub fn sp(&self) -> usize {
        self.sp
    }

    #[cfg(test)]
    pub fn last_popped_stack_elem(&self) -> Value {
        self.stack.get(self.sp).cloned().unwrap_or(Value::Null)
    }

    #[cfg(test)]
    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    // Execution

    pub fn run(&mut self) -> Result<(), RuntimeError> {
        let main = self.frames.first().ok_or(RuntimeError::StackUnderflow)?;
        verify_program(main.instructions(), &self.constants)?;

        loop {
            let frame = self.current_frame()?;
            let ip = frame.ip;
            let bytes = frame.instructions().as_bytes();

            if ip >= bytes.len() {
                if self.frames.len() == 1 {
                    break;
                }
                // a function body that runs off its end returns null
                self.return_from_call(Value::Null)?;
                continue;
            }

            let (op, operands, len) = decode(bytes, ip)?;

            if self.config.trace {
                eprintln!(
                    "[{}] {:04} {} {:?} | sp={}",
                    self.frames.len() - 1,
                    ip,
                    op,
                    operands,
                    self.sp
                );
            }

            self.current_frame_mut()?.ip = ip + len;

            match op {
                Opcode::Const => {
                    let value = self.constant(ip, op, operands[0])?;
                    self.push(value)?;
                }
                Opcode::Pop => {
                    self.pop()?;
                }
                Opcode::True => self.push(Value::Boolean(true))?,
                Opcode::False => self.push(Value::Boolean(false))?,
                Opcode::Null => self.push(Value::Null)?,

                Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div => self.binary_op(op)?,
                Opcode::Gt | Opcode::Eq | Opcode::NotEq => self.comparison_op(op)?,

                Opcode::Bang => {
                    let operand = self.pop()?;
                    self.push(Value::Boolean(!operand.is_truthy()))?;
                }
                Opcode::Minus => {
                    let operand = self.pop()?;
                    let Value::Integer(n) = &operand else {
                        return Err(RuntimeError::UnsupportedOperator {
                            op: op.name(),
                            operand: operand.type_name(),
                        });
                    };
                    let negated = n
                        .checked_neg()
                        .ok_or(RuntimeError::IntegerOverflow(op.name()))?;
                    self.push(Value::Integer(negated))?;
                }

                Opcode::Jump => {
                    self.current_frame_mut()?.ip = operands[0];
                }
                Opcode::JumpIfNotTrue => {
                    let condition = self.pop()?;
                    if !condition.is_truthy() {
                        self.current_frame_mut()?.ip = operands[0];
                    }
                }

                Opcode::SetGlobal => {
                    // a u16 operand is always below GLOBALS_SIZE
                    let value = self.pop()?;
                    self.globals[operands[0]] = value;
                }
                Opcode::GetGlobal => {
                    let value = self.globals[operands[0]].clone();
                    self.push(value)?;
                }
                Opcode::SetLocal => {
                    let value = self.pop()?;
                    let slot = self.current_frame()?.base_pointer + operands[0];
                    let target = self
                        .stack
                        .get_mut(slot)
                        .ok_or(RuntimeError::StackOverflow(self.config.max_stack_size))?;
                    *target = value;
                }
                Opcode::GetLocal => {
                    let slot = self.current_frame()?.base_pointer + operands[0];
                    let value = self
                        .stack
                        .get(slot)
                        .cloned()
                        .ok_or(RuntimeError::StackOverflow(self.config.max_stack_size))?;
                    self.push(value)?;
                }

                Opcode::LoadBuiltin => {
                    let builtin = Builtin::from_index(operands[0]).ok_or_else(|| {
                        VerifyError::UnknownBuiltin {
                            location: "runtime".to_string(),
                            offset: ip,
                            index: operands[0],
                        }
                    })?;
                    self.push(Value::Builtin(builtin))?;
                }
                Opcode::GetFree => {
                    let value = self
                        .current_frame()?
                        .closure
                        .free
                        .get(operands[0])
                        .cloned()
                        .ok_or(RuntimeError::FreeOutOfRange(operands[0]))?;
                    self.push(value)?;
                }
                Opcode::GetClosure => self.push_closure(ip, operands[0], operands[1])?,
                Opcode::CurrentClosure => {
                    let closure = self.current_frame()?.closure.clone();
                    self.push(Value::Closure(closure))?;
                }

                Opcode::Array => {
                    let items = self.pop_n(operands[0])?;
                    self.push(Value::array(items))?;
                }
                Opcode::Hash => {
                    let items = self.pop_n(operands[0])?;
                    let hash = build_hash(&items)?;
                    self.push(hash)?;
                }
                Opcode::Index => self.index_op()?,

                Opcode::Call => self.call(operands[0])?,

                Opcode::Return => {
                    let value = self.pop()?;
                    if self.frames.len() == 1 {
                        // top-level return: leave the value and halt
                        self.push(value)?;
                        break;
                    }
                    self.return_from_call(value)?;
                }
                Opcode::ReturnNull => {
                    if self.frames.len() == 1 {
                        self.push(Value::Null)?;
                        break;
                    }
                    self.return_from_call(Value::Null)?;
                }
            }
        }

        Ok(())
    }

    fn current_frame(&self) -> Result<&Frame, RuntimeError> {
        self.frames.last().ok_or(RuntimeError::StackUnderflow)
    }

    fn current_frame_mut(&mut self) -> Result<&mut Frame, RuntimeError> {
        self.frames.last_mut().ok_or(RuntimeError::StackUnderflow)
    }

    fn constant(&self, offset: usize, opcode: Opcode, index: usize) -> Result<Value, RuntimeError> {
        self.constants.get(index).cloned().ok_or_else(|| {
            RuntimeError::MalformedBytecode(VerifyError::ConstantOutOfRange {
                location: "runtime".to_string(),
                offset,
                opcode,
                index,
                len: self.constants.len(),
            })
        })
    }

    // Calls

    fn call(&mut self, argc: usize) -> Result<(), RuntimeError> {
        let slot = self
            .sp
            .checked_sub(argc + 1)
            .ok_or(RuntimeError::StackUnderflow)?;

        match self.stack[slot].clone() {
            Value::Closure(closure) => self.call_closure(closure, argc),
            Value::CompiledFunction(function) => {
                let closure = Rc::new(Closure {
                    function,
                    free: Vec::new(),
                });
                self.call_closure(closure, argc)
            }
            Value::Builtin(builtin) => self.call_builtin(builtin, argc),
            other => Err(RuntimeError::NotCallable(other.type_name())),
        }
    }

    fn call_closure(&mut self, closure: Rc<Closure>, argc: usize) -> Result<(), RuntimeError> {
        let num_parameters = closure.function.num_parameters;
        let num_locals = closure.function.num_locals;

        if argc != num_parameters {
            return Err(RuntimeError::WrongArgumentCount {
                want: num_parameters,
                got: argc,
            });
        }
        if self.frames.len() >= self.config.max_frames {
            return Err(RuntimeError::FrameOverflow(self.config.max_frames));
        }

        let base_pointer = self.sp - argc;
        self.frames.push(Frame::new(closure, base_pointer));

        // reserve the non-parameter locals
        for _ in argc..num_locals {
            self.push(Value::Null)?;
        }

        Ok(())
    }

    fn call_builtin(&mut self, builtin: Builtin, argc: usize) -> Result<(), RuntimeError> {
        let args = self.pop_n(argc)?;
        self.pop()?;
        let result = builtin.call(&args, &mut *self.out);
        self.push(result)
    }

    /// Pop the current frame and leave `value` where its callee was.
    ///
    /// The slot below the frame must still hold the callee. Verified bytecode
    /// cannot break this, so a mismatch means the VM itself went wrong.
    fn return_from_call(&mut self, value: Value) -> Result<(), RuntimeError> {
        let frame = self.frames.pop().ok_or(RuntimeError::StackUnderflow)?;
        let slot = frame
            .base_pointer
            .checked_sub(1)
            .ok_or(RuntimeError::FrameMisaligned(0))?;

        let aligned = match &self.stack[slot] {
            Value::Closure(closure) => Rc::ptr_eq(closure, &frame.closure),
            Value::CompiledFunction(function) => Rc::ptr_eq(function, &frame.closure.function),
            _ => false,
        };
        if !aligned {
            return Err(RuntimeError::FrameMisaligned(slot));
        }

        self.sp = slot;
        self.push(value)
    }

    fn push_closure(
        &mut self,
        offset: usize,
        index: usize,
        num_free: usize,
    ) -> Result<(), RuntimeError> {
        let function = match self.constant(offset, Opcode::GetClosure, index)? {
            Value::CompiledFunction(function) => function,
            other => {
                return Err(RuntimeError::MalformedBytecode(VerifyError::NotAFunction {
                    location: "runtime".to_string(),
                    offset,
                    index,
                    found: other.type_name(),
                }));
            }
        };

        let free = self.pop_n(num_free)?;
        self.push(Value::Closure(Rc::new(Closure { function, free })))
    }

    // Operators

    fn binary_op(&mut self, op: Opcode) -> Result<(), RuntimeError> {
        let right = self.pop()?;
        let left = self.pop()?;

        let result = match (&left, &right) {
            (Value::Integer(l), Value::Integer(r)) => Value::Integer(integer_op(op, *l, *r)?),
            (Value::String(l), Value::String(r)) if op == Opcode::Add => {
                let mut joined = String::with_capacity(l.len() + r.len());
                joined.push_str(l);
                joined.push_str(r);
                Value::string(joined)
            }
            _ => return Err(operand_error(op, &left, &right)),
        };

        self.push(result)
    }

    fn comparison_op(&mut self, op: Opcode) -> Result<(), RuntimeError> {
        let right = self.pop()?;
        let left = self.pop()?;

        let result = match op {
            Opcode::Eq => left == right,
            Opcode::NotEq => left != right,
            _ => match (&left, &right) {
                (Value::Integer(l), Value::Integer(r)) => l > r,
                (Value::String(l), Value::String(r)) => l > r,
                _ => return Err(operand_error(op, &left, &right)),
            },
        };

        self.push(Value::Boolean(result))
    }

    fn index_op(&mut self) -> Result<(), RuntimeError> {
        let index = self.pop()?;
        let collection = self.pop()?;

        let value = match (&collection, &index) {
            // negative and out-of-range indices miss
            (Value::Array(items), Value::Integer(i)) => usize::try_from(*i)
                .ok()
                .and_then(|i| items.get(i))
                .cloned()
                .unwrap_or(Value::Null),
            (Value::Array(_), _) => Value::Null,
            (Value::Hash(pairs), _) => {
                let key = index
                    .hash_key()
                    .ok_or(RuntimeError::UnhashableKey(index.type_name()))?;
                pairs.get(&key).cloned().unwrap_or(Value::Null)
            }
            _ => {
                return Err(RuntimeError::IndexNotSupported {
                    collection: collection.type_name(),
                    index: index.type_name(),
                });
            }
        };

        self.push(value)
    }

    // Stack

    fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.sp >= self.stack.len() {
            return Err(RuntimeError::StackOverflow(self.config.max_stack_size));
        }
        self.stack[self.sp] = value;
        self.sp += 1;
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        if self.sp == 0 {
            return Err(RuntimeError::StackUnderflow);
        }
        self.sp -= 1;
        Ok(self.stack[self.sp].clone())
    }

    /// Pop `n` values, returned in the order they were pushed.
    fn pop_n(&mut self, n: usize) -> Result<Vec<Value>, RuntimeError> {
        let start = self.sp.checked_sub(n).ok_or(RuntimeError::StackUnderflow)?;
        let items = self.stack[start..self.sp].to_vec();
        self.sp = start;
        Ok(items)
    }
}

fn integer_op(op: Opcode, left: i64, right: i64) -> Result<i64, RuntimeError> {
    let result = match op {
        Opcode::Add => left.checked_add(right),
        Opcode::Sub => left.checked_sub(right),
        Opcode::Mul => left.checked_mul(right),
        Opcode::Div => {
            if right == 0 {
                return Err(RuntimeError::DivisionByZero);
            }
            // truncates toward zero
            left.checked_div(right)
        }
        _ => {
            return Err(RuntimeError::UnsupportedOperator {
                op: op.name(),
                operand: "INTEGER",
            });
        }
    };

    result.ok_or(RuntimeError::IntegerOverflow(op.name()))
}

fn operand_error(op: Opcode, left: &Value, right: &Value) -> RuntimeError {
    if left.type_name() != right.type_name() {
        RuntimeError::TypeMismatch {
            op: op.name(),
            left: left.type_name(),
            right: right.type_name(),
        }
    } else {
        RuntimeError::UnsupportedOperator {
            op: op.name(),
            operand: left.type_name(),
        }
    }
}

/// Pair up `[k1, v1, k2, v2, ...]` into a hash; later duplicates win.
fn build_hash(items: &[Value]) -> Result<Value, RuntimeError> {
    let mut pairs = IndexMap::with_capacity(items.len() / 2);
    for pair in items.chunks_exact(2) {
        let key = pair[0]
            .hash_key()
            .ok_or(RuntimeError::UnhashableKey(pair[0].type_name()))?;
        pairs.insert(key, pair[1].clone());
    }
    Ok(Value::Hash(Rc::new(pairs)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::compile::Compiler;
    use crate::bytecode::op::{Instructions, make};
    use crate::frontend::parser::parse_source;
    use crate::lang::value::HashKey;
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;

    /// `print` sink the test can read back.
    #[derive(Clone, Default)]
    struct SharedBuf(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn compile(source: &str) -> Bytecode {
        let program = parse_source(source).expect("source should parse");
        let mut compiler = Compiler::new();
        compiler.compile(&program).expect("source should compile");
        compiler.bytecode()
    }

    fn vm_for(source: &str, config: VmConfig) -> Vm {
        Vm::with_config(compile(source), config).with_output(Box::new(io::sink()))
    }

    fn run(source: &str) -> Result<Value, RuntimeError> {
        let mut vm = vm_for(source, VmConfig::default());
        vm.run()?;
        Ok(vm.last_popped_stack_elem())
    }

    fn assert_value(source: &str, expected: Value) {
        match run(source) {
            Ok(value) => assert_eq!(value, expected, "{}", source),
            Err(e) => panic!("{}: {}", source, e),
        }
    }

    fn assert_int(source: &str, expected: i64) {
        assert_value(source, Value::Integer(expected));
    }

    fn assert_error(source: &str, expected: RuntimeError) {
        assert_eq!(run(source), Err(expected), "{}", source);
    }

    fn ints(ns: &[i64]) -> Value {
        Value::array(ns.iter().map(|n| Value::Integer(*n)).collect())
    }

    // =========================================================================
    // Arithmetic & comparison
    // =========================================================================

    #[test]
    fn test_integer_arithmetic() {
        assert_int("1 + 2", 3);
        assert_int("1 - 2", -1);
        assert_int("50 / 2 * 2 + 10 - 5", 55);
        assert_int("5 * (2 + 10)", 60);
        assert_int("-5", -5);
        assert_int("-50 + 100 + -50", 0);
        assert_int("(5 + 10 * 2 + 15 / 3) * 2 + -10", 50);
    }

    #[test]
    fn test_division_truncates_toward_zero() {
        assert_int("7 / 2", 3);
        assert_int("7 / -2", -3);
        assert_int("-7 / 2", -3);
    }

    #[test]
    fn test_boolean_expressions() {
        let cases = [
            ("true", true),
            ("1 < 2", true),
            ("1 > 2", false),
            ("1 < 1", false),
            ("1 == 1", true),
            ("1 != 1", false),
            ("true != false", true),
            ("(1 < 2) == true", true),
            ("!true", false),
            ("!!5", true),
            ("!0", false),
            (r#""b" > "a""#, true),
            (r#""a" == "a""#, true),
            (r#"1 == "1""#, false),
            ("[1, 2] == [1, 2]", true),
            ("!(if (false) { 5 })", true),
        ];
        for (source, expected) in cases {
            assert_value(source, Value::Boolean(expected));
        }
    }

    #[test]
    fn test_operator_errors() {
        assert_error(
            "1 + true",
            RuntimeError::TypeMismatch {
                op: "ADD",
                left: "INTEGER",
                right: "BOOLEAN",
            },
        );
        assert_error(
            "true + false",
            RuntimeError::UnsupportedOperator {
                op: "ADD",
                operand: "BOOLEAN",
            },
        );
        assert_error(
            r#""a" - "b""#,
            RuntimeError::UnsupportedOperator {
                op: "SUB",
                operand: "STRING",
            },
        );
        assert_error(
            "-true",
            RuntimeError::UnsupportedOperator {
                op: "MINUS",
                operand: "BOOLEAN",
            },
        );
        assert_error(
            "true > false",
            RuntimeError::UnsupportedOperator {
                op: "GT",
                operand: "BOOLEAN",
            },
        );
        assert_error("1 / 0", RuntimeError::DivisionByZero);
        assert_error(
            "9223372036854775807 + 1",
            RuntimeError::IntegerOverflow("ADD"),
        );
    }

    // =========================================================================
    // Control flow & bindings
    // =========================================================================

    #[test]
    fn test_conditionals() {
        assert_int("if (true) { 10 }", 10);
        assert_int("if (true) { 10 } else { 20 }", 10);
        assert_int("if (false) { 10 } else { 20 }", 20);
        assert_int("if (1) { 10 }", 10);
        assert_int("if (0) { 10 } else { 20 }", 10);
        assert_int("if (1 > 2) { 10 } else { 20 }", 20);
        assert_value("if (false) { 10 }", Value::Null);
        assert_value("if (1 > 2) { 10 }", Value::Null);
        assert_int("if ((if (false) { 10 })) { 10 } else { 20 }", 20);
        assert_value("if (true) { }", Value::Null);
        assert_value("if (true) { let a = 1; }", Value::Null);
    }

    #[test]
    fn test_if_leaves_exactly_one_value() {
        for source in ["if (true) { 10 } else { 20 }", "if (false) { 10 } else { 20 }", "if (false) { 10 }"] {
            let mut compiler = Compiler::new();
            compiler.compile(&parse_source(source).unwrap()).unwrap();
            compiler.strip_trailing_pop();
            let mut vm = Vm::new(compiler.bytecode());
            vm.run().unwrap();
            assert_eq!(vm.sp(), 1, "{}", source);
        }
    }

    #[test]
    fn test_global_let() {
        assert_int("let one = 1; one", 1);
        assert_int("let one = 1; let two = 2; one + two", 3);
        assert_int("let one = 1; let two = one + one; one + two", 3);
    }

    #[test]
    fn test_strings() {
        assert_value(r#""cinder""#, Value::string("cinder"));
        assert_value(r#""cin" + "der""#, Value::string("cinder"));
        assert_value(r#""cin" + "d" + "er""#, Value::string("cinder"));
    }

    #[test]
    fn test_arrays_and_hashes() {
        assert_value("[]", ints(&[]));
        assert_value("[1, 2 * 2, 3 + 3]", ints(&[1, 4, 6]));

        let mut pairs = IndexMap::new();
        pairs.insert(HashKey::Integer(2), Value::Integer(4));
        pairs.insert(HashKey::Integer(6), Value::Integer(16));
        assert_value("{1 + 1: 2 * 2, 3 + 3: 4 * 4}", Value::Hash(Rc::new(pairs)));

        assert_error("{[1]: 2}", RuntimeError::UnhashableKey("ARRAY"));
    }

    #[test]
    fn test_index() {
        assert_int("[1, 2, 3][1]", 2);
        assert_int("[[1, 1, 1]][0][0]", 1);
        assert_value("[1, 2, 3][5]", Value::Null);
        assert_value("[][0]", Value::Null);
        assert_value("[1][-1]", Value::Null);
        assert_value("[1][true]", Value::Null);
        assert_int("{1: 1, 2: 2}[2]", 2);
        assert_value("{1: 2}[9]", Value::Null);
        assert_value("{}[0]", Value::Null);
        assert_int(r#"{"a": 5}["a"]"#, 5);
        assert_error("{1: 2}[[1]]", RuntimeError::UnhashableKey("ARRAY"));
        assert_error(
            "1[0]",
            RuntimeError::IndexNotSupported {
                collection: "INTEGER",
                index: "INTEGER",
            },
        );
    }

    // =========================================================================
    // Functions & closures
    // =========================================================================

    #[test]
    fn test_calling_functions() {
        assert_int("let fivePlusTen = function() { 5 + 10; }; fivePlusTen();", 15);
        assert_int("let a = fn() { 1 }; let b = fn() { a() + 1 }; b() + 1", 3);
        assert_int("let early = function() { return 99; 100; }; early();", 99);
        assert_int("function() { 7 }()", 7);
        assert_value("let noReturn = function() { }; noReturn();", Value::Null);
        assert_value("let bare = function() { return; }; bare();", Value::Null);
        assert_int(
            "let returnsOne = function() { 1; }; let returnsOneReturner = function() { returnsOne; }; returnsOneReturner()();",
            1,
        );
    }

    #[test]
    fn test_locals_and_arguments() {
        assert_int("let one = function() { let one = 1; one }; one();", 1);
        assert_int(
            "let sum = function(a, b) { let c = a + b; c; }; sum(1, 2) + sum(3, 4);",
            10,
        );
        assert_int(
            "let globalSeed = 50; let minusOne = function() { let num = 1; globalSeed - num; }; let minusTwo = function() { let num = 2; globalSeed - num; }; minusOne() + minusTwo();",
            97,
        );
    }

    #[test]
    fn test_global_used_inside_function() {
        assert_int("let x = 10; let addX = function(y) { x + y }; addX(5);", 15);
    }

    #[test]
    fn test_wrong_argument_count() {
        assert_error(
            "let f = function(a) { a; }; f();",
            RuntimeError::WrongArgumentCount { want: 1, got: 0 },
        );
        assert_error(
            "function() { 1 }(1)",
            RuntimeError::WrongArgumentCount { want: 0, got: 1 },
        );
    }

    #[test]
    fn test_calling_non_function() {
        assert_error("1()", RuntimeError::NotCallable("INTEGER"));
        assert_error(r#"let s = "x"; s(1)"#, RuntimeError::NotCallable("STRING"));
    }

    #[test]
    fn test_builtins() {
        assert_int("len([1, 2, 3])", 3);
        assert_int(r#"len("four")"#, 4);
        assert_value(
            "len(1)",
            Value::error("argument to `len` not supported, got INTEGER"),
        );
        assert_int("first([1, 2, 3])", 1);
        assert_int("last([1, 2, 3])", 3);
        assert_value("rest([1, 2, 3])", ints(&[2, 3]));
        assert_value("push([], 1)", ints(&[1]));
        assert_value("first([])", Value::Null);
        assert_int("let l = len; l([1])", 1);
    }

    #[test]
    fn test_print_writes_to_output() {
        let buf = SharedBuf::default();
        let mut vm = Vm::new(compile("print(10)")).with_output(Box::new(buf.clone()));
        vm.run().unwrap();

        assert_eq!(vm.last_popped_stack_elem(), Value::Null);
        assert_eq!(String::from_utf8(buf.0.borrow().clone()).unwrap(), "10\n");
    }

    #[test]
    fn test_closures() {
        assert_int(
            "let newClosure = function(a) { function() { a; }; }; let closure = newClosure(99); closure();",
            99,
        );
        assert_int(
            "let newAdder = function(a, b) { function(c) { a + b + c }; }; let adder = newAdder(1, 2); adder(8);",
            11,
        );
        assert_int(
            "let newAdderOuter = function(a, b) { let c = a + b; function(d) { let e = d + c; function(f) { e + f; }; }; }; let newAdderInner = newAdderOuter(1, 2); let adder = newAdderInner(3); adder(8);",
            14,
        );
        assert_int(
            "let newClosure = function(a, b) { let one = function() { a; }; let two = function() { b; }; function() { one() + two(); }; }; let closure = newClosure(9, 90); closure();",
            99,
        );
    }

    #[test]
    fn test_closure_captures_value_at_creation() {
        assert_int(
            "let make = function(a) { let get = function() { a }; get }; let g1 = make(1); let g2 = make(2); g1() + g2() * 10",
            21,
        );
    }

    #[test]
    fn test_recursive_functions() {
        assert_int(
            "let countDown = function(x) { if (x == 0) { return 0; } else { countDown(x - 1); } }; countDown(3);",
            0,
        );
        assert_int(
            "let wrapper = function() { let countDown = function(x) { if (x == 0) { return 0; } else { countDown(x - 1); } }; countDown(1); }; wrapper();",
            0,
        );
        assert_int(
            "let fibonacci = function(x) { if (x == 0) { return 0; } else { if (x == 1) { return 1; } else { fibonacci(x - 1) + fibonacci(x - 2); } } }; fibonacci(15);",
            610,
        );
    }

    #[test]
    fn test_recursion_through_nested_closure() {
        assert_int(
            "let sumTo = function(n) { let step = function() { if (n == 0) { 0 } else { n + sumTo(n - 1) } }; step() }; sumTo(4)",
            10,
        );
    }

    #[test]
    fn test_higher_order_map() {
        assert_value(
            "let map = function(arr, f) { let iter = function(arr, acc) { if (len(arr) == 0) { acc } else { iter(rest(arr), push(acc, f(first(arr)))) } }; iter(arr, []) }; map([1, 2, 3], function(x) { x * 2 })",
            ints(&[2, 4, 6]),
        );
    }

    // =========================================================================
    // Stack & frame discipline
    // =========================================================================

    #[test]
    fn test_frame_balance_after_calls() {
        let source = "let f = function(a, b) { let c = a; c + b }; let g = function() { f(1, 2) + len([1]) }; g()";
        let mut compiler = Compiler::new();
        compiler.compile(&parse_source(source).unwrap()).unwrap();
        compiler.strip_trailing_pop();

        let mut vm = Vm::new(compiler.bytecode());
        vm.run().unwrap();

        assert_eq!(vm.sp(), 1);
        assert_eq!(vm.frame_depth(), 1);
        assert_eq!(vm.stack_top(), Some(&Value::Integer(4)));
    }

    #[test]
    fn test_statements_leave_stack_empty() {
        let mut vm = vm_for("let a = 1; a + 1; let f = function(x) { x }; f(a);", VmConfig::default());
        vm.run().unwrap();
        assert_eq!(vm.sp(), 0);
        assert_eq!(vm.last_popped_stack_elem(), Value::Integer(1));
    }

    #[test]
    fn test_top_level_return_halts() {
        let mut vm = vm_for("return 5; 6", VmConfig::default());
        vm.run().unwrap();
        assert_eq!(vm.stack_top(), Some(&Value::Integer(5)));
    }

    #[test]
    fn test_frame_overflow() {
        let config = VmConfig {
            max_frames: 16,
            ..VmConfig::default()
        };
        let mut vm = vm_for("let f = function(x) { f(x) }; f(1)", config);
        assert_eq!(vm.run(), Err(RuntimeError::FrameOverflow(16)));
    }

    #[test]
    fn test_stack_overflow() {
        let config = VmConfig {
            max_stack_size: 8,
            ..VmConfig::default()
        };
        let mut vm = vm_for("[1, 2, 3, 4, 5, 6, 7, 8, 9]", config);
        assert_eq!(vm.run(), Err(RuntimeError::StackOverflow(8)));
    }

    #[test]
    fn test_globals_carry_over() {
        let mut vm = vm_for("let a = 40;", VmConfig::default());
        vm.run().unwrap();
        let (globals, _) = vm.into_parts();

        let mut symbols_compiler = Compiler::new();
        symbols_compiler
            .compile(&parse_source("let a = 40;").unwrap())
            .unwrap();
        let (symbols, constants) = symbols_compiler.into_state();
        let mut compiler = Compiler::new_with_state(symbols, constants);
        compiler.compile(&parse_source("a + 2").unwrap()).unwrap();

        let mut vm = Vm::new_with_globals(compiler.bytecode(), VmConfig::default(), globals);
        vm.run().unwrap();
        assert_eq!(vm.last_popped_stack_elem(), Value::Integer(42));
    }

    #[test]
    fn test_malformed_bytecode_is_rejected() {
        let bytecode = Bytecode::new(Instructions::from(vec![0xff]), vec![]);
        let mut vm = Vm::new(bytecode);
        assert!(matches!(vm.run(), Err(RuntimeError::MalformedBytecode(_))));

        let bytecode = Bytecode::new(
            vec![make(Opcode::GetClosure, &[0, 0])].into_iter().collect(),
            vec![Value::Integer(1)],
        );
        let mut vm = Vm::new(bytecode);
        assert!(matches!(
            vm.run(),
            Err(RuntimeError::MalformedBytecode(VerifyError::NotAFunction { .. }))
        ));
    }

    #[test]
    fn test_globals_are_fixed_size() {
        let bytecode = Bytecode::new(
            vec![
                make(Opcode::Const, &[0]),
                make(Opcode::SetGlobal, &[65535]),
                make(Opcode::GetGlobal, &[65535]),
                make(Opcode::GetGlobal, &[7]),
                make(Opcode::Pop, &[]),
            ]
            .into_iter()
            .collect(),
            vec![Value::Integer(9)],
        );
        let mut vm = Vm::new(bytecode);
        vm.run().unwrap();
        assert_eq!(vm.last_popped_stack_elem(), Value::Null);
        assert_eq!(vm.stack_top(), Some(&Value::Integer(9)));

        let (globals, _) = vm.into_parts();
        assert_eq!(globals.len(), GLOBALS_SIZE);
        assert_eq!(globals[GLOBALS_SIZE - 1], Value::Integer(9));
    }

    #[test]
    fn test_short_globals_are_padded() {
        let globals = vec![Value::Integer(1)];
        let vm = Vm::new_with_globals(Bytecode::default(), VmConfig::default(), globals);
        let (globals, _) = vm.into_parts();
        assert_eq!(globals.len(), GLOBALS_SIZE);
        assert_eq!(globals[0], Value::Integer(1));
    }

    #[test]
    fn test_return_checks_frame_alignment() {
        let callee = Rc::new(Closure {
            function: Rc::new(CompiledFunction {
                instructions: Instructions::new(),
                num_locals: 0,
                num_parameters: 0,
            }),
            free: Vec::new(),
        });

        let mut vm = Vm::new(Bytecode::default());
        vm.push(Value::Closure(callee.clone())).unwrap();
        vm.frames.push(Frame::new(callee.clone(), 1));
        vm.return_from_call(Value::Integer(3)).unwrap();
        assert_eq!(vm.sp(), 1);
        assert_eq!(vm.stack_top(), Some(&Value::Integer(3)));
        assert_eq!(vm.frame_depth(), 1);

        // the slot below the frame no longer holds the callee
        let mut vm = Vm::new(Bytecode::default());
        vm.push(Value::Integer(0)).unwrap();
        vm.frames.push(Frame::new(callee, 1));
        assert_eq!(
            vm.return_from_call(Value::Null),
            Err(RuntimeError::FrameMisaligned(0))
        );
    }
}
