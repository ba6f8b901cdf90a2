use std::io::{self, Write};
use std::path::Path;

use thiserror::Error;

use crate::bytecode::compile::Compiler;
use crate::bytecode::compile_error::CompileError;
use crate::bytecode::ir::Bytecode;
use crate::bytecode::symbol_table::SymbolTable;
use crate::bytecode::verify::VerifyError;
use crate::frontend::lexer::LexerError;
use crate::frontend::parser::parse_source;
use crate::frontend::parser_error::ParserError;
use crate::lang::value::Value;
use crate::runtime::runtime_error::RuntimeError;
use crate::runtime::vm::{Vm, VmConfig, new_globals};

/// Any failure between source text and a finished run.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Lexer(#[from] LexerError),

    #[error(transparent)]
    Parser(#[from] ParserError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Verify(#[from] VerifyError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("bytecode encoding error: {0}")]
    Encoding(#[from] postcard::Error),

    #[error("{path}: {source}")]
    Io { path: String, source: io::Error },
}

impl SessionError {
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            SessionError::Compile(e) => e.hint(),
            SessionError::Runtime(e) => e.hint(),
            _ => None,
        }
    }

    fn io(path: &Path, source: io::Error) -> Self {
        SessionError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Compile a whole program. The trailing `POP` is kept.
pub fn compile_source(source: &str) -> Result<Bytecode, SessionError> {
    let program = parse_source(source)?;
    let mut compiler = Compiler::new();
    compiler.compile(&program)?;
    Ok(compiler.bytecode())
}

pub fn write_bytecode(bytecode: &Bytecode, path: &Path) -> Result<(), SessionError> {
    let bytes = bytecode.to_bytes()?;
    std::fs::write(path, bytes).map_err(|e| SessionError::io(path, e))
}

/// Read and verify a blob written by [`write_bytecode`].
pub fn read_bytecode(path: &Path) -> Result<Bytecode, SessionError> {
    let bytes = std::fs::read(path).map_err(|e| SessionError::io(path, e))?;
    let bytecode = Bytecode::from_bytes(&bytes)?;
    crate::bytecode::verify::verify(&bytecode)?;
    Ok(bytecode)
}

/// Long-lived compile/run state for a REPL.
///
/// Bindings, the constant pool and the global slots persist from one
/// [`Session::eval`] to the next. A line that fails to compile or run
/// leaves the symbol table and constant pool as they were before it.
pub struct Session {
    symbols: SymbolTable,
    constants: Vec<Value>,
    globals: Vec<Value>,
    config: VmConfig,
    out: Box<dyn Write>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        Self {
            symbols: SymbolTable::with_builtins(),
            constants: Vec::new(),
            globals: new_globals(),
            config,
            out: Box::new(io::stdout()),
        }
    }

    #[cfg(test)]
    pub fn with_output(mut self, out: Box<dyn Write>) -> Self {
        self.out = out;
        self
    }

    /// Compile and run one input, returning the value of its last
    /// expression statement (null if it ends in anything else).
    pub fn eval(&mut self, source: &str) -> Result<Value, SessionError> {
        let program = parse_source(source)?;

        let mut compiler = Compiler::new_with_state(self.symbols.clone(), self.constants.clone());
        compiler.compile(&program)?;
        compiler.strip_trailing_pop();

        let bytecode = compiler.bytecode();
        let (symbols, constants) = compiler.into_state();

        let globals = std::mem::take(&mut self.globals);
        let out = std::mem::replace(&mut self.out, Box::new(io::sink()));
        let mut vm =
            Vm::new_with_globals(bytecode, self.config.clone(), globals).with_output(out);

        let result = vm.run();
        let value = vm.stack_top().cloned().unwrap_or(Value::Null);

        let (globals, out) = vm.into_parts();
        self.globals = globals;
        self.out = out;

        result?;

        self.symbols = symbols;
        self.constants = constants;
        Ok(value)
    }

    pub fn constants(&self) -> &[Value] {
        &self.constants
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;
    use std::rc::Rc;

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

    fn session() -> Session {
        Session::new().with_output(Box::new(io::sink()))
    }

    #[test]
    fn test_bindings_persist_between_inputs() {
        let mut s = session();
        assert_eq!(s.eval("let a = 1;").unwrap(), Value::Null);
        assert_eq!(s.eval("let add = function(x, y) { x + y };").unwrap(), Value::Null);
        assert_eq!(s.eval("add(a, 41)").unwrap(), Value::Integer(42));
        assert_eq!(s.eval("a").unwrap(), Value::Integer(1));
    }

    #[test]
    fn test_constant_pool_is_append_only() {
        let mut s = session();
        s.eval("1").unwrap();
        s.eval("2").unwrap();
        assert_eq!(s.constants(), &[Value::Integer(1), Value::Integer(2)]);
    }

    #[test]
    fn test_compile_error_rolls_back() {
        let mut s = session();
        let err = s.eval("let b = 1; c").unwrap_err();
        assert!(matches!(err, SessionError::Compile(CompileError::UndefinedIdentifier(ref n)) if n == "c"));
        assert_eq!(err.to_string(), "compile error: identifier 'c' not found");

        // `b` was never committed, so it can be declared again
        assert_eq!(s.eval("let b = 2; b").unwrap(), Value::Integer(2));
        assert!(s.constants().iter().all(|c| *c != Value::Integer(1)));
    }

    #[test]
    fn test_runtime_error_rolls_back() {
        let mut s = session();
        let err = s.eval("let d = 1; 1 / 0").unwrap_err();
        assert!(matches!(err, SessionError::Runtime(RuntimeError::DivisionByZero)));

        assert_eq!(s.eval("let d = 3; d * 2").unwrap(), Value::Integer(6));
    }

    #[test]
    fn test_closures_survive_between_inputs() {
        let mut s = session();
        s.eval("let counter = function(n) { function() { n + 1 } };").unwrap();
        s.eval("let next = counter(9);").unwrap();
        assert_eq!(s.eval("next()").unwrap(), Value::Integer(10));
    }

    #[test]
    fn test_print_goes_to_session_output() {
        let buf = SharedBuf::default();
        let mut s = Session::new().with_output(Box::new(buf.clone()));
        assert_eq!(s.eval(r#"print("hi"); print([1, "a"])"#).unwrap(), Value::Null);
        s.eval("print(1 + 1)").unwrap();
        assert_eq!(
            String::from_utf8(buf.0.borrow().clone()).unwrap(),
            "hi\n[1, \"a\"]\n2\n"
        );
    }

    #[test]
    fn test_parse_error_display() {
        let err = session().eval("let = 1").unwrap_err();
        assert_eq!(err.to_string(), "1:5: expected identifier after 'let', found '='");
    }

    #[test]
    fn test_bytecode_file_round_trip() {
        let bytecode = compile_source("let f = function(a) { [a, {\"k\": a}] }; f(1)").unwrap();
        let path = std::env::temp_dir().join(format!("cinder-test-{}.cinc", std::process::id()));

        write_bytecode(&bytecode, &path).unwrap();
        let loaded = read_bytecode(&path).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(loaded, bytecode);
    }

    #[test]
    fn test_corrupt_bytecode_file() {
        let path = std::env::temp_dir().join(format!("cinder-corrupt-{}.cinc", std::process::id()));
        std::fs::write(&path, [0xff, 0xff, 0xff]).unwrap();
        let result = read_bytecode(&path);
        let _ = std::fs::remove_file(&path);

        assert!(matches!(
            result,
            Err(SessionError::Encoding(_)) | Err(SessionError::Verify(_))
        ));
    }
}
