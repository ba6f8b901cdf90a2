use std::rc::Rc;

use crate::bytecode::compile_error::CompileError;
use crate::bytecode::ir::Bytecode;
use crate::bytecode::op::{Instructions, Opcode, make};
use crate::bytecode::symbol_table::{ScopeId, Symbol, SymbolScope, SymbolTable};
use crate::lang::node::{Block, Expression, InfixOp, PrefixOp, Program, Statement};
use crate::lang::value::{CompiledFunction, Value};

#[derive(Debug, Clone, Copy)]
struct EmittedInstruction {
    opcode: Opcode,
    position: usize,
}

/// Instruction buffer of one function body (or of the top level).
struct CompilationScope {
    instructions: Instructions,
    last: Option<EmittedInstruction>,
    previous: Option<EmittedInstruction>,
    symbols: ScopeId,
}

impl CompilationScope {
    fn new(symbols: ScopeId) -> Self {
        Self {
            instructions: Instructions::new(),
            last: None,
            previous: None,
            symbols,
        }
    }
}

/// Single-pass AST to bytecode compiler.
///
/// The constant pool and symbol table can be carried across compilations
/// (see [`Compiler::new_with_state`]) so that a REPL keeps its bindings.
pub struct Compiler {
    constants: Vec<Value>,
    symbols: SymbolTable,
    scopes: Vec<CompilationScope>,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Compiler {
    pub fn new() -> Self {
        Self::new_with_state(SymbolTable::with_builtins(), Vec::new())
    }

    /// Resume from a previous compilation's symbol table and constants.
    pub fn new_with_state(symbols: SymbolTable, constants: Vec<Value>) -> Self {
        let root = symbols.root();
        Self {
            constants,
            symbols,
            scopes: vec![CompilationScope::new(root)],
        }
    }

    /// Hand back the state to carry into the next compilation.
    pub fn into_state(self) -> (SymbolTable, Vec<Value>) {
        (self.symbols, self.constants)
    }

    pub fn bytecode(&self) -> Bytecode {
        Bytecode::new(self.scope().instructions.clone(), self.constants.clone())
    }

    pub fn compile(&mut self, program: &Program) -> Result<(), CompileError> {
        for statement in &program.statements {
            self.compile_statement(statement)?;
        }
        Ok(())
    }

    /// Drop a trailing `POP` from the top-level stream so the value of the
    /// last expression statement stays on the stack.
    pub fn strip_trailing_pop(&mut self) -> bool {
        if self.last_instruction_is(Opcode::Pop) {
            self.remove_last_pop();
            true
        } else {
            false
        }
    }

    // ------------------------------------------------------------------
    // statements
    // ------------------------------------------------------------------

    fn compile_statement(&mut self, statement: &Statement) -> Result<(), CompileError> {
        match statement {
            Statement::Expression(expression) => {
                self.compile_expression(expression)?;
                self.emit(Opcode::Pop, &[])?;
            }

            Statement::Let { name, value } => {
                self.compile_expression(value)?;
                let scope = self.scope().symbols;
                let symbol = self.symbols.define(scope, name)?;
                match symbol.scope {
                    SymbolScope::Global => self.emit(Opcode::SetGlobal, &[symbol.index])?,
                    SymbolScope::Local => self.emit(Opcode::SetLocal, &[symbol.index])?,
                    other => {
                        return Err(CompileError::internal(format!(
                            "'{}' was defined with storage class {:?}",
                            name, other
                        )));
                    }
                };
            }

            Statement::Return(Some(value)) => {
                self.compile_expression(value)?;
                self.emit(Opcode::Return, &[])?;
            }

            Statement::Return(None) => {
                self.emit(Opcode::ReturnNull, &[])?;
            }
        }

        Ok(())
    }

    fn compile_block(&mut self, block: &Block) -> Result<(), CompileError> {
        for statement in &block.statements {
            self.compile_statement(statement)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // expressions
    // ------------------------------------------------------------------

    fn compile_expression(&mut self, expression: &Expression) -> Result<(), CompileError> {
        match expression {
            Expression::Integer(n) => {
                let index = self.add_constant(Value::Integer(*n));
                self.emit(Opcode::Const, &[index])?;
            }

            Expression::String(s) => {
                let index = self.add_constant(Value::string(s));
                self.emit(Opcode::Const, &[index])?;
            }

            Expression::Boolean(true) => {
                self.emit(Opcode::True, &[])?;
            }
            Expression::Boolean(false) => {
                self.emit(Opcode::False, &[])?;
            }

            Expression::Array(elements) => {
                for element in elements {
                    self.compile_expression(element)?;
                }
                self.emit(Opcode::Array, &[elements.len()])?;
            }

            Expression::Hash(pairs) => {
                for (key, value) in pairs {
                    self.compile_expression(key)?;
                    self.compile_expression(value)?;
                }
                self.emit(Opcode::Hash, &[pairs.len() * 2])?;
            }

            Expression::Prefix { op, right } => {
                self.compile_expression(right)?;
                match op {
                    PrefixOp::Bang => self.emit(Opcode::Bang, &[])?,
                    PrefixOp::Minus => self.emit(Opcode::Minus, &[])?,
                };
            }

            Expression::Infix { op, left, right } => {
                // `a < b` is emitted as `b > a`
                if *op == InfixOp::Lt {
                    self.compile_expression(right)?;
                    self.compile_expression(left)?;
                } else {
                    self.compile_expression(left)?;
                    self.compile_expression(right)?;
                }

                let opcode = match op {
                    InfixOp::Add => Opcode::Add,
                    InfixOp::Sub => Opcode::Sub,
                    InfixOp::Mul => Opcode::Mul,
                    InfixOp::Div => Opcode::Div,
                    InfixOp::Lt | InfixOp::Gt => Opcode::Gt,
                    InfixOp::Eq => Opcode::Eq,
                    InfixOp::NotEq => Opcode::NotEq,
                };
                self.emit(opcode, &[])?;
            }

            Expression::If {
                condition,
                consequence,
                alternative,
            } => self.compile_if(condition, consequence, alternative.as_ref())?,

            Expression::Identifier(name) => {
                let scope = self.scope().symbols;
                let symbol = self
                    .symbols
                    .resolve(scope, name)
                    .ok_or_else(|| CompileError::UndefinedIdentifier(name.clone()))?;
                self.load_symbol(&symbol)?;
            }

            Expression::Index { left, index } => {
                self.compile_expression(left)?;
                self.compile_expression(index)?;
                self.emit(Opcode::Index, &[])?;
            }

            Expression::Function {
                name,
                parameters,
                body,
            } => self.compile_function(name.as_deref(), parameters, body)?,

            Expression::Call {
                function,
                arguments,
            } => {
                self.compile_expression(function)?;
                for argument in arguments {
                    self.compile_expression(argument)?;
                }
                self.emit(Opcode::Call, &[arguments.len()])?;
            }
        }

        Ok(())
    }

    /// Both branches leave exactly one value on the stack.
    fn compile_if(
        &mut self,
        condition: &Expression,
        consequence: &Block,
        alternative: Option<&Block>,
    ) -> Result<(), CompileError> {
        self.compile_expression(condition)?;
        let jump_if_not_true = self.emit(Opcode::JumpIfNotTrue, &[9999])?;

        self.compile_block(consequence)?;
        self.keep_branch_value()?;

        let jump = self.emit(Opcode::Jump, &[9999])?;

        let after_consequence = self.scope().instructions.len();
        self.change_operand(jump_if_not_true, after_consequence)?;

        match alternative {
            None => {
                self.emit(Opcode::Null, &[])?;
            }
            Some(alternative) => {
                self.compile_block(alternative)?;
                self.keep_branch_value()?;
            }
        }

        let after_alternative = self.scope().instructions.len();
        self.change_operand(jump, after_alternative)?;

        Ok(())
    }

    /// A branch ending in an expression statement keeps that value; any other
    /// branch (empty, or ending in `let`) yields null.
    fn keep_branch_value(&mut self) -> Result<(), CompileError> {
        if self.last_instruction_is(Opcode::Pop) {
            self.remove_last_pop();
        } else {
            self.emit(Opcode::Null, &[])?;
        }
        Ok(())
    }

    fn compile_function(
        &mut self,
        name: Option<&str>,
        parameters: &[String],
        body: &Block,
    ) -> Result<(), CompileError> {
        self.enter_scope();
        let scope = self.scope().symbols;

        if let Some(name) = name {
            self.symbols.define_function_name(scope, name);
        }
        for parameter in parameters {
            self.symbols.define(scope, parameter)?;
        }

        self.compile_block(body)?;

        if self.scope().instructions.is_empty() {
            self.emit(Opcode::ReturnNull, &[])?;
        } else if self.last_instruction_is(Opcode::Pop) {
            self.replace_last_pop_with_return();
        } else {
            self.emit(Opcode::ReturnNull, &[])?;
        }

        let free_symbols = self.symbols.free_symbols(scope).to_vec();
        let num_locals = self.symbols.num_definitions(scope);
        let instructions = self.leave_scope()?;

        // push the captured values in the enclosing scope
        for symbol in &free_symbols {
            self.load_symbol(symbol)?;
        }

        let function = CompiledFunction {
            instructions,
            num_locals,
            num_parameters: parameters.len(),
        };
        let index = self.add_constant(Value::CompiledFunction(Rc::new(function)));
        self.emit(Opcode::GetClosure, &[index, free_symbols.len()])?;

        Ok(())
    }

    fn load_symbol(&mut self, symbol: &Symbol) -> Result<(), CompileError> {
        match symbol.scope {
            SymbolScope::Global => self.emit(Opcode::GetGlobal, &[symbol.index])?,
            SymbolScope::Local => self.emit(Opcode::GetLocal, &[symbol.index])?,
            SymbolScope::Builtin => self.emit(Opcode::LoadBuiltin, &[symbol.index])?,
            SymbolScope::Free => self.emit(Opcode::GetFree, &[symbol.index])?,
            SymbolScope::Function => self.emit(Opcode::CurrentClosure, &[])?,
        };
        Ok(())
    }

    // ------------------------------------------------------------------
    // emission
    // ------------------------------------------------------------------

    fn scope(&self) -> &CompilationScope {
        // the root scope is never popped
        &self.scopes[self.scopes.len() - 1]
    }

    fn scope_mut(&mut self) -> &mut CompilationScope {
        let last = self.scopes.len() - 1;
        &mut self.scopes[last]
    }

    fn enter_scope(&mut self) {
        let parent = self.scope().symbols;
        let child = self.symbols.child(parent);
        self.scopes.push(CompilationScope::new(child));
    }

    fn leave_scope(&mut self) -> Result<Instructions, CompileError> {
        if self.scopes.len() == 1 {
            return Err(CompileError::internal("cannot leave the top-level scope"));
        }
        let scope = self
            .scopes
            .pop()
            .ok_or_else(|| CompileError::internal("compilation scope stack is empty"))?;
        Ok(scope.instructions)
    }

    fn add_constant(&mut self, value: Value) -> usize {
        self.constants.push(value);
        self.constants.len() - 1
    }

    /// Encode and append one instruction, returning its offset.
    fn emit(&mut self, opcode: Opcode, operands: &[usize]) -> Result<usize, CompileError> {
        check_operands(opcode, operands)?;

        let bytes = make(opcode, operands);
        let scope = self.scope_mut();
        let position = scope.instructions.append(&bytes);

        scope.previous = scope.last;
        scope.last = Some(EmittedInstruction { opcode, position });

        Ok(position)
    }

    fn last_instruction_is(&self, opcode: Opcode) -> bool {
        !self.scope().instructions.is_empty()
            && self.scope().last.is_some_and(|last| last.opcode == opcode)
    }

    fn remove_last_pop(&mut self) {
        let scope = self.scope_mut();
        if let Some(last) = scope.last {
            scope.instructions.truncate(last.position);
            scope.last = scope.previous;
        }
    }

    fn replace_last_pop_with_return(&mut self) {
        let scope = self.scope_mut();
        if let Some(last) = scope.last.as_mut() {
            scope
                .instructions
                .replace(last.position, &make(Opcode::Return, &[]));
            last.opcode = Opcode::Return;
        }
    }

    /// Backpatch the operand of the instruction at `position`.
    fn change_operand(&mut self, position: usize, operand: usize) -> Result<(), CompileError> {
        let byte = self.scope().instructions.as_bytes()[position];
        let opcode = Opcode::try_from(byte).map_err(|e| CompileError::internal(e.to_string()))?;
        check_operands(opcode, &[operand])?;
        self.scope_mut()
            .instructions
            .replace(position, &make(opcode, &[operand]));
        Ok(())
    }
}

fn check_operands(opcode: Opcode, operands: &[usize]) -> Result<(), CompileError> {
    let widths = opcode.definition().operand_widths;
    if widths.len() != operands.len() {
        return Err(CompileError::internal(format!(
            "{} takes {} operands, got {}",
            opcode,
            widths.len(),
            operands.len()
        )));
    }

    for (operand, width) in operands.iter().zip(widths) {
        let max = match width {
            1 => u8::MAX as usize,
            _ => u16::MAX as usize,
        };
        if *operand > max {
            return Err(CompileError::OperandOverflow {
                opcode,
                operand: *operand,
                max,
            });
        }
    }

    Ok(())
}
