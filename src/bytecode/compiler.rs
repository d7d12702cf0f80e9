//! Bytecode compiler: lowers the AST into instructions and constants.

use std::rc::Rc;

use crate::ast::{Block, Expr, InfixOp, PrefixOp, Program, Stmt};
use crate::bytecode::instruction::{make, Instructions, OpCode};
use crate::bytecode::symbol_table::{Symbol, SymbolScope, SymbolTable};
use crate::bytecode::value::{CompiledFunction, Value};
use crate::error::CompileError;

/// Result type for compilation.
pub type CompileResult<T> = Result<T, CompileError>;

/// Placeholder jump operand, back-patched once the target is known.
const PLACEHOLDER_JUMP: usize = 9999;

/// Compiler output: the root instruction stream plus the constant pool.
#[derive(Debug, Clone)]
pub struct Bytecode {
    pub instructions: Instructions,
    pub constants: Vec<Value>,
}

/// The opcode and offset of an emitted instruction.
#[derive(Debug, Clone, Copy)]
struct EmittedInstruction {
    opcode: OpCode,
    position: usize,
}

/// Per-function emission state. The last two emissions are tracked so a
/// trailing `Pop` can be stripped or rewritten to `ReturnValue`.
#[derive(Debug, Default)]
struct CompilationScope {
    instructions: Instructions,
    last_instruction: Option<EmittedInstruction>,
    previous_instruction: Option<EmittedInstruction>,
}

/// The bytecode compiler.
pub struct Compiler {
    constants: Vec<Value>,
    symbol_table: SymbolTable,
    scopes: Vec<CompilationScope>,
    scope_index: usize,
}

impl Compiler {
    /// Create a compiler with a fresh symbol table seeded with the builtin
    /// registry.
    pub fn new() -> Self {
        Self {
            constants: Vec::new(),
            symbol_table: SymbolTable::with_builtins(),
            scopes: vec![CompilationScope::default()],
            scope_index: 0,
        }
    }

    /// Create a compiler continuing from previous state. The REPL threads
    /// the symbol table and constant pool through successive inputs so
    /// global indices and constant indices stay stable.
    pub fn new_with_state(symbol_table: SymbolTable, constants: Vec<Value>) -> Self {
        Self {
            constants,
            symbol_table,
            scopes: vec![CompilationScope::default()],
            scope_index: 0,
        }
    }

    /// Reclaim the symbol table and constant pool for the next compilation.
    pub fn into_state(self) -> (SymbolTable, Vec<Value>) {
        (self.symbol_table, self.constants)
    }

    /// Compile a program into the root scope.
    pub fn compile(&mut self, program: &Program) -> CompileResult<()> {
        for stmt in &program.statements {
            self.compile_statement(stmt)?;
        }
        Ok(())
    }

    /// The compiled root instructions and constant pool.
    pub fn bytecode(&self) -> Bytecode {
        Bytecode {
            instructions: self.scopes[0].instructions.clone(),
            constants: self.constants.clone(),
        }
    }

    // ===== Statements =====

    fn compile_statement(&mut self, stmt: &Stmt) -> CompileResult<()> {
        match stmt {
            Stmt::Expression(expr) => {
                self.compile_expression(expr)?;
                self.emit(OpCode::Pop, &[]);
            }

            Stmt::Let { name, value } => {
                // Defining before compiling the value lets function
                // literals refer to their own binding.
                let symbol = self.symbol_table.define(name);
                self.compile_expression(value)?;

                match symbol.scope {
                    SymbolScope::Global => {
                        self.emit(OpCode::SetGlobal, &[symbol.index]);
                    }
                    _ => {
                        if symbol.index > u8::MAX as usize {
                            return Err(CompileError::TooManyLocals);
                        }
                        self.emit(OpCode::SetLocal, &[symbol.index]);
                    }
                }
            }

            Stmt::Return(value) => {
                self.compile_expression(value)?;
                self.emit(OpCode::ReturnValue, &[]);
            }
        }

        Ok(())
    }

    fn compile_block(&mut self, block: &Block) -> CompileResult<()> {
        for stmt in &block.statements {
            self.compile_statement(stmt)?;
        }
        Ok(())
    }

    // ===== Expressions =====

    fn compile_expression(&mut self, expr: &Expr) -> CompileResult<()> {
        match expr {
            Expr::IntLiteral(value) => {
                let index = self.add_constant(Value::Int(*value))?;
                self.emit(OpCode::Constant, &[index]);
            }

            Expr::StringLiteral(value) => {
                let index = self.add_constant(Value::String(Rc::new(value.clone())))?;
                self.emit(OpCode::Constant, &[index]);
            }

            Expr::BoolLiteral(value) => {
                if *value {
                    self.emit(OpCode::True, &[]);
                } else {
                    self.emit(OpCode::False, &[]);
                }
            }

            Expr::Identifier(name) => {
                let symbol = self
                    .symbol_table
                    .resolve(name)
                    .ok_or_else(|| CompileError::UndefinedVariable(name.clone()))?;
                self.load_symbol(&symbol);
            }

            Expr::Prefix { operator, right } => {
                self.compile_expression(right)?;
                match operator {
                    PrefixOp::Bang => self.emit(OpCode::Bang, &[]),
                    PrefixOp::Minus => self.emit(OpCode::Minus, &[]),
                };
            }

            Expr::Infix {
                left,
                operator,
                right,
            } => {
                // `<` is rewritten as a flipped `>` so the VM only needs
                // one ordering opcode.
                if *operator == InfixOp::Less {
                    self.compile_expression(right)?;
                    self.compile_expression(left)?;
                    self.emit(OpCode::GreaterThan, &[]);
                    return Ok(());
                }

                self.compile_expression(left)?;
                self.compile_expression(right)?;

                let op = match operator {
                    InfixOp::Add => OpCode::Add,
                    InfixOp::Subtract => OpCode::Sub,
                    InfixOp::Multiply => OpCode::Mul,
                    InfixOp::Divide => OpCode::Div,
                    InfixOp::Equal => OpCode::Equal,
                    InfixOp::NotEqual => OpCode::NotEqual,
                    InfixOp::Greater => OpCode::GreaterThan,
                    InfixOp::Less => unreachable!("rewritten above"),
                };
                self.emit(op, &[]);
            }

            Expr::If {
                condition,
                consequence,
                alternative,
            } => {
                self.compile_expression(condition)?;

                let jump_not_truthy_pos =
                    self.emit(OpCode::JumpNotTruthy, &[PLACEHOLDER_JUMP]);

                self.compile_block(consequence)?;
                if self.last_instruction_is(OpCode::Pop) {
                    self.remove_last_pop();
                }

                let jump_pos = self.emit(OpCode::Jump, &[PLACEHOLDER_JUMP]);

                let after_consequence = self.current_instructions().len();
                self.change_operand(jump_not_truthy_pos, after_consequence);

                match alternative {
                    None => {
                        self.emit(OpCode::Null, &[]);
                    }
                    Some(alt) => {
                        self.compile_block(alt)?;
                        if self.last_instruction_is(OpCode::Pop) {
                            self.remove_last_pop();
                        }
                    }
                }

                let after_alternative = self.current_instructions().len();
                self.change_operand(jump_pos, after_alternative);
            }

            Expr::Array(elements) => {
                for element in elements {
                    self.compile_expression(element)?;
                }
                self.emit(OpCode::Array, &[elements.len()]);
            }

            Expr::Hash(pairs) => {
                // Sort keys by their rendered source form so recompiling
                // the same program yields identical bytes.
                let mut sorted: Vec<&(Expr, Expr)> = pairs.iter().collect();
                sorted.sort_by_key(|(key, _)| key.to_string());

                for (key, value) in sorted {
                    self.compile_expression(key)?;
                    self.compile_expression(value)?;
                }
                // Operand counts stack entries, two per pair.
                self.emit(OpCode::Hash, &[pairs.len() * 2]);
            }

            Expr::Index { left, index } => {
                self.compile_expression(left)?;
                self.compile_expression(index)?;
                self.emit(OpCode::Index, &[]);
            }

            Expr::Function {
                name,
                parameters,
                body,
            } => {
                self.enter_scope();

                if let Some(name) = name {
                    self.symbol_table.define_function_name(name);
                }
                for parameter in parameters {
                    self.symbol_table.define(parameter);
                }

                self.compile_block(body)?;

                // An expression body leaves its value via ReturnValue; an
                // empty or statement-only body returns null.
                if self.last_instruction_is(OpCode::Pop) {
                    self.replace_last_pop_with_return();
                }
                if !self.last_instruction_is(OpCode::ReturnValue) {
                    self.emit(OpCode::Return, &[]);
                }

                let free_symbols = self.symbol_table.free_symbols.clone();
                let num_locals = self.symbol_table.num_definitions;
                let instructions = self.leave_scope();

                // Load each capture's origin in free-list order; the callee
                // sees them at the same indices through GetFree.
                for symbol in &free_symbols {
                    self.load_symbol(symbol);
                }

                let function = CompiledFunction {
                    instructions,
                    num_locals,
                    num_parameters: parameters.len(),
                };
                let index = self.add_constant(Value::Function(Rc::new(function)))?;
                self.emit(OpCode::Closure, &[index, free_symbols.len()]);
            }

            Expr::Call {
                function,
                arguments,
            } => {
                self.compile_expression(function)?;
                for argument in arguments {
                    self.compile_expression(argument)?;
                }
                self.emit(OpCode::Call, &[arguments.len()]);
            }
        }

        Ok(())
    }

    fn load_symbol(&mut self, symbol: &Symbol) {
        match symbol.scope {
            SymbolScope::Global => self.emit(OpCode::GetGlobal, &[symbol.index]),
            SymbolScope::Local => self.emit(OpCode::GetLocal, &[symbol.index]),
            SymbolScope::Free => self.emit(OpCode::GetFree, &[symbol.index]),
            SymbolScope::Builtin => self.emit(OpCode::GetBuiltin, &[symbol.index]),
            SymbolScope::Function => self.emit(OpCode::CurrentClosure, &[]),
        };
    }

    // ===== Scope management =====

    fn enter_scope(&mut self) {
        self.scopes.push(CompilationScope::default());
        self.scope_index += 1;

        let outer = std::mem::take(&mut self.symbol_table);
        self.symbol_table = SymbolTable::new_enclosed(outer);
    }

    fn leave_scope(&mut self) -> Instructions {
        let scope = self.scopes.pop().expect("scope stack underflow");
        self.scope_index -= 1;

        let table = std::mem::take(&mut self.symbol_table);
        self.symbol_table = table.into_outer().expect("left the root scope");

        scope.instructions
    }

    // ===== Emission =====

    fn current_instructions(&self) -> &Instructions {
        &self.scopes[self.scope_index].instructions
    }

    /// Append an encoded instruction to the current scope and return the
    /// offset of its opcode byte.
    fn emit(&mut self, op: OpCode, operands: &[usize]) -> usize {
        let instruction = make(op, operands);
        let position = self.add_instruction(&instruction);
        self.set_last_instruction(op, position);
        position
    }

    fn add_instruction(&mut self, instruction: &[u8]) -> usize {
        let scope = &mut self.scopes[self.scope_index];
        let position = scope.instructions.len();
        scope.instructions.extend_from_slice(instruction);
        position
    }

    fn add_constant(&mut self, value: Value) -> CompileResult<usize> {
        if self.constants.len() > u16::MAX as usize {
            return Err(CompileError::TooManyConstants);
        }
        self.constants.push(value);
        Ok(self.constants.len() - 1)
    }

    fn set_last_instruction(&mut self, opcode: OpCode, position: usize) {
        let scope = &mut self.scopes[self.scope_index];
        scope.previous_instruction = scope.last_instruction;
        scope.last_instruction = Some(EmittedInstruction { opcode, position });
    }

    fn last_instruction_is(&self, opcode: OpCode) -> bool {
        self.scopes[self.scope_index]
            .last_instruction
            .is_some_and(|last| last.opcode == opcode)
    }

    fn remove_last_pop(&mut self) {
        let scope = &mut self.scopes[self.scope_index];
        let last = scope.last_instruction.expect("no instruction to remove");

        scope.instructions.truncate(last.position);
        scope.last_instruction = scope.previous_instruction.take();
    }

    fn replace_instruction(&mut self, position: usize, new_instruction: &[u8]) {
        let instructions = &mut self.scopes[self.scope_index].instructions;
        instructions[position..position + new_instruction.len()]
            .copy_from_slice(new_instruction);
    }

    /// Re-encode the operand of the jump emitted at `position`.
    fn change_operand(&mut self, position: usize, operand: usize) {
        let byte = self.current_instructions()[position];
        let op = match OpCode::from_u8(byte) {
            Some(op) => op,
            None => panic!("tried to patch undefined opcode {} at {}", byte, position),
        };
        let new_instruction = make(op, &[operand]);
        self.replace_instruction(position, &new_instruction);
    }

    fn replace_last_pop_with_return(&mut self) {
        let last = self.scopes[self.scope_index]
            .last_instruction
            .expect("no instruction to replace");

        self.replace_instruction(last.position, &make(OpCode::ReturnValue, &[]));
        if let Some(last) = &mut self.scopes[self.scope_index].last_instruction {
            last.opcode = OpCode::ReturnValue;
        }
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::disassembler::disassemble;
    use crate::lexer::Scanner;
    use crate::parser::Parser;

    enum Constant {
        Int(i64),
        Str(&'static str),
        Function(Vec<Instructions>),
    }

    fn compile_source(source: &str) -> Bytecode {
        let tokens = Scanner::new(source).scan_tokens().unwrap();
        let program = Parser::new(tokens).parse().unwrap();
        let mut compiler = Compiler::new();
        compiler.compile(&program).unwrap();
        compiler.bytecode()
    }

    fn concat(instructions: Vec<Instructions>) -> Instructions {
        instructions.into_iter().flatten().collect()
    }

    fn assert_instructions(expected: Vec<Instructions>, actual: &Instructions) {
        let expected = concat(expected);
        assert_eq!(
            &expected,
            actual,
            "wrong instructions.\nwant:\n{}got:\n{}",
            disassemble(&expected),
            disassemble(actual),
        );
    }

    fn assert_constants(expected: Vec<Constant>, actual: &[Value]) {
        assert_eq!(expected.len(), actual.len(), "wrong number of constants");

        for (i, want) in expected.into_iter().enumerate() {
            match (want, &actual[i]) {
                (Constant::Int(want), Value::Int(got)) => {
                    assert_eq!(want, *got, "constant {}", i)
                }
                (Constant::Str(want), Value::String(got)) => {
                    assert_eq!(want, got.as_str(), "constant {}", i)
                }
                (Constant::Function(want), Value::Function(got)) => {
                    assert_instructions(want, &got.instructions)
                }
                (_, got) => panic!("constant {} has wrong type: {:?}", i, got),
            }
        }
    }

    fn run_compiler_test(
        input: &str,
        expected_constants: Vec<Constant>,
        expected_instructions: Vec<Instructions>,
    ) {
        let bytecode = compile_source(input);
        assert_instructions(expected_instructions, &bytecode.instructions);
        assert_constants(expected_constants, &bytecode.constants);
    }

    #[test]
    fn test_integer_arithmetic() {
        run_compiler_test(
            "1 + 2",
            vec![Constant::Int(1), Constant::Int(2)],
            vec![
                make(OpCode::Constant, &[0]),
                make(OpCode::Constant, &[1]),
                make(OpCode::Add, &[]),
                make(OpCode::Pop, &[]),
            ],
        );

        run_compiler_test(
            "1; 2",
            vec![Constant::Int(1), Constant::Int(2)],
            vec![
                make(OpCode::Constant, &[0]),
                make(OpCode::Pop, &[]),
                make(OpCode::Constant, &[1]),
                make(OpCode::Pop, &[]),
            ],
        );

        run_compiler_test(
            "1 - 2",
            vec![Constant::Int(1), Constant::Int(2)],
            vec![
                make(OpCode::Constant, &[0]),
                make(OpCode::Constant, &[1]),
                make(OpCode::Sub, &[]),
                make(OpCode::Pop, &[]),
            ],
        );

        run_compiler_test(
            "2 * 3 / 1",
            vec![Constant::Int(2), Constant::Int(3), Constant::Int(1)],
            vec![
                make(OpCode::Constant, &[0]),
                make(OpCode::Constant, &[1]),
                make(OpCode::Mul, &[]),
                make(OpCode::Constant, &[2]),
                make(OpCode::Div, &[]),
                make(OpCode::Pop, &[]),
            ],
        );

        run_compiler_test(
            "-1",
            vec![Constant::Int(1)],
            vec![
                make(OpCode::Constant, &[0]),
                make(OpCode::Minus, &[]),
                make(OpCode::Pop, &[]),
            ],
        );
    }

    #[test]
    fn test_boolean_expressions() {
        run_compiler_test(
            "true",
            vec![],
            vec![make(OpCode::True, &[]), make(OpCode::Pop, &[])],
        );

        run_compiler_test(
            "1 > 2",
            vec![Constant::Int(1), Constant::Int(2)],
            vec![
                make(OpCode::Constant, &[0]),
                make(OpCode::Constant, &[1]),
                make(OpCode::GreaterThan, &[]),
                make(OpCode::Pop, &[]),
            ],
        );

        // `<` swaps its operands and reuses GreaterThan.
        run_compiler_test(
            "1 < 2",
            vec![Constant::Int(2), Constant::Int(1)],
            vec![
                make(OpCode::Constant, &[0]),
                make(OpCode::Constant, &[1]),
                make(OpCode::GreaterThan, &[]),
                make(OpCode::Pop, &[]),
            ],
        );

        run_compiler_test(
            "1 == 2",
            vec![Constant::Int(1), Constant::Int(2)],
            vec![
                make(OpCode::Constant, &[0]),
                make(OpCode::Constant, &[1]),
                make(OpCode::Equal, &[]),
                make(OpCode::Pop, &[]),
            ],
        );

        run_compiler_test(
            "true != false",
            vec![],
            vec![
                make(OpCode::True, &[]),
                make(OpCode::False, &[]),
                make(OpCode::NotEqual, &[]),
                make(OpCode::Pop, &[]),
            ],
        );

        run_compiler_test(
            "!true",
            vec![],
            vec![
                make(OpCode::True, &[]),
                make(OpCode::Bang, &[]),
                make(OpCode::Pop, &[]),
            ],
        );
    }

    #[test]
    fn test_conditionals() {
        run_compiler_test(
            "if (true) { 10 }; 3333;",
            vec![Constant::Int(10), Constant::Int(3333)],
            vec![
                // 0000
                make(OpCode::True, &[]),
                // 0001
                make(OpCode::JumpNotTruthy, &[10]),
                // 0004
                make(OpCode::Constant, &[0]),
                // 0007
                make(OpCode::Jump, &[11]),
                // 0010
                make(OpCode::Null, &[]),
                // 0011
                make(OpCode::Pop, &[]),
                // 0012
                make(OpCode::Constant, &[1]),
                // 0015
                make(OpCode::Pop, &[]),
            ],
        );

        run_compiler_test(
            "if (true) { 10 } else { 20 }; 3333;",
            vec![Constant::Int(10), Constant::Int(20), Constant::Int(3333)],
            vec![
                // 0000
                make(OpCode::True, &[]),
                // 0001
                make(OpCode::JumpNotTruthy, &[10]),
                // 0004
                make(OpCode::Constant, &[0]),
                // 0007
                make(OpCode::Jump, &[13]),
                // 0010
                make(OpCode::Constant, &[1]),
                // 0013
                make(OpCode::Pop, &[]),
                // 0014
                make(OpCode::Constant, &[2]),
                // 0017
                make(OpCode::Pop, &[]),
            ],
        );
    }

    #[test]
    fn test_global_let_statements() {
        run_compiler_test(
            "let one = 1; let two = 2;",
            vec![Constant::Int(1), Constant::Int(2)],
            vec![
                make(OpCode::Constant, &[0]),
                make(OpCode::SetGlobal, &[0]),
                make(OpCode::Constant, &[1]),
                make(OpCode::SetGlobal, &[1]),
            ],
        );

        run_compiler_test(
            "let one = 1; one;",
            vec![Constant::Int(1)],
            vec![
                make(OpCode::Constant, &[0]),
                make(OpCode::SetGlobal, &[0]),
                make(OpCode::GetGlobal, &[0]),
                make(OpCode::Pop, &[]),
            ],
        );
    }

    #[test]
    fn test_string_expressions() {
        run_compiler_test(
            "\"maki\"",
            vec![Constant::Str("maki")],
            vec![make(OpCode::Constant, &[0]), make(OpCode::Pop, &[])],
        );

        run_compiler_test(
            "\"ma\" + \"ki\"",
            vec![Constant::Str("ma"), Constant::Str("ki")],
            vec![
                make(OpCode::Constant, &[0]),
                make(OpCode::Constant, &[1]),
                make(OpCode::Add, &[]),
                make(OpCode::Pop, &[]),
            ],
        );
    }

    #[test]
    fn test_array_literals() {
        run_compiler_test(
            "[]",
            vec![],
            vec![make(OpCode::Array, &[0]), make(OpCode::Pop, &[])],
        );

        run_compiler_test(
            "[1, 2, 3]",
            vec![Constant::Int(1), Constant::Int(2), Constant::Int(3)],
            vec![
                make(OpCode::Constant, &[0]),
                make(OpCode::Constant, &[1]),
                make(OpCode::Constant, &[2]),
                make(OpCode::Array, &[3]),
                make(OpCode::Pop, &[]),
            ],
        );

        run_compiler_test(
            "[1 + 2, 3 - 4]",
            vec![
                Constant::Int(1),
                Constant::Int(2),
                Constant::Int(3),
                Constant::Int(4),
            ],
            vec![
                make(OpCode::Constant, &[0]),
                make(OpCode::Constant, &[1]),
                make(OpCode::Add, &[]),
                make(OpCode::Constant, &[2]),
                make(OpCode::Constant, &[3]),
                make(OpCode::Sub, &[]),
                make(OpCode::Array, &[2]),
                make(OpCode::Pop, &[]),
            ],
        );
    }

    #[test]
    fn test_hash_literals() {
        run_compiler_test(
            "{}",
            vec![],
            vec![make(OpCode::Hash, &[0]), make(OpCode::Pop, &[])],
        );

        run_compiler_test(
            "{1: 2, 3: 4, 5: 6}",
            vec![
                Constant::Int(1),
                Constant::Int(2),
                Constant::Int(3),
                Constant::Int(4),
                Constant::Int(5),
                Constant::Int(6),
            ],
            vec![
                make(OpCode::Constant, &[0]),
                make(OpCode::Constant, &[1]),
                make(OpCode::Constant, &[2]),
                make(OpCode::Constant, &[3]),
                make(OpCode::Constant, &[4]),
                make(OpCode::Constant, &[5]),
                make(OpCode::Hash, &[6]),
                make(OpCode::Pop, &[]),
            ],
        );

        run_compiler_test(
            "{1: 2 + 3, 4: 5 * 6}",
            vec![
                Constant::Int(1),
                Constant::Int(2),
                Constant::Int(3),
                Constant::Int(4),
                Constant::Int(5),
                Constant::Int(6),
            ],
            vec![
                make(OpCode::Constant, &[0]),
                make(OpCode::Constant, &[1]),
                make(OpCode::Constant, &[2]),
                make(OpCode::Add, &[]),
                make(OpCode::Constant, &[3]),
                make(OpCode::Constant, &[4]),
                make(OpCode::Constant, &[5]),
                make(OpCode::Mul, &[]),
                make(OpCode::Hash, &[4]),
                make(OpCode::Pop, &[]),
            ],
        );
    }

    #[test]
    fn test_hash_keys_sort_by_source_form() {
        // Keys are emitted in rendered order, not source order.
        run_compiler_test(
            "{\"b\": 1, \"a\": 2}",
            vec![
                Constant::Str("a"),
                Constant::Int(2),
                Constant::Str("b"),
                Constant::Int(1),
            ],
            vec![
                make(OpCode::Constant, &[0]),
                make(OpCode::Constant, &[1]),
                make(OpCode::Constant, &[2]),
                make(OpCode::Constant, &[3]),
                make(OpCode::Hash, &[4]),
                make(OpCode::Pop, &[]),
            ],
        );
    }

    #[test]
    fn test_recompilation_is_deterministic() {
        let source = "let h = {\"one\": 1, \"two\": 2, \"three\": 3}; h[\"two\"]";
        let first = compile_source(source);
        let second = compile_source(source);

        assert_eq!(first.instructions, second.instructions);
        assert_eq!(first.constants.len(), second.constants.len());
    }

    #[test]
    fn test_index_expressions() {
        run_compiler_test(
            "[1, 2, 3][1 + 1]",
            vec![
                Constant::Int(1),
                Constant::Int(2),
                Constant::Int(3),
                Constant::Int(1),
                Constant::Int(1),
            ],
            vec![
                make(OpCode::Constant, &[0]),
                make(OpCode::Constant, &[1]),
                make(OpCode::Constant, &[2]),
                make(OpCode::Array, &[3]),
                make(OpCode::Constant, &[3]),
                make(OpCode::Constant, &[4]),
                make(OpCode::Add, &[]),
                make(OpCode::Index, &[]),
                make(OpCode::Pop, &[]),
            ],
        );

        run_compiler_test(
            "{1: 2}[2 - 1]",
            vec![
                Constant::Int(1),
                Constant::Int(2),
                Constant::Int(2),
                Constant::Int(1),
            ],
            vec![
                make(OpCode::Constant, &[0]),
                make(OpCode::Constant, &[1]),
                make(OpCode::Hash, &[2]),
                make(OpCode::Constant, &[2]),
                make(OpCode::Constant, &[3]),
                make(OpCode::Sub, &[]),
                make(OpCode::Index, &[]),
                make(OpCode::Pop, &[]),
            ],
        );
    }

    #[test]
    fn test_functions() {
        run_compiler_test(
            "fn() { return 5 + 10 }",
            vec![
                Constant::Int(5),
                Constant::Int(10),
                Constant::Function(vec![
                    make(OpCode::Constant, &[0]),
                    make(OpCode::Constant, &[1]),
                    make(OpCode::Add, &[]),
                    make(OpCode::ReturnValue, &[]),
                ]),
            ],
            vec![make(OpCode::Closure, &[2, 0]), make(OpCode::Pop, &[])],
        );

        // The implicit form compiles identically: the trailing Pop is
        // rewritten to ReturnValue.
        run_compiler_test(
            "fn() { 5 + 10 }",
            vec![
                Constant::Int(5),
                Constant::Int(10),
                Constant::Function(vec![
                    make(OpCode::Constant, &[0]),
                    make(OpCode::Constant, &[1]),
                    make(OpCode::Add, &[]),
                    make(OpCode::ReturnValue, &[]),
                ]),
            ],
            vec![make(OpCode::Closure, &[2, 0]), make(OpCode::Pop, &[])],
        );

        run_compiler_test(
            "fn() { 1; 2 }",
            vec![
                Constant::Int(1),
                Constant::Int(2),
                Constant::Function(vec![
                    make(OpCode::Constant, &[0]),
                    make(OpCode::Pop, &[]),
                    make(OpCode::Constant, &[1]),
                    make(OpCode::ReturnValue, &[]),
                ]),
            ],
            vec![make(OpCode::Closure, &[2, 0]), make(OpCode::Pop, &[])],
        );

        run_compiler_test(
            "fn() { }",
            vec![Constant::Function(vec![make(OpCode::Return, &[])])],
            vec![make(OpCode::Closure, &[0, 0]), make(OpCode::Pop, &[])],
        );
    }

    #[test]
    fn test_function_calls() {
        run_compiler_test(
            "fn() { 24 }();",
            vec![
                Constant::Int(24),
                Constant::Function(vec![
                    make(OpCode::Constant, &[0]),
                    make(OpCode::ReturnValue, &[]),
                ]),
            ],
            vec![
                make(OpCode::Closure, &[1, 0]),
                make(OpCode::Call, &[0]),
                make(OpCode::Pop, &[]),
            ],
        );

        run_compiler_test(
            "let noArg = fn() { 24 }; noArg();",
            vec![
                Constant::Int(24),
                Constant::Function(vec![
                    make(OpCode::Constant, &[0]),
                    make(OpCode::ReturnValue, &[]),
                ]),
            ],
            vec![
                make(OpCode::Closure, &[1, 0]),
                make(OpCode::SetGlobal, &[0]),
                make(OpCode::GetGlobal, &[0]),
                make(OpCode::Call, &[0]),
                make(OpCode::Pop, &[]),
            ],
        );

        run_compiler_test(
            "let manyArg = fn(a, b, c) { a; b; c }; manyArg(24, 25, 26);",
            vec![
                Constant::Function(vec![
                    make(OpCode::GetLocal, &[0]),
                    make(OpCode::Pop, &[]),
                    make(OpCode::GetLocal, &[1]),
                    make(OpCode::Pop, &[]),
                    make(OpCode::GetLocal, &[2]),
                    make(OpCode::ReturnValue, &[]),
                ]),
                Constant::Int(24),
                Constant::Int(25),
                Constant::Int(26),
            ],
            vec![
                make(OpCode::Closure, &[0, 0]),
                make(OpCode::SetGlobal, &[0]),
                make(OpCode::GetGlobal, &[0]),
                make(OpCode::Constant, &[1]),
                make(OpCode::Constant, &[2]),
                make(OpCode::Constant, &[3]),
                make(OpCode::Call, &[3]),
                make(OpCode::Pop, &[]),
            ],
        );
    }

    #[test]
    fn test_let_statement_scopes() {
        run_compiler_test(
            "let num = 55; fn() { num }",
            vec![
                Constant::Int(55),
                Constant::Function(vec![
                    make(OpCode::GetGlobal, &[0]),
                    make(OpCode::ReturnValue, &[]),
                ]),
            ],
            vec![
                make(OpCode::Constant, &[0]),
                make(OpCode::SetGlobal, &[0]),
                make(OpCode::Closure, &[1, 0]),
                make(OpCode::Pop, &[]),
            ],
        );

        run_compiler_test(
            "fn() { let num = 55; num }",
            vec![
                Constant::Int(55),
                Constant::Function(vec![
                    make(OpCode::Constant, &[0]),
                    make(OpCode::SetLocal, &[0]),
                    make(OpCode::GetLocal, &[0]),
                    make(OpCode::ReturnValue, &[]),
                ]),
            ],
            vec![make(OpCode::Closure, &[1, 0]), make(OpCode::Pop, &[])],
        );

        run_compiler_test(
            "fn() { let a = 55; let b = 77; a + b }",
            vec![
                Constant::Int(55),
                Constant::Int(77),
                Constant::Function(vec![
                    make(OpCode::Constant, &[0]),
                    make(OpCode::SetLocal, &[0]),
                    make(OpCode::Constant, &[1]),
                    make(OpCode::SetLocal, &[1]),
                    make(OpCode::GetLocal, &[0]),
                    make(OpCode::GetLocal, &[1]),
                    make(OpCode::Add, &[]),
                    make(OpCode::ReturnValue, &[]),
                ]),
            ],
            vec![make(OpCode::Closure, &[2, 0]), make(OpCode::Pop, &[])],
        );
    }

    #[test]
    fn test_builtins() {
        run_compiler_test(
            "len([]); push([], 1);",
            vec![Constant::Int(1)],
            vec![
                make(OpCode::GetBuiltin, &[0]),
                make(OpCode::Array, &[0]),
                make(OpCode::Call, &[1]),
                make(OpCode::Pop, &[]),
                make(OpCode::GetBuiltin, &[4]),
                make(OpCode::Array, &[0]),
                make(OpCode::Constant, &[0]),
                make(OpCode::Call, &[2]),
                make(OpCode::Pop, &[]),
            ],
        );

        run_compiler_test(
            "fn() { len([]) }",
            vec![Constant::Function(vec![
                make(OpCode::GetBuiltin, &[0]),
                make(OpCode::Array, &[0]),
                make(OpCode::Call, &[1]),
                make(OpCode::ReturnValue, &[]),
            ])],
            vec![make(OpCode::Closure, &[0, 0]), make(OpCode::Pop, &[])],
        );
    }

    #[test]
    fn test_closures() {
        run_compiler_test(
            "fn(a) { fn(b) { a + b } }",
            vec![
                Constant::Function(vec![
                    make(OpCode::GetFree, &[0]),
                    make(OpCode::GetLocal, &[0]),
                    make(OpCode::Add, &[]),
                    make(OpCode::ReturnValue, &[]),
                ]),
                Constant::Function(vec![
                    make(OpCode::GetLocal, &[0]),
                    make(OpCode::Closure, &[0, 1]),
                    make(OpCode::ReturnValue, &[]),
                ]),
            ],
            vec![make(OpCode::Closure, &[1, 0]), make(OpCode::Pop, &[])],
        );

        run_compiler_test(
            "fn(a) { fn(b) { fn(c) { a + b + c } } }",
            vec![
                Constant::Function(vec![
                    make(OpCode::GetFree, &[0]),
                    make(OpCode::GetFree, &[1]),
                    make(OpCode::Add, &[]),
                    make(OpCode::GetLocal, &[0]),
                    make(OpCode::Add, &[]),
                    make(OpCode::ReturnValue, &[]),
                ]),
                Constant::Function(vec![
                    make(OpCode::GetFree, &[0]),
                    make(OpCode::GetLocal, &[0]),
                    make(OpCode::Closure, &[0, 2]),
                    make(OpCode::ReturnValue, &[]),
                ]),
                Constant::Function(vec![
                    make(OpCode::GetLocal, &[0]),
                    make(OpCode::Closure, &[1, 1]),
                    make(OpCode::ReturnValue, &[]),
                ]),
            ],
            vec![make(OpCode::Closure, &[2, 0]), make(OpCode::Pop, &[])],
        );

        run_compiler_test(
            "let global = 55;
             fn() {
                 let a = 66;
                 fn() {
                     let b = 77;
                     fn() {
                         let c = 88;
                         global + a + b + c;
                     }
                 }
             }",
            vec![
                Constant::Int(55),
                Constant::Int(66),
                Constant::Int(77),
                Constant::Int(88),
                Constant::Function(vec![
                    make(OpCode::Constant, &[3]),
                    make(OpCode::SetLocal, &[0]),
                    make(OpCode::GetGlobal, &[0]),
                    make(OpCode::GetFree, &[0]),
                    make(OpCode::Add, &[]),
                    make(OpCode::GetFree, &[1]),
                    make(OpCode::Add, &[]),
                    make(OpCode::GetLocal, &[0]),
                    make(OpCode::Add, &[]),
                    make(OpCode::ReturnValue, &[]),
                ]),
                Constant::Function(vec![
                    make(OpCode::Constant, &[2]),
                    make(OpCode::SetLocal, &[0]),
                    make(OpCode::GetFree, &[0]),
                    make(OpCode::GetLocal, &[0]),
                    make(OpCode::Closure, &[4, 2]),
                    make(OpCode::ReturnValue, &[]),
                ]),
                Constant::Function(vec![
                    make(OpCode::Constant, &[1]),
                    make(OpCode::SetLocal, &[0]),
                    make(OpCode::GetLocal, &[0]),
                    make(OpCode::Closure, &[5, 1]),
                    make(OpCode::ReturnValue, &[]),
                ]),
            ],
            vec![
                make(OpCode::Constant, &[0]),
                make(OpCode::SetGlobal, &[0]),
                make(OpCode::Closure, &[6, 0]),
                make(OpCode::Pop, &[]),
            ],
        );
    }

    #[test]
    fn test_recursive_functions() {
        run_compiler_test(
            "let countDown = fn(x) { countDown(x - 1); }; countDown(1);",
            vec![
                Constant::Int(1),
                Constant::Function(vec![
                    make(OpCode::CurrentClosure, &[]),
                    make(OpCode::GetLocal, &[0]),
                    make(OpCode::Constant, &[0]),
                    make(OpCode::Sub, &[]),
                    make(OpCode::Call, &[1]),
                    make(OpCode::ReturnValue, &[]),
                ]),
                Constant::Int(1),
            ],
            vec![
                make(OpCode::Closure, &[1, 0]),
                make(OpCode::SetGlobal, &[0]),
                make(OpCode::GetGlobal, &[0]),
                make(OpCode::Constant, &[2]),
                make(OpCode::Call, &[1]),
                make(OpCode::Pop, &[]),
            ],
        );

        run_compiler_test(
            "let wrapper = fn() {
                 let countDown = fn(x) { countDown(x - 1); };
                 countDown(1);
             };
             wrapper();",
            vec![
                Constant::Int(1),
                Constant::Function(vec![
                    make(OpCode::CurrentClosure, &[]),
                    make(OpCode::GetLocal, &[0]),
                    make(OpCode::Constant, &[0]),
                    make(OpCode::Sub, &[]),
                    make(OpCode::Call, &[1]),
                    make(OpCode::ReturnValue, &[]),
                ]),
                Constant::Int(1),
                Constant::Function(vec![
                    make(OpCode::Closure, &[1, 0]),
                    make(OpCode::SetLocal, &[0]),
                    make(OpCode::GetLocal, &[0]),
                    make(OpCode::Constant, &[2]),
                    make(OpCode::Call, &[1]),
                    make(OpCode::ReturnValue, &[]),
                ]),
            ],
            vec![
                make(OpCode::Closure, &[3, 0]),
                make(OpCode::SetGlobal, &[0]),
                make(OpCode::GetGlobal, &[0]),
                make(OpCode::Call, &[0]),
                make(OpCode::Pop, &[]),
            ],
        );
    }

    #[test]
    fn test_compiler_scopes() {
        let mut compiler = Compiler::new();
        assert_eq!(compiler.scope_index, 0);

        compiler.emit(OpCode::Mul, &[]);

        compiler.enter_scope();
        assert_eq!(compiler.scope_index, 1);
        assert!(!compiler.symbol_table.is_global());

        compiler.emit(OpCode::Sub, &[]);
        assert_eq!(compiler.scopes[compiler.scope_index].instructions.len(), 1);
        let last = compiler.scopes[compiler.scope_index]
            .last_instruction
            .unwrap();
        assert_eq!(last.opcode, OpCode::Sub);

        compiler.leave_scope();
        assert_eq!(compiler.scope_index, 0);
        assert!(compiler.symbol_table.is_global());

        compiler.emit(OpCode::Add, &[]);
        assert_eq!(compiler.scopes[compiler.scope_index].instructions.len(), 2);
        let last = compiler.scopes[compiler.scope_index]
            .last_instruction
            .unwrap();
        assert_eq!(last.opcode, OpCode::Add);
        let previous = compiler.scopes[compiler.scope_index]
            .previous_instruction
            .unwrap();
        assert_eq!(previous.opcode, OpCode::Mul);
    }

    #[test]
    fn test_undefined_variable() {
        let tokens = Scanner::new("x + 1").scan_tokens().unwrap();
        let program = Parser::new(tokens).parse().unwrap();
        let mut compiler = Compiler::new();

        let err = compiler.compile(&program).unwrap_err();
        assert_eq!(err.to_string(), "undefined variable: x");
    }
}
