//! Stack-based virtual machine for executing bytecode.

use std::rc::Rc;

use indexmap::IndexMap;

use crate::bytecode::builtins::BUILTINS;
use crate::bytecode::compiler::Bytecode;
use crate::bytecode::instruction::OpCode;
use crate::bytecode::value::{Builtin, Closure, CompiledFunction, HashPair, Value};
use crate::error::RuntimeError;

/// Operand stack capacity.
pub const STACK_SIZE: usize = 2048;
/// Global variable slots.
pub const GLOBALS_SIZE: usize = 65536;
/// Call frame capacity.
pub const MAX_FRAMES: usize = 1024;

/// Result type for VM operations.
pub type VmResult<T> = Result<T, RuntimeError>;

/// A call frame: the executing closure, the offset of the next unread
/// instruction byte, and the stack offset where this frame's locals begin.
/// Arguments occupy the first `num_parameters` local slots.
struct Frame {
    closure: Rc<Closure>,
    ip: usize,
    base_pointer: usize,
}

impl Frame {
    fn new(closure: Rc<Closure>, base_pointer: usize) -> Self {
        Self {
            closure,
            ip: 0,
            base_pointer,
        }
    }

    fn instructions(&self) -> &[u8] {
        &self.closure.function.instructions
    }
}

/// The bytecode virtual machine.
pub struct Vm {
    constants: Vec<Value>,
    stack: Vec<Value>,
    /// Points at the next free slot; the top of stack is `sp - 1`.
    sp: usize,
    globals: Vec<Value>,
    frames: Vec<Frame>,
}

impl Vm {
    /// Create a VM over compiled bytecode with fresh globals.
    pub fn new(bytecode: Bytecode) -> Self {
        Self::new_with_globals(bytecode, empty_globals())
    }

    /// Create a VM reusing an existing globals array. The REPL threads the
    /// array through successive inputs, paired with the compiler state that
    /// produced the matching global indices.
    pub fn new_with_globals(bytecode: Bytecode, globals: Vec<Value>) -> Self {
        let main_function = CompiledFunction {
            instructions: bytecode.instructions,
            num_locals: 0,
            num_parameters: 0,
        };
        let main_closure = Closure {
            function: Rc::new(main_function),
            free: Vec::new(),
        };

        Self {
            constants: bytecode.constants,
            stack: vec![Value::Null; STACK_SIZE],
            sp: 0,
            globals,
            frames: vec![Frame::new(Rc::new(main_closure), 0)],
        }
    }

    /// Reclaim the globals array for the next run.
    pub fn into_globals(self) -> Vec<Value> {
        self.globals
    }

    /// The slot just vacated by the last pop: the final value of a program
    /// that ends with an expression statement.
    pub fn last_popped_stack_elem(&self) -> Value {
        self.stack[self.sp].clone()
    }

    /// Execute to completion or first error.
    pub fn run(&mut self) -> VmResult<()> {
        while self.current_frame().ip < self.current_frame().instructions().len() {
            let byte = self.read_byte();
            let op = OpCode::from_u8(byte).ok_or(RuntimeError::UndefinedOpcode(byte))?;

            match op {
                OpCode::Constant => {
                    let index = self.read_u16() as usize;
                    let constant = self.constants[index].clone();
                    self.push(constant)?;
                }

                OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div => {
                    self.execute_binary_operation(op)?;
                }

                OpCode::Pop => {
                    self.pop()?;
                }

                OpCode::True => self.push(Value::Bool(true))?,
                OpCode::False => self.push(Value::Bool(false))?,
                OpCode::Null => self.push(Value::Null)?,

                OpCode::Equal | OpCode::NotEqual | OpCode::GreaterThan => {
                    self.execute_comparison(op)?;
                }

                OpCode::Minus => {
                    let operand = self.pop()?;
                    match operand {
                        Value::Int(n) => self.push(Value::Int(n.wrapping_neg()))?,
                        other => {
                            return Err(RuntimeError::UnsupportedNegation(other.type_name()))
                        }
                    }
                }

                OpCode::Bang => {
                    let operand = self.pop()?;
                    self.push(Value::Bool(!operand.is_truthy()))?;
                }

                OpCode::Jump => {
                    let target = self.read_u16() as usize;
                    self.current_frame_mut().ip = target;
                }

                OpCode::JumpNotTruthy => {
                    let target = self.read_u16() as usize;
                    let condition = self.pop()?;
                    if !condition.is_truthy() {
                        self.current_frame_mut().ip = target;
                    }
                }

                OpCode::SetGlobal => {
                    let index = self.read_u16() as usize;
                    let value = self.pop()?;
                    self.globals[index] = value;
                }

                OpCode::GetGlobal => {
                    let index = self.read_u16() as usize;
                    let value = self.globals[index].clone();
                    self.push(value)?;
                }

                OpCode::SetLocal => {
                    let index = self.read_byte() as usize;
                    let base_pointer = self.current_frame().base_pointer;
                    let value = self.pop()?;
                    self.stack[base_pointer + index] = value;
                }

                OpCode::GetLocal => {
                    let index = self.read_byte() as usize;
                    let base_pointer = self.current_frame().base_pointer;
                    let value = self.stack[base_pointer + index].clone();
                    self.push(value)?;
                }

                OpCode::Array => {
                    let count = self.read_u16() as usize;
                    let array = self.build_array(self.sp - count, self.sp);
                    self.sp -= count;
                    self.push(array)?;
                }

                OpCode::Hash => {
                    let count = self.read_u16() as usize;
                    let hash = self.build_hash(self.sp - count, self.sp)?;
                    self.sp -= count;
                    self.push(hash)?;
                }

                OpCode::Index => {
                    let index = self.pop()?;
                    let left = self.pop()?;
                    self.execute_index_expression(left, index)?;
                }

                OpCode::Call => {
                    let argc = self.read_byte() as usize;
                    self.execute_call(argc)?;
                }

                OpCode::ReturnValue => {
                    let value = self.pop()?;
                    let frame = self.frames.pop().expect("no frame to pop");
                    if self.frames.is_empty() {
                        self.sp = 0;
                        self.push(value)?;
                        return Ok(());
                    }
                    // Drops the locals and the callee slot in one move.
                    self.sp = frame.base_pointer - 1;
                    self.push(value)?;
                }

                OpCode::Return => {
                    let frame = self.frames.pop().expect("no frame to pop");
                    if self.frames.is_empty() {
                        self.sp = 0;
                        self.push(Value::Null)?;
                        return Ok(());
                    }
                    self.sp = frame.base_pointer - 1;
                    self.push(Value::Null)?;
                }

                OpCode::Closure => {
                    let const_index = self.read_u16() as usize;
                    let free_count = self.read_byte() as usize;
                    self.push_closure(const_index, free_count)?;
                }

                OpCode::GetFree => {
                    let index = self.read_byte() as usize;
                    let value = self.current_frame().closure.free[index].clone();
                    self.push(value)?;
                }

                OpCode::CurrentClosure => {
                    let closure = self.current_frame().closure.clone();
                    self.push(Value::Closure(closure))?;
                }

                OpCode::GetBuiltin => {
                    let index = self.read_byte() as usize;
                    self.push(Value::Builtin(BUILTINS[index]))?;
                }
            }
        }

        Ok(())
    }

    // ===== Arithmetic & comparison =====

    fn execute_binary_operation(&mut self, op: OpCode) -> VmResult<()> {
        let right = self.pop()?;
        let left = self.pop()?;

        match (&left, &right) {
            (Value::Int(l), Value::Int(r)) => {
                self.execute_binary_integer_operation(op, *l, *r)
            }
            (Value::String(l), Value::String(r)) => {
                if op == OpCode::Add {
                    self.push(Value::String(Rc::new(format!("{}{}", l, r))))
                } else {
                    Err(RuntimeError::UnknownStringOperation(operator_symbol(op)))
                }
            }
            _ => Err(RuntimeError::UnsupportedBinaryTypes(
                left.type_name(),
                right.type_name(),
            )),
        }
    }

    fn execute_binary_integer_operation(
        &mut self,
        op: OpCode,
        left: i64,
        right: i64,
    ) -> VmResult<()> {
        let result = match op {
            OpCode::Add => left.wrapping_add(right),
            OpCode::Sub => left.wrapping_sub(right),
            OpCode::Mul => left.wrapping_mul(right),
            OpCode::Div => {
                if right == 0 {
                    return Err(RuntimeError::DivisionByZero);
                }
                left.wrapping_div(right)
            }
            _ => unreachable!("non-arithmetic opcode {:?}", op),
        };
        self.push(Value::Int(result))
    }

    fn execute_comparison(&mut self, op: OpCode) -> VmResult<()> {
        let right = self.pop()?;
        let left = self.pop()?;

        if let (Value::Int(l), Value::Int(r)) = (&left, &right) {
            let result = match op {
                OpCode::Equal => l == r,
                OpCode::NotEqual => l != r,
                OpCode::GreaterThan => l > r,
                _ => unreachable!("non-comparison opcode {:?}", op),
            };
            return self.push(Value::Bool(result));
        }

        // Everything else compares by identity; ordering is undefined.
        match op {
            OpCode::Equal => {
                let equal = left == right;
                self.push(Value::Bool(equal))
            }
            OpCode::NotEqual => {
                let equal = left == right;
                self.push(Value::Bool(!equal))
            }
            _ => Err(RuntimeError::UnknownOperator {
                op: ">",
                left: left.type_name(),
                right: right.type_name(),
            }),
        }
    }

    // ===== Composites =====

    fn build_array(&self, start: usize, end: usize) -> Value {
        Value::Array(Rc::new(self.stack[start..end].to_vec()))
    }

    fn build_hash(&self, start: usize, end: usize) -> VmResult<Value> {
        let mut pairs = IndexMap::new();

        let mut i = start;
        while i < end {
            let key = self.stack[i].clone();
            let value = self.stack[i + 1].clone();

            let hash_key = key
                .hash_key()
                .ok_or(RuntimeError::UnusableHashKey(key.type_name()))?;
            pairs.insert(hash_key, HashPair { key, value });

            i += 2;
        }

        Ok(Value::Hash(Rc::new(pairs)))
    }

    fn execute_index_expression(&mut self, left: Value, index: Value) -> VmResult<()> {
        match (&left, &index) {
            (Value::Array(elements), Value::Int(i)) => {
                let max = elements.len() as i64 - 1;
                if *i < 0 || *i > max {
                    self.push(Value::Null)
                } else {
                    self.push(elements[*i as usize].clone())
                }
            }
            (Value::Hash(pairs), _) => {
                let key = index
                    .hash_key()
                    .ok_or(RuntimeError::UnusableHashKey(index.type_name()))?;
                match pairs.get(&key) {
                    Some(pair) => self.push(pair.value.clone()),
                    None => self.push(Value::Null),
                }
            }
            _ => Err(RuntimeError::IndexNotSupported(left.type_name())),
        }
    }

    // ===== Calls =====

    fn execute_call(&mut self, argc: usize) -> VmResult<()> {
        let callee = self.stack[self.sp - 1 - argc].clone();
        match callee {
            Value::Closure(closure) => self.call_closure(closure, argc),
            Value::Builtin(builtin) => self.call_builtin(builtin, argc),
            other => Err(RuntimeError::NotCallable(other.type_name())),
        }
    }

    fn call_closure(&mut self, closure: Rc<Closure>, argc: usize) -> VmResult<()> {
        if argc != closure.function.num_parameters {
            return Err(RuntimeError::WrongArity {
                want: closure.function.num_parameters,
                got: argc,
            });
        }
        if self.frames.len() >= MAX_FRAMES {
            return Err(RuntimeError::StackOverflow);
        }

        let base_pointer = self.sp - argc;
        let num_locals = closure.function.num_locals;
        if base_pointer + num_locals > STACK_SIZE {
            return Err(RuntimeError::StackOverflow);
        }

        self.frames.push(Frame::new(closure, base_pointer));
        self.sp = base_pointer + num_locals;
        Ok(())
    }

    fn call_builtin(&mut self, builtin: Builtin, argc: usize) -> VmResult<()> {
        let args = self.stack[self.sp - argc..self.sp].to_vec();
        let result = (builtin.function)(args);

        self.sp -= argc + 1;
        self.push(result)
    }

    fn push_closure(&mut self, const_index: usize, free_count: usize) -> VmResult<()> {
        let function = match &self.constants[const_index] {
            Value::Function(function) => function.clone(),
            _ => return Err(RuntimeError::NotAFunction(const_index)),
        };

        // The capture vector is taken in stack order, bottom-most first,
        // matching the indices the callee uses through GetFree.
        let free = self.stack[self.sp - free_count..self.sp].to_vec();
        self.sp -= free_count;

        self.push(Value::Closure(Rc::new(Closure { function, free })))
    }

    // ===== Stack and frame plumbing =====

    fn push(&mut self, value: Value) -> VmResult<()> {
        if self.sp >= STACK_SIZE {
            return Err(RuntimeError::StackOverflow);
        }
        self.stack[self.sp] = value;
        self.sp += 1;
        Ok(())
    }

    fn pop(&mut self) -> VmResult<Value> {
        if self.sp == 0 {
            return Err(RuntimeError::StackUnderflow);
        }
        self.sp -= 1;
        Ok(self.stack[self.sp].clone())
    }

    fn current_frame(&self) -> &Frame {
        self.frames.last().expect("no active frame")
    }

    fn current_frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("no active frame")
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("no active frame");
        let byte = frame.closure.function.instructions[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        u16::from_be_bytes([hi, lo])
    }
}

/// A fresh globals array of the VM's fixed capacity.
pub fn empty_globals() -> Vec<Value> {
    vec![Value::Null; GLOBALS_SIZE]
}

fn operator_symbol(op: OpCode) -> &'static str {
    match op {
        OpCode::Add => "+",
        OpCode::Sub => "-",
        OpCode::Mul => "*",
        OpCode::Div => "/",
        _ => "?",
    }
}
