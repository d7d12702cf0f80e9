//! Runtime values for the bytecode VM.

use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::bytecode::instruction::Instructions;

/// A runtime value.
///
/// Containers are shared by reference and never mutated after construction,
/// so cloning a value is cheap.
#[derive(Debug, Clone)]
pub enum Value {
    /// 64-bit signed integer
    Int(i64),
    /// Boolean
    Bool(bool),
    /// The null singleton
    Null,
    /// Immutable string
    String(Rc<String>),
    /// Ordered sequence of values
    Array(Rc<Vec<Value>>),
    /// Hash keyed by `HashKey`, preserving insertion order
    Hash(Rc<IndexMap<HashKey, HashPair>>),
    /// A compiled function body; only reaches the stack transiently before
    /// `Closure` wraps it
    Function(Rc<CompiledFunction>),
    /// A compiled function plus its captured free values
    Closure(Rc<Closure>),
    /// A host function
    Builtin(Builtin),
    /// Wrapper used by the tree-walking evaluation path; the VM never
    /// produces one, but shared consumers expect the variant
    ReturnValue(Box<Value>),
    /// An error surfaced by a builtin
    Error(Rc<String>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "Int",
            Value::Bool(_) => "Bool",
            Value::Null => "Null",
            Value::String(_) => "String",
            Value::Array(_) => "Array",
            Value::Hash(_) => "Hash",
            Value::Function(_) => "Function",
            Value::Closure(_) => "Closure",
            Value::Builtin(_) => "Builtin",
            Value::ReturnValue(_) => "ReturnValue",
            Value::Error(_) => "Error",
        }
    }

    /// Everything is truthy except the false and null singletons.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Bool(false) | Value::Null)
    }

    /// Derive the hash key for this value, if it is hashable.
    /// Only integers, booleans and strings are.
    pub fn hash_key(&self) -> Option<HashKey> {
        let key = match self {
            Value::Int(n) => HashKey {
                kind: "Int",
                value: *n as u64,
            },
            Value::Bool(b) => HashKey {
                kind: "Bool",
                value: *b as u64,
            },
            Value::String(s) => HashKey {
                kind: "String",
                value: fnv1a_64(s.as_bytes()),
            },
            _ => return None,
        };
        Some(key)
    }
}

// Primitives compare by value, containers and functions by identity.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Null, Value::Null) => true,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Hash(a), Value::Hash(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            (Value::ReturnValue(a), Value::ReturnValue(b)) => a == b,
            (Value::Error(a), Value::Error(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{}", n),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Null => write!(f, "null"),
            Value::String(s) => write!(f, "{}", s),
            Value::Array(elements) => {
                write!(f, "[")?;
                for (i, value) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", value)?;
                }
                write!(f, "]")
            }
            Value::Hash(pairs) => {
                write!(f, "{{")?;
                for (i, pair) in pairs.values().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", pair.key, pair.value)?;
                }
                write!(f, "}}")
            }
            Value::Function(_) => write!(f, "<fn>"),
            Value::Closure(_) => write!(f, "<closure>"),
            Value::Builtin(b) => write!(f, "<builtin {}>", b.name),
            Value::ReturnValue(inner) => write!(f, "{}", inner),
            Value::Error(message) => write!(f, "error: {}", message),
        }
    }
}

/// A hash key: type tag plus a 64-bit hash of the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HashKey {
    pub kind: &'static str,
    pub value: u64,
}

/// A key-value entry in a hash; the original key is kept so it can be
/// displayed and returned.
#[derive(Debug, Clone, PartialEq)]
pub struct HashPair {
    pub key: Value,
    pub value: Value,
}

/// The compiled body of a function literal.
#[derive(Debug, PartialEq)]
pub struct CompiledFunction {
    /// The function body's instruction stream.
    pub instructions: Instructions,
    /// Stack slots to reserve at call time (parameters included).
    pub num_locals: usize,
    /// Declared parameter count, checked at call time.
    pub num_parameters: usize,
}

/// A callable function: compiled body plus captured free values, frozen at
/// the point of construction.
#[derive(Debug)]
pub struct Closure {
    pub function: Rc<CompiledFunction>,
    pub free: Vec<Value>,
}

/// A host function exposed to programs through the builtin registry.
#[derive(Clone, Copy)]
pub struct Builtin {
    pub name: &'static str,
    pub function: fn(Vec<Value>) -> Value,
}

impl PartialEq for Builtin {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl fmt::Debug for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builtin").field("name", &self.name).finish()
    }
}

/// 64-bit FNV-1a over a byte sequence. Stable across runs, which keeps
/// string hash keys deterministic.
fn fnv1a_64(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET_BASIS;
    for &byte in bytes {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}
