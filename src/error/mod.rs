//! Error types for all pipeline phases.

use thiserror::Error;

/// Lexer errors.
#[derive(Debug, Error)]
pub enum LexerError {
    #[error("unexpected character '{0}'")]
    UnexpectedChar(char),

    #[error("unterminated string literal")]
    UnterminatedString,

    #[error("invalid escape sequence '\\{0}'")]
    InvalidEscape(char),

    #[error("integer literal '{0}' out of range")]
    IntegerOutOfRange(String),
}

/// Parser errors.
#[derive(Debug, Error)]
pub enum ParserError {
    #[error("unexpected token '{found}', expected {expected}")]
    UnexpectedToken { expected: String, found: String },

    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("no prefix parse rule for '{0}'")]
    NoPrefixRule(String),
}

impl ParserError {
    pub fn unexpected_token(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::UnexpectedToken {
            expected: expected.into(),
            found: found.into(),
        }
    }
}

impl From<LexerError> for ParserError {
    fn from(err: LexerError) -> Self {
        Self::UnexpectedToken {
            expected: "token".to_string(),
            found: err.to_string(),
        }
    }
}

/// Bytecode compilation errors.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("undefined variable: {0}")]
    UndefinedVariable(String),

    #[error("too many constants in one compilation unit")]
    TooManyConstants,

    #[error("too many locals in one function")]
    TooManyLocals,
}

/// Runtime errors raised by the virtual machine.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("stack overflow")]
    StackOverflow,

    #[error("stack underflow")]
    StackUnderflow,

    #[error("opcode {0} undefined")]
    UndefinedOpcode(u8),

    #[error("unsupported types for binary operation: {0} {1}")]
    UnsupportedBinaryTypes(&'static str, &'static str),

    #[error("unknown string operation {0}")]
    UnknownStringOperation(&'static str),

    #[error("unknown operator {op} ({left} {right})")]
    UnknownOperator {
        op: &'static str,
        left: &'static str,
        right: &'static str,
    },

    #[error("unsupported type for negation: {0}")]
    UnsupportedNegation(&'static str),

    #[error("division by zero")]
    DivisionByZero,

    #[error("unusable as hash key: {0}")]
    UnusableHashKey(&'static str),

    #[error("index operator not supported: {0}")]
    IndexNotSupported(&'static str),

    #[error("calling non-closure and non-builtin: {0}")]
    NotCallable(&'static str),

    #[error("wrong number of arguments: want={want}, got={got}")]
    WrongArity { want: usize, got: usize },

    #[error("not a function: constant {0}")]
    NotAFunction(usize),
}

/// A unified error type for all phases.
#[derive(Debug, Error)]
pub enum MakiError {
    #[error("lexer error: {0}")]
    Lexer(#[from] LexerError),

    #[error("parser error: {0}")]
    Parser(#[from] ParserError),

    #[error("compile error: {0}")]
    Compile(#[from] CompileError),

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
