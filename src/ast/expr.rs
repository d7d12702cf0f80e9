//! Expression AST nodes.

use std::fmt;

use crate::ast::stmt::Block;

/// All expression variants.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Integer literal: 42
    IntLiteral(i64),
    /// String literal: "hello"
    StringLiteral(String),
    /// Boolean literal: true, false
    BoolLiteral(bool),

    /// Variable reference: foo
    Identifier(String),

    /// Prefix operation: -x, !x
    Prefix { operator: PrefixOp, right: Box<Expr> },

    /// Infix operation: a + b
    Infix {
        left: Box<Expr>,
        operator: InfixOp,
        right: Box<Expr>,
    },

    /// Conditional expression: if (cond) { ... } else { ... }
    If {
        condition: Box<Expr>,
        consequence: Block,
        alternative: Option<Block>,
    },

    /// Function literal: fn(x, y) { ... }
    ///
    /// `name` is set by the parser when the literal is the initializer of a
    /// `let` binding; it lets the function refer to itself by name.
    Function {
        name: Option<String>,
        parameters: Vec<String>,
        body: Block,
    },

    /// Function call: foo(a, b)
    Call {
        function: Box<Expr>,
        arguments: Vec<Expr>,
    },

    /// Array literal: [1, 2, 3]
    Array(Vec<Expr>),

    /// Hash literal: {"a": 1, "b": 2}
    Hash(Vec<(Expr, Expr)>),

    /// Index access: arr[0]
    Index { left: Box<Expr>, index: Box<Expr> },
}

/// Prefix operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixOp {
    Minus,
    Bang,
}

impl fmt::Display for PrefixOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrefixOp::Minus => write!(f, "-"),
            PrefixOp::Bang => write!(f, "!"),
        }
    }
}

/// Infix operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfixOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Equal,
    NotEqual,
    Less,
    Greater,
}

impl fmt::Display for InfixOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            InfixOp::Add => "+",
            InfixOp::Subtract => "-",
            InfixOp::Multiply => "*",
            InfixOp::Divide => "/",
            InfixOp::Equal => "==",
            InfixOp::NotEqual => "!=",
            InfixOp::Less => "<",
            InfixOp::Greater => ">",
        };
        write!(f, "{}", symbol)
    }
}

// Expressions render back to source form. The compiler relies on this to
// order hash-literal keys deterministically.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::IntLiteral(n) => write!(f, "{}", n),
            Expr::StringLiteral(s) => write!(f, "\"{}\"", s),
            Expr::BoolLiteral(b) => write!(f, "{}", b),
            Expr::Identifier(name) => write!(f, "{}", name),
            Expr::Prefix { operator, right } => write!(f, "({}{})", operator, right),
            Expr::Infix {
                left,
                operator,
                right,
            } => write!(f, "({} {} {})", left, operator, right),
            Expr::If {
                condition,
                consequence,
                alternative,
            } => {
                write!(f, "if {} {}", condition, consequence)?;
                if let Some(alt) = alternative {
                    write!(f, " else {}", alt)?;
                }
                Ok(())
            }
            Expr::Function {
                parameters, body, ..
            } => {
                write!(f, "fn({}) {}", parameters.join(", "), body)
            }
            Expr::Call {
                function,
                arguments,
            } => {
                let args: Vec<String> = arguments.iter().map(|a| a.to_string()).collect();
                write!(f, "{}({})", function, args.join(", "))
            }
            Expr::Array(elements) => {
                let elems: Vec<String> = elements.iter().map(|e| e.to_string()).collect();
                write!(f, "[{}]", elems.join(", "))
            }
            Expr::Hash(pairs) => {
                let pairs: Vec<String> = pairs
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k, v))
                    .collect();
                write!(f, "{{{}}}", pairs.join(", "))
            }
            Expr::Index { left, index } => write!(f, "({}[{}])", left, index),
        }
    }
}
