//! Abstract syntax tree for Maki.

pub mod expr;
pub mod stmt;

pub use expr::{Expr, InfixOp, PrefixOp};
pub use stmt::{Block, Program, Stmt};
