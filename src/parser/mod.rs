//! Parser for Maki source code.

pub mod precedence;

use crate::ast::{Block, Expr, InfixOp, PrefixOp, Program, Stmt};
use crate::error::ParserError;
use crate::lexer::{Token, TokenKind};
use precedence::{get_precedence, Precedence};

pub type ParseResult<T> = Result<T, ParserError>;

/// The parser for Maki.
pub struct Parser {
    tokens: Vec<Token>,
    current: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, current: 0 }
    }

    /// Parse a complete program.
    pub fn parse(&mut self) -> ParseResult<Program> {
        let mut statements = Vec::new();

        while !self.is_at_end() {
            statements.push(self.statement()?);
        }

        Ok(Program::new(statements))
    }

    // ===== Statements =====

    fn statement(&mut self) -> ParseResult<Stmt> {
        match self.peek().kind {
            TokenKind::Let => self.let_statement(),
            TokenKind::Return => self.return_statement(),
            _ => self.expression_statement(),
        }
    }

    fn let_statement(&mut self) -> ParseResult<Stmt> {
        self.advance(); // consume `let`
        let name = self.expect_identifier()?;
        self.expect(&TokenKind::Assign)?;

        let mut value = self.expression(Precedence::Lowest)?;

        // Attach the bound name to a function literal so it can refer to
        // itself recursively.
        if let Expr::Function { name: fn_name, .. } = &mut value {
            *fn_name = Some(name.clone());
        }

        self.match_token(&TokenKind::Semicolon);
        Ok(Stmt::Let { name, value })
    }

    fn return_statement(&mut self) -> ParseResult<Stmt> {
        self.advance(); // consume `return`
        let value = self.expression(Precedence::Lowest)?;
        self.match_token(&TokenKind::Semicolon);
        Ok(Stmt::Return(value))
    }

    fn expression_statement(&mut self) -> ParseResult<Stmt> {
        let expr = self.expression(Precedence::Lowest)?;
        self.match_token(&TokenKind::Semicolon);
        Ok(Stmt::Expression(expr))
    }

    fn block(&mut self) -> ParseResult<Block> {
        self.expect(&TokenKind::LeftBrace)?;

        let mut statements = Vec::new();
        while !self.check(&TokenKind::RightBrace) && !self.is_at_end() {
            statements.push(self.statement()?);
        }

        self.expect(&TokenKind::RightBrace)?;
        Ok(Block::new(statements))
    }

    // ===== Expressions (Pratt) =====

    fn expression(&mut self, precedence: Precedence) -> ParseResult<Expr> {
        let mut left = self.prefix()?;

        while !self.check(&TokenKind::Semicolon)
            && precedence < get_precedence(&self.peek().kind)
        {
            left = self.infix(left)?;
        }

        Ok(left)
    }

    fn prefix(&mut self) -> ParseResult<Expr> {
        let token = self.advance();
        match token.kind {
            TokenKind::IntLiteral(value) => Ok(Expr::IntLiteral(value)),
            TokenKind::StringLiteral(value) => Ok(Expr::StringLiteral(value)),
            TokenKind::True => Ok(Expr::BoolLiteral(true)),
            TokenKind::False => Ok(Expr::BoolLiteral(false)),
            TokenKind::Identifier(name) => Ok(Expr::Identifier(name)),
            TokenKind::Bang => self.prefix_operation(PrefixOp::Bang),
            TokenKind::Minus => self.prefix_operation(PrefixOp::Minus),
            TokenKind::LeftParen => {
                let expr = self.expression(Precedence::Lowest)?;
                self.expect(&TokenKind::RightParen)?;
                Ok(expr)
            }
            TokenKind::If => self.if_expression(),
            TokenKind::Fn => self.function_literal(),
            TokenKind::LeftBracket => {
                let elements = self.expression_list(&TokenKind::RightBracket)?;
                Ok(Expr::Array(elements))
            }
            TokenKind::LeftBrace => self.hash_literal(),
            TokenKind::Eof => Err(ParserError::UnexpectedEof),
            other => Err(ParserError::NoPrefixRule(other.to_string())),
        }
    }

    fn prefix_operation(&mut self, operator: PrefixOp) -> ParseResult<Expr> {
        let right = self.expression(Precedence::Prefix)?;
        Ok(Expr::Prefix {
            operator,
            right: Box::new(right),
        })
    }

    fn infix(&mut self, left: Expr) -> ParseResult<Expr> {
        let kind = self.peek().kind.clone();
        match kind {
            TokenKind::LeftParen => {
                self.advance();
                let arguments = self.expression_list(&TokenKind::RightParen)?;
                Ok(Expr::Call {
                    function: Box::new(left),
                    arguments,
                })
            }
            TokenKind::LeftBracket => {
                self.advance();
                let index = self.expression(Precedence::Lowest)?;
                self.expect(&TokenKind::RightBracket)?;
                Ok(Expr::Index {
                    left: Box::new(left),
                    index: Box::new(index),
                })
            }
            _ => {
                let operator = match kind {
                    TokenKind::Plus => InfixOp::Add,
                    TokenKind::Minus => InfixOp::Subtract,
                    TokenKind::Star => InfixOp::Multiply,
                    TokenKind::Slash => InfixOp::Divide,
                    TokenKind::EqualEqual => InfixOp::Equal,
                    TokenKind::BangEqual => InfixOp::NotEqual,
                    TokenKind::Less => InfixOp::Less,
                    TokenKind::Greater => InfixOp::Greater,
                    other => return Err(ParserError::NoPrefixRule(other.to_string())),
                };
                let precedence = get_precedence(&kind);
                self.advance();
                let right = self.expression(precedence)?;
                Ok(Expr::Infix {
                    left: Box::new(left),
                    operator,
                    right: Box::new(right),
                })
            }
        }
    }

    fn if_expression(&mut self) -> ParseResult<Expr> {
        self.expect(&TokenKind::LeftParen)?;
        let condition = self.expression(Precedence::Lowest)?;
        self.expect(&TokenKind::RightParen)?;

        let consequence = self.block()?;

        let alternative = if self.match_token(&TokenKind::Else) {
            Some(self.block()?)
        } else {
            None
        };

        Ok(Expr::If {
            condition: Box::new(condition),
            consequence,
            alternative,
        })
    }

    fn function_literal(&mut self) -> ParseResult<Expr> {
        self.expect(&TokenKind::LeftParen)?;

        let mut parameters = Vec::new();
        if !self.check(&TokenKind::RightParen) {
            loop {
                parameters.push(self.expect_identifier()?);
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RightParen)?;

        let body = self.block()?;
        Ok(Expr::Function {
            name: None,
            parameters,
            body,
        })
    }

    fn hash_literal(&mut self) -> ParseResult<Expr> {
        let mut pairs = Vec::new();

        if !self.check(&TokenKind::RightBrace) {
            loop {
                let key = self.expression(Precedence::Lowest)?;
                self.expect(&TokenKind::Colon)?;
                let value = self.expression(Precedence::Lowest)?;
                pairs.push((key, value));
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }

        self.expect(&TokenKind::RightBrace)?;
        Ok(Expr::Hash(pairs))
    }

    fn expression_list(&mut self, end: &TokenKind) -> ParseResult<Vec<Expr>> {
        let mut list = Vec::new();

        if !self.check(end) {
            loop {
                list.push(self.expression(Precedence::Lowest)?);
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }

        self.expect(end)?;
        Ok(list)
    }

    // ===== Token manipulation =====

    fn advance(&mut self) -> Token {
        if !self.is_at_end() {
            self.current += 1;
        }
        self.tokens[self.current - 1].clone()
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.current.min(self.tokens.len() - 1)]
    }

    fn is_at_end(&self) -> bool {
        self.peek().kind == TokenKind::Eof
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.peek().kind) == std::mem::discriminant(kind)
    }

    fn match_token(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind) -> ParseResult<Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(ParserError::unexpected_token(
                kind.to_string(),
                self.peek().kind.to_string(),
            ))
        }
    }

    fn expect_identifier(&mut self) -> ParseResult<String> {
        match self.peek().kind.clone() {
            TokenKind::Identifier(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(ParserError::unexpected_token(
                "identifier",
                other.to_string(),
            )),
        }
    }
}
