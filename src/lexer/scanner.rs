//! Scanner for Maki source code.

use crate::error::LexerError;
use crate::lexer::token::{keyword_or_identifier, Token, TokenKind};

/// The scanner transforms source code into a stream of tokens.
pub struct Scanner<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
}

impl<'a> Scanner<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().peekable(),
        }
    }

    /// Scan all tokens from the source, ending with an Eof token.
    pub fn scan_tokens(&mut self) -> Result<Vec<Token>, LexerError> {
        let mut tokens = Vec::new();

        loop {
            let token = self.scan_token()?;
            let is_eof = token.kind == TokenKind::Eof;
            tokens.push(token);
            if is_eof {
                break;
            }
        }

        Ok(tokens)
    }

    /// Scan the next token.
    fn scan_token(&mut self) -> Result<Token, LexerError> {
        self.skip_whitespace_and_comments();

        let Some(c) = self.advance() else {
            return Ok(Token::eof());
        };

        let kind = match c {
            '(' => TokenKind::LeftParen,
            ')' => TokenKind::RightParen,
            '{' => TokenKind::LeftBrace,
            '}' => TokenKind::RightBrace,
            '[' => TokenKind::LeftBracket,
            ']' => TokenKind::RightBracket,
            ',' => TokenKind::Comma,
            ';' => TokenKind::Semicolon,
            ':' => TokenKind::Colon,
            '+' => TokenKind::Plus,
            '-' => TokenKind::Minus,
            '*' => TokenKind::Star,
            '/' => TokenKind::Slash,
            '<' => TokenKind::Less,
            '>' => TokenKind::Greater,
            '=' => {
                if self.match_char('=') {
                    TokenKind::EqualEqual
                } else {
                    TokenKind::Assign
                }
            }
            '!' => {
                if self.match_char('=') {
                    TokenKind::BangEqual
                } else {
                    TokenKind::Bang
                }
            }
            '"' => return self.scan_string(),
            c if c.is_ascii_digit() => return self.scan_number(c),
            c if c.is_ascii_alphabetic() || c == '_' => return Ok(self.scan_identifier(c)),
            c => return Err(LexerError::UnexpectedChar(c)),
        };

        Ok(Token::new(kind))
    }

    fn scan_string(&mut self) -> Result<Token, LexerError> {
        let mut value = String::new();

        loop {
            match self.advance() {
                None => return Err(LexerError::UnterminatedString),
                Some('"') => break,
                Some('\\') => {
                    let escaped = self.advance().ok_or(LexerError::UnterminatedString)?;
                    match escaped {
                        'n' => value.push('\n'),
                        't' => value.push('\t'),
                        '"' => value.push('"'),
                        '\\' => value.push('\\'),
                        other => return Err(LexerError::InvalidEscape(other)),
                    }
                }
                Some(c) => value.push(c),
            }
        }

        Ok(Token::new(TokenKind::StringLiteral(value)))
    }

    fn scan_number(&mut self, first: char) -> Result<Token, LexerError> {
        let mut digits = String::from(first);
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_digit() {
                digits.push(c);
                self.advance();
            } else {
                break;
            }
        }

        let value = digits
            .parse::<i64>()
            .map_err(|_| LexerError::IntegerOutOfRange(digits.clone()))?;
        Ok(Token::new(TokenKind::IntLiteral(value)))
    }

    fn scan_identifier(&mut self, first: char) -> Token {
        let mut word = String::from(first);
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                word.push(c);
                self.advance();
            } else {
                break;
            }
        }

        Token::new(keyword_or_identifier(&word))
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.chars.peek() {
                Some(c) if c.is_whitespace() => {
                    self.advance();
                }
                Some(&'#') => {
                    while let Some(&c) = self.chars.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    fn advance(&mut self) -> Option<char> {
        self.chars.next()
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.chars.peek() == Some(&expected) {
            self.advance();
            true
        } else {
            false
        }
    }
}
