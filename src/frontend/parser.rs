use crate::frontend::lexer::{Span, Spanned};
use crate::frontend::parser_error::ParserError;
use crate::frontend::token::Token;
use crate::lang::node::{Block, Expression, InfixOp, PrefixOp, Program, Statement};

/// Binding power of an operator, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    Lowest,
    Equals,
    LessGreater,
    Sum,
    Product,
    Prefix,
    Call,
    Index,
}

fn infix_precedence(token: &Token) -> Option<Precedence> {
    Some(match token {
        Token::Eq | Token::NotEq => Precedence::Equals,
        Token::Lt | Token::Gt => Precedence::LessGreater,
        Token::Plus | Token::Minus => Precedence::Sum,
        Token::Star | Token::Slash => Precedence::Product,
        Token::LParen => Precedence::Call,
        Token::LBracket => Precedence::Index,
        _ => return None,
    })
}

fn infix_op(token: &Token) -> Option<InfixOp> {
    Some(match token {
        Token::Plus => InfixOp::Add,
        Token::Minus => InfixOp::Sub,
        Token::Star => InfixOp::Mul,
        Token::Slash => InfixOp::Div,
        Token::Lt => InfixOp::Lt,
        Token::Gt => InfixOp::Gt,
        Token::Eq => InfixOp::Eq,
        Token::NotEq => InfixOp::NotEq,
        _ => return None,
    })
}

/// Pratt parser producing a `Program` from lexed tokens.
///
/// The parser stops at the first error; there is no recovery.
pub struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    /// Span of the most recently consumed token.
    last_span: Option<Span>,
}

impl Parser {
    /// Creates a new parser over comment-free tokens, as produced by
    /// [`Lexer::tokenize_clean`](crate::frontend::lexer::Lexer::tokenize_clean).
    pub fn new(tokens: Vec<Spanned>) -> Self {
        Parser {
            tokens,
            pos: 0,
            last_span: None,
        }
    }

    fn current(&self) -> Option<&Spanned> {
        self.tokens.get(self.pos)
    }

    fn peek(&self) -> &Token {
        self.tokens
            .get(self.pos)
            .map(|s| &s.token)
            .unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = match self.tokens.get(self.pos) {
            Some(s) => {
                self.last_span = Some(s.span);
                s.token.clone()
            }
            None => Token::Eof,
        };
        self.pos += 1;
        token
    }

    /// Builds an error at the current token, falling back to the last
    /// consumed token and then to `1:1`.
    fn error(&self, message: impl Into<String>) -> ParserError {
        let span = self
            .current()
            .map(|s| s.span)
            .or(self.last_span)
            .unwrap_or(Span { line: 1, col: 1 });
        ParserError {
            message: message.into(),
            line: span.line,
            col: span.col,
        }
    }

    fn expect(&mut self, expected: Token) -> Result<(), ParserError> {
        if *self.peek() == expected {
            self.advance();
            Ok(())
        } else {
            Err(self.error(format!("expected '{}', found '{}'", expected, self.peek())))
        }
    }

    fn skip_semicolon(&mut self) {
        if *self.peek() == Token::Semicolon {
            self.advance();
        }
    }

    /// Parses a complete program.
    pub fn parse(&mut self) -> Result<Program, ParserError> {
        let mut statements = Vec::new();
        while *self.peek() != Token::Eof {
            statements.push(self.parse_statement()?);
        }
        Ok(Program { statements })
    }

    fn parse_statement(&mut self) -> Result<Statement, ParserError> {
        let statement = match self.peek() {
            Token::Let => self.parse_let()?,
            Token::Return => self.parse_return()?,
            _ => Statement::Expression(self.parse_expression(Precedence::Lowest)?),
        };
        self.skip_semicolon();
        Ok(statement)
    }

    /// ```text
    /// let <ident> = <expression>
    /// ```
    fn parse_let(&mut self) -> Result<Statement, ParserError> {
        self.advance(); // 'let'

        let name = match self.peek().clone() {
            Token::Ident(name) => {
                self.advance();
                name
            }
            other => return Err(self.error(format!("expected identifier after 'let', found '{}'", other))),
        };

        self.expect(Token::Assign)?;
        let mut value = self.parse_expression(Precedence::Lowest)?;

        if let Expression::Function { name: fn_name, .. } = &mut value {
            if fn_name.is_none() {
                *fn_name = Some(name.clone());
            }
        }

        Ok(Statement::Let { name, value })
    }

    fn parse_return(&mut self) -> Result<Statement, ParserError> {
        self.advance(); // 'return'

        if matches!(self.peek(), Token::Semicolon | Token::RBrace | Token::Eof) {
            return Ok(Statement::Return(None));
        }

        let value = self.parse_expression(Precedence::Lowest)?;
        Ok(Statement::Return(Some(value)))
    }

    fn parse_expression(&mut self, precedence: Precedence) -> Result<Expression, ParserError> {
        let mut left = self.parse_prefix()?;

        while let Some(next) = infix_precedence(self.peek()) {
            if precedence >= next {
                break;
            }

            left = match self.peek().clone() {
                Token::LParen => {
                    self.advance();
                    let arguments = self.parse_expression_list(Token::RParen)?;
                    Expression::Call {
                        function: Box::new(left),
                        arguments,
                    }
                }
                Token::LBracket => {
                    self.advance();
                    let index = self.parse_expression(Precedence::Lowest)?;
                    self.expect(Token::RBracket)?;
                    Expression::Index {
                        left: Box::new(left),
                        index: Box::new(index),
                    }
                }
                token => {
                    let op = infix_op(&token)
                        .ok_or_else(|| self.error(format!("unexpected operator '{}'", token)))?;
                    self.advance();
                    let right = self.parse_expression(next)?;
                    Expression::Infix {
                        op,
                        left: Box::new(left),
                        right: Box::new(right),
                    }
                }
            };
        }

        Ok(left)
    }

    fn parse_prefix(&mut self) -> Result<Expression, ParserError> {
        let expression = match self.peek().clone() {
            Token::Ident(name) => {
                self.advance();
                Expression::Identifier(name)
            }
            Token::Integer(n) => {
                self.advance();
                Expression::Integer(n)
            }
            Token::String(s) => {
                self.advance();
                Expression::String(s)
            }
            Token::True => {
                self.advance();
                Expression::Boolean(true)
            }
            Token::False => {
                self.advance();
                Expression::Boolean(false)
            }
            Token::Bang | Token::Minus => {
                let op = if self.advance() == Token::Bang {
                    PrefixOp::Bang
                } else {
                    PrefixOp::Minus
                };
                let right = self.parse_expression(Precedence::Prefix)?;
                Expression::Prefix {
                    op,
                    right: Box::new(right),
                }
            }
            Token::LParen => {
                self.advance();
                let inner = self.parse_expression(Precedence::Lowest)?;
                self.expect(Token::RParen)?;
                inner
            }
            Token::LBracket => {
                self.advance();
                Expression::Array(self.parse_expression_list(Token::RBracket)?)
            }
            Token::LBrace => self.parse_hash()?,
            Token::If => self.parse_if()?,
            Token::Function => self.parse_function()?,
            Token::Eof => return Err(self.error("unexpected end of input")),
            other => return Err(self.error(format!("unexpected token '{}'", other))),
        };

        Ok(expression)
    }

    /// Parses comma-separated expressions up to and including `close`.
    /// The opening delimiter has already been consumed.
    fn parse_expression_list(&mut self, close: Token) -> Result<Vec<Expression>, ParserError> {
        let mut items = Vec::new();

        if *self.peek() == close {
            self.advance();
            return Ok(items);
        }

        items.push(self.parse_expression(Precedence::Lowest)?);
        while *self.peek() == Token::Comma {
            self.advance();
            items.push(self.parse_expression(Precedence::Lowest)?);
        }

        self.expect(close)?;
        Ok(items)
    }

    /// ```text
    /// { <key>: <value>, ... }
    /// ```
    fn parse_hash(&mut self) -> Result<Expression, ParserError> {
        self.advance(); // '{'

        let mut pairs = Vec::new();
        while *self.peek() != Token::RBrace {
            let key = self.parse_expression(Precedence::Lowest)?;
            self.expect(Token::Colon)?;
            let value = self.parse_expression(Precedence::Lowest)?;
            pairs.push((key, value));

            if *self.peek() != Token::RBrace {
                self.expect(Token::Comma)?;
            }
        }
        self.advance(); // '}'

        Ok(Expression::Hash(pairs))
    }

    /// ```text
    /// if (<condition>) { ... } [else { ... }]
    /// ```
    fn parse_if(&mut self) -> Result<Expression, ParserError> {
        self.advance(); // 'if'

        self.expect(Token::LParen)?;
        let condition = self.parse_expression(Precedence::Lowest)?;
        self.expect(Token::RParen)?;

        let consequence = self.parse_block()?;

        let alternative = if *self.peek() == Token::Else {
            self.advance();
            Some(self.parse_block()?)
        } else {
            None
        };

        Ok(Expression::If {
            condition: Box::new(condition),
            consequence,
            alternative,
        })
    }

    /// ```text
    /// function(<param>, ...) { ... }
    /// ```
    fn parse_function(&mut self) -> Result<Expression, ParserError> {
        self.advance(); // 'function'

        self.expect(Token::LParen)?;
        let mut parameters = Vec::new();
        while *self.peek() != Token::RParen {
            match self.advance() {
                Token::Ident(name) => parameters.push(name),
                other => {
                    return Err(self.error(format!("expected parameter name, found '{}'", other)));
                }
            }
            if *self.peek() != Token::RParen {
                self.expect(Token::Comma)?;
            }
        }
        self.advance(); // ')'

        let body = self.parse_block()?;

        Ok(Expression::Function {
            name: None,
            parameters,
            body,
        })
    }

    fn parse_block(&mut self) -> Result<Block, ParserError> {
        self.expect(Token::LBrace)?;

        let mut statements = Vec::new();
        loop {
            match self.peek() {
                Token::RBrace => {
                    self.advance();
                    break;
                }
                Token::Eof => return Err(self.error("unexpected end of input, expected '}'")),
                _ => statements.push(self.parse_statement()?),
            }
        }

        Ok(Block { statements })
    }
}

/// Lex and parse `source` in one step.
pub fn parse_source(source: &str) -> Result<Program, crate::session::SessionError> {
    let tokens = crate::frontend::lexer::Lexer::new(source).tokenize_clean()?;
    let program = Parser::new(tokens).parse()?;
    Ok(program)
}
