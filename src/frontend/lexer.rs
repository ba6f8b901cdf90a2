use thiserror::Error;

use crate::frontend::token::Token;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub line: usize,
    pub col: usize,
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

#[derive(Debug, Clone)]
pub struct Spanned {
    pub token: Token,
    pub span: Span,
}

#[derive(Debug, Error)]
#[error("{line}:{col}: {message}")]
pub struct LexerError {
    pub message: String,
    pub line: usize,
    pub col: usize,
}

pub struct Lexer {
    source: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
}

impl Lexer {
    pub fn new(source: &str) -> Self {
        Lexer {
            source: source.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
        }
    }

    fn current(&self) -> Option<char> {
        self.source.get(self.pos).copied()
    }

    fn peek(&self) -> Option<char> {
        self.source.get(self.pos + 1).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.current();
        if ch == Some('\n') {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        self.pos += 1;
        ch
    }

    fn span(&self) -> Span {
        Span {
            line: self.line,
            col: self.col,
        }
    }

    fn error(&self, message: impl Into<String>, span: Span) -> LexerError {
        LexerError {
            message: message.into(),
            line: span.line,
            col: span.col,
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.current() {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn read_comment(&mut self) -> Token {
        // '//'
        self.advance();
        self.advance();
        let mut comment = String::new();
        while let Some(ch) = self.current() {
            if ch == '\n' {
                break;
            }
            comment.push(ch);
            self.advance();
        }
        Token::Comment(comment.trim().to_string())
    }

    fn read_string(&mut self) -> Result<Token, LexerError> {
        let start = self.span();
        self.advance();

        let mut string = String::new();
        loop {
            match self.current() {
                Some('"') => {
                    self.advance();
                    return Ok(Token::String(string));
                }
                Some('\\') => {
                    self.advance();
                    match self.current() {
                        Some('n') => string.push('\n'),
                        Some('t') => string.push('\t'),
                        Some('r') => string.push('\r'),
                        Some('\\') => string.push('\\'),
                        Some('"') => string.push('"'),
                        Some(ch) => {
                            return Err(
                                self.error(format!("unknown escape sequence: \\{}", ch), self.span())
                            );
                        }
                        None => {
                            return Err(self.error("unexpected EOF in escape sequence", self.span()));
                        }
                    }
                    self.advance();
                }
                Some(ch) => {
                    string.push(ch);
                    self.advance();
                }
                None => return Err(self.error("unterminated string literal", start)),
            }
        }
    }

    fn read_number(&mut self) -> Result<Token, LexerError> {
        let start = self.span();

        let mut digits = String::new();
        while let Some(ch) = self.current() {
            if ch.is_ascii_digit() {
                digits.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        let value: i64 = digits
            .parse()
            .map_err(|_| self.error(format!("invalid integer: {}", digits), start))?;

        Ok(Token::Integer(value))
    }

    fn read_identifier(&mut self) -> Token {
        let mut ident = String::new();
        while let Some(ch) = self.current() {
            if ch.is_alphanumeric() || ch == '_' {
                ident.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        Token::keyword(&ident).unwrap_or(Token::Ident(ident))
    }

    fn read_operator(&mut self) -> Option<Token> {
        let ch = self.current()?;
        let next = self.peek();

        let (token, width) = match (ch, next) {
            ('=', Some('=')) => (Token::Eq, 2),
            ('!', Some('=')) => (Token::NotEq, 2),
            ('=', _) => (Token::Assign, 1),
            ('!', _) => (Token::Bang, 1),
            ('+', _) => (Token::Plus, 1),
            ('-', _) => (Token::Minus, 1),
            ('*', _) => (Token::Star, 1),
            ('/', _) => (Token::Slash, 1),
            ('<', _) => (Token::Lt, 1),
            ('>', _) => (Token::Gt, 1),
            (',', _) => (Token::Comma, 1),
            (';', _) => (Token::Semicolon, 1),
            (':', _) => (Token::Colon, 1),
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            ('{', _) => (Token::LBrace, 1),
            ('}', _) => (Token::RBrace, 1),
            ('[', _) => (Token::LBracket, 1),
            (']', _) => (Token::RBracket, 1),
            _ => return None,
        };

        for _ in 0..width {
            self.advance();
        }

        Some(token)
    }

    /// Tokenize the whole source, including comments.
    pub fn tokenize(&mut self) -> Result<Vec<Spanned>, LexerError> {
        let mut tokens = Vec::new();

        loop {
            self.skip_whitespace();
            let span = self.span();

            match self.current() {
                None => {
                    tokens.push(Spanned {
                        token: Token::Eof,
                        span,
                    });
                    break;
                }
                Some('/') if self.peek() == Some('/') => {
                    let token = self.read_comment();
                    tokens.push(Spanned { token, span });
                }
                Some('"') => {
                    let token = self.read_string()?;
                    tokens.push(Spanned { token, span });
                }
                Some(ch) if ch.is_ascii_digit() => {
                    let token = self.read_number()?;
                    tokens.push(Spanned { token, span });
                }
                Some(ch) if ch.is_alphabetic() || ch == '_' => {
                    let token = self.read_identifier();
                    tokens.push(Spanned { token, span });
                }
                Some(ch) => match self.read_operator() {
                    Some(token) => tokens.push(Spanned { token, span }),
                    None => {
                        return Err(self.error(format!("unexpected character: '{}'", ch), span));
                    }
                },
            }
        }

        Ok(tokens)
    }

    /// Tokenize and drop comments.
    pub fn tokenize_clean(&mut self) -> Result<Vec<Spanned>, LexerError> {
        let tokens = self.tokenize()?;
        Ok(tokens
            .into_iter()
            .filter(|t| !matches!(t.token, Token::Comment(_)))
            .collect())
    }
}
