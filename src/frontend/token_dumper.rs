use crate::frontend::lexer::Spanned;
use crate::frontend::token::Token;

/// `--tokens` output: one `[line:col] KIND token` line per token.
pub struct TokenDumper {
    pub color: bool,
    pub show_debug_repr: bool, // if false, prints source text instead of Debug
}

impl Default for TokenDumper {
    fn default() -> Self {
        Self {
            color: true,
            show_debug_repr: true,
        }
    }
}

impl TokenDumper {
    // ANSI colors
    const RESET: &'static str = "\x1b[0m";
    const DIM: &'static str = "\x1b[2m";
    const GRN: &'static str = "\x1b[32m";
    const YEL: &'static str = "\x1b[33m";
    const CYN: &'static str = "\x1b[36m";
    const MAG: &'static str = "\x1b[35m";
    const BLU: &'static str = "\x1b[34m";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn no_color(mut self) -> Self {
        self.color = false;
        self
    }

    pub fn pretty(mut self) -> Self {
        self.show_debug_repr = false;
        self
    }

    pub fn dump(&self, tokens: &[Spanned]) {
        for s in tokens {
            println!("{}", self.format_one(s));
        }
    }

    pub fn format_one(&self, s: &Spanned) -> String {
        let kind = kind(&s.token);
        let colr = if self.color { color(&s.token) } else { "" };
        let reset = if self.color { Self::RESET } else { "" };

        let text = if self.show_debug_repr {
            format!("{:?}", s.token)
        } else {
            match &s.token {
                Token::Comment(c) => format!("// {}", c.trim()),
                Token::String(v) => format!("{:?}", v),
                Token::Eof => "<eof>".to_string(),
                other => other.to_string(),
            }
        };

        format!(
            "[{:02}:{:02}] {}{:<8} {}{}",
            s.span.line, s.span.col, colr, kind, text, reset
        )
    }
}

fn kind(t: &Token) -> &'static str {
    use Token::*;
    match t {
        Comment(_) => "COMMENT",
        Eof => "EOF",

        Integer(_) => "INT",
        String(_) => "STRING",
        True | False => "BOOL",

        Ident(_) => "IDENT",

        Let | Function | If | Else | Return => "KEYWORD",

        Plus | Minus | Star | Slash | Bang | Assign => "OP",
        Eq | NotEq | Lt | Gt => "CMP",

        LParen | RParen => "PAREN",
        LBracket | RBracket => "BRACKET",
        LBrace | RBrace => "BRACE",
        Comma | Semicolon | Colon => "PUNCT",
    }
}

fn color(t: &Token) -> &'static str {
    use Token::*;
    match t {
        Comment(_) | Eof => TokenDumper::DIM,
        String(_) => TokenDumper::GRN,
        Integer(_) | True | False => TokenDumper::CYN,
        Ident(_) => TokenDumper::YEL,
        Let | Function | If | Else | Return => TokenDumper::BLU,
        Plus | Minus | Star | Slash | Bang | Assign | Eq | NotEq | Lt | Gt => TokenDumper::MAG,
        _ => TokenDumper::RESET,
    }
}
