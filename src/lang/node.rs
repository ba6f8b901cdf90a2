//! Abstract syntax tree produced by the parser and consumed by the
//! bytecode compiler.

/// A whole source unit: a sequence of statements.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    pub statements: Vec<Statement>,
}

/// A `{ ... }` statement list.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Block {
    pub statements: Vec<Statement>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// `let <name> = <value>;`
    Let { name: String, value: Expression },

    /// `return <value>;` or a bare `return;`
    Return(Option<Expression>),

    /// An expression evaluated for its value, which is then discarded.
    Expression(Expression),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixOp {
    Bang,
    Minus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfixOp {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Gt,
    Eq,
    NotEq,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    // ───────────────────────────── Literals ─────────────────────────────
    Identifier(String),
    Integer(i64),
    String(String),
    Boolean(bool),

    /// `[a, b, c]`
    Array(Vec<Expression>),

    /// `{k1: v1, k2: v2}`, pairs kept in source order.
    Hash(Vec<(Expression, Expression)>),

    /// `function(a, b) { ... }`
    ///
    /// `name` is set when the literal is the direct right-hand side of a
    /// `let`, so the body can refer to itself.
    Function {
        name: Option<String>,
        parameters: Vec<String>,
        body: Block,
    },

    // ──────────────────────────── Operators ─────────────────────────────
    Prefix {
        op: PrefixOp,
        right: Box<Expression>,
    },
    Infix {
        op: InfixOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },

    // ─────────────────────────── Control flow ───────────────────────────
    If {
        condition: Box<Expression>,
        consequence: Block,
        alternative: Option<Block>,
    },

    Call {
        function: Box<Expression>,
        arguments: Vec<Expression>,
    },

    /// `collection[index]`
    Index {
        left: Box<Expression>,
        index: Box<Expression>,
    },
}

impl std::fmt::Display for PrefixOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrefixOp::Bang => write!(f, "!"),
            PrefixOp::Minus => write!(f, "-"),
        }
    }
}

impl std::fmt::Display for InfixOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InfixOp::Add => "+",
            InfixOp::Sub => "-",
            InfixOp::Mul => "*",
            InfixOp::Div => "/",
            InfixOp::Lt => "<",
            InfixOp::Gt => ">",
            InfixOp::Eq => "==",
            InfixOp::NotEq => "!=",
        };
        write!(f, "{}", s)
    }
}
