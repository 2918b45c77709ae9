//! Análisis sintáctico.
//!
//! El parser es de descenso recursivo, con lookahead arbitrario por
//! medio de clonación de su estado (el flujo de tokens es un iterador
//! clonable). Las expresiones se analizan por precedencia de operadores
//! con las mismas reglas de C.

use std::{iter::Peekable, marker::PhantomData};
use thiserror::Error;

use crate::{
    lex::{Identifier, Keyword, Token},
    model::{Interval, Type},
    source::{Located, Location},
};

#[derive(Debug)]
pub struct Ast {
    pub items: Vec<Item>,
    pub eof: Location,
}

#[derive(Debug)]
pub enum Item {
    Include(Located<String>),
    Extern(Extern),
    Static(StaticDecl),
    Function(Function),
    Thread(Coroutine),
    Hook(Hook),
    Entry(Entry),
    UseReg(UseReg),
    Tune(Tune),
    Cflags(Cflags),
}

#[derive(Debug)]
pub struct Extern {
    pub name: Located<Identifier>,
    pub kind: ExternKind,
}

#[derive(Debug)]
pub enum ExternKind {
    Variable { typ: Type, volatile: bool },
    Function,
}

#[derive(Debug)]
pub struct StaticDecl {
    pub name: Located<Identifier>,
    pub typ: Located<Type>,
    pub volatile: bool,
    pub length: Option<Located<i64>>,
    pub initial: Option<Located<Expr>>,
}

/// Cuerpo de un hilo, subrutina, hook o función.
///
/// Las declaraciones `static` y `sub` solo pueden aparecer en el nivel
/// superior del cuerpo, nunca dentro de bloques anidados.
#[derive(Debug, Default)]
pub struct Body {
    pub statics: Vec<StaticDecl>,
    pub subroutines: Vec<Coroutine>,
    pub statements: Vec<Statement>,
}

/// Un hilo (sin parámetros) o una subrutina.
#[derive(Debug)]
pub struct Coroutine {
    pub name: Located<Identifier>,
    pub parameters: Vec<Parameter>,
    pub body: Body,
}

#[derive(Debug)]
pub struct Function {
    pub name: Located<Identifier>,
    pub parameters: Vec<Parameter>,
    pub returns: Option<Located<Type>>,
    pub body: Body,
}

#[derive(Debug)]
pub struct Hook {
    pub name: Located<Identifier>,
    pub kind: HookKind,
    pub body: Body,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HookKind {
    Init,
    Runnable,
    Every(Interval),
}

#[derive(Debug)]
pub struct Entry {
    pub location: Location,
    pub body: Body,
}

#[derive(Debug)]
pub struct Parameter {
    pub name: Located<Identifier>,
    pub of: Located<Type>,
}

#[derive(Debug)]
pub struct UseReg {
    pub path: Located<Vec<Identifier>>,
    pub class: Option<Located<Identifier>>,
}

#[derive(Debug)]
pub struct Tune {
    pub path: Located<Vec<Identifier>>,
    pub flags: Vec<Located<Identifier>>,
}

#[derive(Debug)]
pub struct Cflags {
    pub name: Located<Identifier>,
    pub profile: Option<Located<Identifier>>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Likelihood {
    Likely,
    Unlikely,
}

#[derive(Debug)]
pub enum Statement {
    Let {
        name: Located<Identifier>,
        typ: Located<Type>,
        length: Option<Located<i64>>,
        value: Option<Located<Expr>>,
    },

    Yield(Location),

    WaitUntil {
        condition: Located<Expr>,
        hint: Option<Likelihood>,
    },

    Call {
        subroutine: Located<Identifier>,
        args: Vec<Located<Expr>>,
    },

    If {
        condition: Located<Expr>,
        then: Vec<Statement>,
        otherwise: Vec<Statement>,
    },

    While {
        condition: Located<Expr>,
        body: Vec<Statement>,
    },

    Loop(Vec<Statement>),

    Break(Location),

    Continue(Location),

    Return {
        value: Option<Located<Expr>>,
        location: Location,
    },

    Assign {
        target: Located<Target>,
        op: Option<BinOp>,
        value: Located<Expr>,
    },

    Eval(Located<Expr>),
}

#[derive(Debug)]
pub enum Expr {
    Integer(i64),
    Char(u8),
    Read(Target),
    Call {
        function: Located<Identifier>,
        args: Vec<Located<Expr>>,
    },
    Unary(UnOp, Box<Located<Expr>>),
    Binary(Box<Located<Expr>>, BinOp, Box<Located<Expr>>),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnOp {
    Negate,
    Not,
    Complement,
}

impl UnOp {
    pub fn symbol(self) -> &'static str {
        match self {
            UnOp::Negate => "-",
            UnOp::Not => "!",
            UnOp::Complement => "~",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
    LogicAnd,
    LogicOr,
}

impl BinOp {
    /// Precedencia de C, mayor es más fuerte.
    fn precedence(self) -> u8 {
        use BinOp::*;

        match self {
            LogicOr => 1,
            LogicAnd => 2,
            Or => 3,
            Xor => 4,
            And => 5,
            Equal | NotEqual => 6,
            Less | LessOrEqual | Greater | GreaterOrEqual => 7,
            Shl | Shr => 8,
            Add | Sub => 9,
            Mul | Div | Mod => 10,
        }
    }

    fn from_token(token: &Token) -> Option<Self> {
        use BinOp::*;

        let op = match token {
            Token::OrOr => LogicOr,
            Token::AndAnd => LogicAnd,
            Token::Pipe => Or,
            Token::Caret => Xor,
            Token::Amp => And,
            Token::Equal => Equal,
            Token::NotEqual => NotEqual,
            Token::Less => Less,
            Token::LessOrEqual => LessOrEqual,
            Token::Greater => Greater,
            Token::GreaterOrEqual => GreaterOrEqual,
            Token::Shl => Shl,
            Token::Shr => Shr,
            Token::Plus => Add,
            Token::Minus => Sub,
            Token::Times => Mul,
            Token::Slash => Div,
            Token::Percent => Mod,
            _ => return None,
        };

        Some(op)
    }

    /// Operador equivalente en C.
    pub fn symbol(self) -> &'static str {
        use BinOp::*;

        match self {
            Add => "+",
            Sub => "-",
            Mul => "*",
            Div => "/",
            Mod => "%",
            And => "&",
            Or => "|",
            Xor => "^",
            Shl => "<<",
            Shr => ">>",
            Equal => "==",
            NotEqual => "!=",
            Less => "<",
            LessOrEqual => "<=",
            Greater => ">",
            GreaterOrEqual => ">=",
            LogicAnd => "&&",
            LogicOr => "||",
        }
    }
}

#[derive(Debug)]
pub struct Target {
    pub variable: Located<Identifier>,
    pub index: Option<Box<Located<Expr>>>,
}

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ParserError {
    #[error("Expected token {0}, found {1} instead")]
    UnexpectedToken(Token, Token),

    #[error("Expected token {0}, none was found instead")]
    MissingToken(Token),

    #[error("Expected identifier")]
    ExpectedId,

    #[error("Expected a type (`u8`, `u16`, `u24`, `u32`, `i8`, `i16`, `i24`, `i32`)")]
    ExpectedType,

    #[error("Expected an integer literal")]
    ExpectedInteger,

    #[error("Expected a string literal")]
    ExpectedString,

    #[error("Expected a declaration (`thread`, `fn`, `static`, `extern`, `every`, `init`, `runnable`, `main`, `use_reg`, `tune`, `cflags` or `include`)")]
    ExpectedItem,

    #[error("Expected a statement")]
    ExpectedStatement,

    #[error("Expected an expression")]
    ExpectedExpr,

    #[error("Expected an assignment operator")]
    ExpectedAssignment,

    #[error("Unknown interval `{0}`, expected `decisecond`, `second`, `minute` or `hour`")]
    UnknownInterval(Identifier),

    #[error("Abrupt end of program")]
    UnexpectedEof,
}

/// Flujo de tokens que puede clonarse para hacer lookahead.
pub trait TokenStream<'a>: Iterator<Item = &'a Located<Token>> + Clone {}

impl<'a, I> TokenStream<'a> for I where I: Iterator<Item = &'a Located<Token>> + Clone {}

pub fn parse<'a>(tokens: impl TokenStream<'a>, start: Location) -> Parse<Ast> {
    let mut parser = Parser {
        tokens: tokens.peekable(),
        last_known: start,
        lifetime_hack: PhantomData,
    };

    parser.program()
}

#[derive(Clone)]
struct Parser<'a, I: TokenStream<'a>> {
    tokens: Peekable<I>,
    last_known: Location,
    lifetime_hack: PhantomData<&'a ()>,
}

pub type Parse<T> = Result<T, Located<ParserError>>;

impl<'a, I: TokenStream<'a>> Parser<'a, I> {
    fn program(&mut self) -> Parse<Ast> {
        let mut items = Vec::new();
        while self.tokens.peek().is_some() {
            items.push(self.item()?);
        }

        Ok(Ast {
            items,
            eof: self.last_known.clone(),
        })
    }

    fn item(&mut self) -> Parse<Item> {
        let item = match self.peek()? {
            Token::Keyword(Keyword::Include) => {
                self.next()?;
                let (location, token) = self.next()?.split();

                let header = match token {
                    Token::StrLiteral(header) => Located::at(header, location),
                    _ => return self.fail(ParserError::ExpectedString),
                };

                self.expect(Token::Semicolon)?;
                Item::Include(header)
            }

            Token::Keyword(Keyword::Extern) => Item::Extern(self.extern_decl()?),
            Token::Keyword(Keyword::Static) => Item::Static(self.static_decl()?),
            Token::Keyword(Keyword::Fn) => Item::Function(self.function()?),

            Token::Keyword(Keyword::Thread) => {
                self.next()?;
                let name = self.id()?;
                let body = self.body()?;

                Item::Thread(Coroutine {
                    name,
                    parameters: Vec::new(),
                    body,
                })
            }

            Token::Keyword(Keyword::Every) => {
                self.next()?;
                let interval = self.id()?;
                let interval = match Interval::from_name(interval.as_ref().as_ref()) {
                    Some(interval) => interval,
                    None => {
                        let (location, id) = interval.split();
                        return Err(Located::at(ParserError::UnknownInterval(id), location));
                    }
                };

                self.hook(HookKind::Every(interval))?
            }

            Token::Keyword(Keyword::Init) => {
                self.next()?;
                self.hook(HookKind::Init)?
            }

            Token::Keyword(Keyword::Runnable) => {
                self.next()?;
                self.hook(HookKind::Runnable)?
            }

            Token::Keyword(Keyword::Main) => {
                let location = self.next()?.location().clone();
                let body = self.body()?;

                Item::Entry(Entry { location, body })
            }

            Token::Keyword(Keyword::UseReg) => {
                self.next()?;
                let path = self.path()?;
                let class = match self.peek()? {
                    Token::Semicolon => None,
                    _ => Some(self.id()?),
                };

                self.expect(Token::Semicolon)?;
                Item::UseReg(UseReg { path, class })
            }

            Token::Keyword(Keyword::Tune) => {
                self.next()?;
                let path = self.path()?;
                let flags = self.separated(Parser::id, Token::Semicolon)?;

                Item::Tune(Tune { path, flags })
            }

            Token::Keyword(Keyword::Cflags) => {
                self.next()?;
                let name = self.id()?;
                let profile = match self.peek()? {
                    Token::Semicolon => None,
                    _ => Some(self.id()?),
                };

                self.expect(Token::Semicolon)?;
                Item::Cflags(Cflags { name, profile })
            }

            _ => {
                self.next()?;
                return self.fail(ParserError::ExpectedItem);
            }
        };

        Ok(item)
    }

    fn hook(&mut self, kind: HookKind) -> Parse<Item> {
        let name = self.id()?;
        let body = self.body()?;

        Ok(Item::Hook(Hook { name, kind, body }))
    }

    fn extern_decl(&mut self) -> Parse<Extern> {
        self.keyword(Keyword::Extern)?;

        let kind = match self.peek()? {
            Token::Keyword(Keyword::Fn) => {
                self.next()?;
                ExternKind::Function
            }

            _ => {
                let volatile = self.volatile()?;
                let typ = self.typ()?.into_inner();
                ExternKind::Variable { typ, volatile }
            }
        };

        let name = self.id()?;
        self.expect(Token::Semicolon)?;

        Ok(Extern { name, kind })
    }

    fn static_decl(&mut self) -> Parse<StaticDecl> {
        self.keyword(Keyword::Static)?;
        let volatile = self.volatile()?;
        let typ = self.typ()?;
        let name = self.id()?;
        let length = self.length()?;

        let initial = match self.peek()? {
            Token::Assign => {
                self.next()?;
                Some(self.expr()?)
            }

            _ => None,
        };

        self.expect(Token::Semicolon)?;
        Ok(StaticDecl {
            name,
            typ,
            volatile,
            length,
            initial,
        })
    }

    fn function(&mut self) -> Parse<Function> {
        self.keyword(Keyword::Fn)?;
        let name = self.id()?;

        self.expect(Token::OpenParen)?;
        let parameters = self.separated(Parser::parameter, Token::CloseParen)?;

        let returns = match self.peek()? {
            Token::Arrow => {
                self.next()?;
                Some(self.typ()?)
            }

            _ => None,
        };

        let body = self.body()?;
        Ok(Function {
            name,
            parameters,
            returns,
            body,
        })
    }

    fn subroutine(&mut self) -> Parse<Coroutine> {
        self.keyword(Keyword::Sub)?;
        let name = self.id()?;

        let parameters = match self.peek()? {
            Token::OpenParen => {
                self.next()?;
                self.separated(Parser::parameter, Token::CloseParen)?
            }

            _ => Vec::new(),
        };

        let body = self.body()?;
        Ok(Coroutine {
            name,
            parameters,
            body,
        })
    }

    fn parameter(&mut self) -> Parse<Parameter> {
        let of = self.typ()?;
        let name = self.id()?;

        Ok(Parameter { name, of })
    }

    fn body(&mut self) -> Parse<Body> {
        self.expect(Token::OpenCurly)?;

        let mut body = Body::default();
        loop {
            match self.peek()? {
                Token::CloseCurly => {
                    self.next()?;
                    break Ok(body);
                }

                Token::Keyword(Keyword::Static) => body.statics.push(self.static_decl()?),
                Token::Keyword(Keyword::Sub) => body.subroutines.push(self.subroutine()?),
                _ => body.statements.push(self.statement()?),
            }
        }
    }

    fn block(&mut self) -> Parse<Vec<Statement>> {
        self.expect(Token::OpenCurly)?;

        let mut statements = Vec::new();
        loop {
            match self.peek()? {
                Token::CloseCurly => {
                    self.next()?;
                    break Ok(statements);
                }

                _ => statements.push(self.statement()?),
            }
        }
    }

    fn statement(&mut self) -> Parse<Statement> {
        let statement = match self.peek()? {
            Token::Keyword(Keyword::Let) => {
                self.next()?;
                let typ = self.typ()?;
                let name = self.id()?;
                let length = self.length()?;

                let value = match self.peek()? {
                    Token::Assign => {
                        self.next()?;
                        Some(self.expr()?)
                    }

                    _ => None,
                };

                self.expect(Token::Semicolon)?;
                Statement::Let {
                    name,
                    typ,
                    length,
                    value,
                }
            }

            Token::Keyword(Keyword::Yield) => {
                let location = self.next()?.location().clone();
                self.expect(Token::Semicolon)?;

                Statement::Yield(location)
            }

            Token::Keyword(Keyword::WaitUntil) => {
                self.next()?;
                let condition = self.expr()?;

                let hint = match self.peek()? {
                    Token::Keyword(Keyword::Likely) => Some(Likelihood::Likely),
                    Token::Keyword(Keyword::Unlikely) => Some(Likelihood::Unlikely),
                    _ => None,
                };

                if hint.is_some() {
                    self.next()?;
                }

                self.expect(Token::Semicolon)?;
                Statement::WaitUntil { condition, hint }
            }

            Token::Keyword(Keyword::Call) => {
                self.next()?;
                let subroutine = self.id()?;

                let args = match self.peek()? {
                    Token::OpenParen => {
                        self.next()?;
                        self.separated(Parser::expr, Token::CloseParen)?
                    }

                    _ => Vec::new(),
                };

                self.expect(Token::Semicolon)?;
                Statement::Call { subroutine, args }
            }

            Token::Keyword(Keyword::If) => self.if_statement()?,

            Token::Keyword(Keyword::While) => {
                self.next()?;
                let condition = self.expr()?;
                let body = self.block()?;

                Statement::While { condition, body }
            }

            Token::Keyword(Keyword::Loop) => {
                self.next()?;
                Statement::Loop(self.block()?)
            }

            Token::Keyword(Keyword::Break) => {
                let location = self.next()?.location().clone();
                self.expect(Token::Semicolon)?;

                Statement::Break(location)
            }

            Token::Keyword(Keyword::Continue) => {
                let location = self.next()?.location().clone();
                self.expect(Token::Semicolon)?;

                Statement::Continue(location)
            }

            Token::Keyword(Keyword::Return) => {
                let location = self.next()?.location().clone();
                let value = match self.peek()? {
                    Token::Semicolon => None,
                    _ => Some(self.expr()?),
                };

                self.expect(Token::Semicolon)?;
                Statement::Return { value, location }
            }

            Token::Id(_) => {
                // `f(...)` es una llamada, cualquier otra cosa es asignación
                let is_call = self.lookahead(|s| {
                    s.next()?;
                    Ok(matches!(s.peek(), Ok(Token::OpenParen)))
                })?;

                if is_call {
                    let call = self.expr()?;
                    self.expect(Token::Semicolon)?;

                    Statement::Eval(call)
                } else {
                    self.assignment()?
                }
            }

            _ => {
                self.next()?;
                return self.fail(ParserError::ExpectedStatement);
            }
        };

        Ok(statement)
    }

    fn if_statement(&mut self) -> Parse<Statement> {
        self.keyword(Keyword::If)?;
        let condition = self.expr()?;
        let then = self.block()?;

        let otherwise = match self.tokens.peek().map(|token| token.as_ref()) {
            Some(Token::Keyword(Keyword::Else)) => {
                self.next()?;
                match self.peek()? {
                    Token::Keyword(Keyword::If) => vec![self.if_statement()?],
                    _ => self.block()?,
                }
            }

            _ => Vec::new(),
        };

        Ok(Statement::If {
            condition,
            then,
            otherwise,
        })
    }

    fn assignment(&mut self) -> Parse<Statement> {
        let target = self.target()?;

        let op = match self.next()?.into_inner() {
            Token::Assign => None,
            Token::AddAssign => Some(BinOp::Add),
            Token::SubAssign => Some(BinOp::Sub),
            Token::AndAssign => Some(BinOp::And),
            Token::OrAssign => Some(BinOp::Or),
            Token::XorAssign => Some(BinOp::Xor),
            _ => return self.fail(ParserError::ExpectedAssignment),
        };

        let value = self.expr()?;
        self.expect(Token::Semicolon)?;

        Ok(Statement::Assign { target, op, value })
    }

    fn target(&mut self) -> Parse<Located<Target>> {
        let variable = self.id()?;

        let index = match self.tokens.peek().map(|token| token.as_ref()) {
            Some(Token::OpenSquare) => {
                self.next()?;
                let index = self.expr()?;
                self.expect(Token::CloseSquare)?;

                Some(Box::new(index))
            }

            _ => None,
        };

        let location = Location::span(variable.location().clone(), &self.last_known);
        Ok(Located::at(Target { variable, index }, location))
    }

    fn expr(&mut self) -> Parse<Located<Expr>> {
        self.binary(1)
    }

    fn binary(&mut self, min_precedence: u8) -> Parse<Located<Expr>> {
        let mut lhs = self.unary()?;

        loop {
            let op = match self.tokens.peek().and_then(|token| BinOp::from_token(token.as_ref())) {
                Some(op) if op.precedence() >= min_precedence => op,
                _ => break Ok(lhs),
            };

            self.next()?;
            let rhs = self.binary(op.precedence() + 1)?;

            let location = Location::span(lhs.location().clone(), rhs.location());
            lhs = Located::at(Expr::Binary(Box::new(lhs), op, Box::new(rhs)), location);
        }
    }

    fn unary(&mut self) -> Parse<Located<Expr>> {
        let op = match self.peek()? {
            Token::Minus => UnOp::Negate,
            Token::Bang => UnOp::Not,
            Token::Tilde => UnOp::Complement,
            _ => return self.primary(),
        };

        let start = self.next()?.location().clone();
        let operand = self.unary()?;

        let location = Location::span(start, operand.location());
        Ok(Located::at(Expr::Unary(op, Box::new(operand)), location))
    }

    fn primary(&mut self) -> Parse<Located<Expr>> {
        match self.peek()? {
            Token::Id(_) => {
                let is_call = self.lookahead(|s| {
                    s.next()?;
                    Ok(matches!(
                        s.tokens.peek().map(|token| token.as_ref()),
                        Some(Token::OpenParen)
                    ))
                })?;

                if is_call {
                    let function = self.id()?;
                    self.expect(Token::OpenParen)?;
                    let args = self.separated(Parser::expr, Token::CloseParen)?;

                    let location = Location::span(function.location().clone(), &self.last_known);
                    Ok(Located::at(Expr::Call { function, args }, location))
                } else {
                    Ok(self.target()?.map(Expr::Read))
                }
            }

            Token::OpenParen => {
                self.next()?;
                let inner = self.expr()?;
                self.expect(Token::CloseParen)?;

                Ok(inner)
            }

            _ => {
                let (location, token) = self.next()?.split();
                let expr = match token {
                    Token::IntLiteral(integer) => Expr::Integer(integer),
                    Token::CharLiteral(c) => Expr::Char(c),
                    Token::Keyword(Keyword::True) => Expr::Integer(1),
                    Token::Keyword(Keyword::False) => Expr::Integer(0),
                    _ => return self.fail(ParserError::ExpectedExpr),
                };

                Ok(Located::at(expr, location))
            }
        }
    }

    fn path(&mut self) -> Parse<Located<Vec<Identifier>>> {
        let first = self.id()?;
        let start = first.location().clone();

        let mut path = vec![first.into_inner()];
        while let Some(Token::Period) = self.tokens.peek().map(|token| token.as_ref()) {
            self.next()?;
            path.push(self.id()?.into_inner());
        }

        let location = Location::span(start, &self.last_known);
        Ok(Located::at(path, location))
    }

    fn typ(&mut self) -> Parse<Located<Type>> {
        let (location, token) = self.next()?.split();
        let typ = match token {
            Token::Keyword(Keyword::U8) => Type::U8,
            Token::Keyword(Keyword::U16) => Type::U16,
            Token::Keyword(Keyword::U24) => Type::U24,
            Token::Keyword(Keyword::U32) => Type::U32,
            Token::Keyword(Keyword::I8) => Type::I8,
            Token::Keyword(Keyword::I16) => Type::I16,
            Token::Keyword(Keyword::I24) => Type::I24,
            Token::Keyword(Keyword::I32) => Type::I32,
            _ => return self.fail(ParserError::ExpectedType),
        };

        Ok(Located::at(typ, location))
    }

    fn volatile(&mut self) -> Parse<bool> {
        match self.peek()? {
            Token::Keyword(Keyword::Volatile) => {
                self.next()?;
                Ok(true)
            }

            _ => Ok(false),
        }
    }

    fn length(&mut self) -> Parse<Option<Located<i64>>> {
        match self.peek()? {
            Token::OpenSquare => {
                self.next()?;
                let (location, token) = self.next()?.split();

                let length = match token {
                    Token::IntLiteral(length) => length,
                    _ => return self.fail(ParserError::ExpectedInteger),
                };

                self.expect(Token::CloseSquare)?;
                Ok(Some(Located::at(length, location)))
            }

            _ => Ok(None),
        }
    }

    fn lookahead<T, F>(&mut self, rule: F) -> Parse<T>
    where
        F: FnOnce(&mut Self) -> Parse<T>,
    {
        rule(&mut self.clone())
    }

    /// Elementos separados por comas y terminados por `close`, el cual
    /// se consume. Se admiten listas vacías.
    fn separated<T, F>(&mut self, mut rule: F, close: Token) -> Parse<Vec<T>>
    where
        F: FnMut(&mut Self) -> Parse<T>,
    {
        let mut items = Vec::new();
        if self.peek()? == close {
            self.next()?;
            return Ok(items);
        }

        loop {
            items.push(rule(self)?);

            match self.next()?.into_inner() {
                Token::Comma => continue,
                token if token == close => break Ok(items),
                found => return self.fail(ParserError::UnexpectedToken(close, found)),
            }
        }
    }

    fn id(&mut self) -> Parse<Located<Identifier>> {
        let (location, token) = self.next()?.split();
        match token {
            Token::Id(id) => Ok(Located::at(id, location)),
            _ => self.fail(ParserError::ExpectedId),
        }
    }

    fn keyword(&mut self, keyword: Keyword) -> Parse<()> {
        self.expect(Token::Keyword(keyword))
    }

    fn expect(&mut self, token: Token) -> Parse<()> {
        match self.next().map(Located::into_inner) {
            Ok(found) if found == token => Ok(()),
            Ok(found) => self.fail(ParserError::UnexpectedToken(token, found)),
            Err(_) => self.fail(ParserError::MissingToken(token)),
        }
    }

    fn peek(&mut self) -> Parse<Token> {
        match self.tokens.peek() {
            Some(token) => Ok(token.as_ref().clone()),
            None => self.fail(ParserError::UnexpectedEof),
        }
    }

    fn next(&mut self) -> Parse<Located<Token>> {
        match self.tokens.next() {
            Some(token) => {
                self.last_known = token.location().clone();
                Ok(token.clone())
            }

            None => self.fail(ParserError::UnexpectedEof),
        }
    }

    fn fail<T>(&self, error: ParserError) -> Parse<T> {
        Err(Located::at(error, self.last_known.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{lex::Lexer, source};

    fn parse_text(text: &str) -> Parse<Ast> {
        let (start, stream) = source::consume(text.as_bytes(), "<test>");
        let tokens = Lexer::new(start.clone(), stream).try_exhaustive().unwrap();
        parse(tokens.iter(), start)
    }

    #[test]
    fn thread_with_nested_subroutine() {
        let ast = parse_text(
            "thread writer {
                static u8 byte;
                sub send(u8 b) {
                    wait_until ready & 32 unlikely;
                    UDR0 = b;
                }
                loop { call send('A'); yield; }
            }",
        )
        .unwrap();

        let thread = match &ast.items[..] {
            [Item::Thread(thread)] => thread,
            other => panic!("unexpected items: {:?}", other),
        };

        assert_eq!(thread.name.as_ref().as_ref(), "writer");
        assert_eq!(thread.body.statics.len(), 1);
        assert_eq!(thread.body.subroutines.len(), 1);

        let send = &thread.body.subroutines[0];
        assert_eq!(send.parameters.len(), 1);
        assert!(matches!(
            send.body.statements[0],
            Statement::WaitUntil {
                hint: Some(Likelihood::Unlikely),
                ..
            }
        ));
    }

    #[test]
    fn expressions_follow_c_precedence() {
        let ast = parse_text("main { x = 1 + 2 * 3 == 7 || y; }").unwrap();

        let body = match &ast.items[..] {
            [Item::Entry(entry)] => &entry.body,
            _ => panic!("expected entry"),
        };

        let value = match &body.statements[0] {
            Statement::Assign { value, .. } => value.as_ref(),
            _ => panic!("expected assignment"),
        };

        match value {
            Expr::Binary(lhs, BinOp::LogicOr, _) => match lhs.as_ref().as_ref() {
                Expr::Binary(sum, BinOp::Equal, _) => {
                    assert!(matches!(sum.as_ref().as_ref(), Expr::Binary(_, BinOp::Add, _)))
                }
                other => panic!("unexpected lhs: {:?}", other),
            },
            other => panic!("unexpected tree: {:?}", other),
        }
    }

    #[test]
    fn hints_and_flags() {
        let ast = parse_text(
            "use_reg writer.send.state low;
             tune is_day pure, no_inline;
             cflags firmware size;
             every hour stats { }",
        )
        .unwrap();

        match &ast.items[0] {
            Item::UseReg(hint) => {
                assert_eq!(hint.path.as_ref().len(), 3);
                assert_eq!(hint.class.as_ref().unwrap().as_ref().as_ref(), "low");
            }
            _ => panic!("expected use_reg"),
        }

        assert!(matches!(&ast.items[1], Item::Tune(tune) if tune.flags.len() == 2));
        assert!(matches!(
            &ast.items[3],
            Item::Hook(Hook {
                kind: HookKind::Every(Interval::Hour),
                ..
            })
        ));
    }

    #[test]
    fn empty_and_filled_lists() {
        let ast = parse_text(
            "fn tick() { }
             fn add(u8 a, u8 b) -> u8 { return a / b; }
             main { tick(); x = add(1, 2); }",
        )
        .unwrap();

        match &ast.items[..] {
            [Item::Function(tick), Item::Function(add), Item::Entry(_)] => {
                assert!(tick.parameters.is_empty());
                assert_eq!(add.parameters.len(), 2);
            }
            other => panic!("unexpected items: {:?}", other),
        }
    }

    #[test]
    fn missing_semicolon_is_reported() {
        let error = parse_text("thread t { yield }").unwrap_err();
        assert!(matches!(
            error.as_ref(),
            ParserError::UnexpectedToken(Token::Semicolon, Token::CloseCurly)
        ));
    }

    #[test]
    fn unknown_interval_is_reported() {
        let error = parse_text("every fortnight t { }").unwrap_err();
        assert!(matches!(error.as_ref(), ParserError::UnknownInterval(_)));
    }
}
