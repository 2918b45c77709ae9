//! Análisis léxico.
//!
//! # Tokenization
//! Esta es la primera fase del compilador. Descompone un [`InputStream`]
//! (flujo de caracteres) en unidades léxicas denominadas tokens. Los espacios
//! en blanco y los comentarios (`//` y `/* */`) se descartan durante esta
//! operación. Cada token emitido esta asociado a una ubicación en el código
//! fuente original.
//!
//! # Reglas importantes del lenguaje
//! - Las palabras clave son case-insensitive, por lo cual tanto `thread`
//!   como `THREAD` y `Thread` resultan en [`Keyword::Thread`]. Esto permite
//!   escribir directivas en mayúsculas, al estilo de macros de C.
//! - Los identificadores sí distinguen mayúsculas, ya que terminan siendo
//!   símbolos de C (por ejemplo, registros de hardware como `UDR0`).
//! - Las constantes enteras pueden ser decimales o hexadecimales (`0x`)
//!   y se limitan al rango de `u32`.
//!
//! # Errores
//! El lexer es capaz de recuperarse parcialmente de condiciones de error.
//! Esto ocurre en suficiente grado como para reportar más de un error por
//! ejecución, pero no lo suficiente como para permitir el avance a las
//! demás fases de la compilación.

use crate::source::{InputStream, Located, Location};
use std::{
    fmt::{self, Display},
    rc::Rc,
    str::FromStr,
};

use thiserror::Error;

// Case-insensitive
pub use unicase::Ascii as NoCase;

/// Literal entero máximo.
const INT_MAX: i64 = u32::MAX as i64;

/// Error de escaneo.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum LexerError {
    /// Error de E/S originado por el [`InputStream`].
    #[error("I/O error")]
    Input(#[from] std::io::Error),

    /// Carácter desconocido o inesperado en el flujo de entrada.
    #[error("Bad character {0:?} in input stream")]
    BadChar(char),

    /// Se esperaba un carácter específico en esta posición.
    #[error("Expected {0:?}")]
    Expected(char),

    /// Una constante entera se encuentra fuera de rango.
    #[error("Integer literal overflow, valid range is [0, {INT_MAX}]")]
    IntOverflow,

    /// Literal de carácter vacío, sin cerrar o con un escape desconocido.
    #[error("Malformed character literal")]
    BadCharLiteral,

    /// Literal de cadena sin cerrar antes del fin de línea.
    #[error("Unterminated string literal")]
    UnterminatedString,
}

/// Un identificador.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier(Rc<str>);

impl Identifier {
    /// Construye un identificador a partir de su lexema.
    pub fn new(name: &str) -> Self {
        Identifier(Rc::from(name))
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for Identifier {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str(&self.0)
    }
}

/// Objeto resultante del análisis léxico.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Identificador.
    Id(Identifier),

    /// Palabra clave.
    Keyword(Keyword),

    /// Literal de entero.
    IntLiteral(i64),

    /// Literal de carácter ASCII.
    CharLiteral(u8),

    /// Literal de cadena, solo se usa en `include`.
    StrLiteral(String),

    Assign,
    AddAssign,
    SubAssign,
    AndAssign,
    OrAssign,
    XorAssign,
    Comma,
    Period,
    Semicolon,
    Arrow,
    OpenParen,
    CloseParen,
    OpenCurly,
    CloseCurly,
    OpenSquare,
    CloseSquare,
    Plus,
    Minus,
    Times,
    Slash,
    Percent,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Bang,
    Shl,
    Shr,
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
    AndAnd,
    OrOr,
}

impl Display for Token {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Token::*;

        let punctuation = match self {
            Id(id) => return write!(fmt, "identifier `{}`", id),
            Keyword(keyword) => return write!(fmt, "keyword `{}`", keyword),
            IntLiteral(integer) => return write!(fmt, "literal `{}`", integer),
            CharLiteral(c) => return write!(fmt, "literal {:?}", *c as char),
            StrLiteral(string) => return write!(fmt, "literal {:?}", string),
            Assign => "=",
            AddAssign => "+=",
            SubAssign => "-=",
            AndAssign => "&=",
            OrAssign => "|=",
            XorAssign => "^=",
            Comma => ",",
            Period => ".",
            Semicolon => ";",
            Arrow => "->",
            OpenParen => "(",
            CloseParen => ")",
            OpenCurly => "{",
            CloseCurly => "}",
            OpenSquare => "[",
            CloseSquare => "]",
            Plus => "+",
            Minus => "-",
            Times => "*",
            Slash => "/",
            Percent => "%",
            Amp => "&",
            Pipe => "|",
            Caret => "^",
            Tilde => "~",
            Bang => "!",
            Shl => "<<",
            Shr => ">>",
            Equal => "==",
            NotEqual => "!=",
            Less => "<",
            LessOrEqual => "<=",
            Greater => ">",
            GreaterOrEqual => ">=",
            AndAnd => "&&",
            OrOr => "||",
        };

        write!(fmt, "`{}`", punctuation)
    }
}

/// Una palabra clave.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Keyword {
    Include,
    Extern,
    Volatile,
    Static,
    Fn,
    Thread,
    Sub,
    Every,
    Init,
    Runnable,
    Main,
    UseReg,
    Tune,
    Cflags,
    Let,
    Yield,
    WaitUntil,
    Call,
    If,
    Else,
    While,
    Loop,
    Break,
    Continue,
    Return,
    True,
    False,
    Likely,
    Unlikely,
    U8,
    U16,
    U24,
    U32,
    I8,
    I16,
    I24,
    I32,
}

const KEYWORDS: &[(&str, Keyword)] = &[
    ("include",    Keyword::Include),
    ("extern",     Keyword::Extern),
    ("volatile",   Keyword::Volatile),
    ("static",     Keyword::Static),
    ("fn",         Keyword::Fn),
    ("thread",     Keyword::Thread),
    ("sub",        Keyword::Sub),
    ("every",      Keyword::Every),
    ("init",       Keyword::Init),
    ("runnable",   Keyword::Runnable),
    ("main",       Keyword::Main),
    ("use_reg",    Keyword::UseReg),
    ("tune",       Keyword::Tune),
    ("cflags",     Keyword::Cflags),
    ("let",        Keyword::Let),
    ("yield",      Keyword::Yield),
    ("wait_until", Keyword::WaitUntil),
    ("call",       Keyword::Call),
    ("if",         Keyword::If),
    ("else",       Keyword::Else),
    ("while",      Keyword::While),
    ("loop",       Keyword::Loop),
    ("break",      Keyword::Break),
    ("continue",   Keyword::Continue),
    ("return",     Keyword::Return),
    ("true",       Keyword::True),
    ("false",      Keyword::False),
    ("likely",     Keyword::Likely),
    ("unlikely",   Keyword::Unlikely),
    ("u8",         Keyword::U8),
    ("u16",        Keyword::U16),
    ("u24",        Keyword::U24),
    ("u32",        Keyword::U32),
    ("i8",         Keyword::I8),
    ("i16",        Keyword::I16),
    ("i24",        Keyword::I24),
    ("i32",        Keyword::I32),
];

impl Display for Keyword {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = KEYWORDS
            .iter()
            .find(|(_, keyword)| keyword == self)
            .map(|(name, _)| *name)
            .unwrap_or("?");

        fmt.write_str(name)
    }
}

impl FromStr for Keyword {
    type Err = ();

    fn from_str(string: &str) -> Result<Self, Self::Err> {
        KEYWORDS
            .iter()
            .find(|&&(name, _)| NoCase::new(name) == NoCase::new(string))
            .map(|&(_, keyword)| keyword)
            .ok_or(())
    }
}

/// Máquina de estados para análisis léxico.
///
/// Un lexer puede encontrarse en uno de diversos estados. La
/// salida del lexer, así como su siguiente estado, se define
/// a partir de tanto su estado actual como el siguiente carácter
/// encontrado en el flujo de entrada.
pub struct Lexer<S: Iterator> {
    source: std::iter::Peekable<S>,
    state: State,
    start: Location,
    next: Location,
}

/// Posibles estados del lexer.
enum State {
    /// Estado que ocurre antes de encontrar el inicio de un token.
    Start,

    /// Estado de error.
    Error,

    /// Estado de completitud; siempre emite el token incluido,
    /// consume la entrada actual y pasa a [`State::Start`].
    Complete(Token),

    /// Se encontró un carácter que puede iniciar un operador de dos
    /// caracteres, como `<` para `<<` o `<=`.
    Operator(char),

    /// Se encontró `/`: división, `//` o `/*`.
    Slash,

    /// Comentario de línea.
    ///
    /// Este estado vuelve a [`State::Start`] al encontrar `'\n'`.
    Comment,

    /// Comentario de bloque, `star` indica si el último carácter fue `*`.
    BlockComment { star: bool },

    /// Se encontró un `0` inicial, puede seguir `x`.
    Zero,

    /// Constante entera en la base indicada.
    Integer { value: i64, radix: u32 },

    /// Dentro de un literal de carácter, antes del carácter mismo.
    CharOpen,

    /// Se encontró `\` dentro de un literal de carácter.
    CharEscape,

    /// El literal de carácter solo espera su `'` de cierre.
    CharClose(u8),

    /// Dentro de un literal de cadena.
    Str(String),

    /// Término que puede ser un identificador o una palabra clave.
    Word(String),
}

impl<S: InputStream> Lexer<S> {
    /// Crea un lexer en estado inicial a partir de un flujo.
    pub fn new(start: Location, source: S) -> Self {
        let next = start.clone();
        Lexer {
            source: source.peekable(),
            state: State::Start,
            start,
            next,
        }
    }

    /// Reduce la entrada a sea una secuencia conocida de tokens
    /// infalibles o una secuencia de errores.
    ///
    /// En caso de que ocurra al menos un error, el lexer dejará
    /// de buscar tokens exitosos y comenzará a acumular solamente
    /// errores.
    pub fn try_exhaustive(mut self) -> Result<Vec<Located<Token>>, Vec<Located<LexerError>>> {
        let mut tokens = Vec::new();

        while let Some(result) = self.next() {
            match result {
                Ok(token) => tokens.push(token),
                Err(error) => {
                    drop(tokens);

                    let mut errors = vec![error];
                    errors.extend(self.filter_map(Result::err));

                    return Err(errors);
                }
            }
        }

        Ok(tokens)
    }

    /// Intenta construir un siguiente token.
    fn lex(&mut self) -> Result<Option<(Token, Location)>, LexerError> {
        use {State::*, Token::*};

        let mut last_accepted = self.start.clone();
        let token = loop {
            // Se espera un siguiente carácter, fallando si hay error de E/S
            let next_char = match self.source.peek() {
                None => None,
                Some(Ok((c, _))) => Some(*c),
                Some(Err(_)) => match self.source.next() {
                    Some(Err(error)) => break Err(error.into()),
                    _ => unreachable!(),
                },
            };

            // La posición de origen se mueve junto a la posición
            // siguiente siempre que no se haya encontrado una
            // frontera de token
            if let Start = self.state {
                self.start = self.next.clone();
            }

            match (&mut self.state, next_char) {
                // Se descarta la línea donde ocurrió el error
                (Error, None) => return Ok(None),
                (Error, Some('\n')) => self.state = Start,
                (Error, Some(_)) => (),

                (Start, None) => return Ok(None),
                (Start, Some(',')) => self.state = Complete(Comma),
                (Start, Some('.')) => self.state = Complete(Period),
                (Start, Some(';')) => self.state = Complete(Semicolon),
                (Start, Some('(')) => self.state = Complete(OpenParen),
                (Start, Some(')')) => self.state = Complete(CloseParen),
                (Start, Some('{')) => self.state = Complete(OpenCurly),
                (Start, Some('}')) => self.state = Complete(CloseCurly),
                (Start, Some('[')) => self.state = Complete(OpenSquare),
                (Start, Some(']')) => self.state = Complete(CloseSquare),
                (Start, Some('*')) => self.state = Complete(Times),
                (Start, Some('%')) => self.state = Complete(Percent),
                (Start, Some('~')) => self.state = Complete(Tilde),
                (Start, Some('/')) => self.state = State::Slash,
                (Start, Some('\'')) => self.state = CharOpen,
                (Start, Some('"')) => self.state = Str(String::new()),

                (Start, Some(c)) if "=+-&|^!<>".contains(c) => self.state = Operator(c),

                // Identificadores y palabras clave
                (Start, Some(c)) if c.is_ascii_alphabetic() || c == '_' => {
                    self.state = Word(c.to_string())
                }

                (Start, Some('0')) => self.state = Zero,

                // Inicio de una constante decimal. No se consume el
                // dígito, de ello se encarga el estado de constante
                (Start, Some(c)) if c.is_ascii_digit() => {
                    self.state = Integer {
                        value: 0,
                        radix: 10,
                    };

                    continue;
                }

                // Espacios en blanco y caracteres inesperados
                (Start, Some(c)) if c.is_ascii_whitespace() => (),
                (Start, Some(c)) => break Err(LexerError::BadChar(c)),

                // Emisión retardada de tokens cualesquiera
                (Complete(value), _) => break Ok(std::mem::replace(value, Plus)),

                (Operator(first), next) => match next.and_then(|second| compound(*first, second)) {
                    Some(token) => self.state = Complete(token),
                    None => break Ok(single(*first)),
                },

                (State::Slash, Some('/')) => self.state = Comment,
                (State::Slash, Some('*')) => self.state = BlockComment { star: false },
                (State::Slash, _) => break Ok(Token::Slash),

                // Los comentarios descartan la línea donde ocurren
                (Comment, Some('\n')) | (Comment, None) => self.state = Start,
                (Comment, Some(_)) => (),

                (BlockComment { .. }, None) => break Err(LexerError::Expected('/')),
                (BlockComment { star: true }, Some('/')) => self.state = Start,
                (BlockComment { star }, Some(c)) => *star = c == '*',

                (Zero, Some('x')) | (Zero, Some('X')) => {
                    self.state = Integer {
                        value: 0,
                        radix: 16,
                    }
                }

                (Zero, Some(c)) if c.is_ascii_digit() => {
                    self.state = Integer {
                        value: 0,
                        radix: 10,
                    };

                    continue;
                }

                (Zero, _) => break Ok(IntLiteral(0)),

                // Acumulación dígito por dígito de constantes enteras
                (Integer { value, radix }, Some(digit)) if digit.is_digit(*radix) => {
                    let digit = i64::from(digit.to_digit(*radix).unwrap_or(0));

                    match value
                        .checked_mul(*radix as i64)
                        .and_then(|n| n.checked_add(digit))
                        .filter(|n| *n <= INT_MAX)
                    {
                        Some(result) => *value = result,
                        None => break Err(LexerError::IntOverflow),
                    }
                }

                (Integer { .. }, Some(c)) if is_word_char(c) => break Err(LexerError::BadChar(c)),

                // Si sigue algo que no es un dígito, la constante a terminado
                (Integer { value, .. }, _) => break Ok(IntLiteral(*value)),

                (CharOpen, Some('\\')) => self.state = CharEscape,
                (CharOpen, Some(c)) if c.is_ascii() && c != '\'' && c != '\n' => {
                    self.state = CharClose(c as u8)
                }

                (CharOpen, _) => break Err(LexerError::BadCharLiteral),

                (CharEscape, Some(c)) => match escape(c) {
                    Some(byte) => self.state = CharClose(byte),
                    None => break Err(LexerError::BadCharLiteral),
                },

                (CharEscape, None) => break Err(LexerError::BadCharLiteral),

                (CharClose(byte), Some('\'')) => {
                    let byte = *byte;
                    self.state = Complete(CharLiteral(byte));
                }

                (CharClose(_), _) => break Err(LexerError::Expected('\'')),

                (Str(string), Some('"')) => {
                    let string = std::mem::take(string);
                    self.state = Complete(StrLiteral(string));
                }

                (Str(_), Some('\n')) | (Str(_), None) => {
                    break Err(LexerError::UnterminatedString)
                }

                (Str(string), Some(c)) => string.push(c),

                // Extensión de términos
                (Word(word), Some(c)) if is_word_char(c) => {
                    word.push(c);
                }

                // Si sigue algo que no puede formar parte del término, ha terminado
                (Word(word), _) => {
                    if let Ok(keyword) = self::Keyword::from_str(word) {
                        break Ok(Keyword(keyword));
                    } else {
                        break Ok(Id(Identifier::new(word)));
                    }
                }
            }

            // Si no hubo `continue`, aquí se consume el carácter que
            // se observó con lookahead anteriormente
            if let Some(Ok((_, next_position))) = self.source.next() {
                last_accepted = std::mem::replace(&mut self.next, next_position);
            }
        };

        token.map(|token| Some((token, last_accepted)))
    }
}

impl<S: InputStream> Iterator for Lexer<S> {
    type Item = Result<Located<Token>, Located<LexerError>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.lex() {
            Ok(None) => None,
            Ok(Some((token, last_accepted))) => {
                self.state = State::Start;

                let location = Location::span(self.start.clone(), &last_accepted);
                Some(Ok(Located::at(token, location)))
            }

            Err(error) => {
                self.state = State::Error;
                Some(Err(Located::at(error, self.next.clone())))
            }
        }
    }
}

/// Operadores de dos caracteres.
fn compound(first: char, second: char) -> Option<Token> {
    use Token::*;

    let token = match (first, second) {
        ('=', '=') => Equal,
        ('!', '=') => NotEqual,
        ('<', '=') => LessOrEqual,
        ('>', '=') => GreaterOrEqual,
        ('<', '<') => Shl,
        ('>', '>') => Shr,
        ('&', '&') => AndAnd,
        ('|', '|') => OrOr,
        ('+', '=') => AddAssign,
        ('-', '=') => SubAssign,
        ('&', '=') => AndAssign,
        ('|', '=') => OrAssign,
        ('^', '=') => XorAssign,
        ('-', '>') => Arrow,
        _ => return None,
    };

    Some(token)
}

/// Operadores de un solo carácter que pueden iniciar uno de dos.
fn single(c: char) -> Token {
    use Token::*;

    match c {
        '=' => Assign,
        '+' => Plus,
        '-' => Minus,
        '&' => Amp,
        '|' => Pipe,
        '^' => Caret,
        '!' => Bang,
        '<' => Less,
        '>' => Greater,
        _ => unreachable!("not an operator prefix: {:?}", c),
    }
}

/// Secuencias de escape admitidas en literales de carácter.
fn escape(c: char) -> Option<u8> {
    let byte = match c {
        'n' => b'\n',
        'r' => b'\r',
        't' => b'\t',
        '0' => 0,
        '\\' => b'\\',
        '\'' => b'\'',
        _ => return None,
    };

    Some(byte)
}

/// Determina si un carácter puede pertenecer a un término.
fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source;

    fn tokens(text: &str) -> Vec<Token> {
        let (start, stream) = source::consume(text.as_bytes(), "<test>");
        Lexer::new(start, stream)
            .try_exhaustive()
            .expect("lexer failed")
            .into_iter()
            .map(Located::into_inner)
            .collect()
    }

    #[test]
    fn keywords_ignore_case_but_identifiers_do_not() {
        assert_eq!(
            tokens("THREAD Yield UDR0 udr0"),
            vec![
                Token::Keyword(Keyword::Thread),
                Token::Keyword(Keyword::Yield),
                Token::Id(Identifier::new("UDR0")),
                Token::Id(Identifier::new("udr0")),
            ]
        );
    }

    #[test]
    fn operators_and_literals() {
        assert_eq!(
            tokens("a <<= 0x1F; b != '\\n' && c-> /* x */ 10 // y"),
            vec![
                Token::Id(Identifier::new("a")),
                Token::Shl,
                Token::Assign,
                Token::IntLiteral(31),
                Token::Semicolon,
                Token::Id(Identifier::new("b")),
                Token::NotEqual,
                Token::CharLiteral(b'\n'),
                Token::AndAnd,
                Token::Id(Identifier::new("c")),
                Token::Arrow,
                Token::IntLiteral(10),
            ]
        );
    }

    #[test]
    fn slash_divides_unless_it_opens_a_comment() {
        assert_eq!(
            tokens("a / b /* c */ / 2 // d\n/"),
            vec![
                Token::Id(Identifier::new("a")),
                Token::Slash,
                Token::Id(Identifier::new("b")),
                Token::Slash,
                Token::IntLiteral(2),
                Token::Slash,
            ]
        );
    }

    #[test]
    fn token_locations_span_lexemes() {
        let (start, stream) = source::consume("  wait_until x;".as_bytes(), "<test>");
        let tokens = Lexer::new(start, stream).try_exhaustive().unwrap();

        assert_eq!(tokens[0].location().to_string(), "<test>:[1:3-1:12]");
        assert_eq!(tokens[1].location().to_string(), "<test>:1:14");
    }

    #[test]
    fn errors_are_accumulated() {
        let (start, stream) = source::consume("a $ b\n99999999999 @".as_bytes(), "<test>");
        let errors = Lexer::new(start, stream).try_exhaustive().unwrap_err();

        assert_eq!(errors.len(), 2);
        assert!(matches!(errors[0].as_ref(), LexerError::BadChar('$')));
        assert!(matches!(errors[1].as_ref(), LexerError::IntOverflow));
    }
}
