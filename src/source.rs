//! Rastreo de ubicaciones originales en código fuente.
//!
//! Todo lo que el compilador construye a partir de una descripción
//! de firmware (tokens, declaraciones, hilos, sugerencias) lleva
//! consigo la ubicación del texto que lo originó. Los diagnósticos
//! de [`crate::error`] se apoyan en esto para citar la línea exacta
//! donde ocurre un error o una advertencia.

use std::{
    cell::RefCell,
    fmt::{self, Debug, Display, Formatter},
    io::{self, BufRead, Lines},
    rc::Rc,
    vec,
};

/// Ancho de los divisores de tabulador.
const TAB_STOP: u32 = 4;

/// Un flujo de entrada, carácter por carácter.
///
/// Cada carácter viene acompañado de la ubicación del carácter que le
/// sigue, de forma que el lexer siempre conoce dónde termina un token.
pub trait InputStream: Iterator<Item = Result<(char, Location), io::Error>> {}

impl<I> InputStream for I where I: Iterator<Item = Result<(char, Location), io::Error>> {}

/// Un valor cualquiera con una posición original asociada.
#[derive(Debug, Clone)]
pub struct Located<T> {
    location: Location,
    value: T,
}

impl<T> Located<T> {
    pub fn at(value: T, location: Location) -> Self {
        Located { location, value }
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    /// Descarta la ubicación.
    pub fn into_inner(self) -> T {
        self.value
    }

    pub fn split(self) -> (Location, T) {
        (self.location, self.value)
    }

    /// Transforma el valor, conservando la ubicación.
    pub fn map<U, F>(self, map: F) -> Located<U>
    where
        F: FnOnce(T) -> U,
    {
        Located::at(map(self.value), self.location)
    }
}

impl<T> AsRef<T> for Located<T> {
    fn as_ref(&self) -> &T {
        &self.value
    }
}

/// Rango de posiciones dentro de un origen. El fin es exclusivo.
#[derive(Clone)]
pub struct Location {
    source: Rc<Source>,
    start: Position,
    end: Position,
}

impl Location {
    /// Rango desde el inicio de `from` hasta el fin de `to`, ambos del
    /// mismo origen.
    pub fn span(from: Location, to: &Location) -> Self {
        Location {
            end: to.end,
            ..from
        }
    }

    pub fn start(&self) -> Position {
        self.start
    }

    pub fn end(&self) -> Position {
        self.end
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    /// Ubicación de una sola columna.
    fn point(source: &Rc<Source>, at: Position) -> Self {
        Location {
            source: Rc::clone(source),
            start: at,
            end: at.next_column(),
        }
    }
}

impl Display for Location {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        let Location { source, start, end } = self;
        let last = end.previous_column();

        if *end == *start || last == *start {
            write!(formatter, "{}:{}", source.name, start)
        } else {
            write!(formatter, "{}:[{}-{}]", source.name, start, last)
        }
    }
}

impl Debug for Location {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        <Self as Display>::fmt(self, formatter)
    }
}

/// Línea y columna, ambas a partir de 1.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Position {
    line: u32,
    column: u32,
}

impl Position {
    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn column(&self) -> u32 {
        self.column
    }

    fn next_column(self) -> Position {
        Position {
            column: self.column + 1,
            ..self
        }
    }

    fn previous_column(self) -> Position {
        Position {
            column: self.column.saturating_sub(1).max(1),
            ..self
        }
    }

    fn next_line(self) -> Position {
        Position {
            line: self.line + 1,
            column: 1,
        }
    }

    fn next_tab_stop(self) -> Position {
        Position {
            column: 1 + ((self.column - 1) / TAB_STOP + 1) * TAB_STOP,
            ..self
        }
    }

    /// Posición que sigue a `c`.
    fn after(self, c: char) -> Position {
        match c {
            '\n' => self.next_line(),
            '\t' => self.next_tab_stop(),
            _ => self.next_column(),
        }
    }
}

impl Default for Position {
    fn default() -> Self {
        Position { line: 1, column: 1 }
    }
}

impl Display for Position {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}:{}", self.line, self.column)
    }
}

/// Nombre de un archivo de entrada y las líneas leídas hasta ahora.
///
/// Las líneas se acumulan conforme el lexer consume la entrada, por lo
/// cual para cuando se reportan diagnósticos ya están todas disponibles.
pub struct Source {
    name: String,
    lines: RefCell<Vec<String>>,
}

impl Source {
    /// Nombre del origen, usualmente una ruta.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoca a `callback` con el contenido de una línea, si existe.
    pub fn with_line<F>(&self, line_number: u32, callback: F) -> fmt::Result
    where
        F: FnOnce(&str) -> fmt::Result,
    {
        let lines = self.lines.borrow();
        match line_number.checked_sub(1).and_then(|index| lines.get(index as usize)) {
            Some(line) => callback(line),
            None => Ok(()),
        }
    }
}

/// Caracteres de un lector, con la ubicación del siguiente carácter.
///
/// Cada línea se entrega seguida de `'\n'`, incluso la última. Un error
/// de lectura se emite una vez y termina el flujo.
pub struct Chars<R> {
    source: Rc<Source>,
    lines: Lines<R>,
    pending: vec::IntoIter<char>,
    next: Position,
    failed: bool,
}

impl<R: BufRead> Iterator for Chars<R> {
    type Item = Result<(char, Location), io::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(c) = self.pending.next() {
                self.next = self.next.after(c);
                return Some(Ok((c, Location::point(&self.source, self.next))));
            }

            if self.failed {
                return None;
            }

            match self.lines.next()? {
                Ok(line) => {
                    let mut chars: Vec<char> = line.chars().collect();
                    chars.push('\n');

                    self.source.lines.borrow_mut().push(line);
                    self.pending = chars.into_iter();
                }

                Err(error) => {
                    self.failed = true;
                    return Some(Err(error));
                }
            }
        }
    }
}

/// Comienza a leer un archivo de entrada.
///
/// La ubicación retornada es la que le corresponde al primer carácter.
pub fn consume<R, S>(reader: R, name: S) -> (Location, Chars<R>)
where
    R: BufRead,
    S: Into<String>,
{
    let source = Rc::new(Source {
        name: name.into(),
        lines: Default::default(),
    });

    let start = Location::point(&source, Position::default());
    let chars = Chars {
        source,
        lines: reader.lines(),
        pending: Vec::new().into_iter(),
        next: Position::default(),
        failed: false,
    };

    (start, chars)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locations_follow_lines_and_tabs() {
        let (start, chars) = consume("ab\n\tc".as_bytes(), "<test>");
        assert_eq!(start.to_string(), "<test>:1:1");

        let rendered: Vec<_> = chars
            .map(Result::unwrap)
            .map(|(c, next)| (c, next.start().line(), next.start().column()))
            .collect();

        assert_eq!(
            rendered,
            vec![
                ('a', 1, 2),
                ('b', 1, 3),
                ('\n', 2, 1),
                ('\t', 2, 5),
                ('c', 2, 6),
                ('\n', 3, 1)
            ]
        );
    }

    #[test]
    fn lines_are_kept_for_diagnostics() {
        let (start, chars) = consume("thread t {\r\n}".as_bytes(), "<test>");
        chars.for_each(drop);

        let mut seen = String::new();
        start
            .source()
            .with_line(1, |line| {
                seen.push_str(line);
                Ok(())
            })
            .unwrap();

        assert_eq!(seen, "thread t {");
        assert!(start.source().with_line(0, |_| Err(fmt::Error)).is_ok());
    }

    #[test]
    fn spans_render_their_last_column() {
        let (start, chars) = consume("yield;".as_bytes(), "t.coro");
        let locations: Vec<_> = chars.map(|c| c.unwrap().1).collect();

        // Cada carácter trae la ubicación del siguiente
        assert_eq!(Location::span(start.clone(), &start).to_string(), "t.coro:1:1");
        assert_eq!(Location::span(start, &locations[3]).to_string(), "t.coro:[1:1-1:5]");
    }
}
