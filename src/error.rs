//! Diagnósticos.
//!
//! Cada fase reporta errores con su propio tipo (`LexerError`,
//! `ParserError`, `SemanticError`, etc.) envuelto en [`Located`].
//! [`Diagnostics`] los agrupa sin importar su tipo y los despliega
//! citando las líneas de código fuente involucradas. Las advertencias
//! no fatales usan este mismo mecanismo con [`Warning`].

use crate::{
    model::RegisterClass,
    source::{Located, Location},
};

use std::{
    error::Error,
    fmt::{self, Display},
};

mod sealed {
    pub trait Sealed {}
}

pub trait LocatedError: sealed::Sealed {
    fn source(&self) -> &(dyn Error + 'static);
    fn location(&self) -> &Location;
}

/// Advertencia no fatal. La compilación continúa y la salida se emite.
#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum Warning {
    #[error("Register {register} is already claimed by `{owner}`, `{path}` falls back to ordinary storage")]
    ConflictingRegisterHint {
        path: String,
        register: String,
        owner: String,
    },

    #[error("No {class} registers left for `{path}`, it falls back to ordinary storage")]
    RegisterPoolExhausted { path: String, class: RegisterClass },

    #[error("`{0}` is volatile or an array and cannot live in a register")]
    UnbindableStorage(String),

    #[error("Register {register} cannot be bound on this target, `{path}` falls back to ordinary storage")]
    RegisterUnavailable { path: String, register: String },

    #[error("`{0}` requests both `no_inline` and `always_inline`, keeping `no_inline`")]
    ConflictingTuning(String),

    #[error("`pure` has no effect on `{0}`")]
    IgnoredTuning(String),

    #[error("Subroutine `{0}` is never called")]
    UnusedSubroutine(String),
}

pub struct Diagnostics {
    kind: &'static str,
    fatal: bool,
    errors: Vec<Box<dyn 'static + LocatedError>>,
}

impl Diagnostics {
    pub fn kind(self, kind: &'static str) -> Self {
        Diagnostics { kind, ..self }
    }

    /// Agrupa advertencias, las cuales no detienen la compilación.
    pub fn warnings(warnings: Vec<Located<Warning>>) -> Self {
        Diagnostics {
            kind: "warning",
            fatal: false,
            ..Diagnostics::from(warnings)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn LocatedError> {
        self.errors.iter().map(|error| &**error)
    }

    /// Busca el primer diagnóstico de un tipo concreto.
    pub fn find<E: Error + 'static>(&self) -> Option<(&E, &Location)> {
        self.iter().find_map(|error| {
            let location = error.location();
            error.source().downcast_ref::<E>().map(|error| (error, location))
        })
    }

    pub fn contains<E: Error + 'static>(&self) -> bool {
        self.find::<E>().is_some()
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Diagnostics {
            kind: "error",
            fatal: true,
            errors: Default::default(),
        }
    }
}

impl<E: 'static + LocatedError> From<E> for Diagnostics {
    fn from(error: E) -> Self {
        Diagnostics {
            errors: vec![Box::new(error)],
            ..Default::default()
        }
    }
}

impl<E: 'static + LocatedError> From<Vec<E>> for Diagnostics {
    fn from(errors: Vec<E>) -> Self {
        let errors = errors
            .into_iter()
            .map(|error| {
                let errors: Box<dyn LocatedError> = Box::new(error);
                errors
            })
            .collect();

        Diagnostics {
            errors,
            ..Default::default()
        }
    }
}

impl Display for Diagnostics {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Diagnostics {
            kind,
            fatal,
            errors,
        } = self;

        if errors.is_empty() {
            return writeln!(fmt, "No errors were reported");
        }

        for error in errors {
            writeln!(fmt, "{}: {}", kind, error.source())?;

            let location = error.location();
            writeln!(fmt, " --> {}", location)?;

            let digits = location.end().line().to_string().chars().count();
            writeln!(fmt, "{:digits$} |", "", digits = digits)?;

            for line_number in location.start().line()..=location.end().line() {
                location.source().with_line(line_number, |line| {
                    writeln!(fmt, "{:>digits$} | {}", line_number, line, digits = digits)
                })?
            }

            let from = location.start().column();
            let to = location.end().column().saturating_sub(1).max(1);
            let min = from.min(to);
            let max = from.max(to);

            let skip = (min - 1) as usize;
            let highlight = (max - min + 1) as usize;

            writeln!(
                fmt,
                "{:digits$} | {:skip$}{:^<highlight$}",
                "",
                "",
                "",
                digits = digits,
                skip = skip,
                highlight = highlight
            )?;

            writeln!(fmt)?;
        }

        let plural = if errors.len() == 1 { "" } else { "s" };
        if *fatal {
            writeln!(fmt, "Build failed with {} error{}", errors.len(), plural)
        } else {
            writeln!(fmt, "{} {}{} emitted", errors.len(), kind, plural)
        }
    }
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        <Self as Display>::fmt(self, fmt)
    }
}

impl<E: Error + 'static> sealed::Sealed for Located<E> {}

impl<E: Error + 'static> LocatedError for Located<E> {
    fn source(&self) -> &(dyn Error + 'static) {
        self.as_ref()
    }

    fn location(&self) -> &Location {
        Located::location(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source;

    #[test]
    fn excerpt_points_at_the_offending_columns() {
        let (_, chars) = source::consume("thread t {\n  yield\n}".as_bytes(), "demo.coro");
        let locations: Vec<_> = chars.map(|c| c.unwrap().1).collect();

        // `yield` ocupa las columnas 3 a 7 de la línea 2
        let location = Location::span(locations[12].clone(), &locations[16]);

        let diagnostics = Diagnostics::from(Located::at(
            Warning::UnusedSubroutine(String::from("t.s")),
            location,
        ));

        let rendered = diagnostics.to_string();
        assert!(rendered.contains("error: Subroutine `t.s` is never called"));
        assert!(rendered.contains(" --> demo.coro:[2:3-2:7]"));
        assert!(rendered.contains("2 |   yield"));
        assert!(rendered.contains("  |   ^^^^^"));
        assert!(rendered.ends_with("Build failed with 1 error\n"));
    }

    #[test]
    fn typed_lookup() {
        let (start, _) = source::consume("".as_bytes(), "<test>");
        let warnings = Diagnostics::warnings(vec![Located::at(
            Warning::IgnoredTuning(String::from("t")),
            start,
        )]);

        assert!(warnings.contains::<Warning>());
        assert!(!warnings.contains::<std::io::Error>());
        assert!(matches!(warnings.find::<Warning>(), Some((Warning::IgnoredTuning(_), _))));
        assert!(warnings.to_string().ends_with("1 warning emitted\n"));
    }
}
