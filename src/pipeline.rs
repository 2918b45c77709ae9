//! Orquestación de fases.
//!
//! Encadena análisis léxico, sintáctico y semántico, la construcción de
//! máquinas de estados, el enlace de llamadas y la asignación de
//! registros. El resultado, [`Compiled`], puede emitir el C final y el
//! artefacto de banderas tantas veces como se requiera con salida
//! idéntica.

use std::io::{self, BufRead, Write};
use tracing::{debug, info};

use crate::{
    arch::Arch,
    codegen::{self, flags, regs::Plan},
    error::{Diagnostics, Warning},
    ir::Program,
    lex::Lexer,
    link, machine, parse,
    semantic::Resolved,
    source::{self, Located},
};

/// Opciones de compilación.
#[derive(Copy, Clone, Debug)]
pub struct Options {
    pub arch: Arch,
}

impl Default for Options {
    fn default() -> Self {
        Options { arch: Arch::Avr }
    }
}

/// Programa completamente compilado.
pub struct Compiled {
    name: String,
    arch: Arch,
    program: Program,
    plan: Plan,
    warnings: Vec<Located<Warning>>,
}

impl Compiled {
    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// Advertencias de todas las fases, en orden de fase.
    pub fn warnings(&self) -> &[Located<Warning>] {
        &self.warnings
    }

    /// Toma ownership de las advertencias para desplegarlas.
    pub fn take_warnings(&mut self) -> Option<Diagnostics> {
        if self.warnings.is_empty() {
            None
        } else {
            Some(Diagnostics::warnings(std::mem::take(&mut self.warnings)))
        }
    }

    /// Emite el archivo de C.
    pub fn emit<W: Write>(&self, output: &mut W) -> io::Result<()> {
        dispatch_arch!(T: self.arch => codegen::emit::<T, W>(&self.program, &self.plan, &self.name, output))
    }

    /// Contenido del artefacto de banderas.
    pub fn flags(&self) -> String {
        flags::derive(&self.program, &self.plan)
    }

    /// Nombre de archivo solicitado con `cflags`, si lo hay.
    pub fn flags_name(&self) -> Option<String> {
        flags::artifact_name(&self.program)
    }

    /// El archivo de C como texto.
    pub fn source_text(&self) -> String {
        let mut buffer = Vec::new();

        // Escribir a memoria no falla y el texto generado es UTF-8
        match self.emit(&mut buffer) {
            Ok(()) => String::from_utf8_lossy(&buffer).into_owned(),
            Err(_) => String::new(),
        }
    }
}

/// Compila una descripción completa.
pub fn compile<R: BufRead>(reader: R, name: &str, options: Options) -> Result<Compiled, Diagnostics> {
    let Resolved {
        model,
        mut warnings,
    } = analyze(reader, name)?;

    let mut program = machine::lower(model).map_err(Diagnostics::from)?;
    warnings.extend(link::link(&mut program).map_err(Diagnostics::from)?);

    let (plan, register_warnings) =
        dispatch_arch!(T: options.arch => codegen::regs::allocate::<T>(&program));

    warnings.extend(register_warnings);

    info!(
        source = name,
        target = options.arch.name(),
        warnings = warnings.len(),
        "compilation finished"
    );

    Ok(Compiled {
        name: name.to_owned(),
        arch: options.arch,
        program,
        plan,
        warnings,
    })
}

/// Compila un texto en memoria.
pub fn compile_str(text: &str, options: Options) -> Result<Compiled, Diagnostics> {
    compile(text.as_bytes(), "<input>", options)
}

/// Fases delanteras: de texto a modelo de declaraciones.
pub fn analyze<R: BufRead>(reader: R, name: &str) -> Result<Resolved, Diagnostics> {
    let (start, stream) = source::consume(reader, name);

    let tokens = Lexer::new(start.clone(), stream)
        .try_exhaustive()
        .map_err(|errors| Diagnostics::from(errors).kind("lexical error"))?;

    debug!(tokens = tokens.len(), "lexical analysis finished");

    let ast = parse::parse(tokens.iter(), start)
        .map_err(|error| Diagnostics::from(error).kind("syntax error"))?;

    ast.resolve()
        .map_err(|error| Diagnostics::from(error).kind("semantic error"))
}

/// Fases delanteras sobre un texto en memoria.
pub fn frontend(text: &str) -> Result<Resolved, Diagnostics> {
    analyze(text.as_bytes(), "<input>")
}

/// Modelo reducido y enlazado, sin asignación de registros.
pub fn lowered(text: &str) -> Result<Program, Diagnostics> {
    let Resolved { model, .. } = frontend(text)?;

    let mut program = machine::lower(model).map_err(Diagnostics::from)?;
    link::link(&mut program).map_err(Diagnostics::from)?;

    Ok(program)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{lex::LexerError, parse::ParserError, semantic::SemanticError};

    #[test]
    fn each_phase_reports_its_own_kind() {
        let lexical = frontend("main { $ }").unwrap_err();
        assert!(lexical.contains::<LexerError>());
        assert!(lexical.to_string().starts_with("lexical error: "));

        let syntax = frontend("main { yield }").unwrap_err();
        assert!(syntax.contains::<ParserError>());
        assert!(syntax.to_string().starts_with("syntax error: "));

        let semantic = frontend("main { call nowhere; }").unwrap_err();
        assert!(semantic.contains::<SemanticError>());
    }

    #[test]
    fn warnings_are_collected_across_phases() {
        let mut compiled = compile_str(
            "static volatile u8 flag;
             use_reg flag;
             thread t { sub unused { } yield; }
             main { }",
            Options::default(),
        )
        .unwrap();

        assert_eq!(compiled.warnings().len(), 2);

        let warnings = compiled.take_warnings().unwrap();
        assert!(warnings.to_string().ends_with("2 warnings emitted\n"));
        assert!(compiled.take_warnings().is_none());
    }

    #[test]
    fn hosted_target_ignores_register_hints() {
        let compiled = compile_str(
            "static u8 hot; use_reg hot r4; main { }",
            Options { arch: Arch::Hosted },
        )
        .unwrap();

        assert!(compiled.warnings().is_empty());
        assert!(compiled.source_text().contains("\nuint8_t hot;\n"));
        assert_eq!(compiled.flags(), "-Os\n");
    }
}
