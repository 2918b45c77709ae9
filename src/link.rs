//! Enlace de llamadas entre corrutinas.
//!
//! Una llamada a subrutina no usa la pila nativa: el llamador guarda su
//! punto de reanudación en su propio estado y en cada reingreso vuelve
//! a impulsar a la subrutina hasta que esta llegue a `END`. Aquí se
//! construye un [`CallFrame`] por cada sitio de llamada y se verifica
//! que ninguna subrutina pueda ser reingresada mientras aún corre.
//!
//! Cada subrutina tiene un único estado y un único juego de parámetros.
//! Como las subrutinas solo son visibles dentro de su hilo, y un hilo
//! ejecuta una sola llamada a la vez, la única forma de traslapar dos
//! invocaciones de la misma instancia es la recursión, directa o
//! indirecta. Un ciclo en el grafo de llamadas es por tanto un error.

use thiserror::Error;
use tracing::debug;

use crate::{
    error::Warning,
    ir::{CallFrame, PointKind, Program},
    model::UnitId,
    source::Located,
};

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Subroutine `{callee}` could be called again before it finishes (call chain: {chain})")]
    OverlappingCall { callee: String, chain: String },
}

pub type Link<T> = Result<T, Located<LinkError>>;

#[derive(Copy, Clone, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Active,
    Done,
}

/// Construye los enlaces de llamada de un programa.
///
/// Retorna advertencias por subrutinas que nunca son llamadas.
pub fn link(program: &mut Program) -> Link<Vec<Located<Warning>>> {
    let mut marks = vec![Mark::Unvisited; program.units.len()];
    let mut stack = Vec::new();

    for unit in 0..program.units.len() {
        if marks[unit] == Mark::Unvisited {
            visit(program, UnitId(unit), &mut marks, &mut stack)?;
        }
    }

    program.frames = program
        .units
        .iter()
        .enumerate()
        .flat_map(|(caller, unit)| {
            unit.points.iter().filter_map(move |point| match point.kind {
                PointKind::Call(callee) => Some(CallFrame {
                    caller: UnitId(caller),
                    resume: point.id,
                    callee,
                }),

                _ => None,
            })
        })
        .collect();

    let warnings = program
        .model
        .units
        .iter()
        .enumerate()
        .filter(|(id, unit)| {
            !unit.is_thread()
                && !program
                    .frames
                    .iter()
                    .any(|frame| frame.callee == UnitId(*id))
        })
        .map(|(_, unit)| {
            Located::at(
                Warning::UnusedSubroutine(unit.path.clone()),
                unit.location.clone(),
            )
        })
        .collect();

    debug!(frames = program.frames.len(), "call linkage built");
    Ok(warnings)
}

fn visit(program: &Program, unit: UnitId, marks: &mut [Mark], stack: &mut Vec<UnitId>) -> Link<()> {
    marks[unit.0] = Mark::Active;
    stack.push(unit);

    for point in &program.unit(unit).points {
        let callee = match point.kind {
            PointKind::Call(callee) => callee,
            _ => continue,
        };

        match marks[callee.0] {
            Mark::Unvisited => visit(program, callee, marks, stack)?,
            Mark::Done => (),

            Mark::Active => {
                let start = stack.iter().position(|&id| id == callee).unwrap_or(0);
                let chain = stack[start..]
                    .iter()
                    .chain(std::iter::once(&callee))
                    .map(|&id| program.model.unit(id).path.as_str())
                    .collect::<Vec<_>>()
                    .join(" -> ");

                let error = LinkError::OverlappingCall {
                    callee: program.model.unit(callee).path.clone(),
                    chain,
                };

                return Err(Located::at(error, point.location.clone()));
            }
        }
    }

    stack.pop();
    marks[unit.0] = Mark::Done;

    Ok(())
}
