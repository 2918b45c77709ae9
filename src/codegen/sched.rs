//! Ciclo del planificador.
//!
//! `main()` inicializa el almacenamiento enlazado a registros (que C no
//! inicializa por sí solo), ejecuta los hooks de inicialización y el
//! cuerpo de `main`, y luego entra en un ciclo sin fin. Cada pasada
//! ejecuta los hooks `runnable`, un paso de cada hilo en orden de
//! declaración y finalmente el despacho periódico.
//!
//! El despacho periódico depende de una base de tiempo externa: una
//! ISR de temporizador incrementa `timebase_ticks` cada decisegundo.
//! Cada pasada consume a lo sumo un tick, de forma que ningún tick se
//! pierde aunque una pasada tarde más de un decisegundo. Los contadores
//! en cascada derivan segundos, minutos y horas.

use std::io::{self, Write};

use super::{hook_symbol, regs::Storage, state_symbol, step_symbol, Context, ENTRY_SYMBOL};
use crate::{
    arch::Target,
    ir::Program,
    model::{Interval, Type},
    parse::HookKind,
};

/// Contador de ticks externo, mantenido por la ISR de la base de tiempo.
pub const TIMEBASE: &str = "timebase_ticks";

/// Ticks ya consumidos por el planificador.
pub const TICKS_SEEN: &str = "hilos_ticks_seen";

/// Contador en cascada de un intervalo.
pub fn counter_symbol(interval: Interval) -> String {
    format!("hilos_count__{}", interval.name())
}

/// Intervalo periódico más largo que se usa, si hay alguno.
fn deepest(program: &Program) -> Option<Interval> {
    program
        .model
        .hooks
        .iter()
        .filter_map(|hook| match hook.kind {
            HookKind::Every(interval) => Some(interval),
            _ => None,
        })
        .max()
}

/// Niveles en cascada necesarios, excluyendo al decisegundo.
fn cascade(program: &Program) -> Vec<Interval> {
    let deepest = match deepest(program) {
        Some(deepest) => deepest,
        None => return Vec::new(),
    };

    Interval::ALL
        .iter()
        .copied()
        .filter(|&interval| interval != Interval::Decisecond && interval <= deepest)
        .collect()
}

pub(super) fn storage<T: Target, W: Write>(cx: &mut Context<T, W>) -> io::Result<()> {
    if deepest(cx.program).is_none() {
        return Ok(());
    }

    let u8_type = T::c_type(Type::U8);

    writeln!(cx.output, "extern volatile {} {};", u8_type, TIMEBASE)?;
    writeln!(cx.output, "static {} {};", u8_type, TICKS_SEEN)?;

    for interval in cascade(cx.program) {
        writeln!(cx.output, "static {} {};", u8_type, counter_symbol(interval))?;
    }

    Ok(())
}

pub(super) fn main<T: Target, W: Write>(cx: &mut Context<T, W>) -> io::Result<()> {
    let (program, plan) = (cx.program, cx.plan);
    let model = &program.model;

    writeln!(cx.output, "int main(void)\n{{")?;

    for (storage, _) in plan.bindings() {
        let (symbol, initial) = match storage {
            Storage::Static(id) => {
                let var = model.static_var(id);
                (var.symbol.clone(), var.initial.unwrap_or(0))
            }

            Storage::State(unit) => (state_symbol(program, unit), 0),
        };

        emit!(cx.output, "{} = {};", symbol, initial)?;
    }

    for hook in hooks(program, |kind| kind == HookKind::Init) {
        emit!(cx.output, "{}();", hook_symbol(program, hook))?;
    }

    emit!(cx.output, "{}();", ENTRY_SYMBOL)?;
    emit!(cx.output)?;

    emit!(cx.output, "for (;;) {{")?;

    for hook in hooks(program, |kind| kind == HookKind::Runnable) {
        emit!(cx.output, "\t{}();", hook_symbol(program, hook))?;
    }

    for thread in model.threads() {
        emit!(cx.output, "\t{}();", step_symbol(program, thread))?;
    }

    if deepest(program).is_some() {
        emit!(cx.output, "\tif ({} != {}) {{", TICKS_SEEN, TIMEBASE)?;
        emit!(cx.output, "\t\t++{};", TICKS_SEEN)?;
        periodic(cx, Interval::Decisecond, &cascade(program), 2)?;
        emit!(cx.output, "\t}}")?;
    }

    emit!(cx.output, "}}")?;
    writeln!(cx.output, "}}")
}

/// Hooks de un nivel y, recursivamente, los niveles siguientes.
fn periodic<T: Target, W: Write>(
    cx: &mut Context<T, W>,
    interval: Interval,
    rest: &[Interval],
    depth: usize,
) -> io::Result<()> {
    let program = cx.program;
    let indent = "\t".repeat(depth);

    for hook in hooks(program, move |kind| kind == HookKind::Every(interval)) {
        emit!(cx.output, "{}{}();", indent, hook_symbol(program, hook))?;
    }

    if let Some((&next, rest)) = rest.split_first() {
        let counter = counter_symbol(next);

        emit!(cx.output, "{}if (++{} == {}) {{", indent, counter, next.ratio())?;
        emit!(cx.output, "{}\t{} = 0;", indent, counter)?;
        periodic(cx, next, rest, depth + 1)?;
        emit!(cx.output, "{}}}", indent)?;
    }

    Ok(())
}

fn hooks<F>(program: &Program, filter: F) -> Vec<usize>
where
    F: Fn(HookKind) -> bool + 'static,
{
    program.model.hooks_where(filter).map(|id| id.0).collect()
}
