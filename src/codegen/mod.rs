//! Generación de C.
//!
//! La salida es un único archivo de C99 compilable por el toolchain
//! nativo del objetivo. Cada unidad de corrutina se convierte en una
//! función de paso (`hilos_step__*`) que despacha sobre su variable de
//! estado hacia la etiqueta de reanudación correspondiente, cada hook
//! en una función ordinaria y `main` en el ciclo del planificador que
//! genera [`sched`].
//!
//! El orden de emisión depende únicamente del orden de declaración en
//! el modelo, por lo cual un mismo programa siempre produce los mismos
//! bytes.

use std::{
    io::{self, Write},
    marker::PhantomData,
};

use tracing::debug;

use crate::{
    arch::Target,
    ir::{Instruction, Label, Point, Program},
    model::{Callee, Expr, Local, Owner, Place, StaticId, Tuning, UnitId, Var},
    parse::{HookKind, Likelihood},
};

use regs::{Plan, Storage};

pub mod flags;
pub mod regs;

mod sched;

/// Macros comunes a todo archivo generado.
const PRELUDE: &str = "\
#define HILOS_LIKELY(x) __builtin_expect(!!(x), 1)
#define HILOS_UNLIKELY(x) __builtin_expect(!!(x), 0)
#define HILOS_FORCE_INLINE __attribute__((always_inline)) inline
#define HILOS_NO_INLINE __attribute__((noinline))
#define HILOS_PURE __attribute__((pure))
";

/// Emite el archivo de C completo de un programa.
pub fn emit<T: Target, W: Write>(
    program: &Program,
    plan: &Plan,
    name: &str,
    output: &mut W,
) -> io::Result<()> {
    let mut cx = Context::<T, W> {
        program,
        plan,
        output,
        target: PhantomData,
    };

    writeln!(cx.output, "/* Generated by hilos from {}. Do not edit. */\n", name)?;

    writeln!(cx.output, "#include <stdint.h>")?;
    for include in &program.model.includes {
        writeln!(cx.output, "#include <{}>", include)?;
    }

    writeln!(cx.output, "\n{}", PRELUDE)?;

    cx.storage()?;
    cx.prototypes()?;

    for id in 0..program.model.functions.len() {
        cx.function(id)?;
    }

    for id in 0..program.model.hooks.len() {
        cx.hook(id)?;
    }

    for id in 0..program.units.len() {
        cx.step(UnitId(id))?;
    }

    cx.entry()?;
    sched::main(&mut cx)?;

    debug!(
        target = T::NAME,
        steps = program.units.len(),
        hooks = program.model.hooks.len(),
        "C source emitted"
    );

    Ok(())
}

/// Símbolo de la variable de estado de una unidad.
pub fn state_symbol(program: &Program, unit: UnitId) -> String {
    format!("hilos_state__{}", program.model.unit(unit).symbol)
}

/// Símbolo de la función de paso de una unidad.
pub fn step_symbol(program: &Program, unit: UnitId) -> String {
    format!("hilos_step__{}", program.model.unit(unit).symbol)
}

pub fn hook_symbol(program: &Program, hook: usize) -> String {
    format!("hilos_hook__{}", program.model.hooks[hook].name)
}

const ENTRY_SYMBOL: &str = "hilos_entry";

struct Context<'a, T: Target, W: Write> {
    program: &'a Program,
    plan: &'a Plan,
    output: &'a mut W,
    target: PhantomData<T>,
}

/// Cuerpo en emisión.
#[derive(Copy, Clone)]
struct Frame<'a> {
    /// Unidad de corrutina, si el cuerpo es una función de paso.
    unit: Option<UnitId>,
    locals: &'a [Local],
}

impl<'a, T: Target, W: Write> Context<'a, T, W> {
    fn storage(&mut self) -> io::Result<()> {
        let program = self.program;

        for id in 0..program.model.statics.len() {
            self.static_var(StaticId(id))?;
        }

        for (id, unit) in program.units.iter().enumerate() {
            let id = UnitId(id);
            let typ = T::c_type(unit.width.typ());
            let symbol = state_symbol(program, id);

            match self.plan.binding(Storage::State(id)) {
                Some(binding) => writeln!(
                    self.output,
                    "register {} {} asm(\"{}\");",
                    typ, symbol, binding.register
                )?,

                None => writeln!(self.output, "static {} {};", typ, symbol)?,
            }
        }

        sched::storage(self)?;
        writeln!(self.output)
    }

    fn static_var(&mut self, id: StaticId) -> io::Result<()> {
        let var = self.program.model.static_var(id);
        let typ = T::c_type(var.typ);

        if let Some(binding) = self.plan.binding(Storage::Static(id)) {
            return writeln!(
                self.output,
                "register {} {} asm(\"{}\");",
                typ, var.symbol, binding.register
            );
        }

        // Las globales quedan visibles para código externo, como ISRs
        let linkage = if var.owner == Owner::Global { "" } else { "static " };
        let volatile = if var.volatile { "volatile " } else { "" };
        let length = var.length.map(|length| format!("[{}]", length)).unwrap_or_default();
        let initial = var.initial.map(|value| format!(" = {}", value)).unwrap_or_default();

        writeln!(
            self.output,
            "{}{}{} {}{}{};",
            linkage, volatile, typ, var.symbol, length, initial
        )
    }

    fn prototypes(&mut self) -> io::Result<()> {
        let program = self.program;

        for id in 0..program.model.functions.len() {
            let signature = self.function_signature(id);
            writeln!(self.output, "{};", signature)?;
        }

        for id in 0..program.model.hooks.len() {
            let signature = self.hook_signature(id);
            writeln!(self.output, "{};", signature)?;
        }

        for id in 0..program.units.len() {
            let signature = self.step_signature(UnitId(id));
            writeln!(self.output, "{};", signature)?;
        }

        writeln!(self.output, "static void {}(void);\n", ENTRY_SYMBOL)
    }

    fn function_signature(&self, id: usize) -> String {
        let function = &self.program.model.functions[id];

        let returns = function.returns.map(T::c_type).unwrap_or("void");
        let parameters = if function.parameters.is_empty() {
            String::from("void")
        } else {
            function
                .parameters
                .iter()
                .map(|&local| {
                    let local = &function.locals[local.0];
                    format!("{} {}", T::c_type(local.typ), local.name)
                })
                .collect::<Vec<_>>()
                .join(", ")
        };

        format!(
            "static {}{} {}({})",
            attributes(function.tuning, false),
            returns,
            function.name,
            parameters
        )
    }

    fn hook_signature(&self, id: usize) -> String {
        let hook = &self.program.model.hooks[id];
        let inline = hook.kind == HookKind::Runnable;

        format!(
            "static {}void {}(void)",
            attributes(hook.tuning, inline),
            hook_symbol(self.program, id)
        )
    }

    fn step_signature(&self, id: UnitId) -> String {
        let unit = self.program.model.unit(id);

        format!(
            "static {}void {}(void)",
            attributes(unit.tuning, unit.is_thread()),
            step_symbol(self.program, id)
        )
    }

    fn function(&mut self, id: usize) -> io::Result<()> {
        let program = self.program;
        let function = &program.model.functions[id];

        let signature = self.function_signature(id);
        writeln!(self.output, "{}\n{{", signature)?;

        let frame = Frame {
            unit: None,
            locals: &function.locals,
        };

        self.locals(frame, function.parameters.len())?;
        self.code(frame, &program.functions[id].code)?;
        writeln!(self.output, "}}\n")
    }

    fn hook(&mut self, id: usize) -> io::Result<()> {
        let program = self.program;
        let hook = &program.model.hooks[id];

        let signature = self.hook_signature(id);
        writeln!(self.output, "{}\n{{", signature)?;

        let frame = Frame {
            unit: None,
            locals: &hook.locals,
        };

        self.locals(frame, 0)?;
        self.code(frame, &program.hooks[id].code)?;
        writeln!(self.output, "}}\n")
    }

    fn entry(&mut self) -> io::Result<()> {
        let program = self.program;

        writeln!(self.output, "static void {}(void)\n{{", ENTRY_SYMBOL)?;

        let frame = Frame {
            unit: None,
            locals: &program.model.entry.locals,
        };

        self.locals(frame, 0)?;
        self.code(frame, &program.entry.code)?;
        writeln!(self.output, "}}\n")
    }

    /// Función de paso de una unidad de corrutina.
    fn step(&mut self, id: UnitId) -> io::Result<()> {
        let program = self.program;
        let unit = program.unit(id);

        let signature = self.step_signature(id);
        writeln!(self.output, "{}\n{{", signature)?;

        if !unit.points.is_empty() {
            emit!(self.output, "switch ({}) {{", state_symbol(program, id))?;
            for point in &unit.points {
                emit!(self.output, "case {}: goto {};", point.id.state(), resume(point.id))?;
            }

            emit!(self.output, "default: break;")?;
            emit!(self.output, "}}")?;
            emit!(self.output)?;
        }

        // Las locales de corrutinas ya fueron elevadas a estáticas
        let frame = Frame {
            unit: Some(id),
            locals: &[],
        };

        self.code(frame, &unit.code)?;
        writeln!(self.output, "}}\n")
    }

    fn locals(&mut self, frame: Frame, skip: usize) -> io::Result<()> {
        for local in frame.locals.iter().skip(skip) {
            let length = local.length.map(|length| format!("[{}]", length)).unwrap_or_default();
            emit!(self.output, "{} {}{};", T::c_type(local.typ), local.name, length)?;
        }

        Ok(())
    }

    fn code(&mut self, frame: Frame, code: &[Instruction]) -> io::Result<()> {
        for instruction in code {
            let lines = self.lines(frame, instruction);
            for line in lines {
                emit!(self.output, "{}", line)?;
            }
        }

        Ok(())
    }

    /// Líneas de C de una instrucción.
    fn lines(&self, frame: Frame, instruction: &Instruction) -> Vec<String> {
        use Instruction::*;

        let program = self.program;
        let line = match instruction {
            SetLabel(label) => format!("{}:;", label_symbol(*label)),
            Jump(label) => format!("goto {};", label_symbol(*label)),

            JumpIfFalse(condition, label) => format!(
                "if (!{}) goto {};",
                self.expr(frame, condition),
                label_symbol(*label)
            ),

            Assign { place, op, value } => format!(
                "{} {}= {};",
                self.place(frame, place),
                op.map(|op| op.symbol()).unwrap_or(""),
                self.expr(frame, value)
            ),

            Eval(expr) => format!("{};", self.expr(frame, expr)),
            Suspend => String::from("return;"),
            Resume(point) => format!("{}:;", resume(*point)),

            ReturnUnless { condition, hint } => {
                let negated = format!("!{}", self.expr(frame, condition));
                let negated = match hint {
                    None => negated,
                    Some(Likelihood::Likely) => format!("HILOS_UNLIKELY({})", negated),
                    Some(Likelihood::Unlikely) => format!("HILOS_LIKELY({})", negated),
                };

                format!("if ({}) return;", negated)
            }

            Drive(callee) => {
                let state = state_symbol(program, *callee);
                let end = program.unit(*callee).width.end();

                return vec![
                    format!("{}();", step_symbol(program, *callee)),
                    format!("if ({} != {}) return;", state, end),
                    format!("{} = 0;", state),
                ];
            }

            Return(None) => String::from("return;"),
            Return(Some(value)) => format!("return {};", self.expr(frame, value)),

            // Solo las funciones de paso contienen instrucciones de estado
            SetState(point) => match frame.unit {
                Some(unit) => format!("{} = {};", state_symbol(program, unit), point.state()),
                None => return Vec::new(),
            },

            Finish => {
                let unit = match frame.unit {
                    Some(unit) => unit,
                    None => return vec![String::from("return;")],
                };

                let done = if program.model.unit(unit).is_thread() {
                    0
                } else {
                    program.unit(unit).width.end()
                };

                return vec![
                    format!("{} = {};", state_symbol(program, unit), done),
                    String::from("return;"),
                ];
            }
        };

        vec![line]
    }

    fn place(&self, frame: Frame, place: &Place) -> String {
        let model = &self.program.model;

        let name = match place.var {
            Var::Static(id) => model.static_var(id).symbol.clone(),
            Var::Local(id) => frame.locals[id.0].name.to_string(),
            Var::Extern(id) => model.external(id).name.to_string(),
        };

        match &place.index {
            None => name,
            Some(index) => format!("{}[{}]", name, self.expr(frame, index)),
        }
    }

    /// Expresión de C, completamente parentizada.
    fn expr(&self, frame: Frame, expr: &Expr) -> String {
        match expr {
            Expr::Const(value) => value.to_string(),
            Expr::Read(place) => self.place(frame, place),

            Expr::Call(callee, args) => {
                let model = &self.program.model;
                let name = match callee {
                    Callee::Function(id) => model.function(*id).name.to_string(),
                    Callee::Extern(id) => model.external(*id).name.to_string(),
                };

                let args: Vec<_> = args.iter().map(|arg| self.expr(frame, arg)).collect();
                format!("{}({})", name, args.join(", "))
            }

            Expr::Unary(op, operand) => format!("({}{})", op.symbol(), self.expr(frame, operand)),

            Expr::Binary(lhs, op, rhs) => format!(
                "({} {} {})",
                self.expr(frame, lhs),
                op.symbol(),
                self.expr(frame, rhs)
            ),
        }
    }
}

/// Atributos de C para una directiva de afinamiento.
///
/// `inline` indica si por omisión se fuerza la expansión en línea.
fn attributes(tuning: Tuning, inline: bool) -> String {
    let mut attributes = String::new();

    if tuning.contains(Tuning::PURE) {
        attributes.push_str("HILOS_PURE ");
    }

    if tuning.contains(Tuning::NO_INLINE) {
        attributes.push_str("HILOS_NO_INLINE ");
    } else if inline || tuning.contains(Tuning::ALWAYS_INLINE) {
        attributes.push_str("HILOS_FORCE_INLINE ");
    }

    attributes
}

fn label_symbol(Label(label): Label) -> String {
    format!("l{}", label)
}

fn resume(Point(point): Point) -> String {
    format!("resume_{}", point)
}
