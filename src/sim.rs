//! Ejecutor de referencia.
//!
//! Interpreta la representación intermedia con la misma semántica que
//! el C generado: mismo despacho por estado, mismo orden de pasada del
//! planificador y mismo truncamiento al almacenar. Permite verificar el
//! comportamiento de las máquinas de estados sin un microcontrolador.
//!
//! Los símbolos externos (registros de periféricos, funciones de
//! drivers) se delegan a un [`Host`]. [`Bench`] es un host que
//! simplemente recuerda lo que se le escribe.
//!
//! Las operaciones se calculan en 64 bits y se truncan al almacenar.
//! Esto no modela la promoción a `int` de 16 bits de avr-gcc.

use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    ir::{Instruction, Label, Point, PointKind, Program, START},
    model::{self, Callee, Expr, ExternKind, FunctionId, HookId, Interval, Local, Place, UnitId, Var},
    parse::{BinOp, HookKind},
};

/// Profundidad máxima de llamadas anidadas.
pub const MAX_DEPTH: usize = 64;

/// Falla del ejecutor mismo. No corresponde a nada en el dispositivo.
#[non_exhaustive]
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SimError {
    #[error("Division by zero")]
    DivisionByZero,

    #[error("Index {index} is out of bounds for `{name}`")]
    IndexOutOfBounds { name: String, index: i64 },

    #[error("Call depth exceeded the limit of {MAX_DEPTH}")]
    CallDepthExceeded,
}

pub type Sim<T> = Result<T, SimError>;

/// Entorno externo del programa.
pub trait Host {
    /// Lee una variable externa.
    fn read(&mut self, name: &str) -> i64;

    /// Escribe una variable externa, el valor ya viene truncado.
    fn write(&mut self, name: &str, value: i64);

    /// Invoca una función externa.
    fn call(&mut self, name: &str, args: &[i64]) -> i64;
}

/// Host que registra escrituras y llamadas.
///
/// Las lecturas retornan el último valor escrito o asignado con
/// [`Bench::set()`], cero si no hay ninguno. Las funciones externas
/// siempre retornan cero.
#[derive(Debug, Default)]
pub struct Bench {
    values: HashMap<String, i64>,
    writes: Vec<(String, i64)>,
    calls: Vec<(String, Vec<i64>)>,
}

impl Bench {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: i64) {
        self.values.insert(name.to_owned(), value);
    }

    pub fn get(&self, name: &str) -> i64 {
        self.values.get(name).copied().unwrap_or(0)
    }

    pub fn writes(&self) -> &[(String, i64)] {
        &self.writes
    }

    /// Valores escritos a una variable, en orden.
    pub fn writes_to(&self, name: &str) -> Vec<i64> {
        self.writes
            .iter()
            .filter(|(target, _)| target == name)
            .map(|(_, value)| *value)
            .collect()
    }

    pub fn calls(&self) -> &[(String, Vec<i64>)] {
        &self.calls
    }
}

impl Host for Bench {
    fn read(&mut self, name: &str) -> i64 {
        self.get(name)
    }

    fn write(&mut self, name: &str, value: i64) {
        self.values.insert(name.to_owned(), value);
        self.writes.push((name.to_owned(), value));
    }

    fn call(&mut self, name: &str, args: &[i64]) -> i64 {
        self.calls.push((name.to_owned(), args.to_vec()));
        0
    }
}

/// Estado observable de una unidad de corrutina.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CoroutineState {
    /// En `START`, nunca ha corrido o un hilo que volvió a empezar.
    Idle,

    /// Suspendida en un `yield` o `wait_until`.
    Running(Point),

    /// Suspendida en un `call`, esperando a que la subrutina termine.
    AwaitingCallee { point: Point, callee: UnitId },

    /// Una subrutina en `END` que aún no ha sido rearmada.
    Done,
}

/// Máquina que ejecuta un programa completo.
pub struct Machine<'p, H: Host> {
    program: &'p Program,
    host: H,

    /// Contenido de cada estática, paralelo a `model.statics`.
    statics: Vec<Vec<i64>>,

    /// Estado de cada unidad, paralelo a `program.units`.
    states: Vec<u16>,

    timebase: u8,
    ticks_seen: u8,

    /// Contadores en cascada de segundo, minuto y hora.
    counters: [u8; 3],

    passes: u64,
    depth: usize,
}

/// Variables locales de un cuerpo en ejecución.
struct Frame<'p> {
    locals: &'p [Local],
    values: Vec<Vec<i64>>,
}

impl<'p> Frame<'p> {
    fn new(locals: &'p [Local]) -> Self {
        let values = locals
            .iter()
            .map(|local| vec![0; local.length.unwrap_or(1) as usize])
            .collect();

        Frame { locals, values }
    }
}

/// Ubicación ya resuelta de un lugar asignable.
#[derive(Copy, Clone)]
enum Slot {
    Static(usize, usize),
    Local(usize, usize),
    Extern(usize),
}

#[derive(Copy, Clone)]
enum Body {
    Function(FunctionId),
    Hook(HookId),
    Entry,
}

impl<'p, H: Host> Machine<'p, H> {
    /// Crea una máquina con las estáticas en sus valores iniciales y
    /// toda unidad en `START`.
    pub fn new(program: &'p Program, host: H) -> Self {
        let statics = program
            .model
            .statics
            .iter()
            .map(|var| {
                let length = var.length.unwrap_or(1) as usize;
                vec![var.initial.unwrap_or(0); length]
            })
            .collect();

        Machine {
            program,
            host,
            statics,
            states: vec![START; program.units.len()],
            timebase: 0,
            ticks_seen: 0,
            counters: [0; 3],
            passes: 0,
            depth: 0,
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn into_host(self) -> H {
        self.host
    }

    /// Pasadas completadas desde la creación.
    pub fn passes(&self) -> u64 {
        self.passes
    }

    /// Hooks de inicialización en orden de declaración, luego `main`.
    pub fn boot(&mut self) -> Sim<()> {
        self.hooks(HookKind::Init)?;
        self.routine(Body::Entry, &[])?;

        debug!("boot sequence finished");
        Ok(())
    }

    /// Una pasada del planificador.
    pub fn pass(&mut self) -> Sim<()> {
        self.hooks(HookKind::Runnable)?;

        let threads: Vec<UnitId> = self.program.model.threads().collect();
        for thread in threads {
            self.step(thread)?;
        }

        if self.ticks_seen != self.timebase {
            self.ticks_seen = self.ticks_seen.wrapping_add(1);
            self.periodic()?;
        }

        self.passes += 1;
        trace!(pass = self.passes, "scheduler pass");

        Ok(())
    }

    /// Un tick de la base de tiempo, como lo haría la ISR del temporizador.
    pub fn tick(&mut self) {
        self.timebase = self.timebase.wrapping_add(1);
    }

    /// Valor crudo de la variable de estado.
    pub fn raw_state(&self, unit: UnitId) -> u16 {
        self.states[unit.0]
    }

    pub fn state(&self, unit: UnitId) -> CoroutineState {
        let ir = self.program.unit(unit);
        let raw = self.states[unit.0];

        if raw == START {
            return CoroutineState::Idle;
        }

        match Point::from_state(raw, ir.width) {
            None => CoroutineState::Done,
            Some(point) => match ir.points.get(point.0 as usize).map(|point| &point.kind) {
                Some(PointKind::Call(callee)) => CoroutineState::AwaitingCallee {
                    point,
                    callee: *callee,
                },

                _ => CoroutineState::Running(point),
            },
        }
    }

    /// Estado de una unidad por su ruta, como `writer.send`.
    pub fn state_of(&self, path: &str) -> Option<CoroutineState> {
        self.program.model.find_unit(path).map(|unit| self.state(unit))
    }

    /// Valor de una estática escalar por su ruta.
    pub fn read_static(&self, path: &str) -> Option<i64> {
        self.read_element(path, 0)
    }

    /// Elemento de un arreglo estático por su ruta.
    pub fn read_element(&self, path: &str, index: usize) -> Option<i64> {
        let id = self.program.model.find_static(path)?;
        self.statics[id.0].get(index).copied()
    }

    fn periodic(&mut self) -> Sim<()> {
        self.hooks(HookKind::Every(Interval::Decisecond))?;

        for (slot, &interval) in Interval::ALL[1..].iter().enumerate() {
            self.counters[slot] = self.counters[slot].wrapping_add(1);
            if self.counters[slot] != interval.ratio() {
                break;
            }

            self.counters[slot] = 0;
            self.hooks(HookKind::Every(interval))?;
        }

        Ok(())
    }

    fn hooks(&mut self, kind: HookKind) -> Sim<()> {
        let hooks: Vec<HookId> = self
            .program
            .model
            .hooks_where(move |other| other == kind)
            .collect();

        for hook in hooks {
            self.routine(Body::Hook(hook), &[])?;
        }

        Ok(())
    }

    /// Reingresa a una unidad de corrutina.
    fn step(&mut self, unit: UnitId) -> Sim<()> {
        let program = self.program;
        let ir = program.unit(unit);

        let start = match Point::from_state(self.states[unit.0], ir.width) {
            None => 0,
            Some(point) => {
                let resume = ir
                    .code
                    .iter()
                    .position(|instruction| *instruction == Instruction::Resume(point));

                // El estado solo se escribe con `SetState` de esta misma unidad
                debug_assert!(
                    resume.is_some(),
                    "{} has no resume point for state {}",
                    program.model.unit(unit).path,
                    self.states[unit.0]
                );

                resume.unwrap_or(0)
            }
        };

        let mut frame = Frame::new(&[]);
        self.enter(|machine| machine.run(&ir.code, start, &mut frame, Some(unit)))?;

        Ok(())
    }

    fn routine(&mut self, body: Body, args: &[i64]) -> Sim<Option<i64>> {
        let program = self.program;
        let model = &program.model;

        let (code, locals, parameters) = match body {
            Body::Function(id) => {
                let function = model.function(id);
                (&program.functions[id.0].code, &function.locals, &function.parameters[..])
            }

            Body::Hook(id) => (&program.hooks[id.0].code, &model.hook(id).locals, &[][..]),
            Body::Entry => (&program.entry.code, &model.entry.locals, &[][..]),
        };

        let mut frame = Frame::new(locals);
        for (parameter, &arg) in parameters.iter().zip(args) {
            frame.values[parameter.0][0] = locals[parameter.0].typ.wrap(arg);
        }

        self.enter(|machine| machine.run(code, 0, &mut frame, None))
    }

    fn enter<T, F>(&mut self, body: F) -> Sim<T>
    where
        F: FnOnce(&mut Self) -> Sim<T>,
    {
        if self.depth >= MAX_DEPTH {
            return Err(SimError::CallDepthExceeded);
        }

        self.depth += 1;
        let result = body(self);
        self.depth -= 1;

        result
    }

    /// Ejecuta instrucciones hasta retornar.
    fn run(
        &mut self,
        code: &[Instruction],
        mut pc: usize,
        frame: &mut Frame,
        unit: Option<UnitId>,
    ) -> Sim<Option<i64>> {
        use Instruction::*;

        while let Some(instruction) = code.get(pc) {
            pc += 1;

            match instruction {
                SetLabel(_) | Resume(_) => (),

                Jump(label) => pc = target(code, *label),

                JumpIfFalse(condition, label) => {
                    if self.eval(frame, condition)? == 0 {
                        pc = target(code, *label);
                    }
                }

                Assign { place, op, value } => {
                    let slot = self.slot(frame, place)?;
                    let value = self.eval(frame, value)?;

                    let value = match op {
                        None => value,
                        Some(op) => {
                            let old = self.load(frame, slot);
                            model::binary(*op, old, value).ok_or(SimError::DivisionByZero)?
                        }
                    };

                    self.store(frame, slot, value);
                }

                Eval(expr) => {
                    self.eval(frame, expr)?;
                }

                Return(value) => {
                    return match value {
                        Some(value) => self.eval(frame, value).map(Some),
                        None => Ok(None),
                    };
                }

                SetState(point) => {
                    if let Some(unit) = unit {
                        self.states[unit.0] = point.state();
                    }
                }

                Suspend => return Ok(None),

                ReturnUnless { condition, .. } => {
                    if self.eval(frame, condition)? == 0 {
                        return Ok(None);
                    }
                }

                Drive(callee) => {
                    self.step(*callee)?;

                    let end = self.program.unit(*callee).width.end();
                    if self.states[callee.0] != end {
                        return Ok(None);
                    }

                    self.states[callee.0] = START;
                }

                Finish => {
                    if let Some(unit) = unit {
                        let done = if self.program.model.unit(unit).is_thread() {
                            START
                        } else {
                            self.program.unit(unit).width.end()
                        };

                        self.states[unit.0] = done;
                    }

                    return Ok(None);
                }
            }
        }

        Ok(None)
    }

    fn eval(&mut self, frame: &Frame, expr: &Expr) -> Sim<i64> {
        let value = match expr {
            Expr::Const(value) => *value,

            Expr::Read(place) => {
                let slot = self.slot(frame, place)?;
                self.load(frame, slot)
            }

            Expr::Call(callee, args) => {
                let args = args
                    .iter()
                    .map(|arg| self.eval(frame, arg))
                    .collect::<Sim<Vec<_>>>()?;

                match callee {
                    Callee::Function(id) => self.routine(Body::Function(*id), &args)?.unwrap_or(0),
                    Callee::Extern(id) => {
                        let name = self.program.model.external(*id).name.as_ref();
                        self.host.call(name, &args)
                    }
                }
            }

            Expr::Unary(op, operand) => model::unary(*op, self.eval(frame, operand)?),

            Expr::Binary(lhs, BinOp::LogicAnd, rhs) => {
                (self.eval(frame, lhs)? != 0 && self.eval(frame, rhs)? != 0) as i64
            }

            Expr::Binary(lhs, BinOp::LogicOr, rhs) => {
                (self.eval(frame, lhs)? != 0 || self.eval(frame, rhs)? != 0) as i64
            }

            Expr::Binary(lhs, op, rhs) => {
                let lhs = self.eval(frame, lhs)?;
                let rhs = self.eval(frame, rhs)?;
                model::binary(*op, lhs, rhs).ok_or(SimError::DivisionByZero)?
            }
        };

        Ok(value)
    }

    fn slot(&mut self, frame: &Frame, place: &Place) -> Sim<Slot> {
        let index = match &place.index {
            None => 0,
            Some(index) => self.eval(frame, index)?,
        };

        let model = &self.program.model;
        let (length, name) = match place.var {
            Var::Extern(id) => return Ok(Slot::Extern(id.0)),
            Var::Static(id) => (self.statics[id.0].len(), model.static_var(id).path.as_str()),
            Var::Local(id) => (frame.values[id.0].len(), frame.locals[id.0].name.as_ref()),
        };

        if index < 0 || index as usize >= length {
            return Err(SimError::IndexOutOfBounds {
                name: name.to_owned(),
                index,
            });
        }

        let slot = match place.var {
            Var::Static(id) => Slot::Static(id.0, index as usize),
            Var::Local(id) => Slot::Local(id.0, index as usize),
            Var::Extern(id) => Slot::Extern(id.0),
        };

        Ok(slot)
    }

    fn load(&mut self, frame: &Frame, slot: Slot) -> i64 {
        match slot {
            Slot::Static(id, index) => self.statics[id][index],
            Slot::Local(id, index) => frame.values[id][index],
            Slot::Extern(id) => {
                let external = &self.program.model.externs[id];
                let value = self.host.read(external.name.as_ref());

                match external.kind {
                    ExternKind::Variable { typ, .. } => typ.wrap(value),
                    ExternKind::Function => value,
                }
            }
        }
    }

    fn store(&mut self, frame: &mut Frame, slot: Slot, value: i64) {
        let model = &self.program.model;

        match slot {
            Slot::Static(id, index) => self.statics[id][index] = model.statics[id].typ.wrap(value),
            Slot::Local(id, index) => frame.values[id][index] = frame.locals[id].typ.wrap(value),
            Slot::Extern(id) => {
                let external = &model.externs[id];
                let value = match external.kind {
                    ExternKind::Variable { typ, .. } => typ.wrap(value),
                    ExternKind::Function => value,
                };

                self.host.write(external.name.as_ref(), value);
            }
        }
    }
}

/// Posición de una etiqueta en un listado.
fn target(code: &[Instruction], label: Label) -> usize {
    code.iter()
        .position(|instruction| *instruction == Instruction::SetLabel(label))
        .unwrap_or(code.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline;

    fn booted(text: &str) -> (Program, Bench) {
        (pipeline::lowered(text).unwrap(), Bench::new())
    }

    #[test]
    fn logic_operators_short_circuit() {
        let (program, bench) = booted(
            "extern fn touch;
             static u8 a;
             static u8 b;
             main {
                 a = 0 && touch();
                 b = 1 || touch();
             }",
        );

        let mut machine = Machine::new(&program, bench);
        machine.boot().unwrap();

        assert_eq!(machine.read_static("a"), Some(0));
        assert_eq!(machine.read_static("b"), Some(1));
        assert!(machine.host().calls().is_empty());
    }

    #[test]
    fn stores_wrap_and_faults_are_reported() {
        let (program, bench) = booted(
            "static u8 small = 250;
             static i8 negative;
             static u8 zero;
             static u8 table[2];
             fn boom() -> u8 { return 1 / zero; }
             main { small += 10; negative = 200; }",
        );

        let mut machine = Machine::new(&program, bench);
        machine.boot().unwrap();

        assert_eq!(machine.read_static("small"), Some(4));
        assert_eq!(machine.read_static("negative"), Some(-56));
        assert_eq!(machine.read_element("table", 1), Some(0));
        assert_eq!(machine.read_element("table", 2), None);

        let boom = program.model.functions.iter().position(|f| f.name.as_ref() == "boom").unwrap();
        assert_eq!(
            machine.routine(Body::Function(FunctionId(boom)), &[]),
            Err(SimError::DivisionByZero)
        );
    }

    #[test]
    fn out_of_bounds_and_runaway_recursion() {
        let (program, bench) = booted(
            "static u8 table[2];
             fn forever(u8 n) -> u8 { return forever(n + 1); }
             main { table[2] = 1; }",
        );

        let mut machine = Machine::new(&program, bench);
        assert!(matches!(
            machine.boot(),
            Err(SimError::IndexOutOfBounds { index: 2, .. })
        ));

        assert_eq!(
            machine.routine(Body::Function(FunctionId(0)), &[0]),
            Err(SimError::CallDepthExceeded)
        );
    }

    #[test]
    fn externs_go_through_the_host() {
        let (program, mut bench) = booted(
            "extern volatile u8 PORTB;
             extern volatile u8 PINB;
             extern fn delay;
             main { PORTB = PINB + 0x101; delay(5, 6); }",
        );

        bench.set("PINB", 2);
        let mut machine = Machine::new(&program, bench);
        machine.boot().unwrap();

        let bench = machine.into_host();
        assert_eq!(bench.writes_to("PORTB"), vec![3]);
        assert_eq!(bench.calls(), [(String::from("delay"), vec![5, 6])]);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "t has no resume point for state 9")]
    fn foreign_states_are_not_restarted_silently() {
        let (program, bench) = booted("thread t { yield; yield; } main { }");

        let mut machine = Machine::new(&program, bench);
        machine.boot().unwrap();
        machine.pass().unwrap();
        assert_eq!(machine.raw_state(UnitId(0)), 1);

        machine.states[0] = 9;
        let _ = machine.pass();
    }
}
