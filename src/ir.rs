//! Representación intermedia.
//!
//! Cada cuerpo (unidad de corrutina, función, hook o `main`) se reduce
//! a un listado plano de instrucciones con etiquetas. Esta es la forma
//! que consumen tanto el generador de C en [`crate::codegen`] como el
//! ejecutor de referencia en [`crate::sim`], de modo que ambos
//! comparten exactamente la misma máquina de estados.
//!
//! # Codificación de estados
//! El estado de una unidad es `START` (0) antes de ejecutarse, `k + 1`
//! mientras está suspendida en el punto `k` y `END` (todos los bits en
//! uno) al terminar una subrutina. El ancho es de un byte mientras la
//! unidad tenga a lo sumo [`BYTE_POINTS`] puntos de suspensión.

use crate::{
    model::{Expr, Model, Place, StaticId, Type, UnitId},
    parse::{BinOp, Likelihood},
    source::Location,
};

/// Valor de estado de una unidad que no ha iniciado.
pub const START: u16 = 0;

/// Máximo de puntos de suspensión por unidad.
pub const MAX_SUSPENSION_POINTS: usize = 256;

/// Máximo de puntos de suspensión con estado de un byte.
pub const BYTE_POINTS: usize = 254;

pub struct Program {
    pub model: Model,

    /// Paralelo a `model.units`.
    pub units: Vec<Unit>,

    /// Paralelo a `model.functions`.
    pub functions: Vec<Routine>,

    /// Paralelo a `model.hooks`.
    pub hooks: Vec<Routine>,

    pub entry: Routine,

    /// Enlaces llamador/llamado, uno por sitio de llamada.
    pub frames: Vec<CallFrame>,
}

impl Program {
    pub fn unit(&self, UnitId(id): UnitId) -> &Unit {
        &self.units[id]
    }
}

/// Máquina de estados de un hilo o subrutina.
pub struct Unit {
    pub points: Vec<SuspensionPoint>,
    pub code: Vec<Instruction>,
    pub width: StateWidth,

    /// Estáticas a las que se elevaron las locales (`let`) de la unidad.
    pub hoisted: Vec<StaticId>,
}

/// Cuerpo que nunca se suspende.
#[derive(Default)]
pub struct Routine {
    pub code: Vec<Instruction>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StateWidth {
    Byte,
    Word,
}

impl StateWidth {
    pub fn for_points(points: usize) -> Self {
        if points <= BYTE_POINTS {
            StateWidth::Byte
        } else {
            StateWidth::Word
        }
    }

    pub fn bytes(self) -> u32 {
        self.typ().bytes()
    }

    /// Tipo sin signo que almacena el estado.
    pub fn typ(self) -> Type {
        match self {
            StateWidth::Byte => Type::U8,
            StateWidth::Word => Type::U16,
        }
    }

    /// Valor de estado de una subrutina que ha terminado.
    pub fn end(self) -> u16 {
        match self {
            StateWidth::Byte => 0xff,
            StateWidth::Word => 0xffff,
        }
    }
}

/// Identificador de un punto de suspensión, asignado en orden textual
/// a partir de cero.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Point(pub u16);

impl Point {
    /// Valor de estado mientras la unidad está suspendida en este punto.
    pub fn state(self) -> u16 {
        self.0 + 1
    }

    /// Operación inversa de [`Point::state()`].
    pub fn from_state(state: u16, width: StateWidth) -> Option<Self> {
        if state == START || state == width.end() {
            None
        } else {
            Some(Point(state - 1))
        }
    }
}

#[derive(Debug)]
pub struct SuspensionPoint {
    pub id: Point,
    pub kind: PointKind,
    pub location: Location,
}

#[derive(Debug)]
pub enum PointKind {
    Yield,
    WaitUntil {
        condition: Expr,
        hint: Option<Likelihood>,
    },
    Call(UnitId),
}

/// Enlace lógico entre un sitio de llamada y la subrutina llamada.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CallFrame {
    pub caller: UnitId,
    pub resume: Point,
    pub callee: UnitId,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Label(pub u32);

#[derive(Debug, PartialEq)]
pub enum Instruction {
    SetLabel(Label),
    Jump(Label),
    JumpIfFalse(Expr, Label),

    Assign {
        place: Place,
        op: Option<BinOp>,
        value: Expr,
    },

    Eval(Expr),

    /// Registra el punto de reanudación en la variable de estado.
    SetState(Point),

    /// Retorna al llamador sin modificar el estado.
    Suspend,

    /// Destino del despacho al reingresar en este punto.
    Resume(Point),

    /// Retorna al llamador si la condición no se cumple. Al reingresar
    /// se vuelve a evaluar, el estado no cambia.
    ReturnUnless {
        condition: Expr,
        hint: Option<Likelihood>,
    },

    /// Avanza un paso a la subrutina llamada. Si no ha llegado a `END`
    /// se retorna, de lo contrario se rearma en `START` y se continúa.
    Drive(UnitId),

    /// Fin del cuerpo: un hilo vuelve a `START`, una subrutina pasa a `END`.
    Finish,

    Return(Option<Expr>),
}
