//! Modelo de declaraciones.
//!
//! Tabla validada y con referencias cruzadas que produce el análisis
//! semántico: unidades de corrutina (hilos y subrutinas), variables
//! estáticas, funciones, hooks, símbolos externos y sugerencias. Todas
//! las referencias entre entidades son índices ([`UnitId`],
//! [`StaticId`], etc.) hacia los arreglos de [`Model`], por lo cual el
//! modelo no contiene ciclos de ownership.
//!
//! Los cuerpos ya se encuentran resueltos: cada nombre apunta a la
//! entidad que denota. Las fases posteriores nunca buscan por nombre.

use bitflags::bitflags;
use std::fmt::{self, Display};

use crate::{
    lex::Identifier,
    parse::{BinOp, HookKind, Likelihood, UnOp},
    source::Location,
};

/// Tipo semántico de un valor almacenado.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Type {
    U8,
    U16,
    U24,
    U32,
    I8,
    I16,
    I24,
    I32,
}

impl Type {
    /// Tamaño en bytes.
    pub fn bytes(self) -> u32 {
        use Type::*;

        match self {
            U8 | I8 => 1,
            U16 | I16 => 2,
            U24 | I24 => 3,
            U32 | I32 => 4,
        }
    }

    pub fn signed(self) -> bool {
        matches!(self, Type::I8 | Type::I16 | Type::I24 | Type::I32)
    }

    /// Trunca un valor al ancho de este tipo, como ocurre en C al
    /// almacenar en una variable de este tipo.
    pub fn wrap(self, value: i64) -> i64 {
        let bits = self.bytes() * 8;
        let value = value & ((1i64 << bits) - 1);

        if self.signed() && value >> (bits - 1) != 0 {
            value - (1i64 << bits)
        } else {
            value
        }
    }

    pub fn name(self) -> &'static str {
        use Type::*;

        match self {
            U8 => "u8",
            U16 => "u16",
            U24 => "u24",
            U32 => "u32",
            I8 => "i8",
            I16 => "i16",
            I24 => "i24",
            I32 => "i32",
        }
    }
}

impl Display for Type {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str(self.name())
    }
}

/// Intervalo de un hook periódico.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Interval {
    Decisecond,
    Second,
    Minute,
    Hour,
}

impl Interval {
    pub const ALL: [Interval; 4] = [
        Interval::Decisecond,
        Interval::Second,
        Interval::Minute,
        Interval::Hour,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Interval::ALL
            .iter()
            .copied()
            .find(|interval| unicase::eq_ascii(interval.name(), name))
    }

    pub fn name(self) -> &'static str {
        match self {
            Interval::Decisecond => "decisecond",
            Interval::Second => "second",
            Interval::Minute => "minute",
            Interval::Hour => "hour",
        }
    }

    /// Cantidad de intervalos menores que componen a este.
    ///
    /// Un decisegundo equivale a un tick de la base de tiempo.
    pub fn ratio(self) -> u8 {
        match self {
            Interval::Decisecond => 1,
            Interval::Second => 10,
            Interval::Minute | Interval::Hour => 60,
        }
    }
}

macro_rules! ids {
    ($($(#[$attr:meta])* $id:ident),* $(,)?) => {
        $(
            $(#[$attr])*
            #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $id(pub usize);
        )*
    };
}

ids! {
    /// Índice en [`Model::statics`].
    StaticId,

    /// Índice en [`Model::units`].
    UnitId,

    /// Índice en [`Model::functions`].
    FunctionId,

    /// Índice en [`Model::hooks`].
    HookId,

    /// Índice en [`Model::externs`].
    ExternId,

    /// Índice en las locales del cuerpo que la contiene.
    LocalId,
}

/// Dueño de una variable estática.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Owner {
    Global,
    Unit(UnitId),
    Function(FunctionId),
    Hook(HookId),
    Entry,
}

/// Ranura de almacenamiento persistente.
///
/// Conserva su valor a través de cualquier suspensión de su dueño. Los
/// parámetros de subrutinas y las locales de corrutinas también son
/// estáticas, estas últimas son agregadas por [`crate::machine`].
#[derive(Debug)]
pub struct StaticVariable {
    pub name: Identifier,

    /// Ruta por puntos desde el ámbito global, como `writer.send.b`.
    pub path: String,

    /// Símbolo de C.
    pub symbol: String,

    pub owner: Owner,
    pub typ: Type,
    pub length: Option<u32>,
    pub volatile: bool,

    /// Valor inicial, ya truncado a `typ`.
    pub initial: Option<i64>,

    pub hint: Option<RegisterHint>,
    pub location: Location,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnitKind {
    Thread,
    Subroutine { parent: UnitId },
}

/// Un hilo o una subrutina.
#[derive(Debug)]
pub struct CoroutineUnit {
    pub name: Identifier,
    pub path: String,
    pub symbol: String,
    pub kind: UnitKind,

    /// Hilo que contiene a esta unidad, posiblemente ella misma.
    pub thread: UnitId,

    pub parameters: Vec<StaticId>,
    pub locals: Vec<Local>,
    pub state_hint: Option<RegisterHint>,
    pub tuning: Tuning,
    pub body: Vec<Stmt>,
    pub location: Location,
}

impl CoroutineUnit {
    pub fn is_thread(&self) -> bool {
        self.kind == UnitKind::Thread
    }
}

/// Función ordinaria, nunca se suspende.
#[derive(Debug)]
pub struct Function {
    pub name: Identifier,
    pub parameters: Vec<LocalId>,
    pub returns: Option<Type>,
    pub locals: Vec<Local>,
    pub tuning: Tuning,
    pub body: Vec<Stmt>,
    pub location: Location,
}

/// Hook de inicialización, periódico o de cada pasada.
#[derive(Debug)]
pub struct Hook {
    pub name: Identifier,
    pub kind: HookKind,
    pub locals: Vec<Local>,
    pub tuning: Tuning,
    pub body: Vec<Stmt>,
    pub location: Location,
}

/// Cuerpo de `main`.
#[derive(Debug)]
pub struct Entry {
    pub locals: Vec<Local>,
    pub body: Vec<Stmt>,
    pub location: Location,
}

#[derive(Debug)]
pub struct Extern {
    pub name: Identifier,
    pub kind: ExternKind,
    pub location: Location,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExternKind {
    Variable { typ: Type, volatile: bool },
    Function,
}

/// Variable introducida por `let` o parámetro de función.
#[derive(Debug)]
pub struct Local {
    pub name: Identifier,
    pub typ: Type,
    pub length: Option<u32>,
    pub hint: Option<RegisterHint>,
    pub location: Location,
}

/// Sugerencia de ubicación en registro. Nunca afecta la corrección.
#[derive(Clone, Debug)]
pub struct RegisterHint {
    pub class: RegisterClass,
    pub location: Location,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RegisterClass {
    Low,
    High,
    Any,
    Exact(u8),
}

impl Display for RegisterClass {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterClass::Low => fmt.write_str("low"),
            RegisterClass::High => fmt.write_str("high"),
            RegisterClass::Any => fmt.write_str("any"),
            RegisterClass::Exact(number) => write!(fmt, "r{}", number),
        }
    }
}

bitflags! {
    /// Directivas de afinamiento a nivel de función.
    pub struct Tuning: u8 {
        /// Sin efectos secundarios, el resultado depende solo de los argumentos
        /// y de memoria global.
        const PURE = 0x01;

        /// Nunca expandir en línea.
        const NO_INLINE = 0x02;

        /// Expandir siempre en línea.
        const ALWAYS_INLINE = 0x04;
    }
}

/// Solicitud del artefacto de banderas de compilación.
#[derive(Debug)]
pub struct FlagsRequest {
    pub name: Identifier,
    pub profile: Profile,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Profile {
    Size,
    Speed,
}

#[derive(Debug)]
pub enum Stmt {
    Let {
        local: LocalId,
        value: Option<Expr>,
    },

    Yield(Location),

    WaitUntil {
        condition: Expr,
        hint: Option<Likelihood>,
        location: Location,
    },

    Call {
        callee: UnitId,
        args: Vec<Expr>,
        location: Location,
    },

    If {
        condition: Expr,
        then: Vec<Stmt>,
        otherwise: Vec<Stmt>,
    },

    While {
        condition: Expr,
        body: Vec<Stmt>,
    },

    Loop(Vec<Stmt>),

    Break,

    Continue,

    Return(Option<Expr>),

    Assign {
        place: Place,
        op: Option<BinOp>,
        value: Expr,
    },

    Eval(Expr),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Const(i64),
    Read(Place),
    Call(Callee, Vec<Expr>),
    Unary(UnOp, Box<Expr>),
    Binary(Box<Expr>, BinOp, Box<Expr>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Place {
    pub var: Var,
    pub index: Option<Box<Expr>>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Var {
    Static(StaticId),
    Local(LocalId),
    Extern(ExternId),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Callee {
    Function(FunctionId),
    Extern(ExternId),
}

/// Evalúa un operador unario sobre enteros sin truncar.
pub fn unary(op: UnOp, value: i64) -> i64 {
    match op {
        UnOp::Negate => value.wrapping_neg(),
        UnOp::Not => (value == 0) as i64,
        UnOp::Complement => !value,
    }
}

/// Evalúa un operador binario sobre enteros sin truncar.
///
/// Retorna `None` en división entre cero. Los operadores lógicos no
/// hacen cortocircuito aquí, eso le corresponde a quien evalúa.
pub fn binary(op: BinOp, lhs: i64, rhs: i64) -> Option<i64> {
    use BinOp::*;

    let result = match op {
        Add => lhs.wrapping_add(rhs),
        Sub => lhs.wrapping_sub(rhs),
        Mul => lhs.wrapping_mul(rhs),
        Div | Mod if rhs == 0 => return None,
        Div => lhs.wrapping_div(rhs),
        Mod => lhs.wrapping_rem(rhs),
        And => lhs & rhs,
        Or => lhs | rhs,
        Xor => lhs ^ rhs,
        Shl => lhs.wrapping_shl((rhs & 63) as u32),
        Shr => lhs.wrapping_shr((rhs & 63) as u32),
        Equal => (lhs == rhs) as i64,
        NotEqual => (lhs != rhs) as i64,
        Less => (lhs < rhs) as i64,
        LessOrEqual => (lhs <= rhs) as i64,
        Greater => (lhs > rhs) as i64,
        GreaterOrEqual => (lhs >= rhs) as i64,
        LogicAnd => (lhs != 0 && rhs != 0) as i64,
        LogicOr => (lhs != 0 || rhs != 0) as i64,
    };

    Some(result)
}

/// Tabla completa de declaraciones de un programa.
#[derive(Debug)]
pub struct Model {
    pub includes: Vec<String>,
    pub externs: Vec<Extern>,
    pub statics: Vec<StaticVariable>,
    pub units: Vec<CoroutineUnit>,
    pub functions: Vec<Function>,
    pub hooks: Vec<Hook>,
    pub entry: Entry,
    pub flags: Option<FlagsRequest>,
}

impl Model {
    pub fn unit(&self, UnitId(id): UnitId) -> &CoroutineUnit {
        &self.units[id]
    }

    pub fn static_var(&self, StaticId(id): StaticId) -> &StaticVariable {
        &self.statics[id]
    }

    pub fn function(&self, FunctionId(id): FunctionId) -> &Function {
        &self.functions[id]
    }

    pub fn hook(&self, HookId(id): HookId) -> &Hook {
        &self.hooks[id]
    }

    pub fn external(&self, ExternId(id): ExternId) -> &Extern {
        &self.externs[id]
    }

    /// Hilos en orden de declaración.
    pub fn threads(&self) -> impl Iterator<Item = UnitId> + '_ {
        self.units
            .iter()
            .enumerate()
            .filter(|(_, unit)| unit.is_thread())
            .map(|(id, _)| UnitId(id))
    }

    /// Hooks de un tipo dado, en orden de declaración.
    pub fn hooks_where<F>(&self, filter: F) -> impl Iterator<Item = HookId> + '_
    where
        F: Fn(HookKind) -> bool + 'static,
    {
        self.hooks
            .iter()
            .enumerate()
            .filter(move |(_, hook)| filter(hook.kind))
            .map(|(id, _)| HookId(id))
    }

    /// Busca una unidad por su ruta, como `writer.send`.
    pub fn find_unit(&self, path: &str) -> Option<UnitId> {
        self.units
            .iter()
            .position(|unit| unit.path == path)
            .map(UnitId)
    }

    /// Busca una variable estática por su ruta, como `writer.count`.
    pub fn find_static(&self, path: &str) -> Option<StaticId> {
        self.statics
            .iter()
            .position(|var| var.path == path)
            .map(StaticId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_wrap_to_declared_width() {
        assert_eq!(Type::U8.wrap(256 + 7), 7);
        assert_eq!(Type::U8.wrap(-1), 255);
        assert_eq!(Type::I8.wrap(200), -56);
        assert_eq!(Type::U24.wrap(0x1234_5678), 0x34_5678);
        assert_eq!(Type::I16.wrap(0x8000), -32768);
        assert_eq!(Type::U32.wrap(-1), 0xffff_ffff);
    }

    #[test]
    fn arithmetic_follows_c() {
        assert_eq!(binary(BinOp::Div, -7, 2), Some(-3));
        assert_eq!(binary(BinOp::Mod, -7, 2), Some(-1));
        assert_eq!(binary(BinOp::Div, 1, 0), None);
        assert_eq!(binary(BinOp::Shl, 1, 7), Some(128));
        assert_eq!(binary(BinOp::LogicOr, 0, 5), Some(1));
        assert_eq!(unary(UnOp::Not, 3), 0);
        assert_eq!(Type::U8.wrap(unary(UnOp::Complement, 0x0f)), 0xf0);
    }

    #[test]
    fn intervals_by_name() {
        assert_eq!(Interval::from_name("Second"), Some(Interval::Second));
        assert_eq!(Interval::from_name("fortnight"), None);
        assert_eq!(Interval::Second.ratio(), 10);
    }
}
