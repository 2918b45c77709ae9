//! Detalles específicos para cada arquitectura objetivo.
//!
//! Este módulo expone los parámetros de arquitectura que necesitan la
//! asignación consultiva de registros y la emisión de C: nombres de
//! tipos, archivo de registros enlazables y banderas que reservan un
//! registro. En general, debe utilizarse la macro `dispatch_arch!()`
//! para acceder a estas implementaciones.

use std::{fmt::Display, str::FromStr};
use thiserror::Error;

use crate::model::Type;

/// Arquitectura objetivo.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Arch {
    /// Microcontroladores AVR de 8 bits, compilados con `avr-gcc`.
    Avr,

    /// La máquina que compila, útil para pruebas del código generado.
    Hosted,
}

mod avr;
mod hosted;

pub use avr::Avr;
pub use hosted::Hosted;

#[derive(Error, Debug)]
#[error("Unknown target `{0}`, expected `avr` or `hosted`")]
pub struct UnknownArch(String);

impl Arch {
    pub fn name(self) -> &'static str {
        dispatch_arch!(T: self => T::NAME)
    }
}

impl FromStr for Arch {
    type Err = UnknownArch;

    fn from_str(string: &str) -> Result<Self, Self::Err> {
        match string {
            "avr" => Ok(Arch::Avr),
            "hosted" | "native" => Ok(Arch::Hosted),
            _ => Err(UnknownArch(string.to_owned())),
        }
    }
}

/// Parámetros de una arquitectura objetivo.
pub trait Target {
    /// Nombre corto, como se indica en la línea de comandos.
    const NAME: &'static str;

    /// Tipo de registro.
    type Register: Register;

    /// Tipo de C que almacena valores de un tipo dado.
    fn c_type(typ: Type) -> &'static str;

    /// Bandera del compilador nativo que impide que este use un
    /// registro por su cuenta.
    fn fixed_flag(reg: Self::Register) -> String;
}

/// Registro de procesador que puede enlazarse a una variable.
pub trait Register: Copy + Eq + Display + 'static {
    /// Registros enlazables, en orden ascendente.
    const FILE: &'static [Self];

    /// Número de registro físico.
    fn number(self) -> u8;

    /// Indica si el registro pertenece a la clase `low`.
    fn is_low(self) -> bool;
}

/// Tipos de C comunes a ambos objetivos.
fn stdint(typ: Type) -> &'static str {
    match typ {
        Type::U8 => "uint8_t",
        Type::U16 => "uint16_t",
        Type::U32 => "uint32_t",
        Type::I8 => "int8_t",
        Type::I16 => "int16_t",
        Type::I32 => "int32_t",
        Type::U24 => "uint32_t",
        Type::I24 => "int32_t",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_by_name() {
        assert_eq!("avr".parse::<Arch>().unwrap(), Arch::Avr);
        assert_eq!("hosted".parse::<Arch>().unwrap(), Arch::Hosted);
        assert!("xtensa".parse::<Arch>().is_err());
        assert_eq!(Arch::Avr.name(), "avr");
    }

    #[test]
    fn register_files() {
        let file = <Avr as Target>::Register::FILE;
        assert_eq!(file.len(), 16);
        assert_eq!(file.first().map(|reg| reg.number()), Some(2));
        assert_eq!(file.last().map(|reg| reg.to_string()), Some(String::from("r17")));
        assert!(file.iter().filter(|reg| !reg.is_low()).count() == 2);

        assert!(<Hosted as Target>::Register::FILE.is_empty());
        assert_eq!(Avr::c_type(Type::U24), "__uint24");
        assert_eq!(Hosted::c_type(Type::U24), "uint32_t");
    }
}
