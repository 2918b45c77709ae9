//! Objetivo anfitrión.
//!
//! Sirve para compilar y probar el C generado en la máquina de
//! desarrollo. No existen registros enlazables: toda sugerencia de
//! registro se degrada a almacenamiento ordinario.

use std::fmt;

use crate::model::Type;

pub struct Hosted;

/// No existe ningún valor de este tipo.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reg {}

impl super::Register for Reg {
    const FILE: &'static [Self] = &[];

    fn number(self) -> u8 {
        match self {}
    }

    fn is_low(self) -> bool {
        match self {}
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, _: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {}
    }
}

impl super::Target for Hosted {
    const NAME: &'static str = "hosted";

    type Register = Reg;

    fn c_type(typ: Type) -> &'static str {
        super::stdint(typ)
    }

    fn fixed_flag(reg: Reg) -> String {
        match reg {}
    }
}
