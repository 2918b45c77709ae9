//! Implementación para AVR de 8 bits.
//!
//! # Convención de llamadas de avr-gcc
//! <https://gcc.gnu.org/wiki/avr-gcc>
//!
//! Los registros `r2` a `r17` son preservados por el llamado, por lo
//! cual son los únicos que pueden enlazarse a una variable global sin
//! romper la ABI. `r0`, `r1` y `r18` en adelante quedan reservados al
//! compilador. Los registros bajos (`r2`-`r15`) no admiten operandos
//! inmediatos, de ahí la distinción entre clases `low` y `high`.

use std::fmt;

use crate::model::Type;

/// Objetivo AVR.
pub struct Avr;

/// Registro de propósito general `r0`-`r31`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Reg(u8);

impl super::Register for Reg {
    const FILE: &'static [Self] = &[
        Reg(2),
        Reg(3),
        Reg(4),
        Reg(5),
        Reg(6),
        Reg(7),
        Reg(8),
        Reg(9),
        Reg(10),
        Reg(11),
        Reg(12),
        Reg(13),
        Reg(14),
        Reg(15),
        Reg(16),
        Reg(17),
    ];

    fn number(self) -> u8 {
        self.0
    }

    fn is_low(self) -> bool {
        self.0 < 16
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Reg(number) = self;
        write!(formatter, "r{}", number)
    }
}

impl super::Target for Avr {
    const NAME: &'static str = "avr";

    type Register = Reg;

    fn c_type(typ: Type) -> &'static str {
        // avr-gcc tiene enteros nativos de 24 bits
        match typ {
            Type::U24 => "__uint24",
            Type::I24 => "__int24",
            _ => super::stdint(typ),
        }
    }

    fn fixed_flag(reg: Reg) -> String {
        format!("-ffixed-{}", reg)
    }
}
