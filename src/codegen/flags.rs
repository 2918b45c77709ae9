//! Artefacto de banderas de compilación.
//!
//! Una sola línea para el compilador nativo: la bandera de perfil
//! seguida de las banderas que reservan los registros enlazados.

use crate::{
    ir::Program,
    model::{FlagsRequest, Profile},
};

use super::regs::Plan;

/// Banderas derivadas del programa y de la asignación de registros.
pub fn derive(program: &Program, plan: &Plan) -> String {
    let profile = program
        .model
        .flags
        .as_ref()
        .map(|FlagsRequest { profile, .. }| *profile)
        .unwrap_or(Profile::Size);

    let profile = match profile {
        Profile::Size => "-Os",
        Profile::Speed => "-O2",
    };

    let mut line = String::from(profile);
    for flag in plan.fixed_flags() {
        line.push(' ');
        line.push_str(flag);
    }

    line.push('\n');
    line
}

/// Nombre del artefacto solicitado con `cflags`, si lo hay.
pub fn artifact_name(program: &Program) -> Option<String> {
    program
        .model
        .flags
        .as_ref()
        .map(|request| format!("{}.cflags", request.name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{arch::Avr, codegen::regs, pipeline};

    fn flags(text: &str) -> (String, Option<String>) {
        let program = pipeline::lowered(text).unwrap();
        let (plan, _) = regs::allocate::<Avr>(&program);

        (derive(&program, &plan), artifact_name(&program))
    }

    #[test]
    fn profile_then_fixed_registers() {
        let (line, name) = flags(
            "static u16 wide;
             static u8 narrow;
             use_reg narrow r9;
             use_reg wide r6;
             cflags firmware speed;
             main { }",
        );

        assert_eq!(line, "-O2 -ffixed-r6 -ffixed-r7 -ffixed-r9\n");
        assert_eq!(name.as_deref(), Some("firmware.cflags"));
    }

    #[test]
    fn size_is_the_default_profile() {
        let (line, name) = flags("main { }");

        assert_eq!(line, "-Os\n");
        assert_eq!(name, None);
    }
}
