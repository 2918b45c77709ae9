use hilos::{
    arch::Arch,
    codegen,
    model::UnitId,
    pipeline::{self, Compiled, Options},
    sim::{Bench, Machine},
};

use std::{
    env, fs,
    path::{Path, PathBuf},
    process::Command,
};

/// Sustituto de los encabezados de avr-libc para compilar en el anfitrión.
const AVR_STUB: &str = "\
#include <stdint.h>
extern volatile uint8_t PORTB, PORTD, UCSR0A, UCSR0B, UDR0;
void sei(void);
void timebase_start(void);
";

/// Compilador de C del anfitrión, si existe uno.
fn host_cc() -> Option<String> {
    let cc = env::var("CC").unwrap_or_else(|_| String::from("cc"));
    let found = Command::new(&cc)
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false);

    found.then(|| cc)
}

fn scratch(name: &str) -> PathBuf {
    let dir = env::temp_dir().join(format!("hilos-{}-{}", std::process::id(), name));
    fs::create_dir_all(dir.join("avr")).unwrap();
    fs::write(dir.join("avr/io.h"), AVR_STUB).unwrap();
    fs::write(dir.join("avr/interrupt.h"), AVR_STUB).unwrap();

    dir
}

fn compile_c(cc: &str, dir: &Path, args: &[&str]) {
    let output = Command::new(cc)
        .current_dir(dir)
        .args(["-std=c99", "-Wall", "-Werror=unused-label", "-Werror=implicit-function-declaration", "-I."])
        .args(args)
        .output()
        .unwrap();

    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
}

fn demo(text: &str, arch: Arch) -> Compiled {
    pipeline::compile_str(text, Options { arch }).unwrap()
}

#[test]
fn uart_demo() {
    let compiled = demo(include_str!("../demos/uart.coro"), Arch::Avr);

    assert!(compiled.warnings().is_empty());
    assert_eq!(compiled.flags_name().as_deref(), Some("uart.cflags"));
    assert!(compiled.flags().starts_with("-Os -ffixed-r2 "));

    let c = compiled.source_text();
    assert!(c.contains("#include <avr/io.h>\n#include <avr/interrupt.h>\n"));
    assert!(c.contains("if (HILOS_UNLIKELY(!"));
    assert!(c.contains("\thilos_hook__setup();\n\thilos_entry();\n"));
}

#[test]
fn clock_demo_keeps_time() {
    let compiled = demo(include_str!("../demos/clock.coro"), Arch::Avr);

    assert!(compiled.warnings().is_empty());
    assert_eq!(compiled.flags(), "-O2 -ffixed-r16 -ffixed-r17\n");
    assert!(compiled.source_text().contains("static HILOS_PURE uint8_t segments(uint8_t value)"));

    let program = compiled.program();
    let mut machine = Machine::new(program, Bench::new());
    machine.boot().unwrap();

    for _ in 0..600 {
        machine.tick();
        machine.pass().unwrap();
    }

    assert_eq!(machine.read_static("minutes"), Some(1));
    assert_eq!(machine.read_static("seconds"), Some(0));
    assert_eq!(machine.read_static("hours"), Some(0));

    let bench = machine.host();
    assert_eq!(bench.calls(), [(String::from("timebase_start"), vec![])]);
    assert_eq!(bench.writes_to("PORTB").len(), 60);

    // Dígito de unidades, luego de decenas, una vez por pasada
    assert_eq!(bench.writes_to("PORTD")[..2], [0x3f, 0x3f]);
    assert_eq!(bench.writes_to("PORTD").len(), 600);
}

#[test]
fn demos_build_for_the_host() {
    let cc_path = host_cc();
    if cc_path.is_none() {
        eprintln!("no host C compiler, generated C is not compiled");
    }

    let demos = [
        ("uart", include_str!("../demos/uart.coro")),
        ("clock", include_str!("../demos/clock.coro")),
    ];

    for (name, text) in demos {
        let compiled = demo(text, Arch::Hosted);

        assert!(compiled.warnings().is_empty());
        assert!(!compiled.source_text().contains(" asm(\""));

        if let Some(cc_path) = &cc_path {
            let dir = scratch(name);
            fs::write(dir.join("program.c"), compiled.source_text()).unwrap();
            compile_c(cc_path, &dir, &["-c", "program.c", "-o", "program.o"]);

            fs::remove_dir_all(dir).unwrap();
        }
    }
}

/// El C compilado y el ejecutor de referencia recorren los mismos estados.
#[test]
fn hosted_build_matches_reference_executor() {
    let cc_path = match host_cc() {
        Some(cc_path) => cc_path,
        None => {
            eprintln!("no host C compiler, skipping");
            return;
        }
    };

    let compiled = demo(
        "extern volatile u8 ready;
         extern fn pass_done;
         static u8 count;

         runnable pace { pass_done(); }

         thread t {
             sub s(u8 step) {
                 wait_until ready;
                 yield;
                 count += step;
             }

             loop {
                 yield;
                 call s(2);
                 if count >= 6 { count = 0; }
             }
         }

         thread u {
             static u8 n;
             while n < 4 { n += 1; yield; }
         }

         main { ready = 1; }",
        Arch::Hosted,
    );

    let program = compiled.program();

    // Cada pasada comienza por `pass_done()`; tras `PASSES` pasadas
    // completas se reportan los estados y el proceso termina.
    let mut harness = String::from(
        "#include <stdint.h>
#include <stdio.h>
#include <stdlib.h>

volatile uint8_t ready;
static unsigned long completed;
static void report(void);

void pass_done(void)
{
\tif (completed == strtoul(getenv(\"PASSES\"), NULL, 10)) {
\t\treport();
\t\texit(0);
\t}

\t++completed;
}

#include \"program.c\"

static void report(void)
{
",
    );

    for id in 0..program.units.len() {
        let symbol = codegen::state_symbol(program, UnitId(id));
        harness.push_str(&format!("\tprintf(\"%u\\n\", (unsigned) {});\n", symbol));
    }

    harness.push_str("\tprintf(\"%u\\n\", (unsigned) count);\n}\n");

    let dir = scratch("cycle");
    fs::write(dir.join("program.c"), compiled.source_text()).unwrap();
    fs::write(dir.join("harness.c"), harness).unwrap();
    compile_c(&cc_path, &dir, &["harness.c", "-o", "harness"]);

    let mut machine = Machine::new(program, Bench::new());
    machine.boot().unwrap();

    for passes in 0..12 {
        let mut expected = String::new();
        for id in 0..program.units.len() {
            expected.push_str(&format!("{}\n", machine.raw_state(UnitId(id))));
        }

        expected.push_str(&format!("{}\n", machine.read_static("count").unwrap()));

        let output = Command::new(dir.join("harness"))
            .env("PASSES", passes.to_string())
            .output()
            .unwrap();

        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout), expected, "after {} passes", passes);

        machine.pass().unwrap();
    }

    // Un hilo que termina vuelve a START
    assert_eq!(machine.raw_state(program.model.find_unit("u").unwrap()), 0);
    assert_eq!(machine.read_static("u.n"), Some(4));

    fs::remove_dir_all(dir).unwrap();
}
