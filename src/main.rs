//! Punto de entrada ("driver").
//!
//! Este módulo expone una CLI sobre [`hilos::pipeline`]. Las
//! advertencias se despliegan en stderr y no afectan el código de
//! salida; cualquier error sí.

use anyhow::{self, bail, Context};
use clap::{self, crate_version, Arg, Command};
use tracing_subscriber::{prelude::*, EnvFilter};

use hilos::{
    arch::Arch,
    model::UnitId,
    pipeline::{self, Compiled, Options},
    sim::{Bench, Machine},
};

use std::{
    fs::File,
    io::{self, BufReader, Write},
    path::{Path, PathBuf},
    str::FromStr,
};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "hilos=warn".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    // Parsing de CLI
    let args = Command::new("hilos")
        .version(crate_version!())
        .about("Compiles cooperative stackless coroutines to plain C")
        .arg(
            Arg::new("input")
                .required(true)
                .value_name("INPUT")
                .help("Coroutine description ('-' for stdin)"),
        )
        .arg(
            Arg::new("target")
                .short('t')
                .long("target")
                .value_name("ARCH")
                .takes_value(true)
                .default_value("avr")
                .possible_values(["avr", "hosted"])
                .help("Target architecture"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("FILE")
                .takes_value(true)
                .default_value("-")
                .help("Generated C file ('-' for stdout)"),
        )
        .arg(
            Arg::new("flags")
                .long("flags")
                .value_name("FILE")
                .takes_value(true)
                .help("Write the compiler flags artifact to this path"),
        )
        .arg(
            Arg::new("check")
                .long("check")
                .conflicts_with("simulate")
                .help("Only report diagnostics, emit nothing"),
        )
        .arg(
            Arg::new("simulate")
                .long("simulate")
                .value_name("PASSES")
                .takes_value(true)
                .help("Run the program in the reference executor instead of emitting C"),
        )
        .get_matches();

    // clap ya validó los valores posibles y los valores por omisión
    let input = args.value_of("input").unwrap_or("-");
    let output = args.value_of("output").unwrap_or("-");
    let arch = Arch::from_str(args.value_of("target").unwrap_or("avr"))?;

    let passes = args
        .value_of("simulate")
        .map(|passes| {
            passes
                .parse::<u64>()
                .with_context(|| format!("Invalid pass count: {}", passes))
        })
        .transpose()?;

    let mut compiled = compile(input, Options { arch })?;
    if let Some(warnings) = compiled.take_warnings() {
        eprint!("{}", warnings);
    }

    if args.is_present("check") {
        return Ok(());
    } else if let Some(passes) = passes {
        return simulate(&compiled, passes);
    }

    match output {
        "-" => {
            let stdout = io::stdout();
            let mut stdout = stdout.lock();

            compiled
                .emit(&mut stdout)
                .context("Failed to emit to stdout")?;
        }

        path => {
            let mut file = File::create(path)
                .with_context(|| format!("Failed to open for writing: {}", path))?;

            compiled
                .emit(&mut file)
                .with_context(|| format!("Failed to emit to file: {}", path))?;
        }
    }

    let flags_path = match (args.value_of("flags"), compiled.flags_name()) {
        (Some(path), _) => Some(PathBuf::from(path)),

        // Sin ruta explícita, el artefacto queda junto al archivo de C
        (None, Some(name)) => Some(match output {
            "-" => PathBuf::from(name),
            path => Path::new(path).with_file_name(name),
        }),

        (None, None) => None,
    };

    if let Some(path) = flags_path {
        std::fs::write(&path, compiled.flags())
            .with_context(|| format!("Failed to write flags to: {}", path.display()))?;
    }

    Ok(())
}

fn compile(input: &str, options: Options) -> anyhow::Result<Compiled> {
    let result = match input {
        "-" => pipeline::compile(io::stdin().lock(), "<stdin>", options),

        path => {
            let file =
                File::open(path).with_context(|| format!("Failed to open for reading: {}", path))?;

            pipeline::compile(BufReader::new(file), path, options)
        }
    };

    match result {
        Ok(compiled) => Ok(compiled),
        Err(diagnostics) => {
            eprint!("{}", diagnostics);
            bail!("Compilation of {} failed", input);
        }
    }
}

/// Ejecuta el programa con un tick de base de tiempo por pasada.
fn simulate(compiled: &Compiled, passes: u64) -> anyhow::Result<()> {
    let program = compiled.program();
    let mut machine = Machine::new(program, Bench::new());

    machine.boot().context("Boot sequence faulted")?;
    for pass in 0..passes {
        machine.tick();
        machine
            .pass()
            .with_context(|| format!("Scheduler pass {} faulted", pass + 1))?;
    }

    let stdout = io::stdout();
    let mut stdout = stdout.lock();

    writeln!(stdout, "after {} passes:", machine.passes())?;
    for id in 0..program.units.len() {
        let unit = UnitId(id);
        writeln!(
            stdout,
            "  {:<24} {:?}",
            program.model.unit(unit).path,
            machine.state(unit)
        )?;
    }

    for (name, value) in machine.host().writes() {
        writeln!(stdout, "  write {} = {}", name, value)?;
    }

    for (name, args) in machine.host().calls() {
        writeln!(stdout, "  call {}{:?}", name, args)?;
    }

    Ok(())
}
