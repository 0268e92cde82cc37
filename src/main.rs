//! Main application that compiles Brainfuck programs and executes them.

use std::{
    error::Error as _,
    fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    process::ExitCode,
    time::Instant,
};

use clap::{Parser, ValueEnum};
use log::info;

use tapejit::{compile, Config, Context, EofPolicy, Error, Mode, DEFAULT_TAPE_SIZE};

/// Value stored by an input instruction once the input is exhausted.
#[derive(Clone, Copy, ValueEnum)]
enum EofArg {
    #[value(name = "0")]
    Zero,
    #[value(name = "-1")]
    MinusOne,
    #[value(name = "nochange")]
    Unchanged,
}

impl From<EofArg> for EofPolicy {
    fn from(arg: EofArg) -> Self {
        match arg {
            EofArg::Zero => EofPolicy::Zero,
            EofArg::MinusOne => EofPolicy::MinusOne,
            EofArg::Unchanged => EofPolicy::Unchanged,
        }
    }
}

#[derive(Parser)]
#[command(version, about = "Compile a Brainfuck program to x86_64 machine code and run it")]
struct Cli {
    /// Brainfuck source file
    #[arg(value_name = "FILE")]
    file: PathBuf,

    /// Do not emit bounds checks for pointer movements
    #[arg(short, long = "unsafe")]
    unchecked: bool,

    /// Use the naive translator without any optimizations
    #[arg(short, long)]
    debug: bool,

    /// Value stored by input instructions at the end of the input
    #[arg(long, value_enum, default_value = "0", allow_hyphen_values = true)]
    eof: EofArg,

    /// Print the time spent compiling and executing the program
    #[arg(short, long)]
    time: bool,

    /// Number of cells on the tape
    #[arg(long, value_name = "CELLS", default_value_t = DEFAULT_TAPE_SIZE)]
    tape_size: NonZeroUsize,

    /// Write the generated machine code to this file instead of running it
    #[arg(long, value_name = "FILE")]
    dump: Option<PathBuf>,
}

/// Print the given `error` and its causes to stderr.
fn print_error(error: &Error) {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(&format!(": {cause}"));
        source = cause.source();
    }
    eprintln!("error: {message}");
}

fn read_source(path: &Path) -> Result<Vec<u8>, Error> {
    fs::read(path).map_err(|source| Error::SourceRead {
        path: path.to_owned(),
        source,
    })
}

/// Compile the program and either dump or execute it.
fn execute(cli: &Cli) -> Result<(), Error> {
    let config = Config {
        bounds_checking: !cli.unchecked,
        eof: cli.eof.into(),
        tape_size: cli.tape_size,
        mode: if cli.debug {
            Mode::Naive
        } else {
            Mode::Optimizing
        },
    };
    let source = read_source(&cli.file)?;
    let start = Instant::now();
    let code = compile(&source, &config)?;
    let compiled = Instant::now();
    info!(
        "compiled {} bytes of source into {} bytes of code",
        source.len(),
        code.len()
    );
    if let Some(path) = &cli.dump {
        return code.save(path);
    }
    let mut cxt = Context::with_stdio();
    if config.bounds_checking {
        code.run(config.tape_size, &mut cxt)?;
    } else {
        let mut tape = vec![0; config.tape_size.get()];
        // SAFETY: The user explicitly asked for the bounds checks to be omitted.
        unsafe { code.run_unchecked(&mut tape, &mut cxt)? };
    }
    drop(cxt);
    let finished = Instant::now();
    if cli.time {
        let compile_time = compiled.duration_since(start).as_secs_f64();
        let run_time = finished.duration_since(compiled).as_secs_f64();
        eprintln!("Compile time: {compile_time:.6}s");
        eprintln!("Execution time: {run_time:.6}s");
        eprintln!("Total: {:.6}s", compile_time + run_time);
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match execute(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            print_error(&error);
            ExitCode::FAILURE
        }
    }
}
