//! A single pass compiler translating Brainfuck programs directly into x86_64
//! machine code, together with a small host for executing the result.
//!
//! # Examples
//! ```
//! # use tapejit::{compile, Config, Context, Error};
//! let mut buf = Vec::new();
//! let mut cxt = Context::new(None, Some(Box::new(&mut buf)));
//! let config = Config::default();
//! let code = compile(b"++++++[>+++++<-]>++[>++<-]++++[>++<-]>[.>]", &config)?;
//! code.run(config.tape_size, &mut cxt)?;
//! drop(cxt);
//! assert_eq!(String::from_utf8(buf).unwrap(), "H");
//! # Ok::<(), Error>(())
//! ```

#[cfg(not(all(target_arch = "x86_64", target_family = "unix")))]
compile_error!("tapejit only supports x86_64 unix targets");

use std::{io, num::NonZeroUsize, path::PathBuf};

use thiserror::Error;

mod codegen;
pub mod exec;
pub mod runtime;
pub mod translate;

pub use codegen::CompiledCode;
pub use runtime::Context;
pub use translate::{NaiveTranslator, OptimizingTranslator, Translator};

/// Errors that can occur while compiling or running a program.
#[derive(Error, Debug)]
pub enum Error {
    #[error("unbalanced brackets, loop opened at byte {position} is not closed")]
    LoopNotClosed { position: usize },

    #[error("unbalanced brackets, loop closed at byte {position} was never opened")]
    LoopNotOpened { position: usize },

    #[error("no open loop in the code buffer")]
    NoOpenLoop,

    #[error("jump too large ({distance} bytes)")]
    JumpTooLarge { distance: isize },

    #[error("pointer displacement at byte {position} does not fit into 32 bits")]
    OffsetTooLarge { position: usize },

    #[error("failed to read file `{}`", .path.display())]
    SourceRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write file `{}`", .path.display())]
    DumpWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to map executable memory")]
    ExecutableMemory(#[source] io::Error),

    #[error("code compiled without bounds checks can only be run unchecked")]
    UncheckedCode,

    #[error("the tape must contain at least one cell")]
    EmptyTape,
}

/// What an input instruction stores in the current cell once the input is
/// exhausted.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EofPolicy {
    Zero,
    MinusOne,
    Unchanged,
}

/// Which translator is used to generate the machine code.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Mode {
    /// Coalesces operations, tracks known cell values and rewrites loop idioms.
    Optimizing,
    /// Only merges runs of identical instructions.
    Naive,
}

/// Number of cells used when no tape size is given.
pub const DEFAULT_TAPE_SIZE: NonZeroUsize = match NonZeroUsize::new(30_000) {
    Some(size) => size,
    None => panic!("default tape size must not be zero"),
};

/// Configuration consumed by the compiler and the execution host.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Config {
    pub bounds_checking: bool,
    pub eof: EofPolicy,
    pub tape_size: NonZeroUsize,
    pub mode: Mode,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bounds_checking: true,
            eof: EofPolicy::Zero,
            tape_size: DEFAULT_TAPE_SIZE,
            mode: Mode::Optimizing,
        }
    }
}

/// Compile the given source with the translator selected in `config`.
pub fn compile(source: &[u8], config: &Config) -> Result<CompiledCode, Error> {
    match config.mode {
        Mode::Optimizing => OptimizingTranslator::translate(source, config),
        Mode::Naive => NaiveTranslator::translate(source, config),
    }
}
