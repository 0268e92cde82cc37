//! Translators turning Brainfuck source into calls on the code buffer.

use crate::{codegen::CompiledCode, Config, Error};

#[macro_use]
mod testdef;

mod naive;
mod opt;

pub use naive::NaiveTranslator;
pub use opt::OptimizingTranslator;

/// Trait implemented by the different translation strategies of this crate. A
/// translator consumes the source one byte at a time and never looks back.
pub trait Translator: Sized {
    /// Create a translator emitting code for the given configuration.
    fn new(config: &Config) -> Self;

    /// Process the byte at `position` of the source. Bytes that are not one of
    /// the eight instructions are ignored.
    fn step(&mut self, position: usize, byte: u8) -> Result<(), Error>;

    /// Finish the translation, failing if a loop is still open.
    fn finish(self) -> Result<CompiledCode, Error>;

    /// Translate the complete `source`.
    fn translate(source: &[u8], config: &Config) -> Result<CompiledCode, Error> {
        let mut translator = Self::new(config);
        for (position, &byte) in source.iter().enumerate() {
            translator.step(position, byte)?;
        }
        translator.finish()
    }
}
