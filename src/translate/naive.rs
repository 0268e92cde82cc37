//! A straightforward translator without any analysis.

use crate::{
    codegen::{CodeGen, CompiledCode},
    Config, Error,
};

use super::Translator;

/// Translator that only merges runs of identical instructions. Every pointer
/// movement is checked and every loop tests its condition on entry.
pub struct NaiveTranslator {
    gen: CodeGen,
    /// The instruction of the current run, its length and its first position.
    run: Option<(u8, usize, usize)>,
    /// Source positions of the loops that are still open.
    open: Vec<usize>,
}

impl NaiveTranslator {
    fn flush(&mut self) -> Result<(), Error> {
        let Some((byte, count, position)) = self.run.take() else {
            return Ok(());
        };
        let moved = || i32::try_from(count).map_err(|_| Error::OffsetTooLarge { position });
        match byte {
            b'+' => self.gen.add(count as u8),
            b'-' => self.gen.add((count as u8).wrapping_neg()),
            b'>' => self.gen.move_pointer(moved()?),
            b'<' => self.gen.move_pointer(-moved()?),
            _ => unreachable!("only runs of additions and movements are collected"),
        }
        Ok(())
    }
}

impl Translator for NaiveTranslator {
    fn new(config: &Config) -> Self {
        NaiveTranslator {
            gen: CodeGen::new(config.bounds_checking, config.eof),
            run: None,
            open: Vec::new(),
        }
    }

    fn step(&mut self, position: usize, byte: u8) -> Result<(), Error> {
        if !b"+-<>.,[]".contains(&byte) {
            return Ok(());
        }
        if let Some((last, count, _)) = &mut self.run {
            if *last == byte {
                *count += 1;
                return Ok(());
            }
        }
        self.flush()?;
        match byte {
            b'.' => self.gen.output(),
            b',' => self.gen.input(),
            b'[' => {
                self.gen.loop_start();
                self.open.push(position);
            }
            b']' => {
                if !self.gen.is_in_loop() {
                    return Err(Error::LoopNotOpened { position });
                }
                self.open.pop();
                self.gen.loop_end()?;
            }
            _ => self.run = Some((byte, 1, position)),
        }
        Ok(())
    }

    fn finish(mut self) -> Result<CompiledCode, Error> {
        if let Some(&position) = self.open.first() {
            return Err(Error::LoopNotClosed { position });
        }
        self.flush()?;
        self.gen.finish()
    }
}

translator_tests!(NaiveTranslator);

#[cfg(test)]
mod naive_tests {
    use super::NaiveTranslator;
    use crate::{Config, Error, Translator};

    #[test]
    fn runs_are_merged() -> Result<(), Error> {
        let config = Config::default();
        let merged = NaiveTranslator::translate(b"+++>>", &config)?;
        let split = NaiveTranslator::translate(b"+.+.+>.>", &config)?;
        assert!(merged.len() < split.len());
        assert_eq!(
            NaiveTranslator::translate(b"++ +\n>x>", &config)?,
            NaiveTranslator::translate(b"+++>>", &config)?
        );
        Ok(())
    }

    #[test]
    fn loops_are_always_emitted() -> Result<(), Error> {
        let config = Config::default();
        let empty = NaiveTranslator::translate(b"", &config)?;
        let with_loop = NaiveTranslator::translate(b"[.]", &config)?;
        assert!(with_loop.len() > empty.len());
        Ok(())
    }
}
