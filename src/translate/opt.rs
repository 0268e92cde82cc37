//! The optimizing single pass translator.
//!
//! Pointer movements and additions are not emitted immediately. They are
//! collected as a pending pointer displacement together with the additions to be
//! applied relative to the current cell, and only materialized when an output,
//! input or loop boundary requires the tape to be up to date. Along the way the
//! translator keeps track of what is statically known about the current cell,
//! which allows it to drop loops that can never be entered and to rewrite loops
//! with empty emitted bodies into clears, scans and multiply-copy sequences.

use std::collections::BTreeMap;

use log::{debug, trace};

use crate::{
    codegen::{CodeGen, CompiledCode},
    Config, Error,
};

use super::Translator;

/// What is known statically about a value.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Knowledge {
    Unknown,
    Known(u8),
    NonZero,
}

/// How a loop with an empty emitted body was rewritten.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Idiom {
    /// The loop never terminates once entered.
    Infinite,
    /// The loop moves the pointer until it finds a zero cell.
    Scan,
    /// The loop only counts the current cell down (or up) to zero.
    Clear,
    /// The loop distributes multiples of the current cell to other cells.
    MultiplyCopy,
}

/// Counts of the rewrites applied, reported at the end of the translation.
#[derive(Default, Debug)]
struct Stats {
    skipped: usize,
    infinite: usize,
    scans: usize,
    clears: usize,
    copies: usize,
}

/// Translator that coalesces operations, tracks known values and rewrites
/// common loop idioms.
pub struct OptimizingTranslator {
    gen: CodeGen,
    /// Pending pointer displacement.
    offset: i32,
    /// Pending addition to the current cell.
    inplace: u8,
    /// Pending additions to the cells at other offsets.
    deltas: BTreeMap<i32, u8>,
    /// The current cell must be set to its known value at the next flush.
    pending_set: bool,
    /// Knowledge about the current cell, not including `inplace`.
    cell: Knowledge,
    /// Knowledge about the number of iterations of the innermost open loop.
    trip: Knowledge,
    /// Nesting depth inside a loop that is skipped without emitting code.
    skip_depth: usize,
    /// Source position of the outermost skipped loop.
    skip_start: usize,
    /// Source positions of the emitted loops that are still open.
    open: Vec<usize>,
    stats: Stats,
}

impl OptimizingTranslator {
    /// Forget all pending pointer movements and additions.
    fn clear_pending(&mut self) {
        self.offset = 0;
        self.inplace = 0;
        self.deltas.clear();
    }

    /// Emit all pending operations. Afterwards the pointer in the generated code
    /// is the same as the pointer in the source.
    fn flush(&mut self) {
        let low = self.deltas.keys().next().copied().unwrap_or(0).min(self.offset);
        let high = self.deltas.keys().next_back().copied().unwrap_or(0).max(self.offset);
        if low < 0 {
            self.gen.bounds_check(low);
        }
        if high > 0 {
            self.gen.bounds_check(high);
        }
        for (&offset, &delta) in &self.deltas {
            if offset != self.offset && delta != 0 {
                self.gen.add_at_offset(delta, offset);
            }
        }
        match self.cell {
            Knowledge::Known(value) if self.pending_set || self.inplace != 0 => {
                let value = value.wrapping_add(self.inplace);
                self.gen.set(value);
                self.cell = Knowledge::Known(value);
            }
            _ if self.inplace != 0 => {
                self.gen.add(self.inplace);
                self.cell = Knowledge::Unknown;
            }
            _ => {}
        }
        self.pending_set = false;
        if self.offset != 0 {
            self.gen.move_pointer_unchecked(self.offset);
            self.cell = Knowledge::Unknown;
        }
        if let Some(&delta) = self.deltas.get(&self.offset) {
            self.gen.add(delta);
        }
        self.clear_pending();
    }

    fn move_pointer(&mut self, position: usize, count: i32) -> Result<(), Error> {
        self.offset = self
            .offset
            .checked_add(count)
            .ok_or(Error::OffsetTooLarge { position })?;
        Ok(())
    }

    fn add(&mut self, count: u8) {
        if self.offset == 0 {
            self.inplace = self.inplace.wrapping_add(count);
        } else {
            let delta = self.deltas.entry(self.offset).or_insert(0);
            *delta = delta.wrapping_add(count);
        }
    }

    fn loop_start(&mut self, position: usize) {
        let value = match self.cell {
            Knowledge::Known(value) if self.offset == 0 => Some(value.wrapping_add(self.inplace)),
            _ => None,
        };
        if value == Some(0) {
            trace!("skipping loop at {position}, the current cell is zero");
            self.stats.skipped += 1;
            self.skip_depth = 1;
            self.skip_start = position;
            return;
        }
        self.flush();
        match self.cell {
            Knowledge::Known(value) => {
                self.gen.loop_start_optimized();
                self.trip = Knowledge::Known(value);
            }
            Knowledge::NonZero => {
                self.gen.loop_start_optimized();
                self.trip = Knowledge::NonZero;
            }
            Knowledge::Unknown => {
                self.gen.loop_start();
                self.trip = Knowledge::Unknown;
            }
        }
        self.open.push(position);
        self.cell = Knowledge::NonZero;
    }

    /// Try to replace the loop that is about to be closed. Only called if no code
    /// has been emitted for the body of the loop.
    fn rewrite_loop(&mut self) -> Result<Option<Idiom>, Error> {
        if self.inplace == 0 && self.offset == 0 {
            // Once entered, nothing ever changes the condition.
            self.deltas.clear();
            self.stats.infinite += 1;
            return Ok(Some(Idiom::Infinite));
        }
        if self.inplace == 0 && self.deltas.is_empty() {
            self.gen.pop_started_loop()?;
            self.gen
                .scan_loop(self.offset, self.trip != Knowledge::Unknown)?;
            self.stats.scans += 1;
            return Ok(Some(Idiom::Scan));
        }
        if self.offset != 0 {
            return Ok(None);
        }
        if self.deltas.is_empty() && (self.inplace == 1 || self.inplace == u8::MAX) {
            self.gen.pop_started_loop()?;
            self.stats.clears += 1;
            return Ok(Some(Idiom::Clear));
        }
        if self.inplace == u8::MAX {
            self.gen.pop_started_loop()?;
            let guarded = self.trip == Knowledge::Unknown;
            if guarded {
                self.gen.start_copy_seq();
            }
            let low = self.deltas.keys().next().copied().unwrap_or(0);
            let high = self.deltas.keys().next_back().copied().unwrap_or(0);
            if low < 0 {
                self.gen.bounds_check(low);
            }
            if high > 0 {
                self.gen.bounds_check(high);
            }
            for (&offset, &delta) in &self.deltas {
                if delta == 0 {
                    continue;
                }
                match self.trip {
                    Knowledge::Known(trips) => {
                        self.gen.add_at_offset(delta.wrapping_mul(trips), offset)
                    }
                    _ => self.gen.multiply_add(offset, delta),
                }
            }
            if guarded {
                self.gen.finish_copy_seq()?;
            }
            self.stats.copies += 1;
            return Ok(Some(Idiom::MultiplyCopy));
        }
        Ok(None)
    }

    fn loop_end(&mut self, position: usize) -> Result<(), Error> {
        if !self.gen.is_in_loop() {
            return Err(Error::LoopNotOpened { position });
        }
        let start = self.open.pop().unwrap_or(position);
        let idiom = if self.gen.current_loop_size() == Some(0) && !self.pending_set {
            self.rewrite_loop()?
        } else {
            None
        };
        match idiom {
            Some(Idiom::Infinite) | None => {
                if let Some(idiom) = idiom {
                    trace!("loop at {start} rewritten as {idiom:?}");
                }
                let delay_zero_set = self.cell == Knowledge::Known(0)
                    && self.pending_set
                    && self.offset == 0
                    && self.inplace == 0;
                if delay_zero_set {
                    self.pending_set = false;
                }
                self.flush();
                if delay_zero_set {
                    self.pending_set = true;
                }
                if self.cell == Knowledge::Known(0) {
                    self.gen.loop_end_optimized()?;
                } else {
                    self.gen.loop_end()?;
                }
            }
            Some(idiom) => {
                trace!("loop at {start} rewritten as {idiom:?}");
                self.clear_pending();
                if idiom != Idiom::Scan {
                    self.pending_set = true;
                }
            }
        }
        self.cell = Knowledge::Known(0);
        self.trip = Knowledge::Unknown;
        Ok(())
    }
}

impl Translator for OptimizingTranslator {
    fn new(config: &Config) -> Self {
        OptimizingTranslator {
            gen: CodeGen::new(config.bounds_checking, config.eof),
            offset: 0,
            inplace: 0,
            deltas: BTreeMap::new(),
            pending_set: false,
            cell: Knowledge::Known(0),
            trip: Knowledge::Unknown,
            skip_depth: 0,
            skip_start: 0,
            open: Vec::new(),
            stats: Stats::default(),
        }
    }

    fn step(&mut self, position: usize, byte: u8) -> Result<(), Error> {
        if self.skip_depth != 0 {
            match byte {
                b'[' => self.skip_depth += 1,
                b']' => self.skip_depth -= 1,
                _ => { /* Nothing in a skipped loop has any effect. */ }
            }
            return Ok(());
        }
        match byte {
            b'>' => self.move_pointer(position, 1)?,
            b'<' => self.move_pointer(position, -1)?,
            b'+' => self.add(1),
            b'-' => self.add(u8::MAX),
            b'.' => {
                self.flush();
                self.gen.output();
            }
            b',' => {
                self.flush();
                self.gen.input();
                self.cell = Knowledge::Unknown;
            }
            b'[' => self.loop_start(position),
            b']' => self.loop_end(position)?,
            _ => { /* Everything else is a comment. */ }
        }
        Ok(())
    }

    fn finish(mut self) -> Result<CompiledCode, Error> {
        if let Some(&position) = self.open.first() {
            return Err(Error::LoopNotClosed { position });
        }
        if self.skip_depth != 0 {
            return Err(Error::LoopNotClosed {
                position: self.skip_start,
            });
        }
        self.flush();
        debug!(
            "rewrote loops: {} skipped, {} infinite, {} scans, {} clears, {} copies",
            self.stats.skipped,
            self.stats.infinite,
            self.stats.scans,
            self.stats.clears,
            self.stats.copies
        );
        self.gen.finish()
    }
}

translator_tests!(OptimizingTranslator);

#[cfg(test)]
mod opt_tests {
    use super::OptimizingTranslator;
    use crate::{Config, Error, NaiveTranslator, Translator};

    fn unchecked() -> Config {
        Config {
            bounds_checking: false,
            ..Config::default()
        }
    }

    fn size_of(source: &str, config: &Config) -> Result<usize, Error> {
        Ok(OptimizingTranslator::translate(source.as_bytes(), config)?.len())
    }

    #[test]
    fn comments_do_not_change_the_code() -> Result<(), Error> {
        let config = Config::default();
        assert_eq!(
            OptimizingTranslator::translate(b"+>-< hello world\n", &config)?,
            OptimizingTranslator::translate(b"+>-<", &config)?
        );
        Ok(())
    }

    #[test]
    fn loops_that_never_change_their_cell_keep_only_the_loop() -> Result<(), Error> {
        let config = Config::default();
        assert!(OptimizingTranslator::translate(b",[]", &config).is_ok());
        assert_eq!(
            OptimizingTranslator::translate(b",[>+<]", &config)?,
            OptimizingTranslator::translate(b",[]", &config)?
        );
        assert_eq!(
            OptimizingTranslator::translate(b"+[>+<]", &config)?,
            OptimizingTranslator::translate(b"+[]", &config)?
        );
        let config = unchecked();
        assert_eq!(size_of(",[>>-<<]", &config)?, size_of(",[]", &config)?);
        Ok(())
    }

    #[test]
    fn loops_on_zero_cells_produce_no_code() -> Result<(), Error> {
        let config = unchecked();
        assert_eq!(size_of("[+++[>+<]-]>+", &config)?, size_of(">+", &config)?);
        assert_eq!(size_of("+-[.]", &config)?, size_of("", &config)?);
        assert_eq!(size_of("+[-][.,]", &config)?, size_of("+[-]", &config)?);
        Ok(())
    }

    #[test]
    fn cancelling_operations_are_dropped() -> Result<(), Error> {
        let config = Config::default();
        assert_eq!(size_of(",+-><.", &config)?, size_of(",.", &config)?);
        assert_eq!(size_of(",>+<>-<.", &config)?, size_of(",>+-<.", &config)?);
        Ok(())
    }

    #[test]
    fn clear_loop_becomes_set() -> Result<(), Error> {
        let config = unchecked();
        let clear = OptimizingTranslator::translate(b",[-].", &config)?;
        let naive = NaiveTranslator::translate(b",[-].", &config)?;
        assert!(clear.len() < naive.len());
        assert_eq!(size_of(",[-].", &config)?, size_of(",[+].", &config)?);
        Ok(())
    }

    #[test]
    fn known_trip_count_copies_are_constant_adds() -> Result<(), Error> {
        let config = unchecked();
        assert_eq!(
            OptimizingTranslator::translate(b"+++++[>+++<-]", &config)?,
            OptimizingTranslator::translate(b"+++++[-]>+++++++++++++++<", &config)?
        );
        Ok(())
    }

    #[test]
    fn offsets_exceeding_32_bits_are_rejected() -> Result<(), Error> {
        let config = unchecked();
        let mut translator = OptimizingTranslator::new(&config);
        translator.offset = i32::MAX - 1;
        translator.step(7, b'>')?;
        assert!(matches!(
            translator.step(8, b'>'),
            Err(Error::OffsetTooLarge { position: 8 })
        ));
        Ok(())
    }

    #[test]
    fn unmatched_brackets_in_skipped_loops() {
        let config = Config::default();
        assert!(matches!(
            OptimizingTranslator::translate(b"+[-]>[[]", &config),
            Err(Error::LoopNotClosed { position: 5 })
        ));
        assert!(matches!(
            OptimizingTranslator::translate(b"+[[-]", &config),
            Err(Error::LoopNotClosed { position: 1 })
        ));
    }
}
