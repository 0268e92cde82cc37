//! Executes compiled programs by mapping their machine code into executable
//! memory and calling it with a tape.

use std::{fs, io, mem, num::NonZeroUsize, path::Path, ptr, slice};

use log::debug;

use crate::{codegen::CompiledCode, runtime::Context, Error};

/// Function type of the generated code. Takes the start and the end of the tape.
type TapeEntry = unsafe extern "sysv64" fn(start: *mut u8, end: *mut u8);

/// A region of memory mapped readable and executable.
pub struct ExecutableMemory {
    ptr: *mut u8,
    len: usize,
}

fn page_size() -> usize {
    // SAFETY: `sysconf` has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).ok().filter(|&size| size > 0).unwrap_or(4096)
}

impl ExecutableMemory {
    /// Map a fresh region, copy `code` into it and make it executable.
    pub fn new(code: &[u8]) -> Result<Self, Error> {
        let page = page_size();
        let len = code.len().max(1).div_ceil(page) * page;
        // SAFETY: Anonymous private mapping without a requested address.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::ExecutableMemory(io::Error::last_os_error()));
        }
        let memory = ExecutableMemory {
            ptr: ptr.cast(),
            len,
        };
        // SAFETY: The mapping is writable and at least `code.len()` bytes long.
        unsafe { ptr::copy_nonoverlapping(code.as_ptr(), memory.ptr, code.len()) };
        // SAFETY: The range is exactly the mapping created above.
        if unsafe { libc::mprotect(ptr, len, libc::PROT_READ | libc::PROT_EXEC) } != 0 {
            return Err(Error::ExecutableMemory(io::Error::last_os_error()));
        }
        debug!("mapped {} bytes of code into {len} bytes at {ptr:p}", code.len());
        Ok(memory)
    }

    /// The mapped bytes, including the padding up to the page size.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: The region is mapped readable for the lifetime of `self`.
        unsafe { slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        // SAFETY: `ptr` and `len` describe a mapping owned by `self`.
        if unsafe { libc::munmap(self.ptr.cast(), self.len) } != 0 {
            debug!("failed to unmap code: {}", io::Error::last_os_error());
        }
    }
}

impl CompiledCode {
    /// Wrap machine code produced elsewhere, for example by [`Self::save`].
    ///
    /// # Safety
    /// The code must have been generated by this crate in the same process, since
    /// it embeds the addresses of the runtime hooks. `bounds_checked` must match
    /// the configuration it was compiled with.
    pub unsafe fn from_raw(code: Vec<u8>, bounds_checked: bool) -> Self {
        CompiledCode {
            code,
            bounds_checked,
        }
    }

    /// The generated machine code.
    pub fn bytes(&self) -> &[u8] {
        &self.code
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Whether every pointer movement of the code is checked against the tape.
    pub fn bounds_checked(&self) -> bool {
        self.bounds_checked
    }

    /// Write the raw machine code to the file at `path`.
    pub fn save(&self, path: &Path) -> Result<(), Error> {
        fs::write(path, &self.code).map_err(|source| Error::DumpWrite {
            path: path.to_owned(),
            source,
        })
    }

    /// Execute the code on a fresh zeroed tape of `tape_size` cells.
    pub fn run(&self, tape_size: NonZeroUsize, cxt: &mut Context) -> Result<(), Error> {
        let mut tape = vec![0; tape_size.get()];
        self.run_on_tape(&mut tape, cxt)
    }

    /// Execute the code on the given tape, starting at its first cell. The code
    /// must have been compiled with bounds checks.
    pub fn run_on_tape(&self, tape: &mut [u8], cxt: &mut Context) -> Result<(), Error> {
        if !self.bounds_checked {
            return Err(Error::UncheckedCode);
        }
        // SAFETY: Checked code never accesses memory outside of the tape.
        unsafe { self.run_unchecked(tape, cxt) }
    }

    /// Execute the code on the given tape, even if it was compiled without bounds
    /// checks.
    ///
    /// # Safety
    /// If the code is not bounds checked, the program must not move the pointer
    /// outside of `tape`.
    pub unsafe fn run_unchecked(&self, tape: &mut [u8], cxt: &mut Context) -> Result<(), Error> {
        if tape.is_empty() {
            return Err(Error::EmptyTape);
        }
        let memory = ExecutableMemory::new(&self.code)?;
        let range = tape.as_mut_ptr_range();
        cxt.enter(|| {
            // SAFETY: The memory contains a complete function with this signature.
            unsafe {
                let entry = mem::transmute::<*mut u8, TapeEntry>(memory.ptr);
                entry(range.start, range.end);
            }
        });
        cxt.flush();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::env;

    use super::ExecutableMemory;
    use crate::{compile, CompiledCode, Config, Context, EofPolicy, Error};

    #[test]
    fn mapping_is_page_aligned() -> Result<(), Error> {
        let memory = ExecutableMemory::new(&[0xc3])?;
        assert_eq!(memory.as_bytes()[0], 0xc3);
        assert_eq!(memory.as_bytes().len() % super::page_size(), 0);
        Ok(())
    }

    #[test]
    fn unchecked_code_is_refused() -> Result<(), Error> {
        let config = Config {
            bounds_checking: false,
            ..Config::default()
        };
        let code = compile(b"+.", &config)?;
        let mut tape = [0; 4];
        assert!(matches!(
            code.run_on_tape(&mut tape, &mut Context::without_io()),
            Err(Error::UncheckedCode)
        ));
        assert!(matches!(
            code.run(config.tape_size, &mut Context::without_io()),
            Err(Error::UncheckedCode)
        ));
        Ok(())
    }

    #[test]
    fn empty_tape_is_refused() -> Result<(), Error> {
        let code = compile(b"+", &Config::default())?;
        assert!(matches!(
            code.run_on_tape(&mut [], &mut Context::without_io()),
            Err(Error::EmptyTape)
        ));
        Ok(())
    }

    #[test]
    fn unchecked_code_runs_unchecked() -> Result<(), Error> {
        let config = Config {
            bounds_checking: false,
            eof: EofPolicy::MinusOne,
            ..Config::default()
        };
        let code = compile(b"+++>,>++[<+>-]", &config)?;
        let mut tape = [0; 3];
        // SAFETY: The program only touches the first three cells.
        unsafe { code.run_unchecked(&mut tape, &mut Context::without_io())? };
        assert_eq!(tape, [3, 1, 0]);
        Ok(())
    }

    #[test]
    fn saved_code_can_be_reloaded() -> Result<(), Error> {
        let code = compile(b"++++++++[>++++++++<-]>+.", &Config::default())?;
        let path = env::temp_dir().join(format!("tapejit-save-{}.bin", std::process::id()));
        code.save(&path)?;
        let bytes = std::fs::read(&path).map_err(|source| Error::SourceRead {
            path: path.clone(),
            source,
        })?;
        let _ = std::fs::remove_file(&path);
        assert_eq!(bytes, code.bytes());
        // SAFETY: The bytes were generated in this process with bounds checks.
        let reloaded = unsafe { CompiledCode::from_raw(bytes, true) };
        let mut buf = Vec::new();
        let mut cxt = Context::new(None, Some(Box::new(&mut buf)));
        reloaded.run(Config::default().tape_size, &mut cxt)?;
        drop(cxt);
        assert_eq!(buf, b"A");
        Ok(())
    }

    #[test]
    fn save_reports_path_on_failure() -> Result<(), Error> {
        let code = compile(b"+", &Config::default())?;
        let path = env::temp_dir().join("tapejit-missing-dir").join("code.bin");
        match code.save(&path) {
            Err(Error::DumpWrite { path: failed, .. }) => assert_eq!(failed, path),
            other => panic!("unexpected result {other:?}"),
        }
        Ok(())
    }
}
