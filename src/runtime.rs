//! Contains the I/O context of a running program and the hooks called by the
//! generated machine code.

use std::{
    cell::Cell,
    io::{stdin, stdout, BufWriter, ErrorKind, Read, Write},
    process::exit,
    ptr,
};

use log::warn;

/// Context for the Brainfuck execution environment.
pub struct Context<'a> {
    input: Option<Box<dyn Read + 'a>>,
    output: Option<Box<dyn Write + 'a>>,
}

thread_local! {
    /// The context of the program currently executing on this thread.
    static CURRENT: Cell<*mut Context<'static>> = const { Cell::new(ptr::null_mut()) };
}

/// Restores the previously installed context when dropped.
struct Installed(*mut Context<'static>);

impl Drop for Installed {
    fn drop(&mut self) {
        CURRENT.with(|cur| cur.set(self.0));
    }
}

impl<'a> Context<'a> {
    /// Create a new context for executing a Brainfuck program.
    pub fn new(input: Option<Box<dyn Read + 'a>>, output: Option<Box<dyn Write + 'a>>) -> Self {
        Context { input, output }
    }

    /// Create a new context that uses standard input and output.
    pub fn with_stdio() -> Self {
        Self::new(Some(Box::new(stdin())), Some(Box::new(BufWriter::new(stdout()))))
    }

    /// Create a new context that does not have any input or output.
    pub fn without_io() -> Self {
        Self::new(None, None)
    }

    /// Read one byte from the input. Returns [`None`] once the input is exhausted
    /// or if there is no input at all.
    pub fn input(&mut self) -> Option<u8> {
        self.flush();
        let input = self.input.as_mut()?;
        let mut result = [0];
        loop {
            return match input.read(&mut result) {
                Ok(0) => None,
                Ok(_) => Some(result[0]),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("failed to read input, treating it as exhausted: {err}");
                    None
                }
            };
        }
    }

    /// Write one byte to the output. Terminates the process if writing fails.
    pub fn output(&mut self, value: u8) {
        if let Some(output) = &mut self.output {
            if let Err(err) = output.write_all(&[value]) {
                warn!("failed to write output: {err}");
                exit(1);
            }
        }
    }

    /// Flush any buffered output.
    pub fn flush(&mut self) {
        if let Some(output) = &mut self.output {
            if let Err(err) = output.flush() {
                warn!("failed to flush output: {err}");
            }
        }
    }

    /// Run `f` with this context installed as the target of the runtime hooks on
    /// the current thread.
    pub(crate) fn enter<R>(&mut self, f: impl FnOnce() -> R) -> R {
        let this = (self as *mut Context<'a>).cast::<Context<'static>>();
        let _installed = Installed(CURRENT.with(|cur| cur.replace(this)));
        f()
    }
}

impl<'a> Drop for Context<'a> {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Apply `f` to the currently installed context, if there is one.
fn with_current<R>(f: impl FnOnce(&mut Context) -> R) -> Option<R> {
    let cxt = CURRENT.with(|cur| cur.get());
    // SAFETY: A non-null pointer was installed by `Context::enter`, which holds
    // a unique borrow of the context until the pointer is removed again.
    unsafe { cxt.as_mut() }.map(f)
}

/// Runtime function. Called when the program accesses a cell outside the tape.
pub(crate) extern "sysv64" fn tapejit_out_of_bounds() {
    with_current(|cxt| cxt.flush());
    eprintln!("error: out of bounds memory access");
    exit(1);
}

/// Runtime function. Print the given value to the output.
pub(crate) extern "sysv64" fn tapejit_output(value: u8) {
    with_current(|cxt| cxt.output(value));
}

/// Runtime function. Read a value from the input, or zero once it is exhausted.
pub(crate) extern "sysv64" fn tapejit_input_zero() -> u8 {
    with_current(|cxt| cxt.input()).flatten().unwrap_or(0)
}

/// Runtime function. Read a value from the input, or 255 once it is exhausted.
pub(crate) extern "sysv64" fn tapejit_input_minus_one() -> u8 {
    with_current(|cxt| cxt.input()).flatten().unwrap_or(u8::MAX)
}

/// Runtime function. Read a value from the input, or return `old` once it is
/// exhausted.
pub(crate) extern "sysv64" fn tapejit_input_unchanged(old: u8) -> u8 {
    with_current(|cxt| cxt.input()).flatten().unwrap_or(old)
}
