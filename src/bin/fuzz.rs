//! Small application that performs differential fuzzing of the translators by
//! comparing every configuration against a simple interpreter.

use std::{
    collections::hash_map::RandomState,
    fs,
    hash::{BuildHasher, DefaultHasher, Hash, Hasher},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use clap::Parser;

use tapejit::{compile, Config, Context, EofPolicy, Error, Mode};

/// Number of cells of the tape used by all runs.
const TAPE_SIZE: usize = 64;

/// Number of instructions the interpreter executes before giving up.
const STEP_LIMIT: usize = 100_000;

const EOF_POLICIES: [EofPolicy; 3] = [EofPolicy::Zero, EofPolicy::MinusOne, EofPolicy::Unchanged];

#[derive(Parser)]
#[command(about = "Differential fuzzing of the optimizing and naive translators")]
struct Cli {
    /// Run again all the stored failed examples
    #[arg(long)]
    recheck: bool,

    /// Run the example in this file and try to make it smaller
    #[arg(long, value_name = "FILE")]
    minimize: Option<PathBuf>,

    /// Store or load failed examples in this directory
    #[arg(short, long, default_value = "fuzz-errors")]
    dir: PathBuf,

    /// Don't generate code longer than this many bytes
    #[arg(short, long, default_value_t = 64)]
    max_len: usize,
}

/// Output and final tape of one execution.
type Outcome = (Vec<u8>, Vec<u8>);

/// Generate a random Brainfuck program. The program is guaranteed to be syntactically
/// valid, but might not terminate or leave the tape.
fn generate_code(hasher: &mut impl Hasher, max_len: usize) -> String {
    let mut str = String::from(">>>>>>>>");
    let mut open = 0;
    while str.len() + open < max_len {
        hasher.write_usize(str.len());
        match hasher.finish() % 10 {
            0 | 1 => str.push('+'),
            2 | 3 => str.push('-'),
            4 => str.push('<'),
            5 => str.push('>'),
            6 => str.push(','),
            7 => str.push('.'),
            8 => {
                if open > 0 {
                    open -= 1;
                    str.push(']');
                }
            }
            _ => {
                str.push('[');
                open += 1
            }
        }
    }
    for _ in 0..open {
        str.push(']');
    }
    return str;
}

/// The input given to every execution. Short enough for the end of the input to
/// be reached by some programs.
fn input() -> Vec<u8> {
    (0..16).map(|i| (183 * i + 7) as u8).collect()
}

/// Interpret the code directly. Returns [`None`] if the program leaves the tape,
/// does not finish within the step limit or has unbalanced brackets.
fn interpret(code: &[u8], eof: EofPolicy) -> Option<Outcome> {
    let mut jumps = vec![0; code.len()];
    let mut open = Vec::new();
    for (i, &byte) in code.iter().enumerate() {
        if byte == b'[' {
            open.push(i);
        } else if byte == b']' {
            let start = open.pop()?;
            jumps[start] = i;
            jumps[i] = start;
        }
    }
    if !open.is_empty() {
        return None;
    }
    let input = input();
    let mut input = input.iter();
    let mut tape = vec![0u8; TAPE_SIZE];
    let mut output = Vec::new();
    let mut ptr = 0usize;
    let mut pc = 0;
    for _ in 0..STEP_LIMIT {
        let Some(&byte) = code.get(pc) else {
            return Some((output, tape));
        };
        match byte {
            b'+' => tape[ptr] = tape[ptr].wrapping_add(1),
            b'-' => tape[ptr] = tape[ptr].wrapping_sub(1),
            b'>' => ptr = ptr.checked_add(1).filter(|&p| p < TAPE_SIZE)?,
            b'<' => ptr = ptr.checked_sub(1)?,
            b'.' => output.push(tape[ptr]),
            b',' => {
                tape[ptr] = match (input.next(), eof) {
                    (Some(&value), _) => value,
                    (None, EofPolicy::Zero) => 0,
                    (None, EofPolicy::MinusOne) => u8::MAX,
                    (None, EofPolicy::Unchanged) => tape[ptr],
                }
            }
            b'[' if tape[ptr] == 0 => pc = jumps[pc],
            b']' if tape[ptr] != 0 => pc = jumps[pc],
            _ => { /* Comments and not taken branches. */ }
        }
        pc += 1;
    }
    return None;
}

/// Compile and run the code in the given configuration.
fn execute(code: &[u8], config: &Config) -> Result<Outcome, Error> {
    let compiled = compile(code, config)?;
    let input = input();
    let mut output = Vec::new();
    let mut tape = vec![0; TAPE_SIZE];
    let mut cxt = Context::new(Some(Box::new(&input[..])), Some(Box::new(&mut output)));
    if config.bounds_checking {
        compiled.run_on_tape(&mut tape, &mut cxt)?;
    } else {
        // SAFETY: The interpreter has verified that the program stays on the tape.
        unsafe { compiled.run_unchecked(&mut tape, &mut cxt)? };
    }
    drop(cxt);
    return Ok((output, tape));
}

/// Check the code by executing it in every configuration. Tests that the output
/// and final tape are identical to the interpreter. Programs the interpreter
/// rejects are considered correct.
fn check_code(code: &str) -> bool {
    for eof in EOF_POLICIES {
        let Some(expected) = interpret(code.as_bytes(), eof) else {
            return true;
        };
        for mode in [Mode::Optimizing, Mode::Naive] {
            for bounds_checking in [true, false] {
                let config = Config {
                    bounds_checking,
                    eof,
                    mode,
                    ..Config::default()
                };
                match execute(code.as_bytes(), &config) {
                    Ok(outcome) if outcome == expected => {}
                    _ => return false,
                }
            }
        }
    }
    return true;
}

/// Remove the instruction at `i`. Brackets are removed together with their
/// partner, either keeping or dropping the loop body.
fn remove_at(code: &str, i: usize, keep_body: bool) -> String {
    let bytes = code.as_bytes();
    let partner = |step: isize| {
        let mut depth = 0;
        let mut j = i as isize;
        loop {
            match bytes[j as usize] {
                b'[' => depth += 1,
                b']' => depth -= 1,
                _ => {}
            }
            if depth == 0 {
                return j as usize;
            }
            j += step;
        }
    };
    let (start, end) = match bytes[i] {
        b'[' => (i, partner(1)),
        b']' => (partner(-1), i),
        _ => return code[..i].to_owned() + &code[i + 1..],
    };
    if keep_body {
        code[..start].to_owned() + &code[start + 1..end] + &code[end + 1..]
    } else {
        code[..start].to_owned() + &code[end + 1..]
    }
}

/// Delete some random instructions such that the code still fails.
fn minimize_code(hasher: &mut impl Hasher, code: String) -> String {
    if code.is_empty() {
        return code;
    }
    hasher.write_usize(code.len());
    let skip = hasher.finish() as usize % code.len();
    for i in (0..code.len()).cycle().skip(skip).take(code.len()) {
        for keep_body in [false, true] {
            let next = remove_at(&code, i, keep_body);
            if !check_code(&next) {
                return minimize_code(hasher, next);
            }
        }
    }
    return code;
}

/// Store the failing example in `dir` under a name derived from its content.
fn store_failure(dir: &Path, code: &str) {
    let mut hasher = DefaultHasher::new();
    code.hash(&mut hasher);
    let path = dir.join(hasher.finish().to_string() + ".b");
    if let Err(err) = fs::write(&path, code) {
        eprintln!("failed to write `{}`: {err}", path.display());
    }
}

/// Print the current number of successful and failed code samples.
fn print_status(success: usize, failure: usize) {
    println!("success: {success}, failure: {failure}");
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    let mut success = 0;
    let mut failure = 0;
    if let Err(err) = fs::create_dir_all(&cli.dir) {
        eprintln!("failed to create `{}`: {err}", cli.dir.display());
        return;
    }
    if let Some(file) = &cli.minimize {
        let content = match fs::read_to_string(file) {
            Ok(content) => content,
            Err(err) => {
                eprintln!("failed to read `{}`: {err}", file.display());
                return;
            }
        };
        let mut hasher = RandomState::new().build_hasher();
        for i in 0..100 {
            hasher.write_usize(i);
            let code = minimize_code(&mut hasher, content.clone());
            store_failure(&cli.dir, &code);
        }
    } else if cli.recheck {
        let entries = match fs::read_dir(&cli.dir) {
            Ok(entries) => entries,
            Err(err) => {
                eprintln!("failed to read `{}`: {err}", cli.dir.display());
                return;
            }
        };
        for file in entries.flatten().map(|entry| entry.path()) {
            let Ok(code) = fs::read_to_string(&file) else {
                continue;
            };
            if check_code(&code) {
                success += 1;
                let _ = fs::remove_file(file);
            } else {
                failure += 1;
            }
        }
        print_status(success, failure);
    } else {
        let mut last = Instant::now();
        let mut hasher = RandomState::new().build_hasher();
        for i in 0.. {
            hasher.write_usize(i);
            let code = generate_code(&mut hasher, cli.max_len);
            if check_code(&code) {
                success += 1;
            } else {
                failure += 1;
                let code = minimize_code(&mut hasher, code);
                store_failure(&cli.dir, &code);
            }
            let now = Instant::now();
            if now.duration_since(last) > Duration::from_secs(2) {
                print_status(success, failure);
                last = now;
            }
        }
    }
}
