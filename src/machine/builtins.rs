//! Host-provided native functions.
//!
//! Builtins never touch the state directly. Each one inspects the current
//! state and its arguments, then describes what should happen as a list of
//! effects plus an optional result value; the machine folds those effects
//! like any decoded node. That keeps every builtin replayable and lets a
//! host register its own without learning the applier internals.

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::machine::effects::Effect;
use crate::machine::errors::Trap;
use crate::machine::state::MachineState;
use crate::memory::{MemoryStore, Reference, Scalar};
use crate::program::TypeDesc;

/// Bytes scanned before giving up on finding a string terminator.
const STRING_READ_LIMIT: usize = 10_000;

/// What a builtin asks the machine to do.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltinOutcome {
    /// Applied in order after the call's arguments are popped.
    pub effects: Vec<Effect>,
    /// Pushed on the caller's operand stack after the effects run.
    pub result: Option<Scalar>,
}

pub type BuiltinFn =
    Arc<dyn Fn(&MachineState, &[Scalar]) -> Result<BuiltinOutcome, Trap> + Send + Sync>;

/// Name-keyed table of native functions, consulted for calls that match no
/// declared function.
#[derive(Clone, Default)]
pub struct Builtins {
    table: FxHashMap<String, BuiltinFn>,
}

impl Builtins {
    pub fn new() -> Self {
        Builtins::default()
    }

    pub fn register<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&MachineState, &[Scalar]) -> Result<BuiltinOutcome, Trap> + Send + Sync + 'static,
    {
        self.table.insert(name.to_string(), Arc::new(f));
    }

    pub fn get(&self, name: &str) -> Option<&BuiltinFn> {
        self.table.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.contains_key(name)
    }
}

impl fmt::Debug for Builtins {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.table.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("Builtins").field("names", &names).finish()
    }
}

/// The stock C-flavored table: `printf`, `scanf`, `malloc`, `free`.
pub fn default_builtins() -> Builtins {
    let mut builtins = Builtins::new();
    builtins.register("printf", builtin_printf);
    builtins.register("scanf", builtin_scanf);
    builtins.register("malloc", builtin_malloc);
    builtins.register("free", builtin_free);
    builtins
}

fn builtin_printf(state: &MachineState, args: &[Scalar]) -> Result<BuiltinOutcome, Trap> {
    let format_ptr = args
        .first()
        .and_then(Scalar::as_pointer)
        .ok_or_else(|| Trap::BadFormat {
            message: "printf needs a format string pointer".to_string(),
        })?;
    let format = read_c_string(&state.memory, format_ptr)?;
    let text = format_output(&format, &args[1..], &state.memory)?;
    let written = text.len() as i32;
    Ok(BuiltinOutcome {
        effects: vec![Effect::Write(text)],
        result: Some(Scalar::Int(written)),
    })
}

fn builtin_scanf(state: &MachineState, args: &[Scalar]) -> Result<BuiltinOutcome, Trap> {
    let format_ptr = args
        .first()
        .and_then(Scalar::as_pointer)
        .ok_or_else(|| Trap::BadFormat {
            message: "scanf needs a format string pointer".to_string(),
        })?;
    let format = read_c_string(&state.memory, format_ptr)?;

    let mut dests = args[1..].iter();
    let mut effects = Vec::new();
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        // Literal text and whitespace are both satisfied by tokenization.
        if c != '%' {
            continue;
        }
        let spec = chars.next().ok_or_else(|| Trap::BadFormat {
            message: "format string ends mid-specifier".to_string(),
        })?;
        if spec == '%' {
            continue;
        }
        let dest = dests
            .next()
            .and_then(Scalar::as_pointer)
            .ok_or_else(|| Trap::BadFormat {
                message: format!("no destination pointer for %{spec}"),
            })?;
        let ty = match spec {
            'd' | 'u' => TypeDesc::Int,
            'c' => TypeDesc::Char,
            's' => TypeDesc::Char.array_of(None),
            other => {
                return Err(Trap::BadFormat {
                    message: format!("unsupported conversion %{other}"),
                })
            }
        };
        effects.push(Effect::InputRead {
            dest: Reference::new(dest, ty),
        });
    }

    let conversions = effects.len() as i32;
    Ok(BuiltinOutcome {
        effects,
        result: Some(Scalar::Int(conversions)),
    })
}

fn builtin_malloc(_state: &MachineState, args: &[Scalar]) -> Result<BuiltinOutcome, Trap> {
    if args.len() != 1 {
        return Err(Trap::ArgumentCountMismatch {
            function: "malloc".to_string(),
            expected: 1,
            got: args.len(),
        });
    }
    let size = args[0].as_arith().ok_or_else(|| Trap::TypeMismatch {
        expected: "int".to_string(),
        got: args[0].kind_name().to_string(),
    })?;
    if size <= 0 {
        return Err(Trap::InvalidAllocSize { size: size as i64 });
    }
    // The allocation effect pushes the block address itself.
    Ok(BuiltinOutcome {
        effects: vec![Effect::Alloc { size: size as u64 }],
        result: None,
    })
}

fn builtin_free(_state: &MachineState, args: &[Scalar]) -> Result<BuiltinOutcome, Trap> {
    if args.len() != 1 {
        return Err(Trap::ArgumentCountMismatch {
            function: "free".to_string(),
            expected: 1,
            got: args.len(),
        });
    }
    match args[0] {
        Scalar::Pointer(0) => Ok(BuiltinOutcome {
            effects: Vec::new(),
            result: Some(Scalar::Int(0)),
        }),
        Scalar::Pointer(address) => Ok(BuiltinOutcome {
            effects: vec![Effect::Release { address }],
            result: Some(Scalar::Int(0)),
        }),
        ref other => Err(Trap::TypeMismatch {
            expected: "pointer".to_string(),
            got: other.kind_name().to_string(),
        }),
    }
}

/// Reads a NUL-terminated string out of memory.
pub fn read_c_string(memory: &MemoryStore, address: u64) -> Result<String, Trap> {
    let mut bytes = Vec::new();
    let mut cursor = address;
    loop {
        if bytes.len() >= STRING_READ_LIMIT {
            return Err(Trap::InvalidString {
                message: format!("no terminator within {STRING_READ_LIMIT} bytes of {address:#x}"),
            });
        }
        let byte = memory.read_bytes(cursor, 1)?[0];
        if byte == 0 {
            break;
        }
        bytes.push(byte);
        cursor += 1;
    }
    String::from_utf8(bytes).map_err(|_| Trap::InvalidString {
        message: format!("bytes at {address:#x} are not valid UTF-8"),
    })
}

fn format_output(format: &str, args: &[Scalar], memory: &MemoryStore) -> Result<String, Trap> {
    let mut out = String::with_capacity(format.len());
    let mut pending = args.iter();
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let spec = chars.next().ok_or_else(|| Trap::BadFormat {
            message: "format string ends mid-specifier".to_string(),
        })?;
        if spec == '%' {
            out.push('%');
            continue;
        }
        let arg = pending.next().ok_or_else(|| Trap::BadFormat {
            message: format!("no argument for %{spec}"),
        })?;
        match spec {
            'd' => {
                let n = arg.as_arith().ok_or_else(|| bad_argument(spec, arg))?;
                out.push_str(&n.to_string());
            }
            'u' => {
                let n = arg.as_arith().ok_or_else(|| bad_argument(spec, arg))?;
                out.push_str(&(n as u32).to_string());
            }
            'x' => {
                let n = arg.as_arith().ok_or_else(|| bad_argument(spec, arg))?;
                out.push_str(&format!("{:x}", n as u32));
            }
            'c' => {
                let n = arg.as_arith().ok_or_else(|| bad_argument(spec, arg))?;
                out.push(n as u8 as char);
            }
            's' => {
                let address = arg.as_pointer().ok_or_else(|| bad_argument(spec, arg))?;
                out.push_str(&read_c_string(memory, address)?);
            }
            other => {
                return Err(Trap::BadFormat {
                    message: format!("unsupported conversion %{other}"),
                })
            }
        }
    }
    Ok(out)
}

fn bad_argument(spec: char, got: &Scalar) -> Trap {
    Trap::BadFormat {
        message: format!("%{spec} cannot format {}", got.kind_name()),
    }
}
