//! Runtime traps: the terminal error a machine state carries when the
//! program performs an invalid operation. A trap halts stepping: the
//! errored state is returned unchanged by further steps and is never
//! retried. The budget and interruption outcomes of the stepping loop are
//! deliberately not traps; they live with the stepper.

use serde::Serialize;
use thiserror::Error;

use crate::memory::MemError;

#[derive(Debug, Clone, Error, PartialEq, Serialize)]
pub enum Trap {
    #[error("null dereference at 0x{address:x}")]
    NullDereference { address: u64 },
    #[error("invalid access at 0x{address:x} ({len} bytes)")]
    InvalidAccess { address: u64, len: u64 },
    #[error("use after free at 0x{address:x}")]
    UseAfterFree { address: u64 },
    #[error("double free at 0x{address:x}")]
    DoubleFree { address: u64 },
    #[error("free of non-block address 0x{address:x}")]
    InvalidFree { address: u64 },
    #[error("out of memory: requested {requested} bytes of a {limit} byte heap")]
    OutOfMemory { requested: u64, limit: u64 },
    #[error("stack overflow: requested {requested} bytes of a {limit} byte stack")]
    StackOverflow { requested: u64, limit: u64 },
    #[error("division by zero")]
    DivisionByZero,
    #[error("integer overflow in {op}")]
    IntegerOverflow { op: &'static str },
    #[error("expected {expected}, got {got}")]
    TypeMismatch { expected: String, got: String },
    #[error("operand stack underflow")]
    OperandStackUnderflow,
    #[error("invalid allocation size {size}")]
    InvalidAllocSize { size: i64 },
    #[error("unknown variable `{name}`")]
    UnknownVariable { name: String },
    #[error("unknown function `{name}`")]
    UnknownFunction { name: String },
    #[error("`{function}` expects {expected} arguments, got {got}")]
    ArgumentCountMismatch {
        function: String,
        expected: usize,
        got: usize,
    },
    #[error("bad format string: {message}")]
    BadFormat { message: String },
    #[error("invalid string in memory: {message}")]
    InvalidString { message: String },
    #[error("input exhausted")]
    InputExhausted,
    #[error("malformed input token `{token}`")]
    MalformedInput { token: String },
    #[error("type `{ty}` has no known size")]
    UnsizedType { ty: String },
    #[error("no active frame")]
    NoActiveFrame,
    #[error("startup never reached user code after {steps} steps")]
    StartupOverrun { steps: u64 },
}

impl From<MemError> for Trap {
    fn from(err: MemError) -> Self {
        match err {
            MemError::Null { address } => Trap::NullDereference { address },
            MemError::Unmapped { address, len } => Trap::InvalidAccess { address, len },
            MemError::UseAfterFree { address } => Trap::UseAfterFree { address },
            MemError::DoubleFree { address } => Trap::DoubleFree { address },
            MemError::InvalidFree { address } => Trap::InvalidFree { address },
            MemError::OutOfMemory { requested, limit } => Trap::OutOfMemory { requested, limit },
            MemError::StackOverflow { requested, limit } => {
                Trap::StackOverflow { requested, limit }
            }
            MemError::NotScalar { ty } => Trap::UnsizedType { ty },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_errors_map_to_traps() {
        let trap: Trap = MemError::UseAfterFree { address: 0x2000 }.into();
        assert_eq!(trap, Trap::UseAfterFree { address: 0x2000 });
        assert_eq!(trap.to_string(), "use after free at 0x2000");
    }
}
