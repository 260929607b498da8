//! Flat byte-addressable memory with load/store provenance.
//!
//! This module provides the memory abstractions of the engine:
//! - [`store`]: persistent paged memory image, stack/heap regions, access log
//! - [`log`]: append-only, rank-ordered record of load/store operations
//!
//! # Type Sizes
//!
//! Fixed, platform-independent sizes, little-endian throughout:
//! - `int`: 4 bytes
//! - `char`: 1 byte
//! - `pointer`: 8 bytes (regardless of pointee type)
//! - arrays: element size times count (no padding)
//!
//! # Aliasing
//!
//! Whether two references touch the same storage is decided by
//! [`refs_overlap`] alone, using inclusive base/limit interval arithmetic
//! over the flat address space, never identity. A read of a sub-range
//! therefore sees the effect of a wider write and vice versa.

pub mod log;
pub mod store;

pub use log::{AccessKind, AccessSummary, LogEntry, MemoryLog};
pub use store::{MemError, MemoryStore};

use std::fmt;

use serde::Serialize;

use crate::program::TypeDesc;

/// A machine-level scalar: the unit the operand stack and memory cells
/// trade in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Scalar {
    Int(i32),
    Char(i8),
    Pointer(u64),
}

impl Scalar {
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Scalar::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Arithmetic reading: chars promote to int, pointers do not participate.
    pub fn as_arith(&self) -> Option<i32> {
        match self {
            Scalar::Int(n) => Some(*n),
            Scalar::Char(c) => Some(*c as i32),
            Scalar::Pointer(_) => None,
        }
    }

    pub fn as_pointer(&self) -> Option<u64> {
        match self {
            Scalar::Pointer(address) => Some(*address),
            _ => None,
        }
    }

    /// Truth test for conditional jumps: nonzero value or non-null pointer.
    pub fn as_condition(&self) -> bool {
        match self {
            Scalar::Int(n) => *n != 0,
            Scalar::Char(c) => *c != 0,
            Scalar::Pointer(address) => *address != 0,
        }
    }

    /// Convert `self` for storage into a cell of type `ty`, applying the
    /// implicit int/char conversions. `None` when no conversion exists.
    pub fn coerce_to(&self, ty: &TypeDesc) -> Option<Scalar> {
        match (self, ty) {
            (Scalar::Int(n), TypeDesc::Int) => Some(Scalar::Int(*n)),
            (Scalar::Int(n), TypeDesc::Char) => Some(Scalar::Char(*n as i8)),
            (Scalar::Char(c), TypeDesc::Char) => Some(Scalar::Char(*c)),
            (Scalar::Char(c), TypeDesc::Int) => Some(Scalar::Int(*c as i32)),
            (Scalar::Pointer(address), TypeDesc::Pointer(_)) => Some(Scalar::Pointer(*address)),
            _ => None,
        }
    }

    /// Name of the scalar's kind, for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Scalar::Int(_) => "int",
            Scalar::Char(_) => "char",
            Scalar::Pointer(_) => "pointer",
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Int(n) => write!(f, "{}", n),
            Scalar::Char(c) => {
                let byte = *c as u8;
                if byte.is_ascii_graphic() || byte == b' ' {
                    write!(f, "'{}'", byte as char)
                } else {
                    write!(f, "'\\x{:02x}'", byte)
                }
            }
            Scalar::Pointer(0) => write!(f, "NULL"),
            Scalar::Pointer(address) => write!(f, "0x{:08x}", address),
        }
    }
}

/// An address plus a pointee type descriptor: the unit of aliasing
/// reasoning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reference {
    pub address: u64,
    pub ty: TypeDesc,
}

impl Reference {
    pub fn new(address: u64, ty: TypeDesc) -> Self {
        Reference { address, ty }
    }

    pub fn size_bytes(&self) -> Option<u64> {
        self.ty.size_bytes()
    }
}

/// Inclusive base/limit interval overlap, the sole aliasing test.
///
/// Two ranges intersect unless one lies entirely before the other.
/// References without a static size (unknown-count arrays) and zero-sized
/// ranges overlap nothing.
pub fn refs_overlap(a: &Reference, b: &Reference) -> bool {
    let (Some(size_a), Some(size_b)) = (a.size_bytes(), b.size_bytes()) else {
        return false;
    };
    if size_a == 0 || size_b == 0 {
        return false;
    }
    let limit_a = a.address + size_a - 1;
    let limit_b = b.address + size_b - 1;
    if a.address <= b.address {
        b.address <= limit_a
    } else {
        a.address <= limit_b
    }
}

/// Little-endian encoding of `value`: backing buffer plus significant length.
pub fn encode_scalar(value: Scalar) -> ([u8; 8], usize) {
    let mut buf = [0u8; 8];
    match value {
        Scalar::Int(n) => {
            buf[..4].copy_from_slice(&n.to_le_bytes());
            (buf, 4)
        }
        Scalar::Char(c) => {
            buf[0] = c as u8;
            (buf, 1)
        }
        Scalar::Pointer(address) => {
            buf.copy_from_slice(&address.to_le_bytes());
            (buf, 8)
        }
    }
}

/// Decode `bytes` as a scalar of type `ty`. `None` for non-scalar types or
/// a length mismatch.
pub fn decode_scalar(ty: &TypeDesc, bytes: &[u8]) -> Option<Scalar> {
    match ty {
        TypeDesc::Int => {
            let raw: [u8; 4] = bytes.try_into().ok()?;
            Some(Scalar::Int(i32::from_le_bytes(raw)))
        }
        TypeDesc::Char => {
            let raw: [u8; 1] = bytes.try_into().ok()?;
            Some(Scalar::Char(raw[0] as i8))
        }
        TypeDesc::Pointer(_) | TypeDesc::Function => {
            let raw: [u8; 8] = bytes.try_into().ok()?;
            Some(Scalar::Pointer(u64::from_le_bytes(raw)))
        }
        TypeDesc::Array { .. } => None,
    }
}
