//! # Introduction
//!
//! Glassbox is the execution core of an educational debugger: it runs a
//! lowered program one observable step at a time, keeps every byte of its
//! memory inspectable, and remembers enough about past accesses to answer
//! "what was here before?" for any variable on screen.
//!
//! ## Execution pipeline
//!
//! ```text
//! Program → Machine (decode → effects) → MachineState → History
//!                                            ↓
//!                                      views / replay
//! ```
//!
//! 1. [`program`]: the lowered program contract. Control nodes, types,
//!    view directives, and builders a front end targets.
//! 2. [`machine`]: the abstract machine. Immutable [`machine::MachineState`]
//!    snapshots advanced by atomic effect-folding steps.
//! 3. [`memory`]: flat byte memory with a rank-ordered access log; answers
//!    overlap queries and reconstructs pre-store values.
//! 4. [`stepper`]: stepping modes (`into`, `expr`, `over`, `out`, `run`)
//!    with an interrupt flag, a step budget, and undo/redo built on
//!    [`history`].
//! 5. [`views`]: budgeted, serializable variable and frame views, plus an
//!    object-graph inspector for dynamic-language runtimes.
//! 6. [`replay`]: parser for recorded session streams.
//!
//! ## Supported program shapes
//!
//! Scalar types: `int`, `char`, pointers; fixed and unknown-length arrays.
//! Control: conditional and unconditional jumps, calls, scoped blocks.
//! Built-ins: `printf`, `scanf`, `malloc`, `free`, plus host-registered
//! natives.

pub mod history;
pub mod machine;
pub mod memory;
pub mod program;
pub mod replay;
pub mod stepper;
pub mod views;
