//! The abstract machine.
//!
//! * [`engine`] decodes control nodes and folds their effects over states.
//! * [`effects`] defines the effect vocabulary and its appliers.
//! * [`state`] holds the immutable snapshot types.
//! * [`builtins`] is the table of host-provided native functions.
//! * [`terminal`] and [`input`] model the two ends of program I/O.
//! * [`errors`] defines the trap taxonomy.
//!
//! A [`Machine`] is cheap to share and never mutates; every transition
//! yields a fresh [`MachineState`] while the predecessor stays valid, which
//! is what makes snapshot history and replay trivial upstream.

pub mod builtins;
pub mod effects;
pub mod engine;
pub mod errors;
pub mod input;
pub mod state;
pub mod terminal;

pub use builtins::{default_builtins, BuiltinFn, BuiltinOutcome, Builtins};
pub use effects::Effect;
pub use engine::{InputPolicy, Machine, MachineOptions};
pub use errors::Trap;
pub use input::InputStream;
pub use state::{Control, Frame, MachineState};
pub use terminal::TermBuffer;
