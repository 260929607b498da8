//! Immutable execution snapshots.
//!
//! A [`MachineState`] captures everything about one instant of a running
//! program: the control position, the call stack, memory, terminal output,
//! and pending input. States are never mutated in place once published;
//! [`crate::machine::Machine::step`] clones the current state and returns a
//! new one, and the clone is cheap because the memory store and input stream
//! share their bulk through [`std::sync::Arc`].

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::machine::errors::Trap;
use crate::machine::input::InputStream;
use crate::machine::terminal::TermBuffer;
use crate::memory::{MemoryStore, Reference, Scalar};
use crate::program::Directive;

/// A control position: the function being executed and the index of the
/// node about to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Control {
    /// Index into [`crate::program::Program::functions`].
    pub function: usize,
    /// Index into the function body. May equal the body length, which
    /// decodes as an implicit `return`.
    pub pc: usize,
}

impl Control {
    pub fn new(function: usize, pc: usize) -> Self {
        Control { function, pc }
    }
}

/// One activation record on the call stack.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Index of the function this frame executes.
    pub function: usize,
    /// Argument values as passed at the call site, kept for display.
    pub args: Vec<Scalar>,
    locals: FxHashMap<String, Reference>,
    local_names: Vec<String>,
    /// Block nesting depth. Incremented on scope entry, decremented on exit.
    pub scope_key: u32,
    /// Active view directives. Starts as the function's own directives and
    /// is replaced wholesale when a scope carrying directives is entered.
    pub directives: Vec<Directive>,
    /// The `scope_key` at which [`Frame::directives`] was installed. When a
    /// scope exit drops below this key the directives are stale and cleared.
    pub directives_key: u32,
    /// The node from which this frame last called into another function.
    /// Used to highlight the suspended position while a callee runs.
    pub call_site: Option<Control>,
    /// Where execution resumes when this frame returns. `None` for the
    /// entry frame, whose return terminates the program.
    pub return_control: Option<Control>,
    /// Stack cursor to restore when this frame is popped.
    pub saved_stack_top: u64,
    /// Expression operand stack, empty at every statement boundary.
    pub operands: Vec<Scalar>,
}

impl Frame {
    pub(crate) fn new(
        function: usize,
        args: Vec<Scalar>,
        directives: Vec<Directive>,
        return_control: Option<Control>,
        call_site: Option<Control>,
        saved_stack_top: u64,
    ) -> Self {
        Frame {
            function,
            args,
            locals: FxHashMap::default(),
            local_names: Vec::new(),
            scope_key: 0,
            directives,
            directives_key: 0,
            call_site,
            return_control,
            saved_stack_top,
            operands: Vec::new(),
        }
    }

    /// Looks up a local variable by name.
    pub fn local(&self, name: &str) -> Option<&Reference> {
        self.locals.get(name)
    }

    /// Local names in declaration order. A redeclared name keeps its
    /// original position rather than appearing twice.
    pub fn local_names(&self) -> &[String] {
        &self.local_names
    }

    pub(crate) fn declare_local(&mut self, name: &str, reference: Reference) {
        if self.locals.insert(name.to_string(), reference).is_none() {
            self.local_names.push(name.to_string());
        }
    }
}

/// A complete snapshot of the machine at one instant.
///
/// Cloning is cheap: memory pages, the access log, and the input token list
/// are shared behind `Arc` and only copied when a successor state writes
/// through them.
#[derive(Debug, Clone)]
pub struct MachineState {
    /// The node about to execute, or `None` once the program has ended.
    pub control: Option<Control>,
    /// Call stack, outermost frame first.
    pub frames: Vec<Frame>,
    /// Flat byte memory with its access log.
    pub memory: MemoryStore,
    /// Everything the program has printed.
    pub terminal: TermBuffer,
    /// Remaining standard input.
    pub input: InputStream,
    /// The trap that stopped execution, if any. An errored state refuses
    /// further steps.
    pub error: Option<Trap>,
    /// Set when a read ran out of input under the suspend policy. The state
    /// is otherwise unchanged and the read retries once input arrives.
    pub awaiting_input: bool,
    /// Number of completed steps since startup finished.
    pub steps_taken: u64,
    /// Value returned from the entry function, once terminated.
    pub exit_value: Option<Scalar>,
    /// Heap addresses of the program's string literals, by literal index.
    pub(crate) strings: Arc<Vec<u64>>,
}

impl MachineState {
    /// Call stack depth.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// True once the program has run to completion. Distinct from an
    /// errored state, which still holds its last control position.
    pub fn terminated(&self) -> bool {
        self.control.is_none() && self.error.is_none()
    }

    pub fn errored(&self) -> bool {
        self.error.is_some()
    }

    /// The innermost frame, if any.
    pub fn top_frame(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub(crate) fn top_frame_mut(&mut self) -> Result<&mut Frame, Trap> {
        self.frames.last_mut().ok_or(Trap::NoActiveFrame)
    }

    /// Heap address of string literal `index`.
    pub fn string_address(&self, index: usize) -> Option<u64> {
        self.strings.get(index).copied()
    }
}
