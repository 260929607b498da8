//! The abstract machine.
//!
//! [`Machine`] holds the immutable program plus host configuration and
//! produces successor states. A step is atomic: the node under the control
//! position decodes to a list of effects, the appliers fold over a clone of
//! the state, and either every effect lands or the original state survives
//! with a trap recorded. Nothing here mutates a published state.

use std::sync::Arc;

use crate::machine::builtins::Builtins;
use crate::machine::effects::{self, Effect};
use crate::machine::errors::Trap;
use crate::machine::input::InputStream;
use crate::machine::state::{Control, Frame, MachineState};
use crate::machine::terminal::TermBuffer;
use crate::memory::{MemoryStore, Reference, Scalar};
use crate::program::{BinOp, ControlNode, Op, Program, SourceRange, UnOp};

/// Default size of the stack region in bytes.
pub const DEFAULT_STACK_BYTES: u64 = 4096;

/// Default ceiling on total live heap bytes.
pub const DEFAULT_HEAP_LIMIT: u64 = 0x1_0000;

/// Default terminal width in columns.
pub const DEFAULT_TERM_WIDTH: usize = 60;

/// Default terminal height in rows.
pub const DEFAULT_TERM_HEIGHT: usize = 10;

/// Nodes executed during startup before concluding the program never
/// reaches user code.
const STARTUP_CEILING: u64 = 10_000;

/// What an input read does when the token stream is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputPolicy {
    /// Trap with [`Trap::InputExhausted`]; the machine stays errored.
    #[default]
    Fatal,
    /// Abort the step with no effect and mark the state as awaiting input.
    /// The same node retries after input arrives.
    Suspend,
}

#[derive(Debug, Clone)]
pub struct MachineOptions {
    pub stack_bytes: u64,
    pub heap_limit: u64,
    pub terminal_width: usize,
    pub terminal_height: usize,
    /// Standard input available at startup. More can arrive later through
    /// [`Machine::provide_input`].
    pub input: String,
    pub input_policy: InputPolicy,
}

impl Default for MachineOptions {
    fn default() -> Self {
        MachineOptions {
            stack_bytes: DEFAULT_STACK_BYTES,
            heap_limit: DEFAULT_HEAP_LIMIT,
            terminal_width: DEFAULT_TERM_WIDTH,
            terminal_height: DEFAULT_TERM_HEIGHT,
            input: String::new(),
            input_policy: InputPolicy::default(),
        }
    }
}

/// Decodes control nodes into effects and folds them over states.
#[derive(Debug)]
pub struct Machine {
    program: Arc<Program>,
    builtins: Builtins,
    options: MachineOptions,
}

impl Machine {
    pub fn new(program: Program, builtins: Builtins, options: MachineOptions) -> Self {
        Machine {
            program: Arc::new(program),
            builtins,
            options,
        }
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn options(&self) -> &MachineOptions {
        &self.options
    }

    /// The node a control position names, if it is inside the body.
    /// A position one past the end is legal and decodes as a return.
    pub fn node(&self, control: Control) -> Option<&ControlNode> {
        self.program.function(control.function)?.body.get(control.pc)
    }

    /// Builds the initial state: memory with string literals interned on
    /// the heap, an empty terminal, the entry frame, and the control
    /// position advanced through any front matter to the first node
    /// flagged as user code.
    ///
    /// Startup failures are reported through the state's `error` field, so
    /// this always yields a state.
    pub fn start(&self) -> MachineState {
        match self.boot() {
            Ok(state) => state,
            Err(trap) => MachineState {
                control: None,
                frames: Vec::new(),
                memory: MemoryStore::new(self.options.stack_bytes, self.options.heap_limit),
                terminal: TermBuffer::new(self.options.terminal_width, self.options.terminal_height),
                input: InputStream::from_text(&self.options.input),
                error: Some(trap),
                awaiting_input: false,
                steps_taken: 0,
                exit_value: None,
                strings: Arc::new(Vec::new()),
            },
        }
    }

    fn boot(&self) -> Result<MachineState, Trap> {
        let mut memory = MemoryStore::new(self.options.stack_bytes, self.options.heap_limit);
        let mut strings = Vec::with_capacity(self.program.strings.len());
        for text in &self.program.strings {
            let mut bytes = text.clone().into_bytes();
            bytes.push(0);
            let address = memory.allocate(bytes.len() as u64)?;
            memory.write_bytes(address, &bytes)?;
            strings.push(address);
        }
        // Interning is plumbing; the log starts at the first real access.
        memory.clear_log();

        let entry = self.program.entry;
        let decl = self
            .program
            .function(entry)
            .ok_or_else(|| Trap::UnknownFunction {
                name: format!("#{entry}"),
            })?;
        let frame = Frame::new(
            entry,
            Vec::new(),
            decl.directives.clone(),
            None,
            None,
            memory.stack_top(),
        );
        let mut state = MachineState {
            control: Some(Control::new(entry, 0)),
            frames: vec![frame],
            memory,
            terminal: TermBuffer::new(self.options.terminal_width, self.options.terminal_height),
            input: InputStream::from_text(&self.options.input),
            error: None,
            awaiting_input: false,
            steps_taken: 0,
            exit_value: None,
            strings: Arc::new(strings),
        };

        let mut advanced = 0u64;
        loop {
            if state.error.is_some() || state.awaiting_input {
                break;
            }
            let Some(control) = state.control else { break };
            if let Some(node) = self.node(control) {
                if node.user_code {
                    break;
                }
            }
            if advanced >= STARTUP_CEILING {
                state.error = Some(Trap::StartupOverrun { steps: advanced });
                break;
            }
            state = self.step(&state);
            advanced += 1;
        }
        // Front matter does not count against the step ceiling.
        state.steps_taken = 0;
        Ok(state)
    }

    /// Executes one atomic step and returns the successor state.
    ///
    /// Terminated and errored states step to themselves. A trap mid-effect
    /// discards the partial successor; the returned state is the input
    /// state with the trap recorded and the step counted.
    pub fn step(&self, state: &MachineState) -> MachineState {
        let Some(control) = state.control else {
            return state.clone();
        };
        if state.error.is_some() {
            return state.clone();
        }

        let outcome = self.decode(state, control).and_then(|effects| {
            let mut next = state.clone();
            next.steps_taken += 1;
            next.awaiting_input = false;
            effects
                .into_iter()
                .try_fold(next, |s, e| effects::apply(self, s, e))
        });
        match outcome {
            Ok(next) => next,
            Err(Trap::InputExhausted) if self.options.input_policy == InputPolicy::Suspend => {
                let mut waiting = state.clone();
                waiting.awaiting_input = true;
                waiting
            }
            Err(trap) => {
                let mut errored = state.clone();
                errored.steps_taken += 1;
                errored.error = Some(trap);
                errored
            }
        }
    }

    /// Appends input text and clears the awaiting flag so a suspended read
    /// retries on the next step.
    pub fn provide_input(&self, state: &MachineState, text: &str) -> MachineState {
        let mut next = state.clone();
        next.input.push_text(text);
        next.awaiting_input = false;
        next
    }

    /// Source range to highlight when the view focuses `focus_depth` frames
    /// up from the innermost. Depths 0 and 1 both name the live control
    /// position; greater depths name the outer frame's recorded call node.
    pub fn node_range(&self, state: &MachineState, focus_depth: usize) -> Option<SourceRange> {
        if focus_depth <= 1 {
            return state.control.and_then(|c| self.node(c)).map(|n| n.range);
        }
        let index = state.frames.len().checked_sub(focus_depth)?;
        let call = state.frames.get(index)?.call_site?;
        self.node(call).map(|n| n.range)
    }

    fn decode(&self, state: &MachineState, control: Control) -> Result<Vec<Effect>, Trap> {
        // Falling off the end of a body is an implicit void return.
        let Some(node) = self.node(control) else {
            return Ok(vec![Effect::Return { value: None }]);
        };
        let advance = Effect::Control(Control::new(control.function, control.pc + 1));
        let frame = state.top_frame().ok_or(Trap::NoActiveFrame)?;
        let operands = &frame.operands;

        match &node.op {
            Op::PushInt(n) => Ok(vec![Effect::Push(Scalar::Int(*n)), advance]),
            Op::PushChar(c) => Ok(vec![Effect::Push(Scalar::Char(*c)), advance]),
            Op::PushNull => Ok(vec![Effect::Push(Scalar::Pointer(0)), advance]),
            Op::PushStr(index) => {
                let address = state
                    .string_address(*index)
                    .ok_or_else(|| Trap::InvalidString {
                        message: format!("string literal {index} is not interned"),
                    })?;
                Ok(vec![Effect::Push(Scalar::Pointer(address)), advance])
            }
            Op::AddrOfLocal(name) => {
                let reference = frame.local(name).ok_or_else(|| Trap::UnknownVariable {
                    name: name.clone(),
                })?;
                Ok(vec![
                    Effect::Push(Scalar::Pointer(reference.address)),
                    advance,
                ])
            }
            Op::Index { elem } => {
                let index = peek(operands, 0)?;
                let base = peek(operands, 1)?;
                let index = index
                    .as_arith()
                    .ok_or_else(|| mismatch("int", index))?;
                let base = base
                    .as_pointer()
                    .ok_or_else(|| mismatch("pointer", base))?;
                let stride = elem.size_bytes().ok_or_else(|| Trap::UnsizedType {
                    ty: elem.to_string(),
                })?;
                let address = base as i128 + index as i128 * stride as i128;
                if address < 0 || address > u64::MAX as i128 {
                    return Err(Trap::InvalidAccess {
                        address: base,
                        len: stride,
                    });
                }
                Ok(vec![
                    Effect::Pop(2),
                    Effect::Push(Scalar::Pointer(address as u64)),
                    advance,
                ])
            }
            Op::LoadLocal(name) => {
                let reference = frame
                    .local(name)
                    .cloned()
                    .ok_or_else(|| Trap::UnknownVariable { name: name.clone() })?;
                Ok(vec![Effect::Load(reference), advance])
            }
            Op::LoadIndirect { ty } => {
                let top = peek(operands, 0)?;
                let address = top.as_pointer().ok_or_else(|| mismatch("pointer", top))?;
                Ok(vec![
                    Effect::Pop(1),
                    Effect::Load(Reference::new(address, ty.clone())),
                    advance,
                ])
            }
            Op::StoreLocal(name) => {
                let value = peek(operands, 0)?;
                let reference = frame
                    .local(name)
                    .cloned()
                    .ok_or_else(|| Trap::UnknownVariable { name: name.clone() })?;
                Ok(vec![Effect::Pop(1), Effect::Store(reference, value), advance])
            }
            Op::StoreIndirect { ty } => {
                let value = peek(operands, 0)?;
                let target = peek(operands, 1)?;
                let address = target
                    .as_pointer()
                    .ok_or_else(|| mismatch("pointer", target))?;
                Ok(vec![
                    Effect::Pop(2),
                    Effect::Store(Reference::new(address, ty.clone()), value),
                    advance,
                ])
            }
            Op::Binary(op) => {
                let rhs = peek(operands, 0)?;
                let lhs = peek(operands, 1)?;
                let value = eval_binary(*op, lhs, rhs)?;
                Ok(vec![Effect::Pop(2), Effect::Push(value), advance])
            }
            Op::Unary(op) => {
                let value = peek(operands, 0)?;
                let result = eval_unary(*op, value)?;
                Ok(vec![Effect::Pop(1), Effect::Push(result), advance])
            }
            Op::Jump(target) => Ok(vec![Effect::Control(Control::new(
                control.function,
                *target,
            ))]),
            Op::JumpIfZero(target) => {
                let condition = peek(operands, 0)?;
                let next = if condition.as_condition() {
                    Control::new(control.function, control.pc + 1)
                } else {
                    Control::new(control.function, *target)
                };
                Ok(vec![Effect::Pop(1), Effect::Control(next)])
            }
            Op::Call { callee, argc } => {
                if operands.len() < *argc {
                    return Err(Trap::OperandStackUnderflow);
                }
                let args = operands[operands.len() - argc..].to_vec();
                if let Some((function, decl)) = self.program.function_named(callee) {
                    if decl.params.len() != *argc {
                        return Err(Trap::ArgumentCountMismatch {
                            function: callee.clone(),
                            expected: decl.params.len(),
                            got: *argc,
                        });
                    }
                    Ok(vec![Effect::Pop(*argc), Effect::Call { function, args }])
                } else if let Some(builtin) = self.builtins.get(callee) {
                    let outcome = (**builtin)(state, &args)?;
                    let mut effects = Vec::with_capacity(outcome.effects.len() + 3);
                    effects.push(Effect::Pop(*argc));
                    effects.extend(outcome.effects);
                    if let Some(result) = outcome.result {
                        effects.push(Effect::Push(result));
                    }
                    effects.push(advance);
                    Ok(effects)
                } else {
                    Err(Trap::UnknownFunction {
                        name: callee.clone(),
                    })
                }
            }
            Op::Return { has_value } => {
                let value = if *has_value {
                    Some(peek(operands, 0)?)
                } else {
                    None
                };
                Ok(vec![Effect::Return { value }])
            }
            Op::Enter(scope) => Ok(vec![Effect::Enter { scope: *scope }, advance]),
            Op::Leave => Ok(vec![Effect::Leave, advance]),
            Op::Declare { name, ty } => Ok(vec![
                Effect::Declare {
                    name: name.clone(),
                    ty: ty.clone(),
                },
                advance,
            ]),
            Op::Pop => Ok(vec![Effect::Pop(1), advance]),
            Op::Halt => Ok(vec![Effect::Halt]),
        }
    }
}

fn peek(operands: &[Scalar], depth: usize) -> Result<Scalar, Trap> {
    operands
        .len()
        .checked_sub(1 + depth)
        .and_then(|i| operands.get(i))
        .copied()
        .ok_or(Trap::OperandStackUnderflow)
}

fn mismatch(expected: &str, got: Scalar) -> Trap {
    Trap::TypeMismatch {
        expected: expected.to_string(),
        got: got.kind_name().to_string(),
    }
}

fn eval_binary(op: BinOp, lhs: Scalar, rhs: Scalar) -> Result<Scalar, Trap> {
    // Pointers compare; they do not participate in arithmetic.
    if let (Scalar::Pointer(a), Scalar::Pointer(b)) = (lhs, rhs) {
        let truth = |v: bool| Scalar::Int(v as i32);
        return match op {
            BinOp::Eq => Ok(truth(a == b)),
            BinOp::Ne => Ok(truth(a != b)),
            BinOp::Lt => Ok(truth(a < b)),
            BinOp::Le => Ok(truth(a <= b)),
            BinOp::Gt => Ok(truth(a > b)),
            BinOp::Ge => Ok(truth(a >= b)),
            _ => Err(mismatch("int", lhs)),
        };
    }

    let a = lhs.as_arith().ok_or_else(|| mismatch("int", lhs))?;
    let b = rhs.as_arith().ok_or_else(|| mismatch("int", rhs))?;
    let value = match op {
        BinOp::Add => a.checked_add(b).ok_or(Trap::IntegerOverflow { op: "add" })?,
        BinOp::Sub => a.checked_sub(b).ok_or(Trap::IntegerOverflow { op: "sub" })?,
        BinOp::Mul => a.checked_mul(b).ok_or(Trap::IntegerOverflow { op: "mul" })?,
        BinOp::Div => {
            if b == 0 {
                return Err(Trap::DivisionByZero);
            }
            a.checked_div(b).ok_or(Trap::IntegerOverflow { op: "div" })?
        }
        BinOp::Mod => {
            if b == 0 {
                return Err(Trap::DivisionByZero);
            }
            a.checked_rem(b).ok_or(Trap::IntegerOverflow { op: "mod" })?
        }
        BinOp::Eq => (a == b) as i32,
        BinOp::Ne => (a != b) as i32,
        BinOp::Lt => (a < b) as i32,
        BinOp::Le => (a <= b) as i32,
        BinOp::Gt => (a > b) as i32,
        BinOp::Ge => (a >= b) as i32,
    };
    Ok(Scalar::Int(value))
}

fn eval_unary(op: UnOp, value: Scalar) -> Result<Scalar, Trap> {
    match op {
        UnOp::Neg => {
            let n = value.as_arith().ok_or_else(|| mismatch("int", value))?;
            Ok(Scalar::Int(
                n.checked_neg().ok_or(Trap::IntegerOverflow { op: "neg" })?,
            ))
        }
        UnOp::Not => Ok(Scalar::Int(!value.as_condition() as i32)),
    }
}
