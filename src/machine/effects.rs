//! Effects and their appliers.
//!
//! Decoding a control node yields a list of [`Effect`] values; a step then
//! folds [`apply`] over that list. Each applier is a small pure transition
//! that consumes a state and returns the successor, so a trap partway
//! through a list discards the partial state and the original survives
//! untouched.

use crate::machine::engine::Machine;
use crate::machine::errors::Trap;
use crate::machine::input::parse_token;
use crate::machine::state::{Control, Frame, MachineState};
use crate::memory::{Reference, Scalar};
use crate::program::TypeDesc;

/// One primitive state transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Move the control position.
    Control(Control),
    /// Push a value on the operand stack.
    Push(Scalar),
    /// Drop the top `n` operands.
    Pop(usize),
    /// Read a memory cell, log the load, and push the value.
    Load(Reference),
    /// Coerce the value to the cell's type, write it, and log the store.
    Store(Reference, Scalar),
    /// Append text to the terminal.
    Write(String),
    /// Push a frame for `function` and jump to its first node.
    Call { function: usize, args: Vec<Scalar> },
    /// Pop the current frame and resume at its return position.
    Return { value: Option<Scalar> },
    /// Enter lexical scope `scope` of the current function.
    Enter { scope: usize },
    /// Leave the innermost lexical scope.
    Leave,
    /// Reserve stack space for a local and bind its name.
    Declare { name: String, ty: TypeDesc },
    /// Consume one input token and store it through `dest`.
    InputRead { dest: Reference },
    /// Allocate a heap block and push its address.
    Alloc { size: u64 },
    /// Release a heap block.
    Release { address: u64 },
    /// End the program.
    Halt,
}

pub(crate) fn apply(
    machine: &Machine,
    state: MachineState,
    effect: Effect,
) -> Result<MachineState, Trap> {
    match effect {
        Effect::Control(control) => apply_control(state, control),
        Effect::Push(value) => apply_push(state, value),
        Effect::Pop(count) => apply_pop(state, count),
        Effect::Load(reference) => apply_load(state, reference),
        Effect::Store(reference, value) => apply_store(state, reference, value),
        Effect::Write(text) => apply_write(state, text),
        Effect::Call { function, args } => apply_call(machine, state, function, args),
        Effect::Return { value } => apply_return(state, value),
        Effect::Enter { scope } => apply_enter(machine, state, scope),
        Effect::Leave => apply_leave(state),
        Effect::Declare { name, ty } => apply_declare(state, name, ty),
        Effect::InputRead { dest } => apply_input_read(state, dest),
        Effect::Alloc { size } => apply_alloc(state, size),
        Effect::Release { address } => apply_release(state, address),
        Effect::Halt => apply_halt(state),
    }
}

fn apply_control(mut state: MachineState, control: Control) -> Result<MachineState, Trap> {
    state.control = Some(control);
    Ok(state)
}

fn apply_push(mut state: MachineState, value: Scalar) -> Result<MachineState, Trap> {
    state.top_frame_mut()?.operands.push(value);
    Ok(state)
}

fn apply_pop(mut state: MachineState, count: usize) -> Result<MachineState, Trap> {
    let operands = &mut state.top_frame_mut()?.operands;
    if operands.len() < count {
        return Err(Trap::OperandStackUnderflow);
    }
    operands.truncate(operands.len() - count);
    Ok(state)
}

fn apply_load(mut state: MachineState, reference: Reference) -> Result<MachineState, Trap> {
    let value = state.memory.read_scalar(&reference)?;
    state.memory.log_load(&reference);
    state.top_frame_mut()?.operands.push(value);
    Ok(state)
}

fn apply_store(
    mut state: MachineState,
    reference: Reference,
    value: Scalar,
) -> Result<MachineState, Trap> {
    let coerced = value.coerce_to(&reference.ty).ok_or_else(|| Trap::TypeMismatch {
        expected: reference.ty.to_string(),
        got: value.kind_name().to_string(),
    })?;
    let overwritten = state.memory.write_scalar(&reference, coerced)?;
    state.memory.log_store(&reference, overwritten);
    Ok(state)
}

fn apply_write(mut state: MachineState, text: String) -> Result<MachineState, Trap> {
    state.terminal.write_str(&text);
    Ok(state)
}

fn apply_call(
    machine: &Machine,
    mut state: MachineState,
    function: usize,
    args: Vec<Scalar>,
) -> Result<MachineState, Trap> {
    let decl = machine
        .program()
        .function(function)
        .ok_or_else(|| Trap::UnknownFunction {
            name: format!("#{function}"),
        })?;

    // The control position still sits on the call node here; the callee's
    // return resumes one past it.
    let call_site = state.control;
    state.top_frame_mut()?.call_site = call_site;
    let return_control = call_site.map(|c| Control::new(c.function, c.pc + 1));

    let mut frame = Frame::new(
        function,
        args.clone(),
        decl.directives.clone(),
        return_control,
        None,
        state.memory.stack_top(),
    );
    for (param, value) in decl.params.iter().zip(args) {
        let size = param.ty.size_bytes().ok_or_else(|| Trap::UnsizedType {
            ty: param.ty.to_string(),
        })?;
        let address = state.memory.stack_alloc(size)?;
        let reference = Reference::new(address, param.ty.clone());
        let coerced = value.coerce_to(&param.ty).ok_or_else(|| Trap::TypeMismatch {
            expected: param.ty.to_string(),
            got: value.kind_name().to_string(),
        })?;
        let overwritten = state.memory.write_scalar(&reference, coerced)?;
        state.memory.log_store(&reference, overwritten);
        frame.declare_local(&param.name, reference);
    }

    state.frames.push(frame);
    state.control = Some(Control::new(function, 0));
    Ok(state)
}

fn apply_return(mut state: MachineState, value: Option<Scalar>) -> Result<MachineState, Trap> {
    let frame = state.frames.pop().ok_or(Trap::NoActiveFrame)?;
    state.memory.stack_restore(frame.saved_stack_top);
    match frame.return_control {
        Some(control) => {
            state.control = Some(control);
            if let Some(result) = value {
                state.top_frame_mut()?.operands.push(result);
            }
        }
        None => {
            state.control = None;
            state.exit_value = Some(value.unwrap_or(Scalar::Int(0)));
        }
    }
    Ok(state)
}

fn apply_enter(
    machine: &Machine,
    mut state: MachineState,
    scope: usize,
) -> Result<MachineState, Trap> {
    let function = state.top_frame().ok_or(Trap::NoActiveFrame)?.function;
    let directives = machine
        .program()
        .function(function)
        .and_then(|decl| decl.scopes.get(scope))
        .map(|block| block.directives.clone())
        .unwrap_or_default();

    let frame = state.top_frame_mut()?;
    frame.scope_key += 1;
    frame.directives = directives;
    frame.directives_key = frame.scope_key;
    Ok(state)
}

fn apply_leave(mut state: MachineState) -> Result<MachineState, Trap> {
    let frame = state.top_frame_mut()?;
    frame.scope_key = frame.scope_key.saturating_sub(1);
    // Directives installed by the scope being left are stale now.
    if frame.directives_key > frame.scope_key {
        frame.directives = Vec::new();
        frame.directives_key = frame.scope_key;
    }
    Ok(state)
}

fn apply_declare(
    mut state: MachineState,
    name: String,
    ty: TypeDesc,
) -> Result<MachineState, Trap> {
    let size = ty
        .size_bytes()
        .ok_or_else(|| Trap::UnsizedType { ty: ty.to_string() })?;
    let address = state.memory.stack_alloc(size)?;
    state
        .top_frame_mut()?
        .declare_local(&name, Reference::new(address, ty));
    Ok(state)
}

fn apply_input_read(mut state: MachineState, dest: Reference) -> Result<MachineState, Trap> {
    let token = state.input.take().ok_or(Trap::InputExhausted)?;
    match &dest.ty {
        // A character array destination takes the whole token plus a NUL.
        TypeDesc::Array { elem, .. } if **elem == TypeDesc::Char => {
            let mut bytes = token.into_bytes();
            bytes.push(0);
            let written = Reference::new(
                dest.address,
                TypeDesc::Char.array_of(Some(bytes.len() as u32)),
            );
            let overwritten = state.memory.write_bytes(dest.address, &bytes)?;
            state.memory.log_store(&written, overwritten);
        }
        _ => {
            let value = parse_token(&dest.ty, &token)?;
            let overwritten = state.memory.write_scalar(&dest, value)?;
            state.memory.log_store(&dest, overwritten);
        }
    }
    Ok(state)
}

fn apply_alloc(mut state: MachineState, size: u64) -> Result<MachineState, Trap> {
    let address = state.memory.allocate(size)?;
    state.top_frame_mut()?.operands.push(Scalar::Pointer(address));
    Ok(state)
}

fn apply_release(mut state: MachineState, address: u64) -> Result<MachineState, Trap> {
    state.memory.release(address)?;
    Ok(state)
}

fn apply_halt(mut state: MachineState) -> Result<MachineState, Trap> {
    state.control = None;
    if state.exit_value.is_none() {
        state.exit_value = Some(Scalar::Int(0));
    }
    Ok(state)
}
