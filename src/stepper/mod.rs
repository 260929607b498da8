//! Stepping policies over the abstract machine.
//!
//! A [`Stepper`] owns the live state and a snapshot history, and runs one
//! [`StepCommand`] at a time. Every command is built from the machine's
//! atomic step; the mode only decides where to stop. Between atomic steps
//! the loop checks a shared interrupt flag, so a host can park a runaway
//! `run` from another thread, and a per-command step ceiling turns a
//! program that never settles into a failed command rather than a hang.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::history::History;
use crate::machine::{Machine, MachineState};

/// How far one command carries execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    /// Exactly one atomic step.
    Into,
    /// Up to the next boundary node, descending into calls.
    Expr,
    /// Up to the next stop at the starting depth or shallower; positions
    /// inside a callee are never surfaced.
    Over,
    /// Until the call stack is shallower than at the start.
    Out,
    /// Until a breakpoint, input wait, trap, interrupt, or termination.
    Run,
}

impl StepMode {
    pub fn name(self) -> &'static str {
        match self {
            StepMode::Into => "into",
            StepMode::Expr => "expr",
            StepMode::Over => "over",
            StepMode::Out => "out",
            StepMode::Run => "run",
        }
    }

    pub fn from_name(name: &str) -> Option<StepMode> {
        match name {
            "into" => Some(StepMode::Into),
            "expr" => Some(StepMode::Expr),
            "over" => Some(StepMode::Over),
            "out" => Some(StepMode::Out),
            "run" => Some(StepMode::Run),
            _ => None,
        }
    }
}

/// One stepping request: a mode, plus an optional pause predicate that
/// `run` consults between atomic steps.
pub struct StepCommand {
    pub mode: StepMode,
    pub breakpoint: Option<Box<dyn Fn(&MachineState) -> bool>>,
}

impl StepCommand {
    pub fn new(mode: StepMode) -> Self {
        StepCommand {
            mode,
            breakpoint: None,
        }
    }

    /// A `run` command pausing wherever `breakpoint` holds.
    pub fn run_until(breakpoint: impl Fn(&MachineState) -> bool + 'static) -> Self {
        StepCommand {
            mode: StepMode::Run,
            breakpoint: Some(Box::new(breakpoint)),
        }
    }
}

impl std::fmt::Debug for StepCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepCommand")
            .field("mode", &self.mode)
            .field("breakpoint", &self.breakpoint.is_some())
            .finish()
    }
}

/// Why a command came to rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The mode's stopping predicate held.
    Paused,
    /// The program ran to completion.
    Terminated,
    /// The interrupt flag was raised between atomic steps. Not an error;
    /// the session continues from where it stopped.
    Interrupted,
    /// A runtime trap ended execution; the state carries the trap.
    Trapped,
    /// An input read suspended until more input arrives.
    AwaitingInput,
}

/// Session condition after the most recent command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepperStatus {
    Paused,
    Terminated,
    Errored,
    AwaitingInput,
}

/// Fatal stepping failures. These fail the command, not the program:
/// the state stays un-errored and a narrower command may still run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StepError {
    #[error("step budget exceeded after {steps} steps")]
    BudgetExceeded { steps: u64 },
}

#[derive(Debug, Clone)]
pub struct StepperOptions {
    /// Hard ceiling on atomic steps within a single command.
    pub step_ceiling: u64,
    /// Atomic steps between yield-hook calls inside one command.
    pub yield_interval: u64,
    /// Cap on retained history snapshots; `None` keeps everything.
    pub history_limit: Option<usize>,
}

impl Default for StepperOptions {
    fn default() -> Self {
        StepperOptions {
            step_ceiling: 100_000,
            yield_interval: 1_000,
            history_limit: None,
        }
    }
}

/// Drives a [`Machine`] one command at a time and records each stop in the
/// snapshot history.
pub struct Stepper {
    machine: Machine,
    state: MachineState,
    history: History<MachineState>,
    status: StepperStatus,
    interrupt: Arc<AtomicBool>,
    options: StepperOptions,
    yield_hook: Option<Box<dyn FnMut(u64)>>,
}

impl Stepper {
    pub fn new(machine: Machine) -> Self {
        Stepper::with_options(machine, StepperOptions::default())
    }

    pub fn with_options(machine: Machine, options: StepperOptions) -> Self {
        let state = machine.start();
        let status = settle_status(&state);
        let mut history = History::new(options.history_limit);
        history.push(state.clone());
        Stepper {
            machine,
            state,
            history,
            status,
            interrupt: Arc::new(AtomicBool::new(false)),
            options,
            yield_hook: None,
        }
    }

    pub fn state(&self) -> &MachineState {
        &self.state
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn status(&self) -> StepperStatus {
        self.status
    }

    pub fn history(&self) -> &History<MachineState> {
        &self.history
    }

    /// Shared flag a host thread can raise to park the current command.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    pub fn request_interrupt(&self) {
        self.interrupt.store(true, Ordering::Relaxed);
    }

    /// Called every `yield_interval` atomic steps inside a command, with
    /// the number of steps the command has taken so far.
    pub fn set_yield_hook(&mut self, hook: impl FnMut(u64) + 'static) {
        self.yield_hook = Some(Box::new(hook));
    }

    /// Runs one command to its stopping point.
    ///
    /// Exactly one history snapshot is recorded per call, whatever the
    /// outcome, so undo always rewinds command by command. The interrupt
    /// flag is cleared on entry; a flag raised during a previous command
    /// does not leak into this one.
    pub fn exec(&mut self, command: &StepCommand) -> Result<StepOutcome, StepError> {
        self.interrupt.store(false, Ordering::Relaxed);
        let result = self.run_command(command);
        self.history.push(self.state.clone());

        match &result {
            Ok(outcome) => {
                self.status = settle_status(&self.state);
                tracing::debug!(
                    mode = command.mode.name(),
                    ?outcome,
                    steps = self.state.steps_taken,
                    depth = self.state.depth(),
                    "command settled"
                );
            }
            Err(error) => {
                self.status = StepperStatus::Errored;
                tracing::warn!(%error, mode = command.mode.name(), "command aborted");
            }
        }
        result
    }

    fn run_command(&mut self, command: &StepCommand) -> Result<StepOutcome, StepError> {
        let start_depth = self.state.depth();
        let yield_every = self.options.yield_interval.max(1);
        let mut steps_this_command = 0u64;

        loop {
            if self.state.errored() {
                return Ok(StepOutcome::Trapped);
            }
            if self.state.terminated() {
                return Ok(StepOutcome::Terminated);
            }
            if steps_this_command >= self.options.step_ceiling {
                return Err(StepError::BudgetExceeded {
                    steps: steps_this_command,
                });
            }

            let depth_before = self.state.depth();
            self.state = self.machine.step(&self.state);
            if self.state.awaiting_input {
                return Ok(StepOutcome::AwaitingInput);
            }
            steps_this_command += 1;

            if self.state.errored() {
                return Ok(StepOutcome::Trapped);
            }
            if self.state.terminated() {
                return Ok(StepOutcome::Terminated);
            }

            if let Some(hook) = &mut self.yield_hook {
                if steps_this_command % yield_every == 0 {
                    hook(steps_this_command);
                }
            }
            if self.interrupt.load(Ordering::Relaxed) {
                return Ok(StepOutcome::Interrupted);
            }

            if self.should_pause(command, start_depth, depth_before) {
                return Ok(StepOutcome::Paused);
            }
        }
    }

    fn should_pause(&self, command: &StepCommand, start_depth: usize, depth_before: usize) -> bool {
        let depth = self.state.depth();
        match command.mode {
            StepMode::Into => true,
            StepMode::Expr => self.at_boundary(),
            StepMode::Over => {
                depth < start_depth
                    || (depth == start_depth && (depth != depth_before || self.at_boundary()))
            }
            StepMode::Out => depth < start_depth,
            StepMode::Run => command
                .breakpoint
                .as_ref()
                .is_some_and(|stop| stop(&self.state)),
        }
    }

    fn at_boundary(&self) -> bool {
        self.state
            .control
            .and_then(|control| self.machine.node(control))
            .is_some_and(|node| node.boundary)
    }

    /// Feeds more input. No history slot is consumed; the suspended read
    /// retries on the next command.
    pub fn provide_input(&mut self, text: &str) {
        self.state = self.machine.provide_input(&self.state, text);
        if self.status == StepperStatus::AwaitingInput {
            self.status = StepperStatus::Paused;
        }
    }

    /// Tears the session down and rebuilds the initial state under a
    /// fresh history. Nothing from the previous run stays reachable.
    pub fn restart(&mut self) {
        self.state = self.machine.start();
        self.status = settle_status(&self.state);
        self.history = History::new(self.options.history_limit);
        self.history.push(self.state.clone());
        tracing::debug!("session restarted");
    }

    /// Rewinds to the previous snapshot. Returns false at the oldest.
    pub fn undo(&mut self) -> bool {
        match self.history.undo() {
            Some(state) => {
                self.state = state.clone();
                self.status = settle_status(&self.state);
                true
            }
            None => false,
        }
    }

    /// Replays the undone snapshot. Returns false at the newest.
    pub fn redo(&mut self) -> bool {
        match self.history.redo() {
            Some(state) => {
                self.state = state.clone();
                self.status = settle_status(&self.state);
                true
            }
            None => false,
        }
    }
}

fn settle_status(state: &MachineState) -> StepperStatus {
    if state.errored() {
        StepperStatus::Errored
    } else if state.terminated() {
        StepperStatus::Terminated
    } else if state.awaiting_input {
        StepperStatus::AwaitingInput
    } else {
        StepperStatus::Paused
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::builtins::default_builtins;
    use crate::machine::{MachineOptions, Trap};
    use crate::program::{
        BinOp, FunctionBuilder, Op, Program, ProgramBuilder, SourceRange, TypeDesc,
    };

    fn at(n: u32) -> SourceRange {
        SourceRange::new(n, n + 1)
    }

    fn stepper_for(program: Program) -> Stepper {
        Stepper::new(Machine::new(
            program,
            default_builtins(),
            MachineOptions::default(),
        ))
    }

    fn counting_program() -> Program {
        // x = 0; x = x + 1; x = x + 1; return x;
        let mut main = FunctionBuilder::new("main");
        main.stmt(
            Op::Declare {
                name: "x".into(),
                ty: TypeDesc::Int,
            },
            at(0),
        );
        main.stmt(Op::PushInt(0), at(1));
        main.op(Op::StoreLocal("x".into()), at(1));
        for n in 2..4 {
            main.stmt(Op::LoadLocal("x".into()), at(n));
            main.op(Op::PushInt(1), at(n));
            main.op(Op::Binary(BinOp::Add), at(n));
            main.op(Op::StoreLocal("x".into()), at(n));
        }
        main.stmt(Op::LoadLocal("x".into()), at(4));
        main.op(Op::Return { has_value: true }, at(4));

        let mut builder = ProgramBuilder::new();
        builder.add_function(main.finish());
        builder.build("main").unwrap()
    }

    fn call_program() -> Program {
        let mut helper = FunctionBuilder::new("helper");
        helper.stmt(Op::PushInt(5), at(50));
        helper.stmt(Op::PushInt(2), at(51));
        helper.op(Op::Binary(BinOp::Mul), at(51));
        helper.op(Op::Return { has_value: true }, at(51));

        let mut main = FunctionBuilder::new("main");
        main.stmt(
            Op::Call {
                callee: "helper".into(),
                argc: 0,
            },
            at(10),
        );
        main.op(Op::Pop, at(10));
        main.stmt(Op::PushInt(0), at(11));
        main.op(Op::Return { has_value: true }, at(11));

        let mut builder = ProgramBuilder::new();
        builder.add_function(helper.finish());
        builder.add_function(main.finish());
        builder.build("main").unwrap()
    }

    fn looping_program() -> Program {
        let mut main = FunctionBuilder::new("main");
        main.stmt(Op::Jump(0), at(0));
        let mut builder = ProgramBuilder::new();
        builder.add_function(main.finish());
        builder.build("main").unwrap()
    }

    #[test]
    fn into_advances_one_atomic_step_at_a_time() {
        let mut stepper = stepper_for(counting_program());
        assert_eq!(stepper.state().steps_taken, 0);

        let outcome = stepper.exec(&StepCommand::new(StepMode::Into)).unwrap();
        assert_eq!(outcome, StepOutcome::Paused);
        assert_eq!(stepper.state().steps_taken, 1);

        stepper.exec(&StepCommand::new(StepMode::Into)).unwrap();
        assert_eq!(stepper.state().steps_taken, 2);
    }

    #[test]
    fn expr_stops_at_the_next_boundary_node() {
        let mut stepper = stepper_for(counting_program());
        let outcome = stepper.exec(&StepCommand::new(StepMode::Expr)).unwrap();
        assert_eq!(outcome, StepOutcome::Paused);
        // Landed on the `x = 0` statement head, one node past the declare.
        assert_eq!(stepper.state().control.unwrap().pc, 1);
        assert_eq!(stepper.state().steps_taken, 1);

        stepper.exec(&StepCommand::new(StepMode::Expr)).unwrap();
        assert_eq!(stepper.state().control.unwrap().pc, 3);
    }

    #[test]
    fn over_never_surfaces_inside_the_callee() {
        let mut stepper = stepper_for(call_program());
        let outcome = stepper.exec(&StepCommand::new(StepMode::Over)).unwrap();
        assert_eq!(outcome, StepOutcome::Paused);
        // Back in main, one node past the call.
        assert_eq!(stepper.state().depth(), 1);
        assert_eq!(stepper.state().control.unwrap().pc, 1);
        // The callee's work still happened.
        assert!(stepper.state().steps_taken > 3);
    }

    #[test]
    fn out_pauses_only_below_the_starting_depth() {
        let mut stepper = stepper_for(call_program());
        stepper.exec(&StepCommand::new(StepMode::Into)).unwrap();
        assert_eq!(stepper.state().depth(), 2);

        let outcome = stepper.exec(&StepCommand::new(StepMode::Out)).unwrap();
        assert_eq!(outcome, StepOutcome::Paused);
        assert_eq!(stepper.state().depth(), 1);
    }

    #[test]
    fn run_pauses_where_the_breakpoint_holds() {
        let mut stepper = stepper_for(counting_program());
        let outcome = stepper
            .exec(&StepCommand::run_until(|state| state.steps_taken >= 4))
            .unwrap();
        assert_eq!(outcome, StepOutcome::Paused);
        assert_eq!(stepper.state().steps_taken, 4);
    }

    #[test]
    fn run_without_breakpoint_reaches_termination() {
        let mut stepper = stepper_for(counting_program());
        let outcome = stepper.exec(&StepCommand::new(StepMode::Run)).unwrap();
        assert_eq!(outcome, StepOutcome::Terminated);
        assert_eq!(stepper.status(), StepperStatus::Terminated);
        assert_eq!(
            stepper.state().exit_value,
            Some(crate::memory::Scalar::Int(2))
        );
    }

    #[test]
    fn budget_exhaustion_fails_the_command_not_the_session() {
        let machine = Machine::new(
            looping_program(),
            default_builtins(),
            MachineOptions::default(),
        );
        let mut stepper = Stepper::with_options(
            machine,
            StepperOptions {
                step_ceiling: 25,
                ..StepperOptions::default()
            },
        );

        let error = stepper.exec(&StepCommand::new(StepMode::Run)).unwrap_err();
        assert_eq!(error, StepError::BudgetExceeded { steps: 25 });
        assert_eq!(stepper.status(), StepperStatus::Errored);
        // The state itself carries no trap; the program did nothing wrong.
        assert!(stepper.state().error.is_none());
        // The stop was still recorded, so it can be rewound.
        assert!(stepper.history().can_undo());

        // The ceiling charges each command separately. A narrower command
        // still runs even though the session total is past the ceiling.
        let outcome = stepper.exec(&StepCommand::new(StepMode::Into)).unwrap();
        assert_eq!(outcome, StepOutcome::Paused);
        assert_eq!(stepper.state().steps_taken, 26);
        assert_eq!(stepper.status(), StepperStatus::Paused);
    }

    #[test]
    fn interrupt_parks_the_command_between_steps() {
        let machine = Machine::new(
            looping_program(),
            default_builtins(),
            MachineOptions::default(),
        );
        let mut stepper = Stepper::with_options(
            machine,
            StepperOptions {
                yield_interval: 10,
                ..StepperOptions::default()
            },
        );
        let flag = stepper.interrupt_flag();
        stepper.set_yield_hook(move |_| flag.store(true, Ordering::Relaxed));

        let outcome = stepper.exec(&StepCommand::new(StepMode::Run)).unwrap();
        assert_eq!(outcome, StepOutcome::Interrupted);
        assert_eq!(stepper.state().steps_taken, 10);
        assert_eq!(stepper.status(), StepperStatus::Paused);

        // The cleared flag lets the next command make progress again.
        let outcome = stepper.exec(&StepCommand::new(StepMode::Into)).unwrap();
        assert_eq!(outcome, StepOutcome::Paused);
        assert_eq!(stepper.state().steps_taken, 11);
    }

    #[test]
    fn trapped_state_refuses_further_commands() {
        let mut main = FunctionBuilder::new("main");
        main.stmt(Op::PushInt(1), at(0));
        main.op(Op::PushInt(0), at(0));
        main.op(Op::Binary(BinOp::Div), at(0));
        let mut builder = ProgramBuilder::new();
        builder.add_function(main.finish());
        let mut stepper = stepper_for(builder.build("main").unwrap());

        let outcome = stepper.exec(&StepCommand::new(StepMode::Run)).unwrap();
        assert_eq!(outcome, StepOutcome::Trapped);
        assert_eq!(stepper.state().error, Some(Trap::DivisionByZero));
        let steps = stepper.state().steps_taken;

        let again = stepper.exec(&StepCommand::new(StepMode::Into)).unwrap();
        assert_eq!(again, StepOutcome::Trapped);
        assert_eq!(stepper.state().steps_taken, steps);
    }

    #[test]
    fn undo_redo_round_trips_the_live_state() {
        let mut stepper = stepper_for(counting_program());
        stepper.exec(&StepCommand::new(StepMode::Into)).unwrap();
        stepper.exec(&StepCommand::new(StepMode::Into)).unwrap();

        assert!(stepper.undo());
        assert_eq!(stepper.state().steps_taken, 1);
        assert!(stepper.undo());
        assert_eq!(stepper.state().steps_taken, 0);
        assert!(!stepper.undo());

        assert!(stepper.redo());
        assert_eq!(stepper.state().steps_taken, 1);
        assert!(stepper.redo());
        assert_eq!(stepper.state().steps_taken, 2);
        assert!(!stepper.redo());
    }

    #[test]
    fn command_after_undo_forks_the_history() {
        let mut stepper = stepper_for(counting_program());
        stepper.exec(&StepCommand::new(StepMode::Into)).unwrap();
        stepper.exec(&StepCommand::new(StepMode::Into)).unwrap();
        stepper.undo();

        stepper.exec(&StepCommand::new(StepMode::Into)).unwrap();
        assert_eq!(stepper.state().steps_taken, 2);
        assert!(!stepper.redo());
    }

    #[test]
    fn restart_discards_the_previous_run() {
        let mut stepper = stepper_for(counting_program());
        stepper.exec(&StepCommand::new(StepMode::Run)).unwrap();
        assert_eq!(stepper.status(), StepperStatus::Terminated);

        stepper.restart();
        assert_eq!(stepper.status(), StepperStatus::Paused);
        assert_eq!(stepper.state().steps_taken, 0);
        // The finished run is gone; undo cannot resurrect it.
        assert!(!stepper.undo());
        assert!(!stepper.state().terminated());
        assert_eq!(stepper.history().len(), 1);
    }
}
