// End-to-end runs through the machine and stepper.

use glassbox::machine::{
    default_builtins, InputPolicy, Machine, MachineOptions, MachineState, Trap,
};
use glassbox::memory::Scalar;
use glassbox::program::{
    BinOp, FunctionBuilder, Op, Program, ProgramBuilder, SourceRange, TypeDesc,
};
use glassbox::stepper::{StepCommand, StepMode, StepOutcome, Stepper, StepperStatus};

fn at(n: u32) -> SourceRange {
    SourceRange::new(n, n + 1)
}

fn machine_for(program: Program) -> Machine {
    Machine::new(program, default_builtins(), MachineOptions::default())
}

fn run_to_end(machine: &Machine, mut state: MachineState) -> MachineState {
    for _ in 0..10_000 {
        if state.control.is_none() || state.errored() || state.awaiting_input {
            return state;
        }
        state = machine.step(&state);
    }
    panic!("program did not settle within 10000 steps");
}

// while (i < limit) i = i + 1; return i;
fn counting_loop(limit: i32) -> Program {
    let mut main = FunctionBuilder::new("main");
    main.stmt(
        Op::Declare {
            name: "i".into(),
            ty: TypeDesc::Int,
        },
        at(0),
    );
    main.stmt(Op::PushInt(0), at(1));
    main.op(Op::StoreLocal("i".into()), at(1));
    let head = main.next_index();
    main.stmt(Op::LoadLocal("i".into()), at(2));
    main.op(Op::PushInt(limit), at(2));
    main.op(Op::Binary(BinOp::Lt), at(2));
    let branch = main.op(Op::JumpIfZero(0), at(2));
    main.stmt(Op::LoadLocal("i".into()), at(3));
    main.op(Op::PushInt(1), at(3));
    main.op(Op::Binary(BinOp::Add), at(3));
    main.op(Op::StoreLocal("i".into()), at(3));
    main.op(Op::Jump(head), at(3));
    let exit = main.next_index();
    main.stmt(Op::LoadLocal("i".into()), at(4));
    main.op(Op::Return { has_value: true }, at(4));
    main.patch_jump(branch, exit);

    let mut builder = ProgramBuilder::new();
    builder.add_function(main.finish());
    builder.build("main").unwrap()
}

#[test]
fn test_loop_runs_to_completion() {
    let machine = machine_for(counting_loop(5));
    let end = run_to_end(&machine, machine.start());
    assert!(end.terminated());
    assert_eq!(end.exit_value, Some(Scalar::Int(5)));
}

#[test]
fn test_nested_calls_thread_values_through_frames() {
    let mut square = FunctionBuilder::new("square");
    square.op(Op::LoadLocal("n".into()), at(0));
    square.op(Op::LoadLocal("n".into()), at(0));
    square.op(Op::Binary(BinOp::Mul), at(0));
    square.op(Op::Return { has_value: true }, at(0));
    let square = square.param("n", TypeDesc::Int);

    let mut twice = FunctionBuilder::new("twice");
    twice.op(Op::LoadLocal("n".into()), at(1));
    twice.op(
        Op::Call {
            callee: "square".into(),
            argc: 1,
        },
        at(1),
    );
    twice.op(Op::PushInt(2), at(1));
    twice.op(Op::Binary(BinOp::Mul), at(1));
    twice.op(Op::Return { has_value: true }, at(1));
    let twice = twice.param("n", TypeDesc::Int);

    let mut main = FunctionBuilder::new("main");
    main.stmt(Op::PushInt(3), at(2));
    main.op(
        Op::Call {
            callee: "twice".into(),
            argc: 1,
        },
        at(2),
    );
    main.op(Op::Return { has_value: true }, at(2));

    let mut builder = ProgramBuilder::new();
    builder.add_function(square.finish());
    builder.add_function(twice.finish());
    builder.add_function(main.finish());
    let machine = machine_for(builder.build("main").unwrap());

    let end = run_to_end(&machine, machine.start());
    // twice(3) = square(3) * 2
    assert_eq!(end.exit_value, Some(Scalar::Int(18)));
    assert!(end.frames.is_empty());
}

// === HEAP INTEGRATION TESTS ===

#[test]
fn test_heap_block_write_read_free() {
    let mut main = FunctionBuilder::new("main");
    main.stmt(
        Op::Declare {
            name: "p".into(),
            ty: TypeDesc::Int.pointer_to(),
        },
        at(0),
    );
    main.stmt(Op::PushInt(8), at(1));
    main.op(
        Op::Call {
            callee: "malloc".into(),
            argc: 1,
        },
        at(1),
    );
    main.op(Op::StoreLocal("p".into()), at(1));
    main.stmt(Op::LoadLocal("p".into()), at(2));
    main.op(Op::PushInt(7), at(2));
    main.op(
        Op::StoreIndirect {
            ty: TypeDesc::Int,
        },
        at(2),
    );
    main.stmt(Op::LoadLocal("p".into()), at(3));
    main.op(
        Op::LoadIndirect {
            ty: TypeDesc::Int,
        },
        at(3),
    );
    main.stmt(Op::LoadLocal("p".into()), at(4));
    main.op(
        Op::Call {
            callee: "free".into(),
            argc: 1,
        },
        at(4),
    );
    main.op(Op::Pop, at(4));
    main.op(Op::Return { has_value: true }, at(5));

    let mut builder = ProgramBuilder::new();
    builder.add_function(main.finish());
    let machine = machine_for(builder.build("main").unwrap());

    let end = run_to_end(&machine, machine.start());
    assert!(end.terminated());
    assert_eq!(end.exit_value, Some(Scalar::Int(7)));
}

#[test]
fn test_double_free_traps() {
    let mut main = FunctionBuilder::new("main");
    main.stmt(
        Op::Declare {
            name: "p".into(),
            ty: TypeDesc::Int.pointer_to(),
        },
        at(0),
    );
    main.stmt(Op::PushInt(4), at(1));
    main.op(
        Op::Call {
            callee: "malloc".into(),
            argc: 1,
        },
        at(1),
    );
    main.op(Op::StoreLocal("p".into()), at(1));
    for n in 2..4 {
        main.stmt(Op::LoadLocal("p".into()), at(n));
        main.op(
            Op::Call {
                callee: "free".into(),
                argc: 1,
            },
            at(n),
        );
        main.op(Op::Pop, at(n));
    }
    main.op(Op::Return { has_value: false }, at(4));

    let mut builder = ProgramBuilder::new();
    builder.add_function(main.finish());
    let mut stepper = Stepper::new(machine_for(builder.build("main").unwrap()));

    let outcome = stepper.exec(&StepCommand::new(StepMode::Run)).unwrap();
    assert_eq!(outcome, StepOutcome::Trapped);
    assert!(matches!(stepper.state().error, Some(Trap::DoubleFree { .. })));
    assert_eq!(stepper.status(), StepperStatus::Errored);
}

#[test]
fn test_use_after_free_traps_on_load() {
    let mut main = FunctionBuilder::new("main");
    main.stmt(
        Op::Declare {
            name: "p".into(),
            ty: TypeDesc::Int.pointer_to(),
        },
        at(0),
    );
    main.stmt(Op::PushInt(4), at(1));
    main.op(
        Op::Call {
            callee: "malloc".into(),
            argc: 1,
        },
        at(1),
    );
    main.op(Op::StoreLocal("p".into()), at(1));
    main.stmt(Op::LoadLocal("p".into()), at(2));
    main.op(
        Op::Call {
            callee: "free".into(),
            argc: 1,
        },
        at(2),
    );
    main.op(Op::Pop, at(2));
    main.stmt(Op::LoadLocal("p".into()), at(3));
    main.op(
        Op::LoadIndirect {
            ty: TypeDesc::Int,
        },
        at(3),
    );
    main.op(Op::Return { has_value: true }, at(3));

    let mut builder = ProgramBuilder::new();
    builder.add_function(main.finish());
    let machine = machine_for(builder.build("main").unwrap());

    let end = run_to_end(&machine, machine.start());
    assert!(matches!(end.error, Some(Trap::UseAfterFree { .. })));
}

#[test]
fn test_null_dereference_traps() {
    let mut main = FunctionBuilder::new("main");
    main.stmt(Op::PushNull, at(0));
    main.op(
        Op::LoadIndirect {
            ty: TypeDesc::Int,
        },
        at(0),
    );
    main.op(Op::Return { has_value: true }, at(0));

    let mut builder = ProgramBuilder::new();
    builder.add_function(main.finish());
    let machine = machine_for(builder.build("main").unwrap());

    let end = run_to_end(&machine, machine.start());
    assert!(matches!(end.error, Some(Trap::NullDereference { .. })));
}

// === TERMINAL AND INPUT TESTS ===

#[test]
fn test_scanf_printf_round_trip_with_upfront_input() {
    let mut builder = ProgramBuilder::new();
    let scan_fmt = builder.intern_string("%d %d");
    let print_fmt = builder.intern_string("sum=%d\n");

    let mut main = FunctionBuilder::new("main");
    for name in ["a", "b"] {
        main.stmt(
            Op::Declare {
                name: name.into(),
                ty: TypeDesc::Int,
            },
            at(0),
        );
    }
    main.stmt(Op::PushStr(scan_fmt), at(1));
    main.op(Op::AddrOfLocal("a".into()), at(1));
    main.op(Op::AddrOfLocal("b".into()), at(1));
    main.op(
        Op::Call {
            callee: "scanf".into(),
            argc: 3,
        },
        at(1),
    );
    main.op(Op::Pop, at(1));
    main.stmt(Op::PushStr(print_fmt), at(2));
    main.op(Op::LoadLocal("a".into()), at(2));
    main.op(Op::LoadLocal("b".into()), at(2));
    main.op(Op::Binary(BinOp::Add), at(2));
    main.op(
        Op::Call {
            callee: "printf".into(),
            argc: 2,
        },
        at(2),
    );
    main.op(Op::Pop, at(2));
    main.op(Op::Return { has_value: false }, at(3));
    builder.add_function(main.finish());

    let machine = Machine::new(
        builder.build("main").unwrap(),
        default_builtins(),
        MachineOptions {
            input: "3 4\n".into(),
            ..MachineOptions::default()
        },
    );

    let end = run_to_end(&machine, machine.start());
    assert!(end.terminated());
    assert_eq!(end.terminal.text(), "sum=7\n");
    assert_eq!(end.input.remaining(), 0);
}

#[test]
fn test_awaiting_input_pauses_and_resumes_through_the_stepper() {
    let mut builder = ProgramBuilder::new();
    let scan_fmt = builder.intern_string("%d");
    let print_fmt = builder.intern_string("got %d");

    let mut main = FunctionBuilder::new("main");
    main.stmt(
        Op::Declare {
            name: "n".into(),
            ty: TypeDesc::Int,
        },
        at(0),
    );
    main.stmt(Op::PushStr(scan_fmt), at(1));
    main.op(Op::AddrOfLocal("n".into()), at(1));
    main.op(
        Op::Call {
            callee: "scanf".into(),
            argc: 2,
        },
        at(1),
    );
    main.op(Op::Pop, at(1));
    main.stmt(Op::PushStr(print_fmt), at(2));
    main.op(Op::LoadLocal("n".into()), at(2));
    main.op(
        Op::Call {
            callee: "printf".into(),
            argc: 2,
        },
        at(2),
    );
    main.op(Op::Pop, at(2));
    main.op(Op::Return { has_value: false }, at(3));
    builder.add_function(main.finish());

    let machine = Machine::new(
        builder.build("main").unwrap(),
        default_builtins(),
        MachineOptions {
            input_policy: InputPolicy::Suspend,
            ..MachineOptions::default()
        },
    );
    let mut stepper = Stepper::new(machine);

    let outcome = stepper.exec(&StepCommand::new(StepMode::Run)).unwrap();
    assert_eq!(outcome, StepOutcome::AwaitingInput);
    assert_eq!(stepper.status(), StepperStatus::AwaitingInput);
    let waited_at = stepper.state().steps_taken;

    stepper.provide_input("12\n");
    let outcome = stepper.exec(&StepCommand::new(StepMode::Run)).unwrap();
    assert_eq!(outcome, StepOutcome::Terminated);
    assert!(stepper.state().steps_taken > waited_at);
    assert_eq!(stepper.state().terminal.text(), "got 12");
}

#[test]
fn test_terminal_newlines_split_lines() {
    let mut builder = ProgramBuilder::new();
    let fmt = builder.intern_string("one\ntwo\n");

    let mut main = FunctionBuilder::new("main");
    main.stmt(Op::PushStr(fmt), at(0));
    main.op(
        Op::Call {
            callee: "printf".into(),
            argc: 1,
        },
        at(0),
    );
    main.op(Op::Pop, at(0));
    main.op(Op::Return { has_value: false }, at(1));
    builder.add_function(main.finish());
    let machine = machine_for(builder.build("main").unwrap());

    let end = run_to_end(&machine, machine.start());
    assert_eq!(end.terminal.lines(), ["one", "two", ""]);
}

// === ERROR AND BUDGET SEPARATION ===

#[test]
fn test_runtime_trap_and_step_budget_are_distinct_failures() {
    // A program that traps: the session error stays on the state.
    let mut bad = FunctionBuilder::new("main");
    bad.stmt(Op::PushInt(1), at(0));
    bad.op(Op::PushInt(0), at(0));
    bad.op(Op::Binary(BinOp::Mod), at(0));
    bad.op(Op::Return { has_value: true }, at(0));
    let mut builder = ProgramBuilder::new();
    builder.add_function(bad.finish());
    let mut trapped = Stepper::new(machine_for(builder.build("main").unwrap()));
    let outcome = trapped.exec(&StepCommand::new(StepMode::Run)).unwrap();
    assert_eq!(outcome, StepOutcome::Trapped);
    assert_eq!(trapped.state().error, Some(Trap::DivisionByZero));

    // A program that spins: the failure is the command's, not the state's.
    let mut spin = FunctionBuilder::new("main");
    spin.stmt(Op::Jump(0), at(0));
    let mut builder = ProgramBuilder::new();
    builder.add_function(spin.finish());
    let mut starved = Stepper::with_options(
        machine_for(builder.build("main").unwrap()),
        glassbox::stepper::StepperOptions {
            step_ceiling: 50,
            ..Default::default()
        },
    );
    let error = starved.exec(&StepCommand::new(StepMode::Run)).unwrap_err();
    assert_eq!(
        error,
        glassbox::stepper::StepError::BudgetExceeded { steps: 50 }
    );
    assert!(starved.state().error.is_none());
}
