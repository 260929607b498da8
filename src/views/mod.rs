//! Rendering-neutral views of variables and frames.
//!
//! A view is a plain serializable tree: the UI decides pixels, this module
//! decides content. Reads go through the lenient peek path so inspecting a
//! variable never perturbs the access log, and every view construction
//! threads a [`ScalarBudget`] so one giant array cannot stall the session.
//! When the budget runs out mid-array the cells end with a single trailing
//! [`Value::Ellipsis`] cell carrying the index where truncation happened;
//! each nesting level of a multi-dimensional array truncates independently.

pub mod graph;

use serde::Serialize;

use crate::machine::state::{Frame, MachineState};
use crate::machine::Machine;
use crate::memory::{MemoryStore, Reference, Scalar};
use crate::program::{Directive, DirectiveArg, TypeDesc};

/// Scalars one local's ambient view may read.
pub const FRAME_SCALAR_BUDGET: usize = 15;

/// Scalars a focused single-variable view may read.
pub const DETAIL_SCALAR_BUDGET: usize = 100;

/// Counts scalar reads against a cap during one view construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalarBudget {
    used: usize,
    max: usize,
}

impl ScalarBudget {
    pub fn new(max: usize) -> Self {
        ScalarBudget { used: 0, max }
    }

    /// The ambient budget each local of a frame view gets.
    pub fn frame() -> Self {
        ScalarBudget::new(FRAME_SCALAR_BUDGET)
    }

    /// The focused single-variable budget.
    pub fn detail() -> Self {
        ScalarBudget::new(DETAIL_SCALAR_BUDGET)
    }

    pub fn exhausted(&self) -> bool {
        self.used >= self.max
    }

    pub fn used(&self) -> usize {
        self.used
    }

    fn take(&mut self) -> bool {
        if self.used < self.max {
            self.used += 1;
            true
        } else {
            false
        }
    }
}

/// One rendered array cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cell {
    pub index: u32,
    pub address: u64,
    pub value: Value,
}

/// A rendered value tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Value {
    Scalar {
        /// Decoded cell contents; `None` when the cell is unreadable.
        current: Option<Scalar>,
        /// Contents before the most recent overlapping store, if any.
        previous: Option<Scalar>,
        /// Rank of the earliest overlapping load in the access log.
        load_rank: Option<u64>,
        /// Rank of the latest overlapping store in the access log.
        store_rank: Option<u64>,
    },
    Array {
        /// Declared element count, when the type carries one.
        count: Option<u32>,
        cells: Vec<Cell>,
    },
    /// Stands in for everything the budget did not cover.
    Ellipsis,
}

/// Builds the view for one cell or array under `budget`.
pub fn build_view(memory: &MemoryStore, reference: &Reference, budget: &mut ScalarBudget) -> Value {
    match &reference.ty {
        TypeDesc::Array { elem, count } => {
            build_array(memory, reference.address, elem, *count, budget)
        }
        _ => build_scalar(memory, reference, budget),
    }
}

fn build_scalar(memory: &MemoryStore, reference: &Reference, budget: &mut ScalarBudget) -> Value {
    if !budget.take() {
        return Value::Ellipsis;
    }
    let summary = memory.query_log(reference);
    Value::Scalar {
        current: memory.peek_scalar(reference).ok(),
        previous: memory.previous_scalar(reference),
        load_rank: summary.load_rank,
        store_rank: summary.store_rank,
    }
}

fn build_array(
    memory: &MemoryStore,
    base: u64,
    elem: &TypeDesc,
    count: Option<u32>,
    budget: &mut ScalarBudget,
) -> Value {
    let Some(stride) = elem.size_bytes() else {
        return Value::Array {
            count,
            cells: vec![Cell {
                index: 0,
                address: base,
                value: Value::Ellipsis,
            }],
        };
    };

    let mut cells = Vec::new();
    match count {
        // Without a length nothing can be read safely; the whole extent
        // collapses into one ellipsis.
        None => cells.push(Cell {
            index: 0,
            address: base,
            value: Value::Ellipsis,
        }),
        Some(n) => {
            for index in 0..n {
                let address = base + u64::from(index) * stride;
                // The budget is consulted before each element, so a run
                // that ends exactly at the last element shows no ellipsis.
                if budget.exhausted() {
                    cells.push(Cell {
                        index,
                        address,
                        value: Value::Ellipsis,
                    });
                    break;
                }
                let value = match elem {
                    TypeDesc::Array {
                        elem: inner,
                        count: inner_count,
                    } => build_array(memory, address, inner, *inner_count, budget),
                    _ => build_scalar(memory, &Reference::new(address, elem.clone()), budget),
                };
                cells.push(Cell {
                    index,
                    address,
                    value,
                });
            }
        }
    }
    Value::Array { count, cells }
}

/// One local with its rendered value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariableView {
    pub name: String,
    pub ty: String,
    pub address: u64,
    pub value: Value,
}

/// One call-stack frame rendered for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameView {
    pub function: String,
    pub args: Vec<Scalar>,
    pub directives: Vec<Directive>,
    pub locals: Vec<VariableView>,
}

/// Renders one frame. Locals appear in declaration order, each under its
/// own ambient budget, so one oversized array truncates itself without
/// blanking out its neighbors.
pub fn view_frame(machine: &Machine, state: &MachineState, frame_index: usize) -> Option<FrameView> {
    let frame = state.frames.get(frame_index)?;
    let decl = machine.program().function(frame.function)?;

    let locals = frame
        .local_names()
        .iter()
        .filter_map(|name| {
            let reference = frame.local(name)?;
            let mut budget = ScalarBudget::frame();
            Some(VariableView {
                name: name.clone(),
                ty: reference.ty.to_string(),
                address: reference.address,
                value: build_view(&state.memory, reference, &mut budget),
            })
        })
        .collect();

    Some(FrameView {
        function: decl.name.clone(),
        args: frame.args.clone(),
        directives: frame.directives.clone(),
        locals,
    })
}

/// Renders every frame, outermost first.
pub fn view_stack(machine: &Machine, state: &MachineState) -> Vec<FrameView> {
    (0..state.frames.len())
        .filter_map(|index| view_frame(machine, state, index))
        .collect()
}

/// Renders one local of the innermost frame under the larger focused
/// budget.
pub fn view_variable(state: &MachineState, name: &str) -> Option<VariableView> {
    let frame = state.top_frame()?;
    let reference = frame.local(name)?;
    let mut budget = ScalarBudget::detail();
    Some(VariableView {
        name: name.to_string(),
        ty: reference.ty.to_string(),
        address: reference.address,
        value: build_view(&state.memory, reference, &mut budget),
    })
}

/// Resolves a directive argument to a number: literals directly, names
/// through the frame's locals.
pub fn directive_number(state: &MachineState, frame: &Frame, arg: &DirectiveArg) -> Option<i64> {
    if let Some(n) = arg.as_number() {
        return Some(n);
    }
    let reference = frame.local(arg.as_ident()?)?;
    let value = state.memory.peek_scalar(reference).ok()?;
    value.as_arith().map(i64::from)
}
