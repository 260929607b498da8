//! Program representation consumed by the abstract machine.
//!
//! A front-end (parser, compiler, or a test fixture using [`ProgramBuilder`])
//! lowers source text into a [`Program`]: per-function streams of
//! [`ControlNode`]s, each pairing one atomic operation with its source range
//! and stepping flags, plus the scope blocks and display [`Directive`]s the
//! view layer consumes. The machine treats all of it as read-only.

use std::fmt;

use rustc_hash::FxHashMap;
use serde::Serialize;
use thiserror::Error;

/// Half-open byte span in the original source text, used for highlighting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SourceRange {
    pub start: u32,
    pub end: u32,
}

impl SourceRange {
    pub fn new(start: u32, end: u32) -> Self {
        SourceRange { start, end }
    }
}

impl fmt::Display for SourceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Type descriptor attached to declarations and references.
///
/// Sizes follow the fixed data model of the flat memory image: int 4 bytes,
/// char 1 byte, pointers 8 bytes, little-endian throughout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TypeDesc {
    Int,
    Char,
    Pointer(Box<TypeDesc>),
    /// Array of `elem`; `count` is `None` when the extent is not statically
    /// known (e.g. a pointer viewed as an open array).
    Array {
        elem: Box<TypeDesc>,
        count: Option<u32>,
    },
    /// A function designator, as seen through a function pointer.
    Function,
}

impl TypeDesc {
    /// Storage footprint in bytes; `None` for arrays of unknown count.
    pub fn size_bytes(&self) -> Option<u64> {
        match self {
            TypeDesc::Int => Some(4),
            TypeDesc::Char => Some(1),
            TypeDesc::Pointer(_) | TypeDesc::Function => Some(8),
            TypeDesc::Array { elem, count } => {
                let count = (*count)? as u64;
                Some(elem.size_bytes()? * count)
            }
        }
    }

    /// Wrap `self` as the pointee of a pointer type.
    pub fn pointer_to(self) -> TypeDesc {
        TypeDesc::Pointer(Box::new(self))
    }

    /// Wrap `self` as the element of an array type.
    pub fn array_of(self, count: Option<u32>) -> TypeDesc {
        TypeDesc::Array {
            elem: Box::new(self),
            count,
        }
    }
}

impl fmt::Display for TypeDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeDesc::Int => write!(f, "int"),
            TypeDesc::Char => write!(f, "char"),
            TypeDesc::Pointer(pointee) => write!(f, "{}*", pointee),
            TypeDesc::Array { elem, count } => match count {
                Some(n) => write!(f, "{}[{}]", elem, n),
                None => write!(f, "{}[]", elem),
            },
            TypeDesc::Function => write!(f, "function"),
        }
    }
}

/// One argument of a display directive.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum DirectiveArg {
    Ident(String),
    Number(i64),
    List(Vec<DirectiveArg>),
}

impl DirectiveArg {
    pub fn as_ident(&self) -> Option<&str> {
        match self {
            DirectiveArg::Ident(name) => Some(name),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<i64> {
        match self {
            DirectiveArg::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[DirectiveArg]> {
        match self {
            DirectiveArg::List(items) => Some(items),
            _ => None,
        }
    }
}

/// Display metadata attached to a declaration or scope block.
///
/// Directives are scope-local: entering a scope or making a call replaces
/// the active list wholesale, it is never merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Directive {
    pub kind: String,
    pub by_pos: Vec<DirectiveArg>,
    pub by_name: FxHashMap<String, DirectiveArg>,
}

impl Directive {
    pub fn new(kind: &str) -> Self {
        Directive {
            kind: kind.to_string(),
            by_pos: Vec::new(),
            by_name: FxHashMap::default(),
        }
    }

    pub fn with_pos(mut self, arg: DirectiveArg) -> Self {
        self.by_pos.push(arg);
        self
    }

    pub fn with_named(mut self, name: &str, arg: DirectiveArg) -> Self {
        self.by_name.insert(name.to_string(), arg);
        self
    }

    pub fn pos(&self, index: usize) -> Option<&DirectiveArg> {
        self.by_pos.get(index)
    }

    pub fn named(&self, name: &str) -> Option<&DirectiveArg> {
        self.by_name.get(name)
    }
}

/// Binary operators on int operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Unary operators on int operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
}

/// One atomic operation of the control stream.
///
/// Operand-stack discipline: operands are pushed left to right, so a
/// two-operand node pops its right operand first.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    PushInt(i32),
    PushChar(i8),
    PushNull,
    /// Push a pointer to the interned string literal at this table index.
    PushStr(usize),
    /// Push the address of a local as a pointer value.
    AddrOfLocal(String),
    /// Pop an element index, then a base pointer; push the element address.
    Index { elem: TypeDesc },
    /// Read a local's cell, logging the load, and push its value.
    LoadLocal(String),
    /// Pop an address and read through it as `ty`, logging the load.
    LoadIndirect { ty: TypeDesc },
    /// Pop a value and store it into a local's cell, logging the store.
    StoreLocal(String),
    /// Pop a value, then an address; store through it as `ty`.
    StoreIndirect { ty: TypeDesc },
    Binary(BinOp),
    Unary(UnOp),
    Jump(usize),
    /// Pop a scalar and jump when it is zero.
    JumpIfZero(usize),
    /// Call a user function or builtin by name; `argc` operands are popped.
    Call { callee: String, argc: usize },
    /// Return to the caller; `has_value` pops the result off the operands.
    Return { has_value: bool },
    /// Enter the scope block with this index in the owning function.
    Enter(usize),
    /// Retreat one scope level, dropping directives installed deeper.
    Leave,
    /// Allocate a stack cell for a local and register it in the frame.
    Declare { name: String, ty: TypeDesc },
    /// Discard the top operand (expression statements).
    Pop,
    Halt,
}

/// One control node: an operation plus its source range and stepping flags.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlNode {
    pub op: Op,
    pub range: SourceRange,
    /// Set on learner-visible code; startup auto-advance stops at the first
    /// node carrying it.
    pub user_code: bool,
    /// Statement/expression boundary, consulted by the coarse stepping modes.
    pub boundary: bool,
}

/// A compound statement's display metadata, installed by `Enter`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopeBlock {
    pub directives: Vec<Directive>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub ty: TypeDesc,
}

/// A function declaration: parameters, body stream, scope blocks, and the
/// directives active on entry before any scope is entered.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDecl {
    pub name: String,
    pub params: Vec<Param>,
    pub body: Vec<ControlNode>,
    pub scopes: Vec<ScopeBlock>,
    pub directives: Vec<Directive>,
    pub range: SourceRange,
}

/// A complete executable program: functions, interned string literals, and
/// the entry function index.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub functions: Vec<FunctionDecl>,
    pub strings: Vec<String>,
    pub entry: usize,
}

impl Program {
    pub fn function(&self, index: usize) -> Option<&FunctionDecl> {
        self.functions.get(index)
    }

    pub fn function_named(&self, name: &str) -> Option<(usize, &FunctionDecl)> {
        self.functions
            .iter()
            .enumerate()
            .find(|(_, f)| f.name == name)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProgramError {
    #[error("entry function `{name}` is not defined")]
    UnknownEntry { name: String },
    #[error("function `{name}` is defined more than once")]
    DuplicateFunction { name: String },
    #[error("node {node} of `{function}` jumps to {target}, past the body end {len}")]
    InvalidJumpTarget {
        function: String,
        node: usize,
        target: usize,
        len: usize,
    },
    #[error("node {node} of `{function}` enters scope {scope}, but only {len} are declared")]
    InvalidScope {
        function: String,
        node: usize,
        scope: usize,
        len: usize,
    },
    #[error("node {node} of `{function}` references string literal {index}, but only {len} are interned")]
    InvalidStringIndex {
        function: String,
        node: usize,
        index: usize,
        len: usize,
    },
}

/// Incremental [`Program`] construction, the form front-ends and tests use.
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    functions: Vec<FunctionDecl>,
    strings: Vec<String>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a string literal, reusing an existing slot for duplicates.
    pub fn intern_string(&mut self, text: &str) -> usize {
        if let Some(index) = self.strings.iter().position(|s| s == text) {
            return index;
        }
        self.strings.push(text.to_string());
        self.strings.len() - 1
    }

    pub fn add_function(&mut self, function: FunctionDecl) -> usize {
        self.functions.push(function);
        self.functions.len() - 1
    }

    /// Validate the accumulated functions and seal the program.
    pub fn build(self, entry: &str) -> Result<Program, ProgramError> {
        for (i, f) in self.functions.iter().enumerate() {
            if self.functions[..i].iter().any(|other| other.name == f.name) {
                return Err(ProgramError::DuplicateFunction {
                    name: f.name.clone(),
                });
            }
            for (node, n) in f.body.iter().enumerate() {
                match &n.op {
                    Op::Jump(target) | Op::JumpIfZero(target) => {
                        if *target > f.body.len() {
                            return Err(ProgramError::InvalidJumpTarget {
                                function: f.name.clone(),
                                node,
                                target: *target,
                                len: f.body.len(),
                            });
                        }
                    }
                    Op::Enter(scope) => {
                        if *scope >= f.scopes.len() {
                            return Err(ProgramError::InvalidScope {
                                function: f.name.clone(),
                                node,
                                scope: *scope,
                                len: f.scopes.len(),
                            });
                        }
                    }
                    Op::PushStr(index) => {
                        if *index >= self.strings.len() {
                            return Err(ProgramError::InvalidStringIndex {
                                function: f.name.clone(),
                                node,
                                index: *index,
                                len: self.strings.len(),
                            });
                        }
                    }
                    _ => {}
                }
            }
        }
        let entry_index = self
            .functions
            .iter()
            .position(|f| f.name == entry)
            .ok_or_else(|| ProgramError::UnknownEntry {
                name: entry.to_string(),
            })?;
        Ok(Program {
            functions: self.functions,
            strings: self.strings,
            entry: entry_index,
        })
    }
}

/// Builder for one function's node stream.
#[derive(Debug)]
pub struct FunctionBuilder {
    name: String,
    params: Vec<Param>,
    body: Vec<ControlNode>,
    scopes: Vec<ScopeBlock>,
    directives: Vec<Directive>,
    range: SourceRange,
}

impl FunctionBuilder {
    pub fn new(name: &str) -> Self {
        FunctionBuilder {
            name: name.to_string(),
            params: Vec::new(),
            body: Vec::new(),
            scopes: Vec::new(),
            directives: Vec::new(),
            range: SourceRange::default(),
        }
    }

    pub fn param(mut self, name: &str, ty: TypeDesc) -> Self {
        self.params.push(Param {
            name: name.to_string(),
            ty,
        });
        self
    }

    pub fn directive(mut self, directive: Directive) -> Self {
        self.directives.push(directive);
        self
    }

    pub fn range(mut self, range: SourceRange) -> Self {
        self.range = range;
        self
    }

    /// Register a scope block; the returned index is what `Op::Enter` names.
    pub fn scope(&mut self, directives: Vec<Directive>) -> usize {
        self.scopes.push(ScopeBlock { directives });
        self.scopes.len() - 1
    }

    /// Append a prologue/interior node (no stepping flags).
    pub fn op(&mut self, op: Op, range: SourceRange) -> usize {
        self.body.push(ControlNode {
            op,
            range,
            user_code: false,
            boundary: false,
        });
        self.body.len() - 1
    }

    /// Append a statement-start node: user-visible and a stepping boundary.
    pub fn stmt(&mut self, op: Op, range: SourceRange) -> usize {
        let index = self.op(op, range);
        self.body[index].user_code = true;
        self.body[index].boundary = true;
        index
    }

    /// Index the next appended node will get, for forward jump targets.
    pub fn next_index(&self) -> usize {
        self.body.len()
    }

    /// Re-point a previously appended jump at `target`.
    pub fn patch_jump(&mut self, at: usize, target: usize) {
        match &mut self.body[at].op {
            Op::Jump(t) | Op::JumpIfZero(t) => *t = target,
            _ => {}
        }
    }

    pub fn finish(self) -> FunctionDecl {
        FunctionDecl {
            name: self.name,
            params: self.params,
            body: self.body,
            scopes: self.scopes,
            directives: self.directives,
            range: self.range,
        }
    }
}
