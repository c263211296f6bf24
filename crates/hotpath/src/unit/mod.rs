//! Binary code-unit format.
//!
//! A code unit is the compiled form of one top-level or nested type: a name,
//! an optional source file name and a list of methods. Each method carries a
//! stack-machine instruction stream addressed by absolute byte offsets (pcs),
//! a line table mapping pcs to source lines, exception handler ranges, and
//! derived stack metadata (`max_stack` plus a frame table holding the operand
//! stack depth at every branch and handler target).
//!
//! The derived metadata is what makes rewriting delicate: inserting a single
//! instruction moves every later pc and can raise the stack high-water mark.
//! [`events`] lifts code into a label-based stream where insertions are safe,
//! and [`analysis`] recomputes the metadata after lowering.

pub mod analysis;
pub mod builder;
pub mod codec;
pub mod events;

pub use analysis::{StackSummary, compute_frames};
pub use builder::{MethodBuilder, UnitBuilder};
pub use codec::{decode, encode, peek_name};
pub use events::{Event, Label, MethodEvents, lift, lower};

use thiserror::Error;

pub const MAGIC: [u8; 4] = *b"HPU\x01";
pub const FORMAT_VERSION: u16 = 1;

/// Separates an enclosing unit from its nested units (`a/b/Outer$Inner`).
pub const NESTING_SEPARATOR: char = '$';

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnitError {
    #[error("unexpected end of data at offset {offset} ({needed} more bytes needed)")]
    Truncated { offset: usize, needed: usize },

    #[error("bad magic {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("unsupported format version {0}")]
    UnsupportedVersion(u16),

    #[error("invalid constant pool index {0}")]
    BadPoolIndex(u16),

    #[error("constant pool entry {index} is not {expected}")]
    PoolKind { index: u16, expected: &'static str },

    #[error("unknown constant pool tag {0}")]
    BadPoolTag(u8),

    #[error("invalid UTF-8 in constant pool entry {0}")]
    BadUtf8(u16),

    #[error("unknown opcode 0x{opcode:02x} at pc {pc}")]
    UnknownOpcode { opcode: u8, pc: u32 },

    #[error("{what} pc {pc} is not an instruction boundary")]
    BadTarget { what: &'static str, pc: u32 },

    #[error("{0} trailing bytes after the last method")]
    TrailingBytes(usize),

    #[error("too many {what} (limit {limit})")]
    TooMany { what: &'static str, limit: usize },

    #[error("label {0} is referenced but never placed")]
    UnboundLabel(u32),

    #[error("label {0} is placed twice")]
    DuplicateLabel(u32),

    #[error("operand stack underflow at pc {pc}")]
    StackUnderflow { pc: u32 },

    #[error("operand stack depth exceeds {limit} at pc {pc}", limit = u16::MAX)]
    StackTooDeep { pc: u32 },

    #[error("inconsistent stack depth at pc {pc}: {expected} vs {found}")]
    DepthMismatch { pc: u32, expected: u16, found: u16 },

    #[error("execution can run off the end of the code after pc {pc}")]
    FallsOffEnd { pc: u32 },

    #[error("local slot {slot} at pc {pc} is outside max_locals {max_locals}")]
    BadLocal { pc: u32, slot: u16, max_locals: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Const {
    Int(i64),
    Str(String),
}

/// One instruction. `T` is the branch target: an absolute pc in encoded form,
/// a [`Label`] in the event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op<T = u32> {
    Nop,
    Push(Const),
    Load(u16),
    Store(u16),
    Add,
    Sub,
    Mul,
    Lt,
    Dup,
    Pop,
    Goto(T),
    IfZero(T),
    IfNonZero(T),
    Invoke {
        owner: String,
        name: String,
        argc: u8,
        returns: bool,
    },
    Throw,
    Return,
    ReturnVoid,
}

pub mod opcode {
    pub const NOP: u8 = 0x00;
    pub const PUSH: u8 = 0x01;
    pub const LOAD: u8 = 0x02;
    pub const STORE: u8 = 0x03;
    pub const ADD: u8 = 0x04;
    pub const SUB: u8 = 0x05;
    pub const MUL: u8 = 0x06;
    pub const LT: u8 = 0x07;
    pub const DUP: u8 = 0x08;
    pub const POP: u8 = 0x09;
    pub const GOTO: u8 = 0x10;
    pub const IFZ: u8 = 0x11;
    pub const IFNZ: u8 = 0x12;
    pub const INVOKE: u8 = 0x20;
    pub const THROW: u8 = 0x30;
    pub const RETURN: u8 = 0x31;
    pub const RETURN_VOID: u8 = 0x32;
}

impl<T> Op<T> {
    pub fn opcode(&self) -> u8 {
        match self {
            Op::Nop => opcode::NOP,
            Op::Push(_) => opcode::PUSH,
            Op::Load(_) => opcode::LOAD,
            Op::Store(_) => opcode::STORE,
            Op::Add => opcode::ADD,
            Op::Sub => opcode::SUB,
            Op::Mul => opcode::MUL,
            Op::Lt => opcode::LT,
            Op::Dup => opcode::DUP,
            Op::Pop => opcode::POP,
            Op::Goto(_) => opcode::GOTO,
            Op::IfZero(_) => opcode::IFZ,
            Op::IfNonZero(_) => opcode::IFNZ,
            Op::Invoke { .. } => opcode::INVOKE,
            Op::Throw => opcode::THROW,
            Op::Return => opcode::RETURN,
            Op::ReturnVoid => opcode::RETURN_VOID,
        }
    }

    /// Size in bytes of the encoded instruction, operands included.
    pub fn encoded_len(&self) -> u32 {
        match self {
            Op::Push(_) | Op::Load(_) | Op::Store(_) => 3,
            Op::Goto(_) | Op::IfZero(_) | Op::IfNonZero(_) => 5,
            Op::Invoke { .. } => 7,
            _ => 1,
        }
    }

    /// Values popped and pushed.
    pub fn stack_effect(&self) -> (u16, u16) {
        match self {
            Op::Nop | Op::Goto(_) | Op::ReturnVoid => (0, 0),
            Op::Push(_) | Op::Load(_) => (0, 1),
            Op::Store(_) | Op::Pop | Op::IfZero(_) | Op::IfNonZero(_) => (1, 0),
            Op::Throw | Op::Return => (1, 0),
            Op::Add | Op::Sub | Op::Mul | Op::Lt => (2, 1),
            Op::Dup => (1, 2),
            Op::Invoke { argc, returns, .. } => (u16::from(*argc), u16::from(*returns)),
        }
    }

    /// Whether control can continue with the next instruction.
    pub fn falls_through(&self) -> bool {
        !matches!(
            self,
            Op::Goto(_) | Op::Throw | Op::Return | Op::ReturnVoid
        )
    }

    pub fn target(&self) -> Option<&T> {
        match self {
            Op::Goto(t) | Op::IfZero(t) | Op::IfNonZero(t) => Some(t),
            _ => None,
        }
    }

    pub fn local_slot(&self) -> Option<u16> {
        match self {
            Op::Load(slot) | Op::Store(slot) => Some(*slot),
            _ => None,
        }
    }

    /// Rewrite the branch target, leaving every other operand untouched.
    pub fn try_map_target<U, E>(self, f: impl FnOnce(T) -> Result<U, E>) -> Result<Op<U>, E> {
        Ok(match self {
            Op::Goto(t) => Op::Goto(f(t)?),
            Op::IfZero(t) => Op::IfZero(f(t)?),
            Op::IfNonZero(t) => Op::IfNonZero(f(t)?),
            Op::Nop => Op::Nop,
            Op::Push(c) => Op::Push(c),
            Op::Load(s) => Op::Load(s),
            Op::Store(s) => Op::Store(s),
            Op::Add => Op::Add,
            Op::Sub => Op::Sub,
            Op::Mul => Op::Mul,
            Op::Lt => Op::Lt,
            Op::Dup => Op::Dup,
            Op::Pop => Op::Pop,
            Op::Invoke {
                owner,
                name,
                argc,
                returns,
            } => Op::Invoke {
                owner,
                name,
                argc,
                returns,
            },
            Op::Throw => Op::Throw,
            Op::Return => Op::Return,
            Op::ReturnVoid => Op::ReturnVoid,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub pc: u32,
    pub op: Op,
}

/// Exception handler covering `[start, end)`; control enters `target` with the
/// thrown value as the only stack entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handler<T = u32> {
    pub start: T,
    pub end: T,
    pub target: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEntry {
    pub start: u32,
    pub line: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Frame {
    pub pc: u32,
    pub depth: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Method {
    pub name: String,
    /// Arguments land in local slots `0..params`.
    pub params: u8,
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<Instruction>,
    pub handlers: Vec<Handler>,
    pub lines: Vec<LineEntry>,
    pub frames: Vec<Frame>,
}

impl Method {
    pub fn code_len(&self) -> u32 {
        self.code
            .last()
            .map(|insn| insn.pc + insn.op.encoded_len())
            .unwrap_or(0)
    }

    /// Instruction index for a pc, if the pc starts an instruction.
    pub fn index_of(&self, pc: u32) -> Option<usize> {
        self.code.binary_search_by_key(&pc, |insn| insn.pc).ok()
    }

    /// Source line in effect at `pc` according to the line table.
    pub fn line_at(&self, pc: u32) -> Option<u32> {
        self.lines
            .iter()
            .filter(|entry| entry.start <= pc)
            .max_by_key(|entry| entry.start)
            .map(|entry| entry.line)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeUnit {
    /// Internal name with `/` separators.
    pub name: String,
    pub source: Option<String>,
    pub methods: Vec<Method>,
}

impl CodeUnit {
    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.iter().find(|m| m.name == name)
    }
}

/// `a/b/Outer$Inner` -> `a.b.Outer$Inner`
pub fn dotted(name: &str) -> String {
    name.replace('/', ".")
}

/// `a.b.Outer$Inner` -> `a/b/Outer$Inner`
pub fn internal(name: &str) -> String {
    name.replace('.', "/")
}
