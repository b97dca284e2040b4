use std::fmt;

use thiserror::Error;

use crate::binary::types::ValueType;

/// Index spaces a module can refer into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexSpace {
    Type,
    Function,
    Table,
    Memory,
    Global,
    Local,
    Label,
}

impl fmt::Display for IndexSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IndexSpace::Type => "type",
            IndexSpace::Function => "function",
            IndexSpace::Table => "table",
            IndexSpace::Memory => "memory",
            IndexSpace::Global => "global",
            IndexSpace::Local => "local",
            IndexSpace::Label => "label",
        };
        f.write_str(name)
    }
}

/// Errors raised while decoding a binary module. Decoding stops at the first one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("bad magic number or version")]
    BadHeader,

    #[error("unexpected end of input at offset {offset}")]
    UnexpectedEof { offset: usize },

    #[error("LEB128 value too long for its target width at offset {offset}")]
    LebOverflow { offset: usize },

    #[error("invalid UTF-8 in name at offset {offset}")]
    InvalidUtf8 { offset: usize },

    #[error("section {section} declares {declared} bytes but decoding consumed {consumed}")]
    SectionSizeMismatch {
        section: u8,
        declared: u32,
        consumed: usize,
    },

    #[error("section {section} is duplicated or out of order")]
    SectionOrder { section: u8 },

    #[error("unknown section id {id} at offset {offset}")]
    UnknownSection { id: u8, offset: usize },

    #[error("unknown opcode {opcode:#04x} at offset {offset}")]
    UnknownOpcode { opcode: u8, offset: usize },

    #[error("invalid value type {0:#04x}")]
    InvalidValueType(u8),

    #[error("malformed module: {0}")]
    MalformedModule(String),

    #[error("{space} index {index} out of range (len {len})")]
    IndexOutOfRange {
        space: IndexSpace,
        index: u32,
        len: usize,
    },
}

impl DecodeError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        DecodeError::MalformedModule(reason.into())
    }
}

/// Errors raised while instantiating a module. No guest code has run when
/// one of these is returned, except for [`LinkError::Start`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("unresolved import {module}.{name}")]
    MissingImport { module: String, name: String },

    #[error("incompatible import {module}.{name}: {reason}")]
    IncompatibleImport {
        module: String,
        name: String,
        reason: String,
    },

    #[error("element segment {0} does not fit in its table")]
    ElementSegmentOutOfBounds(usize),

    #[error("data segment {0} does not fit in memory")]
    DataSegmentOutOfBounds(usize),

    #[error("memory of {pages} pages exceeds the limit of {limit} pages")]
    MemoryLimitExceeded { pages: u32, limit: u32 },

    #[error("start function trapped: {0}")]
    Start(#[source] Trap),
}

/// Run-time faults. A trap aborts the current top-level invocation only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Trap {
    #[error("unreachable executed")]
    Unreachable,

    #[error("integer divide by zero")]
    DivisionByZero,

    #[error("integer overflow")]
    IntegerOverflow,

    #[error("invalid conversion to integer")]
    InvalidConversion,

    #[error("out of bounds memory access")]
    MemoryOutOfBounds,

    #[error("indirect call type mismatch")]
    IndirectCallTypeMismatch,

    #[error("undefined element")]
    UndefinedElement,

    #[error("call stack exhausted")]
    CallStackExhausted,

    #[error("all fuel consumed")]
    OutOfFuel,

    #[error("operand stack underflow")]
    StackUnderflow,

    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: ValueType,
        found: ValueType,
    },

    #[error("export function not found: {0}")]
    ExportNotFound(String),

    #[error("arguments do not match the signature of {0}")]
    ArgumentMismatch(String),

    #[error("host function {module}.{name} failed: {message}")]
    Host {
        module: String,
        name: String,
        message: String,
    },
}
