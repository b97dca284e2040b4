use super::{
    instruction::Instruction,
    types::{ExportDesc, GlobalType, ImportDesc, Limits, ValueType},
};
use num_derive::FromPrimitive;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum SectionCode {
    Custom = 0x00,
    Type = 0x01,
    Import = 0x02,
    Function = 0x03,
    Table = 0x04,
    Memory = 0x05,
    Global = 0x06,
    Export = 0x07,
    Start = 0x08,
    Element = 0x09,
    Code = 0x0a,
    Data = 0x0b,
    DataCount = 0x0c,
}

impl SectionCode {
    /// Position in the mandatory section order. `DataCount` sits between
    /// `Element` and `Code` even though its id is larger.
    pub fn rank(self) -> u8 {
        match self {
            SectionCode::Custom => 0,
            SectionCode::Type => 1,
            SectionCode::Import => 2,
            SectionCode::Function => 3,
            SectionCode::Table => 4,
            SectionCode::Memory => 5,
            SectionCode::Global => 6,
            SectionCode::Export => 7,
            SectionCode::Start => 8,
            SectionCode::Element => 9,
            SectionCode::DataCount => 10,
            SectionCode::Code => 11,
            SectionCode::Data => 12,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Memory {
    pub limits: Limits,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub limits: Limits,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    pub module: String,
    pub field: String,
    pub desc: ImportDesc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    pub name: String,
    pub desc: ExportDesc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Global {
    pub ty: GlobalType,
    pub init: Vec<Instruction>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Data {
    pub memory_idx: u32,
    pub offset: Vec<Instruction>,
    pub init: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub table_idx: u32,
    pub offset: Vec<Instruction>,
    pub init: Vec<u32>,
}

#[derive(Default, Debug, Clone, PartialEq)]
pub struct Function {
    pub type_idx: u32,
    pub locals: Vec<ValueType>,
    pub body: Vec<Instruction>,
}
