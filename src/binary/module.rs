use super::{
    cursor::Cursor,
    instruction::{
        ConvertOp, FBinOp, FRelOp, FUnOp, IBinOp, IRelOp, IUnOp, Instruction, LoadKind, StoreKind,
    },
    opcode::Opcode,
    section::{Data, Element, Export, Function, Global, Import, Memory, SectionCode, Table},
    types::{
        BlockType, ExportDesc, FuncType, GlobalType, ImportDesc, Limits, MemArg, ValueType,
    },
    validate,
};
use crate::error::{DecodeError, IndexSpace};
use log::{debug, trace};
use num_traits::FromPrimitive as _;

type Result<T> = std::result::Result<T, DecodeError>;

const MAGIC: &[u8] = b"\0asm";
const VERSION: u32 = 1;
const MAX_LOCALS: usize = 50_000;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Module {
    pub types: Vec<FuncType>,
    pub imports: Vec<Import>,
    pub functions: Vec<Function>,
    pub tables: Vec<Table>,
    pub memories: Vec<Memory>,
    pub globals: Vec<Global>,
    pub exports: Vec<Export>,
    pub start: Option<u32>,
    pub elements: Vec<Element>,
    pub data: Vec<Data>,
}

impl Module {
    pub fn new(input: &[u8]) -> Result<Module> {
        decode(input)
    }

    /// Type indices of imported functions, in function index order.
    pub fn imported_funcs(&self) -> impl Iterator<Item = u32> + '_ {
        self.imports.iter().filter_map(|import| match import.desc {
            ImportDesc::Func(type_idx) => Some(type_idx),
            _ => None,
        })
    }

    pub fn imported_func_count(&self) -> usize {
        self.imported_funcs().count()
    }

    pub fn func_count(&self) -> usize {
        self.imported_func_count() + self.functions.len()
    }

    /// Signature of a function in the function index space.
    pub fn func_type(&self, func_idx: u32) -> Option<&FuncType> {
        let idx = func_idx as usize;
        let imported = self.imported_func_count();
        let type_idx = if idx < imported {
            self.imported_funcs().nth(idx)?
        } else {
            self.functions.get(idx - imported)?.type_idx
        };
        self.types.get(type_idx as usize)
    }

    /// Types of the global index space: imported globals first.
    pub fn global_types(&self) -> Vec<GlobalType> {
        self.imports
            .iter()
            .filter_map(|import| match import.desc {
                ImportDesc::Global(ty) => Some(ty),
                _ => None,
            })
            .chain(self.globals.iter().map(|global| global.ty))
            .collect()
    }

    pub fn table_count(&self) -> usize {
        let imported = self
            .imports
            .iter()
            .filter(|import| matches!(import.desc, ImportDesc::Table(_)))
            .count();
        imported + self.tables.len()
    }

    pub fn memory_count(&self) -> usize {
        let imported = self
            .imports
            .iter()
            .filter(|import| matches!(import.desc, ImportDesc::Memory(_)))
            .count();
        imported + self.memories.len()
    }

    /// Number of (params, results) of a block type.
    pub fn block_arity(&self, ty: BlockType) -> (usize, usize) {
        match ty {
            BlockType::Empty => (0, 0),
            BlockType::Value(_) => (0, 1),
            BlockType::Func(type_idx) => self
                .types
                .get(type_idx as usize)
                .map(|ty| (ty.params.len(), ty.results.len()))
                .unwrap_or((0, 0)),
        }
    }

    pub fn export(&self, name: &str) -> Option<&Export> {
        self.exports.iter().find(|export| export.name == name)
    }
}

/// Decodes a binary module. The first error aborts decoding.
pub fn decode(input: &[u8]) -> Result<Module> {
    let mut cursor = Cursor::new(input);
    let magic = cursor.read_bytes(4).map_err(|_| DecodeError::BadHeader)?;
    let version = cursor.read_u32_le().map_err(|_| DecodeError::BadHeader)?;
    if magic != MAGIC || version != VERSION {
        return Err(DecodeError::BadHeader);
    }

    let mut module = Module::default();
    let mut function_section: Vec<u32> = vec![];
    let mut code_section: Vec<(Vec<ValueType>, Vec<Instruction>)> = vec![];
    let mut data_count = None;
    let mut last_rank = 0;

    while !cursor.is_eof() {
        let offset = cursor.offset();
        let id = cursor.read_u8()?;
        let code = SectionCode::from_u8(id).ok_or(DecodeError::UnknownSection { id, offset })?;
        let size = cursor.read_var_u32()?;

        if code != SectionCode::Custom {
            if code.rank() <= last_rank {
                return Err(DecodeError::SectionOrder { section: id });
            }
            last_rank = code.rank();
        }

        if size as usize > cursor.remaining() {
            return Err(DecodeError::SectionSizeMismatch {
                section: id,
                declared: size,
                consumed: cursor.remaining(),
            });
        }
        let mut section = cursor.sub_cursor(size as usize)?;
        let end = section.end_offset();
        debug!("decoding {:?} section ({} bytes)", code, size);

        let result = (|| -> Result<()> {
            match code {
                SectionCode::Custom => {
                    let name = section.read_name()?;
                    trace!("skipping custom section {:?}", name);
                    section.read_bytes(section.remaining())?;
                }
                SectionCode::Type => module.types = decode_type_section(&mut section)?,
                SectionCode::Import => module.imports = decode_import_section(&mut section)?,
                SectionCode::Function => function_section = decode_function_section(&mut section)?,
                SectionCode::Table => module.tables = decode_table_section(&mut section)?,
                SectionCode::Memory => module.memories = decode_memory_section(&mut section)?,
                SectionCode::Global => module.globals = decode_global_section(&mut section)?,
                SectionCode::Export => module.exports = decode_export_section(&mut section)?,
                SectionCode::Start => module.start = Some(section.read_var_u32()?),
                SectionCode::Element => module.elements = decode_element_section(&mut section)?,
                SectionCode::DataCount => data_count = Some(section.read_var_u32()?),
                SectionCode::Code => code_section = decode_code_section(&mut section)?,
                SectionCode::Data => module.data = decode_data_section(&mut section)?,
            };
            Ok(())
        })();

        match result {
            Err(DecodeError::UnexpectedEof { offset }) if offset == end => {
                return Err(DecodeError::SectionSizeMismatch {
                    section: id,
                    declared: size,
                    consumed: size as usize,
                });
            }
            Err(err) => return Err(err),
            Ok(()) => {}
        }

        if !section.is_eof() {
            return Err(DecodeError::SectionSizeMismatch {
                section: id,
                declared: size,
                consumed: size as usize - section.remaining(),
            });
        }
    }

    if function_section.len() != code_section.len() {
        return Err(DecodeError::malformed(
            "function and code section lengths differ",
        ));
    }
    if let Some(count) = data_count {
        if count as usize != module.data.len() {
            return Err(DecodeError::malformed(
                "data count does not match the data section",
            ));
        }
    }

    module.functions = function_section
        .into_iter()
        .zip(code_section)
        .map(|(type_idx, (locals, body))| Function {
            type_idx,
            locals,
            body,
        })
        .collect();

    validate::validate(&module)?;
    Ok(module)
}

fn decode_vec<'a, T>(
    cursor: &mut Cursor<'a>,
    mut item: impl FnMut(&mut Cursor<'a>) -> Result<T>,
) -> Result<Vec<T>> {
    let count = cursor.read_var_u32()? as usize;
    let mut items = Vec::with_capacity(count.min(cursor.remaining()));
    for _ in 0..count {
        items.push(item(cursor)?);
    }
    Ok(items)
}

fn decode_value_type(cursor: &mut Cursor) -> Result<ValueType> {
    ValueType::try_from(cursor.read_u8()?)
}

fn decode_type_section(cursor: &mut Cursor) -> Result<Vec<FuncType>> {
    decode_vec(cursor, |cursor| {
        if cursor.read_u8()? != 0x60 {
            return Err(DecodeError::malformed("function type must start with 0x60"));
        }
        let params = decode_vec(cursor, decode_value_type)?;
        let results = decode_vec(cursor, decode_value_type)?;
        Ok(FuncType { params, results })
    })
}

fn decode_limits(cursor: &mut Cursor) -> Result<Limits> {
    match cursor.read_u8()? {
        0x00 => Ok(Limits {
            min: cursor.read_var_u32()?,
            max: None,
        }),
        0x01 => Ok(Limits {
            min: cursor.read_var_u32()?,
            max: Some(cursor.read_var_u32()?),
        }),
        _ => Err(DecodeError::malformed("invalid limits flag")),
    }
}

fn decode_table_type(cursor: &mut Cursor) -> Result<Limits> {
    if cursor.read_u8()? != 0x70 {
        return Err(DecodeError::malformed("only funcref tables are supported"));
    }
    decode_limits(cursor)
}

fn decode_global_type(cursor: &mut Cursor) -> Result<GlobalType> {
    let value_type = decode_value_type(cursor)?;
    let mutable = match cursor.read_u8()? {
        0x00 => false,
        0x01 => true,
        _ => return Err(DecodeError::malformed("invalid global mutability")),
    };
    Ok(GlobalType {
        value_type,
        mutable,
    })
}

fn decode_import_section(cursor: &mut Cursor) -> Result<Vec<Import>> {
    decode_vec(cursor, |cursor| {
        let module = cursor.read_name()?;
        let field = cursor.read_name()?;
        let desc = match cursor.read_u8()? {
            0x00 => ImportDesc::Func(cursor.read_var_u32()?),
            0x01 => ImportDesc::Table(decode_table_type(cursor)?),
            0x02 => ImportDesc::Memory(decode_limits(cursor)?),
            0x03 => ImportDesc::Global(decode_global_type(cursor)?),
            _ => return Err(DecodeError::malformed("invalid import kind")),
        };
        Ok(Import {
            module,
            field,
            desc,
        })
    })
}

fn decode_function_section(cursor: &mut Cursor) -> Result<Vec<u32>> {
    decode_vec(cursor, |cursor| cursor.read_var_u32())
}

fn decode_table_section(cursor: &mut Cursor) -> Result<Vec<Table>> {
    decode_vec(cursor, |cursor| {
        Ok(Table {
            limits: decode_table_type(cursor)?,
        })
    })
}

fn decode_memory_section(cursor: &mut Cursor) -> Result<Vec<Memory>> {
    decode_vec(cursor, |cursor| {
        Ok(Memory {
            limits: decode_limits(cursor)?,
        })
    })
}

fn decode_global_section(cursor: &mut Cursor) -> Result<Vec<Global>> {
    decode_vec(cursor, |cursor| {
        let ty = decode_global_type(cursor)?;
        let init = decode_const_expr(cursor)?;
        Ok(Global { ty, init })
    })
}

fn decode_export_section(cursor: &mut Cursor) -> Result<Vec<Export>> {
    decode_vec(cursor, |cursor| {
        let name = cursor.read_name()?;
        let kind = cursor.read_u8()?;
        let idx = cursor.read_var_u32()?;
        let desc = match kind {
            0x00 => ExportDesc::Func(idx),
            0x01 => ExportDesc::Table(idx),
            0x02 => ExportDesc::Memory(idx),
            0x03 => ExportDesc::Global(idx),
            _ => return Err(DecodeError::malformed("invalid export kind")),
        };
        Ok(Export { name, desc })
    })
}

fn decode_element_section(cursor: &mut Cursor) -> Result<Vec<Element>> {
    decode_vec(cursor, |cursor| {
        let table_idx = match cursor.read_var_u32()? {
            0 => 0,
            2 => {
                let table_idx = cursor.read_var_u32()?;
                let offset = decode_const_expr(cursor)?;
                if cursor.read_u8()? != 0x00 {
                    return Err(DecodeError::malformed("invalid element kind"));
                }
                let init = decode_vec(cursor, |cursor| cursor.read_var_u32())?;
                return Ok(Element {
                    table_idx,
                    offset,
                    init,
                });
            }
            _ => {
                return Err(DecodeError::malformed(
                    "only active function-index element segments are supported",
                ));
            }
        };
        let offset = decode_const_expr(cursor)?;
        let init = decode_vec(cursor, |cursor| cursor.read_var_u32())?;
        Ok(Element {
            table_idx,
            offset,
            init,
        })
    })
}

fn decode_data_section(cursor: &mut Cursor) -> Result<Vec<Data>> {
    decode_vec(cursor, |cursor| {
        let memory_idx = match cursor.read_var_u32()? {
            0 => 0,
            2 => cursor.read_var_u32()?,
            _ => {
                return Err(DecodeError::malformed(
                    "passive data segments are not supported",
                ));
            }
        };
        let offset = decode_const_expr(cursor)?;
        let size = cursor.read_var_u32()? as usize;
        let init = cursor.read_bytes(size)?.to_vec();
        Ok(Data {
            memory_idx,
            offset,
            init,
        })
    })
}

fn decode_code_section(cursor: &mut Cursor) -> Result<Vec<(Vec<ValueType>, Vec<Instruction>)>> {
    decode_vec(cursor, |cursor| {
        let size = cursor.read_var_u32()? as usize;
        let mut body = cursor.sub_cursor(size)?;
        decode_function_body(&mut body)
    })
}

fn decode_function_body(cursor: &mut Cursor) -> Result<(Vec<ValueType>, Vec<Instruction>)> {
    let mut locals = vec![];
    let groups = cursor.read_var_u32()?;
    for _ in 0..groups {
        let count = cursor.read_var_u32()? as usize;
        let value_type = decode_value_type(cursor)?;
        if locals.len() + count > MAX_LOCALS {
            return Err(DecodeError::malformed("too many locals"));
        }
        locals.resize(locals.len() + count, value_type);
    }

    let body = decode_expr(cursor)?;
    if !cursor.is_eof() {
        return Err(DecodeError::malformed("bytes after the end of a function body"));
    }
    Ok((locals, body))
}

/// Open structured instruction waiting for its `end`.
struct PendingBlock {
    start: usize,
    else_at: Option<usize>,
}

/// Decodes a function body up to its final `end`, resolving every block's
/// `else`/`end` position in one pass.
fn decode_expr(cursor: &mut Cursor) -> Result<Vec<Instruction>> {
    let mut body: Vec<Instruction> = vec![];
    let mut pending: Vec<PendingBlock> = vec![];

    loop {
        if cursor.is_eof() {
            return Err(DecodeError::malformed(if pending.is_empty() {
                "function body is missing its end"
            } else {
                "unmatched block"
            }));
        }

        let inst = decode_instruction(cursor)?;
        let pc = body.len();

        match &inst {
            Instruction::Block { .. } | Instruction::Loop { .. } | Instruction::If { .. } => {
                pending.push(PendingBlock {
                    start: pc,
                    else_at: None,
                });
            }
            Instruction::Else { .. } => {
                let block = pending
                    .last_mut()
                    .filter(|block| {
                        block.else_at.is_none()
                            && matches!(body[block.start], Instruction::If { .. })
                    })
                    .ok_or_else(|| DecodeError::malformed("else without matching if"))?;
                block.else_at = Some(pc);
            }
            Instruction::End => match pending.pop() {
                Some(block) => resolve_block(&mut body, block, pc),
                None => {
                    body.push(inst);
                    return Ok(body);
                }
            },
            Instruction::Br(depth) | Instruction::BrIf(depth) => {
                check_label(*depth, pending.len())?;
            }
            Instruction::BrTable { targets, default } => {
                for depth in targets.iter().chain([default]) {
                    check_label(*depth, pending.len())?;
                }
            }
            _ => {}
        }

        body.push(inst);
    }
}

fn resolve_block(body: &mut [Instruction], block: PendingBlock, end_at: usize) {
    match &mut body[block.start] {
        Instruction::Block { end, .. } => *end = end_at,
        Instruction::If { else_at, end, .. } => {
            *else_at = block.else_at;
            *end = end_at;
        }
        _ => {}
    }
    if let Some(pc) = block.else_at {
        if let Instruction::Else { end } = &mut body[pc] {
            *end = end_at;
        }
    }
}

fn check_label(depth: u32, open_blocks: usize) -> Result<()> {
    // depth == open_blocks targets the function body itself
    if depth as usize > open_blocks {
        return Err(DecodeError::IndexOutOfRange {
            space: IndexSpace::Label,
            index: depth,
            len: open_blocks + 1,
        });
    }
    Ok(())
}

fn decode_const_expr(cursor: &mut Cursor) -> Result<Vec<Instruction>> {
    let mut expr = vec![];
    loop {
        let inst = decode_instruction(cursor)?;
        match inst {
            Instruction::End => {
                expr.push(inst);
                return Ok(expr);
            }
            Instruction::I32Const(_)
            | Instruction::I64Const(_)
            | Instruction::F32Const(_)
            | Instruction::F64Const(_)
            | Instruction::GlobalGet(_) => expr.push(inst),
            _ => {
                return Err(DecodeError::malformed(
                    "non-constant instruction in constant expression",
                ));
            }
        }
    }
}

fn decode_block_type(cursor: &mut Cursor) -> Result<BlockType> {
    // encoded as a signed 33-bit value: negative for the one-byte forms
    match cursor.read_var_s33()? {
        -0x40 => Ok(BlockType::Empty),
        -0x01 => Ok(BlockType::Value(ValueType::I32)),
        -0x02 => Ok(BlockType::Value(ValueType::I64)),
        -0x03 => Ok(BlockType::Value(ValueType::F32)),
        -0x04 => Ok(BlockType::Value(ValueType::F64)),
        idx if (0..=u32::MAX as i64).contains(&idx) => Ok(BlockType::Func(idx as u32)),
        other => Err(DecodeError::InvalidValueType((other & 0x7F) as u8)),
    }
}

fn decode_memarg(cursor: &mut Cursor) -> Result<MemArg> {
    let align = cursor.read_var_u32()?;
    let offset = cursor.read_var_u32()?;
    Ok(MemArg { align, offset })
}

fn load(cursor: &mut Cursor, kind: LoadKind) -> Result<Instruction> {
    Ok(Instruction::Load(kind, decode_memarg(cursor)?))
}

fn store(cursor: &mut Cursor, kind: StoreKind) -> Result<Instruction> {
    Ok(Instruction::Store(kind, decode_memarg(cursor)?))
}

fn decode_instruction(cursor: &mut Cursor) -> Result<Instruction> {
    let offset = cursor.offset();
    let byte = cursor.read_u8()?;
    let op = Opcode::from_u8(byte).ok_or(DecodeError::UnknownOpcode {
        opcode: byte,
        offset,
    })?;

    let inst = match op {
        Opcode::Unreachable => Instruction::Unreachable,
        Opcode::Nop => Instruction::Nop,
        Opcode::Block => Instruction::Block {
            ty: decode_block_type(cursor)?,
            end: Instruction::UNRESOLVED,
        },
        Opcode::Loop => Instruction::Loop {
            ty: decode_block_type(cursor)?,
        },
        Opcode::If => Instruction::If {
            ty: decode_block_type(cursor)?,
            else_at: None,
            end: Instruction::UNRESOLVED,
        },
        Opcode::Else => Instruction::Else {
            end: Instruction::UNRESOLVED,
        },
        Opcode::End => Instruction::End,
        Opcode::Br => Instruction::Br(cursor.read_var_u32()?),
        Opcode::BrIf => Instruction::BrIf(cursor.read_var_u32()?),
        Opcode::BrTable => {
            let targets = decode_vec(cursor, |cursor| cursor.read_var_u32())?;
            let default = cursor.read_var_u32()?;
            Instruction::BrTable {
                targets: targets.into_boxed_slice(),
                default,
            }
        }
        Opcode::Return => Instruction::Return,
        Opcode::Call => Instruction::Call(cursor.read_var_u32()?),
        Opcode::CallIndirect => {
            let type_idx = cursor.read_var_u32()?;
            let table_idx = cursor.read_var_u32()?;
            Instruction::CallIndirect {
                type_idx,
                table_idx,
            }
        }
        Opcode::Drop => Instruction::Drop,
        Opcode::Select => Instruction::Select,
        Opcode::LocalGet => Instruction::LocalGet(cursor.read_var_u32()?),
        Opcode::LocalSet => Instruction::LocalSet(cursor.read_var_u32()?),
        Opcode::LocalTee => Instruction::LocalTee(cursor.read_var_u32()?),
        Opcode::GlobalGet => Instruction::GlobalGet(cursor.read_var_u32()?),
        Opcode::GlobalSet => Instruction::GlobalSet(cursor.read_var_u32()?),
        Opcode::I32Load => load(cursor, LoadKind::I32)?,
        Opcode::I64Load => load(cursor, LoadKind::I64)?,
        Opcode::F32Load => load(cursor, LoadKind::F32)?,
        Opcode::F64Load => load(cursor, LoadKind::F64)?,
        Opcode::I32Load8S => load(cursor, LoadKind::I32S8)?,
        Opcode::I32Load8U => load(cursor, LoadKind::I32U8)?,
        Opcode::I32Load16S => load(cursor, LoadKind::I32S16)?,
        Opcode::I32Load16U => load(cursor, LoadKind::I32U16)?,
        Opcode::I64Load8S => load(cursor, LoadKind::I64S8)?,
        Opcode::I64Load8U => load(cursor, LoadKind::I64U8)?,
        Opcode::I64Load16S => load(cursor, LoadKind::I64S16)?,
        Opcode::I64Load16U => load(cursor, LoadKind::I64U16)?,
        Opcode::I64Load32S => load(cursor, LoadKind::I64S32)?,
        Opcode::I64Load32U => load(cursor, LoadKind::I64U32)?,
        Opcode::I32Store => store(cursor, StoreKind::I32)?,
        Opcode::I64Store => store(cursor, StoreKind::I64)?,
        Opcode::F32Store => store(cursor, StoreKind::F32)?,
        Opcode::F64Store => store(cursor, StoreKind::F64)?,
        Opcode::I32Store8 => store(cursor, StoreKind::I32N8)?,
        Opcode::I32Store16 => store(cursor, StoreKind::I32N16)?,
        Opcode::I64Store8 => store(cursor, StoreKind::I64N8)?,
        Opcode::I64Store16 => store(cursor, StoreKind::I64N16)?,
        Opcode::I64Store32 => store(cursor, StoreKind::I64N32)?,
        Opcode::MemorySize | Opcode::MemoryGrow => {
            if cursor.read_u8()? != 0x00 {
                return Err(DecodeError::malformed("memory index must be zero"));
            }
            if op == Opcode::MemorySize {
                Instruction::MemorySize
            } else {
                Instruction::MemoryGrow
            }
        }
        Opcode::I32Const => Instruction::I32Const(cursor.read_var_i32()?),
        Opcode::I64Const => Instruction::I64Const(cursor.read_var_i64()?),
        Opcode::F32Const => Instruction::F32Const(cursor.read_f32()?),
        Opcode::F64Const => Instruction::F64Const(cursor.read_f64()?),
        Opcode::I32Eqz => Instruction::I32Eqz,
        Opcode::I32Eq => Instruction::I32Compare(IRelOp::Eq),
        Opcode::I32Ne => Instruction::I32Compare(IRelOp::Ne),
        Opcode::I32LtS => Instruction::I32Compare(IRelOp::LtS),
        Opcode::I32LtU => Instruction::I32Compare(IRelOp::LtU),
        Opcode::I32GtS => Instruction::I32Compare(IRelOp::GtS),
        Opcode::I32GtU => Instruction::I32Compare(IRelOp::GtU),
        Opcode::I32LeS => Instruction::I32Compare(IRelOp::LeS),
        Opcode::I32LeU => Instruction::I32Compare(IRelOp::LeU),
        Opcode::I32GeS => Instruction::I32Compare(IRelOp::GeS),
        Opcode::I32GeU => Instruction::I32Compare(IRelOp::GeU),
        Opcode::I64Eqz => Instruction::I64Eqz,
        Opcode::I64Eq => Instruction::I64Compare(IRelOp::Eq),
        Opcode::I64Ne => Instruction::I64Compare(IRelOp::Ne),
        Opcode::I64LtS => Instruction::I64Compare(IRelOp::LtS),
        Opcode::I64LtU => Instruction::I64Compare(IRelOp::LtU),
        Opcode::I64GtS => Instruction::I64Compare(IRelOp::GtS),
        Opcode::I64GtU => Instruction::I64Compare(IRelOp::GtU),
        Opcode::I64LeS => Instruction::I64Compare(IRelOp::LeS),
        Opcode::I64LeU => Instruction::I64Compare(IRelOp::LeU),
        Opcode::I64GeS => Instruction::I64Compare(IRelOp::GeS),
        Opcode::I64GeU => Instruction::I64Compare(IRelOp::GeU),
        Opcode::F32Eq => Instruction::F32Compare(FRelOp::Eq),
        Opcode::F32Ne => Instruction::F32Compare(FRelOp::Ne),
        Opcode::F32Lt => Instruction::F32Compare(FRelOp::Lt),
        Opcode::F32Gt => Instruction::F32Compare(FRelOp::Gt),
        Opcode::F32Le => Instruction::F32Compare(FRelOp::Le),
        Opcode::F32Ge => Instruction::F32Compare(FRelOp::Ge),
        Opcode::F64Eq => Instruction::F64Compare(FRelOp::Eq),
        Opcode::F64Ne => Instruction::F64Compare(FRelOp::Ne),
        Opcode::F64Lt => Instruction::F64Compare(FRelOp::Lt),
        Opcode::F64Gt => Instruction::F64Compare(FRelOp::Gt),
        Opcode::F64Le => Instruction::F64Compare(FRelOp::Le),
        Opcode::F64Ge => Instruction::F64Compare(FRelOp::Ge),
        Opcode::I32Clz => Instruction::I32Unary(IUnOp::Clz),
        Opcode::I32Ctz => Instruction::I32Unary(IUnOp::Ctz),
        Opcode::I32Popcnt => Instruction::I32Unary(IUnOp::Popcnt),
        Opcode::I32Add => Instruction::I32Binary(IBinOp::Add),
        Opcode::I32Sub => Instruction::I32Binary(IBinOp::Sub),
        Opcode::I32Mul => Instruction::I32Binary(IBinOp::Mul),
        Opcode::I32DivS => Instruction::I32Binary(IBinOp::DivS),
        Opcode::I32DivU => Instruction::I32Binary(IBinOp::DivU),
        Opcode::I32RemS => Instruction::I32Binary(IBinOp::RemS),
        Opcode::I32RemU => Instruction::I32Binary(IBinOp::RemU),
        Opcode::I32And => Instruction::I32Binary(IBinOp::And),
        Opcode::I32Or => Instruction::I32Binary(IBinOp::Or),
        Opcode::I32Xor => Instruction::I32Binary(IBinOp::Xor),
        Opcode::I32Shl => Instruction::I32Binary(IBinOp::Shl),
        Opcode::I32ShrS => Instruction::I32Binary(IBinOp::ShrS),
        Opcode::I32ShrU => Instruction::I32Binary(IBinOp::ShrU),
        Opcode::I32Rotl => Instruction::I32Binary(IBinOp::Rotl),
        Opcode::I32Rotr => Instruction::I32Binary(IBinOp::Rotr),
        Opcode::I64Clz => Instruction::I64Unary(IUnOp::Clz),
        Opcode::I64Ctz => Instruction::I64Unary(IUnOp::Ctz),
        Opcode::I64Popcnt => Instruction::I64Unary(IUnOp::Popcnt),
        Opcode::I64Add => Instruction::I64Binary(IBinOp::Add),
        Opcode::I64Sub => Instruction::I64Binary(IBinOp::Sub),
        Opcode::I64Mul => Instruction::I64Binary(IBinOp::Mul),
        Opcode::I64DivS => Instruction::I64Binary(IBinOp::DivS),
        Opcode::I64DivU => Instruction::I64Binary(IBinOp::DivU),
        Opcode::I64RemS => Instruction::I64Binary(IBinOp::RemS),
        Opcode::I64RemU => Instruction::I64Binary(IBinOp::RemU),
        Opcode::I64And => Instruction::I64Binary(IBinOp::And),
        Opcode::I64Or => Instruction::I64Binary(IBinOp::Or),
        Opcode::I64Xor => Instruction::I64Binary(IBinOp::Xor),
        Opcode::I64Shl => Instruction::I64Binary(IBinOp::Shl),
        Opcode::I64ShrS => Instruction::I64Binary(IBinOp::ShrS),
        Opcode::I64ShrU => Instruction::I64Binary(IBinOp::ShrU),
        Opcode::I64Rotl => Instruction::I64Binary(IBinOp::Rotl),
        Opcode::I64Rotr => Instruction::I64Binary(IBinOp::Rotr),
        Opcode::F32Abs => Instruction::F32Unary(FUnOp::Abs),
        Opcode::F32Neg => Instruction::F32Unary(FUnOp::Neg),
        Opcode::F32Ceil => Instruction::F32Unary(FUnOp::Ceil),
        Opcode::F32Floor => Instruction::F32Unary(FUnOp::Floor),
        Opcode::F32Trunc => Instruction::F32Unary(FUnOp::Trunc),
        Opcode::F32Nearest => Instruction::F32Unary(FUnOp::Nearest),
        Opcode::F32Sqrt => Instruction::F32Unary(FUnOp::Sqrt),
        Opcode::F32Add => Instruction::F32Binary(FBinOp::Add),
        Opcode::F32Sub => Instruction::F32Binary(FBinOp::Sub),
        Opcode::F32Mul => Instruction::F32Binary(FBinOp::Mul),
        Opcode::F32Div => Instruction::F32Binary(FBinOp::Div),
        Opcode::F32Min => Instruction::F32Binary(FBinOp::Min),
        Opcode::F32Max => Instruction::F32Binary(FBinOp::Max),
        Opcode::F32Copysign => Instruction::F32Binary(FBinOp::Copysign),
        Opcode::F64Abs => Instruction::F64Unary(FUnOp::Abs),
        Opcode::F64Neg => Instruction::F64Unary(FUnOp::Neg),
        Opcode::F64Ceil => Instruction::F64Unary(FUnOp::Ceil),
        Opcode::F64Floor => Instruction::F64Unary(FUnOp::Floor),
        Opcode::F64Trunc => Instruction::F64Unary(FUnOp::Trunc),
        Opcode::F64Nearest => Instruction::F64Unary(FUnOp::Nearest),
        Opcode::F64Sqrt => Instruction::F64Unary(FUnOp::Sqrt),
        Opcode::F64Add => Instruction::F64Binary(FBinOp::Add),
        Opcode::F64Sub => Instruction::F64Binary(FBinOp::Sub),
        Opcode::F64Mul => Instruction::F64Binary(FBinOp::Mul),
        Opcode::F64Div => Instruction::F64Binary(FBinOp::Div),
        Opcode::F64Min => Instruction::F64Binary(FBinOp::Min),
        Opcode::F64Max => Instruction::F64Binary(FBinOp::Max),
        Opcode::F64Copysign => Instruction::F64Binary(FBinOp::Copysign),
        Opcode::I32WrapI64 => Instruction::Convert(ConvertOp::I32WrapI64),
        Opcode::I32TruncF32S => Instruction::Convert(ConvertOp::I32TruncF32S),
        Opcode::I32TruncF32U => Instruction::Convert(ConvertOp::I32TruncF32U),
        Opcode::I32TruncF64S => Instruction::Convert(ConvertOp::I32TruncF64S),
        Opcode::I32TruncF64U => Instruction::Convert(ConvertOp::I32TruncF64U),
        Opcode::I64ExtendI32S => Instruction::Convert(ConvertOp::I64ExtendI32S),
        Opcode::I64ExtendI32U => Instruction::Convert(ConvertOp::I64ExtendI32U),
        Opcode::I64TruncF32S => Instruction::Convert(ConvertOp::I64TruncF32S),
        Opcode::I64TruncF32U => Instruction::Convert(ConvertOp::I64TruncF32U),
        Opcode::I64TruncF64S => Instruction::Convert(ConvertOp::I64TruncF64S),
        Opcode::I64TruncF64U => Instruction::Convert(ConvertOp::I64TruncF64U),
        Opcode::F32ConvertI32S => Instruction::Convert(ConvertOp::F32ConvertI32S),
        Opcode::F32ConvertI32U => Instruction::Convert(ConvertOp::F32ConvertI32U),
        Opcode::F32ConvertI64S => Instruction::Convert(ConvertOp::F32ConvertI64S),
        Opcode::F32ConvertI64U => Instruction::Convert(ConvertOp::F32ConvertI64U),
        Opcode::F32DemoteF64 => Instruction::Convert(ConvertOp::F32DemoteF64),
        Opcode::F64ConvertI32S => Instruction::Convert(ConvertOp::F64ConvertI32S),
        Opcode::F64ConvertI32U => Instruction::Convert(ConvertOp::F64ConvertI32U),
        Opcode::F64ConvertI64S => Instruction::Convert(ConvertOp::F64ConvertI64S),
        Opcode::F64ConvertI64U => Instruction::Convert(ConvertOp::F64ConvertI64U),
        Opcode::F64PromoteF32 => Instruction::Convert(ConvertOp::F64PromoteF32),
        Opcode::I32ReinterpretF32 => Instruction::Convert(ConvertOp::I32ReinterpretF32),
        Opcode::I64ReinterpretF64 => Instruction::Convert(ConvertOp::I64ReinterpretF64),
        Opcode::F32ReinterpretI32 => Instruction::Convert(ConvertOp::F32ReinterpretI32),
        Opcode::F64ReinterpretI64 => Instruction::Convert(ConvertOp::F64ReinterpretI64),
        Opcode::I32Extend8S => Instruction::I32Unary(IUnOp::Extend8S),
        Opcode::I32Extend16S => Instruction::I32Unary(IUnOp::Extend16S),
        Opcode::I64Extend8S => Instruction::I64Unary(IUnOp::Extend8S),
        Opcode::I64Extend16S => Instruction::I64Unary(IUnOp::Extend16S),
        Opcode::I64Extend32S => Instruction::I64Unary(IUnOp::Extend32S),
    };
    Ok(inst)
}
