use super::{
    instruction::Instruction,
    module::Module,
    types::{BlockType, ExportDesc, FuncType, GlobalType, ImportDesc, Limits, ValueType},
};
use crate::error::{DecodeError, IndexSpace};
use log::debug;

type Result<T> = std::result::Result<T, DecodeError>;

const MAX_PAGES: u32 = 65536;

/// Cross-reference checks run once all sections are decoded.
pub fn validate(module: &Module) -> Result<()> {
    let checker = Checker::new(module);
    checker.check_imports()?;
    checker.check_limits()?;
    checker.check_globals()?;
    checker.check_exports()?;
    checker.check_start()?;
    checker.check_segments()?;
    for (idx, func) in module.functions.iter().enumerate() {
        let ty = checker.type_at(func.type_idx)?;
        let locals = ty.params.len() + func.locals.len();
        for inst in &func.body {
            checker
                .check_instruction(inst, locals)
                .inspect_err(|err| debug!("function {} failed validation: {}", idx, err))?;
        }
    }
    Ok(())
}

struct Checker<'a> {
    module: &'a Module,
    funcs: usize,
    tables: usize,
    memories: usize,
    globals: Vec<GlobalType>,
    imported_globals: usize,
}

fn in_range(space: IndexSpace, index: u32, len: usize) -> Result<()> {
    if index as usize >= len {
        return Err(DecodeError::IndexOutOfRange { space, index, len });
    }
    Ok(())
}

impl<'a> Checker<'a> {
    fn new(module: &'a Module) -> Self {
        let globals = module.global_types();
        let imported_globals = globals.len() - module.globals.len();
        Self {
            module,
            funcs: module.func_count(),
            tables: module.table_count(),
            memories: module.memory_count(),
            globals,
            imported_globals,
        }
    }

    fn type_at(&self, idx: u32) -> Result<&'a FuncType> {
        self.module
            .types
            .get(idx as usize)
            .ok_or(DecodeError::IndexOutOfRange {
                space: IndexSpace::Type,
                index: idx,
                len: self.module.types.len(),
            })
    }

    fn check_imports(&self) -> Result<()> {
        for import in &self.module.imports {
            match &import.desc {
                ImportDesc::Func(type_idx) => {
                    self.type_at(*type_idx)?;
                }
                ImportDesc::Table(limits) => check_table_limits(limits)?,
                ImportDesc::Memory(limits) => check_memory_limits(limits)?,
                ImportDesc::Global(_) => {}
            }
        }
        Ok(())
    }

    fn check_limits(&self) -> Result<()> {
        if self.memories > 1 {
            return Err(DecodeError::malformed("multiple memories"));
        }
        if self.tables > 1 {
            return Err(DecodeError::malformed("multiple tables"));
        }
        for memory in &self.module.memories {
            check_memory_limits(&memory.limits)?;
        }
        for table in &self.module.tables {
            check_table_limits(&table.limits)?;
        }
        Ok(())
    }

    fn check_globals(&self) -> Result<()> {
        for global in &self.module.globals {
            // only imported globals are visible to initializers
            self.check_const_expr(&global.init, global.ty.value_type, self.imported_globals)?;
        }
        Ok(())
    }

    fn check_exports(&self) -> Result<()> {
        for export in &self.module.exports {
            match export.desc {
                ExportDesc::Func(idx) => in_range(IndexSpace::Function, idx, self.funcs)?,
                ExportDesc::Table(idx) => in_range(IndexSpace::Table, idx, self.tables)?,
                ExportDesc::Memory(idx) => in_range(IndexSpace::Memory, idx, self.memories)?,
                ExportDesc::Global(idx) => in_range(IndexSpace::Global, idx, self.globals.len())?,
            }
        }
        Ok(())
    }

    fn check_start(&self) -> Result<()> {
        let Some(idx) = self.module.start else {
            return Ok(());
        };
        in_range(IndexSpace::Function, idx, self.funcs)?;
        match self.module.func_type(idx) {
            Some(ty) if ty.params.is_empty() && ty.results.is_empty() => Ok(()),
            _ => Err(DecodeError::malformed("start function must have type [] -> []")),
        }
    }

    fn check_segments(&self) -> Result<()> {
        for element in &self.module.elements {
            in_range(IndexSpace::Table, element.table_idx, self.tables)?;
            self.check_const_expr(&element.offset, ValueType::I32, self.globals.len())?;
            for func_idx in &element.init {
                in_range(IndexSpace::Function, *func_idx, self.funcs)?;
            }
        }
        for data in &self.module.data {
            in_range(IndexSpace::Memory, data.memory_idx, self.memories)?;
            self.check_const_expr(&data.offset, ValueType::I32, self.globals.len())?;
        }
        Ok(())
    }

    fn check_const_expr(
        &self,
        expr: &[Instruction],
        expected: ValueType,
        visible_globals: usize,
    ) -> Result<()> {
        let found = match expr {
            [Instruction::I32Const(_), Instruction::End] => ValueType::I32,
            [Instruction::I64Const(_), Instruction::End] => ValueType::I64,
            [Instruction::F32Const(_), Instruction::End] => ValueType::F32,
            [Instruction::F64Const(_), Instruction::End] => ValueType::F64,
            [Instruction::GlobalGet(idx), Instruction::End] => {
                in_range(IndexSpace::Global, *idx, visible_globals)?;
                self.globals[*idx as usize].value_type
            }
            _ => {
                return Err(DecodeError::malformed(
                    "constant expression must produce exactly one value",
                ));
            }
        };
        if found != expected {
            return Err(DecodeError::malformed(format!(
                "constant expression has type {found}, expected {expected}"
            )));
        }
        Ok(())
    }

    fn check_block_type(&self, ty: BlockType) -> Result<()> {
        if let BlockType::Func(idx) = ty {
            self.type_at(idx)?;
        }
        Ok(())
    }

    fn require_memory(&self) -> Result<()> {
        in_range(IndexSpace::Memory, 0, self.memories)
    }

    fn check_instruction(&self, inst: &Instruction, locals: usize) -> Result<()> {
        match inst {
            Instruction::Block { ty, .. }
            | Instruction::Loop { ty }
            | Instruction::If { ty, .. } => self.check_block_type(*ty),
            Instruction::Call(idx) => in_range(IndexSpace::Function, *idx, self.funcs),
            Instruction::CallIndirect {
                type_idx,
                table_idx,
            } => {
                self.type_at(*type_idx)?;
                in_range(IndexSpace::Table, *table_idx, self.tables)
            }
            Instruction::LocalGet(idx) | Instruction::LocalSet(idx) | Instruction::LocalTee(idx) => {
                in_range(IndexSpace::Local, *idx, locals)
            }
            Instruction::GlobalGet(idx) => in_range(IndexSpace::Global, *idx, self.globals.len()),
            Instruction::GlobalSet(idx) => {
                in_range(IndexSpace::Global, *idx, self.globals.len())?;
                if !self.globals[*idx as usize].mutable {
                    return Err(DecodeError::malformed(format!(
                        "global {idx} is immutable"
                    )));
                }
                Ok(())
            }
            Instruction::Load(..)
            | Instruction::Store(..)
            | Instruction::MemorySize
            | Instruction::MemoryGrow => self.require_memory(),
            _ => Ok(()),
        }
    }
}

fn check_memory_limits(limits: &Limits) -> Result<()> {
    if limits.min > MAX_PAGES || limits.max.is_some_and(|max| max > MAX_PAGES) {
        return Err(DecodeError::malformed("memory size must be at most 65536 pages"));
    }
    check_table_limits(limits)
}

fn check_table_limits(limits: &Limits) -> Result<()> {
    if limits.max.is_some_and(|max| max < limits.min) {
        return Err(DecodeError::malformed("size minimum must not exceed the maximum"));
    }
    Ok(())
}
