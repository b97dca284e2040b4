use std::collections::HashMap;

use log::debug;

use super::{
    config::Config,
    import::{HostFunc, HostValue, Imports},
    value::Value,
};
use crate::{
    binary::{
        instruction::Instruction,
        module::Module,
        types::{ExportDesc, FuncType, ImportDesc, Limits},
    },
    error::{LinkError, Trap},
};

pub const PAGE_SIZE: usize = 65536;

#[derive(Debug, Clone)]
pub enum FuncInst {
    /// `def_idx` indexes the module's defined functions, not the function
    /// index space.
    Internal { ty: FuncType, def_idx: u32 },
    Host {
        ty: FuncType,
        module: String,
        name: String,
        func: HostFunc,
    },
}

impl FuncInst {
    pub fn ty(&self) -> &FuncType {
        match self {
            FuncInst::Internal { ty, .. } | FuncInst::Host { ty, .. } => ty,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryInst {
    pub data: Vec<u8>,
    pub max: Option<u32>,
}

impl MemoryInst {
    pub fn new(limits: Limits) -> Self {
        Self {
            data: vec![0; limits.min as usize * PAGE_SIZE],
            max: limits.max,
        }
    }

    /// Size in pages.
    pub fn size(&self) -> u32 {
        (self.data.len() / PAGE_SIZE) as u32
    }

    /// Grows by `delta` pages unless that passes `limit` pages. Returns the
    /// previous size, or -1 when the memory was left as is.
    pub fn grow(&mut self, delta: u32, limit: u32) -> i32 {
        let size = self.size();
        let limit = self.max.map_or(limit, |max| max.min(limit));
        let new_size = size as u64 + delta as u64;
        if new_size > limit as u64 {
            return -1;
        }
        self.data.resize(new_size as usize * PAGE_SIZE, 0);
        size as i32
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableInst {
    pub elements: Vec<Option<u32>>,
    pub max: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlobalInst {
    pub value: Value,
    pub mutable: bool,
}

/// Mutable state of one instance.
#[derive(Debug, Default)]
pub struct Store {
    pub funcs: Vec<FuncInst>,
    pub memories: Vec<MemoryInst>,
    pub tables: Vec<TableInst>,
    pub globals: Vec<GlobalInst>,
    pub exports: HashMap<String, ExportDesc>,
    pub fuel: Option<u64>,
    max_memory_pages: u32,
}

fn incompatible(module: &str, name: &str, reason: impl Into<String>) -> LinkError {
    LinkError::IncompatibleImport {
        module: module.to_string(),
        name: name.to_string(),
        reason: reason.into(),
    }
}

/// Value of a decoded constant expression. Decoding already checked its
/// shape and type.
fn eval_const(expr: &[Instruction], globals: &[GlobalInst]) -> Option<Value> {
    match expr.first()? {
        Instruction::I32Const(v) => Some(Value::I32(*v)),
        Instruction::I64Const(v) => Some(Value::I64(*v)),
        Instruction::F32Const(v) => Some(Value::F32(*v)),
        Instruction::F64Const(v) => Some(Value::F64(*v)),
        Instruction::GlobalGet(idx) => globals.get(*idx as usize).map(|global| global.value),
        _ => None,
    }
}

fn eval_offset(expr: &[Instruction], globals: &[GlobalInst]) -> u64 {
    match eval_const(expr, globals) {
        Some(Value::I32(offset)) => offset as u32 as u64,
        _ => 0,
    }
}

impl Store {
    /// Resolves imports and lays out the instance. Segments are bounds
    /// checked as a whole before any of them is written.
    pub fn new(module: &Module, imports: &Imports, config: &Config) -> Result<Self, LinkError> {
        let mut store = Store {
            fuel: config.fuel,
            max_memory_pages: config.max_memory_pages,
            ..Default::default()
        };

        for import in &module.imports {
            let (module_name, name) = (import.module.as_str(), import.field.as_str());
            let value = imports
                .get(module_name, name)
                .ok_or_else(|| LinkError::MissingImport {
                    module: module_name.to_string(),
                    name: name.to_string(),
                })?;
            match (&import.desc, value) {
                (ImportDesc::Func(type_idx), HostValue::Func(func)) => {
                    let ty = module
                        .types
                        .get(*type_idx as usize)
                        .cloned()
                        .unwrap_or_default();
                    if func.ty != ty {
                        return Err(incompatible(
                            module_name,
                            name,
                            format!("expected {}, found {}", ty, func.ty),
                        ));
                    }
                    store.funcs.push(FuncInst::Host {
                        ty,
                        module: module_name.to_string(),
                        name: name.to_string(),
                        func: func.clone(),
                    });
                }
                (ImportDesc::Global(ty), HostValue::Global(value, mutable)) => {
                    if value.value_type() != ty.value_type || *mutable != ty.mutable {
                        return Err(incompatible(module_name, name, "global type mismatch"));
                    }
                    store.globals.push(GlobalInst {
                        value: *value,
                        mutable: *mutable,
                    });
                }
                (ImportDesc::Memory(limits), HostValue::Memory(memory)) => {
                    let too_small = memory.size() < limits.min;
                    let too_large = match (limits.max, memory.max) {
                        (Some(max), Some(host_max)) => host_max > max,
                        (Some(_), None) => true,
                        (None, _) => false,
                    };
                    if too_small || too_large {
                        return Err(incompatible(module_name, name, "memory limits mismatch"));
                    }
                    store.memories.push(memory.clone());
                }
                (ImportDesc::Table(_), _) => {
                    return Err(incompatible(
                        module_name,
                        name,
                        "table imports are not supported",
                    ));
                }
                _ => return Err(incompatible(module_name, name, "import kind mismatch")),
            }
        }
        debug!("resolved {} imports", module.imports.len());

        for (def_idx, func) in module.functions.iter().enumerate() {
            let ty = module
                .types
                .get(func.type_idx as usize)
                .cloned()
                .unwrap_or_default();
            store.funcs.push(FuncInst::Internal {
                ty,
                def_idx: def_idx as u32,
            });
        }

        for memory in &module.memories {
            if memory.limits.min > config.max_memory_pages {
                return Err(LinkError::MemoryLimitExceeded {
                    pages: memory.limits.min,
                    limit: config.max_memory_pages,
                });
            }
            store.memories.push(MemoryInst::new(memory.limits));
        }
        for table in &module.tables {
            store.tables.push(TableInst {
                elements: vec![None; table.limits.min as usize],
                max: table.limits.max,
            });
        }

        // initialisers only see the imported globals pushed so far
        for global in &module.globals {
            let value = eval_const(&global.init, &store.globals)
                .unwrap_or(Value::default_for(global.ty.value_type));
            store.globals.push(GlobalInst {
                value,
                mutable: global.ty.mutable,
            });
        }

        store.exports = module
            .exports
            .iter()
            .map(|export| (export.name.clone(), export.desc))
            .collect();

        store.init_segments(module)?;
        debug!(
            "instantiated {} functions, {} memories, {} globals",
            store.funcs.len(),
            store.memories.len(),
            store.globals.len()
        );
        Ok(store)
    }

    fn init_segments(&mut self, module: &Module) -> Result<(), LinkError> {
        let elements = module
            .elements
            .iter()
            .enumerate()
            .map(|(idx, element)| {
                let offset = eval_offset(&element.offset, &self.globals);
                let len = self
                    .tables
                    .get(element.table_idx as usize)
                    .map_or(0, |table| table.elements.len());
                if offset + element.init.len() as u64 > len as u64 {
                    return Err(LinkError::ElementSegmentOutOfBounds(idx));
                }
                Ok(offset as usize)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let data = module
            .data
            .iter()
            .enumerate()
            .map(|(idx, data)| {
                let offset = eval_offset(&data.offset, &self.globals);
                let len = self
                    .memories
                    .get(data.memory_idx as usize)
                    .map_or(0, |memory| memory.data.len());
                if offset + data.init.len() as u64 > len as u64 {
                    return Err(LinkError::DataSegmentOutOfBounds(idx));
                }
                Ok(offset as usize)
            })
            .collect::<Result<Vec<_>, _>>()?;

        for (element, offset) in module.elements.iter().zip(elements) {
            if let Some(table) = self.tables.get_mut(element.table_idx as usize) {
                for (slot, func_idx) in table.elements[offset..].iter_mut().zip(&element.init) {
                    *slot = Some(*func_idx);
                }
            }
        }
        for (data, offset) in module.data.iter().zip(data) {
            if let Some(memory) = self.memories.get_mut(data.memory_idx as usize) {
                memory.data[offset..offset + data.init.len()].copy_from_slice(&data.init);
            }
        }
        Ok(())
    }

    pub fn memory(&self) -> Option<&MemoryInst> {
        self.memories.first()
    }

    pub fn memory_mut(&mut self) -> Option<&mut MemoryInst> {
        self.memories.first_mut()
    }

    /// `memory.grow` on memory 0.
    pub fn memory_grow(&mut self, delta: i32) -> i32 {
        let limit = self.max_memory_pages;
        match self.memories.first_mut() {
            Some(memory) => memory.grow(delta as u32, limit),
            None => -1,
        }
    }

    /// Spends one unit of fuel for a loop back-edge.
    pub fn consume_fuel(&mut self) -> Result<(), Trap> {
        match self.fuel {
            Some(0) => Err(Trap::OutOfFuel),
            Some(fuel) => {
                self.fuel = Some(fuel - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Looks up the function in slot `elem` of a table for `call_indirect`.
    pub fn resolve_indirect(
        &self,
        table_idx: u32,
        elem: i32,
        expected: &FuncType,
    ) -> Result<u32, Trap> {
        let func_idx = self
            .tables
            .get(table_idx as usize)
            .and_then(|table| table.elements.get(elem as u32 as usize))
            .copied()
            .flatten()
            .ok_or(Trap::UndefinedElement)?;
        let func = self
            .funcs
            .get(func_idx as usize)
            .ok_or(Trap::UndefinedElement)?;
        if func.ty() != expected {
            return Err(Trap::IndirectCallTypeMismatch);
        }
        Ok(func_idx)
    }
}

#[cfg(test)]
mod tests {
    use super::{MemoryInst, PAGE_SIZE, Store};
    use crate::{
        binary::{
            module::decode,
            types::{Limits, ValueType},
        },
        error::{LinkError, Trap},
        execution::{
            config::Config,
            import::{HostFunc, HostValue, Imports},
            value::Value,
        },
    };
    use anyhow::Result;
    use pretty_assertions::assert_eq;

    fn store(wat: &str, imports: &Imports) -> Result<std::result::Result<Store, LinkError>> {
        let module = decode(&wat::parse_str(wat)?)?;
        Ok(Store::new(&module, imports, &Config::default()))
    }

    #[test]
    fn memory_grow_respects_limits() {
        let mut memory = MemoryInst::new(Limits {
            min: 1,
            max: Some(3),
        });
        assert_eq!(memory.grow(1, 65536), 1);
        assert_eq!(memory.data.len(), 2 * PAGE_SIZE);
        assert_eq!(memory.grow(2, 65536), -1);
        assert_eq!(memory.grow(0, 65536), 2);
        assert_eq!(memory.grow(1, 2), -1);
        assert_eq!(memory.size(), 2);
    }

    #[test]
    fn init_data_and_elements() -> Result<()> {
        let store = store(
            r#"(module
                (memory 1)
                (table 3 funcref)
                (func $f)
                (elem (i32.const 1) $f $f)
                (data (i32.const 65534) "ab"))"#,
            &Imports::new(),
        )??;
        let memory = store.memory().expect("memory");
        assert_eq!(&memory.data[65534..], b"ab");
        assert_eq!(store.tables[0].elements, vec![None, Some(0), Some(0)]);
        Ok(())
    }

    #[test]
    fn segments_out_of_bounds() -> Result<()> {
        let err = store(
            r#"(module (memory 1) (data (i32.const 65535) "ab"))"#,
            &Imports::new(),
        )?
        .unwrap_err();
        assert_eq!(err, LinkError::DataSegmentOutOfBounds(0));

        let err = store(
            "(module (table 1 funcref) (func $f) (elem (i32.const 1) $f))",
            &Imports::new(),
        )?
        .unwrap_err();
        assert_eq!(err, LinkError::ElementSegmentOutOfBounds(0));

        // the first segment fits, the second does not
        let mut imports = Imports::new();
        imports.define(
            "env",
            "mem",
            HostValue::Memory(MemoryInst::new(Limits { min: 1, max: None })),
        );
        let err = store(
            r#"(module
                (import "env" "mem" (memory 1))
                (data (i32.const 0) "ok")
                (data (i32.const 70000) "no"))"#,
            &imports,
        )?
        .unwrap_err();
        assert_eq!(err, LinkError::DataSegmentOutOfBounds(1));
        Ok(())
    }

    #[test]
    fn link_errors() -> Result<()> {
        let wat = r#"(module (import "env" "f" (func (param i32))))"#;
        let err = store(wat, &Imports::new())?.unwrap_err();
        assert_eq!(
            err,
            LinkError::MissingImport {
                module: "env".into(),
                name: "f".into(),
            }
        );

        let mut imports = Imports::new();
        imports.func(
            "env",
            "f",
            HostFunc::new(vec![ValueType::I64], vec![], |_, _| Ok(vec![])),
        );
        assert!(matches!(
            store(wat, &imports)?,
            Err(LinkError::IncompatibleImport { .. })
        ));

        let mut imports = Imports::new();
        imports.define("env", "f", HostValue::Global(Value::I32(1), false));
        assert!(matches!(
            store(wat, &imports)?,
            Err(LinkError::IncompatibleImport { .. })
        ));

        let table = r#"(module (import "env" "t" (table 1 funcref)))"#;
        let mut imports = Imports::new();
        imports.define("env", "t", HostValue::Global(Value::I32(1), false));
        assert!(matches!(
            store(table, &imports)?,
            Err(LinkError::IncompatibleImport { .. })
        ));
        Ok(())
    }

    #[test]
    fn globals_read_imports() -> Result<()> {
        let mut imports = Imports::new();
        imports.define("env", "base", HostValue::Global(Value::I32(40), false));
        let store = store(
            r#"(module
                (global (import "env" "base") i32)
                (global (mut i32) (global.get 0))
                (global i64 (i64.const -1)))"#,
            &imports,
        )??;
        let values: Vec<_> = store.globals.iter().map(|global| global.value).collect();
        assert_eq!(values, vec![Value::I32(40), Value::I32(40), Value::I64(-1)]);
        assert!(store.globals[1].mutable);
        Ok(())
    }

    #[test]
    fn indirect_resolution() -> Result<()> {
        let store = store(
            r#"(module
                (type $v (func))
                (type $i (func (result i32)))
                (table 3 funcref)
                (func $f (type $v))
                (elem (i32.const 0) $f))"#,
            &Imports::new(),
        )??;
        let v = store.funcs[0].ty().clone();
        assert_eq!(store.resolve_indirect(0, 0, &v), Ok(0));
        let mut i = v.clone();
        i.results.push(ValueType::I32);
        assert_eq!(
            store.resolve_indirect(0, 0, &i),
            Err(Trap::IndirectCallTypeMismatch)
        );
        assert_eq!(
            store.resolve_indirect(0, 1, &v),
            Err(Trap::UndefinedElement)
        );
        assert_eq!(
            store.resolve_indirect(0, 3, &v),
            Err(Trap::UndefinedElement)
        );
        assert_eq!(
            store.resolve_indirect(0, -1, &v),
            Err(Trap::UndefinedElement)
        );
        Ok(())
    }

    #[test]
    fn fuel_runs_out() {
        let mut store = Store {
            fuel: Some(2),
            ..Default::default()
        };
        assert_eq!(store.consume_fuel(), Ok(()));
        assert_eq!(store.consume_fuel(), Ok(()));
        assert_eq!(store.consume_fuel(), Err(Trap::OutOfFuel));
    }

    #[test]
    fn initial_memory_respects_page_limit() -> Result<()> {
        let module = decode(&wat::parse_str("(module (memory 65536))")?)?;
        let config = Config::default().max_memory_pages(2);
        assert_eq!(
            Store::new(&module, &Imports::new(), &config).err(),
            Some(LinkError::MemoryLimitExceeded {
                pages: 65536,
                limit: 2,
            })
        );

        let module = decode(&wat::parse_str("(module (memory 2))")?)?;
        let store = Store::new(&module, &Imports::new(), &config)?;
        assert_eq!(store.memory().map(MemoryInst::size), Some(2));
        Ok(())
    }
}
