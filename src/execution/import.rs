use anyhow::Result;
use std::{collections::HashMap, fmt, sync::Arc};

use super::{
    store::{MemoryInst, Store},
    value::Value,
};
use crate::binary::types::{FuncType, ValueType};

pub type HostFn = dyn Fn(&mut Store, Vec<Value>) -> Result<Vec<Value>> + Send + Sync;

/// A host function together with the signature it promises to honour.
#[derive(Clone)]
pub struct HostFunc {
    pub ty: FuncType,
    pub func: Arc<HostFn>,
}

impl HostFunc {
    pub fn new(
        params: Vec<ValueType>,
        results: Vec<ValueType>,
        func: impl Fn(&mut Store, Vec<Value>) -> Result<Vec<Value>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            ty: FuncType { params, results },
            func: Arc::new(func),
        }
    }
}

impl fmt::Debug for HostFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunc").field("ty", &self.ty).finish()
    }
}

#[derive(Debug, Clone)]
pub enum HostValue {
    Func(HostFunc),
    Global(Value, bool),
    Memory(MemoryInst),
}

/// Host values keyed by module name, then field name.
#[derive(Debug, Clone, Default)]
pub struct Imports {
    modules: HashMap<String, HashMap<String, HostValue>>,
}

impl Imports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(
        &mut self,
        module: impl Into<String>,
        name: impl Into<String>,
        value: HostValue,
    ) -> &mut Self {
        self.modules
            .entry(module.into())
            .or_default()
            .insert(name.into(), value);
        self
    }

    pub fn func(
        &mut self,
        module: impl Into<String>,
        name: impl Into<String>,
        func: HostFunc,
    ) -> &mut Self {
        self.define(module, name, HostValue::Func(func))
    }

    pub fn get(&self, module: &str, name: &str) -> Option<&HostValue> {
        self.modules.get(module)?.get(name)
    }
}
