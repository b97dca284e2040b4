use std::sync::Arc;

use log::{debug, trace};

use super::{
    compiler::{CodeCache, CompiledFunction, Context, Flow},
    config::Config,
    control::{Branch, Label, LabelKind, branch, end_block, stack_unwind},
    import::Imports,
    ops,
    store::{FuncInst, Store},
    value::{StackExt, Value, assign, check_types},
};
use crate::{
    binary::{
        instruction::Instruction,
        module::{Module, decode},
        types::{ExportDesc, ValueType},
        validate::validate,
    },
    error::{DecodeError, LinkError, Trap},
};

/// A decoded module plus its compiled-code cache, cheap to clone and share
/// between threads.
#[derive(Clone)]
pub struct SharedModule {
    module: Arc<Module>,
    cache: Arc<CodeCache>,
}

impl SharedModule {
    /// Wraps a module built by hand; it is validated like a decoded one.
    pub fn new(module: Module) -> Result<Self, DecodeError> {
        validate(&module)?;
        Ok(Self::from_validated(module))
    }

    pub fn decode(wasm: &[u8]) -> Result<Self, DecodeError> {
        Ok(Self::from_validated(decode(wasm)?))
    }

    fn from_validated(module: Module) -> Self {
        let cache = Arc::new(CodeCache::new(&module));
        Self {
            module: Arc::new(module),
            cache,
        }
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn cache(&self) -> &CodeCache {
        &self.cache
    }
}

#[derive(Debug, Default)]
pub struct Frame {
    pub func_idx: u32,
    pub def_idx: u32,
    pub pc: usize,
    pub sp: usize,
    pub arity: usize,
    pub labels: Vec<Label>,
    pub locals: Vec<Value>,
}

/// A frame of the compiled strategy; the function's code travels with it.
pub struct CompiledFrame {
    pub func_idx: u32,
    pub code: Arc<CompiledFunction>,
    pub pc: usize,
    pub sp: usize,
    pub arity: usize,
    pub labels: Vec<Label>,
    pub locals: Vec<Value>,
}

pub struct Runtime {
    module: Arc<Module>,
    cache: Arc<CodeCache>,
    pub store: Store,
    pub stack: Vec<Value>,
    pub call_stack: Vec<Frame>,
    pub compiled_frames: Vec<CompiledFrame>,
    config: Config,
    depth: usize,
    trap_origin: Option<u32>,
}

/// Pops call arguments, checking them against the callee's parameters.
fn take_args(stack: &mut Vec<Value>, params: &[ValueType]) -> Result<Vec<Value>, Trap> {
    let bottom = stack
        .len()
        .checked_sub(params.len())
        .ok_or(Trap::StackUnderflow)?;
    let args = stack.split_off(bottom);
    if let Some((value, ty)) = args
        .iter()
        .zip(params)
        .find(|(value, ty)| value.value_type() != **ty)
    {
        return Err(Trap::TypeMismatch {
            expected: *ty,
            found: value.value_type(),
        });
    }
    Ok(args)
}

impl Runtime {
    pub fn instantiate(module: &SharedModule, imports: Imports) -> Result<Self, LinkError> {
        Self::instantiate_with_config(module, imports, Config::default())
    }

    pub fn instantiate_with_config(
        module: &SharedModule,
        imports: Imports,
        config: Config,
    ) -> Result<Self, LinkError> {
        let store = Store::new(&module.module, &imports, &config)?;
        let mut runtime = Self {
            module: Arc::clone(&module.module),
            cache: Arc::clone(&module.cache),
            store,
            stack: vec![],
            call_stack: vec![],
            compiled_frames: vec![],
            config,
            depth: 0,
            trap_origin: None,
        };

        if let Some(start) = runtime.module.start {
            debug!("running start function {}", start);
            if let Err(trap) = runtime.call(start) {
                runtime.cleanup();
                return Err(LinkError::Start(trap));
            }
            runtime.stack.clear();
        }
        Ok(runtime)
    }

    /// Decodes and instantiates a module that needs no imports.
    pub fn load(wasm: impl AsRef<[u8]>) -> anyhow::Result<Self> {
        let module = SharedModule::decode(wasm.as_ref())?;
        Ok(Self::instantiate(&module, Imports::default())?)
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Export names in declaration order.
    pub fn exports(&self) -> impl Iterator<Item = &str> {
        self.module.exports.iter().map(|export| export.name.as_str())
    }

    /// Value of an exported global.
    pub fn global(&self, name: &str) -> Option<Value> {
        match self.store.exports.get(name)? {
            ExportDesc::Global(idx) => self.store.globals.get(*idx as usize).map(|g| g.value),
            _ => None,
        }
    }

    pub fn read_memory(&self, offset: usize, len: usize) -> Result<&[u8], Trap> {
        let memory = self.store.memory().ok_or(Trap::MemoryOutOfBounds)?;
        let end = offset.checked_add(len).ok_or(Trap::MemoryOutOfBounds)?;
        memory.data.get(offset..end).ok_or(Trap::MemoryOutOfBounds)
    }

    pub fn write_memory(&mut self, offset: usize, bytes: &[u8]) -> Result<(), Trap> {
        let memory = self.store.memory_mut().ok_or(Trap::MemoryOutOfBounds)?;
        let end = offset
            .checked_add(bytes.len())
            .ok_or(Trap::MemoryOutOfBounds)?;
        memory
            .data
            .get_mut(offset..end)
            .ok_or(Trap::MemoryOutOfBounds)?
            .copy_from_slice(bytes);
        Ok(())
    }

    pub fn set_fuel(&mut self, fuel: Option<u64>) {
        self.store.fuel = fuel;
    }

    pub fn fuel(&self) -> Option<u64> {
        self.store.fuel
    }

    /// Function index where the last trap was raised.
    pub fn trap_origin(&self) -> Option<u32> {
        self.trap_origin
    }

    /// Calls an exported function. A trap unwinds the whole call; the
    /// instance stays usable but keeps memory and global writes made before
    /// the trap.
    pub fn invoke(&mut self, name: &str, args: &[Value]) -> Result<Vec<Value>, Trap> {
        let func_idx = match self.store.exports.get(name) {
            Some(ExportDesc::Func(idx)) => *idx,
            _ => return Err(Trap::ExportNotFound(name.to_string())),
        };
        self.invoke_func(func_idx, name, args)
    }

    /// Calls the function in slot `elem` of table 0, the way
    /// `call_indirect` would but with the signature taken from the slot.
    pub fn invoke_indirect(&mut self, elem: u32, args: &[Value]) -> Result<Vec<Value>, Trap> {
        let func_idx = self
            .store
            .tables
            .first()
            .and_then(|table| table.elements.get(elem as usize))
            .copied()
            .flatten()
            .ok_or(Trap::UndefinedElement)?;
        self.invoke_func(func_idx, &format!("table[{elem}]"), args)
    }

    fn invoke_func(
        &mut self,
        func_idx: u32,
        name: &str,
        args: &[Value],
    ) -> Result<Vec<Value>, Trap> {
        let ty = self
            .store
            .funcs
            .get(func_idx as usize)
            .map(FuncInst::ty)
            .ok_or(Trap::UndefinedElement)?;
        if !check_types(args, &ty.params) {
            return Err(Trap::ArgumentMismatch(name.to_string()));
        }
        let results = ty.results.len();

        trace!("invoke {}({:?})", name, args);
        self.trap_origin = None;
        self.stack.clear();
        self.stack.extend_from_slice(args);

        match self.call(func_idx) {
            Ok(()) => {
                let bottom = self.stack.len().saturating_sub(results);
                let values = self.stack.split_off(bottom);
                self.stack.clear();
                Ok(values)
            }
            Err(trap) => {
                debug!("{} trapped in function {:?}: {}", name, self.trap_origin, trap);
                self.cleanup();
                Err(trap)
            }
        }
    }

    /// Calls a function whose arguments are on the operand stack, leaving
    /// its results there.
    fn call(&mut self, func_idx: u32) -> Result<(), Trap> {
        match self.store.funcs.get(func_idx as usize) {
            Some(FuncInst::Host { .. }) => self.call_host(func_idx),
            Some(FuncInst::Internal { def_idx, .. }) => {
                let def_idx = *def_idx;
                if self.config.compile {
                    let base = self.compiled_frames.len();
                    self.push_compiled(func_idx, def_idx)?;
                    self.run_compiled(base)
                } else {
                    let base = self.call_stack.len();
                    self.push_frame(func_idx, def_idx)?;
                    self.run_interpreted(base)
                }
            }
            None => Err(Trap::UndefinedElement),
        }
    }

    fn call_host(&mut self, func_idx: u32) -> Result<(), Trap> {
        let Some(FuncInst::Host {
            ty,
            module,
            name,
            func,
        }) = self.store.funcs.get(func_idx as usize).cloned()
        else {
            return Err(Trap::UndefinedElement);
        };
        trace!("call host function {}.{}", module, name);

        let result = take_args(&mut self.stack, &ty.params).and_then(|args| {
            let results = (func.func)(&mut self.store, args).map_err(|err| Trap::Host {
                module: module.clone(),
                name: name.clone(),
                message: format!("{err:#}"),
            })?;
            if results.len() != ty.results.len() {
                return Err(Trap::Host {
                    module: module.clone(),
                    name: name.clone(),
                    message: format!(
                        "returned {} values, expected {}",
                        results.len(),
                        ty.results.len()
                    ),
                });
            }
            take_args(&mut results.clone(), &ty.results)?;
            Ok(results)
        });

        match result {
            Ok(results) => {
                self.stack.extend(results);
                Ok(())
            }
            Err(trap) => {
                self.trap_origin.get_or_insert(func_idx);
                Err(trap)
            }
        }
    }

    /// Takes the arguments of `func_idx` and appends its zeroed locals. The
    /// callee is recorded as the trap origin on failure.
    fn enter(&mut self, func_idx: u32, def_idx: u32) -> Result<Vec<Value>, Trap> {
        let locals = self.take_locals(func_idx, def_idx);
        match locals {
            Ok(_) => {
                self.depth += 1;
                trace!("call function {} (depth {})", func_idx, self.depth);
            }
            Err(_) => {
                self.trap_origin.get_or_insert(func_idx);
            }
        }
        locals
    }

    fn take_locals(&mut self, func_idx: u32, def_idx: u32) -> Result<Vec<Value>, Trap> {
        if self.depth >= self.config.max_call_depth {
            return Err(Trap::CallStackExhausted);
        }
        let ty = self
            .store
            .funcs
            .get(func_idx as usize)
            .map(FuncInst::ty)
            .ok_or(Trap::UndefinedElement)?;
        let mut locals = take_args(&mut self.stack, &ty.params)?;
        if let Some(func) = self.module.functions.get(def_idx as usize) {
            locals.extend(func.locals.iter().map(|ty| Value::default_for(*ty)));
        }
        Ok(locals)
    }

    fn push_compiled(&mut self, func_idx: u32, def_idx: u32) -> Result<(), Trap> {
        let locals = self.enter(func_idx, def_idx)?;
        let code = self.cache.get_or_compile(&self.module, def_idx);
        let arity = self.store.funcs[func_idx as usize].ty().results.len();
        self.compiled_frames.push(CompiledFrame {
            func_idx,
            code,
            pc: 0,
            sp: self.stack.len(),
            arity,
            labels: vec![],
            locals,
        });
        Ok(())
    }

    fn pop_compiled(&mut self) -> Result<(), Trap> {
        let Some(frame) = self.compiled_frames.pop() else {
            return Err(Trap::StackUnderflow);
        };
        self.depth -= 1;
        stack_unwind(&mut self.stack, frame.sp, frame.arity)
    }

    /// Runs compiled frames until the compiled call stack is back to `base`
    /// frames. Calls push a frame instead of recursing.
    fn run_compiled(&mut self, base: usize) -> Result<(), Trap> {
        let result = self.execute_compiled(base);
        if result.is_err() {
            if let Some(frame) = self.compiled_frames.last() {
                self.trap_origin.get_or_insert(frame.func_idx);
            }
        }
        result
    }

    fn execute_compiled(&mut self, base: usize) -> Result<(), Trap> {
        loop {
            if self.compiled_frames.len() <= base {
                return Ok(());
            }
            let Some(CompiledFrame {
                code,
                pc,
                labels,
                locals,
                ..
            }) = self.compiled_frames.last_mut()
            else {
                return Ok(());
            };
            let Some(op) = code.ops.get(*pc) else {
                self.pop_compiled()?;
                continue;
            };
            let mut ctx = Context {
                stack: &mut self.stack,
                locals,
                labels,
                store: &mut self.store,
            };
            match op(&mut ctx)? {
                Flow::Next => *pc += 1,
                Flow::Jump(target) => *pc = target,
                Flow::Call(callee) => {
                    *pc += 1;
                    self.call_from_compiled(callee)?;
                }
                Flow::Return => self.pop_compiled()?,
            }
        }
    }

    fn call_from_compiled(&mut self, func_idx: u32) -> Result<(), Trap> {
        match self.store.funcs.get(func_idx as usize) {
            Some(FuncInst::Host { .. }) => self.call_host(func_idx),
            Some(FuncInst::Internal { def_idx, .. }) => {
                let def_idx = *def_idx;
                self.push_compiled(func_idx, def_idx)
            }
            None => Err(Trap::UndefinedElement),
        }
    }

    fn push_frame(&mut self, func_idx: u32, def_idx: u32) -> Result<(), Trap> {
        let locals = self.enter(func_idx, def_idx)?;
        let arity = self.store.funcs[func_idx as usize].ty().results.len();
        self.call_stack.push(Frame {
            func_idx,
            def_idx,
            pc: 0,
            sp: self.stack.len(),
            arity,
            labels: vec![],
            locals,
        });
        Ok(())
    }

    fn pop_frame(&mut self) -> Result<(), Trap> {
        let Some(frame) = self.call_stack.pop() else {
            return Err(Trap::StackUnderflow);
        };
        self.depth -= 1;
        let Frame { sp, arity, .. } = frame;
        stack_unwind(&mut self.stack, sp, arity)
    }

    /// Runs frames until the call stack is back to `base` frames.
    fn run_interpreted(&mut self, base: usize) -> Result<(), Trap> {
        let result = self.execute(base);
        if result.is_err() {
            if let Some(frame) = self.call_stack.last() {
                self.trap_origin.get_or_insert(frame.func_idx);
            }
        }
        result
    }

    fn execute(&mut self, base: usize) -> Result<(), Trap> {
        let module = Arc::clone(&self.module);
        loop {
            if self.call_stack.len() <= base {
                return Ok(());
            }
            let Some(frame) = self.call_stack.last_mut() else {
                return Ok(());
            };
            let Some(inst) = module
                .functions
                .get(frame.def_idx as usize)
                .and_then(|func| func.body.get(frame.pc))
            else {
                self.pop_frame()?;
                continue;
            };
            frame.pc += 1;

            match inst {
                Instruction::Unreachable => return Err(Trap::Unreachable),
                Instruction::Nop => {}
                Instruction::Block { ty, end } => {
                    let arity = module.block_arity(*ty);
                    let label = Label::enter(LabelKind::Block, end + 1, &self.stack, arity)?;
                    frame.labels.push(label);
                }
                Instruction::Loop { ty } => {
                    let arity = module.block_arity(*ty);
                    let label = Label::enter(LabelKind::Loop, frame.pc - 1, &self.stack, arity)?;
                    frame.labels.push(label);
                }
                Instruction::If { ty, else_at, end } => {
                    let cond = self.stack.pop_i32()?;
                    let arity = module.block_arity(*ty);
                    let label = Label::enter(LabelKind::If, end + 1, &self.stack, arity)?;
                    frame.labels.push(label);
                    if cond == 0 {
                        frame.pc = else_at.map_or(*end, |at| at + 1);
                    }
                }
                Instruction::Else { end } => frame.pc = *end,
                Instruction::End => {
                    if !end_block(&mut frame.labels, &mut self.stack)? {
                        self.pop_frame()?;
                    }
                }
                Instruction::Br(depth) => self.take_branch(*depth)?,
                Instruction::BrIf(depth) => {
                    if self.stack.pop_i32()? != 0 {
                        self.take_branch(*depth)?;
                    }
                }
                Instruction::BrTable { targets, default } => {
                    let idx = self.stack.pop_i32()? as u32 as usize;
                    let depth = targets.get(idx).copied().unwrap_or(*default);
                    self.take_branch(depth)?;
                }
                Instruction::Return => self.pop_frame()?,
                Instruction::Call(func_idx) => self.call_from_frame(*func_idx)?,
                Instruction::CallIndirect {
                    type_idx,
                    table_idx,
                } => {
                    let elem = self.stack.pop_i32()?;
                    let ty = module
                        .types
                        .get(*type_idx as usize)
                        .ok_or(Trap::IndirectCallTypeMismatch)?;
                    let func_idx = self.store.resolve_indirect(*table_idx, elem, ty)?;
                    self.call_from_frame(func_idx)?;
                }
                Instruction::Drop => {
                    self.stack.pop_value()?;
                }
                Instruction::Select => {
                    let cond = self.stack.pop_i32()?;
                    let b = self.stack.pop_value()?;
                    let a = self.stack.pop_value()?;
                    self.stack.push(ops::select(cond, a, b)?);
                }
                Instruction::LocalGet(idx) => self.stack.push(frame.locals[*idx as usize]),
                Instruction::LocalSet(idx) => {
                    let value = self.stack.pop_value()?;
                    assign(&mut frame.locals[*idx as usize], value)?;
                }
                Instruction::LocalTee(idx) => {
                    let value = *self.stack.last().ok_or(Trap::StackUnderflow)?;
                    assign(&mut frame.locals[*idx as usize], value)?;
                }
                Instruction::GlobalGet(idx) => {
                    self.stack.push(self.store.globals[*idx as usize].value);
                }
                Instruction::GlobalSet(idx) => {
                    let value = self.stack.pop_value()?;
                    assign(&mut self.store.globals[*idx as usize].value, value)?;
                }
                Instruction::Load(kind, memarg) => {
                    let addr = self.stack.pop_i32()?;
                    let memory = self.store.memory().ok_or(Trap::MemoryOutOfBounds)?;
                    let ea = ops::effective_address(addr, memarg.offset);
                    let value = ops::loader(*kind)(&memory.data, ea)?;
                    self.stack.push(value);
                }
                Instruction::Store(kind, memarg) => {
                    let value = self.stack.pop_value()?;
                    let addr = self.stack.pop_i32()?;
                    let memory = self.store.memory_mut().ok_or(Trap::MemoryOutOfBounds)?;
                    let ea = ops::effective_address(addr, memarg.offset);
                    ops::storer(*kind)(&mut memory.data, ea, value)?;
                }
                Instruction::MemorySize => {
                    let size = self.store.memory().map_or(0, |memory| memory.size());
                    self.stack.push(Value::I32(size as i32));
                }
                Instruction::MemoryGrow => {
                    let delta = self.stack.pop_i32()?;
                    let old = self.store.memory_grow(delta);
                    self.stack.push(Value::I32(old));
                }
                Instruction::I32Const(v) => self.stack.push(Value::I32(*v)),
                Instruction::I64Const(v) => self.stack.push(Value::I64(*v)),
                Instruction::F32Const(v) => self.stack.push(Value::F32(*v)),
                Instruction::F64Const(v) => self.stack.push(Value::F64(*v)),
                Instruction::I32Eqz => {
                    let a = self.stack.pop_i32()?;
                    self.stack.push((a == 0).into());
                }
                Instruction::I64Eqz => {
                    let a = self.stack.pop_i64()?;
                    self.stack.push((a == 0).into());
                }
                Instruction::I32Compare(op) => {
                    let (b, a) = (self.stack.pop_i32()?, self.stack.pop_i32()?);
                    self.stack.push(ops::i32_compare(*op)(a, b).into());
                }
                Instruction::I64Compare(op) => {
                    let (b, a) = (self.stack.pop_i64()?, self.stack.pop_i64()?);
                    self.stack.push(ops::i64_compare(*op)(a, b).into());
                }
                Instruction::F32Compare(op) => {
                    let (b, a) = (self.stack.pop_f32()?, self.stack.pop_f32()?);
                    self.stack.push(ops::float_compare::<f32>(*op)(a, b).into());
                }
                Instruction::F64Compare(op) => {
                    let (b, a) = (self.stack.pop_f64()?, self.stack.pop_f64()?);
                    self.stack.push(ops::float_compare::<f64>(*op)(a, b).into());
                }
                Instruction::I32Unary(op) => {
                    let a = self.stack.pop_i32()?;
                    self.stack.push(Value::I32(ops::i32_unary(*op)(a)));
                }
                Instruction::I64Unary(op) => {
                    let a = self.stack.pop_i64()?;
                    self.stack.push(Value::I64(ops::i64_unary(*op)(a)));
                }
                Instruction::F32Unary(op) => {
                    let a = self.stack.pop_f32()?;
                    self.stack.push(Value::F32(ops::float_unary::<f32>(*op)(a)));
                }
                Instruction::F64Unary(op) => {
                    let a = self.stack.pop_f64()?;
                    self.stack.push(Value::F64(ops::float_unary::<f64>(*op)(a)));
                }
                Instruction::I32Binary(op) => {
                    let (b, a) = (self.stack.pop_i32()?, self.stack.pop_i32()?);
                    self.stack.push(Value::I32(ops::i32_binary(*op)(a, b)?));
                }
                Instruction::I64Binary(op) => {
                    let (b, a) = (self.stack.pop_i64()?, self.stack.pop_i64()?);
                    self.stack.push(Value::I64(ops::i64_binary(*op)(a, b)?));
                }
                Instruction::F32Binary(op) => {
                    let (b, a) = (self.stack.pop_f32()?, self.stack.pop_f32()?);
                    self.stack.push(Value::F32(ops::float_binary::<f32>(*op)(a, b)));
                }
                Instruction::F64Binary(op) => {
                    let (b, a) = (self.stack.pop_f64()?, self.stack.pop_f64()?);
                    self.stack.push(Value::F64(ops::float_binary::<f64>(*op)(a, b)));
                }
                Instruction::Convert(op) => {
                    let value = self.stack.pop_value()?;
                    self.stack.push(ops::conversion(*op)(value)?);
                }
            }
        }
    }

    fn take_branch(&mut self, depth: u32) -> Result<(), Trap> {
        let Some(frame) = self.call_stack.last_mut() else {
            return Err(Trap::StackUnderflow);
        };
        match branch(&mut frame.labels, &mut self.stack, depth)? {
            Branch::Jump(pc) => frame.pc = pc,
            Branch::Loop(pc) => {
                frame.pc = pc;
                self.store.consume_fuel()?;
            }
            Branch::Return => self.pop_frame()?,
        }
        Ok(())
    }

    /// `call` from interpreted code: host functions run in place, wasm
    /// functions get a frame on the shared call stack.
    fn call_from_frame(&mut self, func_idx: u32) -> Result<(), Trap> {
        match self.store.funcs.get(func_idx as usize) {
            Some(FuncInst::Host { .. }) => self.call_host(func_idx),
            Some(FuncInst::Internal { def_idx, .. }) => {
                let def_idx = *def_idx;
                self.push_frame(func_idx, def_idx)
            }
            None => Err(Trap::UndefinedElement),
        }
    }

    fn cleanup(&mut self) {
        self.stack = vec![];
        self.call_stack = vec![];
        self.compiled_frames = vec![];
        self.depth = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::{Runtime, SharedModule};
    use crate::{
        binary::types::ValueType,
        error::{LinkError, Trap},
        execution::{
            config::Config,
            import::{HostFunc, Imports},
            value::Value,
        },
    };
    use anyhow::{Result, bail};
    use pretty_assertions::assert_eq;
    use rand::{Rng, SeedableRng, rngs::StdRng};

    /// One compiled and one interpreted instance of the same module.
    fn runtimes(wasm: &[u8], config: Config) -> Result<Vec<Runtime>> {
        let module = SharedModule::decode(wasm)?;
        [true, false]
            .into_iter()
            .map(|compile| {
                let config = config.clone().compile(compile);
                Ok(Runtime::instantiate_with_config(
                    &module,
                    Imports::new(),
                    config,
                )?)
            })
            .collect()
    }

    fn add_imports() -> Imports {
        let mut imports = Imports::new();
        imports.func(
            "env",
            "add",
            HostFunc::new(
                vec![ValueType::I32, ValueType::I32],
                vec![ValueType::I32],
                |_, args| match args[..] {
                    [Value::I32(a), Value::I32(b)] => Ok(vec![Value::I32(a.wrapping_add(b))]),
                    _ => bail!("bad arguments {args:?}"),
                },
            ),
        );
        imports
    }

    #[test]
    fn execute_i32_add() -> Result<()> {
        let wasm = wat::parse_file("src/fixtures/func_add.wat")?;
        let mut runtime = Runtime::load(wasm)?;
        let tests = vec![(2, 3, 5), (10, 5, 15), (1, 1, 2), (i32::MAX, 1, i32::MIN)];

        for (left, right, want) in tests {
            let args = [Value::I32(left), Value::I32(right)];
            let result = runtime.invoke("add", &args)?;
            assert_eq!(result, vec![Value::I32(want)]);
        }
        Ok(())
    }

    #[test]
    fn not_found_export_function() -> Result<()> {
        let wasm = wat::parse_file("src/fixtures/func_add.wat")?;
        let mut runtime = Runtime::load(wasm)?;
        let result = runtime.invoke("fooooo", &[]);
        assert_eq!(result, Err(Trap::ExportNotFound("fooooo".into())));
        Ok(())
    }

    #[test]
    fn argument_mismatch() -> Result<()> {
        let wasm = wat::parse_file("src/fixtures/func_add.wat")?;
        let mut runtime = Runtime::load(wasm)?;
        let tests: Vec<&[Value]> = vec![
            &[Value::I32(1)],
            &[Value::I32(1), Value::I64(2)],
            &[Value::I32(1), Value::I32(2), Value::I32(3)],
        ];
        for args in tests {
            assert_eq!(
                runtime.invoke("add", args),
                Err(Trap::ArgumentMismatch("add".into()))
            );
        }
        Ok(())
    }

    #[test]
    fn func_call() -> Result<()> {
        let wasm = wat::parse_file("src/fixtures/func_call.wat")?;
        for mut runtime in runtimes(&wasm, Config::default())? {
            for (arg, want) in [(2, 4), (10, 20), (-3, -6)] {
                let result = runtime.invoke("call_doubler", &[Value::I32(arg)])?;
                assert_eq!(result, vec![Value::I32(want)]);
            }
        }
        Ok(())
    }

    #[test]
    fn fib() -> Result<()> {
        let wasm = wat::parse_file("src/fixtures/fib.wat")?;
        let tests = vec![(0, 0), (1, 1), (2, 1), (5, 5), (10, 55), (20, 6765)];
        for mut runtime in runtimes(&wasm, Config::default())? {
            for (n, want) in &tests {
                let result = runtime.invoke("fib", &[Value::I32(*n)])?;
                assert_eq!(result, vec![Value::I32(*want)]);
            }
        }
        Ok(())
    }

    #[test]
    fn call_imported_func() -> Result<()> {
        let wasm = wat::parse_file("src/fixtures/import.wat")?;
        let module = SharedModule::decode(&wasm)?;
        for compile in [true, false] {
            let config = Config::default().compile(compile);
            let mut runtime = Runtime::instantiate_with_config(&module, add_imports(), config)?;
            let result = runtime.invoke("call_add", &[Value::I32(1), Value::I32(2)])?;
            assert_eq!(result, vec![Value::I32(3)]);
        }
        Ok(())
    }

    #[test]
    fn not_found_imported_func() -> Result<()> {
        let wasm = wat::parse_file("src/fixtures/import.wat")?;
        let module = SharedModule::decode(&wasm)?;
        let result = Runtime::instantiate(&module, Imports::new());
        assert!(matches!(
            result,
            Err(LinkError::MissingImport { module, name }) if module == "env" && name == "add"
        ));
        Ok(())
    }

    #[test]
    fn host_error_becomes_trap() -> Result<()> {
        let wasm = wat::parse_file("src/fixtures/import.wat")?;
        let module = SharedModule::decode(&wasm)?;
        let mut imports = Imports::new();
        imports.func(
            "env",
            "add",
            HostFunc::new(
                vec![ValueType::I32, ValueType::I32],
                vec![ValueType::I32],
                |_, _| bail!("no adding today"),
            ),
        );
        let mut runtime = Runtime::instantiate(&module, imports)?;
        let result = runtime.invoke("call_add", &[Value::I32(1), Value::I32(2)]);
        assert_eq!(
            result,
            Err(Trap::Host {
                module: "env".into(),
                name: "add".into(),
                message: "no adding today".into(),
            })
        );
        assert_eq!(runtime.trap_origin(), Some(0));
        Ok(())
    }

    #[test]
    fn host_result_is_checked() -> Result<()> {
        let wasm = wat::parse_file("src/fixtures/import.wat")?;
        let module = SharedModule::decode(&wasm)?;
        let mut imports = Imports::new();
        imports.func(
            "env",
            "add",
            HostFunc::new(
                vec![ValueType::I32, ValueType::I32],
                vec![ValueType::I32],
                |_, _| Ok(vec![Value::F32(1.0)]),
            ),
        );
        let mut runtime = Runtime::instantiate(&module, imports)?;
        let result = runtime.invoke("call_add", &[Value::I32(1), Value::I32(2)]);
        assert_eq!(
            result,
            Err(Trap::TypeMismatch {
                expected: ValueType::I32,
                found: ValueType::F32,
            })
        );
        Ok(())
    }

    #[test]
    fn arithmetic_traps() -> Result<()> {
        let wasm = wat::parse_str(
            r#"
            (module
              (func (export "div_s") (param i32 i32) (result i32)
                (i32.div_s (local.get 0) (local.get 1)))
              (func (export "rem_u") (param i64 i64) (result i64)
                (i64.rem_u (local.get 0) (local.get 1)))
              (func (export "trunc") (param f32) (result i32)
                (i32.trunc_f32_s (local.get 0)))
              (func (export "fadd") (param f64 f64) (result f64)
                (f64.add (local.get 0) (local.get 1)))
              (func (export "boom")
                unreachable)
            )
            "#,
        )?;
        for mut runtime in runtimes(&wasm, Config::default())? {
            assert_eq!(
                runtime.invoke("div_s", &[Value::I32(1), Value::I32(0)]),
                Err(Trap::DivisionByZero)
            );
            assert_eq!(
                runtime.invoke("div_s", &[Value::I32(i32::MIN), Value::I32(-1)]),
                Err(Trap::IntegerOverflow)
            );
            assert_eq!(
                runtime.invoke("div_s", &[Value::I32(-7), Value::I32(2)]),
                Ok(vec![Value::I32(-3)])
            );
            assert_eq!(
                runtime.invoke("rem_u", &[Value::I64(7), Value::I64(0)]),
                Err(Trap::DivisionByZero)
            );
            assert_eq!(
                runtime.invoke("trunc", &[Value::F32(f32::NAN)]),
                Err(Trap::InvalidConversion)
            );
            assert_eq!(
                runtime.invoke("trunc", &[Value::F32(3e9)]),
                Err(Trap::InvalidConversion)
            );
            assert_eq!(
                runtime.invoke("trunc", &[Value::F32(-2.9)]),
                Ok(vec![Value::I32(-2)])
            );
            assert_eq!(runtime.invoke("boom", &[]), Err(Trap::Unreachable));

            let result = runtime.invoke("fadd", &[Value::F64(f64::NAN), Value::F64(1.0)])?;
            assert!(matches!(result[..], [Value::F64(v)] if v.is_nan()));
        }
        Ok(())
    }

    #[test]
    fn memory_access() -> Result<()> {
        let wasm = wat::parse_file("src/fixtures/memory.wat")?;
        for mut runtime in runtimes(&wasm, Config::default())? {
            assert_eq!(runtime.read_memory(0, 5)?, b"hello");
            assert_eq!(runtime.read_memory(65531, 5)?, b"world");
            assert_eq!(runtime.read_memory(65532, 5), Err(Trap::MemoryOutOfBounds));

            assert_eq!(
                runtime.invoke("load", &[Value::I32(1)])?,
                vec![Value::I32(b'e' as i32)]
            );
            assert_eq!(
                runtime.invoke("load", &[Value::I32(65535)])?,
                vec![Value::I32(b'd' as i32)]
            );
            assert_eq!(
                runtime.invoke("load", &[Value::I32(65536)]),
                Err(Trap::MemoryOutOfBounds)
            );
            assert!(runtime.invoke("load_i32", &[Value::I32(65532)]).is_ok());
            assert_eq!(
                runtime.invoke("load_i32", &[Value::I32(65533)]),
                Err(Trap::MemoryOutOfBounds)
            );
            assert_eq!(
                runtime.invoke("load_i32", &[Value::I32(-1)]),
                Err(Trap::MemoryOutOfBounds)
            );

            runtime.invoke("store", &[Value::I32(8), Value::I32(0x2a2b)])?;
            assert_eq!(runtime.read_memory(8, 4)?, [0x2bu8, 0x2a, 0, 0]);
            runtime.write_memory(16, &[1, 0, 0, 0])?;
            assert_eq!(
                runtime.invoke("load_i32", &[Value::I32(16)])?,
                vec![Value::I32(1)]
            );
        }
        Ok(())
    }

    #[test]
    fn memory_grow() -> Result<()> {
        let wasm = wat::parse_file("src/fixtures/memory.wat")?;
        for mut runtime in runtimes(&wasm, Config::default())? {
            assert_eq!(runtime.invoke("size", &[])?, vec![Value::I32(1)]);
            assert_eq!(runtime.invoke("grow", &[Value::I32(1)])?, vec![Value::I32(1)]);
            assert_eq!(runtime.invoke("size", &[])?, vec![Value::I32(2)]);
            assert_eq!(
                runtime.invoke("load_i32", &[Value::I32(65533)])?,
                vec![Value::I32(0x64_6c_72)]
            );
            // declared maximum is 4 pages
            assert_eq!(runtime.invoke("grow", &[Value::I32(3)])?, vec![Value::I32(-1)]);
            assert_eq!(runtime.invoke("grow", &[Value::I32(2)])?, vec![Value::I32(2)]);
            assert_eq!(runtime.invoke("size", &[])?, vec![Value::I32(4)]);
        }

        let config = Config::default().max_memory_pages(2);
        for mut runtime in runtimes(&wasm, config)? {
            assert_eq!(runtime.invoke("grow", &[Value::I32(2)])?, vec![Value::I32(-1)]);
            assert_eq!(runtime.invoke("grow", &[Value::I32(1)])?, vec![Value::I32(1)]);
        }
        Ok(())
    }

    #[test]
    fn call_indirect() -> Result<()> {
        let wasm = wat::parse_file("src/fixtures/indirect.wat")?;
        for mut runtime in runtimes(&wasm, Config::default())? {
            let dispatch = |runtime: &mut Runtime, idx: i32| {
                runtime.invoke("dispatch", &[Value::I32(idx), Value::I32(5), Value::I32(3)])
            };
            assert_eq!(dispatch(&mut runtime, 0), Ok(vec![Value::I32(8)]));
            assert_eq!(dispatch(&mut runtime, 1), Ok(vec![Value::I32(2)]));
            assert_eq!(
                dispatch(&mut runtime, 2),
                Err(Trap::IndirectCallTypeMismatch)
            );
            assert_eq!(dispatch(&mut runtime, 3), Err(Trap::UndefinedElement));
            assert_eq!(dispatch(&mut runtime, 4), Err(Trap::UndefinedElement));
            assert_eq!(dispatch(&mut runtime, -1), Err(Trap::UndefinedElement));

            // same params, different result arity
            assert_eq!(
                runtime.invoke("no_result", &[Value::I32(0)]),
                Err(Trap::IndirectCallTypeMismatch)
            );
            // same arity, different param type
            assert_eq!(
                runtime.invoke("float_param", &[Value::I32(0)]),
                Err(Trap::IndirectCallTypeMismatch)
            );
        }
        Ok(())
    }

    #[test]
    fn branches_unwind_operands() -> Result<()> {
        let wasm = wat::parse_str(
            r#"
            (module
              (func (export "br") (result i32)
                (block (result i32)
                  (i32.const 1)
                  (i32.const 2)
                  (i32.const 3)
                  (br 0))
                (i32.const 10)
                i32.add)
              (func (export "br_if") (param i32) (result i32)
                (block (result i32)
                  (i32.const 7)
                  (i32.const 8)
                  (br_if 0 (local.get 0))
                  drop
                  drop
                  (i32.const 9))
                (i32.const 100)
                i32.add)
              (func (export "br_table") (param i32) (result i32)
                (block
                  (block
                    (block
                      (br_table 0 1 2 (local.get 0)))
                    (return (i32.const 10)))
                  (return (i32.const 20)))
                (i32.const 30))
              (func (export "nested_return") (result i32)
                (i32.const 1)
                (block
                  (loop
                    (i32.const 2)
                    (i32.const 42)
                    return))
                drop
                (i32.const 0))
            )
            "#,
        )?;
        for mut runtime in runtimes(&wasm, Config::default())? {
            assert_eq!(runtime.invoke("br", &[])?, vec![Value::I32(13)]);
            assert_eq!(
                runtime.invoke("br_if", &[Value::I32(1)])?,
                vec![Value::I32(108)]
            );
            assert_eq!(
                runtime.invoke("br_if", &[Value::I32(0)])?,
                vec![Value::I32(109)]
            );
            for (idx, want) in [(0, 10), (1, 20), (2, 30), (3, 30), (-1, 30)] {
                assert_eq!(
                    runtime.invoke("br_table", &[Value::I32(idx)])?,
                    vec![Value::I32(want)]
                );
            }
            assert_eq!(runtime.invoke("nested_return", &[])?, vec![Value::I32(42)]);
            assert!(runtime.stack.is_empty());
            assert!(runtime.call_stack.is_empty());
        }
        Ok(())
    }

    #[test]
    fn loops_and_locals() -> Result<()> {
        let wasm = wat::parse_file("src/fixtures/loop.wat")?;
        for mut runtime in runtimes(&wasm, Config::default())? {
            assert_eq!(runtime.invoke("sum", &[Value::I32(0)])?, vec![Value::I32(0)]);
            assert_eq!(
                runtime.invoke("sum", &[Value::I32(100)])?,
                vec![Value::I32(5050)]
            );
        }
        Ok(())
    }

    #[test]
    fn start_function_runs_once() -> Result<()> {
        let wasm = wat::parse_file("src/fixtures/start.wat")?;
        for mut runtime in runtimes(&wasm, Config::default())? {
            assert_eq!(runtime.global("counter"), Some(Value::I32(11)));
            assert_eq!(runtime.invoke("bump", &[])?, vec![Value::I32(12)]);
            assert_eq!(runtime.global("counter"), Some(Value::I32(12)));
            assert_eq!(runtime.global("bump"), None);
        }
        Ok(())
    }

    #[test]
    fn start_function_trap() -> Result<()> {
        let wasm = wat::parse_str("(module (start 0) (func unreachable))")?;
        let module = SharedModule::decode(&wasm)?;
        let result = Runtime::instantiate(&module, Imports::new());
        assert!(matches!(result, Err(LinkError::Start(Trap::Unreachable))));
        Ok(())
    }

    #[test]
    fn trap_keeps_earlier_writes() -> Result<()> {
        let wasm = wat::parse_str(
            r#"
            (module
              (memory 1)
              (global $g (export "g") (mut i32) (i32.const 0))
              (func (export "write_then_trap")
                (i32.store (i32.const 0) (i32.const 99))
                (global.set $g (i32.const 5))
                unreachable)
            )
            "#,
        )?;
        for mut runtime in runtimes(&wasm, Config::default())? {
            assert_eq!(runtime.invoke("write_then_trap", &[]), Err(Trap::Unreachable));
            assert_eq!(runtime.read_memory(0, 1)?, [99u8]);
            assert_eq!(runtime.global("g"), Some(Value::I32(5)));
        }
        Ok(())
    }

    #[test]
    fn fuel_runs_out() -> Result<()> {
        let wasm = wat::parse_file("src/fixtures/loop.wat")?;
        let config = Config::default().fuel(Some(1_000));
        for mut runtime in runtimes(&wasm, config)? {
            assert_eq!(runtime.invoke("spin", &[]), Err(Trap::OutOfFuel));
            assert_eq!(runtime.fuel(), Some(0));

            runtime.set_fuel(Some(200));
            assert_eq!(
                runtime.invoke("sum", &[Value::I32(10)])?,
                vec![Value::I32(55)]
            );
            assert_eq!(runtime.fuel(), Some(190));
        }
        Ok(())
    }

    #[test]
    fn call_depth_is_limited() -> Result<()> {
        let wasm = wat::parse_file("src/fixtures/loop.wat")?;
        let config = Config::default().max_call_depth(200);
        for mut runtime in runtimes(&wasm, config)? {
            assert_eq!(runtime.invoke("recurse", &[]), Err(Trap::CallStackExhausted));
            assert_eq!(runtime.trap_origin(), Some(2));
            // the instance is still usable
            assert_eq!(runtime.invoke("sum", &[Value::I32(3)])?, vec![Value::I32(6)]);
            assert_eq!(runtime.trap_origin(), None);
        }
        Ok(())
    }

    #[test]
    fn deep_recursion_traps_on_a_small_stack() -> Result<()> {
        let wasm = wat::parse_file("src/fixtures/loop.wat")?;
        let handle = std::thread::Builder::new()
            .stack_size(512 * 1024)
            .spawn(move || -> Result<()> {
                let config = Config::default().max_call_depth(100_000);
                for mut runtime in runtimes(&wasm, config)? {
                    assert_eq!(runtime.invoke("recurse", &[]), Err(Trap::CallStackExhausted));
                    assert_eq!(runtime.trap_origin(), Some(2));
                    assert!(runtime.compiled_frames.is_empty());
                    assert!(runtime.call_stack.is_empty());
                }
                Ok(())
            })?;
        handle
            .join()
            .map_err(|_| anyhow::anyhow!("thread panicked"))?
    }

    #[test]
    fn shared_module_across_threads() -> Result<()> {
        let wasm = wat::parse_file("src/fixtures/fib.wat")?;
        let module = SharedModule::decode(&wasm)?;

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let module = module.clone();
                std::thread::spawn(move || -> Result<Vec<Value>> {
                    let mut runtime = Runtime::instantiate(&module, Imports::new())?;
                    Ok(runtime.invoke("fib", &[Value::I32(15 + i)])?)
                })
            })
            .collect();

        let mut results = vec![];
        for handle in handles {
            let result = handle.join().map_err(|_| anyhow::anyhow!("thread panicked"))??;
            results.extend(result);
        }
        assert_eq!(
            results,
            vec![
                Value::I32(610),
                Value::I32(987),
                Value::I32(1597),
                Value::I32(2584)
            ]
        );
        assert_eq!(module.cache().compiled_count(), 1);
        Ok(())
    }

    #[test]
    fn instances_move_between_threads() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<Runtime>();
        assert_send::<SharedModule>();
        assert_sync::<SharedModule>();
    }

    #[test]
    fn interpreted_runs_compile_nothing() -> Result<()> {
        let wasm = wat::parse_file("src/fixtures/fib.wat")?;
        let module = SharedModule::decode(&wasm)?;
        let config = Config::default().compile(false);
        let mut runtime = Runtime::instantiate_with_config(&module, Imports::new(), config)?;
        assert_eq!(runtime.invoke("fib", &[Value::I32(10)])?, vec![Value::I32(55)]);
        assert_eq!(module.cache().compiled_count(), 0);
        Ok(())
    }

    #[test]
    fn compiled_matches_interpreted() -> Result<()> {
        let wasm = wat::parse_str(
            r#"
            (module
              (type $t (func (param i32) (result i32)))
              (memory 1)
              (table 8 funcref)
              (elem (i32.const 0) $sq $half)
              (data (i32.const 0) "\01\02\03\04\05\06\07\08")
              (func $sq (type $t) (i32.mul (local.get 0) (local.get 0)))
              (func $half (type $t) (i32.div_s (local.get 0) (i32.const 2)))
              (func (export "mix") (param $a i32) (param $b i32) (param $f f64) (result i32)
                (local $acc i32)
                (local.set $acc (i32.div_s (local.get $a) (local.get $b)))
                (local.set $acc
                  (i32.add (local.get $acc) (i32.trunc_f64_s (local.get $f))))
                (local.set $acc
                  (i32.xor
                    (local.get $acc)
                    (i32.load8_u (i32.and (local.get $b) (i32.const 0x1ffff)))))
                (call_indirect (type $t)
                  (local.get $acc)
                  (i32.and (local.get $a) (i32.const 7))))
            )
            "#,
        )?;
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut pair = runtimes(&wasm, Config::default())?;
        let (compiled, interpreted) = pair.split_at_mut(1);
        let (compiled, interpreted) = (&mut compiled[0], &mut interpreted[0]);

        for _ in 0..2_000 {
            let a = match rng.random_range(0..4) {
                0 => i32::MIN,
                1 => rng.random_range(-8..8),
                _ => rng.random(),
            };
            let b = match rng.random_range(0..4) {
                0 => 0,
                1 => -1,
                2 => rng.random_range(0..0x1ffff),
                _ => rng.random(),
            };
            let f = match rng.random_range(0..4) {
                0 => f64::NAN,
                1 => rng.random_range(-3e9..3e9),
                _ => rng.random_range(-1000.0..1000.0),
            };
            let args = [Value::I32(a), Value::I32(b), Value::F64(f)];
            let want = interpreted.invoke("mix", &args);
            let got = compiled.invoke("mix", &args);
            assert_eq!(got, want, "mix({a}, {b}, {f})");
            assert_eq!(compiled.trap_origin(), interpreted.trap_origin());
        }
        Ok(())
    }

    #[test]
    fn compiled_matches_interpreted_on_control_flow() -> Result<()> {
        let wasm = wat::parse_str(
            r#"
            (module
              (memory 1 8)
              (func (export "walk") (param $n i32) (param $sel i32) (result i32)
                (local $acc i32)
                (local.set $n (i32.and (local.get $n) (i32.const 63)))
                (block $done
                  (loop $next
                    (br_if $done (i32.eqz (local.get $n)))
                    (block $c
                      (block $b
                        (block $a
                          (br_table $a $b $c
                            (i32.and
                              (i32.add (local.get $sel) (local.get $n))
                              (i32.const 3))))
                        (local.set $acc (i32.add (local.get $acc) (local.get $n)))
                        (br $c))
                      (local.set $acc (i32.mul (local.get $acc) (i32.const 3))))
                    (local.set $acc (i32.xor (local.get $acc) (local.get $sel)))
                    (local.set $n (i32.sub (local.get $n) (i32.const 1)))
                    (br $next)))
                (local.get $acc))
              (func (export "grow") (param $delta i32) (param $addr i32) (result i32)
                (drop (memory.grow (i32.and (local.get $delta) (i32.const 3))))
                (i32.add (memory.size) (i32.load8_u (local.get $addr))))
              (func $down (param $n i32) (param $d i32) (result i32)
                (if (result i32) (i32.eqz (local.get $n))
                  (then (i32.div_s (i32.const 100) (local.get $d)))
                  (else
                    (i32.add
                      (call $down (i32.sub (local.get $n) (i32.const 1)) (local.get $d))
                      (i32.const 1)))))
              (func (export "descend") (param $n i32) (param $d i32) (result i32)
                (call $down (i32.and (local.get $n) (i32.const 127)) (local.get $d)))
            )
            "#,
        )?;
        let config = Config::default().max_call_depth(100).fuel(Some(20_000));
        let mut rng = StdRng::seed_from_u64(0xc0de);
        let mut pair = runtimes(&wasm, config)?;
        let (compiled, interpreted) = pair.split_at_mut(1);
        let (compiled, interpreted) = (&mut compiled[0], &mut interpreted[0]);

        for _ in 0..1_500 {
            let (name, args) = match rng.random_range(0..3) {
                0 => ("walk", [rng.random::<i32>(), rng.random_range(-4..4)]),
                1 => (
                    "grow",
                    [rng.random_range(0..4), rng.random_range(0..8 * 65536 + 16)],
                ),
                _ => ("descend", [rng.random(), rng.random_range(-1..3)]),
            };
            let args = args.map(Value::I32);
            let want = interpreted.invoke(name, &args);
            let got = compiled.invoke(name, &args);
            assert_eq!(got, want, "{name}({args:?})");
            assert_eq!(compiled.trap_origin(), interpreted.trap_origin());
            assert_eq!(compiled.fuel(), interpreted.fuel());
        }
        assert_eq!(
            compiled.invoke("grow", &[Value::I32(0), Value::I32(0)])?,
            interpreted.invoke("grow", &[Value::I32(0), Value::I32(0)])?
        );
        Ok(())
    }
}
