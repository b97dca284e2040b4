//! Translates a function body into a chain of closures, one per
//! instruction, with immediates and operator functions bound up front.

use std::sync::{Arc, OnceLock};

use log::debug;

use super::{
    control::{Branch, Label, LabelKind, branch, end_block},
    ops,
    store::Store,
    value::{StackExt, Value, assign},
};
use crate::{
    binary::{instruction::Instruction, module::Module},
    error::Trap,
};

/// State a compiled instruction runs against.
pub struct Context<'a> {
    pub stack: &'a mut Vec<Value>,
    pub locals: &'a mut [Value],
    pub labels: &'a mut Vec<Label>,
    pub store: &'a mut Store,
}

/// What the driver does after an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Next,
    Jump(usize),
    Call(u32),
    Return,
}

pub type CompiledOp = Box<dyn Fn(&mut Context<'_>) -> Result<Flow, Trap> + Send + Sync>;

pub struct CompiledFunction {
    pub ops: Vec<CompiledOp>,
}

/// Compiled functions of one module, indexed by defined-function index.
/// Slots fill on first call and are shared by every instance.
pub struct CodeCache {
    slots: Vec<OnceLock<Arc<CompiledFunction>>>,
}

impl CodeCache {
    pub fn new(module: &Module) -> Self {
        Self {
            slots: module.functions.iter().map(|_| OnceLock::new()).collect(),
        }
    }

    pub fn get_or_compile(&self, module: &Module, def_idx: u32) -> Arc<CompiledFunction> {
        match self.slots.get(def_idx as usize) {
            Some(slot) => Arc::clone(slot.get_or_init(|| Arc::new(compile(module, def_idx)))),
            None => Arc::new(compile(module, def_idx)),
        }
    }

    pub fn compiled_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.get().is_some()).count()
    }
}

pub fn compile(module: &Module, def_idx: u32) -> CompiledFunction {
    let ops = module
        .functions
        .get(def_idx as usize)
        .map(|func| {
            func.body
                .iter()
                .enumerate()
                .map(|(pc, inst)| compile_instruction(module, pc, inst))
                .collect()
        })
        .unwrap_or_default();
    debug!("compiled function {}", def_idx);
    CompiledFunction { ops }
}

fn take_branch(ctx: &mut Context<'_>, depth: u32) -> Result<Flow, Trap> {
    Ok(match branch(ctx.labels, ctx.stack, depth)? {
        Branch::Jump(pc) => Flow::Jump(pc),
        Branch::Loop(pc) => {
            ctx.store.consume_fuel()?;
            Flow::Jump(pc)
        }
        Branch::Return => Flow::Return,
    })
}

macro_rules! unary {
    ($pop:ident, $variant:ident, $f:expr) => {{
        let f = $f;
        Box::new(move |ctx: &mut Context<'_>| {
            let a = ctx.stack.$pop()?;
            ctx.stack.push(Value::$variant(f(a)));
            Ok(Flow::Next)
        })
    }};
}

macro_rules! binary {
    ($pop:ident, $variant:ident, $f:expr) => {{
        let f = $f;
        Box::new(move |ctx: &mut Context<'_>| {
            let b = ctx.stack.$pop()?;
            let a = ctx.stack.$pop()?;
            ctx.stack.push(Value::$variant(f(a, b)));
            Ok(Flow::Next)
        })
    }};
}

macro_rules! checked_binary {
    ($pop:ident, $variant:ident, $f:expr) => {{
        let f = $f;
        Box::new(move |ctx: &mut Context<'_>| {
            let b = ctx.stack.$pop()?;
            let a = ctx.stack.$pop()?;
            ctx.stack.push(Value::$variant(f(a, b)?));
            Ok(Flow::Next)
        })
    }};
}

macro_rules! compare {
    ($pop:ident, $f:expr) => {{
        let f = $f;
        Box::new(move |ctx: &mut Context<'_>| {
            let b = ctx.stack.$pop()?;
            let a = ctx.stack.$pop()?;
            ctx.stack.push(f(a, b).into());
            Ok(Flow::Next)
        })
    }};
}

fn push(value: Value) -> CompiledOp {
    Box::new(move |ctx| {
        ctx.stack.push(value);
        Ok(Flow::Next)
    })
}

fn compile_instruction(module: &Module, pc: usize, inst: &Instruction) -> CompiledOp {
    match inst {
        Instruction::Unreachable => Box::new(|_| Err(Trap::Unreachable)),
        Instruction::Nop => Box::new(|_| Ok(Flow::Next)),
        Instruction::Block { ty, end } => {
            let arity = module.block_arity(*ty);
            let cont = end + 1;
            Box::new(move |ctx| {
                let label = Label::enter(LabelKind::Block, cont, ctx.stack, arity)?;
                ctx.labels.push(label);
                Ok(Flow::Next)
            })
        }
        Instruction::Loop { ty } => {
            let arity = module.block_arity(*ty);
            Box::new(move |ctx| {
                let label = Label::enter(LabelKind::Loop, pc, ctx.stack, arity)?;
                ctx.labels.push(label);
                Ok(Flow::Next)
            })
        }
        Instruction::If { ty, else_at, end } => {
            let arity = module.block_arity(*ty);
            let cont = end + 1;
            let on_false = else_at.map_or(*end, |at| at + 1);
            Box::new(move |ctx| {
                let cond = ctx.stack.pop_i32()?;
                let label = Label::enter(LabelKind::If, cont, ctx.stack, arity)?;
                ctx.labels.push(label);
                Ok(if cond != 0 {
                    Flow::Next
                } else {
                    Flow::Jump(on_false)
                })
            })
        }
        Instruction::Else { end } => {
            let end = *end;
            Box::new(move |_| Ok(Flow::Jump(end)))
        }
        Instruction::End => Box::new(|ctx| {
            Ok(if end_block(ctx.labels, ctx.stack)? {
                Flow::Next
            } else {
                Flow::Return
            })
        }),
        Instruction::Br(depth) => {
            let depth = *depth;
            Box::new(move |ctx| take_branch(ctx, depth))
        }
        Instruction::BrIf(depth) => {
            let depth = *depth;
            Box::new(move |ctx| {
                if ctx.stack.pop_i32()? != 0 {
                    take_branch(ctx, depth)
                } else {
                    Ok(Flow::Next)
                }
            })
        }
        Instruction::BrTable { targets, default } => {
            let targets = targets.clone();
            let default = *default;
            Box::new(move |ctx| {
                let idx = ctx.stack.pop_i32()? as u32 as usize;
                let depth = targets.get(idx).copied().unwrap_or(default);
                take_branch(ctx, depth)
            })
        }
        Instruction::Return => Box::new(|_| Ok(Flow::Return)),
        Instruction::Call(func_idx) => {
            let func_idx = *func_idx;
            Box::new(move |_| Ok(Flow::Call(func_idx)))
        }
        Instruction::CallIndirect {
            type_idx,
            table_idx,
        } => {
            let ty = module
                .types
                .get(*type_idx as usize)
                .cloned()
                .unwrap_or_default();
            let table_idx = *table_idx;
            Box::new(move |ctx| {
                let elem = ctx.stack.pop_i32()?;
                let func_idx = ctx.store.resolve_indirect(table_idx, elem, &ty)?;
                Ok(Flow::Call(func_idx))
            })
        }
        Instruction::Drop => Box::new(|ctx| {
            ctx.stack.pop_value()?;
            Ok(Flow::Next)
        }),
        Instruction::Select => Box::new(|ctx| {
            let cond = ctx.stack.pop_i32()?;
            let b = ctx.stack.pop_value()?;
            let a = ctx.stack.pop_value()?;
            ctx.stack.push(ops::select(cond, a, b)?);
            Ok(Flow::Next)
        }),
        Instruction::LocalGet(idx) => {
            let idx = *idx as usize;
            Box::new(move |ctx| {
                ctx.stack.push(ctx.locals[idx]);
                Ok(Flow::Next)
            })
        }
        Instruction::LocalSet(idx) => {
            let idx = *idx as usize;
            Box::new(move |ctx| {
                let value = ctx.stack.pop_value()?;
                assign(&mut ctx.locals[idx], value)?;
                Ok(Flow::Next)
            })
        }
        Instruction::LocalTee(idx) => {
            let idx = *idx as usize;
            Box::new(move |ctx| {
                let value = *ctx.stack.last().ok_or(Trap::StackUnderflow)?;
                assign(&mut ctx.locals[idx], value)?;
                Ok(Flow::Next)
            })
        }
        Instruction::GlobalGet(idx) => {
            let idx = *idx as usize;
            Box::new(move |ctx| {
                ctx.stack.push(ctx.store.globals[idx].value);
                Ok(Flow::Next)
            })
        }
        Instruction::GlobalSet(idx) => {
            let idx = *idx as usize;
            Box::new(move |ctx| {
                let value = ctx.stack.pop_value()?;
                assign(&mut ctx.store.globals[idx].value, value)?;
                Ok(Flow::Next)
            })
        }
        Instruction::Load(kind, memarg) => {
            let load = ops::loader(*kind);
            let offset = memarg.offset;
            Box::new(move |ctx| {
                let addr = ctx.stack.pop_i32()?;
                let memory = ctx.store.memory().ok_or(Trap::MemoryOutOfBounds)?;
                let value = load(&memory.data, ops::effective_address(addr, offset))?;
                ctx.stack.push(value);
                Ok(Flow::Next)
            })
        }
        Instruction::Store(kind, memarg) => {
            let store = ops::storer(*kind);
            let offset = memarg.offset;
            Box::new(move |ctx| {
                let value = ctx.stack.pop_value()?;
                let addr = ctx.stack.pop_i32()?;
                let memory = ctx.store.memory_mut().ok_or(Trap::MemoryOutOfBounds)?;
                store(&mut memory.data, ops::effective_address(addr, offset), value)?;
                Ok(Flow::Next)
            })
        }
        Instruction::MemorySize => Box::new(|ctx| {
            let size = ctx.store.memory().map_or(0, |memory| memory.size());
            ctx.stack.push(Value::I32(size as i32));
            Ok(Flow::Next)
        }),
        Instruction::MemoryGrow => Box::new(|ctx| {
            let delta = ctx.stack.pop_i32()?;
            let old = ctx.store.memory_grow(delta);
            ctx.stack.push(Value::I32(old));
            Ok(Flow::Next)
        }),
        Instruction::I32Const(v) => push(Value::I32(*v)),
        Instruction::I64Const(v) => push(Value::I64(*v)),
        Instruction::F32Const(v) => push(Value::F32(*v)),
        Instruction::F64Const(v) => push(Value::F64(*v)),
        Instruction::I32Eqz => Box::new(|ctx| {
            let a = ctx.stack.pop_i32()?;
            ctx.stack.push((a == 0).into());
            Ok(Flow::Next)
        }),
        Instruction::I64Eqz => Box::new(|ctx| {
            let a = ctx.stack.pop_i64()?;
            ctx.stack.push((a == 0).into());
            Ok(Flow::Next)
        }),
        Instruction::I32Compare(op) => compare!(pop_i32, ops::i32_compare(*op)),
        Instruction::I64Compare(op) => compare!(pop_i64, ops::i64_compare(*op)),
        Instruction::F32Compare(op) => compare!(pop_f32, ops::float_compare::<f32>(*op)),
        Instruction::F64Compare(op) => compare!(pop_f64, ops::float_compare::<f64>(*op)),
        Instruction::I32Unary(op) => unary!(pop_i32, I32, ops::i32_unary(*op)),
        Instruction::I64Unary(op) => unary!(pop_i64, I64, ops::i64_unary(*op)),
        Instruction::F32Unary(op) => unary!(pop_f32, F32, ops::float_unary::<f32>(*op)),
        Instruction::F64Unary(op) => unary!(pop_f64, F64, ops::float_unary::<f64>(*op)),
        Instruction::I32Binary(op) => checked_binary!(pop_i32, I32, ops::i32_binary(*op)),
        Instruction::I64Binary(op) => checked_binary!(pop_i64, I64, ops::i64_binary(*op)),
        Instruction::F32Binary(op) => binary!(pop_f32, F32, ops::float_binary::<f32>(*op)),
        Instruction::F64Binary(op) => binary!(pop_f64, F64, ops::float_binary::<f64>(*op)),
        Instruction::Convert(op) => {
            let convert = ops::conversion(*op);
            Box::new(move |ctx| {
                let value = ctx.stack.pop_value()?;
                ctx.stack.push(convert(value)?);
                Ok(Flow::Next)
            })
        }
    }
}
