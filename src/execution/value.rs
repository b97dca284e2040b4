use std::fmt;

use crate::{binary::types::ValueType, error::Trap};

/// A typed operand. Floats compare by bit pattern, so a NaN equals itself
/// and `-0.0 != 0.0`.
#[derive(Debug, Clone, Copy)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl Value {
    pub fn default_for(ty: ValueType) -> Self {
        match ty {
            ValueType::I32 => Value::I32(0),
            ValueType::I64 => Value::I64(0),
            ValueType::F32 => Value::F32(0.0),
            ValueType::F64 => Value::F64(0.0),
        }
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            Value::I32(_) => ValueType::I32,
            Value::I64(_) => ValueType::I64,
            Value::F32(_) => ValueType::F32,
            Value::F64(_) => ValueType::F64,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::I32(a), Value::I32(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::F32(a), Value::F32(b)) => a.to_bits() == b.to_bits(),
            (Value::F64(a), Value::F64(b)) => a.to_bits() == b.to_bits(),
            _ => false,
        }
    }
}

impl Eq for Value {}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::I32(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}"),
            Value::F32(v) => write!(f, "{v}"),
            Value::F64(v) => write!(f, "{v}"),
        }
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::I32(value)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::I32(value as i32)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::I64(value)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::F32(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::F64(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::I32(if value { 1 } else { 0 })
    }
}

fn mismatch(expected: ValueType, found: &Value) -> Trap {
    Trap::TypeMismatch {
        expected,
        found: found.value_type(),
    }
}

/// Typed pops on the operand stack.
pub trait StackExt {
    fn pop_value(&mut self) -> Result<Value, Trap>;
    fn pop_i32(&mut self) -> Result<i32, Trap>;
    fn pop_i64(&mut self) -> Result<i64, Trap>;
    fn pop_f32(&mut self) -> Result<f32, Trap>;
    fn pop_f64(&mut self) -> Result<f64, Trap>;
}

impl StackExt for Vec<Value> {
    fn pop_value(&mut self) -> Result<Value, Trap> {
        self.pop().ok_or(Trap::StackUnderflow)
    }

    fn pop_i32(&mut self) -> Result<i32, Trap> {
        match self.pop_value()? {
            Value::I32(v) => Ok(v),
            other => Err(mismatch(ValueType::I32, &other)),
        }
    }

    fn pop_i64(&mut self) -> Result<i64, Trap> {
        match self.pop_value()? {
            Value::I64(v) => Ok(v),
            other => Err(mismatch(ValueType::I64, &other)),
        }
    }

    fn pop_f32(&mut self) -> Result<f32, Trap> {
        match self.pop_value()? {
            Value::F32(v) => Ok(v),
            other => Err(mismatch(ValueType::F32, &other)),
        }
    }

    fn pop_f64(&mut self) -> Result<f64, Trap> {
        match self.pop_value()? {
            Value::F64(v) => Ok(v),
            other => Err(mismatch(ValueType::F64, &other)),
        }
    }
}

/// Overwrites a local or global slot, keeping its type.
pub fn assign(slot: &mut Value, value: Value) -> Result<(), Trap> {
    if slot.value_type() != value.value_type() {
        return Err(mismatch(slot.value_type(), &value));
    }
    *slot = value;
    Ok(())
}

/// Checks that `values` match `types` one for one.
pub fn check_types(values: &[Value], types: &[ValueType]) -> bool {
    values.len() == types.len()
        && values
            .iter()
            .zip(types)
            .all(|(value, ty)| value.value_type() == *ty)
}
