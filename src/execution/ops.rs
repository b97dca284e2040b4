//! Operator semantics shared by the interpreter and the compiler. Each
//! selector returns a plain function pointer so both paths run the very same
//! code for an instruction.

use num_traits::Float;

use super::value::Value;
use crate::{
    binary::{
        instruction::{ConvertOp, FBinOp, FRelOp, FUnOp, IBinOp, IRelOp, IUnOp, LoadKind, StoreKind},
        types::ValueType,
    },
    error::Trap,
};

macro_rules! int_ops {
    ($binary:ident, $compare:ident, $unary:ident, $t:ty, $u:ty) => {
        pub fn $binary(op: IBinOp) -> fn($t, $t) -> Result<$t, Trap> {
            const BITS: u32 = <$t>::BITS;
            match op {
                IBinOp::Add => |a, b| Ok(a.wrapping_add(b)),
                IBinOp::Sub => |a, b| Ok(a.wrapping_sub(b)),
                IBinOp::Mul => |a, b| Ok(a.wrapping_mul(b)),
                IBinOp::DivS => |a, b| {
                    if b == 0 {
                        return Err(Trap::DivisionByZero);
                    }
                    if a == <$t>::MIN && b == -1 {
                        return Err(Trap::IntegerOverflow);
                    }
                    Ok(a / b)
                },
                IBinOp::DivU => |a, b| {
                    if b == 0 {
                        return Err(Trap::DivisionByZero);
                    }
                    Ok(((a as $u) / (b as $u)) as $t)
                },
                IBinOp::RemS => |a, b| {
                    if b == 0 {
                        return Err(Trap::DivisionByZero);
                    }
                    // MIN % -1 is 0, not an overflow
                    Ok(a.wrapping_rem(b))
                },
                IBinOp::RemU => |a, b| {
                    if b == 0 {
                        return Err(Trap::DivisionByZero);
                    }
                    Ok(((a as $u) % (b as $u)) as $t)
                },
                IBinOp::And => |a, b| Ok(a & b),
                IBinOp::Or => |a, b| Ok(a | b),
                IBinOp::Xor => |a, b| Ok(a ^ b),
                IBinOp::Shl => |a, b| Ok(a.wrapping_shl(b as u32)),
                IBinOp::ShrS => |a, b| Ok(a.wrapping_shr(b as u32)),
                IBinOp::ShrU => |a, b| Ok((a as $u).wrapping_shr(b as u32) as $t),
                IBinOp::Rotl => |a, b| Ok(a.rotate_left(b as u32 % BITS)),
                IBinOp::Rotr => |a, b| Ok(a.rotate_right(b as u32 % BITS)),
            }
        }

        pub fn $compare(op: IRelOp) -> fn($t, $t) -> bool {
            match op {
                IRelOp::Eq => |a, b| a == b,
                IRelOp::Ne => |a, b| a != b,
                IRelOp::LtS => |a, b| a < b,
                IRelOp::LtU => |a, b| (a as $u) < (b as $u),
                IRelOp::GtS => |a, b| a > b,
                IRelOp::GtU => |a, b| (a as $u) > (b as $u),
                IRelOp::LeS => |a, b| a <= b,
                IRelOp::LeU => |a, b| (a as $u) <= (b as $u),
                IRelOp::GeS => |a, b| a >= b,
                IRelOp::GeU => |a, b| (a as $u) >= (b as $u),
            }
        }

        pub fn $unary(op: IUnOp) -> fn($t) -> $t {
            match op {
                IUnOp::Clz => |a| a.leading_zeros() as $t,
                IUnOp::Ctz => |a| a.trailing_zeros() as $t,
                IUnOp::Popcnt => |a| a.count_ones() as $t,
                IUnOp::Extend8S => |a| a as i8 as $t,
                IUnOp::Extend16S => |a| a as i16 as $t,
                IUnOp::Extend32S => |a| a as i32 as $t,
            }
        }
    };
}

int_ops!(i32_binary, i32_compare, i32_unary, i32, u32);
int_ops!(i64_binary, i64_compare, i64_unary, i64, u64);

pub fn float_compare<F: Float>(op: FRelOp) -> fn(F, F) -> bool {
    match op {
        FRelOp::Eq => |a, b| a == b,
        FRelOp::Ne => |a, b| a != b,
        FRelOp::Lt => |a, b| a < b,
        FRelOp::Gt => |a, b| a > b,
        FRelOp::Le => |a, b| a <= b,
        FRelOp::Ge => |a, b| a >= b,
    }
}

pub fn float_unary<F: Float>(op: FUnOp) -> fn(F) -> F {
    match op {
        FUnOp::Abs => |a| a.abs(),
        FUnOp::Neg => |a| -a,
        FUnOp::Ceil => |a| a.ceil(),
        FUnOp::Floor => |a| a.floor(),
        FUnOp::Trunc => |a| a.trunc(),
        FUnOp::Nearest => nearest,
        FUnOp::Sqrt => |a| a.sqrt(),
    }
}

pub fn float_binary<F: Float>(op: FBinOp) -> fn(F, F) -> F {
    match op {
        FBinOp::Add => |a, b| a + b,
        FBinOp::Sub => |a, b| a - b,
        FBinOp::Mul => |a, b| a * b,
        FBinOp::Div => |a, b| a / b,
        FBinOp::Min => min,
        FBinOp::Max => max,
        FBinOp::Copysign => |a, b| {
            if a.is_sign_negative() == b.is_sign_negative() {
                a
            } else {
                -a
            }
        },
    }
}

fn min<F: Float>(a: F, b: F) -> F {
    if a.is_nan() || b.is_nan() {
        return a + b;
    }
    if a == b {
        // -0 < +0
        return if a.is_sign_negative() { a } else { b };
    }
    if a < b { a } else { b }
}

fn max<F: Float>(a: F, b: F) -> F {
    if a.is_nan() || b.is_nan() {
        return a + b;
    }
    if a == b {
        return if a.is_sign_positive() { a } else { b };
    }
    if a > b { a } else { b }
}

/// Round to nearest, ties to even.
fn nearest<F: Float>(a: F) -> F {
    let two = F::one() + F::one();
    let half = F::one() / two;
    let trunc = a.trunc();
    if (a - trunc).abs() != half {
        return a.round();
    }
    if (trunc / two).trunc() * two == trunc {
        trunc
    } else {
        a.round()
    }
}

fn as_i32(value: Value) -> Result<i32, Trap> {
    match value {
        Value::I32(v) => Ok(v),
        other => Err(mismatch(ValueType::I32, other)),
    }
}

fn as_i64(value: Value) -> Result<i64, Trap> {
    match value {
        Value::I64(v) => Ok(v),
        other => Err(mismatch(ValueType::I64, other)),
    }
}

fn as_f32(value: Value) -> Result<f32, Trap> {
    match value {
        Value::F32(v) => Ok(v),
        other => Err(mismatch(ValueType::F32, other)),
    }
}

fn as_f64(value: Value) -> Result<f64, Trap> {
    match value {
        Value::F64(v) => Ok(v),
        other => Err(mismatch(ValueType::F64, other)),
    }
}

fn mismatch(expected: ValueType, found: Value) -> Trap {
    Trap::TypeMismatch {
        expected,
        found: found.value_type(),
    }
}

// Truncations check the range on the f64 widening, which is exact for f32.

fn trunc_i32(a: f64) -> Result<i32, Trap> {
    let t = a.trunc();
    if t >= -2147483648.0 && t < 2147483648.0 {
        Ok(t as i32)
    } else {
        Err(Trap::InvalidConversion)
    }
}

fn trunc_u32(a: f64) -> Result<i32, Trap> {
    let t = a.trunc();
    if t >= 0.0 && t < 4294967296.0 {
        Ok(t as u32 as i32)
    } else {
        Err(Trap::InvalidConversion)
    }
}

fn trunc_i64(a: f64) -> Result<i64, Trap> {
    let t = a.trunc();
    if t >= -9223372036854775808.0 && t < 9223372036854775808.0 {
        Ok(t as i64)
    } else {
        Err(Trap::InvalidConversion)
    }
}

fn trunc_u64(a: f64) -> Result<i64, Trap> {
    let t = a.trunc();
    if t >= 0.0 && t < 18446744073709551616.0 {
        Ok(t as u64 as i64)
    } else {
        Err(Trap::InvalidConversion)
    }
}

pub fn conversion(op: ConvertOp) -> fn(Value) -> Result<Value, Trap> {
    match op {
        ConvertOp::I32WrapI64 => |v| Ok(Value::I32(as_i64(v)? as i32)),
        ConvertOp::I32TruncF32S => |v| Ok(Value::I32(trunc_i32(as_f32(v)? as f64)?)),
        ConvertOp::I32TruncF32U => |v| Ok(Value::I32(trunc_u32(as_f32(v)? as f64)?)),
        ConvertOp::I32TruncF64S => |v| Ok(Value::I32(trunc_i32(as_f64(v)?)?)),
        ConvertOp::I32TruncF64U => |v| Ok(Value::I32(trunc_u32(as_f64(v)?)?)),
        ConvertOp::I64ExtendI32S => |v| Ok(Value::I64(as_i32(v)? as i64)),
        ConvertOp::I64ExtendI32U => |v| Ok(Value::I64(as_i32(v)? as u32 as i64)),
        ConvertOp::I64TruncF32S => |v| Ok(Value::I64(trunc_i64(as_f32(v)? as f64)?)),
        ConvertOp::I64TruncF32U => |v| Ok(Value::I64(trunc_u64(as_f32(v)? as f64)?)),
        ConvertOp::I64TruncF64S => |v| Ok(Value::I64(trunc_i64(as_f64(v)?)?)),
        ConvertOp::I64TruncF64U => |v| Ok(Value::I64(trunc_u64(as_f64(v)?)?)),
        ConvertOp::F32ConvertI32S => |v| Ok(Value::F32(as_i32(v)? as f32)),
        ConvertOp::F32ConvertI32U => |v| Ok(Value::F32(as_i32(v)? as u32 as f32)),
        ConvertOp::F32ConvertI64S => |v| Ok(Value::F32(as_i64(v)? as f32)),
        ConvertOp::F32ConvertI64U => |v| Ok(Value::F32(as_i64(v)? as u64 as f32)),
        ConvertOp::F32DemoteF64 => |v| Ok(Value::F32(as_f64(v)? as f32)),
        ConvertOp::F64ConvertI32S => |v| Ok(Value::F64(as_i32(v)? as f64)),
        ConvertOp::F64ConvertI32U => |v| Ok(Value::F64(as_i32(v)? as u32 as f64)),
        ConvertOp::F64ConvertI64S => |v| Ok(Value::F64(as_i64(v)? as f64)),
        ConvertOp::F64ConvertI64U => |v| Ok(Value::F64(as_i64(v)? as u64 as f64)),
        ConvertOp::F64PromoteF32 => |v| Ok(Value::F64(as_f32(v)? as f64)),
        ConvertOp::I32ReinterpretF32 => |v| Ok(Value::I32(as_f32(v)?.to_bits() as i32)),
        ConvertOp::I64ReinterpretF64 => |v| Ok(Value::I64(as_f64(v)?.to_bits() as i64)),
        ConvertOp::F32ReinterpretI32 => |v| Ok(Value::F32(f32::from_bits(as_i32(v)? as u32))),
        ConvertOp::F64ReinterpretI64 => |v| Ok(Value::F64(f64::from_bits(as_i64(v)? as u64))),
    }
}

/// `select`: `a` when `cond` is non-zero. Both operands must share a type.
pub fn select(cond: i32, a: Value, b: Value) -> Result<Value, Trap> {
    if a.value_type() != b.value_type() {
        return Err(mismatch(a.value_type(), b));
    }
    Ok(if cond != 0 { a } else { b })
}

/// Effective address of an access; computed in 64 bits so it never wraps.
pub fn effective_address(base: i32, offset: u32) -> u64 {
    base as u32 as u64 + offset as u64
}

fn read<const N: usize>(memory: &[u8], ea: u64) -> Result<[u8; N], Trap> {
    let end = ea + N as u64;
    if end > memory.len() as u64 {
        return Err(Trap::MemoryOutOfBounds);
    }
    let mut bytes = [0; N];
    bytes.copy_from_slice(&memory[ea as usize..end as usize]);
    Ok(bytes)
}

fn write<const N: usize>(memory: &mut [u8], ea: u64, bytes: [u8; N]) -> Result<(), Trap> {
    let end = ea + N as u64;
    if end > memory.len() as u64 {
        return Err(Trap::MemoryOutOfBounds);
    }
    memory[ea as usize..end as usize].copy_from_slice(&bytes);
    Ok(())
}

pub type Loader = fn(&[u8], u64) -> Result<Value, Trap>;
pub type Storer = fn(&mut [u8], u64, Value) -> Result<(), Trap>;

pub fn loader(kind: LoadKind) -> Loader {
    match kind {
        LoadKind::I32 => |m, ea| Ok(Value::I32(i32::from_le_bytes(read(m, ea)?))),
        LoadKind::I64 => |m, ea| Ok(Value::I64(i64::from_le_bytes(read(m, ea)?))),
        LoadKind::F32 => |m, ea| Ok(Value::F32(f32::from_le_bytes(read(m, ea)?))),
        LoadKind::F64 => |m, ea| Ok(Value::F64(f64::from_le_bytes(read(m, ea)?))),
        LoadKind::I32S8 => |m, ea| Ok(Value::I32(i8::from_le_bytes(read(m, ea)?) as i32)),
        LoadKind::I32U8 => |m, ea| Ok(Value::I32(u8::from_le_bytes(read(m, ea)?) as i32)),
        LoadKind::I32S16 => |m, ea| Ok(Value::I32(i16::from_le_bytes(read(m, ea)?) as i32)),
        LoadKind::I32U16 => |m, ea| Ok(Value::I32(u16::from_le_bytes(read(m, ea)?) as i32)),
        LoadKind::I64S8 => |m, ea| Ok(Value::I64(i8::from_le_bytes(read(m, ea)?) as i64)),
        LoadKind::I64U8 => |m, ea| Ok(Value::I64(u8::from_le_bytes(read(m, ea)?) as i64)),
        LoadKind::I64S16 => |m, ea| Ok(Value::I64(i16::from_le_bytes(read(m, ea)?) as i64)),
        LoadKind::I64U16 => |m, ea| Ok(Value::I64(u16::from_le_bytes(read(m, ea)?) as i64)),
        LoadKind::I64S32 => |m, ea| Ok(Value::I64(i32::from_le_bytes(read(m, ea)?) as i64)),
        LoadKind::I64U32 => |m, ea| Ok(Value::I64(u32::from_le_bytes(read(m, ea)?) as i64)),
    }
}

pub fn storer(kind: StoreKind) -> Storer {
    match kind {
        StoreKind::I32 => |m, ea, v| write(m, ea, as_i32(v)?.to_le_bytes()),
        StoreKind::I64 => |m, ea, v| write(m, ea, as_i64(v)?.to_le_bytes()),
        StoreKind::F32 => |m, ea, v| write(m, ea, as_f32(v)?.to_le_bytes()),
        StoreKind::F64 => |m, ea, v| write(m, ea, as_f64(v)?.to_le_bytes()),
        StoreKind::I32N8 => |m, ea, v| write(m, ea, (as_i32(v)? as u8).to_le_bytes()),
        StoreKind::I32N16 => |m, ea, v| write(m, ea, (as_i32(v)? as u16).to_le_bytes()),
        StoreKind::I64N8 => |m, ea, v| write(m, ea, (as_i64(v)? as u8).to_le_bytes()),
        StoreKind::I64N16 => |m, ea, v| write(m, ea, (as_i64(v)? as u16).to_le_bytes()),
        StoreKind::I64N32 => |m, ea, v| write(m, ea, (as_i64(v)? as u32).to_le_bytes()),
    }
}
