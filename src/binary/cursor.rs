use nom::{
    IResult,
    bytes::complete::take,
    number::complete::{le_f32, le_f64, le_u8, le_u32},
};
use nom_leb128::{leb128_i32, leb128_i64, leb128_u32, leb128_u64};

use crate::error::DecodeError;

pub type Result<T> = std::result::Result<T, DecodeError>;

/// Sequential reader over a byte slice. `base` is the absolute offset of
/// `data[0]` in the module, so nested cursors report file offsets.
#[derive(Debug, Clone, Copy)]
pub struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    base: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self::with_base(data, 0)
    }

    pub fn with_base(data: &'a [u8], base: usize) -> Self {
        Self { data, pos: 0, base }
    }

    pub fn offset(&self) -> usize {
        self.base + self.pos
    }

    pub fn end_offset(&self) -> usize {
        self.base + self.data.len()
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_eof(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    fn eof(&self) -> DecodeError {
        DecodeError::UnexpectedEof {
            offset: self.end_offset(),
        }
    }

    fn parse<T>(&mut self, parser: impl FnOnce(&'a [u8]) -> IResult<&'a [u8], T>) -> Option<T> {
        let rest = self.rest();
        let (remaining, value) = parser(rest).ok()?;
        self.pos += rest.len() - remaining.len();
        Some(value)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.parse(le_u8).ok_or_else(|| self.eof())
    }

    pub fn read_u32_le(&mut self) -> Result<u32> {
        self.parse(le_u32).ok_or_else(|| self.eof())
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.parse(take(n)).ok_or_else(|| self.eof())
    }

    /// Frames the next `n` bytes as a cursor of its own.
    pub fn sub_cursor(&mut self, n: usize) -> Result<Cursor<'a>> {
        let base = self.offset();
        let bytes = self.read_bytes(n)?;
        Ok(Cursor::with_base(bytes, base))
    }

    pub fn read_var_u32(&mut self) -> Result<u32> {
        self.read_leb(32, false, |input| leb128_u32(input))
    }

    pub fn read_var_u64(&mut self) -> Result<u64> {
        self.read_leb(64, false, |input| leb128_u64(input))
    }

    pub fn read_var_i32(&mut self) -> Result<i32> {
        self.read_leb(32, true, |input| leb128_i32(input))
    }

    pub fn read_var_i64(&mut self) -> Result<i64> {
        self.read_leb(64, true, |input| leb128_i64(input))
    }

    /// Signed 33-bit value, as used by block types.
    pub fn read_var_s33(&mut self) -> Result<i64> {
        self.read_leb(33, true, |input| leb128_i64(input))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        self.parse(le_f32).ok_or_else(|| self.eof())
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        self.parse(le_f64).ok_or_else(|| self.eof())
    }

    pub fn read_name(&mut self) -> Result<String> {
        let len = self.read_var_u32()? as usize;
        let offset = self.offset();
        let bytes = self.read_bytes(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidUtf8 { offset })
    }

    /// Checks the framing of a LEB128 value before handing it to the parser:
    /// at most `ceil(bits / 7)` bytes, and no payload bits in the final byte
    /// beyond the target width.
    fn read_leb<T>(
        &mut self,
        bits: u32,
        signed: bool,
        parser: impl FnOnce(&'a [u8]) -> IResult<&'a [u8], T>,
    ) -> Result<T> {
        let offset = self.offset();
        let max_len = bits.div_ceil(7) as usize;
        let rest = self.rest();

        let Some(len) = rest
            .iter()
            .take(max_len)
            .position(|byte| byte & 0x80 == 0)
            .map(|pos| pos + 1)
        else {
            return Err(if rest.len() < max_len {
                self.eof()
            } else {
                DecodeError::LebOverflow { offset }
            });
        };

        let used_bits = bits - 7 * (max_len as u32 - 1);
        if len == max_len && !final_byte_fits(rest[len - 1], used_bits, signed) {
            return Err(DecodeError::LebOverflow { offset });
        }

        self.parse(parser).ok_or(DecodeError::LebOverflow { offset })
    }
}

fn final_byte_fits(byte: u8, used_bits: u32, signed: bool) -> bool {
    let unused = 0x7F & !((1u8 << used_bits) - 1);
    let high = byte & unused;
    if !signed {
        return high == 0;
    }
    // unused bits must replicate the sign bit
    if byte & (1 << (used_bits - 1)) != 0 {
        high == unused
    } else {
        high == 0
    }
}
