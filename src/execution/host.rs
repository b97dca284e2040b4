//! Conveniences for hosts driving C-style guests: string reads over linear
//! memory and allocation through the guest's own `malloc`/`free` and stack
//! exports.

use super::{runtime::Runtime, value::Value};
use crate::{binary::types::ValueType, error::Trap};

impl Runtime {
    /// Calls an export expected to return a single i32.
    fn invoke_i32(&mut self, name: &str, args: &[Value]) -> Result<i32, Trap> {
        let results = self.invoke(name, args)?;
        match results[..] {
            [Value::I32(v)] => Ok(v),
            [other] => Err(Trap::TypeMismatch {
                expected: ValueType::I32,
                found: other.value_type(),
            }),
            _ => Err(Trap::ArgumentMismatch(name.to_string())),
        }
    }

    pub fn alloc(&mut self, size: u32) -> Result<u32, Trap> {
        self.invoke_i32("malloc", &[Value::from(size)])
            .map(|ptr| ptr as u32)
    }

    /// Allocates room for `bytes` with the guest's `malloc` and copies them in.
    pub fn alloc_and_write(&mut self, bytes: &[u8]) -> Result<u32, Trap> {
        let ptr = self.alloc(bytes.len() as u32)?;
        self.write_memory(ptr as usize, bytes)?;
        Ok(ptr)
    }

    pub fn free(&mut self, ptr: u32) -> Result<(), Trap> {
        self.invoke("free", &[Value::from(ptr)])?;
        Ok(())
    }

    pub fn stack_save(&mut self) -> Result<u32, Trap> {
        self.invoke_i32("stackSave", &[]).map(|ptr| ptr as u32)
    }

    pub fn stack_restore(&mut self, ptr: u32) -> Result<(), Trap> {
        self.invoke("stackRestore", &[Value::from(ptr)])?;
        Ok(())
    }

    pub fn stack_alloc(&mut self, size: u32) -> Result<u32, Trap> {
        self.invoke_i32("stackAlloc", &[Value::from(size)])
            .map(|ptr| ptr as u32)
    }

    pub fn stack_alloc_and_write(&mut self, bytes: &[u8]) -> Result<u32, Trap> {
        let ptr = self.stack_alloc(bytes.len() as u32)?;
        self.write_memory(ptr as usize, bytes)?;
        Ok(ptr)
    }

    /// Bytes before the NUL at `ptr`. A string running off the end of memory
    /// is out of bounds.
    pub fn strlen(&self, ptr: u32) -> Result<usize, Trap> {
        let memory = self.store.memory().ok_or(Trap::MemoryOutOfBounds)?;
        memory
            .data
            .get(ptr as usize..)
            .and_then(|tail| tail.iter().position(|byte| *byte == 0))
            .ok_or(Trap::MemoryOutOfBounds)
    }

    /// UTF-16 code units before the 16-bit NUL at `ptr`.
    pub fn strlen16(&self, ptr: u32) -> Result<usize, Trap> {
        let memory = self.store.memory().ok_or(Trap::MemoryOutOfBounds)?;
        memory
            .data
            .get(ptr as usize..)
            .and_then(|tail| tail.chunks_exact(2).position(|unit| unit == [0u8, 0]))
            .ok_or(Trap::MemoryOutOfBounds)
    }

    /// NUL-terminated string at `ptr`, decoded lossily. A null pointer
    /// reads as `None`.
    pub fn read_cstr(&self, ptr: u32) -> Result<Option<String>, Trap> {
        if ptr == 0 {
            return Ok(None);
        }
        let len = self.strlen(ptr)?;
        let bytes = self.read_memory(ptr as usize, len)?;
        Ok(Some(String::from_utf8_lossy(bytes).into_owned()))
    }

    pub fn read_cstr16(&self, ptr: u32) -> Result<Option<String>, Trap> {
        if ptr == 0 {
            return Ok(None);
        }
        let len = self.strlen16(ptr)?;
        let units: Vec<u16> = self
            .read_memory(ptr as usize, len * 2)?
            .chunks_exact(2)
            .map(|unit| u16::from_le_bytes([unit[0], unit[1]]))
            .collect();
        Ok(Some(String::from_utf16_lossy(&units)))
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        error::Trap,
        execution::{
            import::Imports,
            runtime::{Runtime, SharedModule},
            value::Value,
        },
    };
    use anyhow::Result;
    use pretty_assertions::assert_eq;

    fn alloc_runtime() -> Result<Runtime> {
        let wasm = wat::parse_file("src/fixtures/alloc.wat")?;
        Runtime::load(wasm)
    }

    #[test]
    fn malloc_and_free() -> Result<()> {
        let mut runtime = alloc_runtime()?;
        assert_eq!(runtime.alloc(10)?, 1024);
        let ptr = runtime.alloc_and_write(b"abc")?;
        assert_eq!(ptr, 1034);
        assert_eq!(runtime.read_memory(1034, 3)?, b"abc");
        assert_eq!(runtime.alloc(1)?, 1037);

        runtime.free(ptr)?;
        assert_eq!(runtime.global("freed"), Some(Value::I32(1034)));
        Ok(())
    }

    #[test]
    fn stack_allocation() -> Result<()> {
        let mut runtime = alloc_runtime()?;
        let saved = runtime.stack_save()?;
        assert_eq!(saved, 65536);

        let ptr = runtime.stack_alloc_and_write(b"xyz\0")?;
        assert_eq!(ptr, 65532);
        assert_eq!(runtime.read_cstr(ptr)?, Some("xyz".to_string()));
        assert_eq!(runtime.stack_alloc(4)?, 65528);

        runtime.stack_restore(saved)?;
        assert_eq!(runtime.stack_save()?, 65536);
        Ok(())
    }

    #[test]
    fn c_strings() -> Result<()> {
        let mut runtime = alloc_runtime()?;
        assert_eq!(runtime.strlen(16)?, 5);
        assert_eq!(runtime.read_cstr(16)?, Some("hello".to_string()));
        assert_eq!(runtime.strlen(21)?, 0);
        assert_eq!(runtime.read_cstr(0)?, None);

        assert_eq!(runtime.strlen16(32)?, 2);
        assert_eq!(runtime.read_cstr16(32)?, Some("hi".to_string()));

        // no terminator before the end of memory
        runtime.write_memory(65535, &[b'x'])?;
        assert_eq!(runtime.strlen(65535), Err(Trap::MemoryOutOfBounds));
        assert_eq!(runtime.read_cstr(65535), Err(Trap::MemoryOutOfBounds));
        assert_eq!(runtime.strlen(70000), Err(Trap::MemoryOutOfBounds));
        Ok(())
    }

    #[test]
    fn missing_allocator_export() -> Result<()> {
        let wasm = wat::parse_file("src/fixtures/memory.wat")?;
        let mut runtime = Runtime::load(wasm)?;
        assert_eq!(runtime.alloc(4), Err(Trap::ExportNotFound("malloc".into())));
        assert_eq!(runtime.free(4), Err(Trap::ExportNotFound("free".into())));
        Ok(())
    }

    #[test]
    fn invoke_through_table() -> Result<()> {
        let wasm = wat::parse_file("src/fixtures/indirect.wat")?;
        let module = SharedModule::decode(&wasm)?;
        let mut runtime = Runtime::instantiate(&module, Imports::new())?;

        let args = [Value::I32(5), Value::I32(3)];
        assert_eq!(runtime.invoke_indirect(0, &args)?, vec![Value::I32(8)]);
        assert_eq!(runtime.invoke_indirect(1, &args)?, vec![Value::I32(2)]);
        assert_eq!(
            runtime.invoke_indirect(2, &[Value::I32(7)])?,
            vec![Value::I32(-7)]
        );
        assert_eq!(
            runtime.invoke_indirect(2, &args),
            Err(Trap::ArgumentMismatch("table[2]".into()))
        );
        assert_eq!(runtime.invoke_indirect(3, &[]), Err(Trap::UndefinedElement));
        assert_eq!(runtime.invoke_indirect(9, &[]), Err(Trap::UndefinedElement));
        Ok(())
    }
}
