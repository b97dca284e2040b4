pub mod cursor;
pub mod instruction;
pub mod module;
pub mod opcode;
pub mod section;
pub mod types;
pub mod validate;

pub use module::{Module, decode};
