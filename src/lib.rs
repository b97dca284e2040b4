pub mod binary;
pub mod error;
pub mod execution;

pub use binary::{
    instruction::Instruction,
    module::{Module, decode},
};
pub use error::{DecodeError, LinkError, Trap};
pub use execution::{
    config::Config,
    import::{HostFunc, HostValue, Imports},
    runtime::{Runtime, SharedModule},
    value::Value,
};
