pub mod compiler;
pub mod config;
pub mod control;
pub mod host;
pub mod import;
pub mod ops;
pub mod runtime;
pub mod store;
pub mod value;
