//! Automation rule compilation and the compiled binary record format.
//!
//! A user-authored rule document (trigger/condition/action tree, JSON) is
//! compiled once into fixed-layout records plus a shared string table, so
//! that matching an incoming event never parses JSON or allocates.
//!
//! # Modules
//!
//! - [`strtab`]: Append-only interned string pool
//! - [`records`]: Fixed-size trigger/condition/action records
//! - [`binfmt`]: Versioned little-endian serialization of a compiled rule
//! - [`compiler`]: Rule document validation and compilation

pub mod binfmt;
pub mod compiler;
pub mod records;
pub mod strtab;

pub use binfmt::{deserialize, serialize, FormatError};
pub use compiler::{compile, compile_str, CompileError};
pub use records::{
    ActionKind, ActionRecord, AutomationRecord, CompiledRule, CondOp, CondRecord, CondValue,
    EventKind, TriggerRecord, ACTION_FLAG_UNBIND,
};
pub use strtab::StringTable;
