//! Error types for the DWARF index

use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum DwarfError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("DWARF parsing error: {0}")]
    Gimli(#[from] gimli::Error),
    #[error("object file error: {0}")]
    Object(#[from] object::Error),
    #[error("no DWARF debug sections in {path}")]
    MissingDebugInfo { path: PathBuf },
    #[error("function not found: {0}")]
    FunctionNotFound(String),
    #[error("unable to find suitable instruction for line {line} in file {file}")]
    NoAddressForLine { file: String, line: i64 },
    #[error("unable to find instruction matching address {address:#x}")]
    NoLineForAddress { address: u64 },
    #[error("no function spans address {address:#x}")]
    NoFunctionForPc { address: u64 },
}

pub type Result<T> = std::result::Result<T, DwarfError>;
