//! Arena entities of the DWARF index
//!
//! Cross references between modules, functions and variables are integer
//! ids into the index arenas rather than shared pointers, so the whole
//! index stays immutable and freely shareable after construction.

use std::collections::HashMap;
use std::fmt;

/// Index of a module (compilation unit) in [`crate::DwarfIndex::modules`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(pub usize);

/// Index of a function in the index's function arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionId(pub usize);

/// Index of a variable in the index's variable arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VariableId(pub usize);

/// Index into the base-type table. `TypeId::UNKNOWN` is the sentinel slot
/// used when a DIE references a type offset the table does not hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeId(pub usize);

impl TypeId {
    pub const UNKNOWN: TypeId = TypeId(0);
}

/// A compilation unit: its PC range, file table, decoded line rows and the
/// functions and variables declared inside it.
#[derive(Debug)]
pub struct Module {
    pub name: String,
    pub start_address: u64,
    pub end_address: u64,
    /// Source files of this module, keyed by the DWARF file index used in
    /// line rows and declaration coordinates.
    pub files: HashMap<u64, String>,
    pub entries: Vec<LineRow>,
    pub functions: Vec<FunctionId>,
    pub variables: Vec<VariableId>,
}

/// One decoded row of a module's line program.
///
/// The row applies to each instruction from `address` up to (not
/// including) the next row's address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineRow {
    pub address: u64,
    /// Key into the owning module's `files` map.
    pub file: u64,
    /// Source line, already decremented by one to compensate for the
    /// sentinel line the MPI wrapper transform prepends to the source.
    pub line: i64,
    pub column: u64,
    pub prologue_end: bool,
    pub epilogue_begin: bool,
    /// Recommended breakpoint location.
    pub is_stmt: bool,
}

#[derive(Debug)]
pub struct Function {
    pub name: String,
    pub module: ModuleId,
    /// Key into the owning module's `files` map.
    pub file: u64,
    /// Declaration line, adjusted by -1 like [`LineRow::line`].
    pub decl_line: i64,
    pub decl_column: i64,
    pub low_pc: u64,
    pub high_pc: u64,
    pub parameters: Vec<Parameter>,
}

impl Function {
    /// Whether `pc` falls inside the function's `[low_pc, high_pc)` range.
    pub fn contains(&self, pc: u64) -> bool {
        pc >= self.low_pc && pc < self.high_pc
    }
}

#[derive(Debug)]
pub struct Parameter {
    pub name: String,
    pub base_type: TypeId,
    /// Raw DWARF location expression bytes.
    pub location: Vec<u8>,
}

#[derive(Debug)]
pub struct Variable {
    pub name: String,
    pub base_type: TypeId,
    /// Raw DWARF location expression bytes; absent when the DIE carries no
    /// location attribute (optimized out or extern declaration).
    pub location: Option<Vec<u8>>,
    /// The function the variable is declared in, if any.
    pub function: Option<FunctionId>,
}

#[derive(Debug, Clone)]
pub struct BaseType {
    pub name: String,
    pub byte_size: u64,
    pub encoding: gimli::DwAte,
}

impl BaseType {
    pub(crate) fn unknown() -> Self {
        BaseType {
            name: "unknown type".to_string(),
            byte_size: 0,
            encoding: crate::DW_ATE_void,
        }
    }
}

/// The MPI wrapper function set recognized in the index.
#[derive(Debug, Default)]
pub struct MpiData {
    /// Wrapper functions, with the leading sentinel `_` already stripped
    /// from their names.
    pub functions: Vec<FunctionId>,
    /// Source path of the wrapper file housing them.
    pub file: String,
}

impl fmt::Display for LineRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "entry{{address: {:#x}, file: {}, line: {}, col: {}, is_stmt: {}}}",
            self.address, self.file, self.line, self.column, self.is_stmt
        )
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{name: {}, start: {:#x}, end: {:#x}, params: {}}}",
            self.name,
            self.low_pc,
            self.high_pc,
            self.parameters.len()
        )
    }
}
