//! DWARF index for the rankdb debugger
//!
//! Parses an ELF target's DWARF sections once at startup into an immutable
//! arena of modules, line rows, functions, variables and base types, and
//! answers the source-level lookups the rest of the debugger is built on
//! (line to PC, PC to line, PC to function).

pub mod entities;
pub mod errors;
pub mod evaluation;
pub mod index;
pub mod mpi;

pub(crate) mod parser;

pub use entities::{
    BaseType, Function, FunctionId, LineRow, Module, ModuleId, MpiData, Parameter, TypeId,
    Variable, VariableId,
};
pub use errors::{DwarfError, Result};
pub use evaluation::{
    dwarf_reg_name, evaluate, regnum, DwarfRegisters, EvalError, Location, Piece, PieceLocation,
    PTR_SIZE,
};
pub use index::DwarfIndex;
pub use mpi::MPI_SIGNATURE_FUNC;

// Re-export the gimli types that appear in the public API.
pub use gimli::{
    DwAte, DW_ATE_boolean, DW_ATE_float, DW_ATE_signed, DW_ATE_signed_char, DW_ATE_unsigned,
    DW_ATE_unsigned_char,
};

/// DWARF does not define a `DW_ATE_void` constant; an encoding value of 0 is
/// the conventional way producers represent "no encoding" / void.
pub const DW_ATE_void: DwAte = DwAte(0);
