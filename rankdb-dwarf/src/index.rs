//! The DWARF index and its source-level lookups

use crate::entities::*;
use crate::errors::{DwarfError, Result};
use crate::{mpi, parser};
use std::path::Path;
use tracing::{debug, info};

/// Immutable index over a target's DWARF debug information.
///
/// Built once at startup; every entity is stored in an arena and cross
/// referenced by id, so the index can be shared freely afterwards.
#[derive(Debug)]
pub struct DwarfIndex {
    pub modules: Vec<Module>,
    pub functions: Vec<Function>,
    pub variables: Vec<Variable>,
    pub types: Vec<BaseType>,
    pub mpi: MpiData,
}

impl DwarfIndex {
    /// Parse the target ELF's debug sections and build the index.
    ///
    /// This is the only fallible-at-startup entry point: a target without
    /// usable DWARF cannot be debugged at all, so errors here are fatal to
    /// the session.
    pub fn load(path: &Path) -> Result<DwarfIndex> {
        let output = parser::parse(path)?;
        let mut index = DwarfIndex {
            modules: output.modules,
            functions: output.functions,
            variables: output.variables,
            types: output.types,
            mpi: MpiData::default(),
        };
        index.mpi = mpi::resolve_mpi_debug_info(&mut index);
        info!(
            "indexed {}: {} modules, {} functions, {} variables, {} MPI wrapper functions",
            path.display(),
            index.modules.len(),
            index.functions.len(),
            index.variables.len(),
            index.mpi.functions.len()
        );
        Ok(index)
    }

    pub fn function(&self, id: FunctionId) -> &Function {
        &self.functions[id.0]
    }

    pub fn variable(&self, id: VariableId) -> &Variable {
        &self.variables[id.0]
    }

    pub fn base_type(&self, id: TypeId) -> &BaseType {
        &self.types[id.0]
    }

    pub fn module(&self, id: ModuleId) -> &Module {
        &self.modules[id.0]
    }

    /// First function with the given name, scanning modules in order.
    pub fn lookup_func(&self, name: &str) -> Option<(ModuleId, FunctionId)> {
        for (module_index, module) in self.modules.iter().enumerate() {
            for &fid in &module.functions {
                if self.functions[fid.0].name == name {
                    return Some((ModuleId(module_index), fid));
                }
            }
        }
        None
    }

    /// First variable with the given name, scanning modules in order.
    pub fn lookup_variable(&self, name: &str) -> Option<VariableId> {
        for module in &self.modules {
            for &vid in &module.variables {
                if self.variables[vid.0].name == name {
                    return Some(vid);
                }
            }
        }
        None
    }

    /// Line rows whose address falls inside the named function's PC range.
    pub fn entries_for_function(&self, name: &str) -> Result<Vec<&LineRow>> {
        let (module_id, fid) = self
            .lookup_func(name)
            .ok_or_else(|| DwarfError::FunctionNotFound(name.to_string()))?;
        let function = &self.functions[fid.0];
        Ok(self.modules[module_id.0]
            .entries
            .iter()
            .filter(|entry| function.contains(entry.address))
            .collect())
    }

    /// Resolve a `(file, line)` source coordinate to a breakpoint address.
    ///
    /// Only rows flagged `is_stmt` qualify; a line that is present in the
    /// table but never as a statement boundary is *not* a valid breakpoint
    /// location and reports [`DwarfError::NoAddressForLine`].
    pub fn line_to_pc(&self, file: &str, line: i64) -> Result<u64> {
        for module in &self.modules {
            if !module.files.values().any(|path| path == file) {
                continue;
            }
            for entry in &module.entries {
                if entry.line == line
                    && module.files.get(&entry.file).map(String::as_str) == Some(file)
                {
                    if entry.is_stmt {
                        return Ok(entry.address);
                    }
                    debug!("non-stmt row exists for {}:{}", file, line);
                }
            }
        }
        Err(DwarfError::NoAddressForLine {
            file: file.to_string(),
            line,
        })
    }

    /// Map a PC back to its source coordinate.
    ///
    /// Matches on exact row address only. Addresses interior to a row's
    /// span report [`DwarfError::NoLineForAddress`]; use
    /// [`Self::line_for_pc_near`] when an approximate answer is acceptable.
    pub fn pc_to_line(&self, pc: u64) -> Result<(i64, &str, Option<FunctionId>)> {
        for module in &self.modules {
            if pc < module.start_address || pc > module.end_address {
                continue;
            }
            for entry in &module.entries {
                if entry.address == pc {
                    let function = self.pc_to_function(pc);
                    let file = module
                        .files
                        .get(&entry.file)
                        .map(String::as_str)
                        .unwrap_or("<unknown>");
                    return Ok((entry.line, file, function));
                }
            }
        }
        Err(DwarfError::NoLineForAddress { address: pc })
    }

    /// Closest row at or before `pc`, for diagnostics only. Unlike
    /// [`Self::pc_to_line`] this widens the lookup to the row's span, so it
    /// must not be used to place breakpoints.
    pub fn line_for_pc_near(&self, pc: u64) -> Option<(i64, &str)> {
        let mut best: Option<(&LineRow, &Module)> = None;
        for module in &self.modules {
            if pc < module.start_address || pc > module.end_address {
                continue;
            }
            for entry in &module.entries {
                if entry.address <= pc && best.map_or(true, |(b, _)| entry.address > b.address) {
                    best = Some((entry, module));
                }
            }
        }
        best.map(|(entry, module)| {
            let file = module
                .files
                .get(&entry.file)
                .map(String::as_str)
                .unwrap_or("<unknown>");
            (entry.line, file)
        })
    }

    /// First function whose `[low_pc, high_pc)` range contains `pc`.
    pub fn pc_to_function(&self, pc: u64) -> Option<FunctionId> {
        for module in &self.modules {
            for &fid in &module.functions {
                if self.functions[fid.0].contains(pc) {
                    return Some(fid);
                }
            }
        }
        None
    }

    /// Source file of the function named `name` (used for the entry
    /// function to establish the session's source file).
    pub fn source_file_of(&self, name: &str) -> Result<&str> {
        let (module_id, fid) = self
            .lookup_func(name)
            .ok_or_else(|| DwarfError::FunctionNotFound(name.to_string()))?;
        let function = &self.functions[fid.0];
        Ok(self.modules[module_id.0]
            .files
            .get(&function.file)
            .map(String::as_str)
            .unwrap_or("<unknown>"))
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::collections::HashMap;

    /// A hand-built two-function index resembling what the parser produces
    /// for a small wrapper-transformed C program.
    pub(crate) fn sample_index() -> DwarfIndex {
        let files: HashMap<u64, String> = [
            (1, "/src/hello.c".to_string()),
            (2, "/src/mpi_wrap.h".to_string()),
        ]
        .into();

        let entries = vec![
            LineRow {
                address: 0x40_1000,
                file: 1,
                line: 3,
                column: 1,
                prologue_end: false,
                epilogue_begin: false,
                is_stmt: true,
            },
            LineRow {
                address: 0x40_1004,
                file: 1,
                line: 7,
                column: 5,
                prologue_end: true,
                epilogue_begin: false,
                is_stmt: true,
            },
            // Same line again, not a statement boundary.
            LineRow {
                address: 0x40_1008,
                file: 1,
                line: 7,
                column: 9,
                prologue_end: false,
                epilogue_begin: false,
                is_stmt: false,
            },
            // Line 9 exists only as a non-stmt row.
            LineRow {
                address: 0x40_100c,
                file: 1,
                line: 9,
                column: 5,
                prologue_end: false,
                epilogue_begin: false,
                is_stmt: false,
            },
            LineRow {
                address: 0x40_1020,
                file: 1,
                line: 12,
                column: 1,
                prologue_end: false,
                epilogue_begin: false,
                is_stmt: true,
            },
        ];

        let functions = vec![
            Function {
                name: "main".to_string(),
                module: ModuleId(0),
                file: 1,
                decl_line: 2,
                decl_column: 1,
                low_pc: 0x40_1000,
                high_pc: 0x40_1020,
                parameters: Vec::new(),
            },
            Function {
                name: "helper".to_string(),
                module: ModuleId(0),
                file: 1,
                decl_line: 11,
                decl_column: 1,
                low_pc: 0x40_1020,
                high_pc: 0x40_1040,
                parameters: Vec::new(),
            },
        ];

        let variables = vec![Variable {
            name: "counter".to_string(),
            base_type: TypeId(1),
            location: Some(vec![0x03, 0x00, 0x20, 0x60, 0x00, 0x00, 0x00, 0x00, 0x00]),
            function: None,
        }];

        let types = vec![
            BaseType::unknown(),
            BaseType {
                name: "int".to_string(),
                byte_size: 4,
                encoding: gimli::DW_ATE_signed,
            },
        ];

        let modules = vec![Module {
            name: "hello.c".to_string(),
            start_address: 0x40_1000,
            end_address: 0x40_1040,
            files,
            entries,
            functions: vec![FunctionId(0), FunctionId(1)],
            variables: vec![VariableId(0)],
        }];

        DwarfIndex {
            modules,
            functions,
            variables,
            types,
            mpi: MpiData::default(),
        }
    }
}
