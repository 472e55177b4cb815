//! Single-pass DWARF parser
//!
//! Walks every compilation unit's DIE tree once, keeping a current-module
//! and current-function cursor, and accumulates the arena the index is
//! built from. Type references are collected as raw `.debug_info` offsets
//! during the walk and resolved against the completed base-type table when
//! the index is finalized.

use crate::entities::*;
use crate::errors::{DwarfError, Result};
use gimli::{EndianSlice, RunTimeEndian};
use object::{Object, ObjectSection};
use std::borrow::Cow;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

type Slice<'a> = EndianSlice<'a, RunTimeEndian>;
type Dwarf<'a> = gimli::Dwarf<Slice<'a>>;
type Unit<'a> = gimli::Unit<Slice<'a>>;
type Die<'a, 'b> = gimli::DebuggingInformationEntry<'a, 'b, Slice<'a>>;

/// Everything `DwarfIndex::load` needs from the parse pass.
pub(crate) struct ParseOutput {
    pub modules: Vec<Module>,
    pub functions: Vec<Function>,
    pub variables: Vec<Variable>,
    pub types: Vec<BaseType>,
}

/// Accumulates arena entries during the DIE walk.
struct IndexBuilder {
    modules: Vec<Module>,
    functions: Vec<Function>,
    variables: Vec<Variable>,
    types: Vec<BaseType>,
    types_by_offset: HashMap<gimli::DebugInfoOffset, TypeId>,
    // (function id, parameter position, referenced type offset)
    param_fixups: Vec<(FunctionId, usize, gimli::DebugInfoOffset)>,
    var_fixups: Vec<(VariableId, gimli::DebugInfoOffset)>,
    current_module: Option<ModuleId>,
    current_function: Option<FunctionId>,
}

impl IndexBuilder {
    fn new() -> Self {
        IndexBuilder {
            modules: Vec::new(),
            functions: Vec::new(),
            variables: Vec::new(),
            // Slot 0 is the sentinel for unresolvable type references.
            types: vec![BaseType::unknown()],
            types_by_offset: HashMap::new(),
            param_fixups: Vec::new(),
            var_fixups: Vec::new(),
            current_module: None,
            current_function: None,
        }
    }

    /// Resolve the collected type references now that every base type has
    /// been seen; unknown offsets fall back to the sentinel slot.
    fn finalize(mut self) -> ParseOutput {
        for (fid, position, offset) in std::mem::take(&mut self.param_fixups) {
            let tid = self.resolve_type(offset);
            self.functions[fid.0].parameters[position].base_type = tid;
        }
        for (vid, offset) in std::mem::take(&mut self.var_fixups) {
            let tid = self.resolve_type(offset);
            self.variables[vid.0].base_type = tid;
        }
        ParseOutput {
            modules: self.modules,
            functions: self.functions,
            variables: self.variables,
            types: self.types,
        }
    }

    fn resolve_type(&self, offset: gimli::DebugInfoOffset) -> TypeId {
        match self.types_by_offset.get(&offset) {
            Some(tid) => *tid,
            None => {
                debug!(
                    "type reference {:#x} not in base type table, using sentinel",
                    offset.0
                );
                TypeId::UNKNOWN
            }
        }
    }
}

pub(crate) fn parse(path: &Path) -> Result<ParseOutput> {
    let data = std::fs::read(path)?;
    let object = object::File::parse(&*data)?;

    let endian = if object.is_little_endian() {
        RunTimeEndian::Little
    } else {
        RunTimeEndian::Big
    };

    let load_section = |id: gimli::SectionId| -> std::result::Result<Cow<[u8]>, gimli::Error> {
        Ok(object
            .section_by_name(id.name())
            .and_then(|section| section.uncompressed_data().ok())
            .unwrap_or(Cow::Borrowed(&[][..])))
    };
    let dwarf_sections = gimli::DwarfSections::load(load_section)?;
    let dwarf = dwarf_sections.borrow(|section| EndianSlice::new(section, endian));

    let mut builder = IndexBuilder::new();

    let mut units = dwarf.units();
    while let Some(header) = units.next()? {
        let unit = dwarf.unit(header)?;
        parse_unit(&dwarf, &unit, &mut builder)?;
    }

    if builder.modules.is_empty() {
        return Err(DwarfError::MissingDebugInfo {
            path: path.to_path_buf(),
        });
    }

    Ok(builder.finalize())
}

fn parse_unit(dwarf: &Dwarf<'_>, unit: &Unit<'_>, builder: &mut IndexBuilder) -> Result<()> {
    let mut cursor = unit.entries();
    while let Some((_, die)) = cursor.next_dfs()? {
        match die.tag() {
            gimli::DW_TAG_compile_unit => {
                let module = parse_module(dwarf, unit, die)?;
                debug!(
                    "module {} [{:#x}, {:#x}] with {} files, {} line rows",
                    module.name,
                    module.start_address,
                    module.end_address,
                    module.files.len(),
                    module.entries.len()
                );
                builder.modules.push(module);
                builder.current_module = Some(ModuleId(builder.modules.len() - 1));
                builder.current_function = None;
            }

            gimli::DW_TAG_base_type => {
                let base = parse_base_type(dwarf, unit, die)?;
                if let Some(offset) = die.offset().to_debug_info_offset(&unit.header) {
                    let tid = TypeId(builder.types.len());
                    builder.types.push(base);
                    builder.types_by_offset.insert(offset, tid);
                }
            }

            gimli::DW_TAG_subprogram => {
                let Some(module_id) = builder.current_module else {
                    continue;
                };
                match parse_function(dwarf, unit, die, module_id)? {
                    Some(function) => {
                        let fid = FunctionId(builder.functions.len());
                        builder.functions.push(function);
                        builder.modules[module_id.0].functions.push(fid);
                        builder.current_function = Some(fid);
                    }
                    None => {
                        // Declaration-only subprogram: make sure its
                        // children do not attach to the previous function.
                        builder.current_function = None;
                    }
                }
            }

            gimli::DW_TAG_formal_parameter => {
                let Some(fid) = builder.current_function else {
                    continue;
                };
                let Some(name) = attr_name(dwarf, unit, die)? else {
                    continue;
                };
                let location = location_bytes(die)?.unwrap_or_default();
                let position = builder.functions[fid.0].parameters.len();
                builder.functions[fid.0].parameters.push(Parameter {
                    name,
                    base_type: TypeId::UNKNOWN,
                    location,
                });
                if let Some(offset) = type_ref(unit, die)? {
                    builder.param_fixups.push((fid, position, offset));
                }
            }

            gimli::DW_TAG_variable => {
                let Some(module_id) = builder.current_module else {
                    continue;
                };
                let Some(name) = attr_name(dwarf, unit, die)? else {
                    continue;
                };
                let vid = VariableId(builder.variables.len());
                builder.variables.push(Variable {
                    name,
                    base_type: TypeId::UNKNOWN,
                    location: location_bytes(die)?,
                    function: builder.current_function,
                });
                builder.modules[module_id.0].variables.push(vid);
                if let Some(offset) = type_ref(unit, die)? {
                    builder.var_fixups.push((vid, offset));
                }
            }

            _ => {}
        }
    }
    Ok(())
}

fn parse_module(dwarf: &Dwarf<'_>, unit: &Unit<'_>, die: &Die<'_, '_>) -> Result<Module> {
    let name = attr_name(dwarf, unit, die)?.unwrap_or_default();

    // A unit can carry several range tuples in theory; the first one is
    // the module's PC range.
    let mut ranges = dwarf.unit_ranges(unit)?;
    let (start_address, end_address) = match ranges.next()? {
        Some(range) => (range.begin, range.end),
        None => (0, 0),
    };

    let mut files = HashMap::new();
    let mut entries = Vec::new();

    if let Some(program) = unit.line_program.clone() {
        let header = program.header().clone();

        // DWARF v4 and earlier number files from 1; v5 from 0.
        let file_base = if header.encoding().version >= 5 { 0 } else { 1 };
        for (position, file) in header.file_names().iter().enumerate() {
            let index = file_base + position as u64;
            files.insert(index, render_file_path(dwarf, unit, &header, file));
        }

        let mut rows = program.rows();
        while let Some((_, row)) = rows.next_row()? {
            if row.end_sequence() {
                continue;
            }
            let raw_line = row.line().map(|l| l.get() as i64).unwrap_or(0);
            let column = match row.column() {
                gimli::ColumnType::LeftEdge => 0,
                gimli::ColumnType::Column(c) => c.get(),
            };
            entries.push(LineRow {
                address: row.address(),
                file: row.file_index(),
                // Compensate for the sentinel line the wrapper transform
                // prepends to the source.
                line: raw_line - 1,
                column,
                prologue_end: row.prologue_end(),
                epilogue_begin: row.epilogue_begin(),
                is_stmt: row.is_stmt(),
            });
        }
    }

    Ok(Module {
        name,
        start_address,
        end_address,
        files,
        entries,
        functions: Vec::new(),
        variables: Vec::new(),
    })
}

fn parse_base_type(dwarf: &Dwarf<'_>, unit: &Unit<'_>, die: &Die<'_, '_>) -> Result<BaseType> {
    let name = attr_name(dwarf, unit, die)?.unwrap_or_default();
    let byte_size = die
        .attr_value(gimli::DW_AT_byte_size)?
        .and_then(|value| value.udata_value())
        .unwrap_or(0);
    let encoding = match die.attr_value(gimli::DW_AT_encoding)? {
        Some(gimli::AttributeValue::Encoding(ate)) => ate,
        _ => crate::DW_ATE_void,
    };
    Ok(BaseType {
        name,
        byte_size,
        encoding,
    })
}

/// Parse a subprogram DIE. Returns `None` for declaration-only entries
/// that carry no code range.
fn parse_function(
    dwarf: &Dwarf<'_>,
    unit: &Unit<'_>,
    die: &Die<'_, '_>,
    module: ModuleId,
) -> Result<Option<Function>> {
    let mut name = String::new();
    let mut file = 0u64;
    let mut decl_line = 0i64;
    let mut decl_column = 0i64;
    let mut low_pc = None;
    let mut high = None;

    let mut attrs = die.attrs();
    while let Some(attr) = attrs.next()? {
        match attr.name() {
            gimli::DW_AT_name => {
                if let Ok(s) = dwarf.attr_string(unit, attr.value()) {
                    name = s.to_string_lossy().into_owned();
                }
            }
            gimli::DW_AT_decl_file => {
                file = match attr.value() {
                    gimli::AttributeValue::FileIndex(index) => index,
                    other => other.udata_value().unwrap_or(0),
                };
            }
            gimli::DW_AT_decl_line => {
                // Adjust for the prepended sentinel line.
                decl_line = attr.value().udata_value().unwrap_or(0) as i64 - 1;
            }
            gimli::DW_AT_decl_column => {
                decl_column = attr.value().udata_value().unwrap_or(0) as i64;
            }
            gimli::DW_AT_low_pc => {
                if let gimli::AttributeValue::Addr(addr) = attr.value() {
                    low_pc = Some(addr);
                }
            }
            gimli::DW_AT_high_pc => {
                high = Some(attr.value());
            }
            _ => {}
        }
    }

    let Some(low_pc) = low_pc else {
        if !name.is_empty() {
            debug!("skipping subprogram without code range: {}", name);
        }
        return Ok(None);
    };
    let high_pc = match high {
        Some(gimli::AttributeValue::Addr(addr)) => addr,
        Some(value) => low_pc + value.udata_value().unwrap_or(0),
        None => {
            warn!("subprogram {} has low_pc but no high_pc", name);
            low_pc
        }
    };

    Ok(Some(Function {
        name,
        module,
        file,
        decl_line,
        decl_column,
        low_pc,
        high_pc,
        parameters: Vec::new(),
    }))
}

fn attr_name(dwarf: &Dwarf<'_>, unit: &Unit<'_>, die: &Die<'_, '_>) -> Result<Option<String>> {
    match die.attr_value(gimli::DW_AT_name)? {
        Some(value) => match dwarf.attr_string(unit, value) {
            Ok(s) => Ok(Some(s.to_string_lossy().into_owned())),
            Err(_) => Ok(None),
        },
        None => Ok(None),
    }
}

/// Raw location expression bytes from DW_AT_location, if present as an
/// inline expression. Location lists are PC-dependent and not carried in
/// the index; they resolve to `None`.
fn location_bytes(die: &Die<'_, '_>) -> Result<Option<Vec<u8>>> {
    match die.attr_value(gimli::DW_AT_location)? {
        Some(gimli::AttributeValue::Exprloc(expr)) => Ok(Some(expr.0.slice().to_vec())),
        Some(other) => {
            debug!("unsupported location attribute form: {:?}", other);
            Ok(None)
        }
        None => Ok(None),
    }
}

fn type_ref(unit: &Unit<'_>, die: &Die<'_, '_>) -> Result<Option<gimli::DebugInfoOffset>> {
    match die.attr_value(gimli::DW_AT_type)? {
        Some(gimli::AttributeValue::UnitRef(offset)) => {
            Ok(offset.to_debug_info_offset(&unit.header))
        }
        Some(gimli::AttributeValue::DebugInfoRef(offset)) => Ok(Some(offset)),
        _ => Ok(None),
    }
}

fn render_file_path(
    dwarf: &Dwarf<'_>,
    unit: &Unit<'_>,
    header: &gimli::LineProgramHeader<Slice<'_>>,
    file: &gimli::FileEntry<Slice<'_>>,
) -> String {
    let mut path = PathBuf::new();

    if let Some(comp_dir) = unit.comp_dir {
        path.push(comp_dir.to_string_lossy().as_ref());
    }
    if let Some(directory) = file.directory(header) {
        if let Ok(dir) = dwarf.attr_string(unit, directory) {
            let dir = dir.to_string_lossy();
            if dir.starts_with('/') {
                path = PathBuf::from(dir.as_ref());
            } else {
                path.push(dir.as_ref());
            }
        }
    }
    match dwarf.attr_string(unit, file.path_name()) {
        Ok(name) => {
            let name = name.to_string_lossy();
            if name.starts_with('/') {
                path = PathBuf::from(name.as_ref());
            } else {
                path.push(name.as_ref());
            }
        }
        Err(_) => path.push("<unknown>"),
    }

    path.to_string_lossy().into_owned()
}
