//! MPI wrapper recognition
//!
//! Targets built against the MPI wrapper header export a sentinel
//! signature function; every other function declared in the signature's
//! source file is an MPI shim whose name carries a leading `_` sentinel
//! character. Recognition strips the sentinel so downstream components see
//! canonical MPI names (`MPI_Send`, `MPI_Recv`, ...).

use crate::entities::MpiData;
use crate::index::DwarfIndex;
use tracing::{debug, info};

/// Well-known name of the wrapper's signature function.
pub const MPI_SIGNATURE_FUNC: &str = "_MPI_WRAPPER_INCLUDE";

/// Recognize the wrapper function set inside the index, renaming the
/// wrapper shims in place. A target without the signature function yields
/// an empty set; that is the normal case for plain C targets.
pub(crate) fn resolve_mpi_debug_info(index: &mut DwarfIndex) -> MpiData {
    let Some((module_id, signature)) = index.lookup_func(MPI_SIGNATURE_FUNC) else {
        info!("target is not built against the MPI wrapper, no MPI breakpoints available");
        return MpiData::default();
    };

    let signature_file = index.functions[signature.0].file;
    let module = &index.modules[module_id.0];
    let file = module
        .files
        .get(&signature_file)
        .cloned()
        .unwrap_or_default();

    let wrapper: Vec<_> = module
        .functions
        .iter()
        .copied()
        .filter(|&fid| fid != signature && index.functions[fid.0].file == signature_file)
        .collect();

    for &fid in &wrapper {
        let function = &mut index.functions[fid.0];
        if !function.name.is_empty() {
            // Strip the sentinel prefix character.
            function.name.remove(0);
        }
        debug!("recognized MPI wrapper function {}", function.name);
    }

    MpiData {
        functions: wrapper,
        file,
    }
}
