use std::path::Path;

use log::debug;

use crate::errors::DeployError;
use crate::obj::ElfReader;

use super::backend::ProbeBackend;
use super::{AttachMode, AttachTarget, AttachType, UProbeSpec, UProbeTmpl};

/// Expand probe templates against one binary's symbols and register the
/// resulting specs. A pattern matching no symbols is skipped, not an error;
/// the first hard registration failure aborts the remaining templates and
/// propagates. Returns the number of probes attached.
pub fn attach_probe_templates<B: ProbeBackend>(
    backend: &mut B,
    tmpls: &[UProbeTmpl],
    binary: &Path,
    elf: &ElfReader,
) -> Result<u64, DeployError> {
    let mut count = 0;
    for tmpl in tmpls {
        let symbols = match elf.list_func_symbols(tmpl.symbol, tmpl.match_type) {
            Ok(symbols) => symbols,
            Err(e) => {
                debug!("Could not list symbols matching {}: {e}", tmpl.symbol);
                continue;
            }
        };

        for sym in symbols {
            match tmpl.attach_type {
                AttachType::Entry | AttachType::Return => {
                    let mode = match tmpl.attach_type {
                        AttachType::Entry => AttachMode::Entry,
                        _ => AttachMode::Return,
                    };
                    backend.attach_uprobe(&UProbeSpec {
                        binary_path: binary.to_path_buf(),
                        target: AttachTarget::Symbol(sym.name.clone()),
                        mode,
                        handler: tmpl.handler.to_string(),
                    })?;
                    count += 1;
                }
                AttachType::ReturnInsts => {
                    // A return probe on the symbol becomes one entry probe
                    // per return instruction of its body.
                    for address in elf.return_instruction_addrs(&sym)? {
                        backend.attach_uprobe(&UProbeSpec {
                            binary_path: binary.to_path_buf(),
                            target: AttachTarget::Address(address),
                            mode: AttachMode::Entry,
                            handler: tmpl.handler.to_string(),
                        })?;
                        count += 1;
                    }
                }
            }
        }
    }
    Ok(count)
}
