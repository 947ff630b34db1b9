//! Assembling universal (fat) files from thin slices.

use std::collections::BTreeSet;
use std::path::Path;

use fat_macho::FatWriter;
use fs_err as fs;
use goblin::mach::Mach;

use crate::arch::Arch;
use crate::macho::MachoError;

/// Produces a fat file at `out` whose slices are the union of the slices of
/// `inputs`. Slice order is normalized by architecture so that merging in
/// either order yields the same file. Two slices of the same architecture
/// are rejected. Returns the architecture set of the result.
pub fn make_universal(out: &Path, inputs: &[&Path]) -> Result<BTreeSet<Arch>, MachoError> {
    let mut slices: Vec<(Arch, Vec<u8>)> = Vec::new();
    for input in inputs {
        let data = fs::read(input)?;
        let fat_arches = match Mach::parse(&data)? {
            Mach::Fat(multi) => Some(
                multi
                    .iter_arches()
                    .collect::<Result<Vec<_>, goblin::error::Error>>()?,
            ),
            Mach::Binary(macho) => {
                let arch =
                    Arch::from_cputype(macho.header.cputype(), macho.header.cpusubtype());
                slices.push((arch, data.clone()));
                None
            }
        };
        if let Some(arches) = fat_arches {
            for arch in arches {
                let start = arch.offset as usize;
                let end = start + arch.size as usize;
                let bytes = data
                    .get(start..end)
                    .ok_or_else(|| {
                        MachoError::Universal(format!(
                            "fat arch slice out of bounds in {}",
                            input.display()
                        ))
                    })?
                    .to_vec();
                slices.push((Arch::from_cputype(arch.cputype, arch.cpusubtype), bytes));
            }
        }
    }

    slices.sort_by(|a, b| a.0.cmp(&b.0));

    let mut archs = BTreeSet::new();
    for (arch, _) in &slices {
        if !archs.insert(arch.clone()) {
            return Err(MachoError::Universal(format!(
                "two inputs carry a {arch} slice for {}",
                out.display()
            )));
        }
    }

    let mut writer = FatWriter::new();
    for (_, bytes) in slices {
        writer
            .add(bytes)
            .map_err(|e| MachoError::Universal(format!("{e:?}")))?;
    }
    writer
        .write_to_file(out)
        .map_err(|e| MachoError::Universal(format!("{e:?}")))?;

    Ok(archs)
}
