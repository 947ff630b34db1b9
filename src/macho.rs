//! Reading the observed view of a Mach-O file: architectures, install id,
//! raw dependency strings and rpath entries.

pub mod edit;
pub mod universal;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use fs_err as fs;
use fs_err::File;
use goblin::mach::{Mach, MachO};
use thiserror::Error;

use crate::arch::Arch;
use crate::system_tools::ToolError;

#[derive(Error, Debug)]
pub enum MachoError {
    #[error("failed to read or write file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse Mach-O file: {0}")]
    Parse(#[from] goblin::error::Error),

    #[error("failed to read or write a load command string: {0}")]
    Scroll(#[from] scroll::Error),

    #[error("not a Mach-O file: {0}")]
    NotMachO(PathBuf),

    #[error("the built-in editor cannot express this change")]
    BuiltinEditFailed,

    #[error("install_name_tool failed: {0}")]
    InstallNameToolFailed(String),

    #[error("codesign failed: {0}")]
    CodesignFailed(String),

    #[error(transparent)]
    SystemTool(#[from] ToolError),

    #[error("cannot assemble universal file: {0}")]
    Universal(String),
}

/// The observed view of one on-disk Mach-O file.
///
/// For fat files the dependency/rpath/id view is taken from the first
/// slice (the slices of a well-formed fat file agree on their load
/// commands); architectures cover every slice.
#[derive(Debug, Clone)]
pub struct MachFile {
    /// Location in the current staging tree.
    pub path: PathBuf,
    /// Self-name from `LC_ID_DYLIB`; absent in executables and bundles.
    pub install_id: Option<String>,
    /// Raw dependency strings in load command order, magic prefixes intact.
    pub dependencies: Vec<String>,
    /// Raw `LC_RPATH` entries in load command order.
    pub rpaths: Vec<String>,
    pub architectures: BTreeSet<Arch>,
    signed: bool,
}

impl MachFile {
    /// Parses the file at `path`. Returns `Ok(None)` for anything that is
    /// not a regular file carrying a Mach-O (or fat) magic; callers skip
    /// those. Real I/O failures surface as errors.
    pub fn open(path: &Path) -> Result<Option<Self>, MachoError> {
        match fs::metadata(path) {
            Ok(metadata) if metadata.is_file() => {}
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let file = File::open(path)?;
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        if mmap.len() < 4 {
            return Ok(None);
        }

        let mach = match Mach::parse(&mmap) {
            Ok(mach) => mach,
            Err(e) => {
                tracing::debug!("skipping {}: {}", path.display(), e);
                return Ok(None);
            }
        };

        let parsed = match mach {
            Mach::Binary(macho) => {
                let architectures = [Arch::from_cputype(
                    macho.header.cputype(),
                    macho.header.cpusubtype(),
                )]
                .into_iter()
                .collect();
                Self::from_slice(path, &macho, architectures)
            }
            Mach::Fat(multi) => {
                // a Java class file shares the fat magic; treat anything
                // that does not hold together as not ours
                let Ok(arches) = multi
                    .iter_arches()
                    .collect::<Result<Vec<_>, goblin::error::Error>>()
                else {
                    tracing::debug!("skipping {}: malformed fat header", path.display());
                    return Ok(None);
                };
                let architectures = arches
                    .iter()
                    .map(|a| Arch::from_cputype(a.cputype, a.cpusubtype))
                    .collect();
                let Some(first) = arches.first() else {
                    return Ok(None);
                };
                let start = first.offset as usize;
                let end = start.saturating_add(first.size as usize);
                let Some(slice) = mmap.get(start..end) else {
                    tracing::debug!("skipping {}: fat slice out of bounds", path.display());
                    return Ok(None);
                };
                let Ok(macho) = MachO::parse(slice, 0) else {
                    tracing::debug!("skipping {}: unreadable fat slice", path.display());
                    return Ok(None);
                };
                Self::from_slice(path, &macho, architectures)
            }
        };

        Ok(Some(parsed))
    }

    fn from_slice(path: &Path, macho: &MachO<'_>, architectures: BTreeSet<Arch>) -> Self {
        // goblin always reserves libs[0] for the file itself: the literal
        // "self" placeholder, or the install id when LC_ID_DYLIB is present
        let dependencies = macho
            .libs
            .iter()
            .skip(1)
            .map(|lib| lib.to_string())
            .collect();
        let signed = macho.load_commands.iter().any(|lc| {
            matches!(
                lc.command,
                goblin::mach::load_command::CommandVariant::CodeSignature(_)
            )
        });
        MachFile {
            path: path.to_path_buf(),
            install_id: macho.name.map(str::to_string),
            dependencies,
            rpaths: macho.rpaths.iter().map(|r| r.to_string()).collect(),
            architectures,
            signed,
        }
    }

    /// Whether the file carried an `LC_CODE_SIGNATURE` command when read.
    pub fn is_signed(&self) -> bool {
        self.signed
    }
}
