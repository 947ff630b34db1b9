//! CPU architecture tokens and the required-architecture check that runs
//! over a delocated tree.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;
use walkdir::WalkDir;

use crate::macho::{MachFile, MachoError};

/// A single CPU architecture as recorded in a Mach-O header or fat arch
/// entry. The set is open ended; slices we have no name for are carried
/// verbatim so they survive a merge.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Arch {
    I386,
    X86_64,
    X86_64h,
    Arm64,
    Arm64e,
    Other(String),
}

impl Arch {
    /// Maps a cputype/cpusubtype pair to an architecture token, using the
    /// same names the platform tools print. Capability bits in the subtype
    /// are masked off first.
    pub fn from_cputype(cputype: u32, cpusubtype: u32) -> Arch {
        let cpusubtype = cpusubtype & !goblin::mach::cputype::CPU_SUBTYPE_MASK;
        match goblin::mach::cputype::get_arch_name_from_types(cputype, cpusubtype) {
            Some(name) => Arch::from(name),
            None => Arch::Other(format!("cputype-{cputype}-{cpusubtype}")),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Arch::I386 => "i386",
            Arch::X86_64 => "x86_64",
            Arch::X86_64h => "x86_64h",
            Arch::Arm64 => "arm64",
            Arch::Arm64e => "arm64e",
            Arch::Other(name) => name,
        }
    }
}

impl From<&str> for Arch {
    fn from(name: &str) -> Arch {
        match name {
            "i386" => Arch::I386,
            "x86_64" => Arch::X86_64,
            "x86_64h" => Arch::X86_64h,
            "arm64" => Arch::Arm64,
            "arm64e" => Arch::Arm64e,
            other => Arch::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Arch {
    type Err = ArchCheckError;

    /// Strict parse for user-facing options: aliases are handled by
    /// [`parse_arch_spec`], unknown names are rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match Arch::from(s) {
            Arch::Other(name) => Err(ArchCheckError::UnknownArch(name)),
            arch => Ok(arch),
        }
    }
}

/// Parses a `--require-archs` value: a single architecture, one of the
/// aliases `intel` (i386 + x86_64) or `universal2` (x86_64 + arm64), or a
/// comma-separated list of either.
pub fn parse_arch_spec(spec: &str) -> Result<BTreeSet<Arch>, ArchCheckError> {
    let mut archs = BTreeSet::new();
    for token in spec.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        match token {
            "intel" => {
                archs.insert(Arch::I386);
                archs.insert(Arch::X86_64);
            }
            "universal2" => {
                archs.insert(Arch::X86_64);
                archs.insert(Arch::Arm64);
            }
            name => {
                archs.insert(name.parse()?);
            }
        }
    }
    if archs.is_empty() {
        return Err(ArchCheckError::UnknownArch(spec.to_string()));
    }
    Ok(archs)
}

/// The alias used in a merged platform tag for a fused architecture set,
/// falling back to the sorted names joined with `_`.
pub fn fused_arch_name(archs: &BTreeSet<Arch>) -> String {
    let universal2: BTreeSet<Arch> = [Arch::X86_64, Arch::Arm64].into_iter().collect();
    let intel: BTreeSet<Arch> = [Arch::I386, Arch::X86_64].into_iter().collect();
    if *archs == universal2 {
        "universal2".to_string()
    } else if *archs == intel {
        "intel".to_string()
    } else {
        archs
            .iter()
            .map(Arch::name)
            .collect::<Vec<_>>()
            .join("_")
    }
}

/// Expands a platform-tag architecture component into the set of slices it
/// promises.
pub fn expand_tag_arch(name: &str) -> BTreeSet<Arch> {
    match name {
        "intel" => [Arch::I386, Arch::X86_64].into_iter().collect(),
        "universal2" => [Arch::X86_64, Arch::Arm64].into_iter().collect(),
        other => [Arch::from(other)].into_iter().collect(),
    }
}

/// One file missing one or more required architectures.
#[derive(Debug, Clone)]
pub struct ArchDeficit {
    pub file: PathBuf,
    pub missing: BTreeSet<Arch>,
}

impl fmt::Display for ArchDeficit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let missing = self
            .missing
            .iter()
            .map(Arch::name)
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "{} is missing {}", self.file.display(), missing)
    }
}

fn format_deficits(deficits: &[ArchDeficit]) -> String {
    deficits
        .iter()
        .map(|d| format!("  - {d}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Error, Debug)]
pub enum ArchCheckError {
    #[error("unknown architecture `{0}`")]
    UnknownArch(String),

    #[error("required architectures are missing:\n{}", format_deficits(.deficits))]
    Deficit { deficits: Vec<ArchDeficit> },

    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Macho(#[from] MachoError),
}

/// Verifies that every Mach-O file under `root` carries all `required`
/// architectures. Deficits are aggregated across the whole tree before the
/// check fails.
pub fn check_tree_archs(root: &Path, required: &BTreeSet<Arch>) -> Result<(), ArchCheckError> {
    let mut deficits = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(mach) = MachFile::open(entry.path())? else {
            continue;
        };
        let missing: BTreeSet<Arch> = required
            .difference(&mach.architectures)
            .cloned()
            .collect();
        if !missing.is_empty() {
            deficits.push(ArchDeficit {
                file: entry.path().to_path_buf(),
                missing,
            });
        }
    }
    if deficits.is_empty() {
        Ok(())
    } else {
        Err(ArchCheckError::Deficit { deficits })
    }
}
