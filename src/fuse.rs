//! Fusing two single-architecture wheels into one universal wheel.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use fs_err as fs;
use thiserror::Error;

use crate::arch::{Arch, expand_tag_arch, fused_arch_name};
use crate::macho::universal::make_universal;
use crate::macho::{MachFile, MachoError};
use crate::utils::{canonicalize_lossy, copy_with_mode};
use crate::wheel::{
    WheelError, WheelFilename, pack_wheel, replace_platform_tag, tree_files, unpack_wheel,
    write_record,
};

#[derive(Error, Debug)]
pub enum FuseError {
    #[error("wheels cannot be merged: {0}")]
    Incompatible(String),

    #[error("irreconcilable file `{path}` differs between {left} and {right}")]
    Irreconcilable {
        path: String,
        left: PathBuf,
        right: PathBuf,
    },

    #[error(transparent)]
    Wheel(#[from] WheelError),

    #[error(transparent)]
    Macho(#[from] MachoError),

    #[error("failed to read or write file: {0}")]
    Io(#[from] std::io::Error),
}

/// A macOS platform tag `macosx_<major>_<minor>_<arch>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacosPlatformTag {
    pub major: u32,
    pub minor: u32,
    pub arch: String,
}

impl MacosPlatformTag {
    pub fn parse(tag: &str) -> Option<Self> {
        let rest = tag.strip_prefix("macosx_")?;
        let mut parts = rest.splitn(3, '_');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let arch = parts.next()?.to_string();
        if arch.is_empty() {
            return None;
        }
        Some(MacosPlatformTag { major, minor, arch })
    }

    pub fn archs(&self) -> BTreeSet<Arch> {
        expand_tag_arch(&self.arch)
    }

    /// The minimum deployment target promised by this tag.
    pub fn deployment_target(&self) -> (u32, u32) {
        (self.major, self.minor)
    }
}

impl std::fmt::Display for MacosPlatformTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "macosx_{}_{}_{}", self.major, self.minor, self.arch)
    }
}

/// Fuses `left` and `right` into a universal wheel written to `out_dir`.
/// The inputs must be the same distribution at the same version, built for
/// the same Python and ABI, with disjoint architecture sets. Returns the
/// path of the merged wheel.
pub fn fuse_wheels(
    left: &Path,
    right: &Path,
    out_dir: &Path,
    source_date_epoch: Option<u64>,
) -> Result<PathBuf, FuseError> {
    let left_name = WheelFilename::parse(left)?;
    let right_name = WheelFilename::parse(right)?;

    for (field, a, b) in [
        ("distribution", &left_name.distribution, &right_name.distribution),
        ("version", &left_name.version, &right_name.version),
        ("python tag", &left_name.python_tag, &right_name.python_tag),
        ("abi tag", &left_name.abi_tag, &right_name.abi_tag),
    ] {
        if a != b {
            return Err(FuseError::Incompatible(format!(
                "{field} differs: `{a}` vs `{b}`"
            )));
        }
    }
    if left_name.build_tag != right_name.build_tag {
        return Err(FuseError::Incompatible("build tag differs".to_string()));
    }

    let left_tag = MacosPlatformTag::parse(&left_name.platform_tag).ok_or_else(|| {
        FuseError::Incompatible(format!(
            "`{}` is not a macOS platform tag",
            left_name.platform_tag
        ))
    })?;
    let right_tag = MacosPlatformTag::parse(&right_name.platform_tag).ok_or_else(|| {
        FuseError::Incompatible(format!(
            "`{}` is not a macOS platform tag",
            right_name.platform_tag
        ))
    })?;

    let left_archs = left_tag.archs();
    let right_archs = right_tag.archs();
    if left_archs.intersection(&right_archs).next().is_some() {
        return Err(FuseError::Incompatible(format!(
            "architecture sets overlap: `{}` vs `{}`",
            left_tag.arch, right_tag.arch
        )));
    }

    let merged_tag = merged_platform_tag(&left_tag, &right_tag);

    let left_staging = unpack_wheel(left)?;
    let right_staging = unpack_wheel(right)?;

    let metadata_rel: BTreeSet<String> = ["RECORD", "WHEEL"]
        .iter()
        .map(|name| format!("{}/{name}", right_staging.dist_info_name))
        .collect();

    for rel in tree_files(&right_staging.root)? {
        let ours = left_staging.root.join(&rel);
        let theirs = right_staging.root.join(&rel);

        if !ours.exists() {
            if let Some(parent) = ours.parent() {
                fs::create_dir_all(parent)?;
            }
            copy_with_mode(&theirs, &ours)?;
            continue;
        }
        if metadata_rel.contains(&rel) {
            // regenerated for the merged wheel
            continue;
        }

        let ours_mach = MachFile::open(&ours)?;
        let theirs_mach = MachFile::open(&theirs)?;
        if ours_mach.is_some() && theirs_mach.is_some() {
            tracing::debug!("fusing slices of {rel}");
            make_universal(&ours, &[ours.as_path(), theirs.as_path()])?;
            continue;
        }

        if fs::read(&ours)? != fs::read(&theirs)? {
            return Err(FuseError::Irreconcilable {
                path: rel,
                left: left.to_path_buf(),
                right: right.to_path_buf(),
            });
        }
    }

    replace_platform_tag(&left_staging, &merged_tag.to_string())?;
    write_record(&left_staging)?;

    let merged_name = WheelFilename {
        platform_tag: merged_tag.to_string(),
        ..left_name
    };
    let out = out_dir.join(merged_name.to_string());
    let out_canonical = canonicalize_lossy(&out);
    if out_canonical == canonicalize_lossy(left) || out_canonical == canonicalize_lossy(right) {
        return Err(FuseError::Incompatible(
            "merged wheel would overwrite an input".to_string(),
        ));
    }
    pack_wheel(&left_staging.root, &out, source_date_epoch)?;

    Ok(out)
}

/// The merged tag takes the newer minimum deployment target of the two
/// inputs and the fused architecture name.
fn merged_platform_tag(left: &MacosPlatformTag, right: &MacosPlatformTag) -> MacosPlatformTag {
    let (major, minor) = left.deployment_target().max(right.deployment_target());
    let archs: BTreeSet<Arch> = left.archs().union(&right.archs()).cloned().collect();
    MacosPlatformTag {
        major,
        minor,
        arch: fused_arch_name(&archs),
    }
}
