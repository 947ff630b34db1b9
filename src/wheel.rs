//! Wheel archives: unpack and verify, locate package roots, regenerate
//! `RECORD`, and repack deterministically.

use std::collections::{BTreeSet, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{Datelike, Timelike};
use fs_err as fs;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use thiserror::Error;
use walkdir::WalkDir;
use zip::read::ZipArchive;
use zip::write::{SimpleFileOptions, ZipWriter};

use crate::arch::{Arch, ArchCheckError, check_tree_archs};
use crate::delocate::{DelocateError, DelocateOptions, delocate_tree};
use crate::system_tools::SystemTools;
use crate::utils::canonicalize_lossy;

#[derive(Error, Debug)]
pub enum WheelError {
    #[error("corrupt wheel {wheel}: {reason}")]
    Corrupt { wheel: PathBuf, reason: String },

    #[error("failed to read or write wheel: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),

    #[error(transparent)]
    Delocate(#[from] DelocateError),

    #[error(transparent)]
    Archs(#[from] ArchCheckError),
}

fn corrupt(wheel: &Path, reason: impl Into<String>) -> WheelError {
    WheelError::Corrupt {
        wheel: wheel.to_path_buf(),
        reason: reason.into(),
    }
}

/// A wheel expanded into an exclusively-owned staging directory. The
/// directory is removed on drop, so an aborted run never leaks state and
/// never touches the input archive.
#[derive(Debug)]
pub struct WheelStaging {
    _tempdir: TempDir,
    /// Canonical root of the expanded tree.
    pub root: PathBuf,
    /// Name of the `*.dist-info` directory (single path component).
    pub dist_info_name: String,
    /// `RECORD` row paths in their original order.
    pub record_order: Vec<String>,
}

impl WheelStaging {
    pub fn dist_info(&self) -> PathBuf {
        self.root.join(&self.dist_info_name)
    }
}

/// Extracts `wheel` into a fresh staging directory, restoring unix mode
/// bits, and verifies every `RECORD` row (sha256 and size) on the way.
pub fn unpack_wheel(wheel: &Path) -> Result<WheelStaging, WheelError> {
    let file = fs::File::open(wheel)?;
    let mut archive = ZipArchive::new(file)?;
    let tempdir = tempfile::Builder::new().prefix("delocate-").tempdir()?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(rel) = entry.enclosed_name() else {
            return Err(corrupt(
                wheel,
                format!("archive member `{}` escapes the tree", entry.name()),
            ));
        };
        let dest = tempdir.path().join(rel);
        if entry.is_dir() {
            fs::create_dir_all(&dest)?;
            continue;
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&dest)?;
        std::io::copy(&mut entry, &mut out)?;
        drop(out);
        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dest, std::fs::Permissions::from_mode(mode & 0o7777))?;
        }
    }

    let root = canonicalize_lossy(tempdir.path());
    let dist_info_name = find_dist_info(&root)
        .ok_or_else(|| corrupt(wheel, "no *.dist-info directory"))?;
    let dist_info = root.join(&dist_info_name);
    if !dist_info.join("WHEEL").is_file() {
        return Err(corrupt(wheel, "missing WHEEL metadata"));
    }
    let record_path = dist_info.join("RECORD");
    if !record_path.is_file() {
        return Err(corrupt(wheel, "missing RECORD"));
    }

    let record_text = fs::read_to_string(&record_path)?;
    let rows = parse_record(&record_text).map_err(|reason| corrupt(wheel, reason))?;
    let mut record_order = Vec::with_capacity(rows.len());
    for (path, hash_spec, size) in rows {
        if !hash_spec.is_empty() {
            let staged = root.join(&path);
            if !staged.is_file() {
                return Err(corrupt(wheel, format!("RECORD lists missing file {path}")));
            }
            let (actual_hash, actual_size) = hash_file(&staged)?;
            if hash_spec != actual_hash {
                return Err(corrupt(wheel, format!("RECORD hash mismatch for {path}")));
            }
            if !size.is_empty() && size != actual_size.to_string() {
                return Err(corrupt(wheel, format!("RECORD size mismatch for {path}")));
            }
        }
        record_order.push(path);
    }

    Ok(WheelStaging {
        _tempdir: tempdir,
        root,
        dist_info_name,
        record_order,
    })
}

fn find_dist_info(root: &Path) -> Option<String> {
    let mut found = None;
    for entry in fs::read_dir(root).ok()? {
        let entry = entry.ok()?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.path().is_dir() && name.ends_with(".dist-info") {
            if found.is_some() {
                return None;
            }
            found = Some(name);
        }
    }
    found
}

/// Top-level package roots: directories declared in `top_level.txt`
/// (namespace packages included) plus any directory carrying `__init__.*`.
pub fn find_package_roots(staging: &WheelStaging) -> Result<Vec<PathBuf>, WheelError> {
    let mut roots = BTreeSet::new();

    let top_level = staging.dist_info().join("top_level.txt");
    if top_level.is_file() {
        for line in fs::read_to_string(&top_level)?.lines() {
            let name = line.trim();
            if name.is_empty() {
                continue;
            }
            let dir = staging.root.join(name);
            if dir.is_dir() {
                roots.insert(dir);
            }
        }
    }

    for entry in fs::read_dir(&staging.root)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".dist-info") || name.ends_with(".data") {
            continue;
        }
        if has_init(&path)? {
            roots.insert(path);
        }
    }

    Ok(roots.into_iter().collect())
}

fn has_init(dir: &Path) -> Result<bool, WheelError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = Path::new(&name);
        if name.file_stem().is_some_and(|stem| stem == "__init__") {
            return Ok(true);
        }
    }
    Ok(false)
}

/// One `RECORD` row: `(path, hash_spec, size)`; hash and size are empty
/// for the `RECORD` row itself.
type RecordRow = (String, String, String);

pub(crate) fn parse_record(text: &str) -> Result<Vec<RecordRow>, String> {
    let mut rows = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        // only the path field may contain commas, so split from the right
        let mut fields = line.rsplitn(3, ',');
        let size = fields.next().unwrap_or_default().to_string();
        let hash = fields
            .next()
            .ok_or_else(|| format!("malformed RECORD row `{line}`"))?
            .to_string();
        let path = fields
            .next()
            .ok_or_else(|| format!("malformed RECORD row `{line}`"))?;
        rows.push((record_unquote(path), hash, size));
    }
    Ok(rows)
}

fn record_unquote(path: &str) -> String {
    match path.strip_prefix('"').and_then(|p| p.strip_suffix('"')) {
        Some(inner) => inner.replace("\"\"", "\""),
        None => path.to_string(),
    }
}

fn record_quote(path: &str) -> String {
    if path.contains(',') || path.contains('"') {
        format!("\"{}\"", path.replace('"', "\"\""))
    } else {
        path.to_string()
    }
}

/// Hashes a file the way `RECORD` records it: urlsafe base64 of the sha256
/// digest, without padding.
fn hash_file(path: &Path) -> Result<(String, u64), WheelError> {
    let contents = fs::read(path)?;
    let digest = Sha256::digest(&contents);
    Ok((
        format!("sha256={}", URL_SAFE_NO_PAD.encode(digest)),
        contents.len() as u64,
    ))
}

fn rel_name(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

pub(crate) fn tree_files(root: &Path) -> Result<Vec<String>, WheelError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.file_type().is_file() {
            files.push(rel_name(root, entry.path()));
        }
    }
    files.sort();
    Ok(files)
}

/// Rewrites `RECORD` for the current tree contents: surviving rows keep
/// their original order and position, added files are appended in lexical
/// order, and the `RECORD` row itself carries empty hash and size fields.
pub fn write_record(staging: &WheelStaging) -> Result<(), WheelError> {
    let record_rel = format!("{}/RECORD", staging.dist_info_name);
    let current: BTreeSet<String> = tree_files(&staging.root)?.into_iter().collect();

    let mut rows: Vec<String> = Vec::new();
    let mut seen: HashSet<&String> = HashSet::new();
    for path in &staging.record_order {
        if *path == record_rel {
            rows.push(format!("{},,", record_quote(path)));
            seen.insert(path);
            continue;
        }
        if current.contains(path) {
            let (hash, size) = hash_file(&staging.root.join(path))?;
            rows.push(format!("{},{hash},{size}", record_quote(path)));
            seen.insert(path);
        }
    }
    for path in &current {
        if seen.contains(path) || *path == record_rel {
            continue;
        }
        let (hash, size) = hash_file(&staging.root.join(path))?;
        rows.push(format!("{},{hash},{size}", record_quote(path)));
    }
    if !staging.record_order.iter().any(|p| *p == record_rel) {
        rows.push(format!("{record_rel},,"));
    }

    let mut out = fs::File::create(staging.root.join(&record_rel))?;
    for row in rows {
        writeln!(out, "{row}")?;
    }
    Ok(())
}

fn zip_timestamp(source_date_epoch: u64) -> Option<zip::DateTime> {
    let dt = chrono::DateTime::from_timestamp(source_date_epoch as i64, 0)?;
    // zip timestamps cannot express anything before the DOS epoch
    let (year, month, day, hour, minute, second) = if dt.year() < 1980 {
        (1980, 1, 1, 0, 0, 0)
    } else {
        (
            dt.year() as u16,
            dt.month() as u8,
            dt.day() as u8,
            dt.hour() as u8,
            dt.minute() as u8,
            dt.second() as u8,
        )
    };
    zip::DateTime::from_date_and_time(year, month, day, hour, minute, second).ok()
}

/// Repacks a staging tree into `out`: lexical entry order, mode bits
/// preserved, and a fixed timestamp when `source_date_epoch` is given so
/// repeated runs are byte-identical. The archive is assembled next to the
/// destination and moved into place with a rename, which is the only
/// externally visible commit point.
pub fn pack_wheel(
    staging_root: &Path,
    out: &Path,
    source_date_epoch: Option<u64>,
) -> Result<(), WheelError> {
    let parent = out.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let tmp = tempfile::Builder::new()
        .prefix(".delocate-wheel-")
        .tempfile_in(parent)?;
    let mut zip = ZipWriter::new(tmp.as_file());

    let timestamp = source_date_epoch.and_then(zip_timestamp);

    for rel in tree_files(staging_root)? {
        let path = staging_root.join(&rel);
        let mut options = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path)?.permissions().mode();
            options = options.unix_permissions(mode & 0o7777);
        }
        if let Some(ts) = timestamp {
            options = options.last_modified_time(ts);
        }
        zip.start_file(rel, options)?;
        let contents = fs::read(&path)?;
        zip.write_all(&contents)?;
    }
    zip.finish()?;

    tmp.persist(out).map_err(|e| WheelError::Io(e.error))?;
    Ok(())
}

/// Options for delocating one wheel.
#[derive(Debug, Clone, Default)]
pub struct WheelOptions {
    pub delocate: DelocateOptions,
    /// Architectures every Mach-O file must carry after delocation.
    pub require_archs: Option<BTreeSet<Arch>>,
    /// Place one sidecar at the wheel root instead of per package.
    pub sidecar_at_root: bool,
    /// Timestamp for reproducible repacks, from `SOURCE_DATE_EPOCH`.
    pub source_date_epoch: Option<u64>,
}

/// Delocates `in_wheel` and writes the result to `out_wheel` (which may
/// equal `in_wheel`; the input is only replaced by the final rename).
pub fn delocate_wheel(
    in_wheel: &Path,
    out_wheel: &Path,
    opts: &WheelOptions,
    system_tools: &SystemTools,
) -> Result<(), WheelError> {
    let staging = unpack_wheel(in_wheel)?;
    let package_roots = if opts.sidecar_at_root {
        vec![staging.root.clone()]
    } else {
        find_package_roots(&staging)?
    };

    let copied = delocate_tree(&staging.root, &package_roots, &opts.delocate, system_tools)?;
    if !copied.is_empty() {
        tracing::info!(
            "vendored {} librar{} into {}",
            copied.len(),
            if copied.len() == 1 { "y" } else { "ies" },
            in_wheel.display()
        );
    }

    if let Some(required) = &opts.require_archs {
        check_tree_archs(&staging.root, required)?;
    }

    write_record(&staging)?;
    pack_wheel(&staging.root, out_wheel, opts.source_date_epoch)?;
    Ok(())
}

/// The components of a wheel file name
/// (`distribution-version[-build]-python-abi-platform.whl`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WheelFilename {
    pub distribution: String,
    pub version: String,
    pub build_tag: Option<String>,
    pub python_tag: String,
    pub abi_tag: String,
    pub platform_tag: String,
}

impl WheelFilename {
    pub fn parse(path: &Path) -> Result<Self, WheelError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stem = name.strip_suffix(".whl").ok_or_else(|| {
            corrupt(path, "not a .whl file")
        })?;
        let parts: Vec<&str> = stem.split('-').collect();
        let (build_tag, tail) = match parts.len() {
            5 => (None, &parts[2..]),
            6 => (Some(parts[2].to_string()), &parts[3..]),
            _ => {
                return Err(corrupt(path, "file name is not in wheel format"));
            }
        };
        Ok(WheelFilename {
            distribution: parts[0].to_string(),
            version: parts[1].to_string(),
            build_tag,
            python_tag: tail[0].to_string(),
            abi_tag: tail[1].to_string(),
            platform_tag: tail[2].to_string(),
        })
    }
}

impl std::fmt::Display for WheelFilename {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.distribution, self.version)?;
        if let Some(build) = &self.build_tag {
            write!(f, "-{build}")?;
        }
        write!(
            f,
            "-{}-{}-{}.whl",
            self.python_tag, self.abi_tag, self.platform_tag
        )
    }
}

/// Replaces the platform component of every `Tag:` line in the `WHEEL`
/// metadata file, deduplicating lines that collapse into one.
pub fn replace_platform_tag(staging: &WheelStaging, platform: &str) -> Result<(), WheelError> {
    let wheel_meta = staging.dist_info().join("WHEEL");
    let text = fs::read_to_string(&wheel_meta)?;
    let mut lines: Vec<String> = Vec::new();
    let mut seen_tags: BTreeSet<String> = BTreeSet::new();
    for line in text.lines() {
        if let Some(tag) = line.strip_prefix("Tag:") {
            let tag = tag.trim();
            let mut parts: Vec<&str> = tag.split('-').collect();
            if parts.len() == 3 {
                parts[2] = platform;
            }
            let rewritten = format!("Tag: {}", parts.join("-"));
            if seen_tags.insert(rewritten.clone()) {
                lines.push(rewritten);
            }
        } else {
            lines.push(line.to_string());
        }
    }
    let mut out = fs::File::create(&wheel_meta)?;
    for line in lines {
        writeln!(out, "{line}")?;
    }
    Ok(())
}
