//! Small filesystem helpers shared across the crate.

use fs_err as fs;
use sha2::{Digest, Sha256};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

/// Converts `p` to an absolute path without touching the filesystem.
/// `.` and `..` components are resolved lexically; symlinks are left alone.
/// Relative paths are anchored at `base_path`.
pub fn to_lexical_absolute(p: &Path, base_path: &Path) -> PathBuf {
    let mut absolute = if p.is_absolute() {
        PathBuf::new()
    } else {
        base_path.to_path_buf()
    };
    for component in p.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                absolute.pop();
            }
            component => absolute.push(component.as_os_str()),
        }
    }
    absolute
}

/// Canonicalizes `p` (collapsing symlinks) when it exists, otherwise falls
/// back to lexical normalization so that callers always get an absolute path.
pub fn canonicalize_lossy(p: &Path) -> PathBuf {
    fs::canonicalize(p).unwrap_or_else(|_| to_lexical_absolute(p, &PathBuf::new()))
}

/// Short, stable hash of a source path, used to disambiguate basename
/// collisions when two distinct libraries land in the same sidecar.
pub fn short_path_hash(path: &Path) -> String {
    let digest = Sha256::digest(path.to_string_lossy().as_bytes());
    hex::encode(&digest[..4])
}

/// Copies `src` to `dest`, dereferencing a symlink at `src` once and
/// carrying over the source mode with the user write bit added.
pub fn copy_with_mode(src: &Path, dest: &Path) -> std::io::Result<()> {
    let target = fs::canonicalize(src)?;
    fs::copy(&target, dest)?;
    #[cfg(unix)]
    {
        let mode = fs::metadata(&target)?.permissions().mode();
        fs::set_permissions(dest, std::fs::Permissions::from_mode(mode | 0o200))?;
    }
    Ok(())
}

/// User read/write permissions (0o600).
pub const READ_WRITE: u32 = 0o600;

/// Makes a file temporarily writable and restores the original mode bits on
/// drop, whether the edit in between succeeded or not.
#[cfg(unix)]
pub struct ModeGuard {
    path: PathBuf,
    original: std::fs::Permissions,
}

#[cfg(unix)]
impl ModeGuard {
    pub fn new<P: AsRef<Path>>(path: P, permissions: u32) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let original = fs::metadata(&path)?.permissions();
        let widened = std::fs::Permissions::from_mode(original.mode() | permissions);
        fs::set_permissions(&path, widened)?;
        Ok(Self { path, original })
    }
}

#[cfg(unix)]
impl Drop for ModeGuard {
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(e) = fs::set_permissions(&self.path, self.original.clone()) {
                tracing::warn!(
                    "failed to restore mode bits of {}: {}",
                    self.path.display(),
                    e
                );
            }
        }
    }
}

#[cfg(not(unix))]
pub struct ModeGuard;

#[cfg(not(unix))]
impl ModeGuard {
    pub fn new<P: AsRef<Path>>(_path: P, _permissions: u32) -> std::io::Result<Self> {
        Ok(Self)
    }
}
