//! Copying external libraries into sidecar directories and rewriting every
//! load command that references them.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use fs_err as fs;
use thiserror::Error;

use crate::graph::{DependencyGraph, GraphError, PathKind, tree_libs};
use crate::macho::MachoError;
use crate::macho::edit::{MachEdits, apply_edits};
use crate::resolve::SearchContext;
use crate::system_tools::SystemTools;
use crate::utils::{canonicalize_lossy, copy_with_mode, short_path_hash};

#[derive(Debug, Clone)]
pub struct DelocateOptions {
    /// Name of the sidecar directory placed inside each package root.
    pub lib_sdir: String,
    /// Libraries whose file name contains any of these strings are not
    /// copied and their references are left untouched.
    pub exclude: Vec<String>,
    /// Demote unresolved dependencies from an error to a warning.
    pub ignore_missing: bool,
    /// Directory `@executable_path` resolves to; the tree root when unset.
    pub executable_path: Option<PathBuf>,
}

impl Default for DelocateOptions {
    fn default() -> Self {
        DelocateOptions {
            lib_sdir: ".dylibs".to_string(),
            exclude: Vec::new(),
            ignore_missing: false,
            executable_path: None,
        }
    }
}

fn format_failures(failures: &[(PathBuf, String)]) -> String {
    failures
        .iter()
        .map(|(loader, raw)| format!("  - {}: {raw}", loader.display()))
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Error, Debug)]
pub enum DelocateError {
    #[error("unresolved dependencies:\n{}", format_failures(.failures))]
    Unresolved { failures: Vec<(PathBuf, String)> },

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Macho(#[from] MachoError),

    #[error("failed to copy library: {0}")]
    Io(#[from] std::io::Error),

    #[error("no relative path from {from} to {to}")]
    PathDiff { from: PathBuf, to: PathBuf },
}

/// Tracks which file name each source library gets inside each sidecar.
/// Two distinct sources with the same basename destined for one sidecar
/// are disambiguated with a short hash of the source path.
#[derive(Debug, Default)]
struct SidecarNames {
    by_source: BTreeMap<(PathBuf, PathBuf), String>,
    owners: BTreeMap<(PathBuf, String), PathBuf>,
}

impl SidecarNames {
    fn assign(&mut self, sidecar: &Path, source: &Path) -> String {
        let key = (sidecar.to_path_buf(), source.to_path_buf());
        if let Some(name) = self.by_source.get(&key) {
            return name.clone();
        }
        let base = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "library".to_string());
        let name = match self.owners.get(&(sidecar.to_path_buf(), base.clone())) {
            Some(owner) if owner != source => {
                format!("{}-{base}", short_path_hash(source))
            }
            _ => base,
        };
        self.owners
            .insert((sidecar.to_path_buf(), name.clone()), source.to_path_buf());
        self.by_source.insert(key, name.clone());
        name
    }
}

/// Delocates the tree at `root`: copies every external library a loader in
/// the tree needs into the sidecar of that loader's package, rewrites the
/// references to `@loader_path`-relative form, and drops rpaths that point
/// outside the tree. Copies are pulled in transitively until a full pass
/// performs none. Returns the set of files copied in.
pub fn delocate_tree(
    root: &Path,
    package_roots: &[PathBuf],
    opts: &DelocateOptions,
    system_tools: &SystemTools,
) -> Result<BTreeSet<PathBuf>, DelocateError> {
    let root = canonicalize_lossy(root);
    let executable_dir = opts
        .executable_path
        .clone()
        .unwrap_or_else(|| root.clone());
    let package_roots: Vec<PathBuf> = if package_roots.is_empty() {
        vec![root.clone()]
    } else {
        package_roots.iter().map(|p| canonicalize_lossy(p)).collect()
    };

    let mut names = SidecarNames::default();
    let mut copied = BTreeSet::new();

    let graph = loop {
        let graph = tree_libs(&root, &executable_dir)?;
        check_unresolved(&graph, opts)?;

        let mut copies_this_pass = 0usize;

        for (_, loader_path, loader_record) in graph.nodes() {
            if loader_record.kind != PathKind::Tree || loader_record.mach.is_none() {
                continue;
            }
            let loader_dir = loader_path.parent().ok_or_else(|| DelocateError::PathDiff {
                from: loader_path.to_path_buf(),
                to: PathBuf::from("/"),
            })?;

            let mut edits = MachEdits::default();
            for (dep_idx, raw) in &loader_record.deps {
                let dep_path = graph.path_of(*dep_idx);
                let dep_record = graph.record_of(*dep_idx);
                match dep_record.kind {
                    PathKind::System => {}
                    PathKind::External => {
                        if is_excluded(dep_path, &opts.exclude) {
                            tracing::debug!(
                                "not copying excluded library {}",
                                dep_path.display()
                            );
                            continue;
                        }
                        let sidecar =
                            sidecar_for(loader_path, &package_roots, &root, &opts.lib_sdir);
                        let dest_name = names.assign(&sidecar, dep_path);
                        let dest = sidecar.join(&dest_name);
                        if !dest.exists() {
                            fs::create_dir_all(&sidecar)?;
                            copy_with_mode(dep_path, &dest)?;
                            if dep_record.mach.is_some() {
                                // self-referential id so the copy loads
                                // from its own directory
                                let id_edit = MachEdits {
                                    set_id: Some(format!("@loader_path/{dest_name}")),
                                    ..MachEdits::default()
                                };
                                apply_edits(&dest, &id_edit, system_tools)?;
                            }
                            tracing::info!(
                                "copied {} -> {}",
                                dep_path.display(),
                                dest.display()
                            );
                            copied.insert(dest.clone());
                            copies_this_pass += 1;
                        }
                        push_relative_change(&mut edits, raw, loader_dir, &dest)?;
                    }
                    PathKind::Tree => {
                        // a bare or absolute reference to a file already in
                        // the tree still breaks once the tree moves
                        if !raw.starts_with('@') {
                            push_relative_change(&mut edits, raw, loader_dir, dep_path)?;
                        }
                    }
                }
            }

            if !edits.is_empty() {
                apply_edits(loader_path, &edits, system_tools)?;
            }
        }

        if copies_this_pass == 0 {
            break graph;
        }
    };

    strip_external_rpaths(&graph, &root, &executable_dir, system_tools)?;

    Ok(copied)
}

fn push_relative_change(
    edits: &mut MachEdits,
    raw: &str,
    loader_dir: &Path,
    dest: &Path,
) -> Result<(), DelocateError> {
    let relative =
        pathdiff::diff_paths(dest, loader_dir).ok_or_else(|| DelocateError::PathDiff {
            from: dest.to_path_buf(),
            to: loader_dir.to_path_buf(),
        })?;
    let new_ref = format!("@loader_path/{}", relative.display());
    if raw != new_ref {
        edits.change_deps.push((raw.to_string(), new_ref));
    }
    Ok(())
}

/// The sidecar a loader reaches its copies through: the innermost package
/// root containing the loader, or the tree root when there is none.
fn sidecar_for(
    loader: &Path,
    package_roots: &[PathBuf],
    root: &Path,
    lib_sdir: &str,
) -> PathBuf {
    package_roots
        .iter()
        .filter(|pkg| loader.starts_with(pkg))
        .max_by_key(|pkg| pkg.components().count())
        .map(|pkg| pkg.join(lib_sdir))
        .unwrap_or_else(|| root.join(lib_sdir))
}

fn is_excluded(path: &Path, exclude: &[String]) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    exclude.iter().any(|pattern| name.contains(pattern))
}

/// Failures on excluded libraries are demoted to warnings; with
/// `ignore_missing` every failure is.
fn check_unresolved(
    graph: &DependencyGraph,
    opts: &DelocateOptions,
) -> Result<(), DelocateError> {
    let mut failures = Vec::new();
    for (loader, raw) in graph.unresolved() {
        if opts.ignore_missing || is_excluded(Path::new(raw), &opts.exclude) {
            tracing::warn!("ignoring unresolved dependency {raw} of {}", loader.display());
        } else {
            failures.push((loader.to_path_buf(), raw.to_string()));
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(DelocateError::Unresolved { failures })
    }
}

/// Rpaths that point outside the tree are dead after delocation; every
/// rewritten reference is fully `@loader_path`-resolved.
fn strip_external_rpaths(
    graph: &DependencyGraph,
    root: &Path,
    executable_dir: &Path,
    system_tools: &SystemTools,
) -> Result<(), DelocateError> {
    for (_, path, record) in graph.nodes() {
        if record.kind != PathKind::Tree {
            continue;
        }
        let Some(mach) = &record.mach else {
            continue;
        };
        let Some(loader_dir) = path.parent() else {
            continue;
        };
        let ctx = SearchContext::new(loader_dir, executable_dir);

        let mut edits = MachEdits::default();
        for entry in &mach.rpaths {
            match ctx.resolve_rpath_entry(entry) {
                Some(resolved) if resolved.starts_with(root) => {}
                _ => edits.delete_rpaths.push(entry.clone()),
            }
        }
        if !edits.is_empty() {
            apply_edits(path, &edits, system_tools)?;
        }
    }
    Ok(())
}
