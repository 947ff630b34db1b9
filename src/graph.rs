//! Transitive dependency graph over a directory tree.
//!
//! The arena holds one record per canonical path; adjacency is stored as
//! integer indices into the arena so the mutual references libraries have
//! never create owning cycles. References that fail to resolve land in a
//! separate table instead of the adjacency lists.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};

use indexmap::{IndexMap, IndexSet};
use thiserror::Error;
use walkdir::WalkDir;

use crate::macho::{MachFile, MachoError};
use crate::resolve::{SearchContext, resolve_dependency};
use crate::utils::canonicalize_lossy;

/// Path prefixes that mark a dependency as part of the operating system.
/// System libraries live in the dyld shared cache and are never copied.
pub const SYSTEM_PREFIXES: &[&str] = &["/usr/lib/", "/System/"];

pub fn is_system_path(path: &Path) -> bool {
    SYSTEM_PREFIXES
        .iter()
        .any(|prefix| path.starts_with(prefix))
}

/// Where a graph node lives relative to the tree being delocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    /// Inside the tree.
    Tree,
    /// Operating system library; left alone.
    System,
    /// Outside the tree and not a system library; a copy candidate.
    External,
}

/// One file in the arena.
#[derive(Debug)]
pub struct FileRecord {
    pub kind: PathKind,
    /// Parsed view; `None` for system entries and unreadable files.
    pub mach: Option<MachFile>,
    /// Resolved dependencies as `(arena index, raw string)` pairs.
    pub deps: Vec<(usize, String)>,
    /// Raw strings that did not resolve from this loader.
    pub unresolved: Vec<String>,
    /// Rpaths inherited from the chains of loaders that reach this file.
    inherited_rpaths: IndexSet<PathBuf>,
    processed: bool,
}

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("failed to read tree: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to walk tree: {0}")]
    Walk(#[from] walkdir::Error),

    #[error(transparent)]
    Macho(#[from] MachoError),
}

/// The dependency graph of one tree, plus everything reachable from it.
#[derive(Debug)]
pub struct DependencyGraph {
    root: PathBuf,
    arena: IndexMap<PathBuf, FileRecord>,
}

impl DependencyGraph {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn nodes(&self) -> impl Iterator<Item = (usize, &Path, &FileRecord)> {
        self.arena
            .iter()
            .enumerate()
            .map(|(idx, (path, record))| (idx, path.as_path(), record))
    }

    pub fn path_of(&self, idx: usize) -> &Path {
        self.arena.get_index(idx).expect("index in arena").0
    }

    pub fn record_of(&self, idx: usize) -> &FileRecord {
        self.arena.get_index(idx).expect("index in arena").1
    }

    /// Inverse map: dependency index to the set of loader indices that
    /// reference it.
    pub fn dependents(&self) -> BTreeMap<usize, BTreeSet<usize>> {
        let mut map: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
        for (loader_idx, _, record) in self.nodes() {
            for (dep_idx, _) in &record.deps {
                map.entry(*dep_idx).or_default().insert(loader_idx);
            }
        }
        map
    }

    /// Every `(loader, raw string)` pair that failed to resolve.
    pub fn unresolved(&self) -> Vec<(&Path, &str)> {
        let mut failures = Vec::new();
        for (_, path, record) in self.nodes() {
            for raw in &record.unresolved {
                failures.push((path, raw.as_str()));
            }
        }
        failures
    }

    /// Dependency paths mapped to the loaders that use them, for display.
    pub fn library_map(&self, include_system: bool) -> BTreeMap<&Path, BTreeSet<&Path>> {
        let mut map: BTreeMap<&Path, BTreeSet<&Path>> = BTreeMap::new();
        for (dep_idx, loaders) in self.dependents() {
            let dep_record = self.record_of(dep_idx);
            if dep_record.kind == PathKind::System && !include_system {
                continue;
            }
            let entry = map.entry(self.path_of(dep_idx)).or_default();
            for loader_idx in loaders {
                entry.insert(self.path_of(loader_idx));
            }
        }
        map
    }
}

/// Walks `root` and builds the transitive dependency graph.
///
/// Every regular file is visited once; Mach-O files contribute their
/// dependencies, resolved in a context whose loader is the file's own
/// directory and whose executable directory is `executable_dir` (the root
/// of the walk when the tree has no main program). Files outside the tree
/// that are reachable through dependencies are visited too, with the rpath
/// list accumulated along the chain of loaders, until the reachable set
/// stabilizes.
pub fn tree_libs(root: &Path, executable_dir: &Path) -> Result<DependencyGraph, GraphError> {
    let root = canonicalize_lossy(root);
    let executable_dir = canonicalize_lossy(executable_dir);

    let mut graph = DependencyGraph {
        root: root.clone(),
        arena: IndexMap::new(),
    };
    let mut queue: VecDeque<usize> = VecDeque::new();

    for entry in WalkDir::new(&root).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(mach) = MachFile::open(entry.path())? else {
            continue;
        };
        let path = canonicalize_lossy(entry.path());
        let (idx, _) = graph.arena.insert_full(
            path,
            FileRecord {
                kind: PathKind::Tree,
                mach: Some(mach),
                deps: Vec::new(),
                unresolved: Vec::new(),
                inherited_rpaths: IndexSet::new(),
                processed: false,
            },
        );
        queue.push_back(idx);
    }

    while let Some(idx) = queue.pop_front() {
        let (path, mach) = {
            let (path, record) = graph.arena.get_index(idx).expect("index in arena");
            if record.processed {
                continue;
            }
            (path.clone(), record.mach.clone())
        };
        let Some(mach) = mach else {
            graph.arena[idx].processed = true;
            continue;
        };
        let loader_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));

        let mut ctx = SearchContext::new(loader_dir, executable_dir.clone());
        // own rpath entries first, then the ones inherited along the chain
        let mut search_list: IndexSet<PathBuf> = mach
            .rpaths
            .iter()
            .filter_map(|entry| ctx.resolve_rpath_entry(entry))
            .collect();
        search_list.extend(graph.arena[idx].inherited_rpaths.iter().cloned());
        ctx.rpaths = search_list.iter().cloned().collect();

        let mut deps: Vec<(usize, String)> = Vec::new();
        let mut unresolved: Vec<String> = Vec::new();

        for raw in &mach.dependencies {
            let raw_path = Path::new(raw);
            if raw_path.is_absolute() && is_system_path(raw_path) {
                let dep_idx = intern(&mut graph.arena, raw_path, PathKind::System, false)?;
                deps.push((dep_idx, raw.clone()));
                continue;
            }

            let resolved = match resolve_dependency(raw, &ctx) {
                Ok(resolved) => resolved,
                Err(_) => {
                    unresolved.push(raw.clone());
                    continue;
                }
            };

            if is_system_path(&resolved) {
                let dep_idx = intern(&mut graph.arena, &resolved, PathKind::System, false)?;
                deps.push((dep_idx, raw.clone()));
                continue;
            }
            if !resolved.is_file() {
                unresolved.push(raw.clone());
                continue;
            }

            let kind = if resolved.starts_with(&root) {
                PathKind::Tree
            } else {
                PathKind::External
            };
            let dep_idx = intern(&mut graph.arena, &resolved, kind, true)?;

            // propagate the accumulated search list so an @rpath reference
            // satisfied upstream stays satisfied in the downstream library
            let dep_record = &mut graph.arena[dep_idx];
            if dep_record.mach.is_some() {
                let before = dep_record.inherited_rpaths.len();
                dep_record.inherited_rpaths.extend(ctx.rpaths.iter().cloned());
                if !dep_record.processed || dep_record.inherited_rpaths.len() > before {
                    dep_record.processed = false;
                    queue.push_back(dep_idx);
                }
            }

            deps.push((dep_idx, raw.clone()));
        }

        let record = &mut graph.arena[idx];
        record.deps = deps;
        record.unresolved = unresolved;
        record.processed = true;
    }

    Ok(graph)
}

/// Inserts a node if it is new and returns its index. `parse` controls
/// whether the file is opened as Mach-O (system entries never are).
fn intern(
    arena: &mut IndexMap<PathBuf, FileRecord>,
    path: &Path,
    kind: PathKind,
    parse: bool,
) -> Result<usize, GraphError> {
    if let Some(idx) = arena.get_index_of(path) {
        return Ok(idx);
    }
    let mach = if parse { MachFile::open(path)? } else { None };
    let (idx, _) = arena.insert_full(
        path.to_path_buf(),
        FileRecord {
            kind,
            mach,
            deps: Vec::new(),
            unresolved: Vec::new(),
            inherited_rpaths: IndexSet::new(),
            processed: false,
        },
    );
    Ok(idx)
}
