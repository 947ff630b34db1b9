//! Resolution of raw Mach-O dependency strings against a search context.
//!
//! Dependency strings may carry the dynamic-linker tokens
//! `@executable_path`, `@loader_path` and `@rpath`. Resolution substitutes
//! these against the context a file is being loaded in and yields an
//! absolute, symlink-collapsed path. Rules, in order:
//!
//! 1. `@executable_path/…` substitutes the executable directory.
//! 2. `@loader_path/…` substitutes the loading file's directory.
//! 3. `@rpath/…` tries every rpath entry in order and takes the first
//!    candidate that exists on disk.
//! 4. An absolute path is accepted as written.
//! 5. A bare relative path is malformed for distribution purposes; it only
//!    resolves when a file of that basename sits next to the loader.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::utils::{canonicalize_lossy, to_lexical_absolute};

#[derive(Error, Debug, Clone)]
pub enum ResolveError {
    #[error("dependency `{reference}` of `{loader}` cannot be resolved")]
    Unresolved { loader: PathBuf, reference: String },
}

/// The context a dependency string is resolved in.
#[derive(Debug, Clone)]
pub struct SearchContext {
    /// Directory of the file doing the loading.
    pub loader_dir: PathBuf,
    /// Directory of the main program; for a library tree with no main
    /// program this is the root of the traversal.
    pub executable_dir: PathBuf,
    /// Ordered rpath search list accumulated along the chain of loaders,
    /// each entry already resolved to an absolute path.
    pub rpaths: Vec<PathBuf>,
}

impl SearchContext {
    pub fn new(loader_dir: impl Into<PathBuf>, executable_dir: impl Into<PathBuf>) -> Self {
        SearchContext {
            loader_dir: loader_dir.into(),
            executable_dir: executable_dir.into(),
            rpaths: Vec::new(),
        }
    }

    /// Resolves one raw `LC_RPATH` entry against this context. Entries may
    /// themselves start with `@loader_path` or `@executable_path`; an entry
    /// that stays relative after substitution is unusable for distribution
    /// and yields `None`.
    pub fn resolve_rpath_entry(&self, entry: &str) -> Option<PathBuf> {
        let substituted = if let Some(rest) = strip_token(entry, "@loader_path") {
            self.loader_dir.join(rest)
        } else if let Some(rest) = strip_token(entry, "@executable_path") {
            self.executable_dir.join(rest)
        } else {
            PathBuf::from(entry)
        };
        if substituted.is_absolute() {
            Some(to_lexical_absolute(&substituted, Path::new("")))
        } else {
            None
        }
    }
}

/// Strips `token` plus its separating slash; `@loader_path` alone (no
/// trailing component) maps to the empty remainder.
fn strip_token<'a>(s: &'a str, token: &str) -> Option<&'a str> {
    let rest = s.strip_prefix(token)?;
    if rest.is_empty() {
        Some("")
    } else {
        rest.strip_prefix('/')
    }
}

/// Resolves a raw dependency string to an absolute path.
///
/// Existence on disk is only required where the search itself needs it
/// (`@rpath` candidates, bare names); classification and existence policy
/// for the final path is the graph's concern.
pub fn resolve_dependency(
    reference: &str,
    ctx: &SearchContext,
) -> Result<PathBuf, ResolveError> {
    if let Some(rest) = strip_token(reference, "@executable_path") {
        return Ok(canonicalize_lossy(&ctx.executable_dir.join(rest)));
    }
    if let Some(rest) = strip_token(reference, "@loader_path") {
        return Ok(canonicalize_lossy(&ctx.loader_dir.join(rest)));
    }
    if let Some(rest) = strip_token(reference, "@rpath") {
        for rpath in &ctx.rpaths {
            let candidate = rpath.join(rest);
            if candidate.exists() {
                return Ok(canonicalize_lossy(&candidate));
            }
        }
        return Err(ResolveError::Unresolved {
            loader: ctx.loader_dir.clone(),
            reference: reference.to_string(),
        });
    }

    let path = Path::new(reference);
    if path.is_absolute() {
        return Ok(canonicalize_lossy(path));
    }

    // a bare name means no install id was ever baked into the dependency;
    // accept it only when the file sits right next to the loader
    if let Some(basename) = path.file_name() {
        let adjacent = ctx.loader_dir.join(basename);
        if adjacent.is_file() {
            return Ok(canonicalize_lossy(&adjacent));
        }
    }
    Err(ResolveError::Unresolved {
        loader: ctx.loader_dir.clone(),
        reference: reference.to_string(),
    })
}
