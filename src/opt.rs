//! Command-line options.

use std::collections::BTreeSet;
use std::path::PathBuf;

use clap::{Parser, crate_version};
use clap_verbosity_flag::{InfoLevel, Verbosity};

use crate::arch::{Arch, ArchCheckError, parse_arch_spec};
use crate::delocate::DelocateOptions;

/// Application subcommands.
#[derive(Parser)]
pub enum SubCommands {
    /// Print the dynamic library dependencies of a tree or wheel
    Listdeps(ListDepsOpts),

    /// Delocate a directory tree in place
    Path(PathOpts),

    /// Delocate one or more wheels
    Wheel(WheelOpts),

    /// Fuse two wheels of disjoint architectures into one universal wheel
    Merge(MergeOpts),
}

#[derive(Parser)]
#[clap(version = crate_version!())]
pub struct App {
    /// Subcommand.
    #[clap(subcommand)]
    pub subcommand: SubCommands,

    /// Enable verbose logging.
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,
}

/// Options shared by the delocating commands.
#[derive(Parser, Debug, Clone)]
pub struct CommonOpts {
    /// Name of the sidecar directory copied libraries are placed in
    #[arg(long, default_value = ".dylibs")]
    pub lib_sdir: String,

    /// Architectures every Mach-O file must carry after delocation;
    /// a name like `arm64`, an alias (`intel`, `universal2`), or a
    /// comma-separated list
    #[arg(long)]
    pub require_archs: Option<String>,

    /// Directory `@executable_path` references resolve to
    #[arg(long)]
    pub executable_path: Option<PathBuf>,

    /// Do not copy libraries whose file name contains this string
    #[arg(long)]
    pub exclude: Vec<String>,

    /// Warn instead of failing when a dependency cannot be resolved
    #[arg(long)]
    pub ignore_missing_dependencies: bool,
}

impl CommonOpts {
    pub fn delocate_options(&self) -> DelocateOptions {
        DelocateOptions {
            lib_sdir: self.lib_sdir.clone(),
            exclude: self.exclude.clone(),
            ignore_missing: self.ignore_missing_dependencies,
            executable_path: self.executable_path.clone(),
        }
    }

    pub fn required_archs(&self) -> Result<Option<BTreeSet<Arch>>, ArchCheckError> {
        self.require_archs
            .as_deref()
            .map(parse_arch_spec)
            .transpose()
    }
}

#[derive(Parser, Debug)]
pub struct ListDepsOpts {
    /// Directory tree or wheel to inspect
    pub target: PathBuf,

    /// Include system libraries in the listing
    #[arg(long)]
    pub all: bool,

    /// Print which files depend on each library
    #[arg(long)]
    pub depending: bool,
}

#[derive(Parser, Debug)]
pub struct PathOpts {
    /// Directory trees to delocate in place
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    #[command(flatten)]
    pub common: CommonOpts,
}

#[derive(Parser, Debug)]
pub struct WheelOpts {
    /// Wheels to delocate
    #[arg(required = true)]
    pub wheels: Vec<PathBuf>,

    /// Directory the delocated wheels are written to; each input is
    /// overwritten in place when unset
    #[arg(long, short = 'w')]
    pub wheel_dir: Option<PathBuf>,

    /// Place a single sidecar at the wheel root instead of one per package
    #[arg(long)]
    pub root_sidecar: bool,

    #[command(flatten)]
    pub common: CommonOpts,
}

#[derive(Parser, Debug)]
pub struct MergeOpts {
    /// First wheel to fuse
    pub left: PathBuf,

    /// Second wheel to fuse
    pub right: PathBuf,

    /// Directory the merged wheel is written to
    #[arg(long, short = 'w')]
    pub wheel_dir: PathBuf,
}
