//! Command-line front-end.

use std::path::{Path, PathBuf};
use std::process::exit;

use clap::Parser;
use miette::Diagnostic;
use thiserror::Error;

use delocate::arch::{ArchCheckError, check_tree_archs};
use delocate::console_utils::init_logging;
use delocate::delocate::{DelocateError, delocate_tree};
use delocate::fuse::{FuseError, fuse_wheels};
use delocate::graph::{GraphError, tree_libs};
use delocate::opt::{App, ListDepsOpts, MergeOpts, PathOpts, SubCommands, WheelOpts};
use delocate::system_tools::SystemTools;
use delocate::wheel::{WheelError, WheelOptions, delocate_wheel, unpack_wheel};

const EXIT_USAGE: i32 = 1;
const EXIT_UNRESOLVED: i32 = 2;
const EXIT_ARCH_DEFICIT: i32 = 3;
const EXIT_IRRECONCILABLE: i32 = 4;
const EXIT_FAILURE: i32 = 5;

#[derive(Error, Debug, Diagnostic)]
enum CommandError {
    #[error(transparent)]
    Delocate(#[from] DelocateError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Wheel(#[from] WheelError),

    #[error(transparent)]
    Fuse(#[from] FuseError),

    #[error(transparent)]
    Archs(#[from] ArchCheckError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CommandError {
    fn exit_code(&self) -> i32 {
        match self {
            CommandError::Delocate(e) => delocate_code(e),
            CommandError::Wheel(e) => wheel_code(e),
            CommandError::Fuse(e) => fuse_code(e),
            CommandError::Archs(e) => arch_code(e),
            CommandError::Graph(_) | CommandError::Io(_) => EXIT_FAILURE,
        }
    }
}

fn delocate_code(e: &DelocateError) -> i32 {
    match e {
        DelocateError::Unresolved { .. } => EXIT_UNRESOLVED,
        _ => EXIT_FAILURE,
    }
}

fn arch_code(e: &ArchCheckError) -> i32 {
    match e {
        ArchCheckError::Deficit { .. } => EXIT_ARCH_DEFICIT,
        ArchCheckError::UnknownArch(_) => EXIT_USAGE,
        _ => EXIT_FAILURE,
    }
}

fn wheel_code(e: &WheelError) -> i32 {
    match e {
        WheelError::Delocate(d) => delocate_code(d),
        WheelError::Archs(a) => arch_code(a),
        _ => EXIT_FAILURE,
    }
}

fn fuse_code(e: &FuseError) -> i32 {
    match e {
        FuseError::Irreconcilable { .. } | FuseError::Incompatible(_) => EXIT_IRRECONCILABLE,
        FuseError::Wheel(w) => wheel_code(w),
        _ => EXIT_FAILURE,
    }
}

fn main() {
    let app = match App::try_parse() {
        Ok(app) => app,
        Err(e) => {
            let _ = e.print();
            exit(if e.use_stderr() { EXIT_USAGE } else { 0 });
        }
    };
    init_logging(&app.verbose);

    if let Err(err) = run(app) {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        exit(code);
    }
}

fn run(app: App) -> Result<(), CommandError> {
    match app.subcommand {
        SubCommands::Listdeps(opts) => run_listdeps(opts),
        SubCommands::Path(opts) => run_path(opts),
        SubCommands::Wheel(opts) => run_wheel(opts),
        SubCommands::Merge(opts) => run_merge(opts),
    }
}

fn is_wheel_file(path: &Path) -> bool {
    path.is_file() && path.extension().is_some_and(|ext| ext == "whl")
}

fn source_date_epoch() -> Option<u64> {
    std::env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|value| value.parse().ok())
}

fn run_listdeps(opts: ListDepsOpts) -> Result<(), CommandError> {
    // keep the staging directory alive while the graph borrows from it
    let staging;
    let graph = if is_wheel_file(&opts.target) {
        staging = unpack_wheel(&opts.target)?;
        tree_libs(&staging.root, &staging.root)?
    } else {
        tree_libs(&opts.target, &opts.target)?
    };

    for (loader, raw) in graph.unresolved() {
        tracing::warn!("unresolved dependency {raw} of {}", loader.display());
    }

    let display = |path: &Path| -> String {
        path.strip_prefix(graph.root())
            .unwrap_or(path)
            .display()
            .to_string()
    };

    let map = graph.library_map(opts.all);
    if opts.depending {
        for (dep, loaders) in map {
            println!("{}:", display(dep));
            for loader in loaders {
                println!("    {}", display(loader));
            }
        }
    } else {
        for dep in map.keys() {
            println!("{}", display(dep));
        }
    }
    Ok(())
}

fn run_path(opts: PathOpts) -> Result<(), CommandError> {
    let system_tools = SystemTools::new();
    let delocate_opts = opts.common.delocate_options();
    let required = opts.common.required_archs()?;

    for path in &opts.paths {
        let copied = delocate_tree(path, &[], &delocate_opts, &system_tools)?;
        if let Some(required) = &required {
            check_tree_archs(path, required)?;
        }
        for library in &copied {
            println!("{}", library.display());
        }
    }
    Ok(())
}

fn run_wheel(opts: WheelOpts) -> Result<(), CommandError> {
    let system_tools = SystemTools::new();
    let wheel_opts = WheelOptions {
        delocate: opts.common.delocate_options(),
        require_archs: opts.common.required_archs()?,
        sidecar_at_root: opts.root_sidecar,
        source_date_epoch: source_date_epoch(),
    };

    for wheel in &opts.wheels {
        let out: PathBuf = match &opts.wheel_dir {
            Some(dir) => dir.join(wheel.file_name().unwrap_or(wheel.as_os_str())),
            None => wheel.clone(),
        };
        delocate_wheel(wheel, &out, &wheel_opts, &system_tools)?;
        println!("{}", out.display());
    }
    Ok(())
}

fn run_merge(opts: MergeOpts) -> Result<(), CommandError> {
    let out = fuse_wheels(&opts.left, &opts.right, &opts.wheel_dir, source_date_epoch())?;
    println!("{}", out.display());
    Ok(())
}
