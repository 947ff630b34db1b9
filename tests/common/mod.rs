//! Shared fixtures: synthesized Mach-O files and wheel archives.
//!
//! The dylib builder emits a minimal thin 64-bit Mach-O — header plus
//! `LC_ID_DYLIB`/`LC_LOAD_DYLIB`/`LC_RPATH` commands and a generous header
//! pad — which is all the inspector, editor and grapher look at. This keeps
//! the tests independent of a macOS toolchain.
#![allow(dead_code)]

use std::io::Write;
use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use goblin::mach::cputype::{CPU_TYPE_ARM64, CPU_TYPE_X86_64};
use goblin::mach::header::{MH_BUNDLE, MH_DYLIB, MH_MAGIC_64};
use goblin::mach::load_command::{LC_ID_DYLIB, LC_LOAD_DYLIB, LC_RPATH};
use sha2::{Digest, Sha256};
use zip::write::SimpleFileOptions;

const HEADER_SIZE: usize = 32;
const DYLIB_CMD_HEADER: usize = 24;
const RPATH_CMD_HEADER: usize = 12;

#[derive(Debug, Clone)]
pub struct DylibBuilder {
    cputype: u32,
    cpusubtype: u32,
    filetype: u32,
    id: Option<String>,
    deps: Vec<String>,
    rpaths: Vec<String>,
    pad: usize,
}

impl DylibBuilder {
    pub fn x86_64() -> Self {
        Self::new(CPU_TYPE_X86_64, 3)
    }

    pub fn arm64() -> Self {
        Self::new(CPU_TYPE_ARM64, 0)
    }

    fn new(cputype: u32, cpusubtype: u32) -> Self {
        DylibBuilder {
            cputype,
            cpusubtype,
            filetype: MH_DYLIB,
            id: None,
            deps: Vec::new(),
            rpaths: Vec::new(),
            pad: 1024,
        }
    }

    /// Extension modules are bundles and carry no install id.
    pub fn bundle(mut self) -> Self {
        self.filetype = MH_BUNDLE;
        self
    }

    pub fn id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn dep(mut self, dep: &str) -> Self {
        self.deps.push(dep.to_string());
        self
    }

    pub fn rpath(mut self, rpath: &str) -> Self {
        self.rpaths.push(rpath.to_string());
        self
    }

    pub fn pad(mut self, pad: usize) -> Self {
        self.pad = pad;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut cmds: Vec<u8> = Vec::new();
        let mut ncmds = 0u32;
        if let Some(id) = &self.id {
            cmds.extend(dylib_command(LC_ID_DYLIB, id));
            ncmds += 1;
        }
        for dep in &self.deps {
            cmds.extend(dylib_command(LC_LOAD_DYLIB, dep));
            ncmds += 1;
        }
        for rpath in &self.rpaths {
            cmds.extend(rpath_command(rpath));
            ncmds += 1;
        }

        let mut out = Vec::with_capacity(HEADER_SIZE + cmds.len() + self.pad);
        out.extend(MH_MAGIC_64.to_le_bytes());
        out.extend(self.cputype.to_le_bytes());
        out.extend(self.cpusubtype.to_le_bytes());
        out.extend(self.filetype.to_le_bytes());
        out.extend(ncmds.to_le_bytes());
        out.extend((cmds.len() as u32).to_le_bytes());
        out.extend(0u32.to_le_bytes()); // flags
        out.extend(0u32.to_le_bytes()); // reserved
        out.extend(cmds);
        out.extend(std::iter::repeat_n(0u8, self.pad));
        out
    }

    pub fn write(&self, path: &Path) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, self.build()).unwrap();
    }
}

fn dylib_command(cmd: u32, name: &str) -> Vec<u8> {
    let cmdsize = (DYLIB_CMD_HEADER + name.len() + 1).next_multiple_of(8);
    let mut out = Vec::with_capacity(cmdsize);
    out.extend(cmd.to_le_bytes());
    out.extend((cmdsize as u32).to_le_bytes());
    out.extend((DYLIB_CMD_HEADER as u32).to_le_bytes()); // name offset
    out.extend(2u32.to_le_bytes()); // timestamp
    out.extend(0x1_0000u32.to_le_bytes()); // current version
    out.extend(0x1_0000u32.to_le_bytes()); // compatibility version
    out.extend(name.as_bytes());
    out.resize(cmdsize, 0);
    out
}

fn rpath_command(path: &str) -> Vec<u8> {
    let cmdsize = (RPATH_CMD_HEADER + path.len() + 1).next_multiple_of(8);
    let mut out = Vec::with_capacity(cmdsize);
    out.extend(LC_RPATH.to_le_bytes());
    out.extend((cmdsize as u32).to_le_bytes());
    out.extend((RPATH_CMD_HEADER as u32).to_le_bytes()); // path offset
    out.extend(path.as_bytes());
    out.resize(cmdsize, 0);
    out
}

/// Assembles a wheel archive with a correct `RECORD`.
pub struct WheelBuilder {
    distribution: String,
    version: String,
    tag: String,
    files: Vec<(String, Vec<u8>)>,
    top_level: Option<String>,
}

impl WheelBuilder {
    pub fn new(distribution: &str, version: &str, tag: &str) -> Self {
        WheelBuilder {
            distribution: distribution.to_string(),
            version: version.to_string(),
            tag: tag.to_string(),
            files: Vec::new(),
            top_level: None,
        }
    }

    pub fn file(mut self, path: &str, contents: &[u8]) -> Self {
        self.files.push((path.to_string(), contents.to_vec()));
        self
    }

    pub fn top_level(mut self, names: &str) -> Self {
        self.top_level = Some(names.to_string());
        self
    }

    pub fn dist_info(&self) -> String {
        format!("{}-{}.dist-info", self.distribution, self.version)
    }

    pub fn file_name(&self) -> String {
        format!("{}-{}-{}.whl", self.distribution, self.version, self.tag)
    }

    /// Writes the wheel into `dir` and returns its path.
    pub fn write(&self, dir: &Path) -> std::path::PathBuf {
        let dist_info = self.dist_info();
        let mut files = self.files.clone();
        files.push((
            format!("{dist_info}/WHEEL"),
            format!(
                "Wheel-Version: 1.0\n\
                 Generator: bdist_wheel (0.41.2)\n\
                 Root-Is-Purelib: false\n\
                 Tag: {}\n",
                self.tag
            )
            .into_bytes(),
        ));
        if let Some(top_level) = &self.top_level {
            files.push((
                format!("{dist_info}/top_level.txt"),
                format!("{top_level}\n").into_bytes(),
            ));
        }

        let mut record = String::new();
        for (path, contents) in &files {
            let digest = Sha256::digest(contents);
            record.push_str(&format!(
                "{path},sha256={},{}\n",
                URL_SAFE_NO_PAD.encode(digest),
                contents.len()
            ));
        }
        record.push_str(&format!("{dist_info}/RECORD,,\n"));
        files.push((format!("{dist_info}/RECORD"), record.into_bytes()));

        let out = dir.join(self.file_name());
        let file = std::fs::File::create(&out).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .unix_permissions(0o644);
        for (path, contents) in &files {
            zip.start_file(path.clone(), options).unwrap();
            zip.write_all(contents).unwrap();
        }
        zip.finish().unwrap();
        out
    }
}

/// Re-resolves every dependency of every Mach-O under `root` and asserts
/// the closure property: each one is a system path or lands inside `root`.
pub fn assert_closed(root: &Path) {
    use delocate::graph::{PathKind, tree_libs};

    let graph = tree_libs(root, root).unwrap();
    let failures = graph.unresolved();
    assert!(failures.is_empty(), "unresolved references: {failures:?}");
    for (_, path, record) in graph.nodes() {
        assert_ne!(
            record.kind,
            PathKind::External,
            "{} is reachable but outside the tree",
            path.display()
        );
    }
}
