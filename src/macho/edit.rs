//! In-place rewriting of Mach-O load commands.
//!
//! Edits are applied with a built-in editor first: load commands are
//! rebuilt inside the header pad so the file keeps its exact size and no
//! section offset moves. When the pad cannot absorb a change the edit
//! falls back to the platform `install_name_tool`. Files that carried a
//! code signature are re-signed ad-hoc afterwards, since rewriting any
//! load command invalidates the signature.

use std::ffi::CStr;
use std::path::Path;

use fs_err as fs;
use goblin::container;
use goblin::mach::header::{Header, SIZEOF_HEADER_32, SIZEOF_HEADER_64};
use goblin::mach::load_command::{
    CommandVariant, DylibCommand, LC_RPATH, LoadCommand, RpathCommand, SIZEOF_RPATH_COMMAND,
};
use goblin::mach::{Mach, MachO, parse_magic_and_ctx};
use scroll::Pwrite;

use crate::macho::{MachFile, MachoError};
use crate::system_tools::{SystemTools, Tool};
use crate::utils::{ModeGuard, READ_WRITE};

/// A batch of load command changes for one file.
#[derive(Debug, Default, Clone)]
pub struct MachEdits {
    /// Replacement for the `LC_ID_DYLIB` name.
    pub set_id: Option<String>,
    /// `(old, new)` dependency name rewrites.
    pub change_deps: Vec<(String, String)>,
    /// `LC_RPATH` entries to append.
    pub add_rpaths: Vec<String>,
    /// `LC_RPATH` entries to remove.
    pub delete_rpaths: Vec<String>,
}

impl MachEdits {
    pub fn is_empty(&self) -> bool {
        self.set_id.is_none()
            && self.change_deps.is_empty()
            && self.add_rpaths.is_empty()
            && self.delete_rpaths.is_empty()
    }
}

impl std::fmt::Display for MachEdits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(id) = &self.set_id {
            writeln!(f, " - set install id to {id:?}")?;
        }
        for (old, new) in &self.change_deps {
            writeln!(f, " - change dependency {old:?} to {new:?}")?;
        }
        for rpath in &self.add_rpaths {
            writeln!(f, " - add rpath {rpath:?}")?;
        }
        for rpath in &self.delete_rpaths {
            writeln!(f, " - delete rpath {rpath:?}")?;
        }
        Ok(())
    }
}

/// Applies `edits` to the file at `path`, restoring the original mode bits
/// on exit whatever happens in between.
pub fn apply_edits(
    path: &Path,
    edits: &MachEdits,
    system_tools: &SystemTools,
) -> Result<(), MachoError> {
    if edits.is_empty() {
        return Ok(());
    }
    let mach =
        MachFile::open(path)?.ok_or_else(|| MachoError::NotMachO(path.to_path_buf()))?;

    tracing::debug!("rewriting load commands of {}:\n{}", path.display(), edits);

    let _guard = ModeGuard::new(path, READ_WRITE)?;
    if let Err(e) = rewrite_load_commands(path, edits) {
        tracing::warn!(
            "built-in rewrite of {} failed ({e}), falling back to install_name_tool",
            path.display()
        );
        run_install_name_tool(path, edits, system_tools)?;
    }
    if mach.is_signed() {
        codesign_adhoc(path, system_tools)?;
    }
    Ok(())
}

/// Built-in editor. The file is only written once every slice accepted
/// every change, so a failure leaves it untouched for the fallback.
fn rewrite_load_commands(path: &Path, edits: &MachEdits) -> Result<(), MachoError> {
    let mut data = fs::read(path)?;

    let slices: Vec<(usize, usize)> = match Mach::parse(&data)? {
        Mach::Fat(multi) => multi
            .iter_arches()
            .map(|arch| arch.map(|a| (a.offset as usize, a.size as usize)))
            .collect::<Result<_, _>>()?,
        Mach::Binary(_) => vec![(0, data.len())],
    };

    // last slice first so earlier offsets stay valid if a length slipped
    for (offset, size) in slices.into_iter().rev() {
        let mut slice = data
            .get(offset..offset + size)
            .ok_or(MachoError::BuiltinEditFailed)?
            .to_vec();
        edit_slice(&mut slice, edits)?;
        if slice.len() != size {
            return Err(MachoError::BuiltinEditFailed);
        }
        data.splice(offset..offset + size, slice);
    }

    fs::write(path, &data)?;
    Ok(())
}

fn header_size(ctx: container::Ctx) -> usize {
    if ctx.container.is_big() {
        SIZEOF_HEADER_64
    } else {
        SIZEOF_HEADER_32
    }
}

fn align_to_ctx(size: usize, ctx: container::Ctx) -> usize {
    if ctx.container.is_big() {
        size.next_multiple_of(8)
    } else {
        size.next_multiple_of(4)
    }
}

/// End of the region load commands may grow into: the first byte of
/// section content, or the end of the slice when there are no sections.
fn pad_end(data: &[u8], macho: &MachO<'_>) -> usize {
    let mut end = data.len();
    for segment in &macho.segments {
        if let Ok(sections) = segment.sections() {
            for (section, _) in sections {
                let offset = section.offset as usize;
                if section.size > 0 && offset > 0 && offset < end {
                    end = offset;
                }
            }
        }
    }
    end
}

fn remove_load_command(
    data: &mut Vec<u8>,
    header: &mut Header,
    ctx: container::Ctx,
    cmd_offset: usize,
    cmdsize: usize,
) -> Result<(), MachoError> {
    data.drain(cmd_offset..cmd_offset + cmdsize);

    header.ncmds -= 1;
    header.sizeofcmds -= cmdsize as u32;

    // re-pad after the remaining load commands to keep the size stable
    let padding_offset = header_size(ctx) + header.sizeofcmds as usize;
    let tail = data.split_off(padding_offset);
    data.extend(std::iter::repeat_n(0u8, cmdsize));
    data.extend(tail);

    data.pwrite_with(*header, 0, ctx)?;
    Ok(())
}

fn insert_load_command(
    data: &mut Vec<u8>,
    header: &mut Header,
    ctx: container::Ctx,
    offset: usize,
    cmd_data: &[u8],
    pad_limit: usize,
) -> Result<(), MachoError> {
    let grown = header.sizeofcmds as usize + cmd_data.len();
    if header_size(ctx) + grown > pad_limit {
        return Err(MachoError::BuiltinEditFailed);
    }

    // the surplus that will be drained must be actual zero padding
    let drain_start = header_size(ctx) + grown;
    let drain_end = drain_start + cmd_data.len();
    let surplus = &data[drain_start - cmd_data.len()..drain_end - cmd_data.len()];
    if surplus.iter().any(|b| *b != 0) {
        return Err(MachoError::BuiltinEditFailed);
    }

    header.ncmds += 1;
    header.sizeofcmds += cmd_data.len() as u32;

    let tail = data.split_off(offset);
    data.extend_from_slice(cmd_data);
    data.extend(tail);
    data.drain(drain_start..drain_end);

    data.pwrite_with(*header, 0, ctx)?;
    Ok(())
}

fn build_rpath_command(path: &str, ctx: container::Ctx) -> Result<Vec<u8>, MachoError> {
    let c_str = format!("{path}\0");
    let c_str =
        CStr::from_bytes_with_nul(c_str.as_bytes()).map_err(|_| MachoError::BuiltinEditFailed)?;
    let str_size = (c_str.count_bytes() + 1).next_multiple_of(4);
    let cmdsize = align_to_ctx(SIZEOF_RPATH_COMMAND + str_size, ctx);

    let rpath_cmd = RpathCommand {
        cmd: LC_RPATH,
        cmdsize: cmdsize as u32,
        path: SIZEOF_RPATH_COMMAND as u32,
    };

    let mut buf = vec![0u8; cmdsize];
    buf.pwrite(rpath_cmd, 0)?;
    buf.pwrite(c_str, SIZEOF_RPATH_COMMAND)?;
    Ok(buf)
}

// DylibCommand header: cmd + cmdsize + name offset + timestamp +
// current_version + compatibility_version, 4 bytes each
const SIZEOF_DYLIB_COMMAND: usize = 24;

fn build_dylib_command(
    name: &str,
    old_cmd: &DylibCommand,
    ctx: container::Ctx,
) -> Result<Vec<u8>, MachoError> {
    let c_str = format!("{name}\0");
    let c_str =
        CStr::from_bytes_with_nul(c_str.as_bytes()).map_err(|_| MachoError::BuiltinEditFailed)?;
    let str_size = (c_str.count_bytes() + 1).next_multiple_of(4);
    let cmdsize = align_to_ctx(SIZEOF_DYLIB_COMMAND + str_size, ctx);

    let new_cmd = DylibCommand {
        cmd: old_cmd.cmd,
        cmdsize: cmdsize as u32,
        dylib: goblin::mach::load_command::Dylib {
            name: SIZEOF_DYLIB_COMMAND as u32,
            timestamp: old_cmd.dylib.timestamp,
            current_version: old_cmd.dylib.current_version,
            compatibility_version: old_cmd.dylib.compatibility_version,
        },
    };

    let mut buf = vec![0u8; cmdsize];
    buf.pwrite(new_cmd, 0)?;
    buf.pwrite(c_str, SIZEOF_DYLIB_COMMAND)?;
    Ok(buf)
}

fn read_lc_str<'a>(data: &'a [u8], lc: &LoadCommand, str_offset: u32, cmdsize: u32) -> &'a str {
    let start = lc.offset + str_offset as usize;
    let end = lc.offset + cmdsize as usize;
    let terminator = data[start..end]
        .iter()
        .position(|&b| b == 0)
        .map(|p| start + p)
        .unwrap_or(end);
    std::str::from_utf8(&data[start..terminator]).unwrap_or("")
}

fn dylib_command(lc: &LoadCommand) -> Option<&DylibCommand> {
    match &lc.command {
        CommandVariant::LoadDylib(cmd)
        | CommandVariant::LoadWeakDylib(cmd)
        | CommandVariant::ReexportDylib(cmd)
        | CommandVariant::LazyLoadDylib(cmd)
        | CommandVariant::LoadUpwardDylib(cmd) => Some(cmd),
        _ => None,
    }
}

/// Applies every edit to one thin slice. Each mutation shifts the offsets
/// of the commands behind it, so the slice is re-parsed between edits.
fn edit_slice(data: &mut Vec<u8>, edits: &MachEdits) -> Result<(), MachoError> {
    if let Some(new_id) = &edits.set_id {
        let mut replacement = None;
        {
            let macho = MachO::parse(data, 0)?;
            let ctx = parse_ctx(data)?;
            for lc in &macho.load_commands {
                if let CommandVariant::IdDylib(ref cmd) = lc.command {
                    replacement = Some((
                        macho.header,
                        ctx,
                        lc.offset,
                        cmd.cmdsize as usize,
                        build_dylib_command(new_id, cmd, ctx)?,
                        pad_end(data, &macho),
                    ));
                    break;
                }
            }
        }
        match replacement {
            Some(r) => replace_command(data, r)?,
            // bundles and executables have no LC_ID_DYLIB to rewrite
            None => tracing::debug!("no install id present, leaving it unset"),
        }
    }

    for (old_name, new_name) in &edits.change_deps {
        let mut replacement = None;
        {
            let macho = MachO::parse(data, 0)?;
            let ctx = parse_ctx(data)?;
            for lc in &macho.load_commands {
                let Some(cmd) = dylib_command(lc) else {
                    continue;
                };
                let name = read_lc_str(data, lc, cmd.dylib.name, cmd.cmdsize);
                if name == old_name {
                    replacement = Some((
                        macho.header,
                        ctx,
                        lc.offset,
                        cmd.cmdsize as usize,
                        build_dylib_command(new_name, cmd, ctx)?,
                        pad_end(data, &macho),
                    ));
                    break;
                }
            }
        }
        match replacement {
            Some(r) => replace_command(data, r)?,
            None => tracing::debug!("no dependency named {old_name:?}, nothing to change"),
        }
    }

    for del_rpath in &edits.delete_rpaths {
        let mut removal = None;
        {
            let macho = MachO::parse(data, 0)?;
            let ctx = parse_ctx(data)?;
            for lc in &macho.load_commands {
                if let CommandVariant::Rpath(ref cmd) = lc.command {
                    let path = read_lc_str(data, lc, cmd.path, cmd.cmdsize);
                    if path == del_rpath {
                        removal = Some((macho.header, ctx, lc.offset, cmd.cmdsize as usize));
                        break;
                    }
                }
            }
        }
        match removal {
            Some((mut header, ctx, offset, cmdsize)) => {
                remove_load_command(data, &mut header, ctx, offset, cmdsize)?;
            }
            None => tracing::debug!("no rpath {del_rpath:?}, nothing to delete"),
        }
    }

    for new_rpath in &edits.add_rpaths {
        let (mut header, ctx, insert_offset, cmd_buf, limit) = {
            let macho = MachO::parse(data, 0)?;
            let ctx = parse_ctx(data)?;
            let insert_offset = header_size(ctx) + macho.header.sizeofcmds as usize;
            (
                macho.header,
                ctx,
                insert_offset,
                build_rpath_command(new_rpath, ctx)?,
                pad_end(data, &macho),
            )
        };
        insert_load_command(data, &mut header, ctx, insert_offset, &cmd_buf, limit)?;
    }

    Ok(())
}

type Replacement = (Header, container::Ctx, usize, usize, Vec<u8>, usize);

fn replace_command(data: &mut Vec<u8>, replacement: Replacement) -> Result<(), MachoError> {
    let (mut header, ctx, offset, old_cmdsize, cmd_buf, limit) = replacement;
    remove_load_command(data, &mut header, ctx, offset, old_cmdsize)?;
    insert_load_command(data, &mut header, ctx, offset, &cmd_buf, limit)
}

fn parse_ctx(data: &[u8]) -> Result<container::Ctx, MachoError> {
    let (_, maybe_ctx) = parse_magic_and_ctx(data, 0)?;
    maybe_ctx.ok_or(MachoError::BuiltinEditFailed)
}

fn run_install_name_tool(
    path: &Path,
    edits: &MachEdits,
    system_tools: &SystemTools,
) -> Result<(), MachoError> {
    tracing::info!("install_name_tool for {}:\n{}", path.display(), edits);

    let mut cmd = system_tools.call(Tool::InstallNameTool)?;

    if let Some(id) = &edits.set_id {
        cmd.arg("-id").arg(id);
    }
    for (old, new) in &edits.change_deps {
        cmd.arg("-change").arg(old).arg(new);
    }
    for rpath in &edits.add_rpaths {
        cmd.arg("-add_rpath").arg(rpath);
    }
    for rpath in &edits.delete_rpaths {
        cmd.arg("-delete_rpath").arg(rpath);
    }
    cmd.arg(path);

    let output = cmd.output()?;
    if !output.status.success() {
        return Err(MachoError::InstallNameToolFailed(
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ));
    }
    Ok(())
}

/// Refreshes an invalidated signature with an ad-hoc one; dyld refuses
/// unsigned dylibs on Apple Silicon.
pub fn codesign_adhoc(path: &Path, system_tools: &SystemTools) -> Result<(), MachoError> {
    let codesign = system_tools
        .find_tool(Tool::Codesign)
        .map_err(|e| MachoError::CodesignFailed(format!("codesign not found: {e}")))?;

    let mut cmd = std::process::Command::new(&codesign);
    cmd.args(["-f", "-s", "-"]);
    if codesign.starts_with("/usr/bin/") {
        cmd.arg("--preserve-metadata=entitlements,requirements");
    }
    cmd.arg(path);

    tracing::debug!("running {cmd:?}");
    let output = cmd.output()?;
    if !output.status.success() {
        return Err(MachoError::CodesignFailed(format!(
            "status {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}
