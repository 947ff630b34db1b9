//! Discovery of the platform binaries (`install_name_tool`, `codesign`) used
//! when the built-in load command editor cannot express a change.

use std::{
    collections::HashMap,
    path::PathBuf,
    process::Command,
    sync::{Arc, Mutex},
};
use thiserror::Error;

/// Errors that can occur when working with system tools
#[derive(Error, Debug)]
pub enum ToolError {
    /// The tool was not found on the system
    #[error("failed to find `{0}` ({1})")]
    ToolNotFound(Tool, which::Error),
}

/// Platform tools the delocator may shell out to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    /// The install_name_tool binary, used as a fallback editor
    InstallNameTool,
    /// The codesign binary, used to refresh invalidated signatures
    Codesign,
}

impl std::fmt::Display for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Tool::InstallNameTool => "install_name_tool",
            Tool::Codesign => "codesign",
        })
    }
}

/// Finds and caches the platform tools. Lookups go through `which` once; the
/// resolved path is reused for every subsequent call.
#[derive(Debug, Clone, Default)]
pub struct SystemTools {
    found_tools: Arc<Mutex<HashMap<Tool, PathBuf>>>,
}

impl SystemTools {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the tool on `PATH` and return its location.
    pub fn find_tool(&self, tool: Tool) -> Result<PathBuf, which::Error> {
        if let Some(path) = self.found_tools.lock().unwrap().get(&tool) {
            return Ok(path.clone());
        }
        let path = which::which(tool.to_string())?;
        self.found_tools.lock().unwrap().insert(tool, path.clone());
        Ok(path)
    }

    /// Create a `std::process::Command` for the given tool.
    pub fn call(&self, tool: Tool) -> Result<Command, ToolError> {
        let tool_path = self
            .find_tool(tool)
            .map_err(|e| ToolError::ToolNotFound(tool, e))?;
        Ok(Command::new(tool_path))
    }
}
