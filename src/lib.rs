//! Make macOS Python wheels self-contained.
//!
//! A wheel built on a developer machine typically links against dynamic
//! libraries outside the wheel tree. This crate copies every required
//! non-system library into a sidecar directory inside the wheel, rewrites
//! the Mach-O load commands to `@loader_path`-relative references, verifies
//! required CPU architectures, and can fuse two single-architecture wheels
//! into a universal one.

pub mod arch;
pub mod console_utils;
pub mod delocate;
pub mod fuse;
pub mod graph;
pub mod macho;
pub mod opt;
pub mod resolve;
pub mod system_tools;
pub mod utils;
pub mod wheel;
