//! Host-side services the agent calls back into
//!
//! This module provides:
//! - Granted-root checks for file access
//! - The local file system behind `fs/*` requests
//! - Terminal processes behind `terminal/*` requests

mod filesystem;
mod path_guard;
mod terminal;

pub use filesystem::{line_window, LocalFileSystem};
pub use path_guard::PathGuard;
pub(crate) use path_guard::expand_home;
pub use terminal::{TerminalHandle, TerminalRegistry};
