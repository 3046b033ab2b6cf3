pub mod gdb;
pub mod run;

use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::sandbox::image::ImageSpec;
use crate::sandbox::nvram::StdioTty;
use crate::sandbox::{RunRequest, Transport};

/// Host file behind the `/dev/debug` channel, relative to the current directory.
pub const DEBUG_LOG: &str = "zvsh.log";
/// Host file receiving the launcher trace, relative to the current directory.
pub const TRACE_LOG: &str = "zvsh.trace.log";

/// Everything the command line asked for, before any file is touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub command: String,
    pub args: Vec<String>,
    pub images: Vec<ImageSpec>,
    pub debug: bool,
    pub trace: bool,
    pub verbosity: Option<u8>,
    pub getrc: bool,
    pub save_dir: Option<PathBuf>,
}

impl RunOptions {
    /// Base request for the normal FIFO-supervised path.
    fn request(&self) -> Result<RunRequest> {
        let debug_log = if self.debug {
            Some(absolute(DEBUG_LOG)?)
        } else {
            None
        };
        Ok(RunRequest {
            command: self.command.clone(),
            args: self.args.clone(),
            images: self.images.clone(),
            debug_log,
            verbosity: self.verbosity,
            timeout: None,
            stdio: StdioTty::detect(),
            transport: Transport::Fifo,
        })
    }
}

fn absolute(name: &str) -> Result<PathBuf> {
    std::path::absolute(name).with_context(|| format!("Failed to resolve path of {}", name))
}
