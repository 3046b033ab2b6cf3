//! Debug mode: the debug launcher under the NaCl gdb, relayed through a pty.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use tracing::info;

use super::RunOptions;
use crate::config::Config;
use crate::sandbox::nvram::StdioTty;
use crate::sandbox::supervisor::absorb_interrupts;
use crate::sandbox::workdir::WorkDir;
use crate::sandbox::{Transport, prepare, pty};

/// Command name that selects this path.
pub const SENTINEL: &str = "gdb";
pub const DEBUGGER: &str = "x86_64-nacl-gdb";
const LAUNCHER: &str = "zerovm-dbg";
const LAUNCHER_OPTIONS: &str = "-sPQ";
/// Thirty days.
pub const DEBUG_TIMEOUT: u64 = 60 * 60 * 24 * 30;
const SCRIPT_NAME: &str = "debug.scp";
/// Load address of the untrusted program's text segment.
const SYMBOL_BASE: &str = "0x440a00020000";

/// Arguments after `gdb`, split at `--args`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebuggerArgs {
    pub gdb_args: Vec<String>,
    pub command: String,
    pub args: Vec<String>,
}

impl DebuggerArgs {
    pub fn split(args: &[String]) -> Result<Self> {
        let Some(pos) = args.iter().position(|a| a == "--args") else {
            bail!("Usage: zvsh gdb [GDB_ARGS]... --args <COMMAND> [ARGS]...");
        };
        let (gdb_args, rest) = args.split_at(pos);
        let (command, args) = rest[1..]
            .split_first()
            .ok_or_else(|| anyhow!("No command given after '--args'"))?;
        Ok(Self {
            gdb_args: gdb_args.to_vec(),
            command: command.clone(),
            args: args.to_vec(),
        })
    }
}

pub fn debug_script(program: &Path) -> String {
    format!(
        "set confirm off\n\
         b CreateSession\n\
         r\n\
         b main\n\
         add-symbol-file {} {}\n\
         shell clear\n\
         c\n\
         d br\n",
        program.display(),
        SYMBOL_BASE
    )
}

fn command_line(
    debugger: &Path,
    script: &Path,
    gdb_args: &[String],
    manifest: &Path,
) -> Vec<String> {
    let mut argv = vec![
        debugger.display().to_string(),
        format!("--command={}", script.display()),
    ];
    argv.extend(gdb_args.iter().cloned());
    argv.push("--args".to_string());
    argv.push(LAUNCHER.to_string());
    argv.push(LAUNCHER_OPTIONS.to_string());
    argv.push(manifest.display().to_string());
    argv
}

pub fn run(options: &RunOptions) -> Result<i32> {
    let split = DebuggerArgs::split(&options.args)?;
    let debugger =
        which::which(DEBUGGER).with_context(|| format!("{} not found in PATH", DEBUGGER))?;

    let config = Config::load()?;
    let node = config.manifest.settings().node;
    let workdir = WorkDir::create(options.save_dir.as_deref(), node)?;

    let result = debug(&config, &workdir, options, &split, &debugger);
    workdir.cleanup();
    let rc = result?;
    info!(rc, "gdb:finished");
    Ok(rc)
}

fn debug(
    config: &Config,
    workdir: &WorkDir,
    options: &RunOptions,
    split: &DebuggerArgs,
    debugger: &Path,
) -> Result<i32> {
    let mut request = options.request()?;
    request.command = split.command.clone();
    request.args = split.args.clone();
    request.timeout = Some(DEBUG_TIMEOUT);
    request.transport = Transport::Terminal;
    // The launcher's stdio is the pty slave.
    request.stdio = StdioTty {
        stdin: true,
        stdout: true,
        stderr: true,
    };
    let prepared = prepare(config, workdir, &request)?;

    let script = workdir.path().join(SCRIPT_NAME);
    fs::write(&script, debug_script(&prepared.program))
        .with_context(|| format!("Failed to write {}", script.display()))?;

    let argv = command_line(debugger, &script, &split.gdb_args, &prepared.manifest_path);
    info!(argv = ?argv, "gdb:starting");
    println!("{}", argv.join(" "));
    absorb_interrupts();
    pty::spawn(&argv)
}
