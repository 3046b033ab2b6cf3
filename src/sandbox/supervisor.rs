//! Supervision of the sandbox launcher process.
//!
//! The launcher's own stdout carries only its status report. The sandboxed
//! program's output arrives through the two transport FIFOs in the working
//! directory, so four roles run on their own threads while the launcher
//! lives:
//!
//! - real stdin -> launcher stdin pipe
//! - stderr FIFO -> real stderr
//! - stdout FIFO -> real stdout
//! - launcher stdout -> report buffer
//!
//! Opening a FIFO blocks until the other end is opened, so the forwarders
//! start right after the launcher is spawned and never before anything else
//! the launcher waits on.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info, warn};

use super::nvram::StdioTty;

/// Application return code used when the launcher report cannot be parsed.
pub const UNKNOWN_RETURN_CODE: i32 = -255;

const CHUNK_SIZE: usize = 65535;
const REPORT_RC_PREFIX: &str = "user return code = ";
const RELEASE_POLL: Duration = Duration::from_millis(10);

/// Extract the application return code from the third line of the launcher report.
pub fn parse_return_code(report: &str) -> Result<i32> {
    let line = report
        .split('\n')
        .nth(2)
        .ok_or_else(|| anyhow!("Launcher report has fewer than 3 lines"))?;
    if let Ok(rc) = line.trim().parse() {
        return Ok(rc);
    }
    line.trim()
        .strip_prefix(REPORT_RC_PREFIX)
        .and_then(|rest| rest.trim().parse().ok())
        .ok_or_else(|| anyhow!("Unrecognized return code line in launcher report: {:?}", line))
}

/// Result of one supervised launcher run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub launcher_rc: i32,
    pub app_rc: i32,
}

impl Outcome {
    /// Exit status for the caller: the raw launcher code when `raw_launcher_rc`
    /// is set, otherwise `app_rc | launcher_rc << 4`.
    pub fn exit_status(&self, raw_launcher_rc: bool) -> i32 {
        if raw_launcher_rc {
            self.launcher_rc
        } else {
            self.app_rc | (self.launcher_rc << 4)
        }
    }

    pub fn succeeded(&self) -> bool {
        self.launcher_rc == 0
    }
}

/// Exit code of a finished process; a signal `n` maps to `-n`.
pub fn status_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| -status.signal().unwrap_or(0))
}

/// True when `bytes` contains a control byte outside the printable set.
pub fn is_binary(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .any(|&b| b < 0x20 && !matches!(b, 7 | 8 | 9 | 10 | 12 | 13 | 27))
}

/// Print every regular file of `dir`, then the raw report, then the launcher code.
///
/// Files that cannot be read are logged and skipped; only a failing `out`
/// aborts the dump.
pub fn dump_diagnostics(
    dir: &Path,
    report: &str,
    launcher_rc: i32,
    out: &mut dyn Write,
) -> io::Result<()> {
    let mut paths: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| fs::metadata(path).map(|m| m.is_file()).unwrap_or(false))
            .collect(),
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "supervisor:cannot list workdir");
            Vec::new()
        }
    };
    paths.sort();

    for path in paths {
        let contents = match fs::read(&path) {
            Ok(contents) => contents,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "supervisor:cannot read artifact");
                continue;
            }
        };
        if is_binary(&contents[..contents.len().min(1024)]) {
            writeln!(out, "{} is a binary file", path.display())?;
            continue;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        writeln!(out, "{0}{1}{0}", "-".repeat(10), name)?;
        writeln!(out, "{}", String::from_utf8_lossy(&contents))?;
        writeln!(out, "{}", "-".repeat(25))?;
    }

    out.write_all(report.as_bytes())?;
    writeln!(out, "ERROR: ZeroVM return code is {}", launcher_rc)?;
    out.flush()
}

/// The host-side streams the supervisor forwards to and from.
pub struct Streams {
    pub stdin: Box<dyn Read + Send>,
    pub stdout: Box<dyn Write + Send>,
    pub stderr: Box<dyn Write + Send>,
    /// Destination of the failure dump.
    pub diagnostics: Box<dyn Write + Send>,
    pub tty: StdioTty,
}

impl Streams {
    /// The process's real standard streams.
    pub fn inherit(tty: StdioTty) -> Self {
        Self {
            stdin: Box::new(io::stdin()),
            stdout: Box::new(io::stdout()),
            stderr: Box::new(io::stderr()),
            diagnostics: Box::new(io::stderr()),
            tty,
        }
    }
}

/// Absorb SIGINT so supervision always reaches its finalize step.
///
/// The launcher shares our process group and receives the interrupt itself.
pub fn absorb_interrupts() {
    if let Err(e) = ctrlc::set_handler(|| debug!("supervisor:interrupt absorbed")) {
        warn!(error = %e, "supervisor:failed to install interrupt handler");
    }
}

pub struct Supervisor {
    program: OsString,
    args: Vec<OsString>,
    workdir: PathBuf,
    stdout_fifo: PathBuf,
    stderr_fifo: PathBuf,
}

impl Supervisor {
    pub fn new(
        program: impl Into<OsString>,
        args: Vec<OsString>,
        workdir: &Path,
        stdout_fifo: &Path,
        stderr_fifo: &Path,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            workdir: workdir.to_path_buf(),
            stdout_fifo: stdout_fifo.to_path_buf(),
            stderr_fifo: stderr_fifo.to_path_buf(),
        }
    }

    /// Spawn the launcher, forward stdio until it exits, and report the outcome.
    ///
    /// A failed launcher (non-zero exit) is not an error here: the scratch
    /// directory and report are dumped to `streams.diagnostics` instead.
    pub fn run(self, streams: Streams) -> Result<Outcome> {
        let Streams {
            stdin,
            stdout,
            stderr,
            mut diagnostics,
            tty,
        } = streams;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .with_context(|| {
                format!(
                    "Failed to start sandbox launcher '{}'",
                    self.program.to_string_lossy()
                )
            })?;
        info!(pid = child.id(), program = ?self.program, args = ?self.args, "supervisor:spawned");

        let pipe_in = child.stdin.take();
        let pipe_out = child.stdout.take();
        let (Some(pipe_in), Some(mut pipe_out)) = (pipe_in, pipe_out) else {
            let _ = child.kill();
            let _ = child.wait();
            bail!("Sandbox launcher was spawned without stdio pipes");
        };

        // Not joined: it may stay blocked on a terminal read after the launcher exits.
        let _stdin_role = spawn_role("stdin", move || relay_input(stdin, pipe_in, tty.stdin));

        let stderr_fifo = self.stderr_fifo.clone();
        let stderr_role = spawn_role("stderr", move || {
            relay_fifo(&stderr_fifo, stderr, tty.stderr)
        });
        let stdout_fifo = self.stdout_fifo.clone();
        let stdout_role = spawn_role("stdout", move || {
            relay_fifo(&stdout_fifo, stdout, tty.stdout)
        });

        let report_role = thread::Builder::new()
            .name("zvsh-report".to_string())
            .spawn(move || -> io::Result<Vec<u8>> {
                let mut report = Vec::new();
                pipe_out.read_to_end(&mut report)?;
                Ok(report)
            });

        let status = child.wait().context("Failed to wait for sandbox launcher")?;
        let launcher_rc = status_code(status);
        info!(launcher_rc, "supervisor:launcher exited");

        let report = match report_role.map(|h| h.join()) {
            Ok(Ok(Ok(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
            Ok(Ok(Err(e))) => {
                warn!(error = %e, "supervisor:report read failed");
                String::new()
            }
            Ok(Err(_)) => {
                warn!("supervisor:report thread panicked");
                String::new()
            }
            Err(e) => {
                warn!(error = %e, "supervisor:report thread failed to start");
                String::new()
            }
        };

        let app_rc = match parse_return_code(&report) {
            Ok(rc) => rc,
            Err(e) => {
                warn!(error = %e, "supervisor:unparseable report");
                UNKNOWN_RETURN_CODE
            }
        };
        let outcome = Outcome {
            launcher_rc,
            app_rc,
        };

        if outcome.succeeded() {
            join_role(stdout_role, &self.stdout_fifo);
            join_role(stderr_role, &self.stderr_fifo);
        } else if let Err(e) =
            dump_diagnostics(&self.workdir, &report, launcher_rc, &mut *diagnostics)
        {
            warn!(error = %e, "supervisor:diagnostic dump failed");
        }

        debug!(?outcome, "supervisor:done");
        Ok(outcome)
    }
}

fn spawn_role<F>(role: &'static str, f: F) -> Option<JoinHandle<()>>
where
    F: FnOnce() -> io::Result<u64> + Send + 'static,
{
    let spawned = thread::Builder::new()
        .name(format!("zvsh-{role}"))
        .spawn(move || match f() {
            Ok(bytes) => debug!(role, bytes, "supervisor:role finished"),
            Err(e) => warn!(role, error = %e, "supervisor:role failed"),
        });
    match spawned {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(role, error = %e, "supervisor:failed to spawn role");
            None
        }
    }
}

/// Wait for a FIFO forwarder, unblocking it if it is still waiting for a writer.
fn join_role(role: Option<JoinHandle<()>>, fifo: &Path) {
    let Some(handle) = role else { return };
    while !handle.is_finished() {
        release_fifo(fifo);
        thread::sleep(RELEASE_POLL);
    }
    if handle.join().is_err() {
        warn!(fifo = %fifo.display(), "supervisor:forwarder panicked");
    }
}

/// Open and immediately close the write end so a reader blocked in `open` sees EOF.
fn release_fifo(fifo: &Path) {
    // ENXIO here just means no reader is waiting.
    let _ = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(fifo);
}

fn relay_input(
    input: Box<dyn Read + Send>,
    mut pipe: impl Write,
    line_mode: bool,
) -> io::Result<u64> {
    let total = if line_mode {
        copy_lines(BufReader::new(input), &mut pipe)
    } else {
        copy_chunks(input, &mut pipe)
    };
    drop(pipe);
    total
}

fn relay_fifo(fifo: &Path, mut out: Box<dyn Write + Send>, line_mode: bool) -> io::Result<u64> {
    let file = File::open(fifo)?;
    if line_mode {
        copy_lines(BufReader::new(file), &mut out)
    } else {
        copy_chunks(file, &mut out)
    }
}

fn copy_lines(mut reader: impl BufRead, out: &mut impl Write) -> io::Result<u64> {
    let mut line = Vec::new();
    let mut total = 0u64;
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            return Ok(total);
        }
        out.write_all(&line)?;
        out.flush()?;
        total += line.len() as u64;
    }
}

fn copy_chunks(mut reader: impl Read, out: &mut impl Write) -> io::Result<u64> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        out.write_all(&buf[..n])?;
        out.flush()?;
        total += n as u64;
    }
}
