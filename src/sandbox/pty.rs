//! Pseudo-terminal relay used when a debugger drives the sandbox.

use std::fs::File;
use std::io::{self, IsTerminal, Read, Write};
use std::os::fd::OwnedFd;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::thread;

use anyhow::{Context, Result, bail};
use crossterm::terminal;
use nix::pty::{Winsize, openpty};
use tracing::{debug, warn};

use super::supervisor::status_code;

/// Restores cooked mode when dropped.
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> Option<Self> {
        if !io::stdin().is_terminal() {
            debug!("pty:stdin is not a terminal, staying in cooked mode");
            return None;
        }
        match terminal::enable_raw_mode() {
            Ok(()) => Some(Self),
            Err(e) => {
                warn!(error = %e, "pty:failed to enter raw mode");
                None
            }
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = terminal::disable_raw_mode() {
            warn!(error = %e, "pty:failed to restore terminal mode");
        }
    }
}

fn current_winsize() -> Winsize {
    let (cols, rows) = terminal::size().unwrap_or((80, 24));
    Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

/// Run `argv` on a fresh pseudo-terminal sized like ours and relay the real
/// terminal to it in raw mode until the child closes its side.
///
/// Returns the child's exit code.
pub fn spawn(argv: &[String]) -> Result<i32> {
    let raw = RawModeGuard::enable();
    let result = relay(argv, Box::new(io::stdin()), &mut io::stdout());
    drop(raw);
    result
}

fn relay(argv: &[String], input: Box<dyn Read + Send>, output: &mut dyn Write) -> Result<i32> {
    let Some((program, args)) = argv.split_first() else {
        bail!("pty spawn requires a program");
    };

    let pty = openpty(&current_winsize(), None).context("Failed to open pseudo-terminal")?;
    let slave_fd = |fd: &OwnedFd| -> Result<Stdio> {
        Ok(Stdio::from(fd.try_clone().context("Failed to duplicate pty slave")?))
    };

    // `cmd` holds duplicates of the slave; they must be closed before the
    // relay can see EOF.
    let mut child = {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(slave_fd(&pty.slave)?)
            .stdout(slave_fd(&pty.slave)?)
            .stderr(slave_fd(&pty.slave)?);
        // SAFETY: only async-signal-safe calls between fork and exec.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() < 0 {
                    return Err(io::Error::last_os_error());
                }
                if libc::ioctl(0, libc::TIOCSCTTY as _, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to start {}", program))?;
        child
    };
    drop(pty.slave);
    debug!(pid = child.id(), program = %program, "pty:spawned");

    let mut master_in = File::from(
        pty.master
            .try_clone()
            .context("Failed to duplicate pty master")?,
    );
    // Not joined: blocks on the real stdin until the process exits.
    let _ = thread::Builder::new()
        .name("zvsh-pty-input".to_string())
        .spawn(move || {
            let mut input = input;
            if let Err(e) = io::copy(&mut input, &mut master_in) {
                debug!(error = %e, "pty:input relay stopped");
            }
        });

    let mut master_out = File::from(pty.master);
    let mut buf = [0u8; 4096];
    loop {
        match master_out.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if output
                    .write_all(&buf[..n])
                    .and_then(|_| output.flush())
                    .is_err()
                {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            // EIO once the last slave descriptor is closed.
            Err(_) => break,
        }
    }

    let status = child.wait().context("Failed to wait for debugger")?;
    Ok(status_code(status))
}

#[cfg(test)]
mod tests {
    use super::relay;
    use std::io;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn run_with_deadline(script: &str) -> (i32, String) {
        let argv: Vec<String> = ["/bin/sh", "-c", script]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut out = Vec::new();
            let rc = relay(&argv, Box::new(io::empty()), &mut out).unwrap();
            let _ = tx.send((rc, String::from_utf8_lossy(&out).into_owned()));
        });
        rx.recv_timeout(Duration::from_secs(10))
            .expect("relay did not return after the child exited")
    }

    #[test]
    fn relay_returns_child_exit_code() {
        let (rc, out) = run_with_deadline("echo hi; exit 3");
        assert_eq!(rc, 3);
        assert!(out.contains("hi"), "{out:?}");
    }

    #[test]
    fn child_sees_a_terminal() {
        let (rc, _) = run_with_deadline("test -t 0 && test -t 1");
        assert_eq!(rc, 0);
    }
}
