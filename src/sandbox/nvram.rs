//! Boot configuration read by the sandboxed program's own initializer.
//!
//! The initializer's ini parser is minimal: it treats `,` like a newline and
//! splits the argument list on raw spaces. Every argv element and env value
//! therefore goes through [`escape`] before it is written.

use std::fmt::{self, Write as _};
use std::io::IsTerminal;
use std::str::FromStr;

use anyhow::{Result, bail};
use indexmap::IndexMap;

const ESCAPED_CHARS: [char; 5] = ['\\', '"', ',', ' ', '\n'];

/// Replace each character the initializer cannot read verbatim with `\xNN`.
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if ESCAPED_CHARS.contains(&c) {
            let _ = write!(out, "\\x{:02x}", c as u32);
        } else {
            out.push(c);
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MountAccess {
    #[default]
    ReadOnly,
    ReadWrite,
}

impl FromStr for MountAccess {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ro" => Ok(Self::ReadOnly),
            "rw" => Ok(Self::ReadWrite),
            other => bail!("Invalid mount access '{}': expected 'ro' or 'rw'", other),
        }
    }
}

impl fmt::Display for MountAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadOnly => f.write_str("ro"),
            Self::ReadWrite => f.write_str("rw"),
        }
    }
}

/// One row of the sandbox mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub mountpoint: String,
    pub access: MountAccess,
}

/// Which of the real standard streams are terminals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StdioTty {
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
}

impl StdioTty {
    pub fn detect() -> Self {
        Self {
            stdin: std::io::stdin().is_terminal(),
            stdout: std::io::stdout().is_terminal(),
            stderr: std::io::stderr().is_terminal(),
        }
    }
}

fn mode(is_tty: bool) -> &'static str {
    if is_tty { "char" } else { "file" }
}

#[derive(Debug, Clone, Default)]
pub struct Nvram {
    argv: Vec<String>,
    pub fstab: Vec<MountEntry>,
    /// Devices of user file arguments, mapped as regular files.
    pub file_devices: Vec<String>,
    pub env: IndexMap<String, String>,
    pub debug_verbosity: Option<u8>,
    pub stdio: StdioTty,
}

impl Nvram {
    /// `argv` must hold at least the program name.
    pub fn new(argv: Vec<String>, stdio: StdioTty) -> Result<Self> {
        if argv.is_empty() {
            bail!("nvram argv must contain the program name");
        }
        Ok(Self {
            argv,
            stdio,
            ..Self::default()
        })
    }

    pub fn dumps(&self) -> String {
        let mut out = String::from("[args]\n");
        let args: Vec<String> = self.argv.iter().map(|a| escape(a)).collect();
        let _ = writeln!(out, "args = {}", args.join(" "));

        out.push_str("[fstab]\n");
        for entry in &self.fstab {
            let _ = writeln!(
                out,
                "channel={},mountpoint={},access={},removable=no",
                entry.device, entry.mountpoint, entry.access
            );
        }

        out.push_str("[mapping]\n");
        for (name, is_tty) in [
            ("stdin", self.stdio.stdin),
            ("stdout", self.stdio.stdout),
            ("stderr", self.stdio.stderr),
        ] {
            let _ = writeln!(out, "channel=/dev/{},mode={}", name, mode(is_tty));
        }
        for device in &self.file_devices {
            let _ = writeln!(out, "channel={},mode=file", device);
        }

        if !self.env.is_empty() {
            out.push_str("[env]\n");
            for (name, value) in &self.env {
                let _ = writeln!(out, "name={},value={}", name, escape(value));
            }
        }

        if let Some(verbosity) = self.debug_verbosity {
            let _ = writeln!(out, "[debug]\nverbosity={}", verbosity);
        }

        out
    }
}
