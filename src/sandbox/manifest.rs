//! The launcher's primary configuration file.

use std::fmt::Write as _;
use std::path::Path;

use super::SetupError;
use super::channel::{Channel, Limits};

/// Node id of the single local worker unit.
pub const DEFAULT_NODE: u32 = 1;

/// Manifest metadata, configurable through the `manifest:` section of the config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestSettings {
    pub node: u32,
    pub version: String,
    /// Wall-clock limit in seconds, enforced by the launcher.
    pub timeout: u64,
    /// Memory budget in bytes.
    pub memory: u64,
}

impl Default for ManifestSettings {
    fn default() -> Self {
        Self {
            node: DEFAULT_NODE,
            version: "20130611".to_string(),
            timeout: 50,
            memory: 4 * 1024 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Manifest {
    pub node: u32,
    pub version: String,
    pub timeout: u64,
    pub memory: u64,
    pub overcommit: u8,
    pub program: String,
    channels: Vec<Channel>,
}

impl Manifest {
    pub fn new(settings: &ManifestSettings, program: impl Into<String>) -> Self {
        Self {
            node: settings.node,
            version: settings.version.clone(),
            timeout: settings.timeout,
            memory: settings.memory,
            overcommit: 0,
            program: program.into(),
            channels: Vec::new(),
        }
    }

    /// Manifest pre-populated with the stdio channels every run needs.
    ///
    /// stdout and stderr point at the given transport paths; the caller
    /// appends image, self and nvram channels afterwards.
    pub fn with_stdio(
        settings: &ManifestSettings,
        program: impl Into<String>,
        stdout: &Path,
        stderr: &Path,
        limits: Limits,
    ) -> Self {
        let mut manifest = Self::new(settings, program);
        manifest.push(Channel::seq_read("/dev/stdin", "/dev/stdin", limits));
        manifest.push(Channel::seq_write(
            stdout.display().to_string(),
            "/dev/stdout",
            limits,
        ));
        manifest.push(Channel::seq_write(
            stderr.display().to_string(),
            "/dev/stderr",
            limits,
        ));
        manifest
    }

    pub fn push(&mut self, channel: Channel) {
        self.channels.push(channel);
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Render the manifest text. Fails when no channel has been added.
    pub fn dumps(&self) -> Result<String, SetupError> {
        if self.channels.is_empty() {
            return Err(SetupError::NoChannels);
        }

        let mut out = String::new();
        let _ = writeln!(out, "Node = {}", self.node);
        let _ = writeln!(out, "Version = {}", self.version);
        let _ = writeln!(out, "Timeout = {}", self.timeout);
        let _ = writeln!(out, "Memory = {},{}", self.memory, self.overcommit);
        let _ = writeln!(out, "Program = {}", self.program);
        let channels: Vec<String> = self.channels.iter().map(ToString::to_string).collect();
        out.push_str(&channels.join("\n"));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::{Manifest, ManifestSettings};
    use crate::sandbox::SetupError;
    use crate::sandbox::channel::{Channel, Limits};
    use std::path::Path;

    #[test]
    fn default_manifest_text() {
        let mut man = Manifest::with_stdio(
            &ManifestSettings::default(),
            "/tmp/zvsh/boot.1",
            Path::new("/tmp/zvsh/stdout.1"),
            Path::new("/tmp/zvsh/stderr.1"),
            Limits::default(),
        );
        man.push(Channel::random_rw(
            "/tmp/zvsh/nvram.1",
            "/dev/nvram",
            Limits::default(),
        ));

        let lim = 4294967296u64;
        let expected = format!(
            "Node = 1\n\
             Version = 20130611\n\
             Timeout = 50\n\
             Memory = 4294967296,0\n\
             Program = /tmp/zvsh/boot.1\n\
             Channel = /dev/stdin,/dev/stdin,0,0,{lim},{lim},0,0\n\
             Channel = /tmp/zvsh/stdout.1,/dev/stdout,0,0,0,0,{lim},{lim}\n\
             Channel = /tmp/zvsh/stderr.1,/dev/stderr,0,0,0,0,{lim},{lim}\n\
             Channel = /tmp/zvsh/nvram.1,/dev/nvram,3,0,{lim},{lim},{lim},{lim}"
        );
        assert_eq!(man.dumps().unwrap(), expected);
    }

    #[test]
    fn single_channel_manifest() {
        let settings = ManifestSettings {
            node: 2,
            timeout: 10,
            memory: 1024,
            ..ManifestSettings::default()
        };
        let limits = Limits {
            reads: 2048,
            rbytes: 2048,
            writes: 2048,
            wbytes: 2048,
        };
        let mut man = Manifest::new(&settings, "/tmp/zvsh/boot.2");
        man.push(Channel::random_rw("/path/to/foo.tar", "/dev/foo.tar", limits));

        assert_eq!(
            man.dumps().unwrap(),
            "Node = 2\n\
             Version = 20130611\n\
             Timeout = 10\n\
             Memory = 1024,0\n\
             Program = /tmp/zvsh/boot.2\n\
             Channel = /path/to/foo.tar,/dev/foo.tar,3,0,2048,2048,2048,2048"
        );
    }

    #[test]
    fn empty_manifest_is_rejected() {
        let man = Manifest::new(&ManifestSettings::default(), "/tmp/zvsh/boot.1");
        assert!(matches!(man.dumps(), Err(SetupError::NoChannels)));
    }
}
