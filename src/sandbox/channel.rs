//! A single host-resource to sandbox-device binding in the manifest.

use std::fmt;
use std::path::Path;

/// Quota the launcher treats as "effectively unbounded".
pub const UNLIMITED: u64 = 4 * 1024 * 1024 * 1024;

/// Access pattern of a channel, rendered as its numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    SeqReadSeqWrite = 0,
    // Valid launcher modes the shell itself never emits.
    #[allow(dead_code)]
    RndReadSeqWrite = 1,
    #[allow(dead_code)]
    SeqReadRndWrite = 2,
    RndReadRndWrite = 3,
}

impl AccessType {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Throughput quotas for a channel: operation counts and byte totals in each direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub reads: u64,
    pub rbytes: u64,
    pub writes: u64,
    pub wbytes: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            reads: UNLIMITED,
            rbytes: UNLIMITED,
            writes: UNLIMITED,
            wbytes: UNLIMITED,
        }
    }
}

impl Limits {
    /// Same read quotas, writes forbidden.
    pub fn read_only(self) -> Self {
        Self {
            writes: 0,
            wbytes: 0,
            ..self
        }
    }

    /// Same write quotas, reads forbidden.
    pub fn write_only(self) -> Self {
        Self {
            reads: 0,
            rbytes: 0,
            ..self
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    uri: String,
    alias: String,
    access: AccessType,
    etag: u8,
    limits: Limits,
}

impl Channel {
    pub fn new(uri: impl Into<String>, alias: impl Into<String>, access: AccessType) -> Self {
        Self {
            uri: uri.into(),
            alias: alias.into(),
            access,
            etag: 0,
            limits: Limits::default(),
        }
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    #[allow(dead_code)]
    pub fn with_etag(mut self, enabled: bool) -> Self {
        self.etag = u8::from(enabled);
        self
    }

    /// Sequential read channel, e.g. the host's stdin.
    pub fn seq_read(uri: impl Into<String>, alias: impl Into<String>, limits: Limits) -> Self {
        Self::new(uri, alias, AccessType::SeqReadSeqWrite).with_limits(limits.read_only())
    }

    /// Sequential write channel, e.g. a stdout transport FIFO.
    pub fn seq_write(uri: impl Into<String>, alias: impl Into<String>, limits: Limits) -> Self {
        Self::new(uri, alias, AccessType::SeqReadSeqWrite).with_limits(limits.write_only())
    }

    /// Random-access channel that may only be read.
    pub fn random_ro(uri: impl Into<String>, alias: impl Into<String>, limits: Limits) -> Self {
        Self::new(uri, alias, AccessType::RndReadRndWrite).with_limits(limits.read_only())
    }

    pub fn random_rw(uri: impl Into<String>, alias: impl Into<String>, limits: Limits) -> Self {
        Self::new(uri, alias, AccessType::RndReadRndWrite).with_limits(limits)
    }

    /// Random-access channel for a host file, read/write when the file is
    /// writable by us and read-only otherwise.
    pub fn for_host_file(path: &Path, alias: impl Into<String>, limits: Limits) -> Self {
        let uri = path.display().to_string();
        if is_writable(path) {
            Self::random_rw(uri, alias, limits)
        } else {
            Self::random_ro(uri, alias, limits)
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn access(&self) -> AccessType {
        self.access
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Channel = {},{},{},{},{},{},{},{}",
            self.uri,
            self.alias,
            self.access.code(),
            self.etag,
            self.limits.reads,
            self.limits.rbytes,
            self.limits.writes,
            self.limits.wbytes
        )
    }
}

fn is_writable(path: &Path) -> bool {
    nix::unistd::access(path, nix::unistd::AccessFlags::W_OK).is_ok()
}
