//! Image specifications, boot executable lookup and argument classification.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow, bail};
use indexmap::IndexMap;
use regex::Regex;
use tracing::{debug, info, warn};

use super::channel::{Channel, Limits};
use super::nvram::{MountAccess, MountEntry};

static ENV_ARG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^([_A-Z0-9]+)=(.*)$").expect("valid env arg regex"));

/// A parsed `path[,mountpoint[,access]]` image specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    pub path: PathBuf,
    pub mountpoint: String,
    pub access: MountAccess,
}

impl FromStr for ImageSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(',').collect();
        if parts.len() > 3 {
            bail!(
                "Invalid image specification '{}': expected path[,mountpoint[,access]]",
                s
            );
        }
        let path = parts[0];
        if path.is_empty() {
            bail!("Invalid image specification '{}': empty path", s);
        }
        let mountpoint = parts.get(1).filter(|m| !m.is_empty()).unwrap_or(&"/");
        let access = match parts.get(2).filter(|a| !a.is_empty()) {
            Some(access) => access.parse()?,
            None => MountAccess::ReadOnly,
        };

        Ok(Self {
            path: PathBuf::from(path),
            mountpoint: mountpoint.to_string(),
            access,
        })
    }
}

/// Everything the manifest and nvram builders need from the user's command line.
#[derive(Debug, Default)]
pub struct Resolution {
    /// Absolute path of the program the launcher boots.
    pub program: PathBuf,
    /// Whether `program` was extracted from an image into the boot file.
    pub extracted: bool,
    pub argv: Vec<String>,
    /// Image and file channels in discovery order.
    pub channels: Vec<Channel>,
    pub fstab: Vec<MountEntry>,
    pub file_devices: Vec<String>,
    pub env: IndexMap<String, String>,
}

/// Builds a [`Resolution`] from the command, its arguments and the images.
///
/// File arguments and images share one device counter, so devices are named
/// `/dev/<n>.<basename>` in the order they are discovered.
pub struct Resolver<'a> {
    boot: &'a Path,
    limits: Limits,
    command: String,
    devices: usize,
    images: IndexMap<PathBuf, String>,
    out: Resolution,
}

impl<'a> Resolver<'a> {
    pub fn new(command: &str, boot: &'a Path, limits: Limits) -> Result<Self> {
        let program = std::path::absolute(command)
            .with_context(|| format!("Invalid command path: {}", command))?;
        Ok(Self {
            boot,
            limits,
            command: command.to_string(),
            devices: 0,
            images: IndexMap::new(),
            out: Resolution {
                program,
                ..Resolution::default()
            },
        })
    }

    fn next_device(&mut self, path: &Path) -> String {
        self.devices += 1;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!("/dev/{}.{}", self.devices, name)
    }

    /// Classify user arguments. `@NAME=value` becomes an env entry, any other
    /// `@path` becomes a read/write file channel whose device replaces the argument.
    pub fn add_args(&mut self, args: &[String]) -> Result<()> {
        let argv0 = Path::new(&self.command)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.command.clone());
        self.out.argv.push(argv0);

        for arg in args {
            let Some(reference) = arg.strip_prefix('@') else {
                self.out.argv.push(arg.clone());
                continue;
            };

            if let Some(caps) = ENV_ARG_RE.captures(reference) {
                self.out.env.insert(caps[1].to_string(), caps[2].to_string());
                continue;
            }

            let path = std::path::absolute(reference)
                .with_context(|| format!("Invalid file argument: {}", reference))?;
            if !path.exists() {
                File::create(&path)
                    .with_context(|| format!("Failed to create file argument {}", path.display()))?;
            }
            let device = self.next_device(&path);
            debug!(file = %path.display(), device = %device, "image:file channel");
            self.out
                .channels
                .push(Channel::for_host_file(&path, device.clone(), self.limits));
            self.out.file_devices.push(device.clone());
            self.out.argv.push(device);
        }
        Ok(())
    }

    /// Register images in order. A path seen twice shares one channel but
    /// gets one mount-table entry per occurrence. The first image that
    /// contains an entry named like the command provides the boot file.
    pub fn add_images(&mut self, specs: &[ImageSpec]) -> Result<()> {
        for spec in specs {
            let path = std::path::absolute(&spec.path)
                .with_context(|| format!("Invalid image path: {}", spec.path.display()))?;
            if !path.is_file() {
                bail!("Image not found: {}", path.display());
            }

            let device = match self.images.get(&path) {
                Some(device) => device.clone(),
                None => {
                    let device = self.next_device(&path);
                    self.out
                        .channels
                        .push(Channel::for_host_file(&path, device.clone(), self.limits));
                    self.images.insert(path.clone(), device.clone());

                    if !self.out.extracted && extract_entry(&path, &self.command, self.boot)? {
                        info!(
                            image = %path.display(),
                            command = %self.command,
                            "image:extracted boot file"
                        );
                        self.out.program = self.boot.to_path_buf();
                        self.out.extracted = true;
                    }
                    device
                }
            };

            if let Some(other) = self
                .out
                .fstab
                .iter()
                .find(|e| e.mountpoint == spec.mountpoint && e.access != spec.access)
            {
                warn!(
                    mountpoint = %spec.mountpoint,
                    first = %other.device,
                    second = %device,
                    "image:mountpoint mounted twice with different access"
                );
            }

            self.out.fstab.push(MountEntry {
                device,
                mountpoint: spec.mountpoint.clone(),
                access: spec.access,
            });
        }
        Ok(())
    }

    pub fn finish(self) -> Resolution {
        if !self.out.extracted {
            debug!(
                program = %self.out.program.display(),
                "image:command not found in any image, using it as a host path"
            );
        }
        self.out
    }
}

/// Copy the archive entry named `name` into `dest`.
///
/// Returns `Ok(false)` when the archive cannot be read as tar or has no such entry.
fn extract_entry(archive: &Path, name: &str, dest: &Path) -> Result<bool> {
    let file =
        File::open(archive).with_context(|| format!("Failed to open image {}", archive.display()))?;
    let mut tar = tar::Archive::new(file);
    let entries = match tar.entries() {
        Ok(entries) => entries,
        Err(e) => {
            debug!(image = %archive.display(), error = %e, "image:not a tar archive");
            return Ok(false);
        }
    };

    let wanted = Path::new(name.trim_start_matches("./"));
    for entry in entries {
        let mut entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!(image = %archive.display(), error = %e, "image:unreadable entry");
                return Ok(false);
            }
        };
        let matches = entry
            .path()
            .map(|p| p.strip_prefix("./").unwrap_or(p.as_ref()) == wanted)
            .unwrap_or(false);
        if !matches || !entry.header().entry_type().is_file() {
            continue;
        }

        let mut out = File::create(dest)
            .with_context(|| format!("Failed to create boot file {}", dest.display()))?;
        io::copy(&mut entry, &mut out).map_err(|e| {
            let _ = fs::remove_file(dest);
            anyhow!("Failed to extract {} from {}: {}", name, archive.display(), e)
        })?;
        return Ok(true);
    }
    Ok(false)
}
