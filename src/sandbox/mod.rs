//! Translating a command line into ZeroVM launcher artifacts, and running it.

pub mod channel;
pub mod image;
pub mod manifest;
pub mod nvram;
pub mod pty;
pub mod supervisor;
pub mod workdir;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::config::Config;
use channel::Channel;
use image::{ImageSpec, Resolver};
use manifest::Manifest;
use nvram::{Nvram, StdioTty};
use workdir::WorkDir;

/// Errors that abort a run before the launcher is started.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("Unable to write '{}': file already exists", .0.display())]
    ArtifactExists(PathBuf),
    #[error("Manifest must have at least 1 channel")]
    NoChannels,
}

/// How the sandboxed program's stdout and stderr reach the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    /// FIFOs in the working directory, drained by the supervisor.
    #[default]
    Fifo,
    /// The launcher's own stdout and stderr, e.g. a debugger's pty.
    Terminal,
}

/// What the user asked to run, independent of how it was parsed.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub command: String,
    pub args: Vec<String>,
    pub images: Vec<ImageSpec>,
    /// Host file backing a `/dev/debug` write channel.
    pub debug_log: Option<PathBuf>,
    pub verbosity: Option<u8>,
    /// Replaces the configured manifest timeout.
    pub timeout: Option<u64>,
    pub stdio: StdioTty,
    pub transport: Transport,
}

/// The artifacts written into the working directory for one run.
#[derive(Debug)]
pub struct Prepared {
    pub manifest: Manifest,
    pub manifest_path: PathBuf,
    /// Absolute path of the booted program, for the debugger's symbol file.
    pub program: PathBuf,
}

/// Resolve images and arguments, then write the nvram and manifest files.
///
/// Channel order: stdin, stdout, stderr, optional debug log, file arguments
/// and images in discovery order, the program itself, and the nvram last.
pub fn prepare(config: &Config, workdir: &WorkDir, request: &RunRequest) -> Result<Prepared> {
    let files = workdir.files();
    let limits = config.limits.limits();
    let mut settings = config.manifest.settings();
    if let Some(timeout) = request.timeout {
        settings.timeout = timeout;
    }

    let (stdout, stderr) = match request.transport {
        Transport::Fifo => (files.stdout.as_path(), files.stderr.as_path()),
        Transport::Terminal => (Path::new("/dev/stdout"), Path::new("/dev/stderr")),
    };
    let mut manifest = Manifest::with_stdio(&settings, "", stdout, stderr, limits);
    if let Some(log) = &request.debug_log {
        manifest.push(Channel::seq_write(
            log.display().to_string(),
            "/dev/debug",
            limits,
        ));
    }

    let mut images = config.images()?;
    images.extend(request.images.iter().cloned());

    let mut resolver = Resolver::new(&request.command, &files.boot, limits)?;
    resolver.add_args(&request.args)?;
    resolver.add_images(&images)?;
    let resolution = resolver.finish();

    for chan in resolution.channels {
        manifest.push(chan);
    }
    let program = resolution.program;
    manifest.push(Channel::random_ro(
        program.display().to_string(),
        "/dev/self",
        limits,
    ));
    manifest.program = program.display().to_string();

    let mut nvram = Nvram::new(resolution.argv, request.stdio)?;
    nvram.fstab = resolution.fstab;
    nvram.file_devices = resolution.file_devices;
    nvram.env = config.env.clone();
    nvram.env.extend(resolution.env);
    nvram.debug_verbosity = request.verbosity;
    write_artifact(&files.nvram, &nvram.dumps())?;

    manifest.push(Channel::random_rw(
        files.nvram.display().to_string(),
        "/dev/nvram",
        limits,
    ));
    for chan in manifest.channels() {
        debug!(
            uri = chan.uri(),
            alias = chan.alias(),
            access = ?chan.access(),
            limits = ?chan.limits(),
            "sandbox:channel"
        );
    }
    write_artifact(&files.manifest, &manifest.dumps()?)?;

    info!(
        dir = %workdir.path().display(),
        retained = workdir.is_retained(),
        program = %program.display(),
        extracted = resolution.extracted,
        channels = manifest.channels().len(),
        "sandbox:artifacts written"
    );
    Ok(Prepared {
        manifest,
        manifest_path: files.manifest.clone(),
        program,
    })
}

fn write_artifact(path: &Path, contents: &str) -> Result<()> {
    debug!(path = %path.display(), bytes = contents.len(), "sandbox:writing artifact");
    fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::{RunRequest, Transport, prepare};
    use crate::config::Config;
    use crate::sandbox::image::tests::write_tar;
    use crate::sandbox::nvram::StdioTty;
    use crate::sandbox::workdir::WorkDir;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn piped_run_with_one_image() {
        let temp = TempDir::new().unwrap();
        let image = temp.path().join("python.tar");
        write_tar(&image, &[("python", b"\x7fELF")]);
        let workdir = WorkDir::create(Some(&temp.path().join("run")), 1).unwrap();
        let files = workdir.files().clone();

        let request = RunRequest {
            command: "python".to_string(),
            args: vec!["-c".to_string(), "print 1".to_string()],
            images: vec![image.display().to_string().parse().unwrap()],
            stdio: StdioTty::default(),
            ..Default::default()
        };
        let prepared = prepare(&Config::default(), &workdir, &request).unwrap();

        let aliases: Vec<&str> = prepared
            .manifest
            .channels()
            .iter()
            .map(|c| c.alias())
            .collect();
        assert_eq!(
            aliases,
            vec![
                "/dev/stdin",
                "/dev/stdout",
                "/dev/stderr",
                "/dev/1.python.tar",
                "/dev/self",
                "/dev/nvram",
            ]
        );
        assert_eq!(prepared.program, files.boot);
        assert_eq!(prepared.manifest_path, files.manifest);

        let manifest = fs::read_to_string(&files.manifest).unwrap();
        assert!(manifest.contains(&format!("Program = {}\n", files.boot.display())));
        assert!(manifest.ends_with(&format!(
            "{},/dev/nvram,3,0,4294967296,4294967296,4294967296,4294967296",
            files.nvram.display()
        )));

        let nvram = fs::read_to_string(&files.nvram).unwrap();
        assert!(nvram.starts_with("[args]\nargs = python -c print\\x201\n"));
        assert!(nvram.contains(
            "[fstab]\nchannel=/dev/1.python.tar,mountpoint=/,access=ro,removable=no\n"
        ));
        assert_eq!(nvram.matches("mode=file").count(), 3);
        assert!(nvram.contains(
            "[mapping]\n\
             channel=/dev/stdin,mode=file\n\
             channel=/dev/stdout,mode=file\n\
             channel=/dev/stderr,mode=file\n"
        ));
    }

    #[test]
    fn debug_log_timeout_and_env() {
        let temp = TempDir::new().unwrap();
        let workdir = WorkDir::create(Some(&temp.path().join("run")), 1).unwrap();
        let files = workdir.files().clone();
        let log = temp.path().join("zvsh.log");
        let mut config = Config::default();
        config.env.insert("LANG".to_string(), "C".to_string());
        config.env.insert("HOME".to_string(), "/".to_string());

        let request = RunRequest {
            command: "/opt/prog.nexe".to_string(),
            args: vec!["@HOME=/home/user, x".to_string()],
            debug_log: Some(log.clone()),
            verbosity: Some(2),
            timeout: Some(2592000),
            transport: Transport::Terminal,
            stdio: StdioTty {
                stdin: true,
                stdout: false,
                stderr: true,
            },
            ..Default::default()
        };
        let prepared = prepare(&config, &workdir, &request).unwrap();

        assert_eq!(prepared.manifest.timeout, 2592000);
        let channels = prepared.manifest.channels();
        assert_eq!(channels[1].uri(), "/dev/stdout");
        assert_eq!(channels[2].uri(), "/dev/stderr");
        assert_eq!(channels[3].alias(), "/dev/debug");
        assert_eq!(channels[3].uri(), log.display().to_string());
        assert_eq!(channels[4].alias(), "/dev/self");
        assert_eq!(channels[4].uri(), "/opt/prog.nexe");

        let nvram = fs::read_to_string(&files.nvram).unwrap();
        assert!(nvram.contains("channel=/dev/stdin,mode=char\nchannel=/dev/stdout,mode=file\n"));
        assert!(nvram.contains(
            "[env]\nname=LANG,value=C\nname=HOME,value=/home/user\\x2c\\x20x\n"
        ));
        assert!(nvram.ends_with("[debug]\nverbosity=2\n"));
        assert!(nvram.starts_with("[args]\nargs = prog.nexe\n"));
    }

    #[test]
    fn stale_artifacts_abort_before_anything_is_written() {
        let temp = TempDir::new().unwrap();
        let run = temp.path().join("run");
        fs::create_dir_all(&run).unwrap();
        fs::write(run.join("manifest.1"), "old").unwrap();

        assert!(WorkDir::create(Some(&run), 1).is_err());
        assert_eq!(fs::read_to_string(run.join("manifest.1")).unwrap(), "old");
        assert!(!run.join("stdout.1").exists());
    }
}
