//! Normal mode: the launcher supervised over FIFO transports.

use std::ffi::OsString;
use std::path::Path;

use anyhow::Result;
use tracing::info;

use super::{RunOptions, TRACE_LOG, absolute};
use crate::config::Config;
use crate::sandbox::prepare;
use crate::sandbox::supervisor::{Outcome, Streams, Supervisor, absorb_interrupts};
use crate::sandbox::workdir::WorkDir;

pub const LAUNCHER: &str = "zerovm";
const LAUNCHER_OPTIONS: &str = "-PQ";

pub fn run(options: &RunOptions) -> Result<i32> {
    let config = Config::load()?;
    let node = config.manifest.settings().node;
    let workdir = WorkDir::create(options.save_dir.as_deref(), node)?;

    let result = supervise(&config, &workdir, options);
    workdir.cleanup();
    let outcome = result?;

    let status = outcome.exit_status(options.getrc);
    info!(
        launcher_rc = outcome.launcher_rc,
        app_rc = outcome.app_rc,
        status,
        "run:finished"
    );
    Ok(status)
}

fn supervise(config: &Config, workdir: &WorkDir, options: &RunOptions) -> Result<Outcome> {
    workdir.create_fifos()?;
    let request = options.request()?;
    let prepared = prepare(config, workdir, &request)?;

    let trace = if options.trace {
        Some(absolute(TRACE_LOG)?)
    } else {
        None
    };
    let args = launcher_args(&prepared.manifest_path, trace.as_deref());

    absorb_interrupts();
    let files = workdir.files();
    Supervisor::new(LAUNCHER, args, workdir.path(), &files.stdout, &files.stderr)
        .run(Streams::inherit(request.stdio))
}

/// `-PQ [-T <trace>] <manifest>`
fn launcher_args(manifest: &Path, trace: Option<&Path>) -> Vec<OsString> {
    let mut args = vec![OsString::from(LAUNCHER_OPTIONS)];
    if let Some(trace) = trace {
        args.push("-T".into());
        args.push(trace.into());
    }
    args.push(manifest.into());
    args
}

#[cfg(test)]
mod tests {
    use super::launcher_args;
    use std::ffi::OsString;
    use std::path::Path;

    #[test]
    fn launcher_args_without_trace() {
        let args = launcher_args(Path::new("/tmp/zvsh-x/manifest.1"), None);
        assert_eq!(
            args,
            vec![
                OsString::from("-PQ"),
                OsString::from("/tmp/zvsh-x/manifest.1")
            ]
        );
    }

    #[test]
    fn launcher_args_with_trace() {
        let args = launcher_args(
            Path::new("/tmp/zvsh-x/manifest.1"),
            Some(Path::new("/home/u/zvsh.trace.log")),
        );
        let args: Vec<&str> = args.iter().map(|a| a.to_str().unwrap()).collect();
        assert_eq!(
            args,
            vec![
                "-PQ",
                "-T",
                "/home/u/zvsh.trace.log",
                "/tmp/zvsh-x/manifest.1"
            ]
        );
    }
}
