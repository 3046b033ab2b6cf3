use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use crate::command::{self, RunOptions};
use crate::sandbox::image::ImageSpec;

#[derive(Parser, Debug)]
#[command(author, version, long_about = None)]
#[command(name = "zvsh")]
#[command(about = "Run a program inside the ZeroVM sandbox")]
#[command(after_help = "\
Arguments of the form @PATH map a host file into the sandbox;
@NAME=VALUE sets an environment variable.
Use 'zvsh gdb [GDB_ARGS]... --args <COMMAND> [ARGS]...' to debug a program.")]
struct Cli {
    /// Image to mount: PATH[,MOUNTPOINT[,ACCESS]] (defaults: /, ro). Repeatable.
    #[arg(long = "zvm-image", value_name = "IMAGE")]
    images: Vec<ImageSpec>,

    /// Write ZeroVM debug output into ./zvsh.log
    #[arg(long = "zvm-debug")]
    debug: bool,

    /// Write ZeroVM trace output into ./zvsh.trace.log
    #[arg(long = "zvm-trace")]
    trace: bool,

    /// ZeroVM debug verbosity level
    #[arg(long = "zvm-verbosity", value_name = "N")]
    verbosity: Option<u8>,

    /// Exit with the ZeroVM return code instead of the packed status
    #[arg(long = "zvm-getrc")]
    getrc: bool,

    /// Keep the generated manifest, nvram and transports in this directory
    #[arg(long = "zvm-save-dir", value_name = "DIR")]
    save_dir: Option<PathBuf>,

    /// Path to a ZeroVM executable, a program inside an image, or "gdb",
    /// followed by the arguments passed to it verbatim
    #[arg(
        value_name = "COMMAND",
        trailing_var_arg = true,
        allow_hyphen_values = true,
        required = true,
        num_args = 1..
    )]
    command_line: Vec<String>,
}

impl Cli {
    fn into_options(self) -> RunOptions {
        let mut command_line = self.command_line.into_iter();
        RunOptions {
            command: command_line.next().unwrap_or_default(),
            args: command_line.collect(),
            images: self.images,
            debug: self.debug,
            trace: self.trace,
            verbosity: self.verbosity,
            getrc: self.getrc,
            save_dir: self.save_dir,
        }
    }
}

/// Parse the command line and run it, returning the process exit status.
pub fn run() -> Result<i32> {
    let options = Cli::parse().into_options();
    if options.command == command::gdb::SENTINEL {
        command::gdb::run(&options)
    } else {
        command::run::run(&options)
    }
}
