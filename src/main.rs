mod cli;
mod command;
mod config;
mod logger;
mod sandbox;

use anyhow::Result;
use tracing::{error, info};

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:?}");
            1
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    logger::init()?;
    info!(args = ?std::env::args().collect::<Vec<_>>(), "zvsh start");

    match cli::run() {
        Ok(code) => {
            info!(code, "zvsh finished");
            Ok(code)
        }
        Err(err) => {
            error!(error = ?err, "zvsh failed");
            Err(err)
        }
    }
}
