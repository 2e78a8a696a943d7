use anyhow::Result;
use clap::Parser;

use crate::vision::{self, LiveConfig, LiveServerArgs};

/// Live camera capture served as an annotated MJPEG stream.
#[derive(Parser, Debug)]
#[command(name = "live-vision", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub server: LiveServerArgs,
}

pub fn handle(cli: Cli) -> Result<()> {
    let config = LiveConfig::try_from(cli.server)?;
    vision::run(config)
}
