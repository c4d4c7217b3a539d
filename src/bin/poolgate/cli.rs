use std::path::PathBuf;

use clap::Parser;

use poolgate::build::CLAP_LONG_VERSION;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
#[clap(long_version = CLAP_LONG_VERSION)]
pub struct Cli {
    /// Path to the JSON backend registry file
    #[arg(short, long)]
    pub config: PathBuf,
}
