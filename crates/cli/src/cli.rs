use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "webmux")]
#[command(about = "Multiplexes agent clients onto one shared browser-control connection")]
#[command(version)]
pub struct Cli {
    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Port for the Primary endpoint (default: first free port in the service range)
    #[arg(short, long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Become Primary without consulting the lock record
    #[arg(long)]
    pub force_primary: bool,

    /// Lock record path (default: the user runtime directory)
    #[arg(long, value_name = "FILE")]
    pub lock_path: Option<PathBuf>,

    /// Server source root watched for rebuilds between batches
    #[arg(long, value_name = "DIR")]
    pub server_root: Option<PathBuf>,

    /// Companion source root watched for rebuilds between batches
    #[arg(long, value_name = "DIR")]
    pub companion_root: Option<PathBuf>,

    /// Disable the batch staleness check even when roots are set
    #[arg(long)]
    pub no_staleness_check: bool,
}
