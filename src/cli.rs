use std::path::PathBuf;

use clap::Parser;

/// Server for integrating Maputnik locally.
///
/// Lets the Maputnik web editor read and save a style file on this machine,
/// and optionally pushes a notification to the editor whenever the file is
/// changed by another program.
#[derive(Parser, Debug)]
#[command(name = "maputnik", version, about, long_about = None)]
pub struct Cli {
    /// Allow access to JSON style from web client.
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Notify web client about JSON style file changes.
    #[arg(long, requires = "file")]
    pub watch: bool,

    /// Serve directory under /static/.
    #[arg(long = "static", value_name = "DIR")]
    pub static_dir: Option<PathBuf>,

    /// Address to listen on (overrides maputnik.toml).
    #[arg(long)]
    pub bind: Option<String>,

    /// Port to listen on; 0 picks a free port (overrides maputnik.toml).
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Path to the configuration file (default: ./maputnik.toml).
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short, long)]
    pub verbose: bool,
}
