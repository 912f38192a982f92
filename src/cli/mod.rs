use clap::Parser;
use std::path::PathBuf;

pub mod render;
pub mod repl;

#[derive(Debug, Parser)]
#[command(name = "automanager")]
#[command(about = "Manage files by describing what you want done")]
#[command(version)]
pub struct Cli {
    /// Config file path (defaults to ~/.config/automanager/config.toml)
    #[arg(short = 'C', long)]
    pub config: Option<PathBuf>,

    /// Permitted root (overrides config and AUTOMANAGER_ROOT)
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Starting directory, absolute or relative to the root
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Log level or filter directive (overrides config; RUST_LOG wins over both)
    #[arg(short = 'l', long)]
    pub log_level: Option<String>,

    /// Confirm deletes and overwrites without asking (permanent deletes still ask)
    #[arg(short, long)]
    pub yes: bool,

    /// Run one request and exit
    #[arg(short = 'e', long, value_name = "REQUEST")]
    pub exec: Option<String>,
}
