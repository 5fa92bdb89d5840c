//! Raya heap archive tool
//!
//! Dumps object graphs described in JSON into heap archives, inspects and
//! verifies archive files, and trial-loads them into an in-process heap.

mod commands;
mod input;

use clap::{Parser, Subcommand, ValueEnum};
use raya_archive::LoadMode;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "raya-archive")]
#[command(about = "Raya heap archive tool", long_about = None)]
#[command(version)]
struct Cli {
    /// Show debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dump an object graph into a heap archive
    Dump {
        /// Graph description (JSON)
        #[arg(short, long)]
        graph: PathBuf,
        /// Output archive file
        #[arg(short, long)]
        out: PathBuf,
        /// Store 64-bit references instead of compressed ones
        #[arg(long)]
        wide: bool,
        /// Region alignment in bytes
        #[arg(long)]
        alignment: Option<usize>,
    },

    /// Show the header of an archive
    Info {
        /// Archive file
        file: PathBuf,
    },

    /// Check the checksum and reference maps of an archive
    Verify {
        /// Archive file
        file: PathBuf,
    },

    /// Trial-load an archive into an in-process heap
    Load {
        /// Archive file
        file: PathBuf,
        /// Loader to use
        #[arg(short, long, value_enum)]
        mode: Option<ModeArg>,
    },
}

#[derive(Copy, Clone, ValueEnum)]
enum ModeArg {
    Mapped,
    Loaded,
    Auto,
}

impl From<ModeArg> for LoadMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Mapped => LoadMode::Mapped,
            ModeArg::Loaded => LoadMode::Loaded,
            ModeArg::Auto => LoadMode::Auto,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_module("raya_archive", level)
        .parse_env("RAYA_LOG")
        .target(env_logger::Target::Stderr)
        .format_timestamp(None)
        .format_target(false)
        .init();

    match cli.command {
        Commands::Dump {
            graph,
            out,
            wide,
            alignment,
        } => commands::dump::execute(&graph, &out, wide, alignment),
        Commands::Info { file } => commands::info::execute(&file),
        Commands::Verify { file } => commands::verify::execute(&file),
        Commands::Load { file, mode } => commands::load::execute(&file, mode.map(Into::into)),
    }
}
