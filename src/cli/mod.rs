use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod convert;
mod demo;
mod info;
mod validate;

/// nxsas - Bluesky-to-NeXus Container Converter
#[derive(Parser)]
#[command(name = "nxsas")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Verbosity level (-v for info, -vv for debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serialize a bluesky documents JSONL stream to a .nxc container
    Convert {
        /// Input documents file, one ["kind", {...}] pair per line
        #[arg(value_name = "INPUT")]
        input: PathBuf,

        /// Output directory for the container
        #[arg(value_name = "OUTPUT_DIR", default_value = ".")]
        output_dir: PathBuf,

        /// Filename template filled from start-document fields
        #[arg(short = 'p', long, default_value = "{uid}")]
        file_prefix: String,

        /// Write a compact (non-pretty) tree manifest
        #[arg(long)]
        compact_manifest: bool,
    },

    /// Display the tree of a .nxc container
    Info {
        /// Input container path
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Validate container integrity and structure
    Validate {
        /// Input container path
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Generate a synthetic run and serialize it
    Demo {
        /// Output directory for the container
        #[arg(value_name = "OUTPUT_DIR", default_value = ".")]
        output_dir: PathBuf,

        /// Number of events to generate
        #[arg(short = 'n', long, default_value = "16")]
        events: usize,
    },
}

impl Cli {
    /// Dispatch the selected subcommand
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Convert {
                input,
                output_dir,
                file_prefix,
                compact_manifest,
            } => convert::run(input, output_dir, file_prefix, compact_manifest),
            Commands::Info { file } => info::run(file),
            Commands::Validate { file } => validate::run(file),
            Commands::Demo { output_dir, events } => demo::run(output_dir, events),
        }
    }
}
