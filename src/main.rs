//! # nxsas Converter
//!
//! A command-line tool for serializing bluesky document streams into
//! NeXus-structured `.nxc` container files.
//!
//! ## Usage
//!
//! ```bash
//! # Serialize a documents JSONL stream
//! nxsas convert run_documents.jsonl ./output
//!
//! # Inspect a container
//! nxsas info output/c1790369.nxc
//!
//! # Validate container integrity
//! nxsas validate output/c1790369.nxc
//!
//! # Generate and serialize a synthetic run
//! nxsas demo ./output
//! ```

use anyhow::Result;
use clap::Parser;

mod cli;

fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    cli.run()
}
