use anyhow::{bail, Context, Result};
use std::path::PathBuf;

use nxsas::validator::validate_container;

/// Validate a .nxc container file and print a report
pub fn run(file: PathBuf) -> Result<()> {
    if !file.exists() {
        bail!("file does not exist: {}", file.display());
    }

    let report = validate_container(&file).context("failed to read container")?;
    println!("{}", report.format_colored());

    if report.has_failures() {
        bail!("validation failed with {} error(s)", report.failure_count());
    }
    Ok(())
}
