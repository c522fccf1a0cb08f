use anyhow::{bail, Context, Result};
use log::info;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use nxsas::container::ContainerConfig;
use nxsas::export::{export_json, ExportOptions};
use nxsas::serializer::STREAM_DATA_LABEL;
use serde_json::Value;

/// Serialize a bluesky documents JSONL stream from disk
pub fn run(
    input: PathBuf,
    output_dir: PathBuf,
    file_prefix: String,
    compact_manifest: bool,
) -> Result<()> {
    if !input.exists() {
        bail!("input file does not exist: {}", input.display());
    }

    let reader = BufReader::new(File::open(&input).context("failed to open input")?);
    let mut documents = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(&line)
            .with_context(|| format!("line {} is not valid JSON", index + 1))?;
        documents.push(split_pair(value, index + 1)?);
    }
    info!(
        "read {} document(s) from {}",
        documents.len(),
        input.display()
    );

    let options = ExportOptions {
        file_prefix: Some(file_prefix),
        container: ContainerConfig {
            pretty_manifest: !compact_manifest,
            ..Default::default()
        },
    };
    let artifacts = export_json(documents, &output_dir, &options)
        .context("failed to serialize document stream")?;

    for path in &artifacts[STREAM_DATA_LABEL] {
        println!("{}", path.display());
    }
    Ok(())
}

/// Accept both `["kind", {...}]` pairs and `{"name": ..., "doc": ...}` lines
fn split_pair(value: Value, line: usize) -> Result<(String, Value)> {
    match value {
        Value::Array(pair) if pair.len() == 2 => {
            let mut iter = pair.into_iter();
            match (iter.next(), iter.next()) {
                (Some(Value::String(kind)), Some(body)) => Ok((kind, body)),
                _ => bail!("line {line}: expected [\"kind\", document] pair"),
            }
        }
        Value::Object(mut map) => {
            let kind = match map.remove("name") {
                Some(Value::String(kind)) => kind,
                _ => bail!("line {line}: object form requires a string 'name'"),
            };
            let body = match map.remove("doc") {
                Some(body) => body,
                None => bail!("line {line}: object form requires 'doc'"),
            };
            Ok((kind, body))
        }
        _ => bail!("line {line}: expected [\"kind\", document] pair"),
    }
}
