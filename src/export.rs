//! # Export Entry Point
//!
//! Drives a complete run — an ordered sequence of documents — through a
//! [`RunSerializer`] scoped so the output container is released on every
//! exit path, and reports the artifacts produced.
//!
//! One run per call: the caller (or an external run router) creates a
//! fresh serializer per run; nothing is shared across runs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::container::ContainerConfig;
use crate::document::Document;
use crate::serializer::{RunSerializer, SerializerError};

/// Map from artifact label to the file paths produced under it
pub type Artifacts = HashMap<String, Vec<PathBuf>>;

/// Options for a run export
#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    /// Filename template with `{field}` placeholders filled from the start
    /// document; `None` uses the run uid
    pub file_prefix: Option<String>,

    /// Settings passed through to the storage substrate
    pub container: ContainerConfig,
}

/// Serialize one run's documents into a container under `directory`
///
/// Returns the artifact map (one file under `"stream_data"`). On error the
/// container written so far is persisted and left on disk as a diagnostic
/// artifact before the error propagates.
pub fn export<I>(
    documents: I,
    directory: impl AsRef<Path>,
    options: &ExportOptions,
) -> Result<Artifacts, SerializerError>
where
    I: IntoIterator<Item = Document>,
{
    let mut serializer = RunSerializer::new(
        directory,
        options.file_prefix.clone(),
        options.container.clone(),
    );

    let mut result = Ok(());
    for document in documents {
        result = serializer.serialize(document);
        if result.is_err() {
            break;
        }
    }
    // Scoped release: the container is closed whether or not the stream
    // completed; the first error wins.
    result = result.and(serializer.close());
    result?;

    serializer.artifacts()
}

/// Like [`export`], for raw `(kind, body)` pairs from a document stream
pub fn export_json<I>(
    documents: I,
    directory: impl AsRef<Path>,
    options: &ExportOptions,
) -> Result<Artifacts, SerializerError>
where
    I: IntoIterator<Item = (String, Value)>,
{
    let mut parsed = Vec::new();
    for (kind, body) in documents {
        parsed.push(Document::from_name_and_json(&kind, body)?);
    }
    export(parsed, directory, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::Container;
    use crate::serializer::STREAM_DATA_LABEL;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_export_minimal_run() {
        let dir = tempdir().unwrap();
        let artifacts = export_json(
            [
                ("start".to_string(), json!({"uid": "u1", "plan_name": "count"})),
                ("stop".to_string(), json!({"exit_status": "success"})),
            ],
            dir.path(),
            &ExportOptions::default(),
        )
        .unwrap();

        let paths = &artifacts[STREAM_DATA_LABEL];
        assert_eq!(paths.len(), 1);
        assert!(paths[0].exists());

        let container = Container::open(&paths[0]).unwrap();
        assert_eq!(
            container.dataset("bluesky/start/plan_name").unwrap().scalar_str_value(),
            Some("count")
        );
        assert_eq!(
            container.dataset("bluesky/stop/exit_status").unwrap().scalar_str_value(),
            Some("success")
        );
    }

    #[test]
    fn test_failed_export_leaves_diagnostic_artifact() {
        let dir = tempdir().unwrap();
        let result = export_json(
            [
                ("start".to_string(), json!({"uid": "u2"})),
                // second start is out of order
                ("start".to_string(), json!({"uid": "u3"})),
            ],
            dir.path(),
            &ExportOptions::default(),
        );
        assert!(result.is_err());

        // the partial container for u2 is still on disk
        let partial = dir.path().join("u2.nxc");
        assert!(partial.exists());
        let container = Container::open(&partial).unwrap();
        assert!(container.exists("bluesky/start/uid"));
    }

    #[test]
    fn test_custom_file_prefix() {
        let dir = tempdir().unwrap();
        let options = ExportOptions {
            file_prefix: Some("{plan_name}-{uid}".to_string()),
            ..Default::default()
        };
        let artifacts = export_json(
            [
                ("start".to_string(), json!({"uid": "u4", "plan_name": "scan"})),
                ("stop".to_string(), json!({})),
            ],
            dir.path(),
            &options,
        )
        .unwrap();
        assert_eq!(
            artifacts[STREAM_DATA_LABEL][0],
            dir.path().join("scan-u4.nxc")
        );
    }
}
