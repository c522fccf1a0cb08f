//! # Run Serializer
//!
//! The top-level orchestrator: one instance serializes exactly one run.
//! Documents arrive in the stream's fixed relative order and drive a
//! strict state machine:
//!
//! ```text
//! UNSTARTED --start--> STARTED --(descriptor | event_page)*--> --stop--> STOPPED
//! ```
//!
//! `start` opens the output container (named from a user-supplied template
//! filled with start-document fields) and mirrors the start metadata.
//! Each `descriptor` opens a stream section; each `event_page` appends to
//! its stream's per-field storage. `stop` mirrors the stop metadata,
//! materializes every technique block's NeXus tree, and closes the
//! container. After that the serializer is inert.
//!
//! The container is released exactly once on every exit path: normally at
//! `stop`, or by the container's drop guard when a run is abandoned
//! mid-stream, leaving the partial file as a diagnostic artifact.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::appender::{AppendError, StreamingDatasetAppender, BLUESKY_GROUP};
use crate::container::{Container, ContainerConfig, ContainerError};
use crate::document::{
    DescriptorDoc, Document, DocumentError, EventPageDoc, StartDoc, StopDoc,
};
use crate::metadata::{copy_metadata_to_datasets, MetadataError};
use crate::nexus::{materialize_technique, NexusError};

/// Label under which produced artifacts are reported
pub const STREAM_DATA_LABEL: &str = "stream_data";

/// Default filename template; the run uid is always present and unique
pub const DEFAULT_FILE_PREFIX: &str = "{uid}";

/// Errors that can occur while serializing a run
#[derive(Debug, thiserror::Error)]
pub enum SerializerError {
    /// A document failed to parse
    #[error(transparent)]
    Document(#[from] DocumentError),

    /// The storage substrate rejected an operation
    #[error("container error: {0}")]
    Container(#[from] ContainerError),

    /// Metadata mirroring failed
    #[error(transparent)]
    Metadata(#[from] MetadataError),

    /// Event data could not be appended
    #[error(transparent)]
    Append(#[from] AppendError),

    /// A technique block failed to materialize
    #[error(transparent)]
    Nexus(#[from] NexusError),

    /// A document arrived outside the run lifecycle order
    #[error("'{kind}' document arrived while the serializer is {state}")]
    OutOfOrder {
        /// Kind of the offending document
        kind: &'static str,
        /// Serializer state at arrival
        state: &'static str,
    },

    /// Two descriptors declared the same stream name
    #[error("stream '{0}' was already declared")]
    DuplicateStream(String),

    /// An event page references a descriptor never seen
    #[error("event_page references unknown descriptor '{0}'")]
    UnknownDescriptor(String),

    /// The filename template names an absent start-document field
    #[error("file prefix template references '{placeholder}', absent from the start document")]
    MissingTemplateField {
        /// The offending placeholder
        placeholder: String,
    },

    /// The filename template itself is malformed
    #[error("file prefix template is malformed: {0}")]
    BadTemplate(String),

    /// The artifact accessor was queried before any start document
    #[error("no artifacts have been created yet")]
    ArtifactsRequestedTooEarly,
}

/// Run lifecycle states, in strict order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Unstarted,
    Started,
    Stopped,
}

impl RunState {
    fn name(self) -> &'static str {
        match self {
            RunState::Unstarted => "unstarted",
            RunState::Started => "started",
            RunState::Stopped => "stopped",
        }
    }
}

/// Serializes one run's document stream into one output container
pub struct RunSerializer {
    directory: PathBuf,
    file_prefix: String,
    config: ContainerConfig,

    state: RunState,
    container: Option<Container>,
    output_path: Option<PathBuf>,
    start: Option<StartDoc>,
    /// Descriptors by uid; event pages reference streams by descriptor uid
    descriptors: HashMap<String, DescriptorDoc>,
    stream_names: HashSet<String>,
    appender: StreamingDatasetAppender,
}

impl RunSerializer {
    /// New serializer writing into `directory`
    ///
    /// `file_prefix` may contain `{field}` placeholders filled from the
    /// start document's top-level fields; `None` uses [`DEFAULT_FILE_PREFIX`].
    pub fn new<P: AsRef<Path>>(
        directory: P,
        file_prefix: Option<String>,
        config: ContainerConfig,
    ) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
            file_prefix: file_prefix.unwrap_or_else(|| DEFAULT_FILE_PREFIX.to_string()),
            config,
            state: RunState::Unstarted,
            container: None,
            output_path: None,
            start: None,
            descriptors: HashMap::new(),
            stream_names: HashSet::new(),
            appender: StreamingDatasetAppender::new(),
        }
    }

    /// Route one document through the state machine
    pub fn serialize(&mut self, document: Document) -> Result<(), SerializerError> {
        match document {
            Document::Start(doc) => self.on_start(doc),
            Document::Descriptor(doc) => self.on_descriptor(doc),
            Document::EventPage(page) => self.on_event_page(page),
            Document::Stop(doc) => self.on_stop(doc),
        }
    }

    /// Artifacts produced so far: the output file, keyed by
    /// [`STREAM_DATA_LABEL`]
    ///
    /// Querying before a start document has been processed is a usage
    /// error.
    pub fn artifacts(&self) -> Result<HashMap<String, Vec<PathBuf>>, SerializerError> {
        let path = self
            .output_path
            .clone()
            .ok_or(SerializerError::ArtifactsRequestedTooEarly)?;
        Ok(HashMap::from([(STREAM_DATA_LABEL.to_string(), vec![path])]))
    }

    /// Release the output container, persisting whatever has been written
    ///
    /// Called implicitly at `stop`; safe to call again on any exit path.
    pub fn close(&mut self) -> Result<(), SerializerError> {
        if let Some(container) = self.container.as_mut() {
            container.close()?;
        }
        Ok(())
    }

    fn expect_state(&self, kind: &'static str, expected: RunState) -> Result<(), SerializerError> {
        if self.state != expected {
            return Err(SerializerError::OutOfOrder {
                kind,
                state: self.state.name(),
            });
        }
        Ok(())
    }

    fn container_mut(&mut self) -> &mut Container {
        // Only reachable in STARTED state, which on_start enters after
        // storing the container.
        match self.container.as_mut() {
            Some(container) => container,
            None => unreachable!("container exists while the run is started"),
        }
    }

    fn on_start(&mut self, doc: StartDoc) -> Result<(), SerializerError> {
        self.expect_state("start", RunState::Unstarted)?;
        log::info!("new run detected uid={}", doc.uid);

        let prefix = format_file_prefix(&self.file_prefix, &doc.raw)?;
        let filename = format!("{prefix}.nxc");
        let output_path = self.directory.join(&filename);
        log::info!(
            "creating container {} in directory {}",
            filename,
            self.directory.display()
        );

        let mut container = Container::create(&output_path, self.config.clone())?;
        // Four fixed sections: start metadata plus empty placeholders.
        container.create_group(&format!("{BLUESKY_GROUP}/start"))?;
        copy_metadata_to_datasets(&doc.raw, &mut container, &format!("{BLUESKY_GROUP}/start"))?;
        container.create_group(&format!("{BLUESKY_GROUP}/descriptors"))?;
        container.create_group(&format!("{BLUESKY_GROUP}/events"))?;
        container.create_group(&format!("{BLUESKY_GROUP}/stop"))?;

        self.container = Some(container);
        self.output_path = Some(output_path);
        self.start = Some(doc);
        self.state = RunState::Started;
        Ok(())
    }

    fn on_descriptor(&mut self, doc: DescriptorDoc) -> Result<(), SerializerError> {
        self.expect_state("descriptor", RunState::Started)?;
        if !self.stream_names.insert(doc.name.clone()) {
            return Err(SerializerError::DuplicateStream(doc.name));
        }
        log::info!("new stream '{}' (descriptor uid={})", doc.name, doc.uid);

        let descriptor_group = format!("{BLUESKY_GROUP}/descriptors/{}", doc.name);
        let container = self.container_mut();
        container.create_group(&descriptor_group)?;
        copy_metadata_to_datasets(&doc.raw, container, &descriptor_group)?;

        // Per-field storage is created lazily on first data; only the
        // stream's data/timestamps sections exist up front.
        container.create_group(&format!("{BLUESKY_GROUP}/events/{}/data", doc.name))?;
        container.create_group(&format!("{BLUESKY_GROUP}/events/{}/timestamps", doc.name))?;

        self.appender.declare_stream(&doc.name, doc.data_keys.keys());
        self.descriptors.insert(doc.uid.clone(), doc);
        Ok(())
    }

    fn on_event_page(&mut self, page: EventPageDoc) -> Result<(), SerializerError> {
        self.expect_state("event_page", RunState::Started)?;
        let descriptor = self
            .descriptors
            .get_mut(&page.descriptor)
            .ok_or_else(|| SerializerError::UnknownDescriptor(page.descriptor.clone()))?;
        let stream = descriptor.name.clone();
        log::debug!(
            "event_page with {} event(s) for stream '{}'",
            page.events(),
            stream
        );
        let container = match self.container.as_mut() {
            Some(container) => container,
            None => unreachable!("container exists while the run is started"),
        };
        self.appender
            .append_page(container, &stream, &page, &mut descriptor.data_keys)?;
        Ok(())
    }

    fn on_stop(&mut self, doc: StopDoc) -> Result<(), SerializerError> {
        self.expect_state("stop", RunState::Started)?;
        let container = self.container_mut();
        copy_metadata_to_datasets(&doc.raw, container, &format!("{BLUESKY_GROUP}/stop"))?;

        // All raw data is durably written; technique payloads may now link
        // to any of it.
        let start = match self.start.as_ref() {
            Some(start) => start,
            None => unreachable!("start document recorded while the run is started"),
        };
        let techniques = start.techniques()?;
        let container = match self.container.as_mut() {
            Some(container) => container,
            None => unreachable!("container exists while the run is started"),
        };
        for block in &techniques {
            materialize_technique(container, block)?;
        }

        let written = container.close()?;
        log::info!("finished writing {}", written.display());
        self.state = RunState::Stopped;
        Ok(())
    }
}

/// Fill a `{field}` filename template from start-document fields
///
/// String values substitute verbatim, anything else as its JSON text.
/// Referencing an absent field is a hard error.
fn format_file_prefix(
    template: &str,
    start: &Map<String, Value>,
) -> Result<String, SerializerError> {
    let mut result = String::with_capacity(template.len());
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '{' {
            result.push(c);
            continue;
        }
        let mut placeholder = String::new();
        loop {
            match chars.next() {
                Some('}') => break,
                Some(c) => placeholder.push(c),
                None => {
                    return Err(SerializerError::BadTemplate(format!(
                        "unterminated placeholder in '{template}'"
                    )))
                }
            }
        }
        if placeholder.is_empty() {
            return Err(SerializerError::BadTemplate(format!(
                "empty placeholder in '{template}'"
            )));
        }
        let value = start
            .get(&placeholder)
            .ok_or(SerializerError::MissingTemplateField { placeholder })?;
        match value {
            Value::String(s) => result.push_str(s),
            other => result.push_str(&other.to_string()),
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn doc(kind: &str, body: Value) -> Document {
        Document::from_name_and_json(kind, body).expect("document")
    }

    fn serializer(dir: &Path) -> RunSerializer {
        RunSerializer::new(dir, None, ContainerConfig::default())
    }

    #[test]
    fn test_artifacts_before_start_is_a_usage_error() {
        let dir = tempdir().unwrap();
        let s = serializer(dir.path());
        assert!(matches!(
            s.artifacts(),
            Err(SerializerError::ArtifactsRequestedTooEarly)
        ));
    }

    #[test]
    fn test_artifacts_after_start() {
        let dir = tempdir().unwrap();
        let mut s = serializer(dir.path());
        s.serialize(doc("start", json!({"uid": "u1"}))).unwrap();

        let artifacts = s.artifacts().unwrap();
        let paths = &artifacts[STREAM_DATA_LABEL];
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0], dir.path().join("u1.nxc"));
    }

    #[test]
    fn test_documents_out_of_order_are_rejected() {
        let dir = tempdir().unwrap();

        let mut s = serializer(dir.path());
        assert!(matches!(
            s.serialize(doc("stop", json!({}))),
            Err(SerializerError::OutOfOrder { kind: "stop", state: "unstarted" })
        ));

        let mut s = serializer(dir.path());
        s.serialize(doc("start", json!({"uid": "u2"}))).unwrap();
        assert!(matches!(
            s.serialize(doc("start", json!({"uid": "u3"}))),
            Err(SerializerError::OutOfOrder { kind: "start", state: "started" })
        ));

        s.serialize(doc("stop", json!({"exit_status": "success"}))).unwrap();
        assert!(matches!(
            s.serialize(doc("descriptor", json!({
                "uid": "d1", "name": "primary", "data_keys": {}
            }))),
            Err(SerializerError::OutOfOrder { kind: "descriptor", state: "stopped" })
        ));
    }

    #[test]
    fn test_missing_template_field_fails_at_start() {
        let dir = tempdir().unwrap();
        let mut s = RunSerializer::new(
            dir.path(),
            Some("{plan_name}-{uid}".to_string()),
            ContainerConfig::default(),
        );
        let err = s.serialize(doc("start", json!({"uid": "u1"}))).unwrap_err();
        assert!(matches!(
            err,
            SerializerError::MissingTemplateField { placeholder } if placeholder == "plan_name"
        ));
    }

    #[test]
    fn test_duplicate_stream_rejected() {
        let dir = tempdir().unwrap();
        let mut s = serializer(dir.path());
        s.serialize(doc("start", json!({"uid": "u1"}))).unwrap();
        s.serialize(doc("descriptor", json!({
            "uid": "d1", "name": "primary", "data_keys": {}
        })))
        .unwrap();
        assert!(matches!(
            s.serialize(doc("descriptor", json!({
                "uid": "d2", "name": "primary", "data_keys": {}
            }))),
            Err(SerializerError::DuplicateStream(_))
        ));
    }

    #[test]
    fn test_event_page_for_unknown_descriptor_rejected() {
        let dir = tempdir().unwrap();
        let mut s = serializer(dir.path());
        s.serialize(doc("start", json!({"uid": "u1"}))).unwrap();
        assert!(matches!(
            s.serialize(doc("event_page", json!({
                "descriptor": "mystery",
                "data": {"x": [1.0]},
                "timestamps": {"x": [1.0]},
            }))),
            Err(SerializerError::UnknownDescriptor(_))
        ));
    }

    #[test]
    fn test_format_file_prefix_substitutions() {
        let start = match json!({"uid": "abc", "plan_name": "scan", "scan_id": 6852}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        assert_eq!(format_file_prefix("{uid}", &start).unwrap(), "abc");
        assert_eq!(
            format_file_prefix("{plan_name}-{scan_id}-{uid}", &start).unwrap(),
            "scan-6852-abc"
        );
        assert_eq!(format_file_prefix("data", &start).unwrap(), "data");
        assert!(matches!(
            format_file_prefix("{oops", &start),
            Err(SerializerError::BadTemplate(_))
        ));
        assert!(matches!(
            format_file_prefix("{}", &start),
            Err(SerializerError::BadTemplate(_))
        ));
    }

    #[test]
    fn test_close_before_stop_persists_partial_run() {
        let dir = tempdir().unwrap();
        let mut s = serializer(dir.path());
        s.serialize(doc("start", json!({"uid": "u9", "plan_name": "scan"}))).unwrap();
        s.close().unwrap();

        let reopened = crate::container::Container::open(dir.path().join("u9.nxc")).unwrap();
        assert_eq!(
            reopened.dataset("bluesky/start/plan_name").unwrap().scalar_str_value(),
            Some("scan")
        );
        // stop placeholder exists even though no stop document arrived
        assert!(reopened.exists("bluesky/stop"));
    }
}
