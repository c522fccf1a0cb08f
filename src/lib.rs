//! # nxsas - Bluesky Runs as NeXus Container Files
//!
//! `nxsas` serializes a streamed bluesky document run — start metadata,
//! stream descriptors, timestamped event data, stop metadata — into a
//! single hierarchical container file, then overlays a NeXus instrument
//! description whose nodes are either literal values or links into the
//! raw recorded data.
//!
//! ## Key Features
//!
//! - **Incremental, schema-inferring serialization**: per-field storage is
//!   created the first time a field is seen, typed and shaped from the
//!   descriptor's declaration reconciled against the data itself, then
//!   grown batch by batch as event pages arrive.
//!
//! - **Axis-order reconciliation**: the known systematic disagreement
//!   between the device-description service and the detector service is
//!   corrected in place, once, with a warning; anything worse is fatal.
//!
//! - **Lockstep timestamps**: every value array has a parallel 8-byte
//!   float timestamp array of identical length after every append.
//!
//! - **NeXus overlay with links**: technique blocks in the start metadata
//!   are materialized at stop time as a second tree whose entries may
//!   alias raw nodes through a compact `#bluesky/...` address syntax.
//!
//! - **Single-file output**: a `.nxc` ZIP container holding a JSON tree
//!   manifest and little-endian binary payloads.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use nxsas::export::{export_json, ExportOptions};
//! use serde_json::json;
//!
//! let documents = [
//!     ("start".to_string(), json!({"uid": "c1790369", "plan_name": "scan"})),
//!     ("descriptor".to_string(), json!({
//!         "uid": "d1",
//!         "name": "primary",
//!         "data_keys": {
//!             "en_energy": {"dtype": "number", "shape": [], "source": "PY:en_energy"}
//!         }
//!     })),
//!     ("event_page".to_string(), json!({
//!         "descriptor": "d1",
//!         "data": {"en_energy": [270.0, 271.5]},
//!         "timestamps": {"en_energy": [1573882935.0, 1573882936.0]}
//!     })),
//!     ("stop".to_string(), json!({"exit_status": "success"})),
//! ];
//!
//! let artifacts = export_json(documents, "/data/runs", &ExportOptions::default())?;
//! println!("wrote {:?}", artifacts["stream_data"]);
//! # Ok::<(), nxsas::serializer::SerializerError>(())
//! ```
//!
//! ## Container Layout
//!
//! ```text
//! /
//!   bluesky/
//!     start/            <- start-document metadata, mirrored
//!     descriptors/
//!       {stream}/       <- descriptor metadata, mirrored
//!     events/
//!       {stream}/
//!         data/{field}        <- value storage, shape (N, ...)
//!         timestamps/{field}  <- timestamp storage, shape (N,), 8-byte float
//!     stop/             <- stop-document metadata, mirrored
//!   {technique groups}  <- NeXus overlay, written at stop
//! ```
//!
//! ## Architecture
//!
//! The library is organized into the following modules:
//!
//! - [`document`]: tagged document model fed by the external stream
//! - [`container`]: hierarchical storage substrate and `.nxc` archive I/O
//! - [`schema`]: data-key categories, dtype resolution, shape reconciliation
//! - [`appender`]: per-field streaming storage lifecycle
//! - [`metadata`]: recursive metadata-to-tree mirroring
//! - [`nexus`]: document-address parsing and NeXus tree materialization
//! - [`serializer`]: the run state machine orchestrating all of the above
//! - [`export`]: the one-call entry point
//! - [`validator`]: integrity checks for persisted containers

// Documentation lints - enforce complete documentation for publication
#![deny(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]

pub mod appender;
pub mod container;
pub mod document;
pub mod export;
pub mod metadata;
pub mod nexus;
pub mod schema;
pub mod serializer;
pub mod validator;

/// Re-export commonly used types for convenience
pub mod prelude {
    pub use crate::appender::{AppendError, StreamingDatasetAppender};
    pub use crate::container::{
        Container, ContainerConfig, ContainerError, DataBuf, Dataset, ElementType, Node,
        NXC_FORMAT_VERSION, NXC_MIMETYPE,
    };
    pub use crate::document::{
        DescriptorDoc, Document, DocumentError, EventPageDoc, StartDoc, StopDoc, TechniqueBlock,
    };
    pub use crate::export::{export, export_json, Artifacts, ExportOptions};
    pub use crate::metadata::{copy_metadata_to_datasets, MetadataError};
    pub use crate::nexus::{BlueskyPath, DocSection, NexusError};
    pub use crate::schema::{DataKeySpec, FieldType, SchemaError};
    pub use crate::serializer::{RunSerializer, SerializerError, STREAM_DATA_LABEL};
    pub use crate::validator::{validate_container, ValidationReport};
}
