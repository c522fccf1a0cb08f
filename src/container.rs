//! # Hierarchical Container Module
//!
//! Storage substrate for serialized runs: an in-memory tree of groups,
//! datasets, attributes, and links, persisted as a single `.nxc` ZIP
//! archive when the container is closed.
//!
//! ## Container Layout
//!
//! ```text
//! {name}.nxc (ZIP archive)
//! ├── mimetype                  # "application/vnd.nxc" (uncompressed, first entry)
//! ├── tree.json                 # Hierarchy manifest (Deflate compressed)
//! └── data/{node-path}.bin      # Little-endian numeric dataset payloads (Stored)
//! ```
//!
//! The `tree.json` manifest records every group, dataset, attribute, and
//! link. Numeric payloads live in separate `data/` entries so large arrays
//! never pass through a JSON encoder; string and boolean payloads are small
//! and stay inline in the manifest.
//!
//! ## Semantics
//!
//! - Datasets are typed and shaped. A dataset whose shape has a leading row
//!   axis may grow by whole batches of rows; rows already written are never
//!   mutated.
//! - A link is a named alias to another node in the same container. The
//!   target node is authoritative; the link carries its own attributes.
//! - `close()` persists the archive exactly once. Dropping an unclosed
//!   container performs a best-effort persist so a partially written run is
//!   left on disk as a diagnostic artifact.

use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde_json::{json, Map, Value};
use zip::write::SimpleFileOptions;
use zip::CompressionMethod;
use zip::ZipWriter;

/// MIME type for `.nxc` container files
pub const NXC_MIMETYPE: &str = "application/vnd.nxc";

/// Container format version written into the manifest
pub const NXC_FORMAT_VERSION: &str = "0.1.0";

/// Errors that can occur during container operations
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// ZIP archive error
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Manifest serialization error
    #[error("manifest JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Output path is unusable
    #[error("invalid container path: {0}")]
    InvalidPath(String),

    /// A node already exists where a new one was to be created
    #[error("node already exists: {0}")]
    NodeExists(String),

    /// No node at the given path
    #[error("no node at path: {0}")]
    NotFound(String),

    /// A non-group node was found where a group is required
    #[error("not a group: {0}")]
    NotAGroup(String),

    /// A non-dataset node was found where a dataset is required
    #[error("not a dataset: {0}")]
    NotADataset(String),

    /// Appended rows do not match the dataset's element type
    #[error("element type mismatch appending to {path}: dataset is {expected}, batch is {got}")]
    DtypeMismatch {
        /// Dataset path
        path: String,
        /// Element type of the existing dataset
        expected: ElementType,
        /// Element type of the incoming batch
        got: ElementType,
    },

    /// Appended rows do not match the dataset's per-row shape
    #[error("row shape mismatch appending to {path}: expected {expected} elements per batch, got {got}")]
    RowShapeMismatch {
        /// Dataset path
        path: String,
        /// Expected flat element count for the batch
        expected: usize,
        /// Actual flat element count supplied
        got: usize,
    },

    /// The dataset has no leading row axis and cannot grow
    #[error("dataset is not appendable: {0}")]
    NotAppendable(String),

    /// The archive being opened is not a valid container
    #[error("bad container manifest: {0}")]
    BadManifest(String),
}

/// Element storage types supported by container datasets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    /// Variable-length string
    Str,
    /// 8-byte IEEE float
    F64,
    /// 8-byte signed integer
    I64,
    /// 4-byte signed integer
    I32,
    /// Boolean
    Bool,
}

impl ElementType {
    /// Short dtype code used in the manifest (numpy-style)
    pub fn code(&self) -> &'static str {
        match self {
            ElementType::Str => "str",
            ElementType::F64 => "f8",
            ElementType::I64 => "i8",
            ElementType::I32 => "i4",
            ElementType::Bool => "b1",
        }
    }

    fn from_code(code: &str) -> Option<Self> {
        match code {
            "str" => Some(ElementType::Str),
            "f8" => Some(ElementType::F64),
            "i8" => Some(ElementType::I64),
            "i4" => Some(ElementType::I32),
            "b1" => Some(ElementType::Bool),
            _ => None,
        }
    }
}

impl std::fmt::Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Flat, typed element storage backing a dataset
#[derive(Debug, Clone, PartialEq)]
pub enum DataBuf {
    /// 8-byte floats
    F64(Vec<f64>),
    /// 8-byte signed integers
    I64(Vec<i64>),
    /// 4-byte signed integers
    I32(Vec<i32>),
    /// Booleans
    Bool(Vec<bool>),
    /// Variable-length strings
    Str(Vec<String>),
}

impl DataBuf {
    /// Element type of this buffer
    pub fn element_type(&self) -> ElementType {
        match self {
            DataBuf::F64(_) => ElementType::F64,
            DataBuf::I64(_) => ElementType::I64,
            DataBuf::I32(_) => ElementType::I32,
            DataBuf::Bool(_) => ElementType::Bool,
            DataBuf::Str(_) => ElementType::Str,
        }
    }

    /// Number of flat elements held
    pub fn len(&self) -> usize {
        match self {
            DataBuf::F64(v) => v.len(),
            DataBuf::I64(v) => v.len(),
            DataBuf::I32(v) => v.len(),
            DataBuf::Bool(v) => v.len(),
            DataBuf::Str(v) => v.len(),
        }
    }

    /// True when no elements are held
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empty buffer of the given element type
    pub fn empty(dtype: ElementType) -> Self {
        match dtype {
            ElementType::F64 => DataBuf::F64(Vec::new()),
            ElementType::I64 => DataBuf::I64(Vec::new()),
            ElementType::I32 => DataBuf::I32(Vec::new()),
            ElementType::Bool => DataBuf::Bool(Vec::new()),
            ElementType::Str => DataBuf::Str(Vec::new()),
        }
    }

    fn extend_from(&mut self, other: DataBuf) -> bool {
        match (self, other) {
            (DataBuf::F64(a), DataBuf::F64(b)) => a.extend(b),
            (DataBuf::I64(a), DataBuf::I64(b)) => a.extend(b),
            (DataBuf::I32(a), DataBuf::I32(b)) => a.extend(b),
            (DataBuf::Bool(a), DataBuf::Bool(b)) => a.extend(b),
            (DataBuf::Str(a), DataBuf::Str(b)) => a.extend(b),
            _ => return false,
        }
        true
    }
}

/// Attribute map attached to every node
pub type AttrMap = Map<String, Value>;

/// A typed, shaped dataset
#[derive(Debug, Clone)]
pub struct Dataset {
    /// Element storage type
    pub dtype: ElementType,
    /// Dataset shape; empty for scalars
    pub shape: Vec<usize>,
    /// Flat row-major element storage
    pub buf: DataBuf,
    /// Attributes attached to this dataset
    pub attrs: AttrMap,
}

impl Dataset {
    fn new(dtype: ElementType, shape: Vec<usize>, buf: DataBuf) -> Self {
        Self {
            dtype,
            shape,
            buf,
            attrs: AttrMap::new(),
        }
    }

    /// Scalar string dataset
    pub fn scalar_str(value: impl Into<String>) -> Self {
        Self::new(ElementType::Str, vec![], DataBuf::Str(vec![value.into()]))
    }

    /// Scalar 8-byte float dataset
    pub fn scalar_f64(value: f64) -> Self {
        Self::new(ElementType::F64, vec![], DataBuf::F64(vec![value]))
    }

    /// Scalar 8-byte integer dataset
    pub fn scalar_i64(value: i64) -> Self {
        Self::new(ElementType::I64, vec![], DataBuf::I64(vec![value]))
    }

    /// Scalar boolean dataset
    pub fn scalar_bool(value: bool) -> Self {
        Self::new(ElementType::Bool, vec![], DataBuf::Bool(vec![value]))
    }

    /// One-dimensional string dataset
    pub fn str_vec(values: Vec<String>) -> Self {
        let n = values.len();
        Self::new(ElementType::Str, vec![n], DataBuf::Str(values))
    }

    /// One-dimensional 8-byte float dataset
    pub fn f64_vec(values: Vec<f64>) -> Self {
        let n = values.len();
        Self::new(ElementType::F64, vec![n], DataBuf::F64(values))
    }

    /// One-dimensional 8-byte integer dataset
    pub fn i64_vec(values: Vec<i64>) -> Self {
        let n = values.len();
        Self::new(ElementType::I64, vec![n], DataBuf::I64(values))
    }

    /// One-dimensional boolean dataset
    pub fn bool_vec(values: Vec<bool>) -> Self {
        let n = values.len();
        Self::new(ElementType::Bool, vec![n], DataBuf::Bool(values))
    }

    /// Empty appendable dataset with a leading row axis of length zero
    pub fn appendable(dtype: ElementType, row_shape: &[usize]) -> Self {
        let mut shape = Vec::with_capacity(row_shape.len() + 1);
        shape.push(0);
        shape.extend_from_slice(row_shape);
        Self::new(dtype, shape, DataBuf::empty(dtype))
    }

    /// Number of rows in the leading axis; 1 for scalars
    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(1)
    }

    /// Flat element count per row in the leading axis
    pub fn row_elements(&self) -> usize {
        self.shape.iter().skip(1).product()
    }

    /// Float payload, if this dataset holds 8-byte floats
    pub fn as_f64(&self) -> Option<&[f64]> {
        match &self.buf {
            DataBuf::F64(v) => Some(v),
            _ => None,
        }
    }

    /// 8-byte integer payload, if present
    pub fn as_i64(&self) -> Option<&[i64]> {
        match &self.buf {
            DataBuf::I64(v) => Some(v),
            _ => None,
        }
    }

    /// 4-byte integer payload, if present
    pub fn as_i32(&self) -> Option<&[i32]> {
        match &self.buf {
            DataBuf::I32(v) => Some(v),
            _ => None,
        }
    }

    /// Boolean payload, if present
    pub fn as_bool(&self) -> Option<&[bool]> {
        match &self.buf {
            DataBuf::Bool(v) => Some(v),
            _ => None,
        }
    }

    /// String payload, if present
    pub fn as_str_slice(&self) -> Option<&[String]> {
        match &self.buf {
            DataBuf::Str(v) => Some(v),
            _ => None,
        }
    }

    /// Scalar string value, if this is a scalar string dataset
    pub fn scalar_str_value(&self) -> Option<&str> {
        if !self.shape.is_empty() {
            return None;
        }
        self.as_str_slice().and_then(|v| v.first()).map(|s| s.as_str())
    }

    /// Scalar float value, if this is a scalar float dataset
    pub fn scalar_f64_value(&self) -> Option<f64> {
        if !self.shape.is_empty() {
            return None;
        }
        self.as_f64().and_then(|v| v.first()).copied()
    }

    /// Scalar 8-byte integer value, if this is a scalar integer dataset
    pub fn scalar_i64_value(&self) -> Option<i64> {
        if !self.shape.is_empty() {
            return None;
        }
        self.as_i64().and_then(|v| v.first()).copied()
    }
}

/// A named alias to another node in the same container
#[derive(Debug, Clone)]
pub struct LinkNode {
    /// Container path of the target node
    pub target: String,
    /// Attributes attached to the link itself
    pub attrs: AttrMap,
}

/// A group of named child nodes
#[derive(Debug, Clone, Default)]
pub struct Group {
    /// Attributes attached to this group
    pub attrs: AttrMap,
    /// Child nodes in insertion order
    pub children: Vec<(String, Node)>,
}

impl Group {
    fn child(&self, name: &str) -> Option<&Node> {
        self.children
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, node)| node)
    }

    fn child_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.children
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, node)| node)
    }

    fn insert(&mut self, name: &str, node: Node) {
        self.children.push((name.to_string(), node));
    }
}

/// A node in the container tree
#[derive(Debug, Clone)]
pub enum Node {
    /// A group of named children
    Group(Group),
    /// A typed, shaped dataset
    Dataset(Dataset),
    /// An alias to another node
    Link(LinkNode),
}

impl Node {
    /// One-word node kind for diagnostics and the `info` listing
    pub fn kind(&self) -> &'static str {
        match self {
            Node::Group(_) => "group",
            Node::Dataset(_) => "dataset",
            Node::Link(_) => "link",
        }
    }
}

/// Configuration for container persistence
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Pretty-print the `tree.json` manifest
    pub pretty_manifest: bool,
    /// Deflate-compress the manifest entry
    pub compress_manifest: bool,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            pretty_manifest: true,
            compress_manifest: true,
        }
    }
}

/// A hierarchical container bound to one output file
///
/// The tree lives in memory while a run is being serialized and is written
/// out as a ZIP archive on [`Container::close`]. Dropping an unclosed
/// container persists whatever was written so far.
#[derive(Debug)]
pub struct Container {
    root: Group,
    output_path: PathBuf,
    config: ContainerConfig,
    finalized: bool,
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

impl Container {
    /// Create a new, empty container bound to `path`
    ///
    /// Parent directories are created if missing. An existing file at
    /// `path` will be overwritten when the container is closed.
    pub fn create<P: AsRef<Path>>(path: P, config: ContainerConfig) -> Result<Self, ContainerError> {
        let output_path = path.as_ref().to_path_buf();
        if output_path.to_string_lossy().is_empty() {
            return Err(ContainerError::InvalidPath("empty path".to_string()));
        }
        if let Some(parent) = output_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(Self {
            root: Group::default(),
            output_path,
            config,
            finalized: false,
        })
    }

    /// Path of the archive this container persists to
    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Root group of the tree
    pub fn root(&self) -> &Group {
        &self.root
    }

    fn group_mut(&mut self, path: &str, create: bool) -> Result<&mut Group, ContainerError> {
        let mut current = &mut self.root;
        let mut walked = String::new();
        for seg in segments(path) {
            if !walked.is_empty() {
                walked.push('/');
            }
            walked.push_str(seg);
            if current.child(seg).is_none() {
                if !create {
                    return Err(ContainerError::NotFound(walked));
                }
                current.insert(seg, Node::Group(Group::default()));
            }
            current = match current.child_mut(seg) {
                Some(Node::Group(g)) => g,
                Some(_) => return Err(ContainerError::NotAGroup(walked)),
                None => unreachable!("child inserted above"),
            };
        }
        Ok(current)
    }

    /// Create a group at `path`, erroring if a node already exists there
    ///
    /// Intermediate groups are created as needed.
    pub fn create_group(&mut self, path: &str) -> Result<(), ContainerError> {
        let segs = segments(path);
        let Some((name, parents)) = segs.split_last() else {
            return Err(ContainerError::InvalidPath(path.to_string()));
        };
        let parent = self.group_mut(&parents.join("/"), true)?;
        if parent.child(name).is_some() {
            return Err(ContainerError::NodeExists(path.to_string()));
        }
        parent.insert(name, Node::Group(Group::default()));
        Ok(())
    }

    /// Create a group at `path` if absent; succeed silently if one exists
    pub fn ensure_group(&mut self, path: &str) -> Result<(), ContainerError> {
        self.group_mut(path, true).map(|_| ())
    }

    /// Store a dataset at `path`, erroring if a node already exists there
    pub fn put_dataset(&mut self, path: &str, dataset: Dataset) -> Result<(), ContainerError> {
        let segs = segments(path);
        let Some((name, parents)) = segs.split_last() else {
            return Err(ContainerError::InvalidPath(path.to_string()));
        };
        let parent = self.group_mut(&parents.join("/"), true)?;
        if parent.child(name).is_some() {
            return Err(ContainerError::NodeExists(path.to_string()));
        }
        parent.insert(name, Node::Dataset(dataset));
        Ok(())
    }

    /// Replace the value of an existing dataset, keeping its attributes
    pub fn replace_dataset(&mut self, path: &str, dataset: Dataset) -> Result<(), ContainerError> {
        let existing = self.dataset_node_mut(path)?;
        let attrs = std::mem::take(&mut existing.attrs);
        *existing = dataset;
        existing.attrs = attrs;
        Ok(())
    }

    /// Append `nrows` rows of flat elements to an appendable dataset
    ///
    /// The dataset must have a leading row axis; `batch` must hold exactly
    /// `nrows * row_elements` elements of the dataset's element type. Rows
    /// already written are never touched.
    pub fn append_rows(
        &mut self,
        path: &str,
        batch: DataBuf,
        nrows: usize,
    ) -> Result<(), ContainerError> {
        let path_owned = path.to_string();
        let dataset = self.dataset_node_mut(path)?;
        if dataset.shape.is_empty() {
            return Err(ContainerError::NotAppendable(path_owned));
        }
        if batch.element_type() != dataset.dtype {
            return Err(ContainerError::DtypeMismatch {
                path: path_owned,
                expected: dataset.dtype,
                got: batch.element_type(),
            });
        }
        let expected = nrows * dataset.row_elements();
        if batch.len() != expected {
            return Err(ContainerError::RowShapeMismatch {
                path: path_owned,
                expected,
                got: batch.len(),
            });
        }
        if !dataset.buf.extend_from(batch) {
            unreachable!("element types verified above");
        }
        dataset.shape[0] += nrows;
        Ok(())
    }

    /// Create a link at `path` aliasing the node at `target`
    pub fn link(&mut self, path: &str, target: &str) -> Result<(), ContainerError> {
        if self.node(target).is_none() {
            return Err(ContainerError::NotFound(target.to_string()));
        }
        let segs = segments(path);
        let Some((name, parents)) = segs.split_last() else {
            return Err(ContainerError::InvalidPath(path.to_string()));
        };
        let parent = self.group_mut(&parents.join("/"), true)?;
        if parent.child(name).is_some() {
            return Err(ContainerError::NodeExists(path.to_string()));
        }
        parent.insert(
            name,
            Node::Link(LinkNode {
                target: segments(target).join("/"),
                attrs: AttrMap::new(),
            }),
        );
        Ok(())
    }

    /// Set an attribute on the node at `path`
    pub fn set_attr(
        &mut self,
        path: &str,
        name: &str,
        value: Value,
    ) -> Result<(), ContainerError> {
        let node = self
            .node_mut(path)
            .ok_or_else(|| ContainerError::NotFound(path.to_string()))?;
        let attrs = match node {
            Node::Group(g) => &mut g.attrs,
            Node::Dataset(d) => &mut d.attrs,
            Node::Link(l) => &mut l.attrs,
        };
        attrs.insert(name.to_string(), value);
        Ok(())
    }

    /// Set an attribute on the root group itself
    pub fn set_root_attr(&mut self, name: &str, value: Value) {
        self.root.attrs.insert(name.to_string(), value);
    }

    /// Attributes of the node at `path`
    pub fn attrs(&self, path: &str) -> Result<&AttrMap, ContainerError> {
        let node = self
            .node(path)
            .ok_or_else(|| ContainerError::NotFound(path.to_string()))?;
        Ok(match node {
            Node::Group(g) => &g.attrs,
            Node::Dataset(d) => &d.attrs,
            Node::Link(l) => &l.attrs,
        })
    }

    /// Node at `path`, without following links
    pub fn node(&self, path: &str) -> Option<&Node> {
        let mut current = &self.root;
        let segs = segments(path);
        let (last, parents) = segs.split_last()?;
        for seg in parents {
            match current.child(seg) {
                Some(Node::Group(g)) => current = g,
                _ => return None,
            }
        }
        current.child(last)
    }

    fn node_mut(&mut self, path: &str) -> Option<&mut Node> {
        let mut current = &mut self.root;
        let segs = segments(path);
        let (last, parents) = segs.split_last()?;
        for seg in parents {
            match current.child_mut(seg) {
                Some(Node::Group(g)) => current = g,
                _ => return None,
            }
        }
        current.child_mut(last)
    }

    /// True when a node exists at `path`
    pub fn exists(&self, path: &str) -> bool {
        self.node(path).is_some()
    }

    /// Node at `path`, following a link in final position to its target
    pub fn resolve(&self, path: &str) -> Result<&Node, ContainerError> {
        let node = self
            .node(path)
            .ok_or_else(|| ContainerError::NotFound(path.to_string()))?;
        match node {
            Node::Link(l) => self
                .node(&l.target)
                .ok_or_else(|| ContainerError::NotFound(l.target.clone())),
            other => Ok(other),
        }
    }

    /// Dataset at `path`, following a link in final position
    pub fn dataset(&self, path: &str) -> Result<&Dataset, ContainerError> {
        match self.resolve(path)? {
            Node::Dataset(d) => Ok(d),
            _ => Err(ContainerError::NotADataset(path.to_string())),
        }
    }

    fn dataset_node_mut(&mut self, path: &str) -> Result<&mut Dataset, ContainerError> {
        match self.node_mut(path) {
            Some(Node::Dataset(d)) => Ok(d),
            Some(_) => Err(ContainerError::NotADataset(path.to_string())),
            None => Err(ContainerError::NotFound(path.to_string())),
        }
    }

    /// Persist the container archive
    ///
    /// The first call writes the archive and marks the container finalized;
    /// later calls are no-ops returning the output path, so the artifact is
    /// released exactly once whichever path unwinds first.
    pub fn close(&mut self) -> Result<PathBuf, ContainerError> {
        if !self.finalized {
            self.persist()?;
            self.finalized = true;
        }
        Ok(self.output_path.clone())
    }

    fn persist(&self) -> Result<(), ContainerError> {
        let file = File::create(&self.output_path)?;
        let mut zip_writer = ZipWriter::new(BufWriter::new(file));

        // mimetype first, uncompressed
        let stored = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Stored)
            .unix_permissions(0o644);
        zip_writer.start_file("mimetype", stored)?;
        zip_writer.write_all(NXC_MIMETYPE.as_bytes())?;

        let manifest = json!({
            "format_version": NXC_FORMAT_VERSION,
            "created": chrono::Utc::now().to_rfc3339(),
            "writer": format!("nxsas v{}", env!("CARGO_PKG_VERSION")),
            "root": group_to_manifest(&self.root, ""),
        });
        let manifest_bytes = if self.config.pretty_manifest {
            serde_json::to_vec_pretty(&manifest)?
        } else {
            serde_json::to_vec(&manifest)?
        };
        let manifest_options = SimpleFileOptions::default()
            .compression_method(if self.config.compress_manifest {
                CompressionMethod::Deflated
            } else {
                CompressionMethod::Stored
            })
            .unix_permissions(0o644);
        zip_writer.start_file("tree.json", manifest_options)?;
        zip_writer.write_all(&manifest_bytes)?;

        write_binary_payloads(&mut zip_writer, &self.root, "")?;

        let inner = zip_writer.finish()?;
        inner.into_inner().map_err(|e| {
            ContainerError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("failed to flush container buffer: {}", e.error()),
            ))
        })?;
        Ok(())
    }

    /// Read a persisted container archive back into memory
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ContainerError> {
        let output_path = path.as_ref().to_path_buf();
        let file = File::open(&output_path)?;
        let mut archive = zip::ZipArchive::new(file)?;

        let manifest: Value = {
            let mut entry = archive.by_name("tree.json")?;
            let mut text = String::new();
            entry.read_to_string(&mut text)?;
            serde_json::from_str(&text)?
        };
        let root_value = manifest
            .get("root")
            .ok_or_else(|| ContainerError::BadManifest("missing root".to_string()))?;
        let root_node = node_from_manifest(root_value, "", &mut archive)?;
        let root = match root_node {
            Node::Group(g) => g,
            _ => return Err(ContainerError::BadManifest("root is not a group".to_string())),
        };

        Ok(Self {
            root,
            output_path,
            config: ContainerConfig::default(),
            finalized: true,
        })
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        if !self.finalized {
            // Leave a diagnostic artifact for an aborted run.
            if let Err(e) = self.persist() {
                log::warn!(
                    "failed to persist partial container {}: {}",
                    self.output_path.display(),
                    e
                );
            }
        }
    }
}

fn child_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

fn group_to_manifest(group: &Group, path: &str) -> Value {
    let mut children = Map::new();
    for (name, child) in &group.children {
        children.insert(name.clone(), node_to_manifest(child, &child_path(path, name)));
    }
    json!({
        "type": "group",
        "attrs": Value::Object(group.attrs.clone()),
        "children": Value::Object(children),
    })
}

fn node_to_manifest(node: &Node, path: &str) -> Value {
    match node {
        Node::Group(g) => group_to_manifest(g, path),
        Node::Dataset(d) => {
            let mut entry = Map::new();
            entry.insert("type".to_string(), json!("dataset"));
            entry.insert("dtype".to_string(), json!(d.dtype.code()));
            entry.insert("shape".to_string(), json!(d.shape));
            entry.insert("attrs".to_string(), Value::Object(d.attrs.clone()));
            match &d.buf {
                DataBuf::Str(values) => {
                    entry.insert("values".to_string(), json!(values));
                }
                DataBuf::Bool(values) => {
                    entry.insert("values".to_string(), json!(values));
                }
                _ => {
                    entry.insert("data".to_string(), json!(format!("data/{path}.bin")));
                }
            }
            Value::Object(entry)
        }
        Node::Link(l) => json!({
            "type": "link",
            "target": l.target,
            "attrs": Value::Object(l.attrs.clone()),
        }),
    }
}

fn write_binary_payloads<W: Write + std::io::Seek>(
    zip_writer: &mut ZipWriter<W>,
    group: &Group,
    prefix: &str,
) -> Result<(), ContainerError> {
    let stored = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .unix_permissions(0o644);
    for (name, child) in &group.children {
        let path = child_path(prefix, name);
        match child {
            Node::Group(g) => write_binary_payloads(zip_writer, g, &path)?,
            Node::Dataset(d) => {
                let mut payload = Vec::new();
                match &d.buf {
                    DataBuf::F64(values) => {
                        for v in values {
                            payload.write_f64::<LittleEndian>(*v)?;
                        }
                    }
                    DataBuf::I64(values) => {
                        for v in values {
                            payload.write_i64::<LittleEndian>(*v)?;
                        }
                    }
                    DataBuf::I32(values) => {
                        for v in values {
                            payload.write_i32::<LittleEndian>(*v)?;
                        }
                    }
                    // String and boolean payloads live inline in the manifest.
                    DataBuf::Str(_) | DataBuf::Bool(_) => continue,
                }
                zip_writer.start_file(format!("data/{path}.bin"), stored)?;
                zip_writer.write_all(&payload)?;
            }
            Node::Link(_) => {}
        }
    }
    Ok(())
}

fn manifest_attrs(value: &Value) -> Result<AttrMap, ContainerError> {
    match value.get("attrs") {
        None => Ok(AttrMap::new()),
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(_) => Err(ContainerError::BadManifest("attrs is not a mapping".to_string())),
    }
}

fn node_from_manifest(
    value: &Value,
    path: &str,
    archive: &mut zip::ZipArchive<File>,
) -> Result<Node, ContainerError> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ContainerError::BadManifest(format!("node {path} has no type")))?;
    match kind {
        "group" => {
            let mut group = Group {
                attrs: manifest_attrs(value)?,
                children: Vec::new(),
            };
            if let Some(Value::Object(children)) = value.get("children") {
                for (name, child_value) in children {
                    let child = node_from_manifest(child_value, &child_path(path, name), archive)?;
                    group.insert(name, child);
                }
            }
            Ok(Node::Group(group))
        }
        "dataset" => {
            let dtype_code = value
                .get("dtype")
                .and_then(Value::as_str)
                .ok_or_else(|| ContainerError::BadManifest(format!("dataset {path} has no dtype")))?;
            let dtype = ElementType::from_code(dtype_code).ok_or_else(|| {
                ContainerError::BadManifest(format!("dataset {path} has unknown dtype {dtype_code}"))
            })?;
            let shape: Vec<usize> = value
                .get("shape")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(Value::as_u64).map(|v| v as usize).collect())
                .ok_or_else(|| ContainerError::BadManifest(format!("dataset {path} has no shape")))?;
            let expected: usize = shape.iter().product::<usize>().max(1);

            let buf = match dtype {
                ElementType::Str => {
                    let values = value
                        .get("values")
                        .and_then(Value::as_array)
                        .ok_or_else(|| {
                            ContainerError::BadManifest(format!("dataset {path} has no values"))
                        })?
                        .iter()
                        .map(|v| v.as_str().map(str::to_string))
                        .collect::<Option<Vec<_>>>()
                        .ok_or_else(|| {
                            ContainerError::BadManifest(format!("dataset {path} has non-string values"))
                        })?;
                    DataBuf::Str(values)
                }
                ElementType::Bool => {
                    let values = value
                        .get("values")
                        .and_then(Value::as_array)
                        .ok_or_else(|| {
                            ContainerError::BadManifest(format!("dataset {path} has no values"))
                        })?
                        .iter()
                        .map(Value::as_bool)
                        .collect::<Option<Vec<_>>>()
                        .ok_or_else(|| {
                            ContainerError::BadManifest(format!("dataset {path} has non-bool values"))
                        })?;
                    DataBuf::Bool(values)
                }
                numeric => {
                    let entry_name = format!("data/{path}.bin");
                    let mut entry = archive.by_name(&entry_name)?;
                    let mut bytes = Vec::new();
                    entry.read_to_end(&mut bytes)?;
                    let mut cursor = std::io::Cursor::new(bytes);
                    match numeric {
                        ElementType::F64 => {
                            let mut values = Vec::with_capacity(expected);
                            while let Ok(v) = cursor.read_f64::<LittleEndian>() {
                                values.push(v);
                            }
                            DataBuf::F64(values)
                        }
                        ElementType::I64 => {
                            let mut values = Vec::with_capacity(expected);
                            while let Ok(v) = cursor.read_i64::<LittleEndian>() {
                                values.push(v);
                            }
                            DataBuf::I64(values)
                        }
                        ElementType::I32 => {
                            let mut values = Vec::with_capacity(expected);
                            while let Ok(v) = cursor.read_i32::<LittleEndian>() {
                                values.push(v);
                            }
                            DataBuf::I32(values)
                        }
                        ElementType::Str | ElementType::Bool => unreachable!(),
                    }
                }
            };
            if buf.len() != expected && !(shape.iter().product::<usize>() == 0 && buf.is_empty()) {
                return Err(ContainerError::BadManifest(format!(
                    "dataset {path} payload length {} does not match shape {:?}",
                    buf.len(),
                    shape
                )));
            }
            let mut dataset = Dataset::new(dtype, shape, buf);
            dataset.attrs = manifest_attrs(value)?;
            Ok(Node::Dataset(dataset))
        }
        "link" => {
            let target = value
                .get("target")
                .and_then(Value::as_str)
                .ok_or_else(|| ContainerError::BadManifest(format!("link {path} has no target")))?;
            Ok(Node::Link(LinkNode {
                target: target.to_string(),
                attrs: manifest_attrs(value)?,
            }))
        }
        other => Err(ContainerError::BadManifest(format!(
            "node {path} has unknown type {other}"
        ))),
    }
}
