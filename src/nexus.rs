//! # NeXus Tree Materializer
//!
//! Technique blocks carry a nested mapping describing a second tree —
//! groups, attributes, datasets, and links — layered over the raw document
//! tree already written to the container. Materialization happens once per
//! technique block, at stop time, when every raw node a link might target
//! is durably written.
//!
//! ## Payload vocabulary
//!
//! Two sentinel keys structure the mapping; everything else is an ordinary
//! named entry, processed in insertion order:
//!
//! - `_attributes`: flat mapping of attribute name to value, applied to
//!   the node currently being built.
//! - `_link`: marks the enclosing mapping as a link description rather
//!   than a subgroup. Its value is a bluesky document address (below); a
//!   sibling `_attributes` attaches to the link itself, not the target.
//!
//! A bare string value starting with `#bluesky` is shorthand for an
//! unattributed link. Any other mapping becomes a subgroup, any other
//! value a leaf dataset.
//!
//! ```text
//! "entry": {
//!     "_attributes": {"NX_Class": "NXEntry", "default": "data"},
//!     "program_name": "EPICS areaDetector",
//!     "instrument": {
//!         "_attributes": {"NX_Class": "NXInstrument"},
//!         "name": "#bluesky/start/beamline_id",
//!         "end_time": {
//!             "_attributes": {"NDAttrName": "EndTime"},
//!             "_link": "#bluesky/stop/time"
//!         }
//!     }
//! }
//! ```
//!
//! ## Address grammar
//!
//! ```text
//! "#bluesky/" doc-selector ( "/" key )* ( "@" attribute )?
//! doc-selector := "start" | "stop" | "desc/" stream-name
//! ```
//!
//! The trailing `@attribute` component is parsed and carried but not
//! dereferenced; no sampled payload uses it.

use serde_json::{Map, Value};

use crate::appender::BLUESKY_GROUP;
use crate::container::{Container, ContainerError};
use crate::document::TechniqueBlock;
use crate::metadata::dataset_for_value;

/// Errors raised while materializing a NeXus tree
#[derive(Debug, thiserror::Error)]
pub enum NexusError {
    /// A document address does not match the grammar
    #[error("failed to parse bluesky document path '{0}'")]
    PathParse(String),

    /// A document address names a node the raw tree does not contain
    #[error("bluesky document path resolves to no node: {path}")]
    TargetNotFound {
        /// Container path that was looked up
        path: String,
    },

    /// A `_link` value is not an address string
    #[error("'_link' under '{key}' is not a string")]
    BadLink {
        /// The enclosing entry name
        key: String,
    },

    /// An `_attributes` value is not a flat mapping
    #[error("'_attributes' under '{key}' is not a mapping")]
    BadAttributes {
        /// The enclosing entry name
        key: String,
    },

    /// A link mapping carries entries besides the two sentinels
    #[error("link mapping '{key}' carries entries other than '_attributes'/'_link'")]
    LinkWithChildren {
        /// The offending entry name
        key: String,
    },

    /// The storage substrate rejected a write
    #[error("container error: {0}")]
    Container(#[from] ContainerError),
}

/// Which top-level document section an address refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocSection {
    /// The run-start metadata section
    Start,
    /// The run-stop metadata section
    Stop,
    /// One stream's descriptor section
    Desc(String),
}

/// A parsed bluesky document address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlueskyPath {
    /// The referenced document section
    pub section: DocSection,
    /// Keys to descend through from the section root
    pub keys: Vec<String>,
    /// Trailing attribute component; parsed, never dereferenced
    pub attribute: Option<String>,
}

fn is_word(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl BlueskyPath {
    /// Parse an address string against the grammar
    pub fn parse(input: &str) -> Result<Self, NexusError> {
        let parse_err = || NexusError::PathParse(input.to_string());

        let rest = input.strip_prefix("#bluesky/").ok_or_else(parse_err)?;
        let (path_part, attribute) = match rest.split_once('@') {
            Some((path_part, attr)) => {
                if !is_word(attr) {
                    return Err(parse_err());
                }
                (path_part, Some(attr.to_string()))
            }
            None => (rest, None),
        };

        let mut segs = path_part.split('/');
        let section = match segs.next() {
            Some("start") => DocSection::Start,
            Some("stop") => DocSection::Stop,
            Some("desc") => {
                let stream = segs.next().filter(|s| is_word(s)).ok_or_else(parse_err)?;
                DocSection::Desc(stream.to_string())
            }
            _ => return Err(parse_err()),
        };

        let mut keys = Vec::new();
        for seg in segs {
            if !is_word(seg) {
                return Err(parse_err());
            }
            keys.push(seg.to_string());
        }

        Ok(Self {
            section,
            keys,
            attribute,
        })
    }

    /// Container path of the addressed node in the raw tree
    pub fn container_path(&self) -> String {
        let mut path = match &self.section {
            DocSection::Start => format!("{BLUESKY_GROUP}/start"),
            DocSection::Stop => format!("{BLUESKY_GROUP}/stop"),
            DocSection::Desc(stream) => format!("{BLUESKY_GROUP}/descriptors/{stream}"),
        };
        for key in &self.keys {
            path.push('/');
            path.push_str(key);
        }
        path
    }
}

/// Resolve an address to an existing raw-tree node, returning its path
pub fn resolve_target(container: &Container, path: &BlueskyPath) -> Result<String, NexusError> {
    let target = path.container_path();
    if !container.exists(&target) {
        return Err(NexusError::TargetNotFound { path: target });
    }
    Ok(target)
}

/// Structural classification of one payload entry, decided before recursion
enum NexusEntry<'a> {
    /// A link description: address plus optional attributes for the link
    Link {
        address: &'a str,
        attrs: Option<&'a Map<String, Value>>,
    },
    /// An ordinary subgroup to recurse into
    Group(&'a Map<String, Value>),
    /// An ordinary leaf value
    Leaf(&'a Value),
}

fn classify<'a>(key: &str, value: &'a Value) -> Result<NexusEntry<'a>, NexusError> {
    match value {
        Value::Object(map) if map.contains_key("_link") => {
            let address = map
                .get("_link")
                .and_then(Value::as_str)
                .ok_or_else(|| NexusError::BadLink {
                    key: key.to_string(),
                })?;
            let attrs = match map.get("_attributes") {
                None => None,
                Some(Value::Object(attrs)) => Some(attrs),
                Some(_) => {
                    return Err(NexusError::BadAttributes {
                        key: key.to_string(),
                    })
                }
            };
            if map.keys().any(|k| k != "_link" && k != "_attributes") {
                return Err(NexusError::LinkWithChildren {
                    key: key.to_string(),
                });
            }
            Ok(NexusEntry::Link { address, attrs })
        }
        Value::Object(map) => Ok(NexusEntry::Group(map)),
        Value::String(s) if s.starts_with("#bluesky") => Ok(NexusEntry::Link {
            address: s,
            attrs: None,
        }),
        other => Ok(NexusEntry::Leaf(other)),
    }
}

/// Materialize one technique block's NeXus tree at the container top level
pub fn materialize_technique(
    container: &mut Container,
    block: &TechniqueBlock,
) -> Result<(), NexusError> {
    log::info!(
        "materializing NeXus tree for technique '{}' (version {})",
        block.technique,
        block.version
    );
    copy_nexus_md(container, &block.payload, "")
}

/// Recursively build groups, attributes, datasets, and links from `md`
///
/// `group_path` is the node currently being built; empty means the
/// container root. Sentinel keys are consumed structurally and skipped as
/// children.
fn copy_nexus_md(
    container: &mut Container,
    md: &Map<String, Value>,
    group_path: &str,
) -> Result<(), NexusError> {
    if let Some(attrs_value) = md.get("_attributes") {
        let Value::Object(attrs) = attrs_value else {
            return Err(NexusError::BadAttributes {
                key: group_path.to_string(),
            });
        };
        for (name, value) in attrs {
            if group_path.is_empty() {
                container.set_root_attr(name, value.clone());
            } else {
                container.set_attr(group_path, name, value.clone())?;
            }
        }
    }

    for (key, value) in md {
        if key == "_attributes" || key == "_link" {
            continue;
        }
        let child_path = if group_path.is_empty() {
            key.clone()
        } else {
            format!("{group_path}/{key}")
        };
        match classify(key, value)? {
            NexusEntry::Link { address, attrs } => {
                let parsed = BlueskyPath::parse(address)?;
                let target = resolve_target(container, &parsed)?;
                log::debug!("linking '{child_path}' to '{target}'");
                container.link(&child_path, &target)?;
                if let Some(attrs) = attrs {
                    for (name, attr_value) in attrs {
                        container.set_attr(&child_path, name, attr_value.clone())?;
                    }
                }
            }
            NexusEntry::Group(children) => {
                container.ensure_group(&child_path)?;
                copy_nexus_md(container, children, &child_path)?;
            }
            NexusEntry::Leaf(leaf) => {
                container.put_dataset(&child_path, dataset_for_value(leaf))?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ContainerConfig, Dataset};
    use serde_json::json;
    use tempfile::tempdir;

    fn scratch_container() -> (tempfile::TempDir, Container) {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nexus.nxc");
        let container = Container::create(path, ContainerConfig::default()).expect("create");
        (dir, container)
    }

    fn technique(payload: Value) -> TechniqueBlock {
        let Value::Object(payload) = payload else {
            panic!("expected mapping");
        };
        TechniqueBlock {
            technique: "SAXS".to_string(),
            version: json!(1),
            payload,
        }
    }

    #[test]
    fn test_parse_start_with_attribute() {
        let p = BlueskyPath::parse("#bluesky/start@abc").unwrap();
        assert_eq!(p.section, DocSection::Start);
        assert!(p.keys.is_empty());
        assert_eq!(p.attribute.as_deref(), Some("abc"));
    }

    #[test]
    fn test_parse_start_with_keys() {
        let p = BlueskyPath::parse("#bluesky/start/abc").unwrap();
        assert_eq!(p.section, DocSection::Start);
        assert_eq!(p.keys, vec!["abc"]);

        let p = BlueskyPath::parse("#bluesky/start/abc/def").unwrap();
        assert_eq!(p.keys, vec!["abc", "def"]);

        let p = BlueskyPath::parse("#bluesky/start/abc/def@ghi").unwrap();
        assert_eq!(p.keys, vec!["abc", "def"]);
        assert_eq!(p.attribute.as_deref(), Some("ghi"));
    }

    #[test]
    fn test_parse_descriptor_selector() {
        let p = BlueskyPath::parse("#bluesky/desc/primary/abc/def@ghi").unwrap();
        assert_eq!(p.section, DocSection::Desc("primary".to_string()));
        assert_eq!(p.keys, vec!["abc", "def"]);
        assert_eq!(p.attribute.as_deref(), Some("ghi"));
    }

    #[test]
    fn test_parse_stop_selector() {
        let p = BlueskyPath::parse("#bluesky/stop/abc/def@ghi").unwrap();
        assert_eq!(p.section, DocSection::Stop);
        assert_eq!(p.keys, vec!["abc", "def"]);
        assert_eq!(p.attribute.as_deref(), Some("ghi"));
    }

    #[test]
    fn test_parse_rejects_malformed_addresses() {
        for bad in [
            "bluesky/start",
            "#bluesky",
            "#bluesky/",
            "#bluesky/desc",
            "#bluesky/desc/",
            "#bluesky/descriptor/primary",
            "#bluesky/start/abc@",
            "#bluesky/start/ab-c",
            "#bluesky/start//abc",
        ] {
            assert!(
                matches!(BlueskyPath::parse(bad), Err(NexusError::PathParse(_))),
                "expected parse failure for '{bad}'"
            );
        }
    }

    #[test]
    fn test_container_path_for_each_section() {
        assert_eq!(
            BlueskyPath::parse("#bluesky/start/beamline_id").unwrap().container_path(),
            "bluesky/start/beamline_id"
        );
        assert_eq!(
            BlueskyPath::parse("#bluesky/stop/time").unwrap().container_path(),
            "bluesky/stop/time"
        );
        assert_eq!(
            BlueskyPath::parse("#bluesky/desc/primary/data_keys/en_energy")
                .unwrap()
                .container_path(),
            "bluesky/descriptors/primary/data_keys/en_energy"
        );
    }

    #[test]
    fn test_resolution_requires_existing_target() {
        let (_dir, mut c) = scratch_container();
        c.put_dataset("bluesky/start/beamline_id", Dataset::scalar_str("SST-1")).unwrap();

        let found = BlueskyPath::parse("#bluesky/start/beamline_id").unwrap();
        assert_eq!(
            resolve_target(&c, &found).unwrap(),
            "bluesky/start/beamline_id"
        );

        let missing = BlueskyPath::parse("#bluesky/start/gup_number").unwrap();
        assert!(matches!(
            resolve_target(&c, &missing),
            Err(NexusError::TargetNotFound { .. })
        ));
    }

    #[test]
    fn test_materialize_groups_attributes_and_shorthand_link() {
        let (_dir, mut c) = scratch_container();
        c.put_dataset("bluesky/start/beamline_id", Dataset::scalar_str("SST-1")).unwrap();

        let block = technique(json!({
            "entry": {
                "_attributes": {"NX_Class": "NXEntry", "default": "data"},
                "instrument": {
                    "_attributes": {"NX_Class": "NXInstrument"},
                    "name": "#bluesky/start/beamline_id",
                },
            },
        }));
        materialize_technique(&mut c, &block).unwrap();

        assert_eq!(c.attrs("entry").unwrap().len(), 2);
        assert_eq!(
            c.attrs("entry").unwrap().get("NX_Class"),
            Some(&json!("NXEntry"))
        );
        assert_eq!(c.attrs("entry/instrument").unwrap().len(), 1);

        // the link dereferences to the raw dataset
        let name = c.dataset("entry/instrument/name").unwrap();
        assert_eq!(name.scalar_str_value(), Some("SST-1"));
    }

    #[test]
    fn test_materialize_link_with_attributes() {
        let (_dir, mut c) = scratch_container();
        c.put_dataset("bluesky/stop/time", Dataset::scalar_f64(1573882943.0)).unwrap();

        let block = technique(json!({
            "entry": {
                "end_time": {
                    "_attributes": {
                        "NDAttrDescription": "image ending time",
                        "NDAttrName": "EndTime",
                        "NDAttrSource": "91dcLAX:SAXS:EndExposureTime",
                        "NDAttrSourceType": "NDAttrSourceEPICSPV",
                    },
                    "_link": "#bluesky/stop/time",
                },
            },
        }));
        materialize_technique(&mut c, &block).unwrap();

        let end_time = c.dataset("entry/end_time").unwrap();
        assert_eq!(end_time.scalar_f64_value(), Some(1573882943.0));
        // attributes landed on the link, not the target
        assert_eq!(c.attrs("entry/end_time").unwrap().len(), 4);
        assert_eq!(c.attrs("bluesky/stop/time").unwrap().len(), 0);
    }

    #[test]
    fn test_materialize_leaf_values() {
        let (_dir, mut c) = scratch_container();
        let block = technique(json!({
            "entry": {
                "program_name": "EPICS areaDetector",
                "aperture": {
                    "_attributes": {"NX_Class": "NXAperture"},
                    "vcenter": 1.0,
                    "vsize": 2.0,
                    "description": "USAXSslit",
                },
            },
        }));
        materialize_technique(&mut c, &block).unwrap();

        assert_eq!(
            c.dataset("entry/program_name").unwrap().scalar_str_value(),
            Some("EPICS areaDetector")
        );
        assert_eq!(
            c.dataset("entry/aperture/vcenter").unwrap().scalar_f64_value(),
            Some(1.0)
        );
        assert_eq!(
            c.dataset("entry/aperture/description").unwrap().scalar_str_value(),
            Some("USAXSslit")
        );
    }

    #[test]
    fn test_link_mapping_with_extra_children_is_fatal() {
        let (_dir, mut c) = scratch_container();
        c.put_dataset("bluesky/start/beamline_id", Dataset::scalar_str("SST-1")).unwrap();

        let block = technique(json!({
            "entry": {
                "name": {
                    "_link": "#bluesky/start/beamline_id",
                    "stray": 1,
                },
            },
        }));
        assert!(matches!(
            materialize_technique(&mut c, &block),
            Err(NexusError::LinkWithChildren { .. })
        ));
    }

    #[test]
    fn test_parse_error_aborts_materialization_but_raw_tree_survives() {
        let (_dir, mut c) = scratch_container();
        c.put_dataset("bluesky/start/beamline_id", Dataset::scalar_str("SST-1")).unwrap();

        let block = technique(json!({
            "entry": {
                "name": "#bluesky/nonsense/path",
            },
        }));
        assert!(matches!(
            materialize_technique(&mut c, &block),
            Err(NexusError::PathParse(_))
        ));
        assert!(c.exists("bluesky/start/beamline_id"));
    }

    #[test]
    fn test_overlapping_technique_groups_merge() {
        let (_dir, mut c) = scratch_container();
        let first = technique(json!({"entry": {"program_name": "EPICS"}}));
        let second = technique(json!({"entry": {"operator": "beamline staff"}}));
        materialize_technique(&mut c, &first).unwrap();
        materialize_technique(&mut c, &second).unwrap();

        assert!(c.exists("entry/program_name"));
        assert!(c.exists("entry/operator"));
    }

    mod path_grammar_properties {
        use super::*;
        use proptest::prelude::*;

        fn word() -> impl Strategy<Value = String> {
            "[A-Za-z0-9_]{1,12}"
        }

        proptest! {
            #[test]
            fn start_paths_round_trip(keys in prop::collection::vec(word(), 0..4), attr in prop::option::of(word())) {
                let mut address = "#bluesky/start".to_string();
                for key in &keys {
                    address.push('/');
                    address.push_str(key);
                }
                if let Some(attr) = &attr {
                    address.push('@');
                    address.push_str(attr);
                }
                let parsed = BlueskyPath::parse(&address).unwrap();
                prop_assert_eq!(parsed.section, DocSection::Start);
                prop_assert_eq!(parsed.keys, keys);
                prop_assert_eq!(parsed.attribute, attr);
            }

            #[test]
            fn desc_paths_round_trip(stream in word(), keys in prop::collection::vec(word(), 0..4)) {
                let mut address = format!("#bluesky/desc/{stream}");
                for key in &keys {
                    address.push('/');
                    address.push_str(key);
                }
                let parsed = BlueskyPath::parse(&address).unwrap();
                prop_assert_eq!(parsed.section, DocSection::Desc(stream));
                prop_assert_eq!(parsed.keys, keys);
            }
        }
    }
}
