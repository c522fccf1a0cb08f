//! Integration tests for nxsas
//!
//! These tests drive full document streams through the export entry point
//! and verify the persisted container by reopening it from disk.

use nxsas::container::{Container, ElementType};
use nxsas::export::{export_json, ExportOptions};
use nxsas::serializer::{SerializerError, STREAM_DATA_LABEL};
use serde_json::{json, Value};
use std::path::PathBuf;
use tempfile::tempdir;

fn run_export(documents: Vec<(&str, Value)>, directory: &std::path::Path) -> PathBuf {
    let documents = documents
        .into_iter()
        .map(|(kind, body)| (kind.to_string(), body));
    let artifacts = export_json(documents, directory, &ExportOptions::default()).unwrap();
    let paths = &artifacts[STREAM_DATA_LABEL];
    assert_eq!(paths.len(), 1, "exactly one artifact per run");
    paths[0].clone()
}

/// The end-to-end scenario: one number field, two event pages, stop
#[test]
fn test_number_dataset_from_event_pages() {
    let dir = tempdir().unwrap();
    let path = run_export(
        vec![
            ("start", json!({"uid": "U", "plan_name": "scan"})),
            (
                "descriptor",
                json!({
                    "uid": "d1",
                    "name": "primary",
                    "run_start": "U",
                    "data_keys": {
                        "en_energy": {
                            "source": "PY:en_energy.position",
                            "dtype": "number",
                            "shape": [],
                            "upper_ctrl_limit": 2500,
                            "lower_ctrl_limit": 150,
                            "units": "",
                            "object_name": "en",
                        },
                    },
                }),
            ),
            (
                "event_page",
                json!({
                    "descriptor": "d1",
                    "seq_num": [1, 2],
                    "data": {"en_energy": [1.0, 2.0]},
                    "timestamps": {"en_energy": [100.0, 200.0]},
                }),
            ),
            (
                "event_page",
                json!({
                    "descriptor": "d1",
                    "seq_num": [3, 4],
                    "data": {"en_energy": [3.0, 4.0]},
                    "timestamps": {"en_energy": [300.0, 400.0]},
                }),
            ),
            ("stop", json!({"exit_status": "success"})),
        ],
        dir.path(),
    );

    assert!(path.exists());
    assert_eq!(path, dir.path().join("U.nxc"));

    let c = Container::open(&path).unwrap();
    assert_eq!(
        c.dataset("bluesky/start/uid").unwrap().scalar_str_value(),
        Some("U")
    );
    assert!(c.exists("bluesky/descriptors/primary/data_keys/en_energy"));

    let data = c.dataset("bluesky/events/primary/data/en_energy").unwrap();
    assert_eq!(data.shape, vec![4]);
    assert_eq!(data.as_f64(), Some(&[1.0, 2.0, 3.0, 4.0][..]));

    let ts = c.dataset("bluesky/events/primary/timestamps/en_energy").unwrap();
    assert_eq!(ts.dtype, ElementType::F64);
    assert_eq!(ts.as_f64(), Some(&[100.0, 200.0, 300.0, 400.0][..]));
}

/// Single `event` documents are normalized to one-event pages
#[test]
fn test_number_dataset_from_events() {
    let dir = tempdir().unwrap();
    let descriptor = json!({
        "uid": "d1",
        "name": "primary",
        "run_start": "U2",
        "data_keys": {
            "en_energy": {"source": "PY:en_energy.position", "dtype": "number", "shape": []},
        },
    });
    let mut documents = vec![
        ("start", json!({"uid": "U2"})),
        ("descriptor", descriptor),
    ];
    for (i, (value, stamp)) in [(10.0, 1000.0), (11.0, 2000.0), (12.0, 3000.0)]
        .into_iter()
        .enumerate()
    {
        documents.push((
            "event",
            json!({
                "descriptor": "d1",
                "seq_num": i + 1,
                "data": {"en_energy": value},
                "timestamps": {"en_energy": stamp},
            }),
        ));
    }
    documents.push(("stop", json!({})));

    let path = run_export(documents, dir.path());
    let c = Container::open(&path).unwrap();
    assert_eq!(
        c.dataset("bluesky/events/primary/data/en_energy").unwrap().as_f64(),
        Some(&[10.0, 11.0, 12.0][..])
    );
    assert_eq!(
        c.dataset("bluesky/events/primary/timestamps/en_energy").unwrap().as_f64(),
        Some(&[1000.0, 2000.0, 3000.0][..])
    );
}

#[test]
fn test_string_dataset() {
    let dir = tempdir().unwrap();
    let path = run_export(
        vec![
            ("start", json!({"uid": "U3"})),
            (
                "descriptor",
                json!({
                    "uid": "d1",
                    "name": "primary",
                    "data_keys": {
                        "en_grating_plim_desc": {
                            "source": "PV:XF:07ID1-OP{Mono:PGM1-Ax:GrtP}Mtr_PLIM_STS.DESC",
                            "dtype": "string",
                            "shape": [],
                            "units": null,
                        },
                    },
                }),
            ),
            (
                "event_page",
                json!({
                    "descriptor": "d1",
                    "data": {"en_grating_plim_desc": ["Positive End Limit Set"]},
                    "timestamps": {"en_grating_plim_desc": [1573882935.047036]},
                }),
            ),
            ("stop", json!({})),
        ],
        dir.path(),
    );

    let c = Container::open(&path).unwrap();
    let data = c.dataset("bluesky/events/primary/data/en_grating_plim_desc").unwrap();
    assert_eq!(data.dtype, ElementType::Str);
    assert_eq!(
        data.as_str_slice(),
        Some(&["Positive End Limit Set".to_string()][..])
    );
    // null descriptor metadata survives as the literal "None"
    assert_eq!(
        c.dataset("bluesky/descriptors/primary/data_keys/en_grating_plim_desc/units")
            .unwrap()
            .scalar_str_value(),
        Some("None")
    );
}

/// The detector service declares shape axis-reversed; storage follows the
/// data and the stored schema entry is corrected.
#[test]
fn test_integer_array_dataset_with_reversed_declared_shape() {
    let dir = tempdir().unwrap();
    let path = run_export(
        vec![
            ("start", json!({"uid": "U4"})),
            (
                "descriptor",
                json!({
                    "uid": "d1",
                    "name": "primary",
                    "data_keys": {
                        "saxs_image": {
                            "shape": [3, 2, 0],
                            "source": "PV:XF:07ID1-ES:1{GE:1}",
                            "dtype": "array",
                            "object_name": "Synced",
                        },
                    },
                }),
            ),
            (
                "event_page",
                json!({
                    "descriptor": "d1",
                    "data": {"saxs_image": [[[5073, 5074, 5082], [5062, 5089, 5073]]]},
                    "timestamps": {"saxs_image": [1573882944.765147]},
                }),
            ),
            ("stop", json!({})),
        ],
        dir.path(),
    );

    let c = Container::open(&path).unwrap();
    let data = c.dataset("bluesky/events/primary/data/saxs_image").unwrap();
    // one event of the observed (2, 3) image
    assert_eq!(data.shape, vec![1, 2, 3]);
    assert_eq!(data.as_i64(), Some(&[5073, 5074, 5082, 5062, 5089, 5073][..]));

    // the declared shape was corrected in the stored descriptor
    let stored_shape = c
        .dataset("bluesky/descriptors/primary/data_keys/saxs_image/shape")
        .unwrap();
    assert_eq!(stored_shape.as_i64(), Some(&[0, 2, 3][..]));

    let ts = c.dataset("bluesky/events/primary/timestamps/saxs_image").unwrap();
    assert_eq!(ts.shape, vec![1]);
}

/// Technique blocks build the NeXus overlay with links into raw data
#[test]
fn test_nexus_overlay_with_links_and_attributes() {
    let techniques = json!({
        "techniques": [{
            "version": 1,
            "technique": "SAXS",
            "nxsas": {
                "entry": {
                    "_attributes": {"NX_Class": "NXEntry", "default": "data"},
                    "end_time": {
                        "_attributes": {
                            "NDAttrDescription": "image ending time",
                            "NDAttrName": "EndTime",
                            "NDAttrSource": "91dcLAX:SAXS:EndExposureTime",
                            "NDAttrSourceType": "NDAttrSourceEPICSPV",
                        },
                        "_link": "#bluesky/stop/time",
                    },
                    "title": {
                        "_attributes": {"NDAttrName": "SampleTitle"},
                        "_link": "#bluesky/start/sample_name",
                    },
                    "program_name": "EPICS areaDetector",
                    "instrument": {
                        "_attributes": {"NX_Class": "NXInstrument"},
                        "name_1": "#bluesky/start/beamline_id",
                        "name_2": {
                            "_attributes": {"NX_This": "NXThat"},
                            "_link": "#bluesky/start/beamline_id",
                        },
                        "aperture": {
                            "_attributes": {"NX_Class": "NXAperture"},
                            "vcenter": 1.0,
                            "vsize": 2.0,
                            "description": "USAXSslit",
                        },
                    },
                },
            },
        }],
    });

    let dir = tempdir().unwrap();
    let path = run_export(
        vec![
            (
                "start",
                json!({
                    "uid": "U5",
                    "beamline_id": "SST-1",
                    "sample_name": "vanadium foil",
                    "md": techniques,
                }),
            ),
            ("stop", json!({"time": 1573882999.5, "exit_status": "success"})),
        ],
        dir.path(),
    );

    let c = Container::open(&path).unwrap();

    assert_eq!(c.attrs("entry").unwrap().len(), 2);
    assert_eq!(c.attrs("entry").unwrap().get("NX_Class"), Some(&json!("NXEntry")));

    // links dereference into the raw tree
    assert_eq!(
        c.dataset("entry/end_time").unwrap().scalar_f64_value(),
        Some(1573882999.5)
    );
    assert_eq!(c.attrs("entry/end_time").unwrap().len(), 4);
    assert_eq!(
        c.dataset("entry/title").unwrap().scalar_str_value(),
        Some("vanadium foil")
    );
    assert_eq!(
        c.dataset("entry/instrument/name_1").unwrap().scalar_str_value(),
        Some("SST-1")
    );
    assert_eq!(
        c.dataset("entry/instrument/name_2").unwrap().scalar_str_value(),
        Some("SST-1")
    );
    assert_eq!(
        c.attrs("entry/instrument/name_2").unwrap().get("NX_This"),
        Some(&json!("NXThat"))
    );

    // ordinary leaves under the overlay
    assert_eq!(
        c.dataset("entry/program_name").unwrap().scalar_str_value(),
        Some("EPICS areaDetector")
    );
    assert_eq!(
        c.dataset("entry/instrument/aperture/vcenter").unwrap().scalar_f64_value(),
        Some(1.0)
    );

    // raw tree untouched by the overlay
    assert_eq!(
        c.dataset("bluesky/start/beamline_id").unwrap().scalar_str_value(),
        Some("SST-1")
    );
}

/// An unfilled field aborts the run; the partial container stays on disk
#[test]
fn test_unfilled_field_aborts_run_with_diagnostic_artifact() {
    let dir = tempdir().unwrap();
    let documents = vec![
        ("start".to_string(), json!({"uid": "U6"})),
        (
            "descriptor".to_string(),
            json!({
                "uid": "d1",
                "name": "primary",
                "data_keys": {
                    "img": {"dtype": "array", "shape": [2, 2, 0], "external": "FILESTORE:"},
                },
            }),
        ),
        (
            "event_page".to_string(),
            json!({
                "descriptor": "d1",
                "data": {"img": [null]},
                "timestamps": {"img": [100.0]},
                "filled": {"img": [false]},
            }),
        ),
        ("stop".to_string(), json!({})),
    ];

    let result = export_json(documents, dir.path(), &ExportOptions::default());
    assert!(matches!(result, Err(SerializerError::Append(_))));

    // diagnostic artifact: start metadata persisted, no event storage
    let partial = dir.path().join("U6.nxc");
    assert!(partial.exists());
    let c = Container::open(&partial).unwrap();
    assert!(c.exists("bluesky/descriptors/primary"));
    assert!(!c.exists("bluesky/events/primary/data/img"));
}

/// Streams interleave arbitrarily; each keeps its own storage
#[test]
fn test_multiple_streams_interleaved() {
    let dir = tempdir().unwrap();
    let path = run_export(
        vec![
            ("start", json!({"uid": "U7"})),
            (
                "descriptor",
                json!({
                    "uid": "d-primary",
                    "name": "primary",
                    "data_keys": {"en_energy": {"dtype": "number", "shape": []}},
                }),
            ),
            (
                "descriptor",
                json!({
                    "uid": "d-baseline",
                    "name": "baseline",
                    "data_keys": {"slit_gap": {"dtype": "number", "shape": []}},
                }),
            ),
            (
                "event_page",
                json!({
                    "descriptor": "d-baseline",
                    "data": {"slit_gap": [0.4]},
                    "timestamps": {"slit_gap": [50.0]},
                }),
            ),
            (
                "event_page",
                json!({
                    "descriptor": "d-primary",
                    "data": {"en_energy": [270.0]},
                    "timestamps": {"en_energy": [100.0]},
                }),
            ),
            (
                "event_page",
                json!({
                    "descriptor": "d-baseline",
                    "data": {"slit_gap": [0.5]},
                    "timestamps": {"slit_gap": [150.0]},
                }),
            ),
            ("stop", json!({})),
        ],
        dir.path(),
    );

    let c = Container::open(&path).unwrap();
    assert_eq!(
        c.dataset("bluesky/events/primary/data/en_energy").unwrap().as_f64(),
        Some(&[270.0][..])
    );
    assert_eq!(
        c.dataset("bluesky/events/baseline/data/slit_gap").unwrap().as_f64(),
        Some(&[0.4, 0.5][..])
    );
}

/// Start metadata round-trips with types intact
#[test]
fn test_start_metadata_round_trip() {
    let dir = tempdir().unwrap();
    let path = run_export(
        vec![
            (
                "start",
                json!({
                    "uid": "U8",
                    "plan_name": "full_carbon_scan_nd",
                    "plan_type": "generator",
                    "scan_id": 6852,
                    "num_points": 128,
                    "num_intervals": 127,
                    "detectors": ["Synced", "en_energy"],
                    "motors": ["WAXS Exposure", "SAXS Exposure", "en"],
                    "hints": {"dimensions": [[["time"], "primary"]]},
                }),
            ),
            ("stop", json!({})),
        ],
        dir.path(),
    );

    let c = Container::open(&path).unwrap();
    let start = "bluesky/start";
    assert_eq!(
        c.dataset(&format!("{start}/plan_name")).unwrap().scalar_str_value(),
        Some("full_carbon_scan_nd")
    );
    assert_eq!(
        c.dataset(&format!("{start}/scan_id")).unwrap().scalar_i64_value(),
        Some(6852)
    );
    assert_eq!(
        c.dataset(&format!("{start}/num_points")).unwrap().scalar_i64_value(),
        Some(128)
    );
    assert_eq!(
        c.dataset(&format!("{start}/detectors")).unwrap().as_str_slice(),
        Some(&["Synced".to_string(), "en_energy".to_string()][..])
    );
    assert_eq!(
        c.dataset(&format!("{start}/motors")).unwrap().as_str_slice(),
        Some(
            &[
                "WAXS Exposure".to_string(),
                "SAXS Exposure".to_string(),
                "en".to_string()
            ][..]
        )
    );
    // the too-complex hint degraded to JSON text
    let dimensions = c.dataset(&format!("{start}/hints/dimensions")).unwrap();
    let parsed: Value = serde_json::from_str(dimensions.scalar_str_value().unwrap()).unwrap();
    assert_eq!(parsed, json!([[["time"], "primary"]]));
}
