use anyhow::{Context, Result};
use chrono::Utc;
use log::info;
use serde_json::json;
use std::path::PathBuf;
use uuid::Uuid;

use nxsas::export::{export_json, ExportOptions};
use nxsas::serializer::STREAM_DATA_LABEL;

/// Generate a synthetic monochromator scan and serialize it
pub fn run(output_dir: PathBuf, events: usize) -> Result<()> {
    info!("nxsas demo - synthetic energy scan with {} event(s)", events);

    let run_uid = Uuid::new_v4().to_string();
    let descriptor_uid = Uuid::new_v4().to_string();
    let t0 = Utc::now().timestamp() as f64;

    let start = json!({
        "uid": run_uid,
        "time": t0,
        "plan_name": "demo_energy_scan",
        "beamline_id": "SST-1",
        "detectors": ["en_energy"],
        "num_points": events,
        "md": {
            "techniques": [{
                "version": 1,
                "technique": "SAXS",
                "nxsas": {
                    "entry": {
                        "_attributes": {"NX_Class": "NXEntry", "default": "data"},
                        "program_name": "nxsas demo",
                        "end_time": "#bluesky/stop/time",
                        "instrument": {
                            "_attributes": {"NX_Class": "NXInstrument"},
                            "name": "#bluesky/start/beamline_id",
                        },
                    },
                },
            }],
        },
    });
    let descriptor = json!({
        "uid": descriptor_uid,
        "name": "primary",
        "run_start": run_uid,
        "data_keys": {
            "en_energy": {
                "dtype": "number",
                "shape": [],
                "source": "PY:en_energy.position",
                "units": "eV",
            },
        },
    });

    let mut documents = vec![
        ("start".to_string(), start),
        ("descriptor".to_string(), descriptor),
    ];

    // batch the scan into small event pages
    const PAGE_SIZE: usize = 4;
    let mut written = 0usize;
    while written < events {
        let n = PAGE_SIZE.min(events - written);
        let values: Vec<f64> = (0..n).map(|i| 270.0 + (written + i) as f64 * 0.5).collect();
        let stamps: Vec<f64> = (0..n).map(|i| t0 + (written + i) as f64).collect();
        documents.push((
            "event_page".to_string(),
            json!({
                "descriptor": descriptor_uid,
                "data": {"en_energy": values},
                "timestamps": {"en_energy": stamps},
            }),
        ));
        written += n;
    }

    documents.push((
        "stop".to_string(),
        json!({
            "uid": Uuid::new_v4().to_string(),
            "time": t0 + events as f64,
            "run_start": run_uid,
            "exit_status": "success",
            "num_events": {"primary": events},
        }),
    ));

    let artifacts = export_json(documents, &output_dir, &ExportOptions::default())
        .context("failed to export demo run")?;

    for path in &artifacts[STREAM_DATA_LABEL] {
        info!("wrote {}", path.display());
        println!("{}", path.display());
    }
    Ok(())
}
