//! CLI driver: load a workload, evaluate it, dump the records
//!
//! Runs every candidate arrangement through the transparent and opaque
//! passes and writes the experiment records next to the working
//! directory. Logging goes through `tracing`; set `RUST_LOG` (or `--log`)
//! to raise or lower the verbosity.

#![forbid(unsafe_code)]

use std::{env, fs, path::Path};

use nocsim::{array::BaseArray, SimConfig};
use tracing_subscriber::EnvFilter;

fn parse_flag(args: &[String], key: &str) -> Option<String> {
    let mut it = args.iter();
    while let Some(a) = it.next() {
        if a == key {
            return it.next().cloned();
        }
    }
    None
}

fn load_config(path: &Path) -> anyhow::Result<SimConfig> {
    let text = fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("read workload {}: {e}", path.display()))?;
    serde_json::from_str(&text).map_err(|e| anyhow::anyhow!("parse workload {}: {e}", path.display()))
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    let log_level = parse_flag(&args, "--log").unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .init();

    let workload = parse_flag(&args, "--workload")
        .ok_or_else(|| anyhow::anyhow!("--workload <file.json> is required"))?;
    let mut config = load_config(Path::new(&workload))?;

    // optional overrides
    if let Some(image_num) = parse_flag(&args, "--image-num").and_then(|s| s.parse().ok()) {
        config.image_num = image_num;
    }
    if let Some(mapping) = parse_flag(&args, "--mapping") {
        config.mapping_strategy = mapping;
    }
    if let Some(schedule) = parse_flag(&args, "--schedule") {
        config.schedule_strategy = schedule;
    }

    let mut array = BaseArray::new(config).map_err(|e| anyhow::anyhow!("configure array: {e}"))?;
    let records = array.run().map_err(|e| anyhow::anyhow!("simulation failed: {e}"))?;

    for (i, record) in records.iter().enumerate() {
        eprintln!(
            "arrangement {i}: latency {:.3}, fitness {}, {} communications",
            record.latency / 1e6,
            record.fitness,
            record.communication_info_list.len()
        );
    }

    let path = array.save_records()?;
    eprintln!("wrote {}", path.display());
    Ok(())
}
