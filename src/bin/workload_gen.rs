//! Synthetic workload generator
//!
//! Emits a linear pipeline task (one environment-fed source, a chain of
//! compute tiles, one sink) as a workload JSON the `simulate` binary can
//! run directly. Handy for smoke-testing a grid/bandwidth configuration
//! without the upstream mapper.

#![forbid(unsafe_code)]

use std::{env, fs};

use nocsim::{DataItem, Dependence, SimConfig, TileBehavior};

fn parse_flag(args: &[String], key: &str) -> Option<String> {
    let mut it = args.iter();
    while let Some(a) = it.next() {
        if a == key {
            return it.next().cloned();
        }
    }
    None
}

fn item(from_tile: i64, bits: u64) -> DataItem {
    DataItem::Payload {
        x: 0,
        y: 0,
        start: 0,
        end: bits,
        bit: 1,
        total: 1,
        image_id: 0,
        layer_id: from_tile.max(0),
        in_id: 0,
        tile_id: from_tile,
    }
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    let tiles: usize = parse_flag(&args, "--tiles").and_then(|s| s.parse().ok()).unwrap_or(4);
    let images: usize = parse_flag(&args, "--images").and_then(|s| s.parse().ok()).unwrap_or(8);
    let latency: f64 = parse_flag(&args, "--latency").and_then(|s| s.parse().ok()).unwrap_or(1000.0);
    let bits: u64 = parse_flag(&args, "--item-bits").and_then(|s| s.parse().ok()).unwrap_or(2048);
    let band_width: f64 =
        parse_flag(&args, "--band-width").and_then(|s| s.parse().ok()).unwrap_or(1.0);
    let rows: usize = parse_flag(&args, "--rows").and_then(|s| s.parse().ok()).unwrap_or(2);
    let cols: usize = parse_flag(&args, "--cols")
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| tiles.div_ceil(2).max(1));
    let out = parse_flag(&args, "--out").unwrap_or_else(|| "workload.json".to_string());

    if tiles < 2 {
        return Err(anyhow::anyhow!("--tiles must be at least 2 (source and sink)"));
    }
    if rows * cols < tiles {
        return Err(anyhow::anyhow!(
            "grid {rows}x{cols} cannot hold {tiles} tiles; raise --rows/--cols"
        ));
    }

    let mut task = Vec::with_capacity(tiles);
    for k in 0..tiles as i64 {
        let wait = vec![item(k - 1, bits)];
        task.push(TileBehavior {
            task_id: 0,
            tile_id: k,
            layer_id: k,
            target_tile_id: if k + 1 < tiles as i64 { vec![k + 1] } else { vec![-1] },
            source_tile_id: if k == 0 { vec![-1] } else { vec![k - 1] },
            control_tile_id: None,
            exit_id: None,
            dependence: vec![Dependence {
                wait: wait.clone(),
                output: vec![item(k, bits)],
                drop: wait,
                latency,
            }],
        });
    }

    let config = SimConfig {
        task_behavior_list: vec![task],
        image_num: images,
        tile_net_shape: (rows, cols),
        buffer_size: (4 * bits, 4 * bits),
        band_width,
        mapping_strategy: "naive".into(),
        schedule_strategy: "naive".into(),
        sample_list: Vec::new(),
    };

    fs::write(&out, serde_json::to_string_pretty(&config)?)
        .map_err(|e| anyhow::anyhow!("write {out}: {e}"))?;
    eprintln!("wrote {out}: {tiles} tiles, {images} images on a {rows}x{cols} grid");
    Ok(())
}
