//! Landmark replay: feeds recorded hand poses (JSON lines) through the gesture
//! pipeline and prints every resulting event as a JSON line on stdout.
//!
//! usage: landmark_replay <poses.jsonl> [gesture.toml]
//!
//! Each input line is a `HandPose` plus `timestamp_us`, optionally with
//! `"pointer_mode": true|false` to toggle pointer mode before that frame.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use handsfree_gesture::config::Config;
use handsfree_gesture::pipeline::GesturePipeline;
use handsfree_gesture::pose::HandPose;
use handsfree_gesture::sink::ChannelSink;

#[derive(Debug, Deserialize)]
struct Record {
    timestamp_us: u64,
    #[serde(default)]
    pointer_mode: Option<bool>,
    #[serde(flatten)]
    pose: HandPose,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let input = args
        .next()
        .context("usage: landmark_replay <poses.jsonl> [gesture.toml]")?;
    let config = match args.next() {
        Some(path) => Config::load(&path)?,
        None => Config::default(),
    };
    info!("Landmark Replay ({})", env!("GIT_VERSION"));

    let reader = BufReader::new(File::open(&input).with_context(|| format!("failed to open {}", input))?);
    let (sink, events) = ChannelSink::new();
    let mut pipeline = GesturePipeline::new(&config, sink);
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    for (n, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read {}", input))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: Record = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(e) => {
                warn!("line {}: {}", n + 1, e);
                continue;
            }
        };
        if let Some(active) = record.pointer_mode {
            pipeline.set_pointer_mode(active);
        }
        pipeline.process(Ok(record.pose), record.timestamp_us);

        for event in events.try_iter() {
            writeln!(out, "{}", serde_json::to_string(&event)?)?;
        }
    }

    pipeline.shutdown();
    for event in events.try_iter() {
        writeln!(out, "{}", serde_json::to_string(&event)?)?;
    }

    let stats = pipeline.stats();
    info!(
        frames = stats.frames,
        hands = stats.hands,
        gestures = stats.gestures,
        "replay finished"
    );
    Ok(())
}
