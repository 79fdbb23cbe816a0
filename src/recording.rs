//! Recording and replay of raw serial reads.
//!
//! Recordings are newline-delimited JSON, one [`RawRead`] per line. Stroke
//! pulses are never written; they arrive many times per second and carry no
//! information the datapoint stream does not. Replay preserves the recorded
//! inter-arrival gaps so downstream consumers see realistic timing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::warn;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::frame::{FrameKind, RawRead};

const DEFAULT_NAME: &str = "recording";

/// Path of a named recording inside the data directory.
pub fn file_path(data_dir: &Path, name: Option<&str>) -> PathBuf {
    data_dir.join(format!("{}.jsonl", name.unwrap_or(DEFAULT_NAME)))
}

/// Create (truncating) a recording file, making the data directory first.
pub async fn create(path: &Path) -> Result<fs::File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    Ok(fs::File::create(path).await?)
}

/// Append every non-pulse read from `rx` to `file` until the channel
/// closes or the subscription is detached.
pub async fn record(mut file: fs::File, mut rx: broadcast::Receiver<RawRead>) {
    loop {
        match rx.recv().await {
            Ok(raw) => {
                if raw.kind == FrameKind::Pulse {
                    continue;
                }
                let mut line = match serde_json::to_string(&raw) {
                    Ok(l) => l,
                    Err(e) => {
                        warn!("failed to serialize read: {}", e);
                        continue;
                    }
                };
                line.push('\n');
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    warn!("recording write failed, stopping: {}", e);
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("recording lagged, {} reads dropped", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    let _ = file.flush().await;
}

/// Load a recording. Lines that fail to parse are skipped with a warning
/// so a damaged tail does not lose the whole file.
pub async fn load(path: &Path) -> Result<Vec<RawRead>> {
    let text = fs::read_to_string(path).await?;
    let mut reads = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<RawRead>(line) {
            Ok(raw) => reads.push(raw),
            Err(e) => warn!("skipping line {} of {}: {}", idx + 1, path.display(), e),
        }
    }
    Ok(reads)
}

/// Replay a recording into `sink`, sleeping the recorded delta between
/// successive reads. The first read is delivered immediately; the future
/// resolves once the last read has been delivered.
pub async fn replay(path: &Path, mut sink: impl FnMut(RawRead)) -> Result<()> {
    let reads = load(path).await?;
    let mut last_time: Option<u64> = None;
    for raw in reads {
        if let Some(prev) = last_time {
            let delta = raw.time.saturating_sub(prev);
            if delta > 0 {
                tokio::time::sleep(Duration::from_millis(delta)).await;
            }
        }
        last_time = Some(raw.time);
        sink(raw);
    }
    Ok(())
}
