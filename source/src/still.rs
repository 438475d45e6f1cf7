use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::slot::{LatestFrame, SlotSource};
use crate::{decode_image_blocking, SourceError};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

/// List the image files in `dir`, sorted by file name.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>, SourceError> {
    let entries =
        std::fs::read_dir(dir).map_err(|e| SourceError::Io(dir.display().to_string(), e))?;

    let mut images: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    images.sort();

    if images.is_empty() {
        return Err(SourceError::EmptyDirectory(dir.display().to_string()));
    }
    Ok(images)
}

/// Replay the images of a directory in a loop, one per `interval`.
pub fn spawn_directory(dir: &Path, interval: Duration) -> Result<SlotSource, SourceError> {
    let images = list_images(dir)?;
    info!(dir = dir.display().to_string(), images = images.len(), "replaying still images");

    let slot = LatestFrame::new();
    let task_slot = slot.clone();
    let name = format!("directory:{}", dir.display());
    let task = tokio::spawn(async move { run_directory_source(images, interval, &task_slot).await });
    Ok(SlotSource::new(slot, Some(task), name))
}

async fn run_directory_source(images: Vec<PathBuf>, interval: Duration, slot: &LatestFrame) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    for path in images.iter().cycle() {
        ticker.tick().await;

        let bytes = match tokio::fs::read(path).await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, path = path.display().to_string(), "failed to read image");
                continue;
            }
        };
        match decode_image_blocking(bytes).await {
            Ok(frame) => {
                debug!(seq = frame.seq, path = path.display().to_string(), "publishing still frame");
                slot.publish(frame);
            }
            Err(e) => warn!(error = %e, path = path.display().to_string(), "failed to decode image"),
        }
    }
}
