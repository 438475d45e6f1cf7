pub mod mjpeg;
pub mod slot;
pub mod still;

use qrscan_common::frame::{Frame, FrameError};
use std::sync::atomic::{AtomicU64, Ordering};

pub use slot::{LatestFrame, SlotSource};

static SEQ_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("HTTP connection failed: {0}")]
    HttpConnect(reqwest::Error),
    #[error("HTTP stream error: {0}")]
    HttpStream(reqwest::Error),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error("failed to decode image: {0}")]
    Image(#[from] image::ImageError),
    #[error("invalid frame: {0}")]
    Frame(#[from] FrameError),
    #[error("failed to read {0}: {1}")]
    Io(String, std::io::Error),
    #[error("no images found in {0}")]
    EmptyDirectory(String),
    #[error("image decode task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Decode an encoded image (JPEG, PNG, ...) into an RGBA frame.
pub fn decode_image(bytes: &[u8]) -> Result<Frame, SourceError> {
    let rgba = image::load_from_memory(bytes)?.to_rgba8();
    let (width, height) = rgba.dimensions();
    let seq = SEQ_COUNTER.fetch_add(1, Ordering::Relaxed);
    Ok(Frame::captured_now(rgba.into_raw(), width, height, seq)?)
}

/// Same as [`decode_image`] but off the async executor.
pub async fn decode_image_blocking(bytes: Vec<u8>) -> Result<Frame, SourceError> {
    tokio::task::spawn_blocking(move || decode_image(&bytes)).await?
}
