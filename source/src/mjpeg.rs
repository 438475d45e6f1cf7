use bytes::BytesMut;
use futures_util::StreamExt;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::slot::{LatestFrame, SlotSource};
use crate::{decode_image_blocking, SourceError};

const DEFAULT_BOUNDARY: &str = "frame";
const HEADER_END: &[u8] = b"\r\n\r\n";
const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Parse state for a `multipart/x-mixed-replace` stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    /// Looking for the `--boundary` marker.
    SeekingBoundary,
    /// Found the marker, looking for the end of the part headers.
    SeekingHeaderEnd,
    /// Collecting part bytes until the next marker.
    CollectingPart,
}

/// Incremental splitter for MJPEG multipart bodies.
///
/// Chunks can cut anywhere, including through a boundary marker; bytes are
/// buffered until a complete part is seen.
pub struct MultipartParser {
    marker: Vec<u8>,
    buffer: BytesMut,
    state: ParseState,
    /// Offset in `buffer` from which to resume scanning for the next marker.
    scan_from: usize,
}

impl MultipartParser {
    pub fn new(boundary: &str) -> Self {
        Self {
            marker: format!("--{boundary}").into_bytes(),
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
            scan_from: 0,
        }
    }

    /// Build a parser from a `Content-Type` header value, falling back to the
    /// conventional `frame` boundary.
    pub fn from_content_type(content_type: Option<&str>) -> Self {
        let boundary = content_type
            .and_then(boundary_param)
            .unwrap_or(DEFAULT_BOUNDARY);
        Self::new(boundary)
    }

    /// Feed a chunk and return every part that is now complete.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);
        let mut parts = Vec::new();

        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    if let Some(pos) = find_subsequence(&self.buffer, &self.marker) {
                        let _ = self.buffer.split_to(pos + self.marker.len());
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Keep a tail in case the marker spans chunks
                        let keep = self.marker.len();
                        if self.buffer.len() > keep {
                            let _ = self.buffer.split_to(self.buffer.len() - keep);
                        }
                        break;
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    if let Some(pos) = find_subsequence(&self.buffer, HEADER_END) {
                        let _ = self.buffer.split_to(pos + HEADER_END.len());
                        self.scan_from = 0;
                        self.state = ParseState::CollectingPart;
                    } else {
                        break;
                    }
                }
                ParseState::CollectingPart => {
                    let found = find_subsequence(&self.buffer[self.scan_from..], &self.marker);
                    let Some(pos) = found else {
                        self.scan_from = self.buffer.len().saturating_sub(self.marker.len());
                        break;
                    };
                    let part_end = self.scan_from + pos;
                    // Strip the CRLF that precedes the marker
                    let end = if part_end >= 2 && &self.buffer[part_end - 2..part_end] == b"\r\n" {
                        part_end - 2
                    } else {
                        part_end
                    };
                    let part = self.buffer[..end].to_vec();
                    let _ = self.buffer.split_to(part_end + self.marker.len());
                    if !part.is_empty() {
                        parts.push(part);
                    }
                    self.state = ParseState::SeekingHeaderEnd;
                }
            }
        }

        parts
    }
}

/// Extract the `boundary=` parameter from a multipart content type.
fn boundary_param(content_type: &str) -> Option<&str> {
    content_type
        .split(';')
        .filter_map(|param| param.trim().strip_prefix("boundary="))
        .map(|b| b.trim_matches('"'))
        .find(|b| !b.is_empty())
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Start reading an MJPEG stream into a fresh slot.
pub fn spawn_mjpeg(url: String) -> SlotSource {
    let slot = LatestFrame::new();
    let task_slot = slot.clone();
    let name = format!("mjpeg:{url}");
    let task = tokio::spawn(async move { run_mjpeg_source(&url, &task_slot).await });
    SlotSource::new(slot, Some(task), name)
}

/// Start polling a snapshot endpoint into a fresh slot.
pub fn spawn_polling(url: String, interval: Duration) -> SlotSource {
    let slot = LatestFrame::new();
    let task_slot = slot.clone();
    let name = format!("polling:{url}");
    let task = tokio::spawn(async move { run_polling_source(&url, interval, &task_slot).await });
    SlotSource::new(slot, Some(task), name)
}

/// Consume the MJPEG stream and publish decoded frames.
/// Reconnects with exponential backoff on failure.
pub async fn run_mjpeg_source(stream_url: &str, slot: &LatestFrame) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        info!(url = stream_url, "connecting to MJPEG stream");
        match consume_stream(stream_url, slot).await {
            Ok(()) => {
                info!("stream ended cleanly, reconnecting");
                backoff = INITIAL_BACKOFF;
            }
            Err(e) => {
                error!(error = %e, "stream error, reconnecting in {:?}", backoff);
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn consume_stream(url: &str, slot: &LatestFrame) -> Result<(), SourceError> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(SourceError::HttpConnect)?;
    let response = client
        .get(url)
        .send()
        .await
        .map_err(SourceError::HttpConnect)?;

    if !response.status().is_success() {
        return Err(SourceError::HttpStatus(response.status().as_u16()));
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    info!(status = %response.status(), content_type, "connected to MJPEG stream");

    let mut parser = MultipartParser::from_content_type(content_type.as_deref());
    let mut byte_stream = response.bytes_stream();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = chunk.map_err(SourceError::HttpStream)?;
        for jpeg in parser.push(&chunk) {
            let bytes = jpeg.len();
            match decode_image_blocking(jpeg).await {
                Ok(frame) => {
                    debug!(seq = frame.seq, bytes, "publishing MJPEG frame");
                    slot.publish(frame);
                }
                Err(e) => warn!(error = %e, bytes, "failed to decode MJPEG part, skipping"),
            }
        }
    }

    Ok(())
}

/// Polling-based fallback: periodically fetch single frames.
pub async fn run_polling_source(frame_url: &str, interval: Duration, slot: &LatestFrame) {
    let client = reqwest::Client::new();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        match client.get(frame_url).send().await {
            Ok(resp) if resp.status().is_success() => {
                let body = match resp.bytes().await {
                    Ok(b) => b.to_vec(),
                    Err(e) => {
                        warn!(error = %e, "failed to read camera snapshot body");
                        continue;
                    }
                };
                match decode_image_blocking(body).await {
                    Ok(frame) => slot.publish(frame),
                    Err(e) => warn!(error = %e, "failed to decode camera snapshot"),
                }
            }
            Ok(resp) => {
                warn!(status = %resp.status(), "non-success response from camera");
            }
            Err(e) => {
                warn!(error = %e, "failed to fetch camera frame");
            }
        }
    }
}
