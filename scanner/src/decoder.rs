use qrscan_common::detection::{DetectionResult, Point, Quad};
use qrscan_common::frame::{Frame, BYTES_PER_PIXEL};
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, warn};

/// Opaque symbol decoder.
///
/// Implementations receive a tightly packed RGBA8 buffer. They run on the
/// decode worker thread, never on the coordinator.
pub trait Decoder: Send + Sync {
    fn decode(&self, pixels: &[u8], width: u32, height: u32)
        -> Result<DetectionResult, DecodeError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed pixel buffer: got {got} bytes, expected {expected}")]
    MalformedBuffer { got: usize, expected: usize },
    #[error("decoder failed: {0}")]
    Internal(String),
}

/// Run `decoder` on `frame`, folding every failure into `NoDetection`.
///
/// Errors and panics are logged and swallowed here so one bad frame can never
/// take the decode worker down.
pub fn decode_frame(decoder: &dyn Decoder, frame: &Frame) -> DetectionResult {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        decoder.decode(frame.pixels(), frame.width(), frame.height())
    }));

    match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            warn!(error = %e, decoder = decoder.name(), seq = frame.seq, "decode failed");
            DetectionResult::NoDetection
        }
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            warn!(error = message, decoder = decoder.name(), seq = frame.seq, "decoder panicked");
            DetectionResult::NoDetection
        }
    }
}

/// QR decoder backed by `rqrr`.
///
/// Converts RGBA to luma, detects grids, and returns the first grid that
/// decodes. Grid bounds come back clockwise from the top-left corner.
#[derive(Debug, Default, Clone, Copy)]
pub struct RqrrDecoder;

impl RqrrDecoder {
    fn luma(pixels: &[u8]) -> Vec<u8> {
        pixels
            .chunks_exact(BYTES_PER_PIXEL)
            .map(|px| ((px[0] as u32 * 77 + px[1] as u32 * 150 + px[2] as u32 * 29) >> 8) as u8)
            .collect()
    }
}

impl Decoder for RqrrDecoder {
    fn decode(
        &self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<DetectionResult, DecodeError> {
        let (w, h) = (width as usize, height as usize);
        let expected = w * h * BYTES_PER_PIXEL;
        if pixels.len() != expected {
            return Err(DecodeError::MalformedBuffer {
                got: pixels.len(),
                expected,
            });
        }

        let grey = Self::luma(pixels);
        let mut img = rqrr::PreparedImage::prepare_from_greyscale(w, h, |x, y| grey[y * w + x]);
        let grids = img.detect_grids();

        for grid in &grids {
            match grid.decode() {
                Ok((_, text)) => {
                    let [tl, tr, br, bl] = &grid.bounds;
                    let point = |p: &rqrr::Point| Point::new(p.x as f64, p.y as f64);
                    let quad = Quad::new(point(tl), point(tr), point(br), point(bl));
                    return Ok(DetectionResult::candidate(text, quad));
                }
                Err(e) => debug!(error = ?e, "grid detected but not decodable"),
            }
        }
        Ok(DetectionResult::NoDetection)
    }

    fn name(&self) -> &str {
        "rqrr"
    }
}
