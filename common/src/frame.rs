/// Bytes per pixel of the only supported layout (RGBA8).
pub const BYTES_PER_PIXEL: usize = 4;

/// A captured RGBA8 frame with timestamp metadata.
///
/// The pixel buffer is owned. Handing a `Frame` to the decoder moves it, so
/// the producer can no longer read or reuse the buffer once it is submitted.
#[derive(Debug)]
pub struct Frame {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    pub captured_at_ms: i64,
    pub seq: u64,
}

impl Frame {
    /// Wrap an RGBA8 buffer. The buffer length must be `width * height * 4`.
    pub fn new(
        pixels: Vec<u8>,
        width: u32,
        height: u32,
        captured_at_ms: i64,
        seq: u64,
    ) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::EmptyDimensions { width, height });
        }
        let expected = width as usize * height as usize * BYTES_PER_PIXEL;
        if pixels.len() != expected {
            return Err(FrameError::LengthMismatch {
                got: pixels.len(),
                expected,
                width,
                height,
            });
        }
        Ok(Self {
            pixels,
            width,
            height,
            captured_at_ms,
            seq,
        })
    }

    /// Stamp a buffer with the current wall-clock time.
    pub fn captured_now(
        pixels: Vec<u8>,
        width: u32,
        height: u32,
        seq: u64,
    ) -> Result<Self, FrameError> {
        Self::new(pixels, width, height, chrono::Utc::now().timestamp_millis(), seq)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Frame area in pixels.
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Consume the frame and take its buffer.
    pub fn into_pixels(self) -> Vec<u8> {
        self.pixels
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame has empty dimensions {width}x{height}")]
    EmptyDimensions { width: u32, height: u32 },
    #[error("frame buffer is {got} bytes, expected {expected} for {width}x{height} RGBA")]
    LengthMismatch {
        got: usize,
        expected: usize,
        width: u32,
        height: u32,
    },
}

/// Readiness of a frame source, checked passively on every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// No frame data yet (connecting, warming up, or released).
    NotReady,
    /// At least one frame has been captured.
    Ready,
}

/// Something that exposes the most recent captured frame.
///
/// Acquisition (device selection, permissions, reconnects) lives behind this
/// trait; the scan pipeline only ever asks for the current frame.
pub trait FrameSource: Send {
    fn ready_state(&self) -> ReadyState;

    /// Returns the newest frame not yet handed out, or `None` if there is none.
    fn current_frame(&mut self) -> Option<Frame>;

    /// Release the underlying device or stream. Called once when the pipeline stops.
    fn release(&mut self) {}

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}
