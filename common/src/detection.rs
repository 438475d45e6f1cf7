use std::fmt;

/// A point in frame-pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// Corner geometry of a detected symbol, clockwise from the top-left corner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quad {
    pub top_left: Point,
    pub top_right: Point,
    pub bottom_right: Point,
    pub bottom_left: Point,
}

impl Quad {
    pub fn new(top_left: Point, top_right: Point, bottom_right: Point, bottom_left: Point) -> Self {
        Self {
            top_left,
            top_right,
            bottom_right,
            bottom_left,
        }
    }

    /// Axis-aligned square of side `side` anchored at `(x, y)`.
    pub fn square(x: f64, y: f64, side: f64) -> Self {
        Self::new(
            Point::new(x, y),
            Point::new(x + side, y),
            Point::new(x + side, y + side),
            Point::new(x, y + side),
        )
    }

    pub fn top_edge(&self) -> f64 {
        self.top_left.distance(&self.top_right)
    }

    pub fn left_edge(&self) -> f64 {
        self.top_left.distance(&self.bottom_left)
    }

    /// Top edge times left edge. Exact for rectangles, an estimate otherwise.
    pub fn approx_area(&self) -> f64 {
        self.top_edge() * self.left_edge()
    }
}

/// A decode hit before any quality filtering.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub text: String,
    pub geometry: Quad,
}

/// Raw output of one decode call.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectionResult {
    NoDetection,
    Candidate(Candidate),
}

impl DetectionResult {
    pub fn candidate(text: impl Into<String>, geometry: Quad) -> Self {
        DetectionResult::Candidate(Candidate {
            text: text.into(),
            geometry,
        })
    }
}

/// Why a candidate detection was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The symbol covers too little of the frame to be trusted.
    TooSmall,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::TooSmall => f.write_str("too-small"),
        }
    }
}

/// Result of one completed decode cycle. Exactly one is emitted per decode.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    NewCode { code: String, geometry: Option<Quad> },
    DuplicateCode { code: String, geometry: Option<Quad> },
    Rejected(RejectReason),
    NoDetection,
}

impl ScanOutcome {
    pub fn code(&self) -> Option<&str> {
        match self {
            ScanOutcome::NewCode { code, .. } | ScanOutcome::DuplicateCode { code, .. } => {
                Some(code)
            }
            _ => None,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, ScanOutcome::NewCode { .. })
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ScanOutcome::NewCode { .. } => "new-code",
            ScanOutcome::DuplicateCode { .. } => "duplicate",
            ScanOutcome::Rejected(_) => "rejected",
            ScanOutcome::NoDetection => "no-detection",
        }
    }
}
