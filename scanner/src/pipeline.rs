use qrscan_common::config::Config;
use qrscan_common::detection::{DetectionResult, ScanOutcome};
use qrscan_common::frame::{FrameSource, ReadyState};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::decoder::Decoder;
use crate::filter::{DetectionFilter, QualityFilter};
use crate::gate::{Gate, GateState, RateLimiter};
use crate::session::{Classification, SessionStore};
use crate::transport::{Completion, Transport, TransportStats};

/// Tunables for the scan loop.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub cooldown: Duration,
    pub min_submit_interval: Duration,
    pub decode_timeout: Option<Duration>,
    pub min_area_fraction: f64,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            cooldown: config.gate.cooldown(),
            min_submit_interval: config.pipeline.min_submit_interval(),
            decode_timeout: config.pipeline.decode_timeout(),
            min_area_fraction: config.filter.min_area_fraction,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// One emitted outcome plus the session counter after applying it.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanEvent {
    pub outcome: ScanOutcome,
    pub frame_seq: u64,
    pub distinct_codes: usize,
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    SourceNotReady,
    GateClosed,
    Busy,
    Throttled,
    NoFrame,
    Submitted,
    /// The transport refused the frame (worker unavailable).
    Dropped,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PipelineStats {
    pub ticks: u64,
    pub new_codes: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub no_detection: u64,
    pub watchdog_restarts: u64,
}

impl PipelineStats {
    fn record(&mut self, outcome: &ScanOutcome) {
        match outcome {
            ScanOutcome::NewCode { .. } => self.new_codes += 1,
            ScanOutcome::DuplicateCode { .. } => self.duplicates += 1,
            ScanOutcome::Rejected(_) => self.rejected += 1,
            ScanOutcome::NoDetection => self.no_detection += 1,
        }
    }
}

/// Scan loop coordinator.
///
/// Pulls frames from the source, gates them, hands them to the decode
/// transport, and turns each completion into exactly one [`ScanEvent`].
/// Gate and session store are owned here and touched by nothing else.
pub struct ScanPipeline<S: FrameSource> {
    source: S,
    transport: Transport,
    filter: Box<dyn DetectionFilter>,
    store: SessionStore,
    gate: Gate,
    limiter: RateLimiter,
    decode_timeout: Option<Duration>,
    clock: Arc<dyn Clock>,
    events: mpsc::UnboundedSender<ScanEvent>,
    stats: PipelineStats,
}

impl<S: FrameSource> ScanPipeline<S> {
    pub fn new(
        source: S,
        decoder: Arc<dyn Decoder>,
        store: SessionStore,
        settings: PipelineSettings,
        clock: Arc<dyn Clock>,
        events: mpsc::UnboundedSender<ScanEvent>,
    ) -> Self {
        Self {
            source,
            transport: Transport::new(decoder),
            filter: Box::new(QualityFilter::new(settings.min_area_fraction)),
            store,
            gate: Gate::new(settings.cooldown),
            limiter: RateLimiter::new(settings.min_submit_interval),
            decode_timeout: settings.decode_timeout,
            clock,
            events,
            stats: PipelineStats::default(),
        }
    }

    /// Replace the default quality filter.
    pub fn with_filter(mut self, filter: Box<dyn DetectionFilter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn gate_state(&self) -> GateState {
        self.gate.state()
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn transport_stats(&self) -> TransportStats {
        self.transport.stats()
    }

    /// One sampling step: submit the current frame if everything allows it.
    pub fn tick(&mut self) -> TickAction {
        let now = self.clock.now();
        self.stats.ticks += 1;
        self.check_watchdog(now);

        if self.source.ready_state() != ReadyState::Ready {
            return TickAction::SourceNotReady;
        }
        if !self.gate.is_open(now) {
            return TickAction::GateClosed;
        }
        if self.transport.is_busy() {
            return TickAction::Busy;
        }
        if !self.limiter.is_ready(now) {
            return TickAction::Throttled;
        }
        let Some(frame) = self.source.current_frame() else {
            return TickAction::NoFrame;
        };

        if self.transport.submit(frame, now) {
            self.limiter.record(now);
            TickAction::Submitted
        } else {
            TickAction::Dropped
        }
    }

    fn check_watchdog(&mut self, now: Instant) {
        let Some(timeout) = self.decode_timeout else {
            return;
        };
        let Some(elapsed) = self.transport.in_flight_for(now) else {
            return;
        };
        if elapsed < timeout {
            return;
        }
        warn!(
            elapsed_ms = elapsed.as_millis() as u64,
            timeout_ms = timeout.as_millis() as u64,
            "decode exceeded timeout, restarting decode worker"
        );
        self.stats.watchdog_restarts += 1;
        if let Some(completion) = self.transport.restart() {
            self.handle_completion(completion);
        }
    }

    /// Filter, classify and emit the outcome of one decode.
    pub fn handle_completion(&mut self, completion: Completion) -> ScanOutcome {
        let Completion {
            frame_seq,
            width,
            height,
            result,
            ..
        } = completion;

        let outcome = match result {
            DetectionResult::NoDetection => ScanOutcome::NoDetection,
            DetectionResult::Candidate(candidate) => {
                match self.filter.check(&candidate, width, height) {
                    Err(reason) => ScanOutcome::Rejected(reason),
                    Ok(()) => match self.store.classify(&candidate.text) {
                        Classification::New => {
                            // Close before the outcome leaves this function so
                            // no frame can slip through in between.
                            self.gate.close_for_cooldown(self.clock.now());
                            ScanOutcome::NewCode {
                                code: candidate.text,
                                geometry: Some(candidate.geometry),
                            }
                        }
                        Classification::Duplicate => ScanOutcome::DuplicateCode {
                            code: candidate.text,
                            geometry: Some(candidate.geometry),
                        },
                    },
                }
            }
        };

        self.stats.record(&outcome);
        match &outcome {
            ScanOutcome::NewCode { code, .. } => {
                info!(code, frame_seq, distinct = self.store.len(), "new code accepted")
            }
            ScanOutcome::DuplicateCode { code, .. } => debug!(code, frame_seq, "duplicate code"),
            ScanOutcome::Rejected(reason) => {
                debug!(reason = %reason, filter = self.filter.name(), frame_seq, "detection rejected")
            }
            ScanOutcome::NoDetection => {}
        }

        let event = ScanEvent {
            outcome: outcome.clone(),
            frame_seq,
            distinct_codes: self.store.len(),
        };
        if self.events.send(event).is_err() {
            debug!("no outcome listener, event dropped");
        }
        outcome
    }

    /// Wait for the outstanding decode and handle it.
    /// Returns `None` when nothing is in flight.
    pub async fn step(&mut self) -> Option<ScanOutcome> {
        let completion = self.transport.next_completion().await?;
        Some(self.handle_completion(completion))
    }

    /// Drive the pipeline until `shutdown` flips to `true` (or its sender is
    /// dropped), then stop and hand back the session store.
    pub async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
        tick_interval: Duration,
    ) -> SessionStore {
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            source = self.source.name(),
            tick_ms = tick_interval.as_millis() as u64,
            cooldown_ms = self.gate.cooldown().as_millis() as u64,
            "scan pipeline running"
        );

        while !*shutdown.borrow() {
            let busy = self.transport.is_busy();
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick();
                }
                Some(completion) = self.transport.next_completion(), if busy => {
                    self.handle_completion(completion);
                }
                _ = shutdown.changed() => {}
            }
            if shutdown.has_changed().is_err() {
                break;
            }
        }

        self.stop()
    }

    /// Stop sampling, release the source and terminate the decode worker.
    /// A decode still in flight is discarded without an event.
    pub fn stop(mut self) -> SessionStore {
        self.transport.shutdown();
        self.source.release();
        let stats = self.stats;
        info!(
            ticks = stats.ticks,
            new_codes = stats.new_codes,
            duplicates = stats.duplicates,
            rejected = stats.rejected,
            no_detection = stats.no_detection,
            watchdog_restarts = stats.watchdog_restarts,
            "scan pipeline stopped"
        );
        self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::manual::ManualClock;
    use crate::clock::SystemClock;
    use crate::decoder::testing::{ScriptedDecoder, Step};
    use qrscan_common::detection::{Point, Quad, RejectReason};
    use qrscan_common::frame::Frame;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc as std_mpsc;

    const SIDE: u32 = 100;

    /// Always has a fresh 100x100 frame once ready.
    struct TestSource {
        ready: bool,
        next_seq: u64,
        released: Arc<AtomicBool>,
    }

    impl TestSource {
        fn ready() -> Self {
            Self {
                ready: true,
                next_seq: 0,
                released: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl FrameSource for TestSource {
        fn ready_state(&self) -> ReadyState {
            if self.ready {
                ReadyState::Ready
            } else {
                ReadyState::NotReady
            }
        }

        fn current_frame(&mut self) -> Option<Frame> {
            let seq = self.next_seq;
            self.next_seq += 1;
            Frame::new(vec![0; (SIDE * SIDE * 4) as usize], SIDE, SIDE, 0, seq).ok()
        }

        fn release(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    /// Half the frame: well above any threshold.
    fn big(text: &str) -> DetectionResult {
        DetectionResult::candidate(text, Quad::square(0.0, 0.0, 50.0))
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            cooldown: Duration::from_millis(500),
            min_submit_interval: Duration::ZERO,
            decode_timeout: None,
            min_area_fraction: 0.001,
        }
    }

    fn pipeline(
        source: TestSource,
        decoder: Arc<ScriptedDecoder>,
        settings: PipelineSettings,
        clock: &ManualClock,
    ) -> (ScanPipeline<TestSource>, mpsc::UnboundedReceiver<ScanEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pipeline = ScanPipeline::new(
            source,
            decoder,
            SessionStore::in_memory(),
            settings,
            Arc::new(clock.clone()),
            tx,
        );
        (pipeline, rx)
    }

    #[tokio::test]
    async fn new_code_closes_gate_and_repeat_is_duplicate() {
        let clock = ManualClock::new();
        let decoder = Arc::new(ScriptedDecoder::returning([big("A1"), big("A1")]));
        let (mut p, mut events) = pipeline(TestSource::ready(), decoder, settings(), &clock);

        assert_eq!(p.tick(), TickAction::Submitted);
        let outcome = p.step().await.unwrap();
        assert!(matches!(outcome, ScanOutcome::NewCode { ref code, .. } if code == "A1"));
        assert!(matches!(p.gate_state(), GateState::Closed { .. }));

        clock.advance_ms(499);
        assert_eq!(p.tick(), TickAction::GateClosed);
        clock.advance_ms(1);
        assert_eq!(p.tick(), TickAction::Submitted);

        let outcome = p.step().await.unwrap();
        assert!(matches!(outcome, ScanOutcome::DuplicateCode { ref code, .. } if code == "A1"));
        assert_eq!(p.gate_state(), GateState::Open);
        assert_eq!(p.store().len(), 1);

        let first = events.try_recv().unwrap();
        assert!(first.outcome.is_new());
        assert_eq!(first.distinct_codes, 1);
        let second = events.try_recv().unwrap();
        assert_eq!(second.outcome.kind(), "duplicate");
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn noisy_detection_is_rejected_and_gate_stays_open() {
        let clock = ManualClock::new();
        // 5 x 1 px on a 100x100 frame = 0.0005 of the frame
        let tiny = DetectionResult::candidate(
            "NOISE",
            Quad::new(
                Point::new(0.0, 0.0),
                Point::new(5.0, 0.0),
                Point::new(5.0, 1.0),
                Point::new(0.0, 1.0),
            ),
        );
        let decoder = Arc::new(ScriptedDecoder::returning([tiny]));
        let (mut p, _events) = pipeline(TestSource::ready(), decoder, settings(), &clock);

        assert_eq!(p.tick(), TickAction::Submitted);
        assert_eq!(
            p.step().await.unwrap(),
            ScanOutcome::Rejected(RejectReason::TooSmall)
        );
        assert_eq!(p.gate_state(), GateState::Open);
        assert!(p.store().is_empty());
        assert_eq!(p.tick(), TickAction::Submitted);
    }

    #[tokio::test]
    async fn no_detection_passes_through() {
        let clock = ManualClock::new();
        let decoder = Arc::new(ScriptedDecoder::default());
        let (mut p, mut events) = pipeline(TestSource::ready(), decoder, settings(), &clock);

        assert_eq!(p.tick(), TickAction::Submitted);
        assert_eq!(p.step().await.unwrap(), ScanOutcome::NoDetection);
        assert_eq!(events.try_recv().unwrap().outcome, ScanOutcome::NoDetection);
        assert_eq!(p.gate_state(), GateState::Open);
    }

    #[tokio::test]
    async fn ticks_while_busy_never_submit() {
        let clock = ManualClock::new();
        let (release, hold) = std_mpsc::channel();
        let decoder = Arc::new(ScriptedDecoder::new([Step::Wait(hold)]));
        let (mut p, _events) = pipeline(TestSource::ready(), decoder.clone(), settings(), &clock);

        assert_eq!(p.tick(), TickAction::Submitted);
        for _ in 0..5 {
            clock.advance_ms(16);
            assert_eq!(p.tick(), TickAction::Busy);
        }

        release.send(big("B2")).unwrap();
        assert!(p.step().await.unwrap().is_new());
        assert_eq!(p.transport_stats().submitted, 1);
        assert_eq!(decoder.calls(), 1);
    }

    #[tokio::test]
    async fn rate_limiter_spaces_submissions() {
        let clock = ManualClock::new();
        let decoder = Arc::new(ScriptedDecoder::default());
        let mut s = settings();
        s.min_submit_interval = Duration::from_millis(100);
        let (mut p, _events) = pipeline(TestSource::ready(), decoder, s, &clock);

        assert_eq!(p.tick(), TickAction::Submitted);
        p.step().await.unwrap();
        clock.advance_ms(50);
        assert_eq!(p.tick(), TickAction::Throttled);
        clock.advance_ms(50);
        assert_eq!(p.tick(), TickAction::Submitted);
    }

    #[tokio::test]
    async fn source_not_ready_is_a_noop() {
        let clock = ManualClock::new();
        let decoder = Arc::new(ScriptedDecoder::default());
        let mut source = TestSource::ready();
        source.ready = false;
        let (mut p, _events) = pipeline(source, decoder.clone(), settings(), &clock);

        assert_eq!(p.tick(), TickAction::SourceNotReady);
        assert!(p.step().await.is_none());
        assert_eq!(decoder.calls(), 0);
    }

    #[tokio::test]
    async fn watchdog_restarts_hung_decode() {
        let clock = ManualClock::new();
        let (_release, hold) = std_mpsc::channel();
        let decoder = Arc::new(ScriptedDecoder::new([
            Step::Wait(hold),
            Step::Return(big("C3")),
        ]));
        let mut s = settings();
        s.decode_timeout = Some(Duration::from_millis(1000));
        let (mut p, mut events) = pipeline(TestSource::ready(), decoder.clone(), s, &clock);

        assert_eq!(p.tick(), TickAction::Submitted);
        decoder.wait_for_calls(1);
        clock.advance_ms(999);
        assert_eq!(p.tick(), TickAction::Busy);
        clock.advance_ms(1);
        // Watchdog fires, then the same tick submits to the fresh worker.
        assert_eq!(p.tick(), TickAction::Submitted);
        assert_eq!(events.try_recv().unwrap().outcome, ScanOutcome::NoDetection);
        assert_eq!(p.stats().watchdog_restarts, 1);

        assert!(p.step().await.unwrap().is_new());
    }

    #[tokio::test]
    async fn stop_discards_in_flight_and_releases_source() {
        let clock = ManualClock::new();
        let (release, hold) = std_mpsc::channel();
        let decoder = Arc::new(ScriptedDecoder::new([Step::Wait(hold)]));
        let source = TestSource::ready();
        let released = Arc::clone(&source.released);
        let (mut p, mut events) = pipeline(source, decoder, settings(), &clock);

        assert_eq!(p.tick(), TickAction::Submitted);
        let store = p.stop();
        assert!(released.load(Ordering::SeqCst));
        assert!(store.is_empty());

        let _ = release.send(big("LATE"));
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn run_loop_emits_and_stops_on_shutdown() {
        let decoder = Arc::new(ScriptedDecoder::returning([big("A1"), big("A1"), big("B2")]));
        let (tx, mut events) = mpsc::unbounded_channel();
        let mut s = settings();
        s.cooldown = Duration::ZERO;
        let pipeline = ScanPipeline::new(
            TestSource::ready(),
            decoder,
            SessionStore::in_memory(),
            s,
            Arc::new(SystemClock),
            tx,
        );
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(pipeline.run(stop_rx, Duration::from_millis(1)));

        let mut kinds = Vec::new();
        while kinds.len() < 3 {
            let event = events.recv().await.unwrap();
            kinds.push(event.outcome.kind());
        }
        assert_eq!(kinds, vec!["new-code", "duplicate", "new-code"]);

        stop_tx.send(true).unwrap();
        let store = handle.await.unwrap();
        assert_eq!(store.codes(), ["A1", "B2"]);
    }
}
