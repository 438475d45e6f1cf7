use qrscan_common::detection::DetectionResult;
use qrscan_common::frame::Frame;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, error, info, warn};

use crate::decoder::{decode_frame, Decoder};

/// Result of one accepted submission, delivered back to the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// Submission id returned by the transport, unique per transport.
    pub id: u64,
    pub frame_seq: u64,
    pub width: u32,
    pub height: u32,
    pub result: DetectionResult,
    /// Time spent inside the decoder. Zero for synthesized completions.
    pub elapsed: Duration,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransportStats {
    pub submitted: u64,
    pub completed: u64,
    pub dropped_busy: u64,
    pub restarts: u64,
}

struct DecodeRequest {
    id: u64,
    frame: Frame,
}

struct InFlight {
    id: u64,
    frame_seq: u64,
    width: u32,
    height: u32,
    submitted_at: Instant,
}

impl InFlight {
    /// Completion used when the real result can no longer arrive.
    fn abandoned(self) -> Completion {
        Completion {
            id: self.id,
            frame_seq: self.frame_seq,
            width: self.width,
            height: self.height,
            result: DetectionResult::NoDetection,
            elapsed: Duration::ZERO,
        }
    }
}

/// Handle to one decode worker thread.
struct Worker {
    requests: std_mpsc::Sender<DecodeRequest>,
    completions: mpsc::UnboundedReceiver<Completion>,
    thread: JoinHandle<()>,
    generation: u64,
}

/// Single-flight frame transport to an isolated decode worker.
///
/// At most one frame is outstanding. A submission while busy is dropped, not
/// queued. Every accepted submission produces exactly one [`Completion`]:
/// the decoder's result, or `NoDetection` if the worker had to be abandoned.
/// Each worker generation has its own result channel, so results from an
/// abandoned worker can never reach the coordinator.
pub struct Transport {
    decoder: Arc<dyn Decoder>,
    worker: Option<Worker>,
    in_flight: Option<InFlight>,
    next_id: u64,
    generation: u64,
    stats: TransportStats,
}

impl Transport {
    /// Create a transport and start its decode worker.
    pub fn new(decoder: Arc<dyn Decoder>) -> Self {
        let mut transport = Self {
            decoder,
            worker: None,
            in_flight: None,
            next_id: 0,
            generation: 0,
            stats: TransportStats::default(),
        };
        transport.ensure_worker();
        transport
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn stats(&self) -> TransportStats {
        self.stats
    }

    /// How long the outstanding submission has been in flight.
    pub fn in_flight_for(&self, now: Instant) -> Option<Duration> {
        self.in_flight
            .as_ref()
            .map(|f| now.saturating_duration_since(f.submitted_at))
    }

    fn ensure_worker(&mut self) -> bool {
        if self.worker.is_some() {
            return true;
        }

        self.generation += 1;
        let generation = self.generation;
        let (req_tx, req_rx) = std_mpsc::channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let decoder = Arc::clone(&self.decoder);

        let spawned = std::thread::Builder::new()
            .name(format!("qr-decode-{generation}"))
            .spawn(move || run_worker(decoder, req_rx, done_tx, generation));

        match spawned {
            Ok(thread) => {
                info!(generation, decoder = self.decoder.name(), "decode worker started");
                self.worker = Some(Worker {
                    requests: req_tx,
                    completions: done_rx,
                    thread,
                    generation,
                });
                true
            }
            Err(e) => {
                error!(error = %e, generation, "failed to spawn decode worker");
                false
            }
        }
    }

    /// Hand `frame` to the decode worker.
    ///
    /// Returns `false` without side effects on the outstanding request when
    /// one is already in flight; the frame is dropped. Ownership of the
    /// buffer moves to the worker on success.
    pub fn submit(&mut self, frame: Frame, now: Instant) -> bool {
        if self.in_flight.is_some() {
            self.stats.dropped_busy += 1;
            debug!(seq = frame.seq, "decode in flight, frame dropped");
            return false;
        }

        let id = self.next_id;
        let seq = frame.seq;
        let in_flight = InFlight {
            id,
            frame_seq: seq,
            width: frame.width(),
            height: frame.height(),
            submitted_at: now,
        };
        let mut request = DecodeRequest { id, frame };

        // A dead worker hands the request back; respawn once and retry.
        for _ in 0..2 {
            if !self.ensure_worker() {
                return false;
            }
            let Some(worker) = self.worker.as_ref() else {
                return false;
            };
            match worker.requests.send(request) {
                Ok(()) => {
                    self.next_id += 1;
                    self.stats.submitted += 1;
                    self.in_flight = Some(in_flight);
                    debug!(id, seq, "frame submitted");
                    return true;
                }
                Err(std_mpsc::SendError(returned)) => {
                    warn!(generation = worker.generation, "decode worker gone, respawning");
                    self.worker = None;
                    self.stats.restarts += 1;
                    request = returned;
                }
            }
        }
        error!(seq, "decode worker unavailable, frame dropped");
        false
    }

    /// Non-blocking check for the outstanding result.
    pub fn try_completion(&mut self) -> Option<Completion> {
        loop {
            self.in_flight.as_ref()?;
            let received = match self.worker.as_mut() {
                Some(worker) => worker.completions.try_recv(),
                None => Err(TryRecvError::Disconnected),
            };
            match received {
                Ok(completion) => {
                    if let Some(c) = self.accept(completion) {
                        return Some(c);
                    }
                }
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => return self.worker_lost(),
            }
        }
    }

    /// Wait for the outstanding result. Returns `None` immediately when idle.
    ///
    /// Cancel-safe: dropping the future never loses a completion.
    pub async fn next_completion(&mut self) -> Option<Completion> {
        loop {
            self.in_flight.as_ref()?;
            let received = match self.worker.as_mut() {
                Some(worker) => worker.completions.recv().await,
                None => None,
            };
            match received {
                Some(completion) => {
                    if let Some(c) = self.accept(completion) {
                        return Some(c);
                    }
                }
                None => return self.worker_lost(),
            }
        }
    }

    fn accept(&mut self, completion: Completion) -> Option<Completion> {
        match &self.in_flight {
            Some(f) if f.id == completion.id => {
                self.in_flight = None;
                self.stats.completed += 1;
                debug!(
                    id = completion.id,
                    elapsed_ms = completion.elapsed.as_millis() as u64,
                    "decode completed"
                );
                Some(completion)
            }
            _ => {
                debug!(id = completion.id, "stale completion discarded");
                None
            }
        }
    }

    fn worker_lost(&mut self) -> Option<Completion> {
        if let Some(worker) = self.worker.take() {
            warn!(generation = worker.generation, "decode worker exited unexpectedly");
            self.stats.restarts += 1;
        }
        let completion = self.in_flight.take()?.abandoned();
        self.stats.completed += 1;
        Some(completion)
    }

    /// Abandon the current worker and start a fresh one.
    ///
    /// The outstanding submission, if any, completes now with `NoDetection`.
    /// The abandoned thread keeps running until its decode returns, but its
    /// result has nowhere to go.
    pub fn restart(&mut self) -> Option<Completion> {
        if let Some(worker) = self.worker.take() {
            warn!(generation = worker.generation, "abandoning decode worker");
        }
        self.stats.restarts += 1;
        let abandoned = self.in_flight.take().map(InFlight::abandoned);
        if abandoned.is_some() {
            self.stats.completed += 1;
        }
        self.ensure_worker();
        abandoned
    }

    /// Stop the worker. Any in-flight result is discarded.
    pub fn shutdown(&mut self) {
        let busy = self.in_flight.take().is_some();
        let Some(worker) = self.worker.take() else {
            return;
        };
        let Worker {
            requests,
            completions,
            thread,
            generation,
        } = worker;
        drop(requests);
        drop(completions);
        if busy {
            // The thread exits once its current decode returns.
            info!(generation, "decode worker detached with a decode in flight");
        } else if thread.join().is_err() {
            warn!(generation, "decode worker panicked during shutdown");
        } else {
            info!(generation, "decode worker stopped");
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(
    decoder: Arc<dyn Decoder>,
    requests: std_mpsc::Receiver<DecodeRequest>,
    completions: mpsc::UnboundedSender<Completion>,
    generation: u64,
) {
    while let Ok(DecodeRequest { id, frame }) = requests.recv() {
        let started = Instant::now();
        let result = decode_frame(decoder.as_ref(), &frame);
        let completion = Completion {
            id,
            frame_seq: frame.seq,
            width: frame.width(),
            height: frame.height(),
            result,
            elapsed: started.elapsed(),
        };
        // The buffer is not retained past the decode call.
        drop(frame);

        if completions.send(completion).is_err() {
            debug!(generation, id, "result receiver gone, result discarded");
            break;
        }
    }
    debug!(generation, "decode worker loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::testing::{ScriptedDecoder, Step};
    use qrscan_common::detection::Quad;

    fn frame(seq: u64) -> Frame {
        Frame::new(vec![0; 4 * 4 * 4], 4, 4, 0, seq).unwrap()
    }

    fn hit(text: &str) -> DetectionResult {
        DetectionResult::candidate(text, Quad::square(0.0, 0.0, 4.0))
    }

    #[tokio::test]
    async fn single_flight_drops_second_submission() {
        let (release, gate) = std_mpsc::channel();
        let decoder = Arc::new(ScriptedDecoder::new([Step::Wait(gate)]));
        let mut transport = Transport::new(decoder.clone());
        let now = Instant::now();

        assert!(transport.submit(frame(1), now));
        assert!(transport.is_busy());
        assert!(!transport.submit(frame(2), now));
        assert!(!transport.submit(frame(3), now));
        assert!(transport.try_completion().is_none());

        release.send(hit("A1")).unwrap();
        let completion = transport.next_completion().await.unwrap();
        assert_eq!(completion.frame_seq, 1);
        assert_eq!(completion.result, hit("A1"));
        assert!(!transport.is_busy());

        let stats = transport.stats();
        assert_eq!(stats.submitted, 1);
        assert_eq!(stats.dropped_busy, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(decoder.calls(), 1);
    }

    #[tokio::test]
    async fn results_arrive_in_submission_order() {
        let decoder = Arc::new(ScriptedDecoder::returning([hit("A"), hit("B"), hit("C")]));
        let mut transport = Transport::new(decoder);
        let mut seen = Vec::new();
        for seq in 0..3 {
            assert!(transport.submit(frame(seq), Instant::now()));
            seen.push(transport.next_completion().await.unwrap().frame_seq);
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn idle_transport_has_no_completion() {
        let mut transport = Transport::new(Arc::new(ScriptedDecoder::default()));
        assert!(transport.next_completion().await.is_none());
        assert!(transport.try_completion().is_none());
    }

    #[tokio::test]
    async fn restart_completes_in_flight_once_and_discards_late_result() {
        let (release_hung, hung) = std_mpsc::channel();
        let decoder = Arc::new(ScriptedDecoder::new([
            Step::Wait(hung),
            Step::Return(hit("fresh")),
        ]));
        let mut transport = Transport::new(decoder.clone());
        let t0 = Instant::now();

        assert!(transport.submit(frame(1), t0));
        decoder.wait_for_calls(1);
        assert_eq!(
            transport.in_flight_for(t0 + Duration::from_secs(3)),
            Some(Duration::from_secs(3))
        );

        let abandoned = transport.restart().unwrap();
        assert_eq!(abandoned.frame_seq, 1);
        assert_eq!(abandoned.result, DetectionResult::NoDetection);
        assert!(!transport.is_busy());

        // The hung decode finishes after the restart; its result goes nowhere.
        release_hung.send(hit("late")).unwrap();

        assert!(transport.submit(frame(2), Instant::now()));
        let completion = transport.next_completion().await.unwrap();
        assert_eq!(completion.frame_seq, 2);
        assert_eq!(completion.result, hit("fresh"));
        assert_eq!(transport.stats().restarts, 1);
    }

    #[tokio::test]
    async fn decoder_panic_keeps_transport_live() {
        struct Exploding;
        impl Decoder for Exploding {
            fn decode(
                &self,
                _: &[u8],
                _: u32,
                _: u32,
            ) -> Result<DetectionResult, crate::decoder::DecodeError> {
                panic!("decoder blew up");
            }
        }

        let mut transport = Transport::new(Arc::new(Exploding));
        for seq in 0..3 {
            assert!(transport.submit(frame(seq), Instant::now()));
            let completion = transport.next_completion().await.unwrap();
            assert_eq!(completion.result, DetectionResult::NoDetection);
        }
        assert_eq!(transport.stats().restarts, 0);
    }

    #[tokio::test]
    async fn shutdown_discards_in_flight() {
        let (release, gate) = std_mpsc::channel();
        let mut transport = Transport::new(Arc::new(ScriptedDecoder::new([Step::Wait(gate)])));
        assert!(transport.submit(frame(1), Instant::now()));
        transport.shutdown();
        assert!(!transport.is_busy());
        assert!(transport.next_completion().await.is_none());
        // Late result after stop is dropped silently.
        let _ = release.send(hit("late"));
    }
}
