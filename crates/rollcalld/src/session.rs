//! Capture session — the timer-driven loop that owns one classroom's
//! tracking state.
//!
//! A single tokio task owns the provider, the reconciler, the attendance
//! gate and the enrollment map; everything else talks to it through a
//! command channel. Cycles are strictly serialized: the detection call is
//! awaited inside the loop, and timer ticks that fire while a cycle is in
//! flight are skipped, not queued.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Duration, Instant, MissedTickBehavior};
use uuid::Uuid;

use rollcall_core::{
    AttendanceGate, Detection, ReconcilerConfig, TimestampMs, TrackId, TrackReconciler,
};

use crate::provider::{DetectError, DetectionProvider};

/// Pause applied to the whole session after a rate-limit rejection.
pub const DEFAULT_RATE_LIMIT_PAUSE: Duration = Duration::from_secs(61);

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session task exited")]
    ChannelClosed,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interval between analysis cycles.
    pub period: Duration,
    /// How long automatic cycling pauses after a rate-limit failure.
    pub rate_limit_pause: Duration,
    pub reconciler: ReconcilerConfig,
    /// Cooldown between attendance records for the same track.
    pub log_cooldown_ms: TimestampMs,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(5),
            rate_limit_pause: DEFAULT_RATE_LIMIT_PAUSE,
            reconciler: ReconcilerConfig::default(),
            log_cooldown_ms: rollcall_core::attendance::DEFAULT_LOG_COOLDOWN_MS,
        }
    }
}

/// One debounced attendance emission.
#[derive(Debug, Clone, Serialize)]
pub struct AttendanceRecord {
    pub student_id: String,
    pub track_id: TrackId,
    pub recorded_at: DateTime<Utc>,
    /// Auxiliary classification from the detector, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emotion: Option<String>,
}

/// Annotated output of one completed cycle, published for rendering.
///
/// Sent over a watch channel, so readers always see a whole cycle's
/// result — never a partially updated one.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FrameSnapshot {
    pub cycle: u64,
    pub detections: Vec<Detection>,
    pub live_tracks: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_id: Uuid,
    pub capturing: bool,
    pub rate_limit_paused: bool,
    pub live_tracks: usize,
    pub enrolled: usize,
    pub cycles: u64,
    /// Most recent abandoned-cycle warning; cleared by the next
    /// successful cycle.
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// Messages sent from handles to the session task.
enum SessionRequest {
    Start {
        reply: oneshot::Sender<()>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Enroll {
        track_id: TrackId,
        student_id: String,
        reply: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<SessionStatus>,
    },
}

/// Clone-safe handle to a running session task.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionRequest>,
}

impl SessionHandle {
    /// Resume automatic cycling after a stop.
    pub async fn start(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionRequest::Start { reply }).await
    }

    /// Stop capturing. Hard reset: track table, id counter, debounce
    /// registry and enrollments are all cleared, and any pending
    /// rate-limit pause is cancelled.
    pub async fn stop(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionRequest::Stop { reply }).await
    }

    /// Bind a live track to a registered student identity.
    pub async fn enroll(
        &self,
        track_id: TrackId,
        student_id: impl Into<String>,
    ) -> Result<(), SessionError> {
        let student_id = student_id.into();
        self.request(|reply| SessionRequest::Enroll {
            track_id,
            student_id,
            reply,
        })
        .await
    }

    pub async fn status(&self) -> Result<SessionStatus, SessionError> {
        self.request(|reply| SessionRequest::Status { reply }).await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionRequest,
    ) -> Result<T, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| SessionError::ChannelClosed)?;
        reply_rx.await.map_err(|_| SessionError::ChannelClosed)
    }
}

/// Spawn a capture session on the tokio runtime.
///
/// Returns the command handle, a watch receiver carrying the latest frame
/// snapshot for rendering, and the attendance record stream. The session
/// begins capturing immediately.
pub fn spawn_session<P: DetectionProvider>(
    provider: P,
    config: SessionConfig,
) -> (
    SessionHandle,
    watch::Receiver<FrameSnapshot>,
    mpsc::Receiver<AttendanceRecord>,
) {
    let (cmd_tx, cmd_rx) = mpsc::channel(8);
    let (frame_tx, frame_rx) = watch::channel(FrameSnapshot::default());
    let (attendance_tx, attendance_rx) = mpsc::channel(64);

    let session = CaptureSession::new(provider, config, frame_tx, attendance_tx);
    tokio::spawn(session.run(cmd_rx));

    (SessionHandle { tx: cmd_tx }, frame_rx, attendance_rx)
}

enum CycleOutcome {
    Completed,
    RateLimited,
    Abandoned,
}

struct CaptureSession<P> {
    provider: P,
    config: SessionConfig,
    reconciler: TrackReconciler,
    gate: AttendanceGate,
    enrollments: HashMap<TrackId, String>,
    frame_tx: watch::Sender<FrameSnapshot>,
    attendance_tx: mpsc::Sender<AttendanceRecord>,
    session_id: Uuid,
    started_at: DateTime<Utc>,
    capturing: bool,
    /// While set, automatic cycling is paused after a rate-limit failure.
    paused_until: Option<Instant>,
    cycles: u64,
    last_error: Option<String>,
}

impl<P: DetectionProvider> CaptureSession<P> {
    fn new(
        provider: P,
        config: SessionConfig,
        frame_tx: watch::Sender<FrameSnapshot>,
        attendance_tx: mpsc::Sender<AttendanceRecord>,
    ) -> Self {
        let gate = AttendanceGate::new(config.log_cooldown_ms);
        let reconciler = TrackReconciler::new(config.reconciler);
        Self {
            provider,
            config,
            reconciler,
            gate,
            enrollments: HashMap::new(),
            frame_tx,
            attendance_tx,
            session_id: Uuid::new_v4(),
            started_at: Utc::now(),
            capturing: true,
            paused_until: None,
            cycles: 0,
            last_error: None,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<SessionRequest>) {
        tracing::info!(session = %self.session_id, period = ?self.config.period, "session started");

        // First cycle fires one full period after startup.
        let mut ticker =
            tokio::time::interval_at(Instant::now() + self.config.period, self.config.period);
        // Ticks that fire while a cycle is still awaiting detection are
        // dropped; cycles never queue up behind a slow provider.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.on_tick().await,
                req = rx.recv() => match req {
                    Some(req) => self.handle_request(req),
                    None => break,
                },
            }
        }

        tracing::info!(session = %self.session_id, "session task exiting");
    }

    async fn on_tick(&mut self) {
        if !self.capturing {
            return;
        }
        if let Some(until) = self.paused_until {
            if Instant::now() < until {
                return;
            }
            self.paused_until = None;
            tracing::info!(session = %self.session_id, "rate-limit pause elapsed; resuming cycles");
        }
        self.run_cycle(|| Utc::now().timestamp_millis()).await;
    }

    async fn run_cycle(&mut self, clock: impl Fn() -> TimestampMs) -> CycleOutcome {
        match self.provider.detect().await {
            Ok(detections) => {
                // Sampled after the detection await: a slow provider must
                // not shave the tracks' survival window.
                let now = clock();
                self.cycles += 1;
                let annotated = self.reconciler.reconcile(detections, now);
                let attendance = self.log_attendance(&annotated, now);

                self.frame_tx.send_replace(FrameSnapshot {
                    cycle: self.cycles,
                    detections: annotated,
                    live_tracks: self.reconciler.len(),
                });

                if self.last_error.take().is_some() {
                    tracing::debug!(session = %self.session_id, "transient detection warning cleared");
                }
                tracing::debug!(
                    session = %self.session_id,
                    cycle = self.cycles,
                    live_tracks = self.reconciler.len(),
                    attendance,
                    "cycle completed"
                );
                CycleOutcome::Completed
            }
            Err(DetectError::RateLimited) => {
                self.paused_until = Some(Instant::now() + self.config.rate_limit_pause);
                tracing::warn!(
                    session = %self.session_id,
                    pause = ?self.config.rate_limit_pause,
                    "detection rate limited; pausing cycles"
                );
                CycleOutcome::RateLimited
            }
            Err(err) => {
                // Abandon this cycle only: no tracks are matched, created
                // or expired, and the next tick retries normally.
                self.last_error = Some(err.to_string());
                tracing::warn!(session = %self.session_id, error = %err, "cycle abandoned");
                CycleOutcome::Abandoned
            }
        }
    }

    /// Emit a debounced attendance record for every enrolled, annotated
    /// detection. Unenrolled tracks are maintained but never logged.
    fn log_attendance(&mut self, detections: &[Detection], now: TimestampMs) -> usize {
        let mut emitted = 0;
        for det in detections {
            let Some(track_id) = det.track_id else {
                continue;
            };
            let Some(student_id) = self.enrollments.get(&track_id) else {
                continue;
            };
            if !self.gate.try_emit(track_id, now) {
                continue;
            }
            let record = AttendanceRecord {
                student_id: student_id.clone(),
                track_id,
                recorded_at: Utc::now(),
                emotion: det.emotion.clone(),
            };
            tracing::info!(
                session = %self.session_id,
                student = %record.student_id,
                track = track_id,
                "attendance recorded"
            );
            if self.attendance_tx.try_send(record).is_err() {
                tracing::warn!(track = track_id, "attendance sink full; record dropped");
            }
            emitted += 1;
        }
        emitted
    }

    fn handle_request(&mut self, req: SessionRequest) {
        match req {
            SessionRequest::Start { reply } => {
                if !self.capturing {
                    self.capturing = true;
                    tracing::info!(session = %self.session_id, "capture started");
                }
                let _ = reply.send(());
            }
            SessionRequest::Stop { reply } => {
                self.hard_reset();
                let _ = reply.send(());
            }
            SessionRequest::Enroll {
                track_id,
                student_id,
                reply,
            } => {
                tracing::info!(session = %self.session_id, track = track_id, student = %student_id, "track enrolled");
                self.enrollments.insert(track_id, student_id);
                let _ = reply.send(());
            }
            SessionRequest::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    /// Stop is a hard reset, not a graceful drain: every table keyed by
    /// track id is dropped along with the ids themselves.
    fn hard_reset(&mut self) {
        self.capturing = false;
        self.paused_until = None;
        self.reconciler.reset();
        self.gate.reset();
        self.enrollments.clear();
        self.last_error = None;
        tracing::info!(session = %self.session_id, "capture stopped; session state cleared");
    }

    fn status(&self) -> SessionStatus {
        SessionStatus {
            session_id: self.session_id,
            capturing: self.capturing,
            rate_limit_paused: self
                .paused_until
                .is_some_and(|until| Instant::now() < until),
            live_tracks: self.reconciler.len(),
            enrolled: self.enrollments.len(),
            cycles: self.cycles,
            last_error: self.last_error.clone(),
            started_at: self.started_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::Region;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Provider fed from a queue of canned outcomes; panics if polled dry.
    struct QueueProvider {
        outcomes: VecDeque<Result<Vec<Detection>, DetectError>>,
    }

    impl QueueProvider {
        fn new(outcomes: Vec<Result<Vec<Detection>, DetectError>>) -> Self {
            Self {
                outcomes: outcomes.into(),
            }
        }
    }

    impl DetectionProvider for QueueProvider {
        async fn detect(&mut self) -> Result<Vec<Detection>, DetectError> {
            self.outcomes.pop_front().expect("provider polled dry")
        }
    }

    /// Counts polls; the first one is rate limited, the rest see an
    /// empty room.
    struct RateLimitedOnceProvider {
        polls: Arc<AtomicUsize>,
    }

    impl DetectionProvider for RateLimitedOnceProvider {
        async fn detect(&mut self) -> Result<Vec<Detection>, DetectError> {
            if self.polls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(DetectError::RateLimited)
            } else {
                Ok(Vec::new())
            }
        }
    }

    /// Counts polls and holds each detection call open for `busy`.
    struct SlowProvider {
        polls: Arc<AtomicUsize>,
        busy: Duration,
    }

    impl DetectionProvider for SlowProvider {
        async fn detect(&mut self) -> Result<Vec<Detection>, DetectError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.busy).await;
            Ok(Vec::new())
        }
    }

    fn det(x: f32, label: &str) -> Detection {
        Detection::new(Region::new(x, 0.0, 10.0, 10.0), label)
    }

    fn session_with<P: DetectionProvider>(
        provider: P,
    ) -> (
        CaptureSession<P>,
        watch::Receiver<FrameSnapshot>,
        mpsc::Receiver<AttendanceRecord>,
    ) {
        let (frame_tx, frame_rx) = watch::channel(FrameSnapshot::default());
        let (attendance_tx, attendance_rx) = mpsc::channel(64);
        let session =
            CaptureSession::new(provider, SessionConfig::default(), frame_tx, attendance_tx);
        (session, frame_rx, attendance_rx)
    }

    fn session(
        outcomes: Vec<Result<Vec<Detection>, DetectError>>,
    ) -> (
        CaptureSession<QueueProvider>,
        watch::Receiver<FrameSnapshot>,
        mpsc::Receiver<AttendanceRecord>,
    ) {
        session_with(QueueProvider::new(outcomes))
    }

    #[tokio::test]
    async fn test_cycle_annotates_and_publishes_snapshot() {
        let (mut s, frame_rx, _att) = session(vec![Ok(vec![det(0.0, "a")])]);
        s.run_cycle(|| 1000).await;

        let snapshot = frame_rx.borrow();
        assert_eq!(snapshot.cycle, 1);
        assert_eq!(snapshot.live_tracks, 1);
        assert_eq!(snapshot.detections[0].track_id, Some(1));
    }

    #[tokio::test]
    async fn test_enrolled_track_emits_attendance_once() {
        let (mut s, _frame, mut att) = session(vec![
            Ok(vec![det(0.0, "a")]),
            Ok(vec![det(1.0, "b")]),
            Ok(vec![det(0.5, "c")]),
        ]);
        s.run_cycle(|| 0).await;
        // Enroll after the track exists, the way an operator binds a face.
        s.enrollments.insert(1, "alice".to_string());

        s.run_cycle(|| 5000).await;
        let record = att.try_recv().unwrap();
        assert_eq!(record.student_id, "alice");
        assert_eq!(record.track_id, 1);

        // Same person ten seconds later: debounced, nothing emitted.
        s.run_cycle(|| 10_000).await;
        assert!(att.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unenrolled_track_is_tracked_but_never_logged() {
        let (mut s, frame_rx, mut att) = session(vec![Ok(vec![det(0.0, "a")])]);
        s.run_cycle(|| 0).await;
        assert_eq!(frame_rx.borrow().live_tracks, 1);
        assert!(att.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rate_limit_pauses_session() {
        let (mut s, _frame, _att) = session(vec![Err(DetectError::RateLimited)]);
        assert!(matches!(s.run_cycle(|| 0).await, CycleOutcome::RateLimited));
        assert!(s.paused_until.is_some());
        assert!(s.status().rate_limit_paused);
        // The failed call is not a completed cycle.
        assert_eq!(s.cycles, 0);
    }

    #[tokio::test]
    async fn test_abandoned_cycle_leaves_tracks_untouched() {
        let (mut s, _frame, _att) = session(vec![
            Ok(vec![det(0.0, "a")]),
            Err(DetectError::Provider("boom".into())),
            Ok(vec![det(1.0, "b")]),
        ]);
        s.run_cycle(|| 0).await;
        let before = s.reconciler.tracks().to_vec();

        assert!(matches!(s.run_cycle(|| 5000).await, CycleOutcome::Abandoned));
        assert_eq!(s.reconciler.tracks(), &before[..]);
        assert_eq!(s.status().last_error.as_deref(), Some("detection failed: boom"));

        // Next successful cycle clears the transient warning.
        s.run_cycle(|| 10_000).await;
        assert_eq!(s.status().last_error, None);
    }

    #[tokio::test]
    async fn test_stop_is_hard_reset() {
        let (mut s, _frame, _att) = session(vec![
            Ok(vec![det(0.0, "a")]),
            Ok(vec![det(0.0, "b")]),
        ]);
        s.run_cycle(|| 0).await;
        s.enrollments.insert(1, "alice".to_string());
        s.paused_until = Some(Instant::now() + Duration::from_secs(61));

        s.hard_reset();
        assert!(!s.capturing);
        assert!(s.paused_until.is_none());
        assert!(s.reconciler.is_empty());
        assert!(s.enrollments.is_empty());

        // Restarted capture assigns ids from 1 again.
        s.capturing = true;
        s.run_cycle(|| 1000).await;
        assert_eq!(s.reconciler.tracks()[0].id, 1);
    }

    #[tokio::test]
    async fn test_two_enrolled_people_debounce_independently() {
        let (mut s, _frame, mut att) = session(vec![
            Ok(vec![det(0.0, "a"), det(100.0, "b")]),
            Ok(vec![det(0.0, "c"), det(100.0, "d")]),
        ]);
        s.run_cycle(|| 0).await;
        s.enrollments.insert(1, "alice".to_string());
        s.enrollments.insert(2, "bob".to_string());

        s.run_cycle(|| 5000).await;
        let mut students: Vec<_> = std::iter::from_fn(|| att.try_recv().ok())
            .map(|r| r.student_id)
            .collect();
        students.sort();
        assert_eq!(students, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn test_spawned_session_responds_to_handle() {
        let (handle, _frame, _att) = spawn_session(
            QueueProvider::new(vec![]),
            SessionConfig {
                // Long period so the ticker never polls the empty queue.
                period: Duration::from_secs(3600),
                ..SessionConfig::default()
            },
        );

        let status = handle.status().await.unwrap();
        assert!(status.capturing);
        assert_eq!(status.cycles, 0);

        handle.enroll(1, "alice").await.unwrap();
        assert_eq!(handle.status().await.unwrap().enrolled, 1);

        handle.stop().await.unwrap();
        let status = handle.status().await.unwrap();
        assert!(!status.capturing);
        assert_eq!(status.enrolled, 0);

        handle.start().await.unwrap();
        assert!(handle.status().await.unwrap().capturing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_are_noops_during_rate_limit_pause() {
        let polls = Arc::new(AtomicUsize::new(0));
        let (handle, _frame, _att) = spawn_session(
            RateLimitedOnceProvider {
                polls: Arc::clone(&polls),
            },
            SessionConfig {
                period: Duration::from_secs(1),
                ..SessionConfig::default()
            },
        );

        // First tick at t=1s gets rate limited; the pause runs to t=62s.
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(polls.load(Ordering::SeqCst), 1);
        assert!(handle.status().await.unwrap().rate_limit_paused);

        // A minute of ticks inside the pause: every one is a no-op, the
        // provider is never polled.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(polls.load(Ordering::SeqCst), 1);

        // First tick past the pause runs a cycle again.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(polls.load(Ordering::SeqCst), 2);
        assert!(!handle.status().await.unwrap().rate_limit_paused);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_detection_skips_ticks_instead_of_queueing() {
        let polls = Arc::new(AtomicUsize::new(0));
        let (_handle, _frame, _att) = spawn_session(
            SlowProvider {
                polls: Arc::clone(&polls),
                busy: Duration::from_millis(2_500),
            },
            SessionConfig {
                period: Duration::from_secs(1),
                ..SessionConfig::default()
            },
        );

        // Detection outlives the period 2.5x, so each cycle misses two
        // ticks. Nine ticks are scheduled by t=9.7s but only four cycles
        // run (t=1s, 3.5s, 6s, 8.5s): at most one missed tick is
        // delivered when the cycle ends, the rest are dropped rather
        // than queued up behind the slow provider.
        tokio::time::sleep(Duration::from_millis(9_700)).await;
        assert_eq!(polls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_cycle_timestamp_sampled_after_detection() {
        // The provider bumps a shared wall clock while "capturing", the
        // way real time passes during a slow detection call; the track's
        // last_seen must carry the post-detection time.
        struct ClockStampProvider {
            wall: Arc<AtomicI64>,
        }

        impl DetectionProvider for ClockStampProvider {
            async fn detect(&mut self) -> Result<Vec<Detection>, DetectError> {
                self.wall.store(5_000, Ordering::SeqCst);
                Ok(vec![Detection::new(
                    Region::new(0.0, 0.0, 10.0, 10.0),
                    "a",
                )])
            }
        }

        let wall = Arc::new(AtomicI64::new(0));
        let (mut s, _frame, _att) = session_with(ClockStampProvider {
            wall: Arc::clone(&wall),
        });

        let clock = {
            let wall = Arc::clone(&wall);
            move || wall.load(Ordering::SeqCst)
        };
        s.run_cycle(clock).await;
        assert_eq!(s.reconciler.tracks()[0].last_seen, 5_000);
    }
}
