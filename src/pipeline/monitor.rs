use std::{
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
    thread,
    time::{Duration, SystemTime},
};

use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded, select, tick};

use super::{
    camera::{CaptureError, MediaDevices, MediaStream, StreamConstraints, classify_device_error},
    raster,
    recognizer::{RecognitionEndpoint, RecognitionError},
};
use crate::{
    auth::CredentialProvider,
    config::MonitorConfig,
    types::{DetectionSnapshot, Frame, LatestFrame},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Starting,
    Live,
    Erroring,
    Stopped,
}

/// Observable signals emitted while monitoring.
#[derive(Clone, Debug, PartialEq)]
pub enum MonitorEvent {
    StateChanged(CaptureState),
    SnapshotUpdated,
    UnknownPersons { count: u32 },
    TickDropped { seq: u64, reason: String },
    StaleResponse { seq: u64 },
}

#[derive(Debug, Default)]
pub struct MonitorStats {
    ticks_fired: AtomicU64,
    requests_sent: AtomicU64,
    responses_applied: AtomicU64,
    ticks_dropped: AtomicU64,
    stale_responses: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub ticks_fired: u64,
    pub requests_sent: u64,
    pub responses_applied: u64,
    pub ticks_dropped: u64,
    pub stale_responses: u64,
}

impl MonitorStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            ticks_fired: self.ticks_fired.load(Ordering::Relaxed),
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            responses_applied: self.responses_applied.load(Ordering::Relaxed),
            ticks_dropped: self.ticks_dropped.load(Ordering::Relaxed),
            stale_responses: self.stale_responses.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Debug)]
pub struct LoopSettings {
    pub constraints: StreamConstraints,
    pub ready_timeout: Duration,
    pub tick_interval: Duration,
    pub jpeg_quality: u8,
    pub order_guard: bool,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self::from_config(&MonitorConfig::default())
    }
}

impl LoopSettings {
    pub fn from_config(cfg: &MonitorConfig) -> Self {
        Self {
            constraints: cfg.stream_constraints(),
            ready_timeout: cfg.camera.ready_timeout,
            tick_interval: cfg.recognition.tick_interval,
            jpeg_quality: cfg.recognition.jpeg_quality,
            order_guard: cfg.recognition.order_guard,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The session that issued the request has been stopped.
    StaleSession,
    /// A newer response was already applied and the order guard is on.
    OutOfOrder,
}

/// Holds the current detections and decides which responses may replace
/// them.
#[derive(Debug, Default)]
pub struct DetectionBoard {
    inner: Mutex<BoardState>,
}

#[derive(Debug, Default)]
struct BoardState {
    epoch: u64,
    live: bool,
    last_applied_seq: Option<u64>,
    snapshot: DetectionSnapshot,
}

impl DetectionBoard {
    fn lock(&self) -> MutexGuard<'_, BoardState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn reset(state: &mut BoardState, live: bool) -> u64 {
        state.epoch += 1;
        state.live = live;
        state.last_applied_seq = None;
        state.snapshot = DetectionSnapshot::default();
        state.epoch
    }

    pub fn begin_session(&self) -> u64 {
        Self::reset(&mut self.lock(), true)
    }

    /// Clears detections and invalidates every request still in flight.
    pub fn end_session(&self) {
        Self::reset(&mut self.lock(), false);
    }

    pub fn apply(
        &self,
        epoch: u64,
        seq: u64,
        snapshot: DetectionSnapshot,
        order_guard: bool,
    ) -> ApplyOutcome {
        let mut state = self.lock();
        if !state.live || state.epoch != epoch {
            return ApplyOutcome::StaleSession;
        }
        if order_guard && state.last_applied_seq.is_some_and(|last| seq <= last) {
            return ApplyOutcome::OutOfOrder;
        }
        state.last_applied_seq = Some(state.last_applied_seq.map_or(seq, |last| last.max(seq)));
        state.snapshot = snapshot;
        ApplyOutcome::Applied
    }

    pub fn snapshot(&self) -> DetectionSnapshot {
        self.lock().snapshot.clone()
    }
}

/// Everything one recognition request needs, shared by the ticker and the
/// per-request workers of a single session.
struct TickContext {
    endpoint: Arc<dyn RecognitionEndpoint>,
    credentials: Arc<dyn CredentialProvider>,
    board: Arc<DetectionBoard>,
    stats: Arc<MonitorStats>,
    events: Option<Sender<MonitorEvent>>,
    jpeg_quality: u8,
    order_guard: bool,
    epoch: u64,
}

impl TickContext {
    fn emit(&self, event: MonitorEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.try_send(event);
        }
    }

    fn drop_tick(&self, seq: u64, reason: String) {
        MonitorStats::bump(&self.stats.ticks_dropped);
        log::warn!("recognition tick {seq} dropped: {reason}");
        self.emit(MonitorEvent::TickDropped { seq, reason });
    }

    fn submit(&self, seq: u64, frame: Frame, captured_at: SystemTime) {
        let jpeg = match raster::encode_jpeg(&frame, self.jpeg_quality) {
            Ok(jpeg) => jpeg,
            Err(err) => {
                self.drop_tick(seq, RecognitionError::Encode(format!("{err:#}")).to_string());
                return;
            }
        };

        let token = self.credentials.bearer_token();
        MonitorStats::bump(&self.stats.requests_sent);
        log::debug!(
            "tick {seq}: submitting {}x{} frame ({} bytes)",
            frame.width,
            frame.height,
            jpeg.len()
        );

        let response = match self.endpoint.recognize(jpeg, token.as_deref()) {
            Ok(response) => response,
            Err(err) => {
                self.drop_tick(seq, err.to_string());
                return;
            }
        };

        let unknown_count = response.reported_unknown_count();
        let snapshot = DetectionSnapshot::from_response(response, captured_at);
        log::debug!(
            "tick {seq}: {} recognized, {} unknown",
            snapshot.recognized.len(),
            snapshot.unknown.len()
        );

        match self.board.apply(self.epoch, seq, snapshot, self.order_guard) {
            ApplyOutcome::Applied => {
                MonitorStats::bump(&self.stats.responses_applied);
                self.emit(MonitorEvent::SnapshotUpdated);
                if unknown_count > 0 {
                    log::warn!("{unknown_count} unknown person(s) detected");
                    self.emit(MonitorEvent::UnknownPersons {
                        count: unknown_count,
                    });
                }
            }
            ApplyOutcome::StaleSession => {
                MonitorStats::bump(&self.stats.stale_responses);
                log::debug!("tick {seq}: response arrived after its session stopped");
            }
            ApplyOutcome::OutOfOrder => {
                MonitorStats::bump(&self.stats.stale_responses);
                log::debug!("tick {seq}: newer response already applied, discarding");
                self.emit(MonitorEvent::StaleResponse { seq });
            }
        }
    }
}

fn stop_requested(stop_rx: &Receiver<()>) -> bool {
    matches!(stop_rx.try_recv(), Err(TryRecvError::Disconnected))
}

/// Recurring capture timer. Each tick hands the latest frame to its own
/// worker so a slow request never delays the next tick.
struct Ticker {
    stop_tx: Option<Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Ticker {
    fn spawn(interval: Duration, frames: LatestFrame, ctx: Arc<TickContext>) -> Self {
        let (stop_tx, stop_rx) = bounded::<()>(0);

        let handle = thread::spawn(move || {
            let ticks = tick(interval);
            let mut seq = 0u64;
            loop {
                select! {
                    recv(stop_rx) -> _ => break,
                    recv(ticks) -> _ => {
                        // select! picks randomly when both are ready.
                        if stop_requested(&stop_rx) {
                            break;
                        }
                        seq += 1;
                        MonitorStats::bump(&ctx.stats.ticks_fired);
                        match frames.latest() {
                            Some(frame) => {
                                let captured_at = SystemTime::now();
                                let worker = ctx.clone();
                                thread::spawn(move || worker.submit(seq, frame, captured_at));
                            }
                            None => ctx.drop_tick(seq, "no frame available yet".to_string()),
                        }
                    }
                }
            }
        });

        Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        }
    }

    /// Returns once the timer thread has exited; no tick fires afterwards.
    fn cancel(&mut self) {
        drop(self.stop_tx.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// One live acquisition. Dropping it cancels the timer and stops the stream.
struct CaptureSession {
    stream: Box<dyn MediaStream>,
    frames: LatestFrame,
    ticker: Ticker,
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.ticker.cancel();
        self.stream.stop_tracks();
        log::info!("camera released: {}", self.stream.label());
    }
}

/// Captures frames from a camera on a fixed cadence and keeps the latest
/// recognition result.
pub struct CaptureLoop {
    devices: Arc<dyn MediaDevices>,
    endpoint: Arc<dyn RecognitionEndpoint>,
    credentials: Arc<dyn CredentialProvider>,
    settings: LoopSettings,
    board: Arc<DetectionBoard>,
    stats: Arc<MonitorStats>,
    events: Option<Sender<MonitorEvent>>,
    state: CaptureState,
    session: Option<CaptureSession>,
}

impl CaptureLoop {
    pub fn new(
        devices: Arc<dyn MediaDevices>,
        endpoint: Arc<dyn RecognitionEndpoint>,
        credentials: Arc<dyn CredentialProvider>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            devices,
            endpoint,
            credentials,
            settings,
            board: Arc::new(DetectionBoard::default()),
            stats: Arc::new(MonitorStats::default()),
            events: None,
            state: CaptureState::Idle,
            session: None,
        }
    }

    pub fn with_events(mut self, events: Sender<MonitorEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn snapshot(&self) -> DetectionSnapshot {
        self.board.snapshot()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn stream_label(&self) -> Option<&str> {
        self.session.as_ref().map(|session| session.stream.label())
    }

    fn set_state(&mut self, state: CaptureState) {
        if self.state != state {
            log::debug!("capture state {:?} -> {:?}", self.state, state);
            self.state = state;
            if let Some(tx) = &self.events {
                let _ = tx.try_send(MonitorEvent::StateChanged(state));
            }
        }
    }

    /// Acquires the camera, waits for playback and starts the recognition
    /// timer. Does nothing if already live.
    pub fn start(&mut self) -> Result<(), CaptureError> {
        if self.state == CaptureState::Live && self.session.is_some() {
            log::debug!("start requested while live, ignoring");
            return Ok(());
        }

        self.set_state(CaptureState::Starting);
        log::info!("requesting camera access");

        let mut stream = match self.devices.open_stream(&self.settings.constraints) {
            Ok(stream) => stream,
            Err(err) => {
                log::error!("camera error: {err}");
                self.set_state(CaptureState::Erroring);
                return Err(err);
            }
        };
        log::info!("camera access granted: {}", stream.label());

        if let Err(err) = stream.wait_until_playing(self.settings.ready_timeout) {
            log::error!("camera playback error: {err}");
            stream.stop_tracks();
            self.set_state(CaptureState::Erroring);
            return Err(err);
        }

        let epoch = self.board.begin_session();
        let frames = stream.frames();
        let ctx = Arc::new(TickContext {
            endpoint: self.endpoint.clone(),
            credentials: self.credentials.clone(),
            board: self.board.clone(),
            stats: self.stats.clone(),
            events: self.events.clone(),
            jpeg_quality: self.settings.jpeg_quality,
            order_guard: self.settings.order_guard,
            epoch,
        });
        let ticker = Ticker::spawn(self.settings.tick_interval, frames.clone(), ctx);

        self.session = Some(CaptureSession {
            stream,
            frames,
            ticker,
        });
        log::info!(
            "monitoring live, recognizing every {} ms",
            self.settings.tick_interval.as_millis()
        );
        self.set_state(CaptureState::Live);
        Ok(())
    }

    /// Cancels the timer, releases the camera and clears detections.
    /// Calling it when nothing is running is harmless.
    pub fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            log::info!("stopping camera");
            drop(session);
            self.board.end_session();
            self.set_state(CaptureState::Stopped);
        } else {
            self.board.end_session();
        }
    }

    /// Surfaces a device failure that happened while live. The session is
    /// released and the loop moves to `Erroring`.
    pub fn check_health(&mut self) -> Result<(), CaptureError> {
        let Some(fault) = self.session.as_ref().and_then(|session| session.frames.fault()) else {
            return Ok(());
        };

        log::error!("camera stream failed: {fault}");
        self.session = None;
        self.board.end_session();
        self.set_state(CaptureState::Erroring);
        Err(classify_device_error(&fault))
    }
}

impl Drop for CaptureLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        io,
        sync::atomic::AtomicUsize,
        time::Instant,
    };

    use crossbeam_channel::unbounded;

    use super::*;
    use crate::{auth::StaticToken, types::RecognitionResponse};

    fn test_frame() -> Frame {
        Frame {
            rgb: vec![90; 8 * 8 * 3],
            width: 8,
            height: 8,
            timestamp: Instant::now(),
        }
    }

    fn alice() -> RecognitionResponse {
        serde_json::from_str(
            r#"{"detected_students":[{"name":"Alice","student_id":"S1","status":"ok","liveness_score":0.95}],"unknown_faces":[],"unknown_count":0}"#,
        )
        .unwrap()
    }

    fn two_unknowns() -> RecognitionResponse {
        serde_json::from_str(r#"{"detected_students":[],"unknown_faces":[{},{}],"unknown_count":2}"#)
            .unwrap()
    }

    fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[derive(Default)]
    struct FakeDevices {
        open_error: Option<CaptureError>,
        playback_error: Option<CaptureError>,
        opened: Arc<AtomicUsize>,
        stopped: Arc<AtomicUsize>,
    }

    impl MediaDevices for FakeDevices {
        fn open_stream(
            &self,
            constraints: &StreamConstraints,
        ) -> Result<Box<dyn MediaStream>, CaptureError> {
            assert_eq!(constraints.ideal_width, 1280);
            assert!(!constraints.audio);
            if let Some(err) = &self.open_error {
                return Err(err.clone());
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            let frames = LatestFrame::default();
            frames.publish(test_frame());
            Ok(Box::new(FakeStream {
                frames,
                playback_error: self.playback_error.clone(),
                stopped: self.stopped.clone(),
                is_stopped: false,
            }))
        }
    }

    struct FakeStream {
        frames: LatestFrame,
        playback_error: Option<CaptureError>,
        stopped: Arc<AtomicUsize>,
        is_stopped: bool,
    }

    impl MediaStream for FakeStream {
        fn wait_until_playing(&mut self, _timeout: Duration) -> Result<(), CaptureError> {
            match &self.playback_error {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            }
        }

        fn frames(&self) -> LatestFrame {
            self.frames.clone()
        }

        fn stop_tracks(&mut self) {
            if !self.is_stopped {
                self.is_stopped = true;
                self.frames.clear();
                self.stopped.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn label(&self) -> &str {
            "fake camera"
        }
    }

    #[derive(Default)]
    struct FakeEndpoint {
        calls: AtomicUsize,
        script: Mutex<VecDeque<Result<RecognitionResponse, RecognitionError>>>,
        tokens: Mutex<Vec<Option<String>>>,
    }

    impl FakeEndpoint {
        fn scripted(script: Vec<Result<RecognitionResponse, RecognitionError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                ..Self::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl RecognitionEndpoint for FakeEndpoint {
        fn recognize(
            &self,
            jpeg: Vec<u8>,
            bearer: Option<&str>,
        ) -> Result<RecognitionResponse, RecognitionError> {
            assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.tokens.lock().unwrap().push(bearer.map(str::to_string));
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(alice()))
        }
    }

    struct RotatingToken(Mutex<String>);

    impl CredentialProvider for RotatingToken {
        fn bearer_token(&self) -> Option<String> {
            Some(self.0.lock().unwrap().clone())
        }
    }

    fn settings(tick_interval: Duration) -> LoopSettings {
        LoopSettings {
            tick_interval,
            ..LoopSettings::default()
        }
    }

    fn capture_loop(
        devices: FakeDevices,
        endpoint: Arc<FakeEndpoint>,
        tick_interval: Duration,
    ) -> CaptureLoop {
        CaptureLoop::new(
            Arc::new(devices),
            endpoint,
            Arc::new(StaticToken(Some("tok".into()))),
            settings(tick_interval),
        )
    }

    fn tick_context(
        endpoint: Arc<FakeEndpoint>,
        credentials: Arc<dyn CredentialProvider>,
        board: Arc<DetectionBoard>,
        order_guard: bool,
    ) -> (TickContext, crossbeam_channel::Receiver<MonitorEvent>) {
        let (tx, rx) = unbounded();
        let epoch = board.begin_session();
        let ctx = TickContext {
            endpoint,
            credentials,
            board,
            stats: Arc::new(MonitorStats::default()),
            events: Some(tx),
            jpeg_quality: 80,
            order_guard,
            epoch,
        };
        (ctx, rx)
    }

    #[test]
    fn stop_without_start_is_a_noop() {
        let endpoint = Arc::new(FakeEndpoint::default());
        let mut capture = capture_loop(FakeDevices::default(), endpoint, Duration::from_secs(3));
        capture.stop();
        capture.stop();
        assert_eq!(capture.state(), CaptureState::Idle);
        assert!(capture.snapshot().is_empty());
    }

    #[test]
    fn start_then_immediate_stop_releases_device_without_requests() {
        let devices = FakeDevices::default();
        let opened = devices.opened.clone();
        let stopped = devices.stopped.clone();
        let endpoint = Arc::new(FakeEndpoint::default());
        let mut capture = capture_loop(devices, endpoint.clone(), Duration::from_secs(3));

        capture.start().unwrap();
        assert_eq!(capture.state(), CaptureState::Live);
        assert_eq!(capture.stream_label(), Some("fake camera"));
        capture.stop();

        assert_eq!(capture.state(), CaptureState::Stopped);
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert_eq!(endpoint.calls(), 0);
        assert_eq!(capture.stats().ticks_fired, 0);
        assert!(capture.snapshot().is_empty());

        capture.stop();
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn acquisition_errors_are_reported_and_nothing_runs() {
        for err in [
            CaptureError::PermissionDenied("denied".into()),
            CaptureError::DeviceNotFound("none".into()),
            CaptureError::DeviceBusy("busy".into()),
        ] {
            let devices = FakeDevices {
                open_error: Some(err.clone()),
                ..FakeDevices::default()
            };
            let endpoint = Arc::new(FakeEndpoint::default());
            let mut capture = capture_loop(devices, endpoint.clone(), Duration::from_millis(5));

            assert_eq!(capture.start().unwrap_err(), err);
            assert_eq!(capture.state(), CaptureState::Erroring);
            thread::sleep(Duration::from_millis(30));
            assert_eq!(capture.stats().ticks_fired, 0);
            assert_eq!(endpoint.calls(), 0);
        }
    }

    #[test]
    fn playback_failure_releases_the_stream_and_never_ticks() {
        let devices = FakeDevices {
            playback_error: Some(CaptureError::PlaybackFailure("no frames".into())),
            ..FakeDevices::default()
        };
        let stopped = devices.stopped.clone();
        let endpoint = Arc::new(FakeEndpoint::default());
        let mut capture = capture_loop(devices, endpoint.clone(), Duration::from_millis(5));

        let err = capture.start().unwrap_err();
        assert!(matches!(err, CaptureError::PlaybackFailure(_)));
        assert_eq!(capture.state(), CaptureState::Erroring);
        assert_eq!(stopped.load(Ordering::SeqCst), 1);

        thread::sleep(Duration::from_millis(30));
        assert_eq!(capture.stats().ticks_fired, 0);
        assert_eq!(endpoint.calls(), 0);
    }

    #[test]
    fn start_while_live_does_not_acquire_again() {
        let devices = FakeDevices::default();
        let opened = devices.opened.clone();
        let endpoint = Arc::new(FakeEndpoint::default());
        let mut capture = capture_loop(devices, endpoint, Duration::from_secs(3));

        capture.start().unwrap();
        capture.start().unwrap();
        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn ticks_submit_frames_and_replace_the_snapshot() {
        let endpoint = Arc::new(FakeEndpoint::default());
        let (tx, rx) = unbounded();
        let mut capture =
            capture_loop(FakeDevices::default(), endpoint.clone(), Duration::from_millis(10))
                .with_events(tx);

        capture.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || capture.stats().responses_applied >= 1));

        let snapshot = capture.snapshot();
        assert_eq!(snapshot.recognized.len(), 1);
        assert_eq!(snapshot.recognized[0].name, "Alice");
        assert!(snapshot.captured_at.is_some());
        assert_eq!(endpoint.tokens.lock().unwrap()[0].as_deref(), Some("tok"));

        capture.stop();
        assert!(capture.snapshot().is_empty());

        let events: Vec<MonitorEvent> = rx.try_iter().collect();
        assert!(events.contains(&MonitorEvent::StateChanged(CaptureState::Live)));
        assert!(events.contains(&MonitorEvent::SnapshotUpdated));
        assert!(events.contains(&MonitorEvent::StateChanged(CaptureState::Stopped)));
    }

    #[test]
    fn no_tick_fires_after_stop_returns() {
        let endpoint = Arc::new(FakeEndpoint::default());
        let mut capture =
            capture_loop(FakeDevices::default(), endpoint, Duration::from_millis(5));

        capture.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || capture.stats().ticks_fired >= 2));
        capture.stop();

        let fired = capture.stats().ticks_fired;
        thread::sleep(Duration::from_millis(40));
        assert_eq!(capture.stats().ticks_fired, fired);
    }

    #[test]
    fn ticker_sees_cancellation_even_when_a_tick_is_ready() {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        assert!(!stop_requested(&stop_rx));
        drop(stop_tx);
        assert!(stop_requested(&stop_rx));
    }

    #[test]
    fn cancelled_ticker_spawns_no_further_requests() {
        let endpoint = Arc::new(FakeEndpoint::default());
        let board = Arc::new(DetectionBoard::default());
        let (ctx, _events) =
            tick_context(endpoint.clone(), Arc::new(StaticToken(None)), board, false);
        let ctx = Arc::new(ctx);
        let frames = LatestFrame::default();
        frames.publish(test_frame());

        for _ in 0..20 {
            let mut ticker = Ticker::spawn(Duration::from_millis(1), frames.clone(), ctx.clone());
            thread::sleep(Duration::from_millis(3));
            ticker.cancel();
        }
        let fired = ctx.stats.snapshot().ticks_fired;
        assert!(wait_until(Duration::from_secs(2), || {
            ctx.stats.snapshot().requests_sent == fired
        }));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(ctx.stats.snapshot().ticks_fired, fired);
        assert_eq!(endpoint.calls() as u64, fired);
    }

    #[test]
    fn failed_ticks_keep_the_previous_snapshot() {
        let endpoint = Arc::new(FakeEndpoint::scripted(vec![
            Ok(alice()),
            Err(RecognitionError::Status { status: 503 }),
            Err(RecognitionError::Transport(Box::new(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            )))),
        ]));
        let board = Arc::new(DetectionBoard::default());
        let (ctx, events) = tick_context(
            endpoint,
            Arc::new(StaticToken(Some("tok".into()))),
            board.clone(),
            false,
        );

        ctx.submit(1, test_frame(), SystemTime::now());
        let before = board.snapshot();
        assert_eq!(before.recognized.len(), 1);

        ctx.submit(2, test_frame(), SystemTime::now());
        assert_eq!(board.snapshot(), before);
        ctx.submit(3, test_frame(), SystemTime::now());
        assert_eq!(board.snapshot(), before);

        let stats = ctx.stats.snapshot();
        assert_eq!(stats.requests_sent, 3);
        assert_eq!(stats.responses_applied, 1);
        assert_eq!(stats.ticks_dropped, 2);
        let dropped = events
            .try_iter()
            .filter(|event| matches!(event, MonitorEvent::TickDropped { .. }))
            .count();
        assert_eq!(dropped, 2);
    }

    #[test]
    fn undecodable_frame_drops_the_tick_without_a_request() {
        let endpoint = Arc::new(FakeEndpoint::default());
        let board = Arc::new(DetectionBoard::default());
        let (ctx, _events) =
            tick_context(endpoint.clone(), Arc::new(StaticToken(None)), board, false);

        let mut frame = test_frame();
        frame.rgb.truncate(5);
        ctx.submit(1, frame, SystemTime::now());

        assert_eq!(endpoint.calls(), 0);
        assert_eq!(ctx.stats.snapshot().ticks_dropped, 1);
    }

    #[test]
    fn credential_is_read_for_every_request() {
        let endpoint = Arc::new(FakeEndpoint::default());
        let token = Arc::new(RotatingToken(Mutex::new("first".into())));
        let board = Arc::new(DetectionBoard::default());
        let (ctx, _events) = tick_context(endpoint.clone(), token.clone(), board, false);

        ctx.submit(1, test_frame(), SystemTime::now());
        *token.0.lock().unwrap() = "rotated".into();
        ctx.submit(2, test_frame(), SystemTime::now());

        let seen = endpoint.tokens.lock().unwrap().clone();
        assert_eq!(seen, vec![Some("first".into()), Some("rotated".into())]);
    }

    #[test]
    fn unknown_persons_raise_an_event() {
        let endpoint = Arc::new(FakeEndpoint::scripted(vec![Ok(two_unknowns())]));
        let board = Arc::new(DetectionBoard::default());
        let (ctx, events) =
            tick_context(endpoint, Arc::new(StaticToken(None)), board.clone(), false);

        ctx.submit(1, test_frame(), SystemTime::now());
        assert_eq!(board.snapshot().unknown.len(), 2);
        assert!(
            events
                .try_iter()
                .any(|event| event == MonitorEvent::UnknownPersons { count: 2 })
        );
    }

    #[test]
    fn responses_for_a_stopped_session_are_ignored() {
        let board = DetectionBoard::default();
        let epoch = board.begin_session();
        board.end_session();

        let snapshot = DetectionSnapshot::from_response(alice(), SystemTime::now());
        assert_eq!(board.apply(epoch, 1, snapshot.clone(), false), ApplyOutcome::StaleSession);
        assert!(board.snapshot().is_empty());

        let next = board.begin_session();
        assert_eq!(board.apply(epoch, 1, snapshot.clone(), false), ApplyOutcome::StaleSession);
        assert_eq!(board.apply(next, 1, snapshot, false), ApplyOutcome::Applied);
    }

    #[test]
    fn last_response_wins_unless_order_guard_is_on() {
        let newer = DetectionSnapshot::from_response(alice(), SystemTime::now());
        let older = DetectionSnapshot::from_response(two_unknowns(), SystemTime::now());

        let board = DetectionBoard::default();
        let epoch = board.begin_session();
        assert_eq!(board.apply(epoch, 2, newer.clone(), false), ApplyOutcome::Applied);
        assert_eq!(board.apply(epoch, 1, older.clone(), false), ApplyOutcome::Applied);
        assert_eq!(board.snapshot(), older);

        let guarded = DetectionBoard::default();
        let epoch = guarded.begin_session();
        assert_eq!(guarded.apply(epoch, 2, newer.clone(), true), ApplyOutcome::Applied);
        assert_eq!(guarded.apply(epoch, 1, older, true), ApplyOutcome::OutOfOrder);
        assert_eq!(guarded.snapshot(), newer);
    }

    #[test]
    fn device_fault_while_live_moves_to_erroring() {
        let devices = FakeDevices::default();
        let stopped = devices.stopped.clone();
        let endpoint = Arc::new(FakeEndpoint::default());
        let mut capture = capture_loop(devices, endpoint, Duration::from_secs(3));

        capture.start().unwrap();
        assert!(capture.check_health().is_ok());

        capture
            .session
            .as_ref()
            .unwrap()
            .frames
            .report_fault("camera stopped delivering frames: device unplugged");
        let err = capture.check_health().unwrap_err();
        assert!(matches!(err, CaptureError::Other(_)));
        assert_eq!(capture.state(), CaptureState::Erroring);
        assert_eq!(stopped.load(Ordering::SeqCst), 1);

        capture.start().unwrap();
        assert_eq!(capture.state(), CaptureState::Live);
    }
}
