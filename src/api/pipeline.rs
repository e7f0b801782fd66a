//! Pipeline orchestrator
//!
//! Owns the receiver and correction worker threads, the shared position
//! snapshot, the sentence filter and the relay queue between the two loops.
//!
//! State machine: `Idle -> Starting -> Running -> Stopping -> Idle`, with
//! `Failed` entered from `Starting`/`Running` on a receiver I/O fault.

use crate::api::filter::MessageFilter;
use crate::api::state::PositionState;
use crate::api::types::{
    ApiError, ApiResult, CorrectionStatus, LoopHealth, PipelineState, ReceiverStatus, SessionStatus,
};
use crate::core::{FilterSet, PositionFix, SentenceType};
use crate::hardware::link::DEFAULT_WRITE_SLICE;
use crate::hardware::{ReceiverChannel, ReceiverConfig, ReceiverLink, SerialChannel};
use crate::network::{BackoffPolicy, ClientState, CorrectionConfig, CorrectionSink, NtripClient, NtripError};
use crate::processing::{BinaryFrameDecoder, SentenceDecoder, SentenceOutcome};
use crate::utils::config::{PipelineConfig, DEFAULT_RELAY_CAPACITY};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, sync_channel, Sender, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const RECEIVER_READ_BUFFER: usize = 1024;

/// Longest wait for the worker loops to report ready
const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Relay bytes the serial line carries in one read timeout, so a write
/// slice never holds up reads for much longer than a read does
fn write_slice_for(config: &ReceiverConfig) -> usize {
    let bytes_per_sec = config.baud_rate as u64 / 10;
    let slice = bytes_per_sec * config.read_timeout_ms / 1000;
    (slice as usize).clamp(16, 1024)
}

/// Status shared between the workers and the public API
#[derive(Debug, Default)]
struct StatusBoard {
    receiver: ReceiverStatus,
    correction: Option<CorrectionStatus>,
    last_error: Option<String>,
}

/// State shared with the worker threads
#[derive(Debug, Default)]
struct Shared {
    state: Mutex<PipelineState>,
    position: PositionState,
    filter: MessageFilter,
    status: Mutex<StatusBoard>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn state(&self) -> PipelineState {
        *lock(&self.state)
    }

    fn set_state(&self, state: PipelineState) {
        let mut current = lock(&self.state);
        let previous = *current;
        if previous != state {
            tracing::info!(from = %previous, to = %state, "Pipeline state changed");
            *current = state;
        }
    }

    /// Record a fatal fault and ask every worker to stop
    fn fail(&self, reason: String, stop: &AtomicBool) {
        {
            let mut current = lock(&self.state);
            if matches!(*current, PipelineState::Starting | PipelineState::Running) {
                tracing::error!(reason = %reason, "Pipeline failed");
                *current = PipelineState::Failed;
            }
        }
        lock(&self.status).last_error = Some(reason);
        stop.store(true, Ordering::Relaxed);
    }
}

/// Decode every buffered sentence and publish its fix.
///
/// The filter is fetched again before each sentence so a change made while a
/// chunk is being decoded applies to the very next classification.
fn publish_fixes<F>(decoder: &mut SentenceDecoder, position: &PositionState, mut current_filter: F) -> u64
where
    F: FnMut() -> Arc<FilterSet>,
{
    let mut published = 0;
    loop {
        let filter = current_filter();
        match decoder.next_outcome(&filter) {
            Some(SentenceOutcome::PositionReport(fix)) => {
                position.replace(fix);
                published += 1;
            }
            Some(_) => {}
            None => return published,
        }
    }
}

/// Receiver loop: read, decode, publish fixes and write queued corrections
fn run_receiver(shared: Arc<Shared>, mut link: ReceiverLink, stop: Arc<AtomicBool>, ready: Sender<()>) {
    let mut decoder = SentenceDecoder::new();
    let mut buf = [0u8; RECEIVER_READ_BUFFER];
    lock(&shared.status).receiver.health = LoopHealth::Running;
    tracing::info!(channel = link.name(), "Receiver loop started");
    let _ = ready.send(());

    let result = loop {
        if stop.load(Ordering::Relaxed) {
            break Ok(());
        }
        if let Err(e) = link.flush_relay() {
            break Err(e);
        }

        let n = match link.read(&mut buf) {
            Ok(n) => n,
            Err(e) => break Err(e),
        };
        let mut published = 0;
        if n > 0 {
            decoder.push(&buf[..n]);
            published = publish_fixes(&mut decoder, &shared.position, || shared.filter.snapshot());
        }

        let mut status = lock(&shared.status);
        status.receiver.bytes_read = link.bytes_read();
        status.receiver.bytes_relayed = link.bytes_relayed();
        status.receiver.sentences = decoder.counters();
        status.receiver.position_updates += published;
    };

    match result {
        Ok(()) => {
            lock(&shared.status).receiver.health = LoopHealth::Idle;
            tracing::info!(channel = link.name(), "Receiver loop stopped");
        }
        Err(e) => {
            lock(&shared.status).receiver.health = LoopHealth::Failed;
            shared.fail(format!("receiver {}: {}", link.name(), e), &stop);
        }
    }
}

/// Correction loop side: accounts frames and feeds the relay queue
struct CorrectionWorker {
    shared: Arc<Shared>,
    relay: SyncSender<Vec<u8>>,
    frames: BinaryFrameDecoder,
}

impl CorrectionWorker {
    fn new(shared: Arc<Shared>, relay: SyncSender<Vec<u8>>) -> Self {
        Self {
            shared,
            relay,
            frames: BinaryFrameDecoder::new(),
        }
    }

    fn with_status<F: FnOnce(&mut CorrectionStatus)>(&self, update: F) {
        let mut status = lock(&self.shared.status);
        update(status.correction.get_or_insert_with(CorrectionStatus::default));
    }
}

impl CorrectionSink for CorrectionWorker {
    fn state_changed(&mut self, state: ClientState) {
        self.with_status(|status| {
            status.client_state = state;
            match state {
                ClientState::Streaming => {
                    status.health = LoopHealth::Running;
                    status.current_attempt = 0;
                }
                ClientState::Connecting if status.health != LoopHealth::Reconnecting => {
                    status.health = LoopHealth::Running;
                }
                _ => {}
            }
        });
    }

    fn corrections(&mut self, bytes: &[u8]) {
        self.frames.push(bytes);
        let frames = self.frames.drain_frames();

        let (relayed, dropped) = match self.relay.try_send(bytes.to_vec()) {
            Ok(()) => (true, false),
            Err(TrySendError::Full(_)) => {
                tracing::debug!(bytes = bytes.len(), "Relay queue full, dropping correction chunk");
                (false, true)
            }
            // receiver loop has ended; the session is shutting down
            Err(TrySendError::Disconnected(_)) => (false, false),
        };

        let counters = self.frames.counters();
        self.with_status(|status| {
            status.bytes_received += bytes.len() as u64;
            if relayed {
                status.chunks_relayed += 1;
            }
            if dropped {
                status.chunks_dropped += 1;
                status.bytes_dropped += bytes.len() as u64;
            }
            status.frames = counters;
            for frame in &frames {
                status.messages.record(frame);
            }
        });
    }

    fn upload_position(&mut self) -> Option<PositionFix> {
        Some(self.shared.position.read())
    }

    fn connection_failed(&mut self, error: &NtripError) {
        let recoverable = error.is_recoverable();
        let detail = error.to_string();
        self.with_status(|status| {
            status.last_error = Some(detail);
            if !recoverable {
                status.health = LoopHealth::Failed;
            }
        });
    }

    fn retry_scheduled(&mut self, attempt: u32, _delay: Duration) {
        self.with_status(|status| {
            status.health = LoopHealth::Reconnecting;
            status.current_attempt = attempt;
            status.reconnects += 1;
        });
    }
}

fn run_correction(
    shared: Arc<Shared>,
    client: NtripClient,
    relay: SyncSender<Vec<u8>>,
    stop: Arc<AtomicBool>,
    ready: Sender<()>,
) {
    let mut worker = CorrectionWorker::new(Arc::clone(&shared), relay);
    tracing::info!(
        host = %client.config().host,
        mountpoint = %client.config().mountpoint,
        "Correction loop started"
    );
    let _ = ready.send(());
    match client.run(&mut worker, &stop) {
        Ok(()) => {
            worker.with_status(|status| status.health = LoopHealth::Idle);
            tracing::info!("Correction loop stopped");
        }
        Err(e) => tracing::error!(error = %e, "Correction loop gave up"),
    }
}

/// RTK positioning pipeline
///
/// Configure the receiver (and optionally a correction service), then
/// `start`. Position and status reads are non-blocking copies and are valid
/// in every state.
pub struct Pipeline {
    receiver_config: Option<ReceiverConfig>,
    correction_config: Option<CorrectionConfig>,
    backoff: BackoffPolicy,
    relay_capacity: usize,
    shared: Arc<Shared>,
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            receiver_config: None,
            correction_config: None,
            backoff: BackoffPolicy::default(),
            relay_capacity: DEFAULT_RELAY_CAPACITY,
            shared: Arc::new(Shared::default()),
            stop: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
        }
    }

    /// Build an idle pipeline from a validated configuration
    pub fn from_config(config: &PipelineConfig) -> ApiResult<Self> {
        config.validate()?;
        let mut pipeline = Self::new();
        pipeline.receiver_config = Some(config.receiver.clone());
        pipeline.correction_config = config.correction.clone();
        pipeline.backoff = config.backoff.clone();
        pipeline.relay_capacity = config.relay_capacity;
        pipeline.shared.filter.set(config.filter_set()?);
        Ok(pipeline)
    }

    fn require_stopped(&self, operation: &str) -> ApiResult<()> {
        let state = self.shared.state();
        if !state.is_stopped() {
            return Err(ApiError::InvalidState {
                operation: operation.to_string(),
                state,
            });
        }
        Ok(())
    }

    /// Set the serial port and baud rate used by `start`
    pub fn configure_receiver(&mut self, port: &str, baud_rate: u32) -> ApiResult<()> {
        let config = ReceiverConfig {
            port: port.to_string(),
            baud_rate,
            ..self.receiver_config.clone().unwrap_or_default()
        };
        self.configure_receiver_with(config)
    }

    pub fn configure_receiver_with(&mut self, config: ReceiverConfig) -> ApiResult<()> {
        self.require_stopped("configure receiver")?;
        config.validate()?;
        self.receiver_config = Some(config);
        Ok(())
    }

    /// Set the correction service; without one the pipeline runs receiver-only
    pub fn configure_correction(&mut self, config: CorrectionConfig) -> ApiResult<()> {
        self.require_stopped("configure correction")?;
        config.validate()?;
        self.correction_config = Some(config);
        Ok(())
    }

    pub fn configure_backoff(&mut self, policy: BackoffPolicy) -> ApiResult<()> {
        self.require_stopped("configure backoff")?;
        policy.validate()?;
        self.backoff = policy;
        Ok(())
    }

    /// Open the configured serial port and start both loops
    pub fn start(&mut self) -> ApiResult<()> {
        self.require_stopped("start")?;
        let config = self.receiver_config.clone().ok_or_else(|| ApiError::NotConfigured {
            component: "receiver".to_string(),
        })?;
        let channel = SerialChannel::open(&config)?;
        self.launch(Box::new(channel), write_slice_for(&config))
    }

    /// Start both loops on an already opened receiver channel
    pub fn start_with_channel(&mut self, channel: Box<dyn ReceiverChannel>) -> ApiResult<()> {
        self.launch(channel, DEFAULT_WRITE_SLICE)
    }

    /// Spawn both loops and wait until each reports ready before entering `Running`
    fn launch(&mut self, channel: Box<dyn ReceiverChannel>, write_slice: usize) -> ApiResult<()> {
        self.require_stopped("start")?;
        self.join_workers();

        let client = match &self.correction_config {
            Some(config) => Some(NtripClient::new(config.clone(), self.backoff.clone())?),
            None => None,
        };

        self.shared.set_state(PipelineState::Starting);
        {
            let mut status = lock(&self.shared.status);
            *status = StatusBoard {
                receiver: ReceiverStatus {
                    channel: Some(channel.name().to_string()),
                    ..ReceiverStatus::default()
                },
                correction: client.as_ref().map(|_| CorrectionStatus::default()),
                last_error: None,
            };
        }

        self.stop = Arc::new(AtomicBool::new(false));
        let (relay_tx, relay_rx) = sync_channel(self.relay_capacity);
        let link = ReceiverLink::new(channel, relay_rx).with_write_slice(write_slice);
        let (ready_tx, ready_rx) = mpsc::channel();

        let receiver = {
            let shared = Arc::clone(&self.shared);
            let stop = Arc::clone(&self.stop);
            let ready = ready_tx.clone();
            thread::Builder::new()
                .name("rtk-receiver".to_string())
                .spawn(move || run_receiver(shared, link, stop, ready))
        };
        match receiver {
            Ok(handle) => self.workers.push(handle),
            Err(e) => return Err(self.abort_start(format!("cannot spawn receiver thread: {}", e))),
        }

        if let Some(client) = client {
            let shared = Arc::clone(&self.shared);
            let stop = Arc::clone(&self.stop);
            let ready = ready_tx.clone();
            let spawned = thread::Builder::new()
                .name("rtk-correction".to_string())
                .spawn(move || run_correction(shared, client, relay_tx, stop, ready));
            match spawned {
                Ok(handle) => self.workers.push(handle),
                Err(e) => return Err(self.abort_start(format!("cannot spawn correction thread: {}", e))),
            }
        }
        drop(ready_tx);

        for _ in 0..self.workers.len() {
            if ready_rx.recv_timeout(STARTUP_TIMEOUT).is_err() {
                return Err(self.abort_start("worker loop did not report ready".to_string()));
            }
        }

        let mut state = lock(&self.shared.state);
        if *state == PipelineState::Starting {
            *state = PipelineState::Running;
            tracing::info!("Pipeline running");
        }
        Ok(())
    }

    fn abort_start(&mut self, details: String) -> ApiError {
        self.stop.store(true, Ordering::Relaxed);
        self.join_workers();
        self.shared.set_state(PipelineState::Idle);
        ApiError::Internal { details }
    }

    fn join_workers(&mut self) {
        for handle in self.workers.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                tracing::error!(worker = %name, "Worker thread panicked");
                lock(&self.shared.status).last_error = Some(format!("{} thread panicked", name));
            }
        }
    }

    /// Stop both loops and wait for them; idempotent
    pub fn stop(&mut self) -> ApiResult<()> {
        let state = self.shared.state();
        if state == PipelineState::Idle && self.workers.is_empty() {
            return Ok(());
        }
        self.shared.set_state(PipelineState::Stopping);
        self.stop.store(true, Ordering::Relaxed);
        self.join_workers();
        self.shared.set_state(PipelineState::Idle);
        Ok(())
    }

    pub fn state(&self) -> PipelineState {
        self.shared.state()
    }

    /// Latest position fix; fails once the session has failed
    pub fn get_position(&self) -> ApiResult<PositionFix> {
        if self.shared.state() == PipelineState::Failed {
            let reason = lock(&self.shared.status)
                .last_error
                .clone()
                .unwrap_or_else(|| "unknown fault".to_string());
            return Err(ApiError::SessionFailed { reason });
        }
        Ok(self.shared.position.read())
    }

    /// Replace the enabled sentence set; takes effect for sentences decoded afterwards
    pub fn set_enabled_sentence_types(&self, types: &[SentenceType]) {
        self.shared.filter.set(types.iter().copied().collect::<FilterSet>());
    }

    /// Tag-based variant of [`Pipeline::set_enabled_sentence_types`]
    pub fn set_enabled_sentence_tags<S: AsRef<str>>(&self, tags: &[S]) -> ApiResult<()> {
        self.shared.filter.set_tags(tags)
    }

    pub fn get_enabled_sentence_types(&self) -> Vec<SentenceType> {
        self.shared.filter.get().iter().collect()
    }

    pub fn list_supported_sentence_types(&self) -> Vec<SentenceType> {
        self.shared.filter.supported()
    }

    /// Snapshot of pipeline, loop and decoder status
    pub fn get_status(&self) -> SessionStatus {
        let status = lock(&self.shared.status);
        SessionStatus {
            state: self.shared.state(),
            receiver: status.receiver.clone(),
            correction: status.correction.clone(),
            enabled_sentences: self.get_enabled_sentence_types(),
            last_error: status.last_error.clone(),
        }
    }

    /// Position snapshots published since the pipeline was created
    pub fn position_updates(&self) -> u64 {
        self.shared.position.update_count()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.join_workers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FixQuality;
    use crate::hardware::{MockChannel, MockHandle};
    use crate::processing::frame::encode_frame;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::time::Instant;

    const GGA: &str = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47\r\n";
    const RMC: &str = "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,290324,003.1,W*6B\r\n";

    fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn mock_pipeline() -> (Pipeline, MockHandle) {
        let mock = MockChannel::new("mock-receiver");
        let handle = mock.handle();
        let mut pipeline = Pipeline::new();
        pipeline.start_with_channel(Box::new(mock)).unwrap();
        (pipeline, handle)
    }

    #[test]
    fn test_initial_position_is_invalid() {
        let pipeline = Pipeline::new();
        assert_eq!(pipeline.state(), PipelineState::Idle);
        assert_eq!(pipeline.get_position().unwrap(), PositionFix::invalid());
        assert_eq!(
            pipeline.list_supported_sentence_types(),
            vec![SentenceType::Gga, SentenceType::Rmc]
        );
    }

    #[test]
    fn test_start_without_receiver_config() {
        let mut pipeline = Pipeline::new();
        assert!(matches!(pipeline.start(), Err(ApiError::NotConfigured { .. })));
        assert!(pipeline.configure_receiver("", 115_200).is_err());
        assert!(pipeline.configure_receiver("/dev/ttyUSB0", 0).is_err());
    }

    #[test]
    fn test_fix_published_from_receiver() {
        let (mut pipeline, handle) = mock_pipeline();
        assert_eq!(pipeline.state(), PipelineState::Running);

        handle.feed(RMC.as_bytes());
        handle.feed(GGA.as_bytes());
        assert!(wait_for(|| pipeline.get_status().receiver.position_updates == 1));

        let fix = pipeline.get_position().unwrap();
        assert!((fix.latitude - 48.1173).abs() < 1e-4);
        assert_eq!(fix.fix_quality, FixQuality::Standard);
        assert!((fix.speed_kmh - 22.4 * 1.852).abs() < 1e-9);
        assert!(fix.timestamp.is_some());

        let status = pipeline.get_status();
        assert_eq!(status.receiver.health, LoopHealth::Running);
        assert_eq!(status.receiver.position_updates, 1);
        assert_eq!(status.receiver.channel.as_deref(), Some("mock-receiver"));
        assert!(status.correction.is_none());

        pipeline.stop().unwrap();
        assert_eq!(pipeline.state(), PipelineState::Idle);
        assert_eq!(pipeline.get_status().receiver.health, LoopHealth::Idle);
        pipeline.stop().unwrap();
    }

    #[test]
    fn test_empty_filter_freezes_position() {
        let (mut pipeline, handle) = mock_pipeline();
        pipeline.set_enabled_sentence_types(&[]);
        assert!(pipeline.get_enabled_sentence_types().is_empty());

        handle.feed(GGA.as_bytes());
        handle.feed(GGA.as_bytes());
        assert!(wait_for(|| handle.pending_chunks() == 0));
        assert!(wait_for(|| pipeline.get_status().receiver.sentences.ignored == 2));
        assert_eq!(pipeline.get_position().unwrap(), PositionFix::invalid());
        assert_eq!(pipeline.position_updates(), 0);

        pipeline.set_enabled_sentence_tags(&["GGA"]).unwrap();
        handle.feed(GGA.as_bytes());
        assert!(wait_for(|| pipeline.position_updates() == 1));
        assert!(pipeline.set_enabled_sentence_tags(&["XYZ"]).is_err());
        assert_eq!(pipeline.get_enabled_sentence_types(), vec![SentenceType::Gga]);
        pipeline.stop().unwrap();
    }

    #[test]
    fn test_receiver_fault_fails_session() {
        let (mut pipeline, handle) = mock_pipeline();
        handle.feed(GGA.as_bytes());
        assert!(wait_for(|| pipeline.position_updates() == 1));

        handle.fail_reads("device removed");
        assert!(wait_for(|| pipeline.state() == PipelineState::Failed));
        match pipeline.get_position() {
            Err(ApiError::SessionFailed { reason }) => assert!(reason.contains("device removed")),
            other => panic!("expected session failure, got {:?}", other),
        }
        let status = pipeline.get_status();
        assert_eq!(status.receiver.health, LoopHealth::Failed);
        assert!(status.last_error.is_some());

        assert!(matches!(
            pipeline.configure_receiver("/dev/ttyUSB1", 9600),
            Ok(())
        ));
        pipeline.stop().unwrap();
        assert_eq!(pipeline.state(), PipelineState::Idle);
        assert!(pipeline.get_position().is_ok());
    }

    #[test]
    fn test_configuration_rejected_while_running() {
        let (mut pipeline, _handle) = mock_pipeline();
        let result = pipeline.configure_correction(CorrectionConfig::new("localhost", 2101, "M"));
        assert!(matches!(result, Err(ApiError::InvalidState { .. })));
        assert!(pipeline.start_with_channel(Box::new(MockChannel::new("second"))).is_err());
        pipeline.stop().unwrap();
    }

    #[test]
    fn test_corrections_relayed_to_receiver_unmodified() {
        let first = encode_frame(&[0x3E, 0xD0, 0x01, 0x02]).unwrap();
        let second = encode_frame(&[0x43, 0x50, 0xAA]).unwrap();
        let mut stream = b"ICY 200 OK\r\n\r\n".to_vec();
        stream.extend_from_slice(&first);
        stream.extend_from_slice(&second);
        stream.extend_from_slice(b"\x00\x01garbage");

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let caster = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut request = [0u8; 512];
            let _ = socket.read(&mut request);
            socket.write_all(&stream).unwrap();
            thread::sleep(Duration::from_millis(300));
        });

        let mut correction = CorrectionConfig::new("127.0.0.1", port, "RTCM3");
        correction.gga_interval_secs = 0;
        let mock = MockChannel::new("mock-receiver");
        let handle = mock.handle();
        let mut pipeline = Pipeline::new();
        pipeline.configure_correction(correction).unwrap();
        pipeline
            .configure_backoff(BackoffPolicy {
                initial_ms: 5_000,
                ..BackoffPolicy::default()
            })
            .unwrap();
        pipeline.start_with_channel(Box::new(mock)).unwrap();

        let mut expected = first.clone();
        expected.extend_from_slice(&second);
        expected.extend_from_slice(b"\x00\x01garbage");
        assert!(wait_for(|| handle.written().len() >= expected.len()));
        assert_eq!(handle.written(), expected);

        let status = pipeline.get_status();
        let correction = status.correction.unwrap();
        assert_eq!(correction.frames.frames_decoded, 2);
        assert_eq!(correction.messages.message_counts.get(&1005), Some(&1));
        assert_eq!(correction.messages.message_counts.get(&1077), Some(&1));
        assert_eq!(correction.bytes_received, expected.len() as u64);
        assert_eq!(correction.chunks_dropped, 0);

        caster.join().unwrap();
        pipeline.stop().unwrap();
    }

    #[test]
    fn test_full_relay_queue_drops_newest_chunk() {
        let shared = Arc::new(Shared::default());
        let (tx, rx) = sync_channel(1);
        let mut worker = CorrectionWorker::new(Arc::clone(&shared), tx);

        worker.corrections(&[1, 2, 3]);
        worker.corrections(&[4, 5]);
        assert_eq!(rx.try_recv().unwrap(), vec![1, 2, 3]);
        assert!(rx.try_recv().is_err());

        let status = lock(&shared.status).correction.clone().unwrap();
        assert_eq!(status.chunks_relayed, 1);
        assert_eq!(status.chunks_dropped, 1);
        assert_eq!(status.bytes_dropped, 2);
        assert_eq!(status.bytes_received, 5);
    }

    #[test]
    fn test_filter_change_applies_to_next_buffered_sentence() {
        let mut decoder = SentenceDecoder::new();
        decoder.push(GGA.as_bytes());
        decoder.push(GGA.as_bytes());
        let position = PositionState::new();

        let mut first = true;
        let published = publish_fixes(&mut decoder, &position, || {
            if first {
                first = false;
                Arc::new(FilterSet::all())
            } else {
                Arc::new(FilterSet::empty())
            }
        });
        assert_eq!(published, 1);
        assert_eq!(position.update_count(), 1);
        assert_eq!(decoder.counters().position_reports, 1);
        assert_eq!(decoder.counters().ignored, 1);
    }

    #[test]
    fn test_running_only_once_loops_report_ready() {
        let (mut pipeline, _handle) = mock_pipeline();
        assert_eq!(pipeline.state(), PipelineState::Running);
        assert_eq!(pipeline.get_status().receiver.health, LoopHealth::Running);
        pipeline.stop().unwrap();
    }

    #[test]
    fn test_write_slice_follows_serial_throughput() {
        assert_eq!(write_slice_for(&ReceiverConfig::new("/dev/ttyUSB0", 115_200)), 1024);
        let slow = ReceiverConfig {
            read_timeout_ms: 100,
            ..ReceiverConfig::new("/dev/ttyUSB0", 9_600)
        };
        assert_eq!(write_slice_for(&slow), 96);
        let tiny = ReceiverConfig {
            read_timeout_ms: 1,
            ..ReceiverConfig::new("/dev/ttyUSB0", 4_800)
        };
        assert_eq!(write_slice_for(&tiny), 16);
    }

    #[test]
    fn test_flapping_caster_does_not_stall_positions() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            for socket in listener.incoming().take(200) {
                let Ok(mut socket) = socket else { continue };
                let mut request = [0u8; 512];
                let _ = socket.read(&mut request);
                let _ = socket.write_all(b"ICY 200 OK\r\n\r\n");
            }
        });

        let mut correction = CorrectionConfig::new("127.0.0.1", port, "RTCM3");
        correction.gga_interval_secs = 0;
        let mock = MockChannel::new("mock-receiver");
        let handle = mock.handle();
        let mut pipeline = Pipeline::new();
        pipeline.configure_correction(correction).unwrap();
        pipeline
            .configure_backoff(BackoffPolicy {
                initial_ms: 20,
                max_ms: 50,
                multiplier: 2.0,
            })
            .unwrap();
        pipeline.start_with_channel(Box::new(mock)).unwrap();

        let mut seen = 0;
        for _ in 0..5 {
            handle.feed(GGA.as_bytes());
            assert!(wait_for(|| pipeline.position_updates() > seen));
            seen = pipeline.position_updates();
            thread::sleep(Duration::from_millis(30));
        }
        assert!(wait_for(|| {
            pipeline
                .get_status()
                .correction
                .map_or(false, |correction| correction.reconnects >= 1)
        }));
        handle.feed(GGA.as_bytes());
        assert!(wait_for(|| pipeline.position_updates() > seen));
        assert_eq!(pipeline.state(), PipelineState::Running);
        pipeline.stop().unwrap();
    }

    #[test]
    fn test_receiver_write_fault_fails_session() {
        let frame = encode_frame(&[0x3E, 0xD0, 0x01, 0x02]).unwrap();
        let mut stream = b"ICY 200 OK\r\n\r\n".to_vec();
        stream.extend_from_slice(&frame);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let caster = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut request = [0u8; 512];
            let _ = socket.read(&mut request);
            socket.write_all(&stream).unwrap();
            thread::sleep(Duration::from_millis(300));
        });

        let mut correction = CorrectionConfig::new("127.0.0.1", port, "RTCM3");
        correction.gga_interval_secs = 0;
        let mock = MockChannel::new("mock-receiver");
        let handle = mock.handle();
        handle.fail_writes("receiver unplugged");
        let mut pipeline = Pipeline::new();
        pipeline.configure_correction(correction).unwrap();
        pipeline
            .configure_backoff(BackoffPolicy {
                initial_ms: 5_000,
                ..BackoffPolicy::default()
            })
            .unwrap();
        pipeline.start_with_channel(Box::new(mock)).unwrap();

        assert!(wait_for(|| pipeline.state() == PipelineState::Failed));
        match pipeline.get_position() {
            Err(ApiError::SessionFailed { reason }) => assert!(reason.contains("receiver unplugged")),
            other => panic!("expected session failure, got {:?}", other),
        }
        assert_eq!(pipeline.get_status().receiver.health, LoopHealth::Failed);
        assert!(handle.written().is_empty());

        caster.join().unwrap();
        pipeline.stop().unwrap();
    }

    #[test]
    fn test_from_config_applies_filter() {
        let config = PipelineConfig {
            receiver: ReceiverConfig::new("/dev/ttyUSB0", 115_200),
            enabled_sentences: vec!["RMC".to_string()],
            ..PipelineConfig::default()
        };
        let pipeline = Pipeline::from_config(&config).unwrap();
        assert_eq!(pipeline.get_enabled_sentence_types(), vec![SentenceType::Rmc]);

        let invalid = PipelineConfig::default();
        assert!(matches!(
            Pipeline::from_config(&invalid),
            Err(ApiError::ConfigurationError { .. })
        ));
    }
}
