//! Recovery-behaviour tests for the pipeline supervisor.
//!
//! Spawning is scripted through a mock [`ProcessLauncher`], events are
//! captured by a recording bus, and every timer-driven scenario runs under
//! the paused tokio clock so delays are exact and instantaneous.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{duplex, AsyncWriteExt, DuplexStream};
use tokio::sync::watch;
use tokio::time;

use vigil_core::capture::{exit_pair, ChildControl, CommandSpec, ExitGate, ExitNotice};
use vigil_core::{
    ChannelConfig, ChannelEvent, ChannelKind, EventBus, FatalEvent, LaunchError, LaunchedChild,
    MetricsRegistry, PipelineState, PipelineSupervisor, ProcessLauncher, RandomSource,
    RecoverEvent, RecoveryReason, SupervisorDeps,
};

// ─────────────────────────────────────────────────────────────────────────────
// Test doubles
// ─────────────────────────────────────────────────────────────────────────────

/// Scripted outcome of one launch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// ENOENT: the binary does not exist.
    NotFound,
    /// The binary exists but the device is busy.
    Busy,
    /// Spawn succeeds; the test drives the child through a [`TestChild`].
    Child,
}

/// Test-side handle over one mock child.
struct TestChild {
    stdout: DuplexStream,
    exit_tx: Arc<watch::Sender<Option<ExitNotice>>>,
    exited: Arc<AtomicBool>,
    terminated: Arc<AtomicBool>,
    killed: Arc<AtomicBool>,
    live: Arc<AtomicUsize>,
}

impl TestChild {
    async fn write(&mut self, data: &[u8]) {
        self.stdout.write_all(data).await.expect("mock stdout write");
    }

    fn exit(&self, code: Option<i32>) {
        if !self.exited.swap(true, Ordering::SeqCst) {
            self.live.fetch_sub(1, Ordering::SeqCst);
            let _ = self.exit_tx.send(Some(ExitNotice { code }));
        }
    }

    fn was_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

struct MockControl {
    gate: ExitGate,
    exit_tx: Arc<watch::Sender<Option<ExitNotice>>>,
    exited: Arc<AtomicBool>,
    terminated: Arc<AtomicBool>,
    killed: Arc<AtomicBool>,
    live: Arc<AtomicUsize>,
    /// Mimics a well-behaved transcoder: SIGTERM makes it exit promptly.
    auto_exit_on_terminate: bool,
}

impl MockControl {
    fn publish_exit(&self) {
        if !self.exited.swap(true, Ordering::SeqCst) {
            self.live.fetch_sub(1, Ordering::SeqCst);
            let _ = self.exit_tx.send(Some(ExitNotice { code: None }));
        }
    }
}

impl ChildControl for MockControl {
    fn terminate(&mut self) {
        self.terminated.store(true, Ordering::SeqCst);
        if self.auto_exit_on_terminate {
            self.publish_exit();
        }
    }

    fn force_kill(&mut self) {
        self.killed.store(true, Ordering::SeqCst);
        self.publish_exit();
    }

    fn exit_gate(&self) -> ExitGate {
        self.gate.clone()
    }

    fn id(&self) -> Option<u32> {
        None
    }
}

/// Scripted launcher: pops one outcome per launch, falling back to a default.
struct MockLauncher {
    script: Mutex<VecDeque<Outcome>>,
    default: Outcome,
    auto_exit_on_terminate: bool,
    launches: AtomicUsize,
    specs: Mutex<Vec<CommandSpec>>,
    children: Mutex<Vec<Option<TestChild>>>,
    live: Arc<AtomicUsize>,
    max_live: AtomicUsize,
}

impl MockLauncher {
    fn new(script: &[Outcome], default: Outcome) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.iter().copied().collect()),
            default,
            auto_exit_on_terminate: true,
            launches: AtomicUsize::new(0),
            specs: Mutex::new(Vec::new()),
            children: Mutex::new(Vec::new()),
            live: Arc::new(AtomicUsize::new(0)),
            max_live: AtomicUsize::new(0),
        })
    }

    fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    fn take_child(&self, index: usize) -> TestChild {
        self.children.lock()[index]
            .take()
            .expect("child already taken or never spawned")
    }

    fn spec(&self, index: usize) -> CommandSpec {
        self.specs.lock()[index].clone()
    }
}

impl ProcessLauncher for MockLauncher {
    fn launch(&self, spec: &CommandSpec) -> Result<LaunchedChild, LaunchError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.specs.lock().push(spec.clone());
        let outcome = self
            .script
            .lock()
            .pop_front()
            .unwrap_or(self.default);
        match outcome {
            Outcome::NotFound => Err(LaunchError::NotFound(spec.binary.clone())),
            Outcome::Busy => Err(LaunchError::Spawn {
                binary: spec.binary.clone(),
                source: std::io::Error::other("device or resource busy"),
            }),
            Outcome::Child => {
                let (stdout_test, stdout_child) = duplex(64 * 1024);
                let (_stderr_test, stderr_child) = duplex(1024);
                let (exit_tx, gate) = exit_pair();
                let exit_tx = Arc::new(exit_tx);
                let exited = Arc::new(AtomicBool::new(false));
                let terminated = Arc::new(AtomicBool::new(false));
                let killed = Arc::new(AtomicBool::new(false));

                let previous = self.live.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_live.fetch_max(previous, Ordering::SeqCst);

                self.children.lock().push(Some(TestChild {
                    stdout: stdout_test,
                    exit_tx: Arc::clone(&exit_tx),
                    exited: Arc::clone(&exited),
                    terminated: Arc::clone(&terminated),
                    killed: Arc::clone(&killed),
                    live: Arc::clone(&self.live),
                }));

                Ok(LaunchedChild {
                    stdout: Box::new(stdout_child),
                    stderr: Box::new(stderr_child),
                    stdin: None,
                    control: Box::new(MockControl {
                        gate,
                        exit_tx,
                        exited,
                        terminated,
                        killed,
                        live: Arc::clone(&self.live),
                        auto_exit_on_terminate: self.auto_exit_on_terminate,
                    }),
                })
            }
        }
    }
}

/// Records every emitted event and the interleaved metric calls, so the
/// metric-before-recover ordering is observable.
#[derive(Default)]
struct RecordingBus {
    log: Arc<Mutex<Vec<String>>>,
    events: Mutex<Vec<ChannelEvent>>,
}

impl EventBus for RecordingBus {
    fn emit(&self, _channel: &str, event: ChannelEvent) {
        self.log.lock().push(format!("event:{}", event.name()));
        self.events.lock().push(event);
    }
}

impl RecordingBus {
    fn recovers(&self) -> Vec<RecoverEvent> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                ChannelEvent::Recover(recover) => Some(recover.clone()),
                _ => None,
            })
            .collect()
    }

    fn errors(&self) -> Vec<RecoveryReason> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                ChannelEvent::Error { kind, .. } => Some(*kind),
                _ => None,
            })
            .collect()
    }

    fn fatals(&self) -> Vec<FatalEvent> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                ChannelEvent::Fatal(fatal) => Some(fatal.clone()),
                _ => None,
            })
            .collect()
    }

    fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| event.name() == name)
            .count()
    }

    fn units(&self) -> Vec<Bytes> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                ChannelEvent::Data { unit } => Some(unit.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Metrics wrapper sharing the bus's log to observe call ordering.
struct OrderedMetrics {
    inner: MetricsRegistry,
    log: Arc<Mutex<Vec<String>>>,
}

impl vigil_core::CaptureMetrics for OrderedMetrics {
    fn record_pipeline_restart(
        &self,
        kind: ChannelKind,
        reason: RecoveryReason,
        meta: &vigil_core::RestartMeta,
    ) {
        self.log.lock().push(format!("metric:{reason}"));
        self.inner.record_pipeline_restart(kind, reason, meta);
    }

    fn record_audio_device_discovery(&self, reason: &str, meta: &vigil_core::DiscoveryMeta) {
        self.inner.record_audio_device_discovery(reason, meta);
    }
}

struct Harness {
    supervisor: PipelineSupervisor,
    launcher: Arc<MockLauncher>,
    bus: Arc<RecordingBus>,
    metrics: Arc<OrderedMetrics>,
}

fn harness(config: ChannelConfig, launcher: Arc<MockLauncher>) -> Harness {
    let bus = Arc::new(RecordingBus::default());
    let metrics = Arc::new(OrderedMetrics {
        inner: MetricsRegistry::new(),
        log: Arc::clone(&bus.log),
    });
    let deps = SupervisorDeps::new(bus.clone(), metrics.clone(), launcher.clone());
    let supervisor = PipelineSupervisor::new(config, deps).expect("config should be valid");
    Harness {
        supervisor,
        launcher,
        bus,
        metrics,
    }
}

/// Lets spawned tasks run without letting the paused clock auto-advance.
async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

async fn advance(ms: u64) {
    time::advance(Duration::from_millis(ms)).await;
    settle().await;
}

/// Audio channel over a pipe source: one candidate, deterministic delays.
fn pipe_audio_config() -> ChannelConfig {
    let mut config = ChannelConfig::audio("mic-0", "pipe:0");
    config.restart_jitter_factor = 0.0;
    config.random = RandomSource::fixed(0.5);
    config
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenarios
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn binary_missing_recovers_and_retries() {
    let launcher = MockLauncher::new(&[], Outcome::NotFound);
    let h = harness(pipe_audio_config(), launcher);

    h.supervisor.start();
    settle().await;

    // Both binaries (ffmpeg, avconv) missed for the single candidate.
    assert_eq!(h.launcher.launches(), 2);
    assert_eq!(h.bus.errors(), [RecoveryReason::BinaryMissing]);

    let recovers = h.bus.recovers();
    assert_eq!(recovers.len(), 1);
    assert_eq!(recovers[0].reason, RecoveryReason::BinaryMissing);
    assert_eq!(recovers[0].attempt, 1);
    assert_eq!(recovers[0].delay_ms, 3_000);
    assert_eq!(recovers[0].meta.applied_jitter_ms, 0);
    assert_eq!(h.supervisor.state(), PipelineState::Recovering);

    // The restart timer fires after exactly the reported delay and the
    // cross-product is probed again.
    advance(2_999).await;
    assert_eq!(h.launcher.launches(), 2);
    advance(1).await;
    assert_eq!(h.launcher.launches(), 4);

    h.supervisor.stop();
}

#[tokio::test(start_paused = true)]
async fn metric_is_recorded_exactly_once_before_each_recover() {
    let launcher = MockLauncher::new(&[], Outcome::NotFound);
    let h = harness(pipe_audio_config(), launcher);

    h.supervisor.start();
    settle().await;
    advance(3_000).await;

    let log = h.bus.log.lock().clone();
    let metric_positions: Vec<usize> = log
        .iter()
        .enumerate()
        .filter(|(_, entry)| entry.starts_with("metric:"))
        .map(|(i, _)| i)
        .collect();
    let recover_positions: Vec<usize> = log
        .iter()
        .enumerate()
        .filter(|(_, entry)| *entry == "event:recover")
        .map(|(i, _)| i)
        .collect();

    assert_eq!(metric_positions.len(), 2);
    assert_eq!(recover_positions.len(), 2);
    for (metric, recover) in metric_positions.iter().zip(&recover_positions) {
        assert!(metric < recover, "metric must precede its recover: {log:?}");
    }
    assert_eq!(
        h.metrics
            .inner
            .restarts_by_reason(ChannelKind::Audio, RecoveryReason::BinaryMissing),
        2
    );

    h.supervisor.stop();
}

#[tokio::test(start_paused = true)]
async fn misaligned_pipe_chunk_triggers_stream_error() {
    let launcher = MockLauncher::new(&[Outcome::Child], Outcome::NotFound);
    let h = harness(pipe_audio_config(), launcher);

    h.supervisor.start();
    settle().await;
    assert_eq!(h.supervisor.state(), PipelineState::Running);
    assert_eq!(h.bus.count("stream"), 1);

    // Three bytes cannot be whole 16-bit mono sample frames.
    let mut child = h.launcher.take_child(0);
    child.write(&[0x01, 0x02, 0x03]).await;
    settle().await;

    assert_eq!(h.bus.errors()[0], RecoveryReason::StreamError);
    let recovers = h.bus.recovers();
    assert_eq!(recovers[0].reason, RecoveryReason::StreamError);
    assert_eq!(
        h.metrics
            .inner
            .restarts_by_reason(ChannelKind::Audio, RecoveryReason::StreamError),
        1
    );
    assert!(child.was_terminated());

    h.supervisor.stop();
}

#[tokio::test(start_paused = true)]
async fn silence_circuit_breaker_latches_after_threshold() {
    let mut config = ChannelConfig::audio("mic-0", "mic");
    config.restart_jitter_factor = 0.0;
    config.random = RandomSource::fixed(0.5);
    config.restart_delay_ms = 100;
    config.restart_max_delay_ms = 100;
    // Trip after 3 silent frames of 100ms each.
    config.silence_duration_ms = 300;
    config.circuit_breaker_threshold = 3;
    // Skip the discovery probe; this test drives capture children only.
    config.device_discovery_timeout_ms = 0;

    let launcher = MockLauncher::new(&[], Outcome::Child);
    let h = harness(config, launcher);
    let silent_frame = vec![0u8; 3_200];

    h.supervisor.start();
    settle().await;

    for cycle in 0..3 {
        assert_eq!(h.launcher.launches(), cycle + 1, "cycle {cycle}");
        let mut child = h.launcher.take_child(cycle);
        for _ in 0..3 {
            child.write(&silent_frame).await;
            settle().await;
        }
        // Silence tripped: the child is torn down. Its exit cascades into a
        // process-exit recovery that preserves the breaker count.
        assert!(child.was_terminated(), "cycle {cycle}");
        settle().await;
        if cycle < 2 {
            advance(100).await;
        }
    }

    let fatals = h.bus.fatals();
    assert_eq!(fatals.len(), 1);
    assert_eq!(fatals[0].reason, "circuit-breaker");
    assert_eq!(fatals[0].channel, "mic-0");
    // 3 silence recoveries interleaved with 2 process-exit recoveries.
    assert_eq!(fatals[0].attempts, 5);
    assert_eq!(fatals[0].last_failure.reason, RecoveryReason::StreamSilence);
    assert_eq!(h.supervisor.state(), PipelineState::Broken);

    // A broken channel consumes no retries and spawns nothing.
    let launches_when_broken = h.launcher.launches();
    advance(60_000).await;
    assert_eq!(h.launcher.launches(), launches_when_broken);
    assert_eq!(h.bus.fatals().len(), 1);
    assert_eq!(h.launcher.max_live(), 1);

    h.supervisor.stop();
}

#[tokio::test(start_paused = true)]
async fn successful_byte_resets_the_attempt_counter() {
    let mut config = pipe_audio_config();
    config.restart_delay_ms = 200;
    config.restart_max_delay_ms = 200;
    config.idle_timeout_ms = 500;
    // Keep the watchdog out of the way so the idle window fires alone.
    config.watchdog_timeout_ms = Some(10_000);

    // Both binaries hit a busy device, then the retry succeeds.
    let launcher = MockLauncher::new(&[Outcome::Busy, Outcome::Busy, Outcome::Child], Outcome::NotFound);
    let h = harness(config, launcher);

    h.supervisor.start();
    settle().await;

    let recovers = h.bus.recovers();
    assert_eq!(recovers[0].reason, RecoveryReason::SpawnError);
    assert_eq!(recovers[0].attempt, 1);

    advance(200).await;
    assert_eq!(h.supervisor.state(), PipelineState::Running);

    // One aligned sample frame: enough bytes to reset the attempt counter.
    let mut child = h.launcher.take_child(0);
    child.write(&[0u8; 2]).await;
    settle().await;

    // Nothing further arrives, so the idle window elapses.
    advance(500).await;

    let recovers = h.bus.recovers();
    assert_eq!(recovers[1].reason, RecoveryReason::StreamIdle);
    assert_eq!(
        recovers[1].attempt, 1,
        "attempt must restart from the successful byte, not continue at 2+"
    );

    h.supervisor.stop();
}

#[tokio::test(start_paused = true)]
async fn graceful_stop_terminates_without_sigkill() {
    let launcher = MockLauncher::new(&[Outcome::Child], Outcome::NotFound);
    let h = harness(pipe_audio_config(), launcher);

    h.supervisor.start();
    settle().await;
    assert_eq!(h.supervisor.state(), PipelineState::Running);

    h.supervisor.stop();
    settle().await;

    let child = h.launcher.take_child(0);
    assert!(child.was_terminated());
    assert!(!child.was_killed());
    assert_eq!(h.supervisor.state(), PipelineState::Idle);

    // Stop is idempotent and never escalates a child that already exited.
    h.supervisor.stop();
    advance(10_000).await;
    assert!(!child.was_killed());
    assert_eq!(h.launcher.launches(), 1);
}

#[tokio::test(start_paused = true)]
async fn stop_during_recovering_cancels_the_pending_restart() {
    let launcher = MockLauncher::new(&[], Outcome::NotFound);
    let h = harness(pipe_audio_config(), launcher);

    h.supervisor.start();
    settle().await;
    assert_eq!(h.supervisor.state(), PipelineState::Recovering);
    assert_eq!(h.launcher.launches(), 2);

    h.supervisor.stop();
    advance(60_000).await;

    // No spawn ever happens after stop().
    assert_eq!(h.launcher.launches(), 2);
    assert_eq!(h.supervisor.state(), PipelineState::Idle);
}

#[tokio::test(start_paused = true)]
async fn device_discovery_timeout_recovers_and_spawns() {
    let mut config = ChannelConfig::audio("mic-0", "mic");
    config.restart_jitter_factor = 0.0;
    config.random = RandomSource::fixed(0.5);
    config.restart_delay_ms = 100;
    config.restart_max_delay_ms = 100;
    config.device_discovery_timeout_ms = 1_000;
    // A unique format keeps this test clear of the process-wide probe cache.
    config.input_format = Some("alsa-probe-hang".to_string());

    // First launch is the probe; its streams never close, so it hangs.
    let launcher = MockLauncher::new(&[Outcome::Child, Outcome::Child], Outcome::NotFound);
    let h = harness(config, launcher);

    h.supervisor.start();
    settle().await;
    assert_eq!(h.supervisor.state(), PipelineState::Preparing);
    assert_eq!(h.launcher.launches(), 1);
    let probe_spec = h.launcher.spec(0);
    assert!(probe_spec.args.contains(&"-list_devices".to_string()));

    advance(1_000).await;

    let recovers = h.bus.recovers();
    assert_eq!(recovers[0].reason, RecoveryReason::DeviceDiscoveryTimeout);
    assert_eq!(
        h.metrics.inner.device_discoveries("timeout"),
        1,
        "the timed-out probe must be recorded"
    );
    // The hung probe process was put down.
    let probe_child = h.launcher.take_child(0);
    assert!(probe_child.was_killed());

    // After the restart delay the capture spawn proceeds without re-probing.
    advance(100).await;
    assert_eq!(h.launcher.launches(), 2);
    assert_eq!(h.supervisor.state(), PipelineState::Running);
    let capture_spec = h.launcher.spec(1);
    assert!(!capture_spec.args.contains(&"-list_devices".to_string()));

    h.supervisor.stop();
}

#[tokio::test(start_paused = true)]
async fn child_exit_recovers_and_respawns_after_exit_gate() {
    let mut config = pipe_audio_config();
    config.restart_delay_ms = 300;
    config.restart_max_delay_ms = 300;

    let launcher = MockLauncher::new(&[Outcome::Child, Outcome::Child], Outcome::NotFound);
    let h = harness(config, launcher);

    h.supervisor.start();
    settle().await;

    let child = h.launcher.take_child(0);
    child.exit(Some(1));
    settle().await;

    assert_eq!(h.bus.count("close"), 1);
    let recovers = h.bus.recovers();
    assert_eq!(recovers[0].reason, RecoveryReason::ProcessExit);
    assert_eq!(recovers[0].attempt, 1);

    advance(300).await;
    assert_eq!(h.launcher.launches(), 2);
    assert_eq!(h.supervisor.state(), PipelineState::Running);
    assert_eq!(h.launcher.max_live(), 1);

    h.supervisor.stop();
}

#[tokio::test(start_paused = true)]
async fn audio_units_are_delivered_to_subscribers() {
    let launcher = MockLauncher::new(&[Outcome::Child], Outcome::NotFound);
    let h = harness(pipe_audio_config(), launcher);
    let mut units = h.supervisor.units();

    h.supervisor.start();
    settle().await;

    // One full 100ms frame of audible signal plus half a frame.
    let loud: Vec<u8> = 4_000i16
        .to_le_bytes()
        .iter()
        .copied()
        .cycle()
        .take(3_200 + 1_600)
        .collect();
    let mut child = h.launcher.take_child(0);
    child.write(&loud).await;
    settle().await;

    let delivered = h.bus.units();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].len(), 3_200);
    assert_eq!(units.try_recv().expect("unit broadcast").len(), 3_200);
    assert!(units.try_recv().is_err(), "the partial frame is retained");

    h.supervisor.stop();
}

#[tokio::test(start_paused = true)]
async fn video_units_are_complete_pngs() {
    let mut config = ChannelConfig::video("cam-0", "rtsp://cam.local/stream");
    config.restart_jitter_factor = 0.0;
    config.random = RandomSource::fixed(0.5);

    let launcher = MockLauncher::new(&[Outcome::Child], Outcome::NotFound);
    let h = harness(config, launcher);

    h.supervisor.start();
    settle().await;
    assert_eq!(h.supervisor.state(), PipelineState::Running);

    // A complete PNG split across writes, preceded by transcoder noise.
    let png = {
        let mut out = Vec::new();
        out.extend_from_slice(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]);
        for (chunk_type, data) in [(&b"IHDR"[..], &[0u8; 13][..]), (&b"IEND"[..], &[][..])] {
            out.extend_from_slice(&(data.len() as u32).to_be_bytes());
            out.extend_from_slice(chunk_type);
            out.extend_from_slice(data);
            out.extend_from_slice(&[0u8; 4]);
        }
        out
    };

    let mut child = h.launcher.take_child(0);
    child.write(b"noise before signature").await;
    settle().await;
    let (head, tail) = png.split_at(10);
    child.write(head).await;
    settle().await;
    child.write(tail).await;
    settle().await;

    let delivered = h.bus.units();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].as_ref(), png.as_slice());

    h.supervisor.stop();
}

#[tokio::test(start_paused = true)]
async fn start_is_idempotent_while_running() {
    let launcher = MockLauncher::new(&[Outcome::Child], Outcome::NotFound);
    let h = harness(pipe_audio_config(), launcher);

    h.supervisor.start();
    settle().await;
    h.supervisor.start();
    settle().await;

    assert_eq!(h.launcher.launches(), 1);
    assert_eq!(h.launcher.max_live(), 1);

    h.supervisor.stop();
}
