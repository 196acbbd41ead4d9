//! Per-channel capture pipeline supervisor.
//!
//! Responsibilities:
//! - Own the transcoder child process and its output streams
//! - Reframe stdout bytes into sensor units and fan them out to detectors
//! - Detect every field failure mode (missing binary, device busy, stalls,
//!   silent microphones, transport errors, corrupt frames, slow startup)
//! - Run the recovery policy: backoff with jitter, fallback-ladder rotation,
//!   and the circuit breaker that latches persistently unhealthy channels
//!
//! The state machine is single-owner: one actor task per channel dispatches
//! timer fires, child messages and cancellation through one `select!` loop,
//! so every observable event for a channel is totally ordered.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::config::{ChannelConfig, ChannelKind};
use crate::error::{ProbeError, RecoveryReason};
use crate::events::{BackoffMeta, ChannelEvent, EventBus, FatalEvent, RawStreamHandle, RecoverEvent};
use crate::metrics::{CaptureMetrics, DiscoveryMeta, RestartMeta};

use super::backoff::BackoffPolicy;
use super::command::build_spec;
use super::devices::{cached_devices, probe_devices};
use super::frame::UnitAssembler;
use super::ladder::{platform_defaults, FallbackLadder, LadderMemory};
use super::process::{ChildControl, ExitGate, ExitNotice, LaunchedChild, ProcessLauncher, SystemLauncher};
use super::silence::{SilenceMonitor, SilenceVerdict};
use super::timers::{TimerBundle, TimerFired, TimerKind};

/// Capacity of the framed-unit broadcast channel.
const UNIT_CHANNEL_CAPACITY: usize = 256;
/// Capacity of the per-attach raw byte broadcast channel.
const RAW_CHANNEL_CAPACITY: usize = 64;
/// Read size for the stdout pump.
const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Lifecycle states of one capture pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    /// Never started, or fully stopped.
    Idle,
    /// Running the optional device-discovery probe.
    Preparing,
    /// Iterating binaries x candidates to obtain a running child.
    Spawning,
    /// Child attached, timers armed, bytes flowing.
    Running,
    /// A restart is scheduled; the old child is being torn down.
    Recovering,
    /// Circuit breaker latched; no further retries until `start()`.
    Broken,
}

impl PipelineState {
    /// Returns the state name for logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Preparing => "preparing",
            Self::Spawning => "spawning",
            Self::Running => "running",
            Self::Recovering => "recovering",
            Self::Broken => "broken",
        }
    }
}

/// Dependencies injected into each supervisor.
#[derive(Clone)]
pub struct SupervisorDeps {
    pub bus: Arc<dyn EventBus>,
    pub metrics: Arc<dyn CaptureMetrics>,
    pub launcher: Arc<dyn ProcessLauncher>,
}

impl SupervisorDeps {
    /// Creates dependencies with an explicit launcher.
    pub fn new(
        bus: Arc<dyn EventBus>,
        metrics: Arc<dyn CaptureMetrics>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        Self {
            bus,
            metrics,
            launcher,
        }
    }

    /// Creates dependencies backed by the real process launcher.
    pub fn system(bus: Arc<dyn EventBus>, metrics: Arc<dyn CaptureMetrics>) -> Self {
        Self::new(bus, metrics, Arc::new(SystemLauncher))
    }
}

/// Messages delivered to the supervisor task by its reader and probe tasks.
enum PipelineMsg {
    Chunk {
        generation: u64,
        data: Bytes,
    },
    StdoutClosed {
        generation: u64,
    },
    StreamFailed {
        generation: u64,
        message: String,
    },
    StderrLine {
        generation: u64,
        line: String,
    },
    Exited {
        generation: u64,
        notice: ExitNotice,
    },
    ProbeDone {
        cached: bool,
        result: Result<Arc<Vec<String>>, ProbeError>,
    },
}

struct ActiveRun {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Handle to one channel's capture pipeline.
///
/// `start()` and `stop()` are idempotent and synchronous from the caller's
/// perspective; all capture work happens on a dedicated actor task.
pub struct PipelineSupervisor {
    config: ChannelConfig,
    deps: SupervisorDeps,
    units_tx: broadcast::Sender<Bytes>,
    state_tx: Arc<watch::Sender<PipelineState>>,
    state_rx: watch::Receiver<PipelineState>,
    memory: Arc<LadderMemory>,
    /// Exit gate of the previous run's child, consumed by the next run so a
    /// device is never captured twice.
    parting_gate: Arc<Mutex<Option<ExitGate>>>,
    run: Mutex<Option<ActiveRun>>,
}

impl PipelineSupervisor {
    /// Creates a supervisor for one channel.
    ///
    /// # Errors
    ///
    /// Returns a message describing the first invalid configuration value.
    pub fn new(config: ChannelConfig, deps: SupervisorDeps) -> Result<Self, String> {
        config.validate()?;
        let (units_tx, _) = broadcast::channel(UNIT_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(PipelineState::Idle);
        Ok(Self {
            config,
            deps,
            units_tx,
            state_tx: Arc::new(state_tx),
            state_rx,
            memory: LadderMemory::new(),
            parting_gate: Arc::new(Mutex::new(None)),
            run: Mutex::new(None),
        })
    }

    /// The channel identity this supervisor manages.
    #[must_use]
    pub fn channel_id(&self) -> &str {
        &self.config.id
    }

    /// The channel kind this supervisor manages.
    #[must_use]
    pub fn kind(&self) -> ChannelKind {
        self.config.kind
    }

    /// Current pipeline state.
    #[must_use]
    pub fn state(&self) -> PipelineState {
        *self.state_rx.borrow()
    }

    /// Watch subscription over pipeline state transitions.
    #[must_use]
    pub fn state_watch(&self) -> watch::Receiver<PipelineState> {
        self.state_rx.clone()
    }

    /// Subscribes to the lazy sequence of framed sensor units.
    #[must_use]
    pub fn units(&self) -> broadcast::Receiver<Bytes> {
        self.units_tx.subscribe()
    }

    /// Starts the pipeline. No-op while already running; a broken pipeline
    /// is reset and restarted with a cleared circuit breaker.
    pub fn start(&self) {
        let mut run = self.run.lock();
        if let Some(active) = run.as_ref() {
            // An already-cancelled run is on its way out; replacing it is
            // safe because the next run waits on the parting exit gate.
            if !active.task.is_finished() && !active.token.is_cancelled() {
                if *self.state_rx.borrow() == PipelineState::Broken {
                    // start() after a circuit break re-arms the channel.
                    active.token.cancel();
                } else {
                    return;
                }
            }
        }
        let token = CancellationToken::new();
        let actor = Actor::new(
            self.config.clone(),
            self.deps.clone(),
            self.units_tx.clone(),
            Arc::clone(&self.state_tx),
            Arc::clone(&self.memory),
            Arc::clone(&self.parting_gate),
            token.clone(),
        );
        let task = tokio::spawn(actor.run());
        *run = Some(ActiveRun { token, task });
    }

    /// Stops the pipeline. Idempotent; the caller never waits on the child.
    ///
    /// The actor clears every timer, sends the child a graceful termination
    /// signal and leaves a detached force-kill backstop bounded by
    /// `force_kill_timeout_ms`.
    pub fn stop(&self) {
        let run = self.run.lock();
        if let Some(active) = run.as_ref() {
            active.token.cancel();
        }
        let _ = self.state_tx.send(PipelineState::Idle);
    }
}

/// Stream/timer bookkeeping for the currently attached child.
struct AttachedChild {
    generation: u64,
    control: Box<dyn ChildControl>,
    /// Held so the child's stdin pipe stays open until teardown.
    _stdin: Option<Box<dyn tokio::io::AsyncWrite + Send + Unpin>>,
    raw_tx: broadcast::Sender<Bytes>,
    reader_aborts: Vec<AbortHandle>,
}

/// A child that received its termination signal and is being awaited.
struct PartingChild {
    generation: u64,
    control: Box<dyn ChildControl>,
    reader_aborts: Vec<AbortHandle>,
}

/// The single-owner state machine task behind one [`PipelineSupervisor`].
struct Actor {
    config: ChannelConfig,
    deps: SupervisorDeps,
    units_tx: broadcast::Sender<Bytes>,
    state_tx: Arc<watch::Sender<PipelineState>>,
    token: CancellationToken,
    parting_gate: Arc<Mutex<Option<ExitGate>>>,
    os: String,

    timers: TimerBundle,
    timer_rx: mpsc::UnboundedReceiver<TimerFired>,
    msg_tx: mpsc::UnboundedSender<PipelineMsg>,
    msg_rx: mpsc::UnboundedReceiver<PipelineMsg>,

    state: PipelineState,
    ladder: FallbackLadder,
    backoff: BackoffPolicy,
    assembler: UnitAssembler,
    silence: Option<SilenceMonitor>,

    attempt: u32,
    circuit_failures: u32,
    has_received_chunk: bool,
    unit_confirmed: bool,
    fatal_emitted: bool,
    respawn_on_exit: bool,
    attach_generation: u64,

    child: Option<AttachedChild>,
    parting: Option<PartingChild>,
    probe_abort: Option<AbortHandle>,
}

impl Actor {
    fn new(
        config: ChannelConfig,
        deps: SupervisorDeps,
        units_tx: broadcast::Sender<Bytes>,
        state_tx: Arc<watch::Sender<PipelineState>>,
        memory: Arc<LadderMemory>,
        parting_gate: Arc<Mutex<Option<ExitGate>>>,
        token: CancellationToken,
    ) -> Self {
        let os = std::env::consts::OS.to_string();
        let (timers, timer_rx) = TimerBundle::new();
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let ladder = FallbackLadder::for_channel(&config, &os, memory);
        let backoff = BackoffPolicy::for_channel(&config);
        let assembler = UnitAssembler::for_channel(&config);
        let silence = (config.kind == ChannelKind::Audio)
            .then(|| SilenceMonitor::for_channel(&config));
        Self {
            config,
            deps,
            units_tx,
            state_tx,
            token,
            parting_gate,
            os,
            timers,
            timer_rx,
            msg_tx,
            msg_rx,
            state: PipelineState::Idle,
            ladder,
            backoff,
            assembler,
            silence,
            attempt: 0,
            circuit_failures: 0,
            has_received_chunk: false,
            unit_confirmed: false,
            fatal_emitted: false,
            respawn_on_exit: false,
            attach_generation: 0,
            child: None,
            parting: None,
            probe_abort: None,
        }
    }

    async fn run(mut self) {
        log::info!(
            "[Pipeline] {} starting ({})",
            self.config.id,
            self.config.kind
        );

        // A device is never captured twice: wait out the previous run's
        // child before the first spawn of this run.
        let previous = self.parting_gate.lock().take();
        if let Some(mut gate) = previous {
            tokio::select! {
                biased;
                () = self.token.cancelled() => {
                    self.shutdown();
                    return;
                }
                _ = gate.wait() => {}
            }
        }

        self.begin();
        loop {
            tokio::select! {
                biased;
                () = self.token.cancelled() => {
                    self.shutdown();
                    return;
                }
                Some(fired) = self.timer_rx.recv() => {
                    if self.timers.acknowledge(fired) {
                        self.on_timer(fired.kind);
                    }
                }
                Some(msg) = self.msg_rx.recv() => {
                    self.on_msg(msg);
                }
            }
        }
    }

    fn set_state(&mut self, state: PipelineState) {
        if self.state != state {
            log::debug!(
                "[Pipeline] {} {} -> {}",
                self.config.id,
                self.state.as_str(),
                state.as_str()
            );
            self.state = state;
            let _ = self.state_tx.send(state);
        }
    }

    fn emit(&self, event: ChannelEvent) {
        self.deps.bus.emit(&self.config.id, event);
    }

    fn child_generation(&self) -> Option<u64> {
        self.child.as_ref().map(|child| child.generation)
    }

    /// Entry transition out of Idle: probe first for microphone channels.
    fn begin(&mut self) {
        let probe_enabled = self.config.kind == ChannelKind::Audio
            && self.config.device_discovery_timeout_ms > 0
            && self.config.is_mic_input();
        if !probe_enabled {
            self.enter_spawning();
            return;
        }

        self.set_state(PipelineState::Preparing);
        let launcher = Arc::clone(&self.deps.launcher);
        let binary = self.ladder.current_binary().to_string();
        let os = self.os.clone();
        let format = self.probe_format();
        let timeout = Duration::from_millis(self.config.device_discovery_timeout_ms);
        let msg_tx = self.msg_tx.clone();
        let handle = tokio::spawn(async move {
            let cached = cached_devices(&os, &format).is_some();
            let result = probe_devices(launcher.as_ref(), &binary, &os, &format, timeout).await;
            let _ = msg_tx.send(PipelineMsg::ProbeDone { cached, result });
        });
        self.probe_abort = Some(handle.abort_handle());
    }

    fn probe_format(&self) -> String {
        self.config
            .input_format
            .clone()
            .or_else(|| platform_defaults(&self.os).map(|d| d.format.to_string()))
            .unwrap_or_else(|| "alsa".to_string())
    }

    fn on_probe_done(&mut self, cached: bool, result: Result<Arc<Vec<String>>, ProbeError>) {
        self.probe_abort = None;
        if self.state != PipelineState::Preparing {
            return;
        }
        let meta = DiscoveryMeta {
            channel: self.config.id.clone(),
            format: self.probe_format(),
            device_count: result.as_ref().ok().map(|devices| devices.len()),
        };
        match result {
            Ok(devices) => {
                let reason = if cached { "cached" } else { "probe" };
                self.deps.metrics.record_audio_device_discovery(reason, &meta);
                log::info!(
                    "[Pipeline] {} device discovery found {} device(s)",
                    self.config.id,
                    devices.len()
                );
                self.enter_spawning();
            }
            Err(ProbeError::Timeout(ms)) => {
                self.deps
                    .metrics
                    .record_audio_device_discovery("timeout", &meta);
                self.fault(
                    RecoveryReason::DeviceDiscoveryTimeout,
                    Some(format!("device probe timed out after {ms}ms")),
                );
            }
            Err(err) => {
                // The probe is advisory; a failed enumeration never blocks
                // capture.
                self.deps
                    .metrics
                    .record_audio_device_discovery("failed", &meta);
                log::warn!(
                    "[Pipeline] {} device discovery failed: {err}",
                    self.config.id
                );
                self.enter_spawning();
            }
        }
    }

    fn enter_spawning(&mut self) {
        self.set_state(PipelineState::Spawning);
        self.attempt_spawn();
    }

    /// Walks the binary x candidate cross-product until a spawn sticks.
    ///
    /// Not-found errors advance the binary list; any other spawn error fails
    /// over to the next candidate instead.
    fn attempt_spawn(&mut self) {
        let max_tries = self.ladder.binary_count() * self.ladder.candidate_count();
        let mut not_found_only = true;
        let mut last_error: Option<String> = None;
        for _ in 0..max_tries {
            let spec = build_spec(
                self.ladder.current_binary(),
                self.ladder.current_candidate(),
                &self.config,
            );
            log::debug!("[Pipeline] {} spawning: {}", self.config.id, spec.display_line());
            match self.deps.launcher.launch(&spec) {
                Ok(child) => {
                    self.attach(child);
                    return;
                }
                Err(err) if err.is_not_found() => {
                    log::warn!(
                        "[Pipeline] {} binary miss: {err}",
                        self.config.id
                    );
                    last_error = Some(err.to_string());
                    self.ladder.advance_binary();
                }
                Err(err) => {
                    log::warn!(
                        "[Pipeline] {} spawn failed on {}: {err}",
                        self.config.id,
                        self.ladder.current_candidate().label()
                    );
                    not_found_only = false;
                    last_error = Some(err.to_string());
                    self.ladder.advance_candidate();
                }
            }
        }
        let reason = if not_found_only {
            RecoveryReason::BinaryMissing
        } else {
            RecoveryReason::SpawnError
        };
        self.fault(reason, last_error);
    }

    /// Wires a freshly spawned child into the pipeline.
    fn attach(&mut self, launched: LaunchedChild) {
        self.attach_generation += 1;
        let generation = self.attach_generation;

        self.timers.clear_all();
        self.has_received_chunk = false;
        self.unit_confirmed = false;
        self.assembler.clear();
        if let Some(monitor) = &mut self.silence {
            monitor.rearm();
        }
        self.ladder.mark_binary_success();

        let raw_tx = broadcast::channel::<Bytes>(RAW_CHANNEL_CAPACITY).0;
        let mut reader_aborts = Vec::with_capacity(2);

        // stdout pump.
        let msg_tx = self.msg_tx.clone();
        let mut stdout = launched.stdout;
        reader_aborts.push(
            tokio::spawn(async move {
                let mut buf = BytesMut::with_capacity(READ_CHUNK_BYTES);
                loop {
                    buf.reserve(READ_CHUNK_BYTES);
                    match stdout.read_buf(&mut buf).await {
                        Ok(0) => {
                            let _ = msg_tx.send(PipelineMsg::StdoutClosed { generation });
                            break;
                        }
                        Ok(_) => {
                            let _ = msg_tx.send(PipelineMsg::Chunk {
                                generation,
                                data: buf.split().freeze(),
                            });
                        }
                        Err(err) => {
                            let _ = msg_tx.send(PipelineMsg::StreamFailed {
                                generation,
                                message: err.to_string(),
                            });
                            break;
                        }
                    }
                }
            })
            .abort_handle(),
        );

        // stderr pump: opaque diagnostics, forwarded line-wise.
        let msg_tx = self.msg_tx.clone();
        let stderr = launched.stderr;
        reader_aborts.push(
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = msg_tx.send(PipelineMsg::StderrLine { generation, line });
                }
            })
            .abort_handle(),
        );

        // Exit watcher: never aborted, the gate always resolves.
        let msg_tx = self.msg_tx.clone();
        let mut gate = launched.control.exit_gate();
        tokio::spawn(async move {
            let notice = gate.wait().await;
            let _ = msg_tx.send(PipelineMsg::Exited { generation, notice });
        });

        self.timers.reset(
            TimerKind::Start,
            Duration::from_millis(self.config.start_timeout_ms),
        );
        self.timers.reset(
            TimerKind::Idle,
            Duration::from_millis(self.config.idle_timeout_ms),
        );
        self.timers.reset(
            TimerKind::Watchdog,
            Duration::from_millis(self.config.effective_watchdog_timeout_ms()),
        );

        log::info!(
            "[Pipeline] {} attached: binary={}, candidate={}",
            self.config.id,
            self.ladder.current_binary(),
            self.ladder.current_candidate().label()
        );

        self.child = Some(AttachedChild {
            generation,
            control: launched.control,
            _stdin: launched.stdin,
            raw_tx: raw_tx.clone(),
            reader_aborts,
        });
        self.set_state(PipelineState::Running);
        self.emit(ChannelEvent::Stream(RawStreamHandle::new(raw_tx)));
    }

    fn on_msg(&mut self, msg: PipelineMsg) {
        match msg {
            PipelineMsg::Chunk { generation, data } => {
                if self.child_generation() == Some(generation) {
                    self.on_chunk(data);
                }
            }
            PipelineMsg::StdoutClosed { generation } => {
                if self.child_generation() == Some(generation) {
                    // The exit notice or the watchdog decides what happens
                    // next; a bare EOF is not itself a fault.
                    log::debug!("[Pipeline] {} stdout closed", self.config.id);
                }
            }
            PipelineMsg::StreamFailed { generation, message } => {
                if self.child_generation() == Some(generation) {
                    self.fault(RecoveryReason::StreamError, Some(message));
                }
            }
            PipelineMsg::StderrLine { generation, line } => {
                let current = self.child_generation() == Some(generation);
                let parting = self.parting.as_ref().map(|p| p.generation) == Some(generation);
                if current || parting {
                    self.emit(ChannelEvent::Stderr { line });
                }
            }
            PipelineMsg::Exited { generation, notice } => {
                self.on_exited(generation, notice);
            }
            PipelineMsg::ProbeDone { cached, result } => {
                self.on_probe_done(cached, result);
            }
        }
    }

    fn on_chunk(&mut self, data: Bytes) {
        if self.state != PipelineState::Running {
            return;
        }
        if !self.has_received_chunk {
            self.has_received_chunk = true;
            self.attempt = 0;
            log::debug!(
                "[Pipeline] {} first byte received; attempt counter reset",
                self.config.id
            );
        }
        self.timers.reset(
            TimerKind::Idle,
            Duration::from_millis(self.config.idle_timeout_ms),
        );
        self.timers.reset(
            TimerKind::Watchdog,
            Duration::from_millis(self.config.effective_watchdog_timeout_ms()),
        );
        if let Some(child) = &self.child {
            let _ = child.raw_tx.send(data.clone());
        }
        match self.assembler.push(&data) {
            Ok(units) => {
                for unit in units {
                    self.on_unit(unit);
                    if self.state != PipelineState::Running {
                        break;
                    }
                }
            }
            Err(err) => {
                let reason = err.recovery_reason();
                self.assembler.clear();
                self.fault(reason, Some(err.to_string()));
            }
        }
    }

    fn on_unit(&mut self, unit: Bytes) {
        self.timers.clear(TimerKind::Start);
        let verdict = self.silence.as_mut().map(|monitor| monitor.observe(&unit));
        self.emit(ChannelEvent::Data { unit: unit.clone() });
        let _ = self.units_tx.send(unit);
        match verdict {
            // Video: the first complete frame confirms the attach.
            None => {
                if !self.unit_confirmed {
                    self.unit_confirmed = true;
                    self.circuit_failures = 0;
                    self.ladder.mark_candidate_success();
                }
            }
            // Audio: only audible signal clears the breaker, so a silent
            // stream cannot launder its failure streak with full frames.
            Some(SilenceVerdict::Active) => {
                self.unit_confirmed = true;
                self.circuit_failures = 0;
                self.ladder.mark_candidate_success();
            }
            Some(SilenceVerdict::Silent) => {}
            Some(SilenceVerdict::Tripped) => {
                let window = self.config.silence_duration_ms;
                self.fault(
                    RecoveryReason::StreamSilence,
                    Some(format!("no audible signal for {window}ms")),
                );
            }
        }
    }

    fn on_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::Start => self.fault(
                RecoveryReason::StartTimeout,
                Some(format!(
                    "no unit within {}ms of attach",
                    self.config.start_timeout_ms
                )),
            ),
            TimerKind::Idle => self.fault(
                RecoveryReason::StreamIdle,
                Some(format!("no bytes for {}ms", self.config.idle_timeout_ms)),
            ),
            TimerKind::Watchdog => self.fault(
                RecoveryReason::WatchdogTimeout,
                Some(format!(
                    "no bytes for {}ms",
                    self.config.effective_watchdog_timeout_ms()
                )),
            ),
            TimerKind::Kill => {
                if let Some(parting) = &mut self.parting {
                    log::warn!(
                        "[Pipeline] {} graceful termination timed out; escalating",
                        self.config.id
                    );
                    parting.control.force_kill();
                }
            }
            TimerKind::Restart => self.on_restart_due(),
        }
    }

    /// The recovery decision: runs on every detected fault.
    fn fault(&mut self, reason: RecoveryReason, detail: Option<String>) {
        if matches!(self.state, PipelineState::Broken | PipelineState::Idle) {
            return;
        }
        let kind = self.config.kind;
        self.attempt += 1;
        if reason.counts_toward_breaker(kind) {
            self.circuit_failures += 1;
        } else if reason != RecoveryReason::ProcessExit {
            // A transient non-health failure clears the breaker context.
            // process-exit keeps whatever was recorded last: the exit that
            // follows a silence teardown must not reset the count.
            self.circuit_failures = 0;
        }
        log::warn!(
            "[Pipeline] {} fault: {} (attempt {}, breaker {}/{})",
            self.config.id,
            reason,
            self.attempt,
            self.circuit_failures,
            self.config.circuit_breaker_threshold
        );
        self.emit(ChannelEvent::Error {
            kind: reason,
            message: detail.clone().unwrap_or_else(|| reason.to_string()),
        });

        if reason.counts_toward_breaker(kind)
            && self.circuit_failures >= self.config.circuit_breaker_threshold
        {
            self.enter_broken(reason);
            return;
        }

        let delay = self.backoff.delay_for(self.attempt, &self.config.random);
        self.deps.metrics.record_pipeline_restart(
            kind,
            reason,
            &RestartMeta {
                channel: self.config.id.clone(),
                attempt: self.attempt,
                delay_ms: delay.delay_ms,
                base_delay_ms: delay.base_delay_ms,
                applied_jitter_ms: delay.applied_jitter_ms,
            },
        );
        self.ladder.rotate_for(reason);
        self.emit(ChannelEvent::Recover(RecoverEvent {
            reason,
            attempt: self.attempt,
            delay_ms: delay.delay_ms,
            meta: BackoffMeta {
                base_delay_ms: delay.base_delay_ms,
                min_delay_ms: self.backoff.min_delay_ms,
                max_delay_ms: self.backoff.max_delay_ms,
                applied_jitter_ms: delay.applied_jitter_ms,
            },
            error: detail,
        }));
        self.set_state(PipelineState::Recovering);
        self.timers.clear_all();
        self.begin_teardown();
        self.respawn_on_exit = false;
        self.timers.reset(
            TimerKind::Restart,
            Duration::from_millis(delay.delay_ms),
        );
    }

    /// Starts graceful termination of the attached child, if any.
    fn begin_teardown(&mut self) {
        if let Some(child) = self.child.take() {
            let AttachedChild {
                generation,
                mut control,
                _stdin,
                raw_tx: _,
                reader_aborts,
            } = child;
            control.terminate();
            self.timers.reset(
                TimerKind::Kill,
                Duration::from_millis(self.config.force_kill_timeout_ms),
            );
            self.parting = Some(PartingChild {
                generation,
                control,
                reader_aborts,
            });
        }
    }

    fn on_exited(&mut self, generation: u64, notice: ExitNotice) {
        // Live child died under us.
        if self.child_generation() == Some(generation) {
            if let Some(child) = self.child.take() {
                for handle in child.reader_aborts {
                    handle.abort();
                }
            }
            self.emit(ChannelEvent::Close {
                exit_code: notice.code,
            });
            self.fault(RecoveryReason::ProcessExit, Some(exit_detail(notice)));
            return;
        }

        // A child we were tearing down finished exiting.
        if self.parting.as_ref().map(|p| p.generation) == Some(generation) {
            if let Some(parting) = self.parting.take() {
                for handle in parting.reader_aborts {
                    handle.abort();
                }
            }
            self.timers.clear(TimerKind::Kill);
            self.emit(ChannelEvent::Close {
                exit_code: notice.code,
            });
            match self.state {
                PipelineState::Recovering if self.respawn_on_exit => {
                    // The restart delay already elapsed; the old child is
                    // now fully gone, so the next spawn may proceed.
                    self.respawn_on_exit = false;
                    self.enter_spawning();
                }
                PipelineState::Recovering => {
                    self.fault(RecoveryReason::ProcessExit, Some(exit_detail(notice)));
                }
                _ => {}
            }
        }
    }

    fn on_restart_due(&mut self) {
        if self.state != PipelineState::Recovering {
            return;
        }
        if self.parting.is_some() {
            // Old child still alive: spawn as soon as its exit lands, and
            // keep the escalation bounded while we wait.
            self.respawn_on_exit = true;
            if !self.timers.is_armed(TimerKind::Kill) {
                self.timers.reset(
                    TimerKind::Kill,
                    Duration::from_millis(self.config.force_kill_timeout_ms),
                );
            }
        } else {
            self.enter_spawning();
        }
    }

    fn enter_broken(&mut self, reason: RecoveryReason) {
        log::error!(
            "[Pipeline] {} circuit breaker tripped after {} attempt(s); channel broken",
            self.config.id,
            self.attempt
        );
        self.timers.clear_all();
        self.begin_teardown();
        if !self.fatal_emitted {
            self.fatal_emitted = true;
            self.emit(ChannelEvent::Fatal(FatalEvent::circuit_breaker(
                self.config.id.clone(),
                self.attempt,
                reason,
            )));
        }
        self.set_state(PipelineState::Broken);
    }

    /// Cancellation path: runs once when `stop()` cancels the token.
    fn shutdown(&mut self) {
        log::info!("[Pipeline] {} stopping", self.config.id);
        if let Some(handle) = self.probe_abort.take() {
            handle.abort();
        }
        self.timers.clear_all();
        let force_kill = Duration::from_millis(self.config.force_kill_timeout_ms);
        if let Some(child) = self.child.take() {
            let AttachedChild {
                mut control,
                reader_aborts,
                ..
            } = child;
            for handle in reader_aborts {
                handle.abort();
            }
            control.terminate();
            let gate = control.exit_gate();
            *self.parting_gate.lock() = Some(gate.clone());
            spawn_kill_backstop(control, gate, force_kill);
        } else if let Some(parting) = self.parting.take() {
            let PartingChild {
                control,
                reader_aborts,
                ..
            } = parting;
            for handle in reader_aborts {
                handle.abort();
            }
            let gate = control.exit_gate();
            *self.parting_gate.lock() = Some(gate.clone());
            spawn_kill_backstop(control, gate, force_kill);
        }
    }
}

/// Detached escalation: force-kill the child if it outlives the window.
fn spawn_kill_backstop(mut control: Box<dyn ChildControl>, mut gate: ExitGate, window: Duration) {
    tokio::spawn(async move {
        if tokio::time::timeout(window, gate.wait()).await.is_err() {
            control.force_kill();
            gate.wait().await;
        }
    });
}

fn exit_detail(notice: ExitNotice) -> String {
    match notice.code {
        Some(code) => format!("transcoder exited with code {code}"),
        None => "transcoder terminated by signal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventBus;
    use crate::metrics::NoopMetrics;

    fn deps() -> SupervisorDeps {
        SupervisorDeps::system(Arc::new(NoopEventBus), Arc::new(NoopMetrics))
    }

    #[test]
    fn state_names_are_stable() {
        assert_eq!(PipelineState::Idle.as_str(), "idle");
        assert_eq!(PipelineState::Preparing.as_str(), "preparing");
        assert_eq!(PipelineState::Recovering.as_str(), "recovering");
        assert_eq!(PipelineState::Broken.as_str(), "broken");
    }

    #[test]
    fn new_rejects_invalid_config() {
        let mut config = ChannelConfig::audio("mic-0", "mic");
        config.restart_jitter_factor = 2.0;
        assert!(PipelineSupervisor::new(config, deps()).is_err());
    }

    #[tokio::test]
    async fn fresh_supervisor_is_idle_and_stop_is_idempotent() {
        let config = ChannelConfig::audio("mic-0", "mic");
        let supervisor = PipelineSupervisor::new(config, deps()).unwrap();
        assert_eq!(supervisor.state(), PipelineState::Idle);
        supervisor.stop();
        supervisor.stop();
        assert_eq!(supervisor.state(), PipelineState::Idle);
    }

    #[test]
    fn exit_detail_distinguishes_signals() {
        assert_eq!(
            exit_detail(ExitNotice { code: Some(1) }),
            "transcoder exited with code 1"
        );
        assert_eq!(
            exit_detail(ExitNotice { code: None }),
            "transcoder terminated by signal"
        );
    }
}
