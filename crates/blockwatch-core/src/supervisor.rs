//! The supervisor: an isolated thread that turns stale heartbeats into
//! diagnostic events.
//!
//! ```text
//! Stopped ──start()──► Starting ──thread up──► Running
//!    ▲                                           │
//!    └──────────── Stopping ◄──────stop()────────┘
//! ```
//!
//! The loop runs on a dedicated OS thread (`blockwatch-supervisor`) driving
//! its own current-thread tokio runtime, so a blocked application runtime
//! can never starve it. Each tick evaluates every unit's staleness; units
//! entering a blocked episode are handed to the [`DetectionPipeline`] as
//! detached tasks the loop never awaits.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::capture::{CapturedStack, RegistryCapture, StackCapture};
use crate::config::{WatchdogConfig, duration_ms};
use crate::detector::{Breach, Detector};
use crate::emitter::{BoundedEmitter, EmitOutcome, ExitProcess, ProcessController};
use crate::error::{Error, Result, SupervisorError};
use crate::event::EventBuilder;
use crate::heartbeat::HeartbeatStore;
use crate::transport::{Envelope, JsonLinesTransport, Transport};
use crate::unit::UnitId;

/// Name of the supervisor's OS thread.
pub const SUPERVISOR_THREAD_NAME: &str = "blockwatch-supervisor";

/// Lifecycle state of a [`Supervisor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

/// Serializable snapshot of a supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogStatus {
    pub state: SupervisorState,
    /// Units in an open blocked episode, ascending.
    pub triggered: Vec<UnitId>,
    pub units: usize,
    pub emitted: u32,
    pub max_blocked_events: u32,
}

/// How one detection episode ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpisodeOutcome {
    Emitted(EmitOutcome),
    /// The blocked unit was absent from the capture.
    UnitMissing,
    /// The capture facility panicked.
    CaptureFailed,
}

/// Capture, build and emit for one breach.
#[derive(Clone)]
pub struct DetectionPipeline {
    config: Arc<WatchdogConfig>,
    store: Arc<HeartbeatStore>,
    capture: Arc<dyn StackCapture>,
    builder: EventBuilder,
    emitter: Arc<BoundedEmitter>,
}

impl std::fmt::Debug for DetectionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectionPipeline")
            .field("emitter", &self.emitter)
            .finish_non_exhaustive()
    }
}

impl DetectionPipeline {
    #[must_use]
    pub fn emitter(&self) -> &Arc<BoundedEmitter> {
        &self.emitter
    }

    /// Run one episode for `breach`.
    pub async fn run(&self, breach: Breach) -> EpisodeOutcome {
        let capture = Arc::clone(&self.capture);
        let captured: BTreeMap<UnitId, CapturedStack> =
            match tokio::task::spawn_blocking(move || capture.capture_stacks()).await {
                Ok(captured) => captured,
                Err(e) => {
                    warn!(
                        unit_id = %breach.unit,
                        error = %e,
                        "Stack capture failed; abandoning episode"
                    );
                    return EpisodeOutcome::CaptureFailed;
                }
            };

        let Some(primary) = captured.get(&breach.unit) else {
            info!(
                unit_id = %breach.unit,
                captured = captured.len(),
                "Blocked unit missing from capture; abandoning episode"
            );
            return EpisodeOutcome::UnitMissing;
        };

        let ambient = primary
            .ambient
            .clone()
            .or_else(|| self.store.ambient(breach.unit));
        if let Some(update) = ambient.as_deref().and_then(EventBuilder::session_transition) {
            self.send_session(breach.unit, update).await;
        }

        let Some(event) = self.builder.build(breach.unit, &captured, &self.store) else {
            return EpisodeOutcome::UnitMissing;
        };
        debug!(
            unit_id = %breach.unit,
            event_id = %event.event_id,
            threads = event.threads.len(),
            images = event.debug_meta.images.len(),
            "Diagnostic event assembled"
        );
        EpisodeOutcome::Emitted(self.emitter.emit(event).await)
    }

    async fn send_session(&self, unit: UnitId, session: crate::unit::Session) {
        let sid = session.sid;
        let timeout = self.config.session_send_timeout();
        let send = self.emitter.transport().send(Envelope::Session(session));
        match tokio::time::timeout(timeout, send).await {
            Ok(Ok(())) => debug!(unit_id = %unit, session_id = %sid, "Session marked abnormal"),
            Ok(Err(e)) => {
                warn!(
                    unit_id = %unit,
                    session_id = %sid,
                    error = %e,
                    "Failed to send session update"
                );
            }
            Err(_) => warn!(
                unit_id = %unit,
                session_id = %sid,
                timeout_ms = duration_ms(timeout),
                "Session update timed out"
            ),
        }
    }
}

/// State shared between the supervisor handle and its thread.
struct Core {
    config: Arc<WatchdogConfig>,
    store: Arc<HeartbeatStore>,
    detector: Mutex<Detector>,
    pipeline: DetectionPipeline,
}

impl Core {
    fn tick(&self) -> Vec<Breach> {
        let now = self.store.now();
        let snapshot = self.store.last_seen_all();
        let units = snapshot.len();
        let mut detector = self.detector.lock();
        let breaches = detector.evaluate(now, snapshot);

        if self.config.debug {
            debug!(
                now_ms = duration_ms(now),
                units,
                triggered = ?detector.triggered(),
                "Supervisor tick"
            );
        }
        drop(detector);

        for breach in &breaches {
            warn!(
                unit_id = %breach.unit,
                staleness_ms = duration_ms(breach.staleness),
                threshold_ms = self.config.blocked_threshold_ms,
                "Unit blocked"
            );
        }
        breaches
    }

    async fn run_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let period = self.config.poll_interval();
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            threshold_ms = self.config.blocked_threshold_ms,
            poll_interval_ms = duration_ms(period),
            "Supervisor loop started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    for breach in self.tick() {
                        let pipeline = self.pipeline.clone();
                        tokio::spawn(async move {
                            let outcome = pipeline.run(breach).await;
                            debug!(unit_id = %breach.unit, ?outcome, "Detection episode finished");
                        });
                    }
                }
                _ = shutdown.changed() => {
                    debug!("Supervisor loop stopping");
                    break;
                }
            }
        }
    }
}

struct LoopThread {
    shutdown: watch::Sender<bool>,
    thread: JoinHandle<()>,
}

/// Builder for [`Supervisor`].
pub struct SupervisorBuilder {
    config: WatchdogConfig,
    store: Arc<HeartbeatStore>,
    capture: Option<Arc<dyn StackCapture>>,
    transport: Option<Arc<dyn Transport>>,
    exit: Option<Arc<dyn ProcessController>>,
}

impl SupervisorBuilder {
    /// Stack-capture facility. Defaults to [`RegistryCapture`].
    #[must_use]
    pub fn capture(mut self, capture: Arc<dyn StackCapture>) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Delivery transport. Defaults to JSON lines on stderr.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Exit policy. Defaults to [`ExitProcess`] with `config.exit_code`.
    #[must_use]
    pub fn process_controller(mut self, exit: Arc<dyn ProcessController>) -> Self {
        self.exit = Some(exit);
        self
    }

    /// Validate the configuration and assemble the supervisor (stopped).
    pub fn build(self) -> Result<Supervisor> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let capture: Arc<dyn StackCapture> = match self.capture {
            Some(capture) => capture,
            None => Arc::new(RegistryCapture::new(Arc::clone(&self.store))),
        };
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(JsonLinesTransport::stderr()),
        };
        let exit: Arc<dyn ProcessController> = match self.exit {
            Some(exit) => exit,
            None => Arc::new(ExitProcess::new(config.exit_code)),
        };

        let emitter = Arc::new(BoundedEmitter::new(&config, transport, exit));
        let pipeline = DetectionPipeline {
            config: Arc::clone(&config),
            store: Arc::clone(&self.store),
            capture,
            builder: EventBuilder::new(Arc::clone(&config)),
            emitter,
        };

        Ok(Supervisor {
            core: Arc::new(Core {
                detector: Mutex::new(Detector::new(config.blocked_threshold())),
                config,
                store: self.store,
                pipeline,
            }),
            state: Arc::new(Mutex::new(SupervisorState::Stopped)),
            control: Mutex::new(None),
        })
    }
}

/// Watches every unit of a [`HeartbeatStore`] from an isolated thread.
pub struct Supervisor {
    core: Arc<Core>,
    state: Arc<Mutex<SupervisorState>>,
    control: Mutex<Option<LoopThread>>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("state", &self.state())
            .field("config", &self.core.config)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    pub fn builder(config: WatchdogConfig, store: Arc<HeartbeatStore>) -> SupervisorBuilder {
        SupervisorBuilder {
            config,
            store,
            capture: None,
            transport: None,
            exit: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &WatchdogConfig {
        &self.core.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<HeartbeatStore> {
        &self.core.store
    }

    #[must_use]
    pub fn pipeline(&self) -> &DetectionPipeline {
        &self.core.pipeline
    }

    #[must_use]
    pub fn state(&self) -> SupervisorState {
        *self.state.lock()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == SupervisorState::Running
    }

    /// Units currently in a blocked episode, ascending.
    #[must_use]
    pub fn triggered(&self) -> Vec<UnitId> {
        self.core.detector.lock().triggered().iter().copied().collect()
    }

    /// Events emitted so far.
    #[must_use]
    pub fn emitted(&self) -> u32 {
        self.core.pipeline.emitter.emitted()
    }

    #[must_use]
    pub fn status(&self) -> WatchdogStatus {
        WatchdogStatus {
            state: self.state(),
            triggered: self.triggered(),
            units: self.core.store.len(),
            emitted: self.emitted(),
            max_blocked_events: self.core.config.max_blocked_events,
        }
    }

    /// Run one evaluation on the caller's thread.
    ///
    /// Returns the units that entered a blocked episode. Nothing is
    /// dispatched; pass the breaches to [`DetectionPipeline::run`] to report
    /// them.
    pub fn check_now(&self) -> Vec<Breach> {
        self.core.tick()
    }

    /// Re-arm the detector and start the supervisor thread.
    ///
    /// No-op while starting or running.
    pub fn start(&self) -> Result<()> {
        let mut control = self.control.lock();
        {
            let mut state = self.state.lock();
            if matches!(*state, SupervisorState::Starting | SupervisorState::Running) {
                return Ok(());
            }
            *state = SupervisorState::Starting;
        }

        if let Some(previous) = control.take() {
            // Left behind by a loop that panicked.
            let _ = previous.thread.join();
        }

        self.core.detector.lock().arm(self.core.store.now());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = mpsc::sync_channel::<std::io::Result<()>>(1);
        let core = Arc::clone(&self.core);
        let state = Arc::clone(&self.state);

        let spawned = std::thread::Builder::new()
            .name(SUPERVISOR_THREAD_NAME.to_string())
            .spawn(move || run_thread(&core, &state, shutdown_rx, &ready_tx));

        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => return Err(self.start_failed(SupervisorError::ThreadSpawn(e))),
        };

        let startup = match ready_rx.recv() {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::other("supervisor thread exited during startup")),
        };
        if let Err(e) = startup {
            let _ = thread.join();
            return Err(self.start_failed(SupervisorError::RuntimeBuild(e)));
        }

        {
            let mut state = self.state.lock();
            if *state == SupervisorState::Starting {
                *state = SupervisorState::Running;
            }
        }
        *control = Some(LoopThread {
            shutdown: shutdown_tx,
            thread,
        });
        info!(
            units = self.core.store.len(),
            threshold_ms = self.core.config.blocked_threshold_ms,
            "Supervisor started"
        );
        Ok(())
    }

    fn start_failed(&self, err: SupervisorError) -> Error {
        error!(
            error = %err,
            remediation = %err.remediation().summary,
            "Failed to start supervisor"
        );
        *self.state.lock() = SupervisorState::Stopped;
        err.into()
    }

    /// Stop the loop and join its thread. Safe from any thread, including
    /// the supervisor's own (which is then left to exit on its own).
    pub fn stop(&self) {
        let mut control = self.control.lock();
        {
            let mut state = self.state.lock();
            if *state == SupervisorState::Stopped && control.is_none() {
                return;
            }
            *state = SupervisorState::Stopping;
        }

        if let Some(running) = control.take() {
            let _ = running.shutdown.send(true);
            if std::thread::current().id() == running.thread.thread().id() {
                debug!("Supervisor stopped from its own thread; not joining");
            } else if running.thread.join().is_err() {
                warn!("Supervisor thread panicked while stopping");
            }
        }

        *self.state.lock() = SupervisorState::Stopped;
        info!("Supervisor stopped");
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_thread(
    core: &Core,
    state: &Mutex<SupervisorState>,
    shutdown: watch::Receiver<bool>,
    ready: &mpsc::SyncSender<std::io::Result<()>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    let result =
        std::panic::catch_unwind(AssertUnwindSafe(|| runtime.block_on(core.run_loop(shutdown))));
    runtime.shutdown_background();

    if let Err(payload) = result {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!(panic = %message, "Supervisor thread panicked; detection stopped");
        *state.lock() = SupervisorState::Stopped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::error::TransportError;
    use async_trait::async_trait;
    use std::time::Duration;

    #[derive(Default)]
    struct NullTransport {
        sent: Mutex<Vec<Envelope>>,
    }

    #[async_trait]
    impl Transport for NullTransport {
        async fn send(&self, envelope: Envelope) -> std::result::Result<(), TransportError> {
            self.sent.lock().push(envelope);
            Ok(())
        }

        async fn flush(&self, _timeout: Duration) -> std::result::Result<bool, TransportError> {
            Ok(true)
        }
    }

    #[derive(Default)]
    struct NoExit(Mutex<u32>);

    impl ProcessController for NoExit {
        fn schedule_exit(&self, _delay: Duration) {
            *self.0.lock() += 1;
        }
    }

    fn supervisor(clock: &Arc<ManualClock>) -> (Supervisor, Arc<NullTransport>) {
        let store = Arc::new(HeartbeatStore::new(Arc::clone(clock) as Arc<dyn Clock>));
        store.register(UnitId::MAIN, "main");
        let transport = Arc::new(NullTransport::default());
        let supervisor = Supervisor::builder(
            WatchdogConfig::with_threshold(Duration::from_millis(100)),
            store,
        )
        .transport(Arc::clone(&transport) as Arc<dyn Transport>)
        .process_controller(Arc::new(NoExit::default()))
        .build()
        .unwrap();
        (supervisor, transport)
    }

    #[test]
    fn builder_rejects_invalid_config() {
        let store = Arc::new(HeartbeatStore::default());
        let config = WatchdogConfig {
            poll_ratio: 1,
            ..WatchdogConfig::default()
        };
        let err = Supervisor::builder(config, store).build().unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let clock = Arc::new(ManualClock::new());
        let (supervisor, _transport) = supervisor(&clock);
        assert_eq!(supervisor.state(), SupervisorState::Stopped);

        supervisor.start().unwrap();
        supervisor.start().unwrap();
        assert!(supervisor.is_running());

        supervisor.stop();
        supervisor.stop();
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    #[test]
    fn check_now_reports_breach_once() {
        let clock = Arc::new(ManualClock::new());
        let (supervisor, _transport) = supervisor(&clock);

        clock.advance(Duration::from_millis(100));
        assert!(supervisor.check_now().is_empty());
        clock.advance(Duration::from_millis(20));
        let breaches = supervisor.check_now();
        assert_eq!(breaches.len(), 1);
        assert_eq!(breaches[0].unit, UnitId::MAIN);
        assert!(supervisor.check_now().is_empty());
        assert_eq!(supervisor.triggered(), vec![UnitId::MAIN]);
    }

    #[test]
    fn restart_rearms_detector() {
        let clock = Arc::new(ManualClock::new());
        let (supervisor, _transport) = supervisor(&clock);
        clock.advance(Duration::from_millis(500));
        supervisor.start().unwrap();
        assert!(supervisor.check_now().is_empty());
        supervisor.stop();
    }

    #[tokio::test]
    async fn pipeline_sends_session_before_event() {
        let clock = Arc::new(ManualClock::new());
        let (supervisor, transport) = supervisor(&clock);
        let handle = supervisor.store().register(UnitId::MAIN, "main");
        handle.publish(Arc::new(
            crate::unit::AmbientState::default().with_session(crate::unit::Session::new()),
        ));

        clock.advance(Duration::from_millis(150));
        let breach = supervisor.check_now().remove(0);
        let outcome = supervisor.pipeline().run(breach).await;
        assert!(matches!(outcome, EpisodeOutcome::Emitted(EmitOutcome::Sent { .. })));

        let sent = transport.sent.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].kind(), "session");
        assert_eq!(sent[1].kind(), "event");
        assert_eq!(supervisor.emitted(), 1);
    }

    /// Clock that panics once armed, taking down whichever thread reads it.
    #[derive(Debug, Default)]
    struct FaultyClock {
        inner: ManualClock,
        fail: std::sync::atomic::AtomicBool,
    }

    impl Clock for FaultyClock {
        fn now(&self) -> Duration {
            assert!(
                !self.fail.load(std::sync::atomic::Ordering::SeqCst),
                "clock fault"
            );
            self.inner.now()
        }
    }

    fn wait_for_state(supervisor: &Supervisor, want: SupervisorState) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while std::time::Instant::now() < deadline {
            if supervisor.state() == want {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn loop_panic_stops_supervisor_without_restart() {
        let clock = Arc::new(FaultyClock::default());
        let store = Arc::new(HeartbeatStore::new(Arc::clone(&clock) as Arc<dyn Clock>));
        store.register(UnitId::MAIN, "main");
        let supervisor = Supervisor::builder(
            WatchdogConfig::with_threshold(Duration::from_millis(100)),
            store,
        )
        .transport(Arc::new(NullTransport::default()))
        .process_controller(Arc::new(NoExit::default()))
        .build()
        .unwrap();

        supervisor.start().unwrap();
        clock.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(wait_for_state(&supervisor, SupervisorState::Stopped));

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
        assert!(!supervisor.is_running());

        clock.fail.store(false, std::sync::atomic::Ordering::SeqCst);
        supervisor.start().unwrap();
        assert!(supervisor.is_running());
        supervisor.stop();
    }

    #[test]
    fn status_serializes() {
        let clock = Arc::new(ManualClock::new());
        let (supervisor, _transport) = supervisor(&clock);
        let status = supervisor.status();
        assert_eq!(status.units, 1);
        assert_eq!(status.max_blocked_events, 1);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "stopped");
    }
}
