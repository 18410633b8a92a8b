//! Collectors: sample OS state on a fixed schedule, diff against the previous
//! snapshot, and push the resulting events onto the shared queue.
//!
//! Each collector is a [`ScheduledCollector`] wrapping a [`Scanner`]. The
//! scanner owns its snapshot and does the platform-neutral diffing; the OS
//! access sits behind the source traits in each submodule so it can be faked.

mod control;
mod network;
mod process;
mod registry;

pub use control::{
    descendants_first, ControlError, EnforcementAction, ProcessControlScanner, ProcessController,
    SystemController,
};
pub use network::{
    parse_proc_net_tcp, severity_for_port, ConnectionSource, NetworkConnectionScanner,
    SystemConnections, TcpConnection, TcpState,
};
pub use process::{ProcessActivityScanner, ProcessInfo, ProcessSource, SysinfoProcesses};
pub use registry::{
    diff_values, monitored_locations, Hive, RegistryChangeScanner, RegistryLocation,
    RegistryReader, SystemRegistry, ValueChange, ValueSnapshot,
};

use crate::config::{CollectorsConfig, ScanConfig};
use crate::event::SecurityEvent;
use crate::policy::PolicyStore;
use crate::queue::EventQueue;
use crate::shutdown::ShutdownSignal;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Placeholder for fields the agent lacks the privilege to read.
pub const ACCESS_DENIED: &str = "Access Denied";

const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
    #[error("failed to read {what}: {reason}")]
    Source { what: String, reason: String },
    #[error("scan task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectorKind {
    ProcessMonitor,
    NetworkMonitor,
    RegistryMonitor,
    ProcessControl,
}

impl CollectorKind {
    pub fn name(&self) -> &'static str {
        match self {
            CollectorKind::ProcessMonitor => "Process Monitor",
            CollectorKind::NetworkMonitor => "Network Monitor",
            CollectorKind::RegistryMonitor => "Registry Monitor",
            CollectorKind::ProcessControl => "Process Control",
        }
    }
}

/// Lifecycle every collector exposes to the orchestrator.
#[async_trait]
pub trait Collector: Send + Sync {
    fn name(&self) -> &'static str;

    fn kind(&self) -> CollectorKind;

    fn is_enabled(&self) -> bool;

    /// Schedules periodic scans until `shutdown` fires or [`stop`](Self::stop) is called.
    /// A disabled collector logs and returns without scheduling anything.
    async fn start(&self, shutdown: ShutdownSignal) -> Result<(), CollectorError>;

    /// Idempotent, bounded wait for the schedule to wind down.
    async fn stop(&self);
}

/// One snapshot-and-diff step. Implementations own their previous snapshot and
/// replace it wholesale at the end of each successful scan.
pub trait Scanner: Send + 'static {
    fn kind(&self) -> CollectorKind;

    /// Runs once on a blocking thread before the first scheduled scan.
    fn prime(&mut self) {}

    /// Whether the first scan fires at start or one interval later.
    fn scan_immediately(&self) -> bool {
        true
    }

    fn scan(&mut self) -> Result<Vec<SecurityEvent>, CollectorError>;
}

struct Running {
    stop: ShutdownSignal,
    handle: JoinHandle<()>,
}

/// Held from the moment `start` claims the collector, so a concurrent
/// `start` sees it as taken while `prime` is still in flight.
enum Slot {
    Starting,
    Running(Running),
}

/// Drives a [`Scanner`] on its own interval. Scans run on the blocking pool so
/// a slow OS query never holds up another collector or the delivery loop.
pub struct ScheduledCollector<S: Scanner> {
    kind: CollectorKind,
    settings: ScanConfig,
    scanner: Arc<Mutex<S>>,
    queue: Arc<EventQueue>,
    running: Mutex<Option<Slot>>,
    stop_timeout: Duration,
}

impl<S: Scanner> ScheduledCollector<S> {
    pub fn new(scanner: S, settings: ScanConfig, queue: Arc<EventQueue>) -> Self {
        Self {
            kind: scanner.kind(),
            settings,
            scanner: Arc::new(Mutex::new(scanner)),
            queue,
            running: Mutex::new(None),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn is_running(&self) -> bool {
        match self.running.lock().as_ref() {
            Some(Slot::Running(r)) => !r.handle.is_finished(),
            _ => false,
        }
    }
}

#[async_trait]
impl<S: Scanner> Collector for ScheduledCollector<S> {
    fn name(&self) -> &'static str {
        self.kind.name()
    }

    fn kind(&self) -> CollectorKind {
        self.kind
    }

    fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    async fn start(&self, shutdown: ShutdownSignal) -> Result<(), CollectorError> {
        let name = self.name();
        if !self.is_enabled() {
            info!(collector = name, "collector is disabled, skipping");
            return Ok(());
        }
        {
            let mut slot = self.running.lock();
            if slot.is_some() {
                debug!(collector = name, "collector already started");
                return Ok(());
            }
            *slot = Some(Slot::Starting);
        }

        info!(
            collector = name,
            interval_secs = self.settings.interval().as_secs(),
            "starting collector"
        );

        let scanner = Arc::clone(&self.scanner);
        let primed = tokio::task::spawn_blocking(move || {
            let mut s = scanner.lock();
            s.prime();
            s.scan_immediately()
        })
        .await;

        let mut slot = self.running.lock();
        if !matches!(*slot, Some(Slot::Starting)) {
            debug!(collector = name, "collector stopped while starting");
            return Ok(());
        }
        let immediate = match primed {
            Ok(immediate) => immediate,
            Err(e) => {
                *slot = None;
                return Err(CollectorError::Task(e.to_string()));
            }
        };

        let stop = ShutdownSignal::new();
        let handle = tokio::spawn(run_schedule(
            name,
            Arc::clone(&self.scanner),
            Arc::clone(&self.queue),
            self.settings.interval(),
            immediate,
            shutdown,
            stop.clone(),
        ));
        *slot = Some(Slot::Running(Running { stop, handle }));
        Ok(())
    }

    async fn stop(&self) {
        let running = match self.running.lock().take() {
            Some(Slot::Running(running)) => running,
            // A start still priming sees the empty slot and backs out.
            Some(Slot::Starting) | None => return,
        };
        info!(collector = self.name(), "stopping collector");
        running.stop.trigger();
        if tokio::time::timeout(self.stop_timeout, running.handle)
            .await
            .is_err()
        {
            warn!(
                collector = self.name(),
                timeout_secs = self.stop_timeout.as_secs(),
                "collector did not stop in time, detaching"
            );
        }
    }
}

async fn run_schedule<S: Scanner>(
    name: &'static str,
    scanner: Arc<Mutex<S>>,
    queue: Arc<EventQueue>,
    interval: Duration,
    immediate: bool,
    shutdown: ShutdownSignal,
    stop: ShutdownSignal,
) {
    let first = if immediate {
        Instant::now()
    } else {
        Instant::now() + interval
    };
    let mut ticker = tokio::time::interval_at(first, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let s = Arc::clone(&scanner);
        match tokio::task::spawn_blocking(move || s.lock().scan()).await {
            Ok(Ok(events)) => {
                if !events.is_empty() {
                    debug!(collector = name, count = events.len(), "scan produced events");
                    queue.enqueue_all(events);
                }
            }
            Ok(Err(e)) => warn!(collector = name, error = %e, "scan failed"),
            Err(e) => error!(collector = name, error = %e, "scan task panicked"),
        }
    }
    info!(collector = name, "collector stopped");
}

/// The four collectors wired to this host's OS backends.
pub fn build_default(
    config: &CollectorsConfig,
    queue: &Arc<EventQueue>,
    policy: &Arc<PolicyStore>,
) -> Vec<Box<dyn Collector>> {
    vec![
        Box::new(ScheduledCollector::new(
            ProcessActivityScanner::new(SysinfoProcesses::new()),
            config.process_monitor.clone(),
            Arc::clone(queue),
        )),
        Box::new(ScheduledCollector::new(
            NetworkConnectionScanner::new(SystemConnections),
            config.network_monitor.clone(),
            Arc::clone(queue),
        )),
        Box::new(ScheduledCollector::new(
            RegistryChangeScanner::new(SystemRegistry, Arc::clone(policy)),
            config.registry_monitor.clone(),
            Arc::clone(queue),
        )),
        Box::new(ScheduledCollector::new(
            ProcessControlScanner::new(
                SysinfoProcesses::new(),
                SystemController::new(),
                Arc::clone(policy),
                &config.process_control.action,
            ),
            config.process_control.scan(),
            Arc::clone(queue),
        )),
    ]
}
