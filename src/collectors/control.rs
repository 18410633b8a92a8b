//! Policy enforcement against blacklisted processes: kill, suspend or alert.

use super::process::{is_thread, ProcessInfo, ProcessSource};
use super::{CollectorError, CollectorKind, Scanner, ACCESS_DENIED};
use crate::event::{SecurityEvent, Severity};
use crate::policy::PolicyStore;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use sysinfo::{Pid, System};
use thiserror::Error;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnforcementAction {
    Kill,
    Suspend,
    Alert,
}

impl EnforcementAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnforcementAction::Kill => "kill",
            EnforcementAction::Suspend => "suspend",
            EnforcementAction::Alert => "alert",
        }
    }
}

impl fmt::Display for EnforcementAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnforcementAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "kill" => Ok(EnforcementAction::Kill),
            "suspend" => Ok(EnforcementAction::Suspend),
            "alert" => Ok(EnforcementAction::Alert),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ControlError {
    /// The process exited between detection and enforcement.
    #[error("process {0} not found")]
    NotFound(u32),
    #[error("permission denied for process {0}")]
    PermissionDenied(u32),
    #[error("failed to act on process {pid}: {reason}")]
    Failed { pid: u32, reason: String },
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
}

/// Destructive process operations.
pub trait ProcessController: Send + 'static {
    /// Terminates `pid` and all of its descendants.
    fn kill_tree(&mut self, pid: u32) -> Result<(), ControlError>;
    /// Suspends every thread of `pid`.
    fn suspend(&mut self, pid: u32) -> Result<(), ControlError>;
}

/// Orders the descendants of `root` so that children come before their parents.
/// `root` itself is not included.
pub fn descendants_first(
    root: u32,
    parents: impl IntoIterator<Item = (u32, Option<u32>)>,
) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (pid, parent) in parents {
        if let Some(parent) = parent {
            if parent != pid {
                children.entry(parent).or_default().push(pid);
            }
        }
    }

    let mut order = Vec::new();
    let mut visited = HashSet::from([root]);
    let mut stack = vec![(root, false)];
    while let Some((pid, expanded)) = stack.pop() {
        if expanded {
            if pid != root {
                order.push(pid);
            }
            continue;
        }
        stack.push((pid, true));
        if let Some(kids) = children.get(&pid) {
            for &kid in kids {
                if visited.insert(kid) {
                    stack.push((kid, false));
                }
            }
        }
    }
    order
}

pub struct SystemController {
    sys: System,
}

impl SystemController {
    pub fn new() -> Self {
        Self { sys: System::new() }
    }
}

impl Default for SystemController {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessController for SystemController {
    fn kill_tree(&mut self, pid: u32) -> Result<(), ControlError> {
        self.sys.refresh_processes();
        let root = Pid::from_u32(pid);
        if self.sys.process(root).is_none() {
            return Err(ControlError::NotFound(pid));
        }

        let tree = descendants_first(
            pid,
            self.sys
                .processes()
                .iter()
                .filter(|(_, proc_)| !is_thread(proc_))
                .map(|(p, proc_)| (p.as_u32(), proc_.parent().map(|pp| pp.as_u32()))),
        );
        for child in tree {
            if let Some(proc_) = self.sys.process(Pid::from_u32(child)) {
                if !proc_.kill() {
                    debug!(pid = child, parent = pid, "failed to kill child process");
                }
            }
        }

        let killed = match self.sys.process(root) {
            Some(proc_) => proc_.kill(),
            None => return Err(ControlError::NotFound(pid)),
        };
        if killed {
            Ok(())
        } else if !self.sys.refresh_process(root) {
            Err(ControlError::NotFound(pid))
        } else {
            Err(ControlError::Failed {
                pid,
                reason: "kill signal was rejected".to_string(),
            })
        }
    }

    fn suspend(&mut self, pid: u32) -> Result<(), ControlError> {
        suspend_pid(pid)
    }
}

#[cfg(unix)]
fn suspend_pid(pid: u32) -> Result<(), ControlError> {
    let raw = match libc::pid_t::try_from(pid) {
        Ok(raw) if raw > 0 => raw,
        _ => return Err(ControlError::NotFound(pid)),
    };
    // SAFETY: kill(2) takes plain integers; a positive pid targets exactly one process.
    if unsafe { libc::kill(raw, libc::SIGSTOP) } == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => Err(ControlError::NotFound(pid)),
        Some(libc::EPERM) => Err(ControlError::PermissionDenied(pid)),
        _ => Err(ControlError::Failed {
            pid,
            reason: err.to_string(),
        }),
    }
}

#[cfg(windows)]
fn suspend_pid(pid: u32) -> Result<(), ControlError> {
    use windows::Win32::Foundation::{CloseHandle, FALSE};
    use windows::Win32::System::Diagnostics::ToolHelp::{
        CreateToolhelp32Snapshot, Thread32First, Thread32Next, TH32CS_SNAPTHREAD, THREADENTRY32,
    };
    use windows::Win32::System::Threading::{OpenThread, SuspendThread, THREAD_SUSPEND_RESUME};

    let mut owned = 0usize;
    let mut suspended = 0usize;
    // SAFETY: every handle opened here is closed before returning, and the
    // entry struct is initialized with its own size as Toolhelp requires.
    unsafe {
        let snapshot =
            CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0).map_err(|e| ControlError::Failed {
                pid,
                reason: e.to_string(),
            })?;
        let mut entry = THREADENTRY32 {
            dwSize: std::mem::size_of::<THREADENTRY32>() as u32,
            ..Default::default()
        };
        let mut more = Thread32First(snapshot, &mut entry).is_ok();
        while more {
            if entry.th32OwnerProcessID == pid {
                owned += 1;
                if let Ok(thread) = OpenThread(THREAD_SUSPEND_RESUME, FALSE, entry.th32ThreadID) {
                    if SuspendThread(thread) != u32::MAX {
                        suspended += 1;
                    }
                    let _ = CloseHandle(thread);
                }
            }
            more = Thread32Next(snapshot, &mut entry).is_ok();
        }
        let _ = CloseHandle(snapshot);
    }

    match (owned, suspended) {
        (0, _) => Err(ControlError::NotFound(pid)),
        (_, 0) => Err(ControlError::PermissionDenied(pid)),
        _ => Ok(()),
    }
}

#[cfg(not(any(unix, windows)))]
fn suspend_pid(_pid: u32) -> Result<(), ControlError> {
    Err(ControlError::Unsupported("process suspension"))
}

/// Scans for blacklisted process names and applies the configured action.
///
/// A PID is acted on once: it is remembered after a successful kill, suspend
/// or alert, and forgotten when it no longer appears in the listing.
pub struct ProcessControlScanner<S, C> {
    source: S,
    controller: C,
    policy: Arc<PolicyStore>,
    action: Result<EnforcementAction, String>,
    handled: HashSet<u32>,
}

impl<S: ProcessSource, C: ProcessController> ProcessControlScanner<S, C> {
    pub fn new(source: S, controller: C, policy: Arc<PolicyStore>, action: &str) -> Self {
        Self {
            source,
            controller,
            policy,
            action: action.parse(),
            handled: HashSet::new(),
        }
    }

    pub fn handled(&self) -> &HashSet<u32> {
        &self.handled
    }

    fn enforce(&mut self, action: EnforcementAction, info: &ProcessInfo) -> Option<SecurityEvent> {
        let pid = info.pid;
        let result = match action {
            EnforcementAction::Kill => self.controller.kill_tree(pid),
            EnforcementAction::Suspend => self.controller.suspend(pid),
            EnforcementAction::Alert => Ok(()),
        };

        match result {
            Ok(()) => {}
            Err(ControlError::NotFound(_)) => {
                debug!(pid, process = %info.name, "process exited before enforcement");
                return None;
            }
            Err(e) => {
                error!(pid, process = %info.name, action = %action, error = %e, "enforcement failed");
                return None;
            }
        }

        let (event_type, severity) = match action {
            EnforcementAction::Kill => {
                warn!(pid, process = %info.name, "killed blacklisted process");
                ("process_terminated_by_policy", Severity::High)
            }
            EnforcementAction::Suspend => {
                warn!(pid, process = %info.name, "suspended blacklisted process");
                ("process_suspended_by_policy", Severity::High)
            }
            EnforcementAction::Alert => {
                warn!(pid, process = %info.name, "alert: blacklisted process running");
                ("blacklisted_process_detected", Severity::Critical)
            }
        };

        let event = SecurityEvent::new(event_type, severity)
            .with_detail("action", action.as_str())
            .with_detail("process_name", info.name.clone())
            .with_detail("process_id", pid)
            .with_detail("reason", "blacklisted");
        Some(match action {
            EnforcementAction::Alert => event.with_detail(
                "executable_path",
                info.exe.clone().unwrap_or_else(|| ACCESS_DENIED.to_string()),
            ),
            _ => event,
        })
    }
}

impl<S: ProcessSource, C: ProcessController> Scanner for ProcessControlScanner<S, C> {
    fn kind(&self) -> CollectorKind {
        CollectorKind::ProcessControl
    }

    fn prime(&mut self) {
        match &self.action {
            Ok(EnforcementAction::Alert) => {
                warn!("process control is active, blacklisted processes will be reported")
            }
            Ok(action) => warn!(
                action = %action,
                "process control is active, blacklisted processes will be acted on"
            ),
            Err(unknown) => warn!(action = %unknown, "unknown enforcement action, detections will only be logged"),
        }
    }

    fn scan(&mut self) -> Result<Vec<SecurityEvent>, CollectorError> {
        let mut procs = self.source.processes()?;
        procs.sort_by_key(|p| p.pid);

        let live: HashSet<u32> = procs.iter().map(|p| p.pid).collect();
        self.handled.retain(|pid| live.contains(pid));

        let me = std::process::id();
        let mut events = Vec::new();
        for info in &procs {
            if info.pid == me
                || self.handled.contains(&info.pid)
                || !self.policy.is_process_blacklisted(&info.name)
            {
                continue;
            }
            warn!(pid = info.pid, process = %info.name, "blacklisted process detected");

            let action = match &self.action {
                Ok(action) => *action,
                Err(unknown) => {
                    warn!(action = %unknown, "unknown enforcement action");
                    continue;
                }
            };
            if let Some(event) = self.enforce(action, info) {
                self.handled.insert(info.pid);
                events.push(event);
            }
        }
        Ok(events)
    }
}
