//! Process start/stop tracking (cross-platform via sysinfo).

use super::{CollectorError, CollectorKind, Scanner, ACCESS_DENIED};
use crate::event::{SecurityEvent, Severity};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{BTreeMap, HashSet};
use sysinfo::{Pid, Process, System, ThreadKind};

/// One row of a process listing. Fields the OS refused to reveal are `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub parent_pid: Option<u32>,
    /// Image name without the `.exe` extension.
    pub name: String,
    pub start_time: Option<DateTime<Utc>>,
    pub exe: Option<String>,
    pub cmdline: Option<String>,
}

impl ProcessInfo {
    pub fn new(pid: u32, name: impl Into<String>) -> Self {
        Self {
            pid,
            parent_pid: None,
            name: name.into(),
            start_time: None,
            exe: None,
            cmdline: None,
        }
    }

    fn from_sysinfo(pid: Pid, proc_: &Process) -> Self {
        let name = strip_exe(proc_.name()).to_string();
        let cmd = proc_.cmd();
        Self {
            pid: pid.as_u32(),
            parent_pid: proc_.parent().map(|p| p.as_u32()),
            name,
            start_time: match proc_.start_time() {
                0 => None,
                secs => Utc.timestamp_opt(secs as i64, 0).single(),
            },
            exe: proc_.exe().map(|p| p.to_string_lossy().to_string()),
            cmdline: (!cmd.is_empty()).then(|| cmd.join(" ")),
        }
    }
}

/// Drops a trailing `.exe` in any case, keeping the stem's own casing.
fn strip_exe(name: &str) -> &str {
    match name.len().checked_sub(4).and_then(|at| name.get(at..).map(|ext| (at, ext))) {
        Some((at, ext)) if at > 0 && ext.eq_ignore_ascii_case(".exe") => &name[..at],
        _ => name,
    }
}

/// On Linux sysinfo lists every task of a process as its own entry.
pub(super) fn is_thread(proc_: &Process) -> bool {
    proc_.thread_kind() == Some(ThreadKind::Userland)
}

/// Where the process listing comes from.
pub trait ProcessSource: Send + 'static {
    fn processes(&mut self) -> Result<Vec<ProcessInfo>, CollectorError>;
}

pub struct SysinfoProcesses {
    sys: System,
}

impl SysinfoProcesses {
    pub fn new() -> Self {
        Self { sys: System::new() }
    }
}

impl Default for SysinfoProcesses {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSource for SysinfoProcesses {
    fn processes(&mut self) -> Result<Vec<ProcessInfo>, CollectorError> {
        self.sys.refresh_processes();
        Ok(self
            .sys
            .processes()
            .iter()
            .filter(|(_, p)| !is_thread(p))
            .map(|(pid, p)| ProcessInfo::from_sysinfo(*pid, p))
            .collect())
    }
}

/// Emits `process_started` for PIDs not seen last cycle and `process_terminated`
/// for PIDs that disappeared. The first cycle reports every running process.
pub struct ProcessActivityScanner<S> {
    source: S,
    tracked: HashSet<u32>,
}

impl<S: ProcessSource> ProcessActivityScanner<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            tracked: HashSet::new(),
        }
    }

    pub fn tracked(&self) -> &HashSet<u32> {
        &self.tracked
    }
}

impl<S: ProcessSource> Scanner for ProcessActivityScanner<S> {
    fn kind(&self) -> CollectorKind {
        CollectorKind::ProcessMonitor
    }

    fn scan(&mut self) -> Result<Vec<SecurityEvent>, CollectorError> {
        let current: BTreeMap<u32, ProcessInfo> = self
            .source
            .processes()?
            .into_iter()
            .map(|p| (p.pid, p))
            .collect();

        let mut events = Vec::new();
        for (pid, info) in &current {
            if !self.tracked.contains(pid) {
                events.push(started_event(info));
            }
        }

        let mut gone: Vec<u32> = self
            .tracked
            .iter()
            .filter(|pid| !current.contains_key(pid))
            .copied()
            .collect();
        gone.sort_unstable();
        let now = Utc::now().to_rfc3339();
        for pid in gone {
            events.push(
                SecurityEvent::new("process_terminated", Severity::Low)
                    .with_detail("process_id", pid)
                    .with_detail("termination_time", now.clone()),
            );
        }

        self.tracked = current.into_keys().collect();
        Ok(events)
    }
}

fn started_event(info: &ProcessInfo) -> SecurityEvent {
    SecurityEvent::new("process_started", Severity::Low)
        .with_detail("process_id", info.pid)
        .with_detail("process_name", info.name.clone())
        .with_detail(
            "start_time",
            info.start_time.map(|t| t.to_rfc3339()).unwrap_or_default(),
        )
        .with_detail(
            "executable_path",
            info.exe.clone().unwrap_or_else(|| ACCESS_DENIED.to_string()),
        )
        .with_detail(
            "command_line",
            info.cmdline
                .clone()
                .unwrap_or_else(|| ACCESS_DENIED.to_string()),
        )
}
