//! Autorun, service and logon configuration changes.
//!
//! The diff is platform-neutral: a [`RegistryReader`] turns a location into a
//! value-name to value mapping, and [`diff_values`] compares two of them.
//! Only Windows has a real reader; elsewhere every location is unreadable and
//! skipped each cycle.

use super::{CollectorError, CollectorKind, Scanner};
use crate::event::{SecurityEvent, Severity};
use crate::policy::PolicyStore;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Value name to stringified value data for one key.
pub type ValueSnapshot = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hive {
    LocalMachine,
    CurrentUser,
}

impl Hive {
    pub fn name(&self) -> &'static str {
        match self {
            Hive::LocalMachine => "HKEY_LOCAL_MACHINE",
            Hive::CurrentUser => "HKEY_CURRENT_USER",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryLocation {
    pub hive: Hive,
    pub subkey: String,
    pub label: String,
}

impl RegistryLocation {
    pub fn new(hive: Hive, subkey: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            hive,
            subkey: subkey.into(),
            label: label.into(),
        }
    }

    pub fn full_path(&self) -> String {
        format!(r"{}\{}", self.hive.name(), self.subkey)
    }
}

/// Persistence points attackers commonly touch.
pub fn monitored_locations() -> Vec<RegistryLocation> {
    vec![
        RegistryLocation::new(
            Hive::LocalMachine,
            r"SOFTWARE\Microsoft\Windows\CurrentVersion\Run",
            "Autorun (HKLM)",
        ),
        RegistryLocation::new(
            Hive::LocalMachine,
            r"SOFTWARE\Microsoft\Windows\CurrentVersion\RunOnce",
            "RunOnce (HKLM)",
        ),
        RegistryLocation::new(
            Hive::CurrentUser,
            r"SOFTWARE\Microsoft\Windows\CurrentVersion\Run",
            "Autorun (HKCU)",
        ),
        RegistryLocation::new(
            Hive::CurrentUser,
            r"SOFTWARE\Microsoft\Windows\CurrentVersion\RunOnce",
            "RunOnce (HKCU)",
        ),
        RegistryLocation::new(
            Hive::LocalMachine,
            r"SYSTEM\CurrentControlSet\Services",
            "Services",
        ),
        RegistryLocation::new(
            Hive::LocalMachine,
            r"SOFTWARE\Microsoft\Windows NT\CurrentVersion\Winlogon",
            "Winlogon",
        ),
    ]
}

/// Reads all values directly under a location.
pub trait RegistryReader: Send + 'static {
    fn read_values(&mut self, location: &RegistryLocation) -> Result<ValueSnapshot, CollectorError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRegistry;

impl RegistryReader for SystemRegistry {
    #[cfg(windows)]
    fn read_values(&mut self, location: &RegistryLocation) -> Result<ValueSnapshot, CollectorError> {
        use winreg::enums::{HKEY_CURRENT_USER, HKEY_LOCAL_MACHINE, KEY_READ};
        use winreg::RegKey;

        let root = RegKey::predef(match location.hive {
            Hive::LocalMachine => HKEY_LOCAL_MACHINE,
            Hive::CurrentUser => HKEY_CURRENT_USER,
        });
        let read_err = |e: std::io::Error| CollectorError::Source {
            what: location.full_path(),
            reason: e.to_string(),
        };
        let key = root
            .open_subkey_with_flags(&location.subkey, KEY_READ)
            .map_err(read_err)?;

        let mut values = ValueSnapshot::new();
        for item in key.enum_values() {
            let (name, value) = item.map_err(read_err)?;
            values.insert(name, stringify_reg_value(&value));
        }
        Ok(values)
    }

    #[cfg(not(windows))]
    fn read_values(&mut self, _location: &RegistryLocation) -> Result<ValueSnapshot, CollectorError> {
        Err(CollectorError::Unsupported("registry"))
    }
}

#[cfg(windows)]
fn stringify_reg_value(value: &winreg::RegValue) -> String {
    use winreg::enums::RegType;
    use winreg::types::FromRegValue;

    let text = match value.vtype {
        RegType::REG_SZ | RegType::REG_EXPAND_SZ => String::from_reg_value(value).ok(),
        RegType::REG_MULTI_SZ => Vec::<String>::from_reg_value(value)
            .ok()
            .map(|parts| parts.join(" ")),
        RegType::REG_DWORD => u32::from_reg_value(value).ok().map(|n| n.to_string()),
        RegType::REG_QWORD => u64::from_reg_value(value).ok().map(|n| n.to_string()),
        _ => None,
    };
    text.unwrap_or_else(|| value.bytes.iter().map(|b| format!("{:02x}", b)).collect())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueChange {
    Added { name: String, value: String },
    Modified { name: String, old: String, new: String },
    Deleted { name: String, old: String },
}

impl ValueChange {
    pub fn change_type(&self) -> &'static str {
        match self {
            ValueChange::Added { .. } => "value_added",
            ValueChange::Modified { .. } => "value_modified",
            ValueChange::Deleted { .. } => "value_deleted",
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ValueChange::Added { name, .. }
            | ValueChange::Modified { name, .. }
            | ValueChange::Deleted { name, .. } => name,
        }
    }
}

/// Added and modified values in name order, then deletions in name order.
pub fn diff_values(previous: &ValueSnapshot, current: &ValueSnapshot) -> Vec<ValueChange> {
    let mut changes = Vec::new();
    for (name, value) in current {
        match previous.get(name) {
            None => changes.push(ValueChange::Added {
                name: name.clone(),
                value: value.clone(),
            }),
            Some(old) if old != value => changes.push(ValueChange::Modified {
                name: name.clone(),
                old: old.clone(),
                new: value.clone(),
            }),
            Some(_) => {}
        }
    }
    for (name, old) in previous {
        if !current.contains_key(name) {
            changes.push(ValueChange::Deleted {
                name: name.clone(),
                old: old.clone(),
            });
        }
    }
    changes
}

/// Snapshots each location at prime time and diffs one interval later.
pub struct RegistryChangeScanner<R> {
    reader: R,
    policy: Arc<PolicyStore>,
    locations: Vec<RegistryLocation>,
    snapshots: HashMap<String, ValueSnapshot>,
}

impl<R: RegistryReader> RegistryChangeScanner<R> {
    pub fn new(reader: R, policy: Arc<PolicyStore>) -> Self {
        Self::with_locations(reader, policy, monitored_locations())
    }

    pub fn with_locations(
        reader: R,
        policy: Arc<PolicyStore>,
        locations: Vec<RegistryLocation>,
    ) -> Self {
        Self {
            reader,
            policy,
            locations,
            snapshots: HashMap::new(),
        }
    }

    pub fn snapshot(&self, location: &RegistryLocation) -> Option<&ValueSnapshot> {
        self.snapshots.get(&location.full_path())
    }

    fn change_event(&self, location: &RegistryLocation, change: &ValueChange) -> SecurityEvent {
        let path = location.full_path();
        let severity = if self.policy.is_key_protected(&path) {
            Severity::High
        } else {
            Severity::Medium
        };
        let event = SecurityEvent::new(format!("registry_{}", change.change_type()), severity)
            .with_detail("change_type", change.change_type())
            .with_detail("registry_path", path.clone())
            .with_detail("value_name", change.name())
            .with_detail("description", location.label.clone());

        match change {
            ValueChange::Added { name, value } => {
                warn!(path = %path, value_name = %name, value = %value, "new registry value detected");
                event.with_detail("value_data", value.clone())
            }
            ValueChange::Modified { name, old, new } => {
                warn!(path = %path, value_name = %name, value = %new, "registry value modified");
                event
                    .with_detail("old_value", old.clone())
                    .with_detail("new_value", new.clone())
            }
            ValueChange::Deleted { name, old } => {
                warn!(path = %path, value_name = %name, "registry value deleted");
                event.with_detail("old_value", old.clone())
            }
        }
    }
}

impl<R: RegistryReader> Scanner for RegistryChangeScanner<R> {
    fn kind(&self) -> CollectorKind {
        CollectorKind::RegistryMonitor
    }

    fn prime(&mut self) {
        info!(count = self.locations.len(), "monitoring registry paths");
        for location in &self.locations {
            match self.reader.read_values(location) {
                Ok(values) => {
                    self.snapshots.insert(location.full_path(), values);
                }
                Err(e) => debug!(path = %location.full_path(), error = %e, "could not read registry key"),
            }
        }
    }

    fn scan_immediately(&self) -> bool {
        false
    }

    fn scan(&mut self) -> Result<Vec<SecurityEvent>, CollectorError> {
        let mut events = Vec::new();
        for location in &self.locations {
            let current = match self.reader.read_values(location) {
                Ok(values) => values,
                Err(e) => {
                    debug!(path = %location.full_path(), error = %e, "skipping unreadable registry key");
                    continue;
                }
            };
            let path = location.full_path();
            let empty = ValueSnapshot::new();
            let previous = self.snapshots.get(&path).unwrap_or(&empty);
            events.extend(
                diff_values(previous, &current)
                    .iter()
                    .map(|change| self.change_event(location, change)),
            );
            self.snapshots.insert(path, current);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn snap(pairs: &[(&str, &str)]) -> ValueSnapshot {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// Replays one scripted result per read, regardless of location.
    struct Scripted(VecDeque<Result<ValueSnapshot, CollectorError>>);

    impl RegistryReader for Scripted {
        fn read_values(&mut self, _: &RegistryLocation) -> Result<ValueSnapshot, CollectorError> {
            self.0
                .pop_front()
                .unwrap_or(Err(CollectorError::Unsupported("registry")))
        }
    }

    fn run_key() -> RegistryLocation {
        RegistryLocation::new(
            Hive::LocalMachine,
            r"SOFTWARE\Microsoft\Windows\CurrentVersion\Run",
            "Autorun (HKLM)",
        )
    }

    fn winlogon() -> RegistryLocation {
        RegistryLocation::new(
            Hive::LocalMachine,
            r"SOFTWARE\Microsoft\Windows NT\CurrentVersion\Winlogon",
            "Winlogon",
        )
    }

    fn scanner(
        location: RegistryLocation,
        script: Vec<Result<ValueSnapshot, CollectorError>>,
    ) -> RegistryChangeScanner<Scripted> {
        RegistryChangeScanner::with_locations(
            Scripted(VecDeque::from(script)),
            Arc::new(PolicyStore::with_defaults()),
            vec![location],
        )
    }

    #[test]
    fn diff_add_modify_delete() {
        let a = snap(&[("A", "1")]);
        let ab = snap(&[("A", "1"), ("B", "2")]);
        let a9 = snap(&[("A", "9")]);

        assert_eq!(
            diff_values(&a, &ab),
            vec![ValueChange::Added {
                name: "B".into(),
                value: "2".into()
            }]
        );
        assert_eq!(
            diff_values(&ab, &a9),
            vec![
                ValueChange::Modified {
                    name: "A".into(),
                    old: "1".into(),
                    new: "9".into()
                },
                ValueChange::Deleted {
                    name: "B".into(),
                    old: "2".into()
                },
            ]
        );
        assert!(diff_values(&ab, &ab).is_empty());
    }

    #[test]
    fn locations_cover_both_scopes() {
        let locs = monitored_locations();
        assert_eq!(locs.len(), 6);
        assert!(locs.iter().any(|l| l.hive == Hive::CurrentUser));
        assert_eq!(
            locs[0].full_path(),
            r"HKEY_LOCAL_MACHINE\SOFTWARE\Microsoft\Windows\CurrentVersion\Run"
        );
    }

    #[test]
    fn protected_location_raises_severity() {
        let mut s = scanner(
            run_key(),
            vec![Ok(snap(&[("A", "1")])), Ok(snap(&[("A", "1"), ("B", "2")]))],
        );
        s.prime();
        let events = s.scan().unwrap();
        assert_eq!(events.len(), 1);
        let e = &events[0];
        assert_eq!(e.event_type(), "registry_value_added");
        assert_eq!(e.severity(), Severity::High);
        assert_eq!(e.detail("value_name").and_then(|v| v.as_str()), Some("B"));
        assert_eq!(e.detail("value_data").and_then(|v| v.as_str()), Some("2"));
        assert_eq!(
            e.detail("description").and_then(|v| v.as_str()),
            Some("Autorun (HKLM)")
        );
    }

    #[test]
    fn unprotected_location_is_medium() {
        let mut s = scanner(
            winlogon(),
            vec![Ok(snap(&[("Shell", "explorer.exe")])), Ok(snap(&[("Shell", "evil.exe")]))],
        );
        s.prime();
        let events = s.scan().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type(), "registry_value_modified");
        assert_eq!(events[0].severity(), Severity::Medium);
        assert_eq!(
            events[0].detail("old_value").and_then(|v| v.as_str()),
            Some("explorer.exe")
        );
    }

    #[test]
    fn unreadable_cycle_is_skipped_not_deleted() {
        let mut s = scanner(
            run_key(),
            vec![
                Ok(snap(&[("A", "1"), ("B", "2")])),
                Err(CollectorError::Source {
                    what: "Run".into(),
                    reason: "access denied".into(),
                }),
                Ok(snap(&[("A", "1"), ("B", "2")])),
            ],
        );
        s.prime();
        assert!(s.scan().unwrap().is_empty());
        assert_eq!(s.snapshot(&run_key()).map(|v| v.len()), Some(2));
        assert!(s.scan().unwrap().is_empty());
    }

    #[test]
    fn first_scan_waits_an_interval() {
        let s = scanner(run_key(), vec![]);
        assert!(!s.scan_immediately());
    }
}
