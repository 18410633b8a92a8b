//! Blacklisted process names and protected configuration-store keys.
//!
//! Both sets are internally locked so collectors on different threads can
//! query them while an operator adds or removes entries.

use crate::config::PolicyConfig;
use parking_lot::RwLock;
use std::collections::HashSet;
use tracing::info;

const DEFAULT_BLACKLIST: &[&str] = &[
    "mimikatz", "psexec", "netcat", "ncat", "nc", "procdump", "lazagne", "windump",
];

const DEFAULT_PROTECTED_KEYS: &[&str] = &[
    r"HKEY_LOCAL_MACHINE\SOFTWARE\Microsoft\Windows\CurrentVersion\Run",
    r"HKEY_LOCAL_MACHINE\SOFTWARE\Microsoft\Windows\CurrentVersion\RunOnce",
    r"HKEY_CURRENT_USER\SOFTWARE\Microsoft\Windows\CurrentVersion\Run",
    r"HKEY_CURRENT_USER\SOFTWARE\Microsoft\Windows\CurrentVersion\RunOnce",
    r"HKEY_LOCAL_MACHINE\SYSTEM\CurrentControlSet\Services",
];

/// Lowercases and drops a trailing `.exe` so `Mimikatz.EXE` and `mimikatz` compare equal.
pub fn normalize_process_name(name: &str) -> String {
    let lower = name.trim().to_lowercase();
    match lower.strip_suffix(".exe") {
        Some(stem) if !stem.is_empty() => stem.to_string(),
        _ => lower,
    }
}

/// Lowercases and expands a short hive name, so `HKLM\Software` and
/// `HKEY_LOCAL_MACHINE\SOFTWARE` name the same key.
fn normalize_key(path: &str) -> String {
    let lower = path.trim().to_lowercase();
    let (root, rest) = match lower.split_once('\\') {
        Some((root, rest)) => (root, Some(rest)),
        None => (lower.as_str(), None),
    };
    let root = match root {
        "hklm" => "hkey_local_machine",
        "hkcu" => "hkey_current_user",
        "hkcr" => "hkey_classes_root",
        "hku" => "hkey_users",
        "hkcc" => "hkey_current_config",
        other => other,
    };
    match rest {
        Some(rest) => format!("{}\\{}", root, rest),
        None => root.to_string(),
    }
}

#[derive(Debug)]
pub struct PolicyStore {
    blacklist: RwLock<HashSet<String>>,
    protected_keys: RwLock<HashSet<String>>,
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl PolicyStore {
    /// Empty store with no seed entries.
    pub fn empty() -> Self {
        Self {
            blacklist: RwLock::new(HashSet::new()),
            protected_keys: RwLock::new(HashSet::new()),
        }
    }

    /// Store seeded with known attacker tools and autorun/service locations.
    pub fn with_defaults() -> Self {
        let store = Self::empty();
        store
            .blacklist
            .write()
            .extend(DEFAULT_BLACKLIST.iter().map(|n| normalize_process_name(n)));
        store
            .protected_keys
            .write()
            .extend(DEFAULT_PROTECTED_KEYS.iter().map(|k| normalize_key(k)));
        store
    }

    /// Seeds plus whatever the configuration adds.
    pub fn from_config(config: &PolicyConfig) -> Self {
        let store = Self::with_defaults();
        for name in &config.blacklisted_processes {
            store.add_blacklisted_process(name);
        }
        for key in &config.protected_keys {
            store.add_protected_key(key);
        }
        info!(
            blacklisted = store.blacklist.read().len(),
            protected_keys = store.protected_keys.read().len(),
            "policy initialized"
        );
        store
    }

    /// Case-insensitive exact match.
    pub fn is_process_blacklisted(&self, name: &str) -> bool {
        self.blacklist.read().contains(&normalize_process_name(name))
    }

    /// Case-insensitive prefix match: protected if any entry is a prefix of `path`.
    pub fn is_key_protected(&self, path: &str) -> bool {
        let path = normalize_key(path);
        self.protected_keys
            .read()
            .iter()
            .any(|k| path.starts_with(k.as_str()))
    }

    /// Returns `true` if the entry was not already present.
    pub fn add_blacklisted_process(&self, name: &str) -> bool {
        let added = self.blacklist.write().insert(normalize_process_name(name));
        if added {
            info!(process = name, "added process to blacklist");
        }
        added
    }

    /// Returns `true` if the entry was present.
    pub fn remove_blacklisted_process(&self, name: &str) -> bool {
        let removed = self.blacklist.write().remove(&normalize_process_name(name));
        if removed {
            info!(process = name, "removed process from blacklist");
        }
        removed
    }

    pub fn add_protected_key(&self, path: &str) -> bool {
        let added = self.protected_keys.write().insert(normalize_key(path));
        if added {
            info!(key = path, "added registry key protection");
        }
        added
    }

    pub fn remove_protected_key(&self, path: &str) -> bool {
        let removed = self.protected_keys.write().remove(&normalize_key(path));
        if removed {
            info!(key = path, "removed registry key protection");
        }
        removed
    }

    /// Sorted copy of the blacklist.
    pub fn blacklisted_processes(&self) -> Vec<String> {
        let mut v: Vec<String> = self.blacklist.read().iter().cloned().collect();
        v.sort();
        v
    }

    /// Sorted copy of the protected key prefixes.
    pub fn protected_keys(&self) -> Vec<String> {
        let mut v: Vec<String> = self.protected_keys.read().iter().cloned().collect();
        v.sort();
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn seeded_blacklist_is_case_insensitive() {
        let p = PolicyStore::with_defaults();
        assert!(p.is_process_blacklisted("mimikatz"));
        assert!(p.is_process_blacklisted("MimiKatz"));
        assert!(p.is_process_blacklisted("PsExec.exe"));
        assert!(!p.is_process_blacklisted("mimikatz2"));
        assert!(!p.is_process_blacklisted("explorer"));
    }

    #[test]
    fn protected_keys_match_by_prefix() {
        let p = PolicyStore::with_defaults();
        assert!(p.is_key_protected(
            r"hkey_local_machine\software\microsoft\windows\currentversion\run"
        ));
        assert!(p.is_key_protected(
            r"HKEY_LOCAL_MACHINE\SYSTEM\CurrentControlSet\Services\EvilSvc"
        ));
        assert!(!p.is_key_protected(
            r"HKEY_LOCAL_MACHINE\SOFTWARE\Microsoft\Windows NT\CurrentVersion\Winlogon"
        ));
    }

    #[test]
    fn add_and_remove_are_idempotent() {
        let p = PolicyStore::empty();
        assert!(p.add_blacklisted_process("evil"));
        assert!(!p.add_blacklisted_process("EVIL"));
        assert!(p.is_process_blacklisted("evil"));
        assert!(p.remove_blacklisted_process("Evil"));
        assert!(!p.remove_blacklisted_process("evil"));
        assert!(!p.is_process_blacklisted("evil"));

        assert!(p.add_protected_key(r"HKCU\Foo"));
        assert!(!p.add_protected_key(r"hkcu\foo"));
        assert!(p.remove_protected_key(r"HKCU\FOO"));
        assert!(!p.remove_protected_key(r"HKCU\FOO"));
    }

    #[test]
    fn config_entries_extend_seeds() {
        let cfg = PolicyConfig {
            blacklisted_processes: vec!["CobaltStrike".into()],
            protected_keys: vec![r"HKLM\SOFTWARE\Policies".into()],
        };
        let p = PolicyStore::from_config(&cfg);
        assert!(p.is_process_blacklisted("cobaltstrike"));
        assert!(p.is_process_blacklisted("mimikatz"));
        assert!(p.is_key_protected(r"HKLM\SOFTWARE\Policies\Microsoft"));
        assert!(p.is_key_protected(r"HKEY_LOCAL_MACHINE\SOFTWARE\Policies\Microsoft"));
        assert_eq!(p.blacklisted_processes().len(), DEFAULT_BLACKLIST.len() + 1);
    }

    #[test]
    fn short_hive_names_match_full_paths() {
        let p = PolicyStore::empty();
        assert!(p.add_protected_key(r"HKCU\Software\Vendor"));
        assert!(!p.add_protected_key(r"HKEY_CURRENT_USER\SOFTWARE\VENDOR"));
        assert!(p.is_key_protected(r"HKEY_CURRENT_USER\Software\Vendor\Run"));
        assert!(!p.is_key_protected(r"HKEY_LOCAL_MACHINE\Software\Vendor"));
        assert_eq!(p.protected_keys(), vec![r"hkey_current_user\software\vendor".to_string()]);
        assert_eq!(normalize_key("HKU"), "hkey_users");
    }

    #[test]
    fn normalize_keeps_bare_exe() {
        assert_eq!(normalize_process_name(".exe"), ".exe");
        assert_eq!(normalize_process_name(" NC.EXE "), "nc");
    }

    #[test]
    fn concurrent_reads_during_writes() {
        let p = Arc::new(PolicyStore::with_defaults());
        let writer = {
            let p = Arc::clone(&p);
            std::thread::spawn(move || {
                for i in 0..200 {
                    p.add_blacklisted_process(&format!("tool{}", i));
                    p.remove_blacklisted_process(&format!("tool{}", i));
                }
            })
        };
        for _ in 0..200 {
            assert!(p.is_process_blacklisted("mimikatz"));
        }
        writer.join().unwrap();
        assert!(!p.is_process_blacklisted("tool5"));
    }
}
