//! Host configuration-variable store.
//!
//! One store is shared by the host console and every VM instance. All reads
//! and writes go through a single lock. Change hooks (module-backed proxies,
//! validators) always run with that lock released, because a proxy hook calls
//! into a module which may read cvars back while it decides.
use crate::config::types::{Result, VmError};
use bitflags::bitflags;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct CvarFlags: u32 {
        /// Saved by `archive_lines`
        const ARCHIVE = 1 << 0;
        const USERINFO = 1 << 1;
        const SERVERINFO = 1 << 2;
        const SYSTEMINFO = 1 << 3;
        /// Not writable from the console
        const ROM = 1 << 6;
        const TEMPORARY = 1 << 8;
        /// Console writes need cheats enabled
        const CHEAT = 1 << 9;
    }
}

/// Validates or observes a value before it is stored.
pub trait CvarHook: Send + Sync {
    /// Return `Err(description)` to reject `value`.
    fn on_value_changed(&self, name: &str, value: &str) -> std::result::Result<(), String>;
}

/// Accepts integers in `min..=max`
pub struct RangeHook {
    pub min: i64,
    pub max: i64,
}

impl CvarHook for RangeHook {
    fn on_value_changed(&self, _name: &str, value: &str) -> std::result::Result<(), String> {
        match value.trim().parse::<i64>() {
            Ok(v) if (self.min..=self.max).contains(&v) => Ok(()),
            Ok(v) => Err(format!("{} is outside {}..={}", v, self.min, self.max)),
            Err(_) => Err(format!("{:?} is not an integer", value)),
        }
    }
}

pub struct BoolHook;

impl CvarHook for BoolHook {
    fn on_value_changed(&self, _name: &str, value: &str) -> std::result::Result<(), String> {
        parse_bool(value)
            .map(|_| ())
            .ok_or_else(|| format!("{:?} is not a boolean", value))
    }
}

pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "on" | "true" | "yes" => Some(true),
        "0" | "off" | "false" | "no" => Some(false),
        _ => None,
    }
}

/// Registration parameters
#[derive(Clone, Debug)]
pub struct CvarSpec {
    pub description: String,
    pub flags: CvarFlags,
    pub default: String,
}

impl CvarSpec {
    pub fn new(description: &str, flags: CvarFlags, default: &str) -> Self {
        Self {
            description: description.to_string(),
            flags,
            default: default.to_string(),
        }
    }
}

struct Entry {
    value: String,
    default: String,
    description: String,
    flags: CvarFlags,
    owner: Option<String>,
    hook: Option<Arc<dyn CvarHook>>,
    registered: bool,
}

impl Entry {
    fn unregistered(value: &str) -> Self {
        Self {
            value: value.to_string(),
            default: value.to_string(),
            description: String::new(),
            flags: CvarFlags::empty(),
            owner: None,
            hook: None,
            registered: false,
        }
    }
}

/// Who is writing a value
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Writer<'a> {
    /// Console or host code. Subject to ROM and CHEAT.
    Console,
    /// Host code bypassing access flags
    Host,
    /// A module writing through its syscall interface
    Module(&'a str),
}

#[derive(Default)]
pub struct CvarStore {
    entries: Mutex<BTreeMap<String, Entry>>,
    cheats: AtomicBool,
}

impl CvarStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_cheats_allowed(&self, allowed: bool) {
        self.cheats.store(allowed, Ordering::SeqCst);
    }

    /// Register `name` and return its effective value.
    ///
    /// A value set before registration (config file, archive) is adopted when
    /// the hook accepts it, otherwise the default wins. Registering a name that
    /// is already registered fails.
    pub fn register(
        &self,
        name: &str,
        spec: CvarSpec,
        owner: Option<&str>,
        hook: Option<Arc<dyn CvarHook>>,
    ) -> Result<String> {
        let key = normalize(name)?;
        let existing = {
            let entries = self.entries();
            match entries.get(&key) {
                Some(entry) if entry.registered => {
                    return Err(VmError::Cvar(format!("{} is already registered", name)));
                }
                Some(entry) => Some(entry.value.clone()),
                None => None,
            }
        };

        let value = match (existing, &hook) {
            (Some(value), Some(hook)) => match hook.on_value_changed(&key, &value) {
                Ok(()) => value,
                Err(reason) => {
                    log::warn!("Resetting {} to default: {}", key, reason);
                    spec.default.clone()
                }
            },
            (Some(value), None) => value,
            (None, _) => spec.default.clone(),
        };

        let mut entries = self.entries();
        if entries.get(&key).is_some_and(|e| e.registered) {
            return Err(VmError::Cvar(format!("{} is already registered", name)));
        }
        entries.insert(
            key,
            Entry {
                value: value.clone(),
                default: spec.default,
                description: spec.description,
                flags: spec.flags,
                owner: owner.map(str::to_string),
                hook,
                registered: true,
            },
        );
        Ok(value)
    }

    /// Remove every cvar registered by `owner` under one lock.
    pub fn unregister_owned(&self, owner: &str) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, e| e.owner.as_deref() != Some(owner));
        before - entries.len()
    }

    pub fn get(&self, name: &str) -> Option<String> {
        let key = normalize(name).ok()?;
        self.entries().get(&key).map(|e| e.value.clone())
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).as_deref().and_then(parse_bool)
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(|v| v.trim().parse().ok())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        normalize(name)
            .ok()
            .and_then(|key| self.entries().get(&key).map(|e| e.registered))
            .unwrap_or(false)
    }

    pub fn flags(&self, name: &str) -> Option<CvarFlags> {
        let key = normalize(name).ok()?;
        self.entries().get(&key).map(|e| e.flags)
    }

    pub fn description(&self, name: &str) -> Option<String> {
        let key = normalize(name).ok()?;
        self.entries().get(&key).map(|e| e.description.clone())
    }

    pub fn owner(&self, name: &str) -> Option<String> {
        let key = normalize(name).ok()?;
        self.entries().get(&key).and_then(|e| e.owner.clone())
    }

    /// Console write, subject to access flags.
    pub fn set(&self, name: &str, value: &str) -> Result<()> {
        self.set_as(name, value, Writer::Console)
    }

    /// Write a value. Unknown names become unregistered user cvars.
    ///
    /// The change hook runs first and may veto the write. A module writing
    /// one of its own cvars skips the hook since it already has the value.
    pub fn set_as(&self, name: &str, value: &str, writer: Writer<'_>) -> Result<()> {
        let key = normalize(name)?;
        let hook = {
            let mut entries = self.entries();
            let Some(entry) = entries.get(&key) else {
                entries.insert(key, Entry::unregistered(value));
                return Ok(());
            };
            let own_write = matches!(writer, Writer::Module(m) if entry.owner.as_deref() == Some(m));
            if writer != Writer::Host && !own_write && entry.flags.contains(CvarFlags::ROM) {
                return Err(VmError::Cvar(format!("{} is read-only", name)));
            }
            if writer == Writer::Console
                && entry.flags.contains(CvarFlags::CHEAT)
                && !self.cheats.load(Ordering::SeqCst)
            {
                return Err(VmError::Cvar(format!("{} is cheat-protected", name)));
            }
            if entry.value == value {
                return Ok(());
            }
            if own_write {
                None
            } else {
                entry.hook.clone()
            }
        };

        if let Some(hook) = hook {
            hook.on_value_changed(&key, value)
                .map_err(|reason| VmError::Cvar(format!("{} rejected {:?}: {}", key, value, reason)))?;
        }

        // The entry may have been unregistered while the hook ran.
        let mut entries = self.entries();
        match entries.get_mut(&key) {
            Some(entry) => entry.value = value.to_string(),
            None => {
                entries.insert(key, Entry::unregistered(value));
            }
        }
        Ok(())
    }

    pub fn reset(&self, name: &str) -> Result<()> {
        let default = {
            let key = normalize(name)?;
            self.entries()
                .get(&key)
                .map(|e| e.default.clone())
                .ok_or_else(|| VmError::Cvar(format!("{} does not exist", name)))?
        };
        self.set_as(name, &default, Writer::Host)
    }

    /// OR `flags` into an existing cvar. Returns false when it does not exist.
    pub fn add_flags(&self, name: &str, flags: CvarFlags) -> bool {
        let Ok(key) = normalize(name) else {
            return false;
        };
        match self.entries().get_mut(&key) {
            Some(entry) => {
                entry.flags.insert(flags);
                true
            }
            None => false,
        }
    }

    /// `(name, value)` pairs in name order
    pub fn list(&self) -> Vec<(String, String)> {
        self.entries()
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    /// Render archived cvars as `set <name> "<value>"` lines.
    pub fn archive_lines(&self) -> String {
        let entries = self.entries();
        let mut out = String::new();
        for (name, entry) in entries.iter() {
            if entry.flags.contains(CvarFlags::ARCHIVE) && !entry.flags.contains(CvarFlags::TEMPORARY) {
                out.push_str(&format!("set {} \"{}\"\n", name, entry.value.replace('"', "'")));
            }
        }
        out
    }

    /// Apply `set <name> "<value>"` lines. Returns how many were applied.
    pub fn load_archive(&self, text: &str) -> usize {
        let mut applied = 0;
        for line in text.lines() {
            let args = crate::services::command::tokenize(line);
            match args.as_slice() {
                [cmd, name, value, ..] if cmd.eq_ignore_ascii_case("set") => {
                    match self.set_as(name, value, Writer::Host) {
                        Ok(()) => applied += 1,
                        Err(e) => log::warn!("Skipping archived cvar {}: {}", name, e),
                    }
                }
                [] => {}
                _ => log::debug!("Ignoring archive line {:?}", line),
            }
        }
        applied
    }
}

fn normalize(name: &str) -> Result<String> {
    let key = name.trim().to_ascii_lowercase();
    if key.is_empty() || key.contains(|c: char| c.is_whitespace() || c == '"' || c == ';') {
        return Err(VmError::Cvar(format!("invalid cvar name: {:?}", name)));
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        calls: AtomicUsize,
        reject: &'static str,
    }

    impl CvarHook for Counting {
        fn on_value_changed(&self, _name: &str, value: &str) -> std::result::Result<(), String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if value == self.reject {
                Err("nope".to_string())
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_register_get_set() {
        let store = CvarStore::new();
        let value = store
            .register("g_test", CvarSpec::new("test", CvarFlags::empty(), "0"), Some("sgame"), None)
            .unwrap();
        assert_eq!(value, "0");
        store.set("G_TEST", "42").unwrap();
        assert_eq!(store.get("g_test").as_deref(), Some("42"));
        assert_eq!(store.get_int("g_test"), Some(42));
    }

    #[test]
    fn test_double_registration_fails() {
        let store = CvarStore::new();
        let spec = CvarSpec::new("", CvarFlags::empty(), "1");
        store.register("a", spec.clone(), None, None).unwrap();
        assert!(matches!(store.register("a", spec, None, None), Err(VmError::Cvar(_))));
    }

    #[test]
    fn test_register_adopts_preset_value_unless_rejected() {
        let store = CvarStore::new();
        store.set("vm.x.type", "7").unwrap();
        store.set("vm.y.type", "1").unwrap();
        let range: Arc<dyn CvarHook> = Arc::new(RangeHook { min: 0, max: 2 });
        let spec = CvarSpec::new("", CvarFlags::empty(), "0");
        assert_eq!(store.register("vm.x.type", spec.clone(), None, Some(range.clone())).unwrap(), "0");
        assert_eq!(store.register("vm.y.type", spec, None, Some(range)).unwrap(), "1");
    }

    #[test]
    fn test_hook_rejection_keeps_value() {
        let store = CvarStore::new();
        let hook = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            reject: "bad",
        });
        store
            .register("g_mode", CvarSpec::new("", CvarFlags::empty(), "a"), Some("cgame"), Some(hook.clone()))
            .unwrap();
        assert!(store.set("g_mode", "bad").is_err());
        assert_eq!(store.get("g_mode").as_deref(), Some("a"));
        store.set("g_mode", "b").unwrap();
        assert_eq!(store.get("g_mode").as_deref(), Some("b"));
        assert_eq!(hook.calls.load(Ordering::SeqCst), 2);

        // Owner writes do not echo back through the hook.
        store.set_as("g_mode", "c", Writer::Module("cgame")).unwrap();
        assert_eq!(hook.calls.load(Ordering::SeqCst), 2);
        store.set_as("g_mode", "d", Writer::Module("sgame")).unwrap();
        assert_eq!(hook.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_access_flags() {
        let store = CvarStore::new();
        store
            .register("version", CvarSpec::new("", CvarFlags::ROM, "1.0"), None, None)
            .unwrap();
        store
            .register("g_god", CvarSpec::new("", CvarFlags::CHEAT, "0"), None, None)
            .unwrap();
        assert!(store.set("version", "2.0").is_err());
        store.set_as("version", "2.0", Writer::Host).unwrap();
        assert!(store.set("g_god", "1").is_err());
        store.set_cheats_allowed(true);
        store.set("g_god", "1").unwrap();
    }

    #[test]
    fn test_unregister_owned_removes_values() {
        let store = CvarStore::new();
        let spec = CvarSpec::new("", CvarFlags::empty(), "0");
        store.register("g_a", spec.clone(), Some("sgame"), None).unwrap();
        store.register("g_b", spec.clone(), Some("sgame"), None).unwrap();
        store.register("cl_c", spec, Some("cgame"), None).unwrap();
        assert_eq!(store.unregister_owned("sgame"), 2);
        assert_eq!(store.get("g_a"), None);
        assert!(store.is_registered("cl_c"));
    }

    #[test]
    fn test_add_flags_and_archive() {
        let store = CvarStore::new();
        store
            .register("name", CvarSpec::new("", CvarFlags::empty(), "player"), None, None)
            .unwrap();
        store
            .register("tmp", CvarSpec::new("", CvarFlags::ARCHIVE | CvarFlags::TEMPORARY, "x"), None, None)
            .unwrap();
        assert!(store.add_flags("name", CvarFlags::ARCHIVE));
        assert!(!store.add_flags("missing", CvarFlags::ARCHIVE));
        // Bits the host has no name for are kept as sent.
        assert!(store.add_flags("tmp", CvarFlags::from_bits_retain(1 << 20)));
        let flags = store.flags("tmp").unwrap();
        assert!(flags.contains(CvarFlags::ARCHIVE | CvarFlags::TEMPORARY));
        assert_eq!(flags.bits() & (1 << 20), 1 << 20);
        store.set("name", "some one").unwrap();

        let archive = store.archive_lines();
        assert_eq!(archive, "set name \"some one\"\n");

        let restored = CvarStore::new();
        assert_eq!(restored.load_archive(&archive), 1);
        assert_eq!(restored.get("name").as_deref(), Some("some one"));
        assert!(!restored.is_registered("name"));
    }

    #[test]
    fn test_validators() {
        assert!(RangeHook { min: 0, max: 2 }.on_value_changed("t", "2").is_ok());
        assert!(RangeHook { min: 0, max: 2 }.on_value_changed("t", "3").is_err());
        assert!(BoolHook.on_value_changed("b", "on").is_ok());
        assert!(BoolHook.on_value_changed("b", "maybe").is_err());
        assert_eq!(parse_bool("FALSE"), Some(false));
    }
}
