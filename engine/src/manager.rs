//! Registry of engines and the set of engines the user declined.

use crate::engine::{Engine, SyncStats};
use crate::prefs::{PrefStore, SharedPrefs};
use crate::session::SyncSession;
use crate::Result;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, info, warn};

const DECLINED_PREF: &str = "declinedEngines";

/// Outcome of syncing one engine.
#[derive(Debug)]
pub struct EngineOutcome {
    pub engine: String,
    pub result: Result<Option<SyncStats>>,
}

pub struct EngineManager {
    engines: BTreeMap<String, Box<dyn Engine>>,
    declined: BTreeSet<String>,
    prefs: SharedPrefs,
}

impl EngineManager {
    /// Create a manager, restoring the declined set from `prefs`.
    pub fn new(prefs: SharedPrefs) -> Self {
        let declined = prefs
            .get_str(DECLINED_PREF)
            .map(|list| {
                list.split(',')
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Self {
            engines: BTreeMap::new(),
            declined,
            prefs,
        }
    }

    /// Register an engine. Returns false, keeping the existing engine, if
    /// one with the same name is already registered.
    pub fn register(&mut self, engine: Box<dyn Engine>) -> bool {
        let name = engine.name().to_lowercase();
        if self.engines.contains_key(&name) {
            error!(engine = %name, "engine is already registered");
            return false;
        }
        debug!(engine = %name, "registered engine");
        self.engines.insert(name, engine);
        true
    }

    pub fn unregister(&mut self, name: &str) -> Option<Box<dyn Engine>> {
        self.engines.remove(&name.to_lowercase())
    }

    pub fn clear(&mut self) {
        self.engines.clear();
    }

    pub fn get(&self, name: &str) -> Option<&dyn Engine> {
        let engine = self.engines.get(&name.to_lowercase());
        if engine.is_none() {
            debug!(engine = name, known = ?self.engines.keys().collect::<Vec<_>>(), "could not get engine");
        }
        engine.map(|e| e.as_ref())
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut (dyn Engine + 'static)> {
        self.engines
            .get_mut(&name.to_lowercase())
            .map(|e| e.as_mut())
    }

    /// The engines among `names` that are registered, in the given order.
    pub fn get_many<'n>(&self, names: impl IntoIterator<Item = &'n str>) -> Vec<&dyn Engine> {
        names.into_iter().filter_map(|name| self.get(name)).collect()
    }

    pub fn get_all(&self) -> Vec<&dyn Engine> {
        self.engines.values().map(|e| e.as_ref()).collect()
    }

    /// Enabled engines, lowest sync priority first.
    pub fn get_enabled(&self) -> Vec<&dyn Engine> {
        let mut enabled: Vec<&dyn Engine> = self
            .engines
            .values()
            .map(|e| e.as_ref())
            .filter(|e| e.enabled())
            .collect();
        enabled.sort_by_key(|e| e.sync_priority());
        enabled
    }

    pub fn enabled_engine_names(&self) -> Vec<String> {
        self.get_enabled()
            .into_iter()
            .map(|e| e.name().to_string())
            .collect()
    }

    fn persist_declined(&self) {
        let list: Vec<&str> = self.declined.iter().map(String::as_str).collect();
        self.prefs.set(DECLINED_PREF, list.join(",").into());
    }

    pub fn get_declined(&self) -> Vec<String> {
        self.declined.iter().cloned().collect()
    }

    pub fn set_declined<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.declined = names.into_iter().map(Into::into).collect();
        self.persist_declined();
    }

    pub fn is_declined(&self, name: &str) -> bool {
        self.declined.contains(name)
    }

    pub fn decline<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.declined.extend(names.into_iter().map(Into::into));
        self.persist_declined();
    }

    pub fn undecline<'n>(&mut self, names: impl IntoIterator<Item = &'n str>) {
        for name in names {
            self.declined.remove(name);
        }
        self.persist_declined();
    }

    /// Decline every registered engine that is disabled.
    pub fn decline_disabled(&mut self) {
        for engine in self.engines.values().filter(|e| !e.enabled()) {
            debug!(engine = %engine.name(), "declining disabled engine");
            self.declined.insert(engine.name().to_string());
        }
        self.persist_declined();
    }

    /// Sync every enabled engine in priority order.
    ///
    /// A failing engine does not stop the others. Declined engines are
    /// recorded in meta/global, which is uploaded at the end if changed.
    pub fn sync_all(&mut self, session: &mut SyncSession<'_>) -> Result<Vec<EngineOutcome>> {
        let mut declined: BTreeSet<String> = self
            .declined
            .iter()
            .chain(session.meta().declined.iter())
            .cloned()
            .collect();
        let names = self.enabled_engine_names();
        for name in &names {
            declined.remove(name);
        }
        if declined != self.declined {
            self.set_declined(declined);
        }
        session.set_declined(self.get_declined());

        let mut outcomes = Vec::with_capacity(names.len());
        for name in names {
            let Some(engine) = self.get_mut(&name) else {
                continue;
            };
            engine.set_last_modified(session.last_modified(&name));
            let result = engine.sync(session);
            match &result {
                Ok(Some(stats)) => info!(engine = %name, ?stats, "engine synced"),
                Ok(None) => {}
                Err(e) => warn!(engine = %name, error = %e, code = ?e.failure_code(), "engine sync failed"),
            }
            outcomes.push(EngineOutcome {
                engine: name,
                result,
            });
        }

        session.finish()?;
        Ok(outcomes)
    }
}

impl std::fmt::Debug for EngineManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineManager")
            .field("engines", &self.engines.keys().collect::<Vec<_>>())
            .field("declined", &self.declined)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prefs::{MemoryPrefs, PrefStore};
    use crate::Timestamp;

    /// An engine that only records what was asked of it.
    struct StubEngine {
        name: String,
        priority: i32,
        enabled: bool,
    }

    impl StubEngine {
        fn boxed(name: &str, priority: i32, enabled: bool) -> Box<dyn Engine> {
            Box::new(Self {
                name: name.to_string(),
                priority,
                enabled,
            })
        }
    }

    impl Engine for StubEngine {
        fn name(&self) -> &str {
            &self.name
        }
        fn display_name(&self) -> &str {
            &self.name
        }
        fn sync_priority(&self) -> i32 {
            self.priority
        }
        fn enabled(&self) -> bool {
            self.enabled
        }
        fn set_enabled(&mut self, enabled: bool) {
            self.enabled = enabled;
        }
        fn score(&self) -> u32 {
            0
        }
        fn sync(&mut self, _session: &mut SyncSession<'_>) -> Result<Option<SyncStats>> {
            Ok(Some(SyncStats::default()))
        }
        fn reset_client(&mut self) -> Result<()> {
            Ok(())
        }
        fn wipe_client(&mut self) -> Result<()> {
            Ok(())
        }
        fn wipe_server(&mut self, _session: &mut SyncSession<'_>) -> Result<()> {
            Ok(())
        }
        fn set_last_modified(&mut self, _last_modified: Option<Timestamp>) {}
        fn can_decrypt(&mut self, _session: &SyncSession<'_>) -> bool {
            true
        }
        fn start_tracking(&mut self) {}
        fn stop_tracking(&mut self) {}
    }

    #[test]
    fn duplicate_registration_keeps_first() {
        let mut manager = EngineManager::new(MemoryPrefs::shared());
        assert!(manager.register(StubEngine::boxed("tabs", 1, true)));
        assert!(!manager.register(StubEngine::boxed("tabs", 9, false)));

        let tabs = manager.get("TABS").unwrap();
        assert_eq!(tabs.sync_priority(), 1);
        assert_eq!(manager.get_all().len(), 1);
    }

    #[test]
    fn enabled_sorted_by_priority() {
        let mut manager = EngineManager::new(MemoryPrefs::shared());
        manager.register(StubEngine::boxed("history", 5, true));
        manager.register(StubEngine::boxed("passwords", 1, true));
        manager.register(StubEngine::boxed("forms", 3, false));
        manager.register(StubEngine::boxed("tabs", 3, true));

        assert_eq!(
            manager.enabled_engine_names(),
            vec!["passwords", "tabs", "history"]
        );
    }

    #[test]
    fn get_many_skips_unknown() {
        let mut manager = EngineManager::new(MemoryPrefs::shared());
        manager.register(StubEngine::boxed("tabs", 0, true));
        manager.register(StubEngine::boxed("forms", 0, true));

        let engines = manager.get_many(["forms", "nope", "tabs"]);
        let names: Vec<_> = engines.iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["forms", "tabs"]);
    }

    #[test]
    fn unregister_and_clear() {
        let mut manager = EngineManager::new(MemoryPrefs::shared());
        manager.register(StubEngine::boxed("tabs", 0, true));
        manager.register(StubEngine::boxed("forms", 0, true));

        assert!(manager.unregister("tabs").is_some());
        assert!(manager.get("tabs").is_none());
        manager.clear();
        assert!(manager.get_all().is_empty());
    }

    #[test]
    fn declined_persisted_as_comma_list() {
        let prefs = MemoryPrefs::shared();
        let mut manager = EngineManager::new(prefs.clone());
        manager.decline(["tabs", "forms"]);
        assert!(manager.is_declined("tabs"));
        assert_eq!(prefs.get_str(DECLINED_PREF).as_deref(), Some("forms,tabs"));

        manager.undecline(["tabs"]);
        assert_eq!(manager.get_declined(), vec!["forms".to_string()]);

        let restored = EngineManager::new(prefs.clone());
        assert!(restored.is_declined("forms"));
        assert!(!restored.is_declined("tabs"));

        manager.set_declined(Vec::<String>::new());
        assert_eq!(prefs.get_str(DECLINED_PREF).as_deref(), Some(""));
    }

    #[test]
    fn decline_disabled_engines() {
        let mut manager = EngineManager::new(MemoryPrefs::shared());
        manager.register(StubEngine::boxed("tabs", 0, true));
        manager.register(StubEngine::boxed("forms", 0, false));

        manager.decline_disabled();
        assert_eq!(manager.get_declined(), vec!["forms".to_string()]);
    }

    #[test]
    fn get_mut_toggles_enabled() {
        let mut manager = EngineManager::new(MemoryPrefs::shared());
        manager.register(StubEngine::boxed("tabs", 0, true));
        manager.get_mut("tabs").unwrap().set_enabled(false);
        assert!(manager.get_enabled().is_empty());
    }
}
