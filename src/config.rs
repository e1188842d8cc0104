use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::EcsError;
use crate::model::Target;

pub const CONFIG_ENV: &str = "ECS_CONFIG";

/// Named targets in insertion order plus the name of the active one.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ContextRegistry {
    #[serde(default, rename = "current-context")]
    active: String,
    #[serde(default, with = "ordered_targets")]
    contexts: Vec<Target>,
}

impl ContextRegistry {
    pub fn active_name(&self) -> &str {
        &self.active
    }

    pub fn targets(&self) -> &[Target] {
        &self.contexts
    }

    pub fn get(&self, name: &str) -> Option<&Target> {
        self.contexts.iter().find(|target| target.name == name)
    }

    pub fn set_target(&mut self, target: Target) -> Result<(), EcsError> {
        validate_target(&target)?;
        let name = target.name.clone();
        match self.contexts.iter_mut().find(|existing| existing.name == name) {
            Some(existing) => *existing = target,
            None => self.contexts.push(target),
        }
        self.active = name;
        Ok(())
    }

    pub fn active(&self) -> Result<Target, EcsError> {
        if self.active.is_empty() {
            return Err(EcsError::NoActiveContext);
        }
        self.get(&self.active)
            .cloned()
            .ok_or_else(|| EcsError::not_found("context", self.active.clone()))
    }

    pub fn list_all(&self) -> (Vec<Target>, String) {
        (self.targets().to_vec(), self.active_name().to_string())
    }

    pub fn use_target(&mut self, name: &str) -> Result<(), EcsError> {
        if self.get(name).is_none() {
            return Err(EcsError::not_found("context", name));
        }
        self.active = name.to_string();
        Ok(())
    }

    pub fn delete(&mut self, name: &str) -> Result<(), EcsError> {
        let Some(index) = self.contexts.iter().position(|target| target.name == name) else {
            return Err(EcsError::not_found("context", name));
        };
        self.contexts.remove(index);
        if self.active == name {
            self.active.clear();
        }
        Ok(())
    }

    pub fn view(&self) -> String {
        let mut out = format!("current-context: {}\n\ncontexts:\n", self.active);
        for target in &self.contexts {
            let _ = write!(
                out,
                "\n{}:\n  cluster: {}\n  profile: {}\n  region: {}\n",
                target.name, target.cluster, target.profile, target.region
            );
        }
        out
    }
}

fn validate_target(target: &Target) -> Result<(), EcsError> {
    if target.name.trim().is_empty() {
        return Err(EcsError::Validation(
            "context name cannot be empty".to_string(),
        ));
    }
    if target.cluster.trim().is_empty() {
        return Err(EcsError::Validation(
            "cluster name cannot be empty".to_string(),
        ));
    }
    Ok(())
}

/// File-backed registry. Every mutation is a full load, modify, write; edits
/// made by another process between the load and the write are overwritten.
#[derive(Debug, Clone)]
pub struct ContextStore {
    path: PathBuf,
}

impl ContextStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn discover(explicit: Option<PathBuf>) -> Result<Self, EcsError> {
        discover_config_path(explicit).map(Self::new)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<ContextRegistry, EcsError> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no context registry yet");
            return Ok(ContextRegistry::default());
        }

        let raw = fs::read_to_string(&self.path)
            .map_err(|error| EcsError::registry(&self.path, error))?;
        if raw.trim().is_empty() {
            return Ok(ContextRegistry::default());
        }
        let mut registry: ContextRegistry =
            serde_yaml::from_str(&raw).map_err(|error| EcsError::registry(&self.path, error))?;
        if !registry.active.is_empty() && registry.get(&registry.active).is_none() {
            warn!(active = %registry.active, "active context is missing from registry");
        }
        registry.contexts.retain(|target| !target.name.is_empty());
        Ok(registry)
    }

    pub fn save(&self, registry: &ContextRegistry) -> Result<(), EcsError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|error| EcsError::registry(parent, error))?;
        }

        let raw =
            serde_yaml::to_string(registry).map_err(|error| EcsError::registry(&self.path, error))?;
        let staging = self
            .path
            .with_extension(format!("yaml.{}.tmp", std::process::id()));
        fs::write(&staging, raw).map_err(|error| EcsError::registry(&staging, error))?;
        fs::rename(&staging, &self.path).map_err(|error| {
            let _ = fs::remove_file(&staging);
            EcsError::registry(&self.path, error)
        })
    }

    fn mutate<T>(
        &self,
        change: impl FnOnce(&mut ContextRegistry) -> Result<T, EcsError>,
    ) -> Result<T, EcsError> {
        let mut registry = self.load()?;
        let value = change(&mut registry)?;
        self.save(&registry)?;
        Ok(value)
    }

    pub fn set_target(&self, target: Target) -> Result<(), EcsError> {
        let name = target.name.clone();
        self.mutate(|registry| registry.set_target(target))?;
        info!(context = %name, "context saved and activated");
        Ok(())
    }

    pub fn active(&self) -> Result<Target, EcsError> {
        self.load()?.active()
    }

    pub fn list_all(&self) -> Result<(Vec<Target>, String), EcsError> {
        Ok(self.load()?.list_all())
    }

    pub fn use_target(&self, name: &str) -> Result<(), EcsError> {
        self.mutate(|registry| registry.use_target(name))?;
        info!(context = %name, "switched context");
        Ok(())
    }

    pub fn delete(&self, name: &str) -> Result<(), EcsError> {
        self.mutate(|registry| registry.delete(name))?;
        info!(context = %name, "deleted context");
        Ok(())
    }
}

fn discover_config_path(explicit: Option<PathBuf>) -> Result<PathBuf, EcsError> {
    if let Some(path) = explicit {
        return Ok(path);
    }

    if let Ok(path) = std::env::var(CONFIG_ENV)
        && !path.trim().is_empty()
    {
        return Ok(PathBuf::from(path));
    }

    let home = dirs::home_dir().ok_or_else(|| {
        EcsError::Validation(format!(
            "could not determine home directory; set {CONFIG_ENV} or pass --config"
        ))
    })?;
    Ok(home.join(".ecs").join("config.yaml"))
}

/// Keeps the `contexts` mapping in file order, keyed by context name.
mod ordered_targets {
    use super::*;

    pub fn serialize<S>(targets: &[Target], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(targets.len()))?;
        for target in targets {
            map.serialize_entry(&target.name, target)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Target>, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_option(OptionalTargets)
    }

    struct OptionalTargets;

    impl<'de> Visitor<'de> for OptionalTargets {
        type Value = Vec<Target>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a mapping of context names to targets")
        }

        fn visit_none<E>(self) -> Result<Self::Value, E> {
            Ok(Vec::new())
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E> {
            Ok(Vec::new())
        }

        fn visit_some<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
        where
            D: Deserializer<'de>,
        {
            deserializer.deserialize_map(self)
        }

        fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut targets: Vec<Target> = Vec::new();
            while let Some((name, mut target)) = access.next_entry::<String, Target>()? {
                target.name = name;
                match targets.iter_mut().find(|existing| existing.name == target.name) {
                    Some(existing) => *existing = target,
                    None => targets.push(target),
                }
            }
            Ok(targets)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ContextRegistry, ContextStore};
    use crate::error::EcsError;
    use crate::model::Target;

    fn target(name: &str, cluster: &str) -> Target {
        Target {
            name: name.to_string(),
            cluster: cluster.to_string(),
            profile: "default".to_string(),
            region: "us-east-1".to_string(),
        }
    }

    #[test]
    fn set_then_active_returns_equal_target() {
        let mut registry = ContextRegistry::default();
        let prod = Target {
            profile: "prod-profile".to_string(),
            region: "us-west-2".to_string(),
            ..target("prod", "production")
        };
        registry.set_target(prod.clone()).unwrap();
        assert_eq!(registry.active().unwrap(), prod);
    }

    #[test]
    fn set_target_rejects_missing_cluster() {
        let mut registry = ContextRegistry::default();
        let error = registry.set_target(target("prod", "")).unwrap_err();
        assert!(matches!(error, EcsError::Validation(_)));
        assert!(registry.targets().is_empty());
        assert_eq!(registry.active_name(), "");
    }

    #[test]
    fn upsert_keeps_insertion_position() {
        let mut registry = ContextRegistry::default();
        registry.set_target(target("a", "one")).unwrap();
        registry.set_target(target("b", "two")).unwrap();
        registry.set_target(target("a", "three")).unwrap();

        let (targets, active) = registry.list_all();
        let names = targets.iter().map(|t| t.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(targets[0].cluster, "three");
        assert_eq!(active, "a");
    }

    #[test]
    fn no_active_context_is_reported() {
        let registry = ContextRegistry::default();
        assert!(matches!(
            registry.active().unwrap_err(),
            EcsError::NoActiveContext
        ));
    }

    #[test]
    fn deleting_active_context_clears_active_name() {
        let mut registry = ContextRegistry::default();
        registry.set_target(target("a", "one")).unwrap();
        registry.set_target(target("b", "two")).unwrap();
        registry.delete("b").unwrap();
        assert_eq!(registry.active_name(), "");
        assert!(matches!(
            registry.active().unwrap_err(),
            EcsError::NoActiveContext
        ));
    }

    #[test]
    fn deleting_other_context_keeps_active_name() {
        let mut registry = ContextRegistry::default();
        registry.set_target(target("a", "one")).unwrap();
        registry.set_target(target("b", "two")).unwrap();
        registry.delete("a").unwrap();
        assert_eq!(registry.active_name(), "b");
    }

    #[test]
    fn use_unknown_context_fails_and_leaves_registry_unchanged() {
        let mut registry = ContextRegistry::default();
        registry.set_target(target("a", "one")).unwrap();
        let before = registry.clone();
        let error = registry.use_target("missing").unwrap_err();
        assert!(matches!(error, EcsError::NotFound { kind: "context", .. }));
        assert_eq!(registry, before);
    }

    #[test]
    fn dangling_active_name_is_not_found() {
        let registry: ContextRegistry = serde_yaml::from_str(
            "current-context: gone\ncontexts:\n  a: {cluster: one}\n",
        )
        .unwrap();
        assert!(matches!(
            registry.active().unwrap_err(),
            EcsError::NotFound { .. }
        ));
    }

    #[test]
    fn store_round_trips_through_yaml_in_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContextStore::new(dir.path().join("nested").join("config.yaml"));

        store.set_target(target("zeta", "one")).unwrap();
        store.set_target(target("alpha", "two")).unwrap();
        store.use_target("zeta").unwrap();

        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(raw.find("zeta:").unwrap() < raw.find("alpha:").unwrap());

        let (targets, active) = store.list_all().unwrap();
        let names = targets.iter().map(|t| t.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["zeta", "alpha"]);
        assert_eq!(active, "zeta");
        assert_eq!(store.active().unwrap(), target("zeta", "one"));
    }

    #[test]
    fn missing_or_empty_file_is_an_empty_registry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let store = ContextStore::new(&path);
        assert_eq!(store.load().unwrap(), ContextRegistry::default());

        std::fs::write(&path, "").unwrap();
        assert_eq!(store.load().unwrap(), ContextRegistry::default());
    }

    #[test]
    fn failed_mutation_does_not_rewrite_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContextStore::new(dir.path().join("config.yaml"));
        store.set_target(target("a", "one")).unwrap();
        let before = std::fs::read_to_string(store.path()).unwrap();

        assert!(store.delete("missing").is_err());
        assert_eq!(std::fs::read_to_string(store.path()).unwrap(), before);
    }

    #[test]
    fn view_lists_every_context() {
        let mut registry = ContextRegistry::default();
        registry.set_target(target("a", "one")).unwrap();
        let view = registry.view();
        assert!(view.starts_with("current-context: a"));
        assert!(view.contains("  cluster: one"));
    }
}
