//! Versioned data migration for persisted extra-configuration.
//!
//! Records written by older releases are upgraded on read: every plugin
//! registered for the record's target with a version above the record's
//! stored version is applied in ascending order, rewriting the raw map
//! before it is decoded.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::keys::{APPLIANCE_VERSION_KEY, CONTAINER_VERSION_KEY};

/// Upper bound on registrable plugin versions.
pub const MAX_PLUGIN_VERSION: i32 = 100;

/// Renaming a container rewrites identity keys that plugins before this
/// version did not maintain, so rename is refused for older records.
pub const RENAME_SUPPORTED_VERSION: i32 = 1;

/// Which kind of record a plugin migrates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    Appliance,
    Container,
}

impl Target {
    /// Key within the record holding its migration version.
    #[must_use]
    pub fn version_key(self) -> &'static str {
        match self {
            Target::Appliance => APPLIANCE_VERSION_KEY,
            Target::Container => CONTAINER_VERSION_KEY,
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Target::Appliance => "appliance",
            Target::Container => "container",
        })
    }
}

/// A single migration step.
pub trait Plugin: Send + Sync {
    /// Rewrites `data` in place from the previous version to this one.
    ///
    /// # Errors
    /// Any error aborts the migration chain; the map is left as this
    /// plugin found it plus whatever partial writes it made.
    fn migrate(&self, data: &mut BTreeMap<String, String>) -> Result<(), String>;
}

/// Errors from registration and migration.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("plugin version {version} for target {target} already registered")]
    DuplicateVersion { target: Target, version: i32 },

    #[error("plugin version {version} exceeds maximum {MAX_PLUGIN_VERSION}")]
    VersionTooHigh { version: i32 },

    #[error("plugin version {version} must be positive")]
    VersionNotPositive { version: i32 },

    /// `applied` is the highest version that completed before the failure.
    #[error("migration to version {failed} failed after reaching {applied}: {detail}")]
    PluginFailed {
        failed: i32,
        applied: i32,
        detail: String,
    },
}

impl MigrationError {
    /// The version the record actually reached.
    #[must_use]
    pub fn applied_version(&self) -> i32 {
        match self {
            MigrationError::PluginFailed { applied, .. } => *applied,
            _ => 0,
        }
    }
}

impl From<MigrationError> for berth_core::CoreError {
    fn from(e: MigrationError) -> Self {
        berth_core::CoreError::MigrationFailed {
            version: e.applied_version(),
            detail: e.to_string(),
        }
    }
}

/// Registry of migration plugins, ordered by version within each target.
#[derive(Default)]
pub struct MigrationManager {
    targets: HashMap<Target, BTreeMap<i32, Arc<dyn Plugin>>>,
}

impl MigrationManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `plugin` as the step up to `version` for `target`.
    ///
    /// # Errors
    /// Rejects non-positive versions, versions above
    /// [`MAX_PLUGIN_VERSION`], and duplicate versions per target.
    pub fn register(
        &mut self,
        target: Target,
        version: i32,
        plugin: Arc<dyn Plugin>,
    ) -> Result<(), MigrationError> {
        if version <= 0 {
            return Err(MigrationError::VersionNotPositive { version });
        }
        if version > MAX_PLUGIN_VERSION {
            return Err(MigrationError::VersionTooHigh { version });
        }
        let chain = self.targets.entry(target).or_default();
        if chain.contains_key(&version) {
            return Err(MigrationError::DuplicateVersion { target, version });
        }
        chain.insert(version, plugin);
        Ok(())
    }

    /// Latest registered version for `target`, or 0 when none.
    #[must_use]
    pub fn latest_version(&self, target: Target) -> i32 {
        self.targets
            .get(&target)
            .and_then(|chain| chain.keys().next_back().copied())
            .unwrap_or(0)
    }

    /// Applies every plugin above `current_version` in ascending order,
    /// then stamps the target's version key with the version reached.
    ///
    /// # Errors
    /// On plugin failure returns [`MigrationError::PluginFailed`] carrying
    /// the last version that applied cleanly; `data` is left partially
    /// migrated and unstamped.
    pub fn migrate(
        &self,
        target: Target,
        current_version: i32,
        data: &mut BTreeMap<String, String>,
    ) -> Result<i32, MigrationError> {
        let Some(chain) = self.targets.get(&target) else {
            return Ok(current_version);
        };

        let mut applied = current_version;
        for (&version, plugin) in chain.range(current_version + 1..) {
            tracing::debug!(%target, version, "applying migration");
            plugin
                .migrate(data)
                .map_err(|detail| MigrationError::PluginFailed {
                    failed: version,
                    applied,
                    detail,
                })?;
            applied = version;
        }

        if applied != current_version {
            data.insert(target.version_key().to_owned(), applied.to_string());
        }
        Ok(applied)
    }

    /// Whether `data_version` is older than the latest registered version.
    #[must_use]
    pub fn needs_migration(&self, target: Target, data_version: i32) -> bool {
        data_version < self.latest_version(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingPlugin {
        tag: &'static str,
    }

    impl Plugin for RecordingPlugin {
        fn migrate(&self, data: &mut BTreeMap<String, String>) -> Result<(), String> {
            let log = data.entry("log".to_owned()).or_default();
            log.push_str(self.tag);
            Ok(())
        }
    }

    struct FailingPlugin;

    impl Plugin for FailingPlugin {
        fn migrate(&self, _data: &mut BTreeMap<String, String>) -> Result<(), String> {
            Err("boom".to_owned())
        }
    }

    fn manager_with(versions: &[(&'static str, i32)]) -> MigrationManager {
        let mut m = MigrationManager::new();
        for &(tag, version) in versions {
            m.register(Target::Container, version, Arc::new(RecordingPlugin { tag }))
                .expect("register");
        }
        m
    }

    #[test]
    fn plugins_apply_in_ascending_version_order() {
        // Registered out of order on purpose.
        let m = manager_with(&[("c", 3), ("a", 1), ("b", 2)]);
        let mut data = BTreeMap::new();
        let applied = m.migrate(Target::Container, 0, &mut data).expect("migrate");
        assert_eq!(applied, 3);
        assert_eq!(data.get("log").map(String::as_str), Some("abc"));
    }

    #[test]
    fn only_versions_above_current_apply() {
        let m = manager_with(&[("a", 1), ("b", 2), ("c", 3)]);
        let mut data = BTreeMap::new();
        let applied = m.migrate(Target::Container, 2, &mut data).expect("migrate");
        assert_eq!(applied, 3);
        assert_eq!(data.get("log").map(String::as_str), Some("c"));
    }

    #[test]
    fn version_key_is_stamped_after_migration() {
        let m = manager_with(&[("a", 2)]);
        let mut data = BTreeMap::new();
        m.migrate(Target::Container, 0, &mut data).expect("migrate");
        assert_eq!(
            data.get(CONTAINER_VERSION_KEY).map(String::as_str),
            Some("2")
        );
    }

    #[test]
    fn up_to_date_record_is_untouched() {
        let m = manager_with(&[("a", 1)]);
        let mut data = BTreeMap::new();
        let applied = m.migrate(Target::Container, 1, &mut data).expect("migrate");
        assert_eq!(applied, 1);
        assert!(data.is_empty(), "no-op migration must not write keys");
    }

    #[test]
    fn failure_reports_last_clean_version() {
        let mut m = manager_with(&[("a", 1)]);
        m.register(Target::Container, 2, Arc::new(FailingPlugin))
            .expect("register");
        let mut data = BTreeMap::new();
        match m.migrate(Target::Container, 0, &mut data) {
            Err(MigrationError::PluginFailed {
                failed,
                applied,
                detail,
            }) => {
                assert_eq!(failed, 2);
                assert_eq!(applied, 1);
                assert_eq!(detail, "boom");
            }
            other => panic!("expected PluginFailed, got {other:?}"),
        }
        // v1 ran, the version key was not stamped.
        assert_eq!(data.get("log").map(String::as_str), Some("a"));
        assert!(!data.contains_key(CONTAINER_VERSION_KEY));
    }

    #[test]
    fn duplicate_version_rejected_per_target() {
        let mut m = manager_with(&[("a", 1)]);
        let dup = m.register(Target::Container, 1, Arc::new(RecordingPlugin { tag: "x" }));
        assert!(matches!(dup, Err(MigrationError::DuplicateVersion { .. })));
        // The same version for a different target is fine.
        m.register(Target::Appliance, 1, Arc::new(RecordingPlugin { tag: "x" }))
            .expect("other target");
    }

    #[test]
    fn version_bounds_enforced() {
        let mut m = MigrationManager::new();
        assert!(matches!(
            m.register(Target::Container, 0, Arc::new(FailingPlugin)),
            Err(MigrationError::VersionNotPositive { .. })
        ));
        assert!(matches!(
            m.register(Target::Container, MAX_PLUGIN_VERSION + 1, Arc::new(FailingPlugin)),
            Err(MigrationError::VersionTooHigh { .. })
        ));
    }

    #[test]
    fn targets_use_distinct_version_keys() {
        let mut m = MigrationManager::new();
        m.register(Target::Appliance, 5, Arc::new(RecordingPlugin { tag: "a" }))
            .expect("register");
        let mut data = BTreeMap::new();
        m.migrate(Target::Appliance, 0, &mut data).expect("migrate");
        assert_eq!(data.get(APPLIANCE_VERSION_KEY).map(String::as_str), Some("5"));
        assert!(!data.contains_key(CONTAINER_VERSION_KEY));
    }

    #[test]
    fn latest_version_defaults_to_zero() {
        let m = MigrationManager::new();
        assert_eq!(m.latest_version(Target::Container), 0);
        assert!(!m.needs_migration(Target::Container, 0));
    }
}
