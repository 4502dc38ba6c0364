//! Schema migration runner.
//!
//! Runs once at store open, before any other component touches storage. The
//! runner inspects the raw document's `schemaVersion` and either passes the
//! store through, upgrades it step by step, or, on any step failure, wipes
//! it and demands a full resync. A half-migrated store is never left behind.

use crate::{
    error::Result, storage::SCHEMA_VERSION_KEY, Error, SchemaVersion, StorageBackend,
};

/// A single migration step function.
///
/// Receives the raw document at version `target - 1` and must leave it in the
/// shape of version `target`. The runner stamps `schemaVersion` itself.
pub type StepFn = fn(&mut serde_json::Value) -> std::result::Result<(), String>;

/// An ordered schema upgrade step.
#[derive(Debug, Clone, Copy)]
pub struct MigrationStep {
    /// Version this step upgrades the document to.
    pub target: SchemaVersion,
    /// The transformation.
    pub apply: StepFn,
}

impl MigrationStep {
    /// Create a step that upgrades the document to `target`.
    pub fn new(target: SchemaVersion, apply: StepFn) -> Self {
        Self { target, apply }
    }
}

/// Runner lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    NotStarted,
    Running,
    Done,
    Failed,
}

impl MigrationState {
    /// Whether the runner has finished; the outbox may not open before this.
    pub fn is_terminal(self) -> bool {
        matches!(self, MigrationState::Done | MigrationState::Failed)
    }
}

/// What the runner did to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// Stored version already matches the code's version (or the store is
    /// empty); nothing was touched.
    AlreadyCurrent,
    /// All steps ran; prior data is intact at the new version.
    Migrated {
        from: SchemaVersion,
        to: SchemaVersion,
    },
    /// A step failed; the store was wiped and the next fetch must be a full
    /// server resync.
    Cleared {
        failed_at: SchemaVersion,
        reason: String,
    },
}

impl MigrationOutcome {
    /// Whether the caller must perform a full resync before incremental use.
    pub fn resync_required(&self) -> bool {
        matches!(self, MigrationOutcome::Cleared { .. })
    }
}

/// Upgrades a persisted store document to the code's schema version.
pub struct MigrationRunner<'a> {
    expected: SchemaVersion,
    steps: &'a [MigrationStep],
    state: MigrationState,
}

impl<'a> MigrationRunner<'a> {
    /// Create a runner for the given code-side schema version and steps.
    pub fn new(expected: SchemaVersion, steps: &'a [MigrationStep]) -> Self {
        Self {
            expected,
            steps,
            state: MigrationState::NotStarted,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> MigrationState {
        self.state
    }

    /// Run the migration against the backend.
    ///
    /// Returns an error only for a store whose version is *newer* than the
    /// code (never clear a store a newer build wrote); every other failure is
    /// recovered by clearing and reported as [`MigrationOutcome::Cleared`].
    pub fn run(&mut self, backend: &mut dyn StorageBackend) -> Result<MigrationOutcome> {
        self.state = MigrationState::Running;

        let Some(mut raw) = backend.load()? else {
            // Empty store: nothing to migrate, first save writes the current
            // version.
            self.state = MigrationState::Done;
            return Ok(MigrationOutcome::AlreadyCurrent);
        };

        let stored = match raw.get(SCHEMA_VERSION_KEY).and_then(|v| v.as_u64()) {
            Some(v) => v as SchemaVersion,
            None => {
                // No readable version: the document predates versioning or is
                // corrupt either way, so it cannot be upgraded in place.
                return self.clear(backend, 0, "schemaVersion missing or not a number".into());
            }
        };

        if stored == self.expected {
            self.state = MigrationState::Done;
            return Ok(MigrationOutcome::AlreadyCurrent);
        }

        if stored > self.expected {
            self.state = MigrationState::Failed;
            return Err(Error::SchemaAhead {
                stored,
                expected: self.expected,
            });
        }

        for version in (stored + 1)..=self.expected {
            let Some(step) = self.steps.iter().find(|s| s.target == version) else {
                return self.clear(backend, version, format!("no step targets version {version}"));
            };

            if let Err(reason) = (step.apply)(&mut raw) {
                return self.clear(backend, version, reason);
            }

            raw[SCHEMA_VERSION_KEY] = serde_json::Value::from(version);
        }

        backend.save(&raw)?;
        self.state = MigrationState::Done;
        Ok(MigrationOutcome::Migrated {
            from: stored,
            to: self.expected,
        })
    }

    // No partial repair: wipe everything and force a full resync.
    fn clear(
        &mut self,
        backend: &mut dyn StorageBackend,
        failed_at: SchemaVersion,
        reason: String,
    ) -> Result<MigrationOutcome> {
        backend.clear()?;
        self.state = MigrationState::Failed;
        Ok(MigrationOutcome::Cleared { failed_at, reason })
    }
}
