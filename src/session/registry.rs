//! Per-project session registry.
//!
//! Concurrency here is between independent launcher *processes* sharing one
//! registry file, not threads. Mutations (register, unregister, status
//! updates, pruning) serialize on an exclusive advisory lock over a sibling
//! lock file. Reads go lock-free and tolerate a momentarily stale view; any
//! entry acted upon is re-validated against live runtime state first.
//!
//! Liveness of an entry means exactly one thing: the runtime reports a
//! running container with the recorded name. Timestamps are informational,
//! with a single exception: a `Starting` entry younger than the grace
//! period is never pruned, so a launcher that has registered but whose
//! container has not appeared yet cannot be raced by a concurrent listing.

use std::fs;
use std::io::Write;

use chrono::Utc;
use fs2::FileExt;
use tracing::{debug, instrument, trace, warn};

use crate::error::RegistryError;
use crate::runtime::ContainerRuntime;
use crate::session::project::ProjectPaths;
use crate::session::record::{Session, SessionId, SessionStatus};

/// Seconds a `Starting` entry is exempt from pruning.
const STARTING_GRACE_SECS: i64 = 60;

/// Project-scoped table of sessions, backed by one JSON file.
#[derive(Debug, Clone)]
pub struct Registry {
    paths: ProjectPaths,
}

/// Held for the duration of a mutation; unlocks on drop.
struct RegistryLock {
    file: fs::File,
}

impl Drop for RegistryLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl Registry {
    /// Creates a registry over the given project paths.
    ///
    /// Nothing is touched on disk until an operation runs.
    #[must_use]
    pub fn new(paths: ProjectPaths) -> Self {
        Self { paths }
    }

    /// Returns the project paths this registry operates on.
    #[must_use]
    pub fn paths(&self) -> &ProjectPaths {
        &self.paths
    }

    /// Registers a session.
    ///
    /// Fails with `DuplicateSession` if an entry with the same
    /// container name is recorded live and the runtime does not confirm it
    /// dead. A same-named entry that is provably dead (or already stopped)
    /// is replaced instead. On error the registry file is left untouched.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::DuplicateSession` on a live name collision,
    /// or `RegistryError::LockFailed`/`IoError` on filesystem failure.
    #[instrument(skip(self, session, runtime), fields(container = %session.container_name))]
    pub fn register(
        &self,
        session: &Session,
        runtime: &dyn ContainerRuntime,
    ) -> Result<(), RegistryError> {
        let _guard = self.lock()?;
        let mut records = self.load()?;

        let mut duplicate = None;
        records.retain(|existing| {
            if existing.container_name != session.container_name {
                return true;
            }
            if existing.may_be_live() && !confirmed_dead(existing, runtime) {
                duplicate = Some(existing.container_name.clone());
                true
            } else {
                // Stale record under the same name; replace it.
                debug!(id = %existing.id, "Dropping stale record with colliding container name");
                false
            }
        });

        if let Some(container_name) = duplicate {
            return Err(RegistryError::DuplicateSession { container_name });
        }

        records.push(session.clone());
        self.save(&records)?;
        debug!(id = %session.id, "Session registered");
        Ok(())
    }

    /// Lists sessions for this project, most recent first.
    ///
    /// Entries whose container the runtime confirms dead are pruned as a
    /// side effect. The initial read is lock-free; pruning takes the lock
    /// and re-validates each candidate before removing it.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError` on filesystem failure.
    #[instrument(skip(self, runtime))]
    pub fn list(&self, runtime: &dyn ContainerRuntime) -> Result<Vec<Session>, RegistryError> {
        let records = self.load()?;

        let dead: Vec<SessionId> = records
            .iter()
            .filter(|r| confirmed_dead(r, runtime))
            .map(|r| r.id)
            .collect();

        let mut survivors = if dead.is_empty() {
            records
        } else {
            let _guard = self.lock()?;
            let mut current = self.load()?;
            let before = current.len();
            current.retain(|r| !(dead.contains(&r.id) && confirmed_dead(r, runtime)));
            if current.len() != before {
                debug!(pruned = before - current.len(), "Pruned dead sessions");
                self.save(&current)?;
            }
            current
        };

        survivors.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        trace!(count = survivors.len(), "Listed sessions");
        Ok(survivors)
    }

    /// Removes a session by ID. Idempotent; a missing ID is not an error.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError` on filesystem failure.
    #[instrument(skip(self), fields(%id))]
    pub fn unregister(&self, id: SessionId) -> Result<(), RegistryError> {
        let _guard = self.lock()?;
        let mut records = self.load()?;
        let before = records.len();
        records.retain(|r| r.id != id);

        if records.len() == before {
            debug!("Session not present, nothing to unregister");
            return Ok(());
        }

        self.save(&records)?;
        debug!("Session unregistered");
        Ok(())
    }

    /// Updates the status of a session, if it is still registered.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError` on filesystem failure.
    #[instrument(skip(self), fields(%id, %status))]
    pub fn set_status(&self, id: SessionId, status: SessionStatus) -> Result<(), RegistryError> {
        let _guard = self.lock()?;
        let mut records = self.load()?;

        let Some(record) = records.iter_mut().find(|r| r.id == id) else {
            debug!("Session not present, status not updated");
            return Ok(());
        };

        record.status = status;
        self.save(&records)?;
        trace!("Session status updated");
        Ok(())
    }

    /// Takes the exclusive advisory lock, creating the project directory
    /// and lock file if needed. Blocks until the lock is available.
    fn lock(&self) -> Result<RegistryLock, RegistryError> {
        self.paths.create_directories()?;

        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.paths.lock_file)
            .map_err(|e| RegistryError::LockFailed {
                path: self.paths.lock_file.clone(),
                source: e,
            })?;

        file.lock_exclusive().map_err(|e| RegistryError::LockFailed {
            path: self.paths.lock_file.clone(),
            source: e,
        })?;

        Ok(RegistryLock { file })
    }

    /// Loads all records. A missing file is an empty registry; an
    /// unparseable file is quarantined and treated as empty.
    fn load(&self) -> Result<Vec<Session>, RegistryError> {
        let path = &self.paths.registry_file;
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(path).map_err(|e| RegistryError::IoError {
            context: format!("failed to read registry: {}", path.display()),
            source: e,
        })?;

        match serde_json::from_str(&content) {
            Ok(records) => Ok(records),
            Err(e) => {
                let quarantine = path.with_extension("json.corrupt");
                warn!(
                    error = %e,
                    quarantine = %quarantine.display(),
                    "Registry file corrupted, quarantining and starting empty"
                );
                fs::rename(path, &quarantine).map_err(|e| RegistryError::IoError {
                    context: format!("failed to quarantine corrupt registry: {}", path.display()),
                    source: e,
                })?;
                Ok(Vec::new())
            }
        }
    }

    /// Saves all records atomically: temp file in the same directory,
    /// fsync, rename over the registry file.
    fn save(&self, records: &[Session]) -> Result<(), RegistryError> {
        let path = &self.paths.registry_file;
        let json = serde_json::to_string_pretty(records).map_err(|e| RegistryError::IoError {
            context: "failed to serialize registry".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;

        let temp_path = path.with_extension("json.tmp");

        let mut file = fs::File::create(&temp_path).map_err(|e| RegistryError::IoError {
            context: format!("failed to create temp registry file: {}", temp_path.display()),
            source: e,
        })?;

        file.write_all(json.as_bytes())
            .map_err(|e| RegistryError::IoError {
                context: format!("failed to write registry: {}", temp_path.display()),
                source: e,
            })?;

        file.sync_all().map_err(|e| RegistryError::IoError {
            context: "failed to sync registry file".to_string(),
            source: e,
        })?;

        fs::rename(&temp_path, path).map_err(|e| RegistryError::IoError {
            context: format!(
                "failed to rename temp file {} to {}",
                temp_path.display(),
                path.display()
            ),
            source: e,
        })?;

        Ok(())
    }
}

/// True iff the runtime positively confirms this entry's container dead.
///
/// Query errors keep the entry (prune only on confirmation). A `Starting`
/// entry inside the grace window is never confirmable; its container may
/// simply not have appeared yet.
fn confirmed_dead(record: &Session, runtime: &dyn ContainerRuntime) -> bool {
    if record.status == SessionStatus::Starting {
        let age = Utc::now().signed_duration_since(record.started_at);
        if age.num_seconds() < STARTING_GRACE_SECS {
            return false;
        }
    }

    match runtime.container_running(&record.container_name) {
        Ok(running) => !running,
        Err(e) => {
            warn!(
                container = %record.container_name,
                error = %e,
                "Liveness query failed, keeping entry"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::Mutex;

    use uuid::Uuid;

    use crate::error::RuntimeError;
    use crate::runtime::{ImageBuild, RunSpec};
    use crate::session::project::ProjectKey;

    struct FakeRuntime {
        running: Mutex<HashSet<String>>,
    }

    impl FakeRuntime {
        fn new() -> Self {
            Self {
                running: Mutex::new(HashSet::new()),
            }
        }

        fn set_running(&self, name: &str) {
            self.running.lock().unwrap().insert(name.to_string());
        }

        fn set_stopped(&self, name: &str) {
            self.running.lock().unwrap().remove(name);
        }
    }

    impl ContainerRuntime for FakeRuntime {
        fn name(&self) -> &str {
            "fake"
        }

        fn image_exists(&self, _image: &str) -> Result<bool, RuntimeError> {
            Ok(true)
        }

        fn build_image(&self, _build: &ImageBuild) -> Result<(), RuntimeError> {
            Ok(())
        }

        fn container_running(&self, container_name: &str) -> Result<bool, RuntimeError> {
            Ok(self.running.lock().unwrap().contains(container_name))
        }

        fn run(&self, spec: &RunSpec, on_started: &mut dyn FnMut()) -> Result<i32, RuntimeError> {
            self.set_running(&spec.container_name);
            on_started();
            Ok(0)
        }
    }

    fn test_registry() -> Registry {
        let base = std::env::temp_dir()
            .join("ssm-test-registry")
            .join(Uuid::new_v4().to_string());
        let key = ProjectKey::derive(Path::new("/home/dev/widget"));
        Registry::new(ProjectPaths::new(&base, &key))
    }

    fn test_session() -> Session {
        let key = ProjectKey::derive(Path::new("/home/dev/widget"));
        Session::new(key, Vec::new())
    }

    fn cleanup(registry: &Registry) {
        if let Some(base) = registry.paths().root.parent().and_then(|p| p.parent()) {
            let _ = fs::remove_dir_all(base);
        }
    }

    #[test]
    fn test_register_then_list() {
        let registry = test_registry();
        let runtime = FakeRuntime::new();
        let session = test_session();

        registry
            .register(&session, &runtime)
            .expect("register failed");

        let listed = registry.list(&runtime).expect("list failed");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, session.id);

        cleanup(&registry);
    }

    #[test]
    fn test_unregister_idempotent() {
        let registry = test_registry();
        let runtime = FakeRuntime::new();
        let session = test_session();

        registry
            .register(&session, &runtime)
            .expect("register failed");
        registry.unregister(session.id).expect("first unregister");
        registry.unregister(session.id).expect("second unregister");
        registry
            .unregister(Uuid::new_v4())
            .expect("unknown id unregister");

        assert!(registry.list(&runtime).expect("list").is_empty());

        cleanup(&registry);
    }

    #[test]
    fn test_duplicate_rejected_while_starting() {
        let registry = test_registry();
        let runtime = FakeRuntime::new();
        let session = test_session();

        registry
            .register(&session, &runtime)
            .expect("register failed");

        // Same container name, fresh Starting entry: inside the grace
        // window this cannot be confirmed dead, so it must be rejected.
        let result = registry.register(&session, &runtime);
        match result {
            Err(RegistryError::DuplicateSession { container_name }) => {
                assert_eq!(container_name, session.container_name);
            }
            other => panic!("expected DuplicateSession, got {:?}", other),
        }

        cleanup(&registry);
    }

    #[test]
    fn test_duplicate_rejected_while_running() {
        let registry = test_registry();
        let runtime = FakeRuntime::new();
        let mut session = test_session();
        session.status = SessionStatus::Running;
        runtime.set_running(&session.container_name);

        registry
            .register(&session, &runtime)
            .expect("register failed");

        let result = registry.register(&session, &runtime);
        assert!(matches!(
            result,
            Err(RegistryError::DuplicateSession { .. })
        ));

        cleanup(&registry);
    }

    #[test]
    fn test_stale_record_replaced_on_register() {
        let registry = test_registry();
        let runtime = FakeRuntime::new();

        // Recorded Running, but the runtime does not know the container.
        let mut stale = test_session();
        stale.status = SessionStatus::Running;
        registry.register(&stale, &runtime).expect("register stale");
        runtime.set_stopped(&stale.container_name);

        // Re-registering the same container name succeeds and replaces.
        let replacement = Session {
            id: Uuid::new_v4(),
            ..stale.clone()
        };
        registry
            .register(&replacement, &runtime)
            .expect("replacement register failed");

        runtime.set_running(&replacement.container_name);
        let listed = registry.list(&runtime).expect("list failed");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, replacement.id);

        cleanup(&registry);
    }

    #[test]
    fn test_list_prunes_dead_running() {
        let registry = test_registry();
        let runtime = FakeRuntime::new();

        let mut dead = test_session();
        dead.status = SessionStatus::Running;
        let mut live = test_session();
        live.status = SessionStatus::Running;

        registry.register(&dead, &runtime).expect("register dead");
        registry.register(&live, &runtime).expect("register live");
        runtime.set_running(&live.container_name);

        let listed = registry.list(&runtime).expect("list failed");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, live.id);

        // Pruning persisted: a fresh list without runtime changes agrees.
        let again = registry.list(&runtime).expect("second list failed");
        assert_eq!(again.len(), 1);

        cleanup(&registry);
    }

    #[test]
    fn test_starting_grace_protects_fresh_entries() {
        let registry = test_registry();
        let runtime = FakeRuntime::new();

        // Fresh Starting entry, container not yet visible: kept.
        let fresh = test_session();
        registry.register(&fresh, &runtime).expect("register fresh");
        let listed = registry.list(&runtime).expect("list failed");
        assert_eq!(listed.len(), 1);

        // Same entry aged past the grace window: pruned.
        let mut aged = fresh.clone();
        aged.started_at = Utc::now() - chrono::Duration::seconds(STARTING_GRACE_SECS + 10);
        registry.unregister(fresh.id).expect("unregister");
        registry.register(&aged, &runtime).expect("register aged");

        let listed = registry.list(&runtime).expect("list failed");
        assert!(listed.is_empty());

        cleanup(&registry);
    }

    #[test]
    fn test_list_most_recent_first() {
        let registry = test_registry();
        let runtime = FakeRuntime::new();

        let mut older = test_session();
        older.started_at = Utc::now() - chrono::Duration::seconds(30);
        let newer = test_session();

        registry.register(&older, &runtime).expect("register older");
        registry.register(&newer, &runtime).expect("register newer");

        let listed = registry.list(&runtime).expect("list failed");
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, newer.id);
        assert_eq!(listed[1].id, older.id);

        cleanup(&registry);
    }

    #[test]
    fn test_set_status() {
        let registry = test_registry();
        let runtime = FakeRuntime::new();
        let session = test_session();

        registry
            .register(&session, &runtime)
            .expect("register failed");
        registry
            .set_status(session.id, SessionStatus::Running)
            .expect("set_status failed");
        runtime.set_running(&session.container_name);

        let listed = registry.list(&runtime).expect("list failed");
        assert_eq!(listed[0].status, SessionStatus::Running);

        // Unknown IDs are a no-op.
        registry
            .set_status(Uuid::new_v4(), SessionStatus::Failed)
            .expect("set_status on unknown id");

        cleanup(&registry);
    }

    #[test]
    fn test_corrupt_registry_quarantined() {
        let registry = test_registry();
        let runtime = FakeRuntime::new();

        registry.paths().create_directories().expect("create dirs");
        fs::write(&registry.paths().registry_file, "{not json").expect("write corrupt");

        let listed = registry.list(&runtime).expect("list failed");
        assert!(listed.is_empty());
        assert!(registry
            .paths()
            .registry_file
            .with_extension("json.corrupt")
            .exists());

        // The registry is usable again afterwards.
        let session = test_session();
        registry
            .register(&session, &runtime)
            .expect("register after quarantine");

        cleanup(&registry);
    }
}
