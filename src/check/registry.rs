//! In-memory registry of active check definitions, backed by the store.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;
use tokio::sync::broadcast;

use super::{CheckDefinition, CheckKind, CheckRequest, Placement, ValidationError};
use crate::db::{DbError, Store};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("check {0} not found")]
    NotFound(i64),
    #[error(transparent)]
    Db(#[from] DbError),
}

/// Change notifications for the scheduler.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// Created, edited, re-enabled, disabled or moved.
    Upserted(Arc<CheckDefinition>),
    Removed(i64),
}

/// Read-mostly map of check id to its single active definition.
///
/// Writes hold the map lock across the store write so the map and the
/// database never disagree about which definition is current.
pub struct Registry {
    store: Arc<Store>,
    checks: RwLock<HashMap<i64, Arc<CheckDefinition>>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Registry {
    /// Load every non-deleted check from the store.
    pub fn load(store: Arc<Store>) -> Result<Self, DbError> {
        let checks = store
            .get_checks()?
            .into_iter()
            .map(|def| (def.id, Arc::new(def)))
            .collect::<HashMap<_, _>>();
        tracing::info!("Registry: loaded {} checks", checks.len());
        let (events, _) = broadcast::channel(1024);
        Ok(Self {
            store,
            checks: RwLock::new(checks),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub fn get(&self, id: i64) -> Option<Arc<CheckDefinition>> {
        self.read().get(&id).cloned()
    }

    /// All active checks ordered by id.
    pub fn list(&self) -> Vec<Arc<CheckDefinition>> {
        let mut all: Vec<_> = self.read().values().cloned().collect();
        all.sort_by_key(|d| d.id);
        all
    }

    pub fn list_kind(&self, kind: CheckKind) -> Vec<Arc<CheckDefinition>> {
        self.list().into_iter().filter(|d| d.kind() == kind).collect()
    }

    /// Checks whose placement names exactly `placement`.
    fn count_placed(&self, placement: Placement) -> usize {
        self.read().values().filter(|d| d.placement == placement).count()
    }

    /// Checks pinned to a single agent.
    pub fn count_on_agent(&self, agent_id: i64) -> usize {
        self.count_placed(Placement::Agent(agent_id))
    }

    pub fn count_in_region(&self, region_id: i64) -> usize {
        self.count_placed(Placement::Region(region_id))
    }

    pub fn count_in_country(&self, country_id: i64) -> usize {
        self.count_placed(Placement::Country(country_id))
    }

    pub fn create(&self, req: CheckRequest) -> Result<Arc<CheckDefinition>, RegistryError> {
        let mut def = req.into_definition(0, None)?;
        self.check_references(&def)?;

        let mut checks = self.write();
        def.id = self.store.insert_check(&def)?;
        let def = Arc::new(def);
        checks.insert(def.id, def.clone());
        drop(checks);

        tracing::info!("Registry: created {} check {} ({})", def.kind(), def.id, def.name);
        self.emit(RegistryEvent::Upserted(def.clone()));
        Ok(def)
    }

    /// Replace a definition. The kind of an existing check cannot change.
    pub fn update(
        &self,
        id: i64,
        req: CheckRequest,
    ) -> Result<Arc<CheckDefinition>, RegistryError> {
        let existing = self.get(id).ok_or(RegistryError::NotFound(id))?;
        let def = req.into_definition(id, Some(existing.created_at))?;
        if def.kind() != existing.kind() {
            return Err(RegistryError::NotFound(id));
        }
        self.check_references(&def)?;
        self.replace(def)
    }

    pub fn set_enabled(&self, id: i64, enabled: bool) -> Result<Arc<CheckDefinition>, RegistryError> {
        let existing = self.get(id).ok_or(RegistryError::NotFound(id))?;
        if existing.enabled == enabled {
            return Ok(existing);
        }
        let mut def = (*existing).clone();
        def.enabled = enabled;
        def.updated_at = chrono::Utc::now();
        self.replace(def)
    }

    /// Soft delete. History stays queryable.
    pub fn delete(&self, id: i64) -> Result<(), RegistryError> {
        let mut checks = self.write();
        if !checks.contains_key(&id) {
            return Err(RegistryError::NotFound(id));
        }
        self.store.delete_check(id)?;
        checks.remove(&id);
        drop(checks);

        tracing::info!("Registry: deleted check {}", id);
        self.emit(RegistryEvent::Removed(id));
        Ok(())
    }

    /// Reassign every check pinned to `from` onto `to`. Returns the count moved.
    pub fn move_checks(&self, from: i64, to: i64) -> Result<usize, RegistryError> {
        self.store.get_agent(to).map_err(|e| match e {
            DbError::NotFound => RegistryError::Validation(ValidationError::MissingReference("agent", to)),
            other => RegistryError::Db(other),
        })?;
        if from == to {
            return Ok(0);
        }

        let pinned: Vec<Arc<CheckDefinition>> = self
            .list()
            .into_iter()
            .filter(|d| d.placement == Placement::Agent(from))
            .collect();

        let mut moved = 0;
        for existing in pinned {
            let mut def = (*existing).clone();
            def.placement = Placement::Agent(to);
            def.updated_at = chrono::Utc::now();
            self.replace(def)?;
            moved += 1;
        }
        tracing::info!("Registry: moved {} checks from agent {} to {}", moved, from, to);
        Ok(moved)
    }

    fn replace(&self, def: CheckDefinition) -> Result<Arc<CheckDefinition>, RegistryError> {
        let mut checks = self.write();
        if !checks.contains_key(&def.id) {
            return Err(RegistryError::NotFound(def.id));
        }
        self.store.update_check(&def)?;
        let def = Arc::new(def);
        checks.insert(def.id, def.clone());
        drop(checks);

        self.emit(RegistryEvent::Upserted(def.clone()));
        Ok(def)
    }

    fn check_references(&self, def: &CheckDefinition) -> Result<(), RegistryError> {
        let placement = match def.placement {
            Placement::Agent(id) => Some(("agent", id, self.store.get_agent(id).map(|_| ()))),
            Placement::Region(id) => Some(("region", id, self.store.get_region(id).map(|_| ()))),
            Placement::Country(id) => Some(("country", id, self.store.get_country(id).map(|_| ()))),
            Placement::All => None,
        };
        match placement {
            None | Some((_, _, Ok(()))) => {}
            Some((entity, id, Err(DbError::NotFound))) => {
                return Err(ValidationError::MissingReference(entity, id).into())
            }
            Some((_, _, Err(e))) => return Err(e.into()),
        }

        for channel_id in def.channels.channel_ids() {
            match self.store.get_channel(channel_id) {
                Ok(_) => {}
                Err(DbError::NotFound) => {
                    return Err(ValidationError::MissingReference("channel", channel_id).into())
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn emit(&self, event: RegistryEvent) {
        // No receivers yet during startup.
        let _ = self.events.send(event);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<i64, Arc<CheckDefinition>>> {
        self.checks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<i64, Arc<CheckDefinition>>> {
        self.checks.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Agent;
    use tempfile::NamedTempFile;

    fn registry() -> (NamedTempFile, Arc<Store>, Registry) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let reg = Registry::load(store.clone()).unwrap();
        (tmp, store, reg)
    }

    fn add_agent(store: &Store, name: &str) -> i64 {
        let mut agent = Agent {
            id: 0,
            name: name.to_string(),
            description: String::new(),
            server: "127.0.0.1".to_string(),
            port: 5101,
            enabled: true,
            shared: false,
            region_id: None,
        };
        store.add_agent(&mut agent).unwrap()
    }

    fn tcp_request(body: &str) -> CheckRequest {
        CheckRequest::parse(CheckKind::Tcp, body.as_bytes()).unwrap()
    }

    #[test]
    fn test_create_update_delete() {
        let (_tmp, store, reg) = registry();
        let agent = add_agent(&store, "a1");
        let mut events = reg.subscribe();

        let def = reg
            .create(tcp_request(&format!(
                r#"{{"name":"db","ip":"10.0.0.1","port":5432,"agent_id":{}}}"#,
                agent
            )))
            .unwrap();
        assert!(def.id > 0);
        assert!(matches!(events.try_recv(), Ok(RegistryEvent::Upserted(_))));

        let updated = reg
            .update(
                def.id,
                tcp_request(&format!(
                    r#"{{"name":"db2","ip":"10.0.0.1","port":5432,"agent_id":{}}}"#,
                    agent
                )),
            )
            .unwrap();
        assert_eq!(updated.name, "db2");
        assert_eq!(updated.created_at, def.created_at);
        assert_eq!(reg.list().len(), 1);

        reg.delete(def.id).unwrap();
        assert!(reg.get(def.id).is_none());
        assert!(matches!(reg.delete(def.id), Err(RegistryError::NotFound(_))));

        // A reload sees the soft delete.
        let reloaded = Registry::load(store).unwrap();
        assert!(reloaded.list().is_empty());
    }

    #[test]
    fn test_unknown_agent_rejected() {
        let (_tmp, _store, reg) = registry();
        let err = reg
            .create(tcp_request(r#"{"name":"db","ip":"h","port":1,"agent_id":99}"#))
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Validation(ValidationError::MissingReference("agent", 99))
        ));
    }

    #[test]
    fn test_unknown_channel_rejected_for_any_placement() {
        let (_tmp, _store, reg) = registry();
        let err = reg
            .create(tcp_request(r#"{"name":"db","ip":"h","port":1,"tg":41}"#))
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Validation(ValidationError::MissingReference("channel", 41))
        ));
    }

    #[test]
    fn test_update_cannot_change_kind() {
        let (_tmp, _store, reg) = registry();
        let def = reg
            .create(tcp_request(r#"{"name":"db","ip":"h","port":1}"#))
            .unwrap();
        let ping = CheckRequest::parse(CheckKind::Ping, br#"{"name":"p","ip":"h"}"#).unwrap();
        assert!(matches!(reg.update(def.id, ping), Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn test_move_checks_between_agents() {
        let (_tmp, store, reg) = registry();
        let a = add_agent(&store, "a");
        let b = add_agent(&store, "b");
        for n in 0..3 {
            reg.create(tcp_request(&format!(
                r#"{{"name":"c{}","ip":"h","port":1,"agent_id":{}}}"#,
                n, a
            )))
            .unwrap();
        }
        reg.create(tcp_request(r#"{"name":"everywhere","ip":"h","port":1}"#))
            .unwrap();

        assert_eq!(reg.move_checks(a, b).unwrap(), 3);
        assert_eq!(reg.count_on_agent(a), 0);
        assert_eq!(reg.count_on_agent(b), 3);
        assert!(reg.move_checks(a, 4242).is_err());
    }

    #[test]
    fn test_set_enabled_toggles() {
        let (_tmp, _store, reg) = registry();
        let def = reg
            .create(tcp_request(r#"{"name":"db","ip":"h","port":1}"#))
            .unwrap();
        let off = reg.set_enabled(def.id, false).unwrap();
        assert!(!off.enabled);
        assert!(!reg.get(def.id).unwrap().enabled);
    }
}
