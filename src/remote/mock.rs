use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;

use super::{EntityUpdate, NewEntity, RemoteClient};
use crate::error::SyncError;
use crate::model::entity::{Entity, Priority};

/// In-memory remote that records every call for assertions.
#[derive(Default)]
pub struct MockRemote {
    pub entities: Mutex<HashMap<String, Entity>>,
    /// Status name → state id, used to apply `state_id` updates.
    pub states: Mutex<HashMap<String, String>>,
    pub calls: Arc<Mutex<Vec<String>>>,
    pub updates: Mutex<Vec<(String, EntityUpdate)>>,
    pub targets: Mutex<HashMap<String, String>>,
    pub get_delay: Mutex<Option<Duration>>,
    pub failing_ids: Mutex<Vec<String>>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entity: Entity) {
        self.entities
            .lock()
            .unwrap()
            .insert(entity.id.clone(), entity);
    }

    pub fn with_state(self, name: &str, state_id: &str) -> Self {
        self.states
            .lock()
            .unwrap()
            .insert(name.to_string(), state_id.to_string());
        self
    }

    pub fn fail_for(&self, id: &str) {
        self.failing_ids.lock().unwrap().push(id.to_string());
    }

    pub fn set_get_delay(&self, delay: Duration) {
        *self.get_delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn update_count(&self) -> usize {
        self.updates.lock().unwrap().len()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl RemoteClient for MockRemote {
    async fn get_entity(&self, id: &str) -> Result<Entity, SyncError> {
        self.record(format!("get {id} begin"));
        let delay = *self.get_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.record(format!("get {id} end"));
        if self.failing_ids.lock().unwrap().iter().any(|f| f == id) {
            return Err(SyncError::Auth("mock failure".into()));
        }
        self.entities
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| SyncError::RemoteNotFound(id.to_string()))
    }

    async fn list_entities(&self, _scope: &str) -> Result<Vec<String>, SyncError> {
        self.record("list".into());
        let mut ids: Vec<String> = self.entities.lock().unwrap().keys().cloned().collect();
        ids.extend(self.failing_ids.lock().unwrap().iter().cloned());
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn update_entity(&self, id: &str, update: &EntityUpdate) -> Result<(), SyncError> {
        self.record(format!("update {id}"));
        self.updates
            .lock()
            .unwrap()
            .push((id.to_string(), update.clone()));
        let states = self.states.lock().unwrap().clone();
        let mut entities = self.entities.lock().unwrap();
        let entity = entities
            .get_mut(id)
            .ok_or_else(|| SyncError::RemoteNotFound(id.to_string()))?;
        if let Some(state_id) = &update.state_id {
            if let Some((name, _)) = states.iter().find(|(_, s)| *s == state_id) {
                entity.status_name = name.clone();
            }
        }
        if let Some(title) = &update.title {
            entity.title = title.clone();
        }
        if let Some(description) = &update.description {
            entity.body = description.clone();
        }
        Ok(())
    }

    async fn create_entity(&self, new: &NewEntity) -> Result<String, SyncError> {
        self.record(format!("create {}", new.title));
        let status_name = new
            .state_id
            .as_ref()
            .and_then(|state_id| {
                self.states
                    .lock()
                    .unwrap()
                    .iter()
                    .find(|(_, s)| *s == state_id)
                    .map(|(name, _)| name.clone())
            })
            .unwrap_or_else(|| "Todo".to_string());
        let mut entities = self.entities.lock().unwrap();
        let id = format!("ENG-{}", 100 + entities.len());
        let created = DateTime::parse_from_rfc3339("2024-03-05T09:00:00Z").unwrap();
        entities.insert(
            id.clone(),
            Entity {
                id: id.clone(),
                title: new.title.clone(),
                status_name,
                priority: Priority::None,
                labels: BTreeSet::new(),
                assignee: None,
                due_date: None,
                parent: None,
                url: format!("https://linear.app/acme/issue/{id}"),
                created_at: created,
                updated_at: created,
                body: new.description.clone().unwrap_or_default(),
                comments: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn upsert_notification_target(
        &self,
        url: &str,
        scope: &str,
        label: &str,
    ) -> Result<String, SyncError> {
        self.record(format!("upsert {url}"));
        let key = format!("{scope}/{label}");
        let mut targets = self.targets.lock().unwrap();
        targets.insert(key.clone(), url.to_string());
        Ok(key)
    }

    async fn delete_notification_target(&self, target_id: &str) -> Result<(), SyncError> {
        self.record(format!("delete-target {target_id}"));
        self.targets.lock().unwrap().remove(target_id);
        Ok(())
    }
}
