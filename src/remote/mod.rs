pub mod linear;

use async_trait::async_trait;

use crate::error::SyncError;
use crate::model::entity::Entity;

/// The subset of fields a push may change remotely. `None` means unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityUpdate {
    pub state_id: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
}

impl EntityUpdate {
    pub fn is_empty(&self) -> bool {
        self.state_id.is_none() && self.title.is_none() && self.description.is_none()
    }

    pub fn changed_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.state_id.is_some() {
            fields.push("state");
        }
        if self.title.is_some() {
            fields.push("title");
        }
        if self.description.is_some() {
            fields.push("description");
        }
        fields
    }
}

#[derive(Debug, Clone)]
pub struct NewEntity {
    pub scope: String,
    pub title: String,
    pub description: Option<String>,
    pub state_id: Option<String>,
}

#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn get_entity(&self, id: &str) -> Result<Entity, SyncError>;
    /// Ids of every entity in `scope`.
    async fn list_entities(&self, scope: &str) -> Result<Vec<String>, SyncError>;
    async fn update_entity(&self, id: &str, update: &EntityUpdate) -> Result<(), SyncError>;
    /// Returns the id of the created entity.
    async fn create_entity(&self, entity: &NewEntity) -> Result<String, SyncError>;
    /// Point the notification target labelled `label` in `scope` at `url`,
    /// creating it if needed. Returns the target id.
    async fn upsert_notification_target(
        &self,
        url: &str,
        scope: &str,
        label: &str,
    ) -> Result<String, SyncError>;
    async fn delete_notification_target(&self, target_id: &str) -> Result<(), SyncError>;
}

#[cfg(test)]
pub mod mock;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_update_has_no_fields() {
        let update = EntityUpdate::default();
        assert!(update.is_empty());
        assert!(update.changed_fields().is_empty());
    }

    #[test]
    fn lists_changed_fields_in_order() {
        let update = EntityUpdate {
            state_id: Some("s2".into()),
            title: None,
            description: Some("new".into()),
        };
        assert!(!update.is_empty());
        assert_eq!(update.changed_fields(), vec!["state", "description"]);
    }
}
