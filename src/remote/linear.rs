use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{EntityUpdate, NewEntity, RemoteClient};
use crate::error::SyncError;
use crate::model::entity::{Comment, Entity, Priority};

const RESOURCE_TYPES: [&str; 2] = ["Issue", "Comment"];

pub struct LinearClient {
    api_key: String,
    api_url: String,
    client: reqwest::Client,
}

impl LinearClient {
    pub fn new(api_key: String, api_url: String) -> Self {
        Self {
            api_key,
            api_url,
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }

    async fn graphql<T: DeserializeOwned>(&self, query: &str, variables: Value) -> Result<T, SyncError> {
        let body = json!({ "query": query, "variables": variables });
        let resp = self
            .client
            .post(&self.api_url)
            .header("Authorization", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        let parsed: Option<GqlResponse<T>> = serde_json::from_str(&text).ok();

        match parsed {
            Some(GqlResponse {
                errors: Some(errors),
                ..
            }) if !errors.is_empty() => Err(classify_errors(&errors)),
            Some(GqlResponse { data: Some(data), .. }) if status.is_success() => Ok(data),
            _ if !status.is_success() => Err(SyncError::from_status(status.as_u16(), text)),
            _ => Err(SyncError::Validation(format!(
                "unexpected Linear response: {}",
                text.chars().take(200).collect::<String>()
            ))),
        }
    }
}

const ISSUE_QUERY: &str = r#"query Issue($id: String!) {
  issue(id: $id) {
    identifier title description priority url dueDate createdAt updatedAt
    state { id name }
    assignee { displayName }
    labels { nodes { name } }
    parent { identifier }
    comments(first: 250) { nodes { id body createdAt user { displayName } } }
  }
}"#;

const TEAM_ISSUES_QUERY: &str = r#"query TeamIssues($teamId: ID!, $after: String) {
  issues(filter: { team: { id: { eq: $teamId } } }, first: 100, after: $after) {
    nodes { identifier }
    pageInfo { hasNextPage endCursor }
  }
}"#;

const ISSUE_UPDATE_MUTATION: &str = r#"mutation IssueUpdate($id: String!, $input: IssueUpdateInput!) {
  issueUpdate(id: $id, input: $input) { success }
}"#;

const ISSUE_CREATE_MUTATION: &str = r#"mutation IssueCreate($input: IssueCreateInput!) {
  issueCreate(input: $input) { success issue { identifier } }
}"#;

const WEBHOOKS_QUERY: &str = r#"query Webhooks {
  webhooks(first: 100) { nodes { id label url team { id } } }
}"#;

const WEBHOOK_CREATE_MUTATION: &str = r#"mutation WebhookCreate($input: WebhookCreateInput!) {
  webhookCreate(input: $input) { success webhook { id } }
}"#;

const WEBHOOK_UPDATE_MUTATION: &str = r#"mutation WebhookUpdate($id: String!, $input: WebhookUpdateInput!) {
  webhookUpdate(id: $id, input: $input) { success webhook { id } }
}"#;

const WEBHOOK_DELETE_MUTATION: &str = r#"mutation WebhookDelete($id: String!) {
  webhookDelete(id: $id) { success }
}"#;

#[derive(Deserialize)]
struct GqlResponse<T> {
    data: Option<T>,
    errors: Option<Vec<GqlError>>,
}

#[derive(Deserialize)]
struct GqlError {
    message: String,
    extensions: Option<GqlExtensions>,
}

#[derive(Deserialize)]
struct GqlExtensions {
    code: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

fn classify_errors(errors: &[GqlError]) -> SyncError {
    let first = &errors[0];
    let tag = first
        .extensions
        .as_ref()
        .and_then(|e| e.code.clone().or_else(|| e.kind.clone()))
        .unwrap_or_default()
        .to_lowercase();
    let message = first.message.clone();
    let lower = message.to_lowercase();

    if tag.contains("ratelimit") || lower.contains("rate limit") {
        SyncError::RateLimited
    } else if tag.contains("authentication") || tag.contains("forbidden") {
        SyncError::Auth(message)
    } else if lower.contains("not found") {
        SyncError::RemoteNotFound(message)
    } else if tag.contains("internal") {
        SyncError::Server {
            status: 500,
            message,
        }
    } else {
        SyncError::Validation(message)
    }
}

#[derive(Deserialize)]
struct IssueData {
    issue: Option<Issue>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Issue {
    identifier: String,
    title: String,
    description: Option<String>,
    priority: Option<f64>,
    url: Option<String>,
    due_date: Option<NaiveDate>,
    created_at: DateTime<FixedOffset>,
    updated_at: DateTime<FixedOffset>,
    state: IssueState,
    assignee: Option<User>,
    labels: Option<Nodes<Label>>,
    parent: Option<IssueRef>,
    comments: Option<Nodes<IssueComment>>,
}

#[derive(Deserialize)]
struct IssueState {
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct User {
    display_name: String,
}

#[derive(Deserialize)]
struct Label {
    name: String,
}

#[derive(Deserialize)]
struct IssueRef {
    identifier: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueComment {
    id: String,
    body: String,
    created_at: DateTime<FixedOffset>,
    user: Option<User>,
}

#[derive(Deserialize)]
struct Nodes<T> {
    nodes: Vec<T>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssuePage {
    nodes: Vec<IssueRef>,
    page_info: PageInfo,
}

#[derive(Deserialize)]
struct TeamIssuesData {
    issues: IssuePage,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueUpdateData {
    issue_update: MutationResult,
}

#[derive(Deserialize)]
struct MutationResult {
    success: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueCreateData {
    issue_create: IssueCreatePayload,
}

#[derive(Deserialize)]
struct IssueCreatePayload {
    success: bool,
    issue: Option<IssueRef>,
}

#[derive(Deserialize)]
struct WebhooksData {
    webhooks: Nodes<Webhook>,
}

#[derive(Deserialize)]
struct Webhook {
    id: String,
    label: Option<String>,
    url: Option<String>,
    team: Option<TeamRef>,
}

#[derive(Deserialize)]
struct TeamRef {
    id: String,
}

#[derive(Deserialize)]
struct WebhookPayload {
    success: bool,
    webhook: Option<WebhookRef>,
}

#[derive(Deserialize)]
struct WebhookRef {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookCreateData {
    webhook_create: WebhookPayload,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookUpdateData {
    webhook_update: WebhookPayload,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookDeleteData {
    webhook_delete: MutationResult,
}

fn map_issue(issue: Issue) -> Entity {
    let priority = issue
        .priority
        .and_then(|p| Priority::try_from(p as u8).ok())
        .unwrap_or_default();
    let labels = issue
        .labels
        .map(|lc| lc.nodes.into_iter().map(|l| l.name).collect())
        .unwrap_or_default();
    let mut comments: Vec<Comment> = issue
        .comments
        .map(|cc| {
            cc.nodes
                .into_iter()
                .map(|c| Comment {
                    id: c.id,
                    author: c.user.map(|u| u.display_name).unwrap_or_else(|| "unknown".into()),
                    body: c.body,
                    created_at: c.created_at,
                })
                .collect()
        })
        .unwrap_or_default();
    comments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

    Entity {
        id: issue.identifier,
        title: issue.title,
        status_name: issue.state.name,
        priority,
        labels,
        assignee: issue.assignee.map(|u| u.display_name),
        due_date: issue.due_date,
        parent: issue.parent.map(|p| p.identifier),
        url: issue.url.unwrap_or_default(),
        created_at: issue.created_at,
        updated_at: issue.updated_at,
        body: issue.description.unwrap_or_default(),
        comments,
    }
}

fn update_input(update: &EntityUpdate) -> Value {
    let mut input = Map::new();
    if let Some(state_id) = &update.state_id {
        input.insert("stateId".into(), json!(state_id));
    }
    if let Some(title) = &update.title {
        input.insert("title".into(), json!(title));
    }
    if let Some(description) = &update.description {
        input.insert("description".into(), json!(description));
    }
    Value::Object(input)
}

fn unsuccessful(operation: &str) -> SyncError {
    SyncError::Validation(format!("Linear reported {operation} as unsuccessful"))
}

#[async_trait]
impl RemoteClient for LinearClient {
    async fn get_entity(&self, id: &str) -> Result<Entity, SyncError> {
        let data: IssueData = self.graphql(ISSUE_QUERY, json!({ "id": id })).await?;
        data.issue
            .map(map_issue)
            .ok_or_else(|| SyncError::RemoteNotFound(id.to_string()))
    }

    async fn list_entities(&self, scope: &str) -> Result<Vec<String>, SyncError> {
        let mut ids = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let data: TeamIssuesData = self
                .graphql(TEAM_ISSUES_QUERY, json!({ "teamId": scope, "after": after }))
                .await?;
            ids.extend(data.issues.nodes.into_iter().map(|n| n.identifier));
            match data.issues.page_info {
                PageInfo {
                    has_next_page: true,
                    end_cursor: Some(cursor),
                } => after = Some(cursor),
                _ => break,
            }
        }
        debug!(scope, count = ids.len(), "listed remote issues");
        Ok(ids)
    }

    async fn update_entity(&self, id: &str, update: &EntityUpdate) -> Result<(), SyncError> {
        let data: IssueUpdateData = self
            .graphql(
                ISSUE_UPDATE_MUTATION,
                json!({ "id": id, "input": update_input(update) }),
            )
            .await?;
        if !data.issue_update.success {
            return Err(unsuccessful("issueUpdate"));
        }
        Ok(())
    }

    async fn create_entity(&self, entity: &NewEntity) -> Result<String, SyncError> {
        let mut input = json!({ "teamId": entity.scope, "title": entity.title });
        if let Some(description) = &entity.description {
            input["description"] = json!(description);
        }
        if let Some(state_id) = &entity.state_id {
            input["stateId"] = json!(state_id);
        }
        let data: IssueCreateData = self
            .graphql(ISSUE_CREATE_MUTATION, json!({ "input": input }))
            .await?;
        match data.issue_create {
            IssueCreatePayload {
                success: true,
                issue: Some(issue),
            } => Ok(issue.identifier),
            _ => Err(unsuccessful("issueCreate")),
        }
    }

    async fn upsert_notification_target(
        &self,
        url: &str,
        scope: &str,
        label: &str,
    ) -> Result<String, SyncError> {
        let existing: WebhooksData = self.graphql(WEBHOOKS_QUERY, json!({})).await?;
        let found = existing.webhooks.nodes.into_iter().find(|w| {
            w.label.as_deref() == Some(label) && w.team.as_ref().is_some_and(|t| t.id == scope)
        });

        let payload = match found {
            Some(webhook) if webhook.url.as_deref() == Some(url) => {
                debug!(id = %webhook.id, "webhook already points at current url");
                return Ok(webhook.id);
            }
            Some(webhook) => {
                let data: WebhookUpdateData = self
                    .graphql(
                        WEBHOOK_UPDATE_MUTATION,
                        json!({ "id": webhook.id, "input": { "url": url } }),
                    )
                    .await?;
                data.webhook_update
            }
            None => {
                let input = json!({
                    "url": url,
                    "teamId": scope,
                    "label": label,
                    "resourceTypes": RESOURCE_TYPES,
                });
                let data: WebhookCreateData = self
                    .graphql(WEBHOOK_CREATE_MUTATION, json!({ "input": input }))
                    .await?;
                data.webhook_create
            }
        };

        match payload {
            WebhookPayload {
                success: true,
                webhook: Some(webhook),
            } => Ok(webhook.id),
            _ => Err(unsuccessful("webhook upsert")),
        }
    }

    async fn delete_notification_target(&self, target_id: &str) -> Result<(), SyncError> {
        let data: WebhookDeleteData = self
            .graphql(WEBHOOK_DELETE_MUTATION, json!({ "id": target_id }))
            .await?;
        if !data.webhook_delete.success {
            return Err(unsuccessful("webhookDelete"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gql_error(message: &str, code: Option<&str>) -> GqlError {
        GqlError {
            message: message.into(),
            extensions: code.map(|c| GqlExtensions {
                code: Some(c.into()),
                kind: None,
            }),
        }
    }

    #[test]
    fn classifies_graphql_errors() {
        assert!(matches!(
            classify_errors(&[gql_error("slow down", Some("RATELIMITED"))]),
            SyncError::RateLimited
        ));
        assert!(matches!(
            classify_errors(&[gql_error("bad key", Some("AUTHENTICATION_ERROR"))]),
            SyncError::Auth(_)
        ));
        assert!(matches!(
            classify_errors(&[gql_error("Entity not found", None)]),
            SyncError::RemoteNotFound(_)
        ));
        assert!(matches!(
            classify_errors(&[gql_error("Argument Validation Error", Some("INVALID_INPUT"))]),
            SyncError::Validation(_)
        ));
    }

    #[test]
    fn maps_issue_payload() {
        let raw = json!({
            "identifier": "ENG-42",
            "title": "Fix login",
            "description": null,
            "priority": 2.0,
            "url": "https://linear.app/acme/issue/ENG-42",
            "dueDate": "2024-04-01",
            "createdAt": "2024-03-01T10:00:00.000Z",
            "updatedAt": "2024-03-02T10:00:00.000Z",
            "state": { "id": "s2", "name": "In Progress" },
            "assignee": { "displayName": "alice" },
            "labels": { "nodes": [{ "name": "bug" }] },
            "parent": { "identifier": "ENG-40" },
            "comments": { "nodes": [
                { "id": "c2", "body": "second", "createdAt": "2024-03-02T09:00:00.000Z", "user": null },
                { "id": "c1", "body": "first", "createdAt": "2024-03-01T11:00:00.000Z",
                  "user": { "displayName": "bob" } }
            ] }
        });
        let entity = map_issue(serde_json::from_value(raw).unwrap());
        assert_eq!(entity.id, "ENG-42");
        assert_eq!(entity.priority, Priority::High);
        assert_eq!(entity.parent.as_deref(), Some("ENG-40"));
        assert_eq!(entity.body, "");
        assert!(entity.labels.contains("bug"));
        let authors: Vec<_> = entity.comments.iter().map(|c| c.author.as_str()).collect();
        assert_eq!(authors, vec!["bob", "unknown"]);
    }

    #[test]
    fn update_input_only_has_changed_fields() {
        let update = EntityUpdate {
            state_id: None,
            title: Some("New title".into()),
            description: None,
        };
        assert_eq!(update_input(&update), json!({ "title": "New title" }));
    }
}
