//! Linear tracker adapter for Pilot.
//!
//! Linear exposes a single GraphQL endpoint. API keys go in the
//! `Authorization` header without a scheme prefix. Labels are first-class
//! objects addressed by UUID, cached name→id like Asana tag GIDs. Issue ids
//! used as `native_id` are Linear's UUIDs — the human identifier (`ENG-123`)
//! rides along in the raw payload.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use pilot_types::{Priority, Task, TaskId, TrackerKind};

use crate::error::{ok_or_error, Result, TrackerError};
use crate::traits::TrackerApi;

const LINEAR_API: &str = "https://api.linear.app/graphql";
const PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearConfig {
    pub api_key: String,
    /// Optional: restrict discovery and label creation to one team.
    #[serde(default)]
    pub team_id: Option<String>,
}

pub struct LinearTracker {
    api_key: String,
    team_id: Option<String>,
    client: Client,
    /// lowercase label name → label UUID
    label_cache: RwLock<HashMap<String, String>>,
}

impl LinearTracker {
    pub fn new(config: LinearConfig) -> Self {
        Self {
            api_key: config.api_key,
            team_id: config.team_id,
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("failed to create reqwest client"),
            label_cache: RwLock::new(HashMap::new()),
        }
    }

    async fn graphql(&self, query: &str, variables: Value) -> Result<Value> {
        let resp = self
            .client
            .post(LINEAR_API)
            .header("Authorization", &self.api_key)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await?;
        let body: Value = ok_or_error(resp).await?.json().await?;

        if let Some(message) = graphql_error_message(&body) {
            return Err(TrackerError::Http {
                status: 400,
                message,
                retryable: false,
            });
        }
        body.get("data")
            .cloned()
            .ok_or_else(|| TrackerError::Decode("linear: response without data".to_string()))
    }

    async fn resolve_label(&self, name: &str, create: bool) -> Result<Option<String>> {
        let key = name.to_lowercase();
        if let Some(id) = self.label_cache.read().get(&key) {
            return Ok(Some(id.clone()));
        }

        let data = self
            .graphql(
                "query($first: Int!) { issueLabels(first: $first) { nodes { id name } } }",
                json!({ "first": 250 }),
            )
            .await?;
        {
            let mut cache = self.label_cache.write();
            if let Some(nodes) = data.pointer("/issueLabels/nodes").and_then(|n| n.as_array()) {
                for node in nodes {
                    if let (Some(label_name), Some(id)) = (
                        node.get("name").and_then(|n| n.as_str()),
                        node.get("id").and_then(|i| i.as_str()),
                    ) {
                        cache.insert(label_name.to_lowercase(), id.to_string());
                    }
                }
            }
            if let Some(id) = cache.get(&key) {
                return Ok(Some(id.clone()));
            }
        }

        if !create {
            return Ok(None);
        }

        let mut input = json!({ "name": name });
        if let Some(ref team) = self.team_id {
            input["teamId"] = json!(team);
        }
        let data = self
            .graphql(
                "mutation($input: IssueLabelCreateInput!) { issueLabelCreate(input: $input) { issueLabel { id } } }",
                json!({ "input": input }),
            )
            .await?;
        let id = data
            .pointer("/issueLabelCreate/issueLabel/id")
            .and_then(|i| i.as_str())
            .ok_or_else(|| TrackerError::Decode("linear label create: missing id".to_string()))?
            .to_string();
        self.label_cache.write().insert(key, id.clone());
        Ok(Some(id))
    }

    async fn issues_with_label(&self, label: &str) -> Result<Vec<Task>> {
        let mut filter = json!({
            "labels": { "name": { "eqIgnoreCase": label } },
            "state": { "type": { "nin": ["completed", "canceled"] } },
        });
        if let Some(ref team) = self.team_id {
            filter["team"] = json!({ "id": { "eq": team } });
        }
        let data = self
            .graphql(
                "query($first: Int!, $filter: IssueFilter) { issues(first: $first, filter: $filter) { nodes { id identifier title description priority createdAt url labels { nodes { name } } } } }",
                json!({ "first": PAGE_SIZE, "filter": filter }),
            )
            .await?;

        let nodes = data
            .pointer("/issues/nodes")
            .and_then(|n| n.as_array())
            .ok_or_else(|| TrackerError::Decode("linear issues: missing nodes".to_string()))?;

        let mut tasks = Vec::new();
        for node in nodes {
            match parse_issue(node) {
                Some(task) => tasks.push(task),
                None => warn!("linear: skipping issue with malformed payload"),
            }
        }
        Ok(tasks)
    }

    async fn current_label_ids(&self, id: &TaskId) -> Result<Vec<String>> {
        let data = self
            .graphql(
                "query($id: String!) { issue(id: $id) { labels { nodes { id } } } }",
                json!({ "id": id.native_id }),
            )
            .await?;
        Ok(data
            .pointer("/issue/labels/nodes")
            .and_then(|n| n.as_array())
            .map(|nodes| {
                nodes
                    .iter()
                    .filter_map(|n| n.get("id").and_then(|i| i.as_str()))
                    .map(|i| i.to_string())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn update_labels(&self, id: &TaskId, label_ids: Vec<String>) -> Result<()> {
        self.graphql(
            "mutation($id: String!, $input: IssueUpdateInput!) { issueUpdate(id: $id, input: $input) { success } }",
            json!({ "id": id.native_id, "input": { "labelIds": label_ids } }),
        )
        .await?;
        Ok(())
    }
}

fn graphql_error_message(body: &Value) -> Option<String> {
    let errors = body.get("errors")?.as_array()?;
    if errors.is_empty() {
        return None;
    }
    Some(
        errors
            .iter()
            .filter_map(|e| e.get("message").and_then(|m| m.as_str()))
            .collect::<Vec<_>>()
            .join("; "),
    )
}

fn parse_issue(node: &Value) -> Option<Task> {
    let id = node.get("id")?.as_str()?.to_string();
    let title = node.get("title")?.as_str()?.to_string();
    let created_at = node
        .get("createdAt")
        .and_then(|c| c.as_str())
        .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Some(Task {
        id: TaskId::new(TrackerKind::Linear, id),
        title,
        description: node
            .get("description")
            .and_then(|d| d.as_str())
            .unwrap_or_default()
            .to_string(),
        priority: priority_from_number(node.get("priority").and_then(|p| p.as_u64())),
        labels: node
            .pointer("/labels/nodes")
            .and_then(|l| l.as_array())
            .map(|nodes| {
                nodes
                    .iter()
                    .filter_map(|n| n.get("name").and_then(|v| v.as_str()))
                    .map(|n| n.to_string())
                    .collect()
            })
            .unwrap_or_default(),
        created_at,
        permalink: node.get("url").and_then(|u| u.as_str()).map(|u| u.to_string()),
        raw: node.clone(),
    })
}

/// Linear's priority scale: 0 = none, 1 = urgent … 4 = low.
fn priority_from_number(priority: Option<u64>) -> Priority {
    match priority {
        Some(1) => Priority::Urgent,
        Some(2) => Priority::High,
        Some(3) => Priority::Medium,
        Some(4) => Priority::Low,
        _ => Priority::None,
    }
}

#[async_trait]
impl TrackerApi for LinearTracker {
    fn kind(&self) -> TrackerKind {
        TrackerKind::Linear
    }

    async fn list_candidates(&self, trigger_tag: &str) -> Result<Vec<Task>> {
        if self.resolve_label(trigger_tag, false).await?.is_none() {
            return Err(TrackerError::MissingTag(trigger_tag.to_string()));
        }
        self.issues_with_label(trigger_tag).await
    }

    async fn list_by_status_tag(&self, tag_name: &str) -> Result<Vec<Task>> {
        if self.resolve_label(tag_name, false).await?.is_none() {
            return Ok(Vec::new());
        }
        self.issues_with_label(tag_name).await
    }

    async fn lookup_tag(&self, name: &str) -> Result<Option<String>> {
        self.resolve_label(name, false).await
    }

    async fn ensure_tag(&self, name: &str) -> Result<String> {
        self.resolve_label(name, true)
            .await?
            .ok_or_else(|| TrackerError::MissingTag(name.to_string()))
    }

    /// `issueUpdate` replaces the full label set, so the current set is read
    /// first; re-applying a present label short-circuits to a no-op.
    async fn add_status_tag(&self, id: &TaskId, tag_name: &str) -> Result<()> {
        let label_id = self.ensure_tag(tag_name).await?;
        let mut current = self.current_label_ids(id).await?;
        if current.contains(&label_id) {
            return Ok(());
        }
        current.push(label_id);
        self.update_labels(id, current).await
    }

    async fn remove_status_tag(&self, id: &TaskId, tag_name: &str) -> Result<()> {
        let label_id = match self.resolve_label(tag_name, false).await? {
            Some(id) => id,
            None => return Ok(()),
        };
        let current = self.current_label_ids(id).await?;
        let filtered: Vec<String> = current.iter().filter(|l| **l != label_id).cloned().collect();
        if filtered.len() == current.len() {
            return Ok(());
        }
        self.update_labels(id, filtered).await
    }

    async fn post_comment(&self, id: &TaskId, body: &str) -> Result<()> {
        self.graphql(
            "mutation($input: CommentCreateInput!) { commentCreate(input: $input) { success } }",
            json!({ "input": { "issueId": id.native_id, "body": body } }),
        )
        .await?;
        Ok(())
    }

    async fn attach_link(&self, id: &TaskId, url: &str, name: &str) -> Result<()> {
        self.graphql(
            "mutation($input: AttachmentCreateInput!) { attachmentCreate(input: $input) { success } }",
            json!({ "input": { "issueId": id.native_id, "url": url, "title": name } }),
        )
        .await?;
        Ok(())
    }

    /// Moves the issue to the first workflow state of type `completed` on
    /// its team.
    async fn mark_completed(&self, id: &TaskId) -> Result<()> {
        let data = self
            .graphql(
                "query($id: String!) { issue(id: $id) { team { states(filter: { type: { eq: \"completed\" } }) { nodes { id } } } } }",
                json!({ "id": id.native_id }),
            )
            .await?;
        let state_id = data
            .pointer("/issue/team/states/nodes/0/id")
            .and_then(|s| s.as_str())
            .ok_or_else(|| TrackerError::Unsupported("linear team has no completed state"))?;
        self.graphql(
            "mutation($id: String!, $input: IssueUpdateInput!) { issueUpdate(id: $id, input: $input) { success } }",
            json!({ "id": id.native_id, "input": { "stateId": state_id } }),
        )
        .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.graphql("query { viewer { id } }", json!({})).await?;
        Ok(())
    }
}
