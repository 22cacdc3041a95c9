//! Azure DevOps (Boards) tracker adapter for Pilot.
//!
//! Work items are discovered with a WIQL query over `System.Tags` and
//! hydrated through the batch work-items endpoint. Tags in Azure DevOps are
//! not first-class objects — they live in the `System.Tags` field as a
//! `"; "`-joined string and are created implicitly on first application, so
//! tag mutation is read-modify-write via JSON Patch.
//!
//! Authentication is Basic with an empty username and a PAT password.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use pilot_types::{Priority, Task, TaskId, TrackerKind};

use crate::error::{ok_or_error, Result, TrackerError};
use crate::traits::TrackerApi;

const API_VERSION: &str = "7.0";
const COMMENTS_API_VERSION: &str = "7.0-preview.3";
/// The batch work-items endpoint rejects more than 200 ids per request.
const MAX_BATCH_IDS: usize = 200;

/// Work-item states treated as terminal regardless of process template.
const TERMINAL_STATES: &[&str] = &["Closed", "Done", "Removed", "Resolved", "Completed"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AzureDevOpsConfig {
    /// Organization name as it appears in `https://dev.azure.com/{org}`.
    pub organization: String,
    pub project: String,
    pub pat: String,
    /// Allow-list of work item types (e.g. `["Task", "Bug"]`). Empty = all.
    #[serde(default)]
    pub work_item_types: Vec<String>,
}

pub struct AzureDevOpsTracker {
    organization: String,
    project: String,
    pat: String,
    work_item_types: Vec<String>,
    client: Client,
}

impl AzureDevOpsTracker {
    pub fn new(config: AzureDevOpsConfig) -> Self {
        Self {
            organization: config.organization,
            project: config.project,
            pat: config.pat,
            work_item_types: config.work_item_types,
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("failed to create reqwest client"),
        }
    }

    fn org_url(&self, path: &str) -> String {
        format!("https://dev.azure.com/{}/{}", self.organization, path)
    }

    fn project_url(&self, path: &str) -> String {
        format!(
            "https://dev.azure.com/{}/{}/{}",
            self.organization, self.project, path
        )
    }

    fn authed(&self, rb: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        rb.basic_auth("", Some(&self.pat))
    }

    async fn query_ids(&self, wiql: &str) -> Result<Vec<u64>> {
        let url = self.project_url("_apis/wit/wiql");
        let resp = self
            .authed(self.client.post(&url))
            .query(&[("api-version", API_VERSION)])
            .json(&json!({ "query": wiql }))
            .send()
            .await?;
        let body: Value = ok_or_error(resp).await?.json().await?;

        let ids = body
            .get("workItems")
            .and_then(|w| w.as_array())
            .ok_or_else(|| TrackerError::Decode("wiql: missing workItems array".to_string()))?
            .iter()
            .filter_map(|w| w.get("id").and_then(|id| id.as_u64()))
            .collect();
        Ok(ids)
    }

    async fn hydrate(&self, ids: &[u64]) -> Result<Vec<Task>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut tasks = Vec::new();
        for chunk in ids.chunks(MAX_BATCH_IDS) {
            let id_list = chunk
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(",");
            let url = self.org_url("_apis/wit/workitems");
            let resp = self
                .authed(self.client.get(&url))
                .query(&[
                    ("ids", id_list.as_str()),
                    (
                        "fields",
                        "System.Id,System.Title,System.Description,System.Tags,System.State,System.CreatedDate,Microsoft.VSTS.Common.Priority",
                    ),
                    ("api-version", API_VERSION),
                ])
                .send()
                .await?;
            let body: Value = ok_or_error(resp).await?.json().await?;
            let items = body
                .get("value")
                .and_then(|v| v.as_array())
                .ok_or_else(|| TrackerError::Decode("workitems: missing value array".to_string()))?;
            for item in items {
                match self.parse_work_item(item) {
                    Some(task) => tasks.push(task),
                    None => warn!("azure_devops: skipping work item with malformed payload"),
                }
            }
        }
        Ok(tasks)
    }

    fn parse_work_item(&self, item: &Value) -> Option<Task> {
        let id = item.get("id")?.as_u64()?;
        let fields = item.get("fields")?;
        let title = fields.get("System.Title")?.as_str()?.to_string();
        let created_at = fields
            .get("System.CreatedDate")
            .and_then(|c| c.as_str())
            .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Some(Task {
            id: TaskId::new(TrackerKind::AzureDevOps, id.to_string()),
            title,
            description: fields
                .get("System.Description")
                .and_then(|d| d.as_str())
                .unwrap_or_default()
                .to_string(),
            priority: priority_from_field(fields.get("Microsoft.VSTS.Common.Priority")),
            labels: split_tags(
                fields
                    .get("System.Tags")
                    .and_then(|t| t.as_str())
                    .unwrap_or_default(),
            ),
            created_at,
            permalink: Some(format!(
                "https://dev.azure.com/{}/{}/_workitems/edit/{}",
                self.organization, self.project, id
            )),
            raw: item.clone(),
        })
    }

    async fn current_tags(&self, id: &TaskId) -> Result<Vec<String>> {
        let url = self.org_url(&format!("_apis/wit/workitems/{}", id.native_id));
        let resp = self
            .authed(self.client.get(&url))
            .query(&[("fields", "System.Tags"), ("api-version", API_VERSION)])
            .send()
            .await?;
        let body: Value = ok_or_error(resp).await?.json().await?;
        Ok(split_tags(
            body.pointer("/fields/System.Tags")
                .and_then(|t| t.as_str())
                .unwrap_or_default(),
        ))
    }

    async fn patch_tags(&self, id: &TaskId, tags: &[String]) -> Result<()> {
        let url = self.org_url(&format!("_apis/wit/workitems/{}", id.native_id));
        let patch = json!([{
            "op": "add",
            "path": "/fields/System.Tags",
            "value": join_tags(tags),
        }]);
        let resp = self
            .authed(self.client.patch(&url))
            .query(&[("api-version", API_VERSION)])
            .header("Content-Type", "application/json-patch+json")
            .body(patch.to_string())
            .send()
            .await?;
        ok_or_error(resp).await?;
        Ok(())
    }

    fn candidate_wiql(&self, tag: &str) -> String {
        let mut clauses = vec![
            format!("[System.TeamProject] = '{}'", escape_wiql(&self.project)),
            format!("[System.Tags] CONTAINS '{}'", escape_wiql(tag)),
            format!(
                "[System.State] NOT IN ({})",
                TERMINAL_STATES
                    .iter()
                    .map(|s| format!("'{s}'"))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        ];
        if !self.work_item_types.is_empty() {
            clauses.push(format!(
                "[System.WorkItemType] IN ({})",
                self.work_item_types
                    .iter()
                    .map(|t| format!("'{}'", escape_wiql(t)))
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
        format!(
            "SELECT [System.Id] FROM WorkItems WHERE {} ORDER BY [System.CreatedDate] ASC",
            clauses.join(" AND ")
        )
    }
}

/// WIQL string literals escape single quotes by doubling them.
fn escape_wiql(s: &str) -> String {
    s.replace('\'', "''")
}

/// `System.Tags` is `"; "`-joined, with inconsistent spacing in the wild.
fn split_tags(raw: &str) -> Vec<String> {
    raw.split(';')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

fn join_tags(tags: &[String]) -> String {
    tags.join("; ")
}

fn priority_from_field(field: Option<&Value>) -> Priority {
    match field.and_then(|p| p.as_u64()) {
        Some(1) => Priority::Urgent,
        Some(2) => Priority::High,
        Some(3) => Priority::Medium,
        Some(4) => Priority::Low,
        _ => Priority::None,
    }
}

#[async_trait]
impl TrackerApi for AzureDevOpsTracker {
    fn kind(&self) -> TrackerKind {
        TrackerKind::AzureDevOps
    }

    async fn list_candidates(&self, trigger_tag: &str) -> Result<Vec<Task>> {
        let ids = self.query_ids(&self.candidate_wiql(trigger_tag)).await?;
        self.hydrate(&ids).await
    }

    async fn list_by_status_tag(&self, tag_name: &str) -> Result<Vec<Task>> {
        let wiql = format!(
            "SELECT [System.Id] FROM WorkItems WHERE [System.TeamProject] = '{}' AND [System.Tags] CONTAINS '{}'",
            escape_wiql(&self.project),
            escape_wiql(tag_name)
        );
        let ids = self.query_ids(&wiql).await?;
        self.hydrate(&ids).await
    }

    async fn lookup_tag(&self, name: &str) -> Result<Option<String>> {
        let url = self.project_url("_apis/wit/tags");
        let resp = self
            .authed(self.client.get(&url))
            .query(&[("api-version", "7.0-preview.1")])
            .send()
            .await?;
        let body: Value = ok_or_error(resp).await?.json().await?;
        let found = body
            .get("value")
            .and_then(|v| v.as_array())
            .map(|tags| {
                tags.iter()
                    .filter_map(|t| t.get("name").and_then(|n| n.as_str()))
                    .any(|n| n.eq_ignore_ascii_case(name))
            })
            .unwrap_or(false);
        Ok(found.then(|| name.to_string()))
    }

    /// Azure DevOps tags are created implicitly on first application, so the
    /// tag name is its own identifier.
    async fn ensure_tag(&self, name: &str) -> Result<String> {
        Ok(name.to_string())
    }

    /// Read-modify-write on `System.Tags`. Duplicates are filtered locally
    /// before the PATCH, which makes re-application a no-op.
    async fn add_status_tag(&self, id: &TaskId, tag_name: &str) -> Result<()> {
        let mut tags = self.current_tags(id).await?;
        if tags.iter().any(|t| t.eq_ignore_ascii_case(tag_name)) {
            return Ok(());
        }
        tags.push(tag_name.to_string());
        self.patch_tags(id, &tags).await
    }

    async fn remove_status_tag(&self, id: &TaskId, tag_name: &str) -> Result<()> {
        let tags = self.current_tags(id).await?;
        let filtered: Vec<String> = tags
            .iter()
            .filter(|t| !t.eq_ignore_ascii_case(tag_name))
            .cloned()
            .collect();
        if filtered.len() == tags.len() {
            return Ok(());
        }
        self.patch_tags(id, &filtered).await
    }

    async fn post_comment(&self, id: &TaskId, body: &str) -> Result<()> {
        let url = self.project_url(&format!("_apis/wit/workItems/{}/comments", id.native_id));
        let resp = self
            .authed(self.client.post(&url))
            .query(&[("api-version", COMMENTS_API_VERSION)])
            .json(&json!({ "text": body }))
            .send()
            .await?;
        ok_or_error(resp).await?;
        Ok(())
    }

    async fn attach_link(&self, id: &TaskId, url: &str, name: &str) -> Result<()> {
        let patch_url = self.org_url(&format!("_apis/wit/workitems/{}", id.native_id));
        let patch = json!([{
            "op": "add",
            "path": "/relations/-",
            "value": {
                "rel": "Hyperlink",
                "url": url,
                "attributes": { "comment": name },
            }
        }]);
        let resp = self
            .authed(self.client.patch(&patch_url))
            .query(&[("api-version", API_VERSION)])
            .header("Content-Type", "application/json-patch+json")
            .body(patch.to_string())
            .send()
            .await?;
        ok_or_error(resp).await?;
        Ok(())
    }

    /// Completion state names vary per process template (Agile, Scrum,
    /// CMMI), so there is no safe generic transition.
    async fn mark_completed(&self, _id: &TaskId) -> Result<()> {
        Err(TrackerError::Unsupported("azure_devops mark_completed"))
    }

    async fn ping(&self) -> Result<()> {
        let url = self.org_url("_apis/projects");
        let resp = self
            .authed(self.client.get(&url))
            .query(&[("$top", "1"), ("api-version", API_VERSION)])
            .send()
            .await?;
        ok_or_error(resp).await?;
        Ok(())
    }
}
