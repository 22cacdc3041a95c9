//! Asana tracker adapter for Pilot.
//!
//! Uses the REST API v1.0 with a personal access token (`Authorization:
//! Bearer`). Tags are workspace-scoped objects addressed by GID, so the
//! adapter keeps a name→GID cache filled on first use. Task listings are
//! paginated with Asana's `offset` cursor and capped at a few pages per call.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use pilot_types::{Priority, Task, TaskId, TrackerKind};

use crate::error::{ok_or_error, Result, TrackerError};
use crate::traits::TrackerApi;

const ASANA_API: &str = "https://app.asana.com/api/1.0";
const PAGE_LIMIT: usize = 100;
/// Hard cap on pagination per listing call. Anything beyond this waits for
/// the next tick.
const MAX_PAGES: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsanaConfig {
    pub access_token: String,
    pub workspace_gid: String,
    /// Optional: restrict candidate listing to a single project.
    #[serde(default)]
    pub project_gid: Option<String>,
}

pub struct AsanaTracker {
    access_token: String,
    workspace_gid: String,
    project_gid: Option<String>,
    client: Client,
    /// lowercase tag name → GID
    tag_cache: RwLock<HashMap<String, String>>,
}

impl AsanaTracker {
    pub fn new(config: AsanaConfig) -> Self {
        Self {
            access_token: config.access_token,
            workspace_gid: config.workspace_gid,
            project_gid: config.project_gid,
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("failed to create reqwest client"),
            tag_cache: RwLock::new(HashMap::new()),
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!("{ASANA_API}/{path}")
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .get(self.api_url(path))
            .bearer_auth(&self.access_token)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(self.api_url(path))
            .bearer_auth(&self.access_token)
    }

    fn put(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .put(self.api_url(path))
            .bearer_auth(&self.access_token)
    }

    /// Walk a paginated collection endpoint, accumulating `data` entries
    /// until the cursor runs out or `MAX_PAGES` is hit.
    async fn get_paged(&self, path: &str, query: &[(&str, &str)]) -> Result<Vec<Value>> {
        let mut items = Vec::new();
        let mut offset: Option<String> = None;

        for page in 0..MAX_PAGES {
            let mut req = self.get(path).query(query);
            req = req.query(&[("limit", PAGE_LIMIT.to_string())]);
            if let Some(ref cursor) = offset {
                req = req.query(&[("offset", cursor.as_str())]);
            }

            let resp = ok_or_error(req.send().await?).await?;
            let body: Value = resp.json().await?;

            match body.get("data").and_then(|d| d.as_array()) {
                Some(data) => items.extend(data.iter().cloned()),
                None => {
                    return Err(TrackerError::Decode(format!(
                        "asana {path}: missing data array"
                    )))
                }
            }

            offset = body
                .pointer("/next_page/offset")
                .and_then(|o| o.as_str())
                .map(|o| o.to_string());
            if offset.is_none() {
                break;
            }
            if page + 1 == MAX_PAGES {
                debug!("asana {path}: stopping pagination after {MAX_PAGES} pages");
            }
        }

        Ok(items)
    }

    async fn resolve_tag(&self, name: &str, create: bool) -> Result<Option<String>> {
        let key = name.to_lowercase();
        if let Some(gid) = self.tag_cache.read().get(&key) {
            return Ok(Some(gid.clone()));
        }

        let path = format!("workspaces/{}/tags", self.workspace_gid);
        let tags = self.get_paged(&path, &[("opt_fields", "name")]).await?;

        // Cache the whole listing — the poller resolves four tags back to
        // back at startup.
        {
            let mut cache = self.tag_cache.write();
            for tag in &tags {
                if let (Some(tag_name), Some(gid)) = (
                    tag.get("name").and_then(|n| n.as_str()),
                    tag.get("gid").and_then(|g| g.as_str()),
                ) {
                    cache.insert(tag_name.to_lowercase(), gid.to_string());
                }
            }
            if let Some(gid) = cache.get(&key) {
                return Ok(Some(gid.clone()));
            }
        }

        if !create {
            return Ok(None);
        }

        let body = json!({ "data": { "name": name, "workspace": self.workspace_gid } });
        let resp = ok_or_error(self.post("tags").json(&body).send().await?).await?;
        let created: Value = resp.json().await?;
        let gid = created
            .pointer("/data/gid")
            .and_then(|g| g.as_str())
            .ok_or_else(|| TrackerError::Decode("asana tag create: missing gid".to_string()))?
            .to_string();

        self.tag_cache.write().insert(key, gid.clone());
        Ok(Some(gid))
    }

    async fn tasks_for_tag(&self, tag_gid: &str) -> Result<Vec<Task>> {
        let path = format!("tags/{tag_gid}/tasks");
        let opt_fields =
            "name,notes,completed,created_at,permalink_url,tags.name,custom_fields.name,custom_fields.enum_value.name,memberships.project.gid";
        let raw = self.get_paged(&path, &[("opt_fields", opt_fields)]).await?;

        let mut tasks = Vec::new();
        for item in raw {
            // Tracker-terminal items never reach the core.
            if item.get("completed").and_then(|c| c.as_bool()).unwrap_or(false) {
                continue;
            }
            if let Some(ref project) = self.project_gid {
                let in_project = item
                    .pointer("/memberships")
                    .and_then(|m| m.as_array())
                    .map(|ms| {
                        ms.iter().any(|m| {
                            m.pointer("/project/gid").and_then(|g| g.as_str())
                                == Some(project.as_str())
                        })
                    })
                    .unwrap_or(false);
                if !in_project {
                    continue;
                }
            }
            match parse_task(&item) {
                Some(task) => tasks.push(task),
                None => warn!("asana: skipping task with malformed payload"),
            }
        }
        Ok(tasks)
    }
}

/// Normalize one Asana task payload. Returns `None` when the gid or name is
/// missing — Asana never sends such payloads in practice, but a skipped task
/// beats a crashed tick.
fn parse_task(item: &Value) -> Option<Task> {
    let gid = item.get("gid")?.as_str()?.to_string();
    let title = item.get("name")?.as_str()?.to_string();
    let created_at = item
        .get("created_at")
        .and_then(|c| c.as_str())
        .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Some(Task {
        id: TaskId::new(TrackerKind::Asana, gid),
        title,
        description: item
            .get("notes")
            .and_then(|n| n.as_str())
            .unwrap_or_default()
            .to_string(),
        priority: priority_from_custom_fields(item),
        labels: item
            .get("tags")
            .and_then(|t| t.as_array())
            .map(|tags| {
                tags.iter()
                    .filter_map(|t| t.get("name").and_then(|n| n.as_str()))
                    .map(|n| n.to_string())
                    .collect()
            })
            .unwrap_or_default(),
        created_at,
        permalink: item
            .get("permalink_url")
            .and_then(|p| p.as_str())
            .map(|p| p.to_string()),
        raw: item.clone(),
    })
}

/// Asana has no native priority field; teams model it as an enum custom
/// field named "Priority".
fn priority_from_custom_fields(item: &Value) -> Priority {
    let fields = match item.get("custom_fields").and_then(|f| f.as_array()) {
        Some(f) => f,
        None => return Priority::None,
    };
    for field in fields {
        let is_priority = field
            .get("name")
            .and_then(|n| n.as_str())
            .map(|n| n.eq_ignore_ascii_case("priority"))
            .unwrap_or(false);
        if !is_priority {
            continue;
        }
        let value = field
            .pointer("/enum_value/name")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        return match value.to_ascii_lowercase().as_str() {
            "urgent" => Priority::Urgent,
            "high" => Priority::High,
            "medium" => Priority::Medium,
            "low" => Priority::Low,
            _ => Priority::None,
        };
    }
    Priority::None
}

#[async_trait]
impl TrackerApi for AsanaTracker {
    fn kind(&self) -> TrackerKind {
        TrackerKind::Asana
    }

    async fn list_candidates(&self, trigger_tag: &str) -> Result<Vec<Task>> {
        let gid = self
            .resolve_tag(trigger_tag, false)
            .await?
            .ok_or_else(|| TrackerError::MissingTag(trigger_tag.to_string()))?;
        self.tasks_for_tag(&gid).await
    }

    async fn list_by_status_tag(&self, tag_name: &str) -> Result<Vec<Task>> {
        match self.resolve_tag(tag_name, false).await? {
            Some(gid) => self.tasks_for_tag(&gid).await,
            // Tag never created yet — nothing can carry it.
            None => Ok(Vec::new()),
        }
    }

    async fn lookup_tag(&self, name: &str) -> Result<Option<String>> {
        self.resolve_tag(name, false).await
    }

    async fn ensure_tag(&self, name: &str) -> Result<String> {
        self.resolve_tag(name, true)
            .await?
            .ok_or_else(|| TrackerError::MissingTag(name.to_string()))
    }

    /// Asana's `addTag` is idempotent: re-applying a tag the task already
    /// carries returns 200 with no change.
    async fn add_status_tag(&self, id: &TaskId, tag_name: &str) -> Result<()> {
        let gid = self.ensure_tag(tag_name).await?;
        let body = json!({ "data": { "tag": gid } });
        let path = format!("tasks/{}/addTag", id.native_id);
        ok_or_error(self.post(&path).json(&body).send().await?).await?;
        Ok(())
    }

    async fn remove_status_tag(&self, id: &TaskId, tag_name: &str) -> Result<()> {
        let gid = match self.resolve_tag(tag_name, false).await? {
            Some(gid) => gid,
            // Tag doesn't exist anywhere — nothing to remove.
            None => return Ok(()),
        };
        let body = json!({ "data": { "tag": gid } });
        let path = format!("tasks/{}/removeTag", id.native_id);
        ok_or_error(self.post(&path).json(&body).send().await?).await?;
        Ok(())
    }

    async fn post_comment(&self, id: &TaskId, body: &str) -> Result<()> {
        let payload = json!({ "data": { "text": body } });
        let path = format!("tasks/{}/stories", id.native_id);
        ok_or_error(self.post(&path).json(&payload).send().await?).await?;
        Ok(())
    }

    async fn attach_link(&self, id: &TaskId, url: &str, name: &str) -> Result<()> {
        let payload = json!({
            "data": {
                "parent": id.native_id,
                "resource_subtype": "external",
                "url": url,
                "name": name,
            }
        });
        ok_or_error(self.post("attachments").json(&payload).send().await?).await?;
        Ok(())
    }

    async fn mark_completed(&self, id: &TaskId) -> Result<()> {
        let payload = json!({ "data": { "completed": true } });
        let path = format!("tasks/{}", id.native_id);
        ok_or_error(self.put(&path).json(&payload).send().await?).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        ok_or_error(self.get("users/me").send().await?).await?;
        Ok(())
    }
}
