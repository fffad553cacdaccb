//! Cloud repository backed by a JSON-over-HTTP service.
//!
//! | operation | request                                              |
//! |-----------|------------------------------------------------------|
//! | query all | `GET {base}/projects`                                |
//! | query id  | `GET {base}/projects/{id}` (`404` = no such project) |
//! | save      | `PUT {base}/projects/{id}`, `If-Match: "<version>"`  |
//! | delete    | `DELETE {base}/projects/{id}`                        |
//!
//! A save rejected with `409` or `412` means another writer got there
//! first. The service pushes no notifications; changes are picked up by
//! periodic refreshes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, IF_MATCH, USER_AGENT};
use reqwest::StatusCode;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{ChangeListener, ListenerId, ListenerRegistry, Query, Repository, RepositoryId};
use crate::config::CloudConfig;
use crate::errors::RepositoryError;
use crate::model::{Project, ProjectSnapshot, RepositoryType};

#[derive(Clone)]
pub struct CloudRepository {
    id: RepositoryId,
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    listeners: Arc<ListenerRegistry>,
}

impl CloudRepository {
    pub fn new(config: &CloudConfig) -> Result<Self, RepositoryError> {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("projectsync/", env!("CARGO_PKG_VERSION"))),
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        info!(base_url = %base_url, authenticated = config.token.is_some(), "created cloud repository");
        Ok(Self {
            id: RepositoryId::new(format!("cloud:{}", base_url)),
            http,
            base_url,
            token: config.token.clone(),
            listeners: Arc::new(ListenerRegistry::default()),
        })
    }

    fn project_url(&self, id: Uuid) -> String {
        format!("{}/projects/{}", self.base_url, id)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let request = self.http.request(method, url);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn stamp(&self, snapshots: Vec<ProjectSnapshot>) -> Vec<Project> {
        snapshots
            .into_iter()
            .map(|s| Project::loaded(s, self.id.clone()))
            .collect()
    }
}

/// What a response status means for a request about one project.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Ok,
    NotFound,
    Conflict,
    Failed,
}

fn classify_status(status: StatusCode) -> Status {
    match status.as_u16() {
        200..=299 => Status::Ok,
        404 => Status::NotFound,
        409 | 412 => Status::Conflict,
        _ => Status::Failed,
    }
}

/// Decode a project listing entry by entry. Entries that do not decode are
/// skipped so one bad document does not hide the rest.
fn parse_listing(entries: Vec<serde_json::Value>) -> Vec<ProjectSnapshot> {
    let total = entries.len();
    let snapshots: Vec<ProjectSnapshot> = entries
        .into_iter()
        .enumerate()
        .filter_map(|(index, entry)| match serde_json::from_value(entry) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(index, error = %e, "skipping unreadable project in listing");
                None
            }
        })
        .collect();
    if snapshots.len() < total {
        debug!(skipped = total - snapshots.len(), total, "listing had unreadable entries");
    }
    snapshots
}

fn failure(operation: &str, status: StatusCode) -> RepositoryError {
    RepositoryError::Persistence(format!("{} failed: HTTP {}", operation, status))
}

#[async_trait]
impl Repository for CloudRepository {
    fn id(&self) -> &RepositoryId {
        &self.id
    }

    fn repository_type(&self) -> RepositoryType {
        RepositoryType::Cloud
    }

    #[instrument(skip(self), fields(repository = %self.id))]
    async fn query(&self, query: &Query) -> Result<Vec<Project>, RepositoryError> {
        let snapshots = match query {
            Query::All => {
                let url = format!("{}/projects", self.base_url);
                let resp = self.request(reqwest::Method::GET, &url).send().await?;
                match classify_status(resp.status()) {
                    Status::Ok => parse_listing(resp.json::<Vec<serde_json::Value>>().await?),
                    _ => return Err(failure("list projects", resp.status())),
                }
            }
            Query::ById(id) => {
                let resp = self
                    .request(reqwest::Method::GET, &self.project_url(*id))
                    .send()
                    .await?;
                match classify_status(resp.status()) {
                    Status::Ok => vec![resp.json::<ProjectSnapshot>().await?],
                    Status::NotFound => Vec::new(),
                    _ => return Err(failure("get project", resp.status())),
                }
            }
        };
        debug!(count = snapshots.len(), "fetched projects");
        Ok(self.stamp(snapshots))
    }

    #[instrument(skip(self, snapshot), fields(project_id = %snapshot.id, basis = snapshot.version))]
    async fn save(&self, snapshot: &ProjectSnapshot) -> Result<ProjectSnapshot, RepositoryError> {
        let mut body = snapshot.clone();
        body.repository_type = RepositoryType::Cloud;
        let resp = self
            .request(reqwest::Method::PUT, &self.project_url(snapshot.id))
            .header(IF_MATCH, format!("\"{}\"", snapshot.version))
            .json(&body)
            .send()
            .await?;
        match classify_status(resp.status()) {
            Status::Ok => {
                let stored: ProjectSnapshot = resp.json().await?;
                debug!(version = stored.version, "project saved");
                Ok(stored)
            }
            Status::Conflict => Err(RepositoryError::Outdated {
                id: snapshot.id,
                stored_version: None,
                basis_version: snapshot.version,
            }),
            _ => Err(failure("save project", resp.status())),
        }
    }

    #[instrument(skip(self), fields(repository = %self.id))]
    async fn delete(&self, id: Uuid) -> Result<(), RepositoryError> {
        let resp = self
            .request(reqwest::Method::DELETE, &self.project_url(id))
            .send()
            .await?;
        match classify_status(resp.status()) {
            Status::Ok => {
                info!(project_id = %id, "project deleted");
                Ok(())
            }
            Status::NotFound => Err(RepositoryError::NotFound(id)),
            _ => Err(failure("delete project", resp.status())),
        }
    }

    fn add_change_listener(&self, listener: Arc<dyn ChangeListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_change_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}
