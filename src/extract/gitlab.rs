//! Version-control extractor.
//!
//! Walks the configured group hierarchy, discovers projects created inside
//! the extraction window and queues groups, projects, commits, authors and
//! merged review requests. Also exposes the blame correlation used by the
//! log extractor to attribute an error line to a committer.
//!
//! All lookups (GET responses, identity resolution, blame annotations) are
//! memoized for the lifetime of the extractor instance. The caches are
//! private to the owning worker and never shared.

use regex::Regex;
use reqwest::Client;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, Secrets};
use crate::error::{ExtractError, Result};
use crate::ingest::{IngestMessage, IngestSender};
use crate::records::{self, Commit, Group, Merge, Project, Record, User};

const NEXT_PAGE_HEADER: &str = "x-next-page";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// One cached GET response: parsed body plus the pagination cursor from the
/// response metadata.
#[derive(Debug, Clone)]
struct CachedPage {
    body: Value,
    next_page: Option<String>,
}

pub struct GitLab {
    config: Arc<Config>,
    secrets: Arc<Secrets>,
    client: Client,
    story_pattern: Regex,
    tx: Option<IngestSender>,
    cancel: CancellationToken,
    page_cache: Mutex<HashMap<String, CachedPage>>,
    identity_cache: Mutex<HashMap<String, String>>,
    blame_cache: Mutex<HashMap<(u64, String, String), Arc<Vec<Value>>>>,
    queued_users: Mutex<HashSet<String>>,
}

/// Producer entry point: construct an extractor and run the full walk.
pub async fn run(
    config: Arc<Config>,
    secrets: Arc<Secrets>,
    tx: IngestSender,
    cancel: CancellationToken,
) -> Result<()> {
    GitLab::new(config, secrets, Some(tx), cancel)?.extract().await
}

impl GitLab {
    /// `tx` is `None` when the instance only serves blame lookups for
    /// another extractor and queues nothing itself.
    pub fn new(
        config: Arc<Config>,
        secrets: Arc<Secrets>,
        tx: Option<IngestSender>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let story_pattern = records::story_key_pattern(&config.project_acronym)?;
        let client = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            config,
            secrets,
            client,
            story_pattern,
            tx,
            cancel,
            page_cache: Mutex::new(HashMap::new()),
            identity_cache: Mutex::new(HashMap::new()),
            blame_cache: Mutex::new(HashMap::new()),
            queued_users: Mutex::new(HashSet::new()),
        })
    }

    pub async fn extract(&self) -> Result<()> {
        for group_id in self.fetch_groups().await? {
            for project_id in self.fetch_projects(group_id).await? {
                if self.cancel.is_cancelled() {
                    return Err(ExtractError::Cancelled);
                }
                self.fetch_commits_and_authors(project_id).await?;
                self.fetch_merges_and_contributors(project_id).await?;
            }
        }
        Ok(())
    }

    fn queue(&self, record: Record) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(IngestMessage::Record(record));
        }
    }

    /// Queue a user record once per hashed id.
    fn queue_user(&self, id: &str) {
        if self.queued_users.lock().unwrap().insert(id.to_string()) {
            self.queue(Record::User(User { id: id.to_string() }));
        }
    }

    fn api_url(&self, uri: &str, params: &[(&str, String)]) -> Result<reqwest::Url> {
        let base = format!("{}/api/v4{}", self.secrets.gitlab_host, uri);
        reqwest::Url::parse_with_params(&base, params)
            .map_err(|e| ExtractError::Config(format!("invalid gitlab url {base}: {e}")))
    }

    /// Authorized, memoized GET. A non-success status is fatal to the
    /// caller unless it explicitly swallows it (blame does).
    async fn get(&self, url: &str) -> Result<CachedPage> {
        if let Some(hit) = self.page_cache.lock().unwrap().get(url).cloned() {
            return Ok(hit);
        }

        let response = self
            .client
            .get(url)
            .header("PRIVATE-TOKEN", &self.secrets.gitlab_token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ExtractError::GitLabApi {
                status: status.as_u16(),
                message,
            });
        }

        let next_page = response
            .headers()
            .get(NEXT_PAGE_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(String::from);
        let body: Value = response.json().await?;

        let page = CachedPage { body, next_page };
        self.page_cache
            .lock()
            .unwrap()
            .insert(url.to_string(), page.clone());
        Ok(page)
    }

    async fn fetch_single(&self, uri: &str, params: &[(&str, String)]) -> Result<Value> {
        Ok(self.get(self.api_url(uri, params)?.as_str()).await?.body)
    }

    /// Walk a paginated endpoint, following the next-page cursor from the
    /// response header until none is supplied, and return the concatenation
    /// of every page's items in page order.
    async fn fetch_paged(&self, uri: &str, params: &[(&str, String)]) -> Result<Vec<Value>> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            if self.cancel.is_cancelled() {
                return Err(ExtractError::Cancelled);
            }

            let mut query: Vec<(&str, String)> = params.to_vec();
            if let Some(page) = &cursor {
                query.push(("page", page.clone()));
            }

            let page = self.get(self.api_url(uri, &query)?.as_str()).await?;
            if let Some(array) = page.body.as_array() {
                items.extend(array.iter().cloned());
            }

            match page.next_page {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(items)
    }

    /// Queue the parent group and all descendant groups, returning every
    /// group id to walk for projects.
    async fn fetch_groups(&self) -> Result<Vec<u64>> {
        let parent = self.config.parent_group;
        let root = self.fetch_single(&format!("/groups/{parent}/"), &[]).await?;
        self.queue(Record::Group(group_from_json(&root)?));

        let mut ids = vec![parent];
        for data in self
            .fetch_paged(&format!("/groups/{parent}/descendant_groups"), &[])
            .await?
        {
            let group = group_from_json(&data)?;
            ids.push(group.id);
            self.queue(Record::Group(group));
        }
        Ok(ids)
    }

    /// Queue the non-archived projects of a group that were created inside
    /// the extraction window, returning their ids.
    async fn fetch_projects(&self, group_id: u64) -> Result<Vec<u64>> {
        let mut ids = Vec::new();
        for data in self
            .fetch_paged(
                &format!("/groups/{group_id}/projects"),
                &[("archived", "false".to_string())],
            )
            .await?
        {
            let created_at = data["created_at"].as_str().unwrap_or_default();
            if created_at >= self.config.start_time.as_str()
                && created_at <= self.config.limit_time.as_str()
            {
                let project = project_from_json(&data, &self.config)?;
                ids.push(project.id);
                self.queue(Record::Project(project));
            }
        }
        Ok(ids)
    }

    async fn fetch_commits_and_authors(&self, project_id: u64) -> Result<()> {
        for data in self
            .fetch_paged(
                &format!("/projects/{project_id}/repository/commits"),
                &[
                    ("with_stats", "true".to_string()),
                    ("since", self.config.start_time.clone()),
                    ("until", self.config.limit_time.clone()),
                ],
            )
            .await?
        {
            let mail = str_field(&data, "author_email")?;
            let username = self.resolve_username(mail).await?;
            let author_id = records::hash_user_id(&username);
            self.queue_user(&author_id);
            self.queue(Record::Commit(commit_from_json(&data, project_id, &author_id)?));
        }
        Ok(())
    }

    async fn fetch_merges_and_contributors(&self, project_id: u64) -> Result<()> {
        for data in self
            .fetch_paged(
                &format!("/projects/{project_id}/merge_requests"),
                &[
                    ("state", "merged".to_string()),
                    ("created_after", self.config.start_time.clone()),
                    ("updated_before", self.config.limit_time.clone()),
                ],
            )
            .await?
        {
            let mut merge = merge_from_json(&data, &self.story_pattern)?;

            let participants = self
                .fetch_single(
                    &format!(
                        "/projects/{project_id}/merge_requests/{}/participants",
                        merge.internal_id
                    ),
                    &[],
                )
                .await?;
            for participant in participants.as_array().cloned().unwrap_or_default() {
                let contributor_id = records::hash_user_id(str_field(&participant, "username")?);
                self.queue_user(&contributor_id);
                if contributor_id != merge.author_id {
                    merge.contributor_ids.push(contributor_id);
                }
            }

            self.queue(Record::Merge(merge));
        }
        Ok(())
    }

    /// Resolve an author email to a platform username via the search API,
    /// falling back to the configured alias table when the search misses.
    async fn resolve_username(&self, mail: &str) -> Result<String> {
        if let Some(hit) = self.identity_cache.lock().unwrap().get(mail).cloned() {
            return Ok(hit);
        }

        let results = self
            .fetch_single(
                "/search",
                &[("scope", "users".to_string()), ("search", mail.to_string())],
            )
            .await?;

        let username = match results
            .as_array()
            .and_then(|matches| matches.first())
            .and_then(|user| user["username"].as_str())
        {
            Some(name) => name.to_string(),
            None => self
                .config
                .user_alias(mail)
                .map(str::to_string)
                .ok_or_else(|| ExtractError::UnknownIdentity(mail.to_string()))?,
        };

        self.identity_cache
            .lock()
            .unwrap()
            .insert(mail.to_string(), username.clone());
        Ok(username)
    }

    /// Id of the most recent commit at or before `time`.
    async fn most_recent_commit(&self, project_id: u64, time: &str) -> Result<String> {
        let commits = self
            .fetch_single(
                &format!("/projects/{project_id}/repository/commits"),
                &[("with_stats", "true".to_string()), ("until", time.to_string())],
            )
            .await?;
        commits
            .as_array()
            .and_then(|list| list.first())
            .and_then(|commit| commit["id"].as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                ExtractError::Payload(format!(
                    "no commit before {time} in project {project_id}"
                ))
            })
    }

    /// Blame annotation of `file` as of the most recent commit at or before
    /// `time`, memoized per (project, file, time).
    async fn fetch_blame(&self, project_id: u64, file: &str, time: &str) -> Result<Arc<Vec<Value>>> {
        let key = (project_id, file.to_string(), time.to_string());
        if let Some(hit) = self.blame_cache.lock().unwrap().get(&key).cloned() {
            return Ok(hit);
        }

        let last_commit = self.most_recent_commit(project_id, time).await?;
        let ranges = Arc::new(
            self.fetch_paged(
                &format!(
                    "/projects/{project_id}/repository/files/{}/blame",
                    urlencoding::encode(file)
                ),
                &[("ref", last_commit)],
            )
            .await?,
        );

        self.blame_cache.lock().unwrap().insert(key, ranges.clone());
        Ok(ranges)
    }

    /// Attribute an error message to the hashed identity of the committer
    /// whose blamed line matches one of the message's source candidates.
    ///
    /// Any failure while handling one candidate (blame retrieval, identity
    /// resolution) skips that candidate only; no match yields `None`.
    pub async fn blame(&self, message: &str, timestamp: i64, log_group: &str) -> Option<String> {
        let time = records::epoch_to_zulu(timestamp);
        let project_id = self.config.project_for_log_group(log_group)?;

        'candidates: for (file, statement) in records::error_candidates(message) {
            let ranges = match self.fetch_blame(project_id, &file, &time).await {
                Ok(ranges) => ranges,
                Err(_) => continue,
            };

            for range in ranges.iter() {
                let matched = range["lines"]
                    .as_array()
                    .map(|lines| {
                        lines
                            .iter()
                            .filter_map(Value::as_str)
                            .any(|line| line.trim() == statement)
                    })
                    .unwrap_or(false);
                if !matched {
                    continue;
                }

                let Some(mail) = range["commit"]["author_email"].as_str() else {
                    continue;
                };
                match self.resolve_username(mail).await {
                    Ok(username) => return Some(records::hash_user_id(&username)),
                    Err(_) => continue 'candidates,
                }
            }
        }
        None
    }
}

fn u64_field(data: &Value, field: &str) -> Result<u64> {
    data[field]
        .as_u64()
        .ok_or_else(|| ExtractError::Payload(format!("missing numeric field '{field}'")))
}

fn str_field<'a>(data: &'a Value, field: &str) -> Result<&'a str> {
    data[field]
        .as_str()
        .ok_or_else(|| ExtractError::Payload(format!("missing string field '{field}'")))
}

fn iso_field(data: &Value, field: &str) -> Result<i64> {
    let raw = str_field(data, field)?;
    records::parse_iso_timestamp(raw)
        .ok_or_else(|| ExtractError::Payload(format!("invalid timestamp in '{field}': {raw}")))
}

fn group_from_json(data: &Value) -> Result<Group> {
    Ok(Group {
        id: u64_field(data, "id")?,
        parent_id: data["parent_id"].as_u64(),
    })
}

fn project_from_json(data: &Value, config: &Config) -> Result<Project> {
    let id = u64_field(data, "id")?;
    let log_groups = config
        .log_groups_for_project(id)
        .iter()
        .map(|name| records::hash_log_group(name))
        .collect();
    Ok(Project {
        id,
        default_branch: data["default_branch"].as_str().map(str::to_string),
        log_groups,
        platforms: config.platforms_for_project(id),
        technologies: config.technologies_for_project(id),
        group_id: data["namespace"]["id"].as_u64(),
    })
}

fn commit_from_json(data: &Value, project_id: u64, author_id: &str) -> Result<Commit> {
    Ok(Commit {
        id: str_field(data, "id")?.to_string(),
        short_id: str_field(data, "short_id")?.to_string(),
        timestamp: iso_field(data, "authored_date")?,
        changed_loc: data["stats"]["total"]
            .as_u64()
            .ok_or_else(|| ExtractError::Payload("missing commit stats".to_string()))?,
        project_id,
        author_id: author_id.to_string(),
    })
}

fn merge_from_json(data: &Value, story_pattern: &Regex) -> Result<Merge> {
    let title = data["title"].as_str().unwrap_or_default();
    let description = data["description"].as_str().unwrap_or_default();
    let story_id = records::story_id_from_text(story_pattern, &format!("{title}{description}"));

    Ok(Merge {
        id: u64_field(data, "id")?,
        internal_id: u64_field(data, "iid")?,
        project_id: u64_field(data, "project_id")?,
        author_id: records::hash_user_id(str_field(&data["author"], "username")?),
        timestamp: iso_field(data, "merged_at")?,
        contributor_ids: Vec::new(),
        story_id,
    })
}
