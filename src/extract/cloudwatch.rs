//! Error-log extractor.
//!
//! Runs one Logs Insights query per configured log group against one cloud
//! account, driving the submit/poll state machine:
//!
//!   - submission is paused when the service reports its concurrency limit
//!     and resumes as completed queries free a slot (the limit itself is
//!     never configured, only discovered),
//!   - a query that hits the row cap is re-submitted over a narrower window
//!     starting at the last returned row's timestamp,
//!   - missing log groups are dropped with a warning, throttled polls stay
//!     in flight.
//!
//! Each returned row is attributed to a committer through the blame
//! correlation of the version-control extractor; the raw message never
//! reaches the store.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{AccountConfig, Config, Secrets};
use crate::error::{ExtractError, Result};
use crate::extract::gitlab::GitLab;
use crate::ingest::{IngestMessage, IngestSender};
use crate::records::{self, Account, ErrorLog, LogGroup, Record};

/// Row cap per query response. A result set of exactly this size means the
/// window was not exhausted.
pub const QUERY_LIMIT: usize = 10_000;

const ERROR_LOGS_QUERY: &str =
    "fields @log, @timestamp, @message | sort @timestamp asc | filter @message like 'ERROR'";

const START_QUERY_TARGET: &str = "Logs_20140328.StartQuery";
const GET_RESULTS_TARGET: &str = "Logs_20140328.GetQueryResults";

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Outcome of one submission attempt.
#[derive(Debug)]
enum Submission {
    /// Accepted; carries the query id to poll.
    Started(String),
    /// Concurrency limit reached, retry after a slot frees up.
    LimitReached,
    /// Log group does not exist in this account.
    NotFound,
}

/// Outcome of one poll.
#[derive(Debug)]
enum Poll {
    Complete(Vec<Vec<ResultField>>),
    InProgress,
    Throttled,
}

/// One field of a result row as the service returns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultField {
    pub field: String,
    pub value: String,
}

/// A submitted query awaiting results.
#[derive(Debug)]
struct InFlight {
    query_id: String,
    log_group: String,
}

pub struct CloudWatch {
    account_id: String,
    account: AccountConfig,
    config: Arc<Config>,
    client: reqwest::Client,
    endpoint: String,
    token: String,
    gitlab: GitLab,
    tx: IngestSender,
    cancel: CancellationToken,
    /// Row cap used to detect a truncated window; tests shrink it.
    query_limit: usize,
}

/// Producer entry point for one account.
pub async fn run(
    account_id: String,
    config: Arc<Config>,
    secrets: Arc<Secrets>,
    tx: IngestSender,
    cancel: CancellationToken,
) -> Result<()> {
    CloudWatch::new(account_id, config, secrets, tx, cancel)?
        .extract()
        .await
}

impl CloudWatch {
    pub fn new(
        account_id: String,
        config: Arc<Config>,
        secrets: Arc<Secrets>,
        tx: IngestSender,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let account = config
            .account(&account_id)
            .cloned()
            .ok_or_else(|| ExtractError::Config(format!("unknown account '{account_id}'")))?;
        let token = secrets
            .aws_tokens
            .get(&account_id)
            .cloned()
            .ok_or_else(|| ExtractError::Config(format!("no token for account '{account_id}'")))?;
        let endpoint = secrets
            .logs_endpoint
            .clone()
            .unwrap_or_else(|| format!("https://logs.{}.amazonaws.com", account.region));

        // Blame lookups share the identity and annotation caches across all
        // rows of this account; the instance queues nothing itself.
        let gitlab = GitLab::new(config.clone(), secrets, None, cancel.clone())?;

        Ok(Self {
            account_id,
            account,
            config,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()?,
            endpoint,
            token,
            gitlab,
            tx,
            cancel,
            query_limit: QUERY_LIMIT,
        })
    }

    pub async fn extract(&self) -> Result<()> {
        self.queue_account();
        self.queue_log_groups();

        let windows: VecDeque<(String, i64, i64)> = self
            .config
            .log_groups
            .iter()
            .map(|group| {
                (
                    group.clone(),
                    self.config.start_timestamp,
                    self.config.limit_timestamp,
                )
            })
            .collect();
        self.query_logs(windows).await
    }

    fn queue(&self, record: Record) {
        let _ = self.tx.send(IngestMessage::Record(record));
    }

    fn queue_account(&self) {
        self.queue(Record::Account(Account {
            name: self.account.name.clone(),
            region: self.account.region.clone(),
        }));
    }

    fn queue_log_groups(&self) {
        for (name, project_id) in self.config.log_group_mappings() {
            self.queue(Record::LogGroup(LogGroup {
                name: records::hash_log_group(name),
                project_id,
                account: self.account.name.clone(),
            }));
        }
    }

    /// Drive all windows to completion. Terminates only once nothing is
    /// pending and nothing is in flight.
    async fn query_logs(&self, mut pending: VecDeque<(String, i64, i64)>) -> Result<()> {
        let mut in_flight: Vec<InFlight> = Vec::new();

        while !pending.is_empty() || !in_flight.is_empty() {
            if self.cancel.is_cancelled() {
                return Err(ExtractError::Cancelled);
            }

            self.submit_pending(&mut pending, &mut in_flight).await?;
            self.poll_in_flight(&mut pending, &mut in_flight).await?;

            if !in_flight.is_empty() {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }

        Ok(())
    }

    /// Submit queued windows until the queue drains or the service reports
    /// its concurrency limit. A limited window goes back to the queue front.
    async fn submit_pending(
        &self,
        pending: &mut VecDeque<(String, i64, i64)>,
        in_flight: &mut Vec<InFlight>,
    ) -> Result<()> {
        while let Some((log_group, start, end)) = pending.pop_front() {
            match self.start_error_query(&log_group, start, end).await? {
                Submission::Started(query_id) => {
                    tracing::debug!(account = %self.account_id, %log_group, query_id, "query started");
                    in_flight.push(InFlight { query_id, log_group });
                }
                Submission::LimitReached => {
                    pending.push_front((log_group, start, end));
                    break;
                }
                Submission::NotFound => {
                    tracing::warn!(
                        account = %self.account_id,
                        %log_group,
                        "log group not found, skipping"
                    );
                }
            }
        }
        Ok(())
    }

    /// Poll every in-flight query once. Completed queries free their slot;
    /// a capped result re-queues the remainder of its window.
    async fn poll_in_flight(
        &self,
        pending: &mut VecDeque<(String, i64, i64)>,
        in_flight: &mut Vec<InFlight>,
    ) -> Result<()> {
        let mut index = 0;
        while index < in_flight.len() {
            match self.get_query_results(&in_flight[index].query_id).await? {
                Poll::InProgress | Poll::Throttled => index += 1,
                Poll::Complete(rows) => {
                    let query = in_flight.remove(index);
                    let row_count = rows.len();
                    let last_timestamp = self.handle_query_results(&query.log_group, rows).await;

                    if row_count >= self.query_limit {
                        match last_timestamp {
                            Some(last) => {
                                tracing::info!(
                                    account = %self.account_id,
                                    log_group = %query.log_group,
                                    "row cap reached, narrowing window"
                                );
                                pending.push_back((
                                    query.log_group,
                                    last,
                                    self.config.limit_timestamp,
                                ));
                            }
                            None => tracing::warn!(
                                account = %self.account_id,
                                log_group = %query.log_group,
                                "row cap reached without a usable row timestamp, \
                                 remainder of the window is lost"
                            ),
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Queue an error-log record per row, with the raw message replaced by
    /// the blamed author (when one resolves). Returns the timestamp of the
    /// last row for window narrowing.
    async fn handle_query_results(
        &self,
        submitted_group: &str,
        rows: Vec<Vec<ResultField>>,
    ) -> Option<i64> {
        let mut last_timestamp = None;

        for row in rows {
            let Some(timestamp) = row_timestamp(&row) else {
                tracing::warn!(
                    account = %self.account_id,
                    log_group = %submitted_group,
                    "dropping result row without a parseable timestamp"
                );
                continue;
            };
            last_timestamp = Some(timestamp);

            let log_group = row_log_group(&row)
                .map(str::to_string)
                .unwrap_or_else(|| submitted_group.to_string());
            // The project mapping is keyed on the submitted group name, not
            // the service-reported one.
            let author_id = match row_value(&row, "@message") {
                Some(message) => self.gitlab.blame(message, timestamp, submitted_group).await,
                None => None,
            };

            self.queue(Record::ErrorLog(ErrorLog {
                loggroup: records::hash_log_group(&log_group),
                account: self.account.name.clone(),
                timestamp,
                message: None,
                author_id,
            }));
        }

        last_timestamp
    }

    async fn call(&self, target: &str, body: Value) -> Result<(reqwest::StatusCode, Value)> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("X-Amz-Target", target)
            .header("Content-Type", "application/x-amz-json-1.1")
            .header("Authorization", &self.token)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        let payload: Value = response.json().await.unwrap_or_else(|_| json!({}));
        Ok((status, payload))
    }

    async fn start_error_query(
        &self,
        log_group: &str,
        start: i64,
        end: i64,
    ) -> Result<Submission> {
        let (status, payload) = self
            .call(
                START_QUERY_TARGET,
                json!({
                    "logGroupName": log_group,
                    "startTime": start,
                    "endTime": end,
                    "queryString": ERROR_LOGS_QUERY,
                    "limit": self.query_limit,
                }),
            )
            .await?;

        if !status.is_success() {
            return match error_code(&payload) {
                Some("LimitExceededException") => Ok(Submission::LimitReached),
                Some("ResourceNotFoundException") => Ok(Submission::NotFound),
                code => Err(ExtractError::LogService {
                    code: code.unwrap_or("unknown").to_string(),
                    message: payload["message"].as_str().unwrap_or_default().to_string(),
                }),
            };
        }

        payload["queryId"]
            .as_str()
            .map(|id| Submission::Started(id.to_string()))
            .ok_or_else(|| ExtractError::Payload("start query response without queryId".to_string()))
    }

    async fn get_query_results(&self, query_id: &str) -> Result<Poll> {
        let (status, payload) = self
            .call(GET_RESULTS_TARGET, json!({ "queryId": query_id }))
            .await?;

        if !status.is_success() {
            return match error_code(&payload) {
                Some("ThrottlingException") => Ok(Poll::Throttled),
                code => Err(ExtractError::LogService {
                    code: code.unwrap_or("unknown").to_string(),
                    message: payload["message"].as_str().unwrap_or_default().to_string(),
                }),
            };
        }

        match payload["status"].as_str().unwrap_or_default() {
            "Complete" => {
                let rows: Vec<Vec<ResultField>> =
                    serde_json::from_value(payload["results"].clone()).unwrap_or_default();
                Ok(Poll::Complete(rows))
            }
            "Scheduled" | "Running" => Ok(Poll::InProgress),
            other => Err(ExtractError::QueryFailed {
                query_id: query_id.to_string(),
                status: other.to_string(),
            }),
        }
    }
}

/// Error identifier from a service error payload, with the namespace prefix
/// stripped.
fn error_code(payload: &Value) -> Option<&str> {
    payload["__type"]
        .as_str()
        .map(|code| code.rsplit('#').next().unwrap_or(code))
}

fn row_value<'a>(row: &'a [ResultField], field: &str) -> Option<&'a str> {
    row.iter()
        .find(|entry| entry.field == field)
        .map(|entry| entry.value.as_str())
}

/// The `@log` value carries "account-id:log-group-name".
fn row_log_group(row: &[ResultField]) -> Option<&str> {
    row_value(row, "@log")?.split(':').nth(1)
}

fn row_timestamp(row: &[ResultField]) -> Option<i64> {
    records::parse_log_timestamp(row_value(row, "@timestamp")?)
}
