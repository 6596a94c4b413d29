//! Normalized record types shared by every extractor.
//!
//! Each record kind maps to one table (label) in the document store.
//! Identities and log-group names are one-way hashed before a record is
//! queued, so nothing reversible ever reaches the store.

use chrono::{DateTime, NaiveDateTime};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::LazyLock;

use crate::error::{ExtractError, Result};

/// Source-line candidates inside a log message. The fixed format is a
/// stack-trace line naming a file under /var/task followed by the offending
/// statement indented with four non-breaking spaces.
static ERRORMSG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(/var/task/)([A-Za-z0-9_/.]+)(.*\n\x{A0}{4})(.+)(\n\x{A0}{2}|$)")
        .expect("error message pattern")
});

static SPRINT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("sprint pattern"));

/// Table name identifying a record kind in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Label {
    Account,
    LogGroup,
    ErrorLog,
    User,
    Commit,
    Merge,
    Project,
    Group,
    Story,
}

impl Label {
    pub const ALL: [Label; 9] = [
        Label::Account,
        Label::LogGroup,
        Label::ErrorLog,
        Label::User,
        Label::Commit,
        Label::Merge,
        Label::Project,
        Label::Group,
        Label::Story,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Label::Account => "account",
            Label::LogGroup => "loggroup",
            Label::ErrorLog => "errorlog",
            Label::User => "user",
            Label::Commit => "commit",
            Label::Merge => "merge",
            Label::Project => "project",
            Label::Group => "group",
            Label::Story => "story",
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A data source groups the labels it owns; `Store::clear` truncates
/// exactly one source's tables before a fresh run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    CloudWatch,
    GitLab,
    Jira,
}

impl Source {
    pub fn labels(self) -> &'static [Label] {
        match self {
            Source::CloudWatch => &[Label::Account, Label::LogGroup, Label::ErrorLog],
            Source::GitLab => &[
                Label::User,
                Label::Commit,
                Label::Merge,
                Label::Project,
                Label::Group,
            ],
            Source::Jira => &[Label::Story],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Source::CloudWatch => "cloudwatch",
            Source::GitLab => "gitlab",
            Source::Jira => "jira",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn truncated_digest(input: &str, chars: usize) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut out = String::with_capacity(chars);
    for byte in digest.iter() {
        out.push_str(&format!("{:02x}", byte));
        if out.len() >= chars {
            break;
        }
    }
    out.truncate(chars);
    out
}

/// One-way hash masking a platform username or email.
pub fn hash_user_id(id: &str) -> String {
    truncated_digest(id, 8)
}

/// One-way hash masking a log group name.
pub fn hash_log_group(name: &str) -> String {
    truncated_digest(name, 16)
}

/// A cloud account owning log groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub name: String,
    pub region: String,
}

/// A log group, stored under its hashed name and linked to one project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogGroup {
    pub name: String,
    pub project_id: u64,
    pub account: String,
}

/// A production error log line. The raw message is stripped before the
/// record is queued; only the resolved author survives ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorLog {
    pub loggroup: String,
    pub account: String,
    pub timestamp: i64,
    pub message: Option<String>,
    pub author_id: Option<String>,
}

/// A contributor, identified only by a hashed id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub id: String,
    pub short_id: String,
    pub timestamp: i64,
    pub changed_loc: u64,
    pub project_id: u64,
    pub author_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Merge {
    pub id: u64,
    pub internal_id: u64,
    pub project_id: u64,
    pub author_id: String,
    pub timestamp: i64,
    pub contributor_ids: Vec<String>,
    pub story_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: u64,
    pub default_branch: Option<String>,
    pub log_groups: Vec<String>,
    pub platforms: Vec<String>,
    pub technologies: Vec<String>,
    pub group_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: u64,
    pub parent_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    pub id: u64,
    pub sprints: Vec<u64>,
}

impl Story {
    /// Parse one data row of the issue-tracker export: column 0 is the story
    /// id, every other non-empty column carries an embedded sprint number.
    pub fn from_export_row(columns: &[&str]) -> Result<Story> {
        let raw_id = columns
            .first()
            .ok_or_else(|| ExtractError::IssueExport("empty row".to_string()))?;
        let id: u64 = raw_id
            .trim()
            .parse()
            .map_err(|_| ExtractError::IssueExport(format!("invalid story id '{raw_id}'")))?;

        let mut sprints = Vec::new();
        for column in &columns[1..] {
            if column.trim().is_empty() {
                continue;
            }
            let digits = SPRINT_RE.find(column).ok_or_else(|| {
                ExtractError::IssueExport(format!("no sprint number in '{column}'"))
            })?;
            let sprint: u64 = digits.as_str().parse().map_err(|_| {
                ExtractError::IssueExport(format!("sprint number out of range in '{column}'"))
            })?;
            sprints.push(sprint);
        }
        Ok(Story { id, sprints })
    }
}

/// Tagged envelope carried over the ingestion channel so the writer can
/// dispatch records without inspecting loose fields.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Account(Account),
    LogGroup(LogGroup),
    ErrorLog(ErrorLog),
    User(User),
    Commit(Commit),
    Merge(Merge),
    Project(Project),
    Group(Group),
    Story(Story),
}

impl Record {
    pub fn label(&self) -> Label {
        match self {
            Record::Account(_) => Label::Account,
            Record::LogGroup(_) => Label::LogGroup,
            Record::ErrorLog(_) => Label::ErrorLog,
            Record::User(_) => Label::User,
            Record::Commit(_) => Label::Commit,
            Record::Merge(_) => Label::Merge,
            Record::Project(_) => Label::Project,
            Record::Group(_) => Label::Group,
            Record::Story(_) => Label::Story,
        }
    }

    /// Serialize the payload as the JSON document body stored in the table.
    pub fn to_body(&self) -> serde_json::Result<String> {
        match self {
            Record::Account(payload) => serde_json::to_string(payload),
            Record::LogGroup(payload) => serde_json::to_string(payload),
            Record::ErrorLog(payload) => serde_json::to_string(payload),
            Record::User(payload) => serde_json::to_string(payload),
            Record::Commit(payload) => serde_json::to_string(payload),
            Record::Merge(payload) => serde_json::to_string(payload),
            Record::Project(payload) => serde_json::to_string(payload),
            Record::Group(payload) => serde_json::to_string(payload),
            Record::Story(payload) => serde_json::to_string(payload),
        }
    }

    /// Rehydrate a stored document body into the record kind of its table.
    pub fn from_body(label: Label, body: &str) -> serde_json::Result<Record> {
        Ok(match label {
            Label::Account => Record::Account(serde_json::from_str(body)?),
            Label::LogGroup => Record::LogGroup(serde_json::from_str(body)?),
            Label::ErrorLog => Record::ErrorLog(serde_json::from_str(body)?),
            Label::User => Record::User(serde_json::from_str(body)?),
            Label::Commit => Record::Commit(serde_json::from_str(body)?),
            Label::Merge => Record::Merge(serde_json::from_str(body)?),
            Label::Project => Record::Project(serde_json::from_str(body)?),
            Label::Group => Record::Group(serde_json::from_str(body)?),
            Label::Story => Record::Story(serde_json::from_str(body)?),
        })
    }

    pub fn into_account(self) -> Option<Account> {
        match self {
            Record::Account(payload) => Some(payload),
            _ => None,
        }
    }

    pub fn into_error_log(self) -> Option<ErrorLog> {
        match self {
            Record::ErrorLog(payload) => Some(payload),
            _ => None,
        }
    }

    pub fn into_user(self) -> Option<User> {
        match self {
            Record::User(payload) => Some(payload),
            _ => None,
        }
    }

    pub fn into_commit(self) -> Option<Commit> {
        match self {
            Record::Commit(payload) => Some(payload),
            _ => None,
        }
    }

    pub fn into_merge(self) -> Option<Merge> {
        match self {
            Record::Merge(payload) => Some(payload),
            _ => None,
        }
    }

    pub fn into_story(self) -> Option<Story> {
        match self {
            Record::Story(payload) => Some(payload),
            _ => None,
        }
    }
}

/// Compile the story-key heuristic for a project acronym: a run of the
/// acronym's letters, an optional separator, then digits. The minimum run
/// length is capped at five letters.
pub fn story_key_pattern(acronym: &str) -> Result<Regex> {
    if acronym.is_empty() || !acronym.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ExtractError::Config(format!(
            "project acronym must be alphanumeric, got {acronym:?}"
        )));
    }
    let min_run = acronym.chars().count().min(5);
    let pattern = format!(r"(?i)[{acronym}]{{{min_run},}}[\s_-]*(\d+)");
    Regex::new(&pattern).map_err(|e| ExtractError::Config(format!("story key pattern: {e}")))
}

/// Extract a story id from merge title + description. Matches of 1000 and
/// above are incidental numbers, not story keys, and are discarded.
pub fn story_id_from_text(pattern: &Regex, text: &str) -> Option<u64> {
    let id: u64 = pattern.captures(text)?.get(1)?.as_str().parse().ok()?;
    (id > 0 && id < 1000).then_some(id)
}

/// Candidate (file, statement) pairs extracted from an error message, in
/// reverse match order so the innermost frame comes first.
pub fn error_candidates(message: &str) -> Vec<(String, String)> {
    let mut candidates = Vec::new();
    for caps in ERRORMSG_RE.captures_iter(message) {
        candidates.insert(0, (caps[2].to_string(), caps[4].to_string()));
    }
    candidates
}

/// Parse the log service's result timestamp ("2023-06-20 10:00:00.000",
/// UTC) into epoch seconds.
pub fn parse_log_timestamp(value: &str) -> Option<i64> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|dt| dt.and_utc().timestamp())
}

/// Parse an ISO-8601 timestamp into epoch seconds.
pub fn parse_iso_timestamp(value: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.timestamp())
}

/// Render epoch seconds as a Zulu-style timestamp for time-scoped API calls.
pub fn epoch_to_zulu(timestamp: i64) -> String {
    DateTime::<chrono::Utc>::from_timestamp(timestamp, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_default()
}
