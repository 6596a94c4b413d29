use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Immutable run configuration: extraction window, account list and the
/// mappings between projects and log groups. Injected into every extractor
/// at spawn time; never consulted as shared mutable state.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// ISO-8601 start of the extraction window (used for API query params)
    pub start_time: String,
    /// ISO-8601 end of the extraction window
    pub limit_time: String,
    /// Window start as epoch seconds (used for log queries)
    pub start_timestamp: i64,
    /// Window end as epoch seconds
    pub limit_timestamp: i64,
    /// Issue-key acronym used by the story-id heuristic
    pub project_acronym: String,
    /// Root of the group hierarchy to walk
    pub parent_group: u64,
    /// Cloud accounts keyed by account id
    pub aws_accounts: HashMap<String, AccountConfig>,
    /// Log groups to query, in submission order
    pub log_groups: Vec<String>,
    /// Per-project metadata keyed by project id
    pub project_mappings: HashMap<String, ProjectMapping>,
    /// Log group name -> owning project id
    pub log_group_mappings: HashMap<String, u64>,
    /// Fallback mail -> username table for identities the search API misses
    pub user_alias: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccountConfig {
    pub name: String,
    pub region: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProjectMapping {
    pub log_groups: Vec<String>,
    pub platforms: Vec<String>,
    pub technologies: Vec<String>,
}

/// API credentials, kept separate from the sharable configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Secrets {
    pub gitlab_host: String,
    pub gitlab_token: String,
    /// Log service tokens keyed by account id
    #[serde(default)]
    pub aws_tokens: HashMap<String, String>,
    /// Overrides the regional log service endpoint (used by tests)
    #[serde(default)]
    pub logs_endpoint: Option<String>,
}

impl Config {
    /// Account ids in a stable order.
    pub fn account_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.aws_accounts.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn account(&self, id: &str) -> Option<&AccountConfig> {
        self.aws_accounts.get(id)
    }

    /// Raw log group names linked to a project (hashed only at record time).
    pub fn log_groups_for_project(&self, project_id: u64) -> Vec<String> {
        self.project_mappings
            .get(&project_id.to_string())
            .map(|mapping| mapping.log_groups.clone())
            .unwrap_or_default()
    }

    pub fn project_for_log_group(&self, name: &str) -> Option<u64> {
        self.log_group_mappings.get(name).copied()
    }

    pub fn platforms_for_project(&self, project_id: u64) -> Vec<String> {
        self.project_mappings
            .get(&project_id.to_string())
            .map(|mapping| mapping.platforms.clone())
            .unwrap_or_default()
    }

    pub fn technologies_for_project(&self, project_id: u64) -> Vec<String> {
        self.project_mappings
            .get(&project_id.to_string())
            .map(|mapping| mapping.technologies.clone())
            .unwrap_or_default()
    }

    pub fn log_group_mappings(&self) -> impl Iterator<Item = (&str, u64)> {
        self.log_group_mappings
            .iter()
            .map(|(name, project_id)| (name.as_str(), *project_id))
    }

    pub fn user_alias(&self, mail: &str) -> Option<&str> {
        self.user_alias.get(mail).map(String::as_str)
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let cfg = config::Config::builder()
        .add_source(config::File::from(path))
        .add_source(config::Environment::with_prefix("OWNERLENS").separator("__"))
        .build()?;

    let cfg: Config = cfg.try_deserialize()?;
    validate_config(&cfg)?;
    Ok(cfg)
}

pub fn load_secrets(path: &Path) -> anyhow::Result<Secrets> {
    let secrets = config::Config::builder()
        .add_source(config::File::from(path))
        .add_source(config::Environment::with_prefix("OWNERLENS_SECRETS").separator("__"))
        .build()?;

    let secrets: Secrets = secrets.try_deserialize()?;
    if secrets.gitlab_host.is_empty() || secrets.gitlab_token.is_empty() {
        anyhow::bail!("gitlab_host and gitlab_token must be configured");
    }
    Ok(secrets)
}

fn validate_config(cfg: &Config) -> anyhow::Result<()> {
    if cfg.start_timestamp >= cfg.limit_timestamp {
        anyhow::bail!("extraction window is empty: start_timestamp must be before limit_timestamp");
    }

    if cfg.project_acronym.is_empty() {
        anyhow::bail!("project_acronym must not be empty");
    }

    for log_group in &cfg.log_groups {
        if !cfg.log_group_mappings.contains_key(log_group) {
            anyhow::bail!("log group '{}' has no project mapping", log_group);
        }
    }

    Ok(())
}

/// Fixtures shared by extractor unit tests.
#[cfg(test)]
pub mod tests_support {
    use super::*;

    pub fn create_test_setup() -> (Config, Secrets) {
        let mut aws_accounts = HashMap::new();
        aws_accounts.insert(
            "111".to_string(),
            AccountConfig {
                name: "development".to_string(),
                region: "eu-central-1".to_string(),
            },
        );
        aws_accounts.insert(
            "222".to_string(),
            AccountConfig {
                name: "production".to_string(),
                region: "eu-central-1".to_string(),
            },
        );

        let mut project_mappings = HashMap::new();
        project_mappings.insert(
            "101".to_string(),
            ProjectMapping {
                log_groups: vec!["app-service".to_string()],
                platforms: vec!["aws".to_string()],
                technologies: vec!["python".to_string()],
            },
        );

        let mut log_group_mappings = HashMap::new();
        log_group_mappings.insert("app-service".to_string(), 101);

        let config = Config {
            start_time: "2023-01-01T00:00:00Z".to_string(),
            limit_time: "2023-12-31T23:59:59Z".to_string(),
            start_timestamp: 1_672_531_200,
            limit_timestamp: 1_704_067_199,
            project_acronym: "PROJ".to_string(),
            parent_group: 7,
            aws_accounts,
            log_groups: vec!["app-service".to_string()],
            project_mappings,
            log_group_mappings,
            user_alias: HashMap::from([(
                "ghost@example.com".to_string(),
                "casper".to_string(),
            )]),
        };

        let secrets = Secrets {
            gitlab_host: "http://gitlab.invalid".to_string(),
            gitlab_token: "test-token".to_string(),
            aws_tokens: HashMap::from([
                ("111".to_string(), "aws-token-dev".to_string()),
                ("222".to_string(), "aws-token-prod".to_string()),
            ]),
            logs_endpoint: None,
        };

        (config, secrets)
    }
}
