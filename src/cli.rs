use clap::Parser;
use std::path::PathBuf;

use crate::records::Source;

#[derive(Parser, Debug)]
#[command(name = "ownerlens")]
#[command(about = "Extracts contribution and error-log data into a local store")]
pub struct Cli {
    /// Path to the run configuration
    #[arg(long, default_value = "_config/configuration.toml")]
    pub config: PathBuf,

    /// Path to the credentials file
    #[arg(long, default_value = "_config/secrets.toml")]
    pub secrets: PathBuf,

    /// Path to the issue-tracker export
    #[arg(long, default_value = "_input/jira.csv")]
    pub jira_export: PathBuf,

    /// Path to the store database
    #[arg(long, default_value = "_db/ownerlens.db")]
    pub database: PathBuf,

    /// Extract error logs from the log service
    #[arg(short = 'c', long)]
    pub cloudwatch: bool,

    /// Extract groups, projects, commits and merges
    #[arg(short = 'g', long)]
    pub gitlab: bool,

    /// Extract stories from the issue-tracker export
    #[arg(short = 'j', long)]
    pub jira: bool,

    /// Extract every source
    #[arg(short = 'a', long)]
    pub all: bool,
}

impl Cli {
    /// Sources to run, in extraction order.
    pub fn selected_sources(&self) -> Vec<Source> {
        let mut sources = Vec::new();
        if self.gitlab || self.all {
            sources.push(Source::GitLab);
        }
        if self.cloudwatch || self.all {
            sources.push(Source::CloudWatch);
        }
        if self.jira || self.all {
            sources.push(Source::Jira);
        }
        sources
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_selects_every_source() {
        let cli = Cli::parse_from(["ownerlens", "--all"]);
        assert_eq!(
            cli.selected_sources(),
            vec![Source::GitLab, Source::CloudWatch, Source::Jira]
        );
    }

    #[test]
    fn test_single_source_flags() {
        let cli = Cli::parse_from(["ownerlens", "-j"]);
        assert_eq!(cli.selected_sources(), vec![Source::Jira]);

        let cli = Cli::parse_from(["ownerlens", "-c", "-g"]);
        assert_eq!(
            cli.selected_sources(),
            vec![Source::GitLab, Source::CloudWatch]
        );
    }

    #[test]
    fn test_no_flags_selects_nothing() {
        let cli = Cli::parse_from(["ownerlens"]);
        assert!(cli.selected_sources().is_empty());
    }

    #[test]
    fn test_default_paths() {
        let cli = Cli::parse_from(["ownerlens"]);
        assert_eq!(cli.config, PathBuf::from("_config/configuration.toml"));
        assert_eq!(cli.database, PathBuf::from("_db/ownerlens.db"));
    }
}
