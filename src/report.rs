//! Post-run summary printed to the terminal.

use colored::Colorize;
use tabled::settings::Style;
use tabled::{Table, Tabled};

use crate::error::Result;
use crate::records::{Label, Record};
use crate::store::Store;

#[derive(Tabled)]
struct MetricRow {
    platform: String,
    metric: String,
    value: u64,
}

#[derive(Tabled)]
struct ContributorRow {
    user: String,
    commits: u64,
    lines_changed: u64,
    merges: u64,
}

fn metric(platform: &str, name: &str, value: u64) -> MetricRow {
    MetricRow {
        platform: platform.to_string(),
        metric: name.to_string(),
        value,
    }
}

/// Per-account breakdown of log groups, error logs and attributed error
/// logs, one block of rows per account.
fn account_rows(
    accounts: &[crate::records::Account],
    log_groups: &[Record],
    error_logs: &[crate::records::ErrorLog],
) -> Vec<MetricRow> {
    let mut rows = Vec::new();
    for account in accounts {
        let owned_groups = log_groups
            .iter()
            .filter(|record| {
                matches!(record, Record::LogGroup(group) if group.account == account.name)
            })
            .count() as u64;
        let logs = error_logs
            .iter()
            .filter(|log| log.account == account.name)
            .count() as u64;
        let attributed = error_logs
            .iter()
            .filter(|log| log.account == account.name && log.author_id.is_some())
            .count() as u64;

        rows.push(metric("cloudwatch", &format!("{}: log groups", account.name), owned_groups));
        rows.push(metric("cloudwatch", &format!("{}: error logs", account.name), logs));
        rows.push(metric(
            "cloudwatch",
            &format!("{}: attributed error logs", account.name),
            attributed,
        ));
    }
    rows
}

pub async fn print_summary(store: &Store) -> Result<()> {
    let merges: Vec<_> = store
        .all(Label::Merge)
        .await?
        .into_iter()
        .filter_map(Record::into_merge)
        .collect();
    let commits: Vec<_> = store
        .all(Label::Commit)
        .await?
        .into_iter()
        .filter_map(Record::into_commit)
        .collect();
    let users: Vec<_> = store
        .all(Label::User)
        .await?
        .into_iter()
        .filter_map(Record::into_user)
        .collect();
    let accounts: Vec<_> = store
        .all(Label::Account)
        .await?
        .into_iter()
        .filter_map(Record::into_account)
        .collect();
    let error_logs: Vec<_> = store
        .all(Label::ErrorLog)
        .await?
        .into_iter()
        .filter_map(Record::into_error_log)
        .collect();

    let mut metrics = vec![
        metric("gitlab", "groups", store.count(Label::Group).await?),
        metric("gitlab", "projects", store.count(Label::Project).await?),
        metric("gitlab", "commits", commits.len() as u64),
        metric("gitlab", "merges", merges.len() as u64),
        metric(
            "gitlab",
            "merges with story",
            merges.iter().filter(|m| m.story_id.is_some()).count() as u64,
        ),
        metric(
            "gitlab",
            "merges with review",
            merges.iter().filter(|m| !m.contributor_ids.is_empty()).count() as u64,
        ),
        metric("gitlab", "contributors", users.len() as u64),
        metric("jira", "stories", store.count(Label::Story).await?),
        metric("cloudwatch", "accounts", accounts.len() as u64),
    ];

    let log_groups: Vec<_> = store
        .all(Label::LogGroup)
        .await?
        .into_iter()
        .collect();
    metrics.extend(account_rows(&accounts, &log_groups, &error_logs));

    println!("\n{}", "extraction summary".bold());
    println!("{}", Table::new(metrics).with(Style::psql()));

    if !users.is_empty() {
        let mut rows: Vec<ContributorRow> = users
            .iter()
            .map(|user| ContributorRow {
                user: user.id.clone(),
                commits: commits.iter().filter(|c| c.author_id == user.id).count() as u64,
                lines_changed: commits
                    .iter()
                    .filter(|c| c.author_id == user.id)
                    .map(|c| c.changed_loc)
                    .sum(),
                merges: merges.iter().filter(|m| m.author_id == user.id).count() as u64,
            })
            .collect();
        rows.sort_by(|a, b| b.commits.cmp(&a.commits));

        println!("\n{}", "contributors".bold());
        println!("{}", Table::new(rows).with(Style::psql()));
    }

    Ok(())
}
