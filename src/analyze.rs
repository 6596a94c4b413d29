//! Ownership metric over extracted commit data.

use crate::records::Commit;

pub fn average(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Ownership share of one contributor: the mean of their commit share and
/// their changed-lines share.
pub fn ownership(commits: u64, changed_loc: u64, total_commits: u64, total_loc: u64) -> f64 {
    if total_commits == 0 {
        return 0.0;
    }
    let commit_share = commits as f64 / total_commits as f64;
    let loc_share = if total_loc == 0 {
        0.0
    } else {
        changed_loc as f64 / total_loc as f64
    };
    (commit_share + loc_share) / 2.0
}

/// Ownership of `author` over a set of commits, or the maximum ownership of
/// any contributor when no author is given. An empty commit set counts as
/// full ownership.
pub fn calculate_ownership(commits: &[Commit], author: Option<&str>) -> f64 {
    if commits.is_empty() {
        return 1.0;
    }

    let total_commits = commits.len() as u64;
    let total_loc: u64 = commits.iter().map(|c| c.changed_loc).sum();

    let mut shares: std::collections::HashMap<&str, (u64, u64)> = std::collections::HashMap::new();
    for commit in commits {
        let entry = shares.entry(commit.author_id.as_str()).or_insert((0, 0));
        entry.0 += 1;
        entry.1 += commit.changed_loc;
    }

    match author {
        Some(id) => shares
            .get(id)
            .map(|(count, loc)| ownership(*count, *loc, total_commits, total_loc))
            .unwrap_or(0.0),
        None => shares
            .values()
            .map(|(count, loc)| ownership(*count, *loc, total_commits, total_loc))
            .fold(0.0, f64::max),
    }
}
