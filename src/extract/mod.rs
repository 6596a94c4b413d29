//! Source extractors. Each submodule owns one remote data source and
//! queues normalized records onto the shared ingestion channel.

pub mod cloudwatch;
pub mod gitlab;
pub mod jira;
