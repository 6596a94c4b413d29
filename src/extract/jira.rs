//! Issue-tracker export extractor.
//!
//! Reads a semicolon-separated export file: the first line is the header,
//! every following non-blank line is one story with its sprint columns.

use std::path::Path;
use tokio_util::sync::CancellationToken;

use crate::error::{ExtractError, Result};
use crate::ingest::{IngestMessage, IngestSender};
use crate::records::{Record, Story};

pub async fn run(path: &Path, tx: IngestSender, cancel: CancellationToken) -> Result<()> {
    let content = tokio::fs::read_to_string(path).await?;

    for line in content.lines().skip(1) {
        if cancel.is_cancelled() {
            return Err(ExtractError::Cancelled);
        }
        if line.trim().is_empty() {
            continue;
        }

        let columns: Vec<&str> = line.split(';').collect();
        let story = Story::from_export_row(&columns)?;
        let _ = tx.send(IngestMessage::Record(Record::Story(story)));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest;
    use std::io::Write;

    #[tokio::test]
    async fn test_export_rows_become_stories() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Key;Sprint;Sprint").unwrap();
        writeln!(file, "1;Sprint 3;").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "2;Sprint 4;Sprint 5").unwrap();

        let (tx, mut rx) = ingest::channel();
        run(file.path(), tx, CancellationToken::new()).await.unwrap();

        let Some(IngestMessage::Record(Record::Story(first))) = rx.recv().await else {
            panic!("expected a story record");
        };
        assert_eq!(first, Story { id: 1, sprints: vec![3] });

        let Some(IngestMessage::Record(Record::Story(second))) = rx.recv().await else {
            panic!("expected a story record");
        };
        assert_eq!(second, Story { id: 2, sprints: vec![4, 5] });
    }

    #[tokio::test]
    async fn test_malformed_row_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Key;Sprint").unwrap();
        writeln!(file, "not-a-number;Sprint 3").unwrap();

        let (tx, _rx) = ingest::channel();
        let result = run(file.path(), tx, CancellationToken::new()).await;
        assert!(matches!(result, Err(ExtractError::IssueExport(_))));
    }
}
