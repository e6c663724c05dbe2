//! Line-delimited JSON logs: append-only for the dead letter and rejection
//! sink, append plus atomic rewrite for the failed-page queue.

use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("{action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("encoding journal entry: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A source page whose fetch exhausted its in-call retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedPageRecord {
    pub category: i32,
    pub page: u32,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl FailedPageRecord {
    pub fn new(category: i32, page: u32, window_start: NaiveDate, window_end: NaiveDate) -> Self {
        Self {
            category,
            page,
            window_start,
            window_end,
            attempts: 0,
            last_attempt_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    BidValidation,
    BidDecode,
    LineItemsFetch,
    StoreWrite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedRecord {
    pub recorded_at: DateTime<Utc>,
    pub kind: RejectionKind,
    pub reason: String,
    pub payload: JsonValue,
}

impl RejectedRecord {
    pub fn now(kind: RejectionKind, reason: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            recorded_at: Utc::now(),
            kind,
            reason: reason.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JsonlJournal<T> {
    path: PathBuf,
    _entry: PhantomData<fn() -> T>,
}

impl<T> JsonlJournal<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _entry: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, action: &'static str) -> impl FnOnce(io::Error) -> JournalError + '_ {
        move |source| JournalError::Io {
            action,
            path: self.path.clone(),
            source,
        }
    }

    async fn ensure_parent(&self) -> Result<(), JournalError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(self.io_err("creating journal directory for"))?;
        }
        Ok(())
    }

    pub async fn append(&self, entry: &T) -> Result<(), JournalError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        self.ensure_parent().await?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(self.io_err("opening journal"))?;
        file.write_all(&line)
            .await
            .map_err(self.io_err("appending to journal"))?;
        file.flush().await.map_err(self.io_err("flushing journal"))?;
        Ok(())
    }

    /// Reads every entry. A missing file is an empty journal. Lines that do
    /// not decode are logged and skipped.
    pub async fn read_all(&self) -> Result<Vec<T>, JournalError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(self.io_err("reading journal")(err)),
        };

        let mut entries = Vec::new();
        for (idx, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(err) => warn!(
                    path = %self.path.display(),
                    line = idx + 1,
                    error = %err,
                    raw = line,
                    "skipping undecodable journal line"
                ),
            }
        }
        Ok(entries)
    }

    /// Replaces the journal contents via a temp file in the same directory and
    /// a rename, so readers see either the old or the new set.
    pub async fn rewrite(&self, entries: &[T]) -> Result<(), JournalError> {
        let mut body = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut body, entry)?;
            body.push(b'\n');
        }

        self.ensure_parent().await?;
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "journal".to_string());
        let temp_path = self
            .path
            .with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(self.io_err("opening temp journal for"))?;
        let written = async {
            file.write_all(&body).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);

        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(self.io_err("writing temp journal for")(err));
        }

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(self.io_err("renaming temp journal over")(err));
        }
        Ok(())
    }
}
