//! Interaction Log
//!
//! Appends one CSV row per chat interaction to `logs/telegram_logs.csv` in the
//! backend. The object is read, extended and written back whole, so appends
//! are serialized through one async mutex.

use crate::backend::{BackendError, SharedBackend};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Backend key of the log
pub const LOG_KEY: &str = "logs/telegram_logs.csv";

pub const LOG_HEADERS: [&str; 6] = [
    "userID",
    "username",
    "prompt",
    "keywords",
    "response_time",
    "no_limit_user",
];

const MAX_KEYWORDS: usize = 5;
const MIN_KEYWORD_LEN: usize = 4;

const STOP_WORDS: &[&str] = &[
    "about", "after", "again", "also", "because", "been", "before", "being", "could", "does",
    "doing", "from", "have", "having", "here", "into", "just", "like", "more", "most", "much",
    "only", "other", "over", "please", "same", "should", "some", "such", "than", "that", "their",
    "them", "then", "there", "these", "they", "this", "those", "through", "very", "want", "were",
    "what", "when", "where", "which", "while", "with", "would", "your",
];

/// One logged interaction
#[derive(Debug, Clone)]
pub struct Interaction<'a> {
    pub user_id: i64,
    pub username: &'a str,
    pub prompt: &'a str,
    /// Human-readable duration, or a marker such as "Rate limited"
    pub response_time: &'a str,
    pub no_limit_user: bool,
}

static RE_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\p{L}\p{N}]+").unwrap());

/// Up to five distinct lowercase content words from `text`, space separated
pub fn extract_keywords(text: &str) -> String {
    let mut seen = HashSet::new();
    RE_WORD
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .filter(|w| w.chars().count() >= MIN_KEYWORD_LEN)
        .filter(|w| !w.chars().all(|c| c.is_ascii_digit()))
        .filter(|w| !STOP_WORDS.contains(&w.as_str()))
        .filter(|w| seen.insert(w.clone()))
        .take(MAX_KEYWORDS)
        .collect::<Vec<_>>()
        .join(" ")
}

/// CSV interaction log stored in the backend
pub struct InteractionLog {
    backend: SharedBackend,
    lock: Mutex<()>,
}

impl InteractionLog {
    pub fn new(backend: SharedBackend) -> Self {
        Self {
            backend,
            lock: Mutex::new(()),
        }
    }

    /// Append `interaction`. Failures are logged and swallowed.
    pub async fn record(&self, interaction: Interaction<'_>) {
        if let Err(e) = self.append(&interaction).await {
            warn!("Failed to append interaction log: {}", e);
        }
    }

    async fn append(&self, interaction: &Interaction<'_>) -> Result<(), BackendError> {
        let _guard = self.lock.lock().await;

        let mut rows = match self.backend.get(LOG_KEY).await? {
            Some(existing) => parse_rows(&existing),
            None => {
                debug!("Interaction log does not exist, creating {}", LOG_KEY);
                Vec::new()
            }
        };

        if rows.is_empty() {
            rows.push(LOG_HEADERS.iter().map(|h| h.to_string()).collect());
        }

        rows.push(vec![
            interaction.user_id.to_string(),
            interaction.username.to_string(),
            interaction.prompt.to_string(),
            extract_keywords(interaction.prompt),
            interaction.response_time.to_string(),
            format!("No limit user: {}", interaction.no_limit_user),
        ]);

        let body = write_rows(&rows)?;
        self.backend.put(LOG_KEY, body, HashMap::new()).await
    }

    /// Every row of the log, header first
    pub async fn rows(&self) -> Result<Vec<Vec<String>>, BackendError> {
        Ok(self
            .backend
            .get(LOG_KEY)
            .await?
            .map(|raw| parse_rows(&raw))
            .unwrap_or_default())
    }
}

fn parse_rows(raw: &[u8]) -> Vec<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(raw);

    let mut rows = Vec::new();
    for record in reader.records() {
        match record {
            Ok(record) => rows.push(record.iter().map(str::to_string).collect()),
            Err(e) => {
                warn!("Failed to parse existing interaction log, starting over: {}", e);
                return Vec::new();
            }
        }
    }
    rows
}

fn write_rows(rows: &[Vec<String>]) -> Result<Vec<u8>, BackendError> {
    let mut writer = csv::WriterBuilder::new().flexible(true).from_writer(Vec::new());
    for row in rows {
        writer.write_record(row).map_err(std::io::Error::from)?;
    }
    writer
        .into_inner()
        .map_err(|e| BackendError::Io(std::io::Error::new(e.error().kind(), e.error().to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use std::sync::Arc;

    fn interaction<'a>(prompt: &'a str) -> Interaction<'a> {
        Interaction {
            user_id: 7,
            username: "max",
            prompt,
            response_time: "1.2s",
            no_limit_user: false,
        }
    }

    #[test]
    fn test_extract_keywords() {
        assert_eq!(
            extract_keywords("How do I write a Rust parser, with Rust macros?"),
            "write rust parser macros"
        );
        assert_eq!(extract_keywords("hi"), "");
        assert_eq!(extract_keywords("alpha beta gamma delta epsilon zeta theta"), "alpha beta gamma delta epsilon");
    }

    #[tokio::test]
    async fn test_first_append_writes_header() {
        let backend = Arc::new(MemoryBackend::new());
        let log = InteractionLog::new(backend.clone());
        log.record(interaction("Explain tokio runtimes")).await;

        let rows = log.rows().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], LOG_HEADERS.to_vec());
        assert_eq!(rows[1][0], "7");
        assert_eq!(rows[1][3], "explain tokio runtimes");
        assert_eq!(rows[1][5], "No limit user: false");
    }

    #[tokio::test]
    async fn test_appends_keep_quoting() {
        let log = InteractionLog::new(Arc::new(MemoryBackend::new()));
        log.record(interaction("one, \"two\"\nthree")).await;
        log.record(interaction("second prompt")).await;

        let rows = log.rows().await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1][2], "one, \"two\"\nthree");
        assert_eq!(rows[2][2], "second prompt");
    }

    #[tokio::test]
    async fn test_concurrent_appends_are_not_lost() {
        let log = Arc::new(InteractionLog::new(Arc::new(MemoryBackend::new())));
        let mut handles = Vec::new();
        for i in 0..10 {
            let log = Arc::clone(&log);
            handles.push(tokio::spawn(async move {
                log.record(interaction(&format!("prompt {}", i))).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(log.rows().await.unwrap().len(), 11);
    }

    #[tokio::test]
    async fn test_backend_failure_is_swallowed() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_offline(true);
        let log = InteractionLog::new(backend);
        log.record(interaction("ignored")).await;
    }
}
