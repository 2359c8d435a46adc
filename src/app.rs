//! Application Context
//!
//! [`App`] owns every store and collaborator and implements
//! [`MessageProcessor`]. Nothing is global: the web layer and the update
//! router share one `Arc<App>`.

use crate::artifacts::{ArtifactInfo, ArtifactStore};
use crate::audit::{Interaction, InteractionLog};
use crate::backend::{FsBackend, MemoryBackend, RedisBackend, SharedBackend};
use crate::clock::{self, Clock};
use crate::commands::{self, Command};
use crate::config::{Config, StorageBackend};
use crate::conversation::{self, ChatMessage, ConversationCache};
use crate::llm::{ChatModel, OpenAiClient};
use crate::render::{escape_html, format_edt, format_utc, telegram_reply};
use crate::responses::ResponseStore;
use crate::telegram::{ChatPlatform, ChatRequest, MessageProcessor, TelegramPlatform};
use crate::usage::{RateDecision, UsageTracker};
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Namespace for Redis keys
const REDIS_NAMESPACE: &str = "kernelsanders";

/// Responses listed by `/mydata` before the rest are summarized
const MYDATA_MAX_RESPONSES: usize = 20;

const LLM_FAILED_TEXT: &str =
    "❌ <b>Request Failed</b>\n\nSorry, I could not get an answer right now. Please try again later.";
const MYDATA_FAILED_TEXT: &str =
    "❌ <b>Error Retrieving Data</b>\n\nUnable to fetch your data at this time. Please try again later.";
const DELETE_FAILED_TEXT: &str =
    "❌ <b>Error Deleting Data</b>\n\nSome of your data could not be deleted. Please try again later.";
const ANALYSIS_SYSTEM_PROMPT: &str = "You are a senior software engineer reviewing uploaded source code.";

/// External collaborators, injected so tests can substitute doubles
pub struct AppDeps {
    pub backend: SharedBackend,
    pub llm: Arc<dyn ChatModel>,
    pub platform: Arc<dyn ChatPlatform>,
    pub clock: Arc<dyn Clock>,
}

/// What `/deletedata` removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeletionSummary {
    pub responses: usize,
    pub files: usize,
}

pub struct App {
    config: Config,
    clock: Arc<dyn Clock>,
    backend: SharedBackend,
    responses: Arc<ResponseStore>,
    conversations: Arc<ConversationCache>,
    usage: Arc<UsageTracker>,
    artifacts: Arc<ArtifactStore>,
    audit: InteractionLog,
    llm: Arc<dyn ChatModel>,
    platform: Arc<dyn ChatPlatform>,
    shutdown_tx: watch::Sender<bool>,
    sweepers: Mutex<Vec<JoinHandle<()>>>,
    started: Instant,
}

/// Open the configured backend
pub async fn open_backend(config: &Config) -> Result<SharedBackend> {
    let backend: SharedBackend = match config.storage_backend {
        StorageBackend::Redis => Arc::new(
            RedisBackend::connect(&config.redis_url, REDIS_NAMESPACE)
                .await
                .with_context(|| format!("Failed to connect to Redis at {}", config.redis_url))?,
        ),
        StorageBackend::Fs => Arc::new(
            FsBackend::open(&config.storage_dir)
                .await
                .with_context(|| format!("Failed to open storage dir {}", config.storage_dir))?,
        ),
        StorageBackend::Memory => {
            warn!("Using in-memory storage backend; nothing survives a restart");
            Arc::new(MemoryBackend::new())
        }
    };
    Ok(backend)
}

impl App {
    pub fn new(config: Config, deps: AppDeps) -> Self {
        let AppDeps {
            backend,
            llm,
            platform,
            clock,
        } = deps;

        let responses = ResponseStore::new(backend.clone(), config.retention, clock.clone());
        let conversations = ConversationCache::new(config.conversation_ttl, clock.clone());
        let usage = UsageTracker::new(config.rate_limit.clone(), clock.clone());
        let artifacts = ArtifactStore::new(backend.clone(), config.retention, clock.clone());
        let audit = InteractionLog::new(backend.clone());
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            clock,
            backend,
            responses: Arc::new(responses),
            conversations: Arc::new(conversations),
            usage: Arc::new(usage),
            artifacts: Arc::new(artifacts),
            audit,
            llm,
            platform,
            shutdown_tx,
            sweepers: Mutex::new(Vec::new()),
            started: Instant::now(),
        }
    }

    /// Production wiring: configured backend, OpenAI client, Telegram
    pub async fn from_config(config: Config) -> Result<Self> {
        let backend = open_backend(&config).await?;
        let llm = OpenAiClient::from_config(&config).context("Failed to build LLM client")?;
        let platform = TelegramPlatform::new(&config.telegram_token, config.telegram_api_url.as_deref())?;

        Ok(Self::new(
            config,
            AppDeps {
                backend,
                llm: Arc::new(llm),
                platform: Arc::new(platform),
                clock: clock::system(),
            },
        ))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn responses(&self) -> &ResponseStore {
        &self.responses
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn conversations(&self) -> &ConversationCache {
        &self.conversations
    }

    pub fn usage(&self) -> &UsageTracker {
        &self.usage
    }

    /// Load persisted responses; called once before serving
    pub async fn load_state(&self) -> Result<()> {
        let loaded = self
            .responses
            .load_all_from_backend()
            .await
            .with_context(|| format!("Failed to load responses from {} backend", self.backend.name()))?;
        info!("Restored {} live responses", loaded);
        Ok(())
    }

    /// Spawn one sweeper per store
    pub fn start_sweepers(&self) {
        let interval = self.config.sweep_interval;
        let mut sweepers = self.sweepers.lock();
        sweepers.push(self.responses.spawn_sweeper(interval, self.shutdown_tx.subscribe()));
        sweepers.push(self.conversations.spawn_sweeper(interval, self.shutdown_tx.subscribe()));
        sweepers.push(self.usage.spawn_sweeper(interval, self.shutdown_tx.subscribe()));
        sweepers.push(self.artifacts.spawn_sweeper(interval, self.shutdown_tx.subscribe()));
        info!("Started {} sweepers (every {:?})", sweepers.len(), interval);
    }

    /// Receiver that flips to `true` on shutdown
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Stop the sweepers and wait for them
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let handles: Vec<JoinHandle<()>> = self.sweepers.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Sweeper task failed: {}", e);
            }
        }
        info!("Application has been shut down gracefully");
    }

    pub fn is_exempt(&self, user_id: i64) -> bool {
        self.config.no_limit_users.contains(&user_id)
    }

    pub fn response_url(&self, id: &str) -> String {
        format!("{}/{}", self.config.base_url, id)
    }

    pub fn file_url(&self, key: &str) -> String {
        format!("{}/files/{}", self.config.base_url, key)
    }

    fn rate_limited_text(&self, retry_after: Duration) -> String {
        let secs = retry_after.as_secs();
        format!(
            "🚫 <b>Rate Limit Exceeded</b>\n\n\
             You have reached the maximum number of messages allowed within the last {} minutes. \
             Please try again in {} minutes and {} seconds.",
            self.config.rate_limit.window.as_secs() / 60,
            secs / 60,
            secs % 60
        )
    }

    async fn audit(&self, request: &ChatRequest, prompt: &str, response_time: &str, exempt: bool) {
        self.audit
            .record(Interaction {
                user_id: request.user_id,
                username: &request.username,
                prompt,
                response_time,
                no_limit_user: exempt,
            })
            .await;
    }

    /// `/mydata` report: uploaded files and live responses with links
    pub async fn user_data_report(&self, user_id: i64) -> Result<String> {
        let files = self
            .artifacts
            .list_by_owner(user_id)
            .await
            .context("Failed to list uploaded files")?;
        let responses = self.responses.list_by_owner(user_id).await;

        let mut out = String::from("📊 <b>Your Data:</b>\n\n");

        if files.is_empty() {
            out.push_str("<i>No uploaded files found.</i>\n\n");
        } else {
            out.push_str("<b>Uploaded Files:</b>\n");
            for file in &files {
                out.push_str(&format!(
                    "• <a href=\"{}\">{}</a>\n  Uploaded: UTC: {} | EDT: {}\n  Deletion: UTC: {} | EDT: {}\n",
                    escape_html(&self.file_url(&file.key)),
                    escape_html(&file.file_name),
                    format_utc(file.uploaded_at),
                    format_edt(file.uploaded_at),
                    format_utc(file.expires_at),
                    format_edt(file.expires_at),
                ));
            }
            out.push('\n');
        }

        if responses.is_empty() {
            out.push_str("<i>No web responses found.</i>\n");
        } else {
            out.push_str("<b>Web Responses:</b>\n");
            let skipped = responses.len().saturating_sub(MYDATA_MAX_RESPONSES);
            for response in responses.iter().skip(skipped) {
                out.push_str(&format!(
                    "• <a href=\"{}\">{}</a>\n  Created: UTC: {} | EDT: {}\n  Deletion: UTC: {} | EDT: {}\n",
                    escape_html(&self.response_url(&response.id)),
                    response.id,
                    format_utc(response.created_at),
                    format_edt(response.created_at),
                    format_utc(response.expires_at),
                    format_edt(response.expires_at),
                ));
            }
            if skipped > 0 {
                out.push_str(&format!("… and {} older responses\n", skipped));
            }
        }

        Ok(out)
    }

    /// Remove every response, file and the conversation of `user_id`
    pub async fn delete_user_data(&self, user_id: i64) -> Result<DeletionSummary> {
        let responses = self.responses.remove_all_for_owner(user_id).await;
        self.conversations
            .clear(&ConversationCache::user_key(user_id))
            .await;
        let files = self
            .artifacts
            .delete_all_for_owner(user_id)
            .await
            .context("Failed to delete uploaded files")?;
        info!("Deleted data for user {}: {} responses, {} files", user_id, responses, files);
        Ok(DeletionSummary { responses, files })
    }

    async fn reply(&self, request: &ChatRequest, text: &str) -> Result<()> {
        self.platform
            .send_message(request.chat_id, text, Some(request.message_id))
            .await
    }
}

#[async_trait]
impl MessageProcessor for App {
    fn bot_username(&self) -> &str {
        &self.config.bot_username
    }

    async fn process_message(&self, request: ChatRequest) -> Result<()> {
        let exempt = self.is_exempt(request.user_id);

        if !exempt {
            if let RateDecision::Limited { retry_after } = self.usage.try_acquire(request.user_id).await {
                info!("User {} rate limited for {:?}", request.user_id, retry_after);
                if let Err(e) = self.reply(&request, &self.rate_limited_text(retry_after)).await {
                    warn!("Failed to send rate limit message: {:#}", e);
                }
                self.audit(&request, &request.text, "", exempt).await;
                return Ok(());
            }
        }

        let question = match self.artifacts.source_code(request.user_id).await {
            Some(code) => format!("Here is my source code:\n{}\n\n{}", code, request.text),
            None => request.text.clone(),
        };

        let key = ConversationCache::user_key(request.user_id);
        let stored = self.conversations.get(&key).await;
        let mut history = conversation::decode_history(stored.as_deref());
        history.push(ChatMessage::user(question.clone()));

        let started = Instant::now();
        let answer = match self.llm.complete(&history).await {
            Ok(answer) => answer,
            Err(e) => {
                error!("LLM query failed for user {}: {}", request.user_id, e);
                if let Err(send_err) = self.reply(&request, LLM_FAILED_TEXT).await {
                    warn!("Failed to send failure message: {:#}", send_err);
                }
                return Err(e).context("LLM query failed");
            }
        };
        let elapsed = started.elapsed();

        history.push(ChatMessage::assistant(answer.clone()));
        conversation::trim_history(&mut history, self.config.conversation_max_messages);
        self.conversations
            .set(&key, conversation::encode_history(&history))
            .await;

        let id = self.responses.publish(&answer, request.user_id).await;
        let message = telegram_reply(&answer, &self.response_url(&id));
        self.reply(&request, &message)
            .await
            .context("Failed to send response")?;

        debug!("Answered user {} in {:?}", request.user_id, elapsed);
        self.audit(&request, &question, &format!("{} ms", elapsed.as_millis()), exempt)
            .await;
        Ok(())
    }

    async fn handle_command(&self, command: Command, request: &ChatRequest) -> Result<()> {
        let bot = self.config.bot_username.as_str();
        let hours = self.config.retention_hours();

        let text = match command {
            Command::Start => commands::welcome_text(),
            Command::Help => commands::help_text(bot, hours),
            Command::Upload => commands::upload_text(bot),
            Command::Security => commands::security_text(hours),
            Command::Project => commands::project_text(),
            Command::MySourceCode => commands::my_source_code_text(),
            Command::Unknown(_) => commands::unknown_text(),
            Command::MyData => match self.user_data_report(request.user_id).await {
                Ok(report) => report,
                Err(e) => {
                    warn!("Failed to build data report for user {}: {:#}", request.user_id, e);
                    MYDATA_FAILED_TEXT.to_string()
                }
            },
            Command::DeleteData => match self.delete_user_data(request.user_id).await {
                Ok(summary) => format!(
                    "🗑️ <b>Data Deleted</b>\n\nRemoved {} web responses, {} uploaded files and your conversation history.",
                    summary.responses, summary.files
                ),
                Err(e) => {
                    warn!("Failed to delete data for user {}: {:#}", request.user_id, e);
                    DELETE_FAILED_TEXT.to_string()
                }
            },
        };

        self.reply(request, &text).await
    }

    async fn send_message(&self, chat_id: i64, text: &str, reply_to: Option<i32>) -> Result<()> {
        self.platform.send_message(chat_id, text, reply_to).await
    }

    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>> {
        self.platform.download_file(file_id).await
    }

    async fn store_source_code(&self, user_id: i64, code: &str) -> Result<ArtifactInfo> {
        self.artifacts
            .store_source_code(user_id, code)
            .await
            .context("Failed to store source code")
    }

    async fn analyze_source_code(&self, user_id: i64) -> Result<String> {
        let code = self
            .artifacts
            .source_code(user_id)
            .await
            .context("No uploaded source code")?;

        let messages = [
            ChatMessage::system(ANALYSIS_SYSTEM_PROMPT),
            ChatMessage::user(format!(
                "Give a short summary of the following source code: what it does, \
                 how it is structured and anything that stands out.\n\n{}",
                code
            )),
        ];
        let summary = self.llm.complete(&messages).await.context("Analysis query failed")?;
        debug!("Analysis for user {}: {} chars", user_id, summary.len());
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ObjectBackend;
    use crate::clock::ManualClock;
    use crate::llm::LlmError;

    #[derive(Default)]
    struct CannedModel {
        seen: Mutex<Vec<Vec<ChatMessage>>>,
        fail: bool,
    }

    #[async_trait]
    impl ChatModel for CannedModel {
        async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
            self.seen.lock().push(messages.to_vec());
            if self.fail {
                return Err(LlmError::EmptyChoices);
            }
            Ok(format!("answer #{}", self.seen.lock().len()))
        }
    }

    #[derive(Default)]
    struct RecordingPlatform {
        sent: Mutex<Vec<(i64, String)>>,
    }

    #[async_trait]
    impl ChatPlatform for RecordingPlatform {
        async fn send_message(&self, chat_id: i64, text: &str, _reply_to: Option<i32>) -> Result<()> {
            self.sent.lock().push((chat_id, text.to_string()));
            Ok(())
        }

        async fn download_file(&self, _file_id: &str) -> Result<Vec<u8>> {
            Ok(b"print('hi')".to_vec())
        }
    }

    struct Harness {
        app: App,
        backend: Arc<MemoryBackend>,
        llm: Arc<CannedModel>,
        platform: Arc<RecordingPlatform>,
        clock: Arc<ManualClock>,
    }

    fn harness_with(config: Config, llm: CannedModel) -> Harness {
        let backend = Arc::new(MemoryBackend::new());
        let llm = Arc::new(llm);
        let platform = Arc::new(RecordingPlatform::default());
        let clock = ManualClock::starting_now();
        let app = App::new(
            config,
            AppDeps {
                backend: backend.clone(),
                llm: llm.clone(),
                platform: platform.clone(),
                clock: clock.clone(),
            },
        );
        Harness {
            app,
            backend,
            llm,
            platform,
            clock,
        }
    }

    fn harness() -> Harness {
        let mut config = Config::default();
        config.bot_username = "ks_bot".to_string();
        config.rate_limit.max_actions = 2;
        harness_with(config, CannedModel::default())
    }

    fn request(text: &str) -> ChatRequest {
        ChatRequest {
            chat_id: 42,
            user_id: 42,
            username: "max".to_string(),
            text: text.to_string(),
            message_id: 1,
            is_group: false,
        }
    }

    #[tokio::test]
    async fn test_process_message_flow() {
        let h = harness();
        h.app.process_message(request("What is Rust?")).await.unwrap();

        let sent = h.platform.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.starts_with("answer #1"));
        assert!(sent[0].1.contains("View Formatted Response in its entirety"));

        let published = h.app.responses().list_by_owner(42).await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].content, "answer #1");
        assert!(sent[0].1.contains(&h.app.response_url(&published[0].id)));

        let stored = h.app.conversations().get("user_42").await.unwrap();
        let history = conversation::decode_history(Some(&stored));
        assert_eq!(history.len(), 3);

        let log = String::from_utf8(h.backend.get(crate::audit::LOG_KEY).await.unwrap().unwrap()).unwrap();
        assert!(log.starts_with("userID,username,prompt,keywords,response_time,no_limit_user"));
        assert!(log.contains("What is Rust?"));
    }

    #[tokio::test]
    async fn test_history_carries_between_turns() {
        let h = harness();
        h.app.process_message(request("first")).await.unwrap();
        h.app.process_message(request("second")).await.unwrap();

        let seen = h.llm.seen.lock().clone();
        assert_eq!(seen[1].len(), 4);
        assert_eq!(seen[1][2].content, "answer #1");
    }

    #[tokio::test]
    async fn test_rate_limit_replies_with_wait_time() {
        let h = harness();
        h.app.process_message(request("one")).await.unwrap();
        h.clock.advance(Duration::from_secs(60));
        h.app.process_message(request("two")).await.unwrap();
        h.app.process_message(request("three")).await.unwrap();

        let sent = h.platform.sent.lock().clone();
        assert_eq!(sent.len(), 3);
        assert!(sent[2].1.contains("Rate Limit Exceeded"));
        assert!(sent[2].1.contains("9 minutes and 0 seconds"));
        assert_eq!(h.llm.seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_exempt_user_bypasses_limit() {
        let mut config = Config::default();
        config.rate_limit.max_actions = 1;
        config.no_limit_users.insert(42);
        let h = harness_with(config, CannedModel::default());

        for _ in 0..3 {
            h.app.process_message(request("hi")).await.unwrap();
        }
        assert_eq!(h.llm.seen.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_source_code_is_prepended() {
        let h = harness();
        h.app.store_source_code(42, "fn main() {}").await.unwrap();
        h.app.process_message(request("Explain")).await.unwrap();

        let seen = h.llm.seen.lock().clone();
        assert_eq!(seen[0][1].content, "Here is my source code:\nfn main() {}\n\nExplain");
    }

    #[tokio::test]
    async fn test_llm_failure_replies_and_errors() {
        let h = harness_with(
            Config::default(),
            CannedModel {
                fail: true,
                ..Default::default()
            },
        );
        assert!(h.app.process_message(request("hi")).await.is_err());
        assert_eq!(h.platform.sent.lock()[0].1, LLM_FAILED_TEXT);
        assert!(h.app.responses().list_by_owner(42).await.is_empty());
    }

    #[tokio::test]
    async fn test_mydata_and_deletedata() {
        let h = harness();
        h.app.store_source_code(42, "code").await.unwrap();
        h.app.process_message(request("hello")).await.unwrap();

        let report = h.app.user_data_report(42).await.unwrap();
        assert!(report.contains("http://localhost:8080/files/user_source_code/42/source_code.txt"));
        assert!(report.contains("Web Responses"));

        h.app.handle_command(Command::DeleteData, &request("/deletedata")).await.unwrap();
        let last = h.platform.sent.lock().last().cloned().unwrap();
        assert!(last.1.contains("Removed 1 web responses, 1 uploaded files"));

        let report = h.app.user_data_report(42).await.unwrap();
        assert!(report.contains("No uploaded files found"));
        assert!(report.contains("No web responses found"));
        assert!(h.app.conversations().get("user_42").await.is_none());
    }

    #[tokio::test]
    async fn test_help_command() {
        let h = harness();
        h.app.handle_command(Command::Help, &request("/help")).await.unwrap();
        assert!(h.platform.sent.lock()[0].1.contains("@ks_bot"));
    }

    #[tokio::test]
    async fn test_analyze_source_code() {
        let h = harness();
        assert!(h.app.analyze_source_code(42).await.is_err());

        h.app.store_source_code(42, "fn main() {}").await.unwrap();
        let summary = h.app.analyze_source_code(42).await.unwrap();
        assert_eq!(summary, "answer #1");
        assert!(h.llm.seen.lock()[0][1].content.ends_with("fn main() {}"));
    }

    #[tokio::test]
    async fn test_sweepers_stop_on_shutdown() {
        let h = harness();
        h.app.start_sweepers();
        tokio::time::timeout(Duration::from_secs(2), h.app.shutdown())
            .await
            .expect("shutdown timed out");
    }
}
