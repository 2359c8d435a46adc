//! Telegram Integration
//!
//! - [`ChatPlatform`]: outbound calls (send a message, download a file),
//!   implemented by [`TelegramPlatform`] on top of a teloxide `Bot`.
//! - [`MessageProcessor`]: what the bot can do with an inbound message,
//!   implemented by [`crate::app::App`].
//! - [`UpdateRouter`]: turns one webhook update into processor calls
//!   (group mention rules, commands, file uploads).

use crate::artifacts::ArtifactInfo;
use crate::commands::Command;
use crate::render::{format_edt, format_utc, markdown_to_telegram_html};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{
    ChatId, Document, MessageEntityKind, MessageEntityRef, MessageId, ParseMode, ReplyParameters, Update,
    UpdateKind,
};
use tracing::{debug, info, warn};

/// Outbound chat platform calls
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    /// Send Telegram-HTML `text`, optionally as a reply
    async fn send_message(&self, chat_id: i64, text: &str, reply_to: Option<i32>) -> Result<()>;

    /// Full contents of an uploaded file
    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>>;
}

/// teloxide-backed platform client
#[derive(Clone)]
pub struct TelegramPlatform {
    bot: Bot,
}

impl TelegramPlatform {
    /// `api_url` overrides the Telegram endpoint (local Bot API server, tests)
    pub fn new(token: &str, api_url: Option<&str>) -> Result<Self> {
        let mut bot = Bot::new(token);
        if let Some(url) = api_url {
            let url = reqwest::Url::parse(url).with_context(|| format!("Invalid TELEGRAM_API_URL: {}", url))?;
            bot = bot.set_api_url(url);
        }
        Ok(Self { bot })
    }
}

#[async_trait]
impl ChatPlatform for TelegramPlatform {
    async fn send_message(&self, chat_id: i64, text: &str, reply_to: Option<i32>) -> Result<()> {
        let mut request = self
            .bot
            .send_message(ChatId(chat_id), text)
            .parse_mode(ParseMode::Html);
        if let Some(message_id) = reply_to {
            request = request.reply_parameters(ReplyParameters::new(MessageId(message_id)));
        }
        request.await.context("sendMessage failed")?;
        Ok(())
    }

    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>> {
        let file = self
            .bot
            .get_file(file_id.to_owned())
            .await
            .context("getFile failed")?;

        let mut dst: Vec<u8> = Vec::new();
        self.bot
            .download_file(&file.path, &mut dst)
            .await
            .context("File download failed")?;
        Ok(dst)
    }
}

/// One inbound chat message, reduced to what the bot needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRequest {
    pub chat_id: i64,
    pub user_id: i64,
    pub username: String,
    /// Message text with any bot mention removed
    pub text: String,
    pub message_id: i32,
    pub is_group: bool,
}

/// Capabilities the router needs from the application
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    fn bot_username(&self) -> &str;

    /// Answer a free-text question
    async fn process_message(&self, request: ChatRequest) -> Result<()>;

    async fn handle_command(&self, command: Command, request: &ChatRequest) -> Result<()>;

    async fn send_message(&self, chat_id: i64, text: &str, reply_to: Option<i32>) -> Result<()>;

    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>>;

    async fn store_source_code(&self, user_id: i64, code: &str) -> Result<ArtifactInfo>;

    /// Short LLM summary of the user's uploaded source code
    async fn analyze_source_code(&self, user_id: i64) -> Result<String>;
}

pub const UNSUPPORTED_FILE_TEXT: &str =
    "❌ <b>Unsupported File Type</b>\n\nPlease upload a <code>.txt</code> file containing your source code.";
pub const DOWNLOAD_FAILED_TEXT: &str =
    "❌ <b>File Download Error</b>\n\nFailed to download the uploaded file. Please try again.";
pub const STORE_FAILED_TEXT: &str =
    "❌ <b>File Processing Error</b>\n\nFailed to process the uploaded file. Please try again.";

/// Dispatches webhook updates to a [`MessageProcessor`]
pub struct UpdateRouter {
    processor: Arc<dyn MessageProcessor>,
}

fn is_bot_mention(mention: &str, bot_username: &str) -> bool {
    !bot_username.is_empty()
        && mention
            .strip_prefix('@')
            .is_some_and(|name| name.eq_ignore_ascii_case(bot_username.trim_start_matches('@')))
}

/// Remove the first occurrence of `mention` and trim
fn remove_mention(text: &str, mention: &str) -> String {
    text.replacen(mention, "", 1).trim().to_string()
}

/// Text of the first entity that mentions the bot
fn find_bot_mention<'a>(entities: Option<Vec<MessageEntityRef<'a>>>, bot_username: &str) -> Option<&'a str> {
    entities?
        .into_iter()
        .filter(|e| matches!(e.kind(), MessageEntityKind::Mention))
        .map(|e| e.text())
        .find(|mention| is_bot_mention(mention, bot_username))
}

impl UpdateRouter {
    pub fn new(processor: Arc<dyn MessageProcessor>) -> Self {
        Self { processor }
    }

    /// Handle one update. Unsupported update kinds are ignored.
    pub async fn handle_update(&self, update: Update) -> Result<()> {
        let msg = match update.kind {
            UpdateKind::Message(msg) | UpdateKind::EditedMessage(msg) => msg,
            _ => {
                debug!("Ignoring non-message update");
                return Ok(());
            }
        };

        let Some(from) = msg.from.as_ref() else {
            return Ok(());
        };
        let bot_username = self.processor.bot_username().to_string();
        let is_group = msg.chat.is_group() || msg.chat.is_supergroup();

        let mut request = ChatRequest {
            chat_id: msg.chat.id.0,
            user_id: from.id.0 as i64,
            username: from.username.clone().unwrap_or_default(),
            text: String::new(),
            message_id: msg.id.0,
            is_group,
        };

        if let Some(doc) = msg.document() {
            let caption = msg.caption().unwrap_or_default();
            return self.handle_document(request, doc, caption, &bot_username).await;
        }

        let Some(text) = msg.text().filter(|t| !t.trim().is_empty()) else {
            return Ok(());
        };

        let mention = if is_group {
            find_bot_mention(msg.parse_entities(), &bot_username)
        } else {
            None
        };

        if text.trim_start().starts_with('/') {
            let Some(command) = Command::parse(text, &bot_username) else {
                debug!("Ignoring command for another bot: {}", text);
                return Ok(());
            };

            let addressed = text
                .split_whitespace()
                .next()
                .is_some_and(|word| word.contains('@'));
            if is_group && mention.is_none() && !addressed {
                return Ok(());
            }

            request.text = text.to_string();
            info!("Command {:?} from user {}", command, request.user_id);
            return self.processor.handle_command(command, &request).await;
        }

        request.text = match (is_group, mention) {
            (false, _) => text.trim().to_string(),
            (true, Some(mention)) => remove_mention(text, mention),
            (true, None) => return Ok(()),
        };
        if request.text.is_empty() {
            return Ok(());
        }

        self.processor.process_message(request).await
    }

    /// Upload flow for a document message
    async fn handle_document(
        &self,
        request: ChatRequest,
        doc: &Document,
        caption: &str,
        bot_username: &str,
    ) -> Result<()> {
        let reply_to = Some(request.message_id);

        if request.is_group {
            let tag = format!("@{}", bot_username.trim_start_matches('@')).to_lowercase();
            if bot_username.is_empty() || !caption.to_lowercase().contains(&tag) {
                return Ok(());
            }
        }

        let file_name = doc.file_name.clone().unwrap_or_default();
        if !file_name.to_lowercase().ends_with(".txt") {
            self.processor
                .send_message(request.chat_id, UNSUPPORTED_FILE_TEXT, reply_to)
                .await?;
            return Ok(());
        }

        let body = match self.processor.download_file(&doc.file.id.to_string()).await {
            Ok(body) => body,
            Err(e) => {
                warn!("Failed to download {} for user {}: {:#}", file_name, request.user_id, e);
                self.processor
                    .send_message(request.chat_id, DOWNLOAD_FAILED_TEXT, reply_to)
                    .await?;
                return Err(e);
            }
        };

        let code = String::from_utf8_lossy(&body);
        let stored = match self.processor.store_source_code(request.user_id, &code).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Failed to store source code for user {}: {:#}", request.user_id, e);
                self.processor
                    .send_message(request.chat_id, STORE_FAILED_TEXT, reply_to)
                    .await?;
                return Err(e);
            }
        };

        let confirmation = format!(
            "✅ <b>File Uploaded Successfully</b>\n\n\
             Your source code has been uploaded and will be stored until:\n\n\
             • <b>Upload Time:</b> UTC: {} | EDT: {}\n\
             • <b>Deletion Time:</b> UTC: {} | EDT: {}\n\n\
             Please save any work or prompts that may be useful in the future.",
            format_utc(stored.uploaded_at),
            format_edt(stored.uploaded_at),
            format_utc(stored.expires_at),
            format_edt(stored.expires_at),
        );
        if let Err(e) = self
            .processor
            .send_message(request.chat_id, &confirmation, reply_to)
            .await
        {
            warn!("Failed to send upload confirmation: {:#}", e);
        }

        match self.processor.analyze_source_code(request.user_id).await {
            Ok(summary) => {
                let analysis = format!(
                    "🔍 <b>Code Analysis Summary:</b>\n\n{}\n\n\
                     Your source code will be included as context in your next questions.",
                    markdown_to_telegram_html(&summary)
                );
                if let Err(e) = self
                    .processor
                    .send_message(request.chat_id, &analysis, reply_to)
                    .await
                {
                    warn!("Failed to send analysis summary: {:#}", e);
                }
            }
            Err(e) => warn!("Failed to analyze source code for user {}: {:#}", request.user_id, e),
        }

        debug!("Upload flow finished for {}", stored.key);
        Ok(())
    }
}
