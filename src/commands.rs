//! Slash Commands
//!
//! Parsing of `/command[@bot] [args]` text and the static reply texts.
//! Replies are Telegram HTML.

use crate::render::escape_html;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Upload,
    MyData,
    DeleteData,
    Security,
    Project,
    MySourceCode,
    Unknown(String),
}

impl Command {
    /// Parse a message starting with `/`
    ///
    /// Returns `None` for text that is not a command or that is addressed to
    /// another bot (`/help@other_bot`).
    pub fn parse(text: &str, bot_username: &str) -> Option<Command> {
        let word = text.trim_start().strip_prefix('/')?.split_whitespace().next()?;

        let name = match word.split_once('@') {
            Some((name, target)) => {
                if !target.eq_ignore_ascii_case(bot_username.trim_start_matches('@')) {
                    return None;
                }
                name
            }
            None => word,
        };

        Some(match name.to_ascii_lowercase().as_str() {
            "start" => Command::Start,
            "help" => Command::Help,
            "upload" => Command::Upload,
            "mydata" => Command::MyData,
            "deletedata" => Command::DeleteData,
            "security" => Command::Security,
            "project" => Command::Project,
            "my_source_code" => Command::MySourceCode,
            _ => Command::Unknown(name.to_string()),
        })
    }
}

pub fn welcome_text() -> String {
    "🎉 <b>Welcome to Kernel Sanders Bot!</b>\n\n\
     You can ask me questions about your application or upload your source code files for more context."
        .to_string()
}

pub fn help_text(bot_username: &str, retention_hours: u64) -> String {
    format!(
        "📚 <b>Help Menu:</b>\n\n\
         <b>Commands:</b>\n\
         /start - Start interacting with the bot\n\
         /help - Show this help message\n\
         /upload - Upload your source code file (only .txt files are supported)\n\
         /mydata - View your uploaded files and web responses\n\
         /deletedata - Delete your uploaded files, web responses and conversation\n\
         /security - Learn about the bot's security measures\n\
         /project - Learn about the KernelSanders project and how to contribute\n\
         /my_source_code - Get scripts to prepare your source code for upload\n\n\
         <b>File Uploads:</b>\n\
         In group chats, upload .txt files by tagging me in the caption using @{bot}. \
         In 1-on-1 chats, simply send the .txt file without tagging.\n\n\
         These files will be stored for <b>{hours} hours</b> only. Uploading a new file will overwrite \
         the existing one and reset the storage time.\n\n\
         <b>Short-Lived Web Responses:</b>\n\
         The bot provides short-lived web response links for easier reading of long answers. \
         Please save anything you want to keep, as the web responses expire after the same period.\n\n\
         🔒 <b>Security:</b> Only .txt files are accepted.",
        bot = escape_html(bot_username),
        hours = retention_hours,
    )
}

pub fn upload_text(bot_username: &str) -> String {
    format!(
        "📤 <b>Uploading Source Code</b>\n\n\
         Send me a .txt file directly by messaging @{} to upload your source code. \
         In group chats, tag me in the file caption.",
        escape_html(bot_username)
    )
}

pub fn security_text(retention_hours: u64) -> String {
    format!(
        "🔐 <b>Security Information:</b>\n\n\
         Uploaded files and web responses are stored with strict access controls and are \
         automatically deleted after {} hours. All interactions are logged for auditing purposes.\n\n\
         The project's source code is open-source, allowing for community review and contributions: \
         <a href=\"https://github.com/joelradon/KernelSanders\">KernelSanders GitHub</a>.",
        retention_hours
    )
}

pub fn project_text() -> String {
    "🚀 <b>KernelSanders Project:</b>\n\n\
     The KernelSanders bot is an open-source project designed to assist you with your coding needs. \
     Contributions are welcome! You can view the source code and contribute on GitHub: \
     <a href=\"https://github.com/joelradon/KernelSanders\">KernelSanders GitHub</a>."
        .to_string()
}

pub fn my_source_code_text() -> String {
    "💻 <b>Prepare Your Source Code for Upload:</b>\n\n\
     Concatenate the files you want me to see into a single .txt file, with each file's path \
     on a line before its contents. Leave out READMEs, build output and secrets, then send the \
     file to me in a direct message."
        .to_string()
}

pub fn unknown_text() -> String {
    "❓ <b>Unknown command.</b> Type /help to see available commands.".to_string()
}
