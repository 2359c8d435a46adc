//! KernelSanders
//!
//! Telegram bot that answers questions with an LLM, keeps a short rolling
//! conversation per user and rate-limits each user. Full answers and
//! uploaded source files are published as short-lived web pages.
//!
//! # Features
//!
//! - **Webhook**: Telegram updates over `POST /`
//! - **Expiring Stores**: TTL-keyed stores with write-through to a durable backend
//! - **Response Pages**: rendered markdown at `GET /<uuid>`, gone after the retention period
//! - **Rate Limiting**: sliding window per user, with exempt users
//! - **Source Uploads**: one `.txt` file per user, prepended to their questions
//! - **Audit Log**: CSV row per interaction
//!
//! # Architecture
//!
//! ```text
//! Telegram ──► POST / ──► UpdateRouter ──► App ──► LLM API
//!                                           │
//!                                           ├── UsageTracker (in memory)
//!                                           ├── ConversationCache (in memory)
//!                                           ├── ResponseStore ──┐
//!                                           ├── ArtifactStore ──┼── ObjectBackend
//!                                           └── InteractionLog ─┘   (Redis / fs / memory)
//!
//! Browser ──► GET /<uuid>, GET /files/<key> ──► ResponseStore / ArtifactStore
//! ```

pub mod app;
pub mod artifacts;
pub mod audit;
pub mod backend;
pub mod cache;
pub mod clock;
pub mod commands;
pub mod config;
pub mod conversation;
pub mod llm;
pub mod render;
pub mod responses;
pub mod telegram;
pub mod usage;
pub mod web;

pub use app::{App, AppDeps};
pub use artifacts::{ArtifactInfo, ArtifactStore};
pub use backend::{BackendError, FsBackend, MemoryBackend, ObjectBackend, RedisBackend, SharedBackend};
pub use cache::{Entry, ExpiringStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, StorageBackend};
pub use conversation::{ChatMessage, ConversationCache, Role};
pub use llm::{ChatModel, LlmError, OpenAiClient};
pub use responses::{PublishedResponse, ResponseStore};
pub use telegram::{ChatPlatform, MessageProcessor, TelegramPlatform, UpdateRouter};
pub use usage::{RateDecision, RateLimitConfig, UsageTracker};
