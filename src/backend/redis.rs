//! Redis object backend
//!
//! Each object is one hash under `<namespace>:<key>`:
//! - field `body`: raw bytes
//! - field `meta:<name>`: one per metadata entry
//!
//! Listing uses `SCAN MATCH` so large keyspaces never block the server.

use super::{validate_key, BackendError, ObjectBackend, ObjectMeta};
use ::redis::aio::ConnectionManager;
use ::redis::AsyncCommands;
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{debug, info};

const BODY_FIELD: &str = "body";
const META_FIELD_PREFIX: &str = "meta:";
const SCAN_BATCH: usize = 200;

/// Redis-backed object store
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
    namespace: String,
}

impl RedisBackend {
    /// Connect and verify with `PING`
    pub async fn connect(url: &str, namespace: &str) -> Result<Self, BackendError> {
        let client = ::redis::Client::open(url)?;
        let mut conn = ConnectionManager::new(client).await?;
        let _: String = ::redis::cmd("PING").query_async(&mut conn).await?;

        info!("Redis backend connected (namespace: {})", namespace);
        Ok(Self {
            conn,
            namespace: namespace.to_string(),
        })
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    fn object_key<'a>(&self, redis_key: &'a str) -> Option<&'a str> {
        redis_key
            .strip_prefix(self.namespace.as_str())
            .and_then(|rest| rest.strip_prefix(':'))
    }
}

/// Escape glob metacharacters so a prefix matches literally in `SCAN MATCH`
fn escape_glob(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[async_trait]
impl ObjectBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        metadata: HashMap<String, String>,
    ) -> Result<(), BackendError> {
        validate_key(key)?;
        let rkey = self.redis_key(key);

        let mut fields: Vec<(String, Vec<u8>)> = Vec::with_capacity(metadata.len() + 1);
        fields.push((BODY_FIELD.to_string(), body));
        for (name, value) in metadata {
            fields.push((format!("{}{}", META_FIELD_PREFIX, name), value.into_bytes()));
        }

        let mut conn = self.conn.clone();
        let _: () = ::redis::pipe()
            .atomic()
            .del(&rkey)
            .ignore()
            .hset_multiple(&rkey, &fields)
            .ignore()
            .query_async(&mut conn)
            .await?;

        debug!("redis put {}", key);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        validate_key(key)?;
        let mut conn = self.conn.clone();
        let body: Option<Vec<u8>> = conn.hget(self.redis_key(key), BODY_FIELD).await?;
        Ok(body)
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, BackendError> {
        validate_key(key)?;
        let mut conn = self.conn.clone();
        let fields: HashMap<String, Vec<u8>> = conn.hgetall(self.redis_key(key)).await?;

        let Some(body) = fields.get(BODY_FIELD) else {
            return Ok(None);
        };

        let metadata = fields
            .iter()
            .filter_map(|(field, value)| {
                field
                    .strip_prefix(META_FIELD_PREFIX)
                    .map(|name| (name.to_string(), String::from_utf8_lossy(value).into_owned()))
            })
            .collect();

        Ok(Some(ObjectMeta {
            key: key.to_string(),
            size: body.len() as u64,
            metadata,
        }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        let pattern = format!("{}*", escape_glob(&self.redis_key(prefix)));
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = ::redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            keys.extend(
                batch
                    .iter()
                    .filter_map(|k| self.object_key(k))
                    .map(str::to_string),
            );

            if next == 0 {
                break;
            }
            cursor = next;
        }

        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        validate_key(key)?;
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(self.redis_key(key)).await?;
        debug!("redis delete {}", key);
        Ok(())
    }
}
