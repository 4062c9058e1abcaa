use super::{CallLogStore, CallSummary, ConversationStore, DirectoryStore};
use anyhow::Result;
use async_trait::async_trait;
use redis::AsyncCommands;
use shared::models::{CallId, CallSession};

// Writes the record unless the stored one is further along or already terminal.
// KEYS[1] call hash, KEYS[2] caller history, KEYS[3] callee history
// ARGV[1] json, ARGV[2] status rank, ARGV[3] start time score, ARGV[4] call id
const SAVE_CALL_SCRIPT: &str = r#"
local stored = redis.call('HGET', KEYS[1], 'rank')
if stored then
  stored = tonumber(stored)
  if stored >= 2 or stored > tonumber(ARGV[2]) then
    return 0
  end
end
redis.call('HSET', KEYS[1], 'rank', ARGV[2], 'json', ARGV[1])
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[4])
redis.call('ZADD', KEYS[3], ARGV[3], ARGV[4])
return 1
"#;

#[derive(Clone)]
pub struct RedisRepository {
    conn_manager: redis::aio::ConnectionManager,
    key_prefix: String,
}

impl RedisRepository {
    pub fn new(conn_manager: redis::aio::ConnectionManager, key_prefix: String) -> Self {
        Self {
            conn_manager,
            key_prefix,
        }
    }

    pub async fn connect(redis_url: &str, key_prefix: String) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn_manager = client.get_connection_manager().await?;
        Ok(Self::new(conn_manager, key_prefix))
    }

    fn call_key(&self, call_id: CallId) -> String {
        format!("{}:call:{}", self.key_prefix, call_id)
    }

    fn history_key(&self, user_id: &str) -> String {
        format!("{}:user_calls:{}", self.key_prefix, user_id)
    }

    fn friends_key(&self, user_id: &str) -> String {
        format!("{}:friends:{}", self.key_prefix, user_id)
    }

    fn conversation_key(&self, summary: &CallSummary) -> String {
        format!("{}:conversation:{}", self.key_prefix, summary.conversation_key())
    }

    fn last_change_key(&self, summary: &CallSummary) -> String {
        format!("{}:conversation_last:{}", self.key_prefix, summary.conversation_key())
    }

    pub async fn befriend(&self, a: &str, b: &str) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        conn.sadd::<_, _, ()>(self.friends_key(a), b).await?;
        conn.sadd::<_, _, ()>(self.friends_key(b), a).await?;
        Ok(())
    }
}

#[async_trait]
impl CallLogStore for RedisRepository {
    async fn save(&self, session: &CallSession) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        let json = serde_json::to_string(session)?;
        let applied: i64 = redis::cmd("EVAL")
            .arg(SAVE_CALL_SCRIPT)
            .arg(3)
            .arg(self.call_key(session.call_id))
            .arg(self.history_key(&session.caller_id))
            .arg(self.history_key(&session.callee_id))
            .arg(json)
            .arg(i64::from(session.status.rank()))
            .arg(session.start_time.timestamp_millis())
            .arg(session.call_id.to_string())
            .query_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn get(&self, call_id: CallId) -> Result<Option<CallSession>> {
        let mut conn = self.conn_manager.clone();
        let json: Option<String> = conn.hget(self.call_key(call_id), "json").await?;
        match json {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn history(&self, user_id: &str, page: usize, limit: usize) -> Result<(Vec<CallSession>, usize)> {
        let mut conn = self.conn_manager.clone();
        let key = self.history_key(user_id);
        let total: usize = conn.zcard(&key).await?;
        if limit == 0 {
            return Ok((Vec::new(), total));
        }
        let start = page.saturating_sub(1) * limit;
        let stop = start + limit - 1;
        let ids: Vec<String> = redis::cmd("ZREVRANGE")
            .arg(&key)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await?;

        let mut calls: Vec<CallSession> = Vec::with_capacity(ids.len());
        for id in ids {
            let json: Option<String> = conn.hget(format!("{}:call:{}", self.key_prefix, id), "json").await?;
            if let Some(session) = json.and_then(|j| serde_json::from_str(&j).ok()) {
                calls.push(session);
            }
        }
        Ok((calls, total))
    }
}

#[async_trait]
impl DirectoryStore for RedisRepository {
    async fn are_friends(&self, a: &str, b: &str) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        Ok(conn.sismember(self.friends_key(a), b).await?)
    }
}

#[async_trait]
impl ConversationStore for RedisRepository {
    async fn append_call_summary(&self, summary: &CallSummary) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let json = serde_json::to_string(summary)?;
        conn.rpush::<_, _, ()>(self.conversation_key(summary), &json).await?;
        conn.set::<_, _, ()>(self.last_change_key(summary), summary.created_at.to_rfc3339())
            .await?;
        Ok(())
    }
}
