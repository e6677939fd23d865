use async_trait::async_trait;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use uuid::Uuid;

/// A message handed to a consumer under an exclusive lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message_id: String,
    /// Lease handle; the only way to acknowledge this delivery.
    pub receipt: String,
    pub body: String,
    /// How many times the message has been handed out, this delivery included.
    pub receive_count: u32,
}

/// Parameters of a single `receive` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveOptions {
    pub max_messages: usize,
    /// Long-poll wait when nothing is available.
    pub wait: Duration,
    /// Lease length for each returned delivery.
    pub visibility: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Messages waiting for delivery (including ones blocked behind an in-flight group head).
    pub visible: u64,
    pub in_flight: u64,
}

/// Per-group FIFO queue with at-least-once delivery, visibility leases and
/// enqueue deduplication.
///
/// Guarantees every implementation must keep:
/// - messages sharing a group key are delivered in enqueue order, with at most
///   one of them leased at any time;
/// - a delivery that is not deleted before its lease runs out is handed out again;
/// - enqueues repeating a dedup key inside the dedup window return the first
///   message id and add nothing.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Publish a message and return its id.
    async fn enqueue(
        &self,
        queue: &str,
        group_key: &str,
        dedup_key: &str,
        body: &str,
    ) -> Result<String, QueueError>;

    /// Lease up to `max_messages` deliveries, waiting up to `wait` for the first one.
    async fn receive(
        &self,
        queue: &str,
        options: ReceiveOptions,
    ) -> Result<Vec<Delivery>, QueueError>;

    /// Acknowledge a delivery, removing its message for good.
    async fn delete(&self, queue: &str, receipt: &str) -> Result<(), QueueError>;

    async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError>;

    /// Check the backend is reachable.
    async fn health_check(&self) -> Result<(), QueueError>;
}

const SCRIPT_PRELUDE: &str = r#"
local function now_ms()
  local t = redis.call('TIME')
  return tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
end
local function fmt(n)
  return string.format('%d', n)
end
"#;

// ARGV: base, group, dedup key, body, new id, dedup window ms
const ENQUEUE_SCRIPT: &str = r#"
local base = ARGV[1]
local group = ARGV[2]
local dedup = base .. ':dedup:' .. ARGV[3]
local existing = redis.call('GET', dedup)
if existing then
  return {existing, '1'}
end
local id = ARGV[5]
redis.call('SET', dedup, id, 'PX', ARGV[6])
redis.call('HSET', base .. ':msg:' .. id,
  'body', ARGV[4], 'group', group, 'enqueued_at', fmt(now_ms()), 'receive_count', '0')
redis.call('INCR', base .. ':size')
local len = redis.call('RPUSH', base .. ':group:' .. group, id)
if len == 1 and redis.call('SISMEMBER', base .. ':locked', group) == 0 then
  redis.call('RPUSH', base .. ':ready', group)
end
return {id, '0'}
"#;

// ARGV: base, max messages, visibility ms, retention ms, receipt tokens...
const RECEIVE_SCRIPT: &str = r#"
local base = ARGV[1]
local max = tonumber(ARGV[2])
local visibility = tonumber(ARGV[3])
local retention = tonumber(ARGV[4])
local now = now_ms()
local inflight = base .. ':inflight'
local ready = base .. ':ready'
local locked = base .. ':locked'

local expired = redis.call('ZRANGEBYSCORE', inflight, '-inf', fmt(now))
for _, receipt in ipairs(expired) do
  local lease = base .. ':lease:' .. receipt
  local group = redis.call('HGET', lease, 'group')
  redis.call('DEL', lease)
  redis.call('ZREM', inflight, receipt)
  if group then
    redis.call('SREM', locked, group)
    if redis.call('LLEN', base .. ':group:' .. group) > 0 then
      redis.call('RPUSH', ready, group)
    end
  end
end

local out = {}
local taken = 0
while taken < max do
  local group = redis.call('LPOP', ready)
  if not group then
    break
  end
  local glist = base .. ':group:' .. group
  local id = nil
  while true do
    local head = redis.call('LINDEX', glist, 0)
    if not head then
      break
    end
    local msg = base .. ':msg:' .. head
    local enqueued = tonumber(redis.call('HGET', msg, 'enqueued_at') or '0')
    if redis.call('EXISTS', msg) == 0 or (retention > 0 and now - enqueued > retention) then
      redis.call('LPOP', glist)
      if redis.call('DEL', msg) == 1 then
        redis.call('DECR', base .. ':size')
      end
    else
      id = head
      break
    end
  end
  if id then
    taken = taken + 1
    local receipt = ARGV[4 + taken]
    local msg = base .. ':msg:' .. id
    redis.call('SADD', locked, group)
    redis.call('HSET', base .. ':lease:' .. receipt, 'id', id, 'group', group)
    redis.call('ZADD', inflight, fmt(now + visibility), receipt)
    local count = redis.call('HINCRBY', msg, 'receive_count', 1)
    table.insert(out, id)
    table.insert(out, receipt)
    table.insert(out, redis.call('HGET', msg, 'body'))
    table.insert(out, tostring(count))
  end
end
return out
"#;

// ARGV: base, receipt
const DELETE_SCRIPT: &str = r#"
local base = ARGV[1]
local lease = base .. ':lease:' .. ARGV[2]
local id = redis.call('HGET', lease, 'id')
if not id then
  return 0
end
local group = redis.call('HGET', lease, 'group')
redis.call('DEL', lease)
redis.call('ZREM', base .. ':inflight', ARGV[2])
local glist = base .. ':group:' .. group
redis.call('LREM', glist, 1, id)
if redis.call('DEL', base .. ':msg:' .. id) == 1 then
  redis.call('DECR', base .. ':size')
end
redis.call('SREM', base .. ':locked', group)
if redis.call('LLEN', glist) > 0 then
  redis.call('RPUSH', base .. ':ready', group)
end
return 1
"#;

/// Redis-backed stage queues.
///
/// Every state transition runs inside one Lua script, so concurrent workers on
/// any number of hosts observe the group lock, lease and dedup state atomically.
/// Lease deadlines come from the Redis server clock.
pub struct RedisQueue {
    client: redis::Client,
    prefix: String,
    dedup_window: Duration,
    retention: Duration,
    poll_interval: Duration,
    enqueue_script: redis::Script,
    receive_script: redis::Script,
    delete_script: redis::Script,
}

impl RedisQueue {
    pub fn new(
        redis_url: &str,
        prefix: &str,
        dedup_window: Duration,
        retention: Duration,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self {
            client,
            prefix: prefix.to_string(),
            // `SET ... PX 0` is rejected by Redis.
            dedup_window: dedup_window.max(Duration::from_millis(1)),
            retention,
            poll_interval: Duration::from_millis(250),
            enqueue_script: redis::Script::new(&format!("{SCRIPT_PRELUDE}{ENQUEUE_SCRIPT}")),
            receive_script: redis::Script::new(&format!("{SCRIPT_PRELUDE}{RECEIVE_SCRIPT}")),
            delete_script: redis::Script::new(&format!("{SCRIPT_PRELUDE}{DELETE_SCRIPT}")),
        })
    }

    /// How often an empty long-poll re-checks Redis.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn base(&self, queue: &str) -> String {
        format!("{}:{}", self.prefix, queue)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }

    async fn try_receive(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        base: &str,
        options: ReceiveOptions,
    ) -> Result<Vec<Delivery>, QueueError> {
        let mut invocation = self.receive_script.prepare_invoke();
        invocation
            .arg(base)
            .arg(options.max_messages)
            .arg(options.visibility.as_millis() as u64)
            .arg(self.retention.as_millis() as u64);
        for _ in 0..options.max_messages {
            invocation.arg(Uuid::new_v4().to_string());
        }

        let reply: Vec<String> = invocation.invoke_async(conn).await?;
        parse_deliveries(reply)
    }
}

fn parse_deliveries(reply: Vec<String>) -> Result<Vec<Delivery>, QueueError> {
    if reply.len() % 4 != 0 {
        return Err(QueueError::Protocol(format!(
            "receive returned {} fields",
            reply.len()
        )));
    }

    reply
        .chunks(4)
        .map(|chunk| {
            let receive_count = chunk[3]
                .parse()
                .map_err(|_| QueueError::Protocol(format!("bad receive count {}", chunk[3])))?;
            Ok(Delivery {
                message_id: chunk[0].clone(),
                receipt: chunk[1].clone(),
                body: chunk[2].clone(),
                receive_count,
            })
        })
        .collect()
}

#[async_trait]
impl WorkQueue for RedisQueue {
    async fn enqueue(
        &self,
        queue: &str,
        group_key: &str,
        dedup_key: &str,
        body: &str,
    ) -> Result<String, QueueError> {
        let mut conn = self.connection().await?;
        let (message_id, duplicate): (String, String) = self
            .enqueue_script
            .arg(self.base(queue))
            .arg(group_key)
            .arg(dedup_key)
            .arg(body)
            .arg(Uuid::new_v4().to_string())
            .arg(self.dedup_window.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;

        if duplicate == "1" {
            tracing::debug!(queue, dedup_key, message_id = %message_id, "Duplicate enqueue collapsed");
        }
        Ok(message_id)
    }

    async fn receive(
        &self,
        queue: &str,
        options: ReceiveOptions,
    ) -> Result<Vec<Delivery>, QueueError> {
        let mut conn = self.connection().await?;
        let base = self.base(queue);
        let deadline = Instant::now() + options.wait;

        loop {
            let deliveries = self.try_receive(&mut conn, &base, options).await?;
            let now = Instant::now();
            if !deliveries.is_empty() || now >= deadline {
                return Ok(deliveries);
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn delete(&self, queue: &str, receipt: &str) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let removed: i64 = self
            .delete_script
            .arg(self.base(queue))
            .arg(receipt)
            .invoke_async(&mut conn)
            .await?;

        if removed == 0 {
            return Err(QueueError::StaleReceipt(receipt.to_string()));
        }
        Ok(())
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        let mut conn = self.connection().await?;
        let base = self.base(queue);
        let (size, in_flight): (Option<i64>, u64) = redis::pipe()
            .cmd("GET")
            .arg(format!("{base}:size"))
            .cmd("ZCARD")
            .arg(format!("{base}:inflight"))
            .query_async(&mut conn)
            .await?;

        let size = size.unwrap_or(0).max(0) as u64;
        Ok(QueueStats {
            visible: size.saturating_sub(in_flight),
            in_flight,
        })
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Receipt {0} no longer holds a lease")]
    StaleReceipt(String),

    #[error("Unexpected queue reply: {0}")]
    Protocol(String),
}

impl QueueError {
    /// Transport failures; the caller may retry with the same dedup key.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Redis(_))
    }
}
