//! Redis implementation of the Stockline shared store.
//!
//! One Redis instance holds the three namespaces of the engine:
//!
//! - **Counters**: `stock:<productId>` → integer, with a TTL
//! - **Reservations**: `reservation:<userId>:<productId>` → hash, plus the
//!   per-product index set `reservation-index:<productId>`
//! - **Settlements**: `settlement:<productId>` → hash of the settlement epoch and
//!   the lease deadline of each in-flight confirmation
//! - **Locks**: `lock:<productId>` / `lock:catalog-import` → owner token, `PX` lease
//!
//! Every mutation of shared state is a single Lua script or a single
//! `SET NX PX`, so concurrent engine instances never interleave a
//! read-modify-write. Scripts touch keys derived inside the script (the index
//! members), which requires a single Redis instance rather than a cluster.
//!
//! # Example
//!
//! ```no_run
//! use stockline_redis::RedisStockStore;
//!
//! # async fn example() -> stockline_core::Result<()> {
//! let store = RedisStockStore::connect("redis://127.0.0.1:6379").await?;
//! # Ok(())
//! # }
//! ```

mod codec;
mod scripts;

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use stockline_core::environment::millis;
use stockline_core::keys::{
    self, LOCK_PREFIX, RESERVATION_INDEX_PREFIX, RESERVATION_PREFIX, STOCK_PREFIX,
};
use stockline_core::store::{
    ConfirmOutcome, FinalizeOutcome, HoldOutcome, HoldRequest, KeyCensus, LedgerSnapshot,
    LockHolder, LockStore, PublishOutcome, ReleaseMode, ReleaseOutcome, SeedOutcome, StockStore,
};
use stockline_core::{
    LockToken, ProductId, Reservation, Resource, Result, StockError, UserId,
};

use scripts::Scripts;

/// Keys requested per `SCAN` iteration.
const SCAN_COUNT: usize = 500;

/// How long a settlement record outlives its last confirmation.
const SETTLEMENT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Redis-backed counters, reservations and locks.
///
/// Cloning is cheap: the connection manager multiplexes one connection and
/// the compiled scripts are shared.
#[derive(Clone)]
pub struct RedisStockStore {
    /// Connection manager for connection pooling.
    conn_manager: ConnectionManager,
    scripts: Arc<Scripts>,
}

impl RedisStockStore {
    /// Connect to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Store`] if the client cannot be created or the
    /// connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| StockError::Store(format!("Failed to create Redis client: {e}")))?;

        let conn_manager = ConnectionManager::new(client).await.map_err(|e| {
            StockError::Store(format!("Failed to create Redis connection manager: {e}"))
        })?;

        tracing::info!("Connected to Redis stock store");

        Ok(Self {
            conn_manager,
            scripts: Arc::new(Scripts::new()),
        })
    }

    /// Collect every key matching `pattern` with cursor-based `SCAN`.
    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn_manager.clone();
        let mut cursor: u64 = 0;
        let mut found = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(|e| StockError::Store(format!("Failed to scan {pattern}: {e}")))?;

            found.extend(batch);
            if next == 0 {
                return Ok(found);
            }
            cursor = next;
        }
    }

    /// Load reservation hashes in one pipeline, skipping keys that expired.
    async fn load_records(&self, reservation_keys: &[String]) -> Result<Vec<Reservation>> {
        if reservation_keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn_manager.clone();
        let mut pipe = redis::pipe();
        for key in reservation_keys {
            pipe.hgetall(key);
        }
        let hashes: Vec<HashMap<String, String>> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| StockError::Store(format!("Failed to load reservations: {e}")))?;

        let mut records = Vec::with_capacity(hashes.len());
        for fields in &hashes {
            if let Some(record) = codec::decode_record(fields)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Run a script that writes `snapshot.stock - Σ pending` into the counter
    /// when no confirmation settled since the snapshot.
    async fn derive_counter(
        &self,
        script: &redis::Script,
        product_id: &ProductId,
        snapshot: &LedgerSnapshot,
        ttl: Duration,
    ) -> redis::RedisResult<Vec<i64>> {
        let mut conn = self.conn_manager.clone();
        script
            .key(keys::stock_key(product_id))
            .key(keys::reservation_index_key(product_id))
            .key(keys::settlement_key(product_id))
            .arg(snapshot.stock)
            .arg(millis(ttl))
            .arg(RESERVATION_PREFIX)
            .arg(product_id.to_string())
            .arg(snapshot.epoch)
            .arg(snapshot.at.timestamp_millis())
            .invoke_async(&mut conn)
            .await
    }
}

impl StockStore for RedisStockStore {
    async fn counter(&self, product_id: &ProductId) -> Result<Option<i64>> {
        let mut conn = self.conn_manager.clone();
        conn.get(keys::stock_key(product_id))
            .await
            .map_err(|e| StockError::Store(format!("Failed to read counter: {e}")))
    }

    async fn counters(&self, product_ids: &[ProductId]) -> Result<Vec<Option<i64>>> {
        if product_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn_manager.clone();
        let stock_keys: Vec<String> = product_ids.iter().map(keys::stock_key).collect();
        let values: Vec<Option<i64>> = redis::cmd("MGET")
            .arg(&stock_keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| StockError::Store(format!("Failed to read counters: {e}")))?;
        Ok(values)
    }

    async fn settlement_epoch(&self, product_id: &ProductId) -> Result<u64> {
        let mut conn = self.conn_manager.clone();
        let epoch: Option<u64> = conn
            .hget(keys::settlement_key(product_id), "epoch")
            .await
            .map_err(|e| StockError::Store(format!("Failed to read settlement epoch: {e}")))?;
        Ok(epoch.unwrap_or(0))
    }

    async fn begin_settlement(
        &self,
        user_id: &UserId,
        product_id: &ProductId,
        lease_until: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let key = keys::settlement_key(product_id);
        let _: () = redis::pipe()
            .atomic()
            .hincr(&key, "epoch", 1)
            .ignore()
            .hset(&key, user_id.to_string(), lease_until.timestamp_millis())
            .ignore()
            .pexpire(&key, millis(SETTLEMENT_RETENTION))
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| StockError::Store(format!("Failed to begin settlement: {e}")))?;
        Ok(())
    }

    async fn end_settlement(&self, user_id: &UserId, product_id: &ProductId) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let key = keys::settlement_key(product_id);
        let _: () = redis::pipe()
            .atomic()
            .hincr(&key, "epoch", 1)
            .ignore()
            .hdel(&key, user_id.to_string())
            .ignore()
            .pexpire(&key, millis(SETTLEMENT_RETENTION))
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| StockError::Store(format!("Failed to end settlement: {e}")))?;
        Ok(())
    }

    async fn seed_counter(
        &self,
        product_id: &ProductId,
        snapshot: &LedgerSnapshot,
        ttl: Duration,
    ) -> Result<SeedOutcome> {
        let reply = self
            .derive_counter(&self.scripts.seed, product_id, snapshot, ttl)
            .await
            .map_err(|e| StockError::Store(format!("Failed to seed counter: {e}")))?;

        match reply.as_slice() {
            [1, value] => Ok(SeedOutcome::Seeded(*value)),
            [0, value] => Ok(SeedOutcome::Present(*value)),
            [2, _] => Ok(SeedOutcome::Settling),
            other => Err(StockError::Store(format!("Unexpected seed reply: {other:?}"))),
        }
    }

    async fn publish_counter(
        &self,
        product_id: &ProductId,
        snapshot: &LedgerSnapshot,
        ttl: Duration,
    ) -> Result<PublishOutcome> {
        let reply = self
            .derive_counter(&self.scripts.publish, product_id, snapshot, ttl)
            .await
            .map_err(|e| StockError::Store(format!("Failed to publish counter: {e}")))?;

        match reply.as_slice() {
            [1, value] => Ok(PublishOutcome::Published(*value)),
            [2, _] => Ok(PublishOutcome::Settling),
            other => Err(StockError::Store(format!("Unexpected publish reply: {other:?}"))),
        }
    }

    async fn invalidate_counter(&self, product_id: &ProductId) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        let removed: i64 = conn
            .del(keys::stock_key(product_id))
            .await
            .map_err(|e| StockError::Store(format!("Failed to invalidate counter: {e}")))?;
        Ok(removed > 0)
    }

    async fn place_hold(&self, request: &HoldRequest) -> Result<HoldOutcome> {
        let mut conn = self.conn_manager.clone();
        let reply: Vec<i64> = self
            .scripts
            .place_hold
            .key(keys::stock_key(&request.product_id))
            .key(keys::reservation_key(&request.user_id, &request.product_id))
            .key(keys::reservation_index_key(&request.product_id))
            .arg(request.user_id.to_string())
            .arg(request.product_id.to_string())
            .arg(request.quantity)
            .arg(request.now.timestamp_millis())
            .arg(request.expires_at.timestamp_millis())
            .arg(millis(request.retention))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StockError::Store(format!("Failed to place hold: {e}")))?;

        codec::decode_hold(request, &reply)
    }

    async fn reservation(
        &self,
        user_id: &UserId,
        product_id: &ProductId,
    ) -> Result<Option<Reservation>> {
        let mut conn = self.conn_manager.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(keys::reservation_key(user_id, product_id))
            .await
            .map_err(|e| StockError::Store(format!("Failed to read reservation: {e}")))?;
        codec::decode_record(&fields)
    }

    async fn mark_confirmed(
        &self,
        user_id: &UserId,
        product_id: &ProductId,
        at: DateTime<Utc>,
        retention: Duration,
    ) -> Result<ConfirmOutcome> {
        let mut conn = self.conn_manager.clone();
        let reply: Vec<String> = self
            .scripts
            .mark_confirmed
            .key(keys::reservation_key(user_id, product_id))
            .arg(at.timestamp_millis())
            .arg(millis(retention))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StockError::Store(format!("Failed to confirm reservation: {e}")))?;

        codec::decode_confirm(*user_id, *product_id, &reply)
    }

    async fn release_hold(
        &self,
        user_id: &UserId,
        product_id: &ProductId,
        at: DateTime<Utc>,
        retention: Duration,
        mode: ReleaseMode,
    ) -> Result<FinalizeOutcome> {
        let mode = match mode {
            ReleaseMode::Always => "always",
            ReleaseMode::IfExpired => "if_expired",
        };

        let mut conn = self.conn_manager.clone();
        let reply: Vec<String> = self
            .scripts
            .release_hold
            .key(keys::reservation_key(user_id, product_id))
            .key(keys::stock_key(product_id))
            .arg(at.timestamp_millis())
            .arg(millis(retention))
            .arg(mode)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StockError::Store(format!("Failed to release hold: {e}")))?;

        codec::decode_finalize(*user_id, *product_id, &reply)
    }

    async fn product_reservations(&self, product_id: &ProductId) -> Result<Vec<Reservation>> {
        let mut conn = self.conn_manager.clone();
        let members: Vec<String> = conn
            .smembers(keys::reservation_index_key(product_id))
            .await
            .map_err(|e| StockError::Store(format!("Failed to read reservation index: {e}")))?;

        let mut reservation_keys = Vec::with_capacity(members.len());
        for member in &members {
            let user_id: UserId = member.parse().map_err(|e| {
                StockError::Store(format!("Invalid user id {member:?} in reservation index: {e}"))
            })?;
            reservation_keys.push(keys::reservation_key(&user_id, product_id));
        }
        self.load_records(&reservation_keys).await
    }

    async fn user_reservations(&self, user_id: &UserId) -> Result<Vec<Reservation>> {
        let reservation_keys = self
            .scan(&format!("{RESERVATION_PREFIX}{user_id}:*"))
            .await?;
        self.load_records(&reservation_keys).await
    }

    async fn reserved_products(&self) -> Result<Vec<ProductId>> {
        let index_keys = self
            .scan(&format!("{RESERVATION_INDEX_PREFIX}*"))
            .await?;
        Ok(index_keys
            .iter()
            .filter_map(|key| keys::product_from_index_key(key))
            .collect())
    }

    async fn census(&self) -> Result<KeyCensus> {
        Ok(KeyCensus {
            stock_keys: self.scan(&format!("{STOCK_PREFIX}*")).await?.len(),
            reservation_keys: self.scan(&format!("{RESERVATION_PREFIX}*")).await?.len(),
            lock_keys: self.scan(&format!("{LOCK_PREFIX}*")).await?.len(),
        })
    }
}

impl LockStore for RedisStockStore {
    async fn try_acquire(
        &self,
        resource: &Resource,
        token: &LockToken,
        ttl: Duration,
    ) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(keys::lock_key(resource))
            .arg(token.to_string())
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| StockError::Store(format!("Failed to acquire lock on {resource}: {e}")))?;
        Ok(reply.is_some())
    }

    async fn release(&self, resource: &Resource, token: &LockToken) -> Result<ReleaseOutcome> {
        let mut conn = self.conn_manager.clone();
        let reply: i64 = self
            .scripts
            .unlock
            .key(keys::lock_key(resource))
            .arg(token.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StockError::Store(format!("Failed to release lock on {resource}: {e}")))?;

        match reply {
            1 => Ok(ReleaseOutcome::Released),
            0 => Ok(ReleaseOutcome::NotOwner),
            -1 => Ok(ReleaseOutcome::NotHeld),
            other => Err(StockError::Store(format!("Unexpected unlock reply: {other}"))),
        }
    }

    async fn holder(&self, resource: &Resource) -> Result<Option<LockHolder>> {
        let mut conn = self.conn_manager.clone();
        let key = keys::lock_key(resource);
        let (token, pttl): (Option<String>, i64) = redis::pipe()
            .get(&key)
            .pttl(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| StockError::Store(format!("Failed to read lock on {resource}: {e}")))?;

        let Some(token) = token else {
            return Ok(None);
        };
        let token: LockToken = token
            .parse()
            .map_err(|e| StockError::Store(format!("Invalid lock token on {resource}: {e}")))?;
        let remaining = u64::try_from(pttl).ok().map(Duration::from_millis);

        Ok(Some(LockHolder { token, remaining }))
    }

    async fn force_release(&self, resource: &Resource) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        let removed: i64 = conn
            .del(keys::lock_key(resource))
            .await
            .map_err(|e| StockError::Store(format!("Failed to force release {resource}: {e}")))?;
        Ok(removed > 0)
    }
}
