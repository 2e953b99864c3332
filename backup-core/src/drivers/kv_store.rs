//! Key-value store access used by the redis driver.

use crate::config::RedisConfig;
use crate::utils::Result;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::IntoConnectionInfo;

/// Commands the backup and restore paths need from a key-value server.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn server_version(&self) -> Result<String>;

    /// Unix time of the last completed snapshot.
    async fn last_save(&self) -> Result<i64>;

    /// Start a background snapshot.
    async fn bgsave(&self) -> Result<()>;

    async fn scan_keys(&self) -> Result<Vec<Vec<u8>>>;

    /// Serialized value, or `None` if the key vanished.
    async fn dump(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Remaining TTL in milliseconds; negative when the key has none.
    async fn pttl(&self, key: &[u8]) -> Result<i64>;

    async fn flushdb(&self) -> Result<()>;

    async fn restore(&self, key: &[u8], ttl_ms: i64, payload: &[u8]) -> Result<()>;
}

/// Opens a store on one logical database index.
#[async_trait]
pub trait KeyValueConnector: Send + Sync {
    async fn connect(&self, db: i64, password: Option<&str>) -> Result<Box<dyn KeyValueStore>>;

    /// `host:port` for logs and reports.
    fn address(&self) -> String;
}

pub struct RedisConnector {
    host: String,
    port: u16,
}

impl RedisConnector {
    pub fn new(config: &RedisConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
        }
    }
}

#[async_trait]
impl KeyValueConnector for RedisConnector {
    async fn connect(&self, db: i64, password: Option<&str>) -> Result<Box<dyn KeyValueStore>> {
        let mut info = format!("redis://{}:{}/{}", self.host, self.port, db).into_connection_info()?;
        info.redis.password = password.map(str::to_string);

        let client = redis::Client::open(info)?;
        let conn = client.get_multiplexed_async_connection().await?;
        tracing::debug!(address = %self.address(), db, "Connected to key-value store");
        Ok(Box::new(RedisStore { conn }))
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// `redis` crate implementation over a multiplexed connection.
pub struct RedisStore {
    conn: MultiplexedConnection,
}

const SCAN_BATCH: usize = 1000;

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn server_version(&self) -> Result<String> {
        let mut conn = self.conn.clone();
        let info: String = redis::cmd("INFO").arg("server").query_async(&mut conn).await?;
        Ok(info
            .lines()
            .find_map(|l| l.strip_prefix("redis_version:"))
            .map(|v| v.trim().to_string())
            .unwrap_or_else(|| "unknown".to_string()))
    }

    async fn last_save(&self) -> Result<i64> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("LASTSAVE").query_async(&mut conn).await?)
    }

    async fn bgsave(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("BGSAVE").query_async(&mut conn).await?;
        Ok(())
    }

    async fn scan_keys(&self) -> Result<Vec<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<Vec<u8>>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn dump(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("DUMP").arg(key).query_async(&mut conn).await?)
    }

    async fn pttl(&self, key: &[u8]) -> Result<i64> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("PTTL").arg(key).query_async(&mut conn).await?)
    }

    async fn flushdb(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("FLUSHDB").query_async(&mut conn).await?;
        Ok(())
    }

    async fn restore(&self, key: &[u8], ttl_ms: i64, payload: &[u8]) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("RESTORE")
            .arg(key)
            .arg(ttl_ms.max(0))
            .arg(payload)
            .arg("REPLACE")
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}
