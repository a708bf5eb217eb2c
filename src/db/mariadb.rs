//! MariaDB management collaborator
//!
//! Implements [`DatabaseManager`] against a MariaDB server using the
//! `read_only` flag as the writable/standby switch and the GTID position
//! as the replication offset.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::{MySqlPool, Row};

use super::{DatabaseManager, Offset};
use crate::config::DatabaseConfig;
use crate::error::Result;

/// MariaDB implementation of the management collaborator
pub struct MariaDbManager {
    pool: MySqlPool,
}

impl MariaDbManager {
    /// Connect a management pool to the local MariaDB server
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let url = format!(
            "mysql://{}:{}@{}:{}",
            config.user, config.password, config.host, config.port
        );

        let pool = MySqlPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&url)
            .await?;

        Ok(Self { pool })
    }

    /// Extract the sequence number from a GTID position string such as
    /// `0-1-42` (domain-server-sequence), taking the highest sequence when
    /// multiple domains are listed
    fn parse_gtid_offset(gtid: &str) -> Offset {
        gtid.split(',')
            .filter_map(|g| g.trim().rsplit('-').next())
            .filter_map(|seq| seq.parse::<u64>().ok())
            .max()
            .unwrap_or(0)
    }
}

#[async_trait]
impl DatabaseManager for MariaDbManager {
    async fn promote(&self) -> Result<()> {
        // Stop consuming from the old leader before opening for writes
        sqlx::query("STOP ALL SLAVES").execute(&self.pool).await?;
        sqlx::query("SET GLOBAL read_only = 0")
            .execute(&self.pool)
            .await?;
        tracing::info!("Database promoted: read_only cleared, replication stopped");
        Ok(())
    }

    async fn demote(&self) -> Result<()> {
        sqlx::query("SET GLOBAL read_only = 1")
            .execute(&self.pool)
            .await?;
        tracing::info!("Database demoted: read_only set");
        Ok(())
    }

    async fn replication_offset(&self) -> Result<Offset> {
        let row = sqlx::query("SELECT @@gtid_current_pos AS pos")
            .fetch_one(&self.pool)
            .await?;
        let pos: String = row.try_get("pos")?;
        Ok(Self::parse_gtid_offset(&pos))
    }

    async fn is_recovering(&self) -> Result<bool> {
        let row = sqlx::query("SELECT @@read_only AS ro")
            .fetch_one(&self.pool)
            .await?;
        let read_only: i64 = row.try_get("ro")?;
        Ok(read_only != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gtid_offset() {
        assert_eq!(MariaDbManager::parse_gtid_offset("0-1-42"), 42);
        assert_eq!(MariaDbManager::parse_gtid_offset("0-1-42,1-2-7"), 42);
        assert_eq!(MariaDbManager::parse_gtid_offset("1-2-7,0-1-100"), 100);
        assert_eq!(MariaDbManager::parse_gtid_offset(""), 0);
        assert_eq!(MariaDbManager::parse_gtid_offset("garbage"), 0);
    }
}
