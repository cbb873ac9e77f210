//! Optional on-disk block store. Blocks, transactions and coins land in
//! three relational tables; reads happen only through explicit fetches.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::info;

use galena_core::{Block, Coin, Trx};

#[async_trait]
pub trait BlockStore: Send + Sync {
    async fn insert_block(&self, block: &Block) -> Result<()>;
    async fn fetch_block(&self, height: i64) -> Result<Option<Block>>;
    async fn last_height(&self) -> Result<Option<i64>>;
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `path`; `:memory:` gives
    /// a throwaway store.
    pub async fn open(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        info!(path, "block store ready");
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        for table in [
            r#"CREATE TABLE IF NOT EXISTS blocks(
                hash TEXT PRIMARY KEY,
                height INTEGER NOT NULL,
                nonce INTEGER NOT NULL,
                number_trx INTEGER NOT NULL,
                merkle_root TEXT NOT NULL,
                previous_hash TEXT NOT NULL,
                time INTEGER NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS trx(
                hash TEXT PRIMARY KEY,
                include_block TEXT NOT NULL REFERENCES blocks(hash),
                value INTEGER NOT NULL,
                t_index INTEGER NOT NULL,
                time INTEGER NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS coins(
                hash TEXT PRIMARY KEY,
                created_trx_hash TEXT NOT NULL,
                in_index INTEGER,
                value INTEGER NOT NULL,
                owner TEXT NOT NULL,
                spending_trx_hash TEXT,
                out_index INTEGER NOT NULL
            )"#,
        ] {
            sqlx::query(table).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn insert_trx(&self, block_hash: &str, index: usize, trx: &Trx) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO trx(hash, include_block, value, t_index, time)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&trx.hash)
        .bind(block_hash)
        .bind(trx.value as i64)
        .bind(index as i64)
        .bind(trx.time)
        .execute(&self.pool)
        .await?;
        for coin in trx.inputs.iter().chain(&trx.outputs) {
            self.insert_coin(coin).await?;
        }
        Ok(())
    }

    async fn insert_coin(&self, coin: &Coin) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO coins(hash, created_trx_hash, in_index, value, owner, spending_trx_hash, out_index)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(coin.coin_hash())
        .bind(&coin.created_trx_hash)
        .bind(coin.in_index.map(|i| i as i64))
        .bind(coin.value as i64)
        .bind(&coin.owner)
        .bind(coin.spending_trx_hash.as_deref())
        .bind(coin.out_index as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_trxs(&self, block_hash: &str, block_height: u64) -> Result<Vec<Trx>> {
        let rows = sqlx::query(
            "SELECT hash, value, t_index, time FROM trx WHERE include_block = ?1 ORDER BY t_index",
        )
        .bind(block_hash)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let hash: String = row.try_get("hash")?;
            let inputs = self.fetch_inputs(&hash).await?;
            let outputs = self.fetch_outputs(&hash).await?;
            let t_index: i64 = row.try_get("t_index")?;
            let is_subsidy = t_index == 0 && inputs.is_empty();
            let sender = inputs
                .first()
                .map(|c: &Coin| c.owner.clone())
                .unwrap_or_default();
            out.push(Trx {
                inputs,
                outputs,
                value: row.try_get::<i64, _>("value")? as u64,
                time: row.try_get("time")?,
                include_block: Some(block_height),
                sender,
                is_subsidy,
                hash,
            });
        }
        Ok(out)
    }

    async fn fetch_inputs(&self, trx_hash: &str) -> Result<Vec<Coin>> {
        let rows = sqlx::query(
            "SELECT created_trx_hash, in_index, value, owner, spending_trx_hash, out_index
             FROM coins WHERE spending_trx_hash = ?1 ORDER BY in_index",
        )
        .bind(trx_hash)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_coin).collect()
    }

    async fn fetch_outputs(&self, trx_hash: &str) -> Result<Vec<Coin>> {
        let rows = sqlx::query(
            "SELECT created_trx_hash, in_index, value, owner, spending_trx_hash, out_index
             FROM coins WHERE created_trx_hash = ?1 AND in_index IS NULL ORDER BY out_index",
        )
        .bind(trx_hash)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_coin).collect()
    }
}

fn row_to_coin(row: sqlx::sqlite::SqliteRow) -> Result<Coin> {
    Ok(Coin {
        owner: row.try_get("owner")?,
        value: row.try_get::<i64, _>("value")? as u64,
        created_trx_hash: row.try_get("created_trx_hash")?,
        out_index: row.try_get::<i64, _>("out_index")? as u32,
        spending_trx_hash: row.try_get("spending_trx_hash")?,
        in_index: row
            .try_get::<Option<i64>, _>("in_index")?
            .map(|i| i as u32),
    })
}

#[async_trait]
impl BlockStore for SqliteStore {
    async fn insert_block(&self, block: &Block) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO blocks(hash, height, nonce, number_trx, merkle_root, previous_hash, time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&block.block_hash)
        .bind(block.height as i64)
        .bind(block.nonce as i64)
        .bind(block.transactions.len() as i64)
        .bind(&block.merkle_root)
        .bind(&block.previous_hash)
        .bind(block.time)
        .execute(&self.pool)
        .await?;
        for (index, trx) in block.transactions.iter().enumerate() {
            self.insert_trx(&block.block_hash, index, trx).await?;
        }
        Ok(())
    }

    async fn fetch_block(&self, height: i64) -> Result<Option<Block>> {
        let Some(row) = sqlx::query(
            "SELECT hash, height, nonce, merkle_root, previous_hash, time FROM blocks WHERE height = ?1",
        )
        .bind(height)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };
        let hash: String = row.try_get("hash")?;
        let block_height = row.try_get::<i64, _>("height")? as u64;
        let transactions = self.fetch_trxs(&hash, block_height).await?;
        Ok(Some(Block {
            previous_hash: row.try_get("previous_hash")?,
            height: block_height,
            nonce: row.try_get::<i64, _>("nonce")? as u64,
            time: row.try_get("time")?,
            transactions,
            merkle_root: row.try_get("merkle_root")?,
            block_hash: hash,
        }))
    }

    async fn last_height(&self) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT MAX(height) AS height FROM blocks")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("height")?)
    }
}
