//! Durable source-of-truth storage for partition bitmaps.
//!
//! Each row of `meter_index_partitioned` holds one serialized partition
//! bitmap, keyed by (index_name, entity_id, granularity, partition_num).
//! The fast store is a cache in front of this table; losing it is
//! recoverable through the reindex admin surface.

use std::collections::BTreeMap;

use parking_lot::{Mutex, RwLock};
use postgres::{Client, NoTls};
use tracing::info;

use crate::{
    error::{IndexError, Result},
    time::Granularity,
};

pub trait IndexRepository: Send + Sync {
    fn get_bitmap(
        &self,
        index_name: &str,
        entity_id: i64,
        granularity: Granularity,
        partition: u32,
    ) -> Result<Option<Vec<u8>>>;

    /// Insert-or-replace on the unique partition key. Empty blobs are
    /// ignored.
    fn upsert_bitmap(
        &self,
        index_name: &str,
        entity_id: i64,
        granularity: Granularity,
        partition: u32,
        bitmap: &[u8],
    ) -> Result<()>;

    fn delete_bitmap(
        &self,
        index_name: &str,
        entity_id: i64,
        granularity: Granularity,
        partition: u32,
    ) -> Result<()>;

    fn delete_by_index_name(&self, index_name: &str) -> Result<u64>;
    fn count_by_index_name(&self, index_name: &str) -> Result<i64>;
    fn distinct_entities(&self, index_name: &str) -> Result<i64>;
    fn find_entity_ids(&self, index_name: &str) -> Result<Vec<i64>>;

    fn find_partitions(
        &self,
        index_name: &str,
        entity_id: i64,
        granularity: Granularity,
    ) -> Result<Vec<u32>>;
}

pub struct PostgresRepository {
    client: Mutex<Client>,
    schema: String,
}

impl PostgresRepository {
    /// Connects and bootstraps the schema, tables, and lookup indexes.
    pub fn connect(connection: &str, schema: &str) -> Result<Self> {
        let quoted = quote_schema(schema)?;
        let mut client =
            Client::connect(connection, NoTls).map_err(|err| IndexError::Config(err.to_string()))?;
        ensure_schema(&mut client, &quoted)?;
        info!(schema, "durable store ready");
        Ok(Self {
            client: Mutex::new(client),
            schema: quoted,
        })
    }
}

fn quote_schema(schema: &str) -> Result<String> {
    let valid = !schema.is_empty()
        && schema
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !schema.starts_with(|c: char| c.is_ascii_digit());
    if !valid {
        return Err(IndexError::Config(format!(
            "invalid schema name: {schema}"
        )));
    }
    Ok(format!("\"{schema}\""))
}

fn ensure_schema(client: &mut Client, schema: &str) -> Result<()> {
    client.batch_execute(&format!("CREATE SCHEMA IF NOT EXISTS {schema}"))?;
    client.batch_execute(&format!(
        "CREATE TABLE IF NOT EXISTS {schema}.meter_index_partitioned (
            id BIGSERIAL PRIMARY KEY,
            index_name TEXT NOT NULL,
            entity_id BIGINT NOT NULL,
            granularity TEXT NOT NULL,
            partition_num INTEGER NOT NULL,
            bitmap_data BYTEA NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            UNIQUE (index_name, entity_id, granularity, partition_num)
        )"
    ))?;
    client.batch_execute(&format!(
        "CREATE INDEX IF NOT EXISTS meter_index_partitioned_entity_idx
         ON {schema}.meter_index_partitioned (index_name, entity_id)"
    ))?;
    client.batch_execute(&format!(
        "CREATE TABLE IF NOT EXISTS {schema}.reindex_status (
            id BIGSERIAL PRIMARY KEY,
            index_name TEXT NOT NULL,
            status TEXT NOT NULL,
            granularity TEXT,
            partition_num INTEGER,
            total_records BIGINT NOT NULL DEFAULT 0,
            processed_records BIGINT NOT NULL DEFAULT 0,
            error_message TEXT,
            started_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            completed_at TIMESTAMPTZ
        )"
    ))?;
    Ok(())
}

impl IndexRepository for PostgresRepository {
    fn get_bitmap(
        &self,
        index_name: &str,
        entity_id: i64,
        granularity: Granularity,
        partition: u32,
    ) -> Result<Option<Vec<u8>>> {
        let sql = format!(
            "SELECT bitmap_data FROM {}.meter_index_partitioned
             WHERE index_name = $1 AND entity_id = $2 AND granularity = $3 AND partition_num = $4",
            self.schema
        );
        let rows = self.client.lock().query(
            &sql,
            &[
                &index_name,
                &entity_id,
                &granularity.as_str(),
                &(partition as i32),
            ],
        )?;
        Ok(rows.first().map(|row| row.get("bitmap_data")))
    }

    fn upsert_bitmap(
        &self,
        index_name: &str,
        entity_id: i64,
        granularity: Granularity,
        partition: u32,
        bitmap: &[u8],
    ) -> Result<()> {
        if bitmap.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "INSERT INTO {}.meter_index_partitioned
             (index_name, entity_id, granularity, partition_num, bitmap_data)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (index_name, entity_id, granularity, partition_num)
             DO UPDATE SET bitmap_data = EXCLUDED.bitmap_data, updated_at = NOW()",
            self.schema
        );
        self.client.lock().execute(
            &sql,
            &[
                &index_name,
                &entity_id,
                &granularity.as_str(),
                &(partition as i32),
                &bitmap,
            ],
        )?;
        Ok(())
    }

    fn delete_bitmap(
        &self,
        index_name: &str,
        entity_id: i64,
        granularity: Granularity,
        partition: u32,
    ) -> Result<()> {
        let sql = format!(
            "DELETE FROM {}.meter_index_partitioned
             WHERE index_name = $1 AND entity_id = $2 AND granularity = $3 AND partition_num = $4",
            self.schema
        );
        self.client.lock().execute(
            &sql,
            &[
                &index_name,
                &entity_id,
                &granularity.as_str(),
                &(partition as i32),
            ],
        )?;
        Ok(())
    }

    fn delete_by_index_name(&self, index_name: &str) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {}.meter_index_partitioned WHERE index_name = $1",
            self.schema
        );
        let deleted = self.client.lock().execute(&sql, &[&index_name])?;
        info!(index = index_name, deleted, "deleted durable partitions");
        Ok(deleted)
    }

    fn count_by_index_name(&self, index_name: &str) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {}.meter_index_partitioned WHERE index_name = $1",
            self.schema
        );
        let row = self.client.lock().query_one(&sql, &[&index_name])?;
        Ok(row.get(0))
    }

    fn distinct_entities(&self, index_name: &str) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(DISTINCT entity_id) FROM {}.meter_index_partitioned WHERE index_name = $1",
            self.schema
        );
        let row = self.client.lock().query_one(&sql, &[&index_name])?;
        Ok(row.get(0))
    }

    fn find_entity_ids(&self, index_name: &str) -> Result<Vec<i64>> {
        let sql = format!(
            "SELECT DISTINCT entity_id FROM {}.meter_index_partitioned
             WHERE index_name = $1 ORDER BY entity_id",
            self.schema
        );
        let rows = self.client.lock().query(&sql, &[&index_name])?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    fn find_partitions(
        &self,
        index_name: &str,
        entity_id: i64,
        granularity: Granularity,
    ) -> Result<Vec<u32>> {
        let sql = format!(
            "SELECT partition_num FROM {}.meter_index_partitioned
             WHERE index_name = $1 AND entity_id = $2 AND granularity = $3
             ORDER BY partition_num",
            self.schema
        );
        let rows = self.client.lock().query(
            &sql,
            &[&index_name, &entity_id, &granularity.as_str()],
        )?;
        Ok(rows
            .iter()
            .map(|row| row.get::<_, i32>(0) as u32)
            .collect())
    }
}

/// In-process durable store used by tests and embedded setups.
#[derive(Default)]
pub struct MemoryRepository {
    rows: RwLock<BTreeMap<(String, i64, &'static str, u32), Vec<u8>>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IndexRepository for MemoryRepository {
    fn get_bitmap(
        &self,
        index_name: &str,
        entity_id: i64,
        granularity: Granularity,
        partition: u32,
    ) -> Result<Option<Vec<u8>>> {
        Ok(self
            .rows
            .read()
            .get(&(
                index_name.to_string(),
                entity_id,
                granularity.as_str(),
                partition,
            ))
            .cloned())
    }

    fn upsert_bitmap(
        &self,
        index_name: &str,
        entity_id: i64,
        granularity: Granularity,
        partition: u32,
        bitmap: &[u8],
    ) -> Result<()> {
        if bitmap.is_empty() {
            return Ok(());
        }
        self.rows.write().insert(
            (
                index_name.to_string(),
                entity_id,
                granularity.as_str(),
                partition,
            ),
            bitmap.to_vec(),
        );
        Ok(())
    }

    fn delete_bitmap(
        &self,
        index_name: &str,
        entity_id: i64,
        granularity: Granularity,
        partition: u32,
    ) -> Result<()> {
        self.rows.write().remove(&(
            index_name.to_string(),
            entity_id,
            granularity.as_str(),
            partition,
        ));
        Ok(())
    }

    fn delete_by_index_name(&self, index_name: &str) -> Result<u64> {
        let mut rows = self.rows.write();
        let before = rows.len();
        rows.retain(|(name, _, _, _), _| name != index_name);
        Ok((before - rows.len()) as u64)
    }

    fn count_by_index_name(&self, index_name: &str) -> Result<i64> {
        Ok(self
            .rows
            .read()
            .keys()
            .filter(|(name, _, _, _)| name == index_name)
            .count() as i64)
    }

    fn distinct_entities(&self, index_name: &str) -> Result<i64> {
        Ok(self.find_entity_ids(index_name)?.len() as i64)
    }

    fn find_entity_ids(&self, index_name: &str) -> Result<Vec<i64>> {
        let mut ids: Vec<i64> = self
            .rows
            .read()
            .keys()
            .filter(|(name, _, _, _)| name == index_name)
            .map(|(_, entity_id, _, _)| *entity_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    fn find_partitions(
        &self,
        index_name: &str,
        entity_id: i64,
        granularity: Granularity,
    ) -> Result<Vec<u32>> {
        Ok(self
            .rows
            .read()
            .keys()
            .filter(|(name, entity, g, _)| {
                name == index_name && *entity == entity_id && *g == granularity.as_str()
            })
            .map(|(_, _, _, partition)| *partition)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_repository_round_trip() {
        let repo = MemoryRepository::new();
        repo.upsert_bitmap("m", 1, Granularity::Day, 109, b"blob")
            .unwrap();
        repo.upsert_bitmap("m", 1, Granularity::Day, 110, b"blob2")
            .unwrap();
        repo.upsert_bitmap("m", 2, Granularity::Month, 3, b"blob3")
            .unwrap();

        assert_eq!(
            repo.get_bitmap("m", 1, Granularity::Day, 109)
                .unwrap()
                .as_deref(),
            Some(&b"blob"[..])
        );
        assert_eq!(repo.count_by_index_name("m").unwrap(), 3);
        assert_eq!(repo.distinct_entities("m").unwrap(), 2);
        assert_eq!(repo.find_entity_ids("m").unwrap(), vec![1, 2]);
        assert_eq!(
            repo.find_partitions("m", 1, Granularity::Day).unwrap(),
            vec![109, 110]
        );

        assert_eq!(repo.delete_by_index_name("m").unwrap(), 3);
        assert_eq!(repo.count_by_index_name("m").unwrap(), 0);
    }

    #[test]
    fn empty_blobs_are_ignored() {
        let repo = MemoryRepository::new();
        repo.upsert_bitmap("m", 1, Granularity::Year, 0, b"").unwrap();
        assert_eq!(repo.count_by_index_name("m").unwrap(), 0);
    }

    #[test]
    fn schema_names_are_validated() {
        assert!(quote_schema("e4s_index").is_ok());
        assert!(quote_schema("9bad").is_err());
        assert!(quote_schema("drop table; --").is_err());
        assert!(quote_schema("").is_err());
    }
}
