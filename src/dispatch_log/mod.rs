//! DispatchLog - Dispatch Record Persistence
//!
//! ## Responsibilities
//!
//! - One record per dispatch, keyed by (vehicle id, start time)
//! - Close the matching record on arrival (explicit start time, or the latest for the vehicle)
//! - Listing for the dispatch history endpoints
//!
//! MySQL (`dispatch_logs` table) in deployment, in-memory when no database is configured.

use crate::error::Result;
use crate::models::{normalize_vehicle_id, FILE_TS_FORMAT};
use crate::object_store::{list_all, ObjectStore};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::mysql::MySqlPool;
use sqlx::Row;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// Dispatch record (matches dispatch_logs table)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub car_no: String,
    pub start_time: NaiveDateTime,
    pub arrival_time: Option<NaiveDateTime>,
    /// Recording file name derived from the key
    pub media_file: String,
}

impl DispatchRecord {
    /// New open record for a dispatch start
    pub fn started(car_no: &str, start_time: NaiveDateTime) -> Self {
        Self {
            car_no: car_no.to_string(),
            start_time,
            arrival_time: None,
            media_file: media_file_name(car_no, &start_time),
        }
    }
}

/// "{normalized}_{YYYYmmdd_HHMMSS}"
pub fn dispatch_stem(car_no: &str, start_time: &NaiveDateTime) -> String {
    format!(
        "{}_{}",
        normalize_vehicle_id(car_no),
        start_time.format(FILE_TS_FORMAT)
    )
}

/// Recording file name for a dispatch
pub fn media_file_name(car_no: &str, start_time: &NaiveDateTime) -> String {
    format!("{}.mjpeg", dispatch_stem(car_no, start_time))
}

/// Storage key of the uploaded trip log
pub fn trip_log_key(car_no: &str, start_time: &NaiveDateTime) -> String {
    format!("logs/{}.csv", dispatch_stem(car_no, start_time))
}

/// Report photo keys belonging to one dispatch
pub async fn report_photo_keys(
    store: &dyn ObjectStore,
    car_no: &str,
    start_time: &NaiveDateTime,
) -> Result<Vec<String>> {
    let prefix = format!("images/{}_track", normalize_vehicle_id(car_no));
    let ts = start_time.format(FILE_TS_FORMAT).to_string();
    let suffixes = ["jpg", "jpeg", "png"].map(|ext| format!("_{}.{}", ts, ext));

    Ok(list_all(store, &prefix)
        .await?
        .into_iter()
        .filter(|k| suffixes.iter().any(|s| k.ends_with(s.as_str())))
        .collect())
}

/// Dispatch record repository
#[async_trait]
pub trait DispatchRepository: Send + Sync {
    /// Insert or replace the record for (car, start_time)
    async fn upsert_start(&self, record: &DispatchRecord) -> Result<()>;

    /// Set the arrival time on the matching record
    ///
    /// With `start_time = None` the latest record for the car is closed.
    /// Returns the closed record, or `None` when nothing matched.
    async fn mark_arrival(
        &self,
        car_no: &str,
        start_time: Option<NaiveDateTime>,
        arrival_time: NaiveDateTime,
    ) -> Result<Option<DispatchRecord>>;

    /// Latest record (by start time) for a vehicle
    async fn latest_for(&self, car_no: &str) -> Result<Option<DispatchRecord>>;

    /// Record for an exact key
    async fn find(&self, car_no: &str, start_time: NaiveDateTime) -> Result<Option<DispatchRecord>>;

    /// All records, newest first
    async fn list(&self) -> Result<Vec<DispatchRecord>>;
}

/// MySQL-backed repository
pub struct MySqlDispatchRepository {
    pool: MySqlPool,
}

impl MySqlDispatchRepository {
    /// Create new repository
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    /// Create the table if missing
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dispatch_logs (
                car_no VARCHAR(32) NOT NULL,
                start_time DATETIME NOT NULL,
                arrival_time DATETIME NULL,
                media_file VARCHAR(255) NOT NULL,
                PRIMARY KEY (car_no, start_time)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        tracing::info!("dispatch_logs schema ready");
        Ok(())
    }

    fn row_to_record(row: sqlx::mysql::MySqlRow) -> Result<DispatchRecord> {
        Ok(DispatchRecord {
            car_no: row.try_get("car_no")?,
            start_time: row.try_get("start_time")?,
            arrival_time: row.try_get("arrival_time")?,
            media_file: row.try_get("media_file")?,
        })
    }
}

#[async_trait]
impl DispatchRepository for MySqlDispatchRepository {
    async fn upsert_start(&self, record: &DispatchRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dispatch_logs (car_no, start_time, arrival_time, media_file)
            VALUES (?, ?, ?, ?)
            ON DUPLICATE KEY UPDATE
                arrival_time = VALUES(arrival_time),
                media_file = VALUES(media_file)
            "#,
        )
        .bind(&record.car_no)
        .bind(record.start_time)
        .bind(record.arrival_time)
        .bind(&record.media_file)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_arrival(
        &self,
        car_no: &str,
        start_time: Option<NaiveDateTime>,
        arrival_time: NaiveDateTime,
    ) -> Result<Option<DispatchRecord>> {
        let target = match start_time {
            Some(start) => self.find(car_no, start).await?,
            None => self.latest_for(car_no).await?,
        };
        let Some(mut record) = target else {
            return Ok(None);
        };

        sqlx::query("UPDATE dispatch_logs SET arrival_time = ? WHERE car_no = ? AND start_time = ?")
            .bind(arrival_time)
            .bind(&record.car_no)
            .bind(record.start_time)
            .execute(&self.pool)
            .await?;

        record.arrival_time = Some(arrival_time);
        Ok(Some(record))
    }

    async fn latest_for(&self, car_no: &str) -> Result<Option<DispatchRecord>> {
        let row = sqlx::query(
            r#"
            SELECT car_no, start_time, arrival_time, media_file
            FROM dispatch_logs
            WHERE car_no = ?
            ORDER BY start_time DESC
            LIMIT 1
            "#,
        )
        .bind(car_no)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_record).transpose()
    }

    async fn find(&self, car_no: &str, start_time: NaiveDateTime) -> Result<Option<DispatchRecord>> {
        let row = sqlx::query(
            r#"
            SELECT car_no, start_time, arrival_time, media_file
            FROM dispatch_logs
            WHERE car_no = ? AND start_time = ?
            "#,
        )
        .bind(car_no)
        .bind(start_time)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_record).transpose()
    }

    async fn list(&self) -> Result<Vec<DispatchRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT car_no, start_time, arrival_time, media_file
            FROM dispatch_logs
            ORDER BY start_time DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_record).collect()
    }
}

/// In-memory repository (no database configured, tests)
#[derive(Default)]
pub struct InMemoryDispatchRepository {
    records: RwLock<BTreeMap<(String, NaiveDateTime), DispatchRecord>>,
}

impl InMemoryDispatchRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DispatchRepository for InMemoryDispatchRepository {
    async fn upsert_start(&self, record: &DispatchRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert((record.car_no.clone(), record.start_time), record.clone());
        Ok(())
    }

    async fn mark_arrival(
        &self,
        car_no: &str,
        start_time: Option<NaiveDateTime>,
        arrival_time: NaiveDateTime,
    ) -> Result<Option<DispatchRecord>> {
        let mut records = self.records.write().await;
        let key = match start_time {
            Some(start) => (car_no.to_string(), start),
            None => match records
                .keys()
                .filter(|(car, _)| car == car_no)
                .max_by_key(|(_, start)| *start)
            {
                Some(key) => key.clone(),
                None => return Ok(None),
            },
        };

        Ok(records.get_mut(&key).map(|record| {
            record.arrival_time = Some(arrival_time);
            record.clone()
        }))
    }

    async fn latest_for(&self, car_no: &str) -> Result<Option<DispatchRecord>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.car_no == car_no)
            .max_by_key(|r| r.start_time)
            .cloned())
    }

    async fn find(&self, car_no: &str, start_time: NaiveDateTime) -> Result<Option<DispatchRecord>> {
        Ok(self
            .records
            .read()
            .await
            .get(&(car_no.to_string(), start_time))
            .cloned())
    }

    async fn list(&self) -> Result<Vec<DispatchRecord>> {
        let mut all: Vec<DispatchRecord> = self.records.read().await.values().cloned().collect();
        all.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::parse_dispatch_time;

    fn t(raw: &str) -> NaiveDateTime {
        parse_dispatch_time(raw).unwrap()
    }

    #[test]
    fn test_media_file_name() {
        assert_eq!(
            media_file_name("119다119", &t("2025-12-05 15:18:27")),
            "119da119_20251205_151827.mjpeg"
        );
    }

    #[tokio::test]
    async fn test_report_photo_keys_match_dispatch_start() {
        use crate::object_store::MemoryObjectStore;

        let store = MemoryObjectStore::new();
        for key in [
            "images/119da119_track3_20251205_151827.jpg",
            "images/119da119_track9_20251205_151827.png",
            "images/119da119_track4_20251205_090000.jpg",
            "images/119da1190_track1_20251205_151827.jpg",
            "images/119da119_track5_20251205_151827.txt",
        ] {
            store.put(b"x", key, "image/jpeg").await.unwrap();
        }

        let start = t("2025-12-05 15:18:27");
        let keys = report_photo_keys(&store, "119다119", &start).await.unwrap();
        assert_eq!(
            keys,
            vec![
                "images/119da119_track3_20251205_151827.jpg".to_string(),
                "images/119da119_track9_20251205_151827.png".to_string(),
            ]
        );
        assert_eq!(trip_log_key("119다119", &start), "logs/119da119_20251205_151827.csv");
    }

    #[tokio::test]
    async fn test_arrival_without_start_closes_latest() {
        let repo = InMemoryDispatchRepository::new();
        repo.upsert_start(&DispatchRecord::started("amb1", t("2025-12-05 09:00:00")))
            .await
            .unwrap();
        repo.upsert_start(&DispatchRecord::started("amb1", t("2025-12-05 15:00:00")))
            .await
            .unwrap();
        repo.upsert_start(&DispatchRecord::started("amb2", t("2025-12-05 16:00:00")))
            .await
            .unwrap();

        let closed = repo
            .mark_arrival("amb1", None, t("2025-12-05 15:20:00"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(closed.start_time, t("2025-12-05 15:00:00"));
        assert_eq!(closed.arrival_time, Some(t("2025-12-05 15:20:00")));

        let earlier = repo.find("amb1", t("2025-12-05 09:00:00")).await.unwrap().unwrap();
        assert!(earlier.arrival_time.is_none());
    }

    #[tokio::test]
    async fn test_arrival_with_explicit_start() {
        let repo = InMemoryDispatchRepository::new();
        repo.upsert_start(&DispatchRecord::started("amb1", t("2025-12-05 09:00:00")))
            .await
            .unwrap();
        repo.upsert_start(&DispatchRecord::started("amb1", t("2025-12-05 15:00:00")))
            .await
            .unwrap();

        let closed = repo
            .mark_arrival("amb1", Some(t("2025-12-05 09:00:00")), t("2025-12-05 09:30:00"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(closed.start_time, t("2025-12-05 09:00:00"));
        assert!(repo.latest_for("amb1").await.unwrap().unwrap().arrival_time.is_none());
    }

    #[tokio::test]
    async fn test_arrival_for_unknown_dispatch() {
        let repo = InMemoryDispatchRepository::new();
        assert!(repo
            .mark_arrival("ghost", None, t("2025-12-05 09:30:00"))
            .await
            .unwrap()
            .is_none());
        assert!(repo
            .mark_arrival("ghost", Some(t("2025-12-05 09:00:00")), t("2025-12-05 09:30:00"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_list_newest_first_and_upsert_replaces() {
        let repo = InMemoryDispatchRepository::new();
        repo.upsert_start(&DispatchRecord::started("a", t("2025-12-01 10:00:00")))
            .await
            .unwrap();
        repo.upsert_start(&DispatchRecord::started("b", t("2025-12-03 10:00:00")))
            .await
            .unwrap();
        repo.upsert_start(&DispatchRecord::started("a", t("2025-12-01 10:00:00")))
            .await
            .unwrap();

        let all = repo.list().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].car_no, "b");
    }
}
