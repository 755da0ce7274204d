use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;

use crate::controller::{PumpEvent, PumpType, Reading, Source};
use crate::crops::Crop;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Profile {
    pub user_id: String,
    pub farm_location: Option<String>,
    pub current_crop: Option<String>,
    pub crop_min_ph: Option<f64>,
    pub crop_max_ph: Option<f64>,
    pub last_visited: Option<i64>,
}

type ProfileRow = (
    String,
    Option<String>,
    Option<String>,
    Option<f64>,
    Option<f64>,
    Option<i64>,
);

type PumpLogRow = (i64, String, String, String, f64);

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/ecosterile/ecosterile.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // Every connection to an in-memory database is a separate database,
        // so it gets exactly one that is never recycled.
        let in_memory = db_url.contains(":memory:");
        let mut pool_options = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 5 });
        if in_memory {
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Crop catalog
    // ----------------------------

    pub async fn upsert_crop(&self, crop: &Crop, position: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO crops (value, label, min_ph, max_ph, position)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(value) DO UPDATE SET
              label=excluded.label,
              min_ph=excluded.min_ph,
              max_ph=excluded.max_ph,
              position=excluded.position
            "#,
        )
        .bind(&crop.value)
        .bind(&crop.label)
        .bind(crop.min_ph)
        .bind(crop.max_ph)
        .bind(position)
        .execute(&self.pool)
        .await
        .context("upsert_crop failed")?;
        Ok(())
    }

    /// Delete every crop whose value is not in `keep`. Returns rows removed.
    pub async fn retain_crops(&self, keep: &[String]) -> Result<u64> {
        let keep = serde_json::to_string(keep).context("failed to encode crop list")?;
        let res = sqlx::query(
            r#"
            DELETE FROM crops
            WHERE value NOT IN (SELECT value FROM json_each(?))
            "#,
        )
        .bind(keep)
        .execute(&self.pool)
        .await
        .context("retain_crops failed")?;
        Ok(res.rows_affected())
    }

    pub async fn load_crops(&self) -> Result<Vec<Crop>> {
        let rows: Vec<(String, String, f64, f64)> = sqlx::query_as(
            r#"
            SELECT value, label, min_ph, max_ph
            FROM crops
            ORDER BY position, value
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("load_crops failed")?;

        Ok(rows
            .into_iter()
            .map(|(value, label, min_ph, max_ph)| Crop {
                value,
                label,
                min_ph,
                max_ph,
            })
            .collect())
    }

    // ----------------------------
    // Profiles
    // ----------------------------

    /// Create the profile if missing and refresh its farm location.
    pub async fn upsert_profile(&self, user_id: &str, farm_location: Option<&str>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO profiles (user_id, farm_location)
            VALUES (?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
              farm_location=excluded.farm_location
            "#,
        )
        .bind(user_id)
        .bind(farm_location)
        .execute(&self.pool)
        .await
        .context("upsert_profile failed")?;
        Ok(())
    }

    pub async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>> {
        let row: Option<ProfileRow> = sqlx::query_as(
            r#"
            SELECT user_id, farm_location, current_crop,
                   crop_min_ph, crop_max_ph, last_visited
            FROM profiles
            WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("get_profile failed")?;

        Ok(row.map(
            |(user_id, farm_location, current_crop, crop_min_ph, crop_max_ph, last_visited)| {
                Profile {
                    user_id,
                    farm_location,
                    current_crop,
                    crop_min_ph,
                    crop_max_ph,
                    last_visited,
                }
            },
        ))
    }

    pub async fn save_crop_selection(&self, user_id: &str, crop: &Crop) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO profiles (user_id, current_crop, crop_min_ph, crop_max_ph)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
              current_crop=excluded.current_crop,
              crop_min_ph=excluded.crop_min_ph,
              crop_max_ph=excluded.crop_max_ph
            "#,
        )
        .bind(user_id)
        .bind(&crop.value)
        .bind(crop.min_ph)
        .bind(crop.max_ph)
        .execute(&self.pool)
        .await
        .context("save_crop_selection failed")?;
        Ok(())
    }

    pub async fn touch_last_visited(&self, user_id: &str, ts: i64) -> Result<()> {
        sqlx::query("UPDATE profiles SET last_visited = ? WHERE user_id = ?")
            .bind(ts)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("touch_last_visited failed")?;
        Ok(())
    }

    // ----------------------------
    // pH readings
    // ----------------------------

    /// Store a reading. A second reading with the same timestamp replaces
    /// the first.
    pub async fn add_reading(&self, user_id: &str, reading: &Reading) -> Result<Reading> {
        sqlx::query(
            r#"
            INSERT INTO ph_readings (user_id, ts, value, source)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(user_id, ts) DO UPDATE SET
              value=excluded.value,
              source=excluded.source
            "#,
        )
        .bind(user_id)
        .bind(reading.timestamp)
        .bind(reading.value)
        .bind(reading.source.as_str())
        .execute(&self.pool)
        .await
        .context("add_reading failed")?;
        Ok(*reading)
    }

    /// The newest `limit` readings, oldest first.
    pub async fn recent_readings(&self, user_id: &str, limit: i64) -> Result<Vec<Reading>> {
        let rows: Vec<(i64, f64, String)> = sqlx::query_as(
            r#"
            SELECT ts, value, source FROM (
              SELECT ts, value, source
              FROM ph_readings
              WHERE user_id = ?
              ORDER BY ts DESC
              LIMIT ?
            )
            ORDER BY ts ASC
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_readings failed")?;

        rows.into_iter()
            .map(|(timestamp, value, source)| {
                Ok(Reading {
                    value,
                    timestamp,
                    source: Source::from_str(&source).map_err(anyhow::Error::msg)?,
                })
            })
            .collect()
    }

    // ----------------------------
    // Pump activity log
    // ----------------------------

    /// Append a pump event; returns its row id.
    pub async fn log_activity(&self, user_id: &str, event: &PumpEvent) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO pump_logs (user_id, ts, pump_type, reagent, concentration, ph_before)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(event.timestamp)
        .bind(event.pump_type.as_str())
        .bind(&event.reagent)
        .bind(&event.concentration)
        .bind(event.ph_before)
        .execute(&self.pool)
        .await
        .context("log_activity failed")?;
        Ok(result.last_insert_rowid())
    }

    /// The newest `limit` pump events, newest first.
    pub async fn recent_pump_logs(&self, user_id: &str, limit: i64) -> Result<Vec<PumpEvent>> {
        let rows: Vec<PumpLogRow> = sqlx::query_as(
            r#"
            SELECT ts, pump_type, reagent, concentration, ph_before
            FROM pump_logs
            WHERE user_id = ?
            ORDER BY ts DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_pump_logs failed")?;

        rows.into_iter()
            .map(|(timestamp, pump_type, reagent, concentration, ph_before)| {
                Ok(PumpEvent {
                    pump_type: PumpType::from_str(&pump_type).map_err(anyhow::Error::msg)?,
                    reagent,
                    concentration,
                    ph_before,
                    timestamp,
                })
            })
            .collect()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crops::default_catalog;

    async fn test_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    fn reading(value: f64, timestamp: i64, source: Source) -> Reading {
        Reading {
            value,
            timestamp,
            source,
        }
    }

    fn pump_event(pump_type: PumpType, timestamp: i64) -> PumpEvent {
        PumpEvent {
            pump_type,
            reagent: "Acetic Acid (CH3COOH)".into(),
            concentration: "1%".into(),
            ph_before: 8.1,
            timestamp,
        }
    }

    #[tokio::test]
    async fn crops_keep_catalog_order() {
        let db = test_db().await;
        for (i, crop) in default_catalog().iter().enumerate() {
            db.upsert_crop(crop, i as i64).await.unwrap();
        }
        let loaded = db.load_crops().await.unwrap();
        assert_eq!(loaded, default_catalog());
    }

    #[tokio::test]
    async fn upsert_crop_updates_band() {
        let db = test_db().await;
        let mut crop = default_catalog().remove(0);
        db.upsert_crop(&crop, 0).await.unwrap();
        crop.max_ph = 6.9;
        db.upsert_crop(&crop, 0).await.unwrap();
        let loaded = db.load_crops().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].max_ph, 6.9);
    }

    #[tokio::test]
    async fn profile_roundtrip_with_crop_selection() {
        let db = test_db().await;
        assert!(db.get_profile("u1").await.unwrap().is_none());

        db.upsert_profile("u1", Some("Punjab")).await.unwrap();
        let wheat = default_catalog().into_iter().find(|c| c.value == "wheat").unwrap();
        db.save_crop_selection("u1", &wheat).await.unwrap();
        db.touch_last_visited("u1", 42).await.unwrap();

        let p = db.get_profile("u1").await.unwrap().unwrap();
        assert_eq!(p.farm_location.as_deref(), Some("Punjab"));
        assert_eq!(p.current_crop.as_deref(), Some("wheat"));
        assert_eq!(p.crop_min_ph, Some(6.0));
        assert_eq!(p.crop_max_ph, Some(7.5));
        assert_eq!(p.last_visited, Some(42));
    }

    #[tokio::test]
    async fn readings_last_write_wins_and_ordered() {
        let db = test_db().await;
        db.add_reading("u1", &reading(7.0, 300, Source::Sensor)).await.unwrap();
        db.add_reading("u1", &reading(6.9, 100, Source::Simulated)).await.unwrap();
        db.add_reading("u1", &reading(7.2, 300, Source::Sensor)).await.unwrap();
        db.add_reading("u2", &reading(5.0, 200, Source::Sensor)).await.unwrap();

        let rows = db.recent_readings("u1", 500).await.unwrap();
        assert_eq!(
            rows,
            vec![
                reading(6.9, 100, Source::Simulated),
                reading(7.2, 300, Source::Sensor)
            ]
        );
    }

    #[tokio::test]
    async fn recent_readings_limit_keeps_newest() {
        let db = test_db().await;
        for ts in 0..10 {
            db.add_reading("u1", &reading(7.0, ts, Source::Sensor)).await.unwrap();
        }
        let rows = db.recent_readings("u1", 3).await.unwrap();
        let ts: Vec<i64> = rows.iter().map(|r| r.timestamp).collect();
        assert_eq!(ts, vec![7, 8, 9]);
    }

    #[tokio::test]
    async fn pump_logs_newest_first() {
        let db = test_db().await;
        db.log_activity("u1", &pump_event(PumpType::Basic, 10)).await.unwrap();
        db.log_activity("u1", &pump_event(PumpType::Acidic, 20)).await.unwrap();
        db.log_activity("u2", &pump_event(PumpType::Acidic, 30)).await.unwrap();

        let logs = db.recent_pump_logs("u1", 100).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].pump_type, PumpType::Acidic);
        assert_eq!(logs[0].timestamp, 20);
        assert_eq!(logs[1].pump_type, PumpType::Basic);
    }
}
