//! Relational store access
//!
//! All SQL lives here; the writer task and the query surface both call
//! through this repository. Schema is created on first boot.

use crate::error::Result;
use crate::state_store::DeviceState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use sqlx::Row;

/// History bucket granularity; boundaries align to the wall clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Minute,
    Hour,
    Day,
}

impl Bucket {
    /// `date_trunc` field name
    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::Minute => "minute",
            Bucket::Hour => "hour",
            Bucket::Day => "day",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "minute" => Some(Bucket::Minute),
            "hour" => Some(Bucket::Hour),
            "day" => Some(Bucket::Day),
            _ => None,
        }
    }
}

/// Persisted incident row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: i64,
    pub device_id: String,
    pub code: String,
    pub message: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub resolved: bool,
    pub resolution_note: Option<String>,
}

/// One reading destined for `sensor_readings`
#[derive(Debug, Clone)]
pub struct ReadingRow {
    pub device_id: String,
    pub metric: String,
    pub value: f64,
    pub ts: DateTime<Utc>,
}

/// Aggregated weather history point; empty buckets are omitted entirely
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherHistoryPoint {
    pub ts: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_f: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pressure_inhg: Option<f64>,
}

/// Aggregated single-metric history point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricHistoryPoint {
    pub ts: DateTime<Utc>,
    pub value: f64,
}

/// Repository instance
#[derive(Clone)]
pub struct Repository {
    pool: PgPool,
}

impl Repository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// First-boot table creation; idempotent
    pub async fn init_schema(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS devices (
                device_id TEXT PRIMARY KEY,
                status TEXT,
                last_seen TIMESTAMPTZ,
                version TEXT,
                last_error_code TEXT,
                last_boot TIMESTAMPTZ,
                ip TEXT,
                rssi INTEGER
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS sensor_readings (
                device_id TEXT NOT NULL,
                metric TEXT NOT NULL,
                value DOUBLE PRECISION NOT NULL,
                ts TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS ix_sensor_readings_device_metric_ts
                ON sensor_readings (device_id, metric, ts)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS incidents (
                id BIGSERIAL PRIMARY KEY,
                device_id TEXT NOT NULL,
                code TEXT NOT NULL,
                message TEXT,
                first_seen TIMESTAMPTZ NOT NULL,
                last_seen TIMESTAMPTZ NOT NULL,
                resolved BOOLEAN NOT NULL DEFAULT FALSE,
                resolution_note TEXT
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS ux_incidents_open
                ON incidents (device_id, code) WHERE NOT resolved
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS device_boots (
                device_id TEXT NOT NULL,
                ts TIMESTAMPTZ NOT NULL,
                reason TEXT,
                success BOOLEAN NOT NULL DEFAULT TRUE
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS ix_device_boots_device_ts
                ON device_boots (device_id, ts)
            "#,
        ];
        for sql in statements {
            sqlx::query(sql).execute(&self.pool).await?;
        }
        tracing::info!("Schema initialized");
        Ok(())
    }

    /// Create or update a device registry row; last-writer-wins on `last_seen`
    pub async fn upsert_device(&self, device: &DeviceState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO devices (device_id, status, last_seen, version, last_error_code, last_boot, ip, rssi)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (device_id) DO UPDATE SET
                status = EXCLUDED.status,
                last_seen = EXCLUDED.last_seen,
                version = COALESCE(EXCLUDED.version, devices.version),
                last_error_code = EXCLUDED.last_error_code,
                last_boot = COALESCE(EXCLUDED.last_boot, devices.last_boot),
                ip = COALESCE(EXCLUDED.ip, devices.ip),
                rssi = COALESCE(EXCLUDED.rssi, devices.rssi)
            "#,
        )
        .bind(&device.device_id)
        .bind(device.status.as_str())
        .bind(device.last_seen)
        .bind(&device.version)
        .bind(&device.last_error_code)
        .bind(device.last_boot)
        .bind(&device.ip_address)
        .bind(device.rssi)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Append a batch of readings in one statement
    pub async fn append_readings(&self, rows: &[ReadingRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut builder = sqlx::QueryBuilder::<sqlx::Postgres>::new(
            "INSERT INTO sensor_readings (device_id, metric, value, ts) ",
        );
        builder.push_values(rows, |mut b, row| {
            b.push_bind(&row.device_id)
                .push_bind(&row.metric)
                .push_bind(row.value)
                .push_bind(row.ts);
        });
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    pub async fn record_boot(
        &self,
        device_id: &str,
        ts: DateTime<Utc>,
        reason: &str,
        success: bool,
    ) -> Result<()> {
        sqlx::query("INSERT INTO device_boots (device_id, ts, reason, success) VALUES ($1, $2, $3, $4)")
            .bind(device_id)
            .bind(ts)
            .bind(reason)
            .bind(success)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Open an incident, or refresh `last_seen`/`message` on the open one.
    /// The partial unique index guarantees at most one open incident per
    /// `(device_id, code)`.
    pub async fn upsert_incident(
        &self,
        device_id: &str,
        code: &str,
        message: &str,
        ts: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO incidents (device_id, code, message, first_seen, last_seen)
            VALUES ($1, $2, $3, $4, $4)
            ON CONFLICT (device_id, code) WHERE NOT resolved DO UPDATE SET
                last_seen = EXCLUDED.last_seen,
                message = EXCLUDED.message
            "#,
        )
        .bind(device_id)
        .bind(code)
        .bind(message)
        .bind(ts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Resolve one open incident; returns affected row count
    pub async fn resolve_incident(
        &self,
        device_id: &str,
        code: &str,
        note: Option<&str>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE incidents
            SET resolved = TRUE, resolution_note = $3
            WHERE device_id = $1 AND code = $2 AND NOT resolved
            "#,
        )
        .bind(device_id)
        .bind(code)
        .bind(note)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Resolve every open incident for a device
    pub async fn resolve_all_incidents(&self, device_id: &str, note: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE incidents
            SET resolved = TRUE, resolution_note = $2
            WHERE device_id = $1 AND NOT resolved
            "#,
        )
        .bind(device_id)
        .bind(note)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn open_incidents(&self) -> Result<Vec<Incident>> {
        let rows = sqlx::query(
            r#"
            SELECT id, device_id, code, message, first_seen, last_seen, resolved, resolution_note
            FROM incidents
            WHERE NOT resolved
            ORDER BY last_seen DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(|row| incident_from_row(&row)).collect()
    }

    /// Bucketed average for one metric; wall-clock-aligned via `date_trunc`
    pub async fn metric_history(
        &self,
        device_id: &str,
        metric: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        bucket: Bucket,
    ) -> Result<Vec<MetricHistoryPoint>> {
        let rows = sqlx::query(
            r#"
            SELECT date_trunc($1, ts) AS bucket_ts, AVG(value) AS avg_value
            FROM sensor_readings
            WHERE device_id = $2 AND metric = $3 AND ts >= $4 AND ts < $5
            GROUP BY bucket_ts
            ORDER BY bucket_ts ASC
            "#,
        )
        .bind(bucket.as_str())
        .bind(device_id)
        .bind(metric)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        let mut points = Vec::with_capacity(rows.len());
        for row in rows {
            points.push(MetricHistoryPoint {
                ts: row.try_get("bucket_ts")?,
                value: row.try_get("avg_value")?,
            });
        }
        Ok(points)
    }

    /// Temperature and pressure aligned on shared buckets in one query
    pub async fn weather_history(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        bucket: Bucket,
    ) -> Result<Vec<WeatherHistoryPoint>> {
        let rows = sqlx::query(
            r#"
            SELECT
                date_trunc($1, ts) AS bucket_ts,
                AVG(value) FILTER (WHERE metric = 'weather_temperature_f') AS temperature_f,
                AVG(value) FILTER (WHERE metric = 'weather_pressure_inhg') AS pressure_inhg
            FROM sensor_readings
            WHERE metric IN ('weather_temperature_f', 'weather_pressure_inhg')
              AND ts >= $2 AND ts < $3
            GROUP BY bucket_ts
            ORDER BY bucket_ts ASC
            "#,
        )
        .bind(bucket.as_str())
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        let mut points = Vec::with_capacity(rows.len());
        for row in rows {
            points.push(WeatherHistoryPoint {
                ts: row.try_get("bucket_ts")?,
                temperature_f: row.try_get("temperature_f")?,
                pressure_inhg: row.try_get("pressure_inhg")?,
            });
        }
        Ok(points)
    }

    /// Delete readings older than the retention window, when one is set
    pub async fn prune_readings(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sensor_readings WHERE ts < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn incident_from_row(row: &sqlx::postgres::PgRow) -> Result<Incident> {
    Ok(Incident {
        id: row.try_get("id")?,
        device_id: row.try_get("device_id")?,
        code: row.try_get("code")?,
        message: row.try_get("message")?,
        first_seen: row.try_get("first_seen")?,
        last_seen: row.try_get("last_seen")?,
        resolved: row.try_get("resolved")?,
        resolution_note: row.try_get("resolution_note")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_parse_round_trips() {
        for bucket in [Bucket::Minute, Bucket::Hour, Bucket::Day] {
            assert_eq!(Bucket::parse(bucket.as_str()), Some(bucket));
        }
        assert_eq!(Bucket::parse("fortnight"), None);
    }
}
