use crate::errors::{Error, Result};
use crate::model::SensorSample;
use crate::store::{AggregationFn, Bucket, Granularity, SampleStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

/// PostgreSQL-backed sample store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        Ok(Self::new(make_pool(database_url).await?))
    }
}

#[async_trait]
impl SampleStore for PgStore {
    async fn store_batch(&self, samples: &[SensorSample]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }

        insert_batch(&self.pool, samples).await.map_err(|e| {
            if let Error::Database(db_err) = &e {
                if is_transient_error(db_err) {
                    warn!("Transient database failure storing {} samples: {}", samples.len(), db_err);
                } else {
                    error!("Database failure storing {} samples: {}", samples.len(), db_err);
                }
            }
            Error::Persistence(e.to_string())
        })
    }

    async fn query(
        &self,
        device_id: &str,
        sensor_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SensorSample>> {
        let query = r#"
            SELECT id, device_id, sensor_id, value, ts AS timestamp, quality, raw_data
            FROM sensor_samples
            WHERE ($1 = '' OR device_id = $1)
              AND ($2 = '' OR sensor_id = $2)
              AND ts >= $3 AND ts <= $4
            ORDER BY ts ASC
            LIMIT $5
            "#;

        let limit = (limit > 0).then_some(limit as i64);
        let rows = sqlx::query_as::<_, SensorSample>(query)
            .bind(device_id)
            .bind(sensor_id)
            .bind(start)
            .bind(end)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        debug!("Query returned {} samples for {}/{}", rows.len(), device_id, sensor_id);
        Ok(rows)
    }

    async fn query_aggregated(
        &self,
        device_id: &str,
        sensor_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        granularity: Granularity,
        aggregation: AggregationFn,
    ) -> Result<Vec<Bucket>> {
        let query = format!(
            r#"
            SELECT date_trunc($5, ts) AS start, {} AS value, COUNT(*) AS count
            FROM sensor_samples
            WHERE ($1 = '' OR device_id = $1)
              AND ($2 = '' OR sensor_id = $2)
              AND ts >= $3 AND ts <= $4
            GROUP BY 1
            ORDER BY 1
            "#,
            aggregation.as_sql()
        );

        let buckets = sqlx::query_as::<_, Bucket>(&query)
            .bind(device_id)
            .bind(sensor_id)
            .bind(start)
            .bind(end)
            .bind(granularity.as_str())
            .fetch_all(&self.pool)
            .await?;

        Ok(buckets)
    }
}

async fn insert_batch(pool: &PgPool, batch: &[SensorSample]) -> Result<()> {
    let ids: Vec<&str> = batch.iter().map(|s| s.id.as_str()).collect();
    let device_ids: Vec<&str> = batch.iter().map(|s| s.device_id.as_str()).collect();
    let sensor_ids: Vec<&str> = batch.iter().map(|s| s.sensor_id.as_str()).collect();
    let values: Vec<f64> = batch.iter().map(|s| s.value).collect();
    let timestamps: Vec<DateTime<Utc>> = batch.iter().map(|s| s.timestamp).collect();
    let qualities: Vec<i32> = batch.iter().map(|s| s.quality).collect();
    let raw: Vec<&str> = batch.iter().map(|s| s.raw_data.as_str()).collect();

    let query = r#"
        INSERT INTO sensor_samples (id, device_id, sensor_id, value, ts, quality, raw_data)
        SELECT * FROM UNNEST($1::text[], $2::text[], $3::text[], $4::float8[], $5::timestamptz[], $6::int4[], $7::text[])
        ON CONFLICT (id) DO NOTHING
        "#;

    sqlx::query(query)
        .bind(&ids)
        .bind(&device_ids)
        .bind(&sensor_ids)
        .bind(&values)
        .bind(&timestamps)
        .bind(&qualities)
        .bind(&raw)
        .execute(pool)
        .await?;

    Ok(())
}

fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            db_err.code().is_some_and(|code| {
                code == "08000" || // connection_exception
                code == "08003" || // connection_does_not_exist
                code == "08006" || // connection_failure
                code == "57P03" || // cannot_connect_now
                code == "53300" // too_many_connections
            })
        }
        _ => false,
    }
}
