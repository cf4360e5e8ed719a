use crate::config::DatabaseConfig;
use crate::error::{Result, StoreError};
use crate::models::{
    Detection, Enrichment, EnrichmentOutcome, Message, ProductMention, WarehouseSummary,
};
use crate::store::{validate_enrichment, validate_limit, WarehouseStore};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// PostgreSQL-backed warehouse store
///
/// Every operation checks a connection out of the pool for its own duration
/// only. The pooled handle is returned when it is dropped, which also covers
/// timeouts and callers that abandon the future.
pub struct PgWarehouse {
    pool: PgPool,
    statement_timeout: Duration,
    retry_delay: Duration,
}

impl PgWarehouse {
    /// Create a new store with a connection pool
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect_with(config.connect_options()?)
            .await?;

        info!(
            host = %config.host,
            database = %config.name,
            max_connections = config.max_connections,
            "Connected to PostgreSQL warehouse"
        );

        Ok(Self::from_pool(pool, config))
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool, config: &DatabaseConfig) -> Self {
        Self {
            pool,
            statement_timeout: config.statement_timeout(),
            retry_delay: config.retry_delay(),
        }
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running warehouse migrations");

        sqlx::migrate!("./migrations").run(&self.pool).await?;

        info!("Warehouse migrations completed");
        Ok(())
    }

    /// Record one resolved product fact.
    ///
    /// The product mapping itself happens upstream; this is the write path it
    /// (and tests) use to land facts in `fct_messages_products`.
    pub async fn record_product_mention(&self, message_id: i64, product_name: &str) -> Result<()> {
        self.run("record_product_mention", move || async move {
            let mut conn = self.pool.acquire().await?;
            sqlx::query(
                r#"
                INSERT INTO fct_messages_products (message_id, product_name)
                VALUES ($1, $2)
                "#,
            )
            .bind(message_id)
            .bind(product_name)
            .execute(&mut *conn)
            .await?;
            Ok::<_, StoreError>(())
        })
        .await
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Bound a single attempt by the statement timeout
    async fn bounded<T>(&self, attempt: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.statement_timeout, attempt)
            .await
            .map_err(|_| StoreError::Timeout(self.statement_timeout))?
    }

    /// Run an operation with at most one retry on a transient connectivity error
    async fn run<T, F, Fut>(&self, operation: &'static str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let started = Instant::now();

        let result = match self.bounded(attempt()).await {
            Err(err) if err.is_transient() => {
                warn!(operation, error = %err, "Transient warehouse error, retrying once");
                metrics::counter!("store.retries", "operation" => operation).increment(1);
                tokio::time::sleep(self.retry_delay).await;
                self.bounded(attempt()).await
            }
            result => result,
        };

        metrics::histogram!("store.operation.duration_seconds", "operation" => operation)
            .record(started.elapsed().as_secs_f64());

        if let Err(err) = &result {
            metrics::counter!("store.errors", "operation" => operation).increment(1);
            debug!(operation, error = %err, "Warehouse operation failed");
        }

        result
    }
}

#[async_trait]
impl WarehouseStore for PgWarehouse {
    #[instrument(skip(self, message), fields(message_id = message.message_id))]
    async fn upsert_message_if_absent(&self, message: &Message) -> Result<bool> {
        self.run("upsert_message", move || async move {
            let mut conn = self.pool.acquire().await?;
            let result = sqlx::query(
                r#"
                INSERT INTO raw.telegram_messages (
                    message_id, channel_name, message_date,
                    message_text, views, forwards,
                    has_media, image_path
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (message_id) DO NOTHING
                "#,
            )
            .bind(message.message_id)
            .bind(&message.channel_name)
            .bind(message.message_date)
            .bind(&message.message_text)
            .bind(message.views)
            .bind(message.forwards)
            .bind(message.has_media)
            .bind(&message.image_path)
            .execute(&mut *conn)
            .await?;

            Ok::<_, StoreError>(result.rows_affected() == 1)
        })
        .await
    }

    async fn get_message(&self, message_id: i64) -> Result<Option<Message>> {
        self.run("get_message", move || async move {
            let mut conn = self.pool.acquire().await?;
            let message = sqlx::query_as::<_, Message>(
                r#"
                SELECT message_id, channel_name, message_date, message_text,
                       views, forwards, has_media, image_path
                FROM raw.telegram_messages
                WHERE message_id = $1
                "#,
            )
            .bind(message_id)
            .fetch_optional(&mut *conn)
            .await?;
            Ok::<_, StoreError>(message)
        })
        .await
    }

    async fn has_detections(&self, message_id: i64) -> Result<bool> {
        self.run("has_detections", move || async move {
            let mut conn = self.pool.acquire().await?;
            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS (SELECT 1 FROM raw.image_detections WHERE message_id = $1)",
            )
            .bind(message_id)
            .fetch_one(&mut *conn)
            .await?;
            Ok::<_, StoreError>(exists)
        })
        .await
    }

    #[instrument(skip(self, detection), fields(message_id = detection.message_id))]
    async fn insert_detection(&self, detection: &Detection) -> Result<()> {
        detection.validate().map_err(|reason| StoreError::InvalidRow {
            entity: "detection",
            reason,
        })?;

        self.run("insert_detection", move || async move {
            let mut tx = self.pool.begin().await?;

            let has_media: Option<bool> = sqlx::query_scalar(
                "SELECT has_media FROM raw.telegram_messages WHERE message_id = $1",
            )
            .bind(detection.message_id)
            .fetch_optional(&mut *tx)
            .await?;

            if has_media == Some(false) {
                return Err(StoreError::InvalidRow {
                    entity: "detection",
                    reason: format!("message {} has no media", detection.message_id),
                });
            }

            insert_detection_row(&mut tx, detection).await?;
            tx.commit().await?;
            Ok::<_, StoreError>(())
        })
        .await
    }

    async fn is_enriched(&self, message_id: i64) -> Result<bool> {
        self.run("is_enriched", move || async move {
            let mut conn = self.pool.acquire().await?;
            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS (SELECT 1 FROM raw.enriched_images WHERE message_id = $1)",
            )
            .bind(message_id)
            .fetch_one(&mut *conn)
            .await?;
            Ok::<_, StoreError>(exists)
        })
        .await
    }

    #[instrument(
        skip(self, enrichment),
        fields(message_id = enrichment.message_id, detections = enrichment.detections.len())
    )]
    async fn record_enrichment(&self, enrichment: &Enrichment) -> Result<EnrichmentOutcome> {
        validate_enrichment(enrichment)?;

        self.run("record_enrichment", move || async move {
            // Dropping the transaction on any early return rolls it back
            let mut tx = self.pool.begin().await?;

            let has_media: Option<bool> = sqlx::query_scalar(
                "SELECT has_media FROM raw.telegram_messages WHERE message_id = $1",
            )
            .bind(enrichment.message_id)
            .fetch_optional(&mut *tx)
            .await?;

            if has_media == Some(false) {
                return Ok(EnrichmentOutcome::MessageWithoutMedia);
            }

            let claimed = sqlx::query(
                r#"
                INSERT INTO raw.enriched_images (
                    message_id, channel_name, detection_count, model_version
                ) VALUES ($1, $2, $3, $4)
                ON CONFLICT (message_id) DO NOTHING
                "#,
            )
            .bind(enrichment.message_id)
            .bind(&enrichment.channel_name)
            .bind(enrichment.detections.len() as i32)
            .bind(&enrichment.model_version)
            .execute(&mut *tx)
            .await?
            .rows_affected()
                == 1;

            if !claimed {
                return Ok(EnrichmentOutcome::AlreadyEnriched);
            }

            for detection in &enrichment.detections {
                insert_detection_row(&mut tx, detection).await?;
            }

            tx.commit().await?;

            metrics::counter!("store.detections.inserted")
                .increment(enrichment.detections.len() as u64);

            Ok::<_, StoreError>(EnrichmentOutcome::Recorded(enrichment.detections.len()))
        })
        .await
    }

    #[instrument(skip(self))]
    async fn query_top_products(&self, limit: i64) -> Result<Vec<ProductMention>> {
        let limit = validate_limit(limit)?;

        self.run("query_top_products", move || async move {
            let mut conn = self.pool.acquire().await?;
            let rows = sqlx::query_as::<_, ProductMention>(
                r#"
                SELECT product_name, COUNT(*) AS mention_count
                FROM fct_messages_products
                GROUP BY product_name
                ORDER BY mention_count DESC, product_name COLLATE "C" ASC
                LIMIT $1
                "#,
            )
            .bind(limit)
            .fetch_all(&mut *conn)
            .await?;
            Ok::<_, StoreError>(rows)
        })
        .await
    }

    async fn list_detections(&self) -> Result<Vec<Detection>> {
        self.run("list_detections", move || async move {
            let mut conn = self.pool.acquire().await?;
            let rows = sqlx::query_as::<_, Detection>(
                r#"
                SELECT message_id, channel_name, detected_class, confidence_score
                FROM raw.image_detections
                ORDER BY message_id, id
                "#,
            )
            .fetch_all(&mut *conn)
            .await?;
            Ok::<_, StoreError>(rows)
        })
        .await
    }

    async fn summary(&self) -> Result<WarehouseSummary> {
        self.run("summary", move || async move {
            let mut conn = self.pool.acquire().await?;
            let summary = sqlx::query_as::<_, WarehouseSummary>(
                r#"
                SELECT
                    (SELECT COUNT(*) FROM raw.telegram_messages) AS total_messages,
                    (SELECT COUNT(*) FROM raw.telegram_messages WHERE has_media) AS messages_with_media,
                    (SELECT COUNT(*) FROM raw.image_detections) AS total_detections,
                    (SELECT COUNT(*) FROM raw.enriched_images) AS enriched_images,
                    (SELECT COUNT(DISTINCT channel_name) FROM raw.telegram_messages) AS channel_count
                "#,
            )
            .fetch_one(&mut *conn)
            .await?;
            Ok::<_, StoreError>(summary)
        })
        .await
    }

    async fn ping(&self) -> Result<()> {
        self.run("ping", move || async move {
            let mut conn = self.pool.acquire().await?;
            sqlx::query("SELECT 1").execute(&mut *conn).await?;
            Ok::<_, StoreError>(())
        })
        .await
    }
}

async fn insert_detection_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    detection: &Detection,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO raw.image_detections (
            message_id, channel_name, detected_class, confidence_score
        ) VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(detection.message_id)
    .bind(&detection.channel_name)
    .bind(&detection.detected_class)
    .bind(detection.confidence_score)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
