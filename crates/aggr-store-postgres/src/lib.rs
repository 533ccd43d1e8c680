//! PostgreSQL implementation of the persistence contract (`spec.md` §6).
//!
//! Follows `extraction::stores::postgres::PostgresStore`'s shape: one
//! pool, migrate-on-connect, every query mapped through a single
//! storage error variant. The trait method boundary is the transaction
//! boundary — `persist_assignments` and `execute_merge` each open and
//! commit exactly one `sqlx` transaction.

mod memory;
mod rows;

pub use memory::InMemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Postgres;
use tracing::{info, instrument, warn};

use aggr_domain::{
    AcceptedMerge, AggregationWriter, AssignmentDecision, DomainError, Event, EventHistoryRelation,
    EventReader, EventStatus, HistoryReader, HistoryRelationType, MergeWriter, NewsEventRelation,
    NewsItem, NewsReader, PersistOutcome, ProcessingLog, ProcessingLogWriter, RelationReader,
    RelationType, Result, TimeWindow,
};

use rows::{EventHistoryRow, EventRow, NewsItemRow, RelationRow};

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| DomainError::Storage(Box::new(e)))?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: PgPool) -> Result<Self> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS hot_aggr_events (
                id BIGSERIAL PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                event_type TEXT NOT NULL,
                sentiment TEXT NOT NULL,
                entities TEXT NOT NULL DEFAULT '{}',
                regions TEXT NOT NULL DEFAULT '',
                keywords TEXT NOT NULL DEFAULT '',
                confidence_score REAL NOT NULL,
                news_count BIGINT NOT NULL DEFAULT 0,
                first_news_time TIMESTAMPTZ NOT NULL,
                last_news_time TIMESTAMPTZ NOT NULL,
                status SMALLINT NOT NULL DEFAULT 1,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| DomainError::Storage(Box::new(e)))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_hot_aggr_events_status_created ON hot_aggr_events(status, created_at DESC)")
            .execute(&self.pool)
            .await
            .ok();

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS hot_aggr_news_event_relations (
                id BIGSERIAL PRIMARY KEY,
                news_id BIGINT NOT NULL,
                event_id BIGINT NOT NULL REFERENCES hot_aggr_events(id),
                relation_type TEXT NOT NULL,
                confidence_score REAL NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE(news_id, event_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| DomainError::Storage(Box::new(e)))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_hot_aggr_relations_news_id ON hot_aggr_news_event_relations(news_id)")
            .execute(&self.pool)
            .await
            .ok();
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_hot_aggr_relations_event_id ON hot_aggr_news_event_relations(event_id)")
            .execute(&self.pool)
            .await
            .ok();

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS hot_aggr_event_history_relations (
                id BIGSERIAL PRIMARY KEY,
                parent_event_id BIGINT NOT NULL REFERENCES hot_aggr_events(id),
                child_event_id BIGINT NOT NULL REFERENCES hot_aggr_events(id),
                relation_type TEXT NOT NULL,
                confidence_score REAL NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| DomainError::Storage(Box::new(e)))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS hot_aggr_processing_logs (
                id BIGSERIAL PRIMARY KEY,
                task_type TEXT NOT NULL,
                task_id TEXT NOT NULL,
                start_time TIMESTAMPTZ NOT NULL,
                end_time TIMESTAMPTZ NOT NULL,
                status TEXT NOT NULL,
                total BIGINT NOT NULL,
                success BIGINT NOT NULL,
                failed BIGINT NOT NULL,
                error_message TEXT,
                config_snapshot JSONB NOT NULL DEFAULT '{}'
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| DomainError::Storage(Box::new(e)))?;

        Ok(())
    }
}

#[async_trait]
impl NewsReader for PostgresStore {
    #[instrument(skip(self, source_types, excluded_types))]
    async fn unprocessed_news(
        &self,
        window: Option<TimeWindow>,
        source_types: &[String],
        excluded_types: &[String],
    ) -> Result<Vec<NewsItem>> {
        let (start, end) = match window {
            Some(w) => (Some(w.start), Some(w.end)),
            None => (None, None),
        };

        let rows = sqlx::query_as::<_, NewsItemRow>(
            r#"
            SELECT n.id, n.source_type, n.title, n.body, n.city_name, n.first_seen_at, n.url
            FROM hot_news_base n
            WHERE NOT EXISTS (
                SELECT 1 FROM hot_aggr_news_event_relations r WHERE r.news_id = n.id
            )
            AND ($1::timestamptz IS NULL OR n.first_seen_at >= $1)
            AND ($2::timestamptz IS NULL OR n.first_seen_at <= $2)
            AND (array_length($3::text[], 1) IS NULL OR n.source_type = ANY($3))
            AND NOT (n.source_type = ANY($4))
            ORDER BY n.first_seen_at DESC
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(source_types)
        .bind(excluded_types)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DomainError::Storage(Box::new(e)))?;

        Ok(rows.into_iter().map(NewsItemRow::into_domain).collect())
    }

    async fn news_by_ids(&self, ids: &[i64]) -> Result<Vec<NewsItem>> {
        let rows = sqlx::query_as::<_, NewsItemRow>(
            "SELECT id, source_type, title, body, city_name, first_seen_at, url FROM hot_news_base WHERE id = ANY($1)",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DomainError::Storage(Box::new(e)))?;

        Ok(rows.into_iter().map(NewsItemRow::into_domain).collect())
    }
}

#[async_trait]
impl EventReader for PostgresStore {
    async fn recent_active_events(&self, n: usize) -> Result<Vec<Event>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT id, title, description, event_type, sentiment, entities, regions, keywords,
                   confidence_score, news_count, first_news_time, last_news_time, status,
                   created_at, updated_at
            FROM hot_aggr_events
            WHERE status = 1
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(n as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DomainError::Storage(Box::new(e)))?;

        rows.into_iter().map(EventRow::into_domain).collect()
    }

    async fn events_for_news_in_window(
        &self,
        window: TimeWindow,
        source_types: &[String],
    ) -> Result<Vec<Event>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT DISTINCT e.id, e.title, e.description, e.event_type, e.sentiment, e.entities,
                   e.regions, e.keywords, e.confidence_score, e.news_count, e.first_news_time,
                   e.last_news_time, e.status, e.created_at, e.updated_at
            FROM hot_aggr_events e
            JOIN hot_aggr_news_event_relations r ON r.event_id = e.id
            JOIN hot_news_base n ON n.id = r.news_id
            WHERE e.status = 1
              AND n.first_seen_at >= $1 AND n.first_seen_at <= $2
              AND (array_length($3::text[], 1) IS NULL OR n.source_type = ANY($3))
            "#,
        )
        .bind(window.start)
        .bind(window.end)
        .bind(source_types)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DomainError::Storage(Box::new(e)))?;

        rows.into_iter().map(EventRow::into_domain).collect()
    }

    async fn events_by_ids(&self, ids: &[i64]) -> Result<Vec<Event>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT id, title, description, event_type, sentiment, entities, regions, keywords,
                   confidence_score, news_count, first_news_time, last_news_time, status,
                   created_at, updated_at
            FROM hot_aggr_events WHERE id = ANY($1)
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DomainError::Storage(Box::new(e)))?;

        rows.into_iter().map(EventRow::into_domain).collect()
    }
}

#[async_trait]
impl AggregationWriter for PostgresStore {
    #[instrument(skip(self, decisions), fields(decision_count = decisions.len()))]
    async fn persist_assignments(&self, decisions: &[AssignmentDecision]) -> Result<PersistOutcome> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DomainError::Storage(Box::new(e)))?;

        let mut outcome = PersistOutcome::default();

        for decision in decisions {
            match decision {
                AssignmentDecision::ToExisting {
                    event_id,
                    news_ids,
                    confidence,
                    merged_regions,
                } => {
                    sqlx::query(
                        "UPDATE hot_aggr_events SET regions = $2, updated_at = NOW() WHERE id = $1",
                    )
                    .bind(event_id)
                    .bind(merged_regions)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| DomainError::Storage(Box::new(e)))?;

                    for news_id in news_ids {
                        insert_relation(
                            &mut tx,
                            *news_id,
                            *event_id,
                            RelationType::AssignedToExisting,
                            *confidence,
                        )
                        .await?;
                        outcome.persisted_news_ids.push(*news_id);
                    }

                    recompute_news_count(&mut tx, *event_id).await?;
                }
                AssignmentDecision::ToNew {
                    new_event,
                    news_ids,
                    confidence,
                } => {
                    let row: (i64,) = sqlx::query_as(
                        r#"
                        INSERT INTO hot_aggr_events
                            (title, description, event_type, sentiment, entities, regions, keywords,
                             confidence_score, news_count, first_news_time, last_news_time, status,
                             created_at, updated_at)
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                        RETURNING id
                        "#,
                    )
                    .bind(&new_event.title)
                    .bind(&new_event.description)
                    .bind(&new_event.event_type)
                    .bind(rows::sentiment_to_str(new_event.sentiment))
                    .bind(&new_event.entities)
                    .bind(&new_event.regions)
                    .bind(&new_event.keywords)
                    .bind(new_event.confidence)
                    .bind(0i64)
                    .bind(new_event.first_news_time)
                    .bind(new_event.last_news_time)
                    .bind(rows::status_to_i16(EventStatus::Active))
                    .bind(new_event.created_at)
                    .bind(new_event.updated_at)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| DomainError::Storage(Box::new(e)))?;

                    let event_id = row.0;
                    outcome.created_event_ids.push(event_id);

                    for news_id in news_ids {
                        insert_relation(
                            &mut tx,
                            *news_id,
                            event_id,
                            RelationType::AssignedToNew,
                            *confidence,
                        )
                        .await?;
                        outcome.persisted_news_ids.push(*news_id);
                    }

                    recompute_news_count(&mut tx, event_id).await?;
                }
            }
        }

        tx.commit()
            .await
            .map_err(|e| DomainError::TransactionFailed(e.to_string()))?;

        Ok(outcome)
    }
}

#[async_trait]
impl MergeWriter for PostgresStore {
    #[instrument(skip(self, merge), fields(primary = merge.primary_event_id, children = merge.child_event_ids.len()))]
    async fn execute_merge(&self, merge: &AcceptedMerge, now: DateTime<Utc>) -> Result<Event> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DomainError::Storage(Box::new(e)))?;

        let primary_row: Option<EventRow> = sqlx::query_as(
            r#"
            SELECT id, title, description, event_type, sentiment, entities, regions, keywords,
                   confidence_score, news_count, first_news_time, last_news_time, status,
                   created_at, updated_at
            FROM hot_aggr_events WHERE id = $1 FOR UPDATE
            "#,
        )
        .bind(merge.primary_event_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| DomainError::Storage(Box::new(e)))?;

        let primary_row = primary_row.ok_or(DomainError::EventNotFound(merge.primary_event_id))?;
        let mut primary = primary_row.into_domain()?;
        if primary.status != EventStatus::Active {
            return Err(DomainError::EventNotActive {
                event_id: primary.id,
                status: primary.status,
            });
        }

        let mut children = Vec::with_capacity(merge.child_event_ids.len());
        for &child_id in &merge.child_event_ids {
            let row: Option<EventRow> = sqlx::query_as(
                r#"
                SELECT id, title, description, event_type, sentiment, entities, regions, keywords,
                       confidence_score, news_count, first_news_time, last_news_time, status,
                       created_at, updated_at
                FROM hot_aggr_events WHERE id = $1 FOR UPDATE
                "#,
            )
            .bind(child_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| DomainError::Storage(Box::new(e)))?;

            let row = row.ok_or(DomainError::EventNotFound(child_id))?;
            let child = row.into_domain()?;
            if child.status != EventStatus::Active {
                return Err(DomainError::EventNotActive {
                    event_id: child.id,
                    status: child.status,
                });
            }
            children.push(child);
        }

        let mut region_additions: Vec<&str> = children.iter().map(|c| c.regions.as_str()).collect();
        if let Some(llm_regions) = &merge.merged_regions {
            region_additions.extend(llm_regions.iter().map(|s| s.as_str()));
        }
        let merged_regions = aggr_regions::merge(primary.regions.as_str(), &region_additions);

        let merged_keywords = merge.merged_keywords.clone().unwrap_or_else(|| {
            let mut kws: Vec<String> = primary
                .keywords
                .split(',')
                .chain(children.iter().flat_map(|c| c.keywords.split(',')))
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            kws.sort();
            kws.dedup();
            kws
        });

        let merged_entities = std::iter::once(&primary.entities)
            .chain(children.iter().map(|c| &c.entities))
            .max_by_key(|e| e.len())
            .cloned()
            .unwrap_or_default();

        let first_news_time = std::iter::once(primary.first_news_time)
            .chain(children.iter().map(|c| c.first_news_time))
            .min()
            .unwrap();
        let last_news_time = std::iter::once(primary.last_news_time)
            .chain(children.iter().map(|c| c.last_news_time))
            .max()
            .unwrap();
        let news_count =
            primary.news_count + children.iter().map(|c| c.news_count).sum::<i64>();

        primary.regions = merged_regions;
        primary.keywords = merged_keywords.join(",");
        primary.entities = merged_entities;
        primary.first_news_time = first_news_time;
        primary.last_news_time = last_news_time;
        primary.news_count = news_count;
        primary.title = merge.merged_title.clone().unwrap_or(primary.title);
        primary.description = merge
            .merged_description
            .clone()
            .unwrap_or(primary.description);
        primary.updated_at = now;

        sqlx::query(
            r#"
            UPDATE hot_aggr_events
            SET title = $2, description = $3, regions = $4, keywords = $5, entities = $6,
                first_news_time = $7, last_news_time = $8, news_count = $9, updated_at = $10
            WHERE id = $1
            "#,
        )
        .bind(primary.id)
        .bind(&primary.title)
        .bind(&primary.description)
        .bind(&primary.regions)
        .bind(&primary.keywords)
        .bind(&primary.entities)
        .bind(primary.first_news_time)
        .bind(primary.last_news_time)
        .bind(primary.news_count)
        .bind(primary.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| DomainError::Storage(Box::new(e)))?;

        for child in &children {
            sqlx::query("UPDATE hot_aggr_events SET status = 2, updated_at = $2 WHERE id = $1")
                .bind(child.id)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(|e| DomainError::Storage(Box::new(e)))?;

            let child_relations: Vec<RelationRow> = sqlx::query_as(
                "SELECT news_id, event_id, relation_type, confidence_score, created_at FROM hot_aggr_news_event_relations WHERE event_id = $1",
            )
            .bind(child.id)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| DomainError::Storage(Box::new(e)))?;

            for relation in child_relations {
                let exists: Option<(i64,)> = sqlx::query_as(
                    "SELECT id FROM hot_aggr_news_event_relations WHERE news_id = $1 AND event_id = $2",
                )
                .bind(relation.news_id)
                .bind(primary.id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| DomainError::Storage(Box::new(e)))?;

                if exists.is_some() {
                    sqlx::query(
                        "DELETE FROM hot_aggr_news_event_relations WHERE news_id = $1 AND event_id = $2",
                    )
                    .bind(relation.news_id)
                    .bind(child.id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| DomainError::Storage(Box::new(e)))?;
                } else {
                    sqlx::query(
                        "UPDATE hot_aggr_news_event_relations SET event_id = $2 WHERE news_id = $1 AND event_id = $3",
                    )
                    .bind(relation.news_id)
                    .bind(primary.id)
                    .bind(child.id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| DomainError::Storage(Box::new(e)))?;
                }
            }

            sqlx::query(
                r#"
                INSERT INTO hot_aggr_event_history_relations
                    (parent_event_id, child_event_id, relation_type, confidence_score, description, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(primary.id)
            .bind(child.id)
            .bind(rows::history_relation_to_str(HistoryRelationType::BatchMerge))
            .bind(merge.confidence)
            .bind(&merge.reason)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| DomainError::Storage(Box::new(e)))?;
        }

        tx.commit()
            .await
            .map_err(|e| DomainError::TransactionFailed(e.to_string()))?;

        Ok(primary)
    }
}

#[async_trait]
impl ProcessingLogWriter for PostgresStore {
    async fn write_log(&self, log: &ProcessingLog) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO hot_aggr_processing_logs
                (task_type, task_id, start_time, end_time, status, total, success, failed, error_message, config_snapshot)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(rows::task_type_to_str(log.task_type))
        .bind(&log.task_id)
        .bind(log.start_time)
        .bind(log.end_time)
        .bind(rows::run_status_to_str(log.status))
        .bind(log.total)
        .bind(log.success)
        .bind(log.failed)
        .bind(&log.error_message)
        .bind(&log.config_snapshot)
        .execute(&self.pool)
        .await
        .map_err(|e| DomainError::Storage(Box::new(e)))?;

        info!(task_type = ?log.task_type, task_id = %log.task_id, status = ?log.status, "processing log written");
        Ok(())
    }
}

#[async_trait]
impl HistoryReader for PostgresStore {
    async fn history_for_event(&self, event_id: i64) -> Result<Vec<EventHistoryRelation>> {
        let rows = sqlx::query_as::<_, EventHistoryRow>(
            r#"
            SELECT parent_event_id, child_event_id, relation_type, confidence_score, description, created_at
            FROM hot_aggr_event_history_relations
            WHERE parent_event_id = $1 OR child_event_id = $1
            "#,
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DomainError::Storage(Box::new(e)))?;

        rows.into_iter().map(EventHistoryRow::into_domain).collect()
    }
}

#[async_trait]
impl RelationReader for PostgresStore {
    async fn relations_for_event(&self, event_id: i64) -> Result<Vec<NewsEventRelation>> {
        let rows = sqlx::query_as::<_, RelationRow>(
            "SELECT news_id, event_id, relation_type, confidence_score, created_at FROM hot_aggr_news_event_relations WHERE event_id = $1",
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DomainError::Storage(Box::new(e)))?;

        rows.into_iter().map(RelationRow::into_domain).collect()
    }

    async fn relations_for_news(&self, news_id: i64) -> Result<Vec<NewsEventRelation>> {
        let rows = sqlx::query_as::<_, RelationRow>(
            "SELECT news_id, event_id, relation_type, confidence_score, created_at FROM hot_aggr_news_event_relations WHERE news_id = $1",
        )
        .bind(news_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DomainError::Storage(Box::new(e)))?;

        rows.into_iter().map(RelationRow::into_domain).collect()
    }
}

async fn insert_relation(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    news_id: i64,
    event_id: i64,
    relation_type: RelationType,
    confidence: f32,
) -> Result<()> {
    let result = sqlx::query(
        r#"
        INSERT INTO hot_aggr_news_event_relations (news_id, event_id, relation_type, confidence_score)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (news_id, event_id) DO NOTHING
        "#,
    )
    .bind(news_id)
    .bind(event_id)
    .bind(rows::relation_type_to_str(relation_type))
    .bind(confidence)
    .execute(&mut **tx)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(e) => {
            warn!(news_id, event_id, error = %e, "relation insert failed");
            Err(DomainError::Storage(Box::new(e)))
        }
    }
}

async fn recompute_news_count(tx: &mut sqlx::Transaction<'_, Postgres>, event_id: i64) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE hot_aggr_events
        SET news_count = (SELECT COUNT(*) FROM hot_aggr_news_event_relations WHERE event_id = $1)
        WHERE id = $1
        "#,
    )
    .bind(event_id)
    .execute(&mut **tx)
    .await
    .map_err(|e| DomainError::Storage(Box::new(e)))?;
    Ok(())
}
