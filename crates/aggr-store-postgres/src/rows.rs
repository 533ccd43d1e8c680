//! `sqlx::FromRow` row shapes and their conversion into domain types.
//!
//! Enums are stored as short lowercase strings (relation/history/task/run
//! kinds) or as the `i16` discriminant (`EventStatus`, matching §3's
//! `status ∈ {active=1, merged=2, deleted=3}` literally).

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use aggr_domain::{
    DomainError, Event, EventHistoryRelation, EventStatus, HistoryRelationType, NewsEventRelation,
    NewsItem, RelationType, Result, RunStatus, Sentiment, TaskType,
};

#[derive(Debug, FromRow)]
pub struct NewsItemRow {
    id: i64,
    source_type: String,
    title: String,
    body: String,
    city_name: Option<String>,
    first_seen_at: DateTime<Utc>,
    url: Option<String>,
}

impl NewsItemRow {
    pub fn into_domain(self) -> NewsItem {
        NewsItem {
            id: self.id,
            source_type: self.source_type,
            title: self.title,
            body: self.body,
            city_name: self.city_name,
            first_seen_at: self.first_seen_at,
            url: self.url,
        }
    }
}

#[derive(Debug, FromRow)]
pub struct EventRow {
    id: i64,
    title: String,
    description: String,
    event_type: String,
    sentiment: String,
    entities: String,
    regions: String,
    keywords: String,
    confidence_score: f32,
    news_count: i64,
    first_news_time: DateTime<Utc>,
    last_news_time: DateTime<Utc>,
    status: i16,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl EventRow {
    pub fn into_domain(self) -> Result<Event> {
        Ok(Event {
            id: self.id,
            title: self.title,
            description: self.description,
            event_type: self.event_type,
            sentiment: str_to_sentiment(&self.sentiment)?,
            entities: self.entities,
            regions: self.regions,
            keywords: self.keywords,
            confidence: self.confidence_score,
            news_count: self.news_count,
            first_news_time: self.first_news_time,
            last_news_time: self.last_news_time,
            status: i16_to_status(self.status)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub struct RelationRow {
    pub news_id: i64,
    event_id: i64,
    relation_type: String,
    confidence_score: f32,
    created_at: DateTime<Utc>,
}

impl RelationRow {
    pub fn into_domain(self) -> Result<NewsEventRelation> {
        Ok(NewsEventRelation {
            news_id: self.news_id,
            event_id: self.event_id,
            relation_type: str_to_relation_type(&self.relation_type)?,
            confidence: self.confidence_score,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub struct EventHistoryRow {
    parent_event_id: i64,
    child_event_id: i64,
    relation_type: String,
    confidence_score: f32,
    description: String,
    created_at: DateTime<Utc>,
}

impl EventHistoryRow {
    pub fn into_domain(self) -> Result<EventHistoryRelation> {
        Ok(EventHistoryRelation {
            parent_event_id: self.parent_event_id,
            child_event_id: self.child_event_id,
            relation_type: str_to_history_relation(&self.relation_type)?,
            confidence: self.confidence_score,
            description: self.description,
            created_at: self.created_at,
        })
    }
}

pub fn sentiment_to_str(s: Sentiment) -> &'static str {
    match s {
        Sentiment::Positive => "positive",
        Sentiment::Neutral => "neutral",
        Sentiment::Negative => "negative",
    }
}

fn str_to_sentiment(s: &str) -> Result<Sentiment> {
    match s {
        "positive" => Ok(Sentiment::Positive),
        "neutral" => Ok(Sentiment::Neutral),
        "negative" => Ok(Sentiment::Negative),
        other => Err(DomainError::Storage(
            format!("unknown sentiment '{other}'").into(),
        )),
    }
}

pub fn status_to_i16(s: EventStatus) -> i16 {
    s as i16
}

fn i16_to_status(v: i16) -> Result<EventStatus> {
    match v {
        1 => Ok(EventStatus::Active),
        2 => Ok(EventStatus::Merged),
        3 => Ok(EventStatus::Deleted),
        other => Err(DomainError::Storage(
            format!("unknown event status {other}").into(),
        )),
    }
}

pub fn relation_type_to_str(r: RelationType) -> &'static str {
    match r {
        RelationType::AssignedToExisting => "assigned_to_existing",
        RelationType::AssignedToNew => "assigned_to_new",
        RelationType::BatchMerge => "batch_merge",
    }
}

fn str_to_relation_type(s: &str) -> Result<RelationType> {
    match s {
        "assigned_to_existing" => Ok(RelationType::AssignedToExisting),
        "assigned_to_new" => Ok(RelationType::AssignedToNew),
        "batch_merge" => Ok(RelationType::BatchMerge),
        other => Err(DomainError::Storage(
            format!("unknown relation type '{other}'").into(),
        )),
    }
}

pub fn history_relation_to_str(r: HistoryRelationType) -> &'static str {
    match r {
        HistoryRelationType::BatchMerge => "batch_merge",
        HistoryRelationType::Continuation => "continuation",
        HistoryRelationType::Evolution => "evolution",
    }
}

fn str_to_history_relation(s: &str) -> Result<HistoryRelationType> {
    match s {
        "batch_merge" => Ok(HistoryRelationType::BatchMerge),
        "continuation" => Ok(HistoryRelationType::Continuation),
        "evolution" => Ok(HistoryRelationType::Evolution),
        other => Err(DomainError::Storage(
            format!("unknown history relation type '{other}'").into(),
        )),
    }
}

pub fn task_type_to_str(t: TaskType) -> &'static str {
    match t {
        TaskType::Aggregation => "aggregation",
        TaskType::Merge => "merge",
        TaskType::Labeling => "labeling",
        TaskType::IngestionValidation => "ingestion_validation",
        TaskType::Cleanup => "cleanup",
    }
}

pub fn run_status_to_str(s: RunStatus) -> &'static str {
    match s {
        RunStatus::Success => "success",
        RunStatus::PartialSuccess => "partial_success",
        RunStatus::Failed => "failed",
    }
}
