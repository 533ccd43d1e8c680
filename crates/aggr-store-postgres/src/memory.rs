//! In-memory fake of the persistence contract, following
//! `extraction::stores::memory::MemoryStore`'s single-mutex-guarded-map
//! shape. Used by the engine crate's tests and anywhere a real Postgres
//! instance isn't worth spinning up.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use aggr_domain::{
    AcceptedMerge, AggregationWriter, AssignmentDecision, DomainError, Event, EventHistoryRelation,
    EventReader, EventStatus, HistoryReader, HistoryRelationType, MergeWriter, NewsEventRelation,
    NewsItem, NewsReader, PersistOutcome, ProcessingLog, ProcessingLogWriter, RelationReader,
    RelationType, Result, TimeWindow,
};

#[derive(Default)]
struct Inner {
    news: HashMap<i64, NewsItem>,
    events: HashMap<i64, Event>,
    relations: HashMap<(i64, i64), NewsEventRelation>,
    history: Vec<EventHistoryRelation>,
    logs: Vec<ProcessingLog>,
    next_event_id: i64,
}

/// In-memory store for tests. Not concurrency-optimised — a single
/// mutex stands in for Postgres's per-call transaction, which is
/// sufficient since every mutating trait method here already treats
/// the whole call as one unit of work.
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_event_id: 1,
                ..Default::default()
            }),
        }
    }

    pub fn seed_news(&self, items: impl IntoIterator<Item = NewsItem>) {
        let mut inner = self.inner.lock().unwrap();
        for item in items {
            inner.news.insert(item.id, item);
        }
    }

    pub fn seed_events(&self, events: impl IntoIterator<Item = Event>) {
        let mut inner = self.inner.lock().unwrap();
        for event in events {
            inner.next_event_id = inner.next_event_id.max(event.id + 1);
            inner.events.insert(event.id, event);
        }
    }

    pub fn event(&self, id: i64) -> Option<Event> {
        self.inner.lock().unwrap().events.get(&id).cloned()
    }

    pub fn relations(&self) -> Vec<NewsEventRelation> {
        self.inner.lock().unwrap().relations.values().cloned().collect()
    }

    pub fn history(&self) -> Vec<EventHistoryRelation> {
        self.inner.lock().unwrap().history.clone()
    }

    pub fn logs(&self) -> Vec<ProcessingLog> {
        self.inner.lock().unwrap().logs.clone()
    }
}

#[async_trait]
impl NewsReader for InMemoryStore {
    async fn unprocessed_news(
        &self,
        window: Option<TimeWindow>,
        source_types: &[String],
        excluded_types: &[String],
    ) -> Result<Vec<NewsItem>> {
        let inner = self.inner.lock().unwrap();
        let mut items: Vec<NewsItem> = inner
            .news
            .values()
            .filter(|n| !excluded_types.contains(&n.source_type))
            .filter(|n| source_types.is_empty() || source_types.contains(&n.source_type))
            .filter(|n| {
                window
                    .map(|w| n.first_seen_at >= w.start && n.first_seen_at <= w.end)
                    .unwrap_or(true)
            })
            .filter(|n| !inner.relations.keys().any(|(news_id, _)| *news_id == n.id))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.first_seen_at.cmp(&a.first_seen_at));
        Ok(items)
    }

    async fn news_by_ids(&self, ids: &[i64]) -> Result<Vec<NewsItem>> {
        let inner = self.inner.lock().unwrap();
        Ok(ids.iter().filter_map(|id| inner.news.get(id).cloned()).collect())
    }
}

#[async_trait]
impl EventReader for InMemoryStore {
    async fn recent_active_events(&self, n: usize) -> Result<Vec<Event>> {
        let inner = self.inner.lock().unwrap();
        let mut events: Vec<Event> = inner
            .events
            .values()
            .filter(|e| e.status == EventStatus::Active)
            .cloned()
            .collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        events.truncate(n);
        Ok(events)
    }

    async fn events_for_news_in_window(
        &self,
        window: TimeWindow,
        source_types: &[String],
    ) -> Result<Vec<Event>> {
        let inner = self.inner.lock().unwrap();
        let in_window_news: Vec<i64> = inner
            .news
            .values()
            .filter(|n| n.first_seen_at >= window.start && n.first_seen_at <= window.end)
            .filter(|n| source_types.is_empty() || source_types.contains(&n.source_type))
            .map(|n| n.id)
            .collect();

        let mut seen = std::collections::HashSet::new();
        let mut events = Vec::new();
        for ((news_id, event_id), _) in inner.relations.iter() {
            if !in_window_news.contains(news_id) || !seen.insert(*event_id) {
                continue;
            }
            if let Some(event) = inner.events.get(event_id) {
                if event.status == EventStatus::Active {
                    events.push(event.clone());
                }
            }
        }
        Ok(events)
    }

    async fn events_by_ids(&self, ids: &[i64]) -> Result<Vec<Event>> {
        let inner = self.inner.lock().unwrap();
        Ok(ids.iter().filter_map(|id| inner.events.get(id).cloned()).collect())
    }
}

#[async_trait]
impl AggregationWriter for InMemoryStore {
    async fn persist_assignments(&self, decisions: &[AssignmentDecision]) -> Result<PersistOutcome> {
        let mut inner = self.inner.lock().unwrap();
        let mut outcome = PersistOutcome::default();

        for decision in decisions {
            match decision {
                AssignmentDecision::ToExisting {
                    event_id,
                    news_ids,
                    confidence,
                    merged_regions,
                } => {
                    if let Some(event) = inner.events.get_mut(event_id) {
                        event.regions = merged_regions.clone();
                        event.updated_at = Utc::now();
                    }
                    for news_id in news_ids {
                        inner
                            .relations
                            .entry((*news_id, *event_id))
                            .or_insert_with(|| NewsEventRelation {
                                news_id: *news_id,
                                event_id: *event_id,
                                relation_type: RelationType::AssignedToExisting,
                                confidence: *confidence,
                                created_at: Utc::now(),
                            });
                        outcome.persisted_news_ids.push(*news_id);
                    }
                    let count = inner
                        .relations
                        .keys()
                        .filter(|(_, e)| e == event_id)
                        .count() as i64;
                    if let Some(event) = inner.events.get_mut(event_id) {
                        event.news_count = count;
                    }
                }
                AssignmentDecision::ToNew {
                    new_event,
                    news_ids,
                    confidence,
                } => {
                    let event_id = inner.next_event_id;
                    inner.next_event_id += 1;
                    let mut event = new_event.clone();
                    event.id = event_id;
                    inner.events.insert(event_id, event);
                    outcome.created_event_ids.push(event_id);

                    for news_id in news_ids {
                        inner.relations.insert(
                            (*news_id, event_id),
                            NewsEventRelation {
                                news_id: *news_id,
                                event_id,
                                relation_type: RelationType::AssignedToNew,
                                confidence: *confidence,
                                created_at: Utc::now(),
                            },
                        );
                        outcome.persisted_news_ids.push(*news_id);
                    }
                    let count = inner
                        .relations
                        .keys()
                        .filter(|(_, e)| *e == event_id)
                        .count() as i64;
                    if let Some(event) = inner.events.get_mut(&event_id) {
                        event.news_count = count;
                    }
                }
            }
        }

        Ok(outcome)
    }
}

#[async_trait]
impl MergeWriter for InMemoryStore {
    async fn execute_merge(&self, merge: &AcceptedMerge, now: DateTime<Utc>) -> Result<Event> {
        let mut inner = self.inner.lock().unwrap();

        let mut primary = inner
            .events
            .get(&merge.primary_event_id)
            .cloned()
            .ok_or(DomainError::EventNotFound(merge.primary_event_id))?;
        if primary.status != EventStatus::Active {
            return Err(DomainError::EventNotActive {
                event_id: primary.id,
                status: primary.status,
            });
        }

        let mut children = Vec::with_capacity(merge.child_event_ids.len());
        for &id in &merge.child_event_ids {
            let child = inner.events.get(&id).cloned().ok_or(DomainError::EventNotFound(id))?;
            if child.status != EventStatus::Active {
                return Err(DomainError::EventNotActive {
                    event_id: child.id,
                    status: child.status,
                });
            }
            children.push(child);
        }

        let mut region_additions: Vec<String> =
            children.iter().map(|c| c.regions.clone()).collect();
        if let Some(llm_regions) = &merge.merged_regions {
            region_additions.extend(llm_regions.clone());
        }
        let region_refs: Vec<&str> = region_additions.iter().map(|s| s.as_str()).collect();
        primary.regions = aggr_regions::merge(&primary.regions, &region_refs);

        primary.keywords = merge.merged_keywords.clone().unwrap_or_else(|| {
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
        }).join(",");

        primary.entities = std::iter::once(&primary.entities)
            .chain(children.iter().map(|c| &c.entities))
            .max_by_key(|e| e.len())
            .cloned()
            .unwrap_or_default();

        primary.first_news_time = std::iter::once(primary.first_news_time)
            .chain(children.iter().map(|c| c.first_news_time))
            .min()
            .unwrap();
        primary.last_news_time = std::iter::once(primary.last_news_time)
            .chain(children.iter().map(|c| c.last_news_time))
            .max()
            .unwrap();
        primary.news_count += children.iter().map(|c| c.news_count).sum::<i64>();
        if let Some(title) = &merge.merged_title {
            primary.title = title.clone();
        }
        if let Some(description) = &merge.merged_description {
            primary.description = description.clone();
        }
        primary.updated_at = now;

        inner.events.insert(primary.id, primary.clone());

        for child in &children {
            if let Some(c) = inner.events.get_mut(&child.id) {
                c.status = EventStatus::Merged;
                c.updated_at = now;
            }

            let news_ids: Vec<i64> = inner
                .relations
                .keys()
                .filter(|(_, e)| *e == child.id)
                .map(|(n, _)| *n)
                .collect();

            for news_id in news_ids {
                if inner.relations.contains_key(&(news_id, primary.id)) {
                    inner.relations.remove(&(news_id, child.id));
                } else if let Some(mut relation) = inner.relations.remove(&(news_id, child.id)) {
                    relation.event_id = primary.id;
                    inner.relations.insert((news_id, primary.id), relation);
                }
            }

            inner.history.push(EventHistoryRelation {
                parent_event_id: primary.id,
                child_event_id: child.id,
                relation_type: HistoryRelationType::BatchMerge,
                confidence: merge.confidence,
                description: merge.reason.clone(),
                created_at: now,
            });
        }

        Ok(primary)
    }
}

#[async_trait]
impl ProcessingLogWriter for InMemoryStore {
    async fn write_log(&self, log: &ProcessingLog) -> Result<()> {
        self.inner.lock().unwrap().logs.push(log.clone());
        Ok(())
    }
}

#[async_trait]
impl HistoryReader for InMemoryStore {
    async fn history_for_event(&self, event_id: i64) -> Result<Vec<EventHistoryRelation>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .history
            .iter()
            .filter(|h| h.parent_event_id == event_id || h.child_event_id == event_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RelationReader for InMemoryStore {
    async fn relations_for_event(&self, event_id: i64) -> Result<Vec<NewsEventRelation>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .relations
            .values()
            .filter(|r| r.event_id == event_id)
            .cloned()
            .collect())
    }

    async fn relations_for_news(&self, news_id: i64) -> Result<Vec<NewsEventRelation>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .relations
            .values()
            .filter(|r| r.news_id == news_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aggr_domain::Sentiment;

    fn news(id: i64) -> NewsItem {
        NewsItem {
            id,
            source_type: "baidu".into(),
            title: "t".into(),
            body: "b".into(),
            city_name: Some("X".into()),
            first_seen_at: Utc::now(),
            url: None,
        }
    }

    fn new_event_template() -> Event {
        Event {
            id: 0,
            title: "t".into(),
            description: "d".into(),
            event_type: "disaster".into(),
            sentiment: Sentiment::Neutral,
            entities: "{}".into(),
            regions: "X".into(),
            keywords: "quake".into(),
            confidence: 0.9,
            news_count: 0,
            first_news_time: Utc::now(),
            last_news_time: Utc::now(),
            status: EventStatus::Active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn unprocessed_news_excludes_related_and_excluded_types() {
        let store = InMemoryStore::new();
        store.seed_news([news(1), news(2)]);
        store
            .persist_assignments(&[AssignmentDecision::ToNew {
                new_event: new_event_template(),
                news_ids: vec![1],
                confidence: 0.9,
            }])
            .await
            .unwrap();

        let unprocessed = store.unprocessed_news(None, &[], &[]).await.unwrap();
        assert_eq!(unprocessed.len(), 1);
        assert_eq!(unprocessed[0].id, 2);
    }

    #[tokio::test]
    async fn persist_assignments_is_idempotent_on_relations() {
        let store = InMemoryStore::new();
        let decision = AssignmentDecision::ToExisting {
            event_id: 100,
            news_ids: vec![1],
            confidence: 0.9,
            merged_regions: "X".into(),
        };
        store.seed_events([Event { id: 100, ..new_event_template() }]);

        store.persist_assignments(&[decision.clone()]).await.unwrap();
        store.persist_assignments(&[decision]).await.unwrap();

        assert_eq!(store.relations().len(), 1);
    }

    #[tokio::test]
    async fn execute_merge_marks_children_merged_and_rewrites_relations() {
        let store = InMemoryStore::new();
        store.seed_events([
            Event { id: 1, news_count: 2, ..new_event_template() },
            Event { id: 2, news_count: 3, ..new_event_template() },
        ]);
        store
            .persist_assignments(&[AssignmentDecision::ToExisting {
                event_id: 2,
                news_ids: vec![10],
                confidence: 0.9,
                merged_regions: "X".into(),
            }])
            .await
            .unwrap();

        let merge = AcceptedMerge {
            primary_event_id: 1,
            child_event_ids: vec![2],
            confidence: 0.9,
            reason: "same happening".into(),
            merged_title: None,
            merged_description: None,
            merged_keywords: None,
            merged_regions: None,
        };
        let merged = store.execute_merge(&merge, Utc::now()).await.unwrap();
        assert_eq!(merged.id, 1);

        let child = store.event(2).unwrap();
        assert_eq!(child.status, EventStatus::Merged);

        let relations = store.relations();
        assert!(relations.iter().any(|r| r.news_id == 10 && r.event_id == 1));
        assert!(store.history().len() == 1);
    }
}
