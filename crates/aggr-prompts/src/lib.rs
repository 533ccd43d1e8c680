//! Prompt Builder (`spec.md` §4.2).
//!
//! Pure renderer of typed prompt templates from structured inputs. No
//! business logic lives here — callers (the LLM Dispatcher) own
//! sending the rendered string and parsing the response. Follows
//! `extraction::pipeline::prompts`'s `const TEMPLATE: &str` +
//! `format_*` function pattern.

use aggr_domain::{Event, NewsItem};
use sha2::{Digest, Sha256};

/// Template for the aggregation prompt (`spec.md` §4.2). Placeholders
/// are filled by [`format_aggregation_prompt`].
pub const AGGREGATION_PROMPT: &str = r#"You are clustering hot-topic news into events.

You will be given a list of NEWS ITEMS and a list of EXISTING EVENTS (context).
For every news item, decide whether it continues an existing event or
describes a new one.

RULE: every input news id must appear in EXACTLY ONE of the two output
arrays below — either inside one `existing_events` entry's `news_ids`,
or inside one `new_events` entry's `news_ids`. Do not omit any id. Do
not place the same id in more than one entry.

EXISTING EVENTS:
{context_events}

NEWS ITEMS:
{news_items}

Output strict JSON with this shape and nothing else:
{
  "existing_events": [
    {"event_id": 123, "news_ids": [1, 2], "confidence": 0.9, "reason": "..."}
  ],
  "new_events": [
    {
      "news_ids": [3, 4],
      "title": "...",
      "summary": "...",
      "event_type": "...",
      "region": "...",
      "tags": ["..."],
      "confidence": 0.85,
      "priority": "...",
      "sentiment": "positive" | "neutral" | "negative"
    }
  ]
}"#;

/// Template for the batch-merge prompt (`spec.md` §4.2).
pub const BATCH_MERGE_PROMPT: &str = r#"You are reviewing recent news EVENTS to find duplicates or
continuations of the same underlying happening.

EVENTS (id, created_at, title, description, regions, keywords):
{events}

For every group of events that describe the same happening, propose a
merge. The `primary_event_id` must be the earliest-created event in the
group (by `created_at`).

Output strict JSON with this shape and nothing else:
{
  "merge_suggestions": [
    {
      "group_id": "g1",
      "events_to_merge": [101, 102, 103],
      "primary_event_id": 101,
      "confidence": 0.9,
      "reason": "...",
      "merged_title": "...",
      "merged_description": "...",
      "merged_keywords": ["..."],
      "merged_regions": ["..."],
      "analysis": {}
    }
  ],
  "analysis_summary": "..."
}"#;

fn prompt_hash(template: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(template.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn aggregation_prompt_hash() -> String {
    prompt_hash(AGGREGATION_PROMPT)
}

pub fn batch_merge_prompt_hash() -> String {
    prompt_hash(BATCH_MERGE_PROMPT)
}

fn render_context_events(events: &[Event]) -> String {
    if events.is_empty() {
        return "(none)".to_string();
    }
    events
        .iter()
        .map(|e| {
            format!(
                "- id={} title=\"{}\" regions=\"{}\" keywords=\"{}\" news_count={}",
                e.id, e.title, e.regions, e.keywords, e.news_count
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_news_items(news: &[NewsItem]) -> String {
    news.iter()
        .map(|n| {
            format!(
                "- id={} source={} city=\"{}\" title=\"{}\"\n  body: {}",
                n.id,
                n.source_type,
                n.city_name.as_deref().unwrap_or(""),
                n.title,
                n.body
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render the aggregation prompt from a batch of news items and the
/// context events available for assignment.
pub fn format_aggregation_prompt(news: &[NewsItem], context_events: &[Event]) -> String {
    AGGREGATION_PROMPT
        .replace("{context_events}", &render_context_events(context_events))
        .replace("{news_items}", &render_news_items(news))
}

fn render_events_for_merge(events: &[Event]) -> String {
    events
        .iter()
        .map(|e| {
            format!(
                "- id={} created_at={} title=\"{}\" description=\"{}\" regions=\"{}\" keywords=\"{}\"",
                e.id,
                e.created_at.to_rfc3339(),
                e.title,
                e.description,
                e.regions,
                e.keywords
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render the batch-merge prompt from the set of recent events being
/// analysed for duplicates.
pub fn format_batch_merge_prompt(events: &[Event]) -> String {
    BATCH_MERGE_PROMPT.replace("{events}", &render_events_for_merge(events))
}

#[cfg(test)]
mod tests {
    use super::*;
    use aggr_domain::{EventStatus, Sentiment};
    use chrono::Utc;

    fn sample_news(id: i64) -> NewsItem {
        NewsItem {
            id,
            source_type: "baidu".into(),
            title: format!("headline {id}"),
            body: "body text".into(),
            city_name: Some("Beijing".into()),
            first_seen_at: Utc::now(),
            url: None,
        }
    }

    fn sample_event(id: i64) -> Event {
        Event {
            id,
            title: "Floods in Y".into(),
            description: "desc".into(),
            event_type: "disaster".into(),
            sentiment: Sentiment::Negative,
            entities: "{}".into(),
            regions: "Y".into(),
            keywords: "flood".into(),
            confidence: 0.8,
            news_count: 3,
            first_news_time: Utc::now(),
            last_news_time: Utc::now(),
            status: EventStatus::Active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn aggregation_prompt_demands_every_id_placed() {
        let prompt = format_aggregation_prompt(&[sample_news(1), sample_news(2)], &[]);
        assert!(prompt.contains("EXACTLY ONE"));
        assert!(prompt.contains("id=1"));
        assert!(prompt.contains("id=2"));
        assert!(prompt.contains("(none)"));
    }

    #[test]
    fn aggregation_prompt_includes_context_events() {
        let prompt = format_aggregation_prompt(&[sample_news(3)], &[sample_event(100)]);
        assert!(prompt.contains("id=100"));
        assert!(prompt.contains("Floods in Y"));
    }

    #[test]
    fn batch_merge_prompt_requires_earliest_as_primary() {
        let prompt = format_batch_merge_prompt(&[sample_event(101), sample_event(102)]);
        assert!(prompt.contains("earliest-created"));
        assert!(prompt.contains("id=101"));
        assert!(prompt.contains("id=102"));
    }

    #[test]
    fn prompt_hashes_are_stable() {
        assert_eq!(aggregation_prompt_hash(), aggregation_prompt_hash());
        assert_ne!(aggregation_prompt_hash(), batch_merge_prompt_hash());
    }
}
