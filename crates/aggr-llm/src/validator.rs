//! Validator contract (`spec.md` §4.4 "Validator contract", §4.5 edge
//! cases (b) and (c)).

use std::collections::HashSet;

use crate::types::{AggregationResult, ExistingEventAssignment, NewEventProposal};

/// A dropped `existing_events` entry whose `event_id` was not in the
/// context set supplied to the LLM (`spec.md` §4.5 edge case (b)).
#[derive(Debug, Clone, PartialEq)]
pub struct DroppedUnknownEvent {
    pub event_id: i64,
    pub news_ids: Vec<i64>,
}

/// Result of validating and repairing one parsed `AggregationResult`.
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub is_valid: bool,
    pub fixed_result: AggregationResult,
    pub missing_news: Vec<i64>,
    pub extra_ids: Vec<i64>,
    pub dropped_unknown_events: Vec<DroppedUnknownEvent>,
    /// news ids that appeared in more than one LLM entry; attribution
    /// went to the first entry in document order.
    pub duplicate_news_ids: Vec<i64>,
    pub message: String,
}

/// Validate `parsed` against the input news batch and (optionally) the
/// set of event ids the LLM was allowed to reference.
///
/// - `missing = input_ids \ processed_ids`, `extra = processed_ids \ input_ids`.
/// - `extra` ids are dropped from the result; an entry whose
///   `news_ids` becomes empty is removed entirely.
/// - A news id appearing in more than one entry is kept only in the
///   first entry in document order (existing_events before new_events,
///   array order within each); later occurrences are dropped.
/// - If `known_event_ids` is `Some` and an `existing_events` entry
///   names an id outside it, the entry is dropped and its news ids
///   become missing.
/// - `fixed_result` is always returned, even when `is_valid` is false,
///   so the caller can persist what the LLM did assign correctly.
pub fn validate_and_fix(
    input_ids: &HashSet<i64>,
    parsed: &AggregationResult,
    known_event_ids: Option<&HashSet<i64>>,
) -> ValidationOutcome {
    let processed_before = parsed.processed_news_ids();
    let extra_ids: Vec<i64> = processed_before.difference(input_ids).copied().collect();

    let mut seen: HashSet<i64> = HashSet::new();
    let mut duplicate_news_ids: Vec<i64> = Vec::new();
    let mut dropped_unknown_events: Vec<DroppedUnknownEvent> = Vec::new();

    let mut fixed_existing: Vec<ExistingEventAssignment> = Vec::new();
    for entry in &parsed.existing_events {
        if let Some(known) = known_event_ids {
            if !known.contains(&entry.event_id) {
                dropped_unknown_events.push(DroppedUnknownEvent {
                    event_id: entry.event_id,
                    news_ids: entry.news_ids.clone(),
                });
                continue;
            }
        }

        let kept_ids = dedupe_and_filter(&entry.news_ids, input_ids, &mut seen, &mut duplicate_news_ids);
        if !kept_ids.is_empty() {
            fixed_existing.push(ExistingEventAssignment {
                event_id: entry.event_id,
                news_ids: kept_ids,
                confidence: entry.confidence,
                reason: entry.reason.clone(),
            });
        }
    }

    let mut fixed_new: Vec<NewEventProposal> = Vec::new();
    for entry in &parsed.new_events {
        let kept_ids = dedupe_and_filter(&entry.news_ids, input_ids, &mut seen, &mut duplicate_news_ids);
        if !kept_ids.is_empty() {
            fixed_new.push(NewEventProposal {
                news_ids: kept_ids,
                title: entry.title.clone(),
                summary: entry.summary.clone(),
                event_type: entry.event_type.clone(),
                region: entry.region.clone(),
                tags: entry.tags.clone(),
                confidence: entry.confidence,
                priority: entry.priority.clone(),
                sentiment: entry.sentiment,
            });
        }
    }

    let fixed_result = AggregationResult {
        existing_events: fixed_existing,
        new_events: fixed_new,
    };

    let processed_after = fixed_result.processed_news_ids();
    let mut missing_news: Vec<i64> = input_ids.difference(&processed_after).copied().collect();
    missing_news.sort_unstable();

    let mut extra_ids = extra_ids;
    extra_ids.sort_unstable();

    let is_valid = missing_news.is_empty();
    let message = if is_valid {
        "all input news ids accounted for".to_string()
    } else {
        format!("{} news id(s) missing from LLM response", missing_news.len())
    };

    ValidationOutcome {
        is_valid,
        fixed_result,
        missing_news,
        extra_ids,
        dropped_unknown_events,
        duplicate_news_ids,
        message,
    }
}

/// Filter `ids` to those present in `input_ids`, then drop any already
/// `seen` (recording it as a duplicate), adding newly-kept ids to `seen`.
fn dedupe_and_filter(
    ids: &[i64],
    input_ids: &HashSet<i64>,
    seen: &mut HashSet<i64>,
    duplicates: &mut Vec<i64>,
) -> Vec<i64> {
    let mut kept = Vec::new();
    for &id in ids {
        if !input_ids.contains(&id) {
            continue; // extra id, silently dropped
        }
        if seen.contains(&id) {
            duplicates.push(id);
            continue;
        }
        seen.insert(id);
        kept.push(id);
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use aggr_domain::Sentiment;

    fn existing(event_id: i64, news_ids: Vec<i64>) -> ExistingEventAssignment {
        ExistingEventAssignment {
            event_id,
            news_ids,
            confidence: 0.9,
            reason: "r".into(),
        }
    }

    fn new_event(news_ids: Vec<i64>) -> NewEventProposal {
        NewEventProposal {
            news_ids,
            title: "t".into(),
            summary: "s".into(),
            event_type: "e".into(),
            region: "".into(),
            tags: vec![],
            confidence: 0.9,
            priority: "".into(),
            sentiment: Sentiment::Neutral,
        }
    }

    #[test]
    fn fully_covered_input_is_valid() {
        let input: HashSet<i64> = [1, 2].into_iter().collect();
        let parsed = AggregationResult {
            existing_events: vec![existing(100, vec![1])],
            new_events: vec![new_event(vec![2])],
        };
        let outcome = validate_and_fix(&input, &parsed, None);
        assert!(outcome.is_valid);
        assert!(outcome.missing_news.is_empty());
    }

    #[test]
    fn missing_ids_make_result_invalid_but_keep_fixed_result() {
        let input: HashSet<i64> = [1, 2, 3].into_iter().collect();
        let parsed = AggregationResult {
            existing_events: vec![existing(100, vec![1, 2])],
            new_events: vec![],
        };
        let outcome = validate_and_fix(&input, &parsed, None);
        assert!(!outcome.is_valid);
        assert_eq!(outcome.missing_news, vec![3]);
        assert_eq!(outcome.fixed_result.existing_events[0].news_ids, vec![1, 2]);
    }

    #[test]
    fn extra_ids_are_dropped_and_empty_entries_removed() {
        let input: HashSet<i64> = [1].into_iter().collect();
        let parsed = AggregationResult {
            existing_events: vec![existing(100, vec![1, 99])],
            new_events: vec![new_event(vec![99])],
        };
        let outcome = validate_and_fix(&input, &parsed, None);
        assert!(outcome.is_valid);
        assert_eq!(outcome.extra_ids, vec![99]);
        assert_eq!(outcome.fixed_result.existing_events[0].news_ids, vec![1]);
        assert!(outcome.fixed_result.new_events.is_empty());
    }

    #[test]
    fn duplicate_news_id_attributed_to_first_entry() {
        let input: HashSet<i64> = [1].into_iter().collect();
        let parsed = AggregationResult {
            existing_events: vec![existing(100, vec![1])],
            new_events: vec![new_event(vec![1])],
        };
        let outcome = validate_and_fix(&input, &parsed, None);
        assert!(outcome.is_valid);
        assert_eq!(outcome.duplicate_news_ids, vec![1]);
        assert_eq!(outcome.fixed_result.existing_events[0].news_ids, vec![1]);
        assert!(outcome.fixed_result.new_events.is_empty());
    }

    #[test]
    fn unknown_event_id_dropped_and_reported() {
        let input: HashSet<i64> = [1].into_iter().collect();
        let known: HashSet<i64> = [100].into_iter().collect();
        let parsed = AggregationResult {
            existing_events: vec![existing(999, vec![1])],
            new_events: vec![],
        };
        let outcome = validate_and_fix(&input, &parsed, Some(&known));
        assert!(!outcome.is_valid);
        assert_eq!(outcome.missing_news, vec![1]);
        assert_eq!(outcome.dropped_unknown_events.len(), 1);
        assert_eq!(outcome.dropped_unknown_events[0].event_id, 999);
    }
}
