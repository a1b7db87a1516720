// src/ingest/mod.rs
pub mod providers;
pub mod types;

use crate::ingest::types::{EntityFailure, IngestOutcome, IngestionSource};
use metrics::{counter, describe_counter, describe_histogram};
use once_cell::sync::OnceCell;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// One-time metrics registration (so series show up on /metrics).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "ingest_documents_total",
            "Documents kept after identity dedup."
        );
        describe_counter!(
            "ingest_entity_errors_total",
            "Per-entity fetch errors and timeouts."
        );
        describe_counter!(
            "ingest_duplicates_total",
            "Documents dropped as identity duplicates."
        );
        describe_histogram!("ingest_parse_ms", "Provider parse time in milliseconds.");
    });
}

/// Normalize text: collapse whitespace, trim, strip stray punctuation.
pub fn normalize_text(s: &str) -> String {
    // 1) HTML entity decode
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Strip HTML tags
    static RE_TAGS: OnceCell<regex::Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").unwrap());
    out = re_tags.replace_all(&out, "").to_string();

    // 3) Normalize curly and angle quotes to ASCII
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // 4) Collapse whitespace
    static RE_WS: OnceCell<regex::Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").unwrap());
    out = re_ws.replace_all(&out, " ").to_string();
    out = out.trim().to_string();

    // 5) Strip trailing sentence punctuation (keep quotes)
    while let Some(last) = out.chars().last() {
        if matches!(last, '!' | '?' | '.' | ',') {
            out.pop();
        } else {
            break;
        }
    }

    // 6) Length cap: 1500 chars
    if out.chars().count() > 1500 {
        out = out.chars().take(1500).collect();
    }

    out
}

/// Fetch every entity concurrently, then reassemble in entity order.
///
/// A failing or timed-out entity is recorded in `failures` and does not
/// affect the others. Each entity contributes at most `limit` documents;
/// identity duplicates (across entities too) are dropped, first one wins.
pub async fn ingest_entities(
    source: Arc<dyn IngestionSource>,
    entities: &[String],
    limit: usize,
    use_secondary_source: bool,
    timeout: Duration,
) -> IngestOutcome {
    ensure_metrics_described();

    let handles: Vec<_> = entities
        .iter()
        .map(|entity| {
            let source = Arc::clone(&source);
            let entity = entity.clone();
            tokio::spawn(async move {
                match tokio::time::timeout(
                    timeout,
                    source.fetch(&entity, limit, use_secondary_source),
                )
                .await
                {
                    Ok(Ok(docs)) => Ok(docs),
                    Ok(Err(e)) => Err(format!("{e:#}")),
                    Err(_) => Err(format!("fetch timed out after {}s", timeout.as_secs_f64())),
                }
            })
        })
        .collect();

    let mut outcome = IngestOutcome::default();
    let mut seen = HashSet::new();

    for (entity, handle) in entities.iter().zip(handles) {
        let result = match handle.await {
            Ok(r) => r,
            Err(e) => Err(format!("fetch task aborted: {e}")),
        };
        match result {
            Ok(docs) => {
                let fetched = docs.len();
                for doc in docs.into_iter().take(limit) {
                    if seen.insert(doc.id().clone()) {
                        outcome.documents.push(doc);
                    } else {
                        outcome.duplicates += 1;
                    }
                }
                tracing::debug!(
                    target: "ingest",
                    entity = %entity,
                    provider = source.name(),
                    fetched,
                    "entity fetched"
                );
            }
            Err(cause) => {
                tracing::warn!(
                    target: "ingest",
                    entity = %entity,
                    provider = source.name(),
                    error = %cause,
                    "entity fetch failed"
                );
                counter!("ingest_entity_errors_total").increment(1);
                outcome.failures.push(EntityFailure {
                    entity_id: entity.clone(),
                    cause,
                });
            }
        }
    }

    counter!("ingest_documents_total").increment(outcome.documents.len() as u64);
    counter!("ingest_duplicates_total").increment(outcome.duplicates as u64);
    outcome
}
