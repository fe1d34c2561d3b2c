//! Ties the stages together: extract candidates, score them against rules and
//! reference data, persist accepted detections, fan the changes out. One call
//! per message; replaying a message is a no-op at the ledger, which is what
//! makes reprocessing safe.

use crate::extractor;
use crate::ledger::MentionLedger;
use crate::notifier::ChangeNotifier;
use crate::rules::RuleStore;
use crate::reconcile::SampleWindow;
use crate::scorer::ConfidenceScorer;
use crate::types::{ChatMessage, OutboundEvent, PipelineError, SnapshotEntry};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Default, Serialize)]
pub struct PipelineStats {
    pub messages_processed: u64,
    pub mentions_recorded: u64,
    pub candidates_rejected: u64,
    /// Rejects that landed between the drop floor and the accept threshold;
    /// these are not persisted anywhere, the counter is the only trace.
    pub candidates_dropped: u64,
}

pub struct Pipeline {
    rules: Arc<RuleStore>,
    scorer: Arc<ConfidenceScorer>,
    ledger: MentionLedger,
    notifier: Arc<ChangeNotifier>,
    window: Arc<SampleWindow>,
    messages_processed: AtomicU64,
    mentions_recorded: AtomicU64,
    candidates_rejected: AtomicU64,
    candidates_dropped: AtomicU64,
}

impl Pipeline {
    pub fn new(
        rules: Arc<RuleStore>,
        scorer: Arc<ConfidenceScorer>,
        ledger: MentionLedger,
        notifier: Arc<ChangeNotifier>,
        window: Arc<SampleWindow>,
    ) -> Self {
        Self {
            rules,
            scorer,
            ledger,
            notifier,
            window,
            messages_processed: AtomicU64::new(0),
            mentions_recorded: AtomicU64::new(0),
            candidates_rejected: AtomicU64::new(0),
            candidates_dropped: AtomicU64::new(0),
        }
    }

    /// Process one message; returns how many new mentions were recorded.
    /// Scoring failures drop the candidate for this pass; storage failures
    /// surface as retryable errors and the caller re-submits the message.
    pub async fn process_message(&self, msg: &ChatMessage) -> Result<usize, PipelineError> {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
        let candidates = extractor::extract(&msg.text);
        if candidates.is_empty() {
            return Ok(0);
        }
        debug!("{}: {} candidate(s)", msg.message_id, candidates.len());

        let mut recorded = 0;
        for candidate in &candidates {
            let rule = self.rules.lookup(&candidate.symbol);
            let confirmed = self
                .ledger
                .get_ticker(&candidate.symbol)?
                .map(|t| t.confirmed)
                .unwrap_or(false);

            // no storage lock is held across this await
            let outcome = self
                .scorer
                .score(candidate, rule.as_ref(), confirmed, &msg.text)
                .await;

            if !outcome.accepted {
                self.candidates_rejected.fetch_add(1, Ordering::Relaxed);
                if outcome.reason == "below_threshold" {
                    self.candidates_dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "{}: {} at {:.2} dropped below threshold",
                        msg.message_id, candidate.symbol, outcome.confidence
                    );
                }
                continue;
            }

            let result = self.ledger.record(
                &candidate.symbol,
                &msg.message_id,
                outcome.confidence,
                &msg.author_id,
                &msg.author_name,
                msg.timestamp,
                outcome.exchange.as_deref(),
            )?;

            if result.inserted {
                recorded += 1;
                self.mentions_recorded.fetch_add(1, Ordering::Relaxed);
                self.window.push(&candidate.symbol, &msg.text, msg.timestamp);
                info!(
                    "MENTION: {} via {} at {:.2} ({} total)",
                    candidate.symbol,
                    candidate.method,
                    outcome.confidence,
                    result.aggregate.mention_count
                );
                self.notifier.publish(OutboundEvent::TickerMentionUpdate {
                    ticker: candidate.symbol.clone(),
                    aggregate: result.aggregate,
                    confidence: outcome.confidence,
                    correction: false,
                });
            }
        }
        Ok(recorded)
    }

    /// Pull-model snapshot: top tickers by mention count with blacklisted
    /// symbols filtered out.
    pub fn snapshot(&self, limit: usize) -> Result<Vec<SnapshotEntry>, PipelineError> {
        let blocked = self.rules.blocked_symbols();
        let mut entries = self.ledger.snapshot(limit + blocked.len())?;
        entries.retain(|e| !blocked.contains(&e.ticker.symbol));
        entries.truncate(limit);
        Ok(entries)
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
            mentions_recorded: self.mentions_recorded.load(Ordering::Relaxed),
            candidates_rejected: self.candidates_rejected.load(Ordering::Relaxed),
            candidates_dropped: self.candidates_dropped.load(Ordering::Relaxed),
        }
    }

    pub fn ledger(&self) -> &MentionLedger {
        &self.ledger
    }

    pub fn rules(&self) -> &RuleStore {
        &self.rules
    }
}
