//! Out-of-band re-scoring. Early acceptances are made on a single message of
//! context; once a ticker accumulates volume, the job re-scores it over a
//! wider window of recent accepted messages and corrects the ledger, never
//! deleting mention history.

use crate::ledger::MentionLedger;
use crate::notifier::ChangeNotifier;
use crate::scorer::ConfidenceScorer;
use crate::types::{OutboundEvent, PipelineError};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How wide the re-scoring window is and when the job fires. The window is
/// bounded by both message count and elapsed time.
#[derive(Debug, Clone)]
pub struct ReconcilePolicy {
    pub interval: Duration,
    /// Mentions a ticker must accumulate since its last reconciliation.
    pub mention_step: u64,
    pub max_window_messages: usize,
    pub max_window_age: ChronoDuration,
    /// Minimum confidence move before a correction is written.
    pub correction_delta: f64,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            mention_step: 25,
            max_window_messages: 50,
            max_window_age: ChronoDuration::hours(24),
            correction_delta: 0.15,
        }
    }
}

struct Sample {
    text: String,
    at: DateTime<Utc>,
}

/// Bounded per-ticker buffer of recently accepted message texts. Transient by
/// design: message retention is out of scope, losing the window only delays a
/// correction until new volume arrives.
pub struct SampleWindow {
    samples: RwLock<HashMap<String, VecDeque<Sample>>>,
    max_messages: usize,
}

impl SampleWindow {
    pub fn new(max_messages: usize) -> Self {
        Self {
            samples: RwLock::new(HashMap::new()),
            max_messages,
        }
    }

    pub fn push(&self, symbol: &str, text: &str, at: DateTime<Utc>) {
        let mut map = self.samples.write().expect("sample window poisoned");
        let window = map.entry(symbol.to_string()).or_default();
        window.push_back(Sample {
            text: text.to_string(),
            at,
        });
        while window.len() > self.max_messages {
            window.pop_front();
        }
    }

    /// Drop symbols whose newest sample has aged out entirely. The per-symbol
    /// buffers are bounded, the symbol set is not; without this the map grows
    /// for the lifetime of the process.
    pub fn prune(&self, max_age: ChronoDuration) {
        let cutoff = Utc::now() - max_age;
        let mut map = self.samples.write().expect("sample window poisoned");
        let before = map.len();
        map.retain(|_, w| w.back().map(|s| s.at >= cutoff).unwrap_or(false));
        let dropped = before - map.len();
        if dropped > 0 {
            debug!("[Reconcile] Pruned {} stale symbol window(s)", dropped);
        }
    }

    pub fn window(&self, symbol: &str, max_age: ChronoDuration) -> Vec<String> {
        let cutoff = Utc::now() - max_age;
        self.samples
            .read()
            .expect("sample window poisoned")
            .get(symbol)
            .map(|w| {
                w.iter()
                    .filter(|s| s.at >= cutoff)
                    .map(|s| s.text.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

pub struct Reconciler {
    ledger: MentionLedger,
    scorer: Arc<ConfidenceScorer>,
    window: Arc<SampleWindow>,
    notifier: Arc<ChangeNotifier>,
    policy: ReconcilePolicy,
}

impl Reconciler {
    pub fn new(
        ledger: MentionLedger,
        scorer: Arc<ConfidenceScorer>,
        window: Arc<SampleWindow>,
        notifier: Arc<ChangeNotifier>,
        policy: ReconcilePolicy,
    ) -> Self {
        Self {
            ledger,
            scorer,
            window,
            notifier,
            policy,
        }
    }

    pub fn policy(&self) -> &ReconcilePolicy {
        &self.policy
    }

    /// Timer loop; shares the ledger's write serialization, so corrections
    /// never race a live detection for the same symbol.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.policy.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(e) = self.pass().await {
                warn!("[Reconcile] Pass failed: {}", e);
            }
        }
    }

    pub async fn pass(&self) -> Result<usize, PipelineError> {
        self.window.prune(self.policy.max_window_age);
        let due = self.ledger.tickers_due(self.policy.mention_step)?;
        if due.is_empty() {
            return Ok(0);
        }
        info!("[Reconcile] {} ticker(s) due", due.len());
        let mut corrected = 0;
        for symbol in due {
            match self.reconcile_ticker(&symbol).await {
                Ok(Some(_)) => corrected += 1,
                Ok(None) => {}
                // one bad ticker must not stall the rest of the pass
                Err(e) => warn!("[Reconcile] {} failed: {}", symbol, e),
            }
        }
        Ok(corrected)
    }

    /// Re-score one ticker over its window. Returns the corrected confidence
    /// when a correction was written.
    pub async fn reconcile_ticker(&self, symbol: &str) -> Result<Option<f64>, PipelineError> {
        let Some(ticker) = self.ledger.get_ticker(symbol)? else {
            return Ok(None);
        };
        let samples = self.window.window(symbol, self.policy.max_window_age);
        if samples.is_empty() {
            debug!("[Reconcile] No window for {}, skipping", symbol);
            self.ledger.mark_reconciled(symbol)?;
            return Ok(None);
        }

        let rescored = match self.scorer.rescore(symbol, &samples).await {
            Ok(c) => c,
            Err(e) => {
                // scoring failure is a skip, not a crash; next pass retries
                warn!("[Reconcile] Rescore failed for {}: {}", symbol, e);
                return Ok(None);
            }
        };

        if (rescored - ticker.confidence).abs() < self.policy.correction_delta {
            self.ledger.mark_reconciled(symbol)?;
            return Ok(None);
        }

        let confirmed = rescored >= self.scorer.config().accept_threshold;
        // the delta is re-checked inside the write transaction: a mention
        // recorded during the rescore await may have moved the confidence
        let Some(aggregate) = self.ledger.apply_correction(
            symbol,
            rescored,
            confirmed,
            Some(rescored),
            self.policy.correction_delta,
        )?
        else {
            debug!("[Reconcile] {} moved during rescore, correction dropped", symbol);
            return Ok(None);
        };
        info!(
            "[Reconcile] {} corrected: {:.2} -> {:.2} over {} sample(s), confirmed={}",
            symbol,
            ticker.confidence,
            rescored,
            samples.len(),
            confirmed
        );
        self.notifier.publish(OutboundEvent::TickerMentionUpdate {
            ticker: symbol.to_string(),
            aggregate,
            confidence: rescored,
            correction: true,
        });
        Ok(Some(rescored))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refdata::{Classifier, ClassifierVerdict, Listing, ReferenceData};
    use crate::scorer::ScorerConfig;
    use crate::storage::Db;
    use async_trait::async_trait;

    struct AlwaysListed;

    #[async_trait]
    impl ReferenceData for AlwaysListed {
        async fn is_listed(&self, symbol: &str) -> Result<Option<Listing>, PipelineError> {
            Ok(Some(Listing {
                symbol: symbol.into(),
                exchange: "NYSE".into(),
            }))
        }
    }

    struct FixedClassifier(f64);

    #[async_trait]
    impl Classifier for FixedClassifier {
        async fn classify(&self, _s: &str, _t: &[String]) -> Result<ClassifierVerdict, PipelineError> {
            Ok(ClassifierVerdict {
                confidence: self.0,
                explanation: "mostly non-financial usage".into(),
            })
        }
    }

    fn reconciler(classifier_confidence: f64, policy: ReconcilePolicy) -> (Arc<Reconciler>, MentionLedger) {
        let ledger = MentionLedger::new(Db::open_in_memory().unwrap());
        let scorer = Arc::new(ConfidenceScorer::new(
            ScorerConfig::default(),
            Arc::new(AlwaysListed),
            Some(Arc::new(FixedClassifier(classifier_confidence))),
        ));
        let window = Arc::new(SampleWindow::new(policy.max_window_messages));
        let notifier = ChangeNotifier::new(16);
        let r = Arc::new(Reconciler::new(
            ledger.clone(),
            scorer,
            window,
            notifier,
            policy,
        ));
        (r, ledger)
    }

    #[tokio::test]
    async fn repeated_false_positive_usage_downgrades_confirmation() {
        let (r, ledger) = reconciler(0.3, ReconcilePolicy::default());
        for i in 0..5 {
            ledger
                .record("RUN", &format!("m{i}"), 0.72, "u1", "alice", Utc::now(), None)
                .unwrap();
            r.window.push("RUN", "gonna run it back tonight lol", Utc::now());
        }
        assert!(ledger.get_ticker("RUN").unwrap().unwrap().confirmed);

        let corrected = r.reconcile_ticker("RUN").await.unwrap();
        assert_eq!(corrected, Some(0.3));

        let ticker = ledger.get_ticker("RUN").unwrap().unwrap();
        assert!(!ticker.confirmed);
        // history intact
        assert_eq!(ledger.total_mentions().unwrap(), 5);
        assert_eq!(ledger.get_aggregate("RUN").unwrap().unwrap().mention_count, 5);
    }

    #[tokio::test]
    async fn small_moves_do_not_write_corrections() {
        let (r, ledger) = reconciler(0.75, ReconcilePolicy::default());
        ledger
            .record("XPON", "m1", 0.8, "u1", "alice", Utc::now(), None)
            .unwrap();
        r.window.push("XPON", "bought $XPON at 2.15, target 3", Utc::now());

        // 0.80 -> 0.75 is under the default 0.15 delta
        assert_eq!(r.reconcile_ticker("XPON").await.unwrap(), None);
        assert!(ledger.get_ticker("XPON").unwrap().unwrap().confirmed);
    }

    #[tokio::test]
    async fn pass_only_touches_tickers_past_the_step() {
        let mut policy = ReconcilePolicy::default();
        policy.mention_step = 3;
        let (r, ledger) = reconciler(0.2, policy);
        for i in 0..3 {
            ledger
                .record("HOT", &format!("h{i}"), 0.72, "u1", "alice", Utc::now(), None)
                .unwrap();
            r.window.push("HOT", "random chatter", Utc::now());
        }
        ledger
            .record("COLD", "c0", 0.72, "u1", "alice", Utc::now(), None)
            .unwrap();

        assert_eq!(r.pass().await.unwrap(), 1);
        assert!(!ledger.get_ticker("HOT").unwrap().unwrap().confirmed);
        assert!(ledger.get_ticker("COLD").unwrap().unwrap().confirmed);
    }

    #[test]
    fn prune_evicts_symbols_with_no_recent_samples() {
        let window = SampleWindow::new(3);
        window.push("OLD", "stale chatter", Utc::now() - ChronoDuration::hours(48));
        window.push("FRESH", "bought more", Utc::now());
        assert_eq!(window.samples.read().unwrap().len(), 2);

        window.prune(ChronoDuration::hours(24));
        let map = window.samples.read().unwrap();
        assert!(!map.contains_key("OLD"));
        assert!(map.contains_key("FRESH"));
    }

    #[test]
    fn sample_window_is_bounded_by_count_and_age() {
        let window = SampleWindow::new(3);
        for i in 0..5 {
            window.push("TSLA", &format!("msg {i}"), Utc::now());
        }
        let recent = window.window("TSLA", ChronoDuration::hours(1));
        assert_eq!(recent, vec!["msg 2", "msg 3", "msg 4"]);

        window.push("OLD", "stale", Utc::now() - ChronoDuration::hours(48));
        assert!(window.window("OLD", ChronoDuration::hours(24)).is_empty());
    }
}
