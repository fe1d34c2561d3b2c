//! Accept/reject decisions for extracted candidates. The pure part is an
//! ordered list of named predicates so precedence is testable without any
//! network; reference-data and classifier calls happen afterwards, under a
//! bounded timeout, and a failure there is a reject, never a crash.

use crate::extractor;
use crate::refdata::{Classifier, ReferenceData};
use crate::types::{Candidate, PipelineError, RuleKind, TickerRule};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

lazy_static! {
    /// Real tickers that read as ordinary words. The classifier falls back to
    /// a flat 0.5 for these when it cannot answer.
    static ref KNOWN_FALSE_POSITIVE_WORDS: std::collections::HashSet<&'static str> = [
        "RUN", "OPEN", "PLAY", "FAST", "EAT", "RIDE", "LOVE", "CAKE",
        "BIG", "CARS", "NET", "COST", "SNOW", "ROOT", "PATH",
    ]
    .into_iter()
    .collect();
}

#[derive(Debug, Clone)]
pub struct ScorerConfig {
    /// Final confidence required to persist a mention.
    pub accept_threshold: f64,
    /// Below this the candidate is dropped without any record.
    pub drop_floor: f64,
    /// An explicit-marker candidate must carry at least this to override a
    /// permanent block.
    pub override_floor: f64,
    /// Confidence floor for already-confirmed tickers.
    pub confirmed_floor: f64,
    /// Added when the reference feed knows the symbol.
    pub reference_bonus: f64,
    /// Multiplier applied when a gating rule had to be satisfied.
    pub gated_penalty: f64,
    pub external_timeout: Duration,
    /// Validated symbols are not re-classified within this window.
    pub classify_ttl: ChronoDuration,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            accept_threshold: 0.70,
            drop_floor: 0.50,
            override_floor: 0.90,
            confirmed_floor: 0.85,
            reference_bonus: 0.15,
            gated_penalty: 0.7,
            external_timeout: Duration::from_secs(3),
            classify_ttl: ChronoDuration::hours(24),
        }
    }
}

/// Tagged outcome of one predicate. `Defer` passes to the next predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Accept { confidence: f64 },
    Reject { reason: &'static str },
    Defer,
}

/// Everything the pure gate can see about one candidate.
pub struct GateInput<'a> {
    pub candidate: &'a Candidate,
    pub rule: Option<&'a TickerRule>,
    pub confirmed: bool,
    pub text: &'a str,
    pub config: &'a ScorerConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GateOutcome {
    pub decision: Decision,
    /// True when a non-permanent block rule had to be satisfied; the final
    /// confidence is penalized for it.
    pub gated: bool,
}

/// Predicate 1: a permanent block falls only to an explicit-marker candidate
/// at or above the override floor.
pub fn permanent_block(input: &GateInput<'_>) -> Decision {
    match input.rule {
        Some(rule) if rule.kind == RuleKind::PermanentBlock => {
            if !input.candidate.is_explicit() {
                Decision::Reject {
                    reason: "permanent_block",
                }
            } else if input.candidate.base_confidence < input.config.override_floor {
                Decision::Reject {
                    reason: "block_override_below_floor",
                }
            } else {
                Decision::Defer
            }
        }
        _ => Decision::Defer,
    }
}

fn phrase_conditions_met(rule: &TickerRule, text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    rule.required_phrases.iter().all(|p| lower.contains(p.as_str()))
        && !rule.excluded_phrases.iter().any(|p| lower.contains(p.as_str()))
}

/// Predicate 2: non-permanent rules gate acceptance, they never ban it.
pub fn rule_gate(input: &GateInput<'_>) -> Decision {
    let Some(rule) = input.rule else {
        return Decision::Defer;
    };
    let met = match rule.kind {
        RuleKind::PermanentBlock => return Decision::Defer, // handled above
        RuleKind::RequiresExplicitMarker => input.candidate.is_explicit(),
        RuleKind::RequiresPriceContext => extractor::has_price_signal(input.text),
        RuleKind::MinimumConfidence => {
            input.candidate.base_confidence >= rule.min_confidence.unwrap_or(0.0)
        }
    };
    if !met {
        return Decision::Reject {
            reason: "rule_condition_unmet",
        };
    }
    if !phrase_conditions_met(rule, input.text) {
        return Decision::Reject {
            reason: "rule_phrases_unmet",
        };
    }
    Decision::Defer
}

/// Predicate 3: a previously confirmed ticker accepts on its own history.
pub fn confirmed_ticker(input: &GateInput<'_>) -> Decision {
    if input.confirmed {
        Decision::Accept {
            confidence: input
                .candidate
                .base_confidence
                .max(input.config.confirmed_floor),
        }
    } else {
        Decision::Defer
    }
}

/// Run the ordered pure predicates. `Defer` means the async continuation
/// (reference lookup, classifier) still has to corroborate the candidate.
pub fn gate(input: &GateInput<'_>) -> GateOutcome {
    let gated = matches!(
        input.rule.map(|r| r.kind),
        Some(RuleKind::RequiresExplicitMarker)
            | Some(RuleKind::RequiresPriceContext)
            | Some(RuleKind::MinimumConfidence)
    );
    let predicates: [fn(&GateInput<'_>) -> Decision; 3] =
        [permanent_block, rule_gate, confirmed_ticker];
    for predicate in predicates {
        match predicate(input) {
            Decision::Defer => continue,
            decided => return GateOutcome { decision: decided, gated },
        }
    }
    GateOutcome {
        decision: Decision::Defer,
        gated,
    }
}

#[derive(Debug, Clone)]
pub struct ScoreOutcome {
    pub accepted: bool,
    pub confidence: f64,
    pub reason: &'static str,
    pub exchange: Option<String>,
}

struct CachedVerdict {
    confidence: f64,
    cached_at: DateTime<Utc>,
}

pub struct ConfidenceScorer {
    config: ScorerConfig,
    refdata: Arc<dyn ReferenceData>,
    classifier: Option<Arc<dyn Classifier>>,
    classify_cache: RwLock<HashMap<String, CachedVerdict>>,
}

impl ConfidenceScorer {
    pub fn new(
        config: ScorerConfig,
        refdata: Arc<dyn ReferenceData>,
        classifier: Option<Arc<dyn Classifier>>,
    ) -> Self {
        Self {
            config,
            refdata,
            classifier,
            classify_cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ScorerConfig {
        &self.config
    }

    fn reject(reason: &'static str) -> ScoreOutcome {
        ScoreOutcome {
            accepted: false,
            confidence: 0.0,
            reason,
            exchange: None,
        }
    }

    /// Score one candidate against its rule and confirmation state. Callers
    /// must not hold any ledger lock across this: the reference and
    /// classifier calls await network I/O.
    pub async fn score(
        &self,
        candidate: &Candidate,
        rule: Option<&TickerRule>,
        confirmed: bool,
        text: &str,
    ) -> ScoreOutcome {
        let outcome = gate(&GateInput {
            candidate,
            rule,
            confirmed,
            text,
            config: &self.config,
        });

        let mut confidence = match outcome.decision {
            Decision::Reject { reason } => return Self::reject(reason),
            Decision::Accept { confidence } => {
                return ScoreOutcome {
                    accepted: confidence >= self.config.accept_threshold,
                    confidence,
                    reason: "confirmed",
                    exchange: None,
                }
            }
            Decision::Defer => candidate.base_confidence,
        };

        // No acceptance on text pattern alone: the reference feed has to know
        // the symbol.
        let listing = match tokio::time::timeout(
            self.config.external_timeout,
            self.refdata.is_listed(&candidate.symbol),
        )
        .await
        {
            Err(_) => {
                warn!("[Scorer] Reference lookup timed out for {}", candidate.symbol);
                return Self::reject("reference_timeout");
            }
            Ok(Err(e)) => {
                warn!("[Scorer] Reference lookup failed for {}: {}", candidate.symbol, e);
                return Self::reject("reference_unavailable");
            }
            Ok(Ok(None)) => return Self::reject("not_listed"),
            Ok(Ok(Some(listing))) => listing,
        };

        confidence = (confidence + self.config.reference_bonus).min(1.0);
        if outcome.gated {
            confidence *= self.config.gated_penalty;
        }

        if self.classifier.is_some() {
            let adjusted = self
                .classified_confidence(&candidate.symbol, std::slice::from_ref(&text.to_string()))
                .await;
            if let Some(c) = adjusted {
                confidence = (confidence + c) / 2.0;
            }
        }

        let accepted = confidence >= self.config.accept_threshold;
        let reason = if accepted {
            "accepted"
        } else if confidence < self.config.drop_floor {
            "dropped"
        } else {
            "below_threshold"
        };
        if !accepted {
            debug!(
                "[Scorer] {} {} at {:.2} ({})",
                candidate.symbol, candidate.method, confidence, reason
            );
        }
        ScoreOutcome {
            accepted,
            confidence,
            reason,
            exchange: Some(listing.exchange),
        }
    }

    /// Classifier judgment with a per-ticker cache. Failures degrade to the
    /// static default for known false-positive words and to no adjustment
    /// otherwise.
    async fn classified_confidence(&self, symbol: &str, samples: &[String]) -> Option<f64> {
        {
            let cache = self.classify_cache.read().await;
            if let Some(hit) = cache.get(symbol) {
                if Utc::now() - hit.cached_at < self.config.classify_ttl {
                    return Some(hit.confidence);
                }
            }
        }

        let classifier = self.classifier.as_ref()?;
        match tokio::time::timeout(
            self.config.external_timeout,
            classifier.classify(symbol, samples),
        )
        .await
        {
            Ok(Ok(verdict)) => {
                let mut cache = self.classify_cache.write().await;
                cache.insert(
                    symbol.to_string(),
                    CachedVerdict {
                        confidence: verdict.confidence,
                        cached_at: Utc::now(),
                    },
                );
                Some(verdict.confidence)
            }
            Ok(Err(e)) => {
                warn!("[Scorer] Classifier failed for {}: {}", symbol, e);
                Self::classifier_fallback(symbol)
            }
            Err(_) => {
                warn!("[Scorer] Classifier timed out for {}", symbol);
                Self::classifier_fallback(symbol)
            }
        }
    }

    fn classifier_fallback(symbol: &str) -> Option<f64> {
        KNOWN_FALSE_POSITIVE_WORDS.contains(symbol).then_some(0.5)
    }

    /// Wider-window re-score used by reconciliation: classifier over the
    /// sample window when available, otherwise a context-density heuristic
    /// over the same samples. Bypasses the 24 h cache on purpose.
    pub async fn rescore(&self, symbol: &str, samples: &[String]) -> Result<f64, PipelineError> {
        if let Some(classifier) = self.classifier.as_ref() {
            match tokio::time::timeout(
                self.config.external_timeout,
                classifier.classify(symbol, samples),
            )
            .await
            {
                Ok(Ok(verdict)) => {
                    let mut cache = self.classify_cache.write().await;
                    cache.insert(
                        symbol.to_string(),
                        CachedVerdict {
                            confidence: verdict.confidence,
                            cached_at: Utc::now(),
                        },
                    );
                    return Ok(verdict.confidence);
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(PipelineError::Timeout),
            }
        }
        Ok(Self::heuristic_rescore(samples))
    }

    /// Share of window samples that still read like trading talk, mapped into
    /// [0.4, 0.9].
    fn heuristic_rescore(samples: &[String]) -> f64 {
        if samples.is_empty() {
            return 0.5;
        }
        let contextful = samples
            .iter()
            .filter(|s| extractor::detect_context(s).any())
            .count();
        0.4 + 0.5 * contextful as f64 / samples.len() as f64
    }
}
