//! Operator-maintained override rules: a permanent blacklist plus contextual
//! gates per ticker. Read-heavy, so the whole table is cached in memory and
//! invalidated explicitly on upsert/remove.

use crate::storage::Db;
use crate::types::{PipelineError, RuleKind, RuleSpec, TickerRule};
use rusqlite::{params, Row};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use tracing::{info, warn};

/// Predicates recovered from an operator's free-text note. Best effort: an
/// unparseable note degrades to a plain permanent block.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ParsedNote {
    pub required_phrases: Vec<String>,
    pub excluded_phrases: Vec<String>,
    pub domain: Option<String>,
}

/// Pull quoted phrases and a `domain:` tag out of a free-text reason note.
/// Phrases in a clause introduced by "without"/"not"/"unless"/"except" are
/// exclusions, the rest are requirements.
pub fn parse_note(note: &str) -> ParsedNote {
    let mut parsed = ParsedNote::default();

    for word in note.split_whitespace() {
        if let Some(d) = word.strip_prefix("domain:") {
            let d = d.trim_matches(|c: char| !c.is_ascii_alphanumeric());
            if !d.is_empty() {
                parsed.domain = Some(d.to_ascii_lowercase());
            }
        }
    }

    let mut excluded_clause = false;
    let mut in_quote = false;
    let mut phrase = String::new();
    for token in note.split_whitespace() {
        let lower = token.to_ascii_lowercase();
        if !in_quote && matches!(lower.as_str(), "without" | "not" | "unless" | "except") {
            excluded_clause = true;
        }

        let mut rest = token;
        loop {
            match rest.find('"') {
                Some(idx) => {
                    if in_quote {
                        if !phrase.is_empty() {
                            phrase.push(' ');
                        }
                        phrase.push_str(&rest[..idx]);
                        let done = phrase.trim().to_ascii_lowercase();
                        if !done.is_empty() {
                            if excluded_clause {
                                parsed.excluded_phrases.push(done);
                            } else {
                                parsed.required_phrases.push(done);
                            }
                        }
                        phrase.clear();
                        in_quote = false;
                    } else {
                        in_quote = true;
                    }
                    rest = &rest[idx + 1..];
                }
                None => {
                    if in_quote && !rest.is_empty() {
                        if !phrase.is_empty() {
                            phrase.push(' ');
                        }
                        phrase.push_str(rest);
                    }
                    break;
                }
            }
        }
    }
    parsed
}

pub struct RuleStore {
    db: Db,
    cache: RwLock<HashMap<String, TickerRule>>,
}

impl RuleStore {
    /// Load every rule once; lookups afterwards never touch the database.
    pub fn new(db: Db) -> Result<Self, PipelineError> {
        let store = Self {
            db,
            cache: RwLock::new(HashMap::new()),
        };
        store.reload()?;
        Ok(store)
    }

    fn row_to_rule(row: &Row<'_>) -> rusqlite::Result<TickerRule> {
        let kind_str: String = row.get("kind")?;
        let required: String = row.get("required_phrases")?;
        let excluded: String = row.get("excluded_phrases")?;
        Ok(TickerRule {
            ticker: row.get("ticker")?,
            kind: RuleKind::parse(&kind_str).unwrap_or(RuleKind::PermanentBlock),
            min_confidence: row.get("min_confidence")?,
            required_phrases: serde_json::from_str(&required).unwrap_or_default(),
            excluded_phrases: serde_json::from_str(&excluded).unwrap_or_default(),
            domain: row.get("domain")?,
            reason: row.get("reason")?,
            note: row.get("note")?,
        })
    }

    fn reload(&self) -> Result<(), PipelineError> {
        let rules: Vec<TickerRule> = {
            let conn = self.db.lock();
            let mut stmt = conn.prepare("SELECT * FROM ticker_rules")?;
            let rows = stmt.query_map([], Self::row_to_rule)?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        let mut cache = self.cache.write().expect("rule cache poisoned");
        cache.clear();
        for rule in rules {
            cache.insert(rule.ticker.clone(), rule);
        }
        info!("[Rules] Loaded {} rule(s)", cache.len());
        Ok(())
    }

    pub fn lookup(&self, symbol: &str) -> Option<TickerRule> {
        self.cache
            .read()
            .expect("rule cache poisoned")
            .get(symbol)
            .cloned()
    }

    pub fn is_blocked(&self, symbol: &str) -> bool {
        self.lookup(symbol)
            .map(|r| r.kind == RuleKind::PermanentBlock)
            .unwrap_or(false)
    }

    pub fn blocked_symbols(&self) -> HashSet<String> {
        self.cache
            .read()
            .expect("rule cache poisoned")
            .values()
            .filter(|r| r.kind == RuleKind::PermanentBlock)
            .map(|r| r.ticker.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.cache.read().expect("rule cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build the stored rule from an operator request. Structured predicate
    /// fields win; the note parser only fills gaps, and a note that parses to
    /// nothing leaves a plain permanent block.
    fn materialize(spec: RuleSpec) -> TickerRule {
        let symbol = spec.ticker.trim().to_ascii_uppercase();
        let parsed = spec.note.as_deref().map(parse_note).unwrap_or_default();
        let required = if spec.required_phrases.is_empty() {
            parsed.required_phrases
        } else {
            spec.required_phrases
        };
        let excluded = if spec.excluded_phrases.is_empty() {
            parsed.excluded_phrases
        } else {
            spec.excluded_phrases
        };
        let kind = spec.kind.unwrap_or(RuleKind::PermanentBlock);
        if spec.kind.is_none() && spec.note.is_some() {
            warn!(
                "[Rules] No structured kind for {}; note degraded to permanent block",
                symbol
            );
        }
        TickerRule {
            ticker: symbol,
            kind,
            min_confidence: spec.min_confidence,
            required_phrases: required,
            excluded_phrases: excluded,
            domain: spec.domain.or(parsed.domain),
            reason: spec.reason,
            note: spec.note,
        }
    }

    pub fn upsert(&self, spec: RuleSpec) -> Result<TickerRule, PipelineError> {
        let rule = Self::materialize(spec);
        {
            let conn = self.db.lock();
            conn.execute(
                r#"
                INSERT INTO ticker_rules (
                    ticker, kind, min_confidence, required_phrases,
                    excluded_phrases, domain, reason, note, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(ticker) DO UPDATE SET
                    kind = excluded.kind,
                    min_confidence = excluded.min_confidence,
                    required_phrases = excluded.required_phrases,
                    excluded_phrases = excluded.excluded_phrases,
                    domain = excluded.domain,
                    reason = excluded.reason,
                    note = excluded.note
                "#,
                params![
                    rule.ticker,
                    rule.kind.as_str(),
                    rule.min_confidence,
                    serde_json::to_string(&rule.required_phrases).unwrap_or_else(|_| "[]".into()),
                    serde_json::to_string(&rule.excluded_phrases).unwrap_or_else(|_| "[]".into()),
                    rule.domain,
                    rule.reason,
                    rule.note,
                    chrono::Utc::now().to_rfc3339(),
                ],
            )?;
        }
        self.cache
            .write()
            .expect("rule cache poisoned")
            .insert(rule.ticker.clone(), rule.clone());
        info!("[Rules] Upserted {} rule for {}", rule.kind, rule.ticker);
        Ok(rule)
    }

    pub fn remove(&self, symbol: &str) -> Result<bool, PipelineError> {
        let symbol = symbol.trim().to_ascii_uppercase();
        let removed = {
            let conn = self.db.lock();
            conn.execute("DELETE FROM ticker_rules WHERE ticker = ?1", params![symbol])? > 0
        };
        self.cache
            .write()
            .expect("rule cache poisoned")
            .remove(&symbol);
        if removed {
            info!("[Rules] Removed rule for {}", symbol);
        }
        Ok(removed)
    }

    /// Direct read bypassing the cache; used by tests to assert write-through.
    #[cfg(test)]
    fn lookup_db(&self, symbol: &str) -> Result<Option<TickerRule>, PipelineError> {
        use rusqlite::OptionalExtension;
        let conn = self.db.lock();
        let rule = conn
            .query_row(
                "SELECT * FROM ticker_rules WHERE ticker = ?1",
                params![symbol],
                Self::row_to_rule,
            )
            .optional()?;
        Ok(rule)
    }
}
