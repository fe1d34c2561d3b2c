//! Ticker candidate extraction. Pure text analysis, no I/O: a cashtag marker
//! always wins, bare uppercase tokens only survive when the surrounding
//! message reads like trading talk.

use crate::types::{Candidate, ExtractionMethod};
use lazy_static::lazy_static;
use std::collections::HashSet;

pub const EXPLICIT_BASE: f64 = 0.95;
pub const EXPLICIT_SINGLE_LETTER_BASE: f64 = 0.90;
pub const BARE_BASE: f64 = 0.60;
pub const BARE_CONTEXT_WEIGHT: f64 = 0.25;
/// Soft stopwords need at least this much trading context to be emitted.
pub const SOFT_STOPWORD_MIN_STRENGTH: f64 = 0.75;

lazy_static! {
    /// Never emitted as bare-token candidates, no matter the context:
    /// common English words, exchange/regulatory acronyms, trading slang
    /// and chat abbreviations that collide with real symbols.
    static ref HARD_STOPWORDS: HashSet<&'static str> = [
        // common English
        "ALL", "AND", "ANY", "ARE", "BACK", "BEEN", "BEST", "BUT", "CAN",
        "COULD", "DAY", "DID", "DONT", "DOWN", "EVEN", "EVER", "FIRST",
        "FOR", "FROM", "GET", "GOING", "GONE", "GOOD", "GOT", "GREAT",
        "HAD", "HAS", "HAVE", "HER", "HERE", "HIGH", "HIM", "HIS", "HOLD",
        "HOW", "INTO", "ITS", "JUST", "KNOW", "LAST", "LET", "LIKE",
        "LONG", "LOOK", "LOOKS", "LOW", "MAKE", "MORE", "MOST", "MUCH",
        "NEED", "NEW", "NEXT", "NICE", "NOT", "NOW", "ONE", "ONLY",
        "OPEN", "OUR", "OUT", "OVER", "PLAY", "REAL", "RIGHT", "SAME",
        "SEE", "SHE", "SOON", "STILL", "STOP", "SURE", "TAKE", "THAT",
        "THE", "THEM", "THEN", "THEY", "THINK", "THIS", "TIME", "TODAY",
        "TOO", "VERY", "WANT", "WAS", "WAY", "WEEK", "WELL", "WERE",
        "WHAT", "WHEN", "WHO", "WHY", "WILL", "WITH", "YES", "YET",
        "YOU", "YOUR",
        // exchange / regulatory acronyms
        "NYSE", "SEC", "FED", "FDA", "FOMC", "CPI", "GDP", "IPO", "ETF",
        "ETFS", "SPAC", "OTC", "USA", "USD", "CEO", "CFO", "CTO", "COO",
        "CNBC", "AI",
        // trading slang
        "YOLO", "FOMO", "HODL", "MOON", "ATH", "ATL", "BTFD", "FUD",
        "CALL", "CALLS", "PUT", "PUTS", "OTM", "ITM", "ATM", "EPS",
        "HTF", "LTF",
        // chat abbreviations
        "LOL", "LMAO", "IMO", "IMHO", "TLDR", "EOD", "EOW", "WSB",
        "GM", "GN", "DD", "PT", "SL", "TP", "IV",
    ]
    .into_iter()
    .collect();

    /// Short function-word-like tokens that happen to be plausible symbols.
    /// Emittable, but only under near-maximal trading context.
    static ref SOFT_STOPWORDS: HashSet<&'static str> = [
        "AM", "AN", "AS", "AT", "BE", "BY", "DO", "GO", "HE", "IF", "IN",
        "IS", "IT", "ME", "MY", "NO", "OF", "OK", "ON", "OR", "SO", "TO",
        "UP", "US", "WE", "BIG", "CAR", "EAT", "FAST", "RUN",
    ]
    .into_iter()
    .collect();

    static ref TRADING_VERBS: HashSet<&'static str> = [
        "bought", "buying", "sold", "selling", "entered", "entering",
        "exited", "exiting", "accumulating", "accumulated", "loaded",
        "loading", "added", "adding", "trimmed", "trimming", "shorted",
        "shorting", "covered", "covering", "scalped", "scalping",
        "averaging", "flipped", "flipping",
    ]
    .into_iter()
    .collect();

    static ref TECHNICAL_KEYWORDS: HashSet<&'static str> = [
        "support", "resistance", "breakout", "breakdown", "gap", "squeeze",
        "consolidation", "wedge", "trendline", "retest", "vwap", "ema",
        "sma", "rsi", "macd", "fib", "fibonacci",
    ]
    .into_iter()
    .collect();

    static ref POSITION_WORDS: HashSet<&'static str> = [
        "position", "positions", "shares", "contracts", "lots",
        "allocation", "starter",
    ]
    .into_iter()
    .collect();
}

/// Which of the four trading-context signal categories a message exhibits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TradingContext {
    pub trading_verb: bool,
    pub price_signal: bool,
    pub position_phrase: bool,
    pub technical_keyword: bool,
}

impl TradingContext {
    /// Distinct signal categories present, scaled into [0, 1].
    pub fn strength(&self) -> f64 {
        let count = self.trading_verb as u8
            + self.price_signal as u8
            + self.position_phrase as u8
            + self.technical_keyword as u8;
        f64::from(count) / 4.0
    }

    pub fn any(&self) -> bool {
        self.trading_verb || self.price_signal || self.position_phrase || self.technical_keyword
    }
}

fn trim_token(token: &str) -> &str {
    token.trim_matches(|c: char| !c.is_ascii_alphanumeric())
}

fn is_number(token: &str) -> bool {
    !token.is_empty() && token.parse::<f64>().is_ok()
}

fn is_price_amount(token: &str) -> bool {
    // "$2.15", "$3", possibly with a k/m suffix
    let Some(rest) = token.strip_prefix('$') else {
        return false;
    };
    let rest = rest.trim_end_matches(|c| c == 'k' || c == 'K' || c == 'm' || c == 'M');
    is_number(rest)
}

/// Price-like numeric signals: `$`+number, "N pt/target", "above/below N",
/// "N calls/puts".
pub fn has_price_signal(text: &str) -> bool {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    for (i, raw) in tokens.iter().enumerate() {
        if is_price_amount(raw.trim_end_matches(|c: char| c.is_ascii_punctuation() && c != '.')) {
            return true;
        }
        let tok = trim_token(raw).to_ascii_lowercase();
        let next = tokens.get(i + 1).map(|t| trim_token(t).to_ascii_lowercase());
        let clean = raw.trim_matches(|c: char| c == ',' || c == '!' || c == '?' || c == ')' || c == '(');
        if is_number(clean) {
            if let Some(next) = &next {
                if matches!(
                    next.as_str(),
                    "pt" | "pts" | "target" | "targets" | "calls" | "puts" | "call" | "put"
                ) {
                    return true;
                }
            }
        }
        if matches!(tok.as_str(), "above" | "below" | "target") {
            if let Some(next) = &next {
                if is_number(next) || is_price_amount(next) {
                    return true;
                }
            }
        }
    }
    false
}

/// Classify the whole message once; bare-token confidence scales with it.
pub fn detect_context(text: &str) -> TradingContext {
    let mut ctx = TradingContext {
        price_signal: has_price_signal(text),
        ..Default::default()
    };
    for raw in text.split_whitespace() {
        let tok = trim_token(raw).to_ascii_lowercase();
        if tok.is_empty() {
            continue;
        }
        if TRADING_VERBS.contains(tok.as_str()) {
            ctx.trading_verb = true;
        }
        if TECHNICAL_KEYWORDS.contains(tok.as_str()) {
            ctx.technical_keyword = true;
        }
        if POSITION_WORDS.contains(tok.as_str()) {
            ctx.position_phrase = true;
        }
    }
    ctx
}

/// Read a cashtag starting right after `$` at byte offset `start`.
/// Returns the canonical symbol and the offset past it.
fn read_marker_symbol(chars: &[char], start: usize) -> Option<(String, usize)> {
    let mut i = start;
    let mut body = String::new();
    while i < chars.len() && chars[i].is_ascii_alphabetic() && body.len() < 6 {
        body.push(chars[i].to_ascii_uppercase());
        i += 1;
    }
    if body.is_empty() || body.len() > 5 {
        return None;
    }
    // optional class suffix, e.g. $BRK.A
    if i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_alphabetic() {
        let mut j = i + 1;
        let mut suffix = String::new();
        while j < chars.len() && chars[j].is_ascii_alphabetic() && suffix.len() < 4 {
            suffix.push(chars[j].to_ascii_uppercase());
            j += 1;
        }
        let boundary = j >= chars.len() || !chars[j].is_ascii_alphanumeric();
        if (1..=3).contains(&suffix.len()) && boundary {
            body.push('.');
            body.push_str(&suffix);
            i = j;
        }
    }
    // a longer alphanumeric run means this was not a clean cashtag
    if i < chars.len() && chars[i].is_ascii_alphanumeric() {
        return None;
    }
    Some((body, i))
}

fn extract_explicit(chars: &[char], out: &mut Vec<Candidate>, seen: &mut HashSet<String>) {
    let mut i = 0;
    while i < chars.len() {
        if chars[i] != '$' {
            i += 1;
            continue;
        }
        let preceded_ok = i == 0 || !chars[i - 1].is_ascii_alphanumeric();
        if !preceded_ok {
            i += 1;
            continue;
        }
        match read_marker_symbol(chars, i + 1) {
            Some((symbol, next)) => {
                i = next;
                if seen.insert(symbol.clone()) {
                    let single = symbol.split('.').next().map(str::len) == Some(1);
                    out.push(Candidate {
                        symbol,
                        method: ExtractionMethod::ExplicitMarker,
                        base_confidence: if single {
                            EXPLICIT_SINGLE_LETTER_BASE
                        } else {
                            EXPLICIT_BASE
                        },
                    });
                }
            }
            // "$2.15" and friends: a price, not a marker
            None => i += 1,
        }
    }
}

fn extract_bare(text: &str, ctx: TradingContext, out: &mut Vec<Candidate>, seen: &mut HashSet<String>) {
    if !ctx.any() {
        return;
    }
    let strength = ctx.strength();
    for raw in text.split_whitespace() {
        let tok = trim_token(raw);
        if tok.len() < 2 || tok.len() > 5 {
            continue;
        }
        if !tok.chars().all(|c| c.is_ascii_uppercase()) {
            continue;
        }
        if HARD_STOPWORDS.contains(tok) {
            continue;
        }
        if SOFT_STOPWORDS.contains(tok) && strength < SOFT_STOPWORD_MIN_STRENGTH {
            continue;
        }
        if seen.insert(tok.to_string()) {
            out.push(Candidate {
                symbol: tok.to_string(),
                method: ExtractionMethod::BareToken,
                base_confidence: BARE_BASE + BARE_CONTEXT_WEIGHT * strength,
            });
        }
    }
}

/// Pull ticker candidates out of raw text. Never fails; malformed or empty
/// input yields an empty list. Explicit-marker hits suppress bare-token
/// duplicates of the same symbol.
pub fn extract(text: &str) -> Vec<Candidate> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let chars: Vec<char> = text.chars().collect();

    extract_explicit(&chars, &mut out, &mut seen);
    extract_bare(text, detect_context(text), &mut out, &mut seen);
    out
}
