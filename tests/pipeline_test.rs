use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tickerwatch::{
    ledger::MentionLedger,
    notifier::ChangeNotifier,
    pipeline::Pipeline,
    reconcile::SampleWindow,
    refdata::{Listing, ReferenceData},
    rules::RuleStore,
    scorer::{ConfidenceScorer, ScorerConfig},
    storage::Db,
    types::{ChatMessage, OutboundEvent, PipelineError, RuleKind, RuleSpec},
};

/// Reference feed that knows a fixed set of symbols.
struct FixedRef(Vec<&'static str>);

#[async_trait]
impl ReferenceData for FixedRef {
    async fn is_listed(&self, symbol: &str) -> Result<Option<Listing>, PipelineError> {
        Ok(self.0.contains(&symbol).then(|| Listing {
            symbol: symbol.into(),
            exchange: "NASDAQ".into(),
        }))
    }
}

fn build_pipeline(db: Db, listed: Vec<&'static str>) -> Arc<Pipeline> {
    let rules = Arc::new(RuleStore::new(db.clone()).unwrap());
    let scorer = Arc::new(ConfidenceScorer::new(
        ScorerConfig::default(),
        Arc::new(FixedRef(listed)),
        None,
    ));
    let notifier = ChangeNotifier::new(64);
    let window = Arc::new(SampleWindow::new(50));
    Arc::new(Pipeline::new(
        rules,
        scorer,
        MentionLedger::new(db),
        notifier,
        window,
    ))
}

fn msg(id: &str, text: &str, author: &str) -> ChatMessage {
    ChatMessage {
        message_id: id.into(),
        text: text.into(),
        author_id: author.into(),
        author_name: author.into(),
        timestamp: Utc::now(),
    }
}

#[tokio::test]
async fn cashtag_message_lands_in_the_ledger() {
    let pipeline = build_pipeline(Db::open_in_memory().unwrap(), vec!["XPON"]);

    let recorded = pipeline
        .process_message(&msg("m1", "Bought $XPON at 2.15, target 3", "alice"))
        .await
        .unwrap();
    assert_eq!(recorded, 1);

    let ticker = pipeline.ledger().get_ticker("XPON").unwrap().unwrap();
    assert!(ticker.confirmed);
    assert!((ticker.confidence - 1.0).abs() < 1e-9);

    let snap = pipeline.snapshot(10).unwrap();
    assert_eq!(snap.len(), 1);
    assert_eq!(snap[0].ticker.symbol, "XPON");
    assert_eq!(snap[0].aggregate.mention_count, 1);
}

#[tokio::test]
async fn replaying_a_message_is_a_no_op() {
    let pipeline = build_pipeline(Db::open_in_memory().unwrap(), vec!["XPON"]);
    let message = msg("m1", "Bought $XPON at 2.15, target 3", "alice");

    assert_eq!(pipeline.process_message(&message).await.unwrap(), 1);
    assert_eq!(pipeline.process_message(&message).await.unwrap(), 0);
    assert_eq!(pipeline.ledger().mention_count("XPON").unwrap(), 1);
}

#[tokio::test]
async fn unlisted_symbols_never_persist() {
    let pipeline = build_pipeline(Db::open_in_memory().unwrap(), vec![]);
    let recorded = pipeline
        .process_message(&msg("m1", "Bought $ZZZZ at 2.15, target 3", "alice"))
        .await
        .unwrap();
    assert_eq!(recorded, 0);
    assert_eq!(pipeline.ledger().ticker_count().unwrap(), 0);
}

#[tokio::test]
async fn price_context_rule_rejects_without_price_signal() {
    let db = Db::open_in_memory().unwrap();
    let pipeline = build_pipeline(db, vec!["WW"]);
    pipeline
        .rules()
        .upsert(RuleSpec {
            ticker: "WW".into(),
            kind: Some(RuleKind::RequiresPriceContext),
            reason: "weight watchers chatter".into(),
            note: None,
            required_phrases: vec![],
            excluded_phrases: vec![],
            domain: None,
            min_confidence: None,
        })
        .unwrap();

    // trading verb gives context, but no price-like signal is present
    let recorded = pipeline
        .process_message(&msg("m1", "WW looking strong, bought more here", "alice"))
        .await
        .unwrap();
    assert_eq!(recorded, 0);
    assert!(pipeline.ledger().get_ticker("WW").unwrap().is_none());
}

#[tokio::test]
async fn blacklisted_tickers_are_filtered_from_snapshots() {
    let db = Db::open_in_memory().unwrap();
    let pipeline = build_pipeline(db, vec!["XPON", "GME"]);

    pipeline
        .process_message(&msg("m1", "Bought $XPON at 2.15, target 3", "alice"))
        .await
        .unwrap();
    pipeline
        .process_message(&msg("m2", "Bought $GME at 20, target 25", "bob"))
        .await
        .unwrap();

    pipeline
        .rules()
        .upsert(RuleSpec {
            ticker: "GME".into(),
            kind: Some(RuleKind::PermanentBlock),
            reason: "operator block".into(),
            note: None,
            required_phrases: vec![],
            excluded_phrases: vec![],
            domain: None,
            min_confidence: None,
        })
        .unwrap();

    let snap = pipeline.snapshot(10).unwrap();
    assert_eq!(snap.len(), 1);
    assert_eq!(snap[0].ticker.symbol, "XPON");
}

#[tokio::test]
async fn concurrent_workers_record_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");
    let ledger = MentionLedger::new(Db::open(path.to_str().unwrap()).unwrap());

    let mut handles = Vec::new();
    for _ in 0..2 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger
                .record("TSLA", "msg-1", 0.95, "u1", "alice", Utc::now(), Some("NASDAQ"))
                .unwrap()
        }));
    }
    let outcomes: Vec<_> = futures_util::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert_eq!(outcomes.iter().filter(|o| o.inserted).count(), 1);
    assert_eq!(ledger.total_mentions().unwrap(), 1);
    assert_eq!(ledger.mention_count("TSLA").unwrap(), 1);
}

#[tokio::test]
async fn subscribers_see_mention_updates_after_the_snapshot() {
    let db = Db::open_in_memory().unwrap();
    let rules = Arc::new(RuleStore::new(db.clone()).unwrap());
    let scorer = Arc::new(ConfidenceScorer::new(
        ScorerConfig::default(),
        Arc::new(FixedRef(vec!["XPON"])),
        None,
    ));
    let notifier = ChangeNotifier::new(64);
    let window = Arc::new(SampleWindow::new(50));
    let pipeline = Arc::new(Pipeline::new(
        rules,
        scorer,
        MentionLedger::new(db),
        notifier.clone(),
        window,
    ));

    let mut sub = notifier.subscribe();
    pipeline
        .process_message(&msg("m1", "Bought $XPON at 2.15, target 3", "alice"))
        .await
        .unwrap();

    match sub.recv().await {
        Some(OutboundEvent::TickerMentionUpdate {
            ticker,
            aggregate,
            confidence,
            correction,
        }) => {
            assert_eq!(ticker, "XPON");
            assert_eq!(aggregate.mention_count, 1);
            assert!((confidence - 1.0).abs() < 1e-9);
            assert!(!correction);
        }
        other => panic!("expected mention update, got {:?}", other),
    }
}
