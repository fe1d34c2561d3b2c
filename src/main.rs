use tickerwatch::{
    ledger::MentionLedger,
    notifier::{ChangeNotifier, DEFAULT_SUBSCRIBER_CAPACITY},
    pipeline::Pipeline,
    reconcile::{ReconcilePolicy, Reconciler, SampleWindow},
    refdata::{Classifier, HttpClassifier, HttpReferenceData},
    rules::RuleStore,
    scorer::{ConfidenceScorer, ScorerConfig},
    storage::Db,
    types::{ChatMessage, PipelineError, RuleSpec},
};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::{env, sync::Arc, time::Duration};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

pub struct AppState {
    pipeline: Arc<Pipeline>,
    notifier: Arc<ChangeNotifier>,
    reconciler: Arc<Reconciler>,
    snapshot_limit: usize,
}

fn env_f64(name: &str, default: f64) -> f64 {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("tickerwatch=info")
        .init();
    dotenvy::dotenv().ok();

    info!("==================================================");
    info!("  TICKERWATCH - mention detection core");
    info!("==================================================");

    let port: u16 = env::var("PORT")
        .unwrap_or("3004".into())
        .parse()
        .unwrap_or(3004);
    let db_path = env::var("DB_PATH").unwrap_or("tickerwatch.db".into());
    let refdata_url = env::var("REFDATA_URL").expect("REFDATA_URL required");
    let refdata_key = env::var("REFDATA_API_KEY").expect("REFDATA_API_KEY required");

    let scorer_config = ScorerConfig {
        accept_threshold: env_f64("ACCEPT_THRESHOLD", 0.70),
        drop_floor: env_f64("DROP_FLOOR", 0.50),
        override_floor: env_f64("OVERRIDE_FLOOR", 0.90),
        external_timeout: Duration::from_millis(env_u64("EXTERNAL_TIMEOUT_MS", 3000)),
        ..ScorerConfig::default()
    };
    let policy = ReconcilePolicy {
        interval: Duration::from_secs(env_u64("RECONCILE_INTERVAL_SECS", 300)),
        mention_step: env_u64("RECONCILE_MENTION_STEP", 25),
        max_window_messages: env_u64("RECONCILE_WINDOW_MESSAGES", 50) as usize,
        max_window_age: chrono::Duration::hours(env_u64("RECONCILE_WINDOW_HOURS", 24) as i64),
        ..ReconcilePolicy::default()
    };

    let db = Db::open(&db_path)?;
    let rules = Arc::new(RuleStore::new(db.clone())?);
    let ledger = MentionLedger::new(db);
    info!("Ledger ready: {} ticker(s) tracked", ledger.ticker_count()?);

    let refdata = Arc::new(HttpReferenceData::new(
        &refdata_url,
        &refdata_key,
        scorer_config.external_timeout,
    ));
    let classifier: Option<Arc<dyn Classifier>> = match env::var("CLASSIFIER_URL") {
        Ok(url) => {
            info!("Classifier enabled: {}", url);
            Some(Arc::new(HttpClassifier::new(
                &url,
                &env::var("CLASSIFIER_API_KEY").unwrap_or_default(),
                scorer_config.external_timeout,
            )))
        }
        Err(_) => {
            info!("Classifier disabled (CLASSIFIER_URL unset)");
            None
        }
    };

    let scorer = Arc::new(ConfidenceScorer::new(scorer_config, refdata, classifier));
    let notifier = ChangeNotifier::new(DEFAULT_SUBSCRIBER_CAPACITY);
    let window = Arc::new(SampleWindow::new(policy.max_window_messages));

    let pipeline = Arc::new(Pipeline::new(
        rules,
        scorer.clone(),
        ledger.clone(),
        notifier.clone(),
        window.clone(),
    ));
    let reconciler = Arc::new(Reconciler::new(
        ledger,
        scorer,
        window,
        notifier.clone(),
        policy,
    ));
    tokio::spawn(Arc::clone(&reconciler).run());

    if let Ok(feed_url) = env::var("PRICE_FEED_URL") {
        info!("Price feed: {}", feed_url);
        let feed_notifier = notifier.clone();
        tokio::spawn(async move {
            tickerwatch::pricefeed::run_price_feed(feed_url, feed_notifier).await;
        });
    }

    let state = Arc::new(AppState {
        pipeline,
        notifier,
        reconciler,
        snapshot_limit: env_u64("SNAPSHOT_LIMIT", 25) as usize,
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/api/status", get(status))
        .route("/api/snapshot", get(snapshot))
        .route("/api/messages", post(ingest_messages))
        .route("/api/rules", post(upsert_rule))
        .route("/api/rules/:ticker", delete(remove_rule))
        .route("/api/reconcile/:ticker", post(reconcile_ticker))
        .route("/ws", get(ws_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("Server running on port {} (WebSocket at /ws)", port);
    axum::serve(listener, app).await?;
    Ok(())
}

fn error_response(e: PipelineError) -> (StatusCode, Json<serde_json::Value>) {
    let status = if e.is_retryable() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::BAD_GATEWAY
    };
    (
        status,
        Json(serde_json::json!({
            "error": e.to_string(),
            "retryable": e.is_retryable(),
        })),
    )
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "tickerwatch",
        "timestamp": Utc::now().to_rfc3339()
    }))
}

async fn status(State(s): State<Arc<AppState>>) -> impl IntoResponse {
    let ledger = s.pipeline.ledger();
    let counts = match ledger.ticker_count().and_then(|t| Ok((t, ledger.total_mentions()?))) {
        Ok(c) => c,
        Err(e) => return error_response(e).into_response(),
    };
    Json(serde_json::json!({
        "pipeline": s.pipeline.stats(),
        "tickers": counts.0,
        "mentions": counts.1,
        "rules": s.pipeline.rules().len(),
        "subscribers": s.notifier.subscriber_count(),
    }))
    .into_response()
}

#[derive(Deserialize)]
struct SnapshotQuery {
    limit: Option<usize>,
}

async fn snapshot(
    State(s): State<Arc<AppState>>,
    Query(q): Query<SnapshotQuery>,
) -> impl IntoResponse {
    match s.pipeline.snapshot(q.limit.unwrap_or(s.snapshot_limit)) {
        Ok(entries) => Json(serde_json::json!({ "tickers": entries })).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

/// Single message or a batch. Replays are safe: the ledger is idempotent on
/// (ticker, message_id), so the chat exporter re-feeds any date range through
/// this same route to force a reprocess.
#[derive(Deserialize)]
#[serde(untagged)]
enum IngestBody {
    One(ChatMessage),
    Many(Vec<ChatMessage>),
}

async fn ingest_messages(
    State(s): State<Arc<AppState>>,
    Json(body): Json<IngestBody>,
) -> impl IntoResponse {
    let messages = match body {
        IngestBody::One(m) => vec![m],
        IngestBody::Many(m) => m,
    };
    let mut recorded = 0usize;
    for msg in &messages {
        match s.pipeline.process_message(msg).await {
            Ok(n) => recorded += n,
            Err(e) => {
                warn!("Processing {} failed: {}", msg.message_id, e);
                return error_response(e).into_response();
            }
        }
    }
    Json(serde_json::json!({
        "processed": messages.len(),
        "recorded": recorded,
    }))
    .into_response()
}

async fn upsert_rule(
    State(s): State<Arc<AppState>>,
    Json(spec): Json<RuleSpec>,
) -> impl IntoResponse {
    match s.pipeline.rules().upsert(spec) {
        Ok(rule) => (StatusCode::CREATED, Json(serde_json::json!({ "rule": rule }))).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn remove_rule(
    State(s): State<Arc<AppState>>,
    Path(ticker): Path<String>,
) -> impl IntoResponse {
    match s.pipeline.rules().remove(&ticker) {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn reconcile_ticker(
    State(s): State<Arc<AppState>>,
    Path(ticker): Path<String>,
) -> impl IntoResponse {
    let symbol = ticker.trim().to_ascii_uppercase();
    match s.reconciler.reconcile_ticker(&symbol).await {
        Ok(corrected) => Json(serde_json::json!({
            "ticker": symbol,
            "corrected": corrected,
        }))
        .into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    info!("WebSocket subscriber connected");

    // subscribe before the snapshot so nothing falls between them
    let mut sub = state.notifier.subscribe();

    let snapshot = match state.pipeline.snapshot(state.snapshot_limit) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Snapshot for new subscriber failed: {}", e);
            return;
        }
    };
    let hello = serde_json::json!({ "type": "snapshot", "tickers": snapshot });
    match rmp_serde::to_vec_named(&hello) {
        Ok(buf) => {
            if sender.send(Message::Binary(buf.into())).await.is_err() {
                return;
            }
        }
        Err(e) => {
            warn!("Snapshot encode failed: {}", e);
            return;
        }
    }

    loop {
        tokio::select! {
            event = sub.recv() => {
                let Some(event) = event else { break };
                let Ok(buf) = rmp_serde::to_vec_named(&event) else { continue };
                if sender.send(Message::Binary(buf.into())).await.is_err() {
                    break;
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                    // heartbeats and client chatter are ignored
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    info!("WebSocket subscriber disconnected");
}
