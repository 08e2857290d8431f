//! Full pipeline: SQLite market cache → shell scoring programs → orchestrator
//! → file-backed journal.

#![cfg(unix)]

use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal_macros::dec;
use tdas::ledger::Journal;
use tdas::models::config::{ProviderConfig, TdasConfig};
use tdas::models::context::CandidateRequest;
use tdas::models::opinion::{Action, Role};
use tdas::models::session::ExecutionOutcome;

fn seed(path: &std::path::Path, rows: &[(&str, &str, Option<&str>, &str)]) {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.execute_batch(tdas::models::cache_schema::CACHE_TABLE_DDL)
        .unwrap();
    let now = Utc::now();
    for (key, category, symbol, value_json) in rows {
        conn.execute(
            "INSERT OR REPLACE INTO cache_entries
             (key, category, value_json, source, symbol, created_at, expires_at, updated_at)
             VALUES (?1, ?2, ?3, 'test', ?4, ?5, ?6, ?5)",
            rusqlite::params![
                key,
                category,
                value_json,
                symbol,
                now.to_rfc3339(),
                (now + ChronoDuration::hours(1)).to_rfc3339(),
            ],
        )
        .unwrap();
    }
}

fn scorer(name: &str, role: Role, opinion: &str) -> ProviderConfig {
    ProviderConfig {
        name: name.to_string(),
        role,
        command: "/bin/sh".to_string(),
        args: vec![
            "-c".to_string(),
            format!("cat > /dev/null; echo '{opinion}'"),
        ],
        timeout_ms: Some(5_000),
    }
}

fn config(dir: &tempfile::TempDir) -> TdasConfig {
    let mut config = TdasConfig::default();
    config.context.sqlite_path = dir.path().join("cache.db").to_string_lossy().to_string();
    config.ledger.journal_path = Some(dir.path().join("journal.db").to_string_lossy().to_string());
    config.providers.providers = vec![
        scorer(
            "momentum",
            Role::Trader,
            r#"{"action": "buy", "confidence": "0.85", "reasoning": "breakout", "fields": {"entry_price": "150"}}"#,
        ),
        scorer("risk", Role::Risk, r#"{"action": "buy", "confidence": "0.75"}"#),
        scorer(
            "news",
            Role::Analyst,
            r#"{"action": "hold", "confidence": "0.70", "fields": {"information_score": "0.4"}}"#,
        ),
    ];
    config
}

fn request() -> CandidateRequest {
    CandidateRequest {
        instrument_id: "AAPL".to_string(),
        as_of_timestamp: Utc::now(),
        emergency_exit: false,
    }
}

#[tokio::test]
async fn cached_market_to_journaled_position() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    seed(
        &dir.path().join("cache.db"),
        &[
            ("quote:AAPL", "market_data", Some("AAPL"), r#"{"price": "150"}"#),
            ("ref:VIX", "reference_symbol", None, r#"{"value": 18}"#),
            ("regime:market", "regime", None, r#"{"regime": "transition"}"#),
        ],
    );

    let orchestrator = tdas::build_orchestrator(&config).unwrap();
    let record = tdas::deliberate(&orchestrator, request()).await.unwrap();

    assert_eq!(record.decision.action, Action::Buy);
    assert_eq!(record.decision.weighted_confidence, dec!(0.77));
    assert_eq!(record.decision.position_size, dec!(10000));
    assert_eq!(record.decision.stop_loss, Some(dec!(142.50)));
    assert_eq!(record.opinions[0].provider, "momentum");
    assert_eq!(record.opinions[2].information_score, Some(dec!(0.4)));
    assert!(matches!(record.execution, ExecutionOutcome::Opened { .. }));

    let journal = Journal::open(config.ledger.journal_path.as_deref().unwrap()).unwrap();
    assert_eq!(journal.session_count().unwrap(), 1);
    assert_eq!(journal.sessions_for("AAPL").unwrap()[0].id, record.id);
}

#[tokio::test]
async fn atr_sets_the_stop_distance() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    seed(
        &dir.path().join("cache.db"),
        &[
            ("quote:AAPL", "market_data", Some("AAPL"), r#"{"price": "150"}"#),
            ("ref:VIX", "reference_symbol", None, r#"{"value": "18"}"#),
            ("regime:market", "regime", None, r#"{"regime": "transition"}"#),
            ("indicator:atr_14:AAPL", "indicator", Some("AAPL"), r#"{"value": "2.25"}"#),
        ],
    );

    let orchestrator = tdas::build_orchestrator(&config).unwrap();
    let record = tdas::deliberate(&orchestrator, request()).await.unwrap();

    // 2 x 2.25 / 150 = 3%
    assert_eq!(record.decision.stop_loss, Some(dec!(145.50)));
    assert!(record.decision.approved);
}

#[tokio::test]
async fn missing_quote_fails_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    seed(
        &dir.path().join("cache.db"),
        &[
            ("ref:VIX", "reference_symbol", None, r#"{"value": 18}"#),
            ("regime:market", "regime", None, r#"{"regime": "transition"}"#),
        ],
    );

    let orchestrator = tdas::build_orchestrator(&config).unwrap();
    let result = tdas::deliberate(&orchestrator, request()).await;
    assert!(matches!(result, Err(tdas::agents::AgentError::Context(_))));
}

#[tokio::test]
async fn unreadable_earnings_date_blocks_the_buy() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    let today = Utc::now().date_naive().format("%Y/%m/%d").to_string();
    let earnings = format!(r#"{{"date": "{today}"}}"#);
    seed(
        &dir.path().join("cache.db"),
        &[
            ("quote:AAPL", "market_data", Some("AAPL"), r#"{"price": "150"}"#),
            ("ref:VIX", "reference_symbol", None, r#"{"value": 18}"#),
            ("regime:market", "regime", None, r#"{"regime": "transition"}"#),
            ("calendar:earnings:AAPL", "calendar", Some("AAPL"), &earnings),
        ],
    );

    let orchestrator = tdas::build_orchestrator(&config).unwrap();
    let result = tdas::deliberate(&orchestrator, request()).await;
    assert!(matches!(
        result,
        Err(tdas::agents::AgentError::Context(tdas::context::ContextError::Malformed { .. }))
    ));
    assert!(orchestrator.ledger().positions().await.unwrap().is_empty());
}
