use std::io::Read;

use anyhow::{Context, Result};
use clap::Parser;
use rust_decimal::Decimal;
use tdas_models::config::TdasConfig;
use tdas_models::context::CandidateRequest;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tdas", about = "Trade Decision Arbitration System")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/tdas.toml")]
    config: String,

    /// Read CandidateRequest JSON from a file instead of stdin
    #[arg(short, long)]
    input: Option<String>,

    /// Mark-to-market ticks to apply after the session: `[{"instrument": .., "price": ..}]`
    #[arg(short, long)]
    ticks: Option<String>,

    /// Pretty-print the output JSON
    #[arg(long)]
    pretty: bool,
}

#[derive(serde::Deserialize)]
struct Tick {
    instrument: String,
    price: Decimal,
}

fn render(value: &impl serde::Serialize, pretty: bool) -> Result<String> {
    Ok(if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load config
    let config_str = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("Failed to read config: {}", cli.config))?;
    let config: TdasConfig = toml::from_str(&config_str).with_context(|| "Failed to parse config")?;

    // Initialize tracing (respects RUST_LOG env var); stdout is reserved for output
    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .init();
    }

    // Read request
    let request_json = if let Some(input_path) = &cli.input {
        std::fs::read_to_string(input_path)
            .with_context(|| format!("Failed to read input: {input_path}"))?
    } else {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read from stdin")?;
        buf
    };
    let request: CandidateRequest =
        serde_json::from_str(&request_json).context("Failed to parse CandidateRequest JSON")?;

    let ticks: Vec<Tick> = match &cli.ticks {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read ticks: {path}"))?;
            serde_json::from_str(&raw).context("Failed to parse ticks JSON")?
        }
        None => Vec::new(),
    };

    // Build orchestrator and deliberate
    let orchestrator = tdas::build_orchestrator(&config).context("Failed to build orchestrator")?;

    let record = tdas::deliberate(&orchestrator, request)
        .await
        .map_err(|e| anyhow::anyhow!("Deliberation failed: {e}"))?;
    println!("{}", render(&record, cli.pretty)?);

    if !ticks.is_empty() {
        let ledger = orchestrator.ledger();
        for tick in &ticks {
            let closed = ledger
                .mark_to_market(&tick.instrument, tick.price)
                .await
                .with_context(|| format!("Failed to apply tick for {}", tick.instrument))?;
            for position in &closed {
                info!(
                    position_id = %position.id,
                    instrument = %position.instrument,
                    tick = %tick.price,
                    realized_pnl = ?position.realized_pnl,
                    "Stopped out"
                );
            }
        }

        let positions = ledger.positions().await.context("Failed to read positions")?;
        let summary = serde_json::json!({
            "portfolio": ledger.snapshot(),
            "positions": positions,
        });
        println!("{}", render(&summary, cli.pretty)?);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_accept_string_and_number_prices() {
        let ticks: Vec<Tick> = serde_json::from_str(
            r#"[{"instrument": "AAPL", "price": "143.10"}, {"instrument": "AAPL", "price": 141}]"#,
        )
        .unwrap();
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[0].price, Decimal::new(14310, 2));
        assert_eq!(ticks[1].price, Decimal::new(141, 0));
    }

    #[test]
    fn cli_defaults() {
        let cli = Cli::parse_from(["tdas"]);
        assert_eq!(cli.config, "config/tdas.toml");
        assert!(cli.input.is_none());
        assert!(!cli.pretty);
    }

    #[test]
    fn render_is_compact_unless_pretty() {
        let value = serde_json::json!({"a": 1});
        assert_eq!(render(&value, false).unwrap(), r#"{"a":1}"#);
        assert!(render(&value, true).unwrap().contains('\n'));
    }
}
