use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use tdas_models::cache_schema::key_patterns;
use tdas_models::context::{MarketContext, MarketRegime, TechnicalIndicators};
use tracing::{debug, warn};

use crate::error::ContextError;
use crate::reader::CacheReader;

/// Where market snapshots come from. Swappable for tests and replays.
#[async_trait]
pub trait MarketContextSource: Send + Sync {
    async fn market_context(
        &self,
        instrument: &str,
        as_of: DateTime<Utc>,
    ) -> Result<MarketContext, ContextError>;
}

/// Parse a decimal from a JSON number, a decimal string, or the last element of an array.
pub fn decimal_from_json(key: &str, value: &serde_json::Value) -> Result<Decimal, ContextError> {
    let malformed = |reason: String| ContextError::Malformed {
        key: key.to_string(),
        reason,
    };
    match value {
        serde_json::Value::Number(n) => {
            let text = n.to_string();
            Decimal::from_str(&text)
                .or_else(|_| Decimal::from_scientific(&text))
                .map_err(|e| malformed(format!("{text}: {e}")))
        }
        serde_json::Value::String(s) => Decimal::from_str(s.trim())
            .map_err(|e| malformed(format!("{s}: {e}"))),
        serde_json::Value::Array(items) => match items.last() {
            Some(last) => decimal_from_json(key, last),
            None => Err(malformed("empty series".to_string())),
        },
        other => Err(malformed(format!("expected a number, got {other}"))),
    }
}

fn field<'a>(
    key: &str,
    value: &'a serde_json::Value,
    name: &str,
) -> Result<&'a serde_json::Value, ContextError> {
    value.get(name).ok_or_else(|| ContextError::Malformed {
        key: key.to_string(),
        reason: format!("missing field `{name}`"),
    })
}

/// Assembles market snapshots from the shared SQLite cache.
pub struct CacheContextSource {
    cache: Arc<CacheReader>,
}

impl CacheContextSource {
    pub fn new(cache: Arc<CacheReader>) -> Self {
        Self { cache }
    }

    async fn required(
        &self,
        instrument: &str,
        key: &str,
        name: &str,
    ) -> Result<serde_json::Value, ContextError> {
        let value: Option<serde_json::Value> = self.cache.get(key).await?;
        let value = value.ok_or_else(|| ContextError::Missing {
            instrument: instrument.to_string(),
            key: key.to_string(),
        })?;
        Ok(field(key, &value, name)?.clone())
    }

    /// Optional numeric value. Malformed entries are logged and treated as absent.
    async fn optional_decimal(&self, key: &str) -> Option<Decimal> {
        let value: serde_json::Value = match self.cache.get(key).await {
            Ok(Some(value)) => value,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %key, error = %e, "Unreadable cache entry");
                return None;
            }
        };
        match field(key, &value, "value").and_then(|v| decimal_from_json(key, v)) {
            Ok(d) => Some(d),
            Err(e) => {
                warn!(key = %key, error = %e, "Ignoring malformed cache entry");
                None
            }
        }
    }

    fn indicators(&self, instrument: &str) -> Result<TechnicalIndicators, ContextError> {
        let mut technical = TechnicalIndicators::default();
        for row in self.cache.get_by_prefix(key_patterns::INDICATOR_PREFIX)? {
            let Some(name) = key_patterns::indicator_name(&row.key, instrument) else {
                continue;
            };
            let parsed = serde_json::from_str::<serde_json::Value>(&row.value_json)
                .map_err(ContextError::from)
                .and_then(|v| {
                    let inner = field(&row.key, &v, "value")?;
                    decimal_from_json(&row.key, inner)
                });
            match parsed {
                Ok(value) => {
                    technical.values.insert(name.to_string(), value);
                }
                Err(e) => warn!(key = %row.key, error = %e, "Ignoring malformed indicator"),
            }
        }
        technical.atr = technical
            .get("atr_14")
            .or_else(|| technical.get("atr"));
        Ok(technical)
    }

    /// Next earnings date, if the calendar has one. A row that is present but
    /// unreadable is an error: the blackout rule cannot pass on a date it never saw.
    async fn earnings_date(&self, instrument: &str) -> Result<Option<NaiveDate>, ContextError> {
        let key = key_patterns::earnings(instrument);
        let Some(value) = self.cache.get::<serde_json::Value>(&key).await? else {
            return Ok(None);
        };
        let date = field(&key, &value, "date")?;
        let text = date.as_str().ok_or_else(|| ContextError::Malformed {
            key: key.clone(),
            reason: format!("expected a date string, got {date}"),
        })?;
        NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d")
            .map(Some)
            .map_err(|e| ContextError::Malformed {
                key: key.clone(),
                reason: format!("{text}: {e}"),
            })
    }
}

#[async_trait]
impl MarketContextSource for CacheContextSource {
    async fn market_context(
        &self,
        instrument: &str,
        as_of: DateTime<Utc>,
    ) -> Result<MarketContext, ContextError> {
        let quote_key = key_patterns::quote(instrument);
        let price = self.required(instrument, &quote_key, "price").await?;
        let price = decimal_from_json(&quote_key, &price)?;

        let vix = self
            .required(instrument, key_patterns::VOLATILITY_INDEX, "value")
            .await?;
        let volatility_index = decimal_from_json(key_patterns::VOLATILITY_INDEX, &vix)?;

        let regime = self
            .required(instrument, key_patterns::MARKET_REGIME, "regime")
            .await?;
        let market_regime: MarketRegime =
            serde_json::from_value(regime).map_err(|e| ContextError::Malformed {
                key: key_patterns::MARKET_REGIME.to_string(),
                reason: e.to_string(),
            })?;

        let mut technical_indicators = self.indicators(instrument)?;
        technical_indicators.support = self
            .optional_decimal(&key_patterns::support(instrument))
            .await;
        technical_indicators.resistance = self
            .optional_decimal(&key_patterns::resistance(instrument))
            .await;

        let earnings_date = self.earnings_date(instrument).await?;
        let news = match self.cache.get_json(&key_patterns::news(instrument)).await {
            Ok(Some(json)) => serde_json::from_str(&json).unwrap_or(serde_json::Value::Null),
            Ok(None) => serde_json::Value::Null,
            Err(e) => {
                warn!(instrument = %instrument, error = %e, "News unavailable");
                serde_json::Value::Null
            }
        };

        debug!(
            instrument = %instrument,
            price = %price,
            volatility_index = %volatility_index,
            indicators = technical_indicators.values.len(),
            "Assembled market context"
        );

        Ok(MarketContext {
            instrument: instrument.to_string(),
            price,
            volatility_index,
            market_regime,
            technical_indicators,
            earnings_date,
            news,
            as_of,
        })
    }
}

/// In-memory market snapshots, set directly by the caller.
#[derive(Default)]
pub struct StaticContextSource {
    contexts: RwLock<HashMap<String, MarketContext>>,
}

impl StaticContextSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(context: MarketContext) -> Self {
        let source = Self::new();
        source.set(context);
        source
    }

    pub fn set(&self, context: MarketContext) {
        if let Ok(mut contexts) = self.contexts.write() {
            contexts.insert(context.instrument.clone(), context);
        }
    }

    /// Move the quoted price of an instrument already present.
    pub fn set_price(&self, instrument: &str, price: Decimal) {
        if let Ok(mut contexts) = self.contexts.write() {
            if let Some(context) = contexts.get_mut(instrument) {
                context.price = price;
            }
        }
    }
}

#[async_trait]
impl MarketContextSource for StaticContextSource {
    async fn market_context(
        &self,
        instrument: &str,
        as_of: DateTime<Utc>,
    ) -> Result<MarketContext, ContextError> {
        let contexts = self
            .contexts
            .read()
            .map_err(|e| ContextError::Unavailable(format!("context lock poisoned: {e}")))?;
        let mut context = contexts
            .get(instrument)
            .cloned()
            .ok_or_else(|| ContextError::Missing {
                instrument: instrument.to_string(),
                key: key_patterns::quote(instrument),
            })?;
        context.as_of = as_of;
        Ok(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::SqliteReader;
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use tdas_models::cache_schema::CacheRow;

    fn make_row(key: &str, value_json: &str) -> CacheRow {
        let now = Utc::now();
        CacheRow {
            key: key.to_string(),
            category: "market_data".to_string(),
            value_json: value_json.to_string(),
            source: "test".to_string(),
            symbol: None,
            created_at: now.to_rfc3339(),
            expires_at: (now + ChronoDuration::seconds(300)).to_rfc3339(),
            updated_at: now.to_rfc3339(),
        }
    }

    fn source(rows: &[(&str, &str)]) -> CacheContextSource {
        let sqlite = SqliteReader::open_in_memory().unwrap();
        for (key, value) in rows {
            sqlite.insert(&make_row(key, value)).unwrap();
        }
        CacheContextSource::new(Arc::new(CacheReader::new(
            sqlite,
            100,
            Duration::from_secs(60),
        )))
    }

    #[test]
    fn decimal_from_numbers_strings_and_series() {
        assert_eq!(
            decimal_from_json("k", &serde_json::json!(150.25)).unwrap(),
            dec!(150.25)
        );
        assert_eq!(
            decimal_from_json("k", &serde_json::json!("142.50")).unwrap(),
            dec!(142.50)
        );
        assert_eq!(
            decimal_from_json("k", &serde_json::json!([14.0, 15.5, 16.25])).unwrap(),
            dec!(16.25)
        );
        assert!(decimal_from_json("k", &serde_json::json!([])).is_err());
        assert!(decimal_from_json("k", &serde_json::json!({"v": 1})).is_err());
    }

    #[tokio::test]
    async fn assembles_full_context() {
        let source = source(&[
            ("quote:AAPL", r#"{"price": 150.00, "volume": 1000000}"#),
            ("ref:VIX", r#"{"value": [15.0, 18.5]}"#),
            ("regime:market", r#"{"regime": "risk_on"}"#),
            ("indicator:atr_14:AAPL", r#"{"value": 3.0}"#),
            ("indicator:rsi_14:AAPL", r#"{"value": "28.5"}"#),
            ("indicator:rsi_14:MSFT", r#"{"value": 71.0}"#),
            ("level:support:AAPL", r#"{"value": 144.0}"#),
            ("calendar:earnings:AAPL", r#"{"date": "2026-04-30"}"#),
            ("news:AAPL", r#"{"sentiment": 0.4, "count": 12}"#),
        ]);
        let as_of = Utc::now();

        let ctx = source.market_context("AAPL", as_of).await.unwrap();
        assert_eq!(ctx.price, dec!(150.00));
        assert_eq!(ctx.volatility_index, dec!(18.5));
        assert_eq!(ctx.market_regime, MarketRegime::RiskOn);
        assert_eq!(ctx.technical_indicators.atr, Some(dec!(3.0)));
        assert_eq!(ctx.technical_indicators.get("rsi_14"), Some(dec!(28.5)));
        assert_eq!(ctx.technical_indicators.values.len(), 2);
        assert_eq!(ctx.technical_indicators.support, Some(dec!(144.0)));
        assert!(ctx.technical_indicators.resistance.is_none());
        assert_eq!(
            ctx.earnings_date,
            NaiveDate::from_ymd_opt(2026, 4, 30)
        );
        assert_eq!(ctx.news["count"], 12);
        assert_eq!(ctx.as_of, as_of);
    }

    #[tokio::test]
    async fn missing_quote_is_a_hard_error() {
        let source = source(&[
            ("ref:VIX", r#"{"value": 18.5}"#),
            ("regime:market", r#"{"regime": "transition"}"#),
        ]);
        let err = source.market_context("AAPL", Utc::now()).await.unwrap_err();
        assert!(matches!(err, ContextError::Missing { ref key, .. } if key == "quote:AAPL"));
    }

    #[tokio::test]
    async fn unknown_regime_is_malformed() {
        let source = source(&[
            ("quote:AAPL", r#"{"price": 150.00}"#),
            ("ref:VIX", r#"{"value": 18.5}"#),
            ("regime:market", r#"{"regime": "euphoric"}"#),
        ]);
        let err = source.market_context("AAPL", Utc::now()).await.unwrap_err();
        assert!(matches!(err, ContextError::Malformed { .. }));
    }

    #[tokio::test]
    async fn malformed_optional_entries_are_skipped() {
        let source = source(&[
            ("quote:AAPL", r#"{"price": "150.00"}"#),
            ("ref:VIX", r#"{"value": 22}"#),
            ("regime:market", r#"{"regime": "risk_off"}"#),
            ("indicator:atr_14:AAPL", r#"{"value": "n/a"}"#),
            ("level:support:AAPL", r#"{"value": "low"}"#),
        ]);
        let ctx = source.market_context("AAPL", Utc::now()).await.unwrap();
        assert!(ctx.technical_indicators.atr.is_none());
        assert!(ctx.technical_indicators.support.is_none());
        assert!(ctx.earnings_date.is_none());
        assert!(ctx.news.is_null());
    }

    #[tokio::test]
    async fn unparseable_earnings_date_is_malformed() {
        let today = Utc::now().date_naive().format("%Y/%m/%d").to_string();
        let slashed = format!(r#"{{"date": "{today}"}}"#);
        let rows = [
            slashed.as_str(),
            r#"{"date": "next week"}"#,
            r#"{"date": 20260430}"#,
            r#"{"when": "2026-04-30"}"#,
        ];
        for earnings in rows {
            let source = source(&[
                ("quote:AAPL", r#"{"price": "150.00"}"#),
                ("ref:VIX", r#"{"value": 22}"#),
                ("regime:market", r#"{"regime": "risk_off"}"#),
                ("calendar:earnings:AAPL", earnings),
            ]);
            let err = source.market_context("AAPL", Utc::now()).await.unwrap_err();
            assert!(
                matches!(err, ContextError::Malformed { ref key, .. } if key == "calendar:earnings:AAPL"),
                "{earnings}: {err}"
            );
        }
    }

    #[tokio::test]
    async fn unreadable_earnings_row_is_an_error() {
        let source = source(&[
            ("quote:AAPL", r#"{"price": "150.00"}"#),
            ("ref:VIX", r#"{"value": 22}"#),
            ("regime:market", r#"{"regime": "risk_off"}"#),
            ("calendar:earnings:AAPL", "not json"),
        ]);
        let err = source.market_context("AAPL", Utc::now()).await.unwrap_err();
        assert!(matches!(err, ContextError::Json(_)));
    }

    #[tokio::test]
    async fn static_source_serves_what_was_set() {
        let source = StaticContextSource::with(MarketContext {
            instrument: "TSLA".to_string(),
            price: dec!(240),
            volatility_index: dec!(21),
            market_regime: MarketRegime::Transition,
            technical_indicators: TechnicalIndicators::default(),
            earnings_date: None,
            news: serde_json::Value::Null,
            as_of: Utc::now(),
        });
        source.set_price("TSLA", dec!(236.5));

        let ctx = source.market_context("TSLA", Utc::now()).await.unwrap();
        assert_eq!(ctx.price, dec!(236.5));
        assert!(source.market_context("AAPL", Utc::now()).await.is_err());
    }
}
