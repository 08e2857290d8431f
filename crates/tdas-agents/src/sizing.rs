use rust_decimal::{Decimal, RoundingStrategy};
use tdas_models::config::SizingConfig;
use tdas_models::context::{MarketContext, MarketRegime, TechnicalIndicators};
use tdas_models::opinion::{RiskProposal, SizingBreakdown, StopSource};
use tdas_models::position::Side;

use crate::error::SizingError;

/// Currency amounts are kept to cents.
const CURRENCY_DP: u32 = 2;

/// Position-size multiplier for the current volatility index and market regime.
///
/// Bands: `< 15` → 1.2, `[15, 25)` → 1.0, `[25, 35]` → 0.7, `> 35` → 0.5; then
/// risk-on adds 0.1 and risk-off subtracts 0.2. Never below `floor`.
pub fn volatility_multiplier(
    volatility_index: Decimal,
    regime: MarketRegime,
    floor: Decimal,
) -> Decimal {
    let band = if volatility_index < Decimal::from(15) {
        Decimal::new(12, 1)
    } else if volatility_index < Decimal::from(25) {
        Decimal::ONE
    } else if volatility_index <= Decimal::from(35) {
        Decimal::new(7, 1)
    } else {
        Decimal::new(5, 1)
    };
    let offset = match regime {
        MarketRegime::RiskOn => Decimal::new(1, 1),
        MarketRegime::Transition => Decimal::ZERO,
        MarketRegime::RiskOff => Decimal::new(-2, 1),
    };
    (band + offset).max(floor)
}

/// Four-stage position sizing with a hard cap.
#[derive(Debug, Clone)]
pub struct SizingEngine {
    config: SizingConfig,
}

impl SizingEngine {
    pub fn new(config: SizingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SizingConfig {
        &self.config
    }

    fn clamp_stop(&self, pct: Decimal) -> Decimal {
        pct.clamp(self.config.min_stop_pct, self.config.max_stop_pct)
    }

    /// Stop distance as a fraction of entry, by priority: ATR, then the nearest
    /// protective level less a buffer, then the default.
    pub fn stop_distance(
        &self,
        entry_price: Decimal,
        side: Side,
        indicators: &TechnicalIndicators,
    ) -> (Decimal, StopSource) {
        if entry_price <= Decimal::ZERO {
            return (self.config.default_stop_pct, StopSource::Default);
        }

        if let Some(atr) = indicators.atr.filter(|atr| *atr > Decimal::ZERO) {
            let pct = self.config.atr_multiplier * atr / entry_price;
            return (self.clamp_stop(pct), StopSource::Volatility);
        }

        let level_stop = match side {
            Side::Long => indicators
                .support
                .filter(|s| *s > Decimal::ZERO && *s < entry_price)
                .map(|s| s * (Decimal::ONE - self.config.level_buffer_pct)),
            Side::Short => indicators
                .resistance
                .filter(|r| *r > entry_price)
                .map(|r| r * (Decimal::ONE + self.config.level_buffer_pct)),
        };
        if let Some(stop) = level_stop {
            let pct = (entry_price - stop).abs() / entry_price;
            return (self.clamp_stop(pct), StopSource::Level);
        }

        (self.config.default_stop_pct, StopSource::Default)
    }

    /// Stop price at `distance` from entry, rounded to cents toward the entry.
    pub fn stop_price(&self, entry_price: Decimal, side: Side, distance: Decimal) -> Decimal {
        match side {
            Side::Long => (entry_price * (Decimal::ONE - distance))
                .round_dp_with_strategy(CURRENCY_DP, RoundingStrategy::ToPositiveInfinity),
            Side::Short => (entry_price * (Decimal::ONE + distance))
                .round_dp_with_strategy(CURRENCY_DP, RoundingStrategy::ToNegativeInfinity),
        }
    }

    /// The sizing formula proper.
    pub fn size(
        &self,
        portfolio_value: Decimal,
        stop_distance_pct: Decimal,
        stop_source: StopSource,
        confidence: Decimal,
        volatility_index: Decimal,
        regime: MarketRegime,
    ) -> Result<SizingBreakdown, SizingError> {
        if portfolio_value <= Decimal::ZERO {
            return Err(SizingError::InvalidInput(format!(
                "portfolio value must be positive, got {portfolio_value}"
            )));
        }
        if stop_distance_pct <= Decimal::ZERO {
            return Err(SizingError::InvalidInput(format!(
                "stop-loss distance must be positive, got {stop_distance_pct}"
            )));
        }
        if confidence < Decimal::ZERO || confidence > Decimal::ONE {
            return Err(SizingError::InvalidInput(format!(
                "confidence {confidence} outside [0, 1]"
            )));
        }

        let base_size = self.config.risk_fraction / stop_distance_pct * portfolio_value;
        let confidence_adjusted = base_size * confidence;
        let multiplier = volatility_multiplier(
            volatility_index,
            regime,
            self.config.min_volatility_multiplier,
        );
        let risk_adjusted = confidence_adjusted * multiplier;
        let hard_cap = portfolio_value * self.config.hard_cap_fraction;
        let capped = risk_adjusted > hard_cap;
        let final_size = risk_adjusted
            .min(hard_cap)
            .round_dp_with_strategy(CURRENCY_DP, RoundingStrategy::ToZero);

        Ok(SizingBreakdown {
            portfolio_value,
            stop_distance_pct,
            stop_source,
            risk_fraction: self.config.risk_fraction,
            base_size,
            confidence,
            confidence_adjusted,
            volatility_multiplier: multiplier,
            risk_adjusted,
            hard_cap,
            final_size,
            capped,
        })
    }

    /// Size a trade on `side` at the current market price.
    pub fn propose(
        &self,
        side: Side,
        market: &MarketContext,
        portfolio_value: Decimal,
        confidence: Decimal,
    ) -> Result<RiskProposal, SizingError> {
        if market.price <= Decimal::ZERO {
            return Err(SizingError::InvalidInput(format!(
                "entry price must be positive, got {}",
                market.price
            )));
        }
        let (distance, source) =
            self.stop_distance(market.price, side, &market.technical_indicators);
        let sizing = self.size(
            portfolio_value,
            distance,
            source,
            confidence,
            market.volatility_index,
            market.market_regime,
        )?;
        Ok(RiskProposal {
            position_size: sizing.final_size,
            stop_loss: Some(self.stop_price(market.price, side, distance)),
            sizing: Some(sizing),
        })
    }
}

impl Default for SizingEngine {
    fn default() -> Self {
        Self::new(SizingConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn market(price: Decimal, vix: Decimal, regime: MarketRegime) -> MarketContext {
        MarketContext {
            instrument: "AAPL".to_string(),
            price,
            volatility_index: vix,
            market_regime: regime,
            technical_indicators: TechnicalIndicators::default(),
            earnings_date: None,
            news: serde_json::Value::Null,
            as_of: Utc::now(),
        }
    }

    #[test]
    fn multiplier_bands_and_offsets() {
        let floor = dec!(0.3);
        assert_eq!(volatility_multiplier(dec!(12), MarketRegime::Transition, floor), dec!(1.2));
        assert_eq!(volatility_multiplier(dec!(15), MarketRegime::Transition, floor), dec!(1.0));
        assert_eq!(volatility_multiplier(dec!(25), MarketRegime::Transition, floor), dec!(0.7));
        assert_eq!(volatility_multiplier(dec!(35), MarketRegime::Transition, floor), dec!(0.7));
        assert_eq!(volatility_multiplier(dec!(35.01), MarketRegime::Transition, floor), dec!(0.5));
        assert_eq!(volatility_multiplier(dec!(12), MarketRegime::RiskOn, floor), dec!(1.3));
        assert_eq!(volatility_multiplier(dec!(20), MarketRegime::RiskOff, floor), dec!(0.8));
        // 0.5 - 0.2 sits exactly on the floor
        assert_eq!(volatility_multiplier(dec!(45), MarketRegime::RiskOff, floor), dec!(0.3));
    }

    #[test]
    fn multiplier_never_below_floor() {
        assert_eq!(
            volatility_multiplier(dec!(80), MarketRegime::RiskOff, dec!(0.4)),
            dec!(0.4)
        );
    }

    #[test]
    fn four_stages() {
        let engine = SizingEngine::default();
        let sizing = engine
            .size(
                dec!(100000),
                dec!(0.05),
                StopSource::Default,
                dec!(0.75),
                dec!(20),
                MarketRegime::Transition,
            )
            .unwrap();
        // 0.02 / 0.05 * 100000 = 40000; * 0.75 = 30000; * 1.0 = 30000; cap 10000
        assert_eq!(sizing.base_size, dec!(40000));
        assert_eq!(sizing.confidence_adjusted, dec!(30000));
        assert_eq!(sizing.risk_adjusted, dec!(30000));
        assert_eq!(sizing.hard_cap, dec!(10000));
        assert_eq!(sizing.final_size, dec!(10000));
        assert!(sizing.capped);
    }

    #[test]
    fn uncapped_size_is_rounded_down_to_cents() {
        let engine = SizingEngine::default();
        let sizing = engine
            .size(
                dec!(10000),
                dec!(0.07),
                StopSource::Volatility,
                dec!(0.33),
                dec!(30),
                MarketRegime::RiskOff,
            )
            .unwrap();
        // 0.02 / 0.07 * 10000 = 2857.142857...; * 0.33 = 942.857...; * 0.5 = 471.428...
        assert!(!sizing.capped);
        assert_eq!(sizing.final_size, dec!(471.42));
    }

    #[test]
    fn non_positive_inputs_are_invalid() {
        let engine = SizingEngine::default();
        let zero_portfolio = engine.size(
            Decimal::ZERO,
            dec!(0.05),
            StopSource::Default,
            dec!(0.8),
            dec!(20),
            MarketRegime::RiskOn,
        );
        assert!(matches!(zero_portfolio, Err(SizingError::InvalidInput(_))));

        let zero_stop = engine.size(
            dec!(100000),
            Decimal::ZERO,
            StopSource::Default,
            dec!(0.8),
            dec!(20),
            MarketRegime::RiskOn,
        );
        assert!(matches!(zero_stop, Err(SizingError::InvalidInput(_))));
    }

    #[test]
    fn confidence_never_shrinks_size() {
        let engine = SizingEngine::default();
        for portfolio in [dec!(5000), dec!(100000), dec!(2500000)] {
            for stop in [dec!(0.03), dec!(0.05), dec!(0.10)] {
                for vix in [dec!(12), dec!(28), dec!(50)] {
                    let mut previous = Decimal::ZERO;
                    for step in 0..=20 {
                        let confidence = Decimal::new(step * 5, 2);
                        let sizing = engine
                            .size(
                                portfolio,
                                stop,
                                StopSource::Default,
                                confidence,
                                vix,
                                MarketRegime::RiskOn,
                            )
                            .unwrap();
                        assert!(sizing.final_size >= previous);
                        assert!(sizing.final_size <= portfolio * dec!(0.10));
                        previous = sizing.final_size;
                    }
                }
            }
        }
    }

    #[test]
    fn stop_distance_prefers_atr_then_level_then_default() {
        let engine = SizingEngine::default();
        let mut indicators = TechnicalIndicators {
            atr: Some(dec!(4.5)),
            support: Some(dec!(145)),
            ..TechnicalIndicators::default()
        };
        // 2 * 4.5 / 150 = 0.06
        assert_eq!(
            engine.stop_distance(dec!(150), Side::Long, &indicators),
            (dec!(0.06), StopSource::Volatility)
        );

        indicators.atr = None;
        // 145 * 0.99 = 143.55; (150 - 143.55) / 150 = 0.043
        assert_eq!(
            engine.stop_distance(dec!(150), Side::Long, &indicators),
            (dec!(0.043), StopSource::Level)
        );

        // support is above a short's entry: not protective, falls through
        assert_eq!(
            engine.stop_distance(dec!(150), Side::Short, &indicators),
            (dec!(0.05), StopSource::Default)
        );
    }

    #[test]
    fn stop_distance_is_clamped() {
        let engine = SizingEngine::default();
        let tight = TechnicalIndicators {
            atr: Some(dec!(0.5)),
            ..TechnicalIndicators::default()
        };
        assert_eq!(engine.stop_distance(dec!(100), Side::Long, &tight).0, dec!(0.03));

        let wide = TechnicalIndicators {
            support: Some(dec!(60)),
            ..TechnicalIndicators::default()
        };
        assert_eq!(engine.stop_distance(dec!(100), Side::Long, &wide).0, dec!(0.10));
    }

    #[test]
    fn stop_price_rounds_toward_entry() {
        let engine = SizingEngine::default();
        assert_eq!(engine.stop_price(dec!(150), Side::Long, dec!(0.05)), dec!(142.50));
        assert_eq!(engine.stop_price(dec!(101.11), Side::Long, dec!(0.043)), dec!(96.77));
        assert_eq!(engine.stop_price(dec!(101.11), Side::Short, dec!(0.043)), dec!(105.45));
    }

    #[test]
    fn proposal_uses_market_price() {
        let engine = SizingEngine::default();
        let ctx = market(dec!(150), dec!(18), MarketRegime::Transition);
        let proposal = engine
            .propose(Side::Long, &ctx, dec!(100000), dec!(0.75))
            .unwrap();
        assert_eq!(proposal.position_size, dec!(10000));
        assert_eq!(proposal.stop_loss, Some(dec!(142.50)));
        assert_eq!(proposal.sizing.unwrap().stop_source, StopSource::Default);
    }
}
