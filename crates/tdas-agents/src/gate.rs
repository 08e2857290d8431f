use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use tdas_models::config::GateConfig;
use tdas_models::context::{MarketContext, MarketRegime, PortfolioContext};
use tdas_models::decision::{
    Decision, DraftDecision, ProposedTerms, RuleCheck, RuleId, TradeIntent, TradeTerms,
};
use tdas_models::opinion::Action;
use tracing::{info, warn};
use uuid::Uuid;

/// Result of validating one set of trade terms.
#[derive(Debug, Clone, PartialEq)]
pub struct GateVerdict {
    pub approved: bool,
    /// Failing rules in rule order.
    pub violated_rules: Vec<RuleId>,
    /// One entry per rule, in rule order.
    pub checks: Vec<RuleCheck>,
    pub intent: TradeIntent,
}

/// Stateless validator for the eight portfolio-safety rules.
///
/// Every rule is evaluated on every call so the full list of checks is always
/// available; any failing rule rejects the decision. Rules 1-4 apply to buy/sell,
/// rules 5-8 only to actions that put new capital at risk.
#[derive(Debug, Clone, Default)]
pub struct RuleGate {
    config: GateConfig,
}

fn check(rule: RuleId, applicable: bool, passed: bool, detail: String) -> RuleCheck {
    RuleCheck {
        rule,
        applicable,
        passed: !applicable || passed,
        detail,
    }
}

impl RuleGate {
    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn validate(
        &self,
        terms: &TradeTerms<'_>,
        portfolio: &PortfolioContext,
        market: &MarketContext,
    ) -> GateVerdict {
        let intent = TradeIntent::classify(terms.action, terms.instrument, portfolio);
        let trading = terms.action.is_trade();
        let entering = intent.is_entering();
        let cfg = &self.config;
        let value = portfolio.total_value;
        let exempt = format!("not applicable to {} ({:?})", terms.action, intent);

        let checks = vec![
            self.position_limit(terms, value, trading, &exempt),
            self.low_confidence_size(terms, value, trading, &exempt),
            if trading {
                check(
                    RuleId::StopLossRequired,
                    true,
                    terms.stop_loss.is_some(),
                    match terms.stop_loss {
                        Some(stop) => format!("stop-loss set at {stop}"),
                        None => "no stop-loss set".to_string(),
                    },
                )
            } else {
                check(RuleId::StopLossRequired, false, true, exempt.clone())
            },
            self.stop_loss_distance(terms, market, trading, &exempt),
            self.earnings_blackout(market, entering, &exempt),
            if entering {
                check(
                    RuleId::DailyLossLimit,
                    true,
                    portfolio.daily_pnl_pct >= cfg.daily_loss_limit_pct,
                    format!(
                        "daily P&L {} vs limit {}",
                        portfolio.daily_pnl_pct, cfg.daily_loss_limit_pct
                    ),
                )
            } else {
                check(RuleId::DailyLossLimit, false, true, exempt.clone())
            },
            if entering {
                check(
                    RuleId::ExtremeVolatility,
                    true,
                    market.volatility_index <= cfg.extreme_volatility,
                    format!(
                        "volatility index {} vs ceiling {}",
                        market.volatility_index, cfg.extreme_volatility
                    ),
                )
            } else {
                check(RuleId::ExtremeVolatility, false, true, exempt.clone())
            },
            if entering {
                let risk_off = market.market_regime == MarketRegime::RiskOff;
                check(
                    RuleId::RiskOffVolatility,
                    true,
                    !(risk_off && market.volatility_index > cfg.risk_off_volatility),
                    format!(
                        "regime {:?}, volatility index {} vs risk-off ceiling {}",
                        market.market_regime, market.volatility_index, cfg.risk_off_volatility
                    ),
                )
            } else {
                check(RuleId::RiskOffVolatility, false, true, exempt)
            },
        ];

        let violated_rules: Vec<RuleId> = checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.rule)
            .collect();
        GateVerdict {
            approved: violated_rules.is_empty(),
            violated_rules,
            checks,
            intent,
        }
    }

    fn position_limit(
        &self,
        terms: &TradeTerms<'_>,
        portfolio_value: Decimal,
        trading: bool,
        exempt: &str,
    ) -> RuleCheck {
        if !trading {
            return check(RuleId::PositionLimit, false, true, exempt.to_string());
        }
        let limit = portfolio_value * self.config.max_position_pct;
        check(
            RuleId::PositionLimit,
            true,
            terms.position_size <= limit,
            format!("size {} vs limit {limit}", terms.position_size),
        )
    }

    fn low_confidence_size(
        &self,
        terms: &TradeTerms<'_>,
        portfolio_value: Decimal,
        trading: bool,
        exempt: &str,
    ) -> RuleCheck {
        if !trading {
            return check(RuleId::LowConfidenceSize, false, true, exempt.to_string());
        }
        if terms.weighted_confidence >= self.config.low_confidence_threshold {
            return check(
                RuleId::LowConfidenceSize,
                true,
                true,
                format!(
                    "confidence {} at or above {}",
                    terms.weighted_confidence, self.config.low_confidence_threshold
                ),
            );
        }
        let limit = portfolio_value * self.config.low_confidence_max_position_pct;
        check(
            RuleId::LowConfidenceSize,
            true,
            terms.position_size <= limit,
            format!(
                "confidence {} below {}: size {} vs limit {limit}",
                terms.weighted_confidence,
                self.config.low_confidence_threshold,
                terms.position_size
            ),
        )
    }

    fn stop_loss_distance(
        &self,
        terms: &TradeTerms<'_>,
        market: &MarketContext,
        trading: bool,
        exempt: &str,
    ) -> RuleCheck {
        if !trading {
            return check(RuleId::StopLossDistance, false, true, exempt.to_string());
        }
        let Some(stop) = terms.stop_loss else {
            return check(
                RuleId::StopLossDistance,
                true,
                true,
                "no stop-loss to measure".to_string(),
            );
        };
        let entry = terms.entry_price.unwrap_or(market.price);
        if entry <= Decimal::ZERO {
            return check(
                RuleId::StopLossDistance,
                true,
                false,
                format!("entry price {entry} is not positive"),
            );
        }
        let distance = (entry - stop).abs() / entry;
        check(
            RuleId::StopLossDistance,
            true,
            distance <= self.config.max_stop_distance_pct,
            format!(
                "|{entry} - {stop}| / {entry} = {} vs limit {}",
                distance.round_dp(4),
                self.config.max_stop_distance_pct
            ),
        )
    }

    fn earnings_blackout(&self, market: &MarketContext, entering: bool, exempt: &str) -> RuleCheck {
        if !entering {
            return check(RuleId::EarningsBlackout, false, true, exempt.to_string());
        }
        let Some(earnings) = market.earnings_date else {
            return check(
                RuleId::EarningsBlackout,
                true,
                true,
                "no earnings date known".to_string(),
            );
        };
        let today = market.as_of.date_naive();
        let start = earnings - ChronoDuration::days(self.config.earnings_days_before);
        let end = earnings + ChronoDuration::days(self.config.earnings_days_after);
        let inside = start <= today && today <= end;
        check(
            RuleId::EarningsBlackout,
            true,
            !inside,
            format!("as of {today}, earnings {earnings}, blackout {start} to {end}"),
        )
    }

    /// Gate a draft. Rejections become a zero-size pass; approved non-trades carry no size.
    pub fn finalize(
        &self,
        draft: DraftDecision,
        portfolio: &PortfolioContext,
        market: &MarketContext,
    ) -> Decision {
        let verdict = self.validate(&draft.terms(), portfolio, market);
        let proposed = ProposedTerms {
            action: draft.action,
            position_size: draft.position_size,
            stop_loss: draft.stop_loss,
        };

        let (action, position_size, stop_loss) = if !verdict.approved {
            warn!(
                instrument = %draft.instrument,
                proposed_action = %draft.action,
                violated_rules = ?verdict.violated_rules,
                "Decision rejected by rule gate"
            );
            (Action::Pass, Decimal::ZERO, None)
        } else if draft.action.is_trade() {
            info!(
                instrument = %draft.instrument,
                action = %draft.action,
                size = %draft.position_size,
                intent = ?verdict.intent,
                "Decision approved"
            );
            (draft.action, draft.position_size, draft.stop_loss)
        } else {
            info!(instrument = %draft.instrument, action = %draft.action, "Decision approved with no trade");
            (draft.action, Decimal::ZERO, None)
        };

        Decision {
            id: Uuid::new_v4(),
            instrument: draft.instrument,
            action,
            weighted_confidence: draft.weighted_confidence,
            position_size,
            stop_loss,
            entry_price: draft.entry_price,
            approved: verdict.approved,
            violated_rules: verdict.violated_rules,
            rule_checks: verdict.checks,
            intent: if verdict.approved {
                verdict.intent
            } else {
                TradeIntent::Stand
            },
            execution_path: None,
            route_reason: None,
            proposed,
            provenance: draft.provenance,
            decided_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{draft, market};
    use chrono::{NaiveDate, TimeZone};
    use rust_decimal_macros::dec;

    fn gate() -> RuleGate {
        RuleGate::default()
    }

    fn portfolio() -> PortfolioContext {
        PortfolioContext::cash_only(dec!(100000))
    }

    fn terms(
        action: Action,
        confidence: Decimal,
        size: Decimal,
        stop: Option<Decimal>,
    ) -> TradeTerms<'static> {
        TradeTerms {
            instrument: "AAPL",
            action,
            weighted_confidence: confidence,
            position_size: size,
            stop_loss: stop,
            entry_price: None,
        }
    }

    #[test]
    fn all_rules_evaluated_in_order() {
        let verdict = gate().validate(
            &terms(Action::Buy, dec!(0.77), dec!(10000), Some(dec!(142.50))),
            &portfolio(),
            &market("AAPL", dec!(150), dec!(18)),
        );
        assert!(verdict.approved);
        let rules: Vec<RuleId> = verdict.checks.iter().map(|c| c.rule).collect();
        assert_eq!(rules, RuleId::ALL.to_vec());
        assert!(verdict.checks.iter().all(|c| c.applicable));
        assert_eq!(verdict.intent, TradeIntent::Entry);
    }

    #[test]
    fn position_limit_boundary() {
        let ctx = market("AAPL", dec!(150), dec!(18));
        let at_limit = gate().validate(
            &terms(Action::Buy, dec!(0.9), dec!(30000), Some(dec!(142.50))),
            &portfolio(),
            &ctx,
        );
        assert!(at_limit.approved);

        let over = gate().validate(
            &terms(Action::Buy, dec!(0.9), dec!(30000.01), Some(dec!(142.50))),
            &portfolio(),
            &ctx,
        );
        assert_eq!(over.violated_rules, vec![RuleId::PositionLimit]);
    }

    #[test]
    fn missing_stop_fails_rule_three_only() {
        let verdict = gate().validate(
            &terms(Action::Sell, dec!(0.8), dec!(5000), None),
            &portfolio(),
            &market("AAPL", dec!(150), dec!(18)),
        );
        assert_eq!(verdict.violated_rules, vec![RuleId::StopLossRequired]);
    }

    #[test]
    fn entry_price_overrides_market_price_for_distance() {
        let mut t = terms(Action::Buy, dec!(0.8), dec!(5000), Some(dec!(90)));
        t.entry_price = Some(dec!(100));
        let verdict = gate().validate(&t, &portfolio(), &market("AAPL", dec!(120), dec!(18)));
        assert!(verdict.approved);
    }

    #[test]
    fn earnings_blackout_window() {
        let mut ctx = market("AAPL", dec!(150), dec!(18));
        ctx.earnings_date = NaiveDate::from_ymd_opt(2026, 3, 5);
        let buy = terms(Action::Buy, dec!(0.8), dec!(5000), Some(dec!(142.50)));

        for (day, blocked) in [(2, false), (3, true), (5, true), (6, true), (7, false)] {
            ctx.as_of = Utc.with_ymd_and_hms(2026, 3, day, 15, 0, 0).unwrap();
            let verdict = gate().validate(&buy, &portfolio(), &ctx);
            assert_eq!(
                verdict.violated_rules.contains(&RuleId::EarningsBlackout),
                blocked,
                "day {day}"
            );
        }
    }

    #[test]
    fn volatility_rules() {
        let buy = terms(Action::Buy, dec!(0.8), dec!(5000), Some(dec!(142.50)));

        let extreme = gate().validate(&buy, &portfolio(), &market("AAPL", dec!(150), dec!(41)));
        assert_eq!(extreme.violated_rules, vec![RuleId::ExtremeVolatility]);

        let at_ceiling = gate().validate(&buy, &portfolio(), &market("AAPL", dec!(150), dec!(40)));
        assert!(at_ceiling.approved);

        let mut risk_off = market("AAPL", dec!(150), dec!(31));
        risk_off.market_regime = MarketRegime::RiskOff;
        let verdict = gate().validate(&buy, &portfolio(), &risk_off);
        assert_eq!(verdict.violated_rules, vec![RuleId::RiskOffVolatility]);

        risk_off.volatility_index = dec!(30);
        assert!(gate().validate(&buy, &portfolio(), &risk_off).approved);
    }

    #[test]
    fn hold_is_exempt_from_every_rule() {
        let mut ctx = market("AAPL", dec!(150), dec!(55));
        ctx.market_regime = MarketRegime::RiskOff;
        let mut p = portfolio();
        p.daily_pnl_pct = dec!(-0.2);

        let verdict = gate().validate(&terms(Action::Hold, dec!(0.1), dec!(99999), None), &p, &ctx);
        assert!(verdict.approved);
        assert_eq!(verdict.checks.len(), 8);
        assert!(verdict.checks.iter().all(|c| !c.applicable && c.passed));
        assert_eq!(verdict.intent, TradeIntent::Stand);
    }

    #[test]
    fn exit_is_exempt_from_entry_rules_only() {
        let mut p = portfolio();
        p.daily_pnl_pct = dec!(-0.08);
        p.open_positions.push(tdas_models::context::OpenPosition {
            position_id: Uuid::new_v4(),
            instrument: "AAPL".to_string(),
            side: tdas_models::position::Side::Long,
            quantity: dec!(10),
            entry_price: dec!(150),
            stop_loss: dec!(142.50),
            notional: dec!(1500),
            unrealized_pnl: Decimal::ZERO,
        });

        let sell = terms(Action::Sell, dec!(0.8), dec!(1500), Some(dec!(157.50)));
        let verdict = gate().validate(&sell, &p, &market("AAPL", dec!(150), dec!(45)));
        assert_eq!(verdict.intent, TradeIntent::Exit);
        assert!(verdict.approved);

        let sell_without_stop = terms(Action::Sell, dec!(0.8), dec!(1500), None);
        let verdict = gate().validate(&sell_without_stop, &p, &market("AAPL", dec!(150), dec!(45)));
        assert_eq!(verdict.violated_rules, vec![RuleId::StopLossRequired]);
    }

    #[test]
    fn rejection_forces_zero_size_pass() {
        let mut p = portfolio();
        p.daily_pnl_pct = dec!(-0.06);
        let d = draft(Action::Buy, dec!(0.77), dec!(10000), Some(dec!(142.50)));

        let decision = gate().finalize(d, &p, &market("AAPL", dec!(150), dec!(18)));
        assert!(!decision.approved);
        assert_eq!(decision.action, Action::Pass);
        assert_eq!(decision.position_size, Decimal::ZERO);
        assert_eq!(decision.stop_loss, None);
        assert_eq!(decision.violated_rules, vec![RuleId::DailyLossLimit]);
        assert_eq!(decision.proposed.action, Action::Buy);
        assert_eq!(decision.proposed.position_size, dec!(10000));
    }

    #[test]
    fn approved_decision_revalidates() {
        let ctx = market("AAPL", dec!(150), dec!(18));
        let d = draft(Action::Buy, dec!(0.77), dec!(10000), Some(dec!(142.50)));
        let decision = gate().finalize(d, &portfolio(), &ctx);
        assert!(decision.approved);

        let again = gate().validate(&decision.terms(), &portfolio(), &ctx);
        assert!(again.approved);
        assert_eq!(again.checks, decision.rule_checks);
    }

    #[test]
    fn approved_hold_carries_no_size() {
        let d = draft(Action::Hold, dec!(0.5), dec!(10000), Some(dec!(142.50)));
        let decision = gate().finalize(d, &portfolio(), &market("AAPL", dec!(150), dec!(18)));
        assert!(decision.approved);
        assert_eq!(decision.action, Action::Hold);
        assert_eq!(decision.position_size, Decimal::ZERO);
        assert_eq!(decision.proposed.position_size, dec!(10000));
    }
}
