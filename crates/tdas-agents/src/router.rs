use tdas_models::config::RouterConfig;
use tdas_models::context::{MarketContext, PortfolioContext};
use tdas_models::decision::{Decision, ExecutionPath, RouteReason, TradeIntent};
use tdas_models::position::Side;
use tracing::debug;

/// Everything the router looks at for one decision.
#[derive(Debug, Clone, Copy)]
pub struct RoutingContext<'a> {
    pub decision: &'a Decision,
    pub portfolio: &'a PortfolioContext,
    pub market: &'a MarketContext,
    pub emergency_exit: bool,
}

impl RoutingContext<'_> {
    /// An open position in the instrument whose stop the current price has crossed.
    fn stop_breached(&self) -> bool {
        let price = self.market.price;
        self.portfolio
            .positions_in(&self.decision.instrument)
            .any(|p| match p.side {
                Side::Long => price <= p.stop_loss,
                Side::Short => price >= p.stop_loss,
            })
    }
}

/// Sends capital-preserving decisions down the fast path and everything else
/// down the deliberative one.
#[derive(Debug, Clone, Default)]
pub struct ExecutionRouter {
    config: RouterConfig,
}

impl ExecutionRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self { config }
    }

    pub fn route(&self, ctx: &RoutingContext<'_>) -> (ExecutionPath, RouteReason) {
        let (path, reason) = self.classify(ctx);
        debug!(
            instrument = %ctx.decision.instrument,
            path = ?path,
            reason = ?reason,
            "Routed decision"
        );
        (path, reason)
    }

    fn classify(&self, ctx: &RoutingContext<'_>) -> (ExecutionPath, RouteReason) {
        let decision = ctx.decision;

        // New risk is always deliberated, whatever else is going on.
        match decision.intent {
            TradeIntent::Entry => return (ExecutionPath::Deliberative, RouteReason::NewEntry),
            TradeIntent::Increase => return (ExecutionPath::Deliberative, RouteReason::Rebalance),
            TradeIntent::Exit | TradeIntent::Stand => {}
        }
        if decision.position_size > ctx.portfolio.total_value * self.config.deliberative_size_pct {
            return (ExecutionPath::Deliberative, RouteReason::OversizedPosition);
        }

        if ctx.stop_breached() {
            (ExecutionPath::Fast, RouteReason::StopBreached)
        } else if ctx.portfolio.daily_pnl_pct < self.config.daily_loss_limit_pct {
            (ExecutionPath::Fast, RouteReason::DailyLossLimit)
        } else if ctx.market.volatility_index > self.config.extreme_volatility {
            (ExecutionPath::Fast, RouteReason::ExtremeVolatility)
        } else if ctx.emergency_exit {
            (ExecutionPath::Fast, RouteReason::EmergencyExit)
        } else {
            (ExecutionPath::Deliberative, RouteReason::Default)
        }
    }

    /// Stamp the path on an approved decision. Rejected decisions are not routed.
    pub fn assign(
        &self,
        decision: &mut Decision,
        portfolio: &PortfolioContext,
        market: &MarketContext,
        emergency_exit: bool,
    ) {
        if !decision.approved {
            return;
        }
        let (path, reason) = self.route(&RoutingContext {
            decision,
            portfolio,
            market,
            emergency_exit,
        });
        decision.execution_path = Some(path);
        decision.route_reason = Some(reason);
    }
}
