use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use tdas_models::context::PortfolioContext;
use tdas_models::decision::{Decision, TradeIntent};
use tdas_models::position::{Position, PositionEvent, PositionStatus, Side};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::LedgerError;

/// Decimal places kept on position quantities. Rounded toward zero so notional never exceeds size.
const QUANTITY_DP: u32 = 6;

#[derive(Debug, Clone, PartialEq)]
pub struct LedgerSettings {
    pub margin_allowance: Decimal,
    /// Largest allowed `|entry - stop| / entry`; mirrors the rule gate's bound.
    pub max_stop_distance_pct: Decimal,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            margin_allowance: Decimal::ZERO,
            max_stop_distance_pct: Decimal::new(10, 2),
        }
    }
}

/// Result of applying an approved decision.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Opened(Position),
    Closed(Vec<Position>),
    /// Hold/pass decisions leave the ledger untouched.
    NoAction,
}

/// Virtual portfolio: settled cash plus a book of positions.
///
/// Every position moves `Open → ClosedStop | ClosedManual`; closed positions are terminal
/// and stay in the book for reporting. Each transition queues a [`PositionEvent`],
/// drained with [`ShadowLedger::take_events`].
#[derive(Debug, Clone)]
pub struct ShadowLedger {
    settings: LedgerSettings,
    /// Starting cash plus realized P&L.
    cash: Decimal,
    day_start_equity: Decimal,
    positions: Vec<Position>,
    pending: Vec<PositionEvent>,
}

impl ShadowLedger {
    pub fn new(starting_cash: Decimal, settings: LedgerSettings) -> Self {
        Self::restore(starting_cash, starting_cash, Vec::new(), settings)
    }

    /// Rebuild a ledger from persisted state.
    pub fn restore(
        cash: Decimal,
        day_start_equity: Decimal,
        positions: Vec<Position>,
        settings: LedgerSettings,
    ) -> Self {
        Self {
            settings,
            cash,
            day_start_equity,
            positions,
            pending: Vec::new(),
        }
    }

    pub fn cash(&self) -> Decimal {
        self.cash
    }

    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    pub fn position(&self, id: Uuid) -> Option<&Position> {
        self.positions.iter().find(|p| p.id == id)
    }

    pub fn open_positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.iter().filter(|p| p.is_open())
    }

    pub fn open_notional(&self) -> Decimal {
        self.open_positions().map(Position::notional).sum()
    }

    /// Headroom for new positions: settled cash plus margin, less what open positions hold.
    pub fn capacity(&self) -> Decimal {
        self.cash + self.settings.margin_allowance - self.open_notional()
    }

    pub fn take_events(&mut self) -> Vec<PositionEvent> {
        std::mem::take(&mut self.pending)
    }

    pub fn snapshot(&self) -> PortfolioContext {
        let open_notional = self.open_notional();
        let unrealized: Decimal = self.open_positions().map(|p| p.unrealized_pnl).sum();
        let total_value = self.cash + unrealized;
        let daily_pnl_pct = if self.day_start_equity > Decimal::ZERO {
            (total_value - self.day_start_equity) / self.day_start_equity
        } else {
            Decimal::ZERO
        };
        PortfolioContext {
            total_value,
            available_cash: self.cash - open_notional,
            daily_pnl_pct,
            open_positions: self
                .open_positions()
                .map(Position::to_open_position)
                .collect(),
        }
    }

    /// Start a new trading day: the current total value becomes the daily P&L baseline.
    pub fn roll_day(&mut self) {
        self.day_start_equity = self.snapshot().total_value;
        info!(baseline = %self.day_start_equity, "Rolled trading day");
    }

    /// Open a position for an approved buy/sell decision at `entry_price`.
    pub fn open(
        &mut self,
        decision: &Decision,
        entry_price: Decimal,
        at: DateTime<Utc>,
    ) -> Result<Position, LedgerError> {
        if !decision.approved {
            return Err(LedgerError::NotExecutable(format!(
                "decision {} was not approved",
                decision.id
            )));
        }
        let side = decision.side().ok_or_else(|| {
            LedgerError::NotExecutable(format!("action {} does not open a position", decision.action))
        })?;
        if entry_price <= Decimal::ZERO {
            return Err(LedgerError::NotExecutable(format!(
                "entry price must be positive, got {entry_price}"
            )));
        }
        if decision.position_size <= Decimal::ZERO {
            return Err(LedgerError::NotExecutable(format!(
                "position size must be positive, got {}",
                decision.position_size
            )));
        }

        let stop_loss = decision
            .stop_loss
            .ok_or_else(|| LedgerError::InvalidStop("no stop-loss set".to_string()))?;
        let protective = match side {
            Side::Long => stop_loss < entry_price,
            Side::Short => stop_loss > entry_price,
        };
        if !protective {
            return Err(LedgerError::InvalidStop(format!(
                "stop {stop_loss} is on the wrong side of entry {entry_price} for a {side:?} position"
            )));
        }
        let distance = (entry_price - stop_loss).abs() / entry_price;
        if distance > self.settings.max_stop_distance_pct {
            return Err(LedgerError::InvalidStop(format!(
                "stop distance {distance} exceeds {}",
                self.settings.max_stop_distance_pct
            )));
        }

        let quantity = (decision.position_size / entry_price)
            .round_dp_with_strategy(QUANTITY_DP, RoundingStrategy::ToZero);
        if quantity.is_zero() {
            return Err(LedgerError::NotExecutable(format!(
                "size {} buys no quantity at {entry_price}",
                decision.position_size
            )));
        }

        let notional = quantity * entry_price;
        let available = self.capacity();
        if notional > available {
            return Err(LedgerError::InsufficientFunds {
                required: notional,
                available,
            });
        }

        let position = Position {
            id: Uuid::new_v4(),
            decision_id: decision.id,
            instrument: decision.instrument.clone(),
            side,
            quantity,
            entry_price,
            entry_time: at,
            stop_loss,
            last_price: entry_price,
            unrealized_pnl: Decimal::ZERO,
            exit_price: None,
            exit_time: None,
            status: PositionStatus::Open,
            realized_pnl: None,
        };
        info!(
            position_id = %position.id,
            instrument = %position.instrument,
            side = ?side,
            quantity = %quantity,
            entry_price = %entry_price,
            stop_loss = %stop_loss,
            "Opened shadow position"
        );
        self.pending.push(PositionEvent::Opened {
            position: position.clone(),
        });
        self.positions.push(position.clone());
        Ok(position)
    }

    /// Revalue every open position in `instrument` at `price`.
    ///
    /// Positions whose stop is crossed close as `ClosedStop` with P&L fixed at the stop price,
    /// not the tick price. Returns the positions closed by this tick.
    pub fn mark_to_market(
        &mut self,
        instrument: &str,
        price: Decimal,
        at: DateTime<Utc>,
    ) -> Vec<Position> {
        let mut closed = Vec::new();
        for position in self
            .positions
            .iter_mut()
            .filter(|p| p.is_open() && p.instrument == instrument)
        {
            if position.stop_breached(price) {
                let exit_price = position.stop_loss;
                let realized = position.pnl_at(exit_price);
                position.last_price = price;
                position.unrealized_pnl = Decimal::ZERO;
                position.exit_price = Some(exit_price);
                position.exit_time = Some(at);
                position.realized_pnl = Some(realized);
                position.status = PositionStatus::ClosedStop;
                self.cash += realized;

                info!(
                    position_id = %position.id,
                    instrument = %instrument,
                    tick_price = %price,
                    exit_price = %exit_price,
                    realized_pnl = %realized,
                    "Stop-loss triggered"
                );
                self.pending.push(PositionEvent::ClosedStop {
                    position_id: position.id,
                    instrument: instrument.to_string(),
                    tick_price: price,
                    exit_price,
                    realized_pnl: realized,
                    at,
                });
                closed.push(position.clone());
            } else {
                position.last_price = price;
                position.unrealized_pnl = position.pnl_at(price);
                debug!(
                    position_id = %position.id,
                    price = %price,
                    unrealized_pnl = %position.unrealized_pnl,
                    "Marked position"
                );
                self.pending.push(PositionEvent::Marked {
                    position_id: position.id,
                    instrument: instrument.to_string(),
                    price,
                    unrealized_pnl: position.unrealized_pnl,
                    at,
                });
            }
        }
        closed
    }

    /// Close an open position at `exit_price`.
    pub fn manual_close(
        &mut self,
        position_id: Uuid,
        exit_price: Decimal,
        at: DateTime<Utc>,
    ) -> Result<Position, LedgerError> {
        let position = self
            .positions
            .iter_mut()
            .find(|p| p.id == position_id)
            .ok_or(LedgerError::UnknownPosition(position_id))?;
        if !position.is_open() {
            return Err(LedgerError::AlreadyClosed(position_id));
        }

        let realized = position.pnl_at(exit_price);
        position.last_price = exit_price;
        position.unrealized_pnl = Decimal::ZERO;
        position.exit_price = Some(exit_price);
        position.exit_time = Some(at);
        position.realized_pnl = Some(realized);
        position.status = PositionStatus::ClosedManual;
        self.cash += realized;

        info!(
            position_id = %position_id,
            instrument = %position.instrument,
            exit_price = %exit_price,
            realized_pnl = %realized,
            "Closed shadow position"
        );
        self.pending.push(PositionEvent::ClosedManual {
            position_id,
            instrument: position.instrument.clone(),
            exit_price,
            realized_pnl: realized,
            at,
        });
        Ok(position.clone())
    }

    /// Execute an approved decision: exits close opposing positions, entries open one.
    pub fn apply(
        &mut self,
        decision: &Decision,
        price: Decimal,
        at: DateTime<Utc>,
    ) -> Result<ApplyOutcome, LedgerError> {
        if !decision.approved {
            return Err(LedgerError::NotExecutable(format!(
                "decision {} was not approved",
                decision.id
            )));
        }
        match decision.intent {
            TradeIntent::Stand => Ok(ApplyOutcome::NoAction),
            TradeIntent::Entry | TradeIntent::Increase => {
                let entry_price = decision.entry_price.unwrap_or(price);
                self.open(decision, entry_price, at).map(ApplyOutcome::Opened)
            }
            TradeIntent::Exit => {
                let side = decision.side().ok_or_else(|| {
                    LedgerError::NotExecutable(format!("exit with action {}", decision.action))
                })?;
                let targets: Vec<Uuid> = self
                    .open_positions()
                    .filter(|p| p.instrument == decision.instrument && p.side == side.opposite())
                    .map(|p| p.id)
                    .collect();
                let mut closed = Vec::with_capacity(targets.len());
                for id in targets {
                    closed.push(self.manual_close(id, price, at)?);
                }
                Ok(ApplyOutcome::Closed(closed))
            }
        }
    }
}
