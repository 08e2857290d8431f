use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::OpenPosition;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

/// `Open` is the only non-terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    ClosedStop,
    ClosedManual,
}

/// A virtual position held by the shadow ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub id: Uuid,
    /// Decision that opened this position.
    pub decision_id: Uuid,
    pub instrument: String,
    pub side: Side,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub entry_time: DateTime<Utc>,
    pub stop_loss: Decimal,
    /// Last mark-to-market price seen while open.
    pub last_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub exit_price: Option<Decimal>,
    pub exit_time: Option<DateTime<Utc>>,
    pub status: PositionStatus,
    pub realized_pnl: Option<Decimal>,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Capital committed at entry.
    pub fn notional(&self) -> Decimal {
        self.quantity * self.entry_price
    }

    /// P&L if the position were valued at `price`.
    pub fn pnl_at(&self, price: Decimal) -> Decimal {
        match self.side {
            Side::Long => (price - self.entry_price) * self.quantity,
            Side::Short => (self.entry_price - price) * self.quantity,
        }
    }

    /// Long stops trigger at or below the stop, short stops at or above.
    pub fn stop_breached(&self, price: Decimal) -> bool {
        match self.side {
            Side::Long => price <= self.stop_loss,
            Side::Short => price >= self.stop_loss,
        }
    }

    pub fn to_open_position(&self) -> OpenPosition {
        OpenPosition {
            position_id: self.id,
            instrument: self.instrument.clone(),
            side: self.side,
            quantity: self.quantity,
            entry_price: self.entry_price,
            stop_loss: self.stop_loss,
            notional: self.notional(),
            unrealized_pnl: self.unrealized_pnl,
        }
    }
}

/// Append-only record of a position transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PositionEvent {
    Opened {
        position: Position,
    },
    Marked {
        position_id: Uuid,
        instrument: String,
        price: Decimal,
        unrealized_pnl: Decimal,
        at: DateTime<Utc>,
    },
    ClosedStop {
        position_id: Uuid,
        instrument: String,
        /// The tick that crossed the stop.
        tick_price: Decimal,
        exit_price: Decimal,
        realized_pnl: Decimal,
        at: DateTime<Utc>,
    },
    ClosedManual {
        position_id: Uuid,
        instrument: String,
        exit_price: Decimal,
        realized_pnl: Decimal,
        at: DateTime<Utc>,
    },
}

impl PositionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            PositionEvent::Opened { .. } => "opened",
            PositionEvent::Marked { .. } => "marked",
            PositionEvent::ClosedStop { .. } => "closed_stop",
            PositionEvent::ClosedManual { .. } => "closed_manual",
        }
    }

    pub fn position_id(&self) -> Uuid {
        match self {
            PositionEvent::Opened { position } => position.id,
            PositionEvent::Marked { position_id, .. }
            | PositionEvent::ClosedStop { position_id, .. }
            | PositionEvent::ClosedManual { position_id, .. } => *position_id,
        }
    }

    pub fn instrument(&self) -> &str {
        match self {
            PositionEvent::Opened { position } => &position.instrument,
            PositionEvent::Marked { instrument, .. }
            | PositionEvent::ClosedStop { instrument, .. }
            | PositionEvent::ClosedManual { instrument, .. } => instrument,
        }
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            PositionEvent::Opened { position } => position.entry_time,
            PositionEvent::Marked { at, .. }
            | PositionEvent::ClosedStop { at, .. }
            | PositionEvent::ClosedManual { at, .. } => *at,
        }
    }
}
