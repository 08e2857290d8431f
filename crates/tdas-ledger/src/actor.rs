use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tdas_models::context::PortfolioContext;
use tdas_models::decision::Decision;
use tdas_models::position::{Position, PositionEvent};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::journal::EventSink;
use crate::ledger::{ApplyOutcome, ShadowLedger};

enum Command {
    Apply {
        decision: Box<Decision>,
        price: Decimal,
        reply: oneshot::Sender<Result<ApplyOutcome, LedgerError>>,
    },
    Open {
        decision: Box<Decision>,
        entry_price: Decimal,
        reply: oneshot::Sender<Result<Position, LedgerError>>,
    },
    Mark {
        instrument: String,
        price: Decimal,
        reply: oneshot::Sender<Vec<Position>>,
    },
    ManualClose {
        position_id: Uuid,
        exit_price: Decimal,
        reply: oneshot::Sender<Result<Position, LedgerError>>,
    },
    Positions {
        reply: oneshot::Sender<Vec<Position>>,
    },
    RollDay {
        reply: oneshot::Sender<()>,
    },
}

/// Channel capacities for the ledger actor.
#[derive(Debug, Clone, Copy)]
pub struct ChannelSizes {
    pub commands: usize,
    pub events: usize,
}

impl Default for ChannelSizes {
    fn default() -> Self {
        Self {
            commands: 64,
            events: 256,
        }
    }
}

/// Handle to the task that owns the shadow ledger.
///
/// Every mutation is a message to one task, so writes are serialized.
/// Reads go through a `watch` channel that always holds the snapshot
/// published after the last completed mutation.
#[derive(Clone)]
pub struct LedgerHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<PortfolioContext>,
    events: broadcast::Sender<PositionEvent>,
}

impl LedgerHandle {
    /// Move `ledger` into a new task. The task stops when `cancel` fires or every handle is dropped,
    /// and yields the ledger back through the join handle.
    pub fn spawn(
        ledger: ShadowLedger,
        sink: Option<Arc<dyn EventSink>>,
        cancel: CancellationToken,
        sizes: ChannelSizes,
    ) -> (Self, JoinHandle<ShadowLedger>) {
        let (command_tx, command_rx) = mpsc::channel(sizes.commands);
        let (snapshot_tx, snapshot_rx) = watch::channel(ledger.snapshot());
        let (event_tx, _) = broadcast::channel(sizes.events);

        let actor = LedgerActor {
            ledger,
            sink,
            snapshot: snapshot_tx,
            events: event_tx.clone(),
        };
        let task = tokio::spawn(actor.run(command_rx, cancel));

        (
            Self {
                commands: command_tx,
                snapshot: snapshot_rx,
                events: event_tx,
            },
            task,
        )
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, LedgerError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| LedgerError::Closed)?;
        rx.await.map_err(|_| LedgerError::Closed)
    }

    /// Latest consistent portfolio snapshot. Never waits on the writer.
    pub fn snapshot(&self) -> PortfolioContext {
        self.snapshot.borrow().clone()
    }

    /// Subscribe to position events published after each mutation.
    pub fn subscribe(&self) -> broadcast::Receiver<PositionEvent> {
        self.events.subscribe()
    }

    pub async fn apply(
        &self,
        decision: &Decision,
        price: Decimal,
    ) -> Result<ApplyOutcome, LedgerError> {
        self.request(|reply| Command::Apply {
            decision: Box::new(decision.clone()),
            price,
            reply,
        })
        .await?
    }

    pub async fn open(&self, decision: &Decision, entry_price: Decimal) -> Result<Position, LedgerError> {
        self.request(|reply| Command::Open {
            decision: Box::new(decision.clone()),
            entry_price,
            reply,
        })
        .await?
    }

    /// Returns the positions the tick closed at their stop.
    pub async fn mark_to_market(
        &self,
        instrument: &str,
        price: Decimal,
    ) -> Result<Vec<Position>, LedgerError> {
        self.request(|reply| Command::Mark {
            instrument: instrument.to_string(),
            price,
            reply,
        })
        .await
    }

    pub async fn manual_close(
        &self,
        position_id: Uuid,
        exit_price: Decimal,
    ) -> Result<Position, LedgerError> {
        self.request(|reply| Command::ManualClose {
            position_id,
            exit_price,
            reply,
        })
        .await?
    }

    /// Every position, open and closed.
    pub async fn positions(&self) -> Result<Vec<Position>, LedgerError> {
        self.request(|reply| Command::Positions { reply }).await
    }

    pub async fn roll_day(&self) -> Result<(), LedgerError> {
        self.request(|reply| Command::RollDay { reply }).await
    }
}

struct LedgerActor {
    ledger: ShadowLedger,
    sink: Option<Arc<dyn EventSink>>,
    snapshot: watch::Sender<PortfolioContext>,
    events: broadcast::Sender<PositionEvent>,
}

impl LedgerActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        cancel: CancellationToken,
    ) -> ShadowLedger {
        info!("Shadow ledger started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Shadow ledger shutting down");
                    break;
                }
                command = commands.recv() => {
                    match command {
                        Some(command) => self.handle(command),
                        None => {
                            debug!("All ledger handles dropped");
                            break;
                        }
                    }
                }
            }
        }
        self.ledger
    }

    fn handle(&mut self, command: Command) {
        let now = Utc::now();
        match command {
            Command::Apply {
                decision,
                price,
                reply,
            } => {
                let result = self.ledger.apply(&decision, price, now);
                self.publish();
                let _ = reply.send(result);
            }
            Command::Open {
                decision,
                entry_price,
                reply,
            } => {
                let result = self.ledger.open(&decision, entry_price, now);
                self.publish();
                let _ = reply.send(result);
            }
            Command::Mark {
                instrument,
                price,
                reply,
            } => {
                let closed = self.ledger.mark_to_market(&instrument, price, now);
                self.publish();
                let _ = reply.send(closed);
            }
            Command::ManualClose {
                position_id,
                exit_price,
                reply,
            } => {
                let result = self.ledger.manual_close(position_id, exit_price, now);
                self.publish();
                let _ = reply.send(result);
            }
            Command::Positions { reply } => {
                let _ = reply.send(self.ledger.positions().to_vec());
            }
            Command::RollDay { reply } => {
                self.ledger.roll_day();
                self.publish();
                let _ = reply.send(());
            }
        }
    }

    /// Journal and broadcast queued events, then publish the new snapshot.
    fn publish(&mut self) {
        let events = self.ledger.take_events();
        if !events.is_empty() {
            if let Some(sink) = &self.sink {
                if let Err(e) = sink.append_events(&events) {
                    error!(error = %e, count = events.len(), "Failed to journal position events");
                }
            }
            for event in events {
                // No subscribers is not an error.
                let _ = self.events.send(event);
            }
        }
        self.snapshot.send_replace(self.ledger.snapshot());
    }
}
