//! Structured status events for operators and log pipelines.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::VecDeque;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventSeverity {
    Info,
    Warning,
    Error,
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    OpportunityRejected {
        pair: String,
        reason: String,
    },
    PositionOpened {
        position_id: String,
        pair: String,
        direction: String,
        notional: Decimal,
        funding_rate: Decimal,
    },
    PositionClosed {
        position_id: String,
        pair: String,
        reason: String,
        realized_pnl: Decimal,
    },
    PositionFailed {
        position_id: String,
        pair: String,
        reason: String,
    },
    ManualInterventionRequired {
        position_id: String,
        pair: String,
        reason: String,
    },
    ForceCloseAll {
        drawdown: Decimal,
    },
    FundingAccrued {
        position_id: String,
        amount: Decimal,
        funding_rate: Decimal,
        /// Settlements covered by this booking
        periods: u32,
    },
    PersistenceFailure {
        detail: String,
    },
    ShutdownStarted {
        active_positions: usize,
    },
    ShutdownComplete {
        remaining_positions: usize,
        cumulative_realized_pnl: Decimal,
    },
}

impl EventKind {
    fn severity(&self) -> EventSeverity {
        match self {
            EventKind::OpportunityRejected { .. }
            | EventKind::PositionOpened { .. }
            | EventKind::PositionClosed { .. }
            | EventKind::FundingAccrued { .. }
            | EventKind::ShutdownStarted { .. } => EventSeverity::Info,
            EventKind::PositionFailed { .. } | EventKind::ShutdownComplete { .. } => EventSeverity::Warning,
            EventKind::ManualInterventionRequired { .. }
            | EventKind::ForceCloseAll { .. }
            | EventKind::PersistenceFailure { .. } => EventSeverity::Error,
        }
    }
}

/// A timestamped status event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusEvent {
    pub timestamp: DateTime<Utc>,
    pub severity: EventSeverity,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl StatusEvent {
    pub fn new(kind: EventKind, timestamp: DateTime<Utc>) -> Self {
        let mut severity = kind.severity();
        if let EventKind::ShutdownComplete { remaining_positions: 0, .. } = kind {
            severity = EventSeverity::Info;
        }
        Self {
            timestamp,
            severity,
            kind,
        }
    }

    /// Emit as structured log for workflow parsing.
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();

        match self.severity {
            EventSeverity::Info => info!(target: "status_event", "STATUS_EVENT: {}", json),
            EventSeverity::Warning => warn!(target: "status_event", "STATUS_EVENT: {}", json),
            EventSeverity::Error => error!(target: "status_event", "STATUS_EVENT: {}", json),
        }
    }
}

/// Most recent events, oldest dropped first.
#[derive(Debug)]
pub struct EventLog {
    events: VecDeque<StatusEvent>,
    capacity: usize,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Emit and retain an event.
    pub fn record(&mut self, event: StatusEvent) {
        event.emit();
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn recent(&self) -> Vec<StatusEvent> {
        self.events.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
