//! Read-only engine state published for the dashboard.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::allocator::AssetAllocation;
use super::grid::GridLevel;
use super::position::Position;
use super::signal::S1State;
use crate::exchange::{PriceSnapshot, Side};
use crate::risk::HealthAlert;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Placed,
    Cancelled,
    Filled,
    /// Order proposal refused by the risk limiter
    RiskRejected,
    /// Order refused by the exchange
    ExchangeRejected,
    /// Mutation outcome unknown, left for the next reconciliation
    Deferred,
    Degraded,
    Transfer,
    Adopted,
    OrphanCancelled,
    OrphanFlagged,
    Breakout,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Placed => "placed",
            ActionKind::Cancelled => "cancelled",
            ActionKind::Filled => "filled",
            ActionKind::RiskRejected => "risk_rejected",
            ActionKind::ExchangeRejected => "exchange_rejected",
            ActionKind::Deferred => "deferred",
            ActionKind::Degraded => "degraded",
            ActionKind::Transfer => "transfer",
            ActionKind::Adopted => "adopted",
            ActionKind::OrphanCancelled => "orphan_cancelled",
            ActionKind::OrphanFlagged => "orphan_flagged",
            ActionKind::Breakout => "breakout",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "placed" => ActionKind::Placed,
            "cancelled" => ActionKind::Cancelled,
            "filled" => ActionKind::Filled,
            "risk_rejected" => ActionKind::RiskRejected,
            "exchange_rejected" => ActionKind::ExchangeRejected,
            "deferred" => ActionKind::Deferred,
            "degraded" => ActionKind::Degraded,
            "transfer" => ActionKind::Transfer,
            "adopted" => ActionKind::Adopted,
            "orphan_cancelled" => ActionKind::OrphanCancelled,
            "orphan_flagged" => ActionKind::OrphanFlagged,
            "breakout" => ActionKind::Breakout,
            _ => return None,
        })
    }
}

/// One entry of the recent-actions log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub timestamp: DateTime<Utc>,
    pub cycle: u64,
    pub kind: ActionKind,
    pub slot: Option<i64>,
    pub side: Option<Side>,
    pub price: Option<Decimal>,
    pub quantity: Option<Decimal>,
    pub detail: String,
}

/// Everything the dashboard shows, replaced wholesale after every cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineSnapshot {
    pub cycle: u64,
    pub timestamp: Option<DateTime<Utc>>,
    pub price: Option<PriceSnapshot>,
    pub anchor: Decimal,
    pub step: Decimal,
    pub center: Option<i64>,
    pub levels: Vec<GridLevel>,
    pub position: Position,
    pub s1: Option<S1State>,
    /// S1 fallback scale in use
    pub s1_degraded: bool,
    pub allocation: Vec<AssetAllocation>,
    pub recent_actions: Vec<ActionRecord>,
    pub alerts: Vec<HealthAlert>,
    pub degraded: Vec<String>,
}
