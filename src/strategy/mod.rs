//! Trading strategy implementation.
//!
//! Contains the core logic for:
//! - The S1 range signal and breakout rebalance
//! - The anchored grid ladder and its reconciliation with the exchange
//! - Spot/earn fund allocation
//! - The per-cycle engine tying them together

mod allocator;
mod engine;
mod grid;
mod position;
mod signal;
mod snapshot;

pub use allocator::{
    decide, AllocationInputs, AssetAllocation, FundAllocator, TransferDecision, TransferPolicy,
};
pub use engine::{CycleReport, StrategyEngine};
pub use grid::{
    CancelIntent, CancelOutcome, Fill, GridLevel, GridManager, GridPlan, Ladder, LevelStatus,
    PlaceOutcome, PlacementIntent, SyncReport,
};
pub use position::{Position, TradeStats};
pub use signal::{
    apply_policy, breakout_adjustment, compute_signal, range_position, BreakoutInputs,
    BreakoutProposal, S1State, SignalError,
};
pub use snapshot::{ActionKind, ActionRecord, EngineSnapshot};
