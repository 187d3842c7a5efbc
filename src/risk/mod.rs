//! Risk management for the grid engine.
//!
//! - Pre-trade limits: position ratio, S1-scaled absolute cap, order size,
//!   cash buffer and minimum base position
//! - Health monitoring and degraded-mode alerts

mod health;
mod limiter;

pub use health::{AlertKind, AlertSeverity, HealthAlert, HealthMonitor};
pub use limiter::{
    authorize, OrderLimits, ProposedOrder, RiskContext, RiskDecision, RiskLimiter, RiskViolation,
};
