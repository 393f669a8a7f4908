//! Reconciliation, scoring and routing for extracted funding candidates.
//!
//! Pure engine crate: takes candidates for one raw item and returns a routed record.
//! No IO.

pub mod reconcile;
pub mod route;
pub mod score;

pub const CRATE_NAME: &str = "fundsig-resolve";

pub use reconcile::{reconcile, ReconcileConfig, ReconcileError};
pub use route::{decide, route, Decision, RouterConfig, RoutingOutcome};
pub use score::{relevance, score, suitability_flags, urgency_level, ScoringConfig};
