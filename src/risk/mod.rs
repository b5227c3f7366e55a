//! Aggregate risk: equity/PnL accounting across symbols and the protective
//! triggers that pause or flatten the engine.

pub mod accountant;

pub use accountant::{AccountantSnapshot, RiskAccountant, RiskAction, SyncOutcome};
