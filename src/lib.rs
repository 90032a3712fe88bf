//! TAO Treasury Backend Library
//!
//! Core of the treasury management service: upstream ingestion, FIFO
//! accounting, slippage-aware NAV, flow regimes, viability scoring,
//! reconciliation and the trust gate. Exposed for the service binary,
//! the operational bins and the integration tests.

pub mod accounting;
pub mod cache;
pub mod client;
pub mod db;
pub mod metrics;
pub mod models;
pub mod nav;
pub mod reconciliation;
pub mod regime;
pub mod risk;
pub mod runtime;
pub mod strategy;
pub mod sync;
pub mod trust_gate;
pub mod units;
pub mod viability;

pub use models::Config;
pub use runtime::AppContext;
