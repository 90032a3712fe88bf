//! TaoStats analytics API client.
//!
//! The only module that performs HTTP. Everything else consumes typed
//! responses and the error taxonomy exported here.

mod schemas;
mod taostats;

pub use schemas::{
    AccountingRow, ApiPage, DelegationEventRow, ExtrinsicRow, PageInfo, PoolRow, SlippageQuote,
    StakeBalanceHistoryRow, StakeBalanceRow, SubnetRow, ValidatorRow,
};
pub use taostats::{ClientError, TaostatsClient};
