//! Slippage surfaces and executable NAV.

pub mod calculator;
pub mod slippage;

pub use calculator::{NavCalculator, PortfolioNav};
pub use slippage::{
    interpolate_slippage_pct, ladder_sizes, SlippageEstimate, SlippageService,
    DEFAULT_EXIT_SLIPPAGE,
};
