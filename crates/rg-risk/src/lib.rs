//! Risk controls for RiskGate: circuit breakers, market-responsive limits
//! and the validation checks run against them.

pub mod breaker;
pub mod cache;
pub mod checks;
pub mod limits;
pub mod signals;

pub use breaker::*;
pub use cache::*;
pub use checks::*;
pub use limits::*;
pub use signals::*;
