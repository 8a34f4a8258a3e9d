pub mod config;
pub mod errors;
pub mod events;
pub mod limits;
pub mod request;
pub mod validation;

pub use config::*;
pub use errors::*;
pub use events::*;
pub use limits::*;
pub use request::*;
pub use validation::*;
