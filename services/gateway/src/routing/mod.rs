mod error;
mod table;

pub use error::RouteError;
pub use table::{RouteSpec, RouteTable};

/// Rate class applied to routes that do not name one.
pub const DEFAULT_RATE_CLASS: &str = "default";
