pub mod types;

pub use types::{RemixError, Result};
