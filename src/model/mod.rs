//! Typed records for every payload the backend sends or receives.

pub mod account;
pub mod snapshot;

pub use account::*;
pub use snapshot::*;
