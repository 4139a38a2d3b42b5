pub mod api;
pub mod cache;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod model;
pub mod mutation;
pub mod session;
pub mod suggest;
pub mod sync;
pub mod upload;

#[cfg(test)]
mod testing;

pub use client::Dashboard;
pub use error::{ClientError, Result};
pub use model::{MealType, StatsSnapshot};
pub use session::Session;
