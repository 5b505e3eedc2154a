pub mod client;
pub mod error;
pub mod metrics;
pub mod resources;
pub mod retry;
pub mod types;
mod url;
