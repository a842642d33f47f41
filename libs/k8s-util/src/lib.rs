pub mod client;
pub mod metrics;
pub mod retry;
pub mod url;
