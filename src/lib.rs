pub mod bufpool;
pub mod bulk;
pub mod config;
pub mod error;
pub mod limiter;
pub mod metrics;
pub mod proxy;
pub mod queue;
pub mod server;
pub mod upstream;
