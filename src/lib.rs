pub mod app;
pub mod config;
pub mod error;
pub mod handlers;
pub mod interaction;
pub mod metrics;
pub mod normalize;
pub mod provider;
pub mod schema;
pub mod stream;
pub mod tokens;
pub mod tracker;
pub mod upstream;
