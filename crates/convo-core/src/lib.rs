// Library root: re-exports all modules so integration tests and the CLI can
// reach the crate's public API.

pub mod app;
pub mod config;
pub mod db;
pub mod error;
pub mod http_api;
pub mod live;
pub mod merge;
pub mod message;
pub mod normalize;
pub mod pending;
pub mod protocol;
pub mod reconciler;
pub mod timer;
pub mod transport;
pub mod ws_client;
