pub mod app;
pub mod client;
pub mod config;
pub mod consensus;
pub mod error;
pub mod ln;
pub mod member;
pub mod metrics;
pub mod mint;
pub mod rpc;
pub mod store;
pub mod transaction;
pub mod wallet;

// for main.rs
pub use app::run;
