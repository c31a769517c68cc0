//! claimlink - headless device pairing
//!
//! A device without a screen receives network credentials and its owner's
//! chat handle over a short-range configuration link, proves ownership by
//! waiting for the owner to send a one-time claim token over a chat service,
//! then optionally discovers a group conversation to report to.

pub mod binding;
pub mod classifier;
pub mod config;
pub mod config_session;
pub mod error;
pub mod network;
pub mod owner;
pub mod pairing;
pub mod poller;
pub mod store;
pub mod task;
pub mod token;
pub mod transport;

pub use error::{Error, Result};
