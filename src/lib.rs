//! Remote-playback bridge between a local music player and a Google Cast receiver.
//!
//! `CastSessionManager` is the entry point: it connects to a receiver, mirrors
//! a bounded window of the local play queue onto it, forwards transport
//! commands and reconciles the sampled remote state into `CastState`.
//! `TokenGenerator` keeps one session-bound stream token resource alive and
//! shared between concurrent requests.

pub mod anti_echo;
pub mod bridge;
pub mod castv2;
pub mod config;
pub mod errors;
pub mod media;
pub mod poller;
pub mod protocol;
pub mod queue_mirror;
pub mod receiver;
pub mod session;
pub mod state;
pub mod token;

pub use bridge::LocalChange;
pub use errors::{CastError, TokenError};
pub use session::CastSessionManager;
pub use state::CastState;
pub use token::TokenGenerator;
