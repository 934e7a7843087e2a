//! # Open Music Sessions
//!
//! Playback sessions for Open Music workers that may run as several
//! cooperating processes.
//!
//! ## Architecture
//!
//! - [`audio`] - Queue, playback policies, state machine and voice engine
//! - [`session`] - The `Session` contract, its local and remote variants and
//!   the process-wide registry
//! - [`cluster`] - Node identities, ownership directory and transports
//! - [`bot`] - Discord gateway handler of a worker
//! - [`config`] - Environment configuration
//! - [`error`] - Error kinds shared by every operation

pub mod audio;
pub mod bot;
pub mod cluster;
pub mod config;
pub mod error;
pub mod session;
