//! # Audio Module
//!
//! Queue, playback policy and voice engine for one listening context.
//!
//! This module provides the pieces a session is built from:
//! - The ordered track queue with its playback cursor
//! - Repeat and enqueue placement policies
//! - The session state machine
//! - The boundary to the voice engine that actually plays audio
//!
//! ## Architecture
//!
//! ### [`queue`] - Queue Management
//! - Ordered tracks plus a cursor that never goes out of bounds
//! - Relative movement, removal, per-user dequeue and capacity checks
//!
//! ### [`policy`] - Playback Policies
//! - [`RepeatMode`](policy::RepeatMode) decides what follows a finished track
//! - [`EnqueueMode`](policy::EnqueueMode) decides where a new track lands
//!
//! ### [`state`] - State Machine
//! - Legal transitions between NEW, PLAYING, PAUSED, STOPPED, SKIPPED,
//!   ENDED and DISCONNECTED
//!
//! ### [`engine`] - Engine Boundary
//! - [`AudioEngine`](engine::AudioEngine) commands and the
//!   [`EngineEvent`](engine::EngineEvent) stream coming back
//! - [`songbird_engine`] implements it over songbird voice connections
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use open_music_sessions::audio::{policy::EnqueueMode, queue::MusicQueue, track::{QueuedTrack, Track}};
//! use serenity::all::UserId;
//!
//! let mut queue = MusicQueue::new(100);
//! let user = UserId::new(1);
//! let item = QueuedTrack::new(Track::new("ytsearch:lofi", "lofi"), user);
//! let index = queue.enqueue(item, EnqueueMode::Fifo, &mut rand::thread_rng()).unwrap();
//! assert_eq!(index, 0);
//! ```

pub mod engine;
pub mod policy;
pub mod queue;
pub mod songbird_engine;
pub mod state;
pub mod track;
