//! Real-time turn-taking orchestrator for AI phone agents.
//!
//! One call arrives as a media-stream WebSocket. Inbound audio is fed to a
//! streaming transcription backend, finalized utterances drive a tool-calling
//! language model, replies are synthesized and played back, and the caller is
//! only listened to again once every played segment has been acknowledged.
//!
//! ## Pipeline
//!
//! ```text
//! transport ──audio──▶ segmenter ──utterance──▶ dialogue ──reply──▶ speech
//!     ▲                    ▲                                          │
//!     │                    └──── mute / unmute ────┐                  │
//!     └────────── media + mark ◀──────────── coordinator ◀── segments ┘
//! ```
//!
//! Every stage runs as its own task for the lifetime of the call and talks to
//! its neighbours over bounded `tokio::sync::mpsc` channels. The
//! [`coordinator::TurnCoordinator`] owns the per-call session state.

pub mod config;
pub mod coordinator;
pub mod dialogue;
pub mod error;
pub mod gateway;
pub mod observability;
pub mod segmenter;
pub mod speech;
pub mod transport;

pub use config::Config;
pub use coordinator::{Backends, TurnCoordinator};
