//! Huddle: a multi-tenant conference signaling server.
//!
//! The server owns the authoritative state of video-conference rooms and
//! fans out events to every connected client over persistent binary
//! websockets. Each socket becomes a [`session::ClientSession`] with two
//! bounded outbound queues (priority and normal); each room serializes
//! its mutations behind one lock and enqueues the resulting event to all
//! members before the next mutation runs; the [`hub::Hub`] keeps the
//! room registry and preserves empty or hostless rooms for a grace
//! period so a transient disconnect does not destroy them.
//!
//! WebRTC media never flows through this process: signaling payloads are
//! relayed to an external selective-forwarding service behind the
//! [`media::MediaPlane`] trait. Horizontally scaled deployments replicate
//! room events between instances through a [`bus::EventBus`].
//!
//! # Starting a server
//!
//! ```no_run
//! use huddle::auth::JwtValidator;
//! use huddle::config::Config;
//! use huddle::hub::Hub;
//! use huddle::server::SignalingServer;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), huddle::SignalingError> {
//! let config = Config::load(None)?;
//! let validator = Box::new(JwtValidator::new(b"secret"));
//! let hub = Hub::new(config, validator, None, None);
//! let server = SignalingServer::bind(hub.clone()).await?;
//! let shutdown = CancellationToken::new();
//! server.run(shutdown).await;
//! hub.shutdown().await;
//! # Ok(()) }
//! ```

pub mod auth;
pub mod bus;
pub mod config;
pub mod hub;
pub mod limit;
pub mod media;
pub mod metrics;
pub mod protocol;
pub mod room;
pub mod router;
pub mod server;
pub mod session;

#[cfg(test)]
mod testutil;
#[cfg(test)]
mod tests;

/// The error taxonomy of the signaling core.
///
/// Errors scoped to one session never cross the session boundary; the
/// router turns them into a single `error` frame for the originator.
#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    /// Missing, malformed, or expired token.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// Request origin not in the allow-list.
    #[error("origin rejected: {0}")]
    Origin(String),
    /// A rate bucket is exhausted.
    #[error("rate limited")]
    RateLimited,
    /// The caller's role disallows the action.
    #[error("permission denied: {0}")]
    Permission(String),
    /// Malformed frame or unexpected message variant.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// Socket failure or deadline.
    #[error("transport error: {0}")]
    Transport(String),
    /// An outbound queue was full and a frame was dropped. Recorded in
    /// metrics and logs; never propagated to the room.
    #[error("outbound queue full")]
    Capacity,
    /// The room no longer admits members.
    #[error("room is closed")]
    RoomClosed,
    /// Bus publish or subscribe failure; local state is unaffected.
    #[error("bus error: {0}")]
    Bus(String),
    /// Media-plane call failure.
    #[error("media plane error: {0}")]
    Media(String),
    /// Startup or shutdown misconfiguration; fatal.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// An I/O error (bind, accept).
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
