//! The proxy's per-player Secure Chat pipeline.
//!
//! Minecraft's Secure Chat (1.19+) signs each outbound chat message against
//! a window of recently-seen signed messages, which makes the order of chat,
//! command, and acknowledgement packets between a client and its backend
//! server load-bearing: reorder them and the server rejects signatures.
//!
//! [`ChatQueue`] serializes that traffic per player. It forwards client
//! packets in the order they arrived, lets the proxy inject its own packets
//! into the same ordered stream, and withholds acknowledgement packets while
//! the cached last-seen state ([`ChatState`]) would be invalidated by them,
//! within the server's bounded unacknowledged-message window.

pub mod error;
pub mod link;
pub mod queue;
pub mod state;

pub use error::ChatViolation;
pub use link::{Player, ServerLink};
pub use queue::ChatQueue;
pub use state::ChatState;
