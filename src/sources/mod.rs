//! Where readings, markers and analysis requests come from.
//!
//! The agent's polling loops only see these traits. Delivery is
//! at-least-once: a poll returns everything not yet acknowledged, and items
//! stay pending until the loop acknowledges the prefix it applied. A failed
//! or cancelled cycle therefore sees the rest again on the next poll.
//! [`JsonInbox`] is the bundled implementation: a directory that other tools
//! drop envelope files into.

pub mod inbox;

use crate::core::types::{Marker, Measurement};
use crate::error::Result;
use crate::workflows::RequestPayload;
use async_trait::async_trait;

pub use inbox::{Envelope, JsonInbox, MarkerInput};

#[async_trait]
pub trait MeasurementSource: Send + Sync {
    /// Readings not yet acknowledged, in delivery order.
    async fn poll_measurements(&self) -> Result<Vec<Measurement>>;

    /// The first `count` readings of the last poll were applied.
    async fn ack_measurements(&self, count: usize) -> Result<()>;
}

#[async_trait]
pub trait MarkerSource: Send + Sync {
    /// Markers not yet acknowledged, in delivery order.
    async fn poll_markers(&self) -> Result<Vec<Marker>>;

    /// The first `count` markers of the last poll were applied.
    async fn ack_markers(&self, count: usize) -> Result<()>;
}

#[async_trait]
pub trait RequestSource: Send + Sync {
    /// User requests not yet acknowledged, in delivery order.
    async fn poll_requests(&self) -> Result<Vec<RequestPayload>>;

    /// The first `count` requests of the last poll were applied.
    async fn ack_requests(&self, count: usize) -> Result<()>;
}
