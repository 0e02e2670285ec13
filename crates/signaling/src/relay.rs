//! Negotiation relay between sessions.
//!
//! The server never inspects offer, answer or candidate payloads. It only
//! stamps the verified sender identity on the forwarded message, so a peer
//! cannot impersonate another session by lying about `from`.

use protocol::{RelayKind, ServerMessage};
use serde_json::Value;

use crate::registry::{SessionRegistry, SessionSink};

/// Result of a relay attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Queued on the destination session.
    Delivered,
    /// Destination unknown or already gone; the payload was discarded.
    Dropped,
}

/// Forwards a negotiation payload from session `from` to session `to`.
///
/// Unknown destinations are dropped silently; the sender is not notified.
pub fn relay<S: SessionSink>(
    registry: &SessionRegistry<S>,
    kind: RelayKind,
    payload: Value,
    from: &str,
    to: &str,
) -> RelayOutcome {
    let message = ServerMessage::relayed(kind, payload, from);

    if registry.send_to(to, message) {
        tracing::trace!(event = kind.event_name(), from = %from, to = %to, "Relayed");
        RelayOutcome::Delivered
    } else {
        tracing::debug!(
            event = kind.event_name(),
            from = %from,
            to = %to,
            "Relay destination not found, dropping"
        );
        RelayOutcome::Dropped
    }
}
