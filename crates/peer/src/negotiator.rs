//! Per-peer connection negotiation.
//!
//! The negotiator owns one entry per remote session: the transport, its
//! data channel (outbound when we initiated, inbound when we answered) and
//! the offer/answer progress. The map is only touched under one async lock
//! that is held for the whole create-or-reuse step, so concurrent
//! `initiate` calls and relayed offers can never produce two entries for
//! the same peer.
//!
//! Glare (both sides offer at once) is resolved by comparing session ids
//! byte-wise: the lower id discards its own offer by replacing its
//! transport and answers; the higher id ignores the incoming offer.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use protocol::{IceCandidate, RelayKind, SdpType, SessionDescription};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::NegotiationError;
use crate::network::{
    DataChannel, PeerTransport, SignalingSink, SignalingState, TransportEvent,
    TransportEventKind, TransportEventSender, TransportFactory, DATA_CHANNEL_LABEL,
};

/// Timing for [`Negotiator::wait_for_channel`].
#[derive(Debug, Clone)]
pub struct NegotiatorConfig {
    /// Delay between channel readiness polls.
    pub wait_interval: Duration,
    /// Number of polls before giving up.
    pub wait_attempts: u32,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            wait_interval: Duration::from_millis(100),
            wait_attempts: 100,
        }
    }
}

/// Progress of the connection to one peer.
///
/// A peer without an entry is closed (or was never contacted).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// Transport created, no description sent yet.
    Idle,
    /// Local offer sent, waiting for the answer.
    Offered,
    /// Descriptions exchanged, waiting for the data channel.
    Answered,
    /// Data channel open.
    Connected,
}

struct PeerEntry {
    transport: Arc<dyn PeerTransport>,
    channel: Option<Arc<dyn DataChannel>>,
    state: NegotiationState,
    epoch: u64,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
}

impl PeerEntry {
    /// Applies candidates that arrived before the remote description.
    async fn flush_candidates(&mut self, peer_id: &str) {
        for candidate in std::mem::take(&mut self.pending_candidates) {
            if let Err(e) = self.transport.add_ice_candidate(candidate).await {
                tracing::warn!(peer_id = %peer_id, "Failed to apply queued candidate: {}", e);
            }
        }
    }

    async fn shutdown(self, peer_id: &str) {
        if let Some(channel) = &self.channel {
            if let Err(e) = channel.close().await {
                tracing::debug!(peer_id = %peer_id, "Closing data channel: {}", e);
            }
        }
        if let Err(e) = self.transport.close().await {
            tracing::debug!(peer_id = %peer_id, "Closing transport: {}", e);
        }
    }
}

/// Drives offer/answer/candidate exchange for all peers.
pub struct Negotiator {
    local_id: RwLock<String>,
    factory: Arc<dyn TransportFactory>,
    signaling: Arc<dyn SignalingSink>,
    events: TransportEventSender,
    peers: Mutex<HashMap<String, PeerEntry>>,
    next_epoch: AtomicU64,
    config: NegotiatorConfig,
}

impl Negotiator {
    /// Creates a negotiator.
    ///
    /// Transports report their events on `events`; feed them back through
    /// [`Negotiator::handle_transport_event`].
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        signaling: Arc<dyn SignalingSink>,
        events: TransportEventSender,
        config: NegotiatorConfig,
    ) -> Self {
        Self {
            local_id: RwLock::new(String::new()),
            factory,
            signaling,
            events,
            peers: Mutex::new(HashMap::new()),
            next_epoch: AtomicU64::new(1),
            config,
        }
    }

    /// Sets our own session id, used for glare resolution.
    pub fn set_local_id(&self, id: &str) {
        match self.local_id.write() {
            Ok(mut local) => *local = id.to_string(),
            Err(poisoned) => *poisoned.into_inner() = id.to_string(),
        }
    }

    /// Returns our own session id (empty until assigned).
    pub fn local_id(&self) -> String {
        match self.local_id.read() {
            Ok(local) => local.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    async fn new_entry(&self, peer_id: &str, outbound: bool) -> Result<PeerEntry, NegotiationError> {
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        let transport = self
            .factory
            .create(peer_id, epoch, self.events.clone())
            .await?;

        let channel = if outbound {
            Some(transport.create_data_channel(DATA_CHANNEL_LABEL).await?)
        } else {
            None
        };

        tracing::debug!(peer_id = %peer_id, epoch, outbound, "Created transport");
        Ok(PeerEntry {
            transport,
            channel,
            state: NegotiationState::Idle,
            epoch,
            remote_description_set: false,
            pending_candidates: Vec::new(),
        })
    }

    async fn send(
        &self,
        kind: RelayKind,
        payload: Value,
        peer_id: &str,
    ) -> Result<(), NegotiationError> {
        self.signaling.relay(kind, payload, peer_id).await?;
        Ok(())
    }

    /// Starts a connection to `peer_id`, reusing an existing one.
    ///
    /// An offer is only created while the transport is stable, so calling
    /// this repeatedly while negotiating is a no-op.
    pub async fn initiate(&self, peer_id: &str) -> Result<(), NegotiationError> {
        let offer = {
            let mut peers = self.peers.lock().await;
            let entry = match peers.entry(peer_id.to_string()) {
                Entry::Occupied(occupied) => occupied.into_mut(),
                Entry::Vacant(vacant) => {
                    let entry = self.new_entry(peer_id, true).await?;
                    vacant.insert(entry)
                }
            };

            if entry.state != NegotiationState::Idle
                || entry.transport.signaling_state() != SignalingState::Stable
            {
                tracing::debug!(peer_id = %peer_id, state = ?entry.state, "Reusing connection");
                return Ok(());
            }

            let offer = entry.transport.create_offer().await?;
            entry.state = NegotiationState::Offered;
            offer
        };

        tracing::info!(peer_id = %peer_id, "Sending offer");
        self.send(RelayKind::Offer, offer.to_value()?, peer_id).await
    }

    /// Handles an offer relayed from `from`.
    pub async fn on_offer_received(&self, from: &str, payload: Value) -> Result<(), NegotiationError> {
        let offer = parse_description(payload, SdpType::Offer, from)?;

        let answer = {
            let mut peers = self.peers.lock().await;

            let replace = match peers.get(from) {
                None => false,
                Some(entry) => match entry.transport.signaling_state() {
                    SignalingState::HaveLocalOffer => {
                        if self.local_id().as_str() < from {
                            tracing::info!(peer_id = %from, "Offer collision, yielding to remote offer");
                            true
                        } else {
                            tracing::info!(peer_id = %from, "Offer collision, keeping local offer");
                            return Ok(());
                        }
                    }
                    SignalingState::Stable if entry.state == NegotiationState::Idle => false,
                    // Remote restarted its side: start over with a fresh transport.
                    _ => true,
                },
            };

            if replace {
                if let Some(old) = peers.remove(from) {
                    old.shutdown(from).await;
                }
            }

            if !peers.contains_key(from) {
                let entry = self.new_entry(from, false).await?;
                peers.insert(from.to_string(), entry);
            }

            let entry = peers
                .get_mut(from)
                .ok_or_else(|| NegotiationError::NoTransport(from.to_string()))?;

            entry.transport.set_remote_description(offer).await?;
            entry.remote_description_set = true;
            entry.flush_candidates(from).await;

            let answer = entry.transport.create_answer().await?;
            entry.state = NegotiationState::Answered;
            answer
        };

        tracing::info!(peer_id = %from, "Sending answer");
        self.send(RelayKind::Answer, answer.to_value()?, from).await
    }

    /// Handles an answer relayed from `from`.
    ///
    /// Ignored unless we have an outstanding offer to that peer.
    pub async fn on_answer_received(&self, from: &str, payload: Value) -> Result<(), NegotiationError> {
        let answer = parse_description(payload, SdpType::Answer, from)?;

        let mut peers = self.peers.lock().await;
        let Some(entry) = peers.get_mut(from) else {
            tracing::debug!(peer_id = %from, "Answer from unknown peer, ignoring");
            return Ok(());
        };

        if entry.transport.signaling_state() != SignalingState::HaveLocalOffer {
            tracing::debug!(peer_id = %from, "Answer without outstanding offer, ignoring");
            return Ok(());
        }

        entry.transport.set_remote_description(answer).await?;
        entry.remote_description_set = true;
        entry.flush_candidates(from).await;
        entry.state = NegotiationState::Answered;
        tracing::debug!(peer_id = %from, "Answer applied");
        Ok(())
    }

    /// Handles an ICE candidate relayed from `from`.
    ///
    /// Empty or malformed candidates are ignored. Candidates that arrive
    /// before the remote description are queued.
    pub async fn on_ice_candidate_received(
        &self,
        from: &str,
        payload: Value,
    ) -> Result<(), NegotiationError> {
        let candidate = match IceCandidate::from_value(payload) {
            Ok(candidate) => candidate,
            Err(e) => {
                tracing::warn!(peer_id = %from, "Ignoring malformed candidate: {}", e);
                return Ok(());
            }
        };
        if candidate.is_empty() {
            return Ok(());
        }

        let mut peers = self.peers.lock().await;
        let Some(entry) = peers.get_mut(from) else {
            tracing::debug!(peer_id = %from, "Candidate for unknown peer, ignoring");
            return Ok(());
        };

        if !entry.remote_description_set {
            entry.pending_candidates.push(candidate);
            return Ok(());
        }

        if let Err(e) = entry.transport.add_ice_candidate(candidate).await {
            tracing::warn!(peer_id = %from, "Failed to apply candidate: {}", e);
        }
        Ok(())
    }

    /// Updates bookkeeping for a transport event.
    ///
    /// Events from replaced transports are dropped. Returns the event when
    /// the layer above must act on it: data-channel messages, and channel
    /// or connection loss (after which the peer's entry is already gone).
    pub async fn handle_transport_event(&self, event: TransportEvent) -> Option<TransportEvent> {
        let mut peers = self.peers.lock().await;
        let current = peers
            .get_mut(&event.peer_id)
            .filter(|entry| entry.epoch == event.epoch);
        let Some(entry) = current else {
            tracing::trace!(peer_id = %event.peer_id, epoch = event.epoch, "Dropping stale transport event");
            return None;
        };

        match &event.kind {
            TransportEventKind::LocalCandidate(candidate) => {
                let payload = match candidate.to_value() {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!("Failed to encode local candidate: {}", e);
                        return None;
                    }
                };
                drop(peers);
                if let Err(e) = self
                    .send(RelayKind::IceCandidate, payload, &event.peer_id)
                    .await
                {
                    tracing::warn!(peer_id = %event.peer_id, "Failed to relay candidate: {}", e);
                }
                None
            }
            TransportEventKind::IncomingChannel(channel) => {
                let keep_existing = entry.channel.as_ref().is_some_and(|c| c.is_open());
                if !keep_existing {
                    if channel.is_open() {
                        entry.state = NegotiationState::Connected;
                    }
                    entry.channel = Some(Arc::clone(channel));
                }
                None
            }
            TransportEventKind::ChannelOpen => {
                tracing::info!(peer_id = %event.peer_id, "Data channel open");
                entry.state = NegotiationState::Connected;
                None
            }
            TransportEventKind::Message(_) => Some(event),
            TransportEventKind::ChannelClosed => {
                let removed = peers.remove(&event.peer_id);
                drop(peers);
                if let Some(entry) = removed {
                    tracing::info!(peer_id = %event.peer_id, "Data channel closed");
                    entry.shutdown(&event.peer_id).await;
                }
                Some(event)
            }
            TransportEventKind::StateChanged(state) if state.is_dead() => {
                let removed = peers.remove(&event.peer_id);
                drop(peers);
                if let Some(entry) = removed {
                    tracing::info!(peer_id = %event.peer_id, state = ?state, "Connection lost");
                    entry.shutdown(&event.peer_id).await;
                }
                Some(event)
            }
            TransportEventKind::StateChanged(state) => {
                tracing::debug!(peer_id = %event.peer_id, state = ?state, "Connection state");
                None
            }
        }
    }

    /// Returns the peer's data channel if it is open.
    pub async fn channel(&self, peer_id: &str) -> Option<Arc<dyn DataChannel>> {
        let peers = self.peers.lock().await;
        peers
            .get(peer_id)
            .and_then(|entry| entry.channel.as_ref())
            .filter(|channel| channel.is_open())
            .cloned()
    }

    /// Polls until the peer's data channel is open.
    pub async fn wait_for_channel(
        &self,
        peer_id: &str,
    ) -> Result<Arc<dyn DataChannel>, NegotiationError> {
        for _ in 0..self.config.wait_attempts {
            if let Some(channel) = self.channel(peer_id).await {
                return Ok(channel);
            }
            tokio::time::sleep(self.config.wait_interval).await;
        }

        Err(NegotiationError::ChannelTimeout {
            peer_id: peer_id.to_string(),
            attempts: self.config.wait_attempts,
        })
    }

    /// Closes the data channel and transport to `peer_id`.
    ///
    /// Returns false if there was no connection.
    pub async fn close(&self, peer_id: &str) -> bool {
        let removed = self.peers.lock().await.remove(peer_id);
        match removed {
            Some(entry) => {
                tracing::info!(peer_id = %peer_id, "Closing connection");
                entry.shutdown(peer_id).await;
                true
            }
            None => false,
        }
    }

    /// Closes every connection.
    pub async fn close_all(&self) {
        let entries: Vec<(String, PeerEntry)> = self.peers.lock().await.drain().collect();
        for (peer_id, entry) in entries {
            entry.shutdown(&peer_id).await;
        }
    }

    /// Returns the negotiation progress for `peer_id`.
    pub async fn negotiation_state(&self, peer_id: &str) -> Option<NegotiationState> {
        self.peers.lock().await.get(peer_id).map(|entry| entry.state)
    }

    /// Returns the ids of all peers with a connection entry.
    pub async fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.peers.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn parse_description(
    payload: Value,
    expected: SdpType,
    from: &str,
) -> Result<SessionDescription, NegotiationError> {
    let kind = match expected {
        SdpType::Offer => "offer",
        SdpType::Answer => "answer",
    };
    let desc = SessionDescription::from_value(payload).map_err(|e| NegotiationError::Malformed {
        kind,
        peer_id: from.to_string(),
        reason: e.to_string(),
    })?;

    if desc.sdp_type != expected {
        return Err(NegotiationError::Malformed {
            kind,
            peer_id: from.to_string(),
            reason: format!("unexpected description type {:?}", desc.sdp_type),
        });
    }
    Ok(desc)
}
