//! TURN relay client (RFC 8656) over a STUN session.
//!
//! One client manages one allocation on one server. The allocation
//! lifecycle is `Unallocated → Allocating → Allocated ⇄ Refreshing` with
//! `Expired` and `Closed` as terminal states. Refresh, permission and
//! channel-binding renewals are driven by the client's own
//! [`TimerQueue`]; the server is never trusted to keep anything alive on
//! our behalf.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use rnat_infra_common::{TimerHandle, TimerQueue};
use rnat_stun_core::{
    Credentials, Method, Result, StunAttribute, StunAttributeType, StunConfig, StunError,
    StunMessage, StunSession, StunSessionHandler, TransactionResult,
};

use crate::channel::{is_channel_data, ChannelData, CHANNEL_MAX, CHANNEL_MIN};

/// TURN client configuration.
#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// TURN server transport address.
    pub server: SocketAddr,
    /// Long-term credentials (realm arrives in the 401 challenge).
    pub credentials: Credentials,
    /// Allocation lifetime to request, in seconds.
    pub requested_lifetime: Duration,
    /// How long before expiry an allocation refresh is sent.
    pub refresh_lead: Duration,
    /// Server-side permission lifetime; renewals are sent at 4/5 of this.
    pub permission_lifetime: Duration,
    /// Server-side channel binding lifetime; renewals at 9/10 of this.
    pub channel_lifetime: Duration,
    /// Underlying STUN session configuration.
    pub stun: StunConfig,
}

impl TurnConfig {
    /// Defaults per RFC 8656: 600 s allocations
    /// refreshed 60 s early, 300 s permissions, 600 s channel bindings.
    pub fn new(server: SocketAddr, credentials: Credentials) -> Self {
        TurnConfig {
            server,
            credentials,
            requested_lifetime: Duration::from_secs(600),
            refresh_lead: Duration::from_secs(60),
            permission_lifetime: Duration::from_secs(300),
            channel_lifetime: Duration::from_secs(600),
            stun: StunConfig::default(),
        }
    }
}

/// Allocation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Unallocated,
    Allocating,
    Allocated,
    Refreshing,
    Expired,
    Closed,
}

/// Events delivered to the client's owner.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    /// The allocation was granted.
    AllocationGranted {
        relay: SocketAddr,
        mapped: SocketAddr,
        lifetime: Duration,
    },
    /// Allocate failed terminally (after the authentication retry).
    AllocationFailed { code: Option<u16>, reason: String },
    /// A refresh failed and the allocation is gone.
    AllocationExpired,
    /// Relayed data arrived from a peer.
    Data { peer: SocketAddr, data: Bytes },
}

/// A granted allocation.
#[derive(Debug, Clone, Copy)]
pub struct Allocation {
    /// Relayed transport address on the server.
    pub relay: SocketAddr,
    /// Our server-reflexive address as seen by the server.
    pub mapped: SocketAddr,
    /// Granted lifetime.
    pub lifetime: Duration,
}

#[derive(Debug, Clone, Copy)]
enum TurnTimer {
    RefreshAllocation,
    RefreshPermission(SocketAddr),
    RefreshChannel(u16, SocketAddr),
}

#[derive(Default)]
struct AuthState {
    realm: Option<String>,
    nonce: Option<Vec<u8>>,
    key: Option<Vec<u8>>,
}

#[derive(Default)]
struct ChannelTable {
    by_peer: HashMap<SocketAddr, u16>,
    by_number: HashMap<u16, SocketAddr>,
    next: u16,
}

struct ClientInner {
    session: StunSession,
    config: TurnConfig,
    state: Mutex<TurnState>,
    auth: Mutex<AuthState>,
    allocation: Mutex<Option<Allocation>>,
    permissions: Mutex<HashMap<IpAddr, TimerHandle>>,
    channels: Mutex<ChannelTable>,
    timers: TimerQueue<TurnTimer>,
    event_tx: mpsc::Sender<TurnEvent>,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// TURN relay client. Cheap to clone; clones share one allocation.
#[derive(Clone)]
pub struct TurnClient {
    inner: Arc<ClientInner>,
}

struct TurnDemux {
    inner: std::sync::Weak<ClientInner>,
}

#[async_trait]
impl StunSessionHandler for TurnDemux {
    async fn on_indication(&self, _session: &StunSession, message: StunMessage, source: SocketAddr) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if source != inner.config.server || message.method != Method::Data {
            debug!(%source, "ignoring unexpected indication");
            return;
        }
        let peer = message
            .get_attribute(StunAttributeType::XorPeerAddress)
            .and_then(|attr| attr.as_xor_address(&message.transaction_id).ok());
        let data = message
            .get_attribute(StunAttributeType::Data)
            .map(|attr| attr.value.clone());
        if let (Some(peer), Some(data)) = (peer, data) {
            let _ = inner.event_tx.send(TurnEvent::Data { peer, data }).await;
        }
    }

    async fn on_raw(&self, _session: &StunSession, data: Bytes, source: SocketAddr) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if source != inner.config.server || !is_channel_data(&data) {
            return;
        }
        let Ok(channel_data) = ChannelData::decode(&data) else {
            debug!("dropping malformed ChannelData");
            return;
        };
        let peer = {
            let channels = inner.channels.lock().unwrap();
            channels.by_number.get(&channel_data.number).copied()
        };
        match peer {
            Some(peer) => {
                let _ = inner
                    .event_tx
                    .send(TurnEvent::Data {
                        peer,
                        data: channel_data.data,
                    })
                    .await;
            }
            None => debug!(
                "dropping ChannelData on unbound channel 0x{:04x}",
                channel_data.number
            ),
        }
    }
}

impl TurnClient {
    /// Create a client over `socket`. Events arrive on the returned
    /// receiver. The allocation is not started; call
    /// [`allocate`](Self::allocate).
    pub fn new(socket: Arc<UdpSocket>, config: TurnConfig) -> (Self, mpsc::Receiver<TurnEvent>) {
        let (event_tx, event_rx) = mpsc::channel(64);
        let (timers, timer_rx) = TimerQueue::new();

        let inner = Arc::new_cyclic(|weak: &std::sync::Weak<ClientInner>| {
            let session = StunSession::new(
                socket,
                config.stun.clone(),
                Arc::new(TurnDemux {
                    inner: weak.clone(),
                }),
            );
            ClientInner {
                session,
                config,
                state: Mutex::new(TurnState::Unallocated),
                auth: Mutex::new(AuthState::default()),
                allocation: Mutex::new(None),
                permissions: Mutex::new(HashMap::new()),
                channels: Mutex::new(ChannelTable {
                    next: CHANNEL_MIN,
                    ..ChannelTable::default()
                }),
                timers,
                event_tx,
                closed: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }
        });

        let client = TurnClient { inner };
        let driver = client.clone();
        let handle = tokio::spawn(async move {
            driver.timer_loop(timer_rx).await;
        });
        client.inner.tasks.lock().unwrap().push(handle);

        (client, event_rx)
    }

    /// Current allocation state.
    pub fn state(&self) -> TurnState {
        *self.inner.state.lock().unwrap()
    }

    /// The granted allocation, if any.
    pub fn allocation(&self) -> Option<Allocation> {
        *self.inner.allocation.lock().unwrap()
    }

    /// The relayed transport address, once allocated.
    pub fn relay_addr(&self) -> Option<SocketAddr> {
        self.allocation().map(|allocation| allocation.relay)
    }

    /// Request an allocation on the server.
    ///
    /// Performs the long-term-credential dance: the first attempt is
    /// unauthenticated and collects realm/nonce from the 401, the retry
    /// authenticates. Terminal failure is reported exactly once, both here
    /// and as [`TurnEvent::AllocationFailed`].
    pub async fn allocate(&self) -> Result<Allocation> {
        self.transition(TurnState::Unallocated, TurnState::Allocating)?;

        let requested = self.inner.config.requested_lifetime.as_secs() as u32;
        let result = self
            .request_authed(move || {
                let mut msg = StunMessage::request(Method::Allocate);
                msg.add_attribute(StunAttribute::requested_transport_udp());
                msg.add_attribute(StunAttribute::lifetime(requested));
                msg
            })
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.set_state(TurnState::Unallocated);
                self.emit(TurnEvent::AllocationFailed {
                    code: e.server_code(),
                    reason: e.to_string(),
                })
                .await;
                return Err(e);
            }
        };

        let relay = response
            .get_attribute(StunAttributeType::XorRelayedAddress)
            .ok_or_else(|| StunError::InvalidState("no XOR-RELAYED-ADDRESS".to_string()))?
            .as_xor_address(&response.transaction_id)?;
        let mapped = response
            .get_attribute(StunAttributeType::XorMappedAddress)
            .ok_or_else(|| StunError::InvalidState("no XOR-MAPPED-ADDRESS".to_string()))?
            .as_xor_address(&response.transaction_id)?;
        let lifetime = response
            .get_attribute(StunAttributeType::Lifetime)
            .and_then(|attr| attr.as_u32().ok())
            .map(|secs| Duration::from_secs(secs as u64))
            .unwrap_or(self.inner.config.requested_lifetime);

        let allocation = Allocation {
            relay,
            mapped,
            lifetime,
        };
        *self.inner.allocation.lock().unwrap() = Some(allocation);
        self.set_state(TurnState::Allocated);
        self.schedule_allocation_refresh(lifetime);

        info!(%relay, %mapped, ?lifetime, "allocation granted");
        self.emit(TurnEvent::AllocationGranted {
            relay,
            mapped,
            lifetime,
        })
        .await;
        Ok(allocation)
    }

    /// Install (or renew) a permission for `peer`. Required before the
    /// server will relay to or from that address.
    pub async fn create_permission(&self, peer: SocketAddr) -> Result<()> {
        self.require_allocated()?;
        let response = self
            .request_authed(move || {
                let mut msg = StunMessage::request(Method::CreatePermission);
                msg.add_attribute(StunAttribute::xor_peer_address(peer, &msg.transaction_id));
                msg
            })
            .await?;
        drop(response);

        let renew_at = self.inner.config.permission_lifetime * 4 / 5;
        let handle = self
            .inner
            .timers
            .schedule(renew_at, TurnTimer::RefreshPermission(peer));
        if let Some(old) = self
            .inner
            .permissions
            .lock()
            .unwrap()
            .insert(peer.ip(), handle)
        {
            old.cancel();
        }
        debug!(%peer, "permission installed");
        Ok(())
    }

    /// Bind a channel to `peer`, switching its data path to the compact
    /// ChannelData framing. Returns the channel number.
    pub async fn channel_bind(&self, peer: SocketAddr) -> Result<u16> {
        self.require_allocated()?;

        let number = {
            let mut channels = self.inner.channels.lock().unwrap();
            if let Some(existing) = channels.by_peer.get(&peer) {
                *existing
            } else {
                if channels.next > CHANNEL_MAX {
                    return Err(StunError::ResourceExhausted(
                        (CHANNEL_MAX - CHANNEL_MIN) as usize,
                    ));
                }
                let number = channels.next;
                channels.next += 1;
                number
            }
        };

        self.request_authed(move || {
            let mut msg = StunMessage::request(Method::ChannelBind);
            msg.add_attribute(StunAttribute::channel_number(number));
            msg.add_attribute(StunAttribute::xor_peer_address(peer, &msg.transaction_id));
            msg
        })
        .await?;

        {
            let mut channels = self.inner.channels.lock().unwrap();
            channels.by_peer.insert(peer, number);
            channels.by_number.insert(number, peer);
        }
        let renew_at = self.inner.config.channel_lifetime * 9 / 10;
        self.inner
            .timers
            .schedule(renew_at, TurnTimer::RefreshChannel(number, peer));

        debug!(%peer, "channel 0x{number:04x} bound");
        Ok(number)
    }

    /// Send application data to `peer` through the relay: ChannelData when
    /// a channel is bound, a Send indication otherwise. ChannelData and
    /// indications are unacknowledged; loss is silent by design.
    pub async fn send_to(&self, peer: SocketAddr, data: &[u8]) -> Result<()> {
        self.require_allocated()?;

        let channel = {
            let channels = self.inner.channels.lock().unwrap();
            channels.by_peer.get(&peer).copied()
        };

        match channel {
            Some(number) => {
                let wire = ChannelData::new(number, Bytes::copy_from_slice(data)).encode();
                self.inner.session.send_raw(&wire, self.inner.config.server).await
            }
            None => {
                if !self.inner.permissions.lock().unwrap().contains_key(&peer.ip()) {
                    debug!(%peer, "sending without a local permission record");
                }
                let mut msg = StunMessage::indication(Method::Send);
                msg.add_attribute(StunAttribute::xor_peer_address(peer, &msg.transaction_id));
                msg.add_attribute(StunAttribute::data(Bytes::copy_from_slice(data)));
                self.inner
                    .session
                    .send_indication(&msg, self.inner.config.server, None)
                    .await
            }
        }
    }

    /// Release the allocation and tear the client down. Idempotent. A
    /// best-effort Refresh with lifetime 0 tells the server to drop the
    /// allocation immediately instead of waiting out the lifetime.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let had_allocation = matches!(
            self.state(),
            TurnState::Allocated | TurnState::Refreshing
        );
        if had_allocation {
            let mut msg = StunMessage::request(Method::Refresh);
            msg.add_attribute(StunAttribute::lifetime(0));
            let (key, attrs) = self.auth_attributes();
            for attr in attrs {
                msg.add_attribute(attr);
            }
            // Single datagram, no retransmission: the allocation would
            // expire on its own anyway.
            let wire = msg.encode_with(key.as_deref(), self.inner.session.config().add_fingerprint);
            let _ = self
                .inner
                .session
                .send_raw(&wire, self.inner.config.server)
                .await;
        }

        self.inner.timers.close();
        for handle in self.inner.tasks.lock().unwrap().drain(..) {
            handle.abort();
        }
        self.inner.session.close();
        self.set_state(TurnState::Closed);
        debug!("turn client closed");
    }

    // --- internals ---

    async fn timer_loop(self, mut timer_rx: mpsc::Receiver<TurnTimer>) {
        while let Some(timer) = timer_rx.recv().await {
            if self.inner.closed.load(Ordering::SeqCst) {
                return;
            }
            match timer {
                TurnTimer::RefreshAllocation => {
                    if let Err(e) = self.refresh().await {
                        warn!("allocation refresh failed: {e}");
                        self.expire().await;
                        return;
                    }
                }
                TurnTimer::RefreshPermission(peer) => {
                    if let Err(e) = self.create_permission(peer).await {
                        warn!(%peer, "permission refresh failed: {e}");
                    }
                }
                TurnTimer::RefreshChannel(number, peer) => {
                    if let Err(e) = self.refresh_channel(number, peer).await {
                        warn!(%peer, "channel refresh failed: {e}");
                    }
                }
            }
        }
    }

    async fn refresh(&self) -> Result<()> {
        self.transition(TurnState::Allocated, TurnState::Refreshing)?;
        let requested = self.inner.config.requested_lifetime.as_secs() as u32;
        let result = self
            .request_authed(move || {
                let mut msg = StunMessage::request(Method::Refresh);
                msg.add_attribute(StunAttribute::lifetime(requested));
                msg
            })
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => return Err(e),
        };

        let lifetime = response
            .get_attribute(StunAttributeType::Lifetime)
            .and_then(|attr| attr.as_u32().ok())
            .map(|secs| Duration::from_secs(secs as u64))
            .unwrap_or(self.inner.config.requested_lifetime);

        // A granted lifetime of 0 means the server dropped the allocation.
        if lifetime.is_zero() {
            return Err(StunError::InvalidState(
                "allocation lifetime expired".to_string(),
            ));
        }

        if let Some(allocation) = self.inner.allocation.lock().unwrap().as_mut() {
            allocation.lifetime = lifetime;
        }
        self.set_state(TurnState::Allocated);
        self.schedule_allocation_refresh(lifetime);
        debug!(?lifetime, "allocation refreshed");
        Ok(())
    }

    async fn refresh_channel(&self, number: u16, peer: SocketAddr) -> Result<()> {
        self.require_allocated()?;
        self.request_authed(move || {
            let mut msg = StunMessage::request(Method::ChannelBind);
            msg.add_attribute(StunAttribute::channel_number(number));
            msg.add_attribute(StunAttribute::xor_peer_address(peer, &msg.transaction_id));
            msg
        })
        .await?;
        let renew_at = self.inner.config.channel_lifetime * 9 / 10;
        self.inner
            .timers
            .schedule(renew_at, TurnTimer::RefreshChannel(number, peer));
        Ok(())
    }

    fn schedule_allocation_refresh(&self, lifetime: Duration) {
        self.inner.timers.schedule(
            refresh_delay(lifetime, self.inner.config.refresh_lead),
            TurnTimer::RefreshAllocation,
        );
    }

    async fn expire(&self) {
        *self.inner.allocation.lock().unwrap() = None;
        self.set_state(TurnState::Expired);
        self.emit(TurnEvent::AllocationExpired).await;
    }

    /// Issue a request with long-term-credential handling: on 401 or 438
    /// the realm/nonce are taken from the error response and the request is
    /// retried once, authenticated.
    async fn request_authed(
        &self,
        build: impl Fn() -> StunMessage,
    ) -> Result<StunMessage> {
        for attempt in 0..2 {
            let mut msg = build();
            let (key, attrs) = self.auth_attributes();
            for attr in attrs {
                msg.add_attribute(attr);
            }

            let handle =
                self.inner
                    .session
                    .send_request(msg, self.inner.config.server, key.as_deref())?;
            match handle.result().await {
                TransactionResult::Response { message, .. } => return Ok(message),
                TransactionResult::ServerError {
                    code: code @ (401 | 438),
                    message,
                    reason,
                } => {
                    if attempt == 0 && self.absorb_challenge(&message) {
                        debug!(code, "retrying with long-term credentials");
                        continue;
                    }
                    return Err(StunError::ServerError { code, reason });
                }
                TransactionResult::ServerError { code, reason, .. } => {
                    return Err(StunError::ServerError { code, reason });
                }
                TransactionResult::Timeout => return Err(StunError::TransactionTimeout),
                TransactionResult::Cancelled => return Err(StunError::Cancelled),
            }
        }
        unreachable!("authenticated retry loop runs at most twice");
    }

    /// Record realm and nonce from a 401/438 challenge. Returns false when
    /// the challenge is unusable (missing attributes).
    fn absorb_challenge(&self, message: &StunMessage) -> bool {
        let realm = message
            .get_attribute(StunAttributeType::Realm)
            .and_then(|attr| attr.as_str().ok().map(str::to_owned));
        let nonce = message
            .get_attribute(StunAttributeType::Nonce)
            .map(|attr| attr.value.to_vec());
        let (Some(realm), Some(nonce)) = (realm, nonce) else {
            return false;
        };

        let key = self.inner.config.credentials.long_term_key(&realm);
        let mut auth = self.inner.auth.lock().unwrap();
        auth.realm = Some(realm);
        auth.nonce = Some(nonce);
        auth.key = Some(key);
        true
    }

    /// The current authentication attributes and key, if a challenge has
    /// been absorbed.
    fn auth_attributes(&self) -> (Option<Vec<u8>>, Vec<StunAttribute>) {
        let auth = self.inner.auth.lock().unwrap();
        let (Some(realm), Some(nonce), Some(key)) = (&auth.realm, &auth.nonce, &auth.key) else {
            return (None, Vec::new());
        };
        let attrs = vec![
            StunAttribute::username(&self.inner.config.credentials.username),
            StunAttribute::realm(realm),
            StunAttribute::nonce(nonce),
        ];
        (Some(key.clone()), attrs)
    }

    fn require_allocated(&self) -> Result<()> {
        match self.state() {
            TurnState::Allocated | TurnState::Refreshing => Ok(()),
            other => Err(StunError::InvalidState(format!(
                "allocation is {other:?}"
            ))),
        }
    }

    fn transition(&self, from: TurnState, to: TurnState) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        if *state != from {
            return Err(StunError::InvalidState(format!(
                "expected {from:?}, found {:?}",
                *state
            )));
        }
        *state = to;
        Ok(())
    }

    fn set_state(&self, to: TurnState) {
        *self.inner.state.lock().unwrap() = to;
    }

    async fn emit(&self, event: TurnEvent) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.event_tx.send(event).await;
    }
}

/// Floor on the delay before an allocation refresh.
const MIN_REFRESH_DELAY: Duration = Duration::from_secs(1);

/// Refresh `lead` before expiry, capped at half the lifetime for short
/// grants and floored at [`MIN_REFRESH_DELAY`] for degenerate ones.
fn refresh_delay(lifetime: Duration, lead: Duration) -> Duration {
    let lead = lead.min(lifetime / 2);
    (lifetime - lead).max(MIN_REFRESH_DELAY)
}

impl std::fmt::Debug for TurnClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnClient")
            .field("server", &self.inner.config.server)
            .field("state", &self.state())
            .field("relay", &self.relay_addr())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_delay_leads_expiry() {
        assert_eq!(
            refresh_delay(Duration::from_secs(600), Duration::from_secs(60)),
            Duration::from_secs(540)
        );
        // Short grants: the lead caps at half the lifetime.
        assert_eq!(
            refresh_delay(Duration::from_secs(4), Duration::from_secs(60)),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn refresh_delay_never_immediate() {
        assert!(refresh_delay(Duration::ZERO, Duration::from_secs(60)) >= MIN_REFRESH_DELAY);
        assert!(refresh_delay(Duration::from_millis(10), Duration::ZERO) >= MIN_REFRESH_DELAY);
    }
}
