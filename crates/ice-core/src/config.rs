//! ICE agent configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use rnat_infra_common::RetransmitProfile;
use rnat_stun_core::Credentials;

/// The agent's role in the negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IceRole {
    /// Decides nomination; wins role conflicts with the higher tie-breaker.
    Controlling,
    Controlled,
}

impl IceRole {
    /// The opposite role, taken after losing a role conflict.
    pub fn flipped(self) -> Self {
        match self {
            IceRole::Controlling => IceRole::Controlled,
            IceRole::Controlled => IceRole::Controlling,
        }
    }
}

/// Nomination strategy for the controlling agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NominationMode {
    /// USE-CANDIDATE on every check; the first success is nominated.
    Aggressive,
    /// Checks first, then one nominating re-check of the best valid pair.
    Regular,
}

/// A TURN server to allocate a relayed candidate from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServerConfig {
    pub server: SocketAddr,
    pub credentials: Credentials,
}

/// Local ufrag/pwd advertised to the peer; checks are authenticated with
/// the short-term credential mechanism built from these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

impl IceCredentials {
    /// Random credentials of the RFC 8445 minimum sizes (ufrag 4+,
    /// pwd 22+ characters).
    pub fn random() -> Self {
        IceCredentials {
            ufrag: random_string(8),
            pwd: random_string(24),
        }
    }
}

fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// ICE agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    /// Address to bind component sockets on. Port is always ephemeral.
    pub bind_addr: IpAddr,
    /// Number of media components (1-based ids).
    pub components: u8,
    /// Components excluded from gathering and checks.
    pub disabled_components: Vec<u8>,
    /// STUN servers for server-reflexive gathering.
    pub stun_servers: Vec<SocketAddr>,
    /// TURN servers for relayed gathering.
    pub turn_servers: Vec<TurnServerConfig>,
    /// Gather host candidates.
    pub gather_host: bool,
    /// Gather server-reflexive candidates (needs `stun_servers`).
    pub gather_srflx: bool,
    /// Gather relayed candidates (needs `turn_servers`).
    pub gather_relay: bool,
    pub nomination: NominationMode,
    /// Ta: pacing interval between successive connectivity checks.
    pub check_interval: Duration,
    /// Retransmission timing for checks and gathering requests.
    #[serde(skip, default)]
    pub profile: RetransmitProfile,
    /// Wait after the first valid pair before regular nomination, letting
    /// higher-priority checks land. Defaults to 4x the initial RTO.
    pub nominated_check_delay: Option<Duration>,
    /// Binding-indication keep-alive interval on the selected pair.
    pub keep_alive_interval: Duration,
    /// Upper bound on the whole gathering phase.
    pub max_gathering_time: Duration,
}

impl Default for IceConfig {
    fn default() -> Self {
        IceConfig {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            components: 1,
            disabled_components: Vec::new(),
            stun_servers: Vec::new(),
            turn_servers: Vec::new(),
            gather_host: true,
            gather_srflx: true,
            gather_relay: true,
            nomination: NominationMode::Aggressive,
            check_interval: Duration::from_millis(20),
            profile: RetransmitProfile::default(),
            nominated_check_delay: None,
            keep_alive_interval: Duration::from_secs(15),
            max_gathering_time: Duration::from_secs(10),
        }
    }
}

impl IceConfig {
    /// The component ids that take part, in order.
    pub fn enabled_components(&self) -> Vec<u8> {
        (1..=self.components)
            .filter(|id| !self.disabled_components.contains(id))
            .collect()
    }

    /// Effective nominated-check delay.
    pub fn effective_nominated_check_delay(&self) -> Duration {
        self.nominated_check_delay
            .unwrap_or(self.profile.initial_rto * 4)
    }
}
