//! ICE candidates: types, priorities, foundations and the SDP-style
//! exchange format (RFC 8445 section 5.1, RFC 8839 section 5.1).

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Candidate type, ordered by type preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandidateType {
    /// Address of a local interface.
    Host,
    /// Learned from the source of an inbound connectivity check.
    PeerReflexive,
    /// Learned from a STUN Binding response (the NAT's public mapping).
    ServerReflexive,
    /// A TURN relay address.
    Relayed,
}

impl CandidateType {
    /// RFC 8445 recommended type preferences.
    pub fn type_preference(self) -> u32 {
        match self {
            CandidateType::Host => 126,
            CandidateType::PeerReflexive => 110,
            CandidateType::ServerReflexive => 100,
            CandidateType::Relayed => 0,
        }
    }

    fn keyword(self) -> &'static str {
        match self {
            CandidateType::Host => "host",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::Relayed => "relay",
        }
    }

    fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "host" => Some(CandidateType::Host),
            "prflx" => Some(CandidateType::PeerReflexive),
            "srflx" => Some(CandidateType::ServerReflexive),
            "relay" => Some(CandidateType::Relayed),
            _ => None,
        }
    }
}

impl std::fmt::Display for CandidateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.keyword())
    }
}

/// One transport address offered for a component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    /// Media component this candidate belongs to (1-based).
    pub component: u8,
    pub candidate_type: CandidateType,
    /// The advertised transport address.
    pub addr: SocketAddr,
    /// The local socket the candidate is reached through. Equal to `addr`
    /// for host candidates; the host socket for reflexive candidates; the
    /// relay address for relayed candidates.
    pub base: SocketAddr,
    pub priority: u32,
    pub foundation: String,
}

impl Candidate {
    /// Create a host candidate on a local socket.
    pub fn host(component: u8, addr: SocketAddr) -> Self {
        Self::build(component, CandidateType::Host, addr, addr, 65535)
    }

    /// Create a server-reflexive candidate: `mapped` as seen by the STUN
    /// server, reached through the local socket at `base`.
    pub fn server_reflexive(component: u8, mapped: SocketAddr, base: SocketAddr) -> Self {
        Self::build(component, CandidateType::ServerReflexive, mapped, base, 65535)
    }

    /// Create a peer-reflexive candidate with an explicit priority (taken
    /// from the PRIORITY attribute of the revealing check).
    pub fn peer_reflexive(
        component: u8,
        addr: SocketAddr,
        base: SocketAddr,
        priority: u32,
    ) -> Self {
        let mut candidate =
            Self::build(component, CandidateType::PeerReflexive, addr, base, 65535);
        candidate.priority = priority;
        candidate
    }

    /// Create a relayed candidate at a TURN allocation's relay address.
    pub fn relayed(component: u8, relay: SocketAddr) -> Self {
        Self::build(component, CandidateType::Relayed, relay, relay, 65535)
    }

    fn build(
        component: u8,
        candidate_type: CandidateType,
        addr: SocketAddr,
        base: SocketAddr,
        local_preference: u32,
    ) -> Self {
        Candidate {
            component,
            candidate_type,
            addr,
            base,
            priority: compute_priority(candidate_type, local_preference, component),
            foundation: compute_foundation(candidate_type, base),
        }
    }

    /// Format as an SDP candidate line (without the `a=` prefix).
    pub fn to_sdp_string(&self) -> String {
        let mut line = format!(
            "candidate:{} {} UDP {} {} {} typ {}",
            self.foundation,
            self.component,
            self.priority,
            self.addr.ip(),
            self.addr.port(),
            self.candidate_type,
        );
        if self.candidate_type != CandidateType::Host {
            line.push_str(&format!(" raddr {} rport {}", self.base.ip(), self.base.port()));
        }
        line
    }

    /// Parse an SDP candidate line. Accepts with or without the
    /// `candidate:` prefix; only UDP candidates are understood.
    pub fn from_sdp_string(line: &str) -> Result<Self, Error> {
        let line = line.trim().strip_prefix("a=").unwrap_or(line.trim());
        let rest = line.strip_prefix("candidate:").unwrap_or(line);
        let fields: Vec<&str> = rest.split_whitespace().collect();
        if fields.len() < 8 {
            return Err(Error::InvalidCandidate(format!(
                "too few fields in {line:?}"
            )));
        }

        let foundation = fields[0].to_string();
        let component: u8 = fields[1]
            .parse()
            .map_err(|_| Error::InvalidCandidate(format!("bad component {:?}", fields[1])))?;
        if !fields[2].eq_ignore_ascii_case("udp") {
            return Err(Error::InvalidCandidate(format!(
                "unsupported transport {:?}",
                fields[2]
            )));
        }
        let priority: u32 = fields[3]
            .parse()
            .map_err(|_| Error::InvalidCandidate(format!("bad priority {:?}", fields[3])))?;
        let addr = parse_addr(fields[4], fields[5])?;
        if fields[6] != "typ" {
            return Err(Error::InvalidCandidate(format!(
                "expected 'typ', found {:?}",
                fields[6]
            )));
        }
        let candidate_type = CandidateType::from_keyword(fields[7])
            .ok_or_else(|| Error::InvalidCandidate(format!("unknown type {:?}", fields[7])))?;

        // Optional raddr/rport give the base for non-host candidates.
        let mut base = addr;
        let mut index = 8;
        while index + 1 < fields.len() {
            match fields[index] {
                "raddr" if index + 3 < fields.len() && fields[index + 2] == "rport" => {
                    base = parse_addr(fields[index + 1], fields[index + 3])?;
                    index += 4;
                }
                _ => index += 2,
            }
        }

        Ok(Candidate {
            component,
            candidate_type,
            addr,
            base,
            priority,
            foundation,
        })
    }
}

impl std::fmt::Display for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} {} (component {})",
            self.candidate_type, self.foundation, self.addr, self.component
        )
    }
}

fn parse_addr(ip: &str, port: &str) -> Result<SocketAddr, Error> {
    let ip = ip
        .parse()
        .map_err(|_| Error::InvalidCandidate(format!("bad address {ip:?}")))?;
    let port = port
        .parse()
        .map_err(|_| Error::InvalidCandidate(format!("bad port {port:?}")))?;
    Ok(SocketAddr::new(ip, port))
}

/// RFC 8445 section 5.1.2.1:
/// `priority = 2^24·type-pref + 2^8·local-pref + (256 - component)`.
pub fn compute_priority(candidate_type: CandidateType, local_preference: u32, component: u8) -> u32 {
    (candidate_type.type_preference() << 24)
        + ((local_preference & 0xFFFF) << 8)
        + (256 - u32::from(component))
}

/// Foundation: equal for candidates sharing type and base address, so that
/// pairs over equivalent paths unfreeze together.
fn compute_foundation(candidate_type: CandidateType, base: SocketAddr) -> String {
    let mut hasher = DefaultHasher::new();
    candidate_type.hash(&mut hasher);
    base.ip().hash(&mut hasher);
    format!("{:x}", hasher.finish() & 0xFFFF_FFFF)
}
