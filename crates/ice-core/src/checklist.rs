//! Candidate pairing and the per-component check list (RFC 8445
//! sections 6.1.2 and 7.2.5.3).

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::candidate::{Candidate, CandidateType};

/// Connectivity-check state of one pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    /// Not yet eligible; waits for its foundation group to unfreeze.
    Frozen,
    /// Eligible for the next pacing slot.
    Waiting,
    /// A check transaction is outstanding.
    InProgress,
    /// A check succeeded; the pair is valid.
    Succeeded,
    /// The check timed out or was rejected.
    Failed,
}

/// One (local, remote) combination under consideration.
#[derive(Debug, Clone)]
pub struct CandidatePair {
    pub local: Candidate,
    pub remote: Candidate,
    pub priority: u64,
    pub state: PairState,
    /// Confirmed by a nominating check.
    pub nominated: bool,
    /// A nominating check is wanted for this pair (inbound USE-CANDIDATE
    /// seen before the pair succeeded, or a pending controlling re-check).
    pub nomination_pending: bool,
}

impl CandidatePair {
    pub fn new(local: Candidate, remote: Candidate, controlling: bool) -> Self {
        let priority = pair_priority(local.priority, remote.priority, controlling);
        CandidatePair {
            local,
            remote,
            priority,
            state: PairState::Frozen,
            nominated: false,
            nomination_pending: false,
        }
    }

    /// Foundation of the pair, the unfreezing group key.
    pub fn foundation(&self) -> String {
        format!("{}:{}", self.local.foundation, self.remote.foundation)
    }

    /// Whether the pair has terminally succeeded or failed.
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, PairState::Succeeded | PairState::Failed)
    }
}

impl std::fmt::Display for CandidatePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} -> {} [{:?}{}]",
            self.local.addr,
            self.remote.addr,
            self.state,
            if self.nominated { ", nominated" } else { "" }
        )
    }
}

/// RFC 8445 section 6.1.2.3:
/// `2^32·MIN(G,D) + 2·MAX(G,D) + (G>D ? 1 : 0)` where G is the
/// controlling side's candidate priority and D the controlled side's.
pub fn pair_priority(local: u32, remote: u32, controlling: bool) -> u64 {
    let (g, d) = if controlling {
        (u64::from(local), u64::from(remote))
    } else {
        (u64::from(remote), u64::from(local))
    };
    (1u64 << 32) * g.min(d) + 2 * g.max(d) + u64::from(g > d)
}

/// The ordered pair list for one component.
#[derive(Debug)]
pub struct CheckList {
    pub component: u8,
    pub pairs: Vec<CandidatePair>,
}

impl CheckList {
    /// Form, prune and sort the list from the candidate sets.
    ///
    /// Server-reflexive local candidates are replaced by their base before
    /// pairing (the check leaves from the base socket either way), then
    /// redundant pairs sharing (local base, remote) keep only the highest
    /// pair priority. Ties keep the earlier pair after the priority sort,
    /// which is the one with the higher-priority local candidate.
    pub fn form(
        component: u8,
        locals: &[Candidate],
        remotes: &[Candidate],
        controlling: bool,
    ) -> Self {
        let mut pairs = Vec::new();
        for local in locals.iter().filter(|c| c.component == component) {
            let local = match local.candidate_type {
                CandidateType::ServerReflexive | CandidateType::PeerReflexive => {
                    let mut base_candidate = local.clone();
                    base_candidate.addr = local.base;
                    base_candidate
                }
                _ => local.clone(),
            };
            for remote in remotes.iter().filter(|c| c.component == component) {
                pairs.push(CandidatePair::new(local.clone(), remote.clone(), controlling));
            }
        }

        pairs.sort_by(|a, b| b.priority.cmp(&a.priority));

        // Prune: first occurrence per (local base, remote address) wins.
        let mut seen: HashMap<(SocketAddr, SocketAddr), ()> = HashMap::new();
        pairs.retain(|pair| {
            seen.insert((pair.local.base, pair.remote.addr), ())
                .is_none()
        });

        CheckList { component, pairs }
    }

    /// Initial unfreeze: the highest-priority pair of each foundation
    /// group becomes Waiting.
    pub fn unfreeze_initial(&mut self) {
        let mut unfrozen: HashMap<String, ()> = HashMap::new();
        for pair in &mut self.pairs {
            if pair.state == PairState::Frozen
                && unfrozen.insert(pair.foundation(), ()).is_none()
            {
                pair.state = PairState::Waiting;
            }
        }
    }

    /// After a success, unfreeze the remaining pairs sharing the
    /// foundation.
    pub fn unfreeze_foundation(&mut self, foundation: &str) {
        for pair in &mut self.pairs {
            if pair.state == PairState::Frozen && pair.foundation() == foundation {
                pair.state = PairState::Waiting;
            }
        }
    }

    /// The highest-priority Waiting pair, if any.
    pub fn next_waiting(&mut self) -> Option<&mut CandidatePair> {
        self.pairs
            .iter_mut()
            .find(|pair| pair.state == PairState::Waiting)
    }

    /// Find the pair for a remote address on the direct or relayed path.
    /// After pruning at most one of each exists per remote.
    pub fn find_pair(&mut self, remote: SocketAddr, relayed: bool) -> Option<&mut CandidatePair> {
        self.pairs.iter_mut().find(|pair| {
            pair.remote.addr == remote
                && (pair.local.candidate_type == CandidateType::Relayed) == relayed
        })
    }

    /// Whether a nominated valid pair exists.
    pub fn nominated(&self) -> Option<&CandidatePair> {
        self.pairs
            .iter()
            .find(|pair| pair.nominated && pair.state == PairState::Succeeded)
    }

    /// The highest-priority valid pair.
    pub fn best_valid(&self) -> Option<&CandidatePair> {
        self.pairs
            .iter()
            .find(|pair| pair.state == PairState::Succeeded)
    }

    /// All pairs have resolved and none succeeded.
    pub fn exhausted(&self) -> bool {
        !self.pairs.is_empty()
            && self
                .pairs
                .iter()
                .all(|pair| pair.state == PairState::Failed)
    }

    /// No pair remains schedulable or in flight.
    pub fn settled(&self) -> bool {
        self.pairs.iter().all(CandidatePair::is_terminal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::Candidate;

    fn host(component: u8, addr: &str) -> Candidate {
        Candidate::host(component, addr.parse().unwrap())
    }

    #[test]
    fn pair_priority_reference_values() {
        // Symmetric in the candidate priorities regardless of role naming.
        let controlling = pair_priority(100, 200, true);
        let controlled = pair_priority(200, 100, false);
        assert_eq!(controlling, controlled);

        // G > D sets the low bit.
        assert_eq!(pair_priority(2, 1, true), (1u64 << 32) + 4 + 1);
        assert_eq!(pair_priority(1, 2, true), (1u64 << 32) + 4);
    }

    #[test]
    fn pairs_sorted_descending() {
        let locals = vec![host(1, "192.168.1.1:4000")];
        let remotes = vec![
            Candidate::relayed(1, "203.0.113.5:50000".parse().unwrap()),
            host(1, "192.168.1.2:4000"),
        ];
        let list = CheckList::form(1, &locals, &remotes, true);
        assert_eq!(list.pairs.len(), 2);
        assert!(list.pairs[0].priority >= list.pairs[1].priority);
        assert_eq!(list.pairs[0].remote.addr, "192.168.1.2:4000".parse().unwrap());
    }

    #[test]
    fn srflx_local_pairs_by_base_and_prunes_against_host() {
        let base = "192.168.1.1:4000";
        let locals = vec![
            host(1, base),
            Candidate::server_reflexive(
                1,
                "203.0.113.1:31000".parse().unwrap(),
                base.parse().unwrap(),
            ),
        ];
        let remotes = vec![host(1, "192.168.1.2:4000")];
        let list = CheckList::form(1, &locals, &remotes, true);
        // Both locals collapse onto the same (base, remote): one pair left,
        // and it is the host one (higher candidate priority).
        assert_eq!(list.pairs.len(), 1);
        assert_eq!(list.pairs[0].local.candidate_type, CandidateType::Host);
    }

    #[test]
    fn pruning_keeps_highest_priority_per_key() {
        let locals = vec![host(1, "192.168.1.1:4000")];
        let remotes = vec![host(1, "192.168.1.2:4000"), host(1, "192.168.1.2:4002")];
        let list = CheckList::form(1, &locals, &remotes, true);
        // Distinct remote addresses: nothing pruned.
        assert_eq!(list.pairs.len(), 2);
    }

    #[test]
    fn component_filter() {
        let locals = vec![host(1, "192.168.1.1:4000"), host(2, "192.168.1.1:4001")];
        let remotes = vec![host(1, "192.168.1.2:4000"), host(2, "192.168.1.2:4001")];
        let list = CheckList::form(2, &locals, &remotes, true);
        assert_eq!(list.pairs.len(), 1);
        assert_eq!(list.pairs[0].local.component, 2);
    }

    #[test]
    fn unfreeze_initial_takes_one_per_foundation() {
        let locals = vec![host(1, "192.168.1.1:4000")];
        let remotes = vec![host(1, "192.168.1.2:4000"), host(1, "192.168.1.2:4002")];
        let mut list = CheckList::form(1, &locals, &remotes, true);
        list.unfreeze_initial();
        // Both pairs share foundations (same ips): exactly one Waiting.
        let waiting = list
            .pairs
            .iter()
            .filter(|pair| pair.state == PairState::Waiting)
            .count();
        assert_eq!(waiting, 1);

        // Success on it unfreezes the sibling.
        let foundation = list.pairs[0].foundation();
        list.pairs[0].state = PairState::Succeeded;
        list.unfreeze_foundation(&foundation);
        assert_eq!(list.pairs[1].state, PairState::Waiting);
    }

    #[test]
    fn exhausted_only_when_all_failed() {
        let locals = vec![host(1, "192.168.1.1:4000")];
        let remotes = vec![host(1, "192.168.1.2:4000"), host(1, "192.168.1.2:4002")];
        let mut list = CheckList::form(1, &locals, &remotes, true);
        assert!(!list.exhausted());
        list.pairs[0].state = PairState::Failed;
        assert!(!list.exhausted());
        list.pairs[1].state = PairState::Failed;
        assert!(list.exhausted());
        assert!(list.settled());
    }
}
