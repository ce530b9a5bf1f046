//! The ICE agent: gathering, pairing, paced connectivity checks,
//! nomination and the per-component data path (RFC 8445).
//!
//! One agent owns one UDP socket per component (wrapped in a
//! [`StunSession`]) plus optional TURN clients for relayed candidates.
//! Checks are ordinary STUN transactions on the component socket;
//! relay-path checks travel through the TURN client's Send/Data
//! indications and are matched by transaction id in the agent.
//!
//! Teardown follows the same contract as the STUN session: `close` is
//! idempotent, may race in-flight checks and timers, and no event is
//! delivered after it returns.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::random;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, trace, warn};

use rnat_infra_common::TimerQueue;
use rnat_stun_core::{
    short_term_key, verify_integrity, Method, StunAttribute, StunAttributeType, StunConfig,
    StunMessage, StunSession, StunSessionHandler, TransactionId, TransactionResult,
};
use rnat_turn_core::{TurnClient, TurnConfig, TurnEvent};

use crate::candidate::{compute_priority, Candidate, CandidateType};
use crate::checklist::{CandidatePair, CheckList, PairState};
use crate::config::{IceConfig, IceCredentials, IceRole, NominationMode};
use crate::error::{Error, Result};

/// Agent lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Gathering,
    /// Gathering done; waiting for the remote description.
    Negotiating,
    Checking,
    Completed,
    Failed,
    Closed,
}

impl std::fmt::Display for IceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Gathering => write!(f, "gathering"),
            Self::Negotiating => write!(f, "negotiating"),
            Self::Checking => write!(f, "checking"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Events delivered to the agent's owner.
#[derive(Debug, Clone)]
pub enum IceEvent {
    StateChange(IceState),
    /// A local candidate became usable (host, srflx, relay or prflx).
    CandidateGathered(Candidate),
    /// Every gathering transaction has resolved.
    GatheringComplete,
    /// A component selected its nominated pair.
    SelectedPair {
        component: u8,
        local: Candidate,
        remote: Candidate,
    },
    /// Application data arrived on a component.
    Data {
        component: u8,
        data: Bytes,
        source: SocketAddr,
    },
    /// Every component has a nominated pair. Reported exactly once.
    Completed,
    /// Terminal failure. Reported exactly once.
    Failed(String),
}

#[derive(Debug, Clone, Copy)]
enum IceTimer {
    /// Release the next Waiting pair (Ta pacing).
    Pace,
    /// Regular nomination decision for a component.
    Nominate(u8),
    /// Binding-indication keep-alive on the selected pairs.
    KeepAlive,
}

/// Per-component sockets.
struct ComponentIo {
    component: u8,
    session: StunSession,
    base: SocketAddr,
    turn: Option<TurnClient>,
    relay: Option<SocketAddr>,
}

struct AgentInner {
    config: IceConfig,
    local_creds: IceCredentials,
    remote_creds: Mutex<Option<IceCredentials>>,
    role: Mutex<IceRole>,
    tiebreaker: u64,
    state: Mutex<IceState>,
    components: Mutex<Vec<ComponentIo>>,
    local_candidates: Mutex<Vec<Candidate>>,
    remote_candidates: Mutex<Vec<Candidate>>,
    checklists: Mutex<HashMap<u8, CheckList>>,
    /// Triggered-check queue: (component, remote address, relayed path),
    /// head first.
    triggered: Mutex<VecDeque<(u8, SocketAddr, bool)>>,
    /// Inbound checks that arrived before the check lists existed,
    /// replayed when they form. The peer may legitimately start checking
    /// as soon as signaling hands it our candidates.
    early_checks: Mutex<Vec<EarlyCheck>>,
    /// Outstanding relay-path checks by transaction id.
    relay_pending: Mutex<HashMap<TransactionId, oneshot::Sender<StunMessage>>>,
    /// Components with a nomination timer already armed.
    nomination_armed: Mutex<HashSet<u8>>,
    pace_armed: AtomicBool,
    timers: TimerQueue<IceTimer>,
    event_tx: mpsc::Sender<IceEvent>,
    closed: AtomicBool,
    /// Completed/Failed latch.
    terminal: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// ICE agent. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct IceAgent {
    inner: Arc<AgentInner>,
}

/// Session handler for one component's direct socket.
struct CheckHandler {
    inner: Weak<AgentInner>,
    component: u8,
}

#[async_trait]
impl StunSessionHandler for CheckHandler {
    async fn on_request(
        &self,
        session: &StunSession,
        message: StunMessage,
        raw: Bytes,
        source: SocketAddr,
    ) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let agent = IceAgent { inner };
        agent
            .handle_inbound_check(self.component, message, raw, source, Via::Direct(session.clone()))
            .await;
    }

    async fn on_indication(&self, _session: &StunSession, message: StunMessage, source: SocketAddr) {
        trace!(%source, method = ?message.method, "keep-alive indication");
    }

    async fn on_raw(&self, _session: &StunSession, data: Bytes, source: SocketAddr) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let agent = IceAgent { inner };
        agent.deliver_data(self.component, data, source).await;
    }
}

/// How a check (or its response) travels.
#[derive(Clone)]
enum Via {
    Direct(StunSession),
    Relay(TurnClient),
}

impl IceAgent {
    /// Create an agent. Events arrive on the returned receiver. Must be
    /// called within a tokio runtime.
    pub fn new(config: IceConfig) -> (Self, mpsc::Receiver<IceEvent>) {
        let (event_tx, event_rx) = mpsc::channel(128);
        let (timers, timer_rx) = TimerQueue::new();

        let inner = Arc::new(AgentInner {
            config,
            local_creds: IceCredentials::random(),
            remote_creds: Mutex::new(None),
            role: Mutex::new(IceRole::Controlled),
            tiebreaker: random::<u64>(),
            state: Mutex::new(IceState::New),
            components: Mutex::new(Vec::new()),
            local_candidates: Mutex::new(Vec::new()),
            remote_candidates: Mutex::new(Vec::new()),
            checklists: Mutex::new(HashMap::new()),
            triggered: Mutex::new(VecDeque::new()),
            early_checks: Mutex::new(Vec::new()),
            relay_pending: Mutex::new(HashMap::new()),
            nomination_armed: Mutex::new(HashSet::new()),
            pace_armed: AtomicBool::new(false),
            timers,
            event_tx,
            closed: AtomicBool::new(false),
            terminal: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let agent = IceAgent { inner };
        let driver = agent.clone();
        let handle = tokio::spawn(async move {
            driver.timer_loop(timer_rx).await;
        });
        agent.inner.tasks.lock().unwrap().push(handle);

        (agent, event_rx)
    }

    /// Local ufrag/pwd to hand to the signaling layer.
    pub fn local_credentials(&self) -> IceCredentials {
        self.inner.local_creds.clone()
    }

    /// Install the peer's ufrag/pwd received over signaling.
    pub fn set_remote_credentials(&self, creds: IceCredentials) {
        *self.inner.remote_creds.lock().unwrap() = Some(creds);
    }

    pub fn role(&self) -> IceRole {
        *self.inner.role.lock().unwrap()
    }

    /// The tie-breaker drawn at construction; the higher value wins role
    /// conflicts.
    pub fn tie_breaker(&self) -> u64 {
        self.inner.tiebreaker
    }

    pub fn set_role(&self, role: IceRole) {
        let mut guard = self.inner.role.lock().unwrap();
        if *guard != role {
            debug!(?role, "ice role set");
            *guard = role;
        }
    }

    pub fn state(&self) -> IceState {
        *self.inner.state.lock().unwrap()
    }

    pub fn local_candidates(&self) -> Vec<Candidate> {
        self.inner.local_candidates.lock().unwrap().clone()
    }

    /// The nominated (local, remote) pair for a component, once selected.
    pub fn selected_pair(&self, component: u8) -> Option<(Candidate, Candidate)> {
        let checklists = self.inner.checklists.lock().unwrap();
        let pair = checklists.get(&component)?.nominated()?;
        Some((pair.local.clone(), pair.remote.clone()))
    }

    /// Gather local candidates for every enabled component.
    ///
    /// Host candidates come from a fresh UDP socket per component;
    /// server-reflexive ones from a Binding request to each configured
    /// STUN server; relayed ones from a TURN allocation. Gathering
    /// finishes when every gathering transaction has resolved, success or
    /// timeout: one dead server delays completion by at most its
    /// retransmit budget, bounded overall by `max_gathering_time`.
    pub async fn gather(&self) -> Result<()> {
        self.transition(IceState::New, IceState::Gathering)?;
        info!(components = ?self.inner.config.enabled_components(), "gathering candidates");

        for component in self.inner.config.enabled_components() {
            self.bind_component(component).await?;
        }

        let deadline = tokio::time::Instant::now() + self.inner.config.max_gathering_time;
        let mut tasks = JoinSet::new();
        if self.inner.config.gather_srflx {
            self.spawn_srflx_gathering(&mut tasks);
        }
        if self.inner.config.gather_relay {
            self.spawn_relay_gathering(&mut tasks);
        }
        while let Ok(Some(_)) =
            tokio::time::timeout_at(deadline, tasks.join_next()).await
        {
            if self.inner.closed.load(Ordering::SeqCst) {
                return Err(Error::InvalidState("agent closed".to_string()));
            }
        }
        tasks.abort_all();

        // Every component must have produced something usable.
        for component in self.inner.config.enabled_components() {
            let usable = self
                .inner
                .local_candidates
                .lock()
                .unwrap()
                .iter()
                .any(|c| c.component == component);
            if !usable {
                let error = Error::NoCandidates(component);
                self.fail(error.to_string()).await;
                return Err(error);
            }
        }

        self.set_state(IceState::Negotiating).await;
        self.emit(IceEvent::GatheringComplete).await;
        Ok(())
    }

    async fn bind_component(&self, component: u8) -> Result<()> {
        let socket = Arc::new(
            UdpSocket::bind(SocketAddr::new(self.inner.config.bind_addr, 0)).await?,
        );
        let base = socket.local_addr()?;
        let handler = Arc::new(CheckHandler {
            inner: Arc::downgrade(&self.inner),
            component,
        });
        let session = StunSession::new(
            socket,
            StunConfig {
                profile: self.inner.config.profile,
                ..StunConfig::default()
            },
            handler,
        );
        self.inner.components.lock().unwrap().push(ComponentIo {
            component,
            session,
            base,
            turn: None,
            relay: None,
        });

        if self.inner.config.gather_host {
            let candidate = Candidate::host(component, base);
            self.add_local_candidate(candidate).await;
        }
        Ok(())
    }

    fn spawn_srflx_gathering(&self, tasks: &mut JoinSet<()>) {
        let components: Vec<(u8, StunSession, SocketAddr)> = {
            let components = self.inner.components.lock().unwrap();
            components
                .iter()
                .map(|io| (io.component, io.session.clone(), io.base))
                .collect()
        };
        for server in self.inner.config.stun_servers.clone() {
            for (component, session, base) in components.clone() {
                let agent = self.clone();
                tasks.spawn(async move {
                    match session
                        .request(StunMessage::binding_request(), server, None)
                        .await
                    {
                        Ok((response, _raw, _source)) => {
                            let Some(mapped) = response
                                .get_attribute(StunAttributeType::XorMappedAddress)
                                .and_then(|a| a.as_xor_address(&response.transaction_id).ok())
                            else {
                                warn!(%server, "binding response without mapped address");
                                return;
                            };
                            if mapped != base {
                                let candidate =
                                    Candidate::server_reflexive(component, mapped, base);
                                agent.add_local_candidate(candidate).await;
                            }
                        }
                        Err(e) => debug!(%server, component, "srflx gathering failed: {e}"),
                    }
                });
            }
        }
    }

    fn spawn_relay_gathering(&self, tasks: &mut JoinSet<()>) {
        for turn_server in self.inner.config.turn_servers.clone() {
            for component in self.inner.config.enabled_components() {
                let agent = self.clone();
                let turn_server = turn_server.clone();
                tasks.spawn(async move {
                    if let Err(e) = agent.allocate_relay(component, turn_server).await {
                        debug!(component, "relay gathering failed: {e}");
                    }
                });
            }
        }
    }

    async fn allocate_relay(
        &self,
        component: u8,
        turn_server: crate::config::TurnServerConfig,
    ) -> Result<()> {
        // One relay per component: skip if an earlier server already won.
        {
            let components = self.inner.components.lock().unwrap();
            if components
                .iter()
                .any(|io| io.component == component && io.turn.is_some())
            {
                return Ok(());
            }
        }

        let socket = Arc::new(
            UdpSocket::bind(SocketAddr::new(self.inner.config.bind_addr, 0)).await?,
        );
        let turn_config = TurnConfig {
            stun: StunConfig {
                profile: self.inner.config.profile,
                ..StunConfig::default()
            },
            ..TurnConfig::new(turn_server.server, turn_server.credentials)
        };
        let (client, event_rx) = TurnClient::new(socket, turn_config);
        let allocation = client.allocate().await?;

        let stored = {
            let mut components = self.inner.components.lock().unwrap();
            match components
                .iter_mut()
                .find(|io| io.component == component && io.turn.is_none())
            {
                Some(io) => {
                    io.turn = Some(client.clone());
                    io.relay = Some(allocation.relay);
                    true
                }
                None => false,
            }
        };
        if !stored {
            client.close().await;
            return Ok(());
        }

        let pump = self.clone();
        let pump_client = client.clone();
        let handle = tokio::spawn(async move {
            pump.relay_pump(component, pump_client, event_rx).await;
        });
        self.inner.tasks.lock().unwrap().push(handle);

        let candidate = Candidate::relayed(component, allocation.relay);
        self.add_local_candidate(candidate).await;
        Ok(())
    }

    async fn add_local_candidate(&self, candidate: Candidate) {
        {
            let mut candidates = self.inner.local_candidates.lock().unwrap();
            if candidates
                .iter()
                .any(|c| c.addr == candidate.addr && c.component == candidate.component)
            {
                return;
            }
            candidates.push(candidate.clone());
        }
        debug!(%candidate, "local candidate");
        self.emit(IceEvent::CandidateGathered(candidate)).await;
    }

    /// Add one remote candidate received over signaling.
    pub fn add_remote_candidate(&self, candidate: Candidate) -> Result<()> {
        let mut candidates = self.inner.remote_candidates.lock().unwrap();
        if candidates
            .iter()
            .any(|c| c.addr == candidate.addr && c.component == candidate.component)
        {
            debug!(%candidate, "duplicate remote candidate ignored");
            return Ok(());
        }
        debug!(%candidate, "remote candidate");
        candidates.push(candidate);
        Ok(())
    }

    /// Add remote candidates parsed from SDP lines.
    pub fn add_remote_candidates_sdp<'a>(
        &self,
        lines: impl IntoIterator<Item = &'a str>,
    ) -> Result<()> {
        for line in lines {
            self.add_remote_candidate(Candidate::from_sdp_string(line)?)?;
        }
        Ok(())
    }

    /// Form check lists and start paced connectivity checks.
    ///
    /// Requires gathered local candidates, remote candidates and remote
    /// credentials.
    pub async fn start_checks(&self) -> Result<()> {
        if self.inner.remote_creds.lock().unwrap().is_none() {
            return Err(Error::InvalidState(
                "remote credentials not set".to_string(),
            ));
        }
        self.transition(IceState::Negotiating, IceState::Checking)?;

        let controlling = self.role() == IceRole::Controlling;
        let failure = {
            let locals = self.inner.local_candidates.lock().unwrap().clone();
            let remotes = self.inner.remote_candidates.lock().unwrap().clone();
            let mut checklists = self.inner.checklists.lock().unwrap();
            let mut failure = None;
            for component in self.inner.config.enabled_components() {
                let mut list = CheckList::form(component, &locals, &remotes, controlling);
                if list.pairs.is_empty() {
                    failure = Some(Error::ChecksFailed(format!(
                        "no candidate pairs for component {component}"
                    )));
                    break;
                }
                list.unfreeze_initial();
                debug!(component, pairs = list.pairs.len(), "check list formed");
                checklists.insert(component, list);
            }
            failure
        };
        if let Some(error) = failure {
            self.fail(error.to_string()).await;
            return Err(error);
        }

        // Replay checks the peer sent before the lists existed, restoring
        // their nomination and triggered-check effects.
        let early: Vec<EarlyCheck> = {
            let mut early_checks = self.inner.early_checks.lock().unwrap();
            early_checks.drain(..).collect()
        };
        for check in early {
            self.note_inbound_check(
                check.component,
                check.source,
                check.priority,
                check.use_candidate,
                check.relayed,
            )
            .await;
        }

        self.schedule_pace(Duration::ZERO);
        Ok(())
    }

    /// Send application data on a component's selected pair.
    pub async fn send_data(&self, component: u8, data: &[u8]) -> Result<()> {
        let (local, remote) = self
            .selected_pair(component)
            .ok_or_else(|| Error::InvalidState("no selected pair".to_string()))?;
        match self.via_for(component, &local) {
            Some(Via::Relay(turn)) => turn.send_to(remote.addr, data).await?,
            Some(Via::Direct(session)) => session.send_raw(data, remote.addr).await?,
            None => return Err(Error::InvalidState("component not found".to_string())),
        }
        Ok(())
    }

    /// Tear the agent down. Idempotent; no event is delivered after this
    /// returns.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.timers.close();
        for handle in self.inner.tasks.lock().unwrap().drain(..) {
            handle.abort();
        }
        let (sessions, turns): (Vec<StunSession>, Vec<TurnClient>) = {
            let components = self.inner.components.lock().unwrap();
            (
                components.iter().map(|io| io.session.clone()).collect(),
                components.iter().filter_map(|io| io.turn.clone()).collect(),
            )
        };
        for session in sessions {
            session.close();
        }
        for turn in turns {
            turn.close().await;
        }
        self.inner.relay_pending.lock().unwrap().clear();
        *self.inner.state.lock().unwrap() = IceState::Closed;
        debug!("ice agent closed");
    }

    // --- timers ---

    async fn timer_loop(self, mut timer_rx: mpsc::Receiver<IceTimer>) {
        while let Some(timer) = timer_rx.recv().await {
            if self.inner.closed.load(Ordering::SeqCst) {
                return;
            }
            match timer {
                IceTimer::Pace => self.pace().await,
                IceTimer::Nominate(component) => self.nominate_component(component).await,
                IceTimer::KeepAlive => self.keep_alive().await,
            }
        }
    }

    fn schedule_pace(&self, delay: Duration) {
        if self
            .inner
            .pace_armed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.inner.timers.schedule(delay, IceTimer::Pace);
        }
    }

    /// One Ta slot: release the next triggered or Waiting pair.
    async fn pace(&self) {
        self.inner.pace_armed.store(false, Ordering::SeqCst);
        if self.inner.terminal.load(Ordering::SeqCst) {
            return;
        }

        let launched = self.launch_next_check();
        let more_work = {
            let checklists = self.inner.checklists.lock().unwrap();
            checklists.values().any(|list| !list.settled())
        };
        if launched.is_none() && !more_work {
            self.update_progress().await;
            return;
        }
        self.schedule_pace(self.inner.config.check_interval);

        if let Some(check) = launched {
            let agent = self.clone();
            let handle = tokio::spawn(async move {
                agent.run_check(check).await;
            });
            self.inner.tasks.lock().unwrap().push(handle);
        }
    }

    /// Pick the next pair and mark it InProgress. Triggered checks take
    /// precedence over the regular Waiting scan.
    fn launch_next_check(&self) -> Option<PlannedCheck> {
        let controlling = self.role() == IceRole::Controlling;
        let aggressive = self.inner.config.nomination == NominationMode::Aggressive;
        let mut checklists = self.inner.checklists.lock().unwrap();

        let mut pick = |pair: &mut CandidatePair, component: u8| -> PlannedCheck {
            pair.state = PairState::InProgress;
            let nominating = controlling && (aggressive || pair.nomination_pending);
            PlannedCheck {
                component,
                remote: pair.remote.addr,
                local_type: pair.local.candidate_type,
                nominating,
            }
        };

        // Triggered queue first.
        let mut triggered = self.inner.triggered.lock().unwrap();
        while let Some((component, remote, relayed)) = triggered.pop_front() {
            if let Some(list) = checklists.get_mut(&component) {
                if let Some(pair) = list.find_pair(remote, relayed) {
                    if pair.state == PairState::Waiting {
                        return Some(pick(pair, component));
                    }
                }
            }
        }
        drop(triggered);

        for component in self.inner.config.enabled_components() {
            if let Some(list) = checklists.get_mut(&component) {
                if list.nominated().is_some() {
                    continue;
                }
                if let Some(pair) = list.next_waiting() {
                    return Some(pick(pair, component));
                }
                // Stalled list: nothing Waiting or InProgress but Frozen
                // pairs remain (their unfreezing sibling failed). Thaw.
                let in_flight = list
                    .pairs
                    .iter()
                    .any(|pair| pair.state == PairState::InProgress);
                if !in_flight {
                    for pair in &mut list.pairs {
                        if pair.state == PairState::Frozen {
                            pair.state = PairState::Waiting;
                        }
                    }
                    if let Some(pair) = list.next_waiting() {
                        return Some(pick(pair, component));
                    }
                }
            }
        }
        None
    }

    /// Regular-nomination decision: re-check the best valid pair with
    /// USE-CANDIDATE.
    async fn nominate_component(&self, component: u8) {
        let queued = {
            let mut checklists = self.inner.checklists.lock().unwrap();
            let Some(list) = checklists.get_mut(&component) else {
                return;
            };
            if list.nominated().is_some() {
                return;
            }
            let best = list.best_valid().map(|pair| {
                (
                    pair.remote.addr,
                    pair.local.candidate_type == CandidateType::Relayed,
                )
            });
            match best {
                Some((remote, relayed)) => {
                    if let Some(pair) = list.find_pair(remote, relayed) {
                        pair.nomination_pending = true;
                        pair.state = PairState::Waiting;
                    }
                    Some((remote, relayed))
                }
                None => None,
            }
        };

        match queued {
            Some((remote, relayed)) => {
                debug!(component, %remote, "nominating");
                self.inner
                    .triggered
                    .lock()
                    .unwrap()
                    .push_front((component, remote, relayed));
                self.schedule_pace(Duration::ZERO);
            }
            None => {
                // No valid pair yet; try again after another delay unless
                // the list already failed outright.
                let exhausted = {
                    let checklists = self.inner.checklists.lock().unwrap();
                    checklists
                        .get(&component)
                        .map(|list| list.exhausted())
                        .unwrap_or(true)
                };
                if exhausted {
                    self.update_progress().await;
                } else {
                    self.inner.timers.schedule(
                        self.inner.config.effective_nominated_check_delay(),
                        IceTimer::Nominate(component),
                    );
                }
            }
        }
    }

    async fn keep_alive(&self) {
        if self.inner.terminal.load(Ordering::SeqCst) && self.state() != IceState::Completed {
            return;
        }
        for component in self.inner.config.enabled_components() {
            let Some((local, remote)) = self.selected_pair(component) else {
                continue;
            };
            let indication = StunMessage::indication(Method::Binding);
            match self.via_for(component, &local) {
                Some(Via::Direct(session)) => {
                    if let Err(e) = session.send_indication(&indication, remote.addr, None).await {
                        debug!(component, "keep-alive failed: {e}");
                    }
                }
                Some(Via::Relay(turn)) => {
                    let wire = indication.encode();
                    if let Err(e) = turn.send_to(remote.addr, &wire).await {
                        debug!(component, "keep-alive failed: {e}");
                    }
                }
                None => {}
            }
        }
        self.inner
            .timers
            .schedule(self.inner.config.keep_alive_interval, IceTimer::KeepAlive);
    }

    // --- outbound checks ---

    async fn run_check(&self, check: PlannedCheck) {
        let Some((remote_ufrag, key)) = self.remote_auth() else {
            return;
        };
        let username = format!("{}:{}", remote_ufrag, self.inner.local_creds.ufrag);
        let controlling = self.role() == IceRole::Controlling;

        let sent_controlling = controlling;
        let mut request = StunMessage::binding_request();
        request.add_attribute(StunAttribute::username(&username));
        request.add_attribute(StunAttribute::priority(compute_priority(
            CandidateType::PeerReflexive,
            65535,
            check.component,
        )));
        if controlling {
            request.add_attribute(StunAttribute::ice_controlling(self.inner.tiebreaker));
            if check.nominating {
                request.add_attribute(StunAttribute::use_candidate());
            }
        } else {
            request.add_attribute(StunAttribute::ice_controlled(self.inner.tiebreaker));
        }

        trace!(component = check.component, remote = %check.remote,
               nominating = check.nominating, "connectivity check");

        let outcome = match self.via_for_type(check.component, check.local_type) {
            Some(Via::Direct(session)) => {
                match session.send_request(request, check.remote, Some(&key)) {
                    Ok(handle) => handle.result().await,
                    Err(e) => {
                        debug!("check send failed: {e}");
                        TransactionResult::Timeout
                    }
                }
            }
            Some(Via::Relay(turn)) => self.run_relay_check(&turn, request, &key, check.remote).await,
            None => return,
        };

        self.finish_check(check, outcome, sent_controlling).await;
    }

    /// A check through the relay: permission, then manual retransmission
    /// of the encoded request over Send indications, matching the response
    /// out of the relayed data stream by transaction id.
    async fn run_relay_check(
        &self,
        turn: &TurnClient,
        request: StunMessage,
        key: &[u8],
        remote: SocketAddr,
    ) -> TransactionResult {
        if let Err(e) = turn.create_permission(remote).await {
            debug!(%remote, "permission for check failed: {e}");
            return TransactionResult::Timeout;
        }

        let id = request.transaction_id;
        let (response_tx, mut response_rx) = oneshot::channel();
        self.inner
            .relay_pending
            .lock()
            .unwrap()
            .insert(id, response_tx);
        let wire = request.encode_with(Some(key), true);

        let profile = self.inner.config.profile;
        let mut result = TransactionResult::Timeout;
        for attempt in 0..profile.request_count {
            if turn.send_to(remote, &wire).await.is_err() {
                break;
            }
            let wait = if attempt + 1 >= profile.request_count {
                profile.final_wait
            } else {
                profile.delay(attempt)
            };
            match tokio::time::timeout(wait, &mut response_rx).await {
                Ok(Ok(message)) => {
                    result = match message.error_code() {
                        Some((code, reason)) => TransactionResult::ServerError {
                            code,
                            reason,
                            message,
                        },
                        None => TransactionResult::Response {
                            message,
                            raw: Bytes::new(),
                            source: remote,
                        },
                    };
                    break;
                }
                Ok(Err(_)) => break,
                Err(_) => continue,
            }
        }
        self.inner.relay_pending.lock().unwrap().remove(&id);
        result
    }

    async fn finish_check(
        &self,
        check: PlannedCheck,
        outcome: TransactionResult,
        sent_controlling: bool,
    ) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        match outcome {
            TransactionResult::Response { message, .. } => {
                let mapped = message
                    .get_attribute(StunAttributeType::XorMappedAddress)
                    .and_then(|a| a.as_xor_address(&message.transaction_id).ok());
                self.handle_check_success(check, mapped).await;
            }
            TransactionResult::ServerError { code: 487, .. } => {
                // Role conflict: take the opposite of the role the request
                // claimed (the current role may already have flipped on an
                // inbound conflict), reprioritize, re-queue the pair.
                let new_role = if sent_controlling {
                    IceRole::Controlled
                } else {
                    IceRole::Controlling
                };
                warn!(?new_role, "role conflict, switching role");
                self.set_role(new_role);
                self.reprioritize(new_role == IceRole::Controlling);
                self.requeue_pair(check.component, check.remote, check.relayed());
            }
            TransactionResult::ServerError { code, reason, .. } => {
                debug!(component = check.component, remote = %check.remote,
                       "check rejected: {code} {reason}");
                self.mark_failed(check.component, check.remote, check.relayed())
                    .await;
            }
            TransactionResult::Timeout | TransactionResult::Cancelled => {
                self.mark_failed(check.component, check.remote, check.relayed())
                    .await;
            }
        }
    }

    async fn handle_check_success(&self, check: PlannedCheck, mapped: Option<SocketAddr>) {
        // A mapped address matching no local candidate is a new
        // peer-reflexive local candidate.
        if let Some(mapped) = mapped {
            let known = self
                .inner
                .local_candidates
                .lock()
                .unwrap()
                .iter()
                .any(|c| c.addr == mapped);
            if !known {
                let base = self.component_base(check.component);
                if let Some(base) = base {
                    let candidate = Candidate::peer_reflexive(
                        check.component,
                        mapped,
                        base,
                        compute_priority(CandidateType::PeerReflexive, 65535, check.component),
                    );
                    self.add_local_candidate(candidate).await;
                }
            }
        }

        // The valid pair's local side is the candidate the peer actually
        // saw: whatever local candidate carries the mapped address (the
        // peer-reflexive one just discovered, or an existing srflx).
        let mapped_local: Option<Candidate> = mapped.and_then(|mapped| {
            self.inner
                .local_candidates
                .lock()
                .unwrap()
                .iter()
                .find(|c| c.component == check.component && c.addr == mapped)
                .cloned()
        });

        let (nominated, foundation) = {
            let mut checklists = self.inner.checklists.lock().unwrap();
            let Some(list) = checklists.get_mut(&check.component) else {
                return;
            };
            let relayed = check.local_type == CandidateType::Relayed;
            let Some(pair) = list.find_pair(check.remote, relayed) else {
                return;
            };
            if let Some(local) = mapped_local {
                if !relayed && local.addr != pair.local.addr {
                    debug!(%local, "valid pair rewritten to the mapped address");
                    pair.local = local;
                }
            }
            pair.state = PairState::Succeeded;
            if check.nominating || pair.nomination_pending {
                pair.nominated = true;
                pair.nomination_pending = false;
            }
            let nominated = pair.nominated;
            let foundation = pair.foundation();
            list.unfreeze_foundation(&foundation);
            (nominated, foundation)
        };
        trace!(component = check.component, remote = %check.remote,
               foundation, nominated, "check succeeded");

        // Regular nomination: arm the decision timer on the first valid
        // pair of a component.
        if !nominated
            && self.role() == IceRole::Controlling
            && self.inner.config.nomination == NominationMode::Regular
            && self
                .inner
                .nomination_armed
                .lock()
                .unwrap()
                .insert(check.component)
        {
            self.inner.timers.schedule(
                self.inner.config.effective_nominated_check_delay(),
                IceTimer::Nominate(check.component),
            );
        }

        self.update_progress().await;
    }

    async fn mark_failed(&self, component: u8, remote: SocketAddr, relayed: bool) {
        {
            let mut checklists = self.inner.checklists.lock().unwrap();
            if let Some(list) = checklists.get_mut(&component) {
                if let Some(pair) = list.find_pair(remote, relayed) {
                    // A pair that already succeeded stays valid even if a
                    // later (nominating) re-check timed out.
                    if pair.state == PairState::InProgress {
                        pair.state = PairState::Failed;
                        let foundation = pair.foundation();
                        // Failure unfreezes the siblings too, or the group
                        // would never get scheduled.
                        list.unfreeze_foundation(&foundation);
                    }
                }
            }
        }
        self.update_progress().await;
    }

    fn requeue_pair(&self, component: u8, remote: SocketAddr, relayed: bool) {
        {
            let mut checklists = self.inner.checklists.lock().unwrap();
            if let Some(list) = checklists.get_mut(&component) {
                if let Some(pair) = list.find_pair(remote, relayed) {
                    pair.state = PairState::Waiting;
                }
            }
        }
        self.inner
            .triggered
            .lock()
            .unwrap()
            .push_front((component, remote, relayed));
        self.schedule_pace(Duration::ZERO);
    }

    fn reprioritize(&self, controlling: bool) {
        let mut checklists = self.inner.checklists.lock().unwrap();
        for list in checklists.values_mut() {
            for pair in &mut list.pairs {
                pair.priority = crate::checklist::pair_priority(
                    pair.local.priority,
                    pair.remote.priority,
                    controlling,
                );
            }
            list.pairs.sort_by(|a, b| b.priority.cmp(&a.priority));
        }
    }

    /// Check for session-wide completion or failure.
    async fn update_progress(&self) {
        if self.inner.terminal.load(Ordering::SeqCst) {
            return;
        }

        enum Verdict {
            Completed(Vec<(u8, Candidate, Candidate)>),
            Failed(String),
            Pending,
        }

        let verdict = {
            let checklists = self.inner.checklists.lock().unwrap();
            if checklists.is_empty() {
                Verdict::Pending
            } else {
                let mut selected = Vec::new();
                let mut verdict = Verdict::Pending;
                for component in self.inner.config.enabled_components() {
                    match checklists.get(&component) {
                        Some(list) => {
                            if let Some(pair) = list.nominated() {
                                selected.push((
                                    component,
                                    pair.local.clone(),
                                    pair.remote.clone(),
                                ));
                            } else if list.exhausted() {
                                verdict = Verdict::Failed(format!(
                                    "all pairs failed for component {component}"
                                ));
                                break;
                            } else {
                                verdict = Verdict::Pending;
                                break;
                            }
                        }
                        None => {
                            verdict = Verdict::Pending;
                            break;
                        }
                    }
                }
                if selected.len() == self.inner.config.enabled_components().len() {
                    Verdict::Completed(selected)
                } else {
                    verdict
                }
            }
        };

        match verdict {
            Verdict::Completed(selected) => {
                if self.inner.terminal.swap(true, Ordering::SeqCst) {
                    return;
                }
                info!("ice completed");
                for (component, local, remote) in selected {
                    self.emit(IceEvent::SelectedPair {
                        component,
                        local,
                        remote,
                    })
                    .await;
                }
                self.set_state(IceState::Completed).await;
                self.emit(IceEvent::Completed).await;
                self.inner
                    .timers
                    .schedule(self.inner.config.keep_alive_interval, IceTimer::KeepAlive);
            }
            Verdict::Failed(reason) => {
                self.fail(reason).await;
            }
            Verdict::Pending => {}
        }
    }

    // --- inbound checks ---

    async fn handle_inbound_check(
        &self,
        component: u8,
        message: StunMessage,
        raw: Bytes,
        source: SocketAddr,
        via: Via,
    ) {
        if self.inner.closed.load(Ordering::SeqCst) || message.method != Method::Binding {
            return;
        }

        // Short-term credential check: USERNAME is localufrag:remoteufrag
        // from the sender's perspective, integrity keyed on our pwd.
        let username_ok = message
            .get_attribute(StunAttributeType::Username)
            .and_then(|a| a.as_str().ok())
            .map(|u| {
                u.split(':').next() == Some(self.inner.local_creds.ufrag.as_str())
            })
            .unwrap_or(false);
        let key = short_term_key(&self.inner.local_creds.pwd);
        if !username_ok || verify_integrity(&raw, &key).is_err() {
            debug!(%source, "rejecting unauthenticated check");
            let response = StunMessage::error_response(&message, 401, "Unauthorized");
            self.respond(&via, &response, source, None).await;
            return;
        }

        // Role conflict (RFC 8445 section 7.3.1.1).
        let local_role = self.role();
        let their_controlling = message
            .get_attribute(StunAttributeType::IceControlling)
            .and_then(|a| a.as_u64().ok());
        let their_controlled = message
            .get_attribute(StunAttributeType::IceControlled)
            .and_then(|a| a.as_u64().ok());
        match (local_role, their_controlling, their_controlled) {
            (IceRole::Controlling, Some(their_tiebreaker), _) => {
                if self.inner.tiebreaker >= their_tiebreaker {
                    let response = StunMessage::error_response(&message, 487, "Role Conflict");
                    self.respond(&via, &response, source, Some(&key)).await;
                    return;
                }
                self.set_role(IceRole::Controlled);
                self.reprioritize(false);
            }
            (IceRole::Controlled, _, Some(their_tiebreaker)) => {
                // Both controlled: the higher tie-breaker takes over the
                // controlling role, the lower one is told to retry.
                if self.inner.tiebreaker >= their_tiebreaker {
                    self.set_role(IceRole::Controlling);
                    self.reprioritize(true);
                } else {
                    let response = StunMessage::error_response(&message, 487, "Role Conflict");
                    self.respond(&via, &response, source, Some(&key)).await;
                    return;
                }
            }
            _ => {}
        }

        let mut response = StunMessage::success_response(&message);
        response.add_attribute(StunAttribute::xor_mapped_address(
            source,
            &message.transaction_id,
        ));
        self.respond(&via, &response, source, Some(&key)).await;

        let use_candidate = message
            .get_attribute(StunAttributeType::UseCandidate)
            .is_some();
        let priority = message
            .get_attribute(StunAttributeType::Priority)
            .and_then(|a| a.as_u32().ok())
            .unwrap_or_else(|| {
                compute_priority(CandidateType::PeerReflexive, 65535, component)
            });
        let relayed = matches!(via, Via::Relay(_));
        self.note_inbound_check(component, source, priority, use_candidate, relayed)
            .await;
    }

    async fn respond(
        &self,
        via: &Via,
        response: &StunMessage,
        dest: SocketAddr,
        key: Option<&[u8]>,
    ) {
        match via {
            Via::Direct(session) => {
                if let Err(e) = session.send_response(response, dest, key).await {
                    debug!(%dest, "failed to send check response: {e}");
                }
            }
            Via::Relay(turn) => {
                let wire = response.encode_with(key, true);
                if let Err(e) = turn.send_to(dest, &wire).await {
                    debug!(%dest, "failed to send check response via relay: {e}");
                }
            }
        }
    }

    /// Peer-reflexive remote discovery and triggered checks.
    async fn note_inbound_check(
        &self,
        component: u8,
        source: SocketAddr,
        priority: u32,
        use_candidate: bool,
        relayed: bool,
    ) {
        // Unknown source: a new peer-reflexive remote candidate.
        let new_remote = {
            let mut remotes = self.inner.remote_candidates.lock().unwrap();
            if remotes
                .iter()
                .any(|c| c.addr == source && c.component == component)
            {
                None
            } else {
                let candidate =
                    Candidate::peer_reflexive(component, source, source, priority);
                remotes.push(candidate.clone());
                Some(candidate)
            }
        };

        // The local side of any new pair: the relay candidate when the
        // check came through the relay, the host candidate otherwise.
        let pair_local = {
            let locals = self.inner.local_candidates.lock().unwrap();
            locals
                .iter()
                .find(|c| {
                    c.component == component
                        && (c.candidate_type == CandidateType::Relayed) == relayed
                })
                .or_else(|| locals.iter().find(|c| c.component == component))
                .cloned()
        };

        let controlling = self.role() == IceRole::Controlling;
        let mut completed_nomination = false;
        {
            let mut checklists = self.inner.checklists.lock().unwrap();
            let Some(list) = checklists.get_mut(&component) else {
                // Checks not started yet. The remote candidate is already
                // recorded; the USE-CANDIDATE and triggered-check intent
                // must survive until the lists form, or a peer that
                // finishes nominating before we call start_checks leaves
                // us unable to ever nominate.
                drop(checklists);
                self.inner.early_checks.lock().unwrap().push(EarlyCheck {
                    component,
                    source,
                    priority,
                    use_candidate,
                    relayed,
                });
                return;
            };

            if let Some(candidate) = new_remote {
                debug!(%candidate, "peer-reflexive remote candidate");
                if let Some(local) = pair_local {
                    let pair = CandidatePair::new(local, candidate, controlling);
                    list.pairs.push(pair);
                    list.pairs.sort_by(|a, b| b.priority.cmp(&a.priority));
                }
            }

            if let Some(pair) = list.find_pair(source, relayed) {
                match pair.state {
                    PairState::Succeeded => {
                        if use_candidate {
                            pair.nominated = true;
                            completed_nomination = true;
                        }
                    }
                    PairState::InProgress => {
                        // The outstanding check will resolve it; remember
                        // the nomination intent.
                        if use_candidate {
                            pair.nomination_pending = true;
                        }
                    }
                    PairState::Frozen | PairState::Waiting | PairState::Failed => {
                        if use_candidate {
                            pair.nomination_pending = true;
                        }
                        pair.state = PairState::Waiting;
                        self.inner
                            .triggered
                            .lock()
                            .unwrap()
                            .push_front((component, source, relayed));
                    }
                }
            }
        }

        if completed_nomination {
            self.update_progress().await;
        }
        if self.state() == IceState::Checking {
            self.schedule_pace(Duration::ZERO);
        }
    }

    // --- relayed traffic ---

    async fn relay_pump(
        self,
        component: u8,
        turn: TurnClient,
        mut event_rx: mpsc::Receiver<TurnEvent>,
    ) {
        while let Some(event) = event_rx.recv().await {
            if self.inner.closed.load(Ordering::SeqCst) {
                return;
            }
            match event {
                TurnEvent::Data { peer, data } => {
                    self.relay_inbound(component, &turn, peer, data).await;
                }
                TurnEvent::AllocationExpired => {
                    warn!(component, "turn allocation expired");
                    return;
                }
                _ => {}
            }
        }
    }

    async fn relay_inbound(
        &self,
        component: u8,
        turn: &TurnClient,
        peer: SocketAddr,
        data: Bytes,
    ) {
        use rnat_stun_core::MessageClass;

        if !rnat_stun_core::is_stun(&data) {
            self.deliver_data(component, data, peer).await;
            return;
        }
        let Ok(message) = StunMessage::decode(&data) else {
            return;
        };
        match message.class {
            MessageClass::SuccessResponse | MessageClass::ErrorResponse => {
                let pending = self
                    .inner
                    .relay_pending
                    .lock()
                    .unwrap()
                    .remove(&message.transaction_id);
                match pending {
                    Some(tx) => {
                        let _ = tx.send(message);
                    }
                    None => trace!("relayed response with no matching check"),
                }
            }
            MessageClass::Request => {
                self.handle_inbound_check(component, message, data, peer, Via::Relay(turn.clone()))
                    .await;
            }
            MessageClass::Indication => {}
        }
    }

    async fn deliver_data(&self, component: u8, data: Bytes, source: SocketAddr) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        self.emit(IceEvent::Data {
            component,
            data,
            source,
        })
        .await;
    }

    // --- helpers ---

    fn remote_auth(&self) -> Option<(String, Vec<u8>)> {
        let creds = self.inner.remote_creds.lock().unwrap();
        creds
            .as_ref()
            .map(|c| (c.ufrag.clone(), short_term_key(&c.pwd)))
    }

    fn component_base(&self, component: u8) -> Option<SocketAddr> {
        self.inner
            .components
            .lock()
            .unwrap()
            .iter()
            .find(|io| io.component == component)
            .map(|io| io.base)
    }

    fn via_for(&self, component: u8, local: &Candidate) -> Option<Via> {
        self.via_for_type(component, local.candidate_type)
    }

    fn via_for_type(&self, component: u8, local_type: CandidateType) -> Option<Via> {
        let components = self.inner.components.lock().unwrap();
        let io = components.iter().find(|io| io.component == component)?;
        match local_type {
            CandidateType::Relayed => io.turn.clone().map(Via::Relay),
            _ => Some(Via::Direct(io.session.clone())),
        }
    }

    async fn fail(&self, reason: String) {
        if self.inner.terminal.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!("ice failed: {reason}");
        self.set_state(IceState::Failed).await;
        self.emit(IceEvent::Failed(reason)).await;
    }

    fn transition(&self, from: IceState, to: IceState) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        if *state != from {
            return Err(Error::InvalidState(format!(
                "expected {from}, found {}",
                *state
            )));
        }
        *state = to;
        Ok(())
    }

    async fn set_state(&self, to: IceState) {
        let changed = {
            let mut state = self.inner.state.lock().unwrap();
            if *state == to {
                false
            } else {
                debug!("ice state {} -> {}", *state, to);
                *state = to;
                true
            }
        };
        if changed {
            self.emit(IceEvent::StateChange(to)).await;
        }
    }

    async fn emit(&self, event: IceEvent) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.event_tx.send(event).await;
    }
}

/// An inbound check noted before the check lists were formed.
#[derive(Debug, Clone, Copy)]
struct EarlyCheck {
    component: u8,
    source: SocketAddr,
    priority: u32,
    use_candidate: bool,
    relayed: bool,
}

/// A check picked by the pacer, detached from the checklist lock.
#[derive(Debug, Clone, Copy)]
struct PlannedCheck {
    component: u8,
    remote: SocketAddr,
    local_type: CandidateType,
    nominating: bool,
}

impl PlannedCheck {
    fn relayed(&self) -> bool {
        self.local_type == CandidateType::Relayed
    }
}

impl std::fmt::Debug for IceAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IceAgent")
            .field("state", &self.state())
            .field("role", &self.role())
            .finish()
    }
}
