//! End-to-end connectivity tests: two agents negotiating over loopback.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use rnat_ice_core::{
    Candidate, CandidateType, IceAgent, IceConfig, IceEvent, IceRole, IceState, NominationMode,
};
use rnat_infra_common::RetransmitProfile;

fn test_config() -> IceConfig {
    IceConfig {
        bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        gather_srflx: false,
        gather_relay: false,
        profile: RetransmitProfile::short(),
        ..IceConfig::default()
    }
}

/// Gather on both agents and exchange credentials and candidates.
async fn negotiate(a: &IceAgent, b: &IceAgent) {
    a.set_role(IceRole::Controlling);
    b.set_role(IceRole::Controlled);
    a.gather().await.unwrap();
    b.gather().await.unwrap();

    a.set_remote_credentials(b.local_credentials());
    b.set_remote_credentials(a.local_credentials());
    // Candidates travel as SDP lines, as they would over signaling.
    for candidate in b.local_candidates() {
        a.add_remote_candidates_sdp([candidate.to_sdp_string().as_str()])
            .unwrap();
    }
    for candidate in a.local_candidates() {
        b.add_remote_candidates_sdp([candidate.to_sdp_string().as_str()])
            .unwrap();
    }
}

/// Drain events until Completed or Failed.
async fn wait_terminal(rx: &mut mpsc::Receiver<IceEvent>) -> bool {
    loop {
        let event = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a terminal event")
            .expect("event channel closed");
        match event {
            IceEvent::Completed => return true,
            IceEvent::Failed(reason) => panic!("ice failed: {reason}"),
            _ => {}
        }
    }
}

#[tokio::test]
async fn simple_one_component() {
    let (a, mut rx_a) = IceAgent::new(test_config());
    let (b, mut rx_b) = IceAgent::new(test_config());
    negotiate(&a, &b).await;

    a.start_checks().await.unwrap();
    b.start_checks().await.unwrap();

    assert!(wait_terminal(&mut rx_a).await);
    assert!(wait_terminal(&mut rx_b).await);
    assert_eq!(a.state(), IceState::Completed);
    assert_eq!(b.state(), IceState::Completed);

    // The nominated pairs must mirror each other.
    let (a_local, a_remote) = a.selected_pair(1).unwrap();
    let (b_local, b_remote) = b.selected_pair(1).unwrap();
    assert_eq!(a_local.addr, b_remote.addr);
    assert_eq!(b_local.addr, a_remote.addr);

    // Data flows over the selected pair.
    a.send_data(1, b"ping").await.unwrap();
    let got = loop {
        match timeout(Duration::from_secs(2), rx_b.recv())
            .await
            .unwrap()
            .unwrap()
        {
            IceEvent::Data { data, .. } => break data,
            _ => continue,
        }
    };
    assert_eq!(&got[..], b"ping");

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn regular_nomination_completes() {
    let config = IceConfig {
        nomination: NominationMode::Regular,
        ..test_config()
    };
    let (a, mut rx_a) = IceAgent::new(config.clone());
    let (b, mut rx_b) = IceAgent::new(config);
    negotiate(&a, &b).await;

    a.start_checks().await.unwrap();
    b.start_checks().await.unwrap();

    assert!(wait_terminal(&mut rx_a).await);
    assert!(wait_terminal(&mut rx_b).await);

    let (a_local, a_remote) = a.selected_pair(1).unwrap();
    let (b_local, b_remote) = b.selected_pair(1).unwrap();
    assert_eq!(a_local.addr, b_remote.addr);
    assert_eq!(b_local.addr, a_remote.addr);

    a.close().await;
    b.close().await;
}

/// A dead high-priority remote candidate must not prevent completion: its
/// checks time out and the reachable host pair wins.
#[tokio::test]
async fn dead_candidate_is_ignored() {
    let (a, mut rx_a) = IceAgent::new(test_config());
    let (b, mut rx_b) = IceAgent::new(test_config());
    negotiate(&a, &b).await;

    // Black hole: discard port, nothing answers. Forced to the top of the
    // check list by a maximal priority.
    let dead = Candidate {
        component: 1,
        candidate_type: CandidateType::Host,
        addr: "127.0.0.1:9".parse::<SocketAddr>().unwrap(),
        base: "127.0.0.1:9".parse().unwrap(),
        priority: u32::MAX,
        foundation: "dead".to_string(),
    };
    a.add_remote_candidate(dead).unwrap();

    a.start_checks().await.unwrap();
    b.start_checks().await.unwrap();

    assert!(wait_terminal(&mut rx_a).await);
    assert!(wait_terminal(&mut rx_b).await);

    let (_, a_remote) = a.selected_pair(1).unwrap();
    assert_ne!(a_remote.addr.port(), 9);

    a.close().await;
    b.close().await;
}

/// An unreachable STUN server delays gathering by at most its retransmit
/// budget; the host candidate is still produced and gathering completes.
#[tokio::test]
async fn unreachable_stun_server_does_not_block_gathering() {
    let config = IceConfig {
        gather_srflx: true,
        stun_servers: vec!["127.0.0.1:9".parse().unwrap()],
        max_gathering_time: Duration::from_secs(3),
        ..test_config()
    };
    let (agent, mut rx) = IceAgent::new(config);
    agent.gather().await.unwrap();

    let mut saw_host = false;
    let mut saw_complete = false;
    while let Ok(Some(event)) = timeout(Duration::from_millis(200), rx.recv()).await {
        match event {
            IceEvent::CandidateGathered(candidate) => {
                saw_host |= candidate.candidate_type == CandidateType::Host;
            }
            IceEvent::GatheringComplete => {
                saw_complete = true;
                break;
            }
            _ => {}
        }
    }
    assert!(saw_host, "host candidate missing");
    assert!(saw_complete, "gathering did not complete");
    assert_eq!(agent.state(), IceState::Negotiating);

    agent.close().await;
}

/// Both sides starting as controlling must resolve the conflict via the
/// tie-breaker and still complete, with the higher tie-breaker keeping
/// the controlling role.
#[tokio::test]
async fn role_conflict_resolves() {
    let (a, mut rx_a) = IceAgent::new(test_config());
    let (b, mut rx_b) = IceAgent::new(test_config());
    negotiate(&a, &b).await;
    b.set_role(IceRole::Controlling); // both controlling now

    a.start_checks().await.unwrap();
    b.start_checks().await.unwrap();

    assert!(wait_terminal(&mut rx_a).await);
    assert!(wait_terminal(&mut rx_b).await);
    let (winner, loser) = if a.tie_breaker() > b.tie_breaker() {
        (&a, &b)
    } else {
        (&b, &a)
    };
    assert_eq!(winner.role(), IceRole::Controlling);
    assert_eq!(loser.role(), IceRole::Controlled);

    a.close().await;
    b.close().await;
}

/// The controlling peer may finish nominating before our own
/// `start_checks` runs (ordinary signaling skew): the nominating checks
/// arrive early, and their USE-CANDIDATE must still take effect once the
/// check lists form.
#[tokio::test]
async fn completes_when_checks_start_after_peer_nominated() {
    let (a, mut rx_a) = IceAgent::new(test_config());
    let (b, mut rx_b) = IceAgent::new(test_config());
    negotiate(&a, &b).await;

    // The controlling side runs to completion on its own; the controlled
    // side only answers.
    a.start_checks().await.unwrap();
    assert!(wait_terminal(&mut rx_a).await);
    assert_eq!(a.state(), IceState::Completed);

    b.start_checks().await.unwrap();
    assert!(wait_terminal(&mut rx_b).await);
    assert_eq!(b.state(), IceState::Completed);

    let (a_local, a_remote) = a.selected_pair(1).unwrap();
    let (b_local, b_remote) = b.selected_pair(1).unwrap();
    assert_eq!(a_local.addr, b_remote.addr);
    assert_eq!(b_local.addr, a_remote.addr);

    a.close().await;
    b.close().await;
}
