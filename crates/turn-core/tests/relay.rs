//! End-to-end relay tests against an in-process mock TURN server.
//!
//! The mock implements just enough of RFC 8656 to exercise the client: the
//! long-term-credential 401 dance, Allocate/Refresh, permission
//! enforcement (sends to peers without a permission are dropped, as a real
//! server must), Send/Data indication relaying and ChannelBind/ChannelData.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;

use rnat_stun_core::{
    is_stun, verify_integrity, Credentials, MessageClass, Method, StunAttribute,
    StunAttributeType, StunMessage,
};
use rnat_turn_core::{ChannelData, TurnClient, TurnConfig, TurnEvent, TurnState};

const REALM: &str = "rnat.test";
const NONCE: &[u8] = b"f00dcafe";

fn credentials() -> Credentials {
    Credentials {
        username: "alice".to_string(),
        password: "wonderland".to_string(),
    }
}

struct MockState {
    client: Option<SocketAddr>,
    permissions: Vec<IpAddr>,
    channels_by_number: HashMap<u16, SocketAddr>,
    channels_by_peer: HashMap<SocketAddr, u16>,
}

/// Start the mock server; returns its control address and the log of
/// LIFETIME values seen in Refresh requests.
async fn spawn_mock_turn() -> (SocketAddr, Arc<Mutex<Vec<u32>>>) {
    let control = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let relay = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let control_addr = control.local_addr().unwrap();
    let relay_addr = relay.local_addr().unwrap();
    let key = credentials().long_term_key(REALM);
    let refreshes: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let refresh_log = refreshes.clone();

    tokio::spawn(async move {
        let mut state = MockState {
            client: None,
            permissions: Vec::new(),
            channels_by_number: HashMap::new(),
            channels_by_peer: HashMap::new(),
        };
        let mut control_buf = vec![0u8; 1500];
        let mut relay_buf = vec![0u8; 1500];
        loop {
            tokio::select! {
                received = control.recv_from(&mut control_buf) => {
                    let Ok((len, source)) = received else { return };
                    on_control(
                        &control, &relay, &mut state, relay_addr, &key,
                        &refresh_log, &control_buf[..len], source,
                    )
                    .await;
                }
                received = relay.recv_from(&mut relay_buf) => {
                    let Ok((len, peer)) = received else { return };
                    on_peer_data(&control, &mut state, &relay_buf[..len], peer).await;
                }
            }
        }
    });

    (control_addr, refreshes)
}

async fn on_control(
    control: &UdpSocket,
    relay: &UdpSocket,
    state: &mut MockState,
    relay_addr: SocketAddr,
    key: &[u8],
    refresh_log: &Mutex<Vec<u32>>,
    packet: &[u8],
    source: SocketAddr,
) {
    if !is_stun(packet) {
        // ChannelData from the client: forward to the bound peer.
        let Ok(channel_data) = ChannelData::decode(packet) else {
            return;
        };
        if let Some(peer) = state.channels_by_number.get(&channel_data.number) {
            let _ = relay.send_to(&channel_data.data, *peer).await;
        }
        return;
    }

    let Ok(message) = StunMessage::decode(packet) else {
        return;
    };

    match (message.class, message.method) {
        (MessageClass::Request, Method::Allocate) => {
            if message.get_attribute(StunAttributeType::Username).is_none() {
                let mut response = StunMessage::error_response(&message, 401, "Unauthorized");
                response.add_attribute(StunAttribute::realm(REALM));
                response.add_attribute(StunAttribute::nonce(NONCE));
                let _ = control.send_to(&response.encode(), source).await;
                return;
            }
            if verify_integrity(packet, key).is_err() {
                let response = StunMessage::error_response(&message, 401, "Unauthorized");
                let _ = control.send_to(&response.encode(), source).await;
                return;
            }
            state.client = Some(source);
            let lifetime = message
                .get_attribute(StunAttributeType::Lifetime)
                .and_then(|attr| attr.as_u32().ok())
                .unwrap_or(600);
            let mut response = StunMessage::success_response(&message);
            response.add_attribute(StunAttribute::xor_relayed_address(
                relay_addr,
                &message.transaction_id,
            ));
            response.add_attribute(StunAttribute::xor_mapped_address(
                source,
                &message.transaction_id,
            ));
            response.add_attribute(StunAttribute::lifetime(lifetime));
            let _ = control.send_to(&response.encode(), source).await;
        }
        (MessageClass::Request, Method::Refresh) => {
            let lifetime = message
                .get_attribute(StunAttributeType::Lifetime)
                .and_then(|attr| attr.as_u32().ok())
                .unwrap_or(600);
            refresh_log.lock().unwrap().push(lifetime);
            let mut response = StunMessage::success_response(&message);
            response.add_attribute(StunAttribute::lifetime(lifetime));
            let _ = control.send_to(&response.encode(), source).await;
        }
        (MessageClass::Request, Method::CreatePermission) => {
            let Some(peer) = message
                .get_attribute(StunAttributeType::XorPeerAddress)
                .and_then(|attr| attr.as_xor_address(&message.transaction_id).ok())
            else {
                return;
            };
            if !state.permissions.contains(&peer.ip()) {
                state.permissions.push(peer.ip());
            }
            let response = StunMessage::success_response(&message);
            let _ = control.send_to(&response.encode(), source).await;
        }
        (MessageClass::Request, Method::ChannelBind) => {
            let number = message
                .get_attribute(StunAttributeType::ChannelNumber)
                .and_then(|attr| attr.as_channel_number().ok());
            let peer = message
                .get_attribute(StunAttributeType::XorPeerAddress)
                .and_then(|attr| attr.as_xor_address(&message.transaction_id).ok());
            let (Some(number), Some(peer)) = (number, peer) else {
                return;
            };
            if !state.permissions.contains(&peer.ip()) {
                state.permissions.push(peer.ip());
            }
            state.channels_by_number.insert(number, peer);
            state.channels_by_peer.insert(peer, number);
            let response = StunMessage::success_response(&message);
            let _ = control.send_to(&response.encode(), source).await;
        }
        (MessageClass::Indication, Method::Send) => {
            let peer = message
                .get_attribute(StunAttributeType::XorPeerAddress)
                .and_then(|attr| attr.as_xor_address(&message.transaction_id).ok());
            let data = message.get_attribute(StunAttributeType::Data);
            let (Some(peer), Some(data)) = (peer, data) else {
                return;
            };
            // Permission enforcement: silently drop.
            if state.permissions.contains(&peer.ip()) {
                let _ = relay.send_to(&data.value, peer).await;
            }
        }
        _ => {}
    }
}

async fn on_peer_data(
    control: &UdpSocket,
    state: &mut MockState,
    data: &[u8],
    peer: SocketAddr,
) {
    let Some(client) = state.client else { return };
    if !state.permissions.contains(&peer.ip()) {
        return;
    }
    if let Some(number) = state.channels_by_peer.get(&peer) {
        let wire = ChannelData::new(*number, Bytes::copy_from_slice(data)).encode();
        let _ = control.send_to(&wire, client).await;
    } else {
        let mut indication = StunMessage::indication(Method::Data);
        indication.add_attribute(StunAttribute::xor_peer_address(
            peer,
            &indication.transaction_id,
        ));
        indication.add_attribute(StunAttribute::data(Bytes::copy_from_slice(data)));
        let _ = control.send_to(&indication.encode(), client).await;
    }
}

async fn new_client(server: SocketAddr) -> (TurnClient, mpsc::Receiver<TurnEvent>) {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    TurnClient::new(socket, TurnConfig::new(server, credentials()))
}

async fn expect_data(event_rx: &mut mpsc::Receiver<TurnEvent>) -> (SocketAddr, Bytes) {
    loop {
        let event = timeout(Duration::from_secs(2), event_rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        if let TurnEvent::Data { peer, data } = event {
            return (peer, data);
        }
    }
}

#[tokio::test]
async fn allocate_permission_and_indication_relay() {
    let (server, _refreshes) = spawn_mock_turn().await;
    let (client, mut event_rx) = new_client(server).await;

    // First Allocate draws the 401 challenge, the retry authenticates.
    let allocation = client.allocate().await.unwrap();
    assert_eq!(allocation.lifetime, Duration::from_secs(600));
    match timeout(Duration::from_secs(2), event_rx.recv()).await {
        Ok(Some(TurnEvent::AllocationGranted { relay, .. })) => {
            assert_eq!(relay, allocation.relay);
        }
        other => panic!("expected AllocationGranted, got {other:?}"),
    }

    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = peer.local_addr().unwrap();
    client.create_permission(peer_addr).await.unwrap();

    // Client -> peer via Send indication.
    client.send_to(peer_addr, b"hello").await.unwrap();
    let mut buf = [0u8; 64];
    let (len, from) = timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..len], b"hello");
    assert_eq!(from, allocation.relay);

    // Peer -> client via Data indication.
    peer.send_to(b"world", allocation.relay).await.unwrap();
    let (from, data) = expect_data(&mut event_rx).await;
    assert_eq!(from, peer_addr);
    assert_eq!(&data[..], b"world");

    client.close().await;
}

#[tokio::test]
async fn send_without_permission_is_dropped() {
    let (server, _refreshes) = spawn_mock_turn().await;
    let (client, _event_rx) = new_client(server).await;
    client.allocate().await.unwrap();

    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = peer.local_addr().unwrap();

    // No CreatePermission: the server must drop the relayed data.
    client.send_to(peer_addr, b"sneaky").await.unwrap();
    let mut buf = [0u8; 64];
    let received = timeout(Duration::from_millis(300), peer.recv_from(&mut buf)).await;
    assert!(received.is_err(), "data leaked past a missing permission");

    client.close().await;
}

#[tokio::test]
async fn channel_data_round_trip() {
    let (server, _refreshes) = spawn_mock_turn().await;
    let (client, mut event_rx) = new_client(server).await;
    let allocation = client.allocate().await.unwrap();

    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = peer.local_addr().unwrap();

    let number = client.channel_bind(peer_addr).await.unwrap();
    assert!((0x4000..=0x7fff).contains(&number));
    // Binding the same peer again reuses the number.
    assert_eq!(client.channel_bind(peer_addr).await.unwrap(), number);

    // Client -> peer now travels as ChannelData.
    client.send_to(peer_addr, b"framed").await.unwrap();
    let mut buf = [0u8; 64];
    let (len, _) = timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..len], b"framed");

    // Peer -> client comes back as ChannelData and surfaces as Data.
    peer.send_to(b"echo", allocation.relay).await.unwrap();
    let (from, data) = expect_data(&mut event_rx).await;
    assert_eq!(from, peer_addr);
    assert_eq!(&data[..], b"echo");

    client.close().await;
}

/// With a short granted lifetime the client must refresh on its own,
/// before the allocation would expire, and stay allocated afterwards.
#[tokio::test]
async fn allocation_refreshes_before_expiry() {
    let (server, refreshes) = spawn_mock_turn().await;
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let config = TurnConfig {
        requested_lifetime: Duration::from_secs(2),
        ..TurnConfig::new(server, credentials())
    };
    let (client, _event_rx) = TurnClient::new(socket, config);

    let allocation = client.allocate().await.unwrap();
    assert_eq!(allocation.lifetime, Duration::from_secs(2));

    // The refresh is due one second in (half the lifetime); give it a
    // generous window but fail well before the allocation could lapse
    // unrefreshed.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        if let Some(&lifetime) = refreshes.lock().unwrap().first() {
            assert_eq!(lifetime, 2);
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no refresh arrived before expiry"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    // Let the refresh response land before checking the state.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(client.state(), TurnState::Allocated);

    client.close().await;
}

/// close() must tell the server to release the allocation: a Refresh
/// with LIFETIME 0, per RFC 8656 section 7.
#[tokio::test]
async fn close_releases_the_allocation() {
    let (server, refreshes) = spawn_mock_turn().await;
    let (client, _event_rx) = new_client(server).await;
    client.allocate().await.unwrap();

    client.close().await;
    assert_eq!(client.state(), TurnState::Closed);

    // The deallocating Refresh is fire-and-forget; wait for the mock to
    // log it.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if refreshes.lock().unwrap().contains(&0) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "close did not release the allocation"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn operations_require_an_allocation() {
    let (server, _refreshes) = spawn_mock_turn().await;
    let (client, _event_rx) = new_client(server).await;

    let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
    assert!(client.create_permission(peer).await.is_err());
    assert!(client.send_to(peer, b"x").await.is_err());
    assert!(client.channel_bind(peer).await.is_err());

    client.close().await;
}
