//! The STUN session: one logical STUN endpoint bound to one UDP socket.
//!
//! The session multiplexes any number of concurrent client transactions over
//! the socket, routes inbound responses to their transaction by id, hands
//! requests and indications to the injected [`StunSessionHandler`], and
//! offers anything that does not parse as STUN to the handler's raw
//! callback (the TURN client uses that path for ChannelData).
//!
//! Teardown contract: [`StunSession::close`] is idempotent and may race with
//! response arrival and with retransmit timers. After `close` returns, no
//! handler callback will be invoked and every outstanding transaction
//! resolves as cancelled.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use rnat_infra_common::RetransmitProfile;

use crate::attr::StunAttribute;
use crate::error::{Result, StunError};
use crate::message::{
    is_stun, DecodeOptions, MessageClass, Method, StunMessage, TransactionId,
};
use crate::transaction::{
    run_transaction, RequestHandle, TransactionParams, TransactionResult,
};

/// Session-level configuration.
#[derive(Debug, Clone)]
pub struct StunConfig {
    /// Retransmission timing for client transactions.
    pub profile: RetransmitProfile,
    /// SOFTWARE attribute value added to outgoing requests, if any.
    pub software: Option<String>,
    /// Maximum concurrent client transactions before new work is rejected.
    pub max_transactions: usize,
    /// Verify FINGERPRINT on inbound messages that carry it.
    pub check_fingerprint: bool,
    /// Append FINGERPRINT to outgoing requests.
    pub add_fingerprint: bool,
    /// The underlying transport is reliable; suppress retransmission.
    pub reliable_transport: bool,
}

impl Default for StunConfig {
    fn default() -> Self {
        StunConfig {
            profile: RetransmitProfile::default(),
            software: Some(format!("rnat-stun-core/{}", env!("CARGO_PKG_VERSION"))),
            max_transactions: 512,
            check_fingerprint: true,
            add_fingerprint: true,
            reliable_transport: false,
        }
    }
}

/// Callbacks a session consumer implements. All methods get the session so
/// they can answer on the same socket.
#[async_trait]
pub trait StunSessionHandler: Send + Sync + 'static {
    /// A request arrived. `raw` is the datagram as received, for
    /// MESSAGE-INTEGRITY verification.
    async fn on_request(
        &self,
        session: &StunSession,
        message: StunMessage,
        raw: Bytes,
        source: SocketAddr,
    ) {
        let _ = (session, message, raw, source);
    }

    /// An unsolicited indication arrived.
    async fn on_indication(&self, session: &StunSession, message: StunMessage, source: SocketAddr) {
        let _ = (session, message, source);
    }

    /// Bytes that are not a STUN message arrived (ChannelData, media).
    async fn on_raw(&self, session: &StunSession, data: Bytes, source: SocketAddr) {
        let _ = (session, data, source);
    }
}

/// A [`StunSessionHandler`] that answers Binding requests with the sender's
/// reflexive address. Enough to act as a plain STUN server; tests and the
/// gathering fixtures use it.
pub struct BindingResponder;

#[async_trait]
impl StunSessionHandler for BindingResponder {
    async fn on_request(
        &self,
        session: &StunSession,
        message: StunMessage,
        _raw: Bytes,
        source: SocketAddr,
    ) {
        if message.method != Method::Binding {
            return;
        }
        let mut response = StunMessage::success_response(&message);
        response.add_attribute(StunAttribute::xor_mapped_address(
            source,
            &message.transaction_id,
        ));
        if let Err(e) = session.send_response(&response, source, None).await {
            warn!("failed to send binding response: {e}");
        }
    }
}

struct TxEntry {
    dest: SocketAddr,
    response_tx: mpsc::Sender<(StunMessage, Bytes, SocketAddr)>,
    cancel: Arc<Notify>,
}

struct SessionInner {
    socket: Arc<UdpSocket>,
    config: StunConfig,
    handler: Arc<dyn StunSessionHandler>,
    transactions: Mutex<HashMap<TransactionId, TxEntry>>,
    closed: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

/// A STUN endpoint bound to one UDP socket. Cheap to clone; all clones share
/// the same state.
#[derive(Clone)]
pub struct StunSession {
    inner: Arc<SessionInner>,
}

impl StunSession {
    /// Create a session over `socket` and start its reader task. Must be
    /// called within a tokio runtime.
    pub fn new(
        socket: Arc<UdpSocket>,
        config: StunConfig,
        handler: Arc<dyn StunSessionHandler>,
    ) -> Self {
        let session = StunSession {
            inner: Arc::new(SessionInner {
                socket,
                config,
                handler,
                transactions: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                reader: Mutex::new(None),
            }),
        };

        let reader_session = session.clone();
        let handle = tokio::spawn(async move {
            reader_session.read_loop().await;
        });
        *session.inner.reader.lock().unwrap() = Some(handle);

        session
    }

    /// The socket's local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.socket.local_addr()?)
    }

    /// The session configuration.
    pub fn config(&self) -> &StunConfig {
        &self.inner.config
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Send a request and start its transaction.
    ///
    /// The message keeps the transaction id it was built with: XOR-encoded
    /// address attributes are computed against it, so it must not change
    /// here. Constructors pick random ids, so a collision with an
    /// outstanding transaction means caller error and is rejected. `key`
    /// adds MESSAGE-INTEGRITY; FINGERPRINT follows per the session config.
    pub fn send_request(
        &self,
        mut message: StunMessage,
        dest: SocketAddr,
        key: Option<&[u8]>,
    ) -> Result<RequestHandle> {
        if self.is_closed() {
            return Err(StunError::InvalidState("session closed".to_string()));
        }

        if let Some(software) = &self.inner.config.software {
            if message
                .get_attribute(crate::attr::StunAttributeType::Software)
                .is_none()
            {
                message.add_attribute(StunAttribute::software(software));
            }
        }

        let (response_tx, response_rx) = mpsc::channel(4);
        let cancel = Arc::new(Notify::new());
        let id = message.transaction_id;
        {
            let mut transactions = self.inner.transactions.lock().unwrap();
            if transactions.len() >= self.inner.config.max_transactions {
                return Err(StunError::ResourceExhausted(
                    self.inner.config.max_transactions,
                ));
            }
            if transactions.contains_key(&id) {
                return Err(StunError::InvalidState(format!(
                    "transaction id {id} already in flight"
                )));
            }
            transactions.insert(
                id,
                TxEntry {
                    dest,
                    response_tx,
                    cancel: cancel.clone(),
                },
            );
        }

        let wire = message.encode_with(key, self.inner.config.add_fingerprint);

        let (done_tx, done_rx) = oneshot::channel();
        let params = TransactionParams {
            id,
            wire,
            dest,
            profile: self.inner.config.profile,
            reliable: self.inner.config.reliable_transport,
        };

        let socket = self.inner.socket.clone();
        let registry = Arc::downgrade(&self.inner);
        tokio::spawn(run_transaction(
            socket,
            params,
            response_rx,
            cancel.clone(),
            done_tx,
            move |id| {
                if let Some(inner) = registry.upgrade() {
                    inner.transactions.lock().unwrap().remove(&id);
                }
            },
        ));

        Ok(RequestHandle {
            id,
            done: done_rx,
            cancel,
        })
    }

    /// Send a request and wait for its terminal result.
    pub async fn request(
        &self,
        message: StunMessage,
        dest: SocketAddr,
        key: Option<&[u8]>,
    ) -> Result<(StunMessage, Bytes, SocketAddr)> {
        self.send_request(message, dest, key)?
            .result()
            .await
            .into_result()
    }

    /// Send an indication. Fire-and-forget: no transaction, no retransmit.
    pub async fn send_indication(
        &self,
        message: &StunMessage,
        dest: SocketAddr,
        key: Option<&[u8]>,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(StunError::InvalidState("session closed".to_string()));
        }
        let wire = message.encode_with(key, self.inner.config.add_fingerprint);
        self.inner.socket.send_to(&wire, dest).await?;
        Ok(())
    }

    /// Send a response to a previously received request.
    pub async fn send_response(
        &self,
        response: &StunMessage,
        dest: SocketAddr,
        key: Option<&[u8]>,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(StunError::InvalidState("session closed".to_string()));
        }
        let wire = response.encode_with(key, self.inner.config.add_fingerprint);
        self.inner.socket.send_to(&wire, dest).await?;
        Ok(())
    }

    /// Send raw bytes on the session socket (ChannelData, media).
    pub async fn send_raw(&self, data: &[u8], dest: SocketAddr) -> Result<()> {
        if self.is_closed() {
            return Err(StunError::InvalidState("session closed".to_string()));
        }
        self.inner.socket.send_to(data, dest).await?;
        Ok(())
    }

    /// Number of transactions currently outstanding.
    pub fn outstanding(&self) -> usize {
        self.inner.transactions.lock().unwrap().len()
    }

    /// Close the session. Idempotent and safe to call while responses and
    /// retransmit timers are in flight: the reader is stopped first, then
    /// every outstanding transaction is cancelled.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(reader) = self.inner.reader.lock().unwrap().take() {
            reader.abort();
        }
        let entries: Vec<TxEntry> = {
            let mut transactions = self.inner.transactions.lock().unwrap();
            transactions.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            entry.cancel.notify_one();
        }
        debug!("stun session closed");
    }

    async fn read_loop(self) {
        let mut buf = vec![0u8; 65535];
        loop {
            let (len, source) = match self.inner.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    if self.is_closed() {
                        return;
                    }
                    warn!("socket read error: {e}");
                    continue;
                }
            };
            if self.is_closed() {
                return;
            }
            let data = Bytes::copy_from_slice(&buf[..len]);
            self.dispatch(data, source).await;
        }
    }

    async fn dispatch(&self, data: Bytes, source: SocketAddr) {
        if !is_stun(&data) {
            self.inner.handler.on_raw(self, data, source).await;
            return;
        }

        let options = DecodeOptions {
            check_fingerprint: self.inner.config.check_fingerprint,
        };
        let message = match StunMessage::decode_with(&data, options) {
            Ok(message) => message,
            Err(e) => {
                debug!(%source, "dropping malformed STUN datagram: {e}");
                return;
            }
        };

        match message.class {
            MessageClass::SuccessResponse | MessageClass::ErrorResponse => {
                self.route_response(message, data, source).await;
            }
            MessageClass::Request => {
                self.inner
                    .handler
                    .on_request(self, message, data, source)
                    .await;
            }
            MessageClass::Indication => {
                self.inner.handler.on_indication(self, message, source).await;
            }
        }
    }

    async fn route_response(&self, message: StunMessage, raw: Bytes, source: SocketAddr) {
        let response_tx = {
            let transactions = self.inner.transactions.lock().unwrap();
            match transactions.get(&message.transaction_id) {
                Some(entry) => {
                    // Responses must come from where the request went.
                    if entry.dest != source {
                        debug!(
                            id = %message.transaction_id, %source,
                            expected = %entry.dest,
                            "dropping response from unexpected source"
                        );
                        return;
                    }
                    entry.response_tx.clone()
                }
                None => {
                    trace!(
                        id = %message.transaction_id, %source,
                        "dropping response with no matching transaction"
                    );
                    return;
                }
            }
        };
        // A full channel means a duplicate already completed the
        // transaction; dropping is the correct outcome.
        let _ = response_tx.try_send((message, raw, source));
    }
}

impl std::fmt::Debug for StunSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StunSession")
            .field("local_addr", &self.inner.socket.local_addr().ok())
            .field("closed", &self.is_closed())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// Convenience: bind a UDP socket and wrap it in a session.
pub async fn bind_session(
    bind_addr: SocketAddr,
    config: StunConfig,
    handler: Arc<dyn StunSessionHandler>,
) -> Result<StunSession> {
    let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
    Ok(StunSession::new(socket, config, handler))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;
    #[async_trait]
    impl StunSessionHandler for NoopHandler {}

    async fn loopback_session(config: StunConfig) -> StunSession {
        bind_session("127.0.0.1:0".parse().unwrap(), config, Arc::new(NoopHandler))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn request_against_binding_responder() {
        let server = bind_session(
            "127.0.0.1:0".parse().unwrap(),
            StunConfig::default(),
            Arc::new(BindingResponder),
        )
        .await
        .unwrap();
        let client = loopback_session(StunConfig::default()).await;

        let (response, _raw, _src) = client
            .request(
                StunMessage::binding_request(),
                server.local_addr().unwrap(),
                None,
            )
            .await
            .unwrap();

        let mapped = response
            .get_attribute(crate::attr::StunAttributeType::XorMappedAddress)
            .unwrap()
            .as_xor_address(&response.transaction_id)
            .unwrap();
        assert_eq!(mapped, client.local_addr().unwrap());

        client.close();
        server.close();
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_reported_once_after_budget() {
        let mut config = StunConfig::default();
        config.profile = RetransmitProfile::short();
        let client = loopback_session(config.clone()).await;

        // Black hole: nothing listens on this port.
        let dest: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let handle = client
            .send_request(StunMessage::binding_request(), dest, None)
            .unwrap();

        let result = handle.result().await;
        assert!(matches!(result, TransactionResult::Timeout));
        assert_eq!(client.outstanding(), 0);
        client.close();
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let client = loopback_session(StunConfig::default()).await;
        let dest: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let handle = client
            .send_request(StunMessage::binding_request(), dest, None)
            .unwrap();

        handle.cancel();
        handle.cancel();
        let result = handle.result().await;
        assert!(matches!(result, TransactionResult::Cancelled));
        client.close();
    }

    #[tokio::test]
    async fn close_cancels_outstanding_transactions() {
        let client = loopback_session(StunConfig::default()).await;
        let dest: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let handle = client
            .send_request(StunMessage::binding_request(), dest, None)
            .unwrap();

        client.close();
        client.close(); // idempotent

        let result = handle.result().await;
        assert!(matches!(result, TransactionResult::Cancelled));
        assert!(client
            .send_request(StunMessage::binding_request(), dest, None)
            .is_err());
    }

    #[tokio::test]
    async fn transaction_limit_rejects_new_work() {
        let mut config = StunConfig::default();
        config.max_transactions = 1;
        let client = loopback_session(config).await;
        let dest: SocketAddr = "127.0.0.1:9".parse().unwrap();

        let _first = client
            .send_request(StunMessage::binding_request(), dest, None)
            .unwrap();
        let second = client.send_request(StunMessage::binding_request(), dest, None);
        assert!(matches!(second, Err(StunError::ResourceExhausted(1))));
        client.close();
    }
}
