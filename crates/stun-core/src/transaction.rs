//! The STUN client transaction: one request/response exchange with
//! retransmission.
//!
//! Each transaction runs as its own tokio task owned by a
//! [`StunSession`](crate::session::StunSession). The task serializes every
//! source of completion (matching response, retransmit timer, cancel) through
//! one `select!` loop, so the terminal outcome is computed exactly once and
//! duplicate responses arriving later find no transaction to match. The
//! session removes the transaction from its map before the result is
//! delivered.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, trace, warn};

use rnat_infra_common::RetransmitProfile;

use crate::error::StunError;
use crate::message::{MessageClass, StunMessage, TransactionId};

/// Terminal outcome of a client transaction. Delivered exactly once.
#[derive(Debug)]
pub enum TransactionResult {
    /// A success-class response matched the transaction.
    Response {
        message: StunMessage,
        /// Raw datagram, kept so the caller can verify MESSAGE-INTEGRITY.
        raw: Bytes,
        source: SocketAddr,
    },
    /// An error-class response matched the transaction.
    ServerError {
        code: u16,
        reason: String,
        message: StunMessage,
    },
    /// The retransmit budget was exhausted without a response.
    Timeout,
    /// The transaction was cancelled or its session closed.
    Cancelled,
}

impl TransactionResult {
    /// Convert into a `Result`, flattening the failure variants into
    /// [`StunError`].
    pub fn into_result(self) -> Result<(StunMessage, Bytes, SocketAddr), StunError> {
        match self {
            TransactionResult::Response {
                message,
                raw,
                source,
            } => Ok((message, raw, source)),
            TransactionResult::ServerError { code, reason, .. } => {
                Err(StunError::ServerError { code, reason })
            }
            TransactionResult::Timeout => Err(StunError::TransactionTimeout),
            TransactionResult::Cancelled => Err(StunError::Cancelled),
        }
    }
}

/// Handle to one in-flight transaction.
pub struct RequestHandle {
    pub(crate) id: TransactionId,
    pub(crate) done: oneshot::Receiver<TransactionResult>,
    pub(crate) cancel: Arc<Notify>,
}

impl RequestHandle {
    /// The transaction id of the outstanding request.
    pub fn transaction_id(&self) -> TransactionId {
        self.id
    }

    /// Request cancellation. Idempotent: cancelling a transaction that has
    /// already completed is a no-op.
    pub fn cancel(&self) {
        self.cancel.notify_one();
    }

    /// A cancellation token usable without holding the handle.
    pub fn canceller(&self) -> Canceller {
        Canceller {
            cancel: self.cancel.clone(),
        }
    }

    /// Wait for the terminal outcome. A dropped session resolves as
    /// [`TransactionResult::Cancelled`].
    pub async fn result(self) -> TransactionResult {
        self.done.await.unwrap_or(TransactionResult::Cancelled)
    }
}

/// Detached cancellation token for a transaction.
#[derive(Clone)]
pub struct Canceller {
    cancel: Arc<Notify>,
}

impl Canceller {
    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancel.notify_one();
    }
}

/// What the driver needs to run one transaction.
pub(crate) struct TransactionParams {
    pub id: TransactionId,
    /// Encoded request; retransmits re-send these identical bytes.
    pub wire: Bytes,
    pub dest: SocketAddr,
    pub profile: RetransmitProfile,
    /// Reliable transports send once and only arm the overall timeout.
    pub reliable: bool,
}

/// Drive one transaction to its terminal state.
///
/// `responses` is fed by the session demultiplexer; `unregister` runs before
/// the result is delivered so late duplicates never find the transaction.
pub(crate) async fn run_transaction(
    socket: Arc<UdpSocket>,
    params: TransactionParams,
    mut responses: mpsc::Receiver<(StunMessage, Bytes, SocketAddr)>,
    cancel: Arc<Notify>,
    done: oneshot::Sender<TransactionResult>,
    unregister: impl FnOnce(TransactionId) + Send + 'static,
) {
    let result = transaction_loop(&socket, &params, &mut responses, &cancel).await;
    unregister(params.id);
    trace!(id = %params.id, "transaction terminal: {:?}", terse(&result));
    // The receiver may be gone (caller dropped the handle); that is fine.
    let _ = done.send(result);
}

fn terse(result: &TransactionResult) -> &'static str {
    match result {
        TransactionResult::Response { .. } => "response",
        TransactionResult::ServerError { .. } => "server error",
        TransactionResult::Timeout => "timeout",
        TransactionResult::Cancelled => "cancelled",
    }
}

async fn transaction_loop(
    socket: &UdpSocket,
    params: &TransactionParams,
    responses: &mut mpsc::Receiver<(StunMessage, Bytes, SocketAddr)>,
    cancel: &Notify,
) -> TransactionResult {
    let profile = &params.profile;
    let mut sends: u32 = 0;

    loop {
        if sends == 0 || !params.reliable {
            if let Err(e) = socket.send_to(&params.wire, params.dest).await {
                // Transient transport errors are absorbed by the retransmit
                // schedule; the transaction still times out eventually.
                warn!(id = %params.id, dest = %params.dest, "send failed: {e}");
            } else if sends > 0 {
                trace!(id = %params.id, "retransmit #{sends}");
            }
        }
        sends += 1;

        let wait = if params.reliable {
            profile.total_budget()
        } else if sends >= profile.request_count {
            profile.final_wait
        } else {
            profile.delay(sends - 1)
        };

        tokio::select! {
            biased;

            _ = cancel.notified() => {
                return TransactionResult::Cancelled;
            }

            received = responses.recv() => {
                match received {
                    Some((message, raw, source)) => {
                        return complete_with(message, raw, source);
                    }
                    // Session dropped the sender: session closed.
                    None => return TransactionResult::Cancelled,
                }
            }

            _ = tokio::time::sleep(wait) => {
                if params.reliable || sends >= profile.request_count {
                    debug!(id = %params.id, dest = %params.dest,
                           "transaction timed out after {sends} send(s)");
                    return TransactionResult::Timeout;
                }
            }
        }
    }
}

fn complete_with(message: StunMessage, raw: Bytes, source: SocketAddr) -> TransactionResult {
    match message.class {
        MessageClass::ErrorResponse => {
            let (code, reason) = message.error_code().unwrap_or((0, String::new()));
            TransactionResult::ServerError {
                code,
                reason,
                message,
            }
        }
        _ => TransactionResult::Response {
            message,
            raw,
            source,
        },
    }
}
