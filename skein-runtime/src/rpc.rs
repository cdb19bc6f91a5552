//! Id-correlated request/response channel
//!
//! [`channel`] returns an [`RpcClient`] and an [`RpcServer`]. Each call is
//! tagged with a fresh [`Uuid`]; the client parks a `oneshot` sender under
//! that id, and a dispatcher task resolves it when the server responds with
//! the same id. Responses may arrive in any order.
//!
//! Dropping the server fails every outstanding call with
//! [`Error::Channel`]; dropping every client ends the server's request
//! stream.

use std::collections::HashMap;
use std::sync::Arc;

use skein::{Error, Result};
use tokio::sync::{mpsc, oneshot, Mutex};
use uuid::Uuid;

type Pending<Resp> = Arc<Mutex<HashMap<Uuid, oneshot::Sender<Resp>>>>;

/// A request as seen by the server.
#[derive(Debug)]
pub struct Envelope<Req> {
    pub id: Uuid,
    pub request: Req,
}

/// Sending half. Cheap to clone.
pub struct RpcClient<Req, Resp> {
    requests: mpsc::Sender<Envelope<Req>>,
    pending: Pending<Resp>,
}

impl<Req, Resp> Clone for RpcClient<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            requests: self.requests.clone(),
            pending: Arc::clone(&self.pending),
        }
    }
}

/// Serving half.
pub struct RpcServer<Req, Resp> {
    requests: mpsc::Receiver<Envelope<Req>>,
    responses: mpsc::Sender<(Uuid, Resp)>,
}

/// Create a connected client/server pair. Must be called inside a tokio
/// runtime: the response dispatcher is spawned here.
#[must_use]
pub fn channel<Req, Resp>(capacity: usize) -> (RpcClient<Req, Resp>, RpcServer<Req, Resp>)
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    let (request_tx, request_rx) = mpsc::channel(capacity);
    let (response_tx, response_rx) = mpsc::channel(capacity);
    let pending: Pending<Resp> = Arc::new(Mutex::new(HashMap::new()));

    tokio::spawn(dispatch(response_rx, Arc::clone(&pending)));

    (
        RpcClient {
            requests: request_tx,
            pending,
        },
        RpcServer {
            requests: request_rx,
            responses: response_tx,
        },
    )
}

async fn dispatch<Resp>(mut responses: mpsc::Receiver<(Uuid, Resp)>, pending: Pending<Resp>) {
    while let Some((id, response)) = responses.recv().await {
        let waiter = pending.lock().await.remove(&id);
        match waiter {
            // The caller may have given up; nothing to do then.
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => tracing::warn!(%id, "response for unknown request id"),
        }
    }
    // Server gone: wake every caller with an error.
    pending.lock().await.clear();
}

impl<Req, Resp> RpcClient<Req, Resp> {
    /// Send `request` and wait for its response.
    ///
    /// # Errors
    /// Returns [`Error::Channel`] if the server is gone or drops the request.
    pub async fn call(&self, request: Req) -> Result<Resp> {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self.requests.send(Envelope { id, request }).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(Error::Channel("server is closed".into()));
        }
        rx.await
            .map_err(|_| Error::Channel(format!("request {id} was dropped without a response")))
    }

    /// Number of calls waiting for a response.
    pub async fn outstanding(&self) -> usize {
        self.pending.lock().await.len()
    }
}

impl<Req, Resp> RpcServer<Req, Resp> {
    /// Next request, or `None` once every client is dropped.
    pub async fn next_request(&mut self) -> Option<Envelope<Req>> {
        self.requests.recv().await
    }

    /// Answer the request with the given id.
    ///
    /// # Errors
    /// Returns [`Error::Channel`] if the dispatcher has stopped.
    pub async fn respond(&self, id: Uuid, response: Resp) -> Result<()> {
        self.responses
            .send((id, response))
            .await
            .map_err(|_| Error::Channel("response dispatcher stopped".into()))
    }
}
