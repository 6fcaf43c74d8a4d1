//! A minimal in-process stand-in for the wire transport the spec treats as
//! external (§1 "the IPC transport that carries client requests... an
//! in-process handler interface"). `LoopbackTransport` shuttles typed
//! requests to a [`ShadowIpcHandler`] over an `mpsc` channel and returns the
//! response on a matching oneshot — just enough to drive the handler
//! end-to-end in tests without inventing a real IPC stack.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::{IpcError, Result};
use crate::handler::{NamedShadowPage, ShadowIpcHandler, UpdateResponse};

/// One client request, paired with a channel to deliver its response.
pub enum TransportRequest {
    Get {
        thing_name: String,
        shadow_name: String,
        respond_to: oneshot::Sender<Result<Value>>,
    },
    Update {
        thing_name: String,
        shadow_name: String,
        overlay: Value,
        version: u64,
        respond_to: oneshot::Sender<Result<UpdateResponse>>,
    },
    Delete {
        thing_name: String,
        shadow_name: String,
        respond_to: oneshot::Sender<Result<()>>,
    },
    ListNamedShadows {
        thing_name: String,
        page_size: i64,
        next_token: Option<String>,
        respond_to: oneshot::Sender<Result<NamedShadowPage>>,
    },
}

/// The server side: owns the handler and the receiving end of the channel,
/// dispatching each inbound request to the matching `handle_*` call.
pub struct LoopbackServer {
    handler: Arc<ShadowIpcHandler>,
    requests: mpsc::Receiver<TransportRequest>,
}

impl LoopbackServer {
    /// Drive the loop until every client handle (and the handle used to
    /// build this server) has been dropped.
    pub async fn run(mut self) {
        while let Some(request) = self.requests.recv().await {
            match request {
                TransportRequest::Get {
                    thing_name,
                    shadow_name,
                    respond_to,
                } => {
                    let _ = respond_to.send(self.handler.handle_get(&thing_name, &shadow_name).await);
                }
                TransportRequest::Update {
                    thing_name,
                    shadow_name,
                    overlay,
                    version,
                    respond_to,
                } => {
                    let _ = respond_to.send(
                        self.handler
                            .handle_update(&thing_name, &shadow_name, overlay, version)
                            .await,
                    );
                }
                TransportRequest::Delete {
                    thing_name,
                    shadow_name,
                    respond_to,
                } => {
                    let _ = respond_to.send(self.handler.handle_delete(&thing_name, &shadow_name).await);
                }
                TransportRequest::ListNamedShadows {
                    thing_name,
                    page_size,
                    next_token,
                    respond_to,
                } => {
                    let _ = respond_to.send(
                        self.handler
                            .handle_list_named_shadows_for_thing(
                                &thing_name,
                                page_size,
                                next_token.as_deref(),
                            )
                            .await,
                    );
                }
            }
        }
    }
}

/// The client side: a cheap, cloneable handle callers use to issue requests
/// without holding a reference to the handler itself.
#[derive(Clone)]
pub struct LoopbackTransport {
    requests: mpsc::Sender<TransportRequest>,
}

impl LoopbackTransport {
    /// Build a connected client/server pair. `capacity` bounds the number of
    /// in-flight requests before `send` starts blocking, mirroring a real
    /// transport's backpressure.
    pub fn new(handler: Arc<ShadowIpcHandler>, capacity: usize) -> (Self, LoopbackServer) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self { requests: tx },
            LoopbackServer {
                handler,
                requests: rx,
            },
        )
    }

    pub async fn get(&self, thing_name: &str, shadow_name: &str) -> Result<Value> {
        let (respond_to, response) = oneshot::channel();
        self.requests
            .send(TransportRequest::Get {
                thing_name: thing_name.to_string(),
                shadow_name: shadow_name.to_string(),
                respond_to,
            })
            .await
            .map_err(|_| IpcError::Internal("ipc server shut down".to_string()))?;
        response
            .await
            .map_err(|_| IpcError::Internal("ipc server dropped the response channel".to_string()))?
    }

    pub async fn update(
        &self,
        thing_name: &str,
        shadow_name: &str,
        overlay: Value,
        version: u64,
    ) -> Result<UpdateResponse> {
        let (respond_to, response) = oneshot::channel();
        self.requests
            .send(TransportRequest::Update {
                thing_name: thing_name.to_string(),
                shadow_name: shadow_name.to_string(),
                overlay,
                version,
                respond_to,
            })
            .await
            .map_err(|_| IpcError::Internal("ipc server shut down".to_string()))?;
        response
            .await
            .map_err(|_| IpcError::Internal("ipc server dropped the response channel".to_string()))?
    }

    pub async fn delete(&self, thing_name: &str, shadow_name: &str) -> Result<()> {
        let (respond_to, response) = oneshot::channel();
        self.requests
            .send(TransportRequest::Delete {
                thing_name: thing_name.to_string(),
                shadow_name: shadow_name.to_string(),
                respond_to,
            })
            .await
            .map_err(|_| IpcError::Internal("ipc server shut down".to_string()))?;
        response
            .await
            .map_err(|_| IpcError::Internal("ipc server dropped the response channel".to_string()))?
    }

    pub async fn list_named_shadows_for_thing(
        &self,
        thing_name: &str,
        page_size: i64,
        next_token: Option<String>,
    ) -> Result<NamedShadowPage> {
        let (respond_to, response) = oneshot::channel();
        self.requests
            .send(TransportRequest::ListNamedShadows {
                thing_name: thing_name.to_string(),
                page_size,
                next_token,
                respond_to,
            })
            .await
            .map_err(|_| IpcError::Internal("ipc server shut down".to_string()))?;
        response
            .await
            .map_err(|_| IpcError::Internal("ipc server dropped the response channel".to_string()))?
    }
}
