//! Coordination server
//!
//! Serves the membership store over TCP. Every connection is one
//! session: its ephemeral registrations vanish when the connection
//! closes or goes quiet past the session TTL.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use super::memory::MemoryCore;
use super::{ClusterView, CoordinationService, MemberInfo};
use crate::error::{Error, Result};
use crate::rpc::{read_frame, write_frame};
use crate::store::StoreId;

/// Requests a session may issue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CoordRequest {
    Register(MemberInfo),
    Update(MemberInfo),
    Deregister,
    GetView,
    CreateCluster(StoreId),
    GetStoreId,
    KeepAlive,
}

/// Responses from the membership store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CoordResponse {
    Registered(u64),
    View(ClusterView),
    Agreed(StoreId),
    StoreId(Option<StoreId>),
    Ok,
    Error(String),
}

/// The coordination service endpoint
pub struct CoordServer {
    core: Arc<MemoryCore>,
    bind_address: String,
    session_ttl: Duration,
}

impl CoordServer {
    pub fn new(bind_address: String, session_ttl: Duration) -> Self {
        Self {
            core: Arc::new(MemoryCore::new()),
            bind_address,
            session_ttl,
        }
    }

    pub fn core(&self) -> Arc<MemoryCore> {
        Arc::clone(&self.core)
    }

    /// Accept sessions until `shutdown` flips
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        tracing::info!("coordination server listening on {}", self.bind_address);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let core = Arc::clone(&self.core);
                            let ttl = self.session_ttl;
                            tokio::spawn(async move {
                                if let Err(e) = handle_session(core, socket, ttl).await {
                                    tracing::debug!("session from {addr} ended: {e}");
                                }
                            });
                        }
                        Err(e) => tracing::error!("accept error: {e}"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("coordination server stopped");
        Ok(())
    }
}

pub(crate) async fn handle_session(
    core: Arc<MemoryCore>,
    socket: TcpStream,
    ttl: Duration,
) -> Result<()> {
    let session = core.session();
    let (mut reader, mut writer) = socket.into_split();

    loop {
        // A quiet session is an expired session
        let frame = match tokio::time::timeout(ttl, read_frame(&mut reader)).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(Error::Io(ref e))) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                tracing::info!(session = session.session_id(), "session ttl expired");
                break;
            }
        };

        let request: CoordRequest = bincode::deserialize(&frame)?;
        let response = dispatch(&session, request);
        write_frame(&mut writer, &bincode::serialize(&response)?).await?;
    }

    // Dropping the session expires its registrations
    Ok(())
}

fn dispatch(session: &super::memory::MemoryCoordinator, request: CoordRequest) -> CoordResponse {
    let result = match request {
        CoordRequest::Register(member) => session.register(member).map(CoordResponse::Registered),
        CoordRequest::Update(member) => session.update_member(member).map(|_| CoordResponse::Ok),
        CoordRequest::Deregister => session.deregister().map(|_| CoordResponse::Ok),
        CoordRequest::GetView => session.view().map(CoordResponse::View),
        CoordRequest::CreateCluster(store_id) => {
            session.create_cluster(store_id).map(CoordResponse::Agreed)
        }
        CoordRequest::GetStoreId => session.cluster_store_id().map(CoordResponse::StoreId),
        CoordRequest::KeepAlive => Ok(CoordResponse::Ok),
    };
    result.unwrap_or_else(|e| CoordResponse::Error(e.to_string()))
}
