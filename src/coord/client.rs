//! Coordination client
//!
//! Blocking client for the TCP coordination service. Keeps one session
//! connection alive with periodic keep-alives, re-registers after a
//! reconnect (under a fresh sequence number, as a new session), and
//! surfaces view changes through a watch channel fed by a poller.

use std::io::ErrorKind;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use super::server::{CoordRequest, CoordResponse};
use super::{ClusterView, CoordinationService, MemberInfo};
use crate::error::{Error, Result};
use crate::rpc::{read_frame_sync, write_frame_sync};
use crate::store::StoreId;

struct ClientState {
    conn: Option<TcpStream>,
    /// Published on register; replayed after a reconnect
    member: Option<MemberInfo>,
    last_view: Option<ClusterView>,
}

/// A session against a remote coordination service
pub struct CoordClient {
    servers: Vec<String>,
    session_ttl: Duration,
    state: Mutex<ClientState>,
    notify: watch::Sender<u64>,
    stop: Arc<AtomicBool>,
}

impl CoordClient {
    pub fn new(servers: Vec<String>, session_ttl: Duration) -> Arc<Self> {
        let (notify, _) = watch::channel(0);
        let client = Arc::new(Self {
            servers,
            session_ttl,
            state: Mutex::new(ClientState {
                conn: None,
                member: None,
                last_view: None,
            }),
            notify,
            stop: Arc::new(AtomicBool::new(false)),
        });
        client.spawn_background();
        client
    }

    fn spawn_background(self: &Arc<Self>) {
        // Keep-alive at a third of the TTL
        let keepalive = Arc::clone(self);
        std::thread::Builder::new()
            .name("coord-keepalive".into())
            .spawn(move || {
                let interval = keepalive.session_ttl / 3;
                while !keepalive.stop.load(Ordering::Relaxed) {
                    std::thread::sleep(interval);
                    if let Err(e) = keepalive.request(&CoordRequest::KeepAlive) {
                        tracing::debug!("coordination keep-alive failed: {e}");
                    }
                }
            })
            .expect("spawn coord-keepalive");

        // View poller feeding the subscription channel
        let poller = Arc::clone(self);
        std::thread::Builder::new()
            .name("coord-poll".into())
            .spawn(move || {
                let interval = poller.session_ttl / 2;
                let mut version = 0u64;
                while !poller.stop.load(Ordering::Relaxed) {
                    std::thread::sleep(interval);
                    match poller.fetch_view() {
                        Ok(view) => {
                            let mut state = poller.state.lock();
                            if state.last_view.as_ref() != Some(&view) {
                                state.last_view = Some(view);
                                drop(state);
                                version += 1;
                                let _ = poller.notify.send(version);
                            }
                        }
                        Err(e) => tracing::debug!("coordination view poll failed: {e}"),
                    }
                }
            })
            .expect("spawn coord-poll");
    }

    /// Stop the background threads; the session drops with the socket
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
        self.state.lock().conn = None;
    }

    fn connect(&self) -> Result<TcpStream> {
        let mut last_err = None;
        for server in &self.servers {
            match TcpStream::connect(server) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    stream.set_read_timeout(Some(self.session_ttl))?;
                    stream.set_write_timeout(Some(self.session_ttl))?;
                    return Ok(stream);
                }
                Err(e) => {
                    last_err = Some(Error::ConnectionFailed {
                        address: server.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Coordination("no coordination servers".into())))
    }

    fn request(&self, request: &CoordRequest) -> Result<CoordResponse> {
        let mut state = self.state.lock();

        // Two passes: a dead pooled connection gets one reconnect
        for attempt in 0..2 {
            if state.conn.is_none() {
                let stream = self.connect()?;
                state.conn = Some(stream);
                // New socket means new session: replay our registration
                if let Some(member) = state.member.clone() {
                    if !matches!(request, CoordRequest::Register(_)) {
                        tracing::info!("re-registering after coordination reconnect");
                        if let Err(e) =
                            Self::roundtrip(state.conn.as_mut().unwrap(), &CoordRequest::Register(member))
                        {
                            state.conn = None;
                            if attempt == 1 {
                                return Err(e);
                            }
                            continue;
                        }
                    }
                }
            }

            match Self::roundtrip(state.conn.as_mut().unwrap(), request) {
                Ok(response) => return Ok(response),
                Err(e) => {
                    state.conn = None;
                    if attempt == 1 {
                        return Err(e);
                    }
                    tracing::debug!("coordination request failed, reconnecting: {e}");
                }
            }
        }
        unreachable!("loop returns on second attempt");
    }

    fn roundtrip(stream: &mut TcpStream, request: &CoordRequest) -> Result<CoordResponse> {
        write_frame_sync(stream, &bincode::serialize(request)?)?;
        let frame = read_frame_sync(stream).map_err(|e| match e {
            Error::Io(ref io) if io.kind() == ErrorKind::WouldBlock => Error::RequestTimeout(
                stream
                    .peer_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_default(),
            ),
            other => other,
        })?;
        let response: CoordResponse = bincode::deserialize(&frame)?;
        if let CoordResponse::Error(message) = response {
            return Err(Error::Coordination(message));
        }
        Ok(response)
    }

    fn fetch_view(&self) -> Result<ClusterView> {
        match self.request(&CoordRequest::GetView)? {
            CoordResponse::View(view) => Ok(view),
            other => Err(Error::Coordination(format!("unexpected response {other:?}"))),
        }
    }
}

impl CoordinationService for CoordClient {
    fn register(&self, member: MemberInfo) -> Result<u64> {
        self.state.lock().member = Some(member.clone());
        match self.request(&CoordRequest::Register(member))? {
            CoordResponse::Registered(seq) => Ok(seq),
            other => Err(Error::Coordination(format!("unexpected response {other:?}"))),
        }
    }

    fn update_member(&self, member: MemberInfo) -> Result<()> {
        self.state.lock().member = Some(member.clone());
        match self.request(&CoordRequest::Update(member))? {
            CoordResponse::Ok => Ok(()),
            other => Err(Error::Coordination(format!("unexpected response {other:?}"))),
        }
    }

    fn deregister(&self) -> Result<()> {
        self.state.lock().member = None;
        match self.request(&CoordRequest::Deregister)? {
            CoordResponse::Ok => Ok(()),
            other => Err(Error::Coordination(format!("unexpected response {other:?}"))),
        }
    }

    fn view(&self) -> Result<ClusterView> {
        self.fetch_view()
    }

    fn create_cluster(&self, store_id: StoreId) -> Result<StoreId> {
        match self.request(&CoordRequest::CreateCluster(store_id))? {
            CoordResponse::Agreed(agreed) => Ok(agreed),
            other => Err(Error::Coordination(format!("unexpected response {other:?}"))),
        }
    }

    fn cluster_store_id(&self) -> Result<Option<StoreId>> {
        match self.request(&CoordRequest::GetStoreId)? {
            CoordResponse::StoreId(id) => Ok(id),
            other => Err(Error::Coordination(format!("unexpected response {other:?}"))),
        }
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.notify.subscribe()
    }
}

impl Drop for CoordClient {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::server::CoordServer;

    async fn spawn_server() -> (std::net::SocketAddr, Arc<crate::coord::MemoryCore>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = CoordServer::new(addr.to_string(), Duration::from_secs(2));
        let core = server.core();
        tokio::spawn(async move {
            loop {
                let (socket, _) = listener.accept().await.unwrap();
                let core = server.core();
                tokio::spawn(async move {
                    let _ = crate::coord::server::handle_session(core, socket, Duration::from_secs(2))
                        .await;
                });
            }
        });
        (addr, core)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn register_and_view_through_tcp() {
        let (addr, _core) = spawn_server().await;

        let result = tokio::task::spawn_blocking(move || {
            let client = CoordClient::new(vec![addr.to_string()], Duration::from_secs(2));
            let member = MemberInfo {
                machine_id: 3,
                ha_address: "127.0.0.1:6364".into(),
                backup_only: false,
            };
            let seq = client.register(member).unwrap();
            let view = client.view().unwrap();
            client.shutdown();
            (seq, view)
        })
        .await
        .unwrap();

        assert!(result.0 > 0);
        assert_eq!(result.1.primary_machine(), Some(3));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn store_id_claim_through_tcp() {
        let (addr, _core) = spawn_server().await;

        tokio::task::spawn_blocking(move || {
            let client = CoordClient::new(vec![addr.to_string()], Duration::from_secs(2));
            let mine = StoreId::new();
            let theirs = StoreId::new();
            assert_eq!(client.create_cluster(mine).unwrap(), mine);
            assert_eq!(client.create_cluster(theirs).unwrap(), mine);
            client.shutdown();
        })
        .await
        .unwrap();
    }
}
