use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::client_api::{self, ApiRequest};
use crate::command::Command;
use crate::file_storage::{FileStorage, FileStorageError};
use crate::machine::{AtomicValueMachine, ClientCommand, DEFAULT_SESSION_TIMEOUT};
use crate::membership::{Membership, MembershipError};
use crate::primitive::{self, ClientReply, ClientRequest, NodeStatus, PrimitiveRuntime, Submission};
use crate::runtime::{Event, Runtime, TimerConfig, TimerConfigError};
use crate::transport::{Transport, TransportError};
use crate::types::{LogIndex, NodeId, Term};

/// Longest the loop blocks on the network before checking timers and clients.
const MAX_POLL_WAIT: Duration = Duration::from_millis(5);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("storage: {0}")]
    Storage(#[from] FileStorageError),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("membership: {0}")]
    Membership(#[from] MembershipError),
    #[error("timers: {0}")]
    Timers(#[from] TimerConfigError),
    #[error("client api: {0}")]
    ClientApi(#[source] std::io::Error),
    #[error("config: {0}")]
    Config(String),
}

pub struct Config {
    pub id: u64,
    pub addr: String,
    pub client_addr: Option<String>,
    /// Peer id to Raft address, both as given on the command line.
    pub peers: HashMap<String, String>,
    pub data_dir: PathBuf,
    pub timers: TimerConfig,
    pub session_timeout: Duration,
    /// Snapshot every this many applied entries; 0 disables snapshots.
    pub snapshot_threshold: u64,
    /// How long the HTTP API waits for a command to be applied.
    pub request_timeout: Duration,
}

impl Config {
    pub fn new(id: u64, addr: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            id,
            addr: addr.into(),
            client_addr: None,
            peers: HashMap::new(),
            data_dir: data_dir.into(),
            timers: TimerConfig::default(),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            snapshot_threshold: 1000,
            request_timeout: Duration::from_secs(2),
        }
    }
}

/// A client waiting for the entry at some index to be applied.
struct PendingReply {
    term: Term,
    reply: oneshot::Sender<ClientReply>,
}

/// A running atomic value node: persistent log on disk, RPCs over TCP, client
/// API over HTTP.
pub struct Server {
    runtime: PrimitiveRuntime<FileStorage<ClientCommand>>,
    transport: Transport<ClientCommand>,
    client_rx: mpsc::Receiver<ApiRequest>,
    pending: HashMap<LogIndex, PendingReply>,
    client_addr: Option<SocketAddr>,
}

impl Server {
    /// Open storage, bind the Raft listener, optionally start the HTTP API,
    /// and restore any persistent state.
    pub fn start(config: Config) -> Result<Self, ServerError> {
        config.timers.validate()?;
        let local_id = NodeId::from(config.id);
        let addr = parse_addr(&config.addr)?;

        let peers = parse_peers(&config.peers)?;
        let membership = Membership::with_local(local_id, peers.keys().copied())?;

        let storage = FileStorage::open(&config.data_dir)?;
        let mut runtime = Runtime::from_storage(
            local_id,
            membership,
            AtomicValueMachine::new(config.session_timeout),
            storage,
            config.timers.clone(),
        )?
        .with_snapshot_threshold(config.snapshot_threshold);
        runtime
            .state_machine_mut()
            .set_session_timeout(config.session_timeout);

        let transport = Transport::bind(local_id, addr, peers)?;
        info!(node = %local_id, %addr, "raft listening");

        let (client_tx, client_rx) = mpsc::channel();
        let client_addr = match &config.client_addr {
            Some(raw) => {
                let bound = client_api::start(parse_addr(raw)?, client_tx, config.request_timeout)
                    .map_err(ServerError::ClientApi)?;
                Some(bound)
            }
            None => None,
        };

        Ok(Self {
            runtime,
            transport,
            client_rx,
            pending: HashMap::new(),
            client_addr,
        })
    }

    /// Address the HTTP API is bound to, if it was started.
    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.client_addr
    }

    pub fn raft_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Run the Raft event loop. Returns only on a storage or transport error,
    /// which halts the node.
    pub fn run(&mut self) -> Result<(), ServerError> {
        let result = self.event_loop();
        if let Err(e) = &result {
            error!(node = %self.runtime.node().id, error = %e, "event loop stopped");
        }
        result
    }

    fn event_loop(&mut self) -> Result<(), ServerError> {
        loop {
            // Accept any client API requests that arrived since the last iteration.
            self.drain_client_requests()?;

            // Drain fired timers before blocking; back-to-back timeouts must not be skipped.
            if let Some(event) = self.runtime.poll_timers() {
                let commands = self.runtime.handle(event)?;
                self.dispatch(commands)?;
                self.settle();
                continue;
            }

            // Block until the next timer deadline or an incoming message, whichever comes first.
            let wait = self
                .runtime
                .next_deadline()
                .saturating_duration_since(Instant::now())
                .min(MAX_POLL_WAIT);

            if let Some((from, message)) = self.transport.recv_timeout(wait) {
                let commands = self.runtime.handle(Event::Message { from, message })?;
                self.dispatch(commands)?;
                self.settle();
            }
        }
    }

    /// Pull pending client requests off the channel and route them.
    fn drain_client_requests(&mut self) -> Result<(), ServerError> {
        while let Ok(request) = self.client_rx.try_recv() {
            match request {
                ApiRequest::Command { request, reply } => self.submit(request, reply)?,
                ApiRequest::Status { reply } => {
                    let _ = reply.send(NodeStatus::of(&self.runtime)?);
                }
            }
        }
        Ok(())
    }

    fn submit(
        &mut self,
        request: ClientRequest,
        reply: oneshot::Sender<ClientReply>,
    ) -> Result<(), ServerError> {
        match primitive::submit(&mut self.runtime, request, Instant::now(), wall_clock_ms())? {
            Submission::Done(answer) => {
                let _ = reply.send(answer);
            }
            Submission::Pending { index, term } => {
                debug!(%index, %term, "command appended");
                self.pending.insert(index, PendingReply { term, reply });
                let replication = self.runtime.take_commands();
                self.dispatch(replication)?;
                // Single-member clusters commit on append.
                self.settle();
            }
        }
        Ok(())
    }

    /// Answer clients whose entries were applied, and redirect the rest once
    /// this node is no longer leader.
    fn settle(&mut self) {
        for applied in self.runtime.take_outputs() {
            let Some(waiting) = self.pending.remove(&applied.index) else {
                continue;
            };
            let answer = if waiting.term == applied.term {
                ClientReply::from(applied.output)
            } else {
                // Another leader's entry replaced ours at this index.
                ClientReply::NotLeader {
                    leader_hint: self.runtime.node().leader_hint(),
                }
            };
            let _ = waiting.reply.send(answer);
        }

        if !self.runtime.is_leader() && !self.pending.is_empty() {
            let leader_hint = self.runtime.node().leader_hint();
            debug!(count = self.pending.len(), "no longer leader, redirecting waiting clients");
            for (_, waiting) in self.pending.drain() {
                let _ = waiting.reply.send(ClientReply::NotLeader { leader_hint });
            }
        }

        // Clients that gave up have already been told Timeout.
        self.pending.retain(|_, waiting| !waiting.reply.is_closed());
    }

    fn dispatch(&self, commands: Vec<Command<ClientCommand>>) -> Result<(), ServerError> {
        for command in commands {
            match command {
                Command::Send { to, message } => self.transport.send(to, message)?,
                Command::Broadcast { message } => self.transport.broadcast(message)?,
                Command::ResetElectionTimer | Command::ResetHeartbeatTimer => {}
            }
        }
        Ok(())
    }
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn parse_addr(raw: &str) -> Result<SocketAddr, ServerError> {
    raw.parse()
        .map_err(|e| ServerError::Config(format!("invalid addr '{raw}': {e}")))
}

fn parse_peers(raw: &HashMap<String, String>) -> Result<HashMap<NodeId, SocketAddr>, ServerError> {
    raw.iter()
        .map(|(id_str, addr_str)| {
            let id: u64 = id_str
                .parse()
                .map_err(|_| ServerError::Config(format!("invalid peer id: {id_str}")))?;
            let addr: SocketAddr = addr_str.parse().map_err(|e| {
                ServerError::Config(format!("invalid peer addr '{addr_str}': {e}"))
            })?;
            Ok((NodeId::from(id), addr))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_peers_accepts_id_addr_pairs() {
        let raw: HashMap<String, String> = [
            ("2".to_string(), "127.0.0.1:7002".to_string()),
            ("3".to_string(), "127.0.0.1:7003".to_string()),
        ]
        .into();

        let peers = parse_peers(&raw).unwrap();

        assert_eq!(peers.len(), 2);
        assert_eq!(
            peers.get(&NodeId::from(3)),
            Some(&"127.0.0.1:7003".parse().unwrap())
        );
    }

    #[test]
    fn parse_peers_rejects_bad_id() {
        let raw: HashMap<String, String> = [("two".to_string(), "127.0.0.1:7002".to_string())].into();

        assert!(matches!(parse_peers(&raw), Err(ServerError::Config(_))));
    }

    #[test]
    fn start_rejects_self_as_peer() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::new(1, "127.0.0.1:0", dir.path());
        config
            .peers
            .insert("1".to_string(), "127.0.0.1:7001".to_string());

        assert!(matches!(Server::start(config), Err(ServerError::Membership(_))));
    }

    #[test]
    fn start_rejects_unsafe_lease() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::new(1, "127.0.0.1:0", dir.path());
        config.timers.lease_duration = Duration::from_secs(10);

        assert!(matches!(
            Server::start(config),
            Err(ServerError::Timers(TimerConfigError::LeaseTooLong { .. }))
        ));
    }

    #[test]
    fn single_node_serves_status() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::start(Config::new(1, "127.0.0.1:0", dir.path())).unwrap();

        let status = NodeStatus::of(&server.runtime).unwrap();

        assert_eq!(status.id, NodeId::from(1));
        assert_eq!(status.role, "follower");
        assert_ne!(server.raft_addr().port(), 0);
    }
}
