//! `AtomicValueClient`: get / set / compare-and-set against a cluster over HTTP.
//!
//! Mutations carry the client's session tag and keep it across retries, so a
//! command that times out and is resent applies at most once. A mutation that
//! fails with `NoLeaderAvailable` may still land; it is resent under its own tag
//! before the next mutation goes out, so the session never skips a sequence
//! number.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::primitive::{ClientReply, ClientRequest, NodeStatus};
use crate::session::{Session, SessionTag};
use crate::types::NodeId;
use crate::value::{ValueCommand, ValueResult};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("no leader available within the retry window")]
    NoLeaderAvailable,
    #[error("out-of-order session command: expected sequence {expected}, got {received}")]
    OutOfOrderSession { expected: u64, received: u64 },
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),
    #[error("unexpected result for {operation}: {result:?}")]
    UnexpectedResult {
        operation: &'static str,
        result: ValueResult,
    },
    #[error("no nodes configured")]
    NoNodes,
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// How long a call keeps retrying before giving up with `NoLeaderAvailable`.
    pub retry_window: Duration,
    /// Deadline for a single HTTP exchange.
    pub request_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            retry_window: Duration::from_secs(5),
            request_timeout: Duration::from_secs(3),
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(500),
        }
    }
}

pub struct AtomicValueClient {
    http: reqwest::Client,
    /// Node id and base URL, e.g. `http://127.0.0.1:8001`.
    nodes: Vec<(NodeId, String)>,
    leader: Option<usize>,
    next_node: usize,
    session: Session,
    /// Mutation whose outcome is unknown, resent before the next one.
    unacknowledged: Option<ClientRequest>,
    config: ClientConfig,
}

impl AtomicValueClient {
    pub fn new(
        nodes: impl IntoIterator<Item = (NodeId, String)>,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        let mut nodes: Vec<(NodeId, String)> = nodes
            .into_iter()
            .map(|(id, url)| (id, url.trim_end_matches('/').to_string()))
            .collect();
        if nodes.is_empty() {
            return Err(ClientError::NoNodes);
        }
        nodes.sort_by_key(|(id, _)| *id);

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            http,
            nodes,
            leader: None,
            next_node: 0,
            session: Session::random(),
            unacknowledged: None,
            config,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Session tag the next new mutation will carry.
    pub fn peek_tag(&self) -> SessionTag {
        let mut session = self.session.clone();
        session.next_tag()
    }

    /// Tag of an earlier mutation that failed without an answer and will be
    /// resent first.
    pub fn unacknowledged_tag(&self) -> Option<SessionTag> {
        self.unacknowledged.as_ref().and_then(|request| request.session)
    }

    /// Current value of `primitive`, `None` if it was never set.
    pub async fn get(&mut self, primitive: &str) -> Result<Option<Vec<u8>>, ClientError> {
        let mut request = ClientRequest {
            primitive: primitive.to_string(),
            command: ValueCommand::Get,
            session: None,
        };
        match self.execute(&mut request).await? {
            ValueResult::Value { value } => Ok(value),
            result => Err(ClientError::UnexpectedResult {
                operation: "get",
                result,
            }),
        }
    }

    /// Replace the value, returning the previous one.
    pub async fn set(
        &mut self,
        primitive: &str,
        value: impl Into<Vec<u8>>,
    ) -> Result<Option<Vec<u8>>, ClientError> {
        let command = ValueCommand::Set {
            value: value.into(),
        };
        match self.execute_in_session(primitive, command).await? {
            ValueResult::Previous { value } => Ok(value),
            result => Err(ClientError::UnexpectedResult {
                operation: "set",
                result,
            }),
        }
    }

    /// Replace the value with `update` if it currently equals `expected`
    /// (`None` meaning unset). Returns whether the swap happened.
    pub async fn compare_and_set(
        &mut self,
        primitive: &str,
        expected: Option<&[u8]>,
        update: impl Into<Vec<u8>>,
    ) -> Result<bool, ClientError> {
        let command = ValueCommand::CompareAndSet {
            expected: expected.map(<[u8]>::to_vec),
            update: update.into(),
        };
        match self.execute_in_session(primitive, command).await? {
            ValueResult::CompareAndSet { swapped, .. } => Ok(swapped),
            result => Err(ClientError::UnexpectedResult {
                operation: "compareAndSet",
                result,
            }),
        }
    }

    /// Status of one node, without retries.
    pub async fn status(&self, node: NodeId) -> Result<NodeStatus, ClientError> {
        let (_, base) = self
            .nodes
            .iter()
            .find(|(id, _)| *id == node)
            .ok_or(ClientError::UnknownNode(node))?;
        Ok(self
            .http
            .get(format!("{base}/v1/status"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    async fn execute_in_session(
        &mut self,
        primitive: &str,
        command: ValueCommand,
    ) -> Result<ValueResult, ClientError> {
        if let Some(mut earlier) = self.unacknowledged.take() {
            debug!(tag = ?earlier.session, "resending unacknowledged command");
            self.execute_tracked(&mut earlier).await?;
        }

        let mut request = ClientRequest {
            primitive: primitive.to_string(),
            command,
            session: Some(self.session.next_tag()),
        };
        self.execute_tracked(&mut request).await
    }

    /// Like `execute`, but a request that runs out of retries is kept for resending.
    async fn execute_tracked(
        &mut self,
        request: &mut ClientRequest,
    ) -> Result<ValueResult, ClientError> {
        let result = self.execute(request).await;
        if matches!(result, Err(ClientError::NoLeaderAvailable)) {
            self.unacknowledged = Some(request.clone());
        }
        result
    }

    /// Send `request` until it is answered, following leader hints and backing off
    /// between rounds. The session tag never changes across attempts, except for
    /// one restart at sequence 1 when the cluster has forgotten the session.
    async fn execute(&mut self, request: &mut ClientRequest) -> Result<ValueResult, ClientError> {
        let deadline = Instant::now() + self.config.retry_window;
        let mut backoff = self.config.initial_backoff;
        let mut restarted = false;

        loop {
            if Instant::now() >= deadline {
                return Err(ClientError::NoLeaderAvailable);
            }
            let target = self.target();
            match self.send(target, request).await {
                Ok(ClientReply::Ok { result }) => {
                    self.leader = Some(target);
                    return Ok(result);
                }
                Ok(ClientReply::NotLeader { leader_hint }) => {
                    let hinted = leader_hint.and_then(|id| self.index_of(id));
                    match hinted {
                        Some(index) if index != target => {
                            debug!(from = %self.nodes[target].0, to = ?leader_hint, "following leader hint");
                            self.leader = Some(index);
                            continue;
                        }
                        _ => self.rotate(target),
                    }
                }
                Ok(ClientReply::OutOfOrder { expected, received }) => {
                    if expected == 1 && !restarted {
                        let tag = self.session.restart();
                        debug!(session = %tag.session_id, "session expired on the cluster, restarting");
                        request.session = Some(tag);
                        restarted = true;
                        continue;
                    }
                    return Err(ClientError::OutOfOrderSession { expected, received });
                }
                Ok(ClientReply::Timeout) => {
                    debug!(node = %self.nodes[target].0, "command timed out, retrying");
                    self.rotate(target);
                }
                Err(e) => {
                    debug!(node = %self.nodes[target].0, error = %e, "request failed, trying another node");
                    self.rotate(target);
                }
            }

            if Instant::now() + backoff > deadline {
                return Err(ClientError::NoLeaderAvailable);
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.config.max_backoff);
        }
    }

    async fn send(&self, target: usize, request: &ClientRequest) -> Result<ClientReply, ClientError> {
        let (_, base) = &self.nodes[target];
        // Every reply carries a ClientReply body, whatever the status code.
        Ok(self
            .http
            .post(format!("{base}/v1/command"))
            .json(request)
            .send()
            .await?
            .json()
            .await?)
    }

    fn target(&self) -> usize {
        self.leader.unwrap_or(self.next_node)
    }

    fn rotate(&mut self, failed: usize) {
        self.leader = None;
        self.next_node = (failed + 1) % self.nodes.len();
    }

    fn index_of(&self, id: NodeId) -> Option<usize> {
        self.nodes.iter().position(|(node, _)| *node == id)
    }
}
