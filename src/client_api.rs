use std::io;
use std::net::SocketAddr;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::primitive::{ClientReply, ClientRequest, NodeStatus};

/// A request forwarded from the HTTP API to the consensus event loop.
pub enum ApiRequest {
    Command {
        request: ClientRequest,
        reply: oneshot::Sender<ClientReply>,
    },
    Status {
        reply: oneshot::Sender<NodeStatus>,
    },
}

#[derive(Clone)]
struct ApiState {
    tx: mpsc::Sender<ApiRequest>,
    request_timeout: Duration,
}

/// Bind `addr` and serve the client API from a background thread with its own
/// tokio runtime. Requests are forwarded to the event loop via `tx`. Returns the
/// bound address.
pub fn start(
    addr: SocketAddr,
    tx: mpsc::Sender<ApiRequest>,
    request_timeout: Duration,
) -> io::Result<SocketAddr> {
    let listener = std::net::TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    let local_addr = listener.local_addr()?;
    let state = ApiState {
        tx,
        request_timeout,
    };

    thread::Builder::new()
        .name("client-api".to_string())
        .spawn(move || {
            match tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
            {
                Ok(rt) => rt.block_on(serve(listener, state)),
                Err(e) => error!(error = %e, "client api: failed to start tokio runtime"),
            }
        })?;

    Ok(local_addr)
}

pub fn router(tx: mpsc::Sender<ApiRequest>, request_timeout: Duration) -> Router {
    Router::new()
        .route("/v1/command", post(handle_command))
        .route("/v1/status", get(handle_status))
        .with_state(ApiState {
            tx,
            request_timeout,
        })
}

async fn serve(listener: std::net::TcpListener, state: ApiState) {
    let listener = match tokio::net::TcpListener::from_std(listener) {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "client api: failed to register listener");
            return;
        }
    };
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "client api listening");
    }

    let app = router(state.tx, state.request_timeout);
    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "client api: server error");
    }
}

/// Forward a command to the event loop and wait for its reply. Replies always
/// carry a `ClientReply` body; the status code mirrors it.
async fn handle_command(
    State(state): State<ApiState>,
    Json(request): Json<ClientRequest>,
) -> (StatusCode, Json<ClientReply>) {
    let (reply_tx, reply_rx) = oneshot::channel();

    if state
        .tx
        .send(ApiRequest::Command {
            request,
            reply: reply_tx,
        })
        .is_err()
    {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(ClientReply::Timeout));
    }

    let reply = match tokio::time::timeout(state.request_timeout, reply_rx).await {
        Ok(Ok(reply)) => reply,
        Ok(Err(_)) | Err(_) => ClientReply::Timeout,
    };
    (status_for(&reply), Json(reply))
}

async fn handle_status(State(state): State<ApiState>) -> Result<Json<NodeStatus>, StatusCode> {
    let (reply_tx, reply_rx) = oneshot::channel();
    state
        .tx
        .send(ApiRequest::Status { reply: reply_tx })
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;

    match tokio::time::timeout(state.request_timeout, reply_rx).await {
        Ok(Ok(status)) => Ok(Json(status)),
        Ok(Err(_)) | Err(_) => Err(StatusCode::SERVICE_UNAVAILABLE),
    }
}

fn status_for(reply: &ClientReply) -> StatusCode {
    match reply {
        ClientReply::Ok { .. } => StatusCode::OK,
        ClientReply::NotLeader { .. } => StatusCode::MISDIRECTED_REQUEST,
        ClientReply::OutOfOrder { .. } => StatusCode::CONFLICT,
        ClientReply::Timeout => StatusCode::GATEWAY_TIMEOUT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeId;

    #[test]
    fn status_codes_follow_reply() {
        assert_eq!(status_for(&ClientReply::Timeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            status_for(&ClientReply::NotLeader {
                leader_hint: Some(NodeId::from(1))
            }),
            StatusCode::MISDIRECTED_REQUEST
        );
        assert_eq!(
            status_for(&ClientReply::OutOfOrder {
                expected: 1,
                received: 4
            }),
            StatusCode::CONFLICT
        );
    }

    #[tokio::test]
    async fn command_times_out_when_loop_does_not_answer() {
        let (tx, rx) = mpsc::channel();
        let state = ApiState {
            tx,
            request_timeout: Duration::from_millis(20),
        };

        let request = ClientRequest {
            primitive: "x".to_string(),
            command: crate::value::ValueCommand::Get,
            session: None,
        };
        let (status, Json(reply)) = handle_command(State(state), Json(request)).await;

        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(reply, ClientReply::Timeout);
        // The request reached the loop side even though nobody answered.
        assert!(matches!(rx.try_recv(), Ok(ApiRequest::Command { .. })));
    }
}
