//! Persistent stream listener: maintains the WebSocket connection to the
//! control plane, dispatches typed frames to observers, and writes replies.
//!
//! Every write to the stream happens on this task, so replies never race
//! with each other.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::observers::{Frame, ObserverRegistry};
use crate::proxy::ProxyShared;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub(crate) async fn listener_loop(shared: Arc<ProxyShared>) {
    while shared.is_running() {
        match connect_stream(&shared).await {
            Ok(stream) => {
                info!("stream connected");
                run_connection(&shared, stream).await;
                info!("stream disconnected");
            }
            Err(err) => warn!("stream connection failed: {err:#}"),
        }
        if !shared.is_running() {
            break;
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

fn stream_url(shared: &ProxyShared) -> anyhow::Result<Url> {
    let mut url = shared.base.clone();
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => anyhow::bail!("cannot derive a stream scheme from {other:?}"),
    };
    url.set_scheme(scheme)
        .map_err(|()| anyhow::anyhow!("cannot apply scheme {scheme} to {}", shared.base))?;
    url.set_path(&format!("/ws/runner_manager/{}", shared.id));
    url.set_query(None);
    Ok(url)
}

async fn connect_stream(shared: &ProxyShared) -> anyhow::Result<WsStream> {
    let url = stream_url(shared)?;
    debug!("connecting stream to {url}");
    let mut request = url.as_str().into_client_request()?;
    request
        .headers_mut()
        .insert("token", shared.token.to_string().parse()?);
    let (stream, _) = tokio_tungstenite::connect_async(request).await?;
    Ok(stream)
}

async fn run_connection(shared: &ProxyShared, mut stream: WsStream) {
    while shared.is_running() {
        match stream.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                let Some(reply) = dispatch_frame(&shared.observers, text.as_str()) else {
                    continue;
                };
                if let Err(err) = stream.send(WsMessage::text(reply.to_string())).await {
                    warn!("failed to send stream reply: {err:#}");
                    break;
                }
            }
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(_)) => {} // ping/pong/binary
            Some(Err(err)) => {
                warn!("stream read failed: {err:#}");
                break;
            }
        }
    }
}

/// Handle one inbound frame and produce the reply to write back, if any.
///
/// Frames without an `id` are dropped: there is no recipient to reply to.
/// Every other frame gets exactly one reply carrying `response_to`.
pub(crate) fn dispatch_frame(observers: &ObserverRegistry, text: &str) -> Option<Value> {
    let Some(frame) = Frame::parse(text) else {
        warn!("dropping undecodable stream frame");
        return None;
    };
    let Some(id) = frame.id.clone() else {
        warn!("dropping stream frame without an id");
        return None;
    };
    let Some(kind) = frame.kind.clone() else {
        return Some(error_reply(&id, "frame is missing the 'type' field"));
    };

    debug!("dispatching '{kind}' frame {id}");
    match observers.notify(&kind, &frame) {
        None => Some(error_reply(
            &id,
            &format!("no observer registered for message type '{kind}'"),
        )),
        Some(Ok(Some(value))) => Some(merge_reply(value, &id)),
        Some(Ok(None)) => Some(json!({ "type": "success", "response_to": id })),
        Some(Err(err)) => {
            error!("observer for '{kind}' failed: {err:#}");
            Some(error_reply(&id, &format!("{err:#}")))
        }
    }
}

fn error_reply(id: &str, message: &str) -> Value {
    json!({ "type": "error", "response_to": id, "data": message })
}

fn merge_reply(value: Value, id: &str) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert("response_to".to_string(), json!(id));
            Value::Object(object)
        }
        other => json!({ "type": "success", "response_to": id, "data": other }),
    }
}

#[cfg(test)]
#[path = "listener_tests.rs"]
mod tests;
