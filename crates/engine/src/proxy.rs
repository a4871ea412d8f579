//! Server proxy: the concurrent, bidirectional bridge to the control plane.
//!
//! Outbound requests flow through a priority queue drained by a single
//! sender task, which also emits the periodic heartbeat. Inbound messages
//! arrive on the persistent stream owned by the listener task.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::Method;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::error::ProxyError;
use crate::listener::listener_loop;
use crate::message::{Message, MessageQueue};
use crate::observers::ObserverRegistry;
use crate::rest::{ApiContext, ApplicationApi, JobApi, ResourceApi, RunnerApi, check};
use fluxrun_core::config::ServerProxyConfig;

pub(crate) const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const OFFLINE_REPORT_TIMEOUT: Duration = Duration::from_secs(5);

/// Runner presence states reported to the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerState {
    Idle,
    Busy,
    Offline,
}

/// Completion handle for a correlated request; resolves exactly once with
/// the decoded server response or the send failure.
pub struct ResponseFuture {
    rx: oneshot::Receiver<Result<Value, ProxyError>>,
}

impl ResponseFuture {
    pub async fn wait(self) -> Result<Value, ProxyError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(ProxyError::ChannelClosed),
        }
    }
}

pub(crate) struct ProxyShared {
    pub(crate) http: reqwest::Client,
    pub(crate) base: Url,
    pub(crate) name: String,
    pub(crate) id: Uuid,
    pub(crate) token: Uuid,
    pub(crate) report_interval: Duration,
    pub(crate) queue: MessageQueue,
    pub(crate) wake: Notify,
    pub(crate) pending: Mutex<HashMap<Uuid, oneshot::Sender<Result<Value, ProxyError>>>>,
    pub(crate) observers: ObserverRegistry,
    running: AtomicBool,
}

impl ProxyShared {
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    fn api_context(&self) -> ApiContext {
        ApiContext {
            http: self.http.clone(),
            base: self.base.clone(),
            id: self.id,
            token: self.token,
        }
    }

    fn message_url(&self, message: &Message) -> Result<Url, ProxyError> {
        let mut url = self.base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|()| ProxyError::InvalidEndpoint(message.endpoint.clone()))?;
            path.pop_if_empty();
            path.extend(message.endpoint.split('/').filter(|s| !s.is_empty()));
            path.push(&self.id.to_string());
        }
        for (key, value) in &message.params {
            url.query_pairs_mut().append_pair(key, value);
        }
        Ok(url)
    }

    /// Issue one outbound message and decode the response body.
    pub(crate) async fn send_message(&self, message: &Message) -> Result<Value, ProxyError> {
        let url = self.message_url(message)?;
        debug!(method = %message.method, %url, "sending message {}", message.id);

        let mut request = self
            .http
            .request(message.method.clone(), url)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Token {}", self.token),
            )
            .header("id", self.id.to_string())
            .header("token", self.token.to_string())
            .timeout(message.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT));
        for (key, value) in &message.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        // The file reference wins over a structured body.
        if let Some(path) = &message.file {
            let bytes = tokio::fs::read(path).await.map_err(|source| {
                if source.kind() == std::io::ErrorKind::NotFound {
                    ProxyError::PayloadMissing(path.clone())
                } else {
                    ProxyError::PayloadRead {
                        path: path.clone(),
                        source,
                    }
                }
            })?;
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(bytes);
        } else if let Some(body) = &message.body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let bytes = check(response).await?.bytes().await?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Send a message and resolve its registered response future, if any.
    /// The future entry is removed exactly once regardless of outcome.
    async fn dispatch_message(&self, message: Message) {
        let id = message.id;
        let result = self.send_message(&message).await;
        let waiter = self.pending.lock().remove(&id);
        match (waiter, result) {
            (Some(tx), result) => {
                let _ = tx.send(result);
            }
            (None, Err(err)) => {
                warn!("failed to send message {id} to {}: {err:#}", message.endpoint);
            }
            (None, Ok(_)) => {}
        }
    }

    pub(crate) async fn report_status(
        &self,
        state: RunnerState,
        timeout: Option<Duration>,
    ) -> Result<Value, ProxyError> {
        debug!(?state, "reporting runner status");
        let mut message = Message::json(
            "runner_manager/report_status",
            Method::PATCH,
            Some(json!({ "id": self.id, "token": self.token, "state": state })),
        );
        if let Some(timeout) = timeout {
            message = message.with_timeout(timeout);
        }
        self.send_message(&message).await
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

/// One dedicated worker drains the queue in priority order and keeps the
/// heartbeat cadence. The next deadline is always rescheduled from the
/// current time, so slow sends do not accumulate drift.
async fn sender_loop(shared: Arc<ProxyShared>) {
    let mut next_heartbeat = tokio::time::Instant::now() + shared.report_interval;
    while shared.is_running() {
        while let Some(message) = shared.queue.pop() {
            shared.dispatch_message(message).await;
        }

        tokio::select! {
            () = shared.wake.notified() => {}
            () = tokio::time::sleep_until(next_heartbeat) => {
                if let Err(err) = shared.report_status(RunnerState::Idle, None).await {
                    warn!("heartbeat failed: {err:#}");
                }
                next_heartbeat = tokio::time::Instant::now() + shared.report_interval;
            }
        }
    }
}

/// Handle to the control plane connection.
pub struct ServerProxy {
    pub(crate) shared: Arc<ProxyShared>,
    sender: JoinHandle<()>,
    listener: JoinHandle<()>,
}

impl ServerProxy {
    /// Register presence with the control plane and start the sender and
    /// listener tasks. An unreachable control plane is fatal here.
    pub async fn connect(config: &ServerProxyConfig) -> Result<Self, ProxyError> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()?;

        let mut base = config.api_url.clone();
        base.set_port(Some(config.api_port))
            .map_err(|()| ProxyError::InvalidEndpoint(config.api_url.to_string()))?;

        let shared = Arc::new(ProxyShared {
            http,
            base,
            name: config.name.clone(),
            id: config.id,
            token: config.token,
            report_interval: Duration::from_secs(config.report_interval),
            queue: MessageQueue::default(),
            wake: Notify::new(),
            pending: Mutex::new(HashMap::new()),
            observers: ObserverRegistry::default(),
            running: AtomicBool::new(true),
        });

        info!("contacting {}", shared.base);
        shared.report_status(RunnerState::Idle, None).await?;

        let sender = tokio::spawn(sender_loop(shared.clone()));
        let listener = tokio::spawn(listener_loop(shared.clone()));
        Ok(Self {
            shared,
            sender,
            listener,
        })
    }

    /// Queue an outbound message; never blocks.
    pub fn push_message(&self, message: Message) {
        self.shared.queue.push(message);
        self.shared.wake.notify_one();
    }

    /// Queue an outbound message and obtain a future for the correlated
    /// response.
    pub fn push_with_response(&self, message: Message) -> ResponseFuture {
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(message.id(), tx);
        self.push_message(message);
        ResponseFuture { rx }
    }

    pub fn observers(&self) -> &ObserverRegistry {
        &self.shared.observers
    }

    pub fn runner_id(&self) -> Uuid {
        self.shared.id
    }

    pub fn runner_name(&self) -> &str {
        &self.shared.name
    }

    pub fn runner_api(&self) -> RunnerApi {
        RunnerApi::new(self.shared.api_context())
    }

    pub fn job_api(&self) -> JobApi {
        JobApi::new(self.shared.api_context())
    }

    pub fn application_api(&self) -> ApplicationApi {
        ApplicationApi::new(self.shared.api_context())
    }

    pub fn resource_api(&self) -> ResourceApi {
        ResourceApi::new(self.shared.api_context())
    }

    /// Best-effort terminal notification for process teardown; never blocks
    /// shutdown on failure.
    pub async fn report_offline(&self) {
        match self
            .shared
            .report_status(RunnerState::Offline, Some(OFFLINE_REPORT_TIMEOUT))
            .await
        {
            Ok(_) => info!("reported offline status"),
            Err(err) => warn!("failed to report offline status: {err:#}"),
        }
    }

    /// Stop the sender and listener tasks.
    pub fn shutdown(&self) {
        self.shared.stop();
        self.sender.abort();
        self.listener.abort();
    }
}

#[cfg(test)]
#[path = "proxy_tests.rs"]
mod tests;
