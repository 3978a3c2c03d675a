//! Poll loop driving a [`MessageHandler`].
//!
//! A session starts with registration and ends on shutdown or eviction. In
//! between the agent pulls its inbox, downloads each payload, hands it to the
//! handler, pushes the reply with its objects, and confirms the message.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_id::MessageId;
use fleet_proto::{Message, Node, ObjectTree, PushStatus};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::client::{ClientError, FleetClient};
use crate::config::Config;
use crate::heartbeat::{run_heartbeat_loop, HeartbeatOutcome};
use crate::payload::{pull_payload, push_payload, Payload};
use crate::retry::RetryPolicy;

/// Result a handler sends back to the message's source.
#[derive(Debug, Clone)]
pub struct Reply {
    pub message_type: String,
    pub payload: Payload,

    /// Time to live in seconds; `None` uses the coordinator default.
    pub ttl: Option<f64>,
}

impl Reply {
    pub fn new(message_type: impl Into<String>, payload: Payload) -> Self {
        Self {
            message_type: message_type.into(),
            payload,
            ttl: None,
        }
    }
}

/// Application logic run for each delivered message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handles one message. `Ok(None)` means no reply.
    async fn handle(&self, message: &Message, payload: &Payload) -> anyhow::Result<Option<Reply>>;
}

/// Outcome of a single poll.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollReport {
    /// Messages confirmed during this poll.
    pub processed: usize,

    /// Coordinator's advice on when to poll next.
    pub reconnect: Option<Duration>,
}

enum SessionEnd {
    Shutdown,
    Expired,
}

/// Reference node agent.
pub struct Agent {
    config: Config,
    client: FleetClient,
    handler: Arc<dyn MessageHandler>,
    retry: RetryPolicy,
}

impl Agent {
    pub fn new(config: Config, client: FleetClient, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            config,
            client,
            handler,
            retry: RetryPolicy::bounded(5),
        }
    }

    /// Overrides the policy used for individual calls within a poll.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Registers a fresh identity, retrying until the coordinator answers.
    pub async fn register(&self) -> Result<Node, ClientError> {
        RetryPolicy::default()
            .run("create-node", || {
                self.client.create_node(self.config.heartbeat_interval)
            })
            .await
    }

    /// Runs sessions until shutdown, registering again after each eviction.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ClientError> {
        info!(
            coordinator_url = %self.config.coordinator_url,
            poll_interval_secs = self.config.poll_interval.as_secs_f64(),
            "Starting node agent"
        );

        loop {
            let node = tokio::select! {
                node = self.register() => node?,
                _ = shutdown_requested(&mut shutdown) => return Ok(()),
            };
            info!(node_id = %node.node_id, "Registered with coordinator");

            match self.session(node, &mut shutdown).await {
                SessionEnd::Shutdown => {
                    if let Err(e) = self.client.delete_node(node).await {
                        warn!(node_id = %node.node_id, error = %e, "Failed to delete node");
                    } else {
                        info!(node_id = %node.node_id, "Node deleted");
                    }
                    return Ok(());
                }
                SessionEnd::Expired => {
                    warn!(node_id = %node.node_id, "Node expired, registering again");
                }
            }
        }
    }

    async fn session(&self, node: Node, shutdown: &mut watch::Receiver<bool>) -> SessionEnd {
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut heartbeat = tokio::spawn(run_heartbeat_loop(
            self.client.clone(),
            node,
            self.config.heartbeat_interval,
            stop_rx,
        ));

        let mut wait = Duration::ZERO;
        let mut failures = 0u32;

        let end = loop {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                outcome = &mut heartbeat => {
                    match outcome {
                        Ok(HeartbeatOutcome::Shutdown) => break SessionEnd::Shutdown,
                        Ok(HeartbeatOutcome::Expired) => break SessionEnd::Expired,
                        Err(e) => {
                            error!(error = %e, "Heartbeat task failed");
                            break SessionEnd::Expired;
                        }
                    }
                }
                _ = shutdown_requested(shutdown) => break SessionEnd::Shutdown,
            }

            match self.poll_once(node).await {
                Ok(report) => {
                    failures = 0;
                    wait = match report.reconnect {
                        Some(advice) => advice,
                        None if report.processed > 0 => Duration::ZERO,
                        None => self.config.poll_interval,
                    };
                    if report.processed > 0 {
                        debug!(processed = report.processed, "Poll complete");
                    }
                }
                Err(ClientError::NodeExpired(_)) => break SessionEnd::Expired,
                Err(e) if e.is_transient() => {
                    wait = self.retry.delay(failures).max(self.config.poll_interval);
                    failures = failures.saturating_add(1);
                    warn!(error = %e, failures, "Poll failed, will retry");
                }
                Err(e) => {
                    wait = self.config.poll_interval;
                    error!(error = %e, "Poll failed");
                }
            }
        };

        let _ = stop_tx.send(true);
        heartbeat.abort();
        end
    }

    /// Pulls the inbox once and processes everything delivered.
    ///
    /// Messages left unconfirmed after a transient failure are delivered
    /// again on a later poll.
    pub async fn poll_once(&self, node: Node) -> Result<PollReport, ClientError> {
        let resp = self.client.pull_messages(node, Vec::new()).await?;
        let reconnect = resp
            .reconnect
            .and_then(|r| Duration::try_from_secs_f64(r.reconnect_after_secs).ok());

        let mut processed = 0;
        for (message, tree) in resp.messages.iter().zip(&resp.message_object_trees) {
            self.process(node, message, tree).await?;
            processed += 1;
        }

        Ok(PollReport {
            processed,
            reconnect,
        })
    }

    async fn process(
        &self,
        node: Node,
        message: &Message,
        tree: &ObjectTree,
    ) -> Result<(), ClientError> {
        let message_id = message.message_id;
        debug!(%message_id, message_type = %message.message_type, "Processing message");

        let payload = match pull_payload(&self.client, &self.retry, node, message.run_id, tree).await
        {
            Ok(payload) => Some(payload),
            Err(
                e @ (ClientError::NotFound(_)
                | ClientError::PermissionDenied(_)
                | ClientError::Corrupt(_)),
            ) => {
                warn!(%message_id, error = %e, "Dropping message with unusable payload");
                None
            }
            Err(e) => return Err(e),
        };

        if let Some(payload) = payload {
            match self.handler.handle(message, &payload).await {
                Ok(Some(reply)) => match self.send_reply(node, message, reply).await {
                    Ok(()) => {}
                    Err(e) if e.is_transient() || matches!(e, ClientError::NodeExpired(_)) => {
                        return Err(e)
                    }
                    // Redelivery would produce the same reply again.
                    Err(e) => warn!(%message_id, error = %e, "Dropping reply that cannot be sent"),
                },
                Ok(None) => {}
                Err(e) => warn!(%message_id, error = %e, "Handler failed"),
            }
        }

        self.retry
            .run("confirm-message-received", || {
                self.client.confirm_message_received(node, message_id)
            })
            .await
            .or_else(|e| match e {
                // Already expired or confirmed elsewhere.
                ClientError::NotFound(_) => Ok(()),
                e => Err(e),
            })
    }

    async fn send_reply(
        &self,
        node: Node,
        message: &Message,
        reply: Reply,
    ) -> Result<(), ClientError> {
        let out = Message {
            message_id: MessageId::new(),
            run_id: message.run_id,
            src_node_id: node.node_id,
            dst_node_id: message.src_node_id,
            message_type: reply.message_type,
            reply_to_message_id: Some(message.message_id),
            group_id: message.group_id.clone(),
            created_at: None,
            ttl: reply.ttl,
        };
        let out_id = out.message_id;

        let resp = self
            .retry
            .run("push-messages", || {
                self.client
                    .push_messages(node, vec![out.clone()], vec![reply.payload.tree.clone()])
            })
            .await?;

        let status = resp
            .results
            .get(&out_id)
            .copied()
            .unwrap_or(PushStatus::RejectedMalformed);
        if !status.is_accepted() {
            warn!(message_id = %out_id, status = status.as_str(), "Reply rejected");
            return Ok(());
        }

        push_payload(
            &self.client,
            &self.retry,
            node,
            message.run_id,
            &reply.payload,
            &resp.objects_to_push,
            self.config.chunk_bytes,
        )
        .await?;

        debug!(message_id = %out_id, objects = resp.objects_to_push.len(), "Reply sent");
        Ok(())
    }
}

/// Resolves once shutdown is signalled or the sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
