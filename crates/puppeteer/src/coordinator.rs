//! Coordinator protocol handler
//!
//! Turns requests into queue and registry operations. Unary calls return a
//! single [`Response`]; streaming calls push items into a [`PeerSink`] until
//! the peer goes away, the call is cancelled, or the broker fails.

use crate::{CoordinatorConfig, CoordinatorError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use puppeteer_broker::{AgentRegistry, BrokerError, SharedBroker, WorkQueues};
use puppeteer_proto::{ChannelSender, Command, CommandResult, FileTransfer, Message, Ping, Request, Response};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The open channel to a remote peer that stream items are written to
#[async_trait]
pub trait PeerSink: Send {
    /// Deliver one item; an error means the peer is gone
    async fn send(&mut self, response: Response) -> Result<()>;
}

#[async_trait]
impl<S> PeerSink for ChannelSender<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, response: Response) -> Result<()> {
        ChannelSender::send(self, &Message::response(response)).await?;
        Ok(())
    }
}

#[async_trait]
impl PeerSink for mpsc::Sender<Response> {
    async fn send(&mut self, response: Response) -> Result<()> {
        mpsc::Sender::send(self, response)
            .await
            .map_err(|_| CoordinatorError::Transport("peer receiver dropped".to_string()))
    }
}

/// Cancellation shared by every open stream of one agent
struct AgentStreams {
    generation: Uuid,
    token: CancellationToken,
    open: usize,
    commands: usize,
}

type AgentTable = Arc<Mutex<HashMap<String, AgentStreams>>>;

fn lock_agents(agents: &AgentTable) -> MutexGuard<'_, HashMap<String, AgentStreams>> {
    match agents.lock() {
        Ok(agents) => agents,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Keeps an agent's stream counts accurate however the stream ends
struct StreamGuard {
    agents: AgentTable,
    agent: String,
    generation: Uuid,
    token: CancellationToken,
    command: bool,
}

impl StreamGuard {
    /// Close this command stream's slot and report whether another command
    /// stream for the same agent is still open
    fn release_command(&mut self) -> bool {
        let mut agents = lock_agents(&self.agents);
        if !std::mem::take(&mut self.command) {
            return false;
        }
        let Some(streams) = agents.get_mut(&self.agent) else {
            return false;
        };
        if streams.generation == self.generation {
            streams.commands = streams.commands.saturating_sub(1);
        }
        streams.commands > 0
    }

    /// Resolve when this stream is cancelled, either through its agent or
    /// through the call that opened it
    async fn cancelled(&self, call: &CancellationToken) {
        tokio::select! {
            _ = self.token.cancelled() => {}
            _ = call.cancelled() => {}
        }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let mut agents = lock_agents(&self.agents);
        if let Some(streams) = agents.get_mut(&self.agent) {
            // The entry may have been replaced after an eviction
            if streams.generation != self.generation {
                return;
            }
            streams.open = streams.open.saturating_sub(1);
            if self.command {
                streams.commands = streams.commands.saturating_sub(1);
            }
            if streams.open == 0 {
                agents.remove(&self.agent);
            }
        }
    }
}

struct Inner {
    queues: WorkQueues,
    registry: AgentRegistry,
    config: CoordinatorConfig,
    shutdown: CancellationToken,
    agents: AgentTable,
}

/// Protocol handler shared by every connection
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(CoordinatorError::InvalidRequest(format!("{} must not be empty", field)));
    }
    Ok(())
}

impl Coordinator {
    /// Create a coordinator over a shared broker
    pub fn new(broker: SharedBroker, config: CoordinatorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                queues: WorkQueues::new(broker.clone()),
                registry: AgentRegistry::new(broker),
                config,
                shutdown: CancellationToken::new(),
                agents: Arc::new(Mutex::new(HashMap::new())),
            }),
        }
    }

    /// Coordinator configuration
    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Token cancelled when the coordinator shuts down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Cancel every in-flight call and stream
    pub fn shutdown(&self) {
        info!("Coordinator shutting down");
        self.inner.shutdown.cancel();
    }

    /// Number of open streams for an agent
    pub fn open_streams(&self, agent: &str) -> usize {
        lock_agents(&self.inner.agents)
            .get(agent)
            .map_or(0, |streams| streams.open)
    }

    /// Number of open command streams for an agent
    pub fn open_command_streams(&self, agent: &str) -> usize {
        lock_agents(&self.inner.agents)
            .get(agent)
            .map_or(0, |streams| streams.commands)
    }

    fn open_stream(&self, agent: &str, command: bool) -> StreamGuard {
        let mut agents = lock_agents(&self.inner.agents);
        let streams = agents.entry(agent.to_string()).or_insert_with(|| AgentStreams {
            generation: Uuid::new_v4(),
            token: self.inner.shutdown.child_token(),
            open: 0,
            commands: 0,
        });
        streams.open += 1;
        if command {
            streams.commands += 1;
        }
        StreamGuard {
            agents: self.inner.agents.clone(),
            agent: agent.to_string(),
            generation: streams.generation,
            token: streams.token.child_token(),
            command,
        }
    }

    /// Serve one request, writing replies or stream items to `sink`
    pub async fn dispatch<P>(&self, request: Request, sink: &mut P, call: CancellationToken) -> Result<()>
    where
        P: PeerSink + ?Sized,
    {
        debug!("Dispatching {}", request.kind());
        let response = match request {
            Request::ListAgents => Response::Agents {
                agents: self.list_agents().await?,
            },
            Request::RunCommand { agent, command } => Response::CommandOutput {
                result: self.run_command(&agent, &command, &call).await?,
            },
            Request::CopyFile {
                agent,
                file_name,
                contents,
            } => {
                self.copy_file(&agent, &file_name, contents).await?;
                Response::Copied
            }
            Request::SendResult { correlation_id, result } => {
                self.send_result(correlation_id, result).await?;
                Response::ResultAccepted
            }
            Request::Evict { agent } => Response::Evicted {
                was_registered: self.evict(&agent).await?,
            },
            Request::GetCommands { agent } => return self.stream_commands(&agent, sink, &call).await,
            Request::GetFiles { agent } => return self.stream_files(&agent, sink, &call).await,
            Request::Heartbeat { agent } => return self.stream_heartbeat(&agent, sink, &call).await,
        };
        sink.send(response).await
    }

    /// Snapshot of live agents
    pub async fn list_agents(&self) -> Result<Vec<String>> {
        Ok(self.inner.registry.list_live().await?)
    }

    /// Queue a command and wait for its result
    ///
    /// Liveness is not checked: a command for an agent with no open command
    /// stream is still queued and the call times out.
    pub async fn run_command(&self, agent: &str, command: &str, call: &CancellationToken) -> Result<String> {
        require("agent", agent)?;
        let command = Command::new(command);
        let correlation_id = command.correlation_id;

        self.inner.queues.enqueue_command(agent, &command).await?;
        debug!("Queued command {} for {}", correlation_id, agent);

        let wait_timeout = self.inner.config.wait_timeout;
        let result = tokio::select! {
            result = self.inner.queues.await_result(&correlation_id, wait_timeout) => result,
            _ = call.cancelled() => {
                debug!("Abandoned wait for result {}", correlation_id);
                return Err(CoordinatorError::Cancelled);
            }
        };

        match result {
            Ok(result) => Ok(result.output),
            Err(e) if e.is_timeout() => {
                warn!("No result for command {} on {} within {:?}", correlation_id, agent, wait_timeout);
                Err(CoordinatorError::Timeout {
                    duration: wait_timeout,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Queue a file for an agent without waiting for delivery
    pub async fn copy_file(&self, agent: &str, file_name: &str, contents: Bytes) -> Result<()> {
        require("agent", agent)?;
        require("file name", file_name)?;
        let size = contents.len();
        self.inner
            .queues
            .enqueue_file(&FileTransfer::new(agent, file_name, contents))
            .await?;
        debug!("Queued file {} ({} bytes) for {}", file_name, size, agent);
        Ok(())
    }

    /// Hand a command's output to whoever waits on its correlation id
    ///
    /// Unknown or duplicate ids are accepted; nobody consumes them.
    pub async fn send_result(&self, correlation_id: Uuid, result: String) -> Result<()> {
        self.inner
            .queues
            .enqueue_result(&CommandResult::new(correlation_id, result))
            .await?;
        debug!("Accepted result {}", correlation_id);
        Ok(())
    }

    /// Cancel every open stream of an agent and drop it from the registry
    ///
    /// Returns whether the agent was registered.
    pub async fn evict(&self, agent: &str) -> Result<bool> {
        require("agent", agent)?;
        let streams = lock_agents(&self.inner.agents).remove(agent);
        if let Some(streams) = streams {
            info!("Evicting {} with {} open streams", agent, streams.open);
            streams.token.cancel();
        }
        Ok(self.inner.registry.deregister(agent).await?)
    }

    /// Register an agent and stream its commands
    ///
    /// A wait that times out is not an error; the stream keeps listening.
    /// Any terminal outcome deregisters the agent unless another command
    /// stream for it is still open.
    pub async fn stream_commands<P>(&self, agent: &str, sink: &mut P, call: &CancellationToken) -> Result<()>
    where
        P: PeerSink + ?Sized,
    {
        require("agent", agent)?;
        let mut guard = self.open_stream(agent, true);
        self.inner.registry.register(agent).await?;
        info!("Command stream opened for {}", agent);

        let wait_timeout = self.inner.config.wait_timeout;
        let outcome = loop {
            let next = tokio::select! {
                _ = guard.cancelled(call) => break Err(CoordinatorError::Cancelled),
                next = self.inner.queues.await_command(agent, wait_timeout) => next,
            };
            match next {
                Ok(command) => {
                    debug!("Delivering command {} to {}", command.correlation_id, agent);
                    if let Err(e) = sink.send(Response::Command(command)).await {
                        break Err(e);
                    }
                }
                Err(e) if e.is_timeout() => debug!("No commands for {}, still listening", agent),
                Err(BrokerError::Serialization(msg)) => warn!("Dropping undecodable command for {}: {}", agent, msg),
                Err(e) => break Err(e.into()),
            }
        };

        info!("Command stream for {} ended: {:?}", agent, outcome);
        if guard.release_command() {
            debug!("{} still has an open command stream, keeping it registered", agent);
        } else {
            self.deregister_quietly(agent).await;
        }
        outcome
    }

    /// Stream files queued for an agent; leaves the registry alone
    pub async fn stream_files<P>(&self, agent: &str, sink: &mut P, call: &CancellationToken) -> Result<()>
    where
        P: PeerSink + ?Sized,
    {
        require("agent", agent)?;
        let guard = self.open_stream(agent, false);
        info!("File stream opened for {}", agent);

        let wait_timeout = self.inner.config.wait_timeout;
        let outcome = loop {
            let next = tokio::select! {
                _ = guard.cancelled(call) => break Err(CoordinatorError::Cancelled),
                next = self.inner.queues.await_file(agent, wait_timeout) => next,
            };
            match next {
                Ok(file) => {
                    debug!("Delivering file {} to {}", file.file_name, agent);
                    if let Err(e) = sink.send(Response::File(file)).await {
                        break Err(e);
                    }
                }
                Err(e) if e.is_timeout() => debug!("No files for {}, still listening", agent),
                Err(BrokerError::Serialization(msg)) => warn!("Dropping undecodable file for {}: {}", agent, msg),
                Err(e) => break Err(e.into()),
            }
        };

        info!("File stream for {} ended: {:?}", agent, outcome);
        outcome
    }

    /// Ping an agent at a fixed cadence; the first failed ping deregisters it
    pub async fn stream_heartbeat<P>(&self, agent: &str, sink: &mut P, call: &CancellationToken) -> Result<()>
    where
        P: PeerSink + ?Sized,
    {
        require("agent", agent)?;
        let guard = self.open_stream(agent, false);
        info!("Heartbeat stream opened for {}", agent);

        let mut ticker = tokio::time::interval(self.inner.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                _ = guard.cancelled(call) => break Err(CoordinatorError::Cancelled),
                _ = ticker.tick() => {}
            }
            if let Err(e) = sink.send(Response::Ping(Ping::now())).await {
                warn!("Heartbeat to {} failed: {}", agent, e);
                break Err(e);
            }
        };

        self.deregister_quietly(agent).await;
        outcome
    }

    async fn deregister_quietly(&self, agent: &str) {
        if let Err(e) = self.inner.registry.deregister(agent).await {
            warn!("Failed to deregister {}: {}", agent, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use puppeteer_broker::{MemoryBroker, QueueBroker};
    use std::time::Duration;
    use tokio::time::timeout;

    fn coordinator_with(config: CoordinatorConfig) -> (Coordinator, Arc<MemoryBroker>) {
        let broker = Arc::new(MemoryBroker::new());
        (Coordinator::new(broker.clone(), config), broker)
    }

    fn coordinator() -> (Coordinator, Arc<MemoryBroker>) {
        coordinator_with(CoordinatorConfig::default().with_heartbeat_interval(Duration::from_millis(20)))
    }

    /// Run a stream in the background, handing back its receiving end
    fn spawn_stream(
        coordinator: &Coordinator,
        request: Request,
        capacity: usize,
    ) -> (
        mpsc::Receiver<Response>,
        CancellationToken,
        tokio::task::JoinHandle<Result<()>>,
    ) {
        let (mut tx, rx) = mpsc::channel(capacity);
        let call = CancellationToken::new();
        let handle = {
            let coordinator = coordinator.clone();
            let call = call.clone();
            tokio::spawn(async move { coordinator.dispatch(request, &mut tx, call).await })
        };
        (rx, call, handle)
    }

    async fn wait_until_live(coordinator: &Coordinator, agent: &str, live: bool) {
        timeout(Duration::from_secs(2), async {
            loop {
                let agents = coordinator.list_agents().await.unwrap();
                if agents.iter().any(|a| a == agent) == live {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("registry did not settle");
    }

    #[tokio::test]
    async fn test_run_command_round_trip() {
        let (coordinator, _) = coordinator();
        let (mut commands, _call, _stream) =
            spawn_stream(&coordinator, Request::GetCommands { agent: "alpis".into() }, 8);
        wait_until_live(&coordinator, "alpis", true).await;
        assert_eq!(coordinator.list_agents().await.unwrap(), vec!["alpis"]);

        let agent_side = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                match commands.recv().await {
                    Some(Response::Command(command)) => {
                        assert_eq!(command.command, "echo hi");
                        coordinator
                            .send_result(command.correlation_id, "hi\n".into())
                            .await
                            .unwrap();
                    }
                    other => panic!("Expected command, got {:?}", other),
                }
            })
        };

        let output = coordinator
            .run_command("alpis", "echo hi", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output, "hi\n");
        agent_side.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_command_times_out() {
        let (coordinator, _) =
            coordinator_with(CoordinatorConfig::default().with_wait_timeout(Duration::from_millis(50)));

        let result = coordinator
            .run_command("nobody", "uptime", &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(CoordinatorError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_run_command_cancelled_by_call() {
        let (coordinator, _) = coordinator();
        let call = CancellationToken::new();
        call.cancel();

        let result = coordinator.run_command("alpis", "sleep 100", &call).await;
        assert!(matches!(result, Err(CoordinatorError::Cancelled)));
    }

    #[tokio::test]
    async fn test_stray_result_is_inert() {
        let (coordinator, broker) = coordinator();
        let stray = Uuid::new_v4();
        coordinator.send_result(stray, "nobody asked".into()).await.unwrap();

        let key = puppeteer_broker::queues::result_key(&stray);
        assert_eq!(broker.queue_len(&key).await, 1);
        assert!(coordinator.list_agents().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_copy_file_delivers_once() {
        let (coordinator, _) = coordinator();
        let (mut files, _call, _stream) =
            spawn_stream(&coordinator, Request::GetFiles { agent: "alpis".into() }, 8);

        coordinator
            .copy_file("alpis", "a.txt", Bytes::from_static(b"hello"))
            .await
            .unwrap();

        match timeout(Duration::from_secs(1), files.recv()).await.unwrap() {
            Some(Response::File(file)) => {
                assert_eq!(file.file_name, "a.txt");
                assert_eq!(file.contents, Bytes::from_static(b"hello"));
            }
            other => panic!("Expected file, got {:?}", other),
        }
        assert!(timeout(Duration::from_millis(50), files.recv()).await.is_err());

        // File streams never touch the registry
        assert!(coordinator.list_agents().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stream_survives_wait_timeouts() {
        let (coordinator, _) =
            coordinator_with(CoordinatorConfig::default().with_wait_timeout(Duration::from_millis(10)));
        let (mut commands, _call, stream) =
            spawn_stream(&coordinator, Request::GetCommands { agent: "alpis".into() }, 8);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!stream.is_finished());
        assert_eq!(coordinator.list_agents().await.unwrap(), vec!["alpis"]);

        let command = Command::new("date");
        coordinator
            .inner
            .queues
            .enqueue_command("alpis", &command)
            .await
            .unwrap();
        match timeout(Duration::from_secs(1), commands.recv()).await.unwrap() {
            Some(Response::Command(delivered)) => assert_eq!(delivered, command),
            other => panic!("Expected command, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_command_stream_send_failure_deregisters() {
        let (coordinator, _) = coordinator();
        let (commands, _call, stream) =
            spawn_stream(&coordinator, Request::GetCommands { agent: "alpis".into() }, 1);
        wait_until_live(&coordinator, "alpis", true).await;

        drop(commands);
        coordinator
            .inner
            .queues
            .enqueue_command("alpis", &Command::new("ls"))
            .await
            .unwrap();

        let outcome = timeout(Duration::from_secs(1), stream).await.unwrap().unwrap();
        assert!(matches!(outcome, Err(CoordinatorError::Transport(_))));
        assert!(coordinator.list_agents().await.unwrap().is_empty());
        assert_eq!(coordinator.open_streams("alpis"), 0);
    }

    #[tokio::test]
    async fn test_duplicate_command_stream_keeps_registration() {
        let (coordinator, _) = coordinator();
        let (_first, first_call, first) =
            spawn_stream(&coordinator, Request::GetCommands { agent: "alpis".into() }, 8);
        let (_second, second_call, second) =
            spawn_stream(&coordinator, Request::GetCommands { agent: "alpis".into() }, 8);
        wait_until_live(&coordinator, "alpis", true).await;
        timeout(Duration::from_secs(1), async {
            while coordinator.open_command_streams("alpis") < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        first_call.cancel();
        let outcome = timeout(Duration::from_secs(1), first).await.unwrap().unwrap();
        assert!(matches!(outcome, Err(CoordinatorError::Cancelled)));
        assert_eq!(coordinator.open_command_streams("alpis"), 1);
        assert_eq!(coordinator.list_agents().await.unwrap(), vec!["alpis"]);

        second_call.cancel();
        timeout(Duration::from_secs(1), second).await.unwrap().unwrap().unwrap_err();
        assert!(coordinator.list_agents().await.unwrap().is_empty());
        assert_eq!(coordinator.open_streams("alpis"), 0);
    }

    #[tokio::test]
    async fn test_stale_command_stream_spares_reconnected_agent() {
        let (coordinator, _) = coordinator();
        let (_old_commands, _old_call, old) =
            spawn_stream(&coordinator, Request::GetCommands { agent: "alpis".into() }, 8);
        wait_until_live(&coordinator, "alpis", true).await;

        // Evict, then reconnect before the old stream has finished
        let streams = lock_agents(&coordinator.inner.agents).remove("alpis");
        let (_new_commands, _new_call, new) =
            spawn_stream(&coordinator, Request::GetCommands { agent: "alpis".into() }, 8);
        timeout(Duration::from_secs(1), async {
            while coordinator.open_command_streams("alpis") < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        if let Some(streams) = streams {
            streams.token.cancel();
        }

        timeout(Duration::from_secs(1), old).await.unwrap().unwrap().unwrap_err();
        assert_eq!(coordinator.list_agents().await.unwrap(), vec!["alpis"]);
        assert!(!new.is_finished());
    }

    #[tokio::test]
    async fn test_heartbeat_failure_deregisters() {
        let (coordinator, _) = coordinator();
        let (_commands, _call, _stream) =
            spawn_stream(&coordinator, Request::GetCommands { agent: "alpis".into() }, 8);
        wait_until_live(&coordinator, "alpis", true).await;

        let (mut pings, _hb_call, heartbeat) =
            spawn_stream(&coordinator, Request::Heartbeat { agent: "alpis".into() }, 1);
        assert!(matches!(pings.recv().await, Some(Response::Ping(_))));
        drop(pings);

        let outcome = timeout(Duration::from_secs(1), heartbeat).await.unwrap().unwrap();
        assert!(outcome.is_err());
        assert!(coordinator.list_agents().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_broker_outage_ends_command_stream() {
        let (coordinator, broker) = coordinator();
        let (_commands, _call, stream) =
            spawn_stream(&coordinator, Request::GetCommands { agent: "alpis".into() }, 8);
        wait_until_live(&coordinator, "alpis", true).await;

        broker.close().await;
        let outcome = timeout(Duration::from_secs(1), stream).await.unwrap().unwrap();
        assert!(matches!(outcome, Err(CoordinatorError::BrokerUnavailable(_))));
    }

    #[tokio::test]
    async fn test_call_cancellation_ends_stream() {
        let (coordinator, _) = coordinator();
        let (_files, call, stream) =
            spawn_stream(&coordinator, Request::GetFiles { agent: "alpis".into() }, 8);

        tokio::time::sleep(Duration::from_millis(20)).await;
        call.cancel();
        let outcome = timeout(Duration::from_secs(1), stream).await.unwrap().unwrap();
        assert!(matches!(outcome, Err(CoordinatorError::Cancelled)));
    }

    #[tokio::test]
    async fn test_evict_tears_down_all_streams() {
        let (coordinator, _) = coordinator();
        let (_commands, _c1, commands) =
            spawn_stream(&coordinator, Request::GetCommands { agent: "alpis".into() }, 8);
        let (_files, _c2, files) =
            spawn_stream(&coordinator, Request::GetFiles { agent: "alpis".into() }, 8);
        let (_pings, _c3, heartbeat) =
            spawn_stream(&coordinator, Request::Heartbeat { agent: "alpis".into() }, 64);
        wait_until_live(&coordinator, "alpis", true).await;
        assert_eq!(coordinator.open_streams("alpis"), 3);

        assert!(coordinator.evict("alpis").await.unwrap());
        for stream in [commands, files, heartbeat] {
            let outcome = timeout(Duration::from_secs(1), stream).await.unwrap().unwrap();
            assert!(matches!(outcome, Err(CoordinatorError::Cancelled)));
        }
        assert!(coordinator.list_agents().await.unwrap().is_empty());
        assert!(!coordinator.evict("alpis").await.unwrap());

        // A fresh stream after eviction is not born cancelled
        let (_again, _c4, again) =
            spawn_stream(&coordinator, Request::GetCommands { agent: "alpis".into() }, 8);
        wait_until_live(&coordinator, "alpis", true).await;
        assert!(!again.is_finished());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_streams() {
        let (coordinator, _) = coordinator();
        let (_files, _call, stream) =
            spawn_stream(&coordinator, Request::GetFiles { agent: "alpis".into() }, 8);

        tokio::time::sleep(Duration::from_millis(20)).await;
        coordinator.shutdown();
        let outcome = timeout(Duration::from_secs(1), stream).await.unwrap().unwrap();
        assert!(matches!(outcome, Err(CoordinatorError::Cancelled)));
    }

    #[tokio::test]
    async fn test_unary_dispatch() {
        let (coordinator, broker) = coordinator();
        broker.add_member("puppets", "bravo").await.unwrap();
        let (mut tx, mut rx) = mpsc::channel(4);

        coordinator
            .dispatch(Request::ListAgents, &mut tx, CancellationToken::new())
            .await
            .unwrap();
        match rx.recv().await {
            Some(Response::Agents { agents }) => assert_eq!(agents, vec!["bravo"]),
            other => panic!("Expected agents, got {:?}", other),
        }

        let result = coordinator
            .dispatch(
                Request::CopyFile {
                    agent: String::new(),
                    file_name: "a.txt".into(),
                    contents: Bytes::new(),
                },
                &mut tx,
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(CoordinatorError::InvalidRequest(_))));
    }
}
