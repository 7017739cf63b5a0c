//! End-to-end scenarios over a real TCP coordinator backed by the memory broker

use anyhow::Result;
use bytes::Bytes;
use puppeteer::broker::MemoryBroker;
use puppeteer::{Client, Coordinator, CoordinatorConfig, Server};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

struct Harness {
    client: Client,
    coordinator: Coordinator,
    broker: Arc<MemoryBroker>,
    shutdown: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn start(config: CoordinatorConfig) -> Result<Harness> {
    let broker = Arc::new(MemoryBroker::new());
    let config = config.with_bind_address("127.0.0.1").with_port(0);
    let server = Server::bind(config, broker.clone()).await?;
    let client = Client::new(server.local_addr()?.to_string());
    let shutdown = server.shutdown_token();
    let coordinator = server.coordinator().clone();
    tokio::spawn(server.serve());
    Ok(Harness {
        client,
        coordinator,
        broker,
        shutdown,
    })
}

async fn wait_for_agents(client: &Client, expected: &[&str]) -> Result<()> {
    timeout(Duration::from_secs(2), async {
        loop {
            let agents = client.list_agents().await?;
            if agents == expected {
                return Ok::<_, anyhow::Error>(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await??;
    Ok(())
}

#[tokio::test]
async fn test_run_command_through_agent() -> Result<()> {
    let harness = start(CoordinatorConfig::default()).await?;
    let client = harness.client.clone();

    let mut commands = client.commands("alpis").await?;
    wait_for_agents(&client, &["alpis"]).await?;

    // Simulated agent: answer the first command it sees
    let agent = {
        let client = client.clone();
        tokio::spawn(async move {
            let command = commands.next().await?.ok_or_else(|| anyhow::anyhow!("stream ended"))?;
            assert_eq!(command.command, "echo hi");
            client.send_result(command.correlation_id, "hi\n").await?;
            Ok::<_, anyhow::Error>(())
        })
    };

    let output = client.run_command("alpis", "echo hi").await?;
    assert_eq!(output, "hi\n");
    agent.await??;
    Ok(())
}

#[tokio::test]
async fn test_copy_file_delivered_exactly_once() -> Result<()> {
    let harness = start(CoordinatorConfig::default()).await?;
    let client = &harness.client;

    let mut files = client.files("alpis").await?;
    client.copy_file("alpis", "a.txt", Bytes::from_static(b"hello")).await?;

    let file = timeout(Duration::from_secs(1), files.next())
        .await??
        .ok_or_else(|| anyhow::anyhow!("file stream ended"))?;
    assert_eq!(file.file_name, "a.txt");
    assert_eq!(file.contents, Bytes::from_static(b"hello"));

    assert!(timeout(Duration::from_millis(100), files.next()).await.is_err());

    client.copy_file("alpis", "b.txt", Bytes::from_static(b"again")).await?;
    let file = timeout(Duration::from_secs(1), files.next())
        .await??
        .ok_or_else(|| anyhow::anyhow!("file stream ended"))?;
    assert_eq!(file.file_name, "b.txt");
    Ok(())
}

#[tokio::test]
async fn test_heartbeat_failure_deregisters_and_commands_time_out() -> Result<()> {
    let config = CoordinatorConfig::default()
        .with_heartbeat_interval(Duration::from_millis(20))
        .with_wait_timeout(Duration::from_millis(300));
    let harness = start(config).await?;
    let client = &harness.client;

    let commands = client.commands("alpis").await?;
    let mut heartbeat = client.heartbeat("alpis").await?;
    wait_for_agents(client, &["alpis"]).await?;
    assert!(heartbeat.next().await?.is_some());

    // The agent vanishes: both of its connections drop
    drop(heartbeat);
    drop(commands);
    wait_for_agents(client, &[]).await?;
    timeout(Duration::from_secs(2), async {
        while harness.coordinator.open_streams("alpis") > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;

    let err = client
        .run_command("alpis", "uptime")
        .await
        .expect_err("nobody is left to answer");
    assert!(err.is_timeout());

    // The command was still queued; enqueue does not check liveness
    assert_eq!(harness.broker.queue_len("alpis-commands").await, 1);
    Ok(())
}

#[tokio::test]
async fn test_stray_result_has_no_effect() -> Result<()> {
    let config = CoordinatorConfig::default().with_wait_timeout(Duration::from_millis(200));
    let harness = start(config).await?;
    let client = &harness.client;

    client.send_result(uuid::Uuid::new_v4(), "unsolicited").await?;
    assert!(client.list_agents().await?.is_empty());

    // A real command is not satisfied by the stray result
    let err = client
        .run_command("alpis", "hostname")
        .await
        .expect_err("stray result must not answer this");
    assert!(err.is_timeout());
    Ok(())
}

#[tokio::test]
async fn test_commands_arrive_in_order() -> Result<()> {
    let config = CoordinatorConfig::default().with_wait_timeout(Duration::from_millis(500));
    let harness = start(config).await?;
    let client = harness.client.clone();

    let mut commands = client.commands("alpis").await?;
    wait_for_agents(&client, &["alpis"]).await?;

    // Fire-and-forget callers; results are never reported
    for i in 0..5 {
        let client = client.clone();
        tokio::spawn(async move {
            let _ = client.run_command("alpis", &format!("echo {}", i)).await;
        });
        // Serialize enqueue order
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    for i in 0..5 {
        let command = timeout(Duration::from_secs(1), commands.next())
            .await??
            .ok_or_else(|| anyhow::anyhow!("command stream ended"))?;
        assert_eq!(command.command, format!("echo {}", i));
    }
    Ok(())
}

#[tokio::test]
async fn test_agents_are_isolated() -> Result<()> {
    let harness = start(CoordinatorConfig::default()).await?;
    let client = harness.client.clone();

    let mut alpis = client.commands("alpis").await?;
    let mut bravo = client.commands("bravo").await?;
    wait_for_agents(&client, &["alpis", "bravo"]).await?;

    let answer = |mut stream: puppeteer::Subscription<puppeteer::proto::Command>, reply: &'static str| {
        let client = client.clone();
        tokio::spawn(async move {
            let command = stream.next().await?.ok_or_else(|| anyhow::anyhow!("stream ended"))?;
            client.send_result(command.correlation_id, reply).await?;
            Ok::<_, anyhow::Error>(stream)
        })
    };
    let alpis_agent = answer(alpis, "from alpis");
    let bravo_agent = answer(bravo, "from bravo");

    let (a, b) = tokio::join!(
        client.run_command("alpis", "whoami"),
        client.run_command("bravo", "whoami")
    );
    assert_eq!(a?, "from alpis");
    assert_eq!(b?, "from bravo");

    alpis = alpis_agent.await??;
    bravo = bravo_agent.await??;
    assert!(!alpis.is_done());
    assert!(!bravo.is_done());
    Ok(())
}

#[tokio::test]
async fn test_evict_ends_agent_streams() -> Result<()> {
    let harness = start(CoordinatorConfig::default()).await?;
    let client = &harness.client;

    let mut commands = client.commands("alpis").await?;
    let mut files = client.files("alpis").await?;
    wait_for_agents(client, &["alpis"]).await?;

    assert!(client.evict("alpis").await?);
    assert!(timeout(Duration::from_secs(1), commands.next()).await?.is_err());
    assert!(timeout(Duration::from_secs(1), files.next()).await?.is_err());
    assert!(client.list_agents().await?.is_empty());
    Ok(())
}
