//! Service wiring
//!
//! Builds every component from a validated [`MeterConfig`] and runs the link
//! supervisor, group scheduler and availability heartbeat until the shared
//! cancellation token fires. The link outlives the other tasks so the final
//! offline status reaches the broker.

use crate::bridge::Bridge;
use crate::cache::ResultCache;
use crate::config::MeterConfig;
use crate::executor::CommandExecutor;
use crate::health::HealthMonitor;
use crate::publisher::{MqttPublisher, Publisher, STATUS_OFFLINE};
use crate::scheduler::{GroupScheduler, GroupSink};
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use voltage_gateway::{
    BusLogger, ConnectionState, GatewayTransport, LinkState, LinkSupervisor, MqttPubSub,
    PubSubClient, SupervisorConfig, TransportConfig,
};

/// Upper bound on joining background tasks after cancellation
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on flushing the offline status and disconnect
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Run the bridge until `cancel` fires
pub async fn run(config: MeterConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    let target = format!("{}:{}", config.mqtt.host, config.mqtt.port);

    // ============ Phase 1: Broker link ============
    let status_topic = config.homeassistant.status_topic();
    let (mqtt, events) = MqttPubSub::connect(
        &config.mqtt,
        Some((status_topic, STATUS_OFFLINE.to_string())),
    );
    let client: Arc<dyn PubSubClient> = Arc::new(mqtt);

    let logger = BusLogger::new(target.clone());
    let link_state = LinkState::new(logger.clone());

    let transport = Arc::new(GatewayTransport::new(
        TransportConfig {
            command_topic: config.gateway.command_topic.clone(),
            data_topic: config.gateway.data_topic.clone(),
            request_timeout: config.gateway.request_timeout(),
        },
        client.clone(),
        link_state.subscribe(),
        cancel.clone(),
        logger,
    ));

    let supervisor = Arc::new(LinkSupervisor::new(
        SupervisorConfig {
            target: target.clone(),
            connect_timeout: config.gateway.connect_timeout(),
            reconnect: config.gateway.reconnect_policy(),
            subscriptions: vec![config.gateway.data_topic.clone()],
        },
        client.clone(),
        transport.clone(),
        link_state,
    ));

    // ============ Phase 2: Meter core ============
    let cache = Arc::new(ResultCache::new(config.cache_ttl()));
    let strategies = config
        .build_strategies()
        .context("Failed to build register strategies")?;
    let executor = Arc::new(
        CommandExecutor::new(strategies, transport, cache)
            .context("Failed to build command executor")?,
    );
    let groups = config.build_groups();
    let bus_lock = Arc::new(Mutex::new(()));
    let scheduler = GroupScheduler::new(groups, executor, bus_lock);

    // ============ Phase 3: Publishing ============
    let health = Arc::new(HealthMonitor::new(config.grace_period()));
    let publisher: Arc<dyn Publisher> = Arc::new(MqttPublisher::new(
        client.clone(),
        supervisor.subscribe_state(),
        config.homeassistant.clone(),
        config.device.clone(),
    ));
    let bridge = Arc::new(Bridge::new(health, publisher.clone()));

    info!(
        "metersrv started: broker {}, {} registers, {} groups, tick {:?}",
        target,
        config.registers.len(),
        scheduler.groups().len(),
        scheduler.tick()
    );

    // ============ Phase 4: Background tasks ============
    // Stopped only after the offline status has been flushed
    let link_cancel = CancellationToken::new();
    let supervisor_task = {
        let supervisor = supervisor.clone();
        let link_cancel = link_cancel.clone();
        tokio::spawn(async move { supervisor.run(events, link_cancel).await })
    };
    let scheduler_task = {
        let sink: Arc<dyn GroupSink> = bridge.clone();
        tokio::spawn(scheduler.run(sink, cancel.clone()))
    };
    let heartbeat_task = tokio::spawn(bridge.clone().run_heartbeat(
        config.heartbeat_interval(),
        supervisor.subscribe_state(),
        cancel.clone(),
    ));

    cancel.cancelled().await;
    info!("Shutting down metersrv...");

    join_task("scheduler", scheduler_task).await;
    join_task("heartbeat", heartbeat_task).await;

    announce_offline(publisher.as_ref(), client.as_ref(), supervisor.subscribe_state()).await;

    link_cancel.cancel();
    join_task("supervisor", supervisor_task).await;

    info!("metersrv stopped");
    Ok(())
}

/// Publish the final offline status, then disconnect and wait for the session to close
///
/// Must run while the link supervisor still polls the broker connection. The
/// last will is not sent after a clean disconnect, so this is the only offline
/// signal on shutdown.
async fn announce_offline(
    publisher: &dyn Publisher,
    client: &dyn PubSubClient,
    mut link_rx: watch::Receiver<ConnectionState>,
) {
    if let Err(e) = publisher.publish_status_offline().await {
        warn!("Could not publish offline status: {}", e);
    }
    match tokio::time::timeout(DRAIN_TIMEOUT, client.disconnect()).await {
        Ok(Ok(())) => {
            let closed = link_rx.wait_for(|state| !state.is_connected());
            if tokio::time::timeout(DRAIN_TIMEOUT, closed).await.is_err() {
                warn!("Broker did not close the session within {:?}", DRAIN_TIMEOUT);
            }
        },
        Ok(Err(e)) => warn!("Disconnect failed: {}", e),
        Err(_) => warn!("Disconnect not accepted within {:?}", DRAIN_TIMEOUT),
    }
}

async fn join_task(name: &str, task: JoinHandle<()>) {
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await {
        Ok(Ok(())) => {},
        Ok(Err(e)) => warn!("{} task failed: {}", name, e),
        Err(_) => warn!("{} task did not stop within {:?}", name, SHUTDOWN_TIMEOUT),
    }
}
