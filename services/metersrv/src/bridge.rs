//! Bridge between group outcomes, device health and the publisher
//!
//! Individual read failures stay invisible to the broker. Only a failure
//! streak that outlives the grace period flips availability, and each flip
//! is announced exactly once.

use crate::error::{MeterError, Result};
use crate::grouping::{GroupResults, RegisterGroup};
use crate::health::HealthMonitor;
use crate::publisher::Publisher;
use crate::scheduler::GroupSink;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use voltage_gateway::ConnectionState;

pub const DIAG_DEVICE_OFFLINE: &str = "device_offline";
pub const DIAG_DEVICE_ONLINE: &str = "device_online";

pub struct Bridge {
    health: Arc<HealthMonitor>,
    publisher: Arc<dyn Publisher>,
    /// Keys whose discovery config has been published
    announced: Mutex<HashSet<String>>,
}

impl Bridge {
    pub fn new(health: Arc<HealthMonitor>, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            health,
            publisher,
            announced: Mutex::new(HashSet::new()),
        }
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn is_announced(&self, key: &str) -> bool {
        self.announced.lock().contains(key)
    }

    /// Publish the availability matching the current health state
    pub async fn publish_availability(&self) -> Result<()> {
        if self.health.is_online() {
            self.publisher.publish_status_online().await
        } else {
            self.publisher.publish_status_offline().await
        }
    }

    async fn publish_results(&self, results: GroupResults) {
        let mut keys: Vec<_> = results.keys().cloned().collect();
        keys.sort();

        for key in keys {
            let Some(result) = results.get(&key) else {
                continue;
            };

            let first_seen = self.announced.lock().insert(key.clone());
            if first_seen {
                if let Err(e) = self.publisher.publish_sensor_discovery(result).await {
                    warn!("{}: discovery publish failed: {}", key, e);
                    self.announced.lock().remove(&key);
                    continue;
                }
                debug!("{}: discovery published", key);
            }

            if let Err(e) = self.publisher.publish_sensor_state(result).await {
                warn!("{}: state publish failed: {}", key, e);
            }
        }
    }

    /// Republish availability on every heartbeat and whenever the link comes up
    pub async fn run_heartbeat(
        self: Arc<Self>,
        interval: Duration,
        mut link_state: watch::Receiver<ConnectionState>,
        cancel: CancellationToken,
    ) {
        info!("Starting availability heartbeat every {:?}", interval);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {},
                changed = link_state.changed() => {
                    if changed.is_err() {
                        debug!("Link state channel closed");
                        break;
                    }
                    if !link_state.borrow_and_update().is_connected() {
                        continue;
                    }
                },
                _ = cancel.cancelled() => break,
            }

            if let Err(e) = self.publish_availability().await {
                debug!("Availability heartbeat skipped: {}", e);
            }
        }

        info!("Availability heartbeat stopped");
    }
}

#[async_trait]
impl GroupSink for Bridge {
    async fn on_group_success(&self, group: &RegisterGroup, results: GroupResults) {
        // Only values read from the bus prove the device is answering
        let measured = results.values().any(|r| r.raw.is_some());
        if measured && self.health.record_success() {
            info!("group {}: device recovered", group.name());
            if let Err(e) = self.publisher.publish_status_online().await {
                warn!("Failed to publish online status: {}", e);
            }
            if let Err(e) = self
                .publisher
                .publish_diagnostic(DIAG_DEVICE_ONLINE, "device responding again")
                .await
            {
                debug!("Failed to publish diagnostic: {}", e);
            }
        }

        self.publish_results(results).await;
    }

    async fn on_group_failure(&self, group: &RegisterGroup, error: &MeterError) {
        if !error.is_device_fault() {
            debug!("group {}: {} (not a device fault)", group.name(), error);
            return;
        }

        if !self.health.record_error() {
            if self.health.is_in_grace_period() {
                debug!(
                    "group {}: {} (error {} within grace period)",
                    group.name(),
                    error,
                    self.health.consecutive_errors()
                );
            }
            return;
        }

        if !self.health.mark_offline() {
            return;
        }

        if let Err(e) = self.publisher.publish_status_offline().await {
            warn!("Failed to publish offline status: {}", e);
        }
        let message = format!(
            "no valid reply for {:?} ({} consecutive errors): {}",
            self.health.grace_period(),
            self.health.consecutive_errors(),
            error
        );
        if let Err(e) = self
            .publisher
            .publish_diagnostic(DIAG_DEVICE_OFFLINE, &message)
            .await
        {
            debug!("Failed to publish diagnostic: {}", e);
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::register::CommandResult;
    use voltage_gateway::GatewayError;

    /// Records every call; discovery can be made to fail
    #[derive(Default)]
    struct RecordingPublisher {
        calls: Mutex<Vec<String>>,
        fail_discovery: Mutex<bool>,
    }

    impl RecordingPublisher {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn count(&self, prefix: &str) -> usize {
            self.calls.lock().iter().filter(|c| c.starts_with(prefix)).count()
        }
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish_sensor_state(&self, result: &CommandResult) -> Result<()> {
            self.calls
                .lock()
                .push(format!("state:{}={}", result.strategy_id, result.value));
            Ok(())
        }

        async fn publish_sensor_discovery(&self, result: &CommandResult) -> Result<()> {
            if *self.fail_discovery.lock() {
                return Err(GatewayError::NotConnected.into());
            }
            self.calls.lock().push(format!("discovery:{}", result.strategy_id));
            Ok(())
        }

        async fn publish_status_online(&self) -> Result<()> {
            self.calls.lock().push("status:online".to_string());
            Ok(())
        }

        async fn publish_status_offline(&self) -> Result<()> {
            self.calls.lock().push("status:offline".to_string());
            Ok(())
        }

        async fn publish_diagnostic(&self, code: &str, _message: &str) -> Result<()> {
            self.calls.lock().push(format!("diagnostic:{}", code));
            Ok(())
        }
    }

    fn bridge(grace: Duration) -> (Arc<Bridge>, Arc<RecordingPublisher>) {
        let publisher = Arc::new(RecordingPublisher::default());
        let bridge = Arc::new(Bridge::new(
            Arc::new(HealthMonitor::new(grace)),
            publisher.clone(),
        ));
        (bridge, publisher)
    }

    fn group() -> RegisterGroup {
        RegisterGroup::new("fast", 1, Duration::from_secs(1), Vec::new())
    }

    fn results(values: &[(&str, f64)]) -> GroupResults {
        values
            .iter()
            .map(|(key, value)| {
                (
                    key.to_string(),
                    CommandResult {
                        strategy_id: key.to_string(),
                        name: key.to_string(),
                        value: *value,
                        unit: String::new(),
                        topic: format!("metersrv/{}/state", key),
                        device_class: String::new(),
                        state_class: String::new(),
                        raw: Some(vec![0; 4]),
                    },
                )
            })
            .collect()
    }

    fn timeout() -> MeterError {
        GatewayError::Timeout(Duration::from_secs(2)).into()
    }

    // ========================================================================
    // Success path
    // ========================================================================

    #[tokio::test]
    async fn test_discovery_once_then_states_in_key_order() {
        let (bridge, publisher) = bridge(Duration::from_secs(60));

        bridge
            .on_group_success(&group(), results(&[("m_b", 2.0), ("m_a", 1.0)]))
            .await;
        bridge.on_group_success(&group(), results(&[("m_a", 1.5)])).await;

        assert_eq!(
            publisher.calls(),
            vec![
                "discovery:m_a",
                "state:m_a=1",
                "discovery:m_b",
                "state:m_b=2",
                "state:m_a=1.5",
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_discovery_is_retried() {
        let (bridge, publisher) = bridge(Duration::from_secs(60));
        *publisher.fail_discovery.lock() = true;

        bridge.on_group_success(&group(), results(&[("m_a", 1.0)])).await;
        assert!(!bridge.is_announced("m_a"));
        assert_eq!(publisher.count("state:"), 0);

        *publisher.fail_discovery.lock() = false;
        bridge.on_group_success(&group(), results(&[("m_a", 1.0)])).await;
        assert!(bridge.is_announced("m_a"));
        assert_eq!(publisher.calls(), vec!["discovery:m_a", "state:m_a=1"]);
    }

    // ========================================================================
    // Availability transitions
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_offline_announced_once_after_grace() {
        let (bridge, publisher) = bridge(Duration::from_secs(60));

        for _ in 0..3 {
            bridge.on_group_failure(&group(), &timeout()).await;
            tokio::time::advance(Duration::from_secs(10)).await;
        }
        assert!(publisher.calls().is_empty());
        assert!(bridge.health().is_online());

        tokio::time::advance(Duration::from_secs(40)).await;
        bridge.on_group_failure(&group(), &timeout()).await;
        bridge.on_group_failure(&group(), &timeout()).await;

        assert_eq!(
            publisher.calls(),
            vec!["status:offline", "diagnostic:device_offline"]
        );
        assert!(!bridge.health().is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_announced_once() {
        let (bridge, publisher) = bridge(Duration::ZERO);
        bridge.on_group_failure(&group(), &timeout()).await;
        assert!(!bridge.health().is_online());

        // Derived-only results say nothing about the device
        let mut derived = results(&[("m_q", 3.0)]);
        derived.values_mut().for_each(|r| r.raw = None);
        bridge.on_group_success(&group(), derived).await;
        assert!(!bridge.health().is_online());

        bridge.on_group_success(&group(), results(&[("m_a", 1.0)])).await;
        bridge.on_group_success(&group(), results(&[("m_a", 1.0)])).await;

        assert_eq!(publisher.count("status:online"), 1);
        assert_eq!(publisher.count("diagnostic:device_online"), 1);
        assert!(bridge.health().is_online());
    }

    #[tokio::test]
    async fn test_configuration_faults_do_not_count() {
        let (bridge, publisher) = bridge(Duration::ZERO);
        let missing = MeterError::MissingDependency {
            key: "m_pf".to_string(),
            variable: "m_p".to_string(),
        };
        bridge.on_group_failure(&group(), &missing).await;

        assert!(bridge.health().is_online());
        assert_eq!(bridge.health().consecutive_errors(), 0);
        assert!(publisher.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_on_tick_and_reconnect() {
        let (bridge, publisher) = bridge(Duration::from_secs(60));
        let (tx, rx) = watch::channel(ConnectionState::Disconnected);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(bridge.clone().run_heartbeat(
            Duration::from_secs(30),
            rx,
            cancel.clone(),
        ));

        // Immediate first tick
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(publisher.count("status:online"), 1);

        tx.send(ConnectionState::Connecting).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(publisher.count("status:online"), 1);

        tx.send(ConnectionState::Connected).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(publisher.count("status:online"), 2);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(publisher.count("status:online"), 3);

        cancel.cancel();
        handle.await.unwrap();
    }
}
