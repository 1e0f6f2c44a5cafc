//! Group Scheduler - periodic group execution
//!
//! Each group keeps its own interval. A shared tick checks which groups are
//! due and runs them one after another while holding the bus lock, so no two
//! requests are ever outstanding on the gateway at once.

use crate::error::MeterError;
use crate::executor::CommandExecutor;
use crate::grouping::{GroupResults, RegisterGroup};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lower bound of the scheduler tick
pub const MIN_TICK: Duration = Duration::from_millis(100);

/// Tick = max(100ms, shortest interval / 10)
pub fn tick_interval(groups: &[RegisterGroup]) -> Duration {
    groups
        .iter()
        .map(|g| g.interval() / 10)
        .min()
        .map_or(MIN_TICK, |tick| tick.max(MIN_TICK))
}

/// Receiver of group outcomes
#[async_trait]
pub trait GroupSink: Send + Sync {
    async fn on_group_success(&self, group: &RegisterGroup, results: GroupResults);
    async fn on_group_failure(&self, group: &RegisterGroup, error: &MeterError);
}

/// Runtime state for a scheduled group
#[derive(Debug)]
pub struct ScheduledGroup {
    group: RegisterGroup,
    last_execution_start: Option<Instant>,
}

impl ScheduledGroup {
    pub fn new(group: RegisterGroup) -> Self {
        Self {
            group,
            last_execution_start: None,
        }
    }

    pub fn group(&self) -> &RegisterGroup {
        &self.group
    }

    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_execution_start {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.group.interval(),
        }
    }

    /// Stamp the start of an execution, before its outcome is known
    pub fn mark_started(&mut self, now: Instant) {
        self.last_execution_start = Some(now);
    }
}

pub struct GroupScheduler {
    groups: Vec<ScheduledGroup>,
    executor: Arc<CommandExecutor>,
    /// Process-wide exclusive section around bus transactions
    bus_lock: Arc<Mutex<()>>,
    tick: Duration,
}

impl GroupScheduler {
    pub fn new(
        groups: Vec<RegisterGroup>,
        executor: Arc<CommandExecutor>,
        bus_lock: Arc<Mutex<()>>,
    ) -> Self {
        let tick = tick_interval(&groups);
        Self {
            groups: groups.into_iter().map(ScheduledGroup::new).collect(),
            executor,
            bus_lock,
            tick,
        }
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    pub fn groups(&self) -> &[ScheduledGroup] {
        &self.groups
    }

    /// Indices of the groups due at `now`
    pub fn due_groups(&self, now: Instant) -> Vec<usize> {
        self.groups
            .iter()
            .enumerate()
            .filter(|(_, g)| g.is_due(now))
            .map(|(i, _)| i)
            .collect()
    }

    /// Execute every group due at `now`; returns how many ran
    pub async fn run_due(
        &mut self,
        now: Instant,
        sink: &dyn GroupSink,
        cancel: &CancellationToken,
    ) -> usize {
        let due = self.due_groups(now);
        let mut executed = 0;

        for index in due {
            if cancel.is_cancelled() {
                break;
            }

            let scheduled = &mut self.groups[index];
            scheduled.mark_started(Instant::now());
            let group = &scheduled.group;

            let outcome = {
                let _bus = tokio::select! {
                    guard = self.bus_lock.lock() => guard,
                    _ = cancel.cancelled() => break,
                };
                group.execute(&self.executor).await
            };
            executed += 1;

            match outcome {
                Ok(results) => {
                    debug!("group {}: {} results", group.name(), results.len());
                    sink.on_group_success(group, results).await;
                },
                Err(e) => {
                    warn!("group {} failed: {}", group.name(), e);
                    sink.on_group_failure(group, &e).await;
                },
            }
        }

        executed
    }

    /// Scheduler loop; returns on cancellation
    pub async fn run(mut self, sink: Arc<dyn GroupSink>, cancel: CancellationToken) {
        info!(
            "Starting group scheduler: {} groups, {:?} tick",
            self.groups.len(),
            self.tick
        );

        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_due(Instant::now(), sink.as_ref(), &cancel).await;
                }
                _ = cancel.cancelled() => {
                    info!("Group scheduler received shutdown signal");
                    break;
                }
            }
        }

        info!("Group scheduler stopped");
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::cache::ResultCache;
    use crate::register::RegisterDescriptor;
    use crate::strategy::Strategy;
    use parking_lot::Mutex as SyncMutex;
    use voltage_gateway::{GatewayError, RegisterBus};

    fn group(name: &str, interval_ms: u64, members: &[&str]) -> RegisterGroup {
        RegisterGroup::new(
            name,
            1,
            Duration::from_millis(interval_ms),
            members.iter().map(|m| m.to_string()).collect(),
        )
    }

    /// Fails every read and counts calls
    #[derive(Default)]
    struct FailingBus {
        reads: SyncMutex<usize>,
    }

    #[async_trait]
    impl RegisterBus for FailingBus {
        async fn read_holding_registers(&self, _: u8, _: u16, _: u16) -> voltage_gateway::Result<Vec<u8>> {
            *self.reads.lock() += 1;
            Err(GatewayError::Timeout(Duration::from_secs(2)))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        successes: SyncMutex<Vec<String>>,
        failures: SyncMutex<Vec<String>>,
    }

    #[async_trait]
    impl GroupSink for RecordingSink {
        async fn on_group_success(&self, group: &RegisterGroup, _results: GroupResults) {
            self.successes.lock().push(group.name().to_string());
        }

        async fn on_group_failure(&self, group: &RegisterGroup, _error: &MeterError) {
            self.failures.lock().push(group.name().to_string());
        }
    }

    fn scheduler(groups: Vec<RegisterGroup>) -> (GroupScheduler, Arc<FailingBus>) {
        let bus = Arc::new(FailingBus::default());
        let strategies = vec![Strategy::new(
            RegisterDescriptor::new("voltage", "Voltage", 0).with_class("voltage", "V"),
            "",
            1,
        )
        .unwrap()];
        let executor = Arc::new(
            CommandExecutor::new(strategies, bus.clone(), Arc::new(ResultCache::default())).unwrap(),
        );
        (
            GroupScheduler::new(groups, executor, Arc::new(Mutex::new(()))),
            bus,
        )
    }

    // ========================================================================
    // Timing
    // ========================================================================

    #[test]
    fn test_tick_interval() {
        assert_eq!(tick_interval(&[]), MIN_TICK);
        assert_eq!(tick_interval(&[group("a", 500, &[])]), MIN_TICK);
        assert_eq!(
            tick_interval(&[group("a", 5000, &[]), group("b", 3000, &[])]),
            Duration::from_millis(300)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_due_logic() {
        let mut scheduled = ScheduledGroup::new(group("a", 1000, &[]));
        let t0 = Instant::now();
        assert!(scheduled.is_due(t0));

        scheduled.mark_started(t0);
        assert!(!scheduled.is_due(t0 + Duration::from_millis(500)));
        assert!(scheduled.is_due(t0 + Duration::from_millis(1001)));
    }

    // ========================================================================
    // Execution
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_failing_group_retries_at_its_cadence() {
        let (mut scheduler, bus) = scheduler(vec![group("fast", 1000, &["voltage"])]);
        let sink = RecordingSink::default();
        let cancel = CancellationToken::new();

        assert_eq!(scheduler.run_due(Instant::now(), &sink, &cancel).await, 1);
        assert_eq!(sink.failures.lock().len(), 1);

        // Next ticks inside the interval do nothing
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(scheduler.run_due(Instant::now(), &sink, &cancel).await, 0);
        assert_eq!(*bus.reads.lock(), 1);

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert_eq!(scheduler.run_due(Instant::now(), &sink, &cancel).await, 1);
        assert_eq!(*bus.reads.lock(), 2);
        assert!(sink.successes.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_groups_with_independent_intervals() {
        let (mut scheduler, _bus) = scheduler(vec![
            group("fast", 1000, &["voltage"]),
            group("slow", 5000, &["voltage"]),
        ]);
        let sink = RecordingSink::default();
        let cancel = CancellationToken::new();

        scheduler.run_due(Instant::now(), &sink, &cancel).await;
        tokio::time::advance(Duration::from_millis(1000)).await;
        scheduler.run_due(Instant::now(), &sink, &cancel).await;

        assert_eq!(*sink.failures.lock(), vec!["fast", "slow", "fast"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let (scheduler, bus) = scheduler(vec![group("fast", 1000, &["voltage"])]);
        let sink = Arc::new(RecordingSink::default());
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(scheduler.run(sink.clone(), cancel.clone()));
        tokio::time::sleep(Duration::from_millis(2500)).await;
        cancel.cancel();
        handle.await.unwrap();

        // Runs at t=0, 1000, 2000
        assert_eq!(*bus.reads.lock(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_scheduler_runs_nothing() {
        let (mut scheduler, bus) = scheduler(vec![group("fast", 1000, &["voltage"])]);
        let sink = RecordingSink::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(scheduler.run_due(Instant::now(), &sink, &cancel).await, 0);
        assert_eq!(*bus.reads.lock(), 0);
        assert!(scheduler.groups()[0].is_due(Instant::now()));
    }
}
