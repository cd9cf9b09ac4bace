use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::error::{Error, Result};
use crate::metrics_consts::{GROUP_MEMBERS, REBALANCES, REVOCATION_TIMEOUTS};
use crate::record::PartitionId;
use crate::strategy::{AssignmentStrategy, EvenStrategy};

/// Callbacks the coordinator uses to move partitions between group members.
#[async_trait]
pub trait PartitionOwner: Send + Sync {
    /// Start consuming `partition`, resuming after `checkpoint` when there is one.
    async fn assign(&self, partition: PartitionId, checkpoint: Option<Checkpoint>) -> Result<()>;

    /// Stop consuming `partition`. Returning acknowledges the revocation: the in-flight
    /// delivery finished and the final checkpoint was attempted.
    async fn revoke(&self, partition: PartitionId) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Members that have not sent a heartbeat for this long are removed from the group.
    pub heartbeat_timeout: Duration,
    /// How long a revocation may take before the partition is reassigned anyway.
    pub revocation_timeout: Duration,
    /// How often heartbeats are checked.
    pub check_interval: Duration,
    /// How long to wait after a membership change before rebalancing, to batch
    /// members joining together into a single rebalance.
    pub rebalance_debounce_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(30),
            revocation_timeout: Duration::from_secs(10),
            check_interval: Duration::from_secs(5),
            rebalance_debounce_interval: Duration::from_millis(500),
        }
    }
}

/// One partition changing hands. `from` is empty for partitions nobody owned yet, `to` is
/// empty when no member is left to take it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handoff {
    pub partition: PartitionId,
    pub from: Option<String>,
    pub to: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebalanceSummary {
    pub moved: usize,
    /// Revocations that were not acknowledged in time or failed.
    pub forced: usize,
    /// Assignments the new owner refused; retried on the next rebalance.
    pub failed: usize,
}

struct Member {
    owner: Arc<dyn PartitionOwner>,
    last_heartbeat: Instant,
}

#[derive(Default)]
struct Group {
    members: BTreeMap<String, Member>,
    /// Members that left or timed out but may still hold partitions to revoke.
    departed: HashMap<String, Arc<dyn PartitionOwner>>,
    /// Confirmed partition -> member ownership.
    assignments: HashMap<PartitionId, String>,
}

/// Assigns the partitions of one stream across the live members of one consumer group.
///
/// Partitions only change hands through a revoke-then-assign handoff, so at most one member
/// consumes a partition at a time. A member that does not acknowledge a revocation within
/// the revocation timeout loses the partition anyway, and the checkpoint store settles any
/// overlap.
pub struct Coordinator {
    consumer_group: String,
    partitions: Vec<PartitionId>,
    config: CoordinatorConfig,
    strategy: Arc<dyn AssignmentStrategy>,
    store: Option<CheckpointStore>,
    group: Mutex<Group>,
    rebalance_lock: tokio::sync::Mutex<()>,
    changed: Notify,
}

impl Coordinator {
    pub fn new(consumer_group: &str, partitions: Vec<PartitionId>, config: CoordinatorConfig) -> Self {
        let mut partitions = partitions;
        partitions.sort_unstable();
        partitions.dedup();
        Self {
            consumer_group: consumer_group.to_owned(),
            partitions,
            config,
            strategy: Arc::new(EvenStrategy),
            store: None,
            group: Mutex::new(Group::default()),
            rebalance_lock: tokio::sync::Mutex::new(()),
            changed: Notify::new(),
        }
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn AssignmentStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// New owners are handed the checkpoint stored for the partition they receive.
    pub fn with_checkpoint_store(mut self, store: CheckpointStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    fn group(&self) -> MutexGuard<'_, Group> {
        self.group.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Add a member, or refresh the callbacks of one already in the group.
    pub fn join(&self, member_id: &str, owner: Arc<dyn PartitionOwner>) {
        let count = {
            let mut group = self.group();
            group.departed.remove(member_id);
            group.members.insert(
                member_id.to_owned(),
                Member {
                    owner,
                    last_heartbeat: Instant::now(),
                },
            );
            group.members.len()
        };
        tracing::info!(group = %self.consumer_group, member = member_id, members = count, "member joined");
        metrics::gauge!(GROUP_MEMBERS).set(count as f64);
        self.changed.notify_one();
    }

    pub fn leave(&self, member_id: &str) {
        let removed = {
            let mut group = self.group();
            let removed = group.members.remove(member_id);
            if let Some(member) = &removed {
                group.departed.insert(member_id.to_owned(), member.owner.clone());
            }
            metrics::gauge!(GROUP_MEMBERS).set(group.members.len() as f64);
            removed.is_some()
        };
        if removed {
            tracing::info!(group = %self.consumer_group, member = member_id, "member left");
            self.changed.notify_one();
        }
    }

    /// Record that `member_id` is alive. Fails if the member is not (or no longer) in the group.
    pub fn heartbeat(&self, member_id: &str) -> Result<()> {
        let mut group = self.group();
        match group.members.get_mut(member_id) {
            Some(member) => {
                member.last_heartbeat = Instant::now();
                Ok(())
            }
            None => Err(Error::invalid_state(format!(
                "{member_id} is not a member of {}",
                self.consumer_group
            ))),
        }
    }

    /// Drop `member_id`'s claim on a partition it stopped reading, so the next rebalance
    /// assigns it again. Returns false if the member did not hold the partition.
    pub fn release_partition(&self, member_id: &str, partition: PartitionId) -> bool {
        let released = {
            let mut group = self.group();
            if group.assignments.get(&partition).is_some_and(|owner| owner == member_id) {
                group.assignments.remove(&partition);
                true
            } else {
                false
            }
        };
        if released {
            tracing::info!(group = %self.consumer_group, member = member_id, partition, "partition released by its owner");
            self.changed.notify_one();
        }
        released
    }

    /// Remove members whose last heartbeat is older than the heartbeat timeout.
    pub fn expire_members(&self) -> Vec<String> {
        let now = Instant::now();
        let expired: Vec<String> = {
            let mut group = self.group();
            let expired: Vec<String> = group
                .members
                .iter()
                .filter(|(_, m)| now.duration_since(m.last_heartbeat) > self.config.heartbeat_timeout)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &expired {
                if let Some(member) = group.members.remove(id) {
                    group.departed.insert(id.clone(), member.owner);
                }
            }
            metrics::gauge!(GROUP_MEMBERS).set(group.members.len() as f64);
            expired
        };

        for id in &expired {
            tracing::warn!(group = %self.consumer_group, member = %id, "member heartbeat timed out");
        }
        if !expired.is_empty() {
            self.changed.notify_one();
        }
        expired
    }

    pub fn members(&self) -> Vec<String> {
        self.group().members.keys().cloned().collect()
    }

    /// Confirmed ownership. Partitions in the middle of a handoff are absent.
    pub fn assignments(&self) -> HashMap<PartitionId, String> {
        self.group().assignments.clone()
    }

    pub fn assignments_for(&self, member_id: &str) -> Vec<PartitionId> {
        let mut owned: Vec<PartitionId> = self
            .group()
            .assignments
            .iter()
            .filter(|(_, m)| *m == member_id)
            .map(|(p, _)| *p)
            .collect();
        owned.sort_unstable();
        owned
    }

    /// Recompute assignments for the current membership and carry out the handoffs.
    pub async fn rebalance(&self) -> RebalanceSummary {
        let _guard = self.rebalance_lock.lock().await;

        let (live, current, owners) = {
            let group = self.group();
            let live: Vec<String> = group.members.keys().cloned().collect();
            let mut owners: HashMap<String, Arc<dyn PartitionOwner>> = group
                .departed
                .iter()
                .map(|(id, owner)| (id.clone(), owner.clone()))
                .collect();
            for (id, member) in &group.members {
                owners.insert(id.clone(), member.owner.clone());
            }
            (live, group.assignments.clone(), owners)
        };

        let desired = self
            .strategy
            .compute_assignments(&current, &live, &self.partitions);
        let handoffs = compute_required_handoffs(&current, &desired, &self.partitions);
        let mut summary = RebalanceSummary::default();

        if handoffs.is_empty() {
            tracing::debug!(group = %self.consumer_group, "no handoffs needed");
            self.forget_departed();
            return summary;
        }
        tracing::info!(
            group = %self.consumer_group,
            members = live.len(),
            handoffs = handoffs.len(),
            "rebalancing partitions"
        );

        // Revoke first, so a partition is never handed to its new owner while the old one
        // may still be delivering.
        let revocations = handoffs.iter().filter_map(|handoff| {
            let from = handoff.from.as_ref()?;
            let owner = owners.get(from)?.clone();
            Some(self.revoke(owner, from.clone(), handoff.partition))
        });
        for acknowledged in join_all(revocations).await {
            if !acknowledged {
                summary.forced += 1;
            }
        }
        {
            let mut group = self.group();
            for handoff in &handoffs {
                group.assignments.remove(&handoff.partition);
            }
        }

        for handoff in &handoffs {
            let Some(to) = &handoff.to else {
                tracing::warn!(partition = handoff.partition, "no member left to take partition");
                continue;
            };
            let Some(owner) = owners.get(to) else {
                continue;
            };
            let checkpoint = self.read_checkpoint(handoff.partition).await;

            match owner.assign(handoff.partition, checkpoint).await {
                Ok(()) => {
                    tracing::info!(
                        partition = handoff.partition,
                        from = ?handoff.from,
                        to = %to,
                        "partition assigned"
                    );
                    self.group().assignments.insert(handoff.partition, to.clone());
                    summary.moved += 1;
                }
                Err(e) => {
                    tracing::warn!(partition = handoff.partition, member = %to, error = %e, "assignment failed");
                    summary.failed += 1;
                }
            }
        }

        self.forget_departed();
        metrics::counter!(REBALANCES).increment(1);
        if summary.failed > 0 {
            // Failed assignments leave partitions unowned; try again on the next pass.
            self.changed.notify_one();
        }
        summary
    }

    /// Returns whether the owner acknowledged in time.
    async fn revoke(&self, owner: Arc<dyn PartitionOwner>, member: String, partition: PartitionId) -> bool {
        let timeout = self.config.revocation_timeout;
        match tokio::time::timeout(timeout, owner.revoke(partition)).await {
            Ok(Ok(())) => {
                tracing::debug!(partition, member = %member, "revocation acknowledged");
                true
            }
            Ok(Err(e)) => {
                tracing::warn!(partition, member = %member, error = %e, "revocation failed, reassigning anyway");
                false
            }
            Err(_) => {
                let error = Error::RevocationTimeout { partition, timeout };
                tracing::warn!(member = %member, error = %error, "forcing reassignment");
                metrics::counter!(REVOCATION_TIMEOUTS).increment(1);
                false
            }
        }
    }

    async fn read_checkpoint(&self, partition: PartitionId) -> Option<Checkpoint> {
        let store = self.store.as_ref()?;
        match store.read(partition).await {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                tracing::warn!(partition, error = %e, "could not read checkpoint, new owner starts without it");
                None
            }
        }
    }

    fn forget_departed(&self) {
        let mut group = self.group();
        let holding: HashSet<String> = group.assignments.values().cloned().collect();
        group.departed.retain(|id, _| holding.contains(id));
    }

    /// Run the coordination loop until `cancel` fires: check heartbeats periodically and
    /// rebalance after membership changes.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = self.changed.notified() => {
                    // Let members joining together settle into a single rebalance.
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(self.config.rebalance_debounce_interval) => {}
                    }
                }
                _ = ticker.tick() => {
                    self.expire_members();
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                summary = self.rebalance() => {
                    if summary.moved > 0 || summary.forced > 0 || summary.failed > 0 {
                        tracing::info!(
                            group = %self.consumer_group,
                            moved = summary.moved,
                            forced = summary.forced,
                            failed = summary.failed,
                            "rebalance finished"
                        );
                    }
                }
            }
        }
    }
}

// ── Pure functions ──────────────────────────────────────────────

/// Compare current and desired assignments to find the partitions that change hands,
/// ordered by partition id.
pub fn compute_required_handoffs(
    current: &HashMap<PartitionId, String>,
    desired: &HashMap<PartitionId, String>,
    partitions: &[PartitionId],
) -> Vec<Handoff> {
    let mut handoffs: Vec<Handoff> = partitions
        .iter()
        .filter_map(|partition| {
            let from = current.get(partition);
            let to = desired.get(partition);
            if from == to {
                return None;
            }
            Some(Handoff {
                partition: *partition,
                from: from.cloned(),
                to: to.cloned(),
            })
        })
        .collect();
    handoffs.sort_by_key(|h| h.partition);
    handoffs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_required_handoffs_no_change() {
        let mut current = HashMap::new();
        current.insert(0, "member-0".to_string());
        current.insert(1, "member-1".to_string());
        let desired = current.clone();
        assert!(compute_required_handoffs(&current, &desired, &[0, 1]).is_empty());
    }

    #[test]
    fn compute_required_handoffs_detects_moves() {
        let mut current = HashMap::new();
        current.insert(0, "member-0".to_string());
        current.insert(1, "member-0".to_string());

        let mut desired = HashMap::new();
        desired.insert(0, "member-0".to_string());
        desired.insert(1, "member-1".to_string());

        let handoffs = compute_required_handoffs(&current, &desired, &[0, 1]);
        assert_eq!(
            handoffs,
            vec![Handoff {
                partition: 1,
                from: Some("member-0".to_string()),
                to: Some("member-1".to_string()),
            }]
        );
    }

    #[test]
    fn compute_required_handoffs_includes_unowned_and_orphaned() {
        let mut current = HashMap::new();
        current.insert(1, "member-0".to_string());
        let mut desired = HashMap::new();
        desired.insert(0, "member-1".to_string());

        let handoffs = compute_required_handoffs(&current, &desired, &[0, 1]);
        assert_eq!(handoffs.len(), 2);
        assert_eq!((handoffs[0].partition, handoffs[0].from.as_deref()), (0, None));
        assert_eq!((handoffs[1].partition, handoffs[1].to.as_deref()), (1, None));
    }

    #[derive(Default)]
    struct TestOwner {
        owned: Mutex<Vec<PartitionId>>,
        checkpoints: Mutex<Vec<Option<u64>>>,
        hang_on_revoke: bool,
    }

    impl TestOwner {
        fn hanging() -> Self {
            Self {
                hang_on_revoke: true,
                ..Default::default()
            }
        }

        fn owned(&self) -> Vec<PartitionId> {
            let mut owned = self.owned.lock().unwrap().clone();
            owned.sort_unstable();
            owned
        }
    }

    #[async_trait]
    impl PartitionOwner for TestOwner {
        async fn assign(&self, partition: PartitionId, checkpoint: Option<Checkpoint>) -> Result<()> {
            self.owned.lock().unwrap().push(partition);
            self.checkpoints
                .lock()
                .unwrap()
                .push(checkpoint.map(|c| c.offset));
            Ok(())
        }

        async fn revoke(&self, partition: PartitionId) -> Result<()> {
            if self.hang_on_revoke {
                std::future::pending::<()>().await;
            }
            self.owned.lock().unwrap().retain(|p| *p != partition);
            Ok(())
        }
    }

    fn config() -> CoordinatorConfig {
        CoordinatorConfig {
            revocation_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn two_members_split_partitions_evenly() {
        let coordinator = Coordinator::new("$Default", vec![0, 1, 2, 3], config());
        let a = Arc::new(TestOwner::default());
        let b = Arc::new(TestOwner::default());
        coordinator.join("a", a.clone());
        coordinator.join("b", b.clone());

        let summary = coordinator.rebalance().await;

        assert_eq!(summary.moved, 4);
        assert_eq!(a.owned(), vec![0, 1]);
        assert_eq!(b.owned(), vec![2, 3]);
        assert_eq!(coordinator.assignments_for("b"), vec![2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn departed_member_loses_partitions_after_revocation_timeout() {
        let coordinator = Coordinator::new("$Default", vec![0, 1, 2, 3], config());
        let a = Arc::new(TestOwner::default());
        let b = Arc::new(TestOwner::hanging());
        coordinator.join("a", a.clone());
        coordinator.join("b", b.clone());
        coordinator.rebalance().await;
        assert_eq!(b.owned(), vec![2, 3]);

        coordinator.leave("b");
        let started = Instant::now();
        let summary = coordinator.rebalance().await;

        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(summary.forced, 2);
        assert_eq!(a.owned(), vec![0, 1, 2, 3]);
        assert_eq!(coordinator.assignments_for("a"), vec![0, 1, 2, 3]);
        assert!(coordinator.assignments_for("b").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_members_expire() {
        let coordinator = Coordinator::new("$Default", vec![0, 1], config());
        coordinator.join("a", Arc::new(TestOwner::default()));
        coordinator.join("b", Arc::new(TestOwner::default()));

        tokio::time::advance(Duration::from_secs(20)).await;
        coordinator.heartbeat("a").unwrap();
        tokio::time::advance(Duration::from_secs(15)).await;

        assert_eq!(coordinator.expire_members(), vec!["b".to_string()]);
        assert_eq!(coordinator.members(), vec!["a".to_string()]);
        assert!(coordinator.heartbeat("b").is_err());
    }

    #[tokio::test]
    async fn new_owner_receives_stored_checkpoint() {
        use crate::checkpoint::MemoryCheckpointBackend;

        let store = CheckpointStore::new(Arc::new(MemoryCheckpointBackend::default()), "orders", "$Default");
        let coordinator = Coordinator::new("$Default", vec![0], config()).with_checkpoint_store(store.clone());
        store.update(0, 41, "previous-owner").await.unwrap();

        let a = Arc::new(TestOwner::default());
        coordinator.join("a", a.clone());
        coordinator.rebalance().await;

        assert_eq!(*a.checkpoints.lock().unwrap(), vec![Some(41)]);
    }

    #[tokio::test(start_paused = true)]
    async fn run_rebalances_after_membership_changes() {
        let coordinator = Arc::new(Coordinator::new("$Default", vec![0, 1, 2], config()));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let coordinator = coordinator.clone();
            let cancel = cancel.clone();
            async move { coordinator.run(cancel).await }
        });

        let a = Arc::new(TestOwner::default());
        coordinator.join("a", a.clone());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(a.owned(), vec![0, 1, 2]);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn released_partition_is_assigned_again() {
        let coordinator = Coordinator::new("$Default", vec![0, 1], config());
        let a = Arc::new(TestOwner::default());
        coordinator.join("a", a.clone());
        coordinator.rebalance().await;

        assert!(!coordinator.release_partition("b", 1));
        assert!(coordinator.release_partition("a", 1));
        assert_eq!(coordinator.assignments_for("a"), vec![0]);

        let summary = coordinator.rebalance().await;
        assert_eq!(summary.moved, 1);
        assert_eq!(coordinator.assignments_for("a"), vec![0, 1]);
        assert_eq!(a.owned.lock().unwrap().iter().filter(|p| **p == 1).count(), 2);
    }

    #[test]
    fn heartbeat_from_unknown_member_fails() {
        let coordinator = Coordinator::new("$Default", vec![0], CoordinatorConfig::default());
        assert!(matches!(
            coordinator.heartbeat("ghost"),
            Err(Error::InvalidState(_))
        ));
    }
}
