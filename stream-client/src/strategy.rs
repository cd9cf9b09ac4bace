use std::collections::{HashMap, HashSet};

use crate::record::PartitionId;

/// Trait for partition assignment strategies.
///
/// The coordinator calls `compute_assignments` whenever group membership changes and diffs the
/// result against the current assignments to find the partitions that need a handoff.
pub trait AssignmentStrategy: Send + Sync {
    /// Compute the desired partition-to-member mapping.
    ///
    /// - `current`: existing partition -> member mapping (empty on first run)
    /// - `members`: sorted list of live members eligible for assignment
    /// - `partitions`: sorted list of partitions to distribute
    fn compute_assignments(
        &self,
        current: &HashMap<PartitionId, String>,
        members: &[String],
        partitions: &[PartitionId],
    ) -> HashMap<PartitionId, String>;
}

/// Splits partitions into contiguous, evenly sized runs.
///
/// Members are taken in order; the first `partitions % members` of them get one extra
/// partition, and runs are handed out by ascending partition id. The result only depends on
/// the membership, never on the current assignment.
pub struct EvenStrategy;

impl AssignmentStrategy for EvenStrategy {
    fn compute_assignments(
        &self,
        _current: &HashMap<PartitionId, String>,
        members: &[String],
        partitions: &[PartitionId],
    ) -> HashMap<PartitionId, String> {
        if members.is_empty() {
            return HashMap::new();
        }

        let mut partitions = partitions.to_vec();
        partitions.sort_unstable();
        let base = partitions.len() / members.len();
        let extra = partitions.len() % members.len();

        let mut assignments = HashMap::with_capacity(partitions.len());
        let mut remaining = partitions.into_iter();
        for (i, member) in members.iter().enumerate() {
            let share = if i < extra { base + 1 } else { base };
            for partition in remaining.by_ref().take(share) {
                assignments.insert(partition, member.clone());
            }
        }
        assignments
    }
}

/// Keeps partitions where they are as long as the balance allows.
///
/// Valid assignments stay put, members above their share give up their highest partitions,
/// and the freed or unowned partitions go, lowest id first, to the least loaded members.
/// Every member ends within one partition of the others.
pub struct StickyBalancedStrategy;

impl AssignmentStrategy for StickyBalancedStrategy {
    fn compute_assignments(
        &self,
        current: &HashMap<PartitionId, String>,
        members: &[String],
        partitions: &[PartitionId],
    ) -> HashMap<PartitionId, String> {
        if members.is_empty() {
            return HashMap::new();
        }

        let live: HashSet<&String> = members.iter().collect();
        let known: HashSet<PartitionId> = partitions.iter().copied().collect();
        let target_min = partitions.len() / members.len();
        let extra = partitions.len() % members.len();

        let mut owned: HashMap<&String, Vec<PartitionId>> =
            members.iter().map(|m| (m, Vec::new())).collect();
        for (partition, member) in current {
            if !known.contains(partition) || !live.contains(member) {
                continue;
            }
            if let Some(parts) = owned.get_mut(member) {
                parts.push(*partition);
            }
        }

        // Members already holding more get the extra slots, ties by member id.
        let mut by_load: Vec<&String> = members.iter().collect();
        by_load.sort_by(|a, b| owned[*b].len().cmp(&owned[*a].len()).then_with(|| a.cmp(b)));
        let targets: HashMap<&String, usize> = by_load
            .iter()
            .enumerate()
            .map(|(i, m)| (*m, if i < extra { target_min + 1 } else { target_min }))
            .collect();

        let mut pool: Vec<PartitionId> = Vec::new();
        for member in &by_load {
            let Some(parts) = owned.get_mut(*member) else {
                continue;
            };
            parts.sort_unstable();
            let target = targets[*member];
            if parts.len() > target {
                pool.extend(parts.drain(target..));
            }
        }

        let held: HashSet<PartitionId> = owned.values().flatten().copied().collect();
        let unowned: Vec<PartitionId> = partitions
            .iter()
            .copied()
            .filter(|p| !held.contains(p))
            .collect();
        pool.extend(unowned);
        pool.sort_unstable();
        pool.dedup();

        let mut pool = pool.into_iter();
        let mut by_need: Vec<&String> = members.iter().collect();
        by_need.sort_by(|a, b| owned[*a].len().cmp(&owned[*b].len()).then_with(|| a.cmp(b)));
        for member in by_need {
            let target = targets[member];
            let Some(parts) = owned.get_mut(member) else {
                continue;
            };
            while parts.len() < target {
                match pool.next() {
                    Some(partition) => parts.push(partition),
                    None => break,
                }
            }
        }

        owned
            .into_iter()
            .flat_map(|(member, parts)| parts.into_iter().map(move |p| (p, member.clone())))
            .collect()
    }
}
