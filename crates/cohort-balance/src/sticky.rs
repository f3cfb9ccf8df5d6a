//! Sticky partition assignment strategy.
//!
//! The sticky strategy guarantees an assignment that is as balanced as
//! possible while preserving as many existing partition placements as it
//! can. Members carry their previous assignment between rebalances inside
//! the user data blob (see [`crate::user_data`]); conflicting prior claims
//! on a partition are resolved by generation, higher generation winning.
//!
//! Planning runs in phases: decode prior state, build the bipartite
//! subscription graph, hand out partitions nobody owns, then migrate single
//! partitions from over-loaded to under-loaded members until no movement
//! improves the balance. The movement trace from the last plan stays on the
//! strategy value for diagnostics.

use crate::movement::PartitionMovements;
use crate::strategy::BalanceStrategy;
use crate::user_data::decode_user_data;
use cohort_common::{MemberMetadata, Plan, Result, TopicPartition};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

/// Previous claimant of a partition, kept so the balancer can tell that a
/// partition changed hands in a recent generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerGenerationPair {
    pub generation: i32,
    pub member_id: String,
}

type CurrentAssignment = BTreeMap<String, Vec<TopicPartition>>;
type PrevAssignments = BTreeMap<TopicPartition, ConsumerGenerationPair>;
type PartitionConsumers = BTreeMap<TopicPartition, Vec<String>>;
type ConsumerPartitions = BTreeMap<String, Vec<TopicPartition>>;
type PartitionOwners = BTreeMap<TopicPartition, String>;

/// Sticky assignment strategy.
///
/// The strategy value is reusable across plans but not across threads; the
/// movement trace is instance state, rewritten by every [`plan`] call.
///
/// [`plan`]: BalanceStrategy::plan
#[derive(Debug, Default)]
pub struct StickyStrategy {
    movements: PartitionMovements,
}

impl StickyStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when the last plan kept partitions on their prior owners
    /// wherever balance allowed.
    pub fn is_sticky(&self) -> bool {
        self.movements.is_sticky()
    }

    /// Net partition movements recorded for the last plan, as
    /// (partition, from, to).
    pub fn movements(&self) -> Vec<(TopicPartition, String, String)> {
        self.movements.moves()
    }

    #[allow(clippy::too_many_arguments)]
    fn balance(
        &mut self,
        current_assignment: &mut CurrentAssignment,
        prev_assignments: &PrevAssignments,
        sorted_partitions: &[TopicPartition],
        consumer_partitions: &ConsumerPartitions,
        partition_consumers: &PartitionConsumers,
        partition_owners: &mut PartitionOwners,
        initializing: bool,
    ) {
        // only partitions with at least two potential consumers can move
        let reassignable: Vec<TopicPartition> = sorted_partitions
            .iter()
            .filter(|tp| partition_consumers.get(*tp).map_or(0, |c| c.len()) > 1)
            .cloned()
            .collect();

        // members whose assignment cannot change sit out of the balancing
        // loop and keep what they have
        let fixed_members: Vec<String> = consumer_partitions
            .keys()
            .filter(|member_id| {
                !can_consumer_participate_in_reassignment(
                    member_id,
                    current_assignment,
                    consumer_partitions,
                    partition_consumers,
                )
            })
            .cloned()
            .collect();
        let mut fixed_assignments = CurrentAssignment::new();
        for member_id in fixed_members {
            if let Some(partitions) = current_assignment.remove(&member_id) {
                fixed_assignments.insert(member_id, partitions);
            }
        }

        let pre_balance_assignment = current_assignment.clone();
        let pre_balance_owners = partition_owners.clone();
        let pre_balance_movements = self.movements.clone();

        let reassigned = self.perform_reassignments(
            &reassignable,
            current_assignment,
            prev_assignments,
            consumer_partitions,
            partition_consumers,
            partition_owners,
        );

        // on a reassignment, keep the result only if it actually improved
        // the balance score
        if !initializing
            && reassigned
            && balance_score(current_assignment) >= balance_score(&pre_balance_assignment)
        {
            *current_assignment = pre_balance_assignment;
            *partition_owners = pre_balance_owners;
            self.movements = pre_balance_movements;
        }

        for (member_id, partitions) in fixed_assignments {
            current_assignment.insert(member_id, partitions);
        }
    }

    fn perform_reassignments(
        &mut self,
        reassignable: &[TopicPartition],
        current_assignment: &mut CurrentAssignment,
        prev_assignments: &PrevAssignments,
        consumer_partitions: &ConsumerPartitions,
        partition_consumers: &PartitionConsumers,
        partition_owners: &mut PartitionOwners,
    ) -> bool {
        let mut reassignment_performed = false;
        let mut modified = true;

        // repeat until no partition can be moved to improve the balance
        while modified {
            modified = false;
            for tp in reassignable {
                if is_balanced(current_assignment, consumer_partitions) {
                    break;
                }

                let Some(owner) = partition_owners.get(tp).cloned() else {
                    warn!(
                        "partition {}/{} has no owner during balancing",
                        tp.topic, tp.partition
                    );
                    continue;
                };
                // owners outside the balancing scope hold their partitions
                let Some(owner_count) = current_assignment.get(&owner).map(|p| p.len()) else {
                    continue;
                };

                // hand the partition back to its previous owner when that
                // owner is eligible and measurably less loaded
                if let Some(prev) = prev_assignments.get(tp) {
                    if let Some(prev_partitions) = current_assignment.get(&prev.member_id) {
                        if owner_count > prev_partitions.len() + 1
                            && is_eligible(consumer_partitions, &prev.member_id, tp)
                        {
                            let new_owner = prev.member_id.clone();
                            self.reassign_partition_to(
                                tp,
                                new_owner,
                                current_assignment,
                                partition_owners,
                            );
                            reassignment_performed = true;
                            modified = true;
                            continue;
                        }
                    }
                }

                // otherwise move it to the least loaded eligible member
                for other in &partition_consumers[tp] {
                    let Some(other_count) = current_assignment.get(other).map(|p| p.len()) else {
                        continue;
                    };
                    if owner_count > other_count + 1 {
                        self.reassign_partition(
                            tp,
                            current_assignment,
                            consumer_partitions,
                            partition_owners,
                        );
                        reassignment_performed = true;
                        modified = true;
                        break;
                    }
                }
            }
        }
        reassignment_performed
    }

    fn reassign_partition(
        &mut self,
        partition: &TopicPartition,
        current_assignment: &mut CurrentAssignment,
        consumer_partitions: &ConsumerPartitions,
        partition_owners: &mut PartitionOwners,
    ) {
        // the least loaded eligible member takes the partition
        let new_owner = sort_member_ids_by_assignments(current_assignment)
            .into_iter()
            .find(|member_id| is_eligible(consumer_partitions, member_id, partition));
        if let Some(new_owner) = new_owner {
            self.reassign_partition_to(partition, new_owner, current_assignment, partition_owners);
        }
    }

    fn reassign_partition_to(
        &mut self,
        partition: &TopicPartition,
        new_owner: String,
        current_assignment: &mut CurrentAssignment,
        partition_owners: &mut PartitionOwners,
    ) {
        let Some(old_owner) = partition_owners.get(partition).cloned() else {
            return;
        };
        // moving a partition that would undo an earlier movement of another
        // partition of the same topic moves that one back instead
        let moved = self
            .movements
            .actual_partition_to_move(partition, &old_owner, &new_owner);
        self.process_partition_movement(&moved, &new_owner, current_assignment, partition_owners);
    }

    fn process_partition_movement(
        &mut self,
        partition: &TopicPartition,
        new_owner: &str,
        current_assignment: &mut CurrentAssignment,
        partition_owners: &mut PartitionOwners,
    ) {
        if let Some(old_owner) = partition_owners.get(partition).cloned() {
            self.movements.move_partition(partition, &old_owner, new_owner);
            if let Some(partitions) = current_assignment.get_mut(&old_owner) {
                *partitions = remove_partition_from_assignments(partitions, partition);
            }
        }
        current_assignment
            .entry(new_owner.to_string())
            .or_default()
            .push(partition.clone());
        partition_owners.insert(partition.clone(), new_owner.to_string());
    }
}

impl BalanceStrategy for StickyStrategy {
    fn name(&self) -> &'static str {
        "sticky"
    }

    fn plan(
        &mut self,
        members: &HashMap<String, MemberMetadata>,
        topics: &HashMap<String, Vec<i32>>,
    ) -> Result<Plan> {
        self.movements = PartitionMovements::default();

        // prior state carried in the members' user data blobs
        let (mut current_assignment, prev_assignments) = prepopulate_current_assignments(members);
        let is_fresh = current_assignment.is_empty();

        let (partition_consumers, consumer_partitions) = build_subscription_graph(members, topics);

        // drop prior claims that are no longer assignable to their owner,
        // whether the topic is gone or the subscription was revoked
        for (member_id, partitions) in current_assignment.iter_mut() {
            partitions.retain(|tp| {
                partition_consumers.contains_key(tp)
                    && is_eligible(&consumer_partitions, member_id, tp)
            });
        }
        for member_id in members.keys() {
            current_assignment.entry(member_id.clone()).or_default();
        }

        let mut partition_owners = PartitionOwners::new();
        for (member_id, partitions) in &current_assignment {
            for tp in partitions {
                partition_owners.insert(tp.clone(), member_id.clone());
            }
        }

        let sorted_partitions = sort_partitions(
            &current_assignment,
            &prev_assignments,
            is_fresh,
            &partition_consumers,
            &consumer_partitions,
        );

        let mut sorted_members = sort_member_ids_by_assignments(&current_assignment);
        let initializing = sorted_members
            .first()
            .map_or(true, |member_id| current_assignment[member_id].is_empty());

        // hand out everything nobody owns
        for tp in &sorted_partitions {
            if partition_owners.contains_key(tp) {
                continue;
            }
            sorted_members = assign_partition(
                tp,
                sorted_members,
                &mut current_assignment,
                &consumer_partitions,
                &mut partition_owners,
            );
        }

        self.balance(
            &mut current_assignment,
            &prev_assignments,
            &sorted_partitions,
            &consumer_partitions,
            &partition_consumers,
            &mut partition_owners,
            initializing,
        );

        let mut plan = Plan::with_capacity(members.len());
        for member_id in members.keys() {
            plan.insert(member_id.clone(), HashMap::new());
        }
        for (member_id, partitions) in &current_assignment {
            let Some(member_plan) = plan.get_mut(member_id) else {
                continue;
            };
            for tp in partitions {
                member_plan
                    .entry(tp.topic.clone())
                    .or_default()
                    .push(tp.partition);
            }
        }
        for member_plan in plan.values_mut() {
            for partitions in member_plan.values_mut() {
                partitions.sort_unstable();
            }
        }

        debug!(
            "sticky plan covers {} members and {} partitions with {} net movements",
            plan.len(),
            partition_owners.len(),
            self.movements.moves().len()
        );

        Ok(plan)
    }
}

/// Decode every member's prior assignment and resolve conflicting claims.
///
/// The newest unambiguous claim on a partition names its current owner; the
/// claim before that is returned separately so the balancer knows the
/// partition changed hands recently. Two members claiming a partition at the
/// same generation cancel each other out, and malformed user data reads as
/// empty prior state.
fn prepopulate_current_assignments(
    members: &HashMap<String, MemberMetadata>,
) -> (CurrentAssignment, PrevAssignments) {
    // claims per partition, keyed by generation; `None` marks a generation
    // claimed by more than one member
    let mut claims: BTreeMap<TopicPartition, BTreeMap<i32, Option<String>>> = BTreeMap::new();

    let mut member_ids: Vec<&String> = members.keys().collect();
    member_ids.sort();

    for member_id in member_ids {
        let meta = &members[member_id];
        if meta.user_data.is_empty() {
            continue;
        }
        let user_data = match decode_user_data(&meta.user_data) {
            Ok(user_data) => user_data,
            Err(e) => {
                warn!(
                    "ignoring malformed user data from member {}: {}",
                    member_id, e
                );
                continue;
            }
        };

        let generation = user_data.generation_or_default();
        for tp in user_data.partitions() {
            match claims.entry(tp.clone()).or_default().entry(generation) {
                Entry::Vacant(slot) => {
                    slot.insert(Some(member_id.clone()));
                }
                Entry::Occupied(mut slot) => {
                    if slot.get().as_deref() != Some(member_id.as_str()) {
                        warn!(
                            "conflicting claims on {}/{} at generation {}",
                            tp.topic, tp.partition, generation
                        );
                        slot.insert(None);
                    }
                }
            }
        }
    }

    let mut current_assignment = CurrentAssignment::new();
    let mut prev_assignments = PrevAssignments::new();
    for (tp, generations) in &claims {
        let mut owners = generations
            .iter()
            .rev()
            .filter_map(|(generation, owner)| owner.as_ref().map(|owner| (*generation, owner)));

        if let Some((_, owner)) = owners.next() {
            current_assignment
                .entry(owner.clone())
                .or_default()
                .push(tp.clone());
        }
        if let Some((generation, owner)) = owners.next() {
            prev_assignments.insert(
                tp.clone(),
                ConsumerGenerationPair {
                    generation,
                    member_id: owner.clone(),
                },
            );
        }
    }

    (current_assignment, prev_assignments)
}

/// Build both directions of the bipartite subscription graph.
///
/// Topics a member lists but that are not present in `topics` are ignored;
/// duplicate partition ids and duplicate subscription entries collapse.
fn build_subscription_graph(
    members: &HashMap<String, MemberMetadata>,
    topics: &HashMap<String, Vec<i32>>,
) -> (PartitionConsumers, ConsumerPartitions) {
    let mut normalized: BTreeMap<&str, Vec<i32>> = BTreeMap::new();
    for (topic, partitions) in topics {
        let mut ids = partitions.clone();
        ids.sort_unstable();
        ids.dedup();
        normalized.insert(topic, ids);
    }

    let mut partition_consumers = PartitionConsumers::new();
    for (topic, partitions) in &normalized {
        for &partition in partitions {
            partition_consumers.insert(TopicPartition::new(*topic, partition), Vec::new());
        }
    }

    let mut consumer_partitions = ConsumerPartitions::new();
    let mut member_ids: Vec<&String> = members.keys().collect();
    member_ids.sort();

    for member_id in member_ids {
        let mut eligible = Vec::new();
        let mut seen = BTreeSet::new();
        for topic in &members[member_id].topics {
            if !seen.insert(topic.as_str()) {
                continue;
            }
            let Some(partitions) = normalized.get(topic.as_str()) else {
                continue;
            };
            for &partition in partitions {
                let tp = TopicPartition::new(topic, partition);
                if let Some(consumers) = partition_consumers.get_mut(&tp) {
                    consumers.push(member_id.clone());
                }
                eligible.push(tp);
            }
        }
        consumer_partitions.insert(member_id.clone(), eligible);
    }

    (partition_consumers, consumer_partitions)
}

fn is_eligible(
    consumer_partitions: &ConsumerPartitions,
    member_id: &str,
    partition: &TopicPartition,
) -> bool {
    consumer_partitions
        .get(member_id)
        .is_some_and(|eligible| eligible.contains(partition))
}

/// True iff every partition could go to the same member set and every member
/// could take the same partition set, ignoring order. Empty graphs count as
/// identical.
fn are_subscriptions_identical(
    partition_consumers: &PartitionConsumers,
    consumer_partitions: &ConsumerPartitions,
) -> bool {
    let mut consumer_sets = partition_consumers
        .values()
        .map(|consumers| consumers.iter().collect::<BTreeSet<_>>());
    if let Some(first) = consumer_sets.next() {
        if !consumer_sets.all(|set| set == first) {
            return false;
        }
    }

    let mut partition_sets = consumer_partitions
        .values()
        .map(|partitions| partitions.iter().collect::<BTreeSet<_>>());
    if let Some(first) = partition_sets.next() {
        if !partition_sets.all(|set| set == first) {
            return false;
        }
    }

    true
}

/// Order partitions for assignment and balancing.
///
/// On a fresh plan over a uniform graph the order is plain lexicographic.
/// On a reassignment over a uniform graph, members are drained from most
/// loaded to least, preferring partitions that changed hands in an earlier
/// generation, so those are revisited first. Otherwise partitions go rarest
/// first, by how few members could take them.
fn sort_partitions(
    current_assignment: &CurrentAssignment,
    prev_assignments: &PrevAssignments,
    is_fresh: bool,
    partition_consumers: &PartitionConsumers,
    consumer_partitions: &ConsumerPartitions,
) -> Vec<TopicPartition> {
    let identical = are_subscriptions_identical(partition_consumers, consumer_partitions);

    if is_fresh && identical {
        return partition_consumers.keys().cloned().collect();
    }

    if identical {
        let mut assignments =
            filter_assigned_partitions(current_assignment, partition_consumers);
        let mut sorted = Vec::with_capacity(partition_consumers.len());
        let mut emitted = BTreeSet::new();

        loop {
            let next = assignments
                .iter()
                .filter(|(_, partitions)| !partitions.is_empty())
                .min_by(|(a_id, a), (b_id, b)| {
                    b.len().cmp(&a.len()).then_with(|| a_id.cmp(b_id))
                })
                .map(|(member_id, _)| member_id.clone());
            let Some(member_id) = next else {
                break;
            };
            let Some(partitions) = assignments.get_mut(&member_id) else {
                break;
            };

            let index = partitions
                .iter()
                .position(|tp| prev_assignments.contains_key(tp))
                .unwrap_or(0);
            let tp = partitions.remove(index);
            emitted.insert(tp.clone());
            sorted.push(tp);
        }

        for tp in partition_consumers.keys() {
            if !emitted.contains(tp) {
                sorted.push(tp.clone());
            }
        }
        return sorted;
    }

    let mut sorted: Vec<TopicPartition> = partition_consumers.keys().cloned().collect();
    sorted.sort_by(|a, b| {
        partition_consumers[a]
            .len()
            .cmp(&partition_consumers[b].len())
            .then_with(|| a.cmp(b))
    });
    sorted
}

/// Keep only the currently existing partitions of each member's assignment.
/// Members stay present even when their list empties out.
fn filter_assigned_partitions(
    current_assignment: &CurrentAssignment,
    partition_consumers: &PartitionConsumers,
) -> CurrentAssignment {
    current_assignment
        .iter()
        .map(|(member_id, partitions)| {
            let kept = partitions
                .iter()
                .filter(|tp| partition_consumers.contains_key(*tp))
                .cloned()
                .collect();
            (member_id.clone(), kept)
        })
        .collect()
}

/// Member ids ascending by (assignment size, member id).
fn sort_member_ids_by_assignments(assignments: &CurrentAssignment) -> Vec<String> {
    let mut member_ids: Vec<String> = assignments.keys().cloned().collect();
    member_ids.sort_by(|a, b| {
        assignments[a]
            .len()
            .cmp(&assignments[b].len())
            .then_with(|| a.cmp(b))
    });
    member_ids
}

/// Assign `partition` to the first eligible member in `sorted_members`,
/// returning the re-sorted member list. With no eligible member everything
/// is left untouched.
fn assign_partition(
    partition: &TopicPartition,
    sorted_members: Vec<String>,
    current_assignment: &mut CurrentAssignment,
    consumer_partitions: &ConsumerPartitions,
    partition_owners: &mut PartitionOwners,
) -> Vec<String> {
    let Some(member_id) = sorted_members
        .iter()
        .find(|member_id| is_eligible(consumer_partitions, member_id, partition))
        .cloned()
    else {
        return sorted_members;
    };

    current_assignment
        .entry(member_id.clone())
        .or_default()
        .push(partition.clone());
    partition_owners.insert(partition.clone(), member_id);
    sort_member_ids_by_assignments(current_assignment)
}

/// A member is subject to reassignment when it could still grow, or when it
/// holds a partition some other potential consumer is hungrier for.
fn can_consumer_participate_in_reassignment(
    member_id: &str,
    current_assignment: &CurrentAssignment,
    consumer_partitions: &ConsumerPartitions,
    partition_consumers: &PartitionConsumers,
) -> bool {
    let current: &[TopicPartition] = current_assignment
        .get(member_id)
        .map(|partitions| partitions.as_slice())
        .unwrap_or(&[]);
    let max_possible = consumer_partitions
        .get(member_id)
        .map_or(0, |eligible| eligible.len());

    if current.len() > max_possible {
        warn!(
            "member {} holds more partitions than it is eligible for",
            member_id
        );
    }
    if current.len() < max_possible {
        return true;
    }

    current.iter().any(|tp| {
        partition_consumers
            .get(tp)
            .into_iter()
            .flatten()
            .any(|other| {
                other != member_id
                    && current_assignment.get(other).map_or(0, |p| p.len()) < current.len()
            })
    })
}

/// True when the minimum and maximum assignment sizes differ by at most one,
/// or when no member could relieve a more loaded member of a partition it is
/// eligible for.
fn is_balanced(
    current_assignment: &CurrentAssignment,
    consumer_partitions: &ConsumerPartitions,
) -> bool {
    let sorted_members = sort_member_ids_by_assignments(current_assignment);
    let (Some(first), Some(last)) = (sorted_members.first(), sorted_members.last()) else {
        return true;
    };
    let min = current_assignment[first].len();
    let max = current_assignment[last].len();
    if min + 1 >= max {
        return true;
    }

    let mut owners: BTreeMap<&TopicPartition, &str> = BTreeMap::new();
    for (member_id, partitions) in current_assignment {
        for tp in partitions {
            if owners.insert(tp, member_id).is_some() {
                warn!(
                    "partition {}/{} is assigned to more than one member",
                    tp.topic, tp.partition
                );
            }
        }
    }

    for member_id in &sorted_members {
        let count = current_assignment[member_id].len();
        let Some(potential) = consumer_partitions.get(member_id) else {
            continue;
        };
        if count == potential.len() {
            continue;
        }
        for tp in potential {
            if current_assignment[member_id].contains(tp) {
                continue;
            }
            if let Some(owner) = owners.get(tp) {
                if count < current_assignment[*owner].len() {
                    return false;
                }
            }
        }
    }
    true
}

/// Sum of pairwise assignment-count differences; zero is perfectly balanced
/// and lower is better.
fn balance_score(assignment: &CurrentAssignment) -> i64 {
    let counts: Vec<i64> = assignment
        .values()
        .map(|partitions| partitions.len() as i64)
        .collect();
    let mut score = 0;
    for (i, a) in counts.iter().enumerate() {
        for b in &counts[i + 1..] {
            score += (a - b).abs();
        }
    }
    score
}

/// New sequence with every occurrence of `partition` removed.
fn remove_partition_from_assignments(
    assignments: &[TopicPartition],
    partition: &TopicPartition,
) -> Vec<TopicPartition> {
    assignments
        .iter()
        .filter(|tp| *tp != partition)
        .cloned()
        .collect()
}
