//! Partition movement tracking for the sticky strategy.
//!
//! While a plan is being balanced the same partition may be handed around
//! more than once. The tracker collapses those hops into net movements and
//! detects when two members would end up trading partitions of one topic
//! back and forth, which is exactly the movement the sticky strategy is
//! supposed to avoid.

use cohort_common::TopicPartition;
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// Source and destination of one partition movement.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConsumerPair {
    pub src: String,
    pub dst: String,
}

/// Records partition movements made while balancing a plan.
#[derive(Debug, Clone, Default)]
pub struct PartitionMovements {
    /// Topic -> movement pair -> partitions that moved along that pair
    by_topic: BTreeMap<String, BTreeMap<ConsumerPair, BTreeSet<TopicPartition>>>,
    /// Partition -> its net movement
    movements: BTreeMap<TopicPartition, ConsumerPair>,
}

impl PartitionMovements {
    /// Record that `partition` moved from `old_owner` to `new_owner`.
    ///
    /// A partition that moves a second time keeps a single record from its
    /// original owner; a partition that returns to its original owner loses
    /// its record entirely.
    pub fn move_partition(&mut self, partition: &TopicPartition, old_owner: &str, new_owner: &str) {
        if let Some(existing) = self.remove_movement_record(partition) {
            if existing.dst != old_owner {
                warn!(
                    "movement record for {}/{} points at {} but the partition moved from {}",
                    partition.topic, partition.partition, existing.dst, old_owner
                );
            }
            if existing.src != new_owner {
                self.add_movement_record(
                    partition,
                    ConsumerPair {
                        src: existing.src,
                        dst: new_owner.to_string(),
                    },
                );
            }
        } else {
            self.add_movement_record(
                partition,
                ConsumerPair {
                    src: old_owner.to_string(),
                    dst: new_owner.to_string(),
                },
            );
        }
    }

    /// Pick the partition that should actually move when `partition` is about
    /// to go from `old_owner` to `new_owner`.
    ///
    /// When another partition of the same topic already moved along the
    /// reverse pair, moving that one back preserves more of the previous
    /// assignment; otherwise `partition` itself moves.
    pub fn actual_partition_to_move(
        &self,
        partition: &TopicPartition,
        old_owner: &str,
        new_owner: &str,
    ) -> TopicPartition {
        let Some(pairs) = self.by_topic.get(&partition.topic) else {
            return partition.clone();
        };

        let src = match self.movements.get(partition) {
            Some(existing) => existing.src.clone(),
            None => old_owner.to_string(),
        };
        let reverse = ConsumerPair {
            src: new_owner.to_string(),
            dst: src,
        };

        match pairs.get(&reverse).and_then(|partitions| partitions.iter().next()) {
            Some(reverse_partition) => reverse_partition.clone(),
            None => partition.clone(),
        }
    }

    /// Net movements recorded for the last plan, as (partition, from, to).
    pub fn moves(&self) -> Vec<(TopicPartition, String, String)> {
        self.movements
            .iter()
            .map(|(partition, pair)| (partition.clone(), pair.src.clone(), pair.dst.clone()))
            .collect()
    }

    /// True when no topic's net movements contain a cycle between a pair of
    /// members, i.e. no partitions were traded back and forth.
    pub fn is_sticky(&self) -> bool {
        for (topic, movements) in &self.by_topic {
            let pairs: Vec<ConsumerPair> = movements.keys().cloned().collect();
            if Self::has_cycles(&pairs) {
                warn!("stickiness violated by a movement cycle in topic {}", topic);
                return false;
            }
        }
        true
    }

    fn add_movement_record(&mut self, partition: &TopicPartition, pair: ConsumerPair) {
        self.movements.insert(partition.clone(), pair.clone());
        self.by_topic
            .entry(partition.topic.clone())
            .or_default()
            .entry(pair)
            .or_default()
            .insert(partition.clone());
    }

    fn remove_movement_record(&mut self, partition: &TopicPartition) -> Option<ConsumerPair> {
        let pair = self.movements.remove(partition)?;
        if let Some(pairs) = self.by_topic.get_mut(&partition.topic) {
            if let Some(partitions) = pairs.get_mut(&pair) {
                partitions.remove(partition);
                if partitions.is_empty() {
                    pairs.remove(&pair);
                }
            }
            if pairs.is_empty() {
                self.by_topic.remove(&partition.topic);
            }
        }
        Some(pair)
    }

    fn has_cycles(pairs: &[ConsumerPair]) -> bool {
        let mut cycles: Vec<Vec<String>> = Vec::new();
        for (i, pair) in pairs.iter().enumerate() {
            let mut reduced = pairs.to_vec();
            reduced.remove(i);
            let path = vec![pair.src.clone()];
            let (path, linked) = Self::is_linked(&pair.dst, &pair.src, &reduced, path);
            if linked && !cycles.contains(&path) {
                cycles.push(path);
            }
        }

        // A cycle over two members means partitions of the topic were traded
        // back and forth. Longer cycles are vanishingly rare with this
        // algorithm and are not treated as violations.
        cycles.iter().any(|cycle| cycle.len() == 3)
    }

    fn is_linked(
        src: &str,
        dst: &str,
        pairs: &[ConsumerPair],
        mut path: Vec<String>,
    ) -> (Vec<String>, bool) {
        if src == dst || pairs.is_empty() {
            return (path, false);
        }

        if pairs.iter().any(|pair| pair.src == src && pair.dst == dst) {
            path.push(src.to_string());
            path.push(dst.to_string());
            return (path, true);
        }

        for (i, pair) in pairs.iter().enumerate() {
            if pair.src == src {
                let mut reduced = pairs.to_vec();
                reduced.remove(i);
                path.push(src.to_string());
                return Self::is_linked(&pair.dst, dst, &reduced, path);
            }
        }

        (path, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tp(topic: &str, partition: i32) -> TopicPartition {
        TopicPartition::new(topic, partition)
    }

    #[test]
    fn test_single_move_is_sticky() {
        let mut movements = PartitionMovements::default();
        movements.move_partition(&tp("t1", 0), "c1", "c2");

        assert!(movements.is_sticky());
        assert_eq!(
            movements.moves(),
            vec![(tp("t1", 0), "c1".to_string(), "c2".to_string())]
        );
    }

    #[test]
    fn test_chained_moves_collapse() {
        let mut movements = PartitionMovements::default();
        movements.move_partition(&tp("t1", 0), "c1", "c2");
        movements.move_partition(&tp("t1", 0), "c2", "c3");

        assert_eq!(
            movements.moves(),
            vec![(tp("t1", 0), "c1".to_string(), "c3".to_string())]
        );
        assert!(movements.is_sticky());
    }

    #[test]
    fn test_move_back_erases_record() {
        let mut movements = PartitionMovements::default();
        movements.move_partition(&tp("t1", 0), "c1", "c2");
        movements.move_partition(&tp("t1", 0), "c2", "c1");

        assert!(movements.moves().is_empty());
        assert!(movements.is_sticky());
    }

    #[test]
    fn test_trade_between_two_members_is_not_sticky() {
        let mut movements = PartitionMovements::default();
        movements.move_partition(&tp("t1", 0), "c1", "c2");
        movements.move_partition(&tp("t1", 1), "c2", "c1");

        assert!(!movements.is_sticky());
    }

    #[test]
    fn test_moves_in_different_topics_are_sticky() {
        let mut movements = PartitionMovements::default();
        movements.move_partition(&tp("t1", 0), "c1", "c2");
        movements.move_partition(&tp("t2", 0), "c2", "c1");

        assert!(movements.is_sticky());
    }

    #[test]
    fn test_actual_partition_to_move_prefers_reverse_pair() {
        let mut movements = PartitionMovements::default();
        movements.move_partition(&tp("t1", 0), "c2", "c1");

        // moving any t1 partition from c1 to c2 should move partition 0 back
        assert_eq!(
            movements.actual_partition_to_move(&tp("t1", 1), "c1", "c2"),
            tp("t1", 0)
        );
        // a different topic is unaffected
        assert_eq!(
            movements.actual_partition_to_move(&tp("t2", 1), "c1", "c2"),
            tp("t2", 1)
        );
    }
}
