//! Assignment strategy trait and the stateless range / round-robin
//! strategies.

use crate::sticky::StickyStrategy;
use cohort_common::types::plan_add;
use cohort_common::{MemberMetadata, Plan, Result, TopicPartition};
use std::collections::{BTreeSet, HashMap};

/// A partition assignment strategy, run by the elected group leader during
/// a rebalance.
pub trait BalanceStrategy {
    /// Protocol name announced to the coordinator.
    fn name(&self) -> &'static str;

    /// Produce an assignment plan for the given members and topic
    /// partitions.
    ///
    /// Every input member id appears in the plan, possibly with an empty
    /// assignment. Topics a member lists but that are absent from `topics`
    /// are ignored; duplicate partition ids collapse.
    fn plan(
        &mut self,
        members: &HashMap<String, MemberMetadata>,
        topics: &HashMap<String, Vec<i32>>,
    ) -> Result<Plan>;
}

/// Look up a strategy by its protocol name.
pub fn strategy_by_name(name: &str) -> Option<Box<dyn BalanceStrategy>> {
    match name {
        "range" => Some(Box::new(RangeStrategy)),
        "roundrobin" => Some(Box::new(RoundRobinStrategy)),
        "sticky" => Some(Box::new(StickyStrategy::new())),
        _ => None,
    }
}

/// Empty plan covering every member.
fn empty_plan(members: &HashMap<String, MemberMetadata>) -> Plan {
    members
        .keys()
        .map(|member_id| (member_id.clone(), HashMap::new()))
        .collect()
}

/// Sorted, deduplicated partition ids of a topic.
fn sorted_partitions(partitions: &[i32]) -> Vec<i32> {
    let mut partitions = partitions.to_vec();
    partitions.sort_unstable();
    partitions.dedup();
    partitions
}

/// Assigns each topic's partitions in contiguous ascending ranges.
///
/// For each topic the subscribed members are sorted by id and the topic's
/// partitions are split into contiguous slices; when the counts do not
/// divide evenly the first members receive one extra partition.
pub struct RangeStrategy;

impl BalanceStrategy for RangeStrategy {
    fn name(&self) -> &'static str {
        "range"
    }

    fn plan(
        &mut self,
        members: &HashMap<String, MemberMetadata>,
        topics: &HashMap<String, Vec<i32>>,
    ) -> Result<Plan> {
        let mut plan = empty_plan(members);

        let mut topic_names: Vec<&String> = topics.keys().collect();
        topic_names.sort();

        for topic in topic_names {
            let mut subscribers: Vec<&String> = members
                .iter()
                .filter(|(_, meta)| meta.topics.iter().any(|t| t == topic))
                .map(|(member_id, _)| member_id)
                .collect();
            subscribers.sort();
            if subscribers.is_empty() {
                continue;
            }

            let partitions = sorted_partitions(&topics[topic]);
            if partitions.is_empty() {
                continue;
            }

            let per_member = partitions.len() / subscribers.len();
            let extra = partitions.len() % subscribers.len();

            let mut cursor = 0;
            for (i, member_id) in subscribers.iter().enumerate() {
                let step = per_member + usize::from(i < extra);
                for &partition in &partitions[cursor..cursor + step] {
                    plan_add(&mut plan, member_id, topic, partition);
                }
                cursor += step;
            }
        }

        Ok(plan)
    }
}

/// Interleaves the global partition list over the subscribed members.
///
/// Partitions are laid out in lexicographic topic order then ascending
/// partition order, and a circular cursor over the sorted member ids hands
/// each partition to the next member subscribed to its topic.
pub struct RoundRobinStrategy;

impl BalanceStrategy for RoundRobinStrategy {
    fn name(&self) -> &'static str {
        "roundrobin"
    }

    fn plan(
        &mut self,
        members: &HashMap<String, MemberMetadata>,
        topics: &HashMap<String, Vec<i32>>,
    ) -> Result<Plan> {
        let mut plan = empty_plan(members);

        let mut member_ids: Vec<&String> = members.keys().collect();
        member_ids.sort();
        if member_ids.is_empty() {
            return Ok(plan);
        }

        let all_partitions: BTreeSet<TopicPartition> = topics
            .iter()
            .flat_map(|(topic, partitions)| {
                partitions
                    .iter()
                    .map(move |&partition| TopicPartition::new(topic, partition))
            })
            .collect();

        let subscribes =
            |member_id: &str, topic: &str| members[member_id].topics.iter().any(|t| t == topic);

        let mut cursor = 0;
        for tp in &all_partitions {
            if !member_ids.iter().any(|m| subscribes(m, &tp.topic)) {
                continue;
            }
            while !subscribes(member_ids[cursor % member_ids.len()], &tp.topic) {
                cursor += 1;
            }
            plan_add(
                &mut plan,
                member_ids[cursor % member_ids.len()],
                &tp.topic,
                tp.partition,
            );
            cursor += 1;
        }

        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(subscriptions: &[(&str, &[&str])]) -> HashMap<String, MemberMetadata> {
        subscriptions
            .iter()
            .map(|(member_id, topics)| {
                (
                    member_id.to_string(),
                    MemberMetadata::new(topics.iter().map(|t| t.to_string()).collect()),
                )
            })
            .collect()
    }

    fn topics(entries: &[(&str, &[i32])]) -> HashMap<String, Vec<i32>> {
        entries
            .iter()
            .map(|(topic, partitions)| (topic.to_string(), partitions.to_vec()))
            .collect()
    }

    fn expect(entries: &[(&str, &[(&str, &[i32])])]) -> Plan {
        entries
            .iter()
            .map(|(member_id, assignment)| {
                (
                    member_id.to_string(),
                    assignment
                        .iter()
                        .map(|(topic, partitions)| (topic.to_string(), partitions.to_vec()))
                        .collect(),
                )
            })
            .collect()
    }

    #[test]
    fn test_strategy_names() {
        assert_eq!(RangeStrategy.name(), "range");
        assert_eq!(RoundRobinStrategy.name(), "roundrobin");
        assert_eq!(StickyStrategy::new().name(), "sticky");
    }

    #[test]
    fn test_strategy_by_name() {
        for name in ["range", "roundrobin", "sticky"] {
            assert_eq!(strategy_by_name(name).unwrap().name(), name);
        }
        assert!(strategy_by_name("cooperative-sticky").is_none());
    }

    #[test]
    fn test_range_symmetric() {
        let cases = [
            (
                members(&[("M1", &["T1", "T2"][..]), ("M2", &["T1", "T2"])]),
                topics(&[("T1", &[0, 1, 2, 3][..]), ("T2", &[0, 1, 2, 3])]),
                expect(&[
                    ("M1", &[("T1", &[0, 1][..]), ("T2", &[0, 1])][..]),
                    ("M2", &[("T1", &[2, 3]), ("T2", &[2, 3])]),
                ]),
            ),
            (
                members(&[("M1", &["T1", "T2"][..]), ("M2", &["T1", "T2"])]),
                topics(&[("T1", &[0, 1, 2][..]), ("T2", &[0, 1, 2])]),
                expect(&[
                    ("M1", &[("T1", &[0, 1][..]), ("T2", &[0, 1])][..]),
                    ("M2", &[("T1", &[2]), ("T2", &[2])]),
                ]),
            ),
        ];

        for (members, topics, expected) in cases {
            let plan = RangeStrategy.plan(&members, &topics).unwrap();
            assert_eq!(plan, expected);
        }
    }

    #[test]
    fn test_range_asymmetric_subscriptions() {
        let members = members(&[("M1", &["T1"][..]), ("M2", &["T1", "T2"])]);
        let topics = topics(&[("T1", &[0, 1][..]), ("T2", &[0, 1])]);

        let plan = RangeStrategy.plan(&members, &topics).unwrap();
        assert_eq!(
            plan,
            expect(&[
                ("M1", &[("T1", &[0][..])][..]),
                ("M2", &[("T1", &[1]), ("T2", &[0, 1])]),
            ])
        );
    }

    #[test]
    fn test_range_more_members_than_partitions() {
        let members = members(&[("M1", &["T1"][..]), ("M2", &["T1"]), ("M3", &["T1"])]);
        let topics = topics(&[("T1", &[0, 1][..])]);

        let plan = RangeStrategy.plan(&members, &topics).unwrap();
        assert_eq!(
            plan,
            expect(&[
                ("M1", &[("T1", &[0][..])][..]),
                ("M2", &[("T1", &[1])]),
                ("M3", &[]),
            ])
        );
    }

    #[test]
    fn test_round_robin_even_partitions() {
        let members = members(&[("M1", &["T1", "T2"][..]), ("M2", &["T1", "T2"])]);
        let topics = topics(&[("T1", &[0, 1, 2, 3][..]), ("T2", &[0, 1, 2, 3])]);

        let plan = RoundRobinStrategy.plan(&members, &topics).unwrap();
        assert_eq!(
            plan,
            expect(&[
                ("M1", &[("T1", &[0, 2][..]), ("T2", &[0, 2])][..]),
                ("M2", &[("T1", &[1, 3]), ("T2", &[1, 3])]),
            ])
        );
    }

    #[test]
    fn test_round_robin_odd_partitions() {
        let members = members(&[("M1", &["T1", "T2"][..]), ("M2", &["T1", "T2"])]);
        let topics = topics(&[("T1", &[0, 1, 2][..]), ("T2", &[0, 1, 2])]);

        let plan = RoundRobinStrategy.plan(&members, &topics).unwrap();
        assert_eq!(
            plan,
            expect(&[
                ("M1", &[("T1", &[0, 2][..]), ("T2", &[1])][..]),
                ("M2", &[("T1", &[1]), ("T2", &[0, 2])]),
            ])
        );
    }

    #[test]
    fn test_round_robin_skips_unsubscribed_members() {
        let members = members(&[("M1", &["T1"][..]), ("M2", &["T1", "T2"])]);
        let topics = topics(&[("T1", &[0, 1][..]), ("T2", &[0, 1])]);

        let plan = RoundRobinStrategy.plan(&members, &topics).unwrap();
        assert_eq!(
            plan,
            expect(&[
                ("M1", &[("T1", &[0][..])][..]),
                ("M2", &[("T1", &[1]), ("T2", &[0, 1])]),
            ])
        );
    }

    #[test]
    fn test_round_robin_topic_without_subscribers() {
        let members = members(&[("M1", &["T1"][..])]);
        let topics = topics(&[("T1", &[0][..]), ("T2", &[0, 1])]);

        let plan = RoundRobinStrategy.plan(&members, &topics).unwrap();
        assert_eq!(plan, expect(&[("M1", &[("T1", &[0][..])][..])]));
    }

    #[test]
    fn test_empty_inputs() {
        let no_members = HashMap::new();
        let no_topics = HashMap::new();

        assert!(RangeStrategy.plan(&no_members, &no_topics).unwrap().is_empty());
        assert!(RoundRobinStrategy
            .plan(&no_members, &no_topics)
            .unwrap()
            .is_empty());

        let members = members(&[("M1", &["T1"][..])]);
        let plan = RoundRobinStrategy.plan(&members, &no_topics).unwrap();
        assert_eq!(plan, expect(&[("M1", &[])]));
    }

    #[test]
    fn test_duplicate_partition_ids_collapse() {
        let members = members(&[("M1", &["T1"][..])]);
        let topics = topics(&[("T1", &[1, 0, 1][..])]);

        let plan = RangeStrategy.plan(&members, &topics).unwrap();
        assert_eq!(plan, expect(&[("M1", &[("T1", &[0, 1][..])][..])]));

        let plan = RoundRobinStrategy.plan(&members, &topics).unwrap();
        assert_eq!(plan, expect(&[("M1", &[("T1", &[0, 1][..])][..])]));
    }
}
