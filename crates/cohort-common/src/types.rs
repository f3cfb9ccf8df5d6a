//! Common types used throughout Cohort.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Topic and partition identifier.
///
/// Ordered by topic name first, then partition id.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

/// Subscription metadata a group member sends to the elected leader when
/// joining a group.
#[derive(Debug, Clone, Default)]
pub struct MemberMetadata {
    /// Client protocol version
    pub version: u16,
    /// Topics the member is willing to consume
    pub topics: Vec<String>,
    /// Opaque blob carrying the member's previous assignment, if any
    pub user_data: Vec<u8>,
}

impl MemberMetadata {
    pub fn new(topics: Vec<String>) -> Self {
        Self {
            version: 0,
            topics,
            user_data: Vec::new(),
        }
    }

    pub fn with_user_data(topics: Vec<String>, user_data: Vec<u8>) -> Self {
        Self {
            version: 0,
            topics,
            user_data,
        }
    }
}

/// Assignment plan produced by a balance strategy.
///
/// Maps each member id to the topic partitions it will own. Every input
/// member id appears as a key; partition lists are sorted ascending.
pub type Plan = HashMap<String, HashMap<String, Vec<i32>>>;

/// Append a partition to a member's entry in a plan.
pub fn plan_add(plan: &mut Plan, member_id: &str, topic: &str, partition: i32) {
    plan.entry(member_id.to_string())
        .or_default()
        .entry(topic.to_string())
        .or_default()
        .push(partition);
}

/// Plan entry for serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PlanEntry {
    member_id: String,
    topic: String,
    partitions: Vec<i32>,
}

/// Serialize a plan to a JSON string for metadata persistence.
///
/// Entries are written in sorted order so the output is deterministic.
pub fn plan_to_json(plan: &Plan) -> Result<String> {
    let mut entries: Vec<PlanEntry> = plan
        .iter()
        .flat_map(|(member_id, topics)| {
            topics.iter().map(|(topic, partitions)| PlanEntry {
                member_id: member_id.clone(),
                topic: topic.clone(),
                partitions: partitions.clone(),
            })
        })
        .collect();
    entries.sort_by(|a, b| (&a.member_id, &a.topic).cmp(&(&b.member_id, &b.topic)));

    Ok(serde_json::to_string_pretty(&entries)?)
}

/// Deserialize a plan from its JSON form.
///
/// Members that were assigned nothing are absent from the JSON and therefore
/// absent from the result.
pub fn plan_from_json(json: &str) -> Result<Plan> {
    let entries: Vec<PlanEntry> = serde_json::from_str(json)?;

    let mut plan = Plan::new();
    for entry in entries {
        plan.entry(entry.member_id)
            .or_default()
            .insert(entry.topic, entry.partitions);
    }
    Ok(plan)
}
