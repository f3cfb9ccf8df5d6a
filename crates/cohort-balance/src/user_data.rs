//! User data codec for the sticky strategy.
//!
//! Between rebalances each member carries its previous assignment inside an
//! opaque blob attached to its join metadata. Two schema versions exist on
//! the wire:
//! - V0: a topics map only
//! - V1: a topics map followed by an i32 generation (-1 when unset)
//!
//! Decoding tries V1 first and falls back to V0, so blobs written by older
//! clients are accepted transparently. Encoding always emits V1.

use crate::wire::Decoder;
use byteorder::{BigEndian, WriteBytesExt};
use cohort_common::{Error, Result, TopicPartition};
use std::collections::HashMap;

/// Wire sentinel meaning "no generation was recorded".
pub const DEFAULT_GENERATION: i32 = -1;

/// Schema version of a decoded user data blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserDataSchema {
    V0,
    V1,
}

/// A member's previous assignment, decoded from its user data blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserData {
    /// Schema the blob was decoded with
    pub schema: UserDataSchema,
    /// Topic to previously owned partition ids
    pub topics: HashMap<String, Vec<i32>>,
    /// Generation the assignment was produced at; `None` when the blob
    /// carried no generation or the wire sentinel
    pub generation: Option<i32>,
    partitions: Vec<TopicPartition>,
}

impl UserData {
    /// Empty prior state, as produced for an empty blob.
    pub fn empty() -> Self {
        Self {
            schema: UserDataSchema::V1,
            topics: HashMap::new(),
            generation: None,
            partitions: Vec::new(),
        }
    }

    /// Previously owned partitions, flattened in on-wire order.
    pub fn partitions(&self) -> &[TopicPartition] {
        &self.partitions
    }

    /// Generation of the prior assignment, with the wire sentinel standing
    /// in for an absent value.
    pub fn generation_or_default(&self) -> i32 {
        self.generation.unwrap_or(DEFAULT_GENERATION)
    }
}

/// Decode a user data blob, trying the V1 schema first and falling back
/// to V0.
///
/// An empty blob decodes to empty V1 prior state. A blob that parses under
/// neither schema fails with [`Error::MalformedUserData`].
pub fn decode_user_data(data: &[u8]) -> Result<UserData> {
    if data.is_empty() {
        return Ok(UserData::empty());
    }
    if let Ok(user_data) = try_decode(data, UserDataSchema::V1) {
        return Ok(user_data);
    }
    try_decode(data, UserDataSchema::V0)
}

fn try_decode(data: &[u8], schema: UserDataSchema) -> Result<UserData> {
    let mut decoder = Decoder::new(data);
    let mut topics = HashMap::new();
    let mut partitions = Vec::new();

    let topic_count = decoder.read_i32()?;
    if topic_count < 0 {
        return Err(Error::MalformedUserData(format!(
            "negative topic count {}",
            topic_count
        )));
    }

    for _ in 0..topic_count {
        let topic = decoder.read_string()?;
        let partition_count = decoder.read_i32()?;
        if partition_count < 0 {
            return Err(Error::MalformedUserData(format!(
                "negative partition count {}",
                partition_count
            )));
        }

        let mut ids = Vec::new();
        for _ in 0..partition_count {
            let partition = decoder.read_i32()?;
            ids.push(partition);
            partitions.push(TopicPartition::new(&topic, partition));
        }
        topics.insert(topic, ids);
    }

    let generation = match schema {
        UserDataSchema::V1 => {
            let generation = decoder.read_i32()?;
            (generation != DEFAULT_GENERATION).then_some(generation)
        }
        UserDataSchema::V0 => None,
    };

    if decoder.remaining() != 0 {
        return Err(Error::MalformedUserData(format!(
            "{} trailing bytes after user data",
            decoder.remaining()
        )));
    }

    Ok(UserData {
        schema,
        topics,
        generation,
        partitions,
    })
}

/// Encode a previous assignment as a V1 user data blob.
///
/// Topics are written in sorted order so the encoding is deterministic.
pub fn encode_user_data(topics: &HashMap<String, Vec<i32>>, generation: Option<i32>) -> Vec<u8> {
    let mut topic_names: Vec<&String> = topics.keys().collect();
    topic_names.sort();

    let mut bytes = Vec::new();
    bytes.write_i32::<BigEndian>(topics.len() as i32).unwrap();
    for topic in topic_names {
        bytes.write_i16::<BigEndian>(topic.len() as i16).unwrap();
        bytes.extend_from_slice(topic.as_bytes());

        let partitions = &topics[topic];
        bytes
            .write_i32::<BigEndian>(partitions.len() as i32)
            .unwrap();
        for &partition in partitions {
            bytes.write_i32::<BigEndian>(partition).unwrap();
        }
    }
    bytes
        .write_i32::<BigEndian>(generation.unwrap_or(DEFAULT_GENERATION))
        .unwrap();

    bytes
}
