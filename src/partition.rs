//! Partition arithmetic and fast-store key construction.
//!
//! Epoch values are grouped into fixed-size partitions so that one cached
//! bitmap covers roughly half a year of data instead of an unbounded span:
//! 180 days, 6 months, or 1 year per partition. Changing these sizes is a
//! backward-incompatible storage change.
//!
//! Key layout:
//!
//! ```text
//! e4s:index:{name}:{granularity}:{entityId}:{partition}
//! e4s:index:meter-data:day:12345:109
//! ```

use crate::time::Granularity;

pub const KEY_PREFIX: &str = "e4s:index";
pub const REGISTRY_KEY: &str = "e4s:index:registry";

pub const PARTITION_DAYS: u32 = 180;
pub const PARTITION_MONTHS: u32 = 6;

/// Number of epoch values covered by one partition.
pub fn partition_size(granularity: Granularity) -> u32 {
    match granularity {
        Granularity::Day => PARTITION_DAYS,
        Granularity::Month => PARTITION_MONTHS,
        Granularity::Year => 1,
    }
}

/// Partition number holding `epoch_value`.
pub fn partition_of(epoch_value: u32, granularity: Granularity) -> u32 {
    epoch_value / partition_size(granularity)
}

/// First epoch value of `partition`.
pub fn partition_start(partition: u32, granularity: Granularity) -> u32 {
    partition * partition_size(granularity)
}

/// First epoch value after `partition` (exclusive upper bound).
pub fn partition_end(partition: u32, granularity: Granularity) -> u32 {
    (partition + 1) * partition_size(granularity)
}

/// Fast-store key of one partition bitmap.
pub fn key(index_name: &str, granularity: Granularity, entity_id: i64, partition: u32) -> String {
    format!(
        "{KEY_PREFIX}:{index_name}:{}:{entity_id}:{partition}",
        granularity.key_segment()
    )
}

/// Fast-store key of the partition bitmap holding `epoch_value`.
pub fn key_for_value(
    index_name: &str,
    granularity: Granularity,
    entity_id: i64,
    epoch_value: u32,
) -> String {
    key(
        index_name,
        granularity,
        entity_id,
        partition_of(epoch_value, granularity),
    )
}

/// Key of the partition immediately before the one holding `epoch_value`,
/// or `None` at partition 0.
pub fn prev_partition_key(
    index_name: &str,
    granularity: Granularity,
    entity_id: i64,
    epoch_value: u32,
) -> Option<String> {
    let partition = partition_of(epoch_value, granularity);
    if partition == 0 {
        return None;
    }
    Some(key(index_name, granularity, entity_id, partition - 1))
}

/// Key of the partition immediately after the one holding `epoch_value`.
pub fn next_partition_key(
    index_name: &str,
    granularity: Granularity,
    entity_id: i64,
    epoch_value: u32,
) -> String {
    let partition = partition_of(epoch_value, granularity);
    key(index_name, granularity, entity_id, partition + 1)
}

/// Key prefix shared by every partition bitmap of an index.
pub fn index_prefix(index_name: &str) -> String {
    format!("{KEY_PREFIX}:{index_name}:")
}

/// Key prefix shared by every partition of one (index, granularity, entity).
pub fn entity_prefix(index_name: &str, granularity: Granularity, entity_id: i64) -> String {
    format!(
        "{KEY_PREFIX}:{index_name}:{}:{entity_id}:",
        granularity.key_segment()
    )
}

/// Key prefix of an index's DAY partitions, one per entity and half-year.
pub fn day_prefix(index_name: &str) -> String {
    format!("{KEY_PREFIX}:{index_name}:day:")
}
