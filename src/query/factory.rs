//! Query planning: grouping channels into minimal bulk transfers.
//!
//! The planner follows a fixed pipeline: partition channels by poll
//! interval, seed one group per channel, validate the seeds, then run an
//! O(N²) merge sweep. Merging never splits a seed group (channels planned
//! together stay together) and may leave the same memory block in several
//! groups when they cannot merge — the block is then simply read more than
//! once per cycle. Correctness beats minimality.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::channel::VirtualRegister;
use crate::core::config::QueryPolicy;
use crate::core::error::{EngineError, Result};
use crate::memory::block::{MemoryBlock, MemoryBlockType};
use crate::query::{Operation, Query, QuerySet};

/// Groups channels into protocol-limit-respecting bulk queries.
pub struct QueryFactory;

/// One planning group: a set of blocks and the channels that put them there.
struct Group {
    blocks: BTreeSet<Arc<MemoryBlock>>,
    channels: Vec<Arc<VirtualRegister>>,
}

/// Hole and span limits for one register type.
#[derive(Clone, Copy)]
struct Limits {
    max_hole: u32,
    max_span: u32,
}

impl QueryFactory {
    /// Plan one query set per poll-interval class.
    ///
    /// Interval classes keep the order in which they first appear in
    /// `channels`; channels with distinct intervals never share a set.
    pub fn plan_query_sets(
        channels: &[Arc<VirtualRegister>],
        operation: Operation,
    ) -> Result<Vec<QuerySet>> {
        let mut intervals: Vec<Duration> = Vec::new();
        let mut partitions: Vec<Vec<Arc<VirtualRegister>>> = Vec::new();

        for channel in channels {
            let interval = channel.poll_interval();
            match intervals.iter().position(|&i| i == interval) {
                Some(at) => partitions[at].push(channel.clone()),
                None => {
                    intervals.push(interval);
                    partitions.push(vec![channel.clone()]);
                }
            }
        }

        let mut sets = Vec::with_capacity(partitions.len());
        for (interval, partition) in intervals.into_iter().zip(partitions) {
            let queries = Self::plan_queries(&partition, operation, QueryPolicy::default())?;
            sets.push(QuerySet::new(operation, interval, queries));
        }
        Ok(sets)
    }

    /// Plan the queries for one poll-interval class.
    pub fn plan_queries(
        channels: &[Arc<VirtualRegister>],
        operation: Operation,
        policy: QueryPolicy,
    ) -> Result<Vec<Arc<Query>>> {
        assert!(!channels.is_empty(), "planning without channels");

        let device = channels[0].device()?;
        let protocol = device.protocol().clone();
        let settings = device.settings().clone();

        let limits_for = |block_type: &MemoryBlockType| -> Limits {
            let single_bit = protocol.is_single_bit_type(block_type);

            let max_hole = match policy {
                QueryPolicy::Minify if single_bit => settings.max_bit_hole,
                QueryPolicy::Minify => settings.max_reg_hole,
                QueryPolicy::NoDuplicates => 0,
            };

            let max_span = match operation {
                Operation::Read => {
                    let protocol_max = if single_bit {
                        protocol.max_read_bits()
                    } else {
                        protocol.max_read_registers()
                    };
                    if settings.max_read_registers > 0 {
                        settings.max_read_registers.min(protocol_max)
                    } else {
                        protocol_max
                    }
                }
                Operation::Write => {
                    if single_bit {
                        protocol.max_write_bits()
                    } else {
                        protocol.max_write_registers()
                    }
                }
            };

            Limits { max_hole, max_span }
        };

        // seed one group per channel, preserving input order
        let mut groups: Vec<Group> = Vec::with_capacity(channels.len());
        for channel in channels {
            let blocks: BTreeSet<Arc<MemoryBlock>> =
                channel.memory_blocks().into_iter().collect();
            if blocks.is_empty() {
                return Err(EngineError::config(format!(
                    "channel '{}' has no memory blocks",
                    channel.name()
                )));
            }
            groups.push(Group {
                blocks,
                channels: vec![channel.clone()],
            });
        }

        Self::check_groups(&groups, &limits_for)?;
        Self::merge_groups(&mut groups, policy, &limits_for);
        Self::check_groups(&groups, &limits_for)?;

        Ok(groups
            .into_iter()
            .map(|group| {
                Arc::new(Query::new(
                    operation,
                    group.blocks.into_iter().collect(),
                    group.channels,
                ))
            })
            .collect())
    }

    /// Validate hole, span and homogeneity limits for every group.
    fn check_groups(groups: &[Group], limits_for: &dyn Fn(&MemoryBlockType) -> Limits) -> Result<()> {
        for group in groups {
            let first = group.blocks.first().expect("group without blocks");
            let type_index = first.block_type().index;
            let size = first.size();

            for block in &group.blocks {
                if block.block_type().index != type_index {
                    return Err(EngineError::invalid_query(format!(
                        "different memory block types in one set ({} vs {})",
                        first.describe(),
                        block.describe()
                    )));
                }
                if block.size() != size {
                    return Err(EngineError::invalid_query(format!(
                        "different memory block sizes in one set ({} and {} bytes at {})",
                        size,
                        block.size(),
                        block.address()
                    )));
                }
            }

            let limits = limits_for(first.block_type());

            let hole = Self::max_hole(group.blocks.iter().map(|b| b.address()));
            if hole > limits.max_hole {
                return Err(EngineError::invalid_query(format!(
                    "max hole size exceeded (detected: {}, max: {})",
                    hole, limits.max_hole
                )));
            }

            let span = Self::span(&group.blocks);
            if span > limits.max_span {
                return Err(EngineError::invalid_query(format!(
                    "max block count exceeded (detected: {}, max: {})",
                    span, limits.max_span
                )));
            }
        }
        Ok(())
    }

    /// The merge sweep: each group tries to absorb every later group.
    fn merge_groups(
        groups: &mut Vec<Group>,
        policy: QueryPolicy,
        limits_for: &dyn Fn(&MemoryBlockType) -> Limits,
    ) {
        let mut i = 0;
        while i < groups.len() {
            let mut j = i + 1;
            while j < groups.len() {
                if Self::can_merge(&groups[i], &groups[j], policy, limits_for) {
                    let Group { blocks, channels } = groups.remove(j);
                    groups[i].blocks.extend(blocks);
                    groups[i].channels.extend(channels);
                } else {
                    j += 1;
                }
            }
            i += 1;
        }
    }

    fn can_merge(
        a: &Group,
        b: &Group,
        policy: QueryPolicy,
        limits_for: &dyn Fn(&MemoryBlockType) -> Limits,
    ) -> bool {
        if policy == QueryPolicy::NoDuplicates {
            return a.blocks == b.blocks;
        }

        let first_a = a.blocks.first().expect("group without blocks");
        let first_b = b.blocks.first().expect("group without blocks");

        if first_a.block_type().index != first_b.block_type().index
            || first_a.size() != first_b.size()
        {
            return false;
        }

        let limits = limits_for(first_a.block_type());

        let mut addresses: Vec<u32> = a
            .blocks
            .iter()
            .chain(&b.blocks)
            .map(|block| block.address())
            .collect();
        addresses.sort_unstable();
        addresses.dedup();

        let hole = Self::max_hole(addresses.iter().copied());
        let span = addresses[addresses.len() - 1] - addresses[0] + 1;

        hole <= limits.max_hole && span <= limits.max_span
    }

    /// Largest run of missing addresses between consecutive blocks.
    fn max_hole(addresses: impl Iterator<Item = u32>) -> u32 {
        let mut hole = 0;
        let mut prev: Option<u32> = None;
        for address in addresses {
            if let Some(prev) = prev {
                debug_assert!(address > prev);
                hole = hole.max(address - prev - 1);
            }
            prev = Some(address);
        }
        hole
    }

    /// Address span of a group including holes, in blocks.
    fn span(blocks: &BTreeSet<Arc<MemoryBlock>>) -> u32 {
        let first = blocks.first().expect("group without blocks");
        let last = blocks.last().expect("group without blocks");
        last.address() - first.address() + 1
    }
}
