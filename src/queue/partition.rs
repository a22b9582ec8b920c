//! Queue partitions and the weighted selector that picks which one a
//! worker drains next.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A named sub-queue. Declared in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    Generation,
    Media,
    Default,
    Batch,
}

impl Partition {
    /// All partitions, highest priority first.
    pub const ALL: [Partition; 4] = [Self::Generation, Self::Media, Self::Default, Self::Batch];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generation => "generation",
            Self::Media => "media",
            Self::Default => "default",
            Self::Batch => "batch",
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Partition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown partition: {s}"))
    }
}

/// Relative share of dequeue attempts each partition gets first pick of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionWeights {
    pub generation: u32,
    pub media: u32,
    pub default: u32,
    pub batch: u32,
}

impl PartitionWeights {
    pub fn weight(&self, partition: Partition) -> u32 {
        match partition {
            Partition::Generation => self.generation,
            Partition::Media => self.media,
            Partition::Default => self.default,
            Partition::Batch => self.batch,
        }
    }
}

impl Default for PartitionWeights {
    fn default() -> Self {
        Self {
            generation: 8,
            media: 4,
            default: 2,
            batch: 1,
        }
    }
}

/// Smooth weighted round-robin over a worker's subscribed partitions.
///
/// Every partition with a non-zero weight is picked first at least once
/// per `sum(weights)` calls, so the lowest partition cannot starve while
/// higher ones stay busy.
#[derive(Debug)]
pub struct WeightedSelector {
    slots: Vec<Slot>,
    total: i64,
}

#[derive(Debug)]
struct Slot {
    partition: Partition,
    weight: i64,
    current: i64,
}

impl WeightedSelector {
    pub fn new(partitions: &[Partition], weights: PartitionWeights) -> Self {
        let mut subscribed: Vec<Partition> = partitions.to_vec();
        subscribed.sort();
        subscribed.dedup();

        let slots: Vec<Slot> = subscribed
            .into_iter()
            .map(|partition| Slot {
                partition,
                weight: i64::from(weights.weight(partition)),
                current: 0,
            })
            .collect();
        let total = slots.iter().map(|s| s.weight).sum();

        Self { slots, total }
    }

    /// Order in which to try partitions for the next dequeue: the weighted
    /// pick first, then the rest in strict priority order.
    pub fn next_order(&mut self) -> Vec<Partition> {
        let mut order: Vec<Partition> = self.slots.iter().map(|s| s.partition).collect();
        if self.total <= 0 {
            return order;
        }

        for slot in &mut self.slots {
            slot.current += slot.weight;
        }
        let Some(best) = self
            .slots
            .iter_mut()
            .filter(|s| s.weight > 0)
            .max_by(|a, b| {
                a.current
                    .cmp(&b.current)
                    // Ties go to the higher-priority partition.
                    .then_with(|| b.partition.cmp(&a.partition))
            })
        else {
            return order;
        };
        best.current -= self.total;
        let chosen = best.partition;

        order.retain(|p| *p != chosen);
        order.insert(0, chosen);
        order
    }

    pub fn partitions(&self) -> Vec<Partition> {
        self.slots.iter().map(|s| s.partition).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_picks_follow_weights() {
        let mut selector = WeightedSelector::new(&Partition::ALL, PartitionWeights::default());
        let mut counts = std::collections::HashMap::new();
        for _ in 0..15 {
            let first = selector.next_order()[0];
            *counts.entry(first).or_insert(0) += 1;
        }
        assert_eq!(counts[&Partition::Generation], 8);
        assert_eq!(counts[&Partition::Media], 4);
        assert_eq!(counts[&Partition::Default], 2);
        assert_eq!(counts[&Partition::Batch], 1);
    }

    #[test]
    fn fallback_is_priority_order() {
        let mut selector = WeightedSelector::new(&Partition::ALL, PartitionWeights::default());
        for _ in 0..15 {
            let order = selector.next_order();
            assert_eq!(order.len(), 4);
            let rest: Vec<_> = order[1..].to_vec();
            let mut sorted = rest.clone();
            sorted.sort();
            assert_eq!(rest, sorted);
        }
    }

    #[test]
    fn batch_gets_first_pick_within_one_cycle() {
        let mut selector = WeightedSelector::new(&Partition::ALL, PartitionWeights::default());
        let picks: Vec<_> = (0..15).map(|_| selector.next_order()[0]).collect();
        assert!(picks.contains(&Partition::Batch));
        assert_eq!(picks[0], Partition::Generation);
    }

    #[test]
    fn subset_subscription() {
        let mut selector = WeightedSelector::new(
            &[Partition::Batch, Partition::Media, Partition::Batch],
            PartitionWeights::default(),
        );
        assert_eq!(selector.partitions(), vec![Partition::Media, Partition::Batch]);
        let order = selector.next_order();
        assert_eq!(order, vec![Partition::Media, Partition::Batch]);
    }

    #[test]
    fn zero_weights_fall_back_to_priority() {
        let weights = PartitionWeights {
            generation: 0,
            media: 0,
            default: 0,
            batch: 0,
        };
        let mut selector = WeightedSelector::new(&Partition::ALL, weights);
        assert_eq!(selector.next_order(), Partition::ALL.to_vec());
    }
}
