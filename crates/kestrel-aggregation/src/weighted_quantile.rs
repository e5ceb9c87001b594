use std::cmp::Ordering;
use std::io;

use anyhow::anyhow;
use kestrel_hashtable::{HashMap, Key, PairCell, Reader, TwoPowerGrower};

/// Aggregation state starts tiny: most groups see a handful of distinct
/// values, and a degree-4 table fits the buffer's inline prefix.
const INITIAL_DEGREE: u8 = 4;

type Weight = u64;

/// Exact weighted-quantile state.
///
/// The state is a hash map from observed value to accumulated weight. A set
/// of `(value, weight)` pairs can be viewed as a histogram: `value` is the
/// bucket midpoint and `weight` the bucket height. The result type equals
/// the value type.
#[derive(Clone)]
pub struct QuantileExactWeighted<T: Key + PartialOrd> {
    map: HashMap<T, Weight, TwoPowerGrower>,
}

impl<T: Key + PartialOrd> Default for QuantileExactWeighted<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Key + PartialOrd> QuantileExactWeighted<T> {
    pub fn new() -> Self {
        Self {
            map: HashMap::with_grower(TwoPowerGrower::new(INITIAL_DEGREE)),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Record `value` with the given weight.
    pub fn add(&mut self, value: T, weight: Weight) -> anyhow::Result<()> {
        *self.map.entry(value).map_err(|e| anyhow!(e))? += weight;
        Ok(())
    }

    /// Fold another state into this one.
    pub fn merge(&mut self, other: &Self) -> anyhow::Result<()> {
        for (value, weight) in other.map.iter() {
            *self.map.entry(*value).map_err(|e| anyhow!(e))? += *weight;
        }
        Ok(())
    }

    /// Serialize in the hash map's binary form.
    pub fn write<W: io::Write>(&self, out: &mut W) -> anyhow::Result<()> {
        self.map.write(out).map_err(|e| anyhow!(e))
    }

    /// Merge a serialized state into this one, streaming cell by cell.
    pub fn read_merge<R: io::Read>(&mut self, input: &mut R) -> anyhow::Result<()> {
        let mut reader = Reader::<PairCell<T, Weight>, _>::new(input);
        while reader.next().map_err(|e| anyhow!(e))? {
            let cell = *reader.get().map_err(|e| anyhow!(e))?;
            *self.map.entry(cell.key).map_err(|e| anyhow!(e))? += cell.value;
        }
        Ok(())
    }

    /// Entries sorted ascending by value, with the total weight.
    fn sorted_pairs(&self) -> (Vec<(T, Weight)>, Weight) {
        let mut pairs: Vec<(T, Weight)> = self
            .map
            .iter()
            .map(|(value, weight)| (*value, *weight))
            .collect();
        pairs.sort_unstable_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));
        let total = pairs.iter().map(|pair| pair.1).sum();
        (pairs, total)
    }

    /// The exact weighted quantile at `level ∈ [0, 1]`.
    ///
    /// Returns the first value whose running weight reaches
    /// `⌊total · level⌋`, or the last value if the scan falls off the end.
    /// The empty state yields the zero value.
    pub fn quantile(&self, level: f64) -> T {
        debug_assert!((0.0..=1.0).contains(&level));
        if self.map.is_empty() {
            return T::zero();
        }

        let (pairs, total) = self.sorted_pairs();
        let threshold = (total as f64 * level) as Weight;

        let mut accumulated = 0;
        for (value, weight) in &pairs {
            accumulated += weight;
            if accumulated >= threshold {
                return *value;
            }
        }
        pairs.last().expect("non-empty state has pairs").0
    }

    /// Quantiles at several levels, one result per level in input order.
    ///
    /// Levels are visited in non-decreasing order so a single continued scan
    /// serves all of them; unsorted input goes through a sorted permutation
    /// of the level indices, keeping finalization linear either way.
    pub fn quantiles(&self, levels: &[f64]) -> Vec<T> {
        let mut results = vec![T::zero(); levels.len()];
        if self.map.is_empty() || levels.is_empty() {
            return results;
        }

        let mut order: Vec<usize> = (0..levels.len()).collect();
        if !levels.windows(2).all(|pair| pair[0] <= pair[1]) {
            order.sort_by(|&a, &b| {
                levels[a]
                    .partial_cmp(&levels[b])
                    .unwrap_or(Ordering::Equal)
            });
        }

        let (pairs, total) = self.sorted_pairs();
        let mut accumulated: Weight = 0;
        let mut pos = 0;
        for &level_index in &order {
            let threshold = (total as f64 * levels[level_index]) as Weight;
            while pos < pairs.len() && accumulated < threshold {
                accumulated += pairs[pos].1;
                pos += 1;
            }
            results[level_index] = pairs[pos.max(1) - 1].0;
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_serialize_finalize() {
        kestrel_testing::init_test_logging();

        let mut a = QuantileExactWeighted::<u32>::new();
        a.add(10, 3).unwrap();
        a.add(20, 5).unwrap();
        a.add(10, 2).unwrap();

        let mut b = QuantileExactWeighted::<u32>::new();
        b.add(20, 1).unwrap();
        b.add(30, 4).unwrap();

        a.merge(&b).unwrap();

        let mut bytes = Vec::new();
        a.write(&mut bytes).unwrap();

        let mut c = QuantileExactWeighted::<u32>::new();
        c.read_merge(&mut bytes.as_slice()).unwrap();

        // Sorted pairs (10,5) (20,6) (30,4); total 15, threshold 7.
        // The running sum is 5 after 10 and 11 after 20, so the median is 20.
        assert_eq!(c.quantile(0.5), 20);
    }

    #[test]
    fn test_level_zero_is_minimum() {
        let mut state = QuantileExactWeighted::<i64>::new();
        state.add(7, 1).unwrap();
        state.add(-3, 10).unwrap();
        state.add(100, 2).unwrap();
        assert_eq!(state.quantile(0.0), -3);
    }

    #[test]
    fn test_level_one_is_maximum() {
        let mut state = QuantileExactWeighted::<u64>::new();
        state.add(5, 2).unwrap();
        state.add(9, 1).unwrap();
        state.add(1, 4).unwrap();
        assert_eq!(state.quantile(1.0), 9);
    }

    #[test]
    fn test_empty_state_yields_default() {
        let state = QuantileExactWeighted::<u64>::new();
        assert_eq!(state.quantile(0.5), 0);
        assert_eq!(state.quantiles(&[0.1, 0.9]), vec![0, 0]);
    }

    #[test]
    fn test_monotone_in_level() {
        let mut state = QuantileExactWeighted::<u32>::new();
        for (value, weight) in [(4, 2), (8, 1), (15, 7), (16, 3), (23, 1), (42, 5)] {
            state.add(value, weight).unwrap();
        }
        let levels: Vec<f64> = (0..=10).map(|i| i as f64 / 10.0).collect();
        let results = state.quantiles(&levels);
        for pair in results.windows(2) {
            assert!(pair[0] <= pair[1], "{results:?} is not monotone");
        }
    }

    #[test]
    fn test_unsorted_levels_match_sorted() {
        let mut state = QuantileExactWeighted::<u32>::new();
        for (value, weight) in [(1, 3), (2, 3), (3, 3), (4, 3)] {
            state.add(value, weight).unwrap();
        }

        let unsorted = state.quantiles(&[0.9, 0.1, 0.5]);
        assert_eq!(unsorted[0], state.quantile(0.9));
        assert_eq!(unsorted[1], state.quantile(0.1));
        assert_eq!(unsorted[2], state.quantile(0.5));
    }

    #[test]
    fn test_zero_value_participates() {
        // Zero is a legal observed value; it lives in the table's side slot.
        let mut state = QuantileExactWeighted::<u64>::new();
        state.add(0, 10).unwrap();
        state.add(50, 1).unwrap();
        assert_eq!(state.quantile(0.5), 0);

        let mut bytes = Vec::new();
        state.write(&mut bytes).unwrap();
        let mut restored = QuantileExactWeighted::<u64>::new();
        restored.read_merge(&mut bytes.as_slice()).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.quantile(0.5), 0);
    }

    #[test]
    fn test_merge_is_commutative() {
        let mut left = QuantileExactWeighted::<u32>::new();
        let mut right = QuantileExactWeighted::<u32>::new();
        for (value, weight) in [(3, 1), (6, 2), (9, 3)] {
            left.add(value, weight).unwrap();
        }
        for (value, weight) in [(6, 5), (12, 1)] {
            right.add(value, weight).unwrap();
        }

        let mut ab = left.clone();
        ab.merge(&right).unwrap();
        let mut ba = right.clone();
        ba.merge(&left).unwrap();

        for level in [0.0, 0.25, 0.5, 0.75, 1.0] {
            assert_eq!(ab.quantile(level), ba.quantile(level));
        }
    }
}
