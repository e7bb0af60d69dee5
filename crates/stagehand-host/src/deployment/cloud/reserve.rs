//! Pre-warmed, unassigned kernels and the quota that sizes them.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveConfig {
    /// Upper bound on assigned plus reserve kernels.
    pub max_kernels: u32,
    /// Runtime name to its share of the reserve.
    pub shares: BTreeMap<String, u32>,
}

impl Default for ReserveConfig {
    fn default() -> Self {
        Self {
            max_kernels: 10,
            shares: BTreeMap::new(),
        }
    }
}

/// Partial change to a [`ReserveConfig`]. Zero values are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveUpdate {
    #[serde(default)]
    pub max_kernels: Option<u32>,
    #[serde(default)]
    pub shares: BTreeMap<String, u32>,
}

impl ReserveConfig {
    pub fn apply(&mut self, update: &ReserveUpdate) {
        if let Some(max) = update.max_kernels.filter(|m| *m > 0) {
            self.max_kernels = max;
        }
        for (name, share) in &update.shares {
            if *share > 0 {
                self.shares.insert(name.clone(), *share);
            }
        }
    }

    /// Reserve size per runtime when `assigned` kernels are already in use.
    ///
    /// The budget is what is left of `max_kernels`, capped by the sum of the
    /// shares. It is split proportionally with the largest remainder method,
    /// so the targets always add up to the budget and no runtime gets more
    /// than its share.
    pub fn targets(&self, assigned: u32) -> BTreeMap<String, u32> {
        let total: u64 = self.shares.values().map(|s| u64::from(*s)).sum();
        if total == 0 {
            return self.shares.keys().map(|k| (k.clone(), 0)).collect();
        }
        let budget = u64::from(self.max_kernels.saturating_sub(assigned)).min(total);

        let mut targets = BTreeMap::new();
        let mut remainders = Vec::with_capacity(self.shares.len());
        let mut handed_out = 0;
        for (name, share) in &self.shares {
            let scaled = u64::from(*share) * budget;
            let floor = scaled / total;
            handed_out += floor;
            remainders.push((scaled % total, name));
            targets.insert(name.clone(), floor as u32);
        }
        // Largest remainder first; ties go to the name that sorts first.
        remainders.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
        for (_, name) in remainders.into_iter().take((budget - handed_out) as usize) {
            if let Some(target) = targets.get_mut(name) {
                *target += 1;
            }
        }
        targets
    }
}

/// Idle kernels per runtime name, oldest first.
#[derive(Debug)]
pub struct ReservePool<K> {
    pools: BTreeMap<String, VecDeque<K>>,
}

impl<K> Default for ReservePool<K> {
    fn default() -> Self {
        Self {
            pools: BTreeMap::new(),
        }
    }
}

impl<K> ReservePool<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return the oldest usable kernel for `runtime`.
    pub fn take(&mut self, runtime: &str, usable: impl Fn(&K) -> bool) -> Option<K> {
        let pool = self.pools.get_mut(runtime)?;
        let at = pool.iter().position(usable)?;
        pool.remove(at)
    }

    pub fn push(&mut self, runtime: &str, kernel: K) {
        self.pools.entry(runtime.to_string()).or_default().push_back(kernel);
    }

    /// Keep only kernels for which `keep` holds.
    pub fn prune(&mut self, keep: impl Fn(&K) -> bool) {
        for pool in self.pools.values_mut() {
            pool.retain(|k| keep(k));
        }
    }

    pub fn len(&self, runtime: &str) -> usize {
        self.pools.get(runtime).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self) -> bool {
        self.pools.values().all(VecDeque::is_empty)
    }

    /// How many kernels each runtime is short of its target.
    pub fn deficits(&self, targets: &BTreeMap<String, u32>) -> Vec<(String, usize)> {
        targets
            .iter()
            .filter_map(|(name, target)| {
                let missing = (*target as usize).saturating_sub(self.len(name));
                (missing > 0).then(|| (name.clone(), missing))
            })
            .collect()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = K> + '_ {
        self.pools.values_mut().flat_map(|pool| pool.drain(..))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max: u32, shares: &[(&str, u32)]) -> ReserveConfig {
        ReserveConfig {
            max_kernels: max,
            shares: shares.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        }
    }

    #[test]
    fn scales_down_with_assigned_kernels() {
        let config = config(10, &[("ir", 6), ("python3", 4)]);
        let targets = config.targets(4);
        assert_eq!(targets["ir"], 4);
        assert_eq!(targets["python3"], 2);

        let idle = config.targets(0);
        assert_eq!(idle["ir"], 6);
        assert_eq!(idle["python3"], 4);
    }

    #[test]
    fn never_exceeds_budget_or_share() {
        for max in 0..15 {
            for assigned in 0..15 {
                let config = config(max, &[("a", 3), ("b", 5), ("c", 1)]);
                let targets = config.targets(assigned);
                let sum: u32 = targets.values().sum();
                assert!(sum <= max.saturating_sub(assigned), "max {max} assigned {assigned}");
                for (name, target) in &targets {
                    assert!(*target <= config.shares[name]);
                }
            }
        }
    }

    #[test]
    fn zero_shares_reserve_nothing() {
        let config = config(10, &[("ir", 0)]);
        assert_eq!(config.targets(0)["ir"], 0);
        assert!(ReserveConfig::default().targets(0).is_empty());
    }

    #[test]
    fn update_ignores_zero_values() {
        let mut config = config(10, &[("ir", 6)]);
        config.apply(&ReserveUpdate {
            max_kernels: Some(0),
            shares: BTreeMap::from([("ir".into(), 0), ("python3".into(), 2)]),
        });
        assert_eq!(config.max_kernels, 10);
        assert_eq!(config.shares["ir"], 6);
        assert_eq!(config.shares["python3"], 2);
    }

    #[test]
    fn pool_takes_oldest_usable() {
        let mut pool = ReservePool::new();
        pool.push("ir", 1);
        pool.push("ir", 2);
        pool.push("ir", 3);
        assert_eq!(pool.take("ir", |k| *k != 1), Some(2));
        assert_eq!(pool.take("python3", |_| true), None);

        pool.prune(|k| *k != 1);
        assert_eq!(pool.len("ir"), 1);

        let targets = BTreeMap::from([("ir".to_string(), 3), ("python3".to_string(), 1)]);
        assert_eq!(
            pool.deficits(&targets),
            vec![("ir".to_string(), 2), ("python3".to_string(), 1)]
        );
    }
}
