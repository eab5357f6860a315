//! Placement strategy using HRW hashing and subvolume sharding
//!
//! Thin owner of the topology (volumes, replica count, subvolumes) so callers
//! only ever ask "where does this key belong?".

use crate::common::{route, MasterConfig};

#[derive(Debug, Clone)]
pub struct PlacementManager {
    volumes: Vec<String>,
    /// Number of replicas per key
    replicas: usize,
    /// Subvolumes (disks) per volume server
    subvolumes: u32,
}

impl PlacementManager {
    pub fn new(volumes: Vec<String>, replicas: usize, subvolumes: u32) -> Self {
        Self {
            volumes,
            replicas,
            subvolumes,
        }
    }

    pub fn from_config(config: &MasterConfig) -> Self {
        Self::new(config.volumes.clone(), config.replicas, config.subvolumes)
    }

    /// Ordered target placement for a key; index 0 is the primary.
    pub fn select_volumes(&self, key: &[u8]) -> Vec<String> {
        route(key, &self.volumes, self.replicas, self.subvolumes)
    }

    /// Place `holders` in target rank order, then any extras sorted.
    ///
    /// Sorting the extras keeps the result independent of discovery order.
    pub fn rank(&self, key: &[u8], holders: &[String]) -> Vec<String> {
        let target = self.select_volumes(key);
        let mut ranked: Vec<String> = target
            .iter()
            .filter(|v| holders.contains(v))
            .cloned()
            .collect();
        let mut extras: Vec<String> = holders
            .iter()
            .filter(|v| !target.contains(v))
            .cloned()
            .collect();
        extras.sort();
        extras.dedup();
        ranked.extend(extras);
        ranked
    }

    pub fn volumes(&self) -> &[String] {
        &self.volumes
    }

    pub fn replicas(&self) -> usize {
        self.replicas
    }

    pub fn subvolumes(&self) -> u32 {
        self.subvolumes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(replicas: usize) -> PlacementManager {
        PlacementManager::new(
            vec!["vol-1".into(), "vol-2".into(), "vol-3".into(), "vol-4".into()],
            replicas,
            1,
        )
    }

    #[test]
    fn test_select_volumes() {
        let manager = manager(3);
        let selected = manager.select_volumes(b"/test-key");
        assert_eq!(selected.len(), 3);
        assert_eq!(selected, manager.select_volumes(b"/test-key"));
    }

    #[test]
    fn test_rank_orders_by_placement() {
        let manager = manager(2);
        let target = manager.select_volumes(b"/k");
        let others: Vec<String> = manager
            .volumes()
            .iter()
            .filter(|v| !target.contains(v))
            .cloned()
            .collect();

        // holders discovered in reverse order, plus one volume outside the target
        let holders = vec![others[1].clone(), target[1].clone(), target[0].clone(), others[0].clone()];
        let ranked = manager.rank(b"/k", &holders);

        let mut expected_extras = vec![others[0].clone(), others[1].clone()];
        expected_extras.sort();
        assert_eq!(&ranked[..2], &target[..]);
        assert_eq!(&ranked[2..], &expected_extras[..]);
    }

    #[test]
    fn test_rank_partial() {
        let manager = manager(3);
        let target = manager.select_volumes(b"/k");
        let ranked = manager.rank(b"/k", &[target[2].clone(), target[0].clone()]);
        assert_eq!(ranked, vec![target[0].clone(), target[2].clone()]);
    }
}
