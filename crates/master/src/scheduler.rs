//! Test group scheduling
//!
//! The master collection is cut into [`TestGroup`]s: consecutive tests of
//! one file, split by parametrize id. Groups are handed out on `need_tests`
//! while keeping every worker on as few providers as possible, so that one
//! appliance does not keep switching between providers.

use crate::appliance::ApplianceRef;
use crate::config::{CleanupPolicy, SchedulerConfig};
use crate::registry::SlaveRegistry;
use parallelizer_common::{Error, ProviderTag, Result, TestId, WorkerId};
use std::collections::VecDeque;
use tracing::{debug, info};

/// Tests dispatched to one worker as a unit
pub type TestGroup = Vec<TestId>;

/// Parametrize id of tests without one
pub const NO_PARAMS: &str = "no params";

/// File part of a node id
pub fn file_part(nodeid: &str) -> &str {
    nodeid.split("::").next().unwrap_or(nodeid)
}

/// Parametrize id of a node id: between the first `[` and the last `]`
pub fn param_id(nodeid: &str) -> &str {
    let Some(open) = nodeid.find('[') else {
        return NO_PARAMS;
    };
    match nodeid.rfind(']') {
        Some(close) if close > open => &nodeid[open + 1..close],
        _ => &nodeid[open + 1..],
    }
}

/// Split one file's tests by parametrize id, in first-seen order
fn split_by_param(tests: Vec<TestId>) -> Vec<TestGroup> {
    let mut groups: Vec<(String, TestGroup)> = Vec::new();
    for test in tests {
        let param = param_id(&test).to_string();
        match groups.iter_mut().find(|(p, _)| *p == param) {
            Some((_, group)) => group.push(test),
            None => groups.push((param, vec![test])),
        }
    }
    groups.into_iter().map(|(_, group)| group).collect()
}

/// Lazy generator of test groups from an ordered collection
pub struct TestGroups {
    items: std::iter::Peekable<std::vec::IntoIter<TestId>>,
    pending: VecDeque<TestGroup>,
    remaining: usize,
}

impl TestGroups {
    pub fn new(collection: Vec<TestId>) -> Self {
        Self {
            remaining: collection.len(),
            items: collection.into_iter().peekable(),
            pending: VecDeque::new(),
        }
    }
}

impl Iterator for TestGroups {
    type Item = TestGroup;

    fn next(&mut self) -> Option<TestGroup> {
        while self.pending.is_empty() {
            let first = self.items.next()?;
            let file = file_part(&first).to_string();
            let mut module = vec![first];
            while let Some(next) = self.items.next_if(|t| file_part(t) == file) {
                module.push(next);
            }
            self.pending.extend(split_by_param(module));
        }

        let group = self.pending.pop_front()?;
        self.remaining = self.remaining.saturating_sub(group.len());
        debug!("{} tests remaining to send", self.remaining);
        Some(group)
    }
}

/// Where an allocated group came from
#[derive(Debug, Clone, PartialEq)]
pub enum AllocationSource {
    /// A group left behind by a crashed worker
    Failed,
    /// A pool group compatible with the worker's providers
    Pool,
    /// The worker was moved to a new provider
    Reassigned {
        provider: ProviderTag,
        /// Error of the provider cleanup, if it failed
        cleanup_error: Option<String>,
        cleaned: bool,
    },
    /// Nothing left; the worker should shut down
    Exhausted,
}

/// Result of one `need_tests` request
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub tests: TestGroup,
    pub source: AllocationSource,
}

/// Group generator, dispatch pool and failed group queue
pub struct Scheduler {
    groups: TestGroups,
    pool: Vec<TestGroup>,
    failed: VecDeque<TestGroup>,
    /// Known provider tags, longest first
    providers: Vec<ProviderTag>,
    max_providers: usize,
    cleanup_policy: CleanupPolicy,
    total: usize,
    sent_tests: usize,
}

impl Scheduler {
    pub fn new(collection: Vec<TestId>, config: &SchedulerConfig) -> Self {
        let mut providers: Vec<ProviderTag> = Vec::new();
        for tag in &config.provider_tags {
            if !providers.contains(tag) {
                providers.push(tag.clone());
            }
        }
        // Stable: tags of equal length keep their configured order
        providers.sort_by(|a, b| b.len().cmp(&a.len()));

        Self {
            total: collection.len(),
            groups: TestGroups::new(collection),
            pool: Vec::new(),
            failed: VecDeque::new(),
            providers,
            max_providers: config.max_providers_per_worker.max(1),
            cleanup_policy: config.cleanup_policy,
            sent_tests: 0,
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn sent_tests(&self) -> usize {
        self.sent_tests
    }

    pub fn providers(&self) -> &[ProviderTag] {
        &self.providers
    }

    /// Groups not dispatched yet, including the failed queue
    pub fn pending(&self) -> usize {
        self.pool.len() + self.failed.len()
    }

    /// Provider tags of a group, longest first.
    ///
    /// Only parametrized ids are considered.
    pub fn providers_of(&self, group: &[TestId]) -> Vec<ProviderTag> {
        self.providers
            .iter()
            .filter(|tag| {
                group
                    .iter()
                    .any(|test| test.contains('[') && test.contains(tag.as_str()))
            })
            .cloned()
            .collect()
    }

    /// Queue the unreported remainder of a crashed worker's tests
    pub fn requeue_failed(&mut self, tests: TestGroup) {
        if tests.is_empty() {
            return;
        }
        self.sent_tests = self.sent_tests.saturating_sub(tests.len());
        self.failed.push_back(tests);
    }

    fn fill_pool(&mut self) {
        if self.pool.is_empty() {
            self.pool.extend(self.groups.by_ref());
        }
    }

    /// Pick the next group for a worker and record it as in flight
    pub async fn allocate(
        &mut self,
        registry: &mut SlaveRegistry,
        id: &WorkerId,
    ) -> Result<Allocation> {
        let allocation = self.select(registry, id).await?;
        registry.dispatch(id, &allocation.tests)?;
        self.sent_tests += allocation.tests.len();
        Ok(allocation)
    }

    async fn select(&mut self, registry: &mut SlaveRegistry, id: &WorkerId) -> Result<Allocation> {
        // Failed groups go first; they keep the receiver's affinity as is
        if let Some(tests) = self.failed.pop_front() {
            return Ok(Allocation {
                tests,
                source: AllocationSource::Failed,
            });
        }

        self.fill_pool();
        if self.pool.is_empty() {
            return Ok(Allocation {
                tests: Vec::new(),
                source: AllocationSource::Exhausted,
            });
        }

        let record = registry
            .get(id)
            .ok_or_else(|| Error::UnknownPeer(id.to_string()))?;
        let affinity = record.provider_affinity.clone();
        let appliance = record.appliance.clone();
        let has_capacity = affinity.len() < self.max_providers;
        let claimed: Vec<ProviderTag> = registry
            .records()
            .filter(|r| &r.id != id)
            .flat_map(|r| r.provider_affinity.iter().cloned())
            .collect();

        // (pool index, provider to bind)
        let mut choice: Option<(usize, Option<ProviderTag>)> = None;
        let mut fallback: Option<(usize, Option<ProviderTag>)> = None;
        for (idx, group) in self.pool.iter().enumerate() {
            let provs = self.providers_of(group);
            let Some(lead) = provs.first() else {
                choice = Some((idx, None));
                break;
            };
            if provs.iter().any(|p| affinity.contains(p)) {
                choice = Some((idx, None));
                break;
            }
            if !has_capacity {
                continue;
            }
            if !claimed.contains(lead) {
                choice = Some((idx, Some(lead.clone())));
                break;
            }
            if fallback.is_none() {
                fallback = Some((idx, Some(lead.clone())));
            }
        }

        if let Some((idx, provider)) = choice.or(fallback) {
            if let Some(provider) = provider {
                self.bind(registry, id, provider)?;
            }
            return Ok(self.take(idx));
        }

        // Every pool group needs a provider this worker cannot take on
        let provider = self
            .providers_of(&self.pool[0])
            .into_iter()
            .next()
            .ok_or_else(|| Error::Internal("pool group without providers".to_string()))?;
        let (cleaned, cleanup_error) = self.cleanup(&appliance).await;
        if let Some(record) = registry.get_mut(id) {
            record.provider_affinity = vec![provider.clone()];
        }

        let mut allocation = self.take(0);
        allocation.source = AllocationSource::Reassigned {
            provider,
            cleanup_error,
            cleaned,
        };
        Ok(allocation)
    }

    fn bind(&self, registry: &mut SlaveRegistry, id: &WorkerId, provider: ProviderTag) -> Result<()> {
        let record = registry
            .get_mut(id)
            .ok_or_else(|| Error::UnknownPeer(id.to_string()))?;
        debug!("{} takes provider {}", id, provider);
        record.provider_affinity.push(provider);
        Ok(())
    }

    fn take(&mut self, idx: usize) -> Allocation {
        Allocation {
            tests: self.pool.remove(idx),
            source: AllocationSource::Pool,
        }
    }

    async fn cleanup(&self, appliance: &ApplianceRef) -> (bool, Option<String>) {
        match self.cleanup_policy {
            CleanupPolicy::ReassignOnly => (false, None),
            CleanupPolicy::DeleteAllProviders => {
                info!("Removing providers from {}", appliance.describe());
                match appliance.delete_all_providers().await {
                    Ok(()) => (true, None),
                    Err(e) => (true, Some(e.to_string())),
                }
            }
        }
    }

    /// Progress line printed after a dispatch
    pub fn progress(&self, count: usize, worker: &WorkerId) -> String {
        let pct = if self.total == 0 {
            100.0
        } else {
            self.sent_tests as f64 * 100.0 / self.total as f64
        };
        format!(
            "sent {} tests to {} ({}/{}, {:.1}%)",
            count, worker, self.sent_tests, self.total, pct
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::{registry, FakeAppliance};
    use std::sync::atomic::Ordering;

    fn ids(items: &[&str]) -> Vec<TestId> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn config(tags: &[&str]) -> SchedulerConfig {
        SchedulerConfig {
            provider_tags: ids(tags),
            ..Default::default()
        }
    }

    fn w(n: usize) -> WorkerId {
        WorkerId::new(format!("slave{:02}", n))
    }

    #[test]
    fn test_param_id() {
        assert_eq!(param_id("a.py::t1"), NO_PARAMS);
        assert_eq!(param_id("a.py::t1[prov_a]"), "prov_a");
        assert_eq!(param_id("a.py::t1[prov_a-[x]]"), "prov_a-[x]");
        assert_eq!(file_part("dir/a.py::Cls::t1"), "dir/a.py");
    }

    #[test]
    fn test_groups_split_by_file() {
        let groups: Vec<_> =
            TestGroups::new(ids(&["a.py::t1", "a.py::t2", "b.py::t3", "b.py::t4"])).collect();
        assert_eq!(
            groups,
            vec![ids(&["a.py::t1", "a.py::t2"]), ids(&["b.py::t3", "b.py::t4"])]
        );
    }

    #[test]
    fn test_groups_split_by_param_in_first_seen_order() {
        let collection = ids(&[
            "a.py::t1[p2]",
            "a.py::t2",
            "a.py::t1[p1]",
            "a.py::t3[p2]",
            "b.py::t1[p1]",
        ]);
        let groups: Vec<_> = TestGroups::new(collection).collect();
        assert_eq!(
            groups,
            vec![
                ids(&["a.py::t1[p2]", "a.py::t3[p2]"]),
                ids(&["a.py::t2"]),
                ids(&["a.py::t1[p1]"]),
                ids(&["b.py::t1[p1]"]),
            ]
        );
    }

    #[test]
    fn test_non_consecutive_files_are_separate_groups() {
        let groups: Vec<_> =
            TestGroups::new(ids(&["a.py::t1", "b.py::t2", "a.py::t3"])).collect();
        assert_eq!(groups.len(), 3);
        assert!(TestGroups::new(Vec::new()).next().is_none());
    }

    #[test]
    fn test_providers_longest_first() {
        let scheduler = Scheduler::new(Vec::new(), &config(&["rhevm-4", "rhevm-4.2", "vsphere"]));
        assert_eq!(scheduler.providers(), &ids(&["rhevm-4.2", "rhevm-4", "vsphere"])[..]);
        assert_eq!(
            scheduler.providers_of(&ids(&["a.py::t[rhevm-4.2]"])),
            ids(&["rhevm-4.2", "rhevm-4"])
        );
        // Tags only count inside parametrize ids
        assert!(scheduler.providers_of(&ids(&["vsphere.py::t"])).is_empty());
    }

    #[tokio::test]
    async fn test_happy_path_without_providers() {
        let (mut reg, _) = registry(2);
        let mut scheduler = Scheduler::new(
            ids(&["a.py::t1", "a.py::t2", "b.py::t3", "b.py::t4"]),
            &config(&[]),
        );

        let first = scheduler.allocate(&mut reg, &w(1)).await.unwrap();
        assert_eq!(first.tests, ids(&["a.py::t1", "a.py::t2"]));
        let second = scheduler.allocate(&mut reg, &w(0)).await.unwrap();
        assert_eq!(second.tests, ids(&["b.py::t3", "b.py::t4"]));
        assert_eq!(scheduler.sent_tests(), 4);
        assert_eq!(reg.get(&w(0)).unwrap().in_flight, second.tests);

        let done = scheduler.allocate(&mut reg, &w(0)).await.unwrap();
        assert!(done.tests.is_empty());
        assert_eq!(done.source, AllocationSource::Exhausted);
        assert_eq!(scheduler.progress(2, &w(0)), "sent 2 tests to slave00 (4/4, 100.0%)");
    }

    #[tokio::test]
    async fn test_provider_affinity_spreads_providers() {
        let (mut reg, _) = registry(2);
        let mut scheduler = Scheduler::new(
            ids(&["a.py::t1[prov_a]", "b.py::t2[prov_a]", "c.py::t3[prov_b]"]),
            &config(&["prov_a", "prov_b"]),
        );

        let g = scheduler.allocate(&mut reg, &w(0)).await.unwrap();
        assert_eq!(g.tests, ids(&["a.py::t1[prov_a]"]));
        assert_eq!(reg.get(&w(0)).unwrap().provider_affinity, ids(&["prov_a"]));

        let g = scheduler.allocate(&mut reg, &w(1)).await.unwrap();
        assert_eq!(g.tests, ids(&["c.py::t3[prov_b]"]));
        assert_eq!(reg.get(&w(1)).unwrap().provider_affinity, ids(&["prov_b"]));

        let g = scheduler.allocate(&mut reg, &w(0)).await.unwrap();
        assert_eq!(g.tests, ids(&["b.py::t2[prov_a]"]));

        let g = scheduler.allocate(&mut reg, &w(1)).await.unwrap();
        assert!(g.tests.is_empty());
    }

    #[tokio::test]
    async fn test_full_worker_is_cleaned_and_reassigned() {
        let (mut reg, _) = registry(1);
        let appliance = FakeAppliance::new("https://fake");
        let id = reg.register(appliance.clone());
        let mut scheduler = Scheduler::new(
            ids(&["a.py::t1[prov_a]", "b.py::t2[prov_b]"]),
            &config(&["prov_a", "prov_b"]),
        );

        let g = scheduler.allocate(&mut reg, &id).await.unwrap();
        assert_eq!(g.tests, ids(&["a.py::t1[prov_a]"]));

        let g = scheduler.allocate(&mut reg, &id).await.unwrap();
        assert_eq!(g.tests, ids(&["b.py::t2[prov_b]"]));
        assert_eq!(
            g.source,
            AllocationSource::Reassigned {
                provider: "prov_b".to_string(),
                cleanup_error: None,
                cleaned: true,
            }
        );
        assert_eq!(appliance.cleanups.load(Ordering::SeqCst), 1);
        assert_eq!(reg.get(&id).unwrap().provider_affinity, ids(&["prov_b"]));
    }

    #[tokio::test]
    async fn test_reassign_only_policy_skips_cleanup() {
        let (mut reg, _) = registry(0);
        let appliance = FakeAppliance::new("https://fake");
        let id = reg.register(appliance.clone());
        let mut scheduler = Scheduler::new(
            ids(&["a.py::t1[prov_a]", "b.py::t2[prov_b]"]),
            &SchedulerConfig {
                cleanup_policy: CleanupPolicy::ReassignOnly,
                ..config(&["prov_a", "prov_b"])
            },
        );
        scheduler.allocate(&mut reg, &id).await.unwrap();
        let g = scheduler.allocate(&mut reg, &id).await.unwrap();
        assert!(matches!(g.source, AllocationSource::Reassigned { cleaned: false, .. }));
        assert_eq!(appliance.cleanups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_groups_go_first_without_rebinding() {
        let (mut reg, _) = registry(2);
        let mut scheduler = Scheduler::new(
            ids(&["a.py::t1[prov_a]", "a.py::t2[prov_a]", "a.py::t3[prov_a]", "b.py::t4"]),
            &config(&["prov_a"]),
        );
        let g = scheduler.allocate(&mut reg, &w(0)).await.unwrap();
        assert_eq!(g.tests.len(), 3);
        assert_eq!(scheduler.sent_tests(), 3);

        scheduler.requeue_failed(ids(&["a.py::t2[prov_a]", "a.py::t3[prov_a]"]));
        assert_eq!(scheduler.sent_tests(), 1);

        let g = scheduler.allocate(&mut reg, &w(1)).await.unwrap();
        assert_eq!(g.source, AllocationSource::Failed);
        assert_eq!(g.tests, ids(&["a.py::t2[prov_a]", "a.py::t3[prov_a]"]));
        assert!(reg.get(&w(1)).unwrap().provider_affinity.is_empty());
        assert_eq!(scheduler.sent_tests(), 3);
    }

    #[tokio::test]
    async fn test_untagged_group_goes_to_full_worker() {
        let (mut reg, _) = registry(1);
        let mut scheduler = Scheduler::new(
            ids(&["a.py::t1[prov_a]", "b.py::t2[prov_b]", "c.py::t3"]),
            &config(&["prov_a", "prov_b"]),
        );
        scheduler.allocate(&mut reg, &w(0)).await.unwrap();
        let g = scheduler.allocate(&mut reg, &w(0)).await.unwrap();
        assert_eq!(g.tests, ids(&["c.py::t3"]));
        assert_eq!(g.source, AllocationSource::Pool);
    }

    #[tokio::test]
    async fn test_unknown_worker_is_an_error() {
        let (mut reg, _) = registry(0);
        let mut scheduler = Scheduler::new(ids(&["a.py::t1"]), &config(&[]));
        assert!(scheduler.allocate(&mut reg, &w(7)).await.is_err());
    }
}
