//! Concurrent execution of a dependency graph.
//! See [`Graph::run`] for more details.

use super::cancel::{canceled, is_canceled, FirstError};
use anyhow::{bail, Context as _, Result};
use futures_util::future::join_all;
use std::{
    collections::{BTreeMap, BTreeSet},
    future::Future,
    sync::atomic::{AtomicUsize, Ordering},
};
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

/// A directed acyclic graph of work items. An edge `a -> b` means `a` waits
/// for `b` to finish.
pub struct Graph<K> {
    dependencies: BTreeMap<K, BTreeSet<K>>,
}

impl<K> Default for Graph<K> {
    fn default() -> Self {
        Graph {
            dependencies: BTreeMap::new(),
        }
    }
}

/// Gate of a single node: opens once `pending` reaches zero.
struct Gate {
    pending: AtomicUsize,
    notify: Notify,
}

impl Gate {
    fn release(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            // notify_one stores a permit if nobody is waiting yet
            self.notify.notify_one();
        }
    }
}

impl<K> Graph<K>
where
    K: Ord + Clone + std::fmt::Display,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, key: K) {
        self.dependencies.entry(key).or_default();
    }

    /// Make `node` wait for `dependency`. Both are added if needed.
    pub fn add_dependency(&mut self, node: K, dependency: K) {
        self.dependencies.entry(dependency.clone()).or_default();
        self.dependencies.entry(node).or_default().insert(dependency);
    }

    pub fn dependencies(&self, key: &K) -> Option<&BTreeSet<K>> {
        self.dependencies.get(key)
    }

    /// Find a cycle, if any.
    pub fn find_cycle(&self) -> Option<Cycle<K>> {
        // Peel off everything that can complete; whatever remains is on or
        // behind a cycle.
        let mut pending: BTreeMap<&K, usize> = self
            .dependencies
            .iter()
            .map(|(k, deps)| (k, deps.len()))
            .collect();
        let mut dependents: BTreeMap<&K, Vec<&K>> = BTreeMap::new();
        for (k, deps) in &self.dependencies {
            for d in deps {
                dependents.entry(d).or_default().push(k);
            }
        }
        let mut ready: Vec<&K> = pending
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(k, _)| *k)
            .collect();
        while let Some(k) = ready.pop() {
            pending.remove(k);
            for d in dependents.get(k).into_iter().flatten() {
                if let Some(n) = pending.get_mut(d) {
                    *n -= 1;
                    if *n == 0 {
                        ready.push(d);
                    }
                }
            }
        }
        let remaining: Vec<&K> = pending.keys().copied().collect();
        for start in remaining {
            let outgoing: Vec<K> = self.dependencies[start].iter().cloned().collect();
            if let Some(mut path) =
                find_path_to(&mut BTreeSet::new(), &self.dependencies, start, &outgoing)
            {
                path.reverse();
                return Some(Cycle { path });
            }
        }
        None
    }

    /// Run `work` for every node, each as soon as its dependencies are done.
    ///
    /// All nodes are started at once and wait at their gate. Once open, a
    /// node waits for a permit from `limiter`, which bounds how many `work`
    /// calls are in flight.
    ///
    /// The first failing node cancels the pass: nodes that have not started
    /// their work yet return without doing it, work already in flight is
    /// left to finish. The first error that is not a cancellation is
    /// returned. If `cancel` is canceled from the outside, the pass stops
    /// the same way and returns [`super::cancel::Canceled`].
    pub async fn run<F, Fut>(
        &self,
        limiter: &Semaphore,
        cancel: &CancellationToken,
        work: F,
    ) -> Result<()>
    where
        F: Fn(K) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if let Some(cycle) = self.find_cycle() {
            bail!("Dependency cycle detected: {}", cycle);
        }

        let cancel = cancel.child_token();
        let gates: BTreeMap<&K, Gate> = self
            .dependencies
            .iter()
            .map(|(k, deps)| {
                (
                    k,
                    Gate {
                        pending: AtomicUsize::new(deps.len()),
                        notify: Notify::new(),
                    },
                )
            })
            .collect();
        let mut dependents: BTreeMap<&K, Vec<&K>> = BTreeMap::new();
        for (k, deps) in &self.dependencies {
            for d in deps {
                dependents.entry(d).or_default().push(k);
            }
        }
        let errors = FirstError::new();

        let tasks = self.dependencies.keys().map(|key| {
            let (gates, dependents, errors, cancel, work) =
                (&gates, &dependents, &errors, &cancel, &work);
            async move {
                let r = wait_and_work(&gates[key], limiter, cancel, || work(key.clone())).await;
                match r {
                    Ok(()) => {
                        for d in dependents.get(key).into_iter().flatten() {
                            gates[d].release();
                        }
                    }
                    // dependents stay gated, so the pass has to end here
                    Err(e) => {
                        if !is_canceled(&e) {
                            tracing::debug!(node = %key, "task failed, canceling pass");
                        }
                        errors.record(e);
                        cancel.cancel();
                    }
                }
            }
        });
        join_all(tasks).await;

        match errors.into_inner() {
            Some(e) => Err(e),
            None if cancel.is_cancelled() => Err(canceled()),
            None => Ok(()),
        }
    }
}

async fn wait_and_work<F, Fut>(
    gate: &Gate,
    limiter: &Semaphore,
    cancel: &CancellationToken,
    work: F,
) -> Result<()>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    if gate.pending.load(Ordering::SeqCst) > 0 {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(canceled()),
            _ = gate.notify.notified() => {}
        }
    }
    let _permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(canceled()),
        permit = limiter.acquire() => permit.context("executor closed")?,
    };
    if cancel.is_cancelled() {
        return Err(canceled());
    }
    work().await
}

// Naive path search, as the graphs are small and this runs only once we
// know a cycle exists.
fn find_path_to<K: Ord + Clone>(
    seen: &mut BTreeSet<K>,
    dependencies: &BTreeMap<K, BTreeSet<K>>,
    needle: &K,
    outgoing: &[K],
) -> Option<Vec<K>> {
    if outgoing.contains(needle) {
        return Some(vec![needle.clone()]);
    }
    for edge in outgoing {
        if seen.contains(edge) {
            continue;
        }
        seen.insert(edge.clone());

        if let Some(next) = dependencies.get(edge) {
            let next: Vec<K> = next.iter().cloned().collect();
            if let Some(mut path) = find_path_to(seen, dependencies, needle, &next) {
                path.push(edge.clone());
                return Some(path);
            }
        }
    }
    None
}

/// A cycle in a [`Graph`].
/// The first element of `path()` depends on the second element, and so
/// forth. The last element depends on the first, which is not repeated.
#[derive(Clone)]
pub struct Cycle<Key> {
    path: Vec<Key>,
}
impl<Key> Cycle<Key> {
    pub fn path(&self) -> &Vec<Key> {
        &self.path
    }
}
impl<Key: std::fmt::Display> std::fmt::Display for Cycle<Key> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for k in &self.path {
            write!(f, "{} -> ", k)?;
        }
        match self.path.first() {
            Some(first) => write!(f, "{}", first),
            None => Ok(()),
        }
    }
}
impl<Key: std::fmt::Debug> std::fmt::Debug for Cycle<Key> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cycle").field("path", &self.path).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::cancel::is_canceled;
    use anyhow::{anyhow, Context as _};
    use std::{sync::Mutex, time::Duration};

    fn chain(n: u64) -> Graph<u64> {
        let mut g = Graph::new();
        for i in 1..n {
            g.add_dependency(i, i - 1);
        }
        g
    }

    #[tokio::test]
    async fn test_dependencies_finish_first() {
        let mut g = chain(5);
        g.add_dependency(10, 2);
        let order = Mutex::new(Vec::new());
        let limiter = Semaphore::new(5);
        g.run(&limiter, &CancellationToken::new(), |k| {
            let order = &order;
            async move {
                tokio::time::sleep(Duration::from_millis(10 * (5 - k.min(5)))).await;
                order.lock().unwrap().push(k);
                Ok::<(), anyhow::Error>(())
            }
        })
        .await
        .unwrap();
        let order = order.into_inner().unwrap();
        let pos = |k| order.iter().position(|x| *x == k).unwrap();
        assert_eq!(order.len(), 6);
        for i in 1..5 {
            assert!(pos(i - 1) < pos(i));
        }
        assert!(pos(2) < pos(10));
    }

    #[tokio::test]
    async fn test_bounded_execution() {
        let mut g = Graph::new();
        for i in 0..20u64 {
            g.add_node(i);
        }
        let in_flight = AtomicUsize::new(0);
        let max = AtomicUsize::new(0);
        let limiter = Semaphore::new(3);
        g.run(&limiter, &CancellationToken::new(), |_| {
            let (in_flight, max) = (&in_flight, &max);
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok::<(), anyhow::Error>(())
            }
        })
        .await
        .unwrap();
        assert_eq!(max.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failure_cancels_waiting_nodes() {
        let g = chain(6);
        let ran = Mutex::new(Vec::new());
        let limiter = Semaphore::new(5);
        let r = g
            .run(&limiter, &CancellationToken::new(), |k| {
                let ran = &ran;
                async move {
                    ran.lock().unwrap().push(k);
                    if k == 2 {
                        Err(anyhow!("node {} failed", k))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;
        assert_eq!(r.unwrap_err().to_string(), "node 2 failed");
        assert_eq!(ran.into_inner().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_external_cancel() {
        let g = chain(3);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let limiter = Semaphore::new(1);
        let r = g
            .run(&limiter, &cancel, |_| async {
                let r: Result<()> = Err(anyhow!("must not run"));
                r
            })
            .await;
        assert!(is_canceled(&r.unwrap_err()));
    }

    #[tokio::test]
    async fn test_work_reporting_cancellation_ends_the_pass() {
        let g = chain(3);
        let ran = Mutex::new(Vec::new());
        let limiter = Semaphore::new(5);
        let cancel = CancellationToken::new();
        let r = tokio::time::timeout(
            Duration::from_secs(5),
            g.run(&limiter, &cancel, |k| {
                let ran = &ran;
                async move {
                    ran.lock().unwrap().push(k);
                    Err::<(), _>(canceled()).context("stopped by the resource")
                }
            }),
        )
        .await
        .expect("pass must not hang");
        assert!(is_canceled(&r.unwrap_err()));
        assert_eq!(ran.into_inner().unwrap(), vec![0]);
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_cyclic() {
        let mut g = Graph::new();
        for i in 0..10u64 {
            g.add_dependency(i, (i + 1) % 10);
        }
        g.add_dependency(20, 3);
        let cycle = g.find_cycle().unwrap();
        assert_eq!(cycle.path().len(), 10);
        let limiter = Semaphore::new(1);
        let r = g
            .run(&limiter, &CancellationToken::new(), |_| async {
                Ok::<(), anyhow::Error>(())
            })
            .await;
        assert!(r
            .unwrap_err()
            .to_string()
            .starts_with("Dependency cycle detected"));
        assert!(chain(4).find_cycle().is_none());
    }

    #[test]
    fn test_cycle_path_order() {
        let mut g = Graph::new();
        g.add_dependency("a", "b");
        g.add_dependency("b", "c");
        g.add_dependency("c", "a");
        let cycle = g.find_cycle().unwrap();
        // every element depends on the next one
        let path = cycle.path();
        for i in 0..path.len() {
            let next = &path[(i + 1) % path.len()];
            assert!(g.dependencies(&path[i]).unwrap().contains(next));
        }
        assert_eq!(cycle.to_string().matches(" -> ").count(), 3);
    }
}
