//! Synchronization analysis: lock inventories, the thread/resource wait
//! graph, deadlock cycle detection, and contention hotspots.
//!
//! The wait graph is an id-keyed edge list; cycle detection is Tarjan's SCC
//! over those ids, so cyclic waits never become cyclic data structures.

use rustc_hash::FxHashMap;

use crate::models::report::{
    ContentionHotspot, ContentionSeverity, CrashReport, DeadlockInfo, MonitorLock,
    ReaderWriterLockInfo, ResetEventInfo, SemaphoreSlimInfo, SynchronizationSection, WaitGraph,
    WaitGraphEdge, WaitGraphNode, WaitHandleInfo,
};
use crate::services::runtime::RuntimeReader;

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncAnalysisOptions {
    /// Skip sync-block decoding for cross-architecture / emulated dumps where
    /// the block table layout cannot be trusted.
    pub skip_sync_blocks: bool,
}

pub fn analyze_synchronization(
    runtime: &dyn RuntimeReader,
    options: SyncAnalysisOptions,
) -> SynchronizationSection {
    let mut section = SynchronizationSection {
        skip_sync_blocks: options.skip_sync_blocks,
        ..Default::default()
    };

    if !options.skip_sync_blocks {
        section.monitor_locks = runtime
            .sync_blocks()
            .into_iter()
            .map(|block| MonitorLock {
                object_address: format!("{:#x}", block.object_address),
                object_type: block.object_type,
                owner_thread_id: block.owner_os_tid.map(thread_label),
                waiter_thread_ids: block.waiter_os_tids.into_iter().map(thread_label).collect(),
                recursion_count: block.recursion,
            })
            .collect();
    }

    section.semaphore_slims = runtime
        .semaphore_slims()
        .into_iter()
        .map(|sem| {
            let sync_waiters = sem.sync_waiter_tids.len() as u32;
            SemaphoreSlimInfo {
                address: format!("{:#x}", sem.address),
                current_count: sem.current_count,
                max_count: sem.max_count,
                sync_waiters,
                async_waiters: sem.async_waiter_count,
                is_async_lock: sem.max_count == 1,
                is_contended: sem.current_count == 0
                    && (sync_waiters > 0 || sem.async_waiter_count > 0),
            }
        })
        .collect();

    section.reader_writer_locks = runtime
        .reader_writer_locks()
        .into_iter()
        .map(|lock| ReaderWriterLockInfo {
            address: format!("{:#x}", lock.address),
            writer_thread_id: lock.writer_os_tid.map(thread_label),
            reader_count: lock.reader_count,
            waiting_writers: lock.waiting_writer_tids.len() as u32,
            waiting_readers: lock.waiting_reader_tids.len() as u32,
        })
        .collect();

    section.reset_events = runtime
        .reset_events()
        .into_iter()
        .map(|event| ResetEventInfo {
            address: format!("{:#x}", event.address),
            kind: event.kind,
            is_set: event.is_set,
            waiter_count: event.waiter_tids.len() as u32,
        })
        .collect();

    section.wait_handles = runtime
        .wait_handles()
        .into_iter()
        .map(|handle| WaitHandleInfo {
            address: format!("{:#x}", handle.address),
            handle_type: handle.handle_type,
            waiter_thread_ids: handle.waiter_tids.into_iter().map(thread_label).collect(),
        })
        .collect();

    build_wait_graph(runtime, &mut section, options.skip_sync_blocks);
    section.potential_deadlock_cycles = detect_cycles(&section.wait_graph);
    section.contention_hotspots = contention_hotspots(&section);

    section
}

fn thread_label(os_tid: u32) -> String {
    format!("{os_tid:#x}")
}

fn thread_node_id(os_tid: u32) -> String {
    format!("thread:{os_tid:#x}")
}

fn resource_node_id(address: u64) -> String {
    format!("resource:{address:#x}")
}

/// Nodes are threads and resources; a blocked thread points at the resource
/// it waits on, and an owned resource points back at its owner thread.
fn build_wait_graph(
    runtime: &dyn RuntimeReader,
    section: &mut SynchronizationSection,
    skip_sync_blocks: bool,
) {
    let mut graph = WaitGraph::default();
    let mut seen_threads: Vec<u32> = Vec::new();

    let add_thread = |graph: &mut WaitGraph, seen: &mut Vec<u32>, tid: u32| {
        if !seen.contains(&tid) {
            seen.push(tid);
            graph.nodes.push(WaitGraphNode {
                id: thread_node_id(tid),
                kind: "thread".to_string(),
                label: thread_label(tid),
            });
        }
    };

    if !skip_sync_blocks {
        for block in runtime.sync_blocks() {
            let resource = resource_node_id(block.object_address);
            graph.nodes.push(WaitGraphNode {
                id: resource.clone(),
                kind: "resource".to_string(),
                label: block.object_type.clone(),
            });
            for waiter in &block.waiter_os_tids {
                add_thread(&mut graph, &mut seen_threads, *waiter);
                graph.edges.push(WaitGraphEdge {
                    from: thread_node_id(*waiter),
                    to: resource.clone(),
                    relation: "waits".to_string(),
                });
            }
            if let Some(owner) = block.owner_os_tid {
                add_thread(&mut graph, &mut seen_threads, owner);
                graph.edges.push(WaitGraphEdge {
                    from: resource.clone(),
                    to: thread_node_id(owner),
                    relation: "owned by".to_string(),
                });
            }
        }
    }

    for lock in runtime.reader_writer_locks() {
        let resource = resource_node_id(lock.address);
        graph.nodes.push(WaitGraphNode {
            id: resource.clone(),
            kind: "resource".to_string(),
            label: "ReaderWriterLockSlim".to_string(),
        });
        for waiter in lock.waiting_writer_tids.iter().chain(&lock.waiting_reader_tids) {
            add_thread(&mut graph, &mut seen_threads, *waiter);
            graph.edges.push(WaitGraphEdge {
                from: thread_node_id(*waiter),
                to: resource.clone(),
                relation: "waits".to_string(),
            });
        }
        if let Some(owner) = lock.writer_os_tid {
            add_thread(&mut graph, &mut seen_threads, owner);
            graph.edges.push(WaitGraphEdge {
                from: resource.clone(),
                to: thread_node_id(owner),
                relation: "owned by".to_string(),
            });
        }
    }

    for sem in runtime.semaphore_slims() {
        if sem.sync_waiter_tids.is_empty() {
            continue;
        }
        let resource = resource_node_id(sem.address);
        graph.nodes.push(WaitGraphNode {
            id: resource.clone(),
            kind: "resource".to_string(),
            label: "SemaphoreSlim".to_string(),
        });
        for waiter in &sem.sync_waiter_tids {
            add_thread(&mut graph, &mut seen_threads, *waiter);
            graph.edges.push(WaitGraphEdge {
                from: thread_node_id(*waiter),
                to: resource.clone(),
                relation: "waits".to_string(),
            });
        }
    }

    section.wait_graph = graph;
}

/// Tarjan SCC over the wait graph. Components with more than one node are
/// wait cycles.
fn detect_cycles(graph: &WaitGraph) -> Vec<Vec<String>> {
    let mut index_of: FxHashMap<&str, usize> = FxHashMap::default();
    for (i, node) in graph.nodes.iter().enumerate() {
        index_of.insert(node.id.as_str(), i);
    }
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); graph.nodes.len()];
    for edge in &graph.edges {
        if let (Some(&from), Some(&to)) =
            (index_of.get(edge.from.as_str()), index_of.get(edge.to.as_str()))
        {
            adjacency[from].push(to);
        }
    }

    struct Tarjan<'a> {
        adjacency: &'a [Vec<usize>],
        index: Vec<Option<usize>>,
        lowlink: Vec<usize>,
        on_stack: Vec<bool>,
        stack: Vec<usize>,
        counter: usize,
        components: Vec<Vec<usize>>,
    }

    impl Tarjan<'_> {
        fn strongconnect(&mut self, v: usize) {
            self.index[v] = Some(self.counter);
            self.lowlink[v] = self.counter;
            self.counter += 1;
            self.stack.push(v);
            self.on_stack[v] = true;

            for &w in &self.adjacency[v].to_vec() {
                if self.index[w].is_none() {
                    self.strongconnect(w);
                    self.lowlink[v] = self.lowlink[v].min(self.lowlink[w]);
                } else if self.on_stack[w] {
                    self.lowlink[v] = self.lowlink[v].min(self.index[w].unwrap());
                }
            }

            if self.lowlink[v] == self.index[v].unwrap() {
                let mut component = Vec::new();
                while let Some(w) = self.stack.pop() {
                    self.on_stack[w] = false;
                    component.push(w);
                    if w == v {
                        break;
                    }
                }
                self.components.push(component);
            }
        }
    }

    let node_count = graph.nodes.len();
    let mut tarjan = Tarjan {
        adjacency: &adjacency,
        index: vec![None; node_count],
        lowlink: vec![0; node_count],
        on_stack: vec![false; node_count],
        stack: Vec::new(),
        counter: 0,
        components: Vec::new(),
    };
    for v in 0..node_count {
        if tarjan.index[v].is_none() {
            tarjan.strongconnect(v);
        }
    }

    tarjan
        .components
        .into_iter()
        .filter(|c| c.len() > 1)
        .map(|mut component| {
            component.sort_unstable();
            component
                .into_iter()
                .map(|i| graph.nodes[i].id.clone())
                .collect()
        })
        .collect()
}

fn contention_hotspots(section: &SynchronizationSection) -> Vec<ContentionHotspot> {
    let mut hotspots = Vec::new();

    for lock in &section.monitor_locks {
        let waiters = lock.waiter_thread_ids.len();
        if waiters > 0 {
            hotspots.push(ContentionHotspot {
                resource: lock.object_address.clone(),
                resource_type: lock.object_type.clone(),
                waiter_count: waiters,
                severity: ContentionSeverity::from_waiter_count(waiters),
            });
        }
    }
    for sem in &section.semaphore_slims {
        let waiters = (sem.sync_waiters + sem.async_waiters) as usize;
        if sem.is_contended {
            hotspots.push(ContentionHotspot {
                resource: sem.address.clone(),
                resource_type: "SemaphoreSlim".to_string(),
                waiter_count: waiters,
                severity: ContentionSeverity::from_waiter_count(waiters),
            });
        }
    }
    for lock in &section.reader_writer_locks {
        let waiters = (lock.waiting_writers + lock.waiting_readers) as usize;
        if waiters > 0 {
            hotspots.push(ContentionHotspot {
                resource: lock.address.clone(),
                resource_type: "ReaderWriterLockSlim".to_string(),
                waiter_count: waiters,
                severity: ContentionSeverity::from_waiter_count(waiters),
            });
        }
    }

    hotspots.sort_by(|a, b| b.waiter_count.cmp(&a.waiter_count));
    hotspots
}

/// Attaches the section and, when a cycle exists, the thread-level deadlock
/// summary.
pub fn apply_to_report(report: &mut CrashReport, section: SynchronizationSection) {
    if !section.potential_deadlock_cycles.is_empty() {
        let mut involved_threads = Vec::new();
        let mut locks = Vec::new();
        for cycle in &section.potential_deadlock_cycles {
            for node in cycle {
                if let Some(tid) = node.strip_prefix("thread:") {
                    if !involved_threads.contains(&tid.to_string()) {
                        involved_threads.push(tid.to_string());
                    }
                } else if let Some(addr) = node.strip_prefix("resource:") {
                    if !locks.contains(&addr.to_string()) {
                        locks.push(addr.to_string());
                    }
                }
            }
        }
        report.analysis.threads.deadlock = Some(DeadlockInfo {
            detected: true,
            involved_threads,
            locks,
        });
    }
    report.analysis.synchronization = Some(section);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::runtime::fixtures::FakeRuntime;
    use crate::services::runtime::{SemaphoreData, SyncBlockData};

    /// Thread 0x10 owns lock A and waits on lock B; thread 0x20 owns B and
    /// waits on A.
    fn deadlocked_runtime() -> FakeRuntime {
        let mut runtime = FakeRuntime::open();
        runtime.sync_blocks = vec![
            SyncBlockData {
                object_address: 0xA000,
                object_type: "App.OrderLock".into(),
                owner_os_tid: Some(0x10),
                waiter_os_tids: vec![0x20],
                recursion: 1,
            },
            SyncBlockData {
                object_address: 0xB000,
                object_type: "App.StockLock".into(),
                owner_os_tid: Some(0x20),
                waiter_os_tids: vec![0x10],
                recursion: 1,
            },
        ];
        runtime
    }

    #[test]
    fn lock_cycle_is_detected() {
        let section = analyze_synchronization(&deadlocked_runtime(), SyncAnalysisOptions::default());

        assert_eq!(section.monitor_locks.len(), 2);
        assert_eq!(section.potential_deadlock_cycles.len(), 1);
        let cycle = &section.potential_deadlock_cycles[0];
        assert_eq!(cycle.len(), 4);
        assert!(cycle.iter().any(|n| n == "thread:0x10"));
        assert!(cycle.iter().any(|n| n == "resource:0xa000"));
    }

    #[test]
    fn deadlock_summary_reaches_report() {
        let section = analyze_synchronization(&deadlocked_runtime(), SyncAnalysisOptions::default());
        let mut report = CrashReport::default();
        apply_to_report(&mut report, section);

        let deadlock = report.analysis.threads.deadlock.unwrap();
        assert!(deadlock.detected);
        assert_eq!(deadlock.involved_threads.len(), 2);
        assert_eq!(deadlock.locks.len(), 2);
    }

    #[test]
    fn uncontended_locks_produce_no_cycle() {
        let mut runtime = FakeRuntime::open();
        runtime.sync_blocks = vec![SyncBlockData {
            object_address: 0xA000,
            object_type: "App.OrderLock".into(),
            owner_os_tid: Some(0x10),
            waiter_os_tids: vec![0x20, 0x30],
            recursion: 1,
        }];

        let section = analyze_synchronization(&runtime, SyncAnalysisOptions::default());
        assert!(section.potential_deadlock_cycles.is_empty());
        assert_eq!(section.contention_hotspots.len(), 1);
        assert_eq!(
            section.contention_hotspots[0].severity,
            ContentionSeverity::Medium
        );
    }

    #[test]
    fn semaphore_flags_derive_from_counts() {
        let mut runtime = FakeRuntime::open();
        runtime.semaphores = vec![
            SemaphoreData {
                address: 0x100,
                current_count: 0,
                max_count: 1,
                sync_waiter_tids: vec![0x10, 0x20],
                async_waiter_count: 3,
            },
            SemaphoreData {
                address: 0x200,
                current_count: 4,
                max_count: 8,
                sync_waiter_tids: vec![],
                async_waiter_count: 0,
            },
        ];

        let section = analyze_synchronization(&runtime, SyncAnalysisOptions::default());
        let contended = &section.semaphore_slims[0];
        assert!(contended.is_async_lock);
        assert!(contended.is_contended);
        assert_eq!(contended.sync_waiters, 2);
        assert_eq!(contended.async_waiters, 3);

        let idle = &section.semaphore_slims[1];
        assert!(!idle.is_async_lock);
        assert!(!idle.is_contended);
        // 5 waiters on the contended semaphore: high severity hotspot.
        assert_eq!(section.contention_hotspots.len(), 1);
        assert_eq!(
            section.contention_hotspots[0].severity,
            ContentionSeverity::High
        );
    }

    #[test]
    fn skip_sync_blocks_leaves_monitors_empty() {
        let section = analyze_synchronization(
            &deadlocked_runtime(),
            SyncAnalysisOptions {
                skip_sync_blocks: true,
            },
        );
        assert!(section.skip_sync_blocks);
        assert!(section.monitor_locks.is_empty());
        assert!(section.potential_deadlock_cycles.is_empty());
    }
}
