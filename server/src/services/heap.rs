//! Heap analysis over the managed-runtime reader: GC summary, top memory
//! consumers with owner discovery, and the combined walk.
//!
//! When the dump's runtime used Server GC the walk partitions by heap segment
//! across rayon workers; each worker folds its segment into a local table and
//! the results reduce into one aggregator behind a single mutex. Workstation
//! GC keeps the walk sequential.

use parking_lot::Mutex;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::models::report::{
    CrashReport, GcInfo, GenerationSizes, LeakAnalysis, LeakSeverity, MemoryObjectInstance,
    ObjectOwner, TypeMemoryStat,
};
use crate::services::runtime::{HeapObject, RawOwner, RuntimeReader};

#[derive(Debug, Clone, Copy)]
pub struct HeapAnalysisOptions {
    pub top_n: usize,
    pub timeout_ms: u64,
    /// Instances are attached only for types with at most this many objects.
    pub max_instances_per_type: usize,
}

impl Default for HeapAnalysisOptions {
    fn default() -> Self {
        Self {
            top_n: 20,
            timeout_ms: 30_000,
            max_instances_per_type: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcSummary {
    pub total_heap_size: u64,
    pub generation_sizes: GenerationSizes,
    pub is_server_gc: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TopConsumers {
    pub by_size: Vec<TypeMemoryStat>,
    pub by_count: Vec<TypeMemoryStat>,
    pub used_parallel: bool,
    pub segments_processed: usize,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CombinedHeapAnalysis {
    pub gc: GcSummary,
    pub top_consumers: TopConsumers,
    pub heap_stats: BTreeMap<String, serde_json::Value>,
}

pub fn get_gc_summary(runtime: &dyn RuntimeReader) -> GcSummary {
    let sizes = runtime.generation_sizes();
    GcSummary {
        total_heap_size: sizes.gen0 + sizes.gen1 + sizes.gen2 + sizes.loh + sizes.poh,
        generation_sizes: sizes,
        is_server_gc: runtime.is_server_gc(),
    }
}

#[derive(Default)]
struct TypeAggregate {
    type_name: String,
    method_table: u64,
    count: u64,
    total_size: u64,
    /// Capped at `max_instances_per_type + 1`; one past the cap is enough to
    /// know the type is over it.
    sample_addresses: Vec<(u64, u64)>,
}

type AggregateMap = FxHashMap<u64, TypeAggregate>;

pub fn get_top_memory_consumers(
    runtime: &dyn RuntimeReader,
    options: &HeapAnalysisOptions,
) -> TopConsumers {
    let deadline = Instant::now() + Duration::from_millis(options.timeout_ms);
    let segments = runtime.heap_segments();
    let use_parallel = runtime.is_server_gc() && segments.len() > 1;
    let sample_cap = options.max_instances_per_type + 1;

    let aggregator: Mutex<AggregateMap> = Mutex::new(FxHashMap::default());
    let processed = Mutex::new(0usize);
    let timed_out = Mutex::new(false);

    let walk_segment = |segment: &crate::services::runtime::HeapSegment| {
        if Instant::now() >= deadline {
            *timed_out.lock() = true;
            return;
        }
        let mut local: AggregateMap = FxHashMap::default();
        for object in runtime.objects_in_segment(segment) {
            fold_object(&mut local, object, sample_cap);
        }
        // Single reduce lock per segment; no nested locks.
        let mut shared = aggregator.lock();
        for (mt, partial) in local {
            let entry = shared.entry(mt).or_insert_with(|| TypeAggregate {
                type_name: partial.type_name.clone(),
                method_table: mt,
                ..Default::default()
            });
            entry.count += partial.count;
            entry.total_size += partial.total_size;
            for sample in partial.sample_addresses {
                if entry.sample_addresses.len() < sample_cap {
                    entry.sample_addresses.push(sample);
                }
            }
        }
        *processed.lock() += 1;
    };

    if use_parallel {
        debug!(segments = segments.len(), "parallel heap walk (server GC)");
        segments.par_iter().for_each(walk_segment);
    } else {
        segments.iter().for_each(walk_segment);
    }

    let aggregates = aggregator.into_inner();
    let segments_processed = processed.into_inner();
    let timed_out = timed_out.into_inner();

    let mut stats: Vec<TypeMemoryStat> = aggregates
        .into_values()
        .map(|agg| to_stat(runtime, agg, options.max_instances_per_type))
        .collect();

    let mut by_size = stats.clone();
    by_size.sort_by(|a, b| b.total_size.cmp(&a.total_size).then(a.type_name.cmp(&b.type_name)));
    by_size.truncate(options.top_n);

    stats.sort_by(|a, b| b.count.cmp(&a.count).then(a.type_name.cmp(&b.type_name)));
    stats.truncate(options.top_n);

    TopConsumers {
        by_size,
        by_count: stats,
        used_parallel: use_parallel,
        segments_processed,
        timed_out,
    }
}

fn fold_object(local: &mut AggregateMap, object: HeapObject, sample_cap: usize) {
    let entry = local.entry(object.method_table).or_insert_with(|| TypeAggregate {
        type_name: object.type_name.clone(),
        method_table: object.method_table,
        ..Default::default()
    });
    entry.count += 1;
    entry.total_size += object.size;
    if entry.sample_addresses.len() < sample_cap {
        entry.sample_addresses.push((object.address, object.size));
    }
}

fn to_stat(
    runtime: &dyn RuntimeReader,
    aggregate: TypeAggregate,
    max_instances_per_type: usize,
) -> TypeMemoryStat {
    let instances = if aggregate.count as usize <= max_instances_per_type {
        let items: Vec<MemoryObjectInstance> = aggregate
            .sample_addresses
            .iter()
            .take(max_instances_per_type)
            .map(|&(address, size)| MemoryObjectInstance {
                address: format!("{address:#x}"),
                size,
                owners: discover_owners(runtime, address),
            })
            .collect();
        (!items.is_empty()).then_some(items)
    } else {
        None
    };

    TypeMemoryStat {
        type_name: aggregate.type_name,
        method_table: Some(format!("{:#x}", aggregate.method_table)),
        count: aggregate.count,
        total_size: aggregate.total_size,
        instances,
    }
}

/// Owners are instance-field holders plus static roots. Static roots dedupe
/// by method-table address, falling back to the normalized type name when the
/// method table is unknown.
fn discover_owners(runtime: &dyn RuntimeReader, address: u64) -> Vec<ObjectOwner> {
    let mut owners = Vec::new();
    let mut seen_static: Vec<String> = Vec::new();

    for owner in runtime.owners_of(address) {
        match owner {
            RawOwner::Field {
                holder_address,
                holder_type,
                field,
            } => owners.push(ObjectOwner {
                kind: "field".to_string(),
                type_name: holder_type,
                field: Some(field),
                address: Some(format!("{holder_address:#x}")),
            }),
            RawOwner::StaticRoot {
                root_type,
                method_table,
                field,
            } => {
                let key = match method_table {
                    Some(mt) => format!("mt:{mt:#x}"),
                    None => format!("ty:{}", root_type.trim().to_lowercase()),
                };
                if seen_static.contains(&key) {
                    continue;
                }
                seen_static.push(key);
                owners.push(ObjectOwner {
                    kind: "static".to_string(),
                    type_name: root_type,
                    field: Some(field),
                    address: method_table.map(|mt| format!("{mt:#x}")),
                });
            }
        }
    }
    owners
}

pub fn get_combined_heap_analysis(
    runtime: &dyn RuntimeReader,
    options: &HeapAnalysisOptions,
) -> CombinedHeapAnalysis {
    let gc = get_gc_summary(runtime);
    let top_consumers = get_top_memory_consumers(runtime, options);

    let mut heap_stats = BTreeMap::new();
    heap_stats.insert(
        "typeCount".to_string(),
        serde_json::json!(top_consumers.by_count.len()),
    );
    heap_stats.insert(
        "totalHeapSize".to_string(),
        serde_json::json!(gc.total_heap_size),
    );
    heap_stats.insert(
        "usedParallel".to_string(),
        serde_json::json!(top_consumers.used_parallel),
    );
    heap_stats.insert(
        "segmentsProcessed".to_string(),
        serde_json::json!(top_consumers.segments_processed),
    );

    CombinedHeapAnalysis {
        gc,
        top_consumers,
        heap_stats,
    }
}

/// Writes the combined analysis into the report's memory section, including
/// the leak assessment derived from consumer dominance.
pub fn apply_to_report(report: &mut CrashReport, analysis: &CombinedHeapAnalysis) {
    report.analysis.memory.gc = Some(GcInfo {
        total_heap_size: analysis.gc.total_heap_size,
        generation_sizes: analysis.gc.generation_sizes,
    });
    report.analysis.memory.heap_stats = analysis.heap_stats.clone();

    let total = analysis.gc.total_heap_size;
    let top_share = analysis
        .top_consumers
        .by_size
        .first()
        .filter(|_| total > 0)
        .map(|top| top.total_size as f64 / total as f64)
        .unwrap_or(0.0);

    let severity = if top_share > 0.5 {
        LeakSeverity::High
    } else if top_share > 0.3 {
        LeakSeverity::Medium
    } else if top_share > 0.15 {
        LeakSeverity::Low
    } else {
        LeakSeverity::None
    };

    report.analysis.memory.leak_analysis = Some(LeakAnalysis {
        detected: severity != LeakSeverity::None,
        severity,
        total_heap_bytes: total,
        top_consumers: analysis
            .top_consumers
            .by_size
            .iter()
            .cloned()
            .take(10)
            .collect(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::runtime::fixtures::FakeRuntime;
    use crate::services::runtime::RawOwner;

    fn object(address: u64, mt: u64, type_name: &str, size: u64) -> HeapObject {
        HeapObject {
            address,
            method_table: mt,
            type_name: type_name.into(),
            size,
        }
    }

    fn two_segment_runtime() -> FakeRuntime {
        FakeRuntime::open()
            .with_objects(vec![
                object(0x100, 0xA, "System.String", 64),
                object(0x200, 0xA, "System.String", 64),
                object(0x300, 0xB, "App.BigBuffer", 4096),
            ])
            .with_objects(vec![
                object(0x1100, 0xA, "System.String", 64),
                object(0x1200, 0xC, "App.Session", 256),
            ])
    }

    #[test]
    fn sequential_walk_aggregates_by_type() {
        let runtime = two_segment_runtime();
        let consumers = get_top_memory_consumers(&runtime, &HeapAnalysisOptions::default());

        assert!(!consumers.used_parallel);
        assert_eq!(consumers.segments_processed, 2);
        assert!(!consumers.timed_out);

        let strings = consumers
            .by_count
            .iter()
            .find(|s| s.type_name == "System.String")
            .unwrap();
        assert_eq!(strings.count, 3);
        assert_eq!(strings.total_size, 192);
        assert_eq!(consumers.by_size[0].type_name, "App.BigBuffer");
    }

    #[test]
    fn server_gc_uses_parallel_walk_with_same_totals() {
        let mut runtime = two_segment_runtime();
        runtime.server_gc = true;
        let consumers = get_top_memory_consumers(&runtime, &HeapAnalysisOptions::default());

        assert!(consumers.used_parallel);
        assert_eq!(consumers.segments_processed, 2);
        let strings = consumers
            .by_count
            .iter()
            .find(|s| s.type_name == "System.String")
            .unwrap();
        assert_eq!(strings.count, 3);
    }

    #[test]
    fn rare_types_get_instances_with_owners() {
        let mut runtime = two_segment_runtime();
        runtime.owners.insert(
            0x300,
            vec![
                RawOwner::Field {
                    holder_address: 0x900,
                    holder_type: "App.Cache".into(),
                    field: "_buffer".into(),
                },
                RawOwner::StaticRoot {
                    root_type: "App.Globals".into(),
                    method_table: Some(0xD),
                    field: "Shared".into(),
                },
                RawOwner::StaticRoot {
                    root_type: "App.Globals".into(),
                    method_table: Some(0xD),
                    field: "SharedAlias".into(),
                },
            ],
        );

        let consumers = get_top_memory_consumers(&runtime, &HeapAnalysisOptions::default());
        let buffer = consumers
            .by_size
            .iter()
            .find(|s| s.type_name == "App.BigBuffer")
            .unwrap();
        let instances = buffer.instances.as_ref().unwrap();
        assert_eq!(instances.len(), 1);
        // Static roots with the same method table dedupe to one owner.
        assert_eq!(instances[0].owners.len(), 2);
        assert_eq!(instances[0].owners[0].kind, "field");
        assert_eq!(instances[0].owners[1].kind, "static");
    }

    #[test]
    fn static_root_dedupe_falls_back_to_type_name() {
        let runtime = FakeRuntime::open();
        let mut rt = runtime.with_objects(vec![object(0x10, 0x1, "App.Only", 8)]);
        rt.owners.insert(
            0x10,
            vec![
                RawOwner::StaticRoot {
                    root_type: " App.Globals ".into(),
                    method_table: None,
                    field: "A".into(),
                },
                RawOwner::StaticRoot {
                    root_type: "app.globals".into(),
                    method_table: None,
                    field: "B".into(),
                },
            ],
        );
        let consumers = get_top_memory_consumers(&rt, &HeapAnalysisOptions::default());
        let only = &consumers.by_size[0];
        assert_eq!(only.instances.as_ref().unwrap()[0].owners.len(), 1);
    }

    #[test]
    fn common_types_skip_instance_attachment() {
        let runtime = two_segment_runtime();
        let options = HeapAnalysisOptions {
            max_instances_per_type: 2,
            ..Default::default()
        };
        let consumers = get_top_memory_consumers(&runtime, &options);
        let strings = consumers
            .by_count
            .iter()
            .find(|s| s.type_name == "System.String")
            .unwrap();
        assert!(strings.instances.is_none());
    }

    #[test]
    fn zero_timeout_marks_timed_out() {
        let runtime = two_segment_runtime();
        let options = HeapAnalysisOptions {
            timeout_ms: 0,
            ..Default::default()
        };
        let consumers = get_top_memory_consumers(&runtime, &options);
        assert!(consumers.timed_out);
        assert_eq!(consumers.segments_processed, 0);
    }

    #[test]
    fn combined_analysis_feeds_leak_assessment() {
        let runtime = two_segment_runtime();
        let mut rt = runtime;
        rt.generation_sizes = GenerationSizes {
            gen0: 1024,
            gen1: 1024,
            gen2: 2048,
            loh: 512,
            poh: 0,
        };

        let analysis = get_combined_heap_analysis(&rt, &HeapAnalysisOptions::default());
        assert_eq!(analysis.gc.total_heap_size, 4608);

        let mut report = CrashReport::default();
        apply_to_report(&mut report, &analysis);
        let leak = report.analysis.memory.leak_analysis.unwrap();
        // BigBuffer (4096) dominates the 4608-byte heap.
        assert!(leak.detected);
        assert_eq!(leak.severity, LeakSeverity::High);
        assert_eq!(leak.total_heap_bytes, 4608);
    }
}
