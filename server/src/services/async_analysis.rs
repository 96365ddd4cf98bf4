//! Async state analysis: task status decoding, faulted-task extraction,
//! timers and thread-pool posture.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::models::report::{AsyncSection, CrashReport, ThreadPoolInfo, TimerInfo};
use crate::services::runtime::RuntimeReader;

// Task state flags from the TPL (System.Threading.Tasks.Task m_stateFlags).
const TASK_STATE_FAULTED: i32 = 0x0020_0000;
const TASK_STATE_CANCELED: i32 = 0x0040_0000;
const TASK_STATE_RAN_TO_COMPLETION: i32 = 0x0100_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    RanToCompletion,
    Faulted,
    Canceled,
    Pending,
}

impl TaskStatus {
    pub fn from_state_flags(flags: i32) -> Self {
        if flags & TASK_STATE_FAULTED != 0 {
            Self::Faulted
        } else if flags & TASK_STATE_CANCELED != 0 {
            Self::Canceled
        } else if flags & TASK_STATE_RAN_TO_COMPLETION != 0 {
            Self::RanToCompletion
        } else {
            Self::Pending
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AsyncSnapshot {
    pub task_count: usize,
    pub pending_tasks: usize,
    pub faulted_task_info: Vec<FaultedTaskInfo>,
    pub timers: Vec<TimerInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_pool: Option<ThreadPoolInfo>,
    pub has_deadlock: bool,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultedTaskInfo {
    pub address: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception_message: Option<String>,
}

pub fn get_async_analysis(runtime: &dyn RuntimeReader, timeout_ms: u64) -> AsyncSnapshot {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    let mut snapshot = AsyncSnapshot::default();

    for task in runtime.tasks() {
        if Instant::now() >= deadline {
            snapshot.timed_out = true;
            break;
        }
        snapshot.task_count += 1;
        let status = TaskStatus::from_state_flags(task.state_flags);
        match status {
            TaskStatus::Pending => snapshot.pending_tasks += 1,
            TaskStatus::Faulted | TaskStatus::Canceled => {
                let (exception_type, exception_message) = match task.exception {
                    Some((ty, msg)) => (Some(ty), Some(msg)),
                    None => (None, None),
                };
                snapshot.faulted_task_info.push(FaultedTaskInfo {
                    address: format!("{:#x}", task.address),
                    status,
                    exception_type,
                    exception_message,
                });
            }
            TaskStatus::RanToCompletion => {}
        }
    }

    snapshot.timers = runtime
        .timers()
        .into_iter()
        .map(|t| TimerInfo {
            address: format!("{:#x}", t.address),
            due_time_ms: t.due_time_ms,
            period_ms: t.period_ms,
            callback: t.callback,
        })
        .collect();

    snapshot.thread_pool = runtime.thread_pool();

    // Classic sync-over-async starvation: every pool worker busy, work still
    // queued, and pending tasks piling up.
    if let Some(pool) = &snapshot.thread_pool {
        snapshot.has_deadlock = pool.idle_threads == 0
            && pool.queue_length > 0
            && snapshot.pending_tasks > 0
            && pool.running_threads >= pool.max_threads;
    }

    snapshot
}

/// Writes the snapshot into the report's `async` section.
pub fn apply_to_report(report: &mut CrashReport, snapshot: &AsyncSnapshot) {
    report.analysis.async_state = Some(AsyncSection {
        has_deadlock: snapshot.has_deadlock,
        timers: snapshot.timers.clone(),
        thread_pool: snapshot.thread_pool.clone(),
    });
    if report.analysis.threads.thread_pool.is_none() {
        report.analysis.threads.thread_pool = snapshot.thread_pool.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::runtime::fixtures::FakeRuntime;
    use crate::services::runtime::{TaskData, TimerData};

    #[test]
    fn state_flags_decode() {
        assert_eq!(
            TaskStatus::from_state_flags(0x0100_0000),
            TaskStatus::RanToCompletion
        );
        assert_eq!(TaskStatus::from_state_flags(0x0020_0000), TaskStatus::Faulted);
        assert_eq!(TaskStatus::from_state_flags(0x0040_0000), TaskStatus::Canceled);
        assert_eq!(TaskStatus::from_state_flags(0x0000_0400), TaskStatus::Pending);
        // Faulted wins over completion bits that linger.
        assert_eq!(
            TaskStatus::from_state_flags(0x0120_0000),
            TaskStatus::Faulted
        );
    }

    #[test]
    fn faulted_tasks_carry_exception_info() {
        let mut runtime = FakeRuntime::open();
        runtime.tasks = vec![
            TaskData {
                address: 0x100,
                state_flags: 0x0100_0000,
                exception: None,
            },
            TaskData {
                address: 0x200,
                state_flags: 0x0020_0000,
                exception: Some((
                    "System.Net.Http.HttpRequestException".into(),
                    "connection refused".into(),
                )),
            },
            TaskData {
                address: 0x300,
                state_flags: 0,
                exception: None,
            },
        ];

        let snapshot = get_async_analysis(&runtime, 30_000);
        assert_eq!(snapshot.task_count, 3);
        assert_eq!(snapshot.pending_tasks, 1);
        assert_eq!(snapshot.faulted_task_info.len(), 1);
        let faulted = &snapshot.faulted_task_info[0];
        assert_eq!(faulted.address, "0x200");
        assert_eq!(faulted.status, TaskStatus::Faulted);
        assert_eq!(
            faulted.exception_type.as_deref(),
            Some("System.Net.Http.HttpRequestException")
        );
    }

    #[test]
    fn saturated_pool_with_pending_tasks_flags_deadlock() {
        let mut runtime = FakeRuntime::open();
        runtime.tasks = vec![TaskData::default(); 4];
        runtime.thread_pool = Some(ThreadPoolInfo {
            min_threads: 4,
            max_threads: 8,
            idle_threads: 0,
            running_threads: 8,
            queue_length: 12,
        });

        let snapshot = get_async_analysis(&runtime, 30_000);
        assert!(snapshot.has_deadlock);

        let mut report = CrashReport::default();
        apply_to_report(&mut report, &snapshot);
        assert!(report.analysis.async_state.as_ref().unwrap().has_deadlock);
        assert!(report.analysis.threads.thread_pool.is_some());
    }

    #[test]
    fn timers_map_to_report_shape() {
        let mut runtime = FakeRuntime::open();
        runtime.timers = vec![TimerData {
            address: 0xF00,
            due_time_ms: Some(100),
            period_ms: Some(1000),
            callback: Some("App.Heartbeat.Tick".into()),
        }];

        let snapshot = get_async_analysis(&runtime, 30_000);
        assert_eq!(snapshot.timers.len(), 1);
        assert_eq!(snapshot.timers[0].address, "0xf00");
        assert_eq!(snapshot.timers[0].callback.as_deref(), Some("App.Heartbeat.Tick"));
    }
}
