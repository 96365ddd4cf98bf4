//! Managed-runtime reader seam.
//!
//! This is the low-level view of the dump the heap, thread, async and
//! synchronization analyzers are built on. Everything is plain data: object
//! addresses and method tables are opaque `u64`s, graphs are id-keyed, and no
//! pointer from the dump ever becomes a pointer in this process.

use crate::models::report::{AssemblyInfo, GenerationSizes, ModuleInfo, ThreadPoolInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapSegment {
    pub index: usize,
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapObject {
    pub address: u64,
    pub method_table: u64,
    pub type_name: String,
    pub size: u64,
}

/// Raw owner edge discovered for a heap object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawOwner {
    /// Instance field in another heap object holds the reference.
    Field {
        holder_address: u64,
        holder_type: String,
        field: String,
    },
    /// A static root holds the reference. The method table may be unknown for
    /// metadata-poor images, in which case dedupe falls back to the type name.
    StaticRoot {
        root_type: String,
        method_table: Option<u64>,
        field: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct SlotData {
    pub name: String,
    pub type_name: String,
    pub value: Option<String>,
    pub address: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct ManagedFrameData {
    pub instruction_pointer: u64,
    pub module: String,
    pub function: String,
    pub is_managed: bool,
    pub parameters: Vec<SlotData>,
    pub locals: Vec<SlotData>,
}

#[derive(Debug, Clone, Default)]
pub struct ManagedThreadData {
    pub os_thread_id: u32,
    pub managed_thread_id: i32,
    pub lock_count: u32,
    pub is_threadpool: bool,
    pub is_background: bool,
    pub clr_state: String,
    pub gc_mode: String,
    pub thread_object: u64,
    pub current_exception: Option<(String, String)>,
    pub frames: Vec<ManagedFrameData>,
}

#[derive(Debug, Clone, Default)]
pub struct SyncBlockData {
    pub object_address: u64,
    pub object_type: String,
    pub owner_os_tid: Option<u32>,
    pub waiter_os_tids: Vec<u32>,
    pub recursion: u32,
}

#[derive(Debug, Clone, Default)]
pub struct SemaphoreData {
    pub address: u64,
    pub current_count: i32,
    pub max_count: i32,
    pub sync_waiter_tids: Vec<u32>,
    pub async_waiter_count: u32,
}

#[derive(Debug, Clone, Default)]
pub struct RwLockData {
    pub address: u64,
    pub writer_os_tid: Option<u32>,
    pub reader_count: u32,
    pub waiting_writer_tids: Vec<u32>,
    pub waiting_reader_tids: Vec<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct ResetEventData {
    pub address: u64,
    pub kind: String,
    pub is_set: bool,
    pub waiter_tids: Vec<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct WaitHandleData {
    pub address: u64,
    pub handle_type: String,
    pub waiter_tids: Vec<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskData {
    pub address: u64,
    pub state_flags: i32,
    pub exception: Option<(String, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct TimerData {
    pub address: u64,
    pub due_time_ms: Option<u64>,
    pub period_ms: Option<u64>,
    pub callback: Option<String>,
}

/// Read access to the managed runtime inside an open dump.
///
/// Reads are thread-safe once the dump is open; the parallel heap walk calls
/// `objects_in_segment` from multiple rayon workers.
pub trait RuntimeReader: Send + Sync {
    fn is_open(&self) -> bool;

    /// True when the runtime was using Server GC; enables the segment-parallel
    /// heap walk.
    fn is_server_gc(&self) -> bool;

    fn heap_segments(&self) -> Vec<HeapSegment>;

    fn objects_in_segment(&self, segment: &HeapSegment) -> Vec<HeapObject>;

    fn generation_sizes(&self) -> GenerationSizes;

    fn loaded_modules(&self) -> Vec<ModuleInfo>;

    /// Managed assemblies in the dump. Readers without metadata access may
    /// leave this empty.
    fn loaded_assemblies(&self) -> Vec<AssemblyInfo> {
        Vec::new()
    }

    /// Owner edges pointing at `address`: instance-field holders and static
    /// roots.
    fn owners_of(&self, address: u64) -> Vec<RawOwner>;

    /// Decoded `System.String` payload, or `None` when the address is not a
    /// string object.
    fn string_value(&self, address: u64) -> Option<String>;

    fn managed_threads(&self) -> Vec<ManagedThreadData>;

    fn thread_pool(&self) -> Option<ThreadPoolInfo>;

    fn sync_blocks(&self) -> Vec<SyncBlockData>;

    fn semaphore_slims(&self) -> Vec<SemaphoreData>;

    fn reader_writer_locks(&self) -> Vec<RwLockData>;

    fn reset_events(&self) -> Vec<ResetEventData>;

    fn wait_handles(&self) -> Vec<WaitHandleData>;

    fn tasks(&self) -> Vec<TaskData>;

    fn timers(&self) -> Vec<TimerData>;
}
