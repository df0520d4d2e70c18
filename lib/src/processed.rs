//! The processed profile: one document for the whole capture, with every per-thread table stored
//! column-major and every string interned into `shared.stringArray`.

use crate::error::ProcessError;
use crate::table::ColumnarTable;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_repr::{Deserialize_repr, Serialize_repr};

/// The processed profile format version emitted by this crate.
pub const PROCESSED_PROFILE_VERSION: u64 = 51;

pub type IndexIntoStringArray = usize;
pub type IndexIntoLibs = usize;
pub type IndexIntoFuncTable = usize;
pub type IndexIntoFrameTable = usize;
pub type IndexIntoStackTable = usize;
pub type IndexIntoResourceTable = usize;
pub type IndexIntoCategories = usize;

/// The resource index stored in `FuncTable::resource` when no resource is known.
pub const NO_RESOURCE: i64 = -1;

/// The address stored in `FrameTable::address` when the address is unknown.
pub const NO_ADDRESS: i64 = -1;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum ResourceType {
    #[default]
    Unknown = 0,
    Library = 1,
    Addon = 2,
    Webhost = 3,
    Otherhost = 4,
    Url = 5,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum MarkerPhase {
    #[default]
    Instant = 0,
    Interval = 1,
    IntervalStart = 2,
    IntervalEnd = 3,
}

// Thread and process ids are numbers on most platforms, but some producers emit strings.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Int(u64),
    String(String),
}

impl Default for Id {
    fn default() -> Self {
        Id::Int(0)
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(i) => i.fmt(f),
            Self::String(s) => s.fmt(f),
        }
    }
}

columnar_table! {
    /// Functions, created once per distinct (name, origin) within a thread.
    pub struct FuncTable / FuncRow {
        name: IndexIntoStringArray,
        #[serde(rename = "isJS")]
        is_js: bool,
        #[serde(rename = "relevantForJS")]
        relevant_for_js: bool,
        /// An index into the resource table, or [`NO_RESOURCE`].
        resource: i64,
        file_name: Option<IndexIntoStringArray>,
        line_number: Option<u32>,
        column_number: Option<u32>,
    }
}

columnar_table! {
    /// The library, extension, host or URL a function comes from.
    pub struct ResourceTable / ResourceRow {
        lib: Option<IndexIntoLibs>,
        name: IndexIntoStringArray,
        host: Option<IndexIntoStringArray>,
        #[serde(rename = "type")]
        resource_type: ResourceType,
    }
}

columnar_table! {
    pub struct FrameTable / FrameRow {
        /// Library-relative address, or [`NO_ADDRESS`].
        address: i64,
        inline_depth: u32,
        category: Option<IndexIntoCategories>,
        subcategory: Option<usize>,
        func: IndexIntoFuncTable,
        native_symbol: Option<usize>,
        #[serde(rename = "innerWindowID")]
        inner_window_id: Option<u64>,
        implementation: Option<IndexIntoStringArray>,
        line: Option<u32>,
        column: Option<u32>,
    }
}

columnar_table! {
    /// The stack forest. Root stacks have no prefix.
    pub struct StackTable / StackRow {
        frame: IndexIntoFrameTable,
        prefix: Option<IndexIntoStackTable>,
        category: IndexIntoCategories,
        subcategory: usize,
    }
}

columnar_table! {
    pub struct SamplesTable / SampleRow {
        stack: Option<IndexIntoStackTable>,
        time: f64,
    }
    optional {
        weight: f64,
        event_delay: Option<f64>,
        responsiveness: Option<f64>,
        #[serde(rename = "threadCPUDelta")]
        thread_cpu_delta: Option<f64>,
    }
}

columnar_table! {
    pub struct MarkerTable / MarkerRow {
        data: Option<Value>,
        name: IndexIntoStringArray,
        start_time: Option<f64>,
        end_time: Option<f64>,
        phase: MarkerPhase,
        category: IndexIntoCategories,
    }
}

columnar_table! {
    pub struct JsAllocationsTable / JsAllocationRow {
        time: f64,
        class_name: String,
        type_name: String,
        coarse_type: String,
        weight: f64,
        in_nursery: bool,
        stack: Option<IndexIntoStackTable>,
    }
}

columnar_table! {
    pub struct NativeAllocationsTable / NativeAllocationRow {
        time: f64,
        weight: f64,
        stack: Option<IndexIntoStackTable>,
    }
    optional {
        memory_address: Option<u64>,
        thread_id: Option<u64>,
    }
}

columnar_table! {
    /// Always empty after processing; symbolication fills it in later.
    pub struct NativeSymbolTable / NativeSymbolRow {
        lib_index: IndexIntoLibs,
        address: u64,
        name: IndexIntoStringArray,
        function_size: Option<u32>,
    }
}

columnar_table! {
    pub struct ExtensionTable / ExtensionRow {
        id: String,
        name: String,
        #[serde(rename = "baseURL")]
        base_url: String,
    }
}

columnar_table! {
    /// Every distinct JS script URL of the capture.
    pub struct SourceTable / SourceRow {
        filename: IndexIntoStringArray,
    }
}

columnar_table! {
    pub struct CounterSamplesTable / CounterSampleRow {
        time: f64,
        count: f64,
    }
    optional {
        number: Option<u64>,
    }
}

columnar_table! {
    pub struct ProfilerOverheadSamplesTable / ProfilerOverheadSampleRow {
        counters: f64,
        expired_marker_cleaning: f64,
        locking: f64,
        threads: f64,
        time: f64,
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Samples {
    #[serde(flatten)]
    pub table: SamplesTable,
    pub weight_type: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Lib {
    pub arch: Option<String>,
    pub name: String,
    pub path: String,
    pub debug_name: String,
    pub debug_path: String,
    pub breakpad_id: String,
    pub code_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub name: String,
    pub color: String,
    #[serde(default)]
    pub subcategories: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub name: String,
    pub is_main_thread: bool,
    pub process_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_name: Option<String>,
    pub pid: String,
    pub tid: Id,
    pub process_startup_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_shutdown_time: Option<f64>,
    pub register_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unregister_time: Option<f64>,
    pub paused_ranges: Vec<Value>,
    pub samples: Samples,
    pub markers: MarkerTable,
    pub stack_table: StackTable,
    pub frame_table: FrameTable,
    pub func_table: FuncTable,
    pub resource_table: ResourceTable,
    pub native_symbols: NativeSymbolTable,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub js_allocations: Option<JsAllocationsTable>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub native_allocations: Option<NativeAllocationsTable>,
}

impl Thread {
    /// Check the length invariant of every table of the thread.
    pub fn check_tables(&self) -> Result<(), ProcessError> {
        self.samples.table.check_lengths()?;
        self.markers.check_lengths()?;
        self.stack_table.check_lengths()?;
        self.frame_table.check_lengths()?;
        self.func_table.check_lengths()?;
        self.resource_table.check_lengths()?;
        self.native_symbols.check_lengths()?;
        if let Some(table) = &self.js_allocations {
            table.check_lengths()?;
        }
        if let Some(table) = &self.native_allocations {
            table.check_lengths()?;
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Counter {
    pub name: String,
    pub category: String,
    pub description: String,
    pub pid: String,
    pub main_thread_index: usize,
    pub samples: CounterSamplesTable,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfilerOverhead {
    pub samples: ProfilerOverheadSamplesTable,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statistics: Option<Value>,
    pub pid: String,
    pub main_thread_index: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    pub interval: f64,
    pub start_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shutdown_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_type: Option<Value>,
    pub product: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stackwalk: Option<Value>,
    pub debug: bool,
    pub version: u64,
    pub preprocessed_profile_version: u64,
    pub categories: Vec<Category>,
    pub marker_schema: Vec<Value>,
    pub extensions: ExtensionTable,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_units: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oscpu: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub toolkit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abi: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub misc: Option<String>,
    #[serde(rename = "appBuildID", skip_serializing_if = "Option::is_none")]
    pub app_build_id: Option<String>,
    #[serde(rename = "sourceURL", skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(rename = "physicalCPUs", skip_serializing_if = "Option::is_none")]
    pub physical_cpus: Option<u32>,
    #[serde(rename = "logicalCPUs", skip_serializing_if = "Option::is_none")]
    pub logical_cpus: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration: Option<Value>,
    pub symbolicated: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Shared {
    pub string_array: Vec<String>,
    pub source_table: SourceTable,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedProfile {
    pub meta: Meta,
    pub libs: Vec<Lib>,
    pub shared: Shared,
    pub pages: Vec<Value>,
    pub threads: Vec<Thread>,
    pub counters: Vec<Counter>,
    pub profiler_overhead: Vec<ProfilerOverhead>,
}

impl ProcessedProfile {
    /// Look up a string of the shared string array.
    pub fn string(&self, index: IndexIntoStringArray) -> Option<&str> {
        self.shared.string_array.get(index).map(String::as_str)
    }
}

/// Serialize a processed profile as compact JSON.
pub fn serialize(profile: &ProcessedProfile) -> serde_json::Result<String> {
    serde_json::to_string(profile)
}

/// Serialize a processed profile as indented JSON.
pub fn serialize_pretty(profile: &ProcessedProfile) -> serde_json::Result<String> {
    serde_json::to_string_pretty(profile)
}
