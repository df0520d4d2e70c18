//! Per-thread samples and markers, from raw tuples to processed columns.
//!
//! Markers go through a few payload rewrites on the way: embedded synchronous stacks are reduced
//! to a `cause`, allocation markers move to their own tables, GC phase timings are rescaled to
//! microseconds and IPC pids become strings.

use crate::error::ProcessError;
use crate::gecko::{GeckoSamples, GeckoTable};
use crate::interner::GlobalDataCollector;
use crate::processed::{
    Id, IndexIntoStackTable, JsAllocationRow, JsAllocationsTable, MarkerPhase, MarkerRow,
    MarkerTable, NativeAllocationRow, NativeAllocationsTable, SampleRow, Samples, SamplesTable,
};
use serde_json::{json, Map, Value};
use std::collections::HashMap;

type Payload = Map<String, Value>;

const MS_TO_US: f64 = 1000.0;

/// Sample times and the columns a thread recorded.
pub fn process_samples(samples: GeckoSamples, time_offset: f64) -> Result<Samples, ProcessError> {
    let weight_type = samples.weight_type.unwrap_or_else(|| "samples".to_owned());
    let mut columns = samples.table.into_columns();
    let length = columns.len();

    let stacks = columns.take::<IndexIntoStackTable>("stack")?;
    let times = columns.take::<f64>("time")?;
    let mut optional = |name: &str| -> Result<Option<Vec<Option<f64>>>, ProcessError> {
        Ok(if columns.contains(name) {
            Some(columns.take::<f64>(name)?)
        } else {
            None
        })
    };
    let weights = optional("weight")?;
    let event_delays = optional("eventDelay")?;
    let responsiveness = optional("responsiveness")?;
    let cpu_deltas = optional("threadCPUDelta")?;

    let mut table = SamplesTable {
        weight: weights.as_ref().map(|_| Vec::with_capacity(length)),
        event_delay: event_delays.as_ref().map(|_| Vec::with_capacity(length)),
        responsiveness: responsiveness.as_ref().map(|_| Vec::with_capacity(length)),
        thread_cpu_delta: cpu_deltas.as_ref().map(|_| Vec::with_capacity(length)),
        ..SamplesTable::empty()
    };
    let cell = |column: &Option<Vec<Option<f64>>>, index: usize| {
        column.as_ref().and_then(|column| column[index])
    };
    for index in 0..length {
        table.push(SampleRow {
            stack: stacks[index],
            time: times[index].unwrap_or_default() + time_offset,
            weight: cell(&weights, index).unwrap_or(1.0),
            event_delay: cell(&event_delays, index),
            responsiveness: cell(&responsiveness, index),
            thread_cpu_delta: cell(&cpu_deltas, index),
        });
    }
    Ok(Samples { table, weight_type })
}

/// The payload fields holding thread-local string indices, by marker type.
#[derive(Debug, Default)]
pub struct UniqueStringFields(HashMap<String, Vec<String>>);

impl UniqueStringFields {
    /// Collect the `unique-string` fields declared in `meta.markerSchema`.
    pub fn from_marker_schema(schema: &[Value]) -> Self {
        let mut fields: HashMap<String, Vec<String>> = HashMap::new();
        for entry in schema {
            let Some(name) = entry.get("name").and_then(Value::as_str) else {
                continue;
            };
            let declared = entry
                .get("fields")
                .or_else(|| entry.get("data"))
                .and_then(Value::as_array);
            for field in declared.into_iter().flatten() {
                if field.get("format").and_then(Value::as_str) != Some("unique-string") {
                    continue;
                }
                if let Some(key) = field.get("key").and_then(Value::as_str) {
                    fields
                        .entry(name.to_owned())
                        .or_default()
                        .push(key.to_owned());
                }
            }
        }
        UniqueStringFields(fields)
    }

    fn get(&self, marker_type: &str) -> &[String] {
        self.0.get(marker_type).map(Vec::as_slice).unwrap_or_default()
    }
}

/// What a thread's markers need from their surroundings.
pub struct MarkerContext<'a> {
    pub thread_name: &'a str,
    pub tid: &'a Id,
    /// The thread-local string table marker names and unique strings index into.
    pub strings: &'a [String],
    /// Added to every time so that all processes share the root's time base.
    pub time_offset: f64,
    pub unique_string_fields: &'a UniqueStringFields,
}

impl MarkerContext<'_> {
    fn intern(&self, collector: &mut GlobalDataCollector, local: usize) -> usize {
        match self.strings.get(local) {
            Some(s) => collector.index_for_string(s),
            None => {
                log::debug!(
                    "thread {:?}: string index {local} is out of range",
                    self.thread_name
                );
                collector.index_for_string("")
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct ProcessedMarkers {
    pub markers: MarkerTable,
    pub js_allocations: Option<JsAllocationsTable>,
    pub native_allocations: Option<NativeAllocationsTable>,
}

/// Sort raw marker tuples by `endTime`, falling back to `startTime`.
///
/// The sort is stable. A marker with neither time is an error.
pub fn sort_markers(markers: &mut GeckoTable, thread_name: &str) -> Result<(), ProcessError> {
    let start = markers.schema.get("startTime").copied();
    let end = markers.schema.get("endTime").copied();
    let time_at = |row: &[Value], index: Option<usize>| {
        index.and_then(|i| row.get(i)).and_then(Value::as_f64)
    };

    let mut keyed = Vec::with_capacity(markers.data.len());
    for (index, row) in std::mem::take(&mut markers.data).into_iter().enumerate() {
        let key = time_at(row.as_slice(), end)
            .or_else(|| time_at(row.as_slice(), start))
            .ok_or_else(|| ProcessError::MarkerTimeMissing {
                thread: thread_name.to_owned(),
                index,
            })?;
        keyed.push((key, row));
    }
    keyed.sort_by(|(a, _), (b, _)| a.total_cmp(b));
    markers.data = keyed.into_iter().map(|(_, row)| row).collect();
    Ok(())
}

/// The first sample of an embedded synchronous profile: `(tid, time, stack)`.
fn first_sample(stack: &Value) -> Option<(Option<Value>, f64, Option<IndexIntoStackTable>)> {
    let samples = stack.get("samples")?;
    let schema = samples.get("schema")?;
    let row = samples.get("data")?.as_array()?.first()?;
    let cell = |name: &str| {
        schema
            .get(name)
            .and_then(Value::as_u64)
            .and_then(|i| row.get(i as usize))
    };
    let time = cell("time").and_then(Value::as_f64)?;
    let stack_index = cell("stack").and_then(Value::as_u64).map(|i| i as usize);
    Some((stack.get("tid").cloned(), time, stack_index))
}

fn scale_phase_times(timings: &mut Payload) {
    if let Some(times) = timings.remove("times") {
        timings.entry("phase_times").or_insert(times);
    }
    if let Some(phases) = timings.get_mut("phase_times").and_then(Value::as_object_mut) {
        for time in phases.values_mut() {
            if let Some(ms) = time.as_f64() {
                *time = json!(ms * MS_TO_US);
            }
        }
    }
}

fn normalize_gc(payload: &mut Payload, major: bool) {
    let Some(timings) = payload.get_mut("timings").and_then(Value::as_object_mut) else {
        return;
    };
    if major && timings.get("status").and_then(Value::as_str) == Some("aborted") {
        *timings = Map::from_iter([("status".to_owned(), json!("aborted"))]);
        return;
    }
    if major {
        timings.insert("status".into(), json!("completed"));
    }
    scale_phase_times(timings);
}

enum Diverted {
    Js(JsAllocationRow),
    Native(NativeAllocationRow, bool, bool),
}

struct MarkerProcessor<'c, 'a> {
    context: &'c MarkerContext<'a>,
    collector: &'c mut GlobalDataCollector,
}

impl MarkerProcessor<'_, '_> {
    /// Rewrite `payload` in place, or take it out of the marker table.
    fn payload(&mut self, payload: &mut Payload, time: f64) -> Option<Diverted> {
        let marker_type = payload
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();

        let sample = payload
            .remove("stack")
            .and_then(|stack| first_sample(&stack));

        match marker_type.as_str() {
            "JS allocation" => {
                let text = |key: &str| {
                    payload
                        .get(key)
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_owned()
                };
                return Some(Diverted::Js(JsAllocationRow {
                    time,
                    class_name: text("className"),
                    type_name: text("typeName"),
                    coarse_type: text("coarseType"),
                    weight: payload.get("size").and_then(Value::as_f64).unwrap_or(0.0),
                    in_nursery: payload
                        .get("inNursery")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                    stack: sample.and_then(|(_, _, stack)| stack),
                }));
            }
            "Native allocation" => {
                let memory_address = payload.get("memoryAddress").and_then(Value::as_u64);
                let thread_id = payload.get("threadId").and_then(Value::as_u64);
                return Some(Diverted::Native(
                    NativeAllocationRow {
                        time,
                        weight: payload.get("size").and_then(Value::as_f64).unwrap_or(0.0),
                        stack: sample.and_then(|(_, _, stack)| stack),
                        memory_address,
                        thread_id,
                    },
                    payload.contains_key("memoryAddress"),
                    payload.contains_key("threadId"),
                ));
            }
            "GCSlice" => normalize_gc(payload, false),
            "GCMajor" => normalize_gc(payload, true),
            "IPC" => {
                if let Some(pid) = payload.get_mut("otherPid") {
                    if !pid.is_string() && !pid.is_null() {
                        *pid = Value::String(pid.to_string());
                    }
                }
            }
            _ => (),
        }

        if let Some((tid, cause_time, stack)) = sample {
            let tid = tid.unwrap_or_else(|| json!(self.context.tid));
            payload.insert(
                "cause".into(),
                json!({
                    "tid": tid,
                    "time": cause_time + self.context.time_offset,
                    "stack": stack,
                }),
            );
        }

        for key in self.context.unique_string_fields.get(&marker_type) {
            if let Some(field) = payload.get_mut(key) {
                if let Some(local) = field.as_u64() {
                    *field = self.context.intern(self.collector, local as usize).into();
                }
            }
        }
        None
    }
}

/// Convert a thread's raw markers, diverting allocation markers into their own tables.
pub fn process_markers(
    mut markers: GeckoTable,
    context: &MarkerContext,
    collector: &mut GlobalDataCollector,
) -> Result<ProcessedMarkers, ProcessError> {
    sort_markers(&mut markers, context.thread_name)?;

    let mut columns = markers.into_columns();
    let names = columns.take::<usize>("name")?;
    let starts = columns.take::<f64>("startTime")?;
    let ends = columns.take::<f64>("endTime")?;
    let phases = columns.take::<MarkerPhase>("phase")?;
    let categories = columns.take::<usize>("category")?;
    let payloads = columns.take_raw("data").unwrap_or_default();

    let offset = context.time_offset;
    let mut processor = MarkerProcessor { context, collector };
    let mut table = MarkerTable::empty();
    let mut js_allocations = Vec::new();
    let mut native_allocations = Vec::new();
    let (mut any_memory_address, mut any_thread_id) = (false, false);

    let mut payloads = payloads.into_iter();
    for index in 0..columns.len() {
        let start = starts[index].map(|t| t + offset);
        let end = ends[index].map(|t| t + offset);
        let mut data = match payloads.next() {
            Some(Value::Object(payload)) => Some(payload),
            _ => None,
        };

        if let Some(payload) = &mut data {
            let time = start.or(end).unwrap_or_default();
            match processor.payload(payload, time) {
                Some(Diverted::Js(row)) => {
                    js_allocations.push(row);
                    continue;
                }
                Some(Diverted::Native(row, memory_address, thread_id)) => {
                    any_memory_address |= memory_address;
                    any_thread_id |= thread_id;
                    native_allocations.push(row);
                    continue;
                }
                None => (),
            }
        }

        let name = names[index].unwrap_or_default();
        table.push(MarkerRow {
            data: data.map(Value::Object),
            name: context.intern(processor.collector, name),
            start_time: start,
            end_time: end,
            phase: phases[index].unwrap_or_default(),
            category: categories[index].unwrap_or_default(),
        });
    }

    let js_allocations = (!js_allocations.is_empty()).then(|| {
        let mut table = JsAllocationsTable::empty();
        for row in js_allocations {
            table.push(row);
        }
        table
    });
    let native_allocations = (!native_allocations.is_empty()).then(|| {
        let mut table = NativeAllocationsTable {
            memory_address: any_memory_address.then(Vec::new),
            thread_id: any_thread_id.then(Vec::new),
            ..NativeAllocationsTable::empty()
        };
        for row in native_allocations {
            table.push(row);
        }
        table
    });

    Ok(ProcessedMarkers {
        markers: table,
        js_allocations,
        native_allocations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn raw_markers(data: Value) -> GeckoTable {
        serde_json::from_value(json!({
            "schema": {"name": 0, "startTime": 1, "endTime": 2, "phase": 3, "category": 4, "data": 5},
            "data": data
        }))
        .unwrap()
    }

    struct Fixture {
        strings: Vec<String>,
        tid: Id,
        unique: UniqueStringFields,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                strings: vec!["Paint".into(), "Alloc".into(), "my-label".into()],
                tid: Id::Int(7),
                unique: UniqueStringFields::default(),
            }
        }

        fn context(&self, time_offset: f64) -> MarkerContext<'_> {
            MarkerContext {
                thread_name: "GeckoMain",
                tid: &self.tid,
                strings: &self.strings,
                time_offset,
                unique_string_fields: &self.unique,
            }
        }
    }

    #[test]
    fn markers_are_sorted_by_end_then_start() {
        let mut table = raw_markers(json!([
            [0, 5.0, null, 0, 0, null],
            [0, 1.0, 9.0, 1, 0, null],
            [0, null, 2.0, 3, 0, null],
        ]));
        sort_markers(&mut table, "GeckoMain").unwrap();
        let keys: Vec<_> = table.data.iter().map(|row| row[1].clone()).collect();
        assert_eq!(keys, vec![json!(null), json!(5.0), json!(1.0)]);
    }

    #[test]
    fn marker_without_times_is_fatal() {
        let mut table = raw_markers(json!([[0, 1.0, null, 0, 0, null], [0, null, null, 0, 0, null]]));
        let err = sort_markers(&mut table, "GeckoMain").unwrap_err();
        assert!(matches!(err, ProcessError::MarkerTimeMissing { index: 1, .. }));
    }

    #[test]
    fn names_are_interned_and_times_shifted() {
        let fixture = Fixture::new();
        let mut collector = GlobalDataCollector::new();
        collector.index_for_string("unrelated");
        let processed = process_markers(
            raw_markers(json!([[0, 1.0, 3.0, 1, 2, {"type": "Paint"}]])),
            &fixture.context(100.0),
            &mut collector,
        )
        .unwrap();
        let markers = processed.markers;
        assert_eq!(markers.length, 1);
        assert_eq!(markers.name, vec![1]);
        assert_eq!(markers.start_time, vec![Some(101.0)]);
        assert_eq!(markers.end_time, vec![Some(103.0)]);
        assert_eq!(markers.phase, vec![MarkerPhase::Interval]);
        assert_eq!(markers.category, vec![2]);
        assert_eq!(collector.string_table().get_string(1), Some("Paint"));
    }

    #[test]
    fn stacks_become_causes() {
        let fixture = Fixture::new();
        let mut collector = GlobalDataCollector::new();
        let processed = process_markers(
            raw_markers(json!([
                [0, 4.0, null, 0, 0, {
                    "type": "Styles",
                    "stack": {
                        "samples": {"schema": {"stack": 0, "time": 1}, "data": [[12, 3.5], [13, 3.6]]}
                    }
                }],
                [0, 5.0, null, 0, 0, {
                    "type": "Styles",
                    "stack": {
                        "tid": 99,
                        "samples": {"schema": {"stack": 0, "time": 1}, "data": [[4, 4.5]]}
                    }
                }]
            ])),
            &fixture.context(10.0),
            &mut collector,
        )
        .unwrap();
        assert_eq!(
            processed.markers.data,
            vec![
                Some(json!({"type": "Styles", "cause": {"tid": 7, "time": 13.5, "stack": 12}})),
                Some(json!({"type": "Styles", "cause": {"tid": 99, "time": 14.5, "stack": 4}})),
            ]
        );
    }

    #[test]
    fn allocations_leave_the_marker_table() {
        let fixture = Fixture::new();
        let mut collector = GlobalDataCollector::new();
        let stack = json!({"samples": {"schema": {"stack": 0, "time": 1}, "data": [[3, 1.0]]}});
        let processed = process_markers(
            raw_markers(json!([
                [1, 1.0, null, 0, 0, {
                    "type": "JS allocation", "className": "Function", "typeName": "JSObject",
                    "coarseType": "Object", "size": 48, "inNursery": true, "stack": stack
                }],
                [1, 2.0, null, 0, 0, {"type": "Native allocation", "size": 16, "stack": stack}],
                [1, 3.0, null, 0, 0, {"type": "Native allocation", "size": -16, "memoryAddress": 4096}],
                [0, 4.0, null, 0, 0, null]
            ])),
            &fixture.context(0.0),
            &mut collector,
        )
        .unwrap();

        assert_eq!(processed.markers.length, 1);
        let js = processed.js_allocations.unwrap();
        assert_eq!(js.length, 1);
        assert_eq!(js.class_name, vec!["Function".to_owned()]);
        assert_eq!(js.weight, vec![48.0]);
        assert_eq!(js.in_nursery, vec![true]);
        assert_eq!(js.stack, vec![Some(3)]);

        let native = processed.native_allocations.unwrap();
        assert_eq!(native.length, 2);
        assert_eq!(native.time, vec![2.0, 3.0]);
        assert_eq!(native.weight, vec![16.0, -16.0]);
        assert_eq!(native.stack, vec![Some(3), None]);
        assert_eq!(native.memory_address, Some(vec![None, Some(4096)]));
        assert_eq!(native.thread_id, None);
    }

    #[test]
    fn no_allocation_markers_means_no_tables() {
        let fixture = Fixture::new();
        let mut collector = GlobalDataCollector::new();
        let processed = process_markers(
            raw_markers(json!([[0, 1.0, null, 0, 0, null]])),
            &fixture.context(0.0),
            &mut collector,
        )
        .unwrap();
        assert!(processed.js_allocations.is_none());
        assert!(processed.native_allocations.is_none());
    }

    #[test]
    fn gc_payloads_are_rescaled() {
        let fixture = Fixture::new();
        let mut collector = GlobalDataCollector::new();
        let processed = process_markers(
            raw_markers(json!([
                [0, 1.0, 2.0, 1, 0, {"type": "GCSlice", "timings": {"times": {"mark": 1.5}, "budget": "10ms"}}],
                [0, 2.0, 3.0, 1, 0, {"type": "GCMajor", "timings": {"status": "completed", "phase_times": {"sweep": 2}}}],
                [0, 3.0, 4.0, 1, 0, {"type": "GCMajor", "timings": {"status": "aborted", "phase_times": {"sweep": 2}}}]
            ])),
            &fixture.context(0.0),
            &mut collector,
        )
        .unwrap();
        assert_eq!(
            processed.markers.data,
            vec![
                Some(json!({"type": "GCSlice", "timings": {"phase_times": {"mark": 1500.0}, "budget": "10ms"}})),
                Some(json!({"type": "GCMajor", "timings": {"status": "completed", "phase_times": {"sweep": 2000.0}}})),
                Some(json!({"type": "GCMajor", "timings": {"status": "aborted"}})),
            ]
        );
    }

    #[test]
    fn ipc_pid_becomes_a_string() {
        let fixture = Fixture::new();
        let mut collector = GlobalDataCollector::new();
        let processed = process_markers(
            raw_markers(json!([[0, 1.0, null, 0, 0, {"type": "IPC", "otherPid": 9007199254740993u64}]])),
            &fixture.context(0.0),
            &mut collector,
        )
        .unwrap();
        assert_eq!(
            processed.markers.data[0].as_ref().unwrap()["otherPid"],
            json!("9007199254740993")
        );
    }

    #[test]
    fn unique_strings_are_reinterned() {
        let mut fixture = Fixture::new();
        fixture.unique = UniqueStringFields::from_marker_schema(&[json!({
            "name": "UserTiming",
            "fields": [{"key": "label", "format": "unique-string"}, {"key": "other", "format": "string"}]
        })]);
        let mut collector = GlobalDataCollector::new();
        let processed = process_markers(
            raw_markers(json!([[0, 1.0, null, 0, 0, {"type": "UserTiming", "label": 2, "other": 2}]])),
            &fixture.context(0.0),
            &mut collector,
        )
        .unwrap();
        let data = processed.markers.data[0].clone().unwrap();
        let label = data["label"].as_u64().unwrap() as usize;
        assert_eq!(collector.string_table().get_string(label), Some("my-label"));
        assert_eq!(data["other"], json!(2));
    }

    #[test]
    fn samples_keep_optional_columns() {
        let samples: GeckoSamples = serde_json::from_value(json!({
            "schema": {"stack": 0, "time": 1, "eventDelay": 2, "threadCPUDelta": 3},
            "data": [[0, 1.0, 0.5, null], [null, 2.0, null, 12]],
            "weightType": "tracing-ms"
        }))
        .unwrap();
        let processed = process_samples(samples, 5.0).unwrap();
        assert_eq!(processed.weight_type, "tracing-ms");
        let table = processed.table;
        assert_eq!(table.stack, vec![Some(0), None]);
        assert_eq!(table.time, vec![6.0, 7.0]);
        assert_eq!(table.event_delay, Some(vec![Some(0.5), None]));
        assert_eq!(table.thread_cpu_delta, Some(vec![None, Some(12.0)]));
        assert_eq!(table.weight, None);
        assert_eq!(table.responsiveness, None);
    }
}
