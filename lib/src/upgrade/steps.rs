//! The individual format migrations. Each function moves one document from version `v - 1` to
//! version `v`; nested subprocess documents are handled by the driver.

use crate::error::ProcessError;
use debugid::DebugId;
use serde_json::{json, Map, Value};
use std::str::FromStr;

type Object = Map<String, Value>;

fn threads_mut(doc: &mut Value) -> impl Iterator<Item = &mut Object> {
    doc.get_mut("threads")
        .and_then(Value::as_array_mut)
        .into_iter()
        .flatten()
        .filter_map(Value::as_object_mut)
}

fn column_index(table: &Value, name: &str) -> Option<usize> {
    table
        .get("schema")?
        .get(name)?
        .as_u64()
        .map(|index| index as usize)
}

fn rows_mut(table: &mut Value) -> impl Iterator<Item = &mut Vec<Value>> {
    table
        .get_mut("data")
        .and_then(Value::as_array_mut)
        .into_iter()
        .flatten()
        .filter_map(Value::as_array_mut)
}

fn schema_for(fields: &[&str]) -> Value {
    Value::Object(
        fields
            .iter()
            .enumerate()
            .map(|(index, field)| (field.to_string(), Value::from(index)))
            .collect(),
    )
}

fn for_each_payload(doc: &mut Value, mut f: impl FnMut(&mut Object)) {
    for thread in threads_mut(doc) {
        let Some(markers) = thread.get_mut("markers") else {
            continue;
        };
        let Some(index) = column_index(markers, "data") else {
            continue;
        };
        for row in rows_mut(markers) {
            if let Some(payload) = row.get_mut(index).and_then(Value::as_object_mut) {
                f(payload);
            }
        }
    }
}

fn payload_type(payload: &Object) -> Option<&str> {
    payload.get("type").and_then(Value::as_str)
}

/// Remove a column from a `{schema, data}` table, shifting the later columns down.
pub(super) fn remove_column(table: &mut Value, name: &str) {
    let Some(schema) = table.get_mut("schema").and_then(Value::as_object_mut) else {
        return;
    };
    let Some(removed) = schema.remove(name).and_then(|index| index.as_u64()) else {
        return;
    };
    for index in schema.values_mut() {
        if let Some(i) = index.as_u64() {
            if i > removed {
                *index = Value::from(i - 1);
            }
        }
    }
    let removed = removed as usize;
    for row in rows_mut(table) {
        if removed < row.len() {
            row.remove(removed);
        }
    }
}

fn remove_thread_columns(doc: &mut Value, table: &str, columns: &[&str]) {
    for thread in threads_mut(doc) {
        if let Some(table) = thread.get_mut(table) {
            for column in columns {
                remove_column(table, column);
            }
        }
    }
}

fn lenient_u64(value: &Value) -> u64 {
    value
        .as_u64()
        .or_else(|| value.as_f64().map(|f| f as u64))
        .unwrap_or(0)
}

fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// The breakpad id of a PDB identified by its GUID signature and age.
fn breakpad_id(signature: &str, age: u32) -> String {
    let guid = signature.trim_matches(|c| c == '{' || c == '}');
    match DebugId::from_str(&format!("{guid}-{age:x}")) {
        Ok(id) => id.breakpad().to_string(),
        Err(_) => format!("{}{age:x}", guid.replace('-', "").to_uppercase()),
    }
}

fn normalize_lib(lib: &mut Object) {
    let path = lib
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    let pdb_name = lib
        .remove("pdbName")
        .and_then(|v| v.as_str().map(str::to_owned));
    let signature = lib
        .remove("pdbSignature")
        .and_then(|v| v.as_str().map(str::to_owned));
    let age = lib.remove("pdbAge").and_then(|v| v.as_u64());

    let debug_name = pdb_name.unwrap_or_else(|| file_name(&path).to_owned());
    if !lib.contains_key("breakpadId") {
        let id = match (signature, age) {
            (Some(signature), Some(age)) => breakpad_id(&signature, age as u32),
            _ => String::new(),
        };
        lib.insert("breakpadId".into(), id.into());
    }
    let name = debug_name
        .strip_suffix(".pdb")
        .unwrap_or(&debug_name)
        .to_owned();
    lib.insert("name".into(), name.into());
    lib.insert("debugName".into(), debug_name.into());
    lib.insert("debugPath".into(), path.clone().into());
    lib.insert("path".into(), path.into());
}

fn intern(strings: &mut Vec<Value>, s: &str) -> usize {
    match strings.iter().position(|v| v.as_str() == Some(s)) {
        Some(index) => index,
        None => {
            strings.push(s.into());
            strings.len() - 1
        }
    }
}

const V3_SAMPLE_FIELDS: [&str; 7] = [
    "stack",
    "time",
    "responsiveness",
    "rss",
    "uss",
    "frameNumber",
    "power",
];

const V3_MARKER_FIELDS: [&str; 3] = ["name", "time", "data"];

fn objects_to_table(thread: &mut Object) {
    if let Some(Value::Array(samples)) = thread.get("samples") {
        let data: Vec<Value> = samples
            .iter()
            .map(|sample| {
                V3_SAMPLE_FIELDS
                    .iter()
                    .map(|field| sample.get(field).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect();
        thread.insert(
            "samples".into(),
            json!({ "schema": schema_for(&V3_SAMPLE_FIELDS), "data": data }),
        );
    }

    if let Some(Value::Array(markers)) = thread.remove("markers") {
        let strings = thread
            .entry("stringTable")
            .or_insert_with(|| json!([]));
        let mut data = Vec::with_capacity(markers.len());
        if let Some(strings) = strings.as_array_mut() {
            for marker in &markers {
                let name = marker.get("name").and_then(Value::as_str).unwrap_or("");
                data.push(json!([
                    intern(strings, name),
                    marker.get("time").cloned().unwrap_or(Value::Null),
                    marker.get("data").cloned().unwrap_or(Value::Null),
                ]));
            }
        }
        thread.insert(
            "markers".into(),
            json!({ "schema": schema_for(&V3_MARKER_FIELDS), "data": data }),
        );
    }
}

/// Libraries arrive as a JSON string and object-array samples and markers become tables.
pub(super) fn v4(doc: &mut Value) -> Result<(), ProcessError> {
    if let Some(libs) = doc.get_mut("libs") {
        if let Value::String(s) = &*libs {
            let parsed = serde_json::from_str(s)
                .map_err(|e| ProcessError::upgrade(4, format!("libs is not valid JSON: {e}")))?;
            *libs = parsed;
        }
        if let Some(libs) = libs.as_array_mut() {
            for lib in libs.iter_mut().filter_map(Value::as_object_mut) {
                normalize_lib(lib);
            }
            libs.sort_by_key(|lib| lib.get("start").map(lenient_u64).unwrap_or(0));
        }
    }

    for thread in doc
        .get_mut("threads")
        .and_then(Value::as_array_mut)
        .into_iter()
        .flatten()
    {
        match thread {
            Value::String(s) => {
                let mut subprocess: Value = serde_json::from_str(s).map_err(|e| {
                    ProcessError::upgrade(4, format!("subprocess is not valid JSON: {e}"))
                })?;
                v4(&mut subprocess)?;
                if let Some(meta) = subprocess.get_mut("meta").and_then(Value::as_object_mut) {
                    meta.insert("version".into(), 4.into());
                }
                *s = subprocess.to_string();
            }
            Value::Object(thread) => objects_to_table(thread),
            _ => (),
        }
    }
    Ok(())
}

/// Subprocess profiles move out of `threads` into `processes`.
pub(super) fn v5(doc: &mut Value) -> Result<(), ProcessError> {
    let Some(threads) = doc.get_mut("threads").and_then(Value::as_array_mut) else {
        return Ok(());
    };
    let mut own = Vec::with_capacity(threads.len());
    let mut subprocesses = Vec::new();
    for thread in std::mem::take(threads) {
        match thread {
            Value::String(s) => subprocesses.push(serde_json::from_str::<Value>(&s).map_err(|e| {
                ProcessError::upgrade(5, format!("subprocess is not valid JSON: {e}"))
            })?),
            other => own.push(other),
        }
    }
    *threads = own;

    if let Some(doc) = doc.as_object_mut() {
        let processes = doc.entry("processes").or_insert_with(|| json!([]));
        if let Some(processes) = processes.as_array_mut() {
            processes.extend(subprocesses);
        }
    }
    Ok(())
}

pub(super) fn v6(doc: &mut Value) -> Result<(), ProcessError> {
    remove_thread_columns(doc, "samples", &["frameNumber"]);
    Ok(())
}

/// DOM event markers carried the event type in `type`.
pub(super) fn v7(doc: &mut Value) -> Result<(), ProcessError> {
    for_each_payload(doc, |payload| {
        if payload.get("category").and_then(Value::as_str) != Some("DOMEvent") {
            return;
        }
        let event_type = match payload.get("type").and_then(Value::as_str) {
            None | Some("tracing") | Some("DOMEvent") => return,
            Some(event_type) => event_type.to_owned(),
        };
        payload.insert("eventType".into(), event_type.into());
        payload.insert("type".into(), "DOMEvent".into());
    });
    Ok(())
}

pub(super) fn v8(doc: &mut Value) -> Result<(), ProcessError> {
    remove_thread_columns(doc, "samples", &["rss", "uss", "power"]);
    Ok(())
}

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// GCMajor timings: explicit status, `slices` as a count, allocation in bytes.
pub(super) fn v9(doc: &mut Value) -> Result<(), ProcessError> {
    for_each_payload(doc, |payload| {
        if payload_type(payload) != Some("GCMajor") {
            return;
        }
        let Some(timings) = payload.get_mut("timings").and_then(Value::as_object_mut) else {
            return;
        };
        timings
            .entry("status")
            .or_insert_with(|| "completed".into());
        if let Some(Value::Array(slices)) = timings.remove("slices") {
            timings.insert("slices".into(), slices.len().into());
            timings.insert("slices_list".into(), Value::Array(slices));
        }
        if let Some(allocated) = timings.remove("allocated") {
            if let Some(mib) = allocated.as_f64() {
                timings.insert("allocated_bytes".into(), json!(mib * BYTES_PER_MIB));
            }
        }
    });
    Ok(())
}

const OTHER_CATEGORY: usize = 1;

// Old category bits and the index of the category that replaces each.
const CATEGORY_BITS: [(u64, usize); 9] = [
    (16, OTHER_CATEGORY),
    (32, 2),
    (64, 3),
    (128, 4),
    (256, 4),
    (512, 5),
    (1024, 6),
    (2048, OTHER_CATEGORY),
    (4096, 7),
];

fn category_for_mask(mask: u64) -> usize {
    CATEGORY_BITS
        .iter()
        .find(|(bit, _)| mask & bit != 0)
        .map(|(_, index)| *index)
        .unwrap_or(OTHER_CATEGORY)
}

/// Frame category bitmasks become indices into `meta.categories`.
pub(super) fn v13(doc: &mut Value) -> Result<(), ProcessError> {
    if let Some(meta) = doc.get_mut("meta").and_then(Value::as_object_mut) {
        meta.insert(
            "categories".into(),
            json!([
                { "name": "Idle", "color": "transparent" },
                { "name": "Other", "color": "grey" },
                { "name": "Layout", "color": "purple" },
                { "name": "JavaScript", "color": "yellow" },
                { "name": "GC / CC", "color": "orange" },
                { "name": "Network", "color": "lightblue" },
                { "name": "Graphics", "color": "green" },
                { "name": "DOM", "color": "blue" },
            ]),
        );
    }
    for thread in threads_mut(doc) {
        let Some(frames) = thread.get_mut("frameTable") else {
            continue;
        };
        let Some(index) = column_index(frames, "category") else {
            continue;
        };
        for row in rows_mut(frames) {
            if let Some(cell) = row.get_mut(index) {
                if let Some(mask) = cell.as_u64() {
                    *cell = category_for_mask(mask).into();
                }
            }
        }
    }
    Ok(())
}

pub(super) fn v14(doc: &mut Value) -> Result<(), ProcessError> {
    for thread in threads_mut(doc) {
        let Some(frames) = thread.get_mut("frameTable") else {
            continue;
        };
        let Some(schema) = frames.get_mut("schema").and_then(Value::as_object_mut) else {
            continue;
        };
        if schema.contains_key("relevantForJS") {
            continue;
        }
        let index = schema
            .values()
            .filter_map(Value::as_u64)
            .map(|i| i as usize + 1)
            .max()
            .unwrap_or(0);
        schema.insert("relevantForJS".into(), index.into());
        for row in rows_mut(frames) {
            if row.len() <= index {
                row.resize(index + 1, Value::Null);
            }
            row[index] = false.into();
        }
    }
    Ok(())
}

pub(super) fn v15(doc: &mut Value) -> Result<(), ProcessError> {
    let categories = doc
        .get_mut("meta")
        .and_then(|meta| meta.get_mut("categories"))
        .and_then(Value::as_array_mut);
    for category in categories.into_iter().flatten().filter_map(Value::as_object_mut) {
        category
            .entry("subcategories")
            .or_insert_with(|| json!(["Other"]));
    }
    Ok(())
}

pub(super) fn v19(doc: &mut Value) -> Result<(), ProcessError> {
    for_each_payload(doc, |payload| {
        if payload_type(payload) != Some("IPC") {
            return;
        }
        if let Some(sending) = payload.remove("sending").and_then(|v| v.as_bool()) {
            let direction = if sending { "sending" } else { "receiving" };
            payload.insert("direction".into(), direction.into());
        }
    });
    Ok(())
}

const V20_MARKER_FIELDS: [&str; 6] = ["name", "startTime", "endTime", "phase", "category", "data"];

const INSTANT: u8 = 0;
const INTERVAL: u8 = 1;
const INTERVAL_START: u8 = 2;
const INTERVAL_END: u8 = 3;

/// Markers get explicit start and end times and a phase.
pub(super) fn v20(doc: &mut Value) -> Result<(), ProcessError> {
    let other = doc
        .pointer("/meta/categories")
        .and_then(Value::as_array)
        .and_then(|categories| {
            categories
                .iter()
                .position(|c| c.get("name").and_then(Value::as_str) == Some("Other"))
        })
        .unwrap_or(0);

    for thread in threads_mut(doc) {
        let Some(markers) = thread.get_mut("markers") else {
            continue;
        };
        let name_index = column_index(markers, "name");
        let time_index = column_index(markers, "time");
        let category_index = column_index(markers, "category");
        let data_index = column_index(markers, "data");
        let cell = |row: &mut Vec<Value>, index: Option<usize>| {
            index
                .and_then(|i| row.get_mut(i))
                .map(Value::take)
                .unwrap_or(Value::Null)
        };

        for row in rows_mut(markers) {
            let name = cell(row, name_index);
            let time = cell(row, time_index);
            let category = match cell(row, category_index) {
                Value::Null => other.into(),
                category => category,
            };
            let mut data = cell(row, data_index);

            let (start, end, phase) = match data.as_object_mut() {
                Some(payload)
                    if payload.contains_key("startTime") || payload.contains_key("endTime") =>
                {
                    let start = payload.remove("startTime").unwrap_or(Value::Null);
                    let end = payload.remove("endTime").unwrap_or(Value::Null);
                    match (start.is_number(), end.is_number()) {
                        (true, true) => (start, end, INTERVAL),
                        (true, false) => (start, Value::Null, INTERVAL_START),
                        (false, true) => (Value::Null, end, INTERVAL_END),
                        (false, false) => (time, Value::Null, INSTANT),
                    }
                }
                Some(payload) if payload.contains_key("interval") => {
                    match payload.remove("interval").as_ref().and_then(Value::as_str) {
                        Some("start") => (time, Value::Null, INTERVAL_START),
                        Some("end") => (Value::Null, time, INTERVAL_END),
                        _ => (time, Value::Null, INSTANT),
                    }
                }
                _ => (time, Value::Null, INSTANT),
            };
            *row = vec![name, start, end, phase.into(), category, data];
        }
        if let Some(markers) = markers.as_object_mut() {
            markers.insert("schema".into(), schema_for(&V20_MARKER_FIELDS));
        }
    }
    Ok(())
}

pub(super) fn v22(doc: &mut Value) -> Result<(), ProcessError> {
    if let Some(meta) = doc.get_mut("meta").and_then(Value::as_object_mut) {
        meta.entry("markerSchema").or_insert_with(|| json!([]));
    }
    Ok(())
}

/// Counters keep only their first sample group.
pub(super) fn v25(doc: &mut Value) -> Result<(), ProcessError> {
    let Some(counters) = doc.get_mut("counters").and_then(Value::as_array_mut) else {
        return Ok(());
    };
    counters.retain_mut(|counter| {
        let Some(groups) = counter.get_mut("sample_groups") else {
            return false;
        };
        let first = match groups {
            Value::Array(list) if list.is_empty() => {
                log::debug!("dropping a counter without sample groups");
                return false;
            }
            Value::Array(list) => list.swap_remove(0),
            _ => return true,
        };
        *groups = first;
        true
    });
    Ok(())
}

pub(super) fn v27(doc: &mut Value) -> Result<(), ProcessError> {
    remove_thread_columns(doc, "frameTable", &["optimizations"]);
    Ok(())
}
