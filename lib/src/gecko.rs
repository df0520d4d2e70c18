//! The raw profile format written by the browser's profiler.
//!
//! Per-thread tables arrive row-major: a `schema` mapping column names to tuple positions and a
//! `data` array of tuples. The positions are declared per document and moved around between
//! format versions, so tuples are never given a static type. [`GeckoTable::into_columns`]
//! transposes a table into named columns right after parsing, and nothing past that point sees
//! the tuple form.

use crate::address::LibMapping;
use crate::error::ProcessError;
use crate::processed::{Category, ExtensionRow, ExtensionTable, Id, Lib};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

/// The newest raw format version understood by this crate.
pub const GECKO_PROFILE_VERSION: u64 = 31;

#[derive(Debug, Default, Deserialize)]
pub struct GeckoTable {
    #[serde(default)]
    pub schema: HashMap<String, usize>,
    #[serde(default)]
    pub data: Vec<Vec<Value>>,
}

impl GeckoTable {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Transpose the tuples into one vector per schema column.
    ///
    /// Tuples shorter than a column's position read `null` in that column.
    pub fn into_columns(self) -> Columns {
        let GeckoTable { schema, data } = self;
        let length = data.len();
        let mut columns: HashMap<String, Vec<Value>> = schema
            .keys()
            .map(|name| (name.clone(), Vec::with_capacity(length)))
            .collect();
        for mut row in data {
            for (name, &index) in &schema {
                let cell = row.get_mut(index).map(Value::take).unwrap_or(Value::Null);
                if let Some(column) = columns.get_mut(name) {
                    column.push(cell);
                }
            }
        }
        Columns { length, columns }
    }
}

/// A table in column-major form with dynamically typed cells.
#[derive(Debug, Default)]
pub struct Columns {
    length: usize,
    columns: HashMap<String, Vec<Value>>,
}

impl Columns {
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    /// Remove a column and decode its cells. A column missing from the schema reads as all
    /// `None`, as do `null` cells.
    pub fn take<T: DeserializeOwned>(&mut self, name: &str) -> Result<Vec<Option<T>>, ProcessError> {
        match self.columns.remove(name) {
            None => Ok((0..self.length).map(|_| None).collect()),
            Some(values) => values
                .into_iter()
                .map(|value| match value {
                    Value::Null => Ok(None),
                    value => serde_json::from_value(value).map(Some),
                })
                .collect::<Result<_, _>>()
                .map_err(|source| ProcessError::InvalidColumn {
                    column: name.to_owned(),
                    source,
                }),
        }
    }

    /// Remove a column without decoding it.
    pub fn take_raw(&mut self, name: &str) -> Option<Vec<Value>> {
        self.columns.remove(name)
    }
}

fn default_interval() -> f64 {
    1.0
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeckoProfile {
    pub meta: GeckoMeta,
    #[serde(default)]
    pub libs: Vec<GeckoLib>,
    #[serde(default)]
    pub pages: Vec<Value>,
    #[serde(default)]
    pub threads: Vec<GeckoThread>,
    #[serde(default)]
    pub processes: Vec<GeckoProfile>,
    #[serde(default)]
    pub counters: Vec<GeckoCounter>,
    #[serde(default)]
    pub profiler_overhead: Option<GeckoProfilerOverhead>,
}

impl GeckoProfile {
    /// Parse an upgraded document.
    pub fn from_value(value: Value) -> Result<Self, ProcessError> {
        Ok(serde_path_to_error::deserialize(value)?)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeckoMeta {
    pub version: u64,
    #[serde(default)]
    pub start_time: f64,
    pub shutdown_time: Option<f64>,
    #[serde(default = "default_interval")]
    pub interval: f64,
    pub process_type: Option<Value>,
    pub product: Option<String>,
    pub stackwalk: Option<Value>,
    pub debug: Option<bool>,
    #[serde(default)]
    pub categories: Vec<Category>,
    #[serde(default)]
    pub marker_schema: Vec<Value>,
    pub extensions: Option<GeckoTable>,
    pub sample_units: Option<Value>,
    pub oscpu: Option<String>,
    pub platform: Option<String>,
    pub toolkit: Option<String>,
    pub abi: Option<String>,
    pub misc: Option<String>,
    #[serde(rename = "appBuildID")]
    pub app_build_id: Option<String>,
    #[serde(rename = "sourceURL")]
    pub source_url: Option<String>,
    #[serde(rename = "physicalCPUs")]
    pub physical_cpus: Option<u32>,
    #[serde(rename = "logicalCPUs")]
    pub logical_cpus: Option<u32>,
    pub configuration: Option<Value>,
}

impl GeckoMeta {
    /// Decode `meta.extensions` into a column table.
    pub fn extension_table(&mut self) -> Result<ExtensionTable, ProcessError> {
        let mut table = ExtensionTable::empty();
        let Some(extensions) = self.extensions.take() else {
            return Ok(table);
        };
        let mut columns = extensions.into_columns();
        let ids = columns.take::<String>("id")?;
        let names = columns.take::<String>("name")?;
        let base_urls = columns.take::<String>("baseURL")?;
        for ((id, name), base_url) in ids.into_iter().zip(names).zip(base_urls) {
            table.push(ExtensionRow {
                id: id.unwrap_or_default(),
                name: name.unwrap_or_default(),
                base_url: base_url.unwrap_or_default(),
            });
        }
        Ok(table)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeckoLib {
    pub start: u64,
    pub end: u64,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub debug_name: String,
    #[serde(default)]
    pub debug_path: String,
    #[serde(default)]
    pub breakpad_id: String,
    pub code_id: Option<String>,
    pub arch: Option<String>,
}

impl From<GeckoLib> for LibMapping {
    fn from(lib: GeckoLib) -> Self {
        LibMapping {
            start: lib.start,
            end: lib.end,
            offset: lib.offset,
            lib: Lib {
                arch: lib.arch,
                name: lib.name,
                path: lib.path,
                debug_name: lib.debug_name,
                debug_path: lib.debug_path,
                breakpad_id: lib.breakpad_id,
                code_id: lib.code_id,
            },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeckoThread {
    #[serde(default)]
    pub name: String,
    pub process_type: Option<String>,
    pub process_name: Option<String>,
    pub tid: Option<Id>,
    pub pid: Option<Id>,
    #[serde(default)]
    pub register_time: f64,
    pub unregister_time: Option<f64>,
    #[serde(default)]
    pub paused_ranges: Vec<Value>,
    #[serde(default)]
    pub samples: GeckoSamples,
    #[serde(default)]
    pub markers: GeckoTable,
    #[serde(default)]
    pub stack_table: GeckoTable,
    #[serde(default)]
    pub frame_table: GeckoTable,
    #[serde(default)]
    pub string_table: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeckoSamples {
    #[serde(flatten)]
    pub table: GeckoTable,
    pub weight_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GeckoCounter {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub description: String,
    pub sample_groups: GeckoSampleGroup,
}

#[derive(Debug, Deserialize)]
pub struct GeckoSampleGroup {
    pub id: Option<Value>,
    #[serde(default)]
    pub samples: GeckoTable,
}

#[derive(Debug, Deserialize)]
pub struct GeckoProfilerOverhead {
    #[serde(default)]
    pub samples: GeckoTable,
    pub statistics: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn table(value: Value) -> GeckoTable {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn columns_follow_the_schema_not_the_position() {
        let mut columns = table(json!({
            "schema": {"time": 1, "stack": 0},
            "data": [[3, 1.5], [null, 2.5]]
        }))
        .into_columns();
        assert_eq!(columns.len(), 2);
        assert_eq!(columns.take::<f64>("time").unwrap(), vec![Some(1.5), Some(2.5)]);
        assert_eq!(columns.take::<usize>("stack").unwrap(), vec![Some(3), None]);
    }

    #[test]
    fn missing_columns_and_short_tuples_read_null() {
        let mut columns = table(json!({
            "schema": {"location": 0, "line": 3},
            "data": [[7], [8, null, null, 12]]
        }))
        .into_columns();
        assert_eq!(columns.take::<u32>("line").unwrap(), vec![None, Some(12)]);
        assert_eq!(columns.take::<u32>("column").unwrap(), vec![None, None]);
        assert!(!columns.contains("column"));
    }

    #[test]
    fn badly_typed_cell_names_the_column() {
        let mut columns = table(json!({
            "schema": {"time": 0},
            "data": [["soon"]]
        }))
        .into_columns();
        let err = columns.take::<f64>("time").unwrap_err();
        assert!(matches!(err, ProcessError::InvalidColumn { ref column, .. } if column == "time"));
    }

    #[test]
    fn extensions_become_a_column_table() {
        let mut meta: GeckoMeta = serde_json::from_value(json!({
            "version": GECKO_PROFILE_VERSION,
            "extensions": {
                "schema": {"id": 0, "name": 1, "baseURL": 2},
                "data": [["ext@test", "Test Extension", "moz-extension://abc/"]]
            }
        }))
        .unwrap();
        let extensions = meta.extension_table().unwrap();
        assert_eq!(extensions.length, 1);
        assert_eq!(extensions.base_url, vec!["moz-extension://abc/".to_owned()]);
    }

    #[test]
    fn large_lib_addresses_are_read_exactly() {
        let lib: GeckoLib = serde_json::from_value(json!({
            "start": 18446744073709547520u64,
            "end": 18446744073709551615u64,
            "offset": 0,
            "name": "libc.so"
        }))
        .unwrap();
        assert_eq!(lib.start, 0xffff_ffff_ffff_f000);
    }
}
