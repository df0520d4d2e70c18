//! Interning shared by every thread and process of one capture.
//!
//! A [`GlobalDataCollector`] lives exactly as long as one conversion and is passed by `&mut` into
//! every extraction step. It is the only mutable state shared across threads of the capture, so
//! a parallel conversion of threads would have to shard it and merge the results.

use crate::processed::{IndexIntoLibs, IndexIntoStringArray, Lib, Shared, SourceRow, SourceTable};
use std::collections::HashMap;

/// String interning with insertion-order stable indices.
#[derive(Debug, Clone, Default)]
pub struct StringTable {
    strings: Vec<String>,
    index: HashMap<String, IndexIntoStringArray>,
}

impl StringTable {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn index_for_string(&mut self, s: &str) -> IndexIntoStringArray {
        if let Some(index) = self.index.get(s) {
            return *index;
        }
        let index = self.strings.len();
        self.strings.push(s.to_owned());
        self.index.insert(s.to_owned(), index);
        index
    }

    pub fn get_string(&self, index: IndexIntoStringArray) -> Option<&str> {
        self.strings.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    pub fn into_strings(self) -> Vec<String> {
        self.strings
    }
}

#[derive(Debug, Default)]
pub struct GlobalDataCollector {
    libs: Vec<Lib>,
    lib_index: HashMap<String, IndexIntoLibs>,
    strings: StringTable,
    sources: SourceTable,
    source_index: HashMap<IndexIntoStringArray, usize>,
}

impl GlobalDataCollector {
    pub fn new() -> Self {
        Default::default()
    }

    /// Return the index of `lib` in the shared library list, adding it if it is not there yet.
    ///
    /// Libraries are identified by debug name and breakpad id; the same binary loaded by several
    /// processes gets one entry.
    pub fn index_for_lib(&mut self, lib: &Lib) -> IndexIntoLibs {
        let key = format!("{}/{}", lib.debug_name, lib.breakpad_id);
        if let Some(index) = self.lib_index.get(&key) {
            return *index;
        }
        let index = self.libs.len();
        self.libs.push(lib.clone());
        self.lib_index.insert(key, index);
        index
    }

    pub fn index_for_string(&mut self, s: &str) -> IndexIntoStringArray {
        self.strings.index_for_string(s)
    }

    pub fn string_table(&self) -> &StringTable {
        &self.strings
    }

    /// Return the source table index for a script URL already interned as `filename`.
    pub fn index_for_source(&mut self, filename: IndexIntoStringArray) -> usize {
        let sources = &mut self.sources;
        *self
            .source_index
            .entry(filename)
            .or_insert_with(|| sources.push(SourceRow { filename }))
    }

    pub fn libs(&self) -> &[Lib] {
        &self.libs
    }

    /// Consume the collector, yielding the shared library list and the shared tables.
    pub fn finish(self) -> (Vec<Lib>, Shared) {
        (
            self.libs,
            Shared {
                string_array: self.strings.into_strings(),
                source_table: self.sources,
            },
        )
    }
}
