//! Convert a whole raw capture, root process and subprocesses, into one processed profile.

use crate::address::LibMapping;
use crate::error::ProcessError;
use crate::extract::{extract_funcs_and_resources, ExtractedFuncs};
use crate::gecko::{
    GeckoCounter, GeckoMeta, GeckoProfile, GeckoProfilerOverhead, GeckoTable, GeckoThread,
    GECKO_PROFILE_VERSION,
};
use crate::interner::GlobalDataCollector;
use crate::markers::{process_markers, process_samples, MarkerContext, UniqueStringFields};
use crate::processed::{
    Category, Counter, CounterSampleRow, CounterSamplesTable, ExtensionTable, FrameRow, FrameTable,
    IndexIntoCategories, Meta, NativeSymbolTable, ProcessedProfile, ProfilerOverhead,
    ProfilerOverheadSampleRow, ProfilerOverheadSamplesTable, StackRow, StackTable, Thread,
    PROCESSED_PROFILE_VERSION,
};
use crate::table::ColumnarTable;
use crate::upgrade::upgrade_gecko_profile;
use serde_json::Value;

/// Upgrade `raw` to the current format version and convert it.
pub fn process_gecko_profile(mut raw: Value) -> Result<ProcessedProfile, ProcessError> {
    upgrade_gecko_profile(&mut raw)?;
    let mut profile = GeckoProfile::from_value(raw)?;

    let extensions = profile.meta.extension_table()?;
    let meta = processed_meta(&profile.meta, extensions.clone());

    let mut builder = ProfileBuilder {
        collector: GlobalDataCollector::new(),
        root_start_time: profile.meta.start_time,
        extensions,
        threads: Vec::new(),
        counters: Vec::new(),
        profiler_overhead: Vec::new(),
        pages: Vec::new(),
    };
    builder.add_process(profile)?;

    let ProfileBuilder {
        collector,
        threads,
        counters,
        profiler_overhead,
        pages,
        ..
    } = builder;
    let (libs, shared) = collector.finish();
    shared.source_table.check_lengths()?;

    Ok(ProcessedProfile {
        meta,
        libs,
        shared,
        pages,
        threads,
        counters,
        profiler_overhead,
    })
}

fn processed_meta(meta: &GeckoMeta, extensions: ExtensionTable) -> Meta {
    Meta {
        interval: meta.interval,
        start_time: meta.start_time,
        shutdown_time: meta.shutdown_time,
        process_type: meta.process_type.clone(),
        product: meta.product.clone().unwrap_or_default(),
        stackwalk: meta.stackwalk.clone(),
        debug: meta.debug.unwrap_or(false),
        version: GECKO_PROFILE_VERSION,
        preprocessed_profile_version: PROCESSED_PROFILE_VERSION,
        categories: meta.categories.clone(),
        marker_schema: meta.marker_schema.clone(),
        extensions,
        sample_units: meta.sample_units.clone(),
        oscpu: meta.oscpu.clone(),
        platform: meta.platform.clone(),
        toolkit: meta.toolkit.clone(),
        abi: meta.abi.clone(),
        misc: meta.misc.clone(),
        app_build_id: meta.app_build_id.clone(),
        source_url: meta.source_url.clone(),
        physical_cpus: meta.physical_cpus,
        logical_cpus: meta.logical_cpus,
        configuration: meta.configuration.clone(),
        symbolicated: false,
    }
}

/// The category stacks fall back to when no frame on them has one.
fn default_category(categories: &[Category]) -> IndexIntoCategories {
    categories
        .iter()
        .position(|category| category.color == "grey")
        .unwrap_or(0)
}

/// Per-process values every thread of the process needs.
struct ProcessContext<'a> {
    meta: &'a GeckoMeta,
    libs: &'a [LibMapping],
    time_offset: f64,
    default_category: IndexIntoCategories,
    unique_string_fields: UniqueStringFields,
}

struct ProfileBuilder {
    collector: GlobalDataCollector,
    root_start_time: f64,
    extensions: ExtensionTable,
    threads: Vec<Thread>,
    counters: Vec<Counter>,
    profiler_overhead: Vec<ProfilerOverhead>,
    pages: Vec<Value>,
}

impl ProfileBuilder {
    /// Add a process and, depth first, its subprocesses.
    fn add_process(&mut self, profile: GeckoProfile) -> Result<(), ProcessError> {
        let GeckoProfile {
            meta,
            libs,
            pages,
            threads,
            processes,
            counters,
            profiler_overhead,
        } = profile;

        let mut libs: Vec<LibMapping> = libs.into_iter().map(LibMapping::from).collect();
        libs.sort_by_key(|lib| lib.start);
        let context = ProcessContext {
            meta: &meta,
            libs: &libs,
            time_offset: meta.start_time - self.root_start_time,
            default_category: default_category(&meta.categories),
            unique_string_fields: UniqueStringFields::from_marker_schema(&meta.marker_schema),
        };

        let mut main_thread = None;
        for thread in threads {
            let thread = self.process_thread(thread, &context)?;
            if thread.is_main_thread && main_thread.is_none() {
                main_thread = Some(self.threads.len());
            }
            self.threads.push(thread);
        }
        self.pages.extend(pages);

        match main_thread {
            Some(index) => {
                let pid = self.threads[index].pid.clone();
                for counter in counters {
                    let counter = process_counter(counter, &pid, index, context.time_offset)?;
                    self.counters.push(counter);
                }
                if let Some(overhead) = profiler_overhead {
                    let overhead = process_overhead(overhead, &pid, index, context.time_offset)?;
                    self.profiler_overhead.push(overhead);
                }
            }
            None => {
                if !counters.is_empty() || profiler_overhead.is_some() {
                    log::debug!(
                        "process started at {} has no main thread; dropping its counters and \
                         profiler overhead",
                        meta.start_time
                    );
                }
            }
        }

        for subprocess in processes {
            self.add_process(subprocess)?;
        }
        Ok(())
    }

    fn process_thread(
        &mut self,
        thread: GeckoThread,
        process: &ProcessContext,
    ) -> Result<Thread, ProcessError> {
        let GeckoThread {
            name,
            process_type,
            process_name,
            tid,
            pid,
            register_time,
            unregister_time,
            paused_ranges,
            samples,
            markers,
            stack_table,
            frame_table,
            string_table,
        } = thread;
        log::debug!("processing thread {name:?}");
        let offset = process.time_offset;
        let tid = tid.unwrap_or_default();

        let (frame_table, funcs) =
            self.process_frames(frame_table, &string_table, process.libs)?;
        let stack_table = process_stacks(
            stack_table,
            &frame_table,
            process.default_category,
            &name,
        )?;
        let samples = process_samples(samples, offset)?;
        let markers = process_markers(
            markers,
            &MarkerContext {
                thread_name: &name,
                tid: &tid,
                strings: &string_table,
                time_offset: offset,
                unique_string_fields: &process.unique_string_fields,
            },
            &mut self.collector,
        )?;

        let thread = Thread {
            is_main_thread: name == "GeckoMain",
            name,
            process_type: process_type.unwrap_or_else(|| "default".to_owned()),
            process_name,
            pid: pid.map(|pid| pid.to_string()).unwrap_or_default(),
            tid,
            process_startup_time: offset,
            process_shutdown_time: process.meta.shutdown_time.map(|t| t + offset),
            register_time: register_time + offset,
            unregister_time: unregister_time.map(|t| t + offset),
            paused_ranges: paused_ranges
                .into_iter()
                .map(|range| shift_paused_range(range, offset))
                .collect(),
            samples,
            markers: markers.markers,
            stack_table,
            frame_table,
            func_table: funcs.func_table,
            resource_table: funcs.resource_table,
            native_symbols: NativeSymbolTable::empty(),
            js_allocations: markers.js_allocations,
            native_allocations: markers.native_allocations,
        };
        thread.check_tables()?;
        Ok(thread)
    }

    fn process_frames(
        &mut self,
        frames: GeckoTable,
        strings: &[String],
        libs: &[LibMapping],
    ) -> Result<(FrameTable, ExtractedFuncs), ProcessError> {
        let mut columns = frames.into_columns();
        let locations = columns.take::<usize>("location")?;
        let relevant_for_js = columns.take::<bool>("relevantForJS")?;
        let inner_window_ids = columns.take::<u64>("innerWindowID")?;
        let implementations = columns.take::<usize>("implementation")?;
        let lines = columns.take::<u32>("line")?;
        let column_numbers = columns.take::<u32>("column")?;
        let categories = columns.take::<usize>("category")?;
        let subcategories = columns.take::<usize>("subcategory")?;

        let location_strings: Vec<&str> = locations
            .iter()
            .map(|location| {
                location
                    .and_then(|index| strings.get(index))
                    .map(String::as_str)
                    .unwrap_or_default()
            })
            .collect();
        let relevant_for_js: Vec<bool> = relevant_for_js
            .into_iter()
            .map(Option::unwrap_or_default)
            .collect();
        let funcs = extract_funcs_and_resources(
            &location_strings,
            &relevant_for_js,
            libs,
            &self.extensions,
            &mut self.collector,
        );

        let mut table = FrameTable::empty();
        for index in 0..columns.len() {
            let implementation = implementations[index]
                .and_then(|local| strings.get(local))
                .map(|s| self.collector.index_for_string(s));
            table.push(FrameRow {
                address: funcs.frame_addresses[index],
                inline_depth: 0,
                category: categories[index],
                subcategory: subcategories[index],
                func: funcs.frame_funcs[index],
                native_symbol: None,
                inner_window_id: inner_window_ids[index],
                implementation,
                line: lines[index],
                column: column_numbers[index],
            });
        }
        Ok((table, funcs))
    }
}

fn shift_paused_range(mut range: Value, offset: f64) -> Value {
    for key in ["startTime", "endTime"] {
        if let Some(time) = range.get_mut(key) {
            if let Some(t) = time.as_f64() {
                *time = (t + offset).into();
            }
        }
    }
    range
}

/// Build the stack table, giving every stack a category.
///
/// A stack takes its frame's category, else its prefix's, else `default_category`. Prefix
/// chains must end; a cycle or an out of range index fails the conversion.
fn process_stacks(
    stacks: GeckoTable,
    frames: &FrameTable,
    default_category: IndexIntoCategories,
    thread_name: &str,
) -> Result<StackTable, ProcessError> {
    let malformed = |message: String| ProcessError::MalformedStackTable {
        thread: thread_name.to_owned(),
        message,
    };
    let mut columns = stacks.into_columns();
    let length = columns.len();
    let prefixes = columns.take::<usize>("prefix")?;
    let stack_frames = columns
        .take::<usize>("frame")?
        .into_iter()
        .enumerate()
        .map(|(index, frame)| match frame {
            Some(frame) if frame < frames.length => Ok(frame),
            Some(frame) => Err(malformed(format!(
                "stack {index} refers to frame {frame} of {}",
                frames.length
            ))),
            None => Err(malformed(format!("stack {index} has no frame"))),
        })
        .collect::<Result<Vec<_>, _>>()?;

    // Every prefix chain must reach a root.
    const UNVISITED: u8 = 0;
    const ON_PATH: u8 = 1;
    const TERMINATES: u8 = 2;
    let mut state = vec![UNVISITED; length];
    for start in 0..length {
        let mut path = Vec::new();
        let mut current = Some(start);
        while let Some(stack) = current {
            match state[stack] {
                TERMINATES => break,
                ON_PATH => return Err(malformed(format!("stack {stack} is its own prefix"))),
                _ => (),
            }
            state[stack] = ON_PATH;
            path.push(stack);
            current = prefixes[stack];
            if let Some(prefix) = current {
                if prefix >= length {
                    return Err(malformed(format!(
                        "stack {stack} has prefix {prefix} of {length}"
                    )));
                }
            }
        }
        for stack in path {
            state[stack] = TERMINATES;
        }
    }

    let mut resolved: Vec<Option<(IndexIntoCategories, usize)>> = vec![None; length];
    for start in 0..length {
        let mut chain = Vec::new();
        let mut current = Some(start);
        let mut category = (default_category, 0);
        while let Some(stack) = current {
            if let Some(known) = resolved[stack] {
                category = known;
                break;
            }
            let frame = stack_frames[stack];
            if let Some(frame_category) = frames.category[frame] {
                category = (frame_category, frames.subcategory[frame].unwrap_or(0));
                chain.push(stack);
                break;
            }
            chain.push(stack);
            current = prefixes[stack];
        }
        for stack in chain {
            resolved[stack] = Some(category);
        }
    }

    let mut table = StackTable::empty();
    for (index, (frame, prefix)) in stack_frames.into_iter().zip(prefixes).enumerate() {
        let (category, subcategory) = resolved[index].unwrap_or((default_category, 0));
        table.push(StackRow {
            frame,
            prefix,
            category,
            subcategory,
        });
    }
    Ok(table)
}

fn process_counter(
    counter: GeckoCounter,
    pid: &str,
    main_thread_index: usize,
    time_offset: f64,
) -> Result<Counter, ProcessError> {
    let mut columns = counter.sample_groups.samples.into_columns();
    let has_number = columns.contains("number");
    let times = columns.take::<f64>("time")?;
    let counts = columns.take::<f64>("count")?;
    let numbers = columns.take::<u64>("number")?;

    let mut samples = CounterSamplesTable {
        number: has_number.then(Vec::new),
        ..CounterSamplesTable::empty()
    };
    for ((time, count), number) in times.into_iter().zip(counts).zip(numbers) {
        samples.push(CounterSampleRow {
            time: time.unwrap_or_default() + time_offset,
            count: count.unwrap_or_default(),
            number,
        });
    }
    samples.check_lengths()?;
    Ok(Counter {
        name: counter.name,
        category: counter.category,
        description: counter.description,
        pid: pid.to_owned(),
        main_thread_index,
        samples,
    })
}

fn process_overhead(
    overhead: GeckoProfilerOverhead,
    pid: &str,
    main_thread_index: usize,
    time_offset: f64,
) -> Result<ProfilerOverhead, ProcessError> {
    let mut columns = overhead.samples.into_columns();
    let times = columns.take::<f64>("time")?;
    let locking = columns.take::<f64>("locking")?;
    let cleaning = columns.take::<f64>("expiredMarkerCleaning")?;
    let counters = columns.take::<f64>("counters")?;
    let threads = columns.take::<f64>("threads")?;

    let mut samples = ProfilerOverheadSamplesTable::empty();
    for index in 0..columns.len() {
        samples.push(ProfilerOverheadSampleRow {
            counters: counters[index].unwrap_or_default(),
            expired_marker_cleaning: cleaning[index].unwrap_or_default(),
            locking: locking[index].unwrap_or_default(),
            threads: threads[index].unwrap_or_default(),
            time: times[index].unwrap_or_default() + time_offset,
        });
    }
    Ok(ProfilerOverhead {
        samples,
        statistics: overhead.statistics,
        pid: pid.to_owned(),
        main_thread_index,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn frames(categories: &[Option<usize>]) -> FrameTable {
        let mut table = FrameTable::empty();
        for category in categories {
            table.push(FrameRow {
                category: *category,
                subcategory: category.map(|_| 1),
                ..Default::default()
            });
        }
        table
    }

    fn stacks(data: Value) -> GeckoTable {
        serde_json::from_value(json!({"schema": {"prefix": 0, "frame": 1}, "data": data})).unwrap()
    }

    #[test]
    fn stack_categories_are_inherited() {
        let frames = frames(&[Some(3), None, Some(5)]);
        let table = process_stacks(
            stacks(json!([[null, 1], [null, 0], [1, 1], [2, 2], [3, 1]])),
            &frames,
            1,
            "GeckoMain",
        )
        .unwrap();
        assert_eq!(table.category, vec![1, 3, 3, 5, 5]);
        assert_eq!(table.subcategory, vec![0, 1, 1, 1, 1]);
        assert_eq!(table.prefix, vec![None, None, Some(1), Some(2), Some(3)]);
    }

    #[test]
    fn prefix_cycles_are_fatal() {
        let frames = frames(&[None]);
        let err = process_stacks(stacks(json!([[1, 0], [0, 0]])), &frames, 0, "GeckoMain")
            .unwrap_err();
        assert!(matches!(err, ProcessError::MalformedStackTable { .. }));
    }

    #[test]
    fn out_of_range_frames_are_fatal() {
        let frames = frames(&[None]);
        let err =
            process_stacks(stacks(json!([[null, 4]])), &frames, 0, "GeckoMain").unwrap_err();
        assert!(matches!(err, ProcessError::MalformedStackTable { .. }));
    }

    #[test]
    fn grey_is_the_default_category() {
        let categories: Vec<Category> = serde_json::from_value(json!([
            {"name": "Idle", "color": "transparent"},
            {"name": "Other", "color": "grey"}
        ]))
        .unwrap();
        assert_eq!(default_category(&categories), 1);
        assert_eq!(default_category(&[]), 0);
    }

    #[test]
    fn paused_ranges_are_shifted() {
        assert_eq!(
            shift_paused_range(json!({"startTime": 1.0, "endTime": null, "reason": "profiler-paused"}), 2.0),
            json!({"startTime": 3.0, "endTime": null, "reason": "profiler-paused"})
        );
    }
}
