//! Turn the location strings of a thread's frames into functions and resources.
//!
//! A location is one of: an unsymbolicated address (`0x7f3a...`), a native symbol
//! (`name (in library)`, optionally followed by `+ offset` or `(file:line)`), a JS frame
//! (`name (url:line:col)` or a bare `url:line[:col]`), or anything else. Every location yields a
//! function; nothing here fails the conversion.

use crate::address::{AddressLocator, LibMapping};
use crate::interner::GlobalDataCollector;
use crate::processed::{
    ExtensionTable, FuncRow, FuncTable, IndexIntoFuncTable, IndexIntoLibs, IndexIntoStringArray,
    ResourceRow, ResourceTable, ResourceType, NO_ADDRESS, NO_RESOURCE,
};
use once_cell::sync::OnceCell;
use regex::Regex;
use std::collections::HashMap;
use url::Url;

/// The func and resource tables of one thread, plus the func and address of every frame.
#[derive(Debug, Default)]
pub struct ExtractedFuncs {
    pub func_table: FuncTable,
    pub resource_table: ResourceTable,
    pub frame_funcs: Vec<IndexIntoFuncTable>,
    /// Library-relative addresses, [`NO_ADDRESS`] where unknown.
    pub frame_addresses: Vec<i64>,
}

fn native_symbol_regex() -> &'static Regex {
    static NATIVE_SYMBOL: OnceCell<Regex> = OnceCell::new();
    NATIVE_SYMBOL.get_or_init(|| {
        Regex::new(r"^(.*) \(in ([^)]*)\)(?: \+ [0-9]+| \(.*:.*\))?$").unwrap()
    })
}

fn js_regexes() -> &'static [Regex; 4] {
    static JS: OnceCell<[Regex; 4]> = OnceCell::new();
    JS.get_or_init(|| {
        [
            Regex::new(r"^(.*) \((.*):([0-9]+):([0-9]+)\)$").unwrap(),
            Regex::new(r"^(.*) \((.*):([0-9]+)\)$").unwrap(),
            Regex::new(r"^()(.*):([0-9]+):([0-9]+)$").unwrap(),
            Regex::new(r"^()(.*):([0-9]+)$").unwrap(),
        ]
    })
}

const THUNK_PREFIX: &str = "non-virtual thunk to ";

#[derive(Debug, PartialEq)]
struct JsLocation<'a> {
    name: &'a str,
    url: &'a str,
    line: Option<u32>,
    column: Option<u32>,
}

fn parse_js_location(location: &str) -> Option<JsLocation<'_>> {
    js_regexes().iter().find_map(|regex| {
        let captures = regex.captures(location)?;
        let url = captures.get(2)?.as_str();
        if url.is_empty() {
            return None;
        }
        Some(JsLocation {
            name: captures.get(1).map_or("", |m| m.as_str()),
            // Redirect and eval chains are joined with " -> "; the last URL is the script.
            url: url.rsplit(" -> ").next().unwrap_or(url),
            line: captures.get(3).and_then(|m| m.as_str().parse().ok()),
            column: captures.get(4).and_then(|m| m.as_str().parse().ok()),
        })
    })
}

/// `scheme://host[:port]` for URLs with a host.
fn origin_of(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}://{host}:{port}", url.scheme()),
        None => format!("{}://{host}", url.scheme()),
    })
}

struct Extractor<'a, 'c> {
    locator: AddressLocator<'a>,
    collector: &'c mut GlobalDataCollector,
    funcs: FuncTable,
    resources: ResourceTable,
    by_location: HashMap<&'a str, (IndexIntoFuncTable, i64)>,
    lib_resources: HashMap<IndexIntoLibs, usize>,
    native_resources: HashMap<IndexIntoStringArray, usize>,
    native_funcs: HashMap<IndexIntoStringArray, IndexIntoFuncTable>,
    origin_resources: HashMap<String, usize>,
}

impl<'a, 'c> Extractor<'a, 'c> {
    fn new(
        libs: &'a [LibMapping],
        extensions: &ExtensionTable,
        collector: &'c mut GlobalDataCollector,
    ) -> Self {
        let mut extractor = Extractor {
            locator: AddressLocator::new(libs),
            collector,
            funcs: FuncTable::empty(),
            resources: ResourceTable::empty(),
            by_location: HashMap::new(),
            lib_resources: HashMap::new(),
            native_resources: HashMap::new(),
            native_funcs: HashMap::new(),
            origin_resources: HashMap::new(),
        };
        for (name, base_url) in extensions.name.iter().zip(&extensions.base_url) {
            let Some(origin) = Url::parse(base_url).ok().as_ref().and_then(origin_of) else {
                log::debug!("extension {name:?} has an unusable base URL {base_url:?}");
                continue;
            };
            let resource = extractor.resources.push(ResourceRow {
                lib: None,
                name: extractor.collector.index_for_string(name),
                host: Some(extractor.collector.index_for_string(&origin)),
                resource_type: ResourceType::Addon,
            });
            extractor.origin_resources.insert(origin, resource);
        }
        extractor
    }

    fn extract(&mut self, location: &'a str, relevant_for_js: bool) -> (IndexIntoFuncTable, i64) {
        if let Some(found) = self.by_location.get(location) {
            return *found;
        }
        let result = self
            .address(location)
            .or_else(|| self.native_symbol(location))
            .or_else(|| self.js_frame(location))
            .unwrap_or_else(|| (self.unknown(location, relevant_for_js), NO_ADDRESS));
        self.by_location.insert(location, result);
        result
    }

    fn address(&mut self, location: &str) -> Option<(IndexIntoFuncTable, i64)> {
        if !location.starts_with("0x") {
            return None;
        }
        let located = match self.locator.locate(location) {
            Ok(located) => located,
            Err(e) => {
                log::debug!("{e}");
                return None;
            }
        };
        let name = self.collector.index_for_string(location);
        let Some(lib) = located.lib else {
            log::debug!("address {location} is outside of every library");
            let func = self.push_func(name, false, false, NO_RESOURCE);
            return Some((func, NO_ADDRESS));
        };

        let lib_index = self.collector.index_for_lib(lib);
        let resource = match self.lib_resources.get(&lib_index) {
            Some(resource) => *resource,
            None => {
                let resource = self.resources.push(ResourceRow {
                    lib: Some(lib_index),
                    name: self.collector.index_for_string(&lib.name),
                    host: None,
                    resource_type: ResourceType::Library,
                });
                self.lib_resources.insert(lib_index, resource);
                resource
            }
        };
        let func = self.push_func(name, false, false, resource as i64);
        let address = i64::try_from(located.relative_address).unwrap_or(NO_ADDRESS);
        Some((func, address))
    }

    fn native_symbol(&mut self, location: &str) -> Option<(IndexIntoFuncTable, i64)> {
        let captures = native_symbol_regex().captures(location)?;
        let symbol = captures.get(1)?.as_str();
        let library = captures.get(2)?.as_str();
        let symbol = symbol.strip_prefix(THUNK_PREFIX).unwrap_or(symbol);

        let library_name = self.collector.index_for_string(library);
        let resource = match self.native_resources.get(&library_name) {
            Some(resource) => *resource,
            None => {
                let resource = self.resources.push(ResourceRow {
                    lib: None,
                    name: library_name,
                    host: None,
                    resource_type: ResourceType::Library,
                });
                self.native_resources.insert(library_name, resource);
                resource
            }
        };

        let name = self.collector.index_for_string(symbol);
        let func = match self.native_funcs.get(&name) {
            Some(func) => *func,
            None => {
                let func = self.push_func(name, false, false, resource as i64);
                self.native_funcs.insert(name, func);
                func
            }
        };
        Some((func, NO_ADDRESS))
    }

    fn js_frame(&mut self, location: &str) -> Option<(IndexIntoFuncTable, i64)> {
        let js = parse_js_location(location)?;
        let resource = self.resource_for_url(js.url);
        let name = if js.name.is_empty() {
            self.collector
                .index_for_string(&format!("(root scope) {}", js.url))
        } else {
            self.collector.index_for_string(js.name)
        };
        let file_name = self.collector.index_for_string(js.url);
        self.collector.index_for_source(file_name);
        let func = self.funcs.push(FuncRow {
            name,
            is_js: true,
            relevant_for_js: false,
            resource,
            file_name: Some(file_name),
            line_number: js.line,
            column_number: js.column,
        });
        Some((func, NO_ADDRESS))
    }

    fn resource_for_url(&mut self, url: &str) -> i64 {
        let parsed = Url::parse(url).ok();
        let origin = parsed.as_ref().and_then(origin_of);
        let key = origin.clone().unwrap_or_else(|| url.to_owned());
        if let Some(resource) = self.origin_resources.get(&key) {
            return *resource as i64;
        }

        let row = match (&parsed, &origin) {
            (Some(parsed), Some(origin)) => {
                let host = parsed.host_str().unwrap_or_default();
                let resource_type = match parsed.scheme() {
                    "http" | "https" => ResourceType::Webhost,
                    _ => ResourceType::Otherhost,
                };
                ResourceRow {
                    lib: None,
                    name: self.collector.index_for_string(host),
                    host: Some(self.collector.index_for_string(origin)),
                    resource_type,
                }
            }
            _ => ResourceRow {
                lib: None,
                name: self.collector.index_for_string(url),
                host: None,
                resource_type: ResourceType::Url,
            },
        };
        let resource = self.resources.push(row);
        self.origin_resources.insert(key, resource);
        resource as i64
    }

    fn unknown(&mut self, location: &str, relevant_for_js: bool) -> IndexIntoFuncTable {
        let name = self.collector.index_for_string(location);
        self.push_func(name, false, relevant_for_js, NO_RESOURCE)
    }

    fn push_func(
        &mut self,
        name: IndexIntoStringArray,
        is_js: bool,
        relevant_for_js: bool,
        resource: i64,
    ) -> IndexIntoFuncTable {
        self.funcs.push(FuncRow {
            name,
            is_js,
            relevant_for_js,
            resource,
            file_name: None,
            line_number: None,
            column_number: None,
        })
    }
}

/// Build the func and resource tables for one thread.
///
/// `locations` and `relevant_for_js` are parallel, one entry per frame. Extension origins are
/// registered as addon resources before any frame is classified. Results are cached by location
/// string, so every frame with the same location shares one func.
pub fn extract_funcs_and_resources<'a>(
    locations: &[&'a str],
    relevant_for_js: &[bool],
    libs: &'a [LibMapping],
    extensions: &ExtensionTable,
    collector: &mut GlobalDataCollector,
) -> ExtractedFuncs {
    let mut extractor = Extractor::new(libs, extensions, collector);
    let mut frame_funcs = Vec::with_capacity(locations.len());
    let mut frame_addresses = Vec::with_capacity(locations.len());
    for (index, &location) in locations.iter().enumerate() {
        let relevant = relevant_for_js.get(index).copied().unwrap_or(false);
        let (func, address) = extractor.extract(location, relevant);
        frame_funcs.push(func);
        frame_addresses.push(address);
    }
    ExtractedFuncs {
        func_table: extractor.funcs,
        resource_table: extractor.resources,
        frame_funcs,
        frame_addresses,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processed::{ExtensionRow, Lib};
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn lib(name: &str, start: u64, end: u64) -> LibMapping {
        LibMapping {
            start,
            end,
            offset: 0,
            lib: Lib {
                arch: None,
                name: name.into(),
                path: format!("/lib/{name}"),
                debug_name: name.into(),
                debug_path: format!("/lib/{name}"),
                breakpad_id: "ABCD0".into(),
                code_id: None,
            },
        }
    }

    struct Single {
        extracted: ExtractedFuncs,
        collector: GlobalDataCollector,
    }

    impl Single {
        fn func_name(&self) -> &str {
            let name = self.extracted.func_table.name[self.extracted.frame_funcs[0]];
            self.collector.string_table().get_string(name).unwrap()
        }

        fn resource(&self) -> Option<ResourceRow> {
            let resource = self.extracted.func_table.resource[self.extracted.frame_funcs[0]];
            let table = &self.extracted.resource_table;
            usize::try_from(resource).ok().map(|i| ResourceRow {
                lib: table.lib[i],
                name: table.name[i],
                host: table.host[i],
                resource_type: table.resource_type[i],
            })
        }

        fn string(&self, index: usize) -> &str {
            self.collector.string_table().get_string(index).unwrap()
        }
    }

    fn extract_one(location: &str, libs: &[LibMapping], extensions: &ExtensionTable) -> Single {
        let mut collector = GlobalDataCollector::new();
        let extracted =
            extract_funcs_and_resources(&[location], &[false], libs, extensions, &mut collector);
        Single {
            extracted,
            collector,
        }
    }

    #[rstest]
    #[case("foo (in libxul.so)", "foo", "libxul.so")]
    #[case("foo (in libxul.so) + 32", "foo", "libxul.so")]
    #[case("Bar::baz() (in XUL) (Bar.cpp:12)", "Bar::baz()", "XUL")]
    #[case("non-virtual thunk to Qux::run() (in libxul.so) + 4", "Qux::run()", "libxul.so")]
    fn native_symbols(#[case] location: &str, #[case] name: &str, #[case] library: &str) {
        let single = extract_one(location, &[], &ExtensionTable::empty());
        assert_eq!(single.func_name(), name);
        assert!(!single.extracted.func_table.is_js[0]);
        let resource = single.resource().unwrap();
        assert_eq!(resource.resource_type, ResourceType::Library);
        assert_eq!(resource.lib, None);
        assert_eq!(single.string(resource.name), library);
        assert_eq!(single.extracted.frame_addresses, vec![NO_ADDRESS]);
    }

    #[rstest]
    #[case("bar (http://x.org/s.js:10:5)", "bar", "http://x.org/s.js", Some(10), Some(5))]
    #[case("bar (http://x.org/s.js:10)", "bar", "http://x.org/s.js", Some(10), None)]
    #[case(
        "bar (http://x.org/a.js -> http://y.org/b.js:3:1)",
        "bar",
        "http://y.org/b.js",
        Some(3),
        Some(1)
    )]
    #[case(
        "https://x.org/s.js:7:2",
        "(root scope) https://x.org/s.js",
        "https://x.org/s.js",
        Some(7),
        Some(2)
    )]
    #[case(
        "resource://gre/modules/A.jsm:40",
        "(root scope) resource://gre/modules/A.jsm",
        "resource://gre/modules/A.jsm",
        Some(40),
        None
    )]
    fn js_frames(
        #[case] location: &str,
        #[case] name: &str,
        #[case] file: &str,
        #[case] line: Option<u32>,
        #[case] column: Option<u32>,
    ) {
        let single = extract_one(location, &[], &ExtensionTable::empty());
        let funcs = &single.extracted.func_table;
        assert_eq!(single.func_name(), name);
        assert!(funcs.is_js[0]);
        assert!(!funcs.relevant_for_js[0]);
        assert_eq!(funcs.file_name[0].map(|i| single.string(i)), Some(file));
        assert_eq!(funcs.line_number[0], line);
        assert_eq!(funcs.column_number[0], column);
    }

    #[rstest]
    #[case("http://x.org/s.js:1:1", ResourceType::Webhost, "x.org")]
    #[case("https://x.org:8080/s.js:1:1", ResourceType::Webhost, "x.org")]
    #[case("chrome://browser/content/b.js:1:1", ResourceType::Otherhost, "browser")]
    #[case("moz-extension://abc/bg.js:1:1", ResourceType::Addon, "Test Extension")]
    #[case("moz-extension://other/bg.js:1:1", ResourceType::Otherhost, "other")]
    #[case("self-hosted:12:3", ResourceType::Url, "self-hosted")]
    fn js_resource_types(
        #[case] location: &str,
        #[case] resource_type: ResourceType,
        #[case] name: &str,
    ) {
        let mut extensions = ExtensionTable::empty();
        extensions.push(ExtensionRow {
            id: "ext@test".into(),
            name: "Test Extension".into(),
            base_url: "moz-extension://abc/".into(),
        });
        let single = extract_one(location, &[], &extensions);
        let resource = single.resource().unwrap();
        assert_eq!(resource.resource_type, resource_type);
        assert_eq!(single.string(resource.name), name);
    }

    #[test]
    fn unresolved_address() {
        let single = extract_one("0x1000", &[], &ExtensionTable::empty());
        assert_eq!(single.func_name(), "0x1000");
        assert_eq!(single.extracted.func_table.resource, vec![NO_RESOURCE]);
        assert_eq!(single.extracted.frame_addresses, vec![NO_ADDRESS]);
    }

    #[test]
    fn resolved_address_gets_a_library_resource() {
        let libs = vec![lib("libxul.so", 0x1000, 0x9000)];
        let single = extract_one("0x1234", &libs, &ExtensionTable::empty());
        let resource = single.resource().unwrap();
        assert_eq!(resource.resource_type, ResourceType::Library);
        assert_eq!(resource.lib, Some(0));
        assert_eq!(single.string(resource.name), "libxul.so");
        assert_eq!(single.extracted.frame_addresses, vec![0x234]);
        assert_eq!(single.collector.libs().len(), 1);
    }

    #[test]
    fn malformed_address_falls_through() {
        let single = extract_one("0xzz", &[], &ExtensionTable::empty());
        assert_eq!(single.func_name(), "0xzz");
        assert_eq!(single.extracted.func_table.resource, vec![NO_RESOURCE]);
    }

    #[test]
    fn unknown_locations_keep_relevant_for_js() {
        let mut collector = GlobalDataCollector::new();
        let extracted = extract_funcs_and_resources(
            &["(root)", "Interpreter"],
            &[false, true],
            &[],
            &ExtensionTable::empty(),
            &mut collector,
        );
        assert_eq!(extracted.func_table.relevant_for_js, vec![false, true]);
        assert_eq!(extracted.func_table.resource, vec![NO_RESOURCE, NO_RESOURCE]);
    }

    #[test]
    fn repeated_locations_share_funcs_and_resources() {
        let libs = vec![lib("libxul.so", 0x1000, 0x9000)];
        let mut collector = GlobalDataCollector::new();
        let extracted = extract_funcs_and_resources(
            &[
                "0x1010",
                "0x1020",
                "0x1010",
                "foo (in libc.so) + 1",
                "foo (in libc.so) + 9",
                "a (https://x.org/a.js:1:1)",
                "b (https://x.org/b.js:2:1)",
            ],
            &[false; 7],
            &libs,
            &ExtensionTable::empty(),
            &mut collector,
        );
        assert_eq!(extracted.frame_funcs, vec![0, 1, 0, 2, 2, 3, 4]);
        assert_eq!(
            extracted.frame_addresses,
            vec![0x10, 0x20, 0x10, NO_ADDRESS, NO_ADDRESS, NO_ADDRESS, NO_ADDRESS]
        );
        // libxul.so, libc.so and one web host for both scripts.
        assert_eq!(extracted.resource_table.length, 3);
        assert_eq!(extracted.func_table.resource, vec![0, 0, 1, 2, 2]);
        let (_, shared) = collector.finish();
        assert_eq!(shared.source_table.length, 2);
    }
}
