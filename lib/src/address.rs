//! Resolve absolute code addresses to a library and a library-relative offset.
//!
//! All arithmetic is done on `u64`: addresses routinely exceed 2^53 and must not pass through
//! floating point.

use crate::processed::Lib;
use std::cmp::Ordering;
use thiserror::Error;

/// A library mapped into a process's address space.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LibMapping {
    pub start: u64,
    pub end: u64,
    pub offset: u64,
    pub lib: Lib,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("not a hexadecimal address: {0:?}")]
pub struct InvalidAddress(pub String);

/// The result of [`AddressLocator::locate`].
#[derive(Debug, PartialEq, Eq)]
pub struct Located<'a> {
    /// The library containing the address, if any.
    pub lib: Option<&'a Lib>,
    /// The address relative to the library's base address when `lib` is set, otherwise the
    /// absolute address (still usable as a sort key).
    pub relative_address: u64,
}

struct Range<'a> {
    start: u64,
    end: u64,
    base_address: u64,
    lib: &'a Lib,
}

pub struct AddressLocator<'a> {
    ranges: Vec<Range<'a>>,
}

impl<'a> AddressLocator<'a> {
    /// `libs` must be sorted by `start` with non-overlapping `[start, end)` ranges. This is not
    /// checked.
    pub fn new(libs: &'a [LibMapping]) -> Self {
        AddressLocator {
            ranges: libs
                .iter()
                .map(|mapping| Range {
                    start: mapping.start,
                    end: mapping.end,
                    // May wrap when the offset exceeds the start address; `locate` subtracts
                    // with wrapping as well, so the relative address still comes out right.
                    base_address: mapping.start.wrapping_sub(mapping.offset),
                    lib: &mapping.lib,
                })
                .collect(),
        }
    }

    pub fn locate(&self, address_hex: &str) -> Result<Located<'a>, InvalidAddress> {
        let address = parse_hex_address(address_hex)?;
        let found = self.ranges.binary_search_by(|range| {
            if address >= range.end {
                Ordering::Less
            } else if address < range.start {
                Ordering::Greater
            } else {
                Ordering::Equal
            }
        });
        Ok(match found {
            Ok(index) => {
                let range = &self.ranges[index];
                Located {
                    lib: Some(range.lib),
                    relative_address: address.wrapping_sub(range.base_address),
                }
            }
            Err(_) => Located {
                lib: None,
                relative_address: address,
            },
        })
    }
}

/// Parse a `0x`-prefixed (or bare) hexadecimal address.
pub fn parse_hex_address(s: &str) -> Result<u64, InvalidAddress> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u64::from_str_radix(digits, 16).map_err(|_| InvalidAddress(s.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(name: &str, start: u64, end: u64, offset: u64) -> LibMapping {
        LibMapping {
            start,
            end,
            offset,
            lib: Lib {
                arch: None,
                name: name.into(),
                path: name.into(),
                debug_name: name.into(),
                debug_path: name.into(),
                breakpad_id: "0".into(),
                code_id: None,
            },
        }
    }

    fn two_libs() -> Vec<LibMapping> {
        vec![mapping("first", 0x0, 0x20, 0), mapping("second", 0x20, 0x40, 0)]
    }

    #[test]
    fn address_inside_first_library() {
        let libs = two_libs();
        let located = AddressLocator::new(&libs).locate("0x10").unwrap();
        assert_eq!(located.lib.map(|l| l.name.as_str()), Some("first"));
        assert_eq!(located.relative_address, 0x10);
    }

    #[test]
    fn range_end_is_exclusive() {
        let libs = two_libs();
        let located = AddressLocator::new(&libs).locate("0x20").unwrap();
        assert_eq!(located.lib.map(|l| l.name.as_str()), Some("second"));
        assert_eq!(located.relative_address, 0);
    }

    #[test]
    fn address_in_gap_is_unresolved() {
        let libs = two_libs();
        let located = AddressLocator::new(&libs).locate("0x50").unwrap();
        assert_eq!(located.lib, None);
        assert_eq!(located.relative_address, 0x50);
    }

    #[test]
    fn offset_moves_the_base_address() {
        let libs = vec![mapping("lib", 0x1000, 0x2000, 0x200)];
        let located = AddressLocator::new(&libs).locate("0x1010").unwrap();
        assert_eq!(located.relative_address, 0x210);
    }

    #[test]
    fn addresses_above_2_pow_53_keep_full_precision() {
        let start = 0x7fff_ffff_f000_0000;
        let libs = vec![mapping("high", start, start + 0x10_0000, 0)];
        let located = AddressLocator::new(&libs)
            .locate("0x7ffffffff0000003")
            .unwrap();
        assert!(located.lib.is_some());
        assert_eq!(located.relative_address, 3);
    }

    #[test]
    fn malformed_hex_is_an_error() {
        let libs = two_libs();
        let locator = AddressLocator::new(&libs);
        assert!(locator.locate("0xnothex").is_err());
        assert!(locator.locate("0x").is_err());
        assert!(locator.locate("0x1ffffffffffffffff").is_err());
    }

    #[test]
    fn no_libraries() {
        let located = AddressLocator::new(&[]).locate("0xabc").unwrap();
        assert_eq!(located.lib, None);
        assert_eq!(located.relative_address, 0xabc);
    }
}
