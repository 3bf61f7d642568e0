// Region lookup interface
//
// Maps an endpoint's digits to a display region. Real lookups live outside
// this workspace; `UnknownRegion` is the fallback used when none is wired in.

use serde::{Deserialize, Serialize};

/// Display region for an endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub name: String,
    pub flag: String,
}

impl Region {
    pub fn new(name: impl Into<String>, flag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            flag: flag.into(),
        }
    }

    pub fn unknown() -> Self {
        Self::new("Unknown", "\u{1F3F3}\u{FE0F}")
    }
}

/// Trait for resolving an endpoint's region
pub trait RegionLookup: Send + Sync {
    fn lookup(&self, digits: &str) -> Region;
}

/// Lookup that knows no regions
#[derive(Debug, Default, Clone, Copy)]
pub struct UnknownRegion;

impl RegionLookup for UnknownRegion {
    fn lookup(&self, _digits: &str) -> Region {
        Region::unknown()
    }
}

/// Flag emoji for an ISO 3166-1 alpha-2 code, or the white flag when the
/// code is not two ASCII letters
pub fn flag_for_code(iso2: &str) -> String {
    let code = iso2.trim();
    if code.len() != 2 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return Region::unknown().flag;
    }
    code.to_ascii_uppercase()
        .chars()
        .filter_map(|c| char::from_u32(0x1F1E6 + (c as u32 - 'A' as u32)))
        .collect()
}
