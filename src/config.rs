//! Environment/config surface (spec §6 "Environment").
//!
//! `TT_VISIBLE_DEVICES` restricts topology discovery to a fixed set of
//! PCIe device indices, the same shape as `CUDA_VISIBLE_DEVICES` in
//! other device-enumeration stacks. Logging configuration is explicitly
//! out of scope for the core (spec §1) and is not read here.

use std::collections::HashSet;
use std::env;

const VISIBLE_DEVICES_VAR: &str = "TT_VISIBLE_DEVICES";

/// An allow-list of PCIe device indices. An empty filter means "no
/// restriction"; this is the only state the core reads from the
/// environment.
#[derive(Debug, Clone, Default)]
pub struct DeviceFilter {
    allowed: Option<HashSet<u32>>,
}

impl DeviceFilter {
    /// No restriction: every enumerated device is visible.
    pub fn unrestricted() -> Self {
        DeviceFilter { allowed: None }
    }

    pub fn from_indices(indices: impl IntoIterator<Item = u32>) -> Self {
        DeviceFilter {
            allowed: Some(indices.into_iter().collect()),
        }
    }

    /// Reads `TT_VISIBLE_DEVICES` if `caller` didn't already specify a
    /// filter (spec §6: "when set and the caller's device filter is
    /// empty, discovery restricts to this list").
    pub fn resolve(caller: DeviceFilter) -> Self {
        if caller.allowed.is_some() {
            return caller;
        }
        match env::var(VISIBLE_DEVICES_VAR) {
            Ok(value) => Self::parse(&value),
            Err(_) => DeviceFilter::unrestricted(),
        }
    }

    fn parse(value: &str) -> Self {
        let indices: HashSet<u32> = value
            .split(',')
            .filter_map(|s| s.trim().parse::<u32>().ok())
            .collect();
        if indices.is_empty() {
            DeviceFilter::unrestricted()
        } else {
            DeviceFilter { allowed: Some(indices) }
        }
    }

    pub fn allows(&self, device_index: u32) -> bool {
        match &self.allowed {
            None => true,
            Some(set) => set.contains(&device_index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrestricted_allows_everything() {
        let f = DeviceFilter::unrestricted();
        assert!(f.allows(0));
        assert!(f.allows(42));
    }

    #[test]
    fn parses_comma_separated_indices() {
        let f = DeviceFilter::parse("0, 2,5");
        assert!(f.allows(0));
        assert!(!f.allows(1));
        assert!(f.allows(2));
        assert!(f.allows(5));
    }

    #[test]
    fn caller_supplied_filter_takes_precedence_over_the_environment() {
        let caller = DeviceFilter::from_indices([7]);
        let resolved = DeviceFilter::resolve(caller);
        assert!(resolved.allows(7));
        assert!(!resolved.allows(0));
    }

    #[test]
    fn garbage_env_value_falls_back_to_unrestricted() {
        let f = DeviceFilter::parse("not,a,number");
        assert!(f.allows(0));
    }
}
