//! Named debug counters. Setting `DBG_CNT=registered_jump_thread:17` stops
//! the seventeenth-and-later registrations, which bisects a miscompile down
//! to a single threading request.

use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;

static LIMITS: Lazy<HashMap<String, u64>> =
    Lazy::new(|| parse_limits(&std::env::var("DBG_CNT").unwrap_or_default()));

static COUNTS: Lazy<Mutex<HashMap<&'static str, u64>>> = Lazy::new(|| Mutex::new(HashMap::new()));

pub(crate) fn parse_limits(spec: &str) -> HashMap<String, u64> {
    let mut limits = HashMap::new();
    for part in spec.split(',') {
        if let Some((name, limit)) = part.split_once(':') {
            if let Ok(limit) = limit.trim().parse() {
                limits.insert(name.trim().to_string(), limit);
            }
        }
    }
    limits
}

/// Bumps the named counter and reports whether it is still under its limit.
/// Counters without a configured limit always pass.
pub fn dbg_cnt(name: &'static str) -> bool {
    let mut counts = COUNTS.lock().unwrap();
    let count = counts.entry(name).or_insert(0);
    *count += 1;
    match LIMITS.get(name) {
        Some(limit) => *count <= *limit,
        None => true,
    }
}
