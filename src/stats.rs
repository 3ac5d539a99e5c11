use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;

static COUNTERS: Lazy<Mutex<HashMap<&'static str, u64>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Records `count` occurrences of the named event.
pub fn counter_event(name: &'static str, count: u64) {
    let mut counters = COUNTERS.lock().unwrap();
    *counters.entry(name).or_insert(0) += count;
}

pub fn counter(name: &'static str) -> u64 {
    COUNTERS.lock().unwrap().get(name).copied().unwrap_or(0)
}
