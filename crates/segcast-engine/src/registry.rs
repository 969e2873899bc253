// crates/segcast-engine/src/registry.rs
//
// Process-wide map of named, long-lived transcode sessions. Calls sharing
// a key are serialised on the slot's mutex; distinct keys run fully in
// parallel. The registry exists for key-addressed callers; embedders that
// can hold a handle should own a `Transcoder` directly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use segcast_core::error::EngineError;
use segcast_core::options::{InputSpec, OutputSpec};
use segcast_core::stats::TranscodeResults;

use crate::transcode::Transcoder;

pub struct SessionSlot {
    inner: Mutex<Transcoder>,
}

static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<SessionSlot>>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<String, Arc<SessionSlot>>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Fetch the session for `key`, creating it on first use.
pub fn get_or_create(key: &str) -> Arc<SessionSlot> {
    let mut map = registry().lock().unwrap_or_else(|e| e.into_inner());
    Arc::clone(map.entry(key.to_string()).or_insert_with(|| {
        Arc::new(SessionSlot {
            inner: Mutex::new(Transcoder::new()),
        })
    }))
}

/// Run one transcode call under `key`, serialised against other calls on
/// the same key.
pub fn transcode_keyed(
    key: &str,
    input: &InputSpec,
    outputs: &[OutputSpec],
) -> Result<TranscodeResults, EngineError> {
    let slot = get_or_create(key);
    let mut session = slot.inner.lock().unwrap_or_else(|e| e.into_inner());
    session.transcode(input, outputs)
}

/// Mark the next input on `key` as discontinuous.
pub fn discontinuity(key: &str) {
    let slot = get_or_create(key);
    let mut session = slot.inner.lock().unwrap_or_else(|e| e.into_inner());
    session.discontinuity();
}

/// Tear down the session under `key` and drop it from the registry. An
/// in-flight call finishes first (the slot mutex serialises us behind it).
pub fn stop(key: &str) {
    let removed = {
        let mut map = registry().lock().unwrap_or_else(|e| e.into_inner());
        map.remove(key)
    };
    if let Some(slot) = removed {
        let mut session = slot.inner.lock().unwrap_or_else(|e| e.into_inner());
        session.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_shares_a_slot() {
        let a = get_or_create("registry-test-shared");
        let b = get_or_create("registry-test-shared");
        assert!(Arc::ptr_eq(&a, &b));
        stop("registry-test-shared");
    }

    #[test]
    fn distinct_keys_are_independent() {
        let a = get_or_create("registry-test-a");
        let b = get_or_create("registry-test-b");
        assert!(!Arc::ptr_eq(&a, &b));
        stop("registry-test-a");
        stop("registry-test-b");
    }

    #[test]
    fn stop_forgets_the_key() {
        let a = get_or_create("registry-test-stop");
        stop("registry-test-stop");
        let b = get_or_create("registry-test-stop");
        assert!(!Arc::ptr_eq(&a, &b));
        stop("registry-test-stop");
    }
}
