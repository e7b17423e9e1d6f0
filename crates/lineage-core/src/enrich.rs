//! Enrichment shared by the builtin probes.

use nix::unistd::Pid;
use serde_json::Value;

use crate::{event::Event, procfs};

/// Value of the `error` field when the process of an event is already gone.
pub const PROCESS_LOOKUP_ERROR: &str = "process_lookup_error";

/// Parse a raw `key=value` record and attach the ancestry of its `pid` as
/// `proctree`.
///
/// Records without a numeric `pid` yield `None`.
pub fn process_event(raw: &[u8]) -> Option<Event> {
    let mut event = Event::from_key_values(&String::from_utf8_lossy(raw));
    let pid = event.get("pid").and_then(Value::as_i64)?;
    add_process_tree(&mut event, pid as i32);
    Some(event)
}

/// Set `proctree` to the ancestry of `pid`, or `error` if it cannot be read.
pub fn add_process_tree(event: &mut Event, pid: i32) {
    let proctree = match procfs::crawl_process_tree(Pid::from_raw(pid)) {
        Ok(tree) => serde_json::to_value(tree).unwrap_or_default(),
        Err(err) => {
            log::debug!("Process tree of {pid} unavailable: {err}");
            event.insert("error".to_string(), Value::from(PROCESS_LOOKUP_ERROR));
            Value::Array(Vec::new())
        }
    };
    event.insert("proctree".to_string(), proctree);
}
