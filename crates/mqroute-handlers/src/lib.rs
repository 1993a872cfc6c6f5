//! # mqroute handlers
//! Built-in notification handlers, selected by `module` in `[handlers.<name>]`.
//!
//! | module    | target address                                   |
//! |-----------|--------------------------------------------------|
//! | `log`     | `["info"]`: one of debug, info, warn, error, crit |
//! | `file`    | `["/path/{topic}.log"]` or `{ path, append_newline, overwrite }` |
//! | `publish` | `["topic", qos, retain]` or `{ topic, qos, retain }` |

pub mod file;
pub mod log;
pub mod publish;

use std::sync::Arc;

use mqroute_core::traits::Handler;

pub use file::FileHandler;
pub use log::LogHandler;
pub use publish::PublishHandler;

/// Module names understood by [`builtin`].
pub const BUILTIN_MODULES: &[&str] = &["file", "log", "publish"];

/// Handler implementation for a module name.
pub fn builtin(module: &str) -> Option<Arc<dyn Handler>> {
    match module {
        "log" => Some(Arc::new(LogHandler)),
        "file" => Some(Arc::new(FileHandler)),
        "publish" => Some(Arc::new(PublishHandler)),
        _ => None,
    }
}

/// First element of a list address, or the address itself.
pub(crate) fn first_address(addrs: &serde_json::Value) -> Option<&serde_json::Value> {
    match addrs {
        serde_json::Value::Array(items) => items.first(),
        other => Some(other),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use mqroute_core::types::{Payload, WorkItem};
    use serde_json::{Map, Value};

    pub fn work_item(handler: &str, addrs: Value, message: &str, data: Value) -> WorkItem {
        WorkItem {
            handler: handler.into(),
            rule: "rule".into(),
            target: "t".into(),
            config: Map::new(),
            addrs,
            topic: "home/kitchen".into(),
            payload: Payload::from(message),
            data: data.as_object().cloned().unwrap_or_default(),
            title: "mqroute: home/kitchen".into(),
            image: String::new(),
            message: message.into(),
            priority: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_lookup() {
        for module in BUILTIN_MODULES {
            assert_eq!(builtin(module).unwrap().name(), *module);
        }
        assert!(builtin("pigeon").is_none());
    }
}
