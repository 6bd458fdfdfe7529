// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use arc_swap::ArcSwap;
use slog::{o, Drain, Key, Level, Record, Serializer, KV};

/// Creates a module-local `$name!()` macro returning the scoped logger with
/// a `subsystem` key attached.
///
/// ```ignore
/// logging::logger_with_subsystem!(sl, "hypervisor");
/// info!(sl!(), "vm started");
/// ```
#[macro_export]
macro_rules! logger_with_subsystem {
    ($name: ident, $subsystem: expr) => {
        macro_rules! $name {
            () => {
                slog_scope::logger().new(slog::o!("subsystem" => $subsystem))
            };
        }
    };
}

const LOG_LEVELS: &[(&str, Level)] = &[
    ("trace", Level::Trace),
    ("debug", Level::Debug),
    ("info", Level::Info),
    ("warn", Level::Warning),
    ("error", Level::Error),
    ("critical", Level::Critical),
];

/// Map a textual level name to a slog level.
pub fn level_from_string(level: &str) -> Option<Level> {
    LOG_LEVELS
        .iter()
        .find(|(name, _)| *name == level)
        .map(|(_, l)| *l)
}

/// Build the process root logger: a JSON drain behind an async worker, with
/// a runtime-adjustable level filter. The returned guard must be kept alive
/// for the lifetime of the logger so the async worker flushes on shutdown.
pub fn create_logger<W>(
    name: &str,
    source: &str,
    level: Level,
    writer: W,
) -> (slog::Logger, slog_async::AsyncGuard)
where
    W: Write + Send + Sync + 'static,
{
    let json_drain = slog_json::Json::new(writer)
        .add_default_keys()
        .build()
        .fuse();

    let filter_drain = RuntimeLevelFilter::new(json_drain, level).fuse();

    let (async_drain, guard) = slog_async::Async::new(filter_drain.ignore_res())
        .thread_name("slog-async-logger".into())
        .build_with_guard();

    let logger = slog::Logger::root(
        async_drain.fuse(),
        o!("name" => name.to_string(),
           "source" => source.to_string(),
           "pid" => std::process::id()),
    );

    (logger, guard)
}

/// A drain whose minimum level can be changed while the process runs.
struct RuntimeLevelFilter<D> {
    drain: D,
    level: ArcSwap<Level>,
}

impl<D> RuntimeLevelFilter<D> {
    fn new(drain: D, level: Level) -> Self {
        RuntimeLevelFilter {
            drain,
            level: ArcSwap::from(Arc::new(level)),
        }
    }
}

impl<D> Drain for RuntimeLevelFilter<D>
where
    D: Drain,
{
    type Ok = Option<D::Ok>;
    type Err = Option<D::Err>;

    fn log(
        &self,
        record: &Record,
        values: &slog::OwnedKVList,
    ) -> std::result::Result<Self::Ok, Self::Err> {
        let current = **self.level.load();
        if record.level().is_at_least(current) {
            self.drain.log(record, values).map(Some).map_err(Some)
        } else {
            Ok(None)
        }
    }
}

/// Extra structured keys rendered into every record of a scoped logger,
/// used where call sites collect context incrementally.
pub struct HashMapKV(pub HashMap<String, String>);

impl KV for HashMapKV {
    fn serialize(&self, _record: &Record, serializer: &mut dyn Serializer) -> slog::Result {
        for (k, v) in &self.0 {
            serializer.emit_str(Key::from(k.to_string()), v)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_from_string() {
        assert_eq!(level_from_string("debug"), Some(Level::Debug));
        assert_eq!(level_from_string("warn"), Some(Level::Warning));
        assert_eq!(level_from_string("no-such-level"), None);
    }

    #[test]
    fn test_create_logger_writes_json() {
        use std::sync::Mutex;

        #[derive(Clone)]
        struct SharedBuf(Arc<Mutex<Vec<u8>>>);

        impl Write for SharedBuf {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let buf = SharedBuf(Arc::new(Mutex::new(Vec::new())));
        {
            let (logger, guard) = create_logger("test", "unit", Level::Info, buf.clone());
            slog::info!(logger, "hello"; "key" => "value");
            // debug is below the configured level and must be filtered
            slog::debug!(logger, "invisible");
            drop(logger);
            drop(guard);
        }

        let bytes = buf.0.lock().unwrap().clone();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("hello"));
        assert!(!text.contains("invisible"));

        let line = text.lines().next().unwrap();
        let v: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(v["key"], "value");
    }
}
