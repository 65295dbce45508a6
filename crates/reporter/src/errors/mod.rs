//! Error-reporting sub-reporter.
//!
//! Forwards captured errors to a pluggable [`ErrorSink`], merging the
//! statically configured tags into every capture. The default sink logs
//! through `tracing`; applications wire a crash-reporting client by
//! implementing the trait.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::error;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ErrorsConfig {
    /// Static tags attached to every captured error.
    pub tags: HashMap<String, String>,
}

/// Destination for captured errors.
pub trait ErrorSink: Send + Sync {
    fn capture(&self, error: &(dyn std::error::Error + 'static), tags: &HashMap<String, String>);
}

/// Default sink: logs captures at error level.
pub struct TracingSink;

impl ErrorSink for TracingSink {
    fn capture(&self, error: &(dyn std::error::Error + 'static), tags: &HashMap<String, String>) {
        error!(error = %error, tags = ?tags, "captured error");
    }
}

pub struct ErrorReporter {
    tags: HashMap<String, String>,
    sink: Box<dyn ErrorSink>,
}

impl ErrorReporter {
    pub fn new(config: ErrorsConfig) -> Self {
        Self::with_sink(config, Box::new(TracingSink))
    }

    pub fn with_sink(config: ErrorsConfig, sink: Box<dyn ErrorSink>) -> Self {
        Self { tags: config.tags, sink }
    }

    /// Forward an error to the sink. Per-capture tags override static
    /// ones on key collisions.
    pub fn capture(
        &self,
        error: &(dyn std::error::Error + 'static),
        tags: &HashMap<String, String>,
    ) {
        if self.tags.is_empty() {
            self.sink.capture(error, tags);
            return;
        }
        let mut merged = self.tags.clone();
        merged.extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.sink.capture(error, &merged);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        captures: Mutex<Vec<(String, HashMap<String, String>)>>,
    }

    impl ErrorSink for &'static RecordingSink {
        fn capture(
            &self,
            error: &(dyn std::error::Error + 'static),
            tags: &HashMap<String, String>,
        ) {
            self.captures.lock().unwrap().push((error.to_string(), tags.clone()));
        }
    }

    fn leak_sink() -> &'static RecordingSink {
        Box::leak(Box::new(RecordingSink::default()))
    }

    #[test]
    fn static_tags_merge_into_every_capture() {
        let sink = leak_sink();
        let config = ErrorsConfig {
            tags: HashMap::from([("service".to_string(), "api".to_string())]),
        };
        let reporter = ErrorReporter::with_sink(config, Box::new(sink));

        let error = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        reporter.capture(&error, &HashMap::from([("job".to_string(), "sync".to_string())]));

        let captures = sink.captures.lock().unwrap();
        let (message, tags) = &captures[0];
        assert_eq!(message, "disk on fire");
        assert_eq!(tags.get("service").map(String::as_str), Some("api"));
        assert_eq!(tags.get("job").map(String::as_str), Some("sync"));
    }

    #[test]
    fn per_capture_tags_win_on_collision() {
        let sink = leak_sink();
        let config = ErrorsConfig {
            tags: HashMap::from([("env".to_string(), "prod".to_string())]),
        };
        let reporter = ErrorReporter::with_sink(config, Box::new(sink));

        let error = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        reporter.capture(&error, &HashMap::from([("env".to_string(), "staging".to_string())]));

        let captures = sink.captures.lock().unwrap();
        assert_eq!(captures[0].1.get("env").map(String::as_str), Some("staging"));
    }
}
