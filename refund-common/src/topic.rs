//! Naming of the topics a refund request can travel through.
//!
//! Every base topic has two companions: `<base>-retry`, where failed messages wait to be
//! delivered again, and `<base>-error`, where messages end up once they ran out of attempts.

pub const RETRY_SUFFIX: &str = "-retry";
pub const ERROR_SUFFIX: &str = "-error";

pub fn retry_topic(base: &str) -> String {
    format!("{base}{RETRY_SUFFIX}")
}

pub fn error_topic(base: &str) -> String {
    format!("{base}{ERROR_SUFFIX}")
}

/// Work out the topic an instance consumes from. Consuming the error queue takes precedence over
/// consuming retries.
pub fn resolve_topic(base: &str, retry_instance: bool, error_queue_instance: bool) -> String {
    if error_queue_instance {
        error_topic(base)
    } else if retry_instance {
        retry_topic(base)
    } else {
        base.to_owned()
    }
}
