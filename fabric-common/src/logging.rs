//! Structured logging on top of `slog`. The root logger is returned (not dropped) so
//! every long-lived component (connection actors, the bucket manager, the channel
//! broker) can hold a child logger via `log.new(o!(...))`.

use slog::Drain;

pub use slog::Logger;
pub use slog::{crit, debug, error, info, o, trace, warn};

/// Builds the root logger for a binary (server, client, or gateway example).
///
/// Terminal output, asynchronous draining so a slow terminal never blocks the
/// connection tasks writing to it -- the same reasoning behind keeping one slow
/// peer from stalling a broadcast (see `fabric_server::channel::ChannelBroker`).
pub fn init(component: &'static str) -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!("component" => component))
}

/// Truncates a secret (token, serial key) to a fixed-length tail for safe logging.
pub fn redact(secret: &str) -> String {
    const VISIBLE_TAIL: usize = 4;
    let len = secret.chars().count();
    secret
        .chars()
        .enumerate()
        .map(|(idx, chr)| if idx + VISIBLE_TAIL < len { '*' } else { chr })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_keeps_only_the_tail() {
        assert_eq!(redact("abcdefgh"), "****efgh");
        assert_eq!(redact("ab"), "ab");
    }
}
