use std::time::{Duration, Instant};

use indicatif::ProgressBar;
use tracing::debug;

use crate::error::{ProvisionError, Result};

/// Parse size string (e.g., "10G", "5120M", "1T") to bytes
pub(crate) fn parse_size(size_str: &str) -> Result<u64> {
    let size_str = size_str.trim().to_uppercase();

    if size_str.is_empty() {
        return Err(ProvisionError::config("empty size string"));
    }

    // Try to strip known unit suffixes
    let (number_str, multiplier) = if let Some(num) = size_str.strip_suffix("TB") {
        (num, 1024_u64.pow(4))
    } else if let Some(num) = size_str.strip_suffix("GB") {
        (num, 1024 * 1024 * 1024)
    } else if let Some(num) = size_str.strip_suffix("MB") {
        (num, 1024 * 1024)
    } else if let Some(num) = size_str.strip_suffix("KB") {
        (num, 1024)
    } else if let Some(num) = size_str.strip_suffix('T') {
        (num, 1024_u64.pow(4))
    } else if let Some(num) = size_str.strip_suffix('G') {
        (num, 1024 * 1024 * 1024)
    } else if let Some(num) = size_str.strip_suffix('M') {
        (num, 1024 * 1024)
    } else if let Some(num) = size_str.strip_suffix('K') {
        (num, 1024)
    } else if let Some(num) = size_str.strip_suffix('B') {
        (num, 1)
    } else {
        // No unit suffix, assume bytes
        (&*size_str, 1)
    };

    let number: u64 = number_str
        .trim()
        .parse()
        .map_err(|_| ProvisionError::config(format!("invalid number in size: {number_str}")))?;

    number
        .checked_mul(multiplier)
        .ok_or_else(|| ProvisionError::config(format!("size too large: {size_str}")))
}

/// Parse a memory string (like "2G", "1024M", "512") to megabytes
pub(crate) fn parse_memory_to_mb(memory_str: &str) -> Result<u32> {
    let memory_str = memory_str.trim();

    if memory_str.is_empty() {
        return Err(ProvisionError::config("memory string cannot be empty"));
    }

    // Plain numbers are megabytes
    let bytes = if memory_str.chars().all(|c| c.is_ascii_digit()) {
        parse_size(&format!("{memory_str}M"))?
    } else {
        parse_size(memory_str)?
    };

    let mb = bytes / (1024 * 1024);
    if mb == 0 {
        return Err(ProvisionError::config(format!(
            "memory size {memory_str} is less than 1M"
        )));
    }
    u32::try_from(mb)
        .map_err(|_| ProvisionError::config(format!("memory size {memory_str} is too large")))
}

/// Spinner on stderr for long waits; hidden when stderr is not a terminal.
pub(crate) fn spinner(message: impl Into<String>) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_message(message.into());
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

/// Wait for a condition to become ready with progress indication
///
/// Calls `test_fn` at most `max_attempts` times, sleeping `poll_interval`
/// between attempts. Errors from `test_fn` count as a failed attempt. Returns
/// the elapsed time on the first success, or [`ProvisionError::Timeout`]
/// naming `what` once the attempts are used up.
pub(crate) fn wait_for_readiness<F>(
    progress: &ProgressBar,
    what: &str,
    mut test_fn: F,
    max_attempts: u32,
    poll_interval: Duration,
) -> Result<Duration>
where
    F: FnMut() -> Result<bool>,
{
    let start_time = Instant::now();

    debug!(
        "Polling {} (up to {} attempts every {}s)",
        what,
        max_attempts,
        poll_interval.as_secs()
    );

    let mut attempts = 0u32;
    while attempts < max_attempts {
        if attempts > 0 {
            std::thread::sleep(poll_interval);
        }
        attempts += 1;

        progress.set_message(format!(
            "Waiting for {} (attempt {}/{}, elapsed: {}s)",
            what,
            attempts,
            max_attempts,
            start_time.elapsed().as_secs()
        ));

        match test_fn() {
            Ok(true) => {
                debug!("Readiness check successful after {} attempts", attempts);
                return Ok(start_time.elapsed());
            }
            Ok(false) => {
                debug!("Readiness check attempt {} returned false", attempts);
            }
            Err(e) => {
                debug!("Readiness check attempt {} failed: {}", attempts, e);
            }
        }
    }

    Err(ProvisionError::Timeout {
        what: what.to_owned(),
        attempts,
        elapsed_secs: start_time.elapsed().as_secs(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("20G").unwrap(), 20 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_size("1TB").unwrap(), 1024_u64.pow(4));
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert!(parse_size("").is_err());
        assert!(parse_size("lots").is_err());
        assert!(parse_size("99999999999T").is_err());
    }

    #[test]
    fn test_parse_memory_to_mb() {
        assert_eq!(parse_memory_to_mb("2G").unwrap(), 2048);
        assert_eq!(parse_memory_to_mb("2048M").unwrap(), 2048);
        assert_eq!(parse_memory_to_mb("1024").unwrap(), 1024);
        assert!(parse_memory_to_mb("512K").is_err());
        assert!(parse_memory_to_mb("").is_err());
    }

    #[test]
    fn test_wait_succeeds_on_later_attempt() {
        let mut calls = 0;
        let elapsed = wait_for_readiness(
            &ProgressBar::hidden(),
            "guest",
            || {
                calls += 1;
                if calls == 2 {
                    return Err(ProvisionError::command("ssh", "connection refused"));
                }
                Ok(calls == 3)
            },
            5,
            Duration::ZERO,
        );
        assert!(elapsed.is_ok());
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_wait_gives_up_after_max_attempts() {
        let mut calls = 0;
        let err = wait_for_readiness(
            &ProgressBar::hidden(),
            "guest",
            || {
                calls += 1;
                Ok(false)
            },
            4,
            Duration::ZERO,
        )
        .unwrap_err();
        assert_eq!(calls, 4);
        match err {
            ProvisionError::Timeout { what, attempts, .. } => {
                assert_eq!(what, "guest");
                assert_eq!(attempts, 4);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
