//! Named retry policies for consistent backoff behavior.
//!
//! Ad-hoc retry loops drift apart over time, so every retrying call site
//! picks one of the policies below (built on the `backon` crate). All
//! policies include jitter to prevent thundering herd.
//!
//! | Policy | Min delay | Max delay | Retries | Use case |
//! |--------|-----------|-----------|---------|----------|
//! | `bootstrap_policy` | 1s | 10s | 60 | internal stream creation while the cluster forms |
//! | `substrate_policy` | 100ms | 5s | 5 | jsapi calls from background loops |
//! | `metadata_policy` | 10ms | 500ms | 3 | metadata-store writes |

use std::time::Duration;

use backon::ExponentialBuilder;

/// Policy for internal-resource creation at startup.
///
/// A freshly started cluster can take a while to elect a meta leader, and
/// the substrate answers "no peers" until it does. Bootstrap keeps retrying
/// for roughly ten minutes before the caller escalates to `Fatal`.
pub fn bootstrap_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_secs(1))
        .with_max_delay(Duration::from_secs(10))
        .with_max_times(60)
        .with_jitter()
}

/// Policy for substrate calls made from background loops.
///
/// Loop work is redelivered by the substrate anyway, so a handful of
/// attempts is enough; persistent failure is surfaced on the next
/// redelivery.
pub fn substrate_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(5)
        .with_jitter()
}

/// Policy for metadata-store operations.
///
/// Store errors are usually persistent (constraint violations, schema
/// drift), so fail fast; only brief connection blips are worth riding out.
pub fn metadata_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(500))
        .with_max_times(3)
        .with_jitter()
}

#[cfg(test)]
mod tests {
    use super::*;
    use backon::Retryable;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_until_success() {
        let attempts = AtomicU32::new(0);
        let result = (|| async {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "busy"))
            } else {
                Ok(42)
            }
        })
        .retry(metadata_policy())
        .when(|_| true)
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn respects_condition() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), std::io::Error> = (|| async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"))
        })
        .retry(metadata_policy())
        .when(|e| e.kind() == std::io::ErrorKind::TimedOut)
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_after_max_attempts() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), std::io::Error> = (|| async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "busy"))
        })
        .retry(metadata_policy())
        .when(|_| true)
        .await;

        assert!(result.is_err());
        // Initial attempt + 3 retries.
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }
}
