//! Integration coverage for the retry scenario described in the component
//! design: an operation that fails twice then succeeds, observed with
//! exactly three invocations and jitter disabled so delays are exact.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use callcore::error::{Error, Result};
use callcore::retry::{RetryConfig, RetryDriver, RetryStrategy};

#[tokio::test]
async fn fails_twice_then_succeeds_with_expected_delays() {
    let driver = RetryDriver::new();
    let config = RetryConfig {
        max_attempts: 5,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(60),
        strategy: RetryStrategy::Exponential,
        backoff_factor: 2.0,
        jitter: false,
    };

    assert_eq!(config.delay_for(0), Duration::from_millis(100));
    assert_eq!(config.delay_for(1), Duration::from_millis(200));

    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = calls.clone();
    let result: Result<&'static str> = driver
        .execute("scenario-s5", &config, move || {
            let calls = calls_clone.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(Error::Transport("transient failure".into()))
                } else {
                    Ok("done")
                }
            }
        })
        .await;

    assert_eq!(result.unwrap(), "done");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}
