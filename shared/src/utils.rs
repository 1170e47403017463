use chrono::Utc;
use rand::Rng;
use std::time::Duration;
use uuid::Uuid;

use crate::types::Constants;

/// Utility functions for common operations

/// Current wall-clock time in integer milliseconds since the epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Generate the opaque lock token a process records under its connection id.
pub fn generate_lock_token() -> String {
    Uuid::new_v4().to_string()
}

/// Uniformly random sync retry delay between 1 and 10 seconds.
pub fn retry_delay() -> Duration {
    let mut rng = rand::thread_rng();
    let millis = rng.gen_range(Constants::RETRY_MIN_DELAY_MS..=Constants::RETRY_MAX_DELAY_MS);
    Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_millis_is_recent() {
        let millis = now_millis();
        // Anything after 2020 and not absurdly far in the future.
        assert!(millis > 1_577_836_800_000);
        assert!(millis < 4_102_444_800_000);
    }

    #[test]
    fn test_generate_lock_token_unique() {
        let a = generate_lock_token();
        let b = generate_lock_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }

    #[test]
    fn test_retry_delay_bounds() {
        for _ in 0..100 {
            let delay = retry_delay();
            assert!(delay >= Duration::from_millis(Constants::RETRY_MIN_DELAY_MS));
            assert!(delay <= Duration::from_millis(Constants::RETRY_MAX_DELAY_MS));
        }
    }
}
