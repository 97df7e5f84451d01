// Shared helpers for timestamps and ticket ids

/// Current wall-clock time in epoch milliseconds
pub fn current_timestamp() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Generate a unique ticket id for queued lock requests and transactions
pub fn new_ticket_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_timestamp_monotonic_enough() {
        let a = current_timestamp();
        let b = current_timestamp();
        assert!(b >= a);
        assert!(a > 1_600_000_000_000);
    }

    #[test]
    fn test_ticket_ids_unique() {
        let a = new_ticket_id();
        let b = new_ticket_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }
}
