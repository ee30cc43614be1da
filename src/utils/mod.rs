pub mod token;
pub mod validation;

/// Current wall-clock time as epoch milliseconds, the unit every timestamp column uses.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
