/// Convert the two-element reply of Redis `TIME` (seconds, microseconds) into unix millis.
///
/// Every presence timestamp comes from the store clock so that events from
/// different proxies order against each other and against stored records.
pub fn millis_from_store_time(seconds: i64, micros: i64) -> i64 {
    seconds * 1_000 + micros / 1_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_time_conversion() {
        assert_eq!(millis_from_store_time(1_700_000_000, 123_456), 1_700_000_000_123);
        assert_eq!(millis_from_store_time(0, 999), 0);
    }
}
