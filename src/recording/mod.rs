pub mod cleanup;
pub mod sink;
pub mod storage;
pub mod store;

/// Relative cast path for a recording id: `YYYY-MM-DD/{id}.cast`, date
/// partitioned by session-open day (UTC).
pub fn cast_path(recording_id: &str) -> String {
    let date = chrono::Utc::now().format("%Y-%m-%d");
    format!("{date}/{recording_id}.cast")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cast_path_shape() {
        let path = cast_path("abc-123");
        let (date, file) = path.split_once('/').unwrap();
        assert_eq!(date.len(), 10);
        assert_eq!(file, "abc-123.cast");
    }
}
