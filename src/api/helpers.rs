use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ListResponse<T: Serialize> {
    pub items: Vec<T>,
    pub total: i64,
}

/// `page`/`limit` query params → `(limit, offset)` with sane bounds.
pub fn page_to_offset(page: Option<i64>, limit: Option<i64>, max_limit: i64) -> (i64, i64) {
    let limit = limit.unwrap_or(50).clamp(1, max_limit);
    let page = page.unwrap_or(1).max(1);
    (limit, (page - 1) * limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paging_defaults() {
        assert_eq!(page_to_offset(None, None, 200), (50, 0));
        assert_eq!(page_to_offset(Some(3), Some(20), 200), (20, 40));
        assert_eq!(page_to_offset(Some(0), Some(1000), 200), (200, 0));
    }
}
