//! Job expansion: one query row per (zip, page) combination.

use crate::models::NewQuery;

/// Expand a keyword over the state's zips into queue rows.
///
/// Rows come out in `(zip, page)` lexicographic order; the claim protocol
/// observes this ordering when it picks the lowest rows first.
pub fn expand_queries(keyword: &str, zips: &[String], pages: i64) -> Vec<NewQuery> {
    let mut queries = Vec::with_capacity(zips.len() * pages.max(0) as usize);
    for zip in zips {
        for page in 1..=pages {
            queries.push(NewQuery {
                zip: zip.clone(),
                page,
                q: format!("{zip} {keyword}"),
            });
        }
    }
    queries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_zip_cross_pages() {
        let zips = vec!["85001".to_string(), "85002".to_string()];
        let queries = expand_queries("bars", &zips, 3);
        assert_eq!(queries.len(), 6);
    }

    #[test]
    fn rows_are_in_zip_page_order() {
        let zips = vec!["85001".to_string(), "85002".to_string()];
        let queries = expand_queries("bars", &zips, 2);
        let keys: Vec<(&str, i64)> = queries.iter().map(|q| (q.zip.as_str(), q.page)).collect();
        assert_eq!(
            keys,
            [("85001", 1), ("85001", 2), ("85002", 1), ("85002", 2)]
        );
    }

    #[test]
    fn query_text_is_zip_then_keyword() {
        let zips = vec!["85001".to_string()];
        let queries = expand_queries("coffee shops", &zips, 1);
        assert_eq!(queries[0].q, "85001 coffee shops");
    }

    #[test]
    fn expansion_is_deterministic() {
        let zips = vec!["85001".to_string(), "85002".to_string()];
        assert_eq!(expand_queries("bars", &zips, 3), expand_queries("bars", &zips, 3));
    }

    #[test]
    fn no_zips_means_no_queries() {
        assert!(expand_queries("bars", &[], 3).is_empty());
    }
}
