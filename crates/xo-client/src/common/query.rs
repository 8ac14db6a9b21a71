//! Query utilities for the XenOrchestra REST API
//!
//! Collections accept a `fields` list and a `filter` written in XO's
//! complex-matcher syntax, where space-separated terms are AND-ed.

use crate::models::VmQuery;

/// Quote a value for the complex-matcher syntax
fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Build the complex-matcher filter for a VM query
pub fn vm_filter(query: &VmQuery) -> String {
    let mut terms = Vec::new();
    if let Some(name) = &query.name {
        terms.push(format!("name_label:{}", quote(name)));
    }
    if let Some(pool) = &query.pool {
        terms.push(format!("$pool:{}", quote(pool)));
    }
    if let Some(tag) = &query.tag {
        terms.push(format!("tags:{}", quote(tag)));
    }
    terms.join(" ")
}

/// Build a collection path with `fields` and an optional filter
pub fn collection_path(collection: &str, fields: &str, filter: &str) -> String {
    let mut path = format!("/{}?fields={}", collection, urlencoding::encode(fields));
    if !filter.is_empty() {
        path.push_str("&filter=");
        path.push_str(&urlencoding::encode(filter));
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_filter_terms_are_anded() {
        let query = VmQuery {
            name: Some("worker 1".to_string()),
            pool: Some("pool-1".to_string()),
            tag: None,
        };
        assert_eq!(vm_filter(&query), "name_label:\"worker 1\" $pool:\"pool-1\"");
    }

    #[test]
    fn test_quotes_are_escaped() {
        let query = VmQuery::by_name("we\"ird");
        assert_eq!(vm_filter(&query), "name_label:\"we\\\"ird\"");
    }

    #[test]
    fn test_collection_path_encoding() {
        let path = collection_path("vms", "id,name_label", "tags:\"a=b\"");
        assert_eq!(path, "/vms?fields=id%2Cname_label&filter=tags%3A%22a%3Db%22");
        assert_eq!(collection_path("pools", "id", ""), "/pools?fields=id");
    }
}
