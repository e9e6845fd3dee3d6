//! Label-selector evaluation and rendering
//!
//! Two entry points with deliberately different nil semantics:
//! [`matches_selector`] treats an absent selector as match-all (reconciler and
//! namespace filtering), while [`matches_required_selector`] treats an absent
//! selector as match-nothing (the admission path's per-kind selectors, where
//! an absent selector means the manager does not manage that kind).

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};

use crate::error::{Error, Result};

/// Returns true when the labels match the selector. An absent selector and an
/// empty selector both match everything.
pub fn matches_selector(labels: &BTreeMap<String, String>, selector: Option<&LabelSelector>) -> bool {
    match selector {
        None => true,
        Some(selector) => evaluate(labels, selector),
    }
}

/// Returns true when the labels match the selector, requiring the selector to
/// be present. An absent selector matches nothing; an empty one matches all.
pub fn matches_required_selector(
    labels: &BTreeMap<String, String>,
    selector: Option<&LabelSelector>,
) -> bool {
    match selector {
        None => false,
        Some(selector) => evaluate(labels, selector),
    }
}

fn evaluate(labels: &BTreeMap<String, String>, selector: &LabelSelector) -> bool {
    if let Some(match_labels) = &selector.match_labels {
        for (key, value) in match_labels {
            if labels.get(key) != Some(value) {
                return false;
            }
        }
    }

    if let Some(expressions) = &selector.match_expressions {
        for expression in expressions {
            if !evaluate_expression(labels, expression) {
                return false;
            }
        }
    }

    true
}

fn evaluate_expression(
    labels: &BTreeMap<String, String>,
    expression: &LabelSelectorRequirement,
) -> bool {
    let values = expression.values.as_deref().unwrap_or_default();
    match expression.operator.as_str() {
        "In" => labels
            .get(&expression.key)
            .is_some_and(|value| values.contains(value)),
        // NotIn also matches objects that lack the key entirely.
        "NotIn" => labels
            .get(&expression.key)
            .is_none_or(|value| !values.contains(value)),
        "Exists" => labels.contains_key(&expression.key),
        "DoesNotExist" => !labels.contains_key(&expression.key),
        // An unparseable selector matches nothing.
        _ => false,
    }
}

/// Renders a selector as an API list query string, e.g.
/// `app=web,tier in (frontend,backend),!legacy`.
///
/// An empty selector renders as an empty string, which callers must treat as
/// "no filtering" rather than passing it to the API server.
pub fn selector_to_query(selector: &LabelSelector) -> Result<String> {
    let mut clauses = Vec::new();

    if let Some(match_labels) = &selector.match_labels {
        for (key, value) in match_labels {
            clauses.push(format!("{key}={value}"));
        }
    }

    if let Some(expressions) = &selector.match_expressions {
        for expression in expressions {
            let values = expression.values.as_deref().unwrap_or_default();
            match expression.operator.as_str() {
                "In" | "NotIn" => {
                    if values.is_empty() {
                        return Err(Error::SelectorError(format!(
                            "operator {} on key {} requires values",
                            expression.operator, expression.key
                        )));
                    }
                    let operator = if expression.operator == "In" { "in" } else { "notin" };
                    clauses.push(format!(
                        "{} {} ({})",
                        expression.key,
                        operator,
                        values.join(",")
                    ));
                }
                "Exists" => clauses.push(expression.key.clone()),
                "DoesNotExist" => clauses.push(format!("!{}", expression.key)),
                other => {
                    return Err(Error::SelectorError(format!(
                        "unknown selector operator {other} on key {}",
                        expression.key
                    )));
                }
            }
        }
    }

    Ok(clauses.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn requirement(key: &str, operator: &str, values: &[&str]) -> LabelSelectorRequirement {
        LabelSelectorRequirement {
            key: key.to_string(),
            operator: operator.to_string(),
            values: if values.is_empty() {
                None
            } else {
                Some(values.iter().map(|v| v.to_string()).collect())
            },
        }
    }

    #[test]
    fn test_absent_selector_matches_all() {
        assert!(matches_selector(&labels(&[("app", "web")]), None));
        assert!(matches_selector(&BTreeMap::new(), None));
    }

    #[test]
    fn test_absent_selector_required_matches_nothing() {
        assert!(!matches_required_selector(&labels(&[("app", "web")]), None));
    }

    #[test]
    fn test_empty_selector_matches_all() {
        let selector = LabelSelector::default();
        assert!(matches_selector(&labels(&[("app", "web")]), Some(&selector)));
        assert!(matches_selector(&BTreeMap::new(), Some(&selector)));
        assert!(matches_required_selector(&BTreeMap::new(), Some(&selector)));
    }

    #[test]
    fn test_match_labels_intersection() {
        let selector = LabelSelector {
            match_labels: Some(labels(&[("app", "web"), ("tier", "frontend")])),
            ..Default::default()
        };
        assert!(matches_selector(
            &labels(&[("app", "web"), ("tier", "frontend"), ("extra", "x")]),
            Some(&selector)
        ));
        assert!(!matches_selector(&labels(&[("app", "web")]), Some(&selector)));
        assert!(!matches_selector(
            &labels(&[("app", "web"), ("tier", "backend")]),
            Some(&selector)
        ));
    }

    #[test]
    fn test_match_expression_in() {
        let selector = LabelSelector {
            match_expressions: Some(vec![requirement("tier", "In", &["frontend", "backend"])]),
            ..Default::default()
        };
        assert!(matches_selector(&labels(&[("tier", "backend")]), Some(&selector)));
        assert!(!matches_selector(&labels(&[("tier", "cache")]), Some(&selector)));
        assert!(!matches_selector(&BTreeMap::new(), Some(&selector)));
    }

    #[test]
    fn test_match_expression_not_in_matches_missing_key() {
        let selector = LabelSelector {
            match_expressions: Some(vec![requirement("tier", "NotIn", &["cache"])]),
            ..Default::default()
        };
        assert!(matches_selector(&labels(&[("tier", "frontend")]), Some(&selector)));
        assert!(matches_selector(&BTreeMap::new(), Some(&selector)));
        assert!(!matches_selector(&labels(&[("tier", "cache")]), Some(&selector)));
    }

    #[test]
    fn test_match_expression_exists() {
        let selector = LabelSelector {
            match_expressions: Some(vec![requirement("vpa-enabled", "Exists", &[])]),
            ..Default::default()
        };
        assert!(matches_selector(
            &labels(&[("vpa-enabled", "whatever")]),
            Some(&selector)
        ));
        assert!(!matches_selector(&BTreeMap::new(), Some(&selector)));
    }

    #[test]
    fn test_match_expression_does_not_exist() {
        let selector = LabelSelector {
            match_expressions: Some(vec![requirement("legacy", "DoesNotExist", &[])]),
            ..Default::default()
        };
        assert!(matches_selector(&labels(&[("app", "web")]), Some(&selector)));
        assert!(!matches_selector(&labels(&[("legacy", "true")]), Some(&selector)));
    }

    #[test]
    fn test_unknown_operator_matches_nothing() {
        let selector = LabelSelector {
            match_expressions: Some(vec![requirement("app", "GreaterThan", &["1"])]),
            ..Default::default()
        };
        assert!(!matches_selector(&labels(&[("app", "web")]), Some(&selector)));
    }

    #[test]
    fn test_query_from_match_labels() {
        let selector = LabelSelector {
            match_labels: Some(labels(&[("app", "web")])),
            ..Default::default()
        };
        assert_eq!(selector_to_query(&selector).unwrap(), "app=web");
    }

    #[test]
    fn test_query_from_expressions() {
        let selector = LabelSelector {
            match_expressions: Some(vec![
                requirement("tier", "In", &["frontend", "backend"]),
                requirement("region", "NotIn", &["dev"]),
                requirement("vpa-enabled", "Exists", &[]),
                requirement("legacy", "DoesNotExist", &[]),
            ]),
            ..Default::default()
        };
        assert_eq!(
            selector_to_query(&selector).unwrap(),
            "tier in (frontend,backend),region notin (dev),vpa-enabled,!legacy"
        );
    }

    #[test]
    fn test_query_empty_selector_is_empty() {
        assert_eq!(selector_to_query(&LabelSelector::default()).unwrap(), "");
    }

    #[test]
    fn test_query_rejects_in_without_values() {
        let selector = LabelSelector {
            match_expressions: Some(vec![requirement("tier", "In", &[])]),
            ..Default::default()
        };
        assert!(selector_to_query(&selector).is_err());
    }

    #[test]
    fn test_query_rejects_unknown_operator() {
        let selector = LabelSelector {
            match_expressions: Some(vec![requirement("tier", "GreaterThan", &["1"])]),
            ..Default::default()
        };
        assert!(selector_to_query(&selector).is_err());
    }
}
