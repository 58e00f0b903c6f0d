//! Label selectors.
//!
//! The structured map is the in-core representation; the `k=v,k=v` string is
//! only produced at the backend boundary (list queries, logs).

use std::collections::BTreeMap;
use std::fmt;

use kube::{Resource, ResourceExt};
use serde::{Deserialize, Serialize};

/// Canonical selector string: keys sorted, `key=value` joined by commas.
pub fn build_label_selector<I, K, V>(labels: I) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut pairs: Vec<(String, String)> =
        labels.into_iter().map(|(k, v)| (k.as_ref().to_string(), v.as_ref().to_string())).collect();
    pairs.sort();
    pairs.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
}

/// Well-formed `key=value` pairs of a selector string; malformed pairs are skipped.
fn pairs(selector: &str) -> impl Iterator<Item = (&str, &str)> {
    selector
        .split(',')
        .filter_map(|p| p.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
        .filter(|(k, _)| !k.is_empty())
}

/// Empty selector matches everything; otherwise every pair must be present
/// and equal in the object's labels.
pub fn matches_labels<K: Resource>(obj: &K, selector: &str) -> bool {
    let labels = obj.labels();
    pairs(selector).all(|(k, v)| labels.get(k).map(String::as_str) == Some(v))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelSelector(BTreeMap<String, String>);

impl LabelSelector {
    pub fn new(labels: BTreeMap<String, String>) -> Self {
        Self(labels)
    }

    /// Tolerant parse of the wire form.
    pub fn parse(selector: &str) -> Self {
        pairs(selector).map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|(k, v)| labels.get(k) == Some(v))
    }
}

impl FromIterator<(String, String)> for LabelSelector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&build_label_selector(&self.0))
    }
}
