//! Generation model.
//!
//! Two deliberately different reads of the same annotation:
//! [`get`] is tolerant and used for decisions (anything unusable reads as 0),
//! [`validate`] is strict and used to admit a candidate before it is applied.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::DynamicObject;
use kube::{Resource, ResourceExt};

use crate::envelope::ManifestWork;
use crate::{describe, Error, Result, GENERATION_ANNOTATION};

fn raw(meta: &ObjectMeta) -> Option<&str> {
    meta.annotations.as_ref().and_then(|a| a.get(GENERATION_ANNOTATION)).map(String::as_str)
}

/// Tolerant read; 0 when metadata or annotation is missing, empty or not a base-10 i64.
pub fn get(meta: Option<&ObjectMeta>) -> i64 {
    meta.and_then(raw).and_then(|v| v.parse::<i64>().ok()).unwrap_or(0)
}

/// Tolerant read on an optional object.
pub fn get_from<K: Resource>(obj: Option<&K>) -> i64 {
    get(obj.map(|o| o.meta()))
}

fn check(meta: &ObjectMeta, resource: impl FnOnce() -> String) -> Result<i64> {
    let value = match raw(meta) {
        None => return Err(Error::invalid_generation(resource(), format!("missing annotation {}", GENERATION_ANNOTATION))),
        Some(v) => v,
    };
    if value.is_empty() {
        return Err(Error::invalid_generation(resource(), format!("annotation {} is empty", GENERATION_ANNOTATION)));
    }
    let gen = match value.parse::<i64>() {
        Ok(g) => g,
        Err(_) => return Err(Error::invalid_generation(resource(), format!("value {:?} is not an integer", value))),
    };
    if gen <= 0 {
        return Err(Error::invalid_generation(resource(), format!("generation must be > 0, got {}", gen)));
    }
    Ok(gen)
}

/// Strict admission check; returns the generation on success.
pub fn validate(meta: &ObjectMeta) -> Result<i64> {
    check(meta, || meta.name.clone().unwrap_or_else(|| "<unnamed>".to_string()))
}

/// Strict admission check naming the object by kind and name on failure.
pub fn validate_object(obj: &DynamicObject) -> Result<i64> {
    check(&obj.metadata, || describe(obj))
}

/// Strict check of an envelope and every manifest it wraps. Returns the
/// envelope generation; the first failing inner manifest aborts with its index.
pub fn validate_envelope(work: &ManifestWork) -> Result<i64> {
    let work_name = work.name_any();
    let gen = check(&work.metadata, || format!("ManifestWork/{}", work_name))?;
    for (i, inner) in work.manifests()?.iter().enumerate() {
        check(&inner.metadata, || format!("ManifestWork/{} manifest[{}] {}", work_name, i, describe(inner)))?;
    }
    Ok(gen)
}

/// Candidate with the highest generation; ties resolved by ascending name.
/// `None` for an empty slice. The input is left untouched.
pub fn latest<K: Resource + Clone>(candidates: &[K]) -> Option<K> {
    let mut sorted: Vec<&K> = candidates.iter().collect();
    sorted.sort_by(|a, b| {
        get(Some(b.meta()))
            .cmp(&get(Some(a.meta())))
            .then_with(|| a.name_any().cmp(&b.name_any()))
    });
    sorted.first().map(|k| (*k).clone())
}
