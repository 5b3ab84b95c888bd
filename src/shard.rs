//! Endpoint template resolution.
//!
//! Order matters: `{label}` substitution, then query appending, then the
//! `{num}` shard placeholder, whose value is derived from the already
//! resolved path.

use crate::config::RequestConfig;
use crate::error::Error;

pub const SHARD_PLACEHOLDER: &str = "{num}";
pub const SHARD_HOST_MARKER: &str = "origin.com/";
pub const SHARD_COUNT: u32 = 4;

/// Deterministic 1-based shard for a resolved path.
///
/// Hashes the part after the last [`SHARD_HOST_MARKER`] (the whole path when
/// the marker is absent) by summing the UTF-16 code units of its second half.
pub fn shard_index(path: &str) -> u32 {
    let tail = match path.rfind(SHARD_HOST_MARKER) {
        Some(index) => &path[index + SHARD_HOST_MARKER.len()..],
        None => path,
    };
    let units = tail.encode_utf16().collect::<Vec<_>>();
    let midpoint = units.len() / 2;
    let sum = units[midpoint..]
        .iter()
        .rev()
        .fold(0_u32, |sum, unit| sum.wrapping_add(u32::from(*unit)));
    sum % SHARD_COUNT + 1
}

pub(crate) fn substitute_parameters(template: &str, parameters: &[(String, String)]) -> String {
    parameters
        .iter()
        .fold(template.to_owned(), |resolved, (label, value)| {
            resolved.replace(&format!("{{{label}}}"), value)
        })
}

pub(crate) fn append_query_pairs(path: &str, pairs: &[(String, String)]) -> String {
    if pairs.is_empty() {
        return path.to_owned();
    }

    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (name, value) in pairs {
        serializer.append_pair(name, value);
    }
    let separator = if path.contains('?') { '&' } else { '?' };
    format!("{path}{separator}{}", serializer.finish())
}

/// Turns an endpoint template plus config into the URL that goes on the wire.
pub fn resolve_endpoint(template: &str, config: &RequestConfig) -> Result<String, Error> {
    if template.trim().is_empty() {
        return Err(Error::InvalidEndpoint);
    }

    let substituted = substitute_parameters(template, config.parameters());
    let mut resolved = append_query_pairs(&substituted, config.append_params().unwrap_or_default());
    if resolved.contains(SHARD_PLACEHOLDER) {
        let shard = shard_index(&resolved);
        resolved = resolved.replace(SHARD_PLACEHOLDER, &shard.to_string());
    }
    Ok(resolved)
}
