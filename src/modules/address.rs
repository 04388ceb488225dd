//! Normalisation of module source addresses into fetchable URLs.

use camino::Utf8PathBuf;
use url::Url;

use super::ResolveError;

const FORCED_GIT_GETTER: &str = "git::";
const REPOSITORY_BOUNDARY: &str = ".git";
const REVISION_PARAM: &str = "ref";
const TARGET_SCHEME: &str = "https";

/// A source address split into its fetchable parts.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NormalizedSource {
    /// Clone URL: always `https`, no query, path cut at the repository
    /// boundary.
    pub address: String,
    /// First `ref` query value, if any.
    pub revision: Option<String>,
    /// Directory inside the repository named after the boundary marker.
    pub sub_path: Option<Utf8PathBuf>,
}

/// Normalises a module source address.
///
/// The scheme is forced to `https`, the first `ref` query parameter becomes
/// the pinned revision, all query parameters are dropped, and the path is
/// truncated at the first `.git`; whatever follows the marker is returned as
/// a sub-path with empty segments removed. A leading `git::` getter prefix
/// is accepted. Normalising an already normalised address returns it
/// unchanged.
///
/// # Errors
///
/// Returns [`ResolveError::InvalidSource`] when the address is not an
/// absolute URL with a host.
pub fn normalize_source(raw: &str) -> Result<NormalizedSource, ResolveError> {
    let trimmed = raw.trim();
    let without_getter = trimmed.strip_prefix(FORCED_GIT_GETTER).unwrap_or(trimmed);
    let invalid = |message: String| ResolveError::InvalidSource {
        address: raw.to_owned(),
        message,
    };

    let parsed = Url::parse(without_getter).map_err(|err| invalid(err.to_string()))?;
    let host = parsed
        .host_str()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| invalid(String::from("address has no host")))?;

    let revision = parsed
        .query_pairs()
        .find(|(key, _)| key == REVISION_PARAM)
        .map(|(_, value)| value.into_owned());

    let (repository_path, sub_path) = match parsed.path().split_once(REPOSITORY_BOUNDARY) {
        Some((before, after)) => (before, collapse_segments(after)),
        None => (parsed.path(), None),
    };

    let port = if parsed.scheme() != TARGET_SCHEME && has_explicit_port(without_getter) {
        parsed.port_or_known_default()
    } else {
        parsed.port()
    };
    let authority = port.map_or_else(|| host.to_owned(), |number| format!("{host}:{number}"));
    let rebuilt = Url::parse(&format!("{TARGET_SCHEME}://{authority}{repository_path}"))
        .map_err(|err| invalid(err.to_string()))?;

    Ok(NormalizedSource {
        address: rebuilt.into(),
        revision,
        sub_path,
    })
}

/// Returns `true` for sources that live inside the primary checkout.
#[must_use]
pub fn is_local_source(raw: &str) -> bool {
    let trimmed = raw.trim();
    trimmed.starts_with("./") || trimmed.starts_with("../")
}

/// Returns `true` when the authority of `address` spells out a port, which
/// the URL parser forgets when it equals the scheme's default.
fn has_explicit_port(address: &str) -> bool {
    let Some((_, rest)) = address.split_once("://") else {
        return false;
    };
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, after)| after);
    host_port.rsplit_once(':').is_some_and(|(host, port)| {
        !port.is_empty()
            && port.chars().all(|ch| ch.is_ascii_digit())
            && (!host.starts_with('[') || host.ends_with(']'))
    })
}

fn collapse_segments(rest: &str) -> Option<Utf8PathBuf> {
    let joined = rest
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/");
    (!joined.is_empty()).then(|| Utf8PathBuf::from(joined))
}
