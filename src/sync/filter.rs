//! Exclusion predicates over test-root-relative paths.

/// Decides whether a relative path (always `/`-separated) is left out of sync.
pub trait PathFilter {
    fn excludes(&self, relative_path: &str) -> bool;
}

impl<F> PathFilter for F
where
    F: Fn(&str) -> bool,
{
    fn excludes(&self, relative_path: &str) -> bool {
        self(relative_path)
    }
}

/// Expected-output artifacts; they live on the host only.
pub const EXPECTED_SUFFIXES: [&str; 3] = ["-expected.txt", "-expected.png", "-expected.checksum"];

/// Tests under this subtree are served over HTTP, never from the device.
pub const HTTP_PREFIX: &str = "http/";

pub fn is_expectation_or_http(relative_path: &str) -> bool {
    relative_path.starts_with(HTTP_PREFIX)
        || EXPECTED_SUFFIXES
            .iter()
            .any(|suffix| relative_path.ends_with(suffix))
}

/// The filter applied to both sides of a sync: the fixed exclusions plus the
/// caller's own predicate.
pub struct SyncFilter<'a> {
    extra: &'a dyn PathFilter,
}

impl<'a> SyncFilter<'a> {
    pub fn new(extra: &'a dyn PathFilter) -> Self {
        Self { extra }
    }
}

impl PathFilter for SyncFilter<'_> {
    fn excludes(&self, relative_path: &str) -> bool {
        is_expectation_or_http(relative_path) || self.extra.excludes(relative_path)
    }
}

/// Excludes everything under any of the given directory prefixes.
#[derive(Debug, Clone, Default)]
pub struct PrefixFilter {
    prefixes: Vec<String>,
}

impl PrefixFilter {
    pub fn new(prefixes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let prefixes = prefixes
            .into_iter()
            .map(|p| {
                let p: String = p.into();
                p.trim_matches('/').to_string()
            })
            .filter(|p| !p.is_empty())
            .collect();
        Self { prefixes }
    }
}

impl PathFilter for PrefixFilter {
    fn excludes(&self, relative_path: &str) -> bool {
        self.prefixes.iter().any(|prefix| {
            relative_path
                .strip_prefix(prefix.as_str())
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
        })
    }
}
