/// Allow/offline path policy.
///
/// Patterns are deliberately not regular expressions: a pattern matches a
/// path when it is equal to it, or when it ends in `/*` or `*` and the path
/// starts with the prefix before the wildcard. Lists are compiled once at
/// load and matched with plain string comparisons.
#[derive(Debug, Clone)]
pub struct EndpointPolicy {
    allowed: Vec<PathPattern>,
    offline: Vec<PathPattern>,
}

#[derive(Debug, Clone)]
enum PathPattern {
    Exact(String),
    Prefix(String),
}

impl PathPattern {
    fn compile(pattern: &str) -> Self {
        if let Some(prefix) = pattern.strip_suffix("/*") {
            PathPattern::Prefix(prefix.to_string())
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            PathPattern::Prefix(prefix.to_string())
        } else {
            PathPattern::Exact(pattern.to_string())
        }
    }

    fn matches(&self, path: &str) -> bool {
        match self {
            PathPattern::Exact(exact) => path == exact,
            PathPattern::Prefix(prefix) => path.starts_with(prefix),
        }
    }
}

impl EndpointPolicy {
    pub fn new(allowed: &[String], offline: &[String]) -> Self {
        Self {
            allowed: allowed.iter().map(|p| PathPattern::compile(p)).collect(),
            offline: offline.iter().map(|p| PathPattern::compile(p)).collect(),
        }
    }

    /// A path may be proxied only when some allowed pattern matches it.
    pub fn is_allowed(&self, path: &str) -> bool {
        self.allowed.iter().any(|pattern| pattern.matches(path))
    }

    /// Offline paths are served from cache only; a miss never goes upstream.
    pub fn is_offline(&self, path: &str) -> bool {
        self.offline.iter().any(|pattern| pattern.matches(path))
    }
}
