//! Route table: maps a client-visible path prefix to an upstream base URL.
//!
//! Built once from [`ProxyConfig::provider_base_urls`](crate::config::ProxyConfig)
//! at startup and never mutated again, so lookups need no locking. The
//! `proxy-ep=` directive parsed out of an `Authorization` header (see
//! [`extract_proxy_ep`]) bypasses the table entirely for a single request.

use std::collections::HashMap;

use url::Url;

use crate::error::CodegateError;

const PROXY_EP_DIRECTIVE: &str = "proxy-ep=";

#[derive(Debug, Clone)]
pub struct Route {
    pub path_prefix: String,
    pub upstream: Url,
}

#[derive(Debug, Clone)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    /// Builds the table from `CODEGATE_PROVIDER_<NAME>_URL` entries,
    /// mounting each provider at `/<name>`.
    pub fn from_provider_base_urls(
        provider_base_urls: &HashMap<String, String>,
    ) -> Result<Self, CodegateError> {
        let mut routes = Vec::with_capacity(provider_base_urls.len());
        for (name, raw_url) in provider_base_urls {
            let upstream = Url::parse(raw_url).map_err(|e| {
                CodegateError::ConfigInvalid(format!("invalid upstream URL for {name:?}: {e}"))
            })?;
            routes.push(Route {
                path_prefix: format!("/{name}"),
                upstream,
            });
        }
        // Longer prefixes first so declaration order alone can't shadow a
        // more specific route that happens to be registered later.
        routes.sort_by(|a, b| b.path_prefix.len().cmp(&a.path_prefix.len()));
        Ok(Self::new(routes))
    }

    /// Resolves `path` against the table: an exact match wins outright,
    /// otherwise the longest registered prefix match is used and the
    /// remainder is joined onto the route's upstream URL.
    pub fn resolve(&self, path: &str) -> Option<Url> {
        if let Some(route) = self.routes.iter().find(|r| r.path_prefix == path) {
            return Some(route.upstream.clone());
        }

        let mut best: Option<&Route> = None;
        for route in &self.routes {
            if path.starts_with(&route.path_prefix) {
                if best.map(|b| route.path_prefix.len() > b.path_prefix.len()).unwrap_or(true) {
                    best = Some(route);
                }
            }
        }
        best.map(|route| join_remainder(&route.upstream, &path[route.path_prefix.len()..]))
    }
}

fn join_remainder(base: &Url, remainder: &str) -> Url {
    let mut joined = base.as_str().trim_end_matches('/').to_string();
    let remainder = remainder.trim_start_matches('/');
    if !remainder.is_empty() {
        joined.push('/');
        joined.push_str(remainder);
    }
    Url::parse(&joined).unwrap_or_else(|_| base.clone())
}

/// Pulls a `proxy-ep=<host[:port]>` directive out of an `Authorization`
/// header value. Directives are semicolon-separated; the first valid one
/// wins. A bare `host[:port]` defaults to the `https://` scheme.
pub fn extract_proxy_ep(authorization: &str) -> Option<Url> {
    for directive in authorization.split(';') {
        let directive = directive.trim();
        let Some(rest) = directive.strip_prefix(PROXY_EP_DIRECTIVE) else {
            continue;
        };
        let rest = rest.trim();
        if rest.is_empty() {
            continue;
        }
        let candidate = if rest.contains("://") {
            rest.to_string()
        } else {
            format!("https://{rest}")
        };
        if let Ok(url) = Url::parse(&candidate) {
            return Some(url);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RouteTable {
        RouteTable::new(vec![
            Route {
                path_prefix: "/openai".to_string(),
                upstream: Url::parse("https://api.openai.com/v1").unwrap(),
            },
            Route {
                path_prefix: "/openai/v2".to_string(),
                upstream: Url::parse("https://api.openai.com/v2").unwrap(),
            },
        ])
    }

    #[test]
    fn exact_match_wins_over_prefix() {
        let t = RouteTable::new(vec![Route {
            path_prefix: "/openai".to_string(),
            upstream: Url::parse("https://api.openai.com/root").unwrap(),
        }]);
        assert_eq!(
            t.resolve("/openai").unwrap().as_str(),
            "https://api.openai.com/root"
        );
    }

    #[test]
    fn longest_prefix_wins() {
        let t = table();
        let resolved = t.resolve("/openai/v2/chat/completions").unwrap();
        assert_eq!(resolved.as_str(), "https://api.openai.com/v2/chat/completions");
    }

    #[test]
    fn join_collapses_double_slash() {
        let t = table();
        let resolved = t.resolve("/openai/chat/completions").unwrap();
        assert_eq!(resolved.as_str(), "https://api.openai.com/v1/chat/completions");
    }

    #[test]
    fn no_route_returns_none() {
        let t = table();
        assert!(t.resolve("/unknown").is_none());
    }

    #[test]
    fn proxy_ep_directive_defaults_to_https() {
        let url = extract_proxy_ep("Bearer abc; proxy-ep=api.anthropic.com:443").unwrap();
        assert_eq!(url.as_str(), "https://api.anthropic.com:443/");
    }

    #[test]
    fn proxy_ep_directive_respects_explicit_scheme() {
        let url = extract_proxy_ep("proxy-ep=http://localhost:11434").unwrap();
        assert_eq!(url.as_str(), "http://localhost:11434/");
    }

    #[test]
    fn missing_directive_returns_none() {
        assert!(extract_proxy_ep("Bearer abc").is_none());
    }
}
