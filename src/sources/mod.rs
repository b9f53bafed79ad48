//! Passive data sources.
//!
//! The contract for any collaborator that feeds the engine: run as a
//! service, fetch whatever the provider offers for each configured root,
//! and publish candidates to `NewName` with `{name, root_domain, tag,
//! source}` filled in. Scope checks and dedup are not a source's problem;
//! the name service gates everything. The two built-in sources double as
//! reference implementations.

pub mod crtsh;
pub mod wayback;

use std::time::Duration;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_default()
}

/// Pull the host part out of an archived URL, tolerating schemeless rows.
pub(crate) fn host_of(url: &str) -> Option<String> {
    let rest = url.split("://").nth(1).unwrap_or(url);
    let host = rest.split(['/', '?', '#']).next()?;
    let host = host.split('@').last()?.split(':').next()?;
    let host = host.trim().trim_end_matches('.').to_lowercase();
    if host.is_empty() || !host.contains('.') {
        return None;
    }
    Some(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_extraction_handles_the_common_shapes() {
        assert_eq!(
            host_of("https://api.example.com/v1/users?id=1").as_deref(),
            Some("api.example.com")
        );
        assert_eq!(
            host_of("http://user@www.example.com:8080/x").as_deref(),
            Some("www.example.com")
        );
        assert_eq!(host_of("example.com/path").as_deref(), Some("example.com"));
        assert_eq!(host_of("not a url"), None);
    }
}
