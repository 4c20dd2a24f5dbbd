//! Link canonicalization and address validation.

use url::Url;

use crate::error::CoreError;

/// Normalizes a link so equivalent article URLs compare equal.
///
/// Drops query and fragment, strips trailing slashes (except for the root
/// path), forces `https`, removes a leading `www.` and lower-cases the
/// result. Unparseable input is returned trimmed and lower-cased.
pub fn canonical_url(link: &str) -> String {
    let trimmed = link.trim();
    let Ok(mut url) = Url::parse(trimmed) else {
        return trimmed.to_lowercase();
    };

    url.set_query(None);
    url.set_fragment(None);

    if !url.cannot_be_a_base() {
        let path = url.path().trim_end_matches('/').to_string();
        url.set_path(if path.is_empty() { "/" } else { &path });
    }

    if url.scheme() == "http" {
        let _ = url.set_scheme("https");
    }

    if let Some(host) = url.host_str().map(str::to_string) {
        if let Some(stripped) = host.strip_prefix("www.") {
            let _ = url.set_host(Some(stripped));
        }
    }

    url.as_str().to_lowercase()
}

/// Whether `link` parses as an absolute `http`/`https` URL.
pub fn is_valid_url(link: &str) -> bool {
    Url::parse(link.trim())
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false)
}

/// Host of `link` with any leading `www.` removed, lower-cased.
pub fn extract_domain(link: &str) -> Option<String> {
    let url = Url::parse(link.trim()).ok()?;
    let host = url.host_str()?.to_lowercase();
    Some(host.strip_prefix("www.").unwrap_or(&host).to_string())
}

/// Validates a relay address (`ws://` or `wss://` with a host).
pub fn relay_address(address: &str) -> Result<Url, CoreError> {
    let url = Url::parse(address.trim()).map_err(|_| CoreError::InvalidAddress {
        address: address.to_string(),
        reason: "not a url",
    })?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(CoreError::InvalidAddress {
            address: address.to_string(),
            reason: "unsupported scheme",
        });
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(CoreError::InvalidAddress {
            address: address.to_string(),
            reason: "missing host",
        });
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_tracking_noise() {
        assert_eq!(
            canonical_url("http://www.Example.com/News/Article/?utm_source=rss#top"),
            "https://example.com/news/article"
        );
    }

    #[test]
    fn keeps_root_slash() {
        assert_eq!(canonical_url("https://example.com/"), "https://example.com/");
        assert_eq!(canonical_url("https://example.com"), "https://example.com/");
        assert_eq!(canonical_url("https://example.com//"), "https://example.com/");
        assert_eq!(canonical_url("https://example.com/a//"), "https://example.com/a");
    }

    #[test]
    fn canonicalization_is_idempotent() {
        let inputs = [
            "http://www.example.com/a/b/?x=1",
            "https://EXAMPLE.com/A",
            "https://example.com:8443/path/",
            "https://example.com/a//",
            "https://example.com//",
            "not a url at all",
            "",
        ];
        for input in inputs {
            let once = canonical_url(input);
            assert_eq!(canonical_url(&once), once, "input: {input}");
        }
    }

    #[test]
    fn unparseable_links_fall_back_to_lowercase() {
        assert_eq!(canonical_url("  Relative/Path "), "relative/path");
    }

    #[test]
    fn validates_http_links() {
        assert!(is_valid_url("https://example.com"));
        assert!(is_valid_url("http://example.com/x"));
        assert!(!is_valid_url("ftp://example.com"));
        assert!(!is_valid_url("example.com"));
    }

    #[test]
    fn extracts_domain_without_www() {
        assert_eq!(
            extract_domain("https://www.Example.com/a").as_deref(),
            Some("example.com")
        );
        assert_eq!(extract_domain("garbage"), None);
    }

    #[test]
    fn relay_addresses_require_websocket_scheme() {
        assert!(relay_address("wss://relay.example.com").is_ok());
        assert!(relay_address("ws://127.0.0.1:7777").is_ok());
        assert!(matches!(
            relay_address("https://relay.example.com"),
            Err(CoreError::InvalidAddress { reason: "unsupported scheme", .. })
        ));
        assert!(matches!(
            relay_address("relay"),
            Err(CoreError::InvalidAddress { reason: "not a url", .. })
        ));
    }
}
