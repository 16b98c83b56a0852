//! # Cache Keys
//!
//! Derives deterministic cache keys from image URLs. Query parameters that
//! only carry signatures, tokens or cache busters are stripped so that the
//! same asset maps to the same key across re-signed URLs, and private
//! content is scoped to the current user.

use url::Url;

/// Query parameters whose value changes between requests for the same asset.
const VOLATILE_PARAMS: &[&str] = &[
    "token",
    "alt",
    "x-amz-signature",
    "x-amz-credential",
    "x-amz-date",
    "x-amz-expires",
    "x-amz-signedheaders",
    "x-amz-security-token",
    "expires",
    "signature",
    "key-pair-id",
    "policy",
    "t",
    "ts",
    "timestamp",
    "cache_buster",
    "_",
];

const AMZ_PREFIX: &str = "x-amz-";

fn is_volatile(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.starts_with(AMZ_PREFIX) || VOLATILE_PARAMS.contains(&lower.as_str())
}

/// Stateless cache key derivation.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyBuilder;

impl KeyBuilder {
    /// Strip volatile query parameters and sort the remaining ones by name.
    ///
    /// URLs without a query, and strings that do not parse as absolute URLs,
    /// are returned unchanged.
    pub fn normalize_url(url: &str) -> String {
        let Ok(mut parsed) = Url::parse(url) else {
            return url.to_string();
        };

        match parsed.query() {
            None => return url.to_string(),
            Some(q) if q.is_empty() => return url.to_string(),
            Some(_) => {}
        }

        let mut kept: Vec<(String, String)> = parsed
            .query_pairs()
            .filter(|(name, _)| !is_volatile(name))
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect();

        // Stable sort keeps repeated names in their original relative order.
        kept.sort_by(|a, b| a.0.cmp(&b.0));

        if kept.is_empty() {
            parsed.set_query(None);
        } else {
            parsed.query_pairs_mut().clear().extend_pairs(kept.iter());
        }

        parsed.to_string()
    }

    /// Key for content only visible to `user_id`.
    pub fn user_scoped_key(url: &str, user_id: &str) -> String {
        format!("u:{user_id}|{}", Self::normalize_url(url))
    }

    /// Resolve the cache key for a request.
    ///
    /// An explicit key always wins; private requests with a known user are
    /// scoped to that user; everything else keys on the normalized URL.
    pub fn build(
        url: &str,
        explicit_key: Option<&str>,
        user_id: Option<&str>,
        is_private: bool,
    ) -> String {
        if let Some(key) = explicit_key {
            return key.to_string();
        }
        match user_id {
            Some(user) if is_private && !user.is_empty() => Self::user_scoped_key(url, user),
            _ => Self::normalize_url(url),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_token_and_alt() {
        assert_eq!(
            KeyBuilder::normalize_url("https://x/y.jpg?alt=media&token=abc"),
            "https://x/y.jpg"
        );
    }

    #[test]
    fn test_sorts_remaining_params_regardless_of_order() {
        let a = KeyBuilder::normalize_url("https://cdn.example.com/img.png?z=1&a=2&m=3");
        let b = KeyBuilder::normalize_url("https://cdn.example.com/img.png?a=2&m=3&z=1");
        assert_eq!(a, b);
        assert_eq!(a, "https://cdn.example.com/img.png?a=2&m=3&z=1");
    }

    #[test]
    fn test_strips_amz_family_case_insensitively() {
        let url = "https://bucket.s3.amazonaws.com/p.jpg?X-Amz-Algorithm=AWS4&X-Amz-Signature=ff&w=200&X-Custom-Thing=1";
        assert_eq!(
            KeyBuilder::normalize_url(url),
            "https://bucket.s3.amazonaws.com/p.jpg?X-Custom-Thing=1&w=200"
        );
    }

    #[test]
    fn test_idempotent() {
        let urls = [
            "https://x/y.jpg?b=2&a=1&token=zzz",
            "https://x/y.jpg?q=hello%20world&_=123",
            "https://x/y.jpg",
            "https://x/y.jpg?ts=5",
            "not a url",
        ];
        for url in urls {
            let once = KeyBuilder::normalize_url(url);
            assert_eq!(KeyBuilder::normalize_url(&once), once, "input: {url}");
        }
    }

    #[test]
    fn test_unparseable_and_plain_urls_unchanged() {
        assert_eq!(KeyBuilder::normalize_url("::not-a-url::"), "::not-a-url::");
        assert_eq!(KeyBuilder::normalize_url("/relative/path.png?t=1"), "/relative/path.png?t=1");
        assert_eq!(
            KeyBuilder::normalize_url("https://x/no-query.webp"),
            "https://x/no-query.webp"
        );
    }

    #[test]
    fn test_keeps_fragment() {
        assert_eq!(
            KeyBuilder::normalize_url("https://x/a.png?t=1&v=2#frag"),
            "https://x/a.png?v=2#frag"
        );
    }

    #[test]
    fn test_build_priority() {
        let url = "https://x/avatar.jpg?token=secret&size=64";

        assert_eq!(
            KeyBuilder::build(url, Some("explicit"), Some("u1"), true),
            "explicit"
        );

        let scoped = KeyBuilder::build(url, None, Some("u1"), true);
        assert!(scoped.starts_with("u:u1|"));
        assert!(!scoped.contains("token"));
        assert_eq!(scoped, "u:u1|https://x/avatar.jpg?size=64");

        let anonymous = KeyBuilder::build(url, None, None, true);
        assert!(!anonymous.starts_with("u:"));

        let empty_user = KeyBuilder::build(url, None, Some(""), true);
        assert!(!empty_user.starts_with("u:"));

        let public = KeyBuilder::build(url, None, Some("u1"), false);
        assert_eq!(public, "https://x/avatar.jpg?size=64");
    }
}
