//! URL helpers shared by the protocol adapter and the policy matcher.

use percent_encoding::percent_decode_str;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UrlError {
    #[error("invalid url: {0}")]
    Parse(#[from] url::ParseError),
    #[error("url {0} has no scheme")]
    MissingScheme(String),
    #[error("url {0} has no host")]
    MissingHost(String),
    #[error("invalid escape sequence in {0:?}")]
    InvalidEscape(String),
    #[error("escaped value is not valid utf-8")]
    InvalidUtf8,
}

/// Removes a trailing `:port` from a host, keeping bracketed IPv6 literals intact.
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) => &host[..end + 2],
            None => host,
        };
    }
    match host.rfind(':') {
        Some(idx) if host[idx + 1..].chars().all(|c| c.is_ascii_digit()) => &host[..idx],
        _ => host,
    }
}

fn default_port(scheme: &str) -> Option<&'static str> {
    match scheme {
        "https" | "wss" => Some("443"),
        "http" | "ws" => Some("80"),
        _ => None,
    }
}

/// Returns the first domain form of `host` for `scheme`: the bare host when the port is
/// absent or the scheme's default, `host:port` otherwise.
pub fn canonical_host(scheme: &str, host: &str) -> String {
    let bare = strip_port(host);
    let port = host[bare.len()..].strip_prefix(':');
    match (port, default_port(scheme)) {
        (Some(p), Some(default)) if p == default => bare.to_string(),
        (Some(""), _) | (None, _) => bare.to_string(),
        _ => host.to_string(),
    }
}

/// Parses an absolute URL, rejecting anything without both a scheme and a host.
pub fn parse_and_validate_url(raw: &str) -> Result<Url, UrlError> {
    let u = Url::parse(raw)?;
    if u.scheme().is_empty() {
        return Err(UrlError::MissingScheme(raw.to_string()));
    }
    match u.host_str() {
        Some(h) if !h.is_empty() => Ok(u),
        _ => Err(UrlError::MissingHost(raw.to_string())),
    }
}

/// Query-component unescape: `+` becomes a space and every `%` must start a valid
/// two-digit hex escape.
pub fn query_unescape(s: &str) -> Result<String, UrlError> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let valid = bytes.len() > i + 2
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit();
            if !valid {
                let end = (i + 3).min(bytes.len());
                return Err(UrlError::InvalidEscape(
                    String::from_utf8_lossy(&bytes[i..end]).into_owned(),
                ));
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    let plus_decoded = s.replace('+', " ");
    percent_decode_str(&plus_decoded)
        .decode_utf8()
        .map(|c| c.into_owned())
        .map_err(|_| UrlError::InvalidUtf8)
}

/// Canonical MIME header key: the first letter and every letter after a hyphen are
/// upper case, the rest lower case (`x-request-id` becomes `X-Request-Id`). Keys that
/// are not valid header tokens (a space, say) are returned unchanged.
pub fn canonical_header_key(key: &str) -> String {
    if key.is_empty() || !key.bytes().all(is_token_byte) {
        return key.to_string();
    }
    let mut upper = true;
    key.chars()
        .map(|c| {
            let out = if upper {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            };
            upper = c == '-';
            out
        })
        .collect()
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("example.com:8443"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("[::1]:443"), "[::1]");
        assert_eq!(strip_port("[::1]"), "[::1]");
    }

    #[test]
    fn test_canonical_host() {
        assert_eq!(canonical_host("https", "app.example.com:443"), "app.example.com");
        assert_eq!(canonical_host("http", "app.example.com:80"), "app.example.com");
        assert_eq!(canonical_host("https", "app.example.com"), "app.example.com");
        assert_eq!(
            canonical_host("https", "app.example.com:8443"),
            "app.example.com:8443"
        );
        assert_eq!(canonical_host("http", "app.example.com:443"), "app.example.com:443");
    }

    #[test]
    fn test_parse_and_validate_url() {
        assert!(parse_and_validate_url("https://app.example.com/x").is_ok());
        assert!(parse_and_validate_url("/just/a/path").is_err());
        assert!(parse_and_validate_url("").is_err());
        assert!(matches!(
            parse_and_validate_url("mailto:someone@example.com"),
            Err(UrlError::MissingHost(_))
        ));
    }

    #[test]
    fn test_query_unescape() {
        assert_eq!(query_unescape("a%20b+c").unwrap(), "a b c");
        assert_eq!(
            query_unescape("-----BEGIN%20CERTIFICATE-----%0AMIIB%2Bx").unwrap(),
            "-----BEGIN CERTIFICATE-----\nMIIB+x"
        );
        assert!(query_unescape("bad%zz").is_err());
        assert!(query_unescape("trailing%2").is_err());
        assert!(query_unescape("%ff").is_err());
        assert!(query_unescape("%€").is_err());
        assert!(matches!(
            query_unescape("-----BEGIN%aé"),
            Err(UrlError::InvalidEscape(_))
        ));
    }

    #[test]
    fn test_canonical_header_key() {
        assert_eq!(canonical_header_key("x-request-id"), "X-Request-Id");
        assert_eq!(canonical_header_key("COOKIE"), "Cookie");
        assert_eq!(canonical_header_key("x-forwarded-uri"), "X-Forwarded-Uri");
        assert_eq!(canonical_header_key("bad key"), "bad key");
        assert_eq!(canonical_header_key("x-é"), "x-é");
    }
}
