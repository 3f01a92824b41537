//! URL splitting for gateway and proxy addresses

use thiserror::Error;
use url::Url;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UrlError {
    #[error("Unsupported URL scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("URL '{0}' has no scheme")]
    MissingScheme(String),

    #[error("URL '{0}' has no host")]
    MissingHost(String),

    #[error("Malformed URL '{0}': {1}")]
    Malformed(String, String),
}

/// A `scheme://host:port/path` split into its parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUrl {
    /// Lowercased scheme, `None` when the input had none
    pub scheme: Option<String>,
    pub host: String,
    pub port: u16,
    /// Path and query without the leading `/`; `None` when empty
    pub path: Option<String>,
}

/// Default port for a known scheme
pub fn scheme_default_port(scheme: &str) -> Option<u16> {
    match scheme.to_ascii_lowercase().as_str() {
        "https" => Some(443),
        "http" => Some(80),
        "socks" | "socks4" | "socks5" => Some(1080),
        _ => None,
    }
}

/// Split `url`; input without a scheme is accepted only when
/// `default_port` is given
pub fn parse_url(url: &str, default_port: Option<u16>) -> Result<ParsedUrl, UrlError> {
    let Some((scheme, _)) = url.split_once("://") else {
        let port = default_port.ok_or_else(|| UrlError::MissingScheme(url.to_string()))?;
        return parse_bare(url, port);
    };
    let default = scheme_default_port(scheme)
        .ok_or_else(|| UrlError::UnsupportedScheme(scheme.to_string()))?;

    let parsed = Url::parse(url).map_err(|e| match e {
        url::ParseError::EmptyHost => UrlError::MissingHost(url.to_string()),
        e => UrlError::Malformed(url.to_string(), e.to_string()),
    })?;
    let host = parsed
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| UrlError::MissingHost(url.to_string()))?;

    let mut path = parsed.path().strip_prefix('/').unwrap_or(parsed.path()).to_string();
    if let Some(query) = parsed.query() {
        path.push('?');
        path.push_str(query);
    }

    Ok(ParsedUrl {
        scheme: Some(parsed.scheme().to_string()),
        host: host.to_string(),
        port: parsed.port().unwrap_or(default),
        path: (!path.is_empty()).then_some(path),
    })
}

/// `host[:port][/path]` with no scheme
fn parse_bare(url: &str, default_port: u16) -> Result<ParsedUrl, UrlError> {
    let (authority, path) = url.split_once('/').unwrap_or((url, ""));

    // A port only follows the closing bracket of an IPv6 literal
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) if !port.contains(']') => {
            let port = port
                .parse()
                .map_err(|_| UrlError::Malformed(url.to_string(), "invalid port number".into()))?;
            (host, port)
        }
        _ => (authority, default_port),
    };
    if host.is_empty() {
        return Err(UrlError::MissingHost(url.to_string()));
    }

    Ok(ParsedUrl {
        scheme: None,
        host: host.to_string(),
        port,
        path: (!path.is_empty()).then(|| path.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_https_defaults() {
        let url = parse_url("https://vpn.example.com/corp/login", None).unwrap();
        assert_eq!(url.scheme.as_deref(), Some("https"));
        assert_eq!(url.host, "vpn.example.com");
        assert_eq!(url.port, 443);
        assert_eq!(url.path.as_deref(), Some("corp/login"));
    }

    #[test]
    fn test_explicit_port_and_empty_path() {
        let url = parse_url("HTTPS://gw:8443/", None).unwrap();
        assert_eq!(url.scheme.as_deref(), Some("https"));
        assert_eq!(url.port, 8443);
        assert!(url.path.is_none());
    }

    #[test]
    fn test_proxy_schemes() {
        assert_eq!(parse_url("socks5://proxy", None).unwrap().port, 1080);
        assert_eq!(parse_url("socks://proxy:9050", None).unwrap().port, 9050);
        assert_eq!(parse_url("http://proxy", None).unwrap().port, 80);
        assert_eq!(
            parse_url("ftp://proxy", None),
            Err(UrlError::UnsupportedScheme("ftp".into()))
        );
    }

    #[test]
    fn test_no_scheme() {
        let url = parse_url("proxy.local:3128", Some(80)).unwrap();
        assert!(url.scheme.is_none());
        assert_eq!(url.port, 3128);
        assert!(parse_url("proxy.local", None).is_err());
    }

    #[test]
    fn test_bad_port_rejected() {
        assert!(matches!(
            parse_url("https://host:abc/x", None),
            Err(UrlError::Malformed(..))
        ));
        assert!(matches!(
            parse_url("proxy:99999", Some(80)),
            Err(UrlError::Malformed(..))
        ));
    }

    #[test]
    fn test_missing_host() {
        assert!(matches!(
            parse_url("https:///login", None),
            Err(UrlError::MissingHost(_))
        ));
        assert!(matches!(parse_url(":8080", Some(80)), Err(UrlError::MissingHost(_))));
    }

    #[test]
    fn test_query_kept_with_path() {
        let url = parse_url("https://gw.example.com/+CSCOE+/logon.html?a=1&b=2", None).unwrap();
        assert_eq!(url.path.as_deref(), Some("+CSCOE+/logon.html?a=1&b=2"));
    }

    #[test]
    fn test_ipv6_literal() {
        let url = parse_url("https://[2001:db8::1]:4443/", None).unwrap();
        assert_eq!(url.host, "[2001:db8::1]");
        assert_eq!(url.port, 4443);

        let url = parse_url("https://[2001:db8::1]/", None).unwrap();
        assert_eq!(url.host, "[2001:db8::1]");
        assert_eq!(url.port, 443);

        let url = parse_url("[2001:db8::1]:3128", Some(80)).unwrap();
        assert_eq!(url.host, "[2001:db8::1]");
        assert_eq!(url.port, 3128);

        let url = parse_url("[2001:db8::1]", Some(80)).unwrap();
        assert_eq!(url.host, "[2001:db8::1]");
        assert_eq!(url.port, 80);
    }
}
