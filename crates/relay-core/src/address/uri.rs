//! Minimal URI splitting for gateway addresses.
//!
//! Gateway addresses only ever take the shape `scheme://authority[/path]`,
//! where the authority is `host`, `host:port`, `[v6-literal]` or
//! `[v6-literal]:port`.  Query strings and fragments are not part of an
//! address and are rejected.
//!
//! Pipe addresses (`pipe://name`) reuse the host slot for the pipe name.

use crate::error::AddressError;

/// The pieces of a parsed `scheme://authority/path` string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriParts {
    /// Lower-cased scheme, e.g. `tcp`.
    pub scheme: String,
    /// Host without brackets, e.g. `127.0.0.1`, `::1`, `localhost`.
    pub host: String,
    /// Explicit port, if the authority carried one.
    pub port: Option<u16>,
    /// Path including the leading `/`; empty when the URI had no path.
    pub path: String,
}

/// Splits `uri` into scheme, host, port and path.
///
/// # Errors
///
/// - [`AddressError::MissingScheme`] when there is no `://` separator.
/// - [`AddressError::MissingHost`] when the authority is empty.
/// - [`AddressError::InvalidPort`] when the port is not a `u16`.
/// - [`AddressError::Malformed`] for query/fragment components or an
///   unterminated IPv6 literal.
pub fn split_uri(uri: &str) -> Result<UriParts, AddressError> {
    let (scheme, rest) = uri
        .split_once("://")
        .ok_or_else(|| AddressError::MissingScheme(uri.to_string()))?;

    if scheme.is_empty()
        || !scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
    {
        return Err(AddressError::MissingScheme(uri.to_string()));
    }

    if rest.contains('?') || rest.contains('#') {
        return Err(AddressError::Malformed {
            uri: uri.to_string(),
            reason: "query and fragment components are not allowed",
        });
    }

    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, ""),
    };

    if authority.is_empty() {
        return Err(AddressError::MissingHost(uri.to_string()));
    }

    let (host, port_str) = if let Some(stripped) = authority.strip_prefix('[') {
        // Bracketed IPv6 literal.
        let end = stripped.find(']').ok_or_else(|| AddressError::Malformed {
            uri: uri.to_string(),
            reason: "unterminated IPv6 literal",
        })?;
        let host = &stripped[..end];
        let tail = &stripped[end + 1..];
        let port = match tail.strip_prefix(':') {
            Some(p) => Some(p),
            None if tail.is_empty() => None,
            None => {
                return Err(AddressError::Malformed {
                    uri: uri.to_string(),
                    reason: "unexpected characters after IPv6 literal",
                })
            }
        };
        (host, port)
    } else {
        match authority.rsplit_once(':') {
            Some((h, p)) => (h, Some(p)),
            None => (authority, None),
        }
    };

    if host.is_empty() {
        return Err(AddressError::MissingHost(uri.to_string()));
    }

    let port = match port_str {
        Some(p) => Some(p.parse::<u16>().map_err(|_| AddressError::InvalidPort {
            uri: uri.to_string(),
            port: p.to_string(),
        })?),
        None => None,
    };

    Ok(UriParts {
        scheme: scheme.to_ascii_lowercase(),
        host: host.to_string(),
        port,
        path: path.to_string(),
    })
}

/// Formats a host for use inside an authority, bracketing IPv6 literals.
pub fn format_host(host: &str) -> String {
    if host.contains(':') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
