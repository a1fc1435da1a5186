//! Name-based virtual hosts.
//!
//! Each [`Host`] owns a responder [`Chain`]. For every request the pipeline
//! picks a host from the authority of an absolute-form target, then from the
//! `Host` header, and falls back to the first registered host.

use crate::http::Request;
use crate::responder::Chain;

/// A named virtual host.
#[derive(Clone)]
pub struct Host {
    name: String,
    port: Option<u16>,
    chain: Chain,
}

impl Host {
    /// Creates a host answering for `name` (`example.com` or `example.com:8080`).
    ///
    /// A name without a port matches requests for any port; `*` matches
    /// every name.
    pub fn new(name: impl AsRef<str>, chain: impl Into<Chain>) -> Self {
        let (name, port) = split_authority(name.as_ref());
        Self {
            name,
            port,
            chain: chain.into(),
        }
    }

    /// Lower-cased host name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Port this host is bound to, if it names one.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// The responders answering for this host.
    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    fn matches(&self, name: &str, port: Option<u16>) -> bool {
        let name_ok = self.name == "*" || self.name == name;
        let port_ok = match (self.port, port) {
            (Some(ours), Some(theirs)) => ours == theirs,
            (Some(_), None) => false,
            (None, _) => true,
        };
        name_ok && port_ok
    }
}

/// The set of virtual hosts served by one [`Server`](super::Server).
#[derive(Clone)]
pub struct Hosts {
    hosts: Vec<Host>,
}

impl Hosts {
    /// Creates a host set whose default host is `default`.
    pub fn new(default: Host) -> Self {
        Self {
            hosts: vec![default],
        }
    }

    /// Registers an additional host.
    #[must_use]
    pub fn with_host(mut self, host: Host) -> Self {
        self.hosts.push(host);
        self
    }

    /// Number of registered hosts.
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    /// Always `false`; a host set has at least its default host.
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Picks the host for `request`.
    ///
    /// An absolute-form authority wins over the `Host` header; when neither
    /// names a registered host the default host answers.
    pub fn select(&self, request: &Request) -> &Host {
        let authority = request.authority().or_else(|| request.header("host"));
        if let Some(authority) = authority {
            let (name, port) = split_authority(authority);
            // Port-specific hosts take precedence over port-agnostic ones.
            let exact = self
                .hosts
                .iter()
                .find(|h| h.port.is_some() && h.matches(&name, port));
            if let Some(host) = exact.or_else(|| self.hosts.iter().find(|h| h.matches(&name, port))) {
                return host;
            }
        }
        &self.hosts[0]
    }
}

impl From<Host> for Hosts {
    fn from(host: Host) -> Self {
        Hosts::new(host)
    }
}

impl From<Chain> for Hosts {
    fn from(chain: Chain) -> Self {
        Hosts::new(Host::new("*", chain))
    }
}

// Splits `name[:port]`, handling bracketed IPv6 literals, and lower-cases the name.
fn split_authority(authority: &str) -> (String, Option<u16>) {
    let authority = authority.trim();
    let authority = authority
        .rsplit_once('@')
        .map_or(authority, |(_userinfo, rest)| rest);

    let (name, port) = if let Some(rest) = authority.strip_prefix('[') {
        match rest.split_once(']') {
            Some((addr, tail)) => (addr, tail.strip_prefix(':')),
            None => (rest, None),
        }
    } else {
        match authority.rsplit_once(':') {
            Some((name, port)) if !name.contains(':') => (name, Some(port)),
            _ => (authority, None),
        }
    };

    (
        name.trim_end_matches('.').to_ascii_lowercase(),
        port.and_then(|p| p.parse().ok()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Method, Response, StatusCode};

    fn chain(tag: &'static str) -> Chain {
        Chain::from(move |_req: Request| async move { Response::new(StatusCode::Ok).body(tag) })
    }

    fn hosts() -> Hosts {
        Hosts::new(Host::new("default.test", chain("default")))
            .with_host(Host::new("Example.COM", chain("example")))
            .with_host(Host::new("example.com:8443", chain("example-tls")))
    }

    fn request(target: &str, host: Option<&str>) -> Request {
        let mut builder = Request::builder(Method::Get, target);
        if let Some(host) = host {
            builder = builder.header("Host", host);
        }
        builder.build()
    }

    #[test]
    fn selects_by_host_header() {
        let hosts = hosts();
        assert_eq!(hosts.select(&request("/", Some("example.com"))).name(), "example.com");
        assert_eq!(hosts.select(&request("/", Some("EXAMPLE.com:80"))).port(), None);
        assert_eq!(
            hosts.select(&request("/", Some("example.com:8443"))).port(),
            Some(8443)
        );
    }

    #[test]
    fn absolute_uri_wins_over_host_header() {
        let hosts = hosts();
        let req = request("http://example.com/x", Some("default.test"));
        assert_eq!(hosts.select(&req).name(), "example.com");
    }

    #[test]
    fn unknown_or_missing_host_uses_default() {
        let hosts = hosts();
        assert_eq!(hosts.select(&request("/", Some("other.test"))).name(), "default.test");
        assert_eq!(hosts.select(&request("/", None)).name(), "default.test");
    }

    #[test]
    fn authority_forms() {
        assert_eq!(split_authority("[::1]:8080"), ("::1".to_owned(), Some(8080)));
        assert_eq!(split_authority("user@Host.test."), ("host.test".to_owned(), None));
        assert_eq!(split_authority("::1"), ("::1".to_owned(), None));
    }
}
