//! Public address discovery over plain HTTP, plus the DNS cache it uses.
//!
//! The request is written by hand and the response is read until the
//! server closes the stream. Name resolution runs on a spawned task whose
//! answer is collected on a later tick.

use crate::address::{self, Family};
use crate::socket::{ConnectProgress, TcpClient};
use log::{debug, trace};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::time::Instant;
use tokio::sync::oneshot;

/// Responses larger than this are not an address.
const MAX_RESPONSE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpUrl {
    pub host: String,
    pub port: u16,
    pub path: String,
}

/// Parses `http://host[:port][/path]`. An IPv6 host needs brackets to
/// carry a port; unbracketed it takes the default one.
pub fn parse_http_url(url: &str) -> Option<HttpUrl> {
    let url = url.trim();
    let scheme_end = url.find("://")?;
    if !url[..scheme_end].eq_ignore_ascii_case("http") {
        return None;
    }
    let rest = &url[scheme_end + 3..];
    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        let end = bracketed.find(']')?;
        let port = match &bracketed[end + 1..] {
            "" => 80,
            tail => tail.strip_prefix(':')?.parse().ok()?,
        };
        (&bracketed[..end], port)
    } else if authority.matches(':').count() > 1 {
        // A bare IPv6 literal cannot carry a port.
        authority.parse::<Ipv6Addr>().ok()?;
        (authority, 80)
    } else {
        match authority.split_once(':') {
            Some((host, port)) => (host, port.parse().ok()?),
            None => (authority, 80),
        }
    };
    if host.is_empty() {
        return None;
    }
    Some(HttpUrl {
        host: host.to_string(),
        port,
        path: path.to_string(),
    })
}

pub fn build_get_request(url: &HttpUrl) -> Vec<u8> {
    let host = if url.host.contains(':') {
        format!("[{}]", url.host)
    } else {
        url.host.clone()
    };
    format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: aura-netcore\r\nAccept: text/plain\r\nConnection: close\r\n\r\n",
        url.path, host
    )
    .into_bytes()
}

/// Pulls the address out of a complete `200` response.
pub fn parse_http_response(response: &[u8]) -> Option<IpAddr> {
    let text = std::str::from_utf8(response).ok()?;
    let (head, body) = text.split_once("\r\n\r\n")?;
    let status = head.lines().next()?;
    let mut parts = status.split_whitespace();
    if !parts.next()?.starts_with("HTTP/1.") || parts.next()? != "200" {
        return None;
    }
    address::parse_ip(body)
}

/// Outcome of asking the cache for a name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsStatus {
    Pending,
    Resolved(Vec<SocketAddr>),
    Failed,
}

/// Process-lifetime resolutions keyed by `(host, port)`.
#[derive(Debug, Default)]
pub struct DnsCache {
    entries: HashMap<(String, u16), Vec<SocketAddr>>,
    pending: HashMap<(String, u16), oneshot::Receiver<Vec<SocketAddr>>>,
}

impl DnsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Answers from the cache, or starts a lookup and reports `Pending`.
    pub fn resolve(&mut self, host: &str, port: u16) -> DnsStatus {
        if let Some(ip) = address::parse_ip(host) {
            return DnsStatus::Resolved(vec![SocketAddr::new(ip, port)]);
        }
        let key = (host.to_string(), port);
        if let Some(addrs) = self.entries.get(&key) {
            return status_of(addrs);
        }
        if let Some(receiver) = self.pending.get_mut(&key) {
            let addrs = match receiver.try_recv() {
                Ok(addrs) => addrs,
                Err(oneshot::error::TryRecvError::Empty) => return DnsStatus::Pending,
                Err(oneshot::error::TryRecvError::Closed) => Vec::new(),
            };
            self.pending.remove(&key);
            let status = status_of(&addrs);
            self.entries.insert(key, addrs);
            return status;
        }

        let (sender, receiver) = oneshot::channel();
        let target = key.clone();
        trace!("[DNS] resolving {}:{}", target.0, target.1);
        tokio::spawn(async move {
            let addrs = match tokio::net::lookup_host((target.0.as_str(), target.1)).await {
                Ok(addrs) => addrs.collect(),
                Err(e) => {
                    debug!("[DNS] {} failed: {}", target.0, e);
                    Vec::new()
                }
            };
            let _ = sender.send(addrs);
        });
        self.pending.insert(key, receiver);
        DnsStatus::Pending
    }

    pub fn flush(&mut self) {
        self.entries.clear();
        self.pending.clear();
    }
}

fn status_of(addrs: &[SocketAddr]) -> DnsStatus {
    if addrs.is_empty() {
        DnsStatus::Failed
    } else {
        DnsStatus::Resolved(addrs.to_vec())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupProgress {
    Pending,
    Found(IpAddr),
    Failed,
}

#[derive(Debug)]
enum LookupState {
    Resolving,
    Connecting(TcpClient),
    Reading(TcpClient, Vec<u8>),
    Done,
}

/// One HTTP fetch of our public address for one family.
#[derive(Debug)]
pub struct IpAddressLookup {
    family: Family,
    endpoint: String,
    url: HttpUrl,
    deadline: Instant,
    state: LookupState,
}

impl IpAddressLookup {
    pub fn new(family: Family, endpoint: &str, deadline: Instant) -> Option<Self> {
        Some(Self {
            family,
            endpoint: endpoint.to_string(),
            url: parse_http_url(endpoint)?,
            deadline,
            state: LookupState::Resolving,
        })
    }

    pub fn family(&self) -> Family {
        self.family
    }

    /// The configured value this lookup was started for.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn fail(&mut self) -> LookupProgress {
        self.state = LookupState::Done;
        LookupProgress::Failed
    }

    pub fn update(&mut self, dns: &mut DnsCache, now: Instant) -> LookupProgress {
        if matches!(self.state, LookupState::Done) {
            return LookupProgress::Failed;
        }
        if now >= self.deadline {
            debug!("[IP] {} timed out", self.endpoint);
            return self.fail();
        }

        match std::mem::replace(&mut self.state, LookupState::Done) {
            LookupState::Resolving => match dns.resolve(&self.url.host, self.url.port) {
                DnsStatus::Pending => {
                    self.state = LookupState::Resolving;
                    LookupProgress::Pending
                }
                DnsStatus::Failed => self.fail(),
                DnsStatus::Resolved(addrs) => {
                    let Some(target) = addrs.into_iter().find(|a| Family::of(a) == self.family) else {
                        return self.fail();
                    };
                    self.state = LookupState::Connecting(TcpClient::connect(target));
                    LookupProgress::Pending
                }
            },
            LookupState::Connecting(mut client) => match client.check_connect() {
                ConnectProgress::Pending => {
                    self.state = LookupState::Connecting(client);
                    LookupProgress::Pending
                }
                ConnectProgress::Failed(e) => {
                    debug!("[IP] cannot reach {}: {}", client.target(), e.message);
                    self.fail()
                }
                ConnectProgress::Connected => {
                    if let Some(socket) = client.socket_mut() {
                        socket.put_bytes(&build_get_request(&self.url));
                        socket.do_send();
                    }
                    self.state = LookupState::Reading(client, Vec::new());
                    LookupProgress::Pending
                }
            },
            LookupState::Reading(mut client, mut response) => {
                let Some(socket) = client.socket_mut() else {
                    return self.fail();
                };
                socket.do_send();
                socket.do_recv();
                response.extend_from_slice(&socket.take_recv_buffer());
                if socket.has_error() || response.len() > MAX_RESPONSE {
                    return self.fail();
                }
                if !socket.has_fin() {
                    self.state = LookupState::Reading(client, response);
                    return LookupProgress::Pending;
                }
                match parse_http_response(&response) {
                    Some(ip) if Family::of(&SocketAddr::new(ip, 0)) == self.family => {
                        LookupProgress::Found(ip)
                    }
                    _ => self.fail(),
                }
            }
            LookupState::Done => LookupProgress::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::tests::poll_until;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_urls() {
        assert_eq!(
            parse_http_url("http://api.ipify.org"),
            Some(HttpUrl {
                host: "api.ipify.org".to_string(),
                port: 80,
                path: "/".to_string(),
            })
        );
        let url = parse_http_url("HTTP://127.0.0.1:8080/ip?format=text").unwrap();
        assert_eq!(url.host, "127.0.0.1");
        assert_eq!(url.port, 8080);
        assert_eq!(url.path, "/ip?format=text");
        let url = parse_http_url("http://[::1]:81/").unwrap();
        assert_eq!(url.host, "::1");
        assert_eq!(url.port, 81);

        let url = parse_http_url("http://2001:db8::1/ip").unwrap();
        assert_eq!(url.host, "2001:db8::1");
        assert_eq!(url.port, 80);
        assert_eq!(url.path, "/ip");
        assert_eq!(parse_http_url("http://2001:db8::zz/"), None);

        assert_eq!(parse_http_url("https://api.ipify.org"), None);
        assert_eq!(parse_http_url("http://:80/"), None);
        assert_eq!(parse_http_url("api.ipify.org"), None);
    }

    #[test]
    fn test_request_bytes() {
        let url = parse_http_url("http://[2001:db8::1]/").unwrap();
        let request = String::from_utf8(build_get_request(&url)).unwrap();
        assert!(request.starts_with("GET / HTTP/1.1\r\nHost: [2001:db8::1]\r\n"));
        assert!(request.ends_with("Connection: close\r\n\r\n"));
    }

    #[test]
    fn test_parse_responses() {
        let ok = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\n203.0.113.9\n";
        assert_eq!(
            parse_http_response(ok),
            Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)))
        );
        assert_eq!(parse_http_response(b"HTTP/1.1 404 Not Found\r\n\r\n203.0.113.9"), None);
        assert_eq!(parse_http_response(b"HTTP/1.1 200 OK\r\n203.0.113.9"), None);
        assert_eq!(parse_http_response(b"HTTP/1.1 200 OK\r\n\r\n<html>"), None);
    }

    #[tokio::test]
    async fn test_literal_host_needs_no_lookup() {
        let mut dns = DnsCache::new();
        assert_eq!(
            dns.resolve("127.0.0.1", 80),
            DnsStatus::Resolved(vec!["127.0.0.1:80".parse().unwrap()])
        );
        assert!(dns.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_against_local_echo() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = vec![0u8; 512];
            let _ = stream.read(&mut request).await.unwrap();
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n198.51.100.23\r\n")
                .await
                .unwrap();
            stream.shutdown().await.unwrap();
        });

        let mut dns = DnsCache::new();
        let endpoint = format!("http://127.0.0.1:{}/", port);
        let mut lookup =
            IpAddressLookup::new(Family::V4, &endpoint, Instant::now() + Duration::from_secs(2))
                .unwrap();
        let progress = poll_until(|| match lookup.update(&mut dns, Instant::now()) {
            LookupProgress::Pending => None,
            other => Some(other),
        })
        .await;
        assert_eq!(
            progress,
            Some(LookupProgress::Found(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 23))))
        );
    }

    #[tokio::test]
    async fn test_lookup_for_wrong_family_fails() {
        let mut dns = DnsCache::new();
        let mut lookup = IpAddressLookup::new(
            Family::V6,
            "http://127.0.0.1:9/",
            Instant::now() + Duration::from_secs(2),
        )
        .unwrap();
        assert_eq!(lookup.update(&mut dns, Instant::now()), LookupProgress::Failed);
    }
}
