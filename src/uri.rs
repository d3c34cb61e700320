//! Connection URI parsing: `driver[+transport]://[user@][host[:port]][/path][?query]`.
//!
//! Only the transport selection and the parameters listed in [`UriParams`]
//! are consumed locally; every other query parameter is forwarded verbatim
//! to the server inside the reconstructed name URI.

use crate::error::{Error, Result};

/// How the byte pipe to the daemon is established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tls,
    Tcp,
    Unix,
    Ssh,
    External,
}

impl TransportKind {
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tls" => Ok(TransportKind::Tls),
            "tcp" => Ok(TransportKind::Tcp),
            "unix" => Ok(TransportKind::Unix),
            "ssh" => Ok(TransportKind::Ssh),
            "ext" => Ok(TransportKind::External),
            other => Err(Error::Configuration(format!(
                "transport '{other}' in URI not recognised (should be tls|unix|ssh|ext|tcp)"
            ))),
        }
    }
}

/// Where protocol tracing should go when requested via `debug=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugSink {
    Stdout,
    Stderr,
}

/// Query parameters consumed by the client rather than the server.
#[derive(Debug, Clone, Default)]
pub struct UriParams {
    /// Overrides the URI sent to the server.
    pub name: Option<String>,
    /// External command path (ssh/ext transports).
    pub command: Option<String>,
    /// UNIX socket path override.
    pub socket: Option<String>,
    /// Remote forwarder binary for ssh tunnels.
    pub netcat: Option<String>,
    /// Preferred authentication mechanism or family.
    pub auth: Option<String>,
    /// Directory holding cacert.pem / clientcert.pem / clientkey.pem.
    pub pkipath: Option<String>,
    /// Proceed despite TLS verification failure.
    pub no_verify: bool,
    /// Request non-interactive ssh options.
    pub no_tty: bool,
    /// Protocol trace destination.
    pub debug: Option<DebugSink>,
}

#[derive(Debug, Clone)]
pub struct RemoteUri {
    pub driver: String,
    pub transport: TransportKind,
    pub username: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: String,
    pub params: UriParams,
    /// Unrecognised query parameters, preserved for the server.
    pub passthrough: Vec<(String, String)>,
}

impl RemoteUri {
    pub fn parse(uri: &str) -> Result<Self> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| Error::Configuration(format!("malformed URI '{uri}'")))?;
        if scheme.is_empty() {
            return Err(Error::Configuration(format!("malformed URI '{uri}'")));
        }

        let (driver, transport_str) = match scheme.split_once('+') {
            Some((d, t)) => (d.to_string(), Some(t)),
            None => (scheme.to_string(), None),
        };

        let (rest, query) = match rest.split_once('?') {
            Some((r, q)) => (r, Some(q)),
            None => (rest, None),
        };

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], rest[idx..].to_string()),
            None => (rest, String::new()),
        };

        let (username, hostport) = match authority.rsplit_once('@') {
            Some((u, h)) => (Some(percent_decode(u)?), h),
            None => (None, authority),
        };

        let (host, port) = split_host_port(hostport)?;

        let mut params = UriParams::default();
        let mut passthrough = Vec::new();
        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = match pair.split_once('=') {
                    Some((k, v)) => (k.to_ascii_lowercase(), percent_decode(v)?),
                    None => (pair.to_ascii_lowercase(), String::new()),
                };
                match key.as_str() {
                    "name" => params.name = Some(value),
                    "command" => params.command = Some(value),
                    "socket" => params.socket = Some(value),
                    "netcat" => params.netcat = Some(value),
                    "auth" => params.auth = Some(value),
                    "pkipath" => params.pkipath = Some(value),
                    "no_verify" => params.no_verify = value.parse::<i32>().unwrap_or(0) != 0,
                    "no_tty" => params.no_tty = value.parse::<i32>().unwrap_or(0) != 0,
                    "debug" => {
                        params.debug = Some(if value.eq_ignore_ascii_case("stdout") {
                            DebugSink::Stdout
                        } else {
                            DebugSink::Stderr
                        })
                    }
                    _ => passthrough.push((key, value)),
                }
            }
        }

        let transport = match transport_str {
            Some(t) => TransportKind::from_str(t)?,
            None if host.is_some() => TransportKind::Tls,
            None => TransportKind::Unix,
        };

        Ok(RemoteUri {
            driver,
            transport,
            username,
            host,
            port,
            path,
            params,
            passthrough,
        })
    }

    /// Hostname the transports should dial; localhost when the URI names
    /// none.
    pub fn hostname(&self) -> &str {
        self.host.as_deref().unwrap_or("localhost")
    }

    /// The URI presented to the server: transport suffix stripped, consumed
    /// query parameters removed. `name=` wins outright; the reserved
    /// `remote` driver yields an empty name so the server probes its own
    /// default.
    pub fn remote_name(&self) -> String {
        if let Some(name) = &self.params.name {
            return name.clone();
        }
        if self.driver == "remote" {
            return String::new();
        }

        let mut out = format!("{}://", self.driver);
        if let Some(host) = &self.host {
            out.push_str(host);
            if let Some(port) = self.port {
                out.push_str(&format!(":{port}"));
            }
        }
        out.push_str(&self.path);
        if !self.passthrough.is_empty() {
            out.push('?');
            for (i, (k, v)) in self.passthrough.iter().enumerate() {
                if i > 0 {
                    out.push('&');
                }
                out.push_str(k);
                if !v.is_empty() {
                    out.push('=');
                    out.push_str(v);
                }
            }
        }
        out
    }
}

fn split_host_port(hostport: &str) -> Result<(Option<String>, Option<u16>)> {
    if hostport.is_empty() {
        return Ok((None, None));
    }
    match hostport.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().map_err(|_| {
                Error::Configuration(format!("invalid port in URI authority '{hostport}'"))
            })?;
            let host = if host.is_empty() {
                None
            } else {
                Some(host.to_string())
            };
            Ok((host, Some(port)))
        }
        None => Ok((Some(hostport.to_string()), None)),
    }
}

fn percent_decode(s: &str) -> Result<String> {
    if !s.contains('%') {
        return Ok(s.to_string());
    }
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| {
                    Error::Configuration(format!("invalid percent escape in '{s}'"))
                })?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| Error::Configuration(format!("invalid escape in '{s}'")))
}
