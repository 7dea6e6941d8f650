//! Tunnel target descriptors
//!
//! Parses the dial address grammar
//! `user[:pass]@host[:port]/sub-address[?params]` into a structured,
//! immutable [`TunnelAddr`]. The literal token `(a)` is accepted in place of
//! `@` for callers whose own address syntax reserves `@`.

use std::collections::BTreeMap;
use std::fmt;

use tracing::warn;

use crate::error::DialError;

/// Standard SSH port, used when the descriptor leaves the port unset.
pub const DEFAULT_PORT: u16 = 22;

/// Network kind of a sub-address reached inside the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubNet {
    /// `direct-tcpip` to an `ip:port` endpoint on the remote side.
    Tcp,
    /// `direct-streamlocal` to a unix socket path on the remote side.
    Unix,
}

/// A sub-address: where to connect once inside the tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAddr {
    pub net: SubNet,
    pub addr: String,
}

impl SubAddr {
    /// Classify a raw sub-address string. Anything that parses as an IP
    /// address or `ip:port` is TCP; everything else is a unix socket path,
    /// canonicalized with a single leading `/`.
    fn classify(raw: &str) -> SubAddr {
        if raw.parse::<std::net::SocketAddr>().is_ok() || raw.parse::<std::net::IpAddr>().is_ok() {
            return SubAddr {
                net: SubNet::Tcp,
                addr: raw.to_string(),
            };
        }
        SubAddr {
            net: SubNet::Unix,
            addr: format!("/{}", raw.trim_start_matches('/')),
        }
    }

    pub fn tcp(addr: impl Into<String>) -> SubAddr {
        SubAddr {
            net: SubNet::Tcp,
            addr: addr.into(),
        }
    }

    pub fn unix(path: impl Into<String>) -> SubAddr {
        SubAddr {
            net: SubNet::Unix,
            addr: path.into(),
        }
    }

    /// Split a TCP sub-address into host and port for the channel open.
    pub(crate) fn host_port(&self) -> Result<(String, u16), DialError> {
        match self.addr.parse::<std::net::SocketAddr>() {
            Ok(sock) => Ok((sock.ip().to_string(), sock.port())),
            Err(_) => Err(DialError::ChannelError(format!(
                "sub-address {:?} has no port",
                self.addr
            ))),
        }
    }
}

/// Named dial parameters, a stable-ordered multimap parsed from the query
/// part of the address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(BTreeMap<String, Vec<String>>);

impl Params {
    pub fn parse(query: &str) -> Params {
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            map.entry(key.into_owned())
                .or_default()
                .push(value.into_owned());
        }
        Params(map)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Fetch a parameter expected to have exactly one value. Repeated values
    /// are ignored with a warning and fall back to the default, like any
    /// unparseable value.
    pub fn single(&self, name: &str) -> Option<&str> {
        match self.0.get(name).map(Vec::as_slice) {
            None | Some([]) => None,
            Some([value]) => Some(value),
            Some(_) => {
                warn!(param = name, "multiple values for param, ignoring");
                None
            }
        }
    }

    /// Multiplexing toggle (`mux`), default true.
    pub fn mux(&self) -> bool {
        match self.single("mux") {
            None => true,
            Some(value) => parse_bool(value).unwrap_or_else(|| {
                warn!(value, "invalid value for mux, ignoring");
                true
            }),
        }
    }

    pub fn encode(&self) -> String {
        let mut ser = url::form_urlencoded::Serializer::new(String::new());
        for (key, values) in &self.0 {
            for value in values {
                ser.append_pair(key, value);
            }
        }
        ser.finish()
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

/// Identity and connection info for one tunnel destination.
///
/// `password` distinguishes present-but-empty (`Some("")`, e.g. `user:@host`)
/// from absent (`None`, e.g. `user@host`); the two authenticate differently
/// and pool separately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelAddr {
    pub username: String,
    pub password: Option<String>,
    pub host: String,
    /// 0 means unset; [`TunnelAddr::ssh_addr`] substitutes [`DEFAULT_PORT`].
    pub port: u16,
    pub sub: Option<SubAddr>,
    pub params: Params,
}

impl Default for TunnelAddr {
    fn default() -> Self {
        TunnelAddr {
            username: String::new(),
            password: None,
            host: String::new(),
            port: 0,
            sub: None,
            params: Params::default(),
        }
    }
}

impl TunnelAddr {
    /// Parse the dial address grammar. Collects every problem found rather
    /// than stopping at the first.
    pub fn parse(addr: &str) -> Result<TunnelAddr, DialError> {
        let mut result = TunnelAddr::default();
        if addr.is_empty() {
            return Ok(result);
        }

        let addr = addr.replace("(a)", "@");
        let (userinfo, rest) = match addr.split_once('@') {
            Some((userinfo, rest)) => (Some(userinfo), rest),
            None => (None, addr.as_str()),
        };

        let mut errs = Vec::new();
        if let Some(userinfo) = userinfo {
            if rest.is_empty() {
                errs.push(DialError::HostRequired);
            }
            match parse_userinfo(userinfo) {
                Ok((username, password)) => {
                    result.username = username;
                    result.password = password;
                }
                Err(err) => errs.push(err),
            }
        }

        let (host_port, sub_with_params) = match rest.split_once('/') {
            Some((host_port, tail)) => (host_port, Some(tail)),
            None => (rest, None),
        };
        if !host_port.is_empty() {
            match parse_host_port(host_port) {
                Ok((host, port)) => {
                    result.host = host;
                    result.port = port;
                }
                Err((host, port, err)) => {
                    result.host = host;
                    result.port = port;
                    errs.push(err);
                }
            }
        }

        if let Some(sub_with_params) = sub_with_params {
            let (sub, query) = match sub_with_params.rfind('?') {
                Some(at) => (&sub_with_params[..at], &sub_with_params[at + 1..]),
                None => (sub_with_params, ""),
            };

            if sub
                .trim_matches(|c: char| c == '/' || c == '\\' || c.is_whitespace())
                .is_empty()
            {
                errs.push(DialError::AddrRequired);
            } else {
                result.sub = Some(SubAddr::classify(sub));
            }

            if !query.is_empty() {
                result.params = Params::parse(query);
            }
        }

        if errs.is_empty() {
            Ok(result)
        } else {
            Err(DialError::many(errs))
        }
    }

    /// Validate the minimum fields a dial needs, joining every missing one.
    pub fn check_dialable(&self) -> Result<(), DialError> {
        let mut errs = Vec::new();
        if self.username.is_empty() {
            errs.push(DialError::UserRequired);
        }
        if self.host.is_empty() {
            errs.push(DialError::HostRequired);
        }
        if self.sub.is_none() {
            errs.push(DialError::AddrRequired);
        }
        if errs.is_empty() {
            Ok(())
        } else {
            Err(DialError::many(errs))
        }
    }

    /// The `host:port` the SSH transport connects to.
    pub fn ssh_addr(&self) -> String {
        let port = if self.port == 0 { DEFAULT_PORT } else { self.port };
        format!("{}:{}", self.host, port)
    }
}

impl fmt::Display for TunnelAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let has_userinfo = !self.username.is_empty() || self.password.is_some();
        if !self.username.is_empty() {
            write!(f, "{}", self.username)?;
        }
        if let Some(password) = &self.password {
            write!(f, ":{}", password)?;
        }
        if has_userinfo {
            write!(f, "@")?;
        }
        write!(f, "{}", self.host)?;
        if self.port != 0 {
            write!(f, ":{}", self.port)?;
        }
        if let Some(sub) = &self.sub {
            if !sub.addr.starts_with('/') {
                write!(f, "/")?;
            }
            write!(f, "{}", sub.addr)?;
        }
        if !self.params.is_empty() {
            write!(f, "?{}", self.params.encode())?;
        }
        Ok(())
    }
}

fn parse_userinfo(userinfo: &str) -> Result<(String, Option<String>), DialError> {
    if userinfo.is_empty() {
        return Err(DialError::UserRequired);
    }
    match userinfo.split_once(':') {
        Some((username, password)) => Ok((username.to_string(), Some(password.to_string()))),
        None => Ok((userinfo.to_string(), None)),
    }
}

#[allow(clippy::type_complexity)]
fn parse_host_port(host_port: &str) -> Result<(String, u16), (String, u16, DialError)> {
    match host_port.rfind(':') {
        None => Ok((host_port.to_string(), 0)),
        Some(at) => {
            let (host, port_str) = (&host_port[..at], &host_port[at + 1..]);
            let port: u16 = match port_str.parse() {
                Ok(port) => port,
                Err(err) => {
                    return Err((
                        host_port.to_string(),
                        0,
                        DialError::InvalidPort {
                            port: port_str.to_string(),
                            reason: err.to_string(),
                        },
                    ))
                }
            };
            if host.is_empty() {
                return Err((String::new(), port, DialError::HostRequired));
            }
            Ok((host.to_string(), port))
        }
    }
}
