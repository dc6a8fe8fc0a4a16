//! SSRF protection for outbound webhook URLs.
//!
//! Every destination is validated twice: when the endpoint is used to build
//! a job, and again immediately before the request is sent. The shared HTTP
//! client additionally resolves names through [`GuardedResolver`], so the
//! address the socket actually connects to is checked as well. A hostname
//! that re-resolves to an internal address between validation and connect
//! (DNS rebinding) is therefore refused at connect time.
//!
//! # Checks
//!
//! ```text
//!   parse ─▶ scheme ─▶ host ─▶ blocked names ─▶ resolve (bounded) ─▶ classify IPs
//!   invalid  https     missing  localhost,        dns_timeout,           loopback, private,
//!   _url     required  _host    metadata names    no_addresses           link-local, reserved,
//!                                                                        metadata
//! ```
//!
//! Resolution goes through an injectable [`Resolve`] implementation owned by
//! the validator. The DNS timeout is a property of the validator instance;
//! nothing process-global is configured.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    pin::Pin,
    sync::Arc,
    time::Duration,
};

use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Default bound on a single DNS lookup.
pub const DEFAULT_DNS_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of redirects a caller may follow manually.
pub const DEFAULT_MAX_REDIRECTS: u32 = 3;

const LOCALHOST_NAMES: &[&str] =
    &["localhost", "localhost.localdomain", "ip6-localhost", "ip6-loopback"];

const METADATA_NAMES: &[&str] = &[
    "metadata",
    "metadata.google.internal",
    "metadata.goog",
    "metadata.azure.com",
    "instance-data",
    "instance-data.ec2.internal",
    "kubernetes.default.svc",
];

const METADATA_V4: &[Ipv4Addr] = &[
    Ipv4Addr::new(169, 254, 169, 254),
    Ipv4Addr::new(169, 254, 170, 2),
    Ipv4Addr::new(100, 100, 100, 200),
];

const METADATA_V6: &[Ipv6Addr] = &[Ipv6Addr::new(0xfd00, 0x0ec2, 0, 0, 0, 0, 0, 0x0254)];

/// Stable machine-readable reason for a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationCode {
    /// URL could not be parsed.
    InvalidUrl,
    /// Plain http while http is not allowed.
    HttpsRequired,
    /// Scheme other than http(s).
    UnsupportedScheme,
    /// URL has no host.
    MissingHost,
    /// Host is on a static deny list.
    BlockedHostname,
    /// Lookup failed.
    DnsResolutionFailed,
    /// Lookup exceeded the validator's timeout.
    DnsTimeout,
    /// Lookup returned no addresses.
    NoAddresses,
    /// Address is loopback.
    LocalhostBlocked,
    /// Address is in an RFC1918, RFC6598 or RFC4193 range.
    PrivateIpBlocked,
    /// Address is link-local.
    LinkLocalBlocked,
    /// Address is unspecified, documentation, benchmark, multicast or
    /// otherwise reserved.
    ReservedIpBlocked,
    /// Address is a cloud metadata service.
    MetadataIpBlocked,
    /// Redirect target is on a different host.
    RedirectHostMismatch,
    /// Redirect chain is longer than allowed.
    TooManyRedirects,
}

impl ValidationCode {
    /// Snake-case wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUrl => "invalid_url",
            Self::HttpsRequired => "https_required",
            Self::UnsupportedScheme => "unsupported_scheme",
            Self::MissingHost => "missing_host",
            Self::BlockedHostname => "blocked_hostname",
            Self::DnsResolutionFailed => "dns_resolution_failed",
            Self::DnsTimeout => "dns_timeout",
            Self::NoAddresses => "no_addresses",
            Self::LocalhostBlocked => "localhost_blocked",
            Self::PrivateIpBlocked => "private_ip_blocked",
            Self::LinkLocalBlocked => "link_local_blocked",
            Self::ReservedIpBlocked => "reserved_ip_blocked",
            Self::MetadataIpBlocked => "metadata_ip_blocked",
            Self::RedirectHostMismatch => "redirect_host_mismatch",
            Self::TooManyRedirects => "too_many_redirects",
        }
    }
}

impl fmt::Display for ValidationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejection of an outbound URL.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason} ({code})")]
pub struct UrlValidationError {
    /// Human-readable explanation.
    pub reason: String,
    /// Stable rejection code.
    pub code: ValidationCode,
}

impl UrlValidationError {
    /// Creates a rejection.
    pub fn new(code: ValidationCode, reason: impl Into<String>) -> Self {
        Self { reason: reason.into(), code }
    }
}

/// A URL that passed every check, with the addresses it resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedUrl {
    /// Parsed URL.
    pub url: Url,
    /// Lower-cased host without a trailing dot.
    pub host: String,
    /// Every resolved address, deduplicated, in resolver order.
    pub resolved_ips: Vec<IpAddr>,
}

/// What a validator allows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlPolicy {
    /// Permit plain http. Development only.
    pub allow_http: bool,
    /// Permit loopback names and addresses. Development only.
    pub allow_localhost: bool,
    /// Extra hostnames to refuse. Matches the name and its subdomains.
    pub blocked_hosts: Vec<String>,
    /// Bound on each DNS lookup.
    pub dns_timeout: Duration,
    /// Redirects [`UrlValidator::validate_redirect`] will accept.
    pub max_redirects: u32,
}

impl Default for UrlPolicy {
    fn default() -> Self {
        Self {
            allow_http: false,
            allow_localhost: false,
            blocked_hosts: Vec::new(),
            dns_timeout: DEFAULT_DNS_TIMEOUT,
            max_redirects: DEFAULT_MAX_REDIRECTS,
        }
    }
}

impl UrlPolicy {
    /// Policy for local development against receivers on this machine.
    pub fn development() -> Self {
        Self { allow_http: true, allow_localhost: true, ..Self::default() }
    }
}

/// Future returned by [`Resolve::lookup`].
pub type Lookup<'a> = Pin<Box<dyn Future<Output = io::Result<Vec<IpAddr>>> + Send + 'a>>;

/// Name resolution used by the validator.
pub trait Resolve: Send + Sync + fmt::Debug {
    /// Resolves `host` to every address it maps to.
    fn lookup<'a>(&'a self, host: &'a str, port: u16) -> Lookup<'a>;
}

/// Resolver backed by the operating system via tokio.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl Resolve for SystemResolver {
    fn lookup<'a>(&'a self, host: &'a str, port: u16) -> Lookup<'a> {
        Box::pin(async move {
            let addrs = tokio::net::lookup_host((host, port)).await?;
            Ok(addrs.map(|addr| addr.ip()).collect())
        })
    }
}

/// Fixed host table, for tests and pinned deployments.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    hosts: HashMap<String, Vec<IpAddr>>,
    delay: Option<Duration>,
}

impl StaticResolver {
    /// Creates an empty table. Unknown names fail to resolve.
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `host` to `ips`.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>, ips: Vec<IpAddr>) -> Self {
        self.hosts.insert(host.into().to_ascii_lowercase(), ips);
        self
    }

    /// Delays every answer, to exercise lookup timeouts.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

impl Resolve for StaticResolver {
    fn lookup<'a>(&'a self, host: &'a str, _port: u16) -> Lookup<'a> {
        Box::pin(async move {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.hosts.get(&host.to_ascii_lowercase()).cloned().ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no such host: {host}"))
            })
        })
    }
}

/// Classification of a single IP address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpClass {
    /// Routable on the public internet.
    Public,
    /// Loopback.
    Loopback,
    /// Private or carrier-grade NAT range.
    Private,
    /// Link-local.
    LinkLocal,
    /// Unspecified, documentation, benchmarking, multicast or reserved.
    Reserved,
    /// Known cloud metadata endpoint.
    Metadata,
}

impl IpClass {
    fn rejection_code(self) -> Option<ValidationCode> {
        match self {
            Self::Public => None,
            Self::Loopback => Some(ValidationCode::LocalhostBlocked),
            Self::Private => Some(ValidationCode::PrivateIpBlocked),
            Self::LinkLocal => Some(ValidationCode::LinkLocalBlocked),
            Self::Reserved => Some(ValidationCode::ReservedIpBlocked),
            Self::Metadata => Some(ValidationCode::MetadataIpBlocked),
        }
    }
}

/// Classifies an address. IPv6 forms that embed an IPv4 address
/// (IPv4-mapped, NAT64, 6to4) are classified by the embedded address.
pub fn classify_ip(ip: IpAddr) -> IpClass {
    match ip {
        IpAddr::V4(v4) => classify_v4(v4),
        IpAddr::V6(v6) => classify_v6(v6),
    }
}

fn classify_v4(ip: Ipv4Addr) -> IpClass {
    let [a, b, c, _] = ip.octets();

    if METADATA_V4.contains(&ip) {
        IpClass::Metadata
    } else if ip.is_loopback() {
        IpClass::Loopback
    } else if ip.is_link_local() {
        IpClass::LinkLocal
    } else if ip.is_private() || (a == 100 && (64..128).contains(&b)) {
        IpClass::Private
    } else if a == 0
        || a >= 224
        || (a == 192 && b == 0 && (c == 0 || c == 2))
        || (a == 198 && (b == 18 || b == 19))
        || (a == 198 && b == 51 && c == 100)
        || (a == 203 && b == 0 && c == 113)
    {
        IpClass::Reserved
    } else {
        IpClass::Public
    }
}

fn classify_v6(ip: Ipv6Addr) -> IpClass {
    if let Some(v4) = embedded_v4(ip) {
        return classify_v4(v4);
    }

    let segments = ip.segments();
    if METADATA_V6.contains(&ip) {
        IpClass::Metadata
    } else if ip.is_loopback() {
        IpClass::Loopback
    } else if ip.is_unspecified()
        || ip.is_multicast()
        || (segments[0] == 0x2001 && segments[1] == 0x0db8)
    {
        IpClass::Reserved
    } else if segments[0] & 0xffc0 == 0xfe80 {
        IpClass::LinkLocal
    } else if segments[0] & 0xfe00 == 0xfc00 || segments[0] & 0xffc0 == 0xfec0 {
        IpClass::Private
    } else {
        IpClass::Public
    }
}

fn embedded_v4(ip: Ipv6Addr) -> Option<Ipv4Addr> {
    if let Some(mapped) = ip.to_ipv4_mapped() {
        return Some(mapped);
    }
    let s = ip.segments();
    let from_pair = |hi: u16, lo: u16| {
        let [a, b] = hi.to_be_bytes();
        let [c, d] = lo.to_be_bytes();
        Ipv4Addr::new(a, b, c, d)
    };
    // NAT64 well-known prefix 64:ff9b::/96.
    if s[0] == 0x0064 && s[1] == 0xff9b && s[2..6].iter().all(|&x| x == 0) {
        return Some(from_pair(s[6], s[7]));
    }
    // 6to4 2002::/16 carries the IPv4 address in the next 32 bits.
    if s[0] == 0x2002 {
        return Some(from_pair(s[1], s[2]));
    }
    None
}

/// Validates outbound URLs against a [`UrlPolicy`].
#[derive(Debug, Clone)]
pub struct UrlValidator {
    policy: UrlPolicy,
    resolver: Arc<dyn Resolve>,
}

impl UrlValidator {
    /// Creates a validator that resolves through the operating system.
    pub fn new(policy: UrlPolicy) -> Self {
        Self::with_resolver(policy, Arc::new(SystemResolver))
    }

    /// Creates a validator with an injected resolver.
    pub fn with_resolver(policy: UrlPolicy, resolver: Arc<dyn Resolve>) -> Self {
        Self { policy, resolver }
    }

    /// Policy in effect.
    pub fn policy(&self) -> &UrlPolicy {
        &self.policy
    }

    /// Runs every check against `raw`.
    ///
    /// # Errors
    ///
    /// Returns the first failed check as a [`UrlValidationError`].
    pub async fn validate(&self, raw: &str) -> Result<ValidatedUrl, UrlValidationError> {
        let url = Url::parse(raw).map_err(|e| {
            UrlValidationError::new(ValidationCode::InvalidUrl, format!("cannot parse URL: {e}"))
        })?;

        match url.scheme() {
            "https" => {},
            "http" if self.policy.allow_http => {},
            "http" => {
                return Err(UrlValidationError::new(
                    ValidationCode::HttpsRequired,
                    "webhook URLs must use https",
                ));
            },
            other => {
                return Err(UrlValidationError::new(
                    ValidationCode::UnsupportedScheme,
                    format!("scheme {other:?} is not supported"),
                ));
            },
        }

        let port = url.port_or_known_default().unwrap_or(443);
        let Some(raw_host) = url.host_str() else {
            return Err(UrlValidationError::new(ValidationCode::MissingHost, "URL has no host"));
        };
        let literal = raw_host.trim_start_matches('[').trim_end_matches(']');
        let (host, resolved_ips) = if let Ok(ip) = literal.parse::<IpAddr>() {
            (ip.to_string(), vec![ip])
        } else {
            let host = normalize_host(raw_host);
            if host.is_empty() {
                return Err(UrlValidationError::new(
                    ValidationCode::MissingHost,
                    "URL has an empty host",
                ));
            }
            self.check_hostname(&host)?;
            let ips = self.resolve(&host, port).await?;
            (host, ips)
        };

        for ip in &resolved_ips {
            self.check_ip(*ip)?;
        }

        debug!(host = %host, addresses = resolved_ips.len(), "outbound URL validated");
        Ok(ValidatedUrl { url, host, resolved_ips })
    }

    /// Decides whether a redirect may be followed.
    ///
    /// `redirect_count` is the 1-based position of this redirect in the
    /// chain. The target is resolved relative to `original`, must stay on the
    /// same host, and is then validated as a fresh URL.
    ///
    /// # Errors
    ///
    /// Returns `too_many_redirects`, `redirect_host_mismatch`, or any
    /// rejection from [`UrlValidator::validate`].
    pub async fn validate_redirect(
        &self,
        original: &str,
        location: &str,
        redirect_count: u32,
    ) -> Result<ValidatedUrl, UrlValidationError> {
        if redirect_count > self.policy.max_redirects {
            return Err(UrlValidationError::new(
                ValidationCode::TooManyRedirects,
                format!("redirect {redirect_count} exceeds limit of {}", self.policy.max_redirects),
            ));
        }

        let base = Url::parse(original).map_err(|e| {
            UrlValidationError::new(ValidationCode::InvalidUrl, format!("cannot parse URL: {e}"))
        })?;
        let target = base.join(location).map_err(|e| {
            UrlValidationError::new(
                ValidationCode::InvalidUrl,
                format!("cannot resolve redirect target: {e}"),
            )
        })?;

        let from = base.host_str().map(normalize_host);
        let to = target.host_str().map(normalize_host);
        if from.is_none() || from != to {
            warn!(from = ?from, to = ?to, "redirect to a different host refused");
            return Err(UrlValidationError::new(
                ValidationCode::RedirectHostMismatch,
                "redirects must stay on the original host",
            ));
        }

        self.validate(target.as_str()).await
    }

    /// Checks a single address against the policy.
    ///
    /// # Errors
    ///
    /// Returns the rejection matching the address class.
    pub fn check_ip(&self, ip: IpAddr) -> Result<(), UrlValidationError> {
        let class = classify_ip(ip);
        if class == IpClass::Loopback && self.policy.allow_localhost {
            return Ok(());
        }
        match class.rejection_code() {
            None => Ok(()),
            Some(code) => {
                Err(UrlValidationError::new(code, format!("address {ip} is not allowed")))
            },
        }
    }

    /// Resolves `host` within the validator's timeout and rejects the answer
    /// if any address is disallowed.
    ///
    /// # Errors
    ///
    /// Returns a DNS failure code or an address rejection.
    pub async fn resolve_checked(
        &self,
        host: &str,
        port: u16,
    ) -> Result<Vec<IpAddr>, UrlValidationError> {
        let host = normalize_host(host);
        self.check_hostname(&host)?;
        let ips = self.resolve(&host, port).await?;
        for ip in &ips {
            self.check_ip(*ip)?;
        }
        Ok(ips)
    }

    fn check_hostname(&self, host: &str) -> Result<(), UrlValidationError> {
        let is_localhost = LOCALHOST_NAMES.contains(&host) || host.ends_with(".localhost");
        if is_localhost {
            if self.policy.allow_localhost {
                return Ok(());
            }
            return Err(UrlValidationError::new(
                ValidationCode::BlockedHostname,
                format!("host {host} refers to this machine"),
            ));
        }

        let extra = self.policy.blocked_hosts.iter().map(String::as_str);
        let blocked = METADATA_NAMES.iter().copied().chain(extra);
        for name in blocked {
            let name = normalize_host(name);
            if host == name || host.ends_with(&format!(".{name}")) {
                return Err(UrlValidationError::new(
                    ValidationCode::BlockedHostname,
                    format!("host {host} is blocked"),
                ));
            }
        }
        Ok(())
    }

    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<IpAddr>, UrlValidationError> {
        let lookup = self.resolver.lookup(host, port);
        let ips = match tokio::time::timeout(self.policy.dns_timeout, lookup).await {
            Err(_elapsed) => {
                return Err(UrlValidationError::new(
                    ValidationCode::DnsTimeout,
                    format!(
                        "resolving {host} exceeded {}ms",
                        self.policy.dns_timeout.as_millis()
                    ),
                ));
            },
            Ok(Err(e)) => {
                return Err(UrlValidationError::new(
                    ValidationCode::DnsResolutionFailed,
                    format!("cannot resolve {host}: {e}"),
                ));
            },
            Ok(Ok(ips)) => ips,
        };

        let mut unique = Vec::with_capacity(ips.len());
        for ip in ips {
            if !unique.contains(&ip) {
                unique.push(ip);
            }
        }
        if unique.is_empty() {
            return Err(UrlValidationError::new(
                ValidationCode::NoAddresses,
                format!("{host} resolved to no addresses"),
            ));
        }
        Ok(unique)
    }
}

fn normalize_host(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// DNS resolver for the shared HTTP client that refuses disallowed
/// addresses at connect time.
#[derive(Debug, Clone)]
pub struct GuardedResolver {
    validator: Arc<UrlValidator>,
}

impl GuardedResolver {
    /// Wraps `validator` for use by `reqwest`.
    pub fn new(validator: Arc<UrlValidator>) -> Self {
        Self { validator }
    }
}

impl reqwest::dns::Resolve for GuardedResolver {
    fn resolve(&self, name: reqwest::dns::Name) -> reqwest::dns::Resolving {
        let validator = self.validator.clone();
        Box::pin(async move {
            let ips = validator.resolve_checked(name.as_str(), 0).await.map_err(|e| {
                warn!(host = name.as_str(), code = %e.code, "connect-time address check failed");
                Box::new(e) as Box<dyn std::error::Error + Send + Sync>
            })?;
            let addrs: reqwest::dns::Addrs =
                Box::new(ips.into_iter().map(|ip| SocketAddr::new(ip, 0)));
            Ok(addrs)
        })
    }
}
