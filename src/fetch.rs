use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use mime::Mime;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::header;
use reqwest::redirect;
use reqwest::{Client, Response, StatusCode};
use tracing::debug;
use url::{Host, Url};

use crate::cache::OrigMeta;
use crate::FaviconError;

const MAX_REDIRECTS: usize = 8;
const FETCH_DEADLINE: Duration = Duration::from_secs(12);
pub const ICON_BODY_CAP: usize = 4 * 1024 * 1024;
pub const HTML_BODY_CAP: usize = 1024 * 1024;
const USER_AGENT: &str = concat!("favkit/", env!("CARGO_PKG_VERSION"));

/// Why an outbound request was refused before (or instead of) connecting.
/// Surfaces through reqwest's error source chain; `classify` digs it back
/// out.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PolicyViolation {
    #[error("scheme {0:?} is not allowed")]
    Scheme(String),
    #[error("address {0} is not publicly routable")]
    BlockedAddr(IpAddr),
    #[error("no publicly routable address for {0}")]
    NoUsableAddr(String),
    #[error("too many redirects")]
    TooManyRedirects,
    #[error("response body exceeds {0} bytes")]
    BodyTooLarge(usize),
}

/// SSRF-hardened HTTP client shared by all outbound calls: http/https only,
/// resolved peer addresses screened before connect, redirects re-checked per
/// hop and capped, one total deadline covering the whole redirect chain.
#[derive(Clone)]
pub struct Fetcher {
    client: Client,
}

pub struct FetchedBody {
    pub bytes: Bytes,
    pub content_type: Option<String>,
    pub etag: String,
    pub last_modified: String,
}

pub enum FetchedIcon {
    Fresh(FetchedBody),
    /// Origin validator matched; the caller should touch its cached entry.
    NotModified,
}

impl Fetcher {
    pub fn new() -> Result<Self, FaviconError> {
        let policy = redirect::Policy::custom(|attempt| {
            if attempt.previous().len() >= MAX_REDIRECTS {
                return attempt.error(PolicyViolation::TooManyRedirects);
            }
            match ensure_allowed(attempt.url()) {
                Ok(()) => attempt.follow(),
                Err(violation) => attempt.error(violation),
            }
        });

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(FETCH_DEADLINE)
            .redirect(policy)
            .dns_resolver(Arc::new(GuardedResolver))
            .build()
            .map_err(|e| FaviconError::UpstreamNetwork(e.to_string()))?;
        Ok(Self { client })
    }

    /// Fetch an HTML document for discovery. Returns the body and the final
    /// URL after redirects, which becomes the base for relative icon hrefs.
    pub async fn fetch_html(&self, url: &Url) -> Result<(Bytes, Url), FaviconError> {
        ensure_allowed(url).map_err(|v| FaviconError::UpstreamPolicy(v.to_string()))?;
        metrics::counter!(crate::metrics::UPSTREAM_FETCHES, "kind" => "html").increment(1);

        let resp = self
            .client
            .get(url.clone())
            .header(header::ACCEPT, "text/html,application/xhtml+xml")
            .send()
            .await
            .map_err(classify)?;
        if !resp.status().is_success() {
            return Err(FaviconError::UpstreamStatus(resp.status().as_u16()));
        }
        let final_url = resp.url().clone();
        let body = read_capped(resp, HTML_BODY_CAP).await?;
        Ok((body, final_url))
    }

    /// Fetch icon bytes. With a validator present the request goes out
    /// conditional, and a 304 comes back as `NotModified` without a body.
    pub async fn fetch_icon(
        &self,
        url: &Url,
        validator: Option<&OrigMeta>,
    ) -> Result<FetchedIcon, FaviconError> {
        ensure_allowed(url).map_err(|v| FaviconError::UpstreamPolicy(v.to_string()))?;
        metrics::counter!(crate::metrics::UPSTREAM_FETCHES, "kind" => "icon").increment(1);

        let mut req = self.client.get(url.clone());
        let conditional = match validator {
            Some(meta) => {
                if !meta.etag.is_empty() {
                    req = req.header(header::IF_NONE_MATCH, &meta.etag);
                }
                if !meta.last_modified.is_empty() {
                    req = req.header(header::IF_MODIFIED_SINCE, &meta.last_modified);
                }
                !meta.etag.is_empty() || !meta.last_modified.is_empty()
            }
            None => false,
        };

        let resp = req.send().await.map_err(classify)?;
        if conditional && resp.status() == StatusCode::NOT_MODIFIED {
            debug!(%url, "origin revalidated icon");
            return Ok(FetchedIcon::NotModified);
        }
        if !resp.status().is_success() {
            return Err(FaviconError::UpstreamStatus(resp.status().as_u16()));
        }

        let content_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<Mime>().ok())
            .map(|m| m.essence_str().to_string());
        let etag = header_string(&resp, header::ETAG);
        let last_modified = header_string(&resp, header::LAST_MODIFIED);

        let bytes = read_capped(resp, ICON_BODY_CAP).await?;
        Ok(FetchedIcon::Fresh(FetchedBody {
            bytes,
            content_type,
            etag,
            last_modified,
        }))
    }
}

fn header_string(resp: &Response, name: header::HeaderName) -> String {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Read a response body through a size cap. The Content-Length header is a
/// pre-flight check only; the streamed total is what actually enforces the
/// limit.
async fn read_capped(resp: Response, cap: usize) -> Result<Bytes, FaviconError> {
    if let Some(len) = resp.content_length() {
        if len as usize > cap {
            return Err(FaviconError::UpstreamPolicy(
                PolicyViolation::BodyTooLarge(cap).to_string(),
            ));
        }
    }

    let mut buf = BytesMut::with_capacity(8 * 1024);
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await.transpose().map_err(classify)? {
        if buf.len() + chunk.len() > cap {
            return Err(FaviconError::UpstreamPolicy(
                PolicyViolation::BodyTooLarge(cap).to_string(),
            ));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

/// Scheme and literal-address screening, applied to the initial URL and to
/// every redirect hop. Hostnames are screened again post-resolution by
/// `GuardedResolver`.
fn ensure_allowed(url: &Url) -> Result<(), PolicyViolation> {
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(PolicyViolation::Scheme(other.to_string())),
    }
    match url.host() {
        Some(Host::Ipv4(ip)) if is_forbidden_ip(IpAddr::V4(ip)) => {
            Err(PolicyViolation::BlockedAddr(IpAddr::V4(ip)))
        }
        Some(Host::Ipv6(ip)) if is_forbidden_ip(IpAddr::V6(ip)) => {
            Err(PolicyViolation::BlockedAddr(IpAddr::V6(ip)))
        }
        _ => Ok(()),
    }
}

/// DNS-rebinding defense: resolve through the runtime's resolver, then drop
/// every address that is not publicly routable. Resolving to no usable
/// address aborts the request before any connect.
struct GuardedResolver;

impl Resolve for GuardedResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let host = name.as_str().to_string();
        Box::pin(async move {
            let resolved = tokio::net::lookup_host((host.as_str(), 0)).await?;
            let usable: Vec<SocketAddr> =
                resolved.filter(|addr| !is_forbidden_ip(addr.ip())).collect();
            if usable.is_empty() {
                return Err(Box::new(PolicyViolation::NoUsableAddr(host))
                    as Box<dyn std::error::Error + Send + Sync>);
            }
            Ok(Box::new(usable.into_iter()) as Addrs)
        })
    }
}

/// Loopback, link-local, multicast, unspecified, and private ranges
/// (RFC 1918, CGNAT 100.64/10, RFC 4193 ULA) never get connected to.
pub fn is_forbidden_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            v4.is_loopback()
                || v4.is_unspecified()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_broadcast()
                || v4.is_private()
                || (octets[0] == 100 && (octets[1] & 0xc0) == 64)
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_forbidden_ip(IpAddr::V4(mapped));
            }
            let seg = v6.segments();
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                || (seg[0] & 0xffc0) == 0xfe80 // link-local
                || (seg[0] & 0xfe00) == 0xfc00 // unique-local
        }
    }
}

/// Map a reqwest error onto the service error kinds. Policy violations
/// raised by the redirect policy or the resolver ride the source chain.
fn classify(err: reqwest::Error) -> FaviconError {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(&err);
    while let Some(e) = source {
        if let Some(violation) = e.downcast_ref::<PolicyViolation>() {
            return FaviconError::UpstreamPolicy(violation.to_string());
        }
        source = e.source();
    }
    if err.is_timeout() {
        FaviconError::UpstreamNetwork(format!("deadline exceeded: {err}"))
    } else if err.is_redirect() {
        FaviconError::UpstreamPolicy(PolicyViolation::TooManyRedirects.to_string())
    } else {
        FaviconError::UpstreamNetwork(err.to_string())
    }
}
