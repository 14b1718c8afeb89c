use bytes::Bytes;
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::{
    HeaderMap, Request, Response, Uri, Version,
    body::Body,
    header::{CONNECTION, CONTENT_TYPE, HOST, HeaderName, HeaderValue, X_CONTENT_TYPE_OPTIONS},
};
use std::{error::Error as StdError, net::SocketAddr, sync::Arc};

use crate::error::ForwardError;
use crate::transport::HttpTransport;

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Headers that only describe a single connection leg and are never relayed.
pub const HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "proxy-connection",
];

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Relays requests to a base URL through the shared [`HttpTransport`].
#[derive(Clone)]
pub struct HttpForwarder {
    transport: Arc<HttpTransport>,
    append_forwarded_for: bool,
}

impl HttpForwarder {
    #[must_use]
    pub fn new(transport: Arc<HttpTransport>) -> Self {
        Self {
            transport,
            append_forwarded_for: false,
        }
    }

    #[must_use]
    pub fn with_forwarded_for(mut self, enabled: bool) -> Self {
        self.append_forwarded_for = enabled;
        self
    }

    /// Forwards one request to `target_base` and returns the upstream response
    /// with its body still streaming. Any failure is returned exactly once and no
    /// response is produced for it; use [`error_response`] to answer the client.
    pub async fn forward<B>(
        &self,
        target_base: &str,
        mut request: Request<B>,
        client_addr: SocketAddr,
    ) -> Result<Response<ProxyBody>, ForwardError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        rewrite_request(&mut request, target_base)?;
        if self.append_forwarded_for {
            append_forwarded_for(request.headers_mut(), client_addr);
        }

        let mut response = self.transport.round_trip(request).await?;
        strip_hop_headers(response.headers_mut());
        Ok(response.map(BodyExt::boxed))
    }
}

/// Points `request` at `target_base` + its own path and query, sets Host to the
/// target and drops hop-by-hop headers. Returns the new URI.
pub fn rewrite_request<B>(request: &mut Request<B>, target_base: &str) -> Result<Uri, ForwardError> {
    let path = request
        .uri()
        .path_and_query()
        .map_or("/", |pq| pq.as_str());
    let url = format!("{}{path}", target_base.trim_end_matches('/'));

    let uri: Uri = url
        .parse()
        .map_err(|e| ForwardError::InvalidTarget(format!("{url}: {e}")))?;
    if uri.scheme().is_none() {
        return Err(ForwardError::InvalidTarget(format!("{url}: missing scheme")));
    }
    let host = match (uri.host(), uri.port_u16()) {
        (Some(host), Some(port)) if !host.is_empty() => format!("{host}:{port}"),
        (Some(host), None) if !host.is_empty() => host.to_string(),
        _ => return Err(ForwardError::InvalidTarget(format!("{url}: missing host"))),
    };
    let host = HeaderValue::from_str(&host)
        .map_err(|e| ForwardError::InvalidTarget(format!("{url}: {e}")))?;

    strip_hop_headers(request.headers_mut());
    request.headers_mut().insert(HOST, host);
    *request.version_mut() = Version::HTTP_11;
    *request.uri_mut() = uri.clone();
    Ok(uri)
}

/// Removes the fixed hop-by-hop set plus any header the `Connection` header
/// names. Applying it twice leaves the same headers as applying it once.
pub fn strip_hop_headers(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_HEADERS {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, client_addr: SocketAddr) {
    let client_ip = client_addr.ip().to_string();
    let value = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.trim().is_empty() => format!("{prior}, {client_ip}"),
        _ => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

/// Plain-text response for a request that ended in `err`.
#[must_use]
pub fn error_response(err: &ForwardError) -> Response<ProxyBody> {
    let message = match err {
        ForwardError::MissingHost => "No Host header provided\n".to_string(),
        _ => format!("Error proxying request: {err}\n"),
    };
    let mut response = Response::new(full(message));
    *response.status_mut() = err.status();
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
        .headers_mut()
        .insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    response
}

pub fn full(chunk: impl Into<Bytes>) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}
