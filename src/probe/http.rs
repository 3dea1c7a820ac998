//! HTTP probe implementation.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, LOCATION};
use reqwest::{Method, Url};
use serde_json::Value;
use std::error::Error as _;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::{
    connect_tcp, ms, resolve_host, tls, Deadline, ProbeDriver, ProbeError, ProbeMeta, ProbeOutcome,
};
use crate::check::{
    accepts, parse_patterns, CheckDefinition, CheckKind, CheckTarget, HttpAuth, HttpTarget,
};
use crate::db::Timings;

pub struct HttpDriver;

/// Connection phases measured before the request is sent.
#[derive(Debug, Default)]
struct Preflight {
    addr: Option<SocketAddr>,
    name_lookup: f64,
    connect: f64,
    app_connect: Option<f64>,
    ssl_expire_date: Option<chrono::DateTime<Utc>>,
}

#[async_trait]
impl ProbeDriver for HttpDriver {
    fn kind(&self) -> CheckKind {
        CheckKind::Http
    }

    async fn execute(
        &self,
        def: &CheckDefinition,
        timeout: Duration,
    ) -> Result<ProbeOutcome, ProbeError> {
        let CheckTarget::Http(target) = &def.target else {
            return Err(ProbeError::Config(format!("check {} is not an http check", def.id)));
        };
        run_http_probe(target, timeout).await
    }
}

/// Run one HTTP attempt against `target`.
pub async fn run_http_probe(
    target: &HttpTarget,
    timeout: Duration,
) -> Result<ProbeOutcome, ProbeError> {
    let deadline = Deadline::new(timeout);
    let url = Url::parse(&target.url)
        .map_err(|e| ProbeError::Config(format!("invalid url {:?}: {}", target.url, e)))?;
    let patterns = parse_patterns(&target.accepted_status_codes).map_err(ProbeError::Config)?;
    let method = Method::from_bytes(target.http_method.to_ascii_uppercase().as_bytes())
        .map_err(|_| ProbeError::Config(format!("invalid method {:?}", target.http_method)))?;

    // Through a proxy the connection phases belong to the proxy hop.
    let preflight = if target.proxy.is_some() {
        Preflight::default()
    } else {
        preflight(&url, target.ignore_ssl_error, &deadline).await?
    };
    let pre_transfer = deadline.elapsed_ms();

    let client = build_client(target, &url, preflight.addr, &deadline)?;

    let mut current = url.clone();
    let mut method = method;
    let mut hops = 0u32;
    let mut redirect_time = 0.0;
    let (response, sent_at) = loop {
        let mut req = client.request(method.clone(), current.clone());
        req = req.headers(request_headers(target)?);
        if let Some(HttpAuth::Basic { username, password }) = &target.auth {
            req = req.basic_auth(username, Some(password));
        }
        if let Some(body) = &target.body_req {
            if method != Method::GET && method != Method::HEAD {
                req = req.body(body.clone());
            }
        }

        let sent_at = Instant::now();
        let hop_start = deadline.elapsed_ms();
        let resp = deadline
            .run(async { req.send().await.map_err(|e| map_reqwest_error(e, timeout)) })
            .await?;

        let location = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        match location {
            Some(location) if resp.status().is_redirection() && target.redirects > 0 => {
                if hops >= target.redirects {
                    return Err(ProbeError::Protocol(format!(
                        "stopped after {} redirects",
                        target.redirects
                    )));
                }
                current = current.join(&location).map_err(|e| {
                    ProbeError::Protocol(format!("bad redirect location {:?}: {}", location, e))
                })?;
                // 301/302/303 switch to GET the way browsers do.
                if matches!(resp.status().as_u16(), 301 | 302 | 303) && method != Method::HEAD {
                    method = Method::GET;
                }
                hops += 1;
                redirect_time += deadline.elapsed_ms() - hop_start;
            }
            _ => break (resp, sent_at),
        }
    };
    let start_transfer = deadline.elapsed_ms();
    let ttfb = ms(sent_at.elapsed());

    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let body = deadline
        .run(async {
            response
                .bytes()
                .await
                .map_err(|e| map_reqwest_error(e, timeout))
        })
        .await?;
    let total = deadline.elapsed_ms();

    let timings = if target.proxy.is_some() {
        Timings {
            response_time: Some(total),
            start_transfer: Some(start_transfer),
            redirect: Some(redirect_time),
            download: Some(total - start_transfer),
            ..Default::default()
        }
    } else {
        Timings {
            response_time: Some(total),
            name_lookup: Some(preflight.name_lookup),
            connect: Some(preflight.connect),
            app_connect: preflight.app_connect,
            pre_transfer: Some(pre_transfer),
            redirect: Some(redirect_time),
            start_transfer: Some(pre_transfer + redirect_time + ttfb),
            download: Some(total - start_transfer),
            ..Default::default()
        }
    };

    let meta = ProbeMeta {
        ssl_expire_date: preflight.ssl_expire_date,
        status_code: Some(status),
        answers: Vec::new(),
    };
    let mut outcome = ProbeOutcome {
        success: true,
        degraded: false,
        timings,
        message: String::new(),
        meta,
    };

    if let Some(failure) = assert_response(target, &patterns, status, &headers, &body) {
        outcome.success = false;
        outcome.message = failure;
        return Ok(outcome);
    }

    outcome.check_certificate(target.ssl_expire_warning_days);
    Ok(outcome)
}

/// Timed DNS, TCP and TLS phases against the first hop.
async fn preflight(
    url: &Url,
    ignore_ssl_error: bool,
    deadline: &Deadline,
) -> Result<Preflight, ProbeError> {
    let host = url
        .host_str()
        .ok_or_else(|| ProbeError::Config(format!("url {} has no host", url)))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| ProbeError::Config(format!("url {} has no port", url)))?;

    let addr = resolve_host(host, port, deadline).await?;
    let name_lookup = deadline.elapsed_ms();
    let stream = connect_tcp(addr, deadline).await?;
    let connect = deadline.elapsed_ms();

    let mut pf = Preflight {
        addr: Some(addr),
        name_lookup,
        connect,
        ..Default::default()
    };

    if url.scheme() == "https" {
        let sni = host.trim_start_matches('[').trim_end_matches(']');
        let (tls_stream, not_after) = deadline
            .run(tls::handshake(stream, sni, ignore_ssl_error))
            .await?;
        drop(tls_stream);
        pf.app_connect = Some(deadline.elapsed_ms());
        pf.ssl_expire_date = not_after;
    }
    Ok(pf)
}

fn build_client(
    target: &HttpTarget,
    url: &Url,
    pinned: Option<SocketAddr>,
    deadline: &Deadline,
) -> Result<reqwest::Client, ProbeError> {
    let mut builder = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(deadline.remaining())
        .danger_accept_invalid_certs(target.ignore_ssl_error)
        .user_agent(concat!("rmon/", env!("CARGO_PKG_VERSION")));

    match &target.proxy {
        Some(proxy) => {
            let proxy = reqwest::Proxy::all(proxy.as_str())
                .map_err(|e| ProbeError::Config(format!("invalid proxy: {}", e)))?;
            builder = builder.proxy(proxy);
        }
        None => {
            builder = builder.no_proxy();
            if let (Some(addr), Some(host)) = (pinned, url.host_str()) {
                builder = builder.resolve(host, addr);
            }
        }
    }

    if let Some(HttpAuth::Mtls { cert_pem, key_pem }) = &target.auth {
        let identity = reqwest::Identity::from_pkcs8_pem(cert_pem.as_bytes(), key_pem.as_bytes())
            .map_err(|e| ProbeError::Config(format!("invalid client certificate: {}", e)))?;
        builder = builder.identity(identity);
    }

    builder
        .build()
        .map_err(|e| ProbeError::Config(format!("failed to build http client: {}", e)))
}

fn request_headers(target: &HttpTarget) -> Result<HeaderMap, ProbeError> {
    let mut headers = HeaderMap::new();
    for (name, value) in &target.header_req {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| ProbeError::Config(format!("invalid header name {:?}", name)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| ProbeError::Config(format!("invalid value for header {}", name)))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

fn map_reqwest_error(e: reqwest::Error, timeout: Duration) -> ProbeError {
    if e.is_timeout() {
        return ProbeError::Timeout(timeout);
    }
    let mut source = e.source();
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::ConnectionRefused {
                return ProbeError::Refused(e.to_string());
            }
        }
        source = inner.source();
    }
    if e.is_connect() {
        return ProbeError::Network(e.to_string());
    }
    ProbeError::Protocol(e.to_string())
}

/// First failed response assertion, if any.
fn assert_response(
    target: &HttpTarget,
    patterns: &[crate::check::StatusPattern],
    status: u16,
    headers: &HeaderMap,
    body: &[u8],
) -> Option<String> {
    if !accepts(patterns, status) {
        return Some(format!(
            "HTTP status {} is not one of {}",
            status,
            target.accepted_status_codes.join(", ")
        ));
    }

    let text = String::from_utf8_lossy(body);
    if let Some(keyword) = &target.body {
        if !text.contains(keyword.as_str()) {
            return Some(format!("response body does not contain {:?}", keyword));
        }
    }

    if let Some(assertion) = &target.body_json {
        let doc: Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(e) => return Some(format!("response body is not JSON: {}", e)),
        };
        match json_path_lookup(&doc, &assertion.path) {
            None => return Some(format!("JSON path {} not found", assertion.path)),
            Some(actual) if !json_values_match(actual, &assertion.value) => {
                return Some(format!(
                    "JSON path {} is {} but expected {}",
                    assertion.path, actual, assertion.value
                ));
            }
            Some(_) => {}
        }
    }

    for (name, expected) in &target.headers_response.required {
        match headers.get(name.as_str()).and_then(|v| v.to_str().ok()) {
            None => return Some(format!("required header {} is missing", name)),
            Some(actual) if !expected.is_empty() && actual.trim() != expected.trim() => {
                return Some(format!(
                    "header {} is {:?} but expected {:?}",
                    name, actual, expected
                ));
            }
            Some(_) => {}
        }
    }
    for name in &target.headers_response.forbidden {
        if headers.contains_key(name.as_str()) {
            return Some(format!("forbidden header {} is present", name));
        }
    }
    None
}

/// Walk a dotted path (`a.b.0.c`, optional leading `$.`) through a JSON document.
pub fn json_path_lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim().trim_start_matches('$').trim_start_matches('.');
    if path.is_empty() {
        return Some(doc);
    }
    path.split('.').try_fold(doc, |node, segment| match node {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Strings compare against the rendered form of scalars: `"1"` matches `1`.
fn json_values_match(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    match (actual, expected) {
        (Value::String(a), e) => e.as_str().map_or(false, |e| a == e) || *a == e.to_string(),
        (a, Value::String(e)) => a.to_string() == *e,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::CheckRequest;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn read_head(sock: &mut tokio::net::TcpStream) -> Vec<u8> {
        let mut buf = vec![0u8; 4096];
        let mut seen = Vec::new();
        loop {
            match sock.read(&mut buf).await {
                Ok(0) | Err(_) => return seen,
                Ok(n) => {
                    seen.extend_from_slice(&buf[..n]);
                    if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                        return seen;
                    }
                }
            }
        }
    }

    /// Serve canned responses in order, one per request. Connections that
    /// close without a request (the timing preflight) are skipped.
    async fn serve(responses: Vec<String>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            for response in responses {
                loop {
                    let Ok((mut sock, _)) = listener.accept().await else {
                        return;
                    };
                    if read_head(&mut sock).await.is_empty() {
                        continue;
                    }
                    let _ = sock.write_all(response.as_bytes()).await;
                    break;
                }
            }
        });
        port
    }

    fn response(status: &str, extra_headers: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n{}\r\n{}",
            status,
            body.len(),
            extra_headers,
            body
        )
    }

    fn http_target(body: serde_json::Value) -> HttpTarget {
        let def = CheckRequest::parse(CheckKind::Http, body.to_string().as_bytes())
            .unwrap()
            .into_definition(1, None)
            .unwrap();
        match def.target {
            CheckTarget::Http(t) => t,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_accepted_status_and_keyword() {
        let port = serve(vec![response("200 OK", "", "all systems go")]).await;
        let target = http_target(json!({
            "name": "site",
            "url": format!("http://127.0.0.1:{}/health", port),
            "accepted_status_codes": ["2**"],
            "body": "systems go",
        }));
        let outcome = run_http_probe(&target, Duration::from_secs(3)).await.unwrap();
        assert!(outcome.success, "{}", outcome.message);
        assert_eq!(outcome.meta.status_code, Some(200));
        assert!(outcome.timings.name_lookup.is_some());
        assert!(outcome.timings.start_transfer.unwrap() >= outcome.timings.pre_transfer.unwrap());
    }

    #[tokio::test]
    async fn test_rejected_status() {
        let port = serve(vec![response("404 Not Found", "", "")]).await;
        let target = http_target(json!({
            "name": "site",
            "url": format!("http://127.0.0.1:{}/", port),
            "accepted_status_codes": "2**",
        }));
        let outcome = run_http_probe(&target, Duration::from_secs(3)).await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.message.contains("404"));
    }

    #[tokio::test]
    async fn test_follows_redirect() {
        let port = serve(vec![
            response("302 Found", "Location: /final\r\n", ""),
            response("200 OK", "X-Served-By: edge\r\n", "{\"state\":{\"ok\":true}}"),
        ])
        .await;
        let target = http_target(json!({
            "name": "site",
            "url": format!("http://127.0.0.1:{}/start", port),
            "body_json": {"path": "state.ok", "value": "true"},
            "headers_response": {"required": {"X-Served-By": "edge"}, "forbidden": ["X-Debug"]},
        }));
        let outcome = run_http_probe(&target, Duration::from_secs(3)).await.unwrap();
        assert!(outcome.success, "{}", outcome.message);
        assert!(outcome.timings.redirect.unwrap() > 0.0);
    }

    #[tokio::test]
    async fn test_refused_is_distinct() {
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let target = http_target(json!({
            "name": "site",
            "url": format!("http://127.0.0.1:{}/", port),
        }));
        let err = run_http_probe(&target, Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, ProbeError::Refused(_)), "got {:?}", err);
    }

    #[test]
    fn test_json_path_lookup() {
        let doc = json!({"data": {"items": [{"state": "up"}, {"state": "down"}]}, "n": 3});
        assert_eq!(json_path_lookup(&doc, "data.items.1.state"), Some(&json!("down")));
        assert_eq!(json_path_lookup(&doc, "$.n"), Some(&json!(3)));
        assert_eq!(json_path_lookup(&doc, "data.missing"), None);
        assert!(json_values_match(&json!(3), &json!("3")));
        assert!(!json_values_match(&json!("up"), &json!("down")));
    }
}
