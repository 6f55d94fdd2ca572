use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::certs::{upstream_client_config, CertificateAuthority};
use crate::interceptor::{InterceptionHandler, Interceptor};
use crate::log;
use crate::logging::LogLevel;
use crate::proxy::http::{
    copy_body, format_request_head, format_response_head, parse_request_head,
    parse_response_head, read_body, read_head, request_body_framing, response_body_framing,
    BodyFraming, HeaderMap, HttpError, PrefixedStream, RequestHead,
};
use crate::registry::Router;

const RESPONSE_502: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n";
const RESPONSE_405: &[u8] = b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\n\r\n";
const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

const TUNNEL_BUFFER: usize = 64 * 1024;

type ClientStream = PrefixedStream<TcpStream>;
type UpstreamTls = tokio_rustls::client::TlsStream<PrefixedStream<TcpStream>>;

/// Everything a connection handler needs, shared across connections.
pub struct ProxyShared {
    pub router: Router,
    pub certs: Arc<CertificateAuthority>,
    pub upstream: UpstreamConnector,
}

/// Serve one proxy client connection. Socket errors close the connection
/// and are logged; they never propagate past this point.
pub async fn handle_client(stream: TcpStream, shared: Arc<ProxyShared>) {
    if let Err(error) = serve_client(stream, shared).await {
        log!(LogLevel::Verbose, "Connection closed: {}", error);
    }
}

async fn serve_client(stream: TcpStream, shared: Arc<ProxyShared>) -> Result<(), HttpError> {
    let _ = stream.set_nodelay(true);
    let mut reader = BufReader::new(stream);

    let head = match read_head(&mut reader).await? {
        Some(head) => head,
        None => return Ok(()),
    };
    let request = parse_request_head(&head)?;

    if request.method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = parse_connect_target(&request.target);
        // Bytes the client pipelined behind the CONNECT head (usually the
        // TLS hello) must reach the next protocol layer.
        let leftover = reader.buffer().to_vec();
        let client = PrefixedStream::new(leftover, reader.into_inner());
        return match shared.router.interceptor_for_host(&host) {
            Some(interceptor) => mitm_session(client, &host, port, interceptor, &shared).await,
            None => blind_tunnel(client, &host, port).await,
        };
    }

    if request.target.starts_with("http://") {
        return forward_plain_http(&mut reader, request).await;
    }

    reader.write_all(RESPONSE_405).await?;
    reader.flush().await?;
    Ok(())
}

fn parse_connect_target(target: &str) -> (String, u16) {
    match target.rfind(':') {
        Some(index) => {
            let host = target[..index].to_string();
            let port = target[index + 1..].parse::<u16>().unwrap_or(443);
            (host, port)
        }
        None => (target.to_string(), 443),
    }
}

/// Non-registry CONNECT targets get a raw spliced tunnel; nothing is
/// inspected.
async fn blind_tunnel(mut client: ClientStream, host: &str, port: u16) -> Result<(), HttpError> {
    let upstream = match TcpStream::connect((host, port)).await {
        Ok(stream) => stream,
        Err(error) => {
            client.write_all(RESPONSE_502).await?;
            client.flush().await?;
            return Err(error.into());
        }
    };
    let _ = upstream.set_nodelay(true);
    client.write_all(CONNECT_ESTABLISHED).await?;
    client.flush().await?;
    splice(client, upstream).await;
    Ok(())
}

/// Bidirectional copy until either side closes. One side's reset must not
/// take the process down, so errors just end the tunnel.
async fn splice<C, U>(client: C, upstream: U)
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let client_to_upstream = async {
        let mut buf = vec![0u8; TUNNEL_BUFFER];
        loop {
            match client_read.read(&mut buf).await {
                Ok(0) => {
                    let _ = upstream_write.shutdown().await;
                    break;
                }
                Ok(read) => {
                    if upstream_write.write_all(&buf[..read]).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    };

    let upstream_to_client = async {
        let mut buf = vec![0u8; TUNNEL_BUFFER];
        loop {
            match upstream_read.read(&mut buf).await {
                Ok(0) => {
                    let _ = client_write.shutdown().await;
                    break;
                }
                Ok(read) => {
                    if client_write.write_all(&buf[..read]).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    };

    tokio::select! {
        _ = client_to_upstream => {},
        _ = upstream_to_client => {},
    }
}

/// Terminate TLS with a minted leaf and serve intercepted requests until
/// either side hangs up.
async fn mitm_session(
    mut client: ClientStream,
    host: &str,
    port: u16,
    interceptor: Arc<Interceptor>,
    shared: &ProxyShared,
) -> Result<(), HttpError> {
    let server_config = match shared.certs.server_config_for_host(host) {
        Ok(config) => config,
        Err(error) => {
            log!(LogLevel::Verbose, "Could not mint certificate for {}: {}", host, error);
            client.write_all(RESPONSE_502).await?;
            client.flush().await?;
            return Ok(());
        }
    };

    client.write_all(CONNECT_ESTABLISHED).await?;
    client.flush().await?;

    let acceptor = TlsAcceptor::from(server_config);
    let tls = acceptor.accept(client).await?;
    let mut session = BufReader::new(tls);

    loop {
        let head = match read_head(&mut session).await? {
            Some(head) => head,
            None => break,
        };
        let request = parse_request_head(&head)?;
        let keep_alive =
            serve_intercepted_request(&mut session, request, host, port, &interceptor, shared)
                .await?;
        if !keep_alive {
            break;
        }
    }
    let _ = session.shutdown().await;
    Ok(())
}

async fn serve_intercepted_request<S>(
    session: &mut BufReader<S>,
    request: RequestHead,
    host: &str,
    port: u16,
    interceptor: &Interceptor,
    shared: &ProxyShared,
) -> Result<bool, HttpError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let target_url = format!("https://{}{}", host, request.target);
    let handler = interceptor.handle_request(&target_url);

    let request_body = read_body(session, request_body_framing(&request)).await?;

    if let Some(block) = &handler.block_response {
        // Closing the connection delimits the body; nothing goes upstream.
        let payload = format!(
            "HTTP/1.1 {} {}\r\n\r\n{}",
            block.status_code, block.message, block.message
        );
        session.write_all(payload.as_bytes()).await?;
        session.flush().await?;
        return Ok(false);
    }

    let mut upstream = match shared.upstream.connect(host, port).await {
        Ok(stream) => stream,
        Err(error) => {
            log!(LogLevel::Verbose, "Upstream dial to {}:{} failed: {}", host, port, error);
            session.write_all(RESPONSE_502).await?;
            session.flush().await?;
            return Ok(true);
        }
    };

    let mut upstream_headers = replay_headers(&request.headers, host);
    handler.modify_request_headers(&mut upstream_headers);
    if !request_body.is_empty() {
        upstream_headers.set("Content-Length", &request_body.len().to_string());
    }

    let mut wire = format_request_head(&request.method, &request.target, &upstream_headers);
    wire.extend_from_slice(&request_body);
    upstream.write_all(&wire).await?;
    upstream.flush().await?;

    let mut upstream_reader = BufReader::new(upstream);
    let response_head = read_head(&mut upstream_reader)
        .await?
        .ok_or_else(|| HttpError::Malformed("upstream closed before responding".to_string()))?;
    let response = parse_response_head(&response_head)?;
    let framing = response_body_framing(&request.method, &response);

    let client_wants_close =
        wants_close(&request.headers) || request.version.eq_ignore_ascii_case("HTTP/1.0");

    // Either side may end the session: the client by asking for it, the
    // origin by signaling close or leaving the body undelimited.
    let upstream_ends_session =
        framing == BodyFraming::UntilClose || wants_close(&response.headers);

    if handler.modifies_response() {
        let raw = read_body(&mut upstream_reader, framing).await?;
        let mut headers = response.headers.clone();
        let body = apply_body_modifiers(&handler, raw, &mut headers);
        headers.remove("transfer-encoding");
        headers.set("Content-Length", &body.len().to_string());
        let mut out = format_response_head(response.status, &response.reason, &headers);
        out.extend_from_slice(&body);
        session.write_all(&out).await?;
        session.flush().await?;
        Ok(!client_wants_close && !upstream_ends_session)
    } else {
        let head_bytes =
            format_response_head(response.status, &response.reason, &response.headers);
        session.write_all(&head_bytes).await?;
        copy_body(&mut upstream_reader, session, framing).await?;
        session.flush().await?;
        Ok(!client_wants_close && !upstream_ends_session)
    }
}

/// Headers replayed upstream: everything except hop-by-hop fields, with the
/// transport supplying a fresh `Host` and per-request connections.
fn replay_headers(original: &HeaderMap, host_header: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.push("Host", host_header);
    for (name, value) in original.iter() {
        if name.eq_ignore_ascii_case("host") || is_hop_by_hop(name) {
            continue;
        }
        headers.push(name, value);
    }
    headers.push("Connection", "close");
    headers
}

fn is_hop_by_hop(name: &str) -> bool {
    [
        "connection",
        "proxy-connection",
        "keep-alive",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
    ]
    .iter()
    .any(|hop| name.eq_ignore_ascii_case(hop))
}

fn wants_close(headers: &HeaderMap) -> bool {
    headers
        .get("connection")
        .map(|value| {
            value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("close"))
        })
        .unwrap_or(false)
}

/// Body modifiers run over the decoded bytes; a gzip response is unpacked
/// and repacked around them. Decode failures fall back to the raw bytes so
/// the client still gets a usable response.
fn apply_body_modifiers(
    handler: &InterceptionHandler,
    raw: Vec<u8>,
    headers: &mut HeaderMap,
) -> Vec<u8> {
    let gzipped = headers
        .get("content-encoding")
        .map(|value| value.trim().eq_ignore_ascii_case("gzip"))
        .unwrap_or(false);
    if !gzipped {
        return handler.modify_body(raw, headers);
    }
    match gunzip(&raw) {
        Ok(decoded) => {
            let modified = handler.modify_body(decoded, headers);
            match gzip_encode(&modified) {
                Ok(encoded) => encoded,
                Err(error) => {
                    log!(LogLevel::Verbose, "Could not recompress response: {}", error);
                    headers.remove("content-encoding");
                    modified
                }
            }
        }
        Err(error) => {
            log!(LogLevel::Verbose, "Could not decompress response: {}", error);
            raw
        }
    }
}

fn gunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    use std::io::Read;
    let mut decoder = flate2::read::GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

fn gzip_encode(data: &[u8]) -> std::io::Result<Vec<u8>> {
    use std::io::Write;
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Absolute-form plain-HTTP requests are converted to origin form and
/// relayed without inspection.
async fn forward_plain_http(
    client: &mut BufReader<TcpStream>,
    request: RequestHead,
) -> Result<(), HttpError> {
    let body = read_body(client, request_body_framing(&request)).await?;

    let rest = request
        .target
        .strip_prefix("http://")
        .unwrap_or(&request.target);
    let (host_port, path) = match rest.find('/') {
        Some(index) => (&rest[..index], &rest[index..]),
        None => (rest, "/"),
    };
    let (host, port) = split_host_port(host_port, 80);

    let mut upstream = match TcpStream::connect((host.as_str(), port)).await {
        Ok(stream) => stream,
        Err(error) => {
            log!(LogLevel::Verbose, "Plain HTTP dial to {} failed: {}", host_port, error);
            client.write_all(RESPONSE_502).await?;
            client.flush().await?;
            return Ok(());
        }
    };

    let mut headers = replay_headers(&request.headers, host_port);
    if !body.is_empty() {
        headers.set("Content-Length", &body.len().to_string());
    }
    let mut wire = format_request_head(&request.method, path, &headers);
    wire.extend_from_slice(&body);
    upstream.write_all(&wire).await?;
    upstream.flush().await?;

    tokio::io::copy(&mut upstream, client).await?;
    client.flush().await?;
    Ok(())
}

fn split_host_port(host_port: &str, default_port: u16) -> (String, u16) {
    match host_port.rfind(':') {
        Some(index) => {
            let host = host_port[..index].to_string();
            let port = host_port[index + 1..].parse::<u16>().unwrap_or(default_port);
            (host, port)
        }
        None => (host_port.to_string(), default_port),
    }
}

/// A corporate proxy between us and the registries, taken from the
/// caller's own environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OuterProxy {
    pub host: String,
    pub port: u16,
}

impl OuterProxy {
    /// Parse values like `http://proxy.corp:3128` or `proxy.corp:3128`.
    pub fn parse(value: &str) -> Option<OuterProxy> {
        let trimmed = value.trim().trim_end_matches('/');
        let rest = trimmed
            .strip_prefix("http://")
            .or_else(|| trimmed.strip_prefix("https://"))
            .unwrap_or(trimmed);
        if rest.is_empty() {
            return None;
        }
        let (host, port) = split_host_port(rest, 80);
        if host.is_empty() {
            return None;
        }
        Some(OuterProxy { host, port })
    }
}

/// Dials registry hosts, optionally chaining through an outer proxy, and
/// wraps the connection in verified TLS.
pub struct UpstreamConnector {
    tls: TlsConnector,
    outer_proxy: Option<OuterProxy>,
}

impl UpstreamConnector {
    pub fn new(outer_proxy: Option<OuterProxy>) -> UpstreamConnector {
        let mut config: ClientConfig = upstream_client_config();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        UpstreamConnector {
            tls: TlsConnector::from(Arc::new(config)),
            outer_proxy,
        }
    }

    pub async fn connect(&self, host: &str, port: u16) -> Result<UpstreamTls, HttpError> {
        let tcp = match &self.outer_proxy {
            None => {
                let stream = TcpStream::connect((host, port)).await?;
                let _ = stream.set_nodelay(true);
                PrefixedStream::new(Vec::new(), stream)
            }
            Some(outer) => self.connect_via_outer(outer, host, port).await?,
        };

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| HttpError::Malformed(format!("invalid upstream host {:?}", host)))?;
        let tls = self.tls.connect(server_name, tcp).await?;
        Ok(tls)
    }

    async fn connect_via_outer(
        &self,
        outer: &OuterProxy,
        host: &str,
        port: u16,
    ) -> Result<PrefixedStream<TcpStream>, HttpError> {
        let mut tcp = TcpStream::connect((outer.host.as_str(), outer.port)).await?;
        let _ = tcp.set_nodelay(true);
        let connect = format!(
            "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n"
        );
        tcp.write_all(connect.as_bytes()).await?;
        tcp.flush().await?;

        let mut reader = BufReader::new(tcp);
        let head = read_head(&mut reader).await?.ok_or_else(|| {
            HttpError::Malformed("outer proxy closed during CONNECT".to_string())
        })?;
        let response = parse_response_head(&head)?;
        if response.status / 100 != 2 {
            return Err(HttpError::Malformed(format!(
                "outer proxy refused CONNECT: {}",
                response.status
            )));
        }
        let leftover = reader.buffer().to_vec();
        Ok(PrefixedStream::new(leftover, reader.into_inner()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rustls::pki_types::pem::PemObject;
    use rustls::pki_types::CertificateDer;
    use rustls::RootCertStore;
    use tokio::io::AsyncReadExt;

    use crate::certs::CaPaths;
    use crate::config::Ecosystem;
    use crate::oracle::DatasetOracle;
    use crate::proxy::controller::ProxyController;
    use crate::registry::npm::npm_interceptor;
    use crate::registry::pypi::pypi_interceptor;

    async fn start_test_proxy(
        dir: &tempfile::TempDir,
        oracle: DatasetOracle,
    ) -> (ProxyController, Arc<CertificateAuthority>, u16) {
        let certs = Arc::new(
            CertificateAuthority::ensure_root(CaPaths::under(dir.path().join("state")))
                .expect("test root"),
        );
        let oracle: Arc<dyn crate::oracle::MalwareOracle> = Arc::new(oracle);
        let mut controller = ProxyController::new();
        let state = controller.state();
        let router = Router::new(
            Ecosystem::Js,
            npm_interceptor(Arc::clone(&oracle), None, state.clone()),
            pypi_interceptor(oracle, state.clone()),
        );
        let shared = Arc::new(ProxyShared {
            router,
            certs: Arc::clone(&certs),
            upstream: UpstreamConnector::new(None),
        });
        let port = controller.start(shared).await.expect("proxy start");
        (controller, certs, port)
    }

    async fn read_until_close<S>(stream: &mut S) -> Vec<u8>
    where
        S: AsyncRead + Unpin,
    {
        let mut collected = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(read) => collected.extend_from_slice(&buf[..read]),
            }
        }
        collected
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn blocked_tarball_gets_the_synthetic_403_over_tls() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let mut oracle = DatasetOracle::new();
        oracle.insert("malicious-package", "1.0.0");
        let (mut controller, certs, port) = start_test_proxy(&dir, oracle).await;

        let mut tcp = TcpStream::connect(("127.0.0.1", port)).await.expect("dial proxy");
        tcp.write_all(
            b"CONNECT registry.npmjs.org:443 HTTP/1.1\r\nHost: registry.npmjs.org:443\r\n\r\n",
        )
        .await
        .expect("send CONNECT");

        let mut reader = BufReader::new(tcp);
        let established = read_head(&mut reader).await.expect("read").expect("head");
        assert!(established.starts_with(b"HTTP/1.1 200 Connection Established"));

        let mut roots = RootCertStore::empty();
        roots
            .add(
                CertificateDer::from_pem_slice(certs.cert_pem().as_bytes())
                    .expect("parse test root"),
            )
            .expect("trust test root");
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));

        let leftover = reader.buffer().to_vec();
        let stream = PrefixedStream::new(leftover, reader.into_inner());
        let server_name =
            ServerName::try_from("registry.npmjs.org".to_string()).expect("server name");
        let mut tls = connector.connect(server_name, stream).await.expect("handshake");

        tls.write_all(
            b"GET /malicious-package/-/malicious-package-1.0.0.tgz HTTP/1.1\r\nHost: registry.npmjs.org\r\n\r\n",
        )
        .await
        .expect("send request");
        let response = read_until_close(&mut tls).await;
        let text = String::from_utf8_lossy(&response);
        assert!(
            text.starts_with("HTTP/1.1 403 Forbidden - blocked by safe-chain\r\n\r\n"),
            "unexpected response: {}",
            text
        );
        assert!(text.ends_with("Forbidden - blocked by safe-chain"));

        assert!(!controller.verify_no_malicious_packages());
        controller.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn non_registry_connects_are_spliced_blindly() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let (mut controller, _certs, port) = start_test_proxy(&dir, DatasetOracle::new()).await;

        // A local echo peer stands in for an arbitrary non-registry host.
        let echo = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("echo bind");
        let echo_port = echo.local_addr().expect("echo addr").port();
        tokio::spawn(async move {
            if let Ok((mut peer, _)) = echo.accept().await {
                let mut buf = [0u8; 64];
                while let Ok(read) = peer.read(&mut buf).await {
                    if read == 0 || peer.write_all(&buf[..read]).await.is_err() {
                        break;
                    }
                }
            }
        });

        let mut tcp = TcpStream::connect(("127.0.0.1", port)).await.expect("dial proxy");
        let connect = format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", echo_port);
        tcp.write_all(connect.as_bytes()).await.expect("send CONNECT");

        let mut reader = BufReader::new(tcp);
        let established = read_head(&mut reader).await.expect("read").expect("head");
        assert!(established.starts_with(b"HTTP/1.1 200 Connection Established"));

        let mut tunnel = reader.into_inner();
        tunnel.write_all(b"ping").await.expect("send payload");
        let mut reply = [0u8; 4];
        tunnel.read_exact(&mut reply).await.expect("echo reply");
        assert_eq!(&reply, b"ping");

        assert!(controller.verify_no_malicious_packages());
        controller.stop().await;
    }

    #[test]
    fn connect_targets_default_to_https_port() {
        assert_eq!(
            parse_connect_target("registry.npmjs.org:443"),
            ("registry.npmjs.org".to_string(), 443)
        );
        assert_eq!(
            parse_connect_target("registry.npmjs.org"),
            ("registry.npmjs.org".to_string(), 443)
        );
        assert_eq!(
            parse_connect_target("pypi.org:8443"),
            ("pypi.org".to_string(), 8443)
        );
    }

    #[test]
    fn replayed_headers_drop_host_and_hop_by_hop() {
        let mut original = HeaderMap::new();
        original.push("Host", "localhost:9999");
        original.push("Accept", "application/json");
        original.push("Proxy-Connection", "keep-alive");
        original.push("Transfer-Encoding", "chunked");

        let replayed = replay_headers(&original, "registry.npmjs.org");
        assert_eq!(replayed.get("host"), Some("registry.npmjs.org"));
        assert_eq!(replayed.get("accept"), Some("application/json"));
        assert!(!replayed.contains("proxy-connection"));
        assert!(!replayed.contains("transfer-encoding"));
        assert_eq!(replayed.get("connection"), Some("close"));
    }

    #[test]
    fn outer_proxy_parsing_accepts_scheme_and_bare_forms() {
        assert_eq!(
            OuterProxy::parse("http://proxy.corp:3128"),
            Some(OuterProxy {
                host: "proxy.corp".to_string(),
                port: 3128
            })
        );
        assert_eq!(
            OuterProxy::parse("proxy.corp:3128/"),
            Some(OuterProxy {
                host: "proxy.corp".to_string(),
                port: 3128
            })
        );
        assert_eq!(
            OuterProxy::parse("http://proxy.corp"),
            Some(OuterProxy {
                host: "proxy.corp".to_string(),
                port: 80
            })
        );
        assert_eq!(OuterProxy::parse(""), None);
    }

    #[test]
    fn gzip_round_trip_preserves_bytes() {
        let original = b"{\"name\":\"lodash\"}".to_vec();
        let packed = gzip_encode(&original).expect("gzip");
        assert_ne!(packed, original);
        let unpacked = gunzip(&packed).expect("gunzip");
        assert_eq!(unpacked, original);
    }

    #[test]
    fn close_tokens_are_detected_case_insensitively() {
        let mut headers = HeaderMap::new();
        headers.push("Connection", "Keep-Alive, Close");
        assert!(wants_close(&headers));
        let mut headers = HeaderMap::new();
        headers.push("Connection", "keep-alive");
        assert!(!wants_close(&headers));
    }
}
