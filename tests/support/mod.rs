//! Shared fixtures: a mock OIDC identity provider and a sequenced CT log.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// A mock identity provider: discovery document, JWKS, and token minting.
pub struct TestIdp {
    server: mockito::ServerGuard,
    encoding_key: jsonwebtoken::EncodingKey,
    kid: String,
    discovery: mockito::Mock,
    // Held so the JWKS endpoint stays registered.
    _jwks: mockito::Mock,
}

impl TestIdp {
    pub async fn start() -> Self {
        let mut server = mockito::Server::new_async().await;

        let key = jsonwebkey::Key::generate_p256();
        let encoding_key = jsonwebtoken::EncodingKey::from_ec_der(&key.to_der());

        let kid = "integration-key".to_owned();
        let mut jwk = jsonwebkey::JsonWebKey::new(key);
        jwk.set_algorithm(jsonwebkey::Algorithm::ES256).unwrap();
        jwk.key_id = Some(kid.clone());
        let jwks = format!(r#"{{"keys":[{}]}}"#, serde_json::to_string(&jwk).unwrap());

        let url = server.url();
        let discovery = server
            .mock("GET", "/.well-known/openid-configuration")
            .with_header("content-type", "application/json")
            .with_body(json!({ "jwks_uri": format!("{url}/keys") }).to_string())
            .create_async()
            .await;
        let jwks = server
            .mock("GET", "/keys")
            .with_header("content-type", "application/json")
            .with_body(jwks)
            .create_async()
            .await;

        Self {
            server,
            encoding_key,
            kid,
            discovery,
            _jwks: jwks,
        }
    }

    pub fn url(&self) -> String {
        self.server.url()
    }

    pub fn far_future() -> i64 {
        4_294_967_295
    }

    pub fn token(&self, claims: serde_json::Value) -> String {
        let mut header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::ES256);
        header.kid = Some(self.kid.clone());
        jsonwebtoken::encode(&header, &claims, &self.encoding_key).unwrap()
    }

    /// Asserts the verifier never reached this provider.
    pub async fn assert_not_contacted(&self) {
        assert!(!self.discovery.matched_async().await);
    }
}

/// A well-formed `add-pre-chain` response body with a placeholder signature
/// (accepted when no log key is pinned).
pub fn sct_response_body() -> String {
    let signature = {
        let sig_bytes = vec![0x30, 0x06, 0x02, 0x01, 0x01, 0x02, 0x01, 0x01];
        let mut wire = vec![4u8, 3u8];
        wire.extend_from_slice(&(sig_bytes.len() as u16).to_be_bytes());
        wire.extend_from_slice(&sig_bytes);
        BASE64.encode(wire)
    };

    json!({
        "sct_version": 0,
        "id": BASE64.encode([7u8; 32]),
        "timestamp": 1_720_000_000_000u64,
        "extensions": "",
        "signature": signature,
    })
    .to_string()
}

/// Serves the given `(status, body)` sequence, one connection each, then
/// resolves with the number of requests answered.
pub async fn flaky_ct_server(responses: Vec<(u16, String)>) -> (String, JoinHandle<usize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());

    let handle = tokio::spawn(async move {
        let mut served = 0usize;
        for (status, body) in responses {
            let (mut stream, _) = listener.accept().await.unwrap();

            // Read headers, then the declared body length.
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            let header_end = loop {
                let n = stream.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break None;
                }
                buf.extend_from_slice(&chunk[..n]);
                if let Some(pos) = find_subsequence(&buf, b"\r\n\r\n") {
                    break Some(pos + 4);
                }
            };
            let Some(header_end) = header_end else { continue };

            let content_length = std::str::from_utf8(&buf[..header_end])
                .ok()
                .and_then(|headers| {
                    headers.lines().find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())?
                    })
                })
                .unwrap_or(0);
            while buf.len() < header_end + content_length {
                let n = stream.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }

            let reason = if status == 200 { "OK" } else { "Error" };
            let response = format!(
                "HTTP/1.1 {status} {reason}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.ok();
            served += 1;
        }
        served
    });

    (url, handle)
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
