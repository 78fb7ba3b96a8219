use std::{
    io::{Read, Write},
    net::TcpListener,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use tiny_http::{Header, Request, Response, Server};

use crate::{cache::AccessContext, credentials::Credentials, Digest, Reference};

/// Start a HTTP server in a random port.
///
/// Request are handled in `handler`. The server is stopped when the
/// function returns `false`
///
/// Returns the port number of the server.
pub(super) fn test_http_server<F>(mut handler: F) -> u16
where
    F: FnMut(u16, Request) -> bool,
    F: Send + 'static,
{
    let server = Server::http("127.1:0").expect("start HTTP server");
    let port = server.server_addr().to_ip().unwrap().port();

    std::thread::spawn(move || {
        let timeout = std::time::Duration::from_secs(60);
        while let Ok(Some(request)) = server.recv_timeout(timeout) {
            if !handler(port, request) {
                break;
            }
        }
    });

    port
}

fn header(req: &Request, name: &'static str) -> Option<String> {
    req.headers()
        .iter()
        .find(|h| h.field.equiv(name))
        .map(|h| h.value.to_string())
}

fn client(port: u16, context: &AccessContext) -> super::Client {
    let reference = format!("127.0.0.1:{port}/abc/def");
    let reference = Reference::try_from(reference.as_str()).unwrap();
    super::Client::new(&reference, context).unwrap()
}

#[test]
fn request_token_after_unauthorized() {
    let server_port = test_http_server(|port, req| {
        const SERVICE: &str = "registry.docker.io";
        const SCOPE: &str = "repository:abc/def:pull";

        // Use the `url` crate to parse the request query.
        let base_url = url::Url::parse("http://0").ok();
        let url_parser = url::Url::options().base_url(base_url.as_ref());

        let req_url = url_parser.parse(req.url()).unwrap();

        let response = match (req_url.path(), header(&req, "authorization")) {
            ("/token", None) => {
                // Verify the query.
                for (k, v) in req_url.query_pairs() {
                    if !((k == "service" && v == SERVICE) || (k == "scope" && v == SCOPE)) {
                        panic!("Invalid query: {k:?} = {v:?}")
                    }
                }

                let json = r#"
                    {
                      "access_token": "00AA11BB",
                      "expires_in": "X",
                      "issued_at": "Y",
                      "token": "00AA11BB"
                    }
                "#;
                Response::from_string(json)
            }

            ("/v2/abc/def/test", None) => {
                let auth = format!(
                    r#"Bearer realm="http://127.1:{port}/token",service="{SERVICE}", scope="{SCOPE}""#
                );

                Response::from_data(vec![])
                    .with_status_code(401)
                    .with_header(Header::from_bytes("WWW-Authenticate", auth).unwrap())
            }

            ("/v2/abc/def/test", Some(auth)) => Response::from_string(format!("token={auth}")),

            _ => Response::from_string("Not Found").with_status_code(404),
        };

        req.respond(response).expect("Send response");

        true
    });

    let client = client(server_port, &AccessContext::default());

    // Send a regular request.
    //
    // The client must start the authentication process after
    // receiving a 401.

    let response = client.get("test", None).expect("GET /test");
    assert!(matches!(
        response.into_string().as_deref(),
        Ok("token=Bearer 00AA11BB")
    ));
}

#[test]
fn send_credentials_to_token_realm() {
    let seen_auth = Arc::new(Mutex::new(None));

    let server_port = test_http_server({
        let seen_auth = seen_auth.clone();
        move |port, req| {
            let response = match (req.url(), header(&req, "authorization")) {
                ("/token", auth) => {
                    *seen_auth.lock().unwrap() = auth;
                    Response::from_string(r#"{"token": "T0"}"#)
                }

                (_, None) => {
                    let auth = format!(r#"Bearer realm="http://127.1:{port}/token""#);
                    Response::from_data(vec![])
                        .with_status_code(401)
                        .with_header(Header::from_bytes("WWW-Authenticate", auth).unwrap())
                }

                (_, Some(auth)) => Response::from_string(auth),
            };

            req.respond(response).unwrap();
            true
        }
    });

    let context = AccessContext {
        credentials: Some(Credentials::new("me", "pw")),
        ..Default::default()
    };

    let response = client(server_port, &context).get("x", None).unwrap();
    assert_eq!(response.into_string().unwrap(), "Bearer T0");

    assert_eq!(
        seen_auth.lock().unwrap().as_deref(),
        Some("Basic bWU6cHc=")
    );
}

#[test]
fn basic_auth_challenge() {
    let server_port = test_http_server(|_, req| {
        let response = match header(&req, "authorization") {
            None => Response::from_data(vec![])
                .with_status_code(401)
                .with_header(Header::from_bytes("WWW-Authenticate", "Basic realm=\"r\"").unwrap()),

            Some(auth) => Response::from_string(auth),
        };

        req.respond(response).unwrap();
        true
    });

    // Without credentials, the 401 is returned.
    let anonymous = client(server_port, &AccessContext::default());
    assert!(matches!(
        anonymous.get("x", None),
        Err(super::HttpError::Client(e)) if matches!(*e, ureq::Error::Status(401, _))
    ));

    let context = AccessContext {
        credentials: Some(Credentials::new("me", "pw")),
        ..Default::default()
    };

    let response = client(server_port, &context).get("x", None).unwrap();
    assert_eq!(response.into_string().unwrap(), "Basic bWU6cHc=");
}

#[test]
fn resolve_digest_from_header_or_body() {
    const MANIFEST: &str = r#"{"schemaVersion":2,"manifests":[]}"#;

    let header_digest = Digest::sha256("something else");

    let server_port = test_http_server({
        let header_digest = header_digest.to_string();
        move |_, req| {
            let method = req.method().as_str().to_owned();

            let response = match (method.as_str(), req.url()) {
                ("HEAD", "/v2/abc/def/manifests/with-header") => Response::from_data(vec![])
                    .with_header(
                        Header::from_bytes("Docker-Content-Digest", header_digest.as_str())
                            .unwrap(),
                    ),

                ("HEAD", "/v2/abc/def/manifests/no-header") => Response::from_data(vec![]),

                ("GET", "/v2/abc/def/manifests/no-header") => {
                    assert!(header(&req, "accept").unwrap().contains("image.index"));
                    Response::from_string(MANIFEST)
                }

                _ => Response::from_string("Not Found").with_status_code(404),
            };

            req.respond(response).unwrap();
            true
        }
    });

    let client = client(server_port, &AccessContext::default());

    assert_eq!(client.resolve_digest("with-header").unwrap(), header_digest);
    assert_eq!(
        client.resolve_digest("no-header").unwrap(),
        Digest::sha256(MANIFEST)
    );

    assert!(client.resolve_digest("missing").is_err());
}

#[test]
fn scheme_for_registries() {
    use super::guess_scheme;

    assert_eq!(guess_scheme("127.0.0.1:5000"), "http://");
    assert_eq!(guess_scheme("[::1]:5000"), "http://");
    assert_eq!(guess_scheme("example.com:80"), "http://");
    assert_eq!(guess_scheme("example.com"), "https://");
    assert_eq!(guess_scheme("localhost:5000"), "https://");
    assert_eq!(guess_scheme("10.0.0.1:5000"), "https://");
}

/// Plain HTTP server that closes any TLS connection.
///
/// Returns the port, and the number of TLS handshakes received.
fn plain_http_server(body: &'static str) -> (u16, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let handshakes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&handshakes);

    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };

            let mut first = [0];
            if stream.peek(&mut first).unwrap_or(0) == 0 {
                continue;
            }

            // 0x16 is the record type of a TLS handshake.
            if first[0] == 0x16 {
                counter.fetch_add(1, Ordering::SeqCst);
                continue;
            }

            let mut head = Vec::new();
            let mut byte = [0];
            while !head.ends_with(b"\r\n\r\n") && stream.read(&mut byte).unwrap_or(0) == 1 {
                head.push(byte[0]);
            }

            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );

            let _ = stream.write_all(response.as_bytes());
        }
    });

    (port, handshakes)
}

#[test]
fn insecure_registry_falls_back_to_plain_http() {
    let (port, handshakes) = plain_http_server("{}");

    // `localhost` is not a loopback IP, so the client starts with `https://`.
    let reference = format!("localhost:{port}/abc/def");
    let reference = Reference::try_from(reference.as_str()).unwrap();

    let secure = super::Client::new(&reference, &AccessContext::default()).unwrap();
    assert!(matches!(
        secure.get_manifest("latest"),
        Err(super::HttpError::Client(e)) if matches!(*e, ureq::Error::Transport(_))
    ));

    assert_eq!(handshakes.load(Ordering::SeqCst), 1);

    let context = AccessContext {
        insecure: true,
        ..AccessContext::default()
    };

    let insecure = super::Client::new(&reference, &context).unwrap();
    assert_eq!(insecure.get_manifest("latest").unwrap(), b"{}");
    assert_eq!(insecure.get_manifest("v2").unwrap(), b"{}");

    // Only the first request tried TLS.
    assert_eq!(handshakes.load(Ordering::SeqCst), 2);
}

#[test]
fn insecure_tls_accepts_any_certificate() {
    use rustls::client::danger::ServerCertVerifier;

    super::insecure_tls_config().unwrap();

    let verifier = super::AcceptAnyCertificate(Arc::new(rustls::crypto::ring::default_provider()));
    let name = rustls::pki_types::ServerName::try_from("registry.example.com").unwrap();

    let verified = verifier.verify_server_cert(
        &rustls::pki_types::CertificateDer::from(&b"not a certificate"[..]),
        &[],
        &name,
        &[],
        rustls::pki_types::UnixTime::now(),
    );

    assert!(verified.is_ok());
    assert!(!verifier.supported_verify_schemes().is_empty());
}
