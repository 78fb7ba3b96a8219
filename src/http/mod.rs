//! Blocking client for the registry API.

#[cfg(test)]
mod tests;

use std::{
    io::Read,
    net::SocketAddr,
    str::FromStr,
    sync::{Arc, RwLock},
};

use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, ServerName, UnixTime},
    DigitallySignedStruct, SignatureScheme,
};

use crate::{
    cache::AccessContext,
    credentials::Credentials,
    digest::{Digest, DigestError},
    reference::Reference,
};

/// Manifest types accepted by the client.
const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json,\
    application/vnd.oci.image.manifest.v1+json,\
    application/vnd.docker.distribution.manifest.list.v2+json,\
    application/vnd.docker.distribution.manifest.v2+json";

const DIGEST_HEADER: &str = "Docker-Content-Digest";

#[derive(thiserror::Error, Debug)]
pub enum HttpError {
    #[error("{0}")]
    Client(#[from] Box<ureq::Error>),

    #[error("Missing authentication tokens.")]
    MissingTokens,

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error while reading the response: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid {DIGEST_HEADER} header: {0}")]
    InvalidDigest(#[from] DigestError),

    #[error("TLS configuration: {0}")]
    Tls(#[from] rustls::Error),
}

impl From<ureq::Error> for HttpError {
    fn from(value: ureq::Error) -> Self {
        HttpError::Client(Box::new(value))
    }
}

pub(crate) struct Client {
    agent: ureq::Agent,
    auth: RwLock<Option<String>>,
    credentials: Option<Credentials>,
    user_agent: String,
    base_url: RwLock<String>,
    insecure: bool,
}

impl Client {
    /// Create a new HTTP client to the registry/image in `reference`.
    ///
    /// It tries to guess the URI scheme for the registry:
    ///
    /// * If the registry is a loopback IP (like `127.0.0.1`), or if the
    ///   port is `:80`, it uses `http://`.
    /// * In any other case, it uses `https://`.
    ///
    /// If `insecure` is set in the context, TLS certificates are not
    /// verified, and the client switches to `http://` when the first
    /// TLS connection fails.
    pub fn new(reference: &Reference, context: &AccessContext) -> Result<Self, HttpError> {
        let host = reference.registry_host();

        let base_url = format!(
            "{}{}/v2/{}",
            guess_scheme(host),
            host,
            reference.repository
        );

        let mut agent = ureq::AgentBuilder::new();
        if context.insecure {
            agent = agent.tls_config(Arc::new(insecure_tls_config()?));
        }

        Ok(Client {
            agent: agent.build(),
            auth: Default::default(),
            credentials: context.credentials.clone(),
            user_agent: context.user_agent.clone(),
            base_url: RwLock::new(base_url),
            insecure: context.insecure,
        })
    }

    /// Send a `GET` request to the registry.
    ///
    /// The path must not include the `v2/$image` prefix.
    pub fn get(&self, path: &str, accept: Option<&str>) -> Result<ureq::Response, HttpError> {
        self.send("GET", path, accept)
    }

    /// Get the digest of the manifest for `tag`, without downloading it.
    ///
    /// If the registry does not send the `Docker-Content-Digest` header,
    /// the manifest is downloaded and hashed.
    pub fn resolve_digest(&self, tag: &str) -> Result<Digest, HttpError> {
        let path = format!("manifests/{tag}");
        let response = self.send("HEAD", &path, Some(MANIFEST_ACCEPT))?;

        if let Some(digest) = response.header(DIGEST_HEADER) {
            return Ok(Digest::try_from(digest)?);
        }

        tracing::debug!(%tag, "No digest header, hashing the manifest");

        let manifest = self.get_manifest(tag)?;
        Ok(Digest::sha256(manifest))
    }

    /// Download a manifest, by tag or digest.
    pub fn get_manifest(&self, reference: &str) -> Result<Vec<u8>, HttpError> {
        let response = self.get(&format!("manifests/{reference}"), Some(MANIFEST_ACCEPT))?;

        let mut manifest = Vec::new();
        response.into_reader().read_to_end(&mut manifest)?;
        Ok(manifest)
    }

    /// Send a `GET` request to download a blob.
    ///
    /// The data is not verified.
    pub fn download_blob(&self, blob: &Digest) -> Result<impl Read + Send, HttpError> {
        let response = self.get(&format!("blobs/{}", blob.source()), None)?;
        Ok(response.into_reader())
    }

    fn request(&self, method: &str, path: &str, accept: Option<&str>) -> ureq::Request {
        let base_url = self.base_url.read().unwrap_or_else(|e| e.into_inner());
        let url = format!("{}/{}", base_url, path);
        let mut request = self
            .agent
            .request(method, &url)
            .set("User-Agent", &self.user_agent);

        if let Some(accept) = accept {
            request = request.set("Accept", accept);
        }

        request
    }

    /// Send a request to the registry.
    ///
    /// In insecure mode, a transport error on `https://` switches the
    /// client to `http://`, and the request is repeated.
    fn send(
        &self,
        method: &str,
        path: &str,
        accept: Option<&str>,
    ) -> Result<ureq::Response, HttpError> {
        match self.send_authenticated(method, path, accept) {
            Err(HttpError::Client(error))
                if matches!(*error, ureq::Error::Transport(_)) && self.downgrade_scheme() =>
            {
                tracing::warn!(%error, "HTTPS request failed, retrying with plain HTTP");
                self.send_authenticated(method, path, accept)
            }

            result => result,
        }
    }

    /// Replace `https://` with `http://` in the base URL.
    ///
    /// Return `false` if the client is not insecure, or if the URL
    /// was already using `http://`.
    fn downgrade_scheme(&self) -> bool {
        if !self.insecure {
            return false;
        }

        let mut base_url = self.base_url.write().unwrap_or_else(|e| e.into_inner());
        match base_url.strip_prefix("https://") {
            Some(tail) => {
                *base_url = format!("http://{tail}");
                true
            }
            None => false,
        }
    }

    /// If the registry responds with a `401` error, use the challenge in
    /// the `WWW-Authenticate` header to authenticate, and repeat the
    /// request.
    fn send_authenticated(
        &self,
        method: &str,
        path: &str,
        accept: Option<&str>,
    ) -> Result<ureq::Response, HttpError> {
        let request = self.request(method, path, accept);

        tracing::trace!(url = request.url(), %method, "Registry request");

        let auth = self.auth.read().unwrap_or_else(|e| e.into_inner());
        if let Some(auth) = auth.as_deref() {
            return Ok(request.set("Authorization", auth).call()?);
        }

        drop(auth);
        let mut auth = self.auth.write().unwrap_or_else(|e| e.into_inner());

        // Try a request with no credentials.

        let response = match request.call() {
            Ok(r) => return Ok(r),
            Err(ureq::Error::Status(401, r)) => r,
            Err(e) => return Err(e.into()),
        };

        let challenge = response
            .header("www-authenticate")
            .map(str::to_owned)
            .unwrap_or_default();

        let header = if challenge.starts_with("Basic") {
            match &self.credentials {
                Some(c) => c.basic_auth(),
                None => return Err(ureq::Error::Status(401, response).into()),
            }
        } else {
            let Some(mut token_request) = build_auth_request(&self.agent, &challenge) else {
                return Err(ureq::Error::Status(401, response).into());
            };

            tracing::debug!(url = token_request.url(), "Requesting registry token");

            token_request = token_request.set("User-Agent", &self.user_agent);
            if let Some(credentials) = &self.credentials {
                token_request = token_request.set("Authorization", &credentials.basic_auth());
            }

            // The response from the `realm` URL must include either
            // `token` or `access_token`.

            #[derive(serde::Deserialize, Debug)]
            struct Tokens {
                token: Option<String>,
                access_token: Option<String>,
            }

            match serde_json::from_reader(token_request.call()?.into_reader())? {
                Tokens { token: Some(t), .. }
                | Tokens {
                    access_token: Some(t),
                    ..
                } => format!("Bearer {t}"),
                _ => return Err(HttpError::MissingTokens),
            }
        };

        *auth = Some(header);
        drop(auth);

        // Repeat the request, now that we have a token.
        self.send_authenticated(method, path, accept)
    }
}

fn guess_scheme(registry: &str) -> &'static str {
    const HTTP: &str = "http://";
    const HTTPS: &str = "https://";

    if registry.ends_with(":80") {
        return HTTP;
    }

    if let Ok(address) = SocketAddr::from_str(registry) {
        return if address.ip().is_loopback() { HTTP } else { HTTPS };
    }

    HTTPS
}

/// TLS configuration that accepts any server certificate.
fn insecure_tls_config() -> Result<rustls::ClientConfig, rustls::Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = AcceptAnyCertificate(provider.clone());

    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();

    Ok(config)
}

/// Certificate verifier for `--insecure`.
///
/// Handshake signatures are still checked with the algorithms of the
/// crypto provider.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<rustls::crypto::CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Parse a `WWW-Authenticate` header and build the request to
/// get the authentication token.
///
/// Return `None` if the header can't be parsed.
///
/// See <https://distribution.github.io/distribution/spec/auth/token/>
/// for more details.
fn build_auth_request(agent: &ureq::Agent, challenge: &str) -> Option<ureq::Request> {
    let mut request = None;
    let mut pending_params = vec![];

    let mut tail = challenge.strip_prefix("Bearer ")?;

    loop {
        let (key, value) = tail.split_once('=')?;
        let key = key.trim_ascii();
        let (value, after) = value.strip_prefix('"')?.split_once('"')?;

        if key == "realm" {
            request = Some(
                pending_params
                    .drain(..)
                    .fold(agent.get(value), |r, (k, v)| r.query(k, v)),
            );
        } else {
            match request.take() {
                Some(r) => request = Some(r.query(key, value)),
                None => pending_params.push((key, value)),
            }
        }

        tail = match after.trim_ascii_start() {
            "" => return request,
            t => t.strip_prefix(',')?.trim_ascii_start(),
        };
    }
}
