//! Minimal client for the Docker Engine API, over its unix socket.
//!
//! Requests are sent with HTTP/1.0, so the daemon closes the connection
//! after the response and never uses chunked transfer encoding.

use std::{
    io::{self, BufRead, BufReader, Read, Write},
    os::unix::net::UnixStream,
    path::{Path, PathBuf},
};

const DEFAULT_SOCKET: &str = "/var/run/docker.sock";

#[derive(thiserror::Error, Debug)]
pub enum DaemonError {
    #[error("Unsupported DOCKER_HOST: {0:?}")]
    UnsupportedHost(String),

    #[error("Cannot connect to the Docker daemon at {1}: {0}")]
    Connect(io::Error, PathBuf),

    #[error("I/O error with the Docker daemon: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid response from the Docker daemon: {0}")]
    InvalidResponse(String),

    #[error("Docker daemon returned {0}: {1}")]
    Api(u16, String),

    #[error("Invalid JSON from the Docker daemon: {0}")]
    Json(#[from] serde_json::Error),
}

/// Image details, from `GET /images/{name}/json`.
#[derive(serde::Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
pub struct ImageInspect {
    pub id: String,
}

pub struct DaemonClient {
    socket: PathBuf,
}

impl DaemonClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        DaemonClient {
            socket: socket.into(),
        }
    }

    /// Client for the daemon in `$DOCKER_HOST`, or the default socket.
    ///
    /// Only `unix://` hosts are supported.
    pub fn from_env() -> Result<Self, DaemonError> {
        match std::env::var("DOCKER_HOST") {
            Ok(host) if !host.is_empty() => match host.strip_prefix("unix://") {
                Some(path) => Ok(Self::new(path)),
                None => Err(DaemonError::UnsupportedHost(host)),
            },

            _ => Ok(Self::new(DEFAULT_SOCKET)),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub fn inspect(&self, name: &str) -> Result<ImageInspect, DaemonError> {
        let response = self.get(&format!("/images/{name}/json"))?;
        Ok(serde_json::from_reader(response)?)
    }

    /// Export the image as a `docker save` tarball.
    pub fn export(&self, name: &str) -> Result<impl Read, DaemonError> {
        self.get(&format!("/images/{name}/get"))
    }

    fn get(&self, path: &str) -> Result<BufReader<UnixStream>, DaemonError> {
        tracing::debug!(socket = %self.socket.display(), %path, "Docker API request");

        let mut stream = UnixStream::connect(&self.socket)
            .map_err(|e| DaemonError::Connect(e, self.socket.clone()))?;

        write!(stream, "GET {path} HTTP/1.0\r\nHost: docker\r\n\r\n")?;
        stream.flush()?;

        let mut reader = BufReader::new(stream);
        let status = read_response_head(&mut reader)?;

        if status != 200 {
            #[derive(serde::Deserialize)]
            struct Message {
                message: String,
            }

            let mut body = String::new();
            reader.read_to_string(&mut body)?;

            let message = match serde_json::from_str::<Message>(&body) {
                Ok(m) => m.message,
                Err(_) => body.trim().to_owned(),
            };

            return Err(DaemonError::Api(status, message));
        }

        Ok(reader)
    }
}

/// Read the status line and the headers of a response.
///
/// Returns the status code. The reader is left at the start of the body.
fn read_response_head(reader: &mut impl BufRead) -> Result<u16, DaemonError> {
    let invalid = |line: &str| DaemonError::InvalidResponse(line.trim_end().to_owned());

    let mut line = String::new();
    reader.read_line(&mut line)?;

    let status = line
        .strip_prefix("HTTP/1.")
        .and_then(|l| l.split_ascii_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| invalid(&line))?;

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(invalid("unexpected end of headers"));
        }

        let header = line.trim_end();
        if header.is_empty() {
            break;
        }

        if let Some((name, value)) = header.split_once(':') {
            if name.eq_ignore_ascii_case("transfer-encoding")
                && value.trim().eq_ignore_ascii_case("chunked")
            {
                return Err(invalid(header));
            }
        }
    }

    Ok(status)
}
