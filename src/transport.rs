//! C3 Transport: a thin mTLS HTTPS client wrapper enforcing fixed behavior
//! per request -- CA verification, optional client cert, a fixed `agent_id`
//! query param, and gzip on any request body (spec.md §4.3).

use crate::error::TransportError;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::{Certificate, Client, Identity, Method, StatusCode};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How the Shipper (and other callers) should interpret a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// No connection was made at all.
    NoConnection,
    Success,
    Rejected,
    Transient,
}

pub struct Response {
    pub status: StatusCode,
    pub body: String,
}

impl Response {
    pub fn outcome(&self) -> Outcome {
        match self.status.as_u16() {
            200 => Outcome::Success,
            400 => Outcome::Rejected,
            _ => Outcome::Transient,
        }
    }
}

pub struct Transport {
    base_url: String,
    agent_id: String,
    certs_dir: PathBuf,
    client: Client,
    request_timeout: Duration,
}

impl Transport {
    pub fn new(base_url: String, agent_id: String, certs_dir: PathBuf) -> anyhow::Result<Self> {
        let request_timeout = Duration::from_secs(30);
        let client = build_client(&certs_dir, request_timeout)?;
        Ok(Self {
            base_url,
            agent_id,
            certs_dir,
            client,
            request_timeout,
        })
    }

    /// Rebuilds the underlying client, picking up a client cert that
    /// enrollment may have just written. Called before requests once an
    /// enrollment cycle completes; cheap relative to request latency.
    pub fn refresh_identity(&mut self) -> anyhow::Result<()> {
        self.client = build_client(&self.certs_dir, self.request_timeout)?;
        Ok(())
    }

    pub async fn get(&self, path: &str) -> Result<Response, TransportError> {
        self.request(Method::GET, path, None).await
    }

    pub async fn put(&self, path: &str, body: &[u8]) -> Result<Response, TransportError> {
        self.request(Method::PUT, path, Some(body)).await
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&[u8]>,
    ) -> Result<Response, TransportError> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .client
            .request(method, url)
            .query(&[("agent_id", self.agent_id.as_str())]);

        if let Some(body) = body {
            let gzipped = gzip(body)?;
            req = req
                .header("Content-Encoding", "gzip")
                .header("Accept-Encoding", "gzip")
                .body(gzipped);
        }

        let sent = req.send().await;
        let resp = match sent {
            Ok(resp) => resp,
            Err(err) if err.is_connect() || err.is_timeout() => {
                return Err(TransportError::NoConnection);
            }
            Err(err) => return Err(TransportError::Build(err)),
        };

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Ok(Response { status, body })
    }
}

fn gzip(body: &[u8]) -> Result<Vec<u8>, TransportError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body)?;
    Ok(encoder.finish()?)
}

fn build_client(certs_dir: &Path, timeout: Duration) -> anyhow::Result<Client> {
    let mut builder = Client::builder().timeout(timeout);

    let ca_path = certs_dir.join("ca.crt");
    if let Ok(ca_pem) = std::fs::read(&ca_path) {
        builder = builder.add_root_certificate(Certificate::from_pem(&ca_pem)?);
    }

    let crt_path = certs_dir.join("agent.crt");
    let key_path = certs_dir.join("agent.key");
    if crt_path.exists() && key_path.exists() {
        let mut pem = std::fs::read(&crt_path)?;
        pem.extend_from_slice(&std::fs::read(&key_path)?);
        builder = builder.identity(Identity::from_pem(&pem)?);
    }

    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_200_maps_to_success() {
        let resp = Response {
            status: StatusCode::OK,
            body: "{}".to_string(),
        };
        assert_eq!(resp.outcome(), Outcome::Success);
    }

    #[test]
    fn status_400_maps_to_rejected() {
        let resp = Response {
            status: StatusCode::BAD_REQUEST,
            body: String::new(),
        };
        assert_eq!(resp.outcome(), Outcome::Rejected);
    }

    #[test]
    fn other_status_maps_to_transient() {
        let resp = Response {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: String::new(),
        };
        assert_eq!(resp.outcome(), Outcome::Transient);
    }

    #[test]
    fn gzip_round_trips() {
        let data = b"hello world";
        let compressed = gzip(data).unwrap();
        let mut decoder = flate2::read::GzDecoder::new(&compressed[..]);
        let mut out = Vec::new();
        std::io::Read::read_to_end(&mut decoder, &mut out).unwrap();
        assert_eq!(out, data);
    }
}
