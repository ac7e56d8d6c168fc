//! C4 Enrollment: key/CSR generation, CSR submission, and the poll-until-
//! signed certificate fetch loop (spec.md §4.4).
//!
//! Key and CSR generation plus modulus validation are grounded on the same
//! approach a sibling monitoring agent in this retrieval pack takes for its
//! own TLS material (`openssl`, vendored).

use crate::error::EnrollError;
use crate::transport::{Outcome, Transport};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::{X509Name, X509Req, X509};
use std::fs;
use std::path::{Path, PathBuf};

const RSA_BITS: u32 = 2048;

pub struct CertPaths {
    pub key: PathBuf,
    pub csr: PathBuf,
    pub crt: PathBuf,
    pub ca: PathBuf,
}

impl CertPaths {
    pub fn new(certs_dir: &Path) -> Self {
        Self {
            key: certs_dir.join("agent.key"),
            csr: certs_dir.join("agent.csr"),
            crt: certs_dir.join("agent.crt"),
            ca: certs_dir.join("ca.crt"),
        }
    }

    pub fn enrolled(&self) -> bool {
        self.crt.exists() && self.key.exists()
    }
}

pub enum FetchOutcome {
    Signed,
    NotYetSigned,
    Revoked,
}

/// Generates a 2048-bit RSA key and a matching CSR with a fixed subject
/// (CN=hostname, other fields fixed per spec.md §4.4) and persists both with
/// 0400 permissions.
pub fn initialize(paths: &CertPaths, hostname: &str) -> Result<(), EnrollError> {
    let rsa = Rsa::generate(RSA_BITS)?;
    let key = PKey::from_rsa(rsa)?;

    let mut name_builder = X509Name::builder()?;
    name_builder.append_entry_by_text("C", "US")?;
    name_builder.append_entry_by_text("ST", "CA")?;
    name_builder.append_entry_by_text("L", "San Francisco")?;
    name_builder.append_entry_by_text("O", "Sentry Agents")?;
    name_builder.append_entry_by_text("OU", "Agents")?;
    name_builder.append_entry_by_text("CN", hostname)?;
    let name = name_builder.build();

    let mut req_builder = X509Req::builder()?;
    req_builder.set_subject_name(&name)?;
    req_builder.set_pubkey(&key)?;
    req_builder.sign(&key, MessageDigest::sha256())?;
    let req = req_builder.build();

    write_restricted(&paths.key, &key.private_key_to_pem_pkcs8()?)?;
    write_restricted(&paths.csr, &req.to_pem()?)?;
    Ok(())
}

#[cfg(unix)]
fn write_restricted(path: &Path, bytes: &[u8]) -> Result<(), EnrollError> {
    use std::os::unix::fs::PermissionsExt;
    fs::write(path, bytes)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o400))?;
    Ok(())
}

#[cfg(not(unix))]
fn write_restricted(path: &Path, bytes: &[u8]) -> Result<(), EnrollError> {
    fs::write(path, bytes)?;
    Ok(())
}

pub async fn submit_csr(transport: &Transport, paths: &CertPaths) -> Result<(), EnrollError> {
    let csr_bytes = fs::read(&paths.csr)?;
    let resp = transport.put("/csr", &csr_bytes).await?;
    match resp.outcome() {
        Outcome::Success => Ok(()),
        Outcome::NoConnection => Err(EnrollError::Transport(crate::error::TransportError::NoConnection)),
        _ => {
            tracing::warn!(status = %resp.status, "CSR submission rejected");
            Ok(())
        }
    }
}

/// One poll cycle against the fetch endpoint. Returns the three-way outcome
/// spec.md §4.4 describes; callers are expected to sleep ~10s and retry on
/// `NotYetSigned`/`Revoked`.
pub async fn poll_certificate(
    transport: &Transport,
    paths: &CertPaths,
) -> Result<FetchOutcome, EnrollError> {
    let resp = transport
        .get("/certificates/fetch")
        .await
        .map_err(EnrollError::Transport)?;

    if resp.outcome() != Outcome::Success {
        return Ok(FetchOutcome::NotYetSigned);
    }

    let parsed: serde_json::Value = serde_json::from_str(&resp.body).unwrap_or_default();
    match parsed.get("status").and_then(|v| v.as_str()) {
        Some("not_signed") => return Ok(FetchOutcome::NotYetSigned),
        Some("revoked") => {
            tracing::warn!("certificate has been revoked; waiting for a replacement");
            return Ok(FetchOutcome::Revoked);
        }
        _ => {}
    }

    let cert_pem = match parsed.get("certificate").and_then(|v| v.as_str()) {
        Some(pem) => pem.to_string(),
        None => return Ok(FetchOutcome::NotYetSigned),
    };

    if !modulus_matches(cert_pem.as_bytes(), &paths.key)? {
        tracing::warn!("fetched certificate modulus does not match the on-disk private key, rejecting");
        return Err(EnrollError::ModulusMismatch);
    }

    write_restricted(&paths.crt, cert_pem.as_bytes())?;
    Ok(FetchOutcome::Signed)
}

/// Spec.md P9: never install a certificate whose public modulus differs
/// from the on-disk private key's modulus.
fn modulus_matches(cert_pem: &[u8], key_path: &Path) -> Result<bool, EnrollError> {
    let cert = X509::from_pem(cert_pem)?;
    let cert_pubkey = cert.public_key()?;

    let key_pem = fs::read(key_path)?;
    let private_key: PKey<Private> = PKey::private_key_from_pem(&key_pem)?;

    let cert_rsa = cert_pubkey.rsa()?;
    let key_rsa = private_key.rsa()?;
    Ok(cert_rsa.n() == key_rsa.n())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn initialize_writes_key_and_csr_with_restricted_permissions() {
        let dir = TempDir::new().unwrap();
        let paths = CertPaths::new(dir.path());
        initialize(&paths, "test-host").unwrap();

        assert!(paths.key.exists());
        assert!(paths.csr.exists());
        assert!(!paths.enrolled());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&paths.key).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o400);
        }
    }

    #[test]
    fn modulus_matches_accepts_a_cert_issued_from_the_same_key() {
        let dir = TempDir::new().unwrap();
        let paths = CertPaths::new(dir.path());
        initialize(&paths, "test-host").unwrap();

        let key_pem = fs::read(&paths.key).unwrap();
        let key: PKey<Private> = PKey::private_key_from_pem(&key_pem).unwrap();

        let mut name_builder = X509Name::builder().unwrap();
        name_builder.append_entry_by_text("CN", "test-host").unwrap();
        let name = name_builder.build();

        let mut builder = X509::builder().unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder
            .set_not_before(&openssl::asn1::Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&openssl::asn1::Asn1Time::days_from_now(1).unwrap())
            .unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        let cert = builder.build();

        assert!(modulus_matches(&cert.to_pem().unwrap(), &paths.key).unwrap());
    }
}
