//! Credential bundle generation.
//!
//! Produces a self-signed CA ("CertAuth") plus a server certificate
//! ("Server", valid for the `buildfarm-server` DNS name) and a client
//! certificate ("Client"), both signed by the CA. Keys are PKCS#8 PEM.

use std::path::{Path, PathBuf};

use bf_core::{CredentialBundle, SERVER_TLS_NAME};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use time::{Duration, OffsetDateTime};
use tracing::info;

use crate::error::{AuthError, AuthResult};

/// Name of the full bundle inside an output folder.
pub const BUNDLE_FILE: &str = "bundle.json";

const CA_VALIDITY: Duration = Duration::days(10 * 365);

/// Lifetime of the server and client certificates.
const LEAF_VALIDITY: Duration = Duration::days(2 * 365);

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "Build Farm");
    dn.push(DnType::CommonName, common_name);
    dn
}

fn ca_params(now: OffsetDateTime) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.distinguished_name = distinguished_name("CertAuth");
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params.not_before = now;
    params.not_after = now + CA_VALIDITY;
    params
}

fn leaf_params(
    common_name: &str,
    dns_names: Vec<String>,
    purpose: ExtendedKeyUsagePurpose,
    now: OffsetDateTime,
) -> AuthResult<CertificateParams> {
    let mut params = CertificateParams::new(dns_names)?;
    params.distinguished_name = distinguished_name(common_name);
    params.extended_key_usages = vec![purpose];
    params.not_before = now;
    params.not_after = now + LEAF_VALIDITY;
    Ok(params)
}

fn generate_ca(now: OffsetDateTime) -> AuthResult<(Certificate, KeyPair)> {
    let key = KeyPair::generate()?;
    let cert = ca_params(now).self_signed(&key)?;
    Ok((cert, key))
}

fn generate_leaf(
    common_name: &str,
    dns_names: Vec<String>,
    purpose: ExtendedKeyUsagePurpose,
    now: OffsetDateTime,
    ca: &Certificate,
    ca_key: &KeyPair,
) -> AuthResult<(Certificate, KeyPair)> {
    let key = KeyPair::generate()?;
    let cert = leaf_params(common_name, dns_names, purpose, now)?.signed_by(&key, ca, ca_key)?;
    Ok((cert, key))
}

/// Generate a fresh CA, server and client credential set.
pub fn generate_bundle() -> AuthResult<CredentialBundle> {
    let now = OffsetDateTime::now_utc();
    let (ca, ca_key) = generate_ca(now)?;
    let (server, server_key) = generate_leaf(
        "Server",
        vec![SERVER_TLS_NAME.to_string()],
        ExtendedKeyUsagePurpose::ServerAuth,
        now,
        &ca,
        &ca_key,
    )?;
    let (client, client_key) = generate_leaf(
        "Client",
        Vec::new(),
        ExtendedKeyUsagePurpose::ClientAuth,
        now,
        &ca,
        &ca_key,
    )?;
    info!("generated credential bundle");

    Ok(CredentialBundle {
        ca_crt: ca.pem(),
        client_crt: client.pem(),
        client_pkcs8_key: client_key.serialize_pem(),
        server_crt: server.pem(),
        server_pkcs8_key: server_key.serialize_pem(),
    })
}

/// Write every bundle member plus the JSON bundle into `dir`.
pub fn write_folder(bundle: &CredentialBundle, dir: &Path) -> AuthResult<Vec<PathBuf>> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| AuthError::Io { path, source }
    };
    std::fs::create_dir_all(dir).map_err(io_err(dir))?;

    let json = serde_json::to_string_pretty(bundle)?;
    let files = [
        ("ca.crt", bundle.ca_crt.as_str()),
        ("client.crt", bundle.client_crt.as_str()),
        ("client.pkcs8.key", bundle.client_pkcs8_key.as_str()),
        ("server.crt", bundle.server_crt.as_str()),
        ("server.pkcs8.key", bundle.server_pkcs8_key.as_str()),
        (BUNDLE_FILE, json.as_str()),
    ];

    let mut written = Vec::with_capacity(files.len());
    for (name, content) in files {
        let path = dir.join(name);
        std::fs::write(&path, content).map_err(io_err(&path))?;
        written.push(path);
    }
    info!(dir = %dir.display(), files = written.len(), "credential folder written");
    Ok(written)
}
