//! Self-signed test PKI: one CA, one server identity and one client
//! identity.

use std::{fs, path::Path};

use mtrpc::{Error, ErrorKind, Result};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair,
};

#[derive(Debug, Clone)]
pub struct TestPki {
    pub ca_pem: String,
    pub server_pem: String,
    pub server_key: String,
    pub client_pem: String,
    pub client_key: String,
}

fn cert_error(e: rcgen::Error) -> Error {
    Error::new(ErrorKind::Credential, format!("certificate generation failed: {e}"))
}

fn params(common_name: &str, sans: Vec<String>) -> Result<CertificateParams> {
    let mut params = CertificateParams::new(sans).map_err(cert_error)?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;
    Ok(params)
}

fn issue(
    common_name: &str,
    sans: Vec<String>,
    usage: ExtendedKeyUsagePurpose,
    ca: &Certificate,
    ca_key: &KeyPair,
) -> Result<(String, String)> {
    let mut params = params(common_name, sans)?;
    params.extended_key_usages = vec![usage];
    let key = KeyPair::generate().map_err(cert_error)?;
    let cert = params.signed_by(&key, ca, ca_key).map_err(cert_error)?;
    Ok((cert.pem(), key.serialize_pem()))
}

/// Generates a CA plus a server certificate valid for `server_names` and a
/// client certificate, both signed by that CA.
///
/// # Errors
///
/// Returns `Credential` if key or certificate generation fails.
pub fn generate(server_names: &[&str]) -> Result<TestPki> {
    let mut ca_params = params("mtrpc demo CA", vec![])?;
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca_key = KeyPair::generate().map_err(cert_error)?;
    let ca = ca_params.self_signed(&ca_key).map_err(cert_error)?;

    let sans = server_names.iter().map(|s| s.to_string()).collect();
    let (server_pem, server_key) = issue(
        "mtrpc demo server",
        sans,
        ExtendedKeyUsagePurpose::ServerAuth,
        &ca,
        &ca_key,
    )?;
    let (client_pem, client_key) = issue(
        "mtrpc demo client",
        vec!["client".to_string()],
        ExtendedKeyUsagePurpose::ClientAuth,
        &ca,
        &ca_key,
    )?;

    Ok(TestPki {
        ca_pem: ca.pem(),
        server_pem,
        server_key,
        client_pem,
        client_key,
    })
}

impl TestPki {
    /// Writes the PKI below `dir`:
    /// `ca.pem`, `server/server.{pem,key}` and `client/client.{pem,key}`.
    ///
    /// # Errors
    ///
    /// Returns `Credential` if a directory or file cannot be written.
    pub fn write_to(&self, dir: &Path) -> Result<()> {
        let files = [
            ("ca.pem", &self.ca_pem),
            ("server/server.pem", &self.server_pem),
            ("server/server.key", &self.server_key),
            ("client/client.pem", &self.client_pem),
            ("client/client.key", &self.client_key),
        ];
        for (name, content) in files {
            let path = dir.join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| write_error(parent, &e))?;
            }
            fs::write(&path, content).map_err(|e| write_error(&path, &e))?;
        }
        Ok(())
    }
}

fn write_error(path: &Path, e: &std::io::Error) -> Error {
    Error::new(
        ErrorKind::Credential,
        format!("failed to write {}: {e}", path.display()),
    )
}
