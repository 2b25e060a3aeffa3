//! Mutual TLS configuration from provisioned key files

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use serde::{Deserialize, Serialize};

use crate::errors::CommonError;

/// Locations of the provisioned PEM files
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthOptions {
    /// Skip client certificates entirely
    #[serde(default)]
    pub disabled: bool,

    #[serde(default)]
    pub private_key_path: PathBuf,

    #[serde(default)]
    pub certificate_path: PathBuf,

    /// CA signing the broker certificate. The system store is used when absent.
    #[serde(default)]
    pub ca_certificate_path: Option<PathBuf>,
}

impl AuthOptions {
    /// Fails when a key file required for authentication is missing
    pub fn check_key_files(&self) -> Result<(), CommonError> {
        if self.disabled {
            return Ok(());
        }
        for path in [&self.private_key_path, &self.certificate_path] {
            if path.as_os_str().is_empty() || !path.is_file() {
                return Err(CommonError::AuthError(format!(
                    "key file {} is missing",
                    path.display()
                )));
            }
        }
        if let Some(ca) = &self.ca_certificate_path {
            if !ca.is_file() {
                return Err(CommonError::AuthError(format!(
                    "CA certificate {} is missing",
                    ca.display()
                )));
            }
        }
        Ok(())
    }
}

/// Build the TLS client configuration, presenting the client certificate
/// unless authentication is disabled
pub fn tls_config(auth: &AuthOptions) -> Result<ClientConfig, CommonError> {
    auth.check_key_files()?;

    let mut roots = RootCertStore::empty();
    match &auth.ca_certificate_path {
        Some(ca_path) => {
            for cert in read_certs(ca_path)? {
                roots
                    .add(cert)
                    .map_err(|e| CommonError::AuthError(format!("invalid CA certificate: {}", e)))?;
            }
        }
        None => {
            for cert in rustls_native_certs::load_native_certs().unwrap_or_default() {
                let _ = roots.add(cert);
            }
        }
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    if auth.disabled {
        return Ok(builder.with_no_client_auth());
    }

    let certs = read_certs(&auth.certificate_path)?;
    let key = read_private_key(&auth.private_key_path)?;
    builder
        .with_client_auth_cert(certs, key)
        .map_err(|e| CommonError::AuthError(format!("invalid client certificate: {}", e)))
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, CommonError> {
    let pem = read_file(path)?;
    let certs = rustls_pemfile::certs(&mut Cursor::new(pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CommonError::AuthError(format!("{}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(CommonError::AuthError(format!(
            "{} contains no certificate",
            path.display()
        )));
    }
    Ok(certs)
}

fn read_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, CommonError> {
    let pem = read_file(path)?;
    rustls_pemfile::private_key(&mut Cursor::new(pem))
        .map_err(|e| CommonError::AuthError(format!("{}: {}", path.display(), e)))?
        .ok_or_else(|| {
            CommonError::AuthError(format!("{} contains no private key", path.display()))
        })
}

fn read_file(path: &Path) -> Result<Vec<u8>, CommonError> {
    fs::read(path).map_err(|e| CommonError::AuthError(format!("{}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key_files_are_fatal() {
        let auth = AuthOptions {
            disabled: false,
            private_key_path: PathBuf::from("/nonexistent/agent.key"),
            certificate_path: PathBuf::from("/nonexistent/agent.crt"),
            ca_certificate_path: None,
        };
        assert!(matches!(
            auth.check_key_files(),
            Err(CommonError::AuthError(_))
        ));
        assert!(tls_config(&auth).is_err());
    }

    #[test]
    fn test_disabled_auth_needs_no_files() {
        let auth = AuthOptions {
            disabled: true,
            ..Default::default()
        };
        assert!(auth.check_key_files().is_ok());
        assert!(tls_config(&auth).is_ok());
    }

    #[test]
    fn test_files_without_pem_blocks_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("agent.key");
        let cert = dir.path().join("agent.crt");
        std::fs::write(&key, b"not a key").unwrap();
        std::fs::write(&cert, b"not a cert").unwrap();

        let auth = AuthOptions {
            disabled: false,
            private_key_path: key,
            certificate_path: cert,
            ca_certificate_path: None,
        };
        assert!(auth.check_key_files().is_ok());
        assert!(matches!(tls_config(&auth), Err(CommonError::AuthError(_))));
    }
}
