// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//! TLS helpers: a certificate watcher that reloads the server key pair when
//! the files on disk change, and CA bundle loading for the health check dial.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::SystemTime;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::CertificateDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use thiserror::Error;
use tracing::{debug, error, info, warn};

const CERT_FILE_NAME: &str = "server.crt";
const KEY_FILE_NAME: &str = "server.key";

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to load server key pair from {cert_path:?} and {key_path:?}: {reason}")]
    LoadKeypair {
        cert_path: PathBuf,
        key_path: PathBuf,
        reason: String,
    },
    #[error("failed to stat certificate files")]
    Stat(#[source] std::io::Error),
    #[error("failed to read CA certificate {path:?}: {reason}")]
    ReadCa { path: PathBuf, reason: String },
}

/// Watches `server.crt` and `server.key` in a directory and reloads them
/// when either file's modification time advances.
///
/// The check runs inside the TLS certificate callback, so every new
/// handshake sees the latest key pair without any background task. The pair
/// is parsed as a unit and swapped atomically; a pair that fails to parse is
/// logged and the previous one keeps serving.
#[derive(Debug)]
pub struct CertWatcher {
    cert_path: PathBuf,
    key_path: PathBuf,
    state: RwLock<WatcherState>,
}

#[derive(Debug)]
struct WatcherState {
    cert: Arc<CertifiedKey>,
    mod_time: SystemTime,
}

impl CertWatcher {
    /// Creates a watcher over `<cert_dir>/server.crt` and
    /// `<cert_dir>/server.key`. The initial load must succeed.
    pub fn new(cert_dir: &Path) -> Result<Self, TlsError> {
        let cert_path = cert_dir.join(CERT_FILE_NAME);
        let key_path = cert_dir.join(KEY_FILE_NAME);

        let cert = Arc::new(load_certified_key(&cert_path, &key_path)?);
        let mod_time = latest_mod_time(&cert_path, &key_path)?;

        info!(
            cert_file = %cert_path.display(),
            key_file = %key_path.display(),
            "certificate watcher initialized"
        );

        Ok(Self {
            cert_path,
            key_path,
            state: RwLock::new(WatcherState { cert, mod_time }),
        })
    }

    /// Builds a rustls server config whose certificate callback consults
    /// this watcher on every handshake.
    pub fn server_config(self: &Arc<Self>) -> rustls::ServerConfig {
        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::clone(self) as Arc<dyn ResolvesServerCert>);
        config.alpn_protocols = vec![b"h2".to_vec()];
        config
    }

    /// The currently loaded key pair.
    pub fn current(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.read_state().cert)
    }

    /// Reloads the key pair if either file changed on disk. Keeps the
    /// previous pair when the new one fails to parse or stat fails.
    fn maybe_reload(&self) {
        let mod_time = match latest_mod_time(&self.cert_path, &self.key_path) {
            Ok(mod_time) => mod_time,
            Err(err) => {
                warn!(error = %err, "failed to stat certificate files");
                return;
            }
        };

        if mod_time <= self.read_state().mod_time {
            return;
        }

        debug!(
            cert_file = %self.cert_path.display(),
            "certificate file changed, reloading"
        );
        match load_certified_key(&self.cert_path, &self.key_path) {
            Ok(cert) => {
                let mut state = self
                    .state
                    .write()
                    .unwrap_or_else(PoisonError::into_inner);
                state.cert = Arc::new(cert);
                state.mod_time = mod_time;
                info!(cert_file = %self.cert_path.display(), "certificate reloaded");
            }
            Err(err) => {
                error!(error = %err, "failed to reload certificate, keeping previous");
            }
        }
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, WatcherState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ResolvesServerCert for CertWatcher {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.maybe_reload();
        Some(self.current())
    }
}

/// Most recent modification time of the cert and key files.
fn latest_mod_time(cert_path: &Path, key_path: &Path) -> Result<SystemTime, TlsError> {
    let cert_mod = std::fs::metadata(cert_path)
        .and_then(|meta| meta.modified())
        .map_err(TlsError::Stat)?;
    let key_mod = std::fs::metadata(key_path)
        .and_then(|meta| meta.modified())
        .map_err(TlsError::Stat)?;
    Ok(cert_mod.max(key_mod))
}

/// Loads and pairs the certificate chain and private key.
fn load_certified_key(cert_path: &Path, key_path: &Path) -> Result<CertifiedKey, TlsError> {
    let keypair_error = |reason: String| TlsError::LoadKeypair {
        cert_path: cert_path.to_path_buf(),
        key_path: key_path.to_path_buf(),
        reason,
    };

    let cert_file = File::open(cert_path).map_err(|err| keypair_error(err.to_string()))?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| keypair_error(err.to_string()))?;
    if certs.is_empty() {
        return Err(keypair_error("no certificates found".to_string()));
    }

    let key_file = File::open(key_path).map_err(|err| keypair_error(err.to_string()))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|err| keypair_error(err.to_string()))?
        .ok_or_else(|| keypair_error("no private key found".to_string()))?;

    let provider = CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()));
    let signing_key = provider
        .key_provider
        .load_private_key(key)
        .map_err(|err| keypair_error(format!("unusable private key: {err}")))?;

    Ok(CertifiedKey::new(certs, signing_key))
}

/// Reads a CA bundle and checks it contains at least one certificate.
pub fn read_ca(path: &Path) -> Result<Vec<u8>, TlsError> {
    let ca_error = |reason: String| TlsError::ReadCa {
        path: path.to_path_buf(),
        reason,
    };

    let pem = std::fs::read(path).map_err(|err| ca_error(err.to_string()))?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| ca_error(err.to_string()))?;
    if certs.is_empty() {
        return Err(ca_error("no certificates found".to_string()));
    }
    Ok(pem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn write_keypair(dir: &Path) -> Vec<u8> {
        let generated =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        std::fs::write(dir.join(CERT_FILE_NAME), generated.cert.pem()).unwrap();
        std::fs::write(dir.join(KEY_FILE_NAME), generated.key_pair.serialize_pem()).unwrap();
        generated.cert.der().to_vec()
    }

    fn served_leaf(watcher: &CertWatcher) -> Vec<u8> {
        watcher.maybe_reload();
        watcher.current().cert[0].to_vec()
    }

    #[test]
    fn test_initial_load_requires_valid_pair() {
        let dir = tempfile::tempdir().unwrap();
        assert!(CertWatcher::new(dir.path()).is_err());

        let leaf = write_keypair(dir.path());
        let watcher = CertWatcher::new(dir.path()).unwrap();
        assert_eq!(watcher.current().cert[0].to_vec(), leaf);
    }

    #[test]
    fn test_rotation_serves_the_new_pair() {
        let dir = tempfile::tempdir().unwrap();
        let first_leaf = write_keypair(dir.path());
        let watcher = CertWatcher::new(dir.path()).unwrap();
        assert_eq!(served_leaf(&watcher), first_leaf);

        // The watcher compares mtimes, so the rewrite must land on a later
        // timestamp than the original pair.
        std::thread::sleep(Duration::from_millis(25));
        let second_leaf = write_keypair(dir.path());
        assert_ne!(first_leaf, second_leaf);

        assert_eq!(served_leaf(&watcher), second_leaf);
    }

    #[test]
    fn test_malformed_pair_keeps_previous_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let leaf = write_keypair(dir.path());
        let watcher = CertWatcher::new(dir.path()).unwrap();
        assert_eq!(served_leaf(&watcher), leaf);

        std::thread::sleep(Duration::from_millis(25));
        std::fs::write(dir.path().join(KEY_FILE_NAME), "not a key").unwrap();

        assert_eq!(served_leaf(&watcher), leaf);

        // A later valid pair recovers.
        std::thread::sleep(Duration::from_millis(25));
        let recovered_leaf = write_keypair(dir.path());
        assert_eq!(served_leaf(&watcher), recovered_leaf);
    }

    #[test]
    fn test_missing_files_keep_previous_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let leaf = write_keypair(dir.path());
        let watcher = CertWatcher::new(dir.path()).unwrap();

        std::fs::remove_file(dir.path().join(CERT_FILE_NAME)).unwrap();
        assert_eq!(served_leaf(&watcher), leaf);
    }

    #[test]
    fn test_read_ca() {
        let dir = tempfile::tempdir().unwrap();
        let ca_path = dir.path().join("ca.crt");

        assert!(read_ca(&ca_path).is_err());

        std::fs::write(&ca_path, "not a certificate").unwrap();
        assert!(read_ca(&ca_path).is_err());

        let generated =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        std::fs::write(&ca_path, generated.cert.pem()).unwrap();
        assert!(read_ca(&ca_path).is_ok());
    }
}
