use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use rustls::ServerConfig;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),
    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),
    #[error("invalid certificate/key material: {0}")]
    Rustls(#[from] rustls::Error),
}

static GLOBAL_CACHE: Lazy<TlsConfigCache> = Lazy::new(TlsConfigCache::new);

/// Process-wide cache of TLS server configs, keyed by certificate/key paths.
/// Material is loaded once and shared across every listener and session that
/// names the same files. Tests construct their own cache instead of touching
/// the global one.
pub struct TlsConfigCache {
    configs: RwLock<HashMap<(PathBuf, PathBuf), Arc<ServerConfig>>>,
}

impl TlsConfigCache {
    pub fn new() -> Self {
        Self { configs: RwLock::new(HashMap::new()) }
    }

    pub fn global() -> &'static TlsConfigCache {
        &GLOBAL_CACHE
    }

    pub fn server_config(&self, cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>, TlsError> {
        let key = (cert_path.to_path_buf(), key_path.to_path_buf());
        if let Some(config) = self.configs.read().get(&key) {
            return Ok(Arc::clone(config));
        }

        let config = Arc::new(load_server_config(cert_path, key_path)?);
        // Two racing loaders may both build a config; first insert wins so all
        // later callers share one copy.
        let mut configs = self.configs.write();
        let entry = configs.entry(key).or_insert_with(|| Arc::clone(&config));
        Ok(Arc::clone(entry))
    }
}

impl Default for TlsConfigCache {
    fn default() -> Self {
        Self::new()
    }
}

fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<ServerConfig, TlsError> {
    let open = |path: &Path| {
        File::open(path).map(BufReader::new).map_err(|source| TlsError::Io { path: path.to_path_buf(), source })
    };

    let certs: Vec<_> = rustls_pemfile::certs(&mut open(cert_path)?)
        .collect::<Result<_, _>>()
        .map_err(|source| TlsError::Io { path: cert_path.to_path_buf(), source })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(cert_path.to_path_buf()));
    }

    let key = rustls_pemfile::private_key(&mut open(key_path)?)
        .map_err(|source| TlsError::Io { path: key_path.to_path_buf(), source })?
        .ok_or_else(|| TlsError::NoPrivateKey(key_path.to_path_buf()))?;

    Ok(ServerConfig::builder().with_no_client_auth().with_single_cert(certs, key)?)
}
