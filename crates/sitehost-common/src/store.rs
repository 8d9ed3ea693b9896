use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;

use crate::tls::load_certified_key;
use crate::TlsError;

/// Certificate chain file inside each `<live_dir>/<domain>/` directory
pub const FULLCHAIN_FILE: &str = "fullchain.pem";
/// Private key file inside each `<live_dir>/<domain>/` directory
pub const PRIVKEY_FILE: &str = "privkey.pem";

/// SNI certificate store backed by a certbot-style live directory
///
/// Every `<live_dir>/<domain>/` holding a `fullchain.pem` and `privkey.pem`
/// serves `<domain>` and `www.<domain>`. Lookups fall back to a
/// `*.<parent>` entry and then to the default certificate, if any.
/// [`reload`](Self::reload) rescans the directory and swaps the table in
/// one step, so handshakes in flight never see a half-built map.
#[derive(Debug)]
pub struct CertificateStore {
    live_dir: PathBuf,
    certs: RwLock<HashMap<String, Arc<CertifiedKey>>>,
    /// Names registered through [`insert`](Self::insert); kept across reloads
    pinned: RwLock<HashMap<String, Arc<CertifiedKey>>>,
    fallback: RwLock<Option<Arc<CertifiedKey>>>,
}

impl CertificateStore {
    pub fn new(live_dir: impl Into<PathBuf>) -> Self {
        Self {
            live_dir: live_dir.into(),
            certs: RwLock::new(HashMap::new()),
            pinned: RwLock::new(HashMap::new()),
            fallback: RwLock::new(None),
        }
    }

    pub fn live_dir(&self) -> &Path {
        &self.live_dir
    }

    /// Certificate served when no name matches (e.g. the wildcard for the
    /// base domain)
    pub fn set_fallback(&self, key: CertifiedKey) {
        *self.fallback.write() = Some(Arc::new(key));
    }

    /// Register a certificate under an explicit name
    ///
    /// The name keeps this certificate across reloads, even if the live
    /// directory later holds one for the same name.
    pub fn insert(&self, name: &str, key: CertifiedKey) {
        let name = name.to_ascii_lowercase();
        let key = Arc::new(key);
        self.pinned.write().insert(name.clone(), key.clone());
        self.certs.write().insert(name, key);
    }

    /// Publish a freshly scanned table with the pinned names on top
    fn publish(&self, mut table: HashMap<String, Arc<CertifiedKey>>) {
        for (name, key) in self.pinned.read().iter() {
            table.insert(name.clone(), key.clone());
        }
        *self.certs.write() = table;
    }

    /// Rescan the live directory and return the number of certificates loaded
    ///
    /// A directory that fails to load is logged and skipped. A missing live
    /// directory yields an empty table.
    pub fn reload(&self) -> Result<usize, TlsError> {
        let mut table = HashMap::new();
        let mut loaded = 0;

        let entries = match std::fs::read_dir(&self.live_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    "Certificate directory {} does not exist",
                    self.live_dir.display()
                );
                self.publish(table);
                return Ok(0);
            }
            Err(source) => {
                return Err(TlsError::Io {
                    path: self.live_dir.clone(),
                    source,
                })
            }
        };

        for entry in entries.flatten() {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let Some(name) = dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let name = name.to_ascii_lowercase();

            let cert_path = dir.join(FULLCHAIN_FILE);
            let key_path = dir.join(PRIVKEY_FILE);
            if !cert_path.exists() || !key_path.exists() {
                continue;
            }

            match load_certified_key(&cert_path, &key_path) {
                Ok(key) => {
                    let key = Arc::new(key);
                    if !name.starts_with("www.") {
                        table.insert(format!("www.{}", name), key.clone());
                    }
                    table.insert(name, key);
                    loaded += 1;
                }
                Err(e) => {
                    tracing::warn!("Skipping certificate for {}: {}", name, e);
                }
            }
        }

        self.publish(table);
        tracing::info!(
            "Loaded {} certificate(s) from {}",
            loaded,
            self.live_dir.display()
        );
        Ok(loaded)
    }

    /// Find the certificate for a server name
    pub fn lookup(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
        let name = server_name.trim_end_matches('.').to_ascii_lowercase();
        let certs = self.certs.read();

        if let Some(key) = certs.get(&name) {
            return Some(key.clone());
        }
        if let Some((_, parent)) = name.split_once('.') {
            if let Some(key) = certs.get(&format!("*.{}", parent)) {
                return Some(key.clone());
            }
        }
        drop(certs);

        self.fallback.read().clone()
    }

    pub fn contains(&self, server_name: &str) -> bool {
        self.certs
            .read()
            .contains_key(&server_name.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.certs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.read().is_empty()
    }

    /// Build a rustls server config resolving certificates from this store
    pub fn server_config(self: &Arc<Self>) -> ServerConfig {
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(self.clone());
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        config
    }
}

impl ResolvesServerCert for CertificateStore {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        match client_hello.server_name() {
            Some(name) => {
                let key = self.lookup(name);
                if key.is_none() {
                    tracing::debug!("No certificate for SNI {}", name);
                }
                key
            }
            None => self.fallback.read().clone(),
        }
    }
}
