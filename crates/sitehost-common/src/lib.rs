//! Shared TLS plumbing for sitehost

mod error;
mod store;
mod tls;

pub use error::TlsError;
pub use store::{CertificateStore, FULLCHAIN_FILE, PRIVKEY_FILE};
pub use tls::{
    certified_key, load_certified_key, load_certified_key_from_pem, load_certs,
    load_certs_from_pem, load_private_key, load_private_key_from_pem,
};

// Re-export so dependents share one rustls version
pub use rustls;
pub use tokio_rustls;
