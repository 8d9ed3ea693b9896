//! Self-signed certificates laid out the way certbot writes them

use std::path::Path;

use sitehost_common::{FULLCHAIN_FILE, PRIVKEY_FILE};

#[derive(Clone)]
pub struct TestCertificate {
    pub names: Vec<String>,
    pub cert_pem: String,
    pub key_pem: String,
}

impl TestCertificate {
    /// Self-signed certificate covering `names`
    pub fn generate(names: &[&str]) -> Self {
        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        let certified = rcgen::generate_simple_self_signed(names.clone())
            .expect("Failed to generate test certificate");
        Self {
            names,
            cert_pem: certified.cert.pem(),
            key_pem: certified.signing_key.serialize_pem(),
        }
    }

    /// Certificate for `domain` and `www.<domain>`, as issued for a tenant
    pub fn for_domain(domain: &str) -> Self {
        let www = format!("www.{}", domain);
        Self::generate(&[domain, &www])
    }

    /// Write `<live_dir>/<name>/{fullchain,privkey}.pem`
    pub fn write_live(&self, live_dir: &Path, name: &str) -> std::io::Result<()> {
        let dir = live_dir.join(name);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(FULLCHAIN_FILE), &self.cert_pem)?;
        std::fs::write(dir.join(PRIVKEY_FILE), &self.key_pem)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_live_layout() {
        let dir = tempfile::tempdir().unwrap();
        let cert = TestCertificate::for_domain("shop.test");
        cert.write_live(dir.path(), "shop.test").unwrap();

        assert!(dir.path().join("shop.test").join(FULLCHAIN_FILE).exists());
        assert!(dir.path().join("shop.test").join(PRIVKEY_FILE).exists());
        assert_eq!(cert.names, vec!["shop.test", "www.shop.test"]);
    }
}
