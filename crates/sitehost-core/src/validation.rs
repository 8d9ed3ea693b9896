//! Hostname and subdomain label validation
//!
//! Every host string that reaches a registry lookup or a subprocess argument
//! goes through these checks first. They never panic and never allocate.

/// Maximum length of a full hostname
pub const MAX_HOSTNAME_LEN: usize = 253;

/// Maximum length of a single DNS label
pub const MAX_LABEL_LEN: usize = 63;

/// Hosts that are allowed even though they would fail the grammar checks
const LOOPBACK_HOSTS: [&str; 2] = ["localhost", "127.0.0.1"];

/// Validate a full hostname (already lower-cased, without port)
///
/// Returns false when the host:
/// - is empty or longer than 253 bytes
/// - contains CR, LF or NUL
/// - is not 7-bit ASCII
/// - does not match `label("."label)*` (RFC 1123, lower case)
/// - consists only of digits and dots, unless it is `127.0.0.1`
pub fn validate_hostname(raw: &str) -> bool {
    if raw.is_empty() || raw.len() > MAX_HOSTNAME_LEN {
        return false;
    }
    if has_unsafe_bytes(raw) || !raw.is_ascii() {
        return false;
    }
    if LOOPBACK_HOSTS.contains(&raw) {
        return true;
    }

    // Bare IPs are never tenant hosts
    if raw.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
        return false;
    }

    raw.split('.').all(is_rfc1123_label)
}

/// Validate a single subdomain label such as `acme` in `acme.example.com`
pub fn validate_subdomain_label(raw: &str) -> bool {
    if raw.is_empty() || raw.len() > MAX_LABEL_LEN {
        return false;
    }
    if has_unsafe_bytes(raw) || !raw.is_ascii() {
        return false;
    }
    is_rfc1123_label(raw)
}

fn has_unsafe_bytes(raw: &str) -> bool {
    raw.bytes().any(|b| b.is_ascii_control() || b == b' ')
}

/// `[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?`
fn is_rfc1123_label(label: &str) -> bool {
    let bytes = label.as_bytes();
    let (Some(&first), Some(&last)) = (bytes.first(), bytes.last()) else {
        return false;
    };

    bytes.len() <= MAX_LABEL_LEN
        && is_label_char(first)
        && is_label_char(last)
        && bytes.iter().all(|&b| is_label_char(b) || b == b'-')
}

fn is_label_char(b: u8) -> bool {
    b.is_ascii_lowercase() || b.is_ascii_digit()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_hostnames() {
        assert!(validate_hostname("example.com"));
        assert!(validate_hostname("www.my-shop.com.br"));
        assert!(validate_hostname("a.b.c.d.e"));
        assert!(validate_hostname("localhost"));
        assert!(validate_hostname("127.0.0.1"));
        assert!(validate_hostname("x1.test"));
        assert!(validate_hostname(&format!("{}.com", "a".repeat(63))));
    }

    #[test]
    fn test_injection_bytes_rejected() {
        for host in [
            "example.com\r",
            "example.com\n",
            "exa\r\nmple.com",
            "example\0.com",
            "\nexample.com",
        ] {
            assert!(!validate_hostname(host), "accepted {:?}", host);
            assert!(!validate_subdomain_label(host), "accepted {:?}", host);
        }
    }

    #[test]
    fn test_non_ascii_rejected() {
        assert!(!validate_hostname("exämple.com"));
        assert!(!validate_hostname("аpple.com")); // Cyrillic 'а'
        assert!(!validate_subdomain_label("café"));
    }

    #[test]
    fn test_bare_ips_rejected() {
        assert!(!validate_hostname("10.0.0.1"));
        assert!(!validate_hostname("192.168.1.1"));
        assert!(!validate_hostname("12345"));
        assert!(!validate_hostname("127.0.0.2"));
    }

    #[test]
    fn test_grammar_violations() {
        assert!(!validate_hostname(""));
        assert!(!validate_hostname("example..com"));
        assert!(!validate_hostname(".example.com"));
        assert!(!validate_hostname("example.com."));
        assert!(!validate_hostname("-example.com"));
        assert!(!validate_hostname("example-.com"));
        assert!(!validate_hostname("exa_mple.com"));
        assert!(!validate_hostname("Example.com"));
        assert!(!validate_hostname("example.com:8080"));
        assert!(!validate_hostname(&format!("{}.com", "a".repeat(64))));
    }

    #[test]
    fn test_hostname_length_limit() {
        // 4 * 63 + 3 dots = 255
        let long = vec!["a".repeat(63); 4].join(".");
        assert!(!validate_hostname(&long));

        // 3 * 63 + 61 + 3 dots = 253
        let max = format!("{}.{}", vec!["a".repeat(63); 3].join("."), "b".repeat(61));
        assert_eq!(max.len(), 253);
        assert!(validate_hostname(&max));
    }

    #[test]
    fn test_valid_labels() {
        assert!(validate_subdomain_label("acme"));
        assert!(validate_subdomain_label("my-shop"));
        assert!(validate_subdomain_label("a"));
        assert!(validate_subdomain_label("123"));
        assert!(validate_subdomain_label("a-b-c-1"));
        assert!(validate_subdomain_label(&"a".repeat(63)));
    }

    #[test]
    fn test_invalid_labels() {
        assert!(!validate_subdomain_label(""));
        assert!(!validate_subdomain_label("-abc"));
        assert!(!validate_subdomain_label("abc-"));
        assert!(!validate_subdomain_label(&"a".repeat(64)));
        assert!(!validate_subdomain_label("my_shop"));
        assert!(!validate_subdomain_label("my.shop"));
        assert!(!validate_subdomain_label("Shop"));
    }
}
