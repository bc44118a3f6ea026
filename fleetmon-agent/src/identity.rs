//! Stable machine identity derived from hostname and logged-in user.
//!
//! The identity is embedded in URL paths on the server side, so it must
//! never contain path separators.

use gethostname::gethostname;

/// Derive the machine identity for this host, `hostname-username`.
pub fn machine_id() -> String {
    let hostname = gethostname().to_string_lossy().to_string();
    let hostname = if hostname.is_empty() {
        "unknown-host".to_string()
    } else {
        hostname
    };

    machine_id_from_parts(&hostname, &current_username())
}

/// Compose and sanitize an identity from raw hostname and username.
///
/// Windows domain accounts come as `DOMAIN\user`; only the account part
/// is kept. Any remaining `\` or `/` is replaced so the result is safe
/// inside a URL path segment.
pub fn machine_id_from_parts(hostname: &str, username: &str) -> String {
    let username = username.rsplit('\\').next().unwrap_or(username);

    format!("{hostname}-{username}")
        .replace('\\', "-")
        .replace('/', "-")
}

fn current_username() -> String {
    std::env::var("USERNAME")
        .or_else(|_| std::env::var("USER"))
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown-user".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_identity() {
        assert_eq!(machine_id_from_parts("lab-pc-07", "student"), "lab-pc-07-student");
    }

    #[test]
    fn test_domain_prefix_is_stripped() {
        assert_eq!(machine_id_from_parts("lab-pc-07", "CORP\\jdoe"), "lab-pc-07-jdoe");
    }

    #[test]
    fn test_separators_are_sanitized() {
        let id = machine_id_from_parts("weird/host", "strange\\user\\name");
        assert!(!id.contains('/'));
        assert!(!id.contains('\\'));
        assert_eq!(id, "weird-host-name");
    }

    #[test]
    fn test_live_identity_is_url_path_safe() {
        let id = machine_id();
        assert!(!id.is_empty());
        assert!(!id.contains('/'));
        assert!(!id.contains('\\'));
    }
}
