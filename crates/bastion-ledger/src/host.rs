use base64::Engine;
use bastion_types::PublicHostKey;
use sha2::{Digest, Sha256};

/// Normalize a remote address into its ledger pattern.
///
/// Port 22 is implied (`host`); any other port is spelled `[host]:port`,
/// which is how OpenSSH writes known_hosts entries.
pub fn normalize(host: &str, port: u16) -> String {
    let host = host
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase();

    if port == 22 {
        host
    } else {
        format!("[{host}]:{port}")
    }
}

/// OpenSSH-style `SHA256:<base64>` fingerprint of a public key blob.
pub fn fingerprint(key: &PublicHostKey) -> String {
    let digest = Sha256::digest(&key.public_key);
    format!(
        "SHA256:{}",
        base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest)
    )
}
