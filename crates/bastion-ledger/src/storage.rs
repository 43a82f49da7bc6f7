use base64::Engine;
use bastion_types::HostKeyRecord;
use fd_lock::RwLock;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::LedgerError;

type HmacSha1 = Hmac<Sha1>;

/// Prefix of an OpenSSH hashed host field (`|1|<salt>|<hash>`).
const HASH_MAGIC: &str = "|1|";

/// Default ledger path: ~/.ssh/known_hosts
pub fn default_ledger_path() -> PathBuf {
    let home = ["HOME", "USERPROFILE"]
        .into_iter()
        .filter_map(std::env::var_os)
        .find(|h| !h.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    home.join(".ssh").join("known_hosts")
}

/// Ensure the ledger directory exists (created 0700 on unix).
pub fn ensure_ledger_dir(path: &Path) -> Result<(), LedgerError> {
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(());
    };
    if parent.exists() {
        return Ok(());
    }

    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder
        .create(parent)
        .map_err(|e| LedgerError::Io(format!("failed to create ledger directory: {e}")))
}

/// Open the ledger for reading and appending, creating it 0600 if absent.
/// Never truncates.
pub fn open_for_append(path: &Path) -> Result<File, LedgerError> {
    ensure_ledger_dir(path)?;

    let mut options = OpenOptions::new();
    options.read(true).append(true).create(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options
        .open(path)
        .map_err(|e| LedgerError::Io(format!("failed to open ledger file: {e}")))
}

/// Load all records with a shared lock. A missing file is an empty ledger.
pub fn load_records(path: &Path) -> Result<Vec<HostKeyRecord>, LedgerError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(LedgerError::Io(format!("failed to open ledger file: {e}"))),
    };

    let lock = RwLock::new(file);
    let guard = lock
        .read()
        .map_err(|e| LedgerError::Io(format!("failed to acquire read lock: {e}")))?;

    let mut reader: &File = &guard;
    let mut buf = Vec::new();
    reader
        .read_to_end(&mut buf)
        .map_err(|e| LedgerError::Io(format!("failed to read ledger file: {e}")))?;

    Ok(parse_records(&String::from_utf8_lossy(&buf)))
}

/// Read every record from an already-locked file, from the start.
pub(crate) fn read_locked(file: &mut File) -> Result<Vec<HostKeyRecord>, LedgerError> {
    file.seek(SeekFrom::Start(0))
        .map_err(|e| LedgerError::Io(format!("failed to seek ledger file: {e}")))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)
        .map_err(|e| LedgerError::Io(format!("failed to read ledger file: {e}")))?;
    Ok(parse_records(&String::from_utf8_lossy(&buf)))
}

/// Append one record to an already-locked file opened in append mode.
pub(crate) fn append_locked(file: &mut File, record: &HostKeyRecord) -> Result<(), LedgerError> {
    let mut line = String::new();

    // Keep the new record on its own line if the file lacks a trailing newline
    let len = file
        .metadata()
        .map_err(|e| LedgerError::Io(format!("failed to stat ledger file: {e}")))?
        .len();
    if len > 0 {
        let mut last = [0u8; 1];
        file.seek(SeekFrom::End(-1))
            .and_then(|_| file.read_exact(&mut last))
            .map_err(|e| LedgerError::Io(format!("failed to read ledger file: {e}")))?;
        if last[0] != b'\n' {
            line.push('\n');
        }
    }

    line.push_str(&format_line(record));
    line.push('\n');

    file.write_all(line.as_bytes())
        .map_err(|e| LedgerError::Io(format!("failed to write ledger entry: {e}")))?;
    file.sync_data()
        .map_err(|e| LedgerError::Io(format!("failed to sync ledger file: {e}")))?;

    Ok(())
}

/// Append a record under an exclusive lock.
pub fn append_record(path: &Path, record: &HostKeyRecord) -> Result<(), LedgerError> {
    let file = open_for_append(path)?;
    let mut lock = RwLock::new(file);
    let mut guard = lock
        .write()
        .map_err(|e| LedgerError::Io(format!("failed to acquire write lock: {e}")))?;
    append_locked(&mut guard, record)
}

// ── Line format ──────────────────────────────────────────────────
//
// `<patterns> <key-type> <base64-blob> [comment]`, as in OpenSSH
// known_hosts. The host field is a pattern list or a hashed name
// (`|1|salt|hash`). Marker lines (`@revoked`, `@cert-authority`) are kept
// on disk but never parsed into records.

pub fn format_line(record: &HostKeyRecord) -> String {
    let blob = base64::engine::general_purpose::STANDARD.encode(&record.public_key);
    format!("{} {} {}", record.host_pattern, record.key_type, blob)
}

pub fn parse_line(line: &str) -> Option<HostKeyRecord> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with('@') {
        return None;
    }

    let mut fields = line.split_whitespace();
    let host_pattern = fields.next()?;
    let key_type = fields.next()?;
    let blob = fields.next()?;

    let public_key = base64::engine::general_purpose::STANDARD
        .decode(blob)
        .ok()?;

    Some(HostKeyRecord {
        host_pattern: host_pattern.to_string(),
        key_type: key_type.to_string(),
        public_key,
    })
}

pub fn parse_records(contents: &str) -> Vec<HostKeyRecord> {
    contents.lines().filter_map(parse_line).collect()
}

/// True if a record's host field names `host_pattern`.
///
/// A hashed field matches when its HMAC-SHA1 of `host_pattern` agrees.
/// Otherwise the field is a comma-separated list of patterns with `*` and
/// `?` wildcards, compared case-insensitively. A matching `!pattern`
/// excludes the host even if another element matches.
pub fn pattern_matches(field: &str, host_pattern: &str) -> bool {
    if let Some(hashed) = field.strip_prefix(HASH_MAGIC) {
        return hashed_matches(hashed, host_pattern);
    }

    let host = host_pattern.to_ascii_lowercase();
    let mut matched = false;
    for pattern in field.split(',') {
        let pattern = pattern.to_ascii_lowercase();
        match pattern.strip_prefix('!') {
            Some(negated) if wildcard_match(negated, &host) => return false,
            Some(_) => {}
            None => matched |= wildcard_match(&pattern, &host),
        }
    }
    matched
}

fn hashed_matches(salt_and_hash: &str, host_pattern: &str) -> bool {
    let engine = base64::engine::general_purpose::STANDARD;
    let Some((salt, hash)) = salt_and_hash.split_once('|') else {
        return false;
    };
    let (Ok(salt), Ok(hash)) = (engine.decode(salt), engine.decode(hash)) else {
        return false;
    };
    let Ok(mut mac) = HmacSha1::new_from_slice(&salt) else {
        return false;
    };
    mac.update(host_pattern.as_bytes());
    mac.verify_slice(&hash).is_ok()
}

/// Glob match where `*` spans any run of characters and `?` exactly one.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let (p, t) = (pattern.as_bytes(), text.as_bytes());
    let (mut pi, mut ti) = (0, 0);
    // last `*` seen, and the text position it is currently absorbing up to
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == b'?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == b'*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((star_pi, star_ti)) = star {
            pi = star_pi + 1;
            ti = star_ti + 1;
            star = Some((star_pi, ti));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == b'*')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pattern: &str, blob: &[u8]) -> HostKeyRecord {
        HostKeyRecord {
            host_pattern: pattern.to_string(),
            key_type: "ssh-ed25519".to_string(),
            public_key: blob.to_vec(),
        }
    }

    #[test]
    fn test_format_and_parse_line() {
        let rec = record("[db.example.com]:2222", &[1, 2, 3, 4]);
        let line = format_line(&rec);
        assert_eq!(line, "[db.example.com]:2222 ssh-ed25519 AQIDBA==");
        assert_eq!(parse_line(&line), Some(rec));
    }

    #[test]
    fn test_parse_skips_non_records() {
        let contents = "\
# comment
|1|F1E1KeoE/eEWhi10WpGv4OdiO6Y=|3988QV0VE8wmZL7suNrYQLITLCg= ssh-ed25519 AQID
@revoked * ssh-ed25519 AQID

bastion ssh-ed25519 !!!not-base64!!!
bastion ssh-ed25519
bastion ssh-rsa AQID some comment
";
        let records = parse_records(contents);
        assert_eq!(records.len(), 2);
        assert!(records[0].host_pattern.starts_with("|1|"));
        assert_eq!(records[1].host_pattern, "bastion");
        assert_eq!(records[1].key_type, "ssh-rsa");
    }

    #[test]
    fn test_pattern_list_matching() {
        assert!(pattern_matches("bastion,10.0.0.1", "10.0.0.1"));
        assert!(pattern_matches("bastion", "bastion"));
        assert!(pattern_matches("Bastion", "bastion"));
        assert!(!pattern_matches("bastion.example.com", "bastion"));
    }

    #[test]
    fn test_hashed_host_matching() {
        // HMAC-SHA1 of the host under salt 0x01..0x14, as `ssh-keygen -H` writes it
        let bastion = "|1|AQIDBAUGBwgJCgsMDQ4PEBESExQ=|5M2EcqVipHc15iLYNqxcQNAMJZQ=";
        assert!(pattern_matches(bastion, "bastion"));
        assert!(!pattern_matches(bastion, "bastion2"));
        assert!(!pattern_matches(bastion, "[bastion]:2222"));

        let with_port = "|1|AQIDBAUGBwgJCgsMDQ4PEBESExQ=|W+WPlbJHc1NUzeF6V3FgtO0kAtQ=";
        assert!(pattern_matches(with_port, "[10.0.0.7]:2222"));

        assert!(!pattern_matches("|1|not base64|AQID", "bastion"));
        assert!(!pattern_matches("|1|AQID", "bastion"));
    }

    #[test]
    fn test_wildcard_and_negated_patterns() {
        assert!(pattern_matches("*.corp.example", "jump.corp.example"));
        assert!(!pattern_matches("*.corp.example", "corp.example"));
        assert!(pattern_matches("db-?", "db-7"));
        assert!(!pattern_matches("db-?", "db-17"));
        assert!(pattern_matches("[10.0.0.*]:2222", "[10.0.0.7]:2222"));
        assert!(pattern_matches("*", "anything"));

        assert!(!pattern_matches("*.corp.example,!vault.corp.example", "vault.corp.example"));
        assert!(pattern_matches("*.corp.example,!vault.corp.example", "jump.corp.example"));
        assert!(!pattern_matches("!bastion", "bastion"));
        assert!(!pattern_matches("!bastion", "other"));
    }

    #[test]
    fn test_default_path_is_under_ssh_dir() {
        let path = default_ledger_path();
        assert!(path.ends_with(".ssh/known_hosts"));
    }

    #[test]
    fn test_load_missing_is_empty() {
        let records = load_records(Path::new("/nonexistent/known_hosts")).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_append_creates_file_and_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssh").join("known_hosts");

        append_record(&path, &record("a", &[1])).unwrap();
        append_record(&path, &record("b", &[2])).unwrap();

        let loaded = load_records(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].host_pattern, "b");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_append_never_truncates_and_fixes_missing_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        fs::write(&path, "# managed by hand\nold ssh-ed25519 AQID").unwrap();

        append_record(&path, &record("new", &[9])).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(
            contents,
            "# managed by hand\nold ssh-ed25519 AQID\nnew ssh-ed25519 CQ==\n"
        );
    }
}
