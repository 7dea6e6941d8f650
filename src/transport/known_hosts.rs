//! Host key verification against `~/.ssh/known_hosts`
//!
//! Read-only: this crate never writes trust decisions. Unknown and changed
//! keys both fail the handshake; adding hosts is the operator's job
//! (`ssh-keyscan`, or a first interactive `ssh`).

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::RwLock;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::DialError;

/// Result of host key verification
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    /// Key matches a known_hosts entry
    Verified,
    /// Host not in known_hosts
    Unknown { fingerprint: String },
    /// Key differs from the known_hosts entry (potential MITM)
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

/// Entry in known_hosts: (key_type, base64_key)
#[derive(Clone, Debug)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

pub struct KnownHostsStore {
    /// host -> keys (multiple key types per host)
    hosts: RwLock<HashMap<String, Vec<HostKeyEntry>>>,
}

impl KnownHostsStore {
    /// Load from the default `~/.ssh/known_hosts` location.
    pub fn new() -> KnownHostsStore {
        let path = dirs::home_dir()
            .map(|home| home.join(".ssh").join("known_hosts"))
            .unwrap_or_else(|| PathBuf::from("~/.ssh/known_hosts"));
        Self::with_path(path)
    }

    /// Load from a custom path (for testing).
    pub fn with_path(path: PathBuf) -> KnownHostsStore {
        let store = KnownHostsStore {
            hosts: RwLock::new(HashMap::new()),
        };
        if let Err(err) = store.load(&path) {
            warn!(path = %path.display(), error = %err, "failed to load known_hosts");
        }
        store
    }

    fn load(&self, path: &Path) -> Result<(), DialError> {
        if !path.exists() {
            return Ok(());
        }

        let file = fs::File::open(path)?;
        let reader = BufReader::new(file);
        let mut hosts = self.hosts.write();

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // hostname[,alias...] keytype base64key [comment]
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 {
                continue;
            }

            let entry = HostKeyEntry {
                key_type: parts[1].to_string(),
                key_data: parts[2].to_string(),
            };

            for hostname in parts[0].split(',') {
                // Hashed hostnames (|1|...) are not supported
                if hostname.starts_with('|') {
                    continue;
                }
                let normalized = Self::normalize_hostname(hostname);
                hosts.entry(normalized).or_default().push(entry.clone());
            }
        }

        debug!("loaded {} known host entries", hosts.len());
        Ok(())
    }

    /// Normalize hostname for lookup: `[host]:port` -> `host`
    fn normalize_hostname(host: &str) -> String {
        let host = host.trim_start_matches('[');
        if let Some(at) = host.find("]:") {
            host[..at].to_lowercase()
        } else {
            host.trim_end_matches(']').to_lowercase()
        }
    }

    /// Lookup key for host:port, bracketed for non-standard ports
    fn make_key(host: &str, port: u16) -> String {
        let host = host.to_lowercase();
        if port == 22 {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    /// SHA256 fingerprint of a public key
    pub fn fingerprint(key: &PublicKey) -> String {
        Self::fingerprint_bytes(&key.public_key_bytes())
    }

    fn fingerprint_bytes(key_bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key_bytes);
        let hash = hasher.finalize();
        format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
    }

    /// Verify a host's public key.
    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerification {
        let lookup_key = Self::make_key(host, port);
        let actual_key_b64 = BASE64.encode(key.public_key_bytes());
        let actual_key_type = key.algorithm().to_string();
        let fingerprint = Self::fingerprint(key);

        let hosts = self.hosts.read();

        let check_entries = |entries: &Vec<HostKeyEntry>| -> Option<HostKeyVerification> {
            for entry in entries {
                if entry.key_type == actual_key_type {
                    if entry.key_data == actual_key_b64 {
                        debug!(host = %lookup_key, key_type = %actual_key_type, "host key verified");
                        return Some(HostKeyVerification::Verified);
                    }
                    let expected_fingerprint = Self::fingerprint_from_b64(&entry.key_data);
                    warn!(
                        host = %lookup_key,
                        expected = %expected_fingerprint,
                        actual = %fingerprint,
                        "host key changed"
                    );
                    return Some(HostKeyVerification::Changed {
                        expected_fingerprint,
                        actual_fingerprint: fingerprint.clone(),
                    });
                }
            }
            // Host known, but not for this key type
            None
        };

        // Exact match (with port) first, then the bare hostname
        for lookup in [&lookup_key, &host.to_lowercase()] {
            if let Some(entries) = hosts.get(lookup) {
                if let Some(result) = check_entries(entries) {
                    return result;
                }
                return HostKeyVerification::Unknown { fingerprint };
            }
        }

        debug!(host = %lookup_key, "unknown host");
        HostKeyVerification::Unknown { fingerprint }
    }

    fn fingerprint_from_b64(stored_b64: &str) -> String {
        match BASE64.decode(stored_b64) {
            Ok(bytes) => Self::fingerprint_bytes(&bytes),
            Err(_) => "unknown".to_string(),
        }
    }
}

impl Default for KnownHostsStore {
    fn default() -> Self {
        Self::new()
    }
}

static KNOWN_HOSTS: OnceLock<KnownHostsStore> = OnceLock::new();

/// The process-wide store, loaded once from the default location.
pub fn shared() -> &'static KnownHostsStore {
    KNOWN_HOSTS.get_or_init(KnownHostsStore::new)
}
