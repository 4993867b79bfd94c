//! The on-disk policy cache.
//!
//! Generated policies are cached keyed by a digest over everything that
//! influences bgpq4’s output: the AS number, the policy name, the
//! execution mode, the IRR source, the address families, and the bgpq4
//! version. Writes go to a temporary file first and are renamed into
//! place under an advisory lock, so concurrent workers generating the
//! same AS never leave a partial file behind. Readers treat absent or
//! corrupt entries as a miss.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use log::{debug, error, warn};
use ring::digest;
use crate::asn::Asn;
use crate::error::Failed;
use crate::utils::fatal;
use super::PrefixListPolicy;


//------------ CacheKey ------------------------------------------------------

/// The cache key of a policy.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CacheKey(String);

impl CacheKey {
    /// Computes the key for the given generation parameters.
    pub fn new(
        asn: Asn,
        policy_name: &str,
        mode: &str,
        irr_source: &str,
        aggregate: bool,
        ipv4: bool,
        ipv6: bool,
        bgpq4_version: &str,
    ) -> Self {
        let input = format!(
            "{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}",
            asn.into_u32(), policy_name, mode, irr_source,
            aggregate, ipv4, ipv6, bgpq4_version
        );
        let hash = digest::digest(&digest::SHA256, input.as_bytes());
        let mut hex = String::with_capacity(64);
        for byte in hash.as_ref() {
            write!(hex, "{:02x}", byte).expect("writing to string");
        }
        CacheKey(hex)
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}


//------------ PolicyCache ---------------------------------------------------

/// The process-safe on-disk cache of generated policies.
#[derive(Clone, Debug)]
pub struct PolicyCache {
    /// The directory the cache lives in.
    dir: PathBuf,
}

impl PolicyCache {
    /// Creates the cache below the given directory.
    pub fn new(dir: &Path) -> Result<Self, Failed> {
        fatal::create_dir_all(dir)?;
        Ok(PolicyCache { dir: dir.into() })
    }

    /// Returns the path of the entry for a key.
    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.as_str()))
    }

    /// Returns the path of the lock file for a key.
    fn lock_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.lock", key.as_str()))
    }

    /// Loads the entry for a key.
    ///
    /// Absent and corrupt entries are misses. A corrupt entry is removed
    /// so it doesn’t have to be parsed again.
    pub fn load(&self, key: &CacheKey) -> Option<PrefixListPolicy> {
        let path = self.entry_path(key);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(
                        "Failed to read cache entry {}: {}",
                        path.display(), err
                    );
                }
                return None
            }
        };
        match serde_json::from_slice::<PrefixListPolicy>(&data) {
            Ok(policy) => {
                if policy.cache_key == key.as_str() {
                    debug!("Cache hit for {}.", policy.as_number);
                    Some(policy)
                }
                else {
                    warn!(
                        "Discarding cache entry {}: key mismatch.",
                        path.display()
                    );
                    let _ = fs::remove_file(&path);
                    None
                }
            }
            Err(err) => {
                warn!(
                    "Discarding corrupt cache entry {}: {}",
                    path.display(), err
                );
                let _ = fs::remove_file(&path);
                None
            }
        }
    }

    /// Stores a policy under its key.
    ///
    /// The write is atomic and serialized against concurrent writers of
    /// the same key through an advisory lock. Two workers racing on the
    /// same key write identical content, so last-writer-wins is fine.
    pub fn store(
        &self, key: &CacheKey, policy: &PrefixListPolicy
    ) -> Result<(), Failed> {
        let _lock = KeyLock::take(&self.lock_path(key))?;
        let data = serde_json::to_vec_pretty(policy).map_err(|err| {
            error!("Failed to serialize cache entry: {}", err);
            Failed
        })?;
        fatal::replace_file(&self.entry_path(key), &data)
    }
}


//------------ KeyLock -------------------------------------------------------

/// An advisory lock on a cache key.
///
/// Released on drop. On platforms without flock the lock degrades to
/// nothing; the atomic rename still keeps readers safe.
#[derive(Debug)]
struct KeyLock {
    #[cfg(unix)]
    file: fs::File,
}

impl KeyLock {
    #[cfg(unix)]
    fn take(path: &Path) -> Result<Self, Failed> {
        use std::os::unix::io::AsRawFd;
        use nix::fcntl::{FlockArg, flock};

        let file = fs::OpenOptions::new()
            .write(true).create(true)
            .open(path)
            .map_err(|err| {
                error!(
                    "Failed to open cache lock {}: {}",
                    path.display(), err
                );
                Failed
            })?;
        flock(file.as_raw_fd(), FlockArg::LockExclusive).map_err(|err| {
            error!(
                "Failed to lock cache key {}: {}", path.display(), err
            );
            Failed
        })?;
        Ok(KeyLock { file })
    }

    #[cfg(not(unix))]
    fn take(_path: &Path) -> Result<Self, Failed> {
        Ok(KeyLock { })
    }
}

#[cfg(unix)]
impl Drop for KeyLock {
    fn drop(&mut self) {
        use std::os::unix::io::AsRawFd;
        use nix::fcntl::{FlockArg, flock};

        let _ = flock(self.file.as_raw_fd(), FlockArg::Unlock);
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use chrono::Utc;

    fn policy(key: &CacheKey) -> PrefixListPolicy {
        PrefixListPolicy {
            as_number: Asn::from_u32(13335),
            policy_name: "AS13335".into(),
            content: "policy-options {\n}\n".into(),
            generated_at: Utc::now(),
            cache_key: key.as_str().into(),
        }
    }

    #[test]
    fn key_is_stable_and_sensitive() {
        let a = CacheKey::new(
            Asn::from_u32(13335), "AS13335", "native",
            "RADB", true, true, false, "v1"
        );
        let b = CacheKey::new(
            Asn::from_u32(13335), "AS13335", "native",
            "RADB", true, true, false, "v1"
        );
        assert_eq!(a, b);

        let c = CacheKey::new(
            Asn::from_u32(13335), "AS13335", "native",
            "RADB", true, true, false, "v2"
        );
        assert_ne!(a, c);

        let d = CacheKey::new(
            Asn::from_u32(13336), "AS13336", "native",
            "RADB", true, true, false, "v1"
        );
        assert_ne!(a, d);
    }

    #[test]
    fn store_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PolicyCache::new(dir.path()).unwrap();
        let key = CacheKey::new(
            Asn::from_u32(13335), "AS13335", "native",
            "RADB", true, true, false, "v1"
        );
        assert!(cache.load(&key).is_none());
        cache.store(&key, &policy(&key)).unwrap();
        let loaded = cache.load(&key).unwrap();
        assert_eq!(loaded.as_number, Asn::from_u32(13335));
        assert_eq!(loaded.policy_name, "AS13335");
    }

    #[test]
    fn corrupt_entries_are_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PolicyCache::new(dir.path()).unwrap();
        let key = CacheKey::new(
            Asn::from_u32(13335), "AS13335", "native",
            "RADB", true, true, false, "v1"
        );
        fs::write(cache.entry_path(&key), b"not json").unwrap();
        assert!(cache.load(&key).is_none());
        // The corrupt file is gone afterwards.
        assert!(!cache.entry_path(&key).exists());
    }

    #[test]
    fn mismatched_key_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PolicyCache::new(dir.path()).unwrap();
        let key_a = CacheKey::new(
            Asn::from_u32(13335), "AS13335", "native",
            "RADB", true, true, false, "v1"
        );
        let key_b = CacheKey::new(
            Asn::from_u32(13335), "AS13335", "native",
            "RADB", true, true, false, "v2"
        );
        // Store under b’s path but with a’s recorded key.
        cache.store(&key_b, &policy(&key_a)).unwrap();
        assert!(cache.load(&key_b).is_none());
    }
}
