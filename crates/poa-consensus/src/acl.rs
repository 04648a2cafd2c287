//! Access control list: a whitelist/blacklist pair with expiry, kept in
//! sync with reputation via `auto_manage`, persisted to JSON
//! with an atomic rename so a crash mid-write never leaves a half-written
//! file behind.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use ethereum_types::Address;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::AclConfig;
use crate::error::ConsensusError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AclEntry {
    pub address: Address,
    pub added_at_secs: u64,
    pub expires_at_secs: Option<u64>,
    pub reason: String,
    /// True if reputation thresholds put this entry here, as opposed to an
    /// operator-issued `whitelist_add`/`blacklist_add` call.
    pub auto: bool,
}

impl AclEntry {
    fn is_expired(&self, now_secs: u64) -> bool {
        self.expires_at_secs.map(|e| now_secs >= e).unwrap_or(false)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AclSnapshot {
    whitelist: Vec<AclEntry>,
    blacklist: Vec<AclEntry>,
}

pub struct AccessControlList {
    config: AclConfig,
    whitelist: RwLock<BTreeMap<Address, AclEntry>>,
    blacklist: RwLock<BTreeMap<Address, AclEntry>>,
}

impl AccessControlList {
    pub fn new(config: AclConfig) -> Self {
        AccessControlList {
            config,
            whitelist: RwLock::new(BTreeMap::new()),
            blacklist: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn whitelist_add(&self, address: Address, reason: impl Into<String>, now_secs: u64) {
        self.blacklist.write().remove(&address);
        self.whitelist.write().insert(
            address,
            AclEntry {
                address,
                added_at_secs: now_secs,
                expires_at_secs: None,
                reason: reason.into(),
                auto: false,
            },
        );
    }

    pub fn blacklist_add(
        &self,
        address: Address,
        reason: impl Into<String>,
        ttl_secs: Option<u64>,
        now_secs: u64,
    ) {
        self.whitelist.write().remove(&address);
        self.blacklist.write().insert(
            address,
            AclEntry {
                address,
                added_at_secs: now_secs,
                expires_at_secs: ttl_secs.map(|ttl| now_secs + ttl),
                reason: reason.into(),
                auto: false,
            },
        );
    }

    pub fn remove(&self, address: Address) {
        self.whitelist.write().remove(&address);
        self.blacklist.write().remove(&address);
    }

    pub fn is_whitelisted(&self, address: Address, now_secs: u64) -> bool {
        self.purge_expired(now_secs);
        self.whitelist.read().contains_key(&address)
    }

    pub fn is_blacklisted(&self, address: Address, now_secs: u64) -> bool {
        self.purge_expired(now_secs);
        self.blacklist.read().contains_key(&address)
    }

    fn purge_expired(&self, now_secs: u64) {
        self.whitelist
            .write()
            .retain(|_, entry| !entry.is_expired(now_secs));
        self.blacklist
            .write()
            .retain(|_, entry| !entry.is_expired(now_secs));
    }

    /// Reject a sealer that the blacklist names and `monitoring_mode` isn't
    /// absorbing, or that `whitelist_strict` demands and the signer lacks.
    pub fn validate(&self, address: Address, now_secs: u64) -> Result<(), ConsensusError> {
        self.purge_expired(now_secs);
        if let Some(entry) = self.blacklist.read().get(&address) {
            if !self.config.monitoring_mode {
                return Err(ConsensusError::AccessDenied(address, entry.reason.clone()));
            }
        }
        if self.config.whitelist_strict && !self.whitelist.read().contains_key(&address) {
            return Err(ConsensusError::AccessDenied(
                address,
                "not on the whitelist".to_string(),
            ));
        }
        Ok(())
    }

    /// Reputation-driven auto-management: demote below `low_threshold`,
    /// promote at/above `high_threshold`. Manual (non-`auto`) entries are
    /// left untouched so an operator override always wins.
    pub fn auto_manage(&self, address: Address, composite_reputation: f64, now_secs: u64) {
        if composite_reputation < self.config.low_threshold {
            let already_manual = self
                .blacklist
                .read()
                .get(&address)
                .map(|e| !e.auto)
                .unwrap_or(false);
            if !already_manual {
                self.whitelist.write().remove(&address);
                self.blacklist.write().insert(
                    address,
                    AclEntry {
                        address,
                        added_at_secs: now_secs,
                        expires_at_secs: Some(now_secs + self.config.auto_blacklist_ttl_secs),
                        reason: format!("composite reputation {composite_reputation:.2} below low threshold"),
                        auto: true,
                    },
                );
            }
        } else if composite_reputation >= self.config.high_threshold {
            let was_auto_blacklisted = self
                .blacklist
                .read()
                .get(&address)
                .map(|e| e.auto)
                .unwrap_or(false);
            if was_auto_blacklisted {
                self.blacklist.write().remove(&address);
            }
            let already_manual = self
                .whitelist
                .read()
                .get(&address)
                .map(|e| !e.auto)
                .unwrap_or(false);
            if !already_manual {
                self.whitelist.write().insert(
                    address,
                    AclEntry {
                        address,
                        added_at_secs: now_secs,
                        expires_at_secs: None,
                        reason: format!("composite reputation {composite_reputation:.2} at/above high threshold"),
                        auto: true,
                    },
                );
            }
        }
    }

    pub fn save(&self) -> std::io::Result<()> {
        self.save_to(&self.config.json_path)
    }

    fn save_to(&self, path: &Path) -> std::io::Result<()> {
        let snapshot = AclSnapshot {
            whitelist: self.whitelist.read().values().cloned().collect(),
            blacklist: self.blacklist.read().values().cloned().collect(),
        };
        let text = serde_json::to_string_pretty(&snapshot)?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, text)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn load(&self) -> std::io::Result<()> {
        self.load_from(&self.config.json_path)
    }

    fn load_from(&self, path: &Path) -> std::io::Result<()> {
        if !path.exists() {
            return Ok(());
        }
        let text = fs::read_to_string(path)?;
        let snapshot: AclSnapshot = serde_json::from_str(&text)?;
        *self.whitelist.write() = snapshot
            .whitelist
            .into_iter()
            .map(|e| (e.address, e))
            .collect();
        *self.blacklist.write() = snapshot
            .blacklist
            .into_iter()
            .map(|e| (e.address, e))
            .collect();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> Address {
        Address::repeat_byte(n)
    }

    #[test]
    fn blacklisted_signer_is_denied_unless_monitoring() {
        let acl = AccessControlList::new(AclConfig {
            monitoring_mode: false,
            ..Default::default()
        });
        let a = addr(1);
        acl.blacklist_add(a, "spam", None, 0);
        assert!(acl.validate(a, 0).is_err());
    }

    #[test]
    fn monitoring_mode_allows_blacklisted_signers_through() {
        let acl = AccessControlList::new(AclConfig {
            monitoring_mode: true,
            ..Default::default()
        });
        let a = addr(1);
        acl.blacklist_add(a, "spam", None, 0);
        assert!(acl.validate(a, 0).is_ok());
    }

    #[test]
    fn expired_blacklist_entry_is_purged() {
        let acl = AccessControlList::new(AclConfig {
            monitoring_mode: false,
            ..Default::default()
        });
        let a = addr(1);
        acl.blacklist_add(a, "temp", Some(100), 0);
        assert!(acl.is_blacklisted(a, 50));
        assert!(!acl.is_blacklisted(a, 150));
    }

    #[test]
    fn strict_whitelist_denies_unlisted_signers() {
        let acl = AccessControlList::new(AclConfig {
            whitelist_strict: true,
            ..Default::default()
        });
        let (a, b) = (addr(1), addr(2));
        acl.whitelist_add(a, "trusted", 0);
        assert!(acl.validate(a, 0).is_ok());
        assert!(acl.validate(b, 0).is_err());
    }

    #[test]
    fn auto_manage_blacklists_low_reputation_and_recovers_at_high() {
        let config = AclConfig {
            low_threshold: 2.0,
            high_threshold: 8.0,
            monitoring_mode: false,
            ..Default::default()
        };
        let acl = AccessControlList::new(config);
        let a = addr(1);
        acl.auto_manage(a, 1.0, 0);
        assert!(acl.is_blacklisted(a, 0));
        acl.auto_manage(a, 9.0, 10);
        assert!(!acl.is_blacklisted(a, 10));
        assert!(acl.is_whitelisted(a, 10));
    }

    #[test]
    fn manual_blacklist_entry_survives_auto_manage_promotion() {
        let config = AclConfig {
            high_threshold: 8.0,
            monitoring_mode: false,
            ..Default::default()
        };
        let acl = AccessControlList::new(config);
        let a = addr(1);
        acl.blacklist_add(a, "operator decision", None, 0);
        acl.auto_manage(a, 9.0, 10);
        assert!(acl.is_blacklisted(a, 10), "manual entries are not auto-promoted away");
    }

    #[test]
    fn save_then_load_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let json_path = dir.path().join("acl.json");
        let acl = AccessControlList::new(AclConfig {
            json_path: json_path.clone(),
            ..Default::default()
        });
        let a = addr(7);
        acl.whitelist_add(a, "trusted", 0);
        acl.save().unwrap();

        let reloaded = AccessControlList::new(AclConfig {
            json_path,
            ..Default::default()
        });
        reloaded.load().unwrap();
        assert!(reloaded.is_whitelisted(a, 0));
    }
}
