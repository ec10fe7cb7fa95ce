//! Pluggable storage policy
//!
//! Two seams. [`SpacePolicy`] guards the engine's store path (the
//! single-space-per-key invariant) and is selected from configuration so
//! the unenforced variant is a distinct, testable strategy rather than a
//! scattered flag check. [`EngineRecordPolicy`] is injected into the
//! overlay and gates what replicas accept off the wire.

use std::sync::Arc;

use crate::dht::RecordPolicy;
use crate::errors::StorageError;
use crate::types::{Record, StorageSpace};

/// Store-path policy for the space invariant.
pub trait SpacePolicy: Send + Sync {
    /// May `base_key` be (re)stored in `requested`, given the space it is
    /// already known to live in?
    fn check_store(
        &self,
        base_key: &str,
        requested: StorageSpace,
        existing: Option<StorageSpace>,
    ) -> Result<(), StorageError>;
}

/// Default policy: a base key lives in exactly one space, forever.
#[derive(Debug, Default)]
pub struct EnforcedSpacePolicy;

impl SpacePolicy for EnforcedSpacePolicy {
    fn check_store(
        &self,
        base_key: &str,
        requested: StorageSpace,
        existing: Option<StorageSpace>,
    ) -> Result<(), StorageError> {
        match existing {
            Some(current) if current != requested => {
                Err(StorageError::DuplicateKeyInOtherSpace {
                    key: base_key.to_string(),
                    existing: current,
                })
            }
            _ => Ok(()),
        }
    }
}

/// Opt-out policy for hosts that disable space enforcement.
#[derive(Debug, Default)]
pub struct UnenforcedSpacePolicy;

impl SpacePolicy for UnenforcedSpacePolicy {
    fn check_store(
        &self,
        _base_key: &str,
        _requested: StorageSpace,
        _existing: Option<StorageSpace>,
    ) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Select the space policy variant from configuration.
pub fn space_policy(enforced: bool) -> Arc<dyn SpacePolicy> {
    if enforced {
        Arc::new(EnforcedSpacePolicy)
    } else {
        Arc::new(UnenforcedSpacePolicy)
    }
}

/// Replica-side acceptance rules, applied before version ordering.
#[derive(Debug)]
pub struct EngineRecordPolicy {
    space_enforcement: bool,
}

impl EngineRecordPolicy {
    pub fn new(space_enforcement: bool) -> Self {
        Self { space_enforcement }
    }
}

impl RecordPolicy for EngineRecordPolicy {
    fn validate_store(
        &self,
        incoming: &Record,
        existing: Option<&Record>,
    ) -> Result<(), String> {
        let Some(existing) = existing else {
            return Ok(());
        };

        if self.space_enforcement && existing.metadata.space != incoming.metadata.space {
            return Err(format!(
                "key already lives in the {} space",
                existing.metadata.space
            ));
        }
        if existing.metadata.owner != incoming.metadata.owner {
            return Err("owner change rejected".to_string());
        }
        if existing.metadata.space == StorageSpace::Frozen
            && !existing.is_tombstone()
            && !incoming.is_tombstone()
            && incoming.value != existing.value
        {
            // ACL and other metadata updates still pass: same value,
            // newer metadata.
            return Err("frozen record content is immutable".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{now_ms, RecordMetadata};
    use lib_peer::PeerId;

    fn record(space: StorageSpace, owner: PeerId, value: serde_json::Value) -> Record {
        let meta = RecordMetadata::new("law".into(), space, owner, now_ms());
        Record::new(value, meta)
    }

    #[test]
    fn test_enforced_policy_rejects_space_change() {
        let policy = EnforcedSpacePolicy;
        assert!(policy
            .check_store("name", StorageSpace::Private, None)
            .is_ok());
        assert!(policy
            .check_store("name", StorageSpace::Private, Some(StorageSpace::Private))
            .is_ok());
        let err = policy
            .check_store("name", StorageSpace::Public, Some(StorageSpace::Private))
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::DuplicateKeyInOtherSpace { existing, .. }
                if existing == StorageSpace::Private
        ));
    }

    #[test]
    fn test_unenforced_policy_allows_anything() {
        let policy = UnenforcedSpacePolicy;
        assert!(policy
            .check_store("name", StorageSpace::Public, Some(StorageSpace::Private))
            .is_ok());
    }

    #[test]
    fn test_record_policy_rejects_owner_change() {
        let policy = EngineRecordPolicy::new(true);
        let owner = PeerId::from_seed(b"owner");
        let thief = PeerId::from_seed(b"thief");
        let existing = record(StorageSpace::Public, owner, serde_json::json!(1));
        let incoming = record(StorageSpace::Public, thief, serde_json::json!(2));
        assert!(policy
            .validate_store(&incoming, Some(&existing))
            .is_err());
    }

    #[test]
    fn test_record_policy_protects_frozen_content() {
        let policy = EngineRecordPolicy::new(true);
        let owner = PeerId::from_seed(b"owner");
        let existing = record(StorageSpace::Frozen, owner, serde_json::json!("v1"));

        let mut rewrite = record(StorageSpace::Frozen, owner, serde_json::json!("v2"));
        rewrite.metadata.version = 2;
        assert!(policy.validate_store(&rewrite, Some(&existing)).is_err());

        // Metadata-only update keeps the value and passes.
        let mut acl_update = existing.clone();
        acl_update.metadata.version = 2;
        acl_update
            .metadata
            .allowed_peers
            .insert(PeerId::from_seed(b"reader"));
        assert!(policy.validate_store(&acl_update, Some(&existing)).is_ok());

        // The owner may still retire the record.
        let tomb = existing.tombstone(owner, now_ms());
        assert!(policy.validate_store(&tomb, Some(&existing)).is_ok());
    }
}
