//! Ownership of a key by cluster members.

use crate::types::NodeId;

/// Role of a member for a specific key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipRole {
    /// Runs the key's expiration.
    Primary,
    /// Holds a copy of the key.
    Backup,
    None,
}

/// Owners of a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyOwnership {
    /// Hash of the key's partition bytes.
    pub key_hash: u64,

    pub primary: NodeId,

    /// Backup owners in order of preference.
    pub backups: Vec<NodeId>,
}

impl KeyOwnership {
    pub fn role(&self, node_id: NodeId) -> OwnershipRole {
        if self.primary == node_id {
            OwnershipRole::Primary
        } else if self.backups.contains(&node_id) {
            OwnershipRole::Backup
        } else {
            OwnershipRole::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles() {
        let ownership = KeyOwnership {
            key_hash: 7,
            primary: 1,
            backups: vec![2],
        };

        assert_eq!(ownership.role(1), OwnershipRole::Primary);
        assert_eq!(ownership.role(2), OwnershipRole::Backup);
        assert_eq!(ownership.role(3), OwnershipRole::None);
    }
}
