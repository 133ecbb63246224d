//! Circle storage

use redb::TableDefinition;

use super::Storage;
use crate::error::SyncResult;
use crate::types::{Circle, CircleId, PeerId};

/// Circles (key: "<owner hex>:<circle id>")
pub(crate) const CIRCLES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("circles");

fn circle_key(owner: &PeerId, id: &CircleId) -> String {
    format!("{}:{}", owner.to_hex(), id)
}

impl Storage {
    // ═══════════════════════════════════════════════════════════════════════
    // Circle Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Save a circle, overwriting any previous state
    pub fn save_circle(&self, circle: &Circle) -> SyncResult<()> {
        self.put(CIRCLES_TABLE, &circle_key(&circle.owner, &circle.id), circle)
    }

    /// Load a circle
    pub fn load_circle(&self, owner: &PeerId, id: &CircleId) -> SyncResult<Option<Circle>> {
        self.get(CIRCLES_TABLE, &circle_key(owner, id))
    }

    /// Circles of one owner, oldest first
    pub fn list_circles(&self, owner: &PeerId) -> SyncResult<Vec<Circle>> {
        let mut circles: Vec<Circle> = self.scan(CIRCLES_TABLE, &format!("{}:", owner.to_hex()))?;
        circles.sort_by_key(|c| (c.created_at, c.id));
        Ok(circles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_list_circles_by_owner() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().join("test.redb")).unwrap();
        let alice = PeerId([1; 32]);
        let bob = PeerId([2; 32]);

        let everyone = Circle::everyone(alice);
        let friends = Circle::new(alice, "friends");
        storage.save_circle(&everyone).unwrap();
        storage.save_circle(&friends).unwrap();
        storage.save_circle(&Circle::everyone(bob)).unwrap();

        let circles = storage.list_circles(&alice).unwrap();
        assert_eq!(circles.len(), 2);
        assert!(circles.iter().all(|c| c.owner == alice));

        let loaded = storage.load_circle(&alice, &friends.id).unwrap().unwrap();
        assert_eq!(loaded, friends);
    }
}
