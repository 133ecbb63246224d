//! Reaction and tag storage
//!
//! Rows are keyed by the uniqueness key (post hash, author, kind, value), so
//! saving the same reaction twice keeps one row.

use redb::TableDefinition;

use super::{EntityRef, Storage};
use crate::error::SyncResult;
use crate::types::{BlobHash, CircleId, PeerId, Reaction};

/// Reactions (key: [`Reaction::unique_key`])
pub(crate) const REACTIONS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("reactions");

impl Storage {
    // ═══════════════════════════════════════════════════════════════════════
    // Reaction Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Save a reaction, replacing the row with the same uniqueness key.
    ///
    /// Returns true if no row existed for that key.
    pub fn save_reaction(&self, reaction: &Reaction) -> SyncResult<bool> {
        let key = reaction.unique_key();
        let existed = self.get::<Reaction>(REACTIONS_TABLE, &key)?.is_some();
        let entity = EntityRef::Reaction(key.clone());
        self.put_indexed(
            REACTIONS_TABLE,
            &key,
            reaction,
            reaction.stored_hash.as_ref().map(|h| (h, &entity)),
        )?;
        Ok(!existed)
    }

    fn all_reactions(&self) -> SyncResult<Vec<Reaction>> {
        self.scan(REACTIONS_TABLE, "")
    }

    /// Reactions by `author` not yet uploaded
    pub fn unpublished_reactions(&self, author: &PeerId) -> SyncResult<Vec<Reaction>> {
        Ok(self
            .all_reactions()?
            .into_iter()
            .filter(|r| r.author == *author && r.stored_hash.is_none())
            .collect())
    }

    /// Uploaded reactions by `author` in `circle`
    pub fn reactions_in_circle(
        &self,
        author: &PeerId,
        circle: &CircleId,
    ) -> SyncResult<Vec<Reaction>> {
        Ok(self
            .all_reactions()?
            .into_iter()
            .filter(|r| r.author == *author && r.circle_id == *circle && r.stored_hash.is_some())
            .collect())
    }

    /// Reactions and tags on a post, oldest first
    pub fn reactions_for_post(&self, post_hash: &BlobHash) -> SyncResult<Vec<Reaction>> {
        let mut reactions: Vec<Reaction> =
            self.scan(REACTIONS_TABLE, &format!("{}:", post_hash.to_hex()))?;
        reactions.sort_by_key(|r| r.timestamp);
        Ok(reactions)
    }

    /// Reaction stored under `hash`
    pub fn reaction_by_hash(&self, hash: &BlobHash) -> SyncResult<Option<Reaction>> {
        match self.lookup_blob(hash)? {
            Some(EntityRef::Reaction(key)) => self.get(REACTIONS_TABLE, &key),
            _ => Ok(None),
        }
    }

    /// Remove the reaction stored under `hash`, returning it
    pub fn delete_reaction_by_hash(&self, hash: &BlobHash) -> SyncResult<Option<Reaction>> {
        let Some(EntityRef::Reaction(key)) = self.lookup_blob(hash)? else {
            return Ok(None);
        };
        let Some(reaction) = self.get::<Reaction>(REACTIONS_TABLE, &key)? else {
            return Ok(None);
        };
        self.remove_indexed(REACTIONS_TABLE, &key, hash)?;
        Ok(Some(reaction))
    }
}
