//! Post storage
//!
//! Posts are keyed by author and id, so the upload queue and the feed are
//! prefix scans. Published posts are also indexed by stored hash.

use redb::TableDefinition;

use super::{EntityRef, Storage};
use crate::error::SyncResult;
use crate::types::{BlobHash, CircleId, PeerId, Post, PostId};

/// Posts (key: "<author hex>:<post id>")
pub(crate) const POSTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("posts");

fn post_key(author: &PeerId, id: &PostId) -> String {
    format!("{}:{}", author.to_hex(), id)
}

fn author_prefix(author: &PeerId) -> String {
    format!("{}:", author.to_hex())
}

impl Storage {
    // ═══════════════════════════════════════════════════════════════════════
    // Post Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Save a post. A stored hash, if set, is indexed in the same transaction.
    pub fn save_post(&self, post: &Post) -> SyncResult<()> {
        let entity = EntityRef::Post {
            author: post.author,
            id: post.id,
        };
        self.put_indexed(
            POSTS_TABLE,
            &post_key(&post.author, &post.id),
            post,
            post.stored_hash.as_ref().map(|h| (h, &entity)),
        )
    }

    /// Load a post
    pub fn load_post(&self, author: &PeerId, id: &PostId) -> SyncResult<Option<Post>> {
        self.get(POSTS_TABLE, &post_key(author, id))
    }

    /// Post stored under `hash`
    pub fn post_by_hash(&self, hash: &BlobHash) -> SyncResult<Option<Post>> {
        match self.lookup_blob(hash)? {
            Some(EntityRef::Post { author, id }) => self.load_post(&author, &id),
            _ => Ok(None),
        }
    }

    /// Posts by `author` not yet uploaded, oldest first
    pub fn unpublished_posts(&self, author: &PeerId) -> SyncResult<Vec<Post>> {
        let mut posts: Vec<Post> = self
            .scan::<Post>(POSTS_TABLE, &author_prefix(author))?
            .into_iter()
            .filter(|p| p.stored_hash.is_none())
            .collect();
        posts.sort_by_key(|p| (p.timestamp, p.id));
        Ok(posts)
    }

    /// Posts by any of `authors`, newest first
    pub fn posts_by_authors(&self, authors: &[PeerId]) -> SyncResult<Vec<Post>> {
        let mut posts = Vec::new();
        for author in authors {
            posts.extend(self.scan::<Post>(POSTS_TABLE, &author_prefix(author))?);
        }
        posts.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        Ok(posts)
    }

    /// Uploaded posts by `author` in `circle`
    pub fn posts_in_circle(&self, author: &PeerId, circle: &CircleId) -> SyncResult<Vec<Post>> {
        Ok(self
            .scan::<Post>(POSTS_TABLE, &author_prefix(author))?
            .into_iter()
            .filter(|p| p.circle_id == *circle && p.stored_hash.is_some())
            .collect())
    }

    /// Remove the post stored under `hash`, returning it
    pub fn delete_post_by_hash(&self, hash: &BlobHash) -> SyncResult<Option<Post>> {
        let Some(post) = self.post_by_hash(hash)? else {
            return Ok(None);
        };
        self.remove_indexed(POSTS_TABLE, &post_key(&post.author, &post.id), hash)?;
        Ok(Some(post))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn storage() -> (tempfile::TempDir, Storage) {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().join("test.redb")).unwrap();
        (dir, storage)
    }

    #[test]
    fn test_upload_queue() {
        let (_dir, storage) = storage();
        let alice = PeerId([1; 32]);
        let circle = CircleId::new();

        let mut post = Post::new(alice, circle, "hello");
        storage.save_post(&post).unwrap();
        assert_eq!(storage.unpublished_posts(&alice).unwrap().len(), 1);
        assert!(storage.posts_in_circle(&alice, &circle).unwrap().is_empty());

        let hash = BlobHash::of(b"encrypted hello");
        post.stored_hash = Some(hash);
        storage.save_post(&post).unwrap();

        assert!(storage.unpublished_posts(&alice).unwrap().is_empty());
        assert_eq!(storage.posts_in_circle(&alice, &circle).unwrap().len(), 1);
        assert!(storage.has_blob(&hash).unwrap());
        assert_eq!(storage.post_by_hash(&hash).unwrap().unwrap().text, "hello");
    }

    #[test]
    fn test_feed_is_newest_first() {
        let (_dir, storage) = storage();
        let alice = PeerId([1; 32]);
        let bob = PeerId([2; 32]);
        let carol = PeerId([3; 32]);
        let circle = CircleId::new();

        storage
            .save_post(&Post::new(alice, circle, "old").with_timestamp(1000))
            .unwrap();
        storage
            .save_post(&Post::new(bob, circle, "new").with_timestamp(3000))
            .unwrap();
        storage
            .save_post(&Post::new(carol, circle, "hidden").with_timestamp(2000))
            .unwrap();

        let feed = storage.posts_by_authors(&[alice, bob]).unwrap();
        let texts: Vec<_> = feed.iter().map(|p| p.text.as_str()).collect();
        assert_eq!(texts, vec!["new", "old"]);
    }

    #[test]
    fn test_delete_by_hash() {
        let (_dir, storage) = storage();
        let alice = PeerId([1; 32]);
        let hash = BlobHash::of(b"post");
        let mut post = Post::new(alice, CircleId::new(), "bye");
        post.stored_hash = Some(hash);
        storage.save_post(&post).unwrap();

        let deleted = storage.delete_post_by_hash(&hash).unwrap().unwrap();
        assert_eq!(deleted.id, post.id);
        assert!(storage.load_post(&alice, &post.id).unwrap().is_none());
        assert!(!storage.has_blob(&hash).unwrap());
        assert!(storage.delete_post_by_hash(&hash).unwrap().is_none());
    }
}
