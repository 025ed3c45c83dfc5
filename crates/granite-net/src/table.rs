//! The node table: known peers bucketed by XOR distance from the local
//! identity.
//!
//! Distance between two nodes is the bit length of the XOR of their
//! 160-bit addresses; bucket `d - 1` holds nodes at distance `d`. Every
//! bucket is bounded at [`BUCKET_SIZE`] entries, ordered most-recently
//! -seen first. A full bucket never displaces an entry silently:
//! insertion surfaces the least-recently-seen incumbent as an eviction
//! candidate, and the discovery protocol decides by probing its liveness.
//!
//! The table itself is synchronous; callers serialize access behind a
//! mutex and never hold it across an await.

use std::time::Instant;

use granite_core::crypto::NodeId;
use granite_core::wire::Endpoint;

/// Bucket capacity — the Kademlia K.
pub const BUCKET_SIZE: usize = 16;

/// One bucket per possible XOR-distance bit length.
pub const BUCKET_COUNT: usize = 160;

/// XOR distance between two addresses: the bit length of their XOR.
/// Zero means the addresses are equal.
pub fn distance(a: &[u8; 20], b: &[u8; 20]) -> u32 {
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        let xor = x ^ y;
        if xor != 0 {
            return (19 - i as u32) * 8 + (8 - xor.leading_zeros());
        }
    }
    0
}

/// A known peer: identity, where to reach it, when we last heard from it.
#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub id: NodeId,
    pub endpoint: Endpoint,
    pub last_seen: Instant,
}

impl NodeEntry {
    pub fn new(id: NodeId, endpoint: Endpoint) -> Self {
        Self {
            id,
            endpoint,
            last_seen: Instant::now(),
        }
    }
}

/// Outcome of an insertion attempt.
#[derive(Debug, Clone)]
pub enum Insert {
    /// The node was new and its bucket had room.
    Added,
    /// The node was already present; its order and endpoint refreshed.
    Refreshed,
    /// The bucket is full. The least-recently-seen incumbent is returned
    /// so the caller can probe its liveness before deciding.
    Full { incumbent: NodeEntry },
    /// The node is the local identity and is never tracked.
    IsSelf,
}

/// Distance-bucketed table of known nodes.
pub struct NodeTable {
    local_id: NodeId,
    local_addr: [u8; 20],
    buckets: Vec<Vec<NodeEntry>>,
}

impl NodeTable {
    pub fn new(local_id: NodeId) -> Self {
        Self {
            local_id,
            local_addr: local_id.address(),
            buckets: vec![Vec::new(); BUCKET_COUNT],
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Total nodes tracked across all buckets.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(Vec::is_empty)
    }

    fn bucket_index(&self, id: &NodeId) -> Option<usize> {
        match distance(&self.local_addr, &id.address()) {
            0 => None,
            d => Some(d as usize - 1),
        }
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: &NodeId) -> Option<&NodeEntry> {
        let bucket = &self.buckets[self.bucket_index(id)?];
        bucket.iter().find(|entry| entry.id == *id)
    }

    /// Record a bonded node. Known nodes are refreshed in place
    /// (last-seen endpoint wins); full buckets surface an eviction
    /// candidate instead of inserting.
    pub fn insert(&mut self, id: NodeId, endpoint: Endpoint) -> Insert {
        let Some(index) = self.bucket_index(&id) else {
            return Insert::IsSelf;
        };
        let bucket = &mut self.buckets[index];

        if let Some(pos) = bucket.iter().position(|entry| entry.id == id) {
            let mut entry = bucket.remove(pos);
            entry.endpoint = endpoint;
            entry.last_seen = Instant::now();
            bucket.insert(0, entry);
            return Insert::Refreshed;
        }

        if bucket.len() < BUCKET_SIZE {
            bucket.insert(0, NodeEntry::new(id, endpoint));
            return Insert::Added;
        }

        Insert::Full {
            incumbent: bucket[bucket.len() - 1].clone(),
        }
    }

    /// Move a node to the front of its bucket and stamp it fresh.
    /// Returns false if the node is not tracked.
    pub fn note_seen(&mut self, id: &NodeId) -> bool {
        let Some(index) = self.bucket_index(id) else {
            return false;
        };
        let bucket = &mut self.buckets[index];
        let Some(pos) = bucket.iter().position(|entry| entry.id == *id) else {
            return false;
        };
        let mut entry = bucket.remove(pos);
        entry.last_seen = Instant::now();
        bucket.insert(0, entry);
        true
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<NodeEntry> {
        let index = self.bucket_index(id)?;
        let bucket = &mut self.buckets[index];
        let pos = bucket.iter().position(|entry| entry.id == *id)?;
        Some(bucket.remove(pos))
    }

    /// Replace a failed incumbent with the candidate that was waiting on
    /// its eviction probe. The incumbent may already be gone; the
    /// candidate still only enters if its bucket has room.
    pub fn evict_replace(&mut self, incumbent: &NodeId, id: NodeId, endpoint: Endpoint) -> bool {
        self.remove(incumbent);
        matches!(self.insert(id, endpoint), Insert::Added | Insert::Refreshed)
    }

    /// The closest `n` known nodes to a target address, merged across
    /// buckets and sorted by the XOR metric.
    pub fn closest(&self, target: &[u8; 20], n: usize) -> Vec<NodeEntry> {
        let mut nodes: Vec<NodeEntry> = self
            .buckets
            .iter()
            .flat_map(|bucket| bucket.iter().cloned())
            .collect();
        nodes.sort_by_key(|entry| xor_key(&entry.id.address(), target));
        nodes.truncate(n);
        nodes
    }
}

/// Full-precision XOR metric: comparing the XOR byte strings
/// lexicographically orders nodes by exact distance, not just bit length.
fn xor_key(a: &[u8; 20], target: &[u8; 20]) -> [u8; 20] {
    let mut key = [0u8; 20];
    for (i, byte) in key.iter_mut().enumerate() {
        *byte = a[i] ^ target[i];
    }
    key
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use granite_core::crypto::Keypair;

    fn endpoint(port: u16) -> Endpoint {
        Endpoint::new("127.0.0.1".parse().unwrap(), port, port)
    }

    /// Generate identities until `count` of them land in the same bucket
    /// of a table rooted at `local`.
    fn same_bucket_ids(table: &NodeTable, count: usize) -> Vec<NodeId> {
        let mut by_bucket: std::collections::HashMap<usize, Vec<NodeId>> = Default::default();
        loop {
            let id = Keypair::generate().id();
            if let Some(index) = table.bucket_index(&id) {
                let ids = by_bucket.entry(index).or_default();
                ids.push(id);
                if ids.len() == count {
                    return ids.clone();
                }
            }
        }
    }

    // ── Distance ─────────────────────────────────────────────────────────────

    #[test]
    fn distance_of_equal_addresses_is_zero() {
        let addr = Keypair::generate().id().address();
        assert_eq!(distance(&addr, &addr), 0);
    }

    #[test]
    fn distance_is_symmetric_and_bounded() {
        let a = Keypair::generate().id().address();
        let b = Keypair::generate().id().address();
        assert_eq!(distance(&a, &b), distance(&b, &a));
        assert!(distance(&a, &b) <= 160);
    }

    #[test]
    fn distance_counts_leading_bit_position() {
        let zero = [0u8; 20];
        let mut one = [0u8; 20];
        one[19] = 0x01;
        assert_eq!(distance(&zero, &one), 1);

        let mut top = [0u8; 20];
        top[0] = 0x80;
        assert_eq!(distance(&zero, &top), 160);

        let mut mid = [0u8; 20];
        mid[10] = 0x10;
        assert_eq!(distance(&zero, &mid), 9 * 8 + 5);
    }

    // ── Insertion and bounds ─────────────────────────────────────────────────

    #[test]
    fn buckets_never_exceed_capacity() {
        let mut table = NodeTable::new(Keypair::generate().id());
        for i in 0..200 {
            table.insert(Keypair::generate().id(), endpoint(30000 + i));
        }
        for bucket in &table.buckets {
            assert!(bucket.len() <= BUCKET_SIZE);
        }
        assert!(table.len() <= 200);
    }

    #[test]
    fn self_is_never_inserted() {
        let local = Keypair::generate().id();
        let mut table = NodeTable::new(local);
        assert!(matches!(table.insert(local, endpoint(1)), Insert::IsSelf));
        assert!(table.is_empty());
    }

    #[test]
    fn reinsert_refreshes_and_updates_endpoint() {
        let mut table = NodeTable::new(Keypair::generate().id());
        let id = Keypair::generate().id();
        assert!(matches!(table.insert(id, endpoint(1)), Insert::Added));
        assert!(matches!(table.insert(id, endpoint(2)), Insert::Refreshed));
        // Last-seen endpoint wins.
        assert_eq!(table.get(&id).unwrap().endpoint, endpoint(2));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn full_bucket_surfaces_least_recently_seen_incumbent() {
        let mut table = NodeTable::new(Keypair::generate().id());
        let ids = same_bucket_ids(&table, BUCKET_SIZE + 1);
        for (i, id) in ids[..BUCKET_SIZE].iter().enumerate() {
            table.insert(*id, endpoint(i as u16));
        }

        // The first-inserted node is least recently seen.
        match table.insert(ids[BUCKET_SIZE], endpoint(999)) {
            Insert::Full { incumbent } => assert_eq!(incumbent.id, ids[0]),
            other => panic!("expected Full, got {other:?}"),
        }
        // The candidate did not enter.
        assert!(!table.contains(&ids[BUCKET_SIZE]));
    }

    #[test]
    fn note_seen_protects_an_incumbent() {
        let mut table = NodeTable::new(Keypair::generate().id());
        let ids = same_bucket_ids(&table, BUCKET_SIZE + 1);
        for (i, id) in ids[..BUCKET_SIZE].iter().enumerate() {
            table.insert(*id, endpoint(i as u16));
        }

        // Refreshing the oldest node moves the eviction target to the next.
        assert!(table.note_seen(&ids[0]));
        match table.insert(ids[BUCKET_SIZE], endpoint(999)) {
            Insert::Full { incumbent } => assert_eq!(incumbent.id, ids[1]),
            other => panic!("expected Full, got {other:?}"),
        }
    }

    #[test]
    fn evict_replace_swaps_incumbent_for_candidate() {
        let mut table = NodeTable::new(Keypair::generate().id());
        let ids = same_bucket_ids(&table, BUCKET_SIZE + 1);
        for (i, id) in ids[..BUCKET_SIZE].iter().enumerate() {
            table.insert(*id, endpoint(i as u16));
        }

        assert!(table.evict_replace(&ids[0], ids[BUCKET_SIZE], endpoint(999)));
        assert!(!table.contains(&ids[0]));
        assert!(table.contains(&ids[BUCKET_SIZE]));
        for bucket in &table.buckets {
            assert!(bucket.len() <= BUCKET_SIZE);
        }
    }

    // ── Lookup ───────────────────────────────────────────────────────────────

    #[test]
    fn closest_returns_sorted_prefix() {
        let mut table = NodeTable::new(Keypair::generate().id());
        for i in 0..50 {
            table.insert(Keypair::generate().id(), endpoint(i));
        }
        let target = Keypair::generate().id().address();
        let closest = table.closest(&target, 16);
        assert_eq!(closest.len(), 16.min(table.len()));

        // Sorted by the exact XOR metric, nearest first.
        for pair in closest.windows(2) {
            assert!(xor_key(&pair[0].id.address(), &target) <= xor_key(&pair[1].id.address(), &target));
        }

        // Nothing outside the result is closer than anything inside it.
        let worst = xor_key(&closest[closest.len() - 1].id.address(), &target);
        for bucket in &table.buckets {
            for entry in bucket {
                if !closest.iter().any(|c| c.id == entry.id) {
                    assert!(xor_key(&entry.id.address(), &target) >= worst);
                }
            }
        }
    }

    #[test]
    fn closest_on_sparse_table_returns_everything() {
        let mut table = NodeTable::new(Keypair::generate().id());
        for i in 0..3 {
            table.insert(Keypair::generate().id(), endpoint(i));
        }
        assert_eq!(table.closest(&[0u8; 20], 16).len(), 3);
    }
}
