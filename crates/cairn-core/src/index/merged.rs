//! Merged view over multiple pack indexes.
//!
//! Several indexes may carry entries for the same content ID (a content
//! re-written, deleted, or compacted over time). The merged view resolves
//! every conflict deterministically: latest timestamp wins, then non-deleted
//! over deleted, then the greatest pack blob ID. The result is independent
//! of the order the underlying indexes were supplied.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;

use cairn_types::content_id::ContentId;

use crate::error::Result;

use super::format::{PackIndex, PackIndexIter};
use super::{ContentInfo, IdRange};

/// A list of pack indexes queried as one.
#[derive(Clone, Default)]
pub struct MergedIndex {
    indexes: Vec<Arc<PackIndex>>,
}

impl MergedIndex {
    pub fn new(indexes: Vec<Arc<PackIndex>>) -> Self {
        Self { indexes }
    }

    pub fn push(&mut self, index: Arc<PackIndex>) {
        self.indexes.push(index);
    }

    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }

    /// Sum of entry counts across underlying indexes; an upper bound on the
    /// number of distinct IDs.
    pub fn approximate_count(&self) -> usize {
        self.indexes.iter().map(|n| n.approximate_count()).sum()
    }

    /// Look up one content ID, resolving conflicts across indexes.
    pub fn get_info(&self, content_id: &ContentId) -> Result<Option<ContentInfo>> {
        let mut best: Option<ContentInfo> = None;
        for ndx in &self.indexes {
            if let Some(found) = ndx.get_info(content_id)? {
                best = match best {
                    Some(current) if current.supersedes(&found) => Some(current),
                    _ => Some(found),
                };
            }
        }
        Ok(best)
    }

    /// Invoke `cb` for each distinct content ID within `range`, in ascending
    /// order, with conflict resolution applied per ID. Each ID is yielded at
    /// most once; callback errors short-circuit and propagate unchanged.
    pub fn iterate(
        &self,
        range: &IdRange,
        cb: &mut dyn FnMut(ContentInfo) -> Result<()>,
    ) -> Result<()> {
        let mut heap: BinaryHeap<Reverse<Cursor<'_>>> = BinaryHeap::new();

        for ndx in &self.indexes {
            let mut iter = ndx.iter(range)?;
            if let Some(first) = iter.next() {
                heap.push(Reverse(Cursor {
                    current: first?,
                    iter,
                }));
            }
        }

        while let Some(Reverse(mut top)) = heap.pop() {
            let id = top.current.content_id.clone();
            let mut best = top.current;
            if let Some(next) = top.iter.next() {
                top.current = next?;
                heap.push(Reverse(top));
            }

            // Fold every other index's entry for the same ID.
            while heap
                .peek()
                .is_some_and(|Reverse(c)| c.current.content_id == id)
            {
                let Reverse(mut dup) = heap.pop().expect("peeked entry present");
                if dup.current.supersedes(&best) {
                    best = dup.current.clone();
                }
                if let Some(next) = dup.iter.next() {
                    dup.current = next?;
                    heap.push(Reverse(dup));
                }
            }

            cb(best)?;
        }

        Ok(())
    }
}

impl std::fmt::Debug for MergedIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergedIndex")
            .field("indexes", &self.indexes.len())
            .finish()
    }
}

/// Per-index iteration state for the k-way merge. Ordered by current
/// content ID only.
struct Cursor<'a> {
    current: ContentInfo,
    iter: PackIndexIter<'a>,
}

impl PartialEq for Cursor<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.current.content_id == other.current.content_id
    }
}

impl Eq for Cursor<'_> {}

impl PartialOrd for Cursor<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Cursor<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.current.content_id.cmp(&other.current.content_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CairnError;
    use crate::index::Builder;
    use cairn_types::blob_id::BlobId;

    fn info(id: &str, ts: i64, pack: &str, offset: u32, deleted: bool) -> ContentInfo {
        ContentInfo {
            content_id: ContentId::parse(id).unwrap(),
            timestamp_seconds: ts,
            pack_blob_id: BlobId::from(pack),
            pack_offset: offset,
            original_length: 10,
            packed_length: 10,
            compression_header_id: 0,
            format_version: 1,
            encryption_key_id: 0,
            deleted,
        }
    }

    fn index_with_items(items: Vec<ContentInfo>) -> Arc<PackIndex> {
        let mut b = Builder::new();
        for i in items {
            b.add(i);
        }
        let mut buf = Vec::new();
        b.build(&mut buf).unwrap();
        Arc::new(PackIndex::open(Box::new(buf)).unwrap())
    }

    fn collect_ids(m: &MergedIndex, range: IdRange) -> Vec<String> {
        let mut out = Vec::new();
        m.iterate(&range, &mut |i| {
            out.push(i.content_id.to_string());
            Ok(())
        })
        .unwrap();
        out
    }

    fn three_way_merged() -> MergedIndex {
        let i1 = index_with_items(vec![
            info("aabbcc", 1, "xx", 11, false),
            info("ddeeff", 1, "xx", 111, false),
            info("z010203", 1, "xx", 111, false),
            info("de1e1e", 4, "xx", 111, false),
        ]);
        let i2 = index_with_items(vec![
            info("aabbcc", 3, "yy", 33, false),
            info("xaabbcc", 1, "xx", 111, false),
            info("de1e1e", 4, "xx", 222, true),
        ]);
        let i3 = index_with_items(vec![
            info("aabbcc", 2, "zz", 22, false),
            info("ddeeff", 1, "zz", 222, false),
            info("k010203", 1, "xx", 111, false),
            info("k020304", 1, "xx", 111, false),
        ]);
        MergedIndex::new(vec![i1, i2, i3])
    }

    #[test]
    fn latest_timestamp_wins() {
        let m = three_way_merged();
        assert_eq!(m.approximate_count(), 11);

        let i = m
            .get_info(&ContentId::parse("aabbcc").unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(i.pack_blob_id, BlobId::from("yy"));
        assert_eq!(i.pack_offset, 33);
    }

    #[test]
    fn non_deleted_preferred_on_timestamp_tie() {
        let m = three_way_merged();
        let i = m
            .get_info(&ContentId::parse("de1e1e").unwrap())
            .unwrap()
            .unwrap();
        assert!(!i.deleted);
        assert_eq!(i.pack_offset, 111);

        // Iteration applies the same precedence.
        m.iterate(&IdRange::all(), &mut |i| {
            if i.content_id.as_str() == "de1e1e" {
                assert!(!i.deleted, "iteration preferred deleted over non-deleted");
            }
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn iteration_yields_each_id_once_in_order() {
        let m = three_way_merged();
        assert_eq!(
            collect_ids(&m, IdRange::all()),
            vec!["aabbcc", "ddeeff", "de1e1e", "k010203", "k020304", "xaabbcc", "z010203"]
        );
        assert_eq!(
            collect_ids(&m, IdRange::new("a", "e")),
            vec!["aabbcc", "ddeeff", "de1e1e"]
        );
        assert_eq!(collect_ids(&m, IdRange::prefixed("dd")), vec!["ddeeff"]);
        assert_eq!(
            collect_ids(&m, IdRange::new("dd", "df")),
            vec!["ddeeff", "de1e1e"]
        );
    }

    #[test]
    fn callback_error_propagates() {
        let m = three_way_merged();
        let err = m
            .iterate(&IdRange::all(), &mut |i| {
                if i.content_id.as_str() == "aabbcc" {
                    Err(CairnError::Other("some error".into()))
                } else {
                    Ok(())
                }
            })
            .unwrap_err();
        assert!(matches!(err, CairnError::Other(msg) if msg == "some error"));
    }

    #[test]
    fn empty_merged_index_does_not_invoke_callback() {
        let m = MergedIndex::default();
        m.iterate(&IdRange::all(), &mut |_| {
            Err(CairnError::Other("must not be called".into()))
        })
        .unwrap();
        assert!(m
            .get_info(&ContentId::parse("aabbcc").unwrap())
            .unwrap()
            .is_none());
    }

    #[test]
    fn result_is_independent_of_index_order() {
        let i1 = index_with_items(vec![
            info("aabbcc", 1, "xx", 11, false),
            info("bbccdd", 1, "xx", 11, false),
            info("ccddee", 1, "ff", 11, true),
        ]);
        let i2 = index_with_items(vec![
            info("aabbcc", 1, "yy", 33, false),
            info("bbccdd", 1, "yy", 11, true),
            info("ccddee", 1, "gg", 11, true),
        ]);
        let i3 = index_with_items(vec![
            info("aabbcc", 1, "zz", 22, false),
            info("bbccdd", 1, "zz", 11, true),
            info("ccddee", 1, "hh", 11, true),
        ]);

        let orders = [
            vec![i1.clone(), i2.clone(), i3.clone()],
            vec![i1.clone(), i3.clone(), i2.clone()],
            vec![i2.clone(), i1.clone(), i3.clone()],
            vec![i2.clone(), i3.clone(), i1.clone()],
            vec![i3.clone(), i1.clone(), i2.clone()],
            vec![i3, i2, i1],
        ];

        for order in orders {
            let m = MergedIndex::new(order);

            // All things equal, highest pack blob ID wins.
            let i = m
                .get_info(&ContentId::parse("aabbcc").unwrap())
                .unwrap()
                .unwrap();
            assert_eq!(i.pack_blob_id, BlobId::from("zz"));

            // Identical timestamps: non-deleted wins.
            let i = m
                .get_info(&ContentId::parse("bbccdd").unwrap())
                .unwrap()
                .unwrap();
            assert_eq!(i.pack_blob_id, BlobId::from("xx"));

            // Identical timestamps, all deleted: highest pack blob ID wins.
            let i = m
                .get_info(&ContentId::parse("ccddee").unwrap())
                .unwrap()
                .unwrap();
            assert_eq!(i.pack_blob_id, BlobId::from("hh"));
        }
    }
}
