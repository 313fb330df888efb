//! End-to-end coverage for the B+ tree: the public contract, persistence
//! across close/reopen, split and rebalance pressure, and read-only mode.

use burrow::{BPlusTree, Error, MemBlobStore, Store, TreeOptions, IN_MEMORY_PATH};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tempfile::{tempdir, TempDir};

fn disk_path(dir: &TempDir) -> String {
    dir.path().join("index.bur").display().to_string()
}

/// Degrees collapse to 3 at 4 KiB pages with 600-byte keys, so modest key
/// counts build multi-level trees.
fn tiny_opts() -> TreeOptions {
    TreeOptions::default().page_size(4096).max_key_size(600)
}

fn collect(tree: &BPlusTree, start: &[u8], reverse: bool) -> Vec<(Vec<u8>, u64)> {
    let mut seen = Vec::new();
    tree.scan(start, reverse, |k, v| {
        seen.push((k.to_vec(), v));
        false
    })
    .unwrap();
    seen
}

mod contract {
    use super::*;

    #[test]
    fn basic_put_get_size_scan() {
        let tree = BPlusTree::open(
            IN_MEMORY_PATH,
            TreeOptions::default().max_key_size(4).page_size(4096),
        )
        .unwrap();

        tree.put(b"A", 1).unwrap();
        tree.put(b"B", 2).unwrap();
        tree.put(b"C", 3).unwrap();

        assert_eq!(tree.get(b"B").unwrap(), Some(2));
        assert_eq!(tree.size(), 3);
        assert_eq!(
            collect(&tree, b"", false),
            vec![
                (b"A".to_vec(), 1),
                (b"B".to_vec(), 2),
                (b"C".to_vec(), 3),
            ]
        );
    }

    #[test]
    fn ten_thousand_big_endian_keys() {
        let tree = BPlusTree::open(IN_MEMORY_PATH, TreeOptions::default()).unwrap();

        for i in 0u32..10_000 {
            tree.put(&i.to_be_bytes(), u64::from(i)).unwrap();
        }

        assert_eq!(tree.size(), 10_000);

        let seen = collect(&tree, b"", false);
        assert_eq!(seen.len(), 10_000);
        for (i, (k, v)) in seen.iter().enumerate() {
            assert_eq!(k, &(i as u32).to_be_bytes());
            assert_eq!(*v, i as u64);
        }

        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut ids: Vec<u32> = (0..10_000).collect();
        ids.shuffle(&mut rng);
        for i in ids {
            assert_eq!(tree.get(&i.to_be_bytes()).unwrap(), Some(u64::from(i)));
        }
    }

    #[test]
    fn overwrite_keeps_size_stable() {
        let tree = BPlusTree::open(IN_MEMORY_PATH, TreeOptions::default()).unwrap();

        tree.put(b"hello", 12345).unwrap();
        tree.put(b"hello", 120012).unwrap();

        assert_eq!(tree.size(), 1);
        assert_eq!(tree.get(b"hello").unwrap(), Some(120012));
    }

    #[test]
    fn key_length_boundaries() {
        let tree = BPlusTree::open(
            IN_MEMORY_PATH,
            TreeOptions::default().max_key_size(4),
        )
        .unwrap();

        tree.put(b"abcd", 1).unwrap();
        assert_eq!(tree.get(b"abcd").unwrap(), Some(1));

        let err = tree.put(b"hello", 2).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::KeyTooLarge { size: 5, max: 4 })
        ));

        let err = tree.put(b"", 0).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::EmptyKey)));

        let err = tree.get(b"").unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::EmptyKey)));
    }

    #[test]
    fn empty_tree_behaviors() {
        let tree = BPlusTree::open(IN_MEMORY_PATH, TreeOptions::default()).unwrap();

        assert_eq!(tree.get(b"anything").unwrap(), None);
        assert_eq!(tree.size(), 0);
        assert!(collect(&tree, b"", false).is_empty());
        assert!(collect(&tree, b"", true).is_empty());
    }

    #[test]
    fn random_insertion_order_scans_sorted() {
        let tree = BPlusTree::open(IN_MEMORY_PATH, tiny_opts()).unwrap();

        let mut rng = rand::rngs::StdRng::seed_from_u64(99);
        let mut ids: Vec<u32> = (0..500).collect();
        ids.shuffle(&mut rng);
        for i in &ids {
            tree.put(format!("k{i:06}").as_bytes(), u64::from(*i))
                .unwrap();
        }

        let seen = collect(&tree, b"", false);
        assert_eq!(seen.len(), 500);
        for window in seen.windows(2) {
            assert!(window[0].0 < window[1].0, "forward scan must be sorted");
        }

        let reversed = collect(&tree, b"", true);
        let mut expected = seen.clone();
        expected.reverse();
        assert_eq!(reversed, expected);
    }

    #[test]
    fn scan_from_key_lower_bound_semantics() {
        let tree = BPlusTree::open(IN_MEMORY_PATH, tiny_opts()).unwrap();
        for i in (0u32..100).map(|i| i * 2) {
            tree.put(format!("k{i:04}").as_bytes(), u64::from(i)).unwrap();
        }

        // present key: starts exactly there
        let seen = collect(&tree, b"k0050", false);
        assert_eq!(seen[0].0, b"k0050".to_vec());

        // absent key: starts at the smallest key greater than it
        let seen = collect(&tree, b"k0051", false);
        assert_eq!(seen[0].0, b"k0052".to_vec());

        // past the end: nothing
        assert!(collect(&tree, b"k9999", false).is_empty());
    }
}

mod persistence {
    use super::*;

    #[test]
    fn alphabet_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = disk_path(&dir);

        {
            let tree = BPlusTree::open(&path, TreeOptions::default()).unwrap();
            for (i, c) in (b'A'..=b'Z').enumerate() {
                tree.put(&[c], i as u64 + 1).unwrap();
            }
            tree.close().unwrap();
        }

        let tree = BPlusTree::open(&path, TreeOptions::default()).unwrap();
        assert_eq!(tree.size(), 26);

        let seen = collect(&tree, b"", false);
        assert_eq!(seen.len(), 26);
        for (i, (k, v)) in seen.iter().enumerate() {
            assert_eq!(k, &vec![b'A' + i as u8]);
            assert_eq!(*v, i as u64 + 1);
        }
    }

    #[test]
    fn multi_level_tree_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = disk_path(&dir);

        {
            let tree = BPlusTree::open(&path, tiny_opts()).unwrap();
            for i in 0u32..300 {
                tree.put(format!("key-{i:05}").as_bytes(), u64::from(i))
                    .unwrap();
            }
            tree.close().unwrap();
        }

        let tree = BPlusTree::open(&path, tiny_opts()).unwrap();
        assert_eq!(tree.size(), 300);
        for i in 0u32..300 {
            assert_eq!(
                tree.get(format!("key-{i:05}").as_bytes()).unwrap(),
                Some(u64::from(i)),
                "key {i}"
            );
        }

        let reversed = collect(&tree, b"", true);
        assert_eq!(reversed.len(), 300);
        assert_eq!(reversed[0].0, b"key-00299".to_vec());
        assert_eq!(reversed[299].0, b"key-00000".to_vec());
    }

    #[test]
    fn deletes_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = disk_path(&dir);

        {
            let tree = BPlusTree::open(&path, tiny_opts()).unwrap();
            for i in 0u32..200 {
                tree.put(format!("key-{i:05}").as_bytes(), u64::from(i))
                    .unwrap();
            }
            for i in (0u32..200).step_by(3) {
                assert_eq!(
                    tree.del(format!("key-{i:05}").as_bytes()).unwrap(),
                    Some(u64::from(i))
                );
            }
            tree.close().unwrap();
        }

        let tree = BPlusTree::open(&path, tiny_opts()).unwrap();
        let expected: Vec<u32> = (0..200).filter(|i| i % 3 != 0).collect();
        assert_eq!(tree.size(), expected.len() as i64);

        for i in 0u32..200 {
            let want = (i % 3 != 0).then(|| u64::from(i));
            assert_eq!(
                tree.get(format!("key-{i:05}").as_bytes()).unwrap(),
                want,
                "key {i}"
            );
        }

        let seen = collect(&tree, b"", false);
        let keys: Vec<Vec<u8>> = expected
            .iter()
            .map(|i| format!("key-{i:05}").into_bytes())
            .collect();
        assert_eq!(seen.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(), keys);
    }

    #[test]
    fn implicit_flush_on_drop() {
        let dir = tempdir().unwrap();
        let path = disk_path(&dir);

        {
            let tree = BPlusTree::open(&path, TreeOptions::default()).unwrap();
            tree.put(b"dropped", 9).unwrap();
            // no explicit close
        }

        let tree = BPlusTree::open(&path, TreeOptions::default()).unwrap();
        assert_eq!(tree.get(b"dropped").unwrap(), Some(9));
    }

    #[test]
    fn stored_options_govern_reopen() {
        let dir = tempdir().unwrap();
        let path = disk_path(&dir);

        {
            let tree =
                BPlusTree::open(&path, TreeOptions::default().max_key_size(8).page_size(4096))
                    .unwrap();
            tree.put(b"12345678", 1).unwrap();
            tree.close().unwrap();
        }

        // a different max_key_size in the options is ignored for an
        // existing file; the stored limit still applies
        let tree =
            BPlusTree::open(&path, TreeOptions::default().max_key_size(100).page_size(4096))
                .unwrap();
        let err = tree.put(b"123456789", 2).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::KeyTooLarge { .. })
        ));
    }

    #[test]
    fn page_size_mismatch_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = disk_path(&dir);

        {
            let tree =
                BPlusTree::open(&path, TreeOptions::default().page_size(8192)).unwrap();
            tree.put(b"k", 1).unwrap();
            tree.close().unwrap();
        }

        let err = BPlusTree::open(&path, TreeOptions::default().page_size(4096)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::Corrupt { .. })
        ));
    }

    #[test]
    fn garbage_file_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = disk_path(&dir);
        std::fs::write(&path, vec![0xABu8; 8192]).unwrap();

        let err = BPlusTree::open(&path, TreeOptions::default().page_size(4096)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::Corrupt { .. })
        ));
    }
}

mod read_only {
    use super::*;

    #[test]
    fn missing_file_cannot_open_read_only() {
        let dir = tempdir().unwrap();
        let result = BPlusTree::open(
            &disk_path(&dir),
            TreeOptions::default().read_only(true),
        );
        assert!(result.is_err());
    }

    #[test]
    fn empty_file_cannot_initialize_read_only() {
        let dir = tempdir().unwrap();
        let path = disk_path(&dir);
        std::fs::write(&path, b"").unwrap();

        let err = BPlusTree::open(&path, TreeOptions::default().read_only(true)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::Corrupt { .. })
        ));
    }

    #[test]
    fn existing_file_reads_but_refuses_writes() {
        let dir = tempdir().unwrap();
        let path = disk_path(&dir);

        {
            let tree = BPlusTree::open(&path, TreeOptions::default()).unwrap();
            tree.put(b"a", 1).unwrap();
            tree.put(b"b", 2).unwrap();
            tree.close().unwrap();
        }

        let tree = BPlusTree::open(&path, TreeOptions::default().read_only(true)).unwrap();

        assert_eq!(tree.get(b"a").unwrap(), Some(1));
        assert_eq!(collect(&tree, b"", false).len(), 2);

        let err = tree.put(b"c", 3).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::ReadOnly)));

        let err = tree.del(b"a").unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::ReadOnly)));

        tree.close().unwrap();
    }
}

mod rebalancing {
    use super::*;

    #[test]
    fn drain_ascending_then_refill() {
        let tree = BPlusTree::open(IN_MEMORY_PATH, tiny_opts()).unwrap();

        for i in 0u32..250 {
            tree.put(format!("key-{i:05}").as_bytes(), u64::from(i))
                .unwrap();
        }
        for i in 0u32..250 {
            assert_eq!(
                tree.del(format!("key-{i:05}").as_bytes()).unwrap(),
                Some(u64::from(i)),
                "delete {i}"
            );
            assert_eq!(tree.size(), i64::from(249 - i));
        }

        for i in 0u32..250 {
            tree.put(format!("key-{i:05}").as_bytes(), u64::from(i) + 1000)
                .unwrap();
        }
        assert_eq!(tree.size(), 250);
        assert_eq!(tree.get(b"key-00042").unwrap(), Some(1042));
    }

    #[test]
    fn drain_descending_exercises_left_merges() {
        let tree = BPlusTree::open(IN_MEMORY_PATH, tiny_opts()).unwrap();

        for i in 0u32..250 {
            tree.put(format!("key-{i:05}").as_bytes(), u64::from(i))
                .unwrap();
        }
        for i in (0u32..250).rev() {
            assert_eq!(
                tree.del(format!("key-{i:05}").as_bytes()).unwrap(),
                Some(u64::from(i)),
                "delete {i}"
            );
        }
        assert_eq!(tree.size(), 0);
    }

    #[test]
    fn random_churn_stays_consistent() {
        let tree = BPlusTree::open(IN_MEMORY_PATH, tiny_opts()).unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(1234);
        let mut live = std::collections::BTreeMap::new();

        let mut ids: Vec<u32> = (0..400).collect();
        ids.shuffle(&mut rng);
        for &i in &ids {
            tree.put(format!("key-{i:05}").as_bytes(), u64::from(i))
                .unwrap();
            live.insert(format!("key-{i:05}").into_bytes(), u64::from(i));
        }

        ids.shuffle(&mut rng);
        for &i in ids.iter().take(250) {
            let key = format!("key-{i:05}").into_bytes();
            assert_eq!(tree.del(&key).unwrap(), live.remove(&key));
        }

        assert_eq!(tree.size(), live.len() as i64);
        let seen = collect(&tree, b"", false);
        let expected: Vec<(Vec<u8>, u64)> =
            live.iter().map(|(k, v)| (k.clone(), *v)).collect();
        assert_eq!(seen, expected);

        let mut reversed = expected;
        reversed.reverse();
        assert_eq!(collect(&tree, b"", true), reversed);
    }

    #[test]
    fn reverse_scan_correct_after_splits_and_merges() {
        let tree = BPlusTree::open(IN_MEMORY_PATH, tiny_opts()).unwrap();

        for i in 0u32..120 {
            tree.put(format!("key-{i:05}").as_bytes(), u64::from(i))
                .unwrap();
        }
        for i in (0u32..120).step_by(2) {
            tree.del(format!("key-{i:05}").as_bytes()).unwrap();
        }

        let reversed = collect(&tree, b"", true);
        let expected: Vec<Vec<u8>> = (0u32..120)
            .filter(|i| i % 2 == 1)
            .rev()
            .map(|i| format!("key-{i:05}").into_bytes())
            .collect();
        assert_eq!(
            reversed.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(),
            expected
        );
    }
}

mod concurrency {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn readers_run_alongside_a_writer() {
        let tree = Arc::new(BPlusTree::open(IN_MEMORY_PATH, TreeOptions::default()).unwrap());
        for i in 0u32..1_000 {
            tree.put(&i.to_be_bytes(), u64::from(i)).unwrap();
        }

        let mut handles = Vec::new();
        for t in 0..4u32 {
            let tree = Arc::clone(&tree);
            handles.push(thread::spawn(move || {
                for i in (t * 250)..(t * 250 + 250) {
                    assert_eq!(tree.get(&i.to_be_bytes()).unwrap(), Some(u64::from(i)));
                }
            }));
        }

        for i in 1_000u32..1_200 {
            tree.put(&i.to_be_bytes(), u64::from(i)).unwrap();
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(tree.size(), 1_200);
    }
}

mod store_facade {
    use super::*;

    #[test]
    fn store_round_trip_on_disk_index() {
        let dir = tempdir().unwrap();
        let path = disk_path(&dir);

        let mut store =
            Store::open(&path, TreeOptions::default(), MemBlobStore::new()).unwrap();

        store.put(b"city", b"wellington").unwrap();
        store.put(b"bird", b"kea").unwrap();

        assert_eq!(store.get(b"bird").unwrap(), Some(b"kea".to_vec()));
        assert_eq!(store.len(), 2);

        assert!(store.del(b"city").unwrap());
        assert_eq!(store.get(b"city").unwrap(), None);
        assert_eq!(store.len(), 1);
    }
}
