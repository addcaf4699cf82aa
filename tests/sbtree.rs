//! Whole-tree scenarios for the standard variant: variable-length values,
//! external-value links, key encryption end to end, splits over full
//! pages, rollback after mid-operation failures, and a randomized soak
//! against a BTreeMap oracle.

use std::collections::BTreeMap;
use std::sync::Arc;

use arbor::{AtomicOperationsManager, EncryptionCodec, FileLockManager, SbTree, SbValue};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;

fn new_tree(dir: &tempfile::TempDir, name: &str) -> SbTree<i32, String> {
    SbTree::create(
        dir.path().join(format!("{name}.arb")),
        name,
        None,
        Arc::new(FileLockManager::new()),
        Arc::new(AtomicOperationsManager::new()),
    )
    .unwrap()
}

fn collect_keys(tree: &SbTree<i32, String>) -> Vec<i32> {
    let mut keys = Vec::new();
    if let Some(first) = tree.first_key().unwrap() {
        tree.load_entries_major(&first, true, true, |entry| {
            keys.push(entry.key);
            true
        })
        .unwrap();
    }
    keys
}

#[test]
fn variable_length_values_round_trip() {
    let dir = tempdir().unwrap();
    let tree = new_tree(&dir, "vars");

    tree.put(&1, &"short".to_owned()).unwrap();
    tree.put(&2, &"a considerably longer value".to_owned())
        .unwrap();

    assert_eq!(
        tree.get(&1).unwrap(),
        Some(SbValue::Inline("short".to_owned()))
    );
    assert_eq!(
        tree.get(&2).unwrap(),
        Some(SbValue::Inline("a considerably longer value".to_owned()))
    );
}

#[test]
fn overwrite_with_a_different_length_value() {
    let dir = tempdir().unwrap();
    let tree = new_tree(&dir, "resize");

    tree.put(&7, &"tiny".to_owned()).unwrap();
    tree.put(&7, &"a replacement that is much longer than before".to_owned())
        .unwrap();

    assert_eq!(
        tree.get(&7).unwrap(),
        Some(SbValue::Inline(
            "a replacement that is much longer than before".to_owned()
        ))
    );
    assert_eq!(tree.size().unwrap(), 1);
    tree.check_consistency().unwrap();
}

#[test]
fn link_values_replace_and_read_back() {
    let dir = tempdir().unwrap();
    let tree = new_tree(&dir, "links");

    tree.put(&5, &"inline".to_owned()).unwrap();
    tree.put_link(&5, 1234).unwrap();

    assert_eq!(tree.get(&5).unwrap(), Some(SbValue::Link(1234)));
    assert_eq!(tree.remove(&5).unwrap(), Some(SbValue::Link(1234)));
    assert!(tree.get(&5).unwrap().is_none());
}

#[test]
fn sequential_inserts_split_across_pages() {
    let dir = tempdir().unwrap();
    let tree = new_tree(&dir, "pages");

    for key in 0..2_000 {
        tree.put(&key, &format!("value-{key:06}")).unwrap();
    }

    assert_eq!(tree.size().unwrap(), 2_000);
    assert!(tree.page_count().unwrap() > 1);
    tree.check_consistency().unwrap();

    assert_eq!(tree.first_key().unwrap(), Some(0));
    assert_eq!(tree.last_key().unwrap(), Some(1_999));
    assert_eq!(
        tree.get(&1_234).unwrap(),
        Some(SbValue::Inline("value-001234".to_owned()))
    );
}

#[test]
fn reverse_order_inserts_stay_sorted() {
    let dir = tempdir().unwrap();
    let tree = new_tree(&dir, "reverse");

    for key in (0..1_000).rev() {
        tree.put(&key, &format!("v{key}")).unwrap();
    }

    assert_eq!(collect_keys(&tree), (0..1_000).collect::<Vec<_>>());
    tree.check_consistency().unwrap();
}

#[test]
fn scans_cross_page_boundaries() {
    let dir = tempdir().unwrap();
    let tree = new_tree(&dir, "scan");

    for key in 0..3_000 {
        tree.put(&key, &format!("{key}")).unwrap();
    }

    let mut seen = Vec::new();
    tree.load_entries_between(&995, true, &1_005, true, |entry| {
        seen.push(entry.key);
        true
    })
    .unwrap();
    assert_eq!(seen, (995..=1_005).collect::<Vec<_>>());

    let values = tree.values_between(&10, true, &12, true, 0).unwrap();
    assert_eq!(
        values,
        vec![
            SbValue::Inline("10".to_owned()),
            SbValue::Inline("11".to_owned()),
            SbValue::Inline("12".to_owned()),
        ]
    );

    let mut descending = Vec::new();
    tree.load_entries_minor(&1_005, false, |entry| {
        descending.push(entry.key);
        descending.len() < 10
    })
    .unwrap();
    assert_eq!(descending, (995..=1_004).rev().collect::<Vec<_>>());
}

#[test]
fn descending_major_scan_is_rejected() {
    let dir = tempdir().unwrap();
    let tree = new_tree(&dir, "desc");
    tree.put(&1, &"v".to_owned()).unwrap();

    assert!(tree
        .load_entries_major(&0, true, false, |_| true)
        .is_err());
}

struct RotCodec;

impl EncryptionCodec for RotCodec {
    fn encrypt(&self, plain: &[u8]) -> Vec<u8> {
        plain.iter().map(|b| b.wrapping_add(13)).collect()
    }

    fn decrypt(&self, cipher: &[u8]) -> Vec<u8> {
        cipher.iter().map(|b| b.wrapping_sub(13)).collect()
    }
}

#[test]
fn encrypted_trees_behave_like_plain_ones() {
    let dir = tempdir().unwrap();
    let tree: SbTree<i32, String> = SbTree::create(
        dir.path().join("secret.arb"),
        "secret",
        Some(Arc::new(RotCodec)),
        Arc::new(FileLockManager::new()),
        Arc::new(AtomicOperationsManager::new()),
    )
    .unwrap();

    for key in 0..500 {
        tree.put(&key, &format!("secret-{key}")).unwrap();
    }

    assert_eq!(
        tree.get(&123).unwrap(),
        Some(SbValue::Inline("secret-123".to_owned()))
    );
    assert_eq!(tree.first_key().unwrap(), Some(0));
    assert_eq!(tree.last_key().unwrap(), Some(499));
    assert!(tree.remove(&123).unwrap().is_some());
    assert!(tree.get(&123).unwrap().is_none());
    tree.check_consistency().unwrap();
}

#[test]
fn failed_put_rolls_back_to_the_pre_operation_image() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("poison.arb");
    let tree: SbTree<i32, String> = SbTree::create(
        &path,
        "poison",
        None,
        Arc::new(FileLockManager::new()),
        Arc::new(AtomicOperationsManager::new()),
    )
    .unwrap();

    for key in 0..800 {
        tree.put(&key, &format!("value-{key:04}")).unwrap();
    }
    tree.flush().unwrap();
    let snapshot = std::fs::read(&path).unwrap();

    // a value larger than a page fails only after splits tried to make room
    let oversized = "y".repeat(20_000);
    assert!(tree.put(&400, &oversized).is_err());

    tree.flush().unwrap();
    let after = std::fs::read(&path).unwrap();
    assert_eq!(&after[..snapshot.len()], &snapshot[..]);

    tree.check_consistency().unwrap();
    assert_eq!(tree.size().unwrap(), 800);
    assert_eq!(
        tree.get(&400).unwrap(),
        Some(SbValue::Inline("value-0400".to_owned()))
    );
}

#[test]
fn clear_resets_to_an_empty_root() {
    let dir = tempdir().unwrap();
    let tree = new_tree(&dir, "clear");

    for key in 0..1_500 {
        tree.put(&key, &format!("{key}")).unwrap();
    }
    let pages = tree.page_count().unwrap();

    tree.clear().unwrap();

    assert_eq!(tree.size().unwrap(), 0);
    assert!(tree.first_key().unwrap().is_none());
    assert_eq!(tree.page_count().unwrap(), pages);
    tree.check_consistency().unwrap();

    tree.put(&9, &"back".to_owned()).unwrap();
    assert_eq!(collect_keys(&tree), vec![9]);
}

#[test]
fn load_reopens_a_persisted_tree() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("persist.arb");
    let locks = Arc::new(FileLockManager::new());
    let atomics = Arc::new(AtomicOperationsManager::new());

    {
        let tree: SbTree<i32, String> =
            SbTree::create(&path, "persist", None, locks.clone(), atomics.clone()).unwrap();
        for key in 0..300 {
            tree.put(&key, &format!("v{key}")).unwrap();
        }
        tree.flush().unwrap();
    }

    let tree: SbTree<i32, String> =
        SbTree::load(&path, "persist", None, locks, atomics).unwrap();

    assert_eq!(tree.size().unwrap(), 300);
    assert_eq!(
        tree.get(&250).unwrap(),
        Some(SbValue::Inline("v250".to_owned()))
    );
    tree.check_consistency().unwrap();
}

#[test]
fn random_operations_match_a_btreemap_oracle() {
    let dir = tempdir().unwrap();
    let tree = new_tree(&dir, "oracle");
    let mut oracle: BTreeMap<i32, String> = BTreeMap::new();
    let mut rng = StdRng::seed_from_u64(0xB07);

    for _ in 0..3_000 {
        let key = rng.gen_range(0..500);
        if rng.gen_bool(0.6) {
            let value = format!("v{}", rng.gen_range(0..100_000));
            tree.put(&key, &value).unwrap();
            oracle.insert(key, value);
        } else {
            let removed = tree.remove(&key).unwrap();
            let expected = oracle.remove(&key).map(SbValue::Inline);
            assert_eq!(removed, expected);
        }
    }

    assert_eq!(tree.size().unwrap(), oracle.len() as i64);
    assert_eq!(
        collect_keys(&tree),
        oracle.keys().copied().collect::<Vec<_>>()
    );
    tree.check_consistency().unwrap();
}
