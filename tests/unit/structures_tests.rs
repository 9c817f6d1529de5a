//! Property tests for the level index and tests for the object pool.

use exchange_sequencer::sequencer::{BalancedIndexTree, ObjectPool};
use proptest::prelude::*;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
enum Op {
    Insert(i64),
    Remove(i64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (-200i64..200).prop_map(Op::Insert),
        (-200i64..200).prop_map(Op::Remove),
    ]
}

proptest! {
    #[test]
    fn tree_matches_ordered_map(ops in prop::collection::vec(op(), 1..300)) {
        let mut tree = BalancedIndexTree::new();
        let mut model = BTreeMap::new();
        for op in ops {
            match op {
                Op::Insert(key) => {
                    let id = tree.insert(key, key * 10);
                    model.entry(key).or_insert(key * 10);
                    prop_assert_eq!(tree.key(id), Some(key));
                }
                Op::Remove(key) => {
                    prop_assert_eq!(tree.remove(key), model.remove(&key));
                }
            }
            prop_assert!(tree.is_balanced());
        }
        prop_assert_eq!(tree.len(), model.len());
        prop_assert_eq!(tree.keys(), model.keys().copied().collect::<Vec<_>>());
        let reversed: Vec<i64> = tree.iter_rev().map(|(k, _)| k).collect();
        prop_assert_eq!(reversed, model.keys().rev().copied().collect::<Vec<_>>());
        for (key, value) in &model {
            prop_assert_eq!(tree.get(*key), Some(value));
        }
    }

    #[test]
    fn tree_height_is_logarithmic(count in 1usize..2_000) {
        let mut tree = BalancedIndexTree::new();
        for key in 0..count as i64 {
            tree.insert(key, ());
        }
        let first = tree.first().and_then(|id| tree.key(id));
        prop_assert_eq!(first, Some(0));
        let bound = (1.45 * ((count + 2) as f64).log2()).ceil() as u32;
        let root_height = (0..count as i64)
            .filter_map(|key| tree.height(key))
            .max()
            .unwrap_or(0);
        prop_assert!(root_height <= bound, "height {} > bound {}", root_height, bound);
    }
}

#[test]
fn tree_walk_between_neighbours() {
    let mut tree = BalancedIndexTree::new();
    for key in [50, 10, 30, 70, 90] {
        tree.insert(key, format!("level-{key}"));
    }
    let id = tree.find(30).expect("present");
    let next = tree.next(id).expect("next");
    assert_eq!(tree.node(next).map(|(k, v)| (k, v.as_str())), Some((50, "level-50")));
    let prev = tree.prev(id).expect("prev");
    assert_eq!(tree.key(prev), Some(10));
    assert!(tree.prev(tree.first().expect("first")).is_none());
    assert!(tree.next(tree.last().expect("last")).is_none());

    if let Some(value) = tree.get_mut(70) {
        value.push('!');
    }
    assert_eq!(tree.get(70).map(String::as_str), Some("level-70!"));
}

#[test]
fn pool_reuses_released_objects() {
    let mut pool: ObjectPool<Vec<u64>> =
        ObjectPool::new(Vec::new, |v: &mut Vec<u64>| v.clear(), 2);
    assert_eq!(pool.pool_size(), 2);

    let mut a = pool.borrow();
    a.extend([1, 2, 3]);
    let b = pool.borrow_with(|v| v.push(9));
    assert_eq!(b, vec![9]);
    let c = pool.borrow();
    assert_eq!(pool.created_count(), 3);
    assert_eq!(pool.borrowed_count(), 3);

    pool.release(a);
    pool.release(b);
    pool.release(c);
    assert_eq!(pool.borrowed_count(), 0);
    assert_eq!(pool.pool_size(), 3);

    for _ in 0..3 {
        assert!(pool.borrow().is_empty());
    }
    assert_eq!(pool.created_count(), 3);
}
