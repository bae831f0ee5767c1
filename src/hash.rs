//! Consistent-hash downstream selection.
//!
//! Mirrors the C router's `find_downstream`/`hash` pair: an sdbm-style rolling hash of the
//! metric key feeds a Fisher-Yates-style reshuffle over the candidate set, so that repeated
//! calls with the same key and the same alive set always land on the same downstream.

/// sdbm-variant rolling hash over a byte slice.
///
/// Wraps on overflow by construction (`u64` arithmetic), matching the unsigned `unsigned long`
/// arithmetic of the original.
pub fn sdbm_hash(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0;
    for &b in bytes {
        h = (h << 6)
            .wrapping_add(h << 16)
            .wrapping_sub(h)
            .wrapping_add(b as u64);
    }
    h
}

/// Selects a live downstream index for `hash`, consulting `alive[i]` for each candidate `i`.
///
/// Returns `None` if every downstream is dead. The reshuffle is deterministic: for a fixed
/// `hash` and a fixed `alive` slice, the result never changes between calls.
pub fn select_downstream(mut hash: u64, alive: &[bool]) -> Option<usize> {
    let n = alive.len();
    if n == 0 {
        return None;
    }

    let mut candidates: Vec<usize> = (0..n).collect();

    for i in (1..=n).rev() {
        let j = (hash % i as u64) as usize;
        let k = candidates[j];

        if alive[k] {
            return Some(k);
        }

        if j != i - 1 {
            candidates.swap(j, i - 1);
        }

        // Quasi-random perturbation; without it the distribution over the remaining
        // candidates is badly skewed.
        hash = hash.wrapping_mul(7).wrapping_add(5) / 3;
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(sdbm_hash(b"foo.bar"), sdbm_hash(b"foo.bar"));
    }

    #[test]
    fn different_keys_usually_differ() {
        assert_ne!(sdbm_hash(b"foo.bar"), sdbm_hash(b"foo.baz"));
    }

    #[test]
    fn empty_key_hashes_to_zero() {
        assert_eq!(sdbm_hash(b""), 0);
    }

    #[test]
    fn selection_is_deterministic_for_fixed_alive_set() {
        let alive = vec![true, true, true, false, true];
        let h = sdbm_hash(b"some.metric.name");

        let first = select_downstream(h, &alive);
        let second = select_downstream(h, &alive);

        assert_eq!(first, second);
    }

    #[test]
    fn never_selects_a_dead_downstream() {
        let alive = vec![false, true, false, true, false];

        for key in ["a", "b", "metric.one", "metric.two", "x.y.z"] {
            let h = sdbm_hash(key.as_bytes());
            let chosen = select_downstream(h, &alive).expect("at least one alive downstream");
            assert!(alive[chosen]);
        }
    }

    #[test]
    fn returns_none_when_all_dead() {
        let alive = vec![false, false, false];
        assert_eq!(select_downstream(42, &alive), None);
    }

    #[test]
    fn single_alive_downstream_always_chosen() {
        let alive = vec![false, false, true];
        for key in 0u64..50 {
            assert_eq!(select_downstream(key, &alive), Some(2));
        }
    }

    proptest::proptest! {
        #[test]
        fn property_never_returns_dead_index(hash: u64, alive in proptest::collection::vec(proptest::bool::ANY, 1..16)) {
            if let Some(idx) = select_downstream(hash, &alive) {
                proptest::prop_assert!(alive[idx]);
            } else {
                proptest::prop_assert!(alive.iter().all(|a| !a));
            }
        }

        #[test]
        fn property_deterministic(hash: u64, alive in proptest::collection::vec(proptest::bool::ANY, 1..16)) {
            let a = select_downstream(hash, &alive);
            let b = select_downstream(hash, &alive);
            proptest::prop_assert_eq!(a, b);
        }
    }
}
