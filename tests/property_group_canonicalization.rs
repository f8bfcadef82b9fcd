//! Property-based tests (proptest) for authorization-group
//! canonicalization: the index partition key must be stable under any
//! permutation of groups, and sensitive to variable order within a group.

use deltasearch::{AuthGroup, GroupSet};
use proptest::prelude::*;

fn arb_group() -> impl Strategy<Value = AuthGroup> {
    (
        "[a-z]{1,8}",
        proptest::collection::vec("[a-z0-9]{0,4}", 0..3),
    )
        .prop_map(|(name, variables)| AuthGroup::new(name, variables))
}

fn arb_groups() -> impl Strategy<Value = Vec<AuthGroup>> {
    proptest::collection::vec(arb_group(), 0..6)
}

proptest! {
    /// Any permutation of the same groups canonicalizes to the same
    /// serialized partition key.
    #[test]
    fn canonical_serialization_is_permutation_invariant(
        groups in arb_groups(),
        seed in any::<u64>(),
    ) {
        let mut shuffled = groups.clone();
        // Deterministic pseudo-shuffle driven by the seed.
        let len = shuffled.len();
        if len > 1 {
            let mut state = seed;
            for i in (1..len).rev() {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let j = (state >> 33) as usize % (i + 1);
                shuffled.swap(i, j);
            }
        }

        let original = GroupSet::canonical(groups);
        let permuted = GroupSet::canonical(shuffled);
        prop_assert_eq!(original.serialized(), permuted.serialized());
    }

    /// Canonicalization is idempotent.
    #[test]
    fn canonicalization_is_idempotent(groups in arb_groups()) {
        let once = GroupSet::canonical(groups);
        let twice = GroupSet::canonical(once.groups().to_vec());
        prop_assert_eq!(once.serialized(), twice.serialized());
    }

    /// The serialized form survives a round trip through the header codec.
    #[test]
    fn serialization_roundtrips_through_header(groups in arb_groups()) {
        let set = GroupSet::canonical(groups);
        let parsed = GroupSet::parse_header(&set.serialized()).unwrap();
        prop_assert_eq!(set, parsed);
    }
}

/// Variable order is semantically significant and must never be normalized
/// away.
#[test]
fn variable_order_changes_the_partition_key() {
    let forward = GroupSet::canonical(vec![AuthGroup::new(
        "org",
        vec!["alpha".to_string(), "beta".to_string()],
    )]);
    let reversed = GroupSet::canonical(vec![AuthGroup::new(
        "org",
        vec!["beta".to_string(), "alpha".to_string()],
    )]);
    assert_ne!(forward.serialized(), reversed.serialized());
}

/// Distinct groups can collide on the sort key ("org" + ["x"] and "orgx"
/// both key as "orgx"); the canonical order must still be permutation
/// independent.
#[test]
fn equal_sort_keys_are_permutation_invariant() {
    let a = AuthGroup::new("org", vec!["x".to_string()]);
    let b = AuthGroup::new("orgx", vec![]);
    let one = GroupSet::canonical(vec![a.clone(), b.clone()]);
    let two = GroupSet::canonical(vec![b, a]);
    assert_eq!(one.serialized(), two.serialized());
}
