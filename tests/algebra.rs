use packmask::Filter;
use proptest::prelude::*;

const NUM_OBJECTS: u64 = 200;
const BLOCK_POWER: u32 = 5;

/// A filter together with the dense model it was built from. Building from
/// inclusive runs (rather than single bits) exercises the prefix-full
/// representation and block-level fast paths, not just materialized blocks.
fn arb_filter() -> impl Strategy<Value = (Filter, Vec<bool>)> {
    let run = (0..NUM_OBJECTS).prop_flat_map(|a| (Just(a), a..NUM_OBJECTS.min(a + 70)));
    (any::<bool>(), proptest::collection::vec((run, any::<bool>()), 0..8)).prop_map(
        |(start_full, ops)| {
            let mut filter = if start_full {
                Filter::all_ones(NUM_OBJECTS, BLOCK_POWER).unwrap()
            } else {
                Filter::all_zeros(NUM_OBJECTS, BLOCK_POWER).unwrap()
            };
            let mut model = vec![start_full; NUM_OBJECTS as usize];
            for ((a, b), set) in ops {
                if set {
                    filter.set_between(a, b).unwrap();
                } else {
                    filter.reset_between(a, b).unwrap();
                }
                for bit in &mut model[a as usize..=b as usize] {
                    *bit = set;
                }
            }
            (filter, model)
        },
    )
}

fn assert_matches_model(filter: &Filter, model: &[bool]) {
    for (n, &bit) in model.iter().enumerate() {
        assert_eq!(filter.get_at(n as u64), bit, "row {n} disagrees");
    }
    assert_eq!(
        filter.count_ones(),
        model.iter().filter(|&&b| b).count() as u64
    );
}

proptest! {
    #[test]
    fn construction_matches_model((filter, model) in arb_filter()) {
        assert_matches_model(&filter, &model);
    }

    #[test]
    fn and_matches_model((mut x, mx) in arb_filter(), (y, my) in arb_filter()) {
        x.and(&y).unwrap();
        let expected: Vec<bool> = mx.iter().zip(&my).map(|(&a, &b)| a && b).collect();
        assert_matches_model(&x, &expected);
    }

    #[test]
    fn or_matches_model((mut x, mx) in arb_filter(), (y, my) in arb_filter()) {
        x.or(&y).unwrap();
        let expected: Vec<bool> = mx.iter().zip(&my).map(|(&a, &b)| a || b).collect();
        assert_matches_model(&x, &expected);
    }

    #[test]
    fn and_not_matches_model((mut x, mx) in arb_filter(), (y, my) in arb_filter()) {
        x.and_not(&y).unwrap();
        let expected: Vec<bool> = mx.iter().zip(&my).map(|(&a, &b)| a && !b).collect();
        assert_matches_model(&x, &expected);
    }

    #[test]
    fn not_matches_model((mut x, mx) in arb_filter()) {
        x.not().unwrap();
        let expected: Vec<bool> = mx.iter().map(|&a| !a).collect();
        assert_matches_model(&x, &expected);
    }

    #[test]
    fn double_negation_is_identity((mut x, _) in arb_filter()) {
        let before = x.try_clone().unwrap();
        x.not().unwrap();
        x.not().unwrap();
        prop_assert!(x == before);
    }

    #[test]
    fn and_commutes((x, _) in arb_filter(), (y, _) in arb_filter()) {
        let mut xy = x.try_clone().unwrap();
        xy.and(&y).unwrap();
        let mut yx = y.try_clone().unwrap();
        yx.and(&x).unwrap();
        prop_assert!(xy == yx);
    }

    #[test]
    fn or_commutes((x, _) in arb_filter(), (y, _) in arb_filter()) {
        let mut xy = x.try_clone().unwrap();
        xy.or(&y).unwrap();
        let mut yx = y.try_clone().unwrap();
        yx.or(&x).unwrap();
        prop_assert!(xy == yx);
    }

    #[test]
    fn range_queries_match_model((filter, model) in arb_filter(), a in 0..NUM_OBJECTS, b in 0..NUM_OBJECTS) {
        let (a, b) = (a.min(b), a.max(b));
        let slice = &model[a as usize..=b as usize];
        prop_assert_eq!(filter.is_empty_between(a, b), slice.iter().all(|&x| !x));
        prop_assert_eq!(filter.is_full_between(a, b), slice.iter().all(|&x| x));
        prop_assert_eq!(
            filter.count_ones_between(a, b),
            slice.iter().filter(|&&x| x).count() as u64
        );
    }

    #[test]
    fn iter_ones_matches_model((filter, model) in arb_filter()) {
        let rows: Vec<u64> = filter.iter_ones().collect();
        let expected: Vec<u64> = model
            .iter()
            .enumerate()
            .filter_map(|(n, &b)| b.then_some(n as u64))
            .collect();
        prop_assert_eq!(rows, expected);
    }
}
