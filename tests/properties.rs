use ccs_conjoint::{choice_probability_left, ordered_levels, LevelCoordinate};
use proptest::prelude::*;

fn level() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["a", "b", "c", "d", "e"]).prop_map(str::to_string)
}

proptest! {
    #[test]
    fn baseline_always_comes_first(observed in prop::collection::vec(level(), 1..40), pick in 0usize..40) {
        let baseline = observed[pick % observed.len()].clone();
        let levels = ordered_levels(observed.iter().map(String::as_str), &baseline).unwrap();

        prop_assert_eq!(&levels[0], &baseline);
        let mut distinct = observed.clone();
        distinct.sort();
        distinct.dedup();
        prop_assert_eq!(levels.len(), distinct.len());

        // Remaining levels keep first-seen order.
        let mut expected = Vec::new();
        for v in &observed {
            if v != &baseline && !expected.contains(v) {
                expected.push(v.clone());
            }
        }
        prop_assert_eq!(&levels[1..], &expected[..]);
    }

    #[test]
    fn missing_baseline_yields_none(observed in prop::collection::vec(level(), 0..20)) {
        prop_assert!(ordered_levels(observed.iter().map(String::as_str), "zzz").is_none());
    }

    #[test]
    fn fingerprint_tracks_order(observed in prop::collection::vec(level(), 2..20)) {
        let mut distinct = observed.clone();
        distinct.sort();
        distinct.dedup();
        prop_assume!(distinct.len() >= 2);

        let forward = LevelCoordinate::from_blocks(&[("attr".to_string(), distinct.clone())]);
        let again = LevelCoordinate::from_blocks(&[("attr".to_string(), distinct.clone())]);
        distinct.reverse();
        let reversed = LevelCoordinate::from_blocks(&[("attr".to_string(), distinct)]);

        prop_assert_eq!(forward.fingerprint(), again.fingerprint());
        prop_assert_ne!(forward.fingerprint(), reversed.fingerprint());
    }

    #[test]
    fn probability_is_bounded_and_symmetric(ul in -60.0f64..60.0, ur in -60.0f64..60.0) {
        let p = choice_probability_left(ul, ur);
        let q = choice_probability_left(ur, ul);
        prop_assert!(p > 0.0 && p < 1.0);
        prop_assert!((p + q - 1.0).abs() < 1e-12);
        if ul > ur + 1e-6 {
            prop_assert!(p > 0.5);
        }
    }

    #[test]
    fn probability_depends_only_on_the_difference(ul in -20.0f64..20.0, ur in -20.0f64..20.0, shift in -50.0f64..50.0) {
        let p = choice_probability_left(ul, ur);
        let shifted = choice_probability_left(ul + shift, ur + shift);
        prop_assert!((p - shifted).abs() < 1e-9);
    }
}
