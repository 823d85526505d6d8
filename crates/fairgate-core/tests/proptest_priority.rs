//! Property-based tests for priority encoding and watermark adaptation.

use std::collections::HashSet;

use fairgate_core::{
    shedder::{admit_more, shed_more},
    Adjustment, Histogram, Priority, ShedderTuning, WindowState, MAX_P,
};
use proptest::prelude::*;

/// Generator for a non-empty histogram over the full P range.
fn any_histogram() -> impl Strategy<Value = Vec<(u16, u64)>> {
    proptest::collection::vec((0u16..=MAX_P, 1u64..5_000), 1..40)
}

fn any_watermark() -> impl Strategy<Value = Priority> {
    (0u16..=MAX_P).prop_map(Priority::derive_from)
}

proptest! {
    #[test]
    fn test_encode_decode_bijection(b in 0i32..=127, u in 0i32..=127) {
        let encoded = Priority::encode(b, u).unwrap();
        let decoded = Priority::decode(i32::from(encoded.p())).unwrap();
        prop_assert_eq!(i32::from(decoded.b()), b);
        prop_assert_eq!(i32::from(decoded.u()), u);
    }

    #[test]
    fn test_encode_rejects_outside_seven_bits(b in 128i32..10_000, u in -10_000i32..0) {
        prop_assert!(Priority::encode(b, 0).is_err());
        prop_assert!(Priority::encode(0, u).is_err());
    }

    #[test]
    fn test_shed_never_widens_admission(
        counts in any_histogram(),
        watermark in any_watermark(),
        admitted in 0u64..100_000,
    ) {
        let histogram = Histogram::from_counts(counts);
        let adjustment = shed_more(watermark, &histogram, admitted, &ShedderTuning::default());
        prop_assert!(adjustment.watermark(watermark).p() <= watermark.p());
        if let Adjustment::Shed { to, .. } = adjustment {
            prop_assert!(histogram.get(to.p()) > 0);
        }
    }

    #[test]
    fn test_recover_never_narrows_admission(
        counts in any_histogram(),
        watermark in any_watermark(),
        admitted in 0u64..100_000,
    ) {
        let histogram = Histogram::from_counts(counts);
        let adjustment = admit_more(watermark, &histogram, admitted, &ShedderTuning::default());
        prop_assert!(adjustment.watermark(watermark).p() >= watermark.p());
    }

    #[test]
    fn test_idle_window_recovers_to_lowest(
        counts in any_histogram(),
        watermark in any_watermark(),
    ) {
        let histogram = Histogram::from_counts(counts);
        let adjustment = admit_more(watermark, &histogram, 0, &ShedderTuning::default());
        prop_assert!(adjustment.watermark(watermark).is_lowest());
    }

    #[test]
    fn test_window_conservation(
        samples in proptest::collection::vec((0u16..=MAX_P, any::<bool>()), 0..500),
    ) {
        let state = WindowState::new(0);
        for (p, admitted) in &samples {
            state.sample(Priority::derive_from(*p), *admitted);
        }
        prop_assert_eq!(state.histogram().total(), state.requested());
        prop_assert_eq!(state.requested(), samples.len() as u64);
        prop_assert!(state.admitted() <= state.requested());
    }
}

#[test]
fn test_decode_dense_over_full_range() {
    let mut seen = HashSet::new();
    for p in 0..=i32::from(MAX_P) {
        let decoded = Priority::decode(p).unwrap();
        assert_eq!(i32::from(decoded.p()), p);
        seen.insert(decoded);
    }
    assert_eq!(seen.len(), 16384);
}
