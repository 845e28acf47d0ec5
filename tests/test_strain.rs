// tests/test_strain.rs -- Local least squares strain on synthetic fields.

use dicer::displacement::DisplacementResult;
use dicer::error::DicError;
use dicer::stop::StopFlag;
use dicer::strain::{StrainEstimator, COEFF_ADJUST};

fn estimator() -> StrainEstimator {
    StrainEstimator::new(StopFlag::new())
}

#[test]
fn linear_field_matches_slopes() {
    let field = DisplacementResult::from_fn(40, 30, |x, y| Some((0.01 * x as f64, 0.02 * y as f64)));
    let out = estimator().estimate(&field, 7, 0, 1).unwrap();
    assert!(out.complete);
    assert_eq!(out.result.defined_count(), 40 * 30);
    for y in 0..30 {
        for x in 0..40 {
            let s = out.result.get(x, y).unwrap();
            assert!((s.exx - 0.01 * COEFF_ADJUST).abs() < 1e-8, "({x}, {y}): {s:?}");
            assert!((s.eyy - 0.02 * COEFF_ADJUST).abs() < 1e-8, "({x}, {y}): {s:?}");
            assert!(s.exy.abs() < 1e-8, "({x}, {y}): {s:?}");
        }
    }
}

#[test]
fn noise_shows_up_in_quality() {
    // Deterministic checkerboard noise on v only.
    let field = DisplacementResult::from_fn(20, 20, |x, y| {
        let noise = if (x + y) % 2 == 0 { 0.05 } else { -0.05 };
        Some((0.0, 0.01 * y as f64 + noise))
    });
    let out = estimator().estimate(&field, 4, 0, 1).unwrap();
    let (qu, qv) = out.result.quality(10, 10);
    assert!(qu < 1e-12, "{qu}");
    assert!(qv > 0.01, "{qv}");
}

#[test]
fn holes_leave_isolated_pixels_undefined() {
    let mut field = DisplacementResult::new(30, 30);
    // A filled block and a lone pixel far from it.
    for y in 5..15 {
        for x in 5..15 {
            field.set(x, y, Some((0.03 * x as f64, 0.0)));
        }
    }
    field.set(25, 25, Some((1.0, 1.0)));
    let out = estimator().estimate(&field, 3, 0, 2).unwrap();

    assert!((out.result.get(10, 10).unwrap().exx - 3.0).abs() < 1e-8);
    assert_eq!(out.result.get(25, 25), None);
    assert_eq!(out.result.quality(25, 25), (1.0, 1.0));
    assert_eq!(out.result.get(0, 0), None);
    assert!(out.result.quality(0, 0).0.is_nan());
}

#[test]
fn source_round_must_precede_target() {
    let field = DisplacementResult::uniform(8, 8, (0.0, 0.0));
    for (from, to) in [(1, 1), (4, 2)] {
        let err = estimator().estimate(&field, 3, from, to).unwrap_err();
        assert!(matches!(err, DicError::InvalidRoundOrder { .. }), "{err}");
    }
}

#[test]
fn stop_request_yields_incomplete_field() {
    let field = DisplacementResult::uniform(64, 64, (0.5, 0.5));
    let est = estimator();
    est.stop_handle().stop();
    let out = est.estimate(&field, 5, 0, 1).unwrap();
    assert!(!out.complete);
    assert!(out.result.defined_count() < 64 * 64);
}
