//! Worked matching scenarios with hand-checkable outcomes

use cohort_psm::algorithm::matching::{
    Arm, Diagnostic, compute_caliper, estimate_propensity, prepare_cohorts,
};
use cohort_psm::{MatchingConfig, PropensityMatcher, PsmError, RecordBatch, TreatedOrder};

use crate::utils::{cohort_batch, float_column, quiet_config, single_covariate};

#[test]
fn test_identical_covariates_pair_at_zero_distance() {
    let treated = single_covariate(&[1], "x", &[0.0]);
    let control = single_covariate(&[10, 11], "x", &[0.0, 5.0]);

    let result = PropensityMatcher::new(quiet_config())
        .perform_matching(&treated, &control, &["x".to_string()])
        .unwrap();

    assert_eq!(result.pairs.len(), 1);
    assert_eq!(result.pairs[0].user_person_id, 1);
    assert_eq!(result.pairs[0].nonuser_person_id, 10);
    assert!(result.pairs[0].ps_distance.abs() < 1e-12);
}

#[test]
fn test_empty_control_pool_yields_no_pairs() {
    let treated = single_covariate(&[1, 2], "x", &[0.0, 1.0]);
    let control = single_covariate(&[], "x", &[]);

    let result = PropensityMatcher::new(quiet_config())
        .perform_matching(&treated, &control, &["x".to_string()])
        .unwrap();

    assert!(result.pairs.is_empty());
    assert_eq!(result.matched_users.num_rows(), 0);
    assert_eq!(result.matched_nonusers.num_rows(), 0);
    assert_eq!(result.match_rate(), 0.0);
    assert!(result.model.is_none());
    assert!(
        result
            .diagnostics
            .iter()
            .any(|d| matches!(d, Diagnostic::NoMatchWarning { treated: 2, controls: 0, .. }))
    );
}

#[test]
fn test_empty_treated_table_is_an_error() {
    let treated = single_covariate(&[], "x", &[]);
    let control = single_covariate(&[10], "x", &[0.0]);

    let err = PropensityMatcher::new(quiet_config())
        .perform_matching(&treated, &control, &["x".to_string()])
        .unwrap_err();
    assert!(matches!(err, PsmError::EmptyInputError(_)));
}

#[test]
fn test_shared_nearest_control_goes_to_first_visited() {
    let control = single_covariate(&[10, 11, 12], "x", &[1.0, 5.0, 6.0]);
    let features = ["x".to_string()];

    let treated = single_covariate(&[1, 2], "x", &[1.0, 1.1]);
    let result = PropensityMatcher::new(quiet_config())
        .perform_matching(&treated, &control, &features)
        .unwrap();
    assert_eq!(result.pairs.len(), 1);
    assert_eq!(result.pairs[0].user_person_id, 1);
    assert_eq!(result.pairs[0].nonuser_person_id, 10);

    let reversed = single_covariate(&[2, 1], "x", &[1.1, 1.0]);
    let result = PropensityMatcher::new(quiet_config())
        .perform_matching(&reversed, &control, &features)
        .unwrap();
    assert_eq!(result.pairs.len(), 1);
    assert_eq!(result.pairs[0].user_person_id, 2);
    assert_eq!(result.pairs[0].nonuser_person_id, 10);

    let by_id = MatchingConfig::builder()
        .treated_order(TreatedOrder::PersonId)
        .show_progress(false)
        .build();
    let result = PropensityMatcher::new(by_id)
        .perform_matching(&reversed, &control, &features)
        .unwrap();
    assert_eq!(result.pairs[0].user_person_id, 1);
}

/// Treated x = 1..4 against controls at 0, 1, 1.5 and 2.5
fn overlapping_population() -> (RecordBatch, RecordBatch) {
    let treated = cohort_batch(
        &[1, 2, 3, 4],
        &[("x", vec![Some(1.0), Some(2.0), Some(3.0), Some(4.0)])],
    );
    let control = cohort_batch(
        &[5, 6, 7, 8],
        &[("x", vec![Some(0.0), Some(1.0), Some(1.5), Some(2.5)])],
    );
    (treated, control)
}

#[test]
fn test_caliper_is_fifth_of_pooled_logit_sd() {
    // Reference fit of the penalised model (C = 1) on the standardized
    // covariate: intercept 0.0074270625, slope 0.7426962239
    const TREATED_LOGITS: [f64; 4] = [
        -0.537_562_970_368_415,
        0.085_282_781_487_136_43,
        0.708_128_533_342_687_9,
        1.330_974_285_198_24,
    ];
    const CONTROL_LOGITS: [f64; 4] = [
        -1.160_408_722_223_966_3,
        -0.537_562_970_368_415,
        -0.226_140_094_440_639_3,
        0.396_705_657_414_912_2,
    ];
    const CALIPER: f64 = 0.148_539_244_782_755_5;

    let (treated, control) = overlapping_population();
    let features = ["x".to_string()];
    let config = MatchingConfig::builder()
        .tolerance(1e-10)
        .show_progress(false)
        .build();

    let prepared = prepare_cohorts(&treated, &control, &features).unwrap();
    let scores = estimate_propensity(&prepared, &config).unwrap();

    let treated_logits = float_column(&scores.treated, "logit_propensity");
    let control_logits = float_column(&scores.control, "logit_propensity");
    for (actual, expected) in treated_logits.iter().zip(TREATED_LOGITS) {
        assert!((actual - expected).abs() < 1e-6, "{actual} vs {expected}");
    }
    for (actual, expected) in control_logits.iter().zip(CONTROL_LOGITS) {
        assert!((actual - expected).abs() < 1e-6, "{actual} vs {expected}");
    }

    let caliper = compute_caliper(
        &scores.subjects(Arm::Treated).unwrap(),
        &scores.subjects(Arm::Control).unwrap(),
        0.2,
    );
    assert!((caliper - CALIPER).abs() < 1e-6);

    // Only subject 1 has a control within the caliper
    let result = PropensityMatcher::new(config)
        .perform_matching(&treated, &control, &features)
        .unwrap();
    assert!((result.caliper - CALIPER).abs() < 1e-6);
    assert_eq!(result.pairs.len(), 1);
    assert_eq!(result.pairs[0].user_person_id, 1);
    assert_eq!(result.pairs[0].nonuser_person_id, 6);
}

#[test]
fn test_iteration_cap_warns_and_still_matches() {
    let (treated, control) = overlapping_population();
    let config = MatchingConfig::builder()
        .max_iter(1)
        .tolerance(1e-12)
        .show_progress(false)
        .build();

    let result = PropensityMatcher::new(config)
        .perform_matching(&treated, &control, &["x".to_string()])
        .unwrap();

    assert!(
        result
            .diagnostics
            .iter()
            .any(|d| matches!(d, Diagnostic::ConvergenceWarning { iterations: 1, .. }))
    );
    assert_eq!(result.model.as_ref().map(|m| m.fit.converged), Some(false));
    assert!(!result.pairs.is_empty());
}

#[test]
fn test_imbalance_after_matching_is_reported() {
    // A wide caliper pairs 0 with 1 and 6 with 4; the matched means stay apart
    let treated = single_covariate(&[1, 2], "x", &[0.0, 6.0]);
    let control = single_covariate(&[10, 11], "x", &[1.0, 4.0]);
    let config = MatchingConfig::builder()
        .caliper_multiplier(100.0)
        .show_progress(false)
        .build();

    let result = PropensityMatcher::new(config)
        .perform_matching(&treated, &control, &["x".to_string()])
        .unwrap();

    assert_eq!(result.pairs.len(), 2);
    assert!(result.balance.metrics[0].smd > 0.1);
    assert!(result.diagnostics.iter().any(|d| matches!(
        d,
        Diagnostic::ImbalancedCovariate { feature, smd } if feature == "x" && *smd > 0.1
    )));
}

#[test]
fn test_propensity_columns_added_to_matched_tables() {
    let treated = single_covariate(&[1, 2], "x", &[0.0, 2.0]);
    let control = single_covariate(&[10, 11, 12], "x", &[0.1, 2.1, 9.0]);

    let result = PropensityMatcher::new(quiet_config())
        .perform_matching(&treated, &control, &["x".to_string()])
        .unwrap();

    for batch in [&result.matched_users, &result.matched_nonusers] {
        for column in ["person_id", "x", "treatment", "propensity", "logit_propensity"] {
            assert!(batch.column_by_name(column).is_some(), "missing {column}");
        }
        for p in float_column(batch, "propensity") {
            assert!(p > 0.0 && p < 1.0);
        }
    }
}
