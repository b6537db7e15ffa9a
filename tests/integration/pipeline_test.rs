//! End-to-end runs: configured inputs on disk to artifacts on disk

use std::fs::{self, File};

use cohort_psm::algorithm::matching::ArtifactPaths;
use cohort_psm::utils::{read_table, write_csv};
use cohort_psm::{PsmError, StudyConfig, execute};
use parquet::arrow::ArrowWriter;

use crate::utils::{csv_header, int_column, study_config, synthetic_cohorts};

fn write_inputs(config: &StudyConfig, n_treated: usize, n_control: usize) {
    let (treated, control) = synthetic_cohorts(17, n_treated, n_control);
    write_csv(&config.users_path(), &treated).unwrap();
    write_csv(&config.nonusers_path(), &control).unwrap();
}

fn artifacts(config: &StudyConfig) -> ArtifactPaths {
    ArtifactPaths::for_cohort(&config.matched_pairs_dir(), &config.cohort_name)
}

#[test]
fn test_execute_writes_all_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let config = study_config(dir.path(), "glp1");
    write_inputs(&config, 60, 180);

    let result = execute(&config).unwrap();
    let paths = artifacts(&config);

    assert_eq!(
        csv_header(&paths.pairs),
        "user_person_id,nonuser_person_id,ps_distance"
    );
    assert_eq!(
        csv_header(&paths.balance),
        "feature,user_mean,non_user_mean,smd"
    );
    assert_eq!(
        csv_header(&paths.balance_prematch),
        "feature,user_mean,non_user_mean,smd"
    );

    let users_header = csv_header(&paths.matched_users);
    for column in ["person_id", "age", "treatment", "propensity", "logit_propensity"] {
        assert!(users_header.split(',').any(|c| c == column), "missing {column}");
    }

    let users = read_table(&paths.matched_users).unwrap();
    let nonusers = read_table(&paths.matched_nonusers).unwrap();
    let pairs = read_table(&paths.pairs).unwrap();
    assert_eq!(users.num_rows(), result.pairs.len());
    assert_eq!(nonusers.num_rows(), result.pairs.len());
    assert_eq!(pairs.num_rows(), result.pairs.len());
    assert_eq!(
        int_column(&pairs, "user_person_id"),
        result.pairs.iter().map(|p| p.user_person_id).collect::<Vec<_>>()
    );

    let summary: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&paths.summary).unwrap()).unwrap();
    assert_eq!(summary["cohort_name"], "glp1");
    assert_eq!(summary["treated_count"], 60);
    assert_eq!(summary["control_count"], 180);
    assert_eq!(summary["matched_pairs"], result.pairs.len());
    assert_eq!(summary["caliper_multiplier"], 0.2);
}

#[test]
fn test_parquet_inputs() {
    let dir = tempfile::tempdir().unwrap();
    let (treated, control) = synthetic_cohorts(23, 40, 120);

    let users_path = dir.path().join("users.parquet");
    let nonusers_path = dir.path().join("nonusers.parquet");
    for (path, batch) in [(&users_path, &treated), (&nonusers_path, &control)] {
        let mut writer = ArrowWriter::try_new(File::create(path).unwrap(), batch.schema(), None).unwrap();
        writer.write(batch).unwrap();
        writer.close().unwrap();
    }

    let mut config = study_config(dir.path(), "parquet");
    config.users_path = Some(users_path);
    config.nonusers_path = Some(nonusers_path);

    let result = execute(&config).unwrap();
    assert_eq!(result.treated_count, 40);
    assert_eq!(result.control_count, 120);
    assert!(artifacts(&config).pairs.exists());
}

#[test]
fn test_empty_control_file_writes_empty_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let config = study_config(dir.path(), "nocontrols");

    let (treated, _) = synthetic_cohorts(29, 10, 0);
    write_csv(&config.users_path(), &treated).unwrap();
    fs::write(config.nonusers_path(), "person_id,age,bmi,hba1c\n").unwrap();

    let result = execute(&config).unwrap();
    assert!(result.pairs.is_empty());

    let paths = artifacts(&config);
    assert_eq!(
        fs::read_to_string(&paths.pairs).unwrap().trim_end(),
        "user_person_id,nonuser_person_id,ps_distance"
    );
    assert_eq!(read_table(&paths.matched_users).unwrap().num_rows(), 0);
    assert_eq!(read_table(&paths.balance).unwrap().num_rows(), 0);
}

#[test]
fn test_failed_run_leaves_no_output() {
    let dir = tempfile::tempdir().unwrap();
    let config = study_config(dir.path(), "broken");

    let (treated, control) = synthetic_cohorts(31, 10, 20);
    write_csv(&config.users_path(), &treated).unwrap();
    write_csv(&config.nonusers_path(), &control).unwrap();

    // A treated subject reappears among the controls
    let mut text = fs::read_to_string(config.nonusers_path()).unwrap();
    text.push_str("1,50.0,30.0,7.0\n");
    fs::write(config.nonusers_path(), text).unwrap();

    let err = execute(&config).unwrap_err();
    assert!(matches!(err, PsmError::InvalidInput(_)));
    assert!(!config.matched_pairs_dir().exists());
}

#[test]
fn test_unknown_features_fail_before_writing() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = study_config(dir.path(), "nofeatures");
    config.matching_features = vec!["egfr".to_string(), "ldl".to_string()];
    write_inputs(&config, 10, 20);

    let err = execute(&config).unwrap_err();
    assert!(matches!(err, PsmError::ConfigurationError(_)));
    assert!(!config.matched_pairs_dir().exists());
}

#[test]
fn test_missing_input_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = study_config(dir.path(), "absent");

    let err = execute(&config).unwrap_err();
    match err {
        PsmError::IoError { path, .. } => assert_eq!(path, config.users_path()),
        other => panic!("unexpected error: {other}"),
    }
    assert!(!config.matched_pairs_dir().exists());
}
