use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use enso_dem::config::{Config, MODEL_DIR_ENV};
use enso_dem::dist::DistributionMode;
use enso_dem::ForecastModel;

const MINIMAL: &str = r#"
[model]
name = "gdnn"

[model.hyperparameters]
neurons = [8, 16, "linear"]

[training]
n_iter = 2
lead_times = [0, 6]
prediction_start_year = 2002
model_dir = "models"

[data]
features_csv = "features.csv"
target_column = "oni"
feature_columns = ["oni", "wwv"]

[logging]
level = "debug"
"#;

fn temp_config(test_name: &str, body: &str) -> PathBuf {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock should be monotonic")
        .as_nanos();
    let path = std::env::temp_dir().join(format!("enso-dem-{}-{}.toml", test_name, ts));
    std::fs::write(&path, body).expect("write temp config");
    path
}

#[test]
/// Verifies the shipped default configuration parses and builds a model.
fn parse_default_toml() {
    let config = Config::load_from_path(Path::new("config/default.toml"))
        .expect("default config should load");
    assert_eq!(config.model.name, "gdnn_ex_pca");
    assert_eq!(config.training.lead_times.len(), 9);
    assert_eq!(config.data.feature_columns[0], "oni");
    assert!(config.training.seed.is_none());

    let model = config.build_model().expect("model should build");
    assert_eq!(model.name(), "gdnn_ex_pca");
    assert_eq!(model.mode(), DistributionMode::Normal);
    assert_eq!(model.search_space().len(), 2);

    let decades = config.training.decades().expect("decades");
    assert_eq!(decades.boundaries().first(), Some(&1963));
    assert_eq!(decades.boundaries().last(), Some(&2020));
}

#[test]
/// Verifies defaults for optional fields and the model directory override.
fn optional_fields_default_and_env_overrides_model_dir() {
    let path = temp_config("config-env", MINIMAL);

    std::env::set_var(MODEL_DIR_ENV, "/tmp/enso-dem-override");
    let overridden = Config::load_from_path(&path);
    std::env::remove_var(MODEL_DIR_ENV);
    let overridden = overridden.expect("config should load");
    assert_eq!(
        overridden.training.model_dir,
        PathBuf::from("/tmp/enso-dem-override")
    );
    assert_eq!(overridden.data.date_column, "date");
    assert_eq!(
        (overridden.data.n_lags, overridden.data.step, overridden.data.shift),
        (3, 3, 3)
    );
    assert_eq!(
        overridden.training.hindcast_csv,
        PathBuf::from("data/hindcast.csv")
    );
    assert!(!overridden.logging.json);

    let plain = Config::from_toml_str(MINIMAL).expect("config should parse");
    assert_eq!(plain.training.model_dir, PathBuf::from("models"));
    let _ = std::fs::remove_file(path);
}

#[test]
/// Verifies invalid settings are rejected before any training starts.
fn invalid_configs_are_rejected() {
    let cases = [
        MINIMAL.replace("name = \"gdnn\"", "name = \"a/b\""),
        MINIMAL.replace("n_iter = 2", "n_iter = 0"),
        MINIMAL.replace("lead_times = [0, 6]", "lead_times = []"),
        MINIMAL.replace("feature_columns = [\"oni\", \"wwv\"]", "feature_columns = []"),
        MINIMAL.replace("prediction_start_year = 2002", "prediction_start_year = 1960"),
        MINIMAL.replace("[8, 16, \"linear\"]", "[8, 16, \"quadratic\"]"),
        MINIMAL.replace("[model.hyperparameters]", "[model.hyperparameters]\npdf = \"cauchy\""),
    ];
    for body in cases {
        assert!(Config::from_toml_str(&body).is_err(), "accepted:\n{}", body);
    }
    assert!(Config::load_from_path(Path::new("config/does-not-exist.toml")).is_err());
}
