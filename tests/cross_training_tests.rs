use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::NaiveDate;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::SeedableRng;

use enso_dem::cross_training::{cell_dir_name, cross_training, DecadeTable};
use enso_dem::dem::DeepEnsembleModel;
use enso_dem::hindcast::{cross_hindcast, forecast};
use enso_dem::hyperparams::ParamInput;
use enso_dem::pipeline::PipelineOutput;
use enso_dem::Dataset;

fn temp_model_dir(test_name: &str) -> PathBuf {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock should be monotonic")
        .as_nanos();
    std::env::temp_dir().join(format!("enso-dem-{}-{}", test_name, ts))
}

fn month(i: usize) -> NaiveDate {
    NaiveDate::from_ymd_opt(1960 + (i / 12) as i32, (i % 12) as u32 + 1, 1).unwrap()
}

/// Monthly series from 1960-01 through 1984-12, labels shifted by the lead.
fn synthetic_pipeline(lead_time: u32, return_persistence: bool) -> anyhow::Result<PipelineOutput> {
    let n = 300;
    let lead = lead_time as usize;
    let x = Array2::from_shape_fn((n, 2), |(i, j)| ((i + j * 3) as f64 / 6.0).sin());
    let y: Array1<f64> = (0..n).map(|i| ((i + lead) as f64 / 6.0).sin()).collect();
    let time = (0..n).map(month).collect();
    Ok(PipelineOutput {
        dataset: Dataset::new(x, y, time)?,
        persistence: return_persistence.then(|| (0..n).map(|i| (i as f64 / 6.0).sin()).collect()),
    })
}

fn tiny_model() -> DeepEnsembleModel {
    DeepEnsembleModel::with_hyperparameters([
        ("name", ParamInput::from("tiny")),
        ("neurons", ParamInput::linear(2i64, 3i64)),
        ("epochs", ParamInput::from(2i64)),
        ("patience", ParamInput::from(1i64)),
        ("batch_size", ParamInput::from(32i64)),
        ("dropout", ParamInput::from(0.0)),
        ("n_segments", ParamInput::from(2i64)),
    ])
    .expect("tiny hyperparameters should be valid")
}

fn snapshot(dir: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    let mut files = BTreeMap::new();
    for cell in std::fs::read_dir(dir).expect("model dir readable") {
        let cell = cell.expect("entry").path();
        for file in std::fs::read_dir(&cell).expect("cell readable") {
            let file = file.expect("entry").path();
            let bytes = std::fs::read(&file).expect("file readable");
            files.insert(file, bytes);
        }
    }
    files
}

#[test]
/// Verifies decade membership at a boundary year:
/// 1975-06-01 is tested by the 1972 cell and trained on by the 1963 cell.
fn mid_decade_date_belongs_to_its_cell_only() {
    let table = DecadeTable::new(vec![1963, 1972, 1982]).expect("valid table");
    let cells = table.cells();
    assert_eq!(cells.len(), 2);
    let date = [NaiveDate::from_ymd_opt(1975, 6, 1).unwrap()];
    assert_eq!(cells[0].test_mask(&date), vec![false]);
    assert_eq!(cells[1].test_mask(&date), vec![true]);
}

#[test]
/// Verifies resumability:
/// a second run over the same directory trains nothing and leaves files untouched.
fn second_run_skips_every_cell() {
    let root = temp_model_dir("cross-resume");
    let table = DecadeTable::new(vec![1963, 1972, 1982]).expect("valid table");
    let mut rng = StdRng::seed_from_u64(31);

    let first = cross_training(
        tiny_model,
        &synthetic_pipeline,
        2,
        &[0, 3],
        &table,
        &root,
        &mut rng,
    )
    .expect("first run should train");
    assert_eq!(first.trained.len(), 4);
    assert!(first.skipped.is_empty());
    assert!(root.join(cell_dir_name("tiny", 1972, 3)).is_dir());
    let before = snapshot(&root);

    let second = cross_training(
        tiny_model,
        &synthetic_pipeline,
        2,
        &[0, 3],
        &table,
        &root,
        &mut rng,
    )
    .expect("second run should succeed");
    assert!(second.trained.is_empty());
    assert_eq!(second.skipped.len(), 4);
    assert_eq!(snapshot(&root), before);
    let _ = std::fs::remove_dir_all(root);
}

#[test]
/// Verifies an empty cell directory does not count as trained.
fn empty_cell_directory_is_retrained() {
    let root = temp_model_dir("cross-empty-cell");
    std::fs::create_dir_all(root.join(cell_dir_name("tiny", 1963, 0))).expect("create cell");
    let table = DecadeTable::new(vec![1963, 1972]).expect("valid table");
    let mut rng = StdRng::seed_from_u64(32);

    let report = cross_training(
        tiny_model,
        &synthetic_pipeline,
        1,
        &[0],
        &table,
        &root,
        &mut rng,
    )
    .expect("run should succeed");
    assert_eq!(report.trained.len(), 1);
    assert!(root
        .join(cell_dir_name("tiny", 1963, 0))
        .join("member0.json")
        .is_file());
    let _ = std::fs::remove_dir_all(root);
}

#[test]
/// Verifies hindcast assembly and the operational forecast on trained cells.
fn hindcast_and_forecast_use_trained_cells() {
    let root = temp_model_dir("cross-hindcast");
    let table = DecadeTable::new(vec![1963, 1972, 1982]).expect("valid table");
    let mut rng = StdRng::seed_from_u64(33);
    cross_training(
        tiny_model,
        &synthetic_pipeline,
        1,
        &[0, 2],
        &table,
        &root,
        &mut rng,
    )
    .expect("training should succeed");

    let hindcast = cross_hindcast(&synthetic_pipeline, "tiny", &[0, 2], &table, &root)
        .expect("hindcast should succeed");
    // 1963-01 .. 1981-12
    assert_eq!(hindcast.time.len(), 19 * 12);
    assert_eq!(hindcast.time[0], NaiveDate::from_ymd_opt(1963, 1, 1).unwrap());
    assert_eq!(hindcast.leads.len(), 2);
    let skill = hindcast.skill().expect("skill should compute");
    for lead in &skill {
        assert!(lead.rmse.is_finite());
        assert!(lead.nll.expect("normal ensembles have nll").is_finite());
        assert!(lead.persistence_rmse.is_some());
    }

    let csv_path = root.join("out").join("hindcast.csv");
    hindcast.write_csv(&csv_path).expect("csv should be written");
    let text = std::fs::read_to_string(&csv_path).expect("csv readable");
    assert!(text.starts_with("target_time,lead_time,observed,mean,std,persistence"));
    assert_eq!(text.lines().count(), 1 + 2 * 19 * 12);

    let latest = Array2::from_elem((1, 2), 0.1);
    let forecasts =
        forecast("tiny", &[0, 2], &table, &root, latest.view()).expect("forecast should succeed");
    assert_eq!(forecasts.len(), 2);
    assert!(forecasts.iter().all(|f| f.mean.is_finite() && f.std.is_some()));
    let _ = std::fs::remove_dir_all(root);
}
