use chrono::NaiveDate;
use ndarray::{array, Array2};

use enso_dem::pipeline::{include_time_lag, CsvColumns, CsvPipeline, LagSettings, Pipeline};

fn monthly_csv(n: usize) -> String {
    let mut out = String::from("date,oni,wwv,extra\n");
    for i in 0..n {
        let year = 1980 + i / 12;
        let month = i % 12 + 1;
        // wwv has a gap that must be filled after scaling.
        let wwv = if i == 5 {
            String::new()
        } else {
            format!("{}", (i as f64 * 0.5).cos())
        };
        out.push_str(&format!(
            "{}-{:02},{},{},{}\n",
            year,
            month,
            i as f64 * 0.1,
            wwv,
            i
        ));
    }
    out
}

fn columns() -> CsvColumns {
    CsvColumns {
        date: "date".to_string(),
        target: "oni".to_string(),
        features: vec!["oni".to_string(), "wwv".to_string()],
    }
}

fn lags() -> LagSettings {
    LagSettings {
        n_lags: 2,
        step: 3,
        shift: 1,
    }
}

#[test]
/// Verifies label alignment:
/// labels start lead + n_lags*step + shift rows in and persistence is the label at observation time.
fn csv_pipeline_aligns_features_labels_and_time() {
    let pipeline = CsvPipeline::from_reader(monthly_csv(40).as_bytes(), &columns(), lags())
        .expect("csv should load");
    assert_eq!(pipeline.len(), 40);

    let out = pipeline.load(2, true).expect("lead 2 should load");
    let data = &out.dataset;
    // offset = 2 + 2*3 + 1 = 9
    assert_eq!(data.len(), 31);
    assert_eq!(data.n_features(), 4);
    assert_eq!(data.time[0], NaiveDate::from_ymd_opt(1980, 10, 1).unwrap());
    assert!((data.y[0] - 0.9).abs() < 1e-12);

    let persistence = out.persistence.expect("persistence requested");
    assert_eq!(persistence.len(), data.len());
    assert!((persistence[0] - 0.6).abs() < 1e-12);

    assert!(data.x.iter().all(|v| v.is_finite()));
    assert!(pipeline.load(2, false).expect("load").persistence.is_none());
}

#[test]
/// Verifies the latest feature row stacks the most recent lags.
fn latest_features_uses_last_rows() {
    let pipeline = CsvPipeline::from_reader(monthly_csv(24).as_bytes(), &columns(), lags())
        .expect("csv should load");
    let latest = pipeline.latest_features().expect("enough rows");
    assert_eq!(latest.dim(), (1, 4));
    assert_eq!(
        pipeline.last_date(),
        Some(NaiveDate::from_ymd_opt(1981, 12, 1).unwrap())
    );
    // oni is linear in time, so its scaled lag difference is constant.
    let full = pipeline.load(0, false).expect("load");
    let step_diff = full.dataset.x[[1, 0]] - full.dataset.x[[0, 0]];
    assert!((latest[[0, 0]] - latest[[0, 2]] - 3.0 * step_diff).abs() < 1e-9);
}

#[test]
/// Verifies configuration problems in the table are reported.
fn csv_pipeline_rejects_bad_tables() {
    let mut missing = columns();
    missing.features.push("taux".to_string());
    assert!(CsvPipeline::from_reader(monthly_csv(20).as_bytes(), &missing, lags()).is_err());

    let unordered = "date,oni,wwv\n1980-02,0.1,0.2\n1980-01,0.3,0.4\n";
    assert!(CsvPipeline::from_reader(unordered.as_bytes(), &columns(), lags()).is_err());

    let pipeline = CsvPipeline::from_reader(monthly_csv(10).as_bytes(), &columns(), lags())
        .expect("csv should load");
    assert!(pipeline.load(5, false).is_err());
}

#[test]
/// Verifies plain closures satisfy the pipeline contract.
fn closures_are_pipelines() {
    let inner = CsvPipeline::from_reader(monthly_csv(30).as_bytes(), &columns(), lags())
        .expect("csv should load");
    let wrapped = |lead: u32, persist: bool| inner.load(lead + 1, persist);
    let direct = inner.load(1, false).expect("direct");
    let via_closure = wrapped.load(0, false).expect("closure");
    assert_eq!(direct.dataset, via_closure.dataset);
}

#[test]
fn time_lag_matches_manual_stacking() {
    let x = array![[0.0, 10.0], [1.0, 11.0], [2.0, 12.0], [3.0, 13.0], [4.0, 14.0]];
    let lagged = include_time_lag(x.view(), 2, 2).expect("enough rows");
    let expected: Array2<f64> = array![[4.0, 14.0, 2.0, 12.0]];
    assert_eq!(lagged, expected);
    assert!(include_time_lag(x.view(), 3, 2).is_err());
}
