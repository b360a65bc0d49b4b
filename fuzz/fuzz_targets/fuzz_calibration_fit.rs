#![no_main]
use grinder_config::{CalibrationRow, ScaleFit};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|rows: Vec<(i64, f32)>| {
    let rows: Vec<CalibrationRow> = rows
        .into_iter()
        .map(|(raw, grams)| CalibrationRow { raw, grams })
        .collect();
    if let Ok(fit) = ScaleFit::from_rows(&rows) {
        assert!(fit.counts_per_gram.is_finite() && fit.counts_per_gram != 0.0);
    }
});
