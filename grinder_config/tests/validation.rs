use grinder_config::{RatePolicy, RunMode, load_toml};
use rstest::rstest;

#[rstest]
#[case("[dose]\ntarget_single_g = 0.0", "dose.target_single_g must be in (0, 500]")]
#[case("[dose]\ntarget_double_g = 900.0", "dose.target_double_g must be in (0, 500]")]
#[case("[dose]\ntop_up_margin_single_g = -1.0", "dose.top_up_margin_single_g must be in [0, 10]")]
#[case("[dose]\nmax_topup_pulses = 0", "dose.max_topup_pulses must be >= 1")]
#[case("[dose]\nfallback_rate_gps = 0.0", "dose.fallback_rate_gps must be > 0")]
#[case("[dose]\ngrinding_timeout_ms = 0", "dose.grinding_timeout_ms must be >= 1")]
#[case(
    "[dose]\nstability_min_wait_ms = 6000\nstability_max_wait_ms = 5000",
    "dose.stability_min_wait_ms must be <= dose.stability_max_wait_ms"
)]
#[case("[scale]\nread_samples = 0", "scale.read_samples must be in [1, 64]")]
#[case("[scale]\ncalibration_factor = 0.0", "scale.calibration_factor must be finite")]
#[case("[scale]\ngain_pulses = 4", "scale.gain_pulses must be in [1, 3]")]
#[case("[runner]\nperiod_ms = 0", "runner.period_ms must be >= 1")]
#[case("[logging]\nrotation = \"weekly\"", "logging.rotation must be one of")]
fn rejects_out_of_range(#[case] toml: &str, #[case] needle: &str) {
    let cfg = load_toml(toml).expect("parse TOML");
    let err = cfg.validate().expect_err("should be rejected");
    assert!(
        err.to_string().contains(needle),
        "expected '{needle}' in '{err}'"
    );
}

#[test]
fn accepts_full_config() {
    let toml = r#"
[pins]
hx711_dt = 5
hx711_sck = 6
relay = 17
button_left = 22
button_right = 23
button_back = 24

[dose]
target_single_g = 18.0
target_double_g = 36.0
top_up_margin_single_g = 1.5
top_up_margin_double_g = 2.0
min_topup_g = 0.2
rate_policy = "observed_pulse"
grinding_timeout_ms = 30000

[buttons]
debounce_ms = 150
min_hold_ms = 20

[scale]
read_samples = 4
calibration_factor = 1100.5
stable_band_g = 0.05

[runner]
mode = "direct"
period_ms = 10
"#;
    let cfg = load_toml(toml).expect("parse TOML");
    cfg.validate().expect("valid config should pass");
    assert_eq!(cfg.dose.rate_policy, RatePolicy::ObservedPulse);
    assert_eq!(cfg.runner.mode, RunMode::Direct);
    assert!((cfg.dose.top_up_margin_double_g - 2.0).abs() < f32::EPSILON);
    // untouched fields keep defaults
    assert_eq!(cfg.dose.finalize_timeout_ms, 5000);
}

#[test]
fn unknown_rate_policy_is_a_parse_error() {
    let err = load_toml("[dose]\nrate_policy = \"magic\"").expect_err("bad enum");
    assert!(err.to_string().contains("rate_policy") || err.to_string().contains("variant"));
}

#[test]
fn save_then_load_preserves_edits() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grinder.toml");
    let mut cfg = grinder_config::Config::default();
    cfg.dose.target_single_g = 17.5;
    cfg.buttons.debounce_ms = 90;
    grinder_config::save_toml(&cfg, &path).unwrap();

    let back = grinder_config::load_path(&path).unwrap();
    assert!((back.dose.target_single_g - 17.5).abs() < f32::EPSILON);
    assert_eq!(back.buttons.debounce_ms, 90);
    // temp file is renamed away
    assert!(!path.with_extension("toml.new").exists());
}
