#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! `grinder`: command-line front end for the grind-by-weight controller.

mod backend;
mod cli;
mod error_fmt;
mod logging;
mod rt;
mod run;
mod settings_cmd;
mod simulate;
mod store;
mod telemetry;

use std::path::Path;

use clap::Parser;
use eyre::WrapErr;
use grinder_config::Config;
use grinder_core::Settings;
use serde_json::json;

use crate::cli::{Cli, Commands, JSON_MODE, RtLock, SettingsCmd, json_mode};
use crate::error_fmt::{exit_code_for_error, format_error_json, humanize};

fn main() {
    let _ = color_eyre::install();
    let cli = Cli::parse();
    let _ = JSON_MODE.set(cli.json);

    if let Err(err) = real_main(cli) {
        tracing::error!(error = %err, "command failed");
        if json_mode() {
            eprintln!("{}", format_error_json(&err));
        } else {
            eprintln!("{}", humanize(&err));
        }
        std::process::exit(exit_code_for_error(&err));
    }
}

fn real_main(cli: Cli) -> eyre::Result<()> {
    let cfg = grinder_config::load_path(&cli.config)?;
    logging::init_logging(&logging::LogConfig::from_config(
        &cfg,
        &cli.log_level,
        cli.json,
    ))?;
    tracing::debug!(config = %cli.config.display(), "config loaded");

    match cli.cmd {
        Commands::Run {
            rt,
            rt_prio,
            rt_lock,
        } => {
            if rt {
                rt::setup_rt_once(rt_prio, rt_lock.unwrap_or_else(RtLock::os_default));
            }
            run::run(&cfg, &cli.config)
        }
        Commands::Simulate {
            button,
            grams,
            flow,
            max_ms,
        } => {
            let outcome = simulate::simulate(
                &cfg,
                &simulate::SimRequest {
                    button: button.into(),
                    grams,
                    flow_gps: flow,
                    max_ms,
                },
            )?;
            if json_mode() {
                println!("{}", outcome.to_json());
            } else {
                println!("{}", outcome.to_text());
            }
            Ok(())
        }
        Commands::SelfCheck => self_check(&cfg),
        Commands::Settings { cmd } => match cmd {
            SettingsCmd::Show => {
                println!("{}", settings_cmd::render(&Settings::from(&cfg), json_mode()));
                Ok(())
            }
            SettingsCmd::Set { key, value } => {
                let settings = settings_cmd::set(&cfg, &cli.config, &key, &value)?;
                if json_mode() {
                    println!("{}", settings_cmd::render(&settings, true));
                } else {
                    println!("{key} = {value}");
                }
                Ok(())
            }
        },
        Commands::Calibrate { csv, write } => calibrate(cfg, &cli.config, &csv, write),
    }
}

#[cfg(all(feature = "hardware", target_os = "linux"))]
fn self_check(cfg: &Config) -> eyre::Result<()> {
    let mut weight = backend::hw::open_weight(cfg)?;
    let mut relay = backend::hw::open_relay(cfg)?;
    let _buttons = backend::hw::open_buttons(cfg)?;
    report_check(
        "hardware",
        backend::check(&mut weight, &mut relay, cfg.scale.read_samples)?,
    );
    Ok(())
}

#[cfg(not(all(feature = "hardware", target_os = "linux")))]
fn self_check(cfg: &Config) -> eyre::Result<()> {
    let clock = grinder_traits::ManualClock::new();
    let mut b = backend::open_sim(
        cfg,
        backend::sim_params(cfg),
        std::sync::Arc::new(clock),
        grinder_core::SamplingMode::Direct,
    );
    report_check(
        "simulator",
        backend::check(&mut b.weight, &mut b.relay, cfg.scale.read_samples)?,
    );
    Ok(())
}

fn report_check(backend: &str, r: backend::CheckReport) {
    if json_mode() {
        println!(
            "{}",
            json!({
                "status": "ok",
                "backend": backend,
                "grams": r.grams,
                "raw": r.raw,
                "stable": r.stable,
            })
        );
    } else {
        println!(
            "OK ({backend}): {:.2} g, raw {}, {}",
            r.grams,
            r.raw,
            if r.stable { "stable" } else { "settling" }
        );
    }
}

fn calibrate(mut cfg: Config, config_path: &Path, csv: &Path, write: bool) -> eyre::Result<()> {
    let fit = grinder_config::load_calibration_csv(csv)?;
    tracing::info!(
        counts_per_gram = fit.counts_per_gram,
        zero_counts = fit.zero_counts,
        max_residual_g = fit.max_residual_g,
        "calibration fitted"
    );
    if write {
        fit.apply(&mut cfg.scale);
        cfg.validate().wrap_err("calibrated config")?;
        grinder_config::save_toml(&cfg, config_path)?;
    }
    if json_mode() {
        println!(
            "{}",
            json!({
                "calibration_factor": fit.counts_per_gram,
                "zero_counts": fit.zero_counts,
                "max_residual_g": fit.max_residual_g,
                "written": write,
            })
        );
    } else {
        println!(
            "calibration_factor = {}\nzero_counts = {}\nmax residual {:.3} g{}",
            fit.counts_per_gram,
            fit.zero_counts,
            fit.max_residual_g,
            if write { " (written to config)" } else { "" }
        );
    }
    Ok(())
}
