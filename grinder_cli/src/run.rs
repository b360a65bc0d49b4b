//! `grinder run`: the long-running controller.
//!
//! Button interrupts (GPIO on hardware) and stdin lines feed the same edge
//! queue, dose-request slot and settings handle the control loop polls.

use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use eyre::WrapErr;
use grinder_config::Config;
use grinder_core::{
    ButtonEdgeQueue, DoseRequest, LoopCfg, LoopExit, MachineBuilder, Settings, SettingsHandle,
    run_loop,
};
use grinder_traits::{ButtonId, ButtonInput, MonotonicClock, Relay, TimeBase, WeightSource};
use tracing::{info, warn};

use crate::backend;
use crate::settings_cmd;
use crate::store::TomlSettingsStore;

/// Handles shared between the control loop and its input sources. They
/// survive a controller restart.
#[derive(Clone)]
pub struct Inputs {
    pub time: TimeBase,
    pub edges: Arc<ButtonEdgeQueue>,
    pub requests: Arc<DoseRequest>,
    pub settings: SettingsHandle,
    pub shutdown: Arc<AtomicBool>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Press(ButtonId),
    Dose(f32),
    Set(String, String),
    Show,
    Reboot,
    Quit,
}

/// Parse one stdin line. `set:<key>:<value>` is accepted alongside
/// `set <key> <value>`. Blank lines yield `None`.
pub fn parse_command(line: &str) -> eyre::Result<Option<Command>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    if let Some(rest) = line.strip_prefix("set:") {
        let Some((key, value)) = rest.split_once(':') else {
            eyre::bail!("expected set:<key>:<value>");
        };
        return Ok(Some(Command::Set(key.to_string(), value.to_string())));
    }
    let mut words = line.split_whitespace();
    let cmd = match (words.next(), words.next(), words.next()) {
        (Some("left"), None, None) => Command::Press(ButtonId::Left),
        (Some("right"), None, None) => Command::Press(ButtonId::Right),
        (Some("back"), None, None) => Command::Press(ButtonId::Back),
        (Some("dose"), Some(g), None) => Command::Dose(
            g.parse()
                .map_err(|_| eyre::eyre!("dose: cannot parse '{g}' as grams"))?,
        ),
        (Some("set"), Some(k), Some(v)) => Command::Set(k.to_string(), v.to_string()),
        (Some("show"), None, None) => Command::Show,
        (Some("reboot"), None, None) => Command::Reboot,
        (Some("quit" | "exit"), None, None) => Command::Quit,
        _ => eyre::bail!(
            "unknown command '{line}' (left|right|back|dose <g>|set <k> <v>|show|reboot|quit)"
        ),
    };
    Ok(Some(cmd))
}

/// Apply a command; returns the text to echo back, if any.
pub fn apply(cmd: Command, inputs: &Inputs) -> eyre::Result<Option<String>> {
    match cmd {
        Command::Press(button) => {
            inputs.edges.on_edge(button, inputs.time.now_ms());
            Ok(None)
        }
        Command::Dose(grams) => {
            if !inputs.requests.submit(grams) {
                eyre::bail!("dose request of {grams} g refused");
            }
            Ok(Some(format!("dose {grams} g requested")))
        }
        Command::Set(key, value) => {
            inputs.settings.set(&key, &value)?;
            Ok(Some(format!("{key} = {value}")))
        }
        Command::Show => Ok(Some(settings_cmd::render(
            &inputs.settings.snapshot(),
            false,
        ))),
        Command::Reboot => {
            inputs.settings.request_reboot();
            Ok(Some("restart requested".to_string()))
        }
        Command::Quit => {
            inputs.shutdown.store(true, Ordering::Release);
            Ok(None)
        }
    }
}

fn spawn_stdin(inputs: Inputs) -> eyre::Result<()> {
    std::thread::Builder::new()
        .name("grinder-stdin".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                let outcome = parse_command(&line)
                    .and_then(|cmd| cmd.map_or(Ok(None), |cmd| apply(cmd, &inputs)));
                match outcome {
                    Ok(Some(reply)) => println!("{reply}"),
                    Ok(None) => {}
                    Err(e) => eprintln!("error: {e:#}"),
                }
            }
            // stdin closed: keep running, Ctrl-C still stops us
            tracing::debug!("stdin closed");
        })
        .wrap_err("spawn stdin thread")?;
    Ok(())
}

fn drive<W, R, B>(
    weight: W,
    relay: R,
    buttons: B,
    cfg: &Config,
    inputs: &Inputs,
) -> eyre::Result<LoopExit>
where
    W: WeightSource,
    R: Relay,
    B: ButtonInput,
{
    let mut machine = MachineBuilder::new()
        .with_weight(weight)
        .with_relay(relay)
        .with_buttons(buttons)
        .with_telemetry(backend::telemetry(cfg)?)
        .with_time(inputs.time.clone())
        .with_settings(inputs.settings.clone())
        .with_edges(Arc::clone(&inputs.edges))
        .with_requests(Arc::clone(&inputs.requests))
        .with_heartbeat_ms(cfg.runner.heartbeat_ms)
        .build()?;
    machine.begin()?;
    info!(
        single_g = machine.active_settings().target_dose_single,
        double_g = machine.active_settings().target_dose_double,
        "controller ready"
    );
    run_loop(&mut machine, &inputs.shutdown, &LoopCfg::from(&cfg.runner))
}

#[cfg(all(feature = "hardware", target_os = "linux"))]
fn serve(cfg: &Config, inputs: &Inputs) -> eyre::Result<LoopExit> {
    use grinder_traits::EdgeSink;

    let weight = backend::hw::open_weight(cfg)?;
    let relay = backend::hw::open_relay(cfg)?;
    let mut buttons = backend::hw::open_buttons(cfg)?;
    let sink: Arc<dyn EdgeSink> = Arc::clone(&inputs.edges) as Arc<dyn EdgeSink>;
    buttons
        .listen(sink, &inputs.time)
        .map_err(|e| eyre::Report::new(grinder_core::hw_error::map_hw_error(&e)))
        .wrap_err("arm button interrupts")?;
    drive(weight, relay, buttons, cfg, inputs)
}

#[cfg(not(all(feature = "hardware", target_os = "linux")))]
fn serve(cfg: &Config, inputs: &Inputs) -> eyre::Result<LoopExit> {
    let b = backend::open_sim(
        cfg,
        backend::sim_params(cfg),
        Arc::clone(inputs.time.clock()),
        grinder_core::conversions::sampling_mode(cfg),
    );
    drive(b.weight, b.relay, grinder_core::TrustEdges, cfg, inputs)
}

pub fn run(cfg: &Config, config_path: &Path) -> eyre::Result<()> {
    let settings = Settings::from(cfg);
    let store = TomlSettingsStore::new(config_path.to_path_buf(), cfg.clone());
    let inputs = Inputs {
        time: TimeBase::new(Arc::new(MonotonicClock::new())),
        edges: Arc::new(ButtonEdgeQueue::new(settings.button_debounce_ms)),
        requests: Arc::new(DoseRequest::new()),
        settings: SettingsHandle::with_store(settings, Box::new(store)),
        shutdown: Arc::new(AtomicBool::new(false)),
    };

    let flag = Arc::clone(&inputs.shutdown);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::Release);
    })
    .wrap_err("install Ctrl-C handler")?;
    spawn_stdin(inputs.clone())?;

    loop {
        match serve(cfg, &inputs)? {
            LoopExit::RestartRequested => {
                warn!("restart requested; reinitializing controller");
            }
            LoopExit::Shutdown | LoopExit::IterationLimit => break,
        }
    }
    info!("controller stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use grinder_traits::ManualClock;
    use rstest::rstest;

    fn inputs() -> Inputs {
        Inputs {
            time: TimeBase::new(Arc::new(ManualClock::new())),
            edges: Arc::new(ButtonEdgeQueue::new(150)),
            requests: Arc::new(DoseRequest::new()),
            settings: SettingsHandle::default(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    #[rstest]
    #[case("left", Command::Press(ButtonId::Left))]
    #[case("  back ", Command::Press(ButtonId::Back))]
    #[case("dose 20.5", Command::Dose(20.5))]
    #[case("set button_debounce_ms 40", Command::Set("button_debounce_ms".into(), "40".into()))]
    #[case("set:target_dose_single:19", Command::Set("target_dose_single".into(), "19".into()))]
    #[case("quit", Command::Quit)]
    fn parses_commands(#[case] line: &str, #[case] expected: Command) {
        assert_eq!(parse_command(line).unwrap(), Some(expected));
    }

    #[rstest]
    #[case("dose lots")]
    #[case("left now")]
    #[case("set:novalue")]
    #[case("grind")]
    fn rejects_bad_commands(#[case] line: &str) {
        assert!(parse_command(line).is_err());
    }

    #[test]
    fn blank_line_is_ignored() {
        assert_eq!(parse_command("   ").unwrap(), None);
    }

    #[test]
    fn commands_reach_shared_inputs() {
        let inputs = inputs();
        apply(Command::Dose(20.0), &inputs).unwrap();
        assert_eq!(inputs.requests.take(), Some(20.0));

        apply(Command::Set("target_dose_single".into(), "19".into()), &inputs).unwrap();
        assert!((inputs.settings.snapshot().target_dose_single - 19.0).abs() < f32::EPSILON);
        assert!(apply(Command::Set("nope".into(), "1".into()), &inputs).is_err());

        apply(Command::Press(ButtonId::Left), &inputs).unwrap();
        assert!(inputs.edges.consume().is_some());

        apply(Command::Quit, &inputs).unwrap();
        assert!(inputs.shutdown.load(Ordering::Acquire));
    }

    #[test]
    fn refused_dose_is_an_error() {
        assert!(apply(Command::Dose(-1.0), &inputs()).is_err());
    }
}
