//! JSON-lines telemetry sink for graphs and post-run analysis.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use grinder_core::telemetry::Throttle;
use grinder_core::{DisplayView, Telemetry, TelemetryEvent};
use serde_json::{Value, json};

/// Raw samples and progress updates are thinned to one line per period.
const SAMPLE_PERIOD_MS: u64 = 100;

pub struct JsonlTelemetry<W: Write> {
    out: W,
    samples: Throttle,
    updates: Throttle,
    failed: bool,
}

impl JsonlTelemetry<BufWriter<File>> {
    pub fn create(path: &Path) -> eyre::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| eyre::eyre!("open telemetry file {}: {e}", path.display()))?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> JsonlTelemetry<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            samples: Throttle::new(SAMPLE_PERIOD_MS),
            updates: Throttle::new(SAMPLE_PERIOD_MS),
            failed: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write(&mut self, line: &Value) {
        if self.failed {
            return;
        }
        if let Err(e) = writeln!(self.out, "{line}") {
            // one warning, then drop silently
            tracing::warn!(error = %e, "telemetry sink failed; dropping further events");
            self.failed = true;
        }
    }
}

fn view_json(view: &DisplayView) -> Value {
    match view {
        DisplayView::Weight { grams } => json!({ "view": "weight", "grams": grams }),
        DisplayView::Confirm { target_g, button } => {
            json!({ "view": "confirm", "target_g": target_g, "button": button.name() })
        }
        DisplayView::Tare => json!({ "view": "tare" }),
        DisplayView::Grinding {
            grams,
            target_g,
            elapsed_s,
        } => json!({
            "view": "grinding",
            "grams": grams,
            "target_g": target_g,
            "elapsed_s": elapsed_s,
        }),
        DisplayView::TopUp { grams, target_g } => {
            json!({ "view": "top_up", "grams": grams, "target_g": target_g })
        }
        DisplayView::Stabilizing { grams } => json!({ "view": "stabilizing", "grams": grams }),
        DisplayView::Final { grams, elapsed_s } => {
            json!({ "view": "final", "grams": grams, "elapsed_s": elapsed_s })
        }
        DisplayView::Debug { raw, grams, stable } => {
            json!({ "view": "debug", "raw": raw, "grams": grams, "stable": stable })
        }
        DisplayView::Off => json!({ "view": "off" }),
    }
}

impl<W: Write> Telemetry for JsonlTelemetry<W> {
    fn record(&mut self, event: &TelemetryEvent) {
        let body = match event {
            TelemetryEvent::SessionReset { target_g } => {
                self.samples.reset();
                self.updates.reset();
                json!({ "target_g": target_g })
            }
            TelemetryEvent::SessionUpdate { elapsed_s, grams } => {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let ms = (elapsed_s * 1000.0) as u64;
                if !self.updates.ready(ms) {
                    return;
                }
                json!({ "elapsed_s": elapsed_s, "grams": grams })
            }
            TelemetryEvent::SessionFinalize { elapsed_s, grams } => {
                json!({ "elapsed_s": elapsed_s, "grams": grams })
            }
            TelemetryEvent::TopUp {
                runtime_ms,
                delta_g,
            } => json!({ "runtime_ms": runtime_ms, "delta_g": delta_g }),
            TelemetryEvent::RawSample {
                raw,
                grams,
                elapsed_ms,
                stable,
            } => {
                if !self.samples.ready(*elapsed_ms) {
                    return;
                }
                json!({ "raw": raw, "grams": grams, "elapsed_ms": elapsed_ms, "stable": stable })
            }
            TelemetryEvent::Display(view) => view_json(view),
            TelemetryEvent::Log(line) => json!({ "line": line }),
        };
        let mut line = json!({ "event": event.name() });
        if let (Some(dst), Value::Object(src)) = (line.as_object_mut(), body) {
            dst.extend(src);
        }
        self.write(&line);
        if matches!(event, TelemetryEvent::SessionFinalize { .. }) {
            let _ = self.out.flush();
        }
    }
}
