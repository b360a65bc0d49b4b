//! Tracing subscriber setup: console layer plus an optional rolling file.
//!
//! `RUST_LOG` overrides `--log-level` when set. The file layer always writes
//! JSON lines; its worker guard lives in [`FILE_GUARD`] for the process
//! lifetime so buffered lines are flushed on exit.

use std::path::{Path, PathBuf};

use eyre::WrapErr;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::FILE_GUARD;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Rotation {
    #[default]
    Never,
    Daily,
    Hourly,
}

impl Rotation {
    pub fn parse(s: Option<&str>) -> Self {
        match s {
            Some("daily") => Self::Daily,
            Some("hourly") => Self::Hourly,
            _ => Self::Never,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
    pub file: Option<PathBuf>,
    pub rotation: Rotation,
}

impl LogConfig {
    pub fn from_config(cfg: &grinder_config::Config, level: &str, json: bool) -> Self {
        // --log-level wins unless left at its default and the file sets one
        let level = match cfg.logging.level.as_deref() {
            Some(l) if level == "info" => l.to_string(),
            _ => level.to_string(),
        };
        Self {
            level,
            json,
            file: cfg.logging.file.as_ref().map(PathBuf::from),
            rotation: Rotation::parse(cfg.logging.rotation.as_deref()),
        }
    }
}

fn build_env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,grinder_cli={level},grinder_core={level},grinder_hardware={level},\
             grinder_config={level},grinder={level}"
        ))
    })
}

fn split_file(path: &Path) -> (PathBuf, String) {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let name = path
        .file_name()
        .map_or_else(|| "grinder.log".to_string(), |n| n.to_string_lossy().into_owned());
    (dir, name)
}

pub fn init_logging(config: &LogConfig) -> eyre::Result<()> {
    let console = if config.json {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .boxed()
    };

    let file = match &config.file {
        Some(path) => {
            let (dir, name) = split_file(path);
            std::fs::create_dir_all(&dir)
                .wrap_err_with(|| format!("create log directory {}", dir.display()))?;
            let appender = match config.rotation {
                Rotation::Never => tracing_appender::rolling::never(&dir, &name),
                Rotation::Daily => tracing_appender::rolling::daily(&dir, &name),
                Rotation::Hourly => tracing_appender::rolling::hourly(&dir, &name),
            };
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = FILE_GUARD.set(guard);
            Some(
                fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_ansi(false)
                    .boxed(),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .with(build_env_filter(&config.level))
        .try_init()
        .map_err(|e| eyre::eyre!("install tracing subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_defaults_to_never() {
        assert_eq!(Rotation::parse(None), Rotation::Never);
        assert_eq!(Rotation::parse(Some("hourly")), Rotation::Hourly);
        assert_eq!(Rotation::parse(Some("weekly")), Rotation::Never);
    }

    #[test]
    fn file_level_applies_only_without_explicit_flag() {
        let mut cfg = grinder_config::Config::default();
        cfg.logging.level = Some("debug".into());
        assert_eq!(LogConfig::from_config(&cfg, "info", false).level, "debug");
        assert_eq!(LogConfig::from_config(&cfg, "trace", false).level, "trace");
    }

    #[test]
    fn bare_file_name_logs_to_cwd() {
        let (dir, name) = split_file(Path::new("grinder.log"));
        assert_eq!(dir, PathBuf::from("."));
        assert_eq!(name, "grinder.log");
    }
}
