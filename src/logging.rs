use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use anyhow::{Context, Result};
use chrono::SecondsFormat;
use serde::Deserialize;

static LOGGER: OnceLock<Logger> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

pub fn init_log_file(path: &Path, min_level: Level) -> Result<()> {
    if LOGGER.get().is_some() {
        return Ok(());
    }
    let logger = Logger::new(path, min_level, true)?;
    let _ = LOGGER.set(logger);
    Ok(())
}

pub fn debug(msg: impl AsRef<str>) {
    log_kv(Level::Debug, msg.as_ref(), &[]);
}

pub fn info(msg: impl AsRef<str>) {
    log_kv(Level::Info, msg.as_ref(), &[]);
}

pub fn warn(msg: impl AsRef<str>) {
    log_kv(Level::Warn, msg.as_ref(), &[]);
}

pub fn error(msg: impl AsRef<str>) {
    log_kv(Level::Error, msg.as_ref(), &[]);
}

pub fn debug_kv(msg: &str, kv: &[(&str, &str)]) {
    log_kv(Level::Debug, msg, kv);
}

pub fn info_kv(msg: &str, kv: &[(&str, &str)]) {
    log_kv(Level::Info, msg, kv);
}

pub fn warn_kv(msg: &str, kv: &[(&str, &str)]) {
    log_kv(Level::Warn, msg, kv);
}

fn log_kv(level: Level, msg: &str, kv: &[(&str, &str)]) {
    if let Some(logger) = LOGGER.get() {
        logger.write_kv(level, msg, kv);
    }
}

struct Logger {
    file: Mutex<File>,
    min_level: Level,
    mirror_to_stdout: bool,
}

impl Logger {
    fn new(path: &Path, min_level: Level, mirror_to_stdout: bool) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        // One log file per run.
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(path)
            .with_context(|| format!("open {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
            min_level,
            mirror_to_stdout,
        })
    }

    fn write_kv(&self, level: Level, msg: &str, kv: &[(&str, &str)]) {
        if level < self.min_level {
            return;
        }
        let ts = chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let level = level.as_str();

        let mut slog_line = format!("time={ts} level={level} msg=\"{}\"", escape_value(msg));
        let mut pretty_line = format!("{ts} {level} {msg}");
        for (k, v) in kv {
            slog_line.push_str(&format!(" {k}={}", quote_if_needed(v)));
            pretty_line.push_str(&format!(" {k}={v}"));
        }
        slog_line.push('\n');
        pretty_line.push('\n');

        if let Ok(mut f) = self.file.lock() {
            let _ = f.write_all(slog_line.as_bytes());
            let _ = f.flush();
        }
        if self.mirror_to_stdout {
            let mut out = std::io::stdout();
            let _ = out.write_all(pretty_line.as_bytes());
            let _ = out.flush();
        }
    }
}

fn quote_if_needed(v: &str) -> String {
    if v.is_empty() || v.contains(|c: char| c.is_whitespace() || c == '"' || c == '=') {
        format!("\"{}\"", escape_value(v))
    } else {
        v.to_string()
    }
}

fn escape_value(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out
}
