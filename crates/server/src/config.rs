use std::{fs, path::PathBuf, str::FromStr, time::Duration};

use control::DryRunConfig;
use serde::Deserialize;
use tracing::warn;

const DEFAULT_CONFIG_FILE: &str = "server.toml";
/// Leaves room for every batch id a run can realistically produce.
pub const MAX_OUTPUT_ID_OFFSET: i64 = i64::MAX / 2;

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub server_bind: String,
    pub output_id_offset: i64,
    pub output_path: PathBuf,
    pub worker_idle_ms: u64,
    pub service_threads: usize,
    pub render_passes: Vec<String>,
    pub render_latency_ms: u64,
    pub write_artifacts: bool,
    pub shutdown_linger_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "0.0.0.0:50051".into(),
            output_id_offset: 0,
            output_path: PathBuf::from("./output"),
            worker_idle_ms: 250,
            service_threads: 1,
            render_passes: vec!["rgb".into(), "depth".into(), "semantic".into()],
            render_latency_ms: 0,
            write_artifacts: true,
            shutdown_linger_ms: 500,
        }
    }
}

impl Settings {
    pub fn worker_idle(&self) -> Duration {
        Duration::from_millis(self.worker_idle_ms)
    }

    pub fn shutdown_linger(&self) -> Duration {
        Duration::from_millis(self.shutdown_linger_ms)
    }

    pub fn dry_run_config(&self) -> DryRunConfig {
        DryRunConfig {
            output_root: self.output_path.clone(),
            render_passes: self.render_passes.clone(),
            step_latency: Duration::from_millis(self.render_latency_ms),
            write_artifacts: self.write_artifacts,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileSettings {
    bind_addr: Option<String>,
    output_id_offset: Option<i64>,
    output_path: Option<PathBuf>,
    worker_idle_ms: Option<u64>,
    service_threads: Option<usize>,
    render_passes: Option<Vec<String>>,
    render_latency_ms: Option<u64>,
    write_artifacts: Option<bool>,
    shutdown_linger_ms: Option<u64>,
}

pub fn load_settings() -> Settings {
    load_settings_with(|key| std::env::var(key).ok())
}

/// Defaults, then the optional TOML file, then environment overrides.
pub fn load_settings_with(env: impl Fn(&str) -> Option<String>) -> Settings {
    let mut settings = Settings::default();

    let path = env("APP__CONFIG_FILE").unwrap_or_else(|| DEFAULT_CONFIG_FILE.into());
    if let Ok(raw) = fs::read_to_string(&path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => apply_file(&mut settings, file_cfg),
            Err(error) => warn!(%path, %error, "ignoring unreadable settings file"),
        }
    }

    if let Some(v) = env("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Some(v) = env("APP__BIND_ADDR") {
        settings.server_bind = v;
    }
    if let Some(v) = env("APP__OUTPUT_PATH") {
        settings.output_path = PathBuf::from(v);
    }
    if let Some(v) = env("APP__RENDER_PASSES") {
        let passes = parse_passes(&v);
        if passes.is_empty() {
            warn!(value = %v, "APP__RENDER_PASSES names no passes; keeping configured list");
        } else {
            settings.render_passes = passes;
        }
    }

    override_parsed(&env, "APP__OUTPUT_ID_OFFSET", &mut settings.output_id_offset);
    override_parsed(&env, "APP__WORKER_IDLE_MS", &mut settings.worker_idle_ms);
    override_parsed(&env, "APP__SERVICE_THREADS", &mut settings.service_threads);
    override_parsed(&env, "APP__RENDER_LATENCY_MS", &mut settings.render_latency_ms);
    override_parsed(&env, "APP__WRITE_ARTIFACTS", &mut settings.write_artifacts);
    override_parsed(&env, "APP__SHUTDOWN_LINGER_MS", &mut settings.shutdown_linger_ms);

    settings.service_threads = settings.service_threads.max(1);
    if !(0..=MAX_OUTPUT_ID_OFFSET).contains(&settings.output_id_offset) {
        warn!(
            value = settings.output_id_offset,
            max = MAX_OUTPUT_ID_OFFSET,
            "output id offset out of range; using 0"
        );
        settings.output_id_offset = 0;
    }
    settings
}

fn apply_file(settings: &mut Settings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.bind_addr {
        settings.server_bind = v;
    }
    if let Some(v) = file_cfg.output_id_offset {
        settings.output_id_offset = v;
    }
    if let Some(v) = file_cfg.output_path {
        settings.output_path = v;
    }
    if let Some(v) = file_cfg.worker_idle_ms {
        settings.worker_idle_ms = v;
    }
    if let Some(v) = file_cfg.service_threads {
        settings.service_threads = v;
    }
    if let Some(v) = file_cfg.render_passes.filter(|passes| !passes.is_empty()) {
        settings.render_passes = v;
    }
    if let Some(v) = file_cfg.render_latency_ms {
        settings.render_latency_ms = v;
    }
    if let Some(v) = file_cfg.write_artifacts {
        settings.write_artifacts = v;
    }
    if let Some(v) = file_cfg.shutdown_linger_ms {
        settings.shutdown_linger_ms = v;
    }
}

fn override_parsed<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = env(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(key, value = %raw, "ignoring unparsable setting"),
    }
}

fn parse_passes(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|pass| !pass.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
