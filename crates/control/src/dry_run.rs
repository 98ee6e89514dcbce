//! A scene engine that renders nothing.
//!
//! It lays out the per-batch output tree and writes one JSON sidecar per
//! render pass for every sample, so a client can exercise the full protocol
//! without the 3D host application.

use std::{
    fs,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use serde::Serialize;
use shared::domain::{BatchId, SampleId, SensorPose};
use tracing::{debug, info};

use crate::engine::SceneEngine;

#[derive(Debug, Clone)]
pub struct DryRunConfig {
    pub output_root: PathBuf,
    pub render_passes: Vec<String>,
    /// Simulated generation time for every batch and sample step.
    pub step_latency: Duration,
    pub write_artifacts: bool,
}

impl Default for DryRunConfig {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("./output"),
            render_passes: vec!["rgb".into(), "depth".into(), "semantic".into()],
            step_latency: Duration::ZERO,
            write_artifacts: true,
        }
    }
}

#[derive(Debug, Serialize)]
struct SampleRecord<'a> {
    batch_id: BatchId,
    sample_id: SampleId,
    pass: &'a str,
    pose: &'a SensorPose,
}

pub struct DryRunEngine {
    config: DryRunConfig,
    current_batch: Option<(BatchId, PathBuf)>,
}

impl DryRunEngine {
    pub fn new(config: DryRunConfig) -> Self {
        Self {
            config,
            current_batch: None,
        }
    }

    pub fn batch_dir(&self, batch_id: BatchId) -> PathBuf {
        self.config
            .output_root
            .join(format!("batch_{:04}", batch_id.0))
    }

    fn simulate_latency(&self) {
        if !self.config.step_latency.is_zero() {
            thread::sleep(self.config.step_latency);
        }
    }

    fn write_record(&self, path: &Path, record: &SampleRecord<'_>) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create '{}'", parent.display()))?;
        }
        let body = serde_json::to_vec_pretty(record)?;
        fs::write(path, body).with_context(|| format!("failed to write '{}'", path.display()))
    }
}

impl SceneEngine for DryRunEngine {
    fn create_batch(&mut self, batch_id: BatchId) -> Result<()> {
        let dir = self.batch_dir(batch_id);
        if self.config.write_artifacts {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create batch folder '{}'", dir.display()))?;
        }
        self.simulate_latency();
        debug!(%batch_id, dir = %dir.display(), "dry-run batch ready");
        self.current_batch = Some((batch_id, dir));
        Ok(())
    }

    fn render_sample(
        &mut self,
        batch_id: BatchId,
        sample_id: SampleId,
        pose: &SensorPose,
    ) -> Result<Vec<String>> {
        let dir = match &self.current_batch {
            Some((current, dir)) if *current == batch_id => dir.clone(),
            Some((current, _)) => {
                bail!("sample targets batch {batch_id} but batch {current} is loaded")
            }
            None => bail!("no batch has been created"),
        };

        self.simulate_latency();
        let mut file_paths = Vec::with_capacity(self.config.render_passes.len());
        for pass in &self.config.render_passes {
            let path = dir
                .join(pass)
                .join(format!("{:04}_{pass}.json", sample_id.0));
            if self.config.write_artifacts {
                let record = SampleRecord {
                    batch_id,
                    sample_id,
                    pass: pass.as_str(),
                    pose,
                };
                self.write_record(&path, &record)?;
            }
            file_paths.push(path.display().to_string());
        }
        Ok(file_paths)
    }

    fn shutdown(&mut self) -> Result<()> {
        if let Some((batch_id, _)) = self.current_batch.take() {
            info!(%batch_id, "dry-run engine released last batch");
        }
        Ok(())
    }
}
