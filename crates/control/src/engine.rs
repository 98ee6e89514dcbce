use anyhow::Result;
use shared::domain::{BatchId, SampleId, SensorPose};

/// One unit of content generation, driven exclusively by the worker thread.
///
/// Implementations are assumed to be non-reentrant; they are moved onto the
/// worker thread and never shared, hence `Send` but not `Sync`. Batch ids
/// already carry the configured output offset.
pub trait SceneEngine: Send {
    fn create_batch(&mut self, batch_id: BatchId) -> Result<()>;

    /// Renders one sample of the current batch and returns the artifact paths.
    fn render_sample(
        &mut self,
        batch_id: BatchId,
        sample_id: SampleId,
        pose: &SensorPose,
    ) -> Result<Vec<String>>;

    fn shutdown(&mut self) -> Result<()>;
}
