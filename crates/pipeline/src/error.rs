/// Errors that end a batch or a grid point.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Dataset or parameters rejected before any job ran.
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Dataset could not be loaded: {0}")]
    Dataset(String),

    #[error("All {total} jobs failed; last error: {last_error}")]
    AllJobsFailed { total: usize, last_error: String },

    #[error("Storing results failed: {0}")]
    Sink(String),
}
