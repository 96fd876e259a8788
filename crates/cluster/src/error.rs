#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// No node became available within the lease backoff window.
    #[error("No worker node became available after {attempts} attempts")]
    Exhausted { attempts: u32 },

    #[error("Node discovery failed: {0}")]
    Discovery(String),

    #[error("Invalid pool configuration: {0}")]
    Config(String),
}
