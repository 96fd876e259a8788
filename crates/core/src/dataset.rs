//! Contract for the collaborator supplying job inputs.

use async_trait::async_trait;

use crate::error::CoreError;
use crate::types::DatasetRecord;

/// Produces the ordered, fully enumerable list of dataset records.
#[async_trait]
pub trait DatasetSource: Send + Sync {
    async fn load_dataset(&self) -> Result<Vec<DatasetRecord>, CoreError>;
}
