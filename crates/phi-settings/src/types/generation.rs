//! Generator settings.

use serde::{Deserialize, Serialize};

/// Parameters handed to the token generator for each turn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerationSettings {
    /// Maximum sequence length (prompt plus generated tokens).
    pub max_length: usize,
    /// Generator batch size.
    pub batch_size: usize,
    /// Fragments buffered between the generation worker and the consumer.
    pub channel_capacity: usize,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            max_length: 1024,
            batch_size: 1,
            channel_capacity: 32,
        }
    }
}
