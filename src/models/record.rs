use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// One unit of batch work: entity name → replacement text.
///
/// Field order is preserved so updates are issued in the order the columns
/// appear in the data source. `id` is only used in log messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRecord {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub fields: IndexMap<String, String>,
}

impl BatchRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_field(mut self, entity: impl Into<String>, text: impl Into<String>) -> Self {
        self.fields.insert(entity.into(), text.into());
        self
    }

    /// Identifier for logs: the record id, or `Item <n>` (1-based).
    pub fn display_id(&self, index: usize) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| format!("Item {}", index + 1))
    }
}
