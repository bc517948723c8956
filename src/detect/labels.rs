use serde::{Deserialize, Serialize};

/// Label given to class ids the label table does not know.
pub const UNKNOWN_LABEL: &str = "unknown";

/// Class id to label table. The class id is the index into the list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassLabels(Vec<String>);

impl ClassLabels {
    pub fn new(labels: Vec<String>) -> Self {
        Self(labels)
    }

    pub fn label_for(&self, class_id: u32) -> &str {
        usize::try_from(class_id)
            .ok()
            .and_then(|idx| self.0.get(idx))
            .map(String::as_str)
            .unwrap_or(UNKNOWN_LABEL)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for ClassLabels {
    fn default() -> Self {
        Self(vec!["cup".to_string(), "tray".to_string()])
    }
}
