use crate::action::Document;

/// Size limits for one bulk "add documents" request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    pub max_rows: usize,
    pub max_bytes: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_rows: 1000,
            max_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Groups documents into request-sized chunks for a single index.
pub struct DocumentBatcher {
    config: BatchConfig,
    pending: Vec<Document>,
    pending_bytes: usize,
}

impl DocumentBatcher {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            pending: Vec::new(),
            pending_bytes: 0,
        }
    }

    /// Add a document. Returns a full batch when the limits are reached.
    pub fn add(&mut self, doc: Document) -> Option<Vec<Document>> {
        let size = estimate_size(&doc);

        let would_exceed = self.pending.len() >= self.config.max_rows
            || (self.pending_bytes + size) > self.config.max_bytes;

        let ready = if would_exceed && !self.pending.is_empty() {
            self.take()
        } else {
            None
        };

        self.pending.push(doc);
        self.pending_bytes += size;
        ready
    }

    /// Take whatever is pending.
    pub fn flush(&mut self) -> Option<Vec<Document>> {
        self.take()
    }

    fn take(&mut self) -> Option<Vec<Document>> {
        if self.pending.is_empty() {
            return None;
        }
        self.pending_bytes = 0;
        Some(std::mem::take(&mut self.pending))
    }
}

fn estimate_size(doc: &Document) -> usize {
    serde_json::to_string(doc).map(|s| s.len()).unwrap_or(100)
}
