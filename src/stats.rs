/// Counters for one migration run (not persisted; the checkpoint only keeps
/// the per-stage count).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationStats {
    pub entities_fetched: u64,
    pub bundles_published: u64,
    pub publish_retries: u64,
    pub entities_skipped: u64,
    pub pages_processed: u64,
    pub stages_completed: u64,
    /// True when the run stopped at a page limit before finishing.
    pub halted: bool,
}

impl MigrationStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_published(&mut self, retried: bool) {
        self.bundles_published += 1;
        if retried {
            self.publish_retries += 1;
        }
    }

    pub fn record_skipped(&mut self) {
        self.entities_skipped += 1;
    }
}
