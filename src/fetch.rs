use crate::config::COUNT_PAGE_SIZE;
use crate::error::{MigrateError, Result};
use crate::models::Page;
use crate::source::SourceApi;
use crate::stage::Stage;
use chrono::{DateTime, Utc};
use tracing::debug;

/// Cursor pagination over one stage's entity listing.
///
/// Pages must come back in ascending creation order, otherwise a stored
/// cursor could skip or replay entities; an out-of-order page is an error.
pub struct Fetcher<'a, S: ?Sized> {
    source: &'a S,
    stage: Stage,
    page_size: u32,
    last_created: Option<DateTime<Utc>>,
}

impl<'a, S> Fetcher<'a, S>
where
    S: SourceApi + ?Sized,
{
    pub fn new(source: &'a S, stage: Stage, page_size: u32) -> Self {
        Self {
            source,
            stage,
            page_size,
            last_created: None,
        }
    }

    /// Total entity count of the stage, from a single-item count page.
    pub async fn total(&self) -> Result<u64> {
        let counted = self
            .source
            .list(self.stage, None, COUNT_PAGE_SIZE)
            .await?;
        debug!(stage = %self.stage, total = counted.pagination.global_count, "Counted stage");
        Ok(counted.pagination.global_count)
    }

    /// The page following `after`; `None` starts the stage from the beginning.
    pub async fn page_after(&mut self, after: Option<&str>) -> Result<Page> {
        let page = self.source.list(self.stage, after, self.page_size).await?;
        self.check_order(&page)?;
        Ok(page)
    }

    fn check_order(&mut self, page: &Page) -> Result<()> {
        for entity in &page.entities {
            if let Some(last) = self.last_created {
                if entity.created_at < last {
                    return Err(MigrateError::Fetch(format!(
                        "{} listing is not in ascending creation order at {} ({} < {})",
                        self.stage.label(),
                        entity.id,
                        entity.created_at,
                        last
                    )));
                }
            }
            self.last_created = Some(entity.created_at);
        }
        Ok(())
    }
}
