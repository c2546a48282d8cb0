use crate::checkpoint::{CheckpointStore, MigrationState};
use crate::config::DEFAULT_PAGE_SIZE;
use crate::error::{MigrateError, Result};
use crate::fetch::Fetcher;
use crate::publish::{Broker, PublishOutcome, Publisher};
use crate::source::SourceApi;
use crate::stage::Stage;
use crate::stats::MigrationStats;
use crate::transform::build_bundle;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct MigrationOptions {
    pub page_size: u32,
    /// Stop after this many pages in this run (for testing)
    pub max_pages: Option<u64>,
    pub show_progress: bool,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_pages: None,
            show_progress: false,
        }
    }
}

/// Runs the stage sequence, publishing one bundle per migrated entity and
/// checkpointing after every page.
///
/// The checkpoint only moves once every entity of a page is published, so a
/// crash in the middle of a page replays that page on restart: delivery is
/// at-least-once, never lossy.
pub struct Migration<'a, S: ?Sized, B> {
    source: &'a S,
    publisher: Publisher<B>,
    store: CheckpointStore,
    options: MigrationOptions,
}

enum StageEnd {
    Exhausted,
    PageLimit,
}

impl<'a, S, B> Migration<'a, S, B>
where
    S: SourceApi + ?Sized,
    B: Broker,
{
    pub fn new(
        source: &'a S,
        publisher: Publisher<B>,
        store: CheckpointStore,
        options: MigrationOptions,
    ) -> Self {
        Self {
            source,
            publisher,
            store,
            options,
        }
    }

    pub async fn run(&mut self) -> Result<MigrationStats> {
        let mut state = self.store.load()?;
        let mut stats = MigrationStats::new();

        if state.stage.is_none() {
            state.stage = Some(Stage::FIRST);
            self.store.save(&state)?;
        }

        loop {
            let stage = state.active_stage();
            info!(
                stage = %stage,
                cursor = ?state.cursor,
                processed = state.processed_count,
                "Starting stage"
            );

            match self.run_stage(stage, &mut state, &mut stats).await? {
                StageEnd::PageLimit => {
                    info!(stage = %stage, pages = stats.pages_processed, "Page limit reached, stopping");
                    stats.halted = true;
                    return Ok(stats);
                }
                StageEnd::Exhausted => {
                    stats.stages_completed += 1;
                    info!(stage = %stage, processed = state.processed_count, "Stage complete");
                }
            }

            if !state.advance_stage() {
                info!("All stages complete");
                return Ok(stats);
            }
            self.store.save(&state)?;
        }
    }

    async fn run_stage(
        &mut self,
        stage: Stage,
        state: &mut MigrationState,
        stats: &mut MigrationStats,
    ) -> Result<StageEnd> {
        if self.page_limit_reached(stats) {
            return Ok(StageEnd::PageLimit);
        }

        let mut fetcher = Fetcher::new(self.source, stage, self.options.page_size);
        let total = fetcher.total().await?;
        let pb = self.progress_bar(stage, total);
        pb.set_position(state.processed_count);

        loop {
            if self.page_limit_reached(stats) {
                pb.abandon();
                return Ok(StageEnd::PageLimit);
            }

            let page = fetcher.page_after(state.cursor.as_deref()).await?;
            if page.entities.is_empty() && page.pagination.has_next_page {
                return Err(MigrateError::Fetch(format!(
                    "{} listing reported more pages but returned none",
                    stage.label()
                )));
            }

            for entity in &page.entities {
                stats.entities_fetched += 1;
                match build_bundle(self.source, stage, entity).await? {
                    Some(bundle) => {
                        let outcome = self.publisher.publish(&bundle).await?;
                        stats.record_published(outcome == PublishOutcome::DeliveredAfterRetry);
                    }
                    None => stats.record_skipped(),
                }
                pb.inc(1);
            }

            state.advance_page(page.pagination.end_cursor, page.entities.len() as u64);
            self.store.save(state)?;
            stats.pages_processed += 1;
            debug!(
                stage = %stage,
                processed = state.processed_count,
                total,
                "Page checkpointed"
            );

            if !page.pagination.has_next_page {
                pb.finish_with_message(format!("{}: {} entities", stage.label(), state.processed_count));
                return Ok(StageEnd::Exhausted);
            }
        }
    }

    fn page_limit_reached(&self, stats: &MigrationStats) -> bool {
        self.options
            .max_pages
            .is_some_and(|limit| stats.pages_processed >= limit)
    }

    fn progress_bar(&self, stage: Stage, total: u64) -> ProgressBar {
        if !self.options.show_progress {
            return ProgressBar::hidden();
        }
        println!();
        println!("==> Stage {stage}");
        let pb = ProgressBar::new(total);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("    {spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        {
            pb.set_style(style.progress_chars("=> "));
        }
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        pb
    }

    pub fn publisher(&self) -> &Publisher<B> {
        &self.publisher
    }

    pub fn into_publisher(self) -> Publisher<B> {
        self.publisher
    }
}
