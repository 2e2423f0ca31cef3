//! Runs one stage over the pages of a document.
//!
//! The runner recomputes its work list from the [`PageStore`] every time it
//! starts, so it never depends on in-memory state from an earlier run. Pages
//! are processed by a bounded pool of futures, and the pause/cancel signal is
//! checked before every dispatch. Once the signal is raised, no new pages are
//! started, but pages already in flight run to completion (or time out).

use std::sync::Arc;

use futures::{FutureExt as _, StreamExt as _, stream::FuturesUnordered};
use tokio::sync::watch;

use crate::{
    aggregate::Aggregator,
    async_utils::BoxedFuture,
    config::FailurePolicy,
    engines::{Recognizer, Translator},
    error::{EngineError, StorageError},
    page_source::PageSource,
    prelude::*,
    project::Stage,
    retry::{RetryPolicy, call_engine},
    store::{PageOutcome, PageResult, PageStore},
};

/// What a running stage has been asked to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunSignal {
    Continue,
    Pause,
    Cancel,
}

/// How a stage run ended.
#[derive(Debug)]
pub enum RunOutcome {
    /// Every page has a terminal result.
    Complete,
    /// We stopped dispatching because of a pause or cancel request.
    Quiesced(RunSignal),
    /// A page failed under the strict failure policy.
    Halted { index: usize, error: EngineError },
    /// We could not persist a result.
    StorageFailed(StorageError),
}

/// The per-page work of a stage.
#[async_trait]
pub trait StageWork: Send + Sync + 'static {
    /// Produce the text for one page.
    ///
    /// The outer error means the page's *inputs* could not be read from
    /// storage, which is fatal for the run. The inner error is an ordinary
    /// per-page engine failure. Retries give up once `signal` is raised.
    async fn process(
        &self,
        index: usize,
        signal: &watch::Receiver<RunSignal>,
    ) -> Result<Result<String, EngineError>, StorageError>;
}

/// Receives each page result once it has been persisted.
#[async_trait]
pub trait PageReporter: Send + Sync {
    async fn page_finished(&self, result: &PageResult) -> Result<(), StorageError>;
}

/// OCR of rasterized pages.
pub struct ExtractionWork {
    pub source: Arc<dyn PageSource>,
    pub recognizer: Arc<dyn Recognizer>,
    pub languages: Vec<String>,
    pub retry: RetryPolicy,
    pub timeout: std::time::Duration,
}

#[async_trait]
impl StageWork for ExtractionWork {
    #[instrument(level = "debug", skip_all, fields(index))]
    async fn process(
        &self,
        index: usize,
        signal: &watch::Receiver<RunSignal>,
    ) -> Result<Result<String, EngineError>, StorageError> {
        let (source, recognizer, languages) = (&self.source, &self.recognizer, &self.languages);
        Ok(call_engine(&self.retry, self.timeout, || stopping(signal), move || async move {
            let page = source.render_page(index).await?;
            recognizer.recognize(&page, languages).await
        })
        .await)
    }
}

/// Translation of OCRed pages.
pub struct TranslationWork {
    pub store: PageStore,
    pub translator: Arc<dyn Translator>,
    pub target_language: String,
    pub retry: RetryPolicy,
    pub timeout: std::time::Duration,
}

#[async_trait]
impl StageWork for TranslationWork {
    #[instrument(level = "debug", skip_all, fields(index))]
    async fn process(
        &self,
        index: usize,
        signal: &watch::Receiver<RunSignal>,
    ) -> Result<Result<String, EngineError>, StorageError> {
        let source = match self.store.get(Stage::Extraction, index).await? {
            Some(result) if result.is_done() => result.content,
            _ => {
                return Ok(Err(EngineError::MissingInput(format!(
                    "page {} has no OCR text",
                    index + 1
                ))));
            }
        };
        if source.trim().is_empty() {
            return Ok(Ok(String::new()));
        }
        let (translator, text, target) =
            (&self.translator, source.as_str(), self.target_language.as_str());
        Ok(call_engine(&self.retry, self.timeout, || stopping(signal), move || {
            translator.translate(text, target)
        })
        .await)
    }
}

/// Has the run been asked to stop?
fn stopping(signal: &watch::Receiver<RunSignal>) -> bool {
    *signal.borrow() != RunSignal::Continue
}

/// Drives one stage.
pub struct StageRunner {
    pub stage: Stage,
    pub total_pages: usize,
    pub concurrency: usize,
    pub failure_policy: FailurePolicy,
    pub store: PageStore,
    pub aggregator: Aggregator,
    pub work: Arc<dyn StageWork>,
}

impl StageRunner {
    /// Process every page of the stage that doesn't already have a `done`
    /// result.
    #[instrument(level = "debug", skip_all, fields(stage = %self.stage))]
    pub async fn run(
        &self,
        signal: &watch::Receiver<RunSignal>,
        reporter: &dyn PageReporter,
    ) -> RunOutcome {
        let mut pending = Vec::with_capacity(self.total_pages);
        for index in 0..self.total_pages {
            match self.store.has(self.stage, index).await {
                Ok(true) => {}
                Ok(false) => pending.push(index),
                Err(err) => return RunOutcome::StorageFailed(err),
            }
        }
        let mut pending = pending.into_iter();
        debug!(
            pending = pending.len(),
            total = self.total_pages,
            "Computed pending pages"
        );
        let mut view = match self.aggregator.view(self.stage).await {
            Ok(view) => view,
            Err(err) => return RunOutcome::StorageFailed(err),
        };

        let mut in_flight =
            FuturesUnordered::<BoxedFuture<(usize, Result<Result<String, EngineError>, StorageError>)>>::new();
        let mut stopped_by = None;
        let mut halted = None;
        let mut storage_error = None;

        loop {
            // Fill the pool, checking for pause/cancel before each dispatch.
            while stopped_by.is_none()
                && halted.is_none()
                && storage_error.is_none()
                && in_flight.len() < self.concurrency.max(1)
            {
                if stopping(signal) {
                    let requested = *signal.borrow();
                    debug!(?requested, in_flight = in_flight.len(), "Stopping dispatch");
                    stopped_by = Some(requested);
                    break;
                }
                let Some(index) = pending.next() else {
                    break;
                };
                trace!(index, "Dispatching page");
                let (work, signal) = (self.work.clone(), signal.clone());
                in_flight.push(async move { (index, work.process(index, &signal).await) }.boxed());
            }

            let Some((index, processed)) = in_flight.next().await else {
                break;
            };
            let (outcome, content, error) = match processed {
                Ok(Ok(content)) => (PageOutcome::Done, content, None),
                Ok(Err(EngineError::Interrupted)) => {
                    // Left pending for the next run.
                    debug!(stage = %self.stage, index, "Page interrupted");
                    stopped_by.get_or_insert(*signal.borrow());
                    continue;
                }
                Ok(Err(err)) => {
                    warn!(stage = %self.stage, index, "Page failed: {}", err);
                    let message = err.to_string();
                    if self.failure_policy == FailurePolicy::Strict && halted.is_none() {
                        halted = Some((index, err));
                    }
                    (PageOutcome::Failed, String::new(), Some(message))
                }
                Err(err) => {
                    error!(stage = %self.stage, index, "Cannot read page input: {}", err);
                    storage_error.get_or_insert(err);
                    continue;
                }
            };

            let result = match self
                .store
                .put(self.stage, index, outcome, content, error)
                .await
            {
                Ok(result) => result,
                Err(err) => {
                    error!(stage = %self.stage, index, "Cannot save page: {}", err);
                    storage_error.get_or_insert(err);
                    continue;
                }
            };
            if result.is_done() {
                view.apply(index, &result.content);
                trace!(index, confirmed = view.confirmed_prefix(), "Updating artifact");
                if let Err(err) = self.aggregator.write_text(view.stage(), &view.render()).await
                {
                    storage_error.get_or_insert(err);
                }
            }
            if let Err(err) = reporter.page_finished(&result).await {
                storage_error.get_or_insert(err);
            }
        }

        if let Some(err) = storage_error {
            RunOutcome::StorageFailed(err)
        } else if let Some((index, error)) = halted {
            RunOutcome::Halted { index, error }
        } else if let Some(signal) = stopped_by {
            RunOutcome::Quiesced(signal)
        } else {
            RunOutcome::Complete
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Mutex, time::Duration};

    use super::*;
    use crate::{aggregate::AggregateFormat, project::ProjectPaths};

    /// Returns `text-N` for each page, failing the listed pages. Pages in
    /// `retrying` keep failing transiently until the run is stopped.
    struct FakeWork {
        failing: HashSet<usize>,
        retrying: HashSet<usize>,
        calls: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl StageWork for FakeWork {
        async fn process(
            &self,
            index: usize,
            signal: &watch::Receiver<RunSignal>,
        ) -> Result<Result<String, EngineError>, StorageError> {
            self.calls.lock().unwrap().push(index);
            if self.retrying.contains(&index) {
                let mut signal = signal.clone();
                let _ = signal.wait_for(|s| *s != RunSignal::Continue).await;
                return Ok(Err(EngineError::Interrupted));
            }
            // Finish later pages first.
            tokio::time::sleep(Duration::from_millis(10 * (5 - index as u64 % 5))).await;
            if self.failing.contains(&index) {
                Ok(Err(EngineError::Timeout(Duration::from_millis(1))))
            } else {
                Ok(Ok(format!("text-{index}")))
            }
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(usize, PageOutcome)>>);

    #[async_trait]
    impl PageReporter for Recorder {
        async fn page_finished(&self, result: &PageResult) -> Result<(), StorageError> {
            self.0.lock().unwrap().push((result.index, result.outcome));
            Ok(())
        }
    }

    fn make_runner(
        dir: &tempfile::TempDir,
        total_pages: usize,
        concurrency: usize,
        failure_policy: FailurePolicy,
        failing: &[usize],
    ) -> (StageRunner, Arc<FakeWork>) {
        let paths = ProjectPaths::new(dir.path(), "doc");
        let store = PageStore::new(paths.pages_dir());
        let format = AggregateFormat {
            page_headers: false,
            ..AggregateFormat::default()
        };
        let work = Arc::new(FakeWork {
            failing: failing.iter().copied().collect(),
            retrying: HashSet::new(),
            calls: Mutex::new(vec![]),
        });
        let runner = StageRunner {
            stage: Stage::Extraction,
            total_pages,
            concurrency,
            failure_policy,
            store: store.clone(),
            aggregator: Aggregator::new(store, paths, total_pages, format),
            work: work.clone(),
        };
        (runner, work)
    }

    #[tokio::test]
    async fn out_of_order_completion_keeps_index_order() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let (runner, _work) = make_runner(&dir, 5, 5, FailurePolicy::BestEffort, &[]);
        let (_tx, rx) = watch::channel(RunSignal::Continue);
        let recorder = Recorder::default();
        assert!(matches!(runner.run(&rx, &recorder).await, RunOutcome::Complete));

        let reported = recorder.0.lock().unwrap().clone();
        assert_eq!(reported.len(), 5);
        assert_ne!(
            reported.iter().map(|(i, _)| *i).collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 4],
            "pages should complete out of order"
        );
        let text = runner.aggregator.rebuild(Stage::Extraction).await?;
        assert_eq!(text, "text-0\n\ntext-1\n\ntext-2\n\ntext-3\n\ntext-4");
        let artifact = std::fs::read_to_string(
            ProjectPaths::new(dir.path(), "doc").artifact_path(Stage::Extraction),
        )?;
        assert_eq!(artifact, text);
        Ok(())
    }

    #[tokio::test]
    async fn best_effort_records_failures_and_continues() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let (runner, work) = make_runner(&dir, 4, 2, FailurePolicy::BestEffort, &[1]);
        let (_tx, rx) = watch::channel(RunSignal::Continue);
        assert!(matches!(
            runner.run(&rx, &Recorder::default()).await,
            RunOutcome::Complete
        ));
        assert_eq!(work.calls.lock().unwrap().len(), 4);
        let listed = runner.store.list(Stage::Extraction).await?;
        assert_eq!(listed[1], (1, PageOutcome::Failed));
        let failed = runner.store.get(Stage::Extraction, 1).await?.unwrap();
        assert!(failed.error.unwrap().contains("timed out"));
        Ok(())
    }

    #[tokio::test]
    async fn rerun_skips_done_pages() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let (runner, work) = make_runner(&dir, 3, 1, FailurePolicy::BestEffort, &[]);
        runner
            .store
            .put(Stage::Extraction, 1, PageOutcome::Done, "cached".into(), None)
            .await?;
        let (_tx, rx) = watch::channel(RunSignal::Continue);
        runner.run(&rx, &Recorder::default()).await;
        assert_eq!(*work.calls.lock().unwrap(), vec![0, 2]);
        assert_eq!(
            runner.aggregator.rebuild(Stage::Extraction).await?,
            "text-0\n\ncached\n\ntext-2"
        );
        Ok(())
    }

    #[tokio::test]
    async fn raised_signal_stops_dispatch() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let (runner, work) = make_runner(&dir, 3, 1, FailurePolicy::BestEffort, &[]);
        let (_tx, rx) = watch::channel(RunSignal::Pause);
        let outcome = runner.run(&rx, &Recorder::default()).await;
        assert!(matches!(outcome, RunOutcome::Quiesced(RunSignal::Pause)));
        assert!(work.calls.lock().unwrap().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn interrupted_pages_stay_pending() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let (mut runner, _work) = make_runner(&dir, 1, 1, FailurePolicy::Strict, &[]);
        runner.work = Arc::new(FakeWork {
            failing: HashSet::new(),
            retrying: [0].into_iter().collect(),
            calls: Mutex::new(vec![]),
        });
        let (tx, rx) = watch::channel(RunSignal::Continue);
        let recorder = Recorder::default();
        let pause = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send_replace(RunSignal::Pause);
        };
        let (outcome, ()) = tokio::join!(runner.run(&rx, &recorder), pause);

        assert!(matches!(outcome, RunOutcome::Quiesced(RunSignal::Pause)));
        assert!(recorder.0.lock().unwrap().is_empty());
        assert!(runner.store.get(Stage::Extraction, 0).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn storage_failures_end_the_run() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let (runner, _work) = make_runner(&dir, 2, 1, FailurePolicy::BestEffort, &[]);
        // Block the stage directory with a regular file.
        let stage_dir = runner.store.stage_dir(Stage::Extraction);
        std::fs::create_dir_all(stage_dir.parent().unwrap())?;
        std::fs::write(&stage_dir, "")?;
        let (_tx, rx) = watch::channel(RunSignal::Continue);
        let outcome = runner.run(&rx, &Recorder::default()).await;
        assert!(matches!(outcome, RunOutcome::StorageFailed(_)));
        Ok(())
    }
}
