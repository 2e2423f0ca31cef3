//! Project pipelines.
//!
//! A [`ProjectPipeline`] owns the status state machine of one project and
//! sequences its stages:
//!
//! ```text
//! created -> extraction_running <-> extraction_paused
//!                  |
//!                  v
//!            extraction_done -> translation_running <-> translation_paused
//!                                      |
//!                                      v
//!                               translation_done
//!
//! (any non-terminal state) -> cancelled
//! (a running stage) -> failed
//! ```
//!
//! All changes to the project record go through a single lock, and the
//! record is saved after every transition and every page. Page results are
//! stored before they are reported here, so the page store is always at
//! least as far along as the record.
//!
//! Only one process may run a project at a time. See [`lock`] for how the
//! others find out about it and ask it to stop.

use std::{collections::BTreeSet, sync::Arc};

use futures::{StreamExt as _, stream};
use tokio::{
    sync::{Mutex, OnceCell, watch},
    time::sleep,
};

use crate::{
    aggregate::Aggregator,
    async_utils::BoxedStream,
    config::PipelineConfig,
    engines::{Engines, Translator},
    error::{PipelineError, StorageError},
    page_source::PageSource,
    prelude::*,
    progress::{PageRef, ProgressBus, ProgressEvent, ProgressKind, StatusSnapshot, live_events},
    project::{Project, ProjectPaths, ProjectStatus, Stage, StageCounters},
    store::{PageOutcome, PageResult, PageStore},
};

use self::lock::{CONTROL_POLL_INTERVAL, ProjectLock};
use self::runner::{
    ExtractionWork, PageReporter, RunOutcome, RunSignal, StageRunner, StageWork,
    TranslationWork,
};

pub mod lock;
pub mod registry;
pub mod runner;


pub use registry::ProjectRegistry;

/// Which stage should run next for a project, if any?
pub fn next_stage(project: &Project) -> Option<Stage> {
    match project.status {
        ProjectStatus::Created => Some(Stage::Extraction),
        ProjectStatus::ExtractionRunning | ProjectStatus::ExtractionPaused => {
            Some(Stage::Extraction)
        }
        ProjectStatus::ExtractionDone if project.wants_translation() => {
            Some(Stage::Translation)
        }
        ProjectStatus::ExtractionDone | ProjectStatus::TranslationDone => None,
        ProjectStatus::TranslationRunning | ProjectStatus::TranslationPaused => {
            Some(Stage::Translation)
        }
        ProjectStatus::Failed | ProjectStatus::Cancelled => {
            Some(project.active_stage.unwrap_or(Stage::Extraction))
        }
    }
}

/// What `start` should do in a given state.
#[derive(Debug, PartialEq, Eq)]
enum StartPlan {
    Run,
    /// The stage is already complete.
    NoOp,
    Conflict,
}

fn start_plan(project: &Project, stage: Stage) -> StartPlan {
    use ProjectStatus::*;
    match (project.status, stage) {
        (ExtractionRunning | TranslationRunning, _) => StartPlan::Conflict,
        (Created | ExtractionPaused, Stage::Extraction) => StartPlan::Run,
        (Created | ExtractionPaused, Stage::Translation) => StartPlan::Conflict,
        (ExtractionDone | TranslationPaused, Stage::Extraction) => StartPlan::NoOp,
        (ExtractionDone | TranslationPaused, Stage::Translation) => StartPlan::Run,
        (TranslationDone, _) => StartPlan::NoOp,
        (Failed | Cancelled, _) => {
            let active = project.active_stage.unwrap_or(Stage::Extraction);
            match stage.cmp(&active) {
                std::cmp::Ordering::Less => StartPlan::NoOp,
                std::cmp::Ordering::Equal => StartPlan::Run,
                std::cmp::Ordering::Greater => StartPlan::Conflict,
            }
        }
    }
}

/// Drives one project. Cheap to clone.
#[derive(Clone)]
pub struct ProjectPipeline {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ProjectPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectPipeline").finish_non_exhaustive()
    }
}

struct Inner {
    paths: ProjectPaths,
    source_path: PathBuf,
    total_pages: usize,
    store: PageStore,
    aggregator: Aggregator,
    bus: ProgressBus,
    config: PipelineConfig,
    engines: Engines,
    source: OnceCell<Arc<dyn PageSource>>,
    state: Mutex<State>,
}

/// Everything guarded by the project lock.
struct State {
    project: Project,
    /// Pages whose latest result is `failed`.
    failed_pages: BTreeSet<(Stage, usize)>,
    run: Option<ActiveRun>,
}

/// Handles for the background task of a running project.
struct ActiveRun {
    signal: watch::Sender<RunSignal>,
    finished: watch::Receiver<bool>,
    /// Released when the run is cleared from [`State`].
    _lock: ProjectLock,
}

impl State {
    fn conflict(&self, op: &'static str) -> PipelineError {
        self.conflict_at(op, self.project.status)
    }

    fn conflict_at(&self, op: &'static str, status: ProjectStatus) -> PipelineError {
        PipelineError::StateConflict {
            op,
            project: self.project.id.clone(),
            status,
        }
    }

    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            status: self.project.status,
            extraction: self.project.extraction,
            translation: self.project.translation,
            last_error: self.project.last_error.clone(),
            failed_pages: self
                .failed_pages
                .iter()
                .map(|&(stage, index)| PageRef { stage, index })
                .collect(),
        }
    }

    /// Will this project stay in its current status until a new command?
    fn is_final(&self) -> bool {
        self.run.is_none()
            && (self.project.status.is_terminal()
                || (self.project.status == ProjectStatus::ExtractionDone
                    && !self.project.wants_translation()))
    }

    /// Update counters for a newly stored page result.
    fn record_page(&mut self, result: &PageResult) {
        let key = (result.stage, result.index);
        let was_failed = self.failed_pages.contains(&key);
        let counters = self.project.counters_mut(result.stage);
        match result.outcome {
            PageOutcome::Done => {
                counters.completed += 1;
                if was_failed {
                    counters.failed = counters.failed.saturating_sub(1);
                    self.failed_pages.remove(&key);
                }
            }
            PageOutcome::Failed if !was_failed => {
                counters.failed += 1;
                self.failed_pages.insert(key);
            }
            PageOutcome::Failed => {}
        }
    }

    /// Recompute counters from the page store.
    async fn reconcile(&mut self, store: &PageStore) -> Result<(), StorageError> {
        let total_pages = self.project.total_pages;
        self.failed_pages.clear();
        for stage in Stage::ALL {
            let mut counters = StageCounters::new(total_pages);
            for (index, outcome) in store.list(stage).await? {
                if index >= total_pages {
                    continue;
                }
                match outcome {
                    PageOutcome::Done => counters.completed += 1,
                    PageOutcome::Failed => {
                        counters.failed += 1;
                        self.failed_pages.insert((stage, index));
                    }
                }
            }
            *self.project.counters_mut(stage) = counters;
        }
        Ok(())
    }
}

impl ProjectPipeline {
    /// Wrap a loaded project record. `source` may be supplied if the
    /// document is already open.
    pub(crate) async fn new(
        project: Project,
        paths: ProjectPaths,
        config: PipelineConfig,
        engines: Engines,
        source: Option<Arc<dyn PageSource>>,
    ) -> Result<Self, StorageError> {
        let store = PageStore::new(paths.pages_dir());
        let aggregator = Aggregator::new(
            store.clone(),
            paths.clone(),
            project.total_pages,
            config.format,
        );
        let bus = ProgressBus::new(project.id.clone(), config.progress_buffer);
        let mut state = State {
            project,
            failed_pages: BTreeSet::new(),
            run: None,
        };
        state.reconcile(&store).await?;
        Ok(Self {
            inner: Arc::new(Inner {
                source_path: state.project.source.clone(),
                total_pages: state.project.total_pages,
                paths,
                store,
                aggregator,
                bus,
                config,
                engines,
                source: OnceCell::new_with(source),
                state: Mutex::new(state),
            }),
        })
    }

    /// The project ID.
    pub fn id(&self) -> &str {
        self.inner.bus.project_id()
    }

    /// Where the project's files live.
    pub fn paths(&self) -> &ProjectPaths {
        &self.inner.paths
    }

    /// The page cache.
    #[cfg(test)]
    pub fn store(&self) -> &PageStore {
        &self.inner.store
    }

    /// A copy of the current project record.
    pub async fn project(&self) -> Project {
        self.inner.state.lock().await.project.clone()
    }

    /// The current status and counters.
    pub async fn snapshot(&self) -> StatusSnapshot {
        self.inner.state.lock().await.snapshot()
    }

    /// Start (or resume) `stage` in the background, returning the new status.
    ///
    /// Starting a stage that is already complete does nothing. Starting
    /// extraction on a project with a target language continues into
    /// translation once extraction is done.
    #[instrument(level = "debug", skip(self), fields(project = %self.id()))]
    pub async fn start(&self, stage: Stage) -> Result<ProjectStatus, PipelineError> {
        let mut state = self.inner.state.lock().await;
        if state.run.is_some() {
            return Err(state.conflict("start"));
        }
        let lock = self.inner.claim(&mut state, "start").await?;
        match start_plan(&state.project, stage) {
            StartPlan::Conflict => Err(state.conflict("start")),
            StartPlan::NoOp => {
                debug!(%stage, status = %state.project.status, "Stage already complete");
                Ok(state.project.status)
            }
            StartPlan::Run => self.inner.launch(&mut state, stage, lock).await,
        }
    }

    /// Resume a paused project.
    pub async fn resume(&self) -> Result<ProjectStatus, PipelineError> {
        let stage = {
            let state = self.inner.state.lock().await;
            match state.project.status {
                status if status.is_paused() => status.stage(),
                _ => None,
            }
            .ok_or_else(|| state.conflict("resume"))?
        };
        self.start(stage).await
    }

    /// Stop dispatching pages, and wait for pages in flight to finish.
    ///
    /// Returns the status once the project has quiesced. This is normally a
    /// paused status, but a stage that finished its last page while we were
    /// waiting may already be done.
    ///
    /// If another process is running the project, we ask it to pause and
    /// wait for it to let go.
    #[instrument(level = "debug", skip(self), fields(project = %self.id()))]
    pub async fn pause(&self) -> Result<ProjectStatus, PipelineError> {
        let mut state = self.inner.state.lock().await;
        if let Some(run) = state.run.as_ref().filter(|_| state.project.status.is_running()) {
            info!("Pausing");
            run.signal.send_replace(RunSignal::Pause);
            let finished = run.finished.clone();
            drop(state);
            return Ok(self.wait_for(finished).await);
        }
        if state.run.is_some() {
            return Err(state.conflict("pause"));
        }

        match ProjectLock::try_acquire(&self.inner.paths).await? {
            // Nobody is running it.
            Some(_lock) => {
                self.inner.refresh(&mut state).await?;
                Err(state.conflict("pause"))
            }
            None => {
                info!("Asking the running process to pause");
                let _lock =
                    ProjectLock::request_and_acquire(&self.inner.paths, RunSignal::Pause)
                        .await?;
                self.inner.refresh(&mut state).await?;
                // A project that never started was only held briefly by
                // someone else, and there was nothing to pause.
                if state.project.status == ProjectStatus::Created {
                    Err(state.conflict("pause"))
                } else {
                    Ok(state.project.status)
                }
            }
        }
    }

    /// Cancel the project. Pages already stored remain valid.
    ///
    /// If another process is running the project, we ask it to cancel and
    /// wait for it to let go. If it stopped for some other reason first,
    /// the project is cancelled here instead.
    #[instrument(level = "debug", skip(self), fields(project = %self.id()))]
    pub async fn cancel(&self) -> Result<ProjectStatus, PipelineError> {
        let mut state = self.inner.state.lock().await;
        if let Some(run) = &state.run {
            info!("Cancelling");
            run.signal.send_replace(RunSignal::Cancel);
            let finished = run.finished.clone();
            drop(state);
            return Ok(self.wait_for(finished).await);
        }

        let _lock = match ProjectLock::try_acquire(&self.inner.paths).await? {
            Some(lock) => {
                self.inner.refresh(&mut state).await?;
                if state.project.status.is_terminal() {
                    return Err(state.conflict("cancel"));
                }
                lock
            }
            None => {
                info!("Asking the running process to cancel");
                let lock =
                    ProjectLock::request_and_acquire(&self.inner.paths, RunSignal::Cancel)
                        .await?;
                self.inner.refresh(&mut state).await?;
                if state.project.status.is_terminal() {
                    self.inner.publish_status(&state);
                    return Ok(state.project.status);
                }
                lock
            }
        };

        let previous = state.project.clone();
        state.project.status = ProjectStatus::Cancelled;
        state.project.touch();
        if let Err(err) = state.project.save(&self.inner.paths).await {
            state.project = previous;
            return Err(err.into());
        }
        info!("Cancelled");
        self.inner.publish_status(&state);
        Ok(state.project.status)
    }

    /// Run a completed stage again, for only its failed pages.
    #[instrument(level = "debug", skip(self), fields(project = %self.id()))]
    pub async fn retry_failed(&self, stage: Stage) -> Result<ProjectStatus, PipelineError> {
        let mut state = self.inner.state.lock().await;
        if state.run.is_some() {
            return Err(state.conflict("retry failed pages of"));
        }
        let lock = self.inner.claim(&mut state, "retry failed pages of").await?;
        let status = state.project.status;
        if status != stage.done() && status != ProjectStatus::TranslationDone {
            return Err(state.conflict("retry failed pages of"));
        }
        state.reconcile(&self.inner.store).await?;
        if state.project.counters(stage).failed == 0 {
            debug!(%stage, "No failed pages to retry");
            return Ok(status);
        }
        self.inner.launch(&mut state, stage, lock).await
    }

    /// Wait until no stage is running, and return the resulting status.
    pub async fn wait(&self) -> ProjectStatus {
        let finished = {
            let state = self.inner.state.lock().await;
            state.run.as_ref().map(|run| run.finished.clone())
        };
        match finished {
            Some(finished) => self.wait_for(finished).await,
            None => self.inner.state.lock().await.project.status,
        }
    }

    async fn wait_for(&self, mut finished: watch::Receiver<bool>) -> ProjectStatus {
        // An error means the run task is gone, which is just as final.
        let _ = finished.wait_for(|done| *done).await;
        self.inner.state.lock().await.project.status
    }

    /// Subscribe to progress.
    ///
    /// The stream starts with a status snapshot and a replay of every stored
    /// page (with `replayed` set), followed by live events. It ends after a
    /// `finished` event. A page that completes during the replay may be
    /// reported twice.
    pub async fn subscribe(&self) -> Result<BoxedStream<ProgressEvent>, PipelineError> {
        let state = self.inner.state.lock().await;
        let bus = &self.inner.bus;
        let receiver = bus.receiver();

        let mut replay = vec![bus.event(ProgressKind::Status(state.snapshot()))];
        for stage in Stage::ALL {
            for (index, result) in self.inner.store.load_all(stage).await? {
                let done = result.is_done();
                replay.push(bus.event(ProgressKind::Page {
                    stage,
                    index,
                    outcome: result.outcome,
                    content: done.then_some(result.content),
                    error: result.error,
                    replayed: true,
                }));
            }
        }

        if state.is_final() {
            replay.push(bus.event(ProgressKind::Finished {
                status: state.project.status,
            }));
            Ok(stream::iter(replay).boxed())
        } else {
            Ok(stream::iter(replay).chain(live_events(receiver)).boxed())
        }
    }

    /// Rebuild every artifact from the page store, returning their paths.
    #[instrument(level = "debug", skip(self), fields(project = %self.id()))]
    pub async fn rebuild_artifacts(&self) -> Result<Vec<PathBuf>, PipelineError> {
        let wants_translation = self.inner.state.lock().await.project.wants_translation();
        let mut written = vec![];
        for stage in Stage::ALL {
            if stage == Stage::Translation && !wants_translation {
                continue;
            }
            self.inner.aggregator.write_artifact(stage).await?;
            written.push(self.inner.paths.artifact_path(stage));
        }
        Ok(written)
    }
}

impl Inner {
    /// Open the document, if we haven't already.
    async fn page_source(&self) -> Result<Arc<dyn PageSource>, PipelineError> {
        let source = self
            .source
            .get_or_try_init(|| async {
                self.engines.sources.open(&self.source_path).await.map_err(|err| {
                    PipelineError::config(format!(
                        "cannot open {:?}: {:#}",
                        self.source_path.display(),
                        err
                    ))
                })
            })
            .await?;
        if source.page_count() != self.total_pages {
            return Err(PipelineError::config(format!(
                "{:?} now has {} pages, but the project was created with {}",
                self.source_path.display(),
                source.page_count(),
                self.total_pages
            )));
        }
        Ok(source.clone())
    }

    fn translator(&self) -> Result<Arc<dyn Translator>, PipelineError> {
        self.engines
            .translator
            .clone()
            .ok_or_else(|| PipelineError::config("no translation backend is available"))
    }

    fn publish_status(&self, state: &State) {
        self.bus.publish(ProgressKind::Status(state.snapshot()));
        if state.is_final() {
            self.bus.publish(ProgressKind::Finished {
                status: state.project.status,
            });
        }
    }

    /// Take the project lock so that we can run it, and bring our copy of
    /// the record up to date. Fails if another process is running it.
    async fn claim(
        &self,
        state: &mut State,
        op: &'static str,
    ) -> Result<ProjectLock, PipelineError> {
        let Some(lock) = ProjectLock::try_acquire(&self.paths).await? else {
            let status = Project::load(&self.paths)
                .await?
                .map_or(state.project.status, |project| project.status);
            return Err(state.conflict_at(op, status));
        };
        self.refresh(state).await?;
        Ok(lock)
    }

    /// Reload the record and counters from disk. Must be called with the
    /// project lock held, since a running status is taken to be stale.
    async fn refresh(&self, state: &mut State) -> Result<(), PipelineError> {
        if let Some(mut project) = Project::load(&self.paths).await? {
            if project.recover_interrupted() {
                warn!(project = %project.id, "Project was interrupted; marking it paused");
                project.save(&self.paths).await?;
            }
            state.project = project;
        }
        state.reconcile(&self.store).await?;
        Ok(())
    }

    /// Check that `stage` can run, mark it running, and spawn the run task.
    ///
    /// If anything fails, the project is left as it was.
    async fn launch(
        self: &Arc<Self>,
        state: &mut State,
        stage: Stage,
        project_lock: ProjectLock,
    ) -> Result<ProjectStatus, PipelineError> {
        let translates = stage == Stage::Translation || state.project.wants_translation();
        if stage == Stage::Translation && !state.project.wants_translation() {
            return Err(PipelineError::config("project has no target language"));
        }
        if translates {
            self.translator()?;
        }
        if stage == Stage::Extraction {
            self.page_source().await?;
        }

        lock::clear_requests(&self.paths).await?;
        let previous = state.project.clone();
        state.reconcile(&self.store).await?;
        state.project.status = stage.running();
        state.project.active_stage = Some(stage);
        state.project.last_error = None;
        state.project.touch();
        if let Err(err) = state.project.save(&self.paths).await {
            state.project = previous;
            return Err(err.into());
        }
        info!(project = %state.project.id, %stage, "Starting");

        let (signal_tx, signal_rx) = watch::channel(RunSignal::Continue);
        let (finished_tx, finished_rx) = watch::channel(false);
        tokio::spawn(self.clone().watch_requests(finished_rx.clone()));
        state.run = Some(ActiveRun {
            signal: signal_tx,
            finished: finished_rx,
            _lock: project_lock,
        });
        self.publish_status(state);
        tokio::spawn(self.clone().drive(stage, signal_rx, finished_tx));
        Ok(state.project.status)
    }

    /// Pass pause and cancel requests from other processes on to the run,
    /// until it finishes.
    async fn watch_requests(self: Arc<Self>, mut finished: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = finished.wait_for(|done| *done) => return,
                _ = sleep(CONTROL_POLL_INTERVAL) => {}
            }
            let requested = match lock::read_request(&self.paths).await {
                Ok(Some(requested)) => requested,
                Ok(None) => continue,
                Err(err) => {
                    warn!("Cannot check for control requests: {}", err);
                    continue;
                }
            };
            let state = self.state.lock().await;
            if let Some(run) = &state.run {
                let current = *run.signal.borrow();
                if current != requested
                    && (current == RunSignal::Continue || requested == RunSignal::Cancel)
                {
                    info!(
                        project = %state.project.id,
                        ?requested,
                        "Stop requested by another process"
                    );
                    run.signal.send_replace(requested);
                }
            }
        }
    }

    /// The background task: run stages until the project stops.
    async fn drive(
        self: Arc<Self>,
        first: Stage,
        signal: watch::Receiver<RunSignal>,
        finished: watch::Sender<bool>,
    ) {
        let mut stage = first;
        loop {
            let outcome = match self.stage_runner(stage).await {
                Ok(runner) => runner.run(&signal, &*self).await,
                Err(err) => {
                    let mut state = self.state.lock().await;
                    self.fail(&mut state, err).await;
                    break;
                }
            };
            match self.finish_stage(stage, outcome, &signal).await {
                Some(next) => stage = next,
                None => break,
            }
        }
        // `finish_stage` or `fail` has already cleared `state.run`.
        let _ = finished.send(true);
    }

    async fn stage_runner(&self, stage: Stage) -> Result<StageRunner, PipelineError> {
        let (languages, target_language) = {
            let state = self.state.lock().await;
            (
                state.project.ocr_languages.clone(),
                state.project.target_language.clone(),
            )
        };
        let work: Arc<dyn StageWork> = match stage {
            Stage::Extraction => Arc::new(ExtractionWork {
                source: self.page_source().await?,
                recognizer: self.engines.recognizer.clone(),
                languages,
                retry: self.config.retry,
                timeout: self.config.page_timeout,
            }),
            Stage::Translation => Arc::new(TranslationWork {
                store: self.store.clone(),
                translator: self.translator()?,
                target_language: target_language
                    .ok_or_else(|| PipelineError::config("project has no target language"))?,
                retry: self.config.retry,
                timeout: self.config.page_timeout,
            }),
        };
        Ok(StageRunner {
            stage,
            total_pages: self.total_pages,
            concurrency: self.config.concurrency,
            failure_policy: self.config.failure_policy,
            store: self.store.clone(),
            aggregator: self.aggregator.clone(),
            work,
        })
    }

    /// Apply the outcome of a stage run. Returns the next stage to run, if
    /// we should keep going.
    async fn finish_stage(
        &self,
        stage: Stage,
        outcome: RunOutcome,
        signal: &watch::Receiver<RunSignal>,
    ) -> Option<Stage> {
        let mut state = self.state.lock().await;
        let mut next = None;
        match outcome {
            RunOutcome::Complete => {
                if let Err(err) = self.aggregator.write_artifact(stage).await {
                    self.fail(&mut state, err.into()).await;
                    return None;
                }
                let counters = *state.project.counters(stage);
                info!(
                    %stage,
                    completed = counters.completed,
                    failed = counters.failed,
                    "Stage complete"
                );
                state.project.status = stage.done();
                if stage == Stage::Extraction && state.project.wants_translation() {
                    match *signal.borrow() {
                        RunSignal::Continue => {
                            state.project.status = Stage::Translation.running();
                            state.project.active_stage = Some(Stage::Translation);
                            next = Some(Stage::Translation);
                        }
                        RunSignal::Pause => {
                            state.project.status = Stage::Translation.paused();
                            state.project.active_stage = Some(Stage::Translation);
                        }
                        RunSignal::Cancel => state.project.status = ProjectStatus::Cancelled,
                    }
                }
            }
            RunOutcome::Quiesced(RunSignal::Cancel) => {
                info!(%stage, "Cancelled");
                state.project.status = ProjectStatus::Cancelled;
            }
            RunOutcome::Quiesced(_) => {
                info!(%stage, "Paused");
                state.project.status = stage.paused();
            }
            RunOutcome::Halted { index, error } => {
                if let Err(err) = self.aggregator.write_artifact(stage).await {
                    warn!(%stage, "Cannot write partial artifact: {}", err);
                }
                let err = PipelineError::Engine {
                    stage,
                    index,
                    source: error,
                };
                self.fail(&mut state, err).await;
                return None;
            }
            RunOutcome::StorageFailed(err) => {
                self.fail(&mut state, err.into()).await;
                return None;
            }
        }

        state.project.touch();
        if let Err(err) = state.project.save(&self.paths).await {
            self.fail(&mut state, err.into()).await;
            return None;
        }
        if next.is_none() {
            // Let `is_final` see that we're about to stop.
            state.run = None;
        }
        self.publish_status(&state);
        next
    }

    /// Mark the project as failed.
    async fn fail(&self, state: &mut State, err: PipelineError) {
        error!(project = %state.project.id, "Project failed: {}", err);
        state.project.status = ProjectStatus::Failed;
        state.project.last_error = Some((&err).into());
        state.project.touch();
        if let Err(save_err) = state.project.save(&self.paths).await {
            error!(
                project = %state.project.id,
                "Cannot record failure: {}", save_err
            );
        }
        state.run = None;
        self.publish_status(state);
    }
}

#[async_trait]
impl PageReporter for Inner {
    async fn page_finished(&self, result: &PageResult) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state.record_page(result);
        state.project.touch();
        state.project.save(&self.paths).await?;
        let done = result.is_done();
        self.bus.publish(ProgressKind::Page {
            stage: result.stage,
            index: result.index,
            outcome: result.outcome,
            content: done.then(|| result.content.clone()),
            error: result.error.clone(),
            replayed: false,
        });
        self.bus.publish(ProgressKind::Status(state.snapshot()));
        Ok(())
    }
}
