//! Asynchronous generation driver.
//!
//! [`GenerationOrchestrator::submit`] validates a request on the caller's
//! thread and hands it to a driver thread. The driver walks the stage graph:
//! every stage whose dependencies are complete is sent to a small crossbeam
//! worker pool, completions come back on a channel, and the driver alone owns
//! stage outputs. Per-cell work inside a stage runs on a rayon pool owned by
//! the run. Cancellation is cooperative through a shared [`CancelToken`].

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::{Deserialize, Serialize};

use crate::biome::{BiomeClassifier, BiomeMap, ClimateGrid};
use crate::cave::{CaveGenerator, CaveNetwork};
use crate::error::{ConfigError, Diagnostic, FailureReason, StageError};
use crate::heightmap::{HeightmapBuilder, HeightmapGrid};
use crate::hydrology::{HydrologyGraph, HydrologyRouter};
use crate::placement::{PlacementInput, PlacementSampler, PlacementSet};
use crate::poi::{PoiInput, PoiSelector, PoiSet};
use crate::request::{GenerationRequest, PreparedRequest};
use crate::resources::{ResourceDistributor, ResourceInput, ResourceSet};
use crate::result::GenerationResult;
use crate::roads::{RoadGraph, RoadInput, RoadRouter};
use crate::sinks::{SaveManager, SpawnSink, TerrainSink};
use crate::stage::{CancelToken, Stage, StageContext};

/// Lifecycle of one generation run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GenerationState {
    Idle,
    Queued,
    /// Most recently started stage.
    Running(Stage),
    Completed,
    Cancelled,
    Failed,
}

impl GenerationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProgressUpdate {
    pub stage: Stage,
    pub stage_index: usize,
    pub stage_count: usize,
    /// Fraction of `stage` that is done, in `[0, 1]`.
    pub fraction: f32,
}

/// Terminal result of a run.
#[derive(Clone, Debug, PartialEq)]
pub enum GenerationOutcome {
    Completed(Box<GenerationResult>),
    Cancelled,
    Failed(FailureReason),
}

impl GenerationOutcome {
    pub fn state(&self) -> GenerationState {
        match self {
            Self::Completed(_) => GenerationState::Completed,
            Self::Cancelled => GenerationState::Cancelled,
            Self::Failed(_) => GenerationState::Failed,
        }
    }

    pub fn result(&self) -> Option<&GenerationResult> {
        match self {
            Self::Completed(result) => Some(result.as_ref()),
            _ => None,
        }
    }
}

/// Observer of progress and completion. Called from the driver and stage
/// worker threads.
pub trait ProgressListener: Send + Sync {
    fn on_progress(&self, _update: ProgressUpdate) {}
    fn on_finished(&self, _outcome: &GenerationOutcome) {}
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Threads in the per-run rayon pool; 0 uses every core.
    pub worker_threads: usize,
    /// Threads that execute whole stages concurrently.
    pub stage_workers: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            stage_workers: 3,
        }
    }
}

/// Entry point for running generation requests.
#[derive(Default)]
pub struct GenerationOrchestrator {
    config: OrchestratorConfig,
    terrain_sink: Option<Arc<dyn TerrainSink>>,
    spawn_sink: Option<Arc<dyn SpawnSink>>,
    save_manager: Option<Arc<dyn SaveManager>>,
    listeners: Vec<Arc<dyn ProgressListener>>,
}

impl GenerationOrchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn with_terrain_sink(mut self, sink: Arc<dyn TerrainSink>) -> Self {
        self.terrain_sink = Some(sink);
        self
    }

    pub fn with_spawn_sink(mut self, sink: Arc<dyn SpawnSink>) -> Self {
        self.spawn_sink = Some(sink);
        self
    }

    pub fn with_save_manager(mut self, manager: Arc<dyn SaveManager>) -> Self {
        self.save_manager = Some(manager);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn ProgressListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Validate `request` and start generating it in the background.
    ///
    /// Returns immediately; the handle starts out `Queued`.
    pub fn submit(&self, request: GenerationRequest) -> Result<GenerationHandle, ConfigError> {
        self.submit_with_cancel(request, CancelToken::new())
    }

    /// Like [`submit`](Self::submit), but the run observes a caller-owned
    /// token. Cancelling `cancel` is equivalent to [`GenerationHandle::cancel`].
    pub fn submit_with_cancel(
        &self,
        request: GenerationRequest,
        cancel: CancelToken,
    ) -> Result<GenerationHandle, ConfigError> {
        let prepared = request.prepare()?;
        let shared = Arc::new(Shared::new(self.listeners.clone(), cancel));
        shared.set_state(GenerationState::Queued);

        let driver = Driver {
            prepared,
            config: self.config.clone(),
            terrain_sink: self.terrain_sink.clone(),
            spawn_sink: self.spawn_sink.clone(),
            save_manager: self.save_manager.clone(),
            shared: Arc::clone(&shared),
        };
        let spawned = std::thread::Builder::new()
            .name("strata-driver".into())
            .spawn(move || driver.run());
        let driver = match spawned {
            Ok(join) => Some(join),
            Err(e) => {
                tracing::error!("Failed to spawn generation driver: {e}");
                shared.finish(GenerationOutcome::Failed(FailureReason::ResourceExhaustion {
                    stage: Stage::Heightmap,
                    message: format!("driver thread: {e}"),
                }));
                None
            }
        };
        Ok(GenerationHandle { shared, driver })
    }

    /// Submit and block until the run finishes.
    pub fn run_blocking(&self, request: GenerationRequest) -> Result<GenerationOutcome, ConfigError> {
        Ok(self.submit(request)?.wait())
    }
}

struct Status {
    state: GenerationState,
    progress: Option<ProgressUpdate>,
    outcome: Option<GenerationOutcome>,
}

struct Shared {
    status: Mutex<Status>,
    finished: Condvar,
    cancel: CancelToken,
    listeners: Vec<Arc<dyn ProgressListener>>,
}

impl Shared {
    fn new(listeners: Vec<Arc<dyn ProgressListener>>, cancel: CancelToken) -> Self {
        Self {
            status: Mutex::new(Status {
                state: GenerationState::Idle,
                progress: None,
                outcome: None,
            }),
            finished: Condvar::new(),
            cancel,
            listeners,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: GenerationState) {
        let mut status = self.lock();
        if !status.state.is_terminal() {
            status.state = state;
        }
    }

    fn publish(&self, update: ProgressUpdate) {
        self.lock().progress = Some(update);
        for listener in &self.listeners {
            listener.on_progress(update);
        }
    }

    /// Record the terminal state, then notify listeners and waiters.
    fn finish(&self, outcome: GenerationOutcome) {
        {
            let mut status = self.lock();
            status.state = outcome.state();
            status.outcome = Some(outcome.clone());
        }
        for listener in &self.listeners {
            listener.on_finished(&outcome);
        }
        self.finished.notify_all();
    }
}

/// Caller-side view of a submitted run.
pub struct GenerationHandle {
    shared: Arc<Shared>,
    driver: Option<JoinHandle<()>>,
}

impl GenerationHandle {
    pub fn state(&self) -> GenerationState {
        self.shared.lock().state
    }

    /// Latest progress update, if any stage has started.
    pub fn progress(&self) -> Option<ProgressUpdate> {
        self.shared.lock().progress
    }

    /// The outcome if the run has finished; never blocks.
    pub fn try_outcome(&self) -> Option<GenerationOutcome> {
        self.shared.lock().outcome.clone()
    }

    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.shared.cancel.cancel();
    }

    /// Block until the run finishes or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<GenerationOutcome> {
        let status = self.shared.lock();
        let (status, _) = self
            .shared
            .finished
            .wait_timeout_while(status, timeout, |s| s.outcome.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        status.outcome.clone()
    }

    /// Block until the run finishes.
    pub fn wait(mut self) -> GenerationOutcome {
        let outcome = {
            let status = self.shared.lock();
            let mut status = self
                .shared
                .finished
                .wait_while(status, |s| s.outcome.is_none())
                .unwrap_or_else(PoisonError::into_inner);
            status.outcome.take()
        };
        if let Some(join) = self.driver.take() {
            let _ = join.join();
        }
        outcome.unwrap_or(GenerationOutcome::Cancelled)
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Output of one stage, moved from a worker to the driver.
enum StageOutput {
    Heightmap(Arc<HeightmapGrid>),
    Biome(Arc<ClimateGrid>, Arc<BiomeMap>),
    Hydrology(Arc<HydrologyGraph>),
    Poi(Arc<PoiSet>),
    Roads(Arc<RoadGraph>),
    Placement(PlacementSet),
    Caves(CaveNetwork),
    Resources(ResourceSet),
}

type StageFn = Box<dyn FnOnce(&StageContext) -> Result<(StageOutput, Vec<Diagnostic>), StageError> + Send>;

struct Job {
    stage: Stage,
    run: StageFn,
    ctx: StageContext,
}

enum Completion {
    Done(Stage, Result<(StageOutput, Vec<Diagnostic>), StageError>, Duration),
    Panicked(Stage),
}

#[derive(Default)]
struct Outputs {
    heightmap: Option<Arc<HeightmapGrid>>,
    climate: Option<Arc<ClimateGrid>>,
    biomes: Option<Arc<BiomeMap>>,
    hydrology: Option<Arc<HydrologyGraph>>,
    pois: Option<Arc<PoiSet>>,
    roads: Option<Arc<RoadGraph>>,
    placements: Option<PlacementSet>,
    caves: Option<CaveNetwork>,
    resources: Option<ResourceSet>,
    diagnostics: Vec<Diagnostic>,
}

impl Outputs {
    fn store(&mut self, output: StageOutput) {
        match output {
            StageOutput::Heightmap(h) => self.heightmap = Some(h),
            StageOutput::Biome(c, b) => {
                self.climate = Some(c);
                self.biomes = Some(b);
            }
            StageOutput::Hydrology(h) => self.hydrology = Some(h),
            StageOutput::Poi(p) => self.pois = Some(p),
            StageOutput::Roads(r) => self.roads = Some(r),
            StageOutput::Placement(p) => self.placements = Some(p),
            StageOutput::Caves(c) => self.caves = Some(c),
            StageOutput::Resources(r) => self.resources = Some(r),
        }
    }
}

fn missing(what: &str) -> StageError {
    StageError::Failed(format!("missing {what} input"))
}

fn input<T>(slot: &Option<Arc<T>>, what: &str) -> Result<Arc<T>, StageError> {
    slot.clone().ok_or_else(|| missing(what))
}

fn unwrap_arc<T: Clone>(slot: Option<Arc<T>>, what: &str) -> Result<T, StageError> {
    let arc = slot.ok_or_else(|| missing(what))?;
    Ok(Arc::try_unwrap(arc).unwrap_or_else(|shared| (*shared).clone()))
}

struct Driver {
    prepared: PreparedRequest,
    config: OrchestratorConfig,
    terrain_sink: Option<Arc<dyn TerrainSink>>,
    spawn_sink: Option<Arc<dyn SpawnSink>>,
    save_manager: Option<Arc<dyn SaveManager>>,
    shared: Arc<Shared>,
}

impl Driver {
    fn run(self) {
        let request = &self.prepared.request;
        tracing::info!(
            world = %request.world_id,
            seed = request.seed,
            width = request.extent.width,
            height = request.extent.height,
            "Generation started"
        );
        let started = Instant::now();
        let outcome = match self.execute() {
            Ok(result) => GenerationOutcome::Completed(Box::new(self.publish(result))),
            Err(None) => GenerationOutcome::Cancelled,
            Err(Some(reason)) => GenerationOutcome::Failed(reason),
        };
        match &outcome {
            GenerationOutcome::Completed(result) => tracing::info!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                diagnostics = result.diagnostics.len(),
                "Generation completed"
            ),
            GenerationOutcome::Cancelled => tracing::info!("Generation cancelled"),
            GenerationOutcome::Failed(reason) => tracing::error!("Generation failed: {reason}"),
        }
        self.shared.finish(outcome);
    }

    /// Run the stage graph. `Err(None)` means cancelled.
    fn execute(&self) -> Result<GenerationResult, Option<FailureReason>> {
        let threads = match self.config.worker_threads {
            0 => num_cpus::get(),
            n => n,
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("strata-rayon-{i}"))
            .build()
            .map_err(|e| {
                Some(FailureReason::ResourceExhaustion {
                    stage: Stage::Heightmap,
                    message: format!("rayon pool: {e}"),
                })
            })?;
        let pool = Arc::new(pool);

        let (job_tx, job_rx) = unbounded::<Job>();
        let (done_tx, done_rx) = unbounded::<Completion>();
        let mut workers = Vec::new();
        for i in 0..self.config.stage_workers.max(1) {
            let jobs = job_rx.clone();
            let done = done_tx.clone();
            let pool = Arc::clone(&pool);
            let spawned = std::thread::Builder::new()
                .name(format!("strata-stage-{i}"))
                .spawn(move || stage_worker(jobs, done, pool));
            match spawned {
                Ok(join) => workers.push(join),
                Err(e) => {
                    drop(job_tx);
                    for join in workers {
                        let _ = join.join();
                    }
                    return Err(Some(FailureReason::ResourceExhaustion {
                        stage: Stage::Heightmap,
                        message: format!("stage worker: {e}"),
                    }));
                }
            }
        }
        drop(done_tx);

        let outcome = self.drive(&job_tx, &done_rx);
        drop(job_tx);
        for join in workers {
            let _ = join.join();
        }
        let outputs = outcome?;
        self.assemble(outputs).map_err(|e| FailureReason::from_stage_error(Stage::Placement, e))
    }

    fn drive(
        &self,
        jobs: &Sender<Job>,
        completions: &Receiver<Completion>,
    ) -> Result<Outputs, Option<FailureReason>> {
        let mut outputs = Outputs::default();
        let mut pending: Vec<Stage> = Stage::ALL.to_vec();
        let mut done: Vec<Stage> = Vec::new();
        let mut running = 0usize;
        let mut failure: Option<Option<FailureReason>> = None;

        loop {
            if failure.is_none() && self.shared.cancel.is_cancelled() {
                failure = Some(None);
            }
            if failure.is_none() {
                let ready: Vec<Stage> = pending
                    .iter()
                    .copied()
                    .filter(|s| s.dependencies().iter().all(|d| done.contains(d)))
                    .collect();
                for stage in ready {
                    pending.retain(|s| *s != stage);
                    match self.job(stage, &outputs) {
                        Ok(job) => {
                            self.shared.set_state(GenerationState::Running(stage));
                            self.progress(stage, 0.0);
                            tracing::info!(stage = stage.name(), "Stage started");
                            if jobs.send(job).is_err() {
                                failure = Some(Some(FailureReason::ResourceExhaustion {
                                    stage,
                                    message: "stage worker pool closed".into(),
                                }));
                                break;
                            }
                            running += 1;
                        }
                        Err(e) => {
                            failure = Some(FailureReason::from_stage_error(stage, e));
                            break;
                        }
                    }
                }
            }
            if running == 0 {
                break;
            }

            let Ok(completion) = completions.recv() else {
                failure.get_or_insert(Some(FailureReason::ResourceExhaustion {
                    stage: Stage::Heightmap,
                    message: "stage workers exited".into(),
                }));
                break;
            };
            running -= 1;
            match completion {
                Completion::Done(stage, Ok((output, diagnostics)), elapsed) => {
                    tracing::info!(
                        stage = stage.name(),
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Stage finished"
                    );
                    for diagnostic in &diagnostics {
                        tracing::warn!(stage = stage.name(), "{diagnostic}");
                    }
                    if failure.is_none() {
                        outputs.store(output);
                        outputs.diagnostics.extend(diagnostics);
                        done.push(stage);
                        self.progress(stage, 1.0);
                    }
                }
                Completion::Done(stage, Err(e), _) => {
                    if failure.is_none() {
                        failure = Some(FailureReason::from_stage_error(stage, e));
                        // Stop the stages still running.
                        self.shared.cancel.cancel();
                    }
                }
                Completion::Panicked(stage) => {
                    tracing::error!(stage = stage.name(), "Stage worker panicked");
                    if failure.is_none() {
                        failure = Some(Some(FailureReason::WorkerPanicked { stage }));
                        self.shared.cancel.cancel();
                    }
                }
            }
        }

        match failure {
            Some(reason) => Err(reason),
            None => Ok(outputs),
        }
    }

    fn progress(&self, stage: Stage, fraction: f32) {
        self.shared.publish(ProgressUpdate {
            stage,
            stage_index: stage.index(),
            stage_count: Stage::ALL.len(),
            fraction,
        });
    }

    fn job(&self, stage: Stage, out: &Outputs) -> Result<Job, StageError> {
        let p = &self.prepared;
        let r = &p.request;
        let seed = r.seed;
        let run: StageFn = match stage {
            Stage::Heightmap => {
                let builder = HeightmapBuilder::new(
                    seed,
                    r.extent,
                    r.origin,
                    r.cell_size,
                    r.elevation.clone(),
                    r.heightmap.clone(),
                )
                .map_err(|e| StageError::Failed(e.to_string()))?;
                Box::new(move |ctx| {
                    let heightmap = builder.build(ctx)?;
                    let (lo, hi) = heightmap.range();
                    tracing::debug!(min = lo, max = hi, "Heightmap range");
                    Ok((StageOutput::Heightmap(Arc::new(heightmap)), Vec::new()))
                })
            }
            Stage::Biome => {
                let heightmap = input(&out.heightmap, "heightmap")?;
                let classifier = BiomeClassifier::new(seed, &r.climate, Arc::clone(&p.biomes));
                Box::new(move |ctx| {
                    let (climate, biomes) = classifier.classify(&heightmap, ctx)?;
                    Ok((StageOutput::Biome(Arc::new(climate), Arc::new(biomes)), Vec::new()))
                })
            }
            Stage::Hydrology => {
                let heightmap = input(&out.heightmap, "heightmap")?;
                let router = HydrologyRouter::new(r.hydrology.clone());
                Box::new(move |ctx| {
                    let graph = router.route(&heightmap, ctx)?;
                    Ok((StageOutput::Hydrology(Arc::new(graph)), Vec::new()))
                })
            }
            Stage::Poi => {
                let heightmap = input(&out.heightmap, "heightmap")?;
                let biomes = input(&out.biomes, "biome")?;
                let hydrology = input(&out.hydrology, "hydrology")?;
                let config = r.poi.clone();
                let table = Arc::clone(&p.biomes);
                Box::new(move |ctx| {
                    let set = PoiSelector::new(seed, &config, &table).select(
                        &PoiInput {
                            heightmap: &heightmap,
                            biomes: &biomes,
                            hydrology: &hydrology,
                        },
                        ctx,
                    )?;
                    let mut diagnostics = Vec::new();
                    if set.is_short() {
                        diagnostics.push(Diagnostic::PoiShortfall {
                            requested: set.requested,
                            placed: set.records.len() as u32,
                        });
                    }
                    Ok((StageOutput::Poi(Arc::new(set)), diagnostics))
                })
            }
            Stage::Roads => {
                let heightmap = input(&out.heightmap, "heightmap")?;
                let biomes = input(&out.biomes, "biome")?;
                let hydrology = input(&out.hydrology, "hydrology")?;
                let pois = input(&out.pois, "poi")?;
                let config = r.roads.clone();
                let table = Arc::clone(&p.biomes);
                Box::new(move |ctx| {
                    let router = RoadRouter::new(&config, &table);
                    let input = RoadInput {
                        heightmap: &heightmap,
                        biomes: &biomes,
                        hydrology: &hydrology,
                        pois: &pois.records,
                    };
                    let mut graph = router.build(&input, 0, ctx)?;
                    let mut level = 0;
                    while !graph.is_fully_connected() && level < config.road_relax_attempts {
                        level += 1;
                        tracing::debug!(level, "Relaxing road passability");
                        graph = router.build(&input, level, ctx)?;
                    }
                    let mut diagnostics = Vec::new();
                    if level > 0 {
                        diagnostics.push(Diagnostic::RoadsRelaxed { level });
                    }
                    if !graph.is_fully_connected() {
                        diagnostics.push(Diagnostic::RoadNetworkDisconnected {
                            unreachable: graph.unreachable.clone(),
                        });
                    }
                    Ok((StageOutput::Roads(Arc::new(graph)), diagnostics))
                })
            }
            Stage::Placement => {
                let heightmap = input(&out.heightmap, "heightmap")?;
                let biomes = input(&out.biomes, "biome")?;
                let hydrology = input(&out.hydrology, "hydrology")?;
                let roads = input(&out.roads, "roads")?;
                let pois = input(&out.pois, "poi")?;
                let rules = Arc::clone(&p.placement);
                let config = r.placement.clone();
                let table = Arc::clone(&p.biomes);
                Box::new(move |ctx| {
                    let set = PlacementSampler::new(seed, &rules, &config, &table).sample(
                        &PlacementInput {
                            heightmap: &heightmap,
                            biomes: &biomes,
                            hydrology: &hydrology,
                            roads: &roads,
                            pois: &pois.records,
                        },
                        ctx,
                    )?;
                    let mut diagnostics = Vec::new();
                    if set.objects.len() * 2 < set.target {
                        diagnostics.push(Diagnostic::PlacementShortfall {
                            target: set.target,
                            placed: set.objects.len(),
                        });
                    }
                    Ok((StageOutput::Placement(set), diagnostics))
                })
            }
            Stage::Caves => {
                let heightmap = input(&out.heightmap, "heightmap")?;
                let biomes = input(&out.biomes, "biome")?;
                let config = r.caves.clone();
                let table = Arc::clone(&p.biomes);
                Box::new(move |ctx| {
                    let network =
                        CaveGenerator::new(seed, &config, &table).generate(&heightmap, &biomes, ctx)?;
                    Ok((StageOutput::Caves(network), Vec::new()))
                })
            }
            Stage::Resources => {
                let heightmap = input(&out.heightmap, "heightmap")?;
                let biomes = input(&out.biomes, "biome")?;
                let hydrology = input(&out.hydrology, "hydrology")?;
                let table = Arc::clone(&p.resources);
                Box::new(move |ctx| {
                    let set = ResourceDistributor::new(seed, &table).distribute(
                        &ResourceInput {
                            heightmap: &heightmap,
                            biomes: &biomes,
                            hydrology: &hydrology,
                        },
                        ctx,
                    )?;
                    Ok((StageOutput::Resources(set), Vec::new()))
                })
            }
        };

        let shared = Arc::clone(&self.shared);
        let ctx = StageContext::new(
            shared.cancel.clone(),
            Arc::new(move |fraction: f32| {
                shared.publish(ProgressUpdate {
                    stage,
                    stage_index: stage.index(),
                    stage_count: Stage::ALL.len(),
                    fraction,
                })
            }),
        );
        Ok(Job { stage, run, ctx })
    }

    fn assemble(&self, out: Outputs) -> Result<GenerationResult, StageError> {
        let request = &self.prepared.request;
        Ok(GenerationResult {
            world_id: request.world_id.clone(),
            seed: request.seed,
            heightmap: unwrap_arc(out.heightmap, "heightmap")?,
            climate: unwrap_arc(out.climate, "climate")?,
            biomes: unwrap_arc(out.biomes, "biome")?,
            hydrology: unwrap_arc(out.hydrology, "hydrology")?,
            pois: unwrap_arc(out.pois, "poi")?,
            roads: unwrap_arc(out.roads, "roads")?,
            placements: out.placements.ok_or_else(|| missing("placement"))?,
            caves: out.caves.ok_or_else(|| missing("caves"))?,
            resources: out.resources.ok_or_else(|| missing("resources"))?,
            diagnostics: out.diagnostics,
        })
    }

    /// Hand the finished result to every sink. Sink failures become
    /// diagnostics and never discard the result.
    fn publish(&self, mut result: GenerationResult) -> GenerationResult {
        let mut rejected = Vec::new();
        if let Some(sink) = &self.terrain_sink {
            for region in result.regions(self.prepared.request.region_size) {
                if let Err(e) = sink.commit_region(&region) {
                    rejected.push(Diagnostic::SinkRejected {
                        sink: "terrain".into(),
                        message: e.to_string(),
                    });
                    break;
                }
            }
        }
        if let Some(sink) = &self.spawn_sink {
            if let Err(e) = sink.spawn(&result.spawn_batch()) {
                rejected.push(Diagnostic::SinkRejected {
                    sink: "spawn".into(),
                    message: e.to_string(),
                });
            }
        }
        for diagnostic in &rejected {
            tracing::warn!("{diagnostic}");
        }
        result.diagnostics.extend(rejected);

        if let Some(saves) = &self.save_manager {
            if let Err(e) = saves.store(&result.world_id, &result) {
                let diagnostic = Diagnostic::SinkRejected {
                    sink: "save".into(),
                    message: e.to_string(),
                };
                tracing::warn!("{diagnostic}");
                result.diagnostics.push(diagnostic);
            }
        }
        result
    }
}

fn stage_worker(jobs: Receiver<Job>, done: Sender<Completion>, pool: Arc<rayon::ThreadPool>) {
    while let Ok(job) = jobs.recv() {
        let Job { stage, run, ctx } = job;
        let started = Instant::now();
        let completion = match catch_unwind(AssertUnwindSafe(|| pool.install(|| run(&ctx)))) {
            Ok(result) => Completion::Done(stage, result, started.elapsed()),
            Err(_) => Completion::Panicked(stage),
        };
        if done.send(completion).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::sinks::{MemorySaveManager, SinkError, SpawnBatch, TerrainRegion};

    fn small_request(seed: u64) -> GenerationRequest {
        let mut request = GenerationRequest::default()
            .with_seed(seed)
            .with_extent(96, 96);
        request.heightmap.falloff_width = 8;
        request.poi.poi_count = 4;
        request.poi.min_poi_separation = 12.0;
        request.region_size = 32;
        request
    }

    #[test]
    fn test_submit_rejects_invalid_request() {
        let orchestrator = GenerationOrchestrator::default();
        let result = orchestrator.submit(GenerationRequest::default().with_extent(0, 0));
        assert!(matches!(result, Err(ConfigError::NonPositiveExtent { .. })));
    }

    #[test]
    fn test_run_completes_with_every_stage() {
        let orchestrator = GenerationOrchestrator::default();
        let outcome = orchestrator.run_blocking(small_request(42)).unwrap();
        let result = outcome.result().expect("run should complete");
        assert_eq!(result.heightmap.extent().cell_count(), 96 * 96);
        assert_eq!(result.biomes.extent(), result.heightmap.extent());
        assert!(result.caves.verify_connectivity().is_ok());
    }

    #[derive(Default)]
    struct CountingSink {
        regions: AtomicUsize,
        spawned: AtomicUsize,
    }

    impl TerrainSink for CountingSink {
        fn commit_region(&self, _region: &TerrainRegion) -> Result<(), SinkError> {
            self.regions.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl SpawnSink for CountingSink {
        fn spawn(&self, batch: &SpawnBatch<'_>) -> Result<(), SinkError> {
            self.spawned.fetch_add(batch.len(), Ordering::SeqCst);
            Ok(())
        }
    }

    struct RejectingSink;

    impl TerrainSink for RejectingSink {
        fn commit_region(&self, _region: &TerrainRegion) -> Result<(), SinkError> {
            Err(SinkError::Rejected("GPU busy".into()))
        }
    }

    #[test]
    fn test_sinks_receive_regions_and_batches() {
        let sink = Arc::new(CountingSink::default());
        let saves = Arc::new(MemorySaveManager::new());
        let orchestrator = GenerationOrchestrator::default()
            .with_terrain_sink(sink.clone())
            .with_spawn_sink(sink.clone())
            .with_save_manager(saves.clone());
        let outcome = orchestrator.run_blocking(small_request(7)).unwrap();
        assert!(outcome.result().is_some());
        assert_eq!(sink.regions.load(Ordering::SeqCst), 9, "96x96 in 32x32 regions");
        assert_eq!(saves.load("world").unwrap().as_ref(), outcome.result());
    }

    #[test]
    fn test_sink_error_becomes_diagnostic() {
        let orchestrator = GenerationOrchestrator::default().with_terrain_sink(Arc::new(RejectingSink));
        let outcome = orchestrator.run_blocking(small_request(7)).unwrap();
        let result = outcome.result().expect("sink errors must not discard the result");
        assert!(
            result
                .diagnostics
                .iter()
                .any(|d| matches!(d, Diagnostic::SinkRejected { sink, .. } if sink == "terrain"))
        );
    }

    #[derive(Default)]
    struct Recorder {
        updates: Mutex<Vec<ProgressUpdate>>,
        finished: AtomicUsize,
    }

    impl ProgressListener for Recorder {
        fn on_progress(&self, update: ProgressUpdate) {
            self.updates.lock().unwrap().push(update);
        }

        fn on_finished(&self, _outcome: &GenerationOutcome) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_progress_reports_every_stage() {
        let recorder = Arc::new(Recorder::default());
        let orchestrator = GenerationOrchestrator::default().with_listener(recorder.clone());
        orchestrator.run_blocking(small_request(3)).unwrap();
        let updates = recorder.updates.lock().unwrap();
        for stage in Stage::ALL {
            assert!(
                updates.iter().any(|u| u.stage == stage && u.fraction == 1.0),
                "{stage:?} never reported completion"
            );
        }
        assert!(updates.iter().all(|u| u.stage_count == 8 && (0.0..=1.0).contains(&u.fraction)));
        assert_eq!(recorder.finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_before_start_yields_cancelled() {
        let orchestrator = GenerationOrchestrator::default();
        let mut request = small_request(1);
        request.extent = crate::grid::Extent::new(512, 512);
        let handle = orchestrator.submit(request).unwrap();
        handle.cancel();
        let outcome = handle.wait();
        assert_eq!(outcome, GenerationOutcome::Cancelled);
    }

    #[test]
    fn test_wait_timeout_and_try_outcome() {
        let orchestrator = GenerationOrchestrator::default();
        let handle = orchestrator.submit(small_request(11)).unwrap();
        let outcome = handle
            .wait_timeout(Duration::from_secs(120))
            .expect("small run finishes well within the timeout");
        assert_eq!(outcome.state(), GenerationState::Completed);
        assert_eq!(handle.state(), GenerationState::Completed);
        assert_eq!(handle.try_outcome(), Some(outcome));
    }

    /// Reads the run's status from inside `on_finished`.
    #[derive(Default)]
    struct StatusAtFinish {
        shared: std::sync::OnceLock<std::sync::Weak<Shared>>,
        seen: Mutex<Option<(GenerationState, bool)>>,
    }

    impl ProgressListener for StatusAtFinish {
        fn on_finished(&self, _outcome: &GenerationOutcome) {
            if let Some(shared) = self.shared.get().and_then(std::sync::Weak::upgrade) {
                let status = shared.lock();
                *self.seen.lock().unwrap() = Some((status.state, status.outcome.is_some()));
            }
        }
    }

    #[test]
    fn test_state_is_terminal_when_listeners_hear_finish() {
        let listener = Arc::new(StatusAtFinish::default());
        let listeners = vec![listener.clone() as Arc<dyn ProgressListener>];
        let shared = Arc::new(Shared::new(listeners, CancelToken::new()));
        listener.shared.set(Arc::downgrade(&shared)).unwrap();
        shared.set_state(GenerationState::Running(Stage::Placement));

        shared.finish(GenerationOutcome::Cancelled);
        assert_eq!(
            *listener.seen.lock().unwrap(),
            Some((GenerationState::Cancelled, true)),
            "Listeners must observe the terminal state and outcome"
        );
    }
}
