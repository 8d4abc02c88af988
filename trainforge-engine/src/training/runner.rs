//! Training loop controller.
//!
//! A [`TrainingRunner`] owns the model and every piece of auxiliary training
//! state (optimizer, scheduler, optional scaler / EMA / early stopping,
//! counters) and drives them through
//! `INIT -> (EPOCH_START -> [STEP_START -> FORWARD -> BACKWARD -> STEP_END]* -> EPOCH_END)* -> END`.
//! Model-specific work is delegated to [`ModelHooks`], data to a
//! [`DataSource`], persistence to a [`CheckpointStore`] and logging of
//! scalars to a [`Tracker`].

use super::callbacks::{EarlyStopping, LossGuard, StopReason};
use super::checkpoint::{self, CheckpointFile, CheckpointRecord, CheckpointStore, SaveKind};
use super::config::{Cadence, FitOptions, RunOptions, RunnerConfig};
use super::counters::{Counters, crosses_boundary};
use super::ema::ModelEma;
use super::experiment::{RunLayout, TrainingStatus};
use super::metrics::TrainingMetrics;
use super::optim::Optimizer;
use super::reproducibility::{RunEnvironment, SeedManager};
use super::scaler::GradScaler;
use super::scheduler::{LrScheduler, SchedulerMode};
use crate::data::{Augment, DataSource, Loader, LoaderOptions};
use crate::error::{EngineError, Result};
use crate::eval::pipeline::{PredictOptions, Predictor};
use crate::hooks::{EMA_MODEL, MetricReport, ModelHooks, StepContext, primary_score};
use crate::model::{Model, ModelSummary};
use crate::tensor::LoadReport;
use crate::tracking::{JsonlTracker, NoopTracker, Tracker};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};
use trainforge_core::persistence;

const ITEM_OPTIMIZER: &str = "optimizer";
const ITEM_SCHEDULER: &str = "scheduler";
const ITEM_SCALER: &str = "scaler";
const ITEM_STOPPER: &str = "stopper";
const ITEM_EMA: &str = "ema";
const ITEM_COUNTERS: &str = "counters";
const ITEM_METRICS: &str = "metrics";
const ITEM_RUN_ID: &str = "run_id";
const ITEM_DATE: &str = "date";

/// Outcome of one `fit` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitSummary {
    pub status: TrainingStatus,
    pub stop_reason: Option<StopReason>,
    pub counters: Counters,
    pub best_score: Option<f64>,
    pub best_step: Option<u64>,
    /// Scores of the last metric checkpoint.
    pub last_report: Option<MetricReport>,
    pub run_id: Option<String>,
    pub elapsed_secs: f64,
}

/// Outcome of [`TrainingRunner::run`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub fit: FitSummary,
    pub weights: PathBuf,
    pub report: Option<MetricReport>,
}

/// Ephemeral per-fit state. Rebuilt on every `fit`, never persisted.
struct Session<R> {
    train: Loader<R>,
    state: SessionState<R>,
}

struct SessionState<R> {
    val: Option<Loader<R>>,
    options: FitOptions,
    /// Accumulation window in samples, 0 for every batch.
    window: u64,
    stop: Option<StopReason>,
    last_report: Option<MetricReport>,
    last_check: Instant,
    started: Instant,
}

pub struct TrainingRunner<H: ModelHooks, D> {
    hooks: H,
    data: Arc<D>,
    config: RunnerConfig,
    layout: RunLayout,
    store: CheckpointStore,
    seeds: SeedManager,
    model: H::Model,
    optimizer: Box<dyn Optimizer>,
    scheduler: LrScheduler,
    scaler: Option<GradScaler>,
    ema: Option<ModelEma>,
    stopper: Option<EarlyStopping>,
    counters: Counters,
    metrics: TrainingMetrics,
    tracker: Box<dyn Tracker>,
    run_id: Option<String>,
    stop_flag: Arc<AtomicBool>,
}

impl<H, D> TrainingRunner<H, D>
where
    H: ModelHooks,
    D: DataSource<Record = H::Record>,
{
    /// Seed, build the model and its optimizer, resolve optional components
    /// and prepare the run directory.
    pub fn new(mut hooks: H, data: D, config: RunnerConfig) -> Result<Self> {
        let layout = RunLayout::new(
            &config.model_dir,
            &config.cache_dir,
            &config.model_version,
            &config.dataset_version,
        );
        layout.create_dirs()?;

        let mut seeds = SeedManager::new(config.seed);
        let model = hooks.set_model(&mut seeds)?;
        let optimizer = hooks.set_optimizer(&model, &config.optimizer)?;
        let scheduler = LrScheduler::new(&config.scheduler, optimizer.learning_rate());

        let scaler = config.use_scaler.then(|| GradScaler::new(config.scaler.clone()));
        let ema = config
            .use_ema
            .then(|| ModelEma::new(model.params(), config.ema.clone()));
        let stopper = config
            .use_early_stop
            .then(|| EarlyStopping::new(config.early_stop.clone()));
        if scaler.is_none() {
            debug!("gradient scaler disabled");
        }
        if ema.is_none() {
            debug!("EMA disabled");
        }
        if stopper.is_none() {
            debug!("early stopping disabled");
        }

        let tracker: Box<dyn Tracker> = if config.track {
            Box::new(JsonlTracker::new())
        } else {
            Box::new(NoopTracker)
        };

        persistence::atomic_write_json(&layout.environment_file(), &RunEnvironment::capture(config.seed))?;
        info!(
            work_dir = %layout.work_dir.display(),
            optimizer = optimizer.kind(),
            "{}",
            ModelSummary::of(model.params())
        );

        Ok(Self {
            store: CheckpointStore::new(layout.work_dir.clone(), config.max_numbered),
            hooks,
            data: Arc::new(data),
            config,
            layout,
            seeds,
            model,
            optimizer,
            scheduler,
            scaler,
            ema,
            stopper,
            counters: Counters::default(),
            metrics: TrainingMetrics::default(),
            tracker,
            run_id: None,
            stop_flag: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Replace the experiment tracker.
    pub fn with_tracker(mut self, tracker: impl Tracker + 'static) -> Self {
        self.tracker = Box::new(tracker);
        self
    }

    /// Flag checked at every step and epoch boundary. Setting it ends the
    /// current fit with [`StopReason::External`]; it is cleared when a fit
    /// starts.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_flag)
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut H {
        &mut self.hooks
    }

    pub fn model(&self) -> &H::Model {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut H::Model {
        &mut self.model
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn metrics(&self) -> &TrainingMetrics {
        &self.metrics
    }

    pub fn optimizer(&self) -> &dyn Optimizer {
        self.optimizer.as_ref()
    }

    pub fn scheduler(&self) -> &LrScheduler {
        &self.scheduler
    }

    pub fn scaler(&self) -> Option<&GradScaler> {
        self.scaler.as_ref()
    }

    pub fn ema(&self) -> Option<&ModelEma> {
        self.ema.as_ref()
    }

    pub fn stopper(&self) -> Option<&EarlyStopping> {
        self.stopper.as_ref()
    }

    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    pub fn seeds_mut(&mut self) -> &mut SeedManager {
        &mut self.seeds
    }

    /// Train until `max_epoch` or a controlled stop. The tracker is finished
    /// even when the loop fails.
    pub fn fit(&mut self, options: FitOptions) -> Result<FitSummary> {
        let mut session = self.on_train_start(options)?;
        let result = self.train_loop(&mut session);
        let finished = self.on_train_end(&session.state);
        match (result, finished) {
            (Err(e), Err(finish_err)) => {
                warn!(error = %finish_err, "tracker finish failed after a training error");
                Err(e)
            }
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(())) => Ok(self.summary(&session.state)),
        }
    }

    /// Fit, save the final weights to the default location and score the
    /// result.
    pub fn run(&mut self, options: RunOptions) -> Result<RunSummary> {
        let fit = self.fit(options.fit.clone())?;
        let weights = self.layout.default_weights();
        self.save(&weights, options.save_kind)?;

        let report = if options.final_metric {
            let report = self.metric(&options.fit.predict)?;
            for (model, scores) in &report {
                info!(model = %model, scores = ?scores, "final scores");
            }
            Some(report)
        } else {
            None
        };
        Ok(RunSummary {
            fit,
            weights,
            report,
        })
    }

    /// Score the current model on the full validation set.
    pub fn metric(&mut self, options: &PredictOptions) -> Result<MetricReport> {
        self.evaluator(options.clone()).metric()
    }

    /// Evaluation and ad hoc inference over the runner's model. With EMA
    /// enabled, hooks see the shadow weights under [`EMA_MODEL`].
    pub fn predictor(&mut self) -> Predictor<'_, H, D> {
        self.evaluator(PredictOptions::default())
    }

    fn evaluator(&mut self, options: PredictOptions) -> Predictor<'_, H, D> {
        let predictor = Predictor::new(&mut self.hooks, &mut self.model, self.data.as_ref())
            .with_options(options)
            .with_epoch(self.counters.epoch);
        match &self.ema {
            Some(ema) => predictor.with_aux_state(EMA_MODEL, ema.shadow().clone()),
            None => predictor,
        }
    }

    /// Write the model to `path` in the given format. Weights checkpoints
    /// carry every auxiliary item needed to resume.
    pub fn save(&self, path: &Path, kind: SaveKind) -> Result<()> {
        let record = match kind {
            SaveKind::Weights => self.weights_record()?,
            SaveKind::Model | SaveKind::Traced => CheckpointRecord::default(),
        };
        let file = checkpoint::payload(kind, &self.model, record)?;
        checkpoint::write_checkpoint(path, &file)?;
        info!(path = %path.display(), kind = kind.as_str(), "model saved");
        Ok(())
    }

    /// Restore from `path`.
    ///
    /// Parameters are restored non-strictly: missing and unexpected keys are
    /// reported, a shape mismatch fails. For weights checkpoints, `selected`
    /// names the auxiliary items to restore; `None` restores every item
    /// present.
    pub fn load(&mut self, path: &Path, kind: SaveKind, selected: Option<&[&str]>) -> Result<LoadReport> {
        match checkpoint::read_checkpoint(path, kind)? {
            CheckpointFile::Weights(mut record) => {
                if let Some(absent) = selected.and_then(|names| names.iter().find(|n| !record.contains(n))) {
                    return Err(EngineError::invalid_config(format!("checkpoint has no item '{absent}'")));
                }
                let state = std::mem::take(&mut record.model);
                let report = self.model.params_mut().load_state_dict(state, false)?;
                if report.is_complete() {
                    debug!(path = %path.display(), keys = report.loaded.len(), "weights restored");
                } else {
                    info!(
                        path = %path.display(),
                        missing = ?report.missing,
                        unexpected = ?report.unexpected,
                        "partial weight restore"
                    );
                }
                self.restore_items(&record, selected)?;
                Ok(report)
            }
            CheckpointFile::Model(params) => {
                let report = LoadReport {
                    loaded: params.state_dict().into_keys().collect(),
                    ..LoadReport::default()
                };
                *self.model.params_mut() = params;
                self.reset_ema();
                info!(path = %path.display(), "model restored");
                Ok(report)
            }
            CheckpointFile::Traced(_) => Err(EngineError::unsupported(
                "a traced export cannot be loaded into a trainable model",
            )),
        }
    }

    /// Restore weights and all training state; the next `fit` continues from
    /// the restored epoch.
    pub fn resume(&mut self, path: &Path) -> Result<LoadReport> {
        let report = self.load(path, SaveKind::Weights, None)?;
        info!(
            path = %path.display(),
            epoch = self.counters.epoch,
            total_steps = self.counters.total_steps,
            run_id = ?self.run_id,
            "resuming"
        );
        Ok(report)
    }

    fn restore_items(&mut self, record: &CheckpointRecord, selected: Option<&[&str]>) -> Result<()> {
        let names: Vec<String> = match selected {
            Some(names) => names.iter().map(|n| n.to_string()).collect(),
            None => record.item_names().map(str::to_string).collect(),
        };

        let mut ema_restored = false;
        for name in &names {
            match name.as_str() {
                ITEM_OPTIMIZER => self.optimizer.load_state(record.require(name)?)?,
                ITEM_SCHEDULER => self.scheduler.load_state(record.require(name)?),
                ITEM_SCALER => match self.scaler.as_mut() {
                    Some(scaler) => scaler.load_state(record.require(name)?),
                    None => debug!("checkpoint carries scaler state, no scaler configured"),
                },
                ITEM_STOPPER => match self.stopper.as_mut() {
                    Some(stopper) => stopper.load_state(record.require(name)?),
                    None => debug!("checkpoint carries stopper state, early stopping disabled"),
                },
                ITEM_EMA => match self.ema.as_mut() {
                    Some(ema) => {
                        ema.load_state(record.require(name)?);
                        ema_restored = true;
                    }
                    None => debug!("checkpoint carries EMA state, EMA disabled"),
                },
                ITEM_COUNTERS => self.counters = record.require(name)?,
                ITEM_METRICS => self.metrics = record.require(name)?,
                ITEM_RUN_ID => self.run_id = Some(record.require(name)?),
                ITEM_DATE => {
                    let date: String = record.require(name)?;
                    debug!(date = %date, "checkpoint date");
                }
                other => debug!(item = other, "ignoring unknown checkpoint item"),
            }
        }

        if !ema_restored {
            self.reset_ema();
        }
        Ok(())
    }

    /// Restart the EMA shadow from the current weights.
    fn reset_ema(&mut self) {
        if let Some(ema) = self.ema.as_mut() {
            *ema = ModelEma::new(self.model.params(), self.config.ema.clone());
            debug!("EMA shadow reset to the loaded weights");
        }
    }

    fn weights_record(&self) -> Result<CheckpointRecord> {
        let mut record = CheckpointRecord::new(self.model.params().state_dict());
        record.insert_item(ITEM_OPTIMIZER, &self.optimizer.state())?;
        record.insert_item(ITEM_SCHEDULER, &self.scheduler.state())?;
        if let Some(scaler) = &self.scaler {
            record.insert_item(ITEM_SCALER, &scaler.state())?;
        }
        if let Some(stopper) = &self.stopper {
            record.insert_item(ITEM_STOPPER, &stopper.state())?;
        }
        if let Some(ema) = &self.ema {
            record.insert_item(ITEM_EMA, &ema.state())?;
        }
        record.insert_item(ITEM_COUNTERS, &self.counters)?;
        record.insert_item(ITEM_METRICS, &self.metrics.persisted())?;
        if let Some(run_id) = &self.run_id {
            record.insert_item(ITEM_RUN_ID, run_id)?;
        }
        record.insert_item(ITEM_DATE, &chrono::Utc::now().to_rfc3339())?;
        Ok(record)
    }

    fn on_train_start(&mut self, mut options: FitOptions) -> Result<Session<H::Record>> {
        self.stop_flag.store(false, Ordering::Relaxed);

        let batch_size = options
            .batch_size
            .unwrap_or(self.config.loader.batch_size)
            .max(1);
        let train_options = LoaderOptions {
            batch_size,
            ..self.config.loader.clone()
        };
        let data = Arc::clone(&self.data);
        let augment: Augment<H::Record> = Arc::new(move |r| data.train_data_augment(r));
        let train_data = self.data.get_train_data()?;
        let train_len = train_data.len() as u64;
        // a new shuffle stream per resumed epoch
        let loader_seed = self.seeds.get_seed("train_loader") ^ self.counters.epoch;
        let train = Loader::new(train_data, &train_options, augment, loader_seed);

        let val = if options.validate && options.check.metric_every.is_some() {
            let val_options = LoaderOptions {
                batch_size: options.predict.batch_size.unwrap_or(batch_size).max(1),
                shuffle: false,
                drop_last: false,
                ..self.config.loader.clone()
            };
            Some(Loader::new(self.data.get_val_data()?, &val_options, Arc::new(|r| r), 0))
        } else {
            None
        };
        if options.predict.batch_size.is_none() {
            options.predict.batch_size = Some(batch_size);
        }
        if options.predict.vis_dir.is_none() {
            options.predict.vis_dir = Some(self.layout.vis_dir());
        }

        let window = options.accumulate.unwrap_or(0);
        let horizon = match self.scheduler.mode() {
            SchedulerMode::PerEpoch => options.max_epoch,
            SchedulerMode::PerStep => {
                let batches = train.num_batches() as u64;
                let samples = train_len.min(batches * batch_size as u64);
                let steps = if window <= batch_size as u64 {
                    batches
                } else {
                    samples / window
                };
                options.max_epoch * steps.max(1)
            }
        };
        self.scheduler.init(horizon, self.optimizer.as_mut());

        let name = format!("{}/{}", self.config.model_version, self.config.dataset_version);
        let run_id = self.tracker.init(
            &self.config.project,
            &name,
            &self.layout.work_dir,
            self.run_id.as_deref(),
        )?;
        self.run_id = Some(run_id);
        self.model.set_training(true);

        info!(
            run_id = ?self.run_id,
            start_epoch = self.counters.epoch,
            max_epoch = options.max_epoch,
            batch_size,
            batches_per_epoch = train.num_batches(),
            accumulate = window,
            lr = self.optimizer.learning_rate(),
            "training started"
        );

        let now = Instant::now();
        Ok(Session {
            train,
            state: SessionState {
                val,
                options,
                window,
                stop: None,
                last_report: None,
                last_check: now,
                started: now,
            },
        })
    }

    fn train_loop(&mut self, session: &mut Session<H::Record>) -> Result<()> {
        let Session { train, state } = session;
        while self.counters.epoch < state.options.max_epoch {
            self.counters.per_epoch_samples = 0;

            let mut step_stop = false;
            for batch in train.batches() {
                if self.train_step(batch, state)? {
                    step_stop = true;
                    break;
                }
            }
            // a step-level stop skips the epoch end
            if step_stop || self.epoch_end(state)? {
                break;
            }
        }
        Ok(())
    }

    fn train_step(&mut self, batch: Vec<H::Record>, state: &mut SessionState<H::Record>) -> Result<bool> {
        if batch.is_empty() {
            return Ok(false);
        }
        let batch_len = batch.len() as u64;
        let ctx = StepContext {
            epoch: self.counters.epoch,
            total_batches: self.counters.total_batches,
            total_steps: self.counters.total_steps,
            total_samples_seen: self.counters.total_samples_seen,
        };

        self.hooks.on_train_step_start(&batch, &ctx)?;
        let output = self.hooks.on_train_step(&mut self.model, &batch, &ctx)?;
        let loss = output.loss()?;
        let loss_scale = self.scaler.as_ref().map_or(1.0, GradScaler::scale);
        self.hooks.on_backward(&mut self.model, &output, loss_scale)?;

        let seen = self.counters.total_samples_seen + batch_len;
        if crosses_boundary(seen, batch_len, state.window) {
            self.optimizer_step()?;
        }
        self.counters.record_batch(batch_len, &output.losses);
        tracing::trace!(
            epoch = ctx.epoch,
            batch = ctx.total_batches,
            step = self.counters.total_steps,
            loss,
            "train step"
        );
        self.hooks.on_train_step_end(&output, &ctx)?;

        let mut stop = false;
        if state.options.check.step_due(seen, batch_len) {
            stop = self.check(state)?;
        }
        if !stop && self.stop_flag.load(Ordering::Relaxed) {
            state.stop = Some(StopReason::External);
            stop = true;
        }
        Ok(stop)
    }

    /// Unscale, clip, step, zero, and advance the EMA and per-step scheduler.
    fn optimizer_step(&mut self) -> Result<()> {
        let params = self.model.params_mut();
        let applied = match self.scaler.as_mut() {
            Some(scaler) => {
                scaler.unscale(params);
                if let Some(max_norm) = self.config.max_grad_norm
                    && !scaler.found_inf()
                {
                    params.clip_grad_norm(max_norm);
                }
                let applied = scaler.step(self.optimizer.as_mut(), params)?;
                scaler.update();
                applied
            }
            None => {
                if let Some(max_norm) = self.config.max_grad_norm {
                    params.clip_grad_norm(max_norm);
                }
                self.optimizer.step(params)?;
                true
            }
        };
        self.optimizer.zero_grad(params);

        if applied && let Some(ema) = self.ema.as_mut() {
            ema.update(self.model.params());
        }
        self.counters.total_steps += 1;
        if self.scheduler.mode() == SchedulerMode::PerStep {
            self.scheduler.step(self.optimizer.as_mut());
        }
        Ok(())
    }

    fn epoch_end(&mut self, state: &mut SessionState<H::Record>) -> Result<bool> {
        self.counters.epoch += 1;
        if self.scheduler.mode() == SchedulerMode::PerEpoch {
            self.scheduler.step(self.optimizer.as_mut());
        }
        debug!(
            epoch = self.counters.epoch,
            samples = self.counters.per_epoch_samples,
            lr = self.optimizer.learning_rate(),
            "epoch done"
        );

        let mut stop = false;
        if state.options.check.epoch_due(self.counters.epoch) {
            stop = self.check(state)?;
        }
        if !stop && self.stop_flag.load(Ordering::Relaxed) {
            state.stop = Some(StopReason::External);
            stop = true;
        }
        Ok(stop)
    }

    /// The checkpoint-and-metric routine shared by both cadences.
    fn check(&mut self, state: &mut SessionState<H::Record>) -> Result<bool> {
        let cadence = state.options.check.cadence;
        let position = match cadence {
            Cadence::Step => self.counters.total_steps,
            Cadence::Epoch => self.counters.epoch,
        };

        let means = self.counters.mean_losses();
        let non_finite = LossGuard.check(&means);
        let elapsed = state.last_check.elapsed().as_secs_f64();
        state.last_check = Instant::now();
        match &non_finite {
            Some(reason) => warn!(
                epoch = self.counters.epoch,
                step = self.counters.total_steps,
                "{reason}, stopping"
            ),
            None => info!(
                epoch = self.counters.epoch,
                step = self.counters.total_steps,
                losses = ?means,
                lr = self.optimizer.learning_rate(),
                elapsed_secs = elapsed,
                "checkpoint"
            ),
        }

        let mut logged = means.clone();
        logged.insert("lr".to_string(), self.optimizer.learning_rate());
        self.tracker.log(self.counters.total_steps, &logged)?;
        self.metrics.record_losses(position, means);
        self.counters.reset_check();

        let file = CheckpointFile::Weights(self.weights_record()?);
        self.store.save_named("last", &file)?;
        if self.store.max_numbered() > 0 {
            self.store.save_numbered(cadence.unit(), position, &file)?;
        }

        if let Some(reason) = non_finite {
            state.stop = Some(reason);
            return Ok(true);
        }
        if !state.options.check.metric_due(self.counters.check_count) {
            return Ok(false);
        }
        let Some(val) = state.val.as_mut() else {
            return Ok(false);
        };

        let report = self.evaluator(state.options.predict.clone()).metric_on(val)?;
        self.model.set_training(true);
        let score = primary_score(&report, self.hooks.model_name())?;
        if !score.is_finite() {
            warn!(
                epoch = self.counters.epoch,
                step = self.counters.total_steps,
                score,
                "non-finite validation score"
            );
        }

        let scores: BTreeMap<String, f64> = report
            .iter()
            .flat_map(|(model, values)| {
                values
                    .iter()
                    .map(move |(key, value)| (format!("val.{model}.{key}"), *value))
            })
            .collect();
        self.tracker.log(self.counters.total_steps, &scores)?;

        let improved = self.metrics.record_score(position, score);
        let stop = self
            .stopper
            .as_mut()
            .is_some_and(|stopper| stopper.evaluate(position, score));
        info!(
            epoch = self.counters.epoch,
            step = self.counters.total_steps,
            score,
            best = ?self.metrics.best_score,
            "validation"
        );
        if improved {
            let best = CheckpointFile::Weights(self.weights_record()?);
            let path = self.store.save_named("best", &best)?;
            info!(score, path = %path.display(), "new best checkpoint");
        }
        state.last_report = Some(report);

        if stop && let Some(stopper) = &self.stopper {
            let reason = stopper.stop_reason();
            warn!("{reason}");
            state.stop = Some(reason);
        }
        Ok(stop)
    }

    fn on_train_end(&mut self, state: &SessionState<H::Record>) -> Result<()> {
        let elapsed = state.started.elapsed().as_secs_f64();
        self.metrics.total_training_time_secs += elapsed;
        info!(
            epoch = self.counters.epoch,
            total_steps = self.counters.total_steps,
            elapsed_secs = elapsed,
            stop_reason = ?state.stop,
            "training finished"
        );
        self.tracker.finish()
    }

    fn summary(&self, state: &SessionState<H::Record>) -> FitSummary {
        FitSummary {
            status: if state.stop.is_some() {
                TrainingStatus::Stopped
            } else {
                TrainingStatus::Completed
            },
            stop_reason: state.stop.clone(),
            counters: self.counters.clone(),
            best_score: self.metrics.best_score,
            best_step: self.metrics.best_step,
            last_report: state.last_report.clone(),
            run_id: self.run_id.clone(),
            elapsed_secs: state.started.elapsed().as_secs_f64(),
        }
    }
}
