//! Train the linear-regression mock end to end and print the run summary.
//!
//! ```sh
//! TRAINFORGE_OPTIMIZER__LR=0.05 cargo run -p trainforge-engine --example linear_regression
//! ```

use std::path::Path;
use trainforge_core::{LoggingConfig, init_tracing};
use trainforge_engine::mock::{MockHooks, VecSource};
use trainforge_engine::training::{FitOptions, RunOptions, RunnerConfig, TrainingRunner};

const DIM: usize = 4;

fn main() -> anyhow::Result<()> {
    let config = RunnerConfig::load(Some(Path::new(".")))?;
    let _guard = init_tracing(&LoggingConfig {
        log_dir: Some(config.model_dir.join("logs")),
        ..LoggingConfig::default()
    })?;

    let source = VecSource::linear(512, DIM, config.seed);
    let mut runner = TrainingRunner::new(MockHooks::new(DIM), source, config)?;
    let summary = runner.run(RunOptions {
        fit: FitOptions {
            max_epoch: 20,
            batch_size: Some(32),
            ..FitOptions::default()
        },
        ..RunOptions::default()
    })?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
