//! Process entry for a detection training run.
//!
//! Parses the command-line surface, loads and validates the TOML
//! configuration, and reports the run plan. The detector, dataset, and loss
//! adapters are backend-specific; downstream crates wire them into a
//! [`Trainer`](detect_trainer_rs::Trainer) from here.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, warn};

use detect_trainer_rs::checkpoint::CheckpointStore;
use detect_trainer_rs::config::{RunOptions, TrainerConfig};
use detect_trainer_rs::error::TrainResult;
use detect_trainer_rs::schedule;

fn main() -> ExitCode {
    detect_trainer_rs::init_logging();
    let options = RunOptions::parse();

    match run(&options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(options: &RunOptions) -> TrainResult<()> {
    info!(
        config = %options.config.display(),
        device = %options.device,
        rect = options.rect,
        no_autoanchor = options.no_autoanchor,
        evolve = options.evolve,
        multi_scale = options.multi_scale,
        adam = options.adam,
        "starting"
    );

    let config = TrainerConfig::from_file(&options.config)?;
    let train = &config.train;
    info!(
        total_epochs = train.total_epochs,
        batch_size = train.batch_size,
        base_lr = train.base_lr,
        input_size = config.io.input_size,
        num_classes = config.io.num_classes,
        anchor_scales = config.io.anchors.num_scales(),
        accumulate = config.nominal_accumulation(),
        final_lr = schedule::learning_rate(train.total_epochs, train.total_epochs, train.base_lr),
        "run plan"
    );

    if options.resume {
        let store = CheckpointStore::new(&config.io.save_path)?;
        match store.latest_epoch()? {
            Some(epoch) => info!(epoch, "will resume from checkpoint"),
            None => warn!(
                path = %config.io.save_path.display(),
                "nothing to resume from, starting fresh"
            ),
        }
    }

    info!("configuration valid; wire detector, dataset, and loss adapters to train");
    Ok(())
}
