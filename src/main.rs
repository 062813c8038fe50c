use std::path::Path;

use anyhow::Context;
use burn::module::Module;
use log::info;
use m2det::{
    Phase,
    config::{Commands, M2DetCmd, M2DetConfig},
    inference,
    layers::{PyramidLevel, anchor_count},
    models::m2det::M2Det,
};

#[cfg(feature = "tch")]
type InferBackend = burn::backend::LibTorch;
#[cfg(not(feature = "tch"))]
type InferBackend = burn::backend::NdArray<f32>;

#[cfg(feature = "tch")]
fn device() -> burn::backend::libtorch::LibTorchDevice {
    burn::backend::libtorch::LibTorchDevice::Cuda(0)
}

#[cfg(not(feature = "tch"))]
fn device() -> burn::backend::ndarray::NdArrayDevice {
    burn::backend::ndarray::NdArrayDevice::default()
}

fn main() -> anyhow::Result<()> {
    let cli_cmd: M2DetCmd = argh::from_env();

    env_logger::Builder::new()
        .parse_filters(&cli_cmd.log_level)
        .init();

    let device = device();

    match cli_cmd.commands {
        Commands::Summary(sub_command_summary) => {
            let phase: Phase = sub_command_summary.phase.parse()?;
            let config = M2DetConfig::from_file(&sub_command_summary.config)?;
            let size = config.resolve_size(sub_command_summary.size)?;

            let model = M2Det::<InferBackend>::new(phase, size, &config, &device)?;

            info!("{config:?}");
            println!("M2Det{size} ({phase}), {:?} backbone", config.backbone);
            println!("parameters: {}", model.num_params());
            for level in PyramidLevel::as_list() {
                let side = level.grid_size(size);
                println!(
                    "{:?}: stride {:>3}, grid {side}x{side}, anchors {}",
                    level,
                    level.stride(),
                    level.anchors(size)
                );
            }
            println!("total anchors: {}", anchor_count(size));
        }
        Commands::Init(sub_command_init) => {
            let config = M2DetConfig::from_file(&sub_command_init.config)?;
            let size = config.resolve_size(sub_command_init.size)?;

            let model = M2Det::<InferBackend>::new(Phase::Train, size, &config, &device)?.init_model();
            let path = model
                .save_weights(&sub_command_init.out)
                .with_context(|| format!("saving weights to {}", sub_command_init.out))?;

            println!("{}", path.display());
        }
        Commands::Infer(sub_command_infer) => {
            let config = M2DetConfig::from_file(&sub_command_infer.config)?;
            let size = config.resolve_size(sub_command_infer.size)?;

            let scores = inference::infer::<InferBackend>(
                Path::new(&sub_command_infer.image),
                &config,
                size,
                sub_command_infer.weights.as_deref().map(Path::new),
                sub_command_infer.top,
                &device,
            )?;

            for score in scores {
                println!(
                    "anchor {:>6} class {:>3} score {:.4} offsets {:?}",
                    score.anchor, score.class_id, score.score, score.offsets
                );
            }
        }
    };

    Ok(())
}
