//! Train a neuron captioner from scratch.

#[cfg(feature = "accelerate")]
extern crate accelerate_src;
#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

use candle_core::{DType, Device, IndexOp, Module};
use captioner::models::{EncoderKind, FitOptions};
use captioner::hf::HfWeights;
use captioner::zoo::{self, CAPTIONS, DATASET_KEYS, IMAGES};
use captioner::Kwargs;
use clap::{Parser, ValueEnum};
use env_logger::Env;
use log::{debug, info};
use std::path::PathBuf;
use std::time::Instant;

#[derive(Debug, ValueEnum, Clone, Copy)]
enum Encoder {
    Resnet18,
    Resnet50,
}

impl From<Encoder> for EncoderKind {
    fn from(encoder: Encoder) -> Self {
        match encoder {
            Encoder::Resnet18 => Self::Resnet18,
            Encoder::Resnet50 => Self::Resnet50,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "train a captioner", long_about = None)]
struct Cli {
    #[arg(long, help = "save model to this file (default: ./<generated name>)")]
    out_file: Option<PathBuf>,

    #[arg(
        long,
        num_args = 1..,
        default_values_t = DATASET_KEYS.map(String::from),
        help = "datasets to train on (default: all)"
    )]
    datasets: Vec<String>,

    #[arg(
        long,
        default_value = "./data",
        help = "directory holding one <network>-<images>.safetensors file per dataset"
    )]
    data_dir: PathBuf,

    #[arg(long, value_enum, default_value_t = Encoder::Resnet50, help = "image encoder")]
    encoder: Encoder,

    #[arg(long, help = "pretrained encoder weights (default: random initialization)")]
    encoder_weights: Option<PathBuf>,

    #[arg(
        long,
        conflicts_with = "encoder_weights",
        help = "HuggingFace repo to fetch pretrained encoder weights from"
    )]
    encoder_repo: Option<String>,

    #[arg(
        long,
        default_value = "model.safetensors",
        help = "weights file in the encoder repo"
    )]
    encoder_file: String,

    #[arg(long, help = "do not train lm (default: train lm)")]
    no_lm: bool,

    #[arg(long, help = "precompute image features (default: do not)")]
    precompute_features: bool,

    #[arg(
        long,
        default_value_t = 0.1,
        help = "hold out and validate on this fraction of training data"
    )]
    hold_out: f64,

    #[arg(long, default_value_t = 10, help = "training epochs for the lm and the decoder")]
    epochs: usize,

    #[arg(long, default_value_t = 64, help = "training batch size")]
    batch_size: usize,

    #[arg(long, help = "use cuda device (default: cpu)")]
    cuda: bool,

    #[arg(long, help = "whether to enable verbose mode")]
    verbose: bool,
}

impl Cli {
    fn out_file(&self) -> PathBuf {
        self.out_file.clone().unwrap_or_else(|| {
            let encoder = EncoderKind::from(self.encoder).name();
            let lm = if self.no_lm { "" } else { "+lm" };
            PathBuf::from(format!("cap+{encoder}{lm}.safetensors"))
        })
    }
}

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    let env = Env::new().filter_or("CAPTIONER_LOG", if args.verbose { "debug" } else { "info" });
    env_logger::init_from_env(env);

    anyhow::ensure!(
        (0.0..1.0).contains(&args.hold_out),
        "hold-out must be in [0.0, 1.0)"
    );
    anyhow::ensure!(args.batch_size > 0, "batch-size must be > 0");

    let device = if args.cuda {
        Device::new_cuda(0)?
    } else {
        Device::Cpu
    };
    debug!("using device {:?}", device);

    let dataset = zoo::datasets(&args.data_dir, &args.datasets)?;
    info!("training on {} samples", dataset.len());
    let images = dataset.tensor(IMAGES)?.to_dtype(DType::F32)?;
    let captions = dataset.tensor(CAPTIONS)?;
    let vocab_size = captions.flatten_all()?.max(0)?.to_scalar::<u32>()? as usize + 1;

    let encoder_config = zoo::encoder_config(args.encoder.into()).with_device(device.clone());
    let encoder = match (&args.encoder_weights, &args.encoder_repo) {
        (Some(path), _) => {
            let (encoder, layers) = encoder_config.load(path, &Kwargs::new())?;
            info!("restored encoder layers {:?} from {:?}", layers, path);
            encoder
        }
        (None, Some(repo)) => {
            let weights = HfWeights::new(repo.as_str(), args.encoder_file.as_str());
            let (encoder, layers) = encoder_config.load_hf(&weights, &Kwargs::new())?;
            info!("restored encoder layers {:?} from {}", layers, repo);
            encoder
        }
        (None, None) => encoder_config.build(&Kwargs::new())?,
    };
    debug!("encoder stages {:?}", encoder.layer_names());

    let options = FitOptions {
        epochs: args.epochs,
        batch_size: args.batch_size,
        hold_out: args.hold_out,
        device: device.clone(),
        ..Default::default()
    };

    let features = if args.precompute_features {
        let now = Instant::now();
        let features = encoder.map(&images.to_device(&device)?, args.batch_size)?;
        info!("precomputing features took {:.3}s", now.elapsed().as_secs_f32());
        Some(features)
    } else {
        None
    };

    let captioner = zoo::captioner_config().with_device(device.clone()).build(
        &Kwargs::new()
            .with("feature_size", encoder.feature_size())
            .with("vocab_size", vocab_size)
            .with("lm", !args.no_lm),
    )?;

    if !args.no_lm {
        let now = Instant::now();
        captioner.fit_lm(&captions, &options)?;
        info!("lm training took {:.3}s", now.elapsed().as_secs_f32());
    }

    let now = Instant::now();
    match &features {
        Some(features) => captioner.fit_decoder(features, &captions, None, &options)?,
        None => captioner.fit_decoder(&images, &captions, Some(&encoder), &options)?,
    };
    info!("decoder training took {:.3}s", now.elapsed().as_secs_f32());

    if !dataset.is_empty() {
        let sample = match &features {
            Some(features) => features.i(0..1)?,
            None => encoder.forward(&images.i(0..1)?.to_device(&device)?)?,
        };
        let words = captioner.decoder().predict_words(&sample, 0.5)?;
        info!("predicted words of the first sample: {:?}", words.first());
    }

    let out_file = args.out_file();
    captioner.save(&out_file)?;
    info!("captioner saved to {:?}", out_file);
    Ok(())
}
