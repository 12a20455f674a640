mod config;
mod engine;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use engine::EngineHandle;
use facelens_core::{
    Attribute, DetectorBackend, DistanceMetric, EmbeddingModel, FacePipeline, GalleryEntry, Image, ModelRegistry,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "facelens", version, about = "Face detection, verification and attribute analysis")]
struct Cli {
    /// Directory containing model weight files [env: FACELENS_MODEL_DIR]
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,
    /// Detector backend: cascade, ssd, mtcnn, yunet, scrfd or skip
    #[arg(long, global = true)]
    detector: Option<DetectorBackend>,
    /// Embedding model, e.g. VGG-Face, Facenet, ArcFace
    #[arg(long, global = true)]
    model: Option<EmbeddingModel>,
    /// Distance metric: cosine, euclidean or euclidean_l2
    #[arg(long, global = true)]
    metric: Option<DistanceMetric>,
    /// Fail when no face is found instead of using the whole image
    #[arg(long, global = true)]
    enforce_detection: Option<bool>,
    /// Rotate faces upright using eye landmarks
    #[arg(long, global = true)]
    align: Option<bool>,
    /// Engine worker threads
    #[arg(long, global = true)]
    workers: Option<usize>,
    /// TOML file replacing the built-in verification thresholds
    #[arg(long, global = true)]
    thresholds: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Locate faces in an image
    Detect { image: PathBuf },
    /// Decide whether two images show the same person
    Verify { img1: PathBuf, img2: PathBuf },
    /// Predict age, gender, emotion and race for every face
    Analyze {
        image: PathBuf,
        /// Comma-separated attributes; all when omitted
        #[arg(long, value_delimiter = ',')]
        actions: Vec<Attribute>,
    },
    /// Print the embedding of every face
    Represent { image: PathBuf },
    /// Match faces in an image against a directory of reference images
    Find { image: PathBuf, gallery: PathBuf },
    /// Verify every pair listed in a file, one "img1 img2" pair per line
    BatchVerify { pairs: PathBuf },
    /// Print the verification threshold table in use
    Thresholds,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(dir) = &self.model_dir {
            config.model_dir = dir.clone();
        }
        if let Some(detector) = self.detector {
            config.detector = detector;
        }
        if let Some(model) = self.model {
            config.model = model;
        }
        if let Some(metric) = self.metric {
            config.metric = metric;
        }
        if let Some(enforce) = self.enforce_detection {
            config.enforce_detection = enforce;
        }
        if let Some(align) = self.align {
            config.align = align;
        }
        if let Some(workers) = self.workers {
            config.workers = workers.max(1);
        }
        if let Some(path) = &self.thresholds {
            config.thresholds = Some(path.clone());
        }
    }
}

#[derive(Serialize)]
struct PairOutcome {
    img1: PathBuf,
    img2: PathBuf,
    #[serde(flatten)]
    outcome: Outcome,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Outcome {
    Verified(facelens_core::VerificationResult),
    Failed { error: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    cli.apply(&mut config);
    tracing::debug!(?config, "configuration loaded");

    let registry = Arc::new(ModelRegistry::with_model_dir(config.registry_config()));
    let pipeline = Arc::new(FacePipeline::new(registry).with_thresholds(config.threshold_table()?));
    let engine = engine::spawn_engine(Arc::clone(&pipeline), config.workers)?;

    match cli.command {
        Commands::Detect { image } => {
            let image = load_image(&image)?;
            let backend = config.detector;
            let faces = tokio::task::spawn_blocking(move || pipeline.detect(&image, backend)).await??;
            print_json(&faces)?;
        }
        Commands::Verify { img1, img2 } => {
            let (a, b) = (load_image(&img1)?, load_image(&img2)?);
            let result = engine.verify(a, b, config.verify_options()).await?;
            print_json(&result)?;
        }
        Commands::Analyze { image, actions } => {
            let image = load_image(&image)?;
            let results = engine.analyze(image, actions, config.detect_options()).await?;
            print_json(&results)?;
        }
        Commands::Represent { image } => {
            let image = load_image(&image)?;
            let reps = engine.represent(image, config.model, config.detect_options()).await?;
            print_json(&reps)?;
        }
        Commands::Find { image, gallery } => {
            let entries = build_gallery(&engine, &config, &gallery).await?;
            tracing::info!(entries = entries.len(), "gallery embedded");
            let probe = load_image(&image)?;
            let options = config.verify_options();
            let matches = tokio::task::spawn_blocking(move || pipeline.find(&probe, &entries, &options)).await??;
            print_json(&matches)?;
        }
        Commands::BatchVerify { pairs } => {
            let outcomes = batch_verify(&engine, &config, &pairs).await?;
            print_json(&outcomes)?;
        }
        Commands::Thresholds => {
            print_json(pipeline.thresholds())?;
        }
    }

    Ok(())
}

fn load_image(path: &Path) -> Result<Image> {
    let decoded = image::open(path).with_context(|| format!("opening {}", path.display()))?;
    Ok(Image::from(decoded))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Embed the first face of every image in `dir`, labelled by file stem.
async fn build_gallery(engine: &EngineHandle, config: &Config, dir: &Path) -> Result<Vec<GalleryEntry>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("reading gallery {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| is_image(p))
        .collect();
    paths.sort();

    let mut set = tokio::task::JoinSet::new();
    for path in paths {
        let engine = engine.clone();
        let (model, options) = (config.model, config.detect_options());
        set.spawn(async move {
            let reps = match load_image(&path) {
                Ok(image) => engine.represent(image, model, options).await.map_err(anyhow::Error::from),
                Err(e) => Err(e),
            };
            (path, reps)
        });
    }

    let mut entries = Vec::new();
    while let Some(joined) = set.join_next().await {
        let (path, reps) = joined?;
        let label = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        match reps {
            Ok(reps) => entries.extend(reps.into_iter().take(1).map(|rep| GalleryEntry {
                label: label.clone(),
                embedding: rep.embedding,
            })),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping gallery image"),
        }
    }
    entries.sort_by(|a, b| a.label.cmp(&b.label));
    Ok(entries)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| matches!(e.to_ascii_lowercase().as_str(), "jpg" | "jpeg" | "png" | "bmp" | "webp"))
        .unwrap_or(false)
}

/// Parse a pairs file: two whitespace- or comma-separated paths per line, `#` comments.
fn parse_pairs(src: &str, base: &Path) -> Result<Vec<(PathBuf, PathBuf)>> {
    src.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty() && !line.trim_start().starts_with('#'))
        .map(|(n, line)| {
            let fields: Vec<&str> = line
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|f| !f.is_empty())
                .collect();
            match fields.as_slice() {
                [a, b] => Ok((base.join(a), base.join(b))),
                _ => anyhow::bail!("line {}: expected two image paths", n + 1),
            }
        })
        .collect()
}

async fn batch_verify(engine: &EngineHandle, config: &Config, pairs_file: &Path) -> Result<Vec<PairOutcome>> {
    let src = std::fs::read_to_string(pairs_file).with_context(|| format!("reading {}", pairs_file.display()))?;
    let base = pairs_file.parent().unwrap_or_else(|| Path::new("."));
    let pairs = parse_pairs(&src, base)?;

    let mut set = tokio::task::JoinSet::new();
    for (index, (img1, img2)) in pairs.into_iter().enumerate() {
        let engine = engine.clone();
        let options = config.verify_options();
        set.spawn(async move {
            let result = match (load_image(&img1), load_image(&img2)) {
                (Ok(a), Ok(b)) => engine.verify(a, b, options).await.map_err(anyhow::Error::from),
                (Err(e), _) | (_, Err(e)) => Err(e),
            };
            let outcome = match result {
                Ok(r) => Outcome::Verified(r),
                Err(e) => Outcome::Failed {
                    error: format!("{e:#}"),
                },
            };
            (index, PairOutcome { img1, img2, outcome })
        });
    }

    let mut outcomes = Vec::new();
    while let Some(joined) = set.join_next().await {
        outcomes.push(joined?);
    }
    outcomes.sort_by_key(|(index, _)| *index);
    Ok(outcomes.into_iter().map(|(_, o)| o).collect())
}
