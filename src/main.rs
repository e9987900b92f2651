use bytes::Bytes;
use clap::{command, Parser, Subcommand};
use facegate::model::clip::ClipExtractor;
use facegate::model::pipeline::{FacePipeline, FullFrameDetector, NoDetector};
use facegate::service::RecognitionService;
use facegate::source::DirectorySource;
use facegate::{Config, EmployeeId, FaceEmbedder};
use indicatif::{ProgressBar, ProgressDrawTarget};
use pretty_duration::pretty_duration;
use std::io::Write;
use std::io::{stdout, BufWriter};
use std::path::PathBuf;
use std::sync::Arc;
use ticky::Stopwatch;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about, long_about = None, arg_required_else_help(true))]
struct Cli {
    #[arg(long, global = true, help = "A JSON configuration file.")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Override the similarity threshold.")]
    threshold: Option<f64>,
    #[arg(
        long,
        global = true,
        help = "Run the model on the CPU even if an accelerator is available."
    )]
    cpu: bool,
    #[arg(
        long,
        global = true,
        help = "Treat photos as already cropped to one face; otherwise they are refused."
    )]
    pre_cropped: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(
        about = "Enrol reference photos of an employee.",
        arg_required_else_help(true)
    )]
    Enroll {
        employee_id: EmployeeId,
        photos: Vec<PathBuf>,
    },
    #[command(
        about = "Decide whether the face in a photo is granted access.",
        arg_required_else_help(true)
    )]
    Recognize {
        photo: PathBuf,
        #[arg(long, help = "Print the decision as JSON.")]
        json: bool,
    },
    #[command(about = "Rebuild the index from the employee photo directories.")]
    Rebuild {
        #[arg(long, help = "Override the employee photo directory.")]
        photos_dir: Option<PathBuf>,
    },
    #[command(about = "Describe the index.")]
    Info,
}

fn open_service(config: Config, cli: &Cli) -> anyhow::Result<RecognitionService> {
    let extractor = ClipExtractor::new(cli.cpu)?;
    let embedder: Arc<dyn FaceEmbedder> = if cli.pre_cropped {
        Arc::new(FacePipeline::new(FullFrameDetector, extractor, &config)?)
    } else {
        warn!("no face detector available; every photo will be refused (see --pre-cropped)");
        Arc::new(FacePipeline::new(NoDetector, extractor, &config)?)
    };
    Ok(RecognitionService::open(config, embedder)?)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let mut cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(threshold) = cli.threshold {
        config.similarity_threshold = threshold;
        config.validate()?;
    }
    let mut sw = Stopwatch::start_new();
    match cli.command.take() {
        Some(Commands::Enroll {
            employee_id,
            photos,
        }) => {
            let service = open_service(config, &cli)?;
            let num_photos = photos.len();
            let progress_bar = ProgressBar::with_draw_target(
                Some(num_photos.try_into()?),
                ProgressDrawTarget::hidden(),
            )
            .with_message(format!("Enrolling {} photo(s).", num_photos));
            let mut enrolled = 0;
            // Enrol photos in uploads of at most `max_photos_per_upload`.
            for batch in photos.chunks(service.config().max_photos_per_upload.max(1)) {
                let mut images = Vec::new();
                for path in batch {
                    images.push(Bytes::from(std::fs::read(path)?));
                }
                let report = service.enroll_batch(employee_id, &images)?;
                for (position, reason) in &report.skipped {
                    progress_bar.println(format!(
                        "Skipped {}: {}.",
                        batch[*position].display(),
                        reason
                    ));
                }
                enrolled += report.enrolled.len();
                progress_bar.inc(batch.len() as u64);
                if progress_bar.is_hidden() {
                    progress_bar.set_draw_target(ProgressDrawTarget::stderr_with_hz(100));
                }
            }
            sw.stop();
            progress_bar.println(format!(
                "Enrolled {} of {} photo(s) of employee {} in {}.",
                enrolled,
                num_photos,
                employee_id,
                pretty_duration(&sw.elapsed(), None)
            ));
        }
        Some(Commands::Recognize { photo, json }) => {
            let service = open_service(config, &cli)?;
            let image = Bytes::from(std::fs::read(&photo)?);
            let decision = service.recognize(image);
            sw.stop();
            let mut buffer = BufWriter::new(stdout().lock());
            if json {
                writeln!(buffer, "{}", serde_json::to_string_pretty(&decision)?)?;
            } else {
                writeln!(
                    buffer,
                    "Access {} ({}) in {}.",
                    decision.outcome,
                    decision.reason,
                    pretty_duration(&sw.elapsed(), None)
                )?;
                if let Some(employee_id) = decision.employee_id {
                    writeln!(buffer, "Employee:\t{}", employee_id)?;
                }
                if let Some(score) = decision.score {
                    writeln!(buffer, "Score:\t\t{:.4}", score)?;
                }
            }
        }
        Some(Commands::Rebuild { photos_dir }) => {
            let source = DirectorySource::new(photos_dir.unwrap_or(config.photos_dir.clone()));
            let service = open_service(config, &cli)?;
            let mut buffer = BufWriter::new(stdout().lock());
            writeln!(buffer, "Rebuilding index from {}.", source.root().display())?;
            let report = service.rebuild(&source)?;
            sw.stop();
            for skipped in &report.skipped {
                let path = skipped
                    .path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| format!("employee {}", skipped.employee_id));
                writeln!(buffer, "Skipped {}: {}.", path, skipped.reason)?;
            }
            writeln!(
                buffer,
                "{} of {} photo(s) from {} employee(s) indexed in {}.",
                report.embedded,
                report.photos,
                report.employees,
                pretty_duration(&sw.elapsed(), None)
            )?;
        }
        Some(Commands::Info) => {
            let store = facegate::store::IndexStore::new(
                config.index_path.clone(),
                config.mapping_path.clone(),
            );
            let index = store.load(config.dimension);
            let mut buffer = BufWriter::new(stdout().lock());
            writeln!(buffer, "Vectors:\t{}", index.len())?;
            writeln!(buffer, "Employees:\t{}", index.employee_count())?;
            writeln!(buffer, "Dimensions:\t{}", index.dimension())?;
            writeln!(buffer, "Threshold:\t{}", config.similarity_threshold)?;
            writeln!(buffer, "Vector file:\t{}", store.vectors_path().display())?;
            writeln!(buffer, "Mapping file:\t{}", store.mapping_path().display())?;
        }
        _ => unreachable!(),
    }
    Ok(())
}
