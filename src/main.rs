use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use manim_video_agent::claude_client::AnthropicClient;
use manim_video_agent::elevenlabs_client::ElevenLabsSynthesizer;
use manim_video_agent::media::{FfmpegMedia, ManimRenderer};
use manim_video_agent::utils::check_ffmpeg_available;
use manim_video_agent::workflow::{RunCheckpointer, SceneSummary};
use manim_video_agent::{
    ArtifactStore, AssemblyPolicy, Collaborators, PipelineConfig, PipelineError, PipelineResult, ProblemRequest,
    RunReport, VideoGenerationPipeline,
};

/// Turn a math problem into a narrated Manim video.
#[derive(Parser, Debug)]
#[command(name = "manim-video-agent", version, about)]
struct Cli {
    /// The problem to solve and explain, e.g. "Solve x^2 - 5x + 6 = 0".
    problem: String,

    /// Where run artifacts and the cache are written.
    #[arg(long, env = "OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Ignore cached artifacts and regenerate everything.
    #[arg(long)]
    no_cache: bool,

    /// Stitch the scenes that succeeded even if some failed.
    #[arg(long)]
    allow_partial: bool,

    /// Scenes processed concurrently.
    #[arg(long)]
    max_parallel: Option<usize>,
}

#[tokio::main]
async fn main() {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if let Err(e) = init_logging() {
        eprintln!("Failed to initialise logging: {}", e);
    }

    let output_root = cli
        .output_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(manim_video_agent::config::DEFAULT_OUTPUT_DIR));

    let code = match run(cli).await {
        Ok(report) => {
            print_scenes(&report.scenes);
            print_final(&report);
            0
        }
        Err(e) => {
            error!("❌ {}", e);
            // Config errors happen before a run starts; any summary on disk is stale.
            if e.exit_code() != 2 {
                if let Ok(Some(snapshot)) = RunCheckpointer::new(ArtifactStore::new(&output_root)).load_latest().await {
                    print_scenes(&snapshot.scenes);
                }
            }
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> PipelineResult<RunReport> {
    let config = build_config(&cli)?;
    let request = ProblemRequest::new(&cli.problem, config.output_root.clone(), config.cache_enabled)?;
    let collaborators = build_collaborators(&config)?;

    if let Err(e) = check_ffmpeg_available().await {
        return Err(PipelineError::Config(format!("ffmpeg/ffprobe are required: {}", e)));
    }

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 Interrupt received, cancelling run (cached artifacts are kept)");
            token.cancel();
        }
    });

    let pipeline = VideoGenerationPipeline::new(config, collaborators);
    pipeline.run(&request, cancel).await
}

fn build_config(cli: &Cli) -> PipelineResult<PipelineConfig> {
    let mut config = PipelineConfig::from_env()?;
    if let Some(dir) = &cli.output_dir {
        config.output_root = dir.clone();
    }
    if cli.no_cache {
        config.cache_enabled = false;
    }
    if cli.allow_partial {
        config.assembly = AssemblyPolicy::AllowPartial;
    }
    if let Some(n) = cli.max_parallel {
        config.max_parallel_scenes = n;
    }
    config.validate()?;
    Ok(config)
}

fn build_collaborators(config: &PipelineConfig) -> PipelineResult<Collaborators> {
    let anthropic_key = config
        .anthropic_api_key
        .clone()
        .ok_or_else(|| PipelineError::Config("ANTHROPIC_API_KEY is not set".to_string()))?;
    let elevenlabs_key = config
        .elevenlabs_api_key
        .clone()
        .ok_or_else(|| PipelineError::Config("ELEVEN_LABS_API_KEY is not set".to_string()))?;

    let claude = Arc::new(AnthropicClient::new(anthropic_key, config.model_id.clone()));
    info!("🤖 Using model {}", config.model_id);

    Ok(Collaborators {
        solver: claude.clone(),
        splitter: claude.clone(),
        script_planner: claude.clone(),
        code_generator: claude,
        synthesizer: Arc::new(ElevenLabsSynthesizer::new(elevenlabs_key)),
        renderer: Arc::new(ManimRenderer::new(config.manim_quality.clone())),
        stitcher: Arc::new(FfmpegMedia::new()),
    })
}

fn print_scenes(scenes: &[SceneSummary]) {
    for scene in scenes {
        match (&scene.failed_stage, &scene.reason) {
            (Some(stage), Some(reason)) => {
                println!("  scene {:>2}  {:<12} at {}: {}", scene.index, scene.status, stage, reason)
            }
            _ => println!("  scene {:>2}  {:<12} {}", scene.index, scene.status, scene.description),
        }
    }
}

fn print_final(report: &RunReport) {
    if !report.final_video.skipped.is_empty() {
        println!("⚠️  Skipped scenes: {:?}", report.final_video.skipped);
    }
    println!(
        "🎉 Final video: {} ({} external calls, {} cache hits)",
        report.final_video.path.display(),
        report.metrics.total_external_calls(),
        report.metrics.total_cache_hits()
    );
}

fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    // Get log level from environment or default to INFO for release builds
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            "debug,manim_video_agent=trace,reqwest=info,hyper=info".to_string()
        } else {
            "info,manim_video_agent=info,reqwest=warn,hyper=warn".to_string()
        }
    });

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&log_level))?;

    let fmt_layer = if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(true)
            .with_line_number(true)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry().with(env_filter).with(fmt_layer).try_init()?;

    tracing::info!("🎬 Manim video agent starting up...");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
