use imaging::{
    BitmapSource, CacheOption, CreateOptions, Decoder, DownloadState, FrameSource, ImageEngine,
    Imaging, ImagingError,
};
use imaging_config::{ConfigError, EngineConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use thiserror::Error;

const USAGE: &str = "usage: imaging-inspect [--config <file>] [--json] [--on-load] <path-or-uri>...";

#[derive(Debug, Error)]
enum InspectError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{source_name}: {error}")]
    Imaging {
        source_name: String,
        error: ImagingError,
    },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    json: bool,
    cache_option: CacheOption,
    sources: Vec<String>,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args, InspectError> {
    let mut parsed = Args::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args
                    .next()
                    .ok_or_else(|| InspectError::Usage("--config needs a file".into()))?;
                parsed.config = Some(PathBuf::from(path));
            }
            "--json" => parsed.json = true,
            "--on-load" => parsed.cache_option = CacheOption::OnLoad,
            "-h" | "--help" => return Err(InspectError::Usage(USAGE.into())),
            flag if flag.starts_with("--") => {
                return Err(InspectError::Usage(format!("unknown flag {flag}\n{USAGE}")));
            }
            _ => parsed.sources.push(arg),
        }
    }
    if parsed.sources.is_empty() {
        return Err(InspectError::Usage(USAGE.into()));
    }
    Ok(parsed)
}

fn to_source(arg: &str) -> BitmapSource {
    if arg.contains("://") {
        BitmapSource::from(arg)
    } else {
        BitmapSource::from(PathBuf::from(arg))
    }
}

fn describe_frame(frame: &FrameSource) -> Result<String, ImagingError> {
    Ok(format!(
        "{}x{} {:?} @ {:.0}x{:.0} dpi",
        frame.pixel_width()?,
        frame.pixel_height()?,
        frame.format()?,
        frame.dpi_x()?,
        frame.dpi_y()?,
    ))
}

fn inspect(imaging: &Imaging, args: &Args, name: &str) -> Result<(), InspectError> {
    let wrap = |error: ImagingError| InspectError::Imaging {
        source_name: name.to_string(),
        error,
    };

    let decoder = Decoder::create_in(imaging, to_source(name), CreateOptions::NONE, args.cache_option)
        .map_err(wrap)?;

    if decoder.is_late_bound() {
        tracing::info!("Waiting for {} to download", decoder.identity());
        if let DownloadState::Failed(message) = decoder.wait_for_download().map_err(wrap)? {
            return Err(wrap(ImagingError::Network(message)));
        }
    }

    let frames = decoder.frames().map_err(wrap)?;
    println!("{}", decoder.identity());
    if let Some(info) = decoder.codec_info() {
        println!("  codec:  {} ({:?})", info.friendly_name, info.format);
    }
    println!("  frames: {}", frames.len());
    for (index, frame) in frames.iter().enumerate() {
        println!("  [{index}] {}", describe_frame(frame).map_err(wrap)?);
        if let Some(failure) = frame.decode_failure() {
            println!("      decode failed: {failure}");
        }
    }

    let metadata = decoder.metadata().map_err(wrap)?;
    let frame_metadata = match frames.first() {
        Some(frame) => frame.metadata().map_err(wrap)?,
        None => None,
    };
    for metadata in [metadata, frame_metadata].into_iter().flatten() {
        if args.json {
            println!("{}", serde_json::to_string_pretty(&metadata)?);
        } else {
            for (key, value) in &metadata.entries {
                println!("  {key} = {value}");
            }
        }
    }

    let again = Decoder::create_in(imaging, to_source(name), CreateOptions::NONE, args.cache_option)
        .map_err(wrap)?;
    tracing::debug!(
        "Second open of {} {}",
        decoder.identity(),
        if again.ptr_eq(&decoder) { "hit the decoder cache" } else { "missed the decoder cache" }
    );
    Ok(())
}

fn run() -> Result<(), InspectError> {
    let args = parse_args(std::env::args().skip(1))?;

    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let (errors, updated) = config.apply_env(std::env::vars());
    for error in errors {
        tracing::warn!("Ignoring environment override: {}", error);
    }
    if !updated.is_empty() {
        tracing::debug!("Environment overrides applied: {:?}", updated);
    }
    config.validate()?;

    let imaging = Imaging::builder(ImageEngine::from_config(&config))
        .config(config)
        .build();

    let mut failed = None;
    for name in &args.sources {
        if let Err(e) = inspect(&imaging, &args, name) {
            tracing::error!("{}", e);
            failed = Some(e);
        }
    }
    failed.map_or(Ok(()), Err)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(InspectError::Usage(message)) => {
            eprintln!("{message}");
            ExitCode::from(2)
        }
        Err(_) => ExitCode::FAILURE,
    }
}
