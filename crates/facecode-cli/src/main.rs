use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use facecode_core::{compare_codes, ExtractionResult, Extractor, PipelineConfig};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "facecode", version, about = "Face feature extraction CLI")]
struct Cli {
    /// Pipeline configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory holding the model files (overrides the config file)
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract a feature code from one image
    Extract {
        #[command(flatten)]
        source: Source,
        /// Where to write the JSON result
        #[arg(long)]
        output: PathBuf,
    },
    /// Compare two feature codes
    Compare {
        /// First base64 feature code
        code_a: String,
        /// Second base64 feature code
        code_b: String,
    },
    /// Extract feature codes from several images
    Batch {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Where to write the JSON array of results
        #[arg(long)]
        output: PathBuf,
    },
    /// Show build and pipeline information
    Info,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct Source {
    /// Image file path
    #[arg(long)]
    input: Option<PathBuf>,
    /// Base64-encoded image data
    #[arg(long)]
    base64: Option<String>,
}

#[derive(Serialize)]
struct BatchEntry<'a> {
    index: usize,
    path: &'a Path,
    #[serde(flatten)]
    result: ExtractionResult,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("ERROR: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config = load_config(cli.config.as_deref(), cli.model_dir)?;

    match cli.command {
        Commands::Extract { source, output } => {
            let extractor = load_extractor(&config)?;
            let result = match (source.input, source.base64) {
                (Some(path), _) => extractor.extract_file(&path),
                (None, Some(data)) => extractor.extract_base64(&data),
                (None, None) => anyhow::bail!("one of --input or --base64 is required"),
            };
            tracing::debug!(
                success = result.success,
                quality = result.quality,
                process_time_ms = result.process_time_ms,
                message = %result.message,
                "extraction finished"
            );
            write_json(&output, &result)?;
            Ok(report(&result))
        }
        Commands::Compare { code_a, code_b } => {
            let comparison = compare_codes(&code_a, &code_b).context("invalid feature code")?;
            println!("{}", serde_json::to_string_pretty(&comparison)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Batch { paths, output } => {
            let extractor = load_extractor(&config)?;
            let entries = extract_batch(&extractor, &paths);
            write_json(&output, &entries)?;

            let failed = entries.iter().filter(|e| !e.result.success).count();
            tracing::debug!(total = entries.len(), failed, "batch finished");
            if failed == 0 {
                println!("SUCCESS: {} images processed", entries.len());
                Ok(ExitCode::SUCCESS)
            } else {
                eprintln!("ERROR: {failed} of {} images failed", entries.len());
                Ok(ExitCode::FAILURE)
            }
        }
        Commands::Info => {
            println!("facecode {}", env!("CARGO_PKG_VERSION"));
            println!("platform:   {}-{}", std::env::consts::OS, std::env::consts::ARCH);
            println!("encoder:    {:?} ({}-d)", config.encoder.kind, config.encoder.dimension);
            println!("strategies: {:?}", config.detector.strategies);
            println!("model dir:  {}", config.model_dir.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(path: Option<&Path>, model_dir: Option<PathBuf>) -> Result<PipelineConfig> {
    let mut config = match path {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(dir) = model_dir {
        config.model_dir = dir;
    }
    Ok(config)
}

fn load_extractor(config: &PipelineConfig) -> Result<Extractor> {
    tracing::debug!(
        model_dir = %config.model_dir.display(),
        strategies = ?config.detector.strategies,
        encoder = ?config.encoder.kind,
        "loading models"
    );
    let extractor = Extractor::load(config).context("failed to load models")?;
    tracing::debug!(
        encoder = extractor.encoder_name(),
        strategies = ?extractor.strategy_names(),
        dimension = extractor.dimension(),
        "models loaded"
    );
    Ok(extractor)
}

/// Print the one-line status and map the result to an exit code.
fn report(result: &ExtractionResult) -> ExitCode {
    if result.success {
        println!("SUCCESS: feature extraction complete, quality: {:.3}", result.quality);
        ExitCode::SUCCESS
    } else {
        eprintln!("ERROR: {}", result.message);
        ExitCode::FAILURE
    }
}

/// Read every file, then extract the readable ones in one parallel batch.
fn extract_batch<'a>(extractor: &Extractor, paths: &'a [PathBuf]) -> Vec<BatchEntry<'a>> {
    let reads: Vec<Result<Vec<u8>, String>> = paths
        .iter()
        .map(|p| std::fs::read(p).map_err(|e| format!("failed to read input file {}: {e}", p.display())))
        .collect();
    let readable: Vec<&[u8]> = reads.iter().filter_map(|r| r.as_deref().ok()).collect();
    let mut extracted = extractor.extract_batch(&readable).into_iter();

    paths
        .iter()
        .zip(reads.iter())
        .enumerate()
        .map(|(index, (path, read))| {
            let result = match read {
                Ok(_) => extracted
                    .next()
                    .unwrap_or_else(|| ExtractionResult::failed("missing batch result", Duration::ZERO)),
                Err(message) => ExtractionResult::failed(message.clone(), Duration::ZERO),
            };
            BatchEntry { index, path, result }
        })
        .collect()
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json).with_context(|| format!("failed to write output file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use facecode_core::detector::DetectorCascade;
    use facecode_core::encoder::HogEncoder;
    use facecode_core::quality::QualityScorer;
    use facecode_core::Normalizer;

    fn faceless_extractor() -> Extractor {
        Extractor::new(
            Normalizer::default(),
            DetectorCascade::new(Vec::new()),
            Box::new(HogEncoder::new(128)),
            QualityScorer::default(),
            128,
        )
    }

    #[test]
    fn test_extract_requires_exactly_one_source() {
        assert!(Cli::try_parse_from(["facecode", "extract", "--output", "r.json"]).is_err());
        assert!(Cli::try_parse_from([
            "facecode", "extract", "--input", "a.jpg", "--base64", "AAAA", "--output", "r.json"
        ])
        .is_err());
        assert!(Cli::try_parse_from(["facecode", "extract", "--input", "a.jpg"]).is_err());

        let cli = Cli::try_parse_from(["facecode", "extract", "--base64", "AAAA", "--output", "r.json"]).unwrap();
        match cli.command {
            Commands::Extract { source, output } => {
                assert_eq!(source.base64.as_deref(), Some("AAAA"));
                assert!(source.input.is_none());
                assert_eq!(output, PathBuf::from("r.json"));
            }
            _ => panic!("expected extract"),
        }
    }

    #[test]
    fn test_global_options() {
        let cli = Cli::try_parse_from(["facecode", "info", "--model-dir", "/opt/models"]).unwrap();
        assert_eq!(cli.model_dir, Some(PathBuf::from("/opt/models")));
        assert!(matches!(cli.command, Commands::Info));
    }

    #[test]
    fn test_batch_needs_paths() {
        assert!(Cli::try_parse_from(["facecode", "batch", "--output", "out.json"]).is_err());
        let cli = Cli::try_parse_from(["facecode", "batch", "a.jpg", "b.jpg", "--output", "out.json"]).unwrap();
        assert!(matches!(cli.command, Commands::Batch { ref paths, .. } if paths.len() == 2));
    }

    #[test]
    fn test_load_config_overrides_model_dir() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "model_dir = \"/from/file\"\n[encoder]\nkind = \"hog\"\n").unwrap();

        let config = load_config(Some(file.path()), None).unwrap();
        assert_eq!(config.model_dir, PathBuf::from("/from/file"));

        let config = load_config(Some(file.path()), Some("/from/flag".into())).unwrap();
        assert_eq!(config.model_dir, PathBuf::from("/from/flag"));
    }

    #[test]
    fn test_load_extractor_reports_missing_model() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::default();
        config.model_dir = dir.path().to_path_buf();
        config.detector.strategies = vec![facecode_core::config::StrategyKind::Haar];
        config.encoder.kind = facecode_core::config::EncoderKind::Hog;

        let err = load_extractor(&config).err().unwrap();
        let message = format!("{err:#}");
        assert!(message.starts_with("failed to load models"), "{message}");
        assert!(message.contains("haarcascade_frontalface_default.xml"), "{message}");
    }

    #[test]
    fn test_batch_keeps_order_and_reports_read_errors() {
        let dir = tempfile::tempdir().unwrap();
        let garbage = dir.path().join("garbage.jpg");
        std::fs::write(&garbage, b"not an image").unwrap();
        let paths = vec![dir.path().join("missing.jpg"), garbage];

        let entries = extract_batch(&faceless_extractor(), &paths);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].index, 0);
        assert!(entries[0].result.message.starts_with("failed to read input file"));
        assert_eq!(entries[1].index, 1);
        assert!(entries[1].result.message.starts_with("image decode failed"));
    }

    #[test]
    fn test_write_json_result() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("result.json");
        let result = faceless_extractor().extract(b"garbage");
        write_json(&out, &result).unwrap();

        let written: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(written["success"], false);
        assert_eq!(written["feature_code"], "");
        assert!(written.get("process_time").is_some());
    }
}
