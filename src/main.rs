//! Formscan command-line entry point.
//!
//! `extract` runs one two-page document and prints the result as JSON.
//! `calibrate` applies accumulated query-answer evidence to a template.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use formscan_lib::config;
use formscan_lib::pipeline::calibration::CalibrationEvidence;
use formscan_lib::pipeline::extraction::ExtractionMode;
use formscan_lib::pipeline::processor::FormProcessor;
use formscan_lib::pipeline::validation::CanonicalLists;
use formscan_lib::pipeline::vision::{HttpVisionClient, MockVisionService, VisionService};
use formscan_lib::pipeline_config::ExtractionConfig;
use formscan_lib::template::TemplateRegistry;

#[derive(Parser, Debug)]
#[command(name = "formscan")]
#[command(version, about = "Field extraction for two-sided scanned forms")]
struct Cli {
    /// Extraction config JSON (defaults to the app data directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Template file; defaults to `<data dir>/templates/<template>.json`.
    #[arg(long, global = true)]
    template_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract all fields from a front and back page image.
    Extract {
        /// Form template identifier.
        #[arg(long)]
        template: String,

        #[arg(long)]
        front: PathBuf,

        #[arg(long)]
        back: PathBuf,

        /// query-only, region-only or hybrid.
        #[arg(long, default_value = "hybrid")]
        mode: ExtractionMode,

        /// Vision service base URL. Without one, only mark detection runs.
        #[arg(long, env = "FORMSCAN_VISION_URL")]
        vision_url: Option<String>,

        #[arg(long, env = "FORMSCAN_VISION_API_KEY", hide_env_values = true)]
        api_key: Option<String>,

        /// Vision request timeout in seconds.
        #[arg(long, default_value = "60")]
        timeout: u64,

        /// Canonical place/facility lists JSON.
        #[arg(long)]
        lists: Option<PathBuf>,

        /// Pretty-print the JSON output.
        #[arg(long)]
        pretty: bool,
    },

    /// Apply calibration evidence to a template and report drift.
    Calibrate {
        /// Form template identifier.
        #[arg(long)]
        template: String,

        /// JSON array of calibration evidence.
        #[arg(long)]
        evidence: PathBuf,

        /// Write a markdown drift report here.
        #[arg(long)]
        report: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    formscan_lib::init_tracing();

    let config_path = cli.config.clone().unwrap_or_else(config::extraction_config_path);
    let extraction_config =
        ExtractionConfig::load(Some(config_path.as_path())).context("Failed to load extraction config")?;

    match cli.command {
        Command::Extract {
            template,
            front,
            back,
            mode,
            vision_url,
            api_key,
            timeout,
            lists,
            pretty,
        } => {
            let registry = open_registry(&template, cli.template_file.as_deref(), &extraction_config)?;
            let vision = build_vision(vision_url.as_deref(), api_key, timeout)?;
            let lists = match lists {
                Some(path) => CanonicalLists::load(&path)
                    .with_context(|| format!("Failed to load lists from {}", path.display()))?,
                None => CanonicalLists::default(),
            };

            let front_bytes =
                std::fs::read(&front).with_context(|| format!("Failed to read {}", front.display()))?;
            let back_bytes =
                std::fs::read(&back).with_context(|| format!("Failed to read {}", back.display()))?;

            let processor = FormProcessor::new(registry, vision, extraction_config, lists);
            let result = processor.extract(&front_bytes, &back_bytes, &template, mode)?;

            // Calibrations batched below the auto-save threshold would be
            // lost when the process exits.
            if processor.registry().unsaved_calibrations()? > 0 {
                processor.registry().persist(true)?;
            }

            let json = if pretty {
                serde_json::to_string_pretty(&result)?
            } else {
                serde_json::to_string(&result)?
            };
            println!("{json}");
        }

        Command::Calibrate {
            template,
            evidence,
            report,
        } => {
            let registry = open_registry(&template, cli.template_file.as_deref(), &extraction_config)?;
            let raw = std::fs::read_to_string(&evidence)
                .with_context(|| format!("Failed to read {}", evidence.display()))?;
            let evidence: Vec<CalibrationEvidence> =
                serde_json::from_str(&raw).context("Malformed evidence JSON")?;

            let processor = FormProcessor::new(
                registry,
                Arc::new(MockVisionService::empty()),
                extraction_config,
                CanonicalLists::default(),
            );
            let (calibration, updated) = processor.calibrate(&evidence)?;
            if processor.registry().unsaved_calibrations()? > 0 {
                processor.registry().persist(true)?;
            }

            if let Some(path) = report {
                std::fs::write(&path, calibration.to_markdown())
                    .with_context(|| format!("Failed to write report to {}", path.display()))?;
                tracing::info!(path = %path.display(), "Calibration report written");
            }

            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "updated": updated,
                    "report": calibration,
                }))?
            );
        }
    }

    Ok(())
}

fn open_registry(
    template_id: &str,
    template_file: Option<&Path>,
    extraction_config: &ExtractionConfig,
) -> anyhow::Result<Arc<TemplateRegistry>> {
    let path = template_file
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config::template_path(template_id));
    let registry = TemplateRegistry::load(&path, extraction_config.persistence.clone())
        .with_context(|| format!("Failed to load template {}", path.display()))?;
    Ok(Arc::new(registry))
}

fn build_vision(
    url: Option<&str>,
    api_key: Option<String>,
    timeout: u64,
) -> anyhow::Result<Arc<dyn VisionService>> {
    match url {
        Some(url) => {
            let mut client = HttpVisionClient::new(url, timeout)?;
            if let Some(key) = api_key {
                client = client.with_api_key(key);
            }
            Ok(Arc::new(client))
        }
        None => {
            tracing::warn!("No vision service configured; text fields will need review");
            Ok(Arc::new(MockVisionService::empty()))
        }
    }
}
