use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{ensure, Context, Result};
use clap::Parser;
use indicatif::{ParallelProgressIterator, ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use rayon::{prelude::*, ThreadPoolBuilder};
use tracing::{info, warn, Level};
use walkdir::WalkDir;

use skin_season::{
    get_relative_path, governor::ProcessMemoryProbe, is_supported_image_format, save_mask,
    Analysis, ClassifierModel, Config, LazyClassifier, OnnxFaceParser, PaletteAnalyzer,
    ResourceGovernor, SegmentationBackend,
};

fn main() -> Result<()> {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_max_level(if config.debug {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .with_writer(std::io::stderr)
        .init();

    ensure!(config.input_dir.is_dir(), "Input directory does not exist");
    ensure!(config.model_path.is_file(), "Model path does not exist");
    config.compress_policy().validate()?;

    ThreadPoolBuilder::new()
        .num_threads(config.num_threads)
        .build_global()?;

    let classifier = Arc::new(LazyClassifier::from_checkpoint(
        &config.model_path,
        config.device_id,
    ));

    match &config.parser_model {
        Some(parser_path) => {
            ensure!(
                !config.parser_labels.is_empty(),
                "--parser-labels is required with --parser-model"
            );
            let parser = OnnxFaceParser::new(
                parser_path,
                config.device_id,
                config.parser_labels.clone(),
            )?;
            run(PaletteAnalyzer::new(parser, classifier), &config)
        }
        None => run(PaletteAnalyzer::lightweight(classifier), &config),
    }
}

fn run<B, M>(analyzer: PaletteAnalyzer<B, M>, config: &Config) -> Result<()>
where
    B: SegmentationBackend,
    M: ClassifierModel,
{
    let analyzer = analyzer
        .with_governor(ResourceGovernor::new(
            Box::new(ProcessMemoryProbe),
            config.memory_ceiling_mb,
        ))
        .with_compress_policy(config.compress_policy())
        .with_extraction(config.extraction());

    let image_paths = WalkDir::new(&config.input_dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file() && is_supported_image_format(e.path()))
        .map(|e| e.into_path())
        .collect::<Vec<_>>();

    if image_paths.is_empty() {
        warn!(input_dir = %config.input_dir.display(), "no images found");
        return Ok(());
    }

    let progress_bar = ProgressBar::new(image_paths.len() as u64);
    progress_bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec} {eta})",
        )?
        .progress_chars("#>-"),
    );

    let failures = Mutex::new(Vec::new());
    image_paths
        .par_iter()
        .progress_with(progress_bar.clone())
        .for_each(|path| {
            if let Err(err) = process_image(&analyzer, path, config, &progress_bar) {
                progress_bar.suspend(|| warn!(path = %path.display(), error = %err, "skipped"));
                failures.lock().push(path.clone());
            }
        });

    progress_bar.finish();

    let failures = failures.into_inner();
    info!(
        processed = image_paths.len() - failures.len(),
        failed = failures.len(),
        peak_mb = analyzer.governor().peak_mb(),
        "done"
    );
    ensure!(
        failures.len() < image_paths.len(),
        "every image failed; is the classifier checkpoint valid?"
    );
    Ok(())
}

fn process_image<B, M>(
    analyzer: &PaletteAnalyzer<B, M>,
    path: &Path,
    config: &Config,
    progress_bar: &ProgressBar,
) -> Result<()>
where
    B: SegmentationBackend,
    M: ClassifierModel,
{
    let Analysis {
        season,
        pixels,
        mask,
    } = analyzer
        .analyze(path)
        .with_context(|| format!("Failed to analyze image: {}", path.display()))?;

    let color = pixels
        .mean()
        .map(|[r, g, b]| format!("#{r:02x}{g:02x}{b:02x}"))
        .unwrap_or_else(|| "-".to_string());
    let origin = if pixels.is_fallback() { " (lower region)" } else { "" };
    progress_bar.println(format!(
        "{}\t{season}\t{color}{origin}",
        path.display()
    ));

    if let Some(output_dir) = &config.output_dir {
        let output_path = construct_output_path(path, &config.input_dir, output_dir, &config.format)?;
        save_mask(&mask, &output_path)?;
    }
    Ok(())
}

fn construct_output_path(
    path: &Path,
    input_dir: &Path,
    output_dir: &Path,
    format: &str,
) -> Result<PathBuf> {
    let output_path = output_dir.join(get_relative_path(input_dir, path)?);
    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(output_path.with_extension(format))
}
