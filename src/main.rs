use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use clap::Parser;
use tracing::{info, warn};

use plant_disease_api::engine::validate_threshold;
use plant_disease_api::service::{BatchReport, fetch_image};
use plant_disease_api::{
    Args, Command, DetectorConfig, DiagnoseOptions, DiagnosisResult, DiagnosisService, InferenceEngine, OnnxDetector,
    Recommendations, ServiceConfig, logging, resolve_cache_dir, router,
};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level)?;
    validate_threshold(args.conf)?;

    info!("plant-disease-api v{}", env!("CARGO_PKG_VERSION"));
    let cache_dir = resolve_cache_dir(args.cache_dir.as_deref());
    let recommendations = Recommendations::load(args.recommendations.as_deref());

    let mut config = ServiceConfig {
        cache_dir: cache_dir.clone(),
        model_path: args.model.clone(),
        default_conf: args.conf,
        fetch_timeout: Duration::from_secs(args.fetch_timeout),
        ..ServiceConfig::default()
    };
    if let Command::Serve { max_upload_bytes, .. } = &args.command {
        config.max_upload_bytes = *max_upload_bytes;
    }
    let service = Arc::new(DiagnosisService::new(recommendations, config));

    let detector_config = DetectorConfig {
        model_path: args.model.clone(),
        class_names_path: args.class_names.clone(),
        device: args.device,
        imgsz: args.imgsz,
        iou_threshold: args.iou,
    };
    let detector = tokio::task::spawn_blocking(move || OnnxDetector::load(&detector_config, &cache_dir))
        .await
        .context("model loading task failed")?
        .context("failed to start diagnosis service")?;
    service.install_engine(InferenceEngine::new(Arc::new(detector)))?;

    match args.command {
        Command::Serve { host, port, .. } => serve(service, &host, port).await,
        Command::Predict { images, output } => {
            tokio::task::spawn_blocking(move || predict(&service, &images, output.as_deref()))
                .await
                .context("prediction task failed")?
        }
    }
}

async fn serve(service: Arc<DiagnosisService>, host: &str, port: u16) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", host, port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("listening on http://{}", addr);

    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

fn predict(service: &DiagnosisService, sources: &[String], output: Option<&Path>) -> Result<()> {
    if let Some(dir) = output {
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let mut inputs = Vec::with_capacity(sources.len());
    let mut unreadable = 0;
    for source in sources {
        match read_source(source, service.config()) {
            Ok(bytes) => inputs.push((Some(source.clone()), bytes)),
            Err(e) => {
                println!("{}: {:#}", source, e);
                unreadable += 1;
            }
        }
    }

    let options = DiagnoseOptions {
        conf_threshold: None,
        visualize: output.is_some(),
    };
    let report = service.diagnose_batch(inputs, options)?;

    for item in &report.items {
        let source = item.label.as_deref().unwrap_or("<unnamed>");
        match &item.outcome {
            Ok(result) => {
                print_result(source, result);
                if let (Some(dir), Some(encoded)) = (output, &result.visualization) {
                    let path = visualization_path(dir, item.index, source);
                    match save_png(encoded, &path) {
                        Ok(()) => println!("  visualization: {}", path.display()),
                        Err(e) => warn!(path = %path.display(), error = %e, "could not save visualization"),
                    }
                }
            }
            Err(e) => println!("{}: {}", source, e),
        }
    }
    print_summary(&report, unreadable);
    Ok(())
}

fn read_source(source: &str, config: &ServiceConfig) -> Result<Vec<u8>> {
    if source.starts_with("http://") || source.starts_with("https://") {
        Ok(fetch_image(source, config.max_upload_bytes, config.fetch_timeout)?)
    } else {
        fs::read(source).with_context(|| format!("failed to read {}", source))
    }
}

fn print_result(source: &str, result: &DiagnosisResult) {
    let Some(name) = &result.disease_name else {
        println!("{}: no disease detected", source);
        return;
    };
    let status = if result.is_healthy { "healthy" } else { "diseased" };
    println!("{}: {} ({:.2}%, {})", source, name, result.confidence, status);

    if let Some(recs) = &result.recommendations {
        for (title, lines) in [
            ("treatments", &recs.treatments),
            ("fertilizers", &recs.fertilizers),
            ("prevention", &recs.prevention),
        ] {
            if lines.is_empty() {
                continue;
            }
            println!("  {}:", title);
            for line in lines {
                println!("    - {}", line);
            }
        }
    }
}

fn print_summary(report: &BatchReport, unreadable: usize) {
    println!();
    println!("images:       {}", report.items.len() + unreadable);
    println!("detected:     {}", report.detected);
    println!("no detection: {}", report.no_detection);
    println!("failed:       {}", report.failed + unreadable);
}

fn visualization_path(dir: &Path, index: usize, source: &str) -> PathBuf {
    let stem = Path::new(source)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("image");
    dir.join(format!("{:03}_{}.png", index, stem))
}

fn save_png(encoded: &str, path: &Path) -> Result<()> {
    let bytes = STANDARD.decode(encoded).context("visualization is not valid base64")?;
    fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
}
