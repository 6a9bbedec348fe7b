mod cli;

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use mimalloc::MiMalloc;
use tracing::{Level, error, info};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};
use url::Url;

use crate::cli::{Args, Command, OutputFormat};
use reel_engine::{
    DownloadConfig, DownloadError, HlsDownloader, QualityVariant, ReassemblyConfig,
};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

const EXIT_FAILURE: u8 = 1;
const EXIT_CANCELLED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    match run(args.command).await {
        Ok(code) => code,
        Err(err) => {
            if let Some(class) = err.classify() {
                error!("{class}");
            } else {
                error!("{err}");
            }
            if err.is_cancelled() {
                ExitCode::from(EXIT_CANCELLED)
            } else {
                ExitCode::from(EXIT_FAILURE)
            }
        }
    }
}

async fn run(command: Command) -> Result<ExitCode, DownloadError> {
    match command {
        Command::List { url, format } => list(&url, format).await,
        Command::Get {
            url,
            quality,
            output,
            dir,
            concurrency,
            frame_seconds,
        } => {
            get(
                &url,
                quality.as_deref(),
                output.as_deref(),
                dir,
                concurrency,
                frame_seconds,
            )
            .await
        }
    }
}

async fn list(url: &str, format: OutputFormat) -> Result<ExitCode, DownloadError> {
    let downloader = HlsDownloader::new(DownloadConfig::default())?;
    let variants = downloader.discover_qualities(url).await?;

    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&variants)
                    .map_err(|e| DownloadError::configuration(e.to_string()))?
            );
        }
        OutputFormat::Text => {
            println!("{:<4} {:<10} {:>12} {:<12} URL", "#", "QUALITY", "BITRATE", "RESOLUTION");
            for (index, variant) in variants.iter().enumerate() {
                let resolution = match (variant.width, variant.height) {
                    (Some(w), Some(h)) => format!("{w}x{h}"),
                    _ => "-".to_owned(),
                };
                println!(
                    "{index:<4} {:<10} {:>12} {resolution:<12} {}",
                    variant.label, variant.bandwidth, variant.url
                );
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn get(
    url: &str,
    quality: Option<&str>,
    output: Option<&str>,
    dir: std::path::PathBuf,
    concurrency: Option<usize>,
    frame_seconds: Option<u64>,
) -> Result<ExitCode, DownloadError> {
    let mut config = DownloadConfig::default();
    if let Some(concurrency) = concurrency {
        config = config.with_concurrency(concurrency);
    }
    if let Some(seconds) = frame_seconds {
        config = config.with_reassembly(
            ReassemblyConfig::default().with_frame_duration(Duration::from_secs(seconds.max(1))),
        );
    }

    let downloader = HlsDownloader::new(config)?;
    let variants = downloader.discover_qualities(url).await?;
    let variant = select_variant(&variants, quality)?;
    info!(
        quality = %variant.label,
        bandwidth = variant.bandwidth,
        "selected variant"
    );

    let name = match output {
        Some(name) => name.to_owned(),
        None => default_output_name(url),
    };

    let handle = downloader.start_download(variant.clone(), &name, &dir, None);
    let mut progress = handle.progress();

    let bar = ProgressBar::new(1000);
    bar.set_style(
        ProgressStyle::with_template(
            "{bar:40.cyan/blue} {percent:>3}% {msg}",
        )
        .expect("valid progress template"),
    );

    let mut cancel_requested = false;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c(), if !cancel_requested => {
                if signal.is_ok() {
                    cancel_requested = true;
                    bar.set_message("cancelling...");
                    handle.cancel();
                }
            }
            changed = progress.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = progress.borrow().clone();
                bar.set_position((snapshot.fraction * 1000.0) as u64);
                bar.set_message(format!(
                    "{}/{} segments · {}",
                    snapshot.completed_segments,
                    snapshot.total_segments,
                    HumanBytes(snapshot.bytes_transferred)
                ));
                if snapshot.state.is_terminal() {
                    break;
                }
            }
        }
    }

    match handle.wait().await {
        Ok(path) => {
            bar.finish_with_message("done");
            let size = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
            info!(
                path = %path.display(),
                size = %HumanBytes(size),
                mime_type = "video/mp4",
                "download complete"
            );
            println!("{}", path.display());
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            bar.abandon_with_message(if err.is_cancelled() {
                "cancelled".to_owned()
            } else {
                "failed".to_owned()
            });
            Err(err)
        }
    }
}

/// Resolves `--quality` against the discovered variants: a zero-based
/// index or a case-insensitive label; the first (best) variant when
/// unspecified.
fn select_variant<'a>(
    variants: &'a [QualityVariant],
    quality: Option<&str>,
) -> Result<&'a QualityVariant, DownloadError> {
    let Some(quality) = quality else {
        return variants
            .first()
            .ok_or_else(|| DownloadError::configuration("no quality variants available"));
    };

    if let Ok(index) = quality.parse::<usize>() {
        return variants.get(index).ok_or_else(|| {
            DownloadError::configuration(format!(
                "quality index {index} out of range (0..{})",
                variants.len()
            ))
        });
    }

    variants
        .iter()
        .find(|v| v.label.eq_ignore_ascii_case(quality))
        .ok_or_else(|| {
            let labels: Vec<&str> = variants.iter().map(|v| v.label.as_str()).collect();
            DownloadError::configuration(format!(
                "no variant labelled `{quality}`; available: {}",
                labels.join(", ")
            ))
        })
}

/// Derives a default output name from the manifest URL's file name.
fn default_output_name(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|segments| segments.last().map(str::to_owned))
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "download".to_owned())
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_level(verbose))
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn variants() -> Vec<QualityVariant> {
        vec![
            QualityVariant::new(
                5_000_000,
                Some((1920, 1080)),
                Url::parse("https://h/hd.m3u8").unwrap(),
            ),
            QualityVariant::new(
                800_000,
                Some((640, 360)),
                Url::parse("https://h/sd.m3u8").unwrap(),
            ),
        ]
    }

    #[test]
    fn default_selection_takes_the_best_variant() {
        let variants = variants();
        let selected = select_variant(&variants, None).unwrap();
        assert_eq!(selected.label, "1080p");
    }

    #[rstest]
    #[case("1080p", "1080p")]
    #[case("360P", "360p")]
    #[case("1", "360p")]
    fn selection_by_label_or_index(#[case] quality: &str, #[case] expected: &str) {
        let variants = variants();
        let selected = select_variant(&variants, Some(quality)).unwrap();
        assert_eq!(selected.label, expected);
    }

    #[test]
    fn unknown_quality_lists_the_available_labels() {
        let variants = variants();
        let err = select_variant(&variants, Some("4k")).unwrap_err();
        assert!(err.to_string().contains("1080p, 360p"));
    }

    #[rstest]
    #[case("https://h/x/y/master.m3u8", "master.m3u8")]
    #[case("https://h/stream.m3u8?token=abc", "stream.m3u8")]
    #[case("not a url", "download")]
    fn output_name_defaults_to_the_manifest_file_name(
        #[case] url: &str,
        #[case] expected: &str,
    ) {
        assert_eq!(default_output_name(url), expected);
    }
}
