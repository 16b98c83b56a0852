use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use pixcache_engine::{CacheRegistry, RegistryConfig, TracingSink};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;
use tracing_subscriber::fmt::writer::MakeWriterExt;

mod cli;
mod error;

use cli::{CliArgs, Commands};
use error::AppError;

fn main() {
    if let Err(e) = bootstrap() {
        eprintln!("Error: {e}");
        error!(error = ?e, "Application failed");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn bootstrap() -> Result<(), AppError> {
    let args = CliArgs::parse();

    init_logging(args.verbose, args.log_file.as_ref())?;

    let mut builder = RegistryConfig::builder().with_global_concurrency(args.concurrency);
    if let Some(dir) = &args.data_dir {
        builder = builder.with_persistent_root(dir);
    }
    if let Some(dir) = &args.cache_dir {
        builder = builder.with_temporary_root(dir);
    }
    let config = builder.build();
    info!(
        data_dir = %config.persistent_root.display(),
        cache_dir = %config.temporary_root.display(),
        concurrency = config.global_concurrency,
        "Using cache roots"
    );

    let registry = CacheRegistry::new(config)?;

    match args.command {
        Commands::Fetch {
            url,
            bucket,
            private,
            user,
            key,
            headers,
            output,
        } => {
            registry
                .initialize(user, Some(Arc::new(TracingSink)))
                .await;
            let headers = parse_headers(&headers)?;

            let object = registry
                .get(bucket, &url, key.as_deref(), private, Some(&headers))
                .await?;

            info!(
                bucket = %bucket,
                key = %object.metadata.key,
                source = ?object.source,
                size = object.bytes.len(),
                extension = %object.metadata.file_extension,
                valid_till = %object.metadata.valid_till,
                "Image ready"
            );

            if let Some(path) = output {
                tokio::fs::write(&path, &object.bytes).await?;
                info!(path = %path.display(), "Wrote image");
            }
        }
        Commands::Clear {
            bucket,
            user_caches,
        } => {
            registry.initialize(None, None).await;
            match bucket {
                Some(bucket) => {
                    registry.clear(bucket).await?;
                    info!(bucket = %bucket, "Bucket cleared");
                }
                None if user_caches => registry.clear_user_caches().await?,
                None => {
                    registry.clear_all().await?;
                    info!("All buckets cleared");
                }
            }
        }
    }

    Ok(())
}

fn init_logging(verbose: bool, log_file: Option<&PathBuf>) -> Result<(), AppError> {
    let log_level = if verbose { Level::DEBUG } else { Level::INFO };

    let result = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            let subscriber = FmtSubscriber::builder()
                .with_max_level(log_level)
                .with_writer(MakeWriterExt::and(std::io::stderr, file))
                .with_ansi(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
        }
        None => {
            let subscriber = FmtSubscriber::builder()
                .with_max_level(log_level)
                .with_writer(std::io::stderr)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
        }
    };
    result.map_err(|e| AppError::Initialization(e.to_string()))
}

/// Parse `Name: value` pairs into a header map.
fn parse_headers(raw: &[String]) -> Result<HeaderMap, AppError> {
    let mut headers = HeaderMap::new();
    for header in raw {
        let (name, value) = header
            .split_once(':')
            .ok_or_else(|| AppError::InvalidInput(format!("Header '{header}' is not 'Name: value'")))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|e| AppError::InvalidInput(format!("Invalid header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|e| AppError::InvalidInput(format!("Invalid header value for '{name}': {e}")))?;
        headers.append(name, value);
    }
    Ok(headers)
}
