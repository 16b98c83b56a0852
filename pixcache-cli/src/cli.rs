use clap::{Parser, Subcommand};
use pixcache_engine::Bucket;
use std::path::PathBuf;

/// Define CLI arguments
#[derive(Parser, Debug)]
#[command(
    name = "pixcache",
    author = "hua0512 <https://github.com/hua0512>",
    version,
    about = "Resilient image fetcher and bucket cache",
    long_about = "Fetches images through the pixcache engine: per-host circuit breaking,\n\
                  retries with backoff, captive portal detection and per-bucket storage\n\
                  policies. Useful for inspecting cache behavior by hand."
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Commands,

    /// Root for long-lived buckets (avatar, icon)
    #[arg(long, global = true, help = "Directory for long-lived buckets")]
    pub data_dir: Option<PathBuf>,

    /// Root for evictable buckets
    #[arg(long, global = true, help = "Directory for evictable buckets")]
    pub cache_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true, help = "Enable detailed debug logging")]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Maximum in-flight fetches across all buckets
    #[arg(long, global = true, default_value = "6")]
    pub concurrency: usize,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fetch an image into a bucket
    Fetch {
        /// Image URL
        url: String,

        /// Bucket the image belongs to
        #[arg(short, long, value_enum, default_value = "thumbnail")]
        bucket: Bucket,

        /// Scope the cache entry to the current user
        #[arg(long)]
        private: bool,

        /// User the session belongs to
        #[arg(short, long)]
        user: Option<String>,

        /// Explicit cache key, overrides URL based keys
        #[arg(short, long)]
        key: Option<String>,

        /// Extra request header, "Name: value"
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Write the image bytes to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Clear cached images
    Clear {
        /// Only clear this bucket
        #[arg(short, long, value_enum, conflicts_with = "user_caches")]
        bucket: Option<Bucket>,

        /// Only clear buckets holding user content
        #[arg(long)]
        user_caches: bool,
    },
}
