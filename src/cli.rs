//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

use cyberdrop_dl::HashingMode;

/// Bulk media downloader.
///
/// Downloads the files behind the given URLs with per-domain rate limiting,
/// resume support, and content-hash deduplication.
#[derive(Parser, Debug)]
#[command(name = "cyberdrop-dl")]
#[command(author, version, about)]
pub struct Args {
    /// URLs to download (album pages, profiles, or direct file links)
    pub urls: Vec<String>,

    /// Path to a JSON config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Root folder for downloaded files
    #[arg(long)]
    pub download_folder: Option<PathBuf>,

    /// Skip URLs whose host matches any of these domains
    #[arg(long, value_delimiter = ',')]
    pub skip_hosts: Vec<String>,

    /// Only process URLs whose host matches one of these domains
    #[arg(long, value_delimiter = ',')]
    pub only_hosts: Vec<String>,

    /// Disable interactive output (log lines only)
    #[arg(long)]
    pub no_ui: bool,

    /// Hashing mode: off, in_place, or post_run
    #[arg(long, value_parser = parse_hashing_mode)]
    pub hash: Option<HashingMode>,

    /// Re-download URLs already marked complete in history
    #[arg(long)]
    pub ignore_history: bool,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}

fn parse_hashing_mode(raw: &str) -> Result<HashingMode, String> {
    raw.parse()
}

impl Args {
    /// Whether a URL's host passes the skip/only host filters.
    #[must_use]
    pub fn host_allowed(&self, host: &str) -> bool {
        if self
            .skip_hosts
            .iter()
            .any(|skipped| host.contains(skipped.as_str()))
        {
            return false;
        }
        if self.only_hosts.is_empty() {
            return true;
        }
        self.only_hosts
            .iter()
            .any(|allowed| host.contains(allowed.as_str()))
    }
}
