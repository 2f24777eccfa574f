//! Netscape cookie-file import into the shared cookie jar.
//!
//! One file per domain lives under `<config>/Cookies/*.txt` in the classic
//! `# HTTP Cookie File` format: tab-separated
//! `domain  include_subdomains  path  secure  expires  name  value`.

use std::path::Path;
use std::sync::Arc;

use reqwest::cookie::Jar;
use tracing::{info, warn};
use url::Url;

/// Header line written at the top of a Netscape cookie file.
pub const NETSCAPE_HEADER: &str = "# HTTP Cookie File";

/// One parsed cookie line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieLine {
    pub domain: String,
    pub include_subdomains: bool,
    pub path: String,
    pub secure: bool,
    pub expires: i64,
    pub name: String,
    pub value: String,
}

impl CookieLine {
    /// Parses one tab-separated line; `None` for comments/blank/short lines.
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 7 {
            return None;
        }
        Some(Self {
            domain: fields[0].to_string(),
            include_subdomains: fields[1].eq_ignore_ascii_case("TRUE"),
            path: fields[2].to_string(),
            secure: fields[3].eq_ignore_ascii_case("TRUE"),
            expires: fields[4].parse().unwrap_or(0),
            name: fields[5].to_string(),
            value: fields[6].to_string(),
        })
    }

    /// The domain without the leading-dot subdomain marker.
    #[must_use]
    pub fn simplified_domain(&self) -> &str {
        self.domain.strip_prefix('.').unwrap_or(&self.domain)
    }

    /// Renders the line back into Netscape format.
    #[must_use]
    pub fn to_netscape(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            self.domain,
            if self.include_subdomains { "TRUE" } else { "FALSE" },
            self.path,
            if self.secure { "TRUE" } else { "FALSE" },
            self.expires,
            self.name,
            self.value,
        )
    }
}

/// Installs one cookie into the jar under `https://<domain>`.
pub fn install_cookie(jar: &Jar, domain: &str, name: &str, value: &str) {
    let simplified = domain.strip_prefix('.').unwrap_or(domain);
    let Ok(url) = Url::parse(&format!("https://{simplified}")) else {
        warn!(domain, "skipping cookie with unparsable domain");
        return;
    };
    let header = format!("{name}={value}; Domain={simplified}; Path=/");
    jar.add_cookie_str(&header, &url);
}

/// Loads every `*.txt` cookie file under `cookies_dir` into the shared jar.
///
/// Files are processed in sorted order; when two files carry cookies for the
/// same domain, the later file wins and a warning is logged. Returns the
/// number of cookies installed.
pub fn load_cookie_files(jar: &Arc<Jar>, cookies_dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(cookies_dir) else {
        return 0;
    };
    let mut files: Vec<_> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "txt"))
        .collect();
    files.sort();

    let mut installed = 0;
    let mut domains_seen: Vec<String> = Vec::new();
    for file in files {
        let raw = match std::fs::read_to_string(&file) {
            Ok(raw) => raw,
            Err(error) => {
                warn!(file = %file.display(), %error, "unable to load cookies from file");
                continue;
            }
        };
        let file_name = file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut file_domains: Vec<String> = Vec::new();
        for line in raw.lines() {
            let Some(cookie) = CookieLine::parse(line) else {
                continue;
            };
            let simplified = cookie.simplified_domain().to_string();
            if !file_domains.contains(&simplified) {
                info!(domain = %simplified, file = %file_name, "found cookies in file");
                if domains_seen.contains(&simplified) {
                    warn!(
                        domain = %simplified,
                        "previous cookies for domain detected, they will be overwritten"
                    );
                }
                file_domains.push(simplified.clone());
            }
            if !domains_seen.contains(&simplified) {
                domains_seen.push(simplified);
            }
            install_cookie(jar, &cookie.domain, &cookie.name, &cookie.value);
            installed += 1;
        }
    }
    installed
}
