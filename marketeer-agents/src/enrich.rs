//! Website enrichment for brand onboarding.
//!
//! Best-effort by contract: fetch the homepage with a strict timeout and
//! extract a bounded set of signals — title, meta description, the first
//! logo-candidate image, up to ten distinct colors, up to eight deduped
//! font families. Any failure degrades to empty enrichment; onboarding
//! never fails because a website was slow or strange.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;

/// Fetch timeout for the homepage.
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
/// Extraction bounds; the extractor is deliberately conservative.
const MAX_COLORS: usize = 10;
const MAX_FONTS: usize = 8;
/// Ignore pages beyond this size rather than scanning them.
const MAX_HTML_BYTES: usize = 2 * 1024 * 1024;

/// Signals extracted from a brand's website.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteEnrichment {
    pub title: Option<String>,
    pub description: Option<String>,
    pub logo_url: Option<String>,
    pub colors: Vec<String>,
    pub fonts: Vec<String>,
}

impl SiteEnrichment {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.logo_url.is_none()
            && self.colors.is_empty()
            && self.fonts.is_empty()
    }
}

/// Trait seam for the homepage fetch; tests substitute canned HTML.
#[async_trait]
pub trait SiteFetcher: Send + Sync {
    async fn fetch_html(&self, url: &str) -> Result<String, String>;
}

/// Real fetcher over reqwest.
pub struct HttpSiteFetcher {
    client: reqwest::Client,
}

impl HttpSiteFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpSiteFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SiteFetcher for HttpSiteFetcher {
    async fn fetch_html(&self, url: &str) -> Result<String, String> {
        let response = self
            .client
            .get(url)
            .timeout(FETCH_TIMEOUT)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("status {}", response.status()));
        }
        response.text().await.map_err(|e| e.to_string())
    }
}

fn regexes() -> &'static ExtractionRegexes {
    static REGEXES: OnceLock<ExtractionRegexes> = OnceLock::new();
    REGEXES.get_or_init(ExtractionRegexes::new)
}

struct ExtractionRegexes {
    title: Regex,
    meta_description: Regex,
    logo_img: Regex,
    any_img: Regex,
    hex_color: Regex,
    rgb_color: Regex,
    font_family: Regex,
}

impl ExtractionRegexes {
    fn new() -> Self {
        Self {
            title: Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("static regex"),
            meta_description: Regex::new(
                r#"(?is)<meta[^>]+name=["']description["'][^>]+content=["']([^"']*)["']"#,
            )
            .expect("static regex"),
            logo_img: Regex::new(
                r#"(?is)<img[^>]+(?:class|id|alt)=["'][^"']*logo[^"']*["'][^>]*src=["']([^"']+)["']|<img[^>]+src=["']([^"']*logo[^"']*)["']"#,
            )
            .expect("static regex"),
            any_img: Regex::new(r#"(?is)<img[^>]+src=["']([^"']+)["']"#).expect("static regex"),
            hex_color: Regex::new(r"#(?:[0-9a-fA-F]{6}|[0-9a-fA-F]{3})\b").expect("static regex"),
            rgb_color: Regex::new(r"rgba?\([^)]+\)").expect("static regex"),
            font_family: Regex::new(r#"(?i)font-family\s*:\s*([^;"'}]+)"#).expect("static regex"),
        }
    }
}

/// Run the conservative extractor over raw HTML.
pub fn extract(html: &str) -> SiteEnrichment {
    if html.len() > MAX_HTML_BYTES {
        debug!(bytes = html.len(), "page too large, skipping enrichment");
        return SiteEnrichment::default();
    }
    let re = regexes();

    let title = re
        .title
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| collapse_whitespace(m.as_str()))
        .filter(|t| !t.is_empty());

    let description = re
        .meta_description
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| collapse_whitespace(m.as_str()))
        .filter(|d| !d.is_empty());

    let logo_url = re
        .logo_img
        .captures(html)
        .and_then(|c| c.get(1).or_else(|| c.get(2)))
        .map(|m| m.as_str().to_string())
        .or_else(|| {
            // Fall back to the first image on the page.
            re.any_img
                .captures(html)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
        });

    let mut colors = Vec::new();
    let mut seen_colors = HashSet::new();
    for m in re
        .hex_color
        .find_iter(html)
        .chain(re.rgb_color.find_iter(html))
    {
        let color = m.as_str().to_ascii_lowercase();
        if seen_colors.insert(color.clone()) {
            colors.push(color);
            if colors.len() >= MAX_COLORS {
                break;
            }
        }
    }

    let mut fonts = Vec::new();
    let mut seen_fonts = HashSet::new();
    'outer: for captures in re.font_family.captures_iter(html) {
        let Some(list) = captures.get(1) else { continue };
        for token in list.as_str().split(',') {
            let font = token.trim().trim_matches(['"', '\'']).to_string();
            if font.is_empty() || font.eq_ignore_ascii_case("inherit") {
                continue;
            }
            if seen_fonts.insert(font.to_ascii_lowercase()) {
                fonts.push(font);
                if fonts.len() >= MAX_FONTS {
                    break 'outer;
                }
            }
        }
    }

    SiteEnrichment {
        title,
        description,
        logo_url,
        colors,
        fonts,
    }
}

fn collapse_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Fetch and extract. Every failure path returns empty enrichment.
pub async fn enrich_from_website(fetcher: &dyn SiteFetcher, url: &str) -> SiteEnrichment {
    match fetcher.fetch_html(url).await {
        Ok(html) => extract(&html),
        Err(e) => {
            debug!(url, error = %e, "website enrichment degraded to empty");
            SiteEnrichment::default()
        }
    }
}
