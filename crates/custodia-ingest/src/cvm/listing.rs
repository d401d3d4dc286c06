//! Remote directory index parsing
//!
//! CVM publishes its files behind plain Apache/nginx autoindex pages. Both
//! the `<pre>` layout (anchor followed by `DD-Mon-YYYY HH:MM  SIZE`) and the
//! table layout (one `<tr>` per file) are understood.

use chrono::NaiveDateTime;
use regex::Regex;
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use super::{CvmError, Result};

pub const USER_AGENT: &str = "Mozilla/5.0 (compatible; custodia-ingest/0.1)";

/// One row of a directory index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    /// Last path segment of the link (file name with extension)
    pub name: String,
    pub href: String,
    pub url: Url,
    /// Bytes; `None` for directories
    pub size: Option<u64>,
    pub last_modified: Option<NaiveDateTime>,
}

impl ListingEntry {
    pub fn is_directory(&self) -> bool {
        self.size.is_none()
    }
}

fn date_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(\d{2}-[A-Za-z]{3}-\d{4}|\d{4}-\d{2}-\d{2})\s+(\d{2}:\d{2})")
            .unwrap_or_else(|_| unreachable!("static date pattern"))
    })
}

fn size_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?:-|(\d+(?:\.\d+)?)([KMG])?)$")
            .unwrap_or_else(|_| unreachable!("static size pattern"))
    })
}

fn selector(css: &str) -> Selector {
    Selector::parse(css).unwrap_or_else(|_| unreachable!("static selector {}", css))
}

/// HTTP client for directory index pages
pub struct ListingClient {
    client: Client,
}

impl ListingClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client })
    }

    /// Fetch and parse one index page
    pub async fn list(&self, url: &Url) -> Result<Vec<ListingEntry>> {
        debug!(url = %url, "Fetching directory listing");

        let response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(CvmError::Network(format!(
                "HTTP {} for {}",
                response.status(),
                url
            )));
        }
        let html = response.text().await?;
        let entries = parse_listing(&html, url);

        info!(url = %url, count = entries.len(), "Parsed directory listing");
        Ok(entries)
    }
}

/// Parse an index page; rows are returned in order of appearance
pub fn parse_listing(html: &str, base: &Url) -> Vec<ListingEntry> {
    let document = Html::parse_document(html);
    let pre_anchors = selector("pre a");
    let body_anchors = selector("body a");

    let anchors: Vec<ElementRef<'_>> = {
        let in_pre: Vec<_> = document.select(&pre_anchors).collect();
        if in_pre.is_empty() {
            document.select(&body_anchors).collect()
        } else {
            in_pre
        }
    };

    anchors
        .into_iter()
        .filter_map(|anchor| parse_anchor(anchor, base))
        .collect()
}

fn parse_anchor(anchor: ElementRef<'_>, base: &Url) -> Option<ListingEntry> {
    let href = anchor.value().attr("href")?.trim();
    if href.is_empty() || href.starts_with('?') || href.starts_with('#') {
        return None;
    }

    let url = match base.join(href) {
        Ok(url) => url,
        Err(e) => {
            warn!(href, error = %e, "Skipping unresolvable link");
            return None;
        },
    };
    // Parent, self and off-site links are not part of this directory
    if url.host_str() != base.host_str()
        || url.path() == base.path()
        || !url.path().starts_with(base.path())
        || url.query().is_some()
    {
        return None;
    }

    let name = url
        .path()
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string();
    if name.is_empty() {
        return None;
    }

    let text = trailing_text(anchor);
    let (last_modified, rest) = match date_pattern().captures(&text) {
        Some(caps) => {
            let stamp = format!("{} {}", &caps[1], &caps[2]);
            match parse_stamp(&stamp) {
                Some(parsed) => {
                    let end = caps.get(0).map(|m| m.end()).unwrap_or(0);
                    (Some(parsed), text[end..].to_string())
                },
                None => {
                    warn!(href, stamp = %stamp, "Skipping row with unparsable date");
                    return None;
                },
            }
        },
        None => (None, text.clone()),
    };

    let size = match rest.split_whitespace().next() {
        Some(token) => match parse_size(token) {
            Ok(size) => size,
            Err(()) => {
                warn!(href, token, "Skipping row with unparsable size");
                return None;
            },
        },
        None => None,
    };
    // A trailing slash marks a directory regardless of what the row says
    let size = if href.ends_with('/') { None } else { size };

    Some(ListingEntry {
        name,
        href: href.to_string(),
        url,
        size,
        last_modified,
    })
}

/// Text describing an anchor: its table row, else the text node after it
fn trailing_text(anchor: ElementRef<'_>) -> String {
    let row = anchor
        .ancestors()
        .filter_map(ElementRef::wrap)
        .find(|el| el.value().name() == "tr");
    if let Some(row) = row {
        return row
            .text()
            .collect::<Vec<_>>()
            .join(" ");
    }

    anchor
        .next_sibling()
        .and_then(|node| node.value().as_text().map(|t| String::from(&**t)))
        .map(|t| t.lines().next().unwrap_or_default().to_string())
        .unwrap_or_default()
}

fn parse_stamp(stamp: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(stamp, "%d-%b-%Y %H:%M")
        .or_else(|_| NaiveDateTime::parse_from_str(stamp, "%Y-%m-%d %H:%M"))
        .ok()
}

/// `-` is a directory; `12`, `1.5K`, `3M`, `2.1G` are sizes in bytes
fn parse_size(token: &str) -> std::result::Result<Option<u64>, ()> {
    let caps = size_pattern().captures(token).ok_or(())?;
    let Some(number) = caps.get(1) else {
        return Ok(None);
    };
    let value: f64 = number.as_str().parse().map_err(|_| ())?;
    let multiplier = match caps.get(2).map(|m| m.as_str()) {
        Some("K") => 1024.0,
        Some("M") => 1024.0 * 1024.0,
        Some("G") => 1024.0 * 1024.0 * 1024.0,
        _ => 1.0,
    };
    Ok(Some((value * multiplier).round() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    const PRE_INDEX: &str = r#"<html><head><title>Index of /dados/FI/DOC/INF_DIARIO/DADOS/</title></head>
<body><h1>Index of /dados/FI/DOC/INF_DIARIO/DADOS/</h1><hr><pre><a href="../">../</a>
<a href="HIST/">HIST/</a>                                              05-Jan-2024 10:00       -
<a href="inf_diario_fi_202312.zip">inf_diario_fi_202312.zip</a>        02-Jan-2024 09:15    21.3M
<a href="inf_diario_fi_202401.zip">inf_diario_fi_202401.zip</a>        16-Jan-2024 07:44     9450K
<a href="meta_inf_diario_fi.txt">meta_inf_diario_fi.txt</a>          10-Mar-2021 12:00     1843
<a href="?C=M;O=A">Last modified</a>
<a href="https://elsewhere.example/x.csv">x.csv</a>                   10-Mar-2021 12:00     1843
</pre><hr></body></html>"#;

    const TABLE_INDEX: &str = r#"<html><body><table>
<tr><th><a href="?C=N;O=D">Name</a></th><th>Last modified</th><th>Size</th></tr>
<tr><td><a href="/dados/FI/CAD/">Parent Directory</a></td><td>&nbsp;</td><td>-</td></tr>
<tr><td><a href="cad_fi.csv">cad_fi.csv</a></td><td>2024-01-16 06:01</td><td>12M</td></tr>
<tr><td><a href="cad_fi_hist.zip">cad_fi_hist.zip</a></td><td>2024-01-16 06:02</td><td>1.5G</td></tr>
</table></body></html>"#;

    fn base(path: &str) -> Url {
        Url::parse(&format!("https://dados.cvm.gov.br{}", path)).unwrap()
    }

    #[test]
    fn test_pre_listing() {
        let entries = parse_listing(PRE_INDEX, &base("/dados/FI/DOC/INF_DIARIO/DADOS/"));
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "HIST",
                "inf_diario_fi_202312.zip",
                "inf_diario_fi_202401.zip",
                "meta_inf_diario_fi.txt"
            ]
        );

        assert!(entries[0].is_directory());
        assert_eq!(entries[1].size, Some((21.3f64 * 1024.0 * 1024.0).round() as u64));
        assert_eq!(entries[2].size, Some(9450 * 1024));
        assert_eq!(entries[3].size, Some(1843));
        assert_eq!(
            entries[2].last_modified,
            NaiveDate::from_ymd_opt(2024, 1, 16).unwrap().and_hms_opt(7, 44, 0)
        );
        assert_eq!(
            entries[2].url.as_str(),
            "https://dados.cvm.gov.br/dados/FI/DOC/INF_DIARIO/DADOS/inf_diario_fi_202401.zip"
        );
    }

    #[test]
    fn test_table_listing() {
        let entries = parse_listing(TABLE_INDEX, &base("/dados/FI/CAD/DADOS/"));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "cad_fi.csv");
        assert_eq!(entries[0].size, Some(12 * 1024 * 1024));
        assert_eq!(
            entries[1].last_modified,
            NaiveDate::from_ymd_opt(2024, 1, 16).unwrap().and_hms_opt(6, 2, 0)
        );
    }

    #[test]
    fn test_bad_rows_are_skipped() {
        let html = r#"<pre><a href="a.csv">a.csv</a>  31-Foo-2024 10:00  10
<a href="b.csv">b.csv</a>  01-Feb-2024 10:00  lots
<a href="c.csv">c.csv</a>  01-Feb-2024 10:00  10
<a href="d.csv">d.csv</a>
</pre>"#;
        let entries = parse_listing(html, &base("/d/"));
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["c.csv", "d.csv"]);
        assert_eq!(entries[1].last_modified, None);
    }

    #[test]
    fn test_size_tokens() {
        assert_eq!(parse_size("-"), Ok(None));
        assert_eq!(parse_size("512"), Ok(Some(512)));
        assert_eq!(parse_size("1.5K"), Ok(Some(1536)));
        assert!(parse_size("1.5T").is_err());
    }
}
