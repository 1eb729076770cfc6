use std::sync::LazyLock;

use reqwest::Client;
use reqwest::header::{self, HeaderMap, HeaderValue};
use scraper::{Html, Selector};
use tracing::{debug, trace};
use url::Url;

use crate::config::Config;
use crate::net::{self, RetryPolicy};
use crate::registration::{RegIds, extract_reg_ids};
use crate::text::strip_to_domain;

/// Anchor texts that advertise a legal notice page.
const LEGAL_TEXT_PATTERNS: &[&str] = &[
    "mentions légales",
    "mentions legales",
    "informations légales",
    "informations legales",
    "legal notice",
    "legal notices",
    "impressum",
    "imprint",
    "terms",
    "conditions",
    "cgu",
    "cgv",
    "conditions générales",
    "conditions generales",
    "informations juridiques",
    "legal",
];

/// Href fragments that advertise the same.
const LEGAL_HREF_PARTS: &[&str] = &["legal", "impressum", "mentions", "conditions", "terms"];

/// Paths worth probing even when the homepage links to none of them.
const COMMON_LEGAL_PATHS: &[&str] = &[
    "/mentions-legales",
    "/mentions_legales",
    "/informations-legales",
    "/legal",
    "/legal-notice",
    "/legal-notices",
    "/impressum",
    "/imprint",
    "/cgu",
    "/cgv",
    "/terms",
    "/conditions",
];

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_0) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:124.0) Gecko/20100101 Firefox/124.0",
];

/// At most this many legal URLs are fetched per domain.
const PAGE_CAP: usize = 12;

static ANCHOR_SELECTOR: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("a[href]").expect("failed to parse anchor selector")
});

fn browser_headers() -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(6);
    headers.insert(
        header::ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
    );
    headers.insert(
        header::ACCEPT_LANGUAGE,
        HeaderValue::from_static("fr-FR,fr;q=0.9,en;q=0.8,de;q=0.7,nl;q=0.7"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers
}

fn random_headers() -> HeaderMap {
    let mut headers = browser_headers();
    let ua = USER_AGENTS[fastrand::usize(..USER_AGENTS.len())];
    headers.insert(header::USER_AGENT, HeaderValue::from_static(ua));
    headers
}

/// Pick the response charset: the Content-Type parameter wins, then a
/// `charset=` hint in the leading bytes, then UTF-8.
fn decode_body(content_type: &str, bytes: &[u8]) -> String {
    static META_CHARSET_RE: LazyLock<regex::bytes::Regex> = LazyLock::new(|| {
        regex::bytes::Regex::new(r#"(?i)charset=["']?([a-zA-Z0-9_\-]+)"#)
            .expect("failed to compile regex for meta charset")
    });

    let declared = content_type
        .split(';')
        .filter_map(|part| part.trim().strip_prefix("charset="))
        .next()
        .map(|l| l.trim_matches('"').to_owned());
    let sniffed = META_CHARSET_RE
        .captures(&bytes[..bytes.len().min(1024)])
        .and_then(|caps| String::from_utf8(caps[1].to_vec()).ok());

    let encoding = declared
        .or(sniffed)
        .and_then(|label| encoding_rs::Encoding::for_label(label.as_bytes()))
        .unwrap_or(encoding_rs::UTF_8);
    let (text, _, _) = encoding.decode(bytes);
    text.into_owned()
}

/// Collect legal-page links from a homepage: anchors whose visible text
/// or href looks legal, then the fixed path list with and without a
/// trailing slash. Deduplicated in order, capped at twelve.
fn find_legal_links(html: &str, base_url: &str) -> Vec<String> {
    let mut out = Vec::new();
    if let Ok(base) = Url::parse(base_url) {
        let doc = Html::parse_document(html);
        for anchor in doc.select(&ANCHOR_SELECTOR) {
            let Some(href) = anchor.value().attr("href") else {
                continue;
            };
            let text = anchor.text().collect::<String>().trim().to_lowercase();
            let href_l = href.to_lowercase();
            let looks_legal = LEGAL_TEXT_PATTERNS.iter().any(|p| text.contains(p))
                || LEGAL_HREF_PARTS.iter().any(|p| href_l.contains(p));
            if looks_legal
                && let Ok(joined) = base.join(href.trim())
            {
                out.push(joined.to_string());
            }
        }
    }
    for p in COMMON_LEGAL_PATHS {
        out.push(format!("{base_url}{p}"));
        out.push(format!("{base_url}{p}/"));
    }

    let mut uniq = Vec::with_capacity(PAGE_CAP);
    for u in out {
        if !uniq.contains(&u) {
            uniq.push(u);
        }
        if uniq.len() >= PAGE_CAP {
            break;
        }
    }
    uniq
}

/// Fetches homepages and legal pages over plain HTTPS.
pub struct Crawler {
    client: Client,
    policy: RetryPolicy,
}

impl Crawler {
    pub fn new(cfg: &Config) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(cfg.http_connect_timeout)
            .timeout(cfg.http_total_timeout())
            .cookie_store(true)
            .gzip(true)
            .build()?;
        Ok(Self {
            client,
            policy: RetryPolicy {
                max_retries: cfg.max_retries,
                backoff_base: cfg.backoff_base,
            },
        })
    }

    /// GET one page with a randomised browser identity. Anything that is
    /// not HTML comes back as an empty string.
    async fn fetch_html(&self, url: &str) -> String {
        let Some(resp) = net::get_with_retries(&self.client, url, random_headers(), self.policy).await
        else {
            return String::new();
        };
        let content_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_lowercase();
        if !content_type.contains("text/html") {
            return String::new();
        }
        match resp.bytes().await {
            Ok(bytes) => decode_body(&content_type, &bytes),
            Err(_) => String::new(),
        }
    }

    /// Sweep one domain for registration identifiers: homepage first,
    /// then every legal-looking page it links to, then the common paths.
    pub async fn registration_ids(&self, domain: &str) -> RegIds {
        let base = format!("https://{}", strip_to_domain(domain));
        let home = self.fetch_html(&base).await;

        let mut urls = if home.is_empty() {
            let mut fallback = Vec::new();
            for p in COMMON_LEGAL_PATHS {
                fallback.push(format!("{base}{p}"));
                fallback.push(format!("{base}{p}/"));
            }
            fallback.truncate(PAGE_CAP);
            fallback
        } else {
            find_legal_links(&home, &base)
        };
        if !urls.contains(&base) {
            urls.push(base.clone());
        }
        debug!(domain, pages = urls.len(), "crawling legal pages");

        let mut found = extract_reg_ids(&home);
        for url in &urls {
            // The homepage body is already in hand.
            if *url == base {
                continue;
            }
            let html = self.fetch_html(url).await;
            if html.is_empty() {
                continue;
            }
            let ids = extract_reg_ids(&html);
            if !ids.is_empty() {
                trace!(url, ?ids, "registration identifiers found");
            }
            found.extend(ids);
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_find_legal_links_anchor_text() {
        let html = r#"<html><body>
            <a href="/fr/mentions">Mentions légales</a>
            <a href="/about">About us</a>
        </body></html>"#;
        let links = find_legal_links(html, "https://example.com");
        assert_eq!(links[0], "https://example.com/fr/mentions");
        assert!(!links.iter().any(|l| l.ends_with("/about")));
    }

    #[test]
    fn test_find_legal_links_href_keyword() {
        let html = r#"<a href="/impressum-2024">Über uns</a>"#;
        let links = find_legal_links(html, "https://example.de");
        assert_eq!(links[0], "https://example.de/impressum-2024");
    }

    #[test]
    fn test_find_legal_links_appends_common_paths() {
        let links = find_legal_links("<html></html>", "https://example.com");
        assert!(links.contains(&"https://example.com/mentions-legales".to_owned()));
        assert!(links.contains(&"https://example.com/mentions-legales/".to_owned()));
    }

    #[test]
    fn test_find_legal_links_caps_and_dedupes() {
        let html = r#"<a href="/legal">Legal</a><a href="/legal">Legal</a>"#;
        let links = find_legal_links(html, "https://example.com");
        assert!(links.len() <= 12);
        assert_eq!(
            links.iter().filter(|l| *l == "https://example.com/legal").count(),
            1
        );
    }

    #[test]
    fn test_find_legal_links_resolves_absolute() {
        let html = r#"<a href="https://legal.example.com/terms">Terms</a>"#;
        let links = find_legal_links(html, "https://example.com");
        assert_eq!(links[0], "https://legal.example.com/terms");
    }

    #[rstest]
    #[case::declared("text/html; charset=ISO-8859-1", &[0xE9, b' ', b'l', b'a'][..], "é la")]
    #[case::default_utf8("text/html", "état".as_bytes(), "état")]
    fn test_decode_body(#[case] content_type: &str, #[case] bytes: &[u8], #[case] expected: &str) {
        assert_eq!(decode_body(content_type, bytes), expected);
    }

    #[test]
    fn test_decode_body_meta_sniff() {
        let mut bytes = br#"<html><head><meta charset="windows-1252"></head><body>caf"#.to_vec();
        bytes.push(0xE9);
        bytes.extend_from_slice(b"</body></html>");
        assert!(decode_body("text/html", &bytes).contains("café"));
    }
}
