use reqwest::Client;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::Config;
use crate::net::{self, RetryPolicy, RpsLimiter};
use crate::text::strip_to_domain;

const TITLE_LIMIT: usize = 90;
const SNIPPET_LIMIT: usize = 180;

/// Hosts that can never be a company's own site: social networks,
/// aggregators, job boards, news, encyclopedias. Matched by substring.
const BLOCK_HOST_PARTS: &[&str] = &[
    "linkedin.com",
    "facebook.com",
    "instagram.com",
    "twitter.com",
    "x.com",
    "youtube.com",
    "tiktok.com",
    "wikipedia.org",
    "wikidata.org",
    "crunchbase.com",
    "rocketreach.co",
    "apollo.io",
    "zoominfo.com",
    "glassdoor",
    "indeed",
    "ycombinator.com",
    "angel.co",
    "medium.com",
    "blogspot",
    "news.",
];

/// Country ISO2 code to Google (gl, hl) locale pair.
const ISO2_TO_GL_HL: &[(&str, (&str, &str))] = &[
    ("FR", ("fr", "fr")),
    ("BE", ("be", "fr")),
    ("CH", ("ch", "fr")),
    ("CA", ("ca", "en")),
    ("US", ("us", "en")),
    ("GB", ("gb", "en")),
    ("IE", ("ie", "en")),
    ("AU", ("au", "en")),
    ("NZ", ("nz", "en")),
    ("DE", ("de", "de")),
    ("AT", ("at", "de")),
    ("CH-DE", ("ch", "de")),
    ("ES", ("es", "es")),
    ("MX", ("mx", "es")),
    ("AR", ("ar", "es")),
    ("IT", ("it", "it")),
    ("NL", ("nl", "nl")),
    ("SE", ("se", "sv")),
    ("NO", ("no", "no")),
    ("DK", ("dk", "da")),
    ("PT", ("pt", "pt")),
    ("BR", ("br", "pt")),
    ("PL", ("pl", "pl")),
    ("CZ", ("cz", "cs")),
    ("RO", ("ro", "ro")),
    ("HU", ("hu", "hu")),
    ("FI", ("fi", "fi")),
    ("EE", ("ee", "et")),
    ("LT", ("lt", "lt")),
    ("LV", ("lv", "lv")),
    ("AE", ("ae", "en")),
    ("IN", ("in", "en")),
    ("SG", ("sg", "en")),
    ("JP", ("jp", "ja")),
];

const COUNTRY_NAME_TO_ISO2: &[(&str, &str)] = &[
    ("france", "FR"),
    ("belgium", "BE"),
    ("switzerland", "CH"),
    ("canada", "CA"),
    ("united states", "US"),
    ("usa", "US"),
    ("united kingdom", "GB"),
    ("uk", "GB"),
    ("ireland", "IE"),
    ("australia", "AU"),
    ("new zealand", "NZ"),
    ("germany", "DE"),
    ("austria", "AT"),
    ("spain", "ES"),
    ("mexico", "MX"),
    ("argentina", "AR"),
    ("italy", "IT"),
    ("netherlands", "NL"),
    ("sweden", "SE"),
    ("norway", "NO"),
    ("denmark", "DK"),
    ("portugal", "PT"),
    ("brazil", "BR"),
    ("poland", "PL"),
    ("czech republic", "CZ"),
    ("romania", "RO"),
    ("hungary", "HU"),
    ("finland", "FI"),
    ("estonia", "EE"),
    ("lithuania", "LT"),
    ("latvia", "LV"),
    ("united arab emirates", "AE"),
    ("india", "IN"),
    ("singapore", "SG"),
    ("japan", "JP"),
    ("switzerland (de)", "CH-DE"),
];

/// One raw organic result as the search API returns it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawResult {
    pub link: Option<String>,
    pub url: Option<String>,
    #[serde(rename = "formattedUrl")]
    pub formatted_url: Option<String>,
    pub title: Option<String>,
    pub snippet: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SearchResponse {
    organic: Vec<RawResult>,
}

/// A filtered search result. Domains are unique within a row's list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub url: String,
    pub domain: String,
    pub title: String,
    pub snippet: String,
}

/// Drop unusable results: no host, blocked host, or a domain already
/// seen. Title and snippet are clipped to their display limits.
pub fn filter_candidates(results: &[RawResult]) -> Vec<Candidate> {
    let mut seen = Vec::new();
    let mut out = Vec::new();
    for it in results {
        let link = [&it.link, &it.url, &it.formatted_url]
            .into_iter()
            .find_map(|f| f.as_deref().filter(|s| !s.is_empty()))
            .unwrap_or_default();
        let host = strip_to_domain(link);
        if host.is_empty() {
            continue;
        }
        if BLOCK_HOST_PARTS.iter().any(|bad| host.contains(bad)) {
            continue;
        }
        if seen.contains(&host) {
            continue;
        }
        let title: String = it
            .title
            .clone()
            .unwrap_or_default()
            .chars()
            .take(TITLE_LIMIT)
            .collect();
        let snippet: String = it
            .snippet
            .clone()
            .or_else(|| it.description.clone())
            .unwrap_or_default()
            .chars()
            .take(SNIPPET_LIMIT)
            .collect();
        seen.push(host.clone());
        out.push(Candidate {
            url: link.to_owned(),
            domain: host,
            title,
            snippet,
        });
    }
    out
}

/// Derive the (gl, hl) locale pair from context: an explicit ISO2 code
/// column wins, else a recognised country name, else no locale.
pub fn guess_gl_hl(ctx: &[(String, String)]) -> (Option<&'static str>, Option<&'static str>) {
    let mut code = String::new();
    for (k, v) in ctx {
        let kl = k.to_lowercase();
        if kl.contains("country_code") || kl == "iso2" {
            code = v.trim().to_uppercase();
            break;
        }
        if kl == "country" || kl.contains("pays") {
            let name = v.trim().to_lowercase();
            code = COUNTRY_NAME_TO_ISO2
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, c)| (*c).to_owned())
                .unwrap_or_default();
            break;
        }
    }
    ISO2_TO_GL_HL
        .iter()
        .find(|(iso2, _)| *iso2 == code)
        .map_or((None, None), |(_, (gl, hl))| (Some(*gl), Some(*hl)))
}

/// Rate-limited client for the Serper search API.
pub struct SearchClient {
    client: Client,
    api_key: String,
    url: String,
    limiter: RpsLimiter,
    policy: RetryPolicy,
}

impl SearchClient {
    pub fn new(cfg: &Config) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(cfg.http_connect_timeout)
            .timeout(cfg.http_total_timeout())
            .gzip(true)
            .build()?;
        Ok(Self {
            client,
            api_key: cfg.serper_api_key.clone(),
            url: cfg.serper_search_url.clone(),
            limiter: RpsLimiter::new(cfg.serp_max_rps),
            policy: RetryPolicy {
                max_retries: cfg.max_retries,
                backoff_base: cfg.backoff_base,
            },
        })
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::with_capacity(2);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Ok(key) = HeaderValue::from_str(&self.api_key) {
            headers.insert("X-API-KEY", key);
        }
        headers
    }

    /// One organic search. Any failure, non-200, or shape mismatch is an
    /// empty result list, never an error.
    pub async fn search(
        &self,
        query: &str,
        ctx: &[(String, String)],
        num: usize,
    ) -> Vec<RawResult> {
        self.limiter.acquire().await;

        let (gl, hl) = guess_gl_hl(ctx);
        let mut body = json!({ "q": query, "num": num.clamp(1, 100) });
        if let Some(gl) = gl {
            body["gl"] = json!(gl);
        }
        if let Some(hl) = hl {
            body["hl"] = json!(hl);
        }

        debug!(query, gl, hl, "searching");
        match net::post_json_with_retries(
            &self.client,
            &self.url,
            self.headers(),
            &body,
            self.policy,
            "serper-search",
        )
        .await
        {
            Ok((status, payload)) if status.is_success() => {
                serde_json::from_value::<SearchResponse>(payload)
                    .map(|r| r.organic)
                    .unwrap_or_default()
            }
            Ok((status, _)) => {
                warn!(query, %status, "search returned an error status");
                Vec::new()
            }
            Err(_) => {
                warn!(query, "search retries exhausted");
                Vec::new()
            }
        }
    }
}
