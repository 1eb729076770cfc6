use std::sync::LazyLock;

use regex::Regex;
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::{Value, json};
use strum::{Display, EnumString};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::EnrichError;
use crate::net::{self, RetryPolicy};
use crate::search::Candidate;
use crate::table::safe_cell;

const TITLE_LIMIT: usize = 90;
const SNIPPET_LIMIT: usize = 180;

const SYSTEM_INSTRUCTION: &str = "You will receive one company name with optional context (country/city, industry/sector, description, LinkedIn hints) and a list of web-search candidate URLs.\n\n\
Choose the OFFICIAL domain using these rules:\n\
- Priority 1: The exact legal entity's domain.\n\
- Priority 2: Localized/country domains for the brand when relevant.\n\
- Priority 3: Global/parent domain when relevant.\n\
- If no candidate clearly matches but you can confidently identify the official website from your own knowledge or the context, OUTPUT that domain in 'found_domain'.\n\
- Use the description and context fields to ensure the domain aligns with the activity.\n\
- If still uncertain, set chosen_domain and found_domain to \"null\" and give a short reason.\n\n\
Return ONE JSON object with keys: {index, company, chosen_domain, chosen_from_url, found_domain, confidence ∈ [entity,country,group,null], reason}.\n\
Notes:\n\
- 'chosen_domain' must be from the provided candidates (normalize if needed). Fill 'chosen_from_url' with the URL actually chosen.\n\
- 'found_domain' is for a confident domain you know that is NOT in the candidates.";

const STRICT_RETURN_INSTR: &str = "Return ONLY a single JSON object (no prose, no code fences). \
Keys: index, company, chosen_domain, chosen_from_url, found_domain, confidence, reason. \
Confidence must be one of: entity, country, group, null. \
If unsure, set chosen_domain and found_domain to \"null\". Do not add extra keys.";

pub const PARSE_FAIL_REASON: &str = "openai-parse-fail";

static CODE_FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^```(?:json)?\s*|\s*```$").expect("failed to compile regex for code fences")
});

static FIRST_JSON_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\{.*\}").expect("failed to compile regex for first JSON object")
});

/// How sure the model is about the kind of match it made.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Confidence {
    /// The exact legal entity's own domain.
    Entity,
    /// A localized country domain of the brand.
    Country,
    /// The parent group's domain.
    Group,
    #[default]
    Null,
}

/// The model's verdict for one company.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Choice {
    pub chosen_domain: String,
    pub chosen_from_url: String,
    pub found_domain: String,
    pub confidence: Confidence,
    pub reason: String,
}

impl Default for Choice {
    fn default() -> Self {
        Self {
            chosen_domain: "null".to_owned(),
            chosen_from_url: String::new(),
            found_domain: "null".to_owned(),
            confidence: Confidence::Null,
            reason: String::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

/// Peel code fences and grab the first `{...}` block, so replies with
/// stray prose still parse.
fn extract_first_json(txt: &str) -> String {
    let t = CODE_FENCE_RE.replace_all(txt, "");
    let t = t.trim();
    FIRST_JSON_RE
        .find(t)
        .map_or_else(|| t.to_owned(), |m| m.as_str().to_owned())
}

fn field(obj: &Value, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
}

/// Map a raw reply body onto a `Choice`, defaulting every missing or
/// malformed field. An unparseable reply is the null choice with reason
/// `openai-parse-fail`.
fn parse_choice(content: &str) -> Choice {
    let Ok(obj) = serde_json::from_str::<Value>(&extract_first_json(content)) else {
        return Choice {
            reason: PARSE_FAIL_REASON.to_owned(),
            ..Choice::default()
        };
    };
    Choice {
        chosen_domain: field(&obj, "chosen_domain").unwrap_or_else(|| "null".to_owned()),
        chosen_from_url: field(&obj, "chosen_from_url")
            .or_else(|| field(&obj, "chosen_url"))
            .unwrap_or_default(),
        found_domain: field(&obj, "found_domain").unwrap_or_else(|| "null".to_owned()),
        confidence: field(&obj, "confidence")
            .and_then(|c| c.to_lowercase().parse().ok())
            .unwrap_or_default(),
        reason: field(&obj, "reason").unwrap_or_default(),
    }
}

/// Lay out the user block: index, quoted name, non-empty context pairs,
/// then the numbered candidate list.
fn build_user_prompt(
    index: usize,
    company: &str,
    ctx: &[(String, String)],
    candidates: &[Candidate],
    max_candidates: usize,
) -> String {
    let mut lines = vec![format!("index={index}"), format!("name=\"{company}\"")];
    let ctx_bits: Vec<String> = ctx
        .iter()
        .filter_map(|(k, v)| {
            let vs = safe_cell(v);
            (!vs.is_empty()).then(|| format!("{k}=\"{vs}\""))
        })
        .collect();
    if !ctx_bits.is_empty() {
        lines.push(format!("context: {}", ctx_bits.join(" ; ")));
    }
    lines.push("\nCandidates:".to_owned());
    for (i, c) in candidates.iter().take(max_candidates).enumerate() {
        let title: String = c.title.chars().take(TITLE_LIMIT).collect();
        let snippet: String = c.snippet.chars().take(SNIPPET_LIMIT).collect();
        lines.push(format!(
            "[{i}] url=\"{}\" title=\"{title}\" snippet=\"{snippet}\"",
            c.url
        ));
    }
    lines.join("\n")
}

/// Client for the chat completion endpoint.
pub struct LlmClient {
    client: Client,
    api_key: String,
    org_id: String,
    model: String,
    url: String,
    max_candidates: usize,
    policy: RetryPolicy,
}

impl LlmClient {
    pub fn new(cfg: &Config) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(cfg.http_connect_timeout)
            .timeout(cfg.http_total_timeout())
            .gzip(true)
            .build()?;
        Ok(Self {
            client,
            api_key: cfg.openai_api_key.clone(),
            org_id: cfg.openai_org_id.clone(),
            model: cfg.openai_model.clone(),
            url: cfg.openai_url.clone(),
            max_candidates: cfg.max_candidates_per_company,
            policy: RetryPolicy {
                max_retries: cfg.max_retries,
                backoff_base: cfg.backoff_base,
            },
        })
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::with_capacity(3);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Ok(auth) = HeaderValue::from_str(&format!("Bearer {}", self.api_key)) {
            headers.insert(AUTHORIZATION, auth);
        }
        if !self.org_id.is_empty()
            && let Ok(org) = HeaderValue::from_str(&self.org_id)
        {
            headers.insert("OpenAI-Organization", org);
        }
        headers
    }

    async fn chat(&self, messages: Value, tag: &str) -> Result<String, EnrichError> {
        let body = json!({
            "model": self.model,
            "temperature": 0,
            "messages": messages,
        });
        let (status, payload) = net::post_json_with_retries(
            &self.client,
            &self.url,
            self.headers(),
            &body,
            self.policy,
            tag,
        )
        .await
        .map_err(|e| {
            EnrichError::LlmUnavailable(format!(
                "retries exhausted / {}",
                truncate(&e.last_payload.unwrap_or(Value::Null).to_string(), 800)
            ))
        })?;

        if !status.is_success() {
            return Err(EnrichError::LlmUnavailable(format!(
                "HTTP {status} / {}",
                truncate(&payload.to_string(), 800)
            )));
        }
        let parsed: ChatResponse = serde_json::from_value(payload).map_err(|e| {
            EnrichError::LlmUnavailable(format!("malformed completion payload: {e}"))
        })?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| EnrichError::LlmUnavailable("empty completion".to_owned()))
    }

    /// One cheap round-trip to prove the endpoint answers with parseable
    /// JSON before the batch spends any search quota.
    pub async fn preflight(&self) -> Result<(), EnrichError> {
        let messages = json!([
            { "role": "system", "content": "Reply with only this JSON: {\"ok\":true}" },
            { "role": "user", "content": "ping" },
        ]);
        match self.chat(messages, "openai-preflight").await {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(err = %e, "preflight failed");
                Err(EnrichError::PreflightFailed)
            }
        }
    }

    /// Ask the model to pick the official domain for one company.
    ///
    /// A reply that arrives but does not parse is the null choice, not an
    /// error; only infrastructure failures bubble up.
    pub async fn choose(
        &self,
        index: usize,
        company: &str,
        ctx: &[(String, String)],
        candidates: &[Candidate],
    ) -> Result<Choice, EnrichError> {
        let messages = json!([
            { "role": "system", "content": format!("{SYSTEM_INSTRUCTION}\n{STRICT_RETURN_INSTR}") },
            {
                "role": "user",
                "content": build_user_prompt(index, company, ctx, candidates, self.max_candidates),
            },
        ]);
        let content = self.chat(messages, "openai-choose").await?;
        let choice = parse_choice(content.trim());
        debug!(company, chosen = %choice.chosen_domain, confidence = %choice.confidence, "model verdict");
        Ok(choice)
    }
}

fn truncate(s: &str, limit: usize) -> String {
    s.chars().take(limit).collect()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::plain(r#"{"a":1}"#, r#"{"a":1}"#)]
    #[case::fenced("```json\n{\"a\":1}\n```", r#"{"a":1}"#)]
    #[case::bare_fence("```\n{\"a\":1}\n```", r#"{"a":1}"#)]
    #[case::prose("Here you go: {\"a\":1} hope it helps", r#"{"a":1}"#)]
    #[case::no_object("no json here", "no json here")]
    fn test_extract_first_json(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(extract_first_json(input), expected);
    }

    #[test]
    fn test_parse_choice_complete() {
        let choice = parse_choice(
            r#"{"chosen_domain":"airbus.com","chosen_from_url":"https://airbus.com","found_domain":"null","confidence":"entity","reason":"exact match"}"#,
        );
        assert_eq!(choice.chosen_domain, "airbus.com");
        assert_eq!(choice.confidence, Confidence::Entity);
        assert_eq!(choice.reason, "exact match");
    }

    #[test]
    fn test_parse_choice_unparseable() {
        let choice = parse_choice("I could not decide.");
        assert_eq!(choice.chosen_domain, "null");
        assert_eq!(choice.confidence, Confidence::Null);
        assert_eq!(choice.reason, PARSE_FAIL_REASON);
    }

    #[test]
    fn test_parse_choice_missing_fields_default() {
        let choice = parse_choice(r#"{"chosen_domain":"example.com"}"#);
        assert_eq!(choice.chosen_domain, "example.com");
        assert_eq!(choice.found_domain, "null");
        assert_eq!(choice.confidence, Confidence::Null);
        assert_eq!(choice.chosen_from_url, "");
    }

    #[test]
    fn test_parse_choice_chosen_url_fallback() {
        let choice =
            parse_choice(r#"{"chosen_domain":"example.com","chosen_url":"https://example.com"}"#);
        assert_eq!(choice.chosen_from_url, "https://example.com");
    }

    #[rstest]
    #[case::entity("entity", Confidence::Entity)]
    #[case::uppercase("COUNTRY", Confidence::Country)]
    #[case::unknown("maybe", Confidence::Null)]
    fn test_confidence_parsing(#[case] raw: &str, #[case] expected: Confidence) {
        let choice = parse_choice(&format!(r#"{{"confidence":"{raw}"}}"#));
        assert_eq!(choice.confidence, expected);
    }

    #[test]
    fn test_build_user_prompt_layout() {
        let ctx = vec![
            ("country".to_owned(), "France".to_owned()),
            ("notes".to_owned(), "nan".to_owned()),
        ];
        let candidates = vec![Candidate {
            url: "https://carrefour.fr".to_owned(),
            domain: "carrefour.fr".to_owned(),
            title: "Carrefour".to_owned(),
            snippet: "Retail".to_owned(),
        }];
        let prompt = build_user_prompt(3, "Carrefour", &ctx, &candidates, 8);
        let expected = "index=3\n\
                        name=\"Carrefour\"\n\
                        context: country=\"France\"\n\
                        \nCandidates:\n\
                        [0] url=\"https://carrefour.fr\" title=\"Carrefour\" snippet=\"Retail\"";
        assert_eq!(prompt, expected);
    }

    #[test]
    fn test_build_user_prompt_truncates_candidates() {
        let candidates: Vec<Candidate> = (0..10)
            .map(|i| Candidate {
                url: format!("https://c{i}.com"),
                domain: format!("c{i}.com"),
                title: String::new(),
                snippet: String::new(),
            })
            .collect();
        let prompt = build_user_prompt(0, "Acme", &[], &candidates, 8);
        assert!(prompt.contains("[7] "));
        assert!(!prompt.contains("[8] "));
    }
}
