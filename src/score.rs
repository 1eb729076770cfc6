use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::llm::{Choice, Confidence};
use crate::search::Candidate;
use crate::table::{CTX_DESCRIPTION, CTX_LOCATION, CTX_SECTOR};
use crate::text::{
    alias_match, domain_tokens, joined_domain_tokens, joined_name_tokens, levenshtein_ratio,
    name_tokens, strip_to_domain, strong_token_overlap,
};

static URL_IN_TEXT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https?://[^\s"')]+"#).expect("failed to compile regex for URLs in prose")
});

fn is_null_domain(s: &str) -> bool {
    matches!(s, "null" | "none" | "") || strip_to_domain(s).is_empty()
}

/// First occurrence of each token, in order, so joined strings are
/// reproducible run to run.
fn dedup_in_order(tokens: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    tokens.into_iter().filter(|t| seen.insert(t.clone())).collect()
}

/// A proposal after the recovery ladder: the domain to vet plus how it
/// was obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Recovered {
    pub domain_raw: String,
    pub confidence: Confidence,
    pub reason: String,
    pub used_llm_found: bool,
}

/// Salvage a usable domain from a partial model reply: the chosen URL
/// first, then a URL buried in the reason, then the model's own
/// `found_domain` (promoted to entity with a raised score floor).
pub(crate) fn recover(choice: &Choice) -> Recovered {
    let mut domain_raw = choice.chosen_domain.trim().to_lowercase();
    let mut confidence = choice.confidence;
    let mut reason = choice.reason.trim().to_owned();
    let src_url = choice.chosen_from_url.trim();
    let found = choice.found_domain.trim().to_lowercase();
    let mut used_llm_found = false;

    if is_null_domain(&domain_raw) && !src_url.is_empty() {
        domain_raw = strip_to_domain(src_url);
    }
    if is_null_domain(&domain_raw)
        && let Some(m) = URL_IN_TEXT_RE.find(&reason)
    {
        domain_raw = strip_to_domain(m.as_str());
    }
    if is_null_domain(&domain_raw) && !matches!(found.as_str(), "null" | "none" | "") {
        let stripped = strip_to_domain(&found);
        if !stripped.is_empty() {
            domain_raw = stripped;
            confidence = Confidence::Entity;
            used_llm_found = true;
            reason = if reason.is_empty() {
                "LLM-direct-found".to_owned()
            } else {
                format!("{reason} | LLM-direct-found")
            };
        }
    }

    Recovered {
        domain_raw,
        confidence,
        reason,
        used_llm_found,
    }
}

/// Reject a proposed domain that shares no lexical evidence with the
/// company name. Trusted alternative identities (`country`, `group`)
/// and known brand aliases pass outright; everything else needs token
/// overlap or a high enough edit-distance ratio.
pub fn homonym_guard(company: &str, domain: &str, confidence: Confidence) -> bool {
    if matches!(confidence, Confidence::Country | Confidence::Group) {
        return true;
    }
    if alias_match(company, domain) {
        return true;
    }
    if strong_token_overlap(company, domain) {
        return true;
    }
    let nt = dedup_in_order(name_tokens(company));
    let dt = dedup_in_order(domain_tokens(domain));
    let a = nt.concat();
    let b = dt.concat();
    if a.is_empty() || b.is_empty() {
        return false;
    }
    let ratio = levenshtein_ratio(&a, &b);
    if nt.len() <= 2 { ratio >= 0.60 } else { ratio >= 0.70 }
}

/// How many other candidates could plausibly be this company too.
pub fn ambiguity_count(company: &str, candidates: &[Candidate], chosen_domain: &str) -> usize {
    let a = joined_name_tokens(company);
    let chosen = strip_to_domain(chosen_domain);
    candidates
        .iter()
        .filter(|c| !c.domain.is_empty())
        .filter(|c| chosen.is_empty() || strip_to_domain(&c.domain) != chosen)
        .filter(|c| {
            let b = joined_domain_tokens(&c.domain);
            levenshtein_ratio(&a, &b) >= 0.80 || strong_token_overlap(company, &c.domain)
        })
        .count()
}

/// Tokens (≥3 chars) from the descriptive context buckets: location,
/// description, sector.
fn context_tokens(ctx: &[(String, String)]) -> HashSet<String> {
    let mut want = HashSet::new();
    for (k, v) in ctx {
        let kl = k.to_lowercase();
        if CTX_DESCRIPTION.contains(&kl.as_str())
            || CTX_SECTOR.contains(&kl.as_str())
            || CTX_LOCATION.contains(&kl.as_str())
        {
            want.extend(name_tokens(v).into_iter().filter(|t| t.len() >= 3));
        }
    }
    want
}

fn context_hits(ctx: &[(String, String)], chosen: &Candidate) -> Option<(usize, usize)> {
    let want = context_tokens(ctx);
    if want.is_empty() {
        return None;
    }
    let hay = format!(
        "{} {}",
        chosen.title.to_lowercase(),
        chosen.snippet.to_lowercase()
    );
    let hits = want.iter().filter(|t| hay.contains(t.as_str())).count();
    Some((hits, want.len()))
}

/// Penalty (0..=12) for context tokens absent from the chosen result's
/// title and snippet. Skipped when the name itself already overlaps the
/// domain.
fn context_match_effect(company: &str, ctx: &[(String, String)], chosen: &Candidate) -> i64 {
    if strong_token_overlap(company, &chosen.domain) {
        return 0;
    }
    let Some((hits, want)) = context_hits(ctx, chosen) else {
        return 0;
    };
    #[allow(clippy::cast_precision_loss)]
    let miss_ratio = 1.0 - hits as f64 / want.max(1) as f64;
    #[allow(clippy::cast_possible_truncation)]
    let penalty = (12.0 * miss_ratio).min(12.0).round() as i64;
    penalty
}

/// Bonus for context corroboration: +10 for two or more hits, +5 for one.
fn context_positive_bonus(ctx: &[(String, String)], chosen: &Candidate) -> i64 {
    match context_hits(ctx, chosen) {
        Some((hits, _)) if hits >= 2 => 10,
        Some((1, _)) => 5,
        _ => 0,
    }
}

fn base_score(confidence: Confidence) -> i64 {
    match confidence {
        Confidence::Entity => 95,
        Confidence::Country => 78,
        Confidence::Group => 65,
        Confidence::Null => 50,
    }
}

/// The vetted outcome for one row, before any registration override.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Decision {
    /// Accepted domain, empty when the proposal was null or rejected.
    pub domain: String,
    pub score: Option<i64>,
    pub ambiguity: usize,
    pub confidence: Confidence,
    pub reason: String,
    pub used_llm_found: bool,
    /// Title/snippet of the matching candidate, for the debug payload.
    pub chosen_title: String,
    pub chosen_snippet: String,
}

/// Run recovery, the homonym guard, and scoring over a model reply.
///
/// Deterministic: identical inputs always yield the identical decision.
pub(crate) fn decide(
    company: &str,
    ctx: &[(String, String)],
    candidates: &[Candidate],
    choice: &Choice,
    max_candidates: usize,
) -> Decision {
    let recovered = recover(choice);
    let mut decision = Decision {
        confidence: recovered.confidence,
        reason: recovered.reason.clone(),
        used_llm_found: recovered.used_llm_found,
        ..Decision::default()
    };

    if matches!(recovered.domain_raw.as_str(), "null" | "none" | "") {
        return decision;
    }
    let d = strip_to_domain(&recovered.domain_raw);
    let chosen = candidates
        .iter()
        .find(|c| strip_to_domain(&c.domain) == d);
    if let Some(c) = chosen {
        decision.chosen_title = c.title.clone();
        decision.chosen_snippet = c.snippet.clone();
    }
    if d.is_empty() || !homonym_guard(company, &d, recovered.confidence) {
        return decision;
    }

    let ambiguity = ambiguity_count(company, candidates, &d);
    let total_considered = candidates.len().clamp(1, max_candidates);
    #[allow(clippy::cast_precision_loss)]
    let amb_ratio = (ambiguity as f64 / total_considered as f64).min(1.0);
    let brand_tokens = name_tokens(company).len();
    let amb_cap = if brand_tokens <= 2 { 12.0 } else { 20.0 };
    #[allow(clippy::cast_possible_truncation)]
    let amb_penalty = (amb_cap * amb_ratio).round() as i64;

    // Context checks only apply against a real candidate; a domain taken
    // from model knowledge has no title or snippet to match.
    let (ctx_penalty, ctx_bonus) = match chosen {
        Some(c) => (
            context_match_effect(company, ctx, c),
            context_positive_bonus(ctx, c),
        ),
        None => (0, 0),
    };

    let mut score = (base_score(recovered.confidence) - amb_penalty - ctx_penalty + ctx_bonus)
        .clamp(1, 100);
    if recovered.used_llm_found && score < 75 {
        score = 75;
    }

    decision.domain = d;
    decision.score = Some(score);
    decision.ambiguity = ambiguity;
    decision
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn cand(domain: &str, title: &str, snippet: &str) -> Candidate {
        Candidate {
            url: format!("https://{domain}"),
            domain: domain.to_owned(),
            title: title.to_owned(),
            snippet: snippet.to_owned(),
        }
    }

    fn choice(domain: &str, confidence: Confidence) -> Choice {
        Choice {
            chosen_domain: domain.to_owned(),
            chosen_from_url: String::new(),
            found_domain: "null".to_owned(),
            confidence,
            reason: String::new(),
        }
    }

    #[test]
    fn test_recover_prefers_chosen_domain() {
        let c = Choice {
            chosen_domain: "airbus.com".to_owned(),
            ..Choice::default()
        };
        let r = recover(&c);
        assert_eq!(r.domain_raw, "airbus.com");
        assert!(!r.used_llm_found);
    }

    #[test]
    fn test_recover_from_chosen_url() {
        let c = Choice {
            chosen_from_url: "https://www.airbus.com/en".to_owned(),
            ..Choice::default()
        };
        assert_eq!(recover(&c).domain_raw, "airbus.com");
    }

    #[test]
    fn test_recover_from_reason_url() {
        let c = Choice {
            reason: "best match is https://airbus.com based on context".to_owned(),
            ..Choice::default()
        };
        assert_eq!(recover(&c).domain_raw, "airbus.com");
    }

    #[test]
    fn test_recover_promotes_found_domain() {
        let c = Choice {
            found_domain: "obscure-startup.io".to_owned(),
            reason: "not among candidates".to_owned(),
            ..Choice::default()
        };
        let r = recover(&c);
        assert_eq!(r.domain_raw, "obscure-startup.io");
        assert_eq!(r.confidence, Confidence::Entity);
        assert!(r.used_llm_found);
        assert_eq!(r.reason, "not among candidates | LLM-direct-found");
    }

    #[rstest]
    #[case::overlap("Airbus", "airbus.com", Confidence::Entity, true)]
    #[case::country_trusted("Acme", "totally-different.fr", Confidence::Country, true)]
    #[case::group_trusted("Acme", "parent-group.com", Confidence::Group, true)]
    #[case::alias("Dassault Systèmes", "3ds.com", Confidence::Entity, true)]
    #[case::homonym_rejected("Acme Robotics", "unrelated.io", Confidence::Entity, false)]
    #[case::close_spelling("Datalog", "datalogic.com", Confidence::Entity, true)]
    fn test_homonym_guard(
        #[case] company: &str,
        #[case] domain: &str,
        #[case] confidence: Confidence,
        #[case] expected: bool,
    ) {
        assert_eq!(homonym_guard(company, domain, confidence), expected);
    }

    #[test]
    fn test_ambiguity_counts_lookalikes_only() {
        let candidates = vec![
            cand("carrefour.fr", "", ""),
            cand("carrefour.com", "", ""),
            cand("carrefour.be", "", ""),
            cand("unrelated.org", "", ""),
        ];
        assert_eq!(ambiguity_count("Carrefour", &candidates, "carrefour.fr"), 2);
    }

    #[test]
    fn test_ambiguity_never_exceeds_candidates() {
        let candidates = vec![cand("acme.com", "", ""), cand("acme.fr", "", "")];
        assert!(ambiguity_count("Acme", &candidates, "") <= candidates.len());
    }

    #[test]
    fn test_decide_entity_no_ambiguity() {
        let candidates = vec![cand("airbus.com", "Airbus", "Aerospace pioneer")];
        let d = decide(
            "Airbus",
            &[],
            &candidates,
            &choice("airbus.com", Confidence::Entity),
            8,
        );
        assert_eq!(d.domain, "airbus.com");
        assert_eq!(d.score, Some(95));
        assert_eq!(d.ambiguity, 0);
    }

    #[test]
    fn test_decide_country_with_lookalikes() {
        let ctx = vec![("country".to_owned(), "France".to_owned())];
        let candidates = vec![
            cand("carrefour.fr", "Carrefour France", "Courses en ligne France"),
            cand("carrefour.com", "Carrefour Group", ""),
            cand("carrefour.be", "Carrefour Belgique", ""),
        ];
        let d = decide(
            "Carrefour",
            &ctx,
            &candidates,
            &choice("carrefour.fr", Confidence::Country),
            8,
        );
        assert_eq!(d.domain, "carrefour.fr");
        assert_eq!(d.ambiguity, 2);
        // base 78, ambiguity 2/3 of cap 12 => 8, ctx penalty skipped by
        // token overlap, one context hit => +5.
        assert_eq!(d.score, Some(75));
    }

    #[test]
    fn test_decide_rejects_homonym() {
        let candidates = vec![cand("unrelated.io", "Other Corp", "")];
        let d = decide(
            "Acme Robotics",
            &[],
            &candidates,
            &choice("unrelated.io", Confidence::Entity),
            8,
        );
        assert_eq!(d.domain, "");
        assert_eq!(d.score, None);
        assert_eq!(d.ambiguity, 0);
    }

    #[test]
    fn test_decide_null_choice() {
        let d = decide("Acme", &[], &[], &Choice::default(), 8);
        assert_eq!(d.domain, "");
        assert_eq!(d.score, None);
    }

    #[test]
    fn test_decide_found_domain_floor() {
        let c = Choice {
            found_domain: "obscure-startup.io".to_owned(),
            ..Choice::default()
        };
        let d = decide("Obscure Startup", &[], &[], &c, 8);
        assert_eq!(d.domain, "obscure-startup.io");
        assert!(d.score.is_some_and(|s| s >= 75));
        assert!(d.used_llm_found);
    }

    #[test]
    fn test_decide_brand_alias_scores_normally() {
        let candidates = vec![cand("reel.fr", "Reel", "Services informatiques")];
        let d = decide(
            "Reel IT",
            &[],
            &candidates,
            &choice("reel.fr", Confidence::Entity),
            8,
        );
        assert_eq!(d.domain, "reel.fr");
        assert_eq!(d.score, Some(95));
    }

    #[test]
    fn test_decide_deterministic() {
        let ctx = vec![("sector".to_owned(), "Retail".to_owned())];
        let candidates = vec![
            cand("carrefour.fr", "Carrefour", "Retail"),
            cand("carrefour.com", "Carrefour Group", ""),
        ];
        let c = choice("carrefour.fr", Confidence::Country);
        let first = decide("Carrefour", &ctx, &candidates, &c, 8);
        let second = decide("Carrefour", &ctx, &candidates, &c, 8);
        assert_eq!(first, second);
    }
}
