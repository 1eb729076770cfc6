use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru::LruCache;
use tokio::sync::{OnceCell, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, trace, warn};

use crate::config::Config;
use crate::crawl::Crawler;
use crate::error::EnrichError;
use crate::llm::{Choice, Confidence, LlmClient};
use crate::registration::{RegIds, expected_from_context, registration_match};
use crate::score::{Decision, decide};
use crate::search::{Candidate, SearchClient, filter_candidates, guess_gl_hl};
use crate::table::{CTX_REG, ColumnRoles, Table, ensure_output_columns, safe_cell};
use crate::text::strip_to_domain;

/// Callback fed `(current, total, message)` after each completed row.
pub type ProgressFn = Arc<dyn Fn(usize, usize, &str) + Send + Sync>;

/// Bound on each request cache. Keys are only ever re-fetched after
/// eviction, so this is a memory cap, not a correctness knob.
const CACHE_CAPACITY: usize = 100_000;

type SearchKey = (
    String,
    Option<&'static str>,
    Option<&'static str>,
    usize,
    usize,
);
type LlmKey = (String, Vec<(String, String)>, Vec<(String, String)>);

/// Single-flight request cache: the cell for a key is created under the
/// lock, the network call runs outside it.
type Cache<K, V> = Mutex<LruCache<K, Arc<OnceCell<V>>>>;

/// What one row task hands back to the driver.
#[derive(Debug, Default)]
struct RowResult {
    url: String,
    score: String,
    ambiguity: String,
    cand_count: String,
    reg_match: String,
    reg_ids_found: String,
    debug: String,
    found_domain: String,
    company: String,
}

enum RowOutcome {
    /// The unhealthy flag was set before this row did any work.
    Skipped,
    Done(Box<RowResult>),
}

/// Column indices the driver writes into.
struct OutputCols {
    url: usize,
    score: usize,
    ambiguity: usize,
    cand_count: usize,
    reg_match: usize,
    reg_ids_found: usize,
    debug: usize,
    found_domain: usize,
}

impl OutputCols {
    fn resolve(table: &mut Table) -> Self {
        ensure_output_columns(table);
        Self {
            url: table.ensure_column("URL"),
            score: table.ensure_column("URL_confidence_score"),
            ambiguity: table.ensure_column("URL_ambiguity"),
            cand_count: table.ensure_column("URL_cand_count"),
            reg_match: table.ensure_column("URL_reg_match"),
            reg_ids_found: table.ensure_column("URL_reg_ids_found"),
            debug: table.ensure_column("URL_debug"),
            found_domain: table.ensure_column("URL_found_domain"),
        }
    }

    fn write(&self, table: &mut Table, row: usize, res: &RowResult) {
        table.set_cell(row, self.url, res.url.clone());
        table.set_cell(row, self.score, res.score.clone());
        table.set_cell(row, self.ambiguity, res.ambiguity.clone());
        table.set_cell(row, self.cand_count, res.cand_count.clone());
        table.set_cell(row, self.reg_match, res.reg_match.clone());
        table.set_cell(row, self.reg_ids_found, res.reg_ids_found.clone());
        table.set_cell(row, self.debug, res.debug.clone());
        table.set_cell(row, self.found_domain, res.found_domain.clone());
    }
}

/// The query ladder for one company. Ordered from most to least
/// specific; the caller stops as soon as enough candidates accumulate.
fn build_queries(company: &str, ctx: &[(String, String)]) -> Vec<String> {
    let non_reg: Vec<&str> = ctx
        .iter()
        .filter(|(k, _)| !CTX_REG.contains(&k.to_lowercase().as_str()))
        .filter_map(|(_, v)| {
            let vs = safe_cell(v);
            (!vs.is_empty()).then_some(vs)
        })
        .collect();

    let mut queries = Vec::with_capacity(7);
    if !non_reg.is_empty() {
        let bits = non_reg[..non_reg.len().min(3)].join(" ");
        queries.push(format!("{company} {bits} official website"));
    }
    queries.push(format!("{company} official website"));
    queries.push(format!("{company} website"));
    queries.push(format!("\"{company}\" website"));
    queries.push(format!("\"{company}\" official website"));
    queries.push(format!("{company} site web"));
    queries.push(format!("{company} site officiel"));
    queries
}

fn progress_message(company: &str) -> String {
    let short: String = company.chars().take(30).collect();
    let ellipsis = if company.chars().count() > 30 { "..." } else { "" };
    format!("Processing: {short}{ellipsis}")
}

async fn dns_ok(host: &str, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, tokio::net::lookup_host((host, 443u16))).await {
        Ok(Ok(mut addrs)) => addrs.next().is_some(),
        _ => false,
    }
}

/// The per-row pipeline and its shared fabric: service clients, the two
/// request caches, concurrency caps, and the batch health flag.
pub struct Enricher {
    cfg: Config,
    search: SearchClient,
    llm: LlmClient,
    crawler: Arc<Crawler>,
    search_cache: Cache<SearchKey, Vec<Candidate>>,
    llm_cache: Cache<LlmKey, Choice>,
    sem_search: Semaphore,
    sem_llm: Semaphore,
    unhealthy: AtomicBool,
}

impl Enricher {
    pub fn new(cfg: Config) -> Result<Self, EnrichError> {
        let http_err = |e: reqwest::Error| EnrichError::Config(format!("http client: {e}"));
        let capacity = NonZeroUsize::new(CACHE_CAPACITY).expect("cache capacity is non-zero");
        Ok(Self {
            search: SearchClient::new(&cfg).map_err(http_err)?,
            llm: LlmClient::new(&cfg).map_err(http_err)?,
            crawler: Arc::new(Crawler::new(&cfg).map_err(http_err)?),
            search_cache: Mutex::new(LruCache::new(capacity)),
            llm_cache: Mutex::new(LruCache::new(capacity)),
            sem_search: Semaphore::new(cfg.serp_concurrency),
            sem_llm: Semaphore::new(cfg.openai_concurrency),
            unhealthy: AtomicBool::new(false),
            cfg,
        })
    }

    fn mark_unhealthy(&self) {
        self.unhealthy.store(true, Ordering::SeqCst);
    }

    fn is_unhealthy(&self) -> bool {
        self.unhealthy.load(Ordering::SeqCst)
    }

    /// Search with the process-lifetime cache. A key's network call runs
    /// at most once; concurrent misses for the same key coalesce.
    async fn cached_search(&self, query: &str, ctx: &[(String, String)]) -> Vec<Candidate> {
        let (gl, hl) = guess_gl_hl(ctx);
        let key: SearchKey = (
            query.to_owned(),
            gl,
            hl,
            self.cfg.search_results_per_call,
            1,
        );
        let cell = {
            let mut cache = self.search_cache.lock().unwrap();
            cache
                .get_or_insert(key, || Arc::new(OnceCell::new()))
                .clone()
        };
        cell.get_or_init(|| async {
            let _permit = self.sem_search.acquire().await.expect("semaphore closed");
            let raw = self
                .search
                .search(query, ctx, self.cfg.search_results_per_call)
                .await;
            filter_candidates(&raw)
        })
        .await
        .clone()
    }

    /// Model choice with the same single-flight cache. Failures are not
    /// cached, so a transient outage does not poison a key.
    async fn cached_choose(
        &self,
        index: usize,
        company: &str,
        ctx: &[(String, String)],
        candidates: &[Candidate],
    ) -> Result<Choice, EnrichError> {
        let mut sorted_ctx = ctx.to_vec();
        sorted_ctx.sort();
        let key: LlmKey = (
            company.to_owned(),
            sorted_ctx,
            candidates
                .iter()
                .take(self.cfg.max_candidates_per_company)
                .map(|c| (c.url.clone(), c.domain.clone()))
                .collect(),
        );
        let cell = {
            let mut cache = self.llm_cache.lock().unwrap();
            cache
                .get_or_insert(key, || Arc::new(OnceCell::new()))
                .clone()
        };
        cell.get_or_try_init(|| async {
            let _permit = self.sem_llm.acquire().await.expect("semaphore closed");
            self.llm.choose(index, company, ctx, candidates).await
        })
        .await
        .cloned()
    }

    /// Run the query ladder until enough unique-domain candidates have
    /// accumulated.
    async fn gather_candidates(
        &self,
        company: &str,
        ctx: &[(String, String)],
    ) -> Vec<Candidate> {
        let max = self.cfg.max_candidates_per_company;
        let mut candidates: Vec<Candidate> = Vec::new();
        let mut tried: HashSet<SearchKey> = HashSet::new();

        for query in build_queries(company, ctx) {
            let (gl, hl) = guess_gl_hl(ctx);
            let key: SearchKey = (query.clone(), gl, hl, self.cfg.search_results_per_call, 1);
            if !tried.insert(key) {
                continue;
            }
            for c in self.cached_search(&query, ctx).await {
                if !candidates.iter().any(|e| e.domain == c.domain) {
                    candidates.push(c);
                }
            }
            if candidates.len() >= max {
                candidates.truncate(max);
                break;
            }
        }
        candidates
    }

    /// Crawl every domain worth checking and return the first, in
    /// candidate order, whose legal pages carry a matching identifier.
    async fn first_registration_match(
        self: &Arc<Self>,
        to_check: &[String],
        expected: &RegIds,
    ) -> Option<(String, RegIds)> {
        let mut tasks = JoinSet::new();
        for dom in to_check {
            let this = Arc::clone(self);
            let dom = dom.clone();
            tasks.spawn(async move {
                let found = this.crawler.registration_ids(&dom).await;
                (dom, found)
            });
        }
        let mut results: HashMap<String, RegIds> = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            if let Ok((dom, found)) = joined {
                results.insert(dom, found);
            }
        }
        to_check.iter().find_map(|dom| {
            let found = results.get(dom)?;
            registration_match(expected, found).then(|| (dom.clone(), found.clone()))
        })
    }

    /// The per-row state machine: queries, model choice, guards and
    /// scoring, then the optional registration override.
    async fn process_row(
        self: &Arc<Self>,
        index: usize,
        company: String,
        ctx: Vec<(String, String)>,
    ) -> Result<RowOutcome, EnrichError> {
        if company.is_empty() {
            return Ok(RowOutcome::Done(Box::default()));
        }
        if self.is_unhealthy() {
            return Ok(RowOutcome::Skipped);
        }

        let candidates = self.gather_candidates(&company, &ctx).await;

        let choice = match self.cached_choose(index, &company, &ctx, &candidates).await {
            Ok(choice) => choice,
            Err(e) => {
                self.mark_unhealthy();
                return Err(e);
            }
        };

        let mut decision: Decision = decide(
            &company,
            &ctx,
            &candidates,
            &choice,
            self.cfg.max_candidates_per_company,
        );
        trace!(
            company = %company,
            domain = %decision.domain,
            confidence = %decision.confidence,
            score = decision.score,
            "scored"
        );
        if self.cfg.enable_dns_check
            && !decision.domain.is_empty()
            && !dns_ok(&decision.domain, self.cfg.dns_timeout).await
        {
            warn!(company = %company, domain = %decision.domain, "dns check failed");
            decision.domain.clear();
            decision.score = None;
            decision.ambiguity = 0;
        }

        // Registration override: a matching legal page beats the model.
        let reg_ctx: Vec<(&str, &str)> = ctx
            .iter()
            .filter(|(k, _)| CTX_REG.contains(&k.to_lowercase().as_str()))
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let expected = expected_from_context(&reg_ctx);
        let mut reg_matched = false;
        let mut reg_ids_found = String::new();
        if !expected.is_empty() && (!candidates.is_empty() || !decision.domain.is_empty()) {
            let mut to_check: Vec<String> = candidates
                .iter()
                .take(self.cfg.max_candidates_per_company)
                .map(|c| c.domain.clone())
                .collect();
            if !decision.domain.is_empty()
                && !to_check.iter().any(|d| strip_to_domain(d) == decision.domain)
            {
                to_check.push(decision.domain.clone());
            }
            if let Some((dom, found)) = self.first_registration_match(&to_check, &expected).await {
                info!(company = %company, domain = %dom, "registration identifiers matched");
                reg_matched = true;
                decision.domain = strip_to_domain(&dom);
                decision.score = Some(100);
                decision.confidence = Confidence::Entity;
                if decision.reason.is_empty() {
                    decision.reason = "registration-match".to_owned();
                }
                reg_ids_found = found.all_sorted().join(";");
            }
        }

        let found_domain = {
            let lower = choice.found_domain.trim().to_lowercase();
            if matches!(lower.as_str(), "null" | "none") {
                String::new()
            } else {
                lower
            }
        };
        let debug = serde_json::json!({
            "chosen_obj_title": decision.chosen_title,
            "chosen_obj_snippet": decision.chosen_snippet,
        })
        .to_string();

        Ok(RowOutcome::Done(Box::new(RowResult {
            url: decision.domain.clone(),
            score: decision
                .score
                .filter(|_| !decision.domain.is_empty())
                .map(|s| s.to_string())
                .unwrap_or_default(),
            ambiguity: decision.ambiguity.to_string(),
            cand_count: candidates.len().to_string(),
            reg_match: if reg_matched { "yes" } else { "no" }.to_owned(),
            reg_ids_found,
            debug,
            found_domain,
            company,
        })))
    }
}

/// Indices of rows that still need a URL.
fn pending_rows(table: &Table, url_col: usize) -> Vec<usize> {
    (0..table.rows.len())
        .filter(|&i| table.cell(i, url_col).trim().is_empty())
        .collect()
}

/// Enrich every row lacking a URL, in place, and return the table.
///
/// Rows run concurrently under the per-service caps. A model
/// infrastructure failure stops dispatch, cancels in-flight rows at
/// their next suspension point, and returns the partial result.
#[tracing::instrument(skip_all, fields(rows = table.rows.len()))]
pub async fn enrich(
    cfg: Config,
    mut table: Table,
    progress: Option<ProgressFn>,
) -> Result<Table, EnrichError> {
    let roles = ColumnRoles::resolve(&table)?;
    let cols = OutputCols::resolve(&mut table);

    let engine = Arc::new(Enricher::new(cfg)?);
    engine.llm.preflight().await?;

    let pending = pending_rows(&table, cols.url);
    let total = pending.len();
    info!(total, "starting enrichment");

    let report = |current: usize, message: &str| {
        if let Some(cb) = &progress {
            cb(current, total, message);
        }
    };
    report(0, "Starting enrichment...");

    let mut tasks: JoinSet<Result<(usize, RowOutcome), EnrichError>> = JoinSet::new();
    for idx in pending {
        if engine.is_unhealthy() {
            break;
        }
        let company = table.cell(idx, roles.company).trim().to_owned();
        let ctx: Vec<(String, String)> = roles
            .context_of(&table, idx)
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        let engine = Arc::clone(&engine);
        tasks.spawn(async move {
            let outcome = engine.process_row(idx, company, ctx).await?;
            Ok((idx, outcome))
        });
    }

    let mut processed = 0usize;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok((idx, RowOutcome::Done(result)))) => {
                cols.write(&mut table, idx, &result);
                processed += 1;
                report(processed, &progress_message(&result.company));
            }
            Ok(Ok((_, RowOutcome::Skipped))) => {}
            Ok(Err(e)) => {
                error!(err = %e, "model failure, stopping the batch");
                tasks.abort_all();
                break;
            }
            // A cancelled sibling; nothing to record.
            Err(_) => {}
        }
    }

    report(total, "Enrichment complete!");
    Ok(table)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_build_queries_with_context() {
        let ctx = vec![
            ("country".to_owned(), "France".to_owned()),
            ("sector".to_owned(), "Retail".to_owned()),
            ("siren".to_owned(), "732829320".to_owned()),
        ];
        let queries = build_queries("Carrefour", &ctx);
        assert_eq!(queries[0], "Carrefour France Retail official website");
        assert_eq!(queries[1], "Carrefour official website");
        assert_eq!(queries[2], "Carrefour website");
        assert_eq!(queries[3], "\"Carrefour\" website");
        assert_eq!(queries[4], "\"Carrefour\" official website");
        assert_eq!(queries[5], "Carrefour site web");
        assert_eq!(queries[6], "Carrefour site officiel");
    }

    #[test]
    fn test_build_queries_without_context() {
        let queries = build_queries("Acme", &[]);
        assert_eq!(queries[0], "Acme official website");
        assert_eq!(queries.len(), 6);
    }

    #[test]
    fn test_build_queries_caps_context_fragments() {
        let ctx: Vec<(String, String)> = (0..5)
            .map(|i| (format!("city{i}"), format!("Town{i}")))
            .collect();
        let queries = build_queries("Acme", &ctx);
        assert_eq!(queries[0], "Acme Town0 Town1 Town2 official website");
    }

    #[test]
    fn test_build_queries_skips_placeholder_cells() {
        let ctx = vec![("country".to_owned(), "nan".to_owned())];
        let queries = build_queries("Acme", &ctx);
        assert_eq!(queries[0], "Acme official website");
    }

    #[rstest]
    #[case::short("Acme", "Processing: Acme")]
    #[case::exactly_thirty(&"a".repeat(30), &format!("Processing: {}", "a".repeat(30)))]
    #[case::truncated(&"a".repeat(35), &format!("Processing: {}...", "a".repeat(30)))]
    fn test_progress_message(#[case] company: &str, #[case] expected: &str) {
        assert_eq!(progress_message(company), expected);
    }

    #[test]
    fn test_pending_rows_skips_filled_urls() {
        let mut table = Table::new(
            vec!["company".to_owned()],
            vec![
                vec!["Acme".to_owned()],
                vec!["Globex".to_owned()],
                vec!["Initech".to_owned()],
            ],
        );
        let url = table.ensure_column("URL");
        table.set_cell(1, url, "globex.com");
        assert_eq!(pending_rows(&table, url), vec![0, 2]);
        // A second pass over a fully-enriched table is a no-op.
        table.set_cell(0, url, "acme.com");
        table.set_cell(2, url, "initech.io");
        assert!(pending_rows(&table, url).is_empty());
    }
}
