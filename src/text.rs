use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;
use url::Url;

/// Legal-form suffixes and filler words that carry no brand signal.
/// `hub` and `one` are deliberately absent: they look generic but are
/// load-bearing in real brand names.
const GENERIC_TOKENS: &[&str] = &[
    "group", "holding", "holdings", "company", "co", "inc", "llc", "ltd", "plc", "sa", "sas",
    "sasu", "spa", "gmbh", "bv", "nv", "oy", "ab", "ag", "kg", "srl", "sl", "ltda", "pte", "pty",
    "limited", "corp", "corporation", "international", "global", "solutions", "services",
    "consulting", "recruitment", "recruiting", "partners", "management", "systems",
    "technologies", "technology", "tech", "digital",
];

const SUBDOMAIN_STOP: &[&str] = &["www", "m", "en", "fr", "de", "es", "it", "nl", "pt", "pl", "jp"];

/// Normalised company names mapped to the alias tokens their domains use.
const BRAND_ALIASES: &[(&str, &[&str])] = &[
    ("dassaultsystemes", &["3ds", "3dsexperience"]),
    ("reelit", &["reel", "it"]),
    ("lefigaroclassifieds", &["le", "figaro", "classifieds"]),
];

static WWW_PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^www\d*\.").expect("failed to compile regex for www prefix")
});

/// Splits glued domain labels like `reelit` into `reel` + `it`.
static GLUE_PARTS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.*?)(?:it|ai|data|group|groupe|sante|santé|labs)$")
        .expect("failed to compile regex for glued domain labels")
});

/// Reduce a URL or bare host to a lowercased domain, with any leading
/// `www`, `www2`, ... label removed. Returns an empty string for inputs
/// with no usable host. Idempotent.
pub fn strip_to_domain(u: &str) -> String {
    let host = if u.contains("://") {
        match Url::parse(u) {
            Ok(parsed) => parsed.host_str().unwrap_or_default().to_lowercase(),
            Err(_) => return String::new(),
        }
    } else {
        u.to_lowercase()
    };
    let host = WWW_PREFIX_RE.replace(&host, "");
    host.split('/').next().unwrap_or_default().to_owned()
}

/// Lowercase with combining marks stripped (NFD decompose, drop marks),
/// so `Société` and `societe` tokenize identically.
fn ascii_fold(s: &str) -> String {
    s.nfd()
        .filter(|ch| !is_combining_mark(*ch))
        .collect::<String>()
        .to_lowercase()
}

/// Tokenize a company name: fold accents, split on non-alphanumerics,
/// drop generic legal-form tokens. Order and duplicates are preserved.
pub fn name_tokens(name: &str) -> Vec<String> {
    ascii_fold(name)
        .split(|ch: char| !ch.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty() && !GENERIC_TOKENS.contains(t))
        .map(ToOwned::to_owned)
        .collect()
}

/// Split a host into (subdomain, registrable SLD label) using the public
/// suffix list, so `shop.example.co.uk` yields `("shop", "example")`.
fn host_parts(host: &str) -> (String, String) {
    if let Some(dom) = psl::domain(host.as_bytes()) {
        let registrable = String::from_utf8_lossy(dom.as_bytes()).into_owned();
        let suffix_len = dom.suffix().as_bytes().len();
        let sld = if registrable.len() > suffix_len {
            registrable[..registrable.len() - suffix_len - 1].to_owned()
        } else {
            String::new()
        };
        let sub = if host.len() > registrable.len() {
            host[..host.len() - registrable.len() - 1].to_owned()
        } else {
            String::new()
        };
        (sub, sld)
    } else if psl::suffix(host.as_bytes()).is_some_and(|s| s.as_bytes().len() == host.len()) {
        // A bare public suffix ("com", "co.uk") has no registrable label.
        (String::new(), String::new())
    } else {
        // Hosts outside the suffix list (e.g. `localhost`): treat the last
        // label as the SLD and everything before it as the subdomain.
        match host.rsplit_once('.') {
            Some((sub, sld)) => (sub.to_owned(), sld.to_owned()),
            None => (String::new(), host.to_owned()),
        }
    }
}

/// Tokenize a domain: SLD plus subdomain labels, split on `-_.`, with
/// subdomain stop-words removed, glued suffixes split off, and generic
/// tokens dropped.
pub fn domain_tokens(domain: &str) -> Vec<String> {
    let host = strip_to_domain(domain);
    let (sub, sld) = host_parts(&host);

    let mut toks: Vec<String> = sld
        .split(['-', '_', '.'])
        .filter(|t| !t.is_empty())
        .map(ToOwned::to_owned)
        .collect();
    toks.extend(
        sub.split(['-', '_', '.'])
            .filter(|t| !t.is_empty() && !SUBDOMAIN_STOP.contains(t))
            .map(ToOwned::to_owned),
    );

    let mut expanded = Vec::with_capacity(toks.len());
    for t in &toks {
        match GLUE_PARTS_RE.captures(t) {
            Some(caps) if !caps[1].is_empty() => {
                let root = &caps[1];
                expanded.push(root.to_owned());
                expanded.push(t[root.len()..].to_owned());
            }
            _ => expanded.push(t.clone()),
        }
    }

    expanded
        .into_iter()
        .filter(|t| !t.is_empty() && !GENERIC_TOKENS.contains(&t.as_str()))
        .collect()
}

pub fn joined_name_tokens(company: &str) -> String {
    name_tokens(company).concat()
}

pub fn joined_domain_tokens(domain: &str) -> String {
    domain_tokens(domain).concat()
}

/// Similarity in [0, 1]: `1 - distance / max(len)`. Exactly 1.0 on
/// equality and 0.0 when either side is empty. Operates on code points
/// with the classic two-row dynamic program.
pub fn levenshtein_ratio(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        cur[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            cur[j + 1] = (prev[j + 1] + 1).min(cur[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    let dist = prev[b.len()];

    #[allow(clippy::cast_precision_loss)]
    let ratio = 1.0 - dist as f64 / a.len().max(b.len()) as f64;
    ratio.max(0.0)
}

/// True when the company matches a known brand alias of the domain,
/// e.g. `Dassault Systèmes` against `3ds.com`.
pub fn alias_match(company: &str, domain: &str) -> bool {
    let cname = joined_name_tokens(company);
    let dtokens: HashSet<String> = domain_tokens(domain).into_iter().collect();
    if cname.is_empty() || dtokens.is_empty() {
        return false;
    }
    let joined: String = dtokens.iter().cloned().collect();
    BRAND_ALIASES.iter().any(|(base, aliases)| {
        cname.contains(base)
            && aliases
                .iter()
                .any(|al| dtokens.contains(*al) || joined.contains(al))
    })
}

/// True when the token sets intersect, or one is a subset of the other.
pub fn strong_token_overlap(company: &str, domain: &str) -> bool {
    let nt: HashSet<String> = name_tokens(company).into_iter().collect();
    let dt: HashSet<String> = domain_tokens(domain).into_iter().collect();
    if nt.is_empty() || dt.is_empty() {
        return false;
    }
    if nt.intersection(&dt).next().is_some() {
        return true;
    }
    nt.is_subset(&dt) || dt.is_subset(&nt)
}
