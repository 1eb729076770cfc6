use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

// Registration numbers on legal pages are typically grouped with plain,
// no-break, or narrow no-break spaces.
const SPACE: &str = "[ \u{00A0}\u{202F}]*";

static SIREN_RE: LazyLock<Regex> = LazyLock::new(|| {
    let core = siren_core();
    Regex::new(&format!(
        r"(?i)\b(?:siren|n°\s*siren|numero\s*siren|num\s*siren)\b[^0-9]{{0,20}}({core})\b"
    ))
    .expect("failed to compile regex for labelled SIREN")
});

static SIRET_RE: LazyLock<Regex> = LazyLock::new(|| {
    let core = siret_core();
    Regex::new(&format!(
        r"(?i)\b(?:siret|n°\s*siret|numero\s*siret|num\s*siret)\b[^0-9]{{0,20}}({core})\b"
    ))
    .expect("failed to compile regex for labelled SIRET")
});

static SIREN_FB: LazyLock<Regex> = LazyLock::new(|| {
    let core = siren_core();
    Regex::new(&format!(r"(?i)\b({core})\b")).expect("failed to compile regex for bare SIREN")
});

static SIRET_FB: LazyLock<Regex> = LazyLock::new(|| {
    let core = siret_core();
    Regex::new(&format!(r"(?i)\b({core})\b")).expect("failed to compile regex for bare SIRET")
});

static VAT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:VAT|TVA|USt-IdNr|Partita IVA|BTW|GST)\b[^A-Z0-9]{0,12}([A-Z0-9\-]{8,16})\b")
        .expect("failed to compile regex for VAT")
});

static KVK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:KvK|Kamer van Koophandel)\b[^0-9]{0,12}(\d{6,12})\b")
        .expect("failed to compile regex for KvK")
});

fn siren_core() -> String {
    format!(r"\d{{3}}{SPACE}\d{{3}}{SPACE}\d{{3}}")
}

fn siret_core() -> String {
    format!(r"\d{{3}}{SPACE}\d{{3}}{SPACE}\d{{3}}{SPACE}\d{{5}}")
}

/// Registration identifiers, grouped by scheme. Sets are sorted so the
/// output join is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegIds {
    pub siren: BTreeSet<String>,
    pub siret: BTreeSet<String>,
    pub vat: BTreeSet<String>,
    pub kvk: BTreeSet<String>,
}

impl RegIds {
    pub fn is_empty(&self) -> bool {
        self.siren.is_empty() && self.siret.is_empty() && self.vat.is_empty() && self.kvk.is_empty()
    }

    pub fn extend(&mut self, other: RegIds) {
        self.siren.extend(other.siren);
        self.siret.extend(other.siret);
        self.vat.extend(other.vat);
        self.kvk.extend(other.kvk);
    }

    /// Every identifier across all four schemes, sorted.
    pub fn all_sorted(&self) -> Vec<String> {
        let mut all: BTreeSet<&String> = BTreeSet::new();
        all.extend(&self.siren);
        all.extend(&self.siret);
        all.extend(&self.vat);
        all.extend(&self.kvk);
        all.into_iter().cloned().collect()
    }
}

fn digits_only(s: &str) -> String {
    s.chars().filter(char::is_ascii_digit).collect()
}

/// Standard mod-10 check: double every other digit right-to-left.
pub fn luhn_check(number: &str) -> bool {
    let digits: Vec<u32> = number.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.is_empty() {
        return false;
    }
    let parity = digits.len() % 2;
    let checksum: u32 = digits
        .iter()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == parity {
                let d2 = d * 2;
                if d2 > 9 { d2 - 9 } else { d2 }
            } else {
                d
            }
        })
        .sum();
    checksum % 10 == 0
}

/// Pull registration identifiers out of free-form page text.
///
/// Labelled matches (keyword within 20 non-digit chars of the number)
/// take priority; bare digit-group fallbacks apply to SIREN/SIRET only.
/// Any SIRET carries its SIREN in the first nine digits.
pub fn extract_reg_ids(text: &str) -> RegIds {
    let mut out = RegIds::default();
    if text.is_empty() {
        return out;
    }
    let tnorm = text.replace(['\u{00A0}', '\u{202F}'], " ");

    for caps in SIRET_RE.captures_iter(&tnorm).chain(SIRET_FB.captures_iter(&tnorm)) {
        let d = digits_only(&caps[1]);
        if d.len() == 14 && luhn_check(&d[..9]) {
            out.siret.insert(d);
        }
    }
    for caps in SIREN_RE.captures_iter(&tnorm).chain(SIREN_FB.captures_iter(&tnorm)) {
        let d = digits_only(&caps[1]);
        if d.len() == 9 && luhn_check(&d) {
            out.siren.insert(d);
        }
    }
    if !out.siret.is_empty() && out.siren.is_empty() {
        let derived: Vec<String> = out
            .siret
            .iter()
            .map(|siret| siret[..9].to_owned())
            .filter(|s9| luhn_check(s9))
            .collect();
        out.siren.extend(derived);
    }
    for caps in VAT_RE.captures_iter(&tnorm) {
        out.vat.insert(caps[1].trim().to_uppercase());
    }
    for caps in KVK_RE.captures_iter(&tnorm) {
        out.kvk.insert(digits_only(&caps[1]));
    }
    out
}

/// Identifiers the input row claims, taken from exactly-named context
/// columns. An expected SIRET also registers its embedded SIREN.
pub fn expected_from_context(ctx: &[(&str, &str)]) -> RegIds {
    let mut exp = RegIds::default();
    for (k, v) in ctx {
        let kl = k.to_lowercase();
        let vs = v.trim();
        if vs.is_empty() {
            continue;
        }
        match kl.as_str() {
            "siren" => {
                let d = digits_only(vs);
                if d.len() == 9 {
                    exp.siren.insert(d);
                }
            }
            "siret" => {
                let d = digits_only(vs);
                if d.len() == 14 {
                    exp.siret.insert(d.clone());
                }
                if d.len() >= 9 {
                    exp.siren.insert(d[..9].to_owned());
                }
            }
            "vat" | "vat id" => {
                exp.vat.insert(vs.to_uppercase());
            }
            "kvk" | "kvk number" => {
                let d = digits_only(vs);
                if d.len() >= 6 {
                    exp.kvk.insert(d);
                }
            }
            _ => {}
        }
    }
    exp
}

/// True when any expected identifier lines up with a found one: exact
/// SIREN/SIRET matches, a SIREN embedded in a SIRET on either side, or a
/// VAT/KvK substring relation.
pub fn registration_match(expected: &RegIds, found: &RegIds) -> bool {
    if expected.siren.intersection(&found.siren).next().is_some() {
        return true;
    }
    if expected.siret.intersection(&found.siret).next().is_some() {
        return true;
    }
    if expected
        .siren
        .iter()
        .any(|s| found.siret.iter().any(|siret| *s == siret[..9]))
    {
        return true;
    }
    if expected
        .siret
        .iter()
        .any(|siret| found.siren.iter().any(|s| *s == siret[..9]))
    {
        return true;
    }
    if expected
        .vat
        .iter()
        .any(|v| v.len() >= 8 && found.vat.iter().any(|f| f.contains(v.as_str()) || v.contains(f.as_str())))
    {
        return true;
    }
    expected
        .kvk
        .iter()
        .any(|k| found.kvk.iter().any(|f| f.contains(k.as_str()) || k.contains(f.as_str())))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::valid_siren("732829320", true)]
    #[case::invalid("123456789", false)]
    #[case::empty("", false)]
    #[case::non_digits("abc", false)]
    fn test_luhn_check(#[case] input: &str, #[case] expected: bool) {
        assert_eq!(luhn_check(input), expected);
    }

    #[test]
    fn test_luhn_stable_on_recomputed_check_digit() {
        // Appending the recomputed check digit to a valid number's payload
        // reproduces the same valid number.
        let valid = "732829320";
        let payload = &valid[..8];
        let check = (0..10)
            .map(|d| format!("{payload}{d}"))
            .find(|n| luhn_check(n))
            .unwrap();
        assert_eq!(check, valid);
    }

    #[rstest]
    #[case::labelled("SIREN 732 829 320", "732829320")]
    #[case::nbsp("SIREN\u{00A0}732\u{00A0}829\u{00A0}320", "732829320")]
    #[case::nnbsp("siren 732\u{202F}829\u{202F}320", "732829320")]
    #[case::bare_fallback("capital: 732 829 320 rcs paris", "732829320")]
    fn test_extract_siren(#[case] text: &str, #[case] expected: &str) {
        let ids = extract_reg_ids(text);
        assert!(ids.siren.contains(expected), "{ids:?}");
    }

    #[test]
    fn test_extract_rejects_luhn_invalid() {
        let ids = extract_reg_ids("SIREN 123 456 789");
        assert!(ids.siren.is_empty());
    }

    #[test]
    fn test_extract_siret_derives_siren() {
        // 73282932000074 is the establishment of SIREN 732829320.
        let ids = extract_reg_ids("SIRET 732 829 320 00074");
        assert!(ids.siret.contains("73282932000074"));
        assert!(ids.siren.contains("732829320"));
    }

    #[rstest]
    #[case::vat("TVA: FR40303265045", "FR40303265045")]
    #[case::lowercase("vat fr40303265045", "FR40303265045")]
    fn test_extract_vat(#[case] text: &str, #[case] expected: &str) {
        let ids = extract_reg_ids(text);
        assert!(ids.vat.contains(expected), "{ids:?}");
    }

    #[test]
    fn test_extract_kvk() {
        let ids = extract_reg_ids("KvK nummer: 12345678");
        assert!(ids.kvk.contains("12345678"));
    }

    #[test]
    fn test_expected_from_context() {
        let exp = expected_from_context(&[
            ("siren", "732 829 320"),
            ("siret", "73282932000074"),
            ("vat id", "fr40303265045"),
            ("kvk", "12345678"),
            ("country", "France"),
        ]);
        assert!(exp.siren.contains("732829320"));
        assert!(exp.siret.contains("73282932000074"));
        assert!(exp.vat.contains("FR40303265045"));
        assert!(exp.kvk.contains("12345678"));
    }

    fn with_siren(s: &str) -> RegIds {
        let mut ids = RegIds::default();
        ids.siren.insert(s.to_owned());
        ids
    }

    #[test]
    fn test_registration_match_siren_exact() {
        assert!(registration_match(
            &with_siren("732829320"),
            &with_siren("732829320")
        ));
        assert!(!registration_match(
            &with_siren("732829320"),
            &with_siren("552100554")
        ));
    }

    #[test]
    fn test_registration_match_siren_in_found_siret() {
        let expected = with_siren("732829320");
        let mut found = RegIds::default();
        found.siret.insert("73282932000074".to_owned());
        assert!(registration_match(&expected, &found));
    }

    #[rstest]
    #[case::substring("FR40303265045", "40303265045", true)]
    #[case::reverse("40303265045", "FR40303265045", true)]
    #[case::too_short("FR403", "FR40303265045", false)]
    fn test_registration_match_vat(#[case] exp: &str, #[case] fnd: &str, #[case] expected: bool) {
        let mut expected_ids = RegIds::default();
        expected_ids.vat.insert(exp.to_owned());
        let mut found_ids = RegIds::default();
        found_ids.vat.insert(fnd.to_owned());
        assert_eq!(registration_match(&expected_ids, &found_ids), expected);
    }

    #[test]
    fn test_all_sorted_joins_schemes() {
        let mut ids = RegIds::default();
        ids.siren.insert("732829320".to_owned());
        ids.vat.insert("FR40303265045".to_owned());
        assert_eq!(ids.all_sorted(), vec!["732829320", "FR40303265045"]);
    }
}
