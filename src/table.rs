use crate::error::EnrichError;

/// Column names that identify the company column outright.
const COMPANY_COL_CANDIDATES: &[&str] = &[
    "company name",
    "company",
    "organisation",
    "organization",
    "entreprise",
    "nom entreprise",
    "raison sociale",
];

// Context buckets. Detection is by substring against the union; each
// consumer re-checks the exact bucket it cares about.
pub const CTX_LOCATION: &[&str] = &[
    "country", "pays", "country_code", "iso2", "location", "city", "ville", "region", "state",
    "province",
];
pub const CTX_DESCRIPTION: &[&str] = &["description", "about", "bio", "summary", "notes"];
pub const CTX_SECTOR: &[&str] = &["industry", "sector", "secteur", "naics", "sic"];
pub const CTX_SOCIALS: &[&str] = &[
    "website", "site web", "url", "domain", "homepage", "linkedin", "linkedin url", "profile",
    "company url",
];
pub const CTX_REG: &[&str] = &["siren", "siret", "vat", "vat id", "kvk", "kvk number"];

/// Auxiliary columns the enrichment writes. `URL` itself is ensured first.
pub const OUTPUT_COLUMNS: &[&str] = &[
    "URL_confidence_score",
    "URL_ambiguity",
    "URL_cand_count",
    "URL_reg_match",
    "URL_reg_ids_found",
    "URL_debug",
    "URL_found_domain",
];

/// An ordered table of string cells. Rows always have exactly one cell
/// per column.
#[derive(Debug, Clone, Default)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        let mut table = Self { columns, rows };
        let width = table.columns.len();
        for row in &mut table.rows {
            row.resize(width, String::new());
        }
        table
    }

    pub fn col_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Index of `name`, appending the column (with empty cells) if absent.
    pub fn ensure_column(&mut self, name: &str) -> usize {
        if let Some(idx) = self.col_index(name) {
            return idx;
        }
        self.columns.push(name.to_owned());
        for row in &mut self.rows {
            row.push(String::new());
        }
        self.columns.len() - 1
    }

    pub fn cell(&self, row: usize, col: usize) -> &str {
        self.rows[row][col].as_str()
    }

    pub fn set_cell(&mut self, row: usize, col: usize, value: impl Into<String>) {
        self.rows[row][col] = value.into();
    }
}

/// Resolved once per batch: which column names the company, which carry
/// context.
#[derive(Debug, Clone)]
pub struct ColumnRoles {
    pub company: usize,
    pub context: Vec<usize>,
}

impl ColumnRoles {
    /// Resolve the company and context columns, failing before any I/O
    /// when no company column exists.
    pub fn resolve(table: &Table) -> Result<Self, EnrichError> {
        Ok(Self {
            company: find_company_col(table)?,
            context: detect_context_columns(table),
        })
    }

    /// Context key/value pairs for one row, in column order, keeping only
    /// cells with content.
    pub fn context_of<'a>(&self, table: &'a Table, row: usize) -> Vec<(&'a str, &'a str)> {
        self.context
            .iter()
            .map(|&c| (table.columns[c].as_str(), table.cell(row, c)))
            .filter(|(_, v)| !v.trim().is_empty())
            .collect()
    }
}

fn find_company_col(table: &Table) -> Result<usize, EnrichError> {
    for cand in COMPANY_COL_CANDIDATES {
        if let Some(idx) = table
            .columns
            .iter()
            .position(|c| c.to_lowercase() == *cand)
        {
            return Ok(idx);
        }
    }
    table
        .columns
        .iter()
        .position(|c| {
            let lc = c.to_lowercase();
            lc.contains("company") || lc.contains("entreprise") || lc.contains("raison")
        })
        .ok_or(EnrichError::NoCompanyColumn)
}

fn detect_context_columns(table: &Table) -> Vec<usize> {
    table
        .columns
        .iter()
        .enumerate()
        .filter(|(_, c)| {
            let cl = c.to_lowercase().trim().to_owned();
            CTX_LOCATION
                .iter()
                .chain(CTX_DESCRIPTION)
                .chain(CTX_SECTOR)
                .chain(CTX_SOCIALS)
                .chain(CTX_REG)
                .any(|k| cl.contains(k))
        })
        .map(|(i, _)| i)
        .collect()
}

/// Make sure `URL` and every auxiliary column exist.
pub fn ensure_output_columns(table: &mut Table) {
    table.ensure_column("URL");
    for col in OUTPUT_COLUMNS {
        table.ensure_column(col);
    }
}

/// A cell value for prompting and query synthesis: trimmed, with the
/// spreadsheet placeholders `nan`/`none`/`null` treated as empty.
pub fn safe_cell(v: &str) -> &str {
    let s = v.trim();
    if s.is_empty() || ["nan", "none", "null"].contains(&s.to_lowercase().as_str()) {
        ""
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn table(columns: &[&str]) -> Table {
        Table::new(columns.iter().map(|&c| c.to_owned()).collect(), vec![])
    }

    #[rstest]
    #[case::exact(vec!["id", "Company Name", "country"], 1)]
    #[case::french(vec!["id", "raison sociale"], 1)]
    #[case::substring(vec!["id", "companyName"], 1)]
    #[case::first_wins(vec!["company", "organisation"], 0)]
    fn test_find_company_col(#[case] columns: Vec<&str>, #[case] expected: usize) {
        assert_eq!(find_company_col(&table(&columns)).unwrap(), expected);
    }

    #[test]
    fn test_find_company_col_missing() {
        let t = table(&["id", "address"]);
        assert!(matches!(
            find_company_col(&t),
            Err(EnrichError::NoCompanyColumn)
        ));
    }

    #[test]
    fn test_detect_context_columns() {
        let t = table(&["company", "Country", "linkedinDescription", "siren", "misc"]);
        assert_eq!(detect_context_columns(&t), vec![1, 2, 3]);
    }

    #[test]
    fn test_ensure_output_columns() {
        let mut t = Table::new(
            vec!["company".into()],
            vec![vec!["Acme".into()], vec!["Globex".into()]],
        );
        ensure_output_columns(&mut t);
        assert_eq!(t.columns.len(), 2 + OUTPUT_COLUMNS.len());
        assert!(t.rows.iter().all(|r| r.len() == t.columns.len()));
        // Idempotent.
        ensure_output_columns(&mut t);
        assert_eq!(t.columns.len(), 2 + OUTPUT_COLUMNS.len());
    }

    #[rstest]
    #[case::plain("Acme", "Acme")]
    #[case::padded("  Acme  ", "Acme")]
    #[case::nan("NaN", "")]
    #[case::none("None", "")]
    #[case::null("null", "")]
    #[case::empty("   ", "")]
    fn test_safe_cell(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(safe_cell(input), expected);
    }

    #[test]
    fn test_context_of_skips_empty_cells() {
        let mut t = Table::new(
            vec!["company".into(), "country".into(), "sector".into()],
            vec![vec!["Acme".into(), "France".into(), "  ".into()]],
        );
        let roles = ColumnRoles::resolve(&t).unwrap();
        ensure_output_columns(&mut t);
        assert_eq!(roles.context_of(&t, 0), vec![("country", "France")]);
    }
}
