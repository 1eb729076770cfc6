use std::path::Path;
use std::sync::Arc;

use clap::CommandFactory;
pub use clap::Parser;
use firmsite::cli::{Cli, header, print_completions};
use firmsite::{Config, ProgressFn, Table, enrich};
use owo_colors::OwoColorize;
use tracing::Level;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let Cli {
        input,
        output,
        verbose,
        completion,
    } = Cli::parse();

    if let Some(shell) = completion {
        print_completions(shell, &mut Cli::command());
        return Ok(());
    }

    let level = if verbose { Level::INFO } else { Level::WARN };
    tracing_subscriber::fmt().with_max_level(level).init();

    dotenvy::dotenv().ok();
    let cfg = Config::from_env()?;

    // input is None only if completion is provided,
    // which is already handled above, so we can safely unwrap
    let input = input.unwrap();
    let table = read_table(&input)?;

    println!("{}", header());
    println!(
        "{} {}",
        "[-] Resolving official domains for".blue(),
        input.display().to_string().blue()
    );

    let progress: ProgressFn = Arc::new(|current, total, message| {
        println!("{} {message}", format!("[{current}/{total}]").green());
    });
    let table = enrich(cfg, table, Some(progress)).await?;

    let output = output.unwrap_or_else(|| {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        input.with_file_name(format!("{stem}_enriched.csv"))
    });
    write_table(&output, &table)?;

    let resolved = table
        .col_index("URL")
        .map(|url| {
            table
                .rows
                .iter()
                .filter(|r| !r[url].trim().is_empty())
                .count()
        })
        .unwrap_or_default();
    println!(
        "{} {}",
        format!("[-] Resolved {resolved}/{} rows into", table.rows.len()).green(),
        output.display().to_string().green()
    );

    Ok(())
}

fn read_table(path: &Path) -> anyhow::Result<Table> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let columns = reader.headers()?.iter().map(ToOwned::to_owned).collect();
    let mut rows = Vec::new();
    for record in reader.records() {
        rows.push(record?.iter().map(ToOwned::to_owned).collect());
    }
    Ok(Table::new(columns, rows))
}

fn write_table(path: &Path, table: &Table) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(&table.columns)?;
    for row in &table.rows {
        writer.write_record(row)?;
    }
    writer.flush()?;
    Ok(())
}
