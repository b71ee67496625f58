//! Schema inspection against the registry, and manual SQL application.

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use sqlx::Row;

use p8_config::Settings;
use p8_store::registry::tables;
use p8_store::Db;

#[derive(Debug, Subcommand)]
pub enum DbCommands {
    /// Compare the live schema against the table registry.
    Diff,
    /// Apply a SQL file statement-by-statement.
    Apply {
        file: std::path::PathBuf,
        #[arg(long)]
        dry_run: bool,
    },
}

pub async fn run(settings: Settings, command: DbCommands) -> Result<()> {
    let db = Db::connect(
        &settings.database.url,
        settings.database.pool_min,
        settings.database.pool_max,
    )
    .await
    .context("connecting to the database")?;

    match command {
        DbCommands::Diff => diff(&db).await,
        DbCommands::Apply { file, dry_run } => apply(&db, &file, dry_run).await,
    }
}

/// Registry-driven drift check: every canonical table and column must exist.
/// Extra columns are reported but not fatal.
async fn diff(db: &Db) -> Result<()> {
    let mut missing = 0;

    for spec in tables() {
        let rows = sqlx::query(
            "SELECT column_name FROM information_schema.columns \
             WHERE table_schema = 'public' AND table_name = $1",
        )
        .bind(spec.table)
        .fetch_all(db.pool())
        .await?;

        if rows.is_empty() {
            println!("MISSING TABLE {}", spec.table);
            missing += 1;
            continue;
        }

        let live: Vec<String> = rows
            .iter()
            .map(|r| r.get::<String, _>("column_name"))
            .collect();
        for column in spec.all_columns() {
            if !live.iter().any(|c| c == column.name) {
                println!("MISSING COLUMN {}.{}", spec.table, column.name);
                missing += 1;
            }
        }
    }

    if missing == 0 {
        println!("schema matches the registry");
        Ok(())
    } else {
        bail!("{missing} difference(s); run `p8 migrate`");
    }
}

async fn apply(db: &Db, file: &std::path::Path, dry_run: bool) -> Result<()> {
    let sql = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;

    let statements = split_sql(&sql);
    println!("{} statement(s) in {}", statements.len(), file.display());
    if dry_run {
        for (i, statement) in statements.iter().enumerate() {
            let preview: String = statement.chars().take(80).collect();
            println!("[{i}] {preview}...");
        }
        return Ok(());
    }

    for statement in &statements {
        sqlx::raw_sql(statement).execute(db.pool()).await?;
    }
    println!("applied");
    Ok(())
}

/// Split on semicolons outside of dollar-quoted bodies, so plpgsql function
/// definitions survive.
fn split_sql(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut in_dollar = false;

    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'$') {
            chars.next();
            current.push_str("$$");
            in_dollar = !in_dollar;
            continue;
        }
        if c == ';' && !in_dollar {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                statements.push(trimmed.to_string());
            }
            current.clear();
            continue;
        }
        current.push(c);
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        statements.push(trimmed.to_string());
    }
    statements
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_plain_statements() {
        let parts = split_sql("SELECT 1; SELECT 2;");
        assert_eq!(parts, vec!["SELECT 1", "SELECT 2"]);
    }

    #[test]
    fn keeps_dollar_quoted_bodies_whole() {
        let sql = "CREATE FUNCTION f() RETURNS void AS $$ BEGIN PERFORM 1; END; $$ LANGUAGE plpgsql; SELECT 3;";
        let parts = split_sql(sql);
        assert_eq!(parts.len(), 2);
        assert!(parts[0].contains("PERFORM 1; END;"));
        assert_eq!(parts[1], "SELECT 3");
    }
}
