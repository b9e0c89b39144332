//! Input data loading.
//!
//! Task input arrives as TSV files with a header row. Columns declared as
//! `json` in the task configuration are parsed into structured values and
//! `bool` columns into booleans; everything else is kept as a string.

use crate::config::DataType;
use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

/// One row of input data keyed by column name.
pub type DataRow = BTreeMap<String, Value>;

/// Load task input data from a TSV file.
///
/// The header row must contain every column named in `columns`; extra
/// columns are kept as strings.
pub fn load_data(path: &Path, columns: &BTreeMap<String, DataType>) -> Result<Vec<DataRow>> {
    info!("Loading data from {}", path.display());

    if path.extension().and_then(|e| e.to_str()) != Some("tsv") {
        bail!("Input data must be a TSV file: {}", path.display());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Could not load the file {}", path.display()))?;

    let mut lines = content.lines();
    let header: Vec<&str> = lines
        .next()
        .ok_or_else(|| anyhow::anyhow!("Data file {} is empty", path.display()))?
        .split('\t')
        .map(str::trim)
        .collect();

    for column in columns.keys() {
        if !header.contains(&column.as_str()) {
            bail!(
                "Data file {} is missing the column '{}' declared in the configuration",
                path.display(),
                column
            );
        }
    }

    let mut rows = Vec::new();
    for (lineno, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }

        let cells: Vec<&str> = line.split('\t').collect();
        if cells.len() != header.len() {
            bail!(
                "Row {} of {} has {} columns, expected {}",
                lineno + 2,
                path.display(),
                cells.len(),
                header.len()
            );
        }

        let mut row = DataRow::new();
        for (name, cell) in header.iter().zip(cells) {
            let value = parse_cell(cell, columns.get(*name)).with_context(|| {
                format!(
                    "Invalid value in column '{}' on row {} of {}",
                    name,
                    lineno + 2,
                    path.display()
                )
            })?;
            row.insert((*name).to_string(), value);
        }
        rows.push(row);
    }

    info!("Successfully loaded {} rows of data from {}", rows.len(), path.display());

    Ok(rows)
}

fn parse_cell(cell: &str, data_type: Option<&DataType>) -> Result<Value> {
    match data_type {
        Some(DataType::Json) => {
            serde_json::from_str(cell).context("column is declared as json")
        }
        Some(DataType::Bool) => match cell.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(Value::Bool(true)),
            "false" | "0" => Ok(Value::Bool(false)),
            other => bail!("expected a boolean, found '{}'", other),
        },
        _ => Ok(Value::String(cell.to_string())),
    }
}

/// Load a worker blocklist: a TSV whose `user_id` column lists workers that
/// must not see any task uploaded or forwarded by the pipeline.
pub fn load_blocklist(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Could not load the blocklist {}", path.display()))?;

    let mut lines = content.lines();
    let header: Vec<&str> = lines
        .next()
        .unwrap_or_default()
        .split('\t')
        .map(str::trim)
        .collect();

    let idx = header
        .iter()
        .position(|c| *c == "user_id")
        .ok_or_else(|| {
            anyhow::anyhow!(
                "Could not find the column 'user_id' in blocklist {}",
                path.display()
            )
        })?;

    let ids = lines
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| line.split('\t').nth(idx))
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect::<Vec<_>>();

    info!("Loaded {} workers from blocklist {}", ids.len(), path.display());

    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_tsv(content: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".tsv").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_data_typed_columns() {
        let file = write_tsv(
            "url\toutlines\tverified\n\
             https://example.com/a.png\t[{\"shape\":\"rectangle\"}]\ttrue\n\
             https://example.com/b.png\t[]\tfalse\n",
        );

        let mut columns = BTreeMap::new();
        columns.insert("url".to_string(), DataType::Url);
        columns.insert("outlines".to_string(), DataType::Json);
        columns.insert("verified".to_string(), DataType::Bool);

        let rows = load_data(file.path(), &columns).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[0].get("url"),
            Some(&Value::String("https://example.com/a.png".to_string()))
        );
        assert!(rows[0].get("outlines").unwrap().is_array());
        assert_eq!(rows[0].get("verified"), Some(&Value::Bool(true)));
        assert_eq!(rows[1].get("verified"), Some(&Value::Bool(false)));
    }

    #[test]
    fn test_load_data_missing_column() {
        let file = write_tsv("url\nhttps://example.com/a.png\n");

        let mut columns = BTreeMap::new();
        columns.insert("text".to_string(), DataType::Str);

        let err = load_data(file.path(), &columns).unwrap_err();
        assert!(err.to_string().contains("missing the column 'text'"));
    }

    #[test]
    fn test_load_data_rejects_non_tsv() {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        file.write_all(b"url\n").unwrap();

        let columns = BTreeMap::new();
        assert!(load_data(file.path(), &columns).is_err());
    }

    #[test]
    fn test_load_blocklist() {
        let file = write_tsv("user_id\treason\nworker-1\tspam\nworker-2\tfast\n");
        let ids = load_blocklist(file.path()).unwrap();
        assert_eq!(ids, vec!["worker-1", "worker-2"]);
    }

    #[test]
    fn test_load_blocklist_requires_user_id() {
        let file = write_tsv("worker\nworker-1\n");
        let err = load_blocklist(file.path()).unwrap_err();
        assert!(err.to_string().contains("user_id"));
    }
}
