use crate::models::BatchRecord;
use camino::Utf8Path;
use indexmap::IndexMap;
use std::fs;
use thiserror::Error;

/// Column holding the record identifier.
pub const ID_COLUMN: &str = "ID";

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("Data file not found: {0}")]
    NotFound(String),

    #[error("Failed to read {path}: {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },

    #[error("Failed to read mappings {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid mappings in {path}: {source}")]
    Mappings {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Column name → entity name.
pub type EntityMappings = IndexMap<String, String>;

/// Read a JSON object mapping data columns to template entities.
pub fn load_mappings(path: &Utf8Path) -> Result<EntityMappings, RecordError> {
    let contents = fs::read_to_string(path).map_err(|source| RecordError::Io {
        path: path.to_string(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| RecordError::Mappings {
        path: path.to_string(),
        source,
    })
}

/// Read batch records from a CSV file with a header row.
///
/// The `ID` column becomes the record id (`Row <n>` when absent or blank).
/// Without `mappings` every other column maps to the entity of the same
/// name; with them only mapped columns are used. Empty cells are skipped.
pub fn load_records_csv(
    path: &Utf8Path,
    mappings: Option<&EntityMappings>,
) -> Result<Vec<BatchRecord>, RecordError> {
    if !path.exists() {
        tracing::error!("Data file not found: {}", path);
        return Err(RecordError::NotFound(path.to_string()));
    }

    let csv_error = |source: csv::Error| RecordError::Csv {
        path: path.to_string(),
        source,
    };

    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .map_err(csv_error)?;
    let headers = reader.headers().map_err(csv_error)?.clone();

    let mut records = Vec::new();
    for (row, result) in reader.records().enumerate() {
        let row_values = result.map_err(csv_error)?;
        let mut record = BatchRecord::new();

        for (column, value) in headers.iter().zip(row_values.iter()) {
            if column == ID_COLUMN {
                if !value.is_empty() {
                    record.id = Some(value.to_string());
                }
                continue;
            }
            if value.is_empty() {
                continue;
            }

            let entity = match mappings {
                Some(mappings) => match mappings.get(column) {
                    Some(entity) => entity.as_str(),
                    None => continue,
                },
                None => column,
            };
            record.fields.insert(entity.to_string(), value.to_string());
        }

        if record.id.is_none() {
            record.id = Some(format!("Row {}", row + 1));
        }
        records.push(record);
    }

    tracing::info!("Loaded {} records from {}", records.len(), path);
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, contents: &str) -> Utf8PathBuf {
        let path = Utf8PathBuf::try_from(dir.path().join(name)).unwrap();
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_load_records_with_ids() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "data.csv",
            "ID,Serial,Date\nA-1,001,2024-01-01\n,002,\n",
        );

        let records = load_records_csv(&path, None).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id.as_deref(), Some("A-1"));
        assert_eq!(records[0].fields["Serial"], "001");
        assert_eq!(records[1].id.as_deref(), Some("Row 2"));
        assert!(!records[1].fields.contains_key("Date"));
    }

    #[test]
    fn test_load_records_with_mappings() {
        let dir = TempDir::new().unwrap();
        let data = write_file(&dir, "data.csv", "Serial,Comment\n001,ignored\n");
        let mappings_path = write_file(&dir, "map.json", r#"{"Serial": "Text1"}"#);

        let mappings = load_mappings(&mappings_path).unwrap();
        let records = load_records_csv(&data, Some(&mappings)).unwrap();

        assert_eq!(records[0].fields.len(), 1);
        assert_eq!(records[0].fields["Text1"], "001");
    }

    #[test]
    fn test_missing_data_file() {
        let result = load_records_csv(Utf8Path::new("missing.csv"), None);
        assert!(matches!(result, Err(RecordError::NotFound(_))));
    }

    #[test]
    fn test_invalid_mappings() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "map.json", "[1, 2]");
        assert!(matches!(
            load_mappings(&path),
            Err(RecordError::Mappings { .. })
        ));
    }
}
