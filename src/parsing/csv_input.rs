use super::schema::FeatureSchema;
use super::{Dataset, Example};
use crate::error::{CtrError, Result};
use rayon::prelude::*;
use std::path::Path;

/// Parse a CSV file with a header row. Columns must follow the schema order
pub fn parse_dataset(path: &Path, schema: &FeatureSchema) -> Result<Dataset> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;

    let records = reader.records().collect::<std::result::Result<Vec<_>, _>>()?;

    let examples = records
        .par_iter()
        .map(|record| {
            let cells: Vec<&str> = record.iter().collect();

            schema.encode(&cells).map_err(|message| CtrError::Parse {
                path: path.display().to_string(),
                line: record.position().map_or(0, |pos| pos.line() as usize),
                message,
            })
        })
        .collect::<Result<Vec<Example>>>()?;

    Ok(Dataset::from_examples(examples))
}
