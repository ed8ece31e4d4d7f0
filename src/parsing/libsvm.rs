use super::{Dataset, Example};
use crate::error::{CtrError, Result};
use rayon::prelude::*;
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// Parse a value, naming the offending token on failure
fn parse_token<T: FromStr>(token: &str) -> std::result::Result<T, String> {
    T::from_str(token).map_err(|_| format!("invalid token '{}'", token))
}

/// Parse a line of the form `<label> <id>:<val> <id>:<val> ...`
/// The label is positive iff it equals 1
fn parse_dataset_line(line: &str, feature_size: usize) -> std::result::Result<Example, String> {
    let mut tokens = line.split_whitespace();

    let label: f64 = parse_token(tokens.next().ok_or("empty line")?)?;
    let mut feat_ids = vec![];
    let mut feat_vals = vec![];

    for token in tokens {
        let (id, val) = token
            .split_once(':')
            .ok_or_else(|| format!("expected <id>:<val>, found '{}'", token))?;
        let id: usize = parse_token(id)?;

        if id >= feature_size {
            return Err(format!(
                "feature id {} out of range (feature size {})",
                id, feature_size
            ));
        }

        feat_ids.push(id);
        feat_vals.push(parse_token(val)?);
    }

    Ok(Example {
        feat_ids,
        feat_vals,
        label: if label == 1f64 { 1f64 } else { 0f64 },
    })
}

/// Parse a LIBSVM file. The first line is a header and is skipped
pub fn parse_dataset(path: &Path, feature_size: usize) -> Result<Dataset> {
    let contents = fs::read_to_string(path)?;
    let lines: Vec<(usize, &str)> = contents
        .lines()
        .enumerate()
        .skip(1)
        .filter(|(_, line)| !line.trim().is_empty())
        .collect();

    let examples = lines
        .par_iter()
        .map(|(idx, line)| {
            parse_dataset_line(line, feature_size).map_err(|message| CtrError::Parse {
                path: path.display().to_string(),
                line: idx + 1,
                message,
            })
        })
        .collect::<Result<Vec<Example>>>()?;

    Ok(Dataset::from_examples(examples))
}
