use super::Example;

#[derive(Clone, Debug, PartialEq)]
pub enum ColumnKind {
    /// Hashed into `hash_buckets` ids, value 1.0
    Categorical { hash_buckets: usize },
    /// One id, value is the cell divided by `scale`
    Numeric { scale: f64 },
    /// The label column. A row is positive iff the cell equals `positive`
    Target { positive: String },
    Ignore,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
}

impl Column {
    pub fn categorical(name: &str, hash_buckets: usize) -> Column {
        Column {
            name: name.to_string(),
            kind: ColumnKind::Categorical { hash_buckets },
        }
    }

    pub fn numeric(name: &str, scale: f64) -> Column {
        Column {
            name: name.to_string(),
            kind: ColumnKind::Numeric { scale },
        }
    }

    pub fn target(name: &str, positive: &str) -> Column {
        Column {
            name: name.to_string(),
            kind: ColumnKind::Target {
                positive: positive.to_string(),
            },
        }
    }

    pub fn ignore(name: &str) -> Column {
        Column {
            name: name.to_string(),
            kind: ColumnKind::Ignore,
        }
    }

    /// How many feature ids this column occupies
    fn width(&self) -> usize {
        match self.kind {
            ColumnKind::Categorical { hash_buckets } => hash_buckets,
            ColumnKind::Numeric { .. } => 1,
            ColumnKind::Target { .. } | ColumnKind::Ignore => 0,
        }
    }
}

/// Keys of a `tf.train.Example` holding the sparse features and the label
#[derive(Clone, Debug, PartialEq)]
pub struct RecordKeys {
    pub ids: String,
    pub vals: String,
    pub label: String,
}

impl Default for RecordKeys {
    fn default() -> Self {
        RecordKeys {
            ids: "feat_ids".to_string(),
            vals: "feat_vals".to_string(),
            label: "label".to_string(),
        }
    }
}

/// Describes the feature space of a dataset.
/// CSV inputs need `columns`; LIBSVM and TFRecord inputs only need the
/// feature size (and the record keys for TFRecord).
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureSchema {
    pub columns: Vec<Column>,
    pub feature_size: usize,
    pub record_keys: RecordKeys,
}

impl FeatureSchema {
    /// Schema of a delimited file. The feature size is the sum of the column widths
    pub fn delimited(columns: Vec<Column>) -> FeatureSchema {
        let feature_size = columns.iter().map(Column::width).sum();

        FeatureSchema {
            columns,
            feature_size,
            record_keys: RecordKeys::default(),
        }
    }

    /// Schema of a file that already carries feature ids
    pub fn sparse(feature_size: usize) -> FeatureSchema {
        FeatureSchema {
            columns: vec![],
            feature_size,
            record_keys: RecordKeys::default(),
        }
    }

    /// Number of fields an encoded row has
    pub fn num_fields(&self) -> usize {
        self.columns.iter().filter(|c| c.width() > 0).count()
    }

    /// Encode one row of cells (in column order) into an example
    pub fn encode(&self, cells: &[&str]) -> Result<Example, String> {
        if cells.len() != self.columns.len() {
            return Err(format!(
                "expected {} columns, found {}",
                self.columns.len(),
                cells.len()
            ));
        }

        let mut feat_ids = vec![];
        let mut feat_vals = vec![];
        let mut label = None;
        let mut offset = 0;

        for (column, cell) in self.columns.iter().zip(cells) {
            let cell = cell.trim();

            match &column.kind {
                ColumnKind::Categorical { hash_buckets } => {
                    let bucket = (fnv1a(cell) % *hash_buckets as u64) as usize;
                    feat_ids.push(offset + bucket);
                    feat_vals.push(1f64);
                }
                ColumnKind::Numeric { scale } => {
                    // Empty cells take the record default
                    let value = if cell.is_empty() {
                        0f64
                    } else {
                        cell.parse::<f64>().map_err(|_| {
                            format!("column '{}': '{}' is not a number", column.name, cell)
                        })?
                    };
                    feat_ids.push(offset);
                    feat_vals.push(value / scale);
                }
                ColumnKind::Target { positive } => {
                    label = Some(if cell == positive { 1f64 } else { 0f64 });
                }
                ColumnKind::Ignore => {}
            }

            offset += column.width();
        }

        let label = label.ok_or_else(|| "schema has no target column".to_string())?;

        Ok(Example {
            feat_ids,
            feat_vals,
            label,
        })
    }
}

/// 64-bit FNV-1a, stable across runs and platforms
pub fn fnv1a(s: &str) -> u64 {
    let mut hash = 0xcbf29ce484222325u64;

    for byte in s.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }

    hash
}
