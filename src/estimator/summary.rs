use crate::error::Result;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::path::Path;

const SUMMARY_FILE: &str = "summaries.csv";

#[derive(Serialize)]
struct SummaryRow<'a> {
    step: u64,
    tag: &'a str,
    value: f64,
}

/// Appends `step,tag,value` rows to `<dir>/summaries.csv`
pub struct SummaryWriter {
    writer: csv::Writer<File>,
}

impl SummaryWriter {
    pub fn create(dir: &Path) -> Result<SummaryWriter> {
        fs::create_dir_all(dir)?;
        let path = dir.join(SUMMARY_FILE);
        let is_new = !path.exists();

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let writer = csv::WriterBuilder::new()
            .has_headers(is_new)
            .from_writer(file);

        Ok(SummaryWriter { writer })
    }

    pub fn scalar(&mut self, step: u64, tag: &str, value: f64) -> Result<()> {
        self.writer.serialize(SummaryRow { step, tag, value })?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
