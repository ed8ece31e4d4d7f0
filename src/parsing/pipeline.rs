use super::Dataset;
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A slice of at most `batch_size` examples
#[derive(Clone, Debug)]
pub struct Batch {
    pub feat_ids: Array2<usize>,
    pub feat_vals: Array2<f64>,
    pub target: Array1<f64>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.target.len()
    }
}

pub struct InputPipeline<'a> {
    dataset: &'a Dataset,
    batch_size: usize,
    num_epochs: usize,
    shuffle: Option<(usize, StdRng)>,
}

impl<'a> InputPipeline<'a> {
    /// One pass over the dataset in file order
    pub fn new(dataset: &'a Dataset, batch_size: usize) -> InputPipeline<'a> {
        InputPipeline {
            dataset,
            batch_size: batch_size.max(1),
            num_epochs: 1,
            shuffle: None,
        }
    }

    /// Shuffle through a buffer of `buffer_size` examples. Applied before repeat,
    /// so the buffer drains at every epoch boundary
    pub fn shuffle(mut self, buffer_size: usize, seed: u64) -> InputPipeline<'a> {
        self.shuffle = Some((buffer_size.max(1), StdRng::seed_from_u64(seed)));
        self
    }

    pub fn repeat(mut self, num_epochs: usize) -> InputPipeline<'a> {
        self.num_epochs = num_epochs;
        self
    }

    pub fn batches(self) -> Batches<'a> {
        Batches {
            dataset: self.dataset,
            batch_size: self.batch_size,
            indices: IndexStream {
                len: self.dataset.len(),
                epochs_left: self.num_epochs,
                next: 0,
                buffer: vec![],
                shuffle: self.shuffle,
            },
        }
    }
}

/// Yields example indices epoch after epoch
struct IndexStream {
    len: usize,
    epochs_left: usize,
    next: usize,
    buffer: Vec<usize>,
    shuffle: Option<(usize, StdRng)>,
}

impl Iterator for IndexStream {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        loop {
            if self.epochs_left == 0 || self.len == 0 {
                return None;
            }

            match &mut self.shuffle {
                None => {
                    if self.next < self.len {
                        self.next += 1;
                        return Some(self.next - 1);
                    }
                }
                Some((buffer_size, rng)) => {
                    while self.buffer.len() < *buffer_size && self.next < self.len {
                        self.buffer.push(self.next);
                        self.next += 1;
                    }
                    if !self.buffer.is_empty() {
                        let pick = rng.gen_range(0..self.buffer.len());
                        return Some(self.buffer.swap_remove(pick));
                    }
                }
            }

            // Epoch exhausted
            self.epochs_left -= 1;
            self.next = 0;
        }
    }
}

pub struct Batches<'a> {
    dataset: &'a Dataset,
    batch_size: usize,
    indices: IndexStream,
}

impl Iterator for Batches<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        let rows: Vec<usize> = self.indices.by_ref().take(self.batch_size).collect();

        if rows.is_empty() {
            return None;
        }

        Some(Batch {
            feat_ids: self.dataset.feat_ids.select(Axis(0), &rows),
            feat_vals: self.dataset.feat_vals.select(Axis(0), &rows),
            target: self.dataset.target.select(Axis(0), &rows),
        })
    }
}
