use rand::prelude::SliceRandom;
use rand::Rng;

///
/// A helper `struct` for shuffling and creating minibatch indexes;
/// after `shuffle_minibatch` is called, `chunks` partition positions
/// `0 .. size()` into batches of `batch_size` (the last may be short).
///
pub struct Minibatches {
    pub samples: Vec<usize>,
    pub chunks: Vec<Vec<usize>>,
}

impl Minibatches {
    pub fn new(size: usize) -> Self {
        Self {
            samples: (0..size).collect(),
            chunks: vec![],
        }
    }

    pub fn shuffle_minibatch<R: Rng>(&mut self, batch_size: usize, rng: &mut R) {
        let batch_size = batch_size.max(1);
        self.samples.shuffle(rng);
        self.chunks = self
            .samples
            .chunks(batch_size)
            .map(|c| c.to_vec())
            .collect();
    }

    pub fn num_minibatch(&self) -> usize {
        self.chunks.len()
    }

    pub fn size(&self) -> usize {
        self.samples.len()
    }
}
