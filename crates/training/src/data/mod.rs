use candle_core::{Device, Tensor};
use datasets::{Dataset, Preprocessor};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::TrainingError;

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// One mini-batch: `[batch, seq_len]` token ids and `[batch]` class labels.
#[derive(Debug, Clone)]
pub struct Batch {
    pub inputs: Tensor,
    pub labels: Tensor,
}

impl Batch {
    pub fn new(inputs: Tensor, labels: Tensor) -> Self {
        Self { inputs, labels }
    }

    pub fn len(&self) -> usize {
        self.labels.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            inputs: self.inputs.to_device(device).map_err(to_runtime_error)?,
            labels: self.labels.to_device(device).map_err(to_runtime_error)?,
        })
    }
}

pub type BatchIter<'a> = Box<dyn Iterator<Item = Result<Batch>> + 'a>;

/// Finite, restartable sequence of batches.
pub trait BatchSource {
    /// Starts a fresh pass for `epoch`. Shuffling sources derive their order
    /// from the epoch index so a resumed run sees the same order.
    fn iter_epoch(&mut self, epoch: usize) -> Result<BatchIter<'_>>;
}

impl BatchSource for Vec<Batch> {
    fn iter_epoch(&mut self, _epoch: usize) -> Result<BatchIter<'_>> {
        Ok(Box::new(self.iter().cloned().map(Ok)))
    }
}

impl<S: BatchSource + ?Sized> BatchSource for &mut S {
    fn iter_epoch(&mut self, epoch: usize) -> Result<BatchIter<'_>> {
        (**self).iter_epoch(epoch)
    }
}

#[derive(Debug, Clone)]
pub struct LoaderOptions {
    pub batch_size: usize,
    /// Reshuffle every epoch from `seed + epoch`; `None` keeps file order.
    pub shuffle_seed: Option<u64>,
    pub device: Device,
}

/// Batches a dataset after running every record through a preprocessor once.
pub struct DatasetLoader {
    sequences: Vec<Vec<u32>>,
    labels: Vec<u32>,
    seq_len: usize,
    options: LoaderOptions,
}

impl DatasetLoader {
    pub fn new<D, P>(dataset: &D, preprocessor: &P, options: LoaderOptions) -> Result<Self>
    where
        D: Dataset + ?Sized,
        P: Preprocessor + ?Sized,
    {
        if options.batch_size == 0 {
            return Err(TrainingError::initialization(
                "batch_size must be greater than 0",
            ));
        }
        let seq_len = preprocessor.max_len();
        let mut sequences = Vec::with_capacity(dataset.len());
        let mut labels = Vec::with_capacity(dataset.len());
        for index in 0..dataset.len() {
            let (input, label) = dataset.get(index)?;
            let ids = preprocessor.encode(&input)?;
            if ids.len() != seq_len {
                return Err(TrainingError::runtime(format!(
                    "record {index} encoded to {} ids, expected {seq_len}",
                    ids.len()
                )));
            }
            sequences.push(ids);
            labels.push(label);
        }
        tracing::debug!(records = sequences.len(), seq_len, "encoded dataset");

        Ok(Self {
            sequences,
            labels,
            seq_len,
            options,
        })
    }

    pub fn num_records(&self) -> usize {
        self.labels.len()
    }

    pub fn num_batches(&self) -> usize {
        self.labels.len().div_ceil(self.options.batch_size)
    }

    fn epoch_order(&self, epoch: usize) -> Vec<usize> {
        let mut order = (0..self.labels.len()).collect::<Vec<_>>();
        if let Some(seed) = self.options.shuffle_seed {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        order
    }

    fn build_batch(&self, indices: &[usize]) -> Result<Batch> {
        let mut ids = Vec::with_capacity(indices.len() * self.seq_len);
        let mut labels = Vec::with_capacity(indices.len());
        for &index in indices {
            ids.extend_from_slice(&self.sequences[index]);
            labels.push(self.labels[index]);
        }
        let device = &self.options.device;
        let inputs = Tensor::from_vec(ids, (indices.len(), self.seq_len), device)
            .map_err(to_runtime_error)?;
        let labels = Tensor::from_vec(labels, indices.len(), device).map_err(to_runtime_error)?;
        Ok(Batch { inputs, labels })
    }
}

impl BatchSource for DatasetLoader {
    fn iter_epoch(&mut self, epoch: usize) -> Result<BatchIter<'_>> {
        let order = self.epoch_order(epoch);
        let batch_size = self.options.batch_size;
        let this = &*self;
        Ok(Box::new(
            (0..this.num_batches()).map(move |b| {
                let end = ((b + 1) * batch_size).min(order.len());
                this.build_batch(&order[b * batch_size..end])
            }),
        ))
    }
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use datasets::{LabelMapper, RawInput};

    struct Numbers(Vec<u32>, LabelMapper);

    impl Dataset for Numbers {
        fn len(&self) -> usize {
            self.0.len()
        }

        fn get(&self, index: usize) -> datasets::Result<(RawInput, u32)> {
            Ok((RawInput::Single(self.0[index].to_string()), self.0[index] % 2))
        }

        fn label_mapper(&self) -> &LabelMapper {
            &self.1
        }
    }

    struct Repeat;

    impl Preprocessor for Repeat {
        fn encode(&self, input: &RawInput) -> datasets::Result<Vec<u32>> {
            let RawInput::Single(text) = input else {
                unreachable!()
            };
            let value: u32 = text.parse().unwrap();
            Ok(vec![value; 4])
        }

        fn max_len(&self) -> usize {
            4
        }

        fn pad_token_id(&self) -> u32 {
            0
        }
    }

    fn loader(seed: Option<u64>) -> DatasetLoader {
        let dataset = Numbers((0..10).collect(), LabelMapper::imdb());
        DatasetLoader::new(
            &dataset,
            &Repeat,
            LoaderOptions {
                batch_size: 4,
                shuffle_seed: seed,
                device: Device::Cpu,
            },
        )
        .unwrap()
    }

    fn first_column(source: &mut DatasetLoader, epoch: usize) -> Vec<u32> {
        source
            .iter_epoch(epoch)
            .unwrap()
            .flat_map(|batch| {
                let batch = batch.unwrap();
                batch
                    .inputs
                    .to_vec2::<u32>()
                    .unwrap()
                    .into_iter()
                    .map(|row| row[0])
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    #[test]
    fn fixed_order_keeps_records_and_trailing_batch() {
        let mut source = loader(None);
        assert_eq!(source.num_batches(), 3);

        let batches = source
            .iter_epoch(0)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(
            batches.iter().map(Batch::len).collect::<Vec<_>>(),
            vec![4, 4, 2]
        );
        assert_eq!(batches[0].inputs.dims(), &[4, 4]);
        assert_eq!(
            batches[2].labels.to_vec1::<u32>().unwrap(),
            vec![0, 1]
        );
        assert_eq!(first_column(&mut source, 1), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn shuffle_is_deterministic_per_epoch() {
        let mut a = loader(Some(7));
        let mut b = loader(Some(7));

        let epoch0 = first_column(&mut a, 0);
        assert_eq!(epoch0, first_column(&mut b, 0));
        assert_ne!(epoch0, first_column(&mut a, 1));

        let mut sorted = epoch0.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..10).collect::<Vec<_>>());
    }
}
