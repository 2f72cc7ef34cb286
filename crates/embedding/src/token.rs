//! Learned token embedding lookup.

use std::fmt;
use std::io::{Read, Write};

use layers::serialize::{self as ser, check_field};
use layers::{checks, Layer, LayerError, LayerState, Result, Subnet, Tensor, TensorRng, TensorShape};

const NAME: &str = "embeddings";
const VERSION: &str = "embeddings_";

/// Gathers rows of a `(num_embeddings, embedding_dim)` table.
///
/// The input holds token ids in column 0 of each `(n, k, r)` row, truncated to
/// integers; the output is `(n, k, nr, embedding_dim)`. Ids outside the table
/// produce zero rows. The input is treated as constant: backward only fills
/// the table gradient.
#[derive(Debug, Clone)]
pub struct Embeddings {
    num_embeddings: usize,
    embedding_dim: usize,
    learning_rate_multiplier: f64,
    scale_by_freq: bool,
    params: Tensor,
    freqs: Vec<f32>,
    seed: u64,
    state: LayerState,
}

impl Embeddings {
    pub fn new(num_embeddings: usize, embedding_dim: usize) -> Result<Self> {
        checks::expect_positive(NAME, "num_embeddings", num_embeddings)?;
        checks::expect_positive(NAME, "embedding_dim", embedding_dim)?;
        Ok(Self {
            num_embeddings,
            embedding_dim,
            learning_rate_multiplier: 1.0,
            scale_by_freq: true,
            params: Tensor::new(),
            freqs: Vec::new(),
            seed: layers::rng::DEFAULT_SEED,
            state: LayerState::Uninitialized,
        })
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn num_embeddings(&self) -> usize {
        self.num_embeddings
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    /// Changing the dictionary size is only allowed before the table exists.
    pub fn set_num_embeddings(&mut self, num: usize) -> Result<()> {
        checks::expect_positive(NAME, "num_embeddings", num)?;
        if num != self.num_embeddings && !self.params.is_empty() {
            return Err(LayerError::config(
                NAME,
                "cannot resize the dictionary once the table is allocated",
            ));
        }
        self.num_embeddings = num;
        Ok(())
    }

    pub fn set_embedding_dim(&mut self, dim: usize) -> Result<()> {
        checks::expect_positive(NAME, "embedding_dim", dim)?;
        if dim != self.embedding_dim && !self.params.is_empty() {
            return Err(LayerError::config(
                NAME,
                "cannot change the embedding size once the table is allocated",
            ));
        }
        self.embedding_dim = dim;
        Ok(())
    }

    pub fn learning_rate_multiplier(&self) -> f64 {
        self.learning_rate_multiplier
    }

    pub fn set_learning_rate_multiplier(&mut self, value: f64) {
        self.learning_rate_multiplier = value;
    }

    pub fn scale_by_freq(&self) -> bool {
        self.scale_by_freq
    }

    pub fn set_scale_by_freq(&mut self, value: bool) {
        self.scale_by_freq = value;
    }

    /// The embedding table, one row per token.
    pub fn embeddings(&self) -> &Tensor {
        &self.params
    }

    fn table_shape(&self) -> TensorShape {
        TensorShape::new(self.num_embeddings, self.embedding_dim, 1, 1)
    }

    fn token(&self, value: f32) -> Option<usize> {
        if value >= 0.0 && (value as usize) < self.num_embeddings {
            Some(value as usize)
        } else {
            None
        }
    }

    /// Occurrences of each id in column 0 of `input`.
    fn count_tokens(&mut self, input: &Tensor) {
        self.freqs.clear();
        self.freqs.resize(self.num_embeddings, 0.0);
        let nc = input.nc();
        for row in input.host().chunks(nc) {
            if let Some(t) = self.token(row[0]) {
                self.freqs[t] += 1.0;
            }
        }
    }
}

impl Layer for Embeddings {
    fn name(&self) -> &'static str {
        NAME
    }

    fn state(&self) -> LayerState {
        self.state
    }

    fn setup(&mut self, sub: &dyn Subnet) -> Result<()> {
        checks::expect_non_empty(NAME, sub.output())?;
        let shape = self.table_shape();
        if self.params.is_empty() {
            self.params.set_size(shape);
            TensorRng::new(self.seed).fill_gaussian(self.params.host_mut(), 0.0, 1.0)?;
            log::debug!(
                "embeddings: allocated {}x{} table",
                self.num_embeddings,
                self.embedding_dim
            );
        } else {
            checks::expect_shape(NAME, &self.params, shape)?;
        }
        self.state = LayerState::Ready;
        Ok(())
    }

    fn forward(&mut self, sub: &dyn Subnet, output: &mut Tensor) -> Result<()> {
        self.state.ensure_ready(NAME)?;
        let input = sub.output();
        checks::expect_non_empty(NAME, input)?;
        let s = input.shape();
        output.set_size(TensorShape::new(s.num_samples, s.k, s.nr, self.embedding_dim));
        let dim = self.embedding_dim;
        let table = self.params.host();
        for (row, out) in input.host().chunks(s.nc).zip(output.host_mut().chunks_mut(dim)) {
            if let Some(t) = self.token(row[0]) {
                out.copy_from_slice(&table[t * dim..(t + 1) * dim]);
            }
        }
        Ok(())
    }

    fn backward(
        &mut self,
        computed_output: &Tensor,
        gradient_input: &Tensor,
        sub: &mut dyn Subnet,
        params_grad: &mut Tensor,
    ) -> Result<()> {
        self.state.ensure_ready(NAME)?;
        checks::expect_gradient(NAME, gradient_input, computed_output)?;
        checks::expect_params_grad(NAME, params_grad, &self.params)?;
        params_grad.fill(0.0);
        if self.learning_rate_multiplier == 0.0 {
            return Ok(());
        }

        let input = sub.output();
        checks::expect_non_empty(NAME, input)?;
        self.count_tokens(input);
        let dim = self.embedding_dim;
        let lr = self.learning_rate_multiplier as f32;
        let pg = params_grad.host_mut();
        for (row, g) in input.host().chunks(input.nc()).zip(gradient_input.host().chunks(dim)) {
            let Some(t) = self.token(row[0]) else {
                continue;
            };
            let scale = if self.scale_by_freq { lr / self.freqs[t] } else { lr };
            for (d, v) in pg[t * dim..(t + 1) * dim].iter_mut().zip(g) {
                *d += scale * v;
            }
        }
        Ok(())
    }

    fn params(&self) -> &Tensor {
        &self.params
    }

    fn params_mut(&mut self) -> &mut Tensor {
        &mut self.params
    }

    fn serialize(&self, out: &mut dyn Write) -> Result<()> {
        ser::write_str(out, VERSION)?;
        ser::write_tensor(out, &self.params)?;
        ser::write_usize(out, self.num_embeddings)?;
        ser::write_usize(out, self.embedding_dim)?;
        ser::write_f64(out, self.learning_rate_multiplier)?;
        ser::write_bool(out, self.scale_by_freq)
    }

    fn deserialize(&mut self, input: &mut dyn Read) -> Result<()> {
        let loaded = read_embeddings(input)?;
        check_field(NAME, "num_embeddings", self.num_embeddings, loaded.num_embeddings)?;
        check_field(NAME, "embedding_dim", self.embedding_dim, loaded.embedding_dim)?;
        let seed = self.seed;
        *self = Self { seed, ..loaded };
        Ok(())
    }

    fn to_xml(&self) -> String {
        format!(
            "<embeddings num_embeddings='{}' embedding_dim='{}' learning_rate_mult='{}'>\n{}</embeddings>\n",
            self.num_embeddings,
            self.embedding_dim,
            self.learning_rate_multiplier,
            ser::tensor_text(&self.params)
        )
    }
}

impl fmt::Display for Embeddings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "embeddings (num_embeddings={}, embedding_dim={}) learning_rate_mult={}",
            self.num_embeddings, self.embedding_dim, self.learning_rate_multiplier
        )
    }
}

pub fn read_embeddings(input: &mut dyn Read) -> Result<Embeddings> {
    ser::read_version(input, NAME, &[VERSION])?;
    let params = ser::read_tensor(input)?;
    let num_embeddings = ser::read_usize(input)?;
    let embedding_dim = ser::read_usize(input)?;
    let learning_rate_multiplier = ser::read_f64(input)?;
    let scale_by_freq = ser::read_bool(input)?;

    let mut loaded = Embeddings::new(num_embeddings, embedding_dim)?;
    if !params.is_empty() && params.size() != num_embeddings * embedding_dim {
        return Err(LayerError::Malformed(format!(
            "embedding table of {} values for a {num_embeddings}x{embedding_dim} dictionary",
            params.size()
        )));
    }
    loaded.params = params;
    loaded.learning_rate_multiplier = learning_rate_multiplier;
    loaded.scale_by_freq = scale_by_freq;
    if !loaded.params.is_empty() {
        loaded.state = LayerState::Ready;
    }
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use layers::gradcheck::{check_gradients, GradCheck};
    use layers::Bindings;
    use std::io::Cursor;

    fn ids(values: &[f32]) -> Tensor {
        Tensor::from_vec(TensorShape::new(1, 1, values.len(), 1), values.to_vec())
            .unwrap()
    }

    #[test]
    fn empty_input_after_setup_is_a_shape_error() -> Result<()> {
        let mut emb = Embeddings::new(4, 3)?;
        emb.setup(&Bindings::new(ids(&[1.0, 2.0])))?;
        let empty = Bindings::new(Tensor::zeros(TensorShape::new(1, 1, 1, 0)));
        let err = emb.forward(&empty, &mut Tensor::new()).unwrap_err();
        assert!(matches!(err, LayerError::Shape { .. }), "{err}");
        Ok(())
    }

    #[test]
    fn lookup_copies_table_rows() -> Result<()> {
        let b = Bindings::new(ids(&[2.0, 0.7, 9.0]));
        let mut emb = Embeddings::new(4, 3)?.with_seed(1);
        emb.setup(&b)?;
        let mut out = Tensor::new();
        emb.forward(&b, &mut out)?;
        assert_eq!(out.shape(), TensorShape::new(1, 1, 3, 3));
        let table = emb.embeddings().host();
        assert_eq!(&out.host()[..3], &table[6..9]);
        assert_eq!(&out.host()[3..6], &table[..3]);
        assert!(out.host()[6..].iter().all(|v| *v == 0.0));
        Ok(())
    }

    #[test]
    fn frequency_scaling_averages_repeated_tokens() -> Result<()> {
        let mut b = Bindings::new(ids(&[1.0, 1.0, 3.0]));
        let mut emb = Embeddings::new(4, 2)?;
        emb.setup(&b)?;
        let mut out = Tensor::new();
        emb.forward(&b, &mut out)?;
        let upstream = Tensor::from_vec(out.shape(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])?;
        let mut pg = Tensor::zeros(emb.params().shape());
        emb.backward(&out, &upstream, &mut b, &mut pg)?;
        assert_eq!(pg.host(), &[0.0, 0.0, 2.0, 3.0, 0.0, 0.0, 5.0, 6.0]);
        assert!(b.gradient().host().iter().all(|v| *v == 0.0));

        emb.set_scale_by_freq(false);
        emb.set_learning_rate_multiplier(0.5);
        emb.backward(&out, &upstream, &mut b, &mut pg)?;
        assert_eq!(pg.host(), &[0.0, 0.0, 2.0, 3.0, 0.0, 0.0, 2.5, 3.0]);
        Ok(())
    }

    #[test]
    fn table_gradient_matches_finite_differences() -> Result<()> {
        let mut emb = Embeddings::new(5, 3)?.with_seed(2);
        emb.set_scale_by_freq(false);
        let cfg = GradCheck {
            check_input: false,
            ..GradCheck::default()
        };
        let report = check_gradients(&mut emb, Bindings::new(ids(&[4.0, 0.0, 4.0, 2.0])), cfg)?;
        assert!(report.passes(1e-3), "{report:?}");
        Ok(())
    }

    #[test]
    fn dictionary_is_fixed_once_allocated() -> Result<()> {
        assert!(Embeddings::new(0, 4).is_err());
        let mut emb = Embeddings::new(3, 2)?;
        emb.set_num_embeddings(6)?;
        emb.setup(&Bindings::new(ids(&[1.0])))?;
        assert!(emb.set_num_embeddings(7).is_err());
        assert!(emb.set_embedding_dim(3).is_err());
        emb.set_embedding_dim(2)?;
        assert_eq!(emb.num_embeddings(), 6);
        Ok(())
    }

    #[test]
    fn record_round_trips_and_checks_dictionary() -> Result<()> {
        let mut emb = Embeddings::new(3, 2)?.with_seed(5);
        emb.setup(&Bindings::new(ids(&[0.0])))?;
        emb.set_learning_rate_multiplier(0.1);
        let mut bytes = Vec::new();
        emb.serialize(&mut bytes)?;

        let loaded = read_embeddings(&mut Cursor::new(&bytes))?;
        assert_eq!(loaded.embeddings(), emb.embeddings());
        assert_eq!(loaded.learning_rate_multiplier(), 0.1);

        let mut other = Embeddings::new(4, 2)?;
        let err = other.deserialize(&mut Cursor::new(&bytes)).unwrap_err();
        assert!(matches!(err, LayerError::FieldMismatch { field: "num_embeddings", .. }));
        assert!(other.embeddings().is_empty());
        Ok(())
    }
}
