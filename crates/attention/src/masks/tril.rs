use std::fmt;
use std::io::{Read, Write};

use layers::serialize::{self as ser, check_field};
use layers::{checks, Layer, LayerState, Result, Subnet, Tensor};

use super::{triangular_masks, MaskFill};

const NAME: &str = "tril";
const VERSION: &str = "tril_";

/// Lower-triangular masking over every `nr × nc` plane.
///
/// Positions with `c > r + diag` become `fill` and pass no gradient. The
/// masks are rebuilt whenever the input shape changes.
#[derive(Debug, Clone)]
pub struct Tril {
    diag: i64,
    fill: MaskFill,
    keep: Tensor,
    additive: Tensor,
    params: Tensor,
    state: LayerState,
}

impl Default for Tril {
    fn default() -> Self {
        Self::new(0, MaskFill::Zero)
    }
}

impl Tril {
    pub fn new(diag: i64, fill: MaskFill) -> Self {
        Self {
            diag,
            fill,
            keep: Tensor::new(),
            additive: Tensor::new(),
            params: Tensor::new(),
            state: LayerState::Uninitialized,
        }
    }

    /// Causal attention mask: the strict upper triangle becomes `-inf`.
    pub fn causal() -> Self {
        Self::new(0, MaskFill::NegInfinity)
    }

    pub fn with_ratio(diag: i64, num: i64, den: i64) -> Result<Self> {
        Ok(Self::new(diag, MaskFill::ratio(num, den)?))
    }

    pub fn diag(&self) -> i64 {
        self.diag
    }

    pub fn fill(&self) -> MaskFill {
        self.fill
    }

    fn refresh_masks(&mut self, input: &Tensor) {
        if self.keep.same_dims(input) {
            return;
        }
        log::debug!(
            "tril: rebuilding masks for {} (diag={}, fill={})",
            input.shape(),
            self.diag,
            self.fill.value()
        );
        let (keep, additive) = triangular_masks(input.shape(), self.diag, self.fill);
        self.keep = keep;
        self.additive = additive;
    }
}

impl Layer for Tril {
    fn name(&self) -> &'static str {
        NAME
    }

    fn state(&self) -> LayerState {
        self.state
    }

    fn setup(&mut self, sub: &dyn Subnet) -> Result<()> {
        checks::expect_non_empty(NAME, sub.output())?;
        self.refresh_masks(sub.output());
        self.state = LayerState::Ready;
        Ok(())
    }

    fn forward(&mut self, sub: &dyn Subnet, output: &mut Tensor) -> Result<()> {
        self.state.ensure_ready(NAME)?;
        let input = sub.output();
        self.refresh_masks(input);
        output.set_size(input.shape());
        for ((o, x), k) in output
            .host_mut()
            .iter_mut()
            .zip(input.host())
            .zip(self.keep.host())
        {
            *o = if *k == 0.0 { 0.0 } else { x * k };
        }
        if !self.fill.is_zero() {
            output.add_assign(&self.additive)?;
        }
        Ok(())
    }

    fn backward(
        &mut self,
        computed_output: &Tensor,
        gradient_input: &Tensor,
        sub: &mut dyn Subnet,
        _params_grad: &mut Tensor,
    ) -> Result<()> {
        self.state.ensure_ready(NAME)?;
        checks::expect_gradient(NAME, gradient_input, computed_output)?;
        checks::expect_same_shape(NAME, gradient_input, &self.keep)?;
        let grad = sub.gradient_input()?;
        for ((d, g), k) in grad
            .host_mut()
            .iter_mut()
            .zip(gradient_input.host())
            .zip(self.keep.host())
        {
            *d += g * k;
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
        ser::write_i64(out, self.diag)?;
        ser::write_f32(out, self.fill.value())
    }

    fn deserialize(&mut self, input: &mut dyn Read) -> Result<()> {
        let loaded = read_tril(input)?;
        check_field(NAME, "diag", self.diag, loaded.diag)?;
        check_field(NAME, "diag_value", self.fill.value(), loaded.fill.value())?;
        *self = loaded;
        Ok(())
    }

    fn to_xml(&self) -> String {
        format!(
            "<tril diag='{}' diag_value='{}'/>\n",
            self.diag,
            self.fill.value()
        )
    }
}

impl fmt::Display for Tril {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tril (diag={}, diag_value={})", self.diag, self.fill.value())
    }
}

pub fn read_tril(input: &mut dyn Read) -> Result<Tril> {
    ser::read_version(input, NAME, &[VERSION])?;
    let diag = ser::read_i64(input)?;
    let value = ser::read_f32(input)?;
    let mut loaded = Tril::new(diag, MaskFill::from_value(value));
    loaded.state = LayerState::Ready;
    Ok(loaded)
}
