//! SafeTensors parameter storage and weight-norm folding.
//!
//! A [`ParamStore`] is a flat `name → f32 tensor` map. Model layers read their
//! parameters out of it by dotted path (`decoder.attention.0.query_proj.weight`)
//! and write them back when a checkpoint is exported.

use crate::error::Dv3Error;
use anyhow::{anyhow, Context, Result};
use burn::module::Param;
use burn::tensor::{backend::Backend, Tensor, TensorData};
use burn_nn::Linear;
use safetensors::{serialize, tensor::TensorView, Dtype, SafeTensors};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

/// Weight-norm magnitudes are clamped below by this before dividing.
const NORM_EPS: f32 = 1e-12;

/// Dense f32 tensor held on the host.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightTensor {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl WeightTensor {
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if numel != values.len() {
            return Err(Dv3Error::checkpoint(format!(
                "shape {shape:?} needs {numel} values, got {}",
                values.len()
            )));
        }
        Ok(Self { shape, values })
    }

    /// Decode a SafeTensors view, widening half-precision payloads to f32.
    pub fn from_view(view: &TensorView<'_>) -> Result<Self> {
        let values = decode_f32(view.dtype(), view.data())?;
        Self::new(view.shape().to_vec(), values)
    }

    pub fn numel(&self) -> usize {
        self.values.len()
    }

    /// Per-slice L2 norms along `axis`.
    fn slice_norms(&self, axis: usize) -> Vec<f32> {
        let (outer, n, inner) = split_axis(&self.shape, axis);
        let mut sums = vec![0.0f64; n];
        for o in 0..outer {
            for i in 0..n {
                let base = (o * n + i) * inner;
                for v in &self.values[base..base + inner] {
                    sums[i] += (*v as f64) * (*v as f64);
                }
            }
        }
        sums.into_iter().map(|s| s.sqrt() as f32).collect()
    }

    /// Multiply each slice along `axis` by `scale[i]`.
    fn scale_slices(&mut self, axis: usize, scale: &[f32]) {
        let (outer, n, inner) = split_axis(&self.shape, axis);
        for o in 0..outer {
            for (i, s) in scale.iter().enumerate().take(n) {
                let base = (o * n + i) * inner;
                for v in &mut self.values[base..base + inner] {
                    *v *= s;
                }
            }
        }
    }
}

fn split_axis(shape: &[usize], axis: usize) -> (usize, usize, usize) {
    let outer = shape[..axis].iter().product();
    let inner = shape[axis + 1..].iter().product();
    (outer, shape[axis], inner)
}

fn decode_f32(dtype: Dtype, bytes: &[u8]) -> Result<Vec<f32>> {
    let values = match dtype {
        Dtype::F32 => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        Dtype::BF16 => bytes
            .chunks_exact(2)
            .map(|c| f32::from_bits((u16::from_le_bytes([c[0], c[1]]) as u32) << 16))
            .collect(),
        Dtype::F16 => bytes
            .chunks_exact(2)
            .map(|c| f16_to_f32(u16::from_le_bytes([c[0], c[1]])))
            .collect(),
        other => {
            return Err(Dv3Error::checkpoint(format!(
                "unsupported tensor dtype {other:?}"
            )))
        }
    };
    Ok(values)
}

fn f16_to_f32(bits: u16) -> f32 {
    let sign = ((bits >> 15) as u32) << 31;
    let exp = ((bits >> 10) & 0x1f) as u32;
    let frac = (bits & 0x3ff) as u32;
    let out = match (exp, frac) {
        (0, 0) => sign,
        (0, _) => {
            // Subnormal: renormalize the mantissa.
            let mut e = 127 - 15 + 1;
            let mut f = frac;
            while f & 0x400 == 0 {
                f <<= 1;
                e -= 1;
            }
            sign | (e << 23) | ((f & 0x3ff) << 13)
        }
        (0x1f, _) => sign | 0x7f80_0000 | (frac << 13),
        _ => sign | ((exp + 127 - 15) << 23) | (frac << 13),
    };
    f32::from_bits(out)
}

/// A weight-normalized layer: `weight = g · v / ‖v‖`, norms taken per slice
/// along `axis`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightNormLayer {
    pub name: String,
    pub axis: usize,
}

impl WeightNormLayer {
    pub fn new(name: impl Into<String>, axis: usize) -> Self {
        Self {
            name: name.into(),
            axis,
        }
    }
}

/// Flat parameter map plus the file-level metadata of a checkpoint.
#[derive(Debug, Default, Clone)]
pub struct ParamStore {
    tensors: BTreeMap<String, WeightTensor>,
    metadata: HashMap<String, String>,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a SafeTensors buffer.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let tensors = SafeTensors::deserialize(bytes)
            .map_err(|e| Dv3Error::checkpoint(format!("invalid safetensors payload: {e}")))?;
        let mut store = Self::new();
        for (name, view) in tensors.tensors() {
            let tensor = WeightTensor::from_view(&view).with_context(|| format!("tensor {name}"))?;
            store.tensors.insert(name, tensor);
        }
        if let Ok((_, header)) = SafeTensors::read_metadata(bytes) {
            if let Some(meta) = header.metadata() {
                store.metadata = meta.clone();
            }
        }
        Ok(store)
    }

    /// Read a checkpoint file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|e| {
            Dv3Error::checkpoint(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_bytes(&bytes).with_context(|| format!("load {}", path.display()))
    }

    /// Serialize all tensors as little-endian f32.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let raw: Vec<(&String, Vec<u8>, &WeightTensor)> = self
            .tensors
            .iter()
            .map(|(name, t)| {
                let bytes = t.values.iter().flat_map(|v| v.to_le_bytes()).collect();
                (name, bytes, t)
            })
            .collect();
        let mut views = HashMap::with_capacity(raw.len());
        for (name, bytes, tensor) in &raw {
            let view = TensorView::new(Dtype::F32, tensor.shape.clone(), bytes)
                .map_err(|e| anyhow!("tensor {name}: {e}"))?;
            views.insert((*name).clone(), view);
        }
        let metadata = (!self.metadata.is_empty()).then(|| self.metadata.clone());
        serialize(&views, &metadata).map_err(|e| anyhow!("serialize checkpoint: {e}"))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_bytes()?).with_context(|| format!("write {}", path.display()))
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: WeightTensor) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&WeightTensor> {
        self.tensors.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut WeightTensor> {
        self.tensors.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Fold `<layer>.weight_g` / `<layer>.weight_v` into `<layer>.weight`.
    ///
    /// Returns `false` when the layer is already stored folded.
    pub fn remove_weight_norm(&mut self, layer: &WeightNormLayer) -> Result<bool> {
        let g_name = format!("{}.weight_g", layer.name);
        let v_name = format!("{}.weight_v", layer.name);
        let (Some(g), Some(v)) = (self.tensors.get(&g_name), self.tensors.get(&v_name)) else {
            return Ok(false);
        };
        if layer.axis >= v.shape.len() || g.numel() != v.shape[layer.axis] {
            return Err(Dv3Error::checkpoint(format!(
                "{}: weight_g {:?} does not match axis {} of weight_v {:?}",
                layer.name, g.shape, layer.axis, v.shape
            )));
        }
        let norms = v.slice_norms(layer.axis);
        let scale: Vec<f32> = g
            .values
            .iter()
            .zip(&norms)
            .map(|(g, n)| g / n.max(NORM_EPS))
            .collect();
        let mut weight = v.clone();
        weight.scale_slices(layer.axis, &scale);
        self.tensors.remove(&g_name);
        self.tensors.remove(&v_name);
        self.tensors.insert(format!("{}.weight", layer.name), weight);
        Ok(true)
    }

    /// Split `<layer>.weight` into a direction and a magnitude, the layout a
    /// training run writes.
    pub fn apply_weight_norm(&mut self, layer: &WeightNormLayer) -> Result<bool> {
        let w_name = format!("{}.weight", layer.name);
        let Some(weight) = self.tensors.remove(&w_name) else {
            return Ok(false);
        };
        if layer.axis >= weight.shape.len() {
            return Err(Dv3Error::checkpoint(format!(
                "{}: axis {} out of range for {:?}",
                layer.name, layer.axis, weight.shape
            )));
        }
        let norms = weight.slice_norms(layer.axis);
        let g = WeightTensor::new(vec![norms.len()], norms)?;
        self.tensors.insert(format!("{}.weight_g", layer.name), g);
        self.tensors.insert(format!("{}.weight_v", layer.name), weight);
        Ok(true)
    }

    /// Materialize a parameter on `device`, checking its shape.
    pub fn tensor<B: Backend, const D: usize>(
        &self,
        name: &str,
        shape: [usize; D],
        device: &B::Device,
    ) -> Result<Tensor<B, D>> {
        let tensor = self
            .tensors
            .get(name)
            .ok_or_else(|| Dv3Error::checkpoint(format!("missing tensor {name}")))?;
        if tensor.shape.as_slice() != shape.as_slice() {
            return Err(Dv3Error::checkpoint(format!(
                "tensor {name}: expected shape {shape:?}, found {:?}",
                tensor.shape
            )));
        }
        Ok(Tensor::from_data(
            TensorData::new(tensor.values.clone(), shape),
            device,
        ))
    }

    /// Copy a device tensor into the store.
    pub fn insert_tensor<B: Backend, const D: usize>(
        &mut self,
        name: impl Into<String>,
        tensor: Tensor<B, D>,
    ) -> Result<()> {
        let shape = tensor.dims().to_vec();
        let values = tensor
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| anyhow!("read back tensor: {e:?}"))?;
        self.insert(name, WeightTensor::new(shape, values)?);
        Ok(())
    }
}

/// Load `<prefix>.weight` (`[in, out]`) and `<prefix>.bias` into a linear layer.
pub fn load_linear<B: Backend>(
    linear: &mut Linear<B>,
    store: &ParamStore,
    prefix: &str,
    device: &B::Device,
) -> Result<()> {
    let [d_in, d_out] = linear.weight.val().dims();
    let weight = store.tensor::<B, 2>(&format!("{prefix}.weight"), [d_in, d_out], device)?;
    linear.weight = Param::from_tensor(weight);
    if linear.bias.is_some() {
        let bias = store.tensor::<B, 1>(&format!("{prefix}.bias"), [d_out], device)?;
        linear.bias = Some(Param::from_tensor(bias));
    }
    Ok(())
}

/// Write a linear layer back under `prefix`.
pub fn export_linear<B: Backend>(
    linear: &Linear<B>,
    store: &mut ParamStore,
    prefix: &str,
) -> Result<()> {
    store.insert_tensor(format!("{prefix}.weight"), linear.weight.val())?;
    if let Some(bias) = &linear.bias {
        store.insert_tensor(format!("{prefix}.bias"), bias.val())?;
    }
    Ok(())
}

/// Linear weights are `[in, out]`; each output unit is normalized separately.
pub fn linear_weight_norm(prefix: &str) -> WeightNormLayer {
    WeightNormLayer::new(prefix, 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::category;

    fn store_with(name: &str, shape: Vec<usize>, values: Vec<f32>) -> ParamStore {
        let mut store = ParamStore::new();
        store.insert(name, WeightTensor::new(shape, values).unwrap());
        store
    }

    #[test]
    fn weight_norm_fold_matches_formula() {
        // v: [out=2, in=1, k=2], g per output channel.
        let mut store = store_with("conv.weight_v", vec![2, 1, 2], vec![3.0, 4.0, 0.0, 2.0]);
        store.insert("conv.weight_g", WeightTensor::new(vec![2, 1, 1], vec![10.0, 0.5]).unwrap());
        let folded = store
            .remove_weight_norm(&WeightNormLayer::new("conv", 0))
            .unwrap();
        assert!(folded);
        assert!(!store.contains("conv.weight_v"));
        let weight = store.get("conv.weight").unwrap();
        let expected = [6.0, 8.0, 0.0, 0.5];
        for (got, want) in weight.values.iter().zip(expected) {
            assert!((got - want).abs() < 1e-6, "{got} vs {want}");
        }
    }

    #[test]
    fn apply_then_remove_is_identity() {
        let values = vec![0.5, -1.0, 2.0, 0.25, 3.0, -0.75];
        let mut store = store_with("proj.weight", vec![3, 2], values.clone());
        let layer = linear_weight_norm("proj");
        assert!(store.apply_weight_norm(&layer).unwrap());
        assert_eq!(store.get("proj.weight_g").unwrap().shape, vec![2]);
        assert!(store.remove_weight_norm(&layer).unwrap());
        let weight = store.get("proj.weight").unwrap();
        for (got, want) in weight.values.iter().zip(&values) {
            assert!((got - want).abs() < 1e-5);
        }
    }

    #[test]
    fn folded_layer_is_left_alone() {
        let mut store = store_with("proj.weight", vec![1, 1], vec![1.0]);
        assert!(!store
            .remove_weight_norm(&linear_weight_norm("proj"))
            .unwrap());
    }

    #[test]
    fn mismatched_magnitude_is_a_checkpoint_error() {
        let mut store = store_with("conv.weight_v", vec![2, 1, 1], vec![1.0, 1.0]);
        store.insert("conv.weight_g", WeightTensor::new(vec![3], vec![1.0; 3]).unwrap());
        let err = store
            .remove_weight_norm(&WeightNormLayer::new("conv", 0))
            .unwrap_err();
        assert!(matches!(category(&err), Some(Dv3Error::Checkpoint(_))));
    }

    #[test]
    fn bytes_round_trip_keeps_metadata() {
        let mut store = store_with("a", vec![2], vec![1.5, -2.0]);
        store.set_metadata("iteration", "1000");
        let bytes = store.to_bytes().unwrap();
        let loaded = ParamStore::from_bytes(&bytes).unwrap();
        assert_eq!(loaded.get("a"), store.get("a"));
        assert_eq!(loaded.metadata().get("iteration").map(String::as_str), Some("1000"));
    }

    #[test]
    fn half_precision_payloads_widen() {
        // 1.0, -2.0, 0.5 in f16 and bf16.
        let f16_bytes: Vec<u8> = [0x3c00u16, 0xc000, 0x3800]
            .iter()
            .flat_map(|b| b.to_le_bytes())
            .collect();
        assert_eq!(decode_f32(Dtype::F16, &f16_bytes).unwrap(), vec![1.0, -2.0, 0.5]);
        let bf16_bytes: Vec<u8> = [1.0f32, -2.0, 0.5]
            .iter()
            .flat_map(|v| ((v.to_bits() >> 16) as u16).to_le_bytes())
            .collect();
        assert_eq!(decode_f32(Dtype::BF16, &bf16_bytes).unwrap(), vec![1.0, -2.0, 0.5]);
        assert!(decode_f32(Dtype::I64, &[0; 8]).is_err());
    }

    #[test]
    fn shape_mismatch_is_reported() {
        let store = store_with("w", vec![2, 2], vec![0.0; 4]);
        let device = burn_ndarray::NdArrayDevice::default();
        let err = store
            .tensor::<burn_ndarray::NdArray<f32>, 2>("w", [4, 1], &device)
            .unwrap_err();
        assert!(err.to_string().contains("expected shape"));
        let err = store
            .tensor::<burn_ndarray::NdArray<f32>, 1>("missing", [1], &device)
            .unwrap_err();
        assert!(matches!(category(&err), Some(Dv3Error::Checkpoint(_))));
    }
}
