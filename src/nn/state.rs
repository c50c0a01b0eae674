//! Typed state-dict tensors
//!
//! A state dict maps qualified parameter names to tensors. Every tensor keeps
//! its storage dtype, so packed integer buffers and half-precision scales are
//! written to disk exactly as they are held in memory.

use crate::config::ParamDtype;
use crate::{Error, Result};
use half::{bf16, f16};
use ndarray::{Array1, Array2};
use safetensors::tensor::{Dtype, TensorView};
use std::collections::BTreeMap;

/// Ordered parameter-name → tensor mapping
pub type StateDict = BTreeMap<String, StateTensor>;

/// Element storage of a [`StateTensor`]
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    F16(Vec<f16>),
    Bf16(Vec<bf16>),
    I32(Vec<i32>),
    U8(Vec<u8>),
    I8(Vec<i8>),
}

/// A contiguous, row-major tensor with its shape
#[derive(Debug, Clone, PartialEq)]
pub struct StateTensor {
    pub shape: Vec<usize>,
    pub data: TensorData,
}

impl StateTensor {
    /// Store f32 values in the requested floating dtype
    pub fn from_f32(shape: Vec<usize>, values: &[f32], dtype: ParamDtype) -> Self {
        let data = match dtype {
            ParamDtype::F32 => TensorData::F32(values.to_vec()),
            ParamDtype::F16 => TensorData::F16(values.iter().map(|&v| f16::from_f32(v)).collect()),
            ParamDtype::Bf16 => {
                TensorData::Bf16(values.iter().map(|&v| bf16::from_f32(v)).collect())
            }
        };
        Self { shape, data }
    }

    pub fn from_array2(array: &Array2<f32>, dtype: ParamDtype) -> Self {
        let values: Vec<f32> = array.iter().copied().collect();
        Self::from_f32(array.shape().to_vec(), &values, dtype)
    }

    pub fn from_array1(array: &Array1<f32>, dtype: ParamDtype) -> Self {
        Self::from_f32(vec![array.len()], &array.to_vec(), dtype)
    }

    pub fn i32(shape: Vec<usize>, values: Vec<i32>) -> Self {
        Self {
            shape,
            data: TensorData::I32(values),
        }
    }

    pub fn u8(shape: Vec<usize>, values: Vec<u8>) -> Self {
        Self {
            shape,
            data: TensorData::U8(values),
        }
    }

    pub fn i8(shape: Vec<usize>, values: Vec<i8>) -> Self {
        Self {
            shape,
            data: TensorData::I8(values),
        }
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn nbytes(&self) -> usize {
        self.numel() * self.element_size()
    }

    pub fn element_size(&self) -> usize {
        match self.data {
            TensorData::F32(_) | TensorData::I32(_) => 4,
            TensorData::F16(_) | TensorData::Bf16(_) => 2,
            TensorData::U8(_) | TensorData::I8(_) => 1,
        }
    }

    pub fn dtype_name(&self) -> &'static str {
        match self.data {
            TensorData::F32(_) => "F32",
            TensorData::F16(_) => "F16",
            TensorData::Bf16(_) => "BF16",
            TensorData::I32(_) => "I32",
            TensorData::U8(_) => "U8",
            TensorData::I8(_) => "I8",
        }
    }

    /// Floating dtype of this tensor, if it is floating point
    pub fn param_dtype(&self) -> Option<ParamDtype> {
        match self.data {
            TensorData::F32(_) => Some(ParamDtype::F32),
            TensorData::F16(_) => Some(ParamDtype::F16),
            TensorData::Bf16(_) => Some(ParamDtype::Bf16),
            _ => None,
        }
    }

    pub fn is_floating(&self) -> bool {
        self.param_dtype().is_some()
    }

    /// Upcast floating data to f32
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        match &self.data {
            TensorData::F32(v) => Ok(v.clone()),
            TensorData::F16(v) => Ok(v.iter().map(|x| x.to_f32()).collect()),
            TensorData::Bf16(v) => Ok(v.iter().map(|x| x.to_f32()).collect()),
            _ => Err(Error::InvalidParameter(format!(
                "expected a floating tensor, got {}",
                self.dtype_name()
            ))),
        }
    }

    pub fn to_array2(&self) -> Result<Array2<f32>> {
        let (rows, cols) = self.dims2()?;
        Array2::from_shape_vec((rows, cols), self.to_f32_vec()?)
            .map_err(|e| Error::InvalidParameter(e.to_string()))
    }

    pub fn to_array1(&self) -> Result<Array1<f32>> {
        Ok(Array1::from_vec(self.to_f32_vec()?))
    }

    pub fn to_i32_array2(&self) -> Result<Array2<i32>> {
        let (rows, cols) = self.dims2()?;
        match &self.data {
            TensorData::I32(v) => Array2::from_shape_vec((rows, cols), v.clone())
                .map_err(|e| Error::InvalidParameter(e.to_string())),
            _ => Err(Error::InvalidParameter(format!(
                "expected I32 tensor, got {}",
                self.dtype_name()
            ))),
        }
    }

    pub fn to_u8_array2(&self) -> Result<Array2<u8>> {
        let (rows, cols) = self.dims2()?;
        match &self.data {
            TensorData::U8(v) => Array2::from_shape_vec((rows, cols), v.clone())
                .map_err(|e| Error::InvalidParameter(e.to_string())),
            _ => Err(Error::InvalidParameter(format!(
                "expected U8 tensor, got {}",
                self.dtype_name()
            ))),
        }
    }

    pub fn to_i8_array2(&self) -> Result<Array2<i8>> {
        let (rows, cols) = self.dims2()?;
        match &self.data {
            TensorData::I8(v) => Array2::from_shape_vec((rows, cols), v.clone())
                .map_err(|e| Error::InvalidParameter(e.to_string())),
            _ => Err(Error::InvalidParameter(format!(
                "expected I8 tensor, got {}",
                self.dtype_name()
            ))),
        }
    }

    pub fn as_i32(&self) -> Result<&[i32]> {
        match &self.data {
            TensorData::I32(v) => Ok(v),
            _ => Err(Error::InvalidParameter(format!(
                "expected I32 tensor, got {}",
                self.dtype_name()
            ))),
        }
    }

    fn dims2(&self) -> Result<(usize, usize)> {
        match self.shape.as_slice() {
            [rows, cols] => Ok((*rows, *cols)),
            other => Err(Error::InvalidParameter(format!(
                "expected a 2-D tensor, got shape {other:?}"
            ))),
        }
    }

    /// Little-endian bytes for serialization
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match &self.data {
            TensorData::F32(v) => bytemuck::cast_slice(v).to_vec(),
            TensorData::F16(v) => bytemuck::cast_slice(v).to_vec(),
            TensorData::Bf16(v) => bytemuck::cast_slice(v).to_vec(),
            TensorData::I32(v) => bytemuck::cast_slice(v).to_vec(),
            TensorData::U8(v) => v.clone(),
            TensorData::I8(v) => bytemuck::cast_slice(v).to_vec(),
        }
    }

    pub fn safetensors_dtype(&self) -> Dtype {
        match self.data {
            TensorData::F32(_) => Dtype::F32,
            TensorData::F16(_) => Dtype::F16,
            TensorData::Bf16(_) => Dtype::BF16,
            TensorData::I32(_) => Dtype::I32,
            TensorData::U8(_) => Dtype::U8,
            TensorData::I8(_) => Dtype::I8,
        }
    }

    /// Copy a tensor out of a safetensors view
    pub fn from_view(name: &str, view: &TensorView<'_>) -> Result<Self> {
        let bytes = view.data();
        let data = match view.dtype() {
            Dtype::F32 => TensorData::F32(bytemuck::pod_collect_to_vec(bytes)),
            Dtype::F16 => TensorData::F16(bytemuck::pod_collect_to_vec(bytes)),
            Dtype::BF16 => TensorData::Bf16(bytemuck::pod_collect_to_vec(bytes)),
            Dtype::I32 => TensorData::I32(bytemuck::pod_collect_to_vec(bytes)),
            Dtype::U8 => TensorData::U8(bytes.to_vec()),
            Dtype::I8 => TensorData::I8(bytemuck::pod_collect_to_vec(bytes)),
            other => {
                return Err(Error::Serialization(format!(
                    "tensor `{name}` has unsupported dtype {other:?}"
                )))
            }
        };
        Ok(Self {
            shape: view.shape().to_vec(),
            data,
        })
    }

    /// Re-store floating data in another floating dtype; integer tensors are
    /// returned unchanged.
    pub fn cast(&self, dtype: ParamDtype) -> Result<Self> {
        if !self.is_floating() {
            return Ok(self.clone());
        }
        Ok(Self::from_f32(self.shape.clone(), &self.to_f32_vec()?, dtype))
    }
}

/// Fetch a required tensor from a state dict
pub fn require<'a>(dict: &'a StateDict, key: &str) -> Result<&'a StateTensor> {
    dict.get(key)
        .ok_or_else(|| Error::ModuleNotFound(format!("missing tensor `{key}`")))
}

/// Fail with [`Error::ShapeMismatch`] unless `tensor` has the expected shape
pub fn check_shape(name: &str, tensor: &StateTensor, expected: &[usize]) -> Result<()> {
    if tensor.shape != expected {
        return Err(Error::ShapeMismatch {
            name: name.to_string(),
            expected: expected.to_vec(),
            got: tensor.shape.clone(),
        });
    }
    Ok(())
}

/// Total payload size of a state dict in bytes
pub fn total_size(dict: &StateDict) -> usize {
    dict.values().map(StateTensor::nbytes).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_from_f32_stores_requested_dtype() {
        let t = StateTensor::from_f32(vec![2], &[1.5, -2.0], ParamDtype::Bf16);
        assert_eq!(t.dtype_name(), "BF16");
        assert_eq!(t.nbytes(), 4);
        assert_eq!(t.to_f32_vec().unwrap(), vec![1.5, -2.0]);
    }

    #[test]
    fn test_array2_round_trip() {
        let a = array![[1.0f32, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let t = StateTensor::from_array2(&a, ParamDtype::F32);
        assert_eq!(t.shape, vec![2, 3]);
        assert_eq!(t.to_array2().unwrap(), a);
    }

    #[test]
    fn test_integer_tensors_refuse_float_access() {
        let t = StateTensor::i32(vec![1, 2], vec![7, 8]);
        assert!(t.to_f32_vec().is_err());
        assert_eq!(t.to_i32_array2().unwrap()[[0, 1]], 8);
        assert_eq!(t.cast(ParamDtype::F16).unwrap(), t);
    }

    #[test]
    fn test_check_shape_reports_mismatch() {
        let t = StateTensor::u8(vec![3, 2], vec![0; 6]);
        let err = check_shape("layer.qweight", &t, &[2, 3]).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
        assert!(check_shape("layer.qweight", &t, &[3, 2]).is_ok());
    }

    #[test]
    fn test_le_bytes_length_matches_nbytes() {
        let t = StateTensor::from_f32(vec![3], &[1.0, 2.0, 3.0], ParamDtype::F16);
        assert_eq!(t.to_le_bytes().len(), t.nbytes());
        let q = StateTensor::i8(vec![4], vec![-1, 0, 1, 2]);
        assert_eq!(q.to_le_bytes(), vec![255, 0, 1, 2]);
    }
}
