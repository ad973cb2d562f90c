use candle_core::{DType, Result, Tensor};

/// Tensor statistics for debugging and validation
#[derive(Debug, Clone, PartialEq)]
pub struct TensorStats {
    pub shape: Vec<usize>,
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub non_finite: usize,
}

impl TensorStats {
    /// Compute statistics for a tensor, ignoring NaN and infinite entries
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let shape = tensor.dims().to_vec();
        let data: Vec<f32> = tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;

        let finite: Vec<f32> = data.iter().copied().filter(|v| v.is_finite()).collect();
        let non_finite = data.len() - finite.len();
        let min = finite.iter().copied().fold(f32::INFINITY, f32::min);
        let max = finite.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mean = if finite.is_empty() {
            0.0
        } else {
            finite.iter().sum::<f32>() / finite.len() as f32
        };

        Ok(Self {
            shape,
            min,
            max,
            mean,
            non_finite,
        })
    }

    /// Emit the statistics as a debug event
    pub fn log(&self, name: &str) {
        tracing::debug!(
            tensor = name,
            shape = ?self.shape,
            min = self.min,
            max = self.max,
            mean = self.mean,
            non_finite = self.non_finite,
        );
    }
}

/// Log tensor statistics when debug logging is enabled
pub fn log_tensor_stats(tensor: &Tensor, name: &str) -> Result<()> {
    if tracing::enabled!(tracing::Level::DEBUG) {
        TensorStats::from_tensor(tensor)?.log(name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_tensor_stats() {
        let device = Device::Cpu;
        let input = Tensor::from_vec(vec![0.0f32, 1.0, 2.0, 3.0, 4.0, 5.0], (2, 3), &device).unwrap();
        let stats = TensorStats::from_tensor(&input).unwrap();

        assert_eq!(stats.shape, vec![2, 3]);
        assert!((stats.min - 0.0).abs() < 1e-6);
        assert!((stats.max - 5.0).abs() < 1e-6);
        assert!((stats.mean - 2.5).abs() < 1e-6);
        assert_eq!(stats.non_finite, 0);
    }

    #[test]
    fn test_tensor_stats_counts_non_finite() {
        let device = Device::Cpu;
        let input = Tensor::new(&[1.0f32, f32::NAN, 3.0, f32::INFINITY], &device).unwrap();
        let stats = TensorStats::from_tensor(&input).unwrap();
        assert_eq!(stats.non_finite, 2);
        assert!((stats.mean - 2.0).abs() < 1e-6);
    }
}
