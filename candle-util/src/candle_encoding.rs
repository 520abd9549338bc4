use candle_core::{DType, Result, Tensor};

/// Indicator matrix of integer-valued categories
///
/// `ret[i, c] = 1` iff `indices[i] == c`
///
/// * `indices_n` - category of each row, shape (n) or (n x 1), any
///   dtype holding non-negative integer values
/// * `cardinality` - number of categories
/// * `dtype` - dtype of the returned (n x cardinality) matrix
///
pub fn one_hot(indices_n: &Tensor, cardinality: usize, dtype: DType) -> Result<Tensor> {
    if cardinality == 0 {
        candle_core::bail!("one_hot: cardinality must be positive");
    }

    let idx_n = indices_n.flatten_all()?.to_dtype(DType::U32)?;

    if idx_n.elem_count() > 0 {
        let max_idx = idx_n.max(0)?.to_scalar::<u32>()? as usize;
        if max_idx >= cardinality {
            candle_core::bail!(
                "one_hot: category index {} out of range for cardinality {}",
                max_idx,
                cardinality
            );
        }
    }

    let levels_1c = Tensor::arange(0u32, cardinality as u32, idx_n.device())?.unsqueeze(0)?;
    idx_n
        .unsqueeze(1)?
        .broadcast_eq(&levels_1c)?
        .to_dtype(dtype)
}
