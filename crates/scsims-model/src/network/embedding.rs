//! Categorical embeddings and the reduction back to original feature space

use crate::model_config::HyperParams;
use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{Embedding, Module, VarBuilder};

/// Replaces every categorical column by its learned embedding; continuous columns pass through
#[derive(Debug, Clone)]
pub struct EmbeddingGenerator {
    segments: Vec<Segment>,
    post_embed_dim: usize,
}

#[derive(Debug, Clone)]
enum Segment {
    /// Run of continuous columns `[start, start + len)`
    Continuous { start: usize, len: usize },
    /// One categorical column
    Categorical { column: usize, embedding: Embedding },
}

impl EmbeddingGenerator {
    pub fn new(params: &HyperParams, vb: VarBuilder) -> Result<Self> {
        let emb_dims = params.cat_emb_dim.expand(params.cat_idxs.len());
        let mut segments = Vec::new();
        let mut start = 0;

        for (i, ((&column, &cardinality), &emb_dim)) in params
            .cat_idxs
            .iter()
            .zip(&params.cat_dims)
            .zip(&emb_dims)
            .enumerate()
        {
            if column > start {
                segments.push(Segment::Continuous {
                    start,
                    len: column - start,
                });
            }
            let embedding =
                candle_nn::embedding(cardinality, emb_dim, vb.pp(format!("embeddings.{}", i)))?;
            segments.push(Segment::Categorical { column, embedding });
            start = column + 1;
        }
        if start < params.input_dim {
            segments.push(Segment::Continuous {
                start,
                len: params.input_dim - start,
            });
        }

        Ok(Self {
            segments,
            post_embed_dim: params.post_embed_dim(),
        })
    }

    pub fn post_embed_dim(&self) -> usize {
        self.post_embed_dim
    }

    fn is_identity(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Continuous { .. }))
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        if self.is_identity() {
            return Ok(xs.clone());
        }
        let parts = self
            .segments
            .iter()
            .map(|segment| match segment {
                Segment::Continuous { start, len } => xs.narrow(1, *start, *len),
                Segment::Categorical { column, embedding } => {
                    let ids = xs.narrow(1, *column, 1)?.squeeze(1)?.detach();
                    embedding.forward(&ids.to_dtype(DType::U32)?)
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Tensor::cat(&parts, 1)
    }
}

/// Fixed linear map from embedding space back to original feature space.
///
/// Equivalent to multiplying by a `post_embed_dim x input_dim` 0/1 matrix whose
/// column `j` selects every embedding column produced by input feature `j`. The
/// matrix is kept as its column-to-feature index and applied with `index_add`,
/// so gene panels with tens of thousands of features never materialise it.
#[derive(Debug, Clone)]
pub struct ReducingMatrix {
    groups: Vec<u32>,
    input_dim: usize,
}

impl ReducingMatrix {
    /// Build the reduction for the embedding layout described by `params`
    pub fn new(params: &HyperParams) -> Self {
        let emb_dims = params.cat_emb_dim.expand(params.cat_idxs.len());
        let mut groups = Vec::with_capacity(params.post_embed_dim());
        let mut cat = params.cat_idxs.iter().zip(&emb_dims).peekable();

        for feature in 0..params.input_dim {
            let width = match cat.peek() {
                Some((&column, &emb_dim)) if column == feature => {
                    cat.next();
                    emb_dim
                }
                _ => 1,
            };
            groups.extend(std::iter::repeat(feature as u32).take(width));
        }

        Self {
            groups,
            input_dim: params.input_dim,
        }
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn post_embed_dim(&self) -> usize {
        self.groups.len()
    }

    fn is_identity(&self) -> bool {
        self.groups.len() == self.input_dim
    }

    /// Project `(n, post_embed_dim)` scores to `(n, input_dim)`
    pub fn reduce(&self, xs: &Tensor) -> Result<Tensor> {
        if self.is_identity() {
            return Ok(xs.clone());
        }
        let n = xs.dim(0)?;
        let index = Tensor::new(self.groups.as_slice(), xs.device())?;
        Tensor::zeros((n, self.input_dim), xs.dtype(), xs.device())?.index_add(&index, xs, 1)
    }

    /// The reduction as an explicit dense matrix
    pub fn to_dense(&self, device: &Device) -> Result<Tensor> {
        let mut data = vec![0f32; self.groups.len() * self.input_dim];
        for (row, &feature) in self.groups.iter().enumerate() {
            data[row * self.input_dim + feature as usize] = 1.0;
        }
        Tensor::from_vec(data, (self.groups.len(), self.input_dim), device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_config::CatEmbDim;
    use candle_nn::VarMap;

    fn cat_params() -> HyperParams {
        HyperParams::new(5, 3).with_categorical(
            vec![1, 3],
            vec![4, 6],
            CatEmbDim::PerFeature(vec![2, 3]),
        )
    }

    #[test]
    fn test_embedding_output_width() {
        let params = cat_params();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let embedder = EmbeddingGenerator::new(&params, vb).unwrap();

        let xs = Tensor::new(
            &[[0.5f32, 3.0, 1.0, 5.0, -1.0], [0.1, 0.0, 2.0, 2.0, 4.0]],
            &Device::Cpu,
        )
        .unwrap();
        let out = embedder.forward(&xs).unwrap();
        assert_eq!(out.dims(), &[2, 8]);
        assert_eq!(embedder.post_embed_dim(), 8);
    }

    #[test]
    fn test_identity_embedding() {
        let params = HyperParams::new(4, 2);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let embedder = EmbeddingGenerator::new(&params, vb).unwrap();

        let xs = Tensor::ones((3, 4), DType::F32, &Device::Cpu).unwrap();
        let out = embedder.forward(&xs).unwrap();
        assert_eq!(out.to_vec2::<f32>().unwrap(), xs.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn test_reducing_matrix_layout() {
        let reducing = ReducingMatrix::new(&cat_params());
        let dense = reducing.to_dense(&Device::Cpu).unwrap();
        let rows = dense.to_vec2::<f32>().unwrap();

        // feature 1 expands to embedding columns 1..3, feature 3 to 4..7
        let expected_feature = [0, 1, 1, 2, 3, 3, 3, 4];
        for (row, &feature) in rows.iter().zip(&expected_feature) {
            for (j, &v) in row.iter().enumerate() {
                assert_eq!(v, if j == feature { 1.0 } else { 0.0 });
            }
        }
    }

    #[test]
    fn test_reduce_matches_dense_product() {
        let reducing = ReducingMatrix::new(&cat_params());
        let xs = Tensor::arange(0f32, 16., &Device::Cpu)
            .unwrap()
            .reshape((2, 8))
            .unwrap();

        let reduced = reducing.reduce(&xs).unwrap().to_vec2::<f32>().unwrap();
        let dense = xs
            .matmul(&reducing.to_dense(&Device::Cpu).unwrap())
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        assert_eq!(reduced, dense);
        assert_eq!(reduced[0], vec![0.0, 3.0, 3.0, 15.0, 7.0]);
    }
}
