// Embeddings: token table and position table
//
// Tokens are looked up in `wte` [vocab, embd] (std 0.02). The same table is
// the output projection of a weight-tied model, so it is exposed as a
// Variable.
//
// Positions come either from a learned table `wpe` [embed_sequence, embd]
// (std 0.01) or from an AXIAL factorization: two small tables
// [axial_dim_0, embd] and [axial_dim_1, embd] broadcast against each other,
// averaged, and reshaped into [embed_sequence, embd] with
// embed_sequence = axial_dim_0 · axial_dim_1. Axial tables need
// (a0 + a1)·embd parameters instead of a0·a1·embd.
//
// Embed dropout applies to both lookups, each at its own site.

use meshlm_core::{Dim, Init, Result, Shape, Tensor, VarBuilder, Variable};

use crate::context::Context;
use crate::dims;
use crate::dropout::Dropout;
use crate::module::Module;

/// Token lookup table.
pub struct TokenEmbedding {
    wte: Variable,
    dropout: Dropout,
}

impl TokenEmbedding {
    pub fn new(vb: &mut VarBuilder<'_>, vocab: &Dim, embd: &Dim, dropout: f64) -> Result<Self> {
        let wte = vb.get(
            "wte",
            Shape::new(vec![vocab.clone(), embd.clone()])?,
            Init::Normal { std: 0.02 },
        )?;
        Ok(TokenEmbedding {
            wte,
            dropout: Dropout::new(dropout, vb.path("token_embd/wte_dropout"))?,
        })
    }

    /// The table, shared with a tied output projection.
    pub fn table(&self) -> &Variable {
        &self.wte
    }
}

impl Module for TokenEmbedding {
    /// `ids` of any shape → ids dims ++ [embd].
    fn forward(&self, ctx: &mut Context<'_>, ids: &Tensor) -> Result<Tensor> {
        let h = Tensor::gather(&self.wte.value()?, ids, dims::VOCAB)?;
        self.dropout.forward(ctx, &h)
    }

    fn variables(&self) -> Vec<Variable> {
        vec![self.wte.clone()]
    }
}

/// Position table, learned or axial.
pub enum PositionEmbedding {
    Learned {
        wpe: Variable,
        dropout: Dropout,
    },
    Axial {
        a0: Variable,
        a1: Variable,
        embed_sequence: Dim,
        embd: Dim,
        dropout: Dropout,
    },
}

impl PositionEmbedding {
    /// A learned `[embed_sequence, embd]` table.
    pub fn learned(vb: &mut VarBuilder<'_>, length: usize, embd: &Dim, dropout: f64) -> Result<Self> {
        let wpe = vb.get(
            "wpe",
            Shape::new(vec![Dim::new(dims::EMBED_SEQUENCE, length), embd.clone()])?,
            Init::Normal { std: 0.01 },
        )?;
        Ok(PositionEmbedding::Learned {
            wpe,
            dropout: Dropout::new(dropout, vb.path("pos_embd/wpe_dropout"))?,
        })
    }

    /// An axial table covering `axial.0 * axial.1` positions.
    pub fn axial(
        vb: &mut VarBuilder<'_>,
        axial: (usize, usize),
        embd: &Dim,
        dropout: f64,
    ) -> Result<Self> {
        let a0 = vb.get(
            "axial_wpe_1",
            Shape::new(vec![Dim::new(dims::AXIAL_0, axial.0), embd.clone()])?,
            Init::Normal { std: 0.01 },
        )?;
        let a1 = vb.get(
            "axial_wpe_2",
            Shape::new(vec![Dim::new(dims::AXIAL_1, axial.1), embd.clone()])?,
            Init::Normal { std: 0.01 },
        )?;
        Ok(PositionEmbedding::Axial {
            a0,
            a1,
            embed_sequence: Dim::new(dims::EMBED_SEQUENCE, axial.0 * axial.1),
            embd: embd.clone(),
            dropout: Dropout::new(dropout, vb.path("pos_embd/wpe_dropout"))?,
        })
    }

    /// Number of positions the table covers.
    pub fn length(&self) -> usize {
        match self {
            PositionEmbedding::Learned { wpe, .. } => wpe.shape().dims()[0].size(),
            PositionEmbedding::Axial { embed_sequence, .. } => embed_sequence.size(),
        }
    }

    /// The full `[embed_sequence, embd]` table.
    pub fn table(&self) -> Result<Tensor> {
        match self {
            PositionEmbedding::Learned { wpe, .. } => wpe.value(),
            PositionEmbedding::Axial {
                a0,
                a1,
                embed_sequence,
                embd,
                ..
            } => {
                let grid = Shape::new(vec![
                    a0.shape().dim(dims::AXIAL_0)?.clone(),
                    a1.shape().dim(dims::AXIAL_1)?.clone(),
                    embd.clone(),
                ])?;
                let sum = a0.value()?.add(&a1.value()?)?.transpose_to(&grid)?;
                sum.affine(0.5, 0.0)?
                    .reshape(Shape::new(vec![embed_sequence.clone(), embd.clone()])?)
            }
        }
    }

    fn dropout(&self) -> &Dropout {
        match self {
            PositionEmbedding::Learned { dropout, .. } | PositionEmbedding::Axial { dropout, .. } => {
                dropout
            }
        }
    }
}

impl Module for PositionEmbedding {
    /// `positions` of any shape → positions dims ++ [embd].
    fn forward(&self, ctx: &mut Context<'_>, positions: &Tensor) -> Result<Tensor> {
        let pe = Tensor::gather(&self.table()?, positions, dims::EMBED_SEQUENCE)?;
        self.dropout().forward(ctx, &pe)
    }

    fn variables(&self) -> Vec<Variable> {
        match self {
            PositionEmbedding::Learned { wpe, .. } => vec![wpe.clone()],
            PositionEmbedding::Axial { a0, a1, .. } => vec![a0.clone(), a1.clone()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshlm_core::{CommLedger, DType, MeshPlan, VarStore, VariableDType};
    use std::sync::Arc;

    use crate::context::Mode;

    fn ctx() -> Context<'static> {
        Context::new(
            Mode::Eval,
            VariableDType::uniform(DType::F64),
            Arc::new(MeshPlan::single_device()),
            Arc::new(CommLedger::new()),
        )
    }

    #[test]
    fn test_token_lookup() {
        let mut vs = VarStore::new(VariableDType::uniform(DType::F64), 0);
        let emb = TokenEmbedding::new(&mut vs.root(), &Dim::new("vocab", 10), &Dim::new("embd", 3), 0.0)
            .unwrap();
        let ids = Tensor::new(
            vec![1.0, 7.0],
            Shape::from_pairs(&[("batch", 1), ("sequence", 2)]).unwrap(),
            DType::I64,
        )
        .unwrap();
        let h = emb.forward(&mut ctx(), &ids).unwrap();
        assert_eq!(h.shape().names(), vec!["batch", "sequence", "embd"]);
        let table = emb.table().tensor().to_f64_vec().unwrap();
        assert_eq!(&h.to_f64_vec().unwrap()[3..6], &table[21..24]);
    }

    #[test]
    fn test_axial_is_mean_of_axis_tables() {
        let mut vs = VarStore::new(VariableDType::uniform(DType::F64), 0);
        let embd = Dim::new("embd", 2);
        let pe = PositionEmbedding::axial(&mut vs.root(), (2, 3), &embd, 0.0).unwrap();
        assert_eq!(pe.length(), 6);
        assert_eq!(pe.num_parameters(), (2 + 3) * 2);
        let table = pe.table().unwrap().to_f64_vec().unwrap();
        let a0 = vs.get("axial_wpe_1").unwrap().tensor().to_f64_vec().unwrap();
        let a1 = vs.get("axial_wpe_2").unwrap().tensor().to_f64_vec().unwrap();
        // position 4 = (1, 1)
        for e in 0..2 {
            let expected = (a0[2 + e] + a1[2 + e]) / 2.0;
            assert!((table[4 * 2 + e] - expected).abs() < 1e-12);
        }
    }
}
