// Reverse pass over a Tape.
//
// Each vector-Jacobian product is emitted as new tape ops rather than computed
// on raw tensors. In `GraphMode::Retain` the returned gradients therefore keep
// their dependence on the parameters and can be differentiated again.

use super::tape::{Op, Tape, Var};
use crate::error::{MamlError, Result};
use crate::tensor::{self, DTYPE};

/// Whether gradients stay connected to the graph that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GraphMode {
    /// Gradients are differentiable nodes (second-order).
    #[default]
    Retain,
    /// Gradients are constants cut from the graph (first-order).
    Detach,
}

/// Gradient of a scalar `output` with respect to each node in `wrt`.
///
/// Returns one node per entry of `wrt`, in the same order and with the same
/// shape as the corresponding value. Entries that `output` does not depend on
/// receive zeros.
///
/// # Errors
///
/// Returns [`MamlError::NonScalarOutput`] if `output` holds more than one
/// element, or a shape error if the tape is inconsistent.
pub fn grad(tape: &mut Tape, output: Var, wrt: &[Var], mode: GraphMode) -> Result<Vec<Var>> {
    let out_shape = tape.value(output).dims().to_vec();
    if tape.value(output).elem_count() != 1 {
        return Err(MamlError::NonScalarOutput(out_shape));
    }

    let mut adjoints: Vec<Option<Var>> = vec![None; output.index() + 1];
    if tape.requires_grad(output) {
        adjoints[output.index()] = Some(tape.constant(tensor::ones(&out_shape)?));
    }

    for i in (0..=output.index()).rev() {
        let Some(g) = adjoints[i] else { continue };
        let node = tape.node(i);
        if !node.requires_grad {
            continue;
        }
        let op = node.op.clone();
        for (input, contribution) in vjp(tape, &op, i, g)? {
            accumulate(tape, &mut adjoints, input, contribution)?;
        }
    }

    wrt.iter()
        .map(|&v| -> Result<Var> {
            let adjoint = adjoints.get(v.index()).copied().flatten();
            Ok(match (adjoint, mode) {
                (Some(g), GraphMode::Retain) => g,
                (Some(g), GraphMode::Detach) => tape.detach(g),
                (None, _) => {
                    let zeros = tape.value(v).zeros_like()?;
                    tape.constant(zeros)
                }
            })
        })
        .collect()
}

fn accumulate(
    tape: &mut Tape,
    adjoints: &mut [Option<Var>],
    input: Var,
    contribution: Var,
) -> Result<()> {
    let slot = &mut adjoints[input.index()];
    *slot = Some(match *slot {
        Some(existing) => tape.add(existing, contribution)?,
        None => contribution,
    });
    Ok(())
}

/// Contributions of node `index` (with upstream gradient `g`) to its inputs.
/// Inputs that do not require gradients are skipped.
fn vjp(tape: &mut Tape, op: &Op, index: usize, g: Var) -> Result<Vec<(Var, Var)>> {
    let wants = |tape: &Tape, v: Var| tape.requires_grad(v);
    let mut out = Vec::with_capacity(2);

    match *op {
        Op::Leaf => {}

        Op::MatMul { a, b } => {
            if wants(tape, a) {
                let bt = tape.transpose(b)?;
                out.push((a, tape.matmul(g, bt)?));
            }
            if wants(tape, b) {
                let at = tape.transpose(a)?;
                out.push((b, tape.matmul(at, g)?));
            }
        }

        Op::Transpose { a } => {
            if wants(tape, a) {
                out.push((a, tape.transpose(g)?));
            }
        }

        Op::Add { a, b } => {
            if wants(tape, a) {
                out.push((a, g));
            }
            if wants(tape, b) {
                out.push((b, g));
            }
        }

        Op::Mul { a, b } => {
            if wants(tape, a) {
                out.push((a, tape.mul(g, b)?));
            }
            if wants(tape, b) {
                out.push((b, tape.mul(g, a)?));
            }
        }

        Op::Scale { a, factor } => {
            if wants(tape, a) {
                out.push((a, tape.scale(g, factor)?));
            }
        }

        Op::Relu { a } => {
            if wants(tape, a) {
                // d relu / dx is piecewise constant, so the mask carries no gradient.
                let mask = tape.value(a).gt(0.0)?.to_dtype(DTYPE)?;
                let mask = tape.constant(mask);
                out.push((a, tape.mul(g, mask)?));
            }
        }

        Op::BroadcastRows { a } => {
            if wants(tape, a) {
                out.push((a, tape.sum_rows(g)?));
            }
        }

        Op::SumRows { a } => {
            if wants(tape, a) {
                let (rows, _) = tensor::dims2("sum_rows", tape.value(a))?;
                out.push((a, tape.broadcast_rows(g, rows)?));
            }
        }

        Op::SumAll { a } => {
            if wants(tape, a) {
                let shape = tape.value(a).dims().to_vec();
                out.push((a, tape.expand(g, &shape)?));
            }
        }

        Op::Expand { a } => {
            if wants(tape, a) {
                out.push((a, tape.sum_all(g)?));
            }
        }

        Op::ConcatCols { a, b } => {
            let left = tensor::dims2("concat_cols", tape.value(a))?.1;
            if wants(tape, a) {
                out.push((a, tape.slice_cols(g, 0, left)?));
            }
            if wants(tape, b) {
                let right = tensor::dims2("concat_cols", tape.value(b))?.1;
                out.push((b, tape.slice_cols(g, left, right)?));
            }
        }

        Op::SliceCols { a, start, len } => {
            if wants(tape, a) {
                let (rows, cols) = tensor::dims2("slice_cols", tape.value(a))?;
                let mut padded = g;
                if start > 0 {
                    let before = tape.constant(tensor::zeros(&[rows, start])?);
                    padded = tape.concat_cols(before, padded)?;
                }
                let tail = cols - start - len;
                if tail > 0 {
                    let after = tape.constant(tensor::zeros(&[rows, tail])?);
                    padded = tape.concat_cols(padded, after)?;
                }
                out.push((a, padded));
            }
        }
    }

    debug_assert!(out.iter().all(|(v, _)| v.index() < index));
    Ok(out)
}
