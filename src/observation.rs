//! The torque-residual observation model. Maps a surface particle, the
//! current joint configuration (via the supplied Jacobian and
//! wrench-transform maps) and the measured external torque to a scalar
//! likelihood.

use nalgebra::{DMatrix, DVector, Isometry3, Matrix3, Matrix6, Vector3, Vector6};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::{ArmclError, Result};
use crate::mesh::MeshMapTree;
use crate::state::SurfaceState;

fn skew(v: Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Adjoint transform for a wrench ordered `[moment; force]` under a rigid
/// transform `(R, p)`. Built by hand (rather than via a wrench/twist type
/// from an external crate) since the contact wrench's 6-vector layout is
/// fixed and only the finger pre-transform needs this; see DESIGN.md for
/// the layout choice.
fn wrench_adjoint(iso: &Isometry3<f64>) -> Matrix6<f64> {
    let r = iso.rotation.to_rotation_matrix().into_inner();
    let p = iso.translation.vector;
    let skew_p_r = skew(p) * r;
    let mut m = Matrix6::zeros();
    for i in 0..3 {
        for j in 0..3 {
            m[(i, j)] = r[(i, j)];
            m[(i, j + 3)] = skew_p_r[(i, j)];
            m[(i + 3, j + 3)] = r[(i, j)];
        }
    }
    m
}

/// The torque-residual likelihood model.
pub struct ObservationModel {
    pub info_matrix: DMatrix<f64>,
    pub finger_frames: FxHashSet<String>,
}

impl ObservationModel {
    pub fn new(info_matrix: DMatrix<f64>, finger_frames: FxHashSet<String>) -> Self {
        ObservationModel {
            info_matrix,
            finger_frames,
        }
    }

    /// Substring-match fallback is only used when no `finger_frames` were
    /// configured explicitly.
    fn is_finger(&self, frame_id: &str) -> bool {
        if self.finger_frames.is_empty() {
            frame_id.contains("finger")
        } else {
            self.finger_frames.contains(frame_id)
        }
    }

    /// Predicts joint torque for one particle, writing `state.force` and
    /// `state.last_update` and returning the likelihood (the particle's
    /// new weight).
    pub fn reweight(
        &self,
        state: &mut SurfaceState,
        tree: &MeshMapTree,
        tau_ext: &DVector<f64>,
        jacobians: &FxHashMap<usize, DMatrix<f64>>,
        wrench_transforms: &FxHashMap<usize, Isometry3<f64>>,
    ) -> Result<f64> {
        let frame_id = tree.node(state.map_id).frame_id.clone();
        let p = state.position(tree);
        let n = state.normal(tree);
        let moment = p.cross(&n);
        let mut w = Vector6::new(moment.x, moment.y, moment.z, n.x, n.y, n.z);

        if self.is_finger(&frame_id) {
            let transform = wrench_transforms.get(&state.map_id).ok_or(
                ArmclError::MissingKinematics {
                    map_id: state.map_id,
                },
            )?;
            w = wrench_adjoint(transform) * w;
        }

        let jacobian =
            jacobians
                .get(&state.map_id)
                .ok_or(ArmclError::MissingKinematics {
                    map_id: state.map_id,
                })?;
        if jacobian.ncols() != 6 {
            return Err(ArmclError::InvalidInput(format!(
                "jacobian for map_id {} has {} columns, expected 6",
                state.map_id,
                jacobian.ncols()
            )));
        }

        let j_dim = tau_ext.len();
        let raw = jacobian * w;
        let mut tau_pred = DVector::zeros(j_dim);
        let copy_len = raw.len().min(j_dim);
        for i in 0..copy_len {
            tau_pred[i] = raw[i];
        }

        // Each vector is normalised on its own >1e-5 test, not gated on
        // both at once: a particle whose predicted torque vanishes but
        // whose sensed torque doesn't must keep a nonzero residual, not
        // cancel to a perfect (and spurious) match.
        let tsn = tau_ext.norm();
        let tpn = tau_pred.norm();
        let tau_ext_unit = if tsn > 1e-5 {
            tau_ext / tsn
        } else {
            DVector::zeros(j_dim)
        };
        state.force = 0.0;
        let tau_pred_unit = if tpn > 1e-5 {
            state.force = tsn / tpn;
            tau_pred / tpn
        } else {
            DVector::zeros(j_dim)
        };

        let residual = &tau_ext_unit - &tau_pred_unit;
        let exponent = (residual.transpose() * &self.info_matrix * &residual)[(0, 0)];
        let likelihood = (-0.5 * exponent).exp();

        state.last_update = likelihood;
        Ok(likelihood)
    }
}
