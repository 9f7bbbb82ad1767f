//! Stage coordinates from substrate geometry and percent edge offsets.
//!
//! For one axis the inputs are the number of points and two edge offsets in percent.
//! A beam width of [`BEAM_WIDTH_MM`] is kept clear at the sample edges; the offsets
//! shrink the usable span further. A single point is centered in the usable span.

use crate::error::{AppResult, DaqError};

/// Beam width reserved at the sample edges (mm).
pub const BEAM_WIDTH_MM: f64 = 4.0;

/// User input for one position axis.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AxisInput {
    /// Number of points.
    pub num: usize,
    /// Offset from the near edge in percent.
    pub off1: f64,
    /// Offset from the far edge in percent.
    pub off2: f64,
}

/// Geometry of one axis in stage coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AxisGeometry {
    /// Stage coordinate of the near sample edge (lightsource origin + holder offset).
    pub start: f64,
    /// Total sample-holder extent along the axis.
    pub sse: f64,
    /// Effective sample extent along the axis.
    pub ss: f64,
}

/// Expanded axis.
#[derive(Clone, Debug, PartialEq)]
pub struct AxisLayout {
    /// Stage positions in scan order.
    pub positions: Vec<f64>,
    /// Near offset in mm.
    pub off1_mm: f64,
    /// Far offset in mm.
    pub off2_mm: f64,
    /// Near offset relative to the outer holder edge, including half the beam width.
    pub edge_off1: f64,
    /// Far offset relative to the outer holder edge, including half the beam width.
    pub edge_off2: f64,
}

/// Expand one axis into stage positions.
pub fn expand_axis(axis: &str, input: AxisInput, geometry: AxisGeometry) -> AppResult<AxisLayout> {
    if input.num == 0 {
        return Err(DaqError::InvalidInput(format!(
            "{}num must be at least 1",
            axis
        )));
    }
    if !(0.0..100.0).contains(&input.off1) || !(0.0..100.0).contains(&input.off2) {
        return Err(DaqError::InvalidInput(format!(
            "{} offsets must be within [0, 100) percent, got {} and {}",
            axis, input.off1, input.off2
        )));
    }

    let usable = geometry.ss - BEAM_WIDTH_MM;
    let off1_mm = usable * input.off1 / (100.0 + input.off2);
    let off2_mm = usable * input.off2 / (100.0 + input.off1);
    let span = usable - off1_mm - off2_mm;
    if span < 0.0 || (input.num > 1 && span <= 0.0) {
        return Err(DaqError::InvalidInput(format!(
            "{} offsets leave no usable span on a {} mm sample",
            axis, geometry.ss
        )));
    }

    let positions = if input.num == 1 {
        vec![geometry.start + (geometry.ss + off1_mm - off2_mm) / 2.0]
    } else {
        let first = geometry.start + BEAM_WIDTH_MM / 2.0 + off1_mm;
        let step = span / (input.num - 1) as f64;
        (0..input.num).map(|i| first + step * i as f64).collect()
    };

    let rim = (geometry.sse - geometry.ss) / 2.0 + BEAM_WIDTH_MM / 2.0;
    Ok(AxisLayout {
        positions,
        off1_mm,
        off2_mm,
        edge_off1: rim + off1_mm,
        edge_off2: rim + off2_mm,
    })
}
