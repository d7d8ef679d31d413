// tr_curve.rs — quadratic patch subdivision
// Converted from: code/rd-vanilla/tr_curve.cpp
//
// Patches are authored as coarse quadratic control grids. At load time each
// is subdivided into a fixed fine mesh, remembering per-column and per-row
// worst-case curve deviation so the tessellator can drop rows again at
// render time based on view distance.

use myq3_common::q_shared::{
    add_point_to_bounds, clear_bounds, cross_product, dot_product, vector_ma, vector_normalize,
    vector_scale, vector_subtract, Vec3,
};
use myq3_common::qfiles::MAXLIGHTMAPS;

use crate::tr_local::{DrawVert, SrfGridMesh, MAX_GRID_SIZE};

/// Stop subdividing once the curve is within this many world units of the
/// flat approximation.
pub const SUBDIVIDE_DISTANCE: f32 = 16.0;

/// Interior columns/rows whose curve deviation fell below the colinear
/// threshold carry this marker until they are culled.
const COLINEAR: f32 = -1.0;

/// Control mesh being subdivided, fixed MAX_GRID_SIZE stride.
struct CtrlGrid {
    verts: Vec<DrawVert>,
}

impl CtrlGrid {
    fn new() -> Self {
        Self {
            verts: vec![DrawVert::default(); MAX_GRID_SIZE * MAX_GRID_SIZE],
        }
    }

    #[inline]
    fn at(&self, row: usize, col: usize) -> &DrawVert {
        &self.verts[row * MAX_GRID_SIZE + col]
    }

    #[inline]
    fn at_mut(&mut self, row: usize, col: usize) -> &mut DrawVert {
        &mut self.verts[row * MAX_GRID_SIZE + col]
    }
}

/// Midpoint of two draw verts. Normals are left alone; they get rebuilt
/// from the final mesh.
fn lerp_draw_vert(a: &DrawVert, b: &DrawVert) -> DrawVert {
    let mut out = DrawVert::default();
    for l in 0..3 {
        out.xyz[l] = 0.5 * (a.xyz[l] + b.xyz[l]);
    }
    for l in 0..2 {
        out.st[l] = 0.5 * (a.st[l] + b.st[l]);
    }
    for k in 0..MAXLIGHTMAPS {
        for l in 0..2 {
            out.lightmap[k][l] = 0.5 * (a.lightmap[k][l] + b.lightmap[k][l]);
        }
        for l in 0..4 {
            out.color[k][l] = ((a.color[k][l] as u32 + b.color[k][l] as u32) >> 1) as u8;
        }
    }
    out
}

fn transpose(ctrl: &mut CtrlGrid, width: usize, height: usize) {
    let mut flipped = CtrlGrid::new();
    for j in 0..height {
        for i in 0..width {
            *flipped.at_mut(i, j) = *ctrl.at(j, i);
        }
    }
    *ctrl = flipped;
}

/// The approximating control points are halfway out from the curve; pull
/// every odd row and column onto the curve itself.
fn put_points_on_curve(ctrl: &mut CtrlGrid, width: usize, height: usize) {
    for i in 0..width {
        let mut j = 1;
        while j < height {
            let prev = lerp_draw_vert(ctrl.at(j, i), ctrl.at(j + 1, i));
            let next = lerp_draw_vert(ctrl.at(j, i), ctrl.at(j - 1, i));
            *ctrl.at_mut(j, i) = lerp_draw_vert(&prev, &next);
            j += 2;
        }
    }
    for j in 0..height {
        let mut i = 1;
        while i < width {
            let prev = lerp_draw_vert(ctrl.at(j, i), ctrl.at(j, i + 1));
            let next = lerp_draw_vert(ctrl.at(j, i), ctrl.at(j, i - 1));
            *ctrl.at_mut(j, i) = lerp_draw_vert(&prev, &next);
            i += 2;
        }
    }
}

fn make_mesh_normals(ctrl: &mut CtrlGrid, width: usize, height: usize) {
    const NEIGHBORS: [[i32; 2]; 8] = [
        [0, 1],
        [1, 1],
        [1, 0],
        [1, -1],
        [0, -1],
        [-1, -1],
        [-1, 0],
        [-1, 1],
    ];

    // closed patches (cylinders, cones) wrap their lighting around the seam
    let mut wrap_width = true;
    'ww: for i in 0..height {
        for l in 0..3 {
            let d = ctrl.at(i, 0).xyz[l] - ctrl.at(i, width - 1).xyz[l];
            if d.abs() > 1.0 {
                wrap_width = false;
                break 'ww;
            }
        }
    }
    let mut wrap_height = true;
    'wh: for i in 0..width {
        for l in 0..3 {
            let d = ctrl.at(0, i).xyz[l] - ctrl.at(height - 1, i).xyz[l];
            if d.abs() > 1.0 {
                wrap_height = false;
                break 'wh;
            }
        }
    }

    for i in 0..width {
        for j in 0..height {
            let base = ctrl.at(j, i).xyz;
            let mut around = [[0.0f32; 3]; 8];
            let mut good = [false; 8];

            for k in 0..8 {
                // walk outward until a distinct point shows up; doubled-up
                // control points are common at patch edges
                for dist in 1..=3i32 {
                    let mut x = i as i32 + NEIGHBORS[k][0] * dist;
                    let mut y = j as i32 + NEIGHBORS[k][1] * dist;
                    if wrap_width {
                        if x < 0 {
                            x += width as i32 - 1;
                        } else if x >= width as i32 {
                            x = 1 + x - width as i32;
                        }
                    }
                    if wrap_height {
                        if y < 0 {
                            y += height as i32 - 1;
                        } else if y >= height as i32 {
                            y = 1 + y - height as i32;
                        }
                    }
                    if x < 0 || x >= width as i32 || y < 0 || y >= height as i32 {
                        break; // edge of patch
                    }
                    let mut temp =
                        vector_subtract(&ctrl.at(y as usize, x as usize).xyz, &base);
                    if vector_normalize(&mut temp) == 0.0 {
                        continue; // degenerate edge, try a further point
                    }
                    good[k] = true;
                    around[k] = temp;
                    break;
                }
            }

            let mut sum = [0.0f32; 3];
            for k in 0..8 {
                if !good[k] || !good[(k + 1) & 7] {
                    continue;
                }
                let mut normal = cross_product(&around[(k + 1) & 7], &around[k]);
                if vector_normalize(&mut normal) == 0.0 {
                    continue;
                }
                for l in 0..3 {
                    sum[l] += normal[l];
                }
            }
            vector_normalize(&mut sum);
            ctrl.at_mut(j, i).normal = sum;
        }
    }
}

fn create_surface_grid_mesh(
    ctrl: &CtrlGrid,
    width: usize,
    height: usize,
    width_error: &[f32],
    height_error: &[f32],
) -> SrfGridMesh {
    let mut grid = SrfGridMesh {
        width,
        height,
        width_lod_error: width_error[..width].to_vec(),
        height_lod_error: height_error[..height].to_vec(),
        verts: Vec::with_capacity(width * height),
        ..Default::default()
    };

    clear_bounds(&mut grid.mesh_bounds);
    for j in 0..height {
        for i in 0..width {
            let vert = *ctrl.at(j, i);
            add_point_to_bounds(&vert.xyz, &mut grid.mesh_bounds);
            grid.verts.push(vert);
        }
    }

    let origin = vector_scale(
        &[
            grid.mesh_bounds[0][0] + grid.mesh_bounds[1][0],
            grid.mesh_bounds[0][1] + grid.mesh_bounds[1][1],
            grid.mesh_bounds[0][2] + grid.mesh_bounds[1][2],
        ],
        0.5,
    );
    grid.local_origin = origin;
    let diag = vector_subtract(&grid.mesh_bounds[0], &origin);
    grid.mesh_radius = myq3_common::q_shared::vector_length(&diag);

    grid
}

/// Subdivide an authored control grid (`height` rows of `width` points)
/// into the fine render mesh. The result carries the worst-case curve
/// deviation, in world units, for every interior column and row; the first
/// and last entries are always zero.
pub fn subdivide_patch_to_grid(width: usize, height: usize, points: &[DrawVert]) -> SrfGridMesh {
    let mut width = width;
    let mut height = height;

    let mut ctrl = CtrlGrid::new();
    for j in 0..height {
        for i in 0..width {
            *ctrl.at_mut(j, i) = points[j * width + i];
        }
    }

    let mut error_table = [[0.0f32; MAX_GRID_SIZE]; 2];

    for dir in 0..2 {
        for j in 0..MAX_GRID_SIZE {
            error_table[dir][j] = 0.0;
        }

        // subdivide along the columns
        let mut j = 0;
        while j + 2 < width {
            // measure how far the curve through each column triple strays
            // from the straight line between its endpoints
            let mut max_len_sq = 0.0f32;
            for i in 0..height {
                // point on the curve at the middle of the span
                let mut midxyz = [0.0f32; 3];
                for l in 0..3 {
                    midxyz[l] = (ctrl.at(i, j).xyz[l]
                        + ctrl.at(i, j + 1).xyz[l] * 2.0
                        + ctrl.at(i, j + 2).xyz[l])
                        * 0.25;
                }

                // distance from the chord, not from the chord midpoint
                midxyz = vector_subtract(&midxyz, &ctrl.at(i, j).xyz);
                let mut chord = vector_subtract(&ctrl.at(i, j + 2).xyz, &ctrl.at(i, j).xyz);
                vector_normalize(&mut chord);
                let d = dot_product(&midxyz, &chord);
                let off_line = vector_ma(&midxyz, -d, &chord);
                let len_sq = dot_product(&off_line, &off_line);
                if len_sq > max_len_sq {
                    max_len_sq = len_sq;
                }
            }
            let max_len = max_len_sq.sqrt();

            // all points on the chord: the whole column pair can go away
            if max_len < 0.1 {
                error_table[dir][j + 1] = COLINEAR;
                j += 2;
                continue;
            }

            // out of room to subdivide further
            if width + 2 > MAX_GRID_SIZE {
                error_table[dir][j + 1] = max_len;
                j += 2;
                continue;
            }

            // close enough to flat
            if max_len <= SUBDIVIDE_DISTANCE {
                error_table[dir][j + 1] = max_len;
                j += 2;
                continue;
            }

            error_table[dir][j + 2] = max_len;

            // insert two columns and replace the peak
            width += 2;
            for i in 0..height {
                let prev = lerp_draw_vert(ctrl.at(i, j), ctrl.at(i, j + 1));
                let next = lerp_draw_vert(ctrl.at(i, j + 1), ctrl.at(i, j + 2));
                let mid = lerp_draw_vert(&prev, &next);

                let mut k = width - 1;
                while k > j + 3 {
                    *ctrl.at_mut(i, k) = *ctrl.at(i, k - 2);
                    k -= 1;
                }
                *ctrl.at_mut(i, j + 1) = prev;
                *ctrl.at_mut(i, j + 2) = mid;
                *ctrl.at_mut(i, j + 3) = next;
            }

            // recheck the same span, it may still be too coarse
        }

        transpose(&mut ctrl, width, height);
        std::mem::swap(&mut width, &mut height);
    }

    // put all the approximating points on the curve
    put_points_on_curve(&mut ctrl, width, height);

    // cull out any columns that are colinear
    let mut i = 1;
    while i < width - 1 {
        if error_table[0][i] != COLINEAR {
            i += 1;
            continue;
        }
        for k in i + 1..width {
            for j in 0..height {
                *ctrl.at_mut(j, k - 1) = *ctrl.at(j, k);
            }
            error_table[0][k - 1] = error_table[0][k];
        }
        width -= 1;
    }

    // and any rows
    let mut i = 1;
    while i < height - 1 {
        if error_table[1][i] != COLINEAR {
            i += 1;
            continue;
        }
        for k in i + 1..height {
            for j in 0..width {
                *ctrl.at_mut(k - 1, j) = *ctrl.at(k, j);
            }
            error_table[1][k - 1] = error_table[1][k];
        }
        height -= 1;
    }

    // edges never participate in LOD selection
    error_table[0][0] = 0.0;
    error_table[0][width - 1] = 0.0;
    error_table[1][0] = 0.0;
    error_table[1][height - 1] = 0.0;

    make_mesh_normals(&mut ctrl, width, height);

    create_surface_grid_mesh(&ctrl, width, height, &error_table[0], &error_table[1])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vert_at(x: f32, y: f32, z: f32) -> DrawVert {
        let mut v = DrawVert::default();
        v.xyz = [x, y, z];
        v.st = [x / 100.0, y / 100.0];
        v
    }

    /// 3x3 control grid lying flat in the xy plane.
    fn flat_patch() -> Vec<DrawVert> {
        let mut points = Vec::new();
        for j in 0..3 {
            for i in 0..3 {
                points.push(vert_at(i as f32 * 50.0, j as f32 * 50.0, 0.0));
            }
        }
        points
    }

    /// 3x3 control grid arched along the width axis.
    fn arched_patch(peak: f32) -> Vec<DrawVert> {
        let mut points = Vec::new();
        for j in 0..3 {
            for i in 0..3 {
                let z = if i == 1 { peak } else { 0.0 };
                points.push(vert_at(i as f32 * 100.0, j as f32 * 100.0, z));
            }
        }
        points
    }

    #[test]
    fn test_flat_patch_collapses_to_corners() {
        let grid = subdivide_patch_to_grid(3, 3, &flat_patch());
        // both interior lines are colinear and get culled
        assert_eq!(grid.width, 2);
        assert_eq!(grid.height, 2);
        assert_eq!(grid.verts.len(), 4);
    }

    #[test]
    fn test_arched_patch_subdivides() {
        // peak 200 deviates ~100 units from the chord, well past the
        // subdivide threshold
        let grid = subdivide_patch_to_grid(3, 3, &arched_patch(200.0));
        assert!(grid.width > 3, "width = {}", grid.width);
        assert_eq!(grid.verts.len(), grid.width * grid.height);
        assert_eq!(grid.width_lod_error.len(), grid.width);
        assert_eq!(grid.height_lod_error.len(), grid.height);
    }

    #[test]
    fn test_edge_lod_errors_are_zero() {
        let grid = subdivide_patch_to_grid(3, 3, &arched_patch(200.0));
        assert_eq!(grid.width_lod_error[0], 0.0);
        assert_eq!(grid.width_lod_error[grid.width - 1], 0.0);
        assert_eq!(grid.height_lod_error[0], 0.0);
        assert_eq!(grid.height_lod_error[grid.height - 1], 0.0);
    }

    #[test]
    fn test_interior_lod_errors_positive_on_curved_patch() {
        let grid = subdivide_patch_to_grid(3, 3, &arched_patch(200.0));
        // after culling no colinear markers may survive, and curvature in
        // the width direction must be recorded
        for &e in &grid.width_lod_error {
            assert!(e >= 0.0);
        }
        assert!(grid.width_lod_error[1..grid.width - 1]
            .iter()
            .any(|&e| e > 0.0));
    }

    #[test]
    fn test_flat_patch_normals_point_up() {
        // use an arch too shallow to subdivide or cull so the grid keeps
        // its 3x3 shape but stays nearly planar
        let grid = subdivide_patch_to_grid(3, 3, &arched_patch(0.5));
        for v in &grid.verts {
            assert!(v.normal[2].abs() > 0.9, "normal = {:?}", v.normal);
        }
    }

    #[test]
    fn test_mesh_bounds_enclose_verts() {
        let grid = subdivide_patch_to_grid(3, 3, &arched_patch(200.0));
        for v in &grid.verts {
            for l in 0..3 {
                assert!(v.xyz[l] >= grid.mesh_bounds[0][l] - 0.01);
                assert!(v.xyz[l] <= grid.mesh_bounds[1][l] + 0.01);
            }
        }
    }

    #[test]
    fn test_subdivision_respects_grid_cap() {
        // a violently curved patch must still fit MAX_GRID_SIZE
        let grid = subdivide_patch_to_grid(3, 3, &arched_patch(20000.0));
        assert!(grid.width <= MAX_GRID_SIZE);
        assert!(grid.height <= MAX_GRID_SIZE);
    }

    #[test]
    fn test_lerp_draw_vert_midpoint() {
        let a = vert_at(0.0, 0.0, 0.0);
        let b = vert_at(10.0, 20.0, 30.0);
        let mid = lerp_draw_vert(&a, &b);
        assert_eq!(mid.xyz, [5.0, 10.0, 15.0]);
        assert_eq!(mid.st, [0.05, 0.1]);
    }

    #[test]
    fn test_lerp_draw_vert_colors() {
        let mut a = DrawVert::default();
        let mut b = DrawVert::default();
        a.color[0] = [200, 0, 100, 255];
        b.color[0] = [100, 50, 100, 255];
        let mid = lerp_draw_vert(&a, &b);
        assert_eq!(mid.color[0], [150, 25, 100, 255]);
    }

    #[test]
    fn test_put_points_on_curve_interpolates_midpoint() {
        // after subdivision the approximating midpoints move onto the
        // curve, so every vertex of the arch must sit strictly below the
        // control peak
        let grid = subdivide_patch_to_grid(3, 3, &arched_patch(200.0));
        for v in &grid.verts {
            assert!(v.xyz[2] <= 100.0 + 0.01, "z = {}", v.xyz[2]);
        }
    }
}
