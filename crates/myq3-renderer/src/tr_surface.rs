// tr_surface.rs — tessellates world surfaces into the batch buffer
// Converted from: code/rd-vanilla/tr_surface.cpp

use std::sync::Arc;

use thiserror::Error;

use myq3_common::q_shared::{
    cross_product, distance, dot_product, vector_ma, vector_negate, vector_normalize,
    vector_scale, vector_subtract, Vec3,
};
use myq3_common::qfiles::{LS_UNUSED, MAXLIGHTMAPS, MAX_LIGHT_STYLES};

use crate::tr_local::{
    MSurface, Orientation, RenderConfig, Shader, SrfFace, SrfFlare, SrfGridMesh, SrfTriangles,
    SurfaceData, ViewParms, LIGHTMAP_BY_VERTEX,
};

// ============================================================
// Batch limits
// ============================================================

pub const SHADER_MAX_VERTEXES: usize = 1000;
pub const SHADER_MAX_INDEXES: usize = 6 * SHADER_MAX_VERTEXES;

/// diffuse st plus one set of lightmap coords per style layer
pub const NUM_TEX_COORDS: usize = MAXLIGHTMAPS + 1;

/// A single surface that can never fit in an empty batch buffer. An
/// overflowing buffer with room to spare after a flush is handled
/// internally and is not an error.
#[derive(Debug, Error)]
pub enum TessError {
    #[error("RB_CheckOverflow: verts > MAX ({0} > {1})")]
    VertexOverflow(usize, usize),

    #[error("RB_CheckOverflow: indices > MAX ({0} > {1})")]
    IndexOverflow(usize, usize),
}

// ============================================================
// Backend interface
// ============================================================

/// Whatever consumes finished batches. The world tessellator only flushes
/// into it and asks it one visibility question for flares.
pub trait RenderBackend {
    fn submit_batch(&mut self, tess: &TessBuffer);

    /// Depth-test a single point, used to fade flares behind geometry.
    fn test_flare_visibility(&mut self, origin: &Vec3, view: &ViewParms) -> bool;
}

// ============================================================
// The batch buffer
// ============================================================

/// Accumulates triangles that share a material and fog volume until the
/// backend is told to draw them. All arrays run in parallel per vertex.
pub struct TessBuffer {
    pub xyz: Vec<Vec3>,
    pub normal: Vec<Vec3>,
    pub tex_coords: Vec<[[f32; 2]; NUM_TEX_COORDS]>,
    pub vertex_colors: Vec<[u8; 4]>,
    pub vertex_dlight_bits: Vec<u32>,
    pub indexes: Vec<u32>,

    pub shader: Option<Arc<Shader>>,
    pub fog_num: usize,
    pub dlight_bits: u32,
}

impl Default for TessBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl TessBuffer {
    pub fn new() -> Self {
        Self {
            xyz: Vec::with_capacity(SHADER_MAX_VERTEXES),
            normal: Vec::with_capacity(SHADER_MAX_VERTEXES),
            tex_coords: Vec::with_capacity(SHADER_MAX_VERTEXES),
            vertex_colors: Vec::with_capacity(SHADER_MAX_VERTEXES),
            vertex_dlight_bits: Vec::with_capacity(SHADER_MAX_VERTEXES),
            indexes: Vec::with_capacity(SHADER_MAX_INDEXES),
            shader: None,
            fog_num: 0,
            dlight_bits: 0,
        }
    }

    pub fn num_vertexes(&self) -> usize {
        self.xyz.len()
    }

    pub fn num_indexes(&self) -> usize {
        self.indexes.len()
    }

    /// RB_BeginSurface — start accumulating under a new material / fog
    /// pairing. Anything still buffered is dropped, so callers flush first.
    pub fn begin_surface(&mut self, shader: Arc<Shader>, fog_num: usize) {
        self.clear_geometry();
        self.shader = Some(shader);
        self.fog_num = fog_num;
        self.dlight_bits = 0;
    }

    /// RB_EndSurface — hand the accumulated batch to the backend and reset
    /// the counters. The material and fog binding stay in effect.
    pub fn end_surface(&mut self, backend: &mut dyn RenderBackend) {
        if !self.indexes.is_empty() {
            backend.submit_batch(self);
        }
        self.clear_geometry();
    }

    fn clear_geometry(&mut self) {
        self.xyz.clear();
        self.normal.clear();
        self.tex_coords.clear();
        self.vertex_colors.clear();
        self.vertex_dlight_bits.clear();
        self.indexes.clear();
    }

    /// RB_CHECKOVERFLOW — make room for `verts` / `indexes` more elements,
    /// flushing the current batch if they don't fit.
    pub fn check_overflow(
        &mut self,
        verts: usize,
        indexes: usize,
        backend: &mut dyn RenderBackend,
    ) -> Result<(), TessError> {
        if self.num_vertexes() + verts < SHADER_MAX_VERTEXES
            && self.num_indexes() + indexes < SHADER_MAX_INDEXES
        {
            return Ok(());
        }

        self.end_surface(backend);

        if verts >= SHADER_MAX_VERTEXES {
            return Err(TessError::VertexOverflow(verts, SHADER_MAX_VERTEXES));
        }
        if indexes >= SHADER_MAX_INDEXES {
            return Err(TessError::IndexOverflow(indexes, SHADER_MAX_INDEXES));
        }
        Ok(())
    }
}

// ============================================================
// Vertex color blending
// ============================================================

/// Blend a vertex's style color layers into one final color using the
/// current per-style scales. Materials that aren't lit by vertex keep
/// their base layer untouched; the alpha channel always comes from it.
pub fn compute_final_vertex_color(
    shader: &Shader,
    style_colors: &[[u8; 3]; MAX_LIGHT_STYLES],
    fullbright: bool,
    colors: &[[u8; 4]; MAXLIGHTMAPS],
) -> [u8; 4] {
    if shader.lightmap_index[0] != LIGHTMAP_BY_VERTEX {
        return colors[0];
    }
    if fullbright {
        return [255, 255, 255, colors[0][3]];
    }

    let mut accum = [0u32; 3];
    for k in 0..MAXLIGHTMAPS {
        let style = shader.styles[k];
        if style >= LS_UNUSED || style as usize >= MAX_LIGHT_STYLES {
            break;
        }
        let scale = style_colors[style as usize];
        for c in 0..3 {
            accum[c] += colors[k][c] as u32 * scale[c] as u32;
        }
    }
    [
        (accum[0] >> 8).min(255) as u8,
        (accum[1] >> 8).min(255) as u8,
        (accum[2] >> 8).min(255) as u8,
        colors[0][3],
    ]
}

// ============================================================
// Quad stamps
// ============================================================

fn add_quad_stamp_ext(
    tess: &mut TessBuffer,
    backend: &mut dyn RenderBackend,
    origin: &Vec3,
    left: &Vec3,
    up: &Vec3,
    color: [u8; 4],
    s1: f32,
    t1: f32,
    s2: f32,
    t2: f32,
) -> Result<(), TessError> {
    tess.check_overflow(4, 6, backend)?;

    let ndx = tess.num_vertexes() as u32;

    tess.indexes
        .extend_from_slice(&[ndx, ndx + 1, ndx + 3, ndx + 3, ndx + 1, ndx + 2]);

    tess.xyz.push([
        origin[0] + left[0] + up[0],
        origin[1] + left[1] + up[1],
        origin[2] + left[2] + up[2],
    ]);
    tess.xyz.push([
        origin[0] - left[0] + up[0],
        origin[1] - left[1] + up[1],
        origin[2] - left[2] + up[2],
    ]);
    tess.xyz.push([
        origin[0] - left[0] - up[0],
        origin[1] - left[1] - up[1],
        origin[2] - left[2] - up[2],
    ]);
    tess.xyz.push([
        origin[0] + left[0] - up[0],
        origin[1] + left[1] - up[1],
        origin[2] + left[2] - up[2],
    ]);

    // constant normal all the way around
    let mut normal = cross_product(left, up);
    vector_normalize(&mut normal);

    let st = [[s1, t1], [s2, t1], [s2, t2], [s1, t2]];
    for corner in st.iter() {
        tess.normal.push(normal);
        let mut tc = [[0.0; 2]; NUM_TEX_COORDS];
        tc[0] = *corner;
        tess.tex_coords.push(tc);
        tess.vertex_colors.push(color);
        tess.vertex_dlight_bits.push(0);
    }
    Ok(())
}

fn add_quad_stamp(
    tess: &mut TessBuffer,
    backend: &mut dyn RenderBackend,
    origin: &Vec3,
    left: &Vec3,
    up: &Vec3,
    color: [u8; 4],
) -> Result<(), TessError> {
    add_quad_stamp_ext(tess, backend, origin, left, up, color, 0.0, 0.0, 1.0, 1.0)
}

// ============================================================
// Level of detail
// ============================================================

/// Distance-scaled tolerance a grid line's deviation must beat to stay in
/// the tessellation. Zero and below means keep everything.
pub fn lod_error_for_volume(
    local_origin: &Vec3,
    radius: f32,
    view: &ViewParms,
    ori: &Orientation,
    lod_curve_error: f32,
) -> f32 {
    if lod_curve_error <= 0.0 {
        return 0.0;
    }

    let world = ori.local_to_world(local_origin);
    let to_volume = vector_subtract(&world, &view.ori.origin);
    let mut d = dot_product(&to_volume, &view.ori.axis[0]).abs();

    d -= radius;
    if d < 1.0 {
        d = 1.0;
    }
    d / lod_curve_error
}

/// Pick the grid lines whose stored deviation survives the tolerance. The
/// first and last line always draw so neighbouring patches can't crack.
pub fn select_lod_rows(errors: &[f32], dim: usize, tolerance: f32) -> Vec<usize> {
    let mut rows = Vec::with_capacity(dim);
    rows.push(0);
    for i in 1..dim - 1 {
        if tolerance <= 0.0 || errors[i] > tolerance {
            rows.push(i);
        }
    }
    rows.push(dim - 1);
    rows
}

// ============================================================
// Per-surface tessellation
// ============================================================

/// Per-frame inputs the tessellation paths share.
pub struct DrawContext<'a> {
    pub view: &'a ViewParms,
    pub ori: &'a Orientation,
    pub config: &'a RenderConfig,
    pub style_colors: &'a [[u8; 3]; MAX_LIGHT_STYLES],
}

fn surface_face(
    tess: &mut TessBuffer,
    face: &SrfFace,
    backend: &mut dyn RenderBackend,
) -> Result<(), TessError> {
    tess.check_overflow(face.verts.len(), face.indexes.len(), backend)?;

    let base = tess.num_vertexes() as u32;
    for &idx in &face.indexes {
        tess.indexes.push(base + idx);
    }

    let normal = face.plane.normal;
    for v in &face.verts {
        tess.xyz.push(v.xyz);
        tess.normal.push(normal);
        let mut tc = [[0.0; 2]; NUM_TEX_COORDS];
        tc[0] = v.st;
        for k in 0..MAXLIGHTMAPS {
            tc[k + 1] = v.lightmap[k];
        }
        tess.tex_coords.push(tc);
        // style layers were already folded into one color at load
        tess.vertex_colors.push(v.color);
        tess.vertex_dlight_bits.push(face.dlight_bits);
    }
    Ok(())
}

fn surface_grid(
    tess: &mut TessBuffer,
    grid: &SrfGridMesh,
    backend: &mut dyn RenderBackend,
    ctx: &DrawContext,
) -> Result<(), TessError> {
    let shader = match &tess.shader {
        Some(s) => s.clone(),
        None => return Ok(()),
    };

    // determine the allowable discrepancy, then drop the rows and columns
    // whose curve deviation the viewer can't see from here
    let tolerance = lod_error_for_volume(
        &grid.lod_origin,
        grid.lod_radius,
        ctx.view,
        ctx.ori,
        ctx.config.lod_curve_error,
    );
    let width_rows = select_lod_rows(&grid.width_lod_error, grid.width, tolerance);
    let height_rows = select_lod_rows(&grid.height_lod_error, grid.height, tolerance);
    let lod_width = width_rows.len();
    let lod_height = height_rows.len();

    // a grid can be arbitrarily large, so it is streamed through the
    // buffer a span of rows at a time, resending the shared edge row
    let mut used = 0;
    while used < lod_height - 1 {
        // see how many rows of both verts and indexes fit in what's left
        let (vrows, irows) = loop {
            let vrows = (SHADER_MAX_VERTEXES - tess.num_vertexes()) / lod_width;
            let irows = (SHADER_MAX_INDEXES - tess.num_indexes()) / (lod_width * 6);
            if vrows >= 2 && irows >= 1 {
                break (vrows, irows);
            }
            tess.end_surface(backend);
        };

        let mut rows = irows.min(vrows - 1);
        if used + rows > lod_height {
            rows = lod_height - used;
        }

        let base = tess.num_vertexes() as u32;
        for r in 0..rows {
            let src_row = height_rows[used + r];
            for &src_col in &width_rows {
                let dv = &grid.verts[src_row * grid.width + src_col];
                tess.xyz.push(dv.xyz);
                tess.normal.push(dv.normal);
                let mut tc = [[0.0; 2]; NUM_TEX_COORDS];
                tc[0] = dv.st;
                for k in 0..MAXLIGHTMAPS {
                    tc[k + 1] = dv.lightmap[k];
                }
                tess.tex_coords.push(tc);
                tess.vertex_colors.push(compute_final_vertex_color(
                    &shader,
                    ctx.style_colors,
                    ctx.config.fullbright,
                    &dv.color,
                ));
                tess.vertex_dlight_bits.push(grid.dlight_bits);
            }
        }

        for r in 0..rows - 1 {
            for c in 0..lod_width - 1 {
                let v1 = base + (r * lod_width + c) as u32;
                let v2 = v1 + 1;
                let v3 = v1 + lod_width as u32;
                let v4 = v3 + 1;
                tess.indexes.extend_from_slice(&[v2, v3, v1, v2, v4, v3]);
            }
        }

        // the last row emitted is resent as the first row of the next span
        used += rows - 1;
    }
    Ok(())
}

fn surface_triangles(
    tess: &mut TessBuffer,
    tri: &SrfTriangles,
    backend: &mut dyn RenderBackend,
    ctx: &DrawContext,
) -> Result<(), TessError> {
    let shader = match &tess.shader {
        Some(s) => s.clone(),
        None => return Ok(()),
    };

    tess.check_overflow(tri.verts.len(), tri.indexes.len(), backend)?;

    let base = tess.num_vertexes() as u32;
    for &idx in &tri.indexes {
        tess.indexes.push(base + idx);
    }

    for v in &tri.verts {
        tess.xyz.push(v.xyz);
        tess.normal.push(v.normal);
        let mut tc = [[0.0; 2]; NUM_TEX_COORDS];
        tc[0] = v.st;
        for k in 0..MAXLIGHTMAPS {
            if shader.lightmap_index[k] < 0 {
                break;
            }
            tc[k + 1] = v.lightmap[k];
        }
        tess.tex_coords.push(tc);
        tess.vertex_colors.push(compute_final_vertex_color(
            &shader,
            ctx.style_colors,
            ctx.config.fullbright,
            &v.color,
        ));
        tess.vertex_dlight_bits.push(tri.dlight_bits);
    }
    Ok(())
}

fn surface_flare(
    tess: &mut TessBuffer,
    flare: &SrfFlare,
    backend: &mut dyn RenderBackend,
    ctx: &DrawContext,
) -> Result<(), TessError> {
    if !ctx.config.flares {
        return Ok(());
    }
    if !backend.test_flare_visibility(&flare.origin, ctx.view) {
        return Ok(());
    }

    // push the flare off the surface it sits on
    let origin = vector_ma(&flare.origin, 3.0, &flare.normal);

    // fade by angle off the surface normal
    let mut dir = vector_subtract(&origin, &ctx.view.ori.origin);
    vector_normalize(&mut dir);
    let d = dot_product(&dir, &flare.normal).abs();
    let intensity = (d * 255.0 + 0.5) as u8;
    let color = [intensity, intensity, intensity, 255];

    let portal_range = tess
        .shader
        .as_ref()
        .map(|s| s.portal_range)
        .unwrap_or(0.0);
    let mut radius = if portal_range > 0.0 { portal_range } else { 30.0 };
    let dist = distance(&origin, &ctx.view.ori.origin);
    if dist < 512.0 {
        radius = radius * dist / 512.0;
        if radius < 5.0 {
            radius = 5.0;
        }
    }

    let mut left = vector_scale(&ctx.view.ori.axis[1], radius);
    let up = vector_scale(&ctx.view.ori.axis[2], radius);
    if ctx.view.is_mirror {
        left = vector_negate(&left);
    }

    add_quad_stamp(tess, backend, &origin, &left, &up, color)
}

/// Append one world surface's triangles to the batch buffer. The buffer
/// must already be bound to the surface's material via `begin_surface`.
pub fn tessellate_surface(
    tess: &mut TessBuffer,
    data: &SurfaceData,
    backend: &mut dyn RenderBackend,
    ctx: &DrawContext,
) -> Result<(), TessError> {
    match data {
        SurfaceData::Face(face) => surface_face(tess, face, backend),
        SurfaceData::Grid(grid) => surface_grid(tess, grid, backend, ctx),
        SurfaceData::Triangles(tri) => surface_triangles(tess, tri, backend, ctx),
        SurfaceData::Flare(flare) => surface_flare(tess, flare, backend, ctx),
        SurfaceData::Skip => Ok(()),
    }
}

/// Feed one surface through the batcher, flushing first when its material
/// or fog volume differs from what the buffer is accumulating.
pub fn draw_surface(
    tess: &mut TessBuffer,
    surf: &MSurface,
    backend: &mut dyn RenderBackend,
    ctx: &DrawContext,
) -> Result<(), TessError> {
    let same_batch = match &tess.shader {
        Some(s) => Arc::ptr_eq(s, &surf.shader) && tess.fog_num == surf.fog_index,
        None => false,
    };
    if !same_batch {
        tess.end_surface(backend);
        tess.begin_surface(surf.shader.clone(), surf.fog_index);
    }
    tessellate_surface(tess, &surf.data, backend, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tr_local::{DrawVert, FaceVert, LIGHTMAPS_VERTEX, STYLES_DEFAULT};
    use myq3_common::q_shared::CPlane;
    use myq3_common::qfiles::LS_NONE;

    // ---------------------------------------------------------
    //  fixtures
    // ---------------------------------------------------------

    #[derive(Default)]
    struct MockBackend {
        batches: Vec<(usize, usize)>, // (verts, indexes) per submit
        flare_visible: bool,
    }

    impl RenderBackend for MockBackend {
        fn submit_batch(&mut self, tess: &TessBuffer) {
            self.batches.push((tess.num_vertexes(), tess.num_indexes()));
        }

        fn test_flare_visibility(&mut self, _origin: &Vec3, _view: &ViewParms) -> bool {
            self.flare_visible
        }
    }

    fn vertex_lit_shader(styles: [u8; MAXLIGHTMAPS]) -> Arc<Shader> {
        Arc::new(Shader {
            name: "textures/test/vlit".to_string(),
            lightmap_index: LIGHTMAPS_VERTEX,
            styles,
            default_shader: false,
            ..Default::default()
        })
    }

    fn default_ctx<'a>(
        view: &'a ViewParms,
        ori: &'a Orientation,
        config: &'a RenderConfig,
        style_colors: &'a [[u8; 3]; MAX_LIGHT_STYLES],
    ) -> DrawContext<'a> {
        DrawContext {
            view,
            ori,
            config,
            style_colors,
        }
    }

    fn quad_face() -> SrfFace {
        let mut face = SrfFace {
            plane: CPlane {
                normal: [0.0, 0.0, 1.0],
                ..Default::default()
            },
            ..Default::default()
        };
        for (x, y) in [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)] {
            face.verts.push(FaceVert {
                xyz: [x, y, 0.0],
                st: [x, y],
                color: [200, 150, 100, 255],
                ..Default::default()
            });
        }
        face.indexes = vec![0, 1, 2, 0, 2, 3];
        face
    }

    /// A width x height grid of unit-spaced verts with the given lod error
    /// on every interior line.
    fn flat_grid(width: usize, height: usize, lod_error: f32) -> SrfGridMesh {
        let mut grid = SrfGridMesh {
            width,
            height,
            width_lod_error: vec![lod_error; width],
            height_lod_error: vec![lod_error; height],
            ..Default::default()
        };
        grid.width_lod_error[0] = 0.0;
        grid.width_lod_error[width - 1] = 0.0;
        grid.height_lod_error[0] = 0.0;
        grid.height_lod_error[height - 1] = 0.0;
        for j in 0..height {
            for i in 0..width {
                grid.verts.push(DrawVert {
                    xyz: [i as f32, j as f32, 0.0],
                    color: [[128, 128, 128, 255]; MAXLIGHTMAPS],
                    ..Default::default()
                });
            }
        }
        grid
    }

    // ---------------------------------------------------------
    //  final vertex color
    // ---------------------------------------------------------

    #[test]
    fn test_final_color_passthrough_without_vertex_light() {
        let shader = Shader::default(); // lightmap_index is LIGHTMAPS_NONE
        let style_colors = [[255u8; 3]; MAX_LIGHT_STYLES];
        let colors = [[10, 20, 30, 40]; MAXLIGHTMAPS];
        assert_eq!(
            compute_final_vertex_color(&shader, &style_colors, false, &colors),
            [10, 20, 30, 40]
        );
    }

    #[test]
    fn test_final_color_blends_styles() {
        // two style layers: style 0 scaled by 255, style 1 scaled by 128
        let shader = vertex_lit_shader([0, 1, LS_UNUSED, LS_NONE]);
        let mut style_colors = [[255u8; 3]; MAX_LIGHT_STYLES];
        style_colors[1] = [128; 3];
        let mut colors = [[0u8; 4]; MAXLIGHTMAPS];
        colors[0] = [200, 200, 200, 77];
        colors[1] = [40, 40, 40, 0];
        let out = compute_final_vertex_color(&shader, &style_colors, false, &colors);
        // (200*255 + 40*128) >> 8 = 219
        assert_eq!(out, [219, 219, 219, 77]);
    }

    #[test]
    fn test_final_color_clamps() {
        let shader = vertex_lit_shader([0, 0, LS_UNUSED, LS_NONE]);
        let style_colors = [[255u8; 3]; MAX_LIGHT_STYLES];
        let colors = [[255, 255, 255, 255]; MAXLIGHTMAPS];
        let out = compute_final_vertex_color(&shader, &style_colors, false, &colors);
        assert_eq!(out, [255, 255, 255, 255]);
    }

    #[test]
    fn test_final_color_fullbright() {
        let shader = vertex_lit_shader(STYLES_DEFAULT);
        let style_colors = [[255u8; 3]; MAX_LIGHT_STYLES];
        let colors = [[10, 20, 30, 99]; MAXLIGHTMAPS];
        assert_eq!(
            compute_final_vertex_color(&shader, &style_colors, true, &colors),
            [255, 255, 255, 99]
        );
    }

    #[test]
    fn test_final_color_stops_at_unused_style() {
        // layer 1 is marked unused, so only layer 0 contributes
        let shader = vertex_lit_shader([0, LS_UNUSED, 0, 0]);
        let style_colors = [[255u8; 3]; MAX_LIGHT_STYLES];
        let mut colors = [[255u8; 4]; MAXLIGHTMAPS];
        colors[0] = [100, 100, 100, 255];
        let out = compute_final_vertex_color(&shader, &style_colors, false, &colors);
        // 100 * 255 >> 8 = 99
        assert_eq!(out[0], 99);
    }

    // ---------------------------------------------------------
    //  lod selection
    // ---------------------------------------------------------

    #[test]
    fn test_lod_error_zero_tolerance_when_disabled() {
        let view = ViewParms::default();
        let ori = Orientation::default();
        assert_eq!(
            lod_error_for_volume(&[500.0, 0.0, 0.0], 10.0, &view, &ori, 0.0),
            0.0
        );
        assert_eq!(
            lod_error_for_volume(&[500.0, 0.0, 0.0], 10.0, &view, &ori, -1.0),
            0.0
        );
    }

    #[test]
    fn test_lod_error_scales_with_distance() {
        let view = ViewParms::default(); // at origin looking down +x
        let ori = Orientation::default();
        let t = lod_error_for_volume(&[500.0, 0.0, 0.0], 100.0, &view, &ori, 100.0);
        assert_eq!(t, 4.0); // (500 - 100) / 100
        // inside the volume the distance floors at 1
        let near = lod_error_for_volume(&[50.0, 0.0, 0.0], 100.0, &view, &ori, 100.0);
        assert_eq!(near, 1.0 / 100.0);
    }

    #[test]
    fn test_select_lod_rows_keeps_edges() {
        let errors = [0.0, 5.0, 2.0, 8.0, 0.0];
        assert_eq!(select_lod_rows(&errors, 5, 3.0), vec![0, 1, 3, 4]);
        assert_eq!(select_lod_rows(&errors, 5, 100.0), vec![0, 4]);
    }

    #[test]
    fn test_select_lod_rows_monotonic() {
        // lowering the tolerance never drops a row that was kept
        let errors = [0.0, 5.0, 2.0, 8.0, 1.0, 0.0];
        let coarse = select_lod_rows(&errors, 6, 6.0);
        let fine = select_lod_rows(&errors, 6, 1.5);
        for row in &coarse {
            assert!(fine.contains(row), "row {} lost at finer tolerance", row);
        }
        // tolerance zero keeps the full grid
        assert_eq!(select_lod_rows(&errors, 6, 0.0).len(), 6);
    }

    // ---------------------------------------------------------
    //  batching
    // ---------------------------------------------------------

    #[test]
    fn test_check_overflow_flushes_and_restarts() {
        let mut tess = TessBuffer::new();
        let mut backend = MockBackend::default();
        tess.begin_surface(Arc::new(Shader::default()), 0);

        // nearly fill the buffer
        for i in 0..SHADER_MAX_VERTEXES - 2 {
            tess.xyz.push([i as f32, 0.0, 0.0]);
        }
        tess.indexes.push(0);

        tess.check_overflow(4, 6, &mut backend).unwrap();
        assert_eq!(backend.batches.len(), 1);
        assert_eq!(tess.num_vertexes(), 0);
        // the material binding survives the flush
        assert!(tess.shader.is_some());
    }

    #[test]
    fn test_check_overflow_single_surface_too_big() {
        let mut tess = TessBuffer::new();
        let mut backend = MockBackend::default();
        tess.begin_surface(Arc::new(Shader::default()), 0);
        assert!(matches!(
            tess.check_overflow(SHADER_MAX_VERTEXES, 6, &mut backend),
            Err(TessError::VertexOverflow(..))
        ));
        assert!(matches!(
            tess.check_overflow(4, SHADER_MAX_INDEXES, &mut backend),
            Err(TessError::IndexOverflow(..))
        ));
    }

    #[test]
    fn test_end_surface_skips_empty_batch() {
        let mut tess = TessBuffer::new();
        let mut backend = MockBackend::default();
        tess.begin_surface(Arc::new(Shader::default()), 0);
        tess.end_surface(&mut backend);
        assert!(backend.batches.is_empty());
    }

    #[test]
    fn test_faces_batch_with_index_rebasing() {
        let mut tess = TessBuffer::new();
        let mut backend = MockBackend::default();
        tess.begin_surface(Arc::new(Shader::default()), 0);

        let face = quad_face();
        surface_face(&mut tess, &face, &mut backend).unwrap();
        surface_face(&mut tess, &face, &mut backend).unwrap();

        assert_eq!(tess.num_vertexes(), 8);
        assert_eq!(tess.num_indexes(), 12);
        // second face's indexes shifted past the first one's verts
        assert_eq!(&tess.indexes[6..9], &[4, 5, 6]);
        // face colors come through pre-blended
        assert_eq!(tess.vertex_colors[0], [200, 150, 100, 255]);
        assert_eq!(tess.normal[0], [0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_draw_surface_flushes_on_material_change() {
        let mut tess = TessBuffer::new();
        let mut backend = MockBackend::default();
        let view = ViewParms::default();
        let ori = Orientation::default();
        let config = RenderConfig::default();
        let style_colors = [[255u8; 3]; MAX_LIGHT_STYLES];
        let ctx = default_ctx(&view, &ori, &config, &style_colors);

        let a = MSurface {
            shader: Arc::new(Shader::default()),
            fog_index: 0,
            data: SurfaceData::Face(quad_face()),
        };
        let b = MSurface {
            shader: Arc::new(Shader::default()),
            fog_index: 0,
            data: SurfaceData::Face(quad_face()),
        };

        draw_surface(&mut tess, &a, &mut backend, &ctx).unwrap();
        draw_surface(&mut tess, &a, &mut backend, &ctx).unwrap();
        assert!(backend.batches.is_empty()); // same material accumulates

        draw_surface(&mut tess, &b, &mut backend, &ctx).unwrap();
        assert_eq!(backend.batches, vec![(8, 12)]);
        assert_eq!(tess.num_vertexes(), 4);
    }

    #[test]
    fn test_draw_surface_flushes_on_fog_change() {
        let mut tess = TessBuffer::new();
        let mut backend = MockBackend::default();
        let view = ViewParms::default();
        let ori = Orientation::default();
        let config = RenderConfig::default();
        let style_colors = [[255u8; 3]; MAX_LIGHT_STYLES];
        let ctx = default_ctx(&view, &ori, &config, &style_colors);

        let shader = Arc::new(Shader::default());
        let a = MSurface {
            shader: shader.clone(),
            fog_index: 0,
            data: SurfaceData::Face(quad_face()),
        };
        let b = MSurface {
            shader,
            fog_index: 2,
            data: SurfaceData::Face(quad_face()),
        };

        draw_surface(&mut tess, &a, &mut backend, &ctx).unwrap();
        draw_surface(&mut tess, &b, &mut backend, &ctx).unwrap();
        assert_eq!(backend.batches.len(), 1);
        assert_eq!(tess.fog_num, 2);
    }

    // ---------------------------------------------------------
    //  grids
    // ---------------------------------------------------------

    #[test]
    fn test_grid_full_detail_tessellation() {
        let mut tess = TessBuffer::new();
        let mut backend = MockBackend::default();
        let view = ViewParms::default();
        let ori = Orientation::default();
        let mut config = RenderConfig::default();
        config.lod_curve_error = 0.0; // keep every row
        let style_colors = [[255u8; 3]; MAX_LIGHT_STYLES];
        let ctx = default_ctx(&view, &ori, &config, &style_colors);

        tess.begin_surface(Arc::new(Shader::default()), 0);
        let grid = flat_grid(3, 3, 10.0);
        surface_grid(&mut tess, &grid, &mut backend, &ctx).unwrap();

        assert_eq!(tess.num_vertexes(), 9);
        // 2x2 cells, two triangles each
        assert_eq!(tess.num_indexes(), 24);
        assert!(backend.batches.is_empty());
    }

    #[test]
    fn test_grid_lod_drops_interior_rows() {
        let mut tess = TessBuffer::new();
        let mut backend = MockBackend::default();
        let view = ViewParms::default();
        let ori = Orientation::default();
        let config = RenderConfig::default(); // lod_curve_error 250
        let style_colors = [[255u8; 3]; MAX_LIGHT_STYLES];
        let ctx = default_ctx(&view, &ori, &config, &style_colors);

        tess.begin_surface(Arc::new(Shader::default()), 0);
        // grid sits 10000 units out: tolerance ~40, deviations of 10 vanish
        let mut grid = flat_grid(3, 3, 10.0);
        grid.lod_origin = [10000.0, 0.0, 0.0];
        grid.lod_radius = 1.0;
        surface_grid(&mut tess, &grid, &mut backend, &ctx).unwrap();

        // collapsed to the 2x2 corner grid
        assert_eq!(tess.num_vertexes(), 4);
        assert_eq!(tess.num_indexes(), 6);
    }

    #[test]
    fn test_grid_streams_through_multiple_batches() {
        let mut tess = TessBuffer::new();
        let mut backend = MockBackend::default();
        let view = ViewParms::default();
        let ori = Orientation::default();
        let mut config = RenderConfig::default();
        config.lod_curve_error = 0.0;
        let style_colors = [[255u8; 3]; MAX_LIGHT_STYLES];
        let ctx = default_ctx(&view, &ori, &config, &style_colors);

        tess.begin_surface(Arc::new(Shader::default()), 0);
        // 65x65 verts cannot fit one batch
        let grid = flat_grid(65, 65, 10.0);
        surface_grid(&mut tess, &grid, &mut backend, &ctx).unwrap();
        tess.end_surface(&mut backend);

        assert!(backend.batches.len() > 1);
        let mut total_indexes = 0;
        for &(verts, indexes) in &backend.batches {
            assert!(verts <= SHADER_MAX_VERTEXES);
            assert!(indexes <= SHADER_MAX_INDEXES);
            total_indexes += indexes;
        }
        // every cell of the full grid got its two triangles exactly once
        assert_eq!(total_indexes, 64 * 64 * 6);
    }

    #[test]
    fn test_grid_blends_vertex_styles() {
        let mut tess = TessBuffer::new();
        let mut backend = MockBackend::default();
        let view = ViewParms::default();
        let ori = Orientation::default();
        let mut config = RenderConfig::default();
        config.lod_curve_error = 0.0;
        let mut style_colors = [[255u8; 3]; MAX_LIGHT_STYLES];
        style_colors[1] = [128; 3];
        let ctx = default_ctx(&view, &ori, &config, &style_colors);

        tess.begin_surface(vertex_lit_shader([0, 1, LS_UNUSED, LS_NONE]), 0);
        let mut grid = flat_grid(2, 2, 10.0);
        for v in grid.verts.iter_mut() {
            v.color[0] = [200, 200, 200, 255];
            v.color[1] = [40, 40, 40, 0];
        }
        surface_grid(&mut tess, &grid, &mut backend, &ctx).unwrap();

        assert_eq!(tess.vertex_colors[0], [219, 219, 219, 255]);
    }

    // ---------------------------------------------------------
    //  triangle soups
    // ---------------------------------------------------------

    #[test]
    fn test_triangles_tessellate() {
        let mut tess = TessBuffer::new();
        let mut backend = MockBackend::default();
        let view = ViewParms::default();
        let ori = Orientation::default();
        let config = RenderConfig::default();
        let style_colors = [[255u8; 3]; MAX_LIGHT_STYLES];
        let ctx = default_ctx(&view, &ori, &config, &style_colors);

        tess.begin_surface(Arc::new(Shader::default()), 0);
        let tri = SrfTriangles {
            verts: vec![
                DrawVert {
                    xyz: [0.0, 0.0, 0.0],
                    color: [[50, 60, 70, 255]; MAXLIGHTMAPS],
                    ..Default::default()
                },
                DrawVert {
                    xyz: [1.0, 0.0, 0.0],
                    ..Default::default()
                },
                DrawVert {
                    xyz: [0.0, 1.0, 0.0],
                    ..Default::default()
                },
            ],
            indexes: vec![0, 1, 2],
            ..Default::default()
        };
        surface_triangles(&mut tess, &tri, &mut backend, &ctx).unwrap();

        assert_eq!(tess.num_vertexes(), 3);
        assert_eq!(tess.indexes, vec![0, 1, 2]);
        // default material is not vertex lit, layer 0 passes through
        assert_eq!(tess.vertex_colors[0], [50, 60, 70, 255]);
    }

    // ---------------------------------------------------------
    //  flares
    // ---------------------------------------------------------

    fn flare_fixture() -> (SrfFlare, ViewParms) {
        let flare = SrfFlare {
            origin: [100.0, 0.0, 0.0],
            normal: [-1.0, 0.0, 0.0],
            color: [1.0, 1.0, 1.0],
        };
        (flare, ViewParms::default())
    }

    #[test]
    fn test_flare_disabled_by_config() {
        let (flare, view) = flare_fixture();
        let mut tess = TessBuffer::new();
        let mut backend = MockBackend {
            flare_visible: true,
            ..Default::default()
        };
        let ori = Orientation::default();
        let mut config = RenderConfig::default();
        config.flares = false;
        let style_colors = [[255u8; 3]; MAX_LIGHT_STYLES];
        let ctx = default_ctx(&view, &ori, &config, &style_colors);

        tess.begin_surface(Arc::new(Shader::default()), 0);
        surface_flare(&mut tess, &flare, &mut backend, &ctx).unwrap();
        assert_eq!(tess.num_vertexes(), 0);
    }

    #[test]
    fn test_flare_hidden_by_depth_test() {
        let (flare, view) = flare_fixture();
        let mut tess = TessBuffer::new();
        let mut backend = MockBackend::default(); // flare_visible = false
        let ori = Orientation::default();
        let config = RenderConfig::default();
        let style_colors = [[255u8; 3]; MAX_LIGHT_STYLES];
        let ctx = default_ctx(&view, &ori, &config, &style_colors);

        tess.begin_surface(Arc::new(Shader::default()), 0);
        surface_flare(&mut tess, &flare, &mut backend, &ctx).unwrap();
        assert_eq!(tess.num_vertexes(), 0);
    }

    #[test]
    fn test_flare_emits_camera_facing_quad() {
        let (flare, view) = flare_fixture();
        let mut tess = TessBuffer::new();
        let mut backend = MockBackend {
            flare_visible: true,
            ..Default::default()
        };
        let ori = Orientation::default();
        let config = RenderConfig::default();
        let style_colors = [[255u8; 3]; MAX_LIGHT_STYLES];
        let ctx = default_ctx(&view, &ori, &config, &style_colors);

        tess.begin_surface(Arc::new(Shader::default()), 0);
        surface_flare(&mut tess, &flare, &mut backend, &ctx).unwrap();

        assert_eq!(tess.num_vertexes(), 4);
        assert_eq!(tess.num_indexes(), 6);
        // dead-on flare is full intensity
        assert_eq!(tess.vertex_colors[0], [255, 255, 255, 255]);
        // pushed 3 units off the surface along its normal
        assert_eq!(tess.xyz[0][0], 97.0);
        // 97 units away scales the base radius down: 30 * 97 / 512
        let radius = 30.0 * 97.0 / 512.0;
        assert!((tess.xyz[0][1] - radius).abs() < 1e-4);
        assert!((tess.xyz[0][2] - radius).abs() < 1e-4);
    }

    #[test]
    fn test_flare_mirror_flips_winding() {
        let (flare, mut view) = flare_fixture();
        view.is_mirror = true;
        let mut tess = TessBuffer::new();
        let mut backend = MockBackend {
            flare_visible: true,
            ..Default::default()
        };
        let ori = Orientation::default();
        let config = RenderConfig::default();
        let style_colors = [[255u8; 3]; MAX_LIGHT_STYLES];
        let ctx = default_ctx(&view, &ori, &config, &style_colors);

        tess.begin_surface(Arc::new(Shader::default()), 0);
        surface_flare(&mut tess, &flare, &mut backend, &ctx).unwrap();

        // first corner is origin + left + up; mirrored left points at -y
        assert!(tess.xyz[0][1] < 0.0);
    }

    #[test]
    fn test_flare_uses_portal_range_radius() {
        let (mut flare, view) = flare_fixture();
        flare.origin = [1000.0, 0.0, 0.0]; // beyond the falloff distance
        let mut tess = TessBuffer::new();
        let mut backend = MockBackend {
            flare_visible: true,
            ..Default::default()
        };
        let ori = Orientation::default();
        let config = RenderConfig::default();
        let style_colors = [[255u8; 3]; MAX_LIGHT_STYLES];
        let ctx = default_ctx(&view, &ori, &config, &style_colors);

        let shader = Arc::new(Shader {
            portal_range: 120.0,
            ..Default::default()
        });
        tess.begin_surface(shader, 0);
        surface_flare(&mut tess, &flare, &mut backend, &ctx).unwrap();
        assert_eq!(tess.xyz[0][1], 120.0);
    }

    // ---------------------------------------------------------
    //  dispatch
    // ---------------------------------------------------------

    #[test]
    fn test_skip_surface_is_noop() {
        let mut tess = TessBuffer::new();
        let mut backend = MockBackend::default();
        let view = ViewParms::default();
        let ori = Orientation::default();
        let config = RenderConfig::default();
        let style_colors = [[255u8; 3]; MAX_LIGHT_STYLES];
        let ctx = default_ctx(&view, &ori, &config, &style_colors);

        tess.begin_surface(Arc::new(Shader::default()), 0);
        tessellate_surface(&mut tess, &SurfaceData::Skip, &mut backend, &ctx).unwrap();
        assert_eq!(tess.num_vertexes(), 0);
        assert_eq!(tess.num_indexes(), 0);
    }
}
