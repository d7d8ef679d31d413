// tr_bsp.rs — loads and prepares a level (.bsp file) for rendering
// Converted from: code/rd-vanilla/tr_bsp.cpp

use std::mem::size_of;
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use rayon::prelude::*;

use myq3_common::q_shared::{
    color_bytes4, dot_product, plane_type_for_normal, set_plane_signbits, vector_length,
    vector_scale, vector_subtract, CPlane, Vec3, CONTENTS_NODE, MAX_WORLD_COORD, MIN_WORLD_COORD,
    SURF_NODRAW,
};
use myq3_common::qfiles::{
    fixed_str, DBrush, DBrushSide, DFog, DGrid, DHeader, DLeaf, DModel, DNode, DPlane, DShader,
    DSurface, DiskRecord, Lump, MapVert, BSP_IDENT, BSP_VERSION, HEADER_LUMPS, LUMP_BRUSHES,
    LUMP_BRUSHSIDES, LUMP_DRAWINDEXES, LUMP_DRAWVERTS, LUMP_ENTITIES, LUMP_FOGS, LUMP_LEAFS,
    LUMP_LEAFSURFACES, LUMP_LIGHTARRAY, LUMP_LIGHTGRID, LUMP_LIGHTMAPS, LUMP_MODELS, LUMP_NODES,
    LUMP_PLANES, LUMP_SHADERS, LUMP_SURFACES, LUMP_VISIBILITY, MAXLIGHTMAPS, MAX_LIGHT_STYLES,
    MST_FLARE, MST_PATCH, MST_PLANAR, MST_TRIANGLE_SOUP,
};

use crate::tr_curve::subdivide_patch_to_grid;
use crate::tr_local::{
    BModel, DrawVert, FaceVert, FileSystem, Fog, FogParms, LightmapPage, LoadError, MNode,
    MSurface, NodeRef, RegisteredModel, RenderConfig, Shader, ShaderSystem, SrfFace, SrfFlare,
    SrfTriangles, SurfaceData, TrGlobals, World, LIGHTMAPS_FULLBRIGHT,
    LIGHTMAPS_NONE, LIGHTMAPS_VERTEX, LIGHTMAP_BY_VERTEX, LIGHTMAP_SIZE, MAX_PATCH_SIZE,
    STYLES_DEFAULT,
};
use crate::tr_surface::compute_final_vertex_color;

// ============================================================
// Cached map image
// ============================================================

struct CachedMap {
    name: String,
    data: Arc<Vec<u8>>,
}

// The main world's raw file image sticks around so bsp instances of the
// same level skip the disk. Purely advisory.
static CACHED_MAP: Mutex<Option<CachedMap>> = Mutex::new(None);

pub fn clear_cached_map() {
    *CACHED_MAP.lock() = None;
}

// ============================================================
// Lump access
// ============================================================

/// Bounds-checked access to the lumps of one level file. Records come back
/// already converted to host byte order, so this is the only place that
/// ever sees raw file bytes.
pub struct LumpReader<'a> {
    name: &'a str,
    base: &'a [u8],
    lumps: [Lump; HEADER_LUMPS],
}

impl<'a> LumpReader<'a> {
    pub fn new(name: &'a str, base: &'a [u8], lumps: [Lump; HEADER_LUMPS]) -> Self {
        Self { name, base, lumps }
    }

    pub fn raw(&self, lump: usize) -> Result<&'a [u8], LoadError> {
        let l = &self.lumps[lump];
        if l.fileofs < 0 || l.filelen < 0 {
            return Err(LoadError::LumpOutOfBounds(self.name.to_string()));
        }
        let ofs = l.fileofs as usize;
        let len = l.filelen as usize;
        if ofs + len > self.base.len() {
            return Err(LoadError::LumpOutOfBounds(self.name.to_string()));
        }
        Ok(&self.base[ofs..ofs + len])
    }

    pub fn records<T: DiskRecord>(&self, lump: usize) -> Result<Vec<T>, LoadError> {
        let raw = self.raw(lump)?;
        let size = size_of::<T>();
        if raw.len() % size != 0 {
            return Err(LoadError::FunnyLumpSize(self.name.to_string()));
        }
        Ok(raw
            .chunks_exact(size)
            .map(|chunk| bytemuck::pod_read_unaligned::<T>(chunk).swapped())
            .collect())
    }
}

// ============================================================
// Lighting helpers
// ============================================================

/// How far the stored light values get shifted up to undo the overbright
/// factor baked in by the level compiler.
pub fn color_shift_for(config: &RenderConfig) -> i32 {
    (config.map_overbright_bits - config.overbright_bits).max(0)
}

/// Scale an RGB triple up by `shift` bits, renormalizing instead of
/// clamping if any channel overflows so hues survive.
pub fn color_shift_lighting_bytes3(shift: i32, bytes: [u8; 3]) -> [u8; 3] {
    let mut r = (bytes[0] as u32) << shift;
    let mut g = (bytes[1] as u32) << shift;
    let mut b = (bytes[2] as u32) << shift;

    if (r | g | b) > 255 {
        let max = r.max(g).max(b);
        r = r * 255 / max;
        g = g * 255 / max;
        b = b * 255 / max;
    }
    [r as u8, g as u8, b as u8]
}

/// Same, with the alpha byte passed through untouched.
pub fn color_shift_lighting_bytes(shift: i32, bytes: [u8; 4]) -> [u8; 4] {
    let rgb = color_shift_lighting_bytes3(shift, [bytes[0], bytes[1], bytes[2]]);
    [rgb[0], rgb[1], rgb[2], bytes[3]]
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Vec3 {
    let h = h * 5.0;
    let i = h.floor();
    let f = h - i;
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));

    match i as i32 {
        0 => [v, t, p],
        1 => [q, v, p],
        2 => [p, v, t],
        3 => [p, q, v],
        _ => [v, p, q],
    }
}

// ============================================================
// Lump loaders
// ============================================================

fn load_shaders(lr: &LumpReader, world: &mut World) -> Result<(), LoadError> {
    world.shaders = lr.records::<DShader>(LUMP_SHADERS)?;
    debug!("{}: {} shaders", world.name, world.shaders.len());
    Ok(())
}

fn load_lightmaps(
    lr: &LumpReader,
    world: &mut World,
    tr: &mut TrGlobals,
    config: &RenderConfig,
) -> Result<(), LoadError> {
    const PAGE_BYTES: usize = LIGHTMAP_SIZE * LIGHTMAP_SIZE * 3;

    let raw = lr.raw(LUMP_LIGHTMAPS)?;
    if raw.is_empty() {
        return Ok(());
    }
    let count = raw.len() / PAGE_BYTES;
    if raw.len() % PAGE_BYTES != 0 {
        debug!("{}: lightmap lump has {} trailing bytes", world.name, raw.len() % PAGE_BYTES);
    }

    world.start_lightmap_index = tr.num_lightmaps;
    tr.num_lightmaps += count;

    // if we are in vertex lighting mode, we don't need the lightmaps at all
    if config.vertex_light {
        return Ok(());
    }

    let shift = color_shift_for(config);
    let base_name = world.base_name.clone();
    let start = world.start_lightmap_index;
    let lightmap_mode = config.lightmap_mode;

    let pages: Vec<(LightmapPage, f32)> = (0..count)
        .into_par_iter()
        .map(|page| {
            let src = &raw[page * PAGE_BYTES..(page + 1) * PAGE_BYTES];
            let mut pixels = vec![0u8; LIGHTMAP_SIZE * LIGHTMAP_SIZE * 4];
            let mut max_intensity = 0.0f32;

            for j in 0..LIGHTMAP_SIZE * LIGHTMAP_SIZE {
                if lightmap_mode == 2 {
                    // color code by intensity as a development tool
                    let r = src[j * 3] as f32;
                    let g = src[j * 3 + 1] as f32;
                    let b = src[j * 3 + 2] as f32;

                    let mut intensity = 0.33 * r + 0.685 * g + 0.063 * b;
                    if intensity > 255.0 {
                        intensity = 1.0;
                    } else {
                        intensity /= 255.0;
                    }
                    if intensity > max_intensity {
                        max_intensity = intensity;
                    }

                    let out = hsv_to_rgb(intensity, 1.0, 0.5);
                    pixels[j * 4] = (out[0] * 255.0) as u8;
                    pixels[j * 4 + 1] = (out[1] * 255.0) as u8;
                    pixels[j * 4 + 2] = (out[2] * 255.0) as u8;
                } else {
                    let rgb = color_shift_lighting_bytes3(
                        shift,
                        [src[j * 3], src[j * 3 + 1], src[j * 3 + 2]],
                    );
                    pixels[j * 4] = rgb[0];
                    pixels[j * 4 + 1] = rgb[1];
                    pixels[j * 4 + 2] = rgb[2];
                }
                pixels[j * 4 + 3] = 255;
            }

            (
                LightmapPage {
                    name: format!("${}/lightmap{}", base_name, start + page),
                    pixels,
                },
                max_intensity,
            )
        })
        .collect();

    let mut max_intensity = 0.0f32;
    for (page, intensity) in pages {
        if intensity > max_intensity {
            max_intensity = intensity;
        }
        tr.lightmaps.push(page);
    }

    if lightmap_mode == 2 {
        info!("Brightest lightmap value: {}", (max_intensity * 255.0) as i32);
    }
    Ok(())
}

fn load_planes(lr: &LumpReader, world: &mut World) -> Result<(), LoadError> {
    let planes_in = lr.records::<DPlane>(LUMP_PLANES)?;

    world.planes = planes_in
        .iter()
        .map(|p| {
            let mut out = CPlane {
                normal: p.normal,
                dist: p.dist,
                ..Default::default()
            };
            out.plane_type = plane_type_for_normal(&out.normal);
            set_plane_signbits(&mut out);
            out
        })
        .collect();
    debug!("{}: {} planes", world.name, world.planes.len());
    Ok(())
}

fn load_fogs(
    lr: &LumpReader,
    world: &mut World,
    shader_sys: &mut dyn ShaderSystem,
    global_fog_template: Option<Fog>,
) -> Result<(), LoadError> {
    let fogs_in = lr.records::<DFog>(LUMP_FOGS)?;
    let brushes = lr.records::<DBrush>(LUMP_BRUSHES)?;
    let sides = lr.records::<DBrushSide>(LUMP_BRUSHSIDES)?;

    let count = fogs_in.len();

    // create fog structures for them, with slot 0 reserved for "no fog"
    // and one extra zeroed slot past the end
    world.num_fogs = count + 1;
    world.fogs = vec![Fog::default(); count + 2];
    world.global_fog = None;

    for (i, fog_in) in fogs_in.iter().enumerate() {
        let out_idx = i + 1;
        let brush_num = fog_in.brush_num;
        let mut first_side = 0usize;
        let mut bounds = [[0.0f32; 3]; 2];

        if brush_num == -1 {
            // this is the global fog volume, stretched over the whole world
            if world.index != 0 {
                return Err(LoadError::GlobalFogInInstance(world.name.clone()));
            }
            bounds[0] = [MIN_WORLD_COORD; 3];
            bounds[1] = [MAX_WORLD_COORD; 3];
            world.global_fog = Some(out_idx);
        } else {
            if brush_num < 0 || brush_num as usize >= brushes.len() {
                return Err(LoadError::FogBrushOutOfRange);
            }
            let brush = &brushes[brush_num as usize];

            if brush.first_side < 0 || brush.first_side as usize + 6 > sides.len() {
                return Err(LoadError::FogSideOutOfRange);
            }
            first_side = brush.first_side as usize;

            // brushes are always sorted with the axial sides first
            for axis in 0..3 {
                for side in 0..2 {
                    let side_num = first_side + axis * 2 + side;
                    let plane_num = sides[side_num].plane_num;
                    if plane_num < 0 || plane_num as usize >= world.planes.len() {
                        return Err(LoadError::BadPlaneNum(plane_num));
                    }
                    let dist = world.planes[plane_num as usize].dist;
                    bounds[side][axis] = if side == 0 { -dist } else { dist };
                }
            }
        }

        // get information from the shader for fog parameters
        let shader = shader_sys.find_shader(
            &fixed_str(&fog_in.shader),
            &LIGHTMAPS_NONE,
            &STYLES_DEFAULT,
        );
        let parms = match shader.fog_parms {
            Some(p) => p,
            None => {
                warn!(
                    "R_LoadFogs: shader {} has no fogParms, substituting",
                    shader.name
                );
                FogParms {
                    color: [1.0, 0.0, 0.0],
                    depth_for_opaque: 250.0,
                }
            }
        };

        let out = &mut world.fogs[out_idx];
        out.original_brush_number = brush_num;
        out.bounds = bounds;
        out.parms = parms;
        out.color_int = color_bytes4(
            parms.color[0] * 255.0,
            parms.color[1] * 255.0,
            parms.color[2] * 255.0,
            255.0,
        );
        let d = if parms.depth_for_opaque < 1.0 {
            1.0
        } else {
            parms.depth_for_opaque
        };
        out.tc_scale = 1.0 / (d * 8.0);

        // set the gradient vector
        let side_num = fog_in.visible_side;
        if brush_num == -1 || side_num == -1 {
            out.has_surface = false;
        } else {
            if side_num < 0 || first_side + side_num as usize >= sides.len() {
                return Err(LoadError::FogSideOutOfRange);
            }
            let plane_num = sides[first_side + side_num as usize].plane_num;
            if plane_num < 0 || plane_num as usize >= world.planes.len() {
                return Err(LoadError::BadPlaneNum(plane_num));
            }
            let plane = &world.planes[plane_num as usize];
            out.has_surface = true;
            out.surface = [
                -plane.normal[0],
                -plane.normal[1],
                -plane.normal[2],
                -plane.dist,
            ];
        }
    }

    // a bsp instance inside a world with a global fog picks up a copy of it
    if world.index != 0 {
        if let Some(template) = global_fog_template {
            let slot = world.num_fogs;
            world.fogs[slot] = template;
            world.global_fog = Some(slot);
            world.num_fogs += 1;
        }
    }

    debug!("{}: {} fogs", world.name, count);
    Ok(())
}

/// Remap on-disk lightmap page numbers into the global page list.
fn world_lightmap_nums(world: &World, ds: &DSurface) -> [i32; MAXLIGHTMAPS] {
    let mut out = ds.lightmap_num;
    for num in out.iter_mut() {
        if *num >= 0 {
            *num += world.start_lightmap_index as i32;
        }
    }
    out
}

fn shader_for_shader_num(
    shaders: &[DShader],
    shader_sys: &mut dyn ShaderSystem,
    config: &RenderConfig,
    shader_num: i32,
    lightmap_nums: &[i32; MAXLIGHTMAPS],
    lightmap_styles: &[u8; MAXLIGHTMAPS],
    vertex_styles: &[u8; MAXLIGHTMAPS],
) -> Result<Arc<Shader>, LoadError> {
    if shader_num < 0 || shader_num as usize >= shaders.len() {
        return Err(LoadError::BadShaderNum(shader_num));
    }
    let dsh = &shaders[shader_num as usize];

    let mut lightmap_nums = *lightmap_nums;
    let mut styles = *lightmap_styles;

    if lightmap_nums[0] == LIGHTMAP_BY_VERTEX {
        styles = *vertex_styles;
    }
    if config.vertex_light {
        lightmap_nums = LIGHTMAPS_VERTEX;
        styles = *vertex_styles;
    }
    if config.fullbright {
        lightmap_nums = LIGHTMAPS_FULLBRIGHT;
        styles = *vertex_styles;
    }

    let shader = shader_sys.find_shader(&fixed_str(&dsh.shader), &lightmap_nums, &styles);

    // if the shader had errors, just use default shader
    if shader.default_shader {
        return Ok(shader_sys.default_shader());
    }
    if config.single_shader && !shader.is_sky {
        return Ok(shader_sys.default_shader());
    }
    Ok(shader)
}

fn surface_fog_index(world: &World, ds: &DSurface) -> usize {
    let fog_index = (ds.fog_num + 1) as usize;
    // instance surfaces outside any local fog sit in the world's global fog
    if fog_index == 0 || ds.fog_num == -1 {
        if world.index != 0 {
            if let Some(global) = world.global_fog {
                return global;
            }
        }
        return 0;
    }
    if fog_index >= world.num_fogs {
        return 0;
    }
    fog_index
}

fn parse_face(
    world: &World,
    shader_sys: &mut dyn ShaderSystem,
    config: &RenderConfig,
    style_colors: &[[u8; 3]; MAX_LIGHT_STYLES],
    shift: i32,
    ds: &DSurface,
    verts: &[MapVert],
    indexes: &[i32],
) -> Result<MSurface, LoadError> {
    let num_verts = ds.num_verts as usize;
    let num_indexes = ds.num_indexes as usize;

    let lightmap_nums = world_lightmap_nums(world, ds);
    let shader = shader_for_shader_num(
        &world.shaders,
        shader_sys,
        config,
        ds.shader_num,
        &lightmap_nums,
        &ds.lightmap_styles,
        &ds.vertex_styles,
    )?;

    // the plane derivation below needs at least one vertex
    if ds.first_vert < 0
        || ds.num_verts <= 0
        || ds.first_vert as usize + num_verts > verts.len()
        || ds.first_index < 0
        || ds.num_indexes < 0
        || ds.first_index as usize + num_indexes > indexes.len()
    {
        return Err(LoadError::BadSurfaceRange);
    }

    let mut face = SrfFace {
        verts: Vec::with_capacity(num_verts),
        indexes: Vec::with_capacity(num_indexes),
        ..Default::default()
    };

    for v in &verts[ds.first_vert as usize..ds.first_vert as usize + num_verts] {
        let mut colors = [[0u8; 4]; MAXLIGHTMAPS];
        for k in 0..MAXLIGHTMAPS {
            colors[k] = color_shift_lighting_bytes(shift, v.color[k]);
        }
        face.verts.push(FaceVert {
            xyz: v.xyz,
            st: v.st,
            lightmap: v.lightmap,
            // faces bake their style blend once, up front
            color: compute_final_vertex_color(&shader, style_colors, config.fullbright, &colors),
        });
    }

    for &idx in &indexes[ds.first_index as usize..ds.first_index as usize + num_indexes] {
        if idx < 0 || idx as usize >= num_verts {
            return Err(LoadError::BadSurfaceRange);
        }
        face.indexes.push(idx as u32);
    }

    // take the plane information from the lightmap vector
    face.plane.normal = ds.lightmap_vecs[2];
    face.plane.dist = dot_product(&face.verts[0].xyz, &face.plane.normal);
    face.plane.plane_type = plane_type_for_normal(&face.plane.normal);
    set_plane_signbits(&mut face.plane);

    Ok(MSurface {
        shader,
        fog_index: surface_fog_index(world, ds),
        data: SurfaceData::Face(face),
    })
}

fn parse_mesh(
    world: &World,
    shader_sys: &mut dyn ShaderSystem,
    config: &RenderConfig,
    shift: i32,
    ds: &DSurface,
    verts: &[MapVert],
) -> Result<MSurface, LoadError> {
    let lightmap_nums = world_lightmap_nums(world, ds);
    let shader = shader_for_shader_num(
        &world.shaders,
        shader_sys,
        config,
        ds.shader_num,
        &lightmap_nums,
        &ds.lightmap_styles,
        &ds.vertex_styles,
    )?;
    let fog_index = surface_fog_index(world, ds);

    // we may have a nodraw surface, because they might still need to
    // be around for movement clipping
    if world.shaders[ds.shader_num as usize].surface_flags & SURF_NODRAW != 0 {
        return Ok(MSurface {
            shader,
            fog_index,
            data: SurfaceData::Skip,
        });
    }

    let width = ds.patch_width;
    let height = ds.patch_height;
    if width <= 0
        || height <= 0
        || width as usize > MAX_PATCH_SIZE
        || height as usize > MAX_PATCH_SIZE
    {
        return Err(LoadError::BadPatchSize(width, height));
    }
    let num_points = width as usize * height as usize;
    if ds.first_vert < 0 || ds.first_vert as usize + num_points > verts.len() {
        return Err(LoadError::BadSurfaceRange);
    }

    let mut points = Vec::with_capacity(num_points);
    for v in &verts[ds.first_vert as usize..ds.first_vert as usize + num_points] {
        let mut point = DrawVert {
            xyz: v.xyz,
            st: v.st,
            lightmap: v.lightmap,
            normal: v.normal,
            color: v.color,
        };
        for k in 0..MAXLIGHTMAPS {
            point.color[k] = color_shift_lighting_bytes(shift, point.color[k]);
        }
        points.push(point);
    }

    // pre-tesseleate
    let mut grid = subdivide_patch_to_grid(width as usize, height as usize, &points);

    // copy the level of detail origin, which is the center of the group of
    // all curves that must subdivide the same to avoid cracking
    let bounds0 = ds.lightmap_vecs[0];
    let bounds1 = ds.lightmap_vecs[1];
    grid.lod_origin = vector_scale(
        &[
            bounds0[0] + bounds1[0],
            bounds0[1] + bounds1[1],
            bounds0[2] + bounds1[2],
        ],
        0.5,
    );
    grid.lod_radius = vector_length(&vector_subtract(&bounds0, &grid.lod_origin));

    Ok(MSurface {
        shader,
        fog_index,
        data: SurfaceData::Grid(grid),
    })
}

fn parse_tri_surf(
    world: &World,
    shader_sys: &mut dyn ShaderSystem,
    config: &RenderConfig,
    shift: i32,
    ds: &DSurface,
    verts: &[MapVert],
    indexes: &[i32],
) -> Result<MSurface, LoadError> {
    use crate::tr_surface::{SHADER_MAX_INDEXES, SHADER_MAX_VERTEXES};

    let num_verts = ds.num_verts as usize;
    let num_indexes = ds.num_indexes as usize;

    // trisoups can't be split like grids, so they must fit a single batch
    if ds.num_verts < 0 || num_verts >= SHADER_MAX_VERTEXES {
        return Err(LoadError::TooManyVerts(num_verts, SHADER_MAX_VERTEXES));
    }
    if ds.num_indexes < 0 || num_indexes >= SHADER_MAX_INDEXES {
        return Err(LoadError::TooManyIndexes(num_indexes, SHADER_MAX_INDEXES));
    }

    let lightmap_nums = world_lightmap_nums(world, ds);
    let shader = shader_for_shader_num(
        &world.shaders,
        shader_sys,
        config,
        ds.shader_num,
        &lightmap_nums,
        &ds.lightmap_styles,
        &ds.vertex_styles,
    )?;

    if ds.first_vert < 0
        || ds.first_vert as usize + num_verts > verts.len()
        || ds.first_index < 0
        || ds.first_index as usize + num_indexes > indexes.len()
    {
        return Err(LoadError::BadSurfaceRange);
    }

    let mut tri = SrfTriangles {
        verts: Vec::with_capacity(num_verts),
        indexes: Vec::with_capacity(num_indexes),
        ..Default::default()
    };

    myq3_common::q_shared::clear_bounds(&mut tri.bounds);
    for v in &verts[ds.first_vert as usize..ds.first_vert as usize + num_verts] {
        let mut out = DrawVert {
            xyz: v.xyz,
            st: v.st,
            lightmap: v.lightmap,
            normal: v.normal,
            color: v.color,
        };
        for k in 0..MAXLIGHTMAPS {
            out.color[k] = color_shift_lighting_bytes(shift, out.color[k]);
        }
        myq3_common::q_shared::add_point_to_bounds(&out.xyz, &mut tri.bounds);
        tri.verts.push(out);
    }

    // copy indexes
    for &idx in &indexes[ds.first_index as usize..ds.first_index as usize + num_indexes] {
        if idx < 0 || idx as usize >= num_verts {
            return Err(LoadError::BadTriIndex);
        }
        tri.indexes.push(idx as u32);
    }

    Ok(MSurface {
        shader,
        fog_index: surface_fog_index(world, ds),
        data: SurfaceData::Triangles(tri),
    })
}

fn parse_flare(
    world: &World,
    shader_sys: &mut dyn ShaderSystem,
    config: &RenderConfig,
    ds: &DSurface,
) -> Result<MSurface, LoadError> {
    let shader = shader_for_shader_num(
        &world.shaders,
        shader_sys,
        config,
        ds.shader_num,
        &LIGHTMAPS_VERTEX,
        &ds.lightmap_styles,
        &ds.vertex_styles,
    )?;

    let flare = SrfFlare {
        origin: ds.lightmap_origin,
        color: ds.lightmap_vecs[0],
        normal: ds.lightmap_vecs[2],
    };

    Ok(MSurface {
        shader,
        fog_index: surface_fog_index(world, ds),
        data: SurfaceData::Flare(flare),
    })
}

fn load_surfaces(
    lr: &LumpReader,
    world: &mut World,
    shader_sys: &mut dyn ShaderSystem,
    config: &RenderConfig,
    style_colors: &[[u8; 3]; MAX_LIGHT_STYLES],
) -> Result<(), LoadError> {
    let surfaces_in = lr.records::<DSurface>(LUMP_SURFACES)?;
    let verts = lr.records::<MapVert>(LUMP_DRAWVERTS)?;
    let indexes = lr.records::<i32>(LUMP_DRAWINDEXES)?;

    let shift = color_shift_for(config);
    let mut num_faces = 0;
    let mut num_meshes = 0;
    let mut num_tri_surfs = 0;
    let mut num_flares = 0;

    let mut out = Vec::with_capacity(surfaces_in.len());
    for ds in &surfaces_in {
        let surf = match ds.surface_type {
            MST_PLANAR => {
                num_faces += 1;
                parse_face(world, shader_sys, config, style_colors, shift, ds, &verts, &indexes)?
            }
            MST_PATCH => {
                num_meshes += 1;
                parse_mesh(world, shader_sys, config, shift, ds, &verts)?
            }
            MST_TRIANGLE_SOUP => {
                num_tri_surfs += 1;
                parse_tri_surf(world, shader_sys, config, shift, ds, &verts, &indexes)?
            }
            MST_FLARE => {
                num_flares += 1;
                parse_flare(world, shader_sys, config, ds)?
            }
            other => return Err(LoadError::BadSurfaceType(other)),
        };
        out.push(surf);
    }
    world.surfaces = out;

    info!(
        "...loaded {} faces, {} meshes, {} trisurfs, {} flares",
        num_faces, num_meshes, num_tri_surfs, num_flares
    );
    Ok(())
}

fn load_marksurfaces(lr: &LumpReader, world: &mut World) -> Result<(), LoadError> {
    let marks = lr.records::<i32>(LUMP_LEAFSURFACES)?;

    let mut out = Vec::with_capacity(marks.len());
    for &m in &marks {
        if m < 0 || m as usize >= world.surfaces.len() {
            return Err(LoadError::BadMarksurfaceNum(m));
        }
        out.push(m as u32);
    }
    world.marksurfaces = out;
    Ok(())
}

fn set_parent(world: &mut World, node_ref: NodeRef, parent: Option<u32>) {
    let flat = world.flat_index(node_ref);
    world.nodes[flat].parent = parent;
    if world.nodes[flat].contents != CONTENTS_NODE {
        return;
    }
    let children = world.nodes[flat].children;
    set_parent(world, children[0], Some(flat as u32));
    set_parent(world, children[1], Some(flat as u32));
}

fn load_nodes_and_leafs(lr: &LumpReader, world: &mut World) -> Result<(), LoadError> {
    let nodes_in = lr.records::<DNode>(LUMP_NODES)?;
    let leafs_in = lr.records::<DLeaf>(LUMP_LEAFS)?;

    let num_nodes = nodes_in.len();
    let num_leafs = leafs_in.len();

    let mut out: Vec<MNode> = Vec::with_capacity(num_nodes + num_leafs);

    // load nodes
    for n in &nodes_in {
        let mut node = MNode {
            contents: CONTENTS_NODE, // differentiate from leafs
            mins: n.mins,
            maxs: n.maxs,
            ..Default::default()
        };

        if n.plane_num < 0 || n.plane_num as usize >= world.planes.len() {
            return Err(LoadError::BadPlaneNum(n.plane_num));
        }
        node.plane = n.plane_num as u32;

        for (j, &p) in n.children.iter().enumerate() {
            let child = NodeRef::from_disk(p);
            match child {
                NodeRef::Node(i) if (i as usize) < num_nodes => {}
                NodeRef::Leaf(i) if (i as usize) < num_leafs => {}
                _ => return Err(LoadError::BadNodeChild(p)),
            }
            node.children[j] = child;
        }
        out.push(node);
    }

    // load leafs
    let mut num_clusters = 0i32;
    for l in &leafs_in {
        if l.first_leaf_surface < 0
            || l.num_leaf_surfaces < 0
            || l.first_leaf_surface as usize + l.num_leaf_surfaces as usize
                > world.marksurfaces.len()
        {
            return Err(LoadError::BadSurfaceRange);
        }
        if l.cluster >= num_clusters {
            num_clusters = l.cluster + 1;
        }
        out.push(MNode {
            contents: 0,
            mins: l.mins,
            maxs: l.maxs,
            cluster: l.cluster,
            area: l.area,
            first_mark_surface: l.first_leaf_surface as u32,
            num_mark_surfaces: l.num_leaf_surfaces as u32,
            ..Default::default()
        });
    }

    world.nodes = out;
    world.num_decision_nodes = num_nodes;
    world.num_clusters = num_clusters as usize;

    // chain descendants
    if num_nodes > 0 {
        set_parent(world, NodeRef::Node(0), None);
    }
    debug!("{}: {} nodes, {} leafs", world.name, num_nodes, num_leafs);
    Ok(())
}

fn load_submodels(lr: &LumpReader, world: &mut World, tr: &mut TrGlobals) -> Result<(), LoadError> {
    let models_in = lr.records::<DModel>(LUMP_MODELS)?;

    let mut out = Vec::with_capacity(models_in.len());
    for (i, m) in models_in.iter().enumerate() {
        if m.first_surface < 0
            || m.num_surfaces < 0
            || m.first_surface as usize + m.num_surfaces as usize > world.surfaces.len()
        {
            return Err(LoadError::BadSurfaceRange);
        }

        let bmodel = BModel {
            bounds: [m.mins, m.maxs],
            first_surface: m.first_surface as u32,
            num_surfaces: m.num_surfaces as u32,
        };
        out.push(bmodel);

        let name = if world.index == 0 {
            format!("*{}", i)
        } else {
            format!("*{}-{}", world.index, i)
        };
        tr.models.insert(
            name.clone(),
            RegisteredModel {
                name,
                world_index: world.index,
                bounds: bmodel.bounds,
                first_surface: bmodel.first_surface,
                num_surfaces: bmodel.num_surfaces,
            },
        );
    }
    world.bmodels = out;
    Ok(())
}

fn load_visibility(lr: &LumpReader, world: &mut World) -> Result<(), LoadError> {
    // allocate the fully visible row off the leaf-derived cluster count so
    // maps with no vis data still draw
    let len = (world.num_clusters + 63) & !63;
    world.novis = vec![0xff; len];

    let raw = lr.raw(LUMP_VISIBILITY)?;
    if raw.is_empty() {
        return Ok(());
    }
    if raw.len() < 8 {
        return Err(LoadError::LumpOutOfBounds(world.name.clone()));
    }

    let num_clusters = i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
    let cluster_bytes = i32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
    if num_clusters < 0 || cluster_bytes < 0 {
        return Err(LoadError::LumpOutOfBounds(world.name.clone()));
    }
    let data = &raw[8..];
    if data.len() < num_clusters as usize * cluster_bytes as usize {
        return Err(LoadError::LumpOutOfBounds(world.name.clone()));
    }

    world.num_clusters = num_clusters as usize;
    world.cluster_bytes = cluster_bytes as usize;
    world.vis = Some(data.to_vec());
    Ok(())
}

fn load_entities(raw: &[u8], world: &mut World, tr: &mut TrGlobals) {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let text = String::from_utf8_lossy(&raw[..end]).into_owned();

    world.light_grid_size = [64.0, 64.0, 128.0];
    tr.distance_cull = 12000.0;

    let mut color = [1.0f32, 1.0, 1.0];
    let mut ambient = 1.0f32;

    // only parse the world spawn, which is always the first block
    let mut rest: &str = &text;
    let (token, more) = myq3_common::q_shared::com_parse(rest);
    if token != "{" || more.is_none() {
        world.entity_string = text;
        return;
    }
    rest = more.unwrap_or("");

    loop {
        let (key, more) = myq3_common::q_shared::com_parse(rest);
        rest = match more {
            Some(r) => r,
            None => break,
        };
        if key.is_empty() || key == "}" {
            break;
        }

        let (value, more) = myq3_common::q_shared::com_parse(rest);
        rest = more.unwrap_or("");

        match key.as_str() {
            "gridsize" => {
                myq3_common::q_shared::parse_floats(&value, &mut world.light_grid_size);
            }
            "distanceCull" => {
                tr.distance_cull = value.parse::<f32>().unwrap_or(tr.distance_cull);
            }
            "linFogStart" => {
                // stored negated so a zero can mean "no ranged fog"
                tr.ranged_fog = -value.parse::<f32>().unwrap_or(0.0);
            }
            "_color" => {
                myq3_common::q_shared::parse_floats(&value, &mut color);
            }
            "ambient" => {
                ambient = value.parse::<f32>().unwrap_or(1.0);
            }
            _ => {}
        }
        if rest.is_empty() {
            break;
        }
    }

    tr.sun_ambient = [color[0] * ambient, color[1] * ambient, color[2] * ambient];
    world.entity_string = text;
}

fn load_light_grid(lr: &LumpReader, world: &mut World, shift: i32) -> Result<(), LoadError> {
    let w = &mut *world;

    for i in 0..3 {
        w.light_grid_inverse_size[i] = if w.light_grid_size[i] != 0.0 {
            1.0 / w.light_grid_size[i]
        } else {
            0.0
        };
    }

    if w.bmodels.is_empty() {
        return Ok(());
    }
    let w_mins = w.bmodels[0].bounds[0];
    let w_maxs = w.bmodels[0].bounds[1];

    let mut maxs = [0.0f32; 3];
    for i in 0..3 {
        w.light_grid_origin[i] = w.light_grid_size[i] * (w_mins[i] / w.light_grid_size[i]).ceil();
        maxs[i] = w.light_grid_size[i] * (w_maxs[i] / w.light_grid_size[i]).floor();
        w.light_grid_bounds[i] =
            ((maxs[i] - w.light_grid_origin[i]) / w.light_grid_size[i]) as i32 + 1;
    }
    let num_grid_points =
        w.light_grid_bounds[0] as i64 * w.light_grid_bounds[1] as i64 * w.light_grid_bounds[2] as i64;

    let mut samples = lr.records::<DGrid>(LUMP_LIGHTGRID)?;
    if samples.len() as i64 != num_grid_points {
        warn!(
            "WARNING: light grid mismatch ({} != {})",
            samples.len(),
            num_grid_points
        );
        w.light_grid_data.clear();
        return Ok(());
    }

    // deal with overbright bits
    for sample in samples.iter_mut() {
        for k in 0..MAXLIGHTMAPS {
            sample.ambient_light[k] = color_shift_lighting_bytes3(shift, sample.ambient_light[k]);
            sample.direct_light[k] = color_shift_lighting_bytes3(shift, sample.direct_light[k]);
        }
    }
    w.light_grid_data = samples;
    Ok(())
}

fn load_light_grid_array(lr: &LumpReader, world: &mut World) -> Result<(), LoadError> {
    let expected = world.light_grid_bounds[0] as i64
        * world.light_grid_bounds[1] as i64
        * world.light_grid_bounds[2] as i64;

    let array = lr.records::<u16>(LUMP_LIGHTARRAY)?;
    if array.len() as i64 != expected {
        warn!(
            "WARNING: light grid array mismatch ({} != {})",
            array.len(),
            expected
        );
        world.light_grid_data.clear();
        return Ok(());
    }
    world.light_grid_array = array;
    Ok(())
}

// ============================================================
// Whole-file load
// ============================================================

fn strip_base_name(path: &str) -> String {
    let file = path.rsplit('/').next().unwrap_or(path);
    match file.rfind('.') {
        Some(dot) => file[..dot].to_string(),
        None => file.to_string(),
    }
}

fn load_world(
    tr: &mut TrGlobals,
    name: &str,
    fs: &dyn FileSystem,
    shader_sys: &mut dyn ShaderSystem,
    config: &RenderConfig,
    index: usize,
) -> Result<World, LoadError> {
    // only instance loads may reuse the main world's cached image; a
    // top-level load always goes through the file system so a changed
    // file under the same name is never masked
    let cached = if index != 0 {
        let guard = CACHED_MAP.lock();
        guard
            .as_ref()
            .filter(|c| c.name == name)
            .map(|c| c.data.clone())
    } else {
        None
    };
    let buffer = match cached {
        Some(data) => data,
        None => Arc::new(
            fs.read_file(name)
                .ok_or_else(|| LoadError::NotFound(name.to_string()))?,
        ),
    };
    if index == 0 {
        *CACHED_MAP.lock() = Some(CachedMap {
            name: name.to_string(),
            data: buffer.clone(),
        });
    }

    if buffer.len() < size_of::<DHeader>() {
        return Err(LoadError::WrongIdent(name.to_string()));
    }
    let header: DHeader =
        bytemuck::pod_read_unaligned::<DHeader>(&buffer[..size_of::<DHeader>()]).swapped();
    if header.ident != BSP_IDENT {
        return Err(LoadError::WrongIdent(name.to_string()));
    }
    if header.version != BSP_VERSION {
        return Err(LoadError::WrongVersion {
            name: name.to_string(),
            version: header.version,
            expected: BSP_VERSION,
        });
    }

    let lr = LumpReader::new(name, &buffer, header.lumps);

    let mut world = World {
        name: name.to_string(),
        base_name: strip_base_name(name),
        index,
        ..Default::default()
    };

    let shift = color_shift_for(config);
    let global_fog_template = tr
        .world
        .as_ref()
        .and_then(|w| w.global_fog.map(|g| w.fogs[g].clone()));
    let style_colors = tr.style_colors;

    // load into heap
    load_shaders(&lr, &mut world)?;
    load_lightmaps(&lr, &mut world, tr, config)?;
    load_planes(&lr, &mut world)?;
    load_fogs(&lr, &mut world, shader_sys, global_fog_template)?;
    load_surfaces(&lr, &mut world, shader_sys, config, &style_colors)?;
    load_marksurfaces(&lr, &mut world)?;
    load_nodes_and_leafs(&lr, &mut world)?;
    load_submodels(&lr, &mut world, tr)?;
    load_visibility(&lr, &mut world)?;

    // only the main world carries an entity lump and a light grid
    if index == 0 {
        load_entities(lr.raw(LUMP_ENTITIES)?, &mut world, tr);
        load_light_grid(&lr, &mut world, shift)?;
        load_light_grid_array(&lr, &mut world)?;
    }

    Ok(world)
}

/// RE_LoadWorldMap — load the level the next scene will be rendered in.
/// Nothing is published unless every lump parses; a failed load leaves the
/// previous state untouched.
pub fn re_load_world_map(
    tr: &mut TrGlobals,
    name: &str,
    fs: &dyn FileSystem,
    shader_sys: &mut dyn ShaderSystem,
    config: &RenderConfig,
) -> Result<(), LoadError> {
    if tr.world_map_loaded {
        return Err(LoadError::RedundantWorldLoad);
    }

    let world = load_world(tr, name, fs, shader_sys, config, 0)?;
    tr.world_map_loaded = true;
    tr.world = Some(world);
    info!("RE_LoadWorldMap: {} ok", name);
    Ok(())
}

/// Load a .bsp as an inline model instance ("*1-0" and friends), stacked
/// alongside the main world. Returns the instance index.
pub fn re_load_bsp_instance(
    tr: &mut TrGlobals,
    name: &str,
    fs: &dyn FileSystem,
    shader_sys: &mut dyn ShaderSystem,
    config: &RenderConfig,
) -> Result<usize, LoadError> {
    let index = tr.bsp_instances.len() + 1;
    let world = load_world(tr, name, fs, shader_sys, config, index)?;
    tr.bsp_instances.push(world);
    Ok(index)
}
