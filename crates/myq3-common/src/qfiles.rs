// qfiles.rs — on-disk level file format structures
// Converted from: code/qcommon/qfiles.h (.bsp section)

use bytemuck::{Pod, Zeroable};

use crate::q_shared::{little_float, little_long, Vec3};

// ============================================================
// .BSP file format
// ============================================================

/// Level magic: "RBSP" in little-endian
pub const BSP_IDENT: i32 =
    (b'P' as i32) << 24 | (b'S' as i32) << 16 | (b'B' as i32) << 8 | b'R' as i32;
pub const BSP_VERSION: i32 = 1;

pub const LUMP_ENTITIES: usize = 0;
pub const LUMP_SHADERS: usize = 1;
pub const LUMP_PLANES: usize = 2;
pub const LUMP_NODES: usize = 3;
pub const LUMP_LEAFS: usize = 4;
pub const LUMP_LEAFSURFACES: usize = 5;
pub const LUMP_LEAFBRUSHES: usize = 6;
pub const LUMP_MODELS: usize = 7;
pub const LUMP_BRUSHES: usize = 8;
pub const LUMP_BRUSHSIDES: usize = 9;
pub const LUMP_DRAWVERTS: usize = 10;
pub const LUMP_DRAWINDEXES: usize = 11;
pub const LUMP_FOGS: usize = 12;
pub const LUMP_SURFACES: usize = 13;
pub const LUMP_LIGHTMAPS: usize = 14;
pub const LUMP_LIGHTGRID: usize = 15;
pub const LUMP_VISIBILITY: usize = 16;
pub const LUMP_LIGHTARRAY: usize = 17;
pub const HEADER_LUMPS: usize = 18;

/// Style layers carried per surface / per vertex / per grid sample.
pub const MAXLIGHTMAPS: usize = 4;

// light style slot markers
pub const LS_NORMAL: u8 = 0x00;
pub const LS_UNUSED: u8 = 0xfe;
pub const LS_NONE: u8 = 0xff;

pub const MAX_LIGHT_STYLES: usize = 64;

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct Lump {
    pub fileofs: i32,
    pub filelen: i32,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct DHeader {
    pub ident: i32,
    pub version: i32,
    pub lumps: [Lump; HEADER_LUMPS],
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct DShader {
    pub shader: [u8; 64],
    pub surface_flags: i32,
    pub content_flags: i32,
}

// planes x^1 is always the opposite of plane x
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct DPlane {
    pub normal: Vec3,
    pub dist: f32,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct DNode {
    pub plane_num: i32,
    pub children: [i32; 2], // negative numbers are -(leafs+1), not nodes
    pub mins: [i32; 3],     // for frustom culling
    pub maxs: [i32; 3],
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct DLeaf {
    pub cluster: i32, // -1 = opaque cluster (do I still store these?)
    pub area: i32,

    pub mins: [i32; 3], // for frustum culling
    pub maxs: [i32; 3],

    pub first_leaf_surface: i32,
    pub num_leaf_surfaces: i32,

    pub first_leaf_brush: i32,
    pub num_leaf_brushes: i32,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct DModel {
    pub mins: Vec3,
    pub maxs: Vec3,
    pub first_surface: i32,
    pub num_surfaces: i32,
    pub first_brush: i32,
    pub num_brushes: i32,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct DBrush {
    pub first_side: i32,
    pub num_sides: i32,
    pub shader_num: i32, // the shader that determines the contents flags
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct DBrushSide {
    pub plane_num: i32, // positive plane side faces out of the leaf
    pub shader_num: i32,
    pub draw_surf_num: i32,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct DFog {
    pub shader: [u8; 64],
    pub brush_num: i32,
    pub visible_side: i32, // the brush side that ray tests need to clip against (-1 == none)
}

/// Per-vertex draw data as stored on disk, with MAXLIGHTMAPS style layers
/// of lightmap coordinates and colors.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct MapVert {
    pub xyz: Vec3,
    pub st: [f32; 2],
    pub lightmap: [[f32; 2]; MAXLIGHTMAPS],
    pub normal: Vec3,
    pub color: [[u8; 4]; MAXLIGHTMAPS],
}

pub const MST_BAD: i32 = 0;
pub const MST_PLANAR: i32 = 1;
pub const MST_PATCH: i32 = 2;
pub const MST_TRIANGLE_SOUP: i32 = 3;
pub const MST_FLARE: i32 = 4;

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct DSurface {
    pub shader_num: i32,
    pub fog_num: i32,
    pub surface_type: i32,

    pub first_vert: i32,
    pub num_verts: i32,

    pub first_index: i32,
    pub num_indexes: i32,

    pub lightmap_styles: [u8; MAXLIGHTMAPS],
    pub vertex_styles: [u8; MAXLIGHTMAPS],
    pub lightmap_num: [i32; MAXLIGHTMAPS],
    pub lightmap_x: [i32; MAXLIGHTMAPS],
    pub lightmap_y: [i32; MAXLIGHTMAPS],
    pub lightmap_width: i32,
    pub lightmap_height: i32,

    pub lightmap_origin: Vec3,
    pub lightmap_vecs: [Vec3; 3], // for patches, [0] and [1] are lodbounds

    pub patch_width: i32,
    pub patch_height: i32,
}

/// One light grid sample: MAXLIGHTMAPS styles of ambient + directed color,
/// the style ids, and a lat/long encoded light direction.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct DGrid {
    pub ambient_light: [[u8; 3]; MAXLIGHTMAPS],
    pub direct_light: [[u8; 3]; MAXLIGHTMAPS],
    pub styles: [u8; MAXLIGHTMAPS],
    pub lat_long: [u8; 2],
}

// ============================================================
// Endian normalization
// ============================================================

/// A fixed-size on-disk record. `swapped` converts every multi-byte field
/// from file byte order (little-endian) to host order; lump slicing applies
/// it once so nothing downstream ever touches raw file bytes.
pub trait DiskRecord: Pod {
    fn swapped(self) -> Self;
}

#[inline]
fn swap_vec3(v: Vec3) -> Vec3 {
    v.map(little_float)
}

// the drawindex / leafsurface / leafbrush lumps are bare integer arrays,
// and the light grid array is bare u16s
impl DiskRecord for i32 {
    fn swapped(self) -> Self {
        little_long(self)
    }
}

impl DiskRecord for u16 {
    fn swapped(self) -> Self {
        crate::q_shared::little_ushort(self)
    }
}

impl DiskRecord for Lump {
    fn swapped(self) -> Self {
        Self {
            fileofs: little_long(self.fileofs),
            filelen: little_long(self.filelen),
        }
    }
}

impl DiskRecord for DHeader {
    fn swapped(self) -> Self {
        Self {
            ident: little_long(self.ident),
            version: little_long(self.version),
            lumps: self.lumps.map(DiskRecord::swapped),
        }
    }
}

impl DiskRecord for DShader {
    fn swapped(self) -> Self {
        Self {
            shader: self.shader,
            surface_flags: little_long(self.surface_flags),
            content_flags: little_long(self.content_flags),
        }
    }
}

impl DiskRecord for DPlane {
    fn swapped(self) -> Self {
        Self {
            normal: swap_vec3(self.normal),
            dist: little_float(self.dist),
        }
    }
}

impl DiskRecord for DNode {
    fn swapped(self) -> Self {
        Self {
            plane_num: little_long(self.plane_num),
            children: self.children.map(little_long),
            mins: self.mins.map(little_long),
            maxs: self.maxs.map(little_long),
        }
    }
}

impl DiskRecord for DLeaf {
    fn swapped(self) -> Self {
        Self {
            cluster: little_long(self.cluster),
            area: little_long(self.area),
            mins: self.mins.map(little_long),
            maxs: self.maxs.map(little_long),
            first_leaf_surface: little_long(self.first_leaf_surface),
            num_leaf_surfaces: little_long(self.num_leaf_surfaces),
            first_leaf_brush: little_long(self.first_leaf_brush),
            num_leaf_brushes: little_long(self.num_leaf_brushes),
        }
    }
}

impl DiskRecord for DModel {
    fn swapped(self) -> Self {
        Self {
            mins: swap_vec3(self.mins),
            maxs: swap_vec3(self.maxs),
            first_surface: little_long(self.first_surface),
            num_surfaces: little_long(self.num_surfaces),
            first_brush: little_long(self.first_brush),
            num_brushes: little_long(self.num_brushes),
        }
    }
}

impl DiskRecord for DBrush {
    fn swapped(self) -> Self {
        Self {
            first_side: little_long(self.first_side),
            num_sides: little_long(self.num_sides),
            shader_num: little_long(self.shader_num),
        }
    }
}

impl DiskRecord for DBrushSide {
    fn swapped(self) -> Self {
        Self {
            plane_num: little_long(self.plane_num),
            shader_num: little_long(self.shader_num),
            draw_surf_num: little_long(self.draw_surf_num),
        }
    }
}

impl DiskRecord for DFog {
    fn swapped(self) -> Self {
        Self {
            shader: self.shader,
            brush_num: little_long(self.brush_num),
            visible_side: little_long(self.visible_side),
        }
    }
}

impl DiskRecord for MapVert {
    fn swapped(self) -> Self {
        Self {
            xyz: swap_vec3(self.xyz),
            st: self.st.map(little_float),
            lightmap: self.lightmap.map(|lm| lm.map(little_float)),
            normal: swap_vec3(self.normal),
            color: self.color,
        }
    }
}

impl DiskRecord for DSurface {
    fn swapped(self) -> Self {
        Self {
            shader_num: little_long(self.shader_num),
            fog_num: little_long(self.fog_num),
            surface_type: little_long(self.surface_type),
            first_vert: little_long(self.first_vert),
            num_verts: little_long(self.num_verts),
            first_index: little_long(self.first_index),
            num_indexes: little_long(self.num_indexes),
            lightmap_styles: self.lightmap_styles,
            vertex_styles: self.vertex_styles,
            lightmap_num: self.lightmap_num.map(little_long),
            lightmap_x: self.lightmap_x.map(little_long),
            lightmap_y: self.lightmap_y.map(little_long),
            lightmap_width: little_long(self.lightmap_width),
            lightmap_height: little_long(self.lightmap_height),
            lightmap_origin: swap_vec3(self.lightmap_origin),
            lightmap_vecs: self.lightmap_vecs.map(swap_vec3),
            patch_width: little_long(self.patch_width),
            patch_height: little_long(self.patch_height),
        }
    }
}

impl DiskRecord for DGrid {
    fn swapped(self) -> Self {
        // all fields are single bytes
        self
    }
}

/// Interpret a NUL-padded fixed byte array as text, stopping at the first NUL.
pub fn fixed_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
