// tr_local.rs — renderer-internal world model types and interfaces
// Converted from: code/rd-vanilla/tr_local.h (world geometry section)

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use myq3_common::q_shared::{CPlane, Vec3, Vec4};
use myq3_common::qfiles::{DGrid, DShader, MAXLIGHTMAPS, MAX_LIGHT_STYLES};

// ============================================================
// Constants
// ============================================================

pub const LIGHTMAP_SIZE: usize = 128;

// negative lightmap indexes select special lighting paths instead of a page
pub const LIGHTMAP_2D: i32 = -4; // shader is for 2D rendering
pub const LIGHTMAP_BY_VERTEX: i32 = -3; // pre-lit triangle models
pub const LIGHTMAP_WHITEIMAGE: i32 = -2;
pub const LIGHTMAP_NONE: i32 = -1;

pub const LIGHTMAPS_NONE: [i32; MAXLIGHTMAPS] = [LIGHTMAP_NONE; MAXLIGHTMAPS];
pub const LIGHTMAPS_2D: [i32; MAXLIGHTMAPS] = [LIGHTMAP_2D; MAXLIGHTMAPS];
pub const LIGHTMAPS_VERTEX: [i32; MAXLIGHTMAPS] = [LIGHTMAP_BY_VERTEX; MAXLIGHTMAPS];
pub const LIGHTMAPS_FULLBRIGHT: [i32; MAXLIGHTMAPS] = [LIGHTMAP_WHITEIMAGE; MAXLIGHTMAPS];

pub const STYLES_DEFAULT: [u8; MAXLIGHTMAPS] = [
    myq3_common::qfiles::LS_NORMAL,
    myq3_common::qfiles::LS_NONE,
    myq3_common::qfiles::LS_NONE,
    myq3_common::qfiles::LS_NONE,
];

/// Max dimensions of a patch control grid as authored.
pub const MAX_PATCH_SIZE: usize = 32;
/// Max dimensions of a subdivided curve grid.
pub const MAX_GRID_SIZE: usize = 65;

// ============================================================
// Errors
// ============================================================

/// Fatal level-load conditions. Anything recoverable is substituted and
/// logged instead; when one of these comes back, no world is published.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("RE_LoadWorldMap: {0} not found")]
    NotFound(String),

    #[error("attempted to redundantly load world map")]
    RedundantWorldLoad,

    #[error("LoadMap: {0} is not a level file")]
    WrongIdent(String),

    #[error("LoadMap: {name} has wrong version number ({version} should be {expected})")]
    WrongVersion {
        name: String,
        version: i32,
        expected: i32,
    },

    #[error("LoadMap: funny lump size in {0}")]
    FunnyLumpSize(String),

    #[error("LoadMap: lump extends past end of {0}")]
    LumpOutOfBounds(String),

    #[error("ShaderForShaderNum: bad num {0}")]
    BadShaderNum(i32),

    #[error("fog brushNumber out of range")]
    FogBrushOutOfRange,

    #[error("fog brush sideNumber out of range")]
    FogSideOutOfRange,

    #[error("{0}: global fog not allowed in bsp instances")]
    GlobalFogInInstance(String),

    #[error("ParseMesh: bad mesh size {0} x {1}")]
    BadPatchSize(i32, i32),

    #[error("ParseTriSurf: verts > MAX ({0} > {1})")]
    TooManyVerts(usize, usize),

    #[error("ParseTriSurf: indices > MAX ({0} > {1})")]
    TooManyIndexes(usize, usize),

    #[error("Bad index in trisoup surface")]
    BadTriIndex,

    #[error("Bad surfaceType {0}")]
    BadSurfaceType(i32),

    #[error("LoadMap: bad surface number {0} in marksurface lump")]
    BadMarksurfaceNum(i32),

    #[error("LoadMap: surface references out-of-range verts or indexes")]
    BadSurfaceRange,

    #[error("LoadMap: bad plane number {0}")]
    BadPlaneNum(i32),

    #[error("LoadMap: bad node child {0}")]
    BadNodeChild(i32),
}

// ============================================================
// Material descriptors
// ============================================================

/// Fog parameters a material can carry.
#[derive(Debug, Clone, Copy, Default)]
pub struct FogParms {
    pub color: Vec3,
    pub depth_for_opaque: f32,
}

/// What the world loader and tessellator need to know about a resolved
/// material. The material system owns everything else (stages, images);
/// surfaces hold these by shared handle.
#[derive(Debug, Clone)]
pub struct Shader {
    pub name: String,
    /// registration order, used only for sorting diagnostics
    pub index: usize,
    /// the material system could not find a real definition
    pub default_shader: bool,
    pub is_sky: bool,
    pub lightmap_index: [i32; MAXLIGHTMAPS],
    pub styles: [u8; MAXLIGHTMAPS],
    pub fog_parms: Option<FogParms>,
    /// flare / portal distance override, 0 = unset
    pub portal_range: f32,
}

impl Default for Shader {
    fn default() -> Self {
        Self {
            name: String::from("<default>"),
            index: 0,
            default_shader: true,
            is_sky: false,
            lightmap_index: LIGHTMAPS_NONE,
            styles: STYLES_DEFAULT,
            fog_parms: None,
            portal_range: 0.0,
        }
    }
}

// ============================================================
// World surfaces
// ============================================================

/// One lit vertex of a grid or triangle soup, MAXLIGHTMAPS style layers
/// of lightmap coords and colors kept for render-time blending.
#[derive(Debug, Clone, Copy)]
pub struct DrawVert {
    pub xyz: Vec3,
    pub st: [f32; 2],
    pub lightmap: [[f32; 2]; MAXLIGHTMAPS],
    pub normal: Vec3,
    pub color: [[u8; 4]; MAXLIGHTMAPS],
}

impl Default for DrawVert {
    fn default() -> Self {
        Self {
            xyz: [0.0; 3],
            st: [0.0; 2],
            lightmap: [[0.0; 2]; MAXLIGHTMAPS],
            normal: [0.0; 3],
            color: [[0; 4]; MAXLIGHTMAPS],
        }
    }
}

/// One vertex of a planar face. Style layers were blended into a single
/// final color at load time, so only that color is kept.
#[derive(Debug, Clone, Copy, Default)]
pub struct FaceVert {
    pub xyz: Vec3,
    pub st: [f32; 2],
    pub lightmap: [[f32; 2]; MAXLIGHTMAPS],
    pub color: [u8; 4],
}

#[derive(Debug, Clone, Default)]
pub struct SrfFace {
    pub plane: CPlane,
    pub dlight_bits: u32,
    pub verts: Vec<FaceVert>,
    pub indexes: Vec<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct SrfGridMesh {
    pub dlight_bits: u32,

    // culling information
    pub mesh_bounds: [Vec3; 2],
    pub local_origin: Vec3,
    pub mesh_radius: f32,

    // lod information, which may be different
    // than the culling information to allow for
    // groups of curves that LOD as a unit
    pub lod_origin: Vec3,
    pub lod_radius: f32,

    // vertexes
    pub width: usize,
    pub height: usize,
    pub width_lod_error: Vec<f32>,
    pub height_lod_error: Vec<f32>,
    pub verts: Vec<DrawVert>, // width * height
}

#[derive(Debug, Clone, Default)]
pub struct SrfTriangles {
    pub dlight_bits: u32,
    pub bounds: [Vec3; 2],
    pub verts: Vec<DrawVert>,
    pub indexes: Vec<u32>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SrfFlare {
    pub origin: Vec3,
    pub normal: Vec3,
    pub color: Vec3,
}

/// Closed set of renderable world surface kinds. `Skip` is the placeholder
/// for nodraw surfaces that still occupy their index so leaf surface lists
/// stay valid.
#[derive(Debug, Clone)]
pub enum SurfaceData {
    Face(SrfFace),
    Grid(SrfGridMesh),
    Triangles(SrfTriangles),
    Flare(SrfFlare),
    Skip,
}

#[derive(Debug, Clone)]
pub struct MSurface {
    pub shader: Arc<Shader>,
    /// index into World::fogs, 0 = not fogged
    pub fog_index: usize,
    pub data: SurfaceData,
}

// ============================================================
// Fog volumes
// ============================================================

#[derive(Debug, Clone, Default)]
pub struct Fog {
    pub original_brush_number: i32,
    pub bounds: [Vec3; 2],

    pub color_int: u32, // in packed byte order
    pub tc_scale: f32,  // texture coordinate vector scales
    pub parms: FogParms,

    // for clipping distance in fog when outside
    pub has_surface: bool,
    pub surface: Vec4,
}

// ============================================================
// BSP tree
// ============================================================

/// A child link in the decision tree. Decision nodes and leafs live in one
/// arena (`World::nodes`, decision nodes first), so a leaf reference is an
/// index past `num_decision_nodes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRef {
    Node(u32),
    Leaf(u32),
}

impl NodeRef {
    /// Disk child encoding: negative numbers are -(leafnum + 1).
    pub fn from_disk(p: i32) -> Self {
        if p >= 0 {
            NodeRef::Node(p as u32)
        } else {
            NodeRef::Leaf((-1 - p) as u32)
        }
    }
}

#[derive(Debug, Clone)]
pub struct MNode {
    // common with leaf and node
    pub contents: i32, // CONTENTS_NODE for decision nodes
    pub mins: [i32; 3], // for bounding box culling
    pub maxs: [i32; 3],
    pub parent: Option<u32>, // flat index into World::nodes

    // node specific
    pub plane: u32, // index into World::planes
    pub children: [NodeRef; 2],

    // leaf specific
    pub cluster: i32,
    pub area: i32,
    pub first_mark_surface: u32,
    pub num_mark_surfaces: u32,
}

impl Default for MNode {
    fn default() -> Self {
        Self {
            contents: 0,
            mins: [0; 3],
            maxs: [0; 3],
            parent: None,
            plane: 0,
            children: [NodeRef::Node(0); 2],
            cluster: 0,
            area: 0,
            first_mark_surface: 0,
            num_mark_surfaces: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BModel {
    pub bounds: [Vec3; 2], // looks like this is only referenced by the server
    pub first_surface: u32,
    pub num_surfaces: u32,
}

// ============================================================
// The world
// ============================================================

/// A fully loaded level. Returned by value from the load path and only
/// installed into the globals after every lump parsed cleanly.
#[derive(Debug, Clone, Default)]
pub struct World {
    pub name: String,      // ie: maps/tim_dm2.bsp
    pub base_name: String, // ie: tim_dm2

    /// 0 == the main world, >0 == a bsp instance
    pub index: usize,

    pub shaders: Vec<DShader>,

    pub bmodels: Vec<BModel>,

    pub planes: Vec<CPlane>,

    /// decision nodes first, then leafs
    pub nodes: Vec<MNode>,
    pub num_decision_nodes: usize,

    pub surfaces: Vec<MSurface>,

    pub marksurfaces: Vec<u32>,

    /// fogs[0] is the "not fogged" slot; one extra zeroed slot is reserved
    /// past num_fogs
    pub fogs: Vec<Fog>,
    pub num_fogs: usize,
    pub global_fog: Option<usize>,

    pub light_grid_size: Vec3,
    pub light_grid_inverse_size: Vec3,
    pub light_grid_origin: Vec3,
    pub light_grid_bounds: [i32; 3],
    pub light_grid_data: Vec<DGrid>,
    pub light_grid_array: Vec<u16>,

    /// this level's first page in TrGlobals::lightmaps
    pub start_lightmap_index: usize,

    pub num_clusters: usize,
    pub cluster_bytes: usize,
    pub vis: Option<Vec<u8>>, // may be missing, which is NOT an error
    pub novis: Vec<u8>,       // clusterBytes of 0xff

    pub entity_string: String,
}

impl World {
    pub fn node(&self, r: NodeRef) -> &MNode {
        &self.nodes[self.flat_index(r)]
    }

    pub fn flat_index(&self, r: NodeRef) -> usize {
        match r {
            NodeRef::Node(i) => i as usize,
            NodeRef::Leaf(i) => self.num_decision_nodes + i as usize,
        }
    }

    /// Walk the decision tree down to the leaf containing `p`.
    /// Returns the flat node index of that leaf.
    pub fn point_in_leaf(&self, p: &Vec3) -> usize {
        let mut cur = NodeRef::Node(0);
        loop {
            let idx = self.flat_index(cur);
            let node = &self.nodes[idx];
            if node.contents != myq3_common::q_shared::CONTENTS_NODE {
                return idx;
            }
            let plane = &self.planes[node.plane as usize];
            let d = myq3_common::q_shared::dot_product(p, &plane.normal) - plane.dist;
            cur = if d > 0.0 {
                node.children[0]
            } else {
                node.children[1]
            };
        }
    }

    /// The potentially-visible-set row for a cluster. Out-of-range or
    /// missing data falls back to the everything-visible row.
    pub fn cluster_pvs(&self, cluster: i32) -> &[u8] {
        match &self.vis {
            Some(vis) if cluster >= 0 && (cluster as usize) < self.num_clusters => {
                let ofs = cluster as usize * self.cluster_bytes;
                &vis[ofs..ofs + self.cluster_bytes]
            }
            _ => &self.novis,
        }
    }
}

// ============================================================
// Lightmap pages
// ============================================================

/// One 128x128 lightmap page expanded to RGBA, overbright shift applied.
#[derive(Debug, Clone)]
pub struct LightmapPage {
    pub name: String, // ie: $mapname/lightmap3
    pub pixels: Vec<u8>, // LIGHTMAP_SIZE * LIGHTMAP_SIZE * 4
}

// ============================================================
// View / orientation
// ============================================================

#[derive(Debug, Clone, Copy)]
pub struct Orientation {
    pub origin: Vec3,
    pub axis: [Vec3; 3],
}

impl Default for Orientation {
    fn default() -> Self {
        Self {
            origin: [0.0; 3],
            axis: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
        }
    }
}

impl Orientation {
    /// Transform a point from this orientation's local space into world
    /// space.
    pub fn local_to_world(&self, local: &Vec3) -> Vec3 {
        [
            self.origin[0]
                + local[0] * self.axis[0][0]
                + local[1] * self.axis[1][0]
                + local[2] * self.axis[2][0],
            self.origin[1]
                + local[0] * self.axis[0][1]
                + local[1] * self.axis[1][1]
                + local[2] * self.axis[2][1],
            self.origin[2]
                + local[0] * self.axis[0][2]
                + local[1] * self.axis[1][2]
                + local[2] * self.axis[2][2],
        ]
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ViewParms {
    pub ori: Orientation,
    pub is_mirror: bool,
}

// ============================================================
// Configuration
// ============================================================

/// The handful of tunables the world code reads, one typed field per
/// setting.
#[derive(Debug, Clone, Copy)]
pub struct RenderConfig {
    /// overbright factor baked into the level's light data
    pub map_overbright_bits: i32,
    /// overbright factor the display path applies
    pub overbright_bits: i32,
    /// drop lightmaps, light by vertex colors only
    pub vertex_light: bool,
    /// 2 = recolor lightmaps by intensity for inspection
    pub lightmap_mode: i32,
    pub fullbright: bool,
    /// force every non-sky world surface to the default material
    pub single_shader: bool,
    /// curve tessellation tolerance, <= 0 keeps every grid row
    pub lod_curve_error: f32,
    pub flares: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            map_overbright_bits: 2,
            overbright_bits: 1,
            vertex_light: false,
            lightmap_mode: 0,
            fullbright: false,
            single_shader: false,
            lod_curve_error: 250.0,
            flares: true,
        }
    }
}

// ============================================================
// Collaborator interfaces
// ============================================================

/// Read-only access to game data files (paks or loose files).
pub trait FileSystem {
    fn read_file(&self, name: &str) -> Option<Vec<u8>>;
}

/// The material system. The loader hands it names plus the lightmap pages
/// and style layers a surface was lit with; it hands back descriptors.
pub trait ShaderSystem {
    fn find_shader(
        &mut self,
        name: &str,
        lightmap_index: &[i32; MAXLIGHTMAPS],
        styles: &[u8; MAXLIGHTMAPS],
    ) -> Arc<Shader>;

    fn default_shader(&mut self) -> Arc<Shader>;
}

// ============================================================
// Registered models / globals
// ============================================================

/// What gets registered for each inline submodel ("*1", "*2-1", ...).
#[derive(Debug, Clone, Default)]
pub struct RegisteredModel {
    pub name: String,
    /// which World the surface range indexes into (0 = main world)
    pub world_index: usize,
    pub bounds: [Vec3; 2],
    pub first_surface: u32,
    pub num_surfaces: u32,
}

/// Backend-independent renderer globals for the world code.
pub struct TrGlobals {
    pub world_map_loaded: bool,
    pub world: Option<World>,
    /// loaded bsp instances, index 1 and up
    pub bsp_instances: Vec<World>,

    pub lightmaps: Vec<LightmapPage>,
    /// pages seen so far across all loaded levels; counts even when pages
    /// are not decoded (vertex light)
    pub num_lightmaps: usize,

    // worldspawn values
    pub distance_cull: f32,
    pub ranged_fog: f32,
    pub sun_ambient: Vec3,

    pub style_colors: [[u8; 3]; MAX_LIGHT_STYLES],

    pub models: HashMap<String, RegisteredModel>,
}

impl Default for TrGlobals {
    fn default() -> Self {
        Self {
            world_map_loaded: false,
            world: None,
            bsp_instances: Vec::new(),
            lightmaps: Vec::new(),
            num_lightmaps: 0,
            distance_cull: 6000.0,
            ranged_fog: 0.0,
            sun_ambient: [1.0, 1.0, 1.0],
            style_colors: [[255, 255, 255]; MAX_LIGHT_STYLES],
            models: HashMap::new(),
        }
    }
}

impl TrGlobals {
    pub fn new() -> Self {
        Self::default()
    }

    /// RE_SetLightStyle
    pub fn set_light_style(&mut self, style: usize, rgb: [u8; 3]) {
        if style < MAX_LIGHT_STYLES {
            self.style_colors[style] = rgb;
        }
    }

    pub fn model_by_name(&self, name: &str) -> Option<&RegisteredModel> {
        self.models.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_ref_from_disk_positive_is_node() {
        assert_eq!(NodeRef::from_disk(0), NodeRef::Node(0));
        assert_eq!(NodeRef::from_disk(17), NodeRef::Node(17));
    }

    #[test]
    fn test_node_ref_from_disk_negative_is_leaf() {
        // -1 is leaf 0, -2 is leaf 1, ...
        assert_eq!(NodeRef::from_disk(-1), NodeRef::Leaf(0));
        assert_eq!(NodeRef::from_disk(-5), NodeRef::Leaf(4));
    }

    #[test]
    fn test_set_light_style_bounds() {
        let mut tr = TrGlobals::new();
        tr.set_light_style(3, [10, 20, 30]);
        assert_eq!(tr.style_colors[3], [10, 20, 30]);
        // out of range is ignored
        tr.set_light_style(MAX_LIGHT_STYLES, [1, 1, 1]);
    }

    #[test]
    fn test_local_to_world_identity() {
        let mut ori = Orientation::default();
        ori.origin = [10.0, 20.0, 30.0];
        let p = ori.local_to_world(&[1.0, 2.0, 3.0]);
        assert_eq!(p, [11.0, 22.0, 33.0]);
    }

    #[test]
    fn test_local_to_world_rotated() {
        // 90 degree yaw: local +x becomes world +y
        let ori = Orientation {
            origin: [0.0; 3],
            axis: [[0.0, 1.0, 0.0], [-1.0, 0.0, 0.0], [0.0, 0.0, 1.0]],
        };
        let p = ori.local_to_world(&[1.0, 0.0, 0.0]);
        assert_eq!(p, [0.0, 1.0, 0.0]);
    }
}
