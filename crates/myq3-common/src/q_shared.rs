// q_shared.rs — foundational types and functions shared by all modules
// Converted from: code/qcommon/q_shared.h + q_math.cpp

// ============================================================
// Basic types
// ============================================================

pub type Vec3 = [f32; 3];
pub type Vec4 = [f32; 4];

pub const VEC3_ORIGIN: Vec3 = [0.0, 0.0, 0.0];

// ============================================================
// Limits
// ============================================================

pub const MAX_TOKEN_CHARS: usize = 1024;

pub const MAX_QPATH: usize = 64;
pub const MAX_OSPATH: usize = 256;

/// World geometry never extends past this on any axis.
pub const MAX_WORLD_COORD: f32 = (64 * 1024) as f32;
pub const MIN_WORLD_COORD: f32 = -(64 * 1024) as f32;
pub const WORLD_SIZE: f32 = MAX_WORLD_COORD - MIN_WORLD_COORD;

// ============================================================
// Surface flags (subset the renderer reads)
// ============================================================

pub const SURF_SKY: i32 = 0x4;
pub const SURF_NODRAW: i32 = 0x80; // don't generate a drawsurface at all

// ============================================================
// Plane
// ============================================================

// plane_type is set when the plane is axis-aligned so side tests can
// use a single component compare.
pub const PLANE_X: u8 = 0;
pub const PLANE_Y: u8 = 1;
pub const PLANE_Z: u8 = 2;
pub const PLANE_NON_AXIAL: u8 = 3;

/// Decision nodes of the world tree carry this in place of leaf contents.
pub const CONTENTS_NODE: i32 = -1;

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct CPlane {
    pub normal: Vec3,
    pub dist: f32,
    pub plane_type: u8, // for fast side tests: 0,1,2 = axial, 3 = nonaxial
    pub signbits: u8,   // signx + (signy<<1) + (signz<<2), for fast box tests
    pub pad: [u8; 2],
}

impl Default for CPlane {
    fn default() -> Self {
        Self {
            normal: [0.0; 3],
            dist: 0.0,
            plane_type: 0,
            signbits: 0,
            pad: [0; 2],
        }
    }
}

pub fn plane_type_for_normal(normal: &Vec3) -> u8 {
    if normal[0] == 1.0 {
        PLANE_X
    } else if normal[1] == 1.0 {
        PLANE_Y
    } else if normal[2] == 1.0 {
        PLANE_Z
    } else {
        PLANE_NON_AXIAL
    }
}

pub fn set_plane_signbits(plane: &mut CPlane) {
    let mut bits: u8 = 0;
    for j in 0..3 {
        if plane.normal[j] < 0.0 {
            bits |= 1 << j;
        }
    }
    plane.signbits = bits;
}

// ============================================================
// MATHLIB — Vector operations
// ============================================================

#[inline]
pub fn dot_product(a: &Vec3, b: &Vec3) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[inline]
pub fn vector_subtract(a: &Vec3, b: &Vec3) -> Vec3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

#[inline]
pub fn vector_add(a: &Vec3, b: &Vec3) -> Vec3 {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

#[inline]
pub fn vector_negate(v: &Vec3) -> Vec3 {
    [-v[0], -v[1], -v[2]]
}

#[inline]
pub fn vector_scale(v: &Vec3, scale: f32) -> Vec3 {
    [v[0] * scale, v[1] * scale, v[2] * scale]
}

/// veca + scale * vecb
pub fn vector_ma(veca: &Vec3, scale: f32, vecb: &Vec3) -> Vec3 {
    [
        veca[0] + scale * vecb[0],
        veca[1] + scale * vecb[1],
        veca[2] + scale * vecb[2],
    ]
}

pub fn vector_compare(v1: &Vec3, v2: &Vec3) -> bool {
    v1[0] == v2[0] && v1[1] == v2[1] && v1[2] == v2[2]
}

/// Normalize in place, returns original length.
pub fn vector_normalize(v: &mut Vec3) -> f32 {
    let length = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
    if length != 0.0 {
        let ilength = 1.0 / length;
        v[0] *= ilength;
        v[1] *= ilength;
        v[2] *= ilength;
    }
    length
}

pub fn vector_length(v: &Vec3) -> f32 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

pub fn distance(a: &Vec3, b: &Vec3) -> f32 {
    vector_length(&vector_subtract(b, a))
}

pub fn cross_product(v1: &Vec3, v2: &Vec3) -> Vec3 {
    [
        v1[1] * v2[2] - v1[2] * v2[1],
        v1[2] * v2[0] - v1[0] * v2[2],
        v1[0] * v2[1] - v1[1] * v2[0],
    ]
}

pub fn clear_bounds(bounds: &mut [Vec3; 2]) {
    bounds[0] = [99999.0, 99999.0, 99999.0];
    bounds[1] = [-99999.0, -99999.0, -99999.0];
}

pub fn add_point_to_bounds(v: &Vec3, bounds: &mut [Vec3; 2]) {
    for i in 0..3 {
        if v[i] < bounds[0][i] {
            bounds[0][i] = v[i];
        }
        if v[i] > bounds[1][i] {
            bounds[1][i] = v[i];
        }
    }
}

pub fn radius_from_bounds(mins: &Vec3, maxs: &Vec3) -> f32 {
    let mut corner = [0.0f32; 3];
    for i in 0..3 {
        let a = mins[i].abs();
        let b = maxs[i].abs();
        corner[i] = if a > b { a } else { b };
    }
    vector_length(&corner)
}

// ============================================================
// Color packing
// ============================================================

/// Pack four 0..255 float channels into a little-endian RGBA dword.
pub fn color_bytes4(r: f32, g: f32, b: f32, a: f32) -> u32 {
    u32::from_le_bytes([r as u8, g as u8, b as u8, a as u8])
}

// ============================================================
// Byte order functions
// ============================================================

// On modern hardware we target little-endian. These are identity on LE,
// byte-swap on BE. Rust's native endian conversion handles this.

#[inline]
pub fn little_short(l: i16) -> i16 {
    i16::from_le(l)
}

#[inline]
pub fn little_long(l: i32) -> i32 {
    i32::from_le(l)
}

#[inline]
pub fn little_ushort(l: u16) -> u16 {
    u16::from_le(l)
}

#[inline]
pub fn little_float(l: f32) -> f32 {
    f32::from_bits(u32::from_le(l.to_bits()))
}

// ============================================================
// Token parser (COM_Parse equivalent)
// ============================================================

/// Parse one whitespace-delimited token from `data`, handling // comments
/// and "quoted strings". Returns `(token, remaining)` or `(token, None)`
/// if end of data.
pub fn com_parse(data: &str) -> (String, Option<&str>) {
    let mut chars = data.as_bytes();
    let mut token = String::new();

    // skip whitespace
    loop {
        while !chars.is_empty() && chars[0] <= b' ' {
            if chars[0] == 0 {
                return (String::new(), None);
            }
            chars = &chars[1..];
        }
        if chars.is_empty() {
            return (String::new(), None);
        }

        // skip // comments
        if chars.len() >= 2 && chars[0] == b'/' && chars[1] == b'/' {
            while !chars.is_empty() && chars[0] != b'\n' {
                chars = &chars[1..];
            }
            continue;
        }
        break;
    }

    // handle quoted strings
    if chars[0] == b'"' {
        chars = &chars[1..];
        while !chars.is_empty() && chars[0] != b'"' {
            if token.len() < MAX_TOKEN_CHARS {
                token.push(chars[0] as char);
            }
            chars = &chars[1..];
        }
        if !chars.is_empty() {
            chars = &chars[1..]; // skip closing quote
        }
        let offset = data.len() - chars.len();
        let remaining = if chars.is_empty() {
            None
        } else {
            Some(&data[offset..])
        };
        return (token, remaining);
    }

    // parse regular word
    while !chars.is_empty() && chars[0] > b' ' {
        if token.len() < MAX_TOKEN_CHARS {
            token.push(chars[0] as char);
        }
        chars = &chars[1..];
    }
    if token.len() >= MAX_TOKEN_CHARS {
        token.clear();
    }

    let offset = data.len() - chars.len();
    let remaining = if chars.is_empty() {
        None
    } else {
        Some(&data[offset..])
    };
    (token, remaining)
}

/// Parse a space-separated list of floats out of a single token value
/// (entity keys like "gridsize" store "64 64 128" in one quoted value).
pub fn parse_floats(text: &str, out: &mut [f32]) {
    let mut rest = text;
    for slot in out.iter_mut() {
        let (tok, remaining) = com_parse(rest);
        if tok.is_empty() {
            break;
        }
        *slot = tok.parse::<f32>().unwrap_or(0.0);
        match remaining {
            Some(r) => rest = r,
            None => break,
        }
    }
}
