#![allow(dead_code, unused_variables)]
#![allow(clippy::needless_return, clippy::too_many_arguments, clippy::collapsible_if,
         clippy::collapsible_else_if, clippy::manual_range_contains,
         clippy::identity_op, clippy::float_cmp, clippy::needless_range_loop,
         clippy::manual_clamp, clippy::type_complexity, clippy::nonminimal_bool)]
// Static world geometry: level loading and surface tessellation
// (converted from the rd-vanilla world code)

pub mod tr_local;
pub mod tr_bsp;
pub mod tr_curve;
pub mod tr_surface;
