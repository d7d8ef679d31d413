#![allow(dead_code)]
#![allow(clippy::needless_range_loop, clippy::too_many_arguments, clippy::identity_op,
         clippy::manual_range_contains, clippy::float_cmp)]

pub mod q_shared;
pub mod qfiles;
