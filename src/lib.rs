//! A small real-time renderer: resource pools, batched 2D and 3D drawing into an
//! offscreen target and a letterboxed present pass, over a pluggable device backend.

pub mod renderer;
