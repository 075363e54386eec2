use std::path::PathBuf;

/// Contains configuration options for the renderer like the resolution, vsync, and other settings.
/// Changing any of these through the renderer triggers a frame resource rebuild.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderConfig {
    /// Size of the offscreen target. `None` follows the swapchain extent.
    pub target_resolution: Option<[u32; 2]>,
    pub multisampling: bool,
    pub sample_shading: bool,
    pub vsync: bool,
    pub srgb: bool,
    pub texture_filter_nearest: bool,
    pub clear_colour: [f32; 4],
    /// Colour of the bars around a letterboxed offscreen image
    pub scaled_border_colour: [f32; 4],
    pub depth_range_3d: [f32; 2],
    pub depth_range_2d: [f32; 2],
    pub frames_in_flight: usize,
    /// Directory holding the compiled SPIR-V pipeline shaders
    pub shader_dir: PathBuf,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            target_resolution: None,
            multisampling: true,
            sample_shading: false,
            vsync: true,
            srgb: true,
            texture_filter_nearest: true,
            clear_colour: [0.0, 0.0, 0.0, 1.0],
            scaled_border_colour: [0.0, 0.0, 0.0, 1.0],
            depth_range_3d: [0.1, 500.0],
            depth_range_2d: [-10.0, 10.0],
            frames_in_flight: 2,
            shader_dir: PathBuf::from("shaders"),
        }
    }
}
