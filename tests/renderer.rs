use glam::{Mat4, Vec2, Vec3, Vec4};
use vellum::renderer::backend::headless::{Command, HeadlessBackend, ObjectKind};
use vellum::renderer::backend::{Extent2D, PresentStatus, SurfaceStatus};
use vellum::renderer::config::RenderConfig;
use vellum::renderer::error::{DeviceError, RenderError};
use vellum::renderer::frame_resources::FrameResourceState;
use vellum::renderer::resources::import::{MeshDescription, SceneDescription};
use vellum::renderer::resources::pool::PoolState;
use vellum::renderer::resources::{Model, ModelKind, Texture};
use vellum::renderer::shader_data::MAX_TEXTURES;
use vellum::renderer::Renderer;

fn renderer() -> Renderer<HeadlessBackend> {
    Renderer::new(HeadlessBackend::new(Extent2D::new(800, 600)), RenderConfig::default()).unwrap()
}

fn triangle() -> SceneDescription {
    SceneDescription {
        meshes: vec![MeshDescription {
            positions: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            indices: vec![0, 1, 2],
            ..Default::default()
        }],
        ..Default::default()
    }
}

/// Renderer with one resident triangle in the default pool
fn ready_with_triangle() -> (Renderer<HeadlessBackend>, Model) {
    let mut renderer = renderer();
    let model = renderer.load_3d_model_from_scene(&triangle()).unwrap();
    renderer.load_resources_to_gpu().unwrap();
    renderer.use_loaded_resources().unwrap();
    (renderer, model)
}

fn instance_counts(commands: &[Command]) -> Vec<u32> {
    commands
        .iter()
        .filter_map(|c| match c {
            Command::DrawIndexed(draw) => Some(draw.instance_count),
            _ => None,
        })
        .collect()
}

#[test]
fn twenty_one_draws_of_one_model_take_two_draw_calls() {
    let (mut renderer, model) = ready_with_triangle();
    renderer.begin_3d_draw().unwrap();
    for i in 0..21 {
        let transform = Mat4::from_translation(Vec3::X * i as f32);
        renderer.draw_model(model, Vec4::ONE, transform).unwrap();
    }
    renderer.end_draw().unwrap();

    let stats = renderer.frame_stats();
    assert_eq!(stats.flushes, 2);
    assert_eq!(stats.draw_calls, 2);
    assert_eq!(stats.dropped_draws, 0);
    assert_eq!(instance_counts(renderer.backend().commands()), vec![20, 1]);
    assert_eq!(renderer.backend().presents(), 1);
}

#[test]
fn colour_change_splits_a_batch() {
    let (mut renderer, model) = ready_with_triangle();
    renderer.begin_3d_draw().unwrap();
    renderer.draw_model(model, Vec4::ONE, Mat4::IDENTITY).unwrap();
    renderer.draw_model(model, Vec4::ONE, Mat4::IDENTITY).unwrap();
    renderer.draw_model(model, Vec4::new(1.0, 0.0, 0.0, 1.0), Mat4::IDENTITY).unwrap();
    renderer.end_draw().unwrap();

    assert_eq!(instance_counts(renderer.backend().commands()), vec![2, 1]);
}

#[test]
fn textures_are_deduplicated_within_a_pool() {
    let mut renderer = renderer();
    let pool = renderer.default_pool();
    let red = renderer.load_texture_from_rgba("red", 1, 1, vec![255, 0, 0, 255]).unwrap();
    let again = renderer.load_texture_from_rgba("red", 1, 1, vec![255, 0, 0, 255]).unwrap();
    assert_eq!(red, again);

    let missing_a = renderer.load_texture("does/not/exist_a.png").unwrap();
    let missing_b = renderer.load_texture("does/not/exist_b.png").unwrap();
    assert_eq!(missing_a, missing_b);
    assert_ne!(missing_a, red);
    assert_eq!(renderer.texture_count(pool).unwrap(), 2);
}

#[test]
fn missing_model_file_loads_an_empty_model() {
    let mut renderer = renderer();
    let model = renderer.load_3d_model("does/not/exist.obj").unwrap();
    assert_eq!(model.kind, ModelKind::Static3D);
    renderer.load_resources_to_gpu().unwrap();
    renderer.use_loaded_resources().unwrap();

    renderer.begin_3d_draw().unwrap();
    renderer.draw_model(model, Vec4::ONE, Mat4::IDENTITY).unwrap();
    renderer.end_draw().unwrap();
    assert!(instance_counts(renderer.backend().commands()).is_empty());
}

#[test]
fn renders_with_no_assets_loaded() {
    let mut renderer = renderer();
    renderer.load_resources_to_gpu().unwrap();
    renderer.use_loaded_resources().unwrap();
    assert_eq!(renderer.frame_resource_state(), FrameResourceState::ResourcesReady);

    renderer.begin_2d_draw().unwrap();
    renderer.end_draw().unwrap();
    let backend = renderer.backend();
    assert_eq!(backend.presents(), 1);
    assert!(backend
        .commands()
        .iter()
        .any(|c| matches!(c, Command::Draw { vertex_count: 3, instance_count: 1 })));
}

#[test]
fn rebuilding_with_unchanged_inputs_keeps_object_count() {
    let (mut renderer, _) = ready_with_triangle();
    let live = renderer.backend().live_objects();
    renderer.backend_mut().reset_peak();

    renderer.use_loaded_resources().unwrap();
    renderer.use_loaded_resources().unwrap();
    assert_eq!(renderer.backend().live_objects(), live);
    assert_eq!(renderer.backend().peak_live_objects(), live);
}

#[test]
fn out_of_date_present_rebuilds_for_the_new_surface() {
    let (mut renderer, model) = ready_with_triangle();
    assert_eq!(renderer.target_resolution(), Extent2D::new(800, 600));
    let live = renderer.backend().live_objects();

    renderer.backend_mut().set_surface_extent(Extent2D::new(1024, 768));
    renderer.backend_mut().queue_present_status(PresentStatus::OutOfDate);
    renderer.begin_3d_draw().unwrap();
    renderer.draw_model(model, Vec4::ONE, Mat4::IDENTITY).unwrap();
    renderer.end_draw().unwrap();

    assert_eq!(renderer.frame_resource_state(), FrameResourceState::ResourcesReady);
    assert_eq!(renderer.target_resolution(), Extent2D::new(1024, 768));
    assert_eq!(renderer.backend().live_objects(), live);
    assert_eq!(renderer.backend().live_count(ObjectKind::Swapchain), 1);

    renderer.begin_3d_draw().unwrap();
    renderer.end_draw().unwrap();
    assert_eq!(renderer.backend().presents(), 2);
}

#[test]
fn out_of_date_acquire_is_retried_once() {
    let (mut renderer, _) = ready_with_triangle();
    renderer.backend_mut().queue_acquire_status(SurfaceStatus::OutOfDate);
    renderer.begin_2d_draw().unwrap();
    renderer.end_draw().unwrap();

    renderer.backend_mut().queue_acquire_status(SurfaceStatus::OutOfDate);
    renderer.backend_mut().queue_acquire_status(SurfaceStatus::OutOfDate);
    assert!(matches!(
        renderer.begin_2d_draw(),
        Err(RenderError::Device(DeviceError::SurfaceLost))
    ));
}

#[test]
fn minimized_window_reports_zero_extent_and_recovers() {
    let (mut renderer, _) = ready_with_triangle();
    renderer.backend_mut().set_surface_extent(Extent2D::new(0, 0));
    renderer.framebuffer_resize();
    assert!(matches!(renderer.begin_2d_draw(), Err(RenderError::ZeroExtent)));
    assert_eq!(renderer.frame_resource_state(), FrameResourceState::ResourcesReady);

    renderer.backend_mut().set_surface_extent(Extent2D::new(640, 480));
    renderer.begin_2d_draw().unwrap();
    renderer.end_draw().unwrap();
    assert_eq!(renderer.target_resolution(), Extent2D::new(640, 480));
}

#[test]
fn drawing_before_use_loaded_resources_is_not_ready() {
    let mut renderer = renderer();
    assert_eq!(renderer.frame_resource_state(), FrameResourceState::Uninitialized);
    assert!(matches!(renderer.begin_3d_draw(), Err(RenderError::NotReady)));
}

#[test]
fn destroying_an_in_use_pool_rebuilds_without_it() {
    let (mut renderer, _) = ready_with_triangle();
    let pool = renderer.create_resource_pool();
    let model = renderer.load_model_in(pool, ModelKind::Static3D, "does/not/exist.obj").unwrap().0;
    renderer
        .load_model_from_scene_in(pool, ModelKind::Static3D, &triangle())
        .unwrap();
    renderer.load_pool_to_gpu(pool).unwrap();
    renderer.use_loaded_resources().unwrap();
    let buffers = renderer.backend().live_count(ObjectKind::Buffer);

    renderer.destroy_resource_pool(pool).unwrap();
    assert_eq!(renderer.frame_resource_state(), FrameResourceState::ResourcesReady);
    assert!(renderer.backend().live_count(ObjectKind::Buffer) < buffers);
    assert!(matches!(
        renderer.resource_pool_state(pool),
        Err(RenderError::StalePool(p)) if p == pool
    ));

    renderer.begin_3d_draw().unwrap();
    assert!(matches!(
        renderer.draw_model(model, Vec4::ONE, Mat4::IDENTITY),
        Err(RenderError::StalePool(_))
    ));
    renderer.end_draw().unwrap();
}

#[test]
fn pools_reuse_slots_with_a_new_generation() {
    let mut renderer = renderer();
    let first = renderer.create_resource_pool();
    renderer.destroy_resource_pool(first).unwrap();
    let second = renderer.create_resource_pool();
    assert_eq!(second.index, first.index);
    assert_ne!(second, first);
    assert_eq!(renderer.resource_pool_state(second).unwrap(), PoolState::Staging);
}

#[test]
fn loading_into_a_resident_pool_is_rejected() {
    let mut renderer = renderer();
    let pool = renderer.default_pool();
    renderer.load_texture_from_rgba("red", 1, 1, vec![255, 0, 0, 255]).unwrap();
    renderer.load_resources_to_gpu().unwrap();
    assert_eq!(renderer.resource_pool_state(pool).unwrap(), PoolState::Resident);

    assert!(matches!(
        renderer.load_texture_from_rgba("blue", 1, 1, vec![0, 0, 255, 255]),
        Err(RenderError::AlreadyFinalized(p)) if p == pool
    ));
    assert!(matches!(
        renderer.load_pool_to_gpu(pool),
        Err(RenderError::AlreadyFinalized(_))
    ));
}

#[test]
fn device_memory_exhaustion_propagates_without_leaking() {
    let mut renderer = renderer();
    renderer.load_3d_model_from_scene(&triangle()).unwrap();
    let live = renderer.backend().live_objects();

    // the staging buffer succeeds, the geometry buffer fails
    renderer.backend_mut().fail_buffer_allocation_after(1);
    assert!(matches!(
        renderer.load_resources_to_gpu(),
        Err(RenderError::Device(DeviceError::OutOfDeviceMemory))
    ));
    assert_eq!(renderer.backend().live_objects(), live);
    assert_eq!(
        renderer.resource_pool_state(renderer.default_pool()).unwrap(),
        PoolState::Staging
    );

    renderer.load_resources_to_gpu().unwrap();
}

#[test]
fn draw_calls_outside_their_phase_are_rejected() {
    let (mut renderer, model) = ready_with_triangle();
    assert!(matches!(renderer.end_draw(), Err(RenderError::DrawNotStarted)));
    assert!(matches!(
        renderer.draw_model(model, Vec4::ONE, Mat4::IDENTITY),
        Err(RenderError::DrawNotStarted)
    ));

    renderer.begin_3d_draw().unwrap();
    let texture = Texture { pool: model.pool, index: 0 };
    assert!(matches!(
        renderer.draw_quad(texture, Mat4::IDENTITY),
        Err(RenderError::WrongDrawPhase { .. })
    ));
    assert!(matches!(
        renderer.use_loaded_resources(),
        Err(RenderError::WrongDrawPhase { .. })
    ));
    renderer.end_draw().unwrap();
}

#[test]
fn unreadable_font_draws_nothing() {
    let mut renderer = renderer();
    let font = renderer.load_font("does/not/exist.png").unwrap();
    renderer.load_resources_to_gpu().unwrap();
    renderer.use_loaded_resources().unwrap();

    renderer.begin_2d_draw().unwrap();
    renderer
        .draw_string(font, "blank", Vec2::ZERO, 16.0, 0.0, Vec4::ONE, 0.0)
        .unwrap();
    renderer.end_draw().unwrap();
    assert!(instance_counts(renderer.backend().commands()).is_empty());
    assert_eq!(renderer.measure_string(font, "blank", 16.0).unwrap(), 0.0);
}

#[test]
fn destroy_releases_every_device_object() {
    let (mut renderer, model) = ready_with_triangle();
    renderer.begin_3d_draw().unwrap();
    renderer.draw_model(model, Vec4::ONE, Mat4::IDENTITY).unwrap();
    renderer.end_draw().unwrap();

    renderer.destroy();
    assert_eq!(renderer.backend().live_objects(), 0);
}

#[test]
fn textures_and_fonts_load_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let sprite = dir.path().join("sprite.png");
    image::RgbaImage::from_pixel(2, 2, image::Rgba([0, 255, 0, 255]))
        .save(&sprite)
        .unwrap();

    // 16x16 grid of 16 pixel cells, only 'A' has coverage
    let atlas = dir.path().join("font.png");
    let mut pixels = image::RgbaImage::new(256, 256);
    let (col, row) = ('A' as u32 % 16, 'A' as u32 / 16);
    for y in row * 16..row * 16 + 16 {
        for x in col * 16..col * 16 + 8 {
            pixels.put_pixel(x, y, image::Rgba([255, 255, 255, 255]));
        }
    }
    pixels.save(&atlas).unwrap();

    let mut renderer = renderer();
    let texture = renderer.load_texture(&sprite).unwrap();
    assert_eq!(renderer.load_texture(&sprite).unwrap(), texture);
    let font = renderer.load_font(&atlas).unwrap();
    assert_eq!(renderer.texture_count(renderer.default_pool()).unwrap(), 2);
    renderer.load_resources_to_gpu().unwrap();
    renderer.use_loaded_resources().unwrap();
    assert!(renderer.measure_string(font, "A", 16.0).unwrap() > 0.0);

    renderer.begin_2d_draw().unwrap();
    renderer.draw_quad(texture, Mat4::IDENTITY).unwrap();
    renderer
        .draw_string(font, "AAA", Vec2::new(10.0, 10.0), 16.0, 0.0, Vec4::ONE, 0.0)
        .unwrap();
    renderer.end_draw().unwrap();
    // quads share one batch whatever their texture
    assert_eq!(instance_counts(renderer.backend().commands()), vec![4]);
}

#[test]
fn resources_activated_while_minimized_are_built_once_the_window_has_area() {
    let backend = HeadlessBackend::new(Extent2D::new(0, 0));
    let mut renderer = Renderer::new(backend, RenderConfig::default()).unwrap();
    renderer.load_resources_to_gpu().unwrap();
    assert!(matches!(renderer.use_loaded_resources(), Err(RenderError::ZeroExtent)));
    assert_eq!(renderer.frame_resource_state(), FrameResourceState::Uninitialized);
    assert!(matches!(renderer.begin_3d_draw(), Err(RenderError::ZeroExtent)));

    renderer.backend_mut().set_surface_extent(Extent2D::new(800, 600));
    renderer.framebuffer_resize();
    renderer.begin_3d_draw().unwrap();
    renderer.end_draw().unwrap();
    assert_eq!(renderer.frame_resource_state(), FrameResourceState::ResourcesReady);
    assert_eq!(renderer.target_resolution(), Extent2D::new(800, 600));
    assert_eq!(renderer.backend().presents(), 1);
}

#[test]
fn changing_frames_in_flight_rebuilds_the_ring() {
    let (mut renderer, model) = ready_with_triangle();
    assert_eq!(renderer.backend().live_count(ObjectKind::FrameSync), 2);
    let framebuffers = renderer.backend().live_count(ObjectKind::Framebuffer);

    let config = RenderConfig {
        frames_in_flight: 3,
        ..renderer.render_config().clone()
    };
    renderer.set_render_config(config);
    for _ in 0..4 {
        renderer.begin_3d_draw().unwrap();
        renderer.draw_model(model, Vec4::ONE, Mat4::IDENTITY).unwrap();
        renderer.end_draw().unwrap();
    }

    let backend = renderer.backend();
    assert_eq!(backend.live_count(ObjectKind::FrameSync), 3);
    // one more offscreen framebuffer, the swapchain ones are unchanged
    assert_eq!(backend.live_count(ObjectKind::Framebuffer), framebuffers + 1);
    assert_eq!(backend.presents(), 4);

    renderer.destroy();
    assert_eq!(renderer.backend().live_objects(), 0);
}

#[test]
fn a_pool_holds_one_texture_less_than_the_global_table() {
    let mut renderer = renderer();
    let limit = MAX_TEXTURES as usize - 1;
    for i in 0..limit {
        renderer
            .load_texture_from_rgba(&format!("texture {i}"), 1, 1, vec![i as u8, 0, 0, 255])
            .unwrap();
    }
    assert!(matches!(
        renderer.load_texture_from_rgba("one too many", 1, 1, vec![0; 4]),
        Err(RenderError::TextureLimitReached(n)) if n == limit
    ));
    assert_eq!(renderer.texture_count(renderer.default_pool()).unwrap(), limit);

    renderer.load_resources_to_gpu().unwrap();
    renderer.use_loaded_resources().unwrap();
    renderer.begin_2d_draw().unwrap();
    let last = Texture { pool: renderer.default_pool(), index: limit as u32 - 1 };
    renderer.draw_quad(last, Mat4::IDENTITY).unwrap();
    renderer.end_draw().unwrap();
}
