use std::sync::Arc;
use std::time::Instant;
use color_eyre::eyre::eyre;
use color_eyre::{Report, Result};
use glam::{Mat4, Vec2, Vec3, Vec4};
use winit::application::ApplicationHandler;
use winit::dpi::LogicalSize;
use winit::event::{ElementState, KeyEvent, WindowEvent};
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::keyboard::{Key, NamedKey};
use winit::window::{Window, WindowId};
use vellum::renderer::backend::vulkan::VulkanBackend;
use vellum::renderer::config::RenderConfig;
use vellum::renderer::error::{RenderError, RenderResult};
use vellum::renderer::resources::animation::ModelAnimation;
use vellum::renderer::resources::{Font, Model, Texture};
use vellum::renderer::{util, Renderer};

const EYE: Vec3 = Vec3::new(0.0, 2.0, 6.0);

/// Assets drawn every frame
struct Scene {
    model: Model,
    animated: Option<(Model, ModelAnimation)>,
    sprite: Texture,
    font: Font,
}

pub struct App {
    window: Option<Arc<Window>>,
    renderer: Option<Renderer<VulkanBackend>>,
    scene: Option<Scene>,
    config: RenderConfig,

    start: Instant,
    close_requested: bool,
    error: Option<Report>,
}

impl App {
    pub fn new() -> Self {
        Self {
            window: None,
            renderer: None,
            scene: None,
            config: RenderConfig {
                target_resolution: Some([640, 360]),
                ..RenderConfig::default()
            },

            start: Instant::now(),
            close_requested: false,
            error: None,
        }
    }

    pub fn run(mut self) -> Result<()> {
        let event_loop = EventLoop::new()?;
        event_loop.run_app(&mut self)?;
        // Drop the renderer before the window it presents to
        self.scene = None;
        self.renderer = None;
        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let attributes = Window::default_attributes()
            .with_title("vellum")
            .with_inner_size(LogicalSize::new(1280, 720));
        let window = Arc::new(event_loop.create_window(attributes)?);
        let backend = VulkanBackend::new(window.clone(), &self.config)?;
        let mut renderer = Renderer::new(backend, self.config.clone())?;

        let model = renderer.load_3d_model("assets/models/cube.obj")?;
        let (animated, animations) = renderer.load_animated_model("assets/models/character.gltf")?;
        let sprite = renderer.load_texture("assets/textures/sprite.png")?;
        let font = renderer.load_font("assets/fonts/font.png")?;
        renderer.load_resources_to_gpu()?;
        match renderer.use_loaded_resources() {
            // Built on the first frame the window has area
            Ok(()) | Err(RenderError::ZeroExtent) => {}
            Err(e) => return Err(eyre!(e)),
        }

        renderer.set_light_direction(Vec3::new(-0.4, -1.0, -0.3));
        self.scene = Some(Scene {
            model,
            animated: animations.into_iter().next().map(|animation| (animated, animation)),
            sprite,
            font,
        });
        self.renderer = Some(renderer);
        self.window = Some(window);
        Ok(())
    }

    fn redraw(&mut self) -> RenderResult<()> {
        let (Some(renderer), Some(scene)) = (self.renderer.as_mut(), self.scene.as_mut()) else {
            return Ok(());
        };
        let time = self.start.elapsed().as_secs_f32();
        renderer.set_time(time);
        renderer.set_3d_view_matrix_and_fov(Mat4::look_at_rh(EYE, Vec3::ZERO, Vec3::Y), 45.0, EYE);

        renderer.begin_3d_draw()?;
        renderer.draw_model(scene.model, Vec4::ZERO, Mat4::from_rotation_y(time))?;

        if let Some((model, animation)) = scene.animated.as_mut() {
            animation.update(time);
            renderer.begin_anim_3d_draw()?;
            renderer.draw_anim_model(
                *model,
                Vec4::ZERO,
                Mat4::from_translation(Vec3::new(2.0, -1.0, 0.0)),
                animation,
            )?;
        }

        renderer.begin_2d_draw()?;
        renderer.draw_quad(scene.sprite, util::rect_matrix(Vec4::new(16.0, 16.0, 64.0, 64.0), time * 45.0, 0.0))?;
        let label = "vellum";
        let width = renderer.measure_string(scene.font, label, 24.0)?;
        let x = 640.0 - width - 16.0;
        renderer.draw_string(scene.font, label, Vec2::new(x, 16.0), 24.0, 0.0, Vec4::ONE, 0.0)?;
        renderer.end_draw()
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: Report) {
        log::error!("{error:?}");
        self.error = Some(error);
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.renderer.is_none() {
            if let Err(e) = self.init(event_loop) {
                self.fail(event_loop, e);
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, window_id: WindowId, event: WindowEvent) {
        if self.window.as_ref().is_none_or(|w| w.id() != window_id) {
            return;
        }

        match event {
            WindowEvent::CloseRequested => {
                self.close_requested = true;
            }
            WindowEvent::Resized(_) | WindowEvent::ScaleFactorChanged { .. } => {
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.framebuffer_resize();
                }
            }
            WindowEvent::RedrawRequested => match self.redraw() {
                Ok(()) => {}
                // Minimized, try again once the window has a size
                Err(RenderError::ZeroExtent) => {}
                Err(e) => self.fail(event_loop, eyre!(e)),
            },
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        logical_key: key,
                        state: ElementState::Pressed,
                        ..
                    },
                ..
            } => match key.as_ref() {
                Key::Character("v") => {
                    if let Some(renderer) = self.renderer.as_mut() {
                        let vsync = !renderer.vsync();
                        renderer.set_vsync(vsync);
                        log::info!("vsync: {vsync}");
                    }
                }
                Key::Named(NamedKey::Escape) => {
                    self.close_requested = true;
                }
                _ => {}
            },
            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.close_requested {
            event_loop.exit();
            return;
        }
        if let Some(window) = self.window.as_ref() {
            window.request_redraw();
        }
    }
}
