//! Application state and per-tick orchestration
//!
//! Owns the wgpu graphics context, the camera and detection engines, the
//! particle swarm, and the egui control panel. The frame driver in main.rs
//! calls `tick` then `render` once per scheduled frame.

use std::sync::Arc;
use std::time::Instant;

use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::window::Window;

use crate::camera::CameraCapture;
use crate::effects::firefly::{FireflySwarm, SteeringLaw};
use crate::landmarks::{LandmarkEngine, LandmarkModel};
use crate::render::ParticleRenderer;
use crate::settings::Settings;

/// Main application state
pub struct App {
    /// Reference to the window
    window: Arc<Window>,
    /// The wgpu surface for presenting rendered frames
    surface: wgpu::Surface<'static>,
    device: wgpu::Device,
    queue: wgpu::Queue,
    config: wgpu::SurfaceConfiguration,
    /// Current window size in physical pixels
    size: PhysicalSize<u32>,

    settings: Settings,

    // Capture and detection
    camera: Option<CameraCapture>,
    landmarks: Option<LandmarkEngine>,
    /// Highest camera frame number already submitted for detection
    last_submitted_frame: u64,
    /// Object count of the frame used by the last physics tick (for the UI)
    tracked_object_count: usize,
    /// Whether capture is active and the simulation is stepping
    running: bool,

    // Simulation and rendering
    swarm: FireflySwarm,
    renderer: ParticleRenderer,

    // egui integration
    egui_ctx: egui::Context,
    egui_state: egui_winit::State,
    egui_renderer: egui_wgpu::Renderer,

    // Frame timing
    fps: f64,
    last_fps_update: Instant,
    frames_since_update: u64,
}

impl App {
    /// Create a new App instance with initialized wgpu context
    pub async fn new(window: Arc<Window>, settings: Settings) -> Self {
        let size = window.inner_size();

        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let surface = instance
            .create_surface(window.clone())
            .expect("Failed to create surface");

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .expect("Failed to find suitable GPU adapter");

        log::info!("Using GPU: {}", adapter.get_info().name);
        log::info!("Backend: {:?}", adapter.get_info().backend);

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Firefly Mirror Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: adapter.limits(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .expect("Failed to create device");

        let surface_caps = surface.get_capabilities(&adapter);

        let surface_format = surface_caps
            .formats
            .iter()
            .find(|f| f.is_srgb())
            .copied()
            .unwrap_or(surface_caps.formats[0]);

        let present_mode = if surface_caps
            .present_modes
            .contains(&wgpu::PresentMode::Mailbox)
        {
            wgpu::PresentMode::Mailbox
        } else {
            wgpu::PresentMode::Fifo
        };

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode,
            alpha_mode: surface_caps.alpha_modes[0],
            view_formats: vec![],
            desired_maximum_frame_latency: 1,
        };

        surface.configure(&device, &config);

        let bounds = (config.width as f32, config.height as f32);
        let swarm = FireflySwarm::new(
            settings.particle_count,
            bounds,
            settings.physics.clone(),
            settings.max_tracked,
            settings.model.landmark_count(),
            settings.seed,
        );

        let renderer = ParticleRenderer::new(&device, surface_format, settings.particle_count);

        let egui_ctx = egui::Context::default();
        let mut style = (*egui_ctx.style()).clone();
        style.visuals.window_shadow = egui::epaint::Shadow::NONE;
        egui_ctx.set_style(style);

        let egui_state = egui_winit::State::new(
            egui_ctx.clone(),
            egui::ViewportId::ROOT,
            &window,
            Some(window.scale_factor() as f32),
            None,
            None,
        );

        let egui_renderer = egui_wgpu::Renderer::new(&device, surface_format, None, 1, false);

        let now = Instant::now();

        Self {
            window,
            surface,
            device,
            queue,
            config,
            size,
            settings,
            camera: None,
            landmarks: None,
            last_submitted_frame: 0,
            tracked_object_count: 0,
            running: false,
            swarm,
            renderer,
            egui_ctx,
            egui_state,
            egui_renderer,
            fps: 0.0,
            last_fps_update: now,
            frames_since_update: 0,
        }
    }

    /// Handle a window event, returning true if egui consumed it
    pub fn handle_window_event(&mut self, event: &WindowEvent) -> bool {
        let response = self.egui_state.on_window_event(&self.window, event);
        response.consumed
    }

    /// Resize the surface
    pub fn resize(&mut self, new_size: PhysicalSize<u32>) {
        if new_size.width > 0 && new_size.height > 0 {
            self.size = new_size;
            self.config.width = new_size.width;
            self.config.height = new_size.height;
            self.surface.configure(&self.device, &self.config);
        }
    }

    /// Get current size
    pub fn size(&self) -> PhysicalSize<u32> {
        self.size
    }

    /// Render loop target frame rate
    pub fn target_fps(&self) -> u32 {
        self.settings.target_fps
    }

    /// Whether capture is active and the simulation is stepping
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// The start/stop gesture: toggles between Idle and Running
    pub fn toggle_capture(&mut self) {
        if self.running {
            self.stop_capture();
        } else {
            self.start_capture(self.settings.camera_index);
        }
    }

    /// Open the camera and enter the Running state. A camera that fails to
    /// open (denied, missing, busy) is reported and leaves the app Idle.
    fn start_capture(&mut self, camera_index: u32) {
        match CameraCapture::new(
            camera_index,
            self.settings.camera_width,
            self.settings.camera_height,
            self.settings.camera_fps,
        ) {
            Ok(capture) => {
                self.settings.camera_index = camera_index;
                self.camera = Some(capture);
                self.last_submitted_frame = 0;
                if self.landmarks.is_none() {
                    self.init_detector();
                }
                self.running = true;
                log::info!("Capture running (camera {})", camera_index);
            }
            Err(e) => {
                log::error!("Failed to start capture: {e}");
            }
        }
    }

    /// Stop capture and return to Idle. The detection engine stays warm so a
    /// restart doesn't reload the model.
    fn stop_capture(&mut self) {
        if let Some(mut camera) = self.camera.take() {
            camera.stop();
        }
        self.running = false;
        log::info!("Capture stopped");
    }

    /// Start the landmark detection engine for the configured model
    fn init_detector(&mut self) {
        match LandmarkEngine::new(self.settings.model, self.settings.max_tracked) {
            Ok(engine) => {
                self.landmarks = Some(engine);
            }
            Err(e) => {
                log::warn!("Failed to start landmark detector: {e}");
            }
        }
    }

    /// Switch the landmark model: re-roll particle targets and restart the
    /// detection engine if one is active
    pub fn select_model(&mut self, model: LandmarkModel) {
        if self.settings.model == model {
            return;
        }
        self.settings.model = model;
        self.swarm.retarget(model.landmark_count());
        if self.landmarks.is_some() {
            self.landmarks = None;
            self.init_detector();
        }
        log::info!("Landmark model: {}", model.display_name());
    }

    /// Advance the simulation by one tick: poll the camera, feed the detector
    /// (at most once per distinct camera frame), then step the physics with
    /// the latest landmark frame. No-op while Idle.
    pub fn tick(&mut self) {
        if !self.running {
            return;
        }

        if let (Some(camera), Some(engine)) = (&self.camera, &self.landmarks) {
            if let Some(frame) = camera.latest_frame() {
                if frame.frame_number > self.last_submitted_frame {
                    engine.submit(&frame);
                    self.last_submitted_frame = frame.frame_number;
                }
            }
        }

        let frame = self
            .landmarks
            .as_ref()
            .map(|engine| engine.latest_frame())
            .unwrap_or_default();
        self.tracked_object_count = frame.objects.len();

        let bounds = (self.config.width as f32, self.config.height as f32);
        self.swarm.step(&frame, bounds);
    }

    /// Render a frame
    pub fn render(&mut self) -> Result<(), wgpu::SurfaceError> {
        let output = self.surface.get_current_texture()?;
        let view = output
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Render Encoder"),
            });

        self.renderer.draw(
            &self.queue,
            &mut encoder,
            &view,
            self.swarm.particles(),
            (self.config.width as f32, self.config.height as f32),
        );

        self.render_ui(&mut encoder, &view);

        self.queue.submit(std::iter::once(encoder.finish()));
        output.present();

        self.update_fps();

        Ok(())
    }

    fn render_ui(&mut self, encoder: &mut wgpu::CommandEncoder, view: &wgpu::TextureView) {
        let raw_input = self.egui_state.take_egui_input(&self.window);

        // Snapshot state before running egui so the closure doesn't borrow self
        let running = self.running;
        let fps = self.fps;
        let model = self.settings.model;
        let camera_frames = self.camera.as_ref().map(|c| c.frame_count()).unwrap_or(0);
        let detector_ready = self
            .landmarks
            .as_ref()
            .map(|e| e.is_ready())
            .unwrap_or(false);
        let detector_active = self.landmarks.is_some();
        let tracked = self.tracked_object_count;
        let particle_count = self.swarm.particle_count();

        let available_cameras = if running {
            Vec::new()
        } else {
            CameraCapture::list_cameras()
        };

        let mut params = self.swarm.params().clone();
        let mut new_model: Option<LandmarkModel> = None;
        let mut toggle = false;
        let mut connect_index: Option<u32> = None;

        let full_output = self.egui_ctx.run(raw_input, |ctx| {
            egui::TopBottomPanel::top("status").show(ctx, |ui| {
                ui.horizontal(|ui| {
                    ui.label("Firefly Mirror");
                    ui.separator();
                    ui.label(format!("FPS: {:.1}", fps));
                    ui.separator();
                    ui.label(format!("{} particles", particle_count));
                    ui.separator();
                    if running {
                        ui.label(format!("{} tracked", tracked));
                        if ui.button("Stop").clicked() {
                            toggle = true;
                        }
                    } else {
                        ui.label("Idle - press Space or click to start");
                    }
                });
            });

            egui::SidePanel::left("controls").show(ctx, |ui| {
                ui.heading("Camera");
                ui.separator();
                if running {
                    ui.label(format!("Frames: {}", camera_frames));
                } else if available_cameras.is_empty() {
                    ui.label("No cameras found");
                } else {
                    for cam in &available_cameras {
                        if ui.button(format!("{}: {}", cam.index, cam.name)).clicked() {
                            connect_index = Some(cam.index);
                        }
                    }
                }

                ui.separator();
                ui.heading("Landmarks");
                ui.separator();
                for candidate in [LandmarkModel::Hands, LandmarkModel::Face, LandmarkModel::Pose] {
                    if ui
                        .selectable_label(model == candidate, candidate.display_name())
                        .clicked()
                    {
                        new_model = Some(candidate);
                    }
                }
                if detector_ready {
                    ui.label("Detector ready");
                } else if detector_active {
                    ui.label("Loading model...");
                } else {
                    ui.label("Detector not started");
                }

                ui.separator();
                ui.heading("Physics");
                ui.separator();
                ui.add(egui::Slider::new(&mut params.wind_scale, 0.0..=5.0).text("Wind"));
                ui.add(egui::Slider::new(&mut params.drift_scale, 0.0..=2.0).text("Drift"));
                ui.add(egui::Slider::new(&mut params.growth_step, 0.0..=1.0).text("Growth"));
                ui.add(
                    egui::Slider::new(&mut params.claimed_probability, 0.0..=1.0).text("Claimed"),
                );
                ui.add(
                    egui::Slider::new(&mut params.escape_probability, 0.0..=0.01).text("Escape"),
                );
                ui.add(
                    egui::Slider::new(&mut params.reflip_probability, 0.0..=1.0).text("Re-flip"),
                );

                ui.add_space(4.0);
                ui.label("Steering:");
                let is_nudge = matches!(params.steering, SteeringLaw::Nudge { .. });
                ui.horizontal(|ui| {
                    if ui.selectable_label(is_nudge, "Nudge").clicked() && !is_nudge {
                        params.steering = SteeringLaw::Nudge {
                            factor: 10.0,
                            jitter: 0.0,
                        };
                    }
                    if ui.selectable_label(!is_nudge, "Smoothing").clicked() && is_nudge {
                        params.steering = SteeringLaw::Smoothing { factor: 0.03 };
                    }
                });
                match &mut params.steering {
                    SteeringLaw::Nudge { factor, jitter } => {
                        ui.add(egui::Slider::new(factor, 1.0..=30.0).text("Step"));
                        ui.add(egui::Slider::new(jitter, 0.0..=4.0).text("Jitter"));
                    }
                    SteeringLaw::Smoothing { factor } => {
                        ui.add(egui::Slider::new(factor, 0.005..=0.1).text("Factor"));
                    }
                }
            });
        });

        // Apply UI actions
        *self.swarm.params_mut() = params;
        if toggle {
            self.toggle_capture();
        }
        if let Some(index) = connect_index {
            self.start_capture(index);
        }
        if let Some(model) = new_model {
            self.select_model(model);
        }

        self.egui_state
            .handle_platform_output(&self.window, full_output.platform_output);

        let paint_jobs = self
            .egui_ctx
            .tessellate(full_output.shapes, full_output.pixels_per_point);

        for (id, image_delta) in &full_output.textures_delta.set {
            self.egui_renderer
                .update_texture(&self.device, &self.queue, *id, image_delta);
        }

        let screen_descriptor = egui_wgpu::ScreenDescriptor {
            size_in_pixels: [self.config.width, self.config.height],
            pixels_per_point: self.window.scale_factor() as f32,
        };

        self.egui_renderer.update_buffers(
            &self.device,
            &self.queue,
            encoder,
            &paint_jobs,
            &screen_descriptor,
        );

        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("egui Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            let render_pass_static: &mut wgpu::RenderPass<'static> =
                unsafe { std::mem::transmute(&mut render_pass) };

            self.egui_renderer
                .render(render_pass_static, &paint_jobs, &screen_descriptor);
        }

        for id in &full_output.textures_delta.free {
            self.egui_renderer.free_texture(id);
        }
    }

    fn update_fps(&mut self) {
        self.frames_since_update += 1;

        let now = Instant::now();
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f64();
        if elapsed >= 1.0 {
            self.fps = self.frames_since_update as f64 / elapsed;
            self.frames_since_update = 0;
            self.last_fps_update = now;
        }
    }
}
