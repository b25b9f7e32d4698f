// =============================================================================
// GPU-CORE DEMO - Bootstrap, upload, present
// =============================================================================
//
// Drives the library the way a renderer would:
// 1. Bootstrap device, VRAM and swapchain from a winit window
// 2. Upload a texture on the transfer thread and wait for it
// 3. Per frame: acquire, clear, submit, present, tick deferred destruction
// 4. Rebuild the swapchain whenever it reports paused/out of date/suboptimal
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use glam::UVec2;
use gpu_core::backend::sync::FrameSync;
use gpu_core::backend::{
    Bootstrap, QueueRole, SwapchainFlags, Texture, TextureCreateInfo, TextureData,
};
use gpu_core::config::Config;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};
use std::ffi::CStr;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

const TEXTURE_SIZE: u32 = 256;

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    // Initialize logging
    init_logging(&config);
    log::info!("Starting gpu-core demo");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("Present modes: {:?}", config.graphics.present_modes);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Initialize logging with optional file output for validation errors
fn init_logging(config: &Config) {
    use env_logger::Builder;
    use log::LevelFilter;

    let mut builder = Builder::from_default_env();
    builder.filter_level(LevelFilter::Info);
    builder.init();

    // Create/clear log file if enabled
    if config.debug.log_to_file {
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            let _ = writeln!(file, "=== gpu-core Log ===");
            let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
            let _ = writeln!(file);
        }
    }
}

// =============================================================================
// SURFACE
// =============================================================================

/// Instance extensions needed to create a surface for `display`
fn surface_extensions(display: RawDisplayHandle) -> Result<Vec<&'static CStr>> {
    use ash::extensions::khr;

    Ok(match display {
        RawDisplayHandle::Windows(_) => vec![khr::Win32Surface::name()],
        RawDisplayHandle::Xlib(_) => vec![khr::XlibSurface::name()],
        RawDisplayHandle::Wayland(_) => vec![khr::WaylandSurface::name()],
        other => anyhow::bail!("Unsupported display handle {:?}", other),
    })
}

/// Platform-specific window connection
fn create_surface(
    entry: &ash::Entry,
    instance: &ash::Instance,
    window: &Window,
) -> Result<vk::SurfaceKHR> {
    use ash::extensions::khr;

    let window_handle = window.window_handle().context("Failed to get window handle")?.as_raw();
    let display_handle = window.display_handle().context("Failed to get display handle")?.as_raw();

    let surface = unsafe {
        match (display_handle, window_handle) {
            (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(handle)) => {
                let hinstance =
                    handle.hinstance.map(|h| h.get()).unwrap_or(0) as *const std::ffi::c_void;
                let hwnd = handle.hwnd.get() as *const std::ffi::c_void;
                let create_info =
                    vk::Win32SurfaceCreateInfoKHR::builder().hinstance(hinstance).hwnd(hwnd);
                khr::Win32Surface::new(entry, instance).create_win32_surface(&create_info, None)?
            }
            (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(handle)) => {
                let dpy = display.display.context("Xlib display handle is null")?;
                let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                    .dpy(dpy.as_ptr().cast())
                    .window(handle.window);
                khr::XlibSurface::new(entry, instance).create_xlib_surface(&create_info, None)?
            }
            (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(handle)) => {
                let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                    .display(display.display.as_ptr())
                    .surface(handle.surface.as_ptr());
                khr::WaylandSurface::new(entry, instance)
                    .create_wayland_surface(&create_info, None)?
            }
            _ => anyhow::bail!("Unsupported window handle type"),
        }
    };

    Ok(surface)
}

fn framebuffer_size(window: &Window) -> UVec2 {
    let size = window.inner_size();
    UVec2::new(size.width, size.height)
}

/// 256x256 RGBA checkerboard
fn checker_pixels() -> Vec<u8> {
    let mut pixels = Vec::with_capacity((TEXTURE_SIZE * TEXTURE_SIZE * 4) as usize);
    for y in 0..TEXTURE_SIZE {
        for x in 0..TEXTURE_SIZE {
            let on = ((x / 32) + (y / 32)) % 2 == 0;
            let texel = if on { [0xff, 0xff, 0xff, 0xff] } else { [0x20, 0x20, 0x20, 0xff] };
            pixels.extend_from_slice(&texel);
        }
    }
    pixels
}

// =============================================================================
// RENDERER
// =============================================================================

/// Per-frame-in-flight state
struct Frame {
    sync: FrameSync,
    commands: vk::CommandBuffer,
}

/// IMPORTANT: Field order matters for Drop! The texture defers its
/// destruction, so it must go before the bootstrap flushes.
struct Renderer {
    frames: Vec<Frame>,
    command_pool: vk::CommandPool,
    texture: Texture,
    boot: Bootstrap,
    current_frame: usize,
    clear_color: [f32; 4],
    needs_resize: bool,
}

impl Renderer {
    fn new(config: &Config, window: &Arc<Window>) -> Result<Self> {
        log::info!("Initializing Vulkan...");

        // Step 1: Device, VRAM and swapchain
        let display = window.display_handle().context("Failed to get display handle")?.as_raw();
        let mut info = config.bootstrap_info();
        info.device.surface_extensions = surface_extensions(display)?;
        let surface_window = window.clone();
        let boot = Bootstrap::new(
            &info,
            move |entry, instance| create_surface(entry, instance, &surface_window),
            framebuffer_size(window),
        )?;

        // Step 2: Texture upload on the transfer thread
        let mut texture = Texture::new("demo/checker", boot.vram.clone());
        texture.construct(&TextureCreateInfo::new(TextureData::Raw {
            bytes: checker_pixels(),
            size: UVec2::splat(TEXTURE_SIZE),
        }))?;
        let start = Instant::now();
        if !texture.wait() {
            anyhow::bail!("Texture upload failed");
        }
        log::info!(
            "Texture [{}] uploaded in {:.2}ms",
            texture.name(),
            start.elapsed().as_secs_f32() * 1000.0
        );

        // Step 3: Command buffers and sync objects, one per frame in flight
        let vulkan = &boot.gpu;
        let command_pool = vulkan.create_command_pool(QueueRole::Graphics)?;
        let count = config.graphics.frames_in_flight.max(1);
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count as u32);
        let command_buffers = unsafe { vulkan.device.allocate_command_buffers(&alloc_info)? };
        let frames = command_buffers
            .into_iter()
            .map(|commands| Ok(Frame { sync: FrameSync::new(vulkan)?, commands }))
            .collect::<Result<Vec<_>>>()?;

        log::info!("Vulkan initialized successfully!");
        Ok(Self {
            frames,
            command_pool,
            texture,
            boot,
            current_frame: 0,
            clear_color: config.graphics.clear_color,
            needs_resize: false,
        })
    }

    /// Record a full-image clear, leaving the image ready to present
    fn record_clear(&self, commands: vk::CommandBuffer, image: vk::Image) -> Result<()> {
        let device = &self.boot.gpu.device;
        let clear_color = vk::ClearColorValue { float32: self.clear_color };

        // Which parts of the image to affect (all of it)
        let subresource_range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };

        unsafe {
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device.begin_command_buffer(commands, &begin_info)?;

            // UNDEFINED -> TRANSFER_DST (old contents discarded)
            let barrier_to_transfer = vk::ImageMemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(subresource_range)
                .build();
            device.cmd_pipeline_barrier(
                commands,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier_to_transfer],
            );

            device.cmd_clear_color_image(
                commands,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &clear_color,
                &[subresource_range],
            );

            // TRANSFER_DST -> PRESENT_SRC
            let barrier_to_present = vk::ImageMemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::empty())
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(subresource_range)
                .build();
            device.cmd_pipeline_barrier(
                commands,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier_to_present],
            );

            device.end_command_buffer(commands)?;
        }
        Ok(())
    }

    /// Render a single frame. Ok(false) when nothing was presented.
    ///
    /// FRAME TIMELINE:
    /// wait slot fence -> acquire -> record -> submit -> present -> tick deferred
    fn render_frame(&mut self, window: &Window) -> Result<bool> {
        let blocking =
            SwapchainFlags::PAUSED | SwapchainFlags::OUT_OF_DATE | SwapchainFlags::SUBOPTIMAL;
        if self.needs_resize || self.boot.swapchain.flags().intersects(blocking) {
            if !self.boot.swapchain.reconstruct(framebuffer_size(window), &[]) {
                // Minimized; try again on the next resize
                return Ok(false);
            }
            self.needs_resize = false;
        }

        let frame = &self.frames[self.current_frame];
        let (image_available, render_finished, fence) =
            (frame.sync.image_available, frame.sync.render_finished, frame.sync.in_flight_fence);
        let commands = frame.commands;

        // Step 1: Wait for the previous frame using this slot
        self.boot.device.wait_for(fence);

        // Step 2: Acquire next swapchain image
        let Some(target) = self.boot.swapchain.acquire_next_image(image_available) else {
            return Ok(false);
        };

        // Step 3: Record and submit
        self.boot.gpu.reset_fence(fence)?;
        self.record_clear(commands, target.colour.image)?;

        let wait_semaphores = [image_available];
        let wait_stages = [vk::PipelineStageFlags::TRANSFER];
        let signal_semaphores = [render_finished];
        let command_buffers = [commands];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();
        self.boot.gpu.submit(QueueRole::Graphics, &[submit_info], fence)?;

        // Step 4: Present the image
        let presented = self.boot.swapchain.present(render_finished, fence);

        // Step 5: Advance to next frame
        self.boot.device.decrement_deferred();
        self.current_frame = (self.current_frame + 1) % self.frames.len();

        Ok(presented)
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");

        // Wait for GPU to finish before destroying anything
        self.boot.device.wait_idle();

        let device = &self.boot.gpu.device;
        for frame in &self.frames {
            frame.sync.destroy(device);
        }
        // Also frees command buffers
        unsafe { device.destroy_command_pool(self.command_pool, None) };
        self.texture.destroy();
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

struct App {
    config: Config,
    window: Option<Arc<Window>>,
    renderer: Option<Renderer>,
    is_fullscreen: bool,

    // FPS tracking
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let now = Instant::now();
        Self {
            config,
            window: None,
            renderer: None,
            is_fullscreen,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }

            if let Some(ref mut renderer) = self.renderer {
                renderer.needs_resize = true;
            }
        }
    }

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        if now.duration_since(self.last_fps_update).as_secs_f32() >= 1.0 {
            let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
            let fps = self.frame_count as f32 / elapsed;

            if let (Some(window), Some(renderer)) = (&self.window, &self.renderer) {
                let swapchain = &renderer.boot.swapchain;
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms) [{}] [{} images]",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                    gpu_core::backend::swapchain::present_mode_name(swapchain.present_mode()),
                    swapchain.image_count()
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes =
                window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        match Renderer::new(&self.config, &window) {
            Ok(renderer) => self.renderer = Some(renderer),
            Err(e) => {
                log::error!("Failed to initialize Vulkan: {:?}", e);
                event_loop.exit();
                return;
            }
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                // Renderer before window: the surface belongs to the window
                self.renderer = None;
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(ref mut renderer) = self.renderer {
                    renderer.needs_resize = true;
                }
            }

            WindowEvent::RedrawRequested => {
                let (Some(window), Some(renderer)) = (self.window.clone(), self.renderer.as_mut())
                else {
                    return;
                };
                match renderer.render_frame(&window) {
                    Ok(true) => self.update_fps(),
                    Ok(false) => {}
                    Err(e) => log::error!("Render error: {:?}", e),
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                self.renderer = None;
                                event_loop.exit();
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

impl Drop for App {
    fn drop(&mut self) {
        self.renderer = None;
        log::info!("Cleanup complete");
    }
}
