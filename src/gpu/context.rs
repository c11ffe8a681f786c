//! wgpu device/queue/surface plumbing for the present layer.

use crate::error::RenderError;
use crate::settings::{GraphicsApi, TargetSettings};

/// The injected graphics device state. The host creates the surface
/// (window plumbing is out of the renderer's scope) and hands it over;
/// everything else is derived here.
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub surface: wgpu::Surface<'static>,
    pub config: wgpu::SurfaceConfiguration,
}

impl GpuContext {
    /// Create a wgpu instance honoring the backend preference.
    pub fn create_instance(target: &TargetSettings) -> wgpu::Instance {
        let backends = match target.graphics_api {
            GraphicsApi::Automatic | GraphicsApi::SoftwareOnly => wgpu::Backends::all(),
            GraphicsApi::Vulkan => wgpu::Backends::VULKAN,
            GraphicsApi::Metal => wgpu::Backends::METAL,
            GraphicsApi::Dx12 => wgpu::Backends::DX12,
        };
        wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends,
            ..Default::default()
        })
    }

    /// Acquire an adapter and device for the given surface and configure
    /// it. `hardware_acceleration == false` forces the fallback
    /// (software) adapter.
    pub fn new(
        instance: &wgpu::Instance,
        surface: wgpu::Surface<'static>,
        width: u32,
        height: u32,
        target: &TargetSettings,
    ) -> Result<Self, RenderError> {
        let force_fallback = !target.hardware_acceleration
            || target.graphics_api == GraphicsApi::SoftwareOnly;

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::default(),
            compatible_surface: Some(&surface),
            force_fallback_adapter: force_fallback,
        }))
        .map_err(|e| {
            log::warn!("no suitable GPU adapter: {e}");
            RenderError::DeviceLost
        })?;

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("term_atlas device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            ..Default::default()
        }))
        .map_err(|e| {
            log::warn!("device creation failed: {e}");
            RenderError::DeviceLost
        })?;

        let caps = surface.get_capabilities(&adapter);
        let format = caps
            .formats
            .iter()
            .copied()
            .find(|f| !f.is_srgb())
            .unwrap_or(caps.formats[0]);

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: width.max(1),
            height: height.max(1),
            present_mode: wgpu::PresentMode::AutoVsync,
            alpha_mode: caps.alpha_modes[0],
            view_formats: vec![],
            // One in-flight frame: the producer paces us, not the queue.
            desired_maximum_frame_latency: 1,
        };
        surface.configure(&device, &config);

        Ok(Self { device, queue, surface, config })
    }

    /// Resize the swap chain.
    pub fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        if self.config.width == width && self.config.height == height {
            return;
        }
        self.config.width = width;
        self.config.height = height;
        self.surface.configure(&self.device, &self.config);
    }

    /// Re-apply the current configuration after a lost surface.
    pub fn reconfigure(&self) {
        self.surface.configure(&self.device, &self.config);
    }
}
