use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context as AnyhowContext, Result};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use serde::{Deserialize, Serialize};

/// Adapter preference when several GPUs are available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuPower {
    #[default]
    Low,
    High,
}

/// Device and presentation settings shared by every surface of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuOptions {
    pub power: GpuPower,
    pub vsync: bool,
    /// Desired swapchain depth, clamped to `1..=3`.
    pub frame_latency: u32,
}

impl Default for GpuOptions {
    fn default() -> Self {
        Self {
            power: GpuPower::Low,
            vsync: true,
            frame_latency: 2,
        }
    }
}

/// wgpu instance, device and (optionally) the window surface it presents to.
pub(crate) struct DeviceContext {
    _instance: wgpu::Instance,
    pub surface: Option<wgpu::Surface<'static>>,
    pub config: Option<wgpu::SurfaceConfiguration>,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter_name: String,
    lost: Arc<AtomicBool>,
}

impl DeviceContext {
    pub(crate) fn new<T>(target: &T, size: (u32, u32), options: &GpuOptions) -> Result<Self>
    where
        T: HasDisplayHandle + HasWindowHandle,
    {
        let instance = new_instance();

        let window_handle = target
            .window_handle()
            .map_err(|err| anyhow!("failed to acquire window handle: {err}"))?;
        let display_handle = target
            .display_handle()
            .map_err(|err| anyhow!("failed to acquire display handle: {err}"))?;

        // The caller keeps the window alive for as long as the context exists.
        let surface = unsafe {
            instance.create_surface_unsafe(wgpu::SurfaceTargetUnsafe::RawHandle {
                raw_display_handle: display_handle.as_raw(),
                raw_window_handle: window_handle.as_raw(),
            })
        }
        .context("failed to create rendering surface")?;

        let adapter = request_adapter(&instance, Some(&surface), options)?;
        let (width, height) = check_size(&adapter, size)?;
        let (device, queue, lost) = request_device(&adapter, "duoshade surface device")?;

        let surface_caps = surface.get_capabilities(&adapter);
        let format = surface_caps
            .formats
            .iter()
            .copied()
            .find(|format| !format.is_srgb())
            .or_else(|| surface_caps.formats.first().copied())
            .context("surface reports no supported formats")?;
        let present_mode = select_present_mode(&surface_caps, options.vsync);
        let alpha_mode = surface_caps
            .alpha_modes
            .first()
            .copied()
            .unwrap_or(wgpu::CompositeAlphaMode::Auto);

        let desired_maximum_frame_latency = options.frame_latency.clamp(1, 3);
        if desired_maximum_frame_latency != options.frame_latency {
            tracing::warn!(
                requested = options.frame_latency,
                clamped = desired_maximum_frame_latency,
                "GPU frame latency clamped to valid range (1-3)"
            );
        }
        tracing::debug!(?format, ?present_mode, "configuring surface");

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width,
            height,
            present_mode,
            alpha_mode,
            view_formats: vec![],
            desired_maximum_frame_latency,
        };
        surface.configure(&device, &config);

        Ok(Self {
            _instance: instance,
            surface: Some(surface),
            config: Some(config),
            device,
            queue,
            adapter_name: adapter.get_info().name,
            lost,
        })
    }

    /// Device without a presentation surface; frames are only read back.
    pub(crate) fn headless(options: &GpuOptions) -> Result<Self> {
        let instance = new_instance();
        let adapter = request_adapter(&instance, None, options)?;
        let (device, queue, lost) = request_device(&adapter, "duoshade headless device")?;
        Ok(Self {
            _instance: instance,
            surface: None,
            config: None,
            device,
            queue,
            adapter_name: adapter.get_info().name,
            lost,
        })
    }

    pub(crate) fn surface_format(&self) -> Option<wgpu::TextureFormat> {
        self.config.as_ref().map(|config| config.format)
    }

    pub(crate) fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        if let (Some(surface), Some(config)) = (&self.surface, &mut self.config) {
            config.width = width;
            config.height = height;
            surface.configure(&self.device, config);
        }
    }

    /// Re-applies the current configuration after the swapchain went stale.
    pub(crate) fn reconfigure(&self) {
        if let (Some(surface), Some(config)) = (&self.surface, &self.config) {
            surface.configure(&self.device, config);
        }
    }

    pub(crate) fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_lost(&self) {
        self.lost.store(true, Ordering::SeqCst);
    }
}

fn new_instance() -> wgpu::Instance {
    wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        flags: wgpu::InstanceFlags::default(),
        memory_budget_thresholds: wgpu::MemoryBudgetThresholds::default(),
        backend_options: wgpu::BackendOptions::default(),
    })
}

fn request_adapter(
    instance: &wgpu::Instance,
    surface: Option<&wgpu::Surface<'static>>,
    options: &GpuOptions,
) -> Result<wgpu::Adapter> {
    let power_preference = match options.power {
        GpuPower::Low => wgpu::PowerPreference::LowPower,
        GpuPower::High => wgpu::PowerPreference::HighPerformance,
    };
    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference,
        compatible_surface: surface,
        force_fallback_adapter: false,
    }))
    .context("failed to find a suitable GPU adapter")?;

    let info = adapter.get_info();
    tracing::debug!(
        name = %info.name,
        backend = ?info.backend,
        device_type = ?info.device_type,
        "selected GPU adapter"
    );
    Ok(adapter)
}

fn check_size(adapter: &wgpu::Adapter, size: (u32, u32)) -> Result<(u32, u32)> {
    let max_dimension = adapter.limits().max_texture_dimension_2d;
    let width = size.0.max(1);
    let height = size.1.max(1);
    if width > max_dimension || height > max_dimension {
        anyhow::bail!(
            "GPU max texture dimension is {max_dimension}, requested surface is {width}x{height}"
        );
    }
    Ok((width, height))
}

fn request_device(
    adapter: &wgpu::Adapter,
    label: &str,
) -> Result<(wgpu::Device, wgpu::Queue, Arc<AtomicBool>)> {
    let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
        label: Some(label),
        required_features: wgpu::Features::empty(),
        required_limits: adapter.limits(),
        memory_hints: wgpu::MemoryHints::MemoryUsage,
        trace: wgpu::Trace::default(),
    }))
    .context("failed to create GPU device")?;

    let lost = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&lost);
    device.set_device_lost_callback(move |reason, message| {
        flag.store(true, Ordering::SeqCst);
        tracing::error!(?reason, %message, "GPU device lost");
    });
    device.on_uncaptured_error(Box::new(|error| {
        tracing::error!(%error, "uncaptured GPU error");
    }));

    Ok((device, queue, lost))
}

fn select_present_mode(caps: &wgpu::SurfaceCapabilities, vsync: bool) -> wgpu::PresentMode {
    let find = |wanted: wgpu::PresentMode| caps.present_modes.iter().copied().find(|mode| *mode == wanted);
    let fifo = find(wgpu::PresentMode::Fifo).unwrap_or(wgpu::PresentMode::Fifo);
    if vsync {
        return fifo;
    }
    find(wgpu::PresentMode::Immediate)
        .or_else(|| find(wgpu::PresentMode::Mailbox))
        .unwrap_or(fifo)
}
