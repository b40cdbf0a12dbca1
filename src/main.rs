//! D3D12 沙盒
//!
//! 在窗口中绘制同一个模型的多个实例，所有实例共享一份 GPU 几何数据。
//!
//! ```bash
//! # 使用配置文件
//! cargo run
//!
//! # 不创建窗口，在无头设备上跑 10 帧
//! cargo run -- --headless --frames 10
//! ```
//!
//! # 命令行参数
//!
//! - `--dx12` / `--headless`：选择设备实现
//! - `--bundles`：把每个模型的绘制预录制为 bundle
//! - `--width <value>` / `--height <value>`：窗口尺寸
//! - `--frames <n>`：渲染 n 帧后退出

use anyhow::Context;
use tracing::info;

use d3d12_sandbox::core::config::GraphicsBackend;
use d3d12_sandbox::core::{log, Config, SceneConfig};
use d3d12_sandbox::gfx::headless::HeadlessBackend;
use d3d12_sandbox::renderer::device::Device;
use d3d12_sandbox::renderer::Renderer;

/// 无头模式下未指定帧数时渲染的帧数
const HEADLESS_DEFAULT_FRAMES: u64 = 60;

fn main() -> anyhow::Result<()> {
    let mut config = Config::from_file_or_default("config.toml");
    config.apply_args(std::env::args());
    config.validate().context("Invalid configuration")?;

    let log_file = config
        .logging
        .file_output
        .then_some(config.logging.log_file.as_str());
    log::init_logger(config.logging.level, config.logging.file_output, log_file)
        .context("Failed to initialize logger")?;
    d3d12_sandbox::app_info!(version = env!("CARGO_PKG_VERSION"), "D3D12 sandbox starting");

    let scene = SceneConfig::from_file_or_default("scene.toml");
    info!(
        backend = config.graphics.backend.name(),
        width = config.window.width,
        height = config.window.height,
        instances = scene.model.instance_transforms().len(),
        bundles = config.graphics.use_bundles,
        "Configuration loaded"
    );

    match config.graphics.backend {
        GraphicsBackend::Headless => run_headless(&config, &scene),
        GraphicsBackend::Dx12 => run_windowed(config, scene),
    }
}

fn run_headless(config: &Config, scene: &SceneConfig) -> anyhow::Result<()> {
    let device = Device::new(Box::new(HeadlessBackend::new(config.window.width, config.window.height)));
    let mut renderer = Renderer::new(device, config, scene).context("Failed to initialize renderer")?;

    let frames = match config.graphics.frame_limit {
        0 => HEADLESS_DEFAULT_FRAMES,
        n => n,
    };
    for _ in 0..frames {
        renderer.render_frame().context("Frame failed")?;
    }

    let stats = renderer.device().stats();
    info!(
        frames = renderer.frame_count(),
        draw_calls = stats.draw_calls,
        presents = stats.presents,
        "Headless run finished"
    );
    Ok(())
}

#[cfg(target_os = "windows")]
fn run_windowed(config: Config, scene: SceneConfig) -> anyhow::Result<()> {
    use d3d12_sandbox::gfx::dx12::Dx12Backend;
    use tracing::error;
    use winit::dpi::PhysicalSize;
    use winit::event::{Event, WindowEvent};
    use winit::event_loop::{ControlFlow, EventLoop};
    use winit::window::WindowBuilder;

    let event_loop = EventLoop::new().context("Failed to create event loop")?;
    let window = WindowBuilder::new()
        .with_title(config.window.title.as_str())
        .with_inner_size(PhysicalSize::new(config.window.width, config.window.height))
        .with_resizable(config.window.resizable)
        .build(&event_loop)
        .context("Failed to create window")?;

    let backend = Dx12Backend::new(&window).context("Failed to create DX12 device")?;
    let mut renderer =
        Renderer::new(Device::new(Box::new(backend)), &config, &scene).context("Failed to initialize renderer")?;
    let frame_limit = config.graphics.frame_limit;

    info!("Entering main loop");
    event_loop.set_control_flow(ControlFlow::Poll);
    event_loop
        .run(move |event, elwt| match event {
            Event::WindowEvent { event, .. } => match event {
                WindowEvent::CloseRequested => {
                    info!("Close requested, shutting down");
                    elwt.exit();
                }
                WindowEvent::Resized(size) => {
                    if let Err(e) = renderer.resize(size.width, size.height) {
                        error!(error = %e, "Resize failed");
                        elwt.exit();
                    }
                }
                WindowEvent::RedrawRequested => {
                    if let Err(e) = renderer.render_frame() {
                        error!(error = %e, "Frame failed");
                        elwt.exit();
                    } else if frame_limit > 0 && renderer.frame_count() >= frame_limit {
                        info!(frames = renderer.frame_count(), "Frame limit reached");
                        elwt.exit();
                    }
                }
                _ => (),
            },
            Event::AboutToWait => window.request_redraw(),
            _ => (),
        })
        .context("Event loop failed")?;
    Ok(())
}

#[cfg(not(target_os = "windows"))]
fn run_windowed(_config: Config, _scene: SceneConfig) -> anyhow::Result<()> {
    anyhow::bail!("DirectX 12 is only available on Windows, use --headless")
}
