//! Window management using GLFW
//!
//! Minimal window plumbing the renderer needs: a no-API window, the Vulkan
//! surface, framebuffer size queries, and event polling. The resize flag is
//! tracked here and consumed by the orchestrator's resize path.

use thiserror::Error;

/// Window management errors
#[derive(Error, Debug)]
pub enum WindowError {
    /// GLFW could not be initialized
    #[error("GLFW initialization failed")]
    InitializationFailed,

    /// Window creation failed
    #[error("window creation failed")]
    CreationFailed,

    /// Other GLFW error
    #[error("GLFW error: {0}")]
    Glfw(String),
}

/// Result type for window operations
pub type WindowResult<T> = Result<T, WindowError>;

/// GLFW window wrapper
pub struct Window {
    glfw: glfw::Glfw,
    window: glfw::PWindow,
    events: glfw::GlfwReceiver<(f64, glfw::WindowEvent)>,
    framebuffer_resized: bool,
    pending_keys: Vec<(glfw::Key, glfw::Action)>,
}

impl Window {
    /// Create a resizable window configured for Vulkan (no GL context).
    pub fn new(title: &str, width: u32, height: u32) -> WindowResult<Self> {
        let mut glfw =
            glfw::init(glfw::fail_on_errors).map_err(|_| WindowError::InitializationFailed)?;

        glfw.window_hint(glfw::WindowHint::ClientApi(glfw::ClientApiHint::NoApi));
        glfw.window_hint(glfw::WindowHint::Resizable(true));

        let (mut window, events) = glfw
            .create_window(width, height, title, glfw::WindowMode::Windowed)
            .ok_or(WindowError::CreationFailed)?;

        window.set_key_polling(true);
        window.set_close_polling(true);
        window.set_framebuffer_size_polling(true);

        Ok(Self {
            glfw,
            window,
            events,
            framebuffer_resized: false,
            pending_keys: Vec::new(),
        })
    }

    /// Whether the user asked to close the window.
    #[must_use]
    pub fn should_close(&self) -> bool {
        self.window.should_close()
    }

    /// Request the window to close.
    pub fn set_should_close(&mut self, should_close: bool) {
        self.window.set_should_close(should_close);
    }

    /// Poll window events; updates the resize flag.
    pub fn poll_events(&mut self) {
        self.glfw.poll_events();
        self.drain_internal();
    }

    /// Block until an event arrives. Used while the window is minimized so
    /// no frames are produced at zero size.
    pub fn wait_events(&mut self) {
        self.glfw.wait_events();
        self.drain_internal();
    }

    fn drain_internal(&mut self) {
        for (_, event) in glfw::flush_messages(&self.events) {
            match event {
                glfw::WindowEvent::FramebufferSize(_, _) => {
                    self.framebuffer_resized = true;
                }
                glfw::WindowEvent::Key(key, _, action, _) => {
                    self.pending_keys.push((key, action));
                }
                _ => {}
            }
        }
    }

    /// Consume the resize flag set by framebuffer-size events.
    pub fn take_resize_request(&mut self) -> bool {
        std::mem::take(&mut self.framebuffer_resized)
    }

    /// Consume key events received since the last call.
    pub fn take_key_events(&mut self) -> Vec<(glfw::Key, glfw::Action)> {
        std::mem::take(&mut self.pending_keys)
    }

    /// Current framebuffer size in pixels. (0, 0) while minimized.
    #[must_use]
    pub fn framebuffer_size(&self) -> (u32, u32) {
        let (width, height) = self.window.get_framebuffer_size();
        (width as u32, height as u32)
    }

    /// Required Vulkan instance extensions for surface creation.
    pub fn required_instance_extensions(&self) -> WindowResult<Vec<String>> {
        self.glfw
            .get_required_instance_extensions()
            .ok_or_else(|| WindowError::Glfw("failed to get required extensions".to_string()))
    }

    /// Create a Vulkan surface for this window.
    pub fn create_vulkan_surface(
        &mut self,
        instance: ash::vk::Instance,
    ) -> WindowResult<ash::vk::SurfaceKHR> {
        let mut surface = ash::vk::SurfaceKHR::null();
        let result = self
            .window
            .create_window_surface(instance, std::ptr::null(), &mut surface);

        if result == ash::vk::Result::SUCCESS {
            Ok(surface)
        } else {
            Err(WindowError::Glfw(format!(
                "failed to create Vulkan surface: {result:?}"
            )))
        }
    }
}
