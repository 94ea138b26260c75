//! Render target requests
//!
//! The scheduler decides atlas sizes; creating the textures is up to the
//! backend behind [`RenderTargetProvider`]. [`RenderTargetPool`] is a
//! bookkeeping provider for tools and tests.

use parking_lot::Mutex;

use crate::shadow::RenderTargetHandle;

/// Pixel layout of a shadow target
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DepthFormat {
    /// Single depth channel
    ShadowDepth,
    /// Depth plus the two translucency volume layers
    TranslucencyVolume,
    /// Depth, normal and flux for indirect lighting
    ReflectiveShadowMap,
}

impl DepthFormat {
    pub fn bytes_per_texel(self) -> u64 {
        match self {
            Self::ShadowDepth => 4,
            Self::TranslucencyVolume => 16,
            Self::ReflectiveShadowMap => 12,
        }
    }
}

/// Size and format of a requested target
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RenderTargetDesc {
    pub width: u32,
    pub height: u32,
    pub format: DepthFormat,
    /// Six square faces of `width`
    pub cube: bool,
}

impl RenderTargetDesc {
    pub fn depth(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            format: DepthFormat::ShadowDepth,
            cube: false,
        }
    }

    pub fn cube(size: u32) -> Self {
        Self {
            width: size,
            height: size,
            format: DepthFormat::ShadowDepth,
            cube: true,
        }
    }

    pub fn with_format(mut self, format: DepthFormat) -> Self {
        self.format = format;
        self
    }

    /// Memory the target occupies
    pub fn memory_size(&self) -> u64 {
        let faces = if self.cube { 6 } else { 1 };
        self.width as u64 * self.height as u64 * self.format.bytes_per_texel() * faces
    }
}

/// Creates the textures shadow maps are rendered into
pub trait RenderTargetProvider: Send + Sync {
    /// Create a target; `name` is a debug label
    fn allocate(&self, desc: &RenderTargetDesc, name: &str) -> RenderTargetHandle;
}

/// A target handed out by [`RenderTargetPool`]
#[derive(Clone, Debug, PartialEq)]
pub struct PooledTarget {
    pub handle: RenderTargetHandle,
    pub desc: RenderTargetDesc,
    pub name: String,
}

#[derive(Default)]
struct PoolState {
    next_handle: u64,
    targets: Vec<PooledTarget>,
    allocated_bytes: u64,
}

/// Provider that hands out increasing handles and records every request
#[derive(Default)]
pub struct RenderTargetPool {
    state: Mutex<PoolState>,
}

impl RenderTargetPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes of every target handed out since the last reset
    pub fn allocated_bytes(&self) -> u64 {
        self.state.lock().allocated_bytes
    }

    pub fn target_count(&self) -> usize {
        self.state.lock().targets.len()
    }

    /// Snapshot of the handed-out targets
    pub fn targets(&self) -> Vec<PooledTarget> {
        self.state.lock().targets.clone()
    }

    pub fn find(&self, handle: RenderTargetHandle) -> Option<PooledTarget> {
        self.state
            .lock()
            .targets
            .iter()
            .find(|target| target.handle == handle)
            .cloned()
    }

    /// Forget all targets; handles keep increasing
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.targets.clear();
        state.allocated_bytes = 0;
    }
}

impl RenderTargetProvider for RenderTargetPool {
    fn allocate(&self, desc: &RenderTargetDesc, name: &str) -> RenderTargetHandle {
        let mut state = self.state.lock();
        state.next_handle += 1;
        let handle = RenderTargetHandle(state.next_handle);
        state.allocated_bytes += desc.memory_size();
        state.targets.push(PooledTarget {
            handle,
            desc: *desc,
            name: name.to_owned(),
        });
        log::trace!("Allocated shadow target {name} {}x{} as {handle:?}", desc.width, desc.height);
        handle
    }
}
