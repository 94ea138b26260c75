//! # void_shadow - Dynamic Shadow Scheduling
//!
//! Decides every frame which shadow maps a scene needs, which primitives
//! each of them draws, and where each map lives in the shadow atlases.
//!
//! # Architecture
//!
//! The crate is split into:
//!
//! - **Scene**: Primitives, lights, views and light interactions
//! - **Resolution**: Screen-size driven map resolution and fading
//! - **Projection**: Shadow matrices and caster/receiver volumes
//! - **Gather**: Parallel culling of casters into each shadow
//! - **Cache**: Whole-scene static layers and the preshadow cache
//! - **Atlas**: Packing maps into render targets
//! - **Renderer**: The per-frame pipeline tying the stages together
//!
//! # Usage
//!
//! ```ignore
//! use void_shadow::*;
//!
//! let mut scene = Scene::new();
//! scene.add_primitive(PrimitiveSceneInfo::new(bounds));
//! scene.add_light(LightSceneInfo::new(LightId(0), LightShape::Point { radius: 1000.0 }, position));
//! scene.rebuild_spatial_index();
//!
//! let mut renderer = ShadowRenderer::new(ShadowConfig::default());
//! let mut cache = SceneShadowCacheState::new();
//! let pool = RenderTargetPool::new();
//!
//! // Once per frame
//! let frame = renderer.init_dynamic_shadows(&scene, &views, &mut cache, &pool, real_time)?;
//! for (id, shadow) in frame.shadows_needing_render() {
//!     // Draw shadow.cached_draw_commands and shadow.dynamic_subject_primitives
//! }
//! ```
//!
//! # Hot-Reload Support
//!
//! `ShadowConfig` and the frame statistics support serde serialization.
//! A reloaded configuration takes effect on the next frame through
//! [`ShadowRenderer::set_config`]; cached maps invalidate themselves when
//! their projection no longer matches.

pub mod atlas;
pub mod cache;
pub mod cascade;
pub mod config;
pub mod error;
pub mod gather;
pub mod initializer;
pub mod layout;
pub mod light;
pub mod preshadow;
pub mod projection;
pub mod render_target;
pub mod renderer;
pub mod resolution;
pub mod scene;
pub mod shadow;
pub mod spatial;
pub mod view;

pub use atlas::{allocate_shadow_depth_targets, AtlasCategory, ShadowMapAtlas, SortedShadowMaps};
pub use cache::{CacheModeDecision, CacheUpdateQuota, CachedShadowMapData, SceneShadowCacheState};
pub use cascade::CascadeSettings;
pub use config::{FeatureLevel, ShadowConfig, ShadowQuality};
pub use error::{Result, ShadowError};
pub use gather::{gather_shadow_primitives, GatherStats, ViewRelevanceCache};
pub use initializer::{PerObjectShadowInitializer, ProjectedShadowInitializer, WholeSceneShadowInitializer};
pub use layout::TextureLayout;
pub use light::{LightId, LightKind, LightMobility, LightSceneInfo, LightShadowSettings, LightShape};
pub use preshadow::{get_cached_preshadow, update_preshadow_cache};
pub use render_target::{RenderTargetDesc, RenderTargetPool, RenderTargetProvider};
pub use renderer::{FrameShadowStats, LightShadows, ShadowFrame, ShadowRenderer};
pub use scene::{
    ComputeViewRelevance, PrimitiveFlags, PrimitiveId, PrimitiveMobility, PrimitiveSceneInfo, Scene, StaticMeshBatch,
    ViewRelevance,
};
pub use shadow::{CacheMode, ProjectedShadowInfo, RenderTargetHandle, ShadowId};
pub use view::{ShadowView, ViewId};
