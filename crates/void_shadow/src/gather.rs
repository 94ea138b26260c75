//! Shadow subject gathering
//!
//! Finds the casters of every shadow that needs a fresh render. The scene
//! is split into packets: BVH leaves that survive a node-level test, or
//! flat slices of the primitive array. Each packet is filtered against all
//! candidate shadows on a worker with packet-local output. The outputs are
//! merged on the calling thread in packet order.
//!
//! # Deferred relevance
//!
//! Adding a subject needs its view relevance. Relevance of primitives the
//! views draw is computed up front; anything else is computed lazily, and
//! that is not allowed on workers. Workers emit a deferred op instead, which
//! the merge resolves.
//!
//! The set of accepted (primitive, shadow) pairs does not depend on packet
//! sizes, the BVH or thread count.

use std::borrow::Cow;
use std::ops::{AddAssign, Range};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use void_math::{Vec3, AABB};

use crate::config::ShadowConfig;
use crate::light::LightSceneInfo;
use crate::projection::intersects_convex_hulls;
use crate::scene::{LightInteractions, PrimitiveId, PrimitiveSceneInfo, Scene, ViewRelevance};
use crate::shadow::{CacheMode, ProjectedShadowInfo, ShadowId};
use crate::view::ShadowView;

/// Mesh indices a primitive contributes to one shadow.
///
/// Up to two indices are stored inline; more spill to the heap.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CullResult {
    Inline(SmallVec<[u16; 2]>),
    Overflowed(Vec<u16>),
}

impl Default for CullResult {
    fn default() -> Self {
        Self::Inline(SmallVec::new())
    }
}

impl CullResult {
    pub const INLINE_CAPACITY: usize = 2;

    pub fn push(&mut self, index: u16) {
        match self {
            Self::Inline(inline) if inline.len() < Self::INLINE_CAPACITY => inline.push(index),
            Self::Inline(inline) => {
                let mut spilled = inline.to_vec();
                spilled.push(index);
                *self = Self::Overflowed(spilled);
            }
            Self::Overflowed(spilled) => spilled.push(index),
        }
    }

    pub fn as_slice(&self) -> &[u16] {
        match self {
            Self::Inline(inline) => inline.as_slice(),
            Self::Overflowed(spilled) => spilled.as_slice(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.as_slice().iter().copied()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn is_overflowed(&self) -> bool {
        matches!(self, Self::Overflowed(_))
    }
}

/// A primitive accepted as a caster of one shadow
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubjectPrimitiveOp {
    pub primitive: PrimitiveId,
    pub shadow: ShadowId,
    /// Goes to the dynamic subject list
    pub dynamic: bool,
    /// Translucent caster of a translucent shadow
    pub translucent: bool,
    pub cached_commands: CullResult,
    pub build_requests: CullResult,
    /// View relevance was missing; resolve on the calling thread
    pub deferred: bool,
}

impl SubjectPrimitiveOp {
    fn new(primitive: PrimitiveId, shadow: ShadowId) -> Self {
        Self {
            primitive,
            shadow,
            dynamic: false,
            translucent: false,
            cached_commands: CullResult::default(),
            build_requests: CullResult::default(),
            deferred: false,
        }
    }

    fn deferred(primitive: PrimitiveId, shadow: ShadowId) -> Self {
        Self {
            deferred: true,
            ..Self::new(primitive, shadow)
        }
    }
}

/// Counters of one gather
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatherStats {
    pub packets: usize,
    pub primitives_tested: usize,
    pub frustum_culled: usize,
    pub screen_culled: usize,
    pub subjects_added: usize,
    pub receivers_added: usize,
    pub deferred: usize,
}

impl AddAssign for GatherStats {
    fn add_assign(&mut self, other: Self) {
        self.packets += other.packets;
        self.primitives_tested += other.primitives_tested;
        self.frustum_culled += other.frustum_culled;
        self.screen_culled += other.screen_culled;
        self.subjects_added += other.subjects_added;
        self.receivers_added += other.receivers_added;
        self.deferred += other.deferred;
    }
}

/// View relevance per view and primitive, filled lazily
#[derive(Clone, Debug, Default)]
pub struct ViewRelevanceCache {
    per_view: Vec<Vec<Option<ViewRelevance>>>,
}

impl ViewRelevanceCache {
    pub fn new(view_count: usize, primitive_count: usize) -> Self {
        Self {
            per_view: vec![vec![None; primitive_count]; view_count],
        }
    }

    /// Cache holding the relevance of every primitive a view draws
    pub fn for_visible_primitives(scene: &Scene, views: &[ShadowView]) -> Self {
        let mut cache = Self::new(views.len(), scene.primitives().len());
        for (view_index, view) in views.iter().enumerate() {
            for primitive in scene.primitives() {
                if primitive.flags.render_in_main_pass && view.is_visible(&primitive.bounds) {
                    cache.per_view[view_index][primitive.id.index()] =
                        Some(scene.compute_view_relevance(primitive.id, view));
                }
            }
        }
        cache
    }

    #[inline]
    pub fn get(&self, view_index: usize, primitive: PrimitiveId) -> Option<ViewRelevance> {
        self.per_view.get(view_index)?.get(primitive.index()).copied().flatten()
    }

    pub fn get_or_compute(
        &mut self,
        scene: &Scene,
        views: &[ShadowView],
        view_index: usize,
        primitive: PrimitiveId,
    ) -> ViewRelevance {
        if let Some(relevance) = self.get(view_index, primitive) {
            return relevance;
        }
        let relevance = scene.compute_view_relevance(primitive, &views[view_index]);
        if let Some(slot) = self
            .per_view
            .get_mut(view_index)
            .and_then(|slots| slots.get_mut(primitive.index()))
        {
            *slot = Some(relevance);
        }
        relevance
    }

    /// Number of cached entries over all views
    pub fn computed_count(&self) -> usize {
        self.per_view.iter().flatten().filter(|slot| slot.is_some()).count()
    }
}

/// Whether any view draws `primitive` in its main pass
pub fn is_primitive_visible(primitive: &PrimitiveSceneInfo, views: &[ShadowView]) -> bool {
    primitive.flags.render_in_main_pass && views.iter().any(|view| view.is_visible(&primitive.bounds))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CandidateKind {
    Preshadow,
    ViewDependent,
    Interactions,
}

struct GatherCandidate<'a> {
    id: ShadowId,
    shadow: &'a ProjectedShadowInfo,
    light: &'a LightSceneInfo,
    kind: CandidateKind,
    view_index: Option<usize>,
}

impl GatherCandidate<'_> {
    /// Node-level test; passes whenever any box inside `center, extent`
    /// could pass the per-primitive volume tests
    fn may_touch_box(&self, center: Vec3, extent: Vec3) -> bool {
        let shadow = self.shadow;
        let translation = shadow.pre_shadow_translation;
        match self.kind {
            CandidateKind::Preshadow => {
                shadow.caster_frustum.intersect_box_translated(center, translation, extent)
                    || shadow.receiver_frustum.intersect_box_translated(center, translation, extent)
            }
            CandidateKind::ViewDependent => accurate_volume_test(shadow, center, extent),
            CandidateKind::Interactions => false,
        }
    }

    /// Light keeps casting from primitives its baked shadowing covers
    fn accepts_statically_lit(&self) -> bool {
        !self.light.has_static_lighting()
            || !self.light.precomputed_lighting_valid
            || self.light.shadow.use_csm_for_dynamic_objects
    }
}

fn accurate_volume_test(shadow: &ProjectedShadowInfo, origin: Vec3, extent: Vec3) -> bool {
    match &shadow.cascade_settings {
        Some(cascade) => cascade.shadow_bounds_accurate.intersect_box(origin, extent),
        None => shadow
            .caster_frustum
            .intersect_box_translated(origin, shadow.pre_shadow_translation, extent),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PacketSource {
    /// A slice of the scene, tested against every scene candidate
    Scene,
    /// Interaction list of one local light shadow
    Interactions(usize),
}

/// Primitives filtered together on one worker
pub struct GatherPacket<'a> {
    pub primitives: Cow<'a, [PrimitiveId]>,
    source: PacketSource,
    pub ops: Vec<SubjectPrimitiveOp>,
    pub receiver_ops: Vec<(ShadowId, PrimitiveId)>,
    pub stats: GatherStats,
}

impl<'a> GatherPacket<'a> {
    fn new(primitives: Cow<'a, [PrimitiveId]>, source: PacketSource) -> Self {
        Self {
            primitives,
            source,
            ops: Vec::new(),
            receiver_ops: Vec::new(),
            stats: GatherStats {
                packets: 1,
                ..Default::default()
            },
        }
    }

    fn run(&mut self, ctx: &GatherContext<'_>) {
        let Self {
            primitives,
            source,
            ops,
            receiver_ops,
            stats,
        } = self;

        for &id in primitives.iter() {
            let primitive = ctx.scene.primitive(id);
            match *source {
                PacketSource::Scene => filter_primitive(ctx, primitive, ops, receiver_ops, stats),
                PacketSource::Interactions(candidate) => {
                    filter_interaction(ctx, &ctx.candidates[candidate], primitive, ops, stats)
                }
            }
        }

        log::trace!(
            "Gather packet of {} primitives: {} subjects, {} frustum culled, {} screen culled, {} deferred",
            primitives.len(),
            stats.subjects_added,
            stats.frustum_culled,
            stats.screen_culled,
            stats.deferred
        );
    }
}

struct GatherContext<'a> {
    scene: &'a Scene,
    views: &'a [ShadowView],
    relevance: &'a ViewRelevanceCache,
    config: &'a ShadowConfig,
    candidates: Vec<GatherCandidate<'a>>,
}

/// Gather casters and receivers of every shadow in `shadows` that needs it.
///
/// Gathered are preshadows without cached depths, view-dependent
/// whole-scene shadows and local light whole-scene shadows. Per-object
/// shadows get their subject when they are created.
pub fn gather_shadow_primitives(
    scene: &Scene,
    views: &[ShadowView],
    shadows: &mut [ProjectedShadowInfo],
    relevance: &mut ViewRelevanceCache,
    config: &ShadowConfig,
) -> GatherStats {
    let all_primitives: Vec<PrimitiveId> = scene.primitives().iter().map(|primitive| primitive.id).collect();

    let outputs: Vec<(Vec<SubjectPrimitiveOp>, Vec<(ShadowId, PrimitiveId)>, GatherStats)> = {
        let candidates = collect_candidates(scene, views, shadows);
        if candidates.is_empty() {
            return GatherStats::default();
        }

        let ctx = GatherContext {
            scene,
            views,
            relevance: &*relevance,
            config,
            candidates,
        };
        let mut packets = build_packets(&ctx, &all_primitives);

        if config.parallel_gather {
            packets.par_iter_mut().for_each(|packet| packet.run(&ctx));
        } else {
            packets.iter_mut().for_each(|packet| packet.run(&ctx));
        }

        packets
            .into_iter()
            .map(|packet| (packet.ops, packet.receiver_ops, packet.stats))
            .collect()
    };

    let mut stats = GatherStats::default();
    for (ops, receiver_ops, packet_stats) in outputs {
        stats += packet_stats;

        for op in ops {
            let index = op.shadow.index();
            let op = if op.deferred {
                let primitive = op.primitive;
                match resolve_subject_op(scene, views, relevance, op.shadow, &shadows[index], primitive) {
                    Some(op) => {
                        stats.subjects_added += 1;
                        op
                    }
                    None => continue,
                }
            } else {
                op
            };
            apply_subject_op(&mut shadows[index], &op);
        }

        for (shadow, primitive) in receiver_ops {
            shadows[shadow.index()].add_receiver_primitive(primitive);
        }
    }

    log::debug!(
        "Gathered {} subjects in {} packets ({} tested, {} frustum culled, {} screen culled, {} deferred)",
        stats.subjects_added,
        stats.packets,
        stats.primitives_tested,
        stats.frustum_culled,
        stats.screen_culled,
        stats.deferred
    );
    stats
}

/// Add `primitive` as a caster of `shadow` right away, computing any
/// missing view relevance. Returns whether it was accepted.
pub fn add_subject_resolved(
    scene: &Scene,
    views: &[ShadowView],
    relevance: &mut ViewRelevanceCache,
    shadow_id: ShadowId,
    shadow: &mut ProjectedShadowInfo,
    primitive: PrimitiveId,
) -> bool {
    match resolve_subject_op(scene, views, relevance, shadow_id, shadow, primitive) {
        Some(op) => {
            apply_subject_op(shadow, &op);
            true
        }
        None => false,
    }
}

/// Primitives of a light's interactions that a cache layer may contain
pub fn interaction_subjects(interactions: &LightInteractions, mode: CacheMode, config: &ShadowConfig) -> Vec<PrimitiveId> {
    let movable = mode != CacheMode::StaticPrimitivesOnly
        && (mode != CacheMode::MovablePrimitivesOnly || config.cached_shadows_cast_from_movable_primitives);
    let statics = mode != CacheMode::MovablePrimitivesOnly;

    let mut subjects = Vec::new();
    if movable {
        subjects.extend_from_slice(&interactions.movable);
    }
    if statics {
        subjects.extend_from_slice(&interactions.static_primitives);
    }
    subjects
}

fn collect_candidates<'a>(
    scene: &'a Scene,
    views: &[ShadowView],
    shadows: &'a [ProjectedShadowInfo],
) -> Vec<GatherCandidate<'a>> {
    let mut candidates = Vec::new();
    for (index, shadow) in shadows.iter().enumerate() {
        let kind = if shadow.pre_shadow {
            if shadow.depths_cached {
                continue;
            }
            CandidateKind::Preshadow
        } else if shadow.whole_scene_shadow && shadow.dependent_view.is_some() {
            CandidateKind::ViewDependent
        } else if shadow.is_whole_scene_local_shadow() {
            CandidateKind::Interactions
        } else {
            continue;
        };

        let Some(light) = scene.light(shadow.light) else {
            log::warn!("Shadow {index} refers to missing light {:?}", shadow.light);
            continue;
        };
        let view_index = shadow
            .dependent_view
            .and_then(|id| views.iter().position(|view| view.id == id));

        candidates.push(GatherCandidate {
            id: ShadowId(index as u32),
            shadow,
            light,
            kind,
            view_index,
        });
    }
    candidates
}

fn build_packets<'a>(ctx: &GatherContext<'a>, all_primitives: &'a [PrimitiveId]) -> Vec<GatherPacket<'a>> {
    let mut packets = Vec::new();
    let scene_candidates: Vec<&GatherCandidate<'_>> = ctx
        .candidates
        .iter()
        .filter(|candidate| candidate.kind != CandidateKind::Interactions)
        .collect();

    if !scene_candidates.is_empty() {
        match ctx.scene.spatial_index().filter(|_| ctx.config.use_spatial_index) {
            Some(bvh) => {
                let leaves = bvh.collect_packets(|node: &AABB| {
                    let (center, extent) = (node.center(), node.half_extents());
                    scene_candidates.iter().any(|candidate| candidate.may_touch_box(center, extent))
                });
                packets.extend(
                    leaves
                        .into_iter()
                        .map(|leaf| GatherPacket::new(Cow::Borrowed(leaf), PacketSource::Scene)),
                );
            }
            None => packets.extend(
                all_primitives
                    .chunks(ctx.config.primitives_per_packet.max(1))
                    .map(|chunk| GatherPacket::new(Cow::Borrowed(chunk), PacketSource::Scene)),
            ),
        }
    }

    for (index, candidate) in ctx.candidates.iter().enumerate() {
        if candidate.kind != CandidateKind::Interactions {
            continue;
        }
        let Some(interactions) = ctx.scene.interactions(candidate.light.id) else {
            continue;
        };
        let subjects = interaction_subjects(interactions, candidate.shadow.cache_mode, ctx.config);
        for chunk in subjects.chunks(ctx.config.primitives_per_packet.max(1)) {
            packets.push(GatherPacket::new(
                Cow::Owned(chunk.to_vec()),
                PacketSource::Interactions(index),
            ));
        }
    }

    packets
}

fn filter_primitive(
    ctx: &GatherContext<'_>,
    primitive: &PrimitiveSceneInfo,
    ops: &mut Vec<SubjectPrimitiveOp>,
    receiver_ops: &mut Vec<(ShadowId, PrimitiveId)>,
    stats: &mut GatherStats,
) {
    stats.primitives_tested += 1;
    let bounds = &primitive.bounds;
    let flags = primitive.flags;
    let mut visible = None;

    for candidate in &ctx.candidates {
        if candidate.kind != CandidateKind::Preshadow {
            continue;
        }
        let shadow = candidate.shadow;
        if shadow.parent_primitive == Some(primitive.id) {
            continue;
        }
        let in_receiver_frustum = shadow.receiver_frustum.intersect_box_translated(
            bounds.origin,
            shadow.pre_shadow_translation,
            bounds.box_extent,
        );
        if in_receiver_frustum && *visible.get_or_insert_with(|| is_primitive_visible(primitive, ctx.views)) {
            receiver_ops.push((candidate.id, primitive.id));
            stats.receivers_added += 1;
        }
    }

    if !flags.cast_dynamic_shadow {
        return;
    }

    for candidate in &ctx.candidates {
        match candidate.kind {
            // Only lightmapped primitives casting both kinds of shadow go into preshadows
            CandidateKind::Preshadow if flags.cast_static_shadow && flags.static_lighting => {
                let shadow = candidate.shadow;
                let in_frustum = shadow.caster_frustum.intersect_box_translated(
                    bounds.origin,
                    shadow.pre_shadow_translation,
                    bounds.box_extent,
                );
                if in_frustum && candidate.light.affects_bounds(bounds) {
                    push_subject(ctx, candidate, primitive, ops, stats);
                } else {
                    stats.frustum_culled += 1;
                }
            }
            CandidateKind::ViewDependent => filter_view_dependent(ctx, candidate, primitive, ops, stats),
            _ => {}
        }
    }
}

fn filter_view_dependent(
    ctx: &GatherContext<'_>,
    candidate: &GatherCandidate<'_>,
    primitive: &PrimitiveSceneInfo,
    ops: &mut Vec<SubjectPrimitiveOp>,
    stats: &mut GatherStats,
) {
    if !candidate.accepts_statically_lit() {
        return;
    }
    let shadow = candidate.shadow;
    let bounds = &primitive.bounds;

    // Cylinder along the light through the shadow bounds, capped by the
    // bounds sphere on the far side
    let direction = candidate.light.direction();
    let to_center = shadow.shadow_bounds.center - bounds.origin;
    let along = to_center.dot(direction);
    let axis_distance_sq = (to_center - direction * along).length_squared();
    let combined_radius = shadow.shadow_bounds.radius + bounds.sphere_radius;
    let combined_radius_sq = combined_radius * combined_radius;

    if axis_distance_sq >= combined_radius_sq || (along < 0.0 && to_center.length_squared() > combined_radius_sq) {
        stats.frustum_culled += 1;
        return;
    }
    if !accurate_volume_test(shadow, bounds.origin, bounds.box_extent) {
        stats.frustum_culled += 1;
        return;
    }

    let Some(view) = candidate.view_index.map(|index| &ctx.views[index]) else {
        return;
    };
    let min_screen_radius = if shadow.reflective_shadow_map {
        ctx.config.min_screen_radius_for_rsm_caster
    } else {
        ctx.config.min_screen_radius_for_shadow_caster
    };
    let distance_sq = bounds.origin.distance_squared(view.origin);
    let lod_sq = view.lod_distance_factor * view.lod_distance_factor;
    if bounds.sphere_radius * bounds.sphere_radius < min_screen_radius * min_screen_radius * distance_sq * lod_sq {
        stats.screen_culled += 1;
        return;
    }

    let flags = primitive.flags;
    if shadow.reflective_shadow_map && !flags.affects_dynamic_indirect_lighting {
        return;
    }
    // These get a shadow of their own
    if flags.cast_inset_shadow && !shadow.reflective_shadow_map {
        return;
    }
    if candidate.light.creates_per_object_shadow_for(primitive) {
        return;
    }

    push_subject(ctx, candidate, primitive, ops, stats);
}

fn filter_interaction(
    ctx: &GatherContext<'_>,
    candidate: &GatherCandidate<'_>,
    primitive: &PrimitiveSceneInfo,
    ops: &mut Vec<SubjectPrimitiveOp>,
    stats: &mut GatherStats,
) {
    stats.primitives_tested += 1;
    let flags = primitive.flags;
    if !flags.cast_dynamic_shadow || flags.self_shadow_only {
        return;
    }

    let shadow = candidate.shadow;
    let bounds = &primitive.bounds;
    let in_frustum = shadow
        .caster_frustum
        .intersect_box_translated(bounds.origin, shadow.pre_shadow_translation, bounds.box_extent);
    if !in_frustum || !intersects_convex_hulls(&shadow.light_view_hulls, bounds) {
        stats.frustum_culled += 1;
        return;
    }

    push_subject(ctx, candidate, primitive, ops, stats);
}

fn push_subject(
    ctx: &GatherContext<'_>,
    candidate: &GatherCandidate<'_>,
    primitive: &PrimitiveSceneInfo,
    ops: &mut Vec<SubjectPrimitiveOp>,
    stats: &mut GatherStats,
) {
    let Some(op) = build_subject_op(primitive, candidate.id, candidate.shadow, ctx.views, ctx.relevance) else {
        return;
    };
    if op.deferred {
        stats.deferred += 1;
    } else {
        stats.subjects_added += 1;
    }
    ops.push(op);
}

/// Views whose relevance decides a shadow's subjects
fn relevant_views(shadow: &ProjectedShadowInfo, views: &[ShadowView]) -> Range<usize> {
    match shadow.dependent_view {
        Some(id) => match views.iter().position(|view| view.id == id) {
            Some(index) => index..index + 1,
            None => 0..0,
        },
        None => 0..views.len(),
    }
}

fn build_subject_op(
    primitive: &PrimitiveSceneInfo,
    shadow_id: ShadowId,
    shadow: &ProjectedShadowInfo,
    views: &[ShadowView],
    relevance: &ViewRelevanceCache,
) -> Option<SubjectPrimitiveOp> {
    let mut combined = ViewRelevance::default();

    for view_index in relevant_views(shadow, views) {
        let view = &views[view_index];
        if view.is_perspective {
            let distance_sq = primitive.bounds.origin.distance_squared(view.origin);
            if !primitive.within_draw_distance(distance_sq, view.lod_distance_factor) {
                continue;
            }
        }
        let Some(view_relevance) = relevance.get(view_index, primitive.id) else {
            return Some(SubjectPrimitiveOp::deferred(primitive.id, shadow_id));
        };
        combined.shadow_relevance |= view_relevance.shadow_relevance;
        combined.static_relevance |= view_relevance.static_relevance;
        combined.dynamic_relevance |= view_relevance.dynamic_relevance;
        combined.translucent_relevance |= view_relevance.translucent_relevance;
    }

    if !combined.shadow_relevance {
        return None;
    }

    let mut op = SubjectPrimitiveOp::new(primitive.id, shadow_id);
    if shadow.translucent_shadow {
        op.translucent = true;
        return combined.translucent_relevance.then_some(op);
    }
    if !combined.static_relevance && !combined.dynamic_relevance {
        return None;
    }

    if combined.static_relevance {
        for (index, mesh) in primitive.static_meshes.iter().enumerate() {
            let Ok(index) = u16::try_from(index) else {
                break;
            };
            if !mesh.cast_shadow {
                continue;
            }
            if mesh.has_cached_draw_command {
                op.cached_commands.push(index);
            } else {
                op.build_requests.push(index);
            }
        }
    }
    op.dynamic = combined.dynamic_relevance;
    Some(op)
}

fn resolve_subject_op(
    scene: &Scene,
    views: &[ShadowView],
    relevance: &mut ViewRelevanceCache,
    shadow_id: ShadowId,
    shadow: &ProjectedShadowInfo,
    primitive: PrimitiveId,
) -> Option<SubjectPrimitiveOp> {
    for view_index in relevant_views(shadow, views) {
        relevance.get_or_compute(scene, views, view_index, primitive);
    }
    build_subject_op(scene.primitive(primitive), shadow_id, shadow, views, relevance)
        .filter(|op| !op.deferred)
}

fn apply_subject_op(shadow: &mut ProjectedShadowInfo, op: &SubjectPrimitiveOp) {
    if op.translucent {
        shadow.add_translucent_subject_primitive(op.primitive);
    } else {
        shadow.add_subject_primitive(
            op.primitive,
            op.dynamic,
            op.cached_commands.iter(),
            op.build_requests.iter(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::light::{LightId, LightShape};
    use crate::projection::{setup_whole_scene_projection, WholeSceneSetup};
    use crate::scene::{PrimitiveFlags, PrimitiveMobility, StaticMeshBatch};
    use crate::view::ViewId;
    use std::collections::BTreeSet;
    use void_math::BoxSphereBounds;

    fn test_view() -> ShadowView {
        ShadowView::perspective(
            ViewId(0),
            Vec3::ZERO,
            Vec3::X,
            Vec3::Z,
            std::f32::consts::FRAC_PI_4,
            (1280, 720),
            10.0,
            100_000.0,
        )
    }

    fn sun() -> LightSceneInfo {
        LightSceneInfo::new(
            LightId(0),
            LightShape::Directional { direction: Vec3::new(0.3, 0.2, -1.0) },
            Vec3::ZERO,
        )
    }

    fn bounds_at(position: Vec3, extent: f32) -> BoxSphereBounds {
        BoxSphereBounds::new(position, Vec3::splat(extent), extent * 3.0f32.sqrt())
    }

    fn grid_scene() -> Scene {
        let mut scene = Scene::new();
        scene.add_light(sun());
        for x in 1..=100 {
            for y in -2..=2 {
                let position = Vec3::new(x as f32 * 50.0, y as f32 * 100.0, 0.0);
                scene.add_primitive(PrimitiveSceneInfo::new(bounds_at(position, 10.0)));
            }
        }
        // Above the view frustum but inside the first cascade's extrusion
        scene.add_primitive(PrimitiveSceneInfo::new(bounds_at(Vec3::new(300.0, 0.0, 900.0), 50.0)));
        scene
    }

    fn cascade(scene: &Scene, view: &ShadowView, config: &ShadowConfig) -> ProjectedShadowInfo {
        let light = scene.light(LightId(0)).unwrap();
        let initializer = light.view_dependent_initializer(view, 0, config).unwrap();
        let setup = WholeSceneSetup {
            dependent_view: Some(view),
            resolution_x: 1024,
            resolution_y: 1024,
            border: 4,
            reflective: false,
        };
        setup_whole_scene_projection(light, &initializer, &setup, config).unwrap()
    }

    fn subject_pairs(shadows: &[ProjectedShadowInfo]) -> BTreeSet<(usize, PrimitiveId)> {
        shadows
            .iter()
            .enumerate()
            .flat_map(|(index, shadow)| shadow.subject_primitives.iter().map(move |&p| (index, p)))
            .collect()
    }

    fn gather_with(scene: &Scene, config: &ShadowConfig) -> (BTreeSet<(usize, PrimitiveId)>, GatherStats) {
        let views = [test_view()];
        let mut shadows = vec![cascade(scene, &views[0], config)];
        let mut relevance = ViewRelevanceCache::for_visible_primitives(scene, &views);
        let stats = gather_shadow_primitives(scene, &views, &mut shadows, &mut relevance, config);
        (subject_pairs(&shadows), stats)
    }

    #[test]
    fn test_cull_result_overflow() {
        let mut result = CullResult::default();
        result.push(3);
        result.push(5);
        assert!(!result.is_overflowed());
        assert_eq!(result.len(), 2);

        result.push(8);
        assert!(result.is_overflowed());
        assert_eq!(result.iter().collect::<Vec<_>>(), vec![3, 5, 8]);
        assert!(CullResult::default().is_empty());
    }

    #[test]
    fn test_gather_is_independent_of_partitioning() {
        let mut scene = grid_scene();
        let base = ShadowConfig {
            use_spatial_index: false,
            parallel_gather: false,
            primitives_per_packet: 100_000,
            ..Default::default()
        };
        let (reference, stats) = gather_with(&scene, &base);
        assert_eq!(stats.packets, 1);
        assert!(!reference.is_empty());
        assert!(reference.len() < scene.primitives().len());

        for (per_packet, parallel) in [(1, false), (7, true), (64, true)] {
            let config = ShadowConfig {
                primitives_per_packet: per_packet,
                parallel_gather: parallel,
                ..base.clone()
            };
            assert_eq!(gather_with(&scene, &config).0, reference);
        }

        scene.rebuild_spatial_index();
        let bvh = ShadowConfig {
            use_spatial_index: true,
            parallel_gather: true,
            ..base
        };
        let (pairs, stats) = gather_with(&scene, &bvh);
        assert_eq!(pairs, reference);
        assert!(stats.packets > 1);
    }

    #[test]
    fn test_offscreen_caster_is_deferred_and_resolved() {
        let scene = grid_scene();
        let config = ShadowConfig::default();
        let (pairs, stats) = gather_with(&scene, &config);

        let offscreen = PrimitiveId(scene.primitives().len() as u32 - 1);
        assert!(stats.deferred >= 1);
        assert!(pairs.contains(&(0, offscreen)));
    }

    #[test]
    fn test_far_primitives_fail_cylinder_test() {
        let scene = grid_scene();
        let (pairs, stats) = gather_with(&scene, &ShadowConfig::default());
        // Far end of the grid lies beyond the first cascade
        let far_end = scene
            .primitives()
            .iter()
            .find(|p| p.bounds.origin.x >= 5000.0)
            .unwrap()
            .id;
        assert!(!pairs.contains(&(0, far_end)));
        assert!(stats.frustum_culled > 0);
    }

    #[test]
    fn test_inset_casters_are_left_to_their_own_shadow() {
        let mut scene = Scene::new();
        scene.add_light(sun());
        let inset = scene.add_primitive(
            PrimitiveSceneInfo::new(bounds_at(Vec3::new(200.0, 0.0, 0.0), 10.0)).with_flags(PrimitiveFlags {
                cast_inset_shadow: true,
                ..Default::default()
            }),
        );
        let regular = scene.add_primitive(PrimitiveSceneInfo::new(bounds_at(Vec3::new(220.0, 0.0, 0.0), 10.0)));

        let (pairs, _) = gather_with(&scene, &ShadowConfig::default());
        assert!(pairs.contains(&(0, regular)));
        assert!(!pairs.contains(&(0, inset)));
    }

    #[test]
    fn test_static_layer_takes_static_interactions_only() {
        let interactions = LightInteractions {
            movable: vec![PrimitiveId(1), PrimitiveId(2)],
            static_primitives: vec![PrimitiveId(3)],
        };
        let config = ShadowConfig::default();

        assert_eq!(
            interaction_subjects(&interactions, CacheMode::StaticPrimitivesOnly, &config),
            vec![PrimitiveId(3)]
        );
        assert_eq!(
            interaction_subjects(&interactions, CacheMode::MovablePrimitivesOnly, &config),
            vec![PrimitiveId(1), PrimitiveId(2)]
        );
        assert_eq!(interaction_subjects(&interactions, CacheMode::Uncached, &config).len(), 3);

        let no_movable = ShadowConfig {
            cached_shadows_cast_from_movable_primitives: false,
            ..Default::default()
        };
        assert!(interaction_subjects(&interactions, CacheMode::MovablePrimitivesOnly, &no_movable).is_empty());
    }

    #[test]
    fn test_mesh_batches_split_into_cached_and_built() {
        let mut scene = Scene::new();
        scene.add_light(sun());
        let id = scene.add_primitive(
            PrimitiveSceneInfo::new(bounds_at(Vec3::new(200.0, 0.0, 0.0), 10.0))
                .with_mobility(PrimitiveMobility::Static)
                .with_dynamic_elements(true)
                .with_static_meshes(vec![
                    StaticMeshBatch::cached(),
                    StaticMeshBatch::uncached(),
                    StaticMeshBatch {
                        cast_shadow: false,
                        has_cached_draw_command: true,
                    },
                    StaticMeshBatch::cached(),
                    StaticMeshBatch::cached(),
                ]),
        );

        let views = [test_view()];
        let config = ShadowConfig::default();
        let mut shadows = vec![cascade(&scene, &views[0], &config)];
        let mut relevance = ViewRelevanceCache::for_visible_primitives(&scene, &views);
        gather_shadow_primitives(&scene, &views, &mut shadows, &mut relevance, &config);

        let shadow = &shadows[0];
        let cached: Vec<u16> = shadow.cached_draw_commands.iter().map(|c| c.mesh_index).collect();
        assert_eq!(cached, vec![0, 3, 4]);
        assert_eq!(shadow.mesh_build_requests.len(), 1);
        assert_eq!(shadow.dynamic_subject_primitives, vec![id]);
        assert!(shadow.has_subject_prims());
    }

    #[test]
    fn test_nothing_to_gather() {
        let scene = grid_scene();
        let views = [test_view()];
        let mut shadows = vec![ProjectedShadowInfo::default()];
        let mut relevance = ViewRelevanceCache::new(1, scene.primitives().len());
        let stats = gather_shadow_primitives(&scene, &views, &mut shadows, &mut relevance, &ShadowConfig::default());
        assert_eq!(stats, GatherStats::default());
        assert_eq!(relevance.computed_count(), 0);
    }
}
