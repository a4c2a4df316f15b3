use std::{ops::Deref, sync::Arc};

use oxidx::dx;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, info};

use super::{
    device::Device,
    error::{RhiError, RhiResult},
    types::{
        ResourceBindingKind, ShaderVisibility, NUM_RESOURCE_BINDING_KINDS, NUM_SHADER_VISIBILITIES,
    },
    DEFAULT_CONSTANT_BUFFER_COUNT, DEFAULT_LOCAL_RESOURCE_COUNT, DEFAULT_SAMPLER_STATE_COUNT,
    DEFAULT_SHADER_RESOURCE_VIEW_COUNT, DEFAULT_UNORDERED_ACCESS_VIEW_COUNT,
    MAX_32BIT_SHADER_CONSTANTS, REGISTER_SPACE_32BIT_CONSTANTS, REGISTER_SPACE_RT_LOCAL,
};

/// Per-stage descriptor-table sizes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShaderResourceRanges {
    pub num_cbvs: u32,
    pub num_srvs: u32,
    pub num_uavs: u32,
    pub num_samplers: u32,
}

impl ShaderResourceRanges {
    fn fits_within(&self, other: &Self) -> bool {
        self.num_cbvs <= other.num_cbvs
            && self.num_srvs <= other.num_srvs
            && self.num_uavs <= other.num_uavs
            && self.num_samplers <= other.num_samplers
    }

    fn count(&self, kind: ResourceBindingKind) -> u32 {
        match kind {
            ResourceBindingKind::Cbv => self.num_cbvs,
            ResourceBindingKind::Srv => self.num_srvs,
            ResourceBindingKind::Uav => self.num_uavs,
            ResourceBindingKind::Sampler => self.num_samplers,
        }
    }

    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// One shader stage's total binding requirements.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShaderResourceCount {
    pub ranges: ShaderResourceRanges,
    pub num_32bit_constants: u32,
}

impl ShaderResourceCount {
    fn fits_within(&self, other: &Self) -> bool {
        self.ranges.fits_within(&other.ranges)
            && self.num_32bit_constants <= other.num_32bit_constants
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RootSignatureKind {
    Graphics,
    Compute,
    RayTracingGlobal,
    RayTracingLocal,
}

/// Cache key: a root signature serves every pipeline whose requirements fit
/// within its capacities.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RootSignatureRequirements {
    pub kind: RootSignatureKind,
    pub allow_input_assembler: bool,
    pub resource_counts: [ShaderResourceCount; NUM_SHADER_VISIBILITIES],
}

impl RootSignatureRequirements {
    pub fn new(kind: RootSignatureKind) -> Self {
        Self {
            kind,
            allow_input_assembler: matches!(kind, RootSignatureKind::Graphics),
            resource_counts: Default::default(),
        }
    }

    pub fn stage_mut(&mut self, visibility: ShaderVisibility) -> &mut ShaderResourceCount {
        &mut self.resource_counts[visibility.index()]
    }

    pub fn stage(&self, visibility: ShaderVisibility) -> &ShaderResourceCount {
        &self.resource_counts[visibility.index()]
    }

    /// `self` can be served by a signature built for `other`: same kind and
    /// flags, and every per-stage count fits within `other`'s capacity.
    pub fn is_compatible(&self, other: &Self) -> bool {
        if self.kind != other.kind || self.allow_input_assembler != other.allow_input_assembler {
            return false;
        }

        self.resource_counts
            .iter()
            .zip(other.resource_counts.iter())
            .all(|(mine, theirs)| mine.fits_within(theirs))
    }

    /// 32-bit constants always live in one ALL-visibility root parameter,
    /// sized to the maximum any stage asked for.
    pub fn normalized(mut self) -> Self {
        let max_constants = self
            .resource_counts
            .iter()
            .map(|c| c.num_32bit_constants)
            .max()
            .unwrap_or(0);

        for count in &mut self.resource_counts {
            count.num_32bit_constants = 0;
        }
        self.resource_counts[ShaderVisibility::All.index()].num_32bit_constants = max_constants;

        self
    }

    /// Rounds every non-empty range up to the shared defaults so the
    /// resulting signature has slack for reuse by future similar requests.
    pub fn rounded_up(mut self) -> Self {
        for count in &mut self.resource_counts {
            let ranges = &mut count.ranges;
            if ranges.num_cbvs > 0 {
                ranges.num_cbvs = ranges.num_cbvs.max(DEFAULT_CONSTANT_BUFFER_COUNT);
            }
            if ranges.num_srvs > 0 {
                ranges.num_srvs = ranges.num_srvs.max(DEFAULT_SHADER_RESOURCE_VIEW_COUNT);
            }
            if ranges.num_uavs > 0 {
                ranges.num_uavs = ranges.num_uavs.max(DEFAULT_UNORDERED_ACCESS_VIEW_COUNT);
            }
            if ranges.num_samplers > 0 {
                ranges.num_samplers = ranges.num_samplers.max(DEFAULT_SAMPLER_STATE_COUNT);
            }
        }

        self
    }
}

/// `(visibility, binding kind) -> root parameter index`, plus the index of
/// the shared 32-bit-constants parameter.
#[derive(Clone, Copy, Debug, Default)]
pub struct RootParameterMap {
    table_indices: [[Option<u32>; NUM_RESOURCE_BINDING_KINDS]; NUM_SHADER_VISIBILITIES],
    constants_index: Option<u32>,
}

impl RootParameterMap {
    pub fn table_index(
        &self,
        visibility: ShaderVisibility,
        kind: ResourceBindingKind,
    ) -> Option<u32> {
        self.table_indices[visibility.index()][kind.index()]
    }

    pub fn constants_index(&self) -> Option<u32> {
        self.constants_index
    }
}

struct TableEntry {
    visibility: ShaderVisibility,
    kind: ResourceBindingKind,
    count: u32,
}

struct ParameterPlan {
    tables: Vec<TableEntry>,
    num_constants: u32,
    map: RootParameterMap,
    flags: dx::RootSignatureFlags,
}

/// Lays out root parameters for `requirements`: one descriptor table per
/// non-empty (kind, visibility) range in stage-major order, then a single
/// ALL-visibility constants parameter. Stages that bind nothing get a deny
/// flag.
fn plan_parameters(requirements: &RootSignatureRequirements) -> ParameterPlan {
    let mut tables = Vec::new();
    let mut map = RootParameterMap::default();
    let mut flags = dx::RootSignatureFlags::empty();

    for visibility in ShaderVisibility::ALL {
        let stage = requirements.stage(visibility);

        for kind in ResourceBindingKind::ALL {
            let count = stage.ranges.count(kind);
            if count == 0 {
                continue;
            }

            map.table_indices[visibility.index()][kind.index()] = Some(tables.len() as u32);
            tables.push(TableEntry {
                visibility,
                kind,
                count,
            });
        }

        if stage.ranges.is_empty() && stage.num_32bit_constants == 0 {
            flags |= visibility.deny_flag();
        }
    }

    let num_constants = requirements
        .stage(ShaderVisibility::All)
        .num_32bit_constants;
    if num_constants > 0 {
        map.constants_index = Some(tables.len() as u32);
    }

    if requirements.allow_input_assembler {
        flags |= dx::RootSignatureFlags::AllowInputAssemblerInputLayout;
    } else if requirements.kind == RootSignatureKind::RayTracingLocal {
        flags = dx::RootSignatureFlags::Local;
    }

    ParameterPlan {
        tables,
        num_constants,
        map,
        flags,
    }
}

/// An immutable binding layout shared by every pipeline whose requirements
/// fit within its capacities.
#[derive(Clone, Debug)]
pub struct RootSignature(Arc<RootSignatureInner>);

#[derive(Debug)]
pub struct RootSignatureInner {
    raw: dx::RootSignature,
    map: RootParameterMap,
    requirements: RootSignatureRequirements,
}

impl Deref for RootSignature {
    type Target = RootSignatureInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl RootSignatureInner {
    pub fn raw(&self) -> &dx::RootSignature {
        &self.raw
    }

    pub fn table_index(
        &self,
        visibility: ShaderVisibility,
        kind: ResourceBindingKind,
    ) -> Option<u32> {
        self.map.table_index(visibility, kind)
    }

    pub fn constants_index(&self) -> Option<u32> {
        self.map.constants_index()
    }

    pub fn requirements(&self) -> &RootSignatureRequirements {
        &self.requirements
    }
}

impl RootSignature {
    fn build(device: &Device, requirements: RootSignatureRequirements) -> RhiResult<Self> {
        let plan = plan_parameters(&requirements);

        let register_space = if requirements.kind == RootSignatureKind::RayTracingLocal {
            REGISTER_SPACE_RT_LOCAL
        } else {
            0
        };

        let ranges = plan
            .tables
            .iter()
            .map(|table| {
                let range = match table.kind {
                    ResourceBindingKind::Cbv => dx::DescriptorRange::cbv(table.count, 0),
                    ResourceBindingKind::Srv => dx::DescriptorRange::srv(table.count, 0),
                    ResourceBindingKind::Uav => dx::DescriptorRange::uav(table.count, 0),
                    ResourceBindingKind::Sampler => dx::DescriptorRange::sampler(table.count, 0),
                };
                range.with_register_space(register_space)
            })
            .collect::<SmallVec<[_; 8]>>();

        let mut parameters = plan
            .tables
            .iter()
            .zip(ranges.iter())
            .map(|(table, range)| {
                dx::RootParameter::descriptor_table(std::slice::from_ref(range))
                    .with_visibility(table.visibility.as_raw())
            })
            .collect::<SmallVec<[_; 8]>>();

        if plan.num_constants > 0 {
            parameters.push(
                dx::RootParameter::constant_32bit(
                    0,
                    REGISTER_SPACE_32BIT_CONSTANTS,
                    plan.num_constants,
                )
                .with_visibility(dx::ShaderVisibility::All),
            );
        }

        let desc = dx::RootSignatureDesc::default()
            .with_parameters(&parameters)
            .with_flags(plan.flags);

        let raw = device
            .raw
            .serialize_and_create_root_signature(&desc, dx::RootSignatureVersion::V1_0, 0)
            .map_err(|e| RhiError::creation("root signature", e))?;

        Ok(Self(Arc::new(RootSignatureInner {
            raw,
            map: plan.map,
            requirements,
        })))
    }
}

/// Deduplicating root-signature store. Owned by the render layer and passed
/// by reference into pipeline builders; not a global.
#[derive(Debug)]
pub struct RootSignatureCache {
    device: Device,
    entries: Mutex<Vec<RootSignature>>,
}

impl RootSignatureCache {
    pub(crate) fn inner_new(device: Device) -> RhiResult<Self> {
        let cache = Self {
            device,
            entries: Mutex::new(Vec::new()),
        };

        // Pre-seed the shared defaults so early pipelines with default-sized
        // needs never build their own signatures.
        let mut graphics = RootSignatureRequirements::new(RootSignatureKind::Graphics);
        graphics.stage_mut(ShaderVisibility::All).num_32bit_constants = MAX_32BIT_SHADER_CONSTANTS;
        // Constants stay visible to every stage through the ALL slot; the
        // per-stage tables skip ALL itself.
        for visibility in &ShaderVisibility::ALL[1..] {
            graphics.stage_mut(*visibility).ranges = ShaderResourceRanges {
                num_cbvs: DEFAULT_CONSTANT_BUFFER_COUNT,
                num_srvs: DEFAULT_SHADER_RESOURCE_VIEW_COUNT,
                num_uavs: DEFAULT_UNORDERED_ACCESS_VIEW_COUNT,
                num_samplers: DEFAULT_SAMPLER_STATE_COUNT,
            };
        }
        cache.create(graphics)?;

        let mut compute = RootSignatureRequirements::new(RootSignatureKind::Compute);
        *compute.stage_mut(ShaderVisibility::All) = ShaderResourceCount {
            ranges: ShaderResourceRanges {
                num_cbvs: DEFAULT_CONSTANT_BUFFER_COUNT,
                num_srvs: DEFAULT_SHADER_RESOURCE_VIEW_COUNT,
                num_uavs: DEFAULT_UNORDERED_ACCESS_VIEW_COUNT,
                num_samplers: DEFAULT_SAMPLER_STATE_COUNT,
            },
            num_32bit_constants: MAX_32BIT_SHADER_CONSTANTS,
        };
        cache.create(compute)?;

        if cache.device.is_ray_tracing_supported() {
            let mut global = RootSignatureRequirements::new(RootSignatureKind::RayTracingGlobal);
            *global.stage_mut(ShaderVisibility::All) = ShaderResourceCount {
                ranges: ShaderResourceRanges {
                    num_cbvs: DEFAULT_CONSTANT_BUFFER_COUNT,
                    num_srvs: DEFAULT_SHADER_RESOURCE_VIEW_COUNT,
                    num_uavs: DEFAULT_UNORDERED_ACCESS_VIEW_COUNT,
                    num_samplers: DEFAULT_SAMPLER_STATE_COUNT,
                },
                num_32bit_constants: MAX_32BIT_SHADER_CONSTANTS,
            };
            cache.create(global)?;

            let mut local = RootSignatureRequirements::new(RootSignatureKind::RayTracingLocal);
            local.stage_mut(ShaderVisibility::All).ranges = ShaderResourceRanges {
                num_cbvs: DEFAULT_LOCAL_RESOURCE_COUNT,
                num_srvs: DEFAULT_LOCAL_RESOURCE_COUNT,
                num_uavs: DEFAULT_LOCAL_RESOURCE_COUNT,
                num_samplers: DEFAULT_LOCAL_RESOURCE_COUNT,
            };
            cache.create(local)?;
        }

        Ok(cache)
    }

    /// Returns a signature whose capacities cover `requirements`, creating a
    /// capacity-rounded-up entry on miss.
    pub fn get_or_create(
        &self,
        requirements: RootSignatureRequirements,
    ) -> RhiResult<RootSignature> {
        let requirements = requirements.normalized();

        if let Some(entry) = self
            .entries
            .lock()
            .iter()
            .find(|entry| requirements.is_compatible(entry.requirements()))
        {
            debug!(target: "rhi::root_signature", "reusing cached root signature");
            return Ok(entry.clone());
        }

        self.create(requirements.rounded_up())
    }

    fn create(&self, requirements: RootSignatureRequirements) -> RhiResult<RootSignature> {
        let signature = RootSignature::build(&self.device, requirements)?;
        self.entries.lock().push(signature.clone());

        info!(target: "rhi::root_signature", kind = ?requirements.kind, "created root signature");
        Ok(signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graphics_requirements(srvs_pixel: u32, constants: u32) -> RootSignatureRequirements {
        let mut requirements = RootSignatureRequirements::new(RootSignatureKind::Graphics);
        requirements.stage_mut(ShaderVisibility::Pixel).ranges.num_srvs = srvs_pixel;
        requirements
            .stage_mut(ShaderVisibility::Pixel)
            .num_32bit_constants = constants;
        requirements
    }

    #[test]
    fn smaller_requirements_are_compatible() {
        let small = graphics_requirements(2, 0).normalized();
        let large = graphics_requirements(8, 0).normalized();

        assert!(small.is_compatible(&large));
        assert!(!large.is_compatible(&small));
        assert!(small.is_compatible(&small));
    }

    #[test]
    fn kind_and_flags_gate_compatibility() {
        let mut compute = RootSignatureRequirements::new(RootSignatureKind::Compute);
        compute.stage_mut(ShaderVisibility::All).ranges.num_srvs = 2;

        let graphics = graphics_requirements(2, 0);
        assert!(!compute.is_compatible(&graphics));

        let mut no_ia = graphics;
        no_ia.allow_input_assembler = false;
        assert!(!graphics.is_compatible(&no_ia));
    }

    #[test]
    fn round_up_preserves_compatibility() {
        // A fits B's exact counts => A must also fit any signature built by
        // rounding B up.
        let a = graphics_requirements(3, 0).normalized();
        let b = graphics_requirements(5, 0).normalized();

        assert!(a.is_compatible(&b));
        assert!(a.is_compatible(&b.rounded_up()));
        assert!(b.is_compatible(&b.rounded_up()));
    }

    #[test]
    fn round_up_skips_empty_ranges() {
        let requirements = graphics_requirements(2, 0).rounded_up();

        let pixel = requirements.stage(ShaderVisibility::Pixel);
        assert_eq!(pixel.ranges.num_srvs, DEFAULT_SHADER_RESOURCE_VIEW_COUNT);
        // Ranges nothing asked for stay empty so the signature does not grow
        // tables no pipeline binds.
        assert_eq!(pixel.ranges.num_uavs, 0);
        assert_eq!(
            requirements.stage(ShaderVisibility::Vertex).ranges.num_cbvs,
            0
        );
    }

    #[test]
    fn constants_normalize_into_all_visibility() {
        let requirements = graphics_requirements(0, 12).normalized();

        assert_eq!(
            requirements.stage(ShaderVisibility::All).num_32bit_constants,
            12
        );
        assert_eq!(
            requirements
                .stage(ShaderVisibility::Pixel)
                .num_32bit_constants,
            0
        );
    }

    #[test]
    fn parameter_plan_orders_tables_stage_major() {
        let mut requirements = RootSignatureRequirements::new(RootSignatureKind::Graphics);
        requirements.stage_mut(ShaderVisibility::Vertex).ranges.num_cbvs = 2;
        requirements.stage_mut(ShaderVisibility::Pixel).ranges.num_srvs = 4;
        requirements.stage_mut(ShaderVisibility::Pixel).ranges.num_samplers = 1;
        requirements.stage_mut(ShaderVisibility::All).num_32bit_constants = 8;

        let plan = plan_parameters(&requirements.normalized());

        assert_eq!(plan.tables.len(), 3);
        assert_eq!(
            plan.map
                .table_index(ShaderVisibility::Vertex, ResourceBindingKind::Cbv),
            Some(0)
        );
        assert_eq!(
            plan.map
                .table_index(ShaderVisibility::Pixel, ResourceBindingKind::Srv),
            Some(1)
        );
        assert_eq!(
            plan.map
                .table_index(ShaderVisibility::Pixel, ResourceBindingKind::Sampler),
            Some(2)
        );
        assert_eq!(
            plan.map
                .table_index(ShaderVisibility::Pixel, ResourceBindingKind::Uav),
            None
        );
        assert_eq!(plan.map.constants_index(), Some(3));
        assert_eq!(plan.num_constants, 8);

        // Untouched stages are denied root access; bound stages are not.
        assert!(plan
            .flags
            .contains(dx::RootSignatureFlags::DenyHullShaderAccess));
        assert!(!plan
            .flags
            .contains(dx::RootSignatureFlags::DenyVertexShaderAccess));
        assert!(plan
            .flags
            .contains(dx::RootSignatureFlags::AllowInputAssemblerInputLayout));
    }
}
