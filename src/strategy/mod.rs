//! Strategy resolution: how a request is billed.
//!
//! `resolve` is pure. Given the model's group, whether the caller brought
//! their own key, and the requested content type, it decides whether the
//! request is unlimited or metered and at what rate.
//!
//! The fast group is metered per thousand input units while every other
//! group pays a flat amount per request. The asymmetry is intentional.

use crate::error::ShotCallerError;
use crate::registry::{ContentType, ModelGroup, ModelRegistry};
use serde::Serialize;
use std::collections::BTreeMap;

/// Input units covered by one metered block in the fast group.
pub const UNITS_PER_BLOCK: u64 = 1000;

/// Fast group: blocks per thousand input units when the vault pays.
pub const FAST_BLOCKS_PER_THOUSAND: u64 = 1;

/// Heavy group: flat blocks per request.
pub const HEAVY_BLOCKS_PER_REQUEST: u64 = 2;

/// Specialty group: flat blocks per request unless configured per content type.
pub const SPECIALTY_DEFAULT_BLOCKS: u64 = 1;

/// Unknown group: flat blocks per request.
pub const FALLBACK_BLOCKS_PER_REQUEST: u64 = 1;

/// How blocks are computed from usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Metering {
    Unmetered,
    PerThousandUnits,
    PerRequest,
}

/// Derived billing decision for one request. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingStrategy {
    pub uses_caller_credential: bool,
    pub is_unlimited: bool,
    pub is_metered: bool,
    pub cost_per_unit: u64,
    pub metering: Metering,
}

impl ProcessingStrategy {
    fn unlimited() -> Self {
        Self {
            uses_caller_credential: true,
            is_unlimited: true,
            is_metered: false,
            cost_per_unit: 0,
            metering: Metering::Unmetered,
        }
    }

    fn per_thousand(cost: u64, uses_caller_credential: bool) -> Self {
        Self {
            uses_caller_credential,
            is_unlimited: false,
            is_metered: true,
            cost_per_unit: cost,
            metering: Metering::PerThousandUnits,
        }
    }

    fn flat(cost: u64, uses_caller_credential: bool) -> Self {
        Self {
            uses_caller_credential,
            is_unlimited: false,
            is_metered: true,
            cost_per_unit: cost,
            metering: Metering::PerRequest,
        }
    }

    /// Blocks owed for a request that consumed `units`.
    pub fn blocks_for(&self, units: u64) -> u64 {
        match self.metering {
            Metering::Unmetered => 0,
            Metering::PerThousandUnits => units
                .div_ceil(UNITS_PER_BLOCK)
                .saturating_mul(self.cost_per_unit),
            Metering::PerRequest => self.cost_per_unit,
        }
    }

    /// Blocks a request is expected to cost before it runs.
    pub fn estimate_blocks(&self, estimated_units: u64) -> u64 {
        self.blocks_for(estimated_units)
    }
}

/// Per-content-type cost overrides for the specialty group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PricingTable {
    specialty: BTreeMap<ContentType, u64>,
}

impl PricingTable {
    pub fn new(specialty: BTreeMap<ContentType, u64>) -> Self {
        Self { specialty }
    }

    pub fn specialty_cost(&self, content_type: ContentType) -> u64 {
        self.specialty
            .get(&content_type)
            .copied()
            .unwrap_or(SPECIALTY_DEFAULT_BLOCKS)
    }
}

/// Strategy for a group, without a registry lookup.
pub fn strategy_for_group(
    group: ModelGroup,
    caller_supplies_credential: bool,
    content_type: ContentType,
    pricing: &PricingTable,
) -> ProcessingStrategy {
    match group {
        ModelGroup::Fast if caller_supplies_credential => ProcessingStrategy::unlimited(),
        ModelGroup::Fast => ProcessingStrategy::per_thousand(FAST_BLOCKS_PER_THOUSAND, false),
        ModelGroup::Heavy => {
            ProcessingStrategy::flat(HEAVY_BLOCKS_PER_REQUEST, caller_supplies_credential)
        }
        ModelGroup::Specialty => ProcessingStrategy::flat(
            pricing.specialty_cost(content_type),
            caller_supplies_credential,
        ),
        ModelGroup::Unknown => {
            ProcessingStrategy::flat(FALLBACK_BLOCKS_PER_REQUEST, caller_supplies_credential)
        }
    }
}

/// Resolve the strategy for a model id.
pub fn resolve(
    registry: &ModelRegistry,
    model_id: &str,
    caller_supplies_credential: bool,
    content_type: ContentType,
    pricing: &PricingTable,
) -> Result<ProcessingStrategy, ShotCallerError> {
    let group = registry
        .group_of(model_id)
        .ok_or_else(|| ShotCallerError::UnknownModel(model_id.to_string()))?;
    Ok(strategy_for_group(
        group,
        caller_supplies_credential,
        content_type,
        pricing,
    ))
}
