//! Model catalog.
//!
//! Every generation model is tagged with the provider that serves it and the
//! pricing group that decides how it is billed. The catalog is built once at
//! startup from configuration and never changes afterwards.

use crate::providers::ProviderKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ── Groups and content types ─────────────────────────────────────

/// Pricing/behavior group of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelGroup {
    /// Cheap, quick models. Free with a caller-supplied key.
    Fast,
    /// Large reasoning models. Flat charge per request.
    Heavy,
    /// Image, audio and other special-purpose models.
    Specialty,
    /// Any group name this build does not know about.
    #[serde(other)]
    Unknown,
}

impl ModelGroup {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Heavy => "heavy",
            Self::Specialty => "specialty",
            Self::Unknown => "unknown",
        }
    }
}

/// Kind of content a request asks for.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    #[default]
    Text,
    Image,
    Audio,
    Video,
}

impl ContentType {
    pub const ALL: &'static [ContentType] = &[
        ContentType::Text,
        ContentType::Image,
        ContentType::Audio,
        ContentType::Video,
    ];

    pub fn id(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

impl std::str::FromStr for ContentType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ContentType::ALL
            .iter()
            .copied()
            .find(|c| c.id() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown content type: {s}"))
    }
}

/// Unit a model is priced in, as shown in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingUnit {
    /// Per thousand input units.
    KiloUnits,
    /// Per request, regardless of size.
    Request,
    /// Per generated image.
    Image,
}

// ── Model ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub provider: ProviderKind,
    pub group: ModelGroup,
    pub pricing_unit: PricingUnit,
}

impl Model {
    fn new(id: &str, provider: ProviderKind, group: ModelGroup, pricing_unit: PricingUnit) -> Self {
        Self {
            id: id.to_string(),
            provider,
            group,
            pricing_unit,
        }
    }
}

/// Catalog entry as served over HTTP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelView<'a> {
    pub id: &'a str,
    pub provider: ProviderKind,
    pub group: ModelGroup,
    pub pricing_unit: PricingUnit,
}

impl<'a> From<&'a Model> for ModelView<'a> {
    fn from(model: &'a Model) -> Self {
        Self {
            id: &model.id,
            provider: model.provider,
            group: model.group,
            pricing_unit: model.pricing_unit,
        }
    }
}

/// Catalog used when the configuration does not list any models.
pub fn default_catalog() -> Vec<Model> {
    use ModelGroup::{Fast, Heavy, Specialty};
    use PricingUnit::{Image, KiloUnits, Request};
    use ProviderKind::{Anthropic, Gemini, OpenAi};

    vec![
        Model::new("gpt-4o-mini", OpenAi, Fast, KiloUnits),
        Model::new("claude-haiku-4-5", Anthropic, Fast, KiloUnits),
        Model::new("gemini-2.5-flash", Gemini, Fast, KiloUnits),
        Model::new("gpt-4.1", OpenAi, Heavy, Request),
        Model::new("claude-opus-4-1", Anthropic, Heavy, Request),
        Model::new("gemini-2.5-pro", Gemini, Heavy, Request),
        Model::new("gpt-image-1", OpenAi, Specialty, Image),
        Model::new("dall-e-3", OpenAi, Specialty, Image),
    ]
}

// ── Registry ─────────────────────────────────────────────────────

/// Immutable lookup table of models by id.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: BTreeMap<String, Model>,
}

impl ModelRegistry {
    /// Build a registry, rejecting duplicate or empty ids.
    pub fn from_models(models: Vec<Model>) -> anyhow::Result<Self> {
        let mut map = BTreeMap::new();
        for model in models {
            if model.id.trim().is_empty() {
                anyhow::bail!("model id must not be empty");
            }
            if map.contains_key(&model.id) {
                anyhow::bail!("duplicate model id in catalog: {}", model.id);
            }
            map.insert(model.id.clone(), model);
        }
        Ok(Self { models: map })
    }

    pub fn lookup(&self, model_id: &str) -> Option<&Model> {
        self.models.get(model_id)
    }

    pub fn group_of(&self, model_id: &str) -> Option<ModelGroup> {
        self.lookup(model_id).map(|m| m.group)
    }

    /// All models, ordered by id.
    pub fn list(&self) -> impl Iterator<Item = &Model> {
        self.models.values()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
