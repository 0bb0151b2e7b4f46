use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use time::{Date, OffsetDateTime, PrimitiveDateTime, UtcOffset};

use crate::CanvasError;

pub const TEST_HYPOTHESIS_PREFIX: &str = "We believe that ";
pub const TEST_ACTION_PREFIX: &str = "To verify that, we will ";
pub const TEST_METRIC_PREFIX: &str = "And measure ";
pub const TEST_CRITERIA_PREFIX: &str = "We are right if ";
pub const LEARNING_OBSERVATION_PREFIX: &str = "We observed ";
pub const LEARNING_LESSON_PREFIX: &str = "From that we learned that ";

const UNKNOWN_CATEGORY: &str = "Unknown";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    #[default]
    Ideate,
    Invest,
    Pivot,
    Preserve,
    Retire,
    Spinout,
    Transfer,
}

impl ProjectStatus {
    pub const ALL: [Self; 7] = [
        Self::Ideate,
        Self::Invest,
        Self::Pivot,
        Self::Preserve,
        Self::Retire,
        Self::Spinout,
        Self::Transfer,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ideate => "ideate",
            Self::Invest => "invest",
            Self::Pivot => "pivot",
            Self::Preserve => "preserve",
            Self::Retire => "retire",
            Self::Spinout => "spinout",
            Self::Transfer => "transfer",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ideate" => Some(Self::Ideate),
            "invest" => Some(Self::Invest),
            "pivot" => Some(Self::Pivot),
            "preserve" => Some(Self::Preserve),
            "retire" => Some(Self::Retire),
            "spinout" => Some(Self::Spinout),
            "transfer" => Some(Self::Transfer),
            _ => None,
        }
    }
}

impl Display for ProjectStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    #[serde(alias = "project-id", deserialize_with = "de_project_id")]
    pub project_id: i64,
    #[serde(default, deserialize_with = "de_loose_string")]
    pub project_name: String,
    #[serde(default, deserialize_with = "de_loose_string")]
    pub project_description: String,
    #[serde(default, deserialize_with = "de_loose_string")]
    pub sector: String,
    #[serde(default, deserialize_with = "de_loose_string")]
    pub funding_stage: String,
    #[serde(default, deserialize_with = "de_loose_u32")]
    pub team_size: u32,
    #[serde(default, deserialize_with = "de_loose_string")]
    pub project_document: String,
    #[serde(default, deserialize_with = "de_loose_string")]
    pub file_names: String,
    #[serde(default, deserialize_with = "de_loose_string")]
    pub cost_structure: String,
    #[serde(default, deserialize_with = "de_loose_string")]
    pub revenue_potential: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_opt_f64"
    )]
    pub innovation_risk: Option<f64>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_opt_string"
    )]
    pub expected_return: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_opt_status"
    )]
    pub status: Option<ProjectStatus>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_opt_string"
    )]
    pub progress: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "time::serde::rfc3339::option::serialize",
        deserialize_with = "de_opt_timestamp"
    )]
    pub last_updated: Option<OffsetDateTime>,
}

impl Project {
    #[must_use]
    pub fn effective_status(&self) -> ProjectStatus {
        self.status.unwrap_or_default()
    }
}

/// User-entered intake form; the subset of [`Project`] known before any
/// metrics review.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ProjectIntake {
    pub project_name: String,
    pub project_description: String,
    pub sector: String,
    pub funding_stage: String,
    pub team_size: u32,
    pub project_document: String,
    pub cost_structure: String,
    pub revenue_potential: String,
}

impl ProjectIntake {
    /// Validates the intake form before a project is created.
    ///
    /// # Errors
    /// Returns [`CanvasError::Validation`] naming the first required field
    /// that is blank.
    pub fn validate(&self) -> Result<(), CanvasError> {
        for (name, value) in [
            ("project_name", &self.project_name),
            ("project_description", &self.project_description),
            ("sector", &self.sector),
            ("funding_stage", &self.funding_stage),
            ("cost_structure", &self.cost_structure),
            ("revenue_potential", &self.revenue_potential),
        ] {
            if value.trim().is_empty() {
                return Err(CanvasError::Validation(format!(
                    "{name} MUST be provided"
                )));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn into_project(self, project_id: i64, file_names: &[String]) -> Project {
        Project {
            project_id,
            project_name: self.project_name,
            project_description: self.project_description,
            sector: self.sector,
            funding_stage: self.funding_stage,
            team_size: self.team_size,
            project_document: self.project_document,
            file_names: file_names
                .iter()
                .filter(|name| !name.is_empty())
                .cloned()
                .collect::<Vec<_>>()
                .join(", "),
            cost_structure: self.cost_structure,
            revenue_potential: self.revenue_potential,
            innovation_risk: None,
            expected_return: None,
            status: None,
            progress: None,
            last_updated: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum BmcBlock {
    #[serde(rename = "key-partners")]
    KeyPartners,
    #[serde(rename = "key-activities")]
    KeyActivities,
    #[serde(rename = "key-resources")]
    KeyResources,
    #[serde(rename = "value-propositions")]
    ValuePropositions,
    #[serde(rename = "customer-relationships")]
    CustomerRelationships,
    #[serde(rename = "channels")]
    Channels,
    #[serde(rename = "customer-segments")]
    CustomerSegments,
    #[serde(rename = "cost-structure")]
    CostStructure,
    #[serde(rename = "revenue-streams")]
    RevenueStreams,
}

impl BmcBlock {
    pub const ALL: [Self; 9] = [
        Self::KeyPartners,
        Self::KeyActivities,
        Self::KeyResources,
        Self::ValuePropositions,
        Self::CustomerRelationships,
        Self::Channels,
        Self::CustomerSegments,
        Self::CostStructure,
        Self::RevenueStreams,
    ];

    #[must_use]
    pub fn id(self) -> &'static str {
        match self {
            Self::KeyPartners => "key-partners",
            Self::KeyActivities => "key-activities",
            Self::KeyResources => "key-resources",
            Self::ValuePropositions => "value-propositions",
            Self::CustomerRelationships => "customer-relationships",
            Self::Channels => "channels",
            Self::CustomerSegments => "customer-segments",
            Self::CostStructure => "cost-structure",
            Self::RevenueStreams => "revenue-streams",
        }
    }

    #[must_use]
    pub fn title(self) -> &'static str {
        match self {
            Self::KeyPartners => "Key Partners",
            Self::KeyActivities => "Key Activities",
            Self::KeyResources => "Key Resources",
            Self::ValuePropositions => "Value Propositions",
            Self::CustomerRelationships => "Customer Relationships",
            Self::Channels => "Channels",
            Self::CustomerSegments => "Customer Segments",
            Self::CostStructure => "Cost Structure",
            Self::RevenueStreams => "Revenue Streams",
        }
    }

    /// Accepts either the block id (`key-partners`) or its title
    /// (`Key Partners`).
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let trimmed = value.trim();
        Self::ALL
            .into_iter()
            .find(|block| block.id() == trimmed || block.title().eq_ignore_ascii_case(trimmed))
    }
}

impl Display for BmcBlock {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// Business Model Canvas content: every block maps to an ordered item list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BmcCanvas {
    blocks: BTreeMap<BmcBlock, Vec<String>>,
}

impl Default for BmcCanvas {
    fn default() -> Self {
        Self::empty()
    }
}

impl BmcCanvas {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            blocks: BmcBlock::ALL.into_iter().map(|block| (block, Vec::new())).collect(),
        }
    }

    /// Decodes a block-id → items mapping. Unknown keys are ignored and
    /// missing blocks stay empty.
    ///
    /// # Errors
    /// Returns [`CanvasError::Parse`] when the payload is not a JSON object.
    pub fn from_value(value: &Value) -> Result<Self, CanvasError> {
        let Some(object) = value.as_object() else {
            return Err(CanvasError::Parse(
                "canvas payload MUST be a JSON object".to_string(),
            ));
        };

        let mut canvas = Self::empty();
        for (key, raw_items) in object {
            if let Some(block) = BmcBlock::parse(key) {
                canvas.set_items(block, items_from_value(raw_items));
            }
        }
        Ok(canvas)
    }

    #[must_use]
    pub fn items(&self, block: BmcBlock) -> &[String] {
        self.blocks.get(&block).map_or(&[], Vec::as_slice)
    }

    pub fn set_items(&mut self, block: BmcBlock, items: Vec<String>) {
        self.blocks.insert(block, items);
    }

    /// Appends a trimmed item to a block.
    ///
    /// # Errors
    /// Returns [`CanvasError::Validation`] when the item is blank.
    pub fn add_item(&mut self, block: BmcBlock, item: &str) -> Result<(), CanvasError> {
        let trimmed = item.trim();
        if trimmed.is_empty() {
            return Err(CanvasError::Validation(
                "canvas item MUST NOT be blank".to_string(),
            ));
        }
        self.blocks.entry(block).or_default().push(trimmed.to_string());
        Ok(())
    }

    /// Replaces the item at `index` in a block.
    ///
    /// # Errors
    /// Returns [`CanvasError::NotFound`] when the index is out of range.
    pub fn edit_item(&mut self, block: BmcBlock, index: usize, value: &str) -> Result<(), CanvasError> {
        let items = self.blocks.entry(block).or_default();
        let Some(slot) = items.get_mut(index) else {
            return Err(CanvasError::NotFound(format!(
                "{block} has no item at index {index}"
            )));
        };
        *slot = value.to_string();
        Ok(())
    }

    /// Removes and returns the item at `index` in a block.
    ///
    /// # Errors
    /// Returns [`CanvasError::NotFound`] when the index is out of range.
    pub fn remove_item(&mut self, block: BmcBlock, index: usize) -> Result<String, CanvasError> {
        let items = self.blocks.entry(block).or_default();
        if index >= items.len() {
            return Err(CanvasError::NotFound(format!(
                "{block} has no item at index {index}"
            )));
        }
        Ok(items.remove(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = (BmcBlock, &[String])> {
        self.blocks.iter().map(|(block, items)| (*block, items.as_slice()))
    }

    #[must_use]
    pub fn total_items(&self) -> usize {
        self.blocks.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total_items() == 0
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut object = serde_json::Map::new();
        for (block, items) in self.iter() {
            object.insert(
                block.id().to_string(),
                Value::Array(items.iter().cloned().map(Value::String).collect()),
            );
        }
        Value::Object(object)
    }
}

impl Serialize for BmcCanvas {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.blocks.len()))?;
        for (block, items) in &self.blocks {
            map.serialize_entry(block.id(), items)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for BmcCanvas {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(&value).map_err(D::Error::custom)
    }
}

fn items_from_value(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(text) => Some(text.clone()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .collect(),
        // Bulk exports store arrays as JSON-encoded text.
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(inner @ Value::Array(_)) => items_from_value(&inner),
            _ if text.trim().is_empty() => Vec::new(),
            _ => vec![text.clone()],
        },
        _ => Vec::new(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BmcRecord {
    pub project_id: i64,
    pub canvas: BmcCanvas,
    pub approved: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Default)]
pub enum HypothesisOrigin {
    #[default]
    #[serde(rename = "AI Suggested")]
    AiSuggested,
    #[serde(rename = "Human Added")]
    HumanAdded,
}

impl HypothesisOrigin {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AiSuggested => "AI Suggested",
            Self::HumanAdded => "Human Added",
        }
    }

    /// Anything that is not recognisably human-authored is treated as an
    /// AI suggestion.
    #[must_use]
    pub fn parse_lenient(value: &str) -> Self {
        let lowered = value.trim().to_ascii_lowercase();
        if lowered.starts_with("human") {
            Self::HumanAdded
        } else {
            Self::AiSuggested
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(from = "RawHypothesis")]
pub struct Hypothesis {
    pub id: String,
    pub category: String,
    pub hypothesis: String,
    pub risk_weight: u8,
    #[serde(rename = "type")]
    pub origin: HypothesisOrigin,
}

impl Hypothesis {
    #[must_use]
    pub fn human(id: String, category: &str, statement: &str, risk_weight: u8) -> Self {
        Self {
            id,
            category: category.trim().to_string(),
            hypothesis: statement.trim().to_string(),
            risk_weight: risk_weight.min(100),
            origin: HypothesisOrigin::HumanAdded,
        }
    }

    /// The canvas block this hypothesis targets, when its category names one.
    #[must_use]
    pub fn block(&self) -> Option<BmcBlock> {
        BmcBlock::parse(&self.category)
    }
}

/// Fills in ids that imported or generated hypotheses arrived without.
pub fn assign_missing_hypothesis_ids(project_id: i64, hypotheses: &mut [Hypothesis]) {
    for (index, hypothesis) in hypotheses.iter_mut().enumerate() {
        if hypothesis.id.trim().is_empty() {
            hypothesis.id = format!("hypothesis-{project_id}-{index}");
        }
    }
}

#[derive(Deserialize)]
struct RawHypothesis {
    #[serde(default, deserialize_with = "de_loose_string")]
    id: String,
    #[serde(default, alias = "bmcBlock", deserialize_with = "de_loose_string")]
    category: String,
    #[serde(default, alias = "statement", deserialize_with = "de_loose_string")]
    hypothesis: String,
    #[serde(default, alias = "riskWeight", deserialize_with = "de_percent")]
    risk_weight: u8,
    #[serde(default, rename = "type", deserialize_with = "de_loose_string")]
    origin: String,
}

impl From<RawHypothesis> for Hypothesis {
    fn from(raw: RawHypothesis) -> Self {
        Self {
            id: raw.id,
            category: if raw.category.trim().is_empty() {
                UNKNOWN_CATEGORY.to_string()
            } else {
                raw.category
            },
            hypothesis: raw.hypothesis,
            risk_weight: raw.risk_weight,
            origin: HypothesisOrigin::parse_lenient(&raw.origin),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Default)]
#[serde(from = "String", into = "String")]
pub enum ExperimentType {
    #[default]
    Discovery,
    Validation,
}

impl ExperimentType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discovery => "Discovery",
            Self::Validation => "Validation",
        }
    }
}

impl From<String> for ExperimentType {
    fn from(value: String) -> Self {
        if value.trim().eq_ignore_ascii_case("validation") {
            Self::Validation
        } else {
            Self::Discovery
        }
    }
}

impl From<ExperimentType> for String {
    fn from(value: ExperimentType) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Experiment {
    #[serde(default, deserialize_with = "de_loose_string")]
    pub hypothesis: String,
    #[serde(default)]
    pub experiment_type: ExperimentType,
    #[serde(default, deserialize_with = "de_percent")]
    pub ai_confidence: u8,
    #[serde(default, deserialize_with = "de_loose_string")]
    pub experiment_name: String,
    #[serde(default, deserialize_with = "de_loose_string")]
    pub testing_statement: String,
    #[serde(default, deserialize_with = "de_loose_string")]
    pub description: String,
    #[serde(default, deserialize_with = "de_loose_string")]
    pub cost_range: String,
    #[serde(default, deserialize_with = "de_loose_string")]
    pub runtime: String,
    #[serde(default, deserialize_with = "de_loose_string")]
    pub success_metric: String,
    #[serde(default, deserialize_with = "de_loose_string")]
    pub priority: String,
    #[serde(default, deserialize_with = "de_loose_string")]
    pub measurement: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_card: Option<TestCard>,
    #[serde(
        default,
        rename = "learningCard",
        skip_serializing_if = "Option::is_none"
    )]
    pub learning_card: Option<LearningCard>,
}

impl Experiment {
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.learning_card.is_some()
    }

    /// Writes an edited test card back onto the experiment: the framed
    /// statements lose their template prefixes and replace the experiment's
    /// own fields.
    pub fn apply_test_card(&mut self, card: &TestCard) {
        self.experiment_name = card.test_name.trim().to_string();
        self.runtime = card.duration.clone();
        self.hypothesis = strip_first(&card.hypothesis, TEST_HYPOTHESIS_PREFIX);
        self.testing_statement = strip_first(&card.test, TEST_ACTION_PREFIX);
        self.measurement = strip_first(&card.metric, TEST_METRIC_PREFIX);
        self.success_metric = strip_first(&card.criteria, TEST_CRITERIA_PREFIX);
        self.cost_range = card.cost_range.clone();
        self.test_card = Some(card.clone());
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TestCard {
    #[serde(default)]
    pub test_name: String,
    #[serde(default)]
    pub deadline: String,
    #[serde(default)]
    pub assigned_to: String,
    #[serde(default)]
    pub duration: String,
    #[serde(default)]
    pub hypothesis: String,
    #[serde(default)]
    pub test: String,
    #[serde(default)]
    pub metric: String,
    #[serde(default)]
    pub criteria: String,
    #[serde(default)]
    pub cost_range: String,
}

impl TestCard {
    /// Drafts a test card from an experiment, framing each statement with
    /// its template prefix. An existing saved card wins over the draft.
    #[must_use]
    pub fn draft_for(experiment: &Experiment) -> Self {
        if let Some(saved) = &experiment.test_card {
            return saved.clone();
        }
        Self {
            test_name: experiment.experiment_name.clone(),
            deadline: String::new(),
            assigned_to: String::new(),
            duration: experiment.runtime.clone(),
            hypothesis: format!("{TEST_HYPOTHESIS_PREFIX}{}", experiment.hypothesis),
            test: format!("{TEST_ACTION_PREFIX}{}", experiment.testing_statement),
            metric: format!("{TEST_METRIC_PREFIX}{}", experiment.measurement),
            criteria: format!("{TEST_CRITERIA_PREFIX}{}", experiment.success_metric),
            cost_range: experiment.cost_range.clone(),
        }
    }

    /// # Errors
    /// Returns [`CanvasError::Validation`] when the test name is blank.
    pub fn validate(&self) -> Result<(), CanvasError> {
        if self.test_name.trim().is_empty() {
            return Err(CanvasError::Validation(
                "test_name MUST be provided".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Default)]
#[serde(from = "String", into = "String")]
pub enum Insight {
    Support,
    Unclear,
    Refute,
    #[default]
    Undecided,
}

impl Insight {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Support => "support",
            Self::Unclear => "unclear",
            Self::Refute => "refute",
            Self::Undecided => "",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "support" => Some(Self::Support),
            "unclear" => Some(Self::Unclear),
            "refute" => Some(Self::Refute),
            "" => Some(Self::Undecided),
            _ => None,
        }
    }

    /// Only a supporting insight reduces risk.
    #[must_use]
    pub fn reduces_risk(self) -> bool {
        matches!(self, Self::Support)
    }
}

impl From<String> for Insight {
    fn from(value: String) -> Self {
        Self::parse(&value).unwrap_or_default()
    }
}

impl From<Insight> for String {
    fn from(value: Insight) -> Self {
        value.as_str().to_string()
    }
}

/// Stored with the spellings the web app writes: `pivot`, `preserve`,
/// `shelve/kill` and `test again`. Values outside that set are kept verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash, Default)]
#[serde(from = "String", into = "String")]
pub enum Decision {
    #[default]
    Pivot,
    Preserve,
    ShelveKill,
    TestAgain,
    Unrecognized(String),
}

impl Decision {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pivot => "pivot",
            Self::Preserve => "preserve",
            Self::ShelveKill => "shelve/kill",
            Self::TestAgain => "test again",
            Self::Unrecognized(raw) => raw,
        }
    }

    /// Accepts the stored spellings and their hyphenated forms.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pivot" => Some(Self::Pivot),
            "preserve" => Some(Self::Preserve),
            "shelve/kill" | "shelve-kill" => Some(Self::ShelveKill),
            "test again" | "test-again" => Some(Self::TestAgain),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_recognized(&self) -> bool {
        !matches!(self, Self::Unrecognized(_))
    }
}

impl From<String> for Decision {
    fn from(value: String) -> Self {
        if value.trim().is_empty() {
            return Self::default();
        }
        Self::parse(&value).unwrap_or(Self::Unrecognized(value))
    }
}

impl From<Decision> for String {
    fn from(value: Decision) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct LearningCard {
    #[serde(default, deserialize_with = "de_loose_string")]
    pub insight_name: String,
    #[serde(default, deserialize_with = "de_loose_string")]
    pub date_of_learning: String,
    #[serde(default, deserialize_with = "de_loose_string")]
    pub person_responsible: String,
    #[serde(default, deserialize_with = "de_loose_string")]
    pub hypothesis: String,
    #[serde(default, deserialize_with = "de_loose_string")]
    pub observation: String,
    #[serde(default, deserialize_with = "de_loose_string")]
    pub learnings: String,
    #[serde(default)]
    pub decisions: Decision,
    #[serde(default)]
    pub insight: Insight,
    #[serde(default, deserialize_with = "de_percent")]
    pub confidence: u8,
}

impl LearningCard {
    /// Strips the narrative template prefixes and clamps confidence.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.observation = strip_first(&self.observation, LEARNING_OBSERVATION_PREFIX);
        self.learnings = strip_first(&self.learnings, LEARNING_LESSON_PREFIX);
        self.confidence = self.confidence.min(100);
        self
    }

    /// Parses `dateOfLearning`, accepting RFC3339 as well as the
    /// `M/D/YYYY, h:mm:ss AM` form browsers emit. Naive values are read as UTC.
    #[must_use]
    pub fn learned_at(&self) -> Option<OffsetDateTime> {
        parse_learning_date(&self.date_of_learning)
    }
}

fn parse_learning_date(raw: &str) -> Option<OffsetDateTime> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(parsed) =
        OffsetDateTime::parse(trimmed, &time::format_description::well_known::Rfc3339)
    {
        return Some(parsed.to_offset(UtcOffset::UTC));
    }

    for pattern in [
        "[month padding:none]/[day padding:none]/[year], [hour repr:12 padding:none]:[minute]:[second] [period]",
        "[month]/[day]/[year], [hour repr:12]:[minute]:[second] [period]",
        "[year]-[month]-[day] [hour]:[minute]:[second]",
        "[year]-[month]-[day]T[hour]:[minute]:[second]",
    ] {
        let Ok(format) = time::format_description::parse(pattern) else {
            continue;
        };
        if let Ok(parsed) = PrimitiveDateTime::parse(trimmed, &format) {
            return Some(parsed.assume_utc());
        }
    }

    for pattern in ["[year]-[month]-[day]", "[month padding:none]/[day padding:none]/[year]"] {
        let Ok(format) = time::format_description::parse(pattern) else {
            continue;
        };
        if let Ok(date) = Date::parse(trimmed, &format) {
            return Some(date.midnight().assume_utc());
        }
    }

    None
}

fn strip_first(value: &str, prefix: &str) -> String {
    value.replacen(prefix, "", 1).trim().to_string()
}

// Lenient decoders for records written by the browser client and the bulk
// export, where numbers routinely arrive as text and fields may be null.

#[derive(Deserialize)]
#[serde(untagged)]
enum Loose {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    Null,
    Other(Value),
}

impl Loose {
    fn as_f64(&self) -> Option<f64> {
        match self {
            #[allow(clippy::cast_precision_loss)]
            Self::Int(value) => Some(*value as f64),
            Self::Float(value) => Some(*value),
            Self::Text(text) => text.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    fn into_text(self) -> Option<String> {
        match self {
            Self::Int(value) => Some(value.to_string()),
            Self::Float(value) => Some(value.to_string()),
            Self::Bool(value) => Some(value.to_string()),
            Self::Text(text) => Some(text),
            Self::Null => None,
            Self::Other(value) => Some(value.to_string()),
        }
    }
}

pub(crate) fn de_project_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    match Loose::deserialize(deserializer)? {
        Loose::Int(value) => Ok(value),
        #[allow(clippy::cast_possible_truncation)]
        Loose::Float(value) if value.fract() == 0.0 => Ok(value as i64),
        Loose::Text(text) => text
            .trim()
            .trim_matches('"')
            .parse::<i64>()
            .map_err(|_| D::Error::custom(format!("invalid project id: {text}"))),
        _ => Err(D::Error::custom("project id MUST be an integer")),
    }
}

fn de_loose_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Loose::deserialize(deserializer)?
        .into_text()
        .unwrap_or_default())
}

fn de_opt_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(Loose::deserialize(deserializer)?.into_text())
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn de_loose_u32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    let value = Loose::deserialize(deserializer)?.as_f64().unwrap_or(0.0);
    Ok(value.clamp(0.0, f64::from(u32::MAX)) as u32)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn de_percent<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u8, D::Error> {
    let value = Loose::deserialize(deserializer)?.as_f64().unwrap_or(0.0);
    Ok(value.round().clamp(0.0, 100.0) as u8)
}

fn de_opt_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    Ok(Loose::deserialize(deserializer)?.as_f64())
}

fn de_opt_status<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<ProjectStatus>, D::Error> {
    Ok(Loose::deserialize(deserializer)?
        .into_text()
        .and_then(|text| ProjectStatus::parse(text.trim())))
}

fn de_opt_timestamp<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<OffsetDateTime>, D::Error> {
    Ok(Loose::deserialize(deserializer)?
        .into_text()
        .and_then(|text| {
            OffsetDateTime::parse(text.trim(), &time::format_description::well_known::Rfc3339)
                .ok()
        })
        .map(|value| value.to_offset(UtcOffset::UTC)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_experiment() -> Experiment {
        must(serde_json::from_value(json!({
            "hypothesis": "SMBs will pay for automated bookkeeping",
            "experiment_type": "Discovery",
            "ai_confidence": 80,
            "experiment_name": "Customer interviews",
            "testing_statement": "interview 20 owners",
            "description": "Structured interviews",
            "cost_range": "$500-$2,000",
            "runtime": "2 weeks",
            "success_metric": "12 of 20 confirm the pain",
            "priority": "High",
            "measurement": "share of owners confirming"
        })))
    }

    #[test]
    fn intake_validation_names_first_blank_field() {
        let intake = ProjectIntake {
            project_name: "Ledgerly".to_string(),
            project_description: "AI bookkeeping".to_string(),
            sector: " ".to_string(),
            funding_stage: "Seed".to_string(),
            team_size: 4,
            project_document: String::new(),
            cost_structure: "$250,000".to_string(),
            revenue_potential: "$1,500,000".to_string(),
        };

        match intake.validate() {
            Err(CanvasError::Validation(message)) => assert!(message.contains("sector")),
            other => panic!("expected sector validation error, got {other:?}"),
        }
    }

    #[test]
    fn project_decodes_bulk_export_row() {
        let project: Project = must(serde_json::from_value(json!({
            "project-id": "42",
            "project_name": "Ledgerly",
            "project_description": "AI bookkeeping",
            "sector": "Fintech",
            "funding_stage": "Seed",
            "team_size": "4",
            "project_document": "deck.pdf",
            "cost_structure": null,
            "revenue_potential": "$1,500,000",
            "status": "moonshot",
            "progress": 3
        })));

        assert_eq!(project.project_id, 42);
        assert_eq!(project.team_size, 4);
        assert_eq!(project.cost_structure, "");
        assert_eq!(project.status, None);
        assert_eq!(project.progress.as_deref(), Some("3"));
        assert_eq!(project.effective_status(), ProjectStatus::Ideate);
    }

    #[test]
    fn canvas_decodes_ids_titles_and_embedded_arrays() {
        let canvas = must(BmcCanvas::from_value(&json!({
            "key-partners": ["Banks", "Accountants"],
            "Customer Segments": ["SMBs"],
            "channels": "[\"App store\", \"Partners\"]",
            "project-id": "42"
        })));

        assert_eq!(canvas.items(BmcBlock::KeyPartners), ["Banks", "Accountants"]);
        assert_eq!(canvas.items(BmcBlock::CustomerSegments), ["SMBs"]);
        assert_eq!(canvas.items(BmcBlock::Channels), ["App store", "Partners"]);
        assert!(canvas.items(BmcBlock::RevenueStreams).is_empty());
        assert_eq!(canvas.total_items(), 5);
    }

    #[test]
    fn canvas_serializes_all_nine_blocks_in_layout_order() {
        let value = must(serde_json::to_value(BmcCanvas::empty()));
        let keys = match value.as_object() {
            Some(object) => object.keys().cloned().collect::<Vec<_>>(),
            None => panic!("canvas must serialize as an object"),
        };
        let expected = BmcBlock::ALL
            .iter()
            .map(|block| block.id().to_string())
            .collect::<Vec<_>>();
        assert_eq!(keys, expected);
    }

    #[test]
    fn canvas_item_edits_are_index_checked() {
        let mut canvas = BmcCanvas::empty();
        must(canvas.add_item(BmcBlock::Channels, "  Direct sales  "));
        assert!(canvas.add_item(BmcBlock::Channels, "   ").is_err());
        assert_eq!(canvas.items(BmcBlock::Channels), ["Direct sales"]);

        must(canvas.edit_item(BmcBlock::Channels, 0, "Inside sales"));
        assert!(canvas.edit_item(BmcBlock::Channels, 3, "x").is_err());
        assert!(matches!(
            canvas.remove_item(BmcBlock::Channels, 1),
            Err(CanvasError::NotFound(_))
        ));
        assert_eq!(must(canvas.remove_item(BmcBlock::Channels, 0)), "Inside sales");
        assert!(canvas.is_empty());
    }

    #[test]
    fn hypothesis_accepts_legacy_aliases() {
        let mut hypotheses: Vec<Hypothesis> = must(serde_json::from_value(json!([
            {"bmcBlock": "Channels", "statement": "Partners resell", "riskWeight": "35"},
            {"id": "h-2", "category": "", "hypothesis": "x", "risk_weight": 140, "type": "Human Added"}
        ])));
        assign_missing_hypothesis_ids(7, &mut hypotheses);

        assert_eq!(hypotheses[0].id, "hypothesis-7-0");
        assert_eq!(hypotheses[0].category, "Channels");
        assert_eq!(hypotheses[0].risk_weight, 35);
        assert_eq!(hypotheses[0].origin, HypothesisOrigin::AiSuggested);
        assert_eq!(hypotheses[0].block(), Some(BmcBlock::Channels));

        assert_eq!(hypotheses[1].id, "h-2");
        assert_eq!(hypotheses[1].category, "Unknown");
        assert_eq!(hypotheses[1].risk_weight, 100);
        assert_eq!(hypotheses[1].origin, HypothesisOrigin::HumanAdded);
    }

    #[test]
    fn hypothesis_serializes_origin_under_type_key() {
        let value = must(serde_json::to_value(Hypothesis::human(
            "h-1".to_string(),
            "Channels",
            "Partners resell",
            20,
        )));
        assert_eq!(value["type"], json!("Human Added"));
        assert_eq!(value["risk_weight"], json!(20));
    }

    #[test]
    fn test_card_round_trips_through_experiment_fields() {
        let mut experiment = fixture_experiment();
        let mut card = TestCard::draft_for(&experiment);
        assert_eq!(
            card.hypothesis,
            "We believe that SMBs will pay for automated bookkeeping"
        );
        assert_eq!(card.test, "To verify that, we will interview 20 owners");

        card.criteria = "We are right if 15 of 20 confirm the pain".to_string();
        card.duration = "3 weeks".to_string();
        experiment.apply_test_card(&card);

        assert_eq!(experiment.success_metric, "15 of 20 confirm the pain");
        assert_eq!(experiment.hypothesis, "SMBs will pay for automated bookkeeping");
        assert_eq!(experiment.runtime, "3 weeks");
        assert_eq!(experiment.test_card.as_ref(), Some(&card));
        assert_eq!(TestCard::draft_for(&experiment), card);
    }

    #[test]
    fn learning_card_uses_camel_case_and_string_enums() {
        let card: LearningCard = must(serde_json::from_value(json!({
            "insightName": "Interviews",
            "dateOfLearning": "9/14/2025, 10:30:00 AM",
            "insight": "support",
            "confidence": 70,
            "decisions": "test again",
            "observation": "We observed strong pull",
            "learnings": "From that we learned that owners hate spreadsheets"
        })));
        let card = card.normalized();

        assert_eq!(card.insight, Insight::Support);
        assert_eq!(card.decisions, Decision::TestAgain);
        assert_eq!(card.observation, "strong pull");
        assert_eq!(card.learnings, "owners hate spreadsheets");

        let value = must(serde_json::to_value(&card));
        assert_eq!(value["dateOfLearning"], json!("9/14/2025, 10:30:00 AM"));
        assert_eq!(value["decisions"], json!("test again"));
    }

    #[test]
    fn decisions_accept_stored_and_hyphenated_spellings() {
        for (raw, expected) in [
            ("shelve/kill", Decision::ShelveKill),
            ("shelve-kill", Decision::ShelveKill),
            ("test again", Decision::TestAgain),
            ("test-again", Decision::TestAgain),
            ("Preserve", Decision::Preserve),
            ("", Decision::Pivot),
        ] {
            let card: LearningCard = must(serde_json::from_value(json!({ "decisions": raw })));
            assert_eq!(card.decisions, expected, "decoding {raw:?}");
        }

        let card: LearningCard = must(serde_json::from_value(json!({ "decisions": "escalate" })));
        assert_eq!(card.decisions, Decision::Unrecognized("escalate".to_string()));
        assert!(!card.decisions.is_recognized());
        let value = must(serde_json::to_value(&card));
        assert_eq!(value["decisions"], json!("escalate"));
        assert_eq!(Decision::ShelveKill.as_str(), "shelve/kill");
    }

    #[test]
    fn learning_dates_accept_rfc3339_and_browser_locale() {
        let locale = LearningCard {
            date_of_learning: "9/14/2025, 10:30:00 AM".to_string(),
            ..LearningCard::default()
        };
        let iso = LearningCard {
            date_of_learning: "2025-09-14T10:30:00Z".to_string(),
            ..LearningCard::default()
        };
        let junk = LearningCard {
            date_of_learning: "last tuesday".to_string(),
            ..LearningCard::default()
        };

        assert!(locale.learned_at().is_some());
        assert_eq!(locale.learned_at(), iso.learned_at());
        assert_eq!(junk.learned_at(), None);
    }

    #[test]
    fn unknown_insight_text_reads_as_undecided() {
        assert_eq!(Insight::from("maybe".to_string()), Insight::Undecided);
        assert!(!Insight::Unclear.reduces_risk());
        assert!(Insight::Support.reduces_risk());
    }
}
