use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One bidder descriptor, parsed from a declarative JSON file. Descriptors
/// are immutable once loaded; mutable pacing state lives next to the agent
/// in the registry, not here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Agent {
    pub account: Vec<String>,
    #[serde(rename = "externalId")]
    pub id: i64,
    #[serde(rename = "bidProbability", default)]
    pub bid_probability: f64,
    #[serde(default)]
    pub creatives: Vec<Creative>,
    /// Exchange-specific provider blobs; forwarded verbatim, never read here.
    #[serde(rename = "providerConfig", default)]
    pub provider_config: Value,
    #[serde(rename = "deviceTypeFilter", default)]
    pub device_type: Option<DeviceTypeFilter>,
    #[serde(rename = "dmaFilter", default)]
    pub dma: Option<DmaFilter>,
    #[serde(rename = "whiteBlackList", default)]
    pub white_black_lists: Option<WhiteBlackLists>,
    #[serde(rename = "augmentations", default)]
    pub augmenters: Option<Augmenters>,
    #[serde(rename = "ext", default)]
    pub params: Option<BidParams>,
}

impl Agent {
    /// Label used in metrics and the configuration sink path.
    pub fn label(&self) -> &str {
        self.account.first().map(String::as_str).unwrap_or("unknown")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Creative {
    pub id: i64,
    #[serde(default)]
    pub width: i64,
    #[serde(default)]
    pub height: i64,
    #[serde(rename = "providerConfig", default)]
    pub provider_config: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceTypeFilter {
    #[serde(default)]
    pub include: Vec<i64>,
    #[serde(default)]
    pub exclude: Vec<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DmaFilter {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WhiteBlackLists {
    #[serde(rename = "whiteFile", default)]
    pub white_file: String,
    #[serde(rename = "blackFile", default)]
    pub black_file: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Augmenters {
    #[serde(default)]
    pub viewability: Option<ViewabilityAugmenter>,
    #[serde(default)]
    pub forensiq: Option<RiskAugmenter>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AugmenterFilters {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ViewabilityAugmenter {
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub filters: AugmenterFilters,
    #[serde(rename = "config", default)]
    pub config: ViewabilityConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ViewabilityConfig {
    // Field name carries a historical typo; it is the on-disk format.
    #[serde(rename = "viewTreshold", default)]
    pub view_threshold: i64,
    #[serde(rename = "unknownStrategy", default)]
    pub unknown_strategy: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskAugmenter {
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub filters: AugmenterFilters,
    #[serde(rename = "config", default)]
    pub config: RiskAugmenterConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskAugmenterConfig {
    /// Bids whose traffic risk score exceeds this threshold are vetoed.
    #[serde(rename = "riskScore", default)]
    pub risk_score: f64,
}

/// Bidding parameters. `budget`, `pace` and `price` are `"<int>USD/1M"`
/// strings; `priority` is an unpadded integer whose decimal width matters
/// for tie-breaking.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BidParams {
    #[serde(default)]
    pub budget: String,
    #[serde(default)]
    pub pace: String,
    #[serde(default)]
    pub price: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub segments: Option<SegmentSpec>,
}

/// Cohort targeting: the bidder only wants users belonging to at least one
/// of these segments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SegmentSpec {
    /// When set, an unknown user fails the filter instead of passing it.
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub ids: Vec<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIPTOR: &str = r#"{
        "account": ["acme_video", "acme"],
        "externalId": 5162210,
        "bidProbability": 1.0,
        "creatives": [{"id": 5162210, "width": 640, "height": 480, "providerConfig": {}}],
        "providerConfig": {"publisher": {"vast": "https://cdn.example/v.xml"}},
        "deviceTypeFilter": {"include": [4, 5]},
        "dmaFilter": {"include": ["618"]},
        "augmentations": {"forensiq": {"required": true, "config": {"riskScore": 65}}},
        "ext": {"budget": "100000USD/1M", "pace": "600000USD/1M", "price": "5000USD/1M", "priority": 1}
    }"#;

    #[test]
    fn descriptor_parses() {
        let agent: Agent = serde_json::from_str(DESCRIPTOR).expect("parse");
        assert_eq!(agent.id, 5162210);
        assert_eq!(agent.label(), "acme_video");
        assert_eq!(agent.creatives[0].id, 5162210);
        assert_eq!(agent.device_type.as_ref().unwrap().include, vec![4, 5]);
        let params = agent.params.as_ref().unwrap();
        assert_eq!(params.price, "5000USD/1M");
        assert_eq!(params.priority, 1);
        let risk = agent.augmenters.unwrap().forensiq.unwrap();
        assert!(risk.required);
        assert_eq!(risk.config.risk_score, 65.0);
    }

    #[test]
    fn missing_sections_default() {
        let agent: Agent =
            serde_json::from_str(r#"{"account": ["a"], "externalId": 7}"#).expect("parse");
        assert!(agent.params.is_none());
        assert!(agent.augmenters.is_none());
        assert!(agent.creatives.is_empty());
    }
}
