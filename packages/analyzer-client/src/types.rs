use serde::{Deserialize, Serialize};
use serde_json::Value;
use typed_builder::TypedBuilder;

/// Request body for submitting a document to the analysis worker.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
pub struct AnalyzeRequest {
    pub document_content: String,
    pub document_type: String,
    #[builder(default, setter(strip_option))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<String>,
    #[builder(default, setter(strip_option))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_config: Option<Value>,
    #[builder(default, setter(strip_option))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis_options: Option<Value>,
    pub metadata: DocumentMetadata,
    /// Where the worker should post status callbacks.
    #[builder(default, setter(strip_option))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_config: Option<CallbackConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
pub struct DocumentMetadata {
    pub document_id: String,
    #[builder(default, setter(strip_option))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[builder(default, setter(strip_option))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_date: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackConfig {
    pub callback_url: String,
    pub callback_events: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_secret: Option<String>,
}

/// Worker response to an analyze submission.
#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzeResponse {
    pub analysis_id: String,
    pub status: String,
    #[serde(default)]
    pub results: Option<AnalysisResults>,
    #[serde(default)]
    pub processing_time: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Structured analysis output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResults {
    pub conformity_score: f64,
    pub confidence: f64,
    #[serde(default)]
    pub problems: Vec<Value>,
    #[serde(default)]
    pub recommendations: Vec<Value>,
    #[serde(default)]
    pub metrics: Option<Value>,
    #[serde(default)]
    pub categories: Option<Value>,
    #[serde(default)]
    pub ai_used: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub uptime: Option<f64>,
}
